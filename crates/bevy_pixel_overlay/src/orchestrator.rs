//! Per-frame overlay cycle.
//!
//! ```text
//! Idle -> Partitioning -> Rendering -> Snapping -> Compositing -> Submitted
//!                                                                    |
//! Idle <--------------------------- Restoring <----------------------+
//! ```
//!
//! Bevy renders the cycle's cameras at the end of the frame, so a cycle rests
//! in `Submitted` until [`FrameOrchestrator::finish_frame`] restores the
//! tracked entities at the start of the next one. Any failure aborts the
//! cycle: entities go back to standby, cameras are deactivated, buffers are
//! marked stale and the next frame starts over.

use std::collections::HashMap;
use std::time::Duration;

use bevy::prelude::*;

use crate::buffers::{DEFAULT_DEPTH_FORMAT, FrameBuffer, FrameBufferManager};
use crate::camera_pool::OffscreenCameraPool;
use crate::composite::{BlendMode, CompositeBackend, CompositeStep, Compositor, OverlayBlendMaterial};
use crate::config::PixelOverlayConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::groups::{RenderGroupId, RenderGroupRegistry};
use crate::partition::set_group;
use crate::snap::{GridResolution, SnapPolicy, ViewProjector, publish_anchor, snap, write_world_position};

/// Where the current cycle is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FramePhase {
  #[default]
  Idle,
  Partitioning,
  Rendering,
  Snapping,
  Compositing,
  /// Cameras and blits are queued; Bevy renders them at the end of the frame.
  Submitted,
  Restoring,
}

/// Marks an entity (and its subtree) for the overlay.
///
/// The plugin tracks entities when this component is added and untracks them
/// when it is removed.
#[derive(Component, Clone, Debug, Default)]
pub struct OverlayTarget {
  /// Render group to isolate into; the configured isolation group if `None`.
  pub group: Option<String>,
  /// Material receiving the snapped anchor and drawing its group's pass.
  /// The first registered material in a group wins.
  pub material: Option<Handle<OverlayBlendMaterial>>,
  /// Snap write-back; the configured policy if `None`.
  pub snap: Option<SnapPolicy>,
  /// Skip snapping altogether.
  pub unsnapped: bool,
}

impl OverlayTarget {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn in_group(mut self, group: impl Into<String>) -> Self {
    self.group = Some(group.into());
    self
  }

  pub fn with_material(mut self, material: Handle<OverlayBlendMaterial>) -> Self {
    self.material = Some(material);
    self
  }

  pub fn with_snap(mut self, policy: SnapPolicy) -> Self {
    self.snap = Some(policy);
    self.unsnapped = false;
    self
  }

  pub fn without_snapping(mut self) -> Self {
    self.unsnapped = true;
    self
  }
}

/// An entity the orchestrator isolates every cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedEntity {
  pub entity: Entity,
  pub group: RenderGroupId,
  pub material: Option<Handle<OverlayBlendMaterial>>,
  /// Policy chosen for this entity; the configured one if `None`.
  pub snap: Option<SnapPolicy>,
  pub snapping: bool,
}

impl TrackedEntity {
  /// Policy snapping uses for this entity, `None` when it is not snapped.
  pub fn snap_policy(&self, default: SnapPolicy) -> Option<SnapPolicy> {
    self.snapping.then(|| self.snap.unwrap_or(default))
  }
}

/// Cycle counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameStats {
  pub completed: u64,
  pub aborted: u64,
  pub last_error: Option<OverlayError>,
}

/// Drives partitioning, rendering, snapping and compositing each frame.
#[derive(Resource)]
pub struct FrameOrchestrator {
  config: PixelOverlayConfig,
  registry: RenderGroupRegistry,
  pool: OffscreenCameraPool,
  buffers: FrameBufferManager,
  compositor: Compositor,
  isolation: RenderGroupId,
  standby: RenderGroupId,
  tracked: Vec<TrackedEntity>,
  explicit_steps: Option<Vec<CompositeStep>>,
  /// Per isolation camera, keyed by tag.
  default_materials: HashMap<String, Handle<OverlayBlendMaterial>>,
  viewport: UVec2,
  pending_fixed_ticks: u32,
  simulated: Duration,
  phase: FramePhase,
  stats: FrameStats,
  output: Option<FrameBuffer>,
}

impl FrameOrchestrator {
  /// Builds an orchestrator around the injected primary camera.
  ///
  /// Fails on configuration errors, all of which are fatal.
  pub fn new(
    config: PixelOverlayConfig,
    primary: Entity,
    backend: CompositeBackend,
  ) -> OverlayResult<Self> {
    config.validate()?;
    let registry = RenderGroupRegistry::from_config(&config)?;
    let isolation = registry.resolve(&config.isolation_group)?;
    let standby = registry.resolve(&config.standby_group)?;
    let compositor = Compositor::new(backend).with_present(config.present);

    Ok(Self {
      config,
      registry,
      pool: OffscreenCameraPool::new(primary),
      buffers: FrameBufferManager::new(),
      compositor,
      isolation,
      standby,
      tracked: Vec::new(),
      explicit_steps: None,
      default_materials: HashMap::new(),
      viewport: UVec2::ZERO,
      pending_fixed_ticks: 0,
      simulated: Duration::ZERO,
      phase: FramePhase::Idle,
      stats: FrameStats::default(),
      output: None,
    })
  }

  pub fn config(&self) -> &PixelOverlayConfig {
    &self.config
  }

  pub fn registry(&self) -> &RenderGroupRegistry {
    &self.registry
  }

  pub fn pool(&self) -> &OffscreenCameraPool {
    &self.pool
  }

  pub fn buffers(&self) -> &FrameBufferManager {
    &self.buffers
  }

  pub fn compositor(&self) -> &Compositor {
    &self.compositor
  }

  pub fn phase(&self) -> FramePhase {
    self.phase
  }

  pub fn stats(&self) -> &FrameStats {
    &self.stats
  }

  pub fn tracked(&self) -> &[TrackedEntity] {
    &self.tracked
  }

  /// Buffer the last completed composite wrote to.
  pub fn output(&self) -> Option<&FrameBuffer> {
    self.output.as_ref()
  }

  pub fn viewport(&self) -> UVec2 {
    self.viewport
  }

  /// Viewport size in physical pixels; buffers follow it lazily.
  pub fn set_viewport(&mut self, viewport: UVec2) {
    self.viewport = viewport;
  }

  /// Groups the main view must not render: standby and every isolation
  /// group.
  pub fn excluded_groups(&self) -> Vec<RenderGroupId> {
    let mut groups = vec![self.isolation, self.standby];
    for camera in &self.config.isolation_cameras {
      if let Ok(group) = self.registry.resolve(&camera.group) {
        if !groups.contains(&group) {
          groups.push(group);
        }
      }
    }
    groups
  }

  /// Snapping grid for the current viewport.
  pub fn grid(&self) -> OverlayResult<GridResolution> {
    match self.config.grid {
      Some([width, height]) => GridResolution::new(width, height),
      None => Ok(GridResolution::from_box_size(self.viewport, self.config.box_size)),
    }
  }

  /// Applies a changed configuration.
  ///
  /// Box size, grid, snap policy, depth awareness and presentation change
  /// live. Groups, cameras and buffer names need a restart.
  pub fn reconfigure(&mut self, world: &mut World, config: PixelOverlayConfig) -> OverlayResult<()> {
    config.validate()?;
    let old = &self.config;
    if config.groups != old.groups
      || config.isolation_cameras != old.isolation_cameras
      || config.isolation_group != old.isolation_group
      || config.standby_group != old.standby_group
      || config.overlay_buffer != old.overlay_buffer
    {
      return Err(OverlayError::InvalidConfig(
        "groups, cameras and buffer names cannot change at runtime".into(),
      ));
    }

    if config.present != old.present {
      let backend = self.compositor.backend();
      self.compositor.release(world);
      self.compositor = Compositor::new(backend).with_present(config.present);
    }
    if let Some(mut materials) = world.get_resource_mut::<Assets<OverlayBlendMaterial>>() {
      for handle in self.default_materials.values() {
        if let Some(material) = materials.get_mut(handle) {
          material.set_mode(default_blend_mode(&config));
        }
      }
    }

    info!(
      "Pixel overlay reconfigured: box size {}, {:?}",
      config.box_size, config.snap_policy
    );
    self.config = config;
    Ok(())
  }

  /// Starts isolating `entity` and its subtree.
  ///
  /// Tracking an entity twice replaces its settings. The entity rests in the
  /// standby group between cycles.
  pub fn track(&mut self, world: &mut World, entity: Entity, target: &OverlayTarget) -> OverlayResult<()> {
    let group = match &target.group {
      Some(name) => self.registry.resolve(name)?,
      None => self.isolation,
    };
    set_group(world, entity, self.standby)?;

    if target.material.is_some()
      && self
        .tracked
        .iter()
        .any(|t| t.entity != entity && t.group == group && t.material.is_some())
    {
      warn!(
        "{} already has a blend material; {} is drawn with the first one registered",
        group, entity
      );
    }

    let tracked = TrackedEntity {
      entity,
      group,
      material: target.material.clone(),
      snap: target.snap,
      snapping: !target.unsnapped,
    };
    match self.tracked.iter_mut().find(|t| t.entity == entity) {
      Some(existing) => *existing = tracked,
      None => self.tracked.push(tracked),
    }
    debug!("Tracking {} in {}", entity, group);
    Ok(())
  }

  /// Stops isolating `entity` and moves it back to the default group.
  ///
  /// Returns false if it was not tracked.
  pub fn untrack(&mut self, world: &mut World, entity: Entity) -> bool {
    let Some(index) = self.tracked.iter().position(|t| t.entity == entity) else {
      return false;
    };
    self.tracked.remove(index);
    if world.get_entity(entity).is_ok() {
      if let Err(err) = set_group(world, entity, RenderGroupId::DEFAULT) {
        warn!("Failed to degroup {}: {}", entity, err);
      }
    }
    true
  }

  /// Replaces the derived composite plan.
  pub fn set_steps(&mut self, steps: Vec<CompositeStep>) {
    self.explicit_steps = Some(steps);
  }

  /// Goes back to the derived composite plan.
  pub fn clear_steps(&mut self) {
    self.explicit_steps = None;
  }

  /// Fixed-rate hook. Transform snapping applies on the next cycle.
  pub fn tick(&mut self, delta: Duration) {
    self.pending_fixed_ticks = self.pending_fixed_ticks.saturating_add(1);
    self.simulated += delta;
  }

  /// Total simulated time seen through [`Self::tick`].
  pub fn simulated(&self) -> Duration {
    self.simulated
  }

  /// Runs a cycle up to submission.
  ///
  /// A cycle still resting in `Submitted` is finished first. Skipped while
  /// the viewport is empty (minimized window).
  pub fn render_tick(&mut self, world: &mut World) {
    if self.phase == FramePhase::Submitted {
      self.finish_frame(world);
    }
    if self.viewport.x == 0 || self.viewport.y == 0 {
      return;
    }

    match self.cycle(world) {
      Ok(output) => {
        self.output = Some(output);
        self.phase = FramePhase::Submitted;
      }
      Err(err) => self.abort(world, err),
    }
  }

  /// Restores tracked entities after the submitted cycle has rendered.
  pub fn finish_frame(&mut self, world: &mut World) {
    if self.phase != FramePhase::Submitted {
      return;
    }
    self.phase = FramePhase::Restoring;
    if let Err(err) = self.restore(world) {
      self.abort(world, err);
      return;
    }
    self.pool.deactivate_all(world);
    self.compositor.deactivate(world);
    self.stats.completed += 1;
    self.phase = FramePhase::Idle;
  }

  /// Runs a whole cycle, restoration included.
  pub fn run_frame(&mut self, world: &mut World) {
    self.render_tick(world);
    self.finish_frame(world);
  }

  /// Degroups every tracked entity and releases cameras, blits and buffers.
  pub fn shutdown(&mut self, world: &mut World) {
    for tracked in std::mem::take(&mut self.tracked) {
      if world.get_entity(tracked.entity).is_ok() {
        if let Err(err) = set_group(world, tracked.entity, RenderGroupId::DEFAULT) {
          warn!("Failed to degroup {}: {}", tracked.entity, err);
        }
      }
    }
    self.pool.release_all(world);
    self.compositor.release(world);
    if let Some(mut images) = world.get_resource_mut::<Assets<Image>>() {
      self.buffers.release_all(&mut images);
    }
    if let Some(mut materials) = world.get_resource_mut::<Assets<OverlayBlendMaterial>>() {
      for (_, handle) in self.default_materials.drain() {
        materials.remove(&handle);
      }
    }
    self.output = None;
    self.phase = FramePhase::Idle;
    info!("Pixel overlay shut down");
  }

  fn cycle(&mut self, world: &mut World) -> OverlayResult<FrameBuffer> {
    self.prune_despawned(world);

    self.phase = FramePhase::Partitioning;
    self.pool.begin_frame(world);
    for tracked in &self.tracked {
      set_group(world, tracked.entity, tracked.group)?;
    }

    self.phase = FramePhase::Rendering;
    self.render_isolation_cameras(world)?;

    self.phase = FramePhase::Snapping;
    self.snap_tracked(world)?;

    self.phase = FramePhase::Compositing;
    let steps = match &self.explicit_steps {
      Some(steps) => steps.clone(),
      None => self.derive_steps(world)?,
    };
    self.compositor.composite(world, &self.buffers, &steps)
  }

  fn render_isolation_cameras(&mut self, world: &mut World) -> OverlayResult<()> {
    let depth_format = self.config.depth_aware.then_some(DEFAULT_DEPTH_FORMAT);
    let UVec2 { x: width, y: height } = self.viewport;

    for camera in &self.config.isolation_cameras {
      let group = self.registry.resolve(&camera.group)?;
      let entity = self.pool.acquire(
        world,
        &camera.tag,
        camera.display_index,
        self.registry.mask_of(group),
      )?;
      let buffer = {
        let Some(mut images) = world.get_resource_mut::<Assets<Image>>() else {
          return Err(OverlayError::AllocationFailure {
            key: camera.tag.clone(),
            reason: "image assets are unavailable".into(),
          });
        };
        self
          .buffers
          .get_or_create(&mut images, &camera.tag, width, height, depth_format)?
      };
      self.pool.render(world, entity, &buffer)?;
    }

    let Some(mut images) = world.get_resource_mut::<Assets<Image>>() else {
      return Err(OverlayError::AllocationFailure {
        key: self.config.overlay_buffer.clone(),
        reason: "image assets are unavailable".into(),
      });
    };
    self.buffers.get_or_create(
      &mut images,
      &self.config.overlay_buffer,
      width,
      height,
      depth_format,
    )?;
    Ok(())
  }

  fn snap_tracked(&mut self, world: &mut World) -> OverlayResult<()> {
    if self.tracked.iter().all(|t| !t.snapping) {
      return Ok(());
    }

    let grid = self.grid()?;
    let projector = self.projector(world)?;

    // Transforms are simulation state: only move them at the fixed rate
    let move_transforms = self.pending_fixed_ticks > 0;

    for tracked in &self.tracked {
      let Some(policy) = tracked.snap_policy(self.config.snap_policy) else {
        continue;
      };
      let Some(position) = world
        .get::<GlobalTransform>(tracked.entity)
        .map(GlobalTransform::translation)
      else {
        return Err(OverlayError::MissingEntity(format!("{}", tracked.entity)));
      };
      let Some(snapped) = snap(position, &projector, grid.width, grid.height)? else {
        continue;
      };

      if policy == SnapPolicy::MutateTransform && move_transforms {
        write_world_position(world, tracked.entity, snapped.world)?;
      }
      if let Some(handle) = &tracked.material {
        if let Some(mut materials) = world.get_resource_mut::<Assets<OverlayBlendMaterial>>() {
          if let Some(material) = materials.get_mut(handle) {
            publish_anchor(material, &snapped, grid, self.config.box_size);
          }
        }
      }
    }

    if move_transforms {
      self.pending_fixed_ticks = 0;
    }
    Ok(())
  }

  fn projector(&self, world: &World) -> OverlayResult<ViewProjector> {
    let primary = self.pool.primary();
    let (Some(camera_transform), Some(projection)) = (
      world.get::<GlobalTransform>(primary),
      world.get::<Projection>(primary),
    ) else {
      return Err(OverlayError::MissingPrimaryCamera);
    };
    Ok(ViewProjector::from_projection(
      camera_transform,
      projection,
      self.viewport.as_vec2(),
    ))
  }

  /// View distance of the nearest tracked entity in `group`, or `f32::MAX`
  /// when none can be projected.
  fn nearest_depth(&self, world: &World, projector: Option<&ViewProjector>, group: RenderGroupId) -> f32 {
    let Some(projector) = projector else {
      return f32::MAX;
    };
    self
      .tracked
      .iter()
      .filter(|t| t.group == group)
      .filter_map(|t| world.get::<GlobalTransform>(t.entity))
      .filter_map(|global| projector.world_to_viewport(global.translation()))
      .map(|viewport| viewport.z)
      .filter(|depth| depth.is_finite())
      .fold(f32::MAX, f32::min)
  }

  /// One step per isolation camera, in configured order, so each buffer is
  /// blended exactly once. The step uses the first material registered for
  /// the camera's group, or the camera's own default material carrying the
  /// group's nearest depth.
  fn derive_steps(&mut self, world: &mut World) -> OverlayResult<Vec<CompositeStep>> {
    let overlay = self.config.overlay_buffer.clone();
    let cameras = self
      .config
      .isolation_cameras
      .iter()
      .map(|camera| Ok((camera.tag.clone(), self.registry.resolve(&camera.group)?)))
      .collect::<OverlayResult<Vec<_>>>()?;

    let projector = self.projector(world).ok();

    let mut steps = Vec::with_capacity(cameras.len());
    for (tag, group) in cameras {
      let tracked_material = self
        .tracked
        .iter()
        .filter(|t| t.group == group)
        .find_map(|t| t.material.clone());

      let material = match tracked_material {
        Some(material) => material,
        None => {
          let depth = self.nearest_depth(world, projector.as_ref(), group);
          self.default_material(world, &tag, depth)?
        }
      };
      steps.push(CompositeStep::new(tag, overlay.clone(), material));
    }

    Ok(steps)
  }

  /// Default material of camera `tag`, its anchor depth set to `depth`.
  fn default_material(
    &mut self,
    world: &mut World,
    tag: &str,
    depth: f32,
  ) -> OverlayResult<Handle<OverlayBlendMaterial>> {
    let Some(mut materials) = world.get_resource_mut::<Assets<OverlayBlendMaterial>>() else {
      return Err(OverlayError::InvalidCompositeStep(
        "blend materials are unavailable".into(),
      ));
    };

    let handle = match self.default_materials.get(tag) {
      Some(handle) => handle.clone(),
      None => {
        let handle = materials.add(OverlayBlendMaterial::new(default_blend_mode(&self.config)));
        self.default_materials.insert(tag.to_string(), handle.clone());
        handle
      }
    };
    let stale = materials
      .get(&handle)
      .is_some_and(|material| material.anchor_depth() != depth);
    if stale {
      if let Some(material) = materials.get_mut(&handle) {
        material.uniforms.anchor.z = depth;
      }
    }
    Ok(handle)
  }

  fn restore(&mut self, world: &mut World) -> OverlayResult<()> {
    for tracked in &self.tracked {
      set_group(world, tracked.entity, self.standby)?;
    }
    Ok(())
  }

  fn prune_despawned(&mut self, world: &World) {
    self.tracked.retain(|tracked| {
      let alive = world.get_entity(tracked.entity).is_ok();
      if !alive {
        debug!("Dropping despawned overlay target {}", tracked.entity);
      }
      alive
    });
  }

  fn abort(&mut self, world: &mut World, err: OverlayError) {
    warn!("Pixel overlay cycle aborted during {:?}: {}", self.phase, err);

    // Best effort: entities that cannot be restored stay where they are
    for tracked in &self.tracked {
      if world.get_entity(tracked.entity).is_ok() {
        if let Err(restore_err) = set_group(world, tracked.entity, self.standby) {
          debug!("Could not restore {}: {}", tracked.entity, restore_err);
        }
      }
    }
    self.pool.deactivate_all(world);
    self.compositor.deactivate(world);
    self.buffers.invalidate_all();

    self.stats.aborted += 1;
    self.stats.last_error = Some(err);
    self.phase = FramePhase::Idle;
  }
}

fn default_blend_mode(config: &PixelOverlayConfig) -> BlendMode {
  if config.depth_aware {
    BlendMode::DepthNearer
  } else {
    BlendMode::AlphaOver
  }
}
