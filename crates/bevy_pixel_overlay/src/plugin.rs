//! Bevy wiring for the overlay pipeline.

use bevy::ecs::message::MessageReader;
use bevy::prelude::*;
use bevy::transform::TransformSystems;
use bevy::window::PrimaryWindow;

use crate::composite::{self, CompositeBackend, OverlayBlendMaterial};
use crate::config::PixelOverlayConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::orchestrator::{FrameOrchestrator, OverlayTarget};

/// Marks the camera the overlay clones and draws over.
///
/// Picked up once at setup; the camera stops rendering isolated entities.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct OverlayPrimaryCamera;

/// Present when setup hit a configuration error. The overlay stays off.
#[derive(Resource, Clone, Debug)]
pub struct PixelOverlaySetupFailed(pub OverlayError);

/// Backend chosen when the plugin was built.
#[derive(Resource, Clone, Copy, Debug)]
pub struct OverlayBackend(pub CompositeBackend);

/// System set for the overlay frame cycle.
///
/// Runs in `PostUpdate` after `TransformSystems::Propagate`. Schedule camera
/// and target movement **before** this set.
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PixelOverlaySet;

/// Target changes seen since the last cycle.
#[derive(Resource, Default)]
struct PendingTargets {
  changed: Vec<(Entity, OverlayTarget)>,
  removed: Vec<Entity>,
}

/// Plugin for the pixel-art overlay.
///
/// Add after `DefaultPlugins`. Mark the main camera with
/// [`OverlayPrimaryCamera`] and entities with [`OverlayTarget`]. Without a
/// `RenderPlugin` the CPU compositor is used.
#[derive(Default)]
pub struct PixelOverlayPlugin {
  pub config: PixelOverlayConfig,
  /// Overrides the backend picked from the presence of a renderer.
  pub backend: Option<CompositeBackend>,
}

impl PixelOverlayPlugin {
  pub fn new(config: PixelOverlayConfig) -> Self {
    Self {
      config,
      backend: None,
    }
  }

  pub fn with_backend(mut self, backend: CompositeBackend) -> Self {
    self.backend = Some(backend);
    self
  }
}

impl Plugin for PixelOverlayPlugin {
  fn build(&self, app: &mut App) {
    let rendering = app.is_plugin_added::<bevy::render::RenderPlugin>();
    if rendering {
      composite::add_render_support(app);
    } else {
      app.init_asset::<OverlayBlendMaterial>();
    }

    let backend = match (self.backend, rendering) {
      (Some(backend), _) => backend,
      (None, true) => CompositeBackend::Gpu,
      (None, false) => CompositeBackend::Cpu,
    };
    if backend == CompositeBackend::Gpu && !rendering {
      warn!("GPU overlay backend requested without a RenderPlugin, using CPU");
    }
    let backend = if rendering { backend } else { CompositeBackend::Cpu };

    app.insert_resource(self.config.clone());
    app.insert_resource(OverlayBackend(backend));
    app.init_resource::<PendingTargets>();

    app.configure_sets(
      PostUpdate,
      PixelOverlaySet.after(TransformSystems::Propagate),
    );

    // Waits in Update until a primary camera exists
    app.add_systems(Update, setup_overlay.run_if(not(overlay_started)));

    app.add_systems(
      First,
      finish_overlay_frame.run_if(resource_exists::<FrameOrchestrator>),
    );
    app.add_systems(
      FixedUpdate,
      tick_overlay.run_if(resource_exists::<FrameOrchestrator>),
    );
    app.add_systems(
      PostUpdate,
      (
        sync_viewport,
        (collect_changed_targets, collect_removed_targets),
        run_overlay_frame,
      )
        .chain()
        .in_set(PixelOverlaySet)
        .run_if(resource_exists::<FrameOrchestrator>),
    );
    app.add_systems(
      Last,
      shutdown_on_exit.run_if(resource_exists::<FrameOrchestrator>),
    );
  }
}

/// Run condition: setup already succeeded or failed.
fn overlay_started(
  orchestrator: Option<Res<FrameOrchestrator>>,
  failed: Option<Res<PixelOverlaySetupFailed>>,
) -> bool {
  orchestrator.is_some() || failed.is_some()
}

fn setup_overlay(world: &mut World) {
  let mut cameras = world.query_filtered::<Entity, With<OverlayPrimaryCamera>>();
  let Some(primary) = cameras.iter(world).next() else {
    return;
  };
  let config = world
    .get_resource::<PixelOverlayConfig>()
    .cloned()
    .unwrap_or_default();
  let backend = world
    .get_resource::<OverlayBackend>()
    .map(|backend| backend.0)
    .unwrap_or(CompositeBackend::Cpu);

  match start_overlay(world, config, primary, backend) {
    Ok(orchestrator) => {
      info!(
        "Pixel overlay started on {} ({:?} backend, {} groups)",
        primary,
        backend,
        orchestrator.registry().len()
      );
      world.insert_resource(orchestrator);
    }
    Err(err) => {
      error!("Pixel overlay disabled: {}", err);
      world.insert_resource(PixelOverlaySetupFailed(err));
    }
  }
}

fn start_overlay(
  world: &mut World,
  config: PixelOverlayConfig,
  primary: Entity,
  backend: CompositeBackend,
) -> OverlayResult<FrameOrchestrator> {
  if world.get::<Camera>(primary).is_none() {
    return Err(OverlayError::MissingPrimaryCamera);
  }
  let orchestrator = FrameOrchestrator::new(config, primary, backend)?;

  // The main view never sees isolated or parked entities
  orchestrator.pool().exclude_groups(
    world,
    primary,
    orchestrator.registry(),
    orchestrator.excluded_groups(),
  )?;
  Ok(orchestrator)
}

fn sync_viewport(
  windows: Query<&Window, With<PrimaryWindow>>,
  mut orchestrator: ResMut<FrameOrchestrator>,
) {
  let Ok(window) = windows.single() else {
    return;
  };
  let size = UVec2::new(window.physical_width(), window.physical_height());
  if orchestrator.viewport() != size {
    debug!("Overlay viewport {}x{}", size.x, size.y);
    orchestrator.set_viewport(size);
  }
}

fn collect_changed_targets(
  targets: Query<(Entity, &OverlayTarget), Changed<OverlayTarget>>,
  mut pending: ResMut<PendingTargets>,
) {
  for (entity, target) in &targets {
    pending.changed.push((entity, target.clone()));
  }
}

fn collect_removed_targets(
  mut removed: RemovedComponents<OverlayTarget>,
  mut pending: ResMut<PendingTargets>,
) {
  pending.removed.extend(removed.read());
}

fn tick_overlay(time: Res<Time>, mut orchestrator: ResMut<FrameOrchestrator>) {
  orchestrator.tick(time.delta());
}

fn run_overlay_frame(world: &mut World) {
  let pending = world
    .get_resource_mut::<PendingTargets>()
    .map(|mut pending| std::mem::take(&mut *pending))
    .unwrap_or_default();

  world.resource_scope(|world, mut orchestrator: Mut<FrameOrchestrator>| {
    for entity in pending.removed {
      orchestrator.untrack(world, entity);
    }
    for (entity, target) in pending.changed {
      if let Err(err) = orchestrator.track(world, entity, &target) {
        warn!("Cannot track {} for the overlay: {}", entity, err);
      }
    }

    match orchestrator.compositor().backend() {
      // CPU results are final now; restore in the same frame
      CompositeBackend::Cpu => orchestrator.run_frame(world),
      CompositeBackend::Gpu => orchestrator.render_tick(world),
    }
  });
}

fn finish_overlay_frame(world: &mut World) {
  world.resource_scope(|world, mut orchestrator: Mut<FrameOrchestrator>| {
    orchestrator.finish_frame(world);
  });
}

fn shutdown_on_exit(mut exits: MessageReader<AppExit>, mut commands: Commands) {
  if exits.read().next().is_some() {
    commands.queue(ShutdownOverlay);
  }
}

/// Degroups tracked entities and releases every camera, blit and buffer.
///
/// Queued automatically on `AppExit`.
pub struct ShutdownOverlay;

impl bevy::ecs::system::Command for ShutdownOverlay {
  fn apply(self, world: &mut World) {
    if !world.contains_resource::<FrameOrchestrator>() {
      return;
    }
    world.resource_scope(|world, mut orchestrator: Mut<FrameOrchestrator>| {
      orchestrator.shutdown(world);
    });
  }
}

/// Applies a changed configuration to the running overlay.
///
/// Structural changes (groups, cameras, buffer names) are rejected with a
/// warning. Before a successful setup the config simply replaces the pending
/// one and setup is retried.
pub struct ReconfigureOverlay(pub PixelOverlayConfig);

impl bevy::ecs::system::Command for ReconfigureOverlay {
  fn apply(self, world: &mut World) {
    // Not started yet (or failed): setup retries with the new config
    if !world.contains_resource::<FrameOrchestrator>() {
      world.remove_resource::<PixelOverlaySetupFailed>();
      world.insert_resource(self.0);
      return;
    }
    world.resource_scope(|world, mut orchestrator: Mut<FrameOrchestrator>| {
      match orchestrator.reconfigure(world, self.0.clone()) {
        Ok(()) => world.insert_resource(self.0),
        Err(err) => warn!("Overlay config not applied: {}", err),
      }
    });
  }
}
