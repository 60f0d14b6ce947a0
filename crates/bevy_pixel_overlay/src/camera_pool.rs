//! Off-screen cameras, created on demand and reused by tag.
//!
//! Pool cameras are clones of the primary camera restricted to one render
//! group. They stay inactive until [`OffscreenCameraPool::render`] binds them
//! to a buffer for the current frame.

use std::collections::HashMap;

use bevy::camera::RenderTarget;
use bevy::camera::visibility::RenderLayers;
use bevy::prelude::*;

use crate::buffers::FrameBuffer;
use crate::error::{OverlayError, OverlayResult};
use crate::groups::{GroupMask, RenderGroupId, RenderGroupRegistry};

/// Render order of display index 0; pool cameras render before the main view.
pub const OFFSCREEN_ORDER_BASE: isize = -100;

/// Marks a camera owned by [`OffscreenCameraPool`].
#[derive(Component, Clone, Debug)]
pub struct OffscreenCamera {
  pub tag: String,
  pub display_index: u8,
  /// Copy transform and projection from the primary camera before rendering.
  pub follow_primary: bool,
}

/// What a pool camera clears its buffer to.
#[derive(Component, Clone, Copy, Debug, Default, PartialEq, Eq)]
///
/// The colour is applied when the camera is acquired and when the policy is
/// set. Only `Inherit` is refreshed on every render, so a clear colour set
/// directly on a `Transparent` camera's [`Camera`] sticks.
pub enum ClearPolicy {
  /// Solid `(0, 0, 0, 0)`.
  #[default]
  Transparent,
  /// Whatever the primary camera clears to.
  Inherit,
}

/// Keyed set of off-screen cameras plus this frame's buffer bindings.
pub struct OffscreenCameraPool {
  primary: Entity,
  cameras: HashMap<String, Entity>,
  /// Buffer key -> camera rendering into it this frame.
  bindings: HashMap<String, Entity>,
}

impl OffscreenCameraPool {
  pub fn new(primary: Entity) -> Self {
    Self {
      primary,
      cameras: HashMap::new(),
      bindings: HashMap::new(),
    }
  }

  /// The camera pool cameras are cloned from.
  pub fn primary(&self) -> Entity {
    self.primary
  }

  /// Returns the camera for `tag`, spawning it on first use.
  ///
  /// An existing camera is returned as is; `culling_mask` only applies to a
  /// newly created camera.
  pub fn acquire(
    &mut self,
    world: &mut World,
    tag: &str,
    display_index: u8,
    culling_mask: GroupMask,
  ) -> OverlayResult<Entity> {
    if let Some(&camera) = self.cameras.get(tag) {
      if world.get_entity(camera).is_ok() {
        return Ok(camera);
      }
      warn!("Offscreen camera '{}' was despawned externally, recreating", tag);
      self.cameras.remove(tag);
    }

    let (transform, projection, camera_3d) = {
      let Some(transform) = world.get::<Transform>(self.primary).copied() else {
        return Err(OverlayError::MissingPrimaryCamera);
      };
      if world.get::<Camera>(self.primary).is_none() {
        return Err(OverlayError::MissingPrimaryCamera);
      }
      (
        transform,
        world.get::<Projection>(self.primary).cloned(),
        world.get::<Camera3d>(self.primary).cloned(),
      )
    };
    let global = world
      .get::<GlobalTransform>(self.primary)
      .copied()
      .unwrap_or_else(|| GlobalTransform::from(transform));

    let camera = Camera {
      order: OFFSCREEN_ORDER_BASE + display_index as isize,
      clear_color: ClearColorConfig::Custom(Color::NONE),
      is_active: false,
      ..default()
    };

    // Projection before the camera marker, or its required components win
    let mut entity = world.spawn((
      Name::new(format!("OffscreenCamera({tag})")),
      OffscreenCamera {
        tag: tag.to_string(),
        display_index,
        follow_primary: true,
      },
      ClearPolicy::Transparent,
      camera,
      transform,
      global,
      culling_mask.to_render_layers(),
    ));
    if let Some(projection) = projection {
      entity.insert(projection);
    }
    match camera_3d {
      Some(camera_3d) => entity.insert(camera_3d),
      None => entity.insert(Camera2d),
    };
    let id = entity.id();

    debug!(
      "Spawned offscreen camera '{}' (display {}, mask {:#010x})",
      tag, display_index, culling_mask.0
    );
    self.cameras.insert(tag.to_string(), id);
    Ok(id)
  }

  /// Points `camera` at `buffer` and activates it for this frame.
  ///
  /// Fails with [`OverlayError::BufferCameraMismatch`] if another camera
  /// already renders into `buffer` this frame.
  pub fn render(&mut self, world: &mut World, camera: Entity, buffer: &FrameBuffer) -> OverlayResult<()> {
    if let Some(&bound) = self.bindings.get(&buffer.key) {
      if bound != camera {
        return Err(OverlayError::BufferCameraMismatch {
          buffer: buffer.key.clone(),
          bound,
          requested: camera,
        });
      }
    }

    let follow_primary = world
      .get::<OffscreenCamera>(camera)
      .is_some_and(|offscreen| offscreen.follow_primary);
    if follow_primary {
      self.sync_from_primary(world, camera)?;
    }

    let Some(mut component) = world.get_mut::<Camera>(camera) else {
      return Err(OverlayError::MissingEntity(format!("camera {camera}")));
    };
    component.target = RenderTarget::Image(buffer.color.clone().into());
    component.is_active = true;

    self.bindings.insert(buffer.key.clone(), camera);
    Ok(())
  }

  /// Copies view state from the primary camera.
  ///
  /// `GlobalTransform` is copied too since this runs after propagation.
  fn sync_from_primary(&self, world: &mut World, camera: Entity) -> OverlayResult<()> {
    let Some(transform) = world.get::<Transform>(self.primary).copied() else {
      return Err(OverlayError::MissingPrimaryCamera);
    };
    let global = world.get::<GlobalTransform>(self.primary).copied();
    let projection = world.get::<Projection>(self.primary).cloned();
    let inherited_clear = world
      .get::<Camera>(self.primary)
      .map(|primary| primary.clear_color.clone());

    let Ok(mut entity) = world.get_entity_mut(camera) else {
      return Err(OverlayError::MissingEntity(format!("camera {camera}")));
    };
    entity.insert(transform);
    if let Some(global) = global {
      entity.insert(global);
    }
    if let Some(projection) = projection {
      entity.insert(projection);
    }

    let inherits = entity.get::<ClearPolicy>() == Some(&ClearPolicy::Inherit);
    if let Some(clear) = inherited_clear.filter(|_| inherits) {
      if let Some(mut component) = entity.get_mut::<Camera>() {
        component.clear_color = clear;
      }
    }
    Ok(())
  }

  /// Drops last frame's bindings and deactivates every pool camera.
  pub fn begin_frame(&mut self, world: &mut World) {
    self.bindings.clear();
    self.deactivate_all(world);
  }

  /// Deactivates every pool camera, keeping the bindings.
  pub fn deactivate_all(&self, world: &mut World) {
    for &camera in self.cameras.values() {
      if let Some(mut component) = world.get_mut::<Camera>(camera) {
        component.is_active = false;
      }
    }
  }

  /// Restricts any camera (usually the main view) to everything except
  /// `groups`.
  pub fn exclude_groups(
    &self,
    world: &mut World,
    camera: Entity,
    registry: &RenderGroupRegistry,
    groups: impl IntoIterator<Item = RenderGroupId>,
  ) -> OverlayResult<()> {
    let mask = registry.mask_excluding_all(groups);
    let Ok(mut entity) = world.get_entity_mut(camera) else {
      return Err(OverlayError::MissingEntity(format!("camera {camera}")));
    };
    entity.insert(mask.to_render_layers());
    Ok(())
  }

  /// Sets the clear policy of the camera for `tag` and applies its colour.
  pub fn set_clear_policy(&self, world: &mut World, tag: &str, policy: ClearPolicy) -> OverlayResult<()> {
    let Some(&camera) = self.cameras.get(tag) else {
      return Err(OverlayError::MissingEntity(format!("offscreen camera '{tag}'")));
    };
    let clear_color = match policy {
      ClearPolicy::Transparent => ClearColorConfig::Custom(Color::NONE),
      ClearPolicy::Inherit => match world.get::<Camera>(self.primary) {
        Some(primary) => primary.clear_color.clone(),
        None => return Err(OverlayError::MissingPrimaryCamera),
      },
    };
    let Ok(mut entity) = world.get_entity_mut(camera) else {
      return Err(OverlayError::MissingEntity(format!("camera {camera}")));
    };
    entity.insert(policy);
    if let Some(mut component) = entity.get_mut::<Camera>() {
      component.clear_color = clear_color;
    }
    Ok(())
  }

  /// Camera for `tag`, if it was acquired.
  pub fn camera(&self, tag: &str) -> Option<Entity> {
    self.cameras.get(tag).copied()
  }

  /// Camera bound to buffer `key` this frame.
  pub fn bound_camera(&self, key: &str) -> Option<Entity> {
    self.bindings.get(key).copied()
  }

  pub fn len(&self) -> usize {
    self.cameras.len()
  }

  pub fn is_empty(&self) -> bool {
    self.cameras.is_empty()
  }

  /// Despawns every pool camera.
  pub fn release_all(&mut self, world: &mut World) {
    self.bindings.clear();
    for (_, camera) in self.cameras.drain() {
      if let Ok(entity) = world.get_entity_mut(camera) {
        entity.despawn();
      }
    }
  }
}

/// Culling mask of a camera, reading a missing `RenderLayers` as layer 0.
pub fn culling_mask(world: &World, camera: Entity) -> GroupMask {
  world
    .get::<RenderLayers>(camera)
    .map(GroupMask::from_render_layers)
    .unwrap_or(GroupMask::single(RenderGroupId::DEFAULT))
}
