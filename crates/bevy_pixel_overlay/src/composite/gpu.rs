//! Composite steps as blit passes.
//!
//! Each step owns a slot: a 2D camera targeting the destination image and a
//! full-screen quad on the slot's private render layer. The quad carries a
//! material owned by the slot, refreshed every cycle from the step's
//! material and source, so steps sharing a material still sample their own
//! buffers. Slot cameras render after the main view in step order. An
//! optional present slot draws the final buffer over the window.

use std::collections::HashSet;

use bevy::camera::visibility::RenderLayers;
use bevy::camera::{RenderTarget, ScalingMode};
use bevy::prelude::*;

use super::CompositeStep;
use super::material::{BlendMode, OverlayBlendMaterial};
use crate::buffers::FrameBuffer;
use crate::error::{OverlayError, OverlayResult};
use crate::groups::MAX_GROUPS;

/// First render layer used by blit slots, above every render group.
pub const COMPOSITE_LAYER_BASE: usize = MAX_GROUPS;

/// Render layer of the present pass.
pub const PRESENT_LAYER: usize = COMPOSITE_LAYER_BASE + 1024;

/// Render order of the first blit camera.
pub const COMPOSITE_ORDER_BASE: isize = 100;

/// Marks a blit camera; the value is its slot index.
#[derive(Component, Clone, Copy, Debug)]
pub struct CompositeBlitCamera(pub usize);

/// Marks a blit quad; the value is its slot index.
#[derive(Component, Clone, Copy, Debug)]
pub struct CompositeBlitQuad(pub usize);

/// Marks the camera drawing the overlay over the window.
#[derive(Component, Clone, Copy, Debug)]
pub struct OverlayPresentCamera;

struct BlitSlot {
  camera: Entity,
  quad: Entity,
  material: Handle<OverlayBlendMaterial>,
}

struct PresentSlot {
  slot: BlitSlot,
  material: Handle<OverlayBlendMaterial>,
}

/// Owns the blit entities across frames.
#[derive(Default)]
pub struct GpuCompositor {
  slots: Vec<BlitSlot>,
  present: Option<PresentSlot>,
  quad_mesh: Option<Handle<Mesh>>,
}

/// Orthographic projection mapping the 2x2 quad onto the whole target.
fn blit_projection() -> Projection {
  Projection::Orthographic(OrthographicProjection {
    near: -1.0,
    far: 1.0,
    scale: 1.0,
    viewport_origin: Vec2::new(0.5, 0.5),
    scaling_mode: ScalingMode::Fixed {
      width: 2.0,
      height: 2.0,
    },
    area: Rect::default(),
  })
}

impl GpuCompositor {
  /// Configures one slot per step and activates their cameras.
  ///
  /// `present` names the buffer to draw over the window afterwards.
  pub fn submit(
    &mut self,
    world: &mut World,
    steps: &[(CompositeStep, FrameBuffer, FrameBuffer)],
    present: Option<&FrameBuffer>,
  ) -> OverlayResult<()> {
    let mesh = self.quad_mesh(world)?;
    let order = submission_order(world, steps);
    let mut cleared = HashSet::new();

    for (slot_index, &step_index) in order.iter().enumerate() {
      let (step, source, target) = &steps[step_index];

      let clear_color = if cleared.insert(target.key.as_str()) {
        ClearColorConfig::Custom(Color::NONE)
      } else {
        ClearColorConfig::None
      };

      let slot = self.slot(world, slot_index, &mesh)?;
      let (camera, material) = (slot.camera, slot.material.clone());

      load_slot_material(world, &material, &step.material, &source.color)?;

      if let Some(mut component) = world.get_mut::<Camera>(camera) {
        component.target = RenderTarget::Image(target.color.clone().into());
        component.clear_color = clear_color;
        component.order = COMPOSITE_ORDER_BASE + slot_index as isize;
        component.is_active = true;
      }
    }

    for slot in self.slots.iter().skip(steps.len()) {
      set_active(world, slot.camera, false);
    }

    match present {
      Some(buffer) => {
        let order = COMPOSITE_ORDER_BASE + self.slots.len() as isize;
        let present = self.present_slot(world, &mesh, buffer)?;
        point_material_at(world, &present.material, &buffer.color)?;
        if let Some(mut component) = world.get_mut::<Camera>(present.slot.camera) {
          component.order = order;
          component.is_active = true;
        }
      }
      None => {
        if let Some(present) = &self.present {
          set_active(world, present.slot.camera, false);
        }
      }
    }

    Ok(())
  }

  /// Deactivates every blit camera.
  pub fn deactivate(&self, world: &mut World) {
    for slot in &self.slots {
      set_active(world, slot.camera, false);
    }
    if let Some(present) = &self.present {
      set_active(world, present.slot.camera, false);
    }
  }

  /// Despawns the blit entities.
  pub fn release(&mut self, world: &mut World) {
    let present = self.present.take().map(|present| present.slot);
    for slot in self.slots.drain(..).chain(present) {
      for entity in [slot.camera, slot.quad] {
        if let Ok(entity) = world.get_entity_mut(entity) {
          entity.despawn();
        }
      }
    }
  }

  /// Number of blit slots spawned so far.
  pub fn slot_count(&self) -> usize {
    self.slots.len()
  }

  /// Material drawn by slot `index`.
  pub fn slot_material(&self, index: usize) -> Option<&Handle<OverlayBlendMaterial>> {
    self.slots.get(index).map(|slot| &slot.material)
  }

  fn quad_mesh(&mut self, world: &mut World) -> OverlayResult<Handle<Mesh>> {
    if let Some(mesh) = &self.quad_mesh {
      return Ok(mesh.clone());
    }
    let Some(mut meshes) = world.get_resource_mut::<Assets<Mesh>>() else {
      return Err(OverlayError::InvalidCompositeStep(
        "mesh assets are unavailable".into(),
      ));
    };
    // Covers the blit camera's 2x2 view exactly
    let mesh = meshes.add(Rectangle::new(2.0, 2.0));
    self.quad_mesh = Some(mesh.clone());
    Ok(mesh)
  }

  fn slot(
    &mut self,
    world: &mut World,
    index: usize,
    mesh: &Handle<Mesh>,
  ) -> OverlayResult<&BlitSlot> {
    while self.slots.len() <= index {
      let index = self.slots.len();
      let layer = COMPOSITE_LAYER_BASE + index;
      let Some(mut materials) = world.get_resource_mut::<Assets<OverlayBlendMaterial>>() else {
        return Err(OverlayError::InvalidCompositeStep(
          "blend materials are unavailable".into(),
        ));
      };
      let material = materials.add(OverlayBlendMaterial::default());

      let camera = world
        .spawn((
          Name::new(format!("CompositeBlitCamera({index})")),
          CompositeBlitCamera(index),
          Camera2d,
          Camera {
            order: COMPOSITE_ORDER_BASE + index as isize,
            is_active: false,
            ..default()
          },
          blit_projection(),
          RenderLayers::layer(layer),
        ))
        .id();
      let quad = world
        .spawn((
          Name::new(format!("CompositeBlitQuad({index})")),
          CompositeBlitQuad(index),
          Mesh2d(mesh.clone()),
          MeshMaterial2d(material.clone()),
          Transform::default(),
          Visibility::default(),
          RenderLayers::layer(layer),
        ))
        .id();
      self.slots.push(BlitSlot {
        camera,
        quad,
        material,
      });
    }
    self
      .slots
      .get(index)
      .ok_or_else(|| OverlayError::InvalidCompositeStep(format!("blit slot {index} missing")))
  }

  fn present_slot(
    &mut self,
    world: &mut World,
    mesh: &Handle<Mesh>,
    buffer: &FrameBuffer,
  ) -> OverlayResult<&PresentSlot> {
    if self.present.is_none() {
      let Some(mut materials) = world.get_resource_mut::<Assets<OverlayBlendMaterial>>() else {
        return Err(OverlayError::InvalidCompositeStep(
          "blend materials are unavailable".into(),
        ));
      };
      let material = materials.add(OverlayBlendMaterial::present(buffer.color.clone()));

      let layer = PRESENT_LAYER;
      let camera = world
        .spawn((
          Name::new("OverlayPresentCamera"),
          OverlayPresentCamera,
          Camera2d,
          Camera {
            is_active: false,
            clear_color: ClearColorConfig::None,
            ..default()
          },
          blit_projection(),
          RenderLayers::layer(layer),
        ))
        .id();
      let quad = world
        .spawn((
          Name::new("OverlayPresentQuad"),
          Mesh2d(mesh.clone()),
          MeshMaterial2d(material.clone()),
          Transform::default(),
          Visibility::default(),
          RenderLayers::layer(layer),
        ))
        .id();
      info!("Overlay present pass created");
      self.present = Some(PresentSlot {
        slot: BlitSlot {
          camera,
          quad,
          material: material.clone(),
        },
        material,
      });
    }

    self
      .present
      .as_ref()
      .ok_or_else(|| OverlayError::InvalidCompositeStep("present slot missing".into()))
  }
}

fn set_active(world: &mut World, camera: Entity, active: bool) {
  if let Some(mut component) = world.get_mut::<Camera>(camera) {
    component.is_active = active;
  }
}

/// Binds `source` to the material, touching the asset only when it changes.
fn point_material_at(
  world: &mut World,
  material: &Handle<OverlayBlendMaterial>,
  source: &Handle<Image>,
) -> OverlayResult<()> {
  let Some(mut materials) = world.get_resource_mut::<Assets<OverlayBlendMaterial>>() else {
    return Err(OverlayError::InvalidCompositeStep(
      "blend materials are unavailable".into(),
    ));
  };
  let current = materials
    .get(material)
    .map(|material| material.source.as_ref() == Some(source));
  match current {
    Some(true) => Ok(()),
    Some(false) => {
      if let Some(material) = materials.get_mut(material) {
        material.source = Some(source.clone());
      }
      Ok(())
    }
    None => Err(OverlayError::InvalidCompositeStep(
      "blend material is not loaded".into(),
    )),
  }
}

/// Copies the step material's uniforms into a slot's own material and binds
/// `source`, touching the asset only when something changed.
fn load_slot_material(
  world: &mut World,
  slot_material: &Handle<OverlayBlendMaterial>,
  step_material: &Handle<OverlayBlendMaterial>,
  source: &Handle<Image>,
) -> OverlayResult<()> {
  let Some(mut materials) = world.get_resource_mut::<Assets<OverlayBlendMaterial>>() else {
    return Err(OverlayError::InvalidCompositeStep(
      "blend materials are unavailable".into(),
    ));
  };
  let Some(uniforms) = materials.get(step_material).map(|material| material.uniforms) else {
    return Err(OverlayError::InvalidCompositeStep(
      "blend material is not loaded".into(),
    ));
  };
  let current = materials
    .get(slot_material)
    .is_some_and(|material| material.uniforms == uniforms && material.source.as_ref() == Some(source));
  if !current {
    if let Some(material) = materials.get_mut(slot_material) {
      material.uniforms = uniforms;
      material.source = Some(source.clone());
    }
  }
  Ok(())
}

/// Order in which steps are drawn.
///
/// The GPU cannot read and write a depth channel in one pass, so when every
/// step is depth-nearer the steps are drawn far to near by anchor depth. With
/// per-step depths this matches the CPU depth test. Otherwise the given order
/// stands.
pub(crate) fn submission_order(
  world: &World,
  steps: &[(CompositeStep, FrameBuffer, FrameBuffer)],
) -> Vec<usize> {
  let mut order: Vec<usize> = (0..steps.len()).collect();
  let Some(materials) = world.get_resource::<Assets<OverlayBlendMaterial>>() else {
    return order;
  };

  let depths: Option<Vec<f32>> = steps
    .iter()
    .map(|(step, _, _)| {
      materials
        .get(&step.material)
        .filter(|material| material.mode() == BlendMode::DepthNearer)
        .map(OverlayBlendMaterial::anchor_depth)
    })
    .collect();

  if let Some(depths) = depths {
    // Stable: equal depths keep their submission order
    order.sort_by(|a, b| depths[*b].total_cmp(&depths[*a]));
  }
  order
}
