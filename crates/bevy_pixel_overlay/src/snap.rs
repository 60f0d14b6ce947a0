//! Pixel-grid snapping in viewport space.
//!
//! A world position is projected to viewport space (x, y in `[0, 1]`, z =
//! view distance), floored onto an integer grid, and unprojected back with
//! the same camera. Projection math runs in f64 so snapping a snapped
//! position lands in the same cell.

use bevy::camera::CameraProjection;
use bevy::math::{DMat4, DVec2, DVec3};
use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::composite::OverlayBlendMaterial;
use crate::error::{OverlayError, OverlayResult};

/// Cell-space slack for f64 round-off in the projection round trip.
const F64_CELL_SLACK: f64 = 1e-9;

/// How a snapped position is written back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapPolicy {
  /// Move the entity: changes simulation state.
  MutateTransform,
  /// Only publish the snapped anchor to the entity's material.
  #[default]
  ShaderParameter,
}

/// Snapping grid size in cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridResolution {
  pub width: u32,
  pub height: u32,
}

impl GridResolution {
  /// Fails with [`OverlayError::DegenerateGrid`] for a zero dimension.
  pub fn new(width: u32, height: u32) -> OverlayResult<Self> {
    if width == 0 || height == 0 {
      return Err(OverlayError::DegenerateGrid { width, height });
    }
    Ok(Self { width, height })
  }

  /// Grid whose cells are `box_size` screen pixels, at least one cell wide.
  pub fn from_box_size(viewport: UVec2, box_size: u32) -> Self {
    let box_size = box_size.max(1);
    Self {
      width: (viewport.x / box_size).max(1),
      height: (viewport.y / box_size).max(1),
    }
  }

  pub fn as_vec2(self) -> Vec2 {
    Vec2::new(self.width as f32, self.height as f32)
  }
}

/// Camera view and projection used to move between world and viewport space.
#[derive(Clone, Copy, Debug)]
pub struct ViewProjector {
  world_from_view: DMat4,
  view_from_world: DMat4,
  clip_from_view: DMat4,
  view_from_clip: DMat4,
}

impl ViewProjector {
  pub fn new(camera_transform: &GlobalTransform, clip_from_view: Mat4) -> Self {
    let world_from_view = camera_transform.to_matrix().as_dmat4();
    let clip_from_view = clip_from_view.as_dmat4();
    Self {
      world_from_view,
      view_from_world: world_from_view.inverse(),
      clip_from_view,
      view_from_clip: clip_from_view.inverse(),
    }
  }

  /// Builds the projector from a camera's `Projection` sized to `viewport`.
  pub fn from_projection(
    camera_transform: &GlobalTransform,
    projection: &Projection,
    viewport: Vec2,
  ) -> Self {
    let mut projection = projection.clone();
    projection.update(viewport.x, viewport.y);
    Self::new(camera_transform, projection.get_clip_from_view())
  }

  /// World position to viewport space. `None` on the camera plane of a
  /// perspective projection.
  pub fn world_to_viewport(&self, world: Vec3) -> Option<Vec3> {
    self
      .world_to_viewport_f64(world.as_dvec3())
      .map(|v| v.as_vec3())
  }

  /// Viewport space back to world. `None` if the projection is degenerate.
  pub fn viewport_to_world(&self, viewport: Vec3) -> Option<Vec3> {
    self
      .viewport_to_world_f64(viewport.as_dvec3())
      .map(|v| v.as_vec3())
  }

  fn world_to_viewport_f64(&self, world: DVec3) -> Option<DVec3> {
    let view = self.view_from_world.transform_point3(world);
    let clip = self.clip_from_view * view.extend(1.0);
    if clip.w.abs() < f64::EPSILON {
      return None;
    }
    let ndc = clip.truncate() / clip.w;
    Some(DVec3::new(ndc.x * 0.5 + 0.5, ndc.y * 0.5 + 0.5, -view.z))
  }

  fn viewport_to_world_f64(&self, viewport: DVec3) -> Option<DVec3> {
    let ndc_x = viewport.x * 2.0 - 1.0;
    let ndc_y = viewport.y * 2.0 - 1.0;

    // Two points on the pixel's view ray; works for reverse-z, infinite far
    // planes and orthographic projections alike.
    let a = self
      .view_from_clip
      .project_point3(DVec3::new(ndc_x, ndc_y, 1.0));
    let b = self
      .view_from_clip
      .project_point3(DVec3::new(ndc_x, ndc_y, 0.5));
    let dir = b - a;
    if dir.z.abs() < f64::EPSILON || !a.is_finite() || !b.is_finite() {
      return None;
    }

    let t = (-viewport.z - a.z) / dir.z;
    let view = a + dir * t;
    Some(self.world_from_view.transform_point3(view))
  }
}

/// Result of snapping one position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnappedPosition {
  /// Snapped position in world space.
  pub world: Vec3,
  /// Snapped position in viewport space (z = view distance).
  pub viewport: Vec3,
}

impl SnappedPosition {
  /// Shader anchor: `(x, y, depth, 0)` in viewport space.
  pub fn anchor(&self) -> Vec4 {
    self.viewport.extend(0.0)
  }
}

/// Floors `value` onto a grid of `cells`, treating anything within `slack`
/// cells below a boundary as on it.
fn quantize(value: f64, cells: u32, slack: f64) -> f64 {
  let cells = cells as f64;
  (value * cells + slack).floor() / cells
}

fn cells_of(grid: GridResolution) -> DVec2 {
  DVec2::new(grid.width as f64, grid.height as f64)
}

/// Floors viewport x/y onto the grid; z passes through.
///
/// Only the f32 rounding of the input is forgiven, so a value a hair below
/// a cell boundary stays in the lower cell.
pub fn snap_viewport(viewport: Vec3, grid: GridResolution) -> Vec3 {
  let viewport = viewport.as_dvec3();
  let slack = viewport.truncate().abs() * cells_of(grid) * f32::EPSILON as f64 + F64_CELL_SLACK;
  snap_viewport_f64(viewport, grid, slack).as_vec3()
}

fn snap_viewport_f64(viewport: DVec3, grid: GridResolution, slack: DVec2) -> DVec3 {
  DVec3::new(
    quantize(viewport.x, grid.width, slack.x),
    quantize(viewport.y, grid.height, slack.y),
    viewport.z,
  )
}

/// Cell-space error that storing `world` as f32 can introduce, per axis.
///
/// Each world axis is nudged by twice its f32 rounding bound and the
/// resulting viewport motion summed, so re-snapping a snapped position
/// lands in the same cell.
fn rounding_slack(projector: &ViewProjector, world: DVec3, viewport: DVec3, grid: GridResolution) -> DVec2 {
  let step = f32::EPSILON as f64 * world.abs().max_element().max(1.0);
  let mut slack = DVec2::splat(F64_CELL_SLACK);
  for axis in [DVec3::X, DVec3::Y, DVec3::Z] {
    if let Some(moved) = projector.world_to_viewport_f64(world + axis * step) {
      slack += (moved.truncate() - viewport.truncate()).abs() * cells_of(grid);
    }
  }
  slack
}

/// Snaps `world_position` to the `grid_width x grid_height` viewport grid of
/// `projector`.
///
/// Mutates nothing. Returns `Ok(None)` when the position cannot be projected.
pub fn snap(
  world_position: Vec3,
  projector: &ViewProjector,
  grid_width: u32,
  grid_height: u32,
) -> OverlayResult<Option<SnappedPosition>> {
  let grid = GridResolution::new(grid_width, grid_height)?;

  let position = world_position.as_dvec3();
  let Some(viewport) = projector.world_to_viewport_f64(position) else {
    return Ok(None);
  };
  let slack = rounding_slack(projector, position, viewport, grid);
  let snapped = snap_viewport_f64(viewport, grid, slack);
  let Some(world) = projector.viewport_to_world_f64(snapped) else {
    return Ok(None);
  };

  Ok(Some(SnappedPosition {
    world: world.as_vec3(),
    viewport: snapped.as_vec3(),
  }))
}

/// Moves `entity` so its world position becomes `position`.
///
/// Converts into the parent's space for child entities and refreshes the
/// `GlobalTransform` too, since snapping runs after transform propagation.
pub fn write_world_position(world: &mut World, entity: Entity, position: Vec3) -> OverlayResult<()> {
  let parent_global = world
    .get::<ChildOf>(entity)
    .and_then(|child_of| world.get::<GlobalTransform>(child_of.parent()))
    .copied();

  let local = match parent_global {
    Some(parent) => parent.affine().inverse().transform_point3(position),
    None => position,
  };

  let Some(mut transform) = world.get_mut::<Transform>(entity) else {
    return Err(OverlayError::MissingEntity(format!("{entity}")));
  };
  transform.translation = local;
  let transform = *transform;

  if let Some(mut global) = world.get_mut::<GlobalTransform>(entity) {
    *global = match parent_global {
      Some(parent) => parent.mul_transform(transform),
      None => GlobalTransform::from(transform),
    };
  }
  Ok(())
}

/// Publishes the snapped anchor and grid parameters to a material.
pub fn publish_anchor(
  material: &mut OverlayBlendMaterial,
  snapped: &SnappedPosition,
  grid: GridResolution,
  box_size: u32,
) {
  material.uniforms.anchor = snapped.anchor();
  material.uniforms.resolution = grid.as_vec2();
  material.uniforms.box_size = box_size as f32;
}

#[cfg(test)]
mod tests {
  use rand::rngs::StdRng;
  use rand::{Rng, SeedableRng};

  use super::*;

  fn ortho_projector() -> ViewProjector {
    let camera = GlobalTransform::from(Transform::from_xyz(12.5, -40.0, 10.0));
    let clip_from_view = Mat4::orthographic_rh(-320.0, 320.0, -180.0, 180.0, 0.1, 1000.0);
    ViewProjector::new(&camera, clip_from_view)
  }

  fn perspective_projector() -> ViewProjector {
    let camera = GlobalTransform::from(
      Transform::from_xyz(3.0, 4.0, 25.0).looking_at(Vec3::new(0.0, 0.0, 0.0), Vec3::Y),
    );
    let clip_from_view = Mat4::perspective_infinite_reverse_rh(1.0, 16.0 / 9.0, 0.1);
    ViewProjector::new(&camera, clip_from_view)
  }

  #[test]
  fn zero_grid_is_degenerate() {
    let projector = ortho_projector();
    assert_eq!(
      snap(Vec3::ZERO, &projector, 0, 8),
      Err(OverlayError::DegenerateGrid {
        width: 0,
        height: 8
      })
    );
    assert!(snap(Vec3::ZERO, &projector, 8, 0).is_err());
  }

  #[test]
  fn floors_instead_of_rounding() {
    let grid = GridResolution::new(8, 4).unwrap();
    let snapped = snap_viewport(Vec3::new(0.24, 0.74, 5.0), grid);
    // 0.24 * 8 = 1.92 floors to 1, 0.74 * 4 = 2.96 floors to 2
    assert_eq!(snapped.x, 1.0 / 8.0);
    assert_eq!(snapped.y, 2.0 / 4.0);
    assert_eq!(snapped.z, 5.0);
  }

  #[test]
  fn just_below_cell_boundary_stays_in_lower_cell() {
    // 64 cells over 640 world units: cell 31 starts at x = 2.5
    let projector = ortho_projector();
    let position = Vec3::new(2.5 - 0.0005, 5.0, 0.0);

    let snapped = snap(position, &projector, 64, 36).unwrap().unwrap();

    assert_eq!(snapped.viewport.x, 30.0 / 64.0);
    assert!((snapped.world.x - -7.5).abs() < 1e-3, "{}", snapped.world);
  }

  #[test]
  fn viewport_just_below_boundary_floors_down() {
    let grid = GridResolution::new(10, 10).unwrap();
    let snapped = snap_viewport(Vec3::new(0.099995, 0.7, 0.0), grid);
    assert_eq!(snapped.x, 0.0);
    // 0.7 is stored a little below 0.7 in f32 and still counts as cell 7
    assert_eq!(snapped.y, 0.7);
  }

  #[test]
  fn viewport_round_trip() {
    for projector in [ortho_projector(), perspective_projector()] {
      let world = Vec3::new(4.0, -2.0, -3.0);
      let viewport = projector.world_to_viewport(world).unwrap();
      let back = projector.viewport_to_world(viewport).unwrap();
      assert!(back.abs_diff_eq(world, 1e-3), "{back} != {world}");
    }
  }

  #[test]
  fn snapped_output_lies_on_grid() {
    let mut rng = StdRng::seed_from_u64(7);
    let projector = ortho_projector();

    for _ in 0..500 {
      let width = rng.gen_range(1..400);
      let height = rng.gen_range(1..400);
      let position = Vec3::new(
        rng.gen_range(-300.0..300.0),
        rng.gen_range(-200.0..120.0),
        rng.gen_range(-50.0..5.0),
      );

      let snapped = snap(position, &projector, width, height)
        .unwrap()
        .unwrap();

      let cell_x = (snapped.viewport.x * width as f32).round();
      let cell_y = (snapped.viewport.y * height as f32).round();
      assert_eq!(snapped.viewport.x, cell_x / width as f32);
      assert_eq!(snapped.viewport.y, cell_y / height as f32);
    }
  }

  #[test]
  fn snapping_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(42);

    for projector in [ortho_projector(), perspective_projector()] {
      for _ in 0..500 {
        let width = rng.gen_range(1..256);
        let height = rng.gen_range(1..256);
        let position = Vec3::new(
          rng.gen_range(-10.0..10.0),
          rng.gen_range(-10.0..10.0),
          rng.gen_range(-10.0..5.0),
        );

        let Some(once) = snap(position, &projector, width, height).unwrap() else {
          continue;
        };
        let twice = snap(once.world, &projector, width, height)
          .unwrap()
          .unwrap();

        assert_eq!(twice.viewport.x, once.viewport.x);
        assert_eq!(twice.viewport.y, once.viewport.y);
        assert!(twice.world.abs_diff_eq(once.world, 1e-3));
      }
    }
  }

  #[test]
  fn box_size_grid_is_never_empty() {
    let grid = GridResolution::from_box_size(UVec2::new(800, 600), 8);
    assert_eq!((grid.width, grid.height), (100, 75));

    let tiny = GridResolution::from_box_size(UVec2::new(4, 4), 8);
    assert_eq!((tiny.width, tiny.height), (1, 1));
  }

  #[test]
  fn writes_world_position_through_parent() {
    let mut world = World::new();
    let parent = world
      .spawn((
        Transform::from_xyz(10.0, 0.0, 0.0),
        GlobalTransform::from(Transform::from_xyz(10.0, 0.0, 0.0)),
      ))
      .id();
    let child = world
      .spawn((Transform::default(), GlobalTransform::default(), ChildOf(parent)))
      .id();

    write_world_position(&mut world, child, Vec3::new(16.0, 8.0, 0.0)).unwrap();

    let local = world.get::<Transform>(child).unwrap().translation;
    let global = world.get::<GlobalTransform>(child).unwrap().translation();
    assert!(local.abs_diff_eq(Vec3::new(6.0, 8.0, 0.0), 1e-5));
    assert!(global.abs_diff_eq(Vec3::new(16.0, 8.0, 0.0), 1e-5));
  }

  #[test]
  fn publishes_anchor_to_material() {
    let mut material = OverlayBlendMaterial::default();
    let snapped = SnappedPosition {
      world: Vec3::ZERO,
      viewport: Vec3::new(0.25, 0.5, 12.0),
    };

    publish_anchor(
      &mut material,
      &snapped,
      GridResolution::new(100, 75).unwrap(),
      8,
    );

    assert_eq!(material.uniforms.anchor, Vec4::new(0.25, 0.5, 12.0, 0.0));
    assert_eq!(material.uniforms.resolution, Vec2::new(100.0, 75.0));
    assert_eq!(material.uniforms.box_size, 8.0);
  }
}
