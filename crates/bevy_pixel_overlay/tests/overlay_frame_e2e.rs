//! E2E tests for the overlay frame cycle in a headless app.
//!
//! Without a `RenderPlugin` the plugin falls back to the CPU compositor, so a
//! whole cycle (partition, render, snap, composite, restore) completes inside
//! one `app.update()`.
//!
//! Tests cover:
//! - Setup against the primary camera (culling mask, failure resource)
//! - Tracking through `OverlayTarget` add/remove and despawn
//! - Camera reuse across frames and buffer resizing
//! - Aborted cycles and recovery on the next frame
//! - Transform snapping and shutdown
//!
//! Run: cargo test -p bevy_pixel_overlay --test overlay_frame_e2e

use std::time::Duration;

use bevy::app::{TaskPoolOptions, TaskPoolPlugin};
use bevy::ecs::system::Command;
use bevy::prelude::*;
use bevy_pixel_overlay::camera_pool::culling_mask;
use bevy_pixel_overlay::{
  CompositeBackend, CompositeStep, FrameOrchestrator, OffscreenCamera, OverlayBackend,
  OverlayError, OverlayPrimaryCamera, OverlayTarget, PixelOverlayConfig, PixelOverlayPlugin,
  PixelOverlaySetupFailed, ReconfigureOverlay, RenderGroupId, ShutdownOverlay, SnapPolicy,
  group_of,
};

const ISOLATION: u8 = 30;
const STANDBY: u8 = 31;

struct TestHarness {
  app: App,
  camera: Entity,
}

impl TestHarness {
  fn new(config: PixelOverlayConfig) -> Self {
    let mut app = App::new();
    app.add_plugins(MinimalPlugins.set(TaskPoolPlugin {
      task_pool_options: TaskPoolOptions::with_num_threads(4),
    }));

    // TransformPlugin is needed for GlobalTransform propagation
    app.add_plugins(bevy::transform::TransformPlugin);
    app.add_plugins(bevy::asset::AssetPlugin::default());
    // ImagePlugin registers the Image asset type
    app.add_plugins(bevy::image::ImagePlugin::default());

    app.add_plugins(PixelOverlayPlugin::new(config));

    let camera = app
      .world_mut()
      .spawn((Camera2d, OverlayPrimaryCamera, Transform::default()))
      .id();

    // Setup runs in Update
    app.update();

    Self { app, camera }
  }

  /// Headless apps have no window; drive the viewport by hand.
  fn set_viewport(&mut self, width: u32, height: u32) {
    self.orchestrator_mut().set_viewport(UVec2::new(width, height));
  }

  fn orchestrator(&self) -> &FrameOrchestrator {
    self.app.world().resource::<FrameOrchestrator>()
  }

  fn orchestrator_mut(&mut self) -> Mut<'_, FrameOrchestrator> {
    self.app.world_mut().resource_mut::<FrameOrchestrator>()
  }

  fn spawn_target(&mut self, position: Vec3, target: OverlayTarget) -> Entity {
    self
      .app
      .world_mut()
      .spawn((Transform::from_translation(position), Visibility::default(), target))
      .id()
  }

  fn group(&self, entity: Entity) -> Option<RenderGroupId> {
    group_of(self.app.world(), entity)
  }

  fn run_frames(&mut self, count: usize) {
    for _ in 0..count {
      self.app.update();
    }
  }
}

fn id(index: u8) -> Option<RenderGroupId> {
  RenderGroupId::new(index)
}

#[test]
fn setup_hides_isolation_groups_from_primary_camera() {
  let harness = TestHarness::new(PixelOverlayConfig::default());

  assert_eq!(
    harness.app.world().resource::<OverlayBackend>().0,
    CompositeBackend::Cpu,
    "headless apps should composite on the CPU"
  );

  let mask = culling_mask(harness.app.world(), harness.camera);
  assert!(mask.contains(RenderGroupId::DEFAULT));
  assert!(!mask.contains(RenderGroupId::new(ISOLATION).unwrap()));
  assert!(!mask.contains(RenderGroupId::new(STANDBY).unwrap()));
}

#[test]
fn invalid_config_records_setup_failure() {
  let config = PixelOverlayConfig {
    isolation_group: "pixels".into(),
    ..default()
  };
  let harness = TestHarness::new(config);

  assert!(!harness.app.world().contains_resource::<FrameOrchestrator>());
  let failed = harness.app.world().resource::<PixelOverlaySetupFailed>();
  assert_eq!(failed.0, OverlayError::UnknownGroup("pixels".into()));
}

#[test]
fn fixed_config_retries_failed_setup() {
  let config = PixelOverlayConfig {
    isolation_group: "pixels".into(),
    ..default()
  };
  let mut harness = TestHarness::new(config);
  assert!(harness.app.world().contains_resource::<PixelOverlaySetupFailed>());

  ReconfigureOverlay(PixelOverlayConfig::default()).apply(harness.app.world_mut());
  harness.run_frames(1);

  assert!(!harness.app.world().contains_resource::<PixelOverlaySetupFailed>());
  assert!(harness.app.world().contains_resource::<FrameOrchestrator>());
}

#[test]
fn setup_waits_for_primary_camera() {
  let mut app = App::new();
  app.add_plugins(MinimalPlugins);
  app.add_plugins(bevy::transform::TransformPlugin);
  app.add_plugins(bevy::asset::AssetPlugin::default());
  app.add_plugins(bevy::image::ImagePlugin::default());
  app.add_plugins(PixelOverlayPlugin::default());

  app.update();
  app.update();
  assert!(!app.world().contains_resource::<FrameOrchestrator>());

  let camera = app.world_mut().spawn((Camera2d, OverlayPrimaryCamera)).id();
  app.update();

  let orchestrator = app.world().resource::<FrameOrchestrator>();
  assert_eq!(orchestrator.pool().primary(), camera);
}

#[test]
fn tracked_entity_cycles_through_isolation_and_rests_in_standby() {
  let mut harness = TestHarness::new(PixelOverlayConfig::default());
  harness.set_viewport(800, 600);
  let sprite = harness.spawn_target(Vec3::ZERO, OverlayTarget::new());
  let child = harness.app.world_mut().spawn(Transform::default()).id();
  harness.app.world_mut().entity_mut(sprite).add_child(child);

  harness.run_frames(1);

  let orchestrator = harness.orchestrator();
  assert_eq!(orchestrator.tracked().len(), 1);
  assert_eq!(orchestrator.stats().completed, 1);
  assert_eq!(orchestrator.stats().aborted, 0);
  assert_eq!(harness.group(sprite), id(STANDBY));
  assert_eq!(harness.group(child), id(STANDBY), "subtree follows its root");

  let output = orchestrator.output().expect("cycle should produce output");
  assert_eq!(output.key, "overlay");
  assert_eq!(output.size, UVec2::new(800, 600));

  let camera = orchestrator.pool().camera("pixel_camera").unwrap();
  let mask = culling_mask(harness.app.world(), camera);
  assert_eq!(mask.iter().collect::<Vec<_>>(), vec![RenderGroupId::new(ISOLATION).unwrap()]);
}

#[test]
fn offscreen_cameras_are_reused_across_frames() {
  let mut harness = TestHarness::new(PixelOverlayConfig::default());
  harness.set_viewport(320, 240);
  harness.spawn_target(Vec3::ZERO, OverlayTarget::new());

  harness.run_frames(1);
  let first = harness.orchestrator().pool().camera("pixel_camera").unwrap();

  harness.run_frames(5);
  let later = harness.orchestrator().pool().camera("pixel_camera").unwrap();

  assert_eq!(first, later);
  let mut cameras = harness.app.world_mut().query::<&OffscreenCamera>();
  let count = cameras.iter(harness.app.world()).count();
  assert_eq!(count, 1);
  assert_eq!(harness.orchestrator().stats().completed, 6);

  // Inactive between cycles
  let camera = harness.app.world().get::<Camera>(later).unwrap();
  assert!(!camera.is_active);
}

#[test]
fn viewport_resize_reallocates_buffers() {
  let mut harness = TestHarness::new(PixelOverlayConfig::default());
  harness.set_viewport(800, 600);
  harness.spawn_target(Vec3::ZERO, OverlayTarget::new());
  harness.run_frames(1);

  let old = harness.orchestrator().buffers().get("pixel_camera").unwrap().clone();
  assert_eq!(old.size, UVec2::new(800, 600));

  harness.set_viewport(640, 480);
  harness.run_frames(1);

  let orchestrator = harness.orchestrator();
  let new = orchestrator.buffers().get("pixel_camera").unwrap();
  assert_eq!(new.size, UVec2::new(640, 480));
  assert_eq!(orchestrator.buffers().get("overlay").unwrap().size, UVec2::new(640, 480));
  assert_ne!(old.color, new.color);

  let images = harness.app.world().resource::<Assets<Image>>();
  assert!(images.get(&old.color).is_none(), "old buffer should be released");
  assert!(images.get(&new.color).is_some());
}

#[test]
fn aborted_cycle_restores_and_next_frame_recovers() {
  let mut harness = TestHarness::new(PixelOverlayConfig::default());
  harness.set_viewport(64, 64);
  let sprite = harness.spawn_target(Vec3::ZERO, OverlayTarget::new());
  harness.run_frames(1);

  harness
    .orchestrator_mut()
    .set_steps(vec![CompositeStep::new("missing", "overlay", Handle::default())]);
  harness.run_frames(1);

  {
    let orchestrator = harness.orchestrator();
    assert_eq!(orchestrator.stats().aborted, 1);
    assert_eq!(
      orchestrator.stats().last_error,
      Some(OverlayError::MissingBuffer("missing".into()))
    );
    assert!(orchestrator.buffers().is_stale("pixel_camera"));
  }
  assert_eq!(harness.group(sprite), id(STANDBY));
  let camera = harness.orchestrator().pool().camera("pixel_camera").unwrap();
  assert!(!harness.app.world().get::<Camera>(camera).unwrap().is_active);

  harness.orchestrator_mut().clear_steps();
  harness.run_frames(1);

  let orchestrator = harness.orchestrator();
  assert_eq!(orchestrator.stats().completed, 2);
  assert!(!orchestrator.buffers().is_stale("pixel_camera"));
}

#[test]
fn removing_target_returns_entity_to_default_group() {
  let mut harness = TestHarness::new(PixelOverlayConfig::default());
  harness.set_viewport(64, 64);
  let sprite = harness.spawn_target(Vec3::ZERO, OverlayTarget::new());
  harness.run_frames(2);
  assert_eq!(harness.group(sprite), id(STANDBY));

  harness
    .app
    .world_mut()
    .entity_mut(sprite)
    .remove::<OverlayTarget>();
  harness.run_frames(1);

  assert!(harness.orchestrator().tracked().is_empty());
  assert_eq!(harness.group(sprite), Some(RenderGroupId::DEFAULT));
}

#[test]
fn despawned_targets_are_dropped() {
  let mut harness = TestHarness::new(PixelOverlayConfig::default());
  harness.set_viewport(64, 64);
  let keep = harness.spawn_target(Vec3::ZERO, OverlayTarget::new());
  let gone = harness.spawn_target(Vec3::ZERO, OverlayTarget::new());
  harness.run_frames(1);
  assert_eq!(harness.orchestrator().tracked().len(), 2);

  harness.app.world_mut().despawn(gone);
  harness.run_frames(2);

  let orchestrator = harness.orchestrator();
  assert_eq!(orchestrator.stats().aborted, 0);
  let tracked: Vec<_> = orchestrator.tracked().iter().map(|t| t.entity).collect();
  assert_eq!(tracked, vec![keep]);
}

#[test]
fn mutate_transform_snaps_to_the_pixel_grid() {
  let config = PixelOverlayConfig {
    snap_policy: SnapPolicy::MutateTransform,
    ..default()
  };
  let mut harness = TestHarness::new(config);
  harness.set_viewport(800, 600);
  let start = Vec3::new(13.3, -21.7, 0.0);
  let sprite = harness.spawn_target(start, OverlayTarget::new());
  harness.run_frames(1);

  // Transform writes wait for a fixed tick
  harness.orchestrator_mut().tick(Duration::from_millis(16));
  harness.run_frames(1);

  let snapped = harness.app.world().get::<Transform>(sprite).unwrap().translation;
  // 2D camera at the origin: 1 world unit per pixel, 8 pixels per cell
  let cell_x = (snapped.x + 400.0) / 8.0;
  let cell_y = (snapped.y + 300.0) / 8.0;
  assert!((cell_x - cell_x.round()).abs() < 1e-3, "x not on grid: {snapped}");
  assert!((cell_y - cell_y.round()).abs() < 1e-3, "y not on grid: {snapped}");
  assert!((snapped.x - start.x).abs() < 8.0);
  assert!((snapped.y - start.y).abs() < 8.0);
  assert!(snapped.x <= start.x && snapped.y <= start.y, "snapping floors");

  // Already on the grid: further cycles keep it there
  harness.orchestrator_mut().tick(Duration::from_millis(16));
  harness.run_frames(1);
  let again = harness.app.world().get::<Transform>(sprite).unwrap().translation;
  assert!((again - snapped).length() < 1e-3);
}

#[test]
fn shader_parameter_policy_leaves_transforms_alone() {
  let mut harness = TestHarness::new(PixelOverlayConfig::default());
  harness.set_viewport(800, 600);
  let start = Vec3::new(13.3, -21.7, 0.0);
  let sprite = harness.spawn_target(start, OverlayTarget::new());

  harness.orchestrator_mut().tick(Duration::from_millis(16));
  harness.run_frames(2);

  let translation = harness.app.world().get::<Transform>(sprite).unwrap().translation;
  assert_eq!(translation, start);
}

#[test]
fn shutdown_degroups_and_releases_everything() {
  let mut harness = TestHarness::new(PixelOverlayConfig::default());
  harness.set_viewport(64, 64);
  let sprite = harness.spawn_target(Vec3::ZERO, OverlayTarget::new());
  harness.run_frames(2);
  let camera = harness.orchestrator().pool().camera("pixel_camera").unwrap();

  ShutdownOverlay.apply(harness.app.world_mut());

  let orchestrator = harness.orchestrator();
  assert!(orchestrator.pool().is_empty());
  assert!(orchestrator.buffers().is_empty());
  assert!(orchestrator.tracked().is_empty());
  assert_eq!(harness.group(sprite), Some(RenderGroupId::DEFAULT));
  assert!(harness.app.world().get_entity(camera).is_err());
}
