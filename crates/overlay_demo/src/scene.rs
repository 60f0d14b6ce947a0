//! Demo scene: a drifting camera over a checkerboard, with orbiting
//! characters and props rendered through the pixel overlay.

use bevy::prelude::*;
use bevy_pixel_overlay::{
  BlendMode, OverlayBlendMaterial, OverlayPrimaryCamera, OverlayTarget,
};

pub struct ScenePlugin;

impl Plugin for ScenePlugin {
  fn build(&self, app: &mut App) {
    app
      .add_systems(Startup, spawn_scene)
      .add_systems(Update, drift_camera)
      .add_systems(FixedUpdate, orbit);
  }
}

/// Moves in a circle around `center`.
#[derive(Component)]
struct Orbit {
  center: Vec2,
  radius: f32,
  speed: f32,
  phase: f32,
}

const TILE: f32 = 48.0;

fn spawn_scene(mut commands: Commands, mut materials: ResMut<Assets<OverlayBlendMaterial>>) {
  commands.spawn((Camera2d, OverlayPrimaryCamera));

  // Background stays in the main view
  for x in -12..12 {
    for y in -8..8 {
      let shade = if (x + y) % 2 == 0 { 0.18 } else { 0.24 };
      commands.spawn((
        Sprite::from_color(Color::srgb(shade, shade, shade + 0.04), Vec2::splat(TILE)),
        Transform::from_xyz(x as f32 * TILE, y as f32 * TILE, -10.0),
      ));
    }
  }

  let characters = [
    (Color::srgb(0.95, 0.35, 0.3), 0.0),
    (Color::srgb(0.3, 0.8, 0.45), 2.1),
    (Color::srgb(0.35, 0.5, 0.95), 4.2),
  ];
  for (color, phase) in characters {
    commands
      .spawn((
        Sprite::from_color(color, Vec2::new(36.0, 52.0)),
        Transform::default(),
        Orbit {
          center: Vec2::ZERO,
          radius: 140.0,
          speed: 0.6,
          phase,
        },
        OverlayTarget::new(),
      ))
      .with_children(|parent| {
        // Heads ride along into the same group
        parent.spawn((
          Sprite::from_color(color.lighter(0.2), Vec2::splat(20.0)),
          Transform::from_xyz(0.0, 36.0, 0.1),
        ));
      });
  }

  // A prop with its own blend material, composited above the characters
  let prop_material = materials.add(OverlayBlendMaterial::new(BlendMode::AlphaOver));
  commands.spawn((
    Sprite::from_color(Color::srgba(1.0, 0.85, 0.2, 0.8), Vec2::splat(64.0)),
    Transform::from_xyz(0.0, 0.0, 1.0),
    Orbit {
      center: Vec2::new(60.0, -40.0),
      radius: 60.0,
      speed: -1.3,
      phase: 0.0,
    },
    OverlayTarget::new()
      .in_group("props")
      .with_material(prop_material),
  ));
}

fn drift_camera(time: Res<Time>, mut cameras: Query<&mut Transform, With<OverlayPrimaryCamera>>) {
  let t = time.elapsed_secs();
  for mut transform in &mut cameras {
    transform.translation.x = (t * 0.25).sin() * 90.0;
    transform.translation.y = (t * 0.17).cos() * 40.0;
  }
}

fn orbit(time: Res<Time>, mut bodies: Query<(&Orbit, &mut Transform)>) {
  let t = time.elapsed_secs();
  for (orbit, mut transform) in &mut bodies {
    let angle = orbit.phase + t * orbit.speed;
    let offset = Vec2::from_angle(angle) * orbit.radius;
    let position = orbit.center + offset;
    transform.translation.x = position.x;
    transform.translation.y = position.y;
  }
}
