mod config;
mod scene;

use std::path::PathBuf;

use bevy::prelude::*;
use bevy_pixel_overlay::{PixelOverlayConfig, PixelOverlayPlugin, SnapPolicy};
use clap::Parser;

const DEFAULT_CONFIG: &str = "assets/config/overlay.config.toml";

/// Pixel-art overlay over a scrolling 2D scene.
#[derive(Parser, Debug, Clone)]
#[command(name = "overlay_demo")]
struct Cli {
  /// Overlay config file (hot reload only applies to the default one)
  #[arg(long)]
  config: Option<PathBuf>,

  /// Size of one overlay pixel in screen pixels
  #[arg(long)]
  box_size: Option<u32>,

  /// Composite with per-pixel depth instead of draw order
  #[arg(long)]
  depth_aware: bool,

  /// Snap entity transforms instead of only the shader anchor
  #[arg(long)]
  mutate_transforms: bool,
}

/// Command-line settings that win over the config file, reloads included.
#[derive(Resource, Clone, Debug)]
pub struct CliOverrides {
  box_size: Option<u32>,
  depth_aware: bool,
  mutate_transforms: bool,
}

impl CliOverrides {
  pub fn apply(&self, mut config: PixelOverlayConfig) -> PixelOverlayConfig {
    if let Some(box_size) = self.box_size {
      config.box_size = box_size;
    }
    if self.depth_aware {
      config.depth_aware = true;
    }
    if self.mutate_transforms {
      config.snap_policy = SnapPolicy::MutateTransform;
    }
    config
  }
}

fn main() {
  let cli = Cli::parse();
  let overrides = CliOverrides {
    box_size: cli.box_size,
    depth_aware: cli.depth_aware,
    mutate_transforms: cli.mutate_transforms,
  };

  let path = cli.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
  let config = match PixelOverlayConfig::load(&path) {
    Ok(config) => overrides.apply(config),
    Err(err) => {
      eprintln!("overlay_demo: {err}");
      std::process::exit(2);
    }
  };

  let mut app = App::new();

  app.insert_resource(Time::<Fixed>::from_hz(60.0));

  app
    .add_plugins(
      DefaultPlugins
        .set(ImagePlugin::default_nearest())
        .set(WindowPlugin {
          primary_window: Some(Window {
            title: "Pixel Overlay".to_string(),
            ..default()
          }),
          ..default()
        }),
    )
    .add_plugins(PixelOverlayPlugin::new(config))
    .insert_resource(overrides)
    .add_plugins(scene::ScenePlugin);

  if cli.config.is_none() {
    app.add_plugins(config::ConfigReloadPlugin);
  }

  app.run();
}
