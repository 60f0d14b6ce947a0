use bevy::{asset::AssetEvent, ecs::message::MessageReader, prelude::*};
use bevy_common_assets::toml::TomlAssetPlugin;
use bevy_pixel_overlay::{PixelOverlayConfig, ReconfigureOverlay};

use crate::CliOverrides;

/// Hot-reloads `assets/config/overlay.config.toml` into the running overlay.
pub struct ConfigReloadPlugin;

#[derive(Resource)]
struct ConfigHandle(Handle<PixelOverlayConfig>);

impl Plugin for ConfigReloadPlugin {
  fn build(&self, app: &mut App) {
    app
      .add_plugins(TomlAssetPlugin::<PixelOverlayConfig>::new(&["config.toml"]))
      .add_systems(Startup, load_config_handle)
      .add_systems(Update, watch_config_changes);
  }
}

fn load_config_handle(mut commands: Commands, asset_server: Res<AssetServer>) {
  let handle: Handle<PixelOverlayConfig> = asset_server.load("config/overlay.config.toml");
  commands.insert_resource(ConfigHandle(handle));
}

fn watch_config_changes(
  mut commands: Commands,
  config_handle: Option<Res<ConfigHandle>>,
  overrides: Res<CliOverrides>,
  mut messages: MessageReader<AssetEvent<PixelOverlayConfig>>,
  configs: Res<Assets<PixelOverlayConfig>>,
) {
  let Some(config_handle) = config_handle else {
    return;
  };
  for event in messages.read() {
    if let AssetEvent::Modified { id } = event {
      if config_handle.0.id() == *id {
        if let Some(config) = configs.get(&config_handle.0) {
          info!("Overlay config reloaded");
          commands.queue(ReconfigureOverlay(overrides.apply(config.clone())));
        }
      }
    }
  }
}
