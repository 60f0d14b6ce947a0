//! Configuration for the pixel overlay.
//!
//! Loaded from TOML. Every field has a default, so an empty document is a
//! valid configuration:
//!
//! ```toml
//! box_size = 8
//! depth_aware = false
//! snap_policy = "shader_parameter"
//!
//! [groups]
//! isolation = 30
//! standby = 31
//!
//! [[isolation_cameras]]
//! tag = "pixel_camera"
//! group = "isolation"
//! display_index = 1
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, OverlayResult};
use crate::snap::SnapPolicy;

/// Name of the implicit group every entity starts in.
pub const DEFAULT_GROUP: &str = "default";

/// Default pixel box size in screen pixels.
pub const DEFAULT_BOX_SIZE: u32 = 8;

/// One isolation camera: renders exactly one group into its own buffer.
///
/// The camera tag doubles as the key of the buffer it renders into.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IsolationCameraConfig {
  pub tag: String,
  pub group: String,
  #[serde(default = "default_display_index")]
  pub display_index: u8,
}

fn default_display_index() -> u8 {
  1
}

impl Default for IsolationCameraConfig {
  fn default() -> Self {
    Self {
      tag: "pixel_camera".to_string(),
      group: "isolation".to_string(),
      display_index: default_display_index(),
    }
  }
}

/// Configuration for [`crate::PixelOverlayPlugin`].
#[derive(Asset, TypePath, Resource, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PixelOverlayConfig {
  /// Size of one overlay pixel, in screen pixels.
  pub box_size: u32,

  /// Explicit snapping grid `[width, height]` in cells.
  /// When absent the grid is derived from the viewport and `box_size`.
  pub grid: Option<[u32; 2]>,

  /// Group tracked entities are moved into while being rendered.
  pub isolation_group: String,

  /// Group tracked entities rest in between cycles (hidden everywhere).
  pub standby_group: String,

  /// Key of the buffer composite steps draw into.
  pub overlay_buffer: String,

  /// Allocate depth channels and composite with the depth-nearer operator.
  pub depth_aware: bool,

  /// Snap write-back policy for targets that do not choose their own.
  pub snap_policy: SnapPolicy,

  /// Draw the composited overlay over the primary window.
  pub present: bool,

  /// Render group ids by name. "default" (id 0) is always present.
  pub groups: BTreeMap<String, u8>,

  /// Isolation cameras, in composite z-order (later draws over earlier).
  pub isolation_cameras: Vec<IsolationCameraConfig>,
}

impl Default for PixelOverlayConfig {
  fn default() -> Self {
    let mut groups = BTreeMap::new();
    groups.insert("isolation".to_string(), 30);
    groups.insert("standby".to_string(), 31);

    Self {
      box_size: DEFAULT_BOX_SIZE,
      grid: None,
      isolation_group: "isolation".to_string(),
      standby_group: "standby".to_string(),
      overlay_buffer: "overlay".to_string(),
      depth_aware: false,
      snap_policy: SnapPolicy::ShaderParameter,
      present: true,
      groups,
      isolation_cameras: vec![IsolationCameraConfig::default()],
    }
  }
}

impl PixelOverlayConfig {
  /// Parses a configuration from TOML and validates it.
  pub fn from_toml_str(contents: &str) -> OverlayResult<Self> {
    let config: Self =
      toml::from_str(contents).map_err(|e| OverlayError::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Reads and parses a configuration file.
  pub fn load(path: impl AsRef<Path>) -> OverlayResult<Self> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
      .map_err(|e| OverlayError::InvalidConfig(format!("{}: {e}", path.display())))?;
    Self::from_toml_str(&contents)
  }

  /// Serializes the configuration to pretty TOML.
  pub fn to_toml_string(&self) -> OverlayResult<String> {
    toml::to_string_pretty(self).map_err(|e| OverlayError::InvalidConfig(e.to_string()))
  }

  /// Checks the settings that do not need the group registry.
  ///
  /// Group names are resolved by [`crate::RenderGroupRegistry::from_config`].
  pub fn validate(&self) -> OverlayResult<()> {
    if self.box_size == 0 {
      return Err(OverlayError::DegenerateGrid {
        width: 0,
        height: 0,
      });
    }
    if let Some([width, height]) = self.grid {
      if width == 0 || height == 0 {
        return Err(OverlayError::DegenerateGrid { width, height });
      }
    }
    if self.isolation_cameras.is_empty() {
      return Err(OverlayError::InvalidConfig(
        "at least one isolation camera is required".into(),
      ));
    }

    let mut tags = HashSet::new();
    for camera in &self.isolation_cameras {
      if !tags.insert(camera.tag.as_str()) {
        return Err(OverlayError::InvalidConfig(format!(
          "duplicate isolation camera tag '{}'",
          camera.tag
        )));
      }
    }
    if tags.contains(self.overlay_buffer.as_str()) {
      return Err(OverlayError::InvalidConfig(format!(
        "overlay buffer '{}' collides with an isolation camera buffer",
        self.overlay_buffer
      )));
    }
    if self.isolation_group == self.standby_group {
      return Err(OverlayError::InvalidConfig(
        "isolation and standby groups must differ".into(),
      ));
    }
    Ok(())
  }
}
