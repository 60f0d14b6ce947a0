//! Pixel Overlay - pixel-art render-to-texture compositing for Bevy.
//!
//! Entities marked with [`OverlayTarget`] are rendered by offscreen cameras
//! into their own buffers, snapped to a coarse pixel grid and composited into
//! an overlay drawn over the main view.

pub mod buffers;
pub mod camera_pool;
pub mod composite;
pub mod config;
pub mod error;
pub mod groups;
pub mod orchestrator;
pub mod partition;
pub mod plugin;
pub mod snap;

pub use buffers::{FrameBuffer, FrameBufferManager};
pub use camera_pool::{ClearPolicy, OffscreenCamera, OffscreenCameraPool};
pub use composite::{
  BlendMode, CompositeBackend, CompositeStep, Compositor, OverlayBlendMaterial,
  OverlayBlendUniforms,
};
pub use config::{IsolationCameraConfig, PixelOverlayConfig};
pub use error::{OverlayError, OverlayResult};
pub use groups::{GroupMask, RenderGroupId, RenderGroupRegistry};
pub use orchestrator::{FramePhase, FrameOrchestrator, FrameStats, OverlayTarget, TrackedEntity};
pub use partition::{SceneHierarchy, group_of, set_group, set_group_all};
pub use plugin::{
  OverlayBackend, OverlayPrimaryCamera, PixelOverlayPlugin, PixelOverlaySet,
  PixelOverlaySetupFailed, ReconfigureOverlay, ShutdownOverlay,
};
pub use snap::{GridResolution, SnapPolicy, SnappedPosition, ViewProjector, snap};
