//! Error kinds for the overlay pipeline.

use std::fmt;

use bevy::prelude::Entity;

/// Errors raised by the overlay pipeline.
///
/// Configuration errors are fatal at setup (see [`OverlayError::is_fatal`]).
/// Everything else aborts the current frame cycle only.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayError {
  /// A render group name is not configured.
  UnknownGroup(String),
  /// A subtree operation reached the same node twice.
  CyclicHierarchy { root: String, node: String },
  /// A buffer is already bound to a different camera this frame.
  BufferCameraMismatch {
    buffer: String,
    bound: Entity,
    requested: Entity,
  },
  /// A snapping grid with a zero dimension.
  DegenerateGrid { width: u32, height: u32 },
  /// A buffer could not be allocated.
  AllocationFailure { key: String, reason: String },
  /// No usable reference camera to clone.
  MissingPrimaryCamera,
  /// The entity does not exist in the hierarchy.
  MissingEntity(String),
  /// No live buffer for the key.
  MissingBuffer(String),
  /// A composite step that would read the buffer it writes, or an empty plan.
  InvalidCompositeStep(String),
  /// Source and target of a composite step have different sizes.
  BufferSizeMismatch {
    source: String,
    target: String,
    source_size: (u32, u32),
    target_size: (u32, u32),
  },
  /// The configuration cannot be used.
  InvalidConfig(String),
}

impl OverlayError {
  /// Returns true for configuration errors that prevent the system from
  /// starting.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Self::UnknownGroup(_)
        | Self::MissingPrimaryCamera
        | Self::DegenerateGrid { .. }
        | Self::InvalidConfig(_)
    )
  }
}

impl fmt::Display for OverlayError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::UnknownGroup(name) => write!(f, "unknown render group '{name}'"),
      Self::CyclicHierarchy { root, node } => {
        write!(f, "cyclic hierarchy below {root}: {node} reached twice")
      }
      Self::BufferCameraMismatch {
        buffer,
        bound,
        requested,
      } => write!(
        f,
        "buffer '{buffer}' is bound to camera {bound} this frame, cannot bind to {requested}"
      ),
      Self::DegenerateGrid { width, height } => {
        write!(f, "degenerate pixel grid {width}x{height}")
      }
      Self::AllocationFailure { key, reason } => {
        write!(f, "failed to allocate buffer '{key}': {reason}")
      }
      Self::MissingPrimaryCamera => write!(f, "no primary camera to clone"),
      Self::MissingEntity(entity) => write!(f, "entity {entity} does not exist"),
      Self::MissingBuffer(key) => write!(f, "no buffer named '{key}'"),
      Self::InvalidCompositeStep(reason) => write!(f, "invalid composite step: {reason}"),
      Self::BufferSizeMismatch {
        source,
        target,
        source_size,
        target_size,
      } => write!(
        f,
        "buffer '{source}' is {}x{} but '{target}' is {}x{}",
        source_size.0, source_size.1, target_size.0, target_size.1
      ),
      Self::InvalidConfig(reason) => write!(f, "invalid overlay config: {reason}"),
    }
  }
}

impl std::error::Error for OverlayError {}

/// Result alias used throughout the crate.
pub type OverlayResult<T> = Result<T, OverlayError>;
