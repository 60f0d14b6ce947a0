//! Render groups: named render layers with 32-bit culling masks.
//!
//! A render group is a Bevy render layer in `0..32`. Group 0 is "default",
//! the layer Bevy draws entities without an explicit `RenderLayers` on.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use bevy::camera::visibility::RenderLayers;
use bevy::prelude::*;

use crate::config::{DEFAULT_GROUP, PixelOverlayConfig};
use crate::error::{OverlayError, OverlayResult};

/// Number of distinct render groups (fixed-width mask).
pub const MAX_GROUPS: usize = 32;

/// Identifier of a render group, always in `0..32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderGroupId(u8);

impl RenderGroupId {
  /// The group every entity starts in.
  pub const DEFAULT: Self = Self(0);

  /// Returns `None` when `id` does not fit the mask.
  pub const fn new(id: u8) -> Option<Self> {
    if (id as usize) < MAX_GROUPS {
      Some(Self(id))
    } else {
      None
    }
  }

  /// The render layer index.
  #[inline]
  pub const fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for RenderGroupId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "group {}", self.0)
  }
}

/// Bitmask over render groups. Bit `n` admits group `n`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GroupMask(pub u32);

impl GroupMask {
  pub const NONE: Self = Self(0);
  pub const ALL: Self = Self(u32::MAX);

  /// Mask admitting a single group.
  #[inline]
  pub const fn single(id: RenderGroupId) -> Self {
    Self(1 << id.0)
  }

  #[inline]
  pub const fn contains(self, id: RenderGroupId) -> bool {
    self.0 & (1 << id.0) != 0
  }

  /// Groups admitted by this mask, lowest first.
  pub fn iter(self) -> impl Iterator<Item = RenderGroupId> {
    (0..MAX_GROUPS as u8)
      .map(RenderGroupId)
      .filter(move |id| self.contains(*id))
  }

  /// Converts to the Bevy render layers a camera culls with.
  pub fn to_render_layers(self) -> RenderLayers {
    self.iter().map(RenderGroupId::index).collect()
  }

  /// Reads the low 32 layers of `layers` back into a mask.
  pub fn from_render_layers(layers: &RenderLayers) -> Self {
    let bits = layers
      .iter()
      .filter(|layer| *layer < MAX_GROUPS)
      .fold(0u32, |acc, layer| acc | (1 << layer));
    Self(bits)
  }
}

impl BitAnd for GroupMask {
  type Output = Self;

  fn bitand(self, rhs: Self) -> Self {
    Self(self.0 & rhs.0)
  }
}

impl BitOr for GroupMask {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

impl Not for GroupMask {
  type Output = Self;

  fn not(self) -> Self {
    Self(!self.0)
  }
}

/// Maps group names to ids. Read-only after construction.
#[derive(Resource, Clone, Debug)]
pub struct RenderGroupRegistry {
  by_name: HashMap<String, RenderGroupId>,
  names: [Option<String>; MAX_GROUPS],
}

impl RenderGroupRegistry {
  /// Builds a registry from `(name, id)` pairs. "default" is added as id 0
  /// unless listed explicitly.
  pub fn new<'a>(groups: impl IntoIterator<Item = (&'a str, u8)>) -> OverlayResult<Self> {
    let mut registry = Self {
      by_name: HashMap::new(),
      names: std::array::from_fn(|_| None),
    };

    let mut has_default = false;
    for (name, id) in groups {
      has_default |= name == DEFAULT_GROUP;
      registry.insert(name, id)?;
    }
    if !has_default {
      registry.insert(DEFAULT_GROUP, 0)?;
    }

    Ok(registry)
  }

  /// Builds the registry from the `[groups]` table and checks that every
  /// group the configuration mentions exists.
  pub fn from_config(config: &PixelOverlayConfig) -> OverlayResult<Self> {
    let registry = Self::new(config.groups.iter().map(|(name, id)| (name.as_str(), *id)))?;

    registry.resolve(&config.isolation_group)?;
    registry.resolve(&config.standby_group)?;
    for camera in &config.isolation_cameras {
      registry.resolve(&camera.group)?;
    }

    Ok(registry)
  }

  fn insert(&mut self, name: &str, id: u8) -> OverlayResult<()> {
    let Some(group) = RenderGroupId::new(id) else {
      return Err(OverlayError::InvalidConfig(format!(
        "group '{name}' has id {id}, ids must be below {MAX_GROUPS}"
      )));
    };
    if self.by_name.contains_key(name) {
      return Err(OverlayError::InvalidConfig(format!(
        "group '{name}' is defined twice"
      )));
    }
    if let Some(existing) = &self.names[group.index()] {
      return Err(OverlayError::InvalidConfig(format!(
        "groups '{existing}' and '{name}' share id {id}"
      )));
    }

    self.by_name.insert(name.to_string(), group);
    self.names[group.index()] = Some(name.to_string());
    Ok(())
  }

  /// Looks up a group by name.
  pub fn resolve(&self, name: &str) -> OverlayResult<RenderGroupId> {
    self
      .by_name
      .get(name)
      .copied()
      .ok_or_else(|| OverlayError::UnknownGroup(name.to_string()))
  }

  /// Name a group was registered under.
  pub fn name_of(&self, id: RenderGroupId) -> Option<&str> {
    self.names[id.index()].as_deref()
  }

  /// Mask admitting only `id`.
  #[inline]
  pub fn mask_of(&self, id: RenderGroupId) -> GroupMask {
    GroupMask::single(id)
  }

  /// Mask admitting everything except `id`.
  #[inline]
  pub fn mask_excluding(&self, id: RenderGroupId) -> GroupMask {
    !GroupMask::single(id)
  }

  /// Intersection of [`Self::mask_excluding`] over `ids`.
  pub fn mask_excluding_all(&self, ids: impl IntoIterator<Item = RenderGroupId>) -> GroupMask {
    ids
      .into_iter()
      .fold(GroupMask::ALL, |mask, id| mask & self.mask_excluding(id))
  }

  /// Number of registered groups.
  pub fn len(&self) -> usize {
    self.by_name.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_name.is_empty()
  }
}
