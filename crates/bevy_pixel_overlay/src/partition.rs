//! Moves entities and their subtrees between render groups.
//!
//! Works over any [`SceneHierarchy`]; the Bevy [`World`] implementation reads
//! `Children` and writes `RenderLayers` directly, so a change is visible to
//! the renderer immediately.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use bevy::camera::visibility::RenderLayers;
use bevy::prelude::*;

use crate::error::{OverlayError, OverlayResult};
use crate::groups::RenderGroupId;

/// A tree of nodes carrying a render group tag.
pub trait SceneHierarchy {
  type Node: Copy + Eq + Hash + Debug;

  /// Whether `node` exists.
  fn contains(&self, node: Self::Node) -> bool;

  /// Direct children of `node`, in order.
  fn children(&self, node: Self::Node) -> Vec<Self::Node>;

  /// Current group of `node`, `None` if it is missing or spans several groups.
  fn group(&self, node: Self::Node) -> Option<RenderGroupId>;

  /// Overwrites the group tag of `node` alone.
  fn set_group_tag(&mut self, node: Self::Node, group: RenderGroupId);
}

impl SceneHierarchy for World {
  type Node = Entity;

  fn contains(&self, node: Entity) -> bool {
    self.get_entity(node).is_ok()
  }

  fn children(&self, node: Entity) -> Vec<Entity> {
    self
      .get::<Children>(node)
      .map(|children| children.to_vec())
      .unwrap_or_default()
  }

  fn group(&self, node: Entity) -> Option<RenderGroupId> {
    if !self.contains(node) {
      return None;
    }
    // No RenderLayers means Bevy's default layer 0
    let Some(layers) = self.get::<RenderLayers>(node) else {
      return Some(RenderGroupId::DEFAULT);
    };
    let mut iter = layers.iter();
    let first = iter.next()?;
    if iter.next().is_some() {
      return None;
    }
    u8::try_from(first).ok().and_then(RenderGroupId::new)
  }

  fn set_group_tag(&mut self, node: Entity, group: RenderGroupId) {
    if let Ok(mut entity) = self.get_entity_mut(node) {
      entity.insert(RenderLayers::layer(group.index()));
    }
  }
}

/// Collects `root` and its descendants depth-first, failing on revisits.
fn collect_subtree<H: SceneHierarchy + ?Sized>(
  scene: &H,
  root: H::Node,
) -> OverlayResult<Vec<H::Node>> {
  if !scene.contains(root) {
    return Err(OverlayError::MissingEntity(format!("{root:?}")));
  }

  let mut visited = HashSet::new();
  let mut order = Vec::new();
  let mut stack = vec![root];

  while let Some(node) = stack.pop() {
    if !visited.insert(node) {
      return Err(OverlayError::CyclicHierarchy {
        root: format!("{root:?}"),
        node: format!("{node:?}"),
      });
    }
    order.push(node);

    // Reverse so the first child is visited first
    stack.extend(scene.children(node).into_iter().rev());
  }

  Ok(order)
}

/// Puts `root` and its entire subtree into `group`.
///
/// The subtree is walked before anything is written, so a cyclic hierarchy
/// fails with [`OverlayError::CyclicHierarchy`] without touching any node.
/// Returns the number of nodes tagged.
pub fn set_group<H: SceneHierarchy + ?Sized>(
  scene: &mut H,
  root: H::Node,
  group: RenderGroupId,
) -> OverlayResult<usize> {
  let nodes = collect_subtree(scene, root)?;
  for node in &nodes {
    scene.set_group_tag(*node, group);
  }
  Ok(nodes.len())
}

/// Applies [`set_group`] to each root in turn.
///
/// Not atomic: on failure, roots before the failing one stay updated.
pub fn set_group_all<H: SceneHierarchy + ?Sized>(
  scene: &mut H,
  roots: impl IntoIterator<Item = H::Node>,
  group: RenderGroupId,
) -> OverlayResult<usize> {
  let mut total = 0;
  for root in roots {
    total += set_group(scene, root, group)?;
  }
  Ok(total)
}

/// Group of a single node.
pub fn group_of<H: SceneHierarchy + ?Sized>(scene: &H, node: H::Node) -> Option<RenderGroupId> {
  scene.group(node)
}
