//! Off-screen render targets keyed by name and sized to the viewport.
//!
//! Buffers are `Image` assets usable as camera render targets. They keep a
//! CPU-side copy (`MAIN_WORLD | RENDER_WORLD`) so the CPU compositor can read
//! and write them when no GPU is present.

use std::collections::HashMap;

use bevy::asset::RenderAssetUsages;
use bevy::image::ImageSampler;
use bevy::prelude::*;
use bevy::render::render_resource::{Extent3d, TextureDimension, TextureFormat, TextureUsages};

use crate::error::{OverlayError, OverlayResult};

/// Largest buffer edge we will allocate (wgpu's default 2D texture limit).
pub const MAX_BUFFER_DIMENSION: u32 = 8192;

/// Colour channel format of every buffer.
pub const COLOR_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// Depth channel format used when depth-aware compositing is enabled.
///
/// Holds linear view distance; smaller is nearer.
pub const DEFAULT_DEPTH_FORMAT: TextureFormat = TextureFormat::R32Float;

/// Colour a buffer is cleared to: transparent black.
pub const CLEAR_COLOR: [u8; 4] = [0, 0, 0, 0];

/// A render target owned by [`FrameBufferManager`].
///
/// Cloning copies the handles, not the image data.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameBuffer {
  pub key: String,
  pub color: Handle<Image>,
  pub depth: Option<Handle<Image>>,
  pub size: UVec2,
  pub depth_format: Option<TextureFormat>,
}

struct Entry {
  buffer: FrameBuffer,
  stale: bool,
}

/// Owns every overlay buffer.
///
/// At most one live buffer exists per key. A buffer whose size no longer
/// matches the request is released before its replacement is allocated.
#[derive(Default)]
pub struct FrameBufferManager {
  buffers: HashMap<String, Entry>,
}

impl FrameBufferManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the buffer for `key` at exactly `width x height`.
  ///
  /// Reuses the live buffer when size and depth format match; a stale one is
  /// cleared first. Otherwise the old buffer is released and a new one is
  /// allocated.
  pub fn get_or_create(
    &mut self,
    images: &mut Assets<Image>,
    key: &str,
    width: u32,
    height: u32,
    depth_format: Option<TextureFormat>,
  ) -> OverlayResult<FrameBuffer> {
    check_allocation(key, width, height, depth_format)?;
    let size = UVec2::new(width, height);

    if let Some(entry) = self.buffers.get_mut(key) {
      if entry.buffer.size == size && entry.buffer.depth_format == depth_format {
        if entry.stale {
          clear_buffer(images, &entry.buffer);
          entry.stale = false;
        }
        return Ok(entry.buffer.clone());
      }
    }

    if let Some(old) = self.buffers.remove(key) {
      debug!(
        "Overlay buffer '{}' resized {}x{} -> {}x{}",
        key, old.buffer.size.x, old.buffer.size.y, width, height
      );
      release_buffer(images, &old.buffer);
    }

    let buffer = FrameBuffer {
      key: key.to_string(),
      color: images.add(create_target_image(COLOR_FORMAT, size, &CLEAR_COLOR)),
      depth: depth_format.map(|format| images.add(create_target_image(format, size, &far(format)))),
      size,
      depth_format,
    };

    self.buffers.insert(
      key.to_string(),
      Entry {
        buffer: buffer.clone(),
        stale: false,
      },
    );
    Ok(buffer)
  }

  /// Live buffer for `key`, if any.
  pub fn get(&self, key: &str) -> Option<&FrameBuffer> {
    self.buffers.get(key).map(|entry| &entry.buffer)
  }

  /// Whether the buffer for `key` holds contents from an aborted cycle.
  pub fn is_stale(&self, key: &str) -> bool {
    self.buffers.get(key).is_some_and(|entry| entry.stale)
  }

  /// Marks every buffer's contents as invalid.
  ///
  /// Stale buffers are cleared on their next [`Self::get_or_create`].
  pub fn invalidate_all(&mut self) {
    for entry in self.buffers.values_mut() {
      entry.stale = true;
    }
  }

  /// Releases the buffer for `key`. Returns false if there was none.
  pub fn release(&mut self, images: &mut Assets<Image>, key: &str) -> bool {
    match self.buffers.remove(key) {
      Some(entry) => {
        release_buffer(images, &entry.buffer);
        true
      }
      None => false,
    }
  }

  /// Releases every buffer.
  pub fn release_all(&mut self, images: &mut Assets<Image>) {
    for (_, entry) in self.buffers.drain() {
      release_buffer(images, &entry.buffer);
    }
  }

  pub fn len(&self) -> usize {
    self.buffers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buffers.is_empty()
  }
}

fn check_allocation(
  key: &str,
  width: u32,
  height: u32,
  depth_format: Option<TextureFormat>,
) -> OverlayResult<()> {
  let fail = |reason: String| OverlayError::AllocationFailure {
    key: key.to_string(),
    reason,
  };

  if width == 0 || height == 0 {
    return Err(fail(format!("zero-sized buffer {width}x{height}")));
  }
  if width > MAX_BUFFER_DIMENSION || height > MAX_BUFFER_DIMENSION {
    return Err(fail(format!(
      "{width}x{height} exceeds the {MAX_BUFFER_DIMENSION} texel limit"
    )));
  }
  if let Some(format) = depth_format {
    if format.is_depth_stencil_format() || texel_size(format).is_none() {
      return Err(fail(format!("{format:?} cannot be used as a depth channel")));
    }
  }
  Ok(())
}

/// Bytes per texel for uncompressed single-aspect formats.
fn texel_size(format: TextureFormat) -> Option<usize> {
  if format.block_dimensions() != (1, 1) {
    return None;
  }
  format.block_copy_size(None).map(|size| size as usize)
}

/// Texel value meaning "nothing drawn here" for a depth channel.
pub(crate) fn far(format: TextureFormat) -> Vec<u8> {
  match format {
    TextureFormat::R32Float => f32::MAX.to_le_bytes().to_vec(),
    other => vec![0; texel_size(other).unwrap_or(4)],
  }
}

fn create_target_image(format: TextureFormat, size: UVec2, fill: &[u8]) -> Image {
  let mut image = Image::new_fill(
    Extent3d {
      width: size.x,
      height: size.y,
      depth_or_array_layers: 1,
    },
    TextureDimension::D2,
    fill,
    format,
    RenderAssetUsages::MAIN_WORLD | RenderAssetUsages::RENDER_WORLD,
  );
  image.texture_descriptor.label = Some("pixel_overlay_buffer");
  image.texture_descriptor.usage = TextureUsages::TEXTURE_BINDING
    | TextureUsages::COPY_DST
    | TextureUsages::COPY_SRC
    | TextureUsages::RENDER_ATTACHMENT;
  // Overlay pixels must stay crisp when sampled
  image.sampler = ImageSampler::nearest();
  image
}

/// Fills every texel of `image` with `texel`.
pub(crate) fn fill_image(image: &mut Image, texel: &[u8]) {
  if let Some(ref mut data) = image.data {
    for chunk in data.chunks_exact_mut(texel.len()) {
      chunk.copy_from_slice(texel);
    }
  }
}

/// Clears colour to transparent black and depth to far.
pub(crate) fn clear_buffer(images: &mut Assets<Image>, buffer: &FrameBuffer) {
  if let Some(image) = images.get_mut(&buffer.color) {
    fill_image(image, &CLEAR_COLOR);
  }
  if let (Some(depth), Some(format)) = (&buffer.depth, buffer.depth_format) {
    if let Some(image) = images.get_mut(depth) {
      fill_image(image, &far(format));
    }
  }
}

fn release_buffer(images: &mut Assets<Image>, buffer: &FrameBuffer) {
  images.remove(&buffer.color);
  if let Some(depth) = &buffer.depth {
    images.remove(depth);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn same_size_reuses_buffer() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    let first = manager
      .get_or_create(&mut images, "overlay", 800, 600, None)
      .unwrap();
    let second = manager
      .get_or_create(&mut images, "overlay", 800, 600, None)
      .unwrap();

    assert_eq!(first, second);
    assert_eq!(manager.len(), 1);
    assert_eq!(images.len(), 1);
  }

  #[test]
  fn resize_releases_old_buffer_first() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    let small = manager
      .get_or_create(&mut images, "overlay", 800, 600, None)
      .unwrap();
    let large = manager
      .get_or_create(&mut images, "overlay", 1920, 1080, None)
      .unwrap();

    assert_ne!(small.color, large.color);
    assert!(images.get(&small.color).is_none());
    assert_eq!(images.len(), 1);
    assert_eq!(large.size, UVec2::new(1920, 1080));
    let image = images.get(&large.color).unwrap();
    assert_eq!(image.width(), 1920);
    assert_eq!(image.height(), 1080);
  }

  #[test]
  fn shrinking_viewport_yields_new_size() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    manager
      .get_or_create(&mut images, "pixel_camera", 800, 600, None)
      .unwrap();
    let buffer = manager
      .get_or_create(&mut images, "pixel_camera", 640, 480, None)
      .unwrap();

    assert_eq!(buffer.size, UVec2::new(640, 480));
    assert_eq!(images.get(&buffer.color).unwrap().width(), 640);
  }

  #[test]
  fn depth_channel_starts_far() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    let buffer = manager
      .get_or_create(&mut images, "overlay", 4, 2, Some(DEFAULT_DEPTH_FORMAT))
      .unwrap();

    let depth = images.get(buffer.depth.as_ref().unwrap()).unwrap();
    let data = depth.data.as_ref().unwrap();
    assert_eq!(data.len(), 4 * 2 * 4);
    for texel in data.chunks_exact(4) {
      assert_eq!(f32::from_le_bytes(texel.try_into().unwrap()), f32::MAX);
    }
  }

  #[test]
  fn changing_depth_format_reallocates() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    let plain = manager
      .get_or_create(&mut images, "overlay", 16, 16, None)
      .unwrap();
    let deep = manager
      .get_or_create(&mut images, "overlay", 16, 16, Some(DEFAULT_DEPTH_FORMAT))
      .unwrap();

    assert_ne!(plain.color, deep.color);
    assert!(deep.depth.is_some());
    assert_eq!(images.len(), 2);
  }

  #[test]
  fn invalid_sizes_fail_allocation() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    for (width, height) in [(0, 600), (800, 0), (MAX_BUFFER_DIMENSION + 1, 16)] {
      assert!(matches!(
        manager.get_or_create(&mut images, "overlay", width, height, None),
        Err(OverlayError::AllocationFailure { .. })
      ));
    }
    assert!(manager.is_empty());
  }

  #[test]
  fn depth_stencil_format_is_rejected() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    assert!(matches!(
      manager.get_or_create(
        &mut images,
        "overlay",
        8,
        8,
        Some(TextureFormat::Depth24PlusStencil8)
      ),
      Err(OverlayError::AllocationFailure { .. })
    ));
  }

  #[test]
  fn stale_buffer_is_cleared_on_reuse() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    let buffer = manager
      .get_or_create(&mut images, "overlay", 2, 2, None)
      .unwrap();
    fill_image(images.get_mut(&buffer.color).unwrap(), &[255, 0, 0, 255]);

    manager.invalidate_all();
    assert!(manager.is_stale("overlay"));
    let reused = manager
      .get_or_create(&mut images, "overlay", 2, 2, None)
      .unwrap();

    assert_eq!(reused.color, buffer.color);
    assert!(!manager.is_stale("overlay"));
    let data = images.get(&reused.color).unwrap().data.as_ref().unwrap();
    assert!(data.iter().all(|byte| *byte == 0));
  }

  #[test]
  fn release_all_removes_assets() {
    let mut images = Assets::<Image>::default();
    let mut manager = FrameBufferManager::new();

    manager
      .get_or_create(&mut images, "a", 8, 8, Some(DEFAULT_DEPTH_FORMAT))
      .unwrap();
    manager.get_or_create(&mut images, "b", 8, 8, None).unwrap();
    assert_eq!(images.len(), 3);

    manager.release_all(&mut images);

    assert!(manager.is_empty());
    assert_eq!(images.len(), 0);
  }
}
