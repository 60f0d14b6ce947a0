//! Reference blender over the CPU-side copies of the buffers.
//!
//! Mirrors what the GPU path produces: hardware alpha blending into a
//! transparent-cleared sRGB target, pixelation around the snapped anchor,
//! and a per-texel depth test for [`BlendMode::DepthNearer`]. Rows are
//! blended in parallel.

use std::collections::HashSet;

use bevy::color::{ColorToPacked, LinearRgba, Srgba};
use bevy::prelude::*;
use bevy::render::render_resource::TextureFormat;
use rayon::prelude::*;

use super::CompositeStep;
use super::material::{BlendMode, OverlayBlendMaterial, OverlayBlendUniforms};
use crate::buffers::{FrameBuffer, FrameBufferManager, clear_buffer};
use crate::error::{OverlayError, OverlayResult};

const BYTES_PER_TEXEL: usize = 4;

/// Source side of one blend.
pub struct SourceView<'a> {
  pub color: &'a [u8],
  /// R32Float view distances, same layout as `color`.
  pub depth: Option<&'a [u8]>,
}

/// Target side of one blend.
pub struct TargetView<'a> {
  pub color: &'a mut [u8],
  pub depth: Option<&'a mut [u8]>,
}

/// Maps a target texel to the source texel at the centre of its grid cell.
#[derive(Clone, Copy)]
struct CellSampler {
  size: UVec2,
  anchor: Vec2,
  resolution: Vec2,
}

impl CellSampler {
  fn new(size: UVec2, uniforms: &OverlayBlendUniforms) -> Self {
    Self {
      size,
      // Viewport y points up, rows run down
      anchor: Vec2::new(uniforms.anchor.x, 1.0 - uniforms.anchor.y),
      resolution: uniforms.resolution,
    }
  }

  fn sample(&self, x: u32, y: u32) -> usize {
    let size = self.size.as_vec2();
    let uv = (Vec2::new(x as f32, y as f32) + 0.5) / size;

    let uv = if self.resolution.x > 0.0 && self.resolution.y > 0.0 {
      let cell = ((uv - self.anchor) * self.resolution).floor();
      self.anchor + (cell + 0.5) / self.resolution
    } else {
      uv
    };

    // Clamp-to-edge, like the GPU sampler
    let texel = (uv * size).floor();
    let sx = (texel.x.max(0.0) as u32).min(self.size.x - 1);
    let sy = (texel.y.max(0.0) as u32).min(self.size.y - 1);
    (sy * self.size.x + sx) as usize
  }
}

fn decode(texel: &[u8]) -> LinearRgba {
  LinearRgba::from(Srgba::rgba_u8(texel[0], texel[1], texel[2], texel[3]))
}

fn encode(color: LinearRgba) -> [u8; 4] {
  Srgba::from(color).to_u8_array()
}

fn read_depth(depth: &[u8], index: usize) -> f32 {
  let at = index * 4;
  f32::from_le_bytes([depth[at], depth[at + 1], depth[at + 2], depth[at + 3]])
}

fn write_depth(depth: &mut [u8], index: usize, value: f32) {
  let at = index * 4;
  depth[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// `src` drawn over `dst` with `SrcAlpha, OneMinusSrcAlpha` / `One,
/// OneMinusSrcAlpha` blending.
fn over(src: LinearRgba, dst: LinearRgba) -> LinearRgba {
  let keep = 1.0 - src.alpha;
  LinearRgba::new(
    src.red * src.alpha + dst.red * keep,
    src.green * src.alpha + dst.green * keep,
    src.blue * src.alpha + dst.blue * keep,
    src.alpha + dst.alpha * keep,
  )
}

/// `src` drawn behind `dst`.
fn under(src: LinearRgba, dst: LinearRgba) -> LinearRgba {
  let through = src.alpha * (1.0 - dst.alpha);
  LinearRgba::new(
    dst.red + src.red * through,
    dst.green + src.green * through,
    dst.blue + src.blue * through,
    dst.alpha + through,
  )
}

fn unpremultiply(color: LinearRgba) -> LinearRgba {
  if color.alpha <= 0.0 {
    return color;
  }
  LinearRgba::new(
    color.red / color.alpha,
    color.green / color.alpha,
    color.blue / color.alpha,
    color.alpha,
  )
}

/// Blends `source` onto `target`, both `size` texels of Rgba8UnormSrgb.
///
/// Without a target depth channel [`BlendMode::DepthNearer`] degrades to
/// "over". Source texels with no depth written (no channel, or still at the
/// far clear value) take the anchor depth. Ties go to the later source, as
/// they do in the GPU submission order.
pub fn blend(target: TargetView<'_>, source: SourceView<'_>, size: UVec2, uniforms: &OverlayBlendUniforms) {
  let width = size.x as usize;
  let sampler = CellSampler::new(size, uniforms);
  let mode = BlendMode::from_u32(uniforms.mode);
  let premultiplied = uniforms.premultiplied != 0;
  let anchor_depth = uniforms.anchor.z;

  let blend_row = |y: usize, color_row: &mut [u8], mut depth_row: Option<&mut [u8]>| {
    for x in 0..width {
      let index = sampler.sample(x as u32, y as u32);
      let at = index * BYTES_PER_TEXEL;
      let mut src = decode(&source.color[at..at + BYTES_PER_TEXEL]);
      if src.alpha <= 0.0 {
        continue;
      }
      if premultiplied {
        src = unpremultiply(src);
      }

      let texel = &mut color_row[x * BYTES_PER_TEXEL..(x + 1) * BYTES_PER_TEXEL];
      let dst = decode(texel);

      let out = match (mode, depth_row.as_deref_mut()) {
        (BlendMode::DepthNearer, Some(depth)) => {
          let src_depth = source
            .depth
            .map(|depth| read_depth(depth, index))
            .filter(|value| *value < f32::MAX)
            .unwrap_or(anchor_depth);
          if src_depth <= read_depth(depth, x) {
            write_depth(depth, x, src_depth);
            over(src, dst)
          } else {
            under(src, dst)
          }
        }
        _ => over(src, dst),
      };
      texel.copy_from_slice(&encode(out));
    }
  };

  let row_bytes = width * BYTES_PER_TEXEL;
  match target.depth {
    Some(depth) => target
      .color
      .par_chunks_mut(row_bytes)
      .zip(depth.par_chunks_mut(width * 4))
      .enumerate()
      .for_each(|(y, (color_row, depth_row))| blend_row(y, color_row, Some(depth_row))),
    None => target
      .color
      .par_chunks_mut(row_bytes)
      .enumerate()
      .for_each(|(y, color_row)| blend_row(y, color_row, None)),
  }
}

/// Runs validated `steps` against the CPU copies of the buffers.
pub(crate) fn execute(
  world: &mut World,
  buffers: &FrameBufferManager,
  steps: &[CompositeStep],
) -> OverlayResult<()> {
  let mut cleared = HashSet::new();

  for step in steps {
    let source = lookup(buffers, &step.source)?;
    let target = lookup(buffers, &step.target)?;

    let uniforms = world
      .get_resource::<Assets<OverlayBlendMaterial>>()
      .and_then(|materials| materials.get(&step.material))
      .map(|material| material.uniforms)
      .ok_or_else(|| {
        OverlayError::InvalidCompositeStep(format!(
          "{} -> {}: blend material is not loaded",
          step.source, step.target
        ))
      })?;

    let Some(mut images) = world.get_resource_mut::<Assets<Image>>() else {
      return Err(OverlayError::MissingBuffer(step.target.clone()));
    };

    if cleared.insert(target.key.clone()) {
      clear_buffer(&mut images, target);
    }

    let source_color = images
      .get(&source.color)
      .and_then(|image| image.data.clone())
      .ok_or_else(|| OverlayError::MissingBuffer(source.key.clone()))?;
    let source_depth = float_depth(source)
      .and_then(|handle| images.get(handle))
      .and_then(|image| image.data.clone());

    // Depth leaves its image while the colour image is borrowed
    let mut target_depth = float_depth(target)
      .and_then(|handle| images.get_mut(handle))
      .and_then(|image| image.data.take());

    let Some(target_color) = images
      .get_mut(&target.color)
      .and_then(|image| image.data.as_mut())
    else {
      return Err(OverlayError::MissingBuffer(target.key.clone()));
    };

    blend(
      TargetView {
        color: target_color,
        depth: target_depth.as_deref_mut(),
      },
      SourceView {
        color: &source_color,
        depth: source_depth.as_deref(),
      },
      target.size,
      &uniforms,
    );

    if let (Some(data), Some(handle)) = (target_depth, &target.depth) {
      if let Some(image) = images.get_mut(handle) {
        image.data = Some(data);
      }
    }
  }

  Ok(())
}

fn lookup<'a>(buffers: &'a FrameBufferManager, key: &str) -> OverlayResult<&'a FrameBuffer> {
  buffers
    .get(key)
    .ok_or_else(|| OverlayError::MissingBuffer(key.to_string()))
}

/// Depth channel the CPU path can read; other formats are ignored.
fn float_depth(buffer: &FrameBuffer) -> Option<&Handle<Image>> {
  match buffer.depth_format {
    Some(TextureFormat::R32Float) => buffer.depth.as_ref(),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const RED: [u8; 4] = [255, 0, 0, 255];
  const BLUE: [u8; 4] = [0, 0, 255, 255];
  const CLEAR: [u8; 4] = [0, 0, 0, 0];

  fn image(texels: &[[u8; 4]]) -> Vec<u8> {
    texels.iter().flatten().copied().collect()
  }

  fn depths(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
  }

  fn plain() -> OverlayBlendUniforms {
    OverlayBlendUniforms::default()
  }

  #[test]
  fn opaque_over_transparent_is_source() {
    let mut target = image(&[CLEAR, CLEAR]);
    let source = image(&[RED, CLEAR]);

    blend(
      TargetView {
        color: &mut target,
        depth: None,
      },
      SourceView {
        color: &source,
        depth: None,
      },
      UVec2::new(2, 1),
      &plain(),
    );

    assert_eq!(target, image(&[RED, CLEAR]));
  }

  #[test]
  fn later_source_draws_on_top() {
    let mut target = image(&[RED]);
    let source = image(&[BLUE]);

    blend(
      TargetView {
        color: &mut target,
        depth: None,
      },
      SourceView {
        color: &source,
        depth: None,
      },
      UVec2::ONE,
      &plain(),
    );

    assert_eq!(target, image(&[BLUE]));
  }

  #[test]
  fn half_alpha_mixes_in_linear_space() {
    let mut target = image(&[[0, 0, 0, 255]]);
    let source = image(&[[255, 255, 255, 128]]);

    blend(
      TargetView {
        color: &mut target,
        depth: None,
      },
      SourceView {
        color: &source,
        depth: None,
      },
      UVec2::ONE,
      &plain(),
    );

    // 50% linear white encodes to roughly 188 in sRGB
    assert!((186..=190).contains(&target[0]), "{target:?}");
    assert_eq!(target[3], 255);
  }

  #[test]
  fn depth_nearer_keeps_nearer_target() {
    let mut target = image(&[RED, RED]);
    let mut target_depth = depths(&[5.0, 50.0]);
    let source = image(&[BLUE, BLUE]);
    let mut uniforms = plain();
    uniforms.mode = BlendMode::DepthNearer.as_u32();
    uniforms.anchor.z = 10.0;

    blend(
      TargetView {
        color: &mut target,
        depth: Some(&mut target_depth),
      },
      SourceView {
        color: &source,
        depth: None,
      },
      UVec2::new(2, 1),
      &uniforms,
    );

    // Texel 0: red at 5 is nearer than blue at 10; texel 1: blue wins
    assert_eq!(target, image(&[RED, BLUE]));
    assert_eq!(read_depth(&target_depth, 0), 5.0);
    assert_eq!(read_depth(&target_depth, 1), 10.0);
  }

  #[test]
  fn source_depth_channel_overrides_anchor() {
    let mut target = image(&[RED]);
    let mut target_depth = depths(&[5.0]);
    let source = image(&[BLUE]);
    let source_depth = depths(&[1.0]);
    let mut uniforms = plain();
    uniforms.mode = BlendMode::DepthNearer.as_u32();
    uniforms.anchor.z = 100.0;

    blend(
      TargetView {
        color: &mut target,
        depth: Some(&mut target_depth),
      },
      SourceView {
        color: &source,
        depth: Some(&source_depth),
      },
      UVec2::ONE,
      &uniforms,
    );

    assert_eq!(target, image(&[BLUE]));
    assert_eq!(read_depth(&target_depth, 0), 1.0);
  }

  #[test]
  fn unwritten_source_depth_falls_back_to_anchor() {
    let size = UVec2::ONE;
    let mut target = image(&[CLEAR]);
    let mut target_depth = depths(&[f32::MAX]);
    let far_channel = depths(&[f32::MAX]);

    let mut back = plain();
    back.mode = BlendMode::DepthNearer.as_u32();
    back.anchor.z = 50.0;
    let mut front = back;
    front.anchor.z = 1.0;

    // Nearer source drawn first, farther one second
    for (color, uniforms) in [(BLUE, front), (RED, back)] {
      let source = image(&[color]);
      blend(
        TargetView {
          color: &mut target,
          depth: Some(&mut target_depth),
        },
        SourceView {
          color: &source,
          depth: Some(&far_channel),
        },
        size,
        &uniforms,
      );
    }

    assert_eq!(target, image(&[BLUE]));
    assert_eq!(read_depth(&target_depth, 0), 1.0);
  }

  #[test]
  fn equal_depths_layer_in_step_order() {
    let mut target = image(&[RED]);
    let mut target_depth = depths(&[10.0]);
    let source = image(&[BLUE]);
    let mut uniforms = plain();
    uniforms.mode = BlendMode::DepthNearer.as_u32();
    uniforms.anchor.z = 10.0;

    blend(
      TargetView {
        color: &mut target,
        depth: Some(&mut target_depth),
      },
      SourceView {
        color: &source,
        depth: None,
      },
      UVec2::ONE,
      &uniforms,
    );

    assert_eq!(target, image(&[BLUE]));
  }

  #[test]
  fn pixelation_samples_cell_centres() {
    // 4x1 source, 2 cells wide: texels 0-1 read texel 1, texels 2-3 read 3
    let source = image(&[RED, BLUE, RED, BLUE]);
    let mut target = image(&[CLEAR; 4]);
    let mut uniforms = plain();
    uniforms.resolution = Vec2::new(2.0, 1.0);

    blend(
      TargetView {
        color: &mut target,
        depth: None,
      },
      SourceView {
        color: &source,
        depth: None,
      },
      UVec2::new(4, 1),
      &uniforms,
    );

    assert_eq!(target, image(&[BLUE, BLUE, BLUE, BLUE]));
  }

  #[test]
  fn cell_grid_follows_anchor() {
    let size = UVec2::new(8, 1);
    let mut uniforms = plain();
    uniforms.resolution = Vec2::new(4.0, 1.0);
    uniforms.anchor = Vec4::new(0.25, 0.0, 0.0, 0.0);
    let sampler = CellSampler::new(size, &uniforms);

    // Cells start at the anchor: [2, 4) -> centre texel 3
    assert_eq!(sampler.sample(2, 0), 3);
    assert_eq!(sampler.sample(3, 0), 3);
    assert_eq!(sampler.sample(0, 0), 1);
  }
}
