//! Blend material used by composite steps.

use bevy::prelude::*;
use bevy::render::render_resource::{AsBindGroup, ShaderType};
use bevy::shader::ShaderRef;
use bevy::sprite_render::{AlphaMode2d, Material2d};

/// How a step combines its source with the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
  /// Straight-alpha "over": later steps draw on top.
  #[default]
  AlphaOver,
  /// The nearer of source and target (smaller view distance) ends up on top.
  DepthNearer,
}

impl BlendMode {
  pub const fn as_u32(self) -> u32 {
    match self {
      Self::AlphaOver => 0,
      Self::DepthNearer => 1,
    }
  }

  pub const fn from_u32(value: u32) -> Self {
    match value {
      1 => Self::DepthNearer,
      _ => Self::AlphaOver,
    }
  }
}

/// Uniform block of the blend shader.
#[derive(Clone, Copy, Debug, Default, PartialEq, ShaderType)]
pub struct OverlayBlendUniforms {
  /// Snapped viewport anchor `(x, y, depth, 0)`.
  pub anchor: Vec4,
  /// Snapping grid in cells. Zero disables pixelation.
  pub resolution: Vec2,
  /// Pixel box size in screen pixels.
  pub box_size: f32,
  /// [`BlendMode`] as an integer.
  pub mode: u32,
  /// Non-zero when the source colour is already multiplied by alpha
  /// (a composited buffer being presented).
  pub premultiplied: u32,
}

/// Draws a source buffer onto a target, pixelated around the snapped anchor.
#[derive(Asset, TypePath, AsBindGroup, Clone, Debug, Default)]
pub struct OverlayBlendMaterial {
  /// Source buffer colour; set by the compositor every cycle.
  #[texture(0)]
  #[sampler(1)]
  pub source: Option<Handle<Image>>,

  #[uniform(2)]
  pub uniforms: OverlayBlendUniforms,
}

impl OverlayBlendMaterial {
  pub fn new(mode: BlendMode) -> Self {
    let mut material = Self::default();
    material.set_mode(mode);
    material
  }

  pub fn mode(&self) -> BlendMode {
    BlendMode::from_u32(self.uniforms.mode)
  }

  pub fn set_mode(&mut self, mode: BlendMode) {
    self.uniforms.mode = mode.as_u32();
  }

  /// Material drawing an already composited buffer over the window.
  pub fn present(source: Handle<Image>) -> Self {
    let mut material = Self::default();
    material.source = Some(source);
    material.uniforms.premultiplied = 1;
    material
  }

  /// Anchor depth (view distance) used when the source has no depth channel.
  pub fn anchor_depth(&self) -> f32 {
    self.uniforms.anchor.z
  }
}

impl Material2d for OverlayBlendMaterial {
  fn fragment_shader() -> ShaderRef {
    "embedded://bevy_pixel_overlay/composite/shaders/overlay_blend.wgsl".into()
  }

  fn alpha_mode(&self) -> AlphaMode2d {
    AlphaMode2d::Blend
  }
}
