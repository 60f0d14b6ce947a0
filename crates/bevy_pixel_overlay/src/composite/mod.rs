//! Composition of isolated buffers into the overlay.
//!
//! A composite plan is an ordered list of steps, each drawing a source buffer
//! onto a target buffer through a blend material. Later steps draw over
//! earlier ones, and the first step writing a target clears it.
//!
//! Two backends execute a plan:
//! - [`CompositeBackend::Gpu`]: blit cameras and full-screen quads, rendered
//!   by Bevy at the end of the frame.
//! - [`CompositeBackend::Cpu`]: a reference blender over the images' CPU-side
//!   data, used when the app runs without a renderer.

pub mod cpu;
pub mod gpu;
mod material;

use bevy::prelude::*;
use bevy::sprite_render::Material2dPlugin;
pub use gpu::{CompositeBlitCamera, CompositeBlitQuad, GpuCompositor, OverlayPresentCamera};
pub use material::{BlendMode, OverlayBlendMaterial, OverlayBlendUniforms};

use crate::buffers::{FrameBuffer, FrameBufferManager};
use crate::error::{OverlayError, OverlayResult};

/// Embeds the blend shader and registers the material with the 2D pipeline.
pub(crate) fn add_render_support(app: &mut App) {
  bevy::asset::embedded_asset!(app, "shaders/overlay_blend.wgsl");
  app.add_plugins(Material2dPlugin::<OverlayBlendMaterial>::default());
}

/// One draw of `source` onto `target` through `material`.
#[derive(Clone, Debug, PartialEq)]
pub struct CompositeStep {
  pub source: String,
  pub target: String,
  pub material: Handle<OverlayBlendMaterial>,
}

impl CompositeStep {
  pub fn new(
    source: impl Into<String>,
    target: impl Into<String>,
    material: Handle<OverlayBlendMaterial>,
  ) -> Self {
    Self {
      source: source.into(),
      target: target.into(),
      material,
    }
  }
}

/// Where composite steps execute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompositeBackend {
  #[default]
  Gpu,
  Cpu,
}

/// Validates and executes composite plans.
pub struct Compositor {
  backend: CompositeBackend,
  present: bool,
  gpu: GpuCompositor,
}

impl Compositor {
  pub fn new(backend: CompositeBackend) -> Self {
    Self {
      backend,
      present: false,
      gpu: GpuCompositor::default(),
    }
  }

  /// Draw the last target over the window after compositing (GPU only).
  pub fn with_present(mut self, present: bool) -> Self {
    self.present = present;
    self
  }

  pub fn backend(&self) -> CompositeBackend {
    self.backend
  }

  /// GPU blit state, for inspection.
  pub fn gpu(&self) -> &GpuCompositor {
    &self.gpu
  }

  /// Checks a plan against the live buffers without doing any work.
  ///
  /// Returns each step with its resolved source and target.
  pub fn validate(
    buffers: &FrameBufferManager,
    steps: &[CompositeStep],
  ) -> OverlayResult<Vec<(CompositeStep, FrameBuffer, FrameBuffer)>> {
    if steps.is_empty() {
      return Err(OverlayError::InvalidCompositeStep("no steps to composite".into()));
    }

    steps
      .iter()
      .map(|step| {
        if step.source == step.target {
          return Err(OverlayError::InvalidCompositeStep(format!(
            "'{}' cannot be composited onto itself",
            step.source
          )));
        }
        let source = buffers
          .get(&step.source)
          .ok_or_else(|| OverlayError::MissingBuffer(step.source.clone()))?;
        let target = buffers
          .get(&step.target)
          .ok_or_else(|| OverlayError::MissingBuffer(step.target.clone()))?;
        if source.size != target.size {
          return Err(OverlayError::BufferSizeMismatch {
            source: source.key.clone(),
            target: target.key.clone(),
            source_size: (source.size.x, source.size.y),
            target_size: (target.size.x, target.size.y),
          });
        }
        Ok((step.clone(), source.clone(), target.clone()))
      })
      .collect()
  }

  /// Executes `steps` in order and returns the last step's target.
  ///
  /// Nothing runs unless the whole plan validates.
  pub fn composite(
    &mut self,
    world: &mut World,
    buffers: &FrameBufferManager,
    steps: &[CompositeStep],
  ) -> OverlayResult<FrameBuffer> {
    let resolved = Self::validate(buffers, steps)?;
    let Some((_, _, output)) = resolved.last().cloned() else {
      return Err(OverlayError::InvalidCompositeStep("no steps to composite".into()));
    };

    match self.backend {
      CompositeBackend::Cpu => cpu::execute(world, buffers, steps)?,
      CompositeBackend::Gpu => {
        let present = self.present.then_some(&output);
        self.gpu.submit(world, &resolved, present)?;
      }
    }

    Ok(output)
  }

  /// Stops every blit pass from rendering.
  pub fn deactivate(&self, world: &mut World) {
    self.gpu.deactivate(world);
  }

  /// Despawns backend entities.
  pub fn release(&mut self, world: &mut World) {
    self.gpu.release(world);
  }
}
