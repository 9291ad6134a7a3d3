//! GPU half of iterscope: device setup, kernel pipelines and dispatch.
//!
//! ```text
//!   FormulaCatalog ──▶ ShaderVariantFactory<GpuContext> ──▶ GpuVariantSet
//!                                                              │
//!   PreviewConfig ──▶ run_preview ──▶ winit loop ──▶ DispatchRuntime::dispatch
//!                                                              │
//!   HeadlessRenderer::render ───────────────────────▶ snapshot ┘
//! ```
//!
//! [`GpuContext`] owns the device and queue and is the [`kernel::KernelBackend`]
//! the factory compiles against. [`DispatchRuntime`] plans, stages and
//! submits each dispatch, either presenting onto a window surface or reading
//! the pixels back for a snapshot.

mod compile;
pub mod gpu;
pub mod runtime;
pub mod snapshot;
pub mod types;
pub mod window;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use image::RgbaImage;
use kernel::{
    DroppedVariant, Extent, FormulaCatalog, KernelTemplate, Parameters, ShaderVariantFactory,
};

pub use gpu::{GpuContext, KernelProgram, ParameterBuffer, SurfaceTarget};
pub use runtime::{
    DispatchOutcome, DispatchRequest, DispatchRuntime, DispatchTarget, GpuVariant, GpuVariantSet,
    SkipReason,
};
pub use snapshot::{capture_file_name, save_png, thumbnail_file_name};
pub use types::{AdapterProfile, GpuOptions, GpuPowerPreference};
pub use window::{run_preview, PreviewConfig};

/// Off-screen renderer: one headless context, every catalog variant built.
pub struct HeadlessRenderer {
    runtime: DispatchRuntime,
    variants: GpuVariantSet,
    context: GpuContext,
}

impl HeadlessRenderer {
    pub fn new(
        template: &KernelTemplate,
        catalog: &FormulaCatalog,
        options: &GpuOptions,
    ) -> Result<Self> {
        let context = GpuContext::headless(options)?;
        let variants = ShaderVariantFactory::new(&context, template).build_all(catalog);
        let runtime = DispatchRuntime::new(&context);
        Ok(Self {
            runtime,
            variants,
            context,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    pub fn variants(&self) -> &GpuVariantSet {
        &self.variants
    }

    /// Catalog entries that failed to build.
    pub fn dropped(&self) -> &[DroppedVariant] {
        self.variants.dropped()
    }

    /// Index of the variant whose name or `name/mode` label is `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.variants
            .iter()
            .position(|variant| variant.spec().label() == name)
            .or_else(|| self.variants.iter().position(|variant| variant.name() == name))
    }

    /// Renders variant `index` (wrapping) at `extent`. Uses the variant's
    /// default parameters when `parameters` is `None`.
    pub fn render(
        &mut self,
        index: usize,
        extent: Extent,
        parameters: Option<&Parameters>,
    ) -> Result<RgbaImage> {
        let variant = self
            .variants
            .select_mut(index)
            .ok_or_else(|| anyhow!("no kernel variant compiled"))?;
        let defaults;
        let parameters = match parameters {
            Some(parameters) => parameters,
            None => {
                defaults = variant.default_parameters();
                &defaults
            }
        };
        let label = variant.spec().label();
        match self.runtime.dispatch(
            variant,
            DispatchRequest { extent, parameters },
            DispatchTarget::Snapshot,
        ) {
            DispatchOutcome::Captured(image) => Ok(image),
            DispatchOutcome::Skipped(reason) => Err(anyhow!("{label}: {reason}")),
            DispatchOutcome::Presented => {
                Err(anyhow!("{label}: snapshot dispatch presented instead"))
            }
        }
    }

    /// Saves every variant's cached image into `dir`, rendering it at
    /// `extent` first when there is none. Variants that fail to render are
    /// logged and left out.
    pub fn save_thumbnails(&mut self, dir: &Path, extent: Extent) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.variants.len());
        for (index, variant) in self.variants.iter_mut().enumerate() {
            let path = dir.join(thumbnail_file_name(index, variant.spec()));
            let label = variant.spec().label();
            match variant.image(&mut self.runtime, extent) {
                Some(image) => save_png(image, &path)?,
                None => {
                    tracing::warn!(variant = %label, "no thumbnail rendered");
                    continue;
                }
            }
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headless(template: &KernelTemplate) -> Option<HeadlessRenderer> {
        let catalog = FormulaCatalog::standard();
        match HeadlessRenderer::new(template, &catalog, &GpuOptions::default()) {
            Ok(renderer) => Some(renderer),
            Err(err) => {
                eprintln!("skipping GPU test: {err:#}");
                None
            }
        }
    }

    #[test]
    fn headless_renderer_finds_and_renders_by_name() {
        let template = KernelTemplate::bundled();
        let Some(mut renderer) = headless(&template) else {
            return;
        };

        assert_eq!(renderer.find("julia/escape"), renderer.find("julia"));
        assert_eq!(renderer.find("no-such-formula"), None);
        let Some(index) = renderer.find("mandelbrot") else {
            panic!("mandelbrot dropped: {:?}", renderer.dropped());
        };

        let image = renderer.render(index, Extent::new(40, 30), None).unwrap();
        assert_eq!(image.dimensions(), (40, 30));
        assert!(renderer.render(index, Extent::new(0, 30), None).is_err());
    }

    #[test]
    fn thumbnails_cover_every_built_variant() {
        let template = KernelTemplate::bundled();
        let Some(mut renderer) = headless(&template) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();

        let written = renderer
            .save_thumbnails(dir.path(), Extent::new(24, 24))
            .unwrap();
        assert_eq!(written.len(), renderer.variants().len());
        assert!(written[0].ends_with("00-newton-cubic-escape.png"));
        let decoded = image::open(&written[0]).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (24, 24));
        assert!(renderer
            .variants()
            .iter()
            .all(|variant| variant.cached_image().is_some()));
    }
}
