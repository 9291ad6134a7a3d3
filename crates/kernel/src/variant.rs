//! Shader-variant construction.
//!
//! [`ShaderVariantFactory`] expands the kernel template once per catalog
//! entry, hands the source to a [`KernelBackend`] for compilation and
//! parameter-buffer allocation, and keeps every variant that built. A
//! variant that fails is logged and dropped; only an unusable template stops
//! the factory.

use std::path::{Path, PathBuf};

use image::RgbaImage;

use crate::catalog::{wrap_index, FormulaCatalog, VariantSpec};
use crate::model::ControlPointModel;
use crate::params::{ParameterBlock, ParameterError, ParameterLayout, Parameters, ViewParameters};
use crate::partition::{DeviceLimits, Extent, PlanCache, ThreadGroupPlan};
use crate::template::{count_token_outside_directives, expand, ITERATOR_TOKEN};

const BUNDLED_TEMPLATE: &str = include_str!("../kernels/fractal.wgsl");

/// Output size of the cached per-variant snapshot.
pub const DEFAULT_SNAPSHOT_EXTENT: Extent = Extent::new(512, 512);

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("failed to read kernel template {}", path.display())]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel template {origin} does not contain the `{token}` macro token")]
    MissingToken { origin: String, token: String },
}

#[derive(Debug, thiserror::Error)]
pub enum VariantError {
    #[error("failed to compile `{label}`: {message}")]
    Compile { label: String, message: String },
    #[error("failed to create pipeline for `{label}`: {message}")]
    Pipeline { label: String, message: String },
    #[error("failed to allocate {bytes}-byte parameter buffer for `{label}`: {message}")]
    Allocation {
        label: String,
        bytes: usize,
        message: String,
    },
}

/// Kernel source with a macro token, ready for expansion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelTemplate {
    origin: String,
    source: String,
    token: String,
}

impl KernelTemplate {
    /// The WGSL template compiled into this crate.
    pub fn bundled() -> Self {
        Self {
            origin: "<bundled>".to_string(),
            source: BUNDLED_TEMPLATE.to_string(),
            token: ITERATOR_TOKEN.to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, FactoryError> {
        let source = std::fs::read_to_string(path).map_err(|source| FactoryError::TemplateRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_source(path.display().to_string(), source, ITERATOR_TOKEN)
    }

    pub fn from_source(
        origin: impl Into<String>,
        source: impl Into<String>,
        token: &str,
    ) -> Result<Self, FactoryError> {
        let template = Self {
            origin: origin.into(),
            source: source.into(),
            token: token.to_string(),
        };
        if count_token_outside_directives(&template.source, token) == 0 {
            return Err(FactoryError::MissingToken {
                origin: template.origin,
                token: token.to_string(),
            });
        }
        Ok(template)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expand(&self, formula: &str) -> String {
        expand(&self.source, &self.token, formula)
    }
}

/// Device-side half of a variant: compiled programs and parameter buffers.
pub trait KernelBackend {
    type Program;
    type Parameters;

    /// Compiles `source` with `spec`'s escape mode baked in.
    fn compile(&self, spec: &VariantSpec, source: &str) -> Result<Self::Program, VariantError>;

    /// Allocates a buffer of `spec.layout.byte_len()` bytes.
    fn allocate_parameters(&self, spec: &VariantSpec) -> Result<Self::Parameters, VariantError>;

    /// Thread limits that apply when dispatching `program`.
    fn program_limits(&self, program: &Self::Program) -> DeviceLimits;
}

/// Something able to render a variant off-screen.
pub trait Snapshotter<B: KernelBackend> {
    fn snapshot(
        &mut self,
        variant: &mut KernelVariant<B>,
        extent: Extent,
        parameters: &Parameters,
    ) -> Option<RgbaImage>;
}

/// One compiled (formula, escape mode) combination and its resources.
pub struct KernelVariant<B: KernelBackend> {
    spec: VariantSpec,
    source: String,
    program: B::Program,
    parameters: B::Parameters,
    block: ParameterBlock,
    limits: DeviceLimits,
    plan: PlanCache,
    image: Option<RgbaImage>,
}

impl<B: KernelBackend> KernelVariant<B> {
    pub fn spec(&self) -> &VariantSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn formula(&self) -> &str {
        &self.spec.formula
    }

    pub fn uses_escape_iteration(&self) -> bool {
        self.spec.uses_escape_iteration
    }

    pub fn layout(&self) -> ParameterLayout {
        self.spec.layout
    }

    /// The expanded kernel source this variant was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn program(&self) -> &B::Program {
        &self.program
    }

    /// Program and parameter buffer together, for encoding a dispatch.
    pub fn program_and_parameters_mut(&mut self) -> (&mut B::Program, &B::Parameters) {
        (&mut self.program, &self.parameters)
    }

    pub fn parameter_buffer(&self) -> &B::Parameters {
        &self.parameters
    }

    pub fn parameter_block(&self) -> &ParameterBlock {
        &self.block
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    /// Packs `parameters` into the host block and returns the wire bytes.
    pub fn stage_parameters(&mut self, parameters: &Parameters) -> Result<Vec<u8>, ParameterError> {
        self.block.write(parameters)?;
        Ok(self.block.to_bytes())
    }

    /// Cached plan for `extent`, recomputed after a size change.
    pub fn plan_for(&mut self, extent: Extent) -> ThreadGroupPlan {
        self.plan.plan_for(extent, &self.limits)
    }

    pub fn cached_plan(&self) -> Option<(Extent, ThreadGroupPlan)> {
        self.plan.cached()
    }

    /// Parameters used for the cached snapshot.
    pub fn default_parameters(&self) -> Parameters {
        match self.spec.layout {
            ParameterLayout::Viewport => Parameters::View(ViewParameters::default()),
            ParameterLayout::ControlPoints { count } => {
                let derived = ControlPointModel::default().derived();
                let points = (0..count as usize).map(|i| derived[i % derived.len()]).collect();
                Parameters::ControlPoints {
                    points,
                    zoom: [1.0, 1.0],
                    origin: [0.0, 0.0],
                }
            }
        }
    }

    pub fn cached_image(&self) -> Option<&RgbaImage> {
        self.image.as_ref()
    }

    /// Returns the cached snapshot, rendering it first if there is none.
    ///
    /// A cached image is returned as-is whatever `extent` is; use
    /// [`refresh_image`](Self::refresh_image) to re-render.
    pub fn image<S: Snapshotter<B>>(
        &mut self,
        snapshotter: &mut S,
        extent: Extent,
    ) -> Option<&RgbaImage> {
        if self.image.is_none() {
            self.refresh_image(snapshotter, extent);
        }
        self.image.as_ref()
    }

    /// Re-renders the cached snapshot with the default parameters.
    ///
    /// On failure the previous image, if any, is kept.
    pub fn refresh_image<S: Snapshotter<B>>(
        &mut self,
        snapshotter: &mut S,
        extent: Extent,
    ) -> bool {
        let parameters = self.default_parameters();
        match snapshotter.snapshot(self, extent, &parameters) {
            Some(image) => {
                self.image = Some(image);
                true
            }
            None => false,
        }
    }

    pub fn clear_image(&mut self) {
        self.image = None;
    }
}

/// A variant the factory could not build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DroppedVariant {
    pub spec: VariantSpec,
    pub reason: String,
}

/// Variants in catalog order, plus the ones that were dropped.
pub struct VariantSet<B: KernelBackend> {
    variants: Vec<KernelVariant<B>>,
    dropped: Vec<DroppedVariant>,
}

impl<B: KernelBackend> VariantSet<B> {
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&KernelVariant<B>> {
        self.variants.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut KernelVariant<B>> {
        self.variants.get_mut(index)
    }

    /// Variant at `index % len`.
    pub fn select(&self, index: usize) -> Option<&KernelVariant<B>> {
        wrap_index(index, self.variants.len()).map(|i| &self.variants[i])
    }

    pub fn select_mut(&mut self, index: usize) -> Option<&mut KernelVariant<B>> {
        wrap_index(index, self.variants.len()).map(move |i| &mut self.variants[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KernelVariant<B>> {
        self.variants.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, KernelVariant<B>> {
        self.variants.iter_mut()
    }

    pub fn dropped(&self) -> &[DroppedVariant] {
        &self.dropped
    }
}

pub struct ShaderVariantFactory<'a, B> {
    backend: &'a B,
    template: &'a KernelTemplate,
}

impl<'a, B: KernelBackend> ShaderVariantFactory<'a, B> {
    pub fn new(backend: &'a B, template: &'a KernelTemplate) -> Self {
        Self { backend, template }
    }

    pub fn build(&self, spec: &VariantSpec) -> Result<KernelVariant<B>, VariantError> {
        let source = self.template.expand(&spec.formula);
        let program = self.backend.compile(spec, &source)?;
        let parameters = self.backend.allocate_parameters(spec)?;
        let limits = self.backend.program_limits(&program);
        Ok(KernelVariant {
            spec: spec.clone(),
            source,
            program,
            parameters,
            block: ParameterBlock::new(spec.layout),
            limits,
            plan: PlanCache::new(),
            image: None,
        })
    }

    /// Builds every catalog entry, in order, dropping the ones that fail.
    pub fn build_all(&self, catalog: &FormulaCatalog) -> VariantSet<B> {
        let mut variants = Vec::with_capacity(catalog.len());
        let mut dropped = Vec::new();
        for spec in catalog {
            match self.build(spec) {
                Ok(variant) => {
                    tracing::debug!(variant = %spec.label(), "built kernel variant");
                    variants.push(variant);
                }
                Err(err) => {
                    tracing::warn!(
                        variant = %spec.label(),
                        error = %err,
                        "dropping kernel variant"
                    );
                    dropped.push(DroppedVariant {
                        spec: spec.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            template = %self.template.origin(),
            built = variants.len(),
            dropped = dropped.len(),
            "kernel variants ready"
        );
        VariantSet { variants, dropped }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct FakeBackend {
        failing_formulas: Vec<&'static str>,
        failing_allocations: Vec<&'static str>,
        compiled: RefCell<Vec<(String, bool)>>,
    }

    impl KernelBackend for FakeBackend {
        type Program = String;
        type Parameters = Vec<u8>;

        fn compile(&self, spec: &VariantSpec, source: &str) -> Result<String, VariantError> {
            if self.failing_formulas.contains(&spec.formula.as_str()) {
                return Err(VariantError::Compile {
                    label: spec.label(),
                    message: "syntax error".into(),
                });
            }
            self.compiled
                .borrow_mut()
                .push((spec.formula.clone(), spec.uses_escape_iteration));
            Ok(source.to_string())
        }

        fn allocate_parameters(&self, spec: &VariantSpec) -> Result<Vec<u8>, VariantError> {
            if self.failing_allocations.contains(&spec.name.as_str()) {
                return Err(VariantError::Allocation {
                    label: spec.label(),
                    bytes: spec.layout.byte_len(),
                    message: "out of memory".into(),
                });
            }
            Ok(vec![0; spec.layout.byte_len()])
        }

        fn program_limits(&self, _program: &String) -> DeviceLimits {
            DeviceLimits::new(256, 32)
        }
    }

    struct FakeSnapshotter {
        calls: usize,
        fail: bool,
    }

    impl Snapshotter<FakeBackend> for FakeSnapshotter {
        fn snapshot(
            &mut self,
            variant: &mut KernelVariant<FakeBackend>,
            extent: Extent,
            parameters: &Parameters,
        ) -> Option<RgbaImage> {
            self.calls += 1;
            variant.stage_parameters(parameters).ok()?;
            (!self.fail).then(|| RgbaImage::new(extent.width, extent.height))
        }
    }

    fn template() -> KernelTemplate {
        KernelTemplate::from_source(
            "test",
            "# header iterator\nlet next = iterator;\n",
            ITERATOR_TOKEN,
        )
        .unwrap()
    }

    #[test]
    fn every_catalog_entry_becomes_a_variant_in_order() {
        let backend = FakeBackend::default();
        let template = template();
        let catalog = FormulaCatalog::standard().with_both_escape_modes();
        let set = ShaderVariantFactory::new(&backend, &template).build_all(&catalog);

        assert_eq!(set.len(), catalog.len());
        assert!(set.dropped().is_empty());
        for (variant, spec) in set.iter().zip(catalog.iter()) {
            assert_eq!(variant.spec(), spec);
            assert_eq!(variant.parameter_buffer().len(), spec.layout.byte_len());
        }
        assert_eq!(backend.compiled.borrow().len(), catalog.len());
    }

    #[test]
    fn failing_entries_are_dropped_without_stopping_the_rest() {
        let backend = FakeBackend {
            failing_formulas: vec!["cmul(z, z) + c"],
            failing_allocations: vec!["mandelbrot"],
            ..FakeBackend::default()
        };
        let template = template();
        let catalog = FormulaCatalog::standard();
        let set = ShaderVariantFactory::new(&backend, &template).build_all(&catalog);

        assert_eq!(set.len(), catalog.len() - 2);
        let dropped: Vec<_> = set.dropped().iter().map(|d| d.spec.name.as_str()).collect();
        assert_eq!(dropped, ["julia", "mandelbrot"]);
        assert!(set.dropped()[0].reason.contains("syntax error"));
        let kept: Vec<_> = set.iter().map(|v| v.name()).collect();
        assert_eq!(
            kept,
            ["newton-cubic", "newton-reciprocal", "newton-cosine", "cubic-control"]
        );
    }

    #[test]
    fn variant_source_is_the_expanded_template() {
        let backend = FakeBackend::default();
        let template = template();
        let variant = ShaderVariantFactory::new(&backend, &template)
            .build(&VariantSpec::new("julia", "cmul(z, z) + c", true))
            .unwrap();
        assert_eq!(variant.source(), "# header iterator\nlet next = cmul(z, z) + c;\n");
        assert_eq!(variant.program(), variant.source());
    }

    #[test]
    fn selection_wraps_around() {
        let backend = FakeBackend::default();
        let template = template();
        let mut set =
            ShaderVariantFactory::new(&backend, &template).build_all(&FormulaCatalog::standard());
        assert_eq!(set.select(0).map(|v| v.name()), Some("newton-cubic"));
        assert_eq!(set.select(7).map(|v| v.name()), Some("newton-reciprocal"));
        assert_eq!(
            set.select_mut(11).map(|v| v.name().to_string()).as_deref(),
            Some("cubic-control")
        );
        assert!(set.get(6).is_none());
    }

    #[test]
    fn plan_is_cached_per_variant_until_resize() {
        let backend = FakeBackend::default();
        let template = template();
        let mut variant = ShaderVariantFactory::new(&backend, &template)
            .build(&VariantSpec::new("julia", "cmul(z, z) + c", true))
            .unwrap();
        let first = variant.plan_for(Extent::new(640, 480));
        assert_eq!(variant.cached_plan(), Some((Extent::new(640, 480), first)));
        assert!(variant.plan_for(Extent::new(0, 480)).is_degenerate());
        assert_eq!(variant.cached_plan().map(|(key, _)| key), Some(Extent::new(0, 480)));
    }

    #[test]
    fn staged_parameters_match_the_layout() {
        let backend = FakeBackend::default();
        let template = template();
        let mut set =
            ShaderVariantFactory::new(&backend, &template).build_all(&FormulaCatalog::standard());
        let viewport = set.get_mut(0).unwrap();
        let bytes = viewport
            .stage_parameters(&ViewParameters::new([1.0, 2.0], [3.0, 4.0], [5.0, 6.0]).into())
            .unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(viewport.parameter_block().values(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let control = set.get_mut(5).unwrap();
        let defaults = control.default_parameters();
        let bytes = control.stage_parameters(&defaults).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn image_is_rendered_once_and_refreshed_on_request() {
        let backend = FakeBackend::default();
        let template = template();
        let mut variant = ShaderVariantFactory::new(&backend, &template)
            .build(&VariantSpec::new("julia", "cmul(z, z) + c", true))
            .unwrap();
        let mut snapshotter = FakeSnapshotter { calls: 0, fail: false };

        let size = variant
            .image(&mut snapshotter, DEFAULT_SNAPSHOT_EXTENT)
            .map(|image| image.dimensions());
        assert_eq!(size, Some((512, 512)));
        assert!(variant.image(&mut snapshotter, Extent::new(8, 8)).is_some());
        assert_eq!(snapshotter.calls, 1);
        assert_eq!(variant.parameter_block().view(), Some(ViewParameters::default()));

        snapshotter.fail = true;
        assert!(!variant.refresh_image(&mut snapshotter, Extent::new(8, 8)));
        assert_eq!(variant.cached_image().map(|image| image.width()), Some(512));

        variant.clear_image();
        assert!(variant.image(&mut snapshotter, Extent::new(8, 8)).is_none());
        assert_eq!(snapshotter.calls, 3);
    }

    #[test]
    fn template_without_token_is_rejected() {
        let source = "# iterator\nfn main() {}\n";
        let err = KernelTemplate::from_source("inline", source, ITERATOR_TOKEN).unwrap_err();
        assert!(matches!(err, FactoryError::MissingToken { .. }));
    }

    #[test]
    fn missing_template_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = KernelTemplate::load(&dir.path().join("absent.wgsl")).unwrap_err();
        assert!(matches!(err, FactoryError::TemplateRead { .. }));
    }

    #[test]
    fn template_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.wgsl");
        std::fs::write(&path, KernelTemplate::bundled().source()).unwrap();
        let loaded = KernelTemplate::load(&path).unwrap();
        assert_eq!(loaded.source(), KernelTemplate::bundled().source());
        assert_eq!(loaded.origin(), path.display().to_string());
    }
}
