//! Device-independent half of the iterscope fractal renderer.
//!
//! - [`partition`] chooses thread-group and grid shapes for a 2D dispatch.
//! - [`template`] substitutes an iteration formula into kernel source.
//! - [`variant`] builds one compiled kernel per catalog entry through a
//!   [`KernelBackend`].
//! - [`params`] and [`model`] describe the parameter buffer each kernel reads.

pub mod catalog;
pub mod model;
pub mod params;
pub mod partition;
pub mod template;
pub mod variant;

pub use catalog::{wrap_index, FormulaCatalog, VariantCursor, VariantSpec};
pub use model::{Complex, ControlPointModel, Derivation};
pub use params::{ParameterBlock, ParameterError, ParameterLayout, Parameters, ViewParameters};
pub use partition::{
    estimated_underutilization, plan, plan_within, DeviceLimits, Extent, GroupShape, PlanCache,
    ThreadGroupPlan,
};
pub use template::{expand, DIRECTIVE_MARKER, ITERATOR_TOKEN};
pub use variant::{
    DroppedVariant, FactoryError, KernelBackend, KernelTemplate, KernelVariant,
    ShaderVariantFactory, Snapshotter, VariantError, VariantSet, DEFAULT_SNAPSHOT_EXTENT,
};

/// Kernel entry point name.
pub const ENTRY_POINT: &str = "main";

/// Names of the pipeline-overridable constants declared by the bundled template.
pub mod overrides {
    pub const USE_ESCAPE_ITERATION: &str = "use_escape_iteration";
    pub const GROUP_WIDTH: &str = "group_width";
    pub const GROUP_HEIGHT: &str = "group_height";
    pub const CONTROL_POINT_COUNT: &str = "control_point_count";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) -> Result<(), String> {
        let module =
            naga::front::wgsl::parse_str(source).map_err(|err| err.emit_to_string(source))?;
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|err| format!("{err:?}"))?;
        Ok(())
    }

    #[test]
    fn bundled_template_has_two_formula_sites() {
        let template = KernelTemplate::bundled();
        assert_eq!(
            template::count_token_outside_directives(template.source(), ITERATOR_TOKEN),
            2
        );
        for name in [
            overrides::USE_ESCAPE_ITERATION,
            overrides::GROUP_WIDTH,
            overrides::GROUP_HEIGHT,
            overrides::CONTROL_POINT_COUNT,
        ] {
            assert!(template.source().contains(&format!("override {name}")), "{name}");
        }
        assert!(template.source().contains(&format!("fn {ENTRY_POINT}(")));
    }

    #[test]
    fn every_catalog_formula_expands_to_valid_wgsl() {
        let template = KernelTemplate::bundled();
        for spec in FormulaCatalog::standard().with_both_escape_modes().iter() {
            let source = template.expand(&spec.formula);
            if let Err(err) = validate(&source) {
                panic!("{} failed validation:\n{err}", spec.label());
            }
        }
    }

    #[test]
    fn broken_formula_is_caught_by_validation() {
        let source = KernelTemplate::bundled().expand("cmul(z, undefined_name)");
        assert!(validate(&source).is_err());
    }
}
