use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use kernel::{
    estimated_underutilization, plan_within, ControlPointModel, DeviceLimits, Extent,
    FormulaCatalog, KernelTemplate, ParameterLayout, Parameters, VariantSpec, ViewParameters,
    DEFAULT_SNAPSHOT_EXTENT,
};
use renderer::{
    capture_file_name, run_preview, save_png, GpuOptions, GpuPowerPreference, HeadlessRenderer,
    PreviewConfig,
};
use settings::{PowerSetting, Settings, Size};
use tracing_subscriber::EnvFilter;

use crate::cli::{
    CatalogArgs, Cli, Command, GpuArgs, PlanArgs, PowerArg, RenderArgs, VariantsArgs, WindowArgs,
};
use crate::paths::AppPaths;

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Plan(args) => run_plan(&args),
        Command::Variants(args) => {
            let settings = load_settings(cli.config.as_deref())?;
            run_variants(&settings, &args)
        }
        Command::Render(args) => {
            let settings = load_settings(cli.config.as_deref())?;
            run_render(&settings, &args)
        }
        Command::Window(args) => {
            let settings = load_settings(cli.config.as_deref())?;
            run_window(&settings, &args)
        }
    }
}

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// An explicit `--config` must exist; the discovered file may be absent.
fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    if let Some(path) = explicit {
        return Settings::load(path).with_context(|| format!("failed to load {}", path.display()));
    }
    let paths = AppPaths::discover()?;
    let path = paths.config_file();
    let settings = Settings::load_or_default(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    tracing::debug!(config = %path.display(), "resolved configuration");
    Ok(settings)
}

/// Standard formulas followed by the configured ones, which may not reuse a
/// standard name.
fn build_catalog(settings: &Settings, args: &CatalogArgs) -> Result<FormulaCatalog> {
    let mut catalog = FormulaCatalog::standard();
    for formula in &settings.formulas {
        let name = formula.name.trim();
        if catalog.contains(name) {
            bail!("formula '{name}' is already part of the standard catalog");
        }
        let spec = VariantSpec::new(name, formula.expression.as_str(), formula.escape);
        catalog.push(match formula.control_points {
            Some(count) => spec.with_layout(ParameterLayout::ControlPoints { count }),
            None => spec,
        });
    }
    if args.all_modes || settings.render.all_modes {
        Ok(catalog.with_both_escape_modes())
    } else {
        Ok(catalog)
    }
}

fn load_template(settings: &Settings, args: &CatalogArgs) -> Result<KernelTemplate> {
    match args.template.as_ref().or(settings.render.template.as_ref()) {
        Some(path) => KernelTemplate::load(path)
            .with_context(|| format!("failed to load kernel template {}", path.display())),
        None => Ok(KernelTemplate::bundled()),
    }
}

fn gpu_options(settings: &Settings, args: &GpuArgs) -> GpuOptions {
    let power = match args.power {
        Some(PowerArg::Low) => GpuPowerPreference::Low,
        Some(PowerArg::High) => GpuPowerPreference::High,
        None => match settings.device.power {
            PowerSetting::Low => GpuPowerPreference::Low,
            PowerSetting::High => GpuPowerPreference::High,
        },
    };
    GpuOptions {
        power,
        execution_width: args.execution_width.or(settings.device.execution_width),
    }
}

fn extent(size: Size) -> Extent {
    Extent::new(size.width, size.height)
}

fn view_parameters(
    settings: &Settings,
    cursor: Option<[f32; 2]>,
    origin: Option<[f32; 2]>,
    zoom: Option<f32>,
) -> ViewParameters {
    let zoom = zoom.unwrap_or(settings.view.zoom);
    ViewParameters::new(
        cursor
            .or(settings.view.cursor)
            .unwrap_or(ViewParameters::default().cursor),
        origin.unwrap_or(settings.view.origin),
        [zoom, zoom],
    )
}

fn parameters_for(layout: ParameterLayout, view: ViewParameters) -> Parameters {
    match layout {
        ParameterLayout::Viewport => Parameters::View(view),
        ParameterLayout::ControlPoints { count } => {
            let derived = ControlPointModel::default().derived();
            Parameters::ControlPoints {
                points: (0..count as usize).map(|i| derived[i % derived.len()]).collect(),
                zoom: view.zoom,
                origin: view.origin,
            }
        }
    }
}

fn run_render(settings: &Settings, args: &RenderArgs) -> Result<()> {
    if let Some(zoom) = args.zoom {
        if !zoom.is_finite() || zoom <= 0.0 {
            bail!("--zoom must be a positive number, got {zoom}");
        }
    }

    let catalog = build_catalog(settings, &args.catalog)?;
    let mut renderer = headless_renderer(settings, &args.catalog, &args.gpu, &catalog)?;

    let index = match args.name.as_deref() {
        Some(name) => renderer
            .find(name)
            .with_context(|| format!("no compiled variant named '{name}'"))?,
        None => args.variant.unwrap_or(settings.render.variant),
    };
    let Some(layout) = renderer.variants().select(index).map(|variant| variant.layout()) else {
        bail!("no kernel variant compiled; see the log for details");
    };
    let size = args.size.unwrap_or(settings.render.size);
    let view = view_parameters(settings, args.cursor, args.origin, args.zoom);
    let parameters = parameters_for(layout, view);

    let image = renderer.render(index, extent(size), Some(&parameters))?;
    let output = args
        .output
        .clone()
        .or_else(|| settings.render.output.clone())
        .unwrap_or_else(|| PathBuf::from(capture_file_name(&chrono::Local::now())));
    save_png(&image, &output)?;
    println!("{}", output.display());
    Ok(())
}

fn run_variants(settings: &Settings, args: &VariantsArgs) -> Result<()> {
    let catalog = build_catalog(settings, &args.catalog)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
    } else {
        for (index, spec) in catalog.iter().enumerate() {
            println!(
                "{index:>3}  {:<28} {:<18} {}",
                spec.label(),
                spec.layout.to_string(),
                spec.formula
            );
        }
    }

    if let Some(dir) = &args.thumbnails {
        let mut renderer = headless_renderer(settings, &args.catalog, &args.gpu, &catalog)?;
        let written = renderer.save_thumbnails(dir, DEFAULT_SNAPSHOT_EXTENT)?;
        tracing::info!(
            count = written.len(),
            dir = %dir.display(),
            "saved variant thumbnails"
        );
        if written.is_empty() {
            bail!("no thumbnail rendered; see the log for details");
        }
    }
    Ok(())
}

fn headless_renderer(
    settings: &Settings,
    catalog_args: &CatalogArgs,
    gpu: &GpuArgs,
    catalog: &FormulaCatalog,
) -> Result<HeadlessRenderer> {
    let template = load_template(settings, catalog_args)?;
    let renderer = HeadlessRenderer::new(&template, catalog, &gpu_options(settings, gpu))?;
    for dropped in renderer.dropped() {
        tracing::warn!(
            variant = %dropped.spec.label(),
            reason = %dropped.reason,
            "variant unavailable"
        );
    }
    Ok(renderer)
}

fn run_plan(args: &PlanArgs) -> Result<()> {
    let output = extent(args.size);
    let limits = DeviceLimits::new(args.max_threads, args.execution_width);
    let plan = plan_within(output, &limits);
    let cost = estimated_underutilization(&plan, output, limits.execution_width);

    if args.json {
        let report = serde_json::json!({
            "output": output,
            "limits": limits,
            "group": plan.group,
            "grid": plan.grid,
            "threads": plan.total_threads(),
            "underutilization": cost,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if plan.is_degenerate() {
        println!("{output}: nothing to dispatch");
        return Ok(());
    }
    let group = plan.group;
    let grid = plan.grid;
    println!("output:  {output}");
    println!("group:   {}x{}x{}", group.x, group.y, group.z);
    println!("grid:    {}x{}x{}", grid.x, grid.y, grid.z);
    println!(
        "threads: {} ({} idle)",
        plan.total_threads(),
        plan.total_threads() - output.area()
    );
    println!("cost:    {cost}");
    Ok(())
}

fn run_window(settings: &Settings, args: &WindowArgs) -> Result<()> {
    let catalog = build_catalog(settings, &args.catalog)?;
    let template = load_template(settings, &args.catalog)?;
    let capture_dir = match args
        .capture_dir
        .clone()
        .or_else(|| settings.preview.capture_dir.clone())
    {
        Some(dir) => dir,
        None => AppPaths::discover()?.captures_dir(),
    };
    let config = PreviewConfig {
        size: extent(args.size.unwrap_or(settings.render.size)),
        initial_variant: args.variant.unwrap_or(settings.render.variant),
        view: view_parameters(settings, None, None, None),
        gpu: gpu_options(settings, &args.gpu),
        frame_interval: settings.preview.frame_interval,
        capture_dir,
    };
    tracing::info!(
        variants = catalog.len(),
        size = %config.size,
        capture_dir = %config.capture_dir.display(),
        "starting preview"
    );
    run_preview(&template, &catalog, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(input: &str) -> Settings {
        Settings::from_toml_str(input).unwrap()
    }

    #[test]
    fn catalog_appends_configured_formulas() {
        let settings = settings(
            r#"
[[formula]]
name = "quartic"
expression = "cmul(cmul(z, z), cmul(z, z)) + c"

[[formula]]
name = "pair"
expression = "cmul(z, z) + p0 + p1"
escape = false
control_points = 2
"#,
        );
        let catalog = build_catalog(&settings, &CatalogArgs::default()).unwrap();
        let standard = FormulaCatalog::standard().len();
        assert_eq!(catalog.len(), standard + 2);
        let last = &catalog.entries()[standard + 1];
        assert_eq!(last.label(), "pair/fixed");
        assert_eq!(last.layout, ParameterLayout::ControlPoints { count: 2 });

        let both = build_catalog(
            &settings,
            &CatalogArgs {
                template: None,
                all_modes: true,
            },
        )
        .unwrap();
        assert_eq!(both.len(), catalog.len() * 2);
    }

    #[test]
    fn configured_formulas_cannot_shadow_standard_ones() {
        let settings =
            settings("[[formula]]\nname = \" julia \"\nexpression = \"cmul(z, z) + Z\"\n");
        let err = build_catalog(&settings, &CatalogArgs::default()).unwrap_err();
        assert!(err.to_string().contains("'julia'"), "{err}");
    }

    #[test]
    fn flags_override_settings() {
        let settings = settings(
            "[view]\ncursor = [1.0, 2.0]\nzoom = 2.0\n[device]\npower = \"low\"\nexecution_width = 16\n",
        );

        let view = view_parameters(&settings, None, Some([3.0, 4.0]), None);
        assert_eq!(view, ViewParameters::new([1.0, 2.0], [3.0, 4.0], [2.0, 2.0]));
        let view = view_parameters(&Settings::default(), None, None, Some(0.5));
        assert_eq!(view.cursor, ViewParameters::default().cursor);
        assert_eq!(view.zoom, [0.5, 0.5]);

        let options = gpu_options(&settings, &GpuArgs::default());
        assert_eq!(options.power, GpuPowerPreference::Low);
        assert_eq!(options.execution_width, Some(16));
        let options = gpu_options(
            &settings,
            &GpuArgs {
                power: Some(PowerArg::High),
                execution_width: Some(64),
            },
        );
        assert_eq!(options.power, GpuPowerPreference::High);
        assert_eq!(options.execution_width, Some(64));
    }

    #[test]
    fn control_point_variants_get_control_point_parameters() {
        let view = ViewParameters::new([0.0, 0.0], [5.0, 6.0], [2.0, 2.0]);
        let parameters = parameters_for(ParameterLayout::ControlPoints { count: 3 }, view);
        assert_eq!(parameters.layout(), ParameterLayout::ControlPoints { count: 3 });
        let Parameters::ControlPoints { points, zoom, origin } = parameters else {
            panic!("expected control points");
        };
        assert_eq!(points[0], points[2]);
        assert_eq!(zoom, [2.0, 2.0]);
        assert_eq!(origin, [5.0, 6.0]);
        assert_eq!(parameters_for(ParameterLayout::Viewport, view), Parameters::View(view));
    }

    #[test]
    fn missing_template_is_reported() {
        let settings = Settings::default();
        let args = CatalogArgs {
            template: Some(PathBuf::from("/nonexistent/kernel.wgsl")),
            all_modes: false,
        };
        assert!(load_template(&settings, &args).is_err());
        assert!(load_template(&settings, &CatalogArgs::default()).is_ok());
    }
}
