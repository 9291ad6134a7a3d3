use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use settings::Size;

#[derive(Parser, Debug)]
#[command(
    name = "iterscope",
    author,
    version,
    about = "GPU fractal renderer built on wgpu compute kernels"
)]
pub struct Cli {
    /// Configuration file; defaults to `iterscope.toml` in the config directory.
    #[arg(long, global = true, value_name = "FILE", env = "ITERSCOPE_CONFIG")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render one variant off-screen and save it as PNG.
    Render(RenderArgs),
    /// List the variants the catalog would build.
    Variants(VariantsArgs),
    /// Print the thread-group plan for an output size. Needs no GPU.
    Plan(PlanArgs),
    /// Open an interactive preview window.
    Window(WindowArgs),
}

#[derive(Args, Debug, Default)]
pub struct CatalogArgs {
    /// Kernel template to expand instead of the bundled one.
    #[arg(long, value_name = "PATH")]
    pub template: Option<PathBuf>,

    /// Build every formula with and without escape iteration.
    #[arg(long)]
    pub all_modes: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PowerArg {
    Low,
    High,
}

#[derive(Args, Debug, Default)]
pub struct GpuArgs {
    /// Adapter power preference.
    #[arg(long, value_enum, value_name = "PREFERENCE")]
    pub power: Option<PowerArg>,

    /// Override the SIMD execution width used for thread-group planning.
    #[arg(
        long,
        value_name = "THREADS",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub execution_width: Option<u32>,
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Catalog index of the variant to render (wraps around).
    #[arg(long, value_name = "N")]
    pub variant: Option<usize>,

    /// Variant name or `name/mode` label; takes precedence over `--variant`.
    #[arg(long, value_name = "NAME", conflicts_with = "variant")]
    pub name: Option<String>,

    /// Output size (e.g. `1024x768`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<Size>,

    /// PNG path; defaults to a timestamped capture name in the working directory.
    #[arg(long, short, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Cursor position in output pixels.
    #[arg(long, value_name = "X,Y", value_parser = parse_pair)]
    pub cursor: Option<[f32; 2]>,

    /// View offset in output pixels.
    #[arg(
        long,
        value_name = "X,Y",
        value_parser = parse_pair,
        allow_hyphen_values = true
    )]
    pub origin: Option<[f32; 2]>,

    /// Zoom factor applied to the visible span.
    #[arg(long, value_name = "FACTOR")]
    pub zoom: Option<f32>,

    #[command(flatten)]
    pub catalog: CatalogArgs,

    #[command(flatten)]
    pub gpu: GpuArgs,
}

#[derive(Args, Debug, Default)]
pub struct VariantsArgs {
    /// Emit JSON instead of a table.
    #[arg(long)]
    pub json: bool,

    /// Also render every compiled variant and save one PNG per variant here.
    #[arg(long, value_name = "DIR")]
    pub thumbnails: Option<PathBuf>,

    #[command(flatten)]
    pub catalog: CatalogArgs,

    #[command(flatten)]
    pub gpu: GpuArgs,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Output size (e.g. `1024x768`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Size,

    /// Maximum threads per group.
    #[arg(
        long,
        value_name = "N",
        default_value_t = 1024,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_threads: u32,

    /// SIMD execution width.
    #[arg(
        long,
        value_name = "N",
        default_value_t = 32,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub execution_width: u32,

    /// Emit JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct WindowArgs {
    /// Initial window size.
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<Size>,

    /// Catalog index shown first.
    #[arg(long, value_name = "N")]
    pub variant: Option<usize>,

    /// Directory snapshots are saved to.
    #[arg(long, value_name = "DIR")]
    pub capture_dir: Option<PathBuf>,

    #[command(flatten)]
    pub catalog: CatalogArgs,

    #[command(flatten)]
    pub gpu: GpuArgs,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<Size, String> {
    let size: Size = value.parse()?;
    if size.width == 0 || size.height == 0 {
        return Err(format!("size {size} must be greater than zero"));
    }
    Ok(size)
}

pub fn parse_pair(value: &str) -> Result<[f32; 2], String> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| format!("invalid pair '{value}'; expected X,Y"))?;
    let parse = |raw: &str| {
        raw.trim()
            .parse::<f32>()
            .ok()
            .filter(|parsed| parsed.is_finite())
            .ok_or_else(|| format!("invalid number '{}' in '{value}'", raw.trim()))
    };
    Ok([parse(x)?, parse(y)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_sizes_and_pairs() {
        assert_eq!(parse_size("1024x768"), Ok(Size::new(1024, 768)));
        assert!(parse_size("0x768").is_err());
        assert!(parse_size("1024").is_err());

        assert_eq!(parse_pair("10, -2.5"), Ok([10.0, -2.5]));
        assert!(parse_pair("10").is_err());
        assert!(parse_pair("a,b").is_err());
        assert!(parse_pair("inf,0").is_err());
    }

    #[test]
    fn render_flags_reach_their_fields() {
        let cli = Cli::try_parse_from([
            "iterscope",
            "render",
            "--variant",
            "3",
            "--size",
            "64x32",
            "--origin",
            "-5,7",
            "--all-modes",
            "--power",
            "low",
        ])
        .unwrap();
        let Command::Render(args) = cli.command else {
            panic!("expected render");
        };
        assert_eq!(args.variant, Some(3));
        assert_eq!(args.size, Some(Size::new(64, 32)));
        assert_eq!(args.origin, Some([-5.0, 7.0]));
        assert!(args.catalog.all_modes);
        assert_eq!(args.gpu.power, Some(PowerArg::Low));
    }

    #[test]
    fn variants_take_a_thumbnail_directory() {
        let cli = Cli::try_parse_from(["iterscope", "variants"]).unwrap();
        let Command::Variants(args) = cli.command else {
            panic!("expected variants");
        };
        assert_eq!(args.thumbnails, None);

        let cli = Cli::try_parse_from([
            "iterscope",
            "variants",
            "--thumbnails",
            "thumbs",
            "--power",
            "low",
        ])
        .unwrap();
        let Command::Variants(args) = cli.command else {
            panic!("expected variants");
        };
        assert_eq!(args.thumbnails, Some(PathBuf::from("thumbs")));
        assert_eq!(args.gpu.power, Some(PowerArg::Low));
    }

    #[test]
    fn plan_requires_a_size() {
        assert!(Cli::try_parse_from(["iterscope", "plan"]).is_err());
        let cli = Cli::try_parse_from(["iterscope", "plan", "--size", "7x3"]).unwrap();
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(args.max_threads, 1024);
        assert_eq!(args.execution_width, 32);
    }
}
