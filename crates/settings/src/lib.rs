use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "iterscope.toml";
pub const CURRENT_VERSION: u32 = 1;
/// Longest accepted `preview.frame_interval`.
pub const MAX_FRAME_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Output size written as `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Size {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        let (width, height) = normalized
            .split_once('x')
            .ok_or_else(|| format!("invalid size '{raw}'; expected WIDTHxHEIGHT"))?;
        let parse = |value: &str| {
            value
                .trim()
                .parse::<u32>()
                .map_err(|err| format!("invalid size '{raw}': {err}"))
        };
        Ok(Self::new(parse(width)?, parse(height)?))
    }
}

impl Serialize for Size {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSetting {
    Low,
    #[default]
    High,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub render: RenderSettings,
    #[serde(default)]
    pub view: ViewSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub preview: PreviewSettings,
    #[serde(default, rename = "formula")]
    pub formulas: Vec<FormulaSettings>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RenderSettings {
    #[serde(default = "default_size")]
    pub size: Size,
    #[serde(default)]
    pub variant: usize,
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Custom kernel template replacing the bundled one.
    #[serde(default)]
    pub template: Option<PathBuf>,
    /// Build every formula in both escape modes.
    #[serde(default)]
    pub all_modes: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ViewSettings {
    /// Pixel position; defaults to the kernel's own default cursor.
    #[serde(default)]
    pub cursor: Option<[f32; 2]>,
    #[serde(default)]
    pub origin: [f32; 2],
    #[serde(default = "default_zoom")]
    pub zoom: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub power: PowerSetting,
    /// Overrides the execution width guessed from the adapter vendor.
    #[serde(default)]
    pub execution_width: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PreviewSettings {
    #[serde(
        default = "default_frame_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub frame_interval: Duration,
    #[serde(default)]
    pub capture_dir: Option<PathBuf>,
}

/// A user formula appended to the standard catalog.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FormulaSettings {
    pub name: String,
    pub expression: String,
    #[serde(default = "default_escape")]
    pub escape: bool,
    /// Reads this many control points instead of the viewport parameters.
    #[serde(default)]
    pub control_points: Option<u32>,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_size() -> Size {
    Size::new(1024, 768)
}

fn default_zoom() -> f32 {
    1.0
}

fn default_escape() -> bool {
    true
}

fn default_frame_interval() -> Duration {
    Duration::from_millis(33)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            render: RenderSettings::default(),
            view: ViewSettings::default(),
            device: DeviceSettings::default(),
            preview: PreviewSettings::default(),
            formulas: Vec::new(),
        }
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            size: default_size(),
            variant: 0,
            output: None,
            template: None,
            all_modes: false,
        }
    }
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            cursor: None,
            origin: [0.0, 0.0],
            zoom: default_zoom(),
        }
    }
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            frame_interval: default_frame_interval(),
            capture_dir: None,
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if !v.is_finite() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Duration::try_from_secs_f64(v)
                .map_err(|err| E::custom(format!("invalid duration {v}: {err}")))
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_str(&humantime::format_duration(*duration))
}

impl Settings {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: Settings = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Like [`Settings::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CURRENT_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected {CURRENT_VERSION}",
                self.version
            )));
        }

        let size = self.render.size;
        if size.width == 0 || size.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "render.size must be non-empty, got {size}"
            )));
        }

        if !self.view.zoom.is_finite() || self.view.zoom <= 0.0 {
            return Err(ConfigError::Invalid("view.zoom must be a positive number".into()));
        }

        let mut coordinates = self.view.cursor.iter().flatten().chain(self.view.origin.iter());
        if coordinates.any(|value| !value.is_finite()) {
            return Err(ConfigError::Invalid("view coordinates must be finite".into()));
        }

        if self.device.execution_width == Some(0) {
            return Err(ConfigError::Invalid("device.execution_width must be > 0".into()));
        }

        if self.preview.frame_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "preview.frame_interval must be greater than zero".into(),
            ));
        }
        if self.preview.frame_interval > MAX_FRAME_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "preview.frame_interval must be at most {}",
                humantime::format_duration(MAX_FRAME_INTERVAL)
            )));
        }

        let mut names = BTreeSet::new();
        for formula in &self.formulas {
            let name = formula.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid("formula with empty name".into()));
            }
            if !names.insert(name) {
                return Err(ConfigError::Invalid(format!("formula '{name}' is defined twice")));
            }
            if formula.expression.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "formula '{name}' has an empty expression"
                )));
            }
            if formula.control_points == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "formula '{name}' control_points must be > 0"
                )));
            }
        }

        Ok(())
    }
}
