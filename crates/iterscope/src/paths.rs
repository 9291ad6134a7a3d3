use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use directories_next::ProjectDirs;
use settings::CONFIG_FILE_NAME;

pub const ENV_CONFIG_DIR: &str = "ITERSCOPE_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "ITERSCOPE_DATA_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "Iterscope";
const APPLICATION: &str = "iterscope";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let config_override = env_override(ENV_CONFIG_DIR);
        let data_override = env_override(ENV_DATA_DIR);
        if let (Some(config_dir), Some(data_dir)) =
            (config_override.clone(), data_override.clone())
        {
            return Ok(Self { config_dir, data_dir });
        }

        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;
        Ok(Self {
            config_dir: config_override.unwrap_or_else(|| project_dirs.config_dir().to_path_buf()),
            data_dir: data_override.unwrap_or_else(|| project_dirs.data_dir().to_path_buf()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Default destination for window snapshots.
    pub fn captures_dir(&self) -> PathBuf {
        self.data_dir.join("captures")
    }
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
