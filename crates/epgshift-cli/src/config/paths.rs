//! Config file and data directory locations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::AppConfig;

/// Name used for the per-user config and data directories.
const APP_DIR: &str = "epgshift";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Where one invocation reads its config and keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    /// TOML config file (may not exist).
    pub config_file: PathBuf,
    /// Data directory used unless `[paths] data_dir` overrides it.
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Resolves locations for `--dir`.
    ///
    /// A project directory holds both `config.toml` and the data areas.
    /// Without one, the config lives in `~/.config/epgshift` and the data in
    /// `~/.local/share/epgshift`.
    ///
    /// # Errors
    ///
    /// Returns an error if `HOME` is not set and `dir` is `None`.
    pub fn resolve(dir: Option<&Path>) -> Result<Self> {
        if let Some(d) = dir {
            return Ok(Self {
                config_file: d.join(CONFIG_FILE),
                data_dir: d.to_path_buf(),
            });
        }

        let home = std::env::var_os("HOME").context("HOME environment variable is not set")?;
        Ok(Self::under_home(Path::new(&home)))
    }

    fn under_home(home: &Path) -> Self {
        Self {
            config_file: home.join(".config").join(APP_DIR).join(CONFIG_FILE),
            data_dir: home.join(".local").join("share").join(APP_DIR),
        }
    }

    /// Data directory after applying the config's `[paths] data_dir`.
    #[must_use]
    pub fn data_dir_for(&self, config: &AppConfig) -> PathBuf {
        config
            .paths
            .data_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.clone())
    }
}
