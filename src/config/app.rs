use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::traits::{Configuration, PathConfiguration};
use crate::path_utils;

/// File looked up in the working directory when no `--app-config` is given
pub const DEFAULT_APP_CONFIG: &str = "benchci.yml";

/// Application configuration loaded from benchci.yml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Output directory template used when neither the CLI nor the pipeline sets one
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Time a stage may take when neither the stage nor the pipeline sets one
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when stopping a stage
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Shell used to run stage command lines
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Benchmark driver script invoked by `benchci bench`
    #[serde(default = "default_driver")]
    pub driver: PathBuf,
    /// Log child output at info level while it runs
    #[serde(default = "default_stream_output")]
    pub stream_output: bool,
    /// Path to the config file (set during loading)
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_output_dir() -> String {
    "output/{project}/{pipeline_id}/{run_id}".to_string()
}

fn default_stage_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_driver() -> PathBuf {
    PathBuf::from("tools/benchmark.sh")
}

fn default_stream_output() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            stage_timeout_secs: default_stage_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            shell: default_shell(),
            driver: default_driver(),
            stream_output: default_stream_output(),
            path: PathBuf::new(),
        }
    }
}

impl AppConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Configuration for AppConfig {
    fn config_path(&self) -> &PathBuf {
        &self.path
    }

    fn config_type(&self) -> &str {
        "application"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.output_dir.trim().is_empty() {
            anyhow::bail!("output_dir template cannot be empty");
        }
        if self.stage_timeout_secs == 0 {
            anyhow::bail!("stage_timeout_secs must be greater than zero");
        }
        if self.shell.trim().is_empty() {
            anyhow::bail!("shell cannot be empty");
        }
        Ok(())
    }
}

impl PathConfiguration for AppConfig {
    fn with_expanded_paths(&self, config_dir: &Path) -> anyhow::Result<Self> {
        let mut config = self.clone();
        let driver = path_utils::expand_path_buf(&config.driver);
        config.driver = path_utils::absolutize(&driver, config_dir);
        Ok(config)
    }
}

/// Load application configuration.
///
/// An explicitly given file must exist. Without one, `benchci.yml` in the
/// working directory is used when present and built-in defaults otherwise.
pub fn load_app_config(app_config_path: Option<&Path>) -> Result<AppConfig> {
    let app_config_path = match app_config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("App config file not found: {:?}", path);
            }
            path.to_path_buf()
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_APP_CONFIG);
            if !default_path.exists() {
                debug!("No {} found, using default application configuration", DEFAULT_APP_CONFIG);
                let config = AppConfig::default();
                config.validate()?;
                return Ok(config);
            }
            default_path
        }
    };

    let config_dir = app_config_path
        .parent()
        .context("Failed to get app config directory")?;

    let contents = std::fs::read_to_string(&app_config_path)
        .with_context(|| format!("Failed to read app config file: {:?}", app_config_path))?;

    let mut config: AppConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse YAML from file: {:?}", app_config_path))?;

    config.path = app_config_path.clone();

    let config = config.with_expanded_paths(config_dir)?;
    config.validate()?;

    debug!("Using {} configuration\n{:?}", config.config_type(), config);
    Ok(config)
}
