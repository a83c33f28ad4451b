/// Application configuration
pub mod app;
pub use app::{load_app_config, AppConfig, DEFAULT_APP_CONFIG};

/// Pipeline definition loading and validation
pub mod pipeline;
pub use pipeline::{load_pipeline, load_pipeline_file, validate_pipeline};

/// Configuration traits
pub mod traits;
pub use traits::{Configuration, PathConfiguration};

/// Tests for configuration
#[cfg(test)]
mod tests;

use std::time::Duration;

use crate::pipeline::Pipeline;

/// Global configuration containing both app and pipeline configurations
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Application configuration
    pub app: AppConfig,
    /// Pipeline definition
    pub pipeline: Pipeline,
}

impl GlobalConfig {
    /// Output directory template: CLI flag, then pipeline, then application default
    pub fn output_template<'a>(&'a self, cli_override: Option<&'a str>) -> &'a str {
        cli_override
            .or(self.pipeline.output_dir.as_deref())
            .unwrap_or(self.app.output_dir.as_str())
    }

    /// Stage timeout for stages that set none themselves
    pub fn default_timeout(&self) -> Duration {
        self.pipeline
            .timeout
            .unwrap_or_else(|| self.app.stage_timeout())
    }
}

impl Configuration for GlobalConfig {
    fn config_path(&self) -> &std::path::PathBuf {
        // The GlobalConfig doesn't have its own path, so we return the pipeline path
        self.pipeline.config_path()
    }

    fn config_type(&self) -> &str {
        "global"
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.app.validate()?;
        self.pipeline.validate()?;

        Ok(())
    }
}
