use std::path::{Path, PathBuf};

/// Common trait for configuration types
pub trait Configuration {
    /// Returns the file path where this configuration was loaded from
    fn config_path(&self) -> &PathBuf;

    /// Returns a string identifier for the configuration type
    fn config_type(&self) -> &str;

    /// Validates the configuration
    fn validate(&self) -> anyhow::Result<()>;
}

/// Trait for configurations with path elements that need expansion
pub trait PathConfiguration: Configuration {
    /// Returns a copy with `~`/`$VAR` expanded and relative paths anchored at `config_dir`
    fn with_expanded_paths(&self, config_dir: &Path) -> anyhow::Result<Self>
    where
        Self: Sized;
}
