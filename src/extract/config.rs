//! Extraction run configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Where extracted content goes
    pub output_dir: PathBuf,

    /// Recursion bound for nested archives
    pub max_depth: usize,

    /// Move consumed archives to the trash after successful extraction
    pub cleanup: bool,

    /// Allow interactive password prompting
    pub interactive: bool,

    /// Wall-clock bound per backend invocation
    pub timeout: Duration,

    /// Overwrite existing files in the output tree
    pub overwrite: bool,

    /// Trash location for cleanup; defaults to the app data dir
    pub trash_root: Option<PathBuf>,

    /// Optional cloak rule store overriding the built-in rules
    pub cloak_rules: Option<PathBuf>,
}

impl ExtractConfig {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            max_depth: 5,
            cleanup: false,
            interactive: false,
            timeout: Duration::from_secs(3600),
            overwrite: false,
            trash_root: None,
            cloak_rules: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutputDir);
        }
        if self.output_dir.is_file() {
            return Err(ConfigError::OutputDirIsFile(self.output_dir.clone()));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::ZeroMaxDepth);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Output directory must be set")]
    EmptyOutputDir,

    #[error("Output directory is an existing file: {0}")]
    OutputDirIsFile(PathBuf),

    #[error("Max depth must be at least 1")]
    ZeroMaxDepth,

    #[error("Backend timeout must be non-zero")]
    ZeroTimeout,
}
