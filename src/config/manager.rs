//! Configuration file handling
//!
//! Reads and writes `.ralph-ui/parallel.yaml` for a project, falling back to the
//! global `~/.ralph-ui/parallel.yaml` and then to built-in defaults.

use super::ParallelConfig;
use crate::error::{ParallelError, Result};
use crate::utils::{config_path, ensure_dir};
use std::path::{Path, PathBuf};

/// Configuration file manager
pub struct ConfigManager {
    config_path: PathBuf,
    global_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Create a new config manager for a project
    pub fn new(project_path: &Path) -> Self {
        Self {
            config_path: config_path(project_path),
            global_path: dirs::home_dir().map(|home| home.join(".ralph-ui").join("parallel.yaml")),
        }
    }

    /// Override (or disable) the global config location
    pub fn with_global_path(mut self, path: Option<PathBuf>) -> Self {
        self.global_path = path;
        self
    }

    /// Check if the project config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read config: project file, else global file, else defaults
    pub fn read(&self) -> Result<ParallelConfig> {
        if let Some(config) = Self::load_from_path(&self.config_path)? {
            return Ok(config);
        }

        if let Some(global) = &self.global_path {
            if let Some(config) = Self::load_from_path(global)? {
                log::debug!("[Config] Using global config {}", global.display());
                return Ok(config);
            }
        }

        Ok(ParallelConfig::default())
    }

    /// Load and validate one config file, `None` if it does not exist
    pub fn load_from_path(path: &Path) -> Result<Option<ParallelConfig>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ParallelError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        let config: ParallelConfig = serde_yaml::from_str(&content).map_err(|e| {
            ParallelError::Config(format!("Failed to parse config file '{}': {}", path.display(), e))
        })?;

        config.validate(false)?;
        Ok(Some(config))
    }

    /// Write config to the project file
    pub fn write(&self, config: &ParallelConfig) -> Result<()> {
        config.validate(false)?;

        if let Some(parent) = self.config_path.parent() {
            ensure_dir(parent)?;
        }

        let content = serde_yaml::to_string(config)
            .map_err(|e| ParallelError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)?;
        log::info!("[Config] Saved config to {}", self.config_path.display());
        Ok(())
    }

    /// Initialize the project config with defaults if it doesn't exist
    pub fn initialize(&self) -> Result<ParallelConfig> {
        if self.exists() {
            return self.read();
        }

        let config = ParallelConfig::default();
        self.write(&config)?;
        Ok(config)
    }

    /// Get the project config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Values given on the command line; `None`/empty means "not given"
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_concurrent: Option<usize>,
    pub primary_branch: Option<String>,
    pub worker_command: Option<String>,
    pub worker_args: Vec<String>,
    pub workspace_root: Option<PathBuf>,
}

/// Merge config values with command-line overrides
pub fn merge_cli_overrides(file_config: &ParallelConfig, cli: &CliOverrides) -> ParallelConfig {
    let mut config = file_config.clone();

    if let Some(max) = cli.max_concurrent {
        config.execution.max_concurrent = max;
    }
    if let Some(branch) = &cli.primary_branch {
        config.git.primary_branch = Some(branch.clone());
    }
    if let Some(root) = &cli.workspace_root {
        config.git.workspace_root = Some(root.clone());
    }
    if let Some(command) = &cli.worker_command {
        config.worker.command = command.clone();
        // A new command never inherits the file's arguments
        config.worker.args = cli.worker_args.clone();
    } else if !cli.worker_args.is_empty() {
        config.worker.args = cli.worker_args.clone();
    }

    config
}
