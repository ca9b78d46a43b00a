//! Configuration file handling for uf2b

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Controller address used when nothing else is configured
pub const DEFAULT_SERVER: &str = "http://192.168.1.52";

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default controller URL
    pub server: Option<String>,
    /// Default output format
    pub output: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
    /// Number of USB ports on the board
    pub capacity: Option<usize>,
    /// YAML board configuration (endpoints, timeouts)
    pub board: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("uf2b");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(
        &self,
        server: Option<&str>,
        board: Option<&Path>,
        capacity: Option<usize>,
        no_color: bool,
    ) -> MergedConfig {
        MergedConfig {
            server: server.map(String::from).or_else(|| self.server.clone()),
            board: board.map(Path::to_path_buf).or_else(|| self.board.clone()),
            capacity: capacity.or(self.capacity),
            no_color: no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    /// Controller URL, when given on the command line or in the config file
    pub server: Option<String>,
    pub board: Option<PathBuf>,
    pub capacity: Option<usize>,
    pub no_color: bool,
}
