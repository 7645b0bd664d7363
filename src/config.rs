//! Configuration management
//!
//! Server binding, history database location, and the pipeline's timing
//! knobs. Loaded from TOML in the platform config directory; a missing file
//! gets defaults written back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Server binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Chat history storage. No path means the in-process fallback store.
/// The `VOXGATE_DB` environment variable overrides the configured path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        std::env::var("VOXGATE_DB")
            .ok()
            .map(PathBuf::from)
            .or_else(|| self.path.clone())
    }
}

/// Pipeline timing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Wall-clock budget for one streaming synthesis.
    #[serde(default = "default_tts_total_timeout_secs")]
    pub tts_total_timeout_secs: u64,
    /// Receive windows tolerated before streaming synthesis is abandoned.
    #[serde(default = "default_tts_max_timeouts")]
    pub tts_max_timeouts: u32,
    /// How often the safety sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Processing age after which a session counts as stuck.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
}

fn default_tts_total_timeout_secs() -> u64 {
    45
}

fn default_tts_max_timeouts() -> u32 {
    2
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_stuck_after_secs() -> u64 {
    30
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tts_total_timeout_secs: default_tts_total_timeout_secs(),
            tts_max_timeouts: default_tts_max_timeouts(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stuck_after_secs: default_stuck_after_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn tts_total_timeout(&self) -> Duration {
        Duration::from_secs(self.tts_total_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path
            .parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voxgate", "voxgate")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}
