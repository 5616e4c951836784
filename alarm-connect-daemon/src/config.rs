//! Daemon Configuration
//!
//! Configuration management for the alarm-connect daemon.

use crate::recovery::ReconnectionStrategy;
use alarm_connect_core::ManagerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the daemon configuration file
pub const CONFIG_FILE_NAME: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection lifecycle settings
    #[serde(default)]
    pub manager: ManagerSection,

    /// Retry policy for panels that are not reachable at setup
    #[serde(default)]
    pub setup: SetupConfig,

    /// Panel link settings
    #[serde(default)]
    pub link: LinkConfig,

    /// Control surface
    #[serde(default)]
    pub control: ControlConfig,

    /// Storage paths
    #[serde(default)]
    pub paths: PathConfig,
}

/// Connection lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSection {
    /// Seconds a client gets to stop before its task is cancelled
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

/// Setup retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Delay before the first retry in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Upper bound for the retry delay in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Retries before the entry is given up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Panel link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for the reconnect delay in seconds
    #[serde(default = "default_max_delay")]
    pub max_reconnect_delay_secs: u64,
}

/// Control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Read JSON service calls from stdin, one per line
    #[serde(default = "default_true")]
    pub stdin: bool,
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Persisted panel entries
    pub entries_file: PathBuf,
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_initial_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            max_reconnect_delay_secs: default_max_delay(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            stdin: default_true(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self::in_dir(default_config_dir())
    }
}

impl PathConfig {
    /// Paths rooted at `config_dir`
    pub fn in_dir(config_dir: PathBuf) -> Self {
        Self {
            entries_file: config_dir.join("entries.toml"),
            config_dir,
        }
    }
}

/// Default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("alarm-connect")
}

impl SetupConfig {
    /// Fresh retry strategy for one entry
    pub fn strategy(&self) -> ReconnectionStrategy {
        ReconnectionStrategy::new(
            Duration::from_secs(self.initial_delay_secs),
            Duration::from_secs(self.max_delay_secs),
            self.max_attempts,
        )
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

impl Config {
    /// Load configuration
    ///
    /// Reads `path` when given, otherwise `daemon.toml` in the default
    /// configuration directory. A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_dir().join(CONFIG_FILE_NAME),
        };

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            // Create default config next to the requested path
            let mut config = Config::default();
            if let Some(dir) = config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
                config.paths = PathConfig::in_dir(dir.to_path_buf());
            }
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Lifecycle manager settings
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            stop_timeout: Duration::from_secs(self.manager.stop_timeout_secs),
        }
    }
}
