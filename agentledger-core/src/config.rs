//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/agentledger/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/agentledger/` (~/.config/agentledger/)
//! - Data: `$XDG_DATA_HOME/agentledger/` (~/.local/share/agentledger/)
//! - State/Logs: `$XDG_STATE_HOME/agentledger/` (~/.local/state/agentledger/)
//!
//! Two locations can additionally be overridden by environment variables:
//! - `AGENTLEDGER_DB` — the ledger database file
//! - `AGENTLEDGER_STORAGE` — the host runtime's snapshot storage root

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable overriding the database path
pub const ENV_DB: &str = "AGENTLEDGER_DB";

/// Environment variable overriding the snapshot storage root
pub const ENV_STORAGE: &str = "AGENTLEDGER_STORAGE";

/// Environment variable overriding the host server URL
pub const ENV_HOST_URL: &str = "AGENTLEDGER_HOST_URL";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Host runtime connection settings
    #[serde(default)]
    pub host: HostConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Host runtime connection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// Base URL of the host server API
    #[serde(default = "default_host_url")]
    pub base_url: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_host_timeout")]
    pub timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_url: default_host_url(),
            timeout_secs: default_host_timeout(),
        }
    }
}

impl HostConfig {
    /// Resolve the effective base URL, honoring the env override.
    pub fn resolved_base_url(&self) -> String {
        std::env::var(ENV_HOST_URL).unwrap_or_else(|_| self.base_url.clone())
    }
}

fn default_host_url() -> String {
    "http://127.0.0.1:4096".to_string()
}

fn default_host_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/agentledger/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("agentledger").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite ledger)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("agentledger")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("agentledger")
    }

    /// Returns the ledger database file path.
    ///
    /// `$AGENTLEDGER_DB` if set, otherwise
    /// `$XDG_DATA_HOME/agentledger/ledger.db`.
    pub fn database_path() -> PathBuf {
        std::env::var_os(ENV_DB)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::data_dir().join("ledger.db"))
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("agentledger.log")
    }

    /// Returns the host runtime's snapshot storage root.
    ///
    /// `$AGENTLEDGER_STORAGE` if set; otherwise the first existing of the
    /// host's conventional per-user data directories. Falls back to the
    /// XDG data location even when absent so callers get a stable path to
    /// report in errors.
    pub fn storage_root() -> PathBuf {
        if let Some(root) = std::env::var_os(ENV_STORAGE) {
            return PathBuf::from(root);
        }

        let candidates = [
            xdg_data_home().join("opencode/storage"),
            home_dir().join(".local/share/opencode/storage"),
            home_dir().join(".local/state/opencode/storage"),
        ];

        for candidate in &candidates {
            if candidate.exists() {
                return candidate.clone();
            }
        }

        candidates[0].clone()
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
