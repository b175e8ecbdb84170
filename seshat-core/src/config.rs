//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/seshat/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/seshat/` (~/.config/seshat/)
//! - Data: `$XDG_DATA_HOME/seshat/` (~/.local/share/seshat/)
//! - State/Logs: `$XDG_STATE_HOME/seshat/` (~/.local/state/seshat/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

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
    /// Source root overrides and host filters
    #[serde(default)]
    pub sources: SourceOverrides,

    /// Scan and indexing behavior
    #[serde(default)]
    pub scan: ScanConfig,

    /// External scanner behavior for derived metrics
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Override paths for source log directories
#[derive(Debug, Deserialize, Default, Clone)]
pub struct SourceOverrides {
    /// Override path for Claude Code logs (default ~/.claude)
    pub claude_path: Option<PathBuf>,
    /// Override path for Codex logs (default ~/.codex)
    pub codex_path: Option<PathBuf>,
    /// Override path for Gemini logs (default ~/.gemini)
    pub gemini_path: Option<PathBuf>,
    /// Only index sessions from these hosts (empty = all hosts)
    #[serde(default)]
    pub enabled_hosts: Vec<String>,
}

/// Scan and indexing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Maximum number of files parsed concurrently
    #[serde(default = "default_parse_workers")]
    pub parse_workers: usize,

    /// Restrict indexing to these project ids (empty = all projects)
    #[serde(default)]
    pub project_ids: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            parse_workers: default_parse_workers(),
            project_ids: vec![],
        }
    }
}

fn default_parse_workers() -> usize {
    8
}

/// External scanner configuration for the derived-metrics cache
#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    /// Executable used for batch text scanning
    #[serde(default = "default_scanner_program")]
    pub program: String,

    /// Delay between scan batches in milliseconds
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            program: default_scanner_program(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

fn default_scanner_program() -> String {
    "rg".to_string()
}

fn default_batch_delay_ms() -> u64 {
    25
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// Returns defaults if the config file does not exist.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", config_path.display(), e)))
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Path to the config file: `$XDG_CONFIG_HOME/seshat/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("seshat/config.toml")
    }

    /// Path to the index store database: `$XDG_DATA_HOME/seshat/index.db`
    pub fn index_path() -> PathBuf {
        xdg_data_home().join("seshat/index.db")
    }

    /// Path to the derived-metric cache database: `$XDG_DATA_HOME/seshat/metrics.db`
    pub fn metric_cache_path() -> PathBuf {
        xdg_data_home().join("seshat/metrics.db")
    }

    /// Directory for log files: `$XDG_STATE_HOME/seshat/`
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("seshat")
    }

    /// Path to the rolling log file
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("seshat.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.scanner.program, "rg");
        assert_eq!(config.scan.parse_workers, 8);
        assert!(config.sources.enabled_hosts.is_empty());
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
            [sources]
            claude_path = "/tmp/claude"
            enabled_hosts = ["workstation"]

            [scan]
            parse_workers = 2

            [scanner]
            program = "grep"
            batch_delay_ms = 0

            [logging]
            level = "debug"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.sources.claude_path,
            Some(PathBuf::from("/tmp/claude"))
        );
        assert_eq!(config.sources.enabled_hosts, vec!["workstation"]);
        assert_eq!(config.scan.parse_workers, 2);
        assert_eq!(config.scanner.program, "grep");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_index_path_suffix() {
        assert!(Config::index_path().ends_with("seshat/index.db"));
        assert!(Config::metric_cache_path().ends_with("seshat/metrics.db"));
    }
}
