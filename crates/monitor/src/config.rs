//! Configuration management for the Deskwatch monitor.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/deskwatch/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{CommandSet, ProtocolError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("machine names must not be empty")]
    EmptyMachineName,

    #[error("machine {0:?} is listed more than once")]
    DuplicateMachine(String),

    #[error("poll_interval_secs must be between 1 and 86400, got {0}")]
    InvalidPollInterval(u64),

    #[error("preview_interval_secs must be between 1 and 86400, got {0}")]
    InvalidPreviewInterval(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("invalid command configuration: {0}")]
    Commands(#[from] ProtocolError),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for both timer periods.
const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Main configuration structure for the monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub monitor: MonitorConfig,

    /// Machines to watch and how often.
    pub machines: MachinesConfig,

    /// Commands used to talk to the remote session tool.
    pub commands: CommandSet,
}

/// General monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for the rotating log file.
    pub log_dir: PathBuf,

    /// Directory in which preview images are created.
    pub preview_dir: PathBuf,
}

/// Machine polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MachinesConfig {
    /// Machine names, in display order.
    pub names: Vec<String>,

    /// Seconds between two session list polls of one machine.
    pub poll_interval_secs: u64,

    /// Seconds between two preview captures of one session.
    pub preview_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: default_log_dir(),
            preview_dir: std::env::temp_dir(),
        }
    }
}

impl Default for MachinesConfig {
    fn default() -> Self {
        Self {
            names: vec!["MACH1".to_string(), "MACH2".to_string()],
            poll_interval_secs: 10,
            preview_interval_secs: 60,
        }
    }
}

impl MachinesConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Preview interval as a duration.
    pub fn preview_interval(&self) -> Duration {
        Duration::from_secs(self.preview_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deskwatch")
        .join("config.toml")
}

/// Returns the default log directory.
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deskwatch")
        .join("logs")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DESKWATCH_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - DESKWATCH_MACHINES: Comma separated machine names
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("DESKWATCH_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.monitor.log_level = level;
            }
        }

        if let Ok(machines) = std::env::var("DESKWATCH_MACHINES") {
            let names: Vec<String> = machines
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            if !names.is_empty() {
                tracing::info!("Overriding machines from environment: {:?}", names);
                self.machines.names = names;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for name in &self.machines.names {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyMachineName);
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateMachine(name.clone()));
            }
        }

        let poll = self.machines.poll_interval_secs;
        if poll == 0 || poll > MAX_INTERVAL_SECS {
            return Err(ConfigError::InvalidPollInterval(poll));
        }

        let preview = self.machines.preview_interval_secs;
        if preview == 0 || preview > MAX_INTERVAL_SECS {
            return Err(ConfigError::InvalidPreviewInterval(preview));
        }

        let level = self.monitor.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.monitor.log_level.clone()));
        }

        self.commands.validate()?;

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration, writing the defaults first if the file is missing.
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            return Self::load(path);
        }

        tracing::info!("Creating default configuration at {:?}", path);
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load_or_init(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
