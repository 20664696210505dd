//! CLI configuration file support.
//!
//! Configuration precedence:
//! 1. CLI arguments (handled by clap)
//! 2. Environment variables (`CALLSHEET_LOG_LEVEL`, `CALLSHEET_TOKEN`)
//! 3. Local config file (./.callsheetrc)
//! 4. Global config file (~/.callsheet/config.toml)
//! 5. Defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the log level.
pub const LOG_LEVEL_ENV: &str = "CALLSHEET_LOG_LEVEL";

/// Environment variable carrying a bearer token for every audience.
pub const TOKEN_ENV: &str = "CALLSHEET_TOKEN";

/// CLI configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Log level
    #[serde(default)]
    pub log_level: Option<String>,

    /// Fallback bearer token for audiences the plan has no token for
    #[serde(default)]
    pub token: Option<String>,

    /// Output format preferences
    #[serde(default)]
    pub output: OutputConfig,
}

/// Output format configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Default output format (human, json)
    #[serde(default = "default_output_format")]
    pub format: String,

    /// Always use JSON output
    #[serde(default)]
    pub always_json: bool,
}

fn default_output_format() -> String {
    "human".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { format: default_output_format(), always_json: false }
    }
}

impl OutputConfig {
    /// Whether run events should be printed as JSON lines.
    pub fn wants_json(&self) -> bool {
        self.always_json || self.format == "json"
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum CliConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),
}

/// Result type for configuration operations.
pub type CliConfigResult<T> = std::result::Result<T, CliConfigError>;

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> CliConfigResult<Self> {
        if !path.exists() {
            return Err(CliConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CliConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content)
            .map_err(|e| CliConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Get default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".callsheet")
            .join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".callsheetrc")
    }

    /// Discover and load configuration files, then apply environment overrides.
    ///
    /// Missing files are skipped; files that fail to parse are reported and skipped.
    pub fn discover_and_load() -> Self {
        let mut config = Self::default();

        for path in [Self::default_global_path(), Self::default_local_path()] {
            match Self::load_from_file(&path) {
                Ok(file_config) => config.merge(&file_config),
                Err(CliConfigError::NotFound(_)) => {}
                Err(e) => eprintln!("warning: {e}"),
            }
        }

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &Self) {
        if let Some(ref log_level) = other.log_level {
            self.log_level = Some(log_level.clone());
        }
        if let Some(ref token) = other.token {
            self.token = Some(token.clone());
        }
        if other.output.always_json {
            self.output.always_json = true;
        }
        if other.output.format != "human" {
            self.output.format = other.output.format.clone();
        }
    }

    /// Overrides file values with environment variables read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup(LOG_LEVEL_ENV).filter(|v| !v.is_empty()) {
            self.log_level = Some(level);
        }
        if let Some(token) = lookup(TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.token = Some(token);
        }
    }
}
