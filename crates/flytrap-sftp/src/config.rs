//! Configuration for the honeypot server
//!
//! The config is an immutable snapshot: it is loaded once at startup, wrapped
//! in an `Arc` and never mutated afterwards.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::CatalogEntry;

/// Honeypot server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Accepted usernames. An empty password accepts any password.
    #[serde(default)]
    pub credentials: HashMap<String, String>,

    /// Synthetic files keyed by exact request path
    #[serde(default)]
    pub catalog: HashMap<String, CatalogEntry>,

    /// Seconds slept before answering commands and listings
    #[serde(default)]
    pub command_delay: u64,

    /// Seconds slept before every password check
    #[serde(default)]
    pub login_delay: u64,

    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// OpenSSH private host key; a fresh key is generated when unset
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,

    /// SSH identification string sent to clients
    #[serde(default = "default_server_id")]
    pub server_id: String,

    /// Transport inactivity timeout in seconds
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Maximum concurrent connections per peer IP (0 = unlimited)
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Accept every login without delay or recording
    #[serde(default)]
    pub no_auth: bool,

    /// Telemetry output configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Durable telemetry outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Append-only activity log
    pub activity_log: PathBuf,
    /// Identity snapshot, overwritten on every flush
    pub identity_log: PathBuf,
    /// Flush cadence in seconds
    pub flush_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            activity_log: PathBuf::from("activity.log"),
            identity_log: PathBuf::from("users.json"),
            flush_interval_secs: 5,
        }
    }
}

impl TelemetryConfig {
    /// Flush cadence as a `Duration`
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log shippers
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: HashMap::new(),
            catalog: HashMap::new(),
            command_delay: 0,
            login_delay: 0,
            bind_address: default_bind_address(),
            port: default_port(),
            host_key_path: None,
            server_id: default_server_id(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            max_connections_per_ip: default_max_connections_per_ip(),
            no_auth: false,
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    ///
    /// Files ending in `.json` are parsed as JSON, anything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&content)
                .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
        }
    }

    /// Apply the `-1 means keep` delay overrides from the command line
    pub fn apply_delay_overrides(&mut self, login_delay: i64, command_delay: i64) {
        if let Ok(secs) = u64::try_from(login_delay) {
            self.login_delay = secs;
        }
        if let Ok(secs) = u64::try_from(command_delay) {
            self.command_delay = secs;
        }
    }

    /// Delay applied before commands and listings
    pub fn command_delay(&self) -> Duration {
        Duration::from_secs(self.command_delay)
    }

    /// Delay applied before each password check
    pub fn login_delay(&self) -> Duration {
        Duration::from_secs(self.login_delay)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.telemetry.flush_interval_secs == 0 {
            return Err(crate::Error::Config(
                "telemetry.flush_interval_secs must be greater than zero".to_string(),
            ));
        }

        if self.telemetry.activity_log.as_os_str().is_empty()
            || self.telemetry.identity_log.as_os_str().is_empty()
        {
            return Err(crate::Error::Config(
                "telemetry output paths must not be empty".to_string(),
            ));
        }

        if self.server_id.is_empty() || !self.server_id.starts_with("SSH-2.0-") {
            return Err(crate::Error::Config(format!(
                "server_id must start with SSH-2.0-: {:?}",
                self.server_id
            )));
        }

        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2022
}

fn default_server_id() -> String {
    "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.10".to_string()
}

fn default_inactivity_timeout() -> u64 {
    600
}

fn default_max_connections_per_ip() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.credentials.is_empty());
        assert!(config.catalog.is_empty());
        assert_eq!(config.port, 2022);
        assert_eq!(config.telemetry.flush_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_overrides_respect_sentinel() {
        let mut config = Config {
            login_delay: 3,
            command_delay: 4,
            ..Config::default()
        };

        config.apply_delay_overrides(-1, -1);
        assert_eq!(config.login_delay, 3);
        assert_eq!(config.command_delay, 4);

        config.apply_delay_overrides(0, 7);
        assert_eq!(config.login_delay(), Duration::ZERO);
        assert_eq!(config.command_delay(), Duration::from_secs(7));
    }

    #[test]
    fn test_zero_flush_interval_rejected() {
        let mut config = Config::default();
        config.telemetry.flush_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_server_id_rejected() {
        let config = Config {
            server_id: "OpenSSH".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
