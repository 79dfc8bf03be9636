//! Configuration Module
//!
//! Loads the forwarder configuration with support for:
//! - TOML (`.toml`) or INI (`.ini`) files with `[source]` and `[destination]` sections
//! - `${VAR}` / `${VAR:-default}` substitution inside the file
//! - Environment variable overrides (`MQTT_FORWARDER__*` prefix)
//!
//! A minimal file:
//!
//! ```toml
//! [source]
//! broker = "localhost"
//! port = 1883
//! client_id = "forwarder_src"
//! topic = "sensors/temp"
//!
//! [destination]
//! broker = "remote.example"
//! port = 1884
//! client_id = "forwarder_dst"
//! topic = "relay/temp"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use endpoint::EndpointConfig;

use endpoint::TopicUse;

mod endpoint;

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "MQTT_FORWARDER";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file does not exist
    NotFound(PathBuf),
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error (syntax, missing or mistyped keys)
    Config(config::ConfigError),
    /// Substitution pattern error
    Pattern(regex::Error),
    /// Validation error
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Pattern(e) => write!(f, "Substitution pattern error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<regex::Error> for ConfigError {
    fn from(e: regex::Error) -> Self {
        ConfigError::Pattern(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeConfig {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Broker messages are read from
    pub source: EndpointConfig,
    /// Broker messages are republished to
    pub destination: EndpointConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Pick the file format from the path's extension; TOML unless it is `.ini`
fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    }
}

impl BridgeConfig {
    /// Load configuration from a file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the file
    /// 2. Override via env vars: `MQTT_FORWARDER__` prefix with double underscores for nesting:
    ///    - `MQTT_FORWARDER__SOURCE__BROKER=10.0.0.5` overrides `source.broker`
    ///    - `MQTT_FORWARDER__DESTINATION__PORT=8883` overrides `destination.port`
    ///
    /// Unlike optional settings files, the file must exist: the broker
    /// endpoints have no sensible defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let substituted = substitute_env_vars(&content)?;

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = config::Config::builder()
            .set_default("log.level", "info")?
            .add_source(File::from_str(&substituted, file_format(path)))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BridgeConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source.validate("source", TopicUse::Filter)?;
        self.destination.validate("destination", TopicUse::Name)?;

        if self.source.same_broker(&self.destination) {
            // A broker drops the older session when a client id is reused
            if self.source.client_id == self.destination.client_id {
                return Err(ConfigError::Validation(format!(
                    "source and destination share broker {} and client_id '{}'",
                    self.source.address(),
                    self.source.client_id
                )));
            }

            // Forwarded messages would be received again and forwarded forever
            if crate::topic::topic_matches_filter(&self.destination.topic, &self.source.topic) {
                return Err(ConfigError::Validation(format!(
                    "destination topic '{}' matches source filter '{}' on the same broker",
                    self.destination.topic, self.source.topic
                )));
            }
        }

        Ok(())
    }
}
