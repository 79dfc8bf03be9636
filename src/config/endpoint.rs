//! Endpoint Configuration
//!
//! Connection settings for one side of the forwarder (source or destination).

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::protocol::{ProtocolVersion, QoS};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Configuration for one broker connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    /// Broker hostname or address
    pub broker: String,

    /// Broker TCP port
    pub port: u16,

    /// Client ID presented to the broker (unique per broker)
    pub client_id: String,

    /// Topic subscribed to (source) or published to (destination)
    pub topic: String,

    /// MQTT protocol version ("3.1.1" or "5")
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// QoS used for the subscription (source) or publishes (destination)
    #[serde(default)]
    pub qos: u8,

    /// Retain flag set on forwarded publishes (destination only)
    #[serde(default)]
    pub retain: bool,

    /// Keep-alive interval in seconds (0 disables keep-alive)
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Use clean start (no session persistence)
    #[serde(default = "default_true")]
    pub clean_start: bool,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Reconnect after losing an established connection
    #[serde(default = "default_true")]
    pub reconnect: bool,

    /// Reconnect interval in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    /// Maximum reconnect interval in seconds (for exponential backoff)
    #[serde(default = "default_max_reconnect_interval")]
    pub max_reconnect_interval: u64,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,
}

fn default_keepalive() -> u16 {
    60
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_max_reconnect_interval() -> u64 {
    60
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: String::new(),
            topic: String::new(),
            protocol_version: ProtocolVersion::default(),
            qos: 0,
            retain: false,
            keepalive: default_keepalive(),
            clean_start: true,
            connect_timeout: default_connect_timeout(),
            reconnect: true,
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            username: None,
            password: None,
        }
    }
}

/// Whether the endpoint's topic is subscribed to or published to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TopicUse {
    Filter,
    Name,
}

impl EndpointConfig {
    /// Get the QoS level (validated to be 0 or 1)
    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or_default()
    }

    /// Get the keep-alive interval, `None` when disabled
    pub fn keepalive_duration(&self) -> Option<Duration> {
        match self.keepalive {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Get the reconnect interval as Duration
    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Get the max reconnect interval as Duration
    pub fn max_reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval)
    }

    /// `host:port` form used for connecting and logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }

    /// Check whether two endpoints point at the same broker
    pub fn same_broker(&self, other: &EndpointConfig) -> bool {
        self.port == other.port && self.broker.eq_ignore_ascii_case(&other.broker)
    }

    pub(crate) fn validate(&self, section: &str, topic_use: TopicUse) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(format!("[{}] {}", section, msg)));

        if self.broker.trim().is_empty() {
            return invalid("broker must not be empty".to_string());
        }
        if self.port == 0 {
            return invalid("port must be between 1 and 65535".to_string());
        }
        if self.client_id.is_empty() {
            return invalid("client_id must not be empty".to_string());
        }

        let topic_check = match topic_use {
            TopicUse::Filter => validate_topic_filter(&self.topic),
            TopicUse::Name => validate_topic_name(&self.topic),
        };
        if let Err(msg) = topic_check {
            return invalid(format!("topic '{}': {}", self.topic, msg));
        }

        // QoS 2 would need the PUBREC/PUBREL/PUBCOMP exchange
        if self.qos > 1 {
            return invalid(format!("qos must be 0 or 1, got {}", self.qos));
        }
        if self.connect_timeout == 0 {
            return invalid("connect_timeout must be at least 1 second".to_string());
        }
        if self.reconnect_interval == 0 {
            return invalid("reconnect_interval must be at least 1 second".to_string());
        }
        if self.max_reconnect_interval < self.reconnect_interval {
            return invalid(format!(
                "max_reconnect_interval ({}) must not be less than reconnect_interval ({})",
                self.max_reconnect_interval, self.reconnect_interval
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return invalid("password requires a username".to_string());
        }

        Ok(())
    }
}

/// Loggable summary; never includes the password
impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Broker: `{}` | Port: `{}` | Client ID: `{}` | Topic: `{}` | MQTT {} | QoS {}",
            self.broker, self.port, self.client_id, self.topic, self.protocol_version, self.qos
        )?;
        if let Some(ref username) = self.username {
            write!(f, " | User: `{}`", username)?;
        }
        Ok(())
    }
}
