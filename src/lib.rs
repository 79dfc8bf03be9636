//! mqtt-forwarder - relay one MQTT topic from a source broker to another broker
//!
//! Subscribes to a topic on the source broker and republishes every message,
//! payload byte-for-byte, to a fixed topic on the destination broker.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod link;
pub mod protocol;
pub mod topic;

pub use bridge::{Bridge, BridgeError, ForwardStats};
pub use config::{BridgeConfig, ConfigError, EndpointConfig};
pub use link::{BrokerLink, LinkEvent, LinkRole, LinkState, Message, MqttLink};
pub use protocol::{ProtocolVersion, QoS};
