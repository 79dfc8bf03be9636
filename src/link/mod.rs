//! Broker Links
//!
//! A link owns one client connection to a broker. The forwarder uses two of
//! them: a source link that subscribes and a destination link that publishes.
//! Both are driven through the [`BrokerLink`] trait so the bridge can be run
//! against real brokers ([`MqttLink`]) or test doubles.
//!
//! Connection acknowledgments, subscription results, inbound messages and
//! connection loss are reported asynchronously as [`LinkEvent`]s on the
//! channel handed to [`BrokerLink::connect`].

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::ReasonCode;

mod mqtt;

pub use mqtt::MqttLink;

/// Which side of the forwarder a link serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Subscribes to the source topic
    Source,
    /// Publishes to the destination topic
    Destination,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Source => write!(f, "source"),
            LinkRole::Destination => write!(f, "destination"),
        }
    }
}

/// Connection state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected and not trying to connect
    Disconnected,
    /// Connection attempt (or reconnection) in progress
    Connecting,
    /// CONNACK accepted, publish and subscribe are allowed
    Connected,
    /// Connection refused or lost without retry; terminal
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Failed => write!(f, "failed"),
        }
    }
}

/// A message received on the source link
///
/// The payload is opaque and is forwarded exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Events a link reports to its owner
#[derive(Debug)]
pub enum LinkEvent {
    /// Outcome of a connection attempt
    ConnectAck {
        role: LinkRole,
        result: Result<(), ConnectError>,
    },
    /// Outcome of a subscription request
    SubscribeAck {
        role: LinkRole,
        topic: String,
        result: Result<(), SubscribeError>,
    },
    /// Message received on a subscribed topic
    Message(Message),
    /// An established connection was lost
    ConnectionLost {
        role: LinkRole,
        error: String,
        /// Whether the link is retrying in the background
        reconnecting: bool,
    },
}

/// Sender half of the event channel handed to [`BrokerLink::connect`]
pub type EventSender = mpsc::Sender<LinkEvent>;

/// Error establishing a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// `connect` was called on a link that is already running
    AlreadyStarted,
    /// TCP connection failed
    Unreachable(String),
    /// No CONNACK within the connect timeout
    Timeout,
    /// Broker answered CONNACK with a failure code
    Refused(ReasonCode),
    /// Broker violated the protocol during the handshake
    Protocol(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::AlreadyStarted => write!(f, "Link already started"),
            ConnectError::Unreachable(msg) => write!(f, "Broker unreachable: {}", msg),
            ConnectError::Timeout => write!(f, "Connection timed out"),
            ConnectError::Refused(code) => write!(f, "Connection refused: {}", code),
            ConnectError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Error subscribing to a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// Link is not connected
    NotConnected,
    /// Topic filter is malformed
    InvalidTopic(String),
    /// Broker answered SUBACK with a failure code
    Rejected(ReasonCode),
    /// Connection task is gone
    Closed,
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeError::NotConnected => write!(f, "Not connected"),
            SubscribeError::InvalidTopic(msg) => write!(f, "Invalid topic filter: {}", msg),
            SubscribeError::Rejected(code) => write!(f, "Subscription rejected: {}", code),
            SubscribeError::Closed => write!(f, "Link closed"),
        }
    }
}

impl std::error::Error for SubscribeError {}

/// Error publishing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Link is not connected
    NotConnected,
    /// Topic name is malformed
    InvalidTopic(String),
    /// Message does not fit in a single MQTT packet
    PayloadTooLarge(usize),
    /// Outgoing queue is full; the broker is not keeping up
    QueueFull,
    /// Connection task is gone
    Closed,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotConnected => write!(f, "Not connected"),
            PublishError::InvalidTopic(msg) => write!(f, "Invalid topic name: {}", msg),
            PublishError::PayloadTooLarge(size) => write!(f, "Payload too large: {} bytes", size),
            PublishError::QueueFull => write!(f, "Outgoing queue full"),
            PublishError::Closed => write!(f, "Link closed"),
        }
    }
}

impl std::error::Error for PublishError {}

/// Capability interface for one broker connection
///
/// Implemented by:
/// - `MqttLink`: MQTT client over TCP
/// - recording mocks in the bridge tests
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Which side of the forwarder this link serves
    fn role(&self) -> LinkRole;

    /// Broker hostname or address
    fn broker(&self) -> &str;

    /// Broker TCP port
    fn port(&self) -> u16;

    /// Client ID presented to the broker
    fn client_id(&self) -> &str;

    /// Current connection state
    fn state(&self) -> LinkState;

    /// Topic filter acknowledged by the broker, if any
    ///
    /// Only meaningful while the link is `Connected`.
    fn subscribed_topic(&self) -> Option<String>;

    /// Start connecting
    ///
    /// Returns once the attempt is underway. The outcome arrives as a
    /// `LinkEvent::ConnectAck` on `events`, which also receives every later
    /// event of this link.
    async fn connect(&self, events: EventSender) -> Result<(), ConnectError>;

    /// Request a subscription; valid only while `Connected`
    ///
    /// The broker's answer arrives as `LinkEvent::SubscribeAck`.
    async fn subscribe(&self, topic: &str) -> Result<(), SubscribeError>;

    /// Publish a message; valid only while `Connected`
    ///
    /// Never waits on the broker: no acknowledgment is awaited, and a
    /// message that cannot be queued immediately is refused.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError>;

    /// Close the connection and stop the link's task
    ///
    /// Idempotent: disconnecting a link that never connected is a no-op.
    async fn disconnect(&self);
}
