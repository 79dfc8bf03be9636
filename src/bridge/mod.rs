//! Bridge Coordinator
//!
//! Owns the source and destination links and relays every message received
//! on the source topic to the destination topic, payload untouched.
//!
//! Links report through a single event channel that the bridge drains in
//! [`Bridge::run`], so messages are forwarded one at a time in the order the
//! source link delivered them.
//!
//! Failure policy:
//! - a refused or failed connection on either link is fatal
//! - a rejected subscription is fatal
//! - losing a connection is fatal only when the link will not reconnect
//! - a failed publish is logged and counted, and forwarding continues

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::link::{
    BrokerLink, ConnectError, EventSender, LinkEvent, LinkRole, Message, MqttLink, SubscribeError,
};

#[cfg(test)]
mod tests;

/// Capacity of the link event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Longest payload prefix written to the relay log line
const PAYLOAD_PREVIEW_CHARS: usize = 64;

/// Fatal bridge conditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A link could not connect or was refused
    Connect { role: LinkRole, error: ConnectError },
    /// The source subscription failed
    Subscribe {
        topic: String,
        error: SubscribeError,
    },
    /// A link lost its connection and will not reconnect
    ConnectionLost { role: LinkRole, error: String },
    /// Both links dropped their event senders
    EventsClosed,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Connect { role, error } => {
                write!(f, "Failed to connect to {} broker: {}", role, error)
            }
            BridgeError::Subscribe { topic, error } => {
                write!(f, "Failed to subscribe to `{}`: {}", topic, error)
            }
            BridgeError::ConnectionLost { role, error } => {
                write!(f, "Lost connection to {} broker: {}", role, error)
            }
            BridgeError::EventsClosed => write!(f, "Link event channel closed"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Forwarding counters
#[derive(Debug, Default)]
pub struct ForwardStats {
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl ForwardStats {
    /// Messages handed to the destination link
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Messages the destination link refused
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Connection progress seen through link events
#[derive(Debug, Default)]
struct Readiness {
    source: bool,
    destination: bool,
    /// Source (re)connected and still needs its subscription
    subscribe_pending: bool,
}

/// Message forwarder between a source and a destination broker
pub struct Bridge {
    source: Arc<dyn BrokerLink>,
    destination: Arc<dyn BrokerLink>,
    source_topic: String,
    destination_topic: String,
    /// Handed to the links by `start`
    events_tx: Option<EventSender>,
    events_rx: mpsc::Receiver<LinkEvent>,
    readiness: Readiness,
    stats: Arc<ForwardStats>,
    stopped: AtomicBool,
}

impl Bridge {
    /// Create a bridge over arbitrary links
    pub fn new(
        source: Arc<dyn BrokerLink>,
        destination: Arc<dyn BrokerLink>,
        source_topic: impl Into<String>,
        destination_topic: impl Into<String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            source,
            destination,
            source_topic: source_topic.into(),
            destination_topic: destination_topic.into(),
            events_tx: Some(events_tx),
            events_rx,
            readiness: Readiness::default(),
            stats: Arc::new(ForwardStats::default()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Create a bridge with MQTT links built from each config section
    pub fn from_config(config: &BridgeConfig) -> Self {
        let source = MqttLink::new(LinkRole::Source, config.source.clone());
        let destination = MqttLink::new(LinkRole::Destination, config.destination.clone());

        Self::new(
            Arc::new(source),
            Arc::new(destination),
            config.source.topic.clone(),
            config.destination.topic.clone(),
        )
    }

    pub fn source(&self) -> &Arc<dyn BrokerLink> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<dyn BrokerLink> {
        &self.destination
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        self.stats.clone()
    }

    /// Start connecting both links concurrently
    ///
    /// Connection results arrive later as events handled by `run`. An error
    /// here means a link could not even begin connecting; both links are
    /// stopped before it is returned.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        let Some(events) = self.events_tx.take() else {
            return Err(BridgeError::Connect {
                role: LinkRole::Source,
                error: ConnectError::AlreadyStarted,
            });
        };

        info!(
            "Bridge: Starting `{}` ({}:{}) -> `{}` ({}:{})",
            self.source_topic,
            self.source.broker(),
            self.source.port(),
            self.destination_topic,
            self.destination.broker(),
            self.destination.port()
        );

        let (source, destination) = tokio::join!(
            self.source.connect(events.clone()),
            self.destination.connect(events)
        );

        let result = match (source, destination) {
            (Err(error), _) => Err(BridgeError::Connect {
                role: LinkRole::Source,
                error,
            }),
            (_, Err(error)) => Err(BridgeError::Connect {
                role: LinkRole::Destination,
                error,
            }),
            (Ok(()), Ok(())) => Ok(()),
        };

        if let Err(ref e) = result {
            error!("Bridge: {}", e);
            self.stop().await;
        }
        result
    }

    /// Process link events until `shutdown` resolves or a fatal error occurs
    ///
    /// Both links are stopped before returning. `Ok(())` means an orderly
    /// shutdown was requested.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Bridge: Shutdown requested");
                    break Ok(());
                }

                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("Bridge: {}", e);
                            break Err(e);
                        }
                    }
                    None => break Err(BridgeError::EventsClosed),
                }
            }
        };

        // Unblocks link tasks waiting to deliver events
        self.events_rx.close();
        self.stop().await;
        result
    }

    async fn handle_event(&mut self, event: LinkEvent) -> Result<(), BridgeError> {
        match event {
            LinkEvent::ConnectAck {
                role,
                result: Ok(()),
            } => {
                info!(
                    "Bridge: Connected to {} broker {}:{}",
                    role,
                    self.link(role).broker(),
                    self.link(role).port()
                );
                match role {
                    LinkRole::Source => {
                        self.readiness.source = true;
                        self.readiness.subscribe_pending = true;
                    }
                    LinkRole::Destination => self.readiness.destination = true,
                }
                self.subscribe_when_ready().await
            }
            LinkEvent::ConnectAck {
                role,
                result: Err(error),
            } => Err(BridgeError::Connect { role, error }),
            LinkEvent::SubscribeAck {
                topic,
                result: Ok(()),
                ..
            } => {
                info!("Bridge: Subscribed to `{}`", topic);
                Ok(())
            }
            LinkEvent::SubscribeAck {
                topic,
                result: Err(error),
                ..
            } => Err(BridgeError::Subscribe { topic, error }),
            LinkEvent::Message(message) => {
                self.forward(message).await;
                Ok(())
            }
            LinkEvent::ConnectionLost {
                role,
                error,
                reconnecting: true,
            } => {
                warn!(
                    "Bridge: Lost connection to {} broker ({}), reconnecting",
                    role, error
                );
                match role {
                    LinkRole::Source => {
                        self.readiness.source = false;
                        self.readiness.subscribe_pending = false;
                    }
                    LinkRole::Destination => self.readiness.destination = false,
                }
                Ok(())
            }
            LinkEvent::ConnectionLost {
                role,
                error,
                reconnecting: false,
            } => Err(BridgeError::ConnectionLost { role, error }),
        }
    }

    fn link(&self, role: LinkRole) -> &Arc<dyn BrokerLink> {
        match role {
            LinkRole::Source => &self.source,
            LinkRole::Destination => &self.destination,
        }
    }

    /// Subscribe once both links are connected
    ///
    /// Holding the subscription back until the destination is up means no
    /// message is received that could not be forwarded, and a destination
    /// that fails to connect leaves the source unsubscribed.
    async fn subscribe_when_ready(&mut self) -> Result<(), BridgeError> {
        let ready = &mut self.readiness;
        if !(ready.subscribe_pending && ready.source && ready.destination) {
            return Ok(());
        }
        ready.subscribe_pending = false;

        debug!("Bridge: Subscribing to `{}`", self.source_topic);
        match self.source.subscribe(&self.source_topic).await {
            Ok(()) => Ok(()),
            // Lost again before the request went out; the next ConnectAck retries
            Err(SubscribeError::NotConnected) => {
                warn!(
                    "Bridge: Source disconnected before subscribing to `{}`",
                    self.source_topic
                );
                Ok(())
            }
            Err(error) => Err(BridgeError::Subscribe {
                topic: self.source_topic.clone(),
                error,
            }),
        }
    }

    /// Relay one message to the destination topic
    ///
    /// A failed publish is logged and counted; it never stops the bridge.
    pub async fn forward(&self, message: Message) {
        info!(
            "Forwarding message from `{}` to `{}`: {} ({} bytes)",
            message.topic,
            self.destination_topic,
            payload_preview(&message.payload),
            message.payload.len()
        );

        match self
            .destination
            .publish(&self.destination_topic, message.payload)
            .await
        {
            Ok(()) => self.stats.record_forwarded(),
            Err(e) => {
                self.stats.record_failed();
                warn!(
                    "Failed to forward message from `{}` to `{}`: {}",
                    message.topic, self.destination_topic, e
                );
            }
        }
    }

    /// Disconnect both links
    ///
    /// Safe to call repeatedly and whether or not the links ever connected.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Bridge: Already stopped");
            return;
        }

        info!("Bridge: Stopping");
        tokio::join!(self.source.disconnect(), self.destination.disconnect());
        info!(
            "Bridge: Stopped ({} forwarded, {} failed)",
            self.stats.forwarded(),
            self.stats.failed()
        );
    }
}

/// Printable form of a payload for log lines
fn payload_preview(payload: &[u8]) -> Cow<'_, str> {
    let text = String::from_utf8_lossy(payload);
    match text.char_indices().nth(PAYLOAD_PREVIEW_CHARS) {
        Some((cut, _)) => Cow::Owned(format!("{}...", &text[..cut])),
        None => text,
    }
}
