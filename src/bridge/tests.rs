//! Bridge Module Tests
//!
//! The bridge is driven with recording mock links; link events are injected
//! through the event sender each mock receives from `connect`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::*;
use crate::config::EndpointConfig;
use crate::link::{LinkState, PublishError};
use crate::protocol::ReasonCode;

// =============================================================================
// Mock link
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Connect,
    Subscribe(String),
    Publish(String, Bytes),
    Disconnect,
}

struct MockLink {
    role: LinkRole,
    port: u16,
    state: Mutex<LinkState>,
    events: Mutex<Option<EventSender>>,
    connect_error: Option<ConnectError>,
    /// Every n-th publish fails
    fail_every: Option<usize>,
    publish_count: Mutex<usize>,
    calls: Mutex<Vec<Call>>,
}

impl MockLink {
    fn new(role: LinkRole) -> Self {
        Self {
            role,
            port: match role {
                LinkRole::Source => 1883,
                LinkRole::Destination => 1884,
            },
            state: Mutex::new(LinkState::Disconnected),
            events: Mutex::new(None),
            connect_error: None,
            fail_every: None,
            publish_count: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n);
        self
    }

    fn refusing_connect(mut self, error: ConnectError) -> Self {
        self.connect_error = Some(error);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn subscriptions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    fn publishes(&self) -> Vec<(String, Bytes)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish(topic, payload) => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, expected: &Call) -> usize {
        self.calls().iter().filter(|call| *call == expected).count()
    }

    /// Deliver an event as this link's connection task would
    async fn emit(&self, event: LinkEvent) {
        let events = self.events.lock().clone();
        if let Some(events) = events {
            let _ = events.send(event).await;
        }
    }

    async fn ack(&self, result: Result<(), ConnectError>) {
        *self.state.lock() = match result {
            Ok(()) => LinkState::Connected,
            Err(_) => LinkState::Failed,
        };
        self.emit(LinkEvent::ConnectAck {
            role: self.role,
            result,
        })
        .await;
    }

    async fn deliver(&self, topic: &str, payload: impl Into<Bytes>) {
        self.emit(LinkEvent::Message(Message::new(topic, payload)))
            .await;
    }
}

#[async_trait]
impl BrokerLink for MockLink {
    fn role(&self) -> LinkRole {
        self.role
    }

    fn broker(&self) -> &str {
        "mock"
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn client_id(&self) -> &str {
        "mock-client"
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    fn subscribed_topic(&self) -> Option<String> {
        self.subscriptions().pop()
    }

    async fn connect(&self, events: EventSender) -> Result<(), ConnectError> {
        self.calls.lock().push(Call::Connect);
        if let Some(ref error) = self.connect_error {
            return Err(error.clone());
        }
        *self.state.lock() = LinkState::Connecting;
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SubscribeError> {
        self.calls.lock().push(Call::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        self.calls
            .lock()
            .push(Call::Publish(topic.to_string(), payload));

        let mut count = self.publish_count.lock();
        *count += 1;
        match self.fail_every {
            Some(n) if *count % n == 0 => Err(PublishError::QueueFull),
            _ => Ok(()),
        }
    }

    async fn disconnect(&self) {
        self.calls.lock().push(Call::Disconnect);
        *self.state.lock() = LinkState::Disconnected;
    }
}

// =============================================================================
// Harness
// =============================================================================

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("condition not reached in time");
}

/// A started bridge running on a background task
struct Harness {
    source: Arc<MockLink>,
    destination: Arc<MockLink>,
    stats: Arc<ForwardStats>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), BridgeError>>,
}

impl Harness {
    async fn start(source: MockLink, destination: MockLink, source_topic: &str) -> Self {
        let source = Arc::new(source);
        let destination = Arc::new(destination);

        let mut bridge = Bridge::new(
            source.clone(),
            destination.clone(),
            source_topic,
            "relay/temp",
        );
        bridge.start().await.unwrap();
        let stats = bridge.stats();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            bridge
                .run(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Self {
            source,
            destination,
            stats,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Acknowledge both connections and the resulting subscription
    async fn connect_both(&self) {
        self.source.ack(Ok(())).await;
        self.destination.ack(Ok(())).await;
        wait_until(|| self.source.subscriptions().len() == 1).await;

        let topic = self.source.subscriptions()[0].clone();
        self.source
            .emit(LinkEvent::SubscribeAck {
                role: LinkRole::Source,
                topic,
                result: Ok(()),
            })
            .await;
    }

    /// Request shutdown and wait for `run` to return
    async fn finish(mut self) -> Result<(), BridgeError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await.unwrap()
    }

    /// Wait for `run` to end on its own
    async fn outcome(self) -> Result<(), BridgeError> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("bridge did not stop")
            .unwrap()
    }
}

// =============================================================================
// Forwarding
// =============================================================================

#[tokio::test]
async fn test_forwards_to_destination_topic() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;
    harness.connect_both().await;
    assert_eq!(harness.source.subscriptions(), vec!["sensors/temp"]);

    harness.source.deliver("sensors/temp", "21.5").await;
    wait_until(|| harness.destination.publishes().len() == 1).await;

    assert_eq!(
        harness.destination.publishes(),
        vec![("relay/temp".to_string(), Bytes::from_static(b"21.5"))]
    );
    assert_eq!(harness.stats.forwarded(), 1);
    assert_eq!(harness.stats.failed(), 0);

    let source = harness.source.clone();
    let destination = harness.destination.clone();
    assert_eq!(harness.finish().await, Ok(()));
    assert_eq!(source.count(&Call::Disconnect), 1);
    assert_eq!(destination.count(&Call::Disconnect), 1);
    assert!(destination.subscriptions().is_empty());
}

#[tokio::test]
async fn test_payload_and_topic_are_not_rewritten() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/#",
    )
    .await;
    harness.connect_both().await;

    // Not valid UTF-8; the destination topic stays fixed whatever the source topic
    let payload = Bytes::from_static(&[0x00, 0xFF, 0xFE, b'\n', 0x80]);
    harness.source.deliver("sensors/a/b", payload.clone()).await;
    harness.source.deliver("sensors/c", Bytes::new()).await;
    wait_until(|| harness.destination.publishes().len() == 2).await;

    assert_eq!(
        harness.destination.publishes(),
        vec![
            ("relay/temp".to_string(), payload),
            ("relay/temp".to_string(), Bytes::new()),
        ]
    );
    assert_eq!(harness.finish().await, Ok(()));
}

#[tokio::test]
async fn test_publish_failures_do_not_stop_forwarding() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination).failing_every(10),
        "sensors/temp",
    )
    .await;
    harness.connect_both().await;

    for i in 0..100 {
        harness
            .source
            .deliver("sensors/temp", format!("m{}", i))
            .await;
    }
    wait_until(|| harness.destination.publishes().len() == 100).await;

    // Order preserved, failed publishes included
    let payloads: Vec<Bytes> = harness
        .destination
        .publishes()
        .into_iter()
        .map(|(_, payload)| payload)
        .collect();
    let expected: Vec<Bytes> = (0..100).map(|i| Bytes::from(format!("m{}", i))).collect();
    assert_eq!(payloads, expected);

    assert_eq!(harness.stats.forwarded(), 90);
    assert_eq!(harness.stats.failed(), 10);
    assert_eq!(harness.finish().await, Ok(()));
}

#[tokio::test]
async fn test_forward_counts_failure() {
    let source = Arc::new(MockLink::new(LinkRole::Source));
    let destination = Arc::new(MockLink::new(LinkRole::Destination).failing_every(1));
    let bridge = Bridge::new(source, destination.clone(), "a", "b");

    bridge.forward(Message::new("a", "x")).await;
    bridge.forward(Message::new("a", "y")).await;

    assert_eq!(destination.publishes().len(), 2);
    assert_eq!(bridge.stats().forwarded(), 0);
    assert_eq!(bridge.stats().failed(), 2);
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_connects_both_links() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;

    assert_eq!(harness.source.count(&Call::Connect), 1);
    assert_eq!(harness.destination.count(&Call::Connect), 1);
    assert_eq!(harness.finish().await, Ok(()));
}

#[tokio::test]
async fn test_subscribe_waits_for_destination() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;

    harness.source.ack(Ok(())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.source.subscriptions().is_empty());

    harness.destination.ack(Ok(())).await;
    wait_until(|| harness.source.subscriptions() == vec!["sensors/temp"]).await;
    assert_eq!(harness.finish().await, Ok(()));
}

#[tokio::test]
async fn test_destination_refused_is_fatal() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;
    let source = harness.source.clone();
    let destination = harness.destination.clone();

    source.ack(Ok(())).await;
    destination
        .ack(Err(ConnectError::Refused(ReasonCode::NotAuthorized)))
        .await;

    assert_eq!(
        harness.outcome().await,
        Err(BridgeError::Connect {
            role: LinkRole::Destination,
            error: ConnectError::Refused(ReasonCode::NotAuthorized),
        })
    );

    // Never subscribed, nothing forwarded, both links released
    assert!(source.subscriptions().is_empty());
    assert!(destination.publishes().is_empty());
    assert_eq!(source.count(&Call::Disconnect), 1);
    assert_eq!(destination.count(&Call::Disconnect), 1);
}

#[tokio::test]
async fn test_source_unreachable_is_fatal() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;
    let destination = harness.destination.clone();

    destination.ack(Ok(())).await;
    harness
        .source
        .ack(Err(ConnectError::Unreachable("connection refused".to_string())))
        .await;

    match harness.outcome().await {
        Err(BridgeError::Connect { role, .. }) => assert_eq!(role, LinkRole::Source),
        other => panic!("Expected connect error, got {:?}", other),
    }
    assert_eq!(destination.count(&Call::Disconnect), 1);
}

#[tokio::test]
async fn test_start_error_stops_both_links() {
    let source = Arc::new(MockLink::new(LinkRole::Source));
    let destination = Arc::new(
        MockLink::new(LinkRole::Destination)
            .refusing_connect(ConnectError::Unreachable("no route".to_string())),
    );
    let mut bridge = Bridge::new(source.clone(), destination.clone(), "a", "b");

    assert_eq!(
        bridge.start().await,
        Err(BridgeError::Connect {
            role: LinkRole::Destination,
            error: ConnectError::Unreachable("no route".to_string()),
        })
    );
    assert_eq!(source.count(&Call::Disconnect), 1);
    assert_eq!(destination.count(&Call::Disconnect), 1);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let source = Arc::new(MockLink::new(LinkRole::Source));
    let destination = Arc::new(MockLink::new(LinkRole::Destination));
    let mut bridge = Bridge::new(source.clone(), destination, "a", "b");

    bridge.start().await.unwrap();
    assert!(matches!(
        bridge.start().await,
        Err(BridgeError::Connect {
            error: ConnectError::AlreadyStarted,
            ..
        })
    ));
    assert_eq!(source.count(&Call::Connect), 1);
}

#[tokio::test]
async fn test_subscribe_rejected_is_fatal() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;

    harness.source.ack(Ok(())).await;
    harness.destination.ack(Ok(())).await;
    wait_until(|| harness.source.subscriptions().len() == 1).await;
    harness
        .source
        .emit(LinkEvent::SubscribeAck {
            role: LinkRole::Source,
            topic: "sensors/temp".to_string(),
            result: Err(SubscribeError::Rejected(ReasonCode::NotAuthorized)),
        })
        .await;

    assert_eq!(
        harness.outcome().await,
        Err(BridgeError::Subscribe {
            topic: "sensors/temp".to_string(),
            error: SubscribeError::Rejected(ReasonCode::NotAuthorized),
        })
    );
}

#[tokio::test]
async fn test_source_reconnect_resubscribes() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;
    harness.connect_both().await;

    harness
        .source
        .emit(LinkEvent::ConnectionLost {
            role: LinkRole::Source,
            error: "reset by peer".to_string(),
            reconnecting: true,
        })
        .await;
    harness.source.ack(Ok(())).await;

    wait_until(|| harness.source.subscriptions().len() == 2).await;
    assert_eq!(harness.finish().await, Ok(()));
}

#[tokio::test]
async fn test_destination_reconnect_keeps_subscription() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;
    harness.connect_both().await;

    harness
        .destination
        .emit(LinkEvent::ConnectionLost {
            role: LinkRole::Destination,
            error: "keep-alive timeout".to_string(),
            reconnecting: true,
        })
        .await;
    harness.destination.ack(Ok(())).await;
    harness.source.deliver("sensors/temp", "after").await;
    wait_until(|| harness.destination.publishes().len() == 1).await;

    assert_eq!(harness.source.subscriptions().len(), 1);
    assert_eq!(harness.finish().await, Ok(()));
}

#[tokio::test]
async fn test_connection_lost_without_reconnect_is_fatal() {
    let harness = Harness::start(
        MockLink::new(LinkRole::Source),
        MockLink::new(LinkRole::Destination),
        "sensors/temp",
    )
    .await;
    harness.connect_both().await;

    harness
        .destination
        .emit(LinkEvent::ConnectionLost {
            role: LinkRole::Destination,
            error: "closed".to_string(),
            reconnecting: false,
        })
        .await;

    assert_eq!(
        harness.outcome().await,
        Err(BridgeError::ConnectionLost {
            role: LinkRole::Destination,
            error: "closed".to_string(),
        })
    );
}

#[tokio::test]
async fn test_stop_is_idempotent_without_connect() {
    let source = Arc::new(MockLink::new(LinkRole::Source));
    let destination = Arc::new(MockLink::new(LinkRole::Destination));
    let bridge = Bridge::new(source.clone(), destination.clone(), "a", "b");

    bridge.stop().await;
    bridge.stop().await;

    assert_eq!(source.calls(), vec![Call::Disconnect]);
    assert_eq!(destination.calls(), vec![Call::Disconnect]);
}

#[tokio::test]
async fn test_from_config_uses_each_sections_endpoint() {
    let config = BridgeConfig {
        log: Default::default(),
        source: EndpointConfig {
            broker: "src.local".to_string(),
            port: 1883,
            client_id: "src".to_string(),
            topic: "sensors/temp".to_string(),
            ..Default::default()
        },
        destination: EndpointConfig {
            broker: "dst.local".to_string(),
            port: 2883,
            client_id: "dst".to_string(),
            topic: "relay/temp".to_string(),
            ..Default::default()
        },
    };

    let bridge = Bridge::from_config(&config);
    assert_eq!(bridge.source().role(), LinkRole::Source);
    assert_eq!(bridge.source().broker(), "src.local");
    assert_eq!(bridge.source().port(), 1883);
    assert_eq!(bridge.source().client_id(), "src");
    assert_eq!(bridge.destination().role(), LinkRole::Destination);
    assert_eq!(bridge.destination().broker(), "dst.local");
    assert_eq!(bridge.destination().port(), 2883);
    assert_eq!(bridge.destination().client_id(), "dst");
    assert_eq!(bridge.destination().state(), LinkState::Disconnected);
}

#[test]
fn test_payload_preview() {
    assert_eq!(payload_preview(b"21.5"), "21.5");
    assert_eq!(payload_preview(&[0xFF]), "\u{FFFD}");

    let long = "x".repeat(100);
    let preview = payload_preview(long.as_bytes());
    assert_eq!(preview, format!("{}...", "x".repeat(64)));
}
