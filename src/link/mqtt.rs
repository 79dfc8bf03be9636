//! MQTT Link
//!
//! A `BrokerLink` speaking MQTT over TCP. The connection is owned by a
//! spawned task; the link handle talks to it through a command channel, so
//! `publish` and `subscribe` may be called from any task.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{
    BrokerLink, ConnectError, EventSender, LinkEvent, LinkRole, LinkState, Message, PublishError,
    SubscribeError,
};
use crate::codec::{Decoder, Encoder, MAX_REMAINING_LENGTH};
use crate::config::EndpointConfig;
use crate::protocol::{
    Connect, DecodeError, Disconnect, EncodeError, Packet, PubAck, Publish, QoS, ReasonCode,
    Subscribe,
};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Capacity of the command channel feeding the connection task
const COMMAND_CHANNEL_CAPACITY: usize = 1000;

/// Bytes reserved for each socket read
const READ_BUFFER_SIZE: usize = 4096;

/// How long `disconnect` waits for the connection task before aborting it
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Message to send to the connection task
#[derive(Debug)]
enum LinkCommand {
    /// Publish a message with the endpoint's QoS and retain flag
    Publish { topic: String, payload: Bytes },
    /// Subscribe with the endpoint's QoS
    Subscribe { filter: String },
    /// Send DISCONNECT and stop the task
    Shutdown,
}

/// Why a connected session ended
#[derive(Debug)]
enum SessionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    /// Broker closed the TCP connection
    Closed,
    /// Nothing heard from the broker for 1.5x the keep-alive interval
    KeepAliveTimeout,
    /// Broker sent DISCONNECT
    ServerDisconnect(ReasonCode),
    Protocol(String),
    /// The link's owner dropped the event channel
    EventsClosed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "IO error: {}", e),
            SessionError::Decode(e) => write!(f, "Decode error: {}", e),
            SessionError::Encode(e) => write!(f, "Encode error: {}", e),
            SessionError::Closed => write!(f, "Connection closed by broker"),
            SessionError::KeepAliveTimeout => write!(f, "Keep-alive timeout"),
            SessionError::ServerDisconnect(code) => write!(f, "Broker sent DISCONNECT: {}", code),
            SessionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SessionError::EventsClosed => write!(f, "Event channel closed"),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        SessionError::Decode(e)
    }
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        SessionError::Encode(e)
    }
}

/// Packet identifier allocator; wraps around and never yields 0
#[derive(Debug)]
struct PacketIds {
    next: u16,
}

impl PacketIds {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }
}

/// State shared between the link handle and its connection task
struct Shared {
    role: LinkRole,
    state: RwLock<LinkState>,
    subscribed: RwLock<Option<String>>,
}

impl Shared {
    fn set_state(&self, state: LinkState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            info!("Link '{}': {} -> {}", self.role, previous, state);
        }
    }
}

/// Handle to a running connection task
struct LinkTask {
    command_tx: mpsc::Sender<LinkCommand>,
    handle: JoinHandle<()>,
}

/// MQTT client link to one broker
pub struct MqttLink {
    config: Arc<EndpointConfig>,
    shared: Arc<Shared>,
    task: Mutex<Option<LinkTask>>,
}

impl MqttLink {
    /// Create a link for `role`; nothing happens on the network until `connect`
    pub fn new(role: LinkRole, config: EndpointConfig) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::new(Shared {
                role,
                state: RwLock::new(LinkState::Disconnected),
                subscribed: RwLock::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    fn command_sender(&self) -> Option<mpsc::Sender<LinkCommand>> {
        self.task.lock().as_ref().map(|task| task.command_tx.clone())
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    fn role(&self) -> LinkRole {
        self.shared.role
    }

    fn broker(&self) -> &str {
        &self.config.broker
    }

    fn port(&self) -> u16 {
        self.config.port
    }

    fn client_id(&self) -> &str {
        &self.config.client_id
    }

    fn state(&self) -> LinkState {
        *self.shared.state.read()
    }

    fn subscribed_topic(&self) -> Option<String> {
        self.shared.subscribed.read().clone()
    }

    async fn connect(&self, events: EventSender) -> Result<(), ConnectError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(ConnectError::AlreadyStarted);
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        self.shared.set_state(LinkState::Connecting);

        let worker = Worker {
            config: self.config.clone(),
            shared: self.shared.clone(),
            events,
        };
        let handle = tokio::spawn(worker.run(command_rx));

        *task = Some(LinkTask { command_tx, handle });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SubscribeError> {
        if self.state() != LinkState::Connected {
            return Err(SubscribeError::NotConnected);
        }
        validate_topic_filter(topic).map_err(|e| SubscribeError::InvalidTopic(e.to_string()))?;

        let tx = self.command_sender().ok_or(SubscribeError::NotConnected)?;
        tx.send(LinkCommand::Subscribe {
            filter: topic.to_string(),
        })
        .await
        .map_err(|_| SubscribeError::Closed)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        if self.state() != LinkState::Connected {
            return Err(PublishError::NotConnected);
        }
        validate_topic_name(topic).map_err(|e| PublishError::InvalidTopic(e.to_string()))?;

        // Topic length prefix, packet id and v5 property length at most
        if 2 + topic.len() + 2 + 1 + payload.len() > MAX_REMAINING_LENGTH {
            return Err(PublishError::PayloadTooLarge(payload.len()));
        }

        let tx = self.command_sender().ok_or(PublishError::NotConnected)?;
        tx.try_send(LinkCommand::Publish {
            topic: topic.to_string(),
            payload,
        })
        .map_err(|e| match e {
            TrySendError::Full(_) => PublishError::QueueFull,
            TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    async fn disconnect(&self) {
        let task = self.task.lock().take();
        let Some(LinkTask {
            command_tx,
            mut handle,
        }) = task
        else {
            return;
        };

        // Dropping the last sender also stops the task if the queue is full
        let _ = command_tx.try_send(LinkCommand::Shutdown);
        drop(command_tx);

        if timeout(SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
            warn!(
                "Link '{}': Connection task did not stop in {:?}, aborting",
                self.shared.role, SHUTDOWN_TIMEOUT
            );
            handle.abort();
        }

        *self.shared.subscribed.write() = None;
        if self.state() != LinkState::Failed {
            self.shared.set_state(LinkState::Disconnected);
        }
        debug!("Link '{}': Disconnected", self.shared.role);
    }
}

/// Framed MQTT connection
struct Session {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    packet_ids: PacketIds,
}

impl Session {
    fn new(config: &EndpointConfig, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            encoder: Encoder::new(config.protocol_version),
            decoder: Decoder::new(config.protocol_version),
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            packet_ids: PacketIds::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Next complete packet from the broker
    ///
    /// Packets that arrived coalesced in one read are returned one at a time
    /// before the socket is read again. Cancel safe.
    async fn next_packet(&mut self) -> Result<Packet, SessionError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return Ok(packet);
            }

            self.read_buf.reserve(READ_BUFFER_SIZE);
            if self.reader.read_buf(&mut self.read_buf).await? == 0 {
                return Err(SessionError::Closed);
            }
        }
    }
}

/// Connection task state
struct Worker {
    config: Arc<EndpointConfig>,
    shared: Arc<Shared>,
    events: EventSender,
}

impl Worker {
    fn role(&self) -> LinkRole {
        self.shared.role
    }

    /// Report an event; false once the owner has gone away
    async fn emit(&self, event: LinkEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Run the connection loop
    ///
    /// The first connection attempt is final: failure is reported and the
    /// task ends. After a connection has been established, lost connections
    /// are retried with exponential backoff unless reconnect is disabled.
    /// A CONNACK refusal always ends the task.
    async fn run(self, mut commands: mpsc::Receiver<LinkCommand>) {
        let role = self.role();
        let mut retry_interval = self.config.reconnect_interval_duration();
        let max_retry = self.config.max_reconnect_interval_duration();
        let mut has_connected = false;

        loop {
            self.shared.set_state(LinkState::Connecting);
            debug!("Link '{}': Connecting to {}", role, self.config.address());

            let attempt = match unless_shutdown(role, &mut commands, self.establish()).await {
                Some(attempt) => attempt,
                None => break,
            };

            match attempt {
                Ok(mut session) => {
                    has_connected = true;
                    retry_interval = self.config.reconnect_interval_duration();
                    self.shared.set_state(LinkState::Connected);

                    if !self
                        .emit(LinkEvent::ConnectAck {
                            role,
                            result: Ok(()),
                        })
                        .await
                    {
                        break;
                    }

                    match self.serve(&mut session, &mut commands).await {
                        Ok(()) | Err(SessionError::EventsClosed) => {
                            info!("Link '{}': Disconnected gracefully", role);
                            break;
                        }
                        Err(e) => {
                            *self.shared.subscribed.write() = None;
                            let reconnecting = self.config.reconnect;

                            if reconnecting {
                                warn!("Link '{}': Connection lost: {}", role, e);
                                self.shared.set_state(LinkState::Connecting);
                            } else {
                                error!("Link '{}': Connection lost: {}", role, e);
                                self.shared.set_state(LinkState::Failed);
                            }

                            let delivered = self
                                .emit(LinkEvent::ConnectionLost {
                                    role,
                                    error: e.to_string(),
                                    reconnecting,
                                })
                                .await;

                            if !reconnecting {
                                return;
                            }
                            if !delivered {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    if !has_connected || matches!(e, ConnectError::Refused(_)) {
                        error!(
                            "Link '{}': Connection to {} failed: {}",
                            role,
                            self.config.address(),
                            e
                        );
                        self.shared.set_state(LinkState::Failed);
                        self.emit(LinkEvent::ConnectAck {
                            role,
                            result: Err(e),
                        })
                        .await;
                        return;
                    }
                    warn!("Link '{}': Reconnect failed: {}", role, e);
                }
            }

            debug!("Link '{}': Reconnecting in {:?}", role, retry_interval);
            let backoff = tokio::time::sleep(retry_interval);
            if unless_shutdown(role, &mut commands, backoff).await.is_none() {
                break;
            }
            retry_interval = next_backoff(retry_interval, max_retry);
        }

        self.shared.set_state(LinkState::Disconnected);
    }

    /// Open the TCP connection and complete the CONNECT/CONNACK handshake
    async fn establish(&self) -> Result<Session, ConnectError> {
        let connect_timeout = self.config.connect_timeout_duration();

        let stream = timeout(connect_timeout, TcpStream::connect(self.config.address()))
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        debug!("Link '{}': TCP connected", self.role());

        let mut session = Session::new(&self.config, stream);

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: self.config.protocol_version,
            client_id: self.config.client_id.clone(),
            clean_start: self.config.clean_start,
            keep_alive: self.config.keepalive,
            username: self.config.username.clone(),
            password: self
                .config
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
        }));

        session.send(&connect).await.map_err(|e| match e {
            SessionError::Encode(e) => ConnectError::Protocol(e.to_string()),
            other => ConnectError::Unreachable(other.to_string()),
        })?;

        let packet = timeout(connect_timeout, session.next_packet())
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(|e| match e {
                SessionError::Decode(e) => ConnectError::Protocol(e.to_string()),
                other => ConnectError::Unreachable(other.to_string()),
            })?;

        match packet {
            Packet::ConnAck(connack) if connack.reason_code.is_success() => {
                info!(
                    "Link '{}': Connected to {} (session_present={})",
                    self.role(),
                    self.config.address(),
                    connack.session_present
                );
                Ok(session)
            }
            Packet::ConnAck(connack) => Err(ConnectError::Refused(connack.reason_code)),
            other => Err(ConnectError::Protocol(format!(
                "expected CONNACK, got {}",
                other.name()
            ))),
        }
    }

    /// Message loop for an established session
    ///
    /// Returns `Ok(())` on shutdown and an error when the connection is lost.
    async fn serve(
        &self,
        session: &mut Session,
        commands: &mut mpsc::Receiver<LinkCommand>,
    ) -> Result<(), SessionError> {
        let keepalive = self.config.keepalive_duration();
        let mut ping_timer = keepalive.map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut last_received = Instant::now();
        let mut pending_subscribes: HashMap<u16, String> = HashMap::new();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(LinkCommand::Publish { topic, payload }) => {
                        let qos = self.config.qos();
                        let packet_id = (qos != QoS::AtMostOnce).then(|| session.packet_ids.next_id());
                        let publish = Packet::Publish(Publish {
                            dup: false,
                            qos,
                            retain: self.config.retain,
                            topic,
                            packet_id,
                            payload,
                        });
                        session.send(&publish).await?;
                    }
                    Some(LinkCommand::Subscribe { filter }) => {
                        let packet_id = session.packet_ids.next_id();
                        let subscribe = Packet::Subscribe(Subscribe {
                            packet_id,
                            filter: filter.clone(),
                            qos: self.config.qos(),
                        });
                        session.send(&subscribe).await?;
                        debug!("Link '{}': SUBSCRIBE {} sent (id={})", self.role(), filter, packet_id);
                        pending_subscribes.insert(packet_id, filter);
                    }
                    Some(LinkCommand::Shutdown) | None => {
                        if let Err(e) = session.send(&Packet::Disconnect(Disconnect::default())).await {
                            debug!("Link '{}': DISCONNECT not sent: {}", self.role(), e);
                        }
                        let _ = session.writer.shutdown().await;
                        return Ok(());
                    }
                },

                packet = session.next_packet() => {
                    last_received = Instant::now();
                    self.handle_packet(session, packet?, &mut pending_subscribes).await?;
                }

                _ = tick(&mut ping_timer) => {
                    if let Some(period) = keepalive {
                        if last_received.elapsed() > period + period / 2 {
                            return Err(SessionError::KeepAliveTimeout);
                        }
                    }
                    session.send(&Packet::PingReq).await?;
                }
            }
        }
    }

    async fn handle_packet(
        &self,
        session: &mut Session,
        packet: Packet,
        pending_subscribes: &mut HashMap<u16, String>,
    ) -> Result<(), SessionError> {
        let role = self.role();

        match packet {
            Packet::Publish(publish) => {
                // Subscriptions are never made at QoS 2
                if publish.qos == QoS::ExactlyOnce {
                    return Err(SessionError::Protocol(
                        "QoS 2 delivery was not requested".to_string(),
                    ));
                }

                let ack = match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => Some(packet_id),
                    _ => None,
                };

                let message = Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if !self.emit(LinkEvent::Message(message)).await {
                    return Err(SessionError::EventsClosed);
                }

                // Acknowledge only once the message has been handed over
                if let Some(packet_id) = ack {
                    session.send(&Packet::PubAck(PubAck::new(packet_id))).await?;
                }
            }
            Packet::SubAck(suback) => {
                let Some(topic) = pending_subscribes.remove(&suback.packet_id) else {
                    warn!(
                        "Link '{}': SUBACK for unknown packet id {}",
                        role, suback.packet_id
                    );
                    return Ok(());
                };

                let result = match suback.reason_codes.first() {
                    Some(code) if code.is_success() => Ok(()),
                    Some(code) => Err(SubscribeError::Rejected(*code)),
                    None => Err(SubscribeError::Rejected(ReasonCode::UnspecifiedError)),
                };

                if result.is_ok() {
                    *self.shared.subscribed.write() = Some(topic.clone());
                }

                if !self
                    .emit(LinkEvent::SubscribeAck {
                        role,
                        topic,
                        result,
                    })
                    .await
                {
                    return Err(SessionError::EventsClosed);
                }
            }
            Packet::PubAck(puback) => {
                if puback.reason_code.is_success() {
                    debug!("Link '{}': PUBACK {} received", role, puback.packet_id);
                } else {
                    warn!(
                        "Link '{}': Publish {} not accepted: {}",
                        role, puback.packet_id, puback.reason_code
                    );
                }
            }
            Packet::PingResp => {
                debug!("Link '{}': PINGRESP received", role);
            }
            Packet::Disconnect(disconnect) => {
                return Err(SessionError::ServerDisconnect(disconnect.reason_code));
            }
            other => {
                return Err(SessionError::Protocol(format!(
                    "unexpected {} from broker",
                    other.name()
                )));
            }
        }

        Ok(())
    }
}

/// Drive `fut` to completion unless a shutdown is requested first
///
/// Commands other than shutdown cannot be served without a connection and
/// are dropped.
async fn unless_shutdown<F: Future>(
    role: LinkRole,
    commands: &mut mpsc::Receiver<LinkCommand>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Some(output),
            command = commands.recv() => match command {
                Some(LinkCommand::Shutdown) | None => return None,
                Some(LinkCommand::Publish { topic, .. }) => {
                    warn!("Link '{}': Dropping publish to {} while not connected", role, topic);
                }
                Some(LinkCommand::Subscribe { filter }) => {
                    debug!("Link '{}': Dropping subscribe to {} while not connected", role, filter);
                }
            }
        }
    }
}

/// Double the reconnect delay, capped at `max`
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Wait for the next keep-alive tick; never resolves when keep-alive is off
async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
