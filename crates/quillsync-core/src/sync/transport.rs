//! Relay transport client
//!
//! Owns the single multiplexed connection to the relay:
//!
//! - dials through a [`Connector`] (real TCP in production, an in-memory
//!   stream in tests)
//! - performs the `Hello`/`HelloAck` handshake
//! - keeps the link alive with ping/pong and detects silent drops
//! - reconnects with jittered exponential backoff while the shell wants
//!   to be online, and re-subscribes every document after reconnecting
//! - reassembles fragmented envelopes and broadcasts them as events
//!
//! The client never interprets envelope contents; it moves opaque bytes
//! and control frames. The engine layers the sync protocol on top.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::sync::session::Backoff;
use crate::sync::wire::{fragment, Control, Frame, FrameCodec, Reassembler, PROTOCOL_VERSION};
use crate::types::{DocumentId, ReplicaId};

/// Byte stream a relay connection runs over
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

/// Dials the relay. Abstracted so tests can hand the client an in-memory
/// duplex stream instead of a socket.
pub trait Connector: Send + Sync + 'static {
    /// Open a fresh byte stream to the relay
    fn connect(&self) -> BoxFuture<'static, std::io::Result<Box<dyn RelayStream>>>;
}

/// Dials the relay over TCP
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Create a connector for `host:port`
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'static, std::io::Result<Box<dyn RelayStream>>> {
        let addr = self.addr.clone();
        Box::pin(async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as Box<dyn RelayStream>)
        })
    }
}

/// Transport timing knobs
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between keepalive pings
    pub ping_interval: Duration,
    /// How long to wait for a pong before declaring the link dead
    pub pong_timeout: Duration,
    /// How long the dial + handshake may take
    pub handshake_timeout: Duration,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Reconnect delay cap
    pub backoff_max: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Events the transport broadcasts to the engine
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Handshake completed; subscriptions restored
    Connected,
    /// A live link was lost
    Disconnected,
    /// A connection attempt failed
    ConnectFailed,
    /// The relay rejected our handshake; the client stops retrying
    AuthRejected(String),
    /// A complete (reassembled) envelope arrived
    EnvelopeReceived {
        /// Document the envelope belongs to
        document_id: DocumentId,
        /// Opaque envelope bytes
        bytes: Vec<u8>,
    },
    /// A presence frame arrived
    PresenceReceived {
        /// Document the hint belongs to
        document_id: DocumentId,
        /// Opaque presence bytes
        bytes: Vec<u8>,
    },
}

enum Closed {
    Shutdown,
    Graceful,
    Link,
    AuthRejected(String),
}

enum EstablishError {
    AuthRejected(String),
    Failed,
}

type Link = Framed<Box<dyn RelayStream>, FrameCodec>;

/// Client side of the relay connection
pub struct TransportClient {
    replica: ReplicaId,
    desired: watch::Sender<bool>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
    subscriptions: Arc<RwLock<HashSet<DocumentId>>>,
    events: broadcast::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl TransportClient {
    /// Create a client and spawn its connection loop. The client stays
    /// offline until [`connect`](Self::connect) is called.
    pub fn new(replica: ReplicaId, connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (desired, desired_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        let outbound = Arc::new(Mutex::new(None));
        let subscriptions = Arc::new(RwLock::new(HashSet::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(Self::run(
            replica,
            connector,
            config,
            desired.clone(),
            desired_rx,
            outbound.clone(),
            subscriptions.clone(),
            events.clone(),
            cancel.clone(),
        ));

        Self {
            replica,
            desired,
            outbound,
            subscriptions,
            events,
            cancel,
        }
    }

    /// Ask the client to be online; it will connect and keep reconnecting
    pub fn connect(&self) {
        let _ = self.desired.send(true);
    }

    /// Ask the client to go offline; cancels any pending reconnect
    pub fn disconnect(&self) {
        let _ = self.desired.send(false);
    }

    /// Stop the connection loop for good
    pub fn shutdown(&self) {
        let _ = self.desired.send(false);
        self.cancel.cancel();
    }

    /// Subscribe to a document's frames. Remembered across reconnects.
    pub fn subscribe(&self, document: &DocumentId) {
        self.subscriptions.write().insert(document.clone());
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(Frame::Control(Control::Subscribe {
                document_id: document.clone(),
            }));
        }
    }

    /// Unsubscribe from a document's frames
    pub fn unsubscribe(&self, document: &DocumentId) {
        self.subscriptions.write().remove(document);
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(Frame::Control(Control::Unsubscribe {
                document_id: document.clone(),
            }));
        }
    }

    /// Documents currently subscribed
    pub fn subscriptions(&self) -> Vec<DocumentId> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// Send an envelope for a document, fragmenting as needed.
    ///
    /// # Errors
    ///
    /// [`SyncError::TransportDisconnected`] when no link is up; the sync
    /// protocol recovers by re-announcing after reconnect.
    pub fn send_envelope(&self, document: &DocumentId, envelope_bytes: &[u8]) -> SyncResult<()> {
        let guard = self.outbound.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| SyncError::TransportDisconnected("no relay link".to_string()))?;
        for frame in fragment(document, self.replica, envelope_bytes)? {
            tx.send(frame)
                .map_err(|_| SyncError::TransportDisconnected("link closing".to_string()))?;
        }
        Ok(())
    }

    /// Send a presence frame, best-effort. Dropped silently when offline.
    pub fn send_presence(&self, document: &DocumentId, presence_bytes: Vec<u8>) {
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(Frame::Presence {
                document_id: document.clone(),
                payload: presence_bytes,
            });
        }
    }

    /// Subscribe to transport events
    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        replica: ReplicaId,
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        desired: watch::Sender<bool>,
        mut desired_rx: watch::Receiver<bool>,
        outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
        subscriptions: Arc<RwLock<HashSet<DocumentId>>>,
        events: broadcast::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);

        loop {
            if cancel.is_cancelled() {
                return;
            }
            if !*desired_rx.borrow() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = desired_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }

            match Self::establish(&*connector, &config, replica).await {
                Ok(mut link) => {
                    backoff.reset();

                    // Restore subscriptions before anyone can send
                    let docs: Vec<DocumentId> = subscriptions.read().iter().cloned().collect();
                    let mut resubscribe_failed = false;
                    for document_id in docs {
                        if link
                            .send(Frame::Control(Control::Subscribe { document_id }))
                            .await
                            .is_err()
                        {
                            resubscribe_failed = true;
                            break;
                        }
                    }
                    if resubscribe_failed {
                        let _ = events.send(TransportEvent::ConnectFailed);
                    } else {
                        let (tx, rx) = mpsc::unbounded_channel();
                        *outbound.lock() = Some(tx);
                        info!("Relay link established");
                        let _ = events.send(TransportEvent::Connected);

                        let closed =
                            Self::drive(link, rx, &config, &events, &mut desired_rx, &cancel)
                                .await;
                        *outbound.lock() = None;

                        match closed {
                            Closed::Shutdown => return,
                            Closed::Graceful => {
                                let _ = events.send(TransportEvent::Disconnected);
                                continue;
                            }
                            Closed::Link => {
                                warn!("Relay link lost");
                                let _ = events.send(TransportEvent::Disconnected);
                            }
                            Closed::AuthRejected(reason) => {
                                warn!(%reason, "Relay revoked our session");
                                let _ = desired.send(false);
                                let _ = events.send(TransportEvent::AuthRejected(reason));
                                continue;
                            }
                        }
                    }
                }
                Err(EstablishError::AuthRejected(reason)) => {
                    warn!(%reason, "Relay rejected handshake");
                    let _ = desired.send(false);
                    let _ = events.send(TransportEvent::AuthRejected(reason));
                    continue;
                }
                Err(EstablishError::Failed) => {
                    let _ = events.send(TransportEvent::ConnectFailed);
                }
            }

            // Backoff before the next attempt, cancellable by a
            // disconnect request or shutdown.
            let delay = backoff.next_delay();
            debug!(?delay, "Waiting before reconnect attempt");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
                changed = desired_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn establish(
        connector: &dyn Connector,
        config: &TransportConfig,
        replica: ReplicaId,
    ) -> Result<Link, EstablishError> {
        let handshake = async {
            let stream = connector.connect().await.map_err(|e| {
                debug!(error = %e, "Dial failed");
                EstablishError::Failed
            })?;
            let mut link = Framed::new(stream, FrameCodec::new());
            link.send(Frame::Control(Control::Hello {
                replica,
                protocol_version: PROTOCOL_VERSION,
            }))
            .await
            .map_err(|_| EstablishError::Failed)?;

            match link.next().await {
                Some(Ok(Frame::Control(Control::HelloAck))) => Ok(link),
                Some(Ok(Frame::Control(Control::AuthReject(reason)))) => {
                    Err(EstablishError::AuthRejected(reason))
                }
                _ => Err(EstablishError::Failed),
            }
        };

        match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Handshake timed out");
                Err(EstablishError::Failed)
            }
        }
    }

    async fn drive(
        link: Link,
        mut rx: mpsc::UnboundedReceiver<Frame>,
        config: &TransportConfig,
        events: &broadcast::Sender<TransportEvent>,
        desired_rx: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> Closed {
        // Split so the inbound stream can be polled while handlers write
        // to the sink.
        let (mut sink, mut inbound_stream) = link.split();
        let mut reassembler = Reassembler::new();
        let mut ping_tick = tokio::time::interval(config.ping_interval);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_tick.reset(); // skip the immediate first tick
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            let pong_timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Closed::Shutdown,

                changed = desired_rx.changed() => {
                    if changed.is_err() {
                        return Closed::Shutdown;
                    }
                    if !*desired_rx.borrow() {
                        return Closed::Graceful;
                    }
                }

                queued = rx.recv() => {
                    match queued {
                        Some(frame) => {
                            if sink.send(frame).await.is_err() {
                                return Closed::Link;
                            }
                        }
                        None => return Closed::Link,
                    }
                }

                _ = ping_tick.tick() => {
                    if sink.send(Frame::Control(Control::Ping)).await.is_err() {
                        return Closed::Link;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + config.pong_timeout);
                    }
                }

                _ = pong_timer => {
                    warn!("Pong timeout; relay link considered dead");
                    return Closed::Link;
                }

                inbound = inbound_stream.next() => {
                    let frame = match inbound {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            warn!(error = %e, "Frame decode failed");
                            return Closed::Link;
                        }
                        None => return Closed::Link,
                    };
                    match frame {
                        Frame::Control(Control::Ping) => {
                            if sink.send(Frame::Control(Control::Pong)).await.is_err() {
                                return Closed::Link;
                            }
                        }
                        Frame::Control(Control::Pong) => {
                            pong_deadline = None;
                        }
                        Frame::Control(Control::AuthReject(reason)) => {
                            return Closed::AuthRejected(reason);
                        }
                        Frame::Control(_) => {
                            // Hello/HelloAck/Subscribe are not expected
                            // from the relay mid-session; ignore.
                        }
                        Frame::Document {
                            document_id,
                            sender,
                            fragment_index,
                            fragment_count,
                            payload,
                        } => {
                            if let Some((document_id, bytes)) = reassembler.push(
                                document_id,
                                sender,
                                fragment_index,
                                fragment_count,
                                payload,
                            ) {
                                let _ = events.send(TransportEvent::EnvelopeReceived {
                                    document_id,
                                    bytes,
                                });
                            }
                        }
                        Frame::Presence { document_id, payload } => {
                            let _ = events.send(TransportEvent::PresenceReceived {
                                document_id,
                                bytes: payload,
                            });
                        }
                    }
                }
            }
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn test_config() -> TransportConfig {
        TransportConfig {
            ping_interval: Duration::from_millis(200),
            pong_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_millis(500),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(200),
        }
    }

    /// Hands out queued duplex streams, one per connection attempt
    struct QueueConnector {
        streams: Mutex<Vec<DuplexStream>>,
    }

    impl QueueConnector {
        fn new(streams: Vec<DuplexStream>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams),
            })
        }
    }

    impl Connector for QueueConnector {
        fn connect(&self) -> BoxFuture<'static, std::io::Result<Box<dyn RelayStream>>> {
            let next = self.streams.lock().pop();
            Box::pin(async move {
                match next {
                    Some(stream) => Ok(Box::new(stream) as Box<dyn RelayStream>),
                    None => Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "no stream queued",
                    )),
                }
            })
        }
    }

    type RelaySide = Framed<DuplexStream, FrameCodec>;

    /// Accept the client handshake on the relay side of a duplex pair
    async fn accept(relay_side: DuplexStream) -> RelaySide {
        let mut framed = Framed::new(relay_side, FrameCodec::new());
        match framed.next().await {
            Some(Ok(Frame::Control(Control::Hello { .. }))) => {}
            other => panic!("expected Hello, got {:?}", other),
        }
        framed.send(Frame::Control(Control::HelloAck)).await.unwrap();
        framed
    }

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_handshake_and_send() {
        let (client_side, relay_side) = tokio::io::duplex(64 * 1024);
        let connector = QueueConnector::new(vec![client_side]);
        let client = TransportClient::new(ReplicaId::generate(), connector, test_config());
        let mut events = client.subscribe_events();

        client.connect();
        let mut relay = accept(relay_side).await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));

        let doc = DocumentId::new("chapters/one");
        client.send_envelope(&doc, b"sealed bytes").unwrap();
        loop {
            match relay.next().await.unwrap().unwrap() {
                Frame::Document { payload, .. } => {
                    assert_eq!(payload, b"sealed bytes");
                    break;
                }
                Frame::Control(Control::Ping) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
        client.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_offline_errors() {
        let connector = QueueConnector::new(vec![]);
        let client = TransportClient::new(ReplicaId::generate(), connector, test_config());
        let result = client.send_envelope(&DocumentId::new("chapters/one"), b"bytes");
        assert!(matches!(
            result,
            Err(SyncError::TransportDisconnected(_))
        ));
        client.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_reject_stops_retrying() {
        let (client_side, relay_side) = tokio::io::duplex(64 * 1024);
        let connector = QueueConnector::new(vec![client_side]);
        let client = TransportClient::new(ReplicaId::generate(), connector, test_config());
        let mut events = client.subscribe_events();

        client.connect();

        let mut framed = Framed::new(relay_side, FrameCodec::new());
        assert!(matches!(
            framed.next().await.unwrap().unwrap(),
            Frame::Control(Control::Hello { .. })
        ));
        framed
            .send(Frame::Control(Control::AuthReject("revoked".to_string())))
            .await
            .unwrap();

        match next_event(&mut events).await {
            TransportEvent::AuthRejected(reason) => assert_eq!(reason, "revoked"),
            other => panic!("unexpected event {:?}", other),
        }
        // The client gave up on its own; no further connect attempts.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        client.shutdown();
    }

    /// Collect the subscription set announced right after a handshake
    async fn subscribe_set(relay: &mut RelaySide, expected: usize) -> HashSet<DocumentId> {
        let mut seen = HashSet::new();
        while seen.len() < expected {
            match relay.next().await.unwrap().unwrap() {
                Frame::Control(Control::Subscribe { document_id }) => {
                    seen.insert(document_id);
                }
                Frame::Control(Control::Ping) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_after_reconnect() {
        let (client1, relay1) = tokio::io::duplex(64 * 1024);
        let (client2, relay2) = tokio::io::duplex(64 * 1024);
        // Popped in reverse order
        let connector = QueueConnector::new(vec![client2, client1]);
        let client = TransportClient::new(ReplicaId::generate(), connector, test_config());
        let mut events = client.subscribe_events();

        // A replica editing two documents must get both rooms back
        let docs: HashSet<DocumentId> = [
            DocumentId::new("chapters/one"),
            DocumentId::new("notes/villain"),
        ]
        .into_iter()
        .collect();
        for doc in &docs {
            client.subscribe(doc);
        }
        client.connect();

        // First connection: expect both subscriptions after the handshake
        let mut relay = accept(relay1).await;
        assert_eq!(subscribe_set(&mut relay, 2).await, docs);
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));

        // Kill the link; the client must reconnect and resubscribe both
        drop(relay);
        let mut relay = accept(relay2).await;
        assert_eq!(subscribe_set(&mut relay, 2).await, docs);
        client.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_envelope_reassembled_from_fragments() {
        let (client_side, relay_side) = tokio::io::duplex(256 * 1024);
        let connector = QueueConnector::new(vec![client_side]);
        let client = TransportClient::new(ReplicaId::generate(), connector, test_config());
        let mut events = client.subscribe_events();

        client.connect();
        let mut relay = accept(relay_side).await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));

        let doc = DocumentId::new("chapters/one");
        let payload: Vec<u8> = (0..40_000).map(|i| (i % 256) as u8).collect();
        for frame in fragment(&doc, ReplicaId::from_bytes([9u8; 16]), &payload).unwrap() {
            relay.send(frame).await.unwrap();
        }

        loop {
            match next_event(&mut events).await {
                TransportEvent::EnvelopeReceived { document_id, bytes } => {
                    assert_eq!(document_id, doc);
                    assert_eq!(bytes, payload);
                    break;
                }
                TransportEvent::Connected | TransportEvent::Disconnected => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
        client.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_relay_ping() {
        let (client_side, relay_side) = tokio::io::duplex(64 * 1024);
        let connector = QueueConnector::new(vec![client_side]);
        let client = TransportClient::new(ReplicaId::generate(), connector, test_config());
        let mut events = client.subscribe_events();

        client.connect();
        let mut relay = accept(relay_side).await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected
        ));

        relay.send(Frame::Control(Control::Ping)).await.unwrap();
        loop {
            match relay.next().await.unwrap().unwrap() {
                Frame::Control(Control::Pong) => break,
                Frame::Control(Control::Ping) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
        client.shutdown();
    }
}
