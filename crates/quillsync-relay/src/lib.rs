//! Untrusted ciphertext relay
//!
//! Accepts client connections, performs the `Hello`/`HelloAck`
//! handshake, and forwards document and presence frames between clients
//! subscribed to the same document. The relay never holds a key and
//! never looks inside a payload; it routes on the plaintext frame
//! headers alone.
//!
//! Document rooms are in-memory only. A relay restart loses nothing
//! durable: clients reconnect, resubscribe, and re-announce.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quillsync_core::sync::wire::{Control, Frame, FrameCodec, PROTOCOL_VERSION};
use quillsync_core::types::{DocumentId, ReplicaId};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Document id -> (client id -> outbound queue)
type Rooms = HashMap<DocumentId, HashMap<u64, mpsc::UnboundedSender<Frame>>>;

/// The relay server
pub struct RelayServer {
    listener: TcpListener,
    allowlist: Option<Arc<HashSet<ReplicaId>>>,
    rooms: Arc<Mutex<Rooms>>,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Bind to an address. Pass port 0 to let the OS pick one.
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!(addr = %listener.local_addr()?, "Relay listening");
        Ok(Self {
            listener,
            allowlist: None,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        })
    }

    /// Restrict service to a fixed set of replicas; anyone else gets an
    /// `AuthReject`. Without an allowlist every replica is served.
    pub fn with_allowlist(mut self, replicas: HashSet<ReplicaId>) -> Self {
        self.allowlist = Some(Arc::new(replicas));
        self
    }

    /// The bound address
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept and serve clients until the cancel token fires
    pub async fn run(self) -> anyhow::Result<()> {
        let mut next_client_id: u64 = 0;
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Relay shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted?,
            };
            let client_id = next_client_id;
            next_client_id += 1;
            debug!(%peer, client_id, "Client connected");

            tokio::spawn(serve_client(
                stream,
                client_id,
                self.rooms.clone(),
                self.allowlist.clone(),
                self.cancel.clone(),
            ));
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    client_id: u64,
    rooms: Arc<Mutex<Rooms>>,
    allowlist: Option<Arc<HashSet<ReplicaId>>>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client_id, error = %e, "set_nodelay failed");
    }
    let mut framed = Framed::new(stream, FrameCodec::new());

    // Handshake: Hello must be the first frame.
    let replica = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Frame::Control(Control::Hello {
            replica,
            protocol_version,
        })))) => {
            if protocol_version != PROTOCOL_VERSION {
                let _ = framed
                    .send(Frame::Control(Control::AuthReject(format!(
                        "unsupported protocol version {}",
                        protocol_version
                    ))))
                    .await;
                return;
            }
            if let Some(allowlist) = &allowlist {
                if !allowlist.contains(&replica) {
                    warn!(client_id, %replica, "Rejected unknown replica");
                    let _ = framed
                        .send(Frame::Control(Control::AuthReject(
                            "replica not authorized".to_string(),
                        )))
                        .await;
                    return;
                }
            }
            replica
        }
        other => {
            debug!(client_id, ?other, "Handshake failed");
            return;
        }
    };
    if framed.send(Frame::Control(Control::HelloAck)).await.is_err() {
        return;
    }
    info!(client_id, %replica, "Client authenticated");

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let (mut sink, mut inbound) = framed.split();
    let mut subscribed: HashSet<DocumentId> = HashSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            queued = rx.recv() => {
                match queued {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            frame = inbound.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(client_id, error = %e, "Bad frame; closing");
                        break;
                    }
                    None => break,
                };
                match frame {
                    Frame::Control(Control::Ping) => {
                        if sink.send(Frame::Control(Control::Pong)).await.is_err() {
                            break;
                        }
                    }
                    Frame::Control(Control::Subscribe { document_id }) => {
                        debug!(client_id, %document_id, "Subscribed");
                        rooms
                            .lock()
                            .entry(document_id.clone())
                            .or_default()
                            .insert(client_id, tx.clone());
                        subscribed.insert(document_id);
                    }
                    Frame::Control(Control::Unsubscribe { document_id }) => {
                        debug!(client_id, %document_id, "Unsubscribed");
                        remove_from_room(&rooms, &document_id, client_id);
                        subscribed.remove(&document_id);
                    }
                    frame @ (Frame::Document { .. } | Frame::Presence { .. }) => {
                        forward(&rooms, client_id, frame);
                    }
                    Frame::Control(_) => {
                        // Pong / stray handshake frames need no action
                    }
                }
            }
        }
    }

    for document_id in &subscribed {
        remove_from_room(&rooms, document_id, client_id);
    }
    debug!(client_id, "Client disconnected");
}

fn room_of(frame: &Frame) -> Option<&DocumentId> {
    match frame {
        Frame::Document { document_id, .. } | Frame::Presence { document_id, .. } => {
            Some(document_id)
        }
        Frame::Control(_) => None,
    }
}

/// Forward a frame to every other subscriber of its document
fn forward(rooms: &Arc<Mutex<Rooms>>, from: u64, frame: Frame) {
    let Some(document_id) = room_of(&frame) else {
        return;
    };
    let rooms = rooms.lock();
    let Some(room) = rooms.get(document_id) else {
        return;
    };
    for (&client_id, sender) in room {
        if client_id == from {
            continue;
        }
        // A closed receiver just means the client is mid-disconnect.
        let _ = sender.send(frame.clone());
    }
}

fn remove_from_room(rooms: &Arc<Mutex<Rooms>>, document_id: &DocumentId, client_id: u64) {
    let mut rooms = rooms.lock();
    if let Some(room) = rooms.get_mut(document_id) {
        room.remove(&client_id);
        if room.is_empty() {
            rooms.remove(document_id);
        }
    }
}
