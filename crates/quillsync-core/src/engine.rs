//! Sync engine: the context object the editor shell talks to
//!
//! ## Responsibilities
//!
//! - owns the document store, envelope service, transport client, and
//!   reconciler, and wires their channels together
//! - routes inbound envelopes: open, decode, merge, react (delta push,
//!   delta request, snapshot, session transitions)
//! - announces frontiers periodically and after local changes, which is
//!   what drives convergence
//! - persists snapshots after merges so an offline restart resumes from
//!   the last known state
//! - broadcasts [`SyncEvent`]s for the shell to render
//!
//! ## Envelope flow
//!
//! ```text
//! editor ──snapshots──▶ reconciler ──ops──▶ seal ──frames──▶ relay
//! relay ──frames──▶ reassemble ──open──▶ decode ──merge──▶ events
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crdt::{DocumentStore, Op, Snapshot, VersionVector};
use crate::crypto::DocumentCrypto;
use crate::error::{SyncError, SyncResult};
use crate::keys::KeyProvider;
use crate::reconcile::{MemoryCache, Reconciler};
use crate::storage::Storage;
use crate::sync::envelope::{Envelope, EnvelopeService};
use crate::sync::events::{PresenceHint, SyncEvent};
use crate::sync::protocol::SyncMessage;
use crate::sync::session::{ConnectionEvent, ConnectionState, SessionEvent, SessionState};
use crate::sync::transport::{Connector, TransportClient, TransportConfig, TransportEvent};
use crate::types::{DocumentId, ReplicaId};

/// Engine timing knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Transport timing
    pub transport: TransportConfig,
    /// Interval between periodic frontier announcements
    pub announce_interval: Duration,
    /// Debounce window for editor snapshots
    pub debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            announce_interval: Duration::from_secs(10),
            debounce: Duration::from_millis(300),
        }
    }
}

struct EngineInner {
    storage: Storage,
    keys: Arc<dyn KeyProvider>,
    replica: ReplicaId,
    store: Arc<Mutex<DocumentStore>>,
    envelopes: EnvelopeService,
    transport: TransportClient,
    reconciler: Arc<Reconciler>,
    sessions: Mutex<HashMap<DocumentId, SessionState>>,
    connection: Mutex<ConnectionState>,
    events: broadcast::Sender<SyncEvent>,
    cancel: CancellationToken,
}

/// The sync core. One per running editor process.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build an engine and spawn its background tasks. The engine starts
    /// offline; call [`connect`](Self::connect) to go online.
    pub fn new(
        storage: Storage,
        keys: Arc<dyn KeyProvider>,
        connector: Arc<dyn Connector>,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        let replica = storage.load_or_create_replica_id()?;
        info!(%replica, "Starting sync engine");

        let store = Arc::new(Mutex::new(DocumentStore::new(replica)));
        let envelopes = EnvelopeService::new(keys.clone(), storage.clone(), replica);
        let transport = TransportClient::new(replica, connector, config.transport.clone());
        let (reconciler, local_ops) =
            Reconciler::new(store.clone(), Arc::new(MemoryCache::new()), config.debounce);
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(EngineInner {
            storage,
            keys,
            replica,
            store,
            envelopes,
            transport,
            reconciler,
            sessions: Mutex::new(HashMap::new()),
            connection: Mutex::new(ConnectionState::Disconnected),
            events,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Self::inbound_pump(inner.clone()));
        tokio::spawn(Self::outbound_pump(inner.clone(), local_ops));
        tokio::spawn(Self::announce_loop(inner.clone(), config.announce_interval));

        Ok(Self { inner })
    }

    /// This replica's identity
    pub fn replica_id(&self) -> ReplicaId {
        self.inner.replica
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Attach a document for syncing.
    ///
    /// Restores persisted state if a snapshot exists, reconciles the
    /// editor's current buffer against it, and subscribes on the relay.
    pub fn attach(&self, document: &DocumentId, editor_text: &str) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.store.lock().is_attached(document) {
            return Err(SyncError::InvalidOperation(format!(
                "{} is already attached",
                document
            )));
        }

        if let Some(snapshot) = inner.storage.load_snapshot(document)? {
            let mut store = inner.store.lock();
            store.attach(document);
            let result = store.import_snapshot(document, &snapshot)?;
            debug!(%document, restored = result.applied.len(), "Restored document from snapshot");
        }

        inner.reconciler.attach(document, editor_text)?;
        inner
            .sessions
            .lock()
            .insert(document.clone(), SessionState::Unsynced);
        inner.transport.subscribe(document);

        // Kick off convergence right away when online; offline peers will
        // announce on reconnect.
        inner.announce(document);
        Ok(())
    }

    /// Detach a document: flush pending edits, persist a snapshot, stop
    /// syncing it. Replay counters are kept.
    pub fn detach(&self, document: &DocumentId) -> SyncResult<()> {
        let inner = &self.inner;
        inner.reconciler.flush(document);
        inner.transport.unsubscribe(document);

        if inner.store.lock().is_attached(document) {
            let snapshot = inner.store.lock().export_snapshot(document)?;
            inner.storage.save_snapshot(&snapshot)?;
        }
        inner.reconciler.detach(document);
        inner.sessions.lock().remove(document);
        Ok(())
    }

    /// Feed a new editor snapshot for a document (debounced)
    pub fn on_editor_change(&self, document: &DocumentId, text: String) {
        self.inner.reconciler.on_editor_change(document, text);
    }

    /// Force a full resync of a document, the escape hatch out of
    /// [`SessionState::ConflictPending`]. Requests the peer's complete
    /// state; the import merges, never replaces.
    pub fn resync(&self, document: &DocumentId) -> SyncResult<()> {
        if !self.inner.store.lock().is_attached(document) {
            return Err(SyncError::UnknownDocument(document.to_string()));
        }
        self.inner
            .session_event(document, SessionEvent::ResyncRequested);
        self.inner.send_message(
            document,
            &SyncMessage::DeltaRequest {
                since: VersionVector::new(),
            },
        );
        Ok(())
    }

    /// Publish this replica's cursor position, best-effort
    pub fn publish_presence(&self, document: &DocumentId, cursor: usize, label: &str) {
        let inner = &self.inner;
        let Some(key) = inner.keys.document_key(document) else {
            return;
        };
        let hint = PresenceHint::now(inner.replica, cursor, label);
        let Ok(plaintext) = postcard::to_allocvec(&hint) else {
            return;
        };
        match DocumentCrypto::new(&key).encrypt(&plaintext) {
            Ok(bytes) => inner.transport.send_presence(document, bytes),
            Err(e) => debug!(%document, error = %e, "Presence encryption failed"),
        }
    }

    /// Go online. Calling this after an auth rejection is treated as
    /// re-authentication and resets the terminal error state.
    pub fn connect(&self) {
        {
            let mut connection = self.inner.connection.lock();
            if *connection == ConnectionState::Error {
                *connection = ConnectionState::Disconnected;
            }
        }
        self.inner.connection_event(ConnectionEvent::ConnectRequested);
        self.inner.transport.connect();
    }

    /// Go offline. In-flight reconnect attempts are cancelled.
    pub fn disconnect(&self) {
        self.inner.transport.disconnect();
        self.inner
            .connection_event(ConnectionEvent::DisconnectRequested);
    }

    /// Sync status of a document, if attached
    pub fn sync_status(&self, document: &DocumentId) -> Option<SessionState> {
        self.inner.sessions.lock().get(document).copied()
    }

    /// Current relay connection state
    pub fn connection_status(&self) -> ConnectionState {
        *self.inner.connection.lock()
    }

    /// Flush pending edits, persist snapshots, and stop all tasks
    pub fn shutdown(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let documents = inner.store.lock().documents();
        for document in &documents {
            inner.reconciler.flush(document);
        }
        for document in &documents {
            let snapshot = inner.store.lock().export_snapshot(document)?;
            inner.storage.save_snapshot(&snapshot)?;
        }
        inner.transport.shutdown();
        inner.cancel.cancel();
        Ok(())
    }

    async fn inbound_pump(inner: Arc<EngineInner>) {
        let mut events = inner.transport.subscribe_events();
        loop {
            let event = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Inbound pump lagged behind transport");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };

            match event {
                TransportEvent::Connected => {
                    inner.connection_event(ConnectionEvent::LinkEstablished);
                    // Re-announce everything; the relay may have dropped
                    // frames while we were away.
                    let documents = inner.store.lock().documents();
                    for document in documents {
                        inner.announce(&document);
                    }
                }
                TransportEvent::Disconnected | TransportEvent::ConnectFailed => {
                    inner.connection_event(ConnectionEvent::NetworkError);
                }
                TransportEvent::AuthRejected(reason) => {
                    inner.connection_event(ConnectionEvent::AuthRejected);
                    let _ = inner.events.send(SyncEvent::SyncError {
                        document_id: None,
                        message: SyncError::FatalAuthError(reason).to_string(),
                    });
                }
                TransportEvent::EnvelopeReceived { document_id, bytes } => {
                    inner.handle_envelope(&document_id, &bytes);
                }
                TransportEvent::PresenceReceived { document_id, bytes } => {
                    inner.handle_presence(&document_id, &bytes);
                }
            }
        }
    }

    async fn outbound_pump(
        inner: Arc<EngineInner>,
        mut local_ops: mpsc::UnboundedReceiver<(DocumentId, Vec<Op>)>,
    ) {
        loop {
            let (document, ops) = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                item = local_ops.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            inner.send_message(&document, &SyncMessage::Ops { ops });
            // Announce the moved frontier so peers can converge without
            // waiting for the timer.
            inner.announce(&document);
            if let Err(e) = inner.persist_snapshot(&document) {
                warn!(%document, error = %e, "Snapshot persistence failed");
            }
        }
    }

    async fn announce_loop(inner: Arc<EngineInner>, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            if !online(&inner) {
                continue;
            }
            let documents = inner.store.lock().documents();
            for document in documents {
                inner.announce(&document);
            }
        }
    }
}

fn online(inner: &EngineInner) -> bool {
    inner.connection.lock().is_online()
}

impl EngineInner {
    /// Update a session, emitting a status event when the state changes
    fn session_event(&self, document: &DocumentId, event: SessionEvent) {
        let mut sessions = self.sessions.lock();
        let Some(state) = sessions.get_mut(document) else {
            return;
        };
        let next = state.apply(event);
        if next != *state {
            debug!(%document, ?next, "Session state changed");
            *state = next;
            let _ = self.events.send(SyncEvent::StatusChanged {
                document_id: document.clone(),
                status: next,
            });
        }
    }

    /// Update the connection machine, emitting an event on change
    fn connection_event(&self, event: ConnectionEvent) {
        let mut connection = self.connection.lock();
        let next = connection.apply(event);
        if next != *connection {
            info!(?next, "Connection state changed");
            *connection = next;
            let _ = self.events.send(SyncEvent::ConnectionChanged { state: next });
        }
    }

    /// Seal and send a sync message. Failures are logged, not returned:
    /// the announce protocol is self-healing, so a dropped message only
    /// delays convergence.
    fn send_message(&self, document: &DocumentId, message: &SyncMessage) {
        let result = message
            .to_bytes()
            .and_then(|plaintext| self.envelopes.seal(document, &plaintext))
            .and_then(|envelope| envelope.to_bytes())
            .and_then(|bytes| self.transport.send_envelope(document, &bytes));
        if let Err(e) = result {
            match e {
                SyncError::TransportDisconnected(_) => {
                    debug!(%document, "Not connected; message skipped");
                }
                other => {
                    warn!(%document, error = %other, "Failed to send sync message");
                    let _ = self.events.send(SyncEvent::SyncError {
                        document_id: Some(document.clone()),
                        message: other.to_string(),
                    });
                }
            }
        }
    }

    fn announce(&self, document: &DocumentId) {
        let frontier = match self.store.lock().frontier(document) {
            Ok(frontier) => frontier,
            Err(_) => return,
        };
        self.send_message(document, &SyncMessage::Announce { frontier });
    }

    fn persist_snapshot(&self, document: &DocumentId) -> SyncResult<()> {
        let snapshot = self.store.lock().export_snapshot(document)?;
        self.storage.save_snapshot(&snapshot)
    }

    fn handle_envelope(&self, document: &DocumentId, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%document, error = %e, "Undecodable envelope");
                return;
            }
        };
        // The relay echoes room traffic to everyone else; our own
        // envelopes can still loop back through overlapping subscriptions.
        if envelope.sender == self.replica {
            return;
        }
        // Trust the authenticated document id, not the frame routing.
        if &envelope.document_id != document {
            debug!(%document, claimed = %envelope.document_id, "Envelope routed to wrong room");
        }

        let plaintext = match self.envelopes.open(&envelope) {
            Ok(plaintext) => plaintext,
            Err(SyncError::ReplayDetected { .. }) => {
                debug!(document = %envelope.document_id, sender = %envelope.sender, "Dropped replayed envelope");
                return;
            }
            Err(e) => {
                warn!(document = %envelope.document_id, error = %e, "Rejected envelope");
                let _ = self.events.send(SyncEvent::SyncError {
                    document_id: Some(envelope.document_id.clone()),
                    message: e.to_string(),
                });
                return;
            }
        };

        let message = match SyncMessage::from_bytes(&plaintext) {
            Ok(message) => message,
            Err(e) => {
                warn!(document = %envelope.document_id, error = %e, "Undecodable sync message");
                return;
            }
        };
        self.handle_message(&envelope.document_id, message);
    }

    fn handle_message(&self, document: &DocumentId, message: SyncMessage) {
        if !self.store.lock().is_attached(document) {
            debug!(%document, "Message for unattached document dropped");
            return;
        }

        match message {
            SyncMessage::Announce { frontier } => self.handle_announce(document, frontier),
            SyncMessage::DeltaRequest { since } => self.handle_delta_request(document, &since),
            SyncMessage::Ops { ops } => self.apply_remote_ops(document, ops),
            SyncMessage::Snapshot { compressed } => self.handle_snapshot(document, &compressed),
        }
    }

    fn handle_announce(&self, document: &DocumentId, theirs: VersionVector) {
        let ours = match self.store.lock().frontier(document) {
            Ok(frontier) => frontier,
            Err(_) => return,
        };

        if ours == theirs {
            self.session_event(document, SessionEvent::Converged);
            return;
        }
        self.session_event(document, SessionEvent::SyncStarted);
        self.session_event(document, SessionEvent::DivergenceObserved);

        // Push what they are missing
        if !theirs.dominates(&ours) {
            if theirs.is_empty() {
                self.send_full_state(document);
            } else {
                match self.store.lock().export_delta(document, &theirs) {
                    Ok(ops) if !ops.is_empty() => {
                        debug!(%document, count = ops.len(), "Pushing delta");
                        self.send_message(document, &SyncMessage::Ops { ops });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%document, error = %e, "Delta export failed"),
                }
            }
        }
        // Pull what we are missing
        if !ours.dominates(&theirs) {
            self.send_message(document, &SyncMessage::DeltaRequest { since: ours });
        }
    }

    fn handle_delta_request(&self, document: &DocumentId, since: &VersionVector) {
        if since.is_empty() {
            self.send_full_state(document);
            return;
        }
        match self.store.lock().export_delta(document, since) {
            Ok(ops) => {
                debug!(%document, count = ops.len(), "Answering delta request");
                self.send_message(document, &SyncMessage::Ops { ops });
            }
            Err(e) => warn!(%document, error = %e, "Delta export failed"),
        }
    }

    fn send_full_state(&self, document: &DocumentId) {
        let compressed = {
            let store = self.store.lock();
            store
                .export_snapshot(document)
                .and_then(|snapshot| snapshot.to_compressed_bytes())
        };
        match compressed {
            Ok(compressed) => {
                debug!(%document, bytes = compressed.len(), "Sending full state");
                self.send_message(document, &SyncMessage::Snapshot { compressed });
            }
            Err(e) => warn!(%document, error = %e, "Snapshot export failed"),
        }
    }

    fn handle_snapshot(&self, document: &DocumentId, compressed: &[u8]) {
        let snapshot = match Snapshot::from_compressed_bytes(compressed) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%document, error = %e, "Undecodable snapshot");
                self.session_event(document, SessionEvent::MalformedOpDetected);
                return;
            }
        };
        if let Err(e) = snapshot.verify() {
            warn!(%document, error = %e, "Snapshot failed verification");
            self.session_event(document, SessionEvent::MalformedOpDetected);
            return;
        }
        self.apply_remote_ops(document, snapshot.ops);
    }

    fn apply_remote_ops(&self, document: &DocumentId, ops: Vec<Op>) {
        let outcome = match self.reconciler.on_remote_ops(document, ops, None) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%document, error = %e, "Merge failed");
                let _ = self.events.send(SyncEvent::SyncError {
                    document_id: Some(document.clone()),
                    message: e.to_string(),
                });
                return;
            }
        };

        if outcome.merge.has_rejects() {
            for (op, reason) in &outcome.merge.rejected {
                warn!(%document, op = %op, %reason, "Peer sent malformed op");
            }
            self.session_event(document, SessionEvent::MalformedOpDetected);
            let _ = self.events.send(SyncEvent::SyncError {
                document_id: Some(document.clone()),
                message: "Peer sent malformed operations; resync required".to_string(),
            });
        }

        if outcome.merge.text_changed {
            let _ = self.events.send(SyncEvent::DocumentChanged {
                document_id: document.clone(),
                new_text: outcome.new_text,
            });
        }

        if !outcome.merge.applied.is_empty() || outcome.merge.text_changed {
            if let Err(e) = self.persist_snapshot(document) {
                warn!(%document, error = %e, "Snapshot persistence failed");
            }
        }

        if !outcome.merge.buffered.is_empty() {
            // Ops are parked waiting for dependencies we never received;
            // ask for everything past our frontier.
            if let Ok(ours) = self.store.lock().frontier(document) {
                debug!(%document, parked = outcome.merge.buffered.len(), "Requesting missing dependencies");
                self.send_message(document, &SyncMessage::DeltaRequest { since: ours });
            }
        } else if !outcome.merge.has_rejects() && !outcome.merge.applied.is_empty() {
            // Everything merged cleanly; tell the sender where we are so
            // both sides can settle into InSync.
            self.session_event(document, SessionEvent::Converged);
            self.announce(document);
        }
    }

    fn handle_presence(&self, document: &DocumentId, bytes: &[u8]) {
        if !self.store.lock().is_attached(document) {
            return;
        }
        let Some(key) = self.keys.document_key(document) else {
            return;
        };
        let plaintext = match DocumentCrypto::new(&key).decrypt(bytes) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(%document, error = %e, "Undecryptable presence frame dropped");
                return;
            }
        };
        let hint: PresenceHint = match postcard::from_bytes(&plaintext) {
            Ok(hint) => hint,
            Err(_) => return,
        };
        if hint.replica == self.replica {
            return;
        }
        let _ = self.events.send(SyncEvent::PresenceReceived {
            document_id: document.clone(),
            hint,
        });
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        self.inner.transport.shutdown();
    }
}
