//! # quillsync-core
//!
//! Local-first, end-to-end-encrypted document sync for a desktop writing
//! app. The editor shell embeds a [`SyncEngine`]; everything else is
//! plumbing behind it:
//!
//! - [`crdt`]: the replicated text engine (character tree, causal ops,
//!   version vectors, snapshots)
//! - [`reconcile`]: debounced diffing between the editor buffer and the
//!   CRDT, with staleness guards and cursor mapping
//! - [`crypto`] / [`identity`] / [`keys`]: ChaCha20-Poly1305 payload
//!   encryption, ed25519 device identity, and the key-provisioning seam
//! - [`sync`]: envelopes, the relay wire format, the transport client,
//!   and the connection/session state machines
//! - [`storage`]: redb persistence for identity, replay counters, and
//!   snapshots
//!
//! The relay is untrusted: it routes ciphertext by document id and never
//! holds a key. Any two replicas that apply the same set of operations
//! render identical text, regardless of arrival order.

pub mod crdt;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod keys;
pub mod reconcile;
pub mod storage;
pub mod sync;
pub mod types;

pub use crdt::{DocumentStore, EditOp, MergeResult, Op, OpId, Snapshot, VersionVector};
pub use engine::{EngineConfig, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use identity::DeviceKeypair;
pub use keys::{KeyProvider, StaticKeyProvider};
pub use reconcile::Reconciler;
pub use storage::Storage;
pub use sync::{
    ConnectionState, Envelope, EnvelopeService, PresenceHint, SessionState, SyncEvent,
    SyncMessage, TcpConnector, TransportClient, TransportConfig,
};
pub use types::{DocumentId, ReplicaId};
