//! Key material seam between the editor shell and the sync core
//!
//! The core never generates or exchanges document keys; the shell
//! provisions them (per-document symmetric keys and trusted peer signing
//! keys) and hands them to the core through [`KeyProvider`]. Returning
//! `None` from any method simply means "not established yet" and the core
//! maps it to the matching error at the call site.

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;

use crate::identity::DeviceKeypair;
use crate::types::{DocumentId, ReplicaId};

/// Supplies key material to the envelope layer.
///
/// Implementations must be cheap to call; `seal`/`open` consult the
/// provider on every envelope.
pub trait KeyProvider: Send + Sync {
    /// Symmetric key for a document, or `None` if not yet established
    fn document_key(&self, document: &DocumentId) -> Option<[u8; 32]>;

    /// This device's signing keypair
    fn signing_keypair(&self) -> DeviceKeypair;

    /// Trusted public key for a peer replica, or `None` if the peer is
    /// unknown or has been revoked
    fn trusted_peer_key(&self, replica: &ReplicaId) -> Option<VerifyingKey>;
}

/// In-memory key provider backed by maps the shell fills in.
///
/// Suitable for tests and for shells that keep key material in their own
/// store and mirror it here.
pub struct StaticKeyProvider {
    keypair: DeviceKeypair,
    document_keys: RwLock<HashMap<DocumentId, [u8; 32]>>,
    peer_keys: RwLock<HashMap<ReplicaId, VerifyingKey>>,
}

impl StaticKeyProvider {
    /// Create a provider around this device's keypair
    pub fn new(keypair: DeviceKeypair) -> Self {
        Self {
            keypair,
            document_keys: RwLock::new(HashMap::new()),
            peer_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Establish the symmetric key for a document
    pub fn set_document_key(&self, document: DocumentId, key: [u8; 32]) {
        self.document_keys.write().insert(document, key);
    }

    /// Trust a peer's signing key
    pub fn trust_peer(&self, replica: ReplicaId, key: VerifyingKey) {
        self.peer_keys.write().insert(replica, key);
    }

    /// Revoke a previously trusted peer
    pub fn revoke_peer(&self, replica: &ReplicaId) {
        self.peer_keys.write().remove(replica);
    }
}

impl KeyProvider for StaticKeyProvider {
    fn document_key(&self, document: &DocumentId) -> Option<[u8; 32]> {
        self.document_keys.read().get(document).copied()
    }

    fn signing_keypair(&self) -> DeviceKeypair {
        self.keypair.clone()
    }

    fn trusted_peer_key(&self, replica: &ReplicaId) -> Option<VerifyingKey> {
        self.peer_keys.read().get(replica).copied()
    }
}
