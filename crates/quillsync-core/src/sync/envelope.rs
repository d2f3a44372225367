//! Encrypted, signed envelopes for document payloads
//!
//! Every sync payload crosses the relay inside an envelope:
//! encrypt-then-sign, so a receiver verifies the signature before
//! touching the ciphertext, and the relay sees routing metadata only.
//!
//! ## Verification order on receive
//!
//! 1. Envelope version supported
//! 2. Sender is a trusted peer
//! 3. Signature valid over the canonical byte layout
//! 4. Counter strictly above the last accepted from this (sender, doc)
//! 5. Ciphertext decrypts and authenticates
//!
//! The last-seen counter is only advanced after every check passes, and
//! it is persisted, so replays are rejected across restarts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{DocumentCrypto, NONCE_SIZE};
use crate::error::{SyncError, SyncResult};
use crate::identity::verify_signature;
use crate::keys::KeyProvider;
use crate::storage::Storage;
use crate::types::{DocumentId, ReplicaId};

/// Current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// One encrypted, signed sync payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope format version
    pub version: u8,
    /// Document the payload belongs to
    pub document_id: DocumentId,
    /// Replica that sealed the envelope
    pub sender: ReplicaId,
    /// Per-(sender, document) monotonic counter
    pub counter: u64,
    /// Nonce used for the AEAD
    pub nonce: [u8; NONCE_SIZE],
    /// ChaCha20-Poly1305 ciphertext with tag
    pub ciphertext: Vec<u8>,
    /// ed25519 signature over [`Envelope::signed_data`]
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Canonical byte layout the signature covers.
    ///
    /// Length-prefixed fields keep the layout unambiguous; any reordering
    /// or substitution of fields changes these bytes and breaks the
    /// signature.
    pub fn signed_data(&self) -> Vec<u8> {
        let doc = self.document_id.as_str().as_bytes();
        let mut out = Vec::with_capacity(1 + 4 + doc.len() + 16 + 8 + NONCE_SIZE + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(&(doc.len() as u32).to_le_bytes());
        out.extend_from_slice(doc);
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// Seals and opens envelopes for one replica
pub struct EnvelopeService {
    keys: Arc<dyn KeyProvider>,
    storage: Storage,
    replica: ReplicaId,
}

impl EnvelopeService {
    /// Create a service around this replica's keys and counter storage
    pub fn new(keys: Arc<dyn KeyProvider>, storage: Storage, replica: ReplicaId) -> Self {
        Self {
            keys,
            storage,
            replica,
        }
    }

    /// Encrypt and sign a payload for a document.
    ///
    /// The send counter is incremented and committed before the envelope
    /// exists, so a crash after sealing can never reuse a counter value.
    ///
    /// # Errors
    ///
    /// [`SyncError::KeyUnavailable`] if the document key has not been
    /// established.
    pub fn seal(&self, document: &DocumentId, plaintext: &[u8]) -> SyncResult<Envelope> {
        let key = self
            .keys
            .document_key(document)
            .ok_or_else(|| SyncError::KeyUnavailable(document.to_string()))?;

        let counter = self.storage.next_send_counter(document)?;
        let nonce = DocumentCrypto::generate_nonce();
        let ciphertext = DocumentCrypto::new(&key).encrypt_with_nonce(plaintext, &nonce)?;

        let mut envelope = Envelope {
            version: ENVELOPE_VERSION,
            document_id: document.clone(),
            sender: self.replica,
            counter,
            nonce,
            ciphertext,
            signature: Vec::new(),
        };
        let signature = self.keys.signing_keypair().sign(&envelope.signed_data());
        envelope.signature = signature.to_bytes().to_vec();

        debug!(%document, counter, "Sealed envelope");
        Ok(envelope)
    }

    /// Verify and decrypt an envelope from a peer.
    ///
    /// # Errors
    ///
    /// In check order: [`SyncError::EnvelopeVersionUnsupported`],
    /// [`SyncError::UntrustedSender`], [`SyncError::SignatureInvalid`],
    /// [`SyncError::ReplayDetected`], [`SyncError::KeyUnavailable`],
    /// [`SyncError::DecryptionFailed`].
    pub fn open(&self, envelope: &Envelope) -> SyncResult<Vec<u8>> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(SyncError::EnvelopeVersionUnsupported(envelope.version));
        }

        let peer_key = self
            .keys
            .trusted_peer_key(&envelope.sender)
            .ok_or_else(|| SyncError::UntrustedSender(envelope.sender.to_string()))?;
        verify_signature(&peer_key, &envelope.signed_data(), &envelope.signature)?;

        let last_seen = self
            .storage
            .last_seen_counter(&envelope.sender, &envelope.document_id)?;
        if envelope.counter <= last_seen {
            return Err(SyncError::ReplayDetected {
                sender: envelope.sender.to_string(),
                document: envelope.document_id.to_string(),
                counter: envelope.counter,
                last_seen,
            });
        }

        let key = self
            .keys
            .document_key(&envelope.document_id)
            .ok_or_else(|| SyncError::KeyUnavailable(envelope.document_id.to_string()))?;
        let plaintext =
            DocumentCrypto::new(&key).decrypt_with_nonce(&envelope.ciphertext, &envelope.nonce)?;

        self.storage.set_last_seen_counter(
            &envelope.sender,
            &envelope.document_id,
            envelope.counter,
        )?;
        Ok(plaintext)
    }

    /// The replica this service seals as
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }
}
