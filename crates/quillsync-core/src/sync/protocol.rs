//! Sync protocol messages carried inside envelopes
//!
//! These are the plaintexts the envelope layer seals: frontier
//! announcements, delta requests, op batches, and compressed snapshots.
//! The relay never sees them. The document id lives on the envelope, not
//! here, so it is authenticated exactly once.
//!
//! Convergence is announce-driven. Peers announce their frontier
//! periodically and after local changes; a peer that sees the other side
//! behind pushes the missing ops (or a snapshot when the other side has
//! nothing), and a peer that sees itself behind asks for a delta. Equal
//! frontiers on both sides is the in-sync signal.

use serde::{Deserialize, Serialize};

use crate::crdt::{Op, VersionVector};
use crate::error::{SyncError, SyncResult};

/// One sync protocol message (envelope plaintext)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// "Here is everything I have seen"
    Announce {
        /// Sender's causal frontier
        frontier: VersionVector,
    },
    /// "Send me what I am missing"
    DeltaRequest {
        /// Requester's causal frontier
        since: VersionVector,
    },
    /// A batch of ops, causally ordered by the sender
    Ops {
        /// The ops to merge
        ops: Vec<Op>,
    },
    /// Full document state, zstd-compressed [`crate::crdt::Snapshot`]
    Snapshot {
        /// Compressed snapshot bytes
        compressed: Vec<u8>,
    },
}

impl SyncMessage {
    /// Encode to envelope plaintext
    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode from envelope plaintext
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}
