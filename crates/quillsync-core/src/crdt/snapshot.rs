//! Compacted full-state export of a document
//!
//! A snapshot carries the document's full op log plus its causal frontier,
//! with a BLAKE3 digest over the log so a corrupted or truncated snapshot
//! is rejected before any op reaches the container. Importing a snapshot
//! feeds every op through the normal merge rule, which is what makes
//! "import == merge all summarized ops" hold by construction.

use serde::{Deserialize, Serialize};

use crate::crdt::op::{Op, VersionVector};
use crate::error::{SyncError, SyncResult};
use crate::types::DocumentId;

/// zstd level used for wire transfer; snapshots are mostly small postcard
/// structures, so the cheap level is plenty.
const SNAPSHOT_ZSTD_LEVEL: i32 = 3;

/// Full-state export of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Document this snapshot describes
    pub document: DocumentId,
    /// Causal frontier at export time
    pub frontier: VersionVector,
    /// Every op the exporting replica had applied, in application order
    /// (a valid causal order: dependencies always precede dependents)
    pub ops: Vec<Op>,
    /// BLAKE3 digest over the serialized op log
    pub digest: [u8; 32],
}

impl Snapshot {
    /// Build a snapshot, computing the digest over the op log
    pub fn new(document: DocumentId, frontier: VersionVector, ops: Vec<Op>) -> SyncResult<Self> {
        let digest = Self::digest_ops(&ops)?;
        Ok(Self {
            document,
            frontier,
            ops,
            digest,
        })
    }

    fn digest_ops(ops: &[Op]) -> SyncResult<[u8; 32]> {
        let bytes =
            postcard::to_allocvec(ops).map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }

    /// Check the digest against the op log
    pub fn verify(&self) -> SyncResult<()> {
        let digest = Self::digest_ops(&self.ops)?;
        if digest != self.digest {
            return Err(SyncError::MalformedOp(format!(
                "snapshot digest mismatch for {}",
                self.document
            )));
        }
        Ok(())
    }

    /// Encode for storage (uncompressed postcard)
    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode from storage bytes
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Encode and zstd-compress for wire transfer
    pub fn to_compressed_bytes(&self) -> SyncResult<Vec<u8>> {
        let raw = self.to_bytes()?;
        zstd::stream::encode_all(raw.as_slice(), SNAPSHOT_ZSTD_LEVEL)
            .map_err(|e| SyncError::Serialization(format!("zstd encode: {}", e)))
    }

    /// Decompress and decode a wire snapshot
    pub fn from_compressed_bytes(bytes: &[u8]) -> SyncResult<Self> {
        let raw = zstd::stream::decode_all(bytes)
            .map_err(|e| SyncError::Serialization(format!("zstd decode: {}", e)))?;
        Self::from_bytes(&raw)
    }
}
