//! Core identifier types for quillsync

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Unique identifier for a syncable document.
///
/// Documents are identified by their project-relative path/slug, e.g.
/// `chapters/03-the-harbor` or `entities/captain-reyes`. The editor shell
/// owns the naming scheme; the core treats the id as an opaque string key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Create a document id from a path/slug
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One device/process identity.
///
/// Generated randomly once at install and persisted; all operations a
/// replica ever produces are tagged with this id. The derived ordering is
/// the deterministic tie-break for concurrent inserts, so `Ord` is part of
/// the convergence contract, not a convenience.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ReplicaId(pub [u8; 16]);

impl ReplicaId {
    /// Generate a new random replica id
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a replica id from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert to base58 string for display/storage keys
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from base58 string
    pub fn from_base58(s: &str) -> Result<Self, bs58::decode::Error> {
        let bytes = bs58::decode(s).into_vec()?;
        if bytes.len() != 16 {
            return Err(bs58::decode::Error::BufferTooSmall);
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for ReplicaId {
    // Full ids are 22 base58 chars; logs only need a prefix.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "replica_{}", bs58::encode(&self.0[..6]).into_string())
    }
}
