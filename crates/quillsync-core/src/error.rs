//! Error types for the quillsync core

use thiserror::Error;

/// Main error type for quillsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Document was never attached to the store
    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    /// The document's symmetric key has not been established yet
    #[error("Key unavailable for document: {0}")]
    KeyUnavailable(String),

    /// Envelope sender is not a trusted peer (unknown or revoked key)
    #[error("Untrusted sender: {0}")]
    UntrustedSender(String),

    /// Envelope counter did not advance past the last seen counter
    #[error("Replay detected from {sender} for {document}: counter {counter} <= {last_seen}")]
    ReplayDetected {
        /// Claimed sender of the replayed envelope
        sender: String,
        /// Document the envelope was addressed to
        document: String,
        /// Counter carried by the envelope
        counter: u64,
        /// Highest counter previously accepted from this sender
        last_seen: u64,
    },

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// A CRDT operation was structurally invalid
    #[error("Malformed op: {0}")]
    MalformedOp(String),

    /// A wire frame could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The relay link is not available
    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    /// The relay rejected our handshake; terminal until re-authentication
    #[error("Fatal auth error: {0}")]
    FatalAuthError(String),

    /// Envelope protocol version not supported
    #[error("Envelope version {0} is not supported")]
    EnvelopeVersionUnsupported(u8),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Identity-related error (keys, replica ids)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
