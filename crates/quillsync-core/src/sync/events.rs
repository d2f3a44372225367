//! Events the sync engine broadcasts to the editor shell

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::sync::session::{ConnectionState, SessionState};
use crate::types::{DocumentId, ReplicaId};

/// Ephemeral presence hint: where a collaborator's cursor is.
///
/// Presence is best-effort and never persisted; a lost hint is simply
/// replaced by the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceHint {
    /// Replica the hint describes
    pub replica: ReplicaId,
    /// Visible character offset of the cursor
    pub cursor: usize,
    /// Display label chosen by the sender (e.g. the author's name)
    pub label: String,
    /// Milliseconds since the Unix epoch, for staleness display
    pub sent_at: i64,
}

impl PresenceHint {
    /// Create a hint stamped with the current time
    pub fn now(replica: ReplicaId, cursor: usize, label: impl Into<String>) -> Self {
        Self {
            replica,
            cursor,
            label: label.into(),
            sent_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Events emitted by the engine for the editor shell to react to
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A merge changed a document's visible text
    DocumentChanged {
        /// The document that changed
        document_id: DocumentId,
        /// Full text after the merge
        new_text: String,
    },
    /// A document's sync status changed
    StatusChanged {
        /// The document whose status changed
        document_id: DocumentId,
        /// New status
        status: SessionState,
    },
    /// The relay connection changed state
    ConnectionChanged {
        /// New connection state
        state: ConnectionState,
    },
    /// A collaborator's cursor moved
    PresenceReceived {
        /// The document the hint belongs to
        document_id: DocumentId,
        /// The hint
        hint: PresenceHint,
    },
    /// Something went wrong that the shell should surface
    SyncError {
        /// Affected document, if the error is document-scoped
        document_id: Option<DocumentId>,
        /// Human-readable description
        message: String,
    },
}
