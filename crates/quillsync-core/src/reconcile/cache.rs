//! Shadow copies of the editor buffer
//!
//! The reconciler diffs each incoming editor snapshot against the last
//! text it reconciled, not against the CRDT directly, so reads never
//! contend with merges. The cache is that shadow copy.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::DocumentId;

/// Stores the last reconciled text per document
pub trait DocumentCache: Send + Sync {
    /// Last reconciled text, or `None` if the document is unknown
    fn get_text(&self, document: &DocumentId) -> Option<String>;

    /// Record the text just reconciled
    fn set_text(&self, document: &DocumentId, text: String);

    /// Forget a document
    fn remove(&self, document: &DocumentId);
}

/// In-memory cache, the default
#[derive(Debug, Default)]
pub struct MemoryCache {
    texts: RwLock<HashMap<DocumentId, String>>,
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentCache for MemoryCache {
    fn get_text(&self, document: &DocumentId) -> Option<String> {
        self.texts.read().get(document).cloned()
    }

    fn set_text(&self, document: &DocumentId, text: String) {
        self.texts.write().insert(document.clone(), text);
    }

    fn remove(&self, document: &DocumentId) {
        self.texts.write().remove(document);
    }
}
