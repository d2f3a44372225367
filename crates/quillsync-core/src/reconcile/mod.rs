//! Editor/CRDT reconciliation
//!
//! The editor owns a plain text buffer; the CRDT owns replicated state.
//! The reconciler sits between them:
//!
//! - editor snapshots are debounced, diffed against the shadow copy, and
//!   applied to the CRDT as local ops (sent onward for sealing)
//! - remote merges rewrite the text, advance the staleness generation so
//!   queued editor snapshots from before the merge are discarded, and map
//!   the local cursor through the change
//!
//! A flush holds the store lock while it checks its generation token, and
//! remote merges advance the generation under the same lock, so a stale
//! snapshot can never slip in between check and apply.

pub mod cache;
pub mod diff;
pub mod guard;

pub use cache::{DocumentCache, MemoryCache};
pub use diff::diff;
pub use guard::Generation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crdt::{DocumentStore, MergeResult, Op};
use crate::error::SyncResult;
use crate::types::DocumentId;

/// Result of merging remote ops through the reconciler
#[derive(Debug)]
pub struct RemoteOutcome {
    /// What the merge did
    pub merge: MergeResult,
    /// Full document text after the merge
    pub new_text: String,
    /// The local cursor mapped through the merge, if one was given
    pub cursor: Option<usize>,
}

struct PendingChange {
    text: String,
    token: u64,
    scheduled: bool,
}

/// Coordinates editor snapshots and CRDT merges for all documents
pub struct Reconciler {
    store: Arc<Mutex<DocumentStore>>,
    shadow: Arc<dyn DocumentCache>,
    outbound: mpsc::UnboundedSender<(DocumentId, Vec<Op>)>,
    debounce: Duration,
    generations: Mutex<HashMap<DocumentId, Arc<Generation>>>,
    pending: Mutex<HashMap<DocumentId, PendingChange>>,
}

impl Reconciler {
    /// Create a reconciler over a shared document store. Locally produced
    /// ops come out of the returned receiver, ready for sealing.
    pub fn new(
        store: Arc<Mutex<DocumentStore>>,
        shadow: Arc<dyn DocumentCache>,
        debounce: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(DocumentId, Vec<Op>)>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                store,
                shadow,
                outbound,
                debounce,
                generations: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
            rx,
        )
    }

    fn generation(&self, document: &DocumentId) -> Arc<Generation> {
        self.generations
            .lock()
            .entry(document.clone())
            .or_default()
            .clone()
    }

    /// Attach a document and reconcile the editor's current buffer with
    /// whatever state the store already holds (empty for new documents,
    /// restored for snapshot-loaded ones). Differences become local ops.
    pub fn attach(&self, document: &DocumentId, editor_text: &str) -> SyncResult<()> {
        let ops = {
            let mut store = self.store.lock();
            if !store.is_attached(document) {
                store.attach(document);
            }
            let current = store.text(document)?;
            let edits = diff(&current, editor_text);
            if edits.is_empty() {
                Vec::new()
            } else {
                store.apply_local(document, &edits)?
            }
        };
        self.generation(document);
        self.shadow.set_text(document, editor_text.to_string());
        if !ops.is_empty() {
            let _ = self.outbound.send((document.clone(), ops));
        }
        Ok(())
    }

    /// Detach a document, dropping any pending editor snapshot
    pub fn detach(&self, document: &DocumentId) {
        self.generation(document).advance();
        self.pending.lock().remove(document);
        self.generations.lock().remove(document);
        self.shadow.remove(document);
        self.store.lock().detach(document);
    }

    /// Record a new editor snapshot and schedule a debounced flush.
    /// Rapid successive snapshots coalesce into one flush of the latest.
    pub fn on_editor_change(self: &Arc<Self>, document: &DocumentId, text: String) {
        let token = self.generation(document).current();
        let mut pending = self.pending.lock();
        let entry = pending.entry(document.clone()).or_insert(PendingChange {
            text: String::new(),
            token,
            scheduled: false,
        });
        entry.text = text;
        entry.token = token;
        if !entry.scheduled {
            entry.scheduled = true;
            let this = self.clone();
            let document = document.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.debounce).await;
                this.flush(&document);
            });
        }
    }

    /// Flush the pending editor snapshot for a document immediately.
    /// Stale snapshots (captured before a remote merge) are discarded.
    pub fn flush(&self, document: &DocumentId) {
        let Some(change) = self.pending.lock().remove(document) else {
            return;
        };

        let ops = {
            let mut store = self.store.lock();
            // Generation advances happen under this same lock, so the
            // token check and the apply are atomic together.
            if !self.generation(document).is_current(change.token) {
                debug!(%document, "Dropping stale editor snapshot");
                return;
            }
            let old = self.shadow.get_text(document).unwrap_or_default();
            let edits = diff(&old, &change.text);
            if edits.is_empty() {
                return;
            }
            match store.apply_local(document, &edits) {
                Ok(ops) => ops,
                Err(e) => {
                    warn!(%document, error = %e, "Failed to apply editor snapshot");
                    return;
                }
            }
        };

        self.shadow.set_text(document, change.text);
        let _ = self.outbound.send((document.clone(), ops));
    }

    /// Merge remote ops, advancing the staleness generation and mapping
    /// the local cursor (a visible character offset) through the change.
    pub fn on_remote_ops(
        &self,
        document: &DocumentId,
        ops: Vec<Op>,
        cursor: Option<usize>,
    ) -> SyncResult<RemoteOutcome> {
        let mut store = self.store.lock();

        let anchor = match cursor {
            Some(offset) => Some(store.cursor_anchor(document, offset)?),
            None => None,
        };
        let merge = store.merge_remote(document, ops)?;
        let new_text = store.text(document)?;
        let mapped = match anchor {
            Some(anchor) => Some(store.cursor_after(document, anchor.as_ref())?),
            None => None,
        };
        if merge.text_changed {
            self.generation(document).advance();
            self.shadow.set_text(document, new_text.clone());
        }
        drop(store);

        Ok(RemoteOutcome {
            merge,
            new_text,
            cursor: mapped,
        })
    }
}
