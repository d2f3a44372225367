//! Causal document store
//!
//! One replicated text container per attached document, plus the causal
//! bookkeeping around it: the Lamport clock, the applied-op frontier, the
//! op log for delta/snapshot export, and the out-of-order buffer for ops
//! whose dependencies have not arrived yet.
//!
//! All operations here are synchronous and in-memory; nothing in the
//! merge path does I/O. Callers serialize access per document.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::crdt::op::{Op, OpAction, OpId, VersionVector};
use crate::crdt::snapshot::Snapshot;
use crate::crdt::text::TextCrdt;
use crate::error::{SyncError, SyncResult};
use crate::types::{DocumentId, ReplicaId};

/// A plain-text edit produced by diffing the editor surface.
/// Positions are visible character indices, interpreted against the
/// container state at the moment each edit is applied (deletes first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    /// Insert `text` so its first char lands at visible index `at`
    Insert {
        /// Visible character index of the insertion point
        at: usize,
        /// Characters to insert
        text: String,
    },
    /// Delete `len` visible characters starting at `at`
    Delete {
        /// Visible character index of the first deleted character
        at: usize,
        /// Number of characters to delete
        len: usize,
    },
}

/// Outcome of merging a batch of remote ops
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Ops applied to the container (in application order)
    pub applied: Vec<OpId>,
    /// Ops parked until a missing dependency arrives
    pub buffered: Vec<OpId>,
    /// Ops already seen before; re-merging is a no-op
    pub duplicate: Vec<OpId>,
    /// Structurally invalid ops, with the reason
    pub rejected: Vec<(OpId, String)>,
    /// Whether the visible plaintext changed
    pub text_changed: bool,
}

impl MergeResult {
    /// Whether any op was rejected as malformed
    pub fn has_rejects(&self) -> bool {
        !self.rejected.is_empty()
    }
}

/// Per-document replicated state
#[derive(Debug, Default)]
struct DocumentState {
    text: TextCrdt,
    frontier: VersionVector,
    /// Lamport clock: strictly above every sequence this replica has
    /// produced or observed for this document
    clock: u64,
    /// Our most recent local op, the per-replica ordering dependency
    last_local: Option<OpId>,
    /// Every applied op, in application order (a valid causal order)
    oplog: Vec<Op>,
    /// Out-of-order ops keyed by the dependency they are waiting for
    pending: HashMap<OpId, Vec<Op>>,
}

/// Holds every attached document's CRDT state for one replica
#[derive(Debug)]
pub struct DocumentStore {
    replica: ReplicaId,
    docs: HashMap<DocumentId, DocumentState>,
}

impl DocumentStore {
    /// Create a store for the given replica identity
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            docs: HashMap::new(),
        }
    }

    /// The replica identity this store stamps onto local ops
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Attach a document, creating empty state if needed.
    /// Returns `false` if it was already attached.
    pub fn attach(&mut self, document: &DocumentId) -> bool {
        if self.docs.contains_key(document) {
            return false;
        }
        self.docs.insert(document.clone(), DocumentState::default());
        true
    }

    /// Detach a document, discarding its in-memory state (including any
    /// buffered out-of-order ops). Returns `false` if it was not attached.
    pub fn detach(&mut self, document: &DocumentId) -> bool {
        self.docs.remove(document).is_some()
    }

    /// Whether the document is attached
    pub fn is_attached(&self, document: &DocumentId) -> bool {
        self.docs.contains_key(document)
    }

    /// Ids of all attached documents
    pub fn documents(&self) -> Vec<DocumentId> {
        self.docs.keys().cloned().collect()
    }

    /// Current visible plaintext of a document
    pub fn text(&self, document: &DocumentId) -> SyncResult<String> {
        Ok(self.state(document)?.text.text())
    }

    /// Current causal frontier of a document
    pub fn frontier(&self, document: &DocumentId) -> SyncResult<VersionVector> {
        Ok(self.state(document)?.frontier.clone())
    }

    /// Number of ops parked waiting for missing dependencies
    pub fn pending_count(&self, document: &DocumentId) -> SyncResult<usize> {
        Ok(self.state(document)?.pending.values().map(Vec::len).sum())
    }

    /// Generate and apply ops for a local edit script.
    ///
    /// Ops are applied to the container immediately (the editor sees its
    /// own edit with no round trip) and returned for sealing and sending.
    pub fn apply_local(&mut self, document: &DocumentId, edits: &[EditOp]) -> SyncResult<Vec<Op>> {
        let replica = self.replica;
        let state = self.state_mut(document)?;
        let mut ops = Vec::new();

        for edit in edits {
            match edit {
                EditOp::Insert { at, text } => {
                    if *at > state.text.visible_len() {
                        return Err(SyncError::InvalidOperation(format!(
                            "insert at {} beyond end of {}",
                            at, document
                        )));
                    }
                    let mut anchor = state.text.anchor_for_insert(*at);
                    for ch in text.chars() {
                        state.clock += 1;
                        let id = OpId::new(replica, state.clock);
                        let op = Op::insert(id, document.clone(), anchor, ch, state.last_local);
                        state
                            .text
                            .insert(id, anchor.as_ref(), ch)
                            .map_err(SyncError::MalformedOp)?;
                        state.frontier.record(&id);
                        state.last_local = Some(id);
                        state.oplog.push(op.clone());
                        ops.push(op);
                        anchor = Some(id);
                    }
                }
                EditOp::Delete { at, len } => {
                    let targets = state.text.ids_for_visible_range(*at, *len);
                    if targets.len() != *len {
                        return Err(SyncError::InvalidOperation(format!(
                            "delete of {} chars at {} beyond end of {}",
                            len, at, document
                        )));
                    }
                    for target in targets {
                        state.clock += 1;
                        let id = OpId::new(replica, state.clock);
                        let op = Op::delete(id, document.clone(), target, state.last_local);
                        state.text.delete(&target);
                        state.frontier.record(&id);
                        state.last_local = Some(id);
                        state.oplog.push(op.clone());
                        ops.push(op);
                    }
                }
            }
        }

        debug!(%document, ops = ops.len(), "Applied local edit");
        Ok(ops)
    }

    /// Merge a batch of remote ops.
    ///
    /// Ops with satisfied dependencies are applied (and may release
    /// previously buffered ops); ops with missing dependencies are parked
    /// under the dependency they wait for; already-seen ops are no-ops;
    /// structurally invalid ops are rejected and reported, never applied.
    pub fn merge_remote(&mut self, document: &DocumentId, ops: Vec<Op>) -> SyncResult<MergeResult> {
        let state = self.state_mut(document)?;
        let mut result = MergeResult::default();
        let mut queue: VecDeque<Op> = ops.into();

        while let Some(op) = queue.pop_front() {
            if let Some(reason) = op.malformed_reason(document) {
                warn!(%document, op = %op.id, %reason, "Rejected malformed op");
                result.rejected.push((op.id, reason));
                continue;
            }
            if state.frontier.contains(&op.id) {
                result.duplicate.push(op.id);
                continue;
            }
            if let Some(missing) = op.deps.iter().find(|d| !state.frontier.contains(d)) {
                debug!(%document, op = %op.id, waiting_for = %missing, "Buffered out-of-order op");
                state.pending.entry(*missing).or_default().push(op.clone());
                result.buffered.push(op.id);
                continue;
            }

            match &op.action {
                OpAction::Insert { after, ch } => {
                    if let Err(reason) = state.text.insert(op.id, after.as_ref(), *ch) {
                        result.rejected.push((op.id, reason));
                        continue;
                    }
                    result.text_changed = true;
                }
                OpAction::Delete { target } => {
                    // Deleting an already-deleted position is a no-op by
                    // contract; concurrency makes it unavoidable.
                    let was_visible = state.text.is_deleted(target) == Some(false);
                    state.text.delete(target);
                    if was_visible {
                        result.text_changed = true;
                    }
                }
            }
            state.clock = state.clock.max(op.id.seq);
            state.frontier.record(&op.id);
            result.applied.push(op.id);

            // Release anything that was waiting on this op
            if let Some(waiting) = state.pending.remove(&op.id) {
                queue.extend(waiting);
            }
            state.oplog.push(op);
        }

        // An op buffered and then released within this same batch counts
        // as applied, not buffered.
        result.buffered.retain(|id| !result.applied.contains(id));

        debug!(
            %document,
            applied = result.applied.len(),
            buffered = result.buffered.len(),
            duplicate = result.duplicate.len(),
            rejected = result.rejected.len(),
            "Merged remote ops"
        );
        Ok(result)
    }

    /// Export the full state of a document
    pub fn export_snapshot(&self, document: &DocumentId) -> SyncResult<Snapshot> {
        let state = self.state(document)?;
        Snapshot::new(
            document.clone(),
            state.frontier.clone(),
            state.oplog.clone(),
        )
    }

    /// Import a snapshot, merging through the normal convergence rule.
    /// Importing into a non-empty container is a merge, not a replace.
    pub fn import_snapshot(
        &mut self,
        document: &DocumentId,
        snapshot: &Snapshot,
    ) -> SyncResult<MergeResult> {
        snapshot.verify()?;
        self.merge_remote(document, snapshot.ops.clone())
    }

    /// Export the ops a peer at the given frontier is missing
    pub fn export_delta(
        &self,
        document: &DocumentId,
        since: &VersionVector,
    ) -> SyncResult<Vec<Op>> {
        let state = self.state(document)?;
        Ok(state
            .oplog
            .iter()
            .filter(|op| op.id.seq > since.get(&op.id.replica))
            .cloned()
            .collect())
    }

    /// Position id containing the cursor at visible offset `cursor`
    /// (the character just before the cursor), for mapping the cursor
    /// forward across a merge. `None` means the document start.
    pub fn cursor_anchor(
        &self,
        document: &DocumentId,
        cursor: usize,
    ) -> SyncResult<Option<OpId>> {
        let state = self.state(document)?;
        Ok(if cursor == 0 {
            None
        } else {
            state.text.id_at_visible(cursor.saturating_sub(1))
        })
    }

    /// Visible offset just after the given anchor in the current text
    pub fn cursor_after(
        &self,
        document: &DocumentId,
        anchor: Option<&OpId>,
    ) -> SyncResult<usize> {
        let state = self.state(document)?;
        Ok(match anchor {
            None => 0,
            Some(a) => state.text.visible_index_after(a),
        })
    }

    fn state(&self, document: &DocumentId) -> SyncResult<&DocumentState> {
        self.docs
            .get(document)
            .ok_or_else(|| SyncError::UnknownDocument(document.to_string()))
    }

    fn state_mut(&mut self, document: &DocumentId) -> SyncResult<&mut DocumentState> {
        self.docs
            .get_mut(document)
            .ok_or_else(|| SyncError::UnknownDocument(document.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::new("chapters/one")
    }

    fn store(byte: u8) -> DocumentStore {
        let mut s = DocumentStore::new(ReplicaId::from_bytes([byte; 16]));
        s.attach(&doc());
        s
    }

    fn type_text(s: &mut DocumentStore, text: &str) -> Vec<Op> {
        let at = s.text(&doc()).unwrap().chars().count();
        s.apply_local(
            &doc(),
            &[EditOp::Insert {
                at,
                text: text.to_string(),
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_document_errors() {
        let mut s = DocumentStore::new(ReplicaId::generate());
        let err = s
            .apply_local(&doc(), &[EditOp::Insert { at: 0, text: "x".into() }])
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownDocument(_)));
        assert!(matches!(
            s.merge_remote(&doc(), vec![]),
            Err(SyncError::UnknownDocument(_))
        ));
    }

    #[test]
    fn test_apply_local_reflects_immediately() {
        let mut s = store(1);
        let ops = type_text(&mut s, "hello");
        assert_eq!(ops.len(), 5);
        assert_eq!(s.text(&doc()).unwrap(), "hello");
    }

    #[test]
    fn test_apply_local_delete() {
        let mut s = store(1);
        type_text(&mut s, "hello");
        let ops = s
            .apply_local(&doc(), &[EditOp::Delete { at: 1, len: 3 }])
            .unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(s.text(&doc()).unwrap(), "ho");
    }

    #[test]
    fn test_apply_local_out_of_bounds() {
        let mut s = store(1);
        type_text(&mut s, "ab");
        assert!(s
            .apply_local(&doc(), &[EditOp::Insert { at: 9, text: "x".into() }])
            .is_err());
        assert!(s
            .apply_local(&doc(), &[EditOp::Delete { at: 1, len: 5 }])
            .is_err());
    }

    #[test]
    fn test_merge_between_replicas() {
        let mut a = store(1);
        let mut b = store(2);

        let ops = type_text(&mut a, "hi");
        let result = b.merge_remote(&doc(), ops).unwrap();
        assert_eq!(result.applied.len(), 2);
        assert!(result.text_changed);
        assert_eq!(b.text(&doc()).unwrap(), "hi");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = store(1);
        let mut b = store(2);

        let ops = type_text(&mut a, "hi");
        b.merge_remote(&doc(), ops.clone()).unwrap();
        let text_before = b.text(&doc()).unwrap();

        let again = b.merge_remote(&doc(), ops).unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(again.duplicate.len(), 2);
        assert!(!again.text_changed);
        assert_eq!(b.text(&doc()).unwrap(), text_before);
    }

    #[test]
    fn test_out_of_order_ops_buffer_then_apply() {
        let mut a = store(1);
        let mut b = store(2);

        let ops = type_text(&mut a, "abc");

        // Deliver the tail first: it depends on the earlier inserts.
        let tail = vec![ops[2].clone()];
        let result = b.merge_remote(&doc(), tail).unwrap();
        assert_eq!(result.buffered.len(), 1);
        assert_eq!(b.text(&doc()).unwrap(), "");
        assert_eq!(b.pending_count(&doc()).unwrap(), 1);

        // Now the head arrives and releases the buffered op.
        let head = vec![ops[0].clone(), ops[1].clone()];
        let result = b.merge_remote(&doc(), head).unwrap();
        assert_eq!(result.applied.len(), 3);
        assert_eq!(b.text(&doc()).unwrap(), "abc");
        assert_eq!(b.pending_count(&doc()).unwrap(), 0);
    }

    #[test]
    fn test_buffered_then_released_in_same_batch() {
        let mut a = store(1);
        let mut b = store(2);

        let mut ops = type_text(&mut a, "ab");
        ops.reverse();
        let result = b.merge_remote(&doc(), ops).unwrap();
        assert_eq!(result.applied.len(), 2);
        assert!(result.buffered.is_empty());
        assert_eq!(b.text(&doc()).unwrap(), "ab");
    }

    #[test]
    fn test_concurrent_inserts_converge_both_orders() {
        let mut a = store(1);
        let mut b = store(2);

        let ops_a = type_text(&mut a, "cat");
        let ops_b = type_text(&mut b, "dog");

        a.merge_remote(&doc(), ops_b.clone()).unwrap();
        b.merge_remote(&doc(), ops_a.clone()).unwrap();

        let text_a = a.text(&doc()).unwrap();
        let text_b = b.text(&doc()).unwrap();
        assert_eq!(text_a, text_b);
        // One consistent result, not an interleaving of both
        assert!(text_a == "catdog" || text_a == "dogcat");
    }

    #[test]
    fn test_concurrent_delete_and_anchored_insert() {
        let mut a = store(1);
        let mut b = store(2);

        let seed = type_text(&mut a, "xy");
        b.merge_remote(&doc(), seed.clone()).unwrap();

        // A deletes 'x'; B concurrently inserts after 'x'.
        let del = a
            .apply_local(&doc(), &[EditOp::Delete { at: 0, len: 1 }])
            .unwrap();
        let ins = b
            .apply_local(&doc(), &[EditOp::Insert { at: 1, text: "Q".into() }])
            .unwrap();

        a.merge_remote(&doc(), ins).unwrap();
        b.merge_remote(&doc(), del).unwrap();

        // The inserted char survives; the deleted char is gone; identical.
        assert_eq!(a.text(&doc()).unwrap(), b.text(&doc()).unwrap());
        assert_eq!(a.text(&doc()).unwrap(), "Qy");
    }

    #[test]
    fn test_malformed_op_rejected_not_applied() {
        let mut a = store(1);
        let mut b = store(2);
        let mut ops = type_text(&mut a, "a");
        ops[0].id.seq = 0;
        let result = b.merge_remote(&doc(), ops).unwrap();
        assert!(result.has_rejects());
        assert!(result.applied.is_empty());
        assert_eq!(b.text(&doc()).unwrap(), "");
    }

    #[test]
    fn test_snapshot_roundtrip_same_text() {
        let mut a = store(1);
        type_text(&mut a, "hello world");
        a.apply_local(&doc(), &[EditOp::Delete { at: 5, len: 6 }])
            .unwrap();

        let snap = a.export_snapshot(&doc()).unwrap();

        let mut b = store(2);
        let result = b.import_snapshot(&doc(), &snap).unwrap();
        assert!(!result.has_rejects());
        assert_eq!(b.text(&doc()).unwrap(), a.text(&doc()).unwrap());
        assert_eq!(b.frontier(&doc()).unwrap(), a.frontier(&doc()).unwrap());
    }

    #[test]
    fn test_snapshot_import_into_nonempty_merges() {
        let mut a = store(1);
        let mut b = store(2);
        type_text(&mut a, "cat");
        type_text(&mut b, "dog");

        let snap = a.export_snapshot(&doc()).unwrap();
        b.import_snapshot(&doc(), &snap).unwrap();

        let mut c = store(3);
        c.import_snapshot(&doc(), &b.export_snapshot(&doc()).unwrap())
            .unwrap();
        assert_eq!(c.text(&doc()).unwrap(), b.text(&doc()).unwrap());
    }

    #[test]
    fn test_export_delta_since_frontier() {
        let mut a = store(1);
        let mut b = store(2);

        let first = type_text(&mut a, "ab");
        b.merge_remote(&doc(), first).unwrap();

        type_text(&mut a, "cd");

        let since = b.frontier(&doc()).unwrap();
        let delta = a.export_delta(&doc(), &since).unwrap();
        assert_eq!(delta.len(), 2);

        b.merge_remote(&doc(), delta).unwrap();
        assert_eq!(b.text(&doc()).unwrap(), a.text(&doc()).unwrap());
    }

    #[test]
    fn test_cursor_mapping_across_merge() {
        let mut a = store(1);
        let mut b = store(2);

        let seed = type_text(&mut a, "abc");
        b.merge_remote(&doc(), seed).unwrap();

        // Cursor after 'b' on replica B
        let anchor = b.cursor_anchor(&doc(), 2).unwrap();

        // A inserts at the front, shifting everything right
        let ins = a
            .apply_local(&doc(), &[EditOp::Insert { at: 0, text: "ZZ".into() }])
            .unwrap();
        b.merge_remote(&doc(), ins).unwrap();

        assert_eq!(b.text(&doc()).unwrap(), "ZZabc");
        assert_eq!(b.cursor_after(&doc(), anchor.as_ref()).unwrap(), 4);
    }

    #[test]
    fn test_detach_discards_buffered_ops() {
        let mut a = store(1);
        let mut b = store(2);
        let ops = type_text(&mut a, "ab");
        b.merge_remote(&doc(), vec![ops[1].clone()]).unwrap();
        assert_eq!(b.pending_count(&doc()).unwrap(), 1);

        assert!(b.detach(&doc()));
        assert!(!b.is_attached(&doc()));
        b.attach(&doc());
        assert_eq!(b.pending_count(&doc()).unwrap(), 0);
    }
}
