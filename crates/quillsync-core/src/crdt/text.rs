//! Tree-structured replicated text container
//!
//! Every inserted character becomes a tree node identified by the `OpId`
//! of the insert that created it, parented under the position it was
//! anchored after (or the document root). Document order is a preorder
//! depth-first traversal.
//!
//! Siblings under one anchor sort by descending sequence, ties broken by
//! ascending replica id. Sequences are Lamport clocks, so an insert made
//! *after* seeing a sibling always sorts before it (preserving "insert
//! before the existing text" intent), while truly concurrent inserts at
//! the same anchor fall back to the replica-id tie-break. Every replica
//! computes the same sibling order, which is what makes merges converge.
//!
//! Deletes set a tombstone. Tombstoned nodes stay in the tree so that
//! stale deltas anchored on them still merge at the right position.

use std::collections::HashMap;

use crate::crdt::op::OpId;

#[derive(Debug, Clone)]
struct Node {
    id: OpId,
    ch: char,
    deleted: bool,
    /// Indices into the arena, kept in sibling order
    children: Vec<usize>,
}

/// Replicated text container for a single document
#[derive(Debug, Clone, Default)]
pub struct TextCrdt {
    /// Arena of all nodes ever inserted (tombstones included)
    nodes: Vec<Node>,
    /// Position id -> arena index
    index: HashMap<OpId, usize>,
    /// Children of the virtual root, in sibling order
    roots: Vec<usize>,
}

/// Sibling order: newer Lamport sequence first, ties by ascending replica.
fn precedes(a: &OpId, b: &OpId) -> bool {
    a.seq > b.seq || (a.seq == b.seq && a.replica < b.replica)
}

impl TextCrdt {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a position id exists (visible or tombstoned)
    pub fn contains(&self, id: &OpId) -> bool {
        self.index.contains_key(id)
    }

    /// Whether a position is tombstoned; `None` if the position is unknown
    pub fn is_deleted(&self, id: &OpId) -> Option<bool> {
        self.index.get(id).map(|&i| self.nodes[i].deleted)
    }

    /// Integrate an insert. The anchor must already exist (dependency
    /// checks happen in the store). Re-inserting a known id is a no-op.
    pub fn insert(&mut self, id: OpId, after: Option<&OpId>, ch: char) -> Result<(), String> {
        if self.index.contains_key(&id) {
            return Ok(());
        }
        let parent_idx = match after {
            Some(a) => Some(
                *self
                    .index
                    .get(a)
                    .ok_or_else(|| format!("unknown anchor {}", a))?,
            ),
            None => None,
        };

        let node_idx = self.nodes.len();
        self.nodes.push(Node {
            id,
            ch,
            deleted: false,
            children: Vec::new(),
        });
        self.index.insert(id, node_idx);

        let pos = {
            let nodes = &self.nodes;
            let siblings = match parent_idx {
                Some(p) => &nodes[p].children,
                None => &self.roots,
            };
            siblings.partition_point(|&i| precedes(&nodes[i].id, &id))
        };
        match parent_idx {
            Some(p) => self.nodes[p].children.insert(pos, node_idx),
            None => self.roots.insert(pos, node_idx),
        }
        Ok(())
    }

    /// Integrate a delete. Deleting an already-deleted position is a
    /// no-op; deleting an unknown position returns `false` (the store
    /// buffers such ops until the target arrives).
    pub fn delete(&mut self, target: &OpId) -> bool {
        match self.index.get(target) {
            Some(&i) => {
                self.nodes[i].deleted = true;
                true
            }
            None => false,
        }
    }

    /// Current visible plaintext
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.walk(|node| {
            if !node.deleted {
                out.push(node.ch);
            }
        });
        out
    }

    /// Number of visible characters
    pub fn visible_len(&self) -> usize {
        let mut n = 0;
        self.walk(|node| {
            if !node.deleted {
                n += 1;
            }
        });
        n
    }

    /// Position id of the `idx`-th visible character
    pub fn id_at_visible(&self, idx: usize) -> Option<OpId> {
        let mut seen = 0;
        let mut found = None;
        self.walk(|node| {
            if !node.deleted {
                if seen == idx && found.is_none() {
                    found = Some(node.id);
                }
                seen += 1;
            }
        });
        found
    }

    /// Anchor for inserting a new character at visible index `idx`:
    /// the position of the preceding visible character, or `None` at the
    /// document start.
    pub fn anchor_for_insert(&self, idx: usize) -> Option<OpId> {
        if idx == 0 {
            None
        } else {
            self.id_at_visible(idx - 1)
        }
    }

    /// Position ids of the visible characters in `[at, at + len)`
    pub fn ids_for_visible_range(&self, at: usize, len: usize) -> Vec<OpId> {
        let mut seen = 0;
        let mut out = Vec::with_capacity(len);
        self.walk(|node| {
            if !node.deleted {
                if seen >= at && seen < at + len {
                    out.push(node.id);
                }
                seen += 1;
            }
        });
        out
    }

    /// Visible cursor offset immediately after the given position.
    ///
    /// Counts visible characters up to and including the anchor (the
    /// anchor itself only counts if it is still visible, so a cursor
    /// anchored on a deleted character lands where that character was).
    /// An unknown anchor maps to the document start.
    pub fn visible_index_after(&self, anchor: &OpId) -> usize {
        let mut seen = 0;
        let mut result = None;
        self.walk(|node| {
            if node.id == *anchor && result.is_none() {
                result = Some(seen + usize::from(!node.deleted));
            }
            if !node.deleted {
                seen += 1;
            }
        });
        result.unwrap_or(0)
    }

    /// Preorder depth-first traversal over all nodes, tombstones included.
    /// Iterative: documents can be deep chains (one node per typed char).
    fn walk<F: FnMut(&Node)>(&self, mut f: F) {
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            f(node);
            stack.extend(node.children.iter().rev());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicaId;

    fn rid(byte: u8) -> ReplicaId {
        ReplicaId::from_bytes([byte; 16])
    }

    fn id(replica: u8, seq: u64) -> OpId {
        OpId::new(rid(replica), seq)
    }

    /// Type a string sequentially from one replica, starting at `seq`,
    /// each char anchored after the previous. Returns the last id used.
    fn type_str(crdt: &mut TextCrdt, replica: u8, mut seq: u64, s: &str) -> OpId {
        let mut prev: Option<OpId> = None;
        for ch in s.chars() {
            let op = id(replica, seq);
            crdt.insert(op, prev.as_ref(), ch).unwrap();
            prev = Some(op);
            seq += 1;
        }
        prev.unwrap()
    }

    #[test]
    fn test_sequential_typing() {
        let mut crdt = TextCrdt::new();
        type_str(&mut crdt, 1, 1, "hello");
        assert_eq!(crdt.text(), "hello");
        assert_eq!(crdt.visible_len(), 5);
    }

    #[test]
    fn test_insert_in_middle_preserves_intent() {
        // Type "ct", then insert 'a' anchored after 'c'. The 'a' was made
        // knowing 't' existed (higher sequence), so it sorts before 't'.
        let mut crdt = TextCrdt::new();
        crdt.insert(id(1, 1), None, 'c').unwrap();
        crdt.insert(id(1, 2), Some(&id(1, 1)), 't').unwrap();
        crdt.insert(id(1, 3), Some(&id(1, 1)), 'a').unwrap();
        assert_eq!(crdt.text(), "cat");
    }

    #[test]
    fn test_concurrent_root_inserts_tie_break_by_replica() {
        // Two replicas type at the start of an empty document. Both chains
        // have sequence 1 at the root, so replica order decides.
        let mut left = TextCrdt::new();
        type_str(&mut left, 1, 1, "cat");
        type_str(&mut left, 2, 1, "dog");

        let mut right = TextCrdt::new();
        type_str(&mut right, 2, 1, "dog");
        type_str(&mut right, 1, 1, "cat");

        assert_eq!(left.text(), right.text());
        assert_eq!(left.text(), "catdog"); // replica 1 < replica 2
    }

    #[test]
    fn test_delete_is_tombstone_and_idempotent() {
        let mut crdt = TextCrdt::new();
        type_str(&mut crdt, 1, 1, "abc");

        assert!(crdt.delete(&id(1, 2)));
        assert_eq!(crdt.text(), "ac");
        assert_eq!(crdt.is_deleted(&id(1, 2)), Some(true));

        // Second delete changes nothing
        assert!(crdt.delete(&id(1, 2)));
        assert_eq!(crdt.text(), "ac");
    }

    #[test]
    fn test_delete_unknown_position_returns_false() {
        let mut crdt = TextCrdt::new();
        assert!(!crdt.delete(&id(9, 1)));
    }

    #[test]
    fn test_insert_anchored_on_tombstone_survives() {
        let mut crdt = TextCrdt::new();
        type_str(&mut crdt, 1, 1, "ab");
        crdt.delete(&id(1, 1)); // delete 'a'
        // Concurrent insert anchored after the (now deleted) 'a'
        crdt.insert(id(2, 5), Some(&id(1, 1)), 'X').unwrap();
        assert_eq!(crdt.text(), "Xb");
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut crdt = TextCrdt::new();
        crdt.insert(id(1, 1), None, 'a').unwrap();
        crdt.insert(id(1, 1), None, 'a').unwrap();
        assert_eq!(crdt.text(), "a");
    }

    #[test]
    fn test_unknown_anchor_is_error() {
        let mut crdt = TextCrdt::new();
        assert!(crdt.insert(id(1, 2), Some(&id(9, 1)), 'x').is_err());
    }

    #[test]
    fn test_id_at_visible_skips_tombstones() {
        let mut crdt = TextCrdt::new();
        type_str(&mut crdt, 1, 1, "abc");
        crdt.delete(&id(1, 1));
        assert_eq!(crdt.id_at_visible(0), Some(id(1, 2)));
        assert_eq!(crdt.id_at_visible(1), Some(id(1, 3)));
        assert_eq!(crdt.id_at_visible(2), None);
    }

    #[test]
    fn test_anchor_for_insert() {
        let mut crdt = TextCrdt::new();
        type_str(&mut crdt, 1, 1, "ab");
        assert_eq!(crdt.anchor_for_insert(0), None);
        assert_eq!(crdt.anchor_for_insert(1), Some(id(1, 1)));
        assert_eq!(crdt.anchor_for_insert(2), Some(id(1, 2)));
    }

    #[test]
    fn test_visible_index_after_tombstoned_anchor() {
        let mut crdt = TextCrdt::new();
        type_str(&mut crdt, 1, 1, "abc");
        assert_eq!(crdt.visible_index_after(&id(1, 2)), 2);
        crdt.delete(&id(1, 2));
        // Cursor anchored on deleted 'b' lands between 'a' and 'c'
        assert_eq!(crdt.visible_index_after(&id(1, 2)), 1);
        // Unknown anchors map to the start
        assert_eq!(crdt.visible_index_after(&id(9, 1)), 0);
    }

    #[test]
    fn test_long_document_traversal_is_iterative() {
        // A 20k-char chain would overflow the stack under naive recursion.
        let mut crdt = TextCrdt::new();
        let body: String = std::iter::repeat('x').take(20_000).collect();
        type_str(&mut crdt, 1, 1, &body);
        assert_eq!(crdt.visible_len(), 20_000);
    }
}
