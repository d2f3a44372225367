//! CRDT operations, position identifiers, and causal frontiers
//!
//! Every character a replica inserts is identified forever by the `OpId`
//! of the insert that created it. Ops carry explicit causal dependencies:
//! the previous op by the same replica (per-replica ordering) and the
//! position they anchor to or delete (structural dependency). A receiver
//! may only apply an op once all of its dependencies are visible.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{DocumentId, ReplicaId};

/// Identity of a single operation: `(replica_id, sequence)`.
///
/// Sequences are Lamport-style per-document clocks: strictly increasing on
/// each replica and advanced past every remotely observed value, so an op's
/// sequence dominates everything the replica had seen when it produced it.
/// A given pair identifies at most one operation, ever.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OpId {
    /// The replica that produced the op
    pub replica: ReplicaId,
    /// The replica's Lamport sequence for this document (>= 1)
    pub seq: u64,
}

impl OpId {
    /// Create an op id
    pub fn new(replica: ReplicaId, seq: u64) -> Self {
        Self { replica, seq }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.replica, self.seq)
    }
}

/// The mutation an op performs on the text container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpAction {
    /// Insert one character anchored after an existing position
    /// (`None` anchors at the document start)
    Insert {
        /// Position the character is anchored after
        after: Option<OpId>,
        /// The inserted character
        ch: char,
    },
    /// Tombstone an existing position
    Delete {
        /// Position to delete
        target: OpId,
    },
}

/// An atomic CRDT mutation, tagged with identity and causal dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    /// Unique identity of this op
    pub id: OpId,
    /// Document this op belongs to
    pub document: DocumentId,
    /// Ops that must be visible before this one can be applied
    pub deps: Vec<OpId>,
    /// The mutation itself
    pub action: OpAction,
}

impl Op {
    /// Build an insert op. Dependencies are the anchor (if any) and the
    /// producing replica's previous op (if any).
    pub fn insert(
        id: OpId,
        document: DocumentId,
        after: Option<OpId>,
        ch: char,
        prev: Option<OpId>,
    ) -> Self {
        let mut deps = Vec::with_capacity(2);
        if let Some(a) = after {
            deps.push(a);
        }
        if let Some(p) = prev {
            if !deps.contains(&p) {
                deps.push(p);
            }
        }
        Self {
            id,
            document,
            deps,
            action: OpAction::Insert { after, ch },
        }
    }

    /// Build a delete op. Dependencies are the target and the producing
    /// replica's previous op (if any).
    pub fn delete(id: OpId, document: DocumentId, target: OpId, prev: Option<OpId>) -> Self {
        let mut deps = vec![target];
        if let Some(p) = prev {
            if !deps.contains(&p) {
                deps.push(p);
            }
        }
        Self {
            id,
            document,
            deps,
            action: OpAction::Delete { target },
        }
    }

    /// Structural validation, independent of any container state.
    ///
    /// Returns the reason the op is malformed, or `None` if it is
    /// well-formed. Dependency availability is a separate, stateful check.
    pub fn malformed_reason(&self, expected_document: &DocumentId) -> Option<String> {
        if self.id.seq == 0 {
            return Some("sequence must be >= 1".to_string());
        }
        if &self.document != expected_document {
            return Some(format!(
                "op for document {} routed to {}",
                self.document, expected_document
            ));
        }
        if self.deps.contains(&self.id) {
            return Some("op depends on itself".to_string());
        }
        match &self.action {
            OpAction::Insert { after: Some(a), .. } if *a == self.id => {
                Some("insert anchored on itself".to_string())
            }
            OpAction::Insert { after: Some(a), .. } if !self.deps.contains(a) => {
                Some("anchor missing from dependencies".to_string())
            }
            OpAction::Delete { target } if *target == self.id => {
                Some("delete targets itself".to_string())
            }
            OpAction::Delete { target } if !self.deps.contains(target) => {
                Some("delete target missing from dependencies".to_string())
            }
            _ => None,
        }
    }
}

/// Causal frontier: the highest sequence observed per replica.
///
/// Because ops from one replica are applied in sequence order, "have I seen
/// `(replica, seq)`" reduces to a per-replica max. Empty entries are never
/// stored, so two frontiers compare equal iff they describe the same
/// history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<ReplicaId, u64>);

impl VersionVector {
    /// Create an empty frontier
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence seen from a replica (0 if never seen)
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Whether the given op is already covered by this frontier
    pub fn contains(&self, id: &OpId) -> bool {
        id.seq <= self.get(&id.replica)
    }

    /// Record an applied op
    pub fn record(&mut self, id: &OpId) {
        let entry = self.0.entry(id.replica).or_insert(0);
        if id.seq > *entry {
            *entry = id.seq;
        }
    }

    /// Whether this frontier has seen everything `other` has
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .0
            .iter()
            .all(|(replica, seq)| self.get(replica) >= *seq)
    }

    /// Whether no ops have been observed at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(replica, max_seq)` entries
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }
}
