//! Replicated text engine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               DocumentStore                 │
//! │  per-document: clock, frontier, op buffer   │
//! │        ┌───────────────────────────┐        │
//! │        │         TextCrdt          │        │
//! │        │  tree of character nodes  │        │
//! │        └───────────────────────────┘        │
//! └─────────────────────────────────────────────┘
//!          ▲ EditOp (local)     ▲ Op (remote)
//! ```
//!
//! The store turns local edit scripts into causally-tagged [`Op`]s and
//! merges remote ops through the deterministic convergence rule in
//! [`text`]. [`Snapshot`] is the full-state export used for first sync
//! and local persistence.

pub mod op;
pub mod snapshot;
pub mod store;
pub mod text;

pub use op::{Op, OpAction, OpId, VersionVector};
pub use snapshot::Snapshot;
pub use store::{DocumentStore, EditOp, MergeResult};
pub use text::TextCrdt;
