//! Staleness guard for debounced editor flushes
//!
//! Every remote merge that rewrites a document's text advances the
//! document's generation. A debounced editor snapshot captured under an
//! older generation was computed against text that no longer exists and
//! must not be applied.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic generation counter for one document
#[derive(Debug, Default)]
pub struct Generation(AtomicU64);

impl Generation {
    /// Create a generation counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation token
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidate all outstanding tokens, returning the new generation
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether a captured token is still the latest
    pub fn is_current(&self, token: u64) -> bool {
        self.current() == token
    }
}
