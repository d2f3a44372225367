//! Connection and per-document session state machines
//!
//! Both machines are pure transition functions: the engine feeds them
//! events and reacts to the state they return. Keeping them free of I/O
//! makes every transition table-testable.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected ──ConnectRequested──▶ Connecting ──LinkEstablished──▶ Connected
//!      ▲                                 │                              │
//!      │                           NetworkError                  NetworkError
//!      │                                 ▼                              ▼
//!      └────DisconnectRequested──── Reconnecting{attempt} ◀─────────────┘
//!                                        │    ▲
//!                                 LinkEstablished │ NetworkError (attempt + 1)
//!                                        ▼    │
//!                                    Connected┘
//! ```
//!
//! `AuthRejected` moves any state to `Error`, which is terminal until the
//! shell re-authenticates and the engine rebuilds the connection state.

use std::time::Duration;

use rand::Rng;

/// State of the single relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and none wanted
    Disconnected,
    /// First connection attempt in flight
    Connecting,
    /// Link up, handshake complete
    Connected,
    /// Link lost; retrying with backoff
    Reconnecting {
        /// Failed attempts since the link was lost
        attempt: u32,
    },
    /// Relay rejected authentication; terminal until re-auth
    Error,
}

/// Events driving the connection machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The shell asked to go online
    ConnectRequested,
    /// Transport finished the handshake
    LinkEstablished,
    /// The link dropped or an attempt failed
    NetworkError,
    /// The shell asked to go offline
    DisconnectRequested,
    /// The relay rejected our credentials
    AuthRejected,
}

impl ConnectionState {
    /// Apply an event, returning the next state
    pub fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            // Fatal auth failure wins over everything
            (_, AuthRejected) => Error,
            // Error is absorbing; re-auth resets the machine externally
            (Error, _) => Error,
            (_, DisconnectRequested) => Disconnected,

            (Disconnected, ConnectRequested) => Connecting,
            (Connecting, LinkEstablished) => Connected,
            (Connecting, NetworkError) => Reconnecting { attempt: 1 },
            (Connected, NetworkError) => Reconnecting { attempt: 1 },
            (Reconnecting { .. }, LinkEstablished) => Connected,
            (Reconnecting { attempt }, NetworkError) => Reconnecting {
                attempt: attempt.saturating_add(1),
            },

            // Everything else is a no-op
            (state, _) => *state,
        }
    }

    /// Whether the engine should be holding a live link
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Sync state of one attached document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached, no exchange with any peer yet
    Unsynced,
    /// Deltas or snapshots in flight
    Syncing,
    /// Frontier matched a peer's at last exchange
    InSync,
    /// A malformed op was detected; waiting for an explicit resync
    ConflictPending,
}

/// Events driving a document session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// First exchange for the document started
    SyncStarted,
    /// Frontier exchange found both sides equal
    Converged,
    /// A frontier exchange found divergence
    DivergenceObserved,
    /// A peer sent a structurally invalid op
    MalformedOpDetected,
    /// The shell requested a full resync
    ResyncRequested,
}

impl SessionState {
    /// Apply an event, returning the next state
    pub fn apply(&self, event: SessionEvent) -> SessionState {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Syncing, MalformedOpDetected) | (InSync, MalformedOpDetected) => ConflictPending,
            // Only an explicit resync leaves ConflictPending
            (ConflictPending, ResyncRequested) => Syncing,
            (ConflictPending, _) => ConflictPending,

            (Unsynced, SyncStarted) => Syncing,
            (Unsynced, DivergenceObserved) => Syncing,
            (Syncing, Converged) => InSync,
            (InSync, DivergenceObserved) => Syncing,
            (_, ResyncRequested) => Syncing,

            (state, _) => *state,
        }
    }
}

/// Exponential backoff with jitter for reconnect attempts
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff schedule
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `base * 2^attempt` capped at `max`,
    /// with up to 50% random jitter added so a fleet of clients does not
    /// reconnect in lockstep.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = rand::rng().random_range(0..=exp.as_millis() as u64 / 2);
        (exp + Duration::from_millis(jitter_ms)).min(self.max)
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
