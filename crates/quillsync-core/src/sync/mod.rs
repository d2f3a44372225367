//! Relay sync stack
//!
//! ## Layering
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ engine: sessions, announce loop, merge routing │
//! ├────────────────────────────────────────────────┤
//! │ protocol: Announce / DeltaRequest / Ops / Snap │  (envelope plaintext)
//! ├────────────────────────────────────────────────┤
//! │ envelope: encrypt-then-sign, replay counters   │
//! ├────────────────────────────────────────────────┤
//! │ transport: handshake, keepalive, reconnect     │
//! ├────────────────────────────────────────────────┤
//! │ wire: frames, fragmentation, codec             │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Everything above the wire layer treats the relay as untrusted: it can
//! drop, duplicate, and reorder, but never read or forge (signatures and
//! counters catch forgery and replay).

pub mod envelope;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod wire;

pub use envelope::{Envelope, EnvelopeService, ENVELOPE_VERSION};
pub use events::{PresenceHint, SyncEvent};
pub use protocol::SyncMessage;
pub use session::{Backoff, ConnectionEvent, ConnectionState, SessionEvent, SessionState};
pub use transport::{
    Connector, RelayStream, TcpConnector, TransportClient, TransportConfig, TransportEvent,
};
pub use wire::{Control, Frame, FrameCodec, Reassembler};
