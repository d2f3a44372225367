//! Relay wire format
//!
//! ## Frame Layout
//!
//! ```text
//! ┌──────────────┬───────────┬──────────────────────────┐
//! │ length (u32) │ magic (4) │ postcard body            │
//! │ little-endian│           │ (length covers magic+body)│
//! └──────────────┴───────────┴──────────────────────────┘
//! ```
//!
//! Three frame kinds share the connection, distinguished by magic:
//! - `QSDC` document frames: opaque encrypted envelope bytes, fragmented
//!   when they exceed [`MAX_FRAGMENT_PAYLOAD`]
//! - `QSEP` presence frames: opaque encrypted presence bytes, best-effort
//! - `QSCT` control frames: handshake, keepalive, subscriptions
//!
//! The relay routes on the unencrypted frame headers alone; bodies of
//! document and presence frames are ciphertext end to end.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::SyncError;
use crate::types::{DocumentId, ReplicaId};

/// Magic for document (envelope) frames
pub const MAGIC_DOCUMENT: [u8; 4] = *b"QSDC";
/// Magic for presence frames
pub const MAGIC_PRESENCE: [u8; 4] = *b"QSEP";
/// Magic for control frames
pub const MAGIC_CONTROL: [u8; 4] = *b"QSCT";

/// Hard cap on a single frame (length field), headers included
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Largest envelope payload carried in one document frame; bigger
/// payloads are fragmented
pub const MAX_FRAGMENT_PAYLOAD: usize = 16 * 1024;

/// Version of the control handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Control messages exchanged in plaintext with the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Control {
    /// Client greeting, first frame on every connection
    Hello {
        /// Connecting replica
        replica: ReplicaId,
        /// Wire protocol version the client speaks
        protocol_version: u32,
    },
    /// Relay accepted the greeting
    HelloAck,
    /// Relay rejected the client; the connection is terminal
    AuthReject(String),
    /// Keepalive probe
    Ping,
    /// Keepalive answer
    Pong,
    /// Start receiving frames for a document
    Subscribe {
        /// Document to subscribe to
        document_id: DocumentId,
    },
    /// Stop receiving frames for a document
    Unsubscribe {
        /// Document to unsubscribe from
        document_id: DocumentId,
    },
}

/// One frame on the relay connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Fragment of an encrypted document envelope
    Document {
        /// Document the envelope belongs to (routing key)
        document_id: DocumentId,
        /// Replica that sealed the envelope. Grouping key for
        /// reassembly so two peers fragmenting into the same room never
        /// interleave; the authenticated sender is inside the envelope.
        sender: ReplicaId,
        /// Zero-based index of this fragment
        fragment_index: u16,
        /// Total fragments in the envelope
        fragment_count: u16,
        /// Encrypted envelope bytes (this fragment's slice)
        payload: Vec<u8>,
    },
    /// Encrypted presence hint, never fragmented, droppable
    Presence {
        /// Document the hint belongs to
        document_id: DocumentId,
        /// Encrypted presence bytes
        payload: Vec<u8>,
    },
    /// Plaintext control message
    Control(Control),
}

impl Frame {
    fn magic(&self) -> [u8; 4] {
        match self {
            Frame::Document { .. } => MAGIC_DOCUMENT,
            Frame::Presence { .. } => MAGIC_PRESENCE,
            Frame::Control(_) => MAGIC_CONTROL,
        }
    }
}

// Postcard bodies per magic. The enum discriminant never goes on the
// wire; the magic is the discriminant.
#[derive(Serialize, Deserialize)]
struct DocumentBody {
    document_id: DocumentId,
    sender: ReplicaId,
    fragment_index: u16,
    fragment_count: u16,
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct PresenceBody {
    document_id: DocumentId,
    payload: Vec<u8>,
}

/// Length-prefixed codec for [`Frame`]s over a byte stream
#[derive(Debug, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    /// Create a codec
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SyncError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let magic = frame.magic();
        let body = match frame {
            Frame::Document {
                document_id,
                sender,
                fragment_index,
                fragment_count,
                payload,
            } => postcard::to_allocvec(&DocumentBody {
                document_id,
                sender,
                fragment_index,
                fragment_count,
                payload,
            }),
            Frame::Presence {
                document_id,
                payload,
            } => postcard::to_allocvec(&PresenceBody {
                document_id,
                payload,
            }),
            Frame::Control(control) => postcard::to_allocvec(&control),
        }
        .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let len = 4 + body.len();
        if len > MAX_FRAME_SIZE {
            return Err(SyncError::MalformedFrame(format!(
                "frame of {} bytes exceeds limit",
                len
            )));
        }
        dst.reserve(4 + len);
        dst.put_u32_le(len as u32);
        dst.put_slice(&magic);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < 4 || len > MAX_FRAME_SIZE {
            return Err(SyncError::MalformedFrame(format!(
                "frame length {} out of bounds",
                len
            )));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&src[..4]);
        src.advance(4);
        let body = src.split_to(len - 4);

        let frame = match magic {
            MAGIC_DOCUMENT => {
                let b: DocumentBody = postcard::from_bytes(&body)
                    .map_err(|e| SyncError::MalformedFrame(e.to_string()))?;
                Frame::Document {
                    document_id: b.document_id,
                    sender: b.sender,
                    fragment_index: b.fragment_index,
                    fragment_count: b.fragment_count,
                    payload: b.payload,
                }
            }
            MAGIC_PRESENCE => {
                let b: PresenceBody = postcard::from_bytes(&body)
                    .map_err(|e| SyncError::MalformedFrame(e.to_string()))?;
                Frame::Presence {
                    document_id: b.document_id,
                    payload: b.payload,
                }
            }
            MAGIC_CONTROL => {
                let control: Control = postcard::from_bytes(&body)
                    .map_err(|e| SyncError::MalformedFrame(e.to_string()))?;
                Frame::Control(control)
            }
            other => {
                return Err(SyncError::MalformedFrame(format!(
                    "unknown magic {:02x?}",
                    other
                )));
            }
        };
        Ok(Some(frame))
    }
}

/// Split an envelope into document frames of at most
/// [`MAX_FRAGMENT_PAYLOAD`] bytes each. An empty envelope still produces
/// one frame so the receiver sees it.
pub fn fragment(
    document_id: &DocumentId,
    sender: ReplicaId,
    envelope_bytes: &[u8],
) -> Result<Vec<Frame>, SyncError> {
    let chunks: Vec<&[u8]> = if envelope_bytes.is_empty() {
        vec![&[]]
    } else {
        envelope_bytes.chunks(MAX_FRAGMENT_PAYLOAD).collect()
    };
    let count = u16::try_from(chunks.len()).map_err(|_| {
        SyncError::MalformedFrame(format!(
            "envelope of {} bytes needs too many fragments",
            envelope_bytes.len()
        ))
    })?;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Frame::Document {
            document_id: document_id.clone(),
            sender,
            fragment_index: i as u16,
            fragment_count: count,
            payload: chunk.to_vec(),
        })
        .collect())
}

#[derive(Debug)]
struct Partial {
    count: u16,
    next: u16,
    data: Vec<u8>,
}

/// Reassembles fragmented envelopes, one in flight per document and
/// sender.
///
/// Fragments of one envelope arrive in order on the single relay
/// connection, but the relay interleaves frames from different peers, so
/// groups are keyed by `(document, sender)`. An out-of-sequence or
/// inconsistent fragment drops that group's partial envelope; the sync
/// protocol recovers by re-announcing.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<(DocumentId, ReplicaId), Partial>,
}

impl Reassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one document frame. Returns the complete envelope bytes once
    /// the last fragment arrives; `None` while incomplete or when a bad
    /// fragment group was dropped.
    pub fn push(
        &mut self,
        document_id: DocumentId,
        sender: ReplicaId,
        fragment_index: u16,
        fragment_count: u16,
        payload: Vec<u8>,
    ) -> Option<(DocumentId, Vec<u8>)> {
        let key = (document_id, sender);
        if fragment_count == 0 || fragment_index >= fragment_count {
            warn!(document_id = %key.0, %sender, fragment_index, fragment_count, "Dropping fragment with inconsistent header");
            self.partial.remove(&key);
            return None;
        }

        if fragment_index == 0 {
            if self.partial.remove(&key).is_some() {
                warn!(document_id = %key.0, %sender, "Discarding incomplete envelope superseded by a new one");
            }
            if fragment_count == 1 {
                return Some((key.0, payload));
            }
            self.partial.insert(
                key,
                Partial {
                    count: fragment_count,
                    next: 1,
                    data: payload,
                },
            );
            return None;
        }

        let Some(partial) = self.partial.get_mut(&key) else {
            warn!(document_id = %key.0, %sender, fragment_index, "Dropping fragment with no envelope in progress");
            return None;
        };
        if partial.count != fragment_count || partial.next != fragment_index {
            warn!(
                document_id = %key.0,
                %sender,
                fragment_index,
                fragment_count,
                expected_index = partial.next,
                expected_count = partial.count,
                "Dropping inconsistent fragment group"
            );
            self.partial.remove(&key);
            return None;
        }

        partial.data.extend_from_slice(&payload);
        partial.next += 1;
        if partial.next == partial.count {
            let partial = self.partial.remove(&key)?;
            return Some((key.0, partial.data));
        }
        None
    }

    /// Drop all in-flight partial envelopes (on disconnect)
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
