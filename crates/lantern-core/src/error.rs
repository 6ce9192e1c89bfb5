//! Error types for the mesh core.
//!
//! Transient errors (an unconnected next hop, no route on a first attempt)
//! are absorbed by the reliability layer; crypto failures terminate only
//! the envelope they occurred on; a too-small MTU is fatal at start-up.
//! Malformed inbound frames are logged and dropped without tearing the
//! link down.

use crate::envelope::MessageId;
use lantern_crypto::{CryptoError, NodeId};
use lantern_link::LinkError;
use thiserror::Error;

/// Top-level mesh errors.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Chunking or reassembly error
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Link-layer error
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Destination unreachable after route discovery timed out
    #[error("no route to {0}")]
    NoRoute(NodeId),

    /// Retries exhausted without an acknowledgement
    #[error("delivery timed out for message {0}")]
    DeliveryTimeout(MessageId),

    /// Malformed wire record
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A group operation referenced a group this node is not a member of
    #[error("unknown group")]
    UnknownGroup,

    /// The node's event loop has shut down
    #[error("node is shutting down")]
    ShuttingDown,
}

/// Chunk-level errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    /// The chunk header does not fit the transport unit
    #[error("chunk header does not fit mtu of {mtu} bytes")]
    MtuTooSmall {
        /// The offending transport unit
        mtu: usize,
    },

    /// The payload needs more chunks than the header can count
    #[error("payload needs {needed} chunks, limit is {limit}")]
    MessageTooLarge {
        /// Chunks the payload would need
        needed: usize,
        /// Maximum representable chunk count
        limit: usize,
    },

    /// Frame shorter than the fixed header
    #[error("chunk too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum parseable size
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// A chunk declared a zero total
    #[error("chunk declared a zero total")]
    ZeroTotal,

    /// A chunk's index is not below its declared total
    #[error("chunk index {index} out of range for total {total}")]
    IndexOutOfRange {
        /// The offending index
        index: u16,
        /// Declared chunk count
        total: u8,
    },

    /// A later chunk disagreed with the reassembly entry's total
    #[error("conflicting total for message {message_id}: had {expected}, got {actual}")]
    ReassemblyMismatch {
        /// The message being reassembled
        message_id: MessageId,
        /// Total recorded on first chunk
        expected: u8,
        /// Total the discarded chunk claimed
        actual: u8,
    },
}
