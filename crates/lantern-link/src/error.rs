//! Error types for the link layer.

use thiserror::Error;

/// Link-level errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The radio stack is not powered on in the required role
    #[error("radio unavailable")]
    RadioUnavailable,

    /// Send to a peer whose message channel is not bound
    #[error("peer not connected")]
    PeerNotConnected,

    /// An inbound link frame did not parse
    #[error("malformed link frame")]
    MalformedFrame,
}
