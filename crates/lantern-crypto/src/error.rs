//! Error types for Lantern cryptography.

use thiserror::Error;

/// Cryptographic errors.
///
/// Failures here terminate only the envelope being processed; nothing is
/// emitted on the wire in response, so session state never leaks to peers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// No derived session exists for the peer
    #[error("no session established for peer")]
    NoSession,

    /// Peer key material is malformed or a low-order point
    #[error("invalid peer key material")]
    InvalidKey,

    /// AEAD tag verification failed
    #[error("authentication failed")]
    AuthFailed,

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed
    #[error("decryption failed")]
    DecryptionFailed,

    /// No key is installed for the group
    #[error("no key installed for group")]
    NoGroupKey,

    /// Signature verification failed
    #[error("invalid signature")]
    InvalidSignature,
}
