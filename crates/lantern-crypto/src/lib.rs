//! # Lantern Crypto
//!
//! Cryptographic primitives for the Lantern mesh.
//!
//! This crate provides:
//! - Node identity (Ed25519 signing keypair + X25519 agreement keypair)
//! - Pairwise session derivation from a static key agreement
//! - `XChaCha20-Poly1305` AEAD encryption for direct and group messages
//! - Group key generation and per-member sealing
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash / KDF | BLAKE3 `derive_key` | 128-bit |
//! | Signatures | Ed25519 | 128-bit |
//!
//! The extended 192-bit AEAD nonce is drawn randomly per message, which makes
//! nonce reuse under a single key statistically impossible without any
//! counter state shared between the two directions of a session.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod group;
pub mod identity;
pub mod session;

pub use aead::{AeadKey, SealedMessage, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::CryptoError;
pub use group::{GroupId, GroupKey, GroupKeyring};
pub use identity::{Identity, NodeId, Signature};
pub use session::{CryptoSession, SessionStore};

/// X25519 agreement public key size
pub const AGREEMENT_KEY_SIZE: usize = 32;

/// Ed25519 signing public key size
pub const SIGNING_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Node identifier size (128-bit)
pub const NODE_ID_SIZE: usize = 16;
