//! `XChaCha20-Poly1305` AEAD encryption.
//!
//! The wire format carries ciphertext, nonce, and authentication tag as
//! separate fields, so [`AeadKey::seal`] splits the tag off the combined
//! AEAD output and [`AeadKey::open`] rejoins it before decryption.
//!
//! Nonces are 192-bit and drawn randomly per message; under that nonce size
//! random generation cannot collide in practice, which is what makes a
//! single symmetric key safe for both directions of a session.

use crate::error::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::XChaCha20Poly1305;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AEAD key size (256-bit)
pub const KEY_SIZE: usize = 32;

/// AEAD nonce size (192-bit extended nonce)
pub const NONCE_SIZE: usize = 24;

/// AEAD authentication tag size (128-bit)
pub const TAG_SIZE: usize = 16;

/// An encrypted record: ciphertext with its nonce and detached tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Ciphertext bytes, same length as the plaintext
    pub ciphertext: Vec<u8>,
    /// Random nonce the record was sealed under
    pub nonce: [u8; NONCE_SIZE],
    /// Poly1305 authentication tag
    pub tag: [u8; TAG_SIZE],
}

/// A 256-bit symmetric AEAD key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher rejects the
    /// input (only possible for absurd plaintext lengths).
    pub fn seal<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<SealedMessage, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new((&self.0).into());
        let mut combined = cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        // The aead crate appends the tag to the ciphertext.
        let split = combined.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&combined[split..]);
        combined.truncate(split);

        Ok(SealedMessage {
            ciphertext: combined,
            nonce,
            tag,
        })
    }

    /// Decrypt a sealed record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthFailed`] if the tag does not verify; a
    /// flipped bit anywhere in ciphertext, nonce, or tag fails here.
    pub fn open(&self, sealed: &SealedMessage, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_SIZE);
        combined.extend_from_slice(&sealed.ciphertext);
        combined.extend_from_slice(&sealed.tag);

        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .decrypt(
                (&sealed.nonce).into(),
                Payload {
                    msg: &combined,
                    aad,
                },
            )
            .map_err(|_| CryptoError::AuthFailed)
    }
}
