//! Node identity and stable node identifiers.
//!
//! A Lantern node owns two long-term keypairs:
//! - **Ed25519** for signing; the 128-bit [`NodeId`] is derived from the
//!   signing public key with BLAKE3, so the identifier is stable for as long
//!   as the key material persists.
//! - **X25519** for static key agreement; pairwise session keys are derived
//!   from the shared secret (see [`crate::session`]).
//!
//! Key persistence is the caller's concern: the seeds returned by
//! [`Identity::to_seeds`] round-trip through [`Identity::from_seeds`], which
//! is what an external key store uses to restore the identity across
//! restarts.

use crate::error::CryptoError;
use ed25519_dalek::{Signer, Verifier};
use rand_core::{CryptoRng, RngCore};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// KDF context for deriving a node identifier from the signing public key.
const NODE_ID_CONTEXT: &str = "lantern-node-id v1";

/// 128-bit opaque node identifier, stable for the lifetime of the
/// installation.
///
/// Derived from the Ed25519 signing public key, so two nodes can only
/// collide by colliding BLAKE3 outputs. Also used as the address space for
/// group destinations (a `DestinationID` may denote a group).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Construct from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive the identifier for a signing public key.
    #[must_use]
    pub fn for_signing_key(signing_public: &[u8; 32]) -> Self {
        let digest = blake3::derive_key(NODE_ID_CONTEXT, signing_public);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Identifier bytes by value.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..4]))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(D::Error::custom)?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| D::Error::custom("node id must be 16 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Ed25519 signature (64 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Construct from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..4]))
    }
}

/// Long-term identity of the local node.
///
/// Holds both keypairs and the derived [`NodeId`]. The secret halves are
/// zeroized on drop by the underlying dalek types.
pub struct Identity {
    signing: ed25519_dalek::SigningKey,
    agreement: x25519_dalek::StaticSecret,
    node_id: NodeId,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing = ed25519_dalek::SigningKey::generate(rng);
        let agreement = x25519_dalek::StaticSecret::random_from_rng(&mut *rng);
        let node_id = NodeId::for_signing_key(&signing.verifying_key().to_bytes());
        Self {
            signing,
            agreement,
            node_id,
        }
    }

    /// Restore an identity from persisted key seeds.
    #[must_use]
    pub fn from_seeds(signing_seed: [u8; 32], agreement_seed: [u8; 32]) -> Self {
        let signing = ed25519_dalek::SigningKey::from_bytes(&signing_seed);
        let agreement = x25519_dalek::StaticSecret::from(agreement_seed);
        let node_id = NodeId::for_signing_key(&signing.verifying_key().to_bytes());
        Self {
            signing,
            agreement,
            node_id,
        }
    }

    /// Export both key seeds for the external key store.
    ///
    /// # Security
    ///
    /// The returned bytes contain raw private key material.
    #[must_use]
    pub fn to_seeds(&self) -> ([u8; 32], [u8; 32]) {
        (self.signing.to_bytes(), self.agreement.to_bytes())
    }

    /// The stable node identifier.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The X25519 agreement public key.
    #[must_use]
    pub fn agreement_public_key(&self) -> [u8; 32] {
        x25519_dalek::PublicKey::from(&self.agreement).to_bytes()
    }

    /// The Ed25519 signing public key.
    #[must_use]
    pub fn signing_public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message with the long-term signing key.
    ///
    /// Ed25519 signing is deterministic: the same message always produces
    /// the same signature under the same key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    /// Verify a signature against a peer's signing public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the public key does not decode
    /// and [`CryptoError::InvalidSignature`] if verification fails.
    pub fn verify(
        peer_signing_public: &[u8; 32],
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(peer_signing_public)
            .map_err(|_| CryptoError::InvalidKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Perform the static Diffie-Hellman agreement with a peer's public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the peer key is a low-order
    /// point (the shared secret would be all zeros).
    pub fn agree(&self, peer_agreement_public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let peer = x25519_dalek::PublicKey::from(*peer_agreement_public);
        let shared = self.agreement.diffie_hellman(&peer);
        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::InvalidKey);
        }
        Ok(*shared.as_bytes())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_node_id_stable_across_restore() {
        let identity = Identity::generate(&mut OsRng);
        let (signing_seed, agreement_seed) = identity.to_seeds();
        let restored = Identity::from_seeds(signing_seed, agreement_seed);

        assert_eq!(identity.node_id(), restored.node_id());
        assert_eq!(
            identity.agreement_public_key(),
            restored.agreement_public_key()
        );
        assert_eq!(identity.signing_public_key(), restored.signing_public_key());
    }

    #[test]
    fn test_identities_unique() {
        let a = Identity::generate(&mut OsRng);
        let b = Identity::generate(&mut OsRng);
        assert_ne!(a.node_id(), b.node_id());
    }

    #[test]
    fn test_agreement_symmetric() {
        let a = Identity::generate(&mut OsRng);
        let b = Identity::generate(&mut OsRng);

        let ab = a.agree(&b.agreement_public_key()).unwrap();
        let ba = b.agree(&a.agreement_public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_agreement_rejects_low_order_point() {
        let a = Identity::generate(&mut OsRng);
        assert_eq!(a.agree(&[0u8; 32]), Err(CryptoError::InvalidKey));
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate(&mut OsRng);
        let message = b"presence beacon";
        let signature = identity.sign(message);

        assert!(Identity::verify(&identity.signing_public_key(), message, &signature).is_ok());
        assert_eq!(
            Identity::verify(&identity.signing_public_key(), b"tampered", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_node_id_serde_roundtrip() {
        let id = NodeId::from_bytes([7u8; 16]);
        let json = serde_json::to_string(&id).unwrap();
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_node_id_rejects_wrong_length() {
        let short: Result<NodeId, _> = serde_json::from_str("\"00ff\"");
        assert!(short.is_err());
    }
}
