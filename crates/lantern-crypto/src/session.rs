//! Pairwise session keying.
//!
//! A session with a peer exists once that peer's X25519 agreement public key
//! has been obtained and validated. The symmetric key is derived once, from
//! the static-static Diffie-Hellman shared secret through BLAKE3 with a
//! fixed domain-separation context, and both directions of the pair use it
//! (random extended nonces keep that safe).
//!
//! Peer keys arrive from two places: the link layer reads them off a
//! directly connected peer's endpoints, and route-discovery control
//! messages carry them for peers beyond direct radio range.

use crate::aead::{AeadKey, SealedMessage};
use crate::error::CryptoError;
use crate::identity::{Identity, NodeId, Signature};
use rand_core::{CryptoRng, RngCore};
use std::collections::HashMap;
use std::sync::Arc;

/// KDF context for pairwise session keys.
const SESSION_KEY_CONTEXT: &str = "lantern-session-key v1";

/// Keying material held for one peer.
pub struct CryptoSession {
    agreement_public: [u8; 32],
    signing_public: Option<[u8; 32]>,
    key: AeadKey,
}

impl CryptoSession {
    /// The peer's agreement public key.
    #[must_use]
    pub fn agreement_public(&self) -> &[u8; 32] {
        &self.agreement_public
    }

    /// The peer's signing public key, if it has been exchanged.
    #[must_use]
    pub fn signing_public(&self) -> Option<&[u8; 32]> {
        self.signing_public.as_ref()
    }
}

/// Per-peer session store.
///
/// Owned by the application context; all mutation happens on the node's
/// event loop.
pub struct SessionStore {
    local: Arc<Identity>,
    sessions: HashMap<NodeId, CryptoSession>,
}

impl SessionStore {
    /// Create a store bound to the local identity.
    #[must_use]
    pub fn new(local: Arc<Identity>) -> Self {
        Self {
            local,
            sessions: HashMap::new(),
        }
    }

    /// Install a peer's agreement public key and derive the session key.
    ///
    /// Re-installing the same key is a no-op; a different key replaces the
    /// session (the peer reinstalled and rotated its identity keys).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] for anything that is not a valid
    /// 32-byte curve point with a contributory shared secret.
    pub fn store_peer_agreement_key(
        &mut self,
        peer: NodeId,
        key_bytes: &[u8],
    ) -> Result<(), CryptoError> {
        let agreement_public: [u8; 32] =
            key_bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;

        if let Some(session) = self.sessions.get(&peer) {
            if session.agreement_public == agreement_public {
                return Ok(());
            }
            tracing::debug!(peer = %peer, "peer agreement key changed, rederiving session");
        }

        let shared = self.local.agree(&agreement_public)?;
        let key = AeadKey::from_bytes(blake3::derive_key(SESSION_KEY_CONTEXT, &shared));
        let signing_public = self
            .sessions
            .remove(&peer)
            .and_then(|old| old.signing_public);

        self.sessions.insert(
            peer,
            CryptoSession {
                agreement_public,
                signing_public,
                key,
            },
        );
        tracing::debug!(peer = %peer, "session key derived");
        Ok(())
    }

    /// Install a peer's signing public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the bytes are not a valid
    /// Ed25519 point, and [`CryptoError::NoSession`] if no agreement key has
    /// been stored for the peer yet.
    pub fn store_peer_signing_key(
        &mut self,
        peer: NodeId,
        key_bytes: &[u8],
    ) -> Result<(), CryptoError> {
        let signing_public: [u8; 32] = key_bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        ed25519_dalek::VerifyingKey::from_bytes(&signing_public)
            .map_err(|_| CryptoError::InvalidKey)?;

        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(CryptoError::NoSession)?;
        session.signing_public = Some(signing_public);
        Ok(())
    }

    /// Whether a derived session key exists for the peer.
    #[must_use]
    pub fn has_session(&self, peer: &NodeId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Whether both the agreement and signing keys have been exchanged.
    #[must_use]
    pub fn key_exchange_complete(&self, peer: &NodeId) -> bool {
        self.sessions
            .get(peer)
            .is_some_and(|s| s.signing_public.is_some())
    }

    /// Access the session held for a peer.
    #[must_use]
    pub fn session(&self, peer: &NodeId) -> Option<&CryptoSession> {
        self.sessions.get(peer)
    }

    /// Encrypt a plaintext for a peer under the pairwise session key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoSession`] if no key is derived for the peer.
    pub fn encrypt_for<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        peer: &NodeId,
        plaintext: &[u8],
    ) -> Result<SealedMessage, CryptoError> {
        let session = self.sessions.get(peer).ok_or(CryptoError::NoSession)?;
        session.key.seal(rng, plaintext, b"")
    }

    /// Decrypt a sealed record received from a peer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoSession`] if no key is derived and
    /// [`CryptoError::AuthFailed`] if the tag does not verify.
    pub fn decrypt_from(
        &self,
        peer: &NodeId,
        sealed: &SealedMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let session = self.sessions.get(peer).ok_or(CryptoError::NoSession)?;
        session.key.open(sealed, b"")
    }

    /// Verify a signature made by a peer's long-term signing key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoSession`] if the peer's signing key is
    /// unknown and [`CryptoError::InvalidSignature`] on a bad signature.
    pub fn verify_from(
        &self,
        peer: &NodeId,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let signing_public = self
            .sessions
            .get(peer)
            .and_then(|s| s.signing_public)
            .ok_or(CryptoError::NoSession)?;
        Identity::verify(&signing_public, message, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn pair() -> (Arc<Identity>, Arc<Identity>) {
        (
            Arc::new(Identity::generate(&mut OsRng)),
            Arc::new(Identity::generate(&mut OsRng)),
        )
    }

    #[test]
    fn test_both_sides_derive_matching_sessions() {
        let (alice, bob) = pair();
        let mut alice_store = SessionStore::new(alice.clone());
        let mut bob_store = SessionStore::new(bob.clone());

        alice_store
            .store_peer_agreement_key(bob.node_id(), &bob.agreement_public_key())
            .unwrap();
        bob_store
            .store_peer_agreement_key(alice.node_id(), &alice.agreement_public_key())
            .unwrap();

        let sealed = alice_store
            .encrypt_for(&mut OsRng, &bob.node_id(), b"hi")
            .unwrap();
        let plain = bob_store.decrypt_from(&alice.node_id(), &sealed).unwrap();
        assert_eq!(plain, b"hi");
    }

    #[test]
    fn test_encrypt_without_session_fails() {
        let (alice, bob) = pair();
        let store = SessionStore::new(alice);
        assert_eq!(
            store
                .encrypt_for(&mut OsRng, &bob.node_id(), b"hi")
                .unwrap_err(),
            CryptoError::NoSession
        );
    }

    #[test]
    fn test_malformed_agreement_key_rejected() {
        let (alice, bob) = pair();
        let mut store = SessionStore::new(alice);
        assert_eq!(
            store.store_peer_agreement_key(bob.node_id(), &[1, 2, 3]),
            Err(CryptoError::InvalidKey)
        );
        assert_eq!(
            store.store_peer_agreement_key(bob.node_id(), &[0u8; 32]),
            Err(CryptoError::InvalidKey)
        );
        assert!(!store.has_session(&bob.node_id()));
    }

    #[test]
    fn test_signing_key_requires_agreement_first() {
        let (alice, bob) = pair();
        let mut store = SessionStore::new(alice);
        assert_eq!(
            store.store_peer_signing_key(bob.node_id(), &bob.signing_public_key()),
            Err(CryptoError::NoSession)
        );
    }

    #[test]
    fn test_key_exchange_complete_needs_both() {
        let (alice, bob) = pair();
        let mut store = SessionStore::new(alice);

        store
            .store_peer_agreement_key(bob.node_id(), &bob.agreement_public_key())
            .unwrap();
        assert!(store.has_session(&bob.node_id()));
        assert!(!store.key_exchange_complete(&bob.node_id()));

        store
            .store_peer_signing_key(bob.node_id(), &bob.signing_public_key())
            .unwrap();
        assert!(store.key_exchange_complete(&bob.node_id()));
    }

    #[test]
    fn test_reinstall_same_key_is_noop() {
        let (alice, bob) = pair();
        let mut store = SessionStore::new(alice);

        store
            .store_peer_agreement_key(bob.node_id(), &bob.agreement_public_key())
            .unwrap();
        store
            .store_peer_signing_key(bob.node_id(), &bob.signing_public_key())
            .unwrap();
        store
            .store_peer_agreement_key(bob.node_id(), &bob.agreement_public_key())
            .unwrap();

        // Signing key survives a repeated install of the same agreement key.
        assert!(store.key_exchange_complete(&bob.node_id()));
    }

    #[test]
    fn test_verify_from_peer() {
        let (alice, bob) = pair();
        let mut alice_store = SessionStore::new(alice);
        alice_store
            .store_peer_agreement_key(bob.node_id(), &bob.agreement_public_key())
            .unwrap();
        alice_store
            .store_peer_signing_key(bob.node_id(), &bob.signing_public_key())
            .unwrap();

        let signature = bob.sign(b"announce");
        assert!(alice_store
            .verify_from(&bob.node_id(), b"announce", &signature)
            .is_ok());
        assert_eq!(
            alice_store.verify_from(&bob.node_id(), b"other", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }
}
