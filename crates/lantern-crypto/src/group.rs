//! Group conversation keys.
//!
//! A group key is a random 256-bit AEAD key owned by the group's creator
//! and distributed sealed-to-member under each pairwise session key. Every
//! member encrypts and decrypts group traffic with the same key; a node
//! that overhears the flood without the key only pays the duplicate
//! suppression bookkeeping.

use crate::aead::{AeadKey, SealedMessage, KEY_SIZE};
use crate::error::CryptoError;
use crate::identity::NodeId;
use rand_core::{CryptoRng, RngCore};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// 128-bit group conversation identifier.
///
/// Group identifiers share the destination address space with node
/// identifiers; [`GroupId::address`] converts for use in an envelope's
/// destination field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId([u8; 16]);

impl GroupId {
    /// Generate a fresh random group identifier.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Construct from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The group's destination address.
    #[must_use]
    pub fn address(&self) -> NodeId {
        NodeId::from_bytes(self.0)
    }

    /// Interpret a destination address as a group identifier.
    #[must_use]
    pub fn from_address(address: NodeId) -> Self {
        Self(address.to_bytes())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({}..)", hex::encode(&self.0[..4]))
    }
}

impl Serialize for GroupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(D::Error::custom)?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| D::Error::custom("group id must be 16 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Shared symmetric key for one group conversation.
#[derive(Clone)]
pub struct GroupKey(AeadKey);

impl GroupKey {
    /// Generate a cryptographically random group key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(AeadKey::generate(rng))
    }

    /// Wrap raw key bytes (as unsealed from a key-distribution grant).
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(AeadKey::from_bytes(bytes))
    }

    /// Raw key bytes, for sealing to a new member.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.0.as_bytes()
    }
}

/// The set of group keys this node holds.
#[derive(Default)]
pub struct GroupKeyring {
    keys: HashMap<GroupId, GroupKey>,
}

impl GroupKeyring {
    /// Create an empty keyring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a key for a group, replacing any previous one.
    pub fn install(&mut self, group: GroupId, key: GroupKey) {
        self.keys.insert(group, key);
    }

    /// Drop the key for a group.
    pub fn remove(&mut self, group: &GroupId) {
        self.keys.remove(group);
    }

    /// Whether this node holds the key for a group.
    #[must_use]
    pub fn contains(&self, group: &GroupId) -> bool {
        self.keys.contains_key(group)
    }

    /// The key for a group, if held.
    #[must_use]
    pub fn key(&self, group: &GroupId) -> Option<&GroupKey> {
        self.keys.get(group)
    }

    /// Groups this node belongs to.
    #[must_use]
    pub fn groups(&self) -> Vec<GroupId> {
        self.keys.keys().copied().collect()
    }

    /// Encrypt a plaintext with a group's shared key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoGroupKey`] if no key is installed.
    pub fn encrypt_with_group<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        group: &GroupId,
        plaintext: &[u8],
    ) -> Result<SealedMessage, CryptoError> {
        let key = self.keys.get(group).ok_or(CryptoError::NoGroupKey)?;
        key.0.seal(rng, plaintext, b"")
    }

    /// Decrypt a group record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoGroupKey`] if no key is installed and
    /// [`CryptoError::AuthFailed`] if the tag does not verify.
    pub fn decrypt_with_group(
        &self,
        group: &GroupId,
        sealed: &SealedMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.keys.get(group).ok_or(CryptoError::NoGroupKey)?;
        key.0.open(sealed, b"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_group_roundtrip_among_members() {
        let group = GroupId::generate(&mut OsRng);
        let key = GroupKey::generate(&mut OsRng);

        let mut creator = GroupKeyring::new();
        let mut member = GroupKeyring::new();
        creator.install(group, key.clone());
        member.install(group, GroupKey::from_bytes(*key.as_bytes()));

        let sealed = creator
            .encrypt_with_group(&mut OsRng, &group, b"meet at dusk")
            .unwrap();
        assert_eq!(
            member.decrypt_with_group(&group, &sealed).unwrap(),
            b"meet at dusk"
        );
    }

    #[test]
    fn test_non_member_cannot_decrypt() {
        let group = GroupId::generate(&mut OsRng);
        let mut creator = GroupKeyring::new();
        creator.install(group, GroupKey::generate(&mut OsRng));
        let sealed = creator
            .encrypt_with_group(&mut OsRng, &group, b"secret")
            .unwrap();

        let outsider = GroupKeyring::new();
        assert_eq!(
            outsider.decrypt_with_group(&group, &sealed),
            Err(CryptoError::NoGroupKey)
        );

        // Holding a different key for the same group is just as useless.
        let mut wrong = GroupKeyring::new();
        wrong.install(group, GroupKey::generate(&mut OsRng));
        assert_eq!(
            wrong.decrypt_with_group(&group, &sealed),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn test_group_address_roundtrip() {
        let group = GroupId::generate(&mut OsRng);
        assert_eq!(GroupId::from_address(group.address()), group);
    }

    #[test]
    fn test_remove_drops_membership() {
        let group = GroupId::generate(&mut OsRng);
        let mut keyring = GroupKeyring::new();
        keyring.install(group, GroupKey::generate(&mut OsRng));
        assert!(keyring.contains(&group));
        keyring.remove(&group);
        assert!(!keyring.contains(&group));
    }
}
