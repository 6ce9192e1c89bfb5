//! The end-to-end message envelope and its wire encoding.
//!
//! Everything that crosses a link is one [`Packet`]: either a data
//! [`Envelope`] or a [`Control`](crate::control::Control) record, wrapped in
//! a self-describing JSON encoding with opaque byte fields base64-encoded.
//! Relays never rewrite a MessageID; the TTL is the only field that changes
//! in flight.

use crate::control::Control;
use lantern_crypto::{GroupId, NodeId, SealedMessage};
use rand_core::{OsRng, RngCore};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 128-bit message identifier, unique at the origin and never rewritten by
/// relays.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
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
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({}..)", hex::encode(&self.0[..4]))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(D::Error::custom)?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| D::Error::custom("message id must be 16 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Base64 codec for variable-length byte fields.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(&text).map_err(D::Error::custom)
    }
}

/// Base64 codec for fixed-length byte fields.
pub(crate) mod b64_arr {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = STANDARD.decode(&text).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom("unexpected field length"))
    }
}

/// The end-to-end message unit.
///
/// A relay decrements `ttl` and forwards; an envelope whose TTL has reached
/// zero is never forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier, generated at the origin
    pub id: MessageId,
    /// The originating node
    pub origin: NodeId,
    /// The origin's display name
    pub origin_name: String,
    /// Destination node, or group address for group traffic
    pub destination: NodeId,
    /// Whether `payload` is an encrypted record
    pub is_encrypted: bool,
    /// Whether the destination denotes a group (flooded, not unicast)
    #[serde(default)]
    pub group: bool,
    /// Hop budget, decremented at each relay
    pub ttl: u8,
    /// Opaque payload bytes
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

/// Ciphertext triple shared by every encrypted wire record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRecord {
    /// Ciphertext bytes
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// AEAD nonce
    #[serde(with = "b64_arr")]
    pub nonce: [u8; 24],
    /// AEAD authentication tag
    #[serde(with = "b64_arr")]
    pub tag: [u8; 16],
}

impl From<SealedMessage> for SealedRecord {
    fn from(sealed: SealedMessage) -> Self {
        Self {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            tag: sealed.tag,
        }
    }
}

impl From<SealedRecord> for SealedMessage {
    fn from(record: SealedRecord) -> Self {
        Self {
            ciphertext: record.ciphertext,
            nonce: record.nonce,
            tag: record.tag,
        }
    }
}

/// Payload record of an encrypted direct message.
///
/// Carries the sender's agreement public key so a recipient that has never
/// paired with the sender can still derive the session and reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectCipherPayload {
    /// Ciphertext, nonce, and tag
    #[serde(flatten)]
    pub sealed: SealedRecord,
    /// The sender's X25519 agreement public key
    #[serde(with = "b64_arr")]
    pub sender_agreement_key: [u8; 32],
}

/// Payload record of an encrypted group message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCipherPayload {
    /// The group the record is addressed to
    pub group_id: GroupId,
    /// Ciphertext, nonce, and tag under the group key
    #[serde(flatten)]
    pub sealed: SealedRecord,
    /// The sending member
    pub sender: NodeId,
    /// The sending member's display name
    pub sender_name: String,
}

/// Top-level wire item: a data envelope or a control record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    /// End-to-end addressed message
    Data(Envelope),
    /// Mesh control traffic
    Control(Control),
}

impl Packet {
    /// Serialise for chunking.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails (it cannot for these
    /// types in practice).
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a reassembled byte blob.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed input; callers drop the
    /// blob and keep the link up.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
