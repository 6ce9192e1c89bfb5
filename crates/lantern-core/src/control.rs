//! Mesh control messages.
//!
//! All control traffic shares a uniform wrapper: a `type` tag plus the
//! record for that type. Route discovery (RREQ/RREP/RERR) and the presence
//! beacon (ANNOUNCE) are the routing plane; delivery acknowledgements,
//! read receipts, and group key grants are end-to-end records that ride
//! the same relay machinery as data.
//!
//! Discovery and announce records piggyback the sender's public keys so
//! that nodes beyond direct radio range can derive pairwise sessions: the
//! RREQ flood spreads the origin's keys toward the destination, and the
//! RREP carries the destination's keys back along the reverse path.

use crate::envelope::{b64_arr, MessageId, SealedRecord};
use lantern_crypto::{GroupId, NodeId};
use serde::{Deserialize, Serialize};

/// Route request, flooded TTL-bounded toward the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Discovery round identifier, unique at the origin
    pub request_id: MessageId,
    /// The node looking for a route
    pub origin: NodeId,
    /// The origin's display name
    pub origin_name: String,
    /// The node being looked for
    pub destination: NodeId,
    /// Hops traversed so far
    pub hop_count: u8,
    /// Nodes traversed, origin first; forwarders append themselves
    pub hop_path: Vec<NodeId>,
    /// Hop budget for the flood
    pub ttl: u8,
    /// The origin's X25519 agreement public key
    #[serde(with = "b64_arr")]
    pub origin_agreement_key: [u8; 32],
    /// The origin's Ed25519 signing public key
    #[serde(with = "b64_arr")]
    pub origin_signing_key: [u8; 32],
}

/// Route reply, unicast hop by hop back along the accumulated path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteReply {
    /// The discovery round being answered
    pub request_id: MessageId,
    /// The node that asked (the reply's final recipient)
    pub origin: NodeId,
    /// The node that answered
    pub destination: NodeId,
    /// Length of the full path in hops
    pub hop_count: u8,
    /// Full forward path, origin first, destination last
    pub hop_path: Vec<NodeId>,
    /// The destination's X25519 agreement public key
    #[serde(with = "b64_arr")]
    pub dest_agreement_key: [u8; 32],
    /// The destination's Ed25519 signing public key
    #[serde(with = "b64_arr")]
    pub dest_signing_key: [u8; 32],
}

/// Route error, emitted when a next hop disconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteFailure {
    /// The peer that became unreachable
    pub unreachable: NodeId,
    /// Destinations whose routes ran through it
    pub destinations: Vec<NodeId>,
}

/// Presence beacon, rebroadcast within a small hop limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    /// Beacon identifier for duplicate suppression
    pub announce_id: MessageId,
    /// The announcing node
    pub origin: NodeId,
    /// The announcing node's display name
    pub origin_name: String,
    /// Hops traversed so far
    pub hop_count: u8,
    /// The origin's X25519 agreement public key
    #[serde(with = "b64_arr")]
    pub agreement_key: [u8; 32],
    /// The origin's Ed25519 signing public key
    #[serde(with = "b64_arr")]
    pub signing_key: [u8; 32],
}

/// End-to-end delivery acknowledgement.
///
/// ACKs are never themselves acknowledged; a lost ACK is absorbed by the
/// sender's retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// Identifier of this ack for duplicate suppression
    pub ack_id: MessageId,
    /// The message being acknowledged
    pub message_id: MessageId,
    /// The acknowledging node (the message's destination)
    pub origin: NodeId,
    /// The node being notified (the message's origin)
    pub destination: NodeId,
    /// Hop budget
    pub ttl: u8,
}

/// Read receipt for a delivered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Identifier of this receipt for duplicate suppression
    pub receipt_id: MessageId,
    /// The message that was read
    pub message_id: MessageId,
    /// The reading node
    pub origin: NodeId,
    /// The node being notified
    pub destination: NodeId,
    /// Hop budget
    pub ttl: u8,
}

/// Group key grant: the group key sealed to one member under the pairwise
/// session key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupKeyGrant {
    /// Identifier of this grant for duplicate suppression
    pub grant_id: MessageId,
    /// The group being joined
    pub group_id: GroupId,
    /// The group's display name
    pub group_name: String,
    /// The distributing node (the group's creator)
    pub origin: NodeId,
    /// The distributing node's display name
    pub origin_name: String,
    /// The member receiving the key
    pub destination: NodeId,
    /// Current membership, for the recipient's bookkeeping
    pub members: Vec<NodeId>,
    /// The group key sealed under the pairwise session key
    pub sealed_key: SealedRecord,
    /// Hop budget
    pub ttl: u8,
}

/// Uniform control wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    /// Route request
    Rreq(RouteRequest),
    /// Route reply
    Rrep(RouteReply),
    /// Route error
    Rerr(RouteFailure),
    /// Presence beacon
    Announce(Announce),
    /// Delivery acknowledgement
    Ack(DeliveryAck),
    /// Read receipt
    Read(ReadReceipt),
    /// Group key distribution
    Gkd(GroupKeyGrant),
}

impl Control {
    /// Short name for logging.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Rreq(_) => "rreq",
            Self::Rrep(_) => "rrep",
            Self::Rerr(_) => "rerr",
            Self::Announce(_) => "announce",
            Self::Ack(_) => "ack",
            Self::Read(_) => "read",
            Self::Gkd(_) => "gkd",
        }
    }

    /// Duplicate-suppression key for records that flood.
    ///
    /// RREP and RERR travel point to point and are not deduplicated.
    #[must_use]
    pub fn flood_key(&self) -> Option<(MessageId, NodeId)> {
        match self {
            Self::Rreq(r) => Some((r.request_id, r.origin)),
            Self::Announce(a) => Some((a.announce_id, a.origin)),
            Self::Ack(a) => Some((a.ack_id, a.origin)),
            Self::Read(r) => Some((r.receipt_id, r.origin)),
            Self::Gkd(g) => Some((g.grant_id, g.origin)),
            Self::Rrep(_) | Self::Rerr(_) => None,
        }
    }

    /// Final recipient of an end-to-end addressed record.
    #[must_use]
    pub fn addressed_to(&self) -> Option<NodeId> {
        match self {
            Self::Ack(a) => Some(a.destination),
            Self::Read(r) => Some(r.destination),
            Self::Gkd(g) => Some(g.destination),
            Self::Rreq(_) | Self::Rrep(_) | Self::Rerr(_) | Self::Announce(_) => None,
        }
    }

    /// Decrement the hop budget of an addressed record.
    ///
    /// Returns `false` if the record has no budget left and must not be
    /// forwarded.
    pub fn decrement_ttl(&mut self) -> bool {
        let ttl = match self {
            Self::Ack(a) => &mut a.ttl,
            Self::Read(r) => &mut r.ttl,
            Self::Gkd(g) => &mut g.ttl,
            Self::Rreq(_) | Self::Rrep(_) | Self::Rerr(_) | Self::Announce(_) => return false,
        };
        if *ttl <= 1 {
            return false;
        }
        *ttl -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Packet;

    fn ack() -> DeliveryAck {
        DeliveryAck {
            ack_id: MessageId::random(),
            message_id: MessageId::random(),
            origin: NodeId::from_bytes([1u8; 16]),
            destination: NodeId::from_bytes([2u8; 16]),
            ttl: 3,
        }
    }

    #[test]
    fn test_control_packet_roundtrip() {
        let rreq = Control::Rreq(RouteRequest {
            request_id: MessageId::random(),
            origin: NodeId::from_bytes([1u8; 16]),
            origin_name: "alice".to_owned(),
            destination: NodeId::from_bytes([2u8; 16]),
            hop_count: 0,
            hop_path: vec![NodeId::from_bytes([1u8; 16])],
            ttl: 3,
            origin_agreement_key: [5u8; 32],
            origin_signing_key: [6u8; 32],
        });
        let packet = Packet::Control(rreq);
        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_control_wrapper_carries_type_tag() {
        let bytes = Packet::Control(Control::Ack(ack())).encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kind"], "control");
        assert_eq!(json["type"], "ack");
    }

    #[test]
    fn test_addressed_records() {
        let control = Control::Ack(ack());
        assert_eq!(control.addressed_to(), Some(NodeId::from_bytes([2u8; 16])));
        assert!(control.flood_key().is_some());

        let rerr = Control::Rerr(RouteFailure {
            unreachable: NodeId::from_bytes([9u8; 16]),
            destinations: vec![],
        });
        assert_eq!(rerr.addressed_to(), None);
        assert_eq!(rerr.flood_key(), None);
    }

    #[test]
    fn test_ttl_decrement_stops_at_one() {
        let mut control = Control::Ack(DeliveryAck { ttl: 2, ..ack() });
        assert!(control.decrement_ttl());
        assert!(!control.decrement_ttl());
    }
}
