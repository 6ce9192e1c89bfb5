//! Peer bookkeeping for the link layer.
//!
//! A [`Peer`] is one radio session with a neighbouring device. Two nodes
//! that discover each other simultaneously may briefly hold two sessions
//! (one per direction); the link layer keeps both alive and routes unicast
//! traffic through whichever promoted first. Peers only ever mutate on the
//! radio context.

use crate::radio::RadioHandle;
use lantern_crypto::NodeId;
use std::time::Instant;

/// Connection state of a radio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Seen by the scanner, no session yet
    Discovered,
    /// Session forming: channel binding or key exchange outstanding
    Connecting,
    /// Channel bound and both public keys in hand
    Connected,
    /// An established session dropped
    Disconnected,
    /// A connection attempt timed out or was rejected
    Failed,
}

/// Which side initiated the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// We discovered and dialled them; outbound goes via write-to-server
    Dialed,
    /// They subscribed to our endpoint; outbound goes via notify
    Subscriber,
}

/// One radio session with a neighbour.
#[derive(Debug)]
pub struct Peer {
    /// Stack-assigned handle for the remote device
    pub handle: RadioHandle,
    /// Which side initiated
    pub role: PeerRole,
    /// Session state
    pub state: PeerState,
    /// Learned node identifier, once identity exchange has run
    pub node_id: Option<NodeId>,
    /// Learned display name
    pub name: Option<String>,
    /// Signal-strength hint from discovery
    pub rssi: Option<i16>,
    /// Liveness timestamp
    pub last_seen: Instant,
    /// Negotiated maximum transport unit
    pub mtu: usize,
    /// Peer's X25519 agreement public key
    pub agreement_key: Option<[u8; 32]>,
    /// Peer's Ed25519 signing public key
    pub signing_key: Option<[u8; 32]>,
    /// Whether the message channel is bound for bidirectional I/O
    pub channel_bound: bool,
    /// Consecutive reconnect attempts since the last successful session
    pub reconnect_attempts: u32,
    /// Deadline for an in-flight connection attempt
    pub connect_deadline: Option<Instant>,
    /// When the next reconnect attempt is due
    pub reconnect_at: Option<Instant>,
}

impl Peer {
    /// A fresh session record in the `Connecting` state.
    #[must_use]
    pub fn connecting(
        handle: RadioHandle,
        role: PeerRole,
        rssi: Option<i16>,
        mtu: usize,
        deadline: Instant,
        now: Instant,
    ) -> Self {
        Self {
            handle,
            role,
            state: PeerState::Connecting,
            node_id: None,
            name: None,
            rssi,
            last_seen: now,
            mtu,
            agreement_key: None,
            signing_key: None,
            channel_bound: false,
            reconnect_attempts: 0,
            connect_deadline: Some(deadline),
            reconnect_at: None,
        }
    }

    /// Whether everything needed for promotion to `Connected` is in hand:
    /// the message channel is bound and the identity plus both public keys
    /// have been obtained.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.channel_bound
            && self.node_id.is_some()
            && self.agreement_key.is_some()
            && self.signing_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_requires_channel_and_keys() {
        let now = Instant::now();
        let mut peer = Peer::connecting(1, PeerRole::Dialed, Some(-40), 182, now, now);
        assert!(!peer.ready());

        peer.channel_bound = true;
        peer.node_id = Some(NodeId::from_bytes([1u8; 16]));
        peer.agreement_key = Some([2u8; 32]);
        assert!(!peer.ready());

        peer.signing_key = Some([3u8; 32]);
        assert!(peer.ready());
    }
}
