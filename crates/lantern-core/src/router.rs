//! On-demand mesh routing.
//!
//! Reactive AODV-style path discovery: a node with traffic for an unknown
//! destination floods a TTL-bounded route request; the destination answers
//! with a route reply that walks the accumulated hop path back, leaving a
//! next-hop cache entry at every node along the way. Route errors tear
//! affected entries down when a next hop disconnects.
//!
//! The router is a pure state machine owned by the application context: it
//! never performs I/O, it returns [`RouteOp`]s describing the sends and
//! deliveries the caller should execute. Connection state is passed in as
//! a snapshot ([`RouterView`]) taken from the link layer, which keeps the
//! invariant that a cached next hop is only ever used while that peer is
//! still connected.

use crate::chunk::ChunkFlags;
use crate::control::{Announce, Control, RouteFailure, RouteReply, RouteRequest};
use crate::envelope::{Envelope, MessageId, Packet};
use crate::seen::SeenCache;
use lantern_crypto::NodeId;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Router tunables.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Upper bound on envelope and RREQ hop counts
    pub max_ttl: u8,
    /// How long a discovery waits for a reply before failing with no-route
    pub discovery_timeout: Duration,
    /// Idle window after which an unused cache entry is discarded
    pub route_idle_timeout: Duration,
    /// Hop limit for presence beacons
    pub announce_hop_limit: u8,
    /// Seen-cache entry lifetime
    pub seen_expiry: Duration,
    /// Seen-cache size bound
    pub seen_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_ttl: 3,
            discovery_timeout: Duration::from_secs(7),
            route_idle_timeout: Duration::from_secs(600),
            announce_hop_limit: 2,
            seen_expiry: Duration::from_secs(300),
            seen_capacity: 4096,
        }
    }
}

/// Per-destination next-hop cache entry.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Destination the entry routes to
    pub destination: NodeId,
    /// Directly connected peer traffic is handed to
    pub next_hop: NodeId,
    /// Hops to the destination via this entry
    pub hop_count: u8,
    /// Full path, local node first (kept for diagnostics)
    pub path: Vec<NodeId>,
    /// Recency for idle garbage collection
    pub last_used: Instant,
}

/// Snapshot of the state the router needs from outside.
#[derive(Debug, Clone, Copy)]
pub struct RouterView<'a> {
    /// Currently connected peers
    pub connected: &'a HashSet<NodeId>,
    /// Group addresses this node holds keys for
    pub local_groups: &'a HashSet<NodeId>,
}

/// Work the caller executes after a router call.
#[derive(Debug, Clone)]
pub enum RouteOp {
    /// Chunk and send a packet to one connected peer
    SendToPeer {
        /// The next hop
        peer: NodeId,
        /// What to send
        packet: Packet,
        /// Chunk flag bits to carry
        flags: ChunkFlags,
    },
    /// Chunk and send a packet to every connected peer except `exclude`
    Broadcast {
        /// Peers to skip (typically where the flood came from)
        exclude: Vec<NodeId>,
        /// What to send
        packet: Packet,
        /// Chunk flag bits to carry
        flags: ChunkFlags,
    },
    /// Hand a terminating envelope to local dispatch
    Deliver {
        /// The envelope, TTL untouched
        envelope: Envelope,
        /// Chunk flags it arrived under
        flags: ChunkFlags,
        /// The neighbour that delivered the final copy
        via: NodeId,
    },
    /// A usable route to `destination` now exists
    RouteEstablished {
        /// The destination that became reachable
        destination: NodeId,
    },
    /// A discovery timed out with traffic still buffered
    DiscoveryFailed {
        /// The destination that stayed unreachable
        destination: NodeId,
        /// Buffered envelopes that were dropped
        undelivered: Vec<MessageId>,
    },
}

struct PendingDiscovery {
    request_id: MessageId,
    started: Instant,
    envelopes: Vec<(Envelope, ChunkFlags)>,
}

/// The mesh router.
pub struct Router {
    local: NodeId,
    local_name: String,
    local_agreement: [u8; 32],
    local_signing: [u8; 32],
    config: RouterConfig,
    routes: HashMap<NodeId, RouteEntry>,
    pending: HashMap<NodeId, PendingDiscovery>,
    seen: SeenCache,
}

impl Router {
    /// Create a router for the local node.
    #[must_use]
    pub fn new(
        local: NodeId,
        local_name: String,
        local_agreement: [u8; 32],
        local_signing: [u8; 32],
        config: RouterConfig,
    ) -> Self {
        let seen = SeenCache::new(config.seen_expiry, config.seen_capacity);
        Self {
            local,
            local_name,
            local_agreement,
            local_signing,
            config,
            routes: HashMap::new(),
            pending: HashMap::new(),
            seen,
        }
    }

    /// Route an envelope originated by the local node.
    ///
    /// Direct and cached paths transmit immediately; otherwise the envelope
    /// is buffered and a discovery round starts (at most one per
    /// destination at a time).
    pub fn send_envelope(
        &mut self,
        envelope: Envelope,
        flags: ChunkFlags,
        view: RouterView<'_>,
        now: Instant,
    ) -> Vec<RouteOp> {
        // Record our own message so flood echoes die on arrival.
        self.seen
            .check_and_insert(envelope.id, envelope.origin, now);

        let destination = envelope.destination;
        if view.connected.contains(&destination) {
            return vec![RouteOp::SendToPeer {
                peer: destination,
                packet: Packet::Data(envelope),
                flags,
            }];
        }
        if let Some(next_hop) = self.route_via(&destination, view, now) {
            return vec![RouteOp::SendToPeer {
                peer: next_hop,
                packet: Packet::Data(envelope),
                flags,
            }];
        }

        match self.pending.get_mut(&destination) {
            Some(pending) => {
                if !pending.envelopes.iter().any(|(e, _)| e.id == envelope.id) {
                    pending.envelopes.push((envelope, flags));
                }
                Vec::new()
            }
            None => {
                tracing::debug!(dest = %destination, "no route, starting discovery");
                let (request_id, op) = self.start_discovery(destination, now);
                self.pending.insert(
                    destination,
                    PendingDiscovery {
                        request_id,
                        started: now,
                        envelopes: vec![(envelope, flags)],
                    },
                );
                vec![op]
            }
        }
    }

    /// Flood a group envelope originated by the local node.
    pub fn flood_envelope(
        &mut self,
        envelope: Envelope,
        flags: ChunkFlags,
        now: Instant,
    ) -> Vec<RouteOp> {
        self.seen
            .check_and_insert(envelope.id, envelope.origin, now);
        vec![RouteOp::Broadcast {
            exclude: Vec::new(),
            packet: Packet::Data(envelope),
            flags,
        }]
    }

    /// Make sure a route to `destination` exists or is being discovered.
    ///
    /// Emits [`RouteOp::RouteEstablished`] immediately if one is already
    /// usable.
    pub fn ensure_discovery(
        &mut self,
        destination: NodeId,
        view: RouterView<'_>,
        now: Instant,
    ) -> Vec<RouteOp> {
        if view.connected.contains(&destination)
            || self.route_via(&destination, view, now).is_some()
        {
            return vec![RouteOp::RouteEstablished { destination }];
        }
        if self.pending.contains_key(&destination) {
            return Vec::new();
        }
        let (request_id, op) = self.start_discovery(destination, now);
        self.pending.insert(
            destination,
            PendingDiscovery {
                request_id,
                started: now,
                envelopes: Vec::new(),
            },
        );
        vec![op]
    }

    /// Process a reassembled envelope arriving from a neighbour.
    pub fn handle_envelope(
        &mut self,
        envelope: Envelope,
        flags: ChunkFlags,
        from: NodeId,
        view: RouterView<'_>,
        now: Instant,
    ) -> Vec<RouteOp> {
        if !self
            .seen
            .check_and_insert(envelope.id, envelope.origin, now)
        {
            tracing::trace!(id = %envelope.id, "duplicate envelope dropped");
            return Vec::new();
        }
        if envelope.origin == self.local {
            return Vec::new();
        }
        if envelope.destination == self.local {
            return vec![RouteOp::Deliver {
                envelope,
                flags,
                via: from,
            }];
        }

        if envelope.group {
            let mut ops = Vec::new();
            if view.local_groups.contains(&envelope.destination) {
                ops.push(RouteOp::Deliver {
                    envelope: envelope.clone(),
                    flags,
                    via: from,
                });
            }
            if envelope.ttl > 1 {
                let mut forwarded = envelope;
                forwarded.ttl -= 1;
                ops.push(RouteOp::Broadcast {
                    exclude: vec![from],
                    packet: Packet::Data(forwarded),
                    flags: flags.with_relayed(),
                });
            }
            return ops;
        }

        // Unicast transit.
        if envelope.ttl <= 1 {
            tracing::debug!(id = %envelope.id, "ttl exhausted, dropping");
            return Vec::new();
        }
        let mut forwarded = envelope;
        forwarded.ttl -= 1;

        let next_hop = if view.connected.contains(&forwarded.destination) {
            Some(forwarded.destination)
        } else {
            self.route_via(&forwarded.destination, view, now)
        };
        match next_hop {
            Some(peer) => vec![RouteOp::SendToPeer {
                peer,
                packet: Packet::Data(forwarded),
                flags: flags.with_relayed(),
            }],
            None => {
                // Conservative relay policy: drop and let the origin's
                // retries ride a fresh discovery.
                tracing::debug!(dest = %forwarded.destination, "no route for transit envelope");
                Vec::new()
            }
        }
    }

    /// Process a route request.
    pub fn handle_rreq(
        &mut self,
        rreq: RouteRequest,
        from: NodeId,
        now: Instant,
    ) -> Vec<RouteOp> {
        if !self.seen.check_and_insert(rreq.request_id, rreq.origin, now) {
            return Vec::new();
        }
        if rreq.origin == self.local || rreq.hop_path.contains(&self.local) {
            return Vec::new();
        }

        // The traversed path, reversed, is a provisional route back to the
        // origin through the peer that handed us the flood.
        let mut reverse_path = vec![self.local];
        reverse_path.extend(rreq.hop_path.iter().rev().copied());
        self.install_route(
            rreq.origin,
            from,
            rreq.hop_count.saturating_add(1),
            reverse_path,
            now,
        );

        if rreq.destination == self.local {
            let mut hop_path = rreq.hop_path.clone();
            hop_path.push(self.local);
            let hop_count = (hop_path.len() - 1) as u8;
            tracing::debug!(origin = %rreq.origin, hop_count, "answering route request");
            let reply = RouteReply {
                request_id: rreq.request_id,
                origin: rreq.origin,
                destination: self.local,
                hop_count,
                hop_path,
                dest_agreement_key: self.local_agreement,
                dest_signing_key: self.local_signing,
            };
            return vec![RouteOp::SendToPeer {
                peer: from,
                packet: Packet::Control(Control::Rrep(reply)),
                flags: ChunkFlags::new(),
            }];
        }

        if rreq.hop_count < rreq.ttl {
            let mut forwarded = rreq;
            forwarded.hop_count += 1;
            forwarded.hop_path.push(self.local);
            vec![RouteOp::Broadcast {
                exclude: vec![from],
                packet: Packet::Control(Control::Rreq(forwarded)),
                flags: ChunkFlags::new(),
            }]
        } else {
            tracing::trace!(request = %rreq.request_id, "rreq hop budget exhausted");
            Vec::new()
        }
    }

    /// Process a route reply travelling back along its hop path.
    pub fn handle_rrep(
        &mut self,
        rrep: RouteReply,
        _from: NodeId,
        view: RouterView<'_>,
        now: Instant,
    ) -> Vec<RouteOp> {
        let Some(index) = rrep.hop_path.iter().position(|n| *n == self.local) else {
            tracing::debug!(request = %rrep.request_id, "rrep for a path we are not on");
            return Vec::new();
        };

        // Forward route to the replier via the next node on the path.
        if index + 1 < rrep.hop_path.len() {
            let next_toward_dest = rrep.hop_path[index + 1];
            let hops = (rrep.hop_path.len() - 1 - index) as u8;
            let path = rrep.hop_path[index..].to_vec();
            self.install_route(rrep.destination, next_toward_dest, hops, path, now);
        }

        if rrep.origin == self.local {
            let mut ops = Vec::new();
            if let Some(pending) = self.pending.remove(&rrep.destination) {
                for (envelope, flags) in pending.envelopes {
                    if let Some(next_hop) = self.route_via(&rrep.destination, view, now) {
                        ops.push(RouteOp::SendToPeer {
                            peer: next_hop,
                            packet: Packet::Data(envelope),
                            flags,
                        });
                    } else {
                        tracing::warn!(
                            id = %envelope.id,
                            "reply arrived but next hop is gone, dropping buffered envelope"
                        );
                    }
                }
            }
            ops.push(RouteOp::RouteEstablished {
                destination: rrep.destination,
            });
            return ops;
        }

        // Relay the reply one hop toward its origin.
        if index == 0 {
            return Vec::new();
        }
        let previous = rrep.hop_path[index - 1];
        if !view.connected.contains(&previous) {
            tracing::debug!(peer = %previous, "return-path hop disconnected, dropping rrep");
            return Vec::new();
        }
        vec![RouteOp::SendToPeer {
            peer: previous,
            packet: Packet::Control(Control::Rrep(rrep)),
            flags: ChunkFlags::new(),
        }]
    }

    /// Process a route error from a neighbour.
    ///
    /// Invalidates cache entries that route the listed destinations through
    /// the reporting neighbour and propagates the error if anything was
    /// actually invalidated.
    pub fn handle_rerr(&mut self, rerr: RouteFailure, from: NodeId, now: Instant) -> Vec<RouteOp> {
        let _ = now;
        let mut invalidated = Vec::new();
        self.routes.retain(|dest, entry| {
            let affected = entry.next_hop == from
                && (*dest == rerr.unreachable || rerr.destinations.contains(dest));
            if affected {
                invalidated.push(*dest);
            }
            !affected
        });

        if invalidated.is_empty() {
            return Vec::new();
        }
        tracing::debug!(count = invalidated.len(), unreachable = %rerr.unreachable, "routes invalidated by rerr");
        vec![RouteOp::Broadcast {
            exclude: vec![from],
            packet: Packet::Control(Control::Rerr(RouteFailure {
                unreachable: rerr.unreachable,
                destinations: invalidated,
            })),
            flags: ChunkFlags::new(),
        }]
    }

    /// Process a presence beacon.
    pub fn handle_announce(
        &mut self,
        announce: Announce,
        from: NodeId,
        now: Instant,
    ) -> Vec<RouteOp> {
        if !self
            .seen
            .check_and_insert(announce.announce_id, announce.origin, now)
        {
            return Vec::new();
        }
        if announce.origin == self.local {
            return Vec::new();
        }

        self.install_route(
            announce.origin,
            from,
            announce.hop_count.saturating_add(1),
            vec![self.local, announce.origin],
            now,
        );

        if announce.hop_count + 1 < self.config.announce_hop_limit {
            let mut forwarded = announce;
            forwarded.hop_count += 1;
            vec![RouteOp::Broadcast {
                exclude: vec![from],
                packet: Packet::Control(Control::Announce(forwarded)),
                flags: ChunkFlags::new(),
            }]
        } else {
            Vec::new()
        }
    }

    /// Build the presence beacon the local node broadcasts on connect.
    #[must_use]
    pub fn make_announce(&mut self, now: Instant) -> RouteOp {
        let announce = Announce {
            announce_id: MessageId::random(),
            origin: self.local,
            origin_name: self.local_name.clone(),
            hop_count: 0,
            agreement_key: self.local_agreement,
            signing_key: self.local_signing,
        };
        self.seen
            .check_and_insert(announce.announce_id, announce.origin, now);
        RouteOp::Broadcast {
            exclude: Vec::new(),
            packet: Packet::Control(Control::Announce(announce)),
            flags: ChunkFlags::new(),
        }
    }

    /// Route an end-to-end addressed control record originated locally
    /// (ack, read receipt, group key grant).
    ///
    /// Unicast along a known route when one exists, flooded otherwise; the
    /// record's own TTL bounds the flood.
    pub fn send_addressed(
        &mut self,
        control: Control,
        view: RouterView<'_>,
        now: Instant,
    ) -> Vec<RouteOp> {
        let Some(destination) = control.addressed_to() else {
            return Vec::new();
        };
        if let Some((id, origin)) = control.flood_key() {
            self.seen.check_and_insert(id, origin, now);
        }

        if view.connected.contains(&destination) {
            return vec![RouteOp::SendToPeer {
                peer: destination,
                packet: Packet::Control(control),
                flags: ChunkFlags::new(),
            }];
        }
        if let Some(next_hop) = self.route_via(&destination, view, now) {
            return vec![RouteOp::SendToPeer {
                peer: next_hop,
                packet: Packet::Control(control),
                flags: ChunkFlags::new(),
            }];
        }
        vec![RouteOp::Broadcast {
            exclude: Vec::new(),
            packet: Packet::Control(control),
            flags: ChunkFlags::new(),
        }]
    }

    /// Accept an addressed control record terminating here, suppressing
    /// duplicates. Returns whether the caller should act on it.
    pub fn accept_addressed(&mut self, control: &Control, now: Instant) -> bool {
        match control.flood_key() {
            Some((id, origin)) => self.seen.check_and_insert(id, origin, now),
            None => true,
        }
    }

    /// Relay an addressed control record toward its destination.
    pub fn forward_addressed(
        &mut self,
        mut control: Control,
        from: NodeId,
        view: RouterView<'_>,
        now: Instant,
    ) -> Vec<RouteOp> {
        let Some(destination) = control.addressed_to() else {
            return Vec::new();
        };
        if let Some((id, origin)) = control.flood_key() {
            if !self.seen.check_and_insert(id, origin, now) {
                return Vec::new();
            }
        }
        if !control.decrement_ttl() {
            tracing::debug!(kind = control.type_name(), "control ttl exhausted");
            return Vec::new();
        }

        if view.connected.contains(&destination) {
            return vec![RouteOp::SendToPeer {
                peer: destination,
                packet: Packet::Control(control),
                flags: ChunkFlags::new(),
            }];
        }
        if let Some(next_hop) = self.route_via(&destination, view, now) {
            return vec![RouteOp::SendToPeer {
                peer: next_hop,
                packet: Packet::Control(control),
                flags: ChunkFlags::new(),
            }];
        }
        vec![RouteOp::Broadcast {
            exclude: vec![from],
            packet: Packet::Control(control),
            flags: ChunkFlags::new(),
        }]
    }

    /// Invalidate routes through a peer that disconnected and emit the
    /// route error for neighbours.
    pub fn peer_disconnected(&mut self, peer: NodeId, _now: Instant) -> Vec<RouteOp> {
        let mut affected = Vec::new();
        self.routes.retain(|dest, entry| {
            if entry.next_hop == peer {
                affected.push(*dest);
                false
            } else {
                true
            }
        });
        if affected.is_empty() {
            return Vec::new();
        }
        tracing::debug!(peer = %peer, count = affected.len(), "next hop lost, emitting rerr");
        vec![RouteOp::Broadcast {
            exclude: Vec::new(),
            packet: Packet::Control(Control::Rerr(RouteFailure {
                unreachable: peer,
                destinations: affected,
            })),
            flags: ChunkFlags::new(),
        }]
    }

    /// Fail discoveries that outlived the discovery timeout.
    pub fn sweep_discoveries(&mut self, now: Instant) -> Vec<RouteOp> {
        let expired: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.started) >= self.config.discovery_timeout)
            .map(|(dest, _)| *dest)
            .collect();

        expired
            .into_iter()
            .filter_map(|destination| {
                let pending = self.pending.remove(&destination)?;
                let undelivered: Vec<MessageId> =
                    pending.envelopes.iter().map(|(e, _)| e.id).collect();
                tracing::debug!(dest = %destination, dropped = undelivered.len(), "discovery timed out");
                Some(RouteOp::DiscoveryFailed {
                    destination,
                    undelivered,
                })
            })
            .collect()
    }

    /// Garbage-collect the seen cache and idle routes.
    pub fn gc(&mut self, now: Instant) {
        self.seen.gc(now);
        let idle = self.config.route_idle_timeout;
        self.routes
            .retain(|_, entry| now.duration_since(entry.last_used) < idle);
    }

    /// The cached route to a destination, if any.
    #[must_use]
    pub fn route_to(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.routes.get(destination)
    }

    /// Whether a discovery for a destination is in flight.
    #[must_use]
    pub fn has_pending_discovery(&self, destination: &NodeId) -> bool {
        self.pending.contains_key(destination)
    }

    fn start_discovery(&mut self, destination: NodeId, now: Instant) -> (MessageId, RouteOp) {
        let request_id = MessageId::random();
        self.seen.check_and_insert(request_id, self.local, now);
        let request = RouteRequest {
            request_id,
            origin: self.local,
            origin_name: self.local_name.clone(),
            destination,
            hop_count: 0,
            hop_path: vec![self.local],
            ttl: self.config.max_ttl,
            origin_agreement_key: self.local_agreement,
            origin_signing_key: self.local_signing,
        };
        (
            request_id,
            RouteOp::Broadcast {
                exclude: Vec::new(),
                packet: Packet::Control(Control::Rreq(request)),
                flags: ChunkFlags::new(),
            },
        )
    }

    /// Look up a usable next hop, invalidating the entry if its peer is
    /// gone and refreshing recency if it is used.
    fn route_via(
        &mut self,
        destination: &NodeId,
        view: RouterView<'_>,
        now: Instant,
    ) -> Option<NodeId> {
        let entry = self.routes.get_mut(destination)?;
        if !view.connected.contains(&entry.next_hop) {
            tracing::debug!(dest = %destination, "next hop gone, invalidating route");
            self.routes.remove(destination);
            return None;
        }
        entry.last_used = now;
        Some(entry.next_hop)
    }

    /// Install a route, preferring lower hop counts and keeping the first
    /// arrival on ties.
    fn install_route(
        &mut self,
        destination: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        path: Vec<NodeId>,
        now: Instant,
    ) {
        if destination == self.local {
            return;
        }
        if let Some(existing) = self.routes.get(&destination) {
            let better = hop_count < existing.hop_count;
            let refresh = hop_count == existing.hop_count && next_hop == existing.next_hop;
            if !better && !refresh {
                return;
            }
        }
        self.routes.insert(
            destination,
            RouteEntry {
                destination,
                next_hop,
                hop_count,
                path,
                last_used: now,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 16])
    }

    fn router_at(n: u8) -> Router {
        Router::new(
            node(n),
            format!("node-{n}"),
            [n; 32],
            [n.wrapping_add(1); 32],
            RouterConfig::default(),
        )
    }

    fn envelope_to(origin: u8, dest: u8) -> Envelope {
        Envelope {
            id: MessageId::random(),
            origin: node(origin),
            origin_name: format!("node-{origin}"),
            destination: node(dest),
            is_encrypted: false,
            group: false,
            ttl: 3,
            payload: b"payload".to_vec(),
        }
    }

    fn rreq_from(origin: u8, dest: u8) -> RouteRequest {
        RouteRequest {
            request_id: MessageId::random(),
            origin: node(origin),
            origin_name: format!("node-{origin}"),
            destination: node(dest),
            hop_count: 0,
            hop_path: vec![node(origin)],
            ttl: 3,
            origin_agreement_key: [origin; 32],
            origin_signing_key: [origin; 32],
        }
    }

    macro_rules! view {
        ($connected:expr, $groups:expr) => {
            RouterView {
                connected: $connected,
                local_groups: $groups,
            }
        };
    }

    #[test]
    fn test_send_direct_when_connected() {
        let mut router = router_at(1);
        let connected: HashSet<_> = [node(2)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let ops = router.send_envelope(
            envelope_to(1, 2),
            ChunkFlags::new(),
            view!(&connected, &groups),
            now,
        );
        assert!(matches!(
            ops.as_slice(),
            [RouteOp::SendToPeer { peer, .. }] if *peer == node(2)
        ));
    }

    #[test]
    fn test_send_without_route_starts_one_discovery() {
        let mut router = router_at(1);
        let connected: HashSet<_> = [node(9)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let first = router.send_envelope(
            envelope_to(1, 2),
            ChunkFlags::new(),
            view!(&connected, &groups),
            now,
        );
        assert!(matches!(
            first.as_slice(),
            [RouteOp::Broadcast { packet: Packet::Control(Control::Rreq(_)), .. }]
        ));
        assert!(router.has_pending_discovery(&node(2)));

        // A second send while discovery is pending buffers silently.
        let second = router.send_envelope(
            envelope_to(1, 2),
            ChunkFlags::new(),
            view!(&connected, &groups),
            now,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_rreq_at_destination_answers_with_rrep() {
        let mut router = router_at(3);
        let now = Instant::now();
        let mut rreq = rreq_from(1, 3);
        rreq.hop_count = 1;
        rreq.hop_path = vec![node(1), node(2)];

        let ops = router.handle_rreq(rreq, node(2), now);
        let [RouteOp::SendToPeer { peer, packet, .. }] = ops.as_slice() else {
            panic!("expected a unicast reply, got {ops:?}");
        };
        assert_eq!(*peer, node(2));
        let Packet::Control(Control::Rrep(reply)) = packet else {
            panic!("expected an rrep");
        };
        assert_eq!(reply.hop_path, vec![node(1), node(2), node(3)]);
        assert_eq!(reply.hop_count, 2);

        // The reverse path landed in the cache.
        let back = router.route_to(&node(1)).expect("reverse route");
        assert_eq!(back.next_hop, node(2));
        assert_eq!(back.hop_count, 2);
    }

    #[test]
    fn test_rreq_relay_appends_self_and_excludes_sender() {
        let mut router = router_at(2);
        let now = Instant::now();

        let ops = router.handle_rreq(rreq_from(1, 3), node(1), now);
        let [RouteOp::Broadcast {
            exclude, packet, ..
        }] = ops.as_slice()
        else {
            panic!("expected rebroadcast, got {ops:?}");
        };
        assert_eq!(exclude, &vec![node(1)]);
        let Packet::Control(Control::Rreq(forwarded)) = packet else {
            panic!("expected an rreq");
        };
        assert_eq!(forwarded.hop_count, 1);
        assert_eq!(forwarded.hop_path, vec![node(1), node(2)]);
    }

    #[test]
    fn test_rreq_duplicate_and_loop_dropped() {
        let mut router = router_at(2);
        let now = Instant::now();
        let rreq = rreq_from(1, 3);

        assert!(!router.handle_rreq(rreq.clone(), node(1), now).is_empty());
        assert!(router.handle_rreq(rreq.clone(), node(1), now).is_empty());

        // A different request whose path already contains us is a loop.
        let mut looped = rreq_from(1, 3);
        looped.hop_path = vec![node(1), node(2)];
        looped.hop_count = 1;
        assert!(router.handle_rreq(looped, node(1), now).is_empty());
    }

    #[test]
    fn test_rreq_ttl_exhausted_not_forwarded() {
        let mut router = router_at(2);
        let now = Instant::now();
        let mut rreq = rreq_from(1, 9);
        rreq.hop_count = 3; // == ttl

        assert!(router.handle_rreq(rreq, node(1), now).is_empty());
    }

    #[test]
    fn test_rrep_relay_forwards_toward_origin() {
        let mut router = router_at(2);
        let connected: HashSet<_> = [node(1), node(3)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let reply = RouteReply {
            request_id: MessageId::random(),
            origin: node(1),
            destination: node(3),
            hop_count: 2,
            hop_path: vec![node(1), node(2), node(3)],
            dest_agreement_key: [3u8; 32],
            dest_signing_key: [3u8; 32],
        };
        let ops = router.handle_rrep(reply, node(3), view!(&connected, &groups), now);
        assert!(matches!(
            ops.as_slice(),
            [RouteOp::SendToPeer { peer, packet: Packet::Control(Control::Rrep(_)), .. }]
                if *peer == node(1)
        ));

        // Forward route to the replier was recorded.
        let entry = router.route_to(&node(3)).expect("forward route");
        assert_eq!(entry.next_hop, node(3));
        assert_eq!(entry.hop_count, 1);
    }

    #[test]
    fn test_rrep_at_origin_releases_buffered_traffic() {
        let mut router = router_at(1);
        let connected: HashSet<_> = [node(2)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let envelope = envelope_to(1, 3);
        let buffered_id = envelope.id;
        let ops = router.send_envelope(
            envelope,
            ChunkFlags::new().with_requires_ack(),
            view!(&connected, &groups),
            now,
        );
        assert_eq!(ops.len(), 1); // the rreq

        let reply = RouteReply {
            request_id: MessageId::random(),
            origin: node(1),
            destination: node(3),
            hop_count: 2,
            hop_path: vec![node(1), node(2), node(3)],
            dest_agreement_key: [3u8; 32],
            dest_signing_key: [3u8; 32],
        };
        let ops = router.handle_rrep(reply, node(2), view!(&connected, &groups), now);

        let mut released = None;
        let mut established = false;
        for op in &ops {
            match op {
                RouteOp::SendToPeer { peer, packet: Packet::Data(e), flags } => {
                    assert_eq!(*peer, node(2));
                    assert!(flags.requires_ack());
                    released = Some(e.id);
                }
                RouteOp::RouteEstablished { destination } => {
                    assert_eq!(*destination, node(3));
                    established = true;
                }
                other => panic!("unexpected op {other:?}"),
            }
        }
        assert_eq!(released, Some(buffered_id));
        assert!(established);
        assert!(!router.has_pending_discovery(&node(3)));
    }

    #[test]
    fn test_rrep_tie_break_prefers_lower_hop_count() {
        let mut router = router_at(1);
        let connected: HashSet<_> = [node(2), node(5)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let long_reply = RouteReply {
            request_id: MessageId::random(),
            origin: node(1),
            destination: node(4),
            hop_count: 3,
            hop_path: vec![node(1), node(2), node(3), node(4)],
            dest_agreement_key: [4u8; 32],
            dest_signing_key: [4u8; 32],
        };
        router.handle_rrep(long_reply, node(2), view!(&connected, &groups), now);
        assert_eq!(router.route_to(&node(4)).unwrap().hop_count, 3);

        // An equal-length reply does not displace the first arrival.
        let equal_reply = RouteReply {
            request_id: MessageId::random(),
            origin: node(1),
            destination: node(4),
            hop_count: 3,
            hop_path: vec![node(1), node(6), node(7), node(4)],
            dest_agreement_key: [4u8; 32],
            dest_signing_key: [4u8; 32],
        };
        router.handle_rrep(equal_reply, node(6), view!(&connected, &groups), now);
        assert_eq!(router.route_to(&node(4)).unwrap().next_hop, node(2));

        // A shorter path wins.
        let short_reply = RouteReply {
            request_id: MessageId::random(),
            origin: node(1),
            destination: node(4),
            hop_count: 2,
            hop_path: vec![node(1), node(5), node(4)],
            dest_agreement_key: [4u8; 32],
            dest_signing_key: [4u8; 32],
        };
        router.handle_rrep(short_reply, node(5), view!(&connected, &groups), now);
        let entry = router.route_to(&node(4)).unwrap();
        assert_eq!(entry.next_hop, node(5));
        assert_eq!(entry.hop_count, 2);
    }

    #[test]
    fn test_discovery_timeout_fails_buffered_traffic() {
        let mut router = router_at(1);
        let connected = HashSet::new();
        let groups = HashSet::new();
        let start = Instant::now();

        let envelope = envelope_to(1, 3);
        let id = envelope.id;
        router.send_envelope(envelope, ChunkFlags::new(), view!(&connected, &groups), start);

        assert!(router.sweep_discoveries(start + Duration::from_secs(6)).is_empty());
        let ops = router.sweep_discoveries(start + Duration::from_secs(8));
        assert!(matches!(
            ops.as_slice(),
            [RouteOp::DiscoveryFailed { destination, undelivered }]
                if *destination == node(3) && undelivered == &vec![id]
        ));
        assert!(!router.has_pending_discovery(&node(3)));
    }

    #[test]
    fn test_transit_envelope_decrements_ttl_and_sets_relayed() {
        let mut router = router_at(2);
        let connected: HashSet<_> = [node(1), node(3)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let envelope = envelope_to(1, 3);
        let ops = router.handle_envelope(
            envelope,
            ChunkFlags::new().with_requires_ack(),
            node(1),
            view!(&connected, &groups),
            now,
        );
        let [RouteOp::SendToPeer { peer, packet: Packet::Data(forwarded), flags }] =
            ops.as_slice()
        else {
            panic!("expected forward, got {ops:?}");
        };
        assert_eq!(*peer, node(3));
        assert_eq!(forwarded.ttl, 2);
        assert!(flags.relayed());
        assert!(flags.requires_ack());
    }

    #[test]
    fn test_transit_envelope_with_spent_ttl_dropped() {
        let mut router = router_at(2);
        let connected: HashSet<_> = [node(1), node(3)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let mut envelope = envelope_to(1, 3);
        envelope.ttl = 1;
        let ops = router.handle_envelope(
            envelope,
            ChunkFlags::new(),
            node(1),
            view!(&connected, &groups),
            now,
        );
        assert!(ops.is_empty());
    }

    #[test]
    fn test_duplicate_envelope_not_processed_twice() {
        let mut router = router_at(2);
        let connected: HashSet<_> = [node(1), node(3)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let envelope = envelope_to(1, 2);
        let first = router.handle_envelope(
            envelope.clone(),
            ChunkFlags::new(),
            node(1),
            view!(&connected, &groups),
            now,
        );
        assert!(matches!(first.as_slice(), [RouteOp::Deliver { .. }]));

        let second = router.handle_envelope(
            envelope,
            ChunkFlags::new(),
            node(1),
            view!(&connected, &groups),
            now,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_group_flood_delivers_to_member_and_rebroadcasts() {
        let mut router = router_at(2);
        let connected: HashSet<_> = [node(1)].into();
        let group_address = node(0x77);
        let groups: HashSet<_> = [group_address].into();
        let now = Instant::now();

        let mut envelope = envelope_to(1, 0x77);
        envelope.group = true;
        let ops = router.handle_envelope(
            envelope,
            ChunkFlags::new(),
            node(1),
            view!(&connected, &groups),
            now,
        );
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], RouteOp::Deliver { .. }));
        assert!(matches!(
            &ops[1],
            RouteOp::Broadcast { exclude, packet: Packet::Data(e), .. }
                if exclude == &vec![node(1)] && e.ttl == 2
        ));

        // A non-member relays the flood without delivering.
        let mut outsider = router_at(4);
        let no_groups = HashSet::new();
        let mut envelope = envelope_to(1, 0x77);
        envelope.group = true;
        let ops = outsider.handle_envelope(
            envelope,
            ChunkFlags::new(),
            node(1),
            view!(&connected, &no_groups),
            now,
        );
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], RouteOp::Broadcast { .. }));
    }

    #[test]
    fn test_peer_disconnect_invalidates_and_emits_rerr() {
        let mut router = router_at(1);
        let connected: HashSet<_> = [node(2)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        let reply = RouteReply {
            request_id: MessageId::random(),
            origin: node(1),
            destination: node(3),
            hop_count: 2,
            hop_path: vec![node(1), node(2), node(3)],
            dest_agreement_key: [3u8; 32],
            dest_signing_key: [3u8; 32],
        };
        router.handle_rrep(reply, node(2), view!(&connected, &groups), now);
        assert!(router.route_to(&node(3)).is_some());

        let ops = router.peer_disconnected(node(2), now);
        assert!(router.route_to(&node(3)).is_none());
        let [RouteOp::Broadcast { packet: Packet::Control(Control::Rerr(rerr)), .. }] =
            ops.as_slice()
        else {
            panic!("expected rerr broadcast, got {ops:?}");
        };
        assert_eq!(rerr.unreachable, node(2));
        assert!(rerr.destinations.contains(&node(3)));
    }

    #[test]
    fn test_rerr_invalidates_only_routes_through_sender() {
        let mut router = router_at(1);
        let connected: HashSet<_> = [node(2), node(5)].into();
        let groups = HashSet::new();
        let now = Instant::now();

        for (dest, via) in [(3u8, 2u8), (4, 5)] {
            let reply = RouteReply {
                request_id: MessageId::random(),
                origin: node(1),
                destination: node(dest),
                hop_count: 2,
                hop_path: vec![node(1), node(via), node(dest)],
                dest_agreement_key: [dest; 32],
                dest_signing_key: [dest; 32],
            };
            router.handle_rrep(reply, node(via), view!(&connected, &groups), now);
        }

        let rerr = RouteFailure {
            unreachable: node(9),
            destinations: vec![node(3), node(4)],
        };
        let ops = router.handle_rerr(rerr, node(2), now);
        assert!(router.route_to(&node(3)).is_none());
        assert!(router.route_to(&node(4)).is_some());
        assert!(matches!(
            ops.as_slice(),
            [RouteOp::Broadcast { packet: Packet::Control(Control::Rerr(r)), .. }]
                if r.destinations == vec![node(3)]
        ));
    }

    #[test]
    fn test_announce_records_route_and_respects_hop_limit() {
        let mut router = router_at(2);
        let now = Instant::now();

        let announce = Announce {
            announce_id: MessageId::random(),
            origin: node(1),
            origin_name: "node-1".to_owned(),
            hop_count: 0,
            agreement_key: [1u8; 32],
            signing_key: [1u8; 32],
        };
        let ops = router.handle_announce(announce.clone(), node(1), now);
        assert!(router.route_to(&node(1)).is_some());
        assert!(matches!(ops.as_slice(), [RouteOp::Broadcast { .. }]));

        // One hop further the beacon dies.
        let mut far = announce;
        far.announce_id = MessageId::random();
        far.hop_count = 1;
        let ops = router.handle_announce(far, node(1), now);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_route_gc_drops_idle_entries() {
        let mut router = router_at(1);
        let connected: HashSet<_> = [node(2)].into();
        let groups = HashSet::new();
        let start = Instant::now();

        let reply = RouteReply {
            request_id: MessageId::random(),
            origin: node(1),
            destination: node(3),
            hop_count: 2,
            hop_path: vec![node(1), node(2), node(3)],
            dest_agreement_key: [3u8; 32],
            dest_signing_key: [3u8; 32],
        };
        router.handle_rrep(reply, node(2), view!(&connected, &groups), start);

        router.gc(start + Duration::from_secs(599));
        assert!(router.route_to(&node(3)).is_some());
        router.gc(start + Duration::from_secs(601));
        assert!(router.route_to(&node(3)).is_none());
    }
}
