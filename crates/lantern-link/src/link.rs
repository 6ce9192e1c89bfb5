//! Dual-role link session lifecycle and framed byte I/O.
//!
//! The [`LinkLayer`] consumes [`RadioEvent`]s on a single task (the radio
//! context) and is the only mutator of the peer indices; `send` and
//! `broadcast` may be called from any task and read the indices through
//! their concurrent maps. Typed [`LinkEvent`]s flow out to the application
//! context over a channel.
//!
//! Session pairing runs in two directions at once. The side that dialled
//! reads the peer's identity and public keys off its read-only endpoints
//! and then introduces itself with a hello frame; the side that accepted
//! the subscription learns everything from that hello. Either way a peer
//! reaches [`PeerState::Connected`] only once its message channel is bound
//! and both public keys are in hand.

use crate::error::LinkError;
use crate::peer::{Peer, PeerRole, PeerState};
use crate::radio::{Endpoint, LocalEndpoints, RadioEvent, RadioHal, RadioHandle};
use crate::wire::{self, Hello, FRAME_DATA, FRAME_HELLO};
use dashmap::DashMap;
use lantern_crypto::NodeId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Link-layer tunables.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Transport unit assumed when negotiation is unavailable
    pub default_mtu: usize,
    /// Scanner restart interval
    pub scan_interval: Duration,
    /// Outbound connect give-up deadline
    pub connection_timeout: Duration,
    /// Base delay between reconnect attempts (scaled linearly by attempt)
    pub reconnect_delay: Duration,
    /// Per-peer reconnect cap
    pub max_reconnect_attempts: u32,
    /// Discovery signal cutoff; weaker advertisements are ignored
    pub rssi_floor: i16,
    /// Dial discovered peers automatically
    pub auto_connect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            default_mtu: 182,
            scan_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            rssi_floor: -90,
            auto_connect: true,
        }
    }
}

/// The local node's identity as the link layer advertises it.
#[derive(Debug, Clone)]
pub struct LinkIdentity {
    /// Stable node identifier
    pub node_id: NodeId,
    /// Display name carried in the pairing hello
    pub name: String,
    /// X25519 agreement public key
    pub agreement_key: [u8; 32],
    /// Ed25519 signing public key
    pub signing_key: [u8; 32],
}

/// Typed events emitted to the application context.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The radio stack became available or unavailable
    RadioStateChanged {
        /// Whether both roles are usable
        available: bool,
    },
    /// The scanner saw a device above the signal floor
    PeerDiscovered {
        /// Stack-assigned device handle
        handle: RadioHandle,
        /// Signal-strength hint
        rssi: i16,
    },
    /// A peer completed pairing in either direction
    PeerConnected {
        /// The peer's node identifier
        peer: NodeId,
        /// Display name, if the peer introduced itself with one
        name: Option<String>,
        /// The peer's X25519 agreement public key
        agreement_key: [u8; 32],
        /// The peer's Ed25519 signing public key
        signing_key: [u8; 32],
        /// Negotiated maximum transport unit
        mtu: usize,
    },
    /// A connected peer went away (all its sessions dropped)
    PeerDisconnected {
        /// The peer's node identifier
        peer: NodeId,
    },
    /// An opaque frame arrived from a connected peer
    Frame {
        /// The sending peer
        from: NodeId,
        /// Frame payload, opaque at this layer
        bytes: Vec<u8>,
    },
}

/// Devices the scanner has seen, kept even after sessions end.
#[derive(Debug, Clone, Copy)]
struct DiscoveredDevice {
    rssi: i16,
    #[allow(dead_code)]
    last_seen: Instant,
}

struct LinkInner {
    radio: Arc<dyn RadioHal>,
    config: LinkConfig,
    local: LinkIdentity,
    peers: DashMap<RadioHandle, Peer>,
    by_node: DashMap<NodeId, RadioHandle>,
    discovered: DashMap<RadioHandle, DiscoveredDevice>,
    events: mpsc::UnboundedSender<LinkEvent>,
    available: AtomicBool,
}

/// The dual-role link layer.
///
/// Cheap to clone; all clones share one set of indices.
#[derive(Clone)]
pub struct LinkLayer {
    inner: Arc<LinkInner>,
}

impl LinkLayer {
    /// Create a link layer over a radio stack.
    ///
    /// Serves the local identity on the read-only endpoints and returns the
    /// channel on which [`LinkEvent`]s will be delivered once
    /// [`LinkLayer::start`] is called.
    #[must_use]
    pub fn new(
        radio: Arc<dyn RadioHal>,
        config: LinkConfig,
        local: LinkIdentity,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        radio.configure_endpoints(LocalEndpoints {
            device_id: local.node_id.as_bytes().to_vec(),
            agreement_key: local.agreement_key,
            signing_key: local.signing_key,
        });

        let (events, events_rx) = mpsc::unbounded_channel();
        let layer = Self {
            inner: Arc::new(LinkInner {
                radio,
                config,
                local,
                peers: DashMap::new(),
                by_node: DashMap::new(),
                discovered: DashMap::new(),
                events,
                available: AtomicBool::new(false),
            }),
        };
        (layer, events_rx)
    }

    /// Spawn the radio-context task consuming radio events.
    pub fn start(
        &self,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_radio_context(inner, radio_events))
    }

    /// Send an opaque frame to a connected peer.
    ///
    /// Picks the direction appropriate to the pair's roles. Returns whether
    /// the transport accepted the frame; acceptance does not imply
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::RadioUnavailable`] if the radio is off and
    /// [`LinkError::PeerNotConnected`] if the peer's channel is not bound.
    pub fn send(&self, to: &NodeId, payload: &[u8]) -> Result<bool, LinkError> {
        if !self.inner.available.load(Ordering::Acquire) {
            return Err(LinkError::RadioUnavailable);
        }
        let handle = self
            .inner
            .by_node
            .get(to)
            .map(|entry| *entry.value())
            .ok_or(LinkError::PeerNotConnected)?;
        let role = {
            let peer = self
                .inner
                .peers
                .get(&handle)
                .ok_or(LinkError::PeerNotConnected)?;
            if peer.state != PeerState::Connected {
                return Err(LinkError::PeerNotConnected);
            }
            peer.role
        };

        let frame = wire::data_frame(payload);
        let accepted = match role {
            PeerRole::Dialed => self.inner.radio.write_message(handle, &frame),
            PeerRole::Subscriber => self.inner.radio.notify_message(handle, &frame),
        };
        Ok(accepted)
    }

    /// Send a frame to every connected peer except those in `exclude`.
    ///
    /// Operates on a snapshot of the connected index and returns the number
    /// of sends the transport accepted.
    pub fn broadcast(&self, payload: &[u8], exclude: &HashSet<NodeId>) -> usize {
        if !self.inner.available.load(Ordering::Acquire) {
            return 0;
        }

        let targets: Vec<(RadioHandle, PeerRole)> = self
            .inner
            .by_node
            .iter()
            .filter(|entry| !exclude.contains(entry.key()))
            .filter_map(|entry| {
                let peer = self.inner.peers.get(entry.value())?;
                (peer.state == PeerState::Connected).then_some((peer.handle, peer.role))
            })
            .collect();

        let frame = wire::data_frame(payload);
        let mut accepted = 0;
        for (handle, role) in targets {
            let ok = match role {
                PeerRole::Dialed => self.inner.radio.write_message(handle, &frame),
                PeerRole::Subscriber => self.inner.radio.notify_message(handle, &frame),
            };
            if ok {
                accepted += 1;
            }
        }
        accepted
    }

    /// Node identifiers of all connected peers.
    #[must_use]
    pub fn connected_peers(&self) -> HashSet<NodeId> {
        self.inner
            .by_node
            .iter()
            .filter(|entry| {
                self.inner
                    .peers
                    .get(entry.value())
                    .is_some_and(|p| p.state == PeerState::Connected)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Whether a peer is currently connected.
    #[must_use]
    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.inner
            .by_node
            .get(node)
            .and_then(|entry| {
                self.inner
                    .peers
                    .get(entry.value())
                    .map(|p| p.state == PeerState::Connected)
            })
            .unwrap_or(false)
    }

    /// Negotiated MTU for a connected peer.
    #[must_use]
    pub fn mtu_for(&self, node: &NodeId) -> Option<usize> {
        let handle = *self.inner.by_node.get(node)?;
        self.inner.peers.get(&handle).map(|p| p.mtu)
    }

    /// The smallest MTU across connected peers, bounding broadcast frames.
    #[must_use]
    pub fn min_connected_mtu(&self) -> Option<usize> {
        self.inner
            .by_node
            .iter()
            .filter_map(|entry| {
                let peer = self.inner.peers.get(entry.value())?;
                (peer.state == PeerState::Connected).then_some(peer.mtu)
            })
            .min()
    }

    /// Number of devices the scanner has seen above the signal floor.
    #[must_use]
    pub fn discovered_count(&self) -> usize {
        self.inner.discovered.len()
    }
}

async fn run_radio_context(
    inner: Arc<LinkInner>,
    mut radio_events: mpsc::UnboundedReceiver<RadioEvent>,
) {
    let mut housekeeping = tokio::time::interval(Duration::from_millis(250));
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_scan = Instant::now();

    loop {
        tokio::select! {
            maybe_event = radio_events.recv() => {
                match maybe_event {
                    Some(event) => inner.handle_radio_event(event),
                    None => break,
                }
            }
            _ = housekeeping.tick() => {
                inner.housekeeping(Instant::now(), &mut last_scan);
            }
        }
    }
    tracing::debug!("radio event channel closed, link layer stopping");
}

impl LinkInner {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn handle_radio_event(&self, event: RadioEvent) {
        let now = Instant::now();
        match event {
            RadioEvent::PowerChanged { available } => {
                self.available.store(available, Ordering::Release);
                if available {
                    if let Err(err) = self.radio.start_advertising() {
                        tracing::warn!(?err, "failed to start advertising");
                    }
                    if let Err(err) = self.radio.start_scanning() {
                        tracing::warn!(?err, "failed to start scanning");
                    }
                }
                self.emit(LinkEvent::RadioStateChanged { available });
            }
            RadioEvent::DeviceDiscovered { handle, rssi } => {
                self.on_device_discovered(handle, rssi, now);
            }
            RadioEvent::ConnectComplete { handle, mtu } => {
                if let Some(mut peer) = self.peers.get_mut(&handle) {
                    peer.channel_bound = true;
                    peer.mtu = mtu;
                    peer.connect_deadline = None;
                    peer.last_seen = now;
                }
                for endpoint in [
                    Endpoint::DeviceId,
                    Endpoint::AgreementKey,
                    Endpoint::SigningKey,
                ] {
                    if let Err(err) = self.radio.request_endpoint(handle, endpoint) {
                        tracing::warn!(handle, ?endpoint, ?err, "endpoint read request failed");
                    }
                }
            }
            RadioEvent::ConnectFailed { handle } => {
                tracing::debug!(handle, "outbound connect failed");
                if let Some(mut peer) = self.peers.get_mut(&handle) {
                    peer.connect_deadline = None;
                    let retry = peer.role == PeerRole::Dialed
                        && peer.reconnect_attempts < self.config.max_reconnect_attempts;
                    if retry {
                        let backoff = self.config.reconnect_delay * (peer.reconnect_attempts + 1);
                        peer.state = PeerState::Disconnected;
                        peer.reconnect_at = Some(now + backoff);
                    } else {
                        peer.state = PeerState::Failed;
                    }
                }
            }
            RadioEvent::Disconnected { handle } | RadioEvent::SubscriberLeft { handle } => {
                self.on_session_down(handle, now);
            }
            RadioEvent::EndpointValue {
                handle,
                endpoint,
                value,
            } => {
                self.on_endpoint_value(handle, endpoint, &value, now);
                self.try_promote(handle);
            }
            RadioEvent::SubscriberJoined { handle, mtu } => {
                let deadline = now + self.config.connection_timeout;
                let mut peer =
                    Peer::connecting(handle, PeerRole::Subscriber, None, mtu, deadline, now);
                peer.channel_bound = true;
                self.peers.insert(handle, peer);
                tracing::debug!(handle, "inbound subscriber joined, awaiting hello");
            }
            RadioEvent::FrameReceived { handle, bytes } => {
                self.on_frame_received(handle, &bytes, now);
            }
        }
    }

    fn on_device_discovered(&self, handle: RadioHandle, rssi: i16, now: Instant) {
        if rssi < self.config.rssi_floor {
            tracing::trace!(handle, rssi, "discovery below signal floor");
            return;
        }
        self.discovered.insert(
            handle,
            DiscoveredDevice {
                rssi,
                last_seen: now,
            },
        );
        self.emit(LinkEvent::PeerDiscovered { handle, rssi });

        if !self.config.auto_connect {
            return;
        }
        // A failed slot is retried on rediscovery; live slots are left alone.
        let retry = match self.peers.get(&handle) {
            Some(peer) => peer.state == PeerState::Failed,
            None => true,
        };
        if retry {
            self.peers.remove(&handle);
            self.begin_connect(handle, Some(rssi), 0, now);
        }
    }

    fn begin_connect(&self, handle: RadioHandle, rssi: Option<i16>, attempts: u32, now: Instant) {
        let deadline = now + self.config.connection_timeout;
        let mut peer = Peer::connecting(
            handle,
            PeerRole::Dialed,
            rssi,
            self.config.default_mtu,
            deadline,
            now,
        );
        peer.reconnect_attempts = attempts;
        self.peers.insert(handle, peer);

        if let Err(err) = self.radio.connect(handle) {
            tracing::warn!(handle, ?err, "connect request rejected");
            if let Some(mut peer) = self.peers.get_mut(&handle) {
                peer.state = PeerState::Failed;
                peer.connect_deadline = None;
            }
        }
    }

    fn on_endpoint_value(&self, handle: RadioHandle, endpoint: Endpoint, value: &[u8], now: Instant) {
        let Some(mut peer) = self.peers.get_mut(&handle) else {
            return;
        };
        peer.last_seen = now;
        match endpoint {
            Endpoint::DeviceId => match <[u8; 16]>::try_from(value) {
                Ok(bytes) => peer.node_id = Some(NodeId::from_bytes(bytes)),
                Err(_) => tracing::warn!(handle, len = value.len(), "bad device id length"),
            },
            Endpoint::AgreementKey => match <[u8; 32]>::try_from(value) {
                Ok(bytes) => peer.agreement_key = Some(bytes),
                Err(_) => tracing::warn!(handle, len = value.len(), "bad agreement key length"),
            },
            Endpoint::SigningKey => match <[u8; 32]>::try_from(value) {
                Ok(bytes) => peer.signing_key = Some(bytes),
                Err(_) => tracing::warn!(handle, len = value.len(), "bad signing key length"),
            },
            Endpoint::Message => {}
        }
    }

    fn on_frame_received(&self, handle: RadioHandle, bytes: &[u8], now: Instant) {
        let Some(&tag) = bytes.first() else {
            return;
        };
        match tag {
            FRAME_HELLO => match Hello::parse(&bytes[1..]) {
                Ok(hello) => {
                    if let Some(mut peer) = self.peers.get_mut(&handle) {
                        peer.node_id = Some(hello.node_id);
                        peer.agreement_key = Some(hello.agreement_key);
                        peer.signing_key = Some(hello.signing_key);
                        peer.name = Some(hello.name);
                        peer.last_seen = now;
                    }
                    self.try_promote(handle);
                }
                Err(err) => tracing::warn!(handle, ?err, "dropping malformed hello"),
            },
            FRAME_DATA => {
                let from = match self.peers.get_mut(&handle) {
                    Some(mut peer) if peer.state == PeerState::Connected => {
                        peer.last_seen = now;
                        peer.node_id
                    }
                    _ => None,
                };
                match from {
                    Some(from) => self.emit(LinkEvent::Frame {
                        from,
                        bytes: bytes[1..].to_vec(),
                    }),
                    None => tracing::debug!(handle, "data frame from unpromoted session"),
                }
            }
            other => tracing::warn!(handle, tag = other, "unknown link frame tag"),
        }
    }

    /// Promote a session to `Connected` once the channel is bound and both
    /// public keys are in hand.
    fn try_promote(&self, handle: RadioHandle) {
        let promoted = {
            let Some(mut peer) = self.peers.get_mut(&handle) else {
                return;
            };
            if peer.state == PeerState::Connected || !peer.ready() {
                return;
            }
            peer.state = PeerState::Connected;
            peer.reconnect_attempts = 0;
            peer.connect_deadline = None;
            (
                peer.node_id,
                peer.name.clone(),
                peer.role,
                peer.agreement_key,
                peer.signing_key,
                peer.mtu,
            )
        };
        let (Some(node), name, role, Some(agreement_key), Some(signing_key), mtu) = promoted
        else {
            return;
        };

        // Talking to our own advertisement; tear it down quietly.
        if node == self.local.node_id {
            self.radio.disconnect(handle);
            self.peers.remove(&handle);
            return;
        }

        // The dialled side introduces itself so the acceptor learns our
        // identity and keys (it cannot read our endpoints).
        if role == PeerRole::Dialed {
            let hello = Hello {
                node_id: self.local.node_id,
                agreement_key: self.local.agreement_key,
                signing_key: self.local.signing_key,
                name: self.local.name.clone(),
            };
            self.radio.write_message(handle, &hello.encode());
        }

        // Simultaneous dials leave two live sessions for one node; unicast
        // sticks with the first to promote and the duplicate stays as a
        // silent spare.
        let first = !self.by_node.contains_key(&node);
        if first {
            self.by_node.insert(node, handle);
            tracing::info!(peer = %node, ?role, mtu, "peer connected");
            self.emit(LinkEvent::PeerConnected {
                peer: node,
                name,
                agreement_key,
                signing_key,
                mtu,
            });
        } else {
            tracing::debug!(peer = %node, handle, "duplicate session promoted as spare");
        }
    }

    fn on_session_down(&self, handle: RadioHandle, now: Instant) {
        let Some(mut peer) = self.peers.get_mut(&handle) else {
            return;
        };
        let was_connected = peer.state == PeerState::Connected;
        let node = peer.node_id;
        let role = peer.role;
        peer.state = PeerState::Disconnected;
        peer.channel_bound = false;
        let attempts = peer.reconnect_attempts;
        let will_retry = role == PeerRole::Dialed && attempts < self.config.max_reconnect_attempts;
        if will_retry {
            let backoff = self.config.reconnect_delay * (attempts + 1);
            peer.reconnect_at = Some(now + backoff);
            tracing::debug!(handle, attempts, ?backoff, "scheduling reconnect");
        }
        drop(peer);

        if !will_retry {
            self.peers.remove(&handle);
        }

        let Some(node) = node else {
            return;
        };
        let mapped = self.by_node.get(&node).map(|entry| *entry.value());
        if mapped != Some(handle) {
            return;
        }
        // Fail over to a spare session with the same node if one is live.
        let spare = self
            .peers
            .iter()
            .find(|p| {
                p.handle != handle && p.node_id == Some(node) && p.state == PeerState::Connected
            })
            .map(|p| p.handle);
        match spare {
            Some(alternate) => {
                self.by_node.insert(node, alternate);
                tracing::debug!(peer = %node, alternate, "failed over to spare session");
            }
            None => {
                self.by_node.remove(&node);
                if was_connected {
                    tracing::info!(peer = %node, "peer disconnected");
                    self.emit(LinkEvent::PeerDisconnected { peer: node });
                }
            }
        }
    }

    fn housekeeping(&self, now: Instant, last_scan: &mut Instant) {
        // Expire in-flight connection attempts.
        let timed_out: Vec<RadioHandle> = self
            .peers
            .iter()
            .filter(|p| {
                p.state == PeerState::Connecting
                    && p.connect_deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|p| p.handle)
            .collect();
        for handle in timed_out {
            tracing::debug!(handle, "connection attempt timed out");
            self.radio.disconnect(handle);
            let remove = {
                let Some(mut peer) = self.peers.get_mut(&handle) else {
                    continue;
                };
                peer.state = PeerState::Failed;
                peer.connect_deadline = None;
                peer.role == PeerRole::Subscriber
            };
            if remove {
                self.peers.remove(&handle);
            }
        }

        // Fire due reconnects.
        let due: Vec<(RadioHandle, u32)> = self
            .peers
            .iter()
            .filter(|p| {
                p.state == PeerState::Disconnected
                    && p.reconnect_at.is_some_and(|at| at <= now)
            })
            .map(|p| (p.handle, p.reconnect_attempts))
            .collect();
        for (handle, attempts) in due {
            tracing::debug!(handle, attempt = attempts + 1, "reconnecting");
            {
                let Some(mut peer) = self.peers.get_mut(&handle) else {
                    continue;
                };
                peer.reconnect_attempts = attempts + 1;
                peer.state = PeerState::Connecting;
                peer.channel_bound = false;
                peer.connect_deadline = Some(now + self.config.connection_timeout);
                peer.reconnect_at = None;
            }
            if let Err(err) = self.radio.connect(handle) {
                tracing::warn!(handle, ?err, "reconnect request rejected");
                if let Some(mut peer) = self.peers.get_mut(&handle) {
                    peer.state = PeerState::Failed;
                    peer.connect_deadline = None;
                }
            }
        }

        // Periodic scanner restart.
        if self.available.load(Ordering::Acquire)
            && now.duration_since(*last_scan) >= self.config.scan_interval
        {
            let _ = self.radio.start_scanning();
            *last_scan = now;
        }
    }
}
