//! Node orchestration.
//!
//! [`MeshNode`] is the application context: a single event loop consuming
//! typed link events, user commands, and timer ticks, and driving the
//! router, reliability tracker, session store, and conversation registry.
//! All of that state is owned by the loop, so none of it needs locking;
//! the only shared structures are the link layer's peer indices, which the
//! radio context owns.
//!
//! Every dependency is injected at construction. Interaction happens
//! through a [`NodeHandle`] (commands in) and an event channel
//! ([`NodeEvent`]s out).

use crate::chunk::{self, Chunk, ChunkFlags};
use crate::config::MeshConfig;
use crate::control::{Control, DeliveryAck, GroupKeyGrant, ReadReceipt};
use crate::conversation::{
    ConversationId, ConversationRegistry, ConversationSummary, StoredMessage,
};
use crate::envelope::{
    DirectCipherPayload, Envelope, GroupCipherPayload, MessageId, Packet,
};
use crate::error::MeshError;
use crate::reassembly::ReassemblyBuffer;
use crate::reliability::{ReliabilityTracker, RetryAction};
use crate::router::{RouteOp, Router, RouterView};
use lantern_crypto::{GroupId, GroupKey, GroupKeyring, Identity, NodeId, SessionStore};
use lantern_link::{LinkEvent, LinkLayer};
use rand_core::OsRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Why a tracked delivery did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Route discovery timed out
    NoRoute,
    /// The destination's keys never became available
    NoSession,
    /// Retries exhausted without an acknowledgement
    Timeout,
    /// The entry outlived the message expiry
    Expired,
}

/// Events delivered to the embedding application.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer completed pairing
    PeerConnected {
        /// The peer
        peer: NodeId,
        /// Its display name, if already known
        name: Option<String>,
    },
    /// A peer went away
    PeerDisconnected {
        /// The peer
        peer: NodeId,
    },
    /// A presence beacon introduced a peer (possibly beyond direct range)
    PeerAnnounced {
        /// The announced node
        peer: NodeId,
        /// Its display name
        name: String,
    },
    /// A message was delivered locally
    MessageReceived {
        /// The conversation it belongs to
        conversation: ConversationId,
        /// The message
        message: StoredMessage,
    },
    /// The destination acknowledged a tracked message
    DeliveryConfirmed {
        /// The acknowledged message
        message_id: MessageId,
    },
    /// A tracked message will not be delivered
    DeliveryFailed {
        /// The failed message
        message_id: MessageId,
        /// Why
        reason: DeliveryFailure,
    },
    /// A peer read one of our messages
    MessageRead {
        /// The message that was read
        message_id: MessageId,
        /// The reader
        by: NodeId,
    },
    /// A group key grant installed membership in a group
    GroupJoined {
        /// The group
        group: GroupId,
        /// Its display name
        name: String,
        /// The member that distributed the key
        from: NodeId,
    },
}

enum NodeCommand {
    SendPrivate {
        to: NodeId,
        text: String,
        require_ack: bool,
        reply: oneshot::Sender<Result<MessageId, MeshError>>,
    },
    SendGroup {
        group: GroupId,
        text: String,
        reply: oneshot::Sender<Result<MessageId, MeshError>>,
    },
    CreateGroup {
        name: String,
        reply: oneshot::Sender<GroupId>,
    },
    AddMember {
        group: GroupId,
        member: NodeId,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    MarkRead {
        conversation: ConversationId,
        reply: oneshot::Sender<()>,
    },
    Conversations {
        reply: oneshot::Sender<Vec<ConversationSummary>>,
    },
    Shutdown,
}

/// Cloneable handle for talking to a running [`MeshNode`].
#[derive(Clone)]
pub struct NodeHandle {
    node_id: NodeId,
    commands: mpsc::UnboundedSender<NodeCommand>,
}

impl NodeHandle {
    /// The node this handle talks to.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Send a direct text message.
    ///
    /// Returns the MessageID as soon as the message is accepted; delivery
    /// progress arrives as [`NodeEvent`]s when `require_ack` is set.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::ShuttingDown`] if the node has stopped, or the
    /// node's immediate routing/crypto error.
    pub async fn send_private(
        &self,
        to: NodeId,
        text: impl Into<String>,
        require_ack: bool,
    ) -> Result<MessageId, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NodeCommand::SendPrivate {
                to,
                text: text.into(),
                require_ack,
                reply,
            })
            .map_err(|_| MeshError::ShuttingDown)?;
        response.await.map_err(|_| MeshError::ShuttingDown)?
    }

    /// Send a message to a group this node belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::UnknownGroup`] if no key is held for the group.
    pub async fn send_group(
        &self,
        group: GroupId,
        text: impl Into<String>,
    ) -> Result<MessageId, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NodeCommand::SendGroup {
                group,
                text: text.into(),
                reply,
            })
            .map_err(|_| MeshError::ShuttingDown)?;
        response.await.map_err(|_| MeshError::ShuttingDown)?
    }

    /// Create a group owned by this node.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::ShuttingDown`] if the node has stopped.
    pub async fn create_group(&self, name: impl Into<String>) -> Result<GroupId, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NodeCommand::CreateGroup {
                name: name.into(),
                reply,
            })
            .map_err(|_| MeshError::ShuttingDown)?;
        response.await.map_err(|_| MeshError::ShuttingDown)
    }

    /// Seal the group key to a new member and send the grant.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::UnknownGroup`] for a group this node does not
    /// own a key for, or a crypto error if no session exists with the
    /// member yet.
    pub async fn add_member(&self, group: GroupId, member: NodeId) -> Result<(), MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NodeCommand::AddMember {
                group,
                member,
                reply,
            })
            .map_err(|_| MeshError::ShuttingDown)?;
        response.await.map_err(|_| MeshError::ShuttingDown)?
    }

    /// Mark a conversation read, emitting read receipts for what was
    /// unread.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::ShuttingDown`] if the node has stopped.
    pub async fn mark_read(&self, conversation: ConversationId) -> Result<(), MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NodeCommand::MarkRead {
                conversation,
                reply,
            })
            .map_err(|_| MeshError::ShuttingDown)?;
        response.await.map_err(|_| MeshError::ShuttingDown)
    }

    /// Current conversation summaries.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::ShuttingDown`] if the node has stopped.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NodeCommand::Conversations { reply })
            .map_err(|_| MeshError::ShuttingDown)?;
        response.await.map_err(|_| MeshError::ShuttingDown)
    }

    /// Ask the node's event loop to stop.
    pub fn shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown);
    }
}

struct PendingText {
    message_id: MessageId,
    text: String,
    require_ack: bool,
}

/// The mesh node: the application-context event loop.
pub struct MeshNode {
    identity: Arc<Identity>,
    name: String,
    config: MeshConfig,
    link: LinkLayer,
    sessions: SessionStore,
    keyring: GroupKeyring,
    router: Router,
    reassembly: ReassemblyBuffer,
    reliability: ReliabilityTracker,
    conversations: ConversationRegistry,
    peer_names: HashMap<NodeId, String>,
    pending_texts: HashMap<NodeId, Vec<PendingText>>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    commands: Option<mpsc::UnboundedReceiver<NodeCommand>>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl MeshNode {
    /// Assemble a node from its injected dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Chunk`] if the configuration's MTU cannot hold
    /// a chunk header (fatal at start-up).
    pub fn new(
        identity: Arc<Identity>,
        name: impl Into<String>,
        config: MeshConfig,
        link: LinkLayer,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Result<(Self, NodeHandle, mpsc::UnboundedReceiver<NodeEvent>), MeshError> {
        config.validate()?;
        let name = name.into();

        let router = Router::new(
            identity.node_id(),
            name.clone(),
            identity.agreement_public_key(),
            identity.signing_public_key(),
            config.router_config(),
        );
        let (events, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handle = NodeHandle {
            node_id: identity.node_id(),
            commands: commands_tx,
        };
        let node = Self {
            sessions: SessionStore::new(Arc::clone(&identity)),
            keyring: GroupKeyring::new(),
            router,
            reassembly: ReassemblyBuffer::new(config.message_cache_expiry),
            reliability: ReliabilityTracker::new(config.reliability.clone()),
            conversations: ConversationRegistry::new(),
            peer_names: HashMap::new(),
            pending_texts: HashMap::new(),
            link_events: Some(link_events),
            commands: Some(commands_rx),
            events,
            identity,
            name,
            config,
            link,
        };
        Ok((node, handle, events_rx))
    }

    /// Run the event loop until shutdown or channel closure.
    pub async fn run(mut self) {
        let (Some(mut link_events), Some(mut commands)) =
            (self.link_events.take(), self.commands.take())
        else {
            return;
        };

        let mut retry = tokio::time::interval(self.config.reliability.retry_tick);
        let mut expiry = tokio::time::interval(self.config.reliability.expiry_tick);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_event = link_events.recv() => {
                    match maybe_event {
                        Some(event) => self.on_link_event(event),
                        None => break,
                    }
                }
                maybe_command = commands.recv() => {
                    match maybe_command {
                        Some(NodeCommand::Shutdown) | None => break,
                        Some(command) => self.on_command(command),
                    }
                }
                _ = retry.tick() => self.on_retry_tick(Instant::now()),
                _ = expiry.tick() => self.on_expiry_tick(Instant::now()),
            }
        }
        tracing::info!(node = %self.identity.node_id(), "mesh node stopped");
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    /// Run a router call against a fresh snapshot of connection and group
    /// state.
    fn with_view<R>(&mut self, f: impl FnOnce(&mut Router, RouterView<'_>) -> R) -> R {
        let connected = self.link.connected_peers();
        let local_groups: HashSet<NodeId> = self
            .keyring
            .groups()
            .into_iter()
            .map(|g| g.address())
            .collect();
        let view = RouterView {
            connected: &connected,
            local_groups: &local_groups,
        };
        f(&mut self.router, view)
    }

    // ---- link events -----------------------------------------------------

    fn on_link_event(&mut self, event: LinkEvent) {
        let now = Instant::now();
        match event {
            LinkEvent::RadioStateChanged { available } => {
                tracing::info!(available, "radio state changed");
            }
            LinkEvent::PeerDiscovered { handle, rssi } => {
                tracing::trace!(handle, rssi, "peer discovered");
            }
            LinkEvent::PeerConnected {
                peer,
                name,
                agreement_key,
                signing_key,
                mtu,
            } => {
                tracing::debug!(peer = %peer, mtu, "peer connected");
                self.install_remote_keys(peer, &agreement_key, &signing_key);
                if let Some(peer_name) = &name {
                    self.note_name(peer, peer_name);
                }
                let announce = self.router.make_announce(now);
                self.execute_ops(vec![announce], now);
                self.flush_pending_texts(peer, now);
                self.emit(NodeEvent::PeerConnected { peer, name });
            }
            LinkEvent::PeerDisconnected { peer } => {
                let ops = self.router.peer_disconnected(peer, now);
                self.execute_ops(ops, now);
                self.emit(NodeEvent::PeerDisconnected { peer });
            }
            LinkEvent::Frame { from, bytes } => self.on_frame(from, &bytes, now),
        }
    }

    fn on_frame(&mut self, from: NodeId, bytes: &[u8], now: Instant) {
        let chunk = match Chunk::parse(bytes) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(from = %from, %err, "dropping malformed chunk");
                return;
            }
        };
        let reassembled = match self.reassembly.offer(chunk, now) {
            Ok(Some(reassembled)) => reassembled,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(from = %from, %err, "chunk discarded");
                return;
            }
        };
        let packet = match Packet::decode(&reassembled.payload) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(from = %from, %err, "dropping undecodable packet");
                return;
            }
        };

        match packet {
            Packet::Data(envelope) => {
                self.note_name(envelope.origin, &envelope.origin_name.clone());
                let flags = reassembled.flags;
                let ops =
                    self.with_view(|router, view| router.handle_envelope(envelope, flags, from, view, now));
                self.execute_ops(ops, now);
            }
            Packet::Control(control) => self.on_control(control, from, now),
        }
    }

    fn on_control(&mut self, control: Control, from: NodeId, now: Instant) {
        let local = self.identity.node_id();
        let ops = match control {
            Control::Rreq(request) => {
                self.note_name(request.origin, &request.origin_name.clone());
                self.install_remote_keys(
                    request.origin,
                    &request.origin_agreement_key,
                    &request.origin_signing_key,
                );
                self.router.handle_rreq(request, from, now)
            }
            Control::Rrep(reply) => {
                self.install_remote_keys(
                    reply.destination,
                    &reply.dest_agreement_key,
                    &reply.dest_signing_key,
                );
                self.with_view(|router, view| router.handle_rrep(reply, from, view, now))
            }
            Control::Rerr(failure) => self.router.handle_rerr(failure, from, now),
            Control::Announce(announce) => {
                self.install_remote_keys(
                    announce.origin,
                    &announce.agreement_key,
                    &announce.signing_key,
                );
                if self.note_name(announce.origin, &announce.origin_name.clone()) {
                    self.emit(NodeEvent::PeerAnnounced {
                        peer: announce.origin,
                        name: announce.origin_name.clone(),
                    });
                }
                self.router.handle_announce(announce, from, now)
            }
            Control::Ack(ack) if ack.destination == local => {
                let control = Control::Ack(ack.clone());
                if self.router.accept_addressed(&control, now)
                    && self.reliability.on_ack(&ack.message_id, now)
                {
                    self.emit(NodeEvent::DeliveryConfirmed {
                        message_id: ack.message_id,
                    });
                }
                Vec::new()
            }
            Control::Read(receipt) if receipt.destination == local => {
                let control = Control::Read(receipt.clone());
                if self.router.accept_addressed(&control, now) {
                    self.emit(NodeEvent::MessageRead {
                        message_id: receipt.message_id,
                        by: receipt.origin,
                    });
                }
                Vec::new()
            }
            Control::Gkd(grant) if grant.destination == local => {
                let control = Control::Gkd(grant.clone());
                if self.router.accept_addressed(&control, now) {
                    self.install_group_grant(grant);
                }
                Vec::new()
            }
            // Addressed records in transit.
            other @ (Control::Ack(_) | Control::Read(_) | Control::Gkd(_)) => {
                self.with_view(|router, view| router.forward_addressed(other, from, view, now))
            }
        };
        self.execute_ops(ops, now);
    }

    fn install_group_grant(&mut self, grant: GroupKeyGrant) {
        self.note_name(grant.origin, &grant.origin_name.clone());
        let key_bytes = match self
            .sessions
            .decrypt_from(&grant.origin, &grant.sealed_key.clone().into())
        {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(from = %grant.origin, %err, "cannot unseal group key");
                return;
            }
        };
        let Ok(key) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
            tracing::warn!(from = %grant.origin, "group key grant has wrong key length");
            return;
        };

        self.keyring.install(grant.group_id, GroupKey::from_bytes(key));
        self.conversations
            .register_group(grant.group_id, &grant.group_name, grant.members.clone());
        tracing::info!(group = %grant.group_id, name = grant.group_name, "joined group");
        self.emit(NodeEvent::GroupJoined {
            group: grant.group_id,
            name: grant.group_name,
            from: grant.origin,
        });
    }

    // ---- route-op execution ----------------------------------------------

    fn execute_ops(&mut self, ops: Vec<RouteOp>, now: Instant) {
        for op in ops {
            match op {
                RouteOp::SendToPeer {
                    peer,
                    packet,
                    flags,
                } => self.transmit_unicast(peer, &packet, flags),
                RouteOp::Broadcast {
                    exclude,
                    packet,
                    flags,
                } => self.transmit_broadcast(&exclude, &packet, flags),
                RouteOp::Deliver {
                    envelope,
                    flags,
                    via,
                } => self.deliver_local(envelope, flags, via, now),
                RouteOp::RouteEstablished { destination } => {
                    self.flush_pending_texts(destination, now);
                }
                RouteOp::DiscoveryFailed {
                    destination,
                    undelivered,
                } => self.on_discovery_failed(destination, undelivered),
            }
        }
    }

    fn transmit_unicast(&mut self, peer: NodeId, packet: &Packet, flags: ChunkFlags) {
        let Some(chunks) = self.chunk_packet(packet, flags, self.link.mtu_for(&peer)) else {
            return;
        };
        for chunk in chunks {
            match self.link.send(&peer, &chunk.encode()) {
                Ok(true) => {}
                Ok(false) => tracing::debug!(peer = %peer, "transport refused frame"),
                Err(err) => {
                    tracing::debug!(peer = %peer, %err, "send failed");
                    return;
                }
            }
        }
    }

    fn transmit_broadcast(&mut self, exclude: &[NodeId], packet: &Packet, flags: ChunkFlags) {
        let Some(chunks) = self.chunk_packet(packet, flags, self.link.min_connected_mtu()) else {
            return;
        };
        let exclude: HashSet<NodeId> = exclude.iter().copied().collect();
        for chunk in chunks {
            self.link.broadcast(&chunk.encode(), &exclude);
        }
    }

    fn chunk_packet(
        &self,
        packet: &Packet,
        flags: ChunkFlags,
        mtu: Option<usize>,
    ) -> Option<Vec<Chunk>> {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%err, "packet did not serialize");
                return None;
            }
        };
        let mtu = mtu.unwrap_or(self.config.default_mtu);
        match chunk::chunks_for(packet_chunk_id(packet), &bytes, flags, mtu) {
            Ok(chunks) => Some(chunks),
            Err(err) => {
                tracing::warn!(%err, "packet could not be chunked");
                None
            }
        }
    }

    // ---- local delivery --------------------------------------------------

    fn deliver_local(&mut self, envelope: Envelope, flags: ChunkFlags, via: NodeId, now: Instant) {
        if envelope.group {
            self.deliver_group(&envelope, via);
            return;
        }

        let text = if envelope.is_encrypted {
            let record: DirectCipherPayload = match serde_json::from_slice(&envelope.payload) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(from = %envelope.origin, %err, "bad cipher record");
                    return;
                }
            };
            // A first message from a stranger carries its own session
            // bootstrap: the sender's agreement key.
            if !self.sessions.has_session(&envelope.origin) {
                if let Err(err) = self
                    .sessions
                    .store_peer_agreement_key(envelope.origin, &record.sender_agreement_key)
                {
                    tracing::warn!(from = %envelope.origin, %err, "sender key rejected");
                    return;
                }
            }
            match self
                .sessions
                .decrypt_from(&envelope.origin, &record.sealed.into())
            {
                Ok(plaintext) => String::from_utf8_lossy(&plaintext).into_owned(),
                Err(err) => {
                    // The envelope dies here; nothing goes on the wire.
                    tracing::warn!(from = %envelope.origin, %err, "dropping undecryptable envelope");
                    return;
                }
            }
        } else {
            String::from_utf8_lossy(&envelope.payload).into_owned()
        };

        let message = StoredMessage {
            id: envelope.id,
            sender: envelope.origin,
            sender_name: envelope.origin_name.clone(),
            text,
            outgoing: false,
        };
        let conversation = ConversationId::Direct(envelope.origin);
        let title = self
            .peer_names
            .get(&envelope.origin)
            .cloned()
            .unwrap_or_else(|| envelope.origin_name.clone());

        if !self.conversations.add_incoming(conversation, &title, message.clone()) {
            tracing::debug!(id = %envelope.id, "duplicate delivery ignored");
            return;
        }
        self.emit(NodeEvent::MessageReceived {
            conversation,
            message,
        });

        if flags.requires_ack() {
            let ack = Control::Ack(DeliveryAck {
                ack_id: MessageId::random(),
                message_id: envelope.id,
                origin: self.identity.node_id(),
                destination: envelope.origin,
                ttl: self.config.max_ttl,
            });
            let ops = self.with_view(|router, view| router.send_addressed(ack, view, now));
            self.execute_ops(ops, now);
        }
    }

    fn deliver_group(&mut self, envelope: &Envelope, _via: NodeId) {
        let group = GroupId::from_address(envelope.destination);
        let record: GroupCipherPayload = match serde_json::from_slice(&envelope.payload) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(from = %envelope.origin, %err, "bad group record");
                return;
            }
        };
        let plaintext = match self
            .keyring
            .decrypt_with_group(&group, &record.sealed.clone().into())
        {
            Ok(plaintext) => plaintext,
            Err(err) => {
                tracing::debug!(group = %group, %err, "group record not decryptable");
                return;
            }
        };

        let message = StoredMessage {
            id: envelope.id,
            sender: record.sender,
            sender_name: record.sender_name.clone(),
            text: String::from_utf8_lossy(&plaintext).into_owned(),
            outgoing: false,
        };
        let conversation = ConversationId::Group(group);
        let title = self
            .conversations
            .get(&conversation)
            .map(|c| c.title.clone())
            .unwrap_or_else(|| record.sender_name.clone());

        if self.conversations.add_incoming(conversation, &title, message.clone()) {
            self.emit(NodeEvent::MessageReceived {
                conversation,
                message,
            });
        }
    }

    // ---- commands --------------------------------------------------------

    fn on_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::SendPrivate {
                to,
                text,
                require_ack,
                reply,
            } => {
                let _ = reply.send(self.send_private(to, text, require_ack));
            }
            NodeCommand::SendGroup { group, text, reply } => {
                let _ = reply.send(self.send_group(group, &text));
            }
            NodeCommand::CreateGroup { name, reply } => {
                let _ = reply.send(self.create_group(&name));
            }
            NodeCommand::AddMember {
                group,
                member,
                reply,
            } => {
                let _ = reply.send(self.add_member(group, member));
            }
            NodeCommand::MarkRead {
                conversation,
                reply,
            } => {
                self.mark_read(conversation);
                let _ = reply.send(());
            }
            NodeCommand::Conversations { reply } => {
                let _ = reply.send(self.conversations.summaries());
            }
            NodeCommand::Shutdown => {}
        }
    }

    fn send_private(
        &mut self,
        to: NodeId,
        text: String,
        require_ack: bool,
    ) -> Result<MessageId, MeshError> {
        let now = Instant::now();
        let message_id = MessageId::random();
        let title = self
            .peer_names
            .get(&to)
            .cloned()
            .unwrap_or_else(|| to.to_string());
        self.conversations.add_outgoing(
            ConversationId::Direct(to),
            &title,
            StoredMessage {
                id: message_id,
                sender: self.identity.node_id(),
                sender_name: self.name.clone(),
                text: text.clone(),
                outgoing: true,
            },
        );

        if self.sessions.has_session(&to) {
            let envelope = self.build_direct_envelope(message_id, to, &text)?;
            let mut flags = ChunkFlags::new().with_encrypted();
            if require_ack {
                flags = flags.with_requires_ack();
            }
            if require_ack {
                self.reliability.track(envelope.clone(), flags, now);
            }
            let ops =
                self.with_view(|router, view| router.send_envelope(envelope, flags, view, now));
            self.execute_ops(ops, now);
        } else {
            // The peer's keys are not in hand yet; discovery replies carry
            // them, so queue the text until the route (and session) exist.
            tracing::debug!(to = %to, "no session yet, queueing text behind discovery");
            self.pending_texts.entry(to).or_default().push(PendingText {
                message_id,
                text,
                require_ack,
            });
            let ops = self.with_view(|router, view| router.ensure_discovery(to, view, now));
            self.execute_ops(ops, now);
        }
        Ok(message_id)
    }

    fn build_direct_envelope(
        &mut self,
        message_id: MessageId,
        to: NodeId,
        text: &str,
    ) -> Result<Envelope, MeshError> {
        let sealed = self
            .sessions
            .encrypt_for(&mut OsRng, &to, text.as_bytes())?;
        let record = DirectCipherPayload {
            sealed: sealed.into(),
            sender_agreement_key: self.identity.agreement_public_key(),
        };
        Ok(Envelope {
            id: message_id,
            origin: self.identity.node_id(),
            origin_name: self.name.clone(),
            destination: to,
            is_encrypted: true,
            group: false,
            ttl: self.config.max_ttl,
            payload: serde_json::to_vec(&record)?,
        })
    }

    fn flush_pending_texts(&mut self, peer: NodeId, now: Instant) {
        let Some(texts) = self.pending_texts.remove(&peer) else {
            return;
        };
        for pending in texts {
            if !self.sessions.has_session(&peer) {
                self.emit(NodeEvent::DeliveryFailed {
                    message_id: pending.message_id,
                    reason: DeliveryFailure::NoSession,
                });
                continue;
            }
            match self.build_direct_envelope(pending.message_id, peer, &pending.text) {
                Ok(envelope) => {
                    let mut flags = ChunkFlags::new().with_encrypted();
                    if pending.require_ack {
                        flags = flags.with_requires_ack();
                        self.reliability.track(envelope.clone(), flags, now);
                    }
                    let ops = self
                        .with_view(|router, view| router.send_envelope(envelope, flags, view, now));
                    self.execute_ops(ops, now);
                }
                Err(err) => {
                    tracing::warn!(to = %peer, %err, "queued text could not be sealed");
                    self.emit(NodeEvent::DeliveryFailed {
                        message_id: pending.message_id,
                        reason: DeliveryFailure::NoSession,
                    });
                }
            }
        }
    }

    fn send_group(&mut self, group: GroupId, text: &str) -> Result<MessageId, MeshError> {
        if !self.keyring.contains(&group) {
            return Err(MeshError::UnknownGroup);
        }
        let now = Instant::now();
        let message_id = MessageId::random();

        let sealed = self
            .keyring
            .encrypt_with_group(&mut OsRng, &group, text.as_bytes())?;
        let record = GroupCipherPayload {
            group_id: group,
            sealed: sealed.into(),
            sender: self.identity.node_id(),
            sender_name: self.name.clone(),
        };
        let envelope = Envelope {
            id: message_id,
            origin: self.identity.node_id(),
            origin_name: self.name.clone(),
            destination: group.address(),
            is_encrypted: true,
            group: true,
            ttl: self.config.max_ttl,
            payload: serde_json::to_vec(&record)?,
        };

        let conversation = ConversationId::Group(group);
        let title = self
            .conversations
            .get(&conversation)
            .map(|c| c.title.clone())
            .unwrap_or_default();
        self.conversations.add_outgoing(
            conversation,
            &title,
            StoredMessage {
                id: message_id,
                sender: self.identity.node_id(),
                sender_name: self.name.clone(),
                text: text.to_owned(),
                outgoing: true,
            },
        );

        let flags = ChunkFlags::new().with_encrypted();
        let ops = self.router.flood_envelope(envelope, flags, now);
        self.execute_ops(ops, now);
        Ok(message_id)
    }

    fn create_group(&mut self, name: &str) -> GroupId {
        let group = GroupId::generate(&mut OsRng);
        self.keyring.install(group, GroupKey::generate(&mut OsRng));
        self.conversations
            .register_group(group, name, vec![self.identity.node_id()]);
        tracing::info!(group = %group, name, "group created");
        group
    }

    fn add_member(&mut self, group: GroupId, member: NodeId) -> Result<(), MeshError> {
        let Some(key) = self.keyring.key(&group) else {
            return Err(MeshError::UnknownGroup);
        };
        let key_bytes = *key.as_bytes();
        let sealed = self
            .sessions
            .encrypt_for(&mut OsRng, &member, &key_bytes)?;

        self.conversations.add_group_member(&group, member);
        let members = self
            .conversations
            .group_members(&group)
            .map(<[NodeId]>::to_vec)
            .unwrap_or_default();
        let group_name = self
            .conversations
            .get(&ConversationId::Group(group))
            .map(|c| c.title.clone())
            .unwrap_or_default();

        let now = Instant::now();
        let grant = Control::Gkd(GroupKeyGrant {
            grant_id: MessageId::random(),
            group_id: group,
            group_name,
            origin: self.identity.node_id(),
            origin_name: self.name.clone(),
            destination: member,
            members,
            sealed_key: sealed.into(),
            ttl: self.config.max_ttl,
        });
        let ops = self.with_view(|router, view| router.send_addressed(grant, view, now));
        self.execute_ops(ops, now);
        Ok(())
    }

    fn mark_read(&mut self, conversation: ConversationId) {
        let unread = self.conversations.mark_read(&conversation);
        if !matches!(conversation, ConversationId::Direct(_)) {
            return;
        }
        let now = Instant::now();
        for (message_id, sender) in unread {
            let receipt = Control::Read(ReadReceipt {
                receipt_id: MessageId::random(),
                message_id,
                origin: self.identity.node_id(),
                destination: sender,
                ttl: self.config.max_ttl,
            });
            let ops = self.with_view(|router, view| router.send_addressed(receipt, view, now));
            self.execute_ops(ops, now);
        }
    }

    // ---- timers ----------------------------------------------------------

    fn on_retry_tick(&mut self, now: Instant) {
        for action in self.reliability.sweep_retries(now) {
            match action {
                RetryAction::Resend { envelope, flags } => {
                    let ops = self
                        .with_view(|router, view| router.send_envelope(envelope, flags, view, now));
                    self.execute_ops(ops, now);
                }
                RetryAction::Failed { message_id, .. } => {
                    self.emit(NodeEvent::DeliveryFailed {
                        message_id,
                        reason: DeliveryFailure::Timeout,
                    });
                }
            }
        }
        let ops = self.router.sweep_discoveries(now);
        self.execute_ops(ops, now);
    }

    fn on_expiry_tick(&mut self, now: Instant) {
        for message_id in self.reliability.sweep_expiry(now) {
            self.emit(NodeEvent::DeliveryFailed {
                message_id,
                reason: DeliveryFailure::Expired,
            });
        }
        self.reassembly.gc(now);
        self.router.gc(now);
    }

    fn on_discovery_failed(&mut self, destination: NodeId, undelivered: Vec<MessageId>) {
        for message_id in undelivered {
            self.reliability.cancel_tracking(&message_id);
            self.emit(NodeEvent::DeliveryFailed {
                message_id,
                reason: DeliveryFailure::NoRoute,
            });
        }
        if let Some(texts) = self.pending_texts.remove(&destination) {
            for pending in texts {
                self.emit(NodeEvent::DeliveryFailed {
                    message_id: pending.message_id,
                    reason: DeliveryFailure::NoRoute,
                });
            }
        }
    }

    fn install_remote_keys(&mut self, peer: NodeId, agreement: &[u8; 32], signing: &[u8; 32]) {
        if peer == self.identity.node_id() {
            return;
        }
        if let Err(err) = self.sessions.store_peer_agreement_key(peer, agreement) {
            tracing::warn!(peer = %peer, %err, "peer agreement key rejected");
            return;
        }
        if let Err(err) = self.sessions.store_peer_signing_key(peer, signing) {
            tracing::warn!(peer = %peer, %err, "peer signing key rejected");
        }
    }

    /// Remember a peer's display name. Returns whether it was new
    /// information.
    fn note_name(&mut self, peer: NodeId, name: &str) -> bool {
        if peer == self.identity.node_id() || name.is_empty() {
            return false;
        }
        match self.peer_names.insert(peer, name.to_owned()) {
            None => true,
            Some(previous) => previous != name,
        }
    }
}

/// The chunk-header MessageID a packet travels under: the enclosing
/// envelope's id for data, the record's own id for control traffic.
fn packet_chunk_id(packet: &Packet) -> MessageId {
    match packet {
        Packet::Data(envelope) => envelope.id,
        Packet::Control(control) => match control {
            Control::Rreq(r) => r.request_id,
            Control::Rrep(r) => r.request_id,
            Control::Announce(a) => a.announce_id,
            Control::Ack(a) => a.ack_id,
            Control::Read(r) => r.receipt_id,
            Control::Gkd(g) => g.grant_id,
            // Route errors carry no identifier; each transmission gets a
            // fresh one.
            Control::Rerr(_) => MessageId::random(),
        },
    }
}
