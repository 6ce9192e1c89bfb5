//! Shared helpers for Lantern integration tests.
//!
//! Builds whole nodes over the loopback radio so scenarios can script
//! topologies (who is in range of whom), inject frame loss, and observe
//! the node-event streams.

use lantern_core::{ConversationId, MeshConfig, MeshNode, NodeEvent, NodeHandle, StoredMessage};
use lantern_crypto::{Identity, NodeId};
use lantern_link::loopback::{LoopbackHub, LoopbackRadio};
use lantern_link::{LinkConfig, LinkIdentity, LinkLayer};
use rand_core::OsRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Install a subscriber so `RUST_LOG=debug cargo test` shows mesh traffic.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    tracing::debug!("tracing initialized for integration tests");
}

/// One node in a scripted mesh.
pub struct TestNode {
    /// Display name the node announces
    pub name: String,
    /// The node's identifier
    pub id: NodeId,
    /// Command handle
    pub handle: NodeHandle,
    /// Event stream
    pub events: UnboundedReceiver<NodeEvent>,
    /// The node's loopback radio, for topology scripting
    pub radio: Arc<LoopbackRadio>,
}

/// Spin up a full node (radio, link layer, mesh node) on a hub.
pub fn spawn_node(hub: &LoopbackHub, name: &str, config: MeshConfig) -> TestNode {
    let identity = Arc::new(Identity::generate(&mut OsRng));
    let (radio, radio_events) = hub.attach();

    let link_identity = LinkIdentity {
        node_id: identity.node_id(),
        name: name.to_owned(),
        agreement_key: identity.agreement_public_key(),
        signing_key: identity.signing_public_key(),
    };
    let (link, link_events) = LinkLayer::new(radio.clone(), LinkConfig::default(), link_identity);
    link.start(radio_events);

    let id = identity.node_id();
    let (node, handle, events) = MeshNode::new(identity, name, config, link, link_events)
        .expect("configuration should validate");
    tokio::spawn(node.run());

    TestNode {
        name: name.to_owned(),
        id,
        handle,
        events,
        radio,
    }
}

/// Wait for the first event the matcher accepts, panicking on timeout.
pub async fn next_matching<T>(
    node: &mut TestNode,
    timeout: Duration,
    mut matcher: impl FnMut(NodeEvent) -> Option<T>,
) -> T {
    let name = node.name.clone();
    tokio::time::timeout(timeout, async {
        loop {
            let event = node
                .events
                .recv()
                .await
                .unwrap_or_else(|| panic!("{name}: event channel closed"));
            if let Some(value) = matcher(event) {
                return value;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{name}: timed out waiting for event"))
}

/// Wait until the node reports a connection to `peer`.
pub async fn wait_connected(node: &mut TestNode, peer: NodeId) {
    next_matching(node, Duration::from_secs(5), |event| match event {
        NodeEvent::PeerConnected { peer: connected, .. } if connected == peer => Some(()),
        _ => None,
    })
    .await;
}

/// Wait for the next delivered message.
pub async fn expect_message(node: &mut TestNode, timeout: Duration) -> StoredMessage {
    next_matching(node, timeout, |event| match event {
        NodeEvent::MessageReceived { message, .. } => Some(message),
        _ => None,
    })
    .await
}

/// Wait for the next delivered message along with its conversation.
pub async fn expect_message_in(
    node: &mut TestNode,
    timeout: Duration,
) -> (ConversationId, StoredMessage) {
    next_matching(node, timeout, |event| match event {
        NodeEvent::MessageReceived {
            conversation,
            message,
        } => Some((conversation, message)),
        _ => None,
    })
    .await
}

/// Wait for a delivery confirmation of a specific message.
pub async fn expect_delivered(
    node: &mut TestNode,
    message_id: lantern_core::MessageId,
    timeout: Duration,
) {
    next_matching(node, timeout, |event| match event {
        NodeEvent::DeliveryConfirmed { message_id: id } if id == message_id => Some(()),
        _ => None,
    })
    .await;
}

/// Assert that no message is delivered to the node inside the window.
pub async fn assert_no_message(node: &mut TestNode, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, node.events.recv()).await {
            Ok(Some(NodeEvent::MessageReceived { message, .. })) => {
                panic!("{}: unexpected delivery of {:?}", node.name, message.text)
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}

/// A mesh configuration with short reliability timers, for retransmission
/// scenarios that should not take wall-clock minutes.
#[must_use]
pub fn fast_retry_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.reliability.base_retry_interval = Duration::from_millis(300);
    config.reliability.max_backoff_interval = Duration::from_secs(2);
    config.reliability.retry_tick = Duration::from_millis(100);
    config
}

/// A configuration whose presence beacons stop at direct neighbours, so
/// multi-hop reachability must come from route discovery.
#[must_use]
pub fn discovery_only_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.announce_hop_limit = 1;
    config
}
