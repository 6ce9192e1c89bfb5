//! # Lantern Core
//!
//! Core mesh protocol for Lantern: a peer-to-peer store-and-forward
//! messaging mesh over short-range dual-role radio links.
//!
//! This crate provides:
//! - **Chunking and reassembly**: envelopes split into transport-sized
//!   fragments with timeout-based garbage collection
//! - **On-demand routing**: AODV-style route request/reply/error with
//!   duplicate suppression, TTL-bounded flooding, and a next-hop cache
//! - **Reliability**: per-message acknowledgement tracking with
//!   exponential-backoff retries and expiry
//! - **Envelope dispatch**: end-to-end encrypted envelopes, local
//!   delivery, relay forwarding, and control-plane dispatch
//! - **Conversations**: the receive-side bookkeeping the router
//!   terminates into
//!
//! ## Quick Start
//!
//! ```no_run
//! use lantern_core::{MeshConfig, MeshNode};
//! use lantern_crypto::Identity;
//! use lantern_link::loopback::LoopbackHub;
//! use lantern_link::{LinkConfig, LinkIdentity, LinkLayer};
//! use rand_core::OsRng;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = Arc::new(Identity::generate(&mut OsRng));
//! let hub = LoopbackHub::new();
//! let (radio, radio_events) = hub.attach();
//!
//! let (link, link_events) = LinkLayer::new(
//!     radio,
//!     LinkConfig::default(),
//!     LinkIdentity {
//!         node_id: identity.node_id(),
//!         name: "alice".into(),
//!         agreement_key: identity.agreement_public_key(),
//!         signing_key: identity.signing_public_key(),
//!     },
//! );
//! link.start(radio_events);
//!
//! let (node, handle, mut events) =
//!     MeshNode::new(identity, "alice", MeshConfig::default(), link, link_events)?;
//! tokio::spawn(node.run());
//!
//! let peer = /* learned from a PeerConnected event */
//! #     handle.node_id();
//! handle.send_private(peer, "hi", true).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod config;
pub mod control;
pub mod conversation;
pub mod envelope;
pub mod error;
pub mod node;
pub mod reassembly;
pub mod reliability;
pub mod router;
pub mod seen;

pub use chunk::{Chunk, ChunkFlags, CHUNK_HEADER_SIZE};
pub use config::MeshConfig;
pub use control::Control;
pub use conversation::{Conversation, ConversationId, ConversationSummary, StoredMessage};
pub use envelope::{Envelope, MessageId, Packet};
pub use error::{ChunkError, MeshError};
pub use node::{DeliveryFailure, MeshNode, NodeEvent, NodeHandle};
pub use reassembly::{Reassembled, ReassemblyBuffer};
pub use reliability::{DeliveryStatus, ReliabilityTracker, RetryConfig};
pub use router::{RouteEntry, RouteOp, Router, RouterConfig, RouterView};
pub use seen::SeenCache;
