//! # Lantern Link
//!
//! Dual-role link layer for the Lantern mesh.
//!
//! Every node simultaneously **advertises** the mesh service (server role)
//! and **scans** for it (client role), so any two nodes can pair regardless
//! of which saw the other first. The link layer owns the radio session
//! lifecycle and delivers opaque frames in both directions:
//!
//! - Outbound to a peer we dialled: write to the peer's message endpoint.
//! - Outbound to a peer that subscribed to us: notify on our own endpoint.
//!
//! A peer counts as connected only once its message channel is bound *and*
//! both of its public keys are in hand; until then sends are rejected.
//!
//! The OS radio stack itself is behind the [`radio::RadioHal`] trait; the
//! [`loopback`] module provides the in-memory implementation used by tests
//! and simulations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod link;
pub mod loopback;
pub mod peer;
pub mod radio;
pub mod wire;

pub use error::LinkError;
pub use link::{LinkConfig, LinkEvent, LinkIdentity, LinkLayer};
pub use peer::{PeerRole, PeerState};
pub use radio::{Endpoint, RadioEvent, RadioHal, RadioHandle};
