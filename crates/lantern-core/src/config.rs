//! Mesh configuration.

use crate::chunk::CHUNK_HEADER_SIZE;
use crate::error::{ChunkError, MeshError};
use crate::reliability::RetryConfig;
use crate::router::RouterConfig;
use lantern_link::LinkConfig;
use std::time::Duration;

/// Configuration for a mesh node.
///
/// Defaults match the protocol's reference parameters; [`MeshConfig::validate`]
/// rejects combinations that cannot work (a fatal start-up error, not a
/// runtime one).
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Upper bound on envelope and RREQ hop counts
    pub max_ttl: u8,
    /// Transport unit assumed when negotiation is unavailable
    pub default_mtu: usize,
    /// Bytes reserved for the chunk header
    pub chunk_header_size: usize,
    /// Seen-cache and reassembly entry lifetime
    pub message_cache_expiry: Duration,
    /// How long a route discovery waits for a reply
    pub route_discovery_timeout: Duration,
    /// Idle window after which an unused route is discarded
    pub route_idle_timeout: Duration,
    /// Hop limit for presence beacons
    pub announce_hop_limit: u8,
    /// Seen-cache size bound
    pub seen_cache_capacity: usize,
    /// Link-layer tunables
    pub link: LinkConfig,
    /// Reliability tunables
    pub reliability: RetryConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_ttl: 3,
            default_mtu: 182,
            chunk_header_size: CHUNK_HEADER_SIZE,
            message_cache_expiry: Duration::from_secs(300),
            route_discovery_timeout: Duration::from_secs(7),
            route_idle_timeout: Duration::from_secs(600),
            announce_hop_limit: 2,
            seen_cache_capacity: 4096,
            link: LinkConfig::default(),
            reliability: RetryConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Check the configuration for fatal inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::MtuTooSmall`] (wrapped) if the chunk header
    /// cannot fit the configured MTU, or if the header size disagrees with
    /// the wire format.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.chunk_header_size != CHUNK_HEADER_SIZE
            || self.default_mtu <= self.chunk_header_size
            || self.link.default_mtu <= self.chunk_header_size
        {
            return Err(MeshError::Chunk(ChunkError::MtuTooSmall {
                mtu: self.default_mtu.min(self.link.default_mtu),
            }));
        }
        Ok(())
    }

    /// The router's slice of this configuration.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_ttl: self.max_ttl,
            discovery_timeout: self.route_discovery_timeout,
            route_idle_timeout: self.route_idle_timeout,
            announce_hop_limit: self.announce_hop_limit,
            seen_expiry: self.message_cache_expiry,
            seen_capacity: self.seen_cache_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tiny_mtu_is_fatal() {
        let mut config = MeshConfig::default();
        config.default_mtu = CHUNK_HEADER_SIZE;
        assert!(matches!(
            config.validate(),
            Err(MeshError::Chunk(ChunkError::MtuTooSmall { .. }))
        ));
    }

    #[test]
    fn test_wrong_header_size_is_fatal() {
        let mut config = MeshConfig::default();
        config.chunk_header_size = 24;
        assert!(config.validate().is_err());
    }
}
