//! Duplicate suppression for flooded traffic.
//!
//! A bounded set of `(MessageId, origin)` pairs with insertion timestamps.
//! Applied uniformly to data-envelope floods, route requests, announces,
//! and addressed control records: the pair is recorded on first acceptance
//! and later copies inside the expiry window are dropped before any
//! forwarding work.

use crate::envelope::MessageId;
use lantern_crypto::NodeId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

type SeenKey = (MessageId, NodeId);

/// Bounded, time-expiring seen-message cache.
pub struct SeenCache {
    entries: HashMap<SeenKey, Instant>,
    order: VecDeque<(SeenKey, Instant)>,
    expiry: Duration,
    capacity: usize,
}

impl SeenCache {
    /// Create a cache with the given entry lifetime and size bound.
    #[must_use]
    pub fn new(expiry: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            expiry,
            capacity,
        }
    }

    /// Record a sighting.
    ///
    /// Returns `true` if this is the first sighting inside the expiry
    /// window (the caller should process the message) and `false` for a
    /// duplicate (the caller must drop it).
    pub fn check_and_insert(&mut self, id: MessageId, origin: NodeId, now: Instant) -> bool {
        let key = (id, origin);
        if let Some(&seen_at) = self.entries.get(&key) {
            if now.duration_since(seen_at) < self.expiry {
                return false;
            }
        }
        self.entries.insert(key, now);
        self.order.push_back((key, now));
        self.evict_over_capacity();
        true
    }

    /// Whether a pair is currently recorded.
    #[must_use]
    pub fn contains(&self, id: &MessageId, origin: &NodeId, now: Instant) -> bool {
        self.entries
            .get(&(*id, *origin))
            .is_some_and(|&seen_at| now.duration_since(seen_at) < self.expiry)
    }

    /// Drop entries older than the expiry window.
    pub fn gc(&mut self, now: Instant) {
        while let Some(&(key, queued_at)) = self.order.front() {
            if now.duration_since(queued_at) < self.expiry {
                break;
            }
            self.order.pop_front();
            // Only drop the live entry if it is the one we queued; the key
            // may have been re-recorded since.
            if self.entries.get(&key) == Some(&queued_at) {
                self.entries.remove(&key);
            }
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((key, queued_at)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&key) == Some(&queued_at) {
                self.entries.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u8) -> (MessageId, NodeId) {
        (
            MessageId::from_bytes([n; 16]),
            NodeId::from_bytes([n.wrapping_add(1); 16]),
        )
    }

    #[test]
    fn test_first_sighting_accepts_second_drops() {
        let mut cache = SeenCache::new(Duration::from_secs(300), 1024);
        let now = Instant::now();
        let (id, origin) = ids(1);

        assert!(cache.check_and_insert(id, origin, now));
        assert!(!cache.check_and_insert(id, origin, now));
        assert!(!cache.check_and_insert(id, origin, now + Duration::from_secs(299)));
    }

    #[test]
    fn test_same_id_different_origin_is_distinct() {
        let mut cache = SeenCache::new(Duration::from_secs(300), 1024);
        let now = Instant::now();
        let id = MessageId::from_bytes([1u8; 16]);

        assert!(cache.check_and_insert(id, NodeId::from_bytes([2u8; 16]), now));
        assert!(cache.check_and_insert(id, NodeId::from_bytes([3u8; 16]), now));
    }

    #[test]
    fn test_expired_entry_accepts_again() {
        let mut cache = SeenCache::new(Duration::from_secs(300), 1024);
        let start = Instant::now();
        let (id, origin) = ids(1);

        assert!(cache.check_and_insert(id, origin, start));
        assert!(cache.check_and_insert(id, origin, start + Duration::from_secs(301)));
    }

    #[test]
    fn test_gc_then_reinsert_survives_stale_tombstone() {
        let mut cache = SeenCache::new(Duration::from_secs(300), 1024);
        let start = Instant::now();
        let (id, origin) = ids(1);

        cache.check_and_insert(id, origin, start);
        // Re-record after expiry, leaving a stale queue entry behind.
        cache.check_and_insert(id, origin, start + Duration::from_secs(400));
        cache.gc(start + Duration::from_secs(400));

        // The fresh recording must still suppress duplicates.
        assert!(!cache.check_and_insert(id, origin, start + Duration::from_secs(401)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = SeenCache::new(Duration::from_secs(300), 4);
        let now = Instant::now();
        for n in 0..6u8 {
            let (id, origin) = ids(n);
            cache.check_and_insert(id, origin, now);
        }
        assert!(cache.len() <= 4);

        // The newest entries are still suppressing.
        let (id, origin) = ids(5);
        assert!(!cache.check_and_insert(id, origin, now));
    }
}
