//! Chunk reassembly with timeout-based garbage collection.
//!
//! Reassembly is keyed by MessageID alone, not by source: identifiers are
//! 128-bit random values, so cross-source collisions are negligible and a
//! message whose chunks arrive over different links still assembles.

use crate::chunk::{Chunk, ChunkFlags};
use crate::envelope::MessageId;
use crate::error::ChunkError;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    /// The message identifier
    pub message_id: MessageId,
    /// Payload bytes, concatenated in index order
    pub payload: Vec<u8>,
    /// Union of the flags seen across the message's chunks
    pub flags: ChunkFlags,
}

struct Entry {
    total: u8,
    flags: ChunkFlags,
    parts: HashMap<u16, Vec<u8>>,
    first_seen: Instant,
}

/// Pending per-message reassembly state.
pub struct ReassemblyBuffer {
    entries: HashMap<MessageId, Entry>,
    expiry: Duration,
}

impl ReassemblyBuffer {
    /// Create a buffer whose entries expire after `expiry`.
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            expiry,
        }
    }

    /// Offer one chunk.
    ///
    /// Chunks may arrive in any order; a duplicate index keeps the first
    /// copy. Returns the reassembled message once every index in
    /// `[0, total)` is present, deleting the entry.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::ReassemblyMismatch`] if the chunk disagrees
    /// with the entry's recorded total; the chunk is discarded and the
    /// entry left untouched.
    pub fn offer(&mut self, chunk: Chunk, now: Instant) -> Result<Option<Reassembled>, ChunkError> {
        let entry = self.entries.entry(chunk.message_id).or_insert_with(|| Entry {
            total: chunk.total,
            flags: ChunkFlags::new(),
            parts: HashMap::new(),
            first_seen: now,
        });

        if entry.total != chunk.total {
            return Err(ChunkError::ReassemblyMismatch {
                message_id: chunk.message_id,
                expected: entry.total,
                actual: chunk.total,
            });
        }

        entry.flags = entry.flags.union(chunk.flags);
        entry.parts.entry(chunk.index).or_insert(chunk.payload);

        if entry.parts.len() < usize::from(entry.total) {
            return Ok(None);
        }

        let mut entry = match self.entries.remove(&chunk.message_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let mut payload = Vec::new();
        for index in 0..u16::from(entry.total) {
            match entry.parts.remove(&index) {
                Some(part) => payload.extend_from_slice(&part),
                None => return Ok(None),
            }
        }
        Ok(Some(Reassembled {
            message_id: chunk.message_id,
            payload,
            flags: entry.flags,
        }))
    }

    /// Drop entries older than the expiry, returning how many were
    /// collected.
    pub fn gc(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.first_seen) < self.expiry);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "reassembly gc collected stale entries");
        }
        dropped
    }

    /// Number of messages currently mid-reassembly.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}
