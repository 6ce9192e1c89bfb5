//! End-to-end delivery tracking with exponential-backoff retries.
//!
//! Envelopes flagged requires-ack are tracked until the destination's
//! acknowledgement arrives. A one-second tick retries overdue entries with
//! `min(base * 2^n + jitter, cap)` spacing; a slower tick expires entries
//! that outlive the message expiry and purges terminal ones. Delivered is
//! terminal: at most one delivered transition per message, and duplicate
//! acknowledgements are no-ops.

use crate::chunk::ChunkFlags;
use crate::envelope::{Envelope, MessageId};
use lantern_crypto::NodeId;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Reliability tunables.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Exponential-backoff base
    pub base_retry_interval: Duration,
    /// Cap on the retry interval
    pub max_backoff_interval: Duration,
    /// Retries before giving up
    pub max_retries: u32,
    /// Cadence of the retry sweep
    pub retry_tick: Duration,
    /// Cadence of the expiry sweep
    pub expiry_tick: Duration,
    /// Age at which undelivered entries expire and terminal ones purge
    pub message_expiry: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_retry_interval: Duration::from_secs(5),
            max_backoff_interval: Duration::from_secs(60),
            max_retries: 3,
            retry_tick: Duration::from_secs(1),
            expiry_tick: Duration::from_secs(30),
            message_expiry: Duration::from_secs(300),
        }
    }
}

/// Delivery state of a tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted but not yet handed to the router
    Pending,
    /// On the wire, awaiting acknowledgement
    Sent,
    /// Acknowledged by the destination (terminal)
    Delivered,
    /// Retries exhausted (terminal)
    Failed,
    /// Outlived the message expiry without resolution (terminal)
    Expired,
}

/// Bookkeeping for one in-flight message.
#[derive(Debug, Clone)]
pub struct TrackedMessage {
    /// The message being tracked
    pub message_id: MessageId,
    /// Original envelope, kept for retransmission
    pub envelope: Envelope,
    /// Chunk flags the envelope is sent under
    pub flags: ChunkFlags,
    /// The destination expected to acknowledge
    pub destination: NodeId,
    /// Current status
    pub status: DeliveryStatus,
    /// Retries performed so far
    pub retry_count: u32,
    /// When tracking began
    pub created_at: Instant,
    /// When the envelope last went out
    pub last_attempt: Instant,
    /// When the acknowledgement arrived
    pub delivered_at: Option<Instant>,
}

/// Work produced by the retry sweep.
#[derive(Debug, Clone)]
pub enum RetryAction {
    /// Re-emit the envelope to the router
    Resend {
        /// The envelope to retransmit (same MessageID)
        envelope: Envelope,
        /// Chunk flags to carry
        flags: ChunkFlags,
    },
    /// Retries exhausted; surface the failure
    Failed {
        /// The failed message
        message_id: MessageId,
        /// Its destination
        destination: NodeId,
    },
}

/// Tracks acknowledgements for envelopes that requested them.
pub struct ReliabilityTracker {
    config: RetryConfig,
    tracked: HashMap<MessageId, TrackedMessage>,
}

impl ReliabilityTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            tracked: HashMap::new(),
        }
    }

    /// Begin tracking an envelope that was just handed to the router.
    pub fn track(&mut self, envelope: Envelope, flags: ChunkFlags, now: Instant) {
        let message_id = envelope.id;
        let destination = envelope.destination;
        self.tracked.insert(
            message_id,
            TrackedMessage {
                message_id,
                envelope,
                flags,
                destination,
                status: DeliveryStatus::Sent,
                retry_count: 0,
                created_at: now,
                last_attempt: now,
                delivered_at: None,
            },
        );
    }

    /// Record an acknowledgement.
    ///
    /// Returns `true` only on the first acknowledgement of a still-live
    /// entry; duplicates and unknown ids return `false` and change
    /// nothing.
    pub fn on_ack(&mut self, message_id: &MessageId, now: Instant) -> bool {
        let Some(entry) = self.tracked.get_mut(message_id) else {
            return false;
        };
        match entry.status {
            DeliveryStatus::Pending | DeliveryStatus::Sent => {
                entry.status = DeliveryStatus::Delivered;
                entry.delivered_at = Some(now);
                tracing::debug!(id = %message_id, "delivery confirmed");
                true
            }
            DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Expired => false,
        }
    }

    /// Stop tracking a message (e.g. its discovery failed).
    ///
    /// Returns whether an entry was removed.
    pub fn cancel_tracking(&mut self, message_id: &MessageId) -> bool {
        self.tracked.remove(message_id).is_some()
    }

    /// Whether a message is still awaiting its acknowledgement.
    #[must_use]
    pub fn is_awaiting_ack(&self, message_id: &MessageId) -> bool {
        self.tracked
            .get(message_id)
            .is_some_and(|e| matches!(e.status, DeliveryStatus::Pending | DeliveryStatus::Sent))
    }

    /// Inspect a tracked entry.
    #[must_use]
    pub fn status_of(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        self.tracked.get(message_id).map(|e| e.status)
    }

    /// The retry sweep: retransmit overdue entries, fail exhausted ones.
    pub fn sweep_retries(&mut self, now: Instant) -> Vec<RetryAction> {
        let mut actions = Vec::new();
        for entry in self.tracked.values_mut() {
            if entry.status != DeliveryStatus::Sent {
                continue;
            }
            let due = retry_interval(&self.config, entry.retry_count);
            if now.duration_since(entry.last_attempt) < due {
                continue;
            }
            if entry.retry_count < self.config.max_retries {
                entry.retry_count += 1;
                entry.last_attempt = now;
                tracing::debug!(
                    id = %entry.message_id,
                    attempt = entry.retry_count,
                    "retrying delivery"
                );
                actions.push(RetryAction::Resend {
                    envelope: entry.envelope.clone(),
                    flags: entry.flags,
                });
            } else {
                entry.status = DeliveryStatus::Failed;
                tracing::debug!(id = %entry.message_id, "retries exhausted");
                actions.push(RetryAction::Failed {
                    message_id: entry.message_id,
                    destination: entry.destination,
                });
            }
        }
        actions
    }

    /// The expiry sweep: expire stale live entries, purge stale terminal
    /// ones. Returns the ids that expired this pass.
    pub fn sweep_expiry(&mut self, now: Instant) -> Vec<MessageId> {
        let expiry = self.config.message_expiry;
        let mut expired = Vec::new();
        self.tracked.retain(|id, entry| {
            if now.duration_since(entry.created_at) < expiry {
                return true;
            }
            match entry.status {
                DeliveryStatus::Pending | DeliveryStatus::Sent => {
                    entry.status = DeliveryStatus::Expired;
                    expired.push(*id);
                    true
                }
                DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Expired => {
                    false
                }
            }
        });
        expired
    }

    /// Number of tracked entries (any status).
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }
}

/// `min(base * 2^n + jitter[0, base), cap)`.
fn retry_interval(config: &RetryConfig, retry_count: u32) -> Duration {
    let base = config.base_retry_interval;
    let backoff = base.saturating_mul(1u32 << retry_count.min(16));
    let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
    (backoff + jitter).min(config.max_backoff_interval)
}
