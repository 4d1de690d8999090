//! The bounded priority wait queue.
//!
//! Concurrency-blocked requests park here until a slot frees, their deadline
//! elapses, or a higher-priority arrival preempts them. One ordered map
//! holds every waiter, keyed by (priority desc, arrival seq asc): the first
//! entry is the next to wake, the last entry is the preemption victim
//! candidate. Each waiter owns a oneshot receiver; whichever path removes
//! the entry from the map is the one that resolves it, so every entry
//! reaches exactly one terminal outcome.

use crate::ticket::Ticket;
use parking_lot::Mutex;
use pylon_types::{CapOverrides, Priority, RejectReason};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;

/// Map key: `Reverse` puts `High` first; the sequence breaks ties FIFO.
pub(crate) type EntryKey = (Reverse<Priority>, u64);

/// How a queue entry was resolved.
#[derive(Debug)]
pub(crate) enum QueueVerdict {
    /// A slot was reserved on the waiter's behalf; the ticket carries it.
    Admitted(Ticket),
    /// A rate cap failed at wake-up time.
    RateLimited(RejectReason),
    /// Evicted by a higher-priority arrival.
    Preempted,
}

/// A parked request.
pub(crate) struct Waiter {
    pub key_id: String,
    pub overrides: CapOverrides,
    pub api: String,
    pub is_sse: bool,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub tx: oneshot::Sender<QueueVerdict>,
}

/// Result of an enqueue attempt.
pub(crate) enum EnqueueOutcome {
    /// The waiter was parked; await the receiver for its verdict.
    Enqueued {
        key: EntryKey,
        rx: oneshot::Receiver<QueueVerdict>,
    },
    /// The queue was full and no strictly-lower-priority victim existed.
    Full,
}

/// The process-global wait queue.
pub struct WaitQueue {
    entries: Mutex<BTreeMap<EntryKey, Waiter>>,
    seq: AtomicU64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Current number of waiters (the queue-size gauge).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parks a waiter, preempting the lowest-priority tail entry when the
    /// queue is full and that entry's priority is strictly lower than the
    /// arrival's. The evicted waiter is resolved `Preempted` on the spot.
    pub(crate) fn enqueue(
        &self,
        key_id: &str,
        overrides: CapOverrides,
        api: &str,
        is_sse: bool,
        priority: Priority,
        max_size: u32,
    ) -> EnqueueOutcome {
        let mut entries = self.entries.lock();

        if entries.len() >= max_size as usize {
            let victim_key = match entries.last_key_value() {
                Some((key, _)) if key.0 .0 < priority => *key,
                _ => return EnqueueOutcome::Full,
            };
            // Unwrap is fine: the key was just observed under this lock.
            let victim = entries.remove(&victim_key).unwrap();
            tracing::debug!(
                victim_key = %victim.key_id,
                victim_priority = %victim.priority,
                arrival_priority = %priority,
                "preempting queued request"
            );
            let _ = victim.tx.send(QueueVerdict::Preempted);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = (Reverse(priority), seq);
        let (tx, rx) = oneshot::channel();
        entries.insert(
            key,
            Waiter {
                key_id: key_id.to_string(),
                overrides,
                api: api.to_string(),
                is_sse,
                priority,
                enqueued_at: Instant::now(),
                tx,
            },
        );

        EnqueueOutcome::Enqueued { key, rx }
    }

    /// Removes and returns the head waiter (highest priority, earliest
    /// arrival), if any.
    pub(crate) fn pop_first(&self) -> Option<Waiter> {
        self.entries.lock().pop_first().map(|(_, waiter)| waiter)
    }

    /// Removes a specific entry, if it is still parked. Used by the timeout
    /// and cancellation paths; returning `None` means another path already
    /// resolved (or is about to resolve) the entry.
    pub(crate) fn take(&self, key: EntryKey) -> Option<Waiter> {
        self.entries.lock().remove(&key)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
