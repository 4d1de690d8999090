//! Admission tickets.

use crate::gate::{EffectiveCaps, Gate};
use pylon_types::Priority;
use std::time::Instant;

/// The ephemeral right to hold one concurrency slot.
///
/// A ticket is minted by the [`Gate`] when a request is admitted and owns
/// two obligations: release exactly one slot of its kind, and do so on
/// every exit path. Dropping the ticket releases the slot, so a handler
/// that is cancelled mid-flight (client disconnect) still settles its
/// counters; [`Ticket::release`] exists for the explicit happy path.
pub struct Ticket {
    gate: Gate,
    key_id: String,
    api: String,
    caps: EffectiveCaps,
    is_sse: bool,
    priority: Priority,
    enqueued_at: Option<Instant>,
    admitted_at: Instant,
    released: bool,
}

impl Ticket {
    pub(crate) fn new(
        gate: Gate,
        key_id: String,
        api: String,
        caps: EffectiveCaps,
        is_sse: bool,
        priority: Priority,
        enqueued_at: Option<Instant>,
    ) -> Self {
        Self {
            gate,
            key_id,
            api,
            caps,
            is_sse,
            priority,
            enqueued_at,
            admitted_at: Instant::now(),
            released: false,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn is_sse(&self) -> bool {
        self.is_sse
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// When the request started waiting in the queue, if it did.
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }

    pub(crate) fn set_enqueued_at(&mut self, at: Instant) {
        self.enqueued_at = Some(at);
    }

    /// Re-labels a unary ticket as SSE when the downstream answers with an
    /// event stream. Swaps the held unary slot for an SSE slot; the caps
    /// captured at admission stay in force.
    pub fn convert_to_sse(&mut self) {
        if self.is_sse {
            return;
        }
        self.gate.bank().convert_to_sse(&self.key_id);
        self.is_sse = true;
    }

    /// Counts one forwarded SSE message against the shared rate windows.
    /// Returns `false` when the message would breach a cap; the stream must
    /// then be terminated.
    pub fn record_message(&self) -> bool {
        self.gate
            .bank()
            .record_message(&self.caps, &self.key_id, &self.api)
    }

    /// Releases the slot and wakes the queue. Idempotent with the drop path.
    pub fn release(mut self) {
        self.settle(true);
    }

    /// Releases the slot without waking the queue. Used by the wake loop
    /// when an admitted verdict could not be delivered: the loop itself
    /// hands the freed slot to the next waiter.
    pub(crate) fn release_without_wake(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, wake: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if wake {
            self.gate.on_ticket_release(&self.key_id, self.is_sse);
        } else {
            self.gate.bank().release(&self.key_id, self.is_sse);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.settle(true);
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("key_id", &self.key_id)
            .field("api", &self.api)
            .field("is_sse", &self.is_sse)
            .field("priority", &self.priority)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
