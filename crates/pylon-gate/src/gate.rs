//! The admission controller.
//!
//! [`Gate::admit`] is the single entry point: it evaluates the counter bank,
//! parks concurrency-blocked requests in the wait queue, and turns every
//! path into either a [`Ticket`] or a [`RejectReason`]. It also owns the
//! policy snapshot handle: each request captures one snapshot at entry,
//! while queue wake-ups deliberately read the *current* policy, so a raised
//! limit lets waiters through.

use crate::bank::{BankSnapshot, CounterBank};
use crate::queue::{EnqueueOutcome, EntryKey, QueueVerdict, WaitQueue};
use crate::ticket::Ticket;
use parking_lot::RwLock;
use pylon_types::{CapOverrides, Caps, PolicySnapshot, Priority, RejectReason};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The caps that govern one request, resolved from the policy snapshot and
/// the key's overrides at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveCaps {
    pub user: Caps,
    pub global: Caps,
    /// Rate cap of the matched API pattern, if one matched.
    pub api_rpm: Option<u32>,
}

impl EffectiveCaps {
    pub fn resolve(policy: &PolicySnapshot, overrides: &CapOverrides, api: &str) -> Self {
        let defaults = policy.default_user;
        Self {
            user: Caps {
                max_concurrent: overrides.max_concurrent.unwrap_or(defaults.max_concurrent),
                max_rpm: overrides.max_rpm.unwrap_or(defaults.max_rpm),
                max_sse: overrides.max_sse.unwrap_or(defaults.max_sse),
            },
            global: policy.global,
            api_rpm: policy
                .api_limits
                .iter()
                .find(|limit| limit.pattern == api)
                .map(|limit| limit.max_rpm),
        }
    }
}

/// What became of an admission attempt.
#[derive(Debug)]
pub enum AdmissionOutcome {
    /// The request holds a slot and may be proxied.
    Admitted(Ticket),
    /// The request was refused; answer with the reason's status and code.
    Rejected(RejectReason),
}

struct GateInner {
    bank: CounterBank,
    queue: WaitQueue,
    policy: RwLock<Arc<PolicySnapshot>>,
}

/// The admission controller: counter bank + wait queue + policy handle.
///
/// Cheap to clone; all clones share one process-global state. Tickets hold
/// a clone so that releasing a slot (including via drop) can wake the
/// queue.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

/// Removes the queue entry if the admitting task is cancelled while parked.
/// Dropping the entry drops its oneshot sender, which is the cancellation
/// signal; disarmed once a verdict (or timeout) was observed.
struct ParkGuard<'a> {
    queue: &'a WaitQueue,
    key: EntryKey,
    armed: bool,
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(waiter) = self.queue.take(self.key) {
                tracing::debug!(key_id = %waiter.key_id, "queued request cancelled");
            }
        }
    }
}

impl Gate {
    pub fn new(policy: PolicySnapshot) -> Self {
        Self {
            inner: Arc::new(GateInner {
                bank: CounterBank::new(),
                queue: WaitQueue::new(),
                policy: RwLock::new(Arc::new(policy)),
            }),
        }
    }

    pub(crate) fn bank(&self) -> &CounterBank {
        &self.inner.bank
    }

    /// The snapshot a request captures at entry.
    pub fn current_policy(&self) -> Arc<PolicySnapshot> {
        self.inner.policy.read().clone()
    }

    /// Atomically installs a new policy. In-flight requests keep the
    /// snapshot they captured.
    pub fn install_policy(&self, policy: PolicySnapshot) {
        *self.inner.policy.write() = Arc::new(policy);
        tracing::info!("installed new policy snapshot");
    }

    /// Current number of queued waiters.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Live unary + SSE slot count, for the health endpoint.
    pub fn active_connections(&self) -> u32 {
        self.inner.bank.active_connections()
    }

    /// Counter view for the monitor surface.
    pub fn bank_snapshot(&self) -> BankSnapshot {
        self.inner.bank.snapshot()
    }

    /// Drops counter cells idle beyond the rate window.
    pub fn sweep_idle(&self) {
        self.inner.bank.sweep_idle();
    }

    /// Runs the admission pipeline for one validated request.
    ///
    /// `snapshot` is the policy captured at request entry; it governs the
    /// caps, the queue bound, and the wait deadline for this request.
    pub async fn admit(
        &self,
        key_id: &str,
        overrides: CapOverrides,
        priority: Priority,
        api: &str,
        is_sse: bool,
        snapshot: &PolicySnapshot,
    ) -> AdmissionOutcome {
        let caps = EffectiveCaps::resolve(snapshot, &overrides, api);

        match self.inner.bank.try_reserve(&caps, key_id, api, is_sse) {
            Ok(()) => AdmissionOutcome::Admitted(Ticket::new(
                self.clone(),
                key_id.to_string(),
                api.to_string(),
                caps,
                is_sse,
                priority,
                None,
            )),
            Err(hit) if hit.is_rate() => AdmissionOutcome::Rejected(hit.reject_reason()),
            Err(_) => {
                self.wait_for_slot(key_id, overrides, priority, api, is_sse, snapshot)
                    .await
            }
        }
    }

    /// Parks the request and awaits its verdict, enforcing the queue
    /// deadline and cleaning up on cancellation.
    async fn wait_for_slot(
        &self,
        key_id: &str,
        overrides: CapOverrides,
        priority: Priority,
        api: &str,
        is_sse: bool,
        snapshot: &PolicySnapshot,
    ) -> AdmissionOutcome {
        let enqueued_at = Instant::now();
        let (key, mut rx) = match self.inner.queue.enqueue(
            key_id,
            overrides,
            api,
            is_sse,
            priority,
            snapshot.queue.max_size,
        ) {
            EnqueueOutcome::Enqueued { key, rx } => (key, rx),
            EnqueueOutcome::Full => {
                return AdmissionOutcome::Rejected(RejectReason::QueueFull);
            }
        };

        let mut guard = ParkGuard {
            queue: &self.inner.queue,
            key,
            armed: true,
        };

        let deadline = Duration::from_secs(snapshot.queue.timeout_secs);
        let verdict = match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(verdict)) => Some(verdict),
            // Sender dropped without a verdict: queue torn down.
            Ok(Err(_)) => None,
            Err(_elapsed) => {
                match self.inner.queue.take(key) {
                    // Still parked: the deadline resolves this entry.
                    Some(_waiter) => None,
                    // A wake-up or preemption got there first; its verdict
                    // is imminent (senders resolve right after removal).
                    None => (&mut rx).await.ok(),
                }
            }
        };
        guard.armed = false;

        match verdict {
            Some(QueueVerdict::Admitted(mut ticket)) => {
                ticket.set_enqueued_at(enqueued_at);
                tracing::debug!(
                    key_id,
                    api,
                    waited_ms = enqueued_at.elapsed().as_millis() as u64,
                    "queued request admitted"
                );
                AdmissionOutcome::Admitted(ticket)
            }
            Some(QueueVerdict::RateLimited(reason)) => AdmissionOutcome::Rejected(reason),
            Some(QueueVerdict::Preempted) => AdmissionOutcome::Rejected(RejectReason::Preempted),
            None => AdmissionOutcome::Rejected(RejectReason::QueueTimeout),
        }
    }

    /// Called whenever a slot frees: releases the bank counters and offers
    /// the slot to the queue head.
    pub(crate) fn on_ticket_release(&self, key_id: &str, is_sse: bool) {
        self.inner.bank.release(key_id, is_sse);
        self.wake_next();
    }

    /// Offers a freed slot to the head waiter.
    ///
    /// Pops at most one waiter per call; caps are re-checked against the
    /// *current* policy, and a failure resolves the waiter rate-limited.
    /// The loop only continues when a verdict could not be delivered
    /// (the waiter was cancelled between parking and wake-up), in which
    /// case the freed slot is offered to the next waiter instead.
    fn wake_next(&self) {
        loop {
            let Some(waiter) = self.inner.queue.pop_first() else {
                return;
            };
            let policy = self.current_policy();
            let caps = EffectiveCaps::resolve(&policy, &waiter.overrides, &waiter.api);

            match self
                .inner
                .bank
                .try_reserve(&caps, &waiter.key_id, &waiter.api, waiter.is_sse)
            {
                Ok(()) => {
                    let ticket = Ticket::new(
                        self.clone(),
                        waiter.key_id.clone(),
                        waiter.api.clone(),
                        caps,
                        waiter.is_sse,
                        waiter.priority,
                        Some(waiter.enqueued_at),
                    );
                    match waiter.tx.send(QueueVerdict::Admitted(ticket)) {
                        Ok(()) => return,
                        Err(verdict) => {
                            if let QueueVerdict::Admitted(ticket) = verdict {
                                ticket.release_without_wake();
                            }
                            continue;
                        }
                    }
                }
                Err(hit) => {
                    let _ = waiter.tx.send(QueueVerdict::RateLimited(hit.reject_reason()));
                    return;
                }
            }
        }
    }
}
