//! The counter bank: gauges and rate windows backing admission decisions.
//!
//! Two counter families exist per dimension:
//!
//! - **gauges** — integer counts of currently active unary requests and SSE
//!   connections;
//! - **rate windows** — timestamps of admission/message events within the
//!   trailing 60 seconds, trimmed on every access. Unary admissions and SSE
//!   messages share one window per dimension.
//!
//! A reserve verifies every applicable cap and commits all increments while
//! holding the affected cell locks, so no interleaving of reserves and
//! releases can admit a request past a cap. Lock order is fixed (key cell,
//! then API window, then global cell) to keep the fine-grained locks
//! deadlock-free.

use crate::gate::EffectiveCaps;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Length of the rate window.
const WINDOW: Duration = Duration::from_secs(60);

/// The cap that blocked a reserve, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapHit {
    UserRpm,
    ApiRpm,
    GlobalRpm,
    UserConcurrency,
    GlobalConcurrency,
    UserSse,
    GlobalSse,
}

impl CapHit {
    /// Rate hits are terminal (429); concurrency hits route to the queue.
    pub fn is_rate(self) -> bool {
        matches!(self, Self::UserRpm | Self::ApiRpm | Self::GlobalRpm)
    }

    /// The rejection reason a request blocked by this cap answers with.
    pub fn reject_reason(self) -> pylon_types::RejectReason {
        use pylon_types::RejectReason;
        match self {
            Self::UserRpm | Self::UserConcurrency | Self::UserSse => RejectReason::UserLimit,
            Self::ApiRpm => RejectReason::ApiLimit,
            Self::GlobalRpm | Self::GlobalConcurrency | Self::GlobalSse => {
                RejectReason::SystemBusy
            }
        }
    }
}

/// Event timestamps within the trailing window.
#[derive(Debug, Default)]
struct Window {
    events: VecDeque<Instant>,
}

impl Window {
    /// Trims expired events and returns the current count.
    fn count(&mut self, now: Instant) -> usize {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) >= WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len()
    }

    fn record(&mut self, now: Instant) {
        self.events.push_back(now);
    }
}

/// Per-key counter cell.
#[derive(Debug)]
struct KeyCell {
    unary_active: u32,
    sse_active: u32,
    window: Window,
    last_used: Instant,
}

impl KeyCell {
    fn new(now: Instant) -> Self {
        Self {
            unary_active: 0,
            sse_active: 0,
            window: Window::default(),
            last_used: now,
        }
    }
}

/// The global counter cell.
#[derive(Debug, Default)]
struct GlobalCell {
    unary_active: u32,
    sse_active: u32,
    window: Window,
}

/// Per-key counters as exposed on the monitor surface.
#[derive(Debug, Clone, Serialize)]
pub struct KeyCounters {
    pub key_id: String,
    pub unary_active: u32,
    pub sse_active: u32,
    pub requests_last_minute: usize,
}

/// A point-in-time view of the bank for the monitor surface.
#[derive(Debug, Clone, Serialize)]
pub struct BankSnapshot {
    pub unary_active: u32,
    pub sse_active: u32,
    pub requests_last_minute: usize,
    pub keys: Vec<KeyCounters>,
}

/// Process-global gauges and windows keyed by (dimension, identity).
///
/// Cells are created lazily on first use and swept once idle for longer
/// than the window (see [`CounterBank::sweep_idle`]).
pub struct CounterBank {
    keys: DashMap<String, Arc<Mutex<KeyCell>>>,
    apis: DashMap<String, Arc<Mutex<Window>>>,
    global: Mutex<GlobalCell>,
}

impl CounterBank {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            apis: DashMap::new(),
            global: Mutex::new(GlobalCell::default()),
        }
    }

    fn key_cell(&self, key_id: &str, now: Instant) -> Arc<Mutex<KeyCell>> {
        self.keys
            .entry(key_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(KeyCell::new(now))))
            .clone()
    }

    fn api_window(&self, api: &str) -> Arc<Mutex<Window>> {
        self.apis
            .entry(api.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Window::default())))
            .clone()
    }

    /// Attempts to reserve one concurrency slot of the requested kind.
    ///
    /// Caps are evaluated in a fixed order — user rpm, API rpm, global rpm,
    /// then the concurrency gauges of the requested kind — and the first
    /// violated cap is reported. On success every applicable gauge is
    /// incremented and, for unary requests, the admission is recorded in the
    /// shared rate windows. SSE admissions consume no window budget; their
    /// messages are counted individually via [`CounterBank::record_message`].
    pub fn try_reserve(
        &self,
        caps: &EffectiveCaps,
        key_id: &str,
        api: &str,
        is_sse: bool,
    ) -> Result<(), CapHit> {
        let now = Instant::now();
        let key_cell = self.key_cell(key_id, now);
        let mut key = key_cell.lock();
        key.last_used = now;

        let api_window = caps.api_rpm.map(|_| self.api_window(api));
        let mut api_guard = api_window.as_ref().map(|w| w.lock());
        let mut global = self.global.lock();

        if key.window.count(now) >= caps.user.max_rpm as usize {
            return Err(CapHit::UserRpm);
        }
        if let (Some(cap), Some(window)) = (caps.api_rpm, api_guard.as_deref_mut()) {
            if window.count(now) >= cap as usize {
                return Err(CapHit::ApiRpm);
            }
        }
        if global.window.count(now) >= caps.global.max_rpm as usize {
            return Err(CapHit::GlobalRpm);
        }

        if is_sse {
            if key.sse_active >= caps.user.max_sse {
                return Err(CapHit::UserSse);
            }
            if global.sse_active >= caps.global.max_sse {
                return Err(CapHit::GlobalSse);
            }
            key.sse_active += 1;
            global.sse_active += 1;
        } else {
            if key.unary_active >= caps.user.max_concurrent {
                return Err(CapHit::UserConcurrency);
            }
            if global.unary_active >= caps.global.max_concurrent {
                return Err(CapHit::GlobalConcurrency);
            }
            key.unary_active += 1;
            global.unary_active += 1;
            key.window.record(now);
            if let Some(window) = api_guard.as_deref_mut() {
                window.record(now);
            }
            global.window.record(now);
        }

        Ok(())
    }

    /// Releases one slot of the given kind. Unconditional: a release never
    /// fails, and a decrement below zero clamps and logs (it indicates a
    /// double release upstream).
    pub fn release(&self, key_id: &str, is_sse: bool) {
        let now = Instant::now();
        match self.keys.get(key_id) {
            Some(cell) => {
                let mut key = cell.lock();
                key.last_used = now;
                let gauge = if is_sse {
                    &mut key.sse_active
                } else {
                    &mut key.unary_active
                };
                decrement(gauge, key_id, is_sse);
            }
            None => {
                tracing::error!(key_id, is_sse, "release for untracked key cell");
            }
        }

        let mut global = self.global.lock();
        let gauge = if is_sse {
            &mut global.sse_active
        } else {
            &mut global.unary_active
        };
        decrement(gauge, "<global>", is_sse);
    }

    /// Swaps a held unary slot for an SSE slot, when the downstream answers
    /// a unary-admitted request with an event stream. The swap is
    /// unconditional: the request was already admitted, so SSE caps are not
    /// re-evaluated mid-flight.
    pub fn convert_to_sse(&self, key_id: &str) {
        let now = Instant::now();
        if let Some(cell) = self.keys.get(key_id) {
            let mut key = cell.lock();
            key.last_used = now;
            decrement(&mut key.unary_active, key_id, false);
            key.sse_active += 1;
        } else {
            tracing::error!(key_id, "sse conversion for untracked key cell");
        }

        let mut global = self.global.lock();
        decrement(&mut global.unary_active, "<global>", false);
        global.sse_active += 1;
    }

    /// Counts one SSE message against the shared rate windows.
    ///
    /// Returns `false` without recording anything when the message would
    /// breach any rpm cap; the caller then terminates the stream.
    pub fn record_message(&self, caps: &EffectiveCaps, key_id: &str, api: &str) -> bool {
        let now = Instant::now();
        let key_cell = self.key_cell(key_id, now);
        let mut key = key_cell.lock();
        key.last_used = now;

        let api_window = caps.api_rpm.map(|_| self.api_window(api));
        let mut api_guard = api_window.as_ref().map(|w| w.lock());
        let mut global = self.global.lock();

        if key.window.count(now) >= caps.user.max_rpm as usize {
            return false;
        }
        if let (Some(cap), Some(window)) = (caps.api_rpm, api_guard.as_deref_mut()) {
            if window.count(now) >= cap as usize {
                return false;
            }
        }
        if global.window.count(now) >= caps.global.max_rpm as usize {
            return false;
        }

        key.window.record(now);
        if let Some(window) = api_guard.as_deref_mut() {
            window.record(now);
        }
        global.window.record(now);
        true
    }

    /// Captures current gauge and window values for the monitor surface.
    pub fn snapshot(&self) -> BankSnapshot {
        let now = Instant::now();
        let (unary_active, sse_active, requests_last_minute) = {
            let mut global = self.global.lock();
            (
                global.unary_active,
                global.sse_active,
                global.window.count(now),
            )
        };

        let mut keys = Vec::new();
        for entry in self.keys.iter() {
            let mut cell = entry.value().lock();
            let counters = KeyCounters {
                key_id: entry.key().clone(),
                unary_active: cell.unary_active,
                sse_active: cell.sse_active,
                requests_last_minute: cell.window.count(now),
            };
            if counters.unary_active > 0
                || counters.sse_active > 0
                || counters.requests_last_minute > 0
            {
                keys.push(counters);
            }
        }
        keys.sort_by(|a, b| a.key_id.cmp(&b.key_id));

        BankSnapshot {
            unary_active,
            sse_active,
            requests_last_minute,
            keys,
        }
    }

    /// Drops key cells idle for longer than the window and API windows with
    /// no remaining events.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        self.keys.retain(|_, cell| {
            let mut key = cell.lock();
            key.unary_active > 0
                || key.sse_active > 0
                || key.window.count(now) > 0
                || now.duration_since(key.last_used) < WINDOW
        });
        self.apis.retain(|_, window| window.lock().count(now) > 0);
    }

    /// Current number of live unary + SSE slots, for the health endpoint.
    pub fn active_connections(&self) -> u32 {
        let global = self.global.lock();
        global.unary_active + global.sse_active
    }
}

impl Default for CounterBank {
    fn default() -> Self {
        Self::new()
    }
}

fn decrement(gauge: &mut u32, key: &str, is_sse: bool) {
    if *gauge == 0 {
        tracing::error!(key, is_sse, "gauge decrement below zero; clamping");
    } else {
        *gauge -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylon_types::Caps;

    fn caps(user: Caps, global: Caps, api_rpm: Option<u32>) -> EffectiveCaps {
        EffectiveCaps {
            user,
            global,
            api_rpm,
        }
    }

    fn wide(max: u32) -> Caps {
        Caps {
            max_concurrent: max,
            max_rpm: max,
            max_sse: max,
        }
    }

    #[test]
    fn reserve_increments_and_release_decrements() {
        let bank = CounterBank::new();
        let c = caps(wide(10), wide(10), None);

        bank.try_reserve(&c, "k", "GET /x", false).unwrap();
        assert_eq!(bank.active_connections(), 1);

        bank.release("k", false);
        assert_eq!(bank.active_connections(), 0);
    }

    #[test]
    fn user_rpm_is_checked_before_concurrency() {
        let bank = CounterBank::new();
        let c = caps(
            Caps {
                max_concurrent: 0,
                max_rpm: 0,
                max_sse: 0,
            },
            wide(10),
            None,
        );
        // Both rpm and concurrency are exhausted; the rpm hit must win.
        assert_eq!(
            bank.try_reserve(&c, "k", "GET /x", false),
            Err(CapHit::UserRpm)
        );
    }

    #[test]
    fn cap_evaluation_order_user_api_global() {
        let bank = CounterBank::new();

        // Fill one request so every rpm dimension sits at 1.
        let open = caps(wide(10), wide(10), Some(10));
        bank.try_reserve(&open, "k", "GET /x", false).unwrap();

        let user_capped = caps(
            Caps {
                max_concurrent: 10,
                max_rpm: 1,
                max_sse: 10,
            },
            wide(10),
            Some(1),
        );
        assert_eq!(
            bank.try_reserve(&user_capped, "k", "GET /x", false),
            Err(CapHit::UserRpm)
        );

        let api_capped = caps(wide(10), wide(10), Some(1));
        assert_eq!(
            bank.try_reserve(&api_capped, "k", "GET /x", false),
            Err(CapHit::ApiRpm)
        );

        let global_capped = caps(
            wide(10),
            Caps {
                max_concurrent: 10,
                max_rpm: 1,
                max_sse: 10,
            },
            None,
        );
        assert_eq!(
            bank.try_reserve(&global_capped, "k", "GET /x", false),
            Err(CapHit::GlobalRpm)
        );
    }

    #[test]
    fn concurrency_hit_reported_after_rates_pass() {
        let bank = CounterBank::new();
        let c = caps(
            Caps {
                max_concurrent: 1,
                max_rpm: 100,
                max_sse: 1,
            },
            wide(100),
            None,
        );

        bank.try_reserve(&c, "k", "GET /x", false).unwrap();
        assert_eq!(
            bank.try_reserve(&c, "k", "GET /x", false),
            Err(CapHit::UserConcurrency)
        );

        // A different key hits the global gauge instead.
        let global_tight = caps(
            wide(100),
            Caps {
                max_concurrent: 1,
                max_rpm: 100,
                max_sse: 100,
            },
            None,
        );
        assert_eq!(
            bank.try_reserve(&global_tight, "other", "GET /x", false),
            Err(CapHit::GlobalConcurrency)
        );
    }

    #[test]
    fn sse_uses_separate_gauges_but_shared_window() {
        let bank = CounterBank::new();
        let c = caps(wide(100), wide(100), None);

        // Two unary requests and three SSE messages by the same key.
        bank.try_reserve(&c, "k", "GET /x", false).unwrap();
        bank.try_reserve(&c, "k", "GET /x", false).unwrap();
        bank.try_reserve(&c, "k", "GET /stream", true).unwrap();
        for _ in 0..3 {
            assert!(bank.record_message(&c, "k", "GET /stream"));
        }

        let snapshot = bank.snapshot();
        assert_eq!(snapshot.unary_active, 2);
        assert_eq!(snapshot.sse_active, 1);
        // N unary + M messages share one window; the SSE admission itself
        // consumes none of it.
        assert_eq!(snapshot.requests_last_minute, 5);
    }

    #[test]
    fn sse_admission_capped_by_sse_gauge() {
        let bank = CounterBank::new();
        let c = caps(
            Caps {
                max_concurrent: 10,
                max_rpm: 100,
                max_sse: 1,
            },
            wide(100),
            None,
        );

        bank.try_reserve(&c, "k", "GET /s", true).unwrap();
        assert_eq!(
            bank.try_reserve(&c, "k", "GET /s", true),
            Err(CapHit::UserSse)
        );

        bank.release("k", true);
        bank.try_reserve(&c, "k", "GET /s", true).unwrap();
    }

    #[test]
    fn record_message_refuses_at_cap_without_counting() {
        let bank = CounterBank::new();
        let c = caps(
            Caps {
                max_concurrent: 10,
                max_rpm: 5,
                max_sse: 10,
            },
            wide(100),
            None,
        );

        bank.try_reserve(&c, "k", "GET /s", true).unwrap();
        for _ in 0..5 {
            assert!(bank.record_message(&c, "k", "GET /s"));
        }
        // The sixth message is refused, repeatedly, and does not record.
        assert!(!bank.record_message(&c, "k", "GET /s"));
        assert!(!bank.record_message(&c, "k", "GET /s"));
        assert_eq!(bank.snapshot().requests_last_minute, 5);
    }

    #[test]
    fn convert_to_sse_moves_the_slot() {
        let bank = CounterBank::new();
        let c = caps(wide(10), wide(10), None);

        bank.try_reserve(&c, "k", "GET /x", false).unwrap();
        bank.convert_to_sse("k");

        let snapshot = bank.snapshot();
        assert_eq!(snapshot.unary_active, 0);
        assert_eq!(snapshot.sse_active, 1);

        bank.release("k", true);
        assert_eq!(bank.active_connections(), 0);
    }

    #[test]
    fn release_clamps_at_zero() {
        let bank = CounterBank::new();
        let c = caps(wide(10), wide(10), None);
        bank.try_reserve(&c, "k", "GET /x", false).unwrap();
        bank.release("k", false);
        // Double release must not underflow or panic.
        bank.release("k", false);
        assert_eq!(bank.active_connections(), 0);
    }

    #[test]
    fn sweep_drops_only_idle_cells() {
        let bank = CounterBank::new();
        let c = caps(wide(10), wide(10), None);

        bank.try_reserve(&c, "busy", "GET /x", false).unwrap();
        bank.try_reserve(&c, "done", "GET /x", false).unwrap();
        bank.release("done", false);

        bank.sweep_idle();
        // "done" still has window events and a recent last_used; both stay.
        assert_eq!(bank.keys.len(), 2);

        // A cell with no gauges, no events, and an old last_used goes away.
        {
            let cell = bank.keys.get("done").unwrap().value().clone();
            let mut key = cell.lock();
            key.window.events.clear();
            key.last_used = Instant::now() - WINDOW - Duration::from_secs(1);
        }
        bank.sweep_idle();
        assert_eq!(bank.keys.len(), 1);
        assert!(bank.keys.get("busy").is_some());
    }

    #[test]
    fn window_trims_expired_events() {
        let mut window = Window::default();
        let now = Instant::now();
        let old = now - WINDOW - Duration::from_secs(1);
        window.events.push_back(old);
        window.events.push_back(now);
        assert_eq!(window.count(now), 1);
    }
}
