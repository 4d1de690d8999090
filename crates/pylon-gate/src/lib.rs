//! Request admission for the Pylon proxy.
//!
//! This crate owns the three pieces that decide whether a request may reach
//! the downstream:
//!
//! - the [`CounterBank`]: per-key, per-API, and global gauges plus trailing
//!   60-second rate windows, with linearizable reserve/release;
//! - the [`WaitQueue`]: a single bounded priority queue with preemption,
//!   timeouts, and exactly-once resolution per entry;
//! - the [`Gate`]: the admission controller tying the two together and
//!   minting [`Ticket`]s, each of which owns the obligation to release its
//!   concurrency slot exactly once.
//!
//! Counters are in-process only; a second proxy instance has its own bank.

mod api;
mod bank;
mod gate;
mod queue;
mod ticket;

pub use api::api_identifier;
pub use bank::{BankSnapshot, CapHit, CounterBank, KeyCounters};
pub use gate::{AdmissionOutcome, EffectiveCaps, Gate};
pub use queue::WaitQueue;
pub use ticket::Ticket;
