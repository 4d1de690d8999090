//! Request completion recording.
//!
//! The recorder sits off the response path: handlers push
//! [`pylon_types::CompletionRecord`]s into a bounded in-memory buffer and
//! move on. A dedicated worker drains the buffer into the `request_log`
//! table in batches. When the buffer overflows, the oldest entries are
//! dropped and counted — the request path never blocks on persistence, and
//! persistence is eventually flushed, not transactional.

mod error;
mod recorder;
mod stats;

pub use error::RecordError;
pub use recorder::{insert_records, Recorder, RecorderHandle};
pub use stats::{delete_before, query_recent, query_summary, KeyStat, LoggedRequest, StatsSummary};
