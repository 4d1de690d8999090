//! The bounded record buffer and its flush worker.

use crate::RecordError;
use parking_lot::Mutex;
use pylon_db::DbPool;
use pylon_types::CompletionRecord;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Maximum records drained into one INSERT batch.
const FLUSH_BATCH: usize = 256;

struct Shared {
    buffer: Mutex<VecDeque<CompletionRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

/// The recorder: a bounded buffer plus the worker that drains it.
pub struct Recorder {
    shared: Arc<Shared>,
}

/// Cheap handle for the request path. Cloned into every handler.
#[derive(Clone)]
pub struct RecorderHandle {
    shared: Arc<Shared>,
}

impl Recorder {
    /// Creates a recorder whose buffer holds at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                dropped: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drains up to `max` buffered records.
    pub fn drain(&self, max: usize) -> Vec<CompletionRecord> {
        let mut buffer = self.shared.buffer.lock();
        let take = buffer.len().min(max);
        buffer.drain(..take).collect()
    }

    /// Runs the flush loop until the task is dropped at shutdown.
    ///
    /// Inserts happen on the blocking pool; a failed batch is logged and
    /// discarded rather than retried, per the "eventually flushed, not
    /// transactional" contract.
    pub async fn run(self, pool: DbPool) {
        tracing::info!(capacity = self.shared.capacity, "request recorder started");
        loop {
            self.shared.notify.notified().await;

            loop {
                let batch = self.drain(FLUSH_BATCH);
                if batch.is_empty() {
                    break;
                }

                let pool = pool.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let conn = pool.get()?;
                    insert_records(&conn, &batch)
                })
                .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "failed to flush request records");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "record flush task panicked");
                    }
                }
            }
        }
    }
}

impl RecorderHandle {
    /// Enqueues one completion record. Never blocks: a full buffer drops
    /// its oldest entry and counts the drop.
    pub fn record(&self, record: CompletionRecord) {
        {
            let mut buffer = self.shared.buffer.lock();
            if buffer.len() >= self.shared.capacity {
                buffer.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 1000 == 1 {
                    tracing::warn!(dropped, "record buffer overflow, dropping oldest entries");
                }
            }
            buffer.push_back(record);
        }
        self.shared.notify.notify_one();
    }

    /// Total records dropped to overflow since startup.
    pub fn dropped_records(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Inserts a batch of records inside one transaction.
pub fn insert_records(
    conn: &Connection,
    records: &[CompletionRecord],
) -> Result<(), RecordError> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO request_log
                (key_id, api, status, started_at, duration_ms, client_addr,
                 is_sse, sse_message_count, rate_limited)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for record in records {
            stmt.execute(params![
                record.key_id,
                record.api,
                record.status,
                record.started_at,
                record.duration_ms,
                record.client_addr,
                record.is_sse,
                record.sse_message_count,
                record.rate_limited,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}
