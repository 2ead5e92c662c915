//! Per-table row batching.
//!
//! A single background task owns one buffer per table. Each appended row
//! carries a oneshot completion handle, and the caller's future resolves
//! only once the batch containing that row has been appended (or has failed
//! after retries). A buffer is flushed when it reaches `batch_size` rows or
//! on the next `flush_interval` tick, whichever comes first.
//!
//! Flushes run as separate tasks so a slow append to one table does not
//! hold up buffering for the others. A batch that keeps failing is split
//! until the rows the table refuses are isolated; the rest still land.

use crate::retry::{RetryPolicy, retry};
use crate::sink::{Row, TableStore};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Configuration for the [`TableBatcher`].
#[derive(Debug, Clone)]
pub struct TableBatcherConfig {
    /// Rows per table that trigger an immediate flush.
    pub batch_size: usize,

    /// Maximum time a row waits in a buffer.
    pub flush_interval: Duration,

    /// Retry policy for each batch append.
    pub retry: RetryPolicy,

    /// Capacity of the command channel.
    pub channel_capacity: usize,
}

impl Default for TableBatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            channel_capacity: 10_000,
        }
    }
}

/// Batcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub rows_appended: u64,
    pub rows_failed: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    rows_appended: AtomicU64,
    rows_failed: AtomicU64,
    batches_flushed: AtomicU64,
    batches_failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BatcherStats {
        BatcherStats {
            rows_appended: self.rows_appended.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Append {
        table: String,
        row: Row,
        done: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

#[derive(Default)]
struct Buffer {
    rows: Vec<Row>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

/// Handle to the batching task.
pub struct TableBatcher {
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl TableBatcher {
    /// Spawn the batching task. Must be called within a Tokio runtime.
    pub fn spawn(store: Arc<dyn TableStore>, config: TableBatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let counters = Arc::new(Counters::default());

        tracing::info!(
            store = store.name(),
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "table batcher starting"
        );

        let worker = Worker {
            store,
            config,
            buffers: HashMap::new(),
            flushes: JoinSet::new(),
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            counters,
        }
    }

    /// Append one row and wait until it is durable in `table`.
    pub async fn append(&self, table: &str, row: Row) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Append {
                table: table.to_string(),
                row,
                done,
            })
            .await
            .map_err(|_| Error::ChannelSend("table batcher has stopped".to_string()))?;
        wait.await.map_err(|_| Error::ChannelRecv)?
    }

    /// Flush all buffers, wait for in-flight appends and stop the task.
    ///
    /// Rows submitted after this call fail with a channel error.
    pub async fn shutdown(&self) -> BatcherStats {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.tx.send(Command::Shutdown).await;
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "table batcher task failed");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> BatcherStats {
        self.counters.snapshot()
    }
}

struct Worker {
    store: Arc<dyn TableStore>,
    config: TableBatcherConfig,
    buffers: HashMap<String, Buffer>,
    flushes: JoinSet<()>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let period = self.config.flush_interval.max(Duration::from_millis(1));
        let mut flush_interval = tokio::time::interval(period);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Append { table, row, done }) => {
                            let buffer = self.buffers.entry(table.clone()).or_default();
                            buffer.rows.push(row);
                            buffer.waiters.push(done);
                            if buffer.rows.len() >= self.config.batch_size {
                                self.flush(&table);
                            }
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                _ = flush_interval.tick() => {
                    self.flush_all();
                }
                Some(joined) = self.flushes.join_next(), if !self.flushes.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "table flush task panicked");
                    }
                }
            }
        }

        // Rows already queued behind the shutdown command still get written.
        rx.close();
        while let Some(cmd) = rx.recv().await {
            if let Command::Append { table, row, done } = cmd {
                let buffer = self.buffers.entry(table).or_default();
                buffer.rows.push(row);
                buffer.waiters.push(done);
            }
        }
        self.flush_all();

        while let Some(joined) = self.flushes.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "table flush task panicked");
            }
        }

        let stats = self.counters.snapshot();
        tracing::info!(
            rows = stats.rows_appended,
            failed_rows = stats.rows_failed,
            batches = stats.batches_flushed,
            "table batcher stopped"
        );
    }

    fn flush_all(&mut self) {
        let tables: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, b)| !b.rows.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        for table in tables {
            self.flush(&table);
        }
    }

    fn flush(&mut self, table: &str) {
        let Some(buffer) = self.buffers.get_mut(table) else {
            return;
        };
        if buffer.rows.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);

        let store = self.store.clone();
        let policy = self.config.retry;
        let counters = self.counters.clone();
        let table = table.to_string();

        self.flushes.spawn(async move {
            let start = Instant::now();
            append_batch(store.as_ref(), &policy, &table, batch, &counters).await;
            metrics::histogram!("table_flush_duration_seconds")
                .record(start.elapsed().as_secs_f64());
        });
    }
}

/// Append one buffered batch, retrying it as a whole first.
///
/// A batch that still fails after retries is bisected with single
/// attempts until each failing part is one row, so only rows the table
/// rejects on their own fail their waiters.
async fn append_batch(
    store: &dyn TableStore,
    policy: &RetryPolicy,
    table: &str,
    batch: Buffer,
    counters: &Counters,
) {
    let Buffer { rows, waiters } = batch;

    let err = match retry(policy, "table", table, || store.append(table, &rows)).await {
        Ok(()) => {
            complete(table, rows.len(), waiters, counters);
            return;
        }
        Err(e) => e,
    };

    counters.batches_failed.fetch_add(1, Ordering::Relaxed);
    if rows.len() == 1 {
        reject(table, policy, &err, waiters, counters);
        return;
    }

    tracing::warn!(
        table = %table,
        rows = rows.len(),
        attempts = policy.max_attempts(),
        error = %err,
        "table batch failed after retries, isolating rejected rows"
    );
    metrics::counter!("table_batch_splits_total", "table" => table.to_string()).increment(1);

    let mut parts = VecDeque::from([(rows, waiters)]);
    while let Some((rows, waiters)) = parts.pop_front() {
        let (left, right) = split(rows, waiters);
        for (rows, waiters) in [left, right] {
            match store.append(table, &rows).await {
                Ok(()) => complete(table, rows.len(), waiters, counters),
                Err(e) if rows.len() == 1 => reject(table, policy, &e, waiters, counters),
                Err(_) => parts.push_back((rows, waiters)),
            }
        }
    }
}

type Part = (Vec<Row>, Vec<oneshot::Sender<Result<()>>>);

fn split(mut rows: Vec<Row>, mut waiters: Vec<oneshot::Sender<Result<()>>>) -> (Part, Part) {
    let mid = rows.len() / 2;
    let right_rows = rows.split_off(mid);
    let right_waiters = waiters.split_off(mid);
    ((rows, waiters), (right_rows, right_waiters))
}

fn complete(
    table: &str,
    count: usize,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    counters: &Counters,
) {
    let count = count as u64;
    counters.rows_appended.fetch_add(count, Ordering::Relaxed);
    counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("table_rows_appended_total", "table" => table.to_string()).increment(count);
    metrics::counter!("table_batches_flushed_total").increment(1);
    tracing::debug!(table = %table, rows = count, "table batch flushed");

    for waiter in waiters {
        let _ = waiter.send(Ok(()));
    }
}

fn reject(
    table: &str,
    policy: &RetryPolicy,
    err: &Error,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    counters: &Counters,
) {
    let count = waiters.len() as u64;
    counters.rows_failed.fetch_add(count, Ordering::Relaxed);
    metrics::counter!("table_append_failures_total", "table" => table.to_string())
        .increment(count);
    tracing::error!(
        table = %table,
        rows = count,
        attempts = policy.max_attempts(),
        error = %err,
        "table append failed after retries"
    );

    let reason = err.to_string();
    for waiter in waiters {
        let _ = waiter.send(Err(Error::TableStore(reason.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryTableStore;
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn config(batch_size: usize, flush_ms: u64) -> TableBatcherConfig {
        TableBatcherConfig {
            batch_size,
            flush_interval: Duration::from_millis(flush_ms),
            retry: RetryPolicy::none(),
            channel_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let store = Arc::new(MemoryTableStore::new());
        let batcher = TableBatcher::spawn(store.clone(), config(2, 60_000));

        let (a, b) = tokio::join!(
            batcher.append("orders", row(json!({"id": 1}))),
            batcher.append("orders", row(json!({"id": 2}))),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(store.rows("orders").len(), 2);
        assert_eq!(store.append_count(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_on_interval() {
        let store = Arc::new(MemoryTableStore::new());
        let batcher = TableBatcher::spawn(store.clone(), config(1000, 10));

        tokio::time::timeout(
            Duration::from_secs(5),
            batcher.append("inventory", row(json!({"sku": "a"}))),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(store.rows("inventory").len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_tables_are_batched_separately() {
        let store = Arc::new(MemoryTableStore::new());
        let batcher = TableBatcher::spawn(store.clone(), config(1, 60_000));

        batcher.append("orders", row(json!({"id": 1}))).await.unwrap();
        batcher
            .append("inventory", row(json!({"sku": "a"})))
            .await
            .unwrap();

        assert_eq!(store.tables(), vec!["inventory".to_string(), "orders".to_string()]);
        let stats = batcher.shutdown().await;
        assert_eq!(stats.rows_appended, 2);
        assert_eq!(stats.batches_flushed, 2);
    }

    #[tokio::test]
    async fn test_outage_fails_every_waiter() {
        let store = Arc::new(MemoryTableStore::new());
        store.set_unavailable(true);
        let batcher = TableBatcher::spawn(store.clone(), config(2, 60_000));

        let (a, b) = tokio::join!(
            batcher.append("orders", row(json!({"id": 1}))),
            batcher.append("orders", row(json!({"id": 2}))),
        );
        assert!(matches!(a, Err(Error::TableStore(_))));
        assert!(matches!(b, Err(Error::TableStore(_))));
        assert_eq!(store.total_rows(), 0);

        let stats = batcher.shutdown().await;
        assert_eq!(stats.rows_failed, 2);
        assert_eq!(stats.batches_failed, 1);
    }

    #[tokio::test]
    async fn test_failed_batch_is_split_after_one_failure() {
        let store = Arc::new(MemoryTableStore::new());
        store.fail_next(1);
        let batcher = TableBatcher::spawn(store.clone(), config(2, 60_000));

        let (a, b) = tokio::join!(
            batcher.append("orders", row(json!({"id": 1}))),
            batcher.append("orders", row(json!({"id": 2}))),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(store.rows("orders").len(), 2);
        assert_eq!(store.append_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_row_only_fails_its_own_waiter() {
        let store = Arc::new(MemoryTableStore::new());
        store.reject_where("qty", json!("lots"));
        let batcher = TableBatcher::spawn(store.clone(), config(4, 60_000));

        let (a, b, c, d) = tokio::join!(
            batcher.append("orders", row(json!({"id": 1, "qty": 1}))),
            batcher.append("orders", row(json!({"id": 2, "qty": "lots"}))),
            batcher.append("orders", row(json!({"id": 3, "qty": 3}))),
            batcher.append("orders", row(json!({"id": 4, "qty": 4}))),
        );
        a.unwrap();
        assert!(matches!(b, Err(Error::TableStore(_))));
        c.unwrap();
        d.unwrap();

        let mut ids: Vec<_> = store
            .rows("orders")
            .iter()
            .filter_map(|r| r["id"].as_u64())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3, 4]);

        let stats = batcher.shutdown().await;
        assert_eq!(stats.rows_appended, 3);
        assert_eq!(stats.rows_failed, 1);
        assert_eq!(stats.batches_failed, 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let store = Arc::new(MemoryTableStore::new());
        store.fail_next(2);
        let mut cfg = config(1, 60_000);
        cfg.retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let batcher = TableBatcher::spawn(store.clone(), cfg);

        batcher.append("orders", row(json!({"id": 1}))).await.unwrap();
        assert_eq!(store.rows("orders").len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_rows() {
        let store = Arc::new(MemoryTableStore::new());
        let batcher = Arc::new(TableBatcher::spawn(store.clone(), config(1000, 60_000)));

        let pending = {
            let batcher = batcher.clone();
            tokio::spawn(async move { batcher.append("orders", row(json!({"id": 1}))).await })
        };
        // Let the append reach the buffer before shutting down.
        tokio::time::sleep(Duration::from_millis(50)).await;

        batcher.shutdown().await;
        pending.await.unwrap().unwrap();
        assert_eq!(store.rows("orders").len(), 1);

        let late = batcher.append("orders", row(json!({"id": 2}))).await;
        assert!(late.is_err());
    }
}
