//! Sink fan-out.
//!
//! Each routed event goes to two places at once: one blob in the archive,
//! keyed by category and event time, and one row appended to the table for
//! its category. The branches run concurrently and fail independently. A
//! failed branch never rolls back the other one; the message is simply
//! redelivered and both branches run again.

mod batcher;

pub use batcher::{BatcherStats, TableBatcher, TableBatcherConfig};

use crate::retry::{RetryPolicy, retry};
use crate::sink::{BlobStore, TableStore};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tributary_core::{ArchiveKey, ArchiveLayout, EventTimeSource, Event, Route};

/// Fan-out configuration.
#[derive(Debug, Clone, Default)]
pub struct FanoutConfig {
    /// Archive key layout.
    pub layout: ArchiveLayout,

    /// Retry policy for archive writes.
    pub blob_retry: RetryPolicy,

    /// Table batching and retry settings.
    pub batcher: TableBatcherConfig,
}

/// Result of one sink branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    /// The write is durable.
    Written,
    /// The branch does not apply to this event.
    Skipped,
    /// The write failed after retries.
    Failed(String),
}

impl BranchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Outcome of delivering one event to both sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub key: ArchiveKey,
    pub archive: BranchOutcome,
    pub table: BranchOutcome,
}

impl Delivery {
    /// Both branches finished without failure.
    pub fn is_complete(&self) -> bool {
        !self.archive.is_failed() && !self.table.is_failed()
    }
}

/// Writes events to the archive and table stores.
pub struct FanoutCoordinator {
    blobs: Arc<dyn BlobStore>,
    tables: TableBatcher,
    layout: ArchiveLayout,
    blob_retry: RetryPolicy,
}

impl FanoutCoordinator {
    /// Create the coordinator and spawn its table batcher.
    pub fn new(blobs: Arc<dyn BlobStore>, tables: Arc<dyn TableStore>, config: FanoutConfig) -> Self {
        tracing::info!(
            archive = blobs.name(),
            tables = tables.name(),
            prefix = config.layout.prefix(),
            "fan-out coordinator initialized"
        );
        Self {
            blobs,
            tables: TableBatcher::spawn(tables, config.batcher),
            layout: config.layout,
            blob_retry: config.blob_retry,
        }
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// Archive `event` and append it to the route's table, concurrently.
    pub async fn deliver(&self, event: &Event, route: &Route) -> Delivery {
        let derived = self.layout.derive(event, route);
        if let EventTimeSource::Fallback(reason) = &derived.source {
            tracing::debug!(
                message_id = event.message_id(),
                category = %route.category,
                field = %route.time_field,
                reason = %reason,
                "event time unusable, archiving by ingestion time"
            );
            metrics::counter!("ingest_timestamp_fallback_total").increment(1);
        }

        let (archive, table) = tokio::join!(
            self.write_archive(event, &derived.key),
            self.append_row(event, &route.table),
        );

        Delivery {
            key: derived.key,
            archive,
            table,
        }
    }

    /// Archive an event that no route accepted. It never reaches a table.
    pub async fn archive_unroutable(&self, event: &Event) -> BranchOutcome {
        let derived = self.layout.derive_unroutable(event);
        self.write_archive(event, &derived.key).await
    }

    async fn write_archive(&self, event: &Event, key: &ArchiveKey) -> BranchOutcome {
        let body = match event.to_json_bytes() {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                tracing::error!(message_id = event.message_id(), error = %e, "failed to encode event");
                return BranchOutcome::Failed(e.to_string());
            }
        };

        let start = Instant::now();
        let result = retry(&self.blob_retry, "archive", key.as_str(), || {
            self.blobs.put(key.as_str(), body.clone())
        })
        .await;
        metrics::histogram!("archive_write_duration_seconds").record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!("archive_blobs_written_total").increment(1);
                tracing::trace!(message_id = event.message_id(), key = %key, "archived");
                BranchOutcome::Written
            }
            Err(e) => {
                metrics::counter!("archive_write_failures_total").increment(1);
                tracing::error!(
                    message_id = event.message_id(),
                    key = %key,
                    attempts = self.blob_retry.max_attempts(),
                    error = %e,
                    "archive write failed after retries"
                );
                BranchOutcome::Failed(e.to_string())
            }
        }
    }

    async fn append_row(&self, event: &Event, table: &str) -> BranchOutcome {
        match self.tables.append(table, event.fields().clone()).await {
            Ok(()) => BranchOutcome::Written,
            Err(e) => BranchOutcome::Failed(e.to_string()),
        }
    }

    /// Flush buffered rows and stop the table batcher.
    pub async fn shutdown(&self) -> BatcherStats {
        self.tables.shutdown().await
    }

    pub fn table_stats(&self) -> BatcherStats {
        self.tables.stats()
    }
}
