//! Pipeline and sink configuration.
//!
//! Everything here is read once at start-up and never mutated afterwards.

use crate::fanout::{FanoutConfig, TableBatcherConfig};
use crate::retry::RetryPolicy;
use crate::sink::{
    BlobStore, ClickHouseConfig, ClickHouseTableStore, JsonlTableStore, LocalBlobStore,
    MemoryBlobStore, MemoryTableStore, S3BlobStore, S3Config, TableStore,
};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tributary_core::ArchiveLayout;

/// Configuration for the [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Messages processed concurrently.
    pub workers: usize,

    /// Maximum messages requested per pull.
    pub pull_batch: usize,

    /// Deployment prefix for archive keys (may be empty).
    pub archive_prefix: String,

    /// Append the message id to archive filenames.
    pub archive_unique_suffix: bool,

    /// Archive events no route accepts under `_unroutable/`.
    pub archive_unroutable: bool,

    /// Retry policy shared by both sink branches.
    pub retry: RetryPolicy,

    /// Rows per table that trigger a flush.
    pub table_batch_size: usize,

    /// Maximum time a row waits before its table is flushed.
    pub table_flush_interval: Duration,

    /// Pause after a failed pull.
    pub pull_error_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 512,
            pull_batch: 100,
            archive_prefix: String::new(),
            archive_unique_suffix: false,
            archive_unroutable: false,
            retry: RetryPolicy::default(),
            table_batch_size: 500,
            table_flush_interval: Duration::from_millis(250),
            pull_error_backoff: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    pub fn layout(&self) -> ArchiveLayout {
        ArchiveLayout::new(&self.archive_prefix).with_unique_suffix(self.archive_unique_suffix)
    }

    pub fn fanout(&self) -> FanoutConfig {
        FanoutConfig {
            layout: self.layout(),
            blob_retry: self.retry,
            batcher: TableBatcherConfig {
                batch_size: self.table_batch_size.max(1),
                flush_interval: self.table_flush_interval,
                retry: self.retry,
                // Room for every worker's row plus a full batch per table.
                channel_capacity: self.workers.max(1) + self.table_batch_size.max(1),
            },
        }
    }
}

/// Where archive blobs go.
#[derive(Debug, Clone)]
pub enum ArchiveBackend {
    /// A local directory tree.
    Local(PathBuf),
    /// An S3 or S3-compatible bucket.
    S3(S3Config),
    /// Process memory (dry runs).
    Memory,
}

impl ArchiveBackend {
    pub async fn connect(&self) -> Result<Arc<dyn BlobStore>> {
        Ok(match self {
            Self::Local(root) => Arc::new(LocalBlobStore::new(root)?),
            Self::S3(config) => Arc::new(S3BlobStore::connect(config.clone()).await?),
            Self::Memory => Arc::new(MemoryBlobStore::new()),
        })
    }
}

/// Where table rows go.
#[derive(Debug, Clone)]
pub enum TableBackend {
    /// One JSONL file per table in a directory.
    Jsonl(PathBuf),
    /// ClickHouse over HTTP.
    ClickHouse(ClickHouseConfig),
    /// Process memory (dry runs).
    Memory,
}

impl TableBackend {
    /// Open the store. ClickHouse must answer a health check first.
    pub async fn connect(&self) -> Result<Arc<dyn TableStore>> {
        Ok(match self {
            Self::Jsonl(dir) => Arc::new(JsonlTableStore::new(dir)?),
            Self::ClickHouse(config) => {
                let store = ClickHouseTableStore::new(config.clone());
                store.health_check().await?;
                Arc::new(store)
            }
            Self::Memory => Arc::new(MemoryTableStore::new()),
        })
    }
}
