//! Destination stores for routed events.
//!
//! Two kinds of store receive every routed event:
//!
//! - [`BlobStore`] - archival copy, one whole object per event
//! - [`TableStore`] - analytical tables, append-only rows per category
//!
//! Store handles are constructed once at start-up and shared by every
//! worker as `Arc<dyn …>`. Implementations must be safe to call
//! concurrently; each worker writes its own key or row, so no caller-side
//! locking is needed.
//!
//! # Available Stores
//!
//! | Store | Kind | Use |
//! |-------|------|-----|
//! | [`S3BlobStore`] | blob | S3 or any S3-compatible endpoint |
//! | [`LocalBlobStore`] | blob | local directory tree |
//! | [`ClickHouseTableStore`] | table | ClickHouse `JSONEachRow` inserts |
//! | [`JsonlTableStore`] | table | one `<table>.jsonl` file per table |
//! | [`MemoryBlobStore`], [`MemoryTableStore`] | both | tests |

mod clickhouse;
mod local;
mod memory;
mod s3;

pub use clickhouse::{ClickHouseConfig, ClickHouseTableStore};
pub use local::{JsonlTableStore, LocalBlobStore};
pub use memory::{MemoryBlobStore, MemoryTableStore};
pub use s3::{S3BlobStore, S3Config};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};

/// One table row: the event's field map.
pub type Row = Map<String, Value>;

/// Durable whole-object storage keyed by path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Write `data` as the complete object at `key`, replacing any existing
    /// object. Never a partial or appending write.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
}

/// Append-only analytical table storage.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Append `rows` to `table`. Existing rows are never modified and the
    /// table is never truncated.
    async fn append(&self, table: &str, rows: &[Row]) -> Result<()>;
}

/// Whether `name` is a plain table identifier (`[A-Za-z0-9_]`, optionally
/// `database.table`).
pub(crate) fn is_valid_table_name(name: &str) -> bool {
    let mut parts = name.split('.');
    let valid_part = |p: &str| {
        !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    match (parts.next(), parts.next(), parts.next()) {
        (Some(t), None, None) => valid_part(t),
        (Some(db), Some(t), None) => valid_part(db) && valid_part(t),
        _ => false,
    }
}
