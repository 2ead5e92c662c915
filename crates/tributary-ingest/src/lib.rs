//! Tributary ingestion pipeline.
//!
//! Routes JSON business events from an at-least-once subscription into two
//! sinks per event: a blob archive partitioned by category and event time,
//! and an append-only table per category.
//!
//! # Modules
//!
//! - [`source`] - Subscription trait, in-memory queue, JSONL replay
//! - [`sink`] - Blob and table store traits and backends
//! - [`fanout`] - Concurrent archive + table delivery, table batching
//! - [`pipeline`] - Pull loop, worker pool, ack/nack
//! - [`retry`] - Bounded exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Subscription   │  pull / ack / nack, redelivers unacked messages
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Decoder     │  bytes → JSON object + ingested_at
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  RoutingTable   │  event_type → table + time field
//! └────────┬────────┘
//!          │
//!     ┌────┴─────┐
//!     ▼          ▼
//! ┌────────┐ ┌────────────┐
//! │  Blob  │ │TableBatcher│  both complete before the message is acked
//! │ Store  │ │→ TableStore│
//! └────────┘ └────────────┘
//! ```
//!
//! Delivery is at-least-once: both sinks must tolerate duplicates.

pub mod config;
pub mod error;
pub mod fanout;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use config::{ArchiveBackend, PipelineConfig, TableBackend};
pub use fanout::{
    BatcherStats, BranchOutcome, Delivery, FanoutConfig, FanoutCoordinator, TableBatcher,
    TableBatcherConfig,
};
pub use pipeline::{Disposition, Pipeline, PipelineStats};
pub use retry::RetryPolicy;

pub use sink::{
    BlobStore, ClickHouseConfig, ClickHouseTableStore, JsonlTableStore, LocalBlobStore,
    MemoryBlobStore, MemoryTableStore, Row, S3BlobStore, S3Config, TableStore,
};
pub use source::{
    AckId, JsonlConfig, JsonlInput, JsonlSource, MemorySubscription, MemorySubscriptionConfig,
    ReceivedMessage, SourceStats, Subscription, SubscriptionStats,
};
