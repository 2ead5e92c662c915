//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Core event model error.
    #[error(transparent)]
    Core(#[from] tributary_core::Error),

    /// ClickHouse error.
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// S3 request error.
    #[error("S3 error: {0}")]
    S3(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Blob store rejected or failed a write.
    #[error("Blob store error: {0}")]
    BlobStore(String),

    /// Table store rejected or failed an append.
    #[error("Table store error: {0}")]
    TableStore(String),

    /// Inbound subscription error.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Channel receive error.
    #[error("Channel receive error")]
    ChannelRecv,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
