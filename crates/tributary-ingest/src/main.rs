//! Tributary ingestion daemon.
//!
//! Reads JSON events (one per line) from a file, a directory or stdin,
//! routes each by `event_type`, and writes it to both the archive and the
//! table for its category.
//!
//! # Usage
//!
//! ```bash
//! # Replay a file into local stores
//! tributary-ingest --input events.jsonl --archive-dir ./archive --table-dir ./tables
//!
//! # Stream stdin into S3 and ClickHouse
//! producer | tributary-ingest \
//!     --s3-bucket my-archive --archive-prefix prod \
//!     --clickhouse-url http://clickhouse:8123 --clickhouse-db events
//! ```
//!
//! Every flag can also be set through a `TRIBUTARY_*` environment variable
//! or a `.env` file.
//!
//! # Graceful Shutdown
//!
//! On SIGINT/SIGTERM the daemon:
//! 1. Stops reading input
//! 2. Lets in-flight messages finish both sink writes
//! 3. Flushes buffered table rows
//! 4. Logs a run summary

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tributary_core::RoutingTable;
use tributary_core::metrics::{HealthState, init_metrics, start_metrics_server};
use tributary_ingest::{
    ArchiveBackend, ClickHouseConfig, JsonlConfig, JsonlInput, JsonlSource, MemorySubscription,
    MemorySubscriptionConfig, Pipeline, PipelineConfig, RetryPolicy, S3Config, TableBackend,
};
use tracing_subscriber::EnvFilter;

/// Tributary ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "tributary-ingest")]
#[command(about = "Route JSON events into an archive and per-category tables")]
#[command(version)]
struct Args {
    /// Input JSONL file or directory, or `-` for stdin
    #[arg(long, short, env = "TRIBUTARY_INPUT", default_value = "-")]
    input: String,

    /// Limit number of input files to process (directory input)
    #[arg(long, env = "TRIBUTARY_INPUT_LIMIT")]
    input_limit: Option<usize>,

    /// Local archive directory (used when no S3 bucket is set)
    #[arg(long, env = "TRIBUTARY_ARCHIVE_DIR", default_value = "./archive")]
    archive_dir: PathBuf,

    /// S3 bucket for the archive
    #[arg(long, env = "TRIBUTARY_S3_BUCKET")]
    s3_bucket: Option<String>,

    /// Custom S3 endpoint (MinIO, GCS interoperability, ...)
    #[arg(long, env = "TRIBUTARY_S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// S3 region override
    #[arg(long, env = "TRIBUTARY_S3_REGION")]
    s3_region: Option<String>,

    /// Deployment prefix for archive keys
    #[arg(long, env = "TRIBUTARY_ARCHIVE_PREFIX", default_value = "")]
    archive_prefix: String,

    /// Append the message id to archive filenames
    #[arg(long, env = "TRIBUTARY_ARCHIVE_UNIQUE_SUFFIX")]
    archive_unique_suffix: bool,

    /// Archive events with no route under `_unroutable/`
    #[arg(long, env = "TRIBUTARY_ARCHIVE_UNROUTABLE")]
    archive_unroutable: bool,

    /// ClickHouse URL (e.g., http://localhost:8123)
    #[arg(long, env = "TRIBUTARY_CLICKHOUSE_URL")]
    clickhouse_url: Option<String>,

    /// ClickHouse database name
    #[arg(long, env = "TRIBUTARY_CLICKHOUSE_DB", default_value = "events")]
    clickhouse_db: String,

    /// ClickHouse user
    #[arg(long, env = "TRIBUTARY_CLICKHOUSE_USER")]
    clickhouse_user: Option<String>,

    /// ClickHouse password
    #[arg(long, env = "TRIBUTARY_CLICKHOUSE_PASSWORD", hide_env_values = true)]
    clickhouse_password: Option<String>,

    /// Directory for JSONL tables (used when no ClickHouse URL is set)
    #[arg(long, env = "TRIBUTARY_TABLE_DIR", default_value = "./tables")]
    table_dir: PathBuf,

    /// Keep everything in memory (nothing is persisted)
    #[arg(long, env = "TRIBUTARY_DRY_RUN")]
    dry_run: bool,

    /// Routes as category=table[@time_field] (comma-separated)
    #[arg(
        long,
        env = "TRIBUTARY_ROUTES",
        value_delimiter = ',',
        default_value = "order=orders@order_date,inventory=inventory,user_activity=user_activity"
    )]
    routes: Vec<String>,

    /// Event-time field for routes that don't name one
    #[arg(long, env = "TRIBUTARY_DEFAULT_TIME_FIELD", default_value = "timestamp")]
    default_time_field: String,

    /// Messages processed concurrently
    #[arg(long, env = "TRIBUTARY_WORKERS", default_value = "512")]
    workers: usize,

    /// Maximum messages per pull
    #[arg(long, env = "TRIBUTARY_PULL_BATCH", default_value = "100")]
    pull_batch: usize,

    /// Rows per table that trigger a flush
    #[arg(long, env = "TRIBUTARY_TABLE_BATCH_SIZE", default_value = "500")]
    table_batch_size: usize,

    /// Maximum time a row waits before its table is flushed (ms)
    #[arg(long, env = "TRIBUTARY_TABLE_FLUSH_MS", default_value = "250")]
    table_flush_ms: u64,

    /// Retries per sink write after the first attempt
    #[arg(long, env = "TRIBUTARY_RETRY_ATTEMPTS", default_value = "5")]
    retry_attempts: usize,

    /// Delay before the first retry (ms)
    #[arg(long, env = "TRIBUTARY_RETRY_BASE_MS", default_value = "100")]
    retry_base_ms: u64,

    /// Upper bound on any retry delay (ms)
    #[arg(long, env = "TRIBUTARY_RETRY_MAX_MS", default_value = "10000")]
    retry_max_ms: u64,

    /// Deliveries before a failing message is dead-lettered (0 = unlimited)
    #[arg(long, env = "TRIBUTARY_MAX_DELIVERIES", default_value = "5")]
    max_deliveries: u32,

    /// Messages read ahead of the workers
    #[arg(long, env = "TRIBUTARY_MAX_PENDING", default_value = "10000")]
    max_pending: usize,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "TRIBUTARY_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Consecutive delivery failures before /health reports degraded (0 = never)
    #[arg(long, env = "TRIBUTARY_UNHEALTHY_AFTER", default_value = "50")]
    unhealthy_after: u64,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.workers,
            pull_batch: self.pull_batch,
            archive_prefix: self.archive_prefix.clone(),
            archive_unique_suffix: self.archive_unique_suffix,
            archive_unroutable: self.archive_unroutable,
            retry: RetryPolicy {
                max_retries: self.retry_attempts,
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: Duration::from_millis(self.retry_max_ms),
            },
            table_batch_size: self.table_batch_size,
            table_flush_interval: Duration::from_millis(self.table_flush_ms),
            ..Default::default()
        }
    }

    fn archive_backend(&self) -> ArchiveBackend {
        if self.dry_run {
            ArchiveBackend::Memory
        } else if let Some(bucket) = &self.s3_bucket {
            ArchiveBackend::S3(S3Config {
                bucket: bucket.clone(),
                endpoint: self.s3_endpoint.clone(),
                region: self.s3_region.clone(),
            })
        } else {
            ArchiveBackend::Local(self.archive_dir.clone())
        }
    }

    fn table_backend(&self) -> TableBackend {
        if self.dry_run {
            TableBackend::Memory
        } else if let Some(url) = &self.clickhouse_url {
            TableBackend::ClickHouse(ClickHouseConfig {
                url: url.clone(),
                database: self.clickhouse_db.clone(),
                user: self.clickhouse_user.clone(),
                password: self.clickhouse_password.clone(),
                ..Default::default()
            })
        } else {
            TableBackend::Jsonl(self.table_dir.clone())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Environment first so clap sees TRIBUTARY_* values from .env
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tributary_ingest=debug,tributary_core=debug".into()),
        )
        .init();

    tracing::info!("Tributary ingestion daemon starting...");

    let health = HealthState::new(args.unhealthy_after);
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle, health.clone())
            .await
            .with_context(|| format!("Failed to start metrics server on port {}", args.metrics_port))?;
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
        cancel_clone.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let routing = RoutingTable::parse(&args.routes, &args.default_time_field)
        .context("Invalid --routes")?;
    let archive_backend = args.archive_backend();
    let table_backend = args.table_backend();
    let config = args.pipeline_config();

    tracing::info!("Configuration:");
    tracing::info!("  Input: {}", args.input);
    tracing::info!("  Archive: {:?}", archive_backend);
    tracing::info!("  Archive prefix: {:?}", config.archive_prefix);
    tracing::info!("  Tables: {}", describe_tables(&table_backend));
    for route in routing.routes() {
        tracing::info!(
            "  Route: {} -> {} (time field: {})",
            route.category, route.table, route.time_field
        );
    }
    tracing::info!("  Workers: {}", config.workers);
    tracing::info!(
        "  Retries: {} (base {:?}, max {:?})",
        config.retry.max_retries, config.retry.base_delay, config.retry.max_delay
    );

    let blobs = archive_backend
        .connect()
        .await
        .context("Failed to initialize archive store")?;
    let tables = table_backend
        .connect()
        .await
        .context("Failed to initialize table store")?;

    let pipeline = Arc::new(
        Pipeline::new(routing, blobs, tables, config, health)
            .context("Failed to build pipeline")?,
    );

    let subscription = Arc::new(MemorySubscription::new(
        "input",
        MemorySubscriptionConfig {
            max_deliveries: args.max_deliveries,
            ..Default::default()
        },
    ));

    let source = JsonlSource::new(JsonlConfig {
        input: JsonlInput::from_arg(&args.input),
        limit: args.input_limit,
        max_pending: args.max_pending.max(1),
        ..Default::default()
    });
    let loader = {
        let subscription = Arc::clone(&subscription);
        let cancel = cancel.clone();
        tokio::spawn(async move { source.run(&subscription, &cancel).await })
    };

    tracing::info!("Starting ingestion...");
    let run_result = pipeline
        .clone()
        .run(subscription.clone(), running.clone())
        .await;

    // The reader may be parked on stdin or a full queue; nothing pulls now.
    cancel.cancel();
    let stats = run_result?;

    tracing::info!("Shutting down...");
    let table_stats = pipeline.shutdown().await;

    let source_result = loader.await.context("Input reader task panicked")?;
    let sub_stats = subscription.stats();

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    if let Ok(source_stats) = &source_result {
        tracing::info!("Lines read:           {}", source_stats.lines_read);
    }
    tracing::info!("Messages received:    {}", stats.received);
    tracing::info!("Delivered:            {}", stats.delivered);
    tracing::info!("Decode failures:      {}", stats.decode_failures);
    tracing::info!("Unroutable:           {}", stats.unroutable);
    tracing::info!("Delivery failures:    {}", stats.delivery_failures);
    tracing::info!("Redelivered:          {}", sub_stats.redelivered);
    tracing::info!("Dead-lettered:        {}", sub_stats.dead_lettered);
    tracing::info!("Rows appended:        {}", table_stats.rows_appended);
    tracing::info!("Table batches:        {}", table_stats.batches_flushed);
    let abandoned = subscription.pending_len() + subscription.outstanding_len();
    if abandoned > 0 {
        tracing::warn!("Unprocessed messages: {}", abandoned);
    }

    source_result.context("Failed to read input")?;
    Ok(())
}

fn describe_tables(backend: &TableBackend) -> String {
    match backend {
        TableBackend::ClickHouse(config) => format!("clickhouse {} ({})", config.url, config.database),
        TableBackend::Jsonl(dir) => format!("jsonl {}", dir.display()),
        TableBackend::Memory => "memory".to_string(),
    }
}
