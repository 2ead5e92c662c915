//! The pipeline driver.
//!
//! Pulls messages from a [`Subscription`], runs each one through
//! decode → classify → fan-out on its own task, and acks or nacks it once
//! both sink branches have finished.
//!
//! # Ack Policy
//!
//! | Outcome            | Ack? | Why                                          |
//! |--------------------|------|----------------------------------------------|
//! | Delivered          | yes  | both branches durable                        |
//! | DecodeFailure      | yes  | redelivery cannot fix a malformed payload    |
//! | Unroutable         | yes  | nothing to persist (or archived if enabled)  |
//! | DeliveryFailed     | no   | the transport redelivers the whole message   |
//!
//! A redelivered message runs both branches again, including the one that
//! already succeeded. Sinks therefore see duplicates.

use crate::config::PipelineConfig;
use crate::fanout::{BatcherStats, BranchOutcome, FanoutCoordinator};
use crate::sink::{BlobStore, TableStore, is_valid_table_name};
use crate::source::{ReceivedMessage, Subscription};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tributary_core::metrics::HealthState;
use tributary_core::{Classification, Decoder, RawMessage, RoutingTable};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Archived and appended.
    Delivered,
    /// Not a UTF-8 JSON object; dropped.
    DecodeFailure,
    /// Valid event with no route; not persisted to a table.
    Unroutable,
    /// At least one sink branch failed after retries.
    DeliveryFailed,
}

impl Disposition {
    /// Whether the inbound message should be acknowledged.
    pub fn should_ack(self) -> bool {
        !matches!(self, Self::DeliveryFailed)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delivered => "delivered",
            Self::DecodeFailure => "decode_failure",
            Self::Unroutable => "unroutable",
            Self::DeliveryFailed => "delivery_failed",
        };
        f.write_str(s)
    }
}

/// Run statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub delivered: u64,
    pub decode_failures: u64,
    pub unroutable: u64,
    pub delivery_failures: u64,
    pub acked: u64,
    pub nacked: u64,
    pub ack_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    decode_failures: AtomicU64,
    unroutable: AtomicU64,
    delivery_failures: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    ack_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            ack_errors: self.ack_errors.load(Ordering::Relaxed),
        }
    }
}

/// Decode → classify → fan-out, with concurrency and ack handling.
pub struct Pipeline {
    decoder: Decoder,
    routing: RoutingTable,
    fanout: FanoutCoordinator,
    config: PipelineConfig,
    health: HealthState,
    counters: Counters,
}

impl Pipeline {
    /// Build a pipeline over the given stores.
    ///
    /// Spawns the table batcher, so this must run inside a Tokio runtime.
    pub fn new(
        routing: RoutingTable,
        blobs: Arc<dyn BlobStore>,
        tables: Arc<dyn TableStore>,
        config: PipelineConfig,
        health: HealthState,
    ) -> Result<Self> {
        if routing.is_empty() {
            return Err(Error::Config("no routes configured".to_string()));
        }
        for route in routing.routes() {
            if !is_valid_table_name(&route.table) {
                return Err(Error::Config(format!(
                    "invalid table name {:?} for category '{}'",
                    route.table, route.category
                )));
            }
        }
        if config.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }

        let fanout = FanoutCoordinator::new(blobs, tables, config.fanout());

        Ok(Self {
            decoder: Decoder::new(),
            routing,
            fanout,
            config,
            health,
            counters: Counters::default(),
        })
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Process one message end to end and report what happened.
    ///
    /// Never fails: every failure mode is a [`Disposition`].
    pub async fn process(&self, raw: &RawMessage) -> Disposition {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_messages_total").increment(1);

        let disposition = self.process_inner(raw).await;

        let counter = match disposition {
            Disposition::Delivered => {
                self.health.record_success();
                &self.counters.delivered
            }
            Disposition::DecodeFailure => &self.counters.decode_failures,
            Disposition::Unroutable => &self.counters.unroutable,
            Disposition::DeliveryFailed => {
                self.health.record_failure();
                &self.counters.delivery_failures
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);

        disposition
    }

    async fn process_inner(&self, raw: &RawMessage) -> Disposition {
        let event = match self.decoder.decode(raw) {
            Ok(event) => event,
            Err(failure) => {
                tracing::warn!(
                    message_id = %failure.message_id,
                    payload_len = failure.payload_len,
                    preview = %failure.preview,
                    error = %failure.error,
                    "dropping undecodable message"
                );
                metrics::counter!("ingest_decode_failures_total").increment(1);
                return Disposition::DecodeFailure;
            }
        };

        match self.routing.classify(event) {
            Classification::Routed { event, route } => {
                let delivery = self.fanout.deliver(&event, &route).await;
                if delivery.is_complete() {
                    Disposition::Delivered
                } else {
                    tracing::warn!(
                        message_id = event.message_id(),
                        category = %route.category,
                        key = %delivery.key,
                        table = %route.table,
                        archive = ?delivery.archive,
                        table_outcome = ?delivery.table,
                        "delivery incomplete, leaving message for redelivery"
                    );
                    Disposition::DeliveryFailed
                }
            }
            Classification::Unroutable { event, reason } => {
                tracing::warn!(
                    message_id = event.message_id(),
                    reason = %reason,
                    "unroutable event"
                );
                metrics::counter!("ingest_unroutable_total").increment(1);

                if !self.config.archive_unroutable {
                    return Disposition::Unroutable;
                }
                match self.fanout.archive_unroutable(&event).await {
                    BranchOutcome::Failed(_) => Disposition::DeliveryFailed,
                    BranchOutcome::Written | BranchOutcome::Skipped => Disposition::Unroutable,
                }
            }
        }
    }

    async fn handle(&self, subscription: &dyn Subscription, received: ReceivedMessage) {
        metrics::gauge!("ingest_inflight").increment(1.0);

        if received.delivery_attempt > 1 {
            tracing::debug!(
                message_id = %received.message.message_id,
                attempt = received.delivery_attempt,
                "processing redelivered message"
            );
        }

        let disposition = self.process(&received.message).await;

        let result = if disposition.should_ack() {
            self.counters.acked.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("ingest_messages_acked_total").increment(1);
            subscription.ack(received.ack_id).await
        } else {
            self.counters.nacked.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("ingest_messages_nacked_total").increment(1);
            subscription.nack(received.ack_id).await
        };

        if let Err(e) = result {
            self.counters.ack_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message_id = %received.message.message_id,
                disposition = %disposition,
                error = %e,
                "failed to settle message"
            );
        }

        metrics::gauge!("ingest_inflight").decrement(1.0);
    }

    /// Pull and process messages until `running` is cleared or the
    /// subscription ends, then drain in-flight work.
    ///
    /// Does not stop the table batcher; call [`shutdown`](Self::shutdown)
    /// afterwards.
    pub async fn run(
        self: Arc<Self>,
        subscription: Arc<dyn Subscription>,
        running: Arc<AtomicBool>,
    ) -> Result<PipelineStats> {
        let workers = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks: JoinSet<()> = JoinSet::new();

        tracing::info!(
            subscription = subscription.name(),
            workers = self.config.workers,
            pull_batch = self.config.pull_batch,
            routes = self.routing.len(),
            "pipeline starting"
        );
        metrics::gauge!("ingest_running").set(1.0);

        while running.load(Ordering::SeqCst) {
            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            let available = workers.available_permits();
            if available == 0 {
                if let Some(joined) = tasks.join_next().await {
                    log_join_error(joined);
                }
                continue;
            }

            let batch = match subscription.pull(available.min(self.config.pull_batch.max(1))).await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    tracing::info!(subscription = subscription.name(), "subscription exhausted");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pull failed, backing off");
                    tokio::time::sleep(self.config.pull_error_backoff).await;
                    continue;
                }
            };

            for received in batch {
                let permit = workers
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Subscription("worker pool closed".to_string()))?;
                let pipeline = self.clone();
                let subscription = subscription.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    pipeline.handle(subscription.as_ref(), received).await;
                });
            }
        }

        if !tasks.is_empty() {
            tracing::info!(inflight = tasks.len(), "draining in-flight messages");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }
        metrics::gauge!("ingest_running").set(0.0);

        let stats = self.stats();
        tracing::info!(
            received = stats.received,
            delivered = stats.delivered,
            nacked = stats.nacked,
            "pipeline stopped"
        );
        Ok(stats)
    }

    /// Flush buffered table rows and stop the batcher.
    pub async fn shutdown(&self) -> BatcherStats {
        self.fanout.shutdown().await
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "message worker panicked");
    }
}
