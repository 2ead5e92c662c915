//! In-process subscription with at-least-once semantics.
//!
//! Messages move between two sets: `pending` (ready to be pulled) and
//! `outstanding` (pulled, awaiting ack/nack). A nack puts the message back
//! at the end of `pending` until it has been delivered `max_deliveries`
//! times, after which it is dead-lettered and dropped from the queue. Only
//! the ids of the most recent dead letters are kept.

use super::{AckId, ReceivedMessage, Subscription};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tributary_core::RawMessage;

/// Configuration for [`MemorySubscription`].
#[derive(Debug, Clone)]
pub struct MemorySubscriptionConfig {
    /// Deliveries before a nacked message is dead-lettered (0 = unlimited).
    pub max_deliveries: u32,

    /// How long `pull` waits for a message before returning an empty batch.
    pub poll_timeout: Duration,

    /// Dead-lettered message ids remembered for inspection.
    pub dead_letter_history: usize,
}

impl Default for MemorySubscriptionConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            poll_timeout: Duration::from_millis(100),
            dead_letter_history: 1000,
        }
    }
}

/// Counters for a [`MemorySubscription`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub published: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,
}

#[derive(Debug)]
struct Entry {
    message: RawMessage,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Entry>,
    outstanding: HashMap<u64, Entry>,
    dead_letters: VecDeque<String>,
    next_ack: u64,
    next_seq: u64,
    closed: bool,
    stats: SubscriptionStats,
}

impl State {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.outstanding.is_empty()
    }
}

/// A queue living in process memory.
#[derive(Debug)]
pub struct MemorySubscription {
    name: String,
    config: MemorySubscriptionConfig,
    state: Mutex<State>,
    /// Signalled when messages become pullable or the queue drains.
    ready: Notify,
    /// Signalled when `pending` shrinks.
    space: Notify,
}

impl MemorySubscription {
    pub fn new(name: impl Into<String>, config: MemorySubscriptionConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Publish a payload under a generated message id.
    pub fn publish(&self, data: impl Into<Vec<u8>>) -> Result<String> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Subscription(format!("{} is closed", self.name)));
        }
        state.next_seq += 1;
        let message_id = format!("{}-{}", self.name, state.next_seq);
        let message = RawMessage::new(message_id.clone(), data.into()).with_publish_time(Utc::now());
        Self::enqueue(&mut state, message);
        drop(state);

        self.ready.notify_waiters();
        Ok(message_id)
    }

    /// Publish a message as-is, keeping its id and publish time.
    pub fn publish_message(&self, message: RawMessage) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Subscription(format!("{} is closed", self.name)));
        }
        Self::enqueue(&mut state, message);
        drop(state);

        self.ready.notify_waiters();
        Ok(())
    }

    fn enqueue(state: &mut State, message: RawMessage) {
        state.pending.push_back(Entry {
            message,
            deliveries: 0,
        });
        state.stats.published += 1;
    }

    /// Stop accepting new messages.
    ///
    /// Pending and outstanding messages are still delivered; `pull` returns
    /// `None` once both are empty.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until fewer than `limit` messages are pending.
    pub async fn wait_for_capacity(&self, limit: usize) {
        loop {
            let notified = self.space.notified();
            if self.state.lock().pending.len() < limit {
                return;
            }
            notified.await;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn outstanding_len(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Ids of the most recently dead-lettered messages, oldest first.
    pub fn dead_letter_ids(&self) -> Vec<String> {
        self.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.state.lock().stats
    }

    fn take_batch(&self, max: usize) -> Option<Option<Vec<ReceivedMessage>>> {
        let mut state = self.state.lock();

        if !state.pending.is_empty() {
            let n = max.max(1).min(state.pending.len());
            let mut batch = Vec::with_capacity(n);
            for _ in 0..n {
                let Some(mut entry) = state.pending.pop_front() else {
                    break;
                };
                entry.deliveries += 1;
                state.next_ack += 1;
                let ack_id = state.next_ack;

                state.stats.delivered += 1;
                if entry.deliveries > 1 {
                    state.stats.redelivered += 1;
                }

                batch.push(ReceivedMessage {
                    ack_id: AckId(ack_id),
                    message: entry.message.clone(),
                    delivery_attempt: entry.deliveries,
                });
                state.outstanding.insert(ack_id, entry);
            }
            return Some(Some(batch));
        }

        if state.closed && state.outstanding.is_empty() {
            return Some(None);
        }

        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, max: usize) -> Result<Option<Vec<ReceivedMessage>>> {
        let deadline = Instant::now() + self.config.poll_timeout;
        loop {
            let notified = self.ready.notified();

            if let Some(result) = self.take_batch(max) {
                if result.is_some() {
                    self.space.notify_waiters();
                }
                return Ok(result);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Some(Vec::new()));
            }
        }
    }

    async fn ack(&self, ack_id: AckId) -> Result<()> {
        let mut state = self.state.lock();
        if state.outstanding.remove(&ack_id.0).is_none() {
            return Err(Error::Subscription(format!(
                "unknown ack id {} on {}",
                ack_id.0, self.name
            )));
        }
        state.stats.acked += 1;
        let drained = state.closed && state.is_drained();
        drop(state);

        if drained {
            self.ready.notify_waiters();
        }
        Ok(())
    }

    async fn nack(&self, ack_id: AckId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.outstanding.remove(&ack_id.0) else {
            return Err(Error::Subscription(format!(
                "unknown ack id {} on {}",
                ack_id.0, self.name
            )));
        };
        state.stats.nacked += 1;

        let age_ms = entry
            .message
            .publish_time
            .map(|t| (Utc::now() - t).num_milliseconds());
        let limit = self.config.max_deliveries;
        if limit > 0 && entry.deliveries >= limit {
            tracing::error!(
                subscription = %self.name,
                message_id = %entry.message.message_id,
                deliveries = entry.deliveries,
                age_ms,
                "delivery limit reached, dead-lettering message"
            );
            metrics::counter!("ingest_dead_letter_total").increment(1);
            state.stats.dead_lettered += 1;
            if self.config.dead_letter_history > 0 {
                if state.dead_letters.len() >= self.config.dead_letter_history {
                    state.dead_letters.pop_front();
                }
                state.dead_letters.push_back(entry.message.message_id);
            }
        } else {
            tracing::debug!(
                subscription = %self.name,
                message_id = %entry.message.message_id,
                deliveries = entry.deliveries,
                age_ms,
                "message requeued for redelivery"
            );
            state.pending.push_back(entry);
        }
        drop(state);

        self.ready.notify_waiters();
        Ok(())
    }
}
