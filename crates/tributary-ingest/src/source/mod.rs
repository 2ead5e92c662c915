//! Inbound transport adapters.
//!
//! The pipeline consumes a [`Subscription`]: a pull-based queue with
//! explicit acknowledgement. A message that is pulled but never acked (or
//! is nacked) is delivered again, so every consumer must tolerate
//! duplicates.
//!
//! # Available Sources
//!
//! - [`MemorySubscription`] - in-process queue with redelivery and a
//!   delivery limit
//! - [`JsonlSource`] - publishes one message per line of a JSONL file,
//!   directory, or stdin into a [`MemorySubscription`]

mod jsonl;
mod memory;

pub use jsonl::{JsonlConfig, JsonlInput, JsonlSource, SourceStats};
pub use memory::{MemorySubscription, MemorySubscriptionConfig, SubscriptionStats};

use crate::Result;
use async_trait::async_trait;
use tributary_core::RawMessage;

/// Opaque handle used to acknowledge one delivery of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckId(pub u64);

/// A message as handed out by [`Subscription::pull`].
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Handle for ack/nack of this delivery.
    pub ack_id: AckId,

    /// The message itself.
    pub message: RawMessage,

    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_attempt: u32,
}

/// A subscription on an at-least-once message queue.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Pull up to `max` messages.
    ///
    /// Returns `Ok(Some(vec![]))` when nothing arrived within the poll
    /// window and `Ok(None)` once the subscription is closed and has
    /// nothing left to deliver.
    async fn pull(&self, max: usize) -> Result<Option<Vec<ReceivedMessage>>>;

    /// Acknowledge a delivery; the message will not be delivered again.
    async fn ack(&self, ack_id: AckId) -> Result<()>;

    /// Reject a delivery; the message becomes available for redelivery.
    async fn nack(&self, ack_id: AckId) -> Result<()>;
}
