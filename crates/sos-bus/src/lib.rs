#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-bus** – The queue bus abstraction.
//!
//! The platform depends on three messaging shapes, all carried over one
//! external key/value-with-streams substrate:
//!
//! - **channels** (`squad:<id>`, `heartbeat:<agent>`): fire-and-forget
//!   pub/sub with wildcard subscriptions for observers;
//! - **direct queues** (`agent:<id>:inbox`): at-least-once delivery with
//!   consumer acks, 1s/2s/4s redelivery backoff, and a dead-letter queue
//!   after three failed deliveries;
//! - **streams** (`sos:queue:global`): persistent append-only logs read
//!   through consumer groups with explicit acknowledgement.
//!
//! Two drivers implement the trait: [`MemoryBus`] for tests and single
//! process deployments, and [`RedisBus`] over the Redis wire protocol.

use async_trait::async_trait;
use std::time::Duration;

use sos_types::MessageEnvelope;

pub mod channel;
pub mod memory;
pub mod redis_driver;

pub use channel::{agent_inbox, channel_matches, dlq_channel, heartbeat_channel, squad_channel};
pub use memory::{MemoryBus, Subscription};
pub use redis_driver::RedisBus;

/// The canonical global work queue stream.
pub const GLOBAL_QUEUE: &str = "sos:queue:global";

/// Failed deliveries before a direct message moves to the dead-letter queue.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Errors surfaced by bus drivers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Substrate connection or protocol failure.
    #[error("bus transport: {0}")]
    Transport(String),
    /// Envelope could not be encoded or decoded.
    #[error("bus codec: {0}")]
    Codec(String),
    /// Referenced queue, stream, or delivery does not exist.
    #[error("bus: unknown {0}")]
    Unknown(String),
}

impl From<BusError> for sos_types::SosError {
    fn from(err: BusError) -> Self {
        sos_types::SosError::Internal(err.to_string())
    }
}

/// Crate result alias.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Redelivery backoff for direct queues: 1s, 2s, 4s.
pub fn redelivery_backoff(attempts: u32) -> Duration {
    Duration::from_secs(1u64 << attempts.min(2))
}

/// One in-flight direct delivery awaiting ack or nack.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Driver-assigned delivery identifier.
    pub delivery_id: String,
    /// How many deliveries this message has seen, this one included.
    pub attempts: u32,
    /// The message.
    pub envelope: MessageEnvelope,
}

/// One entry read from a persistent stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Stream entry id (monotonic per stream).
    pub entry_id: String,
    /// The message.
    pub envelope: MessageEnvelope,
}

/// The bus interface every driver implements.
#[async_trait]
pub trait QueueBus: Send + Sync {
    //─────────────────────────────
    //  Pub/sub channels
    //─────────────────────────────

    /// Publish to a channel. Fire-and-forget: no subscribers, no error.
    async fn publish(&self, channel: &str, envelope: &MessageEnvelope) -> BusResult<()>;

    /// Subscribe to a channel pattern (`squad:*`, `agent:*:events`, or an
    /// exact name). The resolver is deterministic so observer replays are
    /// reproducible.
    async fn subscribe(&self, pattern: &str) -> BusResult<Subscription>;

    //─────────────────────────────
    //  Direct queues
    //─────────────────────────────

    /// Enqueue onto a direct queue.
    async fn send_direct(&self, queue: &str, envelope: &MessageEnvelope) -> BusResult<()>;

    /// Take the next ready delivery, if any. The message stays in flight
    /// until acked or nacked.
    async fn receive_direct(&self, queue: &str) -> BusResult<Option<Delivery>>;

    /// Acknowledge a delivery; the message is gone for good.
    async fn ack_direct(&self, queue: &str, delivery_id: &str) -> BusResult<()>;

    /// Reject a delivery. Requeued with exponential backoff, or moved to
    /// `dlq:<queue>` after [`MAX_DELIVERY_ATTEMPTS`].
    async fn nack_direct(&self, queue: &str, delivery_id: &str) -> BusResult<()>;

    /// Depth of a queue's dead-letter companion.
    async fn dlq_len(&self, queue: &str) -> BusResult<usize>;

    /// Drain and return the dead-letter companion for inspection.
    async fn drain_dlq(&self, queue: &str) -> BusResult<Vec<MessageEnvelope>>;

    //─────────────────────────────
    //  Persistent streams
    //─────────────────────────────

    /// Append to a stream; returns the entry id.
    async fn stream_append(&self, stream: &str, envelope: &MessageEnvelope) -> BusResult<String>;

    /// Current stream length (for backpressure checks).
    async fn stream_len(&self, stream: &str) -> BusResult<usize>;

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> BusResult<()>;

    /// Read up to `count` new entries for `consumer` in `group`, waiting at
    /// most `block` for the first one. Entries stay pending until acked.
    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<StreamEntry>>;

    /// Acknowledge one stream entry for `group`.
    async fn stream_ack(&self, stream: &str, group: &str, entry_id: &str) -> BusResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_one_two_four() {
        assert_eq!(redelivery_backoff(0), Duration::from_secs(1));
        assert_eq!(redelivery_backoff(1), Duration::from_secs(2));
        assert_eq!(redelivery_backoff(2), Duration::from_secs(4));
        // Capped: attempts beyond the dlq threshold never grow further.
        assert_eq!(redelivery_backoff(9), Duration::from_secs(4));
    }
}
