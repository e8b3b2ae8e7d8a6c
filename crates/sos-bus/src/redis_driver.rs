//! Redis-backed bus driver.
//!
//! Channels map to Redis pub/sub, direct queues to a sorted set (scored by
//! availability time) plus an in-flight hash, and the work queue to Redis
//! streams with consumer groups. Pattern subscriptions psubscribe broadly
//! and re-filter with the segment-wise resolver so wildcard semantics stay
//! identical across drivers.

use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use sos_types::MessageEnvelope;

use crate::channel::{channel_matches, dlq_channel};
use crate::memory::Subscription;
use crate::{
    redelivery_backoff, BusError, BusResult, Delivery, QueueBus, StreamEntry,
    MAX_DELIVERY_ATTEMPTS,
};

const ENVELOPE_FIELD: &str = "envelope";

fn transport(err: redis::RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

/// Direct-queue wrapper persisted in Redis: the envelope plus delivery
/// bookkeeping the substrate itself does not track.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirectWrapper {
    delivery_id: String,
    attempts: u32,
    /// Epoch milliseconds before which the message must not be delivered.
    available_at_ms: i64,
    envelope: MessageEnvelope,
}

impl DirectWrapper {
    fn encode(&self) -> BusResult<String> {
        serde_json::to_string(self).map_err(|e| BusError::Codec(e.to_string()))
    }

    fn decode(raw: &str) -> BusResult<Self> {
        serde_json::from_str(raw).map_err(|e| BusError::Codec(e.to_string()))
    }
}

fn inflight_key(queue: &str) -> String {
    format!("{queue}:inflight")
}

/// Redis implementation of [`QueueBus`].
pub struct RedisBus {
    client: Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBus {
    /// Connect to the substrate at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = Client::open(url).map_err(transport)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(transport)?;
        debug!(url, "connected to queue substrate");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> redis::aio::MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait::async_trait]
impl QueueBus for RedisBus {
    async fn publish(&self, channel: &str, envelope: &MessageEnvelope) -> BusResult<()> {
        let wire = envelope.to_wire().map_err(|e| BusError::Codec(e.to_string()))?;
        let mut conn = self.conn();
        let _receivers: i64 = conn.publish(channel, wire).await.map_err(transport)?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<Subscription> {
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(transport)?
            .into_pubsub();
        // Redis globs are broader than the segment grammar (its `*` crosses
        // `:`), so subscribe wide and re-filter locally.
        pubsub.psubscribe(pattern).await.map_err(transport)?;

        let (tx, rx) = mpsc::channel(256);
        let pattern_owned = pattern.to_owned();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_owned();
                if !channel_matches(&pattern_owned, &channel) {
                    continue;
                }
                let Ok(raw) = msg.get_payload::<String>() else {
                    continue;
                };
                match MessageEnvelope::from_wire(&raw) {
                    Ok(envelope) => {
                        if tx.send((channel, envelope)).await.is_err() {
                            break; // subscriber dropped
                        }
                    }
                    Err(e) => warn!(channel, error = %e, "dropping undecodable bus message"),
                }
            }
        });
        Ok(Subscription::channel(pattern, rx))
    }

    async fn send_direct(&self, queue: &str, envelope: &MessageEnvelope) -> BusResult<()> {
        let wrapper = DirectWrapper {
            delivery_id: Uuid::new_v4().to_string(),
            attempts: 0,
            available_at_ms: Utc::now().timestamp_millis(),
            envelope: envelope.clone(),
        };
        let mut conn = self.conn();
        let _: () = conn
            .zadd(queue, wrapper.encode()?, wrapper.available_at_ms)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn receive_direct(&self, queue: &str) -> BusResult<Option<Delivery>> {
        let mut conn = self.conn();
        let now_ms = Utc::now().timestamp_millis();
        // Oldest-available first preserves enqueue order per consumer.
        let popped: Vec<(String, f64)> = conn.zpopmin(queue, 1).await.map_err(transport)?;
        let Some((raw, score)) = popped.into_iter().next() else {
            return Ok(None);
        };
        if score as i64 > now_ms {
            // Not yet due: put it back untouched.
            let _: () = conn
                .zadd(queue, &raw, score as i64)
                .await
                .map_err(transport)?;
            return Ok(None);
        }
        let mut wrapper = DirectWrapper::decode(&raw)?;
        wrapper.attempts += 1;
        let _: () = conn
            .hset(inflight_key(queue), &wrapper.delivery_id, wrapper.encode()?)
            .await
            .map_err(transport)?;
        Ok(Some(Delivery {
            delivery_id: wrapper.delivery_id.clone(),
            attempts: wrapper.attempts,
            envelope: wrapper.envelope,
        }))
    }

    async fn ack_direct(&self, queue: &str, delivery_id: &str) -> BusResult<()> {
        let mut conn = self.conn();
        let removed: i64 = conn
            .hdel(inflight_key(queue), delivery_id)
            .await
            .map_err(transport)?;
        if removed == 0 {
            return Err(BusError::Unknown(format!("delivery {delivery_id}")));
        }
        Ok(())
    }

    async fn nack_direct(&self, queue: &str, delivery_id: &str) -> BusResult<()> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .hget(inflight_key(queue), delivery_id)
            .await
            .map_err(transport)?;
        let raw = raw.ok_or_else(|| BusError::Unknown(format!("delivery {delivery_id}")))?;
        let _: i64 = conn
            .hdel(inflight_key(queue), delivery_id)
            .await
            .map_err(transport)?;

        let mut wrapper = DirectWrapper::decode(&raw)?;
        if wrapper.attempts >= MAX_DELIVERY_ATTEMPTS {
            debug!(queue, delivery_id, "delivery exhausted, dead-lettering");
            let wire = wrapper
                .envelope
                .to_wire()
                .map_err(|e| BusError::Codec(e.to_string()))?;
            let _: () = conn
                .lpush(dlq_channel(queue), wire)
                .await
                .map_err(transport)?;
            return Ok(());
        }
        let backoff = redelivery_backoff(wrapper.attempts - 1);
        wrapper.available_at_ms = Utc::now().timestamp_millis() + backoff.as_millis() as i64;
        let _: () = conn
            .zadd(queue, wrapper.encode()?, wrapper.available_at_ms)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn dlq_len(&self, queue: &str) -> BusResult<usize> {
        let mut conn = self.conn();
        let len: i64 = conn.llen(dlq_channel(queue)).await.map_err(transport)?;
        Ok(len as usize)
    }

    async fn drain_dlq(&self, queue: &str) -> BusResult<Vec<MessageEnvelope>> {
        let mut conn = self.conn();
        let key = dlq_channel(queue);
        let raws: Vec<String> = conn.lrange(&key, 0, -1).await.map_err(transport)?;
        let _: () = conn.del(&key).await.map_err(transport)?;
        raws.iter()
            .map(|raw| MessageEnvelope::from_wire(raw).map_err(|e| BusError::Codec(e.to_string())))
            .collect()
    }

    async fn stream_append(&self, stream: &str, envelope: &MessageEnvelope) -> BusResult<String> {
        let wire = envelope.to_wire().map_err(|e| BusError::Codec(e.to_string()))?;
        let mut conn = self.conn();
        let id: String = conn
            .xadd(stream, "*", &[(ENVELOPE_FIELD, wire)])
            .await
            .map_err(transport)?;
        Ok(id)
    }

    async fn stream_len(&self, stream: &str) -> BusResult<usize> {
        let mut conn = self.conn();
        let len: i64 = conn.xlen(stream).await.map_err(transport)?;
        Ok(len as usize)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BusResult<()> {
        let mut conn = self.conn();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(stream, group, "$")
            .await;
        match created {
            Ok(()) => Ok(()),
            // Group already exists: the desired state holds.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(transport(e)),
        }
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(transport)?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let raw: Option<String> = id.get(ENVELOPE_FIELD);
                let Some(raw) = raw else {
                    warn!(stream, entry = %id.id, "stream entry missing envelope field");
                    continue;
                };
                match MessageEnvelope::from_wire(&raw) {
                    Ok(envelope) => entries.push(StreamEntry {
                        entry_id: id.id.clone(),
                        envelope,
                    }),
                    Err(e) => warn!(stream, entry = %id.id, error = %e, "undecodable stream entry"),
                }
            }
        }
        Ok(entries)
    }

    async fn stream_ack(&self, stream: &str, group: &str, entry_id: &str) -> BusResult<()> {
        let mut conn = self.conn();
        let _acked: i64 = conn
            .xack(stream, group, &[entry_id])
            .await
            .map_err(transport)?;
        Ok(())
    }
}
