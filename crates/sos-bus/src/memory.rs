//! In-memory bus driver.
//!
//! Backs tests and single-process deployments. Pub/sub rides a broadcast
//! ring buffer (laggards drop messages, as on the real substrate); direct
//! queues and streams are owned structures behind per-queue mutexes. The
//! one semantic this driver does not provide is crash redelivery of
//! in-flight stream entries, which a single-process deployment cannot
//! observe anyway.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use sos_types::MessageEnvelope;

use crate::channel::{channel_matches, dlq_channel};
use crate::{
    redelivery_backoff, BusError, BusResult, Delivery, QueueBus, StreamEntry,
    MAX_DELIVERY_ATTEMPTS,
};

const DEFAULT_PUBSUB_CAPACITY: usize = 1024;

//─────────────────────────────
//  Subscriptions
//─────────────────────────────

enum SubscriptionRx {
    Broadcast(broadcast::Receiver<(String, MessageEnvelope)>),
    Channel(mpsc::Receiver<(String, MessageEnvelope)>),
}

/// A live channel subscription.
///
/// `recv` yields `(channel, envelope)` pairs whose channel matches the
/// subscribed pattern; `None` means the bus shut down.
pub struct Subscription {
    pattern: String,
    rx: SubscriptionRx,
}

impl Subscription {
    pub(crate) fn broadcast(
        pattern: &str,
        rx: broadcast::Receiver<(String, MessageEnvelope)>,
    ) -> Self {
        Self {
            pattern: pattern.to_owned(),
            rx: SubscriptionRx::Broadcast(rx),
        }
    }

    pub(crate) fn channel(pattern: &str, rx: mpsc::Receiver<(String, MessageEnvelope)>) -> Self {
        Self {
            pattern: pattern.to_owned(),
            rx: SubscriptionRx::Channel(rx),
        }
    }

    /// The pattern this subscription was created with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Wait for the next matching message.
    pub async fn recv(&mut self) -> Option<(String, MessageEnvelope)> {
        loop {
            let item = match &mut self.rx {
                SubscriptionRx::Broadcast(rx) => match rx.recv().await {
                    Ok(item) => item,
                    // Lagged subscribers skip ahead; closed means shutdown.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                SubscriptionRx::Channel(rx) => rx.recv().await?,
            };
            if channel_matches(&self.pattern, &item.0) {
                return Some(item);
            }
        }
    }
}

//─────────────────────────────
//  Direct queues
//─────────────────────────────

#[derive(Debug)]
struct PendingDelivery {
    id: String,
    attempts: u32,
    available_at: Instant,
    envelope: MessageEnvelope,
}

#[derive(Debug, Default)]
struct DirectQueue {
    ready: VecDeque<PendingDelivery>,
    in_flight: HashMap<String, PendingDelivery>,
    next_id: u64,
}

//─────────────────────────────
//  Streams
//─────────────────────────────

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: HashSet<String>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<(String, MessageEnvelope)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct StreamShared {
    state: Mutex<StreamState>,
    appended: Notify,
}

//─────────────────────────────
//  The driver
//─────────────────────────────

/// In-memory implementation of [`QueueBus`].
pub struct MemoryBus {
    pubsub_tx: broadcast::Sender<(String, MessageEnvelope)>,
    direct: DashMap<String, Arc<Mutex<DirectQueue>>>,
    dlq: DashMap<String, Vec<MessageEnvelope>>,
    streams: DashMap<String, Arc<StreamShared>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_PUBSUB_CAPACITY)
    }
}

impl MemoryBus {
    /// Bus whose pub/sub ring holds `capacity` messages for slow readers.
    pub fn new(capacity: usize) -> Self {
        let (pubsub_tx, _) = broadcast::channel(capacity);
        Self {
            pubsub_tx,
            direct: DashMap::new(),
            dlq: DashMap::new(),
            streams: DashMap::new(),
        }
    }

    fn direct_queue(&self, queue: &str) -> Arc<Mutex<DirectQueue>> {
        self.direct
            .entry(queue.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(DirectQueue::default())))
            .clone()
    }

    fn stream(&self, stream: &str) -> Arc<StreamShared> {
        self.streams
            .entry(stream.to_owned())
            .or_insert_with(|| Arc::new(StreamShared::default()))
            .clone()
    }
}

#[async_trait::async_trait]
impl QueueBus for MemoryBus {
    async fn publish(&self, channel: &str, envelope: &MessageEnvelope) -> BusResult<()> {
        // No subscribers is fine; fire-and-forget.
        let _ = self.pubsub_tx.send((channel.to_owned(), envelope.clone()));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<Subscription> {
        Ok(Subscription::broadcast(pattern, self.pubsub_tx.subscribe()))
    }

    async fn send_direct(&self, queue: &str, envelope: &MessageEnvelope) -> BusResult<()> {
        let handle = self.direct_queue(queue);
        let mut q = handle.lock().await;
        let id = format!("d-{}", q.next_id);
        q.next_id += 1;
        q.ready.push_back(PendingDelivery {
            id,
            attempts: 0,
            available_at: Instant::now(),
            envelope: envelope.clone(),
        });
        Ok(())
    }

    async fn receive_direct(&self, queue: &str) -> BusResult<Option<Delivery>> {
        let handle = self.direct_queue(queue);
        let mut q = handle.lock().await;
        let now = Instant::now();
        // Enqueue order per consumer: first eligible wins, backoff holds
        // later arrivals in place.
        let Some(pos) = q.ready.iter().position(|d| d.available_at <= now) else {
            return Ok(None);
        };
        let mut pending = q.ready.remove(pos).expect("position just found");
        pending.attempts += 1;
        let delivery = Delivery {
            delivery_id: pending.id.clone(),
            attempts: pending.attempts,
            envelope: pending.envelope.clone(),
        };
        q.in_flight.insert(pending.id.clone(), pending);
        Ok(Some(delivery))
    }

    async fn ack_direct(&self, queue: &str, delivery_id: &str) -> BusResult<()> {
        let handle = self.direct_queue(queue);
        let mut q = handle.lock().await;
        q.in_flight
            .remove(delivery_id)
            .map(|_| ())
            .ok_or_else(|| BusError::Unknown(format!("delivery {delivery_id}")))
    }

    async fn nack_direct(&self, queue: &str, delivery_id: &str) -> BusResult<()> {
        let handle = self.direct_queue(queue);
        let mut q = handle.lock().await;
        let mut pending = q
            .in_flight
            .remove(delivery_id)
            .ok_or_else(|| BusError::Unknown(format!("delivery {delivery_id}")))?;
        if pending.attempts >= MAX_DELIVERY_ATTEMPTS {
            debug!(queue, delivery = %pending.id, "delivery exhausted, dead-lettering");
            self.dlq
                .entry(dlq_channel(queue))
                .or_default()
                .push(pending.envelope);
            return Ok(());
        }
        pending.available_at = Instant::now() + redelivery_backoff(pending.attempts - 1);
        q.ready.push_back(pending);
        Ok(())
    }

    async fn dlq_len(&self, queue: &str) -> BusResult<usize> {
        Ok(self
            .dlq
            .get(&dlq_channel(queue))
            .map(|v| v.len())
            .unwrap_or(0))
    }

    async fn drain_dlq(&self, queue: &str) -> BusResult<Vec<MessageEnvelope>> {
        Ok(self
            .dlq
            .remove(&dlq_channel(queue))
            .map(|(_, v)| v)
            .unwrap_or_default())
    }

    async fn stream_append(&self, stream: &str, envelope: &MessageEnvelope) -> BusResult<String> {
        let shared = self.stream(stream);
        let mut state = shared.state.lock().await;
        let entry_id = format!("{}-0", state.next_seq);
        state.next_seq += 1;
        state.entries.push((entry_id.clone(), envelope.clone()));
        drop(state);
        shared.appended.notify_waiters();
        Ok(entry_id)
    }

    async fn stream_len(&self, stream: &str) -> BusResult<usize> {
        let shared = self.stream(stream);
        let state = shared.state.lock().await;
        Ok(state.entries.len())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BusResult<()> {
        let shared = self.stream(stream);
        let mut state = shared.state.lock().await;
        state.groups.entry(group.to_owned()).or_default();
        Ok(())
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: std::time::Duration,
    ) -> BusResult<Vec<StreamEntry>> {
        let shared = self.stream(stream);
        let deadline = Instant::now() + block;
        loop {
            {
                let mut state = shared.state.lock().await;
                let total = state.entries.len();
                let group_state = state
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| BusError::Unknown(format!("group {group} on {stream}")))?;
                if group_state.cursor < total {
                    let start = group_state.cursor;
                    let end = (start + count).min(total);
                    group_state.cursor = end;
                    let mut ids = Vec::with_capacity(end - start);
                    for idx in start..end {
                        ids.push(idx);
                    }
                    let mut out = Vec::with_capacity(ids.len());
                    for idx in ids {
                        let (entry_id, envelope) = state.entries[idx].clone();
                        state
                            .groups
                            .get_mut(group)
                            .expect("group exists")
                            .pending
                            .insert(entry_id.clone());
                        out.push(StreamEntry { entry_id, envelope });
                    }
                    return Ok(out);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, shared.appended.notified()).await;
        }
    }

    async fn stream_ack(&self, stream: &str, group: &str, entry_id: &str) -> BusResult<()> {
        let shared = self.stream(stream);
        let mut state = shared.state.lock().await;
        if let Some(group_state) = state.groups.get_mut(group) {
            group_state.pending.remove(entry_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sos_types::{MessageKind, Subject};
    use std::time::Duration;

    fn envelope(target: &str, n: u64) -> MessageEnvelope {
        MessageEnvelope::new(
            MessageKind::Event,
            Subject::service("test"),
            target,
            json!({ "n": n }),
        )
    }

    #[tokio::test]
    async fn pubsub_wildcards_observe_matching_channels() {
        let bus = MemoryBus::default();
        let mut squads = bus.subscribe("squad:*").await.unwrap();
        let mut exact = bus.subscribe("squad:alpha").await.unwrap();

        bus.publish("squad:alpha", &envelope("squad:alpha", 1)).await.unwrap();
        bus.publish("heartbeat:kasra", &envelope("heartbeat:kasra", 2)).await.unwrap();
        bus.publish("squad:beta", &envelope("squad:beta", 3)).await.unwrap();

        let (channel, _) = squads.recv().await.unwrap();
        assert_eq!(channel, "squad:alpha");
        let (channel, _) = squads.recv().await.unwrap();
        assert_eq!(channel, "squad:beta");

        let (channel, _) = exact.recv().await.unwrap();
        assert_eq!(channel, "squad:alpha");
    }

    #[tokio::test]
    async fn direct_delivery_is_in_enqueue_order_and_acks_remove() {
        let bus = MemoryBus::default();
        let queue = "agent:kasra:inbox";
        for n in 0..3 {
            bus.send_direct(queue, &envelope(queue, n)).await.unwrap();
        }
        for expected in 0..3u64 {
            let delivery = bus.receive_direct(queue).await.unwrap().unwrap();
            assert_eq!(delivery.envelope.payload.content["n"], expected);
            assert_eq!(delivery.attempts, 1);
            bus.ack_direct(queue, &delivery.delivery_id).await.unwrap();
        }
        assert!(bus.receive_direct(queue).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nacked_delivery_backs_off_then_redelivers() {
        let bus = MemoryBus::default();
        let queue = "agent:kasra:inbox";
        bus.send_direct(queue, &envelope(queue, 7)).await.unwrap();

        let first = bus.receive_direct(queue).await.unwrap().unwrap();
        bus.nack_direct(queue, &first.delivery_id).await.unwrap();

        // Backoff holds the message for one second.
        assert!(bus.receive_direct(queue).await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(1100)).await;
        let second = bus.receive_direct(queue).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn third_failed_delivery_dead_letters() {
        let bus = MemoryBus::default();
        let queue = "agent:kasra:inbox";
        bus.send_direct(queue, &envelope(queue, 9)).await.unwrap();

        for advance_ms in [1100, 2100, 0] {
            let delivery = bus.receive_direct(queue).await.unwrap().unwrap();
            bus.nack_direct(queue, &delivery.delivery_id).await.unwrap();
            if advance_ms > 0 {
                tokio::time::advance(Duration::from_millis(advance_ms)).await;
            }
        }
        assert_eq!(bus.dlq_len(queue).await.unwrap(), 1);
        assert!(bus.receive_direct(queue).await.unwrap().is_none());

        let dead = bus.drain_dlq(queue).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload.content["n"], 9);
        assert_eq!(bus.dlq_len(queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stream_group_reads_and_acks() {
        let bus = MemoryBus::default();
        let stream = "sos:queue:global";
        bus.ensure_group(stream, "workers").await.unwrap();

        for n in 0..5 {
            bus.stream_append(stream, &envelope(stream, n)).await.unwrap();
        }
        assert_eq!(bus.stream_len(stream).await.unwrap(), 5);

        let batch = bus
            .stream_read_group(stream, "workers", "w-1", 3, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        for entry in &batch {
            bus.stream_ack(stream, "workers", &entry.entry_id).await.unwrap();
        }

        let rest = bus
            .stream_read_group(stream, "workers", "w-2", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);

        // Drained: an empty non-blocking read.
        let empty = bus
            .stream_read_group(stream, "workers", "w-1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let bus = Arc::new(MemoryBus::default());
        let stream = "sos:queue:global";
        bus.ensure_group(stream, "workers").await.unwrap();

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.stream_read_group(stream, "workers", "w-1", 1, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.stream_append(stream, &envelope(stream, 42)).await.unwrap();

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].envelope.payload.content["n"], 42);
    }
}
