//! In-process broker with partitions, consumer groups and redelivery.
//!
//! Each consumer group tracks a committed offset per partition. Fetching
//! leases the partition's next uncommitted message; while the lease is held no
//! other message from that partition is handed out, which keeps per-key order.
//! A lease that is not committed within the redelivery timeout expires and the
//! same message is delivered again, up to a delivery limit after which the
//! message is skipped so later messages on the partition are not starved.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Broker, ConsumerStats, Header, Message, MessageSource, OutgoingMessage};
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Upper bound on a single idle wait, so expiring leases are noticed.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

/// Deliveries of one message before it is skipped, unless configured.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Partition for `key` among `partitions`.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let hash = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

#[derive(Debug, Clone)]
struct Record {
    key: String,
    payload: Vec<u8>,
    headers: Vec<Header>,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    delivery_id: u64,
    expires_at: Instant,
}

#[derive(Debug, Default, Clone)]
struct GroupPartition {
    /// Next offset to deliver
    committed: u64,
    lease: Option<Lease>,
    /// Times the message at `committed` has been handed out
    deliveries: u32,
}

#[derive(Debug)]
struct Topic {
    partitions: Vec<Vec<Record>>,
    groups: HashMap<String, Vec<GroupPartition>>,
}

impl Topic {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions.max(1) as usize],
            groups: HashMap::new(),
        }
    }

    fn group(&mut self, name: &str) -> &mut Vec<GroupPartition> {
        let count = self.partitions.len();
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| vec![GroupPartition::default(); count])
    }

    fn append(&mut self, message: OutgoingMessage) -> (u32, u64) {
        let partition = partition_for(&message.key, self.partitions.len() as u32);
        let log = &mut self.partitions[partition as usize];
        log.push(Record {
            key: message.key,
            payload: message.payload,
            headers: message.headers,
        });
        (partition, log.len() as u64 - 1)
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Topic>,
    next_delivery: u64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    default_partitions: u32,
    redelivery_timeout: Duration,
    /// 0 redelivers forever
    max_deliveries: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker. Cloning shares the same topics.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new(default_partitions: u32, redelivery_timeout: Duration) -> Self {
        Self::with_max_deliveries(default_partitions, redelivery_timeout, DEFAULT_MAX_DELIVERIES)
    }

    /// Like [`new`](Self::new), skipping a message once it has been delivered
    /// `max_deliveries` times without a commit. Zero never skips.
    pub fn with_max_deliveries(
        default_partitions: u32,
        redelivery_timeout: Duration,
        max_deliveries: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                default_partitions: default_partitions.max(1),
                redelivery_timeout,
                max_deliveries,
            }),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::with_max_deliveries(
            config.partitions,
            config.redelivery_timeout(),
            config.max_deliveries,
        )
    }

    /// Join `group` on `topic`, creating either if needed.
    ///
    /// A new group starts from the earliest offset.
    pub fn subscribe(&self, topic: &str, group: &str) -> MemorySubscription {
        {
            let mut state = self.shared.lock();
            let partitions = self.shared.default_partitions;
            state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(partitions))
                .group(group);
        }
        MemorySubscription {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            group: group.to_string(),
            closed: AtomicBool::new(false),
            messages: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Partition count of `topic`, if it exists.
    pub fn partitions(&self, topic: &str) -> Option<u32> {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|t| t.partitions.len() as u32)
    }

    /// Total messages ever published to `topic`.
    pub fn published(&self, topic: &str) -> u64 {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|t| t.partitions.iter().map(|p| p.len() as u64).sum())
            .unwrap_or(0)
    }

    fn append_all(&self, topic: &str, messages: Vec<OutgoingMessage>) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let partitions = self.shared.default_partitions;
            let topic_state = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(partitions));
            for message in messages {
                let (partition, offset) = topic_state.append(message);
                tracing::trace!(topic, partition, offset, "Message appended");
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<(), BrokerError> {
        self.append_all(topic, vec![message])
    }

    async fn publish_batch(
        &self,
        topic: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<(), BrokerError> {
        self.append_all(topic, messages)
    }

    async fn ensure_topic(
        &self,
        topic: &str,
        partitions: u32,
        replication_factor: u32,
    ) -> Result<(), BrokerError> {
        if partitions == 0 || replication_factor == 0 {
            return Err(BrokerError::Topic {
                topic: topic.to_string(),
                message: "partitions and replication factor must be > 0".to_string(),
            });
        }
        let mut state = self.shared.lock();
        if state.topics.contains_key(topic) {
            tracing::debug!(topic, "Topic already exists");
        } else {
            tracing::info!(topic, partitions, replication_factor, "Created topic");
            state.topics.insert(topic.to_string(), Topic::new(partitions));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Outcome of one attempt to lease a message.
enum Poll {
    Leased(Message),
    /// Nothing available; the earliest lease expiry, if any lease is held
    Idle(Option<Instant>),
}

/// A consumer-group membership on one topic.
#[derive(Debug)]
pub struct MemorySubscription {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    closed: AtomicBool,
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl MemorySubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn try_lease(&self) -> Result<Poll, BrokerError> {
        let now = Instant::now();
        let timeout = self.shared.redelivery_timeout;
        let max_deliveries = self.shared.max_deliveries;
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let delivery_id = state.next_delivery;
        let topic = state
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| BrokerError::Fetch {
                message: format!("unknown topic {}", self.topic),
            })?;
        let Topic { partitions, groups } = topic;
        let group = groups
            .get_mut(&self.group)
            .ok_or_else(|| BrokerError::Fetch {
                message: format!("unknown group {}", self.group),
            })?;

        let mut next_expiry: Option<Instant> = None;
        for (index, (log, cursor)) in partitions.iter().zip(group.iter_mut()).enumerate() {
            if let Some(lease) = cursor.lease {
                if lease.expires_at > now {
                    next_expiry = Some(
                        next_expiry.map_or(lease.expires_at, |t| t.min(lease.expires_at)),
                    );
                    continue;
                }
                cursor.lease = None;
                if max_deliveries > 0 && cursor.deliveries >= max_deliveries {
                    tracing::warn!(
                        topic = %self.topic,
                        partition = index,
                        offset = cursor.committed,
                        deliveries = cursor.deliveries,
                        "Delivery limit reached, skipping message"
                    );
                    cursor.committed += 1;
                    cursor.deliveries = 0;
                } else {
                    tracing::debug!(
                        topic = %self.topic,
                        partition = index,
                        offset = cursor.committed,
                        delivery_id = lease.delivery_id,
                        "Lease expired, redelivering"
                    );
                }
            }
            let Some(record) = log.get(cursor.committed as usize) else {
                cursor.lease = None;
                continue;
            };
            cursor.lease = Some(Lease {
                delivery_id,
                expires_at: now + timeout,
            });
            cursor.deliveries += 1;
            let message = Message {
                topic: self.topic.clone(),
                partition: index as u32,
                offset: cursor.committed,
                key: record.key.clone(),
                payload: record.payload.clone(),
                headers: record.headers.clone(),
                delivery_id,
            };
            state.next_delivery += 1;
            return Ok(Poll::Leased(message));
        }
        Ok(Poll::Idle(next_expiry))
    }
}

#[async_trait]
impl MessageSource for MemorySubscription {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Message, BrokerError> {
        loop {
            // Register for wakeups before inspecting state so a publish or
            // commit between the check and the wait is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            let next_expiry = match self.try_lease()? {
                Poll::Leased(message) => {
                    self.messages.fetch_add(1, Ordering::Relaxed);
                    self.bytes
                        .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
                    return Ok(message);
                }
                Poll::Idle(next_expiry) => next_expiry,
            };

            let wait = next_expiry
                .map(|t| t.saturating_duration_since(Instant::now()))
                .unwrap_or(MAX_IDLE_WAIT)
                .min(MAX_IDLE_WAIT);

            tokio::select! {
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn commit(&self, message: &Message) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            let cursor = state
                .topics
                .get_mut(&message.topic)
                .and_then(|topic| topic.groups.get_mut(&self.group))
                .and_then(|group| group.get_mut(message.partition as usize))
                .ok_or_else(|| BrokerError::Commit {
                    offset: message.offset,
                    message: format!(
                        "no partition {} on topic {}",
                        message.partition, message.topic
                    ),
                })?;

            if cursor.committed > message.offset {
                // Already committed by an earlier delivery
                return Ok(());
            }
            match cursor.lease {
                Some(lease) if lease.delivery_id == message.delivery_id => {
                    cursor.committed = message.offset + 1;
                    cursor.lease = None;
                    cursor.deliveries = 0;
                }
                _ => {
                    return Err(BrokerError::Commit {
                        offset: message.offset,
                        message: "lease was re-granted to a newer delivery".to_string(),
                    })
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn stats(&self) -> ConsumerStats {
        let state = self.shared.lock();
        let lag = state
            .topics
            .get(&self.topic)
            .and_then(|topic| {
                topic.groups.get(&self.group).map(|group| {
                    topic
                        .partitions
                        .iter()
                        .zip(group)
                        .map(|(log, cursor)| (log.len() as u64).saturating_sub(cursor.committed))
                        .sum::<u64>()
                })
            })
            .unwrap_or(0);
        ConsumerStats {
            messages: self.messages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            lag,
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str, payload: &str) -> OutgoingMessage {
        OutgoingMessage {
            key: key.into(),
            payload: payload.as_bytes().to_vec(),
            headers: vec![Header::new("task-id", payload)],
        }
    }

    #[test]
    fn test_partition_is_stable_per_key() {
        let p = partition_for("image-1", 3);
        assert!(p < 3);
        for _ in 0..10 {
            assert_eq!(partition_for("image-1", 3), p);
        }
        assert_eq!(partition_for("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_same_key_is_delivered_in_order() {
        let broker = MemoryBroker::new(3, Duration::from_secs(30));
        let sub = broker.subscribe("tasks", "workers");
        for n in 0..3 {
            broker
                .publish("tasks", message("image-1", &format!("m{n}")))
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        for n in 0..3 {
            let m = sub.fetch(&cancel).await.unwrap();
            assert_eq!(m.payload, format!("m{n}").into_bytes());
            assert_eq!(m.header("task-id"), Some(format!("m{n}").as_str()));
            sub.commit(&m).await.unwrap();
        }
        assert_eq!(sub.stats().lag, 0);
        assert_eq!(sub.stats().messages, 3);
    }

    #[tokio::test]
    async fn test_partition_is_leased_until_commit() {
        let broker = MemoryBroker::new(1, Duration::from_secs(30));
        let sub = broker.subscribe("tasks", "workers");
        broker.publish("tasks", message("k", "a")).await.unwrap();
        broker.publish("tasks", message("k", "b")).await.unwrap();

        let cancel = CancellationToken::new();
        let first = sub.fetch(&cancel).await.unwrap();
        assert_eq!(first.payload, b"a");

        // The only partition is leased, so a second fetch has to wait
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), sub.fetch(&cancel)).await;
        assert!(blocked.is_err());

        sub.commit(&first).await.unwrap();
        let second = sub.fetch(&cancel).await.unwrap();
        assert_eq!(second.payload, b"b");
    }

    #[tokio::test]
    async fn test_uncommitted_message_is_redelivered_after_timeout() {
        let broker = MemoryBroker::new(1, Duration::from_millis(20));
        let sub = broker.subscribe("tasks", "workers");
        broker.publish("tasks", message("k", "a")).await.unwrap();

        let cancel = CancellationToken::new();
        let first = sub.fetch(&cancel).await.unwrap();
        let again = sub.fetch(&cancel).await.unwrap();
        assert_eq!(again.offset, first.offset);
        assert_ne!(again.delivery_id, first.delivery_id);

        // The stale delivery can no longer commit; the fresh one can
        assert!(matches!(
            sub.commit(&first).await,
            Err(BrokerError::Commit { .. })
        ));
        sub.commit(&again).await.unwrap();
        assert_eq!(sub.stats().lag, 0);
    }

    #[tokio::test]
    async fn test_message_is_skipped_after_delivery_limit() {
        let broker = MemoryBroker::with_max_deliveries(1, Duration::from_millis(10), 3);
        let sub = broker.subscribe("tasks", "workers");
        broker.publish("tasks", message("k", "poison")).await.unwrap();
        broker.publish("tasks", message("k", "good")).await.unwrap();

        let cancel = CancellationToken::new();
        let mut last = None;
        for _ in 0..3 {
            let m = sub.fetch(&cancel).await.unwrap();
            assert_eq!(m.payload, b"poison");
            last = Some(m);
        }
        let next = sub.fetch(&cancel).await.unwrap();
        assert_eq!(next.payload, b"good");
        assert_eq!(next.offset, 1);

        // A straggling commit for the skipped message is harmless
        sub.commit(&last.unwrap()).await.unwrap();
        sub.commit(&next).await.unwrap();
        assert_eq!(sub.stats().lag, 0);
        assert_eq!(sub.stats().messages, 4);
    }

    #[tokio::test]
    async fn test_zero_delivery_limit_redelivers_forever() {
        let broker = MemoryBroker::with_max_deliveries(1, Duration::ZERO, 0);
        let sub = broker.subscribe("tasks", "workers");
        broker.publish("tasks", message("k", "a")).await.unwrap();
        broker.publish("tasks", message("k", "b")).await.unwrap();

        let cancel = CancellationToken::new();
        for _ in 0..20 {
            assert_eq!(sub.fetch(&cancel).await.unwrap().payload, b"a");
        }
    }

    #[tokio::test]
    async fn test_commit_resets_delivery_count() {
        let broker = MemoryBroker::with_max_deliveries(1, Duration::ZERO, 2);
        let sub = broker.subscribe("tasks", "workers");
        broker.publish("tasks", message("k", "a")).await.unwrap();
        broker.publish("tasks", message("k", "b")).await.unwrap();

        let cancel = CancellationToken::new();
        sub.fetch(&cancel).await.unwrap();
        let a = sub.fetch(&cancel).await.unwrap();
        sub.commit(&a).await.unwrap();

        // "b" gets its own two deliveries
        assert_eq!(sub.fetch(&cancel).await.unwrap().payload, b"b");
        assert_eq!(sub.fetch(&cancel).await.unwrap().payload, b"b");
    }

    #[tokio::test]
    async fn test_late_commit_on_expired_lease_succeeds() {
        let broker = MemoryBroker::new(1, Duration::from_millis(10));
        let sub = broker.subscribe("tasks", "workers");
        broker.publish("tasks", message("k", "a")).await.unwrap();

        let cancel = CancellationToken::new();
        let m = sub.fetch(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        sub.commit(&m).await.unwrap();
        sub.commit(&m).await.unwrap();
        assert_eq!(sub.stats().lag, 0);
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let broker = MemoryBroker::new(2, Duration::from_secs(30));
        let sub = Arc::new(broker.subscribe("tasks", "workers"));
        let cancel = CancellationToken::new();

        let waiter = {
            let sub = Arc::clone(&sub);
            let cancel = cancel.clone();
            tokio::spawn(async move { sub.fetch(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish("tasks", message("k", "late")).await.unwrap();

        let m = waiter.await.unwrap().unwrap();
        assert_eq!(m.payload, b"late");
    }

    #[tokio::test]
    async fn test_fetch_observes_cancellation_and_close() {
        let broker = MemoryBroker::new(1, Duration::from_secs(30));
        let sub = broker.subscribe("tasks", "workers");

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            sub.fetch(&cancel).await,
            Err(BrokerError::Cancelled)
        ));

        sub.close().await.unwrap();
        assert!(matches!(
            sub.fetch(&CancellationToken::new()).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_groups_consume_independently() {
        let broker = MemoryBroker::new(1, Duration::from_secs(30));
        let a = broker.subscribe("tasks", "a");
        let b = broker.subscribe("tasks", "b");
        broker.publish("tasks", message("k", "x")).await.unwrap();

        let cancel = CancellationToken::new();
        let from_a = a.fetch(&cancel).await.unwrap();
        a.commit(&from_a).await.unwrap();
        assert_eq!(a.stats().lag, 0);
        assert_eq!(b.stats().lag, 1);
        assert_eq!(b.fetch(&cancel).await.unwrap().payload, b"x");
    }

    #[tokio::test]
    async fn test_ensure_topic() {
        let broker = MemoryBroker::new(3, Duration::from_secs(30));
        broker.ensure_topic("tasks", 6, 1).await.unwrap();
        assert_eq!(broker.partitions("tasks"), Some(6));
        // Existing topics are left alone
        broker.ensure_topic("tasks", 2, 1).await.unwrap();
        assert_eq!(broker.partitions("tasks"), Some(6));
        assert!(broker.ensure_topic("bad", 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let broker = MemoryBroker::new(1, Duration::from_secs(30));
        broker.close().await.unwrap();
        assert!(matches!(
            broker.publish("tasks", message("k", "x")).await,
            Err(BrokerError::Closed)
        ));
    }
}
