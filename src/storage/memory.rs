//! In-memory storage backend implementation.
//!
//! Each queue is an independent partition holding its messages in enqueue order.
//! Every message sits behind its own async mutex, which is the compare-and-swap
//! point for all state transitions. A locator maps message ids straight to their
//! slot so per-message operations never touch the partition index.
//!
//! Lock order is queue map -> partition index -> locator -> message. A message
//! lock is never held while acquiring any of the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::storage::{ExpiryOutcome, HealthStatus, MessageStore, QueueFilter};
use crate::types::{
    ConsumerToken, Message, MessageId, MessageState, NewMessage, QueueConfig, QueueStats,
    QueueType,
};
use crate::{Error, Result};

/// In-memory storage backend.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<InMemoryBackendInner>,
}

struct InMemoryBackendInner {
    /// Queue partitions by name.
    queues: RwLock<HashMap<String, Arc<QueuePartition>>>,
    /// Message id -> slot.
    locator: RwLock<HashMap<MessageId, MessageSlot>>,
    /// Messages stored across all queues.
    total_messages: AtomicUsize,
    /// Configuration.
    config: InMemoryConfig,
}

/// Configuration for in-memory backend.
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Maximum number of messages across all queues.
    pub max_messages: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: 100_000,
        }
    }
}

/// One queue's configuration and messages.
struct QueuePartition {
    config: RwLock<QueueConfig>,
    /// Messages keyed by enqueue sequence.
    messages: RwLock<BTreeMap<u64, Arc<Mutex<Message>>>>,
    next_sequence: AtomicU64,
    /// Set once the queue is deleted so late writers do not resurrect it.
    deleted: AtomicBool,
}

#[derive(Clone)]
struct MessageSlot {
    partition: Arc<QueuePartition>,
    record: Arc<Mutex<Message>>,
}

fn clear_lease(message: &mut Message) {
    message.consumer_token = None;
    message.visibility_deadline = None;
    message.lease_acquired_at = None;
}

impl InMemoryBackend {
    /// Create a new in-memory backend with default configuration.
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    /// Create a new in-memory backend with custom configuration.
    pub fn with_config(config: InMemoryConfig) -> Self {
        info!(
            max_messages = config.max_messages,
            "Initializing in-memory backend"
        );

        Self {
            inner: Arc::new(InMemoryBackendInner {
                queues: RwLock::new(HashMap::new()),
                locator: RwLock::new(HashMap::new()),
                total_messages: AtomicUsize::new(0),
                config,
            }),
        }
    }

    /// Messages stored across all queues.
    pub fn total_message_count(&self) -> usize {
        self.inner.total_messages.load(Ordering::SeqCst)
    }

    async fn partition(&self, name: &str) -> Result<Arc<QueuePartition>> {
        self.inner
            .queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }

    async fn partitions(&self) -> Vec<Arc<QueuePartition>> {
        self.inner.queues.read().await.values().cloned().collect()
    }

    async fn slot(&self, id: &MessageId) -> Result<MessageSlot> {
        self.inner
            .locator
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::MessageNotFound(id.to_string()))
    }

    /// Drop a message that has already been marked DELETED.
    async fn unlink(&self, id: &MessageId, sequence: u64, partition: &QueuePartition) {
        let removed = partition.messages.write().await.remove(&sequence).is_some();
        self.inner.locator.write().await.remove(id);
        if removed {
            self.inner.total_messages.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Snapshot every message in a partition whose state matches.
    async fn collect_in_state(partition: &QueuePartition, state: MessageState) -> Vec<Message> {
        let messages = partition.messages.read().await;
        let mut matched = Vec::new();
        for record in messages.values() {
            let message = record.lock().await;
            if message.state == state {
                matched.push(message.clone());
            }
        }
        matched
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryBackend {
    async fn create_queue(&self, config: QueueConfig) -> Result<QueueConfig> {
        debug!(queue = %config.name, queue_id = %config.id, "Creating queue");

        let mut queues = self.inner.queues.write().await;

        if queues.contains_key(&config.name) {
            return Err(Error::QueueAlreadyExists(config.name.clone()));
        }

        queues.insert(
            config.name.clone(),
            Arc::new(QueuePartition {
                config: RwLock::new(config.clone()),
                messages: RwLock::new(BTreeMap::new()),
                next_sequence: AtomicU64::new(0),
                deleted: AtomicBool::new(false),
            }),
        );

        info!(queue = %config.name, queue_id = %config.id, "Queue created");
        Ok(config)
    }

    async fn get_queue(&self, name: &str) -> Result<QueueConfig> {
        let partition = self.partition(name).await?;
        let config = partition.config.read().await.clone();
        Ok(config)
    }

    async fn list_queues(&self, filter: Option<QueueFilter>) -> Result<Vec<QueueConfig>> {
        let mut configs = Vec::new();
        for partition in self.partitions().await {
            configs.push(partition.config.read().await.clone());
        }

        if let Some(prefix) = filter.and_then(|f| f.name_prefix) {
            configs.retain(|c| c.name.starts_with(&prefix));
        }

        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    async fn update_queue(&self, config: QueueConfig) -> Result<QueueConfig> {
        debug!(queue = %config.name, "Updating queue");

        let partition = self.partition(&config.name).await?;
        *partition.config.write().await = config.clone();

        info!(queue = %config.name, "Queue updated");
        Ok(config)
    }

    async fn delete_queue(&self, name: &str, force: bool) -> Result<u64> {
        debug!(queue = %name, force, "Deleting queue");

        let mut queues = self.inner.queues.write().await;
        let partition = queues
            .get(name)
            .cloned()
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;

        // Enqueue takes this lock too, so nothing lands between the count and the drain
        let mut messages = partition.messages.write().await;
        if !force {
            let mut stored = 0u64;
            for record in messages.values() {
                if record.lock().await.state != MessageState::Deleted {
                    stored += 1;
                }
            }
            if stored > 0 {
                return Err(Error::QueueNotEmpty {
                    queue: name.to_string(),
                    messages: stored,
                });
            }
        }

        queues.remove(name);
        partition.deleted.store(true, Ordering::SeqCst);

        let drained: Vec<_> = std::mem::take(&mut *messages).into_values().collect();
        let mut ids = Vec::with_capacity(drained.len());
        for record in drained {
            let mut message = record.lock().await;
            message.state = MessageState::Deleted;
            ids.push(message.id.clone());
        }

        let mut locator = self.inner.locator.write().await;
        for id in &ids {
            locator.remove(id);
        }
        self.inner
            .total_messages
            .fetch_sub(ids.len(), Ordering::SeqCst);

        info!(queue = %name, messages_discarded = ids.len(), "Queue deleted");
        Ok(ids.len() as u64)
    }

    async fn enqueue(
        &self,
        queue: &str,
        new_message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let partition = self.partition(queue).await?;
        let config = partition.config.read().await.clone();

        let mut messages = partition.messages.write().await;
        if partition.deleted.load(Ordering::SeqCst) {
            return Err(Error::QueueNotFound(queue.to_string()));
        }

        if let Some(limit) = config.max_messages {
            if messages.len() >= limit {
                return Err(Error::CapacityExceeded {
                    queue: queue.to_string(),
                    limit,
                });
            }
        }

        let backend_limit = self.inner.config.max_messages;
        if self.inner.total_messages.load(Ordering::SeqCst) >= backend_limit {
            return Err(Error::CapacityExceeded {
                queue: queue.to_string(),
                limit: backend_limit,
            });
        }

        let sequence = partition.next_sequence.fetch_add(1, Ordering::SeqCst);
        let id = match config.queue_type {
            QueueType::Fifo => MessageId::sequenced(&config.id, sequence),
            QueueType::Standard => MessageId::new(),
        };

        let message = Message {
            id: id.clone(),
            queue: queue.to_string(),
            sequence,
            body: new_message.body,
            enqueued_at: now,
            visibility_deadline: None,
            consumer_token: None,
            lease_acquired_at: None,
            receive_count: 0,
            max_receives: config.max_receives,
            visibility_timeout: config.visibility_timeout,
            last_failure_at: None,
            failure: new_message.failure,
            state: MessageState::Available,
        };

        let record = Arc::new(Mutex::new(message.clone()));
        messages.insert(sequence, record.clone());
        self.inner.locator.write().await.insert(
            id,
            MessageSlot {
                partition: partition.clone(),
                record,
            },
        );
        self.inner.total_messages.fetch_add(1, Ordering::SeqCst);

        debug!(queue = %queue, message_id = %message.id, sequence, "Message stored");
        Ok(message)
    }

    async fn fetch_available(&self, queue: &str, limit: usize) -> Result<Vec<Message>> {
        let partition = self.partition(queue).await?;
        let strict = partition.config.read().await.queue_type == QueueType::Fifo;

        let messages = partition.messages.read().await;
        let mut available = Vec::new();

        for record in messages.values() {
            if available.len() >= limit {
                break;
            }
            let message = record.lock().await;
            match message.state {
                MessageState::Available => available.push(message.clone()),
                // FIFO queues never deliver past an unresolved earlier message
                MessageState::InFlight | MessageState::DeadLettered if strict => break,
                _ => {}
            }
        }

        Ok(available)
    }

    async fn mark_in_flight(
        &self,
        id: &MessageId,
        token: &ConsumerToken,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Message> {
        let slot = self.slot(id).await?;
        let mut message = slot.record.lock().await;

        match message.state {
            MessageState::Available => {}
            MessageState::Deleted => return Err(Error::MessageNotFound(id.to_string())),
            MessageState::InFlight | MessageState::DeadLettered => {
                return Err(Error::Conflict(id.to_string()))
            }
        }

        message.state = MessageState::InFlight;
        message.consumer_token = Some(token.clone());
        message.lease_acquired_at = Some(acquired_at);
        message.visibility_deadline = Some(expires_at);

        Ok(message.clone())
    }

    async fn delete(&self, id: &MessageId, token: &ConsumerToken) -> Result<Message> {
        let slot = self.slot(id).await?;

        let deleted = {
            let mut message = slot.record.lock().await;
            if message.state == MessageState::Deleted {
                return Err(Error::MessageNotFound(id.to_string()));
            }
            if !message.is_leased_to(token) {
                return Err(Error::TokenMismatch(id.to_string()));
            }
            message.state = MessageState::Deleted;
            clear_lease(&mut message);
            message.clone()
        };

        self.unlink(id, deleted.sequence, &slot.partition).await;
        debug!(message_id = %id, "Message deleted");
        Ok(deleted)
    }

    async fn release(&self, id: &MessageId, token: &ConsumerToken) -> Result<Message> {
        let slot = self.slot(id).await?;
        let mut message = slot.record.lock().await;

        if message.state == MessageState::Deleted {
            return Err(Error::MessageNotFound(id.to_string()));
        }
        if !message.is_leased_to(token) {
            return Err(Error::TokenMismatch(id.to_string()));
        }

        message.state = MessageState::Available;
        clear_lease(&mut message);
        Ok(message.clone())
    }

    async fn extend_lease(
        &self,
        id: &MessageId,
        token: &ConsumerToken,
        new_deadline: DateTime<Utc>,
    ) -> Result<Message> {
        let slot = self.slot(id).await?;
        let mut message = slot.record.lock().await;

        if message.state == MessageState::Deleted {
            return Err(Error::MessageNotFound(id.to_string()));
        }
        if !message.is_leased_to(token) {
            return Err(Error::TokenMismatch(id.to_string()));
        }

        message.visibility_deadline = Some(new_deadline);
        Ok(message.clone())
    }

    async fn expire_lease(
        &self,
        id: &MessageId,
        expected_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExpiryOutcome> {
        let slot = match self.slot(id).await {
            Ok(slot) => slot,
            Err(Error::MessageNotFound(_)) => return Ok(ExpiryOutcome::Stale),
            Err(e) => return Err(e),
        };
        let mut message = slot.record.lock().await;

        if message.state != MessageState::InFlight {
            return Ok(ExpiryOutcome::Stale);
        }
        let Some(deadline) = message.visibility_deadline else {
            return Ok(ExpiryOutcome::Stale);
        };
        if deadline != expected_deadline || deadline > now {
            return Ok(ExpiryOutcome::Rescheduled(deadline));
        }

        message.receive_count += 1;
        message.last_failure_at = Some(now);
        clear_lease(&mut message);

        if message.receive_count >= message.max_receives {
            message.state = MessageState::DeadLettered;
            Ok(ExpiryOutcome::Exhausted(message.clone()))
        } else {
            message.state = MessageState::Available;
            Ok(ExpiryOutcome::Requeued(message.clone()))
        }
    }

    async fn remove(&self, id: &MessageId) -> Result<()> {
        let slot = self.slot(id).await?;

        let sequence = {
            let mut message = slot.record.lock().await;
            if message.state == MessageState::Deleted {
                return Err(Error::MessageNotFound(id.to_string()));
            }
            message.state = MessageState::Deleted;
            clear_lease(&mut message);
            message.sequence
        };

        self.unlink(id, sequence, &slot.partition).await;
        Ok(())
    }

    async fn get_message(&self, id: &MessageId) -> Result<Message> {
        let slot = self.slot(id).await?;
        let message = slot.record.lock().await;
        if message.state == MessageState::Deleted {
            return Err(Error::MessageNotFound(id.to_string()));
        }
        Ok(message.clone())
    }

    async fn peek_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<Message>> {
        let partition = self.partition(queue).await?;
        let messages = partition.messages.read().await;

        let mut peeked = Vec::new();
        for record in messages.values() {
            if peeked.len() >= limit {
                break;
            }
            let message = record.lock().await;
            if matches!(message.state, MessageState::Available | MessageState::InFlight)
                && message.failure.is_some()
            {
                peeked.push(message.clone());
            }
        }

        Ok(peeked)
    }

    async fn in_flight_leases(&self) -> Result<Vec<(MessageId, DateTime<Utc>)>> {
        let mut leases = Vec::new();
        for partition in self.partitions().await {
            for message in Self::collect_in_state(&partition, MessageState::InFlight).await {
                if let Some(deadline) = message.visibility_deadline {
                    leases.push((message.id, deadline));
                }
            }
        }
        Ok(leases)
    }

    async fn dead_lettered(&self) -> Result<Vec<Message>> {
        let mut stuck = Vec::new();
        for partition in self.partitions().await {
            stuck.extend(Self::collect_in_state(&partition, MessageState::DeadLettered).await);
        }
        Ok(stuck)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let mut purged = Vec::new();

        for partition in self.partitions().await {
            let retention = partition.config.read().await.message_retention_period;
            let cutoff = now - Duration::seconds(retention as i64);

            let mut expired = Vec::new();
            {
                let messages = partition.messages.read().await;
                for record in messages.values() {
                    let mut message = record.lock().await;
                    if message.state == MessageState::Available && message.enqueued_at <= cutoff {
                        message.state = MessageState::Deleted;
                        expired.push(message.clone());
                    }
                }
            }

            for message in expired {
                self.unlink(&message.id, message.sequence, &partition).await;
                purged.push(message);
            }
        }

        Ok(purged)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let partition = self.partition(queue).await?;
        let messages = partition.messages.read().await;

        let mut stats = QueueStats::default();
        for record in messages.values() {
            let message = record.lock().await;
            match message.state {
                MessageState::Available => stats.available_messages += 1,
                MessageState::InFlight => stats.in_flight_messages += 1,
                MessageState::DeadLettered => stats.dead_lettered_messages += 1,
                MessageState::Deleted => continue,
            }
            if stats
                .oldest_message_timestamp
                .is_none_or(|oldest| message.enqueued_at < oldest)
            {
                stats.oldest_message_timestamp = Some(message.enqueued_at);
            }
        }

        Ok(stats)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_queue_config(name: &str, queue_type: QueueType) -> QueueConfig {
        let mut config = QueueConfig::new(name);
        config.queue_type = queue_type;
        config.visibility_timeout = 30;
        config.max_receives = 3;
        config
    }

    async fn backend_with_queue(queue_type: QueueType) -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        backend
            .create_queue(create_test_queue_config("test-queue", queue_type))
            .await
            .unwrap();
        backend
    }

    async fn lease(
        backend: &InMemoryBackend,
        id: &MessageId,
        token: &str,
        now: DateTime<Utc>,
    ) -> Message {
        backend
            .mark_in_flight(
                id,
                &ConsumerToken::new(token),
                now,
                now + Duration::seconds(30),
            )
            .await
            .unwrap()
    }

    // ========================================================================
    // Capacity Tests
    // ========================================================================

    #[tokio::test]
    async fn test_queue_capacity_exceeded() {
        let backend = InMemoryBackend::new();
        let mut config = create_test_queue_config("test-queue", QueueType::Standard);
        config.max_messages = Some(2);
        backend.create_queue(config).await.unwrap();

        let now = Utc::now();
        backend.enqueue("test-queue", NewMessage::new("msg1"), now).await.unwrap();
        backend.enqueue("test-queue", NewMessage::new("msg2"), now).await.unwrap();

        let result = backend.enqueue("test-queue", NewMessage::new("msg3"), now).await;
        match result {
            Err(Error::CapacityExceeded { queue, limit }) => {
                assert_eq!(queue, "test-queue");
                assert_eq!(limit, 2);
            }
            _ => panic!("Expected CapacityExceeded"),
        }
    }

    #[tokio::test]
    async fn test_backend_capacity_spans_queues() {
        let backend = InMemoryBackend::with_config(InMemoryConfig { max_messages: 1 });
        backend
            .create_queue(create_test_queue_config("a", QueueType::Standard))
            .await
            .unwrap();
        backend
            .create_queue(create_test_queue_config("b", QueueType::Standard))
            .await
            .unwrap();

        let now = Utc::now();
        backend.enqueue("a", NewMessage::new("one"), now).await.unwrap();
        let result = backend.enqueue("b", NewMessage::new("two"), now).await;
        assert!(matches!(result, Err(Error::CapacityExceeded { limit: 1, .. })));
    }

    #[tokio::test]
    async fn test_enqueue_unknown_queue() {
        let backend = InMemoryBackend::new();
        let result = backend.enqueue("missing", NewMessage::new("x"), Utc::now()).await;
        assert!(matches!(result, Err(Error::QueueNotFound(_))));
    }

    // ========================================================================
    // Lease Transition Tests
    // ========================================================================

    #[tokio::test]
    async fn test_mark_in_flight_conflict() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let message = backend
            .enqueue("test-queue", NewMessage::new("payload"), now)
            .await
            .unwrap();

        lease(&backend, &message.id, "worker-1", now).await;

        let second = backend
            .mark_in_flight(
                &message.id,
                &ConsumerToken::new("worker-2"),
                now,
                now + Duration::seconds(30),
            )
            .await;
        assert!(matches!(second, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_fetch_available_does_not_mutate() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        for i in 0..3 {
            backend
                .enqueue("test-queue", NewMessage::new(format!("msg-{}", i)), now)
                .await
                .unwrap();
        }

        let first = backend.fetch_available("test-queue", 2).await.unwrap();
        let second = backend.fetch_available("test-queue", 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].body, b"msg-0".to_vec());

        let stats = backend.stats("test-queue").await.unwrap();
        assert_eq!(stats.available_messages, 3);
        assert_eq!(stats.in_flight_messages, 0);
    }

    #[tokio::test]
    async fn test_delete_requires_lease_holder() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let message = backend
            .enqueue("test-queue", NewMessage::new("payload"), now)
            .await
            .unwrap();

        // Not leased yet
        let result = backend.delete(&message.id, &ConsumerToken::new("worker-1")).await;
        assert!(matches!(result, Err(Error::TokenMismatch(_))));

        lease(&backend, &message.id, "worker-1", now).await;

        let wrong = backend.delete(&message.id, &ConsumerToken::new("worker-2")).await;
        assert!(matches!(wrong, Err(Error::TokenMismatch(_))));

        backend
            .delete(&message.id, &ConsumerToken::new("worker-1"))
            .await
            .unwrap();

        let again = backend.delete(&message.id, &ConsumerToken::new("worker-1")).await;
        assert!(matches!(again, Err(Error::MessageNotFound(_))));
        assert_eq!(backend.total_message_count(), 0);
    }

    #[tokio::test]
    async fn test_release_keeps_receive_count() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let message = backend
            .enqueue("test-queue", NewMessage::new("payload"), now)
            .await
            .unwrap();

        lease(&backend, &message.id, "worker-1", now).await;
        let released = backend
            .release(&message.id, &ConsumerToken::new("worker-1"))
            .await
            .unwrap();

        assert_eq!(released.state, MessageState::Available);
        assert_eq!(released.receive_count, 0);
        assert!(released.visibility_deadline.is_none());
    }

    #[tokio::test]
    async fn test_expire_lease_outcomes() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let message = backend
            .enqueue("test-queue", NewMessage::new("payload"), now)
            .await
            .unwrap();

        let leased = lease(&backend, &message.id, "worker-1", now).await;
        let deadline = leased.visibility_deadline.unwrap();

        // Not yet due
        let early = backend.expire_lease(&message.id, deadline, now).await.unwrap();
        assert!(matches!(early, ExpiryOutcome::Rescheduled(d) if d == deadline));

        // Extended lease supersedes the old deadline
        let extended = deadline + Duration::seconds(60);
        backend
            .extend_lease(&message.id, &ConsumerToken::new("worker-1"), extended)
            .await
            .unwrap();
        let superseded = backend
            .expire_lease(&message.id, deadline, deadline)
            .await
            .unwrap();
        assert!(matches!(superseded, ExpiryOutcome::Rescheduled(d) if d == extended));

        // Due
        let expired = backend
            .expire_lease(&message.id, extended, extended)
            .await
            .unwrap();
        match expired {
            ExpiryOutcome::Requeued(m) => {
                assert_eq!(m.receive_count, 1);
                assert_eq!(m.state, MessageState::Available);
            }
            other => panic!("Expected Requeued, got {:?}", other),
        }

        // Second expiry of the same lease is a no-op
        let stale = backend
            .expire_lease(&message.id, extended, extended)
            .await
            .unwrap();
        assert!(matches!(stale, ExpiryOutcome::Stale));
    }

    #[tokio::test]
    async fn test_expire_lease_exhausts_budget() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let message = backend
            .enqueue("test-queue", NewMessage::new("payload"), now)
            .await
            .unwrap();

        let mut outcome = ExpiryOutcome::Stale;
        for round in 0..3 {
            let leased = lease(&backend, &message.id, "worker-1", now).await;
            let deadline = leased.visibility_deadline.unwrap();
            outcome = backend
                .expire_lease(&message.id, deadline, deadline)
                .await
                .unwrap();
            if round < 2 {
                assert!(matches!(outcome, ExpiryOutcome::Requeued(_)));
            }
        }

        match outcome {
            ExpiryOutcome::Exhausted(m) => {
                assert_eq!(m.receive_count, 3);
                assert_eq!(m.state, MessageState::DeadLettered);
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }

        let stuck = backend.dead_lettered().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert!(backend.fetch_available("test-queue", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_after_ack_is_stale() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let message = backend
            .enqueue("test-queue", NewMessage::new("payload"), now)
            .await
            .unwrap();

        let leased = lease(&backend, &message.id, "worker-1", now).await;
        backend
            .delete(&message.id, &ConsumerToken::new("worker-1"))
            .await
            .unwrap();

        let outcome = backend
            .expire_lease(&message.id, leased.visibility_deadline.unwrap(), now + Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(outcome, ExpiryOutcome::Stale));
    }

    // ========================================================================
    // FIFO Tests
    // ========================================================================

    #[tokio::test]
    async fn test_fifo_ids_are_ordered() {
        let backend = backend_with_queue(QueueType::Fifo).await;
        let now = Utc::now();

        let mut ids = Vec::new();
        for i in 0..12 {
            let message = backend
                .enqueue("test-queue", NewMessage::new(format!("msg-{}", i)), now)
                .await
                .unwrap();
            ids.push(message.id);
        }

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_fifo_blocks_behind_in_flight_head() {
        let backend = backend_with_queue(QueueType::Fifo).await;
        let now = Utc::now();
        let first = backend
            .enqueue("test-queue", NewMessage::new("first"), now)
            .await
            .unwrap();
        backend
            .enqueue("test-queue", NewMessage::new("second"), now)
            .await
            .unwrap();

        lease(&backend, &first.id, "worker-1", now).await;
        assert!(backend.fetch_available("test-queue", 10).await.unwrap().is_empty());

        backend
            .release(&first.id, &ConsumerToken::new("worker-1"))
            .await
            .unwrap();
        let available = backend.fetch_available("test-queue", 10).await.unwrap();
        assert_eq!(available.len(), 2);
        assert_eq!(available[0].id, first.id);
    }

    #[tokio::test]
    async fn test_standard_queue_skips_in_flight() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let first = backend
            .enqueue("test-queue", NewMessage::new("first"), now)
            .await
            .unwrap();
        backend
            .enqueue("test-queue", NewMessage::new("second"), now)
            .await
            .unwrap();

        lease(&backend, &first.id, "worker-1", now).await;
        let available = backend.fetch_available("test-queue", 10).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].body, b"second".to_vec());
    }

    // ========================================================================
    // Queue Lifecycle Tests
    // ========================================================================

    #[tokio::test]
    async fn test_update_applies_to_new_messages_only() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let before = backend
            .enqueue("test-queue", NewMessage::new("before"), now)
            .await
            .unwrap();

        let mut config = backend.get_queue("test-queue").await.unwrap();
        config.max_receives = 7;
        config.visibility_timeout = 90;
        backend.update_queue(config).await.unwrap();

        let after = backend
            .enqueue("test-queue", NewMessage::new("after"), now)
            .await
            .unwrap();

        assert_eq!(backend.get_message(&before.id).await.unwrap().max_receives, 3);
        assert_eq!(after.max_receives, 7);
        assert_eq!(after.visibility_timeout, 90);
    }

    #[tokio::test]
    async fn test_delete_queue_discards_messages() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let message = backend
            .enqueue("test-queue", NewMessage::new("a"), now)
            .await
            .unwrap();
        backend
            .enqueue("test-queue", NewMessage::new("b"), now)
            .await
            .unwrap();
        lease(&backend, &message.id, "worker-1", now).await;

        let discarded = backend.delete_queue("test-queue", true).await.unwrap();
        assert_eq!(discarded, 2);
        assert_eq!(backend.total_message_count(), 0);
        assert!(matches!(
            backend.get_message(&message.id).await,
            Err(Error::MessageNotFound(_))
        ));
        assert!(matches!(
            backend.get_queue("test-queue").await,
            Err(Error::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_expired_only_touches_available() {
        let backend = InMemoryBackend::new();
        let mut config = create_test_queue_config("test-queue", QueueType::Standard);
        config.message_retention_period = 60;
        backend.create_queue(config).await.unwrap();

        let now = Utc::now();
        let old = backend
            .enqueue("test-queue", NewMessage::new("old"), now)
            .await
            .unwrap();
        let leased = backend
            .enqueue("test-queue", NewMessage::new("leased"), now)
            .await
            .unwrap();
        lease(&backend, &leased.id, "worker-1", now).await;
        backend
            .enqueue("test-queue", NewMessage::new("fresh"), now + Duration::seconds(50))
            .await
            .unwrap();

        let purged = backend.purge_expired(now + Duration::seconds(61)).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, old.id);

        let stats = backend.stats("test-queue").await.unwrap();
        assert_eq!(stats.available_messages, 1);
        assert_eq!(stats.in_flight_messages, 1);
    }

    #[tokio::test]
    async fn test_in_flight_leases_lists_deadlines() {
        let backend = backend_with_queue(QueueType::Standard).await;
        let now = Utc::now();
        let message = backend
            .enqueue("test-queue", NewMessage::new("payload"), now)
            .await
            .unwrap();
        backend
            .enqueue("test-queue", NewMessage::new("idle"), now)
            .await
            .unwrap();
        let leased = lease(&backend, &message.id, "worker-1", now).await;

        let leases = backend.in_flight_leases().await.unwrap();
        assert_eq!(leases, vec![(message.id, leased.visibility_deadline.unwrap())]);
    }
}
