//! In-process queue service.
//!
//! [`QueueService`] wires a [`MessageStore`] to the registry, the delivery
//! engine, the visibility scheduler, the dead-letter router and the retention
//! manager, and is what the REST API and embedding applications call.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::cleanup::{RetentionManager, DEFAULT_RETENTION_INTERVAL};
use crate::core::clock::{Clock, SystemClock};
use crate::core::delivery::DeliveryEngine;
use crate::core::dlq::DeadLetterRouter;
use crate::core::events::{EventBus, EventSink, QueueEvent};
use crate::core::registry::{QueueDefaults, QueueRegistry, QueueSpec, QueueUpdate};
use crate::core::visibility::{RecoveryReport, SweepReport, VisibilityScheduler, DEFAULT_CHECK_INTERVAL};
use crate::metrics::get_metrics;
use crate::storage::{HealthStatus, MessageStore, QueueFilter};
use crate::types::validation::validate_message_size;
use crate::types::{
    ConsumerToken, DeadLetter, Message, MessageId, NewMessage, QueueConfig, QueueId, QueueStats,
};
use crate::{Error, Result};

/// Tunables for a [`QueueService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Visibility sweep interval.
    pub check_interval: Duration,
    /// Retention pass interval.
    pub retention_interval: Duration,
    /// Per-subscriber event buffer.
    pub event_capacity: usize,
    /// Settings for queues created without them.
    pub queue_defaults: QueueDefaults,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            retention_interval: DEFAULT_RETENTION_INTERVAL,
            event_capacity: 1024,
            queue_defaults: QueueDefaults::default(),
        }
    }
}

/// Result of a dead-letter redrive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedriveReport {
    /// Messages moved back to their original queue.
    pub moved: usize,
    /// Messages left in the dead-letter queue.
    pub skipped: usize,
}

/// Queue service facade.
pub struct QueueService {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    registry: QueueRegistry,
    scheduler: Arc<VisibilityScheduler>,
    delivery: DeliveryEngine,
    retention: Arc<RetentionManager>,
}

impl QueueService {
    /// Create a service on `store` with the system clock and default options.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self::with_options(store, Arc::new(SystemClock::new()), ServiceOptions::default())
    }

    /// Create a service with an explicit clock and options.
    pub fn with_options(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        options: ServiceOptions,
    ) -> Self {
        let events = Arc::new(EventBus::new(options.event_capacity));
        let router = Arc::new(DeadLetterRouter::new(store.clone(), events.clone()));
        let scheduler = Arc::new(VisibilityScheduler::with_interval(
            store.clone(),
            clock.clone(),
            router,
            events.clone(),
            options.check_interval,
        ));
        let delivery = DeliveryEngine::new(
            store.clone(),
            clock.clone(),
            scheduler.clone(),
            events.clone(),
        );
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            options.retention_interval,
        ));
        let registry = QueueRegistry::new(store.clone(), options.queue_defaults);

        Self {
            store,
            clock,
            events,
            registry,
            scheduler,
            delivery,
            retention,
        }
    }

    // ========================================================================
    // Queue management
    // ========================================================================

    /// Create a queue and return its id.
    pub async fn create_queue(
        &self,
        name: &str,
        visibility_timeout: u32,
        max_receives: u32,
        dlq_name: Option<&str>,
    ) -> Result<QueueId> {
        let mut spec = QueueSpec::new(name)
            .visibility_timeout(visibility_timeout)
            .max_receives(max_receives);
        spec.dlq_name = dlq_name.map(str::to_string);
        Ok(self.registry.create_queue(spec).await?.id)
    }

    /// Create a queue from a full specification.
    pub async fn create_queue_with(&self, spec: QueueSpec) -> Result<QueueConfig> {
        self.registry.create_queue(spec).await
    }

    /// Delete a queue, returning how many messages were discarded.
    pub async fn delete_queue(&self, name: &str, force: bool) -> Result<u64> {
        self.registry.delete_queue(name, force).await
    }

    /// Change a queue's configuration.
    pub async fn update_config(&self, name: &str, update: QueueUpdate) -> Result<QueueConfig> {
        self.registry.update_config(name, update).await
    }

    /// Look up a queue.
    pub async fn get_queue(&self, name: &str) -> Result<QueueConfig> {
        self.registry.get(name).await
    }

    /// List queues.
    pub async fn list_queues(&self, filter: Option<QueueFilter>) -> Result<Vec<QueueConfig>> {
        self.registry.list(filter).await
    }

    /// Message counts for a queue.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let stats = self.store.stats(queue).await?;

        let metrics = get_metrics();
        metrics
            .queue_depth
            .with_label_values(&[queue])
            .set(stats.available_messages as i64);
        metrics
            .in_flight_messages
            .with_label_values(&[queue])
            .set(stats.in_flight_messages as i64);

        Ok(stats)
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Store a message.
    pub async fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<MessageId> {
        let body = body.into();
        let config = self.store.get_queue(queue).await?;
        validate_message_size(body.len(), config.max_message_size)?;

        let message = self
            .store
            .enqueue(queue, NewMessage::new(body), self.clock.now())
            .await?;

        self.events.publish(QueueEvent::Enqueued {
            queue: queue.to_string(),
            message_id: message.id.clone(),
        });
        Ok(message.id)
    }

    /// Lease up to `max_batch` messages to `token`.
    pub async fn receive(
        &self,
        queue: &str,
        token: &ConsumerToken,
        max_batch: usize,
    ) -> Result<Vec<Message>> {
        self.delivery.receive(queue, token, max_batch).await
    }

    /// Acknowledge a message.
    pub async fn ack(&self, id: &MessageId, token: &ConsumerToken) -> Result<()> {
        self.delivery.ack(id, token).await
    }

    /// Extend a lease by `extra` past `max(current deadline, now)`.
    pub async fn extend_lease(
        &self,
        id: &MessageId,
        token: &ConsumerToken,
        extra: Duration,
    ) -> Result<Message> {
        self.delivery.extend_lease(id, token, extra).await
    }

    /// Give a lease back without counting a receive.
    pub async fn release(&self, id: &MessageId, token: &ConsumerToken) -> Result<Message> {
        self.delivery.release(id, token).await
    }

    /// Look up a message.
    pub async fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.store.get_message(id).await
    }

    // ========================================================================
    // Dead letters
    // ========================================================================

    /// Up to `limit` dead letters in `dlq`, oldest first, without leasing them.
    pub async fn peek_dlq(&self, dlq: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        let messages = self.store.peek_dead_letters(dlq, limit).await?;
        Ok(messages
            .into_iter()
            .filter_map(|message| {
                let failure = message.failure.clone()?;
                Some(DeadLetter { message, failure })
            })
            .collect())
    }

    /// Move up to `limit` AVAILABLE dead letters back to their original queue.
    ///
    /// Each message is claimed with a lease first so a concurrent consumer of
    /// the dead-letter queue cannot see it twice. Records whose origin queue is
    /// gone are left where they are.
    pub async fn redrive(&self, dlq: &str, limit: usize) -> Result<RedriveReport> {
        let candidates = self.store.fetch_available(dlq, limit.max(1)).await?;
        let token = ConsumerToken::generate();
        let mut report = RedriveReport::default();

        for candidate in candidates {
            let Some(failure) = candidate.failure.clone() else {
                report.skipped += 1;
                continue;
            };

            match self.store.get_queue(&failure.original_queue).await {
                Ok(_) => {}
                Err(Error::QueueNotFound(_)) => {
                    warn!(
                        dlq = %dlq,
                        message_id = %candidate.id,
                        origin = %failure.original_queue,
                        "Origin queue is gone, leaving dead letter in place"
                    );
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let now = self.clock.now();
            let expires_at = now + chrono::Duration::seconds(candidate.visibility_timeout as i64);
            match self
                .store
                .mark_in_flight(&candidate.id, &token, now, expires_at)
                .await
            {
                Ok(_) => self.scheduler.schedule(candidate.id.clone(), expires_at),
                Err(Error::Conflict(_) | Error::MessageNotFound(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let requeued = match self
                .store
                .enqueue(
                    &failure.original_queue,
                    NewMessage::new(candidate.body.clone()),
                    now,
                )
                .await
            {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        dlq = %dlq,
                        message_id = %candidate.id,
                        error = %e,
                        "Redrive enqueue failed, releasing dead letter"
                    );
                    self.delivery.release(&candidate.id, &token).await?;
                    report.skipped += 1;
                    continue;
                }
            };

            self.store.delete(&candidate.id, &token).await?;
            self.scheduler.cancel(&candidate.id);

            self.events.publish(QueueEvent::Enqueued {
                queue: failure.original_queue.clone(),
                message_id: requeued.id,
            });
            report.moved += 1;
        }

        info!(dlq = %dlq, moved = report.moved, skipped = report.skipped, "Redrive completed");
        Ok(report)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Subscribe to delivery events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Register an event sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.events.add_sink(sink);
    }

    /// Rebuild scheduler state from storage. Call once before serving.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let queues = self.store.list_queues(None).await?;
        get_metrics().queue_count.set(queues.len() as i64);
        self.scheduler.recover().await
    }

    /// Run one visibility sweep now.
    pub async fn run_expiry_sweep(&self) -> SweepReport {
        self.scheduler.sweep().await
    }

    /// Run one retention pass now.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.retention.purge().await
    }

    /// Expiry timers currently armed.
    pub fn pending_expiries(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Backend health.
    pub async fn health_check(&self) -> Result<HealthStatus> {
        self.store.health_check().await
    }

    /// Spawn the scheduler and retention loops; both stop when `shutdown` fires.
    pub fn start_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.scheduler.clone().start(shutdown.subscribe())),
            tokio::spawn(self.retention.clone().start(shutdown.subscribe())),
        ]
    }
}
