//! Delivery engine: leases, acks, extensions and releases.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use tracing::{debug, warn};

use crate::core::clock::Clock;
use crate::core::events::{EventBus, QueueEvent};
use crate::core::visibility::VisibilityScheduler;
use crate::error::ValidationError;
use crate::metrics::get_metrics;
use crate::storage::MessageStore;
use crate::types::validation::{validate_consumer_token, MAX_VISIBILITY_TIMEOUT};
use crate::types::{ConsumerToken, Message, MessageId, QueueType};
use crate::{Error, Result};

/// Largest batch a single receive hands out.
pub const MAX_BATCH_SIZE: usize = 10;

/// Hands messages to consumers under visibility-timeout leases.
pub struct DeliveryEngine {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<VisibilityScheduler>,
    events: Arc<EventBus>,
}

impl DeliveryEngine {
    /// Create a new delivery engine.
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<VisibilityScheduler>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            clock,
            scheduler,
            events,
        }
    }

    /// Lease up to `batch_size` messages (clamped to `1..=MAX_BATCH_SIZE`) to `token`.
    ///
    /// Candidates another consumer wins are skipped, never retried within the
    /// call, so the batch may come back short or empty.
    pub async fn receive(
        &self,
        queue: &str,
        token: &ConsumerToken,
        batch_size: usize,
    ) -> Result<Vec<Message>> {
        validate_consumer_token(token.as_str())?;
        let limit = batch_size.clamp(1, MAX_BATCH_SIZE);
        let started = Instant::now();

        self.scheduler.sweep().await;

        let strict = self.store.get_queue(queue).await?.queue_type == QueueType::Fifo;
        let candidates = self.store.fetch_available(queue, limit).await?;
        let mut leased = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let now = self.clock.now();
            let expires_at = now + Duration::seconds(candidate.visibility_timeout as i64);

            match self
                .store
                .mark_in_flight(&candidate.id, token, now, expires_at)
                .await
            {
                Ok(message) => {
                    self.scheduler.schedule(message.id.clone(), expires_at);
                    self.events.publish(QueueEvent::Delivered {
                        queue: queue.to_string(),
                        message_id: message.id.clone(),
                        consumer_token: token.clone(),
                        receive_count: message.receive_count,
                        expires_at,
                    });
                    leased.push(message);
                }
                Err(Error::Conflict(_) | Error::MessageNotFound(_)) => {
                    debug!(queue = %queue, message_id = %candidate.id, "Lost lease race, skipping");
                    get_metrics()
                        .lease_conflicts_total
                        .with_label_values(&[queue])
                        .inc();
                    // A later message must not overtake the one we lost
                    if strict {
                        break;
                    }
                }
                Err(e) if !leased.is_empty() => {
                    warn!(queue = %queue, error = %e, "Receive cut short by backend error");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        get_metrics()
            .receive_latency_seconds
            .with_label_values(&[queue])
            .observe(started.elapsed().as_secs_f64());

        Ok(leased)
    }

    /// Acknowledge and delete a message held by `token`.
    pub async fn ack(&self, id: &MessageId, token: &ConsumerToken) -> Result<()> {
        validate_consumer_token(token.as_str())?;

        let message = self.store.delete(id, token).await?;
        self.scheduler.cancel(id);

        self.events.publish(QueueEvent::Acked {
            queue: message.queue,
            message_id: message.id,
        });
        Ok(())
    }

    /// Push the lease deadline out to `max(current_deadline, now) + extra`.
    pub async fn extend_lease(
        &self,
        id: &MessageId,
        token: &ConsumerToken,
        extra: std::time::Duration,
    ) -> Result<Message> {
        validate_consumer_token(token.as_str())?;
        if extra.is_zero() || extra.as_secs() > MAX_VISIBILITY_TIMEOUT as u64 {
            return Err(ValidationError::InvalidParameter {
                name: "extra".to_string(),
                reason: format!(
                    "must be between 1ms and {} seconds, got {:?}",
                    MAX_VISIBILITY_TIMEOUT, extra
                ),
            }
            .into());
        }
        let extra = Duration::from_std(extra)
            .map_err(|e| Error::Internal(format!("Invalid lease extension: {}", e)))?;

        let current = self.store.get_message(id).await?;
        if !current.is_leased_to(token) {
            return Err(Error::TokenMismatch(id.to_string()));
        }

        let now = self.clock.now();
        let base = current.visibility_deadline.map_or(now, |deadline| deadline.max(now));
        let new_deadline = base + extra;

        let message = self.store.extend_lease(id, token, new_deadline).await?;
        self.scheduler.schedule(id.clone(), new_deadline);

        debug!(
            message_id = %id,
            consumer = %token,
            expires_at = %new_deadline,
            "Lease extended"
        );
        Ok(message)
    }

    /// Give a lease back without counting a receive.
    ///
    /// The released lease's timer stays armed: the message is AVAILABLE the
    /// moment the store returns, so another consumer may already have armed a
    /// timer for its own lease. The leftover entry expires as stale.
    pub async fn release(&self, id: &MessageId, token: &ConsumerToken) -> Result<Message> {
        validate_consumer_token(token.as_str())?;

        let message = self.store.release(id, token).await?;

        debug!(queue = %message.queue, message_id = %id, consumer = %token, "Lease released");
        Ok(message)
    }
}
