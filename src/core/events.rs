//! Delivery lifecycle events.
//!
//! Every state change the core makes is published as a [`QueueEvent`]. The
//! [`EventBus`] logs it, counts it in Prometheus, hands it to registered
//! [`EventSink`]s and broadcasts it to in-process subscribers.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::metrics::get_metrics;
use crate::types::{ConsumerToken, MessageId};

/// Why a message left a queue without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Receive budget exhausted and the queue has no dead-letter queue.
    NoDeadLetterQueue,
    /// The configured dead-letter queue is gone or refused the copy.
    DeadLetterQueueUnavailable,
    /// Sat unreceived past the queue's retention period.
    RetentionExpired,
    /// The queue was force-deleted.
    QueueDeleted,
}

impl DropReason {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NoDeadLetterQueue => "no_dead_letter_queue",
            DropReason::DeadLetterQueueUnavailable => "dead_letter_queue_unavailable",
            DropReason::RetentionExpired => "retention_expired",
            DropReason::QueueDeleted => "queue_deleted",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable delivery event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A message was stored.
    Enqueued {
        /// Queue name.
        queue: String,
        /// New message.
        message_id: MessageId,
    },
    /// A lease was handed to a consumer.
    Delivered {
        /// Queue name.
        queue: String,
        /// Leased message.
        message_id: MessageId,
        /// Lease holder.
        consumer_token: ConsumerToken,
        /// Expiries so far.
        receive_count: u32,
        /// Lease deadline.
        expires_at: DateTime<Utc>,
    },
    /// A lease holder acknowledged the message.
    Acked {
        /// Queue name.
        queue: String,
        /// Deleted message.
        message_id: MessageId,
    },
    /// A lease ran out and the message is available again.
    Expired {
        /// Queue name.
        queue: String,
        /// Requeued message.
        message_id: MessageId,
        /// Receive count after the expiry.
        receive_count: u32,
    },
    /// A message exhausted its receives and was copied into a dead-letter queue.
    DeadLettered {
        /// Source queue.
        queue: String,
        /// Source message, now removed.
        message_id: MessageId,
        /// Dead-letter queue that received the copy.
        dead_letter_queue: String,
        /// Id of the copy.
        dead_letter_id: MessageId,
        /// Receive count at the time of the move.
        receive_count: u32,
    },
    /// A message was removed without delivery.
    Dropped {
        /// Queue name.
        queue: String,
        /// Removed message.
        message_id: MessageId,
        /// Why.
        reason: DropReason,
    },
}

impl QueueEvent {
    /// Short event name.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued { .. } => "enqueued",
            QueueEvent::Delivered { .. } => "delivered",
            QueueEvent::Acked { .. } => "acked",
            QueueEvent::Expired { .. } => "expired",
            QueueEvent::DeadLettered { .. } => "dead_lettered",
            QueueEvent::Dropped { .. } => "dropped",
        }
    }

    /// Queue the event happened on.
    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::Enqueued { queue, .. }
            | QueueEvent::Delivered { queue, .. }
            | QueueEvent::Acked { queue, .. }
            | QueueEvent::Expired { queue, .. }
            | QueueEvent::DeadLettered { queue, .. }
            | QueueEvent::Dropped { queue, .. } => queue,
        }
    }

    /// Message the event is about.
    pub fn message_id(&self) -> &MessageId {
        match self {
            QueueEvent::Enqueued { message_id, .. }
            | QueueEvent::Delivered { message_id, .. }
            | QueueEvent::Acked { message_id, .. }
            | QueueEvent::Expired { message_id, .. }
            | QueueEvent::DeadLettered { message_id, .. }
            | QueueEvent::Dropped { message_id, .. } => message_id,
        }
    }
}

/// Pluggable consumer of delivery events.
///
/// Called synchronously on the publishing task, so implementations must not block.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &QueueEvent);
}

/// Fan-out point for [`QueueEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    /// Create a bus whose broadcast channel buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to future events. Slow subscribers see `Lagged` and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Register a sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sink);
    }

    /// Log, count and deliver an event.
    pub fn publish(&self, event: QueueEvent) {
        log_event(&event);
        record_metrics(&event);

        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for sink in sinks {
            sink.on_event(&event);
        }

        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::Enqueued { queue, message_id } => {
            debug!(queue = %queue, message_id = %message_id, "Message enqueued");
        }
        QueueEvent::Delivered {
            queue,
            message_id,
            consumer_token,
            receive_count,
            expires_at,
        } => {
            debug!(
                queue = %queue,
                message_id = %message_id,
                consumer = %consumer_token,
                receive_count,
                expires_at = %expires_at,
                "Message delivered"
            );
        }
        QueueEvent::Acked { queue, message_id } => {
            debug!(queue = %queue, message_id = %message_id, "Message acknowledged");
        }
        QueueEvent::Expired {
            queue,
            message_id,
            receive_count,
        } => {
            info!(
                queue = %queue,
                message_id = %message_id,
                receive_count,
                "Lease expired, message requeued"
            );
        }
        QueueEvent::DeadLettered {
            queue,
            message_id,
            dead_letter_queue,
            dead_letter_id,
            receive_count,
        } => {
            warn!(
                queue = %queue,
                message_id = %message_id,
                dlq = %dead_letter_queue,
                dlq_message_id = %dead_letter_id,
                receive_count,
                "Message moved to dead-letter queue"
            );
        }
        QueueEvent::Dropped {
            queue,
            message_id,
            reason,
        } => {
            warn!(
                queue = %queue,
                message_id = %message_id,
                reason = %reason,
                "Message dropped"
            );
        }
    }
}

fn record_metrics(event: &QueueEvent) {
    let metrics = get_metrics();
    let queue = event.queue();
    match event {
        QueueEvent::Enqueued { .. } => metrics.messages_enqueued_total.with_label_values(&[queue]).inc(),
        QueueEvent::Delivered { .. } => {
            metrics.messages_delivered_total.with_label_values(&[queue]).inc()
        }
        QueueEvent::Acked { .. } => metrics.messages_acked_total.with_label_values(&[queue]).inc(),
        QueueEvent::Expired { .. } => metrics.messages_expired_total.with_label_values(&[queue]).inc(),
        QueueEvent::DeadLettered { .. } => metrics
            .messages_dead_lettered_total
            .with_label_values(&[queue])
            .inc(),
        QueueEvent::Dropped { reason, .. } => metrics
            .messages_dropped_total
            .with_label_values(&[queue, reason.as_str()])
            .inc(),
    }
}
