//! Dead-letter routing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::core::events::{DropReason, EventBus, QueueEvent};
use crate::storage::MessageStore;
use crate::types::{FailureRecord, Message, MessageId, NewMessage};
use crate::{Error, Result};

/// Where an exhausted message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Copied into the dead-letter queue.
    Moved {
        /// Dead-letter queue name.
        dead_letter_queue: String,
        /// Id of the copy.
        dead_letter_id: MessageId,
    },
    /// Removed without a copy.
    Dropped(DropReason),
}

/// Moves messages that exhausted their receives out of the source queue.
pub struct DeadLetterRouter {
    store: Arc<dyn MessageStore>,
    events: Arc<EventBus>,
}

impl DeadLetterRouter {
    /// Create a new router.
    pub fn new(store: Arc<dyn MessageStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Route a DEAD_LETTERED message.
    ///
    /// The copy is written before the source is removed, so a crash in between
    /// leaves the source DEAD_LETTERED and it is routed again on recovery. A
    /// backend failure on the copy is returned as an error with the source left
    /// in place; a missing or full dead-letter queue drops the message.
    pub async fn route(&self, message: Message, now: DateTime<Utc>) -> Result<RouteOutcome> {
        let dlq_name = match self.store.get_queue(&message.queue).await {
            Ok(config) => config.dlq_name,
            Err(Error::QueueNotFound(_)) => {
                // The source queue was deleted along with the message
                return Ok(self.drop_message(&message, DropReason::QueueDeleted));
            }
            Err(e) => return Err(e),
        };

        let outcome = match dlq_name {
            None => RouteOutcome::Dropped(DropReason::NoDeadLetterQueue),
            Some(dlq) => {
                let failure = FailureRecord {
                    original_queue: message.queue.clone(),
                    final_receive_count: message.receive_count,
                    first_enqueued_at: message.enqueued_at,
                    last_failure_at: message.last_failure_at.unwrap_or(now),
                };

                match self
                    .store
                    .enqueue(&dlq, NewMessage::dead_letter(message.body.clone(), failure), now)
                    .await
                {
                    Ok(copy) => RouteOutcome::Moved {
                        dead_letter_queue: dlq,
                        dead_letter_id: copy.id,
                    },
                    Err(e @ (Error::QueueNotFound(_) | Error::CapacityExceeded { .. })) => {
                        warn!(
                            queue = %message.queue,
                            message_id = %message.id,
                            dlq = %dlq,
                            error = %e,
                            "Dead-letter queue rejected message"
                        );
                        RouteOutcome::Dropped(DropReason::DeadLetterQueueUnavailable)
                    }
                    Err(e) => {
                        error!(
                            queue = %message.queue,
                            message_id = %message.id,
                            dlq = %dlq,
                            error = %e,
                            "Failed to copy message to dead-letter queue"
                        );
                        return Err(e);
                    }
                }
            }
        };

        match self.store.remove(&message.id).await {
            Ok(()) | Err(Error::MessageNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match &outcome {
            RouteOutcome::Moved {
                dead_letter_queue,
                dead_letter_id,
            } => self.events.publish(QueueEvent::DeadLettered {
                queue: message.queue.clone(),
                message_id: message.id.clone(),
                dead_letter_queue: dead_letter_queue.clone(),
                dead_letter_id: dead_letter_id.clone(),
                receive_count: message.receive_count,
            }),
            RouteOutcome::Dropped(reason) => {
                self.drop_message(&message, *reason);
            }
        }

        Ok(outcome)
    }

    /// Route every message a previous run left DEAD_LETTERED.
    pub async fn route_stranded(&self, now: DateTime<Utc>) -> Result<usize> {
        let stranded = self.store.dead_lettered().await?;
        let mut routed = 0;

        for message in stranded {
            let message_id = message.id.clone();
            match self.route(message, now).await {
                Ok(_) => routed += 1,
                Err(e) => {
                    error!(message_id = %message_id, error = %e, "Failed to route stranded dead letter")
                }
            }
        }

        if routed > 0 {
            debug!(routed, "Routed stranded dead letters");
        }
        Ok(routed)
    }

    fn drop_message(&self, message: &Message, reason: DropReason) -> RouteOutcome {
        self.events.publish(QueueEvent::Dropped {
            queue: message.queue.clone(),
            message_id: message.id.clone(),
            reason,
        });
        RouteOutcome::Dropped(reason)
    }
}
