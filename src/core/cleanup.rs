//! Background retention enforcement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::core::clock::Clock;
use crate::core::events::{DropReason, EventBus, QueueEvent};
use crate::storage::MessageStore;
use crate::Result;

/// Default interval between retention passes.
pub const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(60);

/// Removes AVAILABLE messages that outlived their queue's retention period.
///
/// In-flight messages are never purged; their lease is resolved first.
pub struct RetentionManager {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    check_interval: Duration,
}

impl RetentionManager {
    /// Create a retention manager.
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        check_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            check_interval,
        }
    }

    /// Run one retention pass, returning how many messages were removed.
    pub async fn purge(&self) -> Result<usize> {
        let purged = self.store.purge_expired(self.clock.now()).await?;
        let count = purged.len();

        for message in purged {
            self.events.publish(QueueEvent::Dropped {
                queue: message.queue,
                message_id: message.id,
                reason: DropReason::RetentionExpired,
            });
        }

        Ok(count)
    }

    /// Run retention passes until shutdown.
    pub async fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.check_interval.as_secs(),
            "Starting retention manager"
        );

        let mut interval = time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.purge().await {
                        Ok(0) => {}
                        Ok(count) => debug!(messages_deleted = count, "Retention pass completed"),
                        Err(e) => error!(error = %e, "Error deleting expired messages"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Retention manager shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::storage::memory::InMemoryBackend;
    use crate::types::{NewMessage, QueueConfig};

    #[tokio::test]
    async fn test_purge_emits_dropped_events() {
        let store = Arc::new(InMemoryBackend::new());
        let mut config = QueueConfig::new("orders");
        config.message_retention_period = 60;
        store.create_queue(config).await.unwrap();

        let clock = Arc::new(ManualClock::starting_now());
        store
            .enqueue("orders", NewMessage::new("stale"), clock.now())
            .await
            .unwrap();

        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let manager = RetentionManager::new(
            store.clone(),
            clock.clone(),
            events,
            DEFAULT_RETENTION_INTERVAL,
        );

        assert_eq!(manager.purge().await.unwrap(), 0);

        clock.advance_secs(61);
        assert_eq!(manager.purge().await.unwrap(), 1);
        match rx.recv().await.unwrap() {
            QueueEvent::Dropped { reason, .. } => assert_eq!(reason, DropReason::RetentionExpired),
            other => panic!("Expected Dropped, got {:?}", other),
        }
    }
}
