//! Queue registry: configuration CRUD and queue lifecycle.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ValidationError;
use crate::metrics::get_metrics;
use crate::storage::{MessageStore, QueueFilter};
use crate::types::validation::{
    validate_max_message_size, validate_max_receives, validate_queue_name,
    validate_retention_period, validate_visibility_timeout,
};
use crate::types::{
    QueueConfig, QueueId, QueueType, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_RECEIVES,
    DEFAULT_RETENTION_PERIOD, DEFAULT_VISIBILITY_TIMEOUT,
};
use crate::{Error, Result};

/// Settings applied when a [`QueueSpec`] leaves them out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefaults {
    /// Visibility timeout in seconds.
    pub visibility_timeout: u32,
    /// Receives before dead-lettering.
    pub max_receives: u32,
    /// Retention in seconds.
    pub message_retention_period: u32,
    /// Body size limit in bytes.
    pub max_message_size: usize,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_receives: DEFAULT_MAX_RECEIVES,
            message_retention_period: DEFAULT_RETENTION_PERIOD,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Request to create a queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Queue type, standard unless given.
    #[serde(default)]
    pub queue_type: Option<QueueType>,
    /// Visibility timeout in seconds.
    #[serde(default)]
    pub visibility_timeout: Option<u32>,
    /// Receives before dead-lettering.
    #[serde(default)]
    pub max_receives: Option<u32>,
    /// Retention in seconds.
    #[serde(default)]
    pub message_retention_period: Option<u32>,
    /// Body size limit in bytes.
    #[serde(default)]
    pub max_message_size: Option<usize>,
    /// Capacity in messages.
    #[serde(default)]
    pub max_messages: Option<usize>,
    /// Existing queue that receives exhausted messages.
    #[serde(default)]
    pub dlq_name: Option<String>,
}

impl QueueSpec {
    /// A standard queue with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Make this a FIFO queue.
    pub fn fifo(mut self) -> Self {
        self.queue_type = Some(QueueType::Fifo);
        self
    }

    /// Set the visibility timeout in seconds.
    pub fn visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = Some(seconds);
        self
    }

    /// Set the receive budget.
    pub fn max_receives(mut self, max_receives: u32) -> Self {
        self.max_receives = Some(max_receives);
        self
    }

    /// Set the retention period in seconds.
    pub fn retention(mut self, seconds: u32) -> Self {
        self.message_retention_period = Some(seconds);
        self
    }

    /// Set the body size limit.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// Cap the number of stored messages.
    pub fn max_messages(mut self, limit: usize) -> Self {
        self.max_messages = Some(limit);
        self
    }

    /// Route exhausted messages to `dlq`.
    pub fn dead_letter_queue(mut self, dlq: impl Into<String>) -> Self {
        self.dlq_name = Some(dlq.into());
        self
    }
}

/// Partial configuration change. Absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueUpdate {
    /// New visibility timeout.
    pub visibility_timeout: Option<u32>,
    /// New receive budget.
    pub max_receives: Option<u32>,
    /// New retention period.
    pub message_retention_period: Option<u32>,
    /// New body size limit.
    pub max_message_size: Option<usize>,
    /// New capacity.
    pub max_messages: Option<usize>,
    /// New dead-letter queue.
    pub dlq_name: Option<String>,
    /// Detach the dead-letter queue.
    pub remove_dead_letter_queue: bool,
}

/// Queue configuration CRUD on top of a [`MessageStore`].
pub struct QueueRegistry {
    store: Arc<dyn MessageStore>,
    defaults: QueueDefaults,
}

impl QueueRegistry {
    /// Create a registry.
    pub fn new(store: Arc<dyn MessageStore>, defaults: QueueDefaults) -> Self {
        Self { store, defaults }
    }

    /// Defaults applied to new queues.
    pub fn defaults(&self) -> &QueueDefaults {
        &self.defaults
    }

    /// Create a queue.
    pub async fn create_queue(&self, spec: QueueSpec) -> Result<QueueConfig> {
        validate_queue_name(&spec.name)?;

        let config = QueueConfig {
            id: QueueId::new(),
            queue_type: spec.queue_type.unwrap_or(QueueType::Standard),
            visibility_timeout: spec
                .visibility_timeout
                .unwrap_or(self.defaults.visibility_timeout),
            max_receives: spec.max_receives.unwrap_or(self.defaults.max_receives),
            message_retention_period: spec
                .message_retention_period
                .unwrap_or(self.defaults.message_retention_period),
            max_message_size: spec
                .max_message_size
                .unwrap_or(self.defaults.max_message_size),
            max_messages: spec.max_messages,
            dlq_name: spec.dlq_name,
            created_at: Utc::now(),
            name: spec.name,
        };

        self.validate(&config).await?;

        let created = self.store.create_queue(config).await?;
        get_metrics().queue_count.inc();

        info!(
            queue = %created.name,
            queue_id = %created.id,
            queue_type = created.queue_type.as_str(),
            dlq = created.dlq_name.as_deref().unwrap_or("-"),
            "Queue registered"
        );
        Ok(created)
    }

    /// Delete a queue, returning the number of messages discarded.
    ///
    /// Refuses while another queue routes dead letters into it, and while it
    /// still holds messages unless `force` is set.
    pub async fn delete_queue(&self, name: &str, force: bool) -> Result<u64> {
        self.store.get_queue(name).await?;

        if let Some(source) = self
            .store
            .list_queues(None)
            .await?
            .into_iter()
            .find(|q| q.name != name && q.dlq_name.as_deref() == Some(name))
        {
            return Err(Error::DeadLetterQueueInUse {
                queue: name.to_string(),
                referenced_by: source.name,
            });
        }

        let discarded = self.store.delete_queue(name, force).await?;
        let metrics = get_metrics();
        metrics.queue_count.dec();
        // Gauges for a queue that never reported stats are absent
        let _ = metrics.queue_depth.remove_label_values(&[name]);
        let _ = metrics.in_flight_messages.remove_label_values(&[name]);

        info!(queue = %name, messages_discarded = discarded, force, "Queue deleted");
        Ok(discarded)
    }

    /// Apply a configuration change. Only messages enqueued afterwards see it.
    pub async fn update_config(&self, name: &str, update: QueueUpdate) -> Result<QueueConfig> {
        let mut config = self.store.get_queue(name).await?;

        if let Some(v) = update.visibility_timeout {
            config.visibility_timeout = v;
        }
        if let Some(v) = update.max_receives {
            config.max_receives = v;
        }
        if let Some(v) = update.message_retention_period {
            config.message_retention_period = v;
        }
        if let Some(v) = update.max_message_size {
            config.max_message_size = v;
        }
        if let Some(v) = update.max_messages {
            config.max_messages = Some(v);
        }
        if update.remove_dead_letter_queue {
            config.dlq_name = None;
        } else if let Some(dlq) = update.dlq_name {
            config.dlq_name = Some(dlq);
        }

        self.validate(&config).await?;

        let updated = self.store.update_queue(config).await?;
        debug!(queue = %name, "Queue configuration updated");
        Ok(updated)
    }

    /// Look up a queue.
    pub async fn get(&self, name: &str) -> Result<QueueConfig> {
        self.store.get_queue(name).await
    }

    /// List queues, ordered by name.
    pub async fn list(&self, filter: Option<QueueFilter>) -> Result<Vec<QueueConfig>> {
        self.store.list_queues(filter).await
    }

    async fn validate(&self, config: &QueueConfig) -> Result<()> {
        validate_visibility_timeout(config.visibility_timeout)?;
        validate_max_receives(config.max_receives)?;
        validate_retention_period(config.message_retention_period)?;
        validate_max_message_size(config.max_message_size)?;

        if let Some(dlq) = &config.dlq_name {
            if dlq == &config.name {
                return Err(ValidationError::InvalidParameter {
                    name: "dlq_name".to_string(),
                    reason: "a queue cannot be its own dead-letter queue".to_string(),
                }
                .into());
            }
            match self.store.get_queue(dlq).await {
                Ok(_) => {}
                Err(Error::QueueNotFound(_)) => {
                    return Err(ValidationError::InvalidParameter {
                        name: "dlq_name".to_string(),
                        reason: format!("dead-letter queue {} does not exist", dlq),
                    }
                    .into())
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
