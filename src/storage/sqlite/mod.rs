//! SQLite-based storage backend for cloudq.
//!
//! Every lease transition is a single conditional `UPDATE ... RETURNING`, so the
//! row's `state` column is the compare-and-swap point and concurrent callers are
//! serialized by SQLite itself. Timestamps are stored as unix milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::{ExpiryOutcome, HealthStatus, MessageStore, QueueFilter};
use crate::types::{
    ConsumerToken, FailureRecord, Message, MessageId, MessageState, NewMessage, QueueConfig,
    QueueId, QueueStats, QueueType,
};

/// SQLite storage backend configuration.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file path (":memory:" for in-memory database).
    pub database_path: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: "cloudq.db".to_string(),
            max_connections: 10,
        }
    }
}

/// SQLite-based storage backend.
pub struct SqliteBackend {
    pool: SqlitePool,
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| Error::StorageError(format!("Invalid timestamp: {}", value)))
}

fn from_optional_millis(value: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    value.map(from_millis).transpose()
}

fn storage_error(action: &str) -> impl FnOnce(sqlx::Error) -> Error + '_ {
    move |e| Error::StorageError(format!("Failed to {}: {}", action, e))
}

impl SqliteBackend {
    /// Create a new SQLite backend and apply migrations.
    pub async fn new(config: SqliteConfig) -> Result<Self> {
        info!(
            database_path = %config.database_path,
            max_connections = config.max_connections,
            "Initializing SQLite backend"
        );

        let in_memory = config.database_path == ":memory:";

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(if in_memory {
                sqlx::sqlite::SqliteJournalMode::Memory
            } else {
                sqlx::sqlite::SqliteJournalMode::Wal
            })
            .busy_timeout(std::time::Duration::from_secs(5));

        // An in-memory database lives and dies with its single connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to connect to SQLite: {}", e)))?;

        sqlx::migrate!("./migrations/sqlite")
            .run(&pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to run migrations: {}", e)))?;

        info!("SQLite backend initialized successfully");

        Ok(Self { pool })
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn parse_queue_row(row: &SqliteRow) -> Result<QueueConfig> {
        let queue_type: String = row.get("queue_type");
        let queue_type = QueueType::parse(&queue_type)
            .ok_or_else(|| Error::StorageError(format!("Unknown queue type: {}", queue_type)))?;

        Ok(QueueConfig {
            id: QueueId(row.get("id")),
            name: row.get("name"),
            queue_type,
            visibility_timeout: row.get::<i64, _>("visibility_timeout") as u32,
            max_receives: row.get::<i64, _>("max_receives") as u32,
            message_retention_period: row.get::<i64, _>("message_retention_period") as u32,
            max_message_size: row.get::<i64, _>("max_message_size") as usize,
            max_messages: row.get::<Option<i64>, _>("max_messages").map(|n| n as usize),
            dlq_name: row.get("dlq_name"),
            created_at: from_millis(row.get("created_at"))?,
        })
    }

    fn parse_message_row(row: &SqliteRow) -> Result<Message> {
        let state: String = row.get("state");
        let state = MessageState::parse(&state)
            .ok_or_else(|| Error::StorageError(format!("Unknown message state: {}", state)))?;

        let failure = match row.get::<Option<String>, _>("failure_original_queue") {
            Some(original_queue) => Some(FailureRecord {
                original_queue,
                final_receive_count: row
                    .get::<Option<i64>, _>("failure_final_receive_count")
                    .unwrap_or_default() as u32,
                first_enqueued_at: from_millis(
                    row.get::<Option<i64>, _>("failure_first_enqueued_at")
                        .unwrap_or_default(),
                )?,
                last_failure_at: from_millis(
                    row.get::<Option<i64>, _>("failure_last_failure_at")
                        .unwrap_or_default(),
                )?,
            }),
            None => None,
        };

        Ok(Message {
            id: MessageId(row.get("id")),
            queue: row.get("queue_name"),
            sequence: row.get::<i64, _>("sequence") as u64,
            body: row.get("body"),
            enqueued_at: from_millis(row.get("enqueued_at"))?,
            visibility_deadline: from_optional_millis(row.get("visibility_deadline"))?,
            consumer_token: row
                .get::<Option<String>, _>("consumer_token")
                .map(ConsumerToken),
            lease_acquired_at: from_optional_millis(row.get("lease_acquired_at"))?,
            receive_count: row.get::<i64, _>("receive_count") as u32,
            max_receives: row.get::<i64, _>("max_receives") as u32,
            visibility_timeout: row.get::<i64, _>("visibility_timeout") as u32,
            last_failure_at: from_optional_millis(row.get("last_failure_at"))?,
            failure,
            state,
        })
    }

    fn parse_message_rows(rows: &[SqliteRow]) -> Result<Vec<Message>> {
        rows.iter().map(Self::parse_message_row).collect()
    }

    async fn queue_type_of(&self, name: &str) -> Result<QueueType> {
        let queue_type: Option<String> =
            sqlx::query_scalar("SELECT queue_type FROM queues WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error("look up queue"))?;

        let queue_type = queue_type.ok_or_else(|| Error::QueueNotFound(name.to_string()))?;
        QueueType::parse(&queue_type)
            .ok_or_else(|| Error::StorageError(format!("Unknown queue type: {}", queue_type)))
    }

    async fn message_state(&self, id: &MessageId) -> Result<Option<(MessageState, Option<i64>)>> {
        let row = sqlx::query("SELECT state, visibility_deadline FROM messages WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error("look up message"))?;

        match row {
            Some(row) => {
                let state: String = row.get("state");
                let state = MessageState::parse(&state).ok_or_else(|| {
                    Error::StorageError(format!("Unknown message state: {}", state))
                })?;
                Ok(Some((state, row.get("visibility_deadline"))))
            }
            None => Ok(None),
        }
    }

    /// Error for a lease operation whose conditional update matched nothing.
    async fn lease_failure(&self, id: &MessageId) -> Error {
        match self.message_state(id).await {
            Ok(Some(_)) => Error::TokenMismatch(id.to_string()),
            Ok(None) => Error::MessageNotFound(id.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl MessageStore for SqliteBackend {
    async fn create_queue(&self, config: QueueConfig) -> Result<QueueConfig> {
        debug!(queue = %config.name, queue_id = %config.id, "Creating queue in SQLite");

        sqlx::query(
            r#"
            INSERT INTO queues (
                name, id, queue_type, visibility_timeout, max_receives,
                message_retention_period, max_message_size, max_messages, dlq_name,
                next_sequence, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&config.name)
        .bind(&config.id.0)
        .bind(config.queue_type.as_str())
        .bind(config.visibility_timeout as i64)
        .bind(config.max_receives as i64)
        .bind(config.message_retention_period as i64)
        .bind(config.max_message_size as i64)
        .bind(config.max_messages.map(|n| n as i64))
        .bind(&config.dlq_name)
        .bind(millis(config.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint failed") {
                Error::QueueAlreadyExists(config.name.clone())
            } else {
                Error::StorageError(format!("Failed to create queue: {}", e))
            }
        })?;

        info!(queue = %config.name, queue_id = %config.id, "Queue created in SQLite");
        Ok(config)
    }

    async fn get_queue(&self, name: &str) -> Result<QueueConfig> {
        let row = sqlx::query("SELECT * FROM queues WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error("get queue"))?
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;

        Self::parse_queue_row(&row)
    }

    async fn list_queues(&self, filter: Option<QueueFilter>) -> Result<Vec<QueueConfig>> {
        let rows = sqlx::query("SELECT * FROM queues ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error("list queues"))?;

        let mut configs = rows
            .iter()
            .map(Self::parse_queue_row)
            .collect::<Result<Vec<_>>>()?;

        if let Some(prefix) = filter.and_then(|f| f.name_prefix) {
            configs.retain(|c| c.name.starts_with(&prefix));
        }

        Ok(configs)
    }

    async fn update_queue(&self, config: QueueConfig) -> Result<QueueConfig> {
        debug!(queue = %config.name, "Updating queue in SQLite");

        let result = sqlx::query(
            r#"
            UPDATE queues
            SET visibility_timeout = ?,
                max_receives = ?,
                message_retention_period = ?,
                max_message_size = ?,
                max_messages = ?,
                dlq_name = ?
            WHERE name = ?
            "#,
        )
        .bind(config.visibility_timeout as i64)
        .bind(config.max_receives as i64)
        .bind(config.message_retention_period as i64)
        .bind(config.max_message_size as i64)
        .bind(config.max_messages.map(|n| n as i64))
        .bind(&config.dlq_name)
        .bind(&config.name)
        .execute(&self.pool)
        .await
        .map_err(storage_error("update queue"))?;

        if result.rows_affected() == 0 {
            return Err(Error::QueueNotFound(config.name.clone()));
        }

        info!(queue = %config.name, "Queue updated in SQLite");
        Ok(config)
    }

    async fn delete_queue(&self, name: &str, force: bool) -> Result<u64> {
        debug!(queue = %name, force, "Deleting queue from SQLite");

        let mut tx = self.pool.begin().await.map_err(storage_error("begin transaction"))?;

        // Touching the queue row takes the write lock before the emptiness check
        let touched = sqlx::query("UPDATE queues SET next_sequence = next_sequence WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(storage_error("lock queue"))?
            .rows_affected();
        if touched == 0 {
            return Err(Error::QueueNotFound(name.to_string()));
        }

        if !force {
            let stored: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM messages WHERE queue_name = ? AND state != 'deleted'",
            )
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage_error("count queue messages"))?;
            if stored > 0 {
                return Err(Error::QueueNotEmpty {
                    queue: name.to_string(),
                    messages: stored as u64,
                });
            }
        }

        let discarded = sqlx::query("DELETE FROM messages WHERE queue_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(storage_error("delete queue messages"))?
            .rows_affected();

        let deleted = sqlx::query("DELETE FROM queues WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(storage_error("delete queue"))?
            .rows_affected();

        if deleted == 0 {
            return Err(Error::QueueNotFound(name.to_string()));
        }

        tx.commit().await.map_err(storage_error("commit queue deletion"))?;

        info!(queue = %name, messages_discarded = discarded, "Queue deleted from SQLite");
        Ok(discarded)
    }

    async fn enqueue(
        &self,
        queue: &str,
        new_message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let mut tx = self.pool.begin().await.map_err(storage_error("begin transaction"))?;

        // Claiming the sequence first takes the write lock for the whole transaction
        let row = sqlx::query(
            r#"
            UPDATE queues
            SET next_sequence = next_sequence + 1
            WHERE name = ?
            RETURNING next_sequence - 1 AS sequence, id, queue_type,
                      visibility_timeout, max_receives, max_messages
            "#,
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error("allocate sequence"))?
        .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        let sequence = row.get::<i64, _>("sequence") as u64;
        let queue_id = QueueId(row.get("id"));
        let queue_type: String = row.get("queue_type");
        let visibility_timeout = row.get::<i64, _>("visibility_timeout") as u32;
        let max_receives = row.get::<i64, _>("max_receives") as u32;

        if let Some(limit) = row.get::<Option<i64>, _>("max_messages") {
            let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE queue_name = ?")
                .bind(queue)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_error("count messages"))?;

            if stored >= limit {
                return Err(Error::CapacityExceeded {
                    queue: queue.to_string(),
                    limit: limit as usize,
                });
            }
        }

        let id = match QueueType::parse(&queue_type) {
            Some(QueueType::Fifo) => MessageId::sequenced(&queue_id, sequence),
            _ => MessageId::new(),
        };

        let failure = new_message.failure;
        sqlx::query(
            r#"
            INSERT INTO messages (
                id, queue_name, sequence, body, enqueued_at, state, receive_count,
                max_receives, visibility_timeout, failure_original_queue,
                failure_final_receive_count, failure_first_enqueued_at,
                failure_last_failure_at
            ) VALUES (?, ?, ?, ?, ?, 'available', 0, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(queue)
        .bind(sequence as i64)
        .bind(&new_message.body)
        .bind(millis(now))
        .bind(max_receives as i64)
        .bind(visibility_timeout as i64)
        .bind(failure.as_ref().map(|f| f.original_queue.clone()))
        .bind(failure.as_ref().map(|f| f.final_receive_count as i64))
        .bind(failure.as_ref().map(|f| millis(f.first_enqueued_at)))
        .bind(failure.as_ref().map(|f| millis(f.last_failure_at)))
        .execute(&mut *tx)
        .await
        .map_err(storage_error("insert message"))?;

        tx.commit().await.map_err(storage_error("commit message"))?;

        debug!(queue = %queue, message_id = %id, sequence, "Message stored in SQLite");

        Ok(Message {
            id,
            queue: queue.to_string(),
            sequence,
            body: new_message.body,
            enqueued_at: now,
            visibility_deadline: None,
            consumer_token: None,
            lease_acquired_at: None,
            receive_count: 0,
            max_receives,
            visibility_timeout,
            last_failure_at: None,
            failure,
            state: MessageState::Available,
        })
    }

    async fn fetch_available(&self, queue: &str, limit: usize) -> Result<Vec<Message>> {
        let sql = match self.queue_type_of(queue).await? {
            QueueType::Standard => {
                r#"
                SELECT * FROM messages
                WHERE queue_name = ?1 AND state = 'available'
                ORDER BY sequence
                LIMIT ?2
                "#
            }
            // Nothing is delivered past the first unresolved message
            QueueType::Fifo => {
                r#"
                SELECT * FROM messages
                WHERE queue_name = ?1 AND state = 'available'
                  AND sequence < COALESCE(
                      (SELECT MIN(sequence) FROM messages
                       WHERE queue_name = ?1 AND state IN ('in_flight', 'dead_lettered')),
                      9223372036854775807)
                ORDER BY sequence
                LIMIT ?2
                "#
            }
        };

        let rows = sqlx::query(sql)
            .bind(queue)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error("fetch available messages"))?;

        Self::parse_message_rows(&rows)
    }

    async fn mark_in_flight(
        &self,
        id: &MessageId,
        token: &ConsumerToken,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Message> {
        let row = sqlx::query(
            r#"
            UPDATE messages
            SET state = 'in_flight',
                consumer_token = ?,
                lease_acquired_at = ?,
                visibility_deadline = ?
            WHERE id = ? AND state = 'available'
            RETURNING *
            "#,
        )
        .bind(token.as_str())
        .bind(millis(acquired_at))
        .bind(millis(expires_at))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error("mark message in flight"))?;

        match row {
            Some(row) => Self::parse_message_row(&row),
            None => match self.message_state(id).await? {
                Some(_) => Err(Error::Conflict(id.to_string())),
                None => Err(Error::MessageNotFound(id.to_string())),
            },
        }
    }

    async fn delete(&self, id: &MessageId, token: &ConsumerToken) -> Result<Message> {
        let row = sqlx::query(
            r#"
            DELETE FROM messages
            WHERE id = ? AND state = 'in_flight' AND consumer_token = ?
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error("delete message"))?;

        match row {
            Some(row) => {
                debug!(message_id = %id, "Message deleted from SQLite");
                Self::parse_message_row(&row)
            }
            None => Err(self.lease_failure(id).await),
        }
    }

    async fn release(&self, id: &MessageId, token: &ConsumerToken) -> Result<Message> {
        let row = sqlx::query(
            r#"
            UPDATE messages
            SET state = 'available',
                consumer_token = NULL,
                lease_acquired_at = NULL,
                visibility_deadline = NULL
            WHERE id = ? AND state = 'in_flight' AND consumer_token = ?
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error("release message"))?;

        match row {
            Some(row) => Self::parse_message_row(&row),
            None => Err(self.lease_failure(id).await),
        }
    }

    async fn extend_lease(
        &self,
        id: &MessageId,
        token: &ConsumerToken,
        new_deadline: DateTime<Utc>,
    ) -> Result<Message> {
        let row = sqlx::query(
            r#"
            UPDATE messages
            SET visibility_deadline = ?
            WHERE id = ? AND state = 'in_flight' AND consumer_token = ?
            RETURNING *
            "#,
        )
        .bind(millis(new_deadline))
        .bind(id.as_str())
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error("extend lease"))?;

        match row {
            Some(row) => Self::parse_message_row(&row),
            None => Err(self.lease_failure(id).await),
        }
    }

    async fn expire_lease(
        &self,
        id: &MessageId,
        expected_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExpiryOutcome> {
        let row = sqlx::query(
            r#"
            UPDATE messages
            SET receive_count = receive_count + 1,
                last_failure_at = ?1,
                state = CASE WHEN receive_count + 1 >= max_receives
                             THEN 'dead_lettered' ELSE 'available' END,
                consumer_token = NULL,
                lease_acquired_at = NULL,
                visibility_deadline = NULL
            WHERE id = ?2
              AND state = 'in_flight'
              AND visibility_deadline = ?3
              AND visibility_deadline <= ?1
            RETURNING *
            "#,
        )
        .bind(millis(now))
        .bind(id.as_str())
        .bind(millis(expected_deadline))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error("expire lease"))?;

        if let Some(row) = row {
            let message = Self::parse_message_row(&row)?;
            return Ok(if message.state == MessageState::DeadLettered {
                ExpiryOutcome::Exhausted(message)
            } else {
                ExpiryOutcome::Requeued(message)
            });
        }

        match self.message_state(id).await? {
            Some((MessageState::InFlight, Some(deadline))) => {
                Ok(ExpiryOutcome::Rescheduled(from_millis(deadline)?))
            }
            _ => Ok(ExpiryOutcome::Stale),
        }
    }

    async fn remove(&self, id: &MessageId) -> Result<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_error("remove message"))?;

        if result.rows_affected() == 0 {
            return Err(Error::MessageNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_message(&self, id: &MessageId) -> Result<Message> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error("get message"))?
            .ok_or_else(|| Error::MessageNotFound(id.to_string()))?;

        Self::parse_message_row(&row)
    }

    async fn peek_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<Message>> {
        self.queue_type_of(queue).await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE queue_name = ? AND state IN ('available', 'in_flight')
              AND failure_original_queue IS NOT NULL
            ORDER BY sequence
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("peek dead letters"))?;

        Self::parse_message_rows(&rows)
    }

    async fn in_flight_leases(&self) -> Result<Vec<(MessageId, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT id, visibility_deadline FROM messages \
             WHERE state = 'in_flight' AND visibility_deadline IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("list in-flight leases"))?;

        rows.iter()
            .map(|row| Ok((MessageId(row.get("id")), from_millis(row.get("visibility_deadline"))?)))
            .collect()
    }

    async fn dead_lettered(&self) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE state = 'dead_lettered' ORDER BY queue_name, sequence",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("list dead-lettered messages"))?;

        Self::parse_message_rows(&rows)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM messages
            WHERE state = 'available'
              AND enqueued_at <= ? - 1000 * (
                  SELECT message_retention_period FROM queues
                  WHERE queues.name = messages.queue_name)
            RETURNING *
            "#,
        )
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("purge expired messages"))?;

        let purged = Self::parse_message_rows(&rows)?;
        if !purged.is_empty() {
            info!(
                messages_deleted = purged.len(),
                "Deleted expired messages past retention period"
            );
        }
        Ok(purged)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        self.queue_type_of(queue).await?;

        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS count, MIN(enqueued_at) AS oldest
            FROM messages
            WHERE queue_name = ?
            GROUP BY state
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("get queue stats"))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let count = row.get::<i64, _>("count") as u64;
            match MessageState::parse(&state) {
                Some(MessageState::Available) => stats.available_messages = count,
                Some(MessageState::InFlight) => stats.in_flight_messages = count,
                Some(MessageState::DeadLettered) => stats.dead_lettered_messages = count,
                _ => continue,
            }

            let oldest = from_millis(row.get("oldest"))?;
            if stats
                .oldest_message_timestamp
                .is_none_or(|current| oldest < current)
            {
                stats.oldest_message_timestamp = Some(oldest);
            }
        }

        Ok(stats)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus::Healthy),
            Err(e) => Ok(HealthStatus::Unhealthy(format!(
                "Database health check failed: {}",
                e
            ))),
        }
    }
}
