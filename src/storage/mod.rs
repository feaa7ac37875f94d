//! Message store traits and implementations.
//!
//! A [`MessageStore`] owns queue configuration and message records. It exposes
//! reads that never mutate ([`MessageStore::fetch_available`], [`MessageStore::peek`])
//! separately from the atomic state transitions the delivery engine and the
//! visibility scheduler drive ([`MessageStore::mark_in_flight`],
//! [`MessageStore::expire_lease`], ...). Every transition is a compare-and-swap on
//! a single message, so backends never need a store-wide lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    ConsumerToken, Message, MessageId, NewMessage, QueueConfig, QueueStats,
};
use crate::Result;

pub mod memory;
pub mod sqlite;

/// Filter for listing queues.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    /// Name prefix filter.
    pub name_prefix: Option<String>,
}

/// Result of the scheduler's expiry transition on one message.
#[derive(Debug, Clone)]
pub enum ExpiryOutcome {
    /// Lease expired, receive count incremented, message available again.
    Requeued(Message),
    /// Lease expired and the receive budget is spent; the message is now
    /// dead-lettered in its source queue and must be routed.
    Exhausted(Message),
    /// The message is still leased but with a different or later deadline.
    Rescheduled(DateTime<Utc>),
    /// Acked, released, removed or otherwise no longer holding that lease.
    Stale,
}

/// Health status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Backend is healthy.
    Healthy,
    /// Backend is unhealthy.
    Unhealthy(String),
}

/// Message store trait.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a new queue.
    async fn create_queue(&self, config: QueueConfig) -> Result<QueueConfig>;

    /// Get a queue by name.
    async fn get_queue(&self, name: &str) -> Result<QueueConfig>;

    /// List queues with optional filter, ordered by name.
    async fn list_queues(&self, filter: Option<QueueFilter>) -> Result<Vec<QueueConfig>>;

    /// Replace a queue's configuration. Stored messages keep their copied settings.
    async fn update_queue(&self, config: QueueConfig) -> Result<QueueConfig>;

    /// Delete a queue and every message in it, returning how many were discarded.
    ///
    /// Unless `force` is set, fails with [`crate::Error::QueueNotEmpty`] when the
    /// queue still holds messages. The check and the delete are one atomic step,
    /// so a message enqueued concurrently is either counted or rejected.
    async fn delete_queue(&self, name: &str, force: bool) -> Result<u64>;

    /// Store a new AVAILABLE message.
    async fn enqueue(&self, queue: &str, message: NewMessage, now: DateTime<Utc>)
        -> Result<Message>;

    /// Up to `limit` AVAILABLE messages, oldest first. Does not mutate state.
    async fn fetch_available(&self, queue: &str, limit: usize) -> Result<Vec<Message>>;

    /// Atomically move an AVAILABLE message to IN_FLIGHT.
    ///
    /// Fails with [`crate::Error::Conflict`] when the message is not AVAILABLE.
    async fn mark_in_flight(
        &self,
        id: &MessageId,
        token: &ConsumerToken,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Message>;

    /// Acknowledge and delete an in-flight message, returning what was removed.
    async fn delete(&self, id: &MessageId, token: &ConsumerToken) -> Result<Message>;

    /// Return an in-flight message to AVAILABLE without counting a receive.
    async fn release(&self, id: &MessageId, token: &ConsumerToken) -> Result<Message>;

    /// Move the deadline of a lease still held by `token`.
    async fn extend_lease(
        &self,
        id: &MessageId,
        token: &ConsumerToken,
        new_deadline: DateTime<Utc>,
    ) -> Result<Message>;

    /// Expire the lease with deadline `expected_deadline` if it is still current
    /// and due at `now`.
    async fn expire_lease(
        &self,
        id: &MessageId,
        expected_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExpiryOutcome>;

    /// Unconditionally remove a message.
    async fn remove(&self, id: &MessageId) -> Result<()>;

    /// Look up a single message.
    async fn get_message(&self, id: &MessageId) -> Result<Message>;

    /// Up to `limit` AVAILABLE or IN_FLIGHT messages carrying a failure record,
    /// in enqueue order. Messages without one are skipped before the limit applies.
    /// Does not mutate.
    async fn peek_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<Message>>;

    /// Every outstanding lease as `(message, deadline)`, for scheduler recovery.
    async fn in_flight_leases(&self) -> Result<Vec<(MessageId, DateTime<Utc>)>>;

    /// Messages stuck in DEAD_LETTERED, for scheduler recovery.
    async fn dead_lettered(&self) -> Result<Vec<Message>>;

    /// Remove AVAILABLE messages older than their queue's retention period.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Message>>;

    /// Get queue statistics.
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Health check.
    async fn health_check(&self) -> Result<HealthStatus>;
}
