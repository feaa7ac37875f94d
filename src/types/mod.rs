//! Common data types for cloudq.

pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default visibility timeout in seconds.
pub const DEFAULT_VISIBILITY_TIMEOUT: u32 = 30;
/// Default number of receives before a message is dead-lettered.
pub const DEFAULT_MAX_RECEIVES: u32 = 5;
/// Default retention period in seconds (4 days).
pub const DEFAULT_RETENTION_PERIOD: u32 = 345_600;
/// Default maximum body size in bytes (256KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 262_144;

/// Unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }

    /// Create an ordered message ID for a FIFO queue.
    ///
    /// The sequence is zero padded so ids sort lexicographically in enqueue order.
    pub fn sequenced(queue_id: &QueueId, sequence: u64) -> Self {
        MessageId(format!("{}-{:020}", queue_id, sequence))
    }

    /// Create a message ID from a string.
    pub fn from_string(s: String) -> Self {
        MessageId(s)
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique queue identifier, returned by queue creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(pub String);

impl QueueId {
    /// Create a new random queue ID.
    pub fn new() -> Self {
        QueueId(Uuid::new_v4().simple().to_string())
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of the consumer holding a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerToken(pub String);

impl ConsumerToken {
    /// Create a token from a caller supplied string.
    pub fn new(token: impl Into<String>) -> Self {
        ConsumerToken(token.into())
    }

    /// Generate a random token for callers that do not bring their own.
    pub fn generate() -> Self {
        ConsumerToken(Uuid::new_v4().to_string())
    }

    /// Borrow the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Eligible for delivery.
    Available,
    /// Leased to a consumer.
    InFlight,
    /// Exhausted its receives and is being routed out of the queue.
    DeadLettered,
    /// Acknowledged.
    Deleted,
}

impl MessageState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Available => "available",
            MessageState::InFlight => "in_flight",
            MessageState::DeadLettered => "dead_lettered",
            MessageState::Deleted => "deleted",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(MessageState::Available),
            "in_flight" => Some(MessageState::InFlight),
            "dead_lettered" => Some(MessageState::DeadLettered),
            "deleted" => Some(MessageState::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a message ended up in a dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Queue the message was originally enqueued into.
    pub original_queue: String,
    /// Receive count at the moment it was dead-lettered.
    pub final_receive_count: u32,
    /// When the message was first enqueued.
    pub first_enqueued_at: DateTime<Utc>,
    /// When its last lease expired.
    pub last_failure_at: DateTime<Utc>,
}

/// A message in the queue system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID.
    pub id: MessageId,
    /// Name of the queue holding this message.
    pub queue: String,
    /// Per-queue enqueue sequence.
    pub sequence: u64,
    /// Opaque message body.
    pub body: Vec<u8>,
    /// When the message was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Lease deadline while in flight.
    pub visibility_deadline: Option<DateTime<Utc>>,
    /// Holder of the current lease.
    pub consumer_token: Option<ConsumerToken>,
    /// When the current lease was acquired.
    pub lease_acquired_at: Option<DateTime<Utc>>,
    /// Number of leases that expired without an ack.
    pub receive_count: u32,
    /// Receive budget, copied from the queue at enqueue time.
    pub max_receives: u32,
    /// Lease length in seconds, copied from the queue at enqueue time.
    pub visibility_timeout: u32,
    /// When the last lease expired.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Present on messages copied into a dead-letter queue.
    pub failure: Option<FailureRecord>,
    /// Delivery state.
    pub state: MessageState,
}

impl Message {
    /// The current lease, if the message is in flight.
    pub fn lease(&self) -> Option<Lease> {
        if self.state != MessageState::InFlight {
            return None;
        }
        Some(Lease {
            message_id: self.id.clone(),
            consumer_token: self.consumer_token.clone()?,
            acquired_at: self.lease_acquired_at?,
            expires_at: self.visibility_deadline?,
        })
    }

    /// Whether `token` holds the current lease.
    pub fn is_leased_to(&self, token: &ConsumerToken) -> bool {
        self.state == MessageState::InFlight && self.consumer_token.as_ref() == Some(token)
    }

    /// Body size in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// A message to be stored by [`crate::storage::MessageStore::enqueue`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Opaque message body.
    pub body: Vec<u8>,
    /// Failure record when the message is a dead letter.
    pub failure: Option<FailureRecord>,
}

impl NewMessage {
    /// A plain producer message.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            failure: None,
        }
    }

    /// A dead letter carrying its failure record.
    pub fn dead_letter(body: Vec<u8>, failure: FailureRecord) -> Self {
        Self {
            body,
            failure: Some(failure),
        }
    }
}

/// Temporary exclusive claim on a message. A view over the message's own fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Leased message.
    pub message_id: MessageId,
    /// Lease holder.
    pub consumer_token: ConsumerToken,
    /// Acquisition time.
    pub acquired_at: DateTime<Utc>,
    /// Deadline after which the message becomes redeliverable.
    pub expires_at: DateTime<Utc>,
}

/// A dead-letter queue entry as returned by peeking a DLQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The message stored in the dead-letter queue.
    pub message: Message,
    /// Why it was dead-lettered.
    pub failure: FailureRecord,
}

/// Queue type enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Best-effort ordering, random message ids.
    Standard,
    /// Strict enqueue ordering, monotonically ordered message ids.
    Fifo,
}

impl QueueType {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Standard => "standard",
            QueueType::Fifo => "fifo",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Some(QueueType::Standard),
            "fifo" => Some(QueueType::Fifo),
            _ => None,
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue ID.
    pub id: QueueId,
    /// Queue name.
    pub name: String,
    /// Queue type.
    pub queue_type: QueueType,
    /// Visibility timeout in seconds.
    pub visibility_timeout: u32,
    /// Leases that may expire before the message is dead-lettered (>= 1).
    pub max_receives: u32,
    /// Message retention period in seconds.
    pub message_retention_period: u32,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// Maximum number of stored messages.
    pub max_messages: Option<usize>,
    /// Dead-letter queue name.
    pub dlq_name: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl QueueConfig {
    /// A standard queue with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: QueueId::new(),
            name: name.into(),
            queue_type: QueueType::Standard,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_receives: DEFAULT_MAX_RECEIVES,
            message_retention_period: DEFAULT_RETENTION_PERIOD,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_messages: None,
            dlq_name: None,
            created_at: Utc::now(),
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of messages available.
    pub available_messages: u64,
    /// Number of messages in flight.
    pub in_flight_messages: u64,
    /// Messages waiting to be routed to a dead-letter queue.
    pub dead_lettered_messages: u64,
    /// Oldest message timestamp.
    pub oldest_message_timestamp: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Messages still stored in the queue.
    pub fn total(&self) -> u64 {
        self.available_messages + self.in_flight_messages + self.dead_lettered_messages
    }
}
