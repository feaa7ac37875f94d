//! # cloudq
//!
//! A durable message queue with at-least-once delivery.
//!
//! Consumers lease messages for a visibility timeout. A lease that expires
//! without an acknowledgement makes the message deliverable again, and a
//! message that keeps failing is moved to its queue's dead-letter queue.
//! Storage is pluggable: an in-memory store for tests and development, and a
//! SQLite store that survives restarts.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudq::service::QueueService;
//! use cloudq::storage::memory::InMemoryBackend;
//! use cloudq::types::ConsumerToken;
//!
//! # async fn demo() -> cloudq::Result<()> {
//! let service = QueueService::new(Arc::new(InMemoryBackend::new()));
//! service.create_queue("orders", 30, 5, None).await?;
//! service.enqueue("orders", b"order-1".to_vec()).await?;
//!
//! let worker = ConsumerToken::new("worker-1");
//! for message in service.receive("orders", &worker, 10).await? {
//!     service.ack(&message.id, &worker).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod server;
pub mod service;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
