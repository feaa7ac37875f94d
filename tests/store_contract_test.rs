//! Behaviour every `MessageStore` must share, run against both backends.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cloudq::core::clock::truncate_millis;
use cloudq::storage::memory::InMemoryBackend;
use cloudq::storage::sqlite::{SqliteBackend, SqliteConfig};
use cloudq::storage::{ExpiryOutcome, MessageStore, QueueFilter};
use cloudq::types::{ConsumerToken, MessageState, NewMessage, QueueConfig, QueueType};
use cloudq::Error;

async fn backends() -> Vec<(&'static str, Arc<dyn MessageStore>)> {
    let sqlite = SqliteBackend::new(SqliteConfig {
        database_path: ":memory:".to_string(),
        max_connections: 1,
    })
    .await
    .expect("Failed to open SQLite backend");

    vec![
        ("memory", Arc::new(InMemoryBackend::new()) as Arc<dyn MessageStore>),
        ("sqlite", Arc::new(sqlite) as Arc<dyn MessageStore>),
    ]
}

// SQLite keeps millisecond timestamps
fn now() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

async fn queue(store: &Arc<dyn MessageStore>, name: &str, max_receives: u32) {
    let mut config = QueueConfig::new(name);
    config.max_receives = max_receives;
    store.create_queue(config).await.unwrap();
}

#[tokio::test]
async fn test_lease_is_exclusive() {
    for (label, store) in backends().await {
        queue(&store, "jobs", 5).await;
        let now = now();
        let message = store
            .enqueue("jobs", NewMessage::new("payload"), now)
            .await
            .unwrap();

        let deadline = now + Duration::seconds(30);
        let first = ConsumerToken::new("first");
        store
            .mark_in_flight(&message.id, &first, now, deadline)
            .await
            .unwrap();

        let second = store
            .mark_in_flight(&message.id, &ConsumerToken::new("second"), now, deadline)
            .await;
        assert!(matches!(second, Err(Error::Conflict(_))), "{}", label);
        assert!(
            store.fetch_available("jobs", 10).await.unwrap().is_empty(),
            "{}",
            label
        );

        let leased = store.get_message(&message.id).await.unwrap();
        assert_eq!(leased.state, MessageState::InFlight, "{}", label);
        assert!(leased.is_leased_to(&first), "{}", label);
    }
}

#[tokio::test]
async fn test_delete_requires_holder() {
    for (label, store) in backends().await {
        queue(&store, "jobs", 5).await;
        let now = now();
        let message = store
            .enqueue("jobs", NewMessage::new("payload"), now)
            .await
            .unwrap();
        let token = ConsumerToken::new("worker");

        let unleased = store.delete(&message.id, &token).await;
        assert!(matches!(unleased, Err(Error::TokenMismatch(_))), "{}", label);

        store
            .mark_in_flight(&message.id, &token, now, now + Duration::seconds(30))
            .await
            .unwrap();
        let removed = store.delete(&message.id, &token).await.unwrap();
        assert_eq!(removed.queue, "jobs", "{}", label);

        let again = store.delete(&message.id, &token).await;
        assert!(matches!(again, Err(Error::MessageNotFound(_))), "{}", label);
    }
}

#[tokio::test]
async fn test_expiry_outcomes() {
    for (label, store) in backends().await {
        queue(&store, "jobs", 2).await;
        let now = now();
        let message = store
            .enqueue("jobs", NewMessage::new("payload"), now)
            .await
            .unwrap();
        let token = ConsumerToken::new("worker");

        let deadline = now + Duration::seconds(10);
        store
            .mark_in_flight(&message.id, &token, now, deadline)
            .await
            .unwrap();

        // Not yet due
        let early = store
            .expire_lease(&message.id, deadline, now)
            .await
            .unwrap();
        assert!(matches!(early, ExpiryOutcome::Rescheduled(d) if d == deadline), "{}", label);

        // Deadline moved by an extension
        let later = deadline + Duration::seconds(10);
        store.extend_lease(&message.id, &token, later).await.unwrap();
        let stale = store
            .expire_lease(&message.id, deadline, deadline)
            .await
            .unwrap();
        assert!(matches!(stale, ExpiryOutcome::Rescheduled(d) if d == later), "{}", label);

        let requeued = store.expire_lease(&message.id, later, later).await.unwrap();
        match requeued {
            ExpiryOutcome::Requeued(m) => {
                assert_eq!(m.receive_count, 1, "{}", label);
                assert_eq!(m.state, MessageState::Available, "{}", label);
                assert!(m.consumer_token.is_none(), "{}", label);
            }
            other => panic!("{}: expected Requeued, got {:?}", label, other),
        }

        let again = store.expire_lease(&message.id, later, later).await.unwrap();
        assert!(matches!(again, ExpiryOutcome::Stale), "{}", label);

        let second_deadline = later + Duration::seconds(10);
        store
            .mark_in_flight(&message.id, &token, later, second_deadline)
            .await
            .unwrap();
        let exhausted = store
            .expire_lease(&message.id, second_deadline, second_deadline)
            .await
            .unwrap();
        match exhausted {
            ExpiryOutcome::Exhausted(m) => {
                assert_eq!(m.receive_count, 2, "{}", label);
                assert_eq!(m.state, MessageState::DeadLettered, "{}", label);
            }
            other => panic!("{}: expected Exhausted, got {:?}", label, other),
        }
        assert_eq!(store.dead_lettered().await.unwrap().len(), 1, "{}", label);
    }
}

#[tokio::test]
async fn test_fifo_blocks_behind_in_flight_head() {
    for (label, store) in backends().await {
        let mut config = QueueConfig::new("ledger");
        config.queue_type = QueueType::Fifo;
        store.create_queue(config).await.unwrap();

        let now = now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let m = store
                .enqueue("ledger", NewMessage::new(format!("entry-{}", i)), now)
                .await
                .unwrap();
            ids.push(m.id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "{}", label);

        let token = ConsumerToken::new("worker");
        store
            .mark_in_flight(&ids[0], &token, now, now + Duration::seconds(30))
            .await
            .unwrap();
        assert!(
            store.fetch_available("ledger", 10).await.unwrap().is_empty(),
            "{}",
            label
        );

        store.release(&ids[0], &token).await.unwrap();
        let order: Vec<_> = store
            .fetch_available("ledger", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(order, ids, "{}", label);
    }
}

#[tokio::test]
async fn test_queue_listing_and_capacity() {
    for (label, store) in backends().await {
        for name in ["alpha", "alpha-dlq", "beta"] {
            queue(&store, name, 5).await;
        }
        let duplicate = store.create_queue(QueueConfig::new("beta")).await;
        assert!(matches!(duplicate, Err(Error::QueueAlreadyExists(_))), "{}", label);

        let filtered = store
            .list_queues(Some(QueueFilter {
                name_prefix: Some("alpha".to_string()),
            }))
            .await
            .unwrap();
        let names: Vec<_> = filtered.into_iter().map(|q| q.name).collect();
        assert_eq!(names, vec!["alpha", "alpha-dlq"], "{}", label);

        let mut config = store.get_queue("beta").await.unwrap();
        config.max_messages = Some(1);
        store.update_queue(config).await.unwrap();

        let now = now();
        store.enqueue("beta", NewMessage::new("one"), now).await.unwrap();
        let full = store.enqueue("beta", NewMessage::new("two"), now).await;
        assert!(matches!(full, Err(Error::CapacityExceeded { limit: 1, .. })), "{}", label);

        let refused = store.delete_queue("beta", false).await;
        assert!(
            matches!(refused, Err(Error::QueueNotEmpty { messages: 1, .. })),
            "{}",
            label
        );
        assert_eq!(store.delete_queue("beta", true).await.unwrap(), 1, "{}", label);
        assert!(matches!(
            store.delete_queue("beta", true).await,
            Err(Error::QueueNotFound(_))
        ));
        let gone = store.enqueue("beta", NewMessage::new("three"), now).await;
        assert!(matches!(gone, Err(Error::QueueNotFound(_))), "{}", label);
    }
}

#[tokio::test]
async fn test_retention_skips_leased_messages() {
    for (label, store) in backends().await {
        let mut config = QueueConfig::new("jobs");
        config.message_retention_period = 60;
        store.create_queue(config).await.unwrap();

        let now = now();
        let idle = store.enqueue("jobs", NewMessage::new("idle"), now).await.unwrap();
        let busy = store.enqueue("jobs", NewMessage::new("busy"), now).await.unwrap();
        store
            .mark_in_flight(
                &busy.id,
                &ConsumerToken::new("worker"),
                now,
                now + Duration::seconds(600),
            )
            .await
            .unwrap();

        assert!(store.purge_expired(now).await.unwrap().is_empty(), "{}", label);

        let purged = store
            .purge_expired(now + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(purged.len(), 1, "{}", label);
        assert_eq!(purged[0].id, idle.id, "{}", label);
        assert!(store.get_message(&busy.id).await.is_ok(), "{}", label);

        let stats = store.stats("jobs").await.unwrap();
        assert_eq!(stats.available_messages, 0, "{}", label);
        assert_eq!(stats.in_flight_messages, 1, "{}", label);
    }
}
