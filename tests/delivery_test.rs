//! End-to-end delivery tests against the in-memory backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cloudq::core::clock::ManualClock;
use cloudq::core::events::{DropReason, QueueEvent};
use cloudq::core::registry::{QueueSpec, QueueUpdate};
use cloudq::service::{QueueService, ServiceOptions};
use cloudq::storage::memory::InMemoryBackend;
use cloudq::types::{ConsumerToken, MessageState, QueueType};
use cloudq::Error;
use tokio::sync::broadcast;

fn create_service() -> (Arc<QueueService>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let service = QueueService::with_options(
        Arc::new(InMemoryBackend::new()),
        clock.clone(),
        ServiceOptions::default(),
    );
    (Arc::new(service), clock)
}

fn drain(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Leasing
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_lease_under_concurrent_receive() {
    let (service, _) = create_service();
    service.create_queue("jobs", 30, 5, None).await.unwrap();
    for i in 0..100 {
        service.enqueue("jobs", format!("job-{}", i)).await.unwrap();
    }

    let mut workers = Vec::new();
    for w in 0..8 {
        let service = service.clone();
        workers.push(tokio::spawn(async move {
            let token = ConsumerToken::new(format!("worker-{}", w));
            let mut seen = Vec::new();
            loop {
                let batch = service.receive("jobs", &token, 10).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                seen.extend(batch.into_iter().map(|m| m.id));
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);

    let stats = service.stats("jobs").await.unwrap();
    assert_eq!(stats.available_messages, 0);
    assert_eq!(stats.in_flight_messages, 100);
}

#[tokio::test]
async fn test_batch_is_clamped() {
    let (service, _) = create_service();
    service.create_queue("jobs", 30, 5, None).await.unwrap();
    for i in 0..15 {
        service.enqueue("jobs", format!("job-{}", i)).await.unwrap();
    }

    let token = ConsumerToken::new("worker");
    assert_eq!(service.receive("jobs", &token, 0).await.unwrap().len(), 1);
    assert_eq!(service.receive("jobs", &token, 50).await.unwrap().len(), 10);
    assert_eq!(service.receive("jobs", &token, 10).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_stale_holder_cannot_ack_after_reassignment() {
    let (service, clock) = create_service();
    service.create_queue("jobs", 30, 5, None).await.unwrap();
    let id = service.enqueue("jobs", "payload").await.unwrap();

    let first = ConsumerToken::new("first");
    let second = ConsumerToken::new("second");

    service.receive("jobs", &first, 1).await.unwrap();
    clock.advance_secs(31);

    let redelivered = service.receive("jobs", &second, 1).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].id, id);
    assert_eq!(redelivered[0].receive_count, 1);

    let err = service.ack(&id, &first).await.unwrap_err();
    assert!(matches!(err, Error::TokenMismatch(_)));

    service.ack(&id, &second).await.unwrap();
}

#[tokio::test]
async fn test_ack_is_idempotent() {
    let (service, _) = create_service();
    service.create_queue("jobs", 30, 5, None).await.unwrap();
    let id = service.enqueue("jobs", "payload").await.unwrap();

    let token = ConsumerToken::new("worker");
    service.receive("jobs", &token, 1).await.unwrap();

    service.ack(&id, &token).await.unwrap();
    let err = service.ack(&id, &token).await.unwrap_err();
    assert!(matches!(err, Error::MessageNotFound(_)));
    assert_eq!(service.pending_expiries(), 0);
}

#[tokio::test]
async fn test_ack_after_expiry_is_rejected() {
    let (service, clock) = create_service();
    service.create_queue("jobs", 5, 5, None).await.unwrap();
    let id = service.enqueue("jobs", "payload").await.unwrap();

    let token = ConsumerToken::new("worker");
    service.receive("jobs", &token, 1).await.unwrap();

    clock.advance_secs(6);
    service.run_expiry_sweep().await;

    let err = service.ack(&id, &token).await.unwrap_err();
    assert!(matches!(err, Error::TokenMismatch(_)));
    assert_eq!(
        service.get_message(&id).await.unwrap().state,
        MessageState::Available
    );
}

// ============================================================================
// Receive counts and leases
// ============================================================================

#[tokio::test]
async fn test_receive_count_only_grows_on_expiry() {
    let (service, clock) = create_service();
    service.create_queue("jobs", 10, 10, None).await.unwrap();
    let id = service.enqueue("jobs", "payload").await.unwrap();
    let token = ConsumerToken::new("worker");

    service.receive("jobs", &token, 1).await.unwrap();
    service
        .extend_lease(&id, &token, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(service.get_message(&id).await.unwrap().receive_count, 0);

    service.release(&id, &token).await.unwrap();
    assert_eq!(service.get_message(&id).await.unwrap().receive_count, 0);

    for expected in 1..=3 {
        let leased = service.receive("jobs", &token, 1).await.unwrap();
        assert_eq!(leased.len(), 1);
        clock.advance_secs(11);
        service.run_expiry_sweep().await;
        assert_eq!(service.get_message(&id).await.unwrap().receive_count, expected);
    }
}

#[tokio::test]
async fn test_extend_lease_pushes_deadline() {
    let (service, clock) = create_service();
    service.create_queue("jobs", 10, 5, None).await.unwrap();
    let id = service.enqueue("jobs", "payload").await.unwrap();
    let token = ConsumerToken::new("worker");

    let leased = service.receive("jobs", &token, 1).await.unwrap();
    let original = leased[0].visibility_deadline.unwrap();

    clock.advance_secs(8);
    let extended = service
        .extend_lease(&id, &token, Duration::from_secs(20))
        .await
        .unwrap();
    assert_eq!(
        extended.visibility_deadline.unwrap(),
        original + chrono::Duration::seconds(20)
    );

    // Past the original deadline, still leased
    clock.advance_secs(5);
    service.run_expiry_sweep().await;
    assert!(service.get_message(&id).await.unwrap().is_leased_to(&token));

    clock.advance_secs(20);
    service.run_expiry_sweep().await;
    assert_eq!(
        service.get_message(&id).await.unwrap().state,
        MessageState::Available
    );
}

#[tokio::test]
async fn test_extend_lease_validates_input() {
    let (service, _) = create_service();
    service.create_queue("jobs", 10, 5, None).await.unwrap();
    let id = service.enqueue("jobs", "payload").await.unwrap();
    let token = ConsumerToken::new("worker");
    service.receive("jobs", &token, 1).await.unwrap();

    let zero = service.extend_lease(&id, &token, Duration::ZERO).await;
    assert!(matches!(zero, Err(Error::Validation(_))));

    let other = ConsumerToken::new("other");
    let stolen = service
        .extend_lease(&id, &other, Duration::from_secs(5))
        .await;
    assert!(matches!(stolen, Err(Error::TokenMismatch(_))));
}

#[tokio::test]
async fn test_release_makes_message_available_immediately() {
    let (service, _) = create_service();
    service.create_queue("jobs", 30, 5, None).await.unwrap();
    let id = service.enqueue("jobs", "payload").await.unwrap();

    let first = ConsumerToken::new("first");
    service.receive("jobs", &first, 1).await.unwrap();
    service.release(&id, &first).await.unwrap();

    let second = ConsumerToken::new("second");
    let leased = service.receive("jobs", &second, 1).await.unwrap();
    assert_eq!(leased[0].id, id);
    assert_eq!(leased[0].receive_count, 0);
}

// ============================================================================
// Dead letters
// ============================================================================

#[tokio::test]
async fn test_orders_without_dlq_drops_after_three_expiries() {
    let (service, clock) = create_service();
    service.create_queue("orders", 5, 3, None).await.unwrap();
    let id = service.enqueue("orders", "order-1").await.unwrap();
    let mut rx = service.subscribe();

    let token = ConsumerToken::new("worker");
    for _ in 0..3 {
        let leased = service.receive("orders", &token, 1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, id);
        clock.advance_secs(6);
    }

    assert!(service.receive("orders", &token, 1).await.unwrap().is_empty());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        QueueEvent::Dropped {
            reason: DropReason::NoDeadLetterQueue,
            ..
        }
    )));
    let expired = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::Expired { .. }))
        .count();
    assert_eq!(expired, 2);

    assert!(matches!(
        service.get_message(&id).await,
        Err(Error::MessageNotFound(_))
    ));
}

#[tokio::test]
async fn test_orders_with_dlq_moves_after_two_expiries() {
    let (service, clock) = create_service();
    service.create_queue("orders-dlq", 30, 5, None).await.unwrap();
    service
        .create_queue("orders", 5, 2, Some("orders-dlq"))
        .await
        .unwrap();
    let id = service.enqueue("orders", "order-1").await.unwrap();
    let mut rx = service.subscribe();

    let token = ConsumerToken::new("worker");
    for _ in 0..2 {
        assert_eq!(service.receive("orders", &token, 1).await.unwrap().len(), 1);
        clock.advance_secs(6);
        service.run_expiry_sweep().await;
    }

    let dead = service.peek_dlq("orders-dlq", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure.final_receive_count, 2);
    assert_eq!(dead[0].failure.original_queue, "orders");
    assert_eq!(dead[0].message.body, b"order-1".to_vec());

    // Peeking does not lease
    assert_eq!(service.peek_dlq("orders-dlq", 10).await.unwrap().len(), 1);

    assert!(matches!(
        service.get_message(&id).await,
        Err(Error::MessageNotFound(_))
    ));
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        QueueEvent::DeadLettered { dead_letter_queue, receive_count: 2, .. }
            if dead_letter_queue == "orders-dlq"
    )));
}

#[tokio::test]
async fn test_peek_dlq_skips_plain_messages_before_limit() {
    let (service, clock) = create_service();
    service.create_queue("orders-dlq", 30, 5, None).await.unwrap();
    service
        .create_queue("orders", 5, 1, Some("orders-dlq"))
        .await
        .unwrap();
    service.enqueue("orders-dlq", "direct-1").await.unwrap();
    service.enqueue("orders-dlq", "direct-2").await.unwrap();
    service.enqueue("orders", "order-1").await.unwrap();
    service.enqueue("orders", "order-2").await.unwrap();

    let token = ConsumerToken::new("worker");
    assert_eq!(service.receive("orders", &token, 2).await.unwrap().len(), 2);
    clock.advance_secs(6);
    service.run_expiry_sweep().await;

    let first = service.peek_dlq("orders-dlq", 1).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].failure.original_queue, "orders");

    let all = service.peek_dlq("orders-dlq", 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(service.stats("orders-dlq").await.unwrap().total(), 4);
}

#[tokio::test]
async fn test_full_dlq_drops_message() {
    let (service, clock) = create_service();
    service
        .create_queue_with(QueueSpec::new("tiny-dlq").max_messages(1))
        .await
        .unwrap();
    service
        .create_queue("orders", 5, 1, Some("tiny-dlq"))
        .await
        .unwrap();
    service.enqueue("tiny-dlq", "occupant").await.unwrap();
    service.enqueue("orders", "order-1").await.unwrap();
    let mut rx = service.subscribe();

    let token = ConsumerToken::new("worker");
    service.receive("orders", &token, 1).await.unwrap();
    clock.advance_secs(6);
    service.run_expiry_sweep().await;

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        QueueEvent::Dropped {
            reason: DropReason::DeadLetterQueueUnavailable,
            ..
        }
    )));
    assert_eq!(service.stats("orders").await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_redrive_returns_dead_letters_to_origin() {
    let (service, clock) = create_service();
    service.create_queue("orders-dlq", 30, 5, None).await.unwrap();
    service
        .create_queue("orders", 5, 1, Some("orders-dlq"))
        .await
        .unwrap();
    service.enqueue("orders", "order-1").await.unwrap();

    let token = ConsumerToken::new("worker");
    service.receive("orders", &token, 1).await.unwrap();
    clock.advance_secs(6);
    service.run_expiry_sweep().await;
    assert_eq!(service.peek_dlq("orders-dlq", 10).await.unwrap().len(), 1);

    let report = service.redrive("orders-dlq", 10).await.unwrap();
    assert_eq!(report.moved, 1);
    assert_eq!(report.skipped, 0);

    assert!(service.peek_dlq("orders-dlq", 10).await.unwrap().is_empty());
    let leased = service.receive("orders", &token, 1).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].body, b"order-1".to_vec());
    assert_eq!(leased[0].receive_count, 0);
}

#[tokio::test]
async fn test_redrive_skips_when_origin_deleted() {
    let (service, clock) = create_service();
    service.create_queue("orders-dlq", 30, 5, None).await.unwrap();
    service
        .create_queue("orders", 5, 1, Some("orders-dlq"))
        .await
        .unwrap();
    service.enqueue("orders", "order-1").await.unwrap();

    let token = ConsumerToken::new("worker");
    service.receive("orders", &token, 1).await.unwrap();
    clock.advance_secs(6);
    service.run_expiry_sweep().await;

    service.delete_queue("orders", false).await.unwrap();

    let report = service.redrive("orders-dlq", 10).await.unwrap();
    assert_eq!(report.moved, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(service.peek_dlq("orders-dlq", 10).await.unwrap().len(), 1);
}

// ============================================================================
// Queue management
// ============================================================================

#[tokio::test]
async fn test_fifo_queue_delivers_in_order() {
    let (service, _) = create_service();
    service
        .create_queue_with(QueueSpec::new("ledger").fifo())
        .await
        .unwrap();
    assert_eq!(
        service.get_queue("ledger").await.unwrap().queue_type,
        QueueType::Fifo
    );

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(service.enqueue("ledger", format!("entry-{}", i)).await.unwrap());
    }

    let token = ConsumerToken::new("worker");
    let first = service.receive("ledger", &token, 1).await.unwrap();
    assert_eq!(first[0].id, ids[0]);

    // Nothing behind an in-flight head is delivered
    let other = ConsumerToken::new("other");
    assert!(service.receive("ledger", &other, 10).await.unwrap().is_empty());

    service.ack(&ids[0], &token).await.unwrap();
    let rest = service.receive("ledger", &other, 10).await.unwrap();
    let rest_ids: Vec<_> = rest.into_iter().map(|m| m.id).collect();
    assert_eq!(rest_ids, ids[1..].to_vec());
}

#[tokio::test]
async fn test_capacity_and_size_limits() {
    let (service, _) = create_service();
    service
        .create_queue_with(QueueSpec::new("small").max_messages(2).max_message_size(8))
        .await
        .unwrap();

    service.enqueue("small", "a").await.unwrap();
    service.enqueue("small", "b").await.unwrap();
    assert!(matches!(
        service.enqueue("small", "c").await,
        Err(Error::CapacityExceeded { limit: 2, .. })
    ));

    service
        .update_config(
            "small",
            QueueUpdate {
                max_messages: Some(10),
                ..QueueUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        service.enqueue("small", "way too large").await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_delete_queue_rules() {
    let (service, _) = create_service();
    service.create_queue("jobs-dlq", 30, 5, None).await.unwrap();
    service
        .create_queue("jobs", 30, 5, Some("jobs-dlq"))
        .await
        .unwrap();
    service.enqueue("jobs", "payload").await.unwrap();

    assert!(matches!(
        service.delete_queue("jobs-dlq", true).await,
        Err(Error::DeadLetterQueueInUse { .. })
    ));
    assert!(matches!(
        service.delete_queue("jobs", false).await,
        Err(Error::QueueNotEmpty { messages: 1, .. })
    ));

    assert_eq!(service.delete_queue("jobs", true).await.unwrap(), 1);
    assert_eq!(service.delete_queue("jobs-dlq", false).await.unwrap(), 0);
    assert!(matches!(
        service.enqueue("jobs", "late").await,
        Err(Error::QueueNotFound(_))
    ));
}

#[tokio::test]
async fn test_retention_purges_available_messages_only() {
    let (service, clock) = create_service();
    service
        .create_queue_with(QueueSpec::new("jobs").retention(60))
        .await
        .unwrap();
    service.enqueue("jobs", "first").await.unwrap();
    service.enqueue("jobs", "second").await.unwrap();

    let token = ConsumerToken::new("worker");
    let leased = service.receive("jobs", &token, 1).await.unwrap();
    let leased_id = leased[0].id.clone();
    service
        .extend_lease(&leased_id, &token, Duration::from_secs(120))
        .await
        .unwrap();

    clock.advance_secs(61);
    assert_eq!(service.purge_expired().await.unwrap(), 1);

    // The leased one survives retention
    assert!(service.get_message(&leased_id).await.is_ok());
    assert_eq!(service.stats("jobs").await.unwrap().total(), 1);
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let (service, clock) = create_service();
    service.create_queue("jobs", 5, 5, None).await.unwrap();
    let mut rx = service.subscribe();

    let id = service.enqueue("jobs", "payload").await.unwrap();
    let token = ConsumerToken::new("worker");
    service.receive("jobs", &token, 1).await.unwrap();
    clock.advance_secs(6);
    service.run_expiry_sweep().await;
    service.receive("jobs", &token, 1).await.unwrap();
    service.ack(&id, &token).await.unwrap();

    let kinds: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec!["enqueued", "delivered", "expired", "delivered", "acked"]
    );
}
