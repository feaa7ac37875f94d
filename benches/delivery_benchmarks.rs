use cloudq::core::clock::ManualClock;
use cloudq::service::{QueueService, ServiceOptions};
use cloudq::storage::memory::{InMemoryBackend, InMemoryConfig};
use cloudq::types::ConsumerToken;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn create_service() -> (Arc<QueueService>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryBackend::with_config(InMemoryConfig {
        max_messages: usize::MAX,
    }));
    let service = QueueService::with_options(store, clock.clone(), ServiceOptions::default());
    (Arc::new(service), clock)
}

/// Receive and ack a batch through the service
fn bench_receive_ack(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("receive_ack");

    for batch in [1usize, 10].iter() {
        let (service, _) = create_service();
        rt.block_on(service.create_queue("bench", 30, 5, None)).unwrap();
        let token = ConsumerToken::new("bench");

        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            b.to_async(&rt).iter(|| async {
                for _ in 0..batch {
                    service.enqueue("bench", "payload").await.unwrap();
                }
                let leased = service.receive("bench", &token, batch).await.unwrap();
                for message in leased {
                    service.ack(&message.id, &token).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Sweep cost when many leases are pending but none are due
fn bench_idle_sweep(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("idle_sweep");

    for pending in [100, 10000].iter() {
        let (service, _) = create_service();
        rt.block_on(async {
            service.create_queue("bench", 3600, 5, None).await.unwrap();
            let token = ConsumerToken::new("bench");
            for _ in 0..*pending {
                service.enqueue("bench", "payload").await.unwrap();
            }
            while !service.receive("bench", &token, 10).await.unwrap().is_empty() {}
        });

        group.bench_with_input(BenchmarkId::from_parameter(pending), pending, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(service.run_expiry_sweep().await);
            });
        });
    }
    group.finish();
}

/// Expire a full round of leases and hand them out again
fn bench_expiry_round(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("expiry_round");
    group.sample_size(20);

    let leases = 1000;
    let (service, clock) = create_service();
    let token = ConsumerToken::new("bench");
    rt.block_on(async {
        service.create_queue("bench", 1, 1_000_000, None).await.unwrap();
        for _ in 0..leases {
            service.enqueue("bench", "payload").await.unwrap();
        }
    });

    group.throughput(Throughput::Elements(leases as u64));
    group.bench_function("1000_leases", |b| {
        b.to_async(&rt).iter(|| async {
            while !service.receive("bench", &token, 10).await.unwrap().is_empty() {}
            clock.advance_secs(2);
            black_box(service.run_expiry_sweep().await);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_receive_ack, bench_idle_sweep, bench_expiry_round);
criterion_main!(benches);
