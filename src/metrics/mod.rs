//! Metrics and monitoring using Prometheus.
//!
//! This module provides Prometheus-compatible metrics for monitoring cloudq.
//! Metrics are exposed on the `/metrics` endpoint and include:
//!
//! - **Counters**: one per delivery event (enqueued, delivered, acked, expired,
//!   dead-lettered, dropped), lease conflicts, backend errors, API requests
//! - **Histograms**: receive and API latency
//! - **Gauges**: queue depth, in-flight messages, pending expiry timers, queue count

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::error;

/// Global metrics registry
static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Global metrics instance
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    let metrics = Metrics::new();
    if let Err(e) = metrics.register(&METRICS_REGISTRY) {
        error!("Failed to register metrics: {}", e);
    }
    Arc::new(metrics)
});

const LATENCY_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Metrics collector for cloudq
pub struct Metrics {
    /// Messages accepted by enqueue
    pub messages_enqueued_total: IntCounterVec,
    /// Leases handed to consumers
    pub messages_delivered_total: IntCounterVec,
    /// Messages acknowledged and deleted
    pub messages_acked_total: IntCounterVec,
    /// Leases that expired without an ack
    pub messages_expired_total: IntCounterVec,
    /// Messages copied into a dead-letter queue
    pub messages_dead_lettered_total: IntCounterVec,
    /// Messages removed without delivery, by reason
    pub messages_dropped_total: IntCounterVec,
    /// Candidates lost to a concurrent receiver
    pub lease_conflicts_total: IntCounterVec,
    /// Backend errors encountered
    pub backend_errors_total: IntCounterVec,
    /// API requests received
    pub api_requests_total: IntCounterVec,

    /// Receive latency in seconds
    pub receive_latency_seconds: HistogramVec,
    /// API request latency in seconds
    pub api_latency_seconds: HistogramVec,

    /// Available messages per queue
    pub queue_depth: IntGaugeVec,
    /// In-flight messages per queue
    pub in_flight_messages: IntGaugeVec,
    /// Expiry timers held by the visibility scheduler
    pub pending_expiries: IntGauge,
    /// Number of queues
    pub queue_count: IntGauge,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        let event_counter = |name: &str, help: &str| {
            IntCounterVec::new(Opts::new(name, help), &["queue"])
                .unwrap_or_else(|e| panic!("Failed to create {} metric: {}", name, e))
        };

        let messages_enqueued_total = event_counter(
            "cloudq_messages_enqueued_total",
            "Total messages enqueued",
        );
        let messages_delivered_total = event_counter(
            "cloudq_messages_delivered_total",
            "Total message leases handed to consumers",
        );
        let messages_acked_total = event_counter(
            "cloudq_messages_acked_total",
            "Total messages acknowledged",
        );
        let messages_expired_total = event_counter(
            "cloudq_messages_expired_total",
            "Total leases that expired without an ack",
        );
        let messages_dead_lettered_total = event_counter(
            "cloudq_messages_dead_lettered_total",
            "Total messages moved to a dead-letter queue",
        );
        let lease_conflicts_total = event_counter(
            "cloudq_lease_conflicts_total",
            "Total receive candidates lost to a concurrent consumer",
        );

        let messages_dropped_total = IntCounterVec::new(
            Opts::new(
                "cloudq_messages_dropped_total",
                "Total messages removed without delivery",
            ),
            &["queue", "reason"],
        )
        .expect("Failed to create messages_dropped_total metric");

        let backend_errors_total = IntCounterVec::new(
            Opts::new("cloudq_backend_errors_total", "Total backend errors"),
            &["operation"],
        )
        .expect("Failed to create backend_errors_total metric");

        let api_requests_total = IntCounterVec::new(
            Opts::new("cloudq_api_requests_total", "Total API requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create api_requests_total metric");

        let receive_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cloudq_receive_latency_seconds",
                "Receive latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["queue"],
        )
        .expect("Failed to create receive_latency_seconds metric");

        let api_latency_seconds = HistogramVec::new(
            HistogramOpts::new("cloudq_api_latency_seconds", "API request latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["endpoint"],
        )
        .expect("Failed to create api_latency_seconds metric");

        let queue_depth = IntGaugeVec::new(
            Opts::new("cloudq_queue_depth", "Current number of available messages in queue"),
            &["queue"],
        )
        .expect("Failed to create queue_depth metric");

        let in_flight_messages = IntGaugeVec::new(
            Opts::new(
                "cloudq_in_flight_messages",
                "Current number of in-flight messages",
            ),
            &["queue"],
        )
        .expect("Failed to create in_flight_messages metric");

        let pending_expiries = IntGauge::new(
            "cloudq_pending_expiries",
            "Lease expiry timers held by the visibility scheduler",
        )
        .expect("Failed to create pending_expiries metric");

        let queue_count = IntGauge::new("cloudq_queue_count", "Total number of queues")
            .expect("Failed to create queue_count metric");

        Self {
            messages_enqueued_total,
            messages_delivered_total,
            messages_acked_total,
            messages_expired_total,
            messages_dead_lettered_total,
            messages_dropped_total,
            lease_conflicts_total,
            backend_errors_total,
            api_requests_total,
            receive_latency_seconds,
            api_latency_seconds,
            queue_depth,
            in_flight_messages,
            pending_expiries,
            queue_count,
        }
    }

    /// Register all metrics with the registry
    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.messages_enqueued_total.clone()))?;
        registry.register(Box::new(self.messages_delivered_total.clone()))?;
        registry.register(Box::new(self.messages_acked_total.clone()))?;
        registry.register(Box::new(self.messages_expired_total.clone()))?;
        registry.register(Box::new(self.messages_dead_lettered_total.clone()))?;
        registry.register(Box::new(self.messages_dropped_total.clone()))?;
        registry.register(Box::new(self.lease_conflicts_total.clone()))?;
        registry.register(Box::new(self.backend_errors_total.clone()))?;
        registry.register(Box::new(self.api_requests_total.clone()))?;
        registry.register(Box::new(self.receive_latency_seconds.clone()))?;
        registry.register(Box::new(self.api_latency_seconds.clone()))?;
        registry.register(Box::new(self.queue_depth.clone()))?;
        registry.register(Box::new(self.in_flight_messages.clone()))?;
        registry.register(Box::new(self.pending_expiries.clone()))?;
        registry.register(Box::new(self.queue_count.clone()))?;
        Ok(())
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = METRICS_REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics instance
pub fn get_metrics() -> Arc<Metrics> {
    METRICS.clone()
}
