//! Visibility timeout scheduler.
//!
//! Tracks one expiry entry per in-flight message in a min-heap ordered by
//! deadline. A side map holds the authoritative deadline for each message;
//! heap entries that no longer match it (cancelled or superseded by an
//! extension) are skipped when they reach the top. The timer lock is never
//! held across a store call.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::core::clock::Clock;
use crate::core::dlq::DeadLetterRouter;
use crate::core::events::{EventBus, QueueEvent};
use crate::metrics::get_metrics;
use crate::storage::{ExpiryOutcome, MessageStore};
use crate::types::{Message, MessageId};
use crate::Result;

/// Default sweep interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Stale heap entries tolerated before the heap is rebuilt from the deadline map.
const COMPACTION_SLACK: usize = 1024;

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, MessageId)>>,
    deadlines: HashMap<MessageId, DateTime<Utc>>,
}

impl Timers {
    fn compact_if_needed(&mut self) {
        if self.heap.len() > self.deadlines.len() * 2 + COMPACTION_SLACK {
            self.heap = self
                .deadlines
                .iter()
                .map(|(id, deadline)| Reverse((*deadline, id.clone())))
                .collect();
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Leases expired back to AVAILABLE.
    pub requeued: usize,
    /// Exhausted messages handed to the dead-letter router.
    pub dead_lettered: usize,
    /// Entries re-armed at a later deadline.
    pub rescheduled: usize,
    /// Entries whose lease was already resolved.
    pub stale: usize,
    /// Store or routing failures, retried on the next sweep.
    pub errors: usize,
}

/// Recovery summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// In-flight leases re-armed from storage.
    pub leases: usize,
    /// Messages found DEAD_LETTERED and routed.
    pub dead_letters_routed: usize,
}

/// Drives lease expiry for every in-flight message.
pub struct VisibilityScheduler {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    router: Arc<DeadLetterRouter>,
    events: Arc<EventBus>,
    timers: Mutex<Timers>,
    /// Exhausted messages whose routing failed.
    unrouted: Mutex<Vec<Message>>,
    check_interval: Duration,
}

impl VisibilityScheduler {
    /// Create a scheduler with the default check interval.
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        router: Arc<DeadLetterRouter>,
        events: Arc<EventBus>,
    ) -> Self {
        Self::with_interval(store, clock, router, events, DEFAULT_CHECK_INTERVAL)
    }

    /// Create a scheduler with a custom check interval.
    pub fn with_interval(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        router: Arc<DeadLetterRouter>,
        events: Arc<EventBus>,
        check_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            router,
            events,
            timers: Mutex::new(Timers::default()),
            unrouted: Mutex::new(Vec::new()),
            check_interval,
        }
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm (or re-arm) the expiry of `id` at `deadline`, replacing any earlier entry.
    pub fn schedule(&self, id: MessageId, deadline: DateTime<Utc>) {
        let mut timers = self.timers();
        timers.deadlines.insert(id.clone(), deadline);
        timers.heap.push(Reverse((deadline, id)));
        timers.compact_if_needed();
        get_metrics().pending_expiries.set(timers.deadlines.len() as i64);
    }

    /// Forget the pending expiry of `id`.
    pub fn cancel(&self, id: &MessageId) {
        let mut timers = self.timers();
        timers.deadlines.remove(id);
        timers.compact_if_needed();
        get_metrics().pending_expiries.set(timers.deadlines.len() as i64);
    }

    /// Number of armed expiries.
    pub fn pending_count(&self) -> usize {
        self.timers().deadlines.len()
    }

    /// Deadline of `id`'s armed expiry, if any.
    pub fn deadline_of(&self, id: &MessageId) -> Option<DateTime<Utc>> {
        self.timers().deadlines.get(id).copied()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let mut timers = self.timers();
        while let Some(Reverse((deadline, id))) = timers.heap.peek() {
            if timers.deadlines.get(id) == Some(deadline) {
                return Some(*deadline);
            }
            timers.heap.pop();
        }
        None
    }

    /// Pop every live entry due at `now`. Each popped entry leaves the map, so
    /// concurrent sweeps never process the same expiry twice.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<(MessageId, DateTime<Utc>)> {
        let mut timers = self.timers();
        let mut due = Vec::new();

        while let Some(Reverse((deadline, _))) = timers.heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, id))) = timers.heap.pop() else {
                break;
            };
            if timers.deadlines.get(&id) == Some(&deadline) {
                timers.deadlines.remove(&id);
                due.push((id, deadline));
            }
        }

        get_metrics().pending_expiries.set(timers.deadlines.len() as i64);
        due
    }

    /// Expire every lease whose deadline has passed.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let retry: Vec<Message> = std::mem::take(
            &mut *self
                .unrouted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for message in retry {
            self.hand_to_router(message, now, &mut report).await;
        }

        for (id, deadline) in self.take_due(now) {
            match self.store.expire_lease(&id, deadline, now).await {
                Ok(ExpiryOutcome::Requeued(message)) => {
                    report.requeued += 1;
                    self.events.publish(QueueEvent::Expired {
                        queue: message.queue,
                        message_id: message.id,
                        receive_count: message.receive_count,
                    });
                }
                Ok(ExpiryOutcome::Exhausted(message)) => {
                    self.hand_to_router(message, now, &mut report).await;
                }
                Ok(ExpiryOutcome::Rescheduled(later)) => {
                    report.rescheduled += 1;
                    self.schedule(id, later);
                }
                Ok(ExpiryOutcome::Stale) => report.stale += 1,
                Err(e) => {
                    error!(message_id = %id, error = %e, "Failed to expire lease");
                    get_metrics()
                        .backend_errors_total
                        .with_label_values(&["expire_lease"])
                        .inc();
                    report.errors += 1;
                    self.schedule(id, deadline);
                }
            }
        }

        if report != SweepReport::default() {
            debug!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                rescheduled = report.rescheduled,
                stale = report.stale,
                errors = report.errors,
                "Visibility sweep completed"
            );
        }

        report
    }

    async fn hand_to_router(&self, message: Message, now: DateTime<Utc>, report: &mut SweepReport) {
        match self.router.route(message.clone(), now).await {
            Ok(_) => report.dead_lettered += 1,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to route dead letter");
                report.errors += 1;
                self.unrouted
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(message);
            }
        }
    }

    /// Rebuild timers from stored leases and route leftover dead letters.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let leases = self.store.in_flight_leases().await?;
        let lease_count = leases.len();
        for (id, deadline) in leases {
            self.schedule(id, deadline);
        }

        let dead_letters_routed = self.router.route_stranded(self.clock.now()).await?;

        info!(
            leases = lease_count,
            dead_letters_routed, "Visibility scheduler recovered"
        );

        Ok(RecoveryReport {
            leases: lease_count,
            dead_letters_routed,
        })
    }

    /// Run the sweep loop until shutdown.
    pub async fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.check_interval.as_millis() as u64,
            "Starting visibility scheduler"
        );

        let mut interval = time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    info!("Visibility scheduler shutting down");
                    break;
                }
            }
        }
    }
}
