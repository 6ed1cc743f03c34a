//! Worker liveness: which workers are registered, which have been blocked, and which are still
//! heartbeating.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bq_utils::net_protocol::bucket::WorkerCapabilities;
use bq_utils::net_protocol::ids::{BucketId, WorkerId};
use bq_utils::net_protocol::queue::QueueError;
use bq_utils::time::SharedClock;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlivenessSettings {
    /// How often workers are told to heartbeat.
    pub report_alive_interval: Duration,
    /// Slack on top of the interval before a worker counts as silent, for heartbeats in flight.
    pub grace: Duration,
}

impl Default for AlivenessSettings {
    fn default() -> Self {
        Self {
            report_alive_interval: Duration::from_secs(30),
            grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    NotRegistered,
    Alive,
    Silent,
    Blocked,
}

#[derive(Debug)]
struct WorkerAliveness {
    registered: bool,
    blocked: bool,
    last_heartbeat: Instant,
    /// Set by `reportAlive` only; registration does not count as a report.
    last_report: Option<Instant>,
    buckets_being_processed: HashSet<BucketId>,
    /// As declared on the worker's latest dequeue.
    capabilities: WorkerCapabilities,
}

impl WorkerAliveness {
    fn new(now: Instant) -> Self {
        Self {
            registered: false,
            blocked: false,
            last_heartbeat: now,
            last_report: None,
            buckets_being_processed: Default::default(),
            capabilities: Default::default(),
        }
    }
}

/// Single source of truth for whether a worker may receive work.
///
/// The tracker's lock is a leaf: no other lock is taken while it is held.
pub struct WorkerAlivenessTracker {
    workers: RwLock<HashMap<WorkerId, WorkerAliveness>>,
    settings: AlivenessSettings,
    clock: SharedClock,
}

impl WorkerAlivenessTracker {
    pub fn new(settings: AlivenessSettings, clock: SharedClock) -> Self {
        Self {
            workers: Default::default(),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> AlivenessSettings {
        self.settings
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Registers a worker, or refreshes its heartbeat if it already is registered.
    /// A blocked worker stays blocked.
    pub fn register(&self, worker_id: &WorkerId) {
        let now = self.clock.now();
        let mut workers = self.workers.write();
        let worker = workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerAliveness::new(now));

        if !worker.registered {
            tracing::info!(?worker_id, blocked = worker.blocked, "worker registered");
        }
        worker.registered = true;
        worker.last_heartbeat = now;
    }

    /// Refreshes the heartbeat and replaces the set of buckets the worker is processing.
    /// Blocked workers are told so, and their heartbeat is not recorded.
    pub fn report_alive(
        &self,
        worker_id: &WorkerId,
        bucket_ids: impl IntoIterator<Item = BucketId>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut workers = self.workers.write();
        match workers.get_mut(worker_id) {
            Some(worker) if worker.registered && worker.blocked => {
                tracing::debug!(?worker_id, "heartbeat from blocked worker");
                Err(QueueError::WorkerBlocked(worker_id.clone()))
            }
            Some(worker) if worker.registered => {
                worker.last_heartbeat = now;
                worker.last_report = Some(now);
                worker.buckets_being_processed = bucket_ids.into_iter().collect();
                Ok(())
            }
            _ => {
                tracing::warn!(?worker_id, "heartbeat from unregistered worker");
                Err(QueueError::WorkerNotRegistered(worker_id.clone()))
            }
        }
    }

    pub fn record_capabilities(&self, worker_id: &WorkerId, capabilities: &WorkerCapabilities) {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            if &worker.capabilities != capabilities {
                tracing::debug!(?worker_id, ?capabilities, "worker capabilities changed");
                worker.capabilities = capabilities.clone();
            }
        }
    }

    pub fn did_dequeue(&self, worker_id: &WorkerId, bucket_id: BucketId) {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            worker.buckets_being_processed.insert(bucket_id);
        }
    }

    pub fn did_release(&self, worker_id: &WorkerId, bucket_id: BucketId) {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            worker.buckets_being_processed.remove(&bucket_id);
        }
    }

    fn is_fresh(&self, worker: &WorkerAliveness, now: Instant) -> bool {
        now.saturating_duration_since(worker.last_heartbeat)
            <= self.settings.report_alive_interval + self.settings.grace
    }

    /// Whether a registered worker has heartbeated recently enough. Ignores blocking.
    pub fn is_alive(&self, worker_id: &WorkerId, now: Instant) -> bool {
        self.workers
            .read()
            .get(worker_id)
            .map_or(false, |worker| worker.registered && self.is_fresh(worker, now))
    }

    pub fn status(&self, worker_id: &WorkerId) -> WorkerStatus {
        let now = self.clock.now();
        match self.workers.read().get(worker_id) {
            Some(worker) if worker.blocked => WorkerStatus::Blocked,
            Some(worker) if worker.registered => {
                if self.is_fresh(worker, now) {
                    WorkerStatus::Alive
                } else {
                    WorkerStatus::Silent
                }
            }
            _ => WorkerStatus::NotRegistered,
        }
    }

    pub fn is_blocked(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .read()
            .get(worker_id)
            .map_or(false, |worker| worker.blocked)
    }

    /// Marks a worker ineligible for work until it is unblocked. Workers unknown so far are
    /// remembered as blocked, so that a later registration does not clear the flag.
    pub fn block(&self, worker_id: &WorkerId) {
        let now = self.clock.now();
        let mut workers = self.workers.write();
        let worker = workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerAliveness::new(now));
        if !worker.blocked {
            tracing::info!(?worker_id, "worker blocked");
        }
        worker.blocked = true;
    }

    /// Returns whether the worker was blocked.
    pub fn unblock(&self, worker_id: &WorkerId) -> bool {
        match self.workers.write().get_mut(worker_id) {
            Some(worker) if worker.blocked => {
                worker.blocked = false;
                tracing::info!(?worker_id, "worker unblocked");
                true
            }
            _ => false,
        }
    }

    /// The worker is alive, has reported since `claimed_at` plus grace, and did not list
    /// `bucket_id` as being processed.
    pub fn has_lost_bucket(
        &self,
        worker_id: &WorkerId,
        bucket_id: BucketId,
        claimed_at: Instant,
    ) -> bool {
        let workers = self.workers.read();
        let worker = match workers.get(worker_id) {
            Some(worker) => worker,
            None => return false,
        };
        match worker.last_report {
            Some(last_report) => {
                last_report > claimed_at + self.settings.grace
                    && !worker.buckets_being_processed.contains(&bucket_id)
            }
            None => false,
        }
    }

    /// Registered, unblocked workers that are heartbeating.
    pub fn alive_workers(&self) -> Vec<WorkerId> {
        let now = self.clock.now();
        let mut alive: Vec<_> = self
            .workers
            .read()
            .iter()
            .filter(|(_, worker)| worker.registered && !worker.blocked && self.is_fresh(worker, now))
            .map(|(worker_id, _)| worker_id.clone())
            .collect();
        alive.sort();
        alive
    }

    /// Like [Self::alive_workers], with the capabilities each worker last declared.
    pub fn alive_workers_with_capabilities(&self) -> Vec<(WorkerId, WorkerCapabilities)> {
        let now = self.clock.now();
        let mut alive: Vec<_> = self
            .workers
            .read()
            .iter()
            .filter(|(_, worker)| worker.registered && !worker.blocked && self.is_fresh(worker, now))
            .map(|(worker_id, worker)| (worker_id.clone(), worker.capabilities.clone()))
            .collect();
        alive.sort_by(|(a, _), (b, _)| a.cmp(b));
        alive
    }

    pub fn has_any_alive_worker(&self) -> bool {
        let now = self.clock.now();
        self.workers
            .read()
            .values()
            .any(|worker| worker.registered && !worker.blocked && self.is_fresh(worker, now))
    }
}

#[cfg(test)]
mod test {
    use super::{AlivenessSettings, WorkerAlivenessTracker, WorkerStatus};
    use bq_utils::net_protocol::ids::{BucketId, WorkerId};
    use bq_utils::net_protocol::queue::QueueError;
    use bq_utils::time::ManualClock;
    use std::time::Duration;

    fn tracker() -> (WorkerAlivenessTracker, ManualClock) {
        let clock = ManualClock::default();
        let settings = AlivenessSettings {
            report_alive_interval: Duration::from_secs(30),
            grace: Duration::from_secs(10),
        };
        (WorkerAlivenessTracker::new(settings, clock.shared()), clock)
    }

    #[test]
    fn worker_goes_silent_after_interval_and_grace() {
        let (tracker, clock) = tracker();
        let worker = WorkerId::from("w1");
        tracker.register(&worker);
        assert_eq!(tracker.status(&worker), WorkerStatus::Alive);

        clock.advance(Duration::from_secs(40));
        assert!(tracker.is_alive(&worker, tracker.now()));

        clock.advance(Duration::from_secs(1));
        assert!(!tracker.is_alive(&worker, tracker.now()));
        assert_eq!(tracker.status(&worker), WorkerStatus::Silent);
        assert!(!tracker.has_any_alive_worker());

        tracker.report_alive(&worker, []).unwrap();
        assert_eq!(tracker.status(&worker), WorkerStatus::Alive);
    }

    #[test]
    fn heartbeat_from_unknown_worker_is_rejected() {
        let (tracker, _) = tracker();
        let worker = WorkerId::from("ghost");
        assert_eq!(
            tracker.report_alive(&worker, []),
            Err(QueueError::WorkerNotRegistered(worker.clone()))
        );
        assert_eq!(tracker.status(&worker), WorkerStatus::NotRegistered);
    }

    #[test]
    fn register_is_idempotent() {
        let (tracker, _) = tracker();
        let worker = WorkerId::from("w1");
        tracker.register(&worker);
        tracker.register(&worker);
        assert_eq!(tracker.alive_workers(), vec![worker]);
    }

    #[test]
    fn block_survives_reregistration() {
        let (tracker, _) = tracker();
        let worker = WorkerId::from("w1");
        tracker.register(&worker);
        tracker.block(&worker);
        tracker.register(&worker);
        assert_eq!(tracker.status(&worker), WorkerStatus::Blocked);
        assert!(tracker.alive_workers().is_empty());

        assert!(tracker.unblock(&worker));
        assert_eq!(tracker.status(&worker), WorkerStatus::Alive);
        assert!(!tracker.unblock(&worker));
    }

    #[test]
    fn blocked_worker_heartbeat_is_refused() {
        let (tracker, clock) = tracker();
        let worker = WorkerId::from("w1");
        tracker.register(&worker);
        tracker.block(&worker);

        clock.advance(Duration::from_secs(5));
        assert_eq!(
            tracker.report_alive(&worker, []),
            Err(QueueError::WorkerBlocked(worker.clone()))
        );

        tracker.unblock(&worker);
        assert_eq!(tracker.report_alive(&worker, []), Ok(()));
    }

    #[test]
    fn blocking_before_registration_sticks() {
        let (tracker, _) = tracker();
        let worker = WorkerId::from("w1");
        tracker.block(&worker);
        tracker.register(&worker);
        assert_eq!(tracker.status(&worker), WorkerStatus::Blocked);
    }

    #[test]
    fn lost_bucket_requires_a_report_after_grace() {
        let (tracker, clock) = tracker();
        let worker = WorkerId::from("w1");
        let bucket = BucketId::unique();
        tracker.register(&worker);
        let claimed_at = tracker.now();
        tracker.did_dequeue(&worker, bucket);

        // Heartbeat already in flight when the bucket was handed out.
        clock.advance(Duration::from_secs(5));
        tracker.report_alive(&worker, []).unwrap();
        assert!(!tracker.has_lost_bucket(&worker, bucket, claimed_at));

        clock.advance(Duration::from_secs(30));
        tracker.report_alive(&worker, [bucket]).unwrap();
        assert!(!tracker.has_lost_bucket(&worker, bucket, claimed_at));

        clock.advance(Duration::from_secs(30));
        tracker.report_alive(&worker, []).unwrap();
        assert!(tracker.has_lost_bucket(&worker, bucket, claimed_at));
    }
}
