//! Buckets of all jobs sharing one pool of workers.
//!
//! Lock order is: the job map, then at most one job, then the aliveness tracker.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bq_utils::net_protocol::bucket::{Bucket, PrioritizedJob, WorkerCapabilities};
use bq_utils::net_protocol::ids::{BucketId, JobId, RequestId, WorkerId};
use bq_utils::net_protocol::queue::{
    DequeueResponse, JobQueueState, JobState, QueueError, RunningQueueState,
};
use bq_utils::net_protocol::results::TestingResult;
use parking_lot::{Mutex, RwLock};
use serde_derive::{Deserialize, Serialize};
use tracing::instrument;

use crate::bucket_queue::{BucketQueue, StuckBucket};
use crate::worker_tracking::{WorkerAlivenessTracker, WorkerStatus};

/// What a worker is told when no bucket can be handed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NothingToDequeueBehavior {
    /// Always ask the worker to poll again.
    #[default]
    CheckLater,
    /// Ask the worker to poll again until every job is depleted, then tell it to stop.
    WaitForDepletion,
}

impl NothingToDequeueBehavior {
    pub fn respond(self, all_jobs_depleted: bool, check_again_interval: Duration) -> DequeueResponse {
        match self {
            Self::WaitForDepletion if all_jobs_depleted => DequeueResponse::QueueIsEmpty,
            Self::CheckLater | Self::WaitForDepletion => DequeueResponse::CheckAgainLater {
                after: check_again_interval,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BalancingSettings {
    pub nothing_to_dequeue: NothingToDequeueBehavior,
    pub check_again_interval: Duration,
    pub max_claim_age: Option<Duration>,
    pub deleted_job_retention: Duration,
    /// How long a depleted job that was never deleted stays around. Kept until deleted if unset.
    pub completed_job_retention: Option<Duration>,
}

impl Default for BalancingSettings {
    fn default() -> Self {
        Self {
            nothing_to_dequeue: NothingToDequeueBehavior::CheckLater,
            check_again_interval: Duration::from_secs(10),
            max_claim_age: None,
            deleted_job_retention: Duration::from_secs(5 * 60),
            completed_job_retention: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { bucket_count: usize },
    /// The schedule request was seen before; nothing was enqueued.
    Replayed,
}

struct Job {
    queue: BucketQueue,
    deleted_at: Option<Instant>,
    /// When a sweep first saw the job with no buckets left.
    depleted_since: Option<Instant>,
    schedule_requests: HashSet<RequestId>,
}

struct JobEntry {
    prioritized_job: PrioritizedJob,
    sequence: u64,
    job: Mutex<Job>,
}

impl JobEntry {
    fn dequeue_order(&self) -> (Reverse<u16>, Reverse<u16>, u64) {
        (
            Reverse(self.prioritized_job.job_group_priority.value()),
            Reverse(self.prioritized_job.job_priority.value()),
            self.sequence,
        )
    }
}

#[derive(Default)]
struct AllJobs {
    jobs: HashMap<JobId, JobEntry>,
    next_sequence: u64,
}

pub struct BalancingBucketQueue {
    jobs: RwLock<AllJobs>,
    aliveness: Arc<WorkerAlivenessTracker>,
    settings: BalancingSettings,
}

pub type SharedBalancingQueue = Arc<BalancingBucketQueue>;

impl BalancingBucketQueue {
    pub fn new(aliveness: Arc<WorkerAlivenessTracker>, settings: BalancingSettings) -> Self {
        Self {
            jobs: Default::default(),
            aliveness,
            settings,
        }
    }

    pub fn aliveness(&self) -> &Arc<WorkerAlivenessTracker> {
        &self.aliveness
    }

    pub fn settings(&self) -> &BalancingSettings {
        &self.settings
    }

    /// Adds buckets to a job, creating the job on first use. A repeated `request_id` for the same
    /// job is acknowledged without enqueueing anything.
    #[instrument(level = "trace", skip(self, buckets))]
    pub fn enqueue(
        &self,
        prioritized_job: &PrioritizedJob,
        request_id: &RequestId,
        buckets: Vec<Bucket>,
    ) -> Result<EnqueueOutcome, QueueError> {
        let job_id = &prioritized_job.job_id;
        let mut all = self.jobs.write();

        if !all.jobs.contains_key(job_id) {
            let sequence = all.next_sequence;
            all.next_sequence += 1;
            all.jobs.insert(
                job_id.clone(),
                JobEntry {
                    prioritized_job: prioritized_job.clone(),
                    sequence,
                    job: Mutex::new(Job {
                        queue: BucketQueue::new(job_id.clone()),
                        deleted_at: None,
                        depleted_since: None,
                        schedule_requests: Default::default(),
                    }),
                },
            );
            tracing::info!(?job_id, group_id=?prioritized_job.job_group_id, priority=prioritized_job.job_priority.value(), "new job");
        }

        let entry = all
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::Internal(format!("job {job_id} vanished while locked")))?;
        if entry.prioritized_job != *prioritized_job {
            tracing::debug!(?job_id, "keeping priorities of the existing job");
        }

        let mut job = entry.job.lock();
        if job.deleted_at.is_some() {
            return Err(QueueError::JobDeleted(job_id.clone()));
        }
        if !job.schedule_requests.insert(request_id.clone()) {
            tracing::info!(?job_id, ?request_id, "schedule request replayed");
            return Ok(EnqueueOutcome::Replayed);
        }

        let bucket_count = buckets.len();
        job.queue.enqueue(buckets);
        tracing::info!(?job_id, ?request_id, bucket_count, "buckets enqueued");

        Ok(EnqueueOutcome::Enqueued { bucket_count })
    }

    /// Hands the worker the first eligible bucket of the highest-priority job that has one.
    #[instrument(level = "trace", skip(self, capabilities))]
    pub fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        capabilities: &WorkerCapabilities,
    ) -> DequeueResponse {
        match self.aliveness.status(worker_id) {
            WorkerStatus::Alive => {}
            WorkerStatus::Blocked => return DequeueResponse::WorkerIsBlocked,
            WorkerStatus::NotRegistered | WorkerStatus::Silent => {
                return DequeueResponse::WorkerIsNotAlive
            }
        }
        self.aliveness.record_capabilities(worker_id, capabilities);

        let now = self.aliveness.now();
        let all = self.jobs.read();

        for entry in all.jobs.values() {
            let job = entry.job.lock();
            if job.deleted_at.is_some() {
                continue;
            }
            if let Some(bucket) = job.queue.replay(worker_id, request_id) {
                return DequeueResponse::Bucket(bucket.clone());
            }
        }

        let mut ordered: Vec<&JobEntry> = all.jobs.values().collect();
        ordered.sort_by_key(|entry| entry.dequeue_order());

        let eligible =
            |bucket: &Bucket| capabilities.satisfies(&bucket.settings().capability_requirements);

        for entry in ordered {
            let mut job = entry.job.lock();
            if job.deleted_at.is_some() || !job.queue.has_enqueued() {
                continue;
            }
            if let Some(bucket) =
                job.queue
                    .dequeue_bucket(worker_id, request_id, eligible, &self.aliveness, now)
            {
                return DequeueResponse::Bucket(bucket);
            }
        }

        let all_depleted = all.next_sequence > 0 && Self::ongoing_jobs(&all).next().is_none();
        drop(all);

        self.settings
            .nothing_to_dequeue
            .respond(all_depleted, self.settings.check_again_interval)
    }

    /// Records a bucket result against whichever job holds the claim.
    #[instrument(level = "trace", skip(self, testing_result))]
    pub fn accept(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        testing_result: TestingResult,
    ) -> Result<BucketId, QueueError> {
        let all = self.jobs.read();

        for entry in all.jobs.values() {
            let mut job = entry.job.lock();
            if job.deleted_at.is_some() || !job.queue.has_claim(worker_id, request_id) {
                continue;
            }

            let accepted =
                job.queue
                    .accept(worker_id, request_id, testing_result, &self.aliveness)?;
            if let Some(retry_id) = accepted.reenqueued {
                tracing::info!(job_id=?entry.prioritized_job.job_id, bucket_id=?accepted.bucket_id, ?retry_id, "failed tests re-enqueued");
            }
            return Ok(accepted.bucket_id);
        }

        tracing::warn!(?worker_id, ?request_id, bucket_id=?testing_result.bucket_id, "rejecting result without a matching claim");
        Err(QueueError::NoMatchingClaim {
            worker_id: worker_id.clone(),
            request_id: request_id.clone(),
        })
    }

    /// Reclaims buckets from workers that can no longer be trusted with them.
    pub fn reenqueue_stuck_buckets(&self) -> Vec<StuckBucket> {
        let now = self.aliveness.now();
        let all = self.jobs.read();

        let mut stuck = Vec::new();
        for entry in all.jobs.values() {
            let mut job = entry.job.lock();
            if job.deleted_at.is_some() {
                continue;
            }
            stuck.extend(job.queue.reenqueue_stuck_buckets(
                &self.aliveness,
                now,
                self.settings.max_claim_age,
            ));
        }

        for StuckBucket {
            job_id,
            bucket_id,
            worker_id,
            reason,
        } in &stuck
        {
            tracing::info!(?job_id, ?bucket_id, ?worker_id, ?reason, "re-enqueued stuck bucket");
        }

        stuck
    }

    /// Takes a job out of the dequeue rotation. Its results stay available until the retention
    /// period passes.
    #[instrument(level = "trace", skip(self))]
    pub fn delete_job(&self, job_id: &JobId) -> Result<JobId, QueueError> {
        let now = self.aliveness.now();
        let all = self.jobs.read();
        let entry = all
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;

        let mut job = entry.job.lock();
        if job.deleted_at.is_none() {
            job.deleted_at = Some(now);
            let abandoned = job.queue.abandon(&self.aliveness);
            tracing::info!(?job_id, abandoned, "job deleted");
        }
        Ok(job_id.clone())
    }

    /// Forgets deleted jobs, and depleted jobs if so configured, whose retention has passed.
    /// Returns how many were forgotten.
    pub fn purge_expired_jobs(&self) -> usize {
        let now = self.aliveness.now();
        let BalancingSettings {
            deleted_job_retention,
            completed_job_retention,
            ..
        } = self.settings;
        let mut all = self.jobs.write();

        let before = all.jobs.len();
        all.jobs.retain(|job_id, entry| {
            let job = entry.job.get_mut();
            let keep = match (job.deleted_at, completed_job_retention) {
                (Some(deleted_at), _) => {
                    now.saturating_duration_since(deleted_at) < deleted_job_retention
                }
                (None, Some(retention)) if job.queue.is_depleted() => {
                    let depleted_since = *job.depleted_since.get_or_insert(now);
                    now.saturating_duration_since(depleted_since) < retention
                }
                (None, _) => {
                    job.depleted_since = None;
                    true
                }
            };
            if !keep {
                tracing::debug!(?job_id, deleted = job.deleted_at.is_some(), "forgetting job");
            }
            keep
        });
        before - all.jobs.len()
    }

    pub fn job_state(&self, job_id: &JobId) -> Result<JobState, QueueError> {
        let all = self.jobs.read();
        let entry = all
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        let job = entry.job.lock();

        let state = match job.deleted_at {
            Some(_) => JobQueueState::Deleted,
            None => JobQueueState::Running(job.queue.running_queue_state()),
        };
        Ok(JobState {
            job_id: job_id.clone(),
            state,
        })
    }

    pub fn running_queue_state(&self, job_id: &JobId) -> Option<RunningQueueState> {
        match self.job_state(job_id) {
            Ok(JobState {
                state: JobQueueState::Running(state),
                ..
            }) => Some(state),
            _ => None,
        }
    }

    pub fn results(&self, job_id: &JobId) -> Result<Vec<TestingResult>, QueueError> {
        let all = self.jobs.read();
        let entry = all
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
        let job = entry.job.lock();
        Ok(job.queue.results().to_vec())
    }

    /// Jobs with any enqueued or dequeued bucket, in submission order.
    pub fn ongoing_job_ids(&self) -> Vec<JobId> {
        let all = self.jobs.read();
        let mut ongoing: Vec<_> = Self::ongoing_jobs(&all).collect();
        ongoing.sort_by_key(|entry| entry.sequence);
        ongoing
            .into_iter()
            .map(|entry| entry.prioritized_job.job_id.clone())
            .collect()
    }

    fn ongoing_jobs(all: &AllJobs) -> impl Iterator<Item = &JobEntry> {
        all.jobs.values().filter(|entry| {
            let job = entry.job.lock();
            job.deleted_at.is_none() && !job.queue.is_depleted()
        })
    }
}
