//! Lifecycle of the buckets of a single job.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bq_utils::log_assert;
use bq_utils::net_protocol::bucket::{Bucket, RetryMode, TestEntry, WorkerCapabilities};
use bq_utils::net_protocol::ids::{BucketId, JobId, RequestId, WorkerId};
use bq_utils::net_protocol::queue::{QueueError, RunningQueueState};
use bq_utils::net_protocol::results::{TestEntryResult, TestingResult};
use tracing::instrument;

use crate::test_history::TestHistoryTracker;
use crate::worker_tracking::WorkerAlivenessTracker;

/// A bucket currently claimed by a worker.
#[derive(Debug, Clone)]
pub struct DequeuedBucket {
    pub bucket: Bucket,
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub claimed_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    WorkerIsSilent,
    WorkerIsBlocked,
    /// The worker heartbeated after the claim without listing the bucket.
    BucketLost,
    ClaimTimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckBucket {
    pub job_id: JobId,
    pub bucket_id: BucketId,
    pub worker_id: WorkerId,
    pub reason: StuckReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedBucket {
    pub bucket_id: BucketId,
    /// Bucket of failed tests queued for another attempt, if any.
    pub reenqueued: Option<BucketId>,
}

#[derive(Debug)]
pub struct BucketQueue {
    job_id: JobId,
    enqueued: VecDeque<Bucket>,
    dequeued: Vec<DequeuedBucket>,
    /// Claims whose results were accepted, so that a resubmitted result is answered the same.
    accepted: HashMap<(WorkerId, RequestId), BucketId>,
    history: TestHistoryTracker,
    results: Vec<TestingResult>,
}

impl BucketQueue {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            enqueued: Default::default(),
            dequeued: Default::default(),
            accepted: Default::default(),
            history: Default::default(),
            results: Default::default(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn enqueue(&mut self, buckets: impl IntoIterator<Item = Bucket>) {
        self.enqueued.extend(buckets);
    }

    /// The bucket already claimed with this worker and request id, if any.
    pub fn replay(&self, worker_id: &WorkerId, request_id: &RequestId) -> Option<&Bucket> {
        self.dequeued
            .iter()
            .find(|claim| &claim.worker_id == worker_id && &claim.request_id == request_id)
            .map(|claim| &claim.bucket)
    }

    pub fn has_enqueued(&self) -> bool {
        !self.enqueued.is_empty()
    }

    /// Claims the first enqueued bucket that is `eligible` for the worker.
    ///
    /// A bucket whose tests already failed on this worker is left for another alive worker
    /// that has not failed them and can take the bucket, if there is one.
    #[instrument(level = "trace", skip(self, eligible, aliveness))]
    pub fn dequeue_bucket(
        &mut self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        eligible: impl Fn(&Bucket) -> bool,
        aliveness: &WorkerAlivenessTracker,
        now: Instant,
    ) -> Option<Bucket> {
        if let Some(bucket) = self.replay(worker_id, request_id) {
            tracing::debug!(job_id=?self.job_id, ?worker_id, ?request_id, bucket_id=?bucket.bucket_id(), "replaying dequeue");
            return Some(bucket.clone());
        }

        if self.enqueued.is_empty() {
            return None;
        }

        let other_workers: Vec<(WorkerId, WorkerCapabilities)> = aliveness
            .alive_workers_with_capabilities()
            .into_iter()
            .filter(|(other, _)| other != worker_id)
            .collect();
        let history = &self.history;
        let position = self.enqueued.iter().position(|bucket| {
            eligible(bucket) && !leave_for_others(history, bucket, worker_id, &other_workers)
        })?;

        let bucket = self.enqueued.remove(position)?;
        log_assert!(
            !self
                .dequeued
                .iter()
                .any(|claim| claim.bucket.bucket_id() == bucket.bucket_id()),
            job_id=?self.job_id, bucket_id=?bucket.bucket_id(), "bucket is both enqueued and claimed"
        );
        aliveness.did_dequeue(worker_id, bucket.bucket_id());
        self.dequeued.push(DequeuedBucket {
            bucket: bucket.clone(),
            worker_id: worker_id.clone(),
            request_id: request_id.clone(),
            claimed_at: now,
        });

        tracing::debug!(job_id=?self.job_id, ?worker_id, ?request_id, bucket_id=?bucket.bucket_id(), "bucket dequeued");
        Some(bucket)
    }

    pub fn has_claim(&self, worker_id: &WorkerId, request_id: &RequestId) -> bool {
        self.replay(worker_id, request_id).is_some()
            || self
                .accepted
                .contains_key(&(worker_id.clone(), request_id.clone()))
    }

    /// Records a worker's result for a bucket it claimed.
    ///
    /// Failed tests of a bucket retried through the queue are put back as a new bucket at the
    /// end of the queue while they have attempts left; their results are kept back until the
    /// final attempt.
    #[instrument(level = "trace", skip(self, testing_result, aliveness))]
    pub fn accept(
        &mut self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        testing_result: TestingResult,
        aliveness: &WorkerAlivenessTracker,
    ) -> Result<AcceptedBucket, QueueError> {
        let claim_key = (worker_id.clone(), request_id.clone());
        if let Some(bucket_id) = self.accepted.get(&claim_key) {
            if *bucket_id == testing_result.bucket_id {
                tracing::debug!(job_id=?self.job_id, ?worker_id, ?request_id, ?bucket_id, "result resubmitted");
                return Ok(AcceptedBucket {
                    bucket_id: *bucket_id,
                    reenqueued: None,
                });
            }
        }

        let index = self
            .dequeued
            .iter()
            .position(|claim| {
                &claim.worker_id == worker_id
                    && &claim.request_id == request_id
                    && claim.bucket.bucket_id() == testing_result.bucket_id
            })
            .ok_or_else(|| QueueError::NoMatchingClaim {
                worker_id: worker_id.clone(),
                request_id: request_id.clone(),
            })?;

        let DequeuedBucket { bucket, .. } = self.dequeued.remove(index);
        let bucket_id = bucket.bucket_id();
        aliveness.did_release(worker_id, bucket_id);

        let mut testing_result = reconcile_with_bucket(&self.job_id, &bucket, testing_result);
        self.history.record(worker_id, &testing_result);

        let settings = bucket.settings();
        let reenqueued = match settings.retry_mode {
            RetryMode::RetryOnWorker => None,
            RetryMode::RetryThroughQueue => {
                let retry_tests: Vec<TestEntry> = testing_result
                    .failed_tests()
                    .filter(|result| {
                        self.history
                            .should_retry(result.name(), settings.number_of_retries)
                    })
                    .map(|result| result.test_entry.clone())
                    .collect();

                if retry_tests.is_empty() {
                    None
                } else {
                    testing_result
                        .results
                        .retain(|result| !retry_tests.contains(&result.test_entry));

                    let retry = bucket.with_tests(retry_tests);
                    let retry_id = retry.bucket_id();
                    tracing::debug!(job_id=?self.job_id, ?bucket_id, ?retry_id, tests=retry.tests().len(), "re-enqueued failed tests");
                    self.enqueued.push_back(retry);
                    Some(retry_id)
                }
            }
        };

        if !testing_result.results.is_empty() {
            self.results.push(testing_result);
        }
        self.accepted.insert(claim_key, bucket_id);

        tracing::debug!(job_id=?self.job_id, ?worker_id, ?request_id, ?bucket_id, "bucket result accepted");
        Ok(AcceptedBucket {
            bucket_id,
            reenqueued,
        })
    }

    /// Moves every claim whose worker can no longer be trusted with it back to the front of the
    /// queue, keeping the claims' relative order.
    pub fn reenqueue_stuck_buckets(
        &mut self,
        aliveness: &WorkerAlivenessTracker,
        now: Instant,
        max_claim_age: Option<Duration>,
    ) -> Vec<StuckBucket> {
        let mut stuck = Vec::new();
        let mut reclaimed = Vec::new();
        let job_id = &self.job_id;

        self.dequeued.retain(|claim| {
            let bucket_id = claim.bucket.bucket_id();
            let reason = if aliveness.is_blocked(&claim.worker_id) {
                Some(StuckReason::WorkerIsBlocked)
            } else if !aliveness.is_alive(&claim.worker_id, now) {
                Some(StuckReason::WorkerIsSilent)
            } else if max_claim_age
                .map_or(false, |age| now.saturating_duration_since(claim.claimed_at) > age)
            {
                Some(StuckReason::ClaimTimedOut)
            } else if aliveness.has_lost_bucket(&claim.worker_id, bucket_id, claim.claimed_at) {
                Some(StuckReason::BucketLost)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    stuck.push(StuckBucket {
                        job_id: job_id.clone(),
                        bucket_id,
                        worker_id: claim.worker_id.clone(),
                        reason,
                    });
                    reclaimed.push(claim.bucket.clone());
                    false
                }
                None => true,
            }
        });

        for (bucket, stuck) in reclaimed.into_iter().zip(&stuck).rev() {
            aliveness.did_release(&stuck.worker_id, bucket.bucket_id());
            self.enqueued.push_front(bucket);
        }

        stuck
    }

    /// Drops all outstanding work. Returns the number of buckets abandoned.
    pub fn abandon(&mut self, aliveness: &WorkerAlivenessTracker) -> usize {
        for claim in &self.dequeued {
            aliveness.did_release(&claim.worker_id, claim.bucket.bucket_id());
        }
        let abandoned = self.enqueued.len() + self.dequeued.len();
        self.enqueued.clear();
        self.dequeued.clear();
        abandoned
    }

    pub fn running_queue_state(&self) -> RunningQueueState {
        let mut dequeued_tests: BTreeMap<WorkerId, Vec<_>> = BTreeMap::new();
        for claim in &self.dequeued {
            dequeued_tests
                .entry(claim.worker_id.clone())
                .or_default()
                .extend(claim.bucket.test_names().cloned());
        }

        RunningQueueState {
            enqueued_bucket_count: self.enqueued.len(),
            enqueued_tests: self
                .enqueued
                .iter()
                .flat_map(|bucket| bucket.test_names().cloned())
                .collect(),
            dequeued_bucket_count: self.dequeued.len(),
            dequeued_tests,
        }
    }

    pub fn is_depleted(&self) -> bool {
        self.enqueued.is_empty() && self.dequeued.is_empty()
    }

    pub fn results(&self) -> &[TestingResult] {
        &self.results
    }
}

fn leave_for_others(
    history: &TestHistoryTracker,
    bucket: &Bucket,
    worker_id: &WorkerId,
    other_workers: &[(WorkerId, WorkerCapabilities)],
) -> bool {
    let tests = bucket.tests();
    let requirements = &bucket.settings().capability_requirements;

    history.any_failed_on(tests, worker_id)
        && other_workers.iter().any(|(other, capabilities)| {
            capabilities.satisfies(requirements) && !history.any_failed_on(tests, other)
        })
}

/// Keeps only results for tests of the bucket, and fails tests the worker did not report on.
fn reconcile_with_bucket(job_id: &JobId, bucket: &Bucket, result: TestingResult) -> TestingResult {
    let TestingResult { bucket_id, results } = result;
    let mut reported: Vec<Option<TestEntryResult>> = results.into_iter().map(Some).collect();

    let mut reconciled = Vec::with_capacity(bucket.tests().len());
    for test in bucket.tests() {
        let found = reported
            .iter_mut()
            .find(|result| matches!(result, Some(result) if &result.test_entry == test))
            .and_then(Option::take);
        match found {
            Some(result) => reconciled.push(result),
            None => {
                tracing::warn!(?job_id, ?bucket_id, test=%test.name, "worker sent no result for test");
                reconciled.push(TestEntryResult::lost(
                    test.clone(),
                    "worker did not report a result for this test",
                ));
            }
        }
    }

    let extra = reported.iter().flatten().count();
    if extra > 0 {
        tracing::warn!(?job_id, ?bucket_id, extra, "dropped results for tests not in bucket");
    }

    TestingResult::new(bucket_id, reconciled)
}
