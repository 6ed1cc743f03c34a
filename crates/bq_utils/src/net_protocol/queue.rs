//! Messages to and from the queue server. Every connection carries exactly one [Request] and
//! one response, whose type is fixed by the request's [Message].

use std::collections::BTreeMap;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use super::bucket::{
    Bucket, PrioritizedJobRequest, ScheduleStrategy, TestEntryConfiguration, WorkerCapabilities,
};
use super::ids::{BucketId, JobId, PayloadSignature, RequestId, TestName, WorkerId};
use super::results::TestingResult;

#[derive(Serialize, Deserialize, Debug)]
pub struct Request {
    pub message: Message,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GetBucket {
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub capabilities: WorkerCapabilities,
    pub payload_signature: PayloadSignature,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ReportAlive {
    pub worker_id: WorkerId,
    pub bucket_ids_being_processed: Vec<BucketId>,
    pub payload_signature: PayloadSignature,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct BucketResult {
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub testing_result: TestingResult,
    pub payload_signature: PayloadSignature,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ScheduleTests {
    pub request_id: RequestId,
    pub prioritized_job: PrioritizedJobRequest,
    pub test_entry_configurations: Vec<TestEntryConfiguration>,
    pub schedule_strategy: ScheduleStrategy,
}

/// A message sent to the queue.
#[derive(Serialize, Deserialize, Debug)]
pub enum Message {
    /// Response: [`RegisterWorkerResponse`].
    RegisterWorker(WorkerId),
    /// Response: [`GetBucketResponse`].
    GetBucket(GetBucket),
    /// Response: [`ReportAliveResponse`].
    ReportAlive(ReportAlive),
    /// Response: [`BucketResultResponse`].
    BucketResult(BucketResult),
    /// Response: [`ScheduleTestsResponse`].
    ScheduleTests(ScheduleTests),
    /// Response: [`JobStateResponse`].
    JobState(JobId),
    /// Response: [`JobResultsResponse`].
    JobResults(JobId),
    /// Response: [`JobDeleteResponse`].
    JobDelete(JobId),
    /// Response: [`WorkerToggleResponse`].
    DisableWorker(WorkerId),
    /// Response: [`WorkerToggleResponse`].
    EnableWorker(WorkerId),
    /// Response: [`QueueVersion`].
    QueueVersion,
}

/// Protocol errors. Each carries enough for the caller to decide what to do next; none of them
/// should be retried blindly.
#[derive(Serialize, Deserialize, Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("worker {0} is not registered")]
    WorkerNotRegistered(WorkerId),
    #[error("worker {0} is blocked")]
    WorkerBlocked(WorkerId),
    #[error("payload signature does not match the one issued by this queue")]
    SignatureMismatch,
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {0} was deleted")]
    JobDeleted(JobId),
    #[error("no bucket is claimed by worker {worker_id} with request {request_id}")]
    NoMatchingClaim {
        worker_id: WorkerId,
        request_id: RequestId,
    },
    #[error("{0}")]
    InvalidPriority(String),
    #[error("job {0} has no tests")]
    EmptyJob(JobId),
    #[error("invalid run settings: {0}")]
    InvalidSettings(String),
    #[error("internal queue error: {0}")]
    Internal(String),
}

/// The answer to a worker asking for work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DequeueResponse {
    Bucket(Bucket),
    /// Nothing eligible right now; ask again after the given delay.
    CheckAgainLater { after: Duration },
    /// Everything has been run; the worker should stop.
    QueueIsEmpty,
    WorkerIsBlocked,
    /// The worker missed its heartbeats and must register again.
    WorkerIsNotAlive,
}

/// What a worker is told when it registers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfiguration {
    pub report_alive_interval: Duration,
    pub check_again_interval: Duration,
    pub parallelism: usize,
    pub payload_signature: PayloadSignature,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningQueueState {
    pub enqueued_bucket_count: usize,
    pub enqueued_tests: Vec<TestName>,
    pub dequeued_bucket_count: usize,
    pub dequeued_tests: BTreeMap<WorkerId, Vec<TestName>>,
}

impl RunningQueueState {
    /// No bucket is waiting or being run.
    pub fn is_depleted(&self) -> bool {
        self.enqueued_bucket_count == 0 && self.dequeued_bucket_count == 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum JobQueueState {
    Running(RunningQueueState),
    Deleted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub job_id: JobId,
    pub state: JobQueueState,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobResults {
    pub job_id: JobId,
    pub testing_results: Vec<TestingResult>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueueVersion {
    pub version: String,
}

pub type RegisterWorkerResponse = Result<WorkerConfiguration, QueueError>;
pub type GetBucketResponse = Result<DequeueResponse, QueueError>;
pub type ReportAliveResponse = Result<(), QueueError>;
pub type BucketResultResponse = Result<BucketId, QueueError>;
pub type ScheduleTestsResponse = Result<RequestId, QueueError>;
pub type JobStateResponse = Result<JobState, QueueError>;
pub type JobResultsResponse = Result<JobResults, QueueError>;
pub type JobDeleteResponse = Result<JobId, QueueError>;
pub type WorkerToggleResponse = Result<WorkerId, QueueError>;

#[cfg(test)]
mod test {
    use super::{DequeueResponse, GetBucketResponse, QueueError, RunningQueueState};
    use crate::net_protocol::ids::{RequestId, WorkerId};
    use std::time::Duration;

    #[test]
    fn depletion() {
        let mut state = RunningQueueState::default();
        assert!(state.is_depleted());
        state.dequeued_bucket_count = 1;
        assert!(!state.is_depleted());
    }

    #[test]
    fn protocol_errors_survive_the_wire() {
        let response: GetBucketResponse = Err(QueueError::NoMatchingClaim {
            worker_id: WorkerId::from("w1"),
            request_id: RequestId::from("r1"),
        });
        let json = serde_json::to_string(&response).unwrap();
        let back: GetBucketResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);

        let wait: GetBucketResponse = Ok(DequeueResponse::CheckAgainLater {
            after: Duration::from_secs(10),
        });
        let json = serde_json::to_string(&wait).unwrap();
        assert_eq!(serde_json::from_str::<GetBucketResponse>(&json).unwrap(), wait);
    }
}
