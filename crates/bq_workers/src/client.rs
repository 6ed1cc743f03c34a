//! Client side of the queue protocol. Every request opens its own connection.

use std::net::SocketAddr;

use bq_utils::net_protocol::{
    self,
    bucket::{
        PrioritizedJobRequest, ScheduleStrategy, TestEntryConfiguration, WorkerCapabilities,
    },
    ids::{BucketId, JobId, PayloadSignature, RequestId, WorkerId},
    queue::{
        BucketResult, DequeueResponse, GetBucket, JobResults, JobState, Message, QueueError,
        QueueVersion, ReportAlive, Request, ScheduleTests, WorkerConfiguration,
    },
    results::TestingResult,
};
use bq_utils::retry::{async_retry_with, RetryPolicy};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The queue could not be reached, or the exchange broke off, on every attempt.
    #[error("could not reach the queue at {addr}: {source}")]
    Transport {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The queue answered, and refused the request.
    #[error(transparent)]
    Protocol(#[from] QueueError),
}

impl ClientError {
    pub fn protocol(&self) -> Option<&QueueError> {
        match self {
            Self::Protocol(error) => Some(error),
            Self::Transport { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueClient {
    addr: SocketAddr,
    retry: RetryPolicy,
}

impl QueueClient {
    pub fn new(addr: SocketAddr, retry: RetryPolicy) -> Self {
        Self { addr, retry }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends `message` and reads back its response, reconnecting on transport failures.
    ///
    /// A request that is retried is sent again as-is; requests that must not take effect twice
    /// carry a request id the queue deduplicates on.
    async fn send<T: DeserializeOwned>(&self, message: Message) -> Result<T, ClientError> {
        let request = Request { message };
        let request = &request;
        let addr = self.addr;

        async_retry_with(self.retry, |attempt| async move {
            if attempt > 1 {
                tracing::debug!(attempt, %addr, "reattempting request to queue");
            }
            let mut stream = TcpStream::connect(addr).await?;
            net_protocol::async_write(&mut stream, request).await?;
            net_protocol::async_read::<_, T>(&mut stream).await
        })
        .await
        .map_err(|source| ClientError::Transport { addr, source })
    }

    async fn call<T: DeserializeOwned>(&self, message: Message) -> Result<T, ClientError> {
        let response: Result<T, QueueError> = self.send(message).await?;
        Ok(response?)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn register_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<WorkerConfiguration, ClientError> {
        self.call(Message::RegisterWorker(worker_id.clone())).await
    }

    #[instrument(level = "trace", skip(self, capabilities, payload_signature))]
    pub async fn get_bucket(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        capabilities: &WorkerCapabilities,
        payload_signature: &PayloadSignature,
    ) -> Result<DequeueResponse, ClientError> {
        self.call(Message::GetBucket(GetBucket {
            worker_id: worker_id.clone(),
            request_id: request_id.clone(),
            capabilities: capabilities.clone(),
            payload_signature: payload_signature.clone(),
        }))
        .await
    }

    #[instrument(level = "trace", skip(self, payload_signature))]
    pub async fn report_alive(
        &self,
        worker_id: &WorkerId,
        bucket_ids_being_processed: Vec<BucketId>,
        payload_signature: &PayloadSignature,
    ) -> Result<(), ClientError> {
        self.call(Message::ReportAlive(ReportAlive {
            worker_id: worker_id.clone(),
            bucket_ids_being_processed,
            payload_signature: payload_signature.clone(),
        }))
        .await
    }

    #[instrument(level = "trace", skip(self, testing_result, payload_signature), fields(bucket_id = ?testing_result.bucket_id))]
    pub async fn bucket_result(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        testing_result: TestingResult,
        payload_signature: &PayloadSignature,
    ) -> Result<BucketId, ClientError> {
        self.call(Message::BucketResult(BucketResult {
            worker_id: worker_id.clone(),
            request_id: request_id.clone(),
            testing_result,
            payload_signature: payload_signature.clone(),
        }))
        .await
    }

    #[instrument(level = "trace", skip(self, test_entry_configurations), fields(job_id = %prioritized_job.job_id))]
    pub async fn schedule_tests(
        &self,
        request_id: RequestId,
        prioritized_job: PrioritizedJobRequest,
        test_entry_configurations: Vec<TestEntryConfiguration>,
        schedule_strategy: ScheduleStrategy,
    ) -> Result<RequestId, ClientError> {
        self.call(Message::ScheduleTests(ScheduleTests {
            request_id,
            prioritized_job,
            test_entry_configurations,
            schedule_strategy,
        }))
        .await
    }

    pub async fn job_state(&self, job_id: &JobId) -> Result<JobState, ClientError> {
        self.call(Message::JobState(job_id.clone())).await
    }

    pub async fn job_results(&self, job_id: &JobId) -> Result<JobResults, ClientError> {
        self.call(Message::JobResults(job_id.clone())).await
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<JobId, ClientError> {
        self.call(Message::JobDelete(job_id.clone())).await
    }

    pub async fn disable_worker(&self, worker_id: &WorkerId) -> Result<WorkerId, ClientError> {
        self.call(Message::DisableWorker(worker_id.clone())).await
    }

    pub async fn enable_worker(&self, worker_id: &WorkerId) -> Result<WorkerId, ClientError> {
        self.call(Message::EnableWorker(worker_id.clone())).await
    }

    pub async fn queue_version(&self) -> Result<String, ClientError> {
        let QueueVersion { version } = self.send(Message::QueueVersion).await?;
        Ok(version)
    }
}
