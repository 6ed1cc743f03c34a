//! Where execution slots get their buckets from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bq_utils::net_protocol::bucket::{Bucket, WorkerCapabilities};
use bq_utils::net_protocol::ids::RequestId;
use bq_utils::net_protocol::queue::DequeueResponse;
use tokio::sync::watch;

use crate::registration::Registration;
use crate::scheduler::WorkError;

/// A bucket this worker holds the claim on. The result must be submitted under the same request
/// id the bucket was claimed with.
#[derive(Debug, Clone)]
pub struct ClaimedBucket {
    pub request_id: RequestId,
    pub bucket: Bucket,
}

#[async_trait]
pub trait BucketSource: Send + Sync {
    /// The next bucket to run, or `None` once there will be no more work for this worker.
    async fn next_bucket(&self) -> Result<Option<ClaimedBucket>, WorkError>;
}

pub type SharedBucketSource = Arc<dyn BucketSource>;

/// Polls the queue for buckets.
///
/// Stops handing out buckets once the queue is empty, the worker was blocked, or `stop` is set.
pub struct QueueBucketSource {
    registration: Arc<Registration>,
    capabilities: WorkerCapabilities,
    stop: watch::Receiver<bool>,
}

impl QueueBucketSource {
    pub fn new(
        registration: Arc<Registration>,
        capabilities: WorkerCapabilities,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registration,
            capabilities,
            stop,
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

}

/// Floor on the wait between polls, whatever the queue asks for.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sleeps for `after`, waking early if asked to stop.
async fn pause(stop: &watch::Receiver<bool>, after: Duration) {
    let mut stop = stop.clone();
    if *stop.borrow_and_update() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(after.max(MIN_POLL_INTERVAL)) => {}
        Ok(()) = stop.changed() => {}
    }
}

#[async_trait]
impl BucketSource for QueueBucketSource {
    async fn next_bucket(&self) -> Result<Option<ClaimedBucket>, WorkError> {
        let worker_id = self.registration.worker_id();

        loop {
            if self.is_stopped() {
                return Ok(None);
            }

            // A fresh id per claim; transport retries inside the client resend the same one.
            let request_id = RequestId::unique();
            let response = self
                .registration
                .client()
                .get_bucket(
                    worker_id,
                    &request_id,
                    &self.capabilities,
                    &self.registration.payload_signature(),
                )
                .await
                .map_err(WorkError::Fetch)?;

            match response {
                DequeueResponse::Bucket(bucket) => {
                    tracing::debug!(?worker_id, ?request_id, bucket_id=?bucket.bucket_id(), tests=bucket.tests().len(), "claimed bucket");
                    return Ok(Some(ClaimedBucket { request_id, bucket }));
                }
                DequeueResponse::CheckAgainLater { after } => {
                    tracing::trace!(?worker_id, ?after, "nothing to run yet");
                    pause(&self.stop, after).await;
                }
                DequeueResponse::QueueIsEmpty => {
                    tracing::info!(?worker_id, "queue is empty");
                    return Ok(None);
                }
                DequeueResponse::WorkerIsBlocked => {
                    tracing::warn!(?worker_id, "worker is blocked by the queue");
                    return Ok(None);
                }
                DequeueResponse::WorkerIsNotAlive => {
                    tracing::warn!(?worker_id, "queue considers this worker silent");
                    self.registration
                        .reregister()
                        .await
                        .map_err(WorkError::Fetch)?;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use bq_utils::net_protocol::bucket::Bucket;
    use bq_utils::net_protocol::ids::RequestId;
    use parking_lot::Mutex;

    use super::{BucketSource, ClaimedBucket};
    use crate::scheduler::WorkError;

    /// Hands out a fixed list of buckets, then nothing.
    pub struct VecSource(Mutex<VecDeque<Bucket>>);

    impl VecSource {
        pub fn new(buckets: Vec<Bucket>) -> Self {
            Self(Mutex::new(buckets.into()))
        }
    }

    #[async_trait]
    impl BucketSource for VecSource {
        async fn next_bucket(&self) -> Result<Option<ClaimedBucket>, WorkError> {
            Ok(self.0.lock().pop_front().map(|bucket| ClaimedBucket {
                request_id: RequestId::unique(),
                bucket,
            }))
        }
    }
}
