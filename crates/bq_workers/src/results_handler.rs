//! Interface for reporting bucket results.

use std::sync::Arc;

use async_trait::async_trait;
use bq_utils::net_protocol::queue::QueueError;
use bq_utils::net_protocol::results::TestingResult;
use tracing::instrument;

use crate::bucket_source::ClaimedBucket;
use crate::registration::Registration;
use crate::scheduler::WorkError;

#[async_trait]
pub trait NotifyResults: Send + Sync {
    async fn send_result(
        &self,
        claimed: &ClaimedBucket,
        testing_result: TestingResult,
    ) -> Result<(), WorkError>;
}

pub type SharedResultsHandler = Arc<dyn NotifyResults>;

/// Submits results to the queue under the request id the bucket was claimed with.
pub struct QueueResultsSender {
    registration: Arc<Registration>,
}

impl QueueResultsSender {
    pub fn new(registration: Arc<Registration>) -> Self {
        Self { registration }
    }
}

#[async_trait]
impl NotifyResults for QueueResultsSender {
    #[instrument(level = "trace", skip_all, fields(bucket_id = ?claimed.bucket.bucket_id()))]
    async fn send_result(
        &self,
        claimed: &ClaimedBucket,
        testing_result: TestingResult,
    ) -> Result<(), WorkError> {
        let bucket_id = claimed.bucket.bucket_id();
        let worker_id = self.registration.worker_id();

        let sent = self
            .registration
            .client()
            .bucket_result(
                worker_id,
                &claimed.request_id,
                testing_result,
                &self.registration.payload_signature(),
            )
            .await;

        match sent {
            Ok(_) => {
                tracing::debug!(?worker_id, ?bucket_id, "bucket result accepted");
                Ok(())
            }
            Err(error) => match error.protocol() {
                // The bucket was reclaimed while it ran here; someone else now owns it.
                Some(QueueError::NoMatchingClaim { .. }) => {
                    tracing::warn!(?worker_id, ?bucket_id, "queue refused result as stale");
                    Ok(())
                }
                _ => Err(WorkError::Submit {
                    bucket_id,
                    source: error,
                }),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use async_trait::async_trait;
    use bq_utils::net_protocol::results::TestingResult;
    use parking_lot::Mutex;

    use super::NotifyResults;
    use crate::bucket_source::ClaimedBucket;
    use crate::scheduler::WorkError;

    #[derive(Default)]
    pub struct CollectingResults(pub Mutex<Vec<TestingResult>>);

    #[async_trait]
    impl NotifyResults for CollectingResults {
        async fn send_result(
            &self,
            _claimed: &ClaimedBucket,
            testing_result: TestingResult,
        ) -> Result<(), WorkError> {
            self.0.lock().push(testing_result);
            Ok(())
        }
    }
}
