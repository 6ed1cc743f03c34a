use bq_utils::net_protocol::bucket::ScheduleStrategy;
use bq_utils::net_protocol::ids::RequestId;
use bq_utils::net_protocol::queue::{QueueError, ScheduleTests};
use tracing::instrument;

use crate::balancing::{EnqueueOutcome, SharedBalancingQueue};
use crate::splitting::{split_configurations, splitter_for, SplitContext};

/// Validates schedule requests and turns them into buckets on the balancing queue.
#[derive(Clone)]
pub struct TestsEnqueuer {
    queue: SharedBalancingQueue,
}

impl TestsEnqueuer {
    pub fn new(queue: SharedBalancingQueue) -> Self {
        Self { queue }
    }

    #[instrument(level = "trace", skip(self, schedule), fields(request_id = ?schedule.request_id))]
    pub fn enqueue(&self, schedule: ScheduleTests) -> Result<RequestId, QueueError> {
        let ScheduleTests {
            request_id,
            prioritized_job,
            test_entry_configurations,
            schedule_strategy,
        } = schedule;

        let prioritized_job = prioritized_job
            .validate()
            .map_err(|e| QueueError::InvalidPriority(e.to_string()))?;
        let job_id = &prioritized_job.job_id;

        if test_entry_configurations.is_empty() {
            return Err(QueueError::EmptyJob(job_id.clone()));
        }
        if schedule_strategy == ScheduleStrategy::FixedBucketSize(0) {
            return Err(QueueError::InvalidSettings(
                "fixed bucket size must be at least 1".to_owned(),
            ));
        }
        for configuration in &test_entry_configurations {
            configuration.settings.validate().map_err(|e| {
                QueueError::InvalidSettings(format!("{}: {e}", configuration.test_entry.name))
            })?;
        }

        let ctx = SplitContext {
            available_workers: self.queue.aliveness().alive_workers().len(),
        };
        let buckets = split_configurations(
            test_entry_configurations,
            splitter_for(schedule_strategy).as_ref(),
            ctx,
        );

        match self.queue.enqueue(&prioritized_job, &request_id, buckets)? {
            EnqueueOutcome::Enqueued { bucket_count } => {
                tracing::debug!(?job_id, bucket_count, ?schedule_strategy, "tests scheduled");
            }
            EnqueueOutcome::Replayed => {}
        }

        Ok(request_id)
    }
}
