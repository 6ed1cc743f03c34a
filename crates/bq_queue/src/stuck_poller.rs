use std::time::Duration;

use bq_utils::server_shutdown::ShutdownReceiver;
use tokio::time::MissedTickBehavior;

use crate::balancing::SharedBalancingQueue;

/// Periodically reclaims stuck buckets and forgets expired jobs.
pub struct StuckBucketsPoller {
    queue: SharedBalancingQueue,
    interval: Duration,
}

impl StuckBucketsPoller {
    pub fn new(queue: SharedBalancingQueue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// One sweep. Returns the number of buckets reclaimed.
    pub fn sweep(&self) -> usize {
        let reclaimed = self.queue.reenqueue_stuck_buckets().len();
        let purged = self.queue.purge_expired_jobs();
        if purged > 0 {
            tracing::info!(purged, "forgot expired jobs");
        }
        reclaimed
    }

    pub async fn start(self, mut shutdown: ShutdownReceiver) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.recv_shutdown_immediately() => {
                    break;
                }
            }
        }

        tracing::debug!("stuck bucket poller stopped");
    }
}

#[cfg(test)]
mod test {
    use super::StuckBucketsPoller;
    use crate::balancing::BalancingBucketQueue;
    use crate::test_support::{aliveness, bucket, REPORT_ALIVE_INTERVAL};
    use bq_utils::net_protocol::bucket::{PrioritizedJob, Priority, WorkerCapabilities};
    use bq_utils::net_protocol::ids::{JobId, RequestId, WorkerId};
    use bq_utils::server_shutdown::ShutdownManager;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    #[ntest::timeout(2000)]
    async fn reclaims_bucket_of_silent_worker_within_one_interval() {
        let (aliveness, clock) = aliveness();
        let queue = Arc::new(BalancingBucketQueue::new(aliveness, Default::default()));
        let job_id = JobId::from("J");
        queue
            .enqueue(
                &PrioritizedJob::standalone(job_id.clone(), Priority::MEDIUM),
                &RequestId::from("r"),
                vec![bucket(&["a"]), bucket(&["b"]), bucket(&["c"])],
            )
            .unwrap();

        let w1 = WorkerId::from("w1");
        queue.aliveness().register(&w1);
        queue.dequeue_bucket(&w1, &RequestId::from("1"), &WorkerCapabilities::default());
        assert_eq!(queue.running_queue_state(&job_id).unwrap().dequeued_bucket_count, 1);

        let (mut shutdown, shutdown_rx) = ShutdownManager::new_pair();
        let poller = StuckBucketsPoller::new(queue.clone(), Duration::from_secs(1));
        let handle = tokio::spawn(poller.start(shutdown_rx));

        clock.advance(REPORT_ALIVE_INTERVAL * 2);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let state = queue.running_queue_state(&job_id).unwrap();
        assert_eq!(state.dequeued_bucket_count, 0);
        assert_eq!(state.enqueued_bucket_count, 3);

        shutdown.shutdown_immediately().unwrap();
        handle.await.unwrap();
    }
}
