use std::sync::Arc;
use std::time::Duration;

use bq_utils::net_protocol::bucket::{
    Bucket, BuildArtifacts, RetryMode, RunSettings, TestEntry, TestEntryConfiguration,
};
use bq_utils::net_protocol::ids::BucketId;
use bq_utils::net_protocol::results::{TestEntryResult, TestRunResult, TestingResult};
use bq_utils::time::{EpochMillis, ManualClock};

use crate::worker_tracking::{AlivenessSettings, WorkerAlivenessTracker};

pub fn settings() -> RunSettings {
    RunSettings {
        number_of_retries: 0,
        retry_mode: RetryMode::RetryOnWorker,
        capability_requirements: vec![],
        environment: Default::default(),
        test_timeout: Duration::from_secs(60),
        build_artifacts: BuildArtifacts {
            test_bundle: "/builds/AppTests.xctest".to_owned(),
            app_bundle: Some("/builds/App.app".to_owned()),
        },
    }
}

pub fn retry_through_queue(number_of_retries: u32) -> RunSettings {
    RunSettings {
        number_of_retries,
        retry_mode: RetryMode::RetryThroughQueue,
        ..settings()
    }
}

pub fn bucket(tests: &[&str]) -> Bucket {
    bucket_with(tests, settings())
}

pub fn bucket_with(tests: &[&str], settings: RunSettings) -> Bucket {
    Bucket::new(tests.iter().map(|t| TestEntry::new(*t)).collect(), settings)
}

pub fn configs(tests: &[&str]) -> Vec<TestEntryConfiguration> {
    tests
        .iter()
        .map(|t| TestEntryConfiguration {
            test_entry: TestEntry::new(*t),
            settings: settings(),
        })
        .collect()
}

/// Every test of the bucket passes, except those named in `failing`.
pub fn result_for(bucket: &Bucket, failing: &[&str]) -> TestingResult {
    result_for_id(bucket.bucket_id(), bucket, failing)
}

pub fn result_for_id(bucket_id: BucketId, bucket: &Bucket, failing: &[&str]) -> TestingResult {
    let results = bucket
        .tests()
        .iter()
        .map(|entry| {
            if failing.contains(&entry.name.as_str()) {
                TestEntryResult::lost(entry.clone(), "assertion failed")
            } else {
                TestEntryResult::new(
                    entry.clone(),
                    vec![TestRunResult::success(
                        Duration::from_millis(10),
                        EpochMillis::now(),
                    )],
                )
            }
        })
        .collect();
    TestingResult::new(bucket_id, results)
}

pub const REPORT_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const GRACE: Duration = Duration::from_secs(10);

pub fn aliveness() -> (Arc<WorkerAlivenessTracker>, ManualClock) {
    let clock = ManualClock::default();
    let tracker = WorkerAlivenessTracker::new(
        AlivenessSettings {
            report_alive_interval: REPORT_ALIVE_INTERVAL,
            grace: GRACE,
        },
        clock.shared(),
    );
    (Arc::new(tracker), clock)
}
