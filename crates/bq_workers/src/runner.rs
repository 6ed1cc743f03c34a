//! Execution of one bucket, including the local re-runs of failed tests.

use std::sync::Arc;

use async_trait::async_trait;
use bq_utils::net_protocol::bucket::{Bucket, RetryMode, RunSettings, TestEntry};
use bq_utils::net_protocol::results::{TestEntryResult, TestingResult};
use thiserror::Error;
use tracing::instrument;

/// A failure to run tests at all, as opposed to tests that ran and failed.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("could not start the test runner: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Runs a list of tests of one bucket.
///
/// A runner reports one [TestEntryResult] per test it ran. Tests it does not report on are
/// counted as failed.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(
        &self,
        tests: &[TestEntry],
        settings: &RunSettings,
    ) -> Result<Vec<TestEntryResult>, RunnerError>;
}

pub type SharedTestRunner = Arc<dyn TestRunner>;

/// How many times failed tests of a bucket are run again on this worker.
pub fn local_retries(settings: &RunSettings) -> u32 {
    match settings.retry_mode {
        RetryMode::RetryOnWorker => settings.number_of_retries,
        RetryMode::RetryThroughQueue => 0,
    }
}

/// Runs every test of `bucket` once, then re-runs only the tests that have not yet succeeded,
/// at most [local_retries] times. Runs of each test are merged in the order they happened.
#[instrument(level = "trace", skip_all, fields(bucket_id = ?bucket.bucket_id()))]
pub async fn execute_bucket(runner: &dyn TestRunner, bucket: &Bucket) -> TestingResult {
    let settings = bucket.settings();
    let retries = local_retries(settings);

    let mut testing_result = TestingResult::new(bucket.bucket_id(), vec![]);
    let mut pending: Vec<TestEntry> = bucket.tests().to_vec();

    for attempt in 0..=retries {
        if pending.is_empty() {
            break;
        }
        if attempt > 0 {
            tracing::debug!(bucket_id=?bucket.bucket_id(), attempt, tests=pending.len(), "re-running failed tests");
        }

        let results = run_attempt(runner, &pending, settings).await;
        testing_result.merge(TestingResult::new(bucket.bucket_id(), results));

        pending = testing_result
            .failed_tests()
            .map(|result| result.test_entry.clone())
            .collect();
    }

    testing_result
}

/// One run of `tests`. Tests the runner said nothing about, and all tests if the runner could not
/// run, come back as failures.
async fn run_attempt(
    runner: &dyn TestRunner,
    tests: &[TestEntry],
    settings: &RunSettings,
) -> Vec<TestEntryResult> {
    let mut reported = match runner.run_tests(tests, settings).await {
        Ok(reported) => reported,
        Err(error) => {
            tracing::warn!(%error, tests=tests.len(), "test runner failed");
            let reason = error.to_string();
            return tests
                .iter()
                .map(|test| TestEntryResult::lost(test.clone(), reason.clone()))
                .collect();
        }
    };

    let mut results = Vec::with_capacity(tests.len());
    for test in tests {
        match reported.iter().position(|result| &result.test_entry == test) {
            Some(index) => results.push(reported.swap_remove(index)),
            None => results.push(TestEntryResult::lost(
                test.clone(),
                "test runner did not report a result for this test",
            )),
        }
    }
    if !reported.is_empty() {
        tracing::warn!(extra = reported.len(), "test runner reported tests it was not asked to run");
    }
    results
}
