//! Per-job record of every queue-level execution attempt of every test.

use std::collections::HashMap;

use bq_utils::net_protocol::bucket::TestEntry;
use bq_utils::net_protocol::ids::{BucketId, TestName, WorkerId};
use bq_utils::net_protocol::results::TestingResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAttempt {
    pub worker_id: WorkerId,
    pub bucket_id: BucketId,
    pub succeeded: bool,
}

/// One attempt is one accepted bucket result containing the test, however many times the
/// worker ran the test locally to produce it.
#[derive(Debug, Default)]
pub struct TestHistoryTracker {
    history: HashMap<TestName, Vec<TestAttempt>>,
}

impl TestHistoryTracker {
    pub fn record(&mut self, worker_id: &WorkerId, testing_result: &TestingResult) {
        for result in &testing_result.results {
            self.history
                .entry(result.name().clone())
                .or_default()
                .push(TestAttempt {
                    worker_id: worker_id.clone(),
                    bucket_id: testing_result.bucket_id,
                    succeeded: result.succeeded(),
                });
        }
    }

    pub fn attempts(&self, test: &TestName) -> &[TestAttempt] {
        self.history.get(test).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn attempt_count(&self, test: &TestName) -> usize {
        self.attempts(test).len()
    }

    /// A test configured with `number_of_retries` retries gets `number_of_retries + 1` attempts.
    pub fn should_retry(&self, test: &TestName, number_of_retries: u32) -> bool {
        let attempts = self.attempts(test);
        let last_failed = attempts.last().map_or(false, |attempt| !attempt.succeeded);
        last_failed && attempts.len() <= number_of_retries as usize
    }

    pub fn failed_on(&self, test: &TestName, worker_id: &WorkerId) -> bool {
        self.attempts(test)
            .iter()
            .any(|attempt| !attempt.succeeded && &attempt.worker_id == worker_id)
    }

    /// Whether any of `tests` has failed on the worker before.
    pub fn any_failed_on(&self, tests: &[TestEntry], worker_id: &WorkerId) -> bool {
        tests.iter().any(|test| self.failed_on(&test.name, worker_id))
    }
}
