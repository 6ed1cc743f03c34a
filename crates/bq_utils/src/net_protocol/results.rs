use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use super::bucket::TestEntry;
use super::ids::{BucketId, TestName};
use crate::time::EpochMillis;

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct TestException {
    pub reason: String,
    pub file_path: Option<String>,
    pub line: Option<u32>,
}

impl TestException {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            file_path: None,
            line: None,
        }
    }
}

/// One execution of one test.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct TestRunResult {
    pub succeeded: bool,
    pub exceptions: Vec<TestException>,
    pub duration: Duration,
    pub started_at: EpochMillis,
}

impl TestRunResult {
    pub fn success(duration: Duration, started_at: EpochMillis) -> Self {
        Self {
            succeeded: true,
            exceptions: vec![],
            duration,
            started_at,
        }
    }

    pub fn failure(exception: TestException, duration: Duration, started_at: EpochMillis) -> Self {
        Self {
            succeeded: false,
            exceptions: vec![exception],
            duration,
            started_at,
        }
    }
}

/// All executions of one test, in the order they happened.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct TestEntryResult {
    pub test_entry: TestEntry,
    pub test_run_results: Vec<TestRunResult>,
}

impl TestEntryResult {
    pub fn new(test_entry: TestEntry, test_run_results: Vec<TestRunResult>) -> Self {
        Self {
            test_entry,
            test_run_results,
        }
    }

    /// A test that never produced a result of its own, failed with `reason`.
    pub fn lost(test_entry: TestEntry, reason: impl Into<String>) -> Self {
        Self::new(
            test_entry,
            vec![TestRunResult::failure(
                TestException::new(reason),
                Duration::ZERO,
                EpochMillis::now(),
            )],
        )
    }

    pub fn name(&self) -> &TestName {
        &self.test_entry.name
    }

    /// Succeeded if any execution succeeded.
    pub fn succeeded(&self) -> bool {
        self.test_run_results.iter().any(|run| run.succeeded)
    }

    pub fn last_run(&self) -> Option<&TestRunResult> {
        self.test_run_results.last()
    }
}

/// Results of running one bucket, as submitted by a worker.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct TestingResult {
    pub bucket_id: BucketId,
    pub results: Vec<TestEntryResult>,
}

impl TestingResult {
    pub fn new(bucket_id: BucketId, results: Vec<TestEntryResult>) -> Self {
        Self { bucket_id, results }
    }

    pub fn failed_tests(&self) -> impl Iterator<Item = &TestEntryResult> {
        self.results.iter().filter(|result| !result.succeeded())
    }

    pub fn has_failures(&self) -> bool {
        self.failed_tests().next().is_some()
    }

    /// Appends the runs in `later` to the runs of the same tests here. Tests only present in
    /// `later` are appended in order.
    pub fn merge(&mut self, later: TestingResult) {
        for later_result in later.results {
            match self
                .results
                .iter_mut()
                .find(|result| result.test_entry == later_result.test_entry)
            {
                Some(existing) => existing
                    .test_run_results
                    .extend(later_result.test_run_results),
                None => self.results.push(later_result),
            }
        }
    }
}
