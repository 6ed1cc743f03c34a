//! End-to-end runs of a queue server against workers driven by a scripted test runner.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bq_queue::balancing::{BalancingSettings, NothingToDequeueBehavior};
use bq_queue::config::QueueConfig;
use bq_queue::queue::Queue;
use bq_utils::net_protocol::bucket::{
    BuildArtifacts, PrioritizedJobRequest, RetryMode, RunSettings, ScheduleStrategy, TestEntry,
    TestEntryConfiguration, WorkerCapabilities,
};
use bq_utils::net_protocol::ids::{JobGroupId, JobId, RequestId, TestName, WorkerId};
use bq_utils::net_protocol::queue::{DequeueResponse, JobQueueState, QueueError};
use bq_utils::net_protocol::results::{
    TestEntryResult, TestException, TestRunResult, TestingResult,
};
use bq_utils::retry::RetryPolicy;
use bq_utils::server_shutdown::ShutdownManager;
use bq_utils::time::{EpochMillis, ManualClock};
use bq_workers::client::QueueClient;
use bq_workers::runner::{RunnerError, TestRunner};
use bq_workers::worker::{run_worker, WorkerConfig, WorkerExit, WorkerExitStatus};
use ntest::timeout;
use parking_lot::Mutex;

/// Records every test it is asked to run, and fails the named tests a set number of times.
#[derive(Default)]
struct ScriptedRunner {
    failures_left: Mutex<HashMap<TestName, u32>>,
    ran: Mutex<Vec<TestName>>,
}

impl ScriptedRunner {
    fn failing(failures: &[(&str, u32)]) -> Self {
        Self {
            failures_left: Mutex::new(
                failures
                    .iter()
                    .map(|(name, times)| (TestName::from(*name), *times))
                    .collect(),
            ),
            ran: Default::default(),
        }
    }

    fn ran(&self) -> Vec<String> {
        self.ran.lock().iter().map(|name| name.0.clone()).collect()
    }
}

#[async_trait]
impl TestRunner for ScriptedRunner {
    async fn run_tests(
        &self,
        tests: &[TestEntry],
        _settings: &RunSettings,
    ) -> Result<Vec<TestEntryResult>, RunnerError> {
        let mut results = Vec::with_capacity(tests.len());
        for test in tests {
            self.ran.lock().push(test.name.clone());

            let should_fail = match self.failures_left.lock().get_mut(&test.name) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            let run = if should_fail {
                TestRunResult::failure(
                    TestException::new("XCTAssertTrue failed"),
                    Duration::from_millis(3),
                    EpochMillis::now(),
                )
            } else {
                TestRunResult::success(Duration::from_millis(3), EpochMillis::now())
            };
            results.push(TestEntryResult::new(test.clone(), vec![run]));
        }
        Ok(results)
    }
}

fn settings(retry_mode: RetryMode, number_of_retries: u32) -> RunSettings {
    RunSettings {
        number_of_retries,
        retry_mode,
        capability_requirements: vec![],
        environment: Default::default(),
        test_timeout: Duration::from_secs(60),
        build_artifacts: BuildArtifacts {
            test_bundle: "/builds/AppTests.xctest".to_owned(),
            app_bundle: Some("/builds/App.app".to_owned()),
        },
    }
}

fn configs(tests: &[&str], settings: &RunSettings) -> Vec<TestEntryConfiguration> {
    tests
        .iter()
        .map(|test| TestEntryConfiguration {
            test_entry: TestEntry::new(*test),
            settings: settings.clone(),
        })
        .collect()
}

fn job(job_id: &str, job_priority: u16) -> PrioritizedJobRequest {
    PrioritizedJobRequest {
        job_group_id: JobGroupId::from("pipeline"),
        job_group_priority: 500,
        job_id: JobId::from(job_id),
        job_priority,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        balancing: BalancingSettings {
            nothing_to_dequeue: NothingToDequeueBehavior::WaitForDepletion,
            check_again_interval: Duration::from_millis(10),
            ..Default::default()
        },
        stuck_bucket_sweep_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn schedule(
    client: &QueueClient,
    job: PrioritizedJobRequest,
    tests: &[&str],
    settings: &RunSettings,
) {
    client
        .schedule_tests(
            RequestId::unique(),
            job,
            configs(tests, settings),
            ScheduleStrategy::Individual,
        )
        .await
        .unwrap();
}

async fn work(addr: SocketAddr, worker_id: &str, runner: Arc<ScriptedRunner>) -> WorkerExit {
    let (_shutdown, shutdown_rx) = ShutdownManager::new_pair();
    let mut config = WorkerConfig::new(addr, WorkerId::from(worker_id));
    config.request_retry = fast_retry();
    run_worker(config, runner, shutdown_rx).await.unwrap()
}

async fn results_for(client: &QueueClient, job_id: &str) -> HashMap<String, TestEntryResult> {
    client
        .job_results(&JobId::from(job_id))
        .await
        .unwrap()
        .testing_results
        .into_iter()
        .flat_map(|testing_result| testing_result.results)
        .map(|result| (result.name().0.clone(), result))
        .collect()
}

#[tokio::test]
#[timeout(5000)]
async fn higher_priority_job_runs_first() {
    let mut queue = Queue::start(queue_config()).await.unwrap();
    let client = QueueClient::new(queue.server_addr(), fast_retry());
    let settings = settings(RetryMode::RetryOnWorker, 0);

    schedule(&client, job("nightly", 100), &["low-1", "low-2"], &settings).await;
    schedule(&client, job("pull-request", 900), &["high-1", "high-2"], &settings).await;

    let runner = Arc::new(ScriptedRunner::default());
    let exit = work(queue.server_addr(), "mac-mini-1", runner.clone()).await;

    assert_eq!(exit.status, WorkerExitStatus::Completed);
    assert_eq!(exit.buckets_run, 4);
    assert_eq!(runner.ran(), vec!["high-1", "high-2", "low-1", "low-2"]);

    let high = results_for(&client, "pull-request").await;
    let low = results_for(&client, "nightly").await;
    assert_eq!(high.len(), 2);
    assert_eq!(low.len(), 2);
    assert!(high.values().chain(low.values()).all(|result| result.succeeded()));

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(5000)]
async fn worker_retries_failed_tests_locally() {
    let mut queue = Queue::start(queue_config()).await.unwrap();
    let client = QueueClient::new(queue.server_addr(), fast_retry());

    schedule(
        &client,
        job("ui-tests", 500),
        &["LoginTests/testLogout", "LoginTests/testLogin"],
        &settings(RetryMode::RetryOnWorker, 2),
    )
    .await;

    let runner = Arc::new(ScriptedRunner::failing(&[("LoginTests/testLogin", 2)]));
    let exit = work(queue.server_addr(), "mac-mini-1", runner.clone()).await;
    assert_eq!(exit.status, WorkerExitStatus::Completed);

    let ran = runner.ran();
    assert_eq!(
        ran.iter().filter(|name| *name == "LoginTests/testLogin").count(),
        3
    );
    assert_eq!(
        ran.iter().filter(|name| *name == "LoginTests/testLogout").count(),
        1
    );

    let results = results_for(&client, "ui-tests").await;
    let login = &results["LoginTests/testLogin"];
    assert_eq!(login.test_run_results.len(), 3);
    assert!(login.succeeded());

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(5000)]
async fn queue_reenqueues_failed_tests() {
    let mut queue = Queue::start(queue_config()).await.unwrap();
    let client = QueueClient::new(queue.server_addr(), fast_retry());

    schedule(
        &client,
        job("ui-tests", 500),
        &["CartTests/testCheckout", "CartTests/testEmpty"],
        &settings(RetryMode::RetryThroughQueue, 1),
    )
    .await;

    let runner = Arc::new(ScriptedRunner::failing(&[
        ("CartTests/testCheckout", 1),
        ("CartTests/testEmpty", 5),
    ]));
    let exit = work(queue.server_addr(), "mac-mini-1", runner.clone()).await;
    assert_eq!(exit.status, WorkerExitStatus::Completed);
    // Two original buckets plus one retry bucket per failed test.
    assert_eq!(exit.buckets_run, 4);

    let results = results_for(&client, "ui-tests").await;
    assert_eq!(results.len(), 2);
    assert!(results["CartTests/testCheckout"].succeeded());
    assert!(!results["CartTests/testEmpty"].succeeded());

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(5000)]
async fn bucket_of_silent_worker_is_run_by_another() {
    let clock = ManualClock::default();
    let mut queue = Queue::start(QueueConfig {
        clock: clock.shared(),
        ..queue_config()
    })
    .await
    .unwrap();
    let client = QueueClient::new(queue.server_addr(), fast_retry());

    schedule(
        &client,
        job("ui-tests", 500),
        &["SearchTests/testQuery"],
        &settings(RetryMode::RetryOnWorker, 0),
    )
    .await;

    let ghost = WorkerId::from("ghost");
    let configuration = client.register_worker(&ghost).await.unwrap();
    let ghost_request = RequestId::unique();
    let bucket = match client
        .get_bucket(
            &ghost,
            &ghost_request,
            &WorkerCapabilities::default(),
            &configuration.payload_signature,
        )
        .await
        .unwrap()
    {
        DequeueResponse::Bucket(bucket) => bucket,
        other => panic!("expected a bucket, got {other:?}"),
    };

    clock.advance(configuration.report_alive_interval * 2);

    let job_id = JobId::from("ui-tests");
    loop {
        let state = client.job_state(&job_id).await.unwrap();
        match state.state {
            JobQueueState::Running(running) if running.enqueued_bucket_count == 1 => break,
            JobQueueState::Running(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            JobQueueState::Deleted => panic!("job deleted"),
        }
    }

    let runner = Arc::new(ScriptedRunner::default());
    let exit = work(queue.server_addr(), "mac-mini-2", runner.clone()).await;
    assert_eq!(exit.buckets_run, 1);
    assert_eq!(runner.ran(), vec!["SearchTests/testQuery"]);

    let late = TestingResult::new(bucket.bucket_id(), vec![]);
    let error = client
        .bucket_result(&ghost, &ghost_request, late, &configuration.payload_signature)
        .await
        .unwrap_err();
    assert!(
        matches!(error.protocol(), Some(QueueError::NoMatchingClaim { .. })),
        "{error}"
    );

    let results = results_for(&client, "ui-tests").await;
    assert!(results["SearchTests/testQuery"].succeeded());

    queue.shutdown().await.unwrap();
}

#[tokio::test]
#[timeout(5000)]
async fn disabled_worker_runs_nothing() {
    let mut queue = Queue::start(queue_config()).await.unwrap();
    let client = QueueClient::new(queue.server_addr(), fast_retry());

    schedule(
        &client,
        job("ui-tests", 500),
        &["SearchTests/testQuery"],
        &settings(RetryMode::RetryOnWorker, 0),
    )
    .await;
    client
        .disable_worker(&WorkerId::from("mac-mini-1"))
        .await
        .unwrap();

    let runner = Arc::new(ScriptedRunner::default());
    let exit = work(queue.server_addr(), "mac-mini-1", runner.clone()).await;
    assert_eq!(exit.status, WorkerExitStatus::Completed);
    assert_eq!(exit.buckets_run, 0);
    assert!(runner.ran().is_empty());

    client
        .enable_worker(&WorkerId::from("mac-mini-1"))
        .await
        .unwrap();
    let exit = work(queue.server_addr(), "mac-mini-1", runner.clone()).await;
    assert_eq!(exit.buckets_run, 1);

    queue.shutdown().await.unwrap();
}
