//! Runs each test as an invocation of an external command.
//!
//! The command is given the test name as its last argument, and the bucket's environment plus
//! `BQ_TEST_NAME`, `BQ_TEST_BUNDLE` and, if there is one, `BQ_APP_BUNDLE`. A zero exit status
//! is a passing test.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use bq_utils::net_protocol::bucket::{RunSettings, TestEntry};
use bq_utils::net_protocol::results::{TestEntryResult, TestException, TestRunResult};
use bq_utils::time::EpochMillis;
use tokio::process::Command;

use crate::runner::{RunnerError, TestRunner};

#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(command: Vec<String>) -> Result<Self, RunnerError> {
        let mut command = command.into_iter();
        let program = command
            .next()
            .filter(|program| !program.trim().is_empty())
            .ok_or_else(|| RunnerError::Other("test runner command is empty".to_string()))?;
        Ok(Self {
            program,
            args: command.collect(),
        })
    }

    fn command_for(&self, test: &TestEntry, settings: &RunSettings) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(test.name.as_str())
            .envs(&settings.environment)
            .env("BQ_TEST_NAME", test.name.as_str())
            .env("BQ_TEST_BUNDLE", &settings.build_artifacts.test_bundle)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(app_bundle) = &settings.build_artifacts.app_bundle {
            command.env("BQ_APP_BUNDLE", app_bundle);
        }
        command
    }

    async fn run_test(
        &self,
        test: &TestEntry,
        settings: &RunSettings,
    ) -> Result<TestRunResult, RunnerError> {
        let started_at = EpochMillis::now();
        let start = Instant::now();

        let child = self.command_for(test, settings).spawn()?;
        let finished = tokio::time::timeout(settings.test_timeout, child.wait_with_output()).await;
        let output = match finished {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!(test=%test.name, timeout=?settings.test_timeout, "test timed out");
                return Ok(TestRunResult::failure(
                    TestException::new(format!(
                        "test did not finish within {:?}",
                        settings.test_timeout
                    )),
                    start.elapsed(),
                    started_at,
                ));
            }
        };
        let duration = start.elapsed();

        if output.status.success() {
            return Ok(TestRunResult::success(duration, started_at));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.lines().rev().find(|line| !line.trim().is_empty()) {
            Some(line) => line.trim().to_string(),
            None => format!("test exited with {}", output.status),
        };
        Ok(TestRunResult::failure(
            TestException::new(reason),
            duration,
            started_at,
        ))
    }
}

#[async_trait]
impl TestRunner for CommandRunner {
    async fn run_tests(
        &self,
        tests: &[TestEntry],
        settings: &RunSettings,
    ) -> Result<Vec<TestEntryResult>, RunnerError> {
        let mut results = Vec::with_capacity(tests.len());
        for test in tests {
            let run = self.run_test(test, settings).await?;
            tracing::trace!(test=%test.name, succeeded=run.succeeded, "test finished");
            results.push(TestEntryResult::new(test.clone(), vec![run]));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bq_utils::net_protocol::bucket::{BuildArtifacts, RetryMode, RunSettings, TestEntry};

    use super::CommandRunner;
    use crate::runner::{RunnerError, TestRunner};

    fn settings(test_timeout: Duration) -> RunSettings {
        RunSettings {
            number_of_retries: 0,
            retry_mode: RetryMode::RetryOnWorker,
            capability_requirements: vec![],
            environment: [("GREETING".to_string(), "hello".to_string())].into(),
            test_timeout,
            build_artifacts: BuildArtifacts {
                test_bundle: "Tests.xctest".to_string(),
                app_bundle: None,
            },
        }
    }

    fn sh(script: &str) -> CommandRunner {
        CommandRunner::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()]).unwrap()
    }

    #[tokio::test]
    async fn exit_status_decides_outcome() {
        // `sh -c` binds the appended test name to $0.
        let runner = sh(r#"if [ "$0" = bad ]; then echo "expected 1, got 2" >&2; exit 1; fi"#);
        let tests = [TestEntry::new("good"), TestEntry::new("bad")];

        let results = runner
            .run_tests(&tests, &settings(Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(results[0].succeeded());
        assert!(!results[1].succeeded());
        assert_eq!(
            results[1].last_run().unwrap().exceptions[0].reason,
            "expected 1, got 2"
        );
    }

    #[tokio::test]
    async fn bucket_environment_reaches_the_command() {
        let runner = sh(
            r#"[ "$GREETING" = hello ] && [ "$BQ_TEST_BUNDLE" = Tests.xctest ] && [ "$BQ_TEST_NAME" = "$0" ]"#,
        );

        let results = runner
            .run_tests(&[TestEntry::new("env")], &settings(Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(results[0].succeeded());
    }

    #[tokio::test]
    async fn slow_test_fails_on_timeout() {
        let runner = sh("sleep 10");

        let results = runner
            .run_tests(&[TestEntry::new("slow")], &settings(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(!results[0].succeeded());
        let reason = &results[0].last_run().unwrap().exceptions[0].reason;
        assert!(reason.contains("did not finish"), "{reason}");
    }

    #[tokio::test]
    async fn missing_program_is_a_runner_error() {
        let runner = CommandRunner::new(vec!["/nonexistent/bq-test-runner".to_string()]).unwrap();

        let error = runner
            .run_tests(&[TestEntry::new("a")], &settings(Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(matches!(error, RunnerError::Spawn(_)), "{error}");
    }

    #[test]
    fn empty_command_is_refused() {
        assert!(CommandRunner::new(vec![]).is_err());
        assert!(CommandRunner::new(vec![" ".to_string()]).is_err());
    }
}
