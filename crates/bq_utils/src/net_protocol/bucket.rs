//! Buckets, the immutable units of scheduled test work, and the settings they carry.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{BucketId, JobGroupId, JobId, TestName};

/// Ranks jobs for dequeue. Higher values dequeue first.
#[derive(Serialize, Deserialize, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[serde(try_from = "u16", into = "u16")]
pub struct Priority(u16);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("priority {0} is out of the range 0..=999")]
pub struct InvalidPriority(pub u16);

impl Priority {
    pub const MIN: u16 = 0;
    pub const MAX: u16 = 999;

    pub const LOWEST: Self = Self(Self::MIN);
    pub const MEDIUM: Self = Self(500);
    pub const HIGHEST: Self = Self(Self::MAX);

    pub fn new(value: u16) -> Result<Self, InvalidPriority> {
        if value > Self::MAX {
            return Err(InvalidPriority(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for Priority {
    type Error = InvalidPriority;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u16 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PrioritizedJob {
    pub job_group_id: JobGroupId,
    pub job_group_priority: Priority,
    pub job_id: JobId,
    pub job_priority: Priority,
}

impl PrioritizedJob {
    /// A job in a group of its own.
    pub fn standalone(job_id: JobId, priority: Priority) -> Self {
        Self {
            job_group_id: JobGroupId::new(job_id.as_str()),
            job_group_priority: priority,
            job_id,
            job_priority: priority,
        }
    }
}

/// A job's priorities as submitted, before range validation.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PrioritizedJobRequest {
    pub job_group_id: JobGroupId,
    pub job_group_priority: u16,
    pub job_id: JobId,
    pub job_priority: u16,
}

impl PrioritizedJobRequest {
    pub fn validate(self) -> Result<PrioritizedJob, InvalidPriority> {
        let Self {
            job_group_id,
            job_group_priority,
            job_id,
            job_priority,
        } = self;
        Ok(PrioritizedJob {
            job_group_id,
            job_group_priority: Priority::new(job_group_priority)?,
            job_id,
            job_priority: Priority::new(job_priority)?,
        })
    }
}

impl From<PrioritizedJob> for PrioritizedJobRequest {
    fn from(job: PrioritizedJob) -> Self {
        Self {
            job_group_id: job.job_group_id,
            job_group_priority: job.job_group_priority.value(),
            job_id: job.job_id,
            job_priority: job.job_priority.value(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Hash, PartialEq, Eq, Debug)]
pub enum CapabilityConstraint {
    Present,
    Absent,
    Equal(String),
    NotEqual(String),
}

#[derive(Serialize, Deserialize, Clone, Hash, PartialEq, Eq, Debug)]
pub struct CapabilityRequirement {
    pub name: String,
    pub constraint: CapabilityConstraint,
}

impl CapabilityRequirement {
    pub fn new(name: impl Into<String>, constraint: CapabilityConstraint) -> Self {
        Self {
            name: name.into(),
            constraint,
        }
    }

    pub fn is_satisfied_by(&self, capabilities: &WorkerCapabilities) -> bool {
        let value = capabilities.get(&self.name);
        match (&self.constraint, value) {
            (CapabilityConstraint::Present, value) => value.is_some(),
            (CapabilityConstraint::Absent, value) => value.is_none(),
            (CapabilityConstraint::Equal(expected), Some(value)) => expected == value,
            (CapabilityConstraint::Equal(_), None) => false,
            (CapabilityConstraint::NotEqual(expected), Some(value)) => expected != value,
            (CapabilityConstraint::NotEqual(_), None) => true,
        }
    }
}

/// Attributes a worker declares about itself, like `os.version = 16.4`.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq, Debug)]
#[serde(transparent)]
pub struct WorkerCapabilities(BTreeMap<String, String>);

impl WorkerCapabilities {
    pub fn new(capabilities: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(capabilities.into_iter().collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn satisfies(&self, requirements: &[CapabilityRequirement]) -> bool {
        requirements.iter().all(|req| req.is_satisfied_by(self))
    }
}

/// Where failed tests of a bucket are retried.
#[derive(Serialize, Deserialize, Clone, Copy, Hash, PartialEq, Eq, Debug, Default)]
pub enum RetryMode {
    /// The worker re-runs failed tests itself; the queue never re-enqueues them.
    #[default]
    RetryOnWorker,
    /// The worker runs each test once and the queue re-enqueues failures as new buckets.
    RetryThroughQueue,
}

#[derive(Serialize, Deserialize, Clone, Hash, PartialEq, Eq, Debug)]
pub struct TestEntry {
    pub name: TestName,
}

impl TestEntry {
    pub fn new(name: impl Into<TestName>) -> Self {
        Self { name: name.into() }
    }
}

/// Locations of the build products a worker needs to run tests.
#[derive(Serialize, Deserialize, Clone, Hash, PartialEq, Eq, Debug)]
pub struct BuildArtifacts {
    pub test_bundle: String,
    pub app_bundle: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("build artifacts are missing a test bundle")]
    MissingTestBundle,
    #[error("capability requirement has an empty name")]
    EmptyCapabilityName,
}

/// Everything needed to run a set of tests, besides the tests themselves.
#[derive(Serialize, Deserialize, Clone, Hash, PartialEq, Eq, Debug)]
pub struct RunSettings {
    pub number_of_retries: u32,
    pub retry_mode: RetryMode,
    pub capability_requirements: Vec<CapabilityRequirement>,
    pub environment: BTreeMap<String, String>,
    pub test_timeout: Duration,
    pub build_artifacts: BuildArtifacts,
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.build_artifacts.test_bundle.trim().is_empty() {
            return Err(SettingsError::MissingTestBundle);
        }
        if self
            .capability_requirements
            .iter()
            .any(|req| req.name.is_empty())
        {
            return Err(SettingsError::EmptyCapabilityName);
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct TestEntryConfiguration {
    pub test_entry: TestEntry,
    pub settings: RunSettings,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Bucket {
    bucket_id: BucketId,
    tests: Vec<TestEntry>,
    settings: RunSettings,
}

impl Bucket {
    pub fn new(tests: Vec<TestEntry>, settings: RunSettings) -> Self {
        Self {
            bucket_id: BucketId::unique(),
            tests,
            settings,
        }
    }

    /// A fresh bucket with the same settings, running only `tests`.
    pub fn with_tests(&self, tests: Vec<TestEntry>) -> Self {
        Self::new(tests, self.settings.clone())
    }

    pub fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    pub fn tests(&self) -> &[TestEntry] {
        &self.tests
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn test_names(&self) -> impl Iterator<Item = &TestName> {
        self.tests.iter().map(|entry| &entry.name)
    }
}

/// How the tests of a job are split into buckets.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScheduleStrategy {
    /// One test per bucket.
    Individual,
    /// All tests sharing settings in one bucket.
    Unsplit,
    /// Buckets of at most this many tests.
    FixedBucketSize(usize),
    /// As many buckets as there are registered workers.
    EquallyDivided,
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{BuildArtifacts, RetryMode, RunSettings};
    use std::time::Duration;

    pub fn settings() -> RunSettings {
        RunSettings {
            number_of_retries: 0,
            retry_mode: RetryMode::RetryOnWorker,
            capability_requirements: vec![],
            environment: Default::default(),
            test_timeout: Duration::from_secs(60),
            build_artifacts: BuildArtifacts {
                test_bundle: "/builds/AppTests.xctest".to_owned(),
                app_bundle: None,
            },
        }
    }
}
