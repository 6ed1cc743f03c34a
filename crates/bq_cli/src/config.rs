//! The `bq` config file. Every value is optional; command-line flags win over the file, and the
//! file wins over built-in defaults.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use bq_queue::balancing::{BalancingSettings, NothingToDequeueBehavior};
use bq_queue::config::QueueConfig;
use bq_queue::worker_tracking::AlivenessSettings;
use bq_utils::net_protocol::ids::WorkerId;
use bq_utils::retry::RetryPolicy;
use etcetera::{app_strategy, AppStrategy, AppStrategyArgs};
use serde_derive::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BqConfig {
    pub queue: QueueSection,
    pub worker: WorkerSection,
}

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSection {
    pub bind: Option<SocketAddr>,
    pub report_alive_interval_secs: Option<u64>,
    pub report_alive_grace_secs: Option<u64>,
    pub stuck_bucket_sweep_interval_ms: Option<u64>,
    pub max_claim_age_secs: Option<u64>,
    pub check_again_interval_secs: Option<u64>,
    pub nothing_to_dequeue_behavior: Option<NothingToDequeueBehavior>,
    pub deleted_job_retention_secs: Option<u64>,
    pub completed_job_retention_secs: Option<u64>,
    pub default_parallelism: Option<usize>,
    pub parallelism_overrides: BTreeMap<String, usize>,
}

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    pub queue_addr: Option<SocketAddr>,
    pub worker_id: Option<String>,
    pub capabilities: BTreeMap<String, String>,
    pub request_retry_attempts: Option<usize>,
    pub request_retry_backoff_ms: Option<u64>,
    pub runner_command: Vec<String>,
    pub max_parallelism: Option<usize>,
    pub allow_version_mismatch: Option<bool>,
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let strategy = app_strategy::Xdg::new(AppStrategyArgs {
        top_level_domain: "dev".to_string(),
        author: "bq".to_string(),
        app_name: "bq".to_string(),
    })?;
    Ok(strategy.config_dir().join("config.toml"))
}

pub fn read_config(path: &Path) -> anyhow::Result<BqConfig> {
    let toml_str = fs::read_to_string(path)?;
    let config = toml::from_str(&toml_str)?;
    Ok(config)
}

/// Reads the config at `explicit`, which must exist, or else at the default location, which
/// may be missing.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<BqConfig> {
    if let Some(path) = explicit {
        return read_config(path)
            .map_err(|error| anyhow::anyhow!("reading config {}: {error}", path.display()));
    }

    let path = default_config_path()?;
    match fs::read_to_string(&path) {
        Ok(toml_str) => {
            tracing::debug!(path=%path.display(), "using config file");
            Ok(toml::from_str(&toml_str)?)
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(BqConfig::default()),
        Err(error) => Err(error.into()),
    }
}

impl QueueSection {
    pub fn queue_config(&self) -> QueueConfig {
        let defaults = QueueConfig::default();
        let aliveness = AlivenessSettings::default();
        let balancing = BalancingSettings::default();

        QueueConfig {
            bind_addr: self.bind.unwrap_or(defaults.bind_addr),
            aliveness: AlivenessSettings {
                report_alive_interval: secs_or(
                    self.report_alive_interval_secs,
                    aliveness.report_alive_interval,
                ),
                grace: secs_or(self.report_alive_grace_secs, aliveness.grace),
            },
            balancing: BalancingSettings {
                nothing_to_dequeue: self
                    .nothing_to_dequeue_behavior
                    .unwrap_or(balancing.nothing_to_dequeue),
                check_again_interval: secs_or(
                    self.check_again_interval_secs,
                    balancing.check_again_interval,
                ),
                max_claim_age: self.max_claim_age_secs.map(Duration::from_secs),
                deleted_job_retention: secs_or(
                    self.deleted_job_retention_secs,
                    balancing.deleted_job_retention,
                ),
                completed_job_retention: self
                    .completed_job_retention_secs
                    .map(Duration::from_secs)
                    .or(balancing.completed_job_retention),
            },
            stuck_bucket_sweep_interval: self
                .stuck_bucket_sweep_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stuck_bucket_sweep_interval),
            default_parallelism: self
                .default_parallelism
                .unwrap_or(defaults.default_parallelism),
            parallelism_overrides: self
                .parallelism_overrides
                .iter()
                .map(|(worker_id, parallelism)| (WorkerId::from(worker_id.as_str()), *parallelism))
                .collect::<HashMap<_, _>>(),
            clock: defaults.clock,
        }
    }
}

impl WorkerSection {
    pub fn request_retry(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy::new(
            self.request_retry_attempts.unwrap_or(defaults.max_attempts),
            self.request_retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.delay),
        )
    }
}

fn secs_or(secs: Option<u64>, default: Duration) -> Duration {
    secs.map(Duration::from_secs).unwrap_or(default)
}
