mod args;
mod config;
mod instance;
mod workers;

use std::process::ExitCode;

use bq_queue::balancing::NothingToDequeueBehavior;
use bq_utils::net_protocol::bucket::WorkerCapabilities;
use bq_utils::net_protocol::ids::WorkerId;
use bq_workers::worker::{WorkerConfig, WorkerExitStatus};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use args::{Cli, Command};

fn init_logging() {
    let env_filter = EnvFilter::try_from_env("BQ_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("BQ_LOG_JSON").map_or(false, |value| value == "1");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

fn main() -> anyhow::Result<ExitCode> {
    init_logging();

    let Cli { config, command } = Cli::parse();
    let file_config = config::load_config(config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match command {
        Command::Queue {
            bind,
            default_parallelism,
            wait_for_depletion,
        } => {
            let mut queue_config = file_config.queue.queue_config();
            if let Some(bind) = bind {
                queue_config.bind_addr = bind;
            }
            if let Some(default_parallelism) = default_parallelism {
                queue_config.default_parallelism = default_parallelism;
            }
            if wait_for_depletion {
                queue_config.balancing.nothing_to_dequeue =
                    NothingToDequeueBehavior::WaitForDepletion;
            }

            runtime.block_on(instance::run_queue_until_signalled(queue_config))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Work {
            queue_addr,
            worker_id,
            capabilities,
            max_parallelism,
            allow_version_mismatch,
            runner_command,
        } => {
            let worker_file = file_config.worker;

            let queue_addr = queue_addr.or(worker_file.queue_addr).ok_or_else(|| {
                anyhow::anyhow!("no queue address; pass --queue-addr or set worker.queue_addr")
            })?;
            let worker_id = worker_id
                .or_else(|| worker_file.worker_id.clone())
                .unwrap_or_else(default_worker_id);
            let runner_command = if runner_command.is_empty() {
                worker_file.runner_command.clone()
            } else {
                runner_command
            };

            let mut all_capabilities = worker_file.capabilities.clone();
            all_capabilities.extend(capabilities);

            let config = WorkerConfig {
                queue_addr,
                worker_id: WorkerId::new(worker_id),
                capabilities: WorkerCapabilities::new(all_capabilities),
                request_retry: worker_file.request_retry(),
                allow_version_mismatch: allow_version_mismatch
                    || worker_file.allow_version_mismatch.unwrap_or(false),
                max_parallelism: Some(
                    max_parallelism
                        .or(worker_file.max_parallelism)
                        .unwrap_or_else(num_cpus::get),
                ),
            };

            let exit = runtime.block_on(workers::run_worker_until_done(config, runner_command))?;
            match exit.status {
                WorkerExitStatus::Completed => Ok(ExitCode::SUCCESS),
                WorkerExitStatus::Error { .. } => Ok(ExitCode::FAILURE),
            }
        }
    }
}
