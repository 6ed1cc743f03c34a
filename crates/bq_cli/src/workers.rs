use std::sync::Arc;

use bq_utils::server_shutdown::ShutdownManager;
use bq_workers::command_runner::CommandRunner;
use bq_workers::worker::{run_worker, WorkerConfig, WorkerExit, WorkerExitStatus};
use futures::StreamExt;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;

/// Runs one worker until the queue has no more work for it, or the process is asked to
/// terminate. On termination the worker finishes the buckets it is running first.
pub async fn run_worker_until_done(
    config: WorkerConfig,
    runner_command: Vec<String>,
) -> anyhow::Result<WorkerExit> {
    let runner = Arc::new(CommandRunner::new(runner_command)?);
    let (mut shutdown_manager, shutdown_rx) = ShutdownManager::new_pair();

    let mut term_signals = Signals::new(TERM_SIGNALS)?;
    let signals_handle = term_signals.handle();
    let signal_listener = tokio::spawn(async move {
        if let Some(signal) = term_signals.next().await {
            tracing::info!(signal, "stopping worker");
            if let Err(error) = shutdown_manager.shutdown_immediately() {
                tracing::warn!(%error, "worker already stopped");
            }
        }
    });

    tracing::info!(worker_id=%config.worker_id, queue_addr=%config.queue_addr, "starting worker");
    let exit = run_worker(config, runner, shutdown_rx).await;

    signals_handle.close();
    signal_listener.abort();

    let exit = exit?;
    match &exit.status {
        WorkerExitStatus::Completed => {
            tracing::info!(buckets_run = exit.buckets_run, "worker completed")
        }
        WorkerExitStatus::Error { errors } => {
            for error in errors {
                tracing::error!(%error, "worker error");
            }
        }
    }
    Ok(exit)
}
