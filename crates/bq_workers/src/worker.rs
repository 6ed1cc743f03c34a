//! A worker process: registers with a queue, keeps reporting alive, and runs buckets until the
//! queue has nothing more for it.

use std::net::SocketAddr;
use std::sync::Arc;

use bq_utils::net_protocol::bucket::WorkerCapabilities;
use bq_utils::net_protocol::ids::WorkerId;
use bq_utils::retry::RetryPolicy;
use bq_utils::server_shutdown::ShutdownReceiver;
use bq_utils::VERSION;
use thiserror::Error;
use tokio::sync::watch;

use crate::bucket_source::QueueBucketSource;
use crate::client::{ClientError, QueueClient};
use crate::heartbeat::Heartbeat;
use crate::registration::Registration;
use crate::results_handler::QueueResultsSender;
use crate::runner::SharedTestRunner;
use crate::scheduler::{InFlightBuckets, Scheduler, SchedulerConfig, SchedulerExit};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_addr: SocketAddr,
    pub worker_id: WorkerId,
    pub capabilities: WorkerCapabilities,
    /// How requests to the queue are retried when the connection fails.
    pub request_retry: RetryPolicy,
    /// Work against a queue of a different version.
    pub allow_version_mismatch: bool,
    /// Upper bound on the parallelism the queue asks for.
    pub max_parallelism: Option<usize>,
}

impl WorkerConfig {
    pub fn new(queue_addr: SocketAddr, worker_id: WorkerId) -> Self {
        Self {
            queue_addr,
            worker_id,
            capabilities: WorkerCapabilities::default(),
            request_retry: RetryPolicy::default(),
            allow_version_mismatch: false,
            max_parallelism: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue runs version {queue_version}, but this worker is version {worker_version}")]
    VersionMismatch {
        queue_version: String,
        worker_version: String,
    },

    #[error("could not ask the queue for its version: {0}")]
    Version(#[source] ClientError),

    #[error("could not register with the queue: {0}")]
    Register(#[source] ClientError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum WorkerExitStatus {
    /// Every slot retired normally.
    Completed,
    Error { errors: Vec<String> },
}

#[derive(Debug)]
#[must_use]
pub struct WorkerExit {
    pub status: WorkerExitStatus,
    pub buckets_run: usize,
}

impl From<SchedulerExit> for WorkerExit {
    fn from(exit: SchedulerExit) -> Self {
        let SchedulerExit {
            buckets_run,
            errors,
        } = exit;
        let status = if errors.is_empty() {
            WorkerExitStatus::Completed
        } else {
            WorkerExitStatus::Error { errors }
        };
        Self {
            status,
            buckets_run,
        }
    }
}

/// Runs a worker to completion.
///
/// The worker stops asking for buckets when `shutdown` fires, but finishes and reports the
/// buckets it is running.
pub async fn run_worker(
    config: WorkerConfig,
    runner: SharedTestRunner,
    mut shutdown: ShutdownReceiver,
) -> Result<WorkerExit, WorkerError> {
    let WorkerConfig {
        queue_addr,
        worker_id,
        capabilities,
        request_retry,
        allow_version_mismatch,
        max_parallelism,
    } = config;

    let client = QueueClient::new(queue_addr, request_retry);

    let queue_version = client.queue_version().await.map_err(WorkerError::Version)?;
    if queue_version != VERSION {
        if !allow_version_mismatch {
            return Err(WorkerError::VersionMismatch {
                queue_version,
                worker_version: VERSION.to_string(),
            });
        }
        tracing::warn!(%queue_version, worker_version=VERSION, "working against a queue of another version");
    }

    let registration = Arc::new(
        Registration::register(client, worker_id)
            .await
            .map_err(WorkerError::Register)?,
    );
    let parallelism = match max_parallelism {
        Some(max) => registration.configuration().parallelism.min(max),
        None => registration.configuration().parallelism,
    };

    let in_flight = InFlightBuckets::default();
    let heartbeat = Heartbeat::start(registration.clone(), in_flight.clone());

    let (tx_stop, rx_stop) = watch::channel(false);
    let stop_listener = tokio::spawn(async move {
        if shutdown.recv_shutdown_immediately().await.is_ok() {
            tracing::info!("worker asked to stop; finishing buckets in flight");
            let _ = tx_stop.send(true);
        }
    });

    let scheduler = Scheduler::start(
        SchedulerConfig::new(parallelism),
        Arc::new(QueueBucketSource::new(
            registration.clone(),
            capabilities,
            rx_stop,
        )),
        runner,
        Arc::new(QueueResultsSender::new(registration.clone())),
        in_flight,
    );
    let exit = scheduler.join().await;

    stop_listener.abort();
    heartbeat.stop().await;

    tracing::info!(worker_id=?registration.worker_id(), buckets_run=exit.buckets_run, "worker finished");
    Ok(exit.into())
}
