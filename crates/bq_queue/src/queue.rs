use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bq_utils::net_protocol::ids::PayloadSignature;
use bq_utils::server_shutdown::ShutdownManager;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::balancing::{BalancingBucketQueue, SharedBalancingQueue};
use crate::config::QueueConfig;
use crate::server::{QueueServer, QueueServerError};
use crate::stuck_poller::StuckBucketsPoller;
use crate::worker_configurations::WorkerConfigurations;
use crate::worker_tracking::WorkerAlivenessTracker;

/// A running queue: the request server plus the stuck-bucket sweep, sharing one engine.
pub struct Queue {
    shutdown_manager: ShutdownManager,

    queue: SharedBalancingQueue,
    payload_signature: PayloadSignature,

    server_addr: SocketAddr,
    server_handle: Option<JoinHandle<Result<(), QueueServerError>>>,
    poller_handle: Option<JoinHandle<()>>,

    active: bool,
}

#[derive(Debug, Error)]
pub enum QueueProcessError {
    #[error("{0}")]
    Server(#[from] QueueServerError),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("queue task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Queue {
    pub async fn start(config: QueueConfig) -> Result<Self, QueueProcessError> {
        start_queue(config).await
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn payload_signature(&self) -> &PayloadSignature {
        &self.payload_signature
    }

    /// The engine behind the server, for in-process inspection.
    pub fn balancing_queue(&self) -> &SharedBalancingQueue {
        &self.queue
    }

    /// Sends a signal to shutdown immediately, and waits for the server and sweep to stop.
    #[instrument(level = "trace", skip(self))]
    pub async fn shutdown(&mut self) -> Result<(), QueueProcessError> {
        debug_assert!(self.active);

        self.active = false;

        // Tasks that already stopped are not listening anymore; they are joined all the same.
        if let Err(error) = self.shutdown_manager.shutdown_immediately() {
            tracing::warn!(%error, "no queue task received the shutdown signal");
        }

        let server_exit = match self.server_handle.take() {
            Some(server_handle) => server_handle.await,
            None => Ok(Ok(())),
        };
        let poller_exit = match self.poller_handle.take() {
            Some(poller_handle) => poller_handle.await,
            None => Ok(()),
        };

        server_exit??;
        poller_exit?;

        tracing::info!("queue shut down");
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if self.active {
            // Our user never called shutdown; at least stop the tasks.
            let _ = self.shutdown_manager.shutdown_immediately();
        }
    }
}

async fn start_queue(config: QueueConfig) -> Result<Queue, QueueProcessError> {
    let QueueConfig {
        bind_addr,
        aliveness,
        balancing,
        stuck_bucket_sweep_interval,
        default_parallelism,
        parallelism_overrides,
        clock,
    } = config;

    let mut shutdown_manager = ShutdownManager::default();

    let tracker = Arc::new(WorkerAlivenessTracker::new(aliveness, clock));
    let queue: SharedBalancingQueue = Arc::new(BalancingBucketQueue::new(tracker, balancing));
    let payload_signature = PayloadSignature::new_random();

    let listener = TcpListener::bind(bind_addr).await?;
    let server_addr = listener.local_addr()?;

    let server_shutdown_rx = shutdown_manager.add_receiver();
    let server_handle = tokio::spawn({
        let server = QueueServer::new(
            queue.clone(),
            WorkerConfigurations {
                report_alive_interval: aliveness.report_alive_interval,
                check_again_interval: balancing.check_again_interval,
                default_parallelism,
                parallelism_overrides,
            },
            payload_signature.clone(),
        );
        server.start(listener, server_shutdown_rx)
    });

    let poller_shutdown_rx = shutdown_manager.add_receiver();
    let poller_handle = tokio::spawn({
        let poller = StuckBucketsPoller::new(queue.clone(), stuck_bucket_sweep_interval);
        poller.start(poller_shutdown_rx)
    });

    tracing::info!(%server_addr, "queue started");

    Ok(Queue {
        shutdown_manager,
        queue,
        payload_signature,
        server_addr,
        server_handle: Some(server_handle),
        poller_handle: Some(poller_handle),
        active: true,
    })
}
