//! Shutdown signalling for long-running tasks, like the queue's request server or a worker's
//! bucket loop.

use std::io;

use tokio::sync::broadcast;

pub struct ShutdownManager {
    immediate_shutdown_tx: broadcast::Sender<()>,
    shutdown: bool,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        let (immediate_shutdown_tx, _) = broadcast::channel(1);

        Self {
            immediate_shutdown_tx,
            shutdown: false,
        }
    }
}

impl ShutdownManager {
    pub fn new_pair() -> (Self, ShutdownReceiver) {
        let mut manager = Self::default();
        let receiver = manager.add_receiver();
        (manager, receiver)
    }

    pub fn add_receiver(&mut self) -> ShutdownReceiver {
        ShutdownReceiver {
            immediate_shutdown_rx: self.immediate_shutdown_tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Notifies all receivers. Returns the number of receivers notified.
    pub fn shutdown_immediately(&mut self) -> io::Result<usize> {
        assert!(!self.shutdown, "shutdown requested twice");
        self.shutdown = true;
        self.immediate_shutdown_tx.send(()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "could not send shutdown message",
            )
        })
    }
}

pub struct ShutdownReceiver {
    immediate_shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownReceiver {
    /// Resolves once shutdown is requested. Cancel-safe.
    pub async fn recv_shutdown_immediately(&mut self) -> io::Result<()> {
        self.immediate_shutdown_rx
            .recv()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))
    }
}
