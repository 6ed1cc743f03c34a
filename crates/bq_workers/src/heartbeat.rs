//! Periodic report-alive to the queue, listing the buckets this worker is running.

use std::sync::Arc;
use std::time::Duration;

use bq_utils::net_protocol::queue::QueueError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registration::Registration;
use crate::scheduler::InFlightBuckets;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct Heartbeat {
    tx_stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts reporting immediately, then every report-alive interval the queue asked for.
    pub fn start(registration: Arc<Registration>, in_flight: InFlightBuckets) -> Self {
        let (tx_stop, mut rx_stop) = oneshot::channel();
        let report_alive_interval = registration
            .configuration()
            .report_alive_interval
            .max(MIN_INTERVAL);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(report_alive_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut rx_stop => break,
                }
                report_alive(&registration, &in_flight).await;
            }
        });

        Self { tx_stop, handle }
    }

    pub async fn stop(self) {
        let _ = self.tx_stop.send(());
        if let Err(error) = self.handle.await {
            tracing::error!(%error, "heartbeat task did not stop cleanly");
        }
    }
}

async fn report_alive(registration: &Registration, in_flight: &InFlightBuckets) {
    let worker_id = registration.worker_id();
    let processing = in_flight.snapshot();

    let reported = registration
        .client()
        .report_alive(worker_id, processing, &registration.payload_signature())
        .await;

    match reported {
        Ok(()) => tracing::trace!(?worker_id, "reported alive"),
        Err(error) => match error.protocol() {
            Some(QueueError::WorkerNotRegistered(_)) => {
                tracing::warn!(?worker_id, "queue does not know this worker");
                if let Err(error) = registration.reregister().await {
                    tracing::error!(?worker_id, %error, "could not register again");
                }
            }
            Some(QueueError::WorkerBlocked(_)) => {
                tracing::debug!(?worker_id, "queue has blocked this worker")
            }
            _ => tracing::warn!(?worker_id, %error, "could not report alive"),
        },
    }
}
