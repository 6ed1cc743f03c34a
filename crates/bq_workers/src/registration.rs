use bq_utils::net_protocol::ids::{PayloadSignature, WorkerId};
use bq_utils::net_protocol::queue::WorkerConfiguration;
use parking_lot::RwLock;

use crate::client::{ClientError, QueueClient};

/// This worker's standing with the queue. Shared by the heartbeat and the execution slots,
/// either of which may find out the queue has forgotten the worker and register it again.
pub struct Registration {
    client: QueueClient,
    worker_id: WorkerId,
    configuration: RwLock<WorkerConfiguration>,
}

impl Registration {
    pub async fn register(client: QueueClient, worker_id: WorkerId) -> Result<Self, ClientError> {
        let configuration = client.register_worker(&worker_id).await?;
        tracing::info!(?worker_id, parallelism=configuration.parallelism, "registered with queue");

        Ok(Self {
            client,
            worker_id,
            configuration: RwLock::new(configuration),
        })
    }

    pub fn client(&self) -> &QueueClient {
        &self.client
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn configuration(&self) -> WorkerConfiguration {
        self.configuration.read().clone()
    }

    pub fn payload_signature(&self) -> PayloadSignature {
        self.configuration.read().payload_signature.clone()
    }

    pub async fn reregister(&self) -> Result<(), ClientError> {
        let configuration = self.client.register_worker(&self.worker_id).await?;
        tracing::info!(worker_id=?self.worker_id, "registered with queue again");
        *self.configuration.write() = configuration;
        Ok(())
    }
}
