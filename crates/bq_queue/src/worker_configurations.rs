use std::collections::HashMap;
use std::time::Duration;

use bq_utils::net_protocol::ids::{PayloadSignature, WorkerId};
use bq_utils::net_protocol::queue::WorkerConfiguration;

/// What each registering worker is told: shared intervals, and a parallelism that may be
/// overridden per worker.
#[derive(Debug, Clone)]
pub struct WorkerConfigurations {
    pub report_alive_interval: Duration,
    pub check_again_interval: Duration,
    pub default_parallelism: usize,
    pub parallelism_overrides: HashMap<WorkerId, usize>,
}

impl WorkerConfigurations {
    pub fn for_worker(
        &self,
        worker_id: &WorkerId,
        payload_signature: &PayloadSignature,
    ) -> WorkerConfiguration {
        let parallelism = self
            .parallelism_overrides
            .get(worker_id)
            .copied()
            .unwrap_or(self.default_parallelism)
            .max(1);

        WorkerConfiguration {
            report_alive_interval: self.report_alive_interval,
            check_again_interval: self.check_again_interval,
            parallelism,
            payload_signature: payload_signature.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::WorkerConfigurations;
    use bq_utils::net_protocol::ids::{PayloadSignature, WorkerId};
    use std::time::Duration;

    #[test]
    fn per_worker_parallelism_overrides_default() {
        let configurations = WorkerConfigurations {
            report_alive_interval: Duration::from_secs(30),
            check_again_interval: Duration::from_secs(10),
            default_parallelism: 2,
            parallelism_overrides: [(WorkerId::from("big"), 8), (WorkerId::from("zero"), 0)]
                .into_iter()
                .collect(),
        };
        let signature = PayloadSignature::new_random();

        assert_eq!(configurations.for_worker(&"small".into(), &signature).parallelism, 2);
        assert_eq!(configurations.for_worker(&"big".into(), &signature).parallelism, 8);
        assert_eq!(configurations.for_worker(&"zero".into(), &signature).parallelism, 1);
        assert_eq!(
            configurations.for_worker(&"big".into(), &signature).payload_signature,
            signature
        );
    }
}
