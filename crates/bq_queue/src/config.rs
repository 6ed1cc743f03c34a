use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bq_utils::net_protocol::ids::WorkerId;
use bq_utils::time::{SharedClock, SystemClock};

use crate::balancing::BalancingSettings;
use crate::worker_tracking::AlivenessSettings;

/// Configures initialization of the queue.
pub struct QueueConfig {
    /// Address the queue server binds to. Binds to any port if the port is `0`.
    pub bind_addr: SocketAddr,
    pub aliveness: AlivenessSettings,
    pub balancing: BalancingSettings,
    /// How often stuck buckets are looked for.
    pub stuck_bucket_sweep_interval: Duration,
    pub default_parallelism: usize,
    pub parallelism_overrides: HashMap<WorkerId, usize>,
    pub clock: SharedClock,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            aliveness: AlivenessSettings::default(),
            balancing: BalancingSettings::default(),
            stuck_bucket_sweep_interval: Duration::from_secs(1),
            default_parallelism: 1,
            parallelism_overrides: HashMap::new(),
            clock: SystemClock::shared(),
        }
    }
}
