//! The bucket queue: holds scheduled test buckets, hands them to polling workers one claim at a
//! time, and reclaims buckets from workers that stop responding.

pub mod balancing;
pub mod bucket_queue;
pub mod config;
pub mod enqueuer;
pub mod queue;
pub mod server;
pub mod splitting;
pub mod stuck_poller;
pub mod test_history;
pub mod worker_configurations;
pub mod worker_tracking;

#[cfg(test)]
mod test_support;
