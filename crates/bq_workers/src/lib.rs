pub mod bucket_source;
pub mod client;
pub mod command_runner;
pub mod heartbeat;
pub mod liveness;
pub mod registration;
pub mod resource_guard;
pub mod results_handler;
pub mod runner;
pub mod scheduler;
pub mod worker;
