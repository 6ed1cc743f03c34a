pub mod atomic;
pub mod error;
pub mod log_assert;
pub mod net_protocol;
pub mod retry;
pub mod server_shutdown;
pub mod time;

/// Version of the bq protocol spoken by this build. Queues and workers must agree on it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
