use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

/// Bucket queue
///
/// Distributes test buckets from one queue to a fleet of workers.
#[derive(Parser)]
#[clap(version)]
pub struct Cli {
    /// Path to a TOML config file. Defaults to `$XDG_CONFIG_HOME/bq/config.toml` when that
    /// file exists.
    #[clap(long, global = true, env = "BQ_CONFIG")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Starts a queue and serves it until interrupted.
    Queue {
        /// Host/port IP address to bind the queue to.
        /// When not specified anywhere, an arbitrary open port on 0.0.0.0 is chosen.
        #[clap(long, env = "BQ_BIND")]
        bind: Option<SocketAddr>,

        /// Number of buckets a worker runs at once, unless overridden for that worker.
        #[clap(long)]
        default_parallelism: Option<usize>,

        /// Stop workers once every scheduled job has been fully run, instead of having them
        /// poll forever.
        #[clap(long)]
        wait_for_depletion: bool,
    },
    /// Starts a worker that runs buckets from a queue until the queue has no more work.
    Work {
        /// Address of the queue to connect to.
        #[clap(long, env = "BQ_QUEUE_ADDR")]
        queue_addr: Option<SocketAddr>,

        /// Identity of this worker. Defaults to the host name and process id.
        #[clap(long, env = "BQ_WORKER_ID")]
        worker_id: Option<String>,

        /// A capability of this worker, as `name=value`. May be repeated.
        #[clap(long = "capability", value_parser = parse_capability)]
        capabilities: Vec<(String, String)>,

        /// Most buckets to run at once, whatever the queue asks for.
        /// Defaults to the number of CPUs.
        #[clap(long)]
        max_parallelism: Option<usize>,

        /// Work against a queue of a different version.
        #[clap(long)]
        allow_version_mismatch: bool,

        /// The command to run each test with; the test name is appended to it.
        #[clap(last = true)]
        runner_command: Vec<String>,
    },
}

fn parse_capability(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected `name=value`, got `{raw}`")),
    }
}
