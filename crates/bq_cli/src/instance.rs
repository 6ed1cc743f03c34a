use bq_queue::config::QueueConfig;
use bq_queue::queue::Queue;
use futures::StreamExt;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;

/// Serves a queue until the process is asked to terminate.
pub async fn run_queue_until_signalled(config: QueueConfig) -> anyhow::Result<()> {
    let mut queue = Queue::start(config).await?;

    tracing::info!(addr=%queue.server_addr(), "queue active");
    println!("Run the following to start a worker attached to the queue:");
    println!("\tbq work --queue-addr={} -- <test command>", queue.server_addr());

    let mut term_signals = Signals::new(TERM_SIGNALS)?;
    let handle = term_signals.handle();
    if let Some(signal) = term_signals.next().await {
        tracing::info!(signal, "shutting down queue");
    }
    handle.close();

    queue.shutdown().await?;
    tracing::debug!("queue shut down");
    Ok(())
}
