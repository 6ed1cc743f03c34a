use std::sync::{atomic::AtomicUsize, Arc};

use bq_utils::atomic;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

/// Counts execution slots of a scheduler that have not retired yet.
pub struct LiveCount {
    count: Arc<AtomicUsize>,
    completed_signal_rx_handle: Option<JoinHandle<()>>,
    rx_all_completed: Option<oneshot::Receiver<()>>,
}

impl LiveCount {
    /// `count` must be at least one, otherwise [LiveCount::wait] never resolves.
    pub fn new(count: usize) -> (Self, CompletedSignaler) {
        debug_assert!(count > 0);

        let (tx_completed, mut rx_completed) = mpsc::channel(count.max(1));
        let (tx_all_completed, rx_all_completed) = oneshot::channel();
        let count = Arc::new(AtomicUsize::new(count));

        let completed_signals_handler = {
            let count = count.clone();
            tokio::spawn(async move {
                while rx_completed.recv().await.is_some() {
                    let prev_val = count.fetch_sub(1, atomic::ORDERING);
                    if prev_val == 1 {
                        break;
                    }
                }

                // The receiver may be dropped without being awaited.
                let _ = tx_all_completed.send(());
            })
        };

        let me = Self {
            count,
            completed_signal_rx_handle: Some(completed_signals_handler),
            rx_all_completed: Some(rx_all_completed),
        };
        let signaler = CompletedSignaler { tx_completed };

        (me, signaler)
    }

    /// Resolves when every slot has retired, or every signaler was dropped.
    /// Cancel-safe.
    pub async fn wait(&mut self) {
        if let Some(rx_all_completed) = &mut self.rx_all_completed {
            let _ = rx_all_completed.await;
            self.rx_all_completed = None;
        }
        if let Some(handle) = &mut self.completed_signal_rx_handle {
            if let Err(error) = handle.await {
                tracing::error!(%error, "live count handler did not complete");
            }
            self.completed_signal_rx_handle = None;
        }
    }

    /// Number of live slots at this instant.
    pub fn read(&self) -> usize {
        self.count.load(atomic::ORDERING)
    }
}

/// Tells a [LiveCount] that one slot has retired.
#[derive(Clone)]
pub struct CompletedSignaler {
    tx_completed: mpsc::Sender<()>,
}

impl CompletedSignaler {
    pub async fn completed(self) {
        let _ = self.tx_completed.send(()).await;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::LiveCount;

    #[tokio::test]
    async fn smoke() {
        let count = 10;

        let (mut live_count, signal) = LiveCount::new(count);
        assert_eq!(live_count.read(), count);

        let handle = tokio::spawn(async move {
            for _ in 1..count {
                signal.clone().completed().await;
            }
            signal.completed().await;
        });

        live_count.wait().await;
        assert_eq!(live_count.read(), 0);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn does_not_resolve_until_all_slots_retire() {
        let count = 10;

        let (mut live_count, signal) = LiveCount::new(count);

        for _ in 1..count {
            signal.clone().completed().await;
        }

        tokio::select! {
            _ = live_count.wait() => panic!("{}", live_count.read()),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert_eq!(live_count.read(), 1);

        signal.completed().await;
        live_count.wait().await;
        assert_eq!(live_count.read(), 0);
    }

    #[tokio::test]
    async fn cancelled_waits_can_be_resumed() {
        let count = 4;

        let (mut live_count, signal) = LiveCount::new(count);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            for _ in 0..count {
                signal.clone().completed().await;
            }
        });

        loop {
            tokio::select! {
                _ = live_count.wait() => break,
                _ = tokio::time::sleep(Duration::from_micros(10)) => {}
            }
        }
        handle.await.unwrap();
    }
}
