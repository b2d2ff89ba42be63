use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::LocalTrigger;

/// Depth of the delayed-trigger output channel.
pub const DELAYED_CHANNEL_SIZE: usize = 10_000;

struct Delayed {
    release_at: Instant,
    triggers: Vec<LocalTrigger>,
}

/// Holds local trigger batches back for a fixed delay, releasing them in
/// arrival order.
pub struct Delayer {
    delay: Duration,
    incoming: mpsc::Receiver<Vec<LocalTrigger>>,
    outgoing: mpsc::Sender<Vec<LocalTrigger>>,
    pending: VecDeque<Delayed>,
}

impl Delayer {
    /// Returns the delayer and the receiver its released batches arrive on.
    pub fn new(
        delay: Duration,
        incoming: mpsc::Receiver<Vec<LocalTrigger>>,
    ) -> (Self, mpsc::Receiver<Vec<LocalTrigger>>) {
        let (outgoing, rx) = mpsc::channel(DELAYED_CHANNEL_SIZE);
        let delayer = Self {
            delay,
            incoming,
            outgoing,
            pending: VecDeque::new(),
        };
        (delayer, rx)
    }

    /// Runs until cancelled or until the input closes and every held batch
    /// has been released.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut input_open = true;
        loop {
            let next_release = self.pending.front().map(|d| d.release_at);
            if !input_open && next_release.is_none() {
                debug!("trigger delayer drained");
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                received = self.incoming.recv(), if input_open => match received {
                    Some(triggers) => self.pending.push_back(Delayed {
                        release_at: Instant::now() + self.delay,
                        triggers,
                    }),
                    None => input_open = false,
                },
                _ = sleep_until(next_release.unwrap_or_else(Instant::now)), if next_release.is_some() => {
                    if !self.release_due().await {
                        return;
                    }
                }
            }
        }
    }

    /// Forwards every batch whose delay has elapsed. Returns false once the
    /// consumer is gone.
    async fn release_due(&mut self) -> bool {
        let now = Instant::now();
        while self.pending.front().is_some_and(|d| d.release_at <= now) {
            let Some(delayed) = self.pending.pop_front() else {
                break;
            };
            if self.outgoing.send(delayed.triggers).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> Vec<LocalTrigger> {
        (0..n as u64)
            .map(|i| LocalTrigger {
                queue_id: 1,
                base_trace_id: i + 1,
                trace_id: i + 1,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayer_holds_until_delay_elapsed() {
        let (tx, rx) = mpsc::channel(1000);
        let (delayer, mut out) = Delayer::new(Duration::from_secs(1), rx);
        let cancel = CancellationToken::new();
        tokio::spawn(delayer.run(cancel.clone()));

        tx.send(batch(3)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(out.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(out.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(out.try_recv().unwrap().len(), 3);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayer_preserves_order() {
        let (tx, rx) = mpsc::channel(1000);
        let (delayer, mut out) = Delayer::new(Duration::from_secs(1), rx);
        let cancel = CancellationToken::new();
        tokio::spawn(delayer.run(cancel.clone()));

        for i in 0..10 {
            tx.send(batch(i)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        for i in 0..10 {
            assert_eq!(out.try_recv().unwrap().len(), i);
        }
        assert!(out.try_recv().is_err());

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayer_drains_after_input_closes() {
        let (tx, rx) = mpsc::channel(10);
        let (delayer, mut out) = Delayer::new(Duration::from_millis(50), rx);
        let handle = tokio::spawn(delayer.run(CancellationToken::new()));

        tx.send(batch(2)).await.unwrap();
        drop(tx);

        assert_eq!(out.recv().await.unwrap().len(), 2);
        handle.await.unwrap();
        assert!(out.recv().await.is_none());
    }
}
