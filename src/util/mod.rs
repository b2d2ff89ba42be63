pub mod lru;
pub mod priority_tree;
pub mod token_bucket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Largest number of channel items folded into one outgoing request.
pub const SEND_BATCH_LIMIT: usize = 100;

/// Waits for one item, then drains up to `limit` items in total without
/// blocking. Returns `None` on cancellation or once the channel is closed
/// and empty.
pub async fn recv_batch<T>(
    rx: &mut mpsc::Receiver<T>,
    limit: usize,
    cancel: &CancellationToken,
) -> Option<Vec<T>> {
    let first = tokio::select! {
        _ = cancel.cancelled() => return None,
        item = rx.recv() => item?,
    };

    let mut batch = Vec::with_capacity(limit.min(16));
    batch.push(first);
    while batch.len() < limit {
        match rx.try_recv() {
            Ok(item) => batch.push(item),
            Err(_) => break,
        }
    }
    Some(batch)
}

/// Counts dropped work and decides when the drop should be logged.
///
/// The first drop is reported immediately; afterwards at most one report per
/// `interval`, carrying everything dropped since the previous report.
#[derive(Debug)]
pub struct DropThrottle {
    pending: AtomicU64,
    total: AtomicU64,
    interval: Duration,
    last_report: Mutex<Option<Instant>>,
}

impl DropThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: AtomicU64::new(0),
            total: AtomicU64::new(0),
            interval,
            last_report: Mutex::new(None),
        }
    }

    /// Records `n` dropped items. Returns the count to log, if a log line is due.
    pub fn record(&self, n: u64) -> Option<u64> {
        self.pending.fetch_add(n, Ordering::Relaxed);
        self.total.fetch_add(n, Ordering::Relaxed);

        // Another caller holding the lock is already reporting.
        let mut last = self.last_report.try_lock()?;
        let now = Instant::now();
        let due = match *last {
            None => true,
            Some(at) => now.duration_since(at) >= self.interval,
        };
        if !due {
            return None;
        }
        *last = Some(now);
        Some(self.pending.swap(0, Ordering::Relaxed))
    }

    /// Total items dropped since creation.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for DropThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
