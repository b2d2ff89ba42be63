//! Token bucket with debt.
//!
//! Capacity equals one second of refill. `take` always succeeds and may leave
//! the bucket negative; callers decide whether a negative balance means
//! "limited" or compute how long to wait before the debt is repaid.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens added per second; also the burst capacity.
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket refilled at `rate` tokens per second.
    ///
    /// A non-positive rate yields a bucket that never refills.
    pub fn new(rate: f64, now: Instant) -> Self {
        let rate = rate.max(0.0);
        Self {
            rate,
            tokens: rate,
            last_refill: now,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&mut self, now: Instant) {
        let Some(elapsed) = now.checked_duration_since(self.last_refill) else {
            return;
        };
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.rate);
        self.last_refill = now;
    }

    /// Current balance. Negative while the bucket is in debt.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Debits `count` tokens and returns how long until the balance is
    /// non-negative again.
    pub fn take(&mut self, count: f64, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= count;
        if self.tokens >= 0.0 || self.rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-self.tokens / self.rate)
    }

    /// Debits `count` tokens, sleeping until the debt is repaid.
    pub async fn wait(&mut self, count: f64) {
        let delay = self.take(count, Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
