//! Token-bucket throttle for outbound classifier calls.
//!
//! Refill law: every full `refill_period` elapsed since the last refill adds
//! `capacity` tokens, capped at `capacity`. A caller finding the bucket
//! empty waits with exponential backoff (1s doubling to 30s by default),
//! each wait cut short at the next refill boundary. Whoever performs a
//! refill wakes every other waiter so they re-check immediately.

use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::ConfigError;

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl BucketState {
    /// Apply the refill law. Returns true when tokens were added.
    fn refill(&mut self, now: Instant, capacity: u32, period: Duration) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = elapsed.as_nanos() / period.as_nanos();
        if periods == 0 {
            return false;
        }
        let added = periods.saturating_mul(u128::from(capacity));
        let tokens = (u128::from(self.tokens) + added).min(u128::from(capacity));
        self.tokens = tokens as u32;
        self.last_refill = now;
        true
    }
}

/// Token bucket shared by all concurrent classifier calls.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    refilled: Notify,
    capacity: u32,
    refill_period: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl RateLimiter {
    /// Create a full bucket. Zero capacity or a zero period could never
    /// grant a token and is rejected.
    pub fn new(capacity: u32, refill_period: Duration) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rate_capacity".into(),
                message: "token bucket capacity must be at least 1".into(),
            });
        }
        if refill_period.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "refill_period".into(),
                message: "refill period must be non-zero".into(),
            });
        }
        Ok(Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            refilled: Notify::new(),
            capacity,
            refill_period,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.rate_capacity, config.refill_period)?
            .with_backoff(config.rate_backoff_initial, config.rate_backoff_max))
    }

    /// Override the wait backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial.max(Duration::from_millis(1));
        self.backoff_max = max.max(self.backoff_initial);
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Tokens currently available (after applying any due refill).
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        if state.refill(Instant::now(), self.capacity, self.refill_period) {
            self.refilled.notify_waiters();
        }
        state.tokens
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        self.try_take().await.is_ok()
    }

    /// Wait until a token is available, then debit it.
    ///
    /// No internal deadline; wrap in `tokio::time::timeout` for bounded latency.
    pub async fn acquire(&self) {
        let mut backoff = self.backoff_initial;
        let started = Instant::now();
        let mut waits = 0u32;

        loop {
            // Register before checking so a refill between the check and the
            // sleep still wakes us.
            let notified = self.refilled.notified();

            let until_refill = match self.try_take().await {
                Ok(()) => {
                    if waits > 0 {
                        debug!(
                            waited_ms = started.elapsed().as_millis() as u64,
                            waits, "Rate limiter token acquired after waiting"
                        );
                    }
                    return;
                }
                Err(until_refill) => until_refill,
            };

            let wait = backoff.min(until_refill);
            if waits == 0 {
                debug!(
                    capacity = self.capacity,
                    next_refill_ms = until_refill.as_millis() as u64,
                    "Rate limiter exhausted, waiting for refill"
                );
            }
            waits += 1;

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }

            backoff = (backoff * 2).min(self.backoff_max);
        }
    }

    /// Refill, then debit one token. On an empty bucket returns the time
    /// left until the next refill boundary.
    async fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.refill(now, self.capacity, self.refill_period) {
            self.refilled.notify_waiters();
        }
        if state.tokens > 0 {
            state.tokens -= 1;
            return Ok(());
        }
        let since = now.saturating_duration_since(state.last_refill);
        Err(self
            .refill_period
            .saturating_sub(since)
            .max(Duration::from_millis(1)))
    }
}
