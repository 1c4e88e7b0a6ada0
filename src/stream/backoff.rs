//! Reconnect backoff and cancellable sleeps
//!
//! Every worker loop follows the same discipline: on failure sleep the
//! current backoff, double it up to the configured max, and reset to the
//! min on the next success. All waits race the shared stop signal.

use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;

/// Deterministic doubling backoff (no jitter, never gives up)
#[derive(Debug)]
pub struct Backoff {
    inner: ExponentialBackoff,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(min)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(max)
            .with_max_elapsed_time(None)
            .build();
        Self { inner, max }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.min(), config.max())
    }

    /// Delay to wait now; advances the internal interval
    pub fn next_delay(&mut self) -> Duration {
        self.inner.next_backoff().unwrap_or(self.max).min(self.max)
    }

    /// Back to the minimum after a success
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Sleep for `duration` unless `stop` fires first.
///
/// Returns `true` when the caller should exit.
pub async fn sleep_or_stop(stop: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return stop.is_cancelled();
    }
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(duration) => stop.is_cancelled(),
    }
}
