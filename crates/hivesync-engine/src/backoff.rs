//! Capped exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use hivesync_core::CoordError;

const BACKOFF_FACTOR: u32 = 2;

/// Backoff state for one retrying caller.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    ///
    /// Returns the current step with up to 25% random jitter, then doubles the
    /// step for next time (capped at the configured maximum).
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(BACKOFF_FACTOR).min(self.max);

        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    /// Step the next call to [`next_delay`](Self::next_delay) will start from.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `attempts` are used up. Only [`CoordError::StoreUnavailable`] is retried.
pub async fn retry_unavailable<T, F, Fut>(
    mut backoff: Backoff,
    attempts: u32,
    mut op: F,
) -> Result<T, CoordError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoordError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(CoordError::StoreUnavailable(reason)) if attempt < attempts => {
                let delay = backoff.next_delay();
                warn!(attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "Store unavailable, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
