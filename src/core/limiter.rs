//! Token-bucket rate limiting for retry loops.
//!
//! The capture restart loop and the owner campaign loop both hammer the
//! coordination store when something is persistently wrong; these limiters
//! bound that pressure (restart ≤ 1 per 20 s with burst 2, campaign ≤ 1/s).

use crate::core::error::{SluiceError, SluiceResult};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A token bucket refilled continuously at a fixed rate.
///
/// The bucket starts full, so the first `burst` acquisitions never wait.
#[derive(Debug)]
pub struct RateLimiter {
    refill_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter refilling `refill_per_sec` tokens per second with
    /// the given burst capacity.
    pub fn new(refill_per_sec: f64, burst: u32) -> Self {
        assert!(refill_per_sec > 0.0, "refill rate must be positive");
        assert!(burst > 0, "burst must be positive");
        Self {
            refill_per_sec,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    ///
    /// Returns [`SluiceError::Canceled`] when the token observes
    /// cancellation while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> SluiceResult<()> {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(SluiceError::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_granted_immediately() {
        let limiter = RateLimiter::new(1.0, 2);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_is_enforced() {
        // The capture restart limiter: 1 per 20s, burst 2. After the burst,
        // a third restart must wait the full refill period.
        let limiter = RateLimiter::new(0.05, 2);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_observes_cancellation() {
        let limiter = RateLimiter::new(0.05, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = limiter.acquire(&cancel);
        tokio::pin!(waiter);

        tokio::select! {
            biased;
            _ = &mut waiter => panic!("no token should be available yet"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        cancel.cancel();
        let err = waiter.await.unwrap_err();
        assert!(err.is_canceled());
    }
}
