//! Rate limiting for outbound registry queries.
//!
//! This module provides a token bucket shared by all lookup workers,
//! bounding the steady-state query rate against the regional registries
//! while allowing a configured burst at the start of a run.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Token bucket state guarded by the limiter's mutex
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter shared across concurrent lookup workers.
///
/// The bucket starts full (the burst allowance) and refills continuously
/// at the configured queries-per-second. Waiting callers queue on the
/// internal mutex, which hands out permission in approximately FIFO
/// order, so no worker starves.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    qps: f64,
    burst: f64,
}

impl RateLimiter {
    /// Create a new rate limiter with the given steady-state rate and
    /// burst capacity. `qps` must be positive and `burst` at least 1;
    /// both are enforced by `Config::validate` before construction.
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            qps,
            burst: burst as f64,
        }
    }

    /// Block the calling worker until one query token is granted.
    ///
    /// Consumes one token, waiting for the bucket to refill when empty.
    /// The wait is bounded by `1 / qps` per queued caller.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                if elapsed > 0.0 {
                    state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
                    state.last_refill = now;
                }
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // floor the wait so rounding can never produce a
                // zero-length sleep that spins without refilling
                Duration::from_secs_f64((1.0 - state.tokens) / self.qps)
                    .max(Duration::from_millis(1))
            };
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_granted_instantly() {
        let limiter = RateLimiter::new(6.0, 24);
        let start = Instant::now();

        for _ in 0..24 {
            limiter.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_state_is_paced_at_qps() {
        let limiter = RateLimiter::new(6.0, 24);
        let start = Instant::now();

        // 30 acquisitions: 24 from the burst, 6 more at 6 qps.
        for _ in 0..30 {
            limiter.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1200), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_workers_all_make_progress() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(10.0, 2));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
