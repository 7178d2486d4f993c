//! Token-bucket admission gate for the ingress service.
//!
//! The bucket starts full with `burst` tokens and refills continuously at
//! `rate_per_sec`, never exceeding `burst`. Each admitted request takes one
//! token; a request finding less than one token is rejected.

use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateLimitConfig;

pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.rate_per_sec, config.burst)
    }

    /// Try to admit one request now.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Try to admit one request at `now`.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (fractional).
    #[cfg(test)]
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, now);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // Out-of-order timestamps refill nothing
        let elapsed = now.saturating_duration_since(state.refilled_at);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.burst);
        state.refilled_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn admitted(bucket: &TokenBucket, now: Instant, attempts: usize) -> usize {
        (0..attempts).filter(|_| bucket.try_acquire_at(now)).count()
    }

    #[test]
    fn test_burst_admitted_instantaneously() {
        let bucket = TokenBucket::new(100.0, 200);
        let now = Instant::now();
        assert_eq!(admitted(&bucket, now, 250), 200);
    }

    #[test]
    fn test_sustained_rate_after_burst() {
        let bucket = TokenBucket::new(100.0, 200);
        let start = Instant::now();
        assert_eq!(admitted(&bucket, start, 200), 200);

        let later = start + Duration::from_secs(1);
        assert_eq!(admitted(&bucket, later, 150), 100);

        let half = later + Duration::from_millis(500);
        assert_eq!(admitted(&bucket, half, 150), 50);
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let bucket = TokenBucket::new(100.0, 200);
        let start = Instant::now();
        assert_eq!(admitted(&bucket, start, 200), 200);

        let much_later = start + Duration::from_secs(60);
        assert!((bucket.available_at(much_later) - 200.0).abs() < 1e-9);
        assert_eq!(admitted(&bucket, much_later, 300), 200);
    }

    #[test]
    fn test_single_token_bucket() {
        let bucket = TokenBucket::new(1.0, 1);
        let now = Instant::now();
        assert!(bucket.try_acquire_at(now));
        assert!(!bucket.try_acquire_at(now));
        assert!(bucket.try_acquire_at(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let bucket = TokenBucket::new(1.0, 1);
        let now = Instant::now() + Duration::from_secs(5);
        assert!(bucket.try_acquire_at(now));
        assert!(!bucket.try_acquire_at(now - Duration::from_secs(3)));
    }
}
