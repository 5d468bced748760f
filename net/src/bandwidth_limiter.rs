//! Outbound bandwidth limiting shared across channels.
//!
//! Only writes sent with [`DropPolicy::Limiter`](crate::connection::DropPolicy::Limiter)
//! consult the limiter; the other policies bypass it.

use {
    parking_lot::Mutex,
    std::time::Instant,
};

/// Decides whether a buffer of a given size may be sent now.
pub trait BandwidthLimiter: Send + Sync {
    /// Returns `true` if `message_size` bytes may pass. A `true` answer
    /// consumes the allowance.
    fn should_pass(&self, message_size: usize) -> bool;
}

#[derive(Debug)]
struct TokenBucket {
    max_tokens: usize,
    refill_rate: usize,
    tokens: usize,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: usize, refill_rate: usize) -> Self {
        Self {
            max_tokens,
            refill_rate,
            tokens: max_tokens,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let added = (elapsed * self.refill_rate as f64) as usize;
        if added > 0 {
            self.tokens = self.tokens.saturating_add(added).min(self.max_tokens);
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self, count: usize) -> bool {
        self.refill();
        match self.tokens.checked_sub(count) {
            Some(remaining) => {
                self.tokens = remaining;
                true
            }
            None => false,
        }
    }
}

/// Token bucket limiter: `limit` bytes per second with bursts of up to
/// `limit * burst_ratio` bytes. A limit of `0` lets everything through.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    limit: usize,
    bucket: Mutex<TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(limit: usize, burst_ratio: f64) -> Self {
        let max_tokens = (limit as f64 * burst_ratio.max(1.0)) as usize;
        Self {
            limit,
            bucket: Mutex::new(TokenBucket::new(max_tokens, limit)),
        }
    }

    /// Configured sustained rate in bytes per second.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Tokens currently available (after refilling).
    pub fn available(&self) -> usize {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens
    }
}

impl BandwidthLimiter for TokenBucketLimiter {
    fn should_pass(&self, message_size: usize) -> bool {
        if self.limit == 0 {
            return true;
        }
        self.bucket.lock().try_consume(message_size)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{thread::sleep, time::Duration},
    };

    #[test]
    fn test_unlimited_always_passes() {
        let limiter = TokenBucketLimiter::new(0, 1.0);
        for _ in 0..1_000 {
            assert!(limiter.should_pass(1_000_000));
        }
    }

    #[test]
    fn test_burst_then_refuse() {
        let limiter = TokenBucketLimiter::new(1_000, 2.0);
        assert!(limiter.should_pass(1_500));
        assert!(limiter.should_pass(500));
        // Bucket is empty; a large buffer cannot pass until it refills.
        assert!(!limiter.should_pass(1_000));
    }

    #[test]
    fn test_refills_over_time() {
        let limiter = TokenBucketLimiter::new(10_000, 1.0);
        assert!(limiter.should_pass(10_000));
        assert!(!limiter.should_pass(5_000));
        sleep(Duration::from_millis(600));
        assert!(limiter.should_pass(5_000));
    }

    #[test]
    fn test_oversized_buffer_never_passes() {
        let limiter = TokenBucketLimiter::new(100, 1.0);
        assert!(!limiter.should_pass(101));
        assert_eq!(limiter.available(), 100);
    }
}
