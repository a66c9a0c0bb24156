//! Binlog Bandwidth Limiter
//!
//! Token bucket shared by every master-side push job to cap outbound
//! binlog traffic. Refills continuously; a consumer blocks until enough
//! tokens accumulate.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Byte-granular token bucket
pub struct RateLimiter {
    bytes_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A limiter refilling at `bytes_per_sec`, with one second of burst
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        Self {
            bytes_per_sec: rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `bytes` tokens, blocking until they are available.
    ///
    /// Requests larger than the burst capacity are clamped to it so they
    /// cannot stall forever.
    pub fn consume(&self, bytes: u64) {
        let mut need = (bytes as f64).min(self.bytes_per_sec);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= need {
                    bucket.tokens -= need;
                    return;
                }
                need -= bucket.tokens;
                bucket.tokens = 0.0;
                Duration::from_secs_f64(need / self.bytes_per_sec)
            };
            std::thread::sleep(wait.min(Duration::from_millis(100)));
        }
    }

    /// Tokens currently available
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens as u64
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * self.bytes_per_sec).min(self.bytes_per_sec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_within_burst_is_immediate() {
        let limiter = RateLimiter::new(1024 * 1024);
        let start = Instant::now();
        limiter.consume(1024);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(limiter.available() < 1024 * 1024);
    }

    #[test]
    fn test_consume_blocks_when_drained() {
        let limiter = RateLimiter::new(10_000);
        limiter.consume(10_000);
        let start = Instant::now();
        // bucket is empty; 1000 bytes need ~100ms at 10 KB/s
        limiter.consume(1_000);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_oversized_request_is_clamped() {
        let limiter = RateLimiter::new(1_000);
        let start = Instant::now();
        limiter.consume(1_000_000);
        // clamped to one second of burst, not a thousand seconds
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
