// throttle.rs - Byte-rate token bucket for asset streaming
//
// Loaders consume tokens per byte read. When the bucket runs dry the caller
// sleeps until enough tokens accumulate, bounding how much data moves per
// frame regardless of how many loads are in flight.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    bytes_per_second: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `capacity` is the burst size; a full bucket admits that many bytes
    /// without waiting.
    pub fn new(bytes_per_second: f64, capacity: f64) -> Self {
        assert!(bytes_per_second > 0.0 && capacity > 0.0);
        Self {
            bytes_per_second,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now - state.last_refill;
        state.last_refill = now;
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.bytes_per_second).min(self.capacity);
    }

    /// Take `bytes` tokens without waiting. Returns false when the bucket
    /// lacks them.
    pub fn try_consume(&self, bytes: usize) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let needed = bytes as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Take `bytes` tokens, sleeping until they accumulate. Requests larger
    /// than the burst capacity drain the bucket fully and pay off the rest
    /// over time.
    pub fn consume(&self, bytes: usize) {
        let mut remaining = bytes as f64;
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                let take = state.tokens.min(remaining);
                state.tokens -= take;
                remaining -= take;
                if remaining <= 0.0 {
                    return;
                }
                Duration::from_secs_f64(
                    (remaining.min(self.capacity) / self.bytes_per_second).max(0.001),
                )
            };
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_deny() {
        let bucket = TokenBucket::new(1000.0, 100.0);
        assert!(bucket.try_consume(100));
        assert!(!bucket.try_consume(100));
    }

    #[test]
    fn consume_waits_for_refill() {
        let bucket = TokenBucket::new(10_000.0, 100.0);
        bucket.consume(100);
        let start = Instant::now();
        // 50 more bytes at 10k/s needs ~5ms
        bucket.consume(50);
        assert!(start.elapsed() >= Duration::from_millis(4));
    }
}
