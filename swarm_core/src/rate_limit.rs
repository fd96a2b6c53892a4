//! Token bucket used to cap upload throughput.

use std::time::{Duration, Instant};

/// A byte-denominated token bucket.
///
/// Holds at most one second's worth of tokens, so bursts never exceed the
/// configured rate by more than a second of traffic.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full `TokenBucket`.
    ///
    /// # Arguments
    ///
    /// * `bytes_per_sec` - Refill rate, which is also the capacity. Zero is treated as one.
    pub fn per_second(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        Self {
            capacity: rate,
            tokens: rate,
            rate,
            last_refill: Instant::now(),
        }
    }

    /// Attempts to take `amount` tokens from the bucket.
    ///
    /// A request larger than the whole bucket is granted once the bucket is
    /// full, leaving it in debt, so oversized blocks still make progress.
    ///
    /// # Arguments
    ///
    /// * `amount` - The number of bytes about to be sent.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the tokens were taken, otherwise the time to wait before
    /// enough tokens will be available.
    pub fn try_take(&mut self, amount: u64) -> Result<(), Duration> {
        self.refill();
        let wanted = (amount as f64).min(self.capacity);
        if self.tokens >= wanted {
            self.tokens -= amount as f64;
            Ok(())
        } else {
            let missing = wanted - self.tokens;
            Err(Duration::from_secs_f64(missing / self.rate))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }
}
