use std::time::Duration;
use tokio::time::Instant;

/// Classic token bucket: holds up to `capacity` tokens, refilled continuously
/// at `refill_rate` tokens per second. A zero rate never refills.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: refill_rate.max(0.0),
            last_refill: Instant::now(),
        }
    }

    pub fn consume(&mut self, tokens: u32) -> bool {
        self.refill();

        if self.tokens >= tokens as f64 {
            self.tokens -= tokens as f64;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&mut self) -> u32 {
        self.refill();
        self.tokens.floor() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        if elapsed > Duration::ZERO {
            let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();

            // Prevent overflow by capping at capacity
            self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
            self.last_refill = now;
        }
    }

    /// `None` when `required_tokens` are available now, otherwise how long
    /// until they will be. `Duration::MAX` when they never will be.
    pub fn time_until_available(&mut self, required_tokens: u32) -> Option<Duration> {
        self.refill();

        if self.tokens >= required_tokens as f64 {
            return None;
        }

        if self.refill_rate <= 0.0 || required_tokens > self.capacity {
            return Some(Duration::MAX);
        }

        let tokens_needed = required_tokens as f64 - self.tokens;
        let seconds_to_wait = tokens_needed / self.refill_rate;

        Some(Duration::try_from_secs_f64(seconds_to_wait).unwrap_or(Duration::MAX))
    }
}
