use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::TarotError;
use crate::rate_limit_config::{parse_limit, RateLimit};
use crate::token_bucket::TokenBucket;

/// Result of a limiter check, with enough detail for response headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Option<Duration>,
}

struct LimiterEntry {
    bucket: TokenBucket,
    last_access: Instant,
}

/// Token-bucket limiter keyed by an arbitrary string (client IP, IP + route).
///
/// Buckets are created lazily on first use of a key and evicted by
/// [`KeyedRateLimiter::cleanup_idle`] once unused for longer than the idle TTL.
pub struct KeyedRateLimiter {
    rate: RateLimit,
    burst: u32,
    buckets: DashMap<String, LimiterEntry>,
}

impl KeyedRateLimiter {
    pub fn new(rate: RateLimit, burst: u32) -> Result<Self, TarotError> {
        if burst == 0 {
            return Err(TarotError::Configuration(
                "rate limiter burst must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            rate,
            burst,
            buckets: DashMap::new(),
        })
    }

    /// Build from a `"<count>-<unit>"` spec.
    pub fn from_spec(spec: &str, burst: u32) -> Result<Self, TarotError> {
        Self::new(parse_limit(spec)?, burst)
    }

    pub fn rate(&self) -> RateLimit {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Take one token for `key` if one is available.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).allowed
    }

    pub fn check(&self, key: &str) -> Decision {
        // The entry guard holds the shard lock, so load-or-create and the
        // token take happen atomically with respect to other callers.
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| LimiterEntry {
                bucket: TokenBucket::new(self.burst, self.rate.per_second),
                last_access: Instant::now(),
            });
        entry.last_access = Instant::now();

        let allowed = entry.bucket.consume(1);
        let remaining = entry.bucket.available_tokens();
        let retry_after = if allowed {
            None
        } else {
            entry.bucket.time_until_available(1)
        };

        Decision {
            allowed,
            remaining,
            retry_after,
        }
    }

    /// Wait up to `max_wait` for a token. Returns `false` without waiting when
    /// no token can arrive in time.
    pub async fn wait(&self, key: &str, max_wait: Duration) -> bool {
        let deadline = Instant::now().checked_add(max_wait);
        loop {
            let decision = self.check(key);
            if decision.allowed {
                return true;
            }
            let pause = decision.retry_after.unwrap_or(Duration::MAX);
            match Instant::now().checked_add(pause) {
                Some(ready_at) if deadline.map_or(true, |deadline| ready_at <= deadline) => {
                    tokio::time::sleep(pause).await
                }
                _ => return false,
            }
        }
    }

    /// Drop buckets whose key has not been seen for longer than `max_idle`.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        let now = Instant::now();
        self.buckets
            .retain(|_, entry| now.duration_since(entry.last_access) <= max_idle);
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

/// A single shared bucket for throttling one producer path, such as queue pushes.
pub struct Throttle {
    limiter: KeyedRateLimiter,
}

impl Throttle {
    const KEY: &'static str = "throttle";

    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            limiter: KeyedRateLimiter {
                rate: RateLimit {
                    per_second: rate_per_second.max(0.0),
                },
                burst: burst.max(1),
                buckets: DashMap::new(),
            },
        }
    }

    /// Wait up to `max_wait` for a token.
    pub async fn acquire(&self, max_wait: Duration) -> bool {
        self.limiter.wait(Self::KEY, max_wait).await
    }
}

/// Periodically sweep idle keys from every limiter until `shutdown` flips.
pub fn spawn_cleanup(
    limiters: Vec<Arc<KeyedRateLimiter>>,
    interval: Duration,
    max_idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed: usize = limiters.iter().map(|l| l.cleanup_idle(max_idle)).sum();
                    if removed > 0 {
                        tracing::info!(removed, "Evicted idle rate limiter entries");
                    } else {
                        tracing::debug!("Rate limiter sweep found nothing to evict");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("Rate limiter sweeper stopping");
                    break;
                }
            }
        }
    })
}
