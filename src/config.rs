use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::backend::{ApiKey, PoolSettings};
use crate::queue::QueueSettings;
use crate::rate_limit_config::{KeyScope, RouteLimitRule, RouteLimits};
use crate::worker::WorkerSettings;

/// Service configuration. Every option can be given as a flag or through the
/// environment (a `.env` file is honoured).
#[derive(Debug, Clone, Parser)]
#[command(name = "tarot", version, about = "Asynchronous tarot reading service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Key namespace for queue records
    #[arg(long, env = "REDIS_QUEUE_PREFIX", default_value = "tarot:queue")]
    pub queue_prefix: String,

    /// TTL of status and result records, in seconds
    #[arg(long, env = "REDIS_QUEUE_TIMEOUT", default_value_t = 300)]
    pub queue_ttl_secs: u64,

    /// Queue push throttle, tasks per second
    #[arg(long, env = "QUEUE_RATE_LIMIT", default_value_t = 12.0)]
    pub queue_rate_limit: f64,

    #[arg(long, env = "QUEUE_RATE_BURST", default_value_t = 50)]
    pub queue_rate_burst: u32,

    /// Longest a push waits for the throttle, in milliseconds
    #[arg(long, env = "QUEUE_PUSH_WAIT", default_value_t = 1000)]
    pub queue_push_wait_ms: u64,

    #[arg(long, env = "QUEUE_WORKER_COUNT", default_value_t = 10)]
    pub worker_count: usize,

    /// Attempts per task, including the first
    #[arg(long, env = "QUEUE_RETRY_TIMES", default_value_t = 3)]
    pub retry_times: u32,

    #[arg(long, env = "QUEUE_RETRY_DELAY", default_value_t = 5)]
    pub retry_delay_secs: u64,

    #[arg(long, env = "QUEUE_POP_TIMEOUT", default_value_t = 5)]
    pub pop_timeout_secs: u64,

    #[arg(long, env = "QUEUE_TASK_DEADLINE", default_value_t = 120)]
    pub task_deadline_secs: u64,

    #[arg(long, env = "QUEUE_SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Comma separated AI backend base URLs
    #[arg(long, env = "DIFY_API_URLS", value_delimiter = ',')]
    pub backend_urls: Vec<String>,

    /// Comma separated API keys, one per backend URL
    #[arg(long, env = "DIFY_API_KEYS", value_delimiter = ',', hide_env_values = true)]
    pub backend_keys: Vec<ApiKey>,

    /// Per-call backend timeout, in seconds
    #[arg(long, env = "DIFY_TIMEOUT", default_value_t = 30)]
    pub backend_timeout_secs: u64,

    #[arg(long, env = "DIFY_HEALTH_CHECK_INTERVAL", default_value_t = 30)]
    pub health_check_interval_secs: u64,

    /// Consecutive failures before a backend leaves rotation
    #[arg(long, env = "DIFY_FAILURE_THRESHOLD", default_value_t = 3)]
    pub failure_threshold: u32,

    /// Window used to measure backend load, in seconds
    #[arg(long, env = "DIFY_LOAD_WINDOW", default_value_t = 300)]
    pub load_window_secs: u64,

    /// Limit across all API routes per client IP; empty disables it
    #[arg(long, env = "API_GLOBAL_LIMIT", default_value = "30000-H")]
    pub global_limit: String,

    /// Limit on reading submissions per client IP
    #[arg(long, env = "READING_LIMIT", default_value = "100-H")]
    pub reading_limit: String,

    /// Limit on reading lookups per client IP
    #[arg(long, env = "QUERY_LIMIT", default_value = "300-M")]
    pub query_limit: String,

    #[arg(long, env = "API_RATE_BURST", default_value_t = 100)]
    pub api_rate_burst: u32,

    #[arg(long, env = "LIMITER_CLEANUP_INTERVAL", default_value_t = 3600)]
    pub limiter_cleanup_interval_secs: u64,

    /// Idle time after which a client's limiter state is dropped, in seconds
    #[arg(long, env = "LIMITER_IDLE_TTL", default_value_t = 86400)]
    pub limiter_idle_ttl_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Backend URLs with blank entries removed.
    pub fn backend_urls(&self) -> Vec<String> {
        self.backend_urls
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect()
    }

    pub fn backend_keys(&self) -> Vec<ApiKey> {
        self.backend_keys
            .iter()
            .filter(|key| !key.expose().is_empty())
            .cloned()
            .collect()
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            prefix: self.queue_prefix.clone(),
            ttl: Duration::from_secs(self.queue_ttl_secs),
            rate_per_second: self.queue_rate_limit,
            burst: self.queue_rate_burst,
            max_push_wait: Duration::from_millis(self.queue_push_wait_ms),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            failure_threshold: self.failure_threshold,
            call_timeout: Duration::from_secs(self.backend_timeout_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            load_window: Duration::from_secs(self.load_window_secs),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            worker_count: self.worker_count,
            max_attempts: self.retry_times,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            pop_timeout: Duration::from_secs(self.pop_timeout_secs),
            task_deadline: Duration::from_secs(self.task_deadline_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    pub fn route_limits(&self) -> RouteLimits {
        RouteLimits {
            global: RouteLimitRule::new("global", &self.global_limit, self.api_rate_burst, KeyScope::Ip),
            create_reading: RouteLimitRule::new(
                "create_reading",
                &self.reading_limit,
                self.api_rate_burst,
                KeyScope::RouteWithIp,
            ),
            query_reading: RouteLimitRule::new(
                "query_reading",
                &self.query_limit,
                self.api_rate_burst,
                KeyScope::RouteWithIp,
            ),
        }
    }

    pub fn limiter_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.limiter_cleanup_interval_secs)
    }

    pub fn limiter_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.limiter_idle_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("tarot").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.queue_settings().prefix, "tarot:queue");
        assert_eq!(config.worker_settings().worker_count, 10);
        assert_eq!(config.worker_settings().max_attempts, 3);
        assert_eq!(config.pool_settings().failure_threshold, 3);
        assert_eq!(config.route_limits(), RouteLimits::default());
        assert_eq!(config.limiter_idle_ttl(), Duration::from_secs(86400));
    }

    #[test]
    fn test_backend_lists_are_split_and_trimmed() {
        let config = parse(&[
            "--backend-urls",
            "http://a, http://b,",
            "--backend-keys",
            "key-a, key-b",
        ]);
        assert_eq!(config.backend_urls(), vec!["http://a", "http://b"]);
        let keys = config.backend_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].expose(), "key-b");
    }

    #[test]
    fn test_api_keys_do_not_leak_in_debug() {
        let config = parse(&["--backend-keys", "app-secret"]);
        assert!(!format!("{:?}", config).contains("app-secret"));
    }
}
