use crate::config::Config;
use crate::error::TarotError;
use crate::rate_limit_config::{parse_limit, RouteLimitRule};

/// Longest accepted task deadline or backend timeout: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

/// Startup checks for a [`Config`], run once before anything connects.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), TarotError> {
        Self::validate_redis_url(&config.redis_url)?;
        Self::validate_prefix(&config.queue_prefix)?;

        if config.queue_ttl_secs == 0 {
            return Err(invalid("REDIS_QUEUE_TIMEOUT must be greater than 0"));
        }
        Self::validate_throttle(config.queue_rate_limit, config.queue_rate_burst)?;

        if config.worker_count == 0 {
            return Err(invalid("QUEUE_WORKER_COUNT must be greater than 0"));
        }
        if config.retry_times == 0 {
            return Err(invalid("QUEUE_RETRY_TIMES must be greater than 0"));
        }
        // A zero pop timeout would block forever and never observe the stop signal.
        if config.pop_timeout_secs == 0 {
            return Err(invalid("QUEUE_POP_TIMEOUT must be greater than 0"));
        }
        if config.task_deadline_secs == 0 || config.backend_timeout_secs == 0 {
            return Err(invalid("task deadline and backend timeout must be greater than 0"));
        }
        if config.task_deadline_secs > MAX_TIMEOUT_SECS || config.backend_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(invalid(&format!(
                "task deadline and backend timeout must not exceed {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }
        if config.health_check_interval_secs == 0 || config.limiter_cleanup_interval_secs == 0 {
            return Err(invalid("background task intervals must be greater than 0"));
        }
        if config.failure_threshold == 0 {
            return Err(invalid("DIFY_FAILURE_THRESHOLD must be greater than 0"));
        }

        Self::validate_backends(&config.backend_urls(), config.backend_keys().len())?;

        for rule in config.route_limits().rules() {
            Self::validate_route_limit(rule)?;
        }
        Ok(())
    }

    pub fn validate_redis_url(url: &str) -> Result<(), TarotError> {
        if url.is_empty() {
            return Err(invalid("Redis URL cannot be empty"));
        }
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(invalid("Redis URL must start with 'redis://' or 'rediss://'"));
        }
        Ok(())
    }

    pub fn validate_prefix(prefix: &str) -> Result<(), TarotError> {
        if prefix.trim().is_empty() {
            return Err(invalid("queue key prefix cannot be empty"));
        }
        Ok(())
    }

    pub fn validate_throttle(rate_per_second: f64, burst: u32) -> Result<(), TarotError> {
        if !rate_per_second.is_finite() || rate_per_second < 0.0 {
            return Err(invalid("queue rate limit must be a non-negative number"));
        }
        if burst == 0 {
            return Err(invalid("queue burst must be at least 1"));
        }
        Ok(())
    }

    /// URL and key lists are parallel; an empty pool is allowed but every
    /// reading will then fail.
    pub fn validate_backends(urls: &[String], key_count: usize) -> Result<(), TarotError> {
        if urls.len() != key_count {
            return Err(invalid(&format!(
                "DIFY_API_URLS and DIFY_API_KEYS count mismatch ({} urls, {} keys)",
                urls.len(),
                key_count
            )));
        }
        for url in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(invalid(&format!("backend URL '{}' must be http(s)", url)));
            }
        }
        if urls.is_empty() {
            tracing::warn!("No AI backend configured; readings will fail until one is added");
        }
        Ok(())
    }

    /// Malformed limits are not fatal: the limiter logs and lets traffic through.
    pub fn validate_route_limit(rule: &RouteLimitRule) -> Result<(), TarotError> {
        if !rule.is_enabled() {
            return Ok(());
        }
        if rule.burst == 0 {
            return Err(invalid(&format!("burst for the {} limit must be at least 1", rule.name)));
        }
        if let Err(e) = parse_limit(&rule.limit) {
            tracing::warn!(rule = %rule.name, error = %e, "Rate limit will not be enforced");
        }
        Ok(())
    }
}

fn invalid(message: &str) -> TarotError {
    TarotError::Configuration(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit_config::KeyScope;
    use clap::Parser;

    fn config(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("tarot").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_valid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("redis://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("rediss://localhost:6379").is_ok());
    }

    #[test]
    fn test_invalid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("").is_err());
        assert!(ConfigValidator::validate_redis_url("http://localhost:6379").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&config(&[])).is_ok());
    }

    #[test]
    fn test_mismatched_backend_lists_are_rejected() {
        let config = config(&[
            "--backend-urls",
            "http://a,http://b",
            "--backend-keys",
            "only-one",
        ]);
        assert!(matches!(
            ConfigValidator::validate(&config),
            Err(TarotError::Configuration(_))
        ));
    }

    #[test]
    fn test_backend_urls_must_be_http() {
        assert!(ConfigValidator::validate_backends(&["ftp://a".to_string()], 1).is_err());
        assert!(ConfigValidator::validate_backends(&["https://a/v1".to_string()], 1).is_ok());
    }

    #[test]
    fn test_zero_counts_are_rejected() {
        assert!(ConfigValidator::validate(&config(&["--worker-count", "0"])).is_err());
        assert!(ConfigValidator::validate(&config(&["--pop-timeout-secs", "0"])).is_err());
        assert!(ConfigValidator::validate(&config(&["--queue-rate-burst", "0"])).is_err());
    }

    #[test]
    fn test_oversized_timeouts_are_rejected() {
        let huge = u64::MAX.to_string();
        assert!(ConfigValidator::validate(&config(&["--task-deadline-secs", huge.as_str()])).is_err());
        assert!(ConfigValidator::validate(&config(&["--backend-timeout-secs", huge.as_str()])).is_err());
        let week = MAX_TIMEOUT_SECS.to_string();
        assert!(ConfigValidator::validate(&config(&["--task-deadline-secs", week.as_str()])).is_ok());
    }

    #[test]
    fn test_malformed_limit_is_tolerated() {
        let rule = RouteLimitRule::new("global", "lots-per-hour", 10, KeyScope::Ip);
        assert!(ConfigValidator::validate_route_limit(&rule).is_ok());
        let rule = RouteLimitRule::new("global", "10-S", 0, KeyScope::Ip);
        assert!(ConfigValidator::validate_route_limit(&rule).is_err());
    }
}
