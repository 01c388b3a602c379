use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::BackendError;

/// A credential that never shows up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl FromStr for ApiKey {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().to_string()))
    }
}

/// Counts requests over a trailing window.
#[derive(Debug, Clone)]
pub struct RequestCounter {
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RequestCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: VecDeque::new(),
        }
    }

    pub fn record(&mut self) {
        let now = Instant::now();
        self.evict(now);
        self.hits.push_back(now);
    }

    pub fn count(&mut self) -> usize {
        self.evict(Instant::now());
        self.hits.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Where and how to reach one backend; cheap to clone out of the pool lock.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendTarget {
    pub index: usize,
    pub url: String,
    pub api_key: ApiKey,
}

/// One configured AI interpretation endpoint and its observed health.
#[derive(Debug, Clone)]
pub struct BackendInstance {
    pub url: String,
    pub api_key: ApiKey,
    pub healthy: bool,
    pub error_count: u32,
    pub last_error: Option<BackendError>,
    pub last_used: Option<DateTime<Utc>>,
    pub recent_requests: RequestCounter,
}

impl BackendInstance {
    pub fn new(url: impl Into<String>, api_key: ApiKey, load_window: Duration) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            api_key,
            healthy: true,
            error_count: 0,
            last_error: None,
            last_used: None,
            recent_requests: RequestCounter::new(load_window),
        }
    }

    pub fn target(&self, index: usize) -> BackendTarget {
        BackendTarget {
            index,
            url: self.url.clone(),
            api_key: self.api_key.clone(),
        }
    }

    pub fn record_success(&mut self) {
        self.healthy = true;
        self.error_count = 0;
        self.last_error = None;
        self.last_used = Some(Utc::now());
    }

    /// Returns `true` when this failure demoted the instance.
    pub fn record_failure(&mut self, error: BackendError, threshold: u32) -> bool {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error);
        let was_healthy = self.healthy;
        if self.error_count >= threshold {
            self.healthy = false;
        }
        was_healthy && !self.healthy
    }

    pub fn reset(&mut self) {
        self.healthy = true;
        self.error_count = 0;
    }

    pub fn status(&mut self) -> BackendStatus {
        BackendStatus {
            url: self.url.clone(),
            healthy: self.healthy,
            error_count: self.error_count,
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
            last_used: self.last_used,
            recent_requests: self.recent_requests.count(),
        }
    }
}

/// Serializable view of an instance, without its credential.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendStatus {
    pub url: String,
    pub healthy: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_used: Option<DateTime<Utc>>,
    pub recent_requests: usize,
}
