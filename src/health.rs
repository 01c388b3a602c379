use serde::Serialize;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::backend::{BackendPool, BackendStatus};
use crate::queue::TaskQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    /// The store works but no backend is currently healthy.
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: OverallStatus,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize)]
pub struct DependencyStatus {
    pub redis: ServiceStatus,
    pub backends: BackendsHealth,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BackendsHealth {
    pub healthy: usize,
    pub total: usize,
    pub instances: Vec<BackendStatus>,
}

/// Aggregates store and backend health into one report.
pub struct HealthChecker {
    queue: Arc<TaskQueue>,
    backends: Arc<BackendPool>,
    started: Instant,
}

impl HealthChecker {
    pub fn new(queue: Arc<TaskQueue>, backends: Arc<BackendPool>) -> Self {
        Self {
            queue,
            backends,
            started: Instant::now(),
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let redis = self.check_store().await;
        let instances = self.backends.statuses();
        let healthy = instances.iter().filter(|instance| instance.healthy).count();

        let status = if redis.error.is_some() {
            OverallStatus::Unhealthy
        } else if healthy == 0 {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        HealthStatus {
            status,
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            dependencies: DependencyStatus {
                redis,
                backends: BackendsHealth {
                    healthy,
                    total: instances.len(),
                    instances,
                },
            },
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let outcome = self.queue.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}
