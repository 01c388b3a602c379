use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::client::{BackendClient, ReadingPrompt};
use super::instance::{ApiKey, BackendInstance, BackendStatus, BackendTarget};
use crate::error::{BackendError, TarotError};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Consecutive failures before an instance is taken out of rotation.
    pub failure_threshold: u32,
    pub call_timeout: Duration,
    pub health_check_interval: Duration,
    /// Trailing window used to measure each instance's recent load.
    pub load_window: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            call_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            load_window: Duration::from_secs(300),
        }
    }
}

/// Interchangeable AI backends with least-loaded selection, failure
/// isolation and automatic recovery.
pub struct BackendPool {
    instances: RwLock<Vec<BackendInstance>>,
    client: Arc<dyn BackendClient>,
    settings: PoolSettings,
}

impl BackendPool {
    pub fn new(
        endpoints: Vec<(String, ApiKey)>,
        client: Arc<dyn BackendClient>,
        settings: PoolSettings,
    ) -> Self {
        let instances = endpoints
            .into_iter()
            .map(|(url, key)| BackendInstance::new(url, key, settings.load_window))
            .collect();
        Self {
            instances: RwLock::new(instances),
            client,
            settings,
        }
    }

    /// Build from parallel URL / key lists; their lengths must match.
    pub fn from_lists(
        urls: &[String],
        api_keys: &[ApiKey],
        client: Arc<dyn BackendClient>,
        settings: PoolSettings,
    ) -> Result<Self, TarotError> {
        if urls.len() != api_keys.len() {
            return Err(TarotError::Configuration(format!(
                "backend URLs and API keys count mismatch ({} urls, {} keys)",
                urls.len(),
                api_keys.len()
            )));
        }
        let endpoints = urls.iter().cloned().zip(api_keys.iter().cloned()).collect();
        Ok(Self::new(endpoints, client, settings))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick the healthy instance with the fewest recent requests, ties going
    /// to the earlier one. When none is healthy every instance is reset and
    /// the first is returned, so processing never stalls on health state.
    pub fn select(&self) -> Result<BackendTarget, BackendError> {
        let mut instances = self.instances.write();
        if instances.is_empty() {
            return Err(BackendError::NoBackendAvailable);
        }

        let mut best: Option<(usize, usize)> = None;
        for (index, instance) in instances.iter_mut().enumerate() {
            if !instance.healthy {
                continue;
            }
            let load = instance.recent_requests.count();
            if best.map_or(true, |(_, best_load)| load < best_load) {
                best = Some((index, load));
            }
        }

        let index = match best {
            Some((index, _)) => index,
            None => {
                tracing::warn!(
                    instances = instances.len(),
                    "No healthy backend instance, resetting all to healthy"
                );
                for instance in instances.iter_mut() {
                    instance.reset();
                }
                0
            }
        };

        let instance = &mut instances[index];
        instance.recent_requests.record();
        Ok(instance.target(index))
    }

    pub fn record_success(&self, target: &BackendTarget) {
        let mut instances = self.instances.write();
        if let Some(instance) = instances.get_mut(target.index) {
            instance.record_success();
        }
    }

    pub fn record_failure(&self, target: &BackendTarget, error: BackendError) {
        let mut instances = self.instances.write();
        if let Some(instance) = instances.get_mut(target.index) {
            let demoted = instance.record_failure(error.clone(), self.settings.failure_threshold);
            if demoted {
                tracing::error!(url = %instance.url, error = %error, "Backend instance marked unhealthy");
            } else {
                tracing::warn!(
                    url = %instance.url,
                    error = %error,
                    error_count = instance.error_count,
                    "Backend call failed"
                );
            }
        }
    }

    /// A probe succeeded: put the instance straight back into rotation.
    pub fn mark_recovered(&self, target: &BackendTarget) {
        let mut instances = self.instances.write();
        if let Some(instance) = instances.get_mut(target.index) {
            instance.healthy = true;
            instance.error_count = 0;
            instance.last_error = None;
            tracing::info!(url = %instance.url, "Backend instance recovered");
        }
    }

    /// Call `target` under the per-call timeout and record the outcome.
    pub async fn call(&self, target: &BackendTarget, prompt: &ReadingPrompt) -> Result<String, BackendError> {
        let outcome = match tokio::time::timeout(
            self.settings.call_timeout,
            self.client.interpret(target, prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.settings.call_timeout)),
        };

        match &outcome {
            Ok(_) => self.record_success(target),
            Err(e) if e.counts_against_instance() => self.record_failure(target, e.clone()),
            Err(_) => {}
        }
        outcome
    }

    fn unhealthy_targets(&self) -> Vec<BackendTarget> {
        self.instances
            .read()
            .iter()
            .enumerate()
            .filter(|(_, instance)| !instance.healthy)
            .map(|(index, instance)| instance.target(index))
            .collect()
    }

    /// Probe every unhealthy instance once; returns how many recovered.
    pub async fn probe_unhealthy(&self) -> usize {
        let targets = self.unhealthy_targets();
        if targets.is_empty() {
            return 0;
        }

        let mut probes = JoinSet::new();
        for target in targets {
            let client = Arc::clone(&self.client);
            let timeout = self.settings.call_timeout;
            probes.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, client.probe(&target)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(timeout)),
                };
                (target, outcome)
            });
        }

        let mut recovered = 0;
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((target, Ok(()))) => {
                    self.mark_recovered(&target);
                    recovered += 1;
                }
                Ok((target, Err(e))) => {
                    tracing::debug!(url = %target.url, error = %e, "Backend still unhealthy");
                }
                Err(e) => tracing::error!(error = %e, "Health probe task failed"),
            }
        }
        recovered
    }

    /// Run [`BackendPool::probe_unhealthy`] every health-check interval until
    /// `shutdown` flips.
    pub fn spawn_health_prober(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.health_check_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe_unhealthy().await;
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("Backend health prober stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Fails when no instance is currently healthy, carrying the last error seen.
    pub fn health_check(&self) -> Result<(), TarotError> {
        let instances = self.instances.read();
        if instances.iter().any(|instance| instance.healthy) {
            return Ok(());
        }
        let last_error = instances
            .iter()
            .rev()
            .find_map(|instance| instance.last_error.as_ref());
        Err(match last_error {
            Some(e) => TarotError::BackendUnavailable(format!("no healthy backend instance: {}", e)),
            None => TarotError::NoBackendAvailable,
        })
    }

    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.instances
            .write()
            .iter_mut()
            .map(|instance| instance.status())
            .collect()
    }
}
