//! Durable FIFO task queue with out-of-band status and result records.
//!
//! Producers push tasks; workers pop them and write status/result records
//! back. Every record carries the configured TTL, so pollers must look a task
//! up within that window. Delivery is at-most-once: a popped task that is never
//! finished is not redelivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, TarotError};
use crate::metrics::{QueueMetrics, QueueOp};
use crate::rate_limiter::Throttle;
use crate::store::QueueStore;
use crate::task::{Task, TaskProgress, TaskStatus};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub prefix: String,
    pub ttl: Duration,
    pub rate_per_second: f64,
    pub burst: u32,
    pub max_push_wait: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: "tarot:queue".to_string(),
            ttl: Duration::from_secs(300),
            rate_per_second: 12.0,
            burst: 50,
            max_push_wait: Duration::from_secs(1),
        }
    }
}

pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    settings: QueueSettings,
    throttle: Throttle,
    metrics: Arc<QueueMetrics>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>, settings: QueueSettings, metrics: Arc<QueueMetrics>) -> Self {
        let throttle = Throttle::new(settings.rate_per_second, settings.burst);
        Self {
            store,
            settings,
            throttle,
            metrics,
        }
    }

    fn list_key(&self) -> String {
        format!("{}:tasks", self.settings.prefix)
    }

    fn status_key(&self, task_id: &str) -> String {
        format!("{}:status:{}", self.settings.prefix, task_id)
    }

    fn result_key(&self, task_id: &str) -> String {
        format!("{}:result:{}", self.settings.prefix, task_id)
    }

    pub fn ttl(&self) -> Duration {
        self.settings.ttl
    }

    /// Enqueue `task` and mark it pending, atomically.
    pub async fn push(&self, task: &Task) -> Result<()> {
        if !self.throttle.acquire(self.settings.max_push_wait).await {
            self.metrics.record_error(QueueOp::Push);
            tracing::warn!(task_id = %task.id, "Queue push throttled");
            return Err(TarotError::RateLimited);
        }

        let start = Instant::now();
        let outcome = self.push_unthrottled(task).await;
        self.metrics.record_push_latency(start.elapsed());

        match &outcome {
            Ok(()) => {
                self.metrics.record_success(QueueOp::Push);
                tracing::debug!(task_id = %task.id, "Task enqueued");
            }
            Err(e) => {
                self.metrics.record_error(QueueOp::Push);
                tracing::error!(task_id = %task.id, error = %e, "Failed to push task");
            }
        }
        outcome
    }

    async fn push_unthrottled(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        self.store
            .push_with_value(
                &self.list_key(),
                &payload,
                &self.status_key(&task.id),
                TaskStatus::Pending.as_str(),
                self.settings.ttl,
            )
            .await
    }

    /// Take the oldest task, waiting up to `timeout` (zero waits forever).
    pub async fn pop(&self, timeout: Duration) -> Result<Option<Task>> {
        let payload = match self.store.blocking_pop(&self.list_key(), timeout).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.metrics.record_error(QueueOp::Pop);
                return Err(e);
            }
        };

        match serde_json::from_str::<Task>(&payload) {
            Ok(task) => {
                self.metrics.record_success(QueueOp::Pop);
                Ok(Some(task))
            }
            Err(e) => {
                self.metrics.record_error(QueueOp::Pop);
                tracing::error!(error = %e, "Dropping undecodable queue entry");
                Err(e.into())
            }
        }
    }

    /// Overwrite the status record, and the result record when `result` is
    /// non-empty. Last write wins.
    pub async fn update_status(&self, task_id: &str, status: TaskStatus, result: &str) -> Result<()> {
        let mut entries = vec![(self.status_key(task_id), status.as_str().to_string())];
        if !result.is_empty() {
            entries.push((self.result_key(task_id), result.to_string()));
        }
        self.store.set_many(&entries, self.settings.ttl).await
    }

    /// `None` when the task is unknown or its records have expired.
    pub async fn status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        match self.store.get(&self.status_key(task_id)).await? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    pub async fn result(&self, task_id: &str) -> Result<Option<String>> {
        self.store.get(&self.result_key(task_id)).await
    }

    /// Status plus, for finished tasks, the stored result or error text.
    pub async fn progress(&self, task_id: &str) -> Result<Option<TaskProgress>> {
        let Some(status) = self.status(task_id).await? else {
            return Ok(None);
        };
        let stored = if status.is_terminal() {
            self.result(task_id).await?
        } else {
            None
        };
        Ok(Some(TaskProgress::new(task_id, status, stored)))
    }

    pub async fn len(&self) -> Result<u64> {
        self.store.list_len(&self.list_key()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}
