//! Fixed-size pool of loops that drain the task queue through the backend pool.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendPool, ReadingPrompt};
use crate::error::{BackendError, TarotError};
use crate::metrics::{QueueMetrics, QueueOp};
use crate::queue::TaskQueue;
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_count: usize,
    /// Total attempts per task, including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Upper bound on a single blocking pop, so loops notice the stop signal.
    pub pop_timeout: Duration,
    /// Budget for a task across all of its attempts.
    pub task_deadline: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: 10,
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            pop_timeout: Duration::from_secs(5),
            task_deadline: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a task ended up `failed`; its message becomes the task result.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("fatal error on attempt {attempts}: {source}")]
    Fatal { attempts: u32, source: BackendError },

    #[error("failed after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: BackendError },
}

#[derive(Clone)]
struct Executor {
    queue: Arc<TaskQueue>,
    backends: Arc<BackendPool>,
    metrics: Arc<QueueMetrics>,
    settings: WorkerSettings,
    abort: watch::Receiver<bool>,
}

/// How long aborted loops get to record their tasks as failed.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Resolves once `abort` flips to `true`; never resolves if the sender is gone.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    let closed = abort.wait_for(|aborted| *aborted).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Resolves at `deadline`; never resolves without one.
async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl Executor {
    async fn run(self, worker_id: usize, stop: watch::Receiver<bool>) {
        info!(worker_id, "Worker started");

        while !*stop.borrow() {
            match self.queue.pop(self.settings.pop_timeout).await {
                Ok(Some(task)) => self.execute(task, worker_id).await,
                Ok(None) => {}
                // Undecodable entries are logged by the queue and skipped.
                Err(TarotError::Serialization(_)) => {}
                Err(e) => {
                    error!(worker_id, error = %e, "Dequeue failed");
                    let mut stop = stop.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = stop.changed() => {}
                    }
                }
            }
        }

        info!(worker_id, "Worker stopping");
    }

    async fn execute(&self, mut task: Task, worker_id: usize) {
        let start = Instant::now();

        if let Err(e) = self.transition(&mut task, TaskStatus::Running, "").await {
            self.metrics.record_error(QueueOp::Process);
            error!(worker_id, task_id = %task.id, error = %e, "Failed to mark task running");
            return;
        }

        let (next, result) = match self.process(&task).await {
            Ok(interpretation) => {
                self.metrics.record_success(QueueOp::Process);
                info!(worker_id, task_id = %task.id, "Task completed");
                (TaskStatus::Completed, interpretation)
            }
            Err(failure) => {
                self.metrics.record_error(QueueOp::Process);
                warn!(worker_id, task_id = %task.id, error = %failure, "Task failed");
                (TaskStatus::Failed, failure.to_string())
            }
        };

        if let Err(e) = self.transition(&mut task, next, &result).await {
            error!(worker_id, task_id = %task.id, status = %next, error = %e, "Failed to record task outcome");
        }
        self.metrics.record_processing_time(start.elapsed());
    }

    async fn transition(&self, task: &mut Task, next: TaskStatus, result: &str) -> Result<(), TarotError> {
        task.advance(next)?;
        self.queue.update_status(&task.id, next, result).await
    }

    async fn process(&self, task: &Task) -> Result<String, TaskFailure> {
        let prompt = ReadingPrompt {
            task_id: task.id.clone(),
            question: task.question.clone(),
            cards: task.cards_param(),
        };
        // A deadline too far out to represent means no deadline.
        let deadline = Instant::now().checked_add(self.settings.task_deadline);
        let mut abort = self.abort.clone();
        let mut last_error = BackendError::NoBackendAvailable;

        for attempt in 1..=self.settings.max_attempts.max(1) {
            if attempt > 1 {
                debug!(
                    task_id = %task.id,
                    attempt,
                    max_attempts = self.settings.max_attempts,
                    "Retrying task"
                );
                tokio::select! {
                    biased;
                    _ = aborted(&mut abort) => {
                        return Err(TaskFailure::Fatal { attempts: attempt - 1, source: BackendError::Cancelled });
                    }
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                }
            }

            match self.attempt(&prompt, deadline, &mut abort).await {
                Ok(interpretation) => return Ok(interpretation),
                Err(e) if e.is_fatal() => {
                    return Err(TaskFailure::Fatal { attempts: attempt, source: e });
                }
                Err(e) => {
                    warn!(task_id = %task.id, attempt, error = %e, "Attempt failed");
                    last_error = e;
                }
            }
        }

        Err(TaskFailure::Exhausted {
            attempts: self.settings.max_attempts.max(1),
            source: last_error,
        })
    }

    async fn attempt(
        &self,
        prompt: &ReadingPrompt,
        deadline: Option<Instant>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<String, BackendError> {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(BackendError::DeadlineExceeded);
        }
        let target = self.backends.select()?;
        tokio::select! {
            biased;
            _ = aborted(abort) => Err(BackendError::Cancelled),
            _ = expired(deadline) => Err(BackendError::DeadlineExceeded),
            outcome = self.backends.call(&target, prompt) => outcome,
        }
    }
}

/// Owns the worker loops and their stop / abort signals.
pub struct WorkerPool {
    executor: Executor,
    stop_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        backends: Arc<BackendPool>,
        metrics: Arc<QueueMetrics>,
        settings: WorkerSettings,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        Self {
            executor: Executor {
                queue,
                backends,
                metrics,
                settings,
                abort: abort_rx,
            },
            stop_tx,
            abort_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("Worker pool already started");
            return;
        }

        let count = self.executor.settings.worker_count.max(1);
        info!(workers = count, "Starting workers");
        for worker_id in 0..count {
            let executor = self.executor.clone();
            let stop = self.stop_tx.subscribe();
            handles.push(tokio::spawn(executor.run(worker_id, stop)));
        }
    }

    pub fn running_workers(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Let every loop finish its current task, waiting up to the shutdown
    /// timeout. On timeout in-flight calls are aborted, the loops get a short
    /// grace period to mark their tasks failed, and `false` is returned.
    pub async fn shutdown(&self) -> bool {
        info!("Stopping all workers");
        self.stop_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.handles.lock());
        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker terminated abnormally");
                }
            }
        };
        tokio::pin!(join_all);

        match tokio::time::timeout(self.executor.settings.shutdown_timeout, &mut join_all).await {
            Ok(()) => {
                info!("All workers stopped gracefully");
                true
            }
            Err(_) => {
                warn!("Worker shutdown timed out");
                self.abort_tx.send_replace(true);
                if tokio::time::timeout(ABORT_GRACE, join_all).await.is_err() {
                    error!("Workers still running after abort");
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ApiKey, BackendClient, BackendTarget, PoolSettings};
    use crate::memory_store::MemoryStore;
    use crate::queue::QueueSettings;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted outcomes, then repeats `fallback`.
    struct ScriptedClient {
        script: parking_lot::Mutex<VecDeque<Result<String, BackendError>>>,
        fallback: Result<String, BackendError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<String, BackendError>>, fallback: Result<String, BackendError>) -> Self {
            Self {
                script: parking_lot::Mutex::new(script.into()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl BackendClient for ScriptedClient {
        async fn interpret(&self, _: &BackendTarget, _: &ReadingPrompt) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }

        async fn probe(&self, _: &BackendTarget) -> Result<(), BackendError> {
            Err(BackendError::Transport("probe disabled".into()))
        }
    }

    struct Harness {
        queue: Arc<TaskQueue>,
        backends: Arc<BackendPool>,
        pool: WorkerPool,
        client: Arc<ScriptedClient>,
    }

    fn harness(client: ScriptedClient, backend_count: usize, settings: WorkerSettings) -> Harness {
        let metrics = Arc::new(QueueMetrics::new());
        let queue = Arc::new(TaskQueue::new(
            Arc::new(MemoryStore::new()),
            QueueSettings {
                ttl: Duration::from_secs(3600),
                ..QueueSettings::default()
            },
            Arc::clone(&metrics),
        ));
        let client = Arc::new(client);
        let endpoints = (0..backend_count)
            .map(|i| (format!("http://backend-{}", i), ApiKey::new("key")))
            .collect();
        let backends = Arc::new(BackendPool::new(endpoints, client.clone(), PoolSettings::default()));
        let pool = WorkerPool::new(Arc::clone(&queue), Arc::clone(&backends), metrics, settings);
        Harness {
            queue,
            backends,
            pool,
            client,
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            worker_count: 2,
            pop_timeout: Duration::from_millis(200),
            ..WorkerSettings::default()
        }
    }

    async fn wait_for_terminal(queue: &TaskQueue, task_id: &str) -> TaskStatus {
        for _ in 0..10_000 {
            if let Some(status) = queue.status(task_id).await.unwrap() {
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {} never finished", task_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_completes_with_backend_answer() {
        let h = harness(ScriptedClient::new(vec![], Ok("Yes, soon.".into())), 1, settings());
        let task = Task::new("u1", "Will I find love?", vec![1, 15, 21]);
        h.queue.push(&task).await.unwrap();
        assert_eq!(h.queue.status(&task.id).await.unwrap(), Some(TaskStatus::Pending));

        h.pool.start();
        assert_eq!(wait_for_terminal(&h.queue, &task.id).await, TaskStatus::Completed);
        assert_eq!(h.queue.result(&task.id).await.unwrap().as_deref(), Some("Yes, soon."));
        assert!(h.pool.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let client = ScriptedClient::new(
            vec![Err(BackendError::Transport("connection reset".into()))],
            Ok("The Star: hope.".into()),
        );
        let h = harness(client, 1, settings());
        let task = Task::new("u1", "q", vec![17]);
        h.queue.push(&task).await.unwrap();

        h.pool.start();
        assert_eq!(wait_for_terminal(&h.queue, &task.id).await, TaskStatus::Completed);
        assert_eq!(h.client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.backends.statuses()[0].error_count, 0);
        h.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_backends_failing_marks_task_failed() {
        let client = ScriptedClient::new(
            vec![],
            Err(BackendError::Status { status: 500, body: "model overloaded".into() }),
        );
        let h = harness(client, 2, settings());
        let task = Task::new("u1", "q", vec![1, 2, 3]);
        h.queue.push(&task).await.unwrap();

        let started = Instant::now();
        h.pool.start();
        assert_eq!(wait_for_terminal(&h.queue, &task.id).await, TaskStatus::Failed);
        assert!(started.elapsed() >= Duration::from_secs(10));

        let progress = h.queue.progress(&task.id).await.unwrap().unwrap();
        let message = progress.error.unwrap();
        assert!(message.contains("failed after 3 attempt(s)"), "{}", message);
        assert!(message.contains("model overloaded"), "{}", message);
        assert_eq!(h.client.calls.load(Ordering::SeqCst), 3);
        h.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_fatal() {
        let client = ScriptedClient::new(vec![], Ok("late".into())).with_delay(Duration::from_secs(20));
        let h = harness(
            client,
            1,
            WorkerSettings {
                task_deadline: Duration::from_secs(5),
                ..settings()
            },
        );
        let task = Task::new("u1", "q", vec![9]);
        h.queue.push(&task).await.unwrap();

        h.pool.start();
        assert_eq!(wait_for_terminal(&h.queue, &task.id).await, TaskStatus::Failed);
        let error = h.queue.progress(&task.id).await.unwrap().unwrap().error.unwrap();
        assert!(error.contains("deadline exceeded"), "{}", error);
        assert_eq!(h.client.calls.load(Ordering::SeqCst), 1);
        // Giving up on the caller's side does not count against the backend.
        assert_eq!(h.backends.statuses()[0].error_count, 0);
        h.pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_of_idle_pool() {
        let h = harness(ScriptedClient::new(vec![], Ok("ok".into())), 1, settings());
        h.pool.start();
        tokio::task::yield_now().await;
        assert_eq!(h.pool.running_workers(), 2);
        assert!(h.pool.shutdown().await);
        assert_eq!(h.pool.running_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_aborts_in_flight_task() {
        let client = ScriptedClient::new(vec![], Ok("never".into())).with_delay(Duration::from_secs(3600));
        let h = harness(
            client,
            1,
            WorkerSettings {
                worker_count: 1,
                shutdown_timeout: Duration::from_secs(1),
                task_deadline: Duration::from_secs(7200),
                ..settings()
            },
        );
        let task = Task::new("u1", "q", vec![4]);
        h.queue.push(&task).await.unwrap();
        h.pool.start();

        while h.queue.status(&task.id).await.unwrap() != Some(TaskStatus::Running) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!h.pool.shutdown().await);
        // Aborted loops record the failure before shutdown returns.
        assert_eq!(h.queue.status(&task.id).await.unwrap(), Some(TaskStatus::Failed));
        let error = h.queue.progress(&task.id).await.unwrap().unwrap().error.unwrap();
        assert!(error.contains("cancelled"), "{}", error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_deadline_means_no_deadline() {
        let h = harness(
            ScriptedClient::new(vec![], Ok("Yes, soon.".into())),
            1,
            WorkerSettings {
                task_deadline: Duration::from_secs(u64::MAX),
                ..settings()
            },
        );
        let task = Task::new("u1", "q", vec![3]);
        h.queue.push(&task).await.unwrap();

        h.pool.start();
        assert_eq!(wait_for_terminal(&h.queue, &task.id).await, TaskStatus::Completed);
        assert_eq!(h.pool.running_workers(), 2);
        assert!(h.pool.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_passing_during_retry_delay_skips_selection() {
        let client = ScriptedClient::new(vec![], Err(BackendError::Transport("connection reset".into())));
        let h = harness(
            client,
            1,
            WorkerSettings {
                task_deadline: Duration::from_secs(5),
                retry_delay: Duration::from_secs(10),
                ..settings()
            },
        );
        let task = Task::new("u1", "q", vec![12]);
        h.queue.push(&task).await.unwrap();

        h.pool.start();
        assert_eq!(wait_for_terminal(&h.queue, &task.id).await, TaskStatus::Failed);
        let error = h.queue.progress(&task.id).await.unwrap().unwrap().error.unwrap();
        assert!(error.contains("deadline exceeded"), "{}", error);
        assert_eq!(h.client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backends.statuses()[0].recent_requests, 1);
        h.pool.shutdown().await;
    }
}
