use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Queue operation being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    Push,
    Pop,
    Process,
}

#[derive(Debug, Default)]
struct OpCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default)]
struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            avg_ms: if count == 0 { 0.0 } else { total as f64 / count as f64 },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Lock-free counters shared by the queue and the worker pool.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    push: OpCounters,
    pop: OpCounters,
    process: OpCounters,
    push_latency: LatencyStats,
    processing_time: LatencyStats,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, op: QueueOp) -> &OpCounters {
        match op {
            QueueOp::Push => &self.push,
            QueueOp::Pop => &self.pop,
            QueueOp::Process => &self.process,
        }
    }

    pub fn record_success(&self, op: QueueOp) {
        self.counters(op).succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, op: QueueOp) {
        self.counters(op).failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_latency(&self, elapsed: Duration) {
        self.push_latency.record(elapsed);
    }

    pub fn record_processing_time(&self, elapsed: Duration) {
        self.processing_time.record(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let op = |c: &OpCounters| OpSnapshot {
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        };
        MetricsSnapshot {
            push: op(&self.push),
            pop: op(&self.pop),
            process: op(&self.process),
            push_latency: self.push_latency.snapshot(),
            processing_time: self.processing_time.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpSnapshot {
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub push: OpSnapshot,
    pub pop: OpSnapshot,
    pub process: OpSnapshot,
    pub push_latency: LatencySnapshot,
    pub processing_time: LatencySnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_operation() {
        let metrics = QueueMetrics::new();
        metrics.record_success(QueueOp::Push);
        metrics.record_success(QueueOp::Push);
        metrics.record_error(QueueOp::Process);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.push, OpSnapshot { succeeded: 2, failed: 0 });
        assert_eq!(snapshot.process, OpSnapshot { succeeded: 0, failed: 1 });
        assert_eq!(snapshot.pop, OpSnapshot { succeeded: 0, failed: 0 });
    }

    #[test]
    fn test_latency_stats() {
        let metrics = QueueMetrics::new();
        metrics.record_processing_time(Duration::from_millis(10));
        metrics.record_processing_time(Duration::from_millis(30));

        let latency = metrics.snapshot().processing_time;
        assert_eq!(latency.count, 2);
        assert_eq!(latency.avg_ms, 20.0);
        assert_eq!(latency.max_ms, 30);
    }
}
