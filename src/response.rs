use serde::Serialize;

use crate::metrics::MetricsSnapshot;
use crate::task::TaskStatus;

/// Reply to an accepted reading submission.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

impl SubmitResponse {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealthResponse {
    pub status: String,
    pub component: String,
}

impl ComponentHealthResponse {
    pub fn ok(component: &str) -> Self {
        Self {
            status: "ok".to_string(),
            component: component.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    /// `None` when the store could not be reached.
    pub queue_depth: Option<u64>,
    #[serde(flatten)]
    pub queue: MetricsSnapshot,
}
