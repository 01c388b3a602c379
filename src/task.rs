//! Reading tasks and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TarotError;

/// Lifecycle of a task. Transitions only move forward:
/// `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TarotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TarotError::Internal(format!("unknown task status '{}'", other))),
        }
    }
}

/// One tarot reading request travelling through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub question: String,
    pub cards: Vec<u32>,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(user_id: impl Into<String>, question: impl Into<String>, cards: Vec<u32>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_task_id(),
            user_id: user_id.into(),
            question: question.into(),
            cards,
            status: TaskStatus::Pending,
            result: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing backward or sideways transitions.
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), TarotError> {
        if !self.status.can_transition_to(next) {
            return Err(TarotError::Internal(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Cards in the comma separated form the interpretation backend expects.
    pub fn cards_param(&self) -> String {
        self.cards
            .iter()
            .map(|card| card.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn generate_task_id() -> String {
    format!("task_{}", uuid::Uuid::new_v4().simple())
}

/// What a poller sees for a task id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskProgress {
    pub fn new(task_id: impl Into<String>, status: TaskStatus, stored_result: Option<String>) -> Self {
        let stored_result = stored_result.filter(|r| !r.is_empty());
        let (result, error) = match status {
            TaskStatus::Completed => (stored_result, None),
            TaskStatus::Failed => (None, stored_result),
            TaskStatus::Pending | TaskStatus::Running => (None, None),
        };
        Self {
            task_id: task_id.into(),
            status,
            result,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_only_move_forward() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_task_advance() {
        let mut task = Task::new("u1", "Will I find love?", vec![1, 15, 21]);
        assert_eq!(task.status, TaskStatus::Pending);
        task.advance(TaskStatus::Running).unwrap();
        task.advance(TaskStatus::Completed).unwrap();
        assert!(task.advance(TaskStatus::Running).is_err());
    }

    #[test]
    fn test_task_serialization_uses_lowercase_status() {
        let task = Task::new("u1", "q", vec![3]);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json["id"].as_str().unwrap().starts_with("task_"));
    }

    #[test]
    fn test_cards_param() {
        let task = Task::new("u1", "q", vec![1, 15, 21]);
        assert_eq!(task.cards_param(), "1,15,21");
    }

    #[test]
    fn test_progress_splits_result_and_error() {
        let done = TaskProgress::new("t", TaskStatus::Completed, Some("Yes, soon.".into()));
        assert_eq!(done.result.as_deref(), Some("Yes, soon."));
        assert!(done.error.is_none());

        let failed = TaskProgress::new("t", TaskStatus::Failed, Some("boom".into()));
        assert!(failed.result.is_none());
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let pending = TaskProgress::new("t", TaskStatus::Pending, None);
        assert!(pending.result.is_none() && pending.error.is_none());
    }
}
