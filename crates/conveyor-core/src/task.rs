use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task in its lifecycle.
///
/// Transitions: `Queued` → `Claimed` (atomic claim only) → `Running` →
/// `Completed` or `Failed`. A task returned to the queue by a dead-letter
/// requeue goes back to `Queued` with its retry count reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for an executor to claim it.
    Queued,
    /// Claimed by exactly one executor, workflow not yet started.
    Claimed,
    /// The workflow is being driven through its phases.
    Running,
    /// The workflow reached `Complete(success)`.
    Completed,
    /// The workflow reached `Complete(failed)`.
    Failed {
        /// Why the task failed (last error, rejection reason, or shutdown).
        reason: String,
    },
}

/// A unit of work submitted to the engine.
///
/// The payload is an opaque blob interpreted by the phase agents; the
/// engine only routes it. At most one executor ever holds a non-null
/// `claimed_by` while the status is `Claimed` or `Running` — enforced by
/// [`crate::TaskStore::claim_atomic`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: Uuid,
    /// Opaque payload handed to each phase agent.
    pub payload: serde_json::Value,
    /// Scheduling priority; higher is more urgent.
    pub priority: i32,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// UTC timestamp of submission.
    pub created_at: DateTime<Utc>,
    /// Identity of the executor holding the claim, if any.
    pub claimed_by: Option<String>,
    /// Number of failed phase attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Caller-supplied duration estimate in seconds, used by the
    /// scheduler's short-task bonus. Not computed by the engine.
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
}

impl Task {
    /// Create a new queued task with the given payload and priority.
    pub fn new(payload: serde_json::Value, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            claimed_by: None,
            retry_count: 0,
            estimated_duration_secs: None,
        }
    }

    /// Attach a duration estimate for the scheduler's short-task bonus.
    pub fn with_estimated_duration(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    /// Whether the task is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. }
        )
    }

    /// Seconds this task has been waiting since submission, clamped at zero.
    pub fn wait_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new(serde_json::json!({"repo": "api"}), 5);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, 5);
        assert_eq!(task.retry_count, 0);
        assert!(task.claimed_by.is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        let mut task = Task::new(serde_json::Value::Null, 0);
        task.status = TaskStatus::Completed;
        assert!(task.is_terminal());
        task.status = TaskStatus::Failed {
            reason: "boom".into(),
        };
        assert!(task.is_terminal());
        task.status = TaskStatus::Running;
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_wait_secs_never_negative() {
        let mut task = Task::new(serde_json::Value::Null, 0);
        task.created_at = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(task.wait_secs(Utc::now()), 0.0);
    }

    #[test]
    fn test_status_serialization() {
        let status = TaskStatus::Failed {
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("timeout"));
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);

        let queued = serde_json::to_string(&TaskStatus::Queued).unwrap();
        assert_eq!(queued, "\"queued\"");
    }
}
