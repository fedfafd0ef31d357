use chrono::{DateTime, Utc};
use conveyor_core::{ConveyorError, ConveyorResult, Task, TaskStatus, TaskStore, WorkflowSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// A workflow that exhausted its retry budget, parked for human remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// The task whose workflow dead-lettered.
    pub task_id: Uuid,
    /// Workflow state at the moment of failure (full phase history).
    pub workflow_snapshot: WorkflowSnapshot,
    /// The last error, verbatim.
    pub error: String,
    /// Failed attempts accumulated by the task.
    pub retry_count: u32,
    /// When the workflow dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// Whether a human has dealt with this entry.
    pub resolved: bool,
    /// Operator notes recorded on resolve/requeue.
    pub resolution_notes: Option<String>,
}

/// Holds dead-lettered workflows for inspection and replay.
///
/// Requeueing resets the task to `Queued` and relies on the normal
/// scheduler/pool loop to pick it up; nothing re-runs eagerly. The original
/// task record keeps its `Failed` status until then.
#[derive(Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl DeadLetterQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// File a dead-letter entry for a task.
    pub fn enqueue(
        &self,
        task_id: Uuid,
        workflow_snapshot: WorkflowSnapshot,
        error: impl Into<String>,
        retry_count: u32,
    ) -> Uuid {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            task_id,
            workflow_snapshot,
            error: error.into(),
            retry_count,
            failed_at: Utc::now(),
            resolved: false,
            resolution_notes: None,
        };
        let id = entry.id;
        info!(task_id = %task_id, entry_id = %id, retry_count, "Task dead-lettered");
        self.entries.lock().push(entry);
        id
    }

    /// Unresolved entries, oldest first, up to `limit`.
    pub fn list(&self, limit: usize) -> Vec<DeadLetterEntry> {
        let entries = self.entries.lock();
        let mut unresolved: Vec<DeadLetterEntry> =
            entries.iter().filter(|e| !e.resolved).cloned().collect();
        unresolved.sort_by_key(|e| e.failed_at);
        unresolved.truncate(limit);
        unresolved
    }

    /// Look up one entry by id.
    pub fn get(&self, entry_id: Uuid) -> Option<DeadLetterEntry> {
        self.entries.lock().iter().find(|e| e.id == entry_id).cloned()
    }

    /// Count of entries awaiting remediation.
    pub fn unresolved_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| !e.resolved).count()
    }

    /// Reset the referenced task to `Queued` with a fresh retry budget and
    /// mark the entry resolved. Returns the task id.
    pub async fn requeue(&self, entry_id: Uuid, store: &dyn TaskStore) -> ConveyorResult<Uuid> {
        let task_id = {
            let entries = self.entries.lock();
            let entry = entries
                .iter()
                .find(|e| e.id == entry_id && !e.resolved)
                .ok_or_else(|| {
                    ConveyorError::Engine(format!("no unresolved DLQ entry {entry_id}"))
                })?;
            entry.task_id
        };

        let mut task: Task = store.get(task_id).await?.ok_or_else(|| {
            ConveyorError::Store(format!("task {task_id} referenced by DLQ entry not found"))
        })?;
        task.status = TaskStatus::Queued;
        task.claimed_by = None;
        task.retry_count = 0;
        store.persist(&task).await?;

        self.mark_resolved(entry_id, Some("requeued".to_string()));
        info!(task_id = %task_id, entry_id = %entry_id, "Dead-letter entry requeued");
        Ok(task_id)
    }

    /// Mark an entry resolved without requeueing the task.
    pub fn resolve(&self, entry_id: Uuid, notes: impl Into<String>) -> ConveyorResult<()> {
        let notes = notes.into();
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id && !e.resolved)
            .ok_or_else(|| ConveyorError::Engine(format!("no unresolved DLQ entry {entry_id}")))?;
        entry.resolved = true;
        entry.resolution_notes = Some(notes);
        Ok(())
    }

    fn mark_resolved(&self, entry_id: Uuid, notes: Option<String>) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == entry_id) {
            entry.resolved = true;
            entry.resolution_notes = notes;
        }
    }
}
