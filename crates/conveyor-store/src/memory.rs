use async_trait::async_trait;
use conveyor_core::{ConveyorResult, Task, TaskStatus, TaskStore, WorkflowSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// In-memory [`TaskStore`] keyed by task id.
///
/// All mutation happens under a single write lock, so the claim is a
/// conditional update: only a `Queued` task can move to `Claimed`.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    workflows: RwLock<HashMap<Uuid, WorkflowSnapshot>>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks in the store (any status).
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Whether the store holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Count of tasks currently queued.
    pub fn queued_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn fetch_candidates(&self, limit: usize) -> ConveyorResult<Vec<Task>> {
        let tasks = self.tasks.read();
        let mut queued: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        // Highest priority first, oldest first within a priority.
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        queued.truncate(limit);
        Ok(queued)
    }

    async fn claim_atomic(&self, task_id: Uuid, executor_id: &str) -> ConveyorResult<bool> {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(executor_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn persist(&self, task: &Task) -> ConveyorResult<()> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn update_workflow_state(
        &self,
        task_id: Uuid,
        snapshot: &WorkflowSnapshot,
    ) -> ConveyorResult<()> {
        self.workflows.write().insert(task_id, snapshot.clone());
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> ConveyorResult<Option<Task>> {
        Ok(self.tasks.read().get(&task_id).cloned())
    }

    async fn workflow_state(&self, task_id: Uuid) -> ConveyorResult<Option<WorkflowSnapshot>> {
        Ok(self.workflows.read().get(&task_id).cloned())
    }
}
