use crate::task::Task;
use crate::workflow::WorkflowSnapshot;
use crate::ConveyorResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Durable, queryable task storage with an atomic claim operation.
///
/// The claim is the sole correctness-critical invariant the engine relies
/// on: for any number of concurrent [`TaskStore::claim_atomic`] calls on a
/// single queued task, exactly one succeeds. Implementations backed by
/// shared storage must enforce this with a conditional update — once
/// multiple pool instances exist, in-process locking alone is not enough.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Return up to `limit` queued tasks, best candidates first
    /// (highest priority, then oldest).
    async fn fetch_candidates(&self, limit: usize) -> ConveyorResult<Vec<Task>>;

    /// Atomically claim a task for `executor_id`.
    ///
    /// Succeeds (returns `true`) only if the task is currently `Queued`;
    /// returns `false` when the claim race was lost or the task moved on.
    async fn claim_atomic(&self, task_id: Uuid, executor_id: &str) -> ConveyorResult<bool>;

    /// Insert or update a task record.
    async fn persist(&self, task: &Task) -> ConveyorResult<()>;

    /// Persist the latest workflow snapshot for a task.
    async fn update_workflow_state(
        &self,
        task_id: Uuid,
        snapshot: &WorkflowSnapshot,
    ) -> ConveyorResult<()>;

    /// Look up a task by id.
    async fn get(&self, task_id: Uuid) -> ConveyorResult<Option<Task>>;

    /// Look up the latest workflow snapshot for a task.
    async fn workflow_state(&self, task_id: Uuid) -> ConveyorResult<Option<WorkflowSnapshot>>;
}
