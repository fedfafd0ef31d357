use crate::metrics::PoolMetrics;
use crate::runner::WorkflowRunner;
use crate::scheduler::Scheduler;
use conveyor_core::{ConveyorError, ConveyorResult, Task, TaskStatus, TaskStore, WorkflowVerdict};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Admission-loop and concurrency tuning for the executor pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorPoolConfig {
    /// Identity written into `claimed_by` on every claim.
    #[serde(default = "default_executor_id")]
    pub executor_id: String,
    /// Permit pool size at startup.
    #[serde(default = "default_initial_max_concurrent")]
    pub initial_max_concurrent: usize,
    /// Sleep between admission attempts when no task is runnable.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How many pending candidates to page in per selection.
    #[serde(default = "default_candidate_page_size")]
    pub candidate_page_size: usize,
    /// Timeout for each agent call, milliseconds.
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    /// How long shutdown waits for in-flight workflows before cancelling.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_executor_id() -> String {
    format!("executor-{}", Uuid::new_v4())
}
fn default_initial_max_concurrent() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_candidate_page_size() -> usize {
    10
}
fn default_agent_timeout_ms() -> u64 {
    30_000
}
fn default_drain_timeout_ms() -> u64 {
    30_000
}

impl Default for ExecutorPoolConfig {
    fn default() -> Self {
        Self {
            executor_id: default_executor_id(),
            initial_max_concurrent: default_initial_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
            candidate_page_size: default_candidate_page_size(),
            agent_timeout_ms: default_agent_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ExecutorPoolConfig {
    /// Agent-call timeout as a [`Duration`].
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }
}

/// Bounded-concurrency workflow executor.
///
/// The admission loop claims one task at a time: fetch a candidate page,
/// let the scheduler pick, attempt the atomic claim, and spawn the claimed
/// workflow holding an owned permit. The permit is owned by the spawned
/// task, so it is released on every exit path including panics and
/// cancellation. The pool is the sole writer of [`PoolMetrics`] workflow
/// start/stop accounting.
pub struct ExecutorPool {
    config: ExecutorPoolConfig,
    store: Arc<dyn TaskStore>,
    scheduler: Scheduler,
    runner: Arc<WorkflowRunner>,
    metrics: Arc<PoolMetrics>,
    semaphore: Arc<Semaphore>,
    resize_lock: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl ExecutorPool {
    /// Create a pool sized to `config.initial_max_concurrent`.
    pub fn new(
        config: ExecutorPoolConfig,
        store: Arc<dyn TaskStore>,
        scheduler: Scheduler,
        runner: Arc<WorkflowRunner>,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        metrics.set_max_concurrent(config.initial_max_concurrent);
        let semaphore = Arc::new(Semaphore::new(config.initial_max_concurrent));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            scheduler,
            runner,
            metrics,
            semaphore,
            resize_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run the admission loop until [`ExecutorPool::shutdown`] is called,
    /// then drain in-flight workflows.
    pub async fn run(self: Arc<Self>) -> ConveyorResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut workflows: JoinSet<()> = JoinSet::new();
        info!(
            executor_id = %self.config.executor_id,
            max_concurrent = self.config.initial_max_concurrent,
            "Executor pool started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            // Reap finished workflows so the join set stays bounded.
            while workflows.try_join_next().is_some() {}

            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
                _ = shutdown_rx.changed() => break,
            };

            // A store error must not take the pool down mid-run: in-flight
            // workflows keep running and admission backs off until the
            // store recovers. Only shutdown exits the loop.
            let candidates = match self
                .store
                .fetch_candidates(self.config.candidate_page_size)
                .await
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(error = %err, "Candidate fetch failed, backing off");
                    drop(permit);
                    self.idle_wait(&mut shutdown_rx).await;
                    continue;
                }
            };
            self.metrics.sample_queue_depth(candidates.len());

            let Some(task) = self
                .scheduler
                .select_next(&candidates, self.metrics.utilization())
            else {
                drop(permit);
                self.idle_wait(&mut shutdown_rx).await;
                continue;
            };

            let claimed = match self
                .store
                .claim_atomic(task.id, &self.config.executor_id)
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "Claim failed, backing off");
                    drop(permit);
                    self.idle_wait(&mut shutdown_rx).await;
                    continue;
                }
            };
            if !claimed {
                // Lost the race; benign, go pick again.
                drop(permit);
                continue;
            }

            let mut task = task;
            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(self.config.executor_id.clone());

            self.metrics.workflow_started();
            self.in_flight.lock().insert(task.id);

            let pool = Arc::clone(&self);
            workflows.spawn(async move {
                let _permit = permit;
                let task_id = task.id;
                let started = Instant::now();
                // Backstop for panics that escape the runner's own
                // agent-call guard: accounting must still settle.
                let verdict = match AssertUnwindSafe(pool.runner.run(task)).catch_unwind().await {
                    Ok(verdict) => verdict,
                    Err(_panic) => Err(ConveyorError::Engine(
                        "workflow execution panicked".to_string(),
                    )),
                };
                pool.settle(task_id, verdict, started.elapsed()).await;
            });
        }

        self.drain(workflows).await
    }

    /// Request a graceful stop of the admission loop.
    pub fn shutdown(&self) {
        info!(executor_id = %self.config.executor_id, "Executor pool shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Converge the permit pool to `new_size`.
    ///
    /// Growing adds permits immediately. Shrinking acquires the surplus
    /// permits and forgets them, which blocks until enough in-flight
    /// workflows finish; nothing running is cancelled.
    pub async fn resize(&self, new_size: usize) -> ConveyorResult<()> {
        if new_size == 0 {
            return Err(ConveyorError::Engine(
                "pool size must be at least 1".to_string(),
            ));
        }
        let _guard = self.resize_lock.lock().await;
        let current = self.metrics.max_concurrent();
        if new_size > current {
            self.semaphore.add_permits(new_size - current);
        } else if new_size < current {
            let surplus = (current - new_size) as u32;
            let permits = Arc::clone(&self.semaphore)
                .acquire_many_owned(surplus)
                .await
                .map_err(|_| ConveyorError::Engine("permit pool closed".to_string()))?;
            permits.forget();
        }
        self.metrics.set_max_concurrent(new_size);
        info!(
            executor_id = %self.config.executor_id,
            from = current,
            to = new_size,
            "Pool resized"
        );
        Ok(())
    }

    /// Current concurrency limit.
    pub fn max_concurrent(&self) -> usize {
        self.metrics.max_concurrent()
    }

    async fn idle_wait(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    /// Terminal accounting for one workflow, run inside the spawned task.
    async fn settle(
        &self,
        task_id: Uuid,
        verdict: ConveyorResult<WorkflowVerdict>,
        elapsed: Duration,
    ) {
        self.in_flight.lock().remove(&task_id);
        match verdict {
            Ok(WorkflowVerdict::Success) => self.metrics.workflow_completed(elapsed),
            Ok(WorkflowVerdict::Failed { .. }) => self.metrics.workflow_failed(elapsed),
            Err(err) => {
                error!(task_id = %task_id, error = %err, "Workflow aborted");
                if let Ok(Some(mut task)) = self.store.get(task_id).await {
                    if !task.is_terminal() {
                        task.status = TaskStatus::Failed {
                            reason: err.to_string(),
                        };
                        if let Err(persist_err) = self.store.persist(&task).await {
                            error!(task_id = %task_id, error = %persist_err, "Failed to persist aborted task");
                        }
                    }
                }
                self.metrics.workflow_failed(elapsed);
            }
        }
    }

    /// Wait out in-flight workflows, force-cancelling past the drain
    /// timeout. Cancelled tasks are marked `Failed` with a shutdown reason
    /// so no accounting state leaks.
    async fn drain(&self, mut workflows: JoinSet<()>) -> ConveyorResult<()> {
        let pending = workflows.len();
        if pending > 0 {
            info!(pending, "Draining in-flight workflows");
        }
        let deadline = Duration::from_millis(self.config.drain_timeout_ms);
        let drained = tokio::time::timeout(deadline, async {
            while workflows.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Drain timeout elapsed, cancelling remaining workflows");
            workflows.abort_all();
            while workflows.join_next().await.is_some() {}

            let leftovers: Vec<Uuid> = self.in_flight.lock().drain().collect();
            for task_id in leftovers {
                // A store error here must not skip the remaining leftovers,
                // so the accounting settles for every cancelled workflow.
                match self.store.get(task_id).await {
                    Ok(Some(mut task)) => {
                        task.status = TaskStatus::Failed {
                            reason: "executor shut down before completion".to_string(),
                        };
                        if let Err(err) = self.store.persist(&task).await {
                            error!(task_id = %task_id, error = %err, "Failed to persist cancelled task");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(task_id = %task_id, error = %err, "Failed to load cancelled task");
                    }
                }
                self.metrics.workflow_failed(deadline);
            }
        }

        info!(executor_id = %self.config.executor_id, "Executor pool stopped");
        Ok(())
    }
}

/// Submit a new task: create it `Queued` in the store and return its id.
///
/// `estimated_duration_secs` is the caller's short-task heuristic for the
/// scheduler; pass `None` when unknown. Lives beside the pool rather than
/// on it so the gateway can submit without holding a pool handle.
pub async fn submit(
    store: &dyn TaskStore,
    payload: serde_json::Value,
    priority: i32,
    estimated_duration_secs: Option<u64>,
) -> ConveyorResult<Uuid> {
    let mut task = Task::new(payload, priority);
    if let Some(secs) = estimated_duration_secs {
        task = task.with_estimated_duration(secs);
    }
    let id = task.id;
    store.persist(&task).await?;
    info!(task_id = %id, priority, "Task submitted");
    Ok(id)
}
