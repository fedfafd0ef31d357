use chrono::{DateTime, Utc};
use conveyor_core::Task;
use serde::{Deserialize, Serialize};

/// Tuning knobs for the priority+aging+short-task score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Weight applied to the task's priority.
    #[serde(default = "default_priority_weight")]
    pub priority_weight: f64,
    /// Seconds of waiting per aging point.
    #[serde(default = "default_aging_divisor_secs")]
    pub aging_divisor_secs: f64,
    /// Cap on the aging contribution.
    #[serde(default = "default_aging_cap")]
    pub aging_cap: f64,
    /// Bonus for short tasks when the pool is busy.
    #[serde(default = "default_short_task_bonus")]
    pub short_task_bonus: f64,
    /// Utilization above which the short-task bonus applies.
    #[serde(default = "default_busy_utilization")]
    pub busy_utilization: f64,
    /// Estimated duration below which a task counts as short, in seconds.
    #[serde(default = "default_short_task_secs")]
    pub short_task_secs: u64,
}

fn default_priority_weight() -> f64 {
    10.0
}
fn default_aging_divisor_secs() -> f64 {
    300.0
}
fn default_aging_cap() -> f64 {
    5.0
}
fn default_short_task_bonus() -> f64 {
    3.0
}
fn default_busy_utilization() -> f64 {
    0.7
}
fn default_short_task_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priority_weight: default_priority_weight(),
            aging_divisor_secs: default_aging_divisor_secs(),
            aging_cap: default_aging_cap(),
            short_task_bonus: default_short_task_bonus(),
            busy_utilization: default_busy_utilization(),
            short_task_secs: default_short_task_secs(),
        }
    }
}

/// Selects the next task to run from a page of pending candidates.
///
/// Pure: the same candidates, utilization, and clock always select the same
/// task, which keeps the selection directly unit-testable.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler with the given tuning.
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Score one candidate: `priority * weight + aging + short-task bonus`.
    ///
    /// Aging is `wait_secs / aging_divisor` capped at `aging_cap`. The bonus
    /// applies when pool utilization exceeds `busy_utilization` and the
    /// caller-supplied duration estimate is under `short_task_secs`.
    pub fn score(&self, task: &Task, utilization: f64, now: DateTime<Utc>) -> f64 {
        let cfg = &self.config;
        let aging = (task.wait_secs(now) / cfg.aging_divisor_secs).min(cfg.aging_cap);
        let bonus = match task.estimated_duration_secs {
            Some(est) if utilization > cfg.busy_utilization && est < cfg.short_task_secs => {
                cfg.short_task_bonus
            }
            _ => 0.0,
        };
        f64::from(task.priority) * cfg.priority_weight + aging + bonus
    }

    /// Pick the highest-scoring candidate, or `None` when the page is empty.
    ///
    /// Ties break stably on the earliest `created_at`.
    pub fn select_next(&self, candidates: &[Task], utilization: f64) -> Option<Task> {
        let now = Utc::now();
        candidates
            .iter()
            .max_by(|a, b| {
                let sa = self.score(a, utilization, now);
                let sb = self.score(b, utilization, now);
                sa.partial_cmp(&sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // On equal scores prefer the older task: it must compare
                    // as "greater" to win max_by.
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .cloned()
    }
}
