use crate::metrics::PoolMetrics;
use crate::pool::ExecutorPool;
use conveyor_core::ConveyorResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Bounds and thresholds for utilization-driven pool resizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    /// Lower bound on the pool size.
    #[serde(default = "default_min_concurrent")]
    pub min_concurrent: usize,
    /// Upper bound on the pool size.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Utilization at or above which the pool grows.
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    /// Utilization at or below which the pool shrinks.
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    /// Permits added per scale-up.
    #[serde(default = "default_scale_up_increment")]
    pub scale_up_increment: usize,
    /// Permits removed per scale-down.
    #[serde(default = "default_scale_down_increment")]
    pub scale_down_increment: usize,
    /// Minimum seconds between actions.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Seconds between evaluations.
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
}

fn default_min_concurrent() -> usize {
    2
}
fn default_max_concurrent() -> usize {
    16
}
fn default_scale_up_threshold() -> f64 {
    0.8
}
fn default_scale_down_threshold() -> f64 {
    0.3
}
fn default_scale_up_increment() -> usize {
    2
}
fn default_scale_down_increment() -> usize {
    1
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_evaluation_interval_secs() -> u64 {
    15
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_concurrent: default_min_concurrent(),
            max_concurrent: default_max_concurrent(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            scale_up_increment: default_scale_up_increment(),
            scale_down_increment: default_scale_down_increment(),
            cooldown_secs: default_cooldown_secs(),
            evaluation_interval_secs: default_evaluation_interval_secs(),
        }
    }
}

/// Periodically resizes the executor pool from observed utilization.
///
/// `min_concurrent <= size <= max_concurrent` holds after every action.
/// Scale-down goes through [`ExecutorPool::resize`], which waits for
/// permits to return naturally rather than cancelling running workflows.
pub struct Autoscaler {
    config: AutoscalerConfig,
    metrics: Arc<PoolMetrics>,
    pool: Arc<ExecutorPool>,
    last_action: Mutex<Option<Instant>>,
}

impl Autoscaler {
    /// Create an autoscaler over the pool and its metrics.
    pub fn new(config: AutoscalerConfig, metrics: Arc<PoolMetrics>, pool: Arc<ExecutorPool>) -> Self {
        Self {
            config,
            metrics,
            pool,
            last_action: Mutex::new(None),
        }
    }

    /// Target size for the given utilization and current size, or `None`
    /// to hold. Pure, ignores cooldown.
    pub fn decide(&self, utilization: f64, current: usize) -> Option<usize> {
        let c = &self.config;
        if utilization >= c.scale_up_threshold && current < c.max_concurrent {
            Some((current + c.scale_up_increment).min(c.max_concurrent))
        } else if utilization <= c.scale_down_threshold && current > c.min_concurrent {
            Some(
                current
                    .saturating_sub(c.scale_down_increment)
                    .max(c.min_concurrent),
            )
        } else {
            None
        }
    }

    /// One evaluation: apply a resize unless holding or in cooldown.
    ///
    /// Returns the new size when an action was taken.
    pub async fn tick(&self) -> ConveyorResult<Option<usize>> {
        let cooling = match *self.last_action.lock() {
            Some(at) => at.elapsed() < Duration::from_secs(self.config.cooldown_secs),
            None => false,
        };
        if cooling {
            return Ok(None);
        }

        let current = self.metrics.max_concurrent();
        let utilization = self.metrics.utilization();
        let Some(target) = self.decide(utilization, current) else {
            return Ok(None);
        };

        self.pool.resize(target).await?;
        *self.last_action.lock() = Some(Instant::now());
        info!(
            utilization,
            from = current,
            to = target,
            "Autoscaler resized pool"
        );
        Ok(Some(target))
    }

    /// Evaluate on a timer; runs until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.evaluation_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                error!(error = %err, "Autoscaler evaluation failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use crate::dlq::DeadLetterQueue;
    use crate::pool::ExecutorPoolConfig;
    use crate::retry::RetryPolicy;
    use crate::runner::WorkflowRunner;
    use crate::scheduler::Scheduler;
    use conveyor_core::{AgentRegistry, TaskStore};
    use conveyor_store::MemoryTaskStore;

    /// Idle pool whose size starts at `initial`; never started.
    fn idle_pool(initial: usize) -> (Arc<ExecutorPool>, Arc<PoolMetrics>) {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let metrics = Arc::new(PoolMetrics::new(initial));
        let runner = Arc::new(WorkflowRunner::new(
            Arc::clone(&store),
            Arc::new(AgentRegistry::new()),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            RetryPolicy::default(),
            Arc::new(DeadLetterQueue::new()),
            Arc::clone(&metrics),
            Duration::from_secs(5),
        ));
        let pool = Arc::new(ExecutorPool::new(
            ExecutorPoolConfig {
                initial_max_concurrent: initial,
                ..ExecutorPoolConfig::default()
            },
            store,
            Scheduler::default(),
            runner,
            Arc::clone(&metrics),
        ));
        (pool, metrics)
    }

    #[test]
    fn test_decide_respects_bounds() {
        let (pool, metrics) = idle_pool(4);
        let scaler = Autoscaler::new(AutoscalerConfig::default(), metrics, pool);

        // Busy pool grows by the increment, capped at the upper bound.
        assert_eq!(scaler.decide(0.9, 4), Some(6));
        assert_eq!(scaler.decide(0.9, 15), Some(16));
        assert_eq!(scaler.decide(0.9, 16), None);

        // Idle pool shrinks by the increment, floored at the lower bound.
        assert_eq!(scaler.decide(0.1, 6), Some(5));
        assert_eq!(scaler.decide(0.1, 2), None);

        // Mid-band holds.
        assert_eq!(scaler.decide(0.5, 4), None);
    }

    #[tokio::test]
    async fn test_sustained_load_scales_up_once_per_cooldown() {
        let (pool, metrics) = idle_pool(4);
        // Hold utilization at 100%.
        for _ in 0..4 {
            metrics.workflow_started();
        }
        let scaler = Autoscaler::new(
            AutoscalerConfig::default(),
            Arc::clone(&metrics),
            Arc::clone(&pool),
        );

        assert_eq!(scaler.tick().await.unwrap(), Some(6));
        assert_eq!(pool.max_concurrent(), 6);

        // Still loaded, but cooling down: no second action.
        assert_eq!(scaler.tick().await.unwrap(), None);
        assert_eq!(pool.max_concurrent(), 6);
    }

    #[tokio::test]
    async fn test_idle_pool_scales_down_to_floor() {
        let (pool, metrics) = idle_pool(4);
        let scaler = Autoscaler::new(
            AutoscalerConfig {
                cooldown_secs: 0,
                ..AutoscalerConfig::default()
            },
            metrics,
            Arc::clone(&pool),
        );

        assert_eq!(scaler.tick().await.unwrap(), Some(3));
        assert_eq!(scaler.tick().await.unwrap(), Some(2));
        // At the floor the scaler holds.
        assert_eq!(scaler.tick().await.unwrap(), None);
        assert_eq!(pool.max_concurrent(), 2);
    }

    #[tokio::test]
    async fn test_config_defaults_from_toml() {
        let config: AutoscalerConfig = toml::from_str("cooldown_secs = 5").unwrap();
        assert_eq!(config.cooldown_secs, 5);
        assert_eq!(config.min_concurrent, 2);
        assert_eq!(config.max_concurrent, 16);
        assert_eq!(config.scale_up_increment, 2);
    }
}
