//! Autonomous workflow execution engine with bounded concurrency and a
//! resilience layer.
//!
//! The executor pool claims queued tasks through an atomic store operation,
//! drives each task's phase workflow via external agents, and keeps failures
//! contained: exponential-backoff retries, per-agent circuit breakers, a
//! dead-letter queue for exhausted workflows, and utilization-driven pool
//! autoscaling.
//!
//! # Main types
//!
//! - [`ExecutorPool`] — Bounded-concurrency admission loop that claims and runs tasks.
//! - [`WorkflowRunner`] — Drives a single task's workflow through its phases.
//! - [`Scheduler`] — Priority + aging task selection over candidate pages.
//! - [`RetryPolicy`] — Exponential backoff with jitter for retryable phases.
//! - [`CircuitBreaker`] — Per-agent failure isolation (closed/open/half-open).
//! - [`DeadLetterQueue`] — Parking lot for workflows that exhausted retries.
//! - [`HealthMonitor`] — Grades pool metrics into a health status.
//! - [`Autoscaler`] — Resizes the pool from observed utilization.

/// Utilization-driven pool resizing.
pub mod autoscaler;
/// Per-agent circuit breakers.
pub mod circuit;
/// Dead-letter queue for exhausted workflows.
pub mod dlq;
/// Health grading and recommendations.
pub mod health;
/// Pool metrics: rolling windows, percentiles, queue trend.
pub mod metrics;
/// Bounded-concurrency executor pool.
pub mod pool;
/// Retry policy with exponential backoff and jitter.
pub mod retry;
/// Per-task workflow driver.
pub mod runner;
/// Priority + aging task selection.
pub mod scheduler;

pub use autoscaler::{Autoscaler, AutoscalerConfig};
pub use circuit::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use dlq::{DeadLetterEntry, DeadLetterQueue};
pub use health::{HealthMonitor, HealthReport, HealthStatus, HealthThresholds};
pub use metrics::{MetricsSnapshot, PoolMetrics, QueueTrend};
pub use pool::{submit, ExecutorPool, ExecutorPoolConfig};
pub use retry::RetryPolicy;
pub use runner::WorkflowRunner;
pub use scheduler::{Scheduler, SchedulerConfig};
