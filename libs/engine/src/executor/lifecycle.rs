//! Executor lifecycle runner
//!
//! Composes an executor's `execute` with the fixed pre/post phases and keeps
//! per-executor statistics and a cached health probe. Executors stay plain
//! trait objects; the runner owns all shared mutable state.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use tracing::warn;

use conflux_domain::{ExecutionStatus, Step, Value, ValueMap};

use crate::error::WorkflowError;
use crate::executor::traits::{
    HealthStatus, StepExecutionContext, StepExecutionResult, StepExecutor,
};

/// Minimum age before a cached health probe is refreshed
const HEALTH_REFRESH_SECS: u64 = 60;

// =============================================================================
// Statistics
// =============================================================================

/// Per-executor execution counters
#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub timeout: u64,
    pub retry: u64,
    pub sum_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: u64,
}

impl ExecutorStats {
    fn record(&mut self, status: ExecutionStatus, elapsed_ms: u64) {
        self.total += 1;
        match status {
            ExecutionStatus::Success => self.success += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Timeout => self.timeout += 1,
            ExecutionStatus::Retry => self.retry += 1,
            _ => {}
        }
        self.sum_ms += elapsed_ms;
        self.min_ms = Some(self.min_ms.map_or(elapsed_ms, |m| m.min(elapsed_ms)));
        self.max_ms = self.max_ms.max(elapsed_ms);
    }

    /// Metrics view exposed through the engine
    #[must_use]
    pub fn as_metrics(&self) -> ValueMap {
        let avg = if self.total > 0 {
            self.sum_ms as f64 / self.total as f64
        } else {
            0.0
        };
        [
            ("total".to_string(), Value::Long(self.total as i64)),
            ("success".to_string(), Value::Long(self.success as i64)),
            ("failed".to_string(), Value::Long(self.failed as i64)),
            ("timeout".to_string(), Value::Long(self.timeout as i64)),
            ("retry".to_string(), Value::Long(self.retry as i64)),
            ("avg_ms".to_string(), Value::Double(avg)),
            (
                "min_ms".to_string(),
                Value::Long(self.min_ms.unwrap_or(0) as i64),
            ),
            ("max_ms".to_string(), Value::Long(self.max_ms as i64)),
        ]
        .into_iter()
        .collect()
    }
}

// =============================================================================
// Registered Executor
// =============================================================================

struct HealthCache {
    status: HealthStatus,
    checked_at: Option<Instant>,
}

/// An executor published in the registry, wrapped with its runner state
pub struct RegisteredExecutor {
    executor: Arc<dyn StepExecutor>,
    stats: Mutex<ExecutorStats>,
    health: Mutex<HealthCache>,
}

impl RegisteredExecutor {
    #[must_use]
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            executor,
            stats: Mutex::new(ExecutorStats::default()),
            health: Mutex::new(HealthCache {
                status: HealthStatus::Healthy,
                checked_at: None,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.executor.name()
    }

    #[must_use]
    pub fn executor(&self) -> &dyn StepExecutor {
        self.executor.as_ref()
    }

    /// Current statistics snapshot
    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Cached health, refreshed at most once per minute
    pub async fn health(&self) -> HealthStatus {
        let needs_refresh = {
            let cache = self.health.lock().ok();
            cache.is_none_or(|c| {
                c.checked_at
                    .is_none_or(|t| t.elapsed().as_secs() >= HEALTH_REFRESH_SECS)
            })
        };

        if needs_refresh {
            let status = self.executor.health_check().await;
            if let Ok(mut cache) = self.health.lock() {
                cache.status = status;
                cache.checked_at = Some(Instant::now());
            }
            return status;
        }

        self.health
            .lock()
            .map(|c| c.status)
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Run the full lifecycle for one step execution.
    ///
    /// Never returns an error: every failure mode is folded into the result
    /// so the engine has a single routing path.
    pub async fn run(&self, step: &Step, ctx: &StepExecutionContext) -> StepExecutionResult {
        let started = Instant::now();
        let result = self.run_phases(step, ctx).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(result.status, elapsed_ms);
        }
        result
    }

    async fn run_phases(&self, step: &Step, ctx: &StepExecutionContext) -> StepExecutionResult {
        if !self.executor.supports(step.step_type) {
            return StepExecutionResult::failed_permanent(format!(
                "executor '{}' does not support step type {:?}",
                self.name(),
                step.step_type
            ));
        }

        if let Err(err) = self.executor.validate_config(step) {
            return StepExecutionResult::failed_permanent(format!(
                "invalid config for step '{}': {err}",
                step.id
            ));
        }

        if !self.executor.check_preconditions(step, ctx) {
            return StepExecutionResult::skipped(format!(
                "executor preconditions not met for step '{}'",
                step.id
            ));
        }

        if let Err(err) = self.executor.prepare(step, ctx).await {
            let mut result =
                StepExecutionResult::failed(format!("prepare failed for step '{}': {err}", step.id));
            result.need_retry = err.retryable;
            return result;
        }

        let execution = tokio::time::timeout(ctx.timeout, self.executor.execute(step, ctx)).await;
        let result = match execution {
            Err(_elapsed) => self.executor.handle_timeout(step, ctx).await,
            Ok(Ok(result)) => result,
            Ok(Err(err)) => self.executor.handle_error(step, &err),
        };

        // Cleanup always runs; its failures never override the result.
        if let Err(err) = self.executor.cleanup(step, ctx, &result).await {
            warn!(
                step_id = %step.id,
                executor = self.name(),
                error = %err,
                "executor cleanup failed"
            );
        }

        result
    }
}
