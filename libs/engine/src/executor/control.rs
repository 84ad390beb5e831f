//! Control and timer executors
//!
//! Start, end, and merge-gateway steps carry no work; timer steps sleep on
//! the async pool and succeed with their fire time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use conflux_domain::{Step, StepType, Value, ValueMap};

use crate::error::WorkflowError;
use crate::executor::traits::{StepExecutionContext, StepExecutionResult, StepExecutor};

/// Pass-through executor for structural steps
pub struct ControlExecutor;

#[async_trait]
impl StepExecutor for ControlExecutor {
    fn name(&self) -> &'static str {
        "control"
    }

    fn supports(&self, step_type: StepType) -> bool {
        step_type.is_control()
    }

    async fn execute(
        &self,
        step: &Step,
        _ctx: &StepExecutionContext,
    ) -> Result<StepExecutionResult, WorkflowError> {
        debug!(step_id = %step.id, step_type = ?step.step_type, "control step passed");
        Ok(StepExecutionResult::success_empty())
    }
}

/// Executor for timer steps; always dispatched on the async pool
pub struct TimerExecutor;

impl TimerExecutor {
    fn delay(step: &Step) -> Duration {
        let seconds = step
            .config_i64("delay_seconds")
            .and_then(|s| u64::try_from(s).ok())
            .unwrap_or(0);
        Duration::from_secs(seconds)
    }
}

#[async_trait]
impl StepExecutor for TimerExecutor {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn supports(&self, step_type: StepType) -> bool {
        step_type == StepType::Timer
    }

    fn validate_config(&self, step: &Step) -> Result<(), WorkflowError> {
        if step.config_i64("delay_seconds").is_some_and(|s| s < 0) {
            return Err(WorkflowError::configuration(format!(
                "timer step '{}' has a negative delay",
                step.id
            ))
            .with_step(step.id.clone()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        step: &Step,
        _ctx: &StepExecutionContext,
    ) -> Result<StepExecutionResult, WorkflowError> {
        let delay = Self::delay(step);
        debug!(step_id = %step.id, delay_secs = delay.as_secs(), "timer armed");
        tokio::time::sleep(delay).await;

        let output: ValueMap = [("fired_at".to_string(), Value::DateTime(Utc::now()))]
            .into_iter()
            .collect();
        Ok(StepExecutionResult::success(output))
    }
}
