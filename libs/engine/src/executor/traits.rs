//! Step executor contract and supporting types

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conflux_domain::{ExecutionStatus, InstanceId, Step, StepType, ValueMap, WorkflowId};

use crate::engine::retry::RetryPolicy;
use crate::error::WorkflowError;

// =============================================================================
// Execution Context
// =============================================================================

/// Snapshot handed to an executor for one step execution.
///
/// The context map is a copy of the instance context at dispatch time;
/// executors communicate results exclusively through their returned output.
#[derive(Debug, Clone)]
pub struct StepExecutionContext {
    pub instance_id: InstanceId,
    pub workflow_id: WorkflowId,
    pub step_id: String,

    /// User on whose behalf the step runs
    pub user_id: String,

    /// Caller-supplied input parameters (empty when none)
    pub input: ValueMap,

    /// Snapshot of the instance context
    pub context: ValueMap,

    /// Instance configuration (workflow config + start overrides)
    pub config: ValueMap,

    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub priority: i32,
    pub async_step: bool,
}

impl StepExecutionContext {
    #[must_use]
    pub fn new(
        instance_id: InstanceId,
        workflow_id: WorkflowId,
        step_id: impl Into<String>,
        user_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            instance_id,
            workflow_id,
            step_id: step_id.into(),
            user_id: user_id.into(),
            input: ValueMap::new(),
            context: ValueMap::new(),
            config: ValueMap::new(),
            started_at: Utc::now(),
            timeout,
            retry_count: 0,
            priority: 0,
            async_step: false,
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: ValueMap) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: ValueMap) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ValueMap) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_async(mut self, async_step: bool) -> Self {
        self.async_step = async_step;
        self
    }
}

// =============================================================================
// Execution Result
// =============================================================================

/// Result of one step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: ValueMap,
    #[serde(default)]
    pub message: Option<String>,
    /// Whether the engine should consider scheduling a retry
    #[serde(default)]
    pub need_retry: bool,
    /// Executor-suggested retry delay; engine back-off applies when absent
    #[serde(default)]
    pub retry_delay: Option<Duration>,
}

impl StepExecutionResult {
    #[must_use]
    pub fn success(output: ValueMap) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output,
            message: None,
            need_retry: false,
            retry_delay: None,
        }
    }

    #[must_use]
    pub fn success_empty() -> Self {
        Self::success(ValueMap::new())
    }

    /// A transient failure; retryable by default (EXECUTION_ERROR semantics)
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output: ValueMap::new(),
            message: Some(message.into()),
            need_retry: true,
            retry_delay: None,
        }
    }

    /// A failure the engine must not retry
    #[must_use]
    pub fn failed_permanent(message: impl Into<String>) -> Self {
        Self {
            need_retry: false,
            ..Self::failed(message)
        }
    }

    #[must_use]
    pub fn waiting(message: impl Into<String>, output: ValueMap) -> Self {
        Self {
            status: ExecutionStatus::Waiting,
            output,
            message: Some(message.into()),
            need_retry: false,
            retry_delay: None,
        }
    }

    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            output: ValueMap::new(),
            message: Some(reason.into()),
            need_retry: false,
            retry_delay: None,
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Timeout,
            output: ValueMap::new(),
            message: Some(message.into()),
            need_retry: true,
            retry_delay: None,
        }
    }

    /// Ask the engine to schedule a retry
    #[must_use]
    pub fn retry(message: impl Into<String>, delay: Option<Duration>) -> Self {
        Self {
            status: ExecutionStatus::Retry,
            output: ValueMap::new(),
            message: Some(message.into()),
            need_retry: true,
            retry_delay: delay,
        }
    }

    #[must_use]
    pub fn condition_not_met(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::ConditionNotMet,
            output: ValueMap::new(),
            message: Some(reason.into()),
            need_retry: false,
            retry_delay: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.status == ExecutionStatus::Waiting
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

// =============================================================================
// Health
// =============================================================================

/// Executor health, cached by the framework and refreshed at most once a
/// minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

// =============================================================================
// Step Executor Trait
// =============================================================================

/// Capability contract for step executors.
///
/// The lifecycle runner drives the fixed sequence around `execute`:
/// type-check, `validate_config`, `check_preconditions` (false yields a
/// skipped result), `prepare` (failure yields a failed result), `execute`
/// bounded by the step timeout, then `cleanup` — which always runs and whose
/// failures are logged without overriding the result.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Registry key of this executor
    fn name(&self) -> &'static str;

    /// Whether this executor can run steps of the given type
    fn supports(&self, step_type: StepType) -> bool;

    /// Run the step. Foreign errors must be wrapped into `WorkflowError`.
    async fn execute(
        &self,
        step: &Step,
        ctx: &StepExecutionContext,
    ) -> Result<StepExecutionResult, WorkflowError>;

    /// Validate the step's configuration before any execution
    fn validate_config(&self, _step: &Step) -> Result<(), WorkflowError> {
        Ok(())
    }

    /// Acquire resources needed by `execute`
    async fn prepare(
        &self,
        _step: &Step,
        _ctx: &StepExecutionContext,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }

    /// Release resources; runs regardless of the execution outcome
    async fn cleanup(
        &self,
        _step: &Step,
        _ctx: &StepExecutionContext,
        _result: &StepExecutionResult,
    ) -> Result<(), WorkflowError> {
        Ok(())
    }

    /// Executor-level precondition, checked after the step's own predicate
    fn check_preconditions(&self, _step: &Step, _ctx: &StepExecutionContext) -> bool {
        true
    }

    /// Invoked when `execute` breaches the step deadline
    async fn handle_timeout(&self, step: &Step, _ctx: &StepExecutionContext) -> StepExecutionResult {
        StepExecutionResult::timeout(format!("step '{}' timed out", step.id))
    }

    /// Map an execution error into a result; default preserves retryability
    fn handle_error(&self, _step: &Step, error: &WorkflowError) -> StepExecutionResult {
        let mut result = StepExecutionResult::failed(error.to_string());
        result.need_retry = error.retryable && self.can_retry(error);
        result
    }

    /// Whether the executor considers this error retryable
    fn can_retry(&self, error: &WorkflowError) -> bool {
        error.retryable
    }

    /// Delay before the next retry; default defers to the engine policy
    fn retry_delay(&self, prior_retries: u32, policy: &RetryPolicy) -> Duration {
        policy.delay_for(prior_retries)
    }

    /// Probe executor health; results are cached by the framework
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Rough runtime estimate for scheduling decisions
    fn estimate_time(&self, step: &Step, _ctx: &StepExecutionContext) -> Duration {
        step.timeout_seconds
            .map_or(Duration::from_secs(1), |s| Duration::from_secs(u64::from(s) / 2))
    }

    /// Declared resource demand, advisory only
    fn resource_requirements(&self, _step: &Step, _ctx: &StepExecutionContext) -> ValueMap {
        ValueMap::new()
    }
}
