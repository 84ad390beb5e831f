//! Parallel step executor
//!
//! Fans a step out across declared branches, runs them under a selectable
//! execution strategy, and folds the branch outcomes through a join
//! strategy. Branch work is dispatched through the task-handler registry;
//! each branch future is individually cancellable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use conflux_domain::{
    merge_into, ExecutionStatus, ExecutionStrategy, JoinStrategy, Step, StepType, Value, ValueMap,
};

use crate::error::WorkflowError;
use crate::executor::task::{TaskHandlerRegistry, TaskOutcome, DEFAULT_TASK_TYPE};
use crate::executor::traits::{StepExecutionContext, StepExecutionResult, StepExecutor};

// =============================================================================
// Typed Configuration
// =============================================================================

/// Engine defaults injected from the settings
#[derive(Debug, Clone, Copy)]
pub struct ParallelDefaults {
    pub step_timeout: Duration,
    pub branch_timeout: Duration,
}

/// One concurrent path inside a parallel step
#[derive(Debug, Clone)]
pub struct BranchConfig {
    pub id: String,
    pub name: String,
    /// Task-handler type running this branch (unless `executor` overrides)
    pub branch_type: String,
    pub executor: Option<String>,
    pub config: ValueMap,
    pub data_sharing: bool,
    pub fail_fast: bool,
    pub optional: bool,
}

/// Validated parallel-step configuration, decoded once at the edge
#[derive(Debug, Clone)]
pub struct ParallelStepConfig {
    pub strategy: ExecutionStrategy,
    pub join: JoinStrategy,
    pub custom_join: Option<String>,
    pub step_timeout: Duration,
    pub branch_timeout: Duration,
    pub batch_size: usize,
    pub branches: Vec<BranchConfig>,
}

impl ParallelStepConfig {
    /// Decode and validate a parallel step's config
    pub fn decode(step: &Step, defaults: ParallelDefaults) -> Result<Self, WorkflowError> {
        let bad = |message: String| {
            WorkflowError::configuration(message).with_step(step.id.clone())
        };

        let branches_raw = step
            .config
            .get("branches")
            .and_then(Value::as_list)
            .ok_or_else(|| bad(format!("parallel step '{}' declares no branches", step.id)))?;
        if branches_raw.is_empty() {
            return Err(bad(format!("parallel step '{}' declares no branches", step.id)));
        }

        let mut branches = Vec::with_capacity(branches_raw.len());
        for (idx, raw) in branches_raw.iter().enumerate() {
            let object = raw
                .as_object()
                .ok_or_else(|| bad(format!("branches[{idx}] is not an object")))?;
            let id = object
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| bad(format!("branches[{idx}] is missing 'id'")))?
                .to_string();
            branches.push(BranchConfig {
                name: object
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(&id)
                    .to_string(),
                branch_type: object
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_TASK_TYPE)
                    .to_string(),
                executor: object.get("executor").and_then(Value::as_str).map(str::to_string),
                config: object
                    .get("config")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                data_sharing: object
                    .get("data_sharing")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
                fail_fast: object
                    .get("fail_fast")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                optional: object
                    .get("optional")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                id,
            });
        }

        let strategy = match step.config_str("execution_strategy") {
            None => ExecutionStrategy::default(),
            Some("parallel") => ExecutionStrategy::Parallel,
            Some("sequential") => ExecutionStrategy::Sequential,
            Some("batch") => ExecutionStrategy::Batch,
            Some(other) => return Err(bad(format!("unknown execution strategy '{other}'"))),
        };
        let join = match step.config_str("join_strategy") {
            None => JoinStrategy::default(),
            Some("and") => JoinStrategy::And,
            Some("or") => JoinStrategy::Or,
            Some("majority") => JoinStrategy::Majority,
            Some("first") => JoinStrategy::First,
            Some("custom") => JoinStrategy::Custom,
            Some(other) => return Err(bad(format!("unknown join strategy '{other}'"))),
        };

        let default_batch = branches.len().div_ceil(2);
        Ok(Self {
            strategy,
            join,
            custom_join: step.config_str("join_predicate").map(str::to_string),
            step_timeout: step
                .config_i64("timeout")
                .and_then(|ms| u64::try_from(ms).ok())
                .map_or(defaults.step_timeout, Duration::from_millis),
            branch_timeout: step
                .config_i64("branch_timeout")
                .and_then(|ms| u64::try_from(ms).ok())
                .map_or(defaults.branch_timeout, Duration::from_millis),
            batch_size: step
                .config_i64("batch_size")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(default_batch),
            branches,
        })
    }
}

// =============================================================================
// Branch Results & Joins
// =============================================================================

/// Outcome of one branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchExecutionResult {
    pub branch_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: ValueMap,
    pub execution_time_ms: i64,
    #[serde(default)]
    pub error: Option<String>,
}

impl BranchExecutionResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Join verdict over the collected branch results
#[derive(Debug, Clone)]
pub struct JoinResult {
    pub success: bool,
    pub message: String,
    pub merged: ValueMap,
}

/// Custom join hook
pub type JoinPredicate = dyn Fn(&[BranchExecutionResult]) -> JoinResult + Send + Sync;

fn failing_summary(results: &[BranchExecutionResult]) -> String {
    let failing: Vec<String> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| format!("{} ({:?})", r.branch_id, r.status))
        .collect();
    failing.join(", ")
}

fn merge_outputs<'a>(results: impl Iterator<Item = &'a BranchExecutionResult>) -> ValueMap {
    let mut merged = ValueMap::new();
    for result in results {
        merge_into(&mut merged, &result.output);
    }
    merged
}

/// Apply the AND join: all non-optional branches must succeed
fn join_and(results: &[BranchExecutionResult], optional: &[bool]) -> JoinResult {
    let failed_required = results
        .iter()
        .zip(optional)
        .any(|(r, opt)| !r.is_success() && !opt);
    if failed_required {
        JoinResult {
            success: false,
            message: format!("branches failed: {}", failing_summary(results)),
            merged: merge_outputs(results.iter()),
        }
    } else {
        JoinResult {
            success: true,
            message: "all branches succeeded".to_string(),
            merged: merge_outputs(results.iter()),
        }
    }
}

fn join_or(results: &[BranchExecutionResult]) -> JoinResult {
    let successes = results.iter().filter(|r| r.is_success()).count();
    JoinResult {
        success: successes >= 1,
        message: if successes >= 1 {
            format!("{successes} of {} branches succeeded", results.len())
        } else {
            format!("no branch succeeded: {}", failing_summary(results))
        },
        merged: merge_outputs(results.iter().filter(|r| r.is_success())),
    }
}

fn join_majority(results: &[BranchExecutionResult]) -> JoinResult {
    let successes = results.iter().filter(|r| r.is_success()).count();
    let success = successes * 2 > results.len();
    JoinResult {
        success,
        message: format!("{successes} of {} branches succeeded", results.len()),
        merged: merge_outputs(results.iter().filter(|r| r.is_success())),
    }
}

/// FIRST join over results sorted by completion time
fn join_first(by_completion: &[&BranchExecutionResult]) -> JoinResult {
    match by_completion.iter().find(|r| r.is_success()) {
        Some(winner) => JoinResult {
            success: true,
            message: format!("branch {} finished first", winner.branch_id),
            merged: winner.output.clone(),
        },
        None => JoinResult {
            success: false,
            message: "no branch succeeded".to_string(),
            merged: ValueMap::new(),
        },
    }
}

// =============================================================================
// Parallel Executor
// =============================================================================

struct BranchRun {
    result: BranchExecutionResult,
    completed_at: DateTime<Utc>,
}

/// Executor for parallel-gateway steps
pub struct ParallelExecutor {
    handlers: Arc<TaskHandlerRegistry>,
    custom_joins: Arc<HashMap<String, Arc<JoinPredicate>>>,
    defaults: ParallelDefaults,
}

impl ParallelExecutor {
    #[must_use]
    pub fn new(
        handlers: Arc<TaskHandlerRegistry>,
        custom_joins: Arc<HashMap<String, Arc<JoinPredicate>>>,
        defaults: ParallelDefaults,
    ) -> Self {
        Self {
            handlers,
            custom_joins,
            defaults,
        }
    }

    fn branch_handler_type<'a>(branch: &'a BranchConfig) -> &'a str {
        if let Some(executor) = &branch.executor {
            return executor;
        }
        if let Some(task_type) = branch.config.get("task_type").and_then(Value::as_str) {
            return task_type;
        }
        &branch.branch_type
    }

    /// Run one branch to a result; never panics outward
    async fn run_branch(
        handlers: Arc<TaskHandlerRegistry>,
        branch: BranchConfig,
        parent: StepExecutionContext,
        shared_snapshot: ValueMap,
        branch_timeout: Duration,
    ) -> BranchExecutionResult {
        let started = Instant::now();
        let handler_type = Self::branch_handler_type(&branch).to_string();

        let Some(handler) = handlers.get(&handler_type) else {
            return BranchExecutionResult {
                branch_id: branch.id,
                status: ExecutionStatus::Failed,
                output: ValueMap::new(),
                execution_time_ms: 0,
                error: Some(format!("no task handler for branch type '{handler_type}'")),
            };
        };

        let synthetic = Step {
            id: branch.id.clone(),
            name: branch.name.clone(),
            description: String::new(),
            order: 0,
            step_type: StepType::Task,
            executor_key: None,
            config: branch.config.clone(),
            precondition: None,
            next_step_id: None,
            error_step_id: None,
            optional: branch.optional,
            timeout_seconds: None,
            retry_count: 0,
            rollbackable: false,
            async_step: false,
        };
        let ctx = StepExecutionContext {
            step_id: branch.id.clone(),
            context: shared_snapshot,
            input: ValueMap::new(),
            timeout: branch_timeout,
            ..parent
        };

        let outcome = handler.handle(&synthetic, &ctx).await;
        let elapsed = started.elapsed().as_millis() as i64;
        match outcome {
            Ok(TaskOutcome::Success(output)) => BranchExecutionResult {
                branch_id: branch.id,
                status: ExecutionStatus::Success,
                output,
                execution_time_ms: elapsed,
                error: None,
            },
            Ok(TaskOutcome::Failed(message)) => BranchExecutionResult {
                branch_id: branch.id,
                status: ExecutionStatus::Failed,
                output: ValueMap::new(),
                execution_time_ms: elapsed,
                error: Some(message),
            },
            Ok(TaskOutcome::Waiting(message)) => BranchExecutionResult {
                branch_id: branch.id,
                status: ExecutionStatus::Waiting,
                output: ValueMap::new(),
                execution_time_ms: elapsed,
                error: Some(message),
            },
            Ok(TaskOutcome::Retry(message)) => BranchExecutionResult {
                branch_id: branch.id,
                status: ExecutionStatus::Retry,
                output: ValueMap::new(),
                execution_time_ms: elapsed,
                error: Some(message),
            },
            Err(err) => BranchExecutionResult {
                branch_id: branch.id,
                status: ExecutionStatus::Failed,
                output: ValueMap::new(),
                execution_time_ms: elapsed,
                error: Some(err.to_string()),
            },
        }
    }

    /// PARALLEL mode: all branches concurrently, each awaited up to the
    /// branch timeout and cancelled on breach.
    async fn run_parallel(
        &self,
        branches: &[BranchConfig],
        config: &ParallelStepConfig,
        ctx: &StepExecutionContext,
        shared: &Arc<Mutex<ValueMap>>,
    ) -> Vec<BranchRun> {
        let seed = shared.lock().await.clone();
        let mut handles = Vec::with_capacity(branches.len());
        for branch in branches {
            let fut = Self::run_branch(
                Arc::clone(&self.handlers),
                branch.clone(),
                ctx.clone(),
                seed.clone(),
                config.branch_timeout,
            );
            handles.push((
                branch.clone(),
                tokio::spawn(async move {
                    let result = fut.await;
                    (result, Utc::now())
                }),
            ));
        }

        let mut runs = Vec::with_capacity(handles.len());
        for (branch, mut handle) in handles {
            let run = match tokio::time::timeout(config.branch_timeout, &mut handle).await {
                Ok(Ok((result, completed_at))) => BranchRun {
                    result,
                    completed_at,
                },
                Ok(Err(join_err)) => BranchRun {
                    result: BranchExecutionResult {
                        branch_id: branch.id.clone(),
                        status: ExecutionStatus::Failed,
                        output: ValueMap::new(),
                        execution_time_ms: config.branch_timeout.as_millis() as i64,
                        error: Some(format!("branch task failed: {join_err}")),
                    },
                    completed_at: Utc::now(),
                },
                Err(_elapsed) => {
                    handle.abort();
                    BranchRun {
                        result: BranchExecutionResult {
                            branch_id: branch.id.clone(),
                            status: ExecutionStatus::Timeout,
                            output: ValueMap::new(),
                            execution_time_ms: config.branch_timeout.as_millis() as i64,
                            error: Some(format!(
                                "branch '{}' exceeded {} ms",
                                branch.id,
                                config.branch_timeout.as_millis()
                            )),
                        },
                        completed_at: Utc::now(),
                    }
                }
            };

            if branch.data_sharing && run.result.is_success() {
                let mut shared = shared.lock().await;
                merge_into(&mut shared, &run.result.output);
            }
            runs.push(run);
        }
        runs
    }

    /// SEQUENTIAL mode: declaration order; a fail-fast branch failure stops
    /// the remaining branches from running.
    async fn run_sequential(
        &self,
        config: &ParallelStepConfig,
        ctx: &StepExecutionContext,
        shared: &Arc<Mutex<ValueMap>>,
    ) -> Vec<BranchRun> {
        let mut runs = Vec::with_capacity(config.branches.len());
        for branch in &config.branches {
            let seed = shared.lock().await.clone();
            let fut = Self::run_branch(
                Arc::clone(&self.handlers),
                branch.clone(),
                ctx.clone(),
                seed,
                config.branch_timeout,
            );
            let result = match tokio::time::timeout(config.branch_timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => BranchExecutionResult {
                    branch_id: branch.id.clone(),
                    status: ExecutionStatus::Timeout,
                    output: ValueMap::new(),
                    execution_time_ms: config.branch_timeout.as_millis() as i64,
                    error: Some(format!(
                        "branch '{}' exceeded {} ms",
                        branch.id,
                        config.branch_timeout.as_millis()
                    )),
                },
            };

            if branch.data_sharing && result.is_success() {
                let mut shared = shared.lock().await;
                merge_into(&mut shared, &result.output);
            }

            let failed = !result.is_success();
            runs.push(BranchRun {
                result,
                completed_at: Utc::now(),
            });
            if failed && branch.fail_fast {
                warn!(branch_id = %branch.id, "fail-fast branch failed, stopping sequence");
                break;
            }
        }
        runs
    }

    /// BATCH mode: fixed-size batches, each in parallel; later batches run
    /// regardless of earlier failures.
    async fn run_batch(
        &self,
        config: &ParallelStepConfig,
        ctx: &StepExecutionContext,
        shared: &Arc<Mutex<ValueMap>>,
    ) -> Vec<BranchRun> {
        let mut runs = Vec::with_capacity(config.branches.len());
        for batch in config.branches.chunks(config.batch_size) {
            let batch_runs = self.run_parallel(batch, config, ctx, shared).await;
            let failures = batch_runs.iter().filter(|r| !r.result.is_success()).count();
            if failures > 0 {
                warn!(failures, batch_len = batch.len(), "batch finished with failures");
            }
            runs.extend(batch_runs);
        }
        runs
    }

    fn apply_join(&self, config: &ParallelStepConfig, runs: &[BranchRun]) -> JoinResult {
        let results: Vec<BranchExecutionResult> =
            runs.iter().map(|r| r.result.clone()).collect();
        let optional: Vec<bool> = config
            .branches
            .iter()
            .map(|b| b.optional)
            .chain(std::iter::repeat(false))
            .take(results.len())
            .collect();

        match config.join {
            JoinStrategy::And => join_and(&results, &optional),
            JoinStrategy::Or => join_or(&results),
            JoinStrategy::Majority => join_majority(&results),
            JoinStrategy::First => {
                let mut ordered: Vec<(&BranchRun, &BranchExecutionResult)> =
                    runs.iter().map(|r| (r, &r.result)).collect();
                ordered.sort_by_key(|(run, _)| run.completed_at);
                let by_completion: Vec<&BranchExecutionResult> =
                    ordered.into_iter().map(|(_, result)| result).collect();
                join_first(&by_completion)
            }
            JoinStrategy::Custom => {
                let predicate = config
                    .custom_join
                    .as_deref()
                    .and_then(|name| self.custom_joins.get(name).cloned());
                match predicate {
                    Some(join) => join(&results),
                    // Unregistered custom join behaves as AND.
                    None => join_and(&results, &optional),
                }
            }
        }
    }
}

#[async_trait]
impl StepExecutor for ParallelExecutor {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn supports(&self, step_type: StepType) -> bool {
        step_type == StepType::ParallelGateway
    }

    fn validate_config(&self, step: &Step) -> Result<(), WorkflowError> {
        let config = ParallelStepConfig::decode(step, self.defaults)?;
        if config.join == JoinStrategy::Custom {
            if let Some(name) = &config.custom_join {
                if !self.custom_joins.contains_key(name) {
                    return Err(WorkflowError::configuration(format!(
                        "unknown custom join predicate '{name}'"
                    ))
                    .with_step(step.id.clone()));
                }
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &StepExecutionContext,
    ) -> Result<StepExecutionResult, WorkflowError> {
        let config = ParallelStepConfig::decode(step, self.defaults)?;
        debug!(
            step_id = %step.id,
            branches = config.branches.len(),
            strategy = ?config.strategy,
            join = ?config.join,
            "parallel step starting"
        );

        let shared = Arc::new(Mutex::new(ctx.context.clone()));
        let work = async {
            match config.strategy {
                ExecutionStrategy::Parallel => {
                    self.run_parallel(&config.branches, &config, ctx, &shared).await
                }
                ExecutionStrategy::Sequential => {
                    self.run_sequential(&config, ctx, &shared).await
                }
                ExecutionStrategy::Batch => self.run_batch(&config, ctx, &shared).await,
            }
        };
        let runs = match tokio::time::timeout(config.step_timeout, work).await {
            Ok(runs) => runs,
            Err(_elapsed) => {
                return Ok(StepExecutionResult::timeout(format!(
                    "parallel step '{}' exceeded {} ms",
                    step.id,
                    config.step_timeout.as_millis()
                )));
            }
        };

        let join = self.apply_join(&config, &runs);
        let shared_data = shared.lock().await.clone();

        let branch_results: Vec<Value> = runs
            .iter()
            .map(|run| {
                let mut object = ValueMap::new();
                object.insert(
                    "branch_id".to_string(),
                    Value::from(run.result.branch_id.clone()),
                );
                object.insert(
                    "status".to_string(),
                    Value::from(format!("{:?}", run.result.status).to_lowercase()),
                );
                object.insert(
                    "output".to_string(),
                    Value::Object(run.result.output.clone()),
                );
                object.insert(
                    "execution_time_ms".to_string(),
                    Value::Long(run.result.execution_time_ms),
                );
                if let Some(error) = &run.result.error {
                    object.insert("error".to_string(), Value::from(error.clone()));
                }
                Value::Object(object)
            })
            .collect();

        let mut join_object = ValueMap::new();
        join_object.insert("success".to_string(), Value::Bool(join.success));
        join_object.insert("message".to_string(), Value::from(join.message.clone()));
        join_object.insert("merged_data".to_string(), Value::Object(join.merged.clone()));

        let mut output = ValueMap::new();
        merge_into(&mut output, &join.merged);
        output.insert("branch_results".to_string(), Value::List(branch_results));
        output.insert("join_result".to_string(), Value::Object(join_object));
        output.insert("shared_data".to_string(), Value::Object(shared_data));

        if join.success {
            Ok(StepExecutionResult::success(output))
        } else {
            let mut result = StepExecutionResult::failed(join.message);
            result.output = output;
            Ok(result)
        }
    }
}
