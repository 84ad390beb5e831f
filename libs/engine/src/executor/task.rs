//! Task step executor
//!
//! Dispatches to pluggable task handlers selected by `config.task_type`.
//! Built-in handlers validate their required configuration keys and record
//! the dispatch; real side effects belong to user-registered handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use conflux_domain::{Step, StepType, Value, ValueMap};

use crate::error::WorkflowError;
use crate::executor::traits::{StepExecutionContext, StepExecutionResult, StepExecutor};

/// Handler selected when a step names no task type
pub const DEFAULT_TASK_TYPE: &str = "default";

// =============================================================================
// Handler Contract
// =============================================================================

/// Outcome of a task handler, lifted to the framework result by the executor
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(ValueMap),
    Failed(String),
    Waiting(String),
    Retry(String),
}

/// A pluggable unit of automated work
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Registry key (`script`, `http`, `database`, `file`, `default`, ...)
    fn task_type(&self) -> &'static str;

    /// Config keys that must be present on steps using this handler
    fn required_keys(&self) -> &'static [&'static str] {
        &[]
    }

    async fn handle(
        &self,
        step: &Step,
        ctx: &StepExecutionContext,
    ) -> Result<TaskOutcome, WorkflowError>;
}

// =============================================================================
// Handler Registry
// =============================================================================

/// Registry of task handlers; built once, read lock-free
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in handlers
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DefaultTaskHandler));
        registry.register(Arc::new(ScriptTaskHandler));
        registry.register(Arc::new(HttpTaskHandler));
        registry.register(Arc::new(DatabaseTaskHandler));
        registry.register(Arc::new(FileTaskHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .insert(handler.task_type().to_string(), handler);
    }

    #[must_use]
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Task type for a step: explicit config, else derived from the step type
#[must_use]
pub fn derive_task_type(step: &Step) -> &str {
    if let Some(task_type) = step.config_str("task_type") {
        return task_type;
    }
    match step.step_type {
        StepType::ServiceCall => "http",
        StepType::Script => "script",
        _ => DEFAULT_TASK_TYPE,
    }
}

// =============================================================================
// Task Executor
// =============================================================================

/// Executor for automated task steps
pub struct TaskExecutor {
    handlers: Arc<TaskHandlerRegistry>,
}

impl TaskExecutor {
    #[must_use]
    pub fn new(handlers: Arc<TaskHandlerRegistry>) -> Self {
        Self { handlers }
    }

    fn resolve_handler(&self, step: &Step) -> Result<Arc<dyn TaskHandler>, WorkflowError> {
        let task_type = derive_task_type(step);
        self.handlers.get(task_type).ok_or_else(|| {
            WorkflowError::configuration(format!(
                "no task handler registered for type '{task_type}'"
            ))
            .with_step(step.id.clone())
        })
    }
}

#[async_trait]
impl StepExecutor for TaskExecutor {
    fn name(&self) -> &'static str {
        "task"
    }

    fn supports(&self, step_type: StepType) -> bool {
        matches!(
            step_type,
            StepType::Task | StepType::ServiceCall | StepType::Script | StepType::Email
        )
    }

    fn validate_config(&self, step: &Step) -> Result<(), WorkflowError> {
        let handler = self.resolve_handler(step)?;
        for key in handler.required_keys() {
            if !step.config.contains_key(*key) {
                return Err(WorkflowError::configuration(format!(
                    "task handler '{}' requires config key '{key}'",
                    handler.task_type()
                ))
                .with_step(step.id.clone()));
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &StepExecutionContext,
    ) -> Result<StepExecutionResult, WorkflowError> {
        let handler = self.resolve_handler(step)?;
        debug!(
            step_id = %step.id,
            task_type = handler.task_type(),
            "dispatching task handler"
        );

        let outcome = handler.handle(step, ctx).await.map_err(|err| {
            if matches!(err.kind, crate::error::ErrorKind::Configuration) {
                err
            } else {
                WorkflowError::execution(format!(
                    "task handler '{}' failed: {err}",
                    handler.task_type()
                ))
                .retryable(err.retryable)
                .with_step(step.id.clone())
                .with_cause(err)
            }
        })?;

        Ok(match outcome {
            TaskOutcome::Success(output) => StepExecutionResult::success(output),
            TaskOutcome::Failed(message) => StepExecutionResult::failed(message),
            TaskOutcome::Waiting(message) => {
                StepExecutionResult::waiting(message, ValueMap::new())
            }
            TaskOutcome::Retry(message) => StepExecutionResult::retry(message, None),
        })
    }
}

// =============================================================================
// Built-in Handlers
// =============================================================================

/// Echoes inputs back as outputs; the no-op unit of work
pub struct DefaultTaskHandler;

#[async_trait]
impl TaskHandler for DefaultTaskHandler {
    fn task_type(&self) -> &'static str {
        DEFAULT_TASK_TYPE
    }

    async fn handle(
        &self,
        step: &Step,
        ctx: &StepExecutionContext,
    ) -> Result<TaskOutcome, WorkflowError> {
        debug!(step_id = %step.id, "default task handler");
        Ok(TaskOutcome::Success(ctx.input.clone()))
    }
}

/// Runs a configured script through an embedder-provided runtime.
///
/// Without an embedder hook the handler records the invocation and succeeds;
/// the script text itself is opaque to the engine.
pub struct ScriptTaskHandler;

#[async_trait]
impl TaskHandler for ScriptTaskHandler {
    fn task_type(&self) -> &'static str {
        "script"
    }

    fn required_keys(&self) -> &'static [&'static str] {
        &["script"]
    }

    async fn handle(
        &self,
        step: &Step,
        _ctx: &StepExecutionContext,
    ) -> Result<TaskOutcome, WorkflowError> {
        let script = step
            .config_str("script")
            .ok_or_else(|| WorkflowError::configuration("script task missing 'script'"))?;
        info!(step_id = %step.id, bytes = script.len(), "script task dispatched");

        let output: ValueMap = [(
            "script_dispatched".to_string(),
            Value::Bool(true),
        )]
        .into_iter()
        .collect();
        Ok(TaskOutcome::Success(output))
    }
}

/// Outbound HTTP call description; transport is supplied by the embedder
pub struct HttpTaskHandler;

#[async_trait]
impl TaskHandler for HttpTaskHandler {
    fn task_type(&self) -> &'static str {
        "http"
    }

    fn required_keys(&self) -> &'static [&'static str] {
        &["url"]
    }

    async fn handle(
        &self,
        step: &Step,
        _ctx: &StepExecutionContext,
    ) -> Result<TaskOutcome, WorkflowError> {
        let url = step
            .config_str("url")
            .ok_or_else(|| WorkflowError::configuration("http task missing 'url'"))?;
        let method = step.config_str("method").unwrap_or("GET");
        info!(step_id = %step.id, %url, method, "http task dispatched");

        let output: ValueMap = [
            ("url".to_string(), Value::from(url)),
            ("method".to_string(), Value::from(method)),
            ("dispatched".to_string(), Value::Bool(true)),
        ]
        .into_iter()
        .collect();
        Ok(TaskOutcome::Success(output))
    }
}

/// Database statement description; execution is supplied by the embedder
pub struct DatabaseTaskHandler;

#[async_trait]
impl TaskHandler for DatabaseTaskHandler {
    fn task_type(&self) -> &'static str {
        "database"
    }

    fn required_keys(&self) -> &'static [&'static str] {
        &["sql"]
    }

    async fn handle(
        &self,
        step: &Step,
        _ctx: &StepExecutionContext,
    ) -> Result<TaskOutcome, WorkflowError> {
        let sql = step
            .config_str("sql")
            .ok_or_else(|| WorkflowError::configuration("database task missing 'sql'"))?;
        info!(step_id = %step.id, statement_len = sql.len(), "database task dispatched");

        let output: ValueMap = [("dispatched".to_string(), Value::Bool(true))]
            .into_iter()
            .collect();
        Ok(TaskOutcome::Success(output))
    }
}

/// File operation description
pub struct FileTaskHandler;

#[async_trait]
impl TaskHandler for FileTaskHandler {
    fn task_type(&self) -> &'static str {
        "file"
    }

    fn required_keys(&self) -> &'static [&'static str] {
        &["path"]
    }

    async fn handle(
        &self,
        step: &Step,
        _ctx: &StepExecutionContext,
    ) -> Result<TaskOutcome, WorkflowError> {
        let path = step
            .config_str("path")
            .ok_or_else(|| WorkflowError::configuration("file task missing 'path'"))?;
        let operation = step.config_str("operation").unwrap_or("read");
        info!(step_id = %step.id, %path, operation, "file task dispatched");

        let output: ValueMap = [
            ("path".to_string(), Value::from(path)),
            ("operation".to_string(), Value::from(operation)),
        ]
        .into_iter()
        .collect();
        Ok(TaskOutcome::Success(output))
    }
}
