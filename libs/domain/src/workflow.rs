//! Workflow definition model
//!
//! Definitions are immutable once published; the engine resolves routing
//! through step ids rather than direct references.

use serde::{Deserialize, Serialize};

use crate::enums::{StepType, WorkflowStatus};
use crate::ids::WorkflowId;
use crate::value::{Value, ValueMap};

// =============================================================================
// Step
// =============================================================================

/// A typed unit of work inside a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Step {
    /// Unique step identifier within the workflow
    pub id: String,

    /// Human-readable step name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: String,

    /// 1-based position; dense across the workflow
    #[serde(default)]
    pub order: u32,

    /// Type of step
    pub step_type: StepType,

    /// Executor key, required iff the type demands execution
    #[serde(default)]
    pub executor_key: Option<String>,

    /// Step-scoped options
    #[serde(default)]
    pub config: ValueMap,

    /// Name of a registered precondition predicate; absent = always true
    #[serde(default)]
    pub precondition: Option<String>,

    /// Default routing target after success
    #[serde(default)]
    pub next_step_id: Option<String>,

    /// Routing target on non-retryable failure
    #[serde(default)]
    pub error_step_id: Option<String>,

    /// Failure of an optional step continues the flow
    #[serde(default)]
    pub optional: bool,

    /// Execution deadline; must be > 0 when present
    #[serde(default)]
    pub timeout_seconds: Option<u32>,

    /// Maximum automatic retries after failure
    #[serde(default)]
    pub retry_count: u32,

    /// Whether this step may be a rollback target
    #[serde(default)]
    pub rollbackable: bool,

    /// Execute on the async pool instead of the caller
    #[serde(default)]
    pub async_step: bool,
}

impl Step {
    /// Read a string option from the step config
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Read an integer option from the step config
    #[must_use]
    pub fn config_i64(&self, key: &str) -> Option<i64> {
        self.config.get(key).and_then(Value::as_i64)
    }

    /// Read a boolean option from the step config
    #[must_use]
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }
}

// =============================================================================
// Workflow
// =============================================================================

/// Immutable workflow definition: typed steps plus routing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Workflow {
    /// Generated when a definition document omits it
    #[serde(default)]
    pub id: WorkflowId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_status")]
    pub status: WorkflowStatus,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub config: ValueMap,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_status() -> WorkflowStatus {
    WorkflowStatus::Draft
}

impl Workflow {
    /// Look up a step by id
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Look up a step by 1-based order
    #[must_use]
    pub fn step_by_order(&self, order: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.order == order)
    }

    /// Entry step: the explicit start step if one exists, else the first step
    #[must_use]
    pub fn entry_step(&self) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.step_type == StepType::Start)
            .or_else(|| self.steps.first())
    }

    /// Only active definitions may spawn instances
    #[must_use]
    pub fn can_spawn_instances(&self) -> bool {
        self.status.can_spawn_instances()
    }

    /// Only draft definitions may be edited
    #[must_use]
    pub fn is_editable(&self) -> bool {
        self.status.is_editable()
    }
}
