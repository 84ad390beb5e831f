//! All enum types for the Conflux engine
//!
//! These enums are the source of truth for status machines and step typing;
//! serialized names use snake_case everywhere.

use serde::{Deserialize, Serialize};

// =============================================================================
// Definition & Instance Status
// =============================================================================

/// Status of a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Suspended,
    Completed,
    Terminated,
}

impl WorkflowStatus {
    /// Only active definitions may spawn instances
    #[must_use]
    pub fn can_spawn_instances(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Only draft definitions may be edited
    #[must_use]
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Draft)
    }
}

/// Status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Running,
    Waiting,
    Suspended,
    Completed,
    Failed,
    Terminated,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses admit no further mutation
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Terminated | Self::Cancelled
        )
    }

    /// Statuses in which the instance is actively progressing
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }
}

// =============================================================================
// Steps
// =============================================================================

/// Type of workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    UserTask,
    Condition,
    ParallelGateway,
    MergeGateway,
    ServiceCall,
    Script,
    Email,
    Timer,
    Start,
    End,
}

impl StepType {
    /// Whether steps of this type must name an executor key
    #[must_use]
    pub fn demands_execution(&self) -> bool {
        matches!(self, Self::Task | Self::ServiceCall | Self::Script | Self::Email)
    }

    /// Control steps carry no work of their own
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Start | Self::End | Self::MergeGateway)
    }
}

/// Outcome status of a single step execution; also used for history records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Waiting,
    Skipped,
    Timeout,
    Retry,
    Rollback,
    Cancelled,
    ConditionNotMet,
}

impl ExecutionStatus {
    /// Collapse to the history record status set: cancelled and
    /// condition-not-met executions are recorded as skipped.
    #[must_use]
    pub fn as_history_status(&self) -> ExecutionStatus {
        match self {
            Self::Cancelled | Self::ConditionNotMet => Self::Skipped,
            other => *other,
        }
    }
}

// =============================================================================
// User Tasks
// =============================================================================

/// Status of a human approval task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTaskStatus {
    Created,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
    Delegated,
    Reclaimed,
    Timeout,
}

impl UserTaskStatus {
    /// Pending tasks can still be acted upon
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Assigned | Self::InProgress | Self::Delegated | Self::Reclaimed
        )
    }
}

// =============================================================================
// Variables
// =============================================================================

/// Visibility scope of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    Instance,
    Step,
    Global,
}

/// Declared type of a variable's canonical string value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Int,
    Long,
    Double,
    Bool,
    Date,
    Datetime,
    Json,
    Array,
    Object,
}

// =============================================================================
// Parallel Execution
// =============================================================================

/// How the branches of a parallel step are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Parallel,
    Sequential,
    Batch,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::Parallel
    }
}

/// How branch outcomes combine into the parallel step's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    And,
    Or,
    Majority,
    First,
    Custom,
}

impl Default for JoinStrategy {
    fn default() -> Self {
        Self::And
    }
}

// =============================================================================
// Engine Operations
// =============================================================================

/// Mutating operations gated by the instance operation-authority matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOperation {
    Start,
    Continue,
    Suspend,
    Resume,
    Terminate,
    Cancel,
    RetryStep,
    SkipStep,
    Rollback,
    UpdateContext,
}

impl WorkflowOperation {
    /// All operations, in matrix column order
    pub const ALL: [WorkflowOperation; 10] = [
        Self::Start,
        Self::Continue,
        Self::Suspend,
        Self::Resume,
        Self::Terminate,
        Self::Cancel,
        Self::RetryStep,
        Self::SkipStep,
        Self::Rollback,
        Self::UpdateContext,
    ];
}
