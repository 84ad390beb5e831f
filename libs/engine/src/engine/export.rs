//! Instance export and import
//!
//! Exports serialize an instance with its history and user tasks as one
//! canonical JSON document (camelCase keys, ISO-8601 UTC timestamps).
//! Import validates the shape, requires the referenced definition to exist,
//! and rehomes every child row under a freshly generated instance id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conflux_domain::{
    ExecutionRecord, ExecutionStatus, Instance, InstanceId, InstanceStatus, StepType, UserTask,
    UserTaskId, UserTaskStatus, ValueMap, Workflow, WorkflowId,
};

use crate::error::WorkflowError;

/// Version stamped into export metadata
pub const EXPORT_VERSION: &str = "1.0";

// =============================================================================
// Wire Shapes
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedBundle {
    pub instance: ExportedInstance,
    pub execution_history: Vec<ExportedHistoryEntry>,
    pub user_tasks: Vec<ExportedUserTask>,
    pub metadata: ExportMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedInstance {
    pub id: InstanceId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub current_step_id: Option<String>,
    pub current_step_order: u32,
    pub start_user_id: String,
    #[serde(default)]
    pub current_user_id: Option<String>,
    #[serde(default)]
    pub business_key: Option<String>,
    pub priority: i32,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub context: ValueMap,
    #[serde(default)]
    pub config: ValueMap,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedHistoryEntry {
    pub step_id: String,
    pub step_name: String,
    pub step_order: u32,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub executor_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: i64,
    pub retry_count: u32,
    #[serde(default)]
    pub output: ValueMap,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedUserTask {
    pub id: UserTaskId,
    pub instance_id: InstanceId,
    pub workflow_id: WorkflowId,
    pub step_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_users: Vec<String>,
    #[serde(default)]
    pub candidate_groups: Vec<String>,
    pub priority: u8,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    pub status: UserTaskStatus,
    #[serde(default)]
    pub variables: ValueMap,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub export_time: DateTime<Utc>,
    pub export_version: String,
    pub engine_version: String,
}

// =============================================================================
// Export
// =============================================================================

/// Assemble the export bundle for an instance
#[must_use]
pub fn export_bundle(
    instance: &Instance,
    workflow: &Workflow,
    history: &[ExecutionRecord],
    tasks: &[UserTask],
) -> ExportedBundle {
    let execution_history = history
        .iter()
        .map(|record| ExportedHistoryEntry {
            step_id: record.step_id.clone(),
            step_name: record.step_name.clone(),
            step_order: workflow.step(&record.step_id).map_or(0, |s| s.order),
            status: record.status,
            message: record.error_message.clone(),
            executor_id: record.executor_name.clone(),
            start_time: record.started_time,
            end_time: record.completed_time,
            duration: record.execution_time_ms,
            retry_count: record.retry_count,
            output: record.output_data.clone(),
            error: record
                .is_failed_attempt()
                .then(|| record.error_message.clone())
                .flatten(),
        })
        .collect();

    let user_tasks = tasks
        .iter()
        .map(|task| ExportedUserTask {
            id: task.id,
            instance_id: task.instance_id,
            workflow_id: workflow.id,
            step_id: task.step_id.clone(),
            name: task.name.clone(),
            description: (!task.description.is_empty()).then(|| task.description.clone()),
            assignee: task.assignee.clone(),
            candidate_users: task.candidate_users.clone(),
            candidate_groups: task.candidate_groups.clone(),
            priority: task.priority,
            due_date: task.due_date,
            status: task.status,
            variables: task.form_data.clone().unwrap_or_default(),
            create_time: task.create_time,
            update_time: task
                .completed_time
                .or(task.reclaimed_time)
                .or(task.delegated_time)
                .unwrap_or(task.create_time),
        })
        .collect();

    ExportedBundle {
        instance: ExportedInstance {
            id: instance.id,
            workflow_id: instance.workflow_id,
            name: instance.name.clone(),
            status: instance.status,
            current_step_id: instance.current_step_id.clone(),
            current_step_order: instance.current_step_order,
            start_user_id: instance.start_user_id.clone(),
            current_user_id: instance.current_user_id.clone(),
            business_key: instance.business_key.clone(),
            priority: instance.priority,
            create_time: instance.create_time,
            update_time: instance.update_time,
            start_time: instance.start_time,
            end_time: instance.end_time,
            message: instance.error_message.clone(),
            context: instance.context.clone(),
            config: instance.config.clone(),
        },
        execution_history,
        user_tasks,
        metadata: ExportMetadata {
            export_time: Utc::now(),
            export_version: EXPORT_VERSION.to_string(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

/// Serialize an export bundle to its JSON document
pub fn bundle_to_json(bundle: &ExportedBundle) -> Result<String, WorkflowError> {
    serde_json::to_string_pretty(bundle)
        .map_err(|err| WorkflowError::system(format!("export serialization failed: {err}")))
}

// =============================================================================
// Import
// =============================================================================

/// Parse an export document
pub fn parse_bundle(blob: &str) -> Result<ExportedBundle, WorkflowError> {
    serde_json::from_str(blob)
        .map_err(|err| WorkflowError::data(format!("invalid export document: {err}")))
}

/// Materialize a bundle as a new instance with rehomed children.
///
/// The fresh instance id avoids collisions; create/update times are
/// refreshed while start/end times are preserved.
#[must_use]
pub fn materialize(
    bundle: ExportedBundle,
    workflow: &Workflow,
) -> (Instance, Vec<ExecutionRecord>, Vec<UserTask>) {
    let new_id = InstanceId::new();
    let now = Utc::now();
    let exported = bundle.instance;

    let instance = Instance {
        id: new_id,
        workflow_id: exported.workflow_id,
        name: exported.name,
        business_key: exported.business_key,
        priority: exported.priority,
        status: exported.status,
        current_step_id: exported.current_step_id,
        current_step_order: exported.current_step_order,
        start_user_id: exported.start_user_id,
        current_user_id: exported.current_user_id,
        context: exported.context,
        config: exported.config,
        create_time: now,
        start_time: exported.start_time,
        end_time: exported.end_time,
        update_time: now,
        error_message: exported.message,
        error_stack: None,
    };

    let history = bundle
        .execution_history
        .into_iter()
        .map(|entry| ExecutionRecord {
            instance_id: new_id,
            step_type: workflow
                .step(&entry.step_id)
                .map_or(StepType::Task, |s| s.step_type),
            step_id: entry.step_id,
            step_name: entry.step_name,
            status: entry.status,
            executor_name: entry.executor_id,
            input_data: ValueMap::new(),
            output_data: entry.output,
            error_message: entry.message,
            started_time: entry.start_time,
            completed_time: entry.end_time,
            execution_time_ms: entry.duration,
            retry_count: entry.retry_count,
        })
        .collect();

    let tasks = bundle
        .user_tasks
        .into_iter()
        .map(|exported_task| UserTask {
            // Fresh ids: the exported tasks may still exist in this store
            id: UserTaskId::new(),
            instance_id: new_id,
            step_id: exported_task.step_id,
            name: exported_task.name,
            description: exported_task.description.unwrap_or_default(),
            form_key: None,
            form_data: (!exported_task.variables.is_empty()).then_some(exported_task.variables),
            assignee: exported_task.assignee,
            candidate_users: exported_task.candidate_users,
            candidate_groups: exported_task.candidate_groups,
            priority: exported_task.priority,
            status: exported_task.status,
            due_date: exported_task.due_date,
            create_time: exported_task.create_time,
            created_by: String::new(),
            completed_by: None,
            completed_time: None,
            delegated_by: None,
            delegated_time: None,
            delegation_reason: None,
            reclaimed_by: None,
            reclaimed_time: None,
        })
        .collect();

    (instance, history, tasks)
}
