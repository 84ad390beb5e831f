//! Execution history records
//!
//! Append-only per instance; within one instance entries are totally ordered
//! by start time and append order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{ExecutionStatus, StepType};
use crate::ids::InstanceId;
use crate::value::ValueMap;
use crate::workflow::Step;

/// One recorded step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionRecord {
    pub instance_id: InstanceId,
    pub step_id: String,
    pub step_name: String,
    pub step_type: StepType,
    pub status: ExecutionStatus,
    pub executor_name: String,
    #[serde(default)]
    pub input_data: ValueMap,
    #[serde(default)]
    pub output_data: ValueMap,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_time: DateTime<Utc>,
    pub completed_time: DateTime<Utc>,
    pub execution_time_ms: i64,
    pub retry_count: u32,
}

impl ExecutionRecord {
    /// Build a record for a finished step execution.
    ///
    /// `status` is collapsed to the history status set; the duration is
    /// derived from the two timestamps.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn finished(
        instance_id: InstanceId,
        step: &Step,
        executor_name: impl Into<String>,
        status: ExecutionStatus,
        input_data: ValueMap,
        output_data: ValueMap,
        error_message: Option<String>,
        started_time: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        let completed_time = Utc::now();
        Self {
            instance_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_type: step.step_type,
            status: status.as_history_status(),
            executor_name: executor_name.into(),
            input_data,
            output_data,
            error_message,
            started_time,
            completed_time,
            execution_time_ms: (completed_time - started_time).num_milliseconds(),
            retry_count,
        }
    }

    /// A zero-duration marker record (skips, retries, rollbacks)
    #[must_use]
    pub fn marker(
        instance_id: InstanceId,
        step: &Step,
        status: ExecutionStatus,
        message: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_type: step.step_type,
            status: status.as_history_status_or_marker(),
            executor_name: String::new(),
            input_data: ValueMap::new(),
            output_data: ValueMap::new(),
            error_message: message,
            started_time: now,
            completed_time: now,
            execution_time_ms: 0,
            retry_count: 0,
        }
    }

    /// Whether this entry counts against the step's retry budget
    #[must_use]
    pub fn is_failed_attempt(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

impl ExecutionStatus {
    /// Marker records keep Retry and Rollback as-is
    fn as_history_status_or_marker(self) -> ExecutionStatus {
        match self {
            Self::Retry | Self::Rollback => self,
            other => other.as_history_status(),
        }
    }
}
