//! Workflow instance state
//!
//! The engine exclusively owns instance mutation; everything here enforces
//! the status transition rules so an illegal transition can never be
//! committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enums::InstanceStatus;
use crate::ids::{InstanceId, WorkflowId};
use crate::value::{merge_into, Value, ValueMap};
use crate::workflow::Workflow;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by illegal instance state changes
#[derive(Debug, Error)]
pub enum InstanceStateError {
    #[error("invalid status transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("instance {0} is in a terminal state")]
    Terminal(InstanceId),
}

// =============================================================================
// Instance
// =============================================================================

/// A running execution of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Instance {
    pub id: InstanceId,
    pub workflow_id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub business_key: Option<String>,
    #[serde(default)]
    pub priority: i32,

    pub status: InstanceStatus,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub current_step_order: u32,

    pub start_user_id: String,
    #[serde(default)]
    pub current_user_id: Option<String>,

    /// Instance-scoped variables
    #[serde(default)]
    pub context: ValueMap,

    /// Workflow config copied at start plus per-start overrides
    #[serde(default)]
    pub config: ValueMap,

    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,

    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_stack: Option<String>,
}

impl Instance {
    /// Create an instance of a workflow in the Created status.
    ///
    /// Config is the definition's config overlaid with per-start overrides.
    #[must_use]
    pub fn new(
        workflow: &Workflow,
        start_user_id: impl Into<String>,
        business_key: Option<String>,
        config_overrides: ValueMap,
    ) -> Self {
        let now = Utc::now();
        let mut config = workflow.config.clone();
        merge_into(&mut config, &config_overrides);

        Self {
            id: InstanceId::new(),
            workflow_id: workflow.id,
            name: workflow.name.clone(),
            business_key,
            priority: config
                .get("priority")
                .and_then(Value::as_i64)
                .and_then(|p| i32::try_from(p).ok())
                .unwrap_or(0),
            status: InstanceStatus::Created,
            current_step_id: None,
            current_step_order: 0,
            start_user_id: start_user_id.into(),
            current_user_id: None,
            context: ValueMap::new(),
            config,
            create_time: now,
            start_time: None,
            end_time: None,
            update_time: now,
            error_message: None,
            error_stack: None,
        }
    }

    // =========================================================================
    // Status predicates
    // =========================================================================

    #[must_use]
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    #[must_use]
    pub fn can_suspend(&self) -> bool {
        matches!(
            self.status,
            InstanceStatus::Running | InstanceStatus::Waiting
        )
    }

    #[must_use]
    pub fn can_resume(&self) -> bool {
        self.status == InstanceStatus::Suspended
    }

    #[must_use]
    pub fn can_terminate(&self) -> bool {
        !self.is_final()
    }

    #[must_use]
    pub fn can_restart(&self) -> bool {
        matches!(
            self.status,
            InstanceStatus::Failed | InstanceStatus::Terminated
        )
    }

    /// Check whether a transition is allowed without applying it
    #[must_use]
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::{
            Cancelled, Completed, Created, Failed, Running, Suspended, Terminated, Waiting,
        };

        matches!(
            (self.status, to),
            (Created, Running | Terminated | Cancelled)
                | (Running, Waiting | Suspended | Completed | Failed | Terminated | Cancelled)
                | (Waiting, Running | Suspended | Failed | Terminated | Cancelled)
                | (Suspended, Running | Waiting | Terminated | Cancelled)
                | (Failed, Running)
        )
    }

    // =========================================================================
    // Status mutation
    // =========================================================================

    /// Apply a status transition, stamping update time and the end time on
    /// entry into a terminal status.
    pub fn transition_to(&mut self, to: InstanceStatus) -> Result<(), InstanceStateError> {
        if self.is_final() {
            return Err(InstanceStateError::Terminal(self.id));
        }
        if !self.can_transition_to(to) {
            return Err(InstanceStateError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        self.status = to;
        self.update_time = Utc::now();
        if to.is_final() {
            self.end_time = Some(self.update_time);
        }
        Ok(())
    }

    /// Begin execution: Created -> Running with a start timestamp
    pub fn mark_started(&mut self) -> Result<(), InstanceStateError> {
        self.transition_to(InstanceStatus::Running)?;
        self.start_time = Some(self.update_time);
        Ok(())
    }

    /// Record a failure message and enter the Failed status
    pub fn mark_failed(
        &mut self,
        message: impl Into<String>,
        stack: Option<String>,
    ) -> Result<(), InstanceStateError> {
        self.transition_to(InstanceStatus::Failed)?;
        self.error_message = Some(message.into());
        self.error_stack = stack;
        Ok(())
    }

    // =========================================================================
    // Context
    // =========================================================================

    /// Set one context variable
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
        self.update_time = Utc::now();
    }

    /// Merge a map of outputs into the context, last writer wins
    pub fn merge_context(&mut self, outputs: &ValueMap) {
        if outputs.is_empty() {
            return;
        }
        merge_into(&mut self.context, outputs);
        self.update_time = Utc::now();
    }

    /// Point the instance at a step
    pub fn set_current_step(&mut self, step_id: impl Into<String>, order: u32) {
        self.current_step_id = Some(step_id.into());
        self.current_step_order = order;
        self.update_time = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{StepType, WorkflowStatus};
    use crate::workflow::Step;

    fn test_workflow() -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            name: "wf".to_string(),
            version: "1.0".to_string(),
            description: String::new(),
            status: WorkflowStatus::Active,
            steps: vec![Step {
                id: "s1".to_string(),
                name: "S1".to_string(),
                description: String::new(),
                order: 1,
                step_type: StepType::Task,
                executor_key: Some("task".to_string()),
                config: ValueMap::new(),
                precondition: None,
                next_step_id: None,
                error_step_id: None,
                optional: false,
                timeout_seconds: None,
                retry_count: 0,
                rollbackable: false,
                async_step: false,
            }],
            config: [("region".to_string(), Value::from("eu"))].into_iter().collect(),
        }
    }

    #[test]
    fn test_new_instance_copies_config() {
        let wf = test_workflow();
        let overrides: ValueMap = [("priority".to_string(), Value::Int(7))].into_iter().collect();
        let inst = Instance::new(&wf, "u1", Some("bk-1".to_string()), overrides);

        assert_eq!(inst.status, InstanceStatus::Created);
        assert_eq!(inst.config.get("region"), Some(&Value::from("eu")));
        assert_eq!(inst.priority, 7);
        assert_eq!(inst.business_key.as_deref(), Some("bk-1"));
        assert!(inst.end_time.is_none());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let wf = test_workflow();
        let mut inst = Instance::new(&wf, "u1", None, ValueMap::new());

        inst.mark_started().unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);
        assert!(inst.start_time.is_some());

        inst.transition_to(InstanceStatus::Waiting).unwrap();
        assert!(inst.can_suspend());

        inst.transition_to(InstanceStatus::Running).unwrap();
        inst.transition_to(InstanceStatus::Completed).unwrap();
        assert!(inst.is_final());
        assert!(inst.end_time.is_some());
    }

    #[test]
    fn test_terminal_is_frozen() {
        let wf = test_workflow();
        let mut inst = Instance::new(&wf, "u1", None, ValueMap::new());
        inst.transition_to(InstanceStatus::Cancelled).unwrap();

        let result = inst.transition_to(InstanceStatus::Running);
        assert!(matches!(result, Err(InstanceStateError::Terminal(_))));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let wf = test_workflow();
        let mut inst = Instance::new(&wf, "u1", None, ValueMap::new());

        // Created cannot jump straight to Waiting
        let result = inst.transition_to(InstanceStatus::Waiting);
        assert!(matches!(
            result,
            Err(InstanceStateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_failed_allows_retry_only() {
        let wf = test_workflow();
        let mut inst = Instance::new(&wf, "u1", None, ValueMap::new());
        inst.mark_started().unwrap();
        inst.mark_failed("boom", None).unwrap();

        assert!(inst.can_restart());
        assert!(inst.can_transition_to(InstanceStatus::Running));
        assert!(!inst.can_transition_to(InstanceStatus::Terminated));
    }

    #[test]
    fn test_merge_context_updates_timestamp() {
        let wf = test_workflow();
        let mut inst = Instance::new(&wf, "u1", None, ValueMap::new());
        let before = inst.update_time;

        let outputs: ValueMap = [("x".to_string(), Value::Int(1))].into_iter().collect();
        inst.merge_context(&outputs);

        assert_eq!(inst.context.get("x"), Some(&Value::Int(1)));
        assert!(inst.update_time >= before);
    }
}
