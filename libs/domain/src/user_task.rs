//! Human approval tasks
//!
//! A user task is created when a user-task step starts waiting; complete,
//! delegate, and reclaim mutate it under the authorization rules enforced
//! by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enums::UserTaskStatus;
use crate::ids::{InstanceId, UserTaskId};
use crate::value::ValueMap;

/// Default priority when the step config does not set one
pub const DEFAULT_TASK_PRIORITY: u8 = 50;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum UserTaskError {
    #[error("task {0} is not pending")]
    NotPending(UserTaskId),

    #[error("task {task} cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        task: UserTaskId,
        from: UserTaskStatus,
        to: UserTaskStatus,
    },

    #[error("user '{user}' may not delegate task {task}")]
    NotAssignee { task: UserTaskId, user: String },

    #[error("user '{user}' may not reclaim task {task}")]
    NotReclaimable { task: UserTaskId, user: String },
}

// =============================================================================
// UserTask
// =============================================================================

/// A pending piece of human work attached to a waiting instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UserTask {
    pub id: UserTaskId,
    pub instance_id: InstanceId,
    pub step_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub form_key: Option<String>,
    #[serde(default)]
    pub form_data: Option<ValueMap>,

    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_users: Vec<String>,
    #[serde(default)]
    pub candidate_groups: Vec<String>,

    /// 0–100, clamped at construction
    pub priority: u8,
    pub status: UserTaskStatus,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,

    pub create_time: DateTime<Utc>,
    pub created_by: String,
    #[serde(default)]
    pub completed_by: Option<String>,
    #[serde(default)]
    pub completed_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delegated_by: Option<String>,
    #[serde(default)]
    pub delegated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delegation_reason: Option<String>,
    #[serde(default)]
    pub reclaimed_by: Option<String>,
    #[serde(default)]
    pub reclaimed_time: Option<DateTime<Utc>>,
}

impl UserTask {
    /// Create a fresh task in the Created status
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        step_id: impl Into<String>,
        name: impl Into<String>,
        created_by: impl Into<String>,
        candidate_users: Vec<String>,
        candidate_groups: Vec<String>,
        priority: u8,
        due_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: UserTaskId::new(),
            instance_id,
            step_id: step_id.into(),
            name: name.into(),
            description: String::new(),
            form_key: None,
            form_data: None,
            assignee: None,
            candidate_users,
            candidate_groups,
            priority: priority.min(100),
            status: UserTaskStatus::Created,
            due_date,
            create_time: Utc::now(),
            created_by: created_by.into(),
            completed_by: None,
            completed_time: None,
            delegated_by: None,
            delegated_time: None,
            delegation_reason: None,
            reclaimed_by: None,
            reclaimed_time: None,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status.is_pending()
    }

    /// Whether the user is directly named on this task (assignee or
    /// candidate user). Group membership is resolved by the caller.
    #[must_use]
    pub fn is_named_user(&self, user: &str) -> bool {
        self.assignee.as_deref() == Some(user)
            || self.candidate_users.iter().any(|u| u == user)
    }

    /// Assign the task to a user
    pub fn assign(&mut self, user: impl Into<String>) -> Result<(), UserTaskError> {
        if !self.is_pending() {
            return Err(UserTaskError::NotPending(self.id));
        }
        self.assignee = Some(user.into());
        if self.status == UserTaskStatus::Created {
            self.status = UserTaskStatus::Assigned;
        }
        Ok(())
    }

    /// Complete the task; authorization happens in the engine
    pub fn complete(
        &mut self,
        user: impl Into<String>,
        form_data: Option<ValueMap>,
    ) -> Result<(), UserTaskError> {
        if !self.is_pending() {
            return Err(UserTaskError::NotPending(self.id));
        }
        self.status = UserTaskStatus::Completed;
        self.completed_by = Some(user.into());
        self.completed_time = Some(Utc::now());
        if form_data.is_some() {
            self.form_data = form_data;
        }
        Ok(())
    }

    /// Hand the task over to another user; only the current assignee may
    pub fn delegate(
        &mut self,
        from: &str,
        to: impl Into<String>,
        reason: Option<String>,
    ) -> Result<(), UserTaskError> {
        if !self.is_pending() {
            return Err(UserTaskError::NotPending(self.id));
        }
        if self.assignee.as_deref() != Some(from) {
            return Err(UserTaskError::NotAssignee {
                task: self.id,
                user: from.to_string(),
            });
        }
        self.delegated_by = Some(from.to_string());
        self.delegated_time = Some(Utc::now());
        self.delegation_reason = reason;
        self.assignee = Some(to.into());
        self.status = UserTaskStatus::Delegated;
        Ok(())
    }

    /// Take a delegated task back; allowed for the original delegator or a
    /// candidate user
    pub fn reclaim(&mut self, user: &str) -> Result<(), UserTaskError> {
        if !self.is_pending() {
            return Err(UserTaskError::NotPending(self.id));
        }
        let is_delegator = self.delegated_by.as_deref() == Some(user);
        let is_candidate = self.candidate_users.iter().any(|u| u == user);
        if !is_delegator && !is_candidate {
            return Err(UserTaskError::NotReclaimable {
                task: self.id,
                user: user.to_string(),
            });
        }
        self.assignee = Some(user.to_string());
        self.reclaimed_by = Some(user.to_string());
        self.reclaimed_time = Some(Utc::now());
        self.status = UserTaskStatus::Reclaimed;
        Ok(())
    }

    /// Cancel a pending task (instance terminated, rollback, cleanup)
    pub fn cancel(&mut self) {
        if self.is_pending() {
            self.status = UserTaskStatus::Cancelled;
        }
    }
}
