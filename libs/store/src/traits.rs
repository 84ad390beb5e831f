//! Repository trait definitions
//!
//! These traits define the persistence port the engine runs against.
//! Implementations must be transactional per call: a returned error means
//! nothing was committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conflux_domain::{
    ExecutionRecord, Instance, InstanceId, InstanceStatus, UserTask, UserTaskId, Variable,
    VariableKey, Workflow, WorkflowId, WorkflowStatus,
};

use crate::error::StoreError;
use crate::pagination::{Listing, PageRequest};

// =============================================================================
// Filters
// =============================================================================

/// Filter for instance listings
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub workflow_id: Option<WorkflowId>,
    pub status: Option<InstanceStatus>,
    pub start_user_id: Option<String>,
    pub business_key: Option<String>,
    pub name_contains: Option<String>,
}

impl InstanceFilter {
    /// Whether an instance matches every set field
    #[must_use]
    pub fn matches(&self, instance: &Instance) -> bool {
        self.workflow_id.is_none_or(|id| instance.workflow_id == id)
            && self.status.is_none_or(|s| instance.status == s)
            && self
                .start_user_id
                .as_deref()
                .is_none_or(|u| instance.start_user_id == u)
            && self
                .business_key
                .as_deref()
                .is_none_or(|k| instance.business_key.as_deref() == Some(k))
            && self
                .name_contains
                .as_deref()
                .is_none_or(|n| instance.name.contains(n))
    }
}

// =============================================================================
// Repository Traits
// =============================================================================

/// Workflow definitions
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    async fn get(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError>;

    async fn list_by_name(&self, name: &str) -> Result<Vec<Workflow>, StoreError>;

    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn update_status(
        &self,
        id: &WorkflowId,
        status: WorkflowStatus,
    ) -> Result<(), StoreError>;
}

/// Workflow instances
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError>;

    async fn list_by_business_key(&self, key: &str) -> Result<Vec<Instance>, StoreError>;

    async fn list(
        &self,
        filter: &InstanceFilter,
        window: PageRequest,
    ) -> Result<Listing<Instance>, StoreError>;

    /// Insert a new instance; conflict if the id already exists
    async fn save(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Update an existing instance; not-found if it was never saved
    async fn update(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Terminal instances whose end time is before the cutoff (cleanup)
    async fn list_ended_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, StoreError>;

    /// Delete the instance and cascade history, user tasks, and variables
    async fn delete_cascade(&self, id: &InstanceId) -> Result<(), StoreError>;
}

/// Append-only execution history
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn append(&self, entry: &ExecutionRecord) -> Result<(), StoreError>;

    /// Entries in append order
    async fn list_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Drop entries that started after the cutoff (rollback pruning)
    async fn prune_after(
        &self,
        instance_id: &InstanceId,
        cutoff: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete_by_instance(&self, instance_id: &InstanceId) -> Result<(), StoreError>;
}

/// Human tasks
#[async_trait]
pub trait UserTaskRepository: Send + Sync {
    async fn save(&self, task: &UserTask) -> Result<(), StoreError>;

    async fn get(&self, id: &UserTaskId) -> Result<Option<UserTask>, StoreError>;

    async fn list_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<UserTask>, StoreError>;

    /// Pending tasks the user may act upon: assignee, candidate user, or
    /// member of a candidate group (the caller resolves group membership).
    async fn list_pending_for_user(
        &self,
        user: &str,
        groups: &[String],
        window: PageRequest,
    ) -> Result<Listing<UserTask>, StoreError>;

    async fn update(&self, task: &UserTask) -> Result<(), StoreError>;

    async fn delete(&self, id: &UserTaskId) -> Result<(), StoreError>;
}

/// Scoped variables
#[async_trait]
pub trait VariableRepository: Send + Sync {
    /// Insert or replace by uniqueness key
    async fn upsert(&self, variable: &Variable) -> Result<(), StoreError>;

    async fn lookup(&self, key: &VariableKey) -> Result<Option<Variable>, StoreError>;

    async fn delete(&self, key: &VariableKey) -> Result<(), StoreError>;

    async fn list_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<Variable>, StoreError>;
}
