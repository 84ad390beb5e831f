//! Workflow engine public surface
//!
//! The engine exclusively owns instance mutation. Every mutating operation
//! acquires the per-instance lock, re-reads the instance, checks the
//! operation-authority matrix, applies the change, and persists before the
//! lock is released. Readers receive snapshot copies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use conflux_domain::{
    ExecutionRecord, ExecutionStatus, Instance, InstanceId, InstanceStatus, UserTaskId, Value,
    ValueMap, Workflow, WorkflowId, WorkflowOperation, WorkflowStatus,
};
use conflux_store::{
    DefinitionRepository, HistoryRepository, InstanceFilter, InstanceRepository, Listing,
    PageRequest, UserTaskRepository,
};

use crate::context::VariableStore;
use crate::engine::authority;
use crate::engine::export;
use crate::engine::pool::WorkerPool;
use crate::engine::retry::{RetryPolicy, RetryQueue};
use crate::error::WorkflowError;
use crate::executor::{ExecutorRegistry, HealthStatus, PredicateRegistry, StepExecutionResult};
use crate::parser::validate_workflow;
use crate::settings::EngineSettings;

// =============================================================================
// Group Membership
// =============================================================================

/// External user-directory lookup, injected by the embedder
pub trait GroupMembership: Send + Sync {
    /// Whether the user belongs to the group
    fn is_member(&self, user: &str, group: &str) -> bool;

    /// Groups of a user, used for pending-task listings
    fn groups_of(&self, user: &str) -> Vec<String> {
        let _ = user;
        Vec::new()
    }
}

/// Default lookup: nobody belongs to anything
pub struct NoGroups;

impl GroupMembership for NoGroups {
    fn is_member(&self, _user: &str, _group: &str) -> bool {
        false
    }
}

// =============================================================================
// Instance Locks
// =============================================================================

/// Per-instance mutual exclusion; different instances run concurrently
pub(crate) struct InstanceLocks {
    map: StdMutex<HashMap<InstanceId, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    pub(crate) fn new() -> Self {
        Self {
            map: StdMutex::new(HashMap::new()),
        }
    }

    pub(crate) fn for_instance(&self, id: InstanceId) -> Arc<AsyncMutex<()>> {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(map.entry(id).or_default())
    }
}

// =============================================================================
// Batch Results
// =============================================================================

/// Per-instance failure inside a batch operation
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub instance_id: InstanceId,
    pub message: String,
    pub kind: crate::error::ErrorKind,
}

/// Per-instance skip inside a batch operation
#[derive(Debug, Clone)]
pub struct BatchSkip {
    pub instance_id: InstanceId,
    pub reason: String,
}

/// Aggregate outcome of a batch operation; failures are isolated per id
#[derive(Debug, Clone, Default)]
pub struct BatchOperationResult {
    pub successful: Vec<InstanceId>,
    pub failed: Vec<BatchFailure>,
    pub skipped: Vec<BatchSkip>,
}

// =============================================================================
// Engine
// =============================================================================

pub(crate) struct EngineInner {
    pub(crate) settings: EngineSettings,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) definitions: Arc<dyn DefinitionRepository>,
    pub(crate) instances: Arc<dyn InstanceRepository>,
    pub(crate) history: Arc<dyn HistoryRepository>,
    pub(crate) user_tasks: Arc<dyn UserTaskRepository>,
    pub(crate) variables: VariableStore,
    pub(crate) executors: ExecutorRegistry,
    pub(crate) predicates: Arc<PredicateRegistry>,
    pub(crate) groups: Arc<dyn GroupMembership>,
    pub(crate) locks: InstanceLocks,
    pub(crate) async_pool: WorkerPool,
    pub(crate) scheduler_pool: WorkerPool,
    pub(crate) retry_queue: Arc<RetryQueue>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) background: StdMutex<Vec<JoinHandle<()>>>,
}

/// The workflow engine; cheap to clone, all state behind one Arc
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub(crate) fn from_inner(inner: EngineInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Validate and store a workflow definition
    pub async fn deploy_workflow(&self, workflow: Workflow) -> Result<Workflow, WorkflowError> {
        validate_workflow(&workflow)
            .map_err(|err| WorkflowError::configuration(err.to_string()))?;
        self.inner.definitions.save(&workflow).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "workflow deployed");
        Ok(workflow)
    }

    /// Publish a draft definition so it can spawn instances
    pub async fn publish_workflow(&self, id: WorkflowId) -> Result<(), WorkflowError> {
        let workflow = self.load_workflow(id).await?;
        if workflow.status != WorkflowStatus::Draft {
            return Err(WorkflowError::state(format!(
                "workflow '{}' is {:?}, only drafts can be published",
                workflow.name, workflow.status
            )));
        }
        self.inner
            .definitions
            .update_status(&id, WorkflowStatus::Active)
            .await?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, WorkflowError> {
        self.load_workflow(id).await
    }

    // =========================================================================
    // Instance Lifecycle
    // =========================================================================

    /// Start a new instance of an active workflow definition.
    ///
    /// Returns the instance in its state after the synchronous part of the
    /// execution loop: Completed, Waiting, Running (async step in flight),
    /// or Failed if the first step failed synchronously.
    pub async fn start(
        &self,
        workflow_id: WorkflowId,
        user: &str,
        initial_context: ValueMap,
        business_key: Option<String>,
    ) -> Result<Instance, WorkflowError> {
        let workflow = self
            .inner
            .definitions
            .get(&workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::workflow_not_found(workflow_id))?;
        if !workflow.can_spawn_instances() {
            return Err(WorkflowError::state(format!(
                "workflow '{}' is {:?}; only active definitions spawn instances",
                workflow.name, workflow.status
            )));
        }

        let mut instance = Instance::new(&workflow, user, business_key, ValueMap::new());
        instance.context = initial_context.clone();
        self.inner.instances.save(&instance).await?;
        self.inner
            .variables
            .store_context(instance.id, &initial_context)
            .await?;

        let lock = self.inner.locks.for_instance(instance.id);
        let _guard = lock.lock().await;

        instance
            .mark_started()
            .map_err(|err| WorkflowError::state(err.to_string()))?;
        self.persist(&instance).await?;
        info!(instance_id = %instance.id, workflow_id = %workflow_id, user, "instance started");

        self.advance(&workflow, &mut instance, user, None, None).await?;
        Ok(instance)
    }

    /// Drive a running or waiting instance forward.
    ///
    /// For a waiting instance the supplied step result (default: empty
    /// success) completes the waiting step; for a running instance the loop
    /// resumes after the current step.
    pub async fn continue_instance(
        &self,
        id: InstanceId,
        user: &str,
        step_result: Option<StepExecutionResult>,
    ) -> Result<Instance, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        self.authorize(&instance, WorkflowOperation::Continue)?;
        let workflow = self.load_workflow(instance.workflow_id).await?;

        if instance.status == InstanceStatus::Waiting {
            let result = step_result.unwrap_or_else(StepExecutionResult::success_empty);
            self.resume_waiting_step(&workflow, &mut instance, user, result)
                .await?;
        } else {
            self.advance(&workflow, &mut instance, user, None, None).await?;
        }
        Ok(instance)
    }

    /// Force execution of one specific step; the loop does not continue past
    /// it.
    pub async fn execute_step(
        &self,
        id: InstanceId,
        step_id: &str,
        user: &str,
        inputs: ValueMap,
    ) -> Result<StepExecutionResult, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        let workflow = self.load_workflow(instance.workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| WorkflowError::step_not_found(step_id).with_instance(id))?;

        let registered = self.inner.executors.select(step).ok_or_else(|| {
            WorkflowError::configuration(format!(
                "no executor registered for step type {:?}",
                step.step_type
            ))
        })?;

        let prior = self.count_failed_attempts(id, step_id).await?;
        let ctx = self.build_context(&workflow, &instance, step, user, inputs, prior);
        instance.set_current_step(&step.id, step.order);
        self.persist(&instance).await?;

        let started = Utc::now();
        let input_snapshot = ctx.input.clone();
        let result = registered.run(step, &ctx).await;

        instance.merge_context(&result.output);
        let record = ExecutionRecord::finished(
            id,
            step,
            registered.name(),
            result.status,
            input_snapshot,
            result.output.clone(),
            result.message.clone(),
            started,
            prior,
        );
        self.inner.history.append(&record).await?;
        self.persist(&instance).await?;
        Ok(result)
    }

    /// Pause a running or waiting instance
    pub async fn suspend(
        &self,
        id: InstanceId,
        user: &str,
        reason: Option<String>,
    ) -> Result<Instance, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        self.authorize(&instance, WorkflowOperation::Suspend)?;
        instance
            .transition_to(InstanceStatus::Suspended)
            .map_err(|err| WorkflowError::state(err.to_string()))?;
        self.persist(&instance).await?;
        info!(instance_id = %id, user, reason = reason.as_deref().unwrap_or(""), "instance suspended");
        Ok(instance)
    }

    /// Resume a suspended instance; it lands in Waiting when a pending user
    /// task exists for the current step, Running otherwise.
    pub async fn resume(&self, id: InstanceId, user: &str) -> Result<Instance, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        self.authorize(&instance, WorkflowOperation::Resume)?;

        let has_pending_task = match &instance.current_step_id {
            Some(step_id) => self
                .inner
                .user_tasks
                .list_by_instance(&id)
                .await?
                .iter()
                .any(|t| t.is_pending() && &t.step_id == step_id),
            None => false,
        };
        let target = if has_pending_task {
            InstanceStatus::Waiting
        } else {
            InstanceStatus::Running
        };
        instance
            .transition_to(target)
            .map_err(|err| WorkflowError::state(err.to_string()))?;
        self.persist(&instance).await?;
        info!(instance_id = %id, user, status = ?target, "instance resumed");
        Ok(instance)
    }

    /// Terminate an instance (administrative stop)
    pub async fn terminate(
        &self,
        id: InstanceId,
        user: &str,
        reason: Option<String>,
    ) -> Result<Instance, WorkflowError> {
        self.finish_with(id, user, InstanceStatus::Terminated, reason, WorkflowOperation::Terminate)
            .await
    }

    /// Cancel an instance (requester withdrawal)
    pub async fn cancel(
        &self,
        id: InstanceId,
        user: &str,
        reason: Option<String>,
    ) -> Result<Instance, WorkflowError> {
        self.finish_with(id, user, InstanceStatus::Cancelled, reason, WorkflowOperation::Cancel)
            .await
    }

    async fn finish_with(
        &self,
        id: InstanceId,
        user: &str,
        target: InstanceStatus,
        reason: Option<String>,
        operation: WorkflowOperation,
    ) -> Result<Instance, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        self.authorize(&instance, operation)?;
        instance
            .transition_to(target)
            .map_err(|err| WorkflowError::state(err.to_string()))?;
        if let Some(reason) = &reason {
            instance.error_message = Some(reason.clone());
        }
        self.cancel_pending_tasks(id, None).await?;
        self.persist(&instance).await?;
        info!(instance_id = %id, user, status = ?target, "instance finished");
        Ok(instance)
    }

    /// Re-execute a step of a failed instance
    pub async fn retry_step(
        &self,
        id: InstanceId,
        step_id: &str,
        user: &str,
        reason: Option<String>,
    ) -> Result<Instance, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        self.authorize(&instance, WorkflowOperation::RetryStep)?;
        let workflow = self.load_workflow(instance.workflow_id).await?;
        if workflow.step(step_id).is_none() {
            return Err(WorkflowError::step_not_found(step_id).with_instance(id));
        }

        instance
            .transition_to(InstanceStatus::Running)
            .map_err(|err| WorkflowError::state(err.to_string()))?;
        instance.error_message = None;
        instance.error_stack = None;
        self.persist(&instance).await?;
        debug!(instance_id = %id, step_id, user, reason = reason.as_deref().unwrap_or(""), "manual retry");

        self.advance(&workflow, &mut instance, user, None, Some(step_id.to_string()))
            .await?;
        Ok(instance)
    }

    /// Skip an optional step and continue the flow past it
    pub async fn skip_step(
        &self,
        id: InstanceId,
        step_id: &str,
        user: &str,
        reason: Option<String>,
    ) -> Result<Instance, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        self.authorize(&instance, WorkflowOperation::SkipStep)?;
        let workflow = self.load_workflow(instance.workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| WorkflowError::step_not_found(step_id).with_instance(id))?;
        if !step.optional {
            return Err(WorkflowError::invalid_operation(format!(
                "step '{step_id}' is required and cannot be skipped"
            ))
            .with_instance(id)
            .with_step(step_id.to_string()));
        }

        let marker = ExecutionRecord::marker(
            id,
            step,
            ExecutionStatus::Skipped,
            Some(reason.unwrap_or_else(|| format!("skipped by {user}"))),
        );
        self.inner.history.append(&marker).await?;
        self.cancel_pending_tasks(id, Some(step_id)).await?;

        instance.set_current_step(&step.id, step.order);
        if matches!(
            instance.status,
            InstanceStatus::Waiting | InstanceStatus::Failed
        ) {
            instance
                .transition_to(InstanceStatus::Running)
                .map_err(|err| WorkflowError::state(err.to_string()))?;
            instance.error_message = None;
        }
        self.persist(&instance).await?;

        self.advance(&workflow, &mut instance, user, None, None).await?;
        Ok(instance)
    }

    /// Roll the instance back to a previously successful, rollbackable step.
    ///
    /// History entries after the target's last success are pruned, pending
    /// tasks of other steps are dropped, and a rollback marker is appended.
    pub async fn rollback_to(
        &self,
        id: InstanceId,
        step_id: &str,
        user: &str,
        reason: Option<String>,
    ) -> Result<Instance, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        self.authorize(&instance, WorkflowOperation::Rollback)?;
        let workflow = self.load_workflow(instance.workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| WorkflowError::step_not_found(step_id).with_instance(id))?;
        if !step.rollbackable {
            return Err(WorkflowError::invalid_operation(format!(
                "step '{step_id}' is not a rollback target"
            ))
            .with_instance(id)
            .with_step(step_id.to_string()));
        }

        let history = self.inner.history.list_by_instance(&id).await?;
        let last_success = history
            .iter()
            .filter(|e| e.step_id == step_id && e.status == ExecutionStatus::Success)
            .map(|e| e.started_time)
            .max()
            .ok_or_else(|| {
                WorkflowError::invalid_operation(format!(
                    "step '{step_id}' never completed successfully"
                ))
                .with_instance(id)
            })?;

        self.inner.history.prune_after(&id, last_success).await?;

        // Pending tasks of other steps are orphaned by the rollback
        let tasks = self.inner.user_tasks.list_by_instance(&id).await?;
        for task in tasks {
            if task.is_pending() && task.step_id != step_id {
                self.inner.user_tasks.delete(&task.id).await?;
            }
        }

        if instance.status != InstanceStatus::Running {
            instance
                .transition_to(InstanceStatus::Running)
                .map_err(|err| WorkflowError::state(err.to_string()))?;
        }
        instance.error_message = None;
        instance.error_stack = None;
        instance.set_current_step(&step.id, step.order);

        let marker = ExecutionRecord::marker(
            id,
            step,
            ExecutionStatus::Rollback,
            Some(reason.unwrap_or_else(|| format!("rolled back by {user}"))),
        );
        self.inner.history.append(&marker).await?;
        self.persist(&instance).await?;
        info!(instance_id = %id, step_id, user, "instance rolled back");
        Ok(instance)
    }

    /// Merge updates into the instance context
    pub async fn update_context(
        &self,
        id: InstanceId,
        updates: ValueMap,
        user: &str,
    ) -> Result<Instance, WorkflowError> {
        let lock = self.inner.locks.for_instance(id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        self.authorize(&instance, WorkflowOperation::UpdateContext)?;
        instance.merge_context(&updates);
        self.inner.variables.store_context(id, &updates).await?;
        self.persist(&instance).await?;
        debug!(instance_id = %id, user, keys = updates.len(), "context updated");
        Ok(instance)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot read of an instance
    pub async fn get_instance(&self, id: InstanceId) -> Result<Instance, WorkflowError> {
        self.load_instance(id).await
    }

    /// Ordered execution history of an instance
    pub async fn get_history(
        &self,
        id: InstanceId,
    ) -> Result<Vec<ExecutionRecord>, WorkflowError> {
        Ok(self.inner.history.list_by_instance(&id).await?)
    }

    pub async fn list_instances(
        &self,
        filter: &InstanceFilter,
        window: PageRequest,
    ) -> Result<Listing<Instance>, WorkflowError> {
        Ok(self.inner.instances.list(filter, window).await?)
    }

    pub async fn find_by_business_key(
        &self,
        business_key: &str,
    ) -> Result<Vec<Instance>, WorkflowError> {
        Ok(self
            .inner
            .instances
            .list_by_business_key(business_key)
            .await?)
    }

    /// Pending tasks the user may act upon
    pub async fn get_user_tasks(
        &self,
        user: &str,
        page: u64,
        size: u64,
    ) -> Result<Listing<conflux_domain::UserTask>, WorkflowError> {
        let groups = self.inner.groups.groups_of(user);
        Ok(self
            .inner
            .user_tasks
            .list_pending_for_user(user, &groups, PageRequest::of_page(page, size))
            .await?)
    }

    /// Executor statistics keyed by executor name
    #[must_use]
    pub fn executor_metrics(&self) -> std::collections::BTreeMap<String, ValueMap> {
        self.inner.executors.metrics()
    }

    /// Cached executor health keyed by executor name
    pub async fn executor_health(&self) -> std::collections::BTreeMap<String, HealthStatus> {
        self.inner.executors.health_report().await
    }

    // =========================================================================
    // User Task Operations
    // =========================================================================

    /// Complete a pending user task; the form data merges into the instance
    /// context and the engine loop resumes.
    pub async fn complete_user_task(
        &self,
        task_id: UserTaskId,
        user: &str,
        form_data: ValueMap,
    ) -> Result<Instance, WorkflowError> {
        let mut task = self
            .inner
            .user_tasks
            .get(&task_id)
            .await?
            .ok_or_else(|| WorkflowError::data(format!("user task not found: {task_id}")))?;
        if !task.is_pending() {
            return Err(WorkflowError::state(format!(
                "user task {task_id} is {:?}",
                task.status
            )));
        }

        let authorized = task.is_named_user(user)
            || task
                .candidate_groups
                .iter()
                .any(|group| self.inner.groups.is_member(user, group));
        if !authorized {
            return Err(WorkflowError::permission(format!(
                "user '{user}' may not complete task {task_id}"
            )));
        }

        let lock = self.inner.locks.for_instance(task.instance_id);
        let _guard = lock.lock().await;

        task.complete(user, Some(form_data.clone()))
            .map_err(|err| WorkflowError::state(err.to_string()))?;
        self.inner.user_tasks.update(&task).await?;
        info!(task_id = %task_id, user, "user task completed");

        let mut instance = self.load_instance(task.instance_id).await?;
        instance.current_user_id = Some(user.to_string());

        if instance.status == InstanceStatus::Waiting
            && instance.current_step_id.as_deref() == Some(task.step_id.as_str())
        {
            let workflow = self.load_workflow(instance.workflow_id).await?;
            let result = StepExecutionResult::success(form_data);
            self.resume_waiting_step(&workflow, &mut instance, user, result)
                .await?;
        } else {
            self.persist(&instance).await?;
        }
        Ok(instance)
    }

    /// Hand a task to another user; only the current assignee may delegate
    pub async fn delegate_user_task(
        &self,
        task_id: UserTaskId,
        from: &str,
        to: &str,
        reason: Option<String>,
    ) -> Result<(), WorkflowError> {
        let mut task = self
            .inner
            .user_tasks
            .get(&task_id)
            .await?
            .ok_or_else(|| WorkflowError::data(format!("user task not found: {task_id}")))?;

        task.delegate(from, to, reason).map_err(|err| {
            use conflux_domain::UserTaskError;
            match err {
                UserTaskError::NotAssignee { .. } => WorkflowError::permission(err.to_string()),
                other => WorkflowError::state(other.to_string()),
            }
        })?;
        self.inner.user_tasks.update(&task).await?;
        info!(task_id = %task_id, from, to, "user task delegated");
        Ok(())
    }

    /// Take a delegated task back
    pub async fn reclaim_user_task(
        &self,
        task_id: UserTaskId,
        user: &str,
    ) -> Result<(), WorkflowError> {
        let mut task = self
            .inner
            .user_tasks
            .get(&task_id)
            .await?
            .ok_or_else(|| WorkflowError::data(format!("user task not found: {task_id}")))?;

        task.reclaim(user).map_err(|err| {
            use conflux_domain::UserTaskError;
            match err {
                UserTaskError::NotReclaimable { .. } => {
                    WorkflowError::permission(err.to_string())
                }
                other => WorkflowError::state(other.to_string()),
            }
        })?;
        self.inner.user_tasks.update(&task).await?;
        info!(task_id = %task_id, user, "user task reclaimed");
        Ok(())
    }

    // =========================================================================
    // Authority
    // =========================================================================

    /// Whether the operation is currently permitted on the instance
    pub async fn can_perform(
        &self,
        id: InstanceId,
        operation: WorkflowOperation,
        _user: &str,
    ) -> Result<bool, WorkflowError> {
        let instance = self.load_instance(id).await?;
        Ok(authority::is_allowed(instance.status, operation))
    }

    /// Operations currently permitted on the instance
    pub async fn available_operations(
        &self,
        id: InstanceId,
        _user: &str,
    ) -> Result<Vec<WorkflowOperation>, WorkflowError> {
        let instance = self.load_instance(id).await?;
        Ok(authority::allowed_operations(instance.status).to_vec())
    }

    // =========================================================================
    // Batch
    // =========================================================================

    /// Apply one operation across many instances; failures are isolated per
    /// instance.
    pub async fn batch_operation(
        &self,
        ids: &[InstanceId],
        operation: WorkflowOperation,
        user: &str,
        params: ValueMap,
    ) -> BatchOperationResult {
        let mut result = BatchOperationResult::default();
        let reason = params
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let step_id = params
            .get("step_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        for &id in ids {
            let instance = match self.inner.instances.get(&id).await {
                Ok(Some(instance)) => instance,
                Ok(None) => {
                    result.failed.push(BatchFailure {
                        instance_id: id,
                        message: format!("instance not found: {id}"),
                        kind: crate::error::ErrorKind::Data,
                    });
                    continue;
                }
                Err(err) => {
                    result.failed.push(BatchFailure {
                        instance_id: id,
                        message: err.to_string(),
                        kind: crate::error::ErrorKind::Execution,
                    });
                    continue;
                }
            };

            if !authority::is_allowed(instance.status, operation) {
                result.skipped.push(BatchSkip {
                    instance_id: id,
                    reason: format!(
                        "operation {operation:?} not allowed in status {:?}",
                        instance.status
                    ),
                });
                continue;
            }

            let outcome = self
                .apply_batch_op(id, operation, user, reason.clone(), step_id.as_deref())
                .await;
            match outcome {
                Ok(()) => result.successful.push(id),
                Err(err) => result.failed.push(BatchFailure {
                    instance_id: id,
                    message: err.message.clone(),
                    kind: err.kind,
                }),
            }
        }
        result
    }

    async fn apply_batch_op(
        &self,
        id: InstanceId,
        operation: WorkflowOperation,
        user: &str,
        reason: Option<String>,
        step_id: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let need_step = || {
            step_id.map(str::to_string).ok_or_else(|| {
                WorkflowError::configuration(format!(
                    "batch {operation:?} requires a 'step_id' parameter"
                ))
            })
        };

        match operation {
            WorkflowOperation::Suspend => self.suspend(id, user, reason).await.map(drop),
            WorkflowOperation::Resume => self.resume(id, user).await.map(drop),
            WorkflowOperation::Terminate => self.terminate(id, user, reason).await.map(drop),
            WorkflowOperation::Cancel => self.cancel(id, user, reason).await.map(drop),
            WorkflowOperation::Continue => {
                self.continue_instance(id, user, None).await.map(drop)
            }
            WorkflowOperation::RetryStep => {
                let step = need_step()?;
                self.retry_step(id, &step, user, reason).await.map(drop)
            }
            WorkflowOperation::SkipStep => {
                let step = need_step()?;
                self.skip_step(id, &step, user, reason).await.map(drop)
            }
            WorkflowOperation::Rollback => {
                let step = need_step()?;
                self.rollback_to(id, &step, user, reason).await.map(drop)
            }
            WorkflowOperation::Start | WorkflowOperation::UpdateContext => {
                Err(WorkflowError::configuration(format!(
                    "operation {operation:?} is not batchable"
                )))
            }
        }
    }

    // =========================================================================
    // Export / Import
    // =========================================================================

    /// Export an instance with history and user tasks as a JSON document
    pub async fn export(&self, id: InstanceId) -> Result<String, WorkflowError> {
        let instance = self.load_instance(id).await?;
        let workflow = self.load_workflow(instance.workflow_id).await?;
        let history = self.inner.history.list_by_instance(&id).await?;
        let tasks = self.inner.user_tasks.list_by_instance(&id).await?;

        let bundle = export::export_bundle(&instance, &workflow, &history, &tasks);
        export::bundle_to_json(&bundle)
    }

    /// Import an exported instance under a freshly generated id
    pub async fn import(&self, blob: &str, user: &str) -> Result<Instance, WorkflowError> {
        let bundle = export::parse_bundle(blob)?;
        let workflow = self
            .inner
            .definitions
            .get(&bundle.instance.workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::workflow_not_found(bundle.instance.workflow_id))?;

        let (instance, history, tasks) = export::materialize(bundle, &workflow);
        self.inner.instances.save(&instance).await?;
        for record in &history {
            self.inner.history.append(record).await?;
        }
        for task in &tasks {
            self.inner.user_tasks.save(task).await?;
        }
        self.inner
            .variables
            .store_context(instance.id, &instance.context)
            .await?;
        info!(instance_id = %instance.id, user, "instance imported");
        Ok(instance)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the engine: cancel pending retries, halt the background loops,
    /// and drain the pools within their grace periods.
    pub async fn stop(&self) {
        info!("engine stopping");
        let _ = self.inner.shutdown.send(true);
        self.inner.retry_queue.clear();

        let background: Vec<JoinHandle<()>> = self
            .inner
            .background
            .lock()
            .map(|mut b| b.drain(..).collect())
            .unwrap_or_default();
        for handle in background {
            handle.abort();
        }

        self.inner
            .scheduler_pool
            .shutdown(Duration::from_secs(self.inner.settings.scheduler_grace_seconds))
            .await;
        self.inner
            .async_pool
            .shutdown(Duration::from_secs(self.inner.settings.shutdown_grace_seconds))
            .await;
        info!("engine stopped");
    }

    // =========================================================================
    // Shared Helpers
    // =========================================================================

    pub(crate) async fn load_instance(
        &self,
        id: InstanceId,
    ) -> Result<Instance, WorkflowError> {
        self.inner
            .instances
            .get(&id)
            .await?
            .ok_or_else(|| WorkflowError::instance_not_found(id))
    }

    pub(crate) async fn load_workflow(
        &self,
        id: WorkflowId,
    ) -> Result<Workflow, WorkflowError> {
        self.inner
            .definitions
            .get(&id)
            .await?
            .ok_or_else(|| WorkflowError::workflow_not_found(id))
    }

    pub(crate) fn authorize(
        &self,
        instance: &Instance,
        operation: WorkflowOperation,
    ) -> Result<(), WorkflowError> {
        if !authority::is_allowed(instance.status, operation) {
            return Err(WorkflowError::state(format!(
                "operation {operation:?} not allowed while instance {} is {:?}",
                instance.id, instance.status
            ))
            .with_instance(instance.id));
        }
        Ok(())
    }

    pub(crate) async fn persist(&self, instance: &Instance) -> Result<(), WorkflowError> {
        self.inner.instances.update(instance).await?;
        Ok(())
    }

    pub(crate) async fn count_failed_attempts(
        &self,
        id: InstanceId,
        step_id: &str,
    ) -> Result<u32, WorkflowError> {
        let history = self.inner.history.list_by_instance(&id).await?;
        Ok(history
            .iter()
            .filter(|e| e.step_id == step_id && e.is_failed_attempt())
            .count() as u32)
    }

    pub(crate) async fn cancel_pending_tasks(
        &self,
        id: InstanceId,
        step_id: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let tasks = self.inner.user_tasks.list_by_instance(&id).await?;
        for mut task in tasks {
            if !task.is_pending() {
                continue;
            }
            if step_id.is_some_and(|s| task.step_id != s) {
                continue;
            }
            task.cancel();
            if let Err(err) = self.inner.user_tasks.update(&task).await {
                warn!(task_id = %task.id, error = %err, "failed to cancel pending task");
            }
        }
        Ok(())
    }
}
