//! In-memory repository implementation
//!
//! Backs the engine's tests and embedders running without a database.
//! Instance-keyed tables are sharded by instance id to avoid hot contention;
//! every call is atomic under its shard lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use conflux_domain::{
    ExecutionRecord, Instance, InstanceId, UserTask, UserTaskId, Variable, VariableKey, Workflow,
    WorkflowId, WorkflowStatus,
};

use crate::error::StoreError;
use crate::pagination::{Listing, PageRequest};
use crate::traits::{
    DefinitionRepository, HistoryRepository, InstanceFilter, InstanceRepository,
    UserTaskRepository, VariableRepository,
};

/// Number of shards for instance-keyed tables
const SHARD_COUNT: usize = 16;

/// Fixed-size shard set keyed by instance id
struct Shards<T> {
    shards: Vec<RwLock<T>>,
}

impl<T: Default> Shards<T> {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(T::default())).collect(),
        }
    }

    fn shard(&self, instance_id: &InstanceId) -> &RwLock<T> {
        let bytes = instance_id.raw().into_bytes();
        let idx = usize::from(bytes[15]) % SHARD_COUNT;
        &self.shards[idx]
    }

    fn all(&self) -> impl Iterator<Item = &RwLock<T>> {
        self.shards.iter()
    }
}

/// In-memory store implementing every repository port
pub struct InMemoryStore {
    definitions: RwLock<HashMap<WorkflowId, Workflow>>,
    instances: Shards<HashMap<InstanceId, Instance>>,
    history: Shards<HashMap<InstanceId, Vec<ExecutionRecord>>>,
    user_tasks: Shards<HashMap<UserTaskId, UserTask>>,
    variables: Shards<HashMap<VariableKey, Variable>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            instances: Shards::new(),
            history: Shards::new(),
            user_tasks: Shards::new(),
            variables: Shards::new(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Definitions
// =============================================================================

#[async_trait]
impl DefinitionRepository for InMemoryStore {
    async fn get(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.definitions.read().await.get(id).cloned())
    }

    async fn list_by_name(&self, name: &str) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .definitions
            .read()
            .await
            .values()
            .filter(|w| w.name == name)
            .cloned()
            .collect())
    }

    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.definitions
            .write()
            .await
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: &WorkflowId,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let mut definitions = self.definitions.write().await;
        let workflow = definitions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("workflow {id}")))?;
        workflow.status = status;
        Ok(())
    }
}

// =============================================================================
// Instances
// =============================================================================

#[async_trait]
impl InstanceRepository for InMemoryStore {
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError> {
        Ok(self.instances.shard(id).read().await.get(id).cloned())
    }

    async fn list_by_business_key(&self, key: &str) -> Result<Vec<Instance>, StoreError> {
        let mut found = Vec::new();
        for shard in self.instances.all() {
            found.extend(
                shard
                    .read()
                    .await
                    .values()
                    .filter(|i| i.business_key.as_deref() == Some(key))
                    .cloned(),
            );
        }
        Ok(found)
    }

    async fn list(
        &self,
        filter: &InstanceFilter,
        window: PageRequest,
    ) -> Result<Listing<Instance>, StoreError> {
        let mut matched = Vec::new();
        for shard in self.instances.all() {
            matched.extend(shard.read().await.values().filter(|i| filter.matches(i)).cloned());
        }
        matched.sort_by_key(|i| i.create_time);
        Ok(Listing::window(matched, window))
    }

    async fn save(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut shard = self.instances.shard(&instance.id).write().await;
        if shard.contains_key(&instance.id) {
            return Err(StoreError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        shard.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut shard = self.instances.shard(&instance.id).write().await;
        if !shard.contains_key(&instance.id) {
            return Err(StoreError::NotFound(format!("instance {}", instance.id)));
        }
        shard.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn list_ended_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, StoreError> {
        let mut expired = Vec::new();
        for shard in self.instances.all() {
            expired.extend(
                shard
                    .read()
                    .await
                    .values()
                    .filter(|i| i.is_final() && i.end_time.is_some_and(|t| t < cutoff))
                    .map(|i| i.id),
            );
        }
        Ok(expired)
    }

    async fn delete_cascade(&self, id: &InstanceId) -> Result<(), StoreError> {
        debug!(instance_id = %id, "cascading instance delete");
        self.instances.shard(id).write().await.remove(id);
        self.history.shard(id).write().await.remove(id);
        self.user_tasks
            .shard(id)
            .write()
            .await
            .retain(|_, t| t.instance_id != *id);
        self.variables
            .shard(id)
            .write()
            .await
            .retain(|k, _| k.instance_id != *id);
        Ok(())
    }
}

// =============================================================================
// History
// =============================================================================

#[async_trait]
impl HistoryRepository for InMemoryStore {
    async fn append(&self, entry: &ExecutionRecord) -> Result<(), StoreError> {
        self.history
            .shard(&entry.instance_id)
            .write()
            .await
            .entry(entry.instance_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(self
            .history
            .shard(instance_id)
            .read()
            .await
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn prune_after(
        &self,
        instance_id: &InstanceId,
        cutoff: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(entries) = self
            .history
            .shard(instance_id)
            .write()
            .await
            .get_mut(instance_id)
        {
            entries.retain(|e| e.started_time <= cutoff);
        }
        Ok(())
    }

    async fn delete_by_instance(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        self.history.shard(instance_id).write().await.remove(instance_id);
        Ok(())
    }
}

// =============================================================================
// User Tasks
// =============================================================================

#[async_trait]
impl UserTaskRepository for InMemoryStore {
    async fn save(&self, task: &UserTask) -> Result<(), StoreError> {
        self.user_tasks
            .shard(&task.instance_id)
            .write()
            .await
            .insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: &UserTaskId) -> Result<Option<UserTask>, StoreError> {
        // Tasks are sharded by owning instance; scan the shard set.
        for shard in self.user_tasks.all() {
            if let Some(task) = shard.read().await.get(id) {
                return Ok(Some(task.clone()));
            }
        }
        Ok(None)
    }

    async fn list_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<UserTask>, StoreError> {
        let shard = self.user_tasks.shard(instance_id).read().await;
        let mut tasks: Vec<UserTask> = shard
            .values()
            .filter(|t| t.instance_id == *instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.create_time);
        Ok(tasks)
    }

    async fn list_pending_for_user(
        &self,
        user: &str,
        groups: &[String],
        window: PageRequest,
    ) -> Result<Listing<UserTask>, StoreError> {
        let mut matched = Vec::new();
        for shard in self.user_tasks.all() {
            matched.extend(
                shard
                    .read()
                    .await
                    .values()
                    .filter(|t| {
                        t.is_pending()
                            && (t.is_named_user(user)
                                || t.candidate_groups.iter().any(|g| groups.contains(g)))
                    })
                    .cloned(),
            );
        }
        matched.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.create_time.cmp(&b.create_time))
        });
        Ok(Listing::window(matched, window))
    }

    async fn update(&self, task: &UserTask) -> Result<(), StoreError> {
        let mut shard = self.user_tasks.shard(&task.instance_id).write().await;
        if !shard.contains_key(&task.id) {
            return Err(StoreError::NotFound(format!("user task {}", task.id)));
        }
        shard.insert(task.id, task.clone());
        Ok(())
    }

    async fn delete(&self, id: &UserTaskId) -> Result<(), StoreError> {
        for shard in self.user_tasks.all() {
            if shard.write().await.remove(id).is_some() {
                return Ok(());
            }
        }
        Ok(())
    }
}

// =============================================================================
// Variables
// =============================================================================

#[async_trait]
impl VariableRepository for InMemoryStore {
    async fn upsert(&self, variable: &Variable) -> Result<(), StoreError> {
        let key = variable.key();
        if !key.is_well_formed() {
            return Err(StoreError::Conflict(format!(
                "malformed variable key for '{}'",
                variable.name
            )));
        }
        self.variables
            .shard(&key.instance_id)
            .write()
            .await
            .insert(key, variable.clone());
        Ok(())
    }

    async fn lookup(&self, key: &VariableKey) -> Result<Option<Variable>, StoreError> {
        Ok(self
            .variables
            .shard(&key.instance_id)
            .read()
            .await
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &VariableKey) -> Result<(), StoreError> {
        self.variables
            .shard(&key.instance_id)
            .write()
            .await
            .remove(key);
        Ok(())
    }

    async fn list_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<Variable>, StoreError> {
        let shard = self.variables.shard(instance_id).read().await;
        Ok(shard
            .values()
            .filter(|v| v.instance_id == *instance_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_domain::{
        ExecutionStatus, InstanceStatus, Step, StepType, Value, ValueMap, WorkflowStatus,
    };

    fn workflow() -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            name: "order-flow".to_string(),
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
            config: ValueMap::new(),
        }
    }

    #[tokio::test]
    async fn test_definition_roundtrip() {
        let store = InMemoryStore::new();
        let wf = workflow();
        DefinitionRepository::save(&store, &wf).await.unwrap();

        let loaded = DefinitionRepository::get(&store, &wf.id).await.unwrap();
        assert!(loaded.is_some());

        store
            .update_status(&wf.id, WorkflowStatus::Suspended)
            .await
            .unwrap();
        let loaded = DefinitionRepository::get(&store, &wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Suspended);
    }

    #[tokio::test]
    async fn test_instance_save_conflict_and_update() {
        let store = InMemoryStore::new();
        let wf = workflow();
        let mut inst = Instance::new(&wf, "u1", None, ValueMap::new());

        InstanceRepository::save(&store, &inst).await.unwrap();
        assert!(matches!(
            InstanceRepository::save(&store, &inst).await,
            Err(StoreError::Conflict(_))
        ));

        inst.mark_started().unwrap();
        InstanceRepository::update(&store, &inst).await.unwrap();
        let loaded = InstanceRepository::get(&store, &inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let store = InMemoryStore::new();
        let wf = workflow();
        let inst = Instance::new(&wf, "u1", None, ValueMap::new());
        InstanceRepository::save(&store, &inst).await.unwrap();

        let entry = ExecutionRecord::finished(
            inst.id,
            &wf.steps[0],
            "task-executor",
            ExecutionStatus::Success,
            ValueMap::new(),
            ValueMap::new(),
            None,
            Utc::now(),
            0,
        );
        store.append(&entry).await.unwrap();

        let task = UserTask::new(inst.id, "s1", "t", "sys", vec![], vec![], 50, None);
        UserTaskRepository::save(&store, &task).await.unwrap();

        let var = Variable::from_value(VariableKey::instance(inst.id, "x"), &Value::Int(1));
        store.upsert(&var).await.unwrap();

        store.delete_cascade(&inst.id).await.unwrap();

        assert!(InstanceRepository::get(&store, &inst.id).await.unwrap().is_none());
        assert!(HistoryRepository::list_by_instance(&store, &inst.id)
            .await
            .unwrap()
            .is_empty());
        assert!(UserTaskRepository::get(&store, &task.id).await.unwrap().is_none());
        assert!(
            VariableRepository::list_by_instance(&store, &inst.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_pending_tasks_for_user() {
        let store = InMemoryStore::new();
        let inst = InstanceId::new();

        let mut direct = UserTask::new(inst, "s1", "direct", "sys", vec![], vec![], 50, None);
        direct.assign("u1").unwrap();
        UserTaskRepository::save(&store, &direct).await.unwrap();

        let by_group = UserTask::new(
            inst,
            "s2",
            "by-group",
            "sys",
            vec![],
            vec!["managers".to_string()],
            80,
            None,
        );
        UserTaskRepository::save(&store, &by_group).await.unwrap();

        let mut done = UserTask::new(inst, "s3", "done", "sys", vec![], vec![], 50, None);
        done.assign("u1").unwrap();
        done.complete("u1", None).unwrap();
        UserTaskRepository::save(&store, &done).await.unwrap();

        let listing = store
            .list_pending_for_user("u1", &["managers".to_string()], PageRequest::default())
            .await
            .unwrap();

        assert_eq!(listing.total, 2);
        assert!(listing.is_last());
        // Higher priority first
        assert_eq!(listing.items[0].name, "by-group");
    }

    #[tokio::test]
    async fn test_history_prune_after() {
        let store = InMemoryStore::new();
        let wf = workflow();
        let inst = InstanceId::new();

        let first = ExecutionRecord::finished(
            inst,
            &wf.steps[0],
            "task-executor",
            ExecutionStatus::Success,
            ValueMap::new(),
            ValueMap::new(),
            None,
            Utc::now(),
            0,
        );
        store.append(&first).await.unwrap();
        let cutoff = first.started_time;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let later = ExecutionRecord::finished(
            inst,
            &wf.steps[0],
            "task-executor",
            ExecutionStatus::Failed,
            ValueMap::new(),
            ValueMap::new(),
            Some("boom".to_string()),
            Utc::now(),
            0,
        );
        store.append(&later).await.unwrap();

        store.prune_after(&inst, cutoff).await.unwrap();
        let entries = HistoryRepository::list_by_instance(&store, &inst).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_variable_upsert_replaces() {
        let store = InMemoryStore::new();
        let inst = InstanceId::new();
        let key = VariableKey::instance(inst, "count");

        store
            .upsert(&Variable::from_value(key.clone(), &Value::Int(1)))
            .await
            .unwrap();
        store
            .upsert(&Variable::from_value(key.clone(), &Value::Int(2)))
            .await
            .unwrap();

        let var = store.lookup(&key).await.unwrap().unwrap();
        assert_eq!(var.typed_value().unwrap(), Value::Int(2));
    }
}
