//! Scoped variable store
//!
//! Variables resolve through scope visibility: step-scoped values shadow
//! instance-scoped ones, which shadow globals. Values persist as canonical
//! strings through the variable repository; typed decoding happens on read.

use std::sync::Arc;

use uuid::Uuid;

use conflux_domain::{
    InstanceId, Value, ValueMap, Variable, VariableKey, VariableScope,
};
use conflux_store::VariableRepository;

use crate::error::WorkflowError;

/// Globals are stored under the nil instance id
fn global_instance() -> InstanceId {
    InstanceId::from_uuid(Uuid::nil())
}

/// Scoped get/set over the variable repository
#[derive(Clone)]
pub struct VariableStore {
    variables: Arc<dyn VariableRepository>,
}

impl VariableStore {
    #[must_use]
    pub fn new(variables: Arc<dyn VariableRepository>) -> Self {
        Self { variables }
    }

    /// Set a variable in the given scope
    pub async fn set(
        &self,
        instance_id: InstanceId,
        scope: VariableScope,
        step_id: Option<&str>,
        name: &str,
        value: &Value,
    ) -> Result<(), WorkflowError> {
        let key = self.key(instance_id, scope, step_id, name)?;
        self.variables
            .upsert(&Variable::from_value(key, value))
            .await?;
        Ok(())
    }

    /// Get a variable from exactly the given scope
    pub async fn get(
        &self,
        instance_id: InstanceId,
        scope: VariableScope,
        step_id: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, WorkflowError> {
        let key = self.key(instance_id, scope, step_id, name)?;
        let Some(variable) = self.variables.lookup(&key).await? else {
            return Ok(None);
        };
        let value = variable
            .typed_value()
            .map_err(|err| WorkflowError::data(format!("corrupt variable '{name}': {err}")))?;
        Ok(Some(value))
    }

    /// Resolve a name through scope visibility: step, then instance, then
    /// global
    pub async fn resolve(
        &self,
        instance_id: InstanceId,
        step_id: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, WorkflowError> {
        if let Some(step_id) = step_id {
            if let Some(value) = self
                .get(instance_id, VariableScope::Step, Some(step_id), name)
                .await?
            {
                return Ok(Some(value));
            }
        }
        if let Some(value) = self
            .get(instance_id, VariableScope::Instance, None, name)
            .await?
        {
            return Ok(Some(value));
        }
        self.get(global_instance(), VariableScope::Global, None, name)
            .await
    }

    /// Delete a variable
    pub async fn delete(
        &self,
        instance_id: InstanceId,
        scope: VariableScope,
        step_id: Option<&str>,
        name: &str,
    ) -> Result<(), WorkflowError> {
        let key = self.key(instance_id, scope, step_id, name)?;
        self.variables.delete(&key).await?;
        Ok(())
    }

    /// All instance-scoped variables of an instance as a context map
    pub async fn instance_view(
        &self,
        instance_id: InstanceId,
    ) -> Result<ValueMap, WorkflowError> {
        let mut view = ValueMap::new();
        for variable in self.variables.list_by_instance(&instance_id).await? {
            if variable.scope != VariableScope::Instance {
                continue;
            }
            let value = variable.typed_value().map_err(|err| {
                WorkflowError::data(format!("corrupt variable '{}': {err}", variable.name))
            })?;
            view.insert(variable.name, value);
        }
        Ok(view)
    }

    /// Persist a whole context map as instance-scoped variables
    pub async fn store_context(
        &self,
        instance_id: InstanceId,
        context: &ValueMap,
    ) -> Result<(), WorkflowError> {
        for (name, value) in context {
            self.set(instance_id, VariableScope::Instance, None, name, value)
                .await?;
        }
        Ok(())
    }

    fn key(
        &self,
        instance_id: InstanceId,
        scope: VariableScope,
        step_id: Option<&str>,
        name: &str,
    ) -> Result<VariableKey, WorkflowError> {
        let instance_id = if scope == VariableScope::Global {
            global_instance()
        } else {
            instance_id
        };
        let key = VariableKey {
            instance_id,
            scope,
            name: name.to_string(),
            step_id: step_id.map(str::to_string),
        };
        if !key.is_well_formed() {
            return Err(WorkflowError::data(format!(
                "variable '{name}': step_id is required iff scope is step"
            )));
        }
        Ok(key)
    }
}
