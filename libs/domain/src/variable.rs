//! Persisted variables
//!
//! Variables store their value as a canonical string; typed access parses
//! under the declared variable type. Uniqueness is on
//! `(instance_id, scope, name, step_id?)`, with `step_id` required iff the
//! scope is `Step`.

use serde::{Deserialize, Serialize};

use crate::enums::{VariableScope, VariableType};
use crate::ids::{InstanceId, VariableId};
use crate::value::{Value, ValueError};

/// Uniqueness key of a variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableKey {
    pub instance_id: InstanceId,
    pub scope: VariableScope,
    pub name: String,
    pub step_id: Option<String>,
}

impl VariableKey {
    /// An instance-scoped key
    #[must_use]
    pub fn instance(instance_id: InstanceId, name: impl Into<String>) -> Self {
        Self {
            instance_id,
            scope: VariableScope::Instance,
            name: name.into(),
            step_id: None,
        }
    }

    /// A step-scoped key
    #[must_use]
    pub fn step(
        instance_id: InstanceId,
        step_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            scope: VariableScope::Step,
            name: name.into(),
            step_id: Some(step_id.into()),
        }
    }

    /// Key shape is valid iff step_id presence matches the scope
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self.scope {
            VariableScope::Step => self.step_id.is_some(),
            VariableScope::Instance | VariableScope::Global => self.step_id.is_none(),
        }
    }
}

/// A persisted variable row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Variable {
    pub id: VariableId,
    pub instance_id: InstanceId,
    pub name: String,
    pub value_type: VariableType,
    /// Canonical string encoding of the value
    pub value: String,
    pub scope: VariableScope,
    #[serde(default)]
    pub step_id: Option<String>,
}

impl Variable {
    /// Create a variable from a typed value
    #[must_use]
    pub fn from_value(key: VariableKey, value: &Value) -> Self {
        Self {
            id: VariableId::new(),
            instance_id: key.instance_id,
            name: key.name,
            value_type: value.variable_type(),
            value: value.canonical_string(),
            scope: key.scope,
            step_id: key.step_id,
        }
    }

    /// The variable's uniqueness key
    #[must_use]
    pub fn key(&self) -> VariableKey {
        VariableKey {
            instance_id: self.instance_id,
            scope: self.scope,
            name: self.name.clone(),
            step_id: self.step_id.clone(),
        }
    }

    /// Parse the canonical string under the declared type
    pub fn typed_value(&self) -> Result<Value, ValueError> {
        Value::parse_canonical(self.value_type, &self.value)
    }
}
