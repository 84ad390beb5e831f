//! Condition step executor and predicate hooks
//!
//! There is no expression language: routing decisions come from registered
//! predicate hooks. A condition step names a routing predicate in
//! `config.predicate`; the chosen target lands in the result output under
//! `next_step_id` and the loop follows it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use conflux_domain::{Step, StepType, Value, ValueMap};

use crate::error::WorkflowError;
use crate::executor::traits::{StepExecutionContext, StepExecutionResult, StepExecutor};

/// Output key carrying the routing decision of a condition step
pub const NEXT_STEP_KEY: &str = "next_step_id";

/// Step precondition hook: context in, go/no-go out
pub type Precondition = dyn Fn(&ValueMap) -> bool + Send + Sync;

/// Routing predicate hook for condition steps: returns the id of the step to
/// route to, or `None` when no branch applies
pub type RoutingPredicate =
    dyn Fn(&StepExecutionContext) -> Result<Option<String>, WorkflowError> + Send + Sync;

/// Predicate hooks, registered at build time and published once
#[derive(Default)]
pub struct PredicateRegistry {
    preconditions: HashMap<String, Arc<Precondition>>,
    routes: HashMap<String, Arc<RoutingPredicate>>,
}

impl PredicateRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_precondition(
        &mut self,
        name: impl Into<String>,
        predicate: Arc<Precondition>,
    ) {
        self.preconditions.insert(name.into(), predicate);
    }

    pub fn register_route(&mut self, name: impl Into<String>, predicate: Arc<RoutingPredicate>) {
        self.routes.insert(name.into(), predicate);
    }

    /// Evaluate a step's precondition against the instance context.
    ///
    /// An unregistered name fails closed: the step is skipped rather than
    /// run with an unchecked guard.
    #[must_use]
    pub fn check_precondition(&self, name: &str, context: &ValueMap) -> bool {
        match self.preconditions.get(name) {
            Some(predicate) => predicate(context),
            None => {
                debug!(predicate = name, "unknown precondition, failing closed");
                false
            }
        }
    }

    #[must_use]
    pub fn route(&self, name: &str) -> Option<Arc<RoutingPredicate>> {
        self.routes.get(name).cloned()
    }
}

/// Executor for condition steps
pub struct ConditionExecutor {
    predicates: Arc<PredicateRegistry>,
}

impl ConditionExecutor {
    #[must_use]
    pub fn new(predicates: Arc<PredicateRegistry>) -> Self {
        Self { predicates }
    }
}

#[async_trait]
impl StepExecutor for ConditionExecutor {
    fn name(&self) -> &'static str {
        "condition"
    }

    fn supports(&self, step_type: StepType) -> bool {
        step_type == StepType::Condition
    }

    fn validate_config(&self, step: &Step) -> Result<(), WorkflowError> {
        let name = step.config_str("predicate").ok_or_else(|| {
            WorkflowError::configuration(format!(
                "condition step '{}' names no predicate",
                step.id
            ))
            .with_step(step.id.clone())
        })?;
        if self.predicates.route(name).is_none() {
            return Err(WorkflowError::configuration(format!(
                "unknown routing predicate '{name}'"
            ))
            .with_step(step.id.clone()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &StepExecutionContext,
    ) -> Result<StepExecutionResult, WorkflowError> {
        let name = step
            .config_str("predicate")
            .ok_or_else(|| WorkflowError::configuration("condition step names no predicate"))?;
        let predicate = self.predicates.route(name).ok_or_else(|| {
            WorkflowError::configuration(format!("unknown routing predicate '{name}'"))
        })?;

        match predicate(ctx)? {
            Some(next_step_id) => {
                debug!(step_id = %step.id, next = %next_step_id, "condition routed");
                let output: ValueMap =
                    [(NEXT_STEP_KEY.to_string(), Value::from(next_step_id))]
                        .into_iter()
                        .collect();
                Ok(StepExecutionResult::success(output))
            }
            None => Ok(StepExecutionResult::condition_not_met(format!(
                "predicate '{name}' selected no branch"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_domain::{InstanceId, WorkflowId};
    use std::time::Duration;

    fn condition_step(predicate: &str) -> Step {
        Step {
            id: "route".to_string(),
            name: "Route".to_string(),
            description: String::new(),
            order: 1,
            step_type: StepType::Condition,
            executor_key: None,
            config: [("predicate".to_string(), Value::from(predicate))]
                .into_iter()
                .collect(),
            precondition: None,
            next_step_id: None,
            error_step_id: None,
            optional: false,
            timeout_seconds: None,
            retry_count: 0,
            rollbackable: false,
            async_step: false,
        }
    }

    fn registry_with_amount_route() -> PredicateRegistry {
        let mut registry = PredicateRegistry::new();
        registry.register_route(
            "amount_route",
            Arc::new(|ctx: &StepExecutionContext| {
                Ok(ctx.context.get("amount").and_then(Value::as_i64).map(|a| {
                    if a > 100 {
                        "manager_approval".to_string()
                    } else {
                        "auto_approve".to_string()
                    }
                }))
            }),
        );
        registry
    }

    fn ctx(amount: Option<i64>) -> StepExecutionContext {
        let mut context = ValueMap::new();
        if let Some(a) = amount {
            context.insert("amount".to_string(), Value::Long(a));
        }
        StepExecutionContext::new(
            InstanceId::new(),
            WorkflowId::new(),
            "route",
            "u1",
            Duration::from_secs(5),
        )
        .with_context(context)
    }

    #[tokio::test]
    async fn test_predicate_routes_by_context() {
        let executor = ConditionExecutor::new(Arc::new(registry_with_amount_route()));
        let step = condition_step("amount_route");

        let result = executor.execute(&step, &ctx(Some(500))).await.unwrap();
        assert!(result.is_success());
        assert_eq!(
            result.output.get(NEXT_STEP_KEY),
            Some(&Value::from("manager_approval"))
        );

        let result = executor.execute(&step, &ctx(Some(10))).await.unwrap();
        assert_eq!(
            result.output.get(NEXT_STEP_KEY),
            Some(&Value::from("auto_approve"))
        );
    }

    #[tokio::test]
    async fn test_no_branch_yields_condition_not_met() {
        let executor = ConditionExecutor::new(Arc::new(registry_with_amount_route()));
        let step = condition_step("amount_route");

        let result = executor.execute(&step, &ctx(None)).await.unwrap();
        assert_eq!(
            result.status,
            conflux_domain::ExecutionStatus::ConditionNotMet
        );
    }

    #[tokio::test]
    async fn test_unknown_predicate_rejected() {
        let executor = ConditionExecutor::new(Arc::new(PredicateRegistry::new()));
        let step = condition_step("missing");

        assert!(executor.validate_config(&step).is_err());
        assert!(executor.execute(&step, &ctx(None)).await.is_err());
    }

    #[test]
    fn test_unknown_precondition_fails_closed() {
        let registry = PredicateRegistry::new();
        assert!(!registry.check_precondition("ghost", &ValueMap::new()));
    }
}
