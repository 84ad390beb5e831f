//! Step executors
//!
//! The executor registry maps step types (and explicit executor keys) onto
//! registered executors. Registries are assembled by the engine builder and
//! published once; reads are lock-free afterwards.

pub mod condition;
pub mod control;
pub mod lifecycle;
pub mod parallel;
pub mod task;
pub mod traits;
pub mod user_task;

pub use condition::*;
pub use control::*;
pub use lifecycle::*;
pub use parallel::*;
pub use task::*;
pub use traits::*;
pub use user_task::*;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use conflux_domain::{Step, ValueMap};

/// Published set of executors; immutable after the engine is built
#[derive(Default)]
pub struct ExecutorRegistry {
    ordered: Vec<Arc<RegisteredExecutor>>,
    by_name: HashMap<String, Arc<RegisteredExecutor>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor. Earlier registrations win on type lookup, so
    /// user executors are registered before the built-ins.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        let registered = Arc::new(RegisteredExecutor::new(executor));
        self.by_name
            .insert(registered.name().to_string(), Arc::clone(&registered));
        self.ordered.push(registered);
    }

    /// Select the executor for a step: the explicit executor key wins when it
    /// resolves and supports the type, otherwise the first registered
    /// executor supporting the step type.
    #[must_use]
    pub fn select(&self, step: &Step) -> Option<Arc<RegisteredExecutor>> {
        if let Some(key) = &step.executor_key {
            if let Some(registered) = self.by_name.get(key) {
                if registered.executor().supports(step.step_type) {
                    return Some(Arc::clone(registered));
                }
            }
        }
        self.ordered
            .iter()
            .find(|r| r.executor().supports(step.step_type))
            .cloned()
    }

    /// Look up an executor by registry key
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<RegisteredExecutor>> {
        self.by_name.get(name).cloned()
    }

    /// Health of every registered executor, probed concurrently
    pub async fn health_report(&self) -> BTreeMap<String, HealthStatus> {
        let statuses =
            futures::future::join_all(self.ordered.iter().map(|r| r.health())).await;
        self.ordered
            .iter()
            .map(|r| r.name().to_string())
            .zip(statuses)
            .collect()
    }

    /// Statistics of every registered executor
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, ValueMap> {
        self.ordered
            .iter()
            .map(|r| (r.name().to_string(), r.stats().as_metrics()))
            .collect()
    }
}
