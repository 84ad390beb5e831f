//! Engine builder
//!
//! Registries (executors, task handlers, assignment strategies, notifiers,
//! predicate hooks, custom joins) are populated here and published once at
//! `build`; the engine reads them lock-free afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use conflux_store::{
    DefinitionRepository, HistoryRepository, InstanceRepository, UserTaskRepository,
    VariableRepository,
};

use crate::context::VariableStore;
use crate::engine::core::{EngineInner, GroupMembership, InstanceLocks, NoGroups, WorkflowEngine};
use crate::engine::pool::WorkerPool;
use crate::engine::retry::RetryQueue;
use crate::error::WorkflowError;
use crate::executor::{
    AssignmentStrategy, ConditionExecutor, ControlExecutor, ExecutorRegistry, JoinPredicate,
    ParallelDefaults, ParallelExecutor, Precondition, PredicateRegistry, RoutingPredicate,
    StepExecutor, TaskExecutor, TaskHandler, TaskHandlerRegistry, TaskNotifier, TimerExecutor,
    UserTaskExecutor,
};
use crate::settings::EngineSettings;

/// Builder assembling a [`WorkflowEngine`]
pub struct WorkflowEngineBuilder {
    settings: EngineSettings,
    definitions: Option<Arc<dyn DefinitionRepository>>,
    instances: Option<Arc<dyn InstanceRepository>>,
    history: Option<Arc<dyn HistoryRepository>>,
    user_tasks: Option<Arc<dyn UserTaskRepository>>,
    variables: Option<Arc<dyn VariableRepository>>,
    executors: Vec<Arc<dyn StepExecutor>>,
    task_handlers: TaskHandlerRegistry,
    strategies: HashMap<String, Arc<dyn AssignmentStrategy>>,
    notifiers: HashMap<String, Arc<dyn TaskNotifier>>,
    predicates: PredicateRegistry,
    custom_joins: HashMap<String, Arc<JoinPredicate>>,
    groups: Arc<dyn GroupMembership>,
}

impl WorkflowEngineBuilder {
    #[must_use]
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            definitions: None,
            instances: None,
            history: None,
            user_tasks: None,
            variables: None,
            executors: Vec::new(),
            task_handlers: TaskHandlerRegistry::with_builtins(),
            strategies: HashMap::new(),
            notifiers: HashMap::new(),
            predicates: PredicateRegistry::new(),
            custom_joins: HashMap::new(),
            groups: Arc::new(NoGroups),
        }
    }

    /// Wire every repository port from one store implementation
    #[must_use]
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: DefinitionRepository
            + InstanceRepository
            + HistoryRepository
            + UserTaskRepository
            + VariableRepository
            + Send
            + Sync
            + 'static,
    {
        self.definitions = Some(Arc::clone(&store) as Arc<dyn DefinitionRepository>);
        self.instances = Some(Arc::clone(&store) as Arc<dyn InstanceRepository>);
        self.history = Some(Arc::clone(&store) as Arc<dyn HistoryRepository>);
        self.user_tasks = Some(Arc::clone(&store) as Arc<dyn UserTaskRepository>);
        self.variables = Some(store as Arc<dyn VariableRepository>);
        self
    }

    /// Register a custom executor; takes precedence over the built-ins
    #[must_use]
    pub fn register_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    #[must_use]
    pub fn register_task_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.task_handlers.register(handler);
        self
    }

    #[must_use]
    pub fn register_assignment_strategy(mut self, strategy: Arc<dyn AssignmentStrategy>) -> Self {
        self.strategies.insert(strategy.name().to_string(), strategy);
        self
    }

    #[must_use]
    pub fn register_notifier(mut self, notifier: Arc<dyn TaskNotifier>) -> Self {
        self.notifiers.insert(notifier.name().to_string(), notifier);
        self
    }

    #[must_use]
    pub fn register_precondition(
        mut self,
        name: impl Into<String>,
        predicate: Arc<Precondition>,
    ) -> Self {
        self.predicates.register_precondition(name, predicate);
        self
    }

    #[must_use]
    pub fn register_routing_predicate(
        mut self,
        name: impl Into<String>,
        predicate: Arc<RoutingPredicate>,
    ) -> Self {
        self.predicates.register_route(name, predicate);
        self
    }

    #[must_use]
    pub fn register_join_predicate(
        mut self,
        name: impl Into<String>,
        predicate: Arc<JoinPredicate>,
    ) -> Self {
        self.custom_joins.insert(name.into(), predicate);
        self
    }

    /// Inject the external group-membership lookup
    #[must_use]
    pub fn with_group_membership(mut self, groups: Arc<dyn GroupMembership>) -> Self {
        self.groups = groups;
        self
    }

    /// Publish the registries and start the background loops.
    ///
    /// Must run inside a tokio runtime.
    pub fn build(self) -> Result<WorkflowEngine, WorkflowError> {
        let definitions = self
            .definitions
            .ok_or_else(|| WorkflowError::configuration("engine requires a definition repository"))?;
        let instances = self
            .instances
            .ok_or_else(|| WorkflowError::configuration("engine requires an instance repository"))?;
        let history = self
            .history
            .ok_or_else(|| WorkflowError::configuration("engine requires a history repository"))?;
        let user_tasks = self
            .user_tasks
            .ok_or_else(|| WorkflowError::configuration("engine requires a user task repository"))?;
        let variables = self
            .variables
            .ok_or_else(|| WorkflowError::configuration("engine requires a variable repository"))?;

        let settings = self.settings;
        let task_handlers = Arc::new(self.task_handlers);

        let mut strategies = UserTaskExecutor::builtin_strategies(Arc::clone(&user_tasks));
        strategies.extend(self.strategies);
        let mut notifiers = UserTaskExecutor::builtin_notifiers();
        notifiers.extend(self.notifiers);
        let predicates = Arc::new(self.predicates);

        // User executors first so they win type lookup over the built-ins.
        let mut executors = ExecutorRegistry::new();
        for executor in self.executors {
            executors.register(executor);
        }
        executors.register(Arc::new(TaskExecutor::new(Arc::clone(&task_handlers))));
        executors.register(Arc::new(UserTaskExecutor::new(
            Arc::clone(&user_tasks),
            Arc::new(strategies),
            Arc::new(notifiers),
            settings.user_task_default_due_hours,
        )));
        executors.register(Arc::new(ParallelExecutor::new(
            Arc::clone(&task_handlers),
            Arc::new(self.custom_joins),
            ParallelDefaults {
                step_timeout: std::time::Duration::from_millis(settings.parallel_default_timeout_ms),
                branch_timeout: std::time::Duration::from_millis(
                    settings.parallel_default_branch_ms,
                ),
            },
        )));
        executors.register(Arc::new(ConditionExecutor::new(Arc::clone(&predicates))));
        executors.register(Arc::new(TimerExecutor));
        executors.register(Arc::new(ControlExecutor));

        let (shutdown, _) = watch::channel(false);
        let retry_policy = settings.retry_policy();
        let async_pool = WorkerPool::new("async", settings.async_pool_size);
        let scheduler_pool = WorkerPool::new("scheduler", settings.scheduler_pool_size);

        let engine = WorkflowEngine::from_inner(EngineInner {
            settings,
            retry_policy,
            definitions,
            instances,
            history,
            user_tasks,
            variables: VariableStore::new(variables),
            executors,
            predicates,
            groups: self.groups,
            locks: InstanceLocks::new(),
            async_pool,
            scheduler_pool,
            retry_queue: Arc::new(RetryQueue::new()),
            shutdown,
            background: std::sync::Mutex::new(Vec::new()),
        });
        engine.spawn_background();
        Ok(engine)
    }
}
