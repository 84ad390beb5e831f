//! User-task step executor
//!
//! Creates pending human tasks, assigns them via a pluggable strategy, and
//! notifies the chosen parties. The step returns Waiting; completion
//! reenters the engine loop through the engine's task operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use tracing::{info, warn};

use conflux_domain::{Step, StepType, UserTask, Value, ValueMap, DEFAULT_TASK_PRIORITY};
use conflux_store::{PageRequest, UserTaskRepository};

use crate::error::WorkflowError;
use crate::executor::traits::{StepExecutionContext, StepExecutionResult, StepExecutor};

/// Strategy used when a step names none
pub const DEFAULT_ASSIGNMENT_STRATEGY: &str = "direct";

// =============================================================================
// Assignment Strategies
// =============================================================================

/// Chooses the assignee for a freshly created task
#[async_trait]
pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick an assignee; `None` leaves the task unassigned for its candidates
    async fn select(&self, task: &UserTask, step: &Step) -> Option<String>;
}

/// Uses the configured assignee, falling back to the first candidate
pub struct DirectAssignment;

#[async_trait]
impl AssignmentStrategy for DirectAssignment {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn select(&self, task: &UserTask, step: &Step) -> Option<String> {
        step.config_str("assignee")
            .map(str::to_string)
            .or_else(|| task.candidate_users.first().cloned())
    }
}

/// Rotates through the candidate users; state is a per-executor index in
/// memory and not durable across restarts
pub struct RoundRobinAssignment {
    index: AtomicUsize,
}

impl RoundRobinAssignment {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinAssignment {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignmentStrategy for RoundRobinAssignment {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    async fn select(&self, task: &UserTask, _step: &Step) -> Option<String> {
        if task.candidate_users.is_empty() {
            return None;
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed);
        task.candidate_users
            .get(index % task.candidate_users.len())
            .cloned()
    }
}

/// Chooses the candidate with the fewest active pending tasks
pub struct LoadBalanceAssignment {
    tasks: Arc<dyn UserTaskRepository>,
}

impl LoadBalanceAssignment {
    #[must_use]
    pub fn new(tasks: Arc<dyn UserTaskRepository>) -> Self {
        Self { tasks }
    }

    async fn pending_count(&self, user: &str) -> i64 {
        match self
            .tasks
            .list_pending_for_user(user, &[], PageRequest::first(100))
            .await
        {
            Ok(listing) => listing
                .items
                .iter()
                .filter(|t| t.assignee.as_deref() == Some(user))
                .count() as i64,
            Err(err) => {
                warn!(%user, error = %err, "load-balance count failed, treating as loaded");
                i64::MAX
            }
        }
    }
}

#[async_trait]
impl AssignmentStrategy for LoadBalanceAssignment {
    fn name(&self) -> &'static str {
        "load_balance"
    }

    async fn select(&self, task: &UserTask, _step: &Step) -> Option<String> {
        let mut best: Option<(&String, i64)> = None;
        for candidate in &task.candidate_users {
            let load = self.pending_count(candidate).await;
            if best.is_none_or(|(_, current)| load < current) {
                best = Some((candidate, load));
            }
        }
        best.map(|(user, _)| user.clone())
    }
}

/// Uniform random pick among the candidates
pub struct RandomAssignment;

#[async_trait]
impl AssignmentStrategy for RandomAssignment {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn select(&self, task: &UserTask, _step: &Step) -> Option<String> {
        task.candidate_users
            .choose(&mut rand::thread_rng())
            .cloned()
    }
}

// =============================================================================
// Notifiers
// =============================================================================

/// Delivers a task notification through one channel
#[async_trait]
pub trait TaskNotifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, task: &UserTask) -> Result<(), WorkflowError>;
}

macro_rules! logging_notifier {
    ($type_name:ident, $channel:literal) => {
        pub struct $type_name;

        #[async_trait]
        impl TaskNotifier for $type_name {
            fn name(&self) -> &'static str {
                $channel
            }

            async fn notify(&self, task: &UserTask) -> Result<(), WorkflowError> {
                info!(
                    channel = $channel,
                    task_id = %task.id,
                    assignee = task.assignee.as_deref().unwrap_or("<unassigned>"),
                    "user task notification"
                );
                Ok(())
            }
        }
    };
}

logging_notifier!(EmailNotifier, "email");
logging_notifier!(SmsNotifier, "sms");
logging_notifier!(SystemNotifier, "system");

// =============================================================================
// User Task Executor
// =============================================================================

/// Executor for human-approval steps
pub struct UserTaskExecutor {
    tasks: Arc<dyn UserTaskRepository>,
    strategies: Arc<HashMap<String, Arc<dyn AssignmentStrategy>>>,
    notifiers: Arc<HashMap<String, Arc<dyn TaskNotifier>>>,
    default_due_hours: i64,
}

impl UserTaskExecutor {
    #[must_use]
    pub fn new(
        tasks: Arc<dyn UserTaskRepository>,
        strategies: Arc<HashMap<String, Arc<dyn AssignmentStrategy>>>,
        notifiers: Arc<HashMap<String, Arc<dyn TaskNotifier>>>,
        default_due_hours: i64,
    ) -> Self {
        Self {
            tasks,
            strategies,
            notifiers,
            default_due_hours,
        }
    }

    /// Built-in strategy table; user strategies are merged in by the builder
    #[must_use]
    pub fn builtin_strategies(
        tasks: Arc<dyn UserTaskRepository>,
    ) -> HashMap<String, Arc<dyn AssignmentStrategy>> {
        let strategies: Vec<Arc<dyn AssignmentStrategy>> = vec![
            Arc::new(DirectAssignment),
            Arc::new(RoundRobinAssignment::new()),
            Arc::new(LoadBalanceAssignment::new(tasks)),
            Arc::new(RandomAssignment),
        ];
        strategies
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect()
    }

    /// Built-in notifier table
    #[must_use]
    pub fn builtin_notifiers() -> HashMap<String, Arc<dyn TaskNotifier>> {
        let notifiers: Vec<Arc<dyn TaskNotifier>> = vec![
            Arc::new(EmailNotifier),
            Arc::new(SmsNotifier),
            Arc::new(SystemNotifier),
        ];
        notifiers
            .into_iter()
            .map(|n| (n.name().to_string(), n))
            .collect()
    }

    fn string_list(step: &Step, key: &str) -> Vec<String> {
        step.config
            .get(key)
            .and_then(Value::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn due_date(&self, step: &Step) -> Option<DateTime<Utc>> {
        if let Some(raw) = step.config_str("due_date") {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
            warn!(step_id = %step.id, raw, "unparseable due_date, using default");
        }
        Some(Utc::now() + ChronoDuration::hours(self.default_due_hours))
    }

    async fn notify_all(&self, step: &Step, task: &UserTask) {
        let types = step
            .config
            .get("notification")
            .and_then(Value::as_object)
            .and_then(|n| n.get("types"))
            .and_then(Value::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for channel in types {
            let Some(notifier) = self.notifiers.get(&channel) else {
                warn!(step_id = %step.id, channel, "unknown notifier, skipping");
                continue;
            };
            // Notifier failures never abort the step.
            if let Err(err) = notifier.notify(task).await {
                warn!(step_id = %step.id, channel, error = %err, "notifier failed");
            }
        }
    }
}

#[async_trait]
impl StepExecutor for UserTaskExecutor {
    fn name(&self) -> &'static str {
        "user-task"
    }

    fn supports(&self, step_type: StepType) -> bool {
        step_type == StepType::UserTask
    }

    fn validate_config(&self, step: &Step) -> Result<(), WorkflowError> {
        let has_assignee = step.config_str("assignee").is_some();
        let has_candidates = !Self::string_list(step, "candidate_users").is_empty();
        let has_groups = !Self::string_list(step, "candidate_groups").is_empty();
        if !has_assignee && !has_candidates && !has_groups {
            return Err(WorkflowError::configuration(format!(
                "user task step '{}' names no assignee, candidate users, or candidate groups",
                step.id
            ))
            .with_step(step.id.clone()));
        }

        let strategy = step
            .config_str("assignment_strategy")
            .unwrap_or(DEFAULT_ASSIGNMENT_STRATEGY);
        if !self.strategies.contains_key(strategy) {
            return Err(WorkflowError::configuration(format!(
                "unknown assignment strategy '{strategy}'"
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
        let priority = step
            .config_i64("priority")
            .and_then(|p| u8::try_from(p).ok())
            .unwrap_or(DEFAULT_TASK_PRIORITY);

        let mut task = UserTask::new(
            ctx.instance_id,
            step.id.clone(),
            step.name.clone(),
            ctx.user_id.clone(),
            Self::string_list(step, "candidate_users"),
            Self::string_list(step, "candidate_groups"),
            priority,
            self.due_date(step),
        );
        task.description = step.description.clone();
        task.form_key = step.config_str("form_key").map(str::to_string);

        let strategy_name = step
            .config_str("assignment_strategy")
            .unwrap_or(DEFAULT_ASSIGNMENT_STRATEGY);
        let strategy = self.strategies.get(strategy_name).ok_or_else(|| {
            WorkflowError::configuration(format!("unknown assignment strategy '{strategy_name}'"))
        })?;

        if let Some(assignee) = strategy.select(&task, step).await {
            task.assign(&assignee)
                .map_err(|err| WorkflowError::system(err.to_string()))?;
        }

        self.tasks.save(&task).await?;
        self.notify_all(step, &task).await;

        info!(
            task_id = %task.id,
            step_id = %step.id,
            strategy = strategy_name,
            assignee = task.assignee.as_deref().unwrap_or("<unassigned>"),
            "user task created"
        );

        let mut output = ValueMap::new();
        output.insert("task_id".to_string(), Value::from(task.id.to_string()));
        if let Some(assignee) = &task.assignee {
            output.insert("assignee".to_string(), Value::from(assignee.clone()));
        }
        output.insert(
            "candidate_users".to_string(),
            Value::List(task.candidate_users.iter().map(|u| Value::from(u.clone())).collect()),
        );
        output.insert(
            "candidate_groups".to_string(),
            Value::List(task.candidate_groups.iter().map(|g| Value::from(g.clone())).collect()),
        );
        if let Some(form_key) = &task.form_key {
            output.insert("form_key".to_string(), Value::from(form_key.clone()));
        }
        output.insert("priority".to_string(), Value::Int(i32::from(task.priority)));
        if let Some(due) = task.due_date {
            output.insert("due_date".to_string(), Value::DateTime(due));
        }

        Ok(StepExecutionResult::waiting(
            format!("waiting for user task {}", task.id),
            output,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_domain::{InstanceId, UserTaskStatus, WorkflowId};
    use conflux_store::InMemoryStore;
    use std::time::Duration;

    fn executor(store: Arc<InMemoryStore>) -> UserTaskExecutor {
        let tasks: Arc<dyn UserTaskRepository> = store;
        UserTaskExecutor::new(
            Arc::clone(&tasks),
            Arc::new(UserTaskExecutor::builtin_strategies(Arc::clone(&tasks))),
            Arc::new(UserTaskExecutor::builtin_notifiers()),
            24,
        )
    }

    fn user_task_step(config: ValueMap) -> Step {
        Step {
            id: "approve".to_string(),
            name: "Approve".to_string(),
            description: "Approve the request".to_string(),
            order: 1,
            step_type: StepType::UserTask,
            executor_key: None,
            config,
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

    fn candidates(users: &[&str]) -> ValueMap {
        let mut config = ValueMap::new();
        config.insert(
            "candidate_users".to_string(),
            Value::List(users.iter().map(|u| Value::from(*u)).collect()),
        );
        config
    }

    fn ctx() -> StepExecutionContext {
        StepExecutionContext::new(
            InstanceId::new(),
            WorkflowId::new(),
            "approve",
            "u1",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_validate_requires_some_audience() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(store);

        let err = executor
            .validate_config(&user_task_step(ValueMap::new()))
            .unwrap_err();
        assert!(err.to_string().contains("no assignee"));

        assert!(executor
            .validate_config(&user_task_step(candidates(&["u2"])))
            .is_ok());
    }

    #[tokio::test]
    async fn test_execute_creates_assigned_waiting_task() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(Arc::clone(&store));
        let step = user_task_step(candidates(&["u2", "u3"]));

        let result = executor.execute(&step, &ctx()).await.unwrap();
        assert!(result.is_waiting());
        assert_eq!(result.output.get("assignee"), Some(&Value::from("u2")));
        assert!(result.output.contains_key("task_id"));
        assert!(result.output.contains_key("due_date"));

        let listing = store
            .list_pending_for_user("u2", &[], PageRequest::default())
            .await
            .unwrap();
        assert_eq!(listing.total, 1);
        assert_eq!(listing.items[0].status, UserTaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let strategy = RoundRobinAssignment::new();
        let step = user_task_step(ValueMap::new());
        let task = UserTask::new(
            InstanceId::new(),
            "s",
            "n",
            "sys",
            vec!["a".to_string(), "b".to_string()],
            vec![],
            50,
            None,
        );

        let first = strategy.select(&task, &step).await;
        let second = strategy.select(&task, &step).await;
        let third = strategy.select(&task, &step).await;
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
        assert_eq!(third.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_load_balance_prefers_idle_candidate() {
        let store = Arc::new(InMemoryStore::new());
        let tasks: Arc<dyn UserTaskRepository> = Arc::clone(&store) as _;

        // Preload one pending task assigned to "busy"
        let mut existing = UserTask::new(
            InstanceId::new(),
            "s0",
            "existing",
            "sys",
            vec![],
            vec![],
            50,
            None,
        );
        existing.assign("busy").unwrap();
        tasks.save(&existing).await.unwrap();

        let strategy = LoadBalanceAssignment::new(tasks);
        let step = user_task_step(ValueMap::new());
        let task = UserTask::new(
            InstanceId::new(),
            "s",
            "n",
            "sys",
            vec!["busy".to_string(), "idle".to_string()],
            vec![],
            50,
            None,
        );

        assert_eq!(strategy.select(&task, &step).await.as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn test_unknown_notifier_does_not_abort() {
        let store = Arc::new(InMemoryStore::new());
        let executor = executor(Arc::clone(&store));

        let mut config = candidates(&["u2"]);
        let notification: ValueMap = [(
            "types".to_string(),
            Value::List(vec![Value::from("carrier-pigeon"), Value::from("system")]),
        )]
        .into_iter()
        .collect();
        config.insert("notification".to_string(), Value::Object(notification));

        let result = executor
            .execute(&user_task_step(config), &ctx())
            .await
            .unwrap();
        assert!(result.is_waiting());
    }
}
