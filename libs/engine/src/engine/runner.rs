//! Execution loop
//!
//! Step selection, dispatch, result routing, retry scheduling, and the
//! background loops (retry drainer, periodic cleanup). All loop internals
//! run with the per-instance lock held by the calling operation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use conflux_domain::{
    ExecutionRecord, ExecutionStatus, Instance, InstanceStatus, Step, StepType, Value, ValueMap,
    Workflow,
};

use crate::engine::core::WorkflowEngine;
use crate::engine::retry::ScheduledRetry;
use crate::error::WorkflowError;
use crate::executor::{
    RegisteredExecutor, StepExecutionContext, StepExecutionResult, NEXT_STEP_KEY,
};

/// How routing continues after one step's result was applied
pub(crate) enum Flow {
    /// Keep looping; `Some` overrides the next candidate step
    Continue(Option<String>),
    /// The loop is done for now (waiting, failed, retry scheduled, async)
    Stop,
}

impl WorkflowEngine {
    // =========================================================================
    // The Loop
    // =========================================================================

    /// Drive the instance forward until it completes, waits, fails, hands
    /// off to the async pool, or schedules a retry.
    ///
    /// `explicit` forces the first candidate step (manual retry, error
    /// routing, condition output); otherwise the candidate follows from the
    /// current step's routing.
    pub(crate) async fn advance(
        &self,
        workflow: &Workflow,
        instance: &mut Instance,
        user: &str,
        mut input: Option<ValueMap>,
        mut explicit: Option<String>,
    ) -> Result<(), WorkflowError> {
        loop {
            let candidate = match self.next_candidate(workflow, instance, explicit.take())? {
                Some(step) => step,
                None => {
                    instance
                        .transition_to(InstanceStatus::Completed)
                        .map_err(|err| WorkflowError::state(err.to_string()))?;
                    self.persist(instance).await?;
                    info!(instance_id = %instance.id, "instance completed");
                    return Ok(());
                }
            };

            // Step precondition: false records a skip and moves on.
            if let Some(predicate) = &candidate.precondition {
                if !self
                    .inner
                    .predicates
                    .check_precondition(predicate, &instance.context)
                {
                    debug!(instance_id = %instance.id, step_id = %candidate.id, predicate, "precondition not met");
                    let marker = ExecutionRecord::marker(
                        instance.id,
                        candidate,
                        ExecutionStatus::Skipped,
                        Some(format!("precondition '{predicate}' not met")),
                    );
                    self.inner.history.append(&marker).await?;
                    instance.set_current_step(&candidate.id, candidate.order);
                    self.persist(instance).await?;
                    continue;
                }
            }

            let Some(registered) = self.inner.executors.select(candidate) else {
                let message = format!(
                    "no executor registered for step type {:?}",
                    candidate.step_type
                );
                let marker = ExecutionRecord::marker(
                    instance.id,
                    candidate,
                    ExecutionStatus::Failed,
                    Some(message.clone()),
                );
                self.inner.history.append(&marker).await?;
                instance
                    .mark_failed(message.clone(), None)
                    .map_err(|err| WorkflowError::state(err.to_string()))?;
                self.persist(instance).await?;
                return Ok(());
            };

            instance.set_current_step(&candidate.id, candidate.order);
            self.persist(instance).await?;

            let prior = self
                .count_failed_attempts(instance.id, &candidate.id)
                .await?;
            let ctx = self.build_context(
                workflow,
                instance,
                candidate,
                user,
                input.take().unwrap_or_default(),
                prior,
            );

            // Async and timer steps run on the async pool; the continuation
            // reenters through finish_async_step.
            if candidate.async_step || candidate.step_type == StepType::Timer {
                self.dispatch_async(workflow, candidate, registered, ctx);
                return Ok(());
            }

            let started = Utc::now();
            let input_snapshot = ctx.input.clone();
            let result = registered.run(candidate, &ctx).await;

            match self
                .apply_result(
                    workflow,
                    instance,
                    candidate,
                    input_snapshot,
                    registered.name(),
                    result,
                    started,
                    prior,
                )
                .await?
            {
                Flow::Continue(next) => {
                    explicit = next;
                }
                Flow::Stop => return Ok(()),
            }
        }
    }

    /// Resolve the step to execute next
    fn next_candidate<'w>(
        &self,
        workflow: &'w Workflow,
        instance: &Instance,
        explicit: Option<String>,
    ) -> Result<Option<&'w Step>, WorkflowError> {
        if let Some(step_id) = explicit {
            return workflow
                .step(&step_id)
                .ok_or_else(|| WorkflowError::step_not_found(&step_id).with_instance(instance.id))
                .map(Some);
        }
        match &instance.current_step_id {
            None => Ok(workflow.entry_step()),
            Some(current) => {
                let step = workflow.step(current).ok_or_else(|| {
                    WorkflowError::step_not_found(current).with_instance(instance.id)
                })?;
                match &step.next_step_id {
                    Some(next) => workflow
                        .step(next)
                        .ok_or_else(|| {
                            WorkflowError::step_not_found(next).with_instance(instance.id)
                        })
                        .map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    pub(crate) fn build_context(
        &self,
        workflow: &Workflow,
        instance: &Instance,
        step: &Step,
        user: &str,
        input: ValueMap,
        prior_failures: u32,
    ) -> StepExecutionContext {
        StepExecutionContext::new(
            instance.id,
            workflow.id,
            &step.id,
            user,
            self.inner.settings.step_timeout(step),
        )
        .with_input(input)
        .with_context(instance.context.clone())
        .with_config(instance.config.clone())
        .with_retry_count(prior_failures)
        .with_priority(instance.priority)
        .with_async(step.async_step)
    }

    // =========================================================================
    // Result Routing
    // =========================================================================

    /// Merge the result into the instance, record history, and decide how
    /// the loop proceeds.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn apply_result(
        &self,
        _workflow: &Workflow,
        instance: &mut Instance,
        step: &Step,
        input: ValueMap,
        executor_name: &str,
        result: StepExecutionResult,
        started: DateTime<Utc>,
        prior_failures: u32,
    ) -> Result<Flow, WorkflowError> {
        instance.merge_context(&result.output);
        if !result.output.is_empty() {
            self.inner
                .variables
                .store_context(instance.id, &result.output)
                .await?;
        }

        let record = ExecutionRecord::finished(
            instance.id,
            step,
            executor_name,
            result.status,
            input,
            result.output.clone(),
            result.message.clone(),
            started,
            prior_failures,
        );
        self.inner.history.append(&record).await?;

        match result.status {
            ExecutionStatus::Success => {
                let explicit = (step.step_type == StepType::Condition)
                    .then(|| {
                        result
                            .output
                            .get(NEXT_STEP_KEY)
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .flatten();
                self.persist(instance).await?;
                Ok(Flow::Continue(explicit))
            }

            ExecutionStatus::Waiting => {
                if instance.status != InstanceStatus::Waiting {
                    instance
                        .transition_to(InstanceStatus::Waiting)
                        .map_err(|err| WorkflowError::state(err.to_string()))?;
                }
                self.persist(instance).await?;
                debug!(instance_id = %instance.id, step_id = %step.id, "instance waiting");
                Ok(Flow::Stop)
            }

            ExecutionStatus::Skipped
            | ExecutionStatus::Cancelled
            | ExecutionStatus::ConditionNotMet => {
                self.persist(instance).await?;
                Ok(Flow::Continue(None))
            }

            ExecutionStatus::Retry => {
                let delay = result
                    .retry_delay
                    .unwrap_or_else(|| self.inner.retry_policy.delay_for(prior_failures));
                self.schedule_retry(instance, step, delay, prior_failures).await?;
                self.persist(instance).await?;
                Ok(Flow::Stop)
            }

            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                self.route_failure(instance, step, &result, prior_failures).await
            }

            ExecutionStatus::Rollback => {
                // Executors never emit rollback; treat as a stop if one does.
                self.persist(instance).await?;
                Ok(Flow::Stop)
            }
        }
    }

    /// Failure routing: retry budget, then error route, then optional-skip,
    /// then instance failure.
    async fn route_failure(
        &self,
        instance: &mut Instance,
        step: &Step,
        result: &StepExecutionResult,
        prior_failures: u32,
    ) -> Result<Flow, WorkflowError> {
        let budget_left = step.retry_count > 0 && prior_failures < step.retry_count;
        if budget_left && result.need_retry {
            let delay = result
                .retry_delay
                .unwrap_or_else(|| self.inner.retry_policy.delay_for(prior_failures));
            self.schedule_retry(instance, step, delay, prior_failures).await?;
            self.persist(instance).await?;
            return Ok(Flow::Stop);
        }

        if let Some(error_step) = &step.error_step_id {
            warn!(
                instance_id = %instance.id,
                step_id = %step.id,
                error_step,
                "step failed, taking error route"
            );
            self.persist(instance).await?;
            return Ok(Flow::Continue(Some(error_step.clone())));
        }

        if step.optional {
            debug!(instance_id = %instance.id, step_id = %step.id, "optional step failed, continuing");
            self.persist(instance).await?;
            return Ok(Flow::Continue(None));
        }

        let message = result
            .message
            .clone()
            .unwrap_or_else(|| format!("step '{}' failed", step.id));
        instance
            .mark_failed(message, None)
            .map_err(|err| WorkflowError::state(err.to_string()))?;
        self.persist(instance).await?;
        warn!(instance_id = %instance.id, step_id = %step.id, "instance failed");
        Ok(Flow::Stop)
    }

    /// Record a retry marker and enqueue the retry
    async fn schedule_retry(
        &self,
        instance: &Instance,
        step: &Step,
        delay: Duration,
        prior_failures: u32,
    ) -> Result<(), WorkflowError> {
        let marker = ExecutionRecord::marker(
            instance.id,
            step,
            ExecutionStatus::Retry,
            Some(format!(
                "retry {}/{} scheduled in {} ms",
                prior_failures + 1,
                step.retry_count.max(1),
                delay.as_millis()
            )),
        );
        self.inner.history.append(&marker).await?;

        let due_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        self.inner.retry_queue.push(ScheduledRetry {
            due_at,
            instance_id: instance.id,
            step_id: step.id.clone(),
        });
        debug!(
            instance_id = %instance.id,
            step_id = %step.id,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        Ok(())
    }

    /// Complete the current waiting step with an externally supplied result
    /// and keep the loop going.
    pub(crate) async fn resume_waiting_step(
        &self,
        workflow: &Workflow,
        instance: &mut Instance,
        user: &str,
        result: StepExecutionResult,
    ) -> Result<(), WorkflowError> {
        let Some(current_id) = instance.current_step_id.clone() else {
            return self.advance(workflow, instance, user, None, None).await;
        };
        let step = workflow
            .step(&current_id)
            .ok_or_else(|| WorkflowError::step_not_found(&current_id).with_instance(instance.id))?;

        instance
            .transition_to(InstanceStatus::Running)
            .map_err(|err| WorkflowError::state(err.to_string()))?;

        let executor_name = self
            .inner
            .executors
            .select(step)
            .map_or("external", |r| r.name());
        let prior = self.count_failed_attempts(instance.id, &step.id).await?;
        let started = Utc::now();

        match self
            .apply_result(
                workflow,
                instance,
                step,
                ValueMap::new(),
                executor_name,
                result,
                started,
                prior,
            )
            .await?
        {
            Flow::Continue(next) => self.advance(workflow, instance, user, None, next).await,
            Flow::Stop => Ok(()),
        }
    }

    // =========================================================================
    // Async Dispatch
    // =========================================================================

    /// Submit the step to the async pool; the instance stays Running and
    /// the continuation reenters under the instance lock.
    fn dispatch_async(
        &self,
        workflow: &Workflow,
        step: &Step,
        registered: std::sync::Arc<RegisteredExecutor>,
        ctx: StepExecutionContext,
    ) {
        let engine = self.clone();
        let workflow = workflow.clone();
        let step = step.clone();
        debug!(instance_id = %ctx.instance_id, step_id = %step.id, "step dispatched to async pool");

        self.inner.async_pool.spawn(async move {
            let started = Utc::now();
            let input_snapshot = ctx.input.clone();
            let prior = ctx.retry_count;
            let instance_id = ctx.instance_id;
            let result = registered.run(&step, &ctx).await;

            let lock = engine.inner.locks.for_instance(instance_id);
            let _guard = lock.lock().await;

            let mut instance = match engine.load_instance(instance_id).await {
                Ok(instance) => instance,
                Err(err) => {
                    error!(instance_id = %instance_id, error = %err, "async continuation lost its instance");
                    return;
                }
            };
            // The instance may have been suspended or finished while the
            // step was in flight; its result is then discarded.
            if instance.is_final() || instance.status == InstanceStatus::Suspended {
                debug!(instance_id = %instance_id, status = ?instance.status, "discarding async result");
                return;
            }

            let flow = engine
                .apply_result(
                    &workflow,
                    &mut instance,
                    &step,
                    input_snapshot,
                    registered.name(),
                    result,
                    started,
                    prior,
                )
                .await;
            match flow {
                Ok(Flow::Continue(next)) => {
                    if let Err(err) = engine
                        .advance(&workflow, &mut instance, "system", None, next)
                        .await
                    {
                        error!(instance_id = %instance_id, error = %err, "async continuation failed");
                    }
                }
                Ok(Flow::Stop) => {}
                Err(err) => {
                    error!(instance_id = %instance_id, error = %err, "async result routing failed");
                }
            }
        });
    }

    // =========================================================================
    // Background Loops
    // =========================================================================

    /// Run one due retry; stale retries (instance no longer running) drop.
    async fn run_scheduled_retry(&self, retry: ScheduledRetry) -> Result<(), WorkflowError> {
        let lock = self.inner.locks.for_instance(retry.instance_id);
        let _guard = lock.lock().await;

        let mut instance = match self.load_instance(retry.instance_id).await {
            Ok(instance) => instance,
            Err(_) => {
                debug!(instance_id = %retry.instance_id, "retry dropped, instance gone");
                return Ok(());
            }
        };
        if instance.status != InstanceStatus::Running {
            debug!(
                instance_id = %retry.instance_id,
                status = ?instance.status,
                "retry dropped, instance no longer running"
            );
            return Ok(());
        }

        let workflow = self.load_workflow(instance.workflow_id).await?;
        info!(instance_id = %retry.instance_id, step_id = %retry.step_id, "running scheduled retry");
        self.advance(&workflow, &mut instance, "system", None, Some(retry.step_id))
            .await
    }

    /// Delete terminal instances past the retention window, cascading their
    /// history, user tasks, and variables.
    pub async fn run_cleanup(&self) -> Result<usize, WorkflowError> {
        let cutoff =
            Utc::now() - chrono::Duration::days(self.inner.settings.instance_retention_days);
        let expired = self.inner.instances.list_ended_before(cutoff).await?;
        let count = expired.len();

        for id in expired {
            if let Err(err) = self.inner.instances.delete_cascade(&id).await {
                warn!(instance_id = %id, error = %err, "cleanup failed for instance");
            }
        }
        if count > 0 {
            info!(count, "cleanup removed expired instances");
        }
        Ok(count)
    }

    /// Spawn the retry drainer and the periodic cleanup loop
    pub(crate) fn spawn_background(&self) {
        let drainer = {
            let engine = self.clone();
            let mut shutdown = self.inner.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    for retry in engine.inner.retry_queue.pop_due(Utc::now()) {
                        let worker = engine.clone();
                        engine.inner.scheduler_pool.spawn(async move {
                            if let Err(err) = worker.run_scheduled_retry(retry).await {
                                warn!(error = %err, "scheduled retry failed");
                            }
                        });
                    }

                    let sleep_for = engine
                        .inner
                        .retry_queue
                        .next_due()
                        .map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::from_secs(60))
                        .min(Duration::from_secs(60));
                    tokio::select! {
                        () = engine.inner.retry_queue.wait(sleep_for) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("retry drainer stopped");
            })
        };

        let cleanup = {
            let engine = self.clone();
            let mut shutdown = self.inner.shutdown.subscribe();
            let interval =
                Duration::from_secs(engine.inner.settings.cleanup_interval_minutes * 60);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {
                            let worker = engine.clone();
                            engine.inner.scheduler_pool.spawn(async move {
                                if let Err(err) = worker.run_cleanup().await {
                                    warn!(error = %err, "periodic cleanup failed");
                                }
                            });
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("cleanup loop stopped");
            })
        };

        if let Ok(mut background) = self.inner.background.lock() {
            background.push(drainer);
            background.push(cleanup);
        }
    }
}
