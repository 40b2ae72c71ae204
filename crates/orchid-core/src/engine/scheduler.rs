//! Workflow scheduler: the three execution modes over a shared dependency
//! graph.
//!
//! `Orchestrator` drives one workflow per [`Orchestrator::process`] call.
//! Sequential walks the resolved order one step at a time. Parallel
//! schedules every dependency-satisfied step into a `tokio::JoinSet`,
//! bounded by a per-run semaphore. Batch partitions steps into
//! dependency-respecting batches drained by a fixed worker pool.
//!
//! # Execution flow
//!
//! 1. Pre-validate the submission (shutdown flag, loaded definition,
//!    workflow id, execution mode, condition names, dependency graph) --
//!    nothing is mutated until validation passes.
//! 2. Acquire the engine-wide workflow permit.
//! 3. Mark the workflow Running, publish `WorkflowStarted`.
//! 4. Per step: evaluate its condition against previous outcomes, emit a
//!    thunk, dispatch to the executor under the step timeout, run the
//!    recovery policy on failure, record the terminal outcome.
//! 5. Settle the final status, update metrics, return the structured
//!    output.
//!
//! The whole mode driver runs under the workflow-level timeout from the
//! loaded definition. Steps completed in a previously restored state are
//! not re-executed and emit no new thunks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orchid_types::error::OrchestrationError;
use orchid_types::event::EngineEvent;
use orchid_types::state::{
    SkipReason, StepOutcome, StepStatus, WorkflowState, WorkflowStateSnapshot,
};
use orchid_types::thunk::ThunkPriority;
use orchid_types::workflow::{
    CoordinationRules, ExecutionMode, OrchestratorInput, OrchestratorOutput, Step, StepType,
    WorkflowDefinition, WorkflowStatus,
};
use serde_json::json;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::conditions::{ConditionFn, ConditionRegistry, DEFAULT_CONDITION};
use crate::engine::dispatch::{DispatchError, ThunkExecutor, WorkerRouter};
use crate::engine::emitter::{EmitRequest, ThunkEmitter};
use crate::engine::graph::{
    partition_batches, resolve_execution_order, transitive_dependents, validate_steps,
};
use crate::engine::metrics::{MetricsCollector, MetricsSnapshot};
use crate::engine::retry::{RecoveryDecision, RecoveryPolicy};
use crate::engine::state::StateStore;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// Per-run parameters shared by the mode drivers.
struct RunContext {
    workflow_id: Uuid,
    rules: CoordinationRules,
    default_timeout_ms: u64,
    /// Step ids already completed in a restored state; never re-executed.
    completed_before: HashSet<String>,
}

impl RunContext {
    /// Synthetic Completed outcomes (null output, zero attempts) for steps
    /// finished before this run, in submission order. Seeding the outcome
    /// list with these keeps condition functions such as
    /// `previous_step_success` working across a restore boundary; they are
    /// stripped from the run's own outcome list afterwards.
    fn resumed_outcomes(&self, steps: &[Step]) -> Vec<StepOutcome> {
        steps
            .iter()
            .filter(|step| self.completed_before.contains(&step.step_id))
            .map(|step| StepOutcome::completed(&step.step_id, serde_json::Value::Null, 0, 0))
            .collect()
    }
}

/// What a mode driver hands back: terminal outcomes in run order, plus
/// whether shutdown interrupted the run before every step was reached.
struct RunOutcome {
    outcomes: Vec<StepOutcome>,
    cancelled: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The workflow orchestration engine.
///
/// Generic over `E: ThunkExecutor`, the external seam that performs the
/// actual work of each emitted thunk.
pub struct Orchestrator<E: ThunkExecutor> {
    executor: Arc<E>,
    config: EngineConfig,
    event_bus: EventBus,
    conditions: ConditionRegistry,
    emitter: Arc<ThunkEmitter>,
    states: StateStore,
    metrics: MetricsCollector,
    router: Arc<WorkerRouter>,
    definition: RwLock<Option<WorkflowDefinition>>,
    /// Engine-wide bound on concurrently processing workflows.
    workflow_permits: Arc<Semaphore>,
    /// Workflows currently inside `process`, keyed to their start time.
    active: DashMap<Uuid, DateTime<Utc>>,
    /// Most recently processed workflow, for the snapshot passthroughs.
    last_workflow: RwLock<Option<Uuid>>,
    shutdown: AtomicBool,
    shutdown_token: CancellationToken,
}

impl<E: ThunkExecutor + 'static> Orchestrator<E> {
    pub fn new(executor: E, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_capacity);
        let router = Arc::new(WorkerRouter::new(config.batch_workers, config.router_strategy));
        let workflow_permits = Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1)));
        Self {
            executor: Arc::new(executor),
            event_bus,
            conditions: ConditionRegistry::new(),
            emitter: Arc::new(ThunkEmitter::new()),
            states: StateStore::new(),
            metrics: MetricsCollector::new(),
            router,
            definition: RwLock::new(None),
            workflow_permits,
            active: DashMap::new(),
            last_workflow: RwLock::new(None),
            shutdown: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    /// Install the workflow definition used by every subsequent `process`
    /// call. Replaces any previously loaded definition.
    pub async fn load_definition(&self, definition: WorkflowDefinition) {
        tracing::info!(
            workflow = definition.name.as_str(),
            version = definition.version.as_str(),
            "workflow definition loaded"
        );
        *self.definition.write().await = Some(definition);
    }

    // -----------------------------------------------------------------------
    // process
    // -----------------------------------------------------------------------

    /// Execute one workflow submission to a terminal status.
    pub async fn process(
        &self,
        input: OrchestratorInput,
    ) -> Result<OrchestratorOutput, OrchestrationError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(OrchestrationError::InvalidState(
                "engine is shutting down; new workflow submissions are refused".to_string(),
            ));
        }
        let definition = self.definition.read().await.clone().ok_or_else(|| {
            OrchestrationError::InvalidState("workflow definition not loaded".to_string())
        })?;

        if input.workflow_id.is_nil() {
            return Err(OrchestrationError::Validation(
                "workflow id must not be the nil UUID".to_string(),
            ));
        }
        if input.steps.is_empty() {
            return Err(OrchestrationError::Validation(
                "workflow submission contains no steps".to_string(),
            ));
        }
        if input.mode != ExecutionMode::Sequential
            && !definition.coordination.parallel_execution_allowed
        {
            return Err(OrchestrationError::Validation(format!(
                "execution mode '{}' is not allowed: workflow '{}' permits sequential only",
                input.mode.as_str(),
                definition.name,
            )));
        }
        for step in &input.steps {
            if let Some(condition) = &step.condition {
                if !self.conditions.contains(condition) {
                    return Err(OrchestrationError::Validation(format!(
                        "unknown condition '{condition}' referenced by step '{}'",
                        step.step_id
                    )));
                }
            }
        }
        let order = resolve_execution_order(&input.steps)?;

        let _permit = Arc::clone(&self.workflow_permits)
            .acquire_owned()
            .await
            .map_err(|err| {
                OrchestrationError::OperationFailed(format!("workflow permit unavailable: {err}"))
            })?;

        let workflow_id = input.workflow_id;
        let state = self.states.ensure(workflow_id);
        let completed_before = state.completed_step_ids;
        self.states.set_status(workflow_id, WorkflowStatus::Running);
        self.states.merge_context(workflow_id, input.metadata.clone());
        self.states.set_context_value(
            workflow_id,
            "execution_status",
            json!(WorkflowStatus::Running.as_str()),
        );
        self.active.insert(workflow_id, Utc::now());
        *self.last_workflow.write().await = Some(workflow_id);

        let count_before = self.emitter.count_for(workflow_id);

        self.event_bus.publish(EngineEvent::WorkflowStarted {
            workflow_id,
            workflow_name: definition.name.clone(),
            mode: input.mode.as_str().to_string(),
            step_count: input.steps.len(),
        });
        tracing::info!(
            workflow_id = %workflow_id,
            workflow = definition.name.as_str(),
            mode = input.mode.as_str(),
            steps = input.steps.len(),
            resumed = completed_before.len(),
            "starting workflow execution"
        );

        let ctx = RunContext {
            workflow_id,
            rules: definition.coordination.clone(),
            default_timeout_ms: self.config.default_step_timeout_ms,
            completed_before,
        };

        let run_start = std::time::Instant::now();
        let workflow_timeout = Duration::from_millis(definition.timeout_ms);
        let driver = async {
            match input.mode {
                ExecutionMode::Sequential => self.run_sequential(&ctx, &input.steps, &order).await,
                ExecutionMode::Parallel => {
                    self.run_parallel(&ctx, &input.steps, input.max_parallel_steps).await
                }
                ExecutionMode::Batch => self.run_batch(&ctx, &input.steps).await,
            }
        };

        let run = match tokio::time::timeout(workflow_timeout, driver).await {
            Ok(Ok(run)) => run,
            Ok(Err(err)) => {
                self.finish_failed(workflow_id, input.mode, run_start, &err.to_string());
                self.active.remove(&workflow_id);
                return Err(err);
            }
            Err(_elapsed) => {
                let err = OrchestrationError::ExecutionTimeout {
                    scope: "workflow".to_string(),
                    timeout_ms: definition.timeout_ms,
                };
                self.finish_failed(workflow_id, input.mode, run_start, &err.to_string());
                self.active.remove(&workflow_id);
                return Err(err);
            }
        };
        self.active.remove(&workflow_id);

        let completed_steps: Vec<String> = run
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == StepStatus::Completed)
            .map(|outcome| outcome.step_id.clone())
            .collect();
        let failed_steps: Vec<String> = run
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == StepStatus::Failed)
            .map(|outcome| outcome.step_id.clone())
            .collect();
        let skipped_steps: Vec<String> = run
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == StepStatus::Skipped)
            .map(|outcome| outcome.step_id.clone())
            .collect();

        let status = if run.cancelled {
            WorkflowStatus::Cancelled
        } else if failed_steps.is_empty() {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        self.states.set_status(workflow_id, status);
        self.states
            .set_context_value(workflow_id, "execution_status", json!(status.as_str()));

        let processing_time_ms = run_start.elapsed().as_millis() as u64;
        self.metrics
            .record(input.mode, status == WorkflowStatus::Completed, processing_time_ms);

        match status {
            WorkflowStatus::Completed => {
                self.event_bus.publish(EngineEvent::WorkflowCompleted {
                    workflow_id,
                    duration_ms: processing_time_ms,
                    steps_completed: completed_steps.len(),
                });
                tracing::info!(
                    workflow_id = %workflow_id,
                    duration_ms = processing_time_ms,
                    "workflow completed"
                );
            }
            WorkflowStatus::Failed => {
                let error = format!("failed steps: {}", failed_steps.join(", "));
                self.event_bus.publish(EngineEvent::WorkflowFailed {
                    workflow_id,
                    error: error.clone(),
                });
                tracing::warn!(
                    workflow_id = %workflow_id,
                    error = error.as_str(),
                    "workflow failed"
                );
            }
            WorkflowStatus::Cancelled => {
                tracing::info!(workflow_id = %workflow_id, "workflow cancelled during shutdown");
            }
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
        }

        let actions_emitted: Vec<Uuid> = self
            .emitter
            .emitted_for(workflow_id)
            .into_iter()
            .skip(count_before)
            .map(|thunk| thunk.thunk_id)
            .collect();

        let metrics = json!({
            "completed_count": completed_steps.len(),
            "failed_count": failed_steps.len(),
            "skipped_count": skipped_steps.len(),
            "thunks_emitted": actions_emitted.len(),
            "mode": input.mode.as_str(),
        });

        Ok(OrchestratorOutput {
            workflow_id,
            execution_status: status,
            completed_steps,
            failed_steps,
            skipped_steps,
            actions_emitted,
            metrics,
            processing_time_ms,
        })
    }

    // -----------------------------------------------------------------------
    // Mode drivers
    // -----------------------------------------------------------------------

    /// One step at a time in resolved topological order. A Halt decision
    /// stops the remaining steps; steps never reached appear in no output
    /// set.
    async fn run_sequential(
        &self,
        ctx: &RunContext,
        steps: &[Step],
        order: &[String],
    ) -> Result<RunOutcome, OrchestrationError> {
        let by_id: HashMap<&str, &Step> =
            steps.iter().map(|step| (step.step_id.as_str(), step)).collect();
        let ordered: Vec<&Step> = order
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect();

        let mut outcomes = ctx.resumed_outcomes(steps);
        let prior = outcomes.len();
        let mut thunk_ids: HashMap<String, Uuid> = HashMap::new();
        let mut failed_path: HashSet<String> = HashSet::new();
        let mut cancelled = false;

        for step in ordered {
            if self.shutdown_token.is_cancelled() {
                cancelled = true;
                break;
            }
            if ctx.completed_before.contains(&step.step_id) {
                tracing::debug!(
                    workflow_id = %ctx.workflow_id,
                    step_id = step.step_id.as_str(),
                    "step already completed in restored state; not re-executing"
                );
                continue;
            }
            if step.depends_on.iter().any(|dep| failed_path.contains(dep)) {
                failed_path.insert(step.step_id.clone());
                self.record_skip(
                    ctx.workflow_id,
                    &step.step_id,
                    SkipReason::DependencyFailed,
                    &mut outcomes,
                );
                continue;
            }
            if !step.enabled {
                self.record_skip(
                    ctx.workflow_id,
                    &step.step_id,
                    SkipReason::Disabled,
                    &mut outcomes,
                );
                continue;
            }
            let condition = step.condition.as_deref().unwrap_or(DEFAULT_CONDITION);
            if !self.conditions.evaluate(condition, step, &outcomes)? {
                self.record_skip(
                    ctx.workflow_id,
                    &step.step_id,
                    SkipReason::ConditionFalse,
                    &mut outcomes,
                );
                continue;
            }

            let dependency_thunks: Vec<Uuid> = step
                .depends_on
                .iter()
                .filter_map(|dep| thunk_ids.get(dep).copied())
                .collect();
            let (outcome, decision, last_thunk) = Self::execute_step_attempts(
                Arc::clone(&self.executor),
                Arc::clone(&self.emitter),
                self.event_bus.clone(),
                ctx.workflow_id,
                step.clone(),
                dependency_thunks,
                ctx.rules.clone(),
                ctx.default_timeout_ms,
            )
            .await?;

            if let Some(thunk_id) = last_thunk {
                thunk_ids.insert(step.step_id.clone(), thunk_id);
            }

            let failed = !outcome.is_completed();
            if failed {
                self.record_failure(ctx.workflow_id, &outcome);
                failed_path.insert(step.step_id.clone());
            } else {
                self.states.record_step_completed(ctx.workflow_id, &outcome.step_id);
            }
            outcomes.push(outcome);

            if failed && decision == RecoveryDecision::Halt {
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    step_id = step.step_id.as_str(),
                    "halting remaining steps"
                );
                break;
            }
        }

        Ok(RunOutcome {
            outcomes: outcomes.split_off(prior),
            cancelled,
        })
    }

    /// Dependency-driven ready-set scheduling. A step spawns only after
    /// every dependency reached a terminal outcome; steps already running
    /// when a sibling fails run to completion, while unscheduled transitive
    /// dependents of the failure are recorded as skipped and never spawn.
    async fn run_parallel(
        &self,
        ctx: &RunContext,
        steps: &[Step],
        max_parallel_steps: Option<usize>,
    ) -> Result<RunOutcome, OrchestrationError> {
        let limit = max_parallel_steps.unwrap_or(steps.len()).max(1);
        let permits = Arc::new(Semaphore::new(limit));

        let mut outcomes = ctx.resumed_outcomes(steps);
        let prior = outcomes.len();
        let mut thunk_ids: HashMap<String, Uuid> = HashMap::new();
        let mut satisfied: HashSet<String> = ctx.completed_before.clone();
        let mut failed_path: HashSet<String> = HashSet::new();
        let mut pending: Vec<usize> = (0..steps.len())
            .filter(|index| !ctx.completed_before.contains(&steps[*index].step_id))
            .collect();
        let mut cancelled = false;
        let mut join_set: JoinSet<Result<(usize, StepOutcome, Option<Uuid>), OrchestrationError>> =
            JoinSet::new();

        loop {
            if !cancelled && self.shutdown_token.is_cancelled() {
                cancelled = true;
            }

            if !cancelled {
                // A skip can unblock another pending step, so scan until a
                // pass makes no progress.
                let mut progressed = true;
                while progressed {
                    progressed = false;
                    let mut index = 0;
                    while index < pending.len() {
                        let step_index = pending[index];
                        let step = &steps[step_index];
                        let ready = step
                            .depends_on
                            .iter()
                            .all(|dep| satisfied.contains(dep) || failed_path.contains(dep));
                        if !ready {
                            index += 1;
                            continue;
                        }
                        pending.remove(index);
                        progressed = true;

                        if step.depends_on.iter().any(|dep| failed_path.contains(dep)) {
                            failed_path.insert(step.step_id.clone());
                            self.record_skip(
                                ctx.workflow_id,
                                &step.step_id,
                                SkipReason::DependencyFailed,
                                &mut outcomes,
                            );
                            continue;
                        }
                        if !step.enabled {
                            satisfied.insert(step.step_id.clone());
                            self.record_skip(
                                ctx.workflow_id,
                                &step.step_id,
                                SkipReason::Disabled,
                                &mut outcomes,
                            );
                            continue;
                        }
                        let condition = step.condition.as_deref().unwrap_or(DEFAULT_CONDITION);
                        if !self.conditions.evaluate(condition, step, &outcomes)? {
                            satisfied.insert(step.step_id.clone());
                            self.record_skip(
                                ctx.workflow_id,
                                &step.step_id,
                                SkipReason::ConditionFalse,
                                &mut outcomes,
                            );
                            continue;
                        }

                        let dependency_thunks: Vec<Uuid> = step
                            .depends_on
                            .iter()
                            .filter_map(|dep| thunk_ids.get(dep).copied())
                            .collect();
                        let executor = Arc::clone(&self.executor);
                        let emitter = Arc::clone(&self.emitter);
                        let event_bus = self.event_bus.clone();
                        let permits = Arc::clone(&permits);
                        let step = step.clone();
                        let rules = ctx.rules.clone();
                        let workflow_id = ctx.workflow_id;
                        let default_timeout_ms = ctx.default_timeout_ms;

                        join_set.spawn(async move {
                            let _permit = permits.acquire_owned().await.map_err(|err| {
                                OrchestrationError::OperationFailed(format!(
                                    "step permit unavailable: {err}"
                                ))
                            })?;
                            let (outcome, _decision, last_thunk) = Self::execute_step_attempts(
                                executor,
                                emitter,
                                event_bus,
                                workflow_id,
                                step,
                                dependency_thunks,
                                rules,
                                default_timeout_ms,
                            )
                            .await?;
                            Ok((step_index, outcome, last_thunk))
                        });
                    }
                }
            }

            if join_set.is_empty() {
                break;
            }

            match join_set.join_next().await {
                Some(Ok(Ok((step_index, outcome, last_thunk)))) => {
                    let step_id = steps[step_index].step_id.clone();
                    if let Some(thunk_id) = last_thunk {
                        thunk_ids.insert(step_id.clone(), thunk_id);
                    }
                    if outcome.is_completed() {
                        self.states.record_step_completed(ctx.workflow_id, &step_id);
                        satisfied.insert(step_id);
                        outcomes.push(outcome);
                    } else {
                        // Halt and Continue act the same here: the failed
                        // path is pruned while independent paths keep
                        // running.
                        self.record_failure(ctx.workflow_id, &outcome);
                        failed_path.insert(step_id.clone());
                        outcomes.push(outcome);

                        let doomed = transitive_dependents(&step_id, steps);
                        let mut index = 0;
                        while index < pending.len() {
                            let candidate = &steps[pending[index]];
                            if doomed.contains(&candidate.step_id) {
                                pending.remove(index);
                                failed_path.insert(candidate.step_id.clone());
                                self.record_skip(
                                    ctx.workflow_id,
                                    &candidate.step_id,
                                    SkipReason::DependencyFailed,
                                    &mut outcomes,
                                );
                            } else {
                                index += 1;
                            }
                        }
                    }
                }
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => {
                    return Err(OrchestrationError::OperationFailed(format!(
                        "task join error: {join_err}"
                    )));
                }
                None => break,
            }
        }

        Ok(RunOutcome {
            outcomes: outcomes.split_off(prior),
            cancelled,
        })
    }

    /// Depth-partitioned batches over the fixed worker pool. Each worker
    /// drains its assignment sequentially; a batch completes only when all
    /// its members finish.
    async fn run_batch(
        &self,
        ctx: &RunContext,
        steps: &[Step],
    ) -> Result<RunOutcome, OrchestrationError> {
        let batches = partition_batches(steps)?;
        let by_id: HashMap<&str, &Step> =
            steps.iter().map(|step| (step.step_id.as_str(), step)).collect();

        let mut outcomes = ctx.resumed_outcomes(steps);
        let prior = outcomes.len();
        let mut thunk_ids: HashMap<String, Uuid> = HashMap::new();
        let mut failed_path: HashSet<String> = HashSet::new();
        let mut cancelled = false;

        for (batch_index, batch) in batches.iter().enumerate() {
            if self.shutdown_token.is_cancelled() {
                cancelled = true;
                break;
            }
            tracing::debug!(
                workflow_id = %ctx.workflow_id,
                batch = batch_index,
                steps = batch.len(),
                "dispatching batch"
            );

            let mut assignments: Vec<Vec<(Step, Vec<Uuid>)>> =
                (0..self.router.worker_count()).map(|_| Vec::new()).collect();
            for step_id in batch {
                let Some(step) = by_id.get(step_id.as_str()).copied() else {
                    continue;
                };
                if ctx.completed_before.contains(&step.step_id) {
                    tracing::debug!(
                        workflow_id = %ctx.workflow_id,
                        step_id = step.step_id.as_str(),
                        "step already completed in restored state; not re-executing"
                    );
                    continue;
                }
                if step.depends_on.iter().any(|dep| failed_path.contains(dep)) {
                    failed_path.insert(step.step_id.clone());
                    self.record_skip(
                        ctx.workflow_id,
                        &step.step_id,
                        SkipReason::DependencyFailed,
                        &mut outcomes,
                    );
                    continue;
                }
                if !step.enabled {
                    self.record_skip(
                        ctx.workflow_id,
                        &step.step_id,
                        SkipReason::Disabled,
                        &mut outcomes,
                    );
                    continue;
                }
                let condition = step.condition.as_deref().unwrap_or(DEFAULT_CONDITION);
                if !self.conditions.evaluate(condition, step, &outcomes)? {
                    self.record_skip(
                        ctx.workflow_id,
                        &step.step_id,
                        SkipReason::ConditionFalse,
                        &mut outcomes,
                    );
                    continue;
                }

                let dependency_thunks: Vec<Uuid> = step
                    .depends_on
                    .iter()
                    .filter_map(|dep| thunk_ids.get(dep).copied())
                    .collect();
                let worker = self.router.assign();
                assignments[worker].push((step.clone(), dependency_thunks));
            }

            let mut join_set: JoinSet<
                Result<Vec<(String, StepOutcome, Option<Uuid>)>, OrchestrationError>,
            > = JoinSet::new();
            for (worker, jobs) in assignments.into_iter().enumerate() {
                if jobs.is_empty() {
                    continue;
                }
                let executor = Arc::clone(&self.executor);
                let emitter = Arc::clone(&self.emitter);
                let event_bus = self.event_bus.clone();
                let router = Arc::clone(&self.router);
                let rules = ctx.rules.clone();
                let workflow_id = ctx.workflow_id;
                let default_timeout_ms = ctx.default_timeout_ms;

                join_set.spawn(async move {
                    let mut finished = Vec::with_capacity(jobs.len());
                    for (step, dependency_thunks) in jobs {
                        let step_id = step.step_id.clone();
                        let result = Self::execute_step_attempts(
                            Arc::clone(&executor),
                            Arc::clone(&emitter),
                            event_bus.clone(),
                            workflow_id,
                            step,
                            dependency_thunks,
                            rules.clone(),
                            default_timeout_ms,
                        )
                        .await;
                        router.release(worker);
                        let (outcome, _decision, last_thunk) = result?;
                        finished.push((step_id, outcome, last_thunk));
                    }
                    Ok(finished)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let finished = match joined {
                    Ok(Ok(finished)) => finished,
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => {
                        return Err(OrchestrationError::OperationFailed(format!(
                            "task join error: {join_err}"
                        )));
                    }
                };
                for (step_id, outcome, last_thunk) in finished {
                    if let Some(thunk_id) = last_thunk {
                        thunk_ids.insert(step_id.clone(), thunk_id);
                    }
                    if outcome.is_completed() {
                        self.states.record_step_completed(ctx.workflow_id, &step_id);
                    } else {
                        self.record_failure(ctx.workflow_id, &outcome);
                        failed_path.insert(step_id.clone());
                    }
                    outcomes.push(outcome);
                }
            }
        }

        Ok(RunOutcome {
            outcomes: outcomes.split_off(prior),
            cancelled,
        })
    }

    // -----------------------------------------------------------------------
    // Per-step execution
    // -----------------------------------------------------------------------

    /// Run one step to a terminal outcome: emit a thunk per attempt,
    /// dispatch under the step timeout, and consult the recovery policy on
    /// failure. Returns the outcome, the final (non-Retry) decision, and
    /// the id of the last emitted thunk.
    #[allow(clippy::too_many_arguments)]
    async fn execute_step_attempts(
        executor: Arc<E>,
        emitter: Arc<ThunkEmitter>,
        event_bus: EventBus,
        workflow_id: Uuid,
        step: Step,
        dependency_thunks: Vec<Uuid>,
        rules: CoordinationRules,
        default_timeout_ms: u64,
    ) -> Result<(StepOutcome, RecoveryDecision, Option<Uuid>), OrchestrationError> {
        let timeout_ms = step.timeout_ms.unwrap_or(default_timeout_ms);
        let step_timeout = Duration::from_millis(timeout_ms);
        let priority = if step.step_type == StepType::Orchestrate {
            ThunkPriority::High
        } else {
            ThunkPriority::Normal
        };

        event_bus.publish(EngineEvent::StepStarted {
            workflow_id,
            step_id: step.step_id.clone(),
            step_name: step.step_name.clone(),
            step_type: step.step_type.as_str().to_string(),
        });

        let started = std::time::Instant::now();
        let mut last_thunk = None;
        let mut attempt: u32 = 1;

        loop {
            let thunk = emitter.emit(
                workflow_id,
                EmitRequest {
                    thunk_type: "execute_step".to_string(),
                    target_node_type: step.step_type.target_node_type().to_string(),
                    operation_data: json!({
                        "step_id": step.step_id,
                        "step_name": step.step_name,
                        "payload": step.payload,
                    }),
                    dependencies: dependency_thunks.clone(),
                    priority,
                    timeout_ms,
                    retry_count: attempt - 1,
                },
            )?;
            last_thunk = Some(thunk.thunk_id);

            let dispatched = tokio::time::timeout(step_timeout, executor.execute(&thunk)).await;
            let failure = match dispatched {
                Ok(Ok(output)) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    event_bus.publish(EngineEvent::StepCompleted {
                        workflow_id,
                        step_id: step.step_id.clone(),
                        step_name: step.step_name.clone(),
                        duration_ms,
                    });
                    return Ok((
                        StepOutcome::completed(&step.step_id, output, duration_ms, attempt),
                        RecoveryDecision::Continue,
                        last_thunk,
                    ));
                }
                Ok(Err(err)) => err,
                Err(_elapsed) => DispatchError::recoverable(format!(
                    "step '{}' timed out after {timeout_ms}ms",
                    step.step_id
                )),
            };

            let decision = RecoveryPolicy::decide(&rules, failure.severity, attempt);
            event_bus.publish(EngineEvent::StepFailed {
                workflow_id,
                step_id: step.step_id.clone(),
                step_name: step.step_name.clone(),
                error: failure.message.clone(),
                will_retry: decision.will_retry(),
            });

            if decision.will_retry() {
                tracing::debug!(
                    workflow_id = %workflow_id,
                    step_id = step.step_id.as_str(),
                    attempt,
                    "retrying failed step"
                );
                attempt += 1;
                continue;
            }

            let duration_ms = started.elapsed().as_millis() as u64;
            tracing::warn!(
                workflow_id = %workflow_id,
                step_id = step.step_id.as_str(),
                attempts = attempt,
                error = failure.message.as_str(),
                "step failed"
            );
            return Ok((
                StepOutcome::failed(&step.step_id, failure.message, duration_ms, attempt),
                decision,
                last_thunk,
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Bookkeeping helpers
    // -----------------------------------------------------------------------

    fn record_skip(
        &self,
        workflow_id: Uuid,
        step_id: &str,
        reason: SkipReason,
        outcomes: &mut Vec<StepOutcome>,
    ) {
        tracing::debug!(
            workflow_id = %workflow_id,
            step_id = step_id,
            reason = ?reason,
            "skipping step"
        );
        self.states.record_step_skipped(workflow_id);
        self.event_bus.publish(EngineEvent::StepSkipped {
            workflow_id,
            step_id: step_id.to_string(),
            reason,
        });
        outcomes.push(StepOutcome::skipped(step_id, reason));
    }

    fn record_failure(&self, workflow_id: Uuid, outcome: &StepOutcome) {
        self.states.record_step_failed(workflow_id, &outcome.step_id);
        if let Some(error) = &outcome.error {
            self.states.set_context_value(workflow_id, "last_error", json!(error));
        }
    }

    fn finish_failed(
        &self,
        workflow_id: Uuid,
        mode: ExecutionMode,
        run_start: std::time::Instant,
        error: &str,
    ) {
        self.states.set_status(workflow_id, WorkflowStatus::Failed);
        self.states.set_context_value(
            workflow_id,
            "execution_status",
            json!(WorkflowStatus::Failed.as_str()),
        );
        self.states.set_context_value(workflow_id, "last_error", json!(error));
        self.metrics.record(mode, false, run_start.elapsed().as_millis() as u64);
        self.event_bus.publish(EngineEvent::WorkflowFailed {
            workflow_id,
            error: error.to_string(),
        });
        tracing::warn!(workflow_id = %workflow_id, error = error, "workflow execution failed");
    }

    // -----------------------------------------------------------------------
    // Validation and ordering passthroughs
    // -----------------------------------------------------------------------

    /// Collect every problem with a submission as human-readable strings:
    /// duplicate ids, unknown dependencies, cycles, empty submissions, and
    /// references to unregistered conditions. Empty on success.
    pub fn validate_workflow_steps(&self, steps: &[Step]) -> Vec<String> {
        let mut problems = validate_steps(steps);
        for step in steps {
            if let Some(condition) = &step.condition {
                if !self.conditions.contains(condition) {
                    problems.push(format!(
                        "unknown condition '{condition}' referenced by step '{}'",
                        step.step_id
                    ));
                }
            }
        }
        problems
    }

    /// The stable topological order `process` would execute these steps in.
    pub fn get_execution_order_for_steps(
        &self,
        steps: &[Step],
    ) -> Result<Vec<String>, OrchestrationError> {
        resolve_execution_order(steps).map_err(OrchestrationError::from)
    }

    // -----------------------------------------------------------------------
    // Snapshot passthroughs
    // -----------------------------------------------------------------------

    /// Snapshot the most recently processed workflow's state. `None` before
    /// any run.
    pub async fn snapshot_workflow_state(&self, deep_copy: bool) -> Option<WorkflowStateSnapshot> {
        let workflow_id = (*self.last_workflow.read().await)?;
        self.states.snapshot(workflow_id, deep_copy)
    }

    /// Replace a workflow's tracked state from a snapshot, subject to the
    /// snapshot invariant checks.
    pub fn restore_workflow_state(
        &self,
        snapshot: WorkflowStateSnapshot,
    ) -> Result<(), OrchestrationError> {
        self.states.restore(snapshot).map_err(OrchestrationError::from)
    }

    /// JSON export of the most recently processed workflow's state.
    pub async fn get_workflow_snapshot(&self, deep_copy: bool) -> Option<serde_json::Value> {
        let workflow_id = (*self.last_workflow.read().await)?;
        self.states.export(workflow_id, deep_copy)
    }

    /// Tracked state for a specific workflow.
    pub fn workflow_state(&self, workflow_id: Uuid) -> Option<WorkflowState> {
        self.states.get(workflow_id)
    }

    // -----------------------------------------------------------------------
    // Conditions, metrics, introspection
    // -----------------------------------------------------------------------

    /// Register a named condition function for use in step `condition`
    /// fields. Duplicate names (built-ins included) are rejected.
    pub fn register_condition_function(
        &self,
        name: &str,
        condition: ConditionFn,
    ) -> Result<(), OrchestrationError> {
        self.conditions.register(name, condition).map_err(OrchestrationError::from)
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.router.metrics())
    }

    /// Engine self-description: version, active and tracked workflow
    /// counts, thunk totals, registered conditions, metrics (router stats
    /// nested inside), and the shutdown flag.
    pub fn get_introspection_data(&self) -> serde_json::Value {
        let mut active: Vec<String> =
            self.active.iter().map(|entry| entry.key().to_string()).collect();
        active.sort();
        json!({
            "engine_version": env!("CARGO_PKG_VERSION"),
            "active_workflows": active,
            "tracked_workflows": self.states.tracked_count(),
            "thunks_emitted": self.emitter.total_emitted(),
            "conditions": self.conditions.names(),
            "metrics": serde_json::to_value(self.get_metrics()).unwrap_or(serde_json::Value::Null),
            "shutdown_requested": self.is_shutdown_requested(),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle support
    // -----------------------------------------------------------------------

    /// Flip the shutdown flag and cancel the scheduling token. Subsequent
    /// `process` calls are refused; running drivers stop dispatching new
    /// steps and let in-flight dispatches finish.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_token.cancel();
        tracing::info!("shutdown requested; refusing new workflow submissions");
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Workflows currently inside `process`.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_workflow_ids(&self) -> Vec<Uuid> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    pub fn tracked_workflow_count(&self) -> usize {
        self.states.tracked_count()
    }

    pub fn total_thunks_emitted(&self) -> usize {
        self.emitter.total_emitted()
    }

    /// Mark every non-terminal tracked workflow Cancelled. Engine shutdown
    /// only.
    pub fn cancel_tracked_workflows(&self) -> usize {
        self.states.mark_all_cancelled()
    }

    /// Drop the active-workflow and emitted-thunk registries. Engine
    /// shutdown only.
    pub fn clear_registries(&self) {
        self.active.clear();
        self.emitter.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
