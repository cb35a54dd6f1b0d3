//! The run state machine and control API.
//!
//! Many runs interleave freely; each run is internally sequential. A
//! per-run mutex serializes every write for a run id, and a per-definition
//! mutex makes the idempotency and overlap checks at `start()` atomic with
//! respect to concurrent starts. Suspensions (wait, human task, subprocess)
//! are persisted as a [`WaitState`] plus a re-armable timer or callback --
//! never an in-memory coroutine -- so `recover()` can rehydrate every
//! in-flight run from the store after a restart.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use oxflow_types::error::RepositoryError;
use oxflow_types::process::{
    HumanTask, ParallelFailurePolicy, ProcessRun, RunStatus, TaskStatus, WaitState,
};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{ContextError, RunContext};
use super::events::{EventSink, LifecycleEvent, NoopSink};
use super::executor::{Invocation, StepExecutor, StepOutcome};
use super::handlers::{ChannelTransport, HandlerRegistry, NoopTransport};
use super::registry::{
    CompiledAction, CompiledProcess, CompiledStep, Definition, DefinitionError,
    DefinitionRegistry, StepTarget,
};
use super::scheduler::Scheduler;
use super::tasks::TaskManager;
use crate::repository::process::{ProcessRepository, RunFilter};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Control-API and engine-internal failures. Step-level failures never show
/// up here -- they become run-state transitions.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("unknown definition {0:?}")]
    UnknownDefinition(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("task {task_id} is {status:?}, expected an open task")]
    TaskClosed { task_id: Uuid, status: TaskStatus },

    #[error("task {task_id} has no outcome {outcome:?}")]
    UnknownOutcome { task_id: Uuid, outcome: String },

    #[error("missing required input {0:?}")]
    MissingInput(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// How one advancement iteration left the run.
enum Advance {
    /// Another step is ready; keep driving.
    Continue,
    /// Suspended (waiting) or handed off; the resume path owns the run now.
    Parked,
    /// Terminal.
    Done,
}

// ---------------------------------------------------------------------------
// ProcessEngine
// ---------------------------------------------------------------------------

/// Public handle to the engine. Cheap to clone; all clones share state.
pub struct ProcessEngine<R: ProcessRepository> {
    inner: Arc<EngineInner<R>>,
}

impl<R: ProcessRepository> Clone for ProcessEngine<R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<R: ProcessRepository> ProcessEngine<R> {
    /// Engine with no-op transport and event sink.
    pub fn new(repo: R) -> Self {
        Self::with_collaborators(repo, Arc::new(NoopTransport), Arc::new(NoopSink))
    }

    /// Engine wired to a real channel transport and event sink.
    pub fn with_collaborators(
        repo: R,
        transport: Arc<dyn ChannelTransport>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let handlers = HandlerRegistry::new();
        let executor = StepExecutor::new(repo.clone(), handlers, transport);
        Self {
            inner: Arc::new(EngineInner {
                repo,
                registry: DefinitionRegistry::new(),
                executor,
                events,
                run_locks: DashMap::new(),
                start_locks: DashMap::new(),
                cancel_tokens: DashMap::new(),
                queues: DashMap::new(),
                parents: DashMap::new(),
            }),
        }
    }

    /// Service handler registry; register handlers before starting runs.
    pub fn handlers(&self) -> &HandlerRegistry {
        self.inner.executor.handlers()
    }

    /// Register (or replace) a process or schedule definition.
    pub fn register(&self, definition: impl Into<Definition>) -> Result<(), DefinitionError> {
        self.inner.registry.register(definition.into())
    }

    /// Start a run. With an idempotency key, a repeated call returns the
    /// existing run id without starting anything; otherwise the
    /// definition's overlap policy decides what happens while another run
    /// is active.
    pub async fn start(
        &self,
        definition: &str,
        inputs: Map<String, Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Uuid, EngineError> {
        let (run_id, spawn) = self
            .inner
            .prepare_start(definition, inputs, idempotency_key)
            .await?;
        if let Some(process) = spawn {
            self.inner.spawn_run(run_id, &process);
        }
        Ok(run_id)
    }

    /// Deliver an external signal to a run parked on a matching signal
    /// wait. A warning no-op if nothing is waiting on that signal.
    pub async fn signal(
        &self,
        run_id: Uuid,
        signal: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.inner.signal(run_id, signal, payload).await
    }

    /// Cancel a run: abort in-flight work at the next check, run pending
    /// compensations, and mark the run CANCELLED before returning.
    pub async fn cancel(&self, run_id: Uuid, reason: &str) -> Result<(), EngineError> {
        self.inner.cancel_run(run_id, reason).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<ProcessRun, EngineError> {
        self.inner
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<ProcessRun>, EngineError> {
        Ok(self.inner.repo.list_runs(filter).await?)
    }

    /// Rehydrate in-flight runs from the store after a restart. Returns the
    /// number of runs picked up.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        self.inner.recover().await
    }

    /// Human-task manager sharing this engine's state.
    pub fn task_manager(&self) -> TaskManager<R> {
        TaskManager::new(self.inner.clone())
    }

    /// Schedule poller sharing this engine's state.
    pub fn scheduler(&self, poll_interval: Duration) -> Scheduler<R> {
        Scheduler::new(self.inner.clone(), poll_interval)
    }
}

// ---------------------------------------------------------------------------
// EngineInner
// ---------------------------------------------------------------------------

/// Link from a child run back to the parent step waiting on it.
#[derive(Debug, Clone)]
struct ParentLink {
    run_id: Uuid,
    step: String,
}

pub(crate) struct EngineInner<R: ProcessRepository> {
    pub(crate) repo: R,
    pub(crate) registry: DefinitionRegistry,
    pub(crate) executor: StepExecutor<R>,
    events: Arc<dyn EventSink>,

    /// Serializes all writes for one run id.
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Makes idempotency + overlap checks atomic per definition.
    start_locks: DashMap<String, Arc<Mutex<()>>>,
    cancel_tokens: DashMap<Uuid, CancellationToken>,
    /// QUEUE overlap policy: pending run ids per definition, FIFO.
    queues: DashMap<String, VecDeque<Uuid>>,
    /// child run id -> suspended parent.
    parents: DashMap<Uuid, ParentLink>,
}

impl<R: ProcessRepository> EngineInner<R> {
    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.run_locks.entry(run_id).or_default().clone()
    }

    fn start_lock(&self, definition: &str) -> Arc<Mutex<()>> {
        self.start_locks
            .entry(definition.to_string())
            .or_default()
            .clone()
    }

    fn cancel_token(&self, run_id: Uuid) -> CancellationToken {
        self.cancel_tokens.entry(run_id).or_default().clone()
    }

    async fn emit_event(&self, name: Option<&str>, run: &ProcessRun) {
        if let Some(name) = name {
            self.events
                .emit(LifecycleEvent {
                    name: name.to_string(),
                    run_id: run.id,
                    definition: run.definition.clone(),
                    timestamp: Utc::now(),
                })
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create the run row (or dedup / queue it). Returns the run id and,
    /// when the caller should drive the run, the compiled definition.
    pub(crate) async fn prepare_start(
        self: &Arc<Self>,
        definition: &str,
        inputs: Map<String, Value>,
        idempotency_key: Option<&str>,
    ) -> Result<(Uuid, Option<Arc<CompiledProcess>>), EngineError> {
        let process = self
            .registry
            .get(definition)
            .ok_or_else(|| EngineError::UnknownDefinition(definition.to_string()))?;

        for required in &process.required_inputs {
            if !inputs.contains_key(required) {
                return Err(EngineError::MissingInput(required.clone()));
            }
        }

        let start_lock = self.start_lock(definition);
        let _guard = start_lock.lock().await;

        // Dedup before anything else: a repeated start with the same key
        // maps to the one existing run, whatever its state.
        if let Some(key) = idempotency_key
            && let Some(existing) = self.repo.find_run_by_idempotency_key(definition, key).await?
        {
            tracing::info!(
                definition,
                idempotency_key = key,
                run_id = %existing.id,
                "idempotent start deduplicated"
            );
            return Ok((existing.id, None));
        }

        let active = self.repo.list_active_runs(definition).await?;
        let mut queued = false;
        match process.overlap_policy {
            oxflow_types::process::OverlapPolicy::Allow => {}
            oxflow_types::process::OverlapPolicy::Skip => {
                if let Some(existing) = active.first() {
                    tracing::info!(definition, run_id = %existing.id, "overlap skip");
                    return Ok((existing.id, None));
                }
            }
            oxflow_types::process::OverlapPolicy::CancelPrevious => {
                for run in &active {
                    self.cancel_run(run.id, "superseded by new run").await?;
                }
            }
            oxflow_types::process::OverlapPolicy::Queue => {
                queued = !active.is_empty();
            }
        }

        let context = RunContext::new(inputs);
        let run = ProcessRun {
            id: Uuid::now_v7(),
            definition: definition.to_string(),
            status: RunStatus::Pending,
            current_step: process.first_step.clone(),
            completed_steps: vec![],
            idempotency_key: idempotency_key.map(Into::into),
            wait_state: None,
            context: context.snapshot(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        };

        match self.repo.create_run(&run).await {
            Ok(()) => {}
            // Lost a cross-instance race on the unique key; the winner's
            // run is the answer.
            Err(RepositoryError::Conflict(_)) if idempotency_key.is_some() => {
                let key = idempotency_key.unwrap_or_default();
                if let Some(existing) =
                    self.repo.find_run_by_idempotency_key(definition, key).await?
                {
                    return Ok((existing.id, None));
                }
                return Err(EngineError::Repository(RepositoryError::Conflict(
                    key.to_string(),
                )));
            }
            Err(error) => return Err(error.into()),
        }

        if queued {
            tracing::info!(definition, run_id = %run.id, "run queued behind active run");
            self.queues
                .entry(definition.to_string())
                .or_default()
                .push_back(run.id);
            return Ok((run.id, None));
        }

        Ok((run.id, Some(process)))
    }

    /// Spawn the drive loop (and process-timeout watchdog) for a run.
    pub(crate) fn spawn_run(self: &Arc<Self>, run_id: Uuid, process: &Arc<CompiledProcess>) {
        let token = self.cancel_token(run_id);

        if let Some(timeout_secs) = process.timeout_secs {
            let inner = self.clone();
            let watchdog_token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = watchdog_token.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                        if let Err(error) = inner.cancel_run(run_id, "process timeout").await {
                            tracing::warn!(run_id = %run_id, %error, "timeout cancel failed");
                        }
                    }
                }
            });
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.drive(run_id).await });
    }

    // -----------------------------------------------------------------------
    // Drive loop
    // -----------------------------------------------------------------------

    // Boxed: drive and resume_parent re-enter each other through spawned
    // tasks, so their future types are mutually recursive.
    fn drive(self: Arc<Self>, run_id: Uuid) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            loop {
                match self.advance_one(run_id).await {
                    Ok(Advance::Continue) => {}
                    Ok(Advance::Parked) | Ok(Advance::Done) => return,
                    Err(error) => {
                        tracing::error!(run_id = %run_id, %error, "run advancement failed");
                        self.fail_run_internal(run_id, &error.to_string()).await;
                        return;
                    }
                }
            }
        })
    }

    /// Advance one step under the run lock.
    async fn advance_one(self: &Arc<Self>, run_id: Uuid) -> Result<Advance, EngineError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let token = self.cancel_token(run_id);
        if token.is_cancelled() {
            // cancel_run() owns finalization.
            return Ok(Advance::Parked);
        }

        let Some(mut run) = self.repo.get_run(&run_id).await? else {
            return Ok(Advance::Done);
        };
        if run.status.is_terminal() {
            return Ok(Advance::Done);
        }
        let process = self
            .registry
            .get(&run.definition)
            .ok_or_else(|| EngineError::UnknownDefinition(run.definition.clone()))?;

        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            self.repo.update_run(&run).await?;
            self.emit_event(process.events.on_start.as_deref(), &run).await;
            tracing::info!(run_id = %run_id, definition = %run.definition, "run started");
        }

        let Some(step_name) = run.current_step.clone() else {
            self.finalize_completed(&mut run, &process).await?;
            return Ok(Advance::Done);
        };
        let Some(step) = process.steps.get(&step_name).cloned() else {
            // Malformed persisted record; fail this run without touching
            // any other run's state.
            self.finalize_abnormal(
                &mut run,
                &process,
                RunStatus::Failed,
                &format!("unknown step {step_name:?}"),
            )
            .await?;
            return Ok(Advance::Done);
        };
        let mut ctx = RunContext::from_snapshot(&run.context)?;

        match &step.action {
            CompiledAction::Condition { condition, on_true, on_false } => {
                let taken = ctx.evaluate_condition(condition);
                tracing::debug!(run_id = %run_id, step = %step.name, taken, "condition evaluated");
                ctx.record_step_output(&step.name, json!({ "result": taken }));
                let target = if taken { on_true.clone() } else { on_false.clone() };
                self.complete_step(&mut run, &process, &step, &mut ctx, None, target)
                    .await
            }

            CompiledAction::WaitDuration { duration_secs } => {
                let resume_at = Utc::now() + chrono::Duration::seconds(*duration_secs as i64);
                run.status = RunStatus::Waiting;
                run.wait_state = Some(WaitState::Timer { resume_at });
                self.repo.update_run(&run).await?;
                tracing::debug!(run_id = %run_id, step = %step.name, duration_secs, "run waiting on timer");
                self.spawn_timer(run_id, resume_at);
                Ok(Advance::Parked)
            }

            CompiledAction::WaitSignal { signal } => {
                let deadline = step
                    .timeout_secs
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));
                run.status = RunStatus::Waiting;
                run.wait_state = Some(WaitState::Signal {
                    signal: signal.clone(),
                    deadline,
                });
                self.repo.update_run(&run).await?;
                tracing::debug!(run_id = %run_id, step = %step.name, signal, "run waiting on signal");
                if let Some(deadline) = deadline {
                    self.spawn_signal_expiry(run_id, signal.clone(), deadline);
                }
                Ok(Advance::Parked)
            }

            CompiledAction::HumanTask(task_def) => {
                let now = Utc::now();
                let assignee = task_def
                    .assignee
                    .as_ref()
                    .map(|expr| ctx.resolve_value(expr))
                    .and_then(|v| match v {
                        Value::String(s) if !s.is_empty() => Some(s),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    });
                let task = HumanTask {
                    id: Uuid::now_v7(),
                    run_id,
                    step_name: step.name.clone(),
                    surface: task_def.surface.clone(),
                    status: if assignee.is_some() {
                        TaskStatus::Assigned
                    } else {
                        TaskStatus::Pending
                    },
                    assignee,
                    outcome: None,
                    deadline: task_def
                        .timeout_secs
                        .map(|secs| now + chrono::Duration::seconds(secs as i64)),
                    escalation_deadline: task_def
                        .escalation_timeout_secs
                        .map(|secs| now + chrono::Duration::seconds(secs as i64)),
                    escalated_at: None,
                    created_at: now,
                    completed_at: None,
                };
                self.repo.create_task(&task).await?;

                run.status = RunStatus::Waiting;
                run.wait_state = Some(WaitState::Task { task_id: task.id });
                self.repo.update_run(&run).await?;
                tracing::info!(run_id = %run_id, step = %step.name, task_id = %task.id, "human task created");
                Ok(Advance::Parked)
            }

            CompiledAction::Subprocess { process: child_def } => {
                let child_inputs = ctx.build_step_inputs(&step.inputs);
                match self.prepare_start(child_def, child_inputs, None).await {
                    Ok((child_id, spawn)) => {
                        self.parents.insert(
                            child_id,
                            ParentLink { run_id, step: step.name.clone() },
                        );
                        run.status = RunStatus::Waiting;
                        run.wait_state = Some(WaitState::Subprocess { child_run_id: child_id });
                        self.repo.update_run(&run).await?;
                        tracing::info!(run_id = %run_id, child_run_id = %child_id, "subprocess started");
                        if let Some(child_process) = spawn {
                            self.spawn_run(child_id, &child_process);
                        }
                        Ok(Advance::Parked)
                    }
                    Err(error) => {
                        self.fail_step(&mut run, &process, &step, &mut ctx, &error.to_string())
                            .await
                    }
                }
            }

            CompiledAction::Parallel { branches, failure_policy } => {
                match self
                    .run_parallel(run_id, &process, branches, *failure_policy, &ctx, &token)
                    .await
                {
                    ParallelResult::Success(outputs) => {
                        let mut combined = Map::new();
                        for (name, output) in outputs {
                            combined.insert(name.clone(), output.clone());
                            ctx.record_step_output(&name, output);
                        }
                        let target = step.success_target();
                        self.complete_step(
                            &mut run,
                            &process,
                            &step,
                            &mut ctx,
                            Some(Value::Object(combined)),
                            target,
                        )
                        .await
                    }
                    ParallelResult::Failure(error) => {
                        self.fail_step(&mut run, &process, &step, &mut ctx, &error).await
                    }
                    ParallelResult::Cancelled => Ok(Advance::Parked),
                }
            }

            CompiledAction::Service { service } => {
                let invocation = Invocation::Service {
                    service: service.clone(),
                    inputs: ctx.build_step_inputs(&step.inputs),
                };
                self.run_executable_step(&mut run, &process, &step, &mut ctx, invocation, &token)
                    .await
            }

            CompiledAction::Send { channel, message } => {
                let invocation = Invocation::Send {
                    channel: channel.clone(),
                    message: ctx.render(message),
                    payload: ctx.build_step_inputs(&step.inputs),
                };
                self.run_executable_step(&mut run, &process, &step, &mut ctx, invocation, &token)
                    .await
            }
        }
    }

    async fn run_executable_step(
        self: &Arc<Self>,
        run: &mut ProcessRun,
        process: &Arc<CompiledProcess>,
        step: &CompiledStep,
        ctx: &mut RunContext,
        invocation: Invocation,
        token: &CancellationToken,
    ) -> Result<Advance, EngineError> {
        match self.executor.execute(run.id, step, invocation, token).await {
            StepOutcome::Success(output) => {
                let target = step.success_target();
                self.complete_step(run, process, step, ctx, Some(output), target)
                    .await
            }
            StepOutcome::Failure(error) => self.fail_step(run, process, step, ctx, &error).await,
            StepOutcome::Cancelled => Ok(Advance::Parked),
        }
    }

    // -----------------------------------------------------------------------
    // Step transitions
    // -----------------------------------------------------------------------

    /// Record a success, resolve the next step, and persist. Caller holds
    /// the run lock.
    async fn complete_step(
        self: &Arc<Self>,
        run: &mut ProcessRun,
        process: &Arc<CompiledProcess>,
        step: &CompiledStep,
        ctx: &mut RunContext,
        output: Option<Value>,
        target: StepTarget,
    ) -> Result<Advance, EngineError> {
        if let Some(output) = output {
            ctx.record_step_output(&step.name, output);
        }
        run.completed_steps.push(step.name.clone());
        run.context = ctx.snapshot();
        run.wait_state = None;

        match target {
            StepTarget::Step(next) => {
                run.current_step = Some(next);
                run.status = RunStatus::Running;
                self.repo.update_run(run).await?;
                Ok(Advance::Continue)
            }
            StepTarget::Complete => {
                self.finalize_completed(run, process).await?;
                Ok(Advance::Done)
            }
            StepTarget::Fail => {
                self.finalize_abnormal(
                    run,
                    process,
                    RunStatus::Failed,
                    &format!("step {:?} routed to fail", step.name),
                )
                .await?;
                Ok(Advance::Done)
            }
        }
    }

    /// Route a step failure: `on_failure` if declared, otherwise the run
    /// fails and compensations fire. Caller holds the run lock.
    async fn fail_step(
        self: &Arc<Self>,
        run: &mut ProcessRun,
        process: &Arc<CompiledProcess>,
        step: &CompiledStep,
        ctx: &mut RunContext,
        error: &str,
    ) -> Result<Advance, EngineError> {
        tracing::warn!(run_id = %run.id, step = %step.name, error, "step failed");
        ctx.record_step_output(&step.name, json!({ "error": error }));
        run.context = ctx.snapshot();
        run.wait_state = None;

        match &step.on_failure {
            Some(StepTarget::Step(next)) => {
                run.current_step = Some(next.clone());
                run.status = RunStatus::Running;
                self.repo.update_run(run).await?;
                Ok(Advance::Continue)
            }
            Some(StepTarget::Complete) => {
                self.finalize_completed(run, process).await?;
                Ok(Advance::Done)
            }
            Some(StepTarget::Fail) | None => {
                self.finalize_abnormal(run, process, RunStatus::Failed, error)
                    .await?;
                Ok(Advance::Done)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    async fn finalize_completed(
        self: &Arc<Self>,
        run: &mut ProcessRun,
        process: &Arc<CompiledProcess>,
    ) -> Result<(), EngineError> {
        run.status = RunStatus::Completed;
        run.current_step = None;
        run.wait_state = None;
        run.ended_at = Some(Utc::now());
        self.repo.update_run(run).await?;
        tracing::info!(run_id = %run.id, definition = %run.definition, "run completed");

        self.emit_event(process.events.on_complete.as_deref(), run).await;
        self.after_terminal(run).await;
        Ok(())
    }

    /// Shared failure/cancellation path: compensations in reverse completed
    /// order, then the terminal status.
    async fn finalize_abnormal(
        self: &Arc<Self>,
        run: &mut ProcessRun,
        process: &Arc<CompiledProcess>,
        status: RunStatus,
        error: &str,
    ) -> Result<(), EngineError> {
        let mut final_error = error.to_string();
        let compensation_errors = self.run_compensations(run, process).await;
        for failure in compensation_errors {
            final_error.push_str("; ");
            final_error.push_str(&failure);
        }

        run.status = status;
        run.current_step = None;
        run.wait_state = None;
        run.ended_at = Some(Utc::now());
        run.error = Some(final_error);
        self.repo.update_run(run).await?;
        tracing::warn!(
            run_id = %run.id,
            definition = %run.definition,
            status = ?status,
            error = run.error.as_deref().unwrap_or_default(),
            "run ended abnormally"
        );

        if status == RunStatus::Failed {
            self.emit_event(process.events.on_failure.as_deref(), run).await;
        }
        self.after_terminal(run).await;
        Ok(())
    }

    /// Invoke compensations for completed steps, newest first. A failing
    /// compensation is recorded and the sweep continues; it never
    /// re-triggers compensation recursively.
    async fn run_compensations(
        self: &Arc<Self>,
        run: &ProcessRun,
        process: &Arc<CompiledProcess>,
    ) -> Vec<String> {
        let ctx = match RunContext::from_snapshot(&run.context) {
            Ok(ctx) => ctx,
            Err(error) => {
                return vec![format!("compensation skipped: {error}")];
            }
        };

        let mut failures = Vec::new();
        for step_name in run.completed_steps.iter().rev() {
            let Some(step) = process.steps.get(step_name) else {
                continue;
            };
            let Some(comp_name) = &step.compensate_with else {
                continue;
            };
            let Some(compensation) = process.compensations.get(comp_name) else {
                continue;
            };

            let inputs = ctx.build_step_inputs(&compensation.inputs);
            match self
                .executor
                .call_service_once(&compensation.service, inputs)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        run_id = %run.id,
                        step = %step_name,
                        compensation = %comp_name,
                        "compensation applied"
                    );
                }
                Err(error) => {
                    tracing::error!(
                        run_id = %run.id,
                        compensation = %comp_name,
                        error = %error,
                        "compensation failed"
                    );
                    failures.push(format!("compensation {comp_name:?} failed: {error}"));
                }
            }
        }
        failures
    }

    /// Post-terminal bookkeeping: drop per-run state, resume a waiting
    /// parent, release the next queued run.
    async fn after_terminal(self: &Arc<Self>, run: &ProcessRun) {
        self.cancel_tokens.remove(&run.id);
        self.run_locks.remove(&run.id);

        if let Some((_, link)) = self.parents.remove(&run.id) {
            let inner = self.clone();
            let child = run.clone();
            tokio::spawn(async move {
                if let Err(error) = inner.resume_parent(link, child).await {
                    tracing::error!(%error, "failed to resume parent run");
                }
            });
        }

        let next = self
            .queues
            .get_mut(&run.definition)
            .and_then(|mut queue| queue.pop_front());
        if let Some(next_id) = next {
            if let Some(process) = self.registry.get(&run.definition) {
                tracing::info!(run_id = %next_id, definition = %run.definition, "starting queued run");
                self.spawn_run(next_id, &process);
            }
        }
    }

    /// Last-resort failure path for engine-internal errors (malformed
    /// records, storage faults). Must not corrupt other runs' state.
    async fn fail_run_internal(self: &Arc<Self>, run_id: Uuid, error: &str) {
        let Ok(Some(mut run)) = self.repo.get_run(&run_id).await else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        run.status = RunStatus::Failed;
        run.ended_at = Some(Utc::now());
        run.error = Some(format!("internal error: {error}"));
        if let Err(update_error) = self.repo.update_run(&run).await {
            tracing::error!(run_id = %run_id, %update_error, "failed to persist internal failure");
        }
        self.after_terminal(&run).await;
    }

    // -----------------------------------------------------------------------
    // Parallel blocks
    // -----------------------------------------------------------------------

    async fn run_parallel(
        self: &Arc<Self>,
        run_id: Uuid,
        process: &Arc<CompiledProcess>,
        branches: &[CompiledStep],
        policy: ParallelFailurePolicy,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> ParallelResult {
        let block_token = token.child_token();
        let mut join_set: JoinSet<(usize, StepOutcome)> = JoinSet::new();

        for (index, branch) in branches.iter().enumerate() {
            let inner = self.clone();
            let branch = branch.clone();
            let branch_token = block_token.clone();
            let inputs = ctx.build_step_inputs(&branch.inputs);
            let message = match &branch.action {
                CompiledAction::Send { message, .. } => Some(ctx.render(message)),
                _ => None,
            };
            join_set.spawn(async move {
                let outcome =
                    inner.run_branch(run_id, &branch, inputs, message, &branch_token).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<StepOutcome>> = vec![None; branches.len()];
        let mut first_failure: Option<String> = None;
        while let Some(joined) = join_set.join_next().await {
            let Ok((index, outcome)) = joined else {
                first_failure.get_or_insert_with(|| "parallel branch panicked".to_string());
                block_token.cancel();
                continue;
            };
            if let StepOutcome::Failure(error) = &outcome {
                let named = format!("step {:?}: {error}", branches[index].name);
                if first_failure.is_none() {
                    first_failure = Some(named);
                    if policy == ParallelFailurePolicy::FailFast {
                        block_token.cancel();
                    }
                }
            }
            outcomes[index] = Some(outcome);
        }

        if token.is_cancelled() {
            return ParallelResult::Cancelled;
        }

        let Some(failure) = first_failure else {
            let outputs = branches
                .iter()
                .zip(outcomes)
                .map(|(branch, outcome)| match outcome {
                    Some(StepOutcome::Success(output)) => (branch.name.clone(), output),
                    _ => (branch.name.clone(), Value::Null),
                })
                .collect();
            return ParallelResult::Success(outputs);
        };

        if policy == ParallelFailurePolicy::Rollback {
            // Compensate the siblings that had already succeeded, newest
            // declaration order last.
            let mut rollback_ctx = ctx.clone();
            let succeeded: Vec<(&CompiledStep, Value)> = branches
                .iter()
                .zip(&outcomes)
                .filter_map(|(branch, outcome)| match outcome {
                    Some(StepOutcome::Success(output)) => Some((branch, output.clone())),
                    _ => None,
                })
                .collect();
            for (branch, output) in &succeeded {
                rollback_ctx.record_step_output(&branch.name, output.clone());
            }
            for (branch, _) in succeeded.iter().rev() {
                let Some(comp_name) = &branch.compensate_with else {
                    continue;
                };
                let Some(compensation) = process.compensations.get(comp_name) else {
                    continue;
                };
                let inputs = rollback_ctx.build_step_inputs(&compensation.inputs);
                if let Err(error) = self
                    .executor
                    .call_service_once(&compensation.service, inputs)
                    .await
                {
                    tracing::error!(
                        run_id = %run_id,
                        compensation = %comp_name,
                        %error,
                        "parallel rollback compensation failed"
                    );
                }
            }
        }

        ParallelResult::Failure(failure)
    }

    /// Execute one parallel branch. Branches are restricted at registration
    /// to service, send, and wait-duration kinds.
    async fn run_branch(
        self: &Arc<Self>,
        run_id: Uuid,
        branch: &CompiledStep,
        inputs: Map<String, Value>,
        rendered_message: Option<String>,
        token: &CancellationToken,
    ) -> StepOutcome {
        match &branch.action {
            CompiledAction::Service { service } => {
                self.executor
                    .execute(
                        run_id,
                        branch,
                        Invocation::Service { service: service.clone(), inputs },
                        token,
                    )
                    .await
            }
            CompiledAction::Send { channel, .. } => {
                self.executor
                    .execute(
                        run_id,
                        branch,
                        Invocation::Send {
                            channel: channel.clone(),
                            message: rendered_message.unwrap_or_default(),
                            payload: inputs,
                        },
                        token,
                    )
                    .await
            }
            CompiledAction::WaitDuration { duration_secs } => {
                tokio::select! {
                    _ = token.cancelled() => StepOutcome::Cancelled,
                    _ = tokio::time::sleep(Duration::from_secs(*duration_secs)) => {
                        StepOutcome::Success(Value::Null)
                    }
                }
            }
            _ => StepOutcome::Failure("unsupported parallel branch kind".into()),
        }
    }

    // -----------------------------------------------------------------------
    // Resume paths
    // -----------------------------------------------------------------------

    fn spawn_timer(self: &Arc<Self>, run_id: Uuid, resume_at: chrono::DateTime<Utc>) {
        let inner = self.clone();
        let token = self.cancel_token(run_id);
        tokio::spawn(async move {
            let remaining = (resume_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(remaining) => {
                    if let Err(error) = inner.resume_timer(run_id).await {
                        tracing::error!(run_id = %run_id, %error, "timer resume failed");
                    }
                }
            }
        });
    }

    async fn resume_timer(self: &Arc<Self>, run_id: Uuid) -> Result<(), EngineError> {
        let resume = {
            let lock = self.run_lock(run_id);
            let _guard = lock.lock().await;

            let Some(mut run) = self.repo.get_run(&run_id).await? else {
                return Ok(());
            };
            if run.status != RunStatus::Waiting
                || !matches!(run.wait_state, Some(WaitState::Timer { .. }))
            {
                return Ok(());
            }
            let process = self
                .registry
                .get(&run.definition)
                .ok_or_else(|| EngineError::UnknownDefinition(run.definition.clone()))?;
            let Some(step) = run
                .current_step
                .clone()
                .and_then(|name| process.steps.get(&name).cloned())
            else {
                return Ok(());
            };
            let mut ctx = RunContext::from_snapshot(&run.context)?;
            let target = step.success_target();
            self.complete_step(&mut run, &process, &step, &mut ctx, Some(Value::Null), target)
                .await?
        };

        if matches!(resume, Advance::Continue) {
            let inner = self.clone();
            tokio::spawn(async move { inner.drive(run_id).await });
        }
        Ok(())
    }

    fn spawn_signal_expiry(
        self: &Arc<Self>,
        run_id: Uuid,
        signal: String,
        deadline: chrono::DateTime<Utc>,
    ) {
        let inner = self.clone();
        let token = self.cancel_token(run_id);
        tokio::spawn(async move {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(remaining) => {
                    if let Err(error) = inner.expire_signal_wait(run_id, &signal).await {
                        tracing::error!(run_id = %run_id, %error, "signal-wait expiry failed");
                    }
                }
            }
        });
    }

    async fn expire_signal_wait(
        self: &Arc<Self>,
        run_id: Uuid,
        signal: &str,
    ) -> Result<(), EngineError> {
        let resume = {
            let lock = self.run_lock(run_id);
            let _guard = lock.lock().await;

            let Some(mut run) = self.repo.get_run(&run_id).await? else {
                return Ok(());
            };
            let still_waiting = matches!(
                (&run.status, &run.wait_state),
                (RunStatus::Waiting, Some(WaitState::Signal { signal: s, .. })) if s == signal
            );
            if !still_waiting {
                return Ok(());
            }
            let process = self
                .registry
                .get(&run.definition)
                .ok_or_else(|| EngineError::UnknownDefinition(run.definition.clone()))?;
            let Some(step) = run
                .current_step
                .clone()
                .and_then(|name| process.steps.get(&name).cloned())
            else {
                return Ok(());
            };
            let mut ctx = RunContext::from_snapshot(&run.context)?;
            self.fail_step(
                &mut run,
                &process,
                &step,
                &mut ctx,
                &format!("timed out waiting for signal {signal:?}"),
            )
            .await?
        };

        if matches!(resume, Advance::Continue) {
            let inner = self.clone();
            tokio::spawn(async move { inner.drive(run_id).await });
        }
        Ok(())
    }

    pub(crate) async fn signal(
        self: &Arc<Self>,
        run_id: Uuid,
        signal: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let resume = {
            let lock = self.run_lock(run_id);
            let _guard = lock.lock().await;

            let Some(mut run) = self.repo.get_run(&run_id).await? else {
                return Err(EngineError::RunNotFound(run_id));
            };
            let matching = matches!(
                (&run.status, &run.wait_state),
                (RunStatus::Waiting, Some(WaitState::Signal { signal: s, .. })) if s == signal
            );
            if !matching {
                tracing::warn!(
                    run_id = %run_id,
                    signal,
                    status = ?run.status,
                    "signal ignored: run is not waiting on it"
                );
                return Ok(());
            }

            let process = self
                .registry
                .get(&run.definition)
                .ok_or_else(|| EngineError::UnknownDefinition(run.definition.clone()))?;
            let Some(step) = run
                .current_step
                .clone()
                .and_then(|name| process.steps.get(&name).cloned())
            else {
                return Ok(());
            };
            let mut ctx = RunContext::from_snapshot(&run.context)?;
            tracing::info!(run_id = %run_id, signal, step = %step.name, "signal received");
            let target = step.success_target();
            self.complete_step(&mut run, &process, &step, &mut ctx, Some(payload), target)
                .await?
        };

        if matches!(resume, Advance::Continue) {
            let inner = self.clone();
            tokio::spawn(async move { inner.drive(run_id).await });
        }
        Ok(())
    }

    /// Resume a parent whose child run reached a terminal state. Boxed for
    /// the same recursion reason as `drive`.
    fn resume_parent(
        self: &Arc<Self>,
        link: ParentLink,
        child: ProcessRun,
    ) -> BoxFuture<'static, Result<(), EngineError>> {
        let inner = self.clone();
        Box::pin(async move {
            let resume = {
                let lock = inner.run_lock(link.run_id);
                let _guard = lock.lock().await;

                let Some(mut run) = inner.repo.get_run(&link.run_id).await? else {
                    return Ok(());
                };
                let matching = matches!(
                    (&run.status, &run.wait_state),
                    (RunStatus::Waiting, Some(WaitState::Subprocess { child_run_id })) if *child_run_id == child.id
                );
                if !matching {
                    return Ok(());
                }
                let process = inner
                    .registry
                    .get(&run.definition)
                    .ok_or_else(|| EngineError::UnknownDefinition(run.definition.clone()))?;
                let Some(step) = process.steps.get(&link.step).cloned() else {
                    return Ok(());
                };
                let mut ctx = RunContext::from_snapshot(&run.context)?;

                match child.status {
                    RunStatus::Completed => {
                        let output = inner.subprocess_output(&child)?;
                        let target = step.success_target();
                        inner
                            .complete_step(&mut run, &process, &step, &mut ctx, Some(output), target)
                            .await?
                    }
                    status => {
                        let reason = child.error.as_deref().unwrap_or("no error recorded");
                        inner
                            .fail_step(
                                &mut run,
                                &process,
                                &step,
                                &mut ctx,
                                &format!("subprocess {:?} {status:?}: {reason}", child.definition),
                            )
                            .await?
                    }
                }
            };

            if matches!(resume, Advance::Continue) {
                tokio::spawn(inner.clone().drive(link.run_id));
            }
            Ok(())
        })
    }

    /// A child's output: its declared output fields resolved from `vars`,
    /// or the output of its last completed step when none are declared.
    fn subprocess_output(&self, child: &ProcessRun) -> Result<Value, EngineError> {
        let ctx = RunContext::from_snapshot(&child.context)?;
        let Some(process) = self.registry.get(&child.definition) else {
            return Ok(Value::Null);
        };
        if !process.output_fields.is_empty() {
            let mut output = Map::new();
            for field in &process.output_fields {
                output.insert(
                    field.clone(),
                    ctx.variables().get(field).cloned().unwrap_or(Value::Null),
                );
            }
            return Ok(Value::Object(output));
        }
        Ok(child
            .completed_steps
            .last()
            .and_then(|name| ctx.step_output(name).cloned())
            .unwrap_or(Value::Null))
    }

    // -----------------------------------------------------------------------
    // Human tasks
    // -----------------------------------------------------------------------

    /// Complete an open task with the named outcome: apply its variable
    /// assignments, record the submitted fields as the step's output, and
    /// advance the run per the outcome's `goto`.
    pub(crate) async fn complete_task(
        self: &Arc<Self>,
        task_id: Uuid,
        outcome_name: &str,
        fields: Map<String, Value>,
    ) -> Result<(), EngineError> {
        let Some(mut task) = self.repo.get_task(&task_id).await? else {
            return Err(EngineError::TaskNotFound(task_id));
        };
        if !task.status.is_open() {
            return Err(EngineError::TaskClosed { task_id, status: task.status });
        }

        let resume = {
            let lock = self.run_lock(task.run_id);
            let _guard = lock.lock().await;

            let Some(mut run) = self.repo.get_run(&task.run_id).await? else {
                return Err(EngineError::RunNotFound(task.run_id));
            };
            let process = self
                .registry
                .get(&run.definition)
                .ok_or_else(|| EngineError::UnknownDefinition(run.definition.clone()))?;
            let Some(step) = process.steps.get(&task.step_name).cloned() else {
                tracing::warn!(task_id = %task_id, step = %task.step_name, "task step no longer defined");
                return Err(EngineError::TaskClosed { task_id, status: task.status });
            };
            let CompiledAction::HumanTask(task_def) = &step.action else {
                return Err(EngineError::TaskClosed { task_id, status: task.status });
            };
            let Some(outcome) = task_def.outcome(outcome_name) else {
                return Err(EngineError::UnknownOutcome {
                    task_id,
                    outcome: outcome_name.to_string(),
                });
            };

            task.status = TaskStatus::Completed;
            task.outcome = Some(outcome_name.to_string());
            task.completed_at = Some(Utc::now());
            self.repo.update_task(&task).await?;
            tracing::info!(
                run_id = %task.run_id,
                task_id = %task_id,
                outcome = outcome_name,
                "human task completed"
            );
            if let Some(confirmation) = &outcome.confirmation {
                tracing::info!(task_id = %task_id, confirmation, "task confirmation");
            }

            let matching = matches!(
                (&run.status, &run.wait_state),
                (RunStatus::Waiting, Some(WaitState::Task { task_id: t })) if *t == task.id
            );
            if !matching {
                tracing::warn!(
                    run_id = %task.run_id,
                    task_id = %task_id,
                    "run is not waiting on this task; outcome recorded without resuming"
                );
                return Ok(());
            }

            let mut ctx = RunContext::from_snapshot(&run.context)?;
            // Output first, so assignments can reference the submitted
            // fields through the step's name.
            let mut output = fields;
            output.insert("outcome".into(), json!(outcome_name));
            ctx.record_step_output(&step.name, Value::Object(output));
            for (field, value) in &outcome.assignments {
                let resolved = ctx.resolve_value(value);
                ctx.set_variable(field, resolved);
            }

            let target = outcome.goto.clone();
            self.complete_step(&mut run, &process, &step, &mut ctx, None, target)
                .await?
        };

        if matches!(resume, Advance::Continue) {
            let inner = self.clone();
            let run_id = task.run_id;
            tokio::spawn(async move { inner.drive(run_id).await });
        }
        Ok(())
    }

    /// Expire an overdue task and fail the waiting step.
    pub(crate) async fn expire_task(self: &Arc<Self>, task_id: Uuid) -> Result<(), EngineError> {
        let Some(mut task) = self.repo.get_task(&task_id).await? else {
            return Ok(());
        };
        if !task.status.is_open() {
            return Ok(());
        }

        let resume = {
            let lock = self.run_lock(task.run_id);
            let _guard = lock.lock().await;

            task.status = TaskStatus::Expired;
            self.repo.update_task(&task).await?;
            tracing::warn!(run_id = %task.run_id, task_id = %task_id, "human task expired");

            let Some(mut run) = self.repo.get_run(&task.run_id).await? else {
                return Ok(());
            };
            let matching = matches!(
                (&run.status, &run.wait_state),
                (RunStatus::Waiting, Some(WaitState::Task { task_id: t })) if *t == task.id
            );
            if !matching {
                return Ok(());
            }
            let process = self
                .registry
                .get(&run.definition)
                .ok_or_else(|| EngineError::UnknownDefinition(run.definition.clone()))?;
            let Some(step) = process.steps.get(&task.step_name).cloned() else {
                return Ok(());
            };
            let mut ctx = RunContext::from_snapshot(&run.context)?;
            self.fail_step(
                &mut run,
                &process,
                &step,
                &mut ctx,
                &format!("human task {:?} expired", task.step_name),
            )
            .await?
        };

        if matches!(resume, Advance::Continue) {
            let inner = self.clone();
            let run_id = task.run_id;
            tokio::spawn(async move { inner.drive(run_id).await });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    pub(crate) async fn cancel_run(
        self: &Arc<Self>,
        run_id: Uuid,
        reason: &str,
    ) -> Result<(), EngineError> {
        if self.repo.get_run(&run_id).await?.is_none() {
            return Err(EngineError::RunNotFound(run_id));
        }

        // Wake any in-flight step, backoff sleep, or wait before taking the
        // run lock so the drive loop yields promptly.
        self.cancel_token(run_id).cancel();

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let Some(mut run) = self.repo.get_run(&run_id).await? else {
            return Err(EngineError::RunNotFound(run_id));
        };
        if run.status.is_terminal() {
            tracing::warn!(run_id = %run_id, status = ?run.status, "cancel on terminal run ignored");
            return Ok(());
        }
        let process = self
            .registry
            .get(&run.definition)
            .ok_or_else(|| EngineError::UnknownDefinition(run.definition.clone()))?;

        self.finalize_abnormal(&mut run, &process, RunStatus::Cancelled, reason)
            .await
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    pub(crate) async fn recover(self: &Arc<Self>) -> Result<usize, EngineError> {
        let runs = self.repo.list_inflight_runs().await?;
        let mut recovered = 0;

        for run in runs {
            let Some(process) = self.registry.get(&run.definition) else {
                tracing::warn!(
                    run_id = %run.id,
                    definition = %run.definition,
                    "cannot recover run: definition not registered"
                );
                continue;
            };
            recovered += 1;

            match (&run.status, &run.wait_state) {
                (RunStatus::Pending | RunStatus::Running, _) | (RunStatus::Waiting, None) => {
                    tracing::info!(run_id = %run.id, "recovering active run");
                    self.spawn_run(run.id, &process);
                }
                (RunStatus::Waiting, Some(WaitState::Timer { resume_at })) => {
                    tracing::info!(run_id = %run.id, "re-arming timer wait");
                    self.spawn_timer(run.id, *resume_at);
                }
                (RunStatus::Waiting, Some(WaitState::Signal { signal, deadline })) => {
                    // signal() reads the store directly, so nothing to
                    // re-register beyond the expiry timer.
                    if let Some(deadline) = deadline {
                        self.spawn_signal_expiry(run.id, signal.clone(), *deadline);
                    }
                }
                (RunStatus::Waiting, Some(WaitState::Task { .. })) => {
                    // Task completion and the expiry sweep resume through
                    // the store; nothing in memory to rebuild.
                }
                (RunStatus::Waiting, Some(WaitState::Subprocess { child_run_id })) => {
                    let link = ParentLink {
                        run_id: run.id,
                        step: run.current_step.clone().unwrap_or_default(),
                    };
                    if let Some(child) = self.repo.get_run(child_run_id).await?
                        && child.status.is_terminal()
                    {
                        let inner = self.clone();
                        tokio::spawn(async move {
                            if let Err(error) = inner.resume_parent(link, child).await {
                                tracing::error!(%error, "recovery parent resume failed");
                            }
                        });
                    } else {
                        self.parents.insert(*child_run_id, link);
                    }
                }
                _ => {}
            }
        }

        tracing::info!(recovered, "recovery pass finished");
        Ok(recovered)
    }
}

enum ParallelResult {
    Success(Vec<(String, Value)>),
    Failure(String),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryRepository;
    use futures_util::future::BoxFuture;
    use oxflow_types::process::ProcessDefinition;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn engine() -> ProcessEngine<MemoryRepository> {
        ProcessEngine::new(MemoryRepository::new())
    }

    fn register(engine: &ProcessEngine<MemoryRepository>, yaml: &str) {
        let def: ProcessDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        engine.register(def).unwrap();
    }

    fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Records handler invocations in order, for routing and compensation
    /// assertions.
    fn logging_handler(
        engine: &ProcessEngine<MemoryRepository>,
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
    ) {
        engine.handlers().register(name, move |inputs: Map<String, Value>| {
            log.lock().unwrap().push(name.to_string());
            async move { Ok::<Value, _>(Value::Object(inputs)) }
        });
    }

    async fn wait_for_status(
        engine: &ProcessEngine<MemoryRepository>,
        run_id: Uuid,
        status: RunStatus,
    ) -> ProcessRun {
        for _ in 0..400 {
            let run = engine.get_run(run_id).await.unwrap();
            if run.status == status {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "run {run_id} never reached {status:?} (last: {:?})",
            engine.get_run(run_id).await.unwrap().status
        );
    }

    // -------------------------------------------------------------------
    // Linear execution
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn linear_process_runs_steps_in_list_order() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "inventory.reserve", log.clone());
        logging_handler(&engine, "payments.charge", log.clone());
        register(
            &engine,
            r#"
name: checkout
steps:
  - name: reserve
    kind: service
    service: inventory.reserve
  - name: charge
    kind: service
    service: payments.charge
    inputs:
      - source: "reserve.sku"
        target: sku
"#,
        );

        let run_id = engine
            .start("checkout", inputs(&[("sku", json!("A-1"))]), None)
            .await
            .unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Completed).await;

        assert_eq!(run.completed_steps, vec!["reserve", "charge"]);
        assert_eq!(*log.lock().unwrap(), vec!["inventory.reserve", "payments.charge"]);
        assert!(run.ended_at.is_some());
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn missing_required_input_is_rejected_before_any_run() {
        let engine = engine();
        register(
            &engine,
            r#"
name: strict
inputs:
  - name: order_id
    required: true
steps:
  - name: s
    kind: service
    service: x
"#,
        );

        let err = engine.start("strict", Map::new(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingInput(field) if field == "order_id"));
        assert!(engine.list_runs(&RunFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run_with_last_error() {
        let engine = engine();
        engine.handlers().register("flaky", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("boom"))
        });
        register(
            &engine,
            r#"
name: retrying
steps:
  - name: attempt
    kind: service
    service: flaky
    retry:
      max_attempts: 2
      initial_interval_ms: 5
"#,
        );

        let run_id = engine.start("retrying", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Failed).await;
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    // -------------------------------------------------------------------
    // Idempotency and overlap
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn same_idempotency_key_returns_existing_run() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "once", log.clone());
        register(
            &engine,
            "name: dedup\nsteps:\n  - name: s\n    kind: service\n    service: once\n",
        );

        let first = engine.start("dedup", Map::new(), Some("key-1")).await.unwrap();
        wait_for_status(&engine, first, RunStatus::Completed).await;
        let second = engine.start("dedup", Map::new(), Some("key-1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(log.lock().unwrap().len(), 1);

        let third = engine.start("dedup", Map::new(), Some("key-2")).await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn skip_policy_returns_active_run_id() {
        let engine = engine();
        register(
            &engine,
            r#"
name: skippy
overlap_policy: skip
steps:
  - name: hold
    kind: wait
    duration_secs: 3600
"#,
        );

        let first = engine.start("skippy", Map::new(), None).await.unwrap();
        wait_for_status(&engine, first, RunStatus::Waiting).await;
        let second = engine.start("skippy", Map::new(), None).await.unwrap();
        assert_eq!(first, second);

        engine.cancel(first, "test over").await.unwrap();
    }

    #[tokio::test]
    async fn queue_policy_runs_in_arrival_order() {
        let engine = engine();
        let gate = Arc::new(tokio::sync::Notify::new());
        let handler_gate = gate.clone();
        engine.handlers().register("gated", move |_| {
            let gate = handler_gate.clone();
            async move {
                gate.notified().await;
                Ok::<Value, _>(json!({}))
            }
        });
        register(
            &engine,
            r#"
name: queued
overlap_policy: queue
steps:
  - name: work
    kind: service
    service: gated
"#,
        );

        let first = engine.start("queued", Map::new(), None).await.unwrap();
        wait_for_status(&engine, first, RunStatus::Running).await;
        let second = engine.start("queued", Map::new(), None).await.unwrap();
        assert_ne!(first, second);

        // the queued run stays pending while the first is active
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.get_run(second).await.unwrap().status, RunStatus::Pending);

        gate.notify_one();
        wait_for_status(&engine, first, RunStatus::Completed).await;
        gate.notify_one();
        wait_for_status(&engine, second, RunStatus::Completed).await;
    }

    #[tokio::test]
    async fn cancel_previous_policy_supersedes_active_run() {
        let engine = engine();
        register(
            &engine,
            r#"
name: latest-wins
overlap_policy: cancel_previous
steps:
  - name: hold
    kind: wait
    duration_secs: 3600
"#,
        );

        let first = engine.start("latest-wins", Map::new(), None).await.unwrap();
        wait_for_status(&engine, first, RunStatus::Waiting).await;
        let second = engine.start("latest-wins", Map::new(), None).await.unwrap();

        let cancelled = wait_for_status(&engine, first, RunStatus::Cancelled).await;
        assert!(cancelled.error.as_deref().unwrap().contains("superseded"));
        wait_for_status(&engine, second, RunStatus::Waiting).await;
        engine.cancel(second, "test over").await.unwrap();
    }

    // -------------------------------------------------------------------
    // Conditions
    // -------------------------------------------------------------------

    async fn run_gate(amount: i64) -> Vec<String> {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "approve.high", log.clone());
        logging_handler(&engine, "approve.low", log.clone());
        register(
            &engine,
            r#"
name: gate
steps:
  - name: check
    kind: condition
    condition: "inputs.amount > 100"
    on_true: high
    on_false: low
  - name: high
    kind: service
    service: approve.high
    on_success: complete
  - name: low
    kind: service
    service: approve.low
    on_success: complete
"#,
        );

        let run_id = engine
            .start("gate", inputs(&[("amount", json!(amount))]), None)
            .await
            .unwrap();
        wait_for_status(&engine, run_id, RunStatus::Completed).await;
        let taken = log.lock().unwrap().clone();
        taken
    }

    #[tokio::test]
    async fn condition_routes_on_true_and_false() {
        assert_eq!(run_gate(150).await, vec!["approve.high"]);
        assert_eq!(run_gate(50).await, vec!["approve.low"]);
    }

    #[tokio::test]
    async fn condition_boundary_takes_false_branch() {
        assert_eq!(run_gate(100).await, vec!["approve.low"]);
    }

    // -------------------------------------------------------------------
    // Waits, signals, cancellation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn duration_wait_resumes_and_completes() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "after", log.clone());
        register(
            &engine,
            r#"
name: pause
steps:
  - name: nap
    kind: wait
    duration_secs: 0
  - name: then
    kind: service
    service: after
"#,
        );

        let run_id = engine.start("pause", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Completed).await;
        assert_eq!(run.completed_steps, vec!["nap", "then"]);
    }

    #[tokio::test]
    async fn signal_resumes_wait_and_payload_is_resolvable() {
        let engine = engine();
        engine.handlers().register("echo", |inputs: Map<String, Value>| async move {
            Ok::<Value, _>(Value::Object(inputs))
        });
        register(
            &engine,
            r#"
name: approval-flow
steps:
  - name: wait-approval
    kind: wait
    signal: approved
  - name: record
    kind: service
    service: echo
    inputs:
      - source: "wait-approval.approver"
        target: approver
"#,
        );

        let run_id = engine.start("approval-flow", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Waiting).await;

        engine
            .signal(run_id, "approved", json!({ "approver": "lee" }))
            .await
            .unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Completed).await;
        assert_eq!(run.context["step_outputs"]["record"]["approver"], json!("lee"));
    }

    #[tokio::test]
    async fn signal_on_non_waiting_run_is_a_no_op() {
        let engine = engine();
        engine.handlers().register("quick", |_| async { Ok::<Value, _>(json!({})) });
        register(
            &engine,
            "name: fast\nsteps:\n  - name: s\n    kind: service\n    service: quick\n",
        );

        let run_id = engine.start("fast", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Completed).await;

        engine.signal(run_id, "ghost", json!({})).await.unwrap();
        assert_eq!(engine.get_run(run_id).await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn mismatched_signal_name_does_not_resume() {
        let engine = engine();
        register(
            &engine,
            r#"
name: picky
steps:
  - name: hold
    kind: wait
    signal: go
"#,
        );

        let run_id = engine.start("picky", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Waiting).await;

        engine.signal(run_id, "stop", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.get_run(run_id).await.unwrap().status, RunStatus::Waiting);

        engine.cancel(run_id, "test over").await.unwrap();
    }

    #[tokio::test]
    async fn cancel_marks_run_cancelled_with_reason_and_compensates() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "inventory.reserve", log.clone());
        logging_handler(&engine, "inventory.release", log.clone());
        register(
            &engine,
            r#"
name: cancellable
steps:
  - name: reserve
    kind: service
    service: inventory.reserve
    compensate_with: release
  - name: hold
    kind: wait
    duration_secs: 3600
compensations:
  - name: release
    service: inventory.release
"#,
        );

        let run_id = engine.start("cancellable", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Waiting).await;

        engine.cancel(run_id, "x").await.unwrap();
        // cancel() returns only after the terminal state is persisted
        let run = engine.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.error.as_deref(), Some("x"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["inventory.reserve", "inventory.release"]
        );
    }

    #[tokio::test]
    async fn process_timeout_cancels_the_run() {
        let engine = engine();
        register(
            &engine,
            r#"
name: too-slow
timeout_secs: 0
steps:
  - name: hold
    kind: wait
    duration_secs: 3600
"#,
        );

        let run_id = engine.start("too-slow", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Cancelled).await;
        assert!(run.error.as_deref().unwrap().contains("process timeout"));
    }

    // -------------------------------------------------------------------
    // Compensation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn failure_compensates_completed_steps_in_reverse_order() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "do-a", log.clone());
        logging_handler(&engine, "do-b", log.clone());
        logging_handler(&engine, "undo-a", log.clone());
        logging_handler(&engine, "undo-b", log.clone());
        engine.handlers().register("explode", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("boom"))
        });
        register(
            &engine,
            r#"
name: saga
steps:
  - name: a
    kind: service
    service: do-a
    compensate_with: comp-a
  - name: b
    kind: service
    service: do-b
    compensate_with: comp-b
  - name: c
    kind: service
    service: explode
compensations:
  - name: comp-a
    service: undo-a
  - name: comp-b
    service: undo-b
"#,
        );

        let run_id = engine.start("saga", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Failed).await;

        assert_eq!(run.error.as_deref(), Some("boom"));
        assert_eq!(*log.lock().unwrap(), vec!["do-a", "do-b", "undo-b", "undo-a"]);
    }

    #[tokio::test]
    async fn failed_compensation_is_appended_to_the_run_error() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "do-a", log.clone());
        engine.handlers().register("explode", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("boom"))
        });
        engine.handlers().register("broken-undo", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("undo failed"))
        });
        register(
            &engine,
            r#"
name: sour-saga
steps:
  - name: a
    kind: service
    service: do-a
    compensate_with: comp-a
  - name: b
    kind: service
    service: explode
compensations:
  - name: comp-a
    service: broken-undo
"#,
        );

        let run_id = engine.start("sour-saga", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Failed).await;
        let error = run.error.unwrap();
        assert!(error.starts_with("boom"));
        assert!(error.contains("comp-a"));
        assert!(error.contains("undo failed"));
    }

    #[tokio::test]
    async fn on_failure_routes_instead_of_failing() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "cleanup", log.clone());
        engine.handlers().register("explode", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("boom"))
        });
        register(
            &engine,
            r#"
name: recoverable
steps:
  - name: risky
    kind: service
    service: explode
    on_failure: recover
  - name: recover
    kind: service
    service: cleanup
"#,
        );

        let run_id = engine.start("recoverable", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Completed).await;
        assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
        // the failed step's error is recorded as its output
        assert_eq!(run.context["step_outputs"]["risky"]["error"], json!("boom"));
    }

    // -------------------------------------------------------------------
    // Parallel
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn parallel_branches_all_succeed_and_outputs_land_per_branch() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "warehouse.pick", log.clone());
        logging_handler(&engine, "labels.print", log.clone());
        register(
            &engine,
            r#"
name: fan-out
steps:
  - name: prepare
    kind: parallel
    steps:
      - name: pick
        kind: service
        service: warehouse.pick
        inputs:
          - source: "'bin-7'"
            target: bin
      - name: label
        kind: service
        service: labels.print
"#,
        );

        let run_id = engine.start("fan-out", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Completed).await;

        let mut invoked = log.lock().unwrap().clone();
        invoked.sort();
        assert_eq!(invoked, vec!["labels.print", "warehouse.pick"]);
        // branch outputs are addressable by branch name, and the block
        // output aggregates them
        assert_eq!(run.context["step_outputs"]["pick"]["bin"], json!("bin-7"));
        assert_eq!(run.context["step_outputs"]["prepare"]["pick"]["bin"], json!("bin-7"));
    }

    #[tokio::test]
    async fn fail_fast_parallel_fails_without_waiting_for_slow_siblings() {
        let engine = engine();
        engine.handlers().register("explode", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("boom"))
        });
        register(
            &engine,
            r#"
name: fragile-fan
steps:
  - name: fan
    kind: parallel
    failure_policy: fail_fast
    steps:
      - name: bad
        kind: service
        service: explode
      - name: slow
        kind: wait
        duration_secs: 3600
"#,
        );

        let started = std::time::Instant::now();
        let run_id = engine.start("fragile-fan", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Failed).await;

        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(run.error.as_deref().unwrap().contains("bad"));
        assert!(run.error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn rollback_parallel_compensates_succeeded_branches() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        logging_handler(&engine, "warehouse.pick", log.clone());
        logging_handler(&engine, "warehouse.restock", log.clone());
        engine.handlers().register("explode", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("boom"))
        });
        register(
            &engine,
            r#"
name: rollback-fan
steps:
  - name: fan
    kind: parallel
    failure_policy: rollback
    steps:
      - name: pick
        kind: service
        service: warehouse.pick
        compensate_with: restock
      - name: bad
        kind: service
        service: explode
compensations:
  - name: restock
    service: warehouse.restock
"#,
        );

        let run_id = engine.start("rollback-fan", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Failed).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["warehouse.pick", "warehouse.restock"]
        );
    }

    // -------------------------------------------------------------------
    // Subprocess
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn subprocess_suspends_parent_and_resumes_with_child_output() {
        let engine = engine();
        engine.handlers().register("pricing.total", |inputs: Map<String, Value>| async move {
            let amount = inputs.get("amount").and_then(Value::as_i64).unwrap_or(0);
            Ok::<Value, _>(json!({ "total": amount * 2 }))
        });
        engine.handlers().register("echo", |inputs: Map<String, Value>| async move {
            Ok::<Value, _>(Value::Object(inputs))
        });
        register(
            &engine,
            r#"
name: pricing
inputs:
  - name: amount
    required: true
steps:
  - name: total
    kind: service
    service: pricing.total
    inputs:
      - source: "inputs.amount"
        target: amount
"#,
        );
        register(
            &engine,
            r#"
name: order
steps:
  - name: price
    kind: subprocess
    process: pricing
    inputs:
      - source: "inputs.amount"
        target: amount
  - name: record
    kind: service
    service: echo
    inputs:
      - source: "price.total"
        target: total
"#,
        );

        let run_id = engine
            .start("order", inputs(&[("amount", json!(21))]), None)
            .await
            .unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Completed).await;

        // the child's last step output became the subprocess step's output
        assert_eq!(run.context["step_outputs"]["price"]["total"], json!(42));
        assert_eq!(run.context["step_outputs"]["record"]["total"], json!(42));

        // the child ran as its own run
        let children = engine
            .list_runs(&RunFilter { definition: Some("pricing".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn failed_subprocess_fails_the_parent_step() {
        let engine = engine();
        engine.handlers().register("explode", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("boom"))
        });
        register(
            &engine,
            "name: doomed-child\nsteps:\n  - name: s\n    kind: service\n    service: explode\n",
        );
        register(
            &engine,
            r#"
name: parent
steps:
  - name: child
    kind: subprocess
    process: doomed-child
"#,
        );

        let run_id = engine.start("parent", Map::new(), None).await.unwrap();
        let run = wait_for_status(&engine, run_id, RunStatus::Failed).await;
        let error = run.error.unwrap();
        assert!(error.contains("doomed-child"));
        assert!(error.contains("boom"));
    }

    // -------------------------------------------------------------------
    // Lifecycle events
    // -------------------------------------------------------------------

    struct RecordingSink {
        names: Arc<StdMutex<Vec<String>>>,
    }

    impl EventSink for RecordingSink {
        fn emit<'a>(&'a self, event: LifecycleEvent) -> BoxFuture<'a, ()> {
            let names = self.names.clone();
            Box::pin(async move {
                names.lock().unwrap().push(event.name);
            })
        }
    }

    #[tokio::test]
    async fn declared_lifecycle_events_are_emitted() {
        let names = Arc::new(StdMutex::new(Vec::new()));
        let engine = ProcessEngine::with_collaborators(
            MemoryRepository::new(),
            Arc::new(NoopTransport),
            Arc::new(RecordingSink { names: names.clone() }),
        );
        engine.handlers().register("quick", |_| async { Ok::<Value, _>(json!({})) });
        register(
            &engine,
            r#"
name: eventful
events:
  on_start: order.started
  on_complete: order.finished
steps:
  - name: s
    kind: service
    service: quick
"#,
        );

        let run_id = engine.start("eventful", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Completed).await;
        assert_eq!(*names.lock().unwrap(), vec!["order.started", "order.finished"]);
    }

    #[tokio::test]
    async fn failure_event_fires_on_failed_runs_only() {
        let names = Arc::new(StdMutex::new(Vec::new()));
        let engine = ProcessEngine::with_collaborators(
            MemoryRepository::new(),
            Arc::new(NoopTransport),
            Arc::new(RecordingSink { names: names.clone() }),
        );
        engine.handlers().register("explode", |_| async {
            Err::<Value, _>(crate::process::handlers::ServiceError::new("boom"))
        });
        register(
            &engine,
            r#"
name: eventful-failure
events:
  on_failure: order.failed
steps:
  - name: s
    kind: service
    service: explode
"#,
        );

        let run_id = engine.start("eventful-failure", Map::new(), None).await.unwrap();
        wait_for_status(&engine, run_id, RunStatus::Failed).await;
        assert_eq!(*names.lock().unwrap(), vec!["order.failed"]);
    }

    // -------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn recover_rearms_an_elapsed_timer_wait() {
        let repo = MemoryRepository::new();
        let yaml = r#"
name: restartable
steps:
  - name: nap
    kind: wait
    duration_secs: 3600
  - name: then
    kind: service
    service: after
"#;

        let first = ProcessEngine::new(repo.clone());
        first.handlers().register("after", |_| async { Ok::<Value, _>(json!({})) });
        register(&first, yaml);
        let run_id = first.start("restartable", Map::new(), None).await.unwrap();
        wait_for_status(&first, run_id, RunStatus::Waiting).await;

        // rewrite the persisted wait so the timer is already due, then
        // bring up a fresh engine over the same store
        let mut run = repo.get_run(&run_id).await.unwrap().unwrap();
        run.wait_state = Some(WaitState::Timer {
            resume_at: Utc::now() - chrono::Duration::seconds(1),
        });
        repo.update_run(&run).await.unwrap();

        let second = ProcessEngine::new(repo.clone());
        second.handlers().register("after", |_| async { Ok::<Value, _>(json!({})) });
        register(&second, yaml);
        assert_eq!(second.recover().await.unwrap(), 1);

        let run = wait_for_status(&second, run_id, RunStatus::Completed).await;
        assert_eq!(run.completed_steps, vec!["nap", "then"]);
    }

    #[tokio::test]
    async fn recover_leaves_signal_waits_parked_for_delivery() {
        let repo = MemoryRepository::new();
        let yaml = r#"
name: signalled
steps:
  - name: hold
    kind: wait
    signal: go
"#;

        let first = ProcessEngine::new(repo.clone());
        register(&first, yaml);
        let run_id = first.start("signalled", Map::new(), None).await.unwrap();
        wait_for_status(&first, run_id, RunStatus::Waiting).await;

        let second = ProcessEngine::new(repo.clone());
        register(&second, yaml);
        assert_eq!(second.recover().await.unwrap(), 1);

        // still waiting until the signal actually arrives
        assert_eq!(second.get_run(run_id).await.unwrap().status, RunStatus::Waiting);
        second.signal(run_id, "go", json!({})).await.unwrap();
        wait_for_status(&second, run_id, RunStatus::Completed).await;
    }
}
