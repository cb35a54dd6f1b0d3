//! Process engine domain types: definitions, runs, step executions, and
//! human tasks.
//!
//! Definitions are immutable data produced outside the engine (by a DSL
//! compiler or handwritten fixtures) and only read after registration. Run,
//! step-execution, and task records are mutable engine-owned state persisted
//! after every transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Process definition
// ---------------------------------------------------------------------------

/// Immutable description of a multi-step business process.
///
/// Looked up by `name` in the engine's registry; never mutated after
/// registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique definition name.
    pub name: String,

    /// Declared input fields, seeded into the run context at start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<FieldSpec>,

    /// Declared output fields, resolved from the run context at completion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<FieldSpec>,

    /// Ordered step list. The first step is the run's entry point; a step
    /// without `on_success` falls through to the next step in this order.
    pub steps: Vec<StepDefinition>,

    /// Named compensation actions referenced by `compensate_with`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensations: Vec<CompensationDefinition>,

    /// Overall run timeout in seconds. Expiry behaves like an explicit
    /// cancel with reason "process timeout".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// What to do when a new run is requested while another run of this
    /// definition is still active.
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,

    /// Lifecycle event names emitted to the external event sink.
    #[serde(default)]
    pub events: LifecycleHooks,
}

/// A declared input or output field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    /// Required inputs must be present in the start payload.
    #[serde(default)]
    pub required: bool,
}

/// Lifecycle event names declared on a definition. `None` means no event is
/// emitted for that transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
}

/// Rule governing concurrent runs of the same definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Return the active run's id without starting a new run.
    Skip,
    /// Enqueue the new run; it starts when the active run terminates.
    Queue,
    /// Cancel the active run(s), then start the new one.
    CancelPrevious,
    /// Run concurrently without restriction.
    #[default]
    Allow,
}

// ---------------------------------------------------------------------------
// Schedule definition
// ---------------------------------------------------------------------------

/// Immutable description of a scheduled job: a trigger plus its own step
/// list, executed through the same engine as a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Unique definition name (shares the namespace with processes).
    pub name: String,

    pub trigger: ScheduleTrigger,

    #[serde(default)]
    pub overlap_policy: OverlapPolicy,

    pub steps: Vec<StepDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// When a schedule fires. Exactly one of `cron` / `interval_secs` must be
/// set (validated at registration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    /// Cron expression (5 or 6 fields).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Fixed interval between fires, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    /// Fixed UTC offset such as "+05:30". Named zones fall back to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// Replay fires missed while the engine was down.
    #[serde(default)]
    pub catch_up: bool,
}

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// A single unit of work within a process or schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the definition (parallel children included); keys the
    /// step's output in the run context.
    pub name: String,

    /// Kind-specific configuration.
    #[serde(flatten)]
    pub config: StepConfig,

    /// Input mappings resolved through the run context before execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputMapping>,

    /// Bounds a single execution attempt, not the whole retry sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Next step on success. Absent means "next in list order"; the
    /// sentinels "complete" and "fail" terminate the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,

    /// Next step once retries are exhausted. Absent means the run fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,

    /// Name of a `CompensationDefinition` to run if this completed step
    /// must be rolled back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate_with: Option<String>,
}

/// Kind-specific step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    /// Invoke a registered service handler; its return value becomes the
    /// step output.
    Service { service: String },

    /// Hand a rendered message to the channel transport.
    Send { channel: String, message: String },

    /// Suspend the run for a duration or until a named signal arrives.
    /// Exactly one of the two must be set (validated at registration).
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },

    /// Create a human task and suspend until an outcome is chosen or the
    /// task expires.
    HumanTask { task: HumanTaskDefinition },

    /// Start a child run of the named definition and suspend until it
    /// reaches a terminal state.
    Subprocess { process: String },

    /// Execute the nested steps concurrently.
    Parallel {
        steps: Vec<StepDefinition>,
        #[serde(default)]
        failure_policy: ParallelFailurePolicy,
    },

    /// Evaluate a boolean expression and route to one of two targets.
    Condition {
        condition: String,
        on_true: String,
        on_false: String,
    },
}

impl StepConfig {
    /// Short kind label for logging and step-execution records.
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Service { .. } => "service",
            StepConfig::Send { .. } => "send",
            StepConfig::Wait { .. } => "wait",
            StepConfig::HumanTask { .. } => "human_task",
            StepConfig::Subprocess { .. } => "subprocess",
            StepConfig::Parallel { .. } => "parallel",
            StepConfig::Condition { .. } => "condition",
        }
    }
}

/// How a parallel block reacts to a failing child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelFailurePolicy {
    /// Cancel siblings on the first failure.
    #[default]
    FailFast,
    /// Let all siblings finish, then evaluate overall success.
    WaitAll,
    /// Let all siblings finish, then compensate the ones that succeeded.
    Rollback,
}

/// `source expression -> target field` mapping applied before a step runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMapping {
    pub source: String,
    pub target: String,
}

/// A named rollback action (saga pattern), invoked in reverse completed-step
/// order on failure or cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationDefinition {
    pub name: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputMapping>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    1000
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

/// Retry behavior for a step. Attempt 1 runs immediately; subsequent
/// attempts wait out the backoff interval first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,

    /// Upper bound on any computed interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            backoff: BackoffKind::default(),
            backoff_coefficient: default_backoff_coefficient(),
            max_interval_ms: None,
        }
    }
}

/// Shape of the backoff curve between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

// ---------------------------------------------------------------------------
// Human task definition
// ---------------------------------------------------------------------------

/// Declarative description of a human decision point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanTaskDefinition {
    /// Target surface the task is presented on (inbox name, channel, ...).
    pub surface: String,

    /// Assignee role, or an expression resolved against the run context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Task expiry; an expired task fails its step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Escalation marker deadline, before expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_timeout_secs: Option<u64>,

    /// Named outcomes a human can choose from.
    pub outcomes: Vec<OutcomeDefinition>,
}

/// One choosable outcome of a human task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeDefinition {
    pub name: String,

    /// Context variable assignments applied when this outcome is chosen.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<FieldAssignment>,

    /// Step to resume at, or the sentinels "complete" / "fail".
    pub goto: String,

    /// Optional confirmation prompt shown before committing the outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
}

/// `field = value-expression` assignment into the run context's variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldAssignment {
    pub field: String,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Lifecycle status of a process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Active runs count against the definition's overlap policy.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Persisted resume condition for a suspended run. Restart-safe: recovery
/// re-arms the condition from this record instead of relying on in-memory
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitState {
    /// Resume when the deadline passes.
    Timer { resume_at: DateTime<Utc> },
    /// Resume when a matching signal arrives, or fail at the deadline.
    Signal {
        signal: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },
    /// Resume when the human task completes or expires.
    Task { task_id: Uuid },
    /// Resume when the child run reaches a terminal state.
    Subprocess { child_run_id: Uuid },
}

/// One execution instance of a process or schedule definition.
///
/// Owned by the engine and persisted after every transition; destroyed only
/// by external retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRun {
    pub id: Uuid,

    /// Definition name this run was started from.
    pub definition: String,

    pub status: RunStatus,

    /// Step currently executing or suspended on; `None` once terminal or
    /// before the first step is entered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    /// Names of steps that completed successfully, in completion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_steps: Vec<String>,

    /// Caller-supplied dedup token; at most one run per
    /// (definition, idempotency_key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Resume condition while `status == Waiting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_state: Option<WaitState>,

    /// Run context snapshot (inputs, step outputs, variables).
    pub context: Value,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Failure or cancellation reason; set on FAILED / CANCELLED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Step execution record
// ---------------------------------------------------------------------------

/// Status of a single step execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

/// Audit record for one attempt of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_name: String,

    /// 1-based attempt counter; never exceeds the policy's `max_attempts`.
    pub attempt: u32,

    pub status: StepExecutionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Human task record
// ---------------------------------------------------------------------------

/// Lifecycle status of a human task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Expired,
}

impl TaskStatus {
    /// Open tasks can still be assigned, completed, or expired.
    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Assigned)
    }
}

/// A pending human decision, owned by the task manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_name: String,
    pub surface: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    pub status: TaskStatus,

    /// Chosen outcome name once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,

    /// Expiry deadline, from the definition's `timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_deadline: Option<DateTime<Utc>>,

    /// Set once when the escalation deadline passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Schedule state
// ---------------------------------------------------------------------------

/// Last-fire bookkeeping for a schedule, persisted so catch-up can compute
/// missed executions across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleState {
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
