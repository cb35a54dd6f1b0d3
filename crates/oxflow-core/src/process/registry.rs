//! Engine-owned definition registry.
//!
//! Definitions are compiled at `register()` time: expressions parse into
//! typed ASTs, transition targets are checked against the step set, and the
//! step list becomes a name-indexed adjacency map. Cycles through condition
//! steps (retry-until-approved patterns) are legal; only *dangling* names
//! are rejected. All malformed input surfaces here as [`DefinitionError`]
//! instead of failing mid-run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use oxflow_types::process::{
    CompensationDefinition, HumanTaskDefinition, LifecycleHooks, OverlapPolicy,
    ParallelFailurePolicy, ProcessDefinition, RetryPolicy, ScheduleDefinition, StepConfig,
    StepDefinition,
};

use super::context::CompiledMapping;
use super::expr::{self, Condition, ExprError, Template, ValueExpr};

// ---------------------------------------------------------------------------
// Compiled representation
// ---------------------------------------------------------------------------

/// A transition target: a step name, or one of the terminal sentinels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTarget {
    Step(String),
    Complete,
    Fail,
}

impl StepTarget {
    fn parse(raw: &str) -> Self {
        match raw {
            "complete" => StepTarget::Complete,
            "fail" => StepTarget::Fail,
            step => StepTarget::Step(step.to_string()),
        }
    }
}

/// Kind-specific compiled action.
#[derive(Debug, Clone)]
pub enum CompiledAction {
    Service {
        service: String,
    },
    Send {
        channel: String,
        message: Template,
    },
    WaitDuration {
        duration_secs: u64,
    },
    WaitSignal {
        signal: String,
    },
    HumanTask(CompiledHumanTask),
    Subprocess {
        process: String,
    },
    Parallel {
        branches: Vec<CompiledStep>,
        failure_policy: ParallelFailurePolicy,
    },
    Condition {
        condition: Condition,
        on_true: StepTarget,
        on_false: StepTarget,
    },
}

/// A step with its expressions pre-parsed and successors resolved.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub name: String,
    pub kind: &'static str,
    pub action: CompiledAction,
    pub inputs: Vec<CompiledMapping>,
    pub timeout_secs: Option<u64>,
    /// `None` means a single attempt with no retries.
    pub retry: Option<RetryPolicy>,
    pub on_success: Option<StepTarget>,
    pub on_failure: Option<StepTarget>,
    pub compensate_with: Option<String>,
    /// Fall-through successor when `on_success` is absent.
    pub next_in_order: Option<String>,
}

impl CompiledStep {
    /// Effective success target: explicit `on_success`, else list order,
    /// else run completion.
    pub fn success_target(&self) -> StepTarget {
        match (&self.on_success, &self.next_in_order) {
            (Some(target), _) => target.clone(),
            (None, Some(next)) => StepTarget::Step(next.clone()),
            (None, None) => StepTarget::Complete,
        }
    }
}

/// Human task with its assignee and assignment expressions compiled.
#[derive(Debug, Clone)]
pub struct CompiledHumanTask {
    pub surface: String,
    pub assignee: Option<ValueExpr>,
    pub timeout_secs: Option<u64>,
    pub escalation_timeout_secs: Option<u64>,
    pub outcomes: Vec<CompiledOutcome>,
}

impl CompiledHumanTask {
    pub fn outcome(&self, name: &str) -> Option<&CompiledOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct CompiledOutcome {
    pub name: String,
    pub assignments: Vec<(String, ValueExpr)>,
    pub goto: StepTarget,
    pub confirmation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledCompensation {
    pub name: String,
    pub service: String,
    pub inputs: Vec<CompiledMapping>,
}

/// Trigger spec carried by definitions registered from a schedule.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub cron: Option<String>,
    pub interval_secs: Option<u64>,
    pub timezone: Option<String>,
    pub catch_up: bool,
}

/// A fully compiled, validated definition ready for execution.
#[derive(Debug)]
pub struct CompiledProcess {
    pub name: String,
    pub steps: HashMap<String, CompiledStep>,
    pub first_step: Option<String>,
    pub compensations: HashMap<String, CompiledCompensation>,
    pub required_inputs: Vec<String>,
    pub output_fields: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub overlap_policy: OverlapPolicy,
    pub events: LifecycleHooks,
    /// Present when the definition is a schedule.
    pub schedule: Option<ScheduleSpec>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal registration failure; nothing is stored when compilation fails.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition {0:?} has no steps")]
    EmptyDefinition(String),

    #[error("duplicate step name {step:?} in definition {definition:?}")]
    DuplicateStep { definition: String, step: String },

    #[error("step {step:?} references unknown target {target:?}")]
    UnknownTarget { step: String, target: String },

    #[error("step {step:?} references unknown compensation {name:?}")]
    UnknownCompensation { step: String, name: String },

    #[error("invalid expression in step {step:?}: {source}")]
    InvalidExpression {
        step: String,
        #[source]
        source: ExprError,
    },

    #[error("invalid step {step:?}: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("invalid schedule {schedule:?}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Either kind of registrable definition.
#[derive(Debug, Clone)]
pub enum Definition {
    Process(ProcessDefinition),
    Schedule(ScheduleDefinition),
}

impl From<ProcessDefinition> for Definition {
    fn from(def: ProcessDefinition) -> Self {
        Definition::Process(def)
    }
}

impl From<ScheduleDefinition> for Definition {
    fn from(def: ScheduleDefinition) -> Self {
        Definition::Schedule(def)
    }
}

/// Engine-owned registry. Processes and schedules share one namespace so a
/// schedule's runs start through the same lookup as a process's.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: DashMap<String, Arc<CompiledProcess>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile, validate, and store a definition, replacing any previous
    /// registration under the same name.
    pub fn register(&self, definition: Definition) -> Result<(), DefinitionError> {
        let compiled = match definition {
            Definition::Process(def) => compile_process(def)?,
            Definition::Schedule(def) => compile_schedule(def)?,
        };
        tracing::info!(definition = %compiled.name, "registered definition");
        self.definitions
            .insert(compiled.name.clone(), Arc::new(compiled));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CompiledProcess>> {
        self.definitions.get(name).map(|entry| entry.value().clone())
    }

    /// All registered definitions carrying a schedule trigger.
    pub fn schedules(&self) -> Vec<Arc<CompiledProcess>> {
        self.definitions
            .iter()
            .filter(|entry| entry.value().schedule.is_some())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions.iter().map(|e| e.key().clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

fn compile_process(def: ProcessDefinition) -> Result<CompiledProcess, DefinitionError> {
    compile(
        def.name,
        def.steps,
        def.compensations,
        def.inputs.iter().filter(|f| f.required).map(|f| f.name.clone()).collect(),
        def.outputs.iter().map(|f| f.name.clone()).collect(),
        def.timeout_secs,
        def.overlap_policy,
        def.events,
        None,
    )
}

fn compile_schedule(def: ScheduleDefinition) -> Result<CompiledProcess, DefinitionError> {
    let trigger = &def.trigger;
    match (&trigger.cron, trigger.interval_secs) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(DefinitionError::InvalidSchedule {
                schedule: def.name,
                reason: "exactly one of cron / interval_secs must be set".into(),
            });
        }
        (Some(cron), None) => {
            let normalized = normalize_cron(cron).ok_or_else(|| {
                DefinitionError::InvalidSchedule {
                    schedule: def.name.clone(),
                    reason: format!("cron expression {cron:?} must have 5 or 6 fields"),
                }
            })?;
            normalized.parse::<croner::Cron>().map_err(|e| {
                DefinitionError::InvalidSchedule {
                    schedule: def.name.clone(),
                    reason: format!("invalid cron expression {cron:?}: {e}"),
                }
            })?;
        }
        (None, Some(0)) => {
            return Err(DefinitionError::InvalidSchedule {
                schedule: def.name,
                reason: "interval_secs must be positive".into(),
            });
        }
        (None, Some(_)) => {}
    }

    let spec = ScheduleSpec {
        cron: trigger.cron.clone(),
        interval_secs: trigger.interval_secs,
        timezone: trigger.timezone.clone(),
        catch_up: trigger.catch_up,
    };

    compile(
        def.name,
        def.steps,
        Vec::new(),
        Vec::new(),
        Vec::new(),
        def.timeout_secs,
        def.overlap_policy,
        LifecycleHooks::default(),
        Some(spec),
    )
}

/// Normalize a 5-field cron expression to 6 fields by prepending seconds.
pub fn normalize_cron(expr: &str) -> Option<String> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Some(format!("0 {}", expr.trim())),
        6 => Some(expr.trim().to_string()),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn compile(
    name: String,
    steps: Vec<StepDefinition>,
    compensations: Vec<CompensationDefinition>,
    required_inputs: Vec<String>,
    output_fields: Vec<String>,
    timeout_secs: Option<u64>,
    overlap_policy: OverlapPolicy,
    events: LifecycleHooks,
    schedule: Option<ScheduleSpec>,
) -> Result<CompiledProcess, DefinitionError> {
    if steps.is_empty() {
        return Err(DefinitionError::EmptyDefinition(name));
    }

    // Step names are unique across the whole definition, parallel children
    // included, because step outputs are keyed by bare name.
    let mut seen: HashSet<String> = HashSet::new();
    let mut top_level: Vec<String> = Vec::new();
    for step in &steps {
        collect_names(&name, step, &mut seen)?;
        top_level.push(step.name.clone());
    }

    let mut comp_map = HashMap::new();
    for comp in compensations {
        let compiled = CompiledCompensation {
            name: comp.name.clone(),
            service: comp.service,
            inputs: compile_mappings(&comp.name, &comp.inputs)?,
        };
        comp_map.insert(comp.name, compiled);
    }

    let targets: HashSet<&str> = top_level.iter().map(String::as_str).collect();
    let first_step = top_level.first().cloned();

    let mut step_map = HashMap::new();
    for (index, step) in steps.into_iter().enumerate() {
        let next_in_order = top_level.get(index + 1).cloned();
        let compiled = compile_step(step, next_in_order, &targets, &comp_map, false)?;
        step_map.insert(compiled.name.clone(), compiled);
    }

    Ok(CompiledProcess {
        name,
        steps: step_map,
        first_step,
        compensations: comp_map,
        required_inputs,
        output_fields,
        timeout_secs,
        overlap_policy,
        events,
        schedule,
    })
}

fn collect_names(
    definition: &str,
    step: &StepDefinition,
    seen: &mut HashSet<String>,
) -> Result<(), DefinitionError> {
    if !seen.insert(step.name.clone()) {
        return Err(DefinitionError::DuplicateStep {
            definition: definition.to_string(),
            step: step.name.clone(),
        });
    }
    if let StepConfig::Parallel { steps, .. } = &step.config {
        for child in steps {
            collect_names(definition, child, seen)?;
        }
    }
    Ok(())
}

fn compile_mappings(
    step: &str,
    mappings: &[oxflow_types::process::InputMapping],
) -> Result<Vec<CompiledMapping>, DefinitionError> {
    mappings
        .iter()
        .map(|m| {
            Ok(CompiledMapping {
                source: ValueExpr::parse(&m.source).map_err(|source| {
                    DefinitionError::InvalidExpression { step: step.to_string(), source }
                })?,
                target: m.target.clone(),
            })
        })
        .collect()
}

fn resolve_target(
    step: &str,
    raw: &str,
    targets: &HashSet<&str>,
) -> Result<StepTarget, DefinitionError> {
    let target = StepTarget::parse(raw);
    if let StepTarget::Step(name) = &target
        && !targets.contains(name.as_str())
    {
        return Err(DefinitionError::UnknownTarget {
            step: step.to_string(),
            target: raw.to_string(),
        });
    }
    Ok(target)
}

fn compile_step(
    step: StepDefinition,
    next_in_order: Option<String>,
    targets: &HashSet<&str>,
    compensations: &HashMap<String, CompiledCompensation>,
    in_parallel: bool,
) -> Result<CompiledStep, DefinitionError> {
    let name = step.name.clone();
    let kind = step.config.kind();

    if in_parallel && (step.on_success.is_some() || step.on_failure.is_some()) {
        return Err(DefinitionError::InvalidStep {
            step: name,
            reason: "parallel children may not declare transitions".into(),
        });
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            return Err(DefinitionError::InvalidStep {
                step: name,
                reason: "retry max_attempts must be at least 1".into(),
            });
        }
        if !(retry.backoff_coefficient > 0.0) {
            return Err(DefinitionError::InvalidStep {
                step: name,
                reason: "retry backoff_coefficient must be positive".into(),
            });
        }
    }

    if let Some(comp) = &step.compensate_with
        && !compensations.contains_key(comp)
    {
        return Err(DefinitionError::UnknownCompensation {
            step: name,
            name: comp.clone(),
        });
    }

    let action = match step.config {
        StepConfig::Service { service } => CompiledAction::Service { service },
        StepConfig::Send { channel, message } => CompiledAction::Send {
            channel,
            message: expr::parse_template(&message).map_err(|source| {
                DefinitionError::InvalidExpression { step: name.clone(), source }
            })?,
        },
        StepConfig::Wait { duration_secs, signal } => match (duration_secs, signal) {
            (Some(secs), None) => CompiledAction::WaitDuration { duration_secs: secs },
            (None, Some(signal)) => CompiledAction::WaitSignal { signal },
            _ => {
                return Err(DefinitionError::InvalidStep {
                    step: name,
                    reason: "wait requires exactly one of duration_secs / signal".into(),
                });
            }
        },
        StepConfig::HumanTask { task } => {
            if in_parallel {
                return Err(DefinitionError::InvalidStep {
                    step: name,
                    reason: "human_task is not allowed inside a parallel block".into(),
                });
            }
            CompiledAction::HumanTask(compile_human_task(&name, task, targets)?)
        }
        StepConfig::Subprocess { process } => {
            if in_parallel {
                return Err(DefinitionError::InvalidStep {
                    step: name,
                    reason: "subprocess is not allowed inside a parallel block".into(),
                });
            }
            CompiledAction::Subprocess { process }
        }
        StepConfig::Parallel { steps, failure_policy } => {
            if in_parallel {
                return Err(DefinitionError::InvalidStep {
                    step: name,
                    reason: "parallel blocks do not nest".into(),
                });
            }
            let mut branches = Vec::with_capacity(steps.len());
            for child in steps {
                let child = compile_step(child, None, targets, compensations, true)?;
                match child.action {
                    CompiledAction::Service { .. }
                    | CompiledAction::Send { .. }
                    | CompiledAction::WaitDuration { .. } => {}
                    _ => {
                        return Err(DefinitionError::InvalidStep {
                            step: child.name,
                            reason: "parallel children must be service, send, or \
                                     wait-duration steps"
                                .into(),
                        });
                    }
                }
                branches.push(child);
            }
            if branches.is_empty() {
                return Err(DefinitionError::InvalidStep {
                    step: name,
                    reason: "parallel block has no children".into(),
                });
            }
            CompiledAction::Parallel { branches, failure_policy }
        }
        StepConfig::Condition { condition, on_true, on_false } => CompiledAction::Condition {
            condition: expr::parse_condition(&condition).map_err(|source| {
                DefinitionError::InvalidExpression { step: name.clone(), source }
            })?,
            on_true: resolve_target(&name, &on_true, targets)?,
            on_false: resolve_target(&name, &on_false, targets)?,
        },
    };

    let on_success = step
        .on_success
        .as_deref()
        .map(|raw| resolve_target(&name, raw, targets))
        .transpose()?;
    let on_failure = step
        .on_failure
        .as_deref()
        .map(|raw| resolve_target(&name, raw, targets))
        .transpose()?;

    Ok(CompiledStep {
        inputs: compile_mappings(&name, &step.inputs)?,
        name,
        kind,
        action,
        timeout_secs: step.timeout_secs,
        retry: step.retry,
        on_success,
        on_failure,
        compensate_with: step.compensate_with,
        next_in_order,
    })
}

fn compile_human_task(
    step: &str,
    task: HumanTaskDefinition,
    targets: &HashSet<&str>,
) -> Result<CompiledHumanTask, DefinitionError> {
    if task.outcomes.is_empty() {
        return Err(DefinitionError::InvalidStep {
            step: step.to_string(),
            reason: "human_task requires at least one outcome".into(),
        });
    }

    let assignee = task
        .assignee
        .as_deref()
        .map(ValueExpr::parse)
        .transpose()
        .map_err(|source| DefinitionError::InvalidExpression {
            step: step.to_string(),
            source,
        })?;

    let mut outcomes = Vec::with_capacity(task.outcomes.len());
    for outcome in task.outcomes {
        let mut assignments = Vec::with_capacity(outcome.assignments.len());
        for assignment in &outcome.assignments {
            let value = ValueExpr::parse(&assignment.value).map_err(|source| {
                DefinitionError::InvalidExpression { step: step.to_string(), source }
            })?;
            assignments.push((assignment.field.clone(), value));
        }
        outcomes.push(CompiledOutcome {
            goto: resolve_target(step, &outcome.goto, targets)?,
            name: outcome.name,
            assignments,
            confirmation: outcome.confirmation,
        });
    }

    Ok(CompiledHumanTask {
        surface: task.surface,
        assignee,
        timeout_secs: task.timeout_secs,
        escalation_timeout_secs: task.escalation_timeout_secs,
        outcomes,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
