//! Per-run data plane: inputs, step outputs, and variables.
//!
//! The context is the single place expressions resolve against. It
//! round-trips to and from the persisted run record so a restarted engine
//! can rebuild it and continue mid-run.

use serde_json::{Map, Value, json};

use super::expr::{
    Condition, Expr, PathExpr, PathRoot, Template, TemplatePart, ValueExpr, compare_values,
    is_truthy,
};

/// Maximum serialized size of a single step output before truncation.
pub const MAX_STEP_OUTPUT_SIZE: usize = 1024 * 1024; // 1 MiB

/// Maximum serialized size of the whole context snapshot.
pub const MAX_CONTEXT_SIZE: usize = 10 * 1024 * 1024; // 10 MiB

/// A compiled `source -> target` input mapping.
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    pub source: ValueExpr,
    pub target: String,
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Mutable per-run state: original inputs (read-only after start), per-step
/// outputs keyed by step name, and engine-internal variables.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    inputs: Map<String, Value>,
    step_outputs: Map<String, Value>,
    variables: Map<String, Value>,
}

impl RunContext {
    /// Seed a fresh context from the start inputs.
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            step_outputs: Map::new(),
            variables: Map::new(),
        }
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn step_output(&self, step: &str) -> Option<&Value> {
        self.step_outputs.get(step)
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Resolve a path to a value. Missing paths resolve to `Null` rather
    /// than erroring, so conditions over not-yet-populated fields evaluate
    /// as false.
    pub fn resolve_path(&self, path: &PathExpr) -> Value {
        let root: Value = match &path.root {
            PathRoot::Inputs => Value::Object(self.inputs.clone()),
            PathRoot::Vars => Value::Object(self.variables.clone()),
            PathRoot::Step(name) => match self.step_outputs.get(name) {
                Some(v) => v.clone(),
                None => return Value::Null,
            },
        };

        let mut current = root;
        for segment in &path.segments {
            current = match current.get(segment.as_str()) {
                Some(v) => v.clone(),
                None => return Value::Null,
            };
        }
        current
    }

    /// Evaluate an operand expression.
    pub fn evaluate(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Path(path) => self.resolve_path(path),
            Expr::Literal(value) => value.clone(),
        }
    }

    /// Evaluate a boolean condition against the current context.
    pub fn evaluate_condition(&self, condition: &Condition) -> bool {
        match condition {
            Condition::Compare { left, op, right } => {
                compare_values(*op, &self.evaluate(left), &self.evaluate(right))
            }
            Condition::Truthy(expr) => is_truthy(&self.evaluate(expr)),
        }
    }

    /// Render a `${...}` template to a string. Strings interpolate raw;
    /// null renders empty; other values render as compact JSON.
    pub fn render(&self, template: &Template) -> String {
        let mut out = String::new();
        for part in &template.parts {
            match part {
                TemplatePart::Text(text) => out.push_str(text),
                TemplatePart::Expr(expr) => match self.evaluate(expr) {
                    Value::Null => {}
                    Value::String(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                },
            }
        }
        out
    }

    /// Resolve a mapping source or assignment value.
    pub fn resolve_value(&self, value: &ValueExpr) -> Value {
        match value {
            ValueExpr::Expr(expr) => self.evaluate(expr),
            ValueExpr::Template(template) => Value::String(self.render(template)),
        }
    }

    /// Build the input object for a step from its compiled mappings.
    pub fn build_step_inputs(&self, mappings: &[CompiledMapping]) -> Map<String, Value> {
        let mut inputs = Map::new();
        for mapping in mappings {
            inputs.insert(mapping.target.clone(), self.resolve_value(&mapping.source));
        }
        inputs
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Record a step's output, truncating oversized values so one step
    /// cannot blow up the persisted snapshot. Outputs that would push the
    /// whole snapshot past `MAX_CONTEXT_SIZE` are truncated too.
    pub fn record_step_output(&mut self, step: &str, output: Value) {
        let output = match serde_json::to_string(&output) {
            Ok(s) if s.len() > MAX_STEP_OUTPUT_SIZE => {
                tracing::warn!(step, size = s.len(), "step output truncated");
                json!({ "truncated": true, "original_size": s.len() })
            }
            _ => output,
        };
        self.step_outputs.insert(step.to_string(), output);

        if self.snapshot_size() > MAX_CONTEXT_SIZE {
            tracing::warn!(step, "context size cap reached; step output truncated");
            self.step_outputs.insert(
                step.to_string(),
                json!({ "truncated": true, "reason": "context size cap" }),
            );
        }
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    // -----------------------------------------------------------------------
    // Snapshot round-trip
    // -----------------------------------------------------------------------

    /// Serialize for persistence in the run record.
    pub fn snapshot(&self) -> Value {
        json!({
            "inputs": self.inputs,
            "step_outputs": self.step_outputs,
            "variables": self.variables,
        })
    }

    /// Rebuild from a persisted snapshot.
    pub fn from_snapshot(snapshot: &Value) -> Result<Self, ContextError> {
        let object = |key: &str| -> Result<Map<String, Value>, ContextError> {
            match snapshot.get(key) {
                None | Some(Value::Null) => Ok(Map::new()),
                Some(Value::Object(map)) => Ok(map.clone()),
                Some(other) => Err(ContextError::MalformedSnapshot(format!(
                    "{key} is not an object: {other}"
                ))),
            }
        };
        Ok(Self {
            inputs: object("inputs")?,
            step_outputs: object("step_outputs")?,
            variables: object("variables")?,
        })
    }

    /// Serialized size of the current snapshot.
    pub fn snapshot_size(&self) -> usize {
        serde_json::to_string(&self.snapshot()).map_or(0, |s| s.len())
    }

    /// Convenience for condition evaluation straight from source text in
    /// tests and diagnostics; production paths use pre-compiled ASTs.
    pub fn eval_condition_str(&self, source: &str) -> Result<bool, super::expr::ExprError> {
        Ok(self.evaluate_condition(&super::expr::parse_condition(source)?))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A persisted context snapshot that cannot be rebuilt.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("malformed context snapshot: {0}")]
    MalformedSnapshot(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
