//! Typed expression AST for step input mappings and branch conditions.
//!
//! The grammar is deliberately small: a dotted path with a namespace prefix
//! (`inputs.`, `vars.`, or a step name), literals (numbers, quoted strings,
//! `true`/`false`/`null`), a single comparison operator
//! (`== != > >= < <=`), and `${...}` string interpolation. Expressions are
//! parsed once at registration time; malformed expressions surface as
//! definition errors instead of run-time failures.

use serde_json::Value;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Namespace a path resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRoot {
    /// Original run inputs, read-only after start.
    Inputs,
    /// Engine-internal variables (outcome assignments land here).
    Vars,
    /// Output of a named step.
    Step(String),
}

/// A dotted path such as `inputs.order.id` or `reserve-stock.ticket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    pub root: PathRoot,
    /// Segments after the root; empty means the whole namespace value.
    pub segments: Vec<String>,
}

/// A resolvable operand: a path or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path(PathExpr),
    Literal(Value),
}

/// Comparison operator in a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A boolean condition: a comparison, or a bare expression tested for
/// truthiness.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare { left: Expr, op: CmpOp, right: Expr },
    Truthy(Expr),
}

/// A string with `${...}` interpolation spans.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(Expr),
}

/// A mapping source or assignment value: a plain expression, or a template
/// when the string contains `${`.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    Expr(Expr),
    Template(Template),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Parse failure for the expression grammar.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,

    #[error("invalid path segment {segment:?} in {expr:?}")]
    InvalidSegment { expr: String, segment: String },

    #[error("invalid number literal {0:?}")]
    InvalidNumber(String),

    #[error("unterminated string literal in {0:?}")]
    UnterminatedString(String),

    #[error("missing operand in condition {0:?}")]
    MissingOperand(String),

    #[error("unexpected trailing input in {0:?}")]
    TrailingInput(String),

    #[error("unterminated ${{...}} interpolation in {0:?}")]
    UnterminatedInterpolation(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Parse an operand: a quoted string, number, keyword, or dotted path.
pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ExprError::Empty);
    }

    if let Some(quote) = s.chars().next().filter(|c| *c == '\'' || *c == '"') {
        let inner = &s[1..];
        let Some(end) = inner.find(quote) else {
            return Err(ExprError::UnterminatedString(input.to_string()));
        };
        if !inner[end + 1..].trim().is_empty() {
            return Err(ExprError::TrailingInput(input.to_string()));
        }
        return Ok(Expr::Literal(Value::String(inner[..end].to_string())));
    }

    match s {
        "true" => return Ok(Expr::Literal(Value::Bool(true))),
        "false" => return Ok(Expr::Literal(Value::Bool(false))),
        "null" => return Ok(Expr::Literal(Value::Null)),
        _ => {}
    }

    let first = s.chars().next().unwrap_or_default();
    if first.is_ascii_digit() || first == '-' {
        let number: Value = serde_json::from_str(s)
            .map_err(|_| ExprError::InvalidNumber(s.to_string()))?;
        if !number.is_number() {
            return Err(ExprError::InvalidNumber(s.to_string()));
        }
        return Ok(Expr::Literal(number));
    }

    parse_path(s).map(Expr::Path)
}

fn parse_path(s: &str) -> Result<PathExpr, ExprError> {
    let mut parts = s.split('.');
    let head = parts.next().unwrap_or_default();
    let mut segments: Vec<String> = Vec::new();
    for segment in parts {
        segments.push(segment.to_string());
    }

    for segment in std::iter::once(head).chain(segments.iter().map(String::as_str)) {
        if segment.is_empty() || !segment.chars().all(is_segment_char) {
            return Err(ExprError::InvalidSegment {
                expr: s.to_string(),
                segment: segment.to_string(),
            });
        }
    }

    let root = match head {
        "inputs" => PathRoot::Inputs,
        "vars" => PathRoot::Vars,
        step => PathRoot::Step(step.to_string()),
    };
    Ok(PathExpr { root, segments })
}

/// Parse a boolean condition: `<expr> <op> <expr>`, or a bare expression.
pub fn parse_condition(input: &str) -> Result<Condition, ExprError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ExprError::Empty);
    }

    if let Some((pos, len, op)) = find_operator(s) {
        let left = &s[..pos];
        let right = &s[pos + len..];
        if left.trim().is_empty() || right.trim().is_empty() {
            return Err(ExprError::MissingOperand(input.to_string()));
        }
        return Ok(Condition::Compare {
            left: parse_expr(left)?,
            op,
            right: parse_expr(right)?,
        });
    }

    Ok(Condition::Truthy(parse_expr(s)?))
}

/// Locate the first comparison operator outside any quoted span.
fn find_operator(s: &str) -> Option<(usize, usize, CmpOp)> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => {
                quote = Some(b);
                i += 1;
            }
            b'=' if bytes.get(i + 1) == Some(&b'=') => return Some((i, 2, CmpOp::Eq)),
            b'!' if bytes.get(i + 1) == Some(&b'=') => return Some((i, 2, CmpOp::Ne)),
            b'>' => {
                return if bytes.get(i + 1) == Some(&b'=') {
                    Some((i, 2, CmpOp::Ge))
                } else {
                    Some((i, 1, CmpOp::Gt))
                };
            }
            b'<' => {
                return if bytes.get(i + 1) == Some(&b'=') {
                    Some((i, 2, CmpOp::Le))
                } else {
                    Some((i, 1, CmpOp::Lt))
                };
            }
            _ => i += 1,
        }
    }
    None
}

/// Parse a string containing `${...}` interpolation spans.
pub fn parse_template(input: &str) -> Result<Template, ExprError> {
    let mut parts = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            parts.push(TemplatePart::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let Some(end) = find_unquoted(after, b'}') else {
            return Err(ExprError::UnterminatedInterpolation(input.to_string()));
        };
        parts.push(TemplatePart::Expr(parse_expr(&after[..end])?));
        rest = &after[end + 1..];
    }

    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest.to_string()));
    }
    Ok(Template { parts })
}

fn find_unquoted(s: &str, target: u8) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == target => return Some(i),
            None => {}
        }
    }
    None
}

impl ValueExpr {
    /// Parse a mapping source or assignment value. Strings containing `${`
    /// become templates (resolving to a string); everything else is a plain
    /// expression.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        if input.contains("${") {
            Ok(ValueExpr::Template(parse_template(input)?))
        } else {
            Ok(ValueExpr::Expr(parse_expr(input)?))
        }
    }
}

// ---------------------------------------------------------------------------
// Value semantics
// ---------------------------------------------------------------------------

/// Truthiness for bare-expression conditions: null, false, zero, and empty
/// strings/arrays/objects are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Compare two resolved values.
///
/// Equality coerces numbers (so `1 == 1.0`); ordering is defined for
/// number/number and string/string pairs and is false otherwise, including
/// any comparison against null.
pub fn compare_values(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => match ordering(left, right) {
            Some(ord) => match op {
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                _ => unreachable!(),
            },
            None => false,
        },
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Value::Number(l), Value::Number(r)) = (left, right) {
        return match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => l == r,
        };
    }
    left == right
}

fn ordering(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            l.as_f64()?.partial_cmp(&r.as_f64()?)
        }
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
