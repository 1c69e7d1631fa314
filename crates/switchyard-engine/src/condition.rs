use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use switchyard_core::error::{ParseError, Result, SwitchyardError};
use switchyard_core::types::Message;

type Predicate = dyn Fn(&Message) -> std::result::Result<bool, ParseError> + Send + Sync;

/// A named, pure predicate deciding whether an edge fires for a message.
///
/// `fallback` is the truth value used when the predicate cannot decide
/// (the payload does not parse, a field is missing, the predicate panics).
/// Conditions guarding the common path usually fail open (`true`); conditions
/// guarding an exceptional path usually fail closed (`false`).
#[derive(Clone)]
pub struct Condition {
    name: String,
    fallback: bool,
    predicate: Arc<Predicate>,
}

/// Outcome of evaluating a condition against one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Fired,
    Skipped,
    /// The predicate failed; `value` is the declared fallback.
    Fallback { value: bool, reason: String },
}

impl Evaluation {
    pub fn fires(&self) -> bool {
        match self {
            Self::Fired => true,
            Self::Skipped => false,
            Self::Fallback { value, .. } => *value,
        }
    }
}

impl Condition {
    /// Create a condition from a raw predicate over the message.
    pub fn new<F>(name: impl Into<String>, fallback: bool, predicate: F) -> Self
    where
        F: Fn(&Message) -> std::result::Result<bool, ParseError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fallback,
            predicate: Arc::new(predicate),
        }
    }

    /// Create a condition over a typed view of the payload.
    ///
    /// Parsing is done first; if it fails the fallback applies and `decide`
    /// is never called.
    pub fn on<T, F>(name: impl Into<String>, fallback: bool, decide: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::new(name, fallback, move |msg| msg.parse::<T>().map(|value| decide(&value)))
    }

    /// Compile a condition from an expression such as `estimated_budget < 50000`.
    ///
    /// Supported: `path OP literal` where `path` is a dotted JSON path,
    /// `OP` is one of `==`, `!=`, `>=`, `<=`, `>`, `<`, `contains`, and the
    /// literal is a quoted string, a number, or `true`/`false`.
    pub fn expr(expr: &str, fallback: bool) -> Result<Self> {
        let compiled = Expr::compile(expr)?;
        Ok(Self::new(expr.trim(), fallback, move |msg| compiled.evaluate(msg)))
    }

    /// Replace the condition's display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fallback(&self) -> bool {
        self.fallback
    }

    /// Evaluate against a message. Never panics and never errors.
    pub fn evaluate(&self, message: &Message) -> Evaluation {
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(message))) {
            Ok(Ok(true)) => Evaluation::Fired,
            Ok(Ok(false)) => Evaluation::Skipped,
            Ok(Err(e)) => Evaluation::Fallback {
                value: self.fallback,
                reason: e.to_string(),
            },
            Err(panic) => Evaluation::Fallback {
                value: self.fallback,
                reason: format!("condition panicked: {}", panic_message(panic.as_ref())),
            },
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.name)
            .field("fallback", &self.fallback)
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

/// A compiled `path OP literal` expression.
#[derive(Debug, Clone)]
struct Expr {
    path: Vec<String>,
    op: Op,
    literal: Literal,
}

fn expr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*(==|!=|>=|<=|>|<|contains\b)\s*(.+?)\s*$",
        )
        .expect("Failed to compile condition expression pattern")
    })
}

impl Expr {
    fn compile(expr: &str) -> Result<Self> {
        let caps = expr_pattern().captures(expr).ok_or_else(|| {
            SwitchyardError::InvalidCondition(format!("cannot parse expression '{}'", expr))
        })?;

        let path = caps[1].split('.').map(str::to_string).collect();
        let op = match &caps[2] {
            "==" => Op::Eq,
            "!=" => Op::Ne,
            ">=" => Op::Ge,
            "<=" => Op::Le,
            ">" => Op::Gt,
            "<" => Op::Lt,
            _ => Op::Contains,
        };
        let literal = parse_literal(&caps[3]).ok_or_else(|| {
            SwitchyardError::InvalidCondition(format!(
                "invalid literal '{}' in expression '{}'",
                &caps[3], expr
            ))
        })?;

        match (op, &literal) {
            (Op::Ge | Op::Le | Op::Gt | Op::Lt, Literal::Num(_)) => {}
            (Op::Ge | Op::Le | Op::Gt | Op::Lt, _) => {
                return Err(SwitchyardError::InvalidCondition(format!(
                    "ordering comparison needs a numeric literal: '{}'",
                    expr
                )));
            }
            (Op::Contains, Literal::Str(_)) => {}
            (Op::Contains, _) => {
                return Err(SwitchyardError::InvalidCondition(format!(
                    "contains needs a string literal: '{}'",
                    expr
                )));
            }
            _ => {}
        }

        Ok(Self { path, op, literal })
    }

    fn evaluate(&self, message: &Message) -> std::result::Result<bool, ParseError> {
        let root = message.payload().to_json()?;
        let mut value = &root;
        for key in &self.path {
            value = value
                .get(key)
                .ok_or_else(|| ParseError::new(format!("field '{}' not found", self.path.join("."))))?;
        }

        match (self.op, &self.literal) {
            (Op::Contains, Literal::Str(needle)) => match value {
                Value::String(s) => Ok(s.contains(needle.as_str())),
                Value::Array(items) => Ok(items.iter().any(|v| v.as_str() == Some(needle))),
                other => Err(type_mismatch(&self.path, "string or array", other)),
            },
            (Op::Eq | Op::Ne, literal) => {
                let equal = literal_equals(literal, value)
                    .ok_or_else(|| type_mismatch(&self.path, literal.kind(), value))?;
                Ok(if self.op == Op::Eq { equal } else { !equal })
            }
            (op, Literal::Num(rhs)) => {
                let lhs = value
                    .as_f64()
                    .ok_or_else(|| type_mismatch(&self.path, "number", value))?;
                Ok(match op {
                    Op::Ge => lhs >= *rhs,
                    Op::Le => lhs <= *rhs,
                    Op::Gt => lhs > *rhs,
                    _ => lhs < *rhs,
                })
            }
            // Rejected by compile()
            _ => Err(ParseError::new("unsupported comparison")),
        }
    }
}

impl Literal {
    fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Num(_) => "number",
            Self::Bool(_) => "bool",
        }
    }
}

fn parse_literal(raw: &str) -> Option<Literal> {
    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some(Literal::Str(raw[1..raw.len() - 1].to_string()));
        }
    }
    match raw {
        "true" => Some(Literal::Bool(true)),
        "false" => Some(Literal::Bool(false)),
        _ => raw.parse::<f64>().ok().filter(|n| n.is_finite()).map(Literal::Num),
    }
}

/// `None` when the JSON value has a different type than the literal.
fn literal_equals(literal: &Literal, value: &Value) -> Option<bool> {
    match (literal, value) {
        (Literal::Str(s), Value::String(v)) => Some(s == v),
        (Literal::Num(n), Value::Number(v)) => v.as_f64().map(|v| v == *n),
        (Literal::Bool(b), Value::Bool(v)) => Some(b == v),
        _ => None,
    }
}

fn type_mismatch(path: &[String], expected: &str, found: &Value) -> ParseError {
    ParseError::new(format!(
        "field '{}' is not a {} (found {})",
        path.join("."),
        expected,
        found
    ))
}
