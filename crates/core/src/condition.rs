//! Predicate trees evaluated by Choice nodes against a request's parameters.
//!
//! A [`Condition`] is either a connective (`And`, `Or`, `Not`) over `sub`
//! conditions, or a leaf carrying one or two `operands`. The parallel `find`
//! array marks which operands are references into the input mapping rather
//! than literals; an empty `find` means every operand is a literal.

use crate::error::{Result, WorkflowError};
use crate::types::Params;
use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Operator of a condition node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CondOp {
    And,
    Or,
    Not,
    Const,
    Eq,
    Diff,
    Greater,
    Smaller,
    IsEmpty,
    IsNull,
    IsPresent,
    IsNumeric,
    IsString,
    IsBoolean,
    IsTimestamp,
    StringMatches,
}

impl CondOp {
    fn operand_arity(self) -> usize {
        match self {
            Self::And | Self::Or | Self::Not => 0,
            Self::Eq | Self::Diff | Self::Greater | Self::Smaller | Self::StringMatches => 2,
            Self::Const
            | Self::IsEmpty
            | Self::IsNull
            | Self::IsPresent
            | Self::IsNumeric
            | Self::IsString
            | Self::IsBoolean
            | Self::IsTimestamp => 1,
        }
    }
}

impl std::fmt::Display for CondOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::And => "And",
            Self::Or => "Or",
            Self::Not => "Not",
            Self::Const => "Const",
            Self::Eq => "Eq",
            Self::Diff => "Diff",
            Self::Greater => "Greater",
            Self::Smaller => "Smaller",
            Self::IsEmpty => "IsEmpty",
            Self::IsNull => "IsNull",
            Self::IsPresent => "IsPresent",
            Self::IsNumeric => "IsNumeric",
            Self::IsString => "IsString",
            Self::IsBoolean => "IsBoolean",
            Self::IsTimestamp => "IsTimestamp",
            Self::StringMatches => "StringMatches",
        };
        f.write_str(name)
    }
}

/// An operand as supplied to the condition constructors
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// Name of an entry of the input mapping. A `$.` prefix and dotted
    /// segments address nested objects.
    Ref(String),
}

impl Operand {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self::Ref(name.into())
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Self::Literal(Value::Bool(value))
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Self::Literal(Value::String(value.to_string()))
    }
}

/// A node of a predicate tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub op: CondOp,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operands: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub find: Vec<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub: Vec<Condition>,
}

impl Condition {
    fn leaf(op: CondOp, operands: Vec<Operand>) -> Self {
        let mut values = Vec::with_capacity(operands.len());
        let mut find = Vec::with_capacity(operands.len());
        for operand in operands {
            match operand {
                Operand::Literal(v) => {
                    values.push(v);
                    find.push(false);
                }
                Operand::Ref(name) => {
                    values.push(Value::String(name));
                    find.push(true);
                }
            }
        }
        Self {
            op,
            operands: values,
            find,
            sub: Vec::new(),
        }
    }

    fn connective(op: CondOp, sub: Vec<Condition>) -> Self {
        Self {
            op,
            operands: Vec::new(),
            find: Vec::new(),
            sub,
        }
    }

    pub fn constant(value: bool) -> Self {
        Self::leaf(CondOp::Const, vec![Operand::from(value)])
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::connective(CondOp::And, conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::connective(CondOp::Or, conditions)
    }

    pub fn not(condition: Condition) -> Self {
        Self::connective(CondOp::Not, vec![condition])
    }

    pub fn eq(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::Eq, vec![a.into(), b.into()])
    }

    pub fn diff(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::Diff, vec![a.into(), b.into()])
    }

    pub fn greater(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::Greater, vec![a.into(), b.into()])
    }

    pub fn smaller(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::Smaller, vec![a.into(), b.into()])
    }

    pub fn is_empty(a: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::IsEmpty, vec![a.into()])
    }

    pub fn is_null(a: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::IsNull, vec![a.into()])
    }

    pub fn is_present(a: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::IsPresent, vec![a.into()])
    }

    pub fn is_numeric(a: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::IsNumeric, vec![a.into()])
    }

    pub fn is_string(a: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::IsString, vec![a.into()])
    }

    pub fn is_boolean(a: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::IsBoolean, vec![a.into()])
    }

    pub fn is_timestamp(a: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::IsTimestamp, vec![a.into()])
    }

    pub fn string_matches(value: impl Into<Operand>, pattern: impl Into<Operand>) -> Self {
        Self::leaf(CondOp::StringMatches, vec![value.into(), pattern.into()])
    }

    /// Evaluate the tree against `input`.
    pub fn test(&self, input: &Params) -> Result<bool> {
        self.check_arity()?;

        match self.op {
            CondOp::And => {
                for sub in &self.sub {
                    if !sub.test(input)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CondOp::Or => {
                for sub in &self.sub {
                    if sub.test(input)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            CondOp::Not => Ok(!self.sub[0].test(input)?),
            CondOp::Const => {
                let value = self.resolve(0, input);
                as_bool(&value).ok_or_else(|| WorkflowError::InvalidOperand {
                    op: self.op.to_string(),
                    reason: format!("{} is not convertible to a boolean", value),
                })
            }
            CondOp::Eq => Ok(equality(&self.resolve(0, input), &self.resolve(1, input)) == Some(true)),
            CondOp::Diff => {
                Ok(equality(&self.resolve(0, input), &self.resolve(1, input)) == Some(false))
            }
            CondOp::Greater => Ok(ordering(&self.resolve(0, input), &self.resolve(1, input))
                == Some(Ordering::Greater)),
            CondOp::Smaller => Ok(ordering(&self.resolve(0, input), &self.resolve(1, input))
                == Some(Ordering::Less)),
            CondOp::IsEmpty => Ok(match self.resolve(0, input) {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            }),
            CondOp::IsNull => Ok(self.resolve(0, input).is_null()),
            CondOp::IsPresent => Ok(!self.resolve(0, input).is_null()),
            CondOp::IsNumeric => Ok(self.resolve(0, input).is_number()),
            CondOp::IsString => Ok(self.resolve(0, input).is_string()),
            CondOp::IsBoolean => Ok(self.resolve(0, input).is_boolean()),
            CondOp::IsTimestamp => Ok(matches!(
                self.resolve(0, input),
                Value::String(ref s) if parse_timestamp(s).is_some()
            )),
            CondOp::StringMatches => {
                let pattern = match self.resolve(1, input) {
                    Value::String(p) => p,
                    other => {
                        return Err(WorkflowError::InvalidOperand {
                            op: self.op.to_string(),
                            reason: format!("pattern {} is not a string", other),
                        })
                    }
                };
                let regex = glob_to_regex(&pattern)?;
                Ok(match self.resolve(0, input) {
                    Value::String(s) => regex.is_match(&s),
                    _ => false,
                })
            }
        }
    }

    fn check_arity(&self) -> Result<()> {
        let expected = self.op.operand_arity();
        match self.op {
            CondOp::Not if self.sub.len() != 1 => {
                return Err(WorkflowError::Arity {
                    op: self.op.to_string(),
                    expected: "exactly one sub-condition".to_string(),
                    actual: self.sub.len(),
                })
            }
            CondOp::And | CondOp::Or if self.sub.is_empty() => {
                return Err(WorkflowError::Arity {
                    op: self.op.to_string(),
                    expected: "at least one sub-condition".to_string(),
                    actual: 0,
                })
            }
            CondOp::And | CondOp::Or | CondOp::Not => {}
            _ if !self.sub.is_empty() => {
                return Err(WorkflowError::Arity {
                    op: self.op.to_string(),
                    expected: "no sub-conditions".to_string(),
                    actual: self.sub.len(),
                })
            }
            _ => {}
        }

        if self.operands.len() != expected {
            return Err(WorkflowError::Arity {
                op: self.op.to_string(),
                expected: format!("{} operand(s)", expected),
                actual: self.operands.len(),
            });
        }
        if !self.find.is_empty() && self.find.len() != self.operands.len() {
            return Err(WorkflowError::Arity {
                op: self.op.to_string(),
                expected: format!("{} reference flag(s)", self.operands.len()),
                actual: self.find.len(),
            });
        }
        Ok(())
    }

    /// Literal operands are returned as-is, references are looked up in
    /// `input` and resolve to `null` when missing.
    fn resolve(&self, index: usize, input: &Params) -> Value {
        let operand = &self.operands[index];
        let is_ref = self.find.get(index).copied().unwrap_or(false);
        if !is_ref {
            return operand.clone();
        }
        match operand {
            Value::String(name) => lookup(input, name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

fn lookup<'a>(input: &'a Params, name: &str) -> Option<&'a Value> {
    if let Some(v) = input.get(name) {
        return Some(v);
    }
    let path = name.strip_prefix("$.").unwrap_or(name);
    let mut segments = path.split('.');
    let mut current = input.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse::<bool>().ok(),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// A numeric-looking string becomes a number, anything else is unchanged.
fn normalize(value: &Value) -> Value {
    if let Value::String(s) = value {
        if let Ok(n) = s.trim().parse::<f64>() {
            if let Some(number) = serde_json::Number::from_f64(n) {
                return Value::Number(number);
            }
        }
    }
    value.clone()
}

fn timestamp_of(value: &Value) -> Option<DateTime<FixedOffset>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

/// `None` when the operands cannot be compared, which every comparison
/// operator reports as false.
fn equality(a: &Value, b: &Value) -> Option<bool> {
    match (timestamp_of(a), timestamp_of(b)) {
        (Some(ta), Some(tb)) => return Some(ta == tb),
        (Some(_), None) | (None, Some(_)) => return None,
        (None, None) => {}
    }

    let (a, b) = (normalize(a), normalize(b));
    match (&a, &b) {
        (Value::Number(x), Value::Number(y)) => Some(x.as_f64() == y.as_f64()),
        _ => Some(a == b),
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (timestamp_of(a), timestamp_of(b)) {
        (Some(ta), Some(tb)) => return Some(ta.cmp(&tb)),
        (Some(_), None) | (None, Some(_)) => return None,
        (None, None) => {}
    }

    match (normalize(a), normalize(b)) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(&y)),
        _ => None,
    }
}

/// Translate a glob-style pattern into an anchored regex. `*` matches any
/// run of characters, `\*` is a literal star and `\\` a literal backslash.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?s)^");

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('*') => expr.push_str(r"\*"),
                Some('\\') => expr.push_str(r"\\"),
                _ => {
                    return Err(WorkflowError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: "a backslash must escape '*' or '\\'".to_string(),
                    })
                }
            },
            '*' => expr.push_str(".*"),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| WorkflowError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_string_matches_glob() {
        let empty = Params::new();
        assert!(Condition::string_matches("foo23.log", "foo*.log")
            .test(&empty)
            .unwrap());
        assert!(!Condition::string_matches("test.log", "foo*.log")
            .test(&empty)
            .unwrap());
        // The dot is literal, not a regex wildcard.
        assert!(!Condition::string_matches("foo23xlog", "foo*.log")
            .test(&empty)
            .unwrap());
    }

    #[test]
    fn test_string_matches_escapes() {
        let empty = Params::new();
        assert!(Condition::string_matches("a*b", r"a\*b").test(&empty).unwrap());
        assert!(!Condition::string_matches("axxb", r"a\*b").test(&empty).unwrap());
        assert!(Condition::string_matches(r"dir\file", r"dir\\*").test(&empty).unwrap());

        let err = Condition::string_matches("abc", r"a\bc").test(&empty).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidPattern { .. }));
    }

    #[test]
    fn test_eq_is_representation_sensitive() {
        let empty = Params::new();
        assert!(Condition::eq(1i64, 1.0f64).test(&empty).unwrap());
        assert!(!Condition::eq("true", true).test(&empty).unwrap());
        assert!(Condition::eq("42", 42i64).test(&empty).unwrap());
        assert!(Condition::diff(1i64, 2i64).test(&empty).unwrap());
    }

    #[test]
    fn test_references_resolve_against_input() {
        let input = params(json!({"input": 5, "user": {"name": "ada"}}));

        assert!(Condition::greater(Operand::path("input"), 3i64)
            .test(&input)
            .unwrap());
        assert!(Condition::smaller(Operand::path("$.input"), "10")
            .test(&input)
            .unwrap());
        assert!(Condition::eq(Operand::path("$.user.name"), "ada")
            .test(&input)
            .unwrap());
    }

    #[test]
    fn test_missing_reference_is_null() {
        let input = params(json!({"present": null, "value": 1}));

        assert!(Condition::is_null(Operand::path("missing")).test(&input).unwrap());
        assert!(!Condition::is_present(Operand::path("missing")).test(&input).unwrap());
        assert!(Condition::is_present(Operand::path("value")).test(&input).unwrap());
        assert!(!Condition::greater(Operand::path("missing"), 0i64)
            .test(&input)
            .unwrap());
    }

    #[test]
    fn test_timestamp_comparisons() {
        let empty = Params::new();
        let earlier = "2024-01-01T00:00:00Z";
        let later = "2024-01-01T02:00:00+01:00";

        assert!(Condition::smaller(earlier, later).test(&empty).unwrap());
        assert!(Condition::eq("2024-01-01T01:00:00+01:00", earlier)
            .test(&empty)
            .unwrap());
        // Mixed timestamp and non-timestamp is false for every comparison.
        assert!(!Condition::eq(earlier, "hello").test(&empty).unwrap());
        assert!(!Condition::diff(earlier, "hello").test(&empty).unwrap());
        assert!(Condition::is_timestamp(earlier).test(&empty).unwrap());
    }

    #[test]
    fn test_type_checks() {
        let input = params(json!({"n": 3.5, "s": "x", "b": false, "list": []}));

        assert!(Condition::is_numeric(Operand::path("n")).test(&input).unwrap());
        assert!(Condition::is_string(Operand::path("s")).test(&input).unwrap());
        assert!(Condition::is_boolean(Operand::path("b")).test(&input).unwrap());
        assert!(Condition::is_empty(Operand::path("list")).test(&input).unwrap());
        assert!(!Condition::is_empty(Operand::path("s")).test(&input).unwrap());
    }

    #[test]
    fn test_connectives() {
        let empty = Params::new();
        let t = Condition::constant(true);
        let f = Condition::constant(false);

        assert!(!Condition::and(vec![t.clone(), f.clone()]).test(&empty).unwrap());
        assert!(Condition::or(vec![f.clone(), t.clone()]).test(&empty).unwrap());
        assert!(Condition::not(f).test(&empty).unwrap());
    }

    #[test]
    fn test_malformed_conditions_are_errors() {
        let empty = Params::new();

        let bad_not = Condition {
            op: CondOp::Not,
            operands: vec![],
            find: vec![],
            sub: vec![Condition::constant(true), Condition::constant(false)],
        };
        assert!(matches!(bad_not.test(&empty), Err(WorkflowError::Arity { .. })));

        let bad_eq = Condition {
            op: CondOp::Eq,
            operands: vec![json!(1)],
            find: vec![false],
            sub: vec![],
        };
        assert!(matches!(bad_eq.test(&empty), Err(WorkflowError::Arity { .. })));

        let bad_const = Condition {
            op: CondOp::Const,
            operands: vec![json!(3)],
            find: vec![],
            sub: vec![],
        };
        assert!(matches!(
            bad_const.test(&empty),
            Err(WorkflowError::InvalidOperand { .. })
        ));
    }

    #[test]
    fn test_condition_json_shape() {
        let cond = Condition::eq(Operand::path("input"), 1i64);
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(
            json,
            json!({"op": "eq", "operands": ["input", 1], "find": [true, false]})
        );
        let back: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(back, cond);
    }
}
