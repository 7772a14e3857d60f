//! Condition operator semantics.
//!
//! Operators never fail. An absent subject never matches, negated operators
//! included. Values that cannot be compared do not match.

use std::cmp::Ordering;
use std::sync::Arc;

use moka::sync::Cache;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::rules::Operator;

/// Compiled regex patterns shared across evaluations.
#[derive(Clone)]
pub struct RegexCache {
    compiled: Cache<String, Arc<Regex>>,
}

impl RegexCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            compiled: Cache::new(capacity),
        }
    }

    pub fn get(&self, pattern: &str) -> Option<Arc<Regex>> {
        if let Some(regex) = self.compiled.get(pattern) {
            return Some(regex);
        }

        match Regex::new(pattern) {
            Ok(regex) => {
                let regex = Arc::new(regex);
                self.compiled.insert(pattern.to_string(), regex.clone());
                Some(regex)
            }
            Err(e) => {
                warn!(pattern = %pattern, error = ?e, "Regex failed to compile, treating as no match");
                None
            }
        }
    }
}

impl Default for RegexCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub fn apply(
    operator: Operator,
    subject: Option<&Value>,
    operand: &Value,
    regexes: &RegexCache,
) -> bool {
    let Some(subject) = subject else {
        return false;
    };

    match operator {
        Operator::Eq => values_equal(subject, operand),
        Operator::Ne => !values_equal(subject, operand),
        Operator::Gt => compare(subject, operand) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            compare(subject, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => compare(subject, operand) == Some(Ordering::Less),
        Operator::Lte => matches!(
            compare(subject, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::In => member_of(subject, operand),
        Operator::NotIn => operand.is_array() && !member_of(subject, operand),
        Operator::Contains => contains(subject, operand),
        Operator::NotContains => !contains(subject, operand),
        Operator::Regex => regex_match(subject, operand, regexes) == Some(true),
        Operator::NotRegex => regex_match(subject, operand, regexes) == Some(false),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(x.cmp(y)),
        },
        (Value::Number(_) | Value::String(_), Value::Number(_) | Value::String(_)) => {
            as_number(a)?.partial_cmp(&as_number(b)?)
        }
        _ => None,
    }
}

fn member_of(subject: &Value, operand: &Value) -> bool {
    operand
        .as_array()
        .is_some_and(|items| items.iter().any(|item| values_equal(subject, item)))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn contains(subject: &Value, operand: &Value) -> bool {
    match subject {
        Value::Array(items) => items.iter().any(|item| values_equal(item, operand)),
        Value::Object(_) => false,
        Value::String(text) => text.contains(render(operand).as_str()),
        scalar => render(scalar).contains(render(operand).as_str()),
    }
}

fn regex_match(subject: &Value, operand: &Value, regexes: &RegexCache) -> Option<bool> {
    let pattern = operand.as_str()?;
    if matches!(subject, Value::Array(_) | Value::Object(_)) {
        return None;
    }
    let regex = regexes.get(pattern)?;
    Some(regex.is_match(&render(subject)))
}
