//! Predicate evaluation for document filters.
//!
//! The supported filter language is a subset of the usual document query
//! language:
//!
//! - `{field: value}` equality; an array field matches if any element equals
//! - dotted paths (`{"address.city": "Oslo"}`)
//! - comparison operators `$eq $ne $gt $gte $lt $lte $in $nin $exists`
//! - logical operators `$and $or $nor` at any object level
//!
//! Anything else is rejected with [`LiveError::InvalidFilter`].

use crate::error::{LiveError, Result};
use crate::types::Document;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Decides which documents satisfy a filter.
pub trait PredicateEvaluator: Send + Sync {
    /// Whether a single document matches `filter`.
    fn matches(&self, filter: &Value, document: &Document) -> Result<bool>;

    /// Check a filter for well-formedness without evaluating it.
    fn validate(&self, filter: &Value) -> Result<()>;

    /// The subset of `documents` matching `filter`, in input order.
    fn matching<'a>(&self, filter: &Value, documents: &'a [Document]) -> Result<Vec<&'a Document>> {
        let mut out = Vec::new();
        for doc in documents {
            if self.matches(filter, doc)? {
                out.push(doc);
            }
        }
        Ok(out)
    }
}

/// The built-in evaluator.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryMatcher;

impl PredicateEvaluator for QueryMatcher {
    fn matches(&self, filter: &Value, document: &Document) -> Result<bool> {
        let filter = as_filter_object(filter)?;
        match_object(filter, document)
    }

    fn validate(&self, filter: &Value) -> Result<()> {
        // Evaluating against an empty document visits every clause.
        self.matches(filter, &Value::Object(Map::new())).map(|_| ())
    }
}

fn as_filter_object(filter: &Value) -> Result<&Map<String, Value>> {
    match filter {
        Value::Object(map) => Ok(map),
        Value::Null => Err(LiveError::InvalidFilter("filter is null".into())),
        other => Err(LiveError::InvalidFilter(format!(
            "filter must be an object, got {other}"
        ))),
    }
}

fn match_object(filter: &Map<String, Value>, document: &Document) -> Result<bool> {
    // Every clause is evaluated (no short circuit) so that malformed
    // clauses are reported regardless of document content.
    let mut all = true;
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => logical(condition, document, key)?.iter().all(|m| *m),
            "$or" => logical(condition, document, key)?.iter().any(|m| *m),
            "$nor" => !logical(condition, document, key)?.iter().any(|m| *m),
            op if op.starts_with('$') => {
                return Err(LiveError::InvalidFilter(format!(
                    "unknown top-level operator {op}"
                )))
            }
            path => match_condition(lookup(document, path), condition)?,
        };
        all &= ok;
    }
    Ok(all)
}

fn logical(clauses: &Value, document: &Document, op: &str) -> Result<Vec<bool>> {
    let Value::Array(clauses) = clauses else {
        return Err(LiveError::InvalidFilter(format!("{op} expects an array")));
    };
    if clauses.is_empty() {
        return Err(LiveError::InvalidFilter(format!("{op} expects a non-empty array")));
    }
    clauses
        .iter()
        .map(|clause| match_object(as_filter_object(clause)?, document))
        .collect()
}

fn is_operator_object(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn match_condition(value: Option<&Value>, condition: &Value) -> Result<bool> {
    if !is_operator_object(condition) {
        return Ok(equals(value, condition));
    }
    let Value::Object(ops) = condition else {
        return Ok(false);
    };

    let mut all = true;
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            "$gt" => compare(value, operand, |o| o == Ordering::Greater),
            "$gte" => compare(value, operand, |o| o != Ordering::Less),
            "$lt" => compare(value, operand, |o| o == Ordering::Less),
            "$lte" => compare(value, operand, |o| o != Ordering::Greater),
            "$in" => in_list(value, operand, op)?,
            "$nin" => !in_list(value, operand, op)?,
            "$exists" => match operand {
                Value::Bool(expected) => value.is_some() == *expected,
                _ => return Err(LiveError::InvalidFilter("$exists expects a boolean".into())),
            },
            other => {
                return Err(LiveError::InvalidFilter(format!("unknown operator {other}")));
            }
        };
        all &= ok;
    }
    Ok(all)
}

fn in_list(value: Option<&Value>, operand: &Value, op: &str) -> Result<bool> {
    let Value::Array(candidates) = operand else {
        return Err(LiveError::InvalidFilter(format!("{op} expects an array")));
    };
    Ok(candidates.iter().any(|c| equals(value, c)))
}

/// Equality with array element matching. A missing field equals `null`.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(v) if v == expected => true,
        Some(Value::Array(items)) => items.iter().any(|item| item == expected),
        Some(_) => false,
    }
}

/// Ordered comparison. Only values of the same type class compare.
fn compare(value: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Value| type_rank(v) == type_rank(operand) && accept(compare_values(v, operand));
    match value {
        None => false,
        Some(Value::Array(items)) if !operand.is_array() => items.iter().any(check),
        Some(v) => check(v),
    }
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values, used for comparisons and sorting.
///
/// Values of different types order by type class:
/// null < numbers < strings < objects < arrays < booleans.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| compare_values(l, r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| compare_values(lv, rv)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
