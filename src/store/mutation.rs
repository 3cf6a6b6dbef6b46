//! Field-level mutation descriptors (`$set`, `$unset`, `$inc`).

use crate::error::{LiveError, Result};
use crate::types::{Document, ID_FIELD};
use serde_json::{Map, Number, Value};

/// Check that `mutation` only uses supported operators with object operands.
pub fn validate_mutation(mutation: &Value) -> Result<()> {
    let Value::Object(ops) = mutation else {
        return Err(LiveError::InvalidMutation(format!(
            "mutation must be an object, got {mutation}"
        )));
    };
    if ops.is_empty() {
        return Err(LiveError::InvalidMutation("mutation is empty".into()));
    }
    for (op, fields) in ops {
        if !matches!(op.as_str(), "$set" | "$unset" | "$inc") {
            return Err(LiveError::InvalidMutation(format!("unsupported operator `{op}`")));
        }
        let Value::Object(fields) = fields else {
            return Err(LiveError::InvalidMutation(format!("{op} expects an object")));
        };
        for (path, value) in fields {
            if path == ID_FIELD {
                return Err(LiveError::InvalidMutation("`_id` is immutable".into()));
            }
            if op == "$inc" && !value.is_number() {
                return Err(LiveError::InvalidMutation(format!(
                    "$inc on `{path}` expects a number"
                )));
            }
        }
    }
    Ok(())
}

/// Apply `mutation` to `document` in place.
pub fn apply_mutation(document: &mut Document, mutation: &Value) -> Result<()> {
    validate_mutation(mutation)?;
    let Value::Object(ops) = mutation else {
        return Ok(());
    };

    for (op, fields) in ops {
        let Value::Object(fields) = fields else {
            continue;
        };
        for (path, value) in fields {
            match op.as_str() {
                "$set" => *slot(document, path)? = value.clone(),
                "$unset" => unset(document, path),
                "$inc" => {
                    let target = slot(document, path)?;
                    *target = increment(target, value, path)?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Mutable reference to the value at `path`, creating intermediate objects.
fn slot<'a>(document: &'a mut Value, path: &str) -> Result<&'a mut Value> {
    let mut current = document;
    for segment in path.split('.') {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => {
                return Err(LiveError::InvalidMutation(format!(
                    "cannot set `{path}`: `{segment}` is inside a non-object value"
                )))
            }
        };
    }
    Ok(current)
}

fn unset(document: &mut Value, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let target = match parent {
        Some(parent) => parent
            .split('.')
            .try_fold(document, |current, segment| current.get_mut(segment)),
        None => Some(document),
    };
    if let Some(Value::Object(map)) = target {
        map.remove(leaf);
    }
}

fn increment(current: &Value, by: &Value, path: &str) -> Result<Value> {
    let number = match (current, by) {
        (Value::Null, by) => return Ok(by.clone()),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Number::from(x.saturating_add(y)),
            _ => {
                let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
                Number::from_f64(sum).ok_or_else(|| {
                    LiveError::InvalidMutation(format!("$inc on `{path}` is not finite"))
                })?
            }
        },
        _ => {
            return Err(LiveError::InvalidMutation(format!(
                "$inc on `{path}` targets a non-numeric value"
            )))
        }
    };
    Ok(Value::Number(number))
}
