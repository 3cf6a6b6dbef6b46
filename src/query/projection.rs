//! Document projection.
//!
//! A projection spec mirrors the document shape. Leaves are include markers
//! (`1`, `true`, `"1"`) or exclude markers (`0`, `false`, `"0"`); nested
//! objects project subdocuments, and arrays of subdocuments are projected
//! element by element.

use crate::error::{LiveError, Result};
use crate::types::Document;
use serde_json::{Map, Value};

/// Marker carried by a projection leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Marker {
    Include,
    Exclude,
}

fn marker(value: &Value) -> Option<Marker> {
    match value {
        Value::Bool(true) => Some(Marker::Include),
        Value::Bool(false) => Some(Marker::Exclude),
        Value::Number(n) if n.as_f64() == Some(1.0) => Some(Marker::Include),
        Value::Number(n) if n.as_f64() == Some(0.0) => Some(Marker::Exclude),
        Value::String(s) if s == "1" => Some(Marker::Include),
        Value::String(s) if s == "0" => Some(Marker::Exclude),
        _ => None,
    }
}

/// Check that `spec` is a well-formed projection.
pub fn validate_projection(spec: &Value) -> Result<()> {
    let Value::Object(fields) = spec else {
        return Err(LiveError::InvalidProjection(format!(
            "projection must be an object, got {spec}"
        )));
    };
    for (key, value) in fields {
        if value.is_object() {
            validate_projection(value)?;
        } else if marker(value).is_none() {
            return Err(LiveError::InvalidProjection(format!(
                "field `{key}` must be 0/1, true/false or a nested projection"
            )));
        }
    }
    Ok(())
}

/// Apply `spec` to `document`, producing a new document.
pub fn project(document: &Document, spec: &Value) -> Result<Document> {
    validate_projection(spec)?;
    Ok(project_layer(document, spec))
}

fn project_layer(document: &Value, spec: &Value) -> Value {
    let (Value::Object(fields), Value::Object(source)) = (spec, document) else {
        // Projecting into a scalar or a missing field yields an empty layer.
        return Value::Object(Map::new());
    };

    let excluded: Vec<&String> = fields
        .iter()
        .filter(|(_, v)| marker(v) == Some(Marker::Exclude))
        .map(|(k, _)| k)
        .collect();

    let mut layer = if excluded.is_empty() {
        Map::new()
    } else {
        source
            .iter()
            .filter(|(k, _)| !excluded.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };

    for (key, rule) in fields {
        match (source.get(key), rule) {
            (Some(Value::Array(items)), Value::Object(_)) => {
                let projected = items.iter().map(|item| project_layer(item, rule)).collect();
                layer.insert(key.clone(), Value::Array(projected));
            }
            (value, Value::Object(_)) => {
                let nested = project_layer(value.unwrap_or(&Value::Null), rule);
                layer.insert(key.clone(), nested);
            }
            (Some(value), rule) if marker(rule) == Some(Marker::Include) => {
                layer.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }

    Value::Object(layer)
}
