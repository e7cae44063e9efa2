//! Conversion of dynamic row values to JSON-compatible trees.
//!
//! The conversion is total: inputs with no JSON representation are turned
//! into strings in a lossy-but-deterministic way rather than failing.
//! Bytes are decoded as UTF-8 where possible, otherwise rendered as a debug
//! representation; temporal values are formatted; non-finite floats become
//! strings (JSON numbers cannot carry NaN or infinities).

use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::types::{Row, Value};

/// Convert a single dynamic value to its JSON-compatible form.
pub fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => match serde_json::Number::from_f64(*f) {
            Some(n) => JsonValue::Number(n),
            None => {
                log::debug!("Non-finite float {} converted to string", f);
                JsonValue::String(f.to_string())
            }
        },
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => {
                log::debug!("Non-UTF-8 bytes ({} bytes) converted to debug string", b.len());
                JsonValue::String(format!("{:?}", b))
            }
        },
        Value::Time(t) => JsonValue::String(t.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::Seq(items) => JsonValue::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
    }
}

/// Convert a whole row image.
pub fn row_to_json(row: &Row) -> JsonValue {
    let mut out = JsonMap::new();
    for (column, value) in row {
        out.insert(column.clone(), to_json(value));
    }
    JsonValue::Object(out)
}

/// Convert a JSON tree back into the dynamic variant (JSON columns arrive
/// from the log already parsed).
pub fn from_json(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                // u64 above i64::MAX
                Value::Str(n.to_string())
            }
        }
        JsonValue::String(s) => Value::Str(s.clone()),
        JsonValue::Array(items) => Value::Seq(items.iter().map(from_json).collect()),
        JsonValue::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), from_json(v)))
                .collect(),
        ),
    }
}
