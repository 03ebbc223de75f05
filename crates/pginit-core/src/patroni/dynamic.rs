//! Safe navigation over untyped Patroni configuration.
//!
//! User-supplied configuration is arbitrary JSON. Every helper returns
//! `None` when the tree does not have the expected shape instead of
//! failing, so a malformed section is ignored rather than fatal.

use serde_json::{Map, Value};

/// Walks nested objects along `path`.
pub fn at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.as_object()?.get(*key))
}

/// Returns `value` as an object.
pub fn object(value: &Value) -> Option<&Map<String, Value>> {
    value.as_object()
}

pub fn object_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Map<String, Value>> {
    at(value, path)?.as_object()
}

pub fn list_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a [Value]> {
    at(value, path)?.as_array().map(Vec::as_slice)
}

pub fn string_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    at(value, path)?.as_str()
}

pub fn u64_at(value: &Value, path: &[&str]) -> Option<u64> {
    at(value, path)?.as_u64()
}

/// Renders a scalar the way PostgreSQL expects a parameter value.
///
/// Strings are returned verbatim, numbers and booleans in their JSON
/// spelling. Null, arrays, and objects have no parameter form.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
