//! Structural diff between two snapshots of an entity graph.
//!
//! Entities enter as `serde_json::Value` trees (whatever the record store
//! serializes), so the comparison works for any entity type without
//! runtime type inspection. Output is one human-readable change per line,
//! each prefixed with its field path.

use chrono::DateTime;
use serde_json::Value;

/// Recursion stops here; deeper structure is reported, not walked.
pub const MAX_RECURSION_DEPTH: usize = 10;

/// Store-managed metadata fields whose churn is not a real change.
const VOLATILE_FIELDS: [&str; 2] = ["version", "timestamp"];

/// Diff two entity snapshots. Empty string means no difference.
pub fn diff_entities(old: Option<&Value>, new: Option<&Value>) -> String {
    diff_values(old, new, "", 0)
}

fn diff_values(old: Option<&Value>, new: Option<&Value>, path: &str, depth: usize) -> String {
    if depth > MAX_RECURSION_DEPTH {
        return format!("[{}: recursion depth limit reached]", path);
    }

    let old = old.filter(|v| !v.is_null());
    let new = new.filter(|v| !v.is_null());

    match (old, new) {
        (None, None) => String::new(),
        (None, Some(new)) => format!("{}: added {}", path, value_kind(new)),
        (Some(old), None) => format!("{}: removed {}", path, value_kind(old)),
        (Some(old), Some(new)) => match (old, new) {
            (Value::Array(old_items), Value::Array(new_items)) => {
                diff_sequences(old_items, new_items, path, depth)
            }
            (Value::Object(old_fields), Value::Object(new_fields)) => {
                diff_composites(old_fields, new_fields, path, depth)
            }
            _ => {
                if old == new {
                    String::new()
                } else {
                    format!("{}: {} → {}", path, format_value(old), format_value(new))
                }
            }
        },
    }
}

fn diff_sequences(old: &[Value], new: &[Value], path: &str, depth: usize) -> String {
    let mut changes = Vec::new();

    if old.len() != new.len() {
        changes.push(format!("{}.count: {} → {}", path, old.len(), new.len()));
    }

    let count = old.len().max(new.len());
    for i in 0..count {
        let element_path = format!("{}[{}]", path, i);
        let diff = diff_values(old.get(i), new.get(i), &element_path, depth + 1);
        if !diff.trim().is_empty() {
            changes.push(diff);
        }
    }

    changes.join("\n")
}

fn diff_composites(
    old: &serde_json::Map<String, Value>,
    new: &serde_json::Map<String, Value>,
    path: &str,
    depth: usize,
) -> String {
    let mut changes = Vec::new();

    let mut keys: Vec<&String> = old.keys().collect();
    for key in new.keys() {
        if !old.contains_key(key) {
            keys.push(key);
        }
    }

    for key in keys {
        if VOLATILE_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(key)) {
            continue;
        }

        let field_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };

        let diff = diff_values(old.get(key), new.get(key), &field_path, depth + 1);
        if !diff.trim().is_empty() {
            changes.push(diff);
        }
    }

    changes.join("\n")
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "collection",
        Value::Object(_) => "object",
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "[null]".to_string(),
        Value::String(s) => {
            // Timestamps render as plain dates; other strings are quoted.
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                dt.format("%Y-%m-%d").to_string()
            } else {
                format!("'{}'", s)
            }
        }
        other => other.to_string(),
    }
}
