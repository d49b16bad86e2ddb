//! Structural diffing of JSON values
//!
//! Used by replay to decide whether an upstream answers differently than it
//! did when a call was first recorded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Path reported for a change at the top level
pub const ROOT_PATH: &str = "(root)";

/// Kind of change at a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

/// A single difference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffChange {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// Ordered list of differences between two values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub changed: bool,
    pub changes: Vec<DiffChange>,
}

/// Compare `original` against `replay`
pub fn diff_json(original: &Value, replay: &Value) -> DiffResult {
    let mut changes = Vec::new();
    compare(Some(original), Some(replay), "", &mut changes);
    DiffResult {
        changed: !changes.is_empty(),
        changes,
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        ROOT_PATH.to_string()
    } else {
        path.to_string()
    }
}

fn index_path(path: &str, index: usize) -> String {
    format!("{path}[{index}]")
}

fn key_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Value equality with numbers compared numerically (`20 == 20.0`)
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| same_value(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| same_value(v, other)))
        }
        _ => a == b,
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn compare(original: Option<&Value>, replay: Option<&Value>, path: &str, out: &mut Vec<DiffChange>) {
    let (old, new) = match (present(original), present(replay)) {
        (None, None) => return,
        (None, Some(new)) => {
            out.push(DiffChange {
                path: display_path(path),
                kind: ChangeKind::Added,
                old_value: None,
                new_value: Some(new.clone()),
            });
            return;
        }
        (Some(old), None) => {
            out.push(DiffChange {
                path: display_path(path),
                kind: ChangeKind::Removed,
                old_value: Some(old.clone()),
                new_value: None,
            });
            return;
        }
        (Some(old), Some(new)) => (old, new),
    };

    if same_value(old, new) {
        return;
    }

    match (old, new) {
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let item_path = index_path(path, i);
                match (a.get(i), b.get(i)) {
                    (None, Some(added)) => out.push(DiffChange {
                        path: item_path,
                        kind: ChangeKind::Added,
                        old_value: None,
                        new_value: Some(added.clone()),
                    }),
                    (Some(removed), None) => out.push(DiffChange {
                        path: item_path,
                        kind: ChangeKind::Removed,
                        old_value: Some(removed.clone()),
                        new_value: None,
                    }),
                    (Some(x), Some(y)) => compare(Some(x), Some(y), &item_path, out),
                    (None, None) => {}
                }
            }
        }
        (Value::Object(a), Value::Object(b)) => {
            let keys = a.keys().chain(b.keys().filter(|k| !a.contains_key(*k)));
            for key in keys {
                let child_path = key_path(path, key);
                match (a.get(key), b.get(key)) {
                    (None, Some(added)) => out.push(DiffChange {
                        path: child_path,
                        kind: ChangeKind::Added,
                        old_value: None,
                        new_value: Some(added.clone()),
                    }),
                    (Some(removed), None) => out.push(DiffChange {
                        path: child_path,
                        kind: ChangeKind::Removed,
                        old_value: Some(removed.clone()),
                        new_value: None,
                    }),
                    (Some(x), Some(y)) => compare(Some(x), Some(y), &child_path, out),
                    (None, None) => {}
                }
            }
        }
        // differing kinds, or unequal primitives
        _ => out.push(DiffChange {
            path: display_path(path),
            kind: ChangeKind::Changed,
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
        }),
    }
}

/// Render a diff for humans, one change per line
pub fn format_diff(diff: &DiffResult) -> String {
    if !diff.changed {
        return "No changes".to_string();
    }

    let show = |v: &Option<Value>| v.as_ref().map_or_else(|| "null".to_string(), Value::to_string);

    diff.changes
        .iter()
        .map(|change| match change.kind {
            ChangeKind::Added => format!("+ {}: {}", change.path, show(&change.new_value)),
            ChangeKind::Removed => format!("- {}: {}", change.path, show(&change.old_value)),
            ChangeKind::Changed => format!(
                "~ {}: {} → {}",
                change.path,
                show(&change.old_value),
                show(&change.new_value)
            ),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
