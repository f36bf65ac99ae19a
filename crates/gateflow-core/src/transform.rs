//! Working-memory transformations a passing gate applies before its guarded
//! children run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One transformation step. Field paths are dot-separated; the first segment
/// names a working-memory key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Set a field, creating intermediate objects as needed.
    SetField { field: String, value: Value },
    /// Remove a field. A path that does not exist is left alone.
    RemoveField { field: String },
    /// Write every top-level key of `data`.
    MergeData { data: Map<String, Value> },
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetField { .. } => "set_field",
            Self::RemoveField { .. } => "remove_field",
            Self::MergeData { .. } => "merge_data",
        }
    }

    /// The field path, if this step has one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::SetField { field, .. } | Self::RemoveField { field } => Some(field),
            Self::MergeData { .. } => None,
        }
    }

    /// The top-level memory writes this step makes against `memory`.
    ///
    /// Removing a whole key writes `null`, which conditions read the same
    /// way as a missing key.
    pub fn writes(&self, memory: &Map<String, Value>) -> Vec<(String, Value)> {
        match self {
            Self::SetField { field, value } => {
                let (head, rest) = split_path(field);
                let mut root = memory.get(head).cloned().unwrap_or(Value::Null);
                set_path(&mut root, &rest, value.clone());
                vec![(head.to_string(), root)]
            }
            Self::RemoveField { field } => {
                let (head, rest) = split_path(field);
                let Some(current) = memory.get(head) else {
                    return Vec::new();
                };
                if rest.is_empty() {
                    return vec![(head.to_string(), Value::Null)];
                }
                let mut root = current.clone();
                if remove_path(&mut root, &rest) {
                    vec![(head.to_string(), root)]
                } else {
                    Vec::new()
                }
            }
            Self::MergeData { data } => data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

fn split_path(field: &str) -> (&str, Vec<&str>) {
    let mut parts = field.split('.');
    let head = parts.next().unwrap_or_default();
    (head, parts.collect())
}

fn set_path(target: &mut Value, path: &[&str], value: Value) {
    match path.split_first() {
        None => *target = value,
        Some((key, rest)) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                let child = map.entry(key.to_string()).or_insert(Value::Null);
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(target: &mut Value, path: &[&str]) -> bool {
    match path {
        [] => false,
        [last] => target
            .as_object_mut()
            .map(|map| map.remove(*last).is_some())
            .unwrap_or(false),
        [key, rest @ ..] => target
            .as_object_mut()
            .and_then(|map| map.get_mut(*key))
            .map(|child| remove_path(child, rest))
            .unwrap_or(false),
    }
}
