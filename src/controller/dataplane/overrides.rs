//! Merge of user pod template overrides onto the generated template
//!
//! The merge works on the JSON form of the templates so that every pod and
//! container field survives, including ones this operator never generates.
//! Objects merge key by key and anything else set by the user replaces the
//! generated value. Lists keyed by name (containers, init containers, env,
//! volumes, volume mounts) are merged entry by entry with the user entry
//! winning; new entries are appended in user order. Probes are replaced as a
//! whole since a probe has exactly one handler.

use k8s_openapi::api::core::v1::{Container, EnvVar, PodTemplateSpec};
use serde_json::{Map, Value};

/// How a list field is merged
#[derive(Clone, Copy, PartialEq, Eq)]
enum NamedList {
    /// Matching entries are merged field by field
    Merge,
    /// Matching entries are replaced by the user entry
    Replace,
}

fn named_list(field: &str) -> Option<NamedList> {
    match field {
        "containers" | "initContainers" => Some(NamedList::Merge),
        "env" | "volumes" | "volumeMounts" => Some(NamedList::Replace),
        _ => None,
    }
}

fn replaced_whole(field: &str) -> bool {
    matches!(field, "readinessProbe" | "livenessProbe" | "startupProbe")
}

/// Apply `user` on top of `generated`
pub fn apply_pod_template_overrides(
    generated: &mut PodTemplateSpec,
    user: &PodTemplateSpec,
) -> Result<(), serde_json::Error> {
    let mut merged = serde_json::to_value(&*generated)?;
    let user = serde_json::to_value(user)?;
    if let (Value::Object(target), Value::Object(source)) = (&mut merged, &user) {
        merge_object(target, source);
    }
    *generated = serde_json::from_value(merged)?;
    Ok(())
}

fn merge_object(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (field, value) in source {
        let Some(existing) = target.get_mut(field) else {
            target.insert(field.clone(), value.clone());
            continue;
        };
        match (named_list(field), existing, value) {
            (Some(how), Value::Array(existing), Value::Array(items)) => merge_named(existing, items, how),
            (None, Value::Object(existing), Value::Object(value)) if !replaced_whole(field) => {
                merge_object(existing, value)
            }
            (_, existing, value) => *existing = value.clone(),
        }
    }
}

fn entry_name(entry: &Value) -> Option<&str> {
    entry.get("name").and_then(Value::as_str)
}

fn merge_named(target: &mut Vec<Value>, source: &[Value], how: NamedList) {
    for item in source {
        let name = entry_name(item);
        let existing = target
            .iter_mut()
            .find(|existing| name.is_some() && entry_name(existing) == name);
        match existing {
            Some(existing) => match (existing, item) {
                (Value::Object(existing), Value::Object(item)) if how == NamedList::Merge => {
                    merge_object(existing, item)
                }
                (existing, item) => *existing = item.clone(),
            },
            None => target.push(item.clone()),
        }
    }
}

/// Set `name` to `value` unless the container already defines it
pub fn set_env_default(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    if !env.iter().any(|e| e.name == name) {
        env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        });
    }
}

/// Set `name` to `value`, replacing any existing entry in place
pub fn set_env(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    let var = EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    };
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}
