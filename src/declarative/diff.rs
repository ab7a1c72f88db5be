//! Three-way diff between desired, live and last-applied state
//!
//! Objects are compared after [`normalize`] strips everything the server owns.
//! The snapshot of what was last written is stored on the object itself under
//! [`LAST_APPLIED_ANNOTATION`], so fields the engine set earlier and no longer
//! wants can be told apart from fields other writers added.

use kube::core::DynamicObject;
use serde_json::{Map, Value};

use crate::error::Result;

/// Annotation holding the normalized form of the last written desired object
pub const LAST_APPLIED_ANNOTATION: &str = "declarative.dev/last-applied";

const SERVER_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

const DROPPED_WHEN_EMPTY: &[&str] = &["annotations", "labels", "ownerReferences", "finalizers"];

/// JSON form of an object without status, server metadata and the snapshot annotation
pub fn normalize(obj: &DynamicObject) -> Result<Value> {
    let mut value = serde_json::to_value(obj)?;
    let Some(root) = value.as_object_mut() else {
        return Ok(value);
    };
    root.remove("status");

    if let Some(meta) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_METADATA {
            meta.remove(*field);
        }
        if let Some(annotations) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
            annotations.remove(LAST_APPLIED_ANNOTATION);
        }
        for field in DROPPED_WHEN_EMPTY {
            let empty = match meta.get(*field) {
                Some(Value::Object(m)) => m.is_empty(),
                Some(Value::Array(a)) => a.is_empty(),
                Some(Value::Null) => true,
                _ => false,
            };
            if empty {
                meta.remove(*field);
            }
        }
    }
    Ok(value)
}

/// The snapshot recorded on a live object, if any and if parseable
pub fn last_applied(obj: &DynamicObject) -> Option<Value> {
    obj.metadata
        .annotations
        .as_ref()?
        .get(LAST_APPLIED_ANNOTATION)
        .and_then(|raw| serde_json::from_str(raw).ok())
}

/// Record the normalized desired object as its own snapshot
pub fn stamp_last_applied(desired: &mut DynamicObject) -> Result<()> {
    let snapshot = serde_json::to_string(&normalize(desired)?)?;
    desired
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), snapshot);
    Ok(())
}

/// Merge patch taking `current` to `modified`, or `None` when they already agree.
///
/// Keys absent from `modified` are only removed when `original` shows they
/// were written by us; keys other writers added are left alone.
pub fn compute_patch(original: Option<&Value>, modified: &Value, current: &Value) -> Option<Value> {
    match three_way(original, modified, current) {
        Value::Object(patch) if patch.is_empty() => None,
        patch => Some(patch),
    }
}

fn three_way(original: Option<&Value>, modified: &Value, current: &Value) -> Value {
    let (Value::Object(modified), Value::Object(current)) = (modified, current) else {
        return if modified == current {
            Value::Object(Map::new())
        } else {
            modified.clone()
        };
    };

    let mut patch = Map::new();
    for (key, want) in modified {
        match current.get(key) {
            Some(have) if have == want => {}
            Some(have) if have.is_object() && want.is_object() => {
                let nested = three_way(original.and_then(|o| o.get(key)), want, have);
                if nested.as_object().map_or(true, |m| !m.is_empty()) {
                    patch.insert(key.clone(), nested);
                }
            }
            _ => {
                patch.insert(key.clone(), want.clone());
            }
        }
    }

    if let Some(Value::Object(original)) = original {
        for key in original.keys() {
            if !modified.contains_key(key) && current.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }
    Value::Object(patch)
}
