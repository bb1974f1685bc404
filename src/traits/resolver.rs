//! Strata Resolver: combines per-stratum values into one effective value.
//!
//! Every function here is pure. Callers pass the values of every stratum that
//! defines the trait, ordered bottom-to-top (lowest priority first).

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::definition::{IdProperty, MergePolicy, TraitDef, TraitType};

/// Field that marks an array element as removed from all lower strata.
pub const REMOVED_FLAG: &str = "removed";

/// Compute the effective value of `def` from values ordered bottom-to-top.
pub fn resolve(def: &TraitDef, bottom_up: &[Value]) -> Option<Value> {
    if bottom_up.is_empty() {
        return None;
    }
    match &def.merge {
        MergePolicy::Override if def.trait_type == TraitType::Object => Some(merge_objects(bottom_up)),
        MergePolicy::Override | MergePolicy::ReplaceArray => bottom_up.last().cloned(),
        MergePolicy::MergeArrayById(id) => Some(merge_array_by_id(id, bottom_up)),
    }
}

/// Shallow-merge object layers; keys from higher layers win.
pub fn merge_objects(bottom_up: &[Value]) -> Value {
    let mut merged = Map::new();
    for layer in bottom_up {
        if let Value::Object(map) = layer {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Merge array layers element-wise by id.
///
/// Element order is the order of first appearance scanning bottom-to-top. A
/// higher element with the same id deep-merges its fields over the lower one.
/// An element with `"removed": true` hides that id in every lower layer; a
/// still higher layer may add it back.
pub fn merge_array_by_id(id_property: &IdProperty, bottom_up: &[Value]) -> Value {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Option<Value>> = HashMap::new();

    for layer in bottom_up {
        let Some(items) = layer.as_array() else {
            continue;
        };
        for (index, element) in items.iter().enumerate() {
            let key = element_key(id_property, element, index);
            if !merged.contains_key(&key) {
                order.push(key.clone());
            }
            if is_removal(element) {
                merged.insert(key, None);
                continue;
            }
            match merged.get_mut(&key) {
                Some(Some(existing)) => deep_merge(existing, element),
                _ => {
                    merged.insert(key, Some(element.clone()));
                }
            }
        }
    }

    Value::Array(
        order
            .into_iter()
            .filter_map(|key| merged.remove(&key).flatten())
            .collect(),
    )
}

/// Recursively merge `patch` into `base`. Objects merge key by key; any other
/// value replaces.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn element_key(id_property: &IdProperty, element: &Value, index: usize) -> String {
    match id_property {
        IdProperty::Index => index.to_string(),
        IdProperty::Field(field) => match element.get(field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => format!("@{}", index),
            Some(other) => other.to_string(),
        },
    }
}

fn is_removal(element: &Value) -> bool {
    element.get(REMOVED_FLAG).and_then(Value::as_bool) == Some(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
