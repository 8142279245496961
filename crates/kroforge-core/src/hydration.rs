//! Status hydration: merging static and dynamically resolved status fields.

use serde_json::{Map, Value};

use crate::placeholder::{Placeholder, contains_placeholder};

/// Merge `dynamic` over `static_fields`.
///
/// Objects merge key by key at every level. Where both sides hold a
/// non-object value for the same key, the dynamic value wins.
pub fn hydrate(dynamic: &Value, static_fields: &Value) -> Value {
    match (static_fields, dynamic) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let next = match merged.get(key) {
                    Some(existing) => hydrate(value, existing),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

/// Split a status template into `(static, dynamic)` halves.
///
/// A field is dynamic if it is, or contains, a placeholder. Objects are split
/// recursively. An array is dynamic as a whole if any element is dynamic, so
/// a mixed array is resolved in full rather than losing its resolved entries.
pub fn split_status(template: &Value) -> (Value, Value) {
    let Value::Object(map) = template else {
        return if contains_placeholder(template) {
            (Value::Object(Map::new()), template.clone())
        } else {
            (template.clone(), Value::Object(Map::new()))
        };
    };

    let mut static_fields = Map::new();
    let mut dynamic = Map::new();
    for (key, value) in map {
        if !contains_placeholder(value) {
            static_fields.insert(key.clone(), value.clone());
            continue;
        }
        match value {
            Value::Object(_) if Placeholder::from_value(value).is_none() => {
                let (s, d) = split_status(value);
                if s.as_object().is_some_and(|m| !m.is_empty()) {
                    static_fields.insert(key.clone(), s);
                }
                dynamic.insert(key.clone(), d);
            }
            _ => {
                dynamic.insert(key.clone(), value.clone());
            }
        }
    }
    (Value::Object(static_fields), Value::Object(dynamic))
}
