//! Helpers for walking and editing serialized resource documents

use serde_json::{Map, Value};

/// Look up a dotted path in a document; `None` for absent or null
pub(crate) fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Set a dotted path in a document, creating intermediate objects as needed
///
/// A `Value::Null` leaf is written as-is; remote patch semantics treat an
/// explicit null as "unset this field".
pub(crate) fn set_path(doc: &mut Value, path: &str, value: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for segment in &segments[..segments.len() - 1] {
        let obj = current.as_object_mut().expect("object ensured above");
        current = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
    }
    current
        .as_object_mut()
        .expect("object ensured above")
        .insert(segments[segments.len() - 1].to_string(), value);
}

/// Fold `src` into `dst`: objects merge recursively, everything else
/// (scalars, arrays) is replaced. A null in `src` removes the key.
pub(crate) fn deep_merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, src_value) in src_map {
                if src_value.is_null() {
                    dst_map.remove(key);
                    continue;
                }
                match dst_map.get_mut(key) {
                    Some(dst_value) if dst_value.is_object() && src_value.is_object() => {
                        deep_merge(dst_value, src_value);
                    }
                    _ => {
                        dst_map.insert(key.clone(), src_value.clone());
                    }
                }
            }
        }
        (dst, src) => {
            *dst = src.clone();
        }
    }
}
