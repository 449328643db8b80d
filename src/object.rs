//! The host-facing value type (spec.md §4.1).
//!
//! `Object` owns its data and needs no heap to inspect — it is what a
//! builtin function receives for its arguments and returns as its
//! result, converted to/from the engine's heap-backed [`Value`] at
//! the call boundary (spec.md §4.4.4 step 3).

use indexmap::IndexMap;

use crate::diagnostics::{ErrorKind, RunError};
use crate::heap::{Heap, HeapId, HeapValue};
use crate::value::{DictKey, SchemaInstanceData, Value};

/// Reserved dict keys that mark a host dict as a schema instance
/// rather than a plain mapping (spec.md §4.1), grounded in the
/// reference implementation's `KCLSchemaReverseFields`.
pub mod reserved_keys {
    pub const SETTINGS: &str = "__settings__";
    pub const NAME: &str = "__schema_name__";
    pub const TYPE: &str = "__schema_type__";
    pub const PKG_PATH: &str = "__pkg_path__";
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Object>),
    Dict(IndexMap<String, Object>),
}

/// Convert a host [`Object`] into an engine [`Value`], allocating
/// heap slots for collections. A dict carrying `__settings__`
/// reconstructs a schema instance from its `__schema_name__`/
/// `__schema_type__`/`__pkg_path__` fields rather than becoming a
/// plain `Dict` (spec.md §4.1).
pub fn object_to_value(obj: &Object, heap: &mut Heap) -> Value {
    match obj {
        Object::None => Value::None,
        Object::Bool(b) => Value::Bool(*b),
        Object::Int(i) => Value::Int(*i),
        Object::Float(f) => Value::Float(*f),
        Object::Str(s) => Value::str(s.as_str()),
        Object::List(items) => {
            let values = items.iter().map(|o| object_to_value(o, heap)).collect();
            Value::List(heap.alloc(HeapValue::List(values)))
        }
        Object::Dict(map) => {
            if map.contains_key(reserved_keys::SETTINGS) {
                schema_dict_to_instance(map, heap)
            } else {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    out.insert(DictKey::from(k.as_str()), object_to_value(v, heap));
                }
                Value::Dict(heap.alloc(HeapValue::Dict(out)))
            }
        }
    }
}

fn schema_dict_to_instance(map: &IndexMap<String, Object>, heap: &mut Heap) -> Value {
    let name = match map.get(reserved_keys::NAME) {
        Some(Object::Str(s)) => s.clone(),
        _ => String::new(),
    };
    let runtime_type = match map.get(reserved_keys::TYPE) {
        Some(Object::Str(s)) => s.clone(),
        _ => String::new(),
    };
    let pkgpath = match map.get(reserved_keys::PKG_PATH) {
        Some(Object::Str(s)) => s.clone(),
        _ => String::new(),
    };
    let settings = map
        .get(reserved_keys::SETTINGS)
        .map(|o| object_to_value(o, heap))
        .unwrap_or(Value::None);

    let mut attrs = IndexMap::new();
    for (k, v) in map {
        if matches!(k.as_str(), reserved_keys::SETTINGS | reserved_keys::NAME | reserved_keys::TYPE | reserved_keys::PKG_PATH) {
            continue;
        }
        attrs.insert(DictKey::from(k.as_str()), object_to_value(v, heap));
    }

    let data = SchemaInstanceData { name, pkgpath, runtime_type, attrs, settings, ..Default::default() };
    Value::SchemaInstance(heap.alloc(HeapValue::SchemaInstance(data)))
}

/// Convert an engine [`Value`] back to a host-facing [`Object`].
/// Schema instances round-trip as dicts carrying the reserved keys
/// (spec.md §4.1); functions, iterators, slices, and type objects
/// have no `Object` representation and are rejected.
pub fn value_to_object(value: &Value, heap: &Heap) -> Result<Object, RunError> {
    Ok(match value {
        Value::None | Value::Undefined => Object::None,
        Value::Bool(b) => Object::Bool(*b),
        Value::Int(i) => Object::Int(*i),
        Value::Float(f) => Object::Float(*f),
        Value::NumberMultiplier { raw, .. } => Object::Int(*raw),
        Value::Str(s) => Object::Str(s.to_string()),
        Value::List(id) => {
            let guard = heap.get(*id);
            let HeapValue::List(items) = &*guard else { return Err(bad_conversion("list")) };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(value_to_object(item, heap)?);
            }
            Object::List(out)
        }
        Value::Dict(id) => {
            let guard = heap.get(*id);
            let HeapValue::Dict(map) = &*guard else { return Err(bad_conversion("dict")) };
            dict_entries_to_object(map.iter().map(|(k, v)| (k.to_string(), v)), heap)?
        }
        Value::SchemaInstance(id) => schema_instance_to_object(*id, heap)?,
        _ => return Err(bad_conversion(&value.kind_name(heap))),
    })
}

fn dict_entries_to_object<'a>(
    entries: impl Iterator<Item = (String, &'a Value)>,
    heap: &Heap,
) -> Result<Object, RunError> {
    let mut out = IndexMap::new();
    for (k, v) in entries {
        out.insert(k, value_to_object(v, heap)?);
    }
    Ok(Object::Dict(out))
}

fn schema_instance_to_object(id: HeapId, heap: &Heap) -> Result<Object, RunError> {
    let guard = heap.get(id);
    let HeapValue::SchemaInstance(data) = &*guard else { return Err(bad_conversion("schema")) };
    let mut out = IndexMap::new();
    out.insert(reserved_keys::NAME.to_string(), Object::Str(data.name.clone()));
    out.insert(reserved_keys::TYPE.to_string(), Object::Str(data.runtime_type.clone()));
    out.insert(reserved_keys::PKG_PATH.to_string(), Object::Str(data.pkgpath.clone()));
    out.insert(reserved_keys::SETTINGS.to_string(), value_to_object(&data.settings, heap)?);
    for (k, v) in &data.attrs {
        out.insert(k.to_string(), value_to_object(v, heap)?);
    }
    Ok(Object::Dict(out))
}

fn bad_conversion(kind: &str) -> RunError {
    RunError::new(ErrorKind::Value, format!("value of kind '{kind}' has no host Object representation"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_dict_round_trips() {
        let mut heap = Heap::new();
        let mut map = IndexMap::new();
        map.insert("x".to_string(), Object::Int(1));
        let obj = Object::Dict(map);
        let value = object_to_value(&obj, &mut heap);
        let back = value_to_object(&value, &heap).unwrap();
        assert_eq!(obj, back);
    }

    #[test]
    fn schema_dict_reconstructs_instance() {
        let mut heap = Heap::new();
        let mut map = IndexMap::new();
        map.insert(reserved_keys::SETTINGS.to_string(), Object::None);
        map.insert(reserved_keys::NAME.to_string(), Object::Str("Person".into()));
        map.insert(reserved_keys::TYPE.to_string(), Object::Str("f1_Person".into()));
        map.insert(reserved_keys::PKG_PATH.to_string(), Object::Str("__main__".into()));
        map.insert("name".to_string(), Object::Str("Alice".into()));
        let value = object_to_value(&Object::Dict(map), &mut heap);
        match value {
            Value::SchemaInstance(id) => {
                let guard = heap.get(id);
                let HeapValue::SchemaInstance(data) = &*guard else { panic!("expected schema instance") };
                assert_eq!(data.name, "Person");
                assert!(data.attrs.contains_key(&DictKey::from("name")));
            }
            other => panic!("expected schema instance, got {other:?}"),
        }
    }
}
