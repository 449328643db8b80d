//! Collection-build, comprehension and iteration opcodes (spec.md
//! §4.4.3 "Collection build", "Iteration", "Comprehensions"). Grounded
//! in the teacher's `bytecode/vm/collections.rs` split between build
//! ops and comprehension ops, collapsed into one module here.

use indexmap::IndexMap;

use crate::diagnostics::{ErrorKind, RunError};
use crate::heap::{Heap, HeapId, HeapValue};
use crate::value::{
    ConfigEntry, ConfigOperation, DictKey, IterArity, IterSource, IteratorState, SchemaConfigData, SliceValue,
    UnpackKind, Value,
};

fn internal(what: &str) -> RunError {
    RunError::Internal(format!("collections: {what}"))
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> Result<Vec<Value>, RunError> {
    if stack.len() < n {
        return Err(internal("stack underflow"));
    }
    Ok(stack.split_off(stack.len() - n))
}

/// `BUILD_LIST n`.
pub fn build_list(stack: &mut Vec<Value>, n: usize, heap: &mut Heap) -> Result<Value, RunError> {
    let items = pop_n(stack, n)?;
    Ok(Value::List(heap.alloc(HeapValue::List(items))))
}

/// `BUILD_MAP` (empty).
pub fn build_map(heap: &mut Heap) -> Value {
    Value::Dict(heap.alloc(HeapValue::Dict(IndexMap::new())))
}

/// `BUILD_SCHEMA_CONFIG` (empty schema-config dict).
pub fn build_schema_config(heap: &mut Heap) -> Value {
    Value::SchemaConfig(heap.alloc(HeapValue::SchemaConfig(SchemaConfigData::default())))
}

/// `BUILD_SLICE {2,3}`: pop step (if 3), stop, start (spec.md §4.4.3).
pub fn build_slice(stack: &mut Vec<Value>, has_step: bool) -> Result<Value, RunError> {
    let step = if has_step { Some(stack.pop().ok_or_else(|| internal("slice step"))?) } else { None };
    let stop = stack.pop().ok_or_else(|| internal("slice stop"))?;
    let start = stack.pop().ok_or_else(|| internal("slice start"))?;
    let as_opt = |v: Value| -> Option<Value> {
        match v {
            Value::None | Value::Undefined => None,
            other => Some(other),
        }
    };
    Ok(Value::Slice(Box::new(SliceValue { start: as_opt(start), stop: as_opt(stop), step: as_opt(step.unwrap_or(Value::None)) })))
}

/// `STORE_MAP`: pops `(value, key)`, mutates the dict now on top of the
/// stack in place (spec.md §4.4.3).
pub fn store_map(stack: &mut [Value], heap: &mut Heap) -> Result<(), RunError> {
    let len = stack.len();
    if len < 3 {
        return Err(internal("STORE_MAP stack underflow"));
    }
    let value = stack[len - 1].clone();
    let key = stack[len - 2].clone();
    let dict_id = match &stack[len - 3] {
        Value::Dict(id) => *id,
        _ => return Err(RunError::new(ErrorKind::Type, "STORE_MAP target is not a dict")),
    };
    let key = dict_key(&key)?;
    let mut guard = heap.get_mut(dict_id);
    let HeapValue::Dict(map) = &mut *guard else { return Err(internal("STORE_MAP: not a dict")) };
    map.insert(key, value);
    drop(guard);
    stack.truncate(len - 2);
    Ok(())
}

fn dict_key(v: &Value) -> Result<DictKey, RunError> {
    match v {
        Value::Str(s) => Ok(DictKey::Str(s.clone())),
        Value::Int(i) => Ok(DictKey::Int(*i)),
        Value::Float(f) => Ok(DictKey::FloatBits(f.to_bits())),
        _ => Err(RunError::new(ErrorKind::Key, "dict/config keys must be str, int, or float")),
    }
}

pub fn config_operation_from_code(code: i64) -> Result<ConfigOperation, RunError> {
    match code {
        0 => Ok(ConfigOperation::Union),
        1 => Ok(ConfigOperation::Override),
        2 => Ok(ConfigOperation::Insert),
        3 => Ok(ConfigOperation::Unique),
        4 => Ok(ConfigOperation::Unification),
        other => Err(RunError::new(ErrorKind::Compile, format!("unknown config operation code {other}"))),
    }
}

/// `STORE_SCHEMA_CONFIG`: pops `{insert_index, operation, is_nest_key,
/// value, key}`, honours `**` unpack, and splits dotted keys into
/// nested sub-configs (spec.md §4.4.3).
pub fn store_schema_config(stack: &mut Vec<Value>, heap: &mut Heap) -> Result<(), RunError> {
    let insert_index = match stack.pop().ok_or_else(|| internal("STORE_SCHEMA_CONFIG insert_index"))? {
        Value::Int(i) => Some(i),
        _ => None,
    };
    let operation = match stack.pop().ok_or_else(|| internal("STORE_SCHEMA_CONFIG operation"))? {
        Value::Int(code) => config_operation_from_code(code)?,
        _ => ConfigOperation::Union,
    };
    let _is_nest_key = stack.pop().ok_or_else(|| internal("STORE_SCHEMA_CONFIG is_nest_key"))?;
    let value = stack.pop().ok_or_else(|| internal("STORE_SCHEMA_CONFIG value"))?;
    let key = stack.pop().ok_or_else(|| internal("STORE_SCHEMA_CONFIG key"))?;

    let config_id = match stack.last() {
        Some(Value::SchemaConfig(id)) => *id,
        _ => return Err(RunError::new(ErrorKind::Type, "STORE_SCHEMA_CONFIG target is not a schema config")),
    };

    if let Value::Unpack(inner, UnpackKind::Double) = key {
        spread_double_star(config_id, &inner, heap)?;
        return Ok(());
    }

    let Value::Str(key_str) = &key else { return Err(RunError::new(ErrorKind::Key, "schema config keys must be strings")) };
    insert_dotted(config_id, key_str, value, operation, insert_index, heap)
}

fn insert_dotted(
    config_id: HeapId,
    key: &str,
    value: Value,
    operation: ConfigOperation,
    insert_index: Option<i64>,
    heap: &mut Heap,
) -> Result<(), RunError> {
    let mut parts = key.splitn(2, '.');
    let head = parts.next().unwrap_or(key);
    match parts.next() {
        None => {
            let mut guard = heap.get_mut(config_id);
            let HeapValue::SchemaConfig(data) = &mut *guard else { return Err(internal("insert_dotted: not a config")) };
            data.entries.insert(DictKey::from(head), ConfigEntry { value, operation, insert_index });
            Ok(())
        }
        Some(rest) => {
            let nested_id = {
                let mut guard = heap.get_mut(config_id);
                let HeapValue::SchemaConfig(data) = &mut *guard else { return Err(internal("insert_dotted: not a config")) };
                match data.entries.get(&DictKey::from(head)) {
                    Some(ConfigEntry { value: Value::SchemaConfig(id), .. }) => *id,
                    _ => {
                        drop(guard);
                        let id = heap.alloc(HeapValue::SchemaConfig(SchemaConfigData::default()));
                        let mut guard = heap.get_mut(config_id);
                        let HeapValue::SchemaConfig(data) = &mut *guard else { return Err(internal("insert_dotted: not a config")) };
                        data.entries.insert(
                            DictKey::from(head),
                            ConfigEntry { value: Value::SchemaConfig(id), operation: ConfigOperation::Union, insert_index: None },
                        );
                        id
                    }
                }
            };
            insert_dotted(nested_id, rest, value, operation, insert_index, heap)
        }
    }
}

fn spread_double_star(config_id: HeapId, inner: &Value, heap: &mut Heap) -> Result<(), RunError> {
    let entries: Vec<(DictKey, Value)> = match inner {
        Value::Dict(id) => {
            let guard = heap.get(*id);
            let HeapValue::Dict(map) = &*guard else { return Err(internal("spread: not a dict")) };
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        }
        Value::SchemaConfig(id) => {
            let guard = heap.get(*id);
            let HeapValue::SchemaConfig(data) = &*guard else { return Err(internal("spread: not a config")) };
            data.entries.iter().map(|(k, e)| (k.clone(), e.value.clone())).collect()
        }
        Value::SchemaInstance(id) => {
            let guard = heap.get(*id);
            let HeapValue::SchemaInstance(data) = &*guard else { return Err(internal("spread: not a schema")) };
            data.attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        }
        _ => return Err(RunError::new(ErrorKind::Type, "'**' unpack requires a dict, config, or schema")),
    };
    let mut guard = heap.get_mut(config_id);
    let HeapValue::SchemaConfig(data) = &mut *guard else { return Err(internal("spread: target not a config")) };
    for (k, v) in entries {
        data.entries.insert(k, ConfigEntry { value: v, operation: ConfigOperation::Union, insert_index: None });
    }
    Ok(())
}

/// `GET_ITER n`: build an iterator cursor over the popped value.
pub fn get_iter(value: Value, arity_n: u32, heap: &mut Heap) -> Result<Value, RunError> {
    let arity = match arity_n {
        1 => IterArity::One,
        2 => IterArity::Two,
        other => return Err(RunError::new(ErrorKind::Compile, format!("invalid GET_ITER arity {other}"))),
    };
    let source = match value {
        Value::List(id) => IterSource::List(id),
        Value::Dict(id) => IterSource::Dict(id),
        Value::SchemaInstance(id) => IterSource::Schema(id),
        Value::Str(s) => IterSource::Str(s),
        other => return Err(RunError::new(ErrorKind::Type, format!("'{}' is not iterable", other.kind_name(heap)))),
    };
    Ok(Value::Iterator(heap.alloc(HeapValue::Iterator(IteratorState { source, index: 0, arity }))))
}

/// `FOR_ITER target`: advance the cursor. `None` signals exhaustion —
/// the caller pops the iterator and jumps to `target` (spec.md
/// §4.4.3).
pub fn for_iter_step(iter_id: HeapId, heap: &mut Heap) -> Result<Option<(Value, Option<Value>)>, RunError> {
    let (source, index, arity) = {
        let guard = heap.get(iter_id);
        let HeapValue::Iterator(state) = &*guard else { return Err(internal("for_iter_step: not an iterator")) };
        (state.source.clone(), state.index, state.arity)
    };
    let result = match &source {
        IterSource::List(id) => {
            let guard = heap.get(*id);
            let HeapValue::List(items) = &*guard else { return Err(internal("for_iter_step: not a list")) };
            items.get(index).map(|v| match arity {
                IterArity::One => (v.clone(), None),
                IterArity::Two => (Value::Int(index as i64), Some(v.clone())),
            })
        }
        IterSource::Dict(id) => {
            let guard = heap.get(*id);
            let HeapValue::Dict(map) = &*guard else { return Err(internal("for_iter_step: not a dict")) };
            map.get_index(index).map(|(k, v)| match arity {
                IterArity::One => (Value::str(k.to_string().as_str()), None),
                IterArity::Two => (Value::str(k.to_string().as_str()), Some(v.clone())),
            })
        }
        IterSource::Schema(id) => {
            let guard = heap.get(*id);
            let HeapValue::SchemaInstance(data) = &*guard else { return Err(internal("for_iter_step: not a schema")) };
            data.attrs.get_index(index).map(|(k, v)| match arity {
                IterArity::One => (Value::str(k.to_string().as_str()), None),
                IterArity::Two => (Value::str(k.to_string().as_str()), Some(v.clone())),
            })
        }
        IterSource::Str(s) => s.chars().nth(index).map(|c| (Value::str(c.to_string().as_str()), None)),
    };
    if result.is_some() {
        let mut guard = heap.get_mut(iter_id);
        let HeapValue::Iterator(state) = &mut *guard else { return Err(internal("for_iter_step: not an iterator")) };
        state.index += 1;
    }
    Ok(result)
}

/// `LIST_APPEND depth`: append the popped `value` into the list `depth`
/// slots below the top of the (already-popped) stack.
pub fn list_append(stack: &[Value], depth: usize, value: Value, heap: &mut Heap) -> Result<(), RunError> {
    let idx = stack.len().checked_sub(depth).ok_or_else(|| internal("LIST_APPEND depth"))?;
    let Value::List(id) = stack[idx] else { return Err(RunError::new(ErrorKind::Type, "LIST_APPEND target is not a list")) };
    let mut guard = heap.get_mut(id);
    let HeapValue::List(items) = &mut *guard else { return Err(internal("LIST_APPEND: not a list")) };
    items.push(value);
    Ok(())
}

/// `MAP_ADD depth`: pops `(operation, key, value)` handled by the
/// caller; writes into the dict `depth` slots below the current top.
pub fn map_add(stack: &[Value], depth: usize, key: Value, value: Value, operation: ConfigOperation, heap: &mut Heap) -> Result<(), RunError> {
    let idx = stack.len().checked_sub(depth).ok_or_else(|| internal("MAP_ADD depth"))?;
    let Value::Dict(id) = stack[idx] else { return Err(RunError::new(ErrorKind::Type, "MAP_ADD target is not a dict")) };
    let key = dict_key(&key)?;
    let mut guard = heap.get_mut(id);
    let HeapValue::Dict(map) = &mut *guard else { return Err(internal("MAP_ADD: not a dict")) };
    match operation {
        ConfigOperation::Override | ConfigOperation::Union => {
            map.insert(key, value);
        }
        ConfigOperation::Unique => {
            if let Some(existing) = map.get(&key) {
                if !matches!(existing, Value::None | Value::Undefined) && !matches!(value, Value::None | Value::Undefined) {
                    return Err(RunError::new(ErrorKind::UniqueKey, format!("unique key conflict for '{key}'")));
                }
            }
            map.insert(key, value);
        }
        ConfigOperation::Insert | ConfigOperation::Unification => {
            map.insert(key, value);
        }
    }
    Ok(())
}

/// `DELETE_ITEM depth`: filter-expression element removal (spec.md
/// §4.4.3). For a list target, drops the most recently appended
/// element; for a dict target, pops one more `key` value off the
/// stack and removes that entry.
pub fn delete_item(stack: &mut Vec<Value>, depth: usize, heap: &mut Heap) -> Result<(), RunError> {
    let idx = stack.len().checked_sub(depth).ok_or_else(|| internal("DELETE_ITEM depth"))?;
    match stack[idx].clone() {
        Value::List(id) => {
            let mut guard = heap.get_mut(id);
            let HeapValue::List(items) = &mut *guard else { return Err(internal("DELETE_ITEM: not a list")) };
            items.pop();
            Ok(())
        }
        Value::Dict(id) => {
            let key = stack.pop().ok_or_else(|| internal("DELETE_ITEM key"))?;
            let key = dict_key(&key)?;
            let mut guard = heap.get_mut(id);
            let HeapValue::Dict(map) = &mut *guard else { return Err(internal("DELETE_ITEM: not a dict")) };
            map.shift_remove(&key);
            Ok(())
        }
        other => Err(RunError::new(ErrorKind::Type, format!("DELETE_ITEM target is not a collection: {}", other.kind_name(heap)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_list_pops_n_items_in_order() {
        let mut heap = Heap::new();
        let mut stack = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        let result = build_list(&mut stack, 2, &mut heap).unwrap();
        assert!(stack.len() == 1);
        let Value::List(id) = result else { panic!() };
        let guard = heap.get(id);
        let HeapValue::List(items) = &*guard else { panic!() };
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Value::Int(2)));
    }

    #[test]
    fn store_map_inserts_key_value_and_leaves_dict_on_stack() {
        let mut heap = Heap::new();
        let dict = build_map(&mut heap);
        let mut stack = vec![dict, Value::str("x"), Value::Int(5)];
        store_map(&mut stack, &mut heap).unwrap();
        assert_eq!(stack.len(), 1);
        let Value::Dict(id) = stack[0] else { panic!() };
        let guard = heap.get(id);
        let HeapValue::Dict(map) = &*guard else { panic!() };
        assert!(matches!(map.get(&DictKey::from("x")), Some(Value::Int(5))));
    }

    #[test]
    fn store_schema_config_splits_dotted_keys() {
        let mut heap = Heap::new();
        let config = build_schema_config(&mut heap);
        let Value::SchemaConfig(config_id) = config.clone() else { panic!() };
        let mut stack = vec![config, Value::str("a.b"), Value::Int(9), Value::Bool(true), Value::Int(0), Value::None];
        store_schema_config(&mut stack, &mut heap).unwrap();
        let guard = heap.get(config_id);
        let HeapValue::SchemaConfig(data) = &*guard else { panic!() };
        let Some(ConfigEntry { value: Value::SchemaConfig(nested_id), .. }) = data.entries.get(&DictKey::from("a")) else {
            panic!("expected nested config")
        };
        let nested_id = *nested_id;
        drop(guard);
        let guard = heap.get(nested_id);
        let HeapValue::SchemaConfig(nested) = &*guard else { panic!() };
        assert!(matches!(nested.entries.get(&DictKey::from("b")), Some(ConfigEntry { value: Value::Int(9), .. })));
    }

    #[test]
    fn for_iter_exhausts_after_last_element() {
        let mut heap = Heap::new();
        let list = heap.alloc(HeapValue::List(vec![Value::Int(1)]));
        let iter = heap.alloc(HeapValue::Iterator(IteratorState { source: IterSource::List(list), index: 0, arity: IterArity::One }));
        assert!(for_iter_step(iter, &mut heap).unwrap().is_some());
        assert!(for_iter_step(iter, &mut heap).unwrap().is_none());
    }
}
