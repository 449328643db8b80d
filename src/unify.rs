//! The unification engine (spec.md §4.3).
//!
//! `union(obj, delta, opts)` recursively merges two values by kind. Ported
//! from the original evaluator's `do_union`/`union`/`merge`
//! (`original_source/.../vm/runtime/evaluator/union.py`): lists either
//! replace wholesale (`list_override`) or merge element-wise padded by
//! length; dicts and schema attrs merge key-wise honouring the delta's
//! per-key operation; scalars just take the delta.

use indexmap::IndexMap;

use crate::diagnostics::{Diagnostic, ErrorKind, RunError};
use crate::heap::{Heap, HeapId};
use crate::value::{ConfigOperation, DictKey, HeapValue, SchemaInstanceData, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct UnionOptions {
    /// `=` list semantics: delta replaces obj wholesale rather than
    /// merging element-wise.
    pub list_override: bool,
    /// `:` unification semantics: reject unless every key's value is in a
    /// subsumption relation with the existing value (spec.md §4.3).
    pub idempotent_check: bool,
    /// Only merge delta keys that also exist in a tracked `config_keys`
    /// set; used when re-resolving a schema after a relaxed-key update.
    pub config_resolve: bool,
}

impl UnionOptions {
    pub fn idempotent() -> Self {
        Self { idempotent_check: true, ..Self::default() }
    }

    pub fn overriding_lists() -> Self {
        Self { list_override: true, ..Self::default() }
    }
}

fn is_nullish(v: &Value) -> bool {
    matches!(v, Value::None | Value::Undefined)
}

/// Recursively merge `delta` into `obj` (spec.md §4.3 table).
pub fn union(obj: Value, delta: Value, opts: UnionOptions, heap: &mut Heap) -> Result<Value, RunError> {
    if is_nullish(&obj) {
        return Ok(delta);
    }
    if is_nullish(&delta) {
        return Ok(obj);
    }
    match (&obj, &delta) {
        (Value::List(a), Value::List(b)) => union_lists(*a, *b, opts, heap),
        (Value::Dict(a), Value::Dict(b)) => union_dict_into_dict(*a, *b, opts, heap),
        (Value::SchemaInstance(a), Value::Dict(_) | Value::SchemaInstance(_)) => union_into_schema(*a, &delta, opts, heap),
        (Value::SchemaInstance(_), _) => Err(type_error(&obj, &delta, heap)),
        (Value::List(_), _) | (_, Value::List(_)) => Err(type_error(&obj, &delta, heap)),
        (Value::Dict(_), _) | (_, Value::Dict(_)) => Err(type_error(&obj, &delta, heap)),
        _ => {
            if std::mem::discriminant(&obj) != std::mem::discriminant(&delta)
                && !matches!((&obj, &delta), (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)))
            {
                return Err(type_error(&obj, &delta, heap));
            }
            Ok(delta)
        }
    }
}

fn type_error(obj: &Value, delta: &Value, heap: &Heap) -> RunError {
    RunError::new(
        ErrorKind::Type,
        format!("union failure, expect {}, got {}", obj.kind_name(heap), delta.kind_name(heap)),
    )
}

fn union_lists(a: HeapId, b: HeapId, opts: UnionOptions, heap: &mut Heap) -> Result<Value, RunError> {
    if opts.list_override {
        return Ok(Value::List(b));
    }
    let (xs, ys) = {
        let guard_a = heap.get(a);
        let HeapValue::List(xs) = &*guard_a else { return Err(RunError::Internal("union_lists: not a list".into())) };
        let guard_b = heap.get(b);
        let HeapValue::List(ys) = &*guard_b else { return Err(RunError::Internal("union_lists: not a list".into())) };
        (xs.clone(), ys.clone())
    };
    let len = xs.len().max(ys.len());
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        match (xs.get(i).cloned(), ys.get(i).cloned()) {
            (Some(x), Some(y)) => out.push(union(x, y, opts, heap)?),
            (Some(x), None) => out.push(x),
            (None, Some(y)) => out.push(y),
            (None, None) => unreachable!(),
        }
    }
    Ok(Value::List(heap.alloc(HeapValue::List(out))))
}

fn union_dict_into_dict(a: HeapId, b: HeapId, opts: UnionOptions, heap: &mut Heap) -> Result<Value, RunError> {
    let (mut result, delta) = {
        let guard_a = heap.get(a);
        let HeapValue::Dict(xs) = &*guard_a else { return Err(RunError::Internal("union: not a dict".into())) };
        let guard_b = heap.get(b);
        let HeapValue::Dict(ys) = &*guard_b else { return Err(RunError::Internal("union: not a dict".into())) };
        (xs.clone(), ys.clone())
    };
    for (k, v) in delta {
        match result.get(&k).cloned() {
            None => {
                result.insert(k, v);
            }
            Some(existing) => {
                if opts.idempotent_check && !value_subsumes(&v, &existing, true, heap) {
                    return Err(conflicting_values(&k, &existing, &v, heap));
                }
                result.insert(k, union(existing, v, opts, heap)?);
            }
        }
    }
    Ok(Value::Dict(heap.alloc(HeapValue::Dict(result))))
}

fn conflicting_values(key: &DictKey, a: &Value, b: &Value, heap: &Heap) -> RunError {
    RunError::new(
        ErrorKind::Evaluation,
        format!(
            "conflicting values on the attribute '{key}' between {} and {}",
            a.kind_name(heap),
            b.kind_name(heap)
        ),
    )
}

/// Union a `Dict` or `SchemaInstance` delta into a schema instance's
/// `attrs`, honouring each delta key's per-key operation when the delta is
/// itself a schema config (spec.md §4.3 `Schema , Dict or Schema`).
fn union_into_schema(target: HeapId, delta: &Value, opts: UnionOptions, heap: &mut Heap) -> Result<Value, RunError> {
    let delta_entries: Vec<(DictKey, Value, ConfigOperation, Option<i64>)> = match delta {
        Value::Dict(id) => {
            let guard = heap.get(*id);
            let HeapValue::Dict(map) = &*guard else { unreachable!() };
            map.iter().map(|(k, v)| (k.clone(), v.clone(), ConfigOperation::Union, None)).collect()
        }
        Value::SchemaInstance(id) => {
            let guard = heap.get(*id);
            let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
            data.attrs.iter().map(|(k, v)| (k.clone(), v.clone(), ConfigOperation::Union, None)).collect()
        }
        _ => unreachable!(),
    };

    let config_keys = if opts.config_resolve {
        let guard = heap.get(target);
        let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
        Some(data.config_keys.clone())
    } else {
        None
    };

    for (key, value, operation, insert_index) in delta_entries {
        if let Some(keys) = &config_keys {
            if !keys.contains(&key.to_string()) {
                continue;
            }
        }
        let existing = {
            let guard = heap.get(target);
            let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
            data.attrs.get(&key).cloned()
        };
        let merged = match operation {
            ConfigOperation::Override => value,
            ConfigOperation::Insert => match (existing, insert_index) {
                (Some(Value::List(list_id)), Some(idx)) if idx >= 0 => {
                    insert_at(list_id, idx as usize, value, heap)?
                }
                (Some(Value::List(list_id)), _) => append_list(list_id, value, heap)?,
                (None, _) => Value::List(heap.alloc(HeapValue::List(vec![value]))),
                (Some(other), _) => return Err(type_error(&other, &Value::List(heap.alloc(HeapValue::List(vec![]))), heap)),
            },
            ConfigOperation::Unique => match existing {
                Some(existing) if !existing.value_eq(&value, heap) && !is_nullish(&existing) && !is_nullish(&value) => {
                    return Err(RunError::new(ErrorKind::UniqueKey, format!("unique key conflict for '{key}'")));
                }
                Some(existing) if !is_nullish(&existing) => existing,
                _ => value,
            },
            ConfigOperation::Unification => match existing {
                Some(existing) => {
                    if !value_subsumes(&value, &existing, true, heap) {
                        return Err(RunError::new(
                            ErrorKind::Value,
                            format!("unification conflict on attribute '{key}'"),
                        ));
                    }
                    existing
                }
                None => value,
            },
            ConfigOperation::Union => match existing {
                Some(existing) => {
                    if opts.idempotent_check && !value_subsumes(&value, &existing, true, heap) {
                        return Err(conflicting_values(&key, &existing, &value, heap));
                    }
                    union(existing, value, opts, heap)?
                }
                None => value,
            },
        };
        let mut data = heap.get_mut(target);
        let HeapValue::SchemaInstance(data) = &mut *data else { unreachable!() };
        data.attrs.insert(key, merged);
    }
    Ok(Value::SchemaInstance(target))
}

fn append_list(list_id: HeapId, value: Value, heap: &mut Heap) -> Result<Value, RunError> {
    let mut list = heap.get_mut(list_id);
    let HeapValue::List(items) = &mut *list else { return Err(RunError::Internal("insert: target not a list".into())) };
    items.push(value);
    Ok(Value::List(list_id))
}

fn insert_at(list_id: HeapId, index: usize, value: Value, heap: &mut Heap) -> Result<Value, RunError> {
    let mut list = heap.get_mut(list_id);
    let HeapValue::List(items) = &mut *list else { return Err(RunError::Internal("insert: target not a list".into())) };
    let idx = index.min(items.len());
    items.insert(idx, value);
    Ok(Value::List(list_id))
}

/// `override(=)`: delta replaces obj at the key, or at `insert_index` for a
/// list element (spec.md §4.3 `Override`).
pub fn override_attr(list_id: Option<HeapId>, index: Option<i64>, value: Value, heap: &mut Heap) -> Result<Value, RunError> {
    match (list_id, index) {
        (Some(id), Some(idx)) if idx >= 0 => {
            let mut list = heap.get_mut(id);
            let HeapValue::List(items) = &mut *list else { return Err(RunError::Internal("override: not a list".into())) };
            if (idx as usize) < items.len() {
                items[idx as usize] = value.clone();
            }
            Ok(Value::List(id))
        }
        _ => Ok(value),
    }
}

/// `insert(+=)`: append or insert-at-index into a list (spec.md §4.3 `Insert`).
pub fn insert_attr(existing: Option<Value>, index: Option<i64>, value: Value, heap: &mut Heap) -> Result<Value, RunError> {
    match existing {
        Some(Value::List(id)) => match index {
            Some(idx) if idx >= 0 => insert_at(id, idx as usize, value, heap),
            _ => append_list(id, value, heap),
        },
        None => Ok(Value::List(heap.alloc(HeapValue::List(vec![value])))),
        Some(other) => Err(RunError::new(ErrorKind::Type, format!("'+=' requires a list, got {}", other.kind_name(heap)))),
    }
}

/// `value_subsume(v1, v2)`: does `v1` describe a subset of what `v2`
/// describes? Structural, nullable on either side, recurses through
/// lists/dicts/schemas (spec.md §4.3 idempotence check; §8 law).
pub fn value_subsumes(v1: &Value, v2: &Value, recursive: bool, heap: &Heap) -> bool {
    if v1.value_eq(v2, heap) {
        return true;
    }
    if is_nullish(v1) || is_nullish(v2) {
        return true;
    }
    match (v1, v2) {
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            let guard_a = heap.get(*a);
            let HeapValue::List(xs) = &*guard_a else { return false };
            let guard_b = heap.get(*b);
            let HeapValue::List(ys) = &*guard_b else { return false };
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| value_subsumes(x, y, recursive, heap))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            let guard_a = heap.get(*a);
            let HeapValue::Dict(xs) = &*guard_a else { return false };
            let guard_b = heap.get(*b);
            let HeapValue::Dict(ys) = &*guard_b else { return false };
            dict_subsumes(xs, ys, recursive, heap)
        }
        (Value::SchemaInstance(a), Value::SchemaInstance(b)) => {
            let guard_a = heap.get(*a);
            let HeapValue::SchemaInstance(xs) = &*guard_a else { return false };
            let guard_b = heap.get(*b);
            let HeapValue::SchemaInstance(ys) = &*guard_b else { return false };
            dict_subsumes(&xs.attrs, &ys.attrs, recursive, heap)
        }
        _ => false,
    }
}

fn dict_subsumes(xs: &IndexMap<DictKey, Value>, ys: &IndexMap<DictKey, Value>, recursive: bool, heap: &Heap) -> bool {
    if xs.is_empty() {
        return true;
    }
    if xs.keys().all(|k| !ys.contains_key(k)) {
        return true;
    }
    if !recursive {
        return true;
    }
    for (k, v1) in xs {
        if let Some(v2) = ys.get(k) {
            if !value_subsumes(v1, v2, recursive, heap) {
                return false;
            }
        }
    }
    true
}

/// `merge(values)`: fold a sequence left-to-right via `union` with
/// `list_override = true` (spec.md §4.3 SUPPLEMENT, grounded in the
/// original evaluator's `merge()` helper).
pub fn merge(values: Vec<Value>, heap: &mut Heap) -> Result<Value, RunError> {
    let mut acc = Value::None;
    for v in values {
        if is_nullish(&v) {
            continue;
        }
        acc = union(acc, v, UnionOptions::overriding_lists(), heap)?;
    }
    Ok(acc)
}

/// Construct a schema-instance-not-found diagnostic for callers that need
/// to surface `CannotAddMembers` explicitly (relaxed-key handling owns the
/// happy path; unify only raises the generic type/conflict errors above).
pub fn cannot_add_members(keys: &[String], schema_name: &str) -> Diagnostic {
    Diagnostic::new(
        ErrorKind::CannotAddMembers,
        format!("cannot add members {:?} to schema '{}'", keys, schema_name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DictKey;

    fn dict(heap: &mut Heap, pairs: &[(&str, Value)]) -> Value {
        let mut map = IndexMap::new();
        for (k, v) in pairs {
            map.insert(DictKey::from(*k), v.clone());
        }
        Value::Dict(heap.alloc(HeapValue::Dict(map)))
    }

    #[test]
    fn basic_merge_combines_disjoint_keys() {
        let mut heap = Heap::new();
        let a = dict(&mut heap, &[("x", Value::Int(1))]);
        let b = dict(&mut heap, &[("y", Value::Int(2))]);
        let merged = union(a, b, UnionOptions::default(), &mut heap).unwrap();
        let Value::Dict(id) = merged else { panic!() };
        let guard = heap.get(id);
        let HeapValue::Dict(map) = &*guard else { panic!() };
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn insert_appends_to_existing_list() {
        let mut heap = Heap::new();
        let list = heap.alloc(HeapValue::List(vec![Value::Int(1), Value::Int(2)]));
        let result = insert_attr(Some(Value::List(list)), None, Value::Int(3), &mut heap).unwrap();
        let Value::List(id) = result else { panic!() };
        let guard = heap.get(id);
        let HeapValue::List(items) = &*guard else { panic!() };
        assert_eq!(items.len(), 3);
        assert!(matches!(items[2], Value::Int(3)));
    }

    #[test]
    fn idempotence_violation_reports_conflicting_values() {
        let mut heap = Heap::new();
        let a = dict(&mut heap, &[("k", Value::Int(1))]);
        let b = dict(&mut heap, &[("k", Value::Int(2))]);
        let err = union(a, b, UnionOptions::idempotent(), &mut heap).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Evaluation));
    }

    #[test]
    fn idempotent_union_of_identical_value_never_conflicts() {
        let mut heap = Heap::new();
        let a = dict(&mut heap, &[("k", Value::Int(1))]);
        let b = dict(&mut heap, &[("k", Value::Int(1))]);
        assert!(union(a, b, UnionOptions::idempotent(), &mut heap).is_ok());
    }

    #[test]
    fn value_subsume_is_nullable_on_either_side() {
        let heap = Heap::new();
        assert!(value_subsumes(&Value::None, &Value::Int(1), true, &heap));
        assert!(value_subsumes(&Value::Int(1), &Value::Undefined, true, &heap));
    }
}
