//! Black-box tests for the union/override/insert unification engine
//! (spec.md §4.3), driven entirely through the public API.

use kcl_engine::{Heap, UnionOptions, Value, object_to_value, union, value_to_object};
use kcl_engine::object::Object;
use pretty_assertions::assert_eq;

fn obj_dict(pairs: &[(&str, Object)]) -> Object {
    let mut map = indexmap::IndexMap::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    Object::Dict(map)
}

#[test]
fn disjoint_dicts_union_into_their_combined_keys() {
    let mut heap = Heap::new();
    let a = object_to_value(&obj_dict(&[("a", Object::Int(1))]), &mut heap);
    let b = object_to_value(&obj_dict(&[("b", Object::Int(2))]), &mut heap);
    let merged = union(a, b, UnionOptions::default(), &mut heap).unwrap();
    let Object::Dict(out) = value_to_object(&merged, &heap).unwrap() else { panic!("expected a dict") };
    assert_eq!(out.get("a"), Some(&Object::Int(1)));
    assert_eq!(out.get("b"), Some(&Object::Int(2)));
}

#[test]
fn nested_lists_merge_element_wise_by_default() {
    let mut heap = Heap::new();
    let a = object_to_value(&Object::List(vec![Object::Int(1), Object::Int(2)]), &mut heap);
    let b = object_to_value(&Object::List(vec![Object::Int(9)]), &mut heap);
    let merged = union(a, b, UnionOptions::default(), &mut heap).unwrap();
    let Object::List(items) = value_to_object(&merged, &heap).unwrap() else { panic!("expected a list") };
    assert_eq!(items, vec![Object::Int(9), Object::Int(2)]);
}

#[test]
fn overriding_lists_replaces_wholesale() {
    let mut heap = Heap::new();
    let a = object_to_value(&Object::List(vec![Object::Int(1), Object::Int(2), Object::Int(3)]), &mut heap);
    let b = object_to_value(&Object::List(vec![Object::Int(9)]), &mut heap);
    let merged = union(a, b, UnionOptions::overriding_lists(), &mut heap).unwrap();
    let Object::List(items) = value_to_object(&merged, &heap).unwrap() else { panic!("expected a list") };
    assert_eq!(items, vec![Object::Int(9)]);
}

#[test]
fn idempotent_union_rejects_a_conflicting_rebind() {
    let mut heap = Heap::new();
    let a = object_to_value(&obj_dict(&[("replicas", Object::Int(3))]), &mut heap);
    let b = object_to_value(&obj_dict(&[("replicas", Object::Int(4))]), &mut heap);
    let err = union(a, b, UnionOptions::idempotent(), &mut heap).unwrap_err();
    assert!(err.kind().is_some());
}

#[test]
fn idempotent_union_of_a_repeated_identical_value_succeeds() {
    let mut heap = Heap::new();
    let a = object_to_value(&obj_dict(&[("replicas", Object::Int(3))]), &mut heap);
    let b = object_to_value(&obj_dict(&[("replicas", Object::Int(3))]), &mut heap);
    let merged = union(a, b, UnionOptions::idempotent(), &mut heap).unwrap();
    let Object::Dict(out) = value_to_object(&merged, &heap).unwrap() else { panic!("expected a dict") };
    assert_eq!(out.get("replicas"), Some(&Object::Int(3)));
}

#[test]
fn none_on_either_side_yields_the_other_value() {
    let mut heap = Heap::new();
    let merged = union(Value::None, Value::Int(7), UnionOptions::default(), &mut heap).unwrap();
    assert!(matches!(merged, Value::Int(7)));
    let merged = union(Value::Int(7), Value::Undefined, UnionOptions::default(), &mut heap).unwrap();
    assert!(matches!(merged, Value::Int(7)));
}

#[test]
fn mismatched_scalar_kinds_fail_to_unify() {
    let mut heap = Heap::new();
    let err = union(Value::Int(1), Value::str("nope"), UnionOptions::default(), &mut heap).unwrap_err();
    assert!(err.kind().is_some());
}
