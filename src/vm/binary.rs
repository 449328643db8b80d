//! Unary/binary arithmetic, comparison and membership opcodes
//! (spec.md §4.4.3 "Unary arithmetic", "Binary arithmetic /
//! comparison", "Membership/containment").
//!
//! These are pure functions over [`Value`] so the dispatch loop in
//! `vm/mod.rs` stays a thin pop/push/match shell. Grounded in the
//! teacher's `bytecode/vm/binary.rs`/`compare.rs` split, collapsed
//! into one module since KCL has far fewer numeric-tower cases than
//! CPython's operator overloading.

use crate::diagnostics::{ErrorKind, RunError};
use crate::heap::{Heap, HeapValue};
use crate::value::Value;

fn type_error(op: &str, lhs: &Value, rhs: &Value, heap: &Heap) -> RunError {
    RunError::new(
        ErrorKind::Type,
        format!("unsupported operand type(s) for {op}: '{}' and '{}'", lhs.kind_name(heap), rhs.kind_name(heap)),
    )
}

pub fn unary_positive(v: &Value, heap: &Heap) -> Result<Value, RunError> {
    match v {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        _ => Err(RunError::new(ErrorKind::Type, format!("bad operand type for unary +: '{}'", v.kind_name(heap)))),
    }
}

pub fn unary_negative(v: &Value, heap: &Heap) -> Result<Value, RunError> {
    match v {
        Value::Int(i) => Ok(Value::Int(-i)),
        Value::Float(f) => Ok(Value::Float(-f)),
        Value::Bool(b) => Ok(Value::Int(-i64::from(*b))),
        _ => Err(RunError::new(ErrorKind::Type, format!("bad operand type for unary -: '{}'", v.kind_name(heap)))),
    }
}

pub fn unary_invert(v: &Value, heap: &Heap) -> Result<Value, RunError> {
    match v {
        Value::Int(i) => Ok(Value::Int(!i)),
        _ => Err(RunError::new(ErrorKind::Type, format!("bad operand type for unary ~: '{}'", v.kind_name(heap)))),
    }
}

pub fn unary_not(v: &Value, heap: &Heap) -> Value {
    Value::Bool(!v.is_truthy(heap))
}

enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(v: &Value) -> Option<Num> {
    match v {
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(f) => Some(Num::Float(*f)),
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        _ => None,
    }
}

/// `int + int -> int`, else promote to float (spec.md §4.4.3).
fn numeric_binop(
    op: &str,
    lhs: &Value,
    rhs: &Value,
    heap: &Heap,
    int_op: impl Fn(i64, i64) -> Result<i64, RunError>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, RunError> {
    match (as_num(lhs), as_num(rhs)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(Value::Int(int_op(a, b)?)),
        (Some(a), Some(b)) => {
            let af = match a {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let bf = match b {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            Ok(Value::Float(float_op(af, bf)))
        }
        _ => Err(type_error(op, lhs, rhs, heap)),
    }
}

pub fn binary_add(lhs: &Value, rhs: &Value, heap: &mut Heap) -> Result<Value, RunError> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{a}{b}").as_str())),
        (Value::List(a), Value::List(b)) => {
            let mut items = {
                let guard = heap.get(*a);
                let HeapValue::List(xs) = &*guard else { return Err(RunError::Internal("binary_add: not a list".into())) };
                xs.clone()
            };
            let guard = heap.get(*b);
            let HeapValue::List(ys) = &*guard else { return Err(RunError::Internal("binary_add: not a list".into())) };
            items.extend(ys.iter().cloned());
            drop(guard);
            Ok(Value::List(heap.alloc(HeapValue::List(items))))
        }
        _ => numeric_binop("+", lhs, rhs, heap, |a, b| Ok(a.wrapping_add(b)), |a, b| a + b),
    }
}

pub fn binary_subtract(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    numeric_binop("-", lhs, rhs, heap, |a, b| Ok(a.wrapping_sub(b)), |a, b| a - b)
}

pub fn binary_multiply(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    if let (Value::Str(s), Some(Num::Int(n))) = (lhs, as_num(rhs)) {
        return Ok(Value::str(s.repeat(n.max(0) as usize).as_str()));
    }
    numeric_binop("*", lhs, rhs, heap, |a, b| Ok(a.wrapping_mul(b)), |a, b| a * b)
}

pub fn binary_divide(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    match (as_num(lhs), as_num(rhs)) {
        (Some(a), Some(b)) => {
            let af = match a {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let bf = match b {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            if bf == 0.0 {
                return Err(RunError::new(ErrorKind::Value, "division by zero"));
            }
            Ok(Value::Float(af / bf))
        }
        _ => Err(type_error("/", lhs, rhs, heap)),
    }
}

pub fn binary_floor_divide(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    numeric_binop(
        "//",
        lhs,
        rhs,
        heap,
        |a, b| {
            if b == 0 {
                return Err(RunError::new(ErrorKind::Value, "integer division by zero"));
            }
            Ok(a.div_euclid(b))
        },
        |a, b| (a / b).floor(),
    )
}

pub fn binary_modulo(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    numeric_binop(
        "%",
        lhs,
        rhs,
        heap,
        |a, b| {
            if b == 0 {
                return Err(RunError::new(ErrorKind::Value, "integer modulo by zero"));
            }
            Ok(a.rem_euclid(b))
        },
        |a, b| a.rem_euclid(b),
    )
}

pub fn binary_power(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    match (as_num(lhs), as_num(rhs)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) if b >= 0 => Ok(Value::Int(a.pow(b as u32))),
        (Some(a), Some(b)) => {
            let af = match a {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let bf = match b {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            Ok(Value::Float(af.powf(bf)))
        }
        _ => Err(type_error("**", lhs, rhs, heap)),
    }
}

fn int_binop(op: &str, lhs: &Value, rhs: &Value, heap: &Heap, f: impl Fn(i64, i64) -> i64) -> Result<Value, RunError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(f(*a, *b))),
        _ => Err(type_error(op, lhs, rhs, heap)),
    }
}

pub fn binary_lshift(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    int_binop("<<", lhs, rhs, heap, |a, b| a.wrapping_shl(b as u32))
}

pub fn binary_rshift(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    int_binop(">>", lhs, rhs, heap, |a, b| a.wrapping_shr(b as u32))
}

pub fn binary_and(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a && *b)),
        _ => int_binop("&", lhs, rhs, heap, |a, b| a & b),
    }
}

pub fn binary_or(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a || *b)),
        _ => int_binop("|", lhs, rhs, heap, |a, b| a | b),
    }
}

pub fn binary_xor(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a ^ *b)),
        _ => int_binop("^", lhs, rhs, heap, |a, b| a ^ b),
    }
}

fn numeric_cmp(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (as_num(lhs), as_num(rhs)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a.partial_cmp(&b),
        (Some(a), Some(b)) => {
            let af = match a {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let bf = match b {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            af.partial_cmp(&bf)
        }
        _ => None,
    }
}

pub fn compare_equal(lhs: &Value, rhs: &Value, heap: &Heap) -> Value {
    Value::Bool(lhs.value_eq(rhs, heap))
}

pub fn compare_not_equal(lhs: &Value, rhs: &Value, heap: &Heap) -> Value {
    Value::Bool(!lhs.value_eq(rhs, heap))
}

fn ordering_compare(op: &str, lhs: &Value, rhs: &Value, heap: &Heap, want: impl Fn(std::cmp::Ordering) -> bool) -> Result<Value, RunError> {
    if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
        return Ok(Value::Bool(want(a.cmp(b))));
    }
    match numeric_cmp(lhs, rhs) {
        Some(ord) => Ok(Value::Bool(want(ord))),
        None => Err(type_error(op, lhs, rhs, heap)),
    }
}

pub fn compare_less(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    ordering_compare("<", lhs, rhs, heap, |o| o == std::cmp::Ordering::Less)
}

pub fn compare_less_equal(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    ordering_compare("<=", lhs, rhs, heap, |o| o != std::cmp::Ordering::Greater)
}

pub fn compare_greater(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    ordering_compare(">", lhs, rhs, heap, |o| o == std::cmp::Ordering::Greater)
}

pub fn compare_greater_equal(lhs: &Value, rhs: &Value, heap: &Heap) -> Result<Value, RunError> {
    ordering_compare(">=", lhs, rhs, heap, |o| o != std::cmp::Ordering::Less)
}

/// `in` / `not in` (spec.md §4.4.3 "Membership/containment").
pub fn compare_in(item: &Value, container: &Value, heap: &Heap) -> Result<Value, RunError> {
    Ok(Value::Bool(contains(item, container, heap)?))
}

pub fn compare_not_in(item: &Value, container: &Value, heap: &Heap) -> Result<Value, RunError> {
    Ok(Value::Bool(!contains(item, container, heap)?))
}

fn contains(item: &Value, container: &Value, heap: &Heap) -> Result<bool, RunError> {
    match container {
        Value::List(id) => {
            let guard = heap.get(*id);
            let HeapValue::List(items) = &*guard else { return Err(RunError::Internal("contains: not a list".into())) };
            Ok(items.iter().any(|v| v.value_eq(item, heap)))
        }
        Value::Dict(id) => {
            let guard = heap.get(*id);
            let HeapValue::Dict(map) = &*guard else { return Err(RunError::Internal("contains: not a dict".into())) };
            let Value::Str(key) = item else { return Ok(false) };
            Ok(map.keys().any(|k| k.to_string() == key.as_ref()))
        }
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            _ => Err(type_error("in", item, container, heap)),
        },
        _ => Err(type_error("in", item, container, heap)),
    }
}

/// `is` / `is not`: identity for heap-backed values, value equality for
/// scalars — KCL has no distinct object identity for immediates
/// (spec.md §4.4.3).
pub fn compare_is(lhs: &Value, rhs: &Value, heap: &Heap) -> Value {
    Value::Bool(identity_eq(lhs, rhs, heap))
}

pub fn compare_is_not(lhs: &Value, rhs: &Value, heap: &Heap) -> Value {
    Value::Bool(!identity_eq(lhs, rhs, heap))
}

fn identity_eq(lhs: &Value, rhs: &Value, heap: &Heap) -> bool {
    match (lhs, rhs) {
        (Value::List(a), Value::List(b))
        | (Value::Dict(a), Value::Dict(b))
        | (Value::SchemaInstance(a), Value::SchemaInstance(b))
        | (Value::Module(a), Value::Module(b)) => a == b,
        (Value::None, Value::None) | (Value::Undefined, Value::Undefined) => true,
        _ => lhs.value_eq(rhs, heap),
    }
}

/// `MEMBER_SHIP_AS`: coerce TOS to a named type (spec.md §4.4.3 "Type
/// cast"). Int<->Float permitted, `Any` passes through, List/Dict/Schema
/// recurse element-wise, everything else is a type error.
pub fn type_convert(value: Value, ty: &crate::types::Type, heap: &mut Heap) -> Result<Value, RunError> {
    use crate::types::Type;
    match ty {
        Type::Any => Ok(value),
        Type::Int => match value {
            Value::Int(_) => Ok(value),
            Value::Float(f) => Ok(Value::Int(f as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            _ => Err(cast_error(&value, "int", heap)),
        },
        Type::Float => match value {
            Value::Float(_) => Ok(value),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::Bool(b) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
            _ => Err(cast_error(&value, "float", heap)),
        },
        Type::Str => match &value {
            Value::Str(_) => Ok(value),
            _ => Err(cast_error(&value, "str", heap)),
        },
        Type::Bool => match value {
            Value::Bool(_) => Ok(value),
            other => Ok(Value::Bool(other.is_truthy(heap))),
        },
        Type::List(item_ty) => match value {
            Value::List(id) => {
                let items = {
                    let guard = heap.get(id);
                    let HeapValue::List(xs) = &*guard else { return Err(RunError::Internal("type_convert: not a list".into())) };
                    xs.clone()
                };
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(type_convert(item, item_ty, heap)?);
                }
                Ok(Value::List(heap.alloc(HeapValue::List(out))))
            }
            _ => Err(cast_error(&value, "list", heap)),
        },
        Type::Dict(_, value_ty) => match value {
            Value::Dict(id) => {
                let entries = {
                    let guard = heap.get(id);
                    let HeapValue::Dict(map) = &*guard else { return Err(RunError::Internal("type_convert: not a dict".into())) };
                    map.clone()
                };
                let mut out = indexmap::IndexMap::new();
                for (k, v) in entries {
                    out.insert(k, type_convert(v, value_ty, heap)?);
                }
                Ok(Value::Dict(heap.alloc(HeapValue::Dict(out))))
            }
            _ => Err(cast_error(&value, "dict", heap)),
        },
        Type::Schema(_) | Type::SchemaDef(_) => match value {
            Value::SchemaInstance(_) => Ok(value),
            _ => Err(cast_error(&value, &ty.ty_str(), heap)),
        },
        _ => Ok(value),
    }
}

fn cast_error(value: &Value, target: &str, heap: &Heap) -> RunError {
    RunError::new(ErrorKind::Type, format!("cannot convert '{}' to '{target}'", value.kind_name(heap)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_promotes_int_plus_float_to_float() {
        let heap = Heap::new();
        let mut heap_mut = heap;
        let result = binary_add(&Value::Int(1), &Value::Float(2.5), &mut heap_mut).unwrap();
        assert!(matches!(result, Value::Float(f) if f == 3.5));
    }

    #[test]
    fn add_concatenates_strings() {
        let mut heap = Heap::new();
        let result = binary_add(&Value::str("a"), &Value::str("b"), &mut heap).unwrap();
        assert!(matches!(result, Value::Str(s) if &*s == "ab"));
    }

    #[test]
    fn add_concatenates_lists() {
        let mut heap = Heap::new();
        let a = Value::List(heap.alloc(HeapValue::List(vec![Value::Int(1)])));
        let b = Value::List(heap.alloc(HeapValue::List(vec![Value::Int(2)])));
        let result = binary_add(&a, &b, &mut heap).unwrap();
        let Value::List(id) = result else { panic!() };
        let guard = heap.get(id);
        let HeapValue::List(items) = &*guard else { panic!() };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn floor_divide_by_zero_errors() {
        let heap = Heap::new();
        assert!(binary_floor_divide(&Value::Int(1), &Value::Int(0), &heap).is_err());
    }

    #[test]
    fn ordering_compares_strings_lexicographically() {
        let heap = Heap::new();
        assert!(matches!(compare_less(&Value::str("a"), &Value::str("b"), &heap), Ok(Value::Bool(true))));
    }

    #[test]
    fn membership_checks_list_contents() {
        let mut heap = Heap::new();
        let list = Value::List(heap.alloc(HeapValue::List(vec![Value::Int(1), Value::Int(2)])));
        assert!(matches!(compare_in(&Value::Int(2), &list, &heap), Ok(Value::Bool(true))));
        assert!(matches!(compare_in(&Value::Int(3), &list, &heap), Ok(Value::Bool(false))));
    }

    #[test]
    fn type_convert_widens_int_to_float() {
        let mut heap = Heap::new();
        let result = type_convert(Value::Int(3), &crate::types::Type::Float, &mut heap).unwrap();
        assert!(matches!(result, Value::Float(f) if f == 3.0));
    }
}
