//! Calling convention opcodes (spec.md §4.4.4).
//!
//! `CALL_FUNCTION (nargs|nkwargs<<8)` pops keyword pairs, positional
//! args, then the callable, off the operand stack (spec.md §4.4.4
//! step 1; argument binding is step 2, delegated to
//! `args::bind_params`). `MAKE_FUNCTION`/`MAKE_CLOSURE` rebind a
//! compiler-emitted template `CompiledFunction` (pushed as a
//! `LOAD_CONST` with an empty closure) to its declared name and, for
//! closures, a snapshot of its captured free variables.

use std::rc::Rc;

use crate::args::bind_params;
use crate::diagnostics::{ErrorKind, RunError};
use crate::heap::{Heap, HeapId, HeapValue};
use crate::intern::{Interner, StringId};
use crate::program::Code;
use crate::types::Type;
use crate::value::{CompiledFunction, FunctionValue, Value};

fn pop_n(stack: &mut Vec<Value>, n: usize) -> Result<Vec<Value>, RunError> {
    if stack.len() < n {
        return Err(RunError::Internal("calls: stack underflow".into()));
    }
    Ok(stack.split_off(stack.len() - n))
}

/// What the dispatch loop should do after `CALL_FUNCTION` resolves the
/// callee: either push a new frame (a compiled function call) or push
/// a value directly (a builtin call, which runs to completion here).
pub enum CallOutcome {
    PushFrame { code: Rc<Code>, locals: Vec<Value>, pkgpath: String, closure: Vec<HeapId> },
    Value(Value),
    /// §4.4.4 step 4: the callee is a schema-def type, so `CALL_FUNCTION`
    /// runs the schema construction protocol (empty config/config_meta)
    /// instead of pushing a function frame. Finishing this needs the
    /// schema-type registry and a `SchemaHost`, which only the dispatch
    /// loop has in hand.
    BuildSchema { runtime_type: String, args: Vec<Value> },
    /// §4.4.4 step 5: the callee is `None`/`Undefined`; calling it is a
    /// silent no-op that hands the value straight back.
    NoOp(Value),
}

/// `CALL_FUNCTION`: pops `nkwargs` `(key, value)` pairs (key on top),
/// then `nargs` positional values, then the callable.
pub fn call_function(
    stack: &mut Vec<Value>,
    nargs: usize,
    nkwargs: usize,
    heap: &Heap,
    interner: &mut Interner,
) -> Result<CallOutcome, RunError> {
    let mut kwargs = Vec::with_capacity(nkwargs);
    for _ in 0..nkwargs {
        let value = stack.pop().ok_or_else(|| RunError::Internal("CALL_FUNCTION kwarg value".into()))?;
        let key = stack.pop().ok_or_else(|| RunError::Internal("CALL_FUNCTION kwarg key".into()))?;
        let Value::Str(k) = key else { return Err(RunError::new(ErrorKind::Compile, "keyword argument name must be a string")) };
        kwargs.push((interner.intern(&k), value));
    }
    kwargs.reverse();
    let positional = pop_n(stack, nargs)?;
    let callee = stack.pop().ok_or_else(|| RunError::Internal("CALL_FUNCTION callee".into()))?;
    dispatch_call(callee, positional, &kwargs, heap, interner)
}

fn dispatch_call(
    callee: Value,
    positional: Vec<Value>,
    kwargs: &[(StringId, Value)],
    heap: &Heap,
    interner: &mut Interner,
) -> Result<CallOutcome, RunError> {
    match callee {
        Value::Function(FunctionValue::Compiled(cf)) => {
            let bound = bind_params(&cf, positional, kwargs, |id| interner.resolve(id).to_string())?;
            Ok(CallOutcome::PushFrame { code: cf.code.clone(), locals: bound, pkgpath: cf.pkgpath.clone(), closure: cf.closure.clone() })
        }
        Value::Function(FunctionValue::Builtin(bf)) => {
            let named: Vec<(String, Value)> = kwargs.iter().map(|(k, v)| (interner.resolve(*k).to_string(), v.clone())).collect();
            let result = (bf.func)(&positional, &named)?;
            Ok(CallOutcome::Value(result))
        }
        Value::Function(FunctionValue::Bound(receiver, inner)) => {
            let mut args = Vec::with_capacity(positional.len() + 1);
            args.push(*receiver);
            args.extend(positional);
            dispatch_call(*inner, args, kwargs, heap, interner)
        }
        Value::Function(FunctionValue::Decorator(_)) => Err(RunError::new(ErrorKind::Type, "decorator values are not callable")),
        Value::Type(ty) => match &*ty {
            Type::SchemaDef(schema_ref) => Ok(CallOutcome::BuildSchema { runtime_type: schema_ref.runtime_type.clone(), args: positional }),
            _ => Err(RunError::new(ErrorKind::Type, format!("'{}' object is not callable", Value::Type(ty).kind_name(heap)))),
        },
        Value::None => Ok(CallOutcome::NoOp(Value::None)),
        Value::Undefined => Ok(CallOutcome::NoOp(Value::Undefined)),
        other => Err(RunError::new(ErrorKind::Type, format!("'{}' object is not callable", other.kind_name(heap)))),
    }
}

/// `MAKE_FUNCTION`: pops the declared name, rebinds `template` (a
/// `LOAD_CONST`-pushed compiled-function skeleton with no closure) to
/// it.
pub fn make_function(stack: &mut Vec<Value>, template: &CompiledFunction, interner: &mut Interner) -> Result<Value, RunError> {
    let name_val = stack.pop().ok_or_else(|| RunError::Internal("MAKE_FUNCTION name".into()))?;
    let Value::Str(name) = name_val else { return Err(RunError::new(ErrorKind::Compile, "function name must be a string")) };
    let cf = CompiledFunction {
        name: interner.intern(&name),
        pkgpath: template.pkgpath.clone(),
        params: template.params.clone(),
        code: template.code.clone(),
        closure: Vec::new(),
    };
    Ok(Value::Function(FunctionValue::Compiled(Rc::new(cf))))
}

/// `MAKE_CLOSURE n`: as `MAKE_FUNCTION`, plus a snapshot of `n`
/// captured free-variable values (pushed by preceding `LOAD_CLOSURE`s)
/// boxed into heap cells for `LOAD_FREE` to read back.
///
/// Captures are by value at closure-creation time, not a live shared
/// binding with the enclosing frame's locals — `Code` carries no
/// cell-var marking for the compiler (out of scope) to have flagged
/// which locals need boxing up front.
pub fn make_closure(
    stack: &mut Vec<Value>,
    template: &CompiledFunction,
    n_free: usize,
    interner: &mut Interner,
    heap: &mut Heap,
) -> Result<Value, RunError> {
    let name_val = stack.pop().ok_or_else(|| RunError::Internal("MAKE_CLOSURE name".into()))?;
    let Value::Str(name) = name_val else { return Err(RunError::new(ErrorKind::Compile, "function name must be a string")) };
    let captured = pop_n(stack, n_free)?;
    let closure: Vec<HeapId> = captured.into_iter().map(|v| heap.alloc(HeapValue::Cell(v))).collect();
    let cf = CompiledFunction {
        name: interner.intern(&name),
        pkgpath: template.pkgpath.clone(),
        params: template.params.clone(),
        code: template.code.clone(),
        closure,
    };
    Ok(Value::Function(FunctionValue::Compiled(Rc::new(cf))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchemaRef;
    use crate::value::Param;

    fn template(name: &str, interner: &mut Interner) -> CompiledFunction {
        CompiledFunction {
            name: interner.intern(name),
            pkgpath: "pkg".into(),
            params: vec![Param { name: interner.intern("a"), default: None, is_kwonly: false }],
            code: Rc::new(Code::default()),
            closure: Vec::new(),
        }
    }

    #[test]
    fn make_function_rebinds_name() {
        let mut interner = Interner::new();
        let tmpl = template("anonymous", &mut interner);
        let mut stack = vec![Value::str("greet")];
        let result = make_function(&mut stack, &tmpl, &mut interner).unwrap();
        let Value::Function(FunctionValue::Compiled(cf)) = result else { panic!() };
        assert_eq!(interner.resolve(cf.name), "greet");
        assert!(cf.closure.is_empty());
    }

    #[test]
    fn make_closure_boxes_captured_values() {
        let mut interner = Interner::new();
        let mut heap = Heap::new();
        let tmpl = template("anonymous", &mut interner);
        let mut stack = vec![Value::Int(42), Value::str("adder")];
        let result = make_closure(&mut stack, &tmpl, 1, &mut interner, &mut heap).unwrap();
        let Value::Function(FunctionValue::Compiled(cf)) = result else { panic!() };
        assert_eq!(cf.closure.len(), 1);
        let guard = heap.get(cf.closure[0]);
        assert!(matches!(&*guard, HeapValue::Cell(Value::Int(42))));
    }

    #[test]
    fn calling_a_non_function_is_a_type_error() {
        let mut interner = Interner::new();
        let heap = Heap::new();
        let mut stack = vec![Value::Int(1)];
        assert!(call_function(&mut stack, 0, 0, &heap, &mut interner).is_err());
    }

    #[test]
    fn calling_a_schema_def_requests_schema_construction() {
        let mut interner = Interner::new();
        let heap = Heap::new();
        let schema_ref = SchemaRef { runtime_type: "f1_Foo".into(), name: "Foo".into() };
        let mut stack = vec![Value::Type(Rc::new(Type::SchemaDef(schema_ref))), Value::Int(1)];
        let outcome = call_function(&mut stack, 1, 0, &heap, &mut interner).unwrap();
        let CallOutcome::BuildSchema { runtime_type, args } = outcome else { panic!("expected BuildSchema") };
        assert_eq!(runtime_type, "f1_Foo");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn calling_none_or_undefined_is_a_silent_no_op() {
        let mut interner = Interner::new();
        let heap = Heap::new();
        let mut stack = vec![Value::None];
        let outcome = call_function(&mut stack, 0, 0, &heap, &mut interner).unwrap();
        assert!(matches!(outcome, CallOutcome::NoOp(Value::None)));

        let mut stack = vec![Value::Undefined];
        let outcome = call_function(&mut stack, 0, 0, &heap, &mut interner).unwrap();
        assert!(matches!(outcome, CallOutcome::NoOp(Value::Undefined)));
    }
}
