//! Call-protocol argument bundles (spec.md §4.4.4).
//!
//! `CALL_FUNCTION (nargs|nkwargs<<8)` pops keyword pairs, then
//! positional arguments, then the callable, off the operand stack.
//! `ArgValues` mirrors the teacher's small-arity optimization (most
//! calls pass 0-2 positional args) so the common case skips a `Vec`
//! allocation.

use smallvec::SmallVec;

use crate::diagnostics::{ErrorKind, RunError};
use crate::intern::StringId;
use crate::value::{CompiledFunction, Param, Value};

pub type KwargsValues = SmallVec<[(StringId, Value); 2]>;

#[derive(Debug)]
pub enum ArgValues {
    Empty,
    One(Value),
    Two(Value, Value),
    Many(Vec<Value>),
}

impl ArgValues {
    pub fn from_vec(mut args: Vec<Value>) -> Self {
        match args.len() {
            0 => Self::Empty,
            1 => Self::One(args.pop().unwrap()),
            2 => {
                let b = args.pop().unwrap();
                let a = args.pop().unwrap();
                Self::Two(a, b)
            }
            _ => Self::Many(args),
        }
    }

    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Self::Empty => Vec::new(),
            Self::One(a) => vec![a],
            Self::Two(a, b) => vec![a, b],
            Self::Many(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::One(_) => 1,
            Self::Two(..) => 2,
            Self::Many(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bind positional and keyword arguments to a compiled function's
/// declared parameters (spec.md §4.4.4 step 2): positional by index,
/// then missing params fall back to their default, then kwargs bind
/// by name; an unrecognized kwarg name is a diagnostic.
pub fn bind_params(
    func: &CompiledFunction,
    positional: Vec<Value>,
    kwargs: &[(StringId, Value)],
    resolve_name: impl Fn(StringId) -> String,
) -> Result<Vec<Value>, RunError> {
    if positional.len() > func.params.len() {
        return Err(RunError::new(
            ErrorKind::IllegalArgument,
            format!("{} takes at most {} arguments ({} given)", resolve_name(func.name), func.params.len(), positional.len()),
        ));
    }

    let mut bound: Vec<Option<Value>> = positional.into_iter().map(Some).collect();
    bound.resize_with(func.params.len(), || None);

    for (param, slot) in func.params.iter().zip(bound.iter()) {
        if param.is_kwonly && slot.is_some() {
            return Err(RunError::new(
                ErrorKind::IllegalArgument,
                format!("{}() got a positional argument for keyword-only parameter '{}'", resolve_name(func.name), resolve_name(param.name)),
            ));
        }
    }

    for (kw_name, kw_value) in kwargs {
        let Some(idx) = func.params.iter().position(|p: &Param| p.name == *kw_name) else {
            return Err(RunError::new(
                ErrorKind::IllegalArgument,
                format!("{}() got an unexpected keyword argument '{}'", resolve_name(func.name), resolve_name(*kw_name)),
            ));
        };
        bound[idx] = Some(kw_value.clone());
    }

    let mut result = Vec::with_capacity(func.params.len());
    for (param, slot) in func.params.iter().zip(bound.into_iter()) {
        match slot.or_else(|| param.default.clone()) {
            Some(v) => result.push(v),
            None => {
                return Err(RunError::new(
                    ErrorKind::IllegalArgument,
                    format!("{}() missing required argument '{}'", resolve_name(func.name), resolve_name(param.name)),
                ));
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;
    use std::rc::Rc;

    fn func(params: Vec<Param>) -> CompiledFunction {
        CompiledFunction {
            name: StringId_for("f"),
            pkgpath: "pkg".into(),
            params,
            code: Rc::new(crate::program::Code::default()),
            closure: Vec::new(),
        }
    }

    #[allow(non_snake_case)]
    fn StringId_for(s: &str) -> StringId {
        let mut i = Interner::new();
        i.intern(s)
    }

    #[test]
    fn positional_binds_by_index() {
        let f = func(vec![Param { name: StringId_for("a"), default: None, is_kwonly: false }]);
        let bound = bind_params(&f, vec![Value::Int(1)], &[], |_| "a".into()).unwrap();
        assert!(matches!(bound[0], Value::Int(1)));
    }

    #[test]
    fn missing_required_arg_errors() {
        let f = func(vec![Param { name: StringId_for("a"), default: None, is_kwonly: false }]);
        assert!(bind_params(&f, vec![], &[], |_| "a".into()).is_err());
    }

    #[test]
    fn default_fills_missing_positional() {
        let f = func(vec![Param { name: StringId_for("a"), default: Some(Value::Int(9)), is_kwonly: false }]);
        let bound = bind_params(&f, vec![], &[], |_| "a".into()).unwrap();
        assert!(matches!(bound[0], Value::Int(9)));
    }

    #[test]
    fn unknown_kwarg_errors() {
        let f = func(vec![Param { name: StringId_for("a"), default: None, is_kwonly: false }]);
        let unknown = StringId_for("b");
        assert!(bind_params(&f, vec![Value::Int(1)], &[(unknown, Value::Int(2))], |_| "x".into()).is_err());
    }

    #[test]
    fn positional_argument_for_kwonly_param_errors() {
        let f = func(vec![Param { name: StringId_for("a"), default: None, is_kwonly: true }]);
        assert!(bind_params(&f, vec![Value::Int(1)], &[], |_| "a".into()).is_err());
    }

    #[test]
    fn keyword_argument_still_binds_a_kwonly_param() {
        let a = StringId_for("a");
        let f = func(vec![Param { name: a, default: None, is_kwonly: true }]);
        let bound = bind_params(&f, vec![], &[(a, Value::Int(7))], |_| "a".into()).unwrap();
        assert!(matches!(bound[0], Value::Int(7)));
    }
}
