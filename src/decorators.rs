//! Decorator factory (spec.md §4.5.4).
//!
//! A decorator is a named host routine resolved by name at declaration
//! time and bound to either a schema type (runs once after construction)
//! or an attribute (runs during stage 17 of instance materialization).
//! Only `deprecated` and `info` are built in; an unrecognized name is a
//! compile-time error upstream, but the engine still guards at runtime in
//! case of dynamic construction (spec.md §9).

use crate::diagnostics::{ErrorKind, RunError};
use crate::value::{DecoratorTarget, DecoratorValue, Value};

/// Outcome of running a decorator against one attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoratorOutcome {
    /// Leave the value as-is.
    Unchanged,
    /// Replace the value (e.g. `deprecated` nulls a referenced attribute).
    Replace(Value),
    /// Emit this as a non-fatal warning, value unchanged.
    Warn(String),
}

fn string_arg(decorator: &DecoratorValue, index: usize, name: &str) -> Option<String> {
    decorator
        .kwargs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
        .or_else(|| decorator.args.get(index))
        .and_then(|v| match v {
            Value::Str(s) => Some(s.to_string()),
            _ => None,
        })
}

fn bool_arg(decorator: &DecoratorValue, index: usize, name: &str, default: bool) -> bool {
    decorator
        .kwargs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
        .or_else(|| decorator.args.get(index))
        .map_or(default, |v| matches!(v, Value::Bool(true)))
}

/// Look up and run a decorator by name. Called once per schema-level
/// decorator after construction, or once per attribute during stage 17 of
/// `BUILD_SCHEMA` (spec.md §4.5.2 step 17).
pub fn run_decorator(
    decorator: &DecoratorValue,
    attr_name: &str,
    attr_was_referenced: bool,
) -> Result<DecoratorOutcome, RunError> {
    match decorator.name.as_str() {
        "deprecated" => run_deprecated(decorator, attr_name, attr_was_referenced),
        "info" => Ok(DecoratorOutcome::Unchanged),
        other => Err(RunError::new(
            ErrorKind::IllegalAttribute,
            format!("unknown decorator '{other}'"),
        )),
    }
}

fn run_deprecated(decorator: &DecoratorValue, attr_name: &str, attr_was_referenced: bool) -> Result<DecoratorOutcome, RunError> {
    let version = string_arg(decorator, 0, "version").unwrap_or_default();
    let reason = string_arg(decorator, 1, "reason").unwrap_or_default();
    let strict = bool_arg(decorator, 2, "strict", true);

    if !attr_was_referenced {
        return Ok(DecoratorOutcome::Unchanged);
    }

    let message = if version.is_empty() {
        format!("attribute '{attr_name}' is deprecated: {reason}")
    } else {
        format!("attribute '{attr_name}' is deprecated since version {version}: {reason}")
    };

    if strict {
        Err(RunError::new(ErrorKind::Attribute, message))
    } else {
        Ok(DecoratorOutcome::Warn(message))
    }
}

/// Validate that a declared decorator name is one the factory recognizes,
/// without running it — used when a schema/attribute's decorators are
/// attached at type-construction time (`MAKE_SCHEMA`/`SCHEMA_ATTR`) so an
/// unknown name is rejected before any instance is built.
pub fn validate_decorator_name(name: &str, target: DecoratorTarget) -> Result<(), RunError> {
    match (name, target) {
        ("deprecated" | "info", _) => Ok(()),
        (other, _) => Err(RunError::new(ErrorKind::IllegalAttribute, format!("unknown decorator '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deco(name: &str, args: Vec<Value>) -> DecoratorValue {
        DecoratorValue { name: name.into(), args, kwargs: Vec::new(), target: DecoratorTarget::Attribute }
    }

    #[test]
    fn deprecated_strict_raises_when_referenced() {
        let d = deco("deprecated", vec![Value::str("1.0"), Value::str("use y instead"), Value::Bool(true)]);
        let err = run_decorator(&d, "x", true).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Attribute));
    }

    #[test]
    fn deprecated_non_strict_warns_and_is_unchanged_when_not_referenced() {
        let d = deco("deprecated", vec![Value::str("1.0"), Value::str("r"), Value::Bool(false)]);
        assert_eq!(run_decorator(&d, "x", false).unwrap(), DecoratorOutcome::Unchanged);
        let outcome = run_decorator(&d, "x", true).unwrap();
        assert!(matches!(outcome, DecoratorOutcome::Warn(_)));
    }

    #[test]
    fn unknown_decorator_errors_at_runtime() {
        let d = deco("nope", vec![]);
        let err = run_decorator(&d, "x", true).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::IllegalAttribute));
    }
}
