//! The structural type system (spec.md §3.2, §4.2).
//!
//! `Type` is cheaply cloned (`Rc`-wrapped arms) since the same type is
//! referenced from many attribute declarations and diagnostics.

use std::fmt;
use std::rc::Rc;

use crate::diagnostics::{CodeRange, Diagnostic, ErrorKind, RunError};
use crate::heap::Heap;
use crate::value::{HeapValue, Value};

pub type TypeRef = Rc<Type>;

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Any,
    None,
    Void,
    Bool,
    Int,
    Float,
    Str,
    BoolLit(bool),
    IntLit(i64),
    FloatLit(u64), // bit pattern, for Eq/Hash-friendly comparisons
    StrLit(String),
    List(TypeRef),
    Dict(TypeRef, TypeRef),
    Union(Vec<TypeRef>),
    Schema(SchemaRef),
    SchemaDef(SchemaRef),
    NumberMultiplier(Option<(i64, String)>),
    Module,
    /// Pre-resolution placeholder; the compiler/resolver is expected to
    /// replace these before the VM sees a finished program, but the
    /// runtime still needs to name them in diagnostics.
    Named(String),
    Function { params: Vec<TypeRef>, ret: TypeRef },
}

/// A lightweight handle into the schema-type registry (spec.md §3.3),
/// carrying just enough identity to render diagnostics and to compare
/// subsumption without the registry in hand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaRef {
    pub runtime_type: String,
    pub name: String,
}

impl Type {
    pub fn float_lit(v: f64) -> Self {
        Self::FloatLit(v.to_bits())
    }

    pub fn ty_str(&self) -> String {
        match self {
            Self::Any => "any".into(),
            Self::None => "None".into(),
            Self::Void => "void".into(),
            Self::Bool => "bool".into(),
            Self::BoolLit(v) => format!("bool({v})"),
            Self::Int => "int".into(),
            Self::IntLit(v) => format!("int({v})"),
            Self::Float => "float".into(),
            Self::FloatLit(bits) => format!("float({})", f64::from_bits(*bits)),
            Self::Str => "str".into(),
            Self::StrLit(v) => format!("str({v:?})"),
            Self::List(t) => format!("[{}]", t.ty_str()),
            Self::Dict(k, v) => format!("{{{}:{}}}", k.ty_str(), v.ty_str()),
            Self::Union(arms) => arms.iter().map(|t| t.ty_str()).collect::<Vec<_>>().join(" | "),
            Self::Schema(s) | Self::SchemaDef(s) => s.name.clone(),
            Self::NumberMultiplier(Some((raw, suffix))) => format!("{raw}{suffix}"),
            Self::NumberMultiplier(None) => "units.NumberMultiplier".into(),
            Self::Module => "module".into(),
            Self::Named(name) => name.clone(),
            Self::Function { .. } => "function".into(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty_str())
    }
}

/// Whether a schema type `s` reaches `target` by walking `base` links.
/// Provided by the caller since the registry, not this module, owns
/// the inheritance graph.
pub trait BaseWalker {
    fn base_of(&self, schema: &SchemaRef) -> Option<SchemaRef>;
}

/// `T1 ⊑ T2`: does `t1` subsume `t2` (is `t1` an upper bound of `t2`)?
/// (spec.md §3.2)
pub fn subsumes(t1: &Type, t2: &Type, bases: &dyn BaseWalker) -> bool {
    match (t1, t2) {
        (Type::Any, _) => true,
        (_, Type::Any) => true,
        (Type::Union(arms), _) => arms.iter().all(|a| subsumes(a, t2, bases)),
        (_, Type::Union(arms)) => arms.iter().any(|a| subsumes(t1, a, bases)),
        (Type::Int, Type::IntLit(_)) => true,
        (Type::Float, Type::FloatLit(_)) => true,
        (Type::Float, Type::Int | Type::IntLit(_)) => true,
        (Type::Str, Type::StrLit(_)) => true,
        (Type::Bool, Type::BoolLit(_)) => true,
        (Type::IntLit(a), Type::IntLit(b)) => a == b,
        (Type::FloatLit(a), Type::FloatLit(b)) => a == b,
        (Type::StrLit(a), Type::StrLit(b)) => a == b,
        (Type::BoolLit(a), Type::BoolLit(b)) => a == b,
        (Type::List(a), Type::List(b)) => subsumes(a, b, bases),
        (Type::Dict(k1, v1), Type::Dict(k2, v2)) => subsumes(k1, k2, bases) && subsumes(v1, v2, bases),
        (Type::Schema(s1), Type::Schema(s2)) => schema_reaches(s1, s2, bases),
        (Type::SchemaDef(s1), Type::SchemaDef(s2)) => s1 == s2,
        (Type::NumberMultiplier(None), Type::NumberMultiplier(_)) => true,
        (Type::NumberMultiplier(Some(a)), Type::NumberMultiplier(Some(b))) => a == b,
        (Type::None, Type::None) | (Type::Void, Type::Void) | (Type::Module, Type::Module) => true,
        (Type::Named(a), Type::Named(b)) => a == b,
        _ => t1 == t2,
    }
}

fn schema_reaches(target: &SchemaRef, from: &SchemaRef, bases: &dyn BaseWalker) -> bool {
    let mut cur = from.clone();
    loop {
        if &cur == target {
            return true;
        }
        match bases.base_of(&cur) {
            Some(next) => cur = next,
            None => return false,
        }
    }
}

/// Minimal upper bound: dedups and drops arms subsumed by another arm
/// in the set (spec.md §3.2, §8 invariant `sup(ts) ⊒ t`).
pub fn sup(ts: &[TypeRef], bases: &dyn BaseWalker) -> Type {
    if ts.is_empty() {
        return Type::Void;
    }
    if ts.len() == 1 {
        return (*ts[0]).clone();
    }
    let mut kept: Vec<TypeRef> = Vec::new();
    'outer: for (i, t) in ts.iter().enumerate() {
        for (j, other) in ts.iter().enumerate() {
            if i != j && subsumes(other, t, bases) && !subsumes(t, other, bases) {
                continue 'outer;
            }
        }
        if !kept.iter().any(|k| subsumes(k, t, bases)) {
            kept.push(t.clone());
        }
    }
    if kept.len() == 1 {
        (*kept[0]).clone()
    } else {
        Type::Union(kept)
    }
}

/// Widen literal arms to their declarable base kind, used when
/// inferring a variable's declared type from an observed value type
/// (spec.md §4.2 `infer_to_variable_type`).
pub fn infer_to_variable_type(t: &Type) -> Type {
    match t {
        Type::BoolLit(_) => Type::Bool,
        Type::IntLit(_) => Type::Int,
        Type::FloatLit(_) => Type::Float,
        Type::StrLit(_) => Type::Str,
        Type::Union(arms) => Type::Union(arms.iter().map(|a| Rc::new(infer_to_variable_type(a))).collect()),
        Type::List(item) => Type::List(Rc::new(infer_to_variable_type(item))),
        other => other.clone(),
    }
}

/// `assignable_to(src, dst)`: is a value of type `src` assignable to a
/// slot declared as `dst`? Equivalent to `src ⊑ dst` (spec.md §4.2).
pub fn assignable_to(src: &Type, dst: &Type, bases: &dyn BaseWalker) -> bool {
    subsumes(dst, src, bases)
}

/// Infers a value's runtime type for [`check_type`]: the literal kind it
/// was constructed with, widened to `Any` once we run out of structure to
/// inspect (spec.md §4.2).
pub fn infer_value_type(value: &Value, heap: &Heap) -> Type {
    match value {
        Value::None => Type::None,
        Value::Undefined => Type::Void,
        Value::Bool(b) => Type::BoolLit(*b),
        Value::Int(i) => Type::IntLit(*i),
        Value::Float(f) => Type::float_lit(*f),
        Value::Str(s) => Type::StrLit(s.to_string()),
        Value::List(id) => {
            let guard = heap.get(*id);
            let HeapValue::List(items) = &*guard else { return Type::List(Rc::new(Type::Any)) };
            let item_ty = items.first().map(|v| infer_value_type(v, heap)).unwrap_or(Type::Any);
            Type::List(Rc::new(item_ty))
        }
        Value::SchemaInstance(id) => {
            let guard = heap.get(*id);
            let HeapValue::SchemaInstance(data) = &*guard else { return Type::Any };
            Type::Schema(SchemaRef { runtime_type: data.runtime_type.clone(), name: data.name.clone() })
        }
        _ => Type::Any,
    }
}

/// `check_type(value, type)` (spec.md §4.2): does `value` satisfy `ty`?
/// The general assignability predicate behind every typed attribute
/// binding — index-signature value checks, relaxed-key admission, and
/// the round-trip laws of spec.md §8 all reduce to this.
pub fn check_type(value: &Value, ty: &Type, heap: &Heap, bases: &dyn BaseWalker) -> bool {
    subsumes(ty, &infer_value_type(value, heap), bases)
}

/// `type_pack_and_check`: verify assignability and report a
/// type-mismatch diagnostic carrying the most specific position
/// available (spec.md §4.2).
pub fn type_pack_and_check(
    value_ty: &Type,
    expected: &Type,
    bases: &dyn BaseWalker,
    position: Option<CodeRange>,
) -> Result<(), RunError> {
    if assignable_to(value_ty, expected, bases) {
        return Ok(());
    }
    let mut diag =
        Diagnostic::new(ErrorKind::Type, format!("expected type '{}', got '{}'", expected.ty_str(), value_ty.ty_str()));
    if let Some(pos) = position {
        diag = diag.with_position(pos);
    }
    Err(diag.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoBases;
    impl BaseWalker for NoBases {
        fn base_of(&self, _schema: &SchemaRef) -> Option<SchemaRef> {
            None
        }
    }

    struct ChainBases(Vec<(SchemaRef, SchemaRef)>);
    impl BaseWalker for ChainBases {
        fn base_of(&self, schema: &SchemaRef) -> Option<SchemaRef> {
            self.0.iter().find(|(child, _)| child == schema).map(|(_, base)| base.clone())
        }
    }

    #[test]
    fn any_subsumes_everything_and_vice_versa() {
        let bases = NoBases;
        assert!(subsumes(&Type::Any, &Type::Int, &bases));
        assert!(subsumes(&Type::Int, &Type::Any, &bases));
    }

    #[test]
    fn literal_subsumes_into_base_kind() {
        let bases = NoBases;
        assert!(subsumes(&Type::Int, &Type::IntLit(3), &bases));
        assert!(subsumes(&Type::Float, &Type::IntLit(3), &bases));
        assert!(!subsumes(&Type::IntLit(3), &Type::Int, &bases));
    }

    #[test]
    fn union_on_left_requires_all_arms_to_subsume() {
        let bases = NoBases;
        let u = Type::Union(vec![Rc::new(Type::Int), Rc::new(Type::Str)]);
        assert!(!subsumes(&u, &Type::Int, &bases));
        let u2 = Type::Union(vec![Rc::new(Type::Any)]);
        assert!(subsumes(&u2, &Type::Str, &bases));
    }

    #[test]
    fn union_on_right_any_arm_suffices() {
        let bases = NoBases;
        let u = Type::Union(vec![Rc::new(Type::Int), Rc::new(Type::Str)]);
        assert!(subsumes(&Type::Str, &u, &bases));
    }

    #[test]
    fn schema_subsumes_through_base_chain() {
        let child = SchemaRef { runtime_type: "f1_Child".into(), name: "Child".into() };
        let parent = SchemaRef { runtime_type: "f1_Parent".into(), name: "Parent".into() };
        let bases = ChainBases(vec![(child.clone(), parent.clone())]);
        assert!(subsumes(&Type::Schema(parent), &Type::Schema(child), &bases));
    }

    #[test]
    fn sup_deduplicates_and_drops_subsumed_arms() {
        let bases = NoBases;
        let ts = vec![Rc::new(Type::IntLit(1)), Rc::new(Type::Int)];
        let result = sup(&ts, &bases);
        assert_eq!(result, Type::Int);
        for t in &ts {
            assert!(subsumes(&result, t, &bases));
        }
    }

    #[test]
    fn infer_widens_literals() {
        assert_eq!(infer_to_variable_type(&Type::IntLit(3)), Type::Int);
        assert_eq!(infer_to_variable_type(&Type::StrLit("a".into())), Type::Str);
    }

    #[test]
    fn check_type_accepts_a_conforming_scalar() {
        let heap = Heap::new();
        let bases = NoBases;
        assert!(check_type(&Value::Int(3), &Type::Int, &heap, &bases));
        assert!(!check_type(&Value::Str("x".into()), &Type::Int, &heap, &bases));
    }

    #[test]
    fn check_type_walks_list_element_types() {
        let mut heap = Heap::new();
        let bases = NoBases;
        let id = heap.alloc(HeapValue::List(vec![Value::Int(1)]));
        let list_ty = Type::List(Rc::new(Type::Int));
        assert!(check_type(&Value::List(id), &list_ty, &heap, &bases));
    }
}
