//! The tagged value model (spec.md §3.1).
//!
//! Scalars and small immediates live inline on `Value`; collections,
//! schema instances/configs, modules, and iterators are heap-allocated
//! behind a [`HeapId`] (see `heap.rs`) so they can be aliased across
//! frames during schema construction without a deep copy at every
//! hand-off.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::heap::{Heap, HeapId};
use crate::intern::StringId;
use crate::program::Code;
use crate::types::Type;

/// The suffixes recognized on a `NumberMultiplier` literal (spec.md §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum NumberSuffix {
    #[strum(serialize = "n")]
    Nano,
    #[strum(serialize = "u")]
    Micro,
    #[strum(serialize = "m")]
    Milli,
    #[strum(serialize = "k")]
    Kilo,
    #[strum(serialize = "K")]
    KiloUpper,
    #[strum(serialize = "M")]
    Mega,
    #[strum(serialize = "G")]
    Giga,
    #[strum(serialize = "T")]
    Tera,
    #[strum(serialize = "P")]
    Peta,
    #[strum(serialize = "Ki")]
    Kibi,
    #[strum(serialize = "Mi")]
    Mebi,
    #[strum(serialize = "Gi")]
    Gibi,
    #[strum(serialize = "Ti")]
    Tebi,
    #[strum(serialize = "Pi")]
    Pebi,
}

impl NumberSuffix {
    /// The scalar multiplier this suffix contributes, used by
    /// `check_number_multiplier_type`-style validation.
    pub fn factor(self) -> f64 {
        match self {
            Self::Nano => 1e-9,
            Self::Micro => 1e-6,
            Self::Milli => 1e-3,
            Self::Kilo => 1e3,
            Self::KiloUpper => 1e3,
            Self::Mega => 1e6,
            Self::Giga => 1e9,
            Self::Tera => 1e12,
            Self::Peta => 1e15,
            Self::Kibi => 1024.0,
            Self::Mebi => 1024f64.powi(2),
            Self::Gibi => 1024f64.powi(3),
            Self::Tebi => 1024f64.powi(4),
            Self::Pebi => 1024f64.powi(5),
        }
    }
}

/// A dict/schema-attrs key. KCL config keys are strings, but dict
/// literals may also be keyed by int/float (spec.md §3.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Str(Rc<str>),
    Int(i64),
    /// Bit pattern of an `f64` key, for `Eq`/`Hash`.
    FloatBits(u64),
}

impl fmt::Display for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::FloatBits(bits) => write!(f, "{}", f64::from_bits(*bits)),
        }
    }
}

impl From<&str> for DictKey {
    fn from(s: &str) -> Self {
        Self::Str(Rc::from(s))
    }
}

/// Per-key operation a schema-config entry carries (spec.md §3.1, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOperation {
    Union,
    Override,
    Insert,
    Unique,
    Unification,
}

#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub value: Value,
    pub operation: ConfigOperation,
    pub insert_index: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaConfigData {
    pub entries: IndexMap<DictKey, ConfigEntry>,
}

/// Output mode for a schema type (spec.md §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaSettings {
    #[default]
    Standalone,
    Inline,
    Ignore,
}

/// A byte-range marker into a schema body's decoded instructions,
/// used by the stmt-buffer drain (spec.md §3.4 step 16, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStmt {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaInstanceData {
    pub name: String,
    pub pkgpath: String,
    pub attrs: IndexMap<DictKey, Value>,
    pub runtime_type: String,
    pub is_relaxed: bool,
    pub config_keys: std::collections::BTreeSet<String>,
    pub settings: Value,
    pub stmt_buffer: Vec<PendingStmt>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: StringId,
    pub default: Option<Value>,
    pub is_kwonly: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: StringId,
    pub pkgpath: String,
    pub params: Vec<Param>,
    pub code: Rc<Code>,
    pub closure: Vec<HeapId>,
}

pub type BuiltinFn = Rc<dyn Fn(&[Value], &[(String, Value)]) -> crate::diagnostics::EngineResult<Value>>;

#[derive(Clone)]
pub struct BuiltinFunction {
    pub name: String,
    pub func: BuiltinFn,
}

impl fmt::Debug for BuiltinFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinFunction").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoratorTarget {
    Schema,
    Attribute,
}

#[derive(Debug, Clone)]
pub struct DecoratorValue {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
    pub target: DecoratorTarget,
}

#[derive(Debug, Clone)]
pub enum FunctionValue {
    Compiled(Rc<CompiledFunction>),
    Builtin(Rc<BuiltinFunction>),
    /// A function bound to a receiver value, e.g. `schema_instance.method`.
    Bound(Box<Value>, Box<Value>),
    Decorator(Rc<DecoratorValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackKind {
    Single,
    Double,
}

#[derive(Debug, Clone)]
pub struct SliceValue {
    pub start: Option<Value>,
    pub stop: Option<Value>,
    pub step: Option<Value>,
}

/// The arity with which an iterator yields values (spec.md §3.1,
/// §4.4.3 `GET_ITER n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterArity {
    One,
    Two,
}

#[derive(Debug, Clone)]
pub enum IterSource {
    List(HeapId),
    Dict(HeapId),
    Schema(HeapId),
    Str(Rc<str>),
}

#[derive(Debug, Clone)]
pub struct IteratorState {
    pub source: IterSource,
    pub index: usize,
    pub arity: IterArity,
}

/// Values that live on the heap behind a [`HeapId`].
#[derive(Debug, Clone)]
pub enum HeapValue {
    List(Vec<Value>),
    Dict(IndexMap<DictKey, Value>),
    SchemaInstance(SchemaInstanceData),
    SchemaConfig(SchemaConfigData),
    Module(IndexMap<StringId, Value>),
    Iterator(IteratorState),
    /// A mutable box for one closed-over variable (`MAKE_CLOSURE`,
    /// spec.md §4.4.4): the enclosing frame and the closure share this
    /// cell rather than copying the value at closure-creation time.
    Cell(Value),
}

impl HeapValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::SchemaInstance(_) => "schema",
            Self::SchemaConfig(_) => "schema_config",
            Self::Module(_) => "module",
            Self::Iterator(_) => "iterator",
            Self::Cell(_) => "cell",
        }
    }
}

/// The engine's single tagged value (spec.md §3.1).
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    NumberMultiplier { raw: i64, suffix: NumberSuffix },
    List(HeapId),
    Dict(HeapId),
    SchemaInstance(HeapId),
    SchemaConfig(HeapId),
    Module(HeapId),
    Iterator(HeapId),
    Function(FunctionValue),
    Type(Rc<Type>),
    Slice(Box<SliceValue>),
    Unpack(Box<Value>, UnpackKind),
}

impl Default for Value {
    fn default() -> Self {
        Self::Undefined
    }
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Self::Str(s.into())
    }

    pub fn kind_name(&self, heap: &Heap) -> String {
        match self {
            Self::None => "NoneType".into(),
            Self::Undefined => "Undefined".into(),
            Self::Bool(_) => "bool".into(),
            Self::Int(_) => "int".into(),
            Self::Float(_) => "float".into(),
            Self::Str(_) => "str".into(),
            Self::NumberMultiplier { .. } => "units.NumberMultiplier".into(),
            Self::List(_) => "list".into(),
            Self::Dict(_) => "dict".into(),
            Self::SchemaInstance(id) => {
                if let HeapValue::SchemaInstance(data) = &*heap.get(*id) {
                    format!("schema '{}'", data.name)
                } else {
                    "schema".into()
                }
            }
            Self::SchemaConfig(_) => "config".into(),
            Self::Module(_) => "module".into(),
            Self::Iterator(_) => "iterator".into(),
            Self::Function(_) => "function".into(),
            Self::Type(t) => format!("type({})", t.ty_str()),
            Self::Slice(_) => "slice".into(),
            Self::Unpack(..) => "unpack".into(),
        }
    }

    /// Truthiness (spec.md §3.1): `False`, `None`, `Undefined`,
    /// numeric zero, and empty string/list/dict/schema are falsy.
    pub fn is_truthy(&self, heap: &Heap) -> bool {
        match self {
            Self::None | Self::Undefined => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::NumberMultiplier { raw, .. } => *raw != 0,
            Self::List(id) => match &*heap.get(*id) {
                HeapValue::List(items) => !items.is_empty(),
                _ => true,
            },
            Self::Dict(id) => match &*heap.get(*id) {
                HeapValue::Dict(map) => !map.is_empty(),
                _ => true,
            },
            Self::SchemaInstance(id) => match &*heap.get(*id) {
                HeapValue::SchemaInstance(data) => !data.attrs.is_empty(),
                _ => true,
            },
            _ => true,
        }
    }

    /// Structural equality, deep through collections and schema
    /// instances (spec.md §8 invariant: instances from the same
    /// config literal are `≡`).
    pub fn value_eq(&self, other: &Self, heap: &Heap) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Undefined, Self::Undefined) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::NumberMultiplier { raw: r1, suffix: s1 }, Self::NumberMultiplier { raw: r2, suffix: s2 }) => {
                r1 == r2 && s1 == s2
            }
            (Self::List(a), Self::List(b)) => match (&*heap.get(*a), &*heap.get(*b)) {
                (HeapValue::List(xs), HeapValue::List(ys)) => {
                    xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| x.value_eq(y, heap))
                }
                _ => false,
            },
            (Self::Dict(a), Self::Dict(b)) => match (&*heap.get(*a), &*heap.get(*b)) {
                (HeapValue::Dict(xs), HeapValue::Dict(ys)) => {
                    xs.len() == ys.len() && xs.iter().all(|(k, v)| ys.get(k).is_some_and(|v2| v.value_eq(v2, heap)))
                }
                _ => false,
            },
            (Self::SchemaInstance(a), Self::SchemaInstance(b)) => match (&*heap.get(*a), &*heap.get(*b)) {
                (HeapValue::SchemaInstance(x), HeapValue::SchemaInstance(y)) => {
                    x.runtime_type == y.runtime_type
                        && x.attrs.len() == y.attrs.len()
                        && x.attrs.iter().all(|(k, v)| y.attrs.get(k).is_some_and(|v2| v.value_eq(v2, heap)))
                }
                _ => false,
            },
            (Self::Type(a), Self::Type(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collections_are_falsy() {
        let mut heap = Heap::new();
        let id = heap.alloc(HeapValue::List(Vec::new()));
        assert!(!Value::List(id).is_truthy(&heap));
        let id2 = heap.alloc(HeapValue::List(vec![Value::Int(0)]));
        assert!(Value::List(id2).is_truthy(&heap));
    }

    #[test]
    fn zero_and_none_are_falsy() {
        let heap = Heap::new();
        assert!(!Value::Int(0).is_truthy(&heap));
        assert!(!Value::None.is_truthy(&heap));
        assert!(!Value::Undefined.is_truthy(&heap));
        assert!(Value::Int(1).is_truthy(&heap));
    }

    #[test]
    fn int_and_float_compare_numerically() {
        let heap = Heap::new();
        assert!(Value::Int(3).value_eq(&Value::Float(3.0), &heap));
    }

    #[test]
    fn schema_instances_with_same_attrs_are_structurally_equal() {
        let mut heap = Heap::new();
        let mut attrs = IndexMap::new();
        attrs.insert(DictKey::from("x"), Value::Int(1));
        let a = heap.alloc(HeapValue::SchemaInstance(SchemaInstanceData {
            name: "Person".into(),
            runtime_type: "f1_Person".into(),
            attrs: attrs.clone(),
            ..Default::default()
        }));
        let b = heap.alloc(HeapValue::SchemaInstance(SchemaInstanceData {
            name: "Person".into(),
            runtime_type: "f1_Person".into(),
            attrs,
            ..Default::default()
        }));
        assert!(Value::SchemaInstance(a).value_eq(&Value::SchemaInstance(b), &heap));
    }
}
