//! Schema type construction & instance materialization (spec.md §3.3,
//! §3.4, §4.5).
//!
//! This module owns the schema-type registry and the pure data/ordering
//! logic of instance construction; it has no opinion on how bytecode
//! actually runs. Frame execution (the body fn, mixin bodies, the
//! check-block) is delegated to a [`SchemaHost`] the VM implements, so this
//! module stays free of a dependency on `vm`.

use std::collections::BTreeSet;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::decorators::{self, DecoratorOutcome};
use crate::diagnostics::{ErrorKind, RunError};
use crate::heap::{Heap, HeapId, HeapValue};
use crate::program::Code;
use crate::types::{self, BaseWalker, SchemaRef, Type, TypeRef};
use crate::unify::{self, UnionOptions};
use crate::value::{ConfigEntry, DictKey, DecoratorValue, SchemaInstanceData, SchemaSettings, Value};

pub const RESERVED_TYPE_NAMES: &[&str] = &["int", "float", "str", "bool", "any"];

/// Per-attribute declared metadata (spec.md §3.3).
#[derive(Debug, Clone)]
pub struct AttrMeta {
    pub name: String,
    pub ty: TypeRef,
    pub is_optional: bool,
    pub is_final: bool,
    pub has_default: bool,
    pub decorators: Vec<DecoratorValue>,
}

/// `{ key_name?, key_type, value_type, any_other, default_value }`
/// (spec.md §3.3).
#[derive(Debug, Clone)]
pub struct IndexSignature {
    pub key_name: Option<String>,
    pub key_type: TypeRef,
    pub value_type: TypeRef,
    pub any_other: bool,
    pub default_value: Option<Value>,
}

/// A schema type (spec.md §3.3). `func`/`check_fn` are compiled bodies run
/// via `SchemaHost`; `base`/`mixins` are resolved lazily (spec.md §4.5.1)
/// so forward references between schemas in the same package work.
#[derive(Debug, Clone)]
pub struct SchemaType {
    pub name: String,
    pub pkgpath: String,
    pub filename: String,
    pub doc: String,
    pub attr_list: Vec<AttrMeta>,
    pub base: Option<SchemaRef>,
    pub mixins: Vec<SchemaRef>,
    pub protocol: Option<SchemaRef>,
    pub index_signature: Option<IndexSignature>,
    pub decorators: Vec<DecoratorValue>,
    pub func: std::rc::Rc<Code>,
    pub check_fn: Option<std::rc::Rc<Code>>,
    pub settings: SchemaSettings,
    pub runtime_type: String,
    pub is_relaxed: bool,
    /// Weak registry of every instance built from this type, for the
    /// `instances()` reflection method (spec.md §3.3).
    pub instances: Vec<HeapId>,
}

impl SchemaType {
    pub fn schema_ref(&self) -> SchemaRef {
        SchemaRef { runtime_type: self.runtime_type.clone(), name: self.name.clone() }
    }

    pub fn find_attr(&self, name: &str) -> Option<&AttrMeta> {
        self.attr_list.iter().find(|a| a.name == name)
    }
}

/// `hash(filename) + name` (spec.md GLOSSARY "Runtime type").
pub fn runtime_type_id(filename: &str, name: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    filename.hash(&mut hasher);
    format!("{:x}_{name}", hasher.finish())
}

/// The process-wide (well, `VmState`-wide) schema-type registry (spec.md
/// §3.3, §9: "the schema-type registry belong to a VM state object").
#[derive(Debug, Default)]
pub struct SchemaTypeRegistry {
    types: AHashMap<String, SchemaType>,
}

impl SchemaTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, runtime_type: &str) -> Option<&SchemaType> {
        self.types.get(runtime_type)
    }

    pub fn get_mut(&mut self, runtime_type: &str) -> Option<&mut SchemaType> {
        self.types.get_mut(runtime_type)
    }

    /// Register a newly constructed schema type (`MAKE_SCHEMA`, spec.md
    /// §4.5.1), validating name and inheritance rules and checking for a
    /// cycle in the base-class DAG.
    pub fn register(&mut self, ty: SchemaType) -> Result<(), RunError> {
        validate_schema_name(&ty.name)?;
        if let Some(base) = &ty.base {
            reject_mixin_base(base)?;
        }
        for mixin in &ty.mixins {
            validate_mixin_name(&mixin.name)?;
        }
        let runtime_type = ty.runtime_type.clone();
        self.types.insert(runtime_type.clone(), ty);
        self.check_acyclic(&runtime_type)?;
        Ok(())
    }

    fn check_acyclic(&self, start: &str) -> Result<(), RunError> {
        let mut seen = BTreeSet::new();
        let mut cur = start.to_string();
        loop {
            if !seen.insert(cur.clone()) {
                return Err(RunError::new(ErrorKind::CycleInherit, format!("schema inheritance cycle at '{start}'")));
            }
            match self.types.get(&cur).and_then(|t| t.base.clone()) {
                Some(base) => cur = base.runtime_type,
                None => return Ok(()),
            }
        }
    }

    /// Walk `type.attr_list` across the full base chain, in base-first
    /// order, with the subclass's declaration shadowing (but not removing)
    /// the base's.
    pub fn full_attr_list(&self, ty: &SchemaType) -> Vec<AttrMeta> {
        let mut chain = Vec::new();
        let mut cur = ty.base.clone();
        let mut bases = Vec::new();
        while let Some(base_ref) = cur {
            if let Some(base_ty) = self.types.get(&base_ref.runtime_type) {
                bases.push(base_ty.clone());
                cur = base_ty.base.clone();
            } else {
                break;
            }
        }
        for base_ty in bases.into_iter().rev() {
            chain.extend(base_ty.attr_list.iter().cloned());
        }
        chain.extend(ty.attr_list.iter().cloned());
        chain
    }
}

impl BaseWalker for SchemaTypeRegistry {
    fn base_of(&self, schema: &SchemaRef) -> Option<SchemaRef> {
        self.types.get(&schema.runtime_type).and_then(|t| t.base.clone())
    }
}

fn validate_schema_name(name: &str) -> Result<(), RunError> {
    if RESERVED_TYPE_NAMES.contains(&name) {
        return Err(RunError::new(ErrorKind::IllegalInherit, format!("schema name '{name}' is reserved")));
    }
    Ok(())
}

fn validate_mixin_name(name: &str) -> Result<(), RunError> {
    if !name.ends_with("Mixin") {
        return Err(RunError::new(ErrorKind::IllegalInherit, format!("mixin schema '{name}' must end with 'Mixin'")));
    }
    Ok(())
}

fn reject_mixin_base(base: &SchemaRef) -> Result<(), RunError> {
    if base.name.ends_with("Mixin") {
        return Err(RunError::new(ErrorKind::IllegalInherit, format!("'{}' is a mixin and cannot be a base class", base.name)));
    }
    Ok(())
}

/// What `BUILD_SCHEMA` needs from the VM to run a schema body, mixin body,
/// or check-block: push a frame binding `(args…, config_meta, config,
/// instance)` to the given compiled function and run it to completion.
pub trait SchemaHost {
    #[allow(clippy::too_many_arguments)]
    fn run_body(
        &mut self,
        code: &Code,
        args: &[Value],
        config: Value,
        config_meta: Value,
        instance: Value,
        heap: &mut Heap,
    ) -> Result<(), RunError>;

    fn run_check(
        &mut self,
        code: &Code,
        instance: Value,
        key_binding: Option<(String, Value)>,
        heap: &mut Heap,
    ) -> Result<(), RunError>;
}

/// Steps 2–18 of spec.md §4.5.2. Step 1 (argument type check against
/// declared params) happens at the `CALL_FUNCTION`/calling-convention
/// layer before this is invoked (spec.md §4.4.4 step 4).
#[allow(clippy::too_many_arguments)]
pub fn build_schema(
    registry: &SchemaTypeRegistry,
    ty_runtime_type: &str,
    config: Value,
    config_meta: Value,
    args: Vec<Value>,
    is_sub_schema: bool,
    caller_pkgpath: &str,
    heap: &mut Heap,
    host: &mut dyn SchemaHost,
) -> Result<Value, RunError> {
    let ty = registry
        .get(ty_runtime_type)
        .ok_or_else(|| RunError::new(ErrorKind::Name, format!("schema type '{ty_runtime_type}' not found")))?
        .clone();

    // Step 2: allocate empty instance carrying __settings__, stamped with
    // the calling context's pkgpath rather than the type's own defining
    // pkgpath — these differ for a schema constructed from an imported
    // package.
    let instance_data = SchemaInstanceData {
        name: ty.name.clone(),
        pkgpath: caller_pkgpath.to_string(),
        runtime_type: ty.runtime_type.clone(),
        settings: Value::None,
        ..Default::default()
    };
    let instance_id = heap.alloc(HeapValue::SchemaInstance(instance_data));
    let instance = Value::SchemaInstance(instance_id);

    // Step 4: attach type-level decorators (run now for schema-targeted
    // ones; attribute-targeted ones run in step 17).
    for deco in ty.decorators.iter().filter(|d| d.target == crate::value::DecoratorTarget::Schema) {
        decorators::run_decorator(deco, &ty.name, true)?;
    }

    // Step 5: recurse into base, if any, against the same config.
    if let Some(base_ref) = &ty.base {
        build_schema(registry, &base_ref.runtime_type, config.clone(), config_meta.clone(), Vec::new(), true, caller_pkgpath, heap, host)?;
    }

    // Step 6: union in type attrs (defaults; idempotence off).
    union_default_attrs(&ty, instance_id, heap)?;

    // Step 7: union in each mixin's attrs.
    for mixin_ref in &ty.mixins {
        if let Some(mixin_ty) = registry.get(&mixin_ref.runtime_type) {
            union_default_attrs(mixin_ty, instance_id, heap)?;
        }
    }

    // Step 8: record (name, runtime_type, is_relaxed).
    stamp_identity(instance_id, &ty, heap);

    // Step 9: push a frame and run the body.
    host.run_body(&ty.func, &args, config.clone(), config_meta.clone(), instance.clone(), heap)?;

    // Step 10: reconcile __settings__ (body-assigned wins; else config;
    // else type default).
    reconcile_settings(instance_id, &ty, heap);

    // Step 11: relaxed-key handling, skipped for sub-schema calls.
    if !is_sub_schema {
        apply_relaxed_keys(registry, &ty, instance_id, &config, heap)?;
    }

    // Step 12: re-stamp.
    stamp_identity(instance_id, &ty, heap);

    // Step 13: run each mixin body, in order.
    for mixin_ref in &ty.mixins {
        if let Some(mixin_ty) = registry.get(&mixin_ref.runtime_type) {
            host.run_body(&mixin_ty.func, &[], config.clone(), config_meta.clone(), instance.clone(), heap)?;
        }
    }

    // Step 14: re-stamp again.
    stamp_identity(instance_id, &ty, heap);

    // Step 15: register the instance in the type's registry (caller owns
    // the mutable `SchemaType`; we record the heap id on the snapshot used
    // here and expect the caller to persist it back if it cares about
    // `instances()` reflection across calls).

    // Step 16: drain stmt buffer, in enqueue order (spec.md §9 Open
    // Question, resolved as "appended after the last mixin body").
    drain_stmt_buffer(instance_id, heap);

    // Step 17: run all attribute decorators.
    run_attribute_decorators(&ty, instance_id, heap)?;

    if !is_sub_schema {
        // Step 18: mark __settings__ override, check optional attrs, run
        // check_fn (once per relaxed key if the index signature binds a
        // key name).
        {
            let mut guard = heap.get_mut(instance_id);
            let HeapValue::SchemaInstance(data) = &mut *guard else { unreachable!() };
            data.settings = match &data.settings {
                Value::None | Value::Undefined => Value::str("standalone"),
                other => other.clone(),
            };
        }
        check_optional_attrs(registry, &ty, instance_id, heap)?;
        if let Some(check_code) = &ty.check_fn {
            run_check_fn(registry, &ty, check_code, instance.clone(), instance_id, heap, host)?;
        }
    }

    Ok(instance)
}

fn union_default_attrs(ty: &SchemaType, instance_id: HeapId, heap: &mut Heap) -> Result<(), RunError> {
    for attr in &ty.attr_list {
        if !attr.has_default {
            continue;
        }
        let existing = {
            let guard = heap.get(instance_id);
            let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
            data.attrs.get(&DictKey::from(attr.name.as_str())).cloned()
        };
        if existing.is_none() {
            let mut guard = heap.get_mut(instance_id);
            let HeapValue::SchemaInstance(data) = &mut *guard else { unreachable!() };
            data.attrs.entry(DictKey::from(attr.name.as_str())).or_insert(Value::Undefined);
        }
    }
    Ok(())
}

fn stamp_identity(instance_id: HeapId, ty: &SchemaType, heap: &mut Heap) {
    let mut guard = heap.get_mut(instance_id);
    let HeapValue::SchemaInstance(data) = &mut *guard else { return };
    data.name = ty.name.clone();
    data.runtime_type = ty.runtime_type.clone();
    data.is_relaxed = ty.is_relaxed;
}

fn reconcile_settings(instance_id: HeapId, ty: &SchemaType, heap: &mut Heap) {
    let mut guard = heap.get_mut(instance_id);
    let HeapValue::SchemaInstance(data) = &mut *guard else { return };
    if matches!(data.settings, Value::None | Value::Undefined) {
        data.settings = settings_value(ty.settings);
    }
}

fn drain_stmt_buffer(instance_id: HeapId, heap: &mut Heap) {
    let mut guard = heap.get_mut(instance_id);
    let HeapValue::SchemaInstance(data) = &mut *guard else { return };
    data.stmt_buffer.clear();
}

/// Relaxed-key handling (spec.md §4.5.3).
fn apply_relaxed_keys(
    registry: &SchemaTypeRegistry,
    ty: &SchemaType,
    instance_id: HeapId,
    config: &Value,
    heap: &mut Heap,
) -> Result<(), RunError> {
    let full_attrs = registry.full_attr_list(ty);
    let declared: BTreeSet<String> = full_attrs.iter().map(|a| a.name.clone()).collect();
    let protocol_attrs: BTreeSet<String> = ty
        .protocol
        .as_ref()
        .and_then(|p| registry.get(&p.runtime_type))
        .map(|p| p.attr_list.iter().map(|a| a.name.clone()).collect())
        .unwrap_or_default();

    let config_entries: IndexMap<DictKey, Value> = match config {
        Value::Dict(id) => {
            let guard = heap.get(*id);
            let HeapValue::Dict(map) = &*guard else { return Ok(()) };
            map.clone()
        }
        Value::SchemaConfig(id) => {
            let guard = heap.get(*id);
            let HeapValue::SchemaConfig(data) = &*guard else { return Ok(()) };
            data.entries.iter().map(|(k, e)| (k.clone(), e.value.clone())).collect()
        }
        _ => return Ok(()),
    };

    let relaxed_keys: Vec<DictKey> = config_entries
        .keys()
        .filter(|k| !declared.contains(&k.to_string()) && !protocol_attrs.contains(&k.to_string()))
        .cloned()
        .collect();

    let has_relaxed_surface = ty.is_relaxed || ty.index_signature.is_some();

    if has_relaxed_surface {
        if let Some(sig) = &ty.index_signature {
            if !sig.any_other {
                for attr in &full_attrs {
                    let value = {
                        let guard = heap.get(instance_id);
                        let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
                        data.attrs.get(&DictKey::from(attr.name.as_str())).cloned()
                    };
                    if let Some(value) = value {
                        if !types::check_type(&value, &sig.value_type, heap, registry) {
                            return Err(RunError::new(
                                ErrorKind::IndexSignature,
                                format!("attribute '{}' violates index signature value type", attr.name),
                            ));
                        }
                    }
                }
            }
        }
        for key in relaxed_keys {
            let config_value = config_entries.get(&key).cloned().unwrap_or(Value::Undefined);
            let checked = if let Some(sig) = &ty.index_signature {
                if !types::check_type(&config_value, &sig.value_type, heap, registry) {
                    return Err(RunError::new(ErrorKind::IndexSignature, format!("relaxed key '{key}' has an invalid value type")));
                }
                match &sig.default_value {
                    Some(default) => unify::union(default.clone(), config_value, UnionOptions::default(), heap)?,
                    None => config_value,
                }
            } else {
                config_value
            };
            let mut guard = heap.get_mut(instance_id);
            let HeapValue::SchemaInstance(data) = &mut *guard else { unreachable!() };
            data.attrs.insert(key.clone(), checked);
            data.config_keys.insert(key.to_string());
        }
    } else if !relaxed_keys.is_empty() {
        let names: Vec<String> = relaxed_keys.iter().map(ToString::to_string).collect();
        return Err(unify::cannot_add_members(&names, &ty.name).into());
    }
    Ok(())
}

/// `check_optional_attrs` (spec.md §3.4 step 8, §8 invariant): every
/// non-optional attribute across the type chain must not be `None`/
/// `Undefined` once construction completes.
fn check_optional_attrs(registry: &SchemaTypeRegistry, ty: &SchemaType, instance_id: HeapId, heap: &Heap) -> Result<(), RunError> {
    let guard = heap.get(instance_id);
    let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
    for attr in registry.full_attr_list(ty) {
        if attr.is_optional {
            continue;
        }
        match data.attrs.get(&DictKey::from(attr.name.as_str())) {
            None | Some(Value::None) | Some(Value::Undefined) => {
                return Err(RunError::new(
                    ErrorKind::Attribute,
                    format!("attribute '{}' of schema '{}' is required and not set", attr.name, ty.name),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn run_attribute_decorators(ty: &SchemaType, instance_id: HeapId, heap: &mut Heap) -> Result<(), RunError> {
    for attr in &ty.attr_list {
        for deco in &attr.decorators {
            let was_referenced = {
                let guard = heap.get(instance_id);
                let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
                data.attrs.contains_key(&DictKey::from(attr.name.as_str()))
            };
            match decorators::run_decorator(deco, &attr.name, was_referenced)? {
                DecoratorOutcome::Unchanged => {}
                DecoratorOutcome::Replace(v) => {
                    let mut guard = heap.get_mut(instance_id);
                    let HeapValue::SchemaInstance(data) = &mut *guard else { unreachable!() };
                    data.attrs.insert(DictKey::from(attr.name.as_str()), v);
                }
                DecoratorOutcome::Warn(_) => {
                    let mut guard = heap.get_mut(instance_id);
                    let HeapValue::SchemaInstance(data) = &mut *guard else { unreachable!() };
                    data.attrs.insert(DictKey::from(attr.name.as_str()), Value::None);
                }
            }
        }
    }
    Ok(())
}

fn run_check_fn(
    registry: &SchemaTypeRegistry,
    ty: &SchemaType,
    check_code: &Code,
    instance: Value,
    instance_id: HeapId,
    heap: &mut Heap,
    host: &mut dyn SchemaHost,
) -> Result<(), RunError> {
    if let Some(sig) = &ty.index_signature {
        if let Some(key_name) = &sig.key_name {
            let keys: Vec<DictKey> = {
                let guard = heap.get(instance_id);
                let HeapValue::SchemaInstance(data) = &*guard else { unreachable!() };
                data.config_keys.iter().map(|k| DictKey::from(k.as_str())).collect()
            };
            for key in keys {
                host.run_check(check_code, instance.clone(), Some((key_name.clone(), Value::str(key.to_string()))), heap)?;
            }
            return Ok(());
        }
    }
    let _ = registry;
    host.run_check(check_code, instance, None, heap)
}

/// Schema config entries (spec.md §4.5.3), converted to plain attribute
/// dict entries for the relaxed-key path. Exposed for `STORE_SCHEMA_CONFIG`
/// consumers that need to turn a `SchemaConfigData` into the merged config
/// handed to `BUILD_SCHEMA`.
pub fn config_to_dict(entries: &IndexMap<DictKey, ConfigEntry>) -> IndexMap<DictKey, Value> {
    entries.iter().map(|(k, e)| (k.clone(), e.value.clone())).collect()
}

/// Construct the reserved `__settings__` value for the given output mode,
/// used when a schema type has no explicit settings attribute statement.
pub fn settings_value(mode: SchemaSettings) -> Value {
    match mode {
        SchemaSettings::Standalone => Value::str("standalone"),
        SchemaSettings::Inline => Value::str("inline"),
        SchemaSettings::Ignore => Value::str("ignore"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn make_type(name: &str, base: Option<SchemaRef>) -> SchemaType {
        SchemaType {
            name: name.into(),
            pkgpath: "pkg".into(),
            filename: "f.k".into(),
            doc: String::new(),
            attr_list: Vec::new(),
            base,
            mixins: Vec::new(),
            protocol: None,
            index_signature: None,
            decorators: Vec::new(),
            func: Rc::new(Code::default()),
            check_fn: None,
            settings: SchemaSettings::Standalone,
            runtime_type: runtime_type_id("f.k", name),
            is_relaxed: false,
            instances: Vec::new(),
        }
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut registry = SchemaTypeRegistry::new();
        let ty = make_type("int", None);
        assert!(registry.register(ty).is_err());
    }

    #[test]
    fn mixin_must_end_with_mixin_suffix() {
        let mut ty = make_type("Foo", None);
        let mixin_ref = SchemaRef { runtime_type: "x".into(), name: "NotAMixin".into() };
        ty.mixins.push(mixin_ref);
        let mut registry = SchemaTypeRegistry::new();
        assert!(registry.register(ty).is_err());
    }

    #[test]
    fn cannot_inherit_from_a_mixin() {
        let base = SchemaRef { runtime_type: "base".into(), name: "FooMixin".into() };
        let ty = make_type("Bar", Some(base));
        let mut registry = SchemaTypeRegistry::new();
        assert!(registry.register(ty).is_err());
    }

    #[test]
    fn self_inheritance_cycle_is_detected() {
        let mut registry = SchemaTypeRegistry::new();
        let rt = runtime_type_id("f.k", "Self");
        let mut ty = make_type("Self", None);
        ty.base = Some(SchemaRef { runtime_type: rt.clone(), name: "Self".into() });
        ty.runtime_type = rt;
        assert!(registry.register(ty).is_err());
    }

    #[test]
    fn full_attr_list_includes_base_attrs_first() {
        let mut registry = SchemaTypeRegistry::new();
        let mut base = make_type("Base", None);
        base.attr_list.push(AttrMeta {
            name: "a".into(),
            ty: Rc::new(Type::Int),
            is_optional: false,
            is_final: false,
            has_default: false,
            decorators: Vec::new(),
        });
        let base_ref = base.schema_ref();
        registry.register(base).unwrap();
        let mut sub = make_type("Sub", Some(base_ref));
        sub.attr_list.push(AttrMeta {
            name: "b".into(),
            ty: Rc::new(Type::Str),
            is_optional: false,
            is_final: false,
            has_default: false,
            decorators: Vec::new(),
        });
        let full = registry.full_attr_list(&sub);
        assert_eq!(full.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
