//! Per-frame locals and per-package globals (spec.md §4.4.2).
//!
//! Locals are addressed by a small index rather than by name —
//! `STORE_LOCAL`/`LOAD_LOCAL` take a slot index resolved at compile
//! time — avoiding a name lookup on every local access. Globals are
//! shared by every frame executing in the same package, so they live
//! in a table keyed by `pkgpath` rather than on the frame itself.

use ahash::AHashMap;

use crate::diagnostics::{ErrorKind, RunError};
use crate::intern::StringId;
use crate::value::Value;

/// Index of a local slot within one frame's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalSlot(u16);

impl LocalSlot {
    pub fn new(index: usize) -> Self {
        Self(u16::try_from(index).expect("local slot index out of range"))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single frame's local variable slots.
#[derive(Debug, Default, Clone)]
pub struct Namespace(Vec<Value>);

impl Namespace {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(std::iter::repeat_with(|| Value::Undefined).take(capacity).collect())
    }

    /// Builds a namespace directly from bound argument/local values, for
    /// `CALL_FUNCTION`'s frame push (spec.md §4.4.4).
    pub fn from_vec(locals: Vec<Value>) -> Self {
        Self(locals)
    }

    pub fn get(&self, slot: LocalSlot) -> &Value {
        &self.0[slot.index()]
    }

    pub fn get_mut(&mut self, slot: LocalSlot) -> &mut Value {
        &mut self.0[slot.index()]
    }

    pub fn set(&mut self, slot: LocalSlot, value: Value) {
        self.0[slot.index()] = value;
    }

    /// Grows the namespace so `slot` is addressable, padding any newly
    /// created slots with `Undefined`. The VM calls this on first write
    /// to a local since there is no upfront locals-count in `Code`
    /// (spec.md §6.2 carries no such field; the compiler is out of scope).
    pub fn ensure_len(&mut self, slot: LocalSlot) {
        let needed = slot.index() + 1;
        if self.0.len() < needed {
            self.0.resize_with(needed, || Value::Undefined);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The globals table for one package (spec.md §4.4.2: "Globals are
/// shared per package").
#[derive(Debug, Default)]
pub struct PackageGlobals(AHashMap<StringId, Value>);

impl PackageGlobals {
    pub fn get(&self, name: StringId) -> Option<&Value> {
        self.0.get(&name)
    }

    pub fn set(&mut self, name: StringId, value: Value) {
        self.0.insert(name, value);
    }

    pub fn contains(&self, name: StringId) -> bool {
        self.0.contains_key(&name)
    }

    /// Every name bound in this package, for `IMPORT_NAME`'s `Module`
    /// construction (spec.md §4.4.5).
    pub fn entries(&self) -> impl Iterator<Item = (StringId, &Value)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }
}

/// All packages' globals tables, owned by the VM state (spec.md §9:
/// "package globals ... belong to a VM state object passed
/// explicitly").
#[derive(Debug, Default)]
pub struct GlobalsTable(AHashMap<String, PackageGlobals>);

impl GlobalsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn package(&mut self, pkgpath: &str) -> &mut PackageGlobals {
        self.0.entry(pkgpath.to_string()).or_default()
    }

    pub fn package_ref(&self, pkgpath: &str) -> Option<&PackageGlobals> {
        self.0.get(pkgpath)
    }
}

/// `LOAD_NAME` resolves against globals, raising a `Name` diagnostic
/// if absent (spec.md §4.4.3).
pub fn load_name(globals: &PackageGlobals, name: StringId, display_name: &str) -> Result<Value, RunError> {
    globals.get(name).cloned().ok_or_else(|| RunError::new(ErrorKind::Name, format!("name '{display_name}' is not defined")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locals_round_trip_by_slot() {
        let mut ns = Namespace::with_capacity(3);
        ns.set(LocalSlot::new(1), Value::Int(7));
        assert!(matches!(ns.get(LocalSlot::new(1)), Value::Int(7)));
        assert!(matches!(ns.get(LocalSlot::new(0)), Value::Undefined));
    }

    #[test]
    fn globals_are_shared_per_package() {
        let mut table = GlobalsTable::new();
        table.package("pkg_a").set(StringId_for_test(), Value::Int(1));
        assert!(table.package_ref("pkg_a").unwrap().contains(StringId_for_test()));
        assert!(table.package_ref("pkg_b").is_none());
    }

    #[allow(non_snake_case)]
    fn StringId_for_test() -> StringId {
        let mut interner = crate::intern::Interner::new();
        interner.intern("x")
    }
}
