//! Import resolution helpers (spec.md §4.4.5).
//!
//! `IMPORT_NAME` resolves a dotted path against the builtin registry
//! first, then the compiled `Program`'s packages. Running a
//! not-yet-loaded package's top-level code means pushing a frame,
//! which only the dispatch loop in `vm/mod.rs` can do (it owns the
//! frame stack) — this module holds the parts that don't need one:
//! building the resulting `Module` value from a package's globals,
//! and the fixed diagnostics around cycle/unknown-package detection.

use indexmap::IndexMap;

use crate::diagnostics::{ErrorKind, RunError};
use crate::heap::{Heap, HeapValue};
use crate::namespace::GlobalsTable;
use crate::value::Value;

/// Snapshot a package's globals into a `Module` value (spec.md §4.4.5:
/// "a successfully imported package is exposed to the importer as a
/// `Module` value bound under its local name").
pub fn module_value(pkgpath: &str, globals: &GlobalsTable, heap: &mut Heap) -> Value {
    let mut map = IndexMap::new();
    if let Some(pkg) = globals.package_ref(pkgpath) {
        for (name, value) in pkg.entries() {
            map.insert(name, value.clone());
        }
    }
    Value::Module(heap.alloc(HeapValue::Module(map)))
}

pub fn recursive_import_error(path: &str) -> RunError {
    RunError::new(ErrorKind::RecursiveLoad, format!("recursive import of package '{path}'"))
}

pub fn unknown_package_error(path: &str) -> RunError {
    RunError::new(ErrorKind::Name, format!("cannot find package '{path}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;

    #[test]
    fn module_value_is_empty_for_a_package_never_touched() {
        let mut heap = Heap::new();
        let globals = GlobalsTable::new();
        let v = module_value("pkg.unused", &globals, &mut heap);
        let Value::Module(id) = v else { panic!() };
        let guard = heap.get(id);
        let HeapValue::Module(map) = &*guard else { panic!() };
        assert!(map.is_empty());
    }

    #[test]
    fn module_value_collects_package_globals() {
        let mut heap = Heap::new();
        let mut globals = GlobalsTable::new();
        let mut interner = Interner::new();
        let name = interner.intern("port");
        globals.package("pkg.a").set(name, Value::Int(8080));
        let v = module_value("pkg.a", &globals, &mut heap);
        let Value::Module(id) = v else { panic!() };
        let guard = heap.get(id);
        let HeapValue::Module(map) = &*guard else { panic!() };
        assert!(matches!(map.get(&name), Some(Value::Int(8080))));
    }
}
