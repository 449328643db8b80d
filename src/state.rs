//! VM-wide state (spec.md §9): the schema-type registry, per-package
//! globals, the module/import registry, and the non-fatal warnings
//! side channel — all owned by one explicit object rather than process
//! globals, "so two concurrent programs can coexist."

use ahash::AHashMap;

use crate::diagnostics::Diagnostic;
use crate::heap::{Heap, HeapId};
use crate::intern::Interner;
use crate::lazy::SchemaEvalContext;
use crate::namespace::GlobalsTable;
use crate::schema::SchemaTypeRegistry;
use crate::value::Value;

/// Everything a running program needs that is not frame-local.
pub struct VmState {
    pub heap: Heap,
    pub interner: Interner,
    pub globals: GlobalsTable,
    pub schema_types: SchemaTypeRegistry,
    /// Resolved package globals tables, cached by pkgpath, populated by
    /// `IMPORT_NAME` (spec.md §4.4.5).
    pub imported_packages: AHashMap<String, ()>,
    /// Guards against recursive imports (spec.md §4.4.5).
    pub pkgpath_stack: Vec<String>,
    pub warnings: Vec<Diagnostic>,
    pub builtins: AHashMap<String, Value>,
    /// Per-instance lazy attribute back-tracking state (spec.md §4.6),
    /// keyed by the schema instance it resolves attributes for.
    pub schema_eval: AHashMap<HeapId, SchemaEvalContext>,
}

impl VmState {
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            interner: Interner::new(),
            globals: GlobalsTable::new(),
            schema_types: SchemaTypeRegistry::new(),
            imported_packages: AHashMap::new(),
            pkgpath_stack: Vec::new(),
            warnings: Vec::new(),
            builtins: AHashMap::new(),
            schema_eval: AHashMap::new(),
        }
    }

    pub fn warn(&mut self, diagnostic: Diagnostic) {
        self.warnings.push(diagnostic);
    }
}

impl Default for VmState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorKind;

    #[test]
    fn warnings_accumulate_without_failing() {
        let mut state = VmState::new();
        state.warn(Diagnostic::new(ErrorKind::Attribute, "deprecated attribute 'x' used"));
        assert_eq!(state.warnings.len(), 1);
    }
}
