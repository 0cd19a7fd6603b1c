//! Function registration records.
//!
//! Instrumented code registers every function and class it defines.  The
//! registry is append-only: a record, once stored, is never replaced.

use std::collections::BTreeMap;

use crate::envelope::reference_id;
use crate::object_model::{ObjectHandle, SymbolId};

/// Index of a reconstruction scope table in the realm.
pub type ScopeTableId = usize;

/// Where a syntactic record gets its captured bindings from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSource {
    /// Script thunk returning `{ name: currentValue, ... }`.
    Thunk(ObjectHandle),
    /// Scope table installed by the reconstructor.
    Table(ScopeTableId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRecord {
    Syntactic {
        scope: ScopeSource,
        source_text: String,
    },
    /// A class member, re-derived from the owning class on reconstruction.
    ClassMember {
        owning_class: ObjectHandle,
        member_expression: String,
    },
}

impl RegistrationRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Syntactic { .. } => "syntactic",
            Self::ClassMember { .. } => "class",
        }
    }
}

/// Placeholder name for the owning class inside member expressions.
pub const CLASS_PLACEHOLDER: &str = "C";

/// `C["name"]` for static members, `C.prototype["name"]` for prototype ones.
pub fn member_expression(key: &str, is_static: bool) -> String {
    let quoted = json_quote(key);
    if is_static {
        format!("{CLASS_PLACEHOLDER}[{quoted}]")
    } else {
        format!("{CLASS_PLACEHOLDER}.prototype[{quoted}]")
    }
}

/// Accessor half of a class member.
pub fn accessor_member_expression(key: &str, is_static: bool, getter: bool) -> String {
    let holder = if is_static {
        CLASS_PLACEHOLDER.to_string()
    } else {
        format!("{CLASS_PLACEHOLDER}.prototype")
    };
    let half = if getter { "get" } else { "set" };
    format!(
        "Object.getOwnPropertyDescriptor({holder}, {}).{half}",
        json_quote(key)
    )
}

pub(crate) fn json_quote(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    records: BTreeMap<ObjectHandle, RegistrationRecord>,
    class_prototypes: BTreeMap<ObjectHandle, ObjectHandle>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` unless `function` already has one.  Returns whether
    /// the record was stored.
    pub fn register(&mut self, function: ObjectHandle, record: RegistrationRecord) -> bool {
        if self.records.contains_key(&function) {
            return false;
        }
        self.records.insert(function, record);
        true
    }

    pub fn get(&self, function: ObjectHandle) -> Option<&RegistrationRecord> {
        self.records.get(&function)
    }

    pub fn contains(&self, function: ObjectHandle) -> bool {
        self.records.contains_key(&function)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn register_class_prototype(&mut self, prototype: ObjectHandle, class: ObjectHandle) {
        self.class_prototypes.entry(prototype).or_insert(class);
    }

    pub fn class_for_prototype(&self, prototype: ObjectHandle) -> Option<ObjectHandle> {
        self.class_prototypes.get(&prototype).copied()
    }
}

/// Stable reference ids for objects and unregistered symbols.
///
/// Ids come from one realm-wide counter, so heaps produced by separate
/// serialization calls never collide.  A symbol keeps its id after it is
/// reconstructed, which lets an unregistered symbol survive a round trip in
/// the same realm with its identity intact.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    next: u64,
    objects: BTreeMap<ObjectHandle, String>,
    symbols: BTreeMap<SymbolId, String>,
    symbols_by_reference: BTreeMap<String, SymbolId>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused id; skips ids already bound to reconstructed symbols.
    fn allocate(&mut self) -> String {
        loop {
            let id = reference_id(self.next);
            self.next += 1;
            if !self.symbols_by_reference.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn object_reference(&mut self, object: ObjectHandle) -> String {
        if let Some(existing) = self.objects.get(&object) {
            return existing.clone();
        }
        let id = self.allocate();
        self.objects.insert(object, id.clone());
        id
    }

    pub fn symbol_reference(&mut self, symbol: SymbolId) -> String {
        if let Some(existing) = self.symbols.get(&symbol) {
            return existing.clone();
        }
        let id = self.allocate();
        self.bind_symbol(id.clone(), symbol);
        id
    }

    pub fn symbol_for_reference(&self, reference: &str) -> Option<SymbolId> {
        self.symbols_by_reference.get(reference).copied()
    }

    /// Associate a reconstructed symbol with the reference it was read from.
    pub fn bind_symbol(&mut self, reference: String, symbol: SymbolId) {
        self.symbols.entry(symbol).or_insert_with(|| reference.clone());
        self.symbols_by_reference.entry(reference).or_insert(symbol);
    }

    pub fn allocated(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_never_replaced() {
        let mut registry = FunctionRegistry::new();
        let f = ObjectHandle(7);
        assert!(registry.register(
            f,
            RegistrationRecord::Syntactic {
                scope: ScopeSource::Table(0),
                source_text: "() => 1".into(),
            }
        ));
        assert!(!registry.register(
            f,
            RegistrationRecord::Syntactic {
                scope: ScopeSource::Table(1),
                source_text: "() => 2".into(),
            }
        ));
        assert!(matches!(
            registry.get(f),
            Some(RegistrationRecord::Syntactic { source_text, .. }) if source_text == "() => 1"
        ));
    }

    #[test]
    fn member_expressions_quote_keys() {
        assert_eq!(member_expression("run", false), r#"C.prototype["run"]"#);
        assert_eq!(member_expression("make \"x\"", true), r#"C["make \"x\""]"#);
        assert_eq!(
            accessor_member_expression("v", false, true),
            r#"Object.getOwnPropertyDescriptor(C.prototype, "v").get"#
        );
    }

    #[test]
    fn references_are_stable_and_shared_across_kinds() {
        let mut table = ReferenceTable::new();
        let a = table.object_reference(ObjectHandle(10));
        let s = table.symbol_reference(SymbolId(2));
        assert_eq!(a, "ref0");
        assert_eq!(s, "ref1");
        assert_eq!(table.object_reference(ObjectHandle(10)), "ref0");
        assert_eq!(table.symbol_for_reference("ref1"), Some(SymbolId(2)));
        assert_eq!(table.allocated(), 2);
    }

    #[test]
    fn foreign_symbol_references_bind_once() {
        let mut table = ReferenceTable::new();
        table.bind_symbol("ref40".into(), SymbolId(5));
        table.bind_symbol("ref40".into(), SymbolId(6));
        assert_eq!(table.symbol_for_reference("ref40"), Some(SymbolId(5)));
        assert_eq!(table.symbol_reference(SymbolId(5)), "ref40");
    }
}
