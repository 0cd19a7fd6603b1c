//! Host-reachability paths.
//!
//! Maps object identity to the access-path expression through which the
//! value was first reached from a registered host root.  Populated by
//! `register_host_root` walks, consulted read-only by later serializations.

use std::collections::BTreeMap;

use crate::object_model::ObjectHandle;
use crate::registry::json_quote;

#[derive(Debug, Clone, Default)]
pub struct HostPathTable {
    paths: BTreeMap<ObjectHandle, String>,
}

impl HostPathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path` for `handle`; the first recorded path wins.
    pub fn record(&mut self, handle: ObjectHandle, path: impl Into<String>) -> bool {
        if self.paths.contains_key(&handle) {
            return false;
        }
        self.paths.insert(handle, path.into());
        true
    }

    pub fn path_of(&self, handle: ObjectHandle) -> Option<&str> {
        self.paths.get(&handle).map(String::as_str)
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.paths.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// How a child value is reached from its parent, for path derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// Own property with a string key.
    Property(String),
    /// Own property keyed by a registered symbol.
    RegisteredSymbolProperty(String),
    Getter(String),
    Setter(String),
    Prototype,
    WrappedValue,
    /// Element `i` of a Set in iteration order.
    SetElement(usize),
    /// Reached through a payload or an unregistered-symbol key.
    Unknown,
}

impl PathStep {
    /// Compose this step with the parent's path; `None` when the child's
    /// path cannot be expressed.
    pub fn apply(&self, parent: Option<&str>) -> Option<String> {
        let parent = parent?;
        match self {
            Self::Property(key) => Some(format!("{parent}[{}]", json_quote(key))),
            Self::RegisteredSymbolProperty(key) => {
                Some(format!("{parent}[Symbol.for({})]", json_quote(key)))
            }
            Self::Getter(key) => Some(format!(
                "Object.getOwnPropertyDescriptor({parent}, {}).get",
                json_quote(key)
            )),
            Self::Setter(key) => Some(format!(
                "Object.getOwnPropertyDescriptor({parent}, {}).set",
                json_quote(key)
            )),
            Self::Prototype => Some(format!("Object.getPrototypeOf({parent})")),
            Self::WrappedValue => Some(format!("{parent}.valueOf()")),
            Self::SetElement(index) => Some(format!("[...{parent}.values()][{index}]")),
            Self::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_path_wins() {
        let mut table = HostPathTable::new();
        assert!(table.record(ObjectHandle(3), "globalThis[\"Object\"]"));
        assert!(!table.record(ObjectHandle(3), "other"));
        assert_eq!(table.path_of(ObjectHandle(3)), Some("globalThis[\"Object\"]"));
    }

    #[test]
    fn steps_compose_paths() {
        let root = Some("globalThis");
        assert_eq!(
            PathStep::Property("Map".into()).apply(root).as_deref(),
            Some(r#"globalThis["Map"]"#)
        );
        assert_eq!(
            PathStep::Prototype.apply(Some(r#"globalThis["Map"]"#)).as_deref(),
            Some(r#"Object.getPrototypeOf(globalThis["Map"])"#)
        );
        assert_eq!(
            PathStep::Getter("size".into()).apply(root).as_deref(),
            Some(r#"Object.getOwnPropertyDescriptor(globalThis, "size").get"#)
        );
        assert_eq!(
            PathStep::SetElement(1).apply(Some(r#"globalThis["tags"]"#)).as_deref(),
            Some(r#"[...globalThis["tags"].values()][1]"#)
        );
        assert_eq!(PathStep::Unknown.apply(root), None);
        assert_eq!(PathStep::Prototype.apply(None), None);
    }
}
