//! Heap reconstructor.
//!
//! A session turns an envelope back into live values in three sweeps:
//!
//! 1. **Skeletons**, created lazily from the root.  A skeleton is bound to its
//!    reference before anything else about it is resolved.
//! 2. **Discovery**: everything reachable from an existing skeleton (keys,
//!    descriptor values, prototypes, encoder payload references) gets a
//!    skeleton too.
//! 3. **Linking** in creation order: encoder link, prototype, own properties,
//!    then `preventExtensions`.
//!
//! Sessions live on a stack in the realm.  A reconstructed function may run
//! while the envelope is still being replayed (a class `extends` clause, a
//! static initializer); its scope lookups resolve through the open session.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::ast::{Expression, ExpressionKind, MemberProperty};
use crate::encoders::{DecodeContext, scope_captures};
use crate::envelope::{Envelope, HeapEntry, NOT_SPECIAL, SerializedDescriptor, SerializedValue};
use crate::error::{EngineError, EngineResult};
use crate::object_model::{FunctionBehavior, JsValue, ObjectHandle, ObjectKind, PropertyDescriptor, PropertyKey};
use crate::parser::parse_expression_source;
use crate::realm::{BindingSlot, EnvironmentKind, Realm, ScopeEntry, ScopeTable};
use crate::registry::{CLASS_PLACEHOLDER, RegistrationRecord, ScopeSource, ScopeTableId};

const RECONSTRUCT_LABEL: &str = "<reconstruct>";

/// Replay state of one `deserialize` call.
#[derive(Debug)]
pub struct DeserializeSession {
    heap: Rc<IndexMap<String, HeapEntry>>,
    values: BTreeMap<String, JsValue>,
    /// References in skeleton-creation order.
    order: Vec<String>,
    initializing: BTreeSet<String>,
}

impl DeserializeSession {
    fn new(heap: IndexMap<String, HeapEntry>) -> Self {
        Self {
            heap: Rc::new(heap),
            values: BTreeMap::new(),
            order: Vec::new(),
            initializing: BTreeSet::new(),
        }
    }
}

/// Whether `expression` is a plain access path: identifiers, member reads and
/// the reflective calls host paths are built from.
fn is_access_path(expression: &Expression) -> bool {
    match &expression.kind {
        ExpressionKind::Identifier(_) | ExpressionKind::String(_) | ExpressionKind::Number(_) => true,
        ExpressionKind::Member { object, property } => {
            is_access_path(object)
                && match property {
                    MemberProperty::Named { .. } => true,
                    MemberProperty::Computed(key) => is_access_path(key),
                }
        }
        ExpressionKind::Call { callee, arguments } => {
            let reflective = matches!(
                &callee.kind,
                ExpressionKind::Member {
                    property: MemberProperty::Named { name, .. },
                    ..
                } if matches!(name.as_str(), "getPrototypeOf" | "getOwnPropertyDescriptor" | "for" | "valueOf" | "values")
            );
            reflective
                && is_access_path(callee)
                && arguments
                    .iter()
                    .all(|argument| !argument.spread && is_access_path(&argument.expression))
        }
        // `[...p.values()]`, the spread form Set element paths use.
        ExpressionKind::Array(elements) => match elements.as_slice() {
            [Some(element)] => element.spread && is_access_path(&element.expression),
            _ => false,
        },
        _ => false,
    }
}

impl Realm {
    /// Rebuild the value graph held by `envelope`.
    pub fn deserialize(&mut self, envelope: &Envelope) -> EngineResult<JsValue> {
        let index = self.sessions.len();
        self.sessions.push(DeserializeSession::new(envelope.heap.clone()));
        let result = self.run_session(index, &envelope.serialized);
        let created = self.sessions.get(index).map_or(0, |session| session.order.len());
        self.sessions.truncate(index);
        for table in &mut self.scope_tables {
            if table.session == Some(index) {
                table.session = None;
            }
        }
        let detail = format!("entries={} created={created}", envelope.heap.len());
        self.record_outcome("deserializer", "deserialize", &result, detail);
        result
    }

    fn run_session(&mut self, index: usize, root: &SerializedValue) -> EngineResult<JsValue> {
        let root = self.session_resolve(index, root)?;

        let heap = self.session_heap(index)?;
        let mut cursor = 0;
        while let Some(reference) = self.session(index)?.order.get(cursor).cloned() {
            cursor += 1;
            let Some(entry) = heap.get(&reference) else {
                continue;
            };
            for dependency in self.dependencies(entry)? {
                self.session_resolve(index, &dependency)?;
            }
        }

        let order = self.session(index)?.order.clone();
        for reference in &order {
            if let Some(entry) = heap.get(reference) {
                self.link_entry(index, reference, entry)?;
            }
        }
        Ok(root)
    }

    fn session(&self, index: usize) -> EngineResult<&DeserializeSession> {
        self.sessions
            .get(index)
            .ok_or_else(|| EngineError::invalid_envelope(format!("reconstruction session {index} is closed")))
    }

    fn session_mut(&mut self, index: usize) -> EngineResult<&mut DeserializeSession> {
        self.sessions
            .get_mut(index)
            .ok_or_else(|| EngineError::invalid_envelope(format!("reconstruction session {index} is closed")))
    }

    fn session_heap(&self, index: usize) -> EngineResult<Rc<IndexMap<String, HeapEntry>>> {
        Ok(Rc::clone(&self.session(index)?.heap))
    }

    /// Serialized values an entry needs before it can be linked.
    fn dependencies(&self, entry: &HeapEntry) -> EngineResult<Vec<SerializedValue>> {
        let mut found = vec![entry.prototype.clone()];
        for (key, descriptor) in &entry.own_properties {
            found.push(key.clone());
            found.extend(
                [&descriptor.value, &descriptor.get, &descriptor.set]
                    .into_iter()
                    .flatten()
                    .cloned(),
            );
        }
        if entry.object_type != NOT_SPECIAL
            && let Some(encoder) = self.encoders.lookup(&entry.object_type)?
        {
            found.extend(encoder.references(&entry.data));
        }
        Ok(found)
    }

    /// Live value for `value` within session `index`.
    pub(crate) fn session_resolve(&mut self, index: usize, value: &SerializedValue) -> EngineResult<JsValue> {
        Ok(match value {
            SerializedValue::Simple { value } => match value {
                serde_json::Value::Null => JsValue::Null,
                serde_json::Value::Bool(b) => JsValue::Bool(*b),
                serde_json::Value::String(s) => JsValue::Str(s.clone()),
                serde_json::Value::Number(n) => match n.as_f64() {
                    Some(n) => JsValue::Number(n),
                    None => return Err(EngineError::invalid_envelope(format!("number {n} out of range"))),
                },
                other => {
                    return Err(EngineError::invalid_envelope(format!(
                        "simple value {other} is not a JSON primitive"
                    )));
                }
            },
            SerializedValue::Nan => JsValue::Number(f64::NAN),
            SerializedValue::Infinity => JsValue::Number(f64::INFINITY),
            SerializedValue::NegativeInfinity => JsValue::Number(f64::NEG_INFINITY),
            SerializedValue::NegativeZero => JsValue::Number(-0.0),
            SerializedValue::Bigint { value_string } => match value_string.parse::<i128>() {
                Ok(n) => JsValue::BigInt(n),
                Err(_) => {
                    return Err(EngineError::invalid_envelope(format!(
                        "bigint `{value_string}` is not a decimal integer in range"
                    )));
                }
            },
            SerializedValue::Undefined | SerializedValue::ManualStop => JsValue::Undefined,
            SerializedValue::UnregisteredSymbol { reference, description } => {
                match self.references.symbol_for_reference(reference) {
                    Some(symbol) => JsValue::Symbol(symbol),
                    None => {
                        let symbol = self.symbols.create(description.clone());
                        self.references.bind_symbol(reference.clone(), symbol);
                        JsValue::Symbol(symbol)
                    }
                }
            }
            SerializedValue::RegisteredSymbol { key } => JsValue::Symbol(self.symbols.symbol_for(key)),
            SerializedValue::HostObject { path } => self.eval_host_path(path)?,
            SerializedValue::ObjectLike { reference } => self.session_object(index, reference)?,
        })
    }

    fn session_object(&mut self, index: usize, reference: &str) -> EngineResult<JsValue> {
        let session = self.session(index)?;
        if let Some(value) = session.values.get(reference) {
            return Ok(value.clone());
        }
        if session.initializing.contains(reference) {
            return Err(EngineError::invalid_envelope(format!(
                "cyclic initialization of `{reference}`"
            )));
        }
        let heap = Rc::clone(&session.heap);
        let Some(entry) = heap.get(reference) else {
            return Err(EngineError::MissingHeapEntry {
                reference: reference.to_string(),
            });
        };

        self.session_mut(index)?.initializing.insert(reference.to_string());
        let result = self.initialize_entry(index, entry);
        let session = self.session_mut(index)?;
        session.initializing.remove(reference);
        let value = result?;
        session.values.insert(reference.to_string(), value.clone());
        session.order.push(reference.to_string());
        Ok(value)
    }

    fn initialize_entry(&mut self, index: usize, entry: &HeapEntry) -> EngineResult<JsValue> {
        if entry.object_type == NOT_SPECIAL {
            return Ok(JsValue::Object(self.create_object()));
        }
        let encoders = Rc::clone(&self.encoders);
        let Some(encoder) = encoders.lookup(&entry.object_type)? else {
            return Err(EngineError::UnknownObjectType {
                object_type: entry.object_type.clone(),
            });
        };
        let mut cx = DecodeContext::new(self, index);
        let value = encoder.initialize(&mut cx, &entry.data)?;
        if !value.is_object() {
            return Err(EngineError::invalid_envelope(format!(
                "`{}` skeleton is not an object",
                entry.object_type
            )));
        }
        Ok(value)
    }

    fn link_entry(&mut self, index: usize, reference: &str, entry: &HeapEntry) -> EngineResult<()> {
        let value = self.session_object(index, reference)?;
        let Some(object) = value.as_object() else {
            return Ok(());
        };

        if entry.object_type != NOT_SPECIAL {
            let encoders = Rc::clone(&self.encoders);
            if let Some(encoder) = encoders.lookup(&entry.object_type)? {
                let mut cx = DecodeContext::new(self, index);
                encoder.link(&mut cx, &value, &entry.data)?;
            }
        }

        let prototype = match self.session_resolve(index, &entry.prototype)? {
            JsValue::Object(prototype) => Some(Some(prototype)),
            JsValue::Null => Some(None),
            JsValue::Undefined => None,
            other => {
                return Err(EngineError::invalid_envelope(format!(
                    "`{reference}` has a primitive prototype {}",
                    self.display_value(&other)
                )));
            }
        };
        if let Some(prototype) = prototype
            && !self.heap.set_prototype_of(object, prototype)?
        {
            return Err(EngineError::invalid_envelope(format!(
                "cannot set the prototype of `{reference}`"
            )));
        }

        for (key, wire) in &entry.own_properties {
            let key = match self.session_resolve(index, key)? {
                JsValue::Str(name) => PropertyKey::String(name),
                JsValue::Symbol(symbol) => PropertyKey::Symbol(symbol),
                other => {
                    return Err(EngineError::invalid_envelope(format!(
                        "`{reference}` has a property key {} that is neither string nor symbol",
                        self.display_value(&other)
                    )));
                }
            };
            let existing = self.heap.get_own_property_descriptor(object, &key)?;
            let descriptor = self.descriptor_from_wire(index, wire, existing.as_ref())?;
            if existing.as_ref().is_some_and(|existing| existing.same_as(&descriptor)) {
                continue;
            }
            if !self.heap.define_property(object, key.clone(), descriptor)? {
                return Err(EngineError::invalid_envelope(format!(
                    "cannot define property {} on `{reference}`",
                    self.key_display(&key)
                )));
            }
        }

        if !entry.is_extensible {
            self.heap.prevent_extensions(object)?;
        }
        Ok(())
    }

    /// Complete a wire descriptor; absent fields keep the existing
    /// property's value or default to `false`/`undefined`.
    fn descriptor_from_wire(
        &mut self,
        index: usize,
        wire: &SerializedDescriptor,
        existing: Option<&PropertyDescriptor>,
    ) -> EngineResult<PropertyDescriptor> {
        let enumerable = wire
            .enumerable
            .or_else(|| existing.map(PropertyDescriptor::is_enumerable))
            .unwrap_or(false);
        let configurable = wire
            .configurable
            .or_else(|| existing.map(PropertyDescriptor::is_configurable))
            .unwrap_or(false);

        let accessor = wire.get.is_some()
            || wire.set.is_some()
            || (wire.value.is_none() && wire.writable.is_none() && existing.is_some_and(PropertyDescriptor::is_accessor));
        if accessor {
            let (old_get, old_set) = match existing {
                Some(PropertyDescriptor::Accessor { get, set, .. }) => (*get, *set),
                _ => (None, None),
            };
            let get = match &wire.get {
                Some(get) => self.wire_accessor_half(index, get, "get")?,
                None => old_get,
            };
            let set = match &wire.set {
                Some(set) => self.wire_accessor_half(index, set, "set")?,
                None => old_set,
            };
            return Ok(PropertyDescriptor::Accessor {
                get,
                set,
                enumerable,
                configurable,
            });
        }

        let value = match &wire.value {
            Some(value) => self.session_resolve(index, value)?,
            None => existing.and_then(PropertyDescriptor::value).cloned().unwrap_or(JsValue::Undefined),
        };
        let writable = wire
            .writable
            .or_else(|| existing.filter(|d| d.is_data()).map(PropertyDescriptor::is_writable))
            .unwrap_or(false);
        Ok(PropertyDescriptor::Data {
            value,
            writable,
            enumerable,
            configurable,
        })
    }

    fn wire_accessor_half(&mut self, index: usize, value: &SerializedValue, half: &str) -> EngineResult<Option<ObjectHandle>> {
        match self.session_resolve(index, value)? {
            JsValue::Undefined => Ok(None),
            JsValue::Object(function) if self.heap.is_function(function) => Ok(Some(function)),
            other => Err(EngineError::invalid_envelope(format!(
                "accessor {half} is not a function: {}",
                self.display_value(&other)
            ))),
        }
    }

    fn eval_host_path(&mut self, path: &str) -> EngineResult<JsValue> {
        let expression = parse_expression_source(path, RECONSTRUCT_LABEL)
            .map_err(|error| EngineError::invalid_envelope(format!("host path `{path}` does not parse: {error}")))?;
        if !is_access_path(&expression) {
            return Err(EngineError::invalid_envelope(format!(
                "host path `{path}` is not an access path"
            )));
        }
        let env = self.script_env;
        self.eval_expression(&expression, env)
    }

    /// Evaluate recorded source text with `table` answering its scope lookups.
    pub(crate) fn eval_with_scope_table(&mut self, source: &str, table: ScopeTableId) -> EngineResult<JsValue> {
        let expression = parse_expression_source(source, RECONSTRUCT_LABEL)
            .map_err(|error| EngineError::invalid_envelope(format!("recorded source does not parse: {error}")))?;
        let env = self.new_env(Some(self.global_env), EnvironmentKind::Declarative);
        self.env_mut(env)?.scope_table = Some(table);
        self.eval_expression(&expression, env)
    }

    /// Evaluate a member expression with `C` bound to `class`.
    pub(crate) fn eval_member_expression(&mut self, class: &JsValue, expression: &str) -> EngineResult<JsValue> {
        let parsed = parse_expression_source(expression, RECONSTRUCT_LABEL)
            .map_err(|error| EngineError::invalid_envelope(format!("member expression does not parse: {error}")))?;
        let env = self.new_env(Some(self.global_env), EnvironmentKind::Declarative);
        self.declare_binding(env, CLASS_PLACEHOLDER, BindingSlot::new_initialized(class.clone(), false))?;
        self.eval_expression(&parsed, env)
    }

    /// Build a function or class from recorded source and register it with
    /// `table` as its scope.
    pub(crate) fn reconstruct_function(&mut self, source: &str, table: ScopeTableId) -> EngineResult<JsValue> {
        let value = self.eval_with_scope_table(source, table)?;
        let Some(function) = value.as_object().filter(|handle| self.heap.is_function(*handle)) else {
            return Err(EngineError::invalid_envelope("recorded source did not produce a function"));
        };
        self.registry.register(
            function,
            RegistrationRecord::Syntactic {
                scope: ScopeSource::Table(table),
                source_text: source.to_string(),
            },
        );
        if matches!(
            self.heap.kind(function)?,
            ObjectKind::Function(FunctionBehavior::Class { .. })
        ) {
            self.register_class_members(function)?;
        }
        Ok(value)
    }

    /// A fresh evaluation of `class`'s recorded source, so members replaced
    /// on the live class can be re-derived.  Classes without a syntactic
    /// record are returned unchanged.
    pub(crate) fn pristine_class(&mut self, class: ObjectHandle) -> EngineResult<ObjectHandle> {
        let Some(RegistrationRecord::Syntactic { scope, source_text }) = self.registry.get(class).cloned() else {
            return Ok(class);
        };
        let table = match scope {
            ScopeSource::Table(table) => table,
            ScopeSource::Thunk(_) => {
                let entries = scope_captures(self, scope)?
                    .into_iter()
                    .map(|(name, value)| (name, ScopeEntry::Resolved(value)))
                    .collect();
                self.new_scope_table(ScopeTable { entries, session: None })
            }
        };
        let fresh = self.reconstruct_function(&source_text, table)?;
        fresh
            .as_object()
            .ok_or_else(|| EngineError::invalid_envelope("class source did not produce a class"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::serializer::SerializeOptions;

    fn realm() -> Realm {
        Realm::new(EngineConfig::default()).expect("realm")
    }

    fn round_trip(realm: &mut Realm, value: &JsValue) -> JsValue {
        let envelope = realm.serialize(value, SerializeOptions::default()).expect("serialize");
        let json = envelope.to_json_string().expect("json");
        let envelope = Envelope::from_json_str(&json).expect("parse");
        realm.deserialize(&envelope).expect("deserialize")
    }

    #[test]
    fn access_paths_are_recognized() {
        let ok = |path: &str| is_access_path(&parse_expression_source(path, "t").expect("parse"));
        assert!(ok(r#"globalThis["Map"]"#));
        assert!(ok(r#"Object.getOwnPropertyDescriptor(Object.getPrototypeOf(globalThis["Map"]["prototype"]), "size").get"#));
        assert!(ok(r#"globalThis[Symbol.for("k")]"#));
        assert!(ok(r#"[...globalThis["app"]["tags"].values()][2]"#));
        assert!(!ok(r#"[...globalThis["a"], globalThis["b"]][0]"#));
        assert!(!ok("globalThis.x = 1"));
        assert!(!ok("(() => 1)()"));
        assert!(!ok("new Map()"));
    }

    #[test]
    fn cycles_come_back_as_cycles() {
        let mut realm = realm();
        let obj = realm.eval_script("const o = { a: 1 }; o.self = o; o").expect("eval");
        let copy = round_trip(&mut realm, &obj);
        assert_ne!(copy, obj);
        realm.set_global("copy", copy).expect("set");
        let check = realm.eval_script("copy.a === 1 && copy.self === copy").expect("check");
        assert_eq!(check, JsValue::Bool(true));
    }

    #[test]
    fn missing_entries_are_envelope_errors() {
        let mut realm = realm();
        let envelope = Envelope::from_json_str(
            r#"{"heap":{},"serialized":{"type":"object-like","reference":"ref9"}}"#,
        )
        .expect("parse");
        let err = realm.deserialize(&envelope).expect_err("missing");
        assert_eq!(err.stable_code(), "FE-SER-2001");
        assert!(realm.sessions.is_empty());
    }

    #[test]
    fn unknown_object_types_are_rejected() {
        let mut realm = realm();
        let envelope = Envelope::from_json_str(
            r#"{"heap":{"ref0":{"objectType":"teapot","prototype":{"type":"simple","value":null},"isExtensible":true,"ownProperties":[],"data":null}},
                "serialized":{"type":"object-like","reference":"ref0"}}"#,
        )
        .expect("parse");
        let err = realm.deserialize(&envelope).expect_err("unknown");
        assert_eq!(err.stable_code(), "FE-SER-2002");
    }

    #[test]
    fn view_bounds_that_overflow_are_envelope_errors() {
        let mut realm = realm();
        let envelope = Envelope::from_json_str(
            r#"{"heap":{
                "ref0":{"objectType":"uint8-array","prototype":{"type":"simple","value":null},"isExtensible":true,"ownProperties":[],
                        "data":{"buffer":{"type":"object-like","reference":"ref1"},"byteOffset":18446744073709551615,"length":2}},
                "ref1":{"objectType":"array-buffer","prototype":{"type":"simple","value":null},"isExtensible":true,"ownProperties":[],
                        "data":{"detached":false,"resizable":false,"byteLength":1,"maxByteLength":1,"content":"00"}}},
                "serialized":{"type":"object-like","reference":"ref0"}}"#,
        )
        .expect("parse");
        let err = realm.deserialize(&envelope).expect_err("overflowing view");
        assert_eq!(err.stable_code(), "FE-SER-2003");
        assert!(realm.sessions.is_empty());
    }

    #[test]
    fn host_paths_must_be_access_paths() {
        let mut realm = realm();
        let envelope = Envelope::from_json_str(
            r#"{"heap":{},"serialized":{"type":"host-object","path":"globalThis.pwned = 1"}}"#,
        )
        .expect("parse");
        let err = realm.deserialize(&envelope).expect_err("rejected");
        assert_eq!(err.stable_code(), "FE-SER-2003");
        assert_eq!(realm.get_global("pwned").ok(), None);
    }

    #[test]
    fn special_values_round_trip() {
        let mut realm = realm();
        let value = realm
            .eval_script("[NaN, -0, Infinity, -Infinity, 12n, undefined, null, 'x', Symbol.for('k')]")
            .expect("eval");
        let copy = round_trip(&mut realm, &value);
        realm.set_global("copy", copy).expect("set");
        let check = realm
            .eval_script(
                "Object.is(copy[0], NaN) && Object.is(copy[1], -0) && copy[2] === Infinity && copy[3] === -Infinity \
                 && copy[4] === 12n && copy[5] === undefined && copy[6] === null && copy[7] === 'x' \
                 && copy[8] === Symbol.for('k') && copy.length === 9",
            )
            .expect("check");
        assert_eq!(check, JsValue::Bool(true));
    }

    #[test]
    fn non_extensible_objects_stay_locked() {
        let mut realm = realm();
        let value = realm.eval_script("Object.freeze({ k: 1 })").expect("eval");
        let copy = round_trip(&mut realm, &value);
        realm.set_global("copy", copy).expect("set");
        let check = realm
            .eval_script("Object.isFrozen(copy) && !Object.isExtensible(copy) && copy.k === 1")
            .expect("check");
        assert_eq!(check, JsValue::Bool(true));
    }

    #[test]
    fn unregistered_symbols_keep_identity_in_one_realm() {
        let mut realm = realm();
        let value = realm.eval_script("globalThis.tag = Symbol('t'); ({ [tag]: 1, t: tag })").expect("eval");
        let copy = round_trip(&mut realm, &value);
        realm.set_global("copy", copy).expect("set");
        let check = realm.eval_script("copy.t === tag && copy[tag] === 1").expect("check");
        assert_eq!(check, JsValue::Bool(true));
    }
}
