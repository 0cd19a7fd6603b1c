//! Per-type heap encoders.
//!
//! An encoder claims object-like values of one kind, turns their internal
//! state into a JSON payload, and on the way back builds a skeleton from that
//! payload and links whatever the skeleton could not hold at creation time.
//! Own properties, the prototype link and extensibility are handled by the
//! serializer and reconstructor for every entry; encoders only cover slots.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::envelope::SerializedValue;
use crate::error::{EngineError, EngineResult};
use crate::host_paths::PathStep;
use crate::intrinsics::{ErrorKind, number_to_json};
use crate::object_model::{
    ArrayBufferData, FunctionBehavior, JsValue, ObjectHandle, ObjectKind, PromiseState,
    PropertyDescriptor, PropertyKey,
};
use crate::realm::{Realm, ScopeEntry, ScopeTable};
use crate::registry::{RegistrationRecord, ScopeSource};
use crate::serializer::SerializePass;

/// Message of the error a pending promise is rejected with on reconstruction.
pub const PENDING_PROMISE_MESSAGE: &str =
    "suspending the realm rejects every pending promise; settle promises before serializing";

/// Serialization half handed to [`HeapEncoder::encode`].
pub struct EncodeContext<'p, 'r> {
    pass: &'p mut SerializePass<'r>,
    path: Option<String>,
}

impl<'p, 'r> EncodeContext<'p, 'r> {
    pub(crate) fn new(pass: &'p mut SerializePass<'r>, path: Option<String>) -> Self {
        Self { pass, path }
    }

    pub fn realm(&mut self) -> &mut Realm {
        self.pass.realm()
    }

    /// Host path of the object being encoded, when it has one.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Serialize a nested value reached from the current object via `step`.
    pub fn recurse(&mut self, value: &JsValue, step: PathStep) -> EngineResult<SerializedValue> {
        self.pass.child(value, self.path.as_deref(), &step)
    }
}

/// Reconstruction half handed to [`HeapEncoder::initialize`] and
/// [`HeapEncoder::link`].
pub struct DecodeContext<'r> {
    realm: &'r mut Realm,
    session: usize,
}

impl<'r> DecodeContext<'r> {
    pub(crate) fn new(realm: &'r mut Realm, session: usize) -> Self {
        Self { realm, session }
    }

    pub fn realm(&mut self) -> &mut Realm {
        self.realm
    }

    pub fn session(&self) -> usize {
        self.session
    }

    /// Live value for a serialized one, creating skeletons as needed.
    pub fn resolve(&mut self, value: &SerializedValue) -> EngineResult<JsValue> {
        self.realm.session_resolve(self.session, value)
    }
}

pub trait HeapEncoder {
    /// `objectType` written to heap entries this encoder produces.
    fn object_type(&self) -> &str;

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool;

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value>;

    /// Own properties for which this returns `false` are not serialized.
    fn property_filter(&self, _key: &PropertyKey) -> bool {
        true
    }

    /// Build the skeleton.  Must not depend on the skeleton's own properties.
    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue>;

    /// Serialized values inside `data` the reconstructor must materialize
    /// before linking.
    fn references(&self, data: &serde_json::Value) -> Vec<SerializedValue> {
        let mut found = Vec::new();
        collect_tagged(data, &mut found);
        found
    }

    /// Fill slots once every referenced skeleton exists.
    fn link(&self, _cx: &mut DecodeContext<'_>, _value: &JsValue, _data: &serde_json::Value) -> EngineResult<()> {
        Ok(())
    }
}

fn collect_tagged(data: &serde_json::Value, found: &mut Vec<SerializedValue>) {
    match data {
        serde_json::Value::Object(map) => {
            if map.contains_key("type")
                && let Ok(value) = SerializedValue::from_json(data)
            {
                found.push(value);
                return;
            }
            map.values().for_each(|value| collect_tagged(value, found));
        }
        serde_json::Value::Array(items) => items.iter().for_each(|value| collect_tagged(value, found)),
        _ => {}
    }
}

fn payload<T: DeserializeOwned>(object_type: &str, data: &serde_json::Value) -> EngineResult<T> {
    serde_json::from_value(data.clone()).map_err(|error| {
        EngineError::invalid_envelope(format!("malformed `{object_type}` payload: {error}"))
    })
}

fn to_payload<T: Serialize>(object_type: &str, value: &T) -> EngineResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|error| EngineError::NonJsonResidue {
        detail: format!("`{object_type}` payload: {error}"),
    })
}

fn kind_of(realm: &Realm, object: ObjectHandle) -> Option<&ObjectKind> {
    realm.heap.kind(object).ok()
}

/// Ordered set of encoders consulted by the serializer and reconstructor.
pub struct EncoderRegistry {
    encoders: Vec<Box<dyn HeapEncoder>>,
}

impl std::fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.encoders.iter().map(|encoder| encoder.object_type()))
            .finish()
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl EncoderRegistry {
    pub fn empty() -> Self {
        Self {
            encoders: Vec::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(ClassPrototypeEncoder));
        registry.register(Box::new(FunctionEncoder));
        registry.register(Box::new(ArrayEncoder));
        registry.register(Box::new(MapEncoder));
        registry.register(Box::new(SetEncoder));
        registry.register(Box::new(PrimitiveWrapperEncoder));
        registry.register(Box::new(RegExpEncoder));
        registry.register(Box::new(ErrorEncoder));
        registry.register(Box::new(PromiseEncoder));
        registry.register(Box::new(DateEncoder));
        registry.register(Box::new(ArrayBufferEncoder));
        registry.register(Box::new(Uint8ArrayEncoder));
        registry
    }

    /// Append an encoder.  Duplicate object types surface when looked up.
    pub fn register(&mut self, encoder: Box<dyn HeapEncoder>) {
        self.encoders.push(encoder);
    }

    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }

    pub fn object_types(&self) -> Vec<&str> {
        self.encoders.iter().map(|encoder| encoder.object_type()).collect()
    }

    /// Every encoder claiming `object`.
    pub fn matching(&self, realm: &Realm, object: ObjectHandle) -> Vec<&dyn HeapEncoder> {
        self.encoders
            .iter()
            .filter(|encoder| encoder.matches(realm, object))
            .map(|encoder| encoder.as_ref())
            .collect()
    }

    /// The single encoder registered for `object_type`.
    pub fn lookup(&self, object_type: &str) -> EngineResult<Option<&dyn HeapEncoder>> {
        let mut found = self
            .encoders
            .iter()
            .filter(|encoder| encoder.object_type() == object_type);
        let first = found.next();
        if found.next().is_some() {
            return Err(EngineError::DuplicateEncoder {
                object_type: object_type.to_string(),
            });
        }
        Ok(first.map(|encoder| encoder.as_ref()))
    }
}

// ---------------------------------------------------------------------------
// class-prototype
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct ClassPrototypePayload {
    class: SerializedValue,
}

pub struct ClassPrototypeEncoder;

impl HeapEncoder for ClassPrototypeEncoder {
    fn object_type(&self) -> &str {
        "class-prototype"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        realm.registry.class_for_prototype(object).is_some()
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let class = cx
            .realm()
            .registry
            .class_for_prototype(object)
            .map_or(JsValue::Undefined, JsValue::Object);
        let class = cx.recurse(&class, PathStep::Unknown)?;
        to_payload(self.object_type(), &ClassPrototypePayload { class })
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let payload: ClassPrototypePayload = payload(self.object_type(), data)?;
        let class = cx.resolve(&payload.class)?;
        let realm = cx.realm();
        let prototype = realm.get_property(&class, &PropertyKey::from("prototype"))?;
        if !prototype.is_object() {
            return Err(EngineError::invalid_envelope("class-prototype entry names a class without a prototype"));
        }
        Ok(prototype)
    }
}

// ---------------------------------------------------------------------------
// function
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopeCapture {
    name: String,
    value: SerializedValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "functionType", rename_all = "kebab-case")]
enum FunctionPayload {
    Syntactic {
        scope: Vec<ScopeCapture>,
        source: String,
    },
    Class {
        class: SerializedValue,
        expression: String,
        /// The class slot no longer holds this member; rebuild it from a
        /// fresh evaluation of the class source.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        detached: bool,
    },
}

pub struct FunctionEncoder;

/// Current values of a syntactic record's captured bindings.
pub(crate) fn scope_captures(realm: &mut Realm, scope: ScopeSource) -> EngineResult<Vec<(String, JsValue)>> {
    match scope {
        ScopeSource::Thunk(thunk) => {
            let bindings = realm.call(&JsValue::Object(thunk), JsValue::Undefined, Vec::new())?;
            let Some(bindings) = bindings.as_object() else {
                return Err(realm.type_error("scope thunk must return an object"));
            };
            let mut captures = Vec::new();
            for (key, desc) in realm.heap.own_property_entries(bindings)? {
                let PropertyKey::String(name) = &key else {
                    continue;
                };
                if !desc.is_enumerable() {
                    continue;
                }
                let value = realm.get_from(bindings, &key, &JsValue::Object(bindings))?;
                captures.push((name.clone(), value));
            }
            Ok(captures)
        }
        ScopeSource::Table(table) => {
            let names: Vec<String> = realm
                .scope_tables
                .get(table)
                .map(|scope| scope.entries.keys().cloned().collect())
                .unwrap_or_default();
            let mut captures = Vec::with_capacity(names.len());
            for name in names {
                let value = realm.scope_entry_value(table, &name)?;
                captures.push((name, value));
            }
            Ok(captures)
        }
    }
}

impl HeapEncoder for FunctionEncoder {
    fn object_type(&self) -> &str {
        "function"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        realm.heap.is_function(object)
    }

    fn property_filter(&self, key: &PropertyKey) -> bool {
        !matches!(key.as_str(), Some("arguments" | "caller" | "callee"))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let record = cx.realm().registry.get(object).cloned();
        let payload = match record {
            Some(RegistrationRecord::Syntactic { scope, source_text }) => {
                let captures = scope_captures(cx.realm(), scope)?;
                let mut scope = Vec::with_capacity(captures.len());
                for (name, value) in captures {
                    let value = cx.recurse(&value, PathStep::Unknown)?;
                    scope.push(ScopeCapture { name, value });
                }
                FunctionPayload::Syntactic {
                    scope,
                    source: source_text,
                }
            }
            Some(RegistrationRecord::ClassMember {
                owning_class,
                member_expression,
            }) => {
                let current = cx
                    .realm()
                    .eval_member_expression(&JsValue::Object(owning_class), &member_expression)?;
                let class = cx.recurse(&JsValue::Object(owning_class), PathStep::Unknown)?;
                FunctionPayload::Class {
                    class,
                    expression: member_expression,
                    detached: current != JsValue::Object(object),
                }
            }
            None => {
                if cx.path().is_some() || cx.realm().host_paths.contains(object) {
                    return Ok(json!({}));
                }
                let realm = cx.realm();
                let reference = realm.references.object_reference(object);
                return Err(EngineError::UnregisteredFunction {
                    reference,
                    description: describe_function(realm, object),
                });
            }
        };
        to_payload(self.object_type(), &payload)
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let payload: FunctionPayload = payload(self.object_type(), data)?;
        match payload {
            FunctionPayload::Syntactic { scope, source } => {
                let session = cx.session();
                let mut table = ScopeTable {
                    session: Some(session),
                    ..ScopeTable::default()
                };
                for capture in scope {
                    table
                        .entries
                        .insert(capture.name, ScopeEntry::Pending(capture.value));
                }
                let realm = cx.realm();
                let table = realm.new_scope_table(table);
                realm.reconstruct_function(&source, table)
            }
            FunctionPayload::Class {
                class,
                expression,
                detached,
            } => {
                let class = cx.resolve(&class)?;
                let realm = cx.realm();
                let Some(owning_class) = class.as_object() else {
                    return Err(EngineError::invalid_envelope("class member entry names a non-object class"));
                };
                let owning_class = if detached {
                    realm.pristine_class(owning_class)?
                } else {
                    owning_class
                };
                let member = realm.eval_member_expression(&JsValue::Object(owning_class), &expression)?;
                let Some(function) = member.as_object().filter(|h| realm.heap.is_function(*h)) else {
                    return Err(EngineError::invalid_envelope(format!(
                        "class member `{expression}` did not evaluate to a function"
                    )));
                };
                realm.registry.register(
                    function,
                    RegistrationRecord::ClassMember {
                        owning_class,
                        member_expression: expression,
                    },
                );
                Ok(member)
            }
        }
    }

    fn references(&self, data: &serde_json::Value) -> Vec<SerializedValue> {
        match serde_json::from_value::<FunctionPayload>(data.clone()) {
            Ok(FunctionPayload::Syntactic { scope, .. }) => {
                scope.into_iter().map(|capture| capture.value).collect()
            }
            Ok(FunctionPayload::Class { class, .. }) => vec![class],
            Err(_) => Vec::new(),
        }
    }

    fn link(&self, cx: &mut DecodeContext<'_>, value: &JsValue, data: &serde_json::Value) -> EngineResult<()> {
        let FunctionPayload::Syntactic { scope, .. } = payload(self.object_type(), data)? else {
            return Ok(());
        };
        let Some(function) = value.as_object() else {
            return Ok(());
        };
        let table = match cx.realm().registry.get(function) {
            Some(RegistrationRecord::Syntactic {
                scope: ScopeSource::Table(table),
                ..
            }) => *table,
            _ => return Ok(()),
        };
        let mut resolved = Vec::with_capacity(scope.len());
        for capture in scope {
            let value = cx.resolve(&capture.value)?;
            resolved.push((capture.name, value));
        }
        if let Some(table) = cx.realm().scope_tables.get_mut(table) {
            for (name, value) in resolved {
                table.entries.insert(name, ScopeEntry::Resolved(value));
            }
            table.session = None;
        }
        Ok(())
    }
}

fn describe_function(realm: &Realm, function: ObjectHandle) -> String {
    let name = realm.function_name(function);
    let name = if name.is_empty() { "(anonymous)" } else { name.as_str() };
    match realm.heap.kind(function) {
        Ok(ObjectKind::Function(FunctionBehavior::Native { .. })) => format!("native function {name}"),
        Ok(ObjectKind::Function(FunctionBehavior::Class { .. })) => format!("class {name}"),
        _ => format!("function {name}"),
    }
}

// ---------------------------------------------------------------------------
// array, map, set
// ---------------------------------------------------------------------------

pub struct ArrayEncoder;

impl HeapEncoder for ArrayEncoder {
    fn object_type(&self) -> &str {
        "array"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::Array))
    }

    fn encode(&self, _cx: &mut EncodeContext<'_, '_>, _object: ObjectHandle) -> EngineResult<serde_json::Value> {
        Ok(json!({}))
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, _data: &serde_json::Value) -> EngineResult<JsValue> {
        Ok(JsValue::Object(cx.realm().create_array(Vec::new())?))
    }
}

#[derive(Serialize, Deserialize)]
struct MapPayload {
    entries: Vec<(SerializedValue, SerializedValue)>,
}

pub struct MapEncoder;

impl HeapEncoder for MapEncoder {
    fn object_type(&self) -> &str {
        "map"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::Map(_)))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let live: Vec<(JsValue, JsValue)> = match cx.realm().heap.kind(object)? {
            ObjectKind::Map(entries) => entries.iter().map(|(k, v)| (k.to_value(), v.clone())).collect(),
            _ => Vec::new(),
        };
        let mut entries = Vec::with_capacity(live.len());
        for (key, value) in live {
            entries.push((cx.recurse(&key, PathStep::Unknown)?, cx.recurse(&value, PathStep::Unknown)?));
        }
        to_payload(self.object_type(), &MapPayload { entries })
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, _data: &serde_json::Value) -> EngineResult<JsValue> {
        let realm = cx.realm();
        let prototype = realm.intrinsics.map_prototype;
        Ok(JsValue::Object(
            realm.heap.alloc(Some(prototype), ObjectKind::Map(Default::default())),
        ))
    }

    fn link(&self, cx: &mut DecodeContext<'_>, value: &JsValue, data: &serde_json::Value) -> EngineResult<()> {
        let payload: MapPayload = payload(self.object_type(), data)?;
        let Some(map) = value.as_object() else {
            return Ok(());
        };
        for (key, item) in payload.entries {
            let key = cx.resolve(&key)?;
            let item = cx.resolve(&item)?;
            cx.realm().map_insert(map, &key, item)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SetPayload {
    elements: Vec<SerializedValue>,
}

pub struct SetEncoder;

impl HeapEncoder for SetEncoder {
    fn object_type(&self) -> &str {
        "set"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::Set(_)))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let live: Vec<JsValue> = match cx.realm().heap.kind(object)? {
            ObjectKind::Set(elements) => elements.iter().map(|key| key.to_value()).collect(),
            _ => Vec::new(),
        };
        let mut elements = Vec::with_capacity(live.len());
        for (index, element) in live.into_iter().enumerate() {
            elements.push(cx.recurse(&element, PathStep::SetElement(index))?);
        }
        to_payload(self.object_type(), &SetPayload { elements })
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, _data: &serde_json::Value) -> EngineResult<JsValue> {
        let realm = cx.realm();
        let prototype = realm.intrinsics.set_prototype;
        Ok(JsValue::Object(
            realm.heap.alloc(Some(prototype), ObjectKind::Set(Default::default())),
        ))
    }

    fn link(&self, cx: &mut DecodeContext<'_>, value: &JsValue, data: &serde_json::Value) -> EngineResult<()> {
        let payload: SetPayload = payload(self.object_type(), data)?;
        let Some(set) = value.as_object() else {
            return Ok(());
        };
        for element in payload.elements {
            let element = cx.resolve(&element)?;
            cx.realm().set_insert(set, &element)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// primitive-wrapper, regexp, error, date
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct WrapperPayload {
    value: SerializedValue,
}

pub struct PrimitiveWrapperEncoder;

impl HeapEncoder for PrimitiveWrapperEncoder {
    fn object_type(&self) -> &str {
        "primitive-wrapper"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::PrimitiveWrapper(_)))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let inner = match cx.realm().heap.kind(object)? {
            ObjectKind::PrimitiveWrapper(inner) => inner.clone(),
            _ => JsValue::Undefined,
        };
        let value = cx.recurse(&inner, PathStep::WrappedValue)?;
        to_payload(self.object_type(), &WrapperPayload { value })
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let payload: WrapperPayload = payload(self.object_type(), data)?;
        let inner = cx.resolve(&payload.value)?;
        if inner.is_object() || inner.is_nullish() {
            return Err(EngineError::invalid_envelope("primitive-wrapper payload must hold a primitive"));
        }
        Ok(JsValue::Object(cx.realm().to_object(&inner)?))
    }
}

#[derive(Serialize, Deserialize)]
struct RegExpPayload {
    source: String,
    flags: String,
}

pub struct RegExpEncoder;

impl HeapEncoder for RegExpEncoder {
    fn object_type(&self) -> &str {
        "regexp"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::RegExp { .. }))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let (source, flags) = match cx.realm().heap.kind(object)? {
            ObjectKind::RegExp { source, flags } => (source.clone(), flags.clone()),
            _ => (String::new(), String::new()),
        };
        to_payload(self.object_type(), &RegExpPayload { source, flags })
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let RegExpPayload { source, flags } = payload(self.object_type(), data)?;
        let realm = cx.realm();
        let prototype = realm.intrinsics.regexp_prototype;
        Ok(JsValue::Object(
            realm.heap.alloc(Some(prototype), ObjectKind::RegExp { source, flags }),
        ))
    }
}

#[derive(Serialize, Deserialize)]
struct ErrorPayload {
    message: String,
    name: String,
    stack: Option<String>,
}

pub struct ErrorEncoder;

impl HeapEncoder for ErrorEncoder {
    fn object_type(&self) -> &str {
        "error"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::Error))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let realm = cx.realm();
        let this = JsValue::Object(object);
        let mut text = |key: &str| -> EngineResult<Option<String>> {
            match realm.get_property(&this, &PropertyKey::from(key))? {
                JsValue::Undefined => Ok(None),
                value => realm.to_js_string(&value).map(Some),
            }
        };
        let message = text("message")?.unwrap_or_default();
        let name = text("name")?.unwrap_or_else(|| ErrorKind::Error.name().to_string());
        let stack = text("stack")?;
        to_payload(self.object_type(), &ErrorPayload { message, name, stack })
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let ErrorPayload { message, stack, .. } = payload(self.object_type(), data)?;
        let realm = cx.realm();
        let prototype = realm.intrinsics.error_prototype_for(ErrorKind::Error);
        let error = realm.heap.alloc(Some(prototype), ObjectKind::Error);
        realm.define_or_throw(
            error,
            PropertyKey::from("message"),
            PropertyDescriptor::hidden(JsValue::Str(message)),
        )?;
        if let Some(stack) = stack {
            realm.define_or_throw(
                error,
                PropertyKey::from("stack"),
                PropertyDescriptor::hidden(JsValue::Str(stack)),
            )?;
        }
        Ok(JsValue::Object(error))
    }
}

#[derive(Serialize, Deserialize)]
struct DatePayload {
    /// `null` for an invalid date.
    ms: Option<f64>,
}

pub struct DateEncoder;

impl HeapEncoder for DateEncoder {
    fn object_type(&self) -> &str {
        "date"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::Date(_)))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let ms = match cx.realm().heap.kind(object)? {
            ObjectKind::Date(ms) if ms.is_finite() => Some(*ms),
            _ => None,
        };
        Ok(json!({ "ms": ms.map(number_to_json) }))
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let DatePayload { ms } = payload(self.object_type(), data)?;
        let realm = cx.realm();
        let prototype = realm.intrinsics.date_prototype;
        Ok(JsValue::Object(
            realm.heap.alloc(Some(prototype), ObjectKind::Date(ms.unwrap_or(f64::NAN))),
        ))
    }
}

// ---------------------------------------------------------------------------
// promise
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
enum PromisePayload {
    Pending,
    Fulfilled { value: SerializedValue },
    Rejected { value: SerializedValue },
}

/// Settled promises keep their settlement; pending ones come back rejected.
pub struct PromiseEncoder;

impl HeapEncoder for PromiseEncoder {
    fn object_type(&self) -> &str {
        "promise"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::Promise(_)))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let state = match cx.realm().heap.kind(object)? {
            ObjectKind::Promise(state) => state.clone(),
            _ => PromiseState::Pending,
        };
        let payload = match state {
            PromiseState::Pending => PromisePayload::Pending,
            PromiseState::Fulfilled(value) => PromisePayload::Fulfilled {
                value: cx.recurse(&value, PathStep::Unknown)?,
            },
            PromiseState::Rejected(value) => PromisePayload::Rejected {
                value: cx.recurse(&value, PathStep::Unknown)?,
            },
        };
        to_payload(self.object_type(), &payload)
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let payload: PromisePayload = payload(self.object_type(), data)?;
        let realm = cx.realm();
        let state = match payload {
            PromisePayload::Pending => {
                let error = realm.create_error(ErrorKind::Error, PENDING_PROMISE_MESSAGE);
                PromiseState::Rejected(JsValue::Object(error))
            }
            PromisePayload::Fulfilled { .. } | PromisePayload::Rejected { .. } => PromiseState::Pending,
        };
        Ok(JsValue::Object(realm.create_promise(state)))
    }

    fn link(&self, cx: &mut DecodeContext<'_>, value: &JsValue, data: &serde_json::Value) -> EngineResult<()> {
        let state = match payload(self.object_type(), data)? {
            PromisePayload::Pending => return Ok(()),
            PromisePayload::Fulfilled { value } => PromiseState::Fulfilled(cx.resolve(&value)?),
            PromisePayload::Rejected { value } => PromiseState::Rejected(cx.resolve(&value)?),
        };
        if let Some(promise) = value.as_object()
            && let ObjectKind::Promise(current) = &mut cx.realm().heap.get_mut(promise)?.kind
        {
            *current = state;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// array-buffer, uint8-array
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArrayBufferPayload {
    detached: bool,
    resizable: bool,
    byte_length: usize,
    max_byte_length: usize,
    /// Hex-encoded bytes.
    content: String,
}

pub struct ArrayBufferEncoder;

impl HeapEncoder for ArrayBufferEncoder {
    fn object_type(&self) -> &str {
        "array-buffer"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::ArrayBuffer(_)))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let ObjectKind::ArrayBuffer(data) = cx.realm().heap.kind(object)? else {
            return Ok(json!({}));
        };
        let payload = ArrayBufferPayload {
            detached: data.detached,
            resizable: data.max_byte_length.is_some(),
            byte_length: data.bytes.len(),
            max_byte_length: data.max_byte_length.unwrap_or(data.bytes.len()),
            content: hex::encode(&data.bytes),
        };
        to_payload(self.object_type(), &payload)
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let payload: ArrayBufferPayload = payload(self.object_type(), data)?;
        let bytes = hex::decode(&payload.content).map_err(|error| {
            EngineError::invalid_envelope(format!("array-buffer content is not hex: {error}"))
        })?;
        if bytes.len() != payload.byte_length {
            return Err(EngineError::invalid_envelope(format!(
                "array-buffer content holds {} bytes, byteLength says {}",
                bytes.len(),
                payload.byte_length
            )));
        }
        if payload.resizable && payload.max_byte_length < bytes.len() {
            return Err(EngineError::invalid_envelope("array-buffer maxByteLength below byteLength"));
        }
        let data = ArrayBufferData {
            bytes,
            max_byte_length: payload.resizable.then_some(payload.max_byte_length),
            detached: payload.detached,
        };
        Ok(JsValue::Object(cx.realm().create_array_buffer(data)))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Uint8ArrayPayload {
    buffer: SerializedValue,
    byte_offset: usize,
    length: usize,
}

pub struct Uint8ArrayEncoder;

impl HeapEncoder for Uint8ArrayEncoder {
    fn object_type(&self) -> &str {
        "uint8-array"
    }

    fn matches(&self, realm: &Realm, object: ObjectHandle) -> bool {
        matches!(kind_of(realm, object), Some(ObjectKind::Uint8Array { .. }))
    }

    fn encode(&self, cx: &mut EncodeContext<'_, '_>, object: ObjectHandle) -> EngineResult<serde_json::Value> {
        let ObjectKind::Uint8Array {
            buffer,
            byte_offset,
            length,
        } = *cx.realm().heap.kind(object)?
        else {
            return Ok(json!({}));
        };
        let buffer = cx.recurse(&JsValue::Object(buffer), PathStep::Unknown)?;
        to_payload(
            self.object_type(),
            &Uint8ArrayPayload {
                buffer,
                byte_offset,
                length,
            },
        )
    }

    fn initialize(&self, cx: &mut DecodeContext<'_>, data: &serde_json::Value) -> EngineResult<JsValue> {
        let payload: Uint8ArrayPayload = payload(self.object_type(), data)?;
        let buffer = cx.resolve(&payload.buffer)?;
        let realm = cx.realm();
        let Some(buffer) = buffer.as_object() else {
            return Err(EngineError::invalid_envelope("uint8-array buffer is not an object"));
        };
        let available = match realm.heap.kind(buffer)? {
            ObjectKind::ArrayBuffer(data) => data.bytes.len(),
            _ => return Err(EngineError::invalid_envelope("uint8-array buffer is not an ArrayBuffer")),
        };
        let end = payload.byte_offset.checked_add(payload.length);
        if end.is_none_or(|end| end > available) {
            return Err(EngineError::invalid_envelope(format!(
                "uint8-array view {}+{} exceeds its {available}-byte buffer",
                payload.byte_offset, payload.length
            )));
        }
        let prototype = realm.intrinsics.uint8_array_prototype;
        Ok(JsValue::Object(realm.heap.alloc(
            Some(prototype),
            ObjectKind::Uint8Array {
                buffer,
                byte_offset: payload.byte_offset,
                length: payload.length,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_have_distinct_object_types() {
        let registry = EncoderRegistry::with_builtins();
        let mut types = registry.object_types();
        let total = types.len();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), total);
        assert!(registry.lookup("map").expect("lookup").is_some());
        assert!(registry.lookup("not-a-type").expect("lookup").is_none());
    }

    #[test]
    fn duplicate_object_types_fail_at_lookup() {
        let mut registry = EncoderRegistry::with_builtins();
        registry.register(Box::new(DateEncoder));
        let err = registry.lookup("date").err().expect("duplicate");
        assert_eq!(err.stable_code(), "FE-SER-1003");
        assert!(registry.lookup("map").is_ok());
    }

    #[test]
    fn tagged_values_are_collected_from_payloads() {
        let data = json!({
            "entries": [
                [{"type": "simple", "value": 1}, {"type": "object-like", "reference": "ref4"}]
            ],
            "note": {"nested": {"type": "undefined"}}
        });
        let found = ArrayEncoder.references(&data);
        assert_eq!(found.len(), 3);
        assert_eq!(found[1].reference(), Some("ref4"));
    }

    #[test]
    fn function_payload_tags() {
        let payload = FunctionPayload::Class {
            class: SerializedValue::object_like("ref1"),
            expression: "C[\"make\"]".into(),
            detached: false,
        };
        let encoded = serde_json::to_value(&payload).expect("encode");
        assert_eq!(encoded["functionType"], "class");
        assert!(encoded.get("detached").is_none());
        let syntactic: FunctionPayload = serde_json::from_value(json!({
            "functionType": "syntactic",
            "scope": [{"name": "x", "value": {"type": "simple", "value": 2}}],
            "source": "() => __$getFromScope(\"x\")"
        }))
        .expect("decode");
        assert!(matches!(syntactic, FunctionPayload::Syntactic { scope, .. } if scope.len() == 1));
    }
}
