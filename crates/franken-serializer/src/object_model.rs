//! Object model for the serializable value graph.
//!
//! Values, property keys, property descriptors and internal slots, stored in a
//! handle-based arena.  Key features:
//!
//! - **Property descriptors**: data vs accessor, configurable/enumerable/writable
//! - **Prototype chains**: `[[Prototype]]` slot with cycle and depth protection
//! - **Internal slots**: arrays, functions, Map/Set, Date, RegExp, Error,
//!   primitive wrappers, ArrayBuffer, Uint8Array, Promise
//! - **Symbol registry**: `Symbol.for` / `Symbol.keyFor` plus descriptions
//!
//! Own properties keep insertion order (`IndexMap`); `own_property_keys`
//! reports integer keys first, then strings, then symbols.

use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::ast::{ClassNode, FunctionNode};
use crate::intrinsics::NativeId;
use crate::realm::EnvironmentHandle;

// ---------------------------------------------------------------------------
// PropertyKey: string or symbol
// ---------------------------------------------------------------------------

/// Unique symbol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub u32);

/// A property key: either a string or a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    /// String key.
    String(String),
    /// Symbol key (references the realm's symbol registry).
    Symbol(SymbolId),
}

impl PropertyKey {
    /// Canonical array index (`"0"`, `"17"`, but not `"01"` or `"-1"`).
    pub fn as_array_index(&self) -> Option<u32> {
        let Self::String(s) = self else {
            return None;
        };
        if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
            return None;
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match s.parse::<u64>() {
            Ok(n) if n < u64::from(u32::MAX) => Some(n as u32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Symbol(_) => None,
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Symbol(id) => write!(f, "Symbol({})", id.0),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

// ---------------------------------------------------------------------------
// ObjectHandle
// ---------------------------------------------------------------------------

/// Opaque handle into the [`ObjectHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

// ---------------------------------------------------------------------------
// JsValue
// ---------------------------------------------------------------------------

/// Runtime value.
///
/// Functions are objects (`Object` with a function slot); `typeof` needs the
/// heap to tell them apart.
#[derive(Debug, Clone, PartialEq)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    Str(String),
    Symbol(SymbolId),
    Object(ObjectHandle),
}

impl JsValue {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(handle) => Some(*handle),
            _ => None,
        }
    }

    /// `Object.is` semantics: NaN equals NaN, `+0` and `-0` differ.
    pub fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                a.to_bits() == b.to_bits()
            }
            _ => self.strict_equals(other),
        }
    }

    /// SameValueZero: NaN equals NaN, `+0` equals `-0`.
    pub fn same_value_zero(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.strict_equals(other),
        }
    }

    /// `===`.
    pub fn strict_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::BigInt(a), Self::BigInt(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{}", number_to_string(*n)),
            Self::BigInt(n) => write!(f, "{n}n"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Symbol(id) => write!(f, "Symbol({})", id.0),
            Self::Object(h) => write!(f, "[object#{}]", h.0),
        }
    }
}

/// Number-to-string conversion for the subset of formats scripts observe.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        return format!("{}", n as i128);
    }
    if n.abs() >= 1e21 {
        return format!("{n:e}").replace('e', "e+");
    }
    format!("{n}")
}

// ---------------------------------------------------------------------------
// PropertyDescriptor
// ---------------------------------------------------------------------------

/// Property descriptor stored in an object's own-property table.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyDescriptor {
    /// Data descriptor: has `value` and `writable`.
    Data {
        value: JsValue,
        writable: bool,
        enumerable: bool,
        configurable: bool,
    },
    /// Accessor descriptor: has `get` and/or `set`.
    Accessor {
        get: Option<ObjectHandle>,
        set: Option<ObjectHandle>,
        enumerable: bool,
        configurable: bool,
    },
}

impl PropertyDescriptor {
    /// Create a default data descriptor (writable, enumerable, configurable).
    pub fn data(value: JsValue) -> Self {
        Self::Data {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Writable, configurable, non-enumerable: the shape of built-in methods
    /// and class members.
    pub fn hidden(value: JsValue) -> Self {
        Self::Data {
            value,
            writable: true,
            enumerable: false,
            configurable: true,
        }
    }

    /// Non-writable, non-enumerable, configurable: `name` and `length` of functions.
    pub fn readonly_hidden(value: JsValue) -> Self {
        Self::Data {
            value,
            writable: false,
            enumerable: false,
            configurable: true,
        }
    }

    /// Create a non-writable, non-enumerable, non-configurable data descriptor.
    pub fn data_frozen(value: JsValue) -> Self {
        Self::Data {
            value,
            writable: false,
            enumerable: false,
            configurable: false,
        }
    }

    pub fn is_configurable(&self) -> bool {
        match self {
            Self::Data { configurable, .. } | Self::Accessor { configurable, .. } => *configurable,
        }
    }

    pub fn is_enumerable(&self) -> bool {
        match self {
            Self::Data { enumerable, .. } | Self::Accessor { enumerable, .. } => *enumerable,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    pub fn is_accessor(&self) -> bool {
        matches!(self, Self::Accessor { .. })
    }

    /// Get the value if this is a data descriptor.
    pub fn value(&self) -> Option<&JsValue> {
        match self {
            Self::Data { value, .. } => Some(value),
            Self::Accessor { .. } => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Self::Data { writable, .. } => *writable,
            Self::Accessor { .. } => false,
        }
    }

    pub fn set_non_configurable(&mut self) {
        match self {
            Self::Data { configurable, .. } | Self::Accessor { configurable, .. } => {
                *configurable = false;
            }
        }
    }

    /// Make this data descriptor non-writable (no-op for accessors).
    pub fn set_non_writable(&mut self) {
        if let Self::Data { writable, .. } = self {
            *writable = false;
        }
    }

    /// Field-by-field equality with SameValue on data values.  Used to skip
    /// redundant redefinitions.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Data {
                    value: a,
                    writable: aw,
                    enumerable: ae,
                    configurable: ac,
                },
                Self::Data {
                    value: b,
                    writable: bw,
                    enumerable: be,
                    configurable: bc,
                },
            ) => a.same_value(b) && aw == bw && ae == be && ac == bc,
            (
                Self::Accessor {
                    get: ag,
                    set: aset,
                    enumerable: ae,
                    configurable: ac,
                },
                Self::Accessor {
                    get: bg,
                    set: bset,
                    enumerable: be,
                    configurable: bc,
                },
            ) => ag == bg && aset == bset && ae == be && ac == bc,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectError
// ---------------------------------------------------------------------------

/// Errors from object model operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    /// TypeError raised by an internal method.
    TypeError(String),
    /// Object not found in the heap.
    ObjectNotFound(ObjectHandle),
    /// Prototype chain cycle detected.
    PrototypeCycleDetected,
    /// Maximum prototype chain depth exceeded.
    PrototypeChainTooDeep { depth: u32, max: u32 },
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeError(msg) => write!(f, "TypeError: {msg}"),
            Self::ObjectNotFound(h) => write!(f, "object#{} not found", h.0),
            Self::PrototypeCycleDetected => write!(f, "TypeError: prototype chain cycle detected"),
            Self::PrototypeChainTooDeep { depth, max } => {
                write!(
                    f,
                    "TypeError: prototype chain depth {depth} exceeds max {max}"
                )
            }
        }
    }
}

impl std::error::Error for ObjectError {}

// ---------------------------------------------------------------------------
// Internal slots
// ---------------------------------------------------------------------------

/// Hashable projection of a value under SameValueZero, used as Map/Set key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionKey {
    Undefined,
    Null,
    Bool(bool),
    Number(u64),
    BigInt(i128),
    Str(String),
    Symbol(SymbolId),
    Object(ObjectHandle),
}

impl CollectionKey {
    pub fn from_value(value: &JsValue) -> Self {
        match value {
            JsValue::Undefined => Self::Undefined,
            JsValue::Null => Self::Null,
            JsValue::Bool(b) => Self::Bool(*b),
            JsValue::Number(n) => {
                let normalized = if n.is_nan() {
                    f64::NAN
                } else if *n == 0.0 {
                    0.0
                } else {
                    *n
                };
                Self::Number(normalized.to_bits())
            }
            JsValue::BigInt(n) => Self::BigInt(*n),
            JsValue::Str(s) => Self::Str(s.clone()),
            JsValue::Symbol(id) => Self::Symbol(*id),
            JsValue::Object(h) => Self::Object(*h),
        }
    }

    pub fn to_value(&self) -> JsValue {
        match self {
            Self::Undefined => JsValue::Undefined,
            Self::Null => JsValue::Null,
            Self::Bool(b) => JsValue::Bool(*b),
            Self::Number(bits) => JsValue::Number(f64::from_bits(*bits)),
            Self::BigInt(n) => JsValue::BigInt(*n),
            Self::Str(s) => JsValue::Str(s.clone()),
            Self::Symbol(id) => JsValue::Symbol(*id),
            Self::Object(h) => JsValue::Object(*h),
        }
    }
}

/// Settlement state of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(JsValue),
    Rejected(JsValue),
}

/// Backing store of an `ArrayBuffer`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArrayBufferData {
    pub bytes: Vec<u8>,
    /// `Some` for resizable buffers.
    pub max_byte_length: Option<usize>,
    pub detached: bool,
}

/// What a function object does when called.
#[derive(Debug, Clone)]
pub enum FunctionBehavior {
    /// Function declaration, function expression, arrow or method.
    Script {
        node: Rc<FunctionNode>,
        env: EnvironmentHandle,
        /// Object whose prototype `super.x` looks up from.
        home_object: Option<ObjectHandle>,
    },
    /// Class constructor.
    Class {
        node: Rc<ClassNode>,
        /// Class scope (holds the inner name binding).
        env: EnvironmentHandle,
        /// Instance fields, initialized on construction.
        fields: Vec<FieldInit>,
        derived: bool,
    },
    /// Built-in, optionally carrying a bound slot (e.g. a scope-table id).
    Native { id: NativeId, slot: Option<JsValue> },
}

/// Resolved instance field of a class.
#[derive(Debug, Clone)]
pub struct FieldInit {
    pub key: PropertyKey,
    /// Index into the class node's member list.
    pub member_index: usize,
}

/// Internal slots of a heap object.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    Ordinary,
    Array,
    Function(FunctionBehavior),
    Map(IndexMap<CollectionKey, JsValue>),
    Set(IndexSet<CollectionKey>),
    Date(f64),
    RegExp { source: String, flags: String },
    Error,
    PrimitiveWrapper(JsValue),
    ArrayBuffer(ArrayBufferData),
    Uint8Array {
        buffer: ObjectHandle,
        byte_offset: usize,
        length: usize,
    },
    Promise(PromiseState),
}

impl ObjectKind {
    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ordinary => "Object",
            Self::Array => "Array",
            Self::Function(_) => "Function",
            Self::Map(_) => "Map",
            Self::Set(_) => "Set",
            Self::Date(_) => "Date",
            Self::RegExp { .. } => "RegExp",
            Self::Error => "Error",
            Self::PrimitiveWrapper(_) => "Wrapper",
            Self::ArrayBuffer(_) => "ArrayBuffer",
            Self::Uint8Array { .. } => "Uint8Array",
            Self::Promise(_) => "Promise",
        }
    }
}

// ---------------------------------------------------------------------------
// HeapObject
// ---------------------------------------------------------------------------

/// Maximum prototype chain depth to prevent infinite loops.
pub const MAX_PROTOTYPE_CHAIN_DEPTH: u32 = 1024;

/// A heap object: prototype link, extensibility, descriptor table, slots.
#[derive(Debug, Clone)]
pub struct HeapObject {
    /// `[[Prototype]]` internal slot (None means end of chain).
    pub prototype: Option<ObjectHandle>,
    /// `[[Extensible]]` internal slot.
    pub extensible: bool,
    /// Own properties with descriptors, in insertion order.
    pub properties: IndexMap<PropertyKey, PropertyDescriptor>,
    pub kind: ObjectKind,
}

impl HeapObject {
    pub fn new(prototype: Option<ObjectHandle>, kind: ObjectKind) -> Self {
        Self {
            prototype,
            extensible: true,
            properties: IndexMap::new(),
            kind,
        }
    }

    pub fn get_own_property(&self, key: &PropertyKey) -> Option<&PropertyDescriptor> {
        self.properties.get(key)
    }

    pub fn has_own_property(&self, key: &PropertyKey) -> bool {
        self.properties.contains_key(key)
    }

    /// `[[DefineOwnProperty]](P, Desc)`: define or update a property.
    ///
    /// Returns `false` when rejected (non-configurable conflict or
    /// non-extensible target).  Arrays keep `length` in step with index keys.
    pub fn define_own_property(&mut self, key: PropertyKey, desc: PropertyDescriptor) -> bool {
        if let Some(current) = self.properties.get(&key) {
            if !current.is_configurable() {
                if desc.is_configurable() {
                    return false;
                }
                if desc.is_enumerable() != current.is_enumerable() {
                    return false;
                }
                if current.is_data() != desc.is_data() {
                    return false;
                }
                if let (
                    PropertyDescriptor::Data {
                        writable: current_w,
                        value: current_v,
                        ..
                    },
                    PropertyDescriptor::Data {
                        writable: new_w,
                        value: new_v,
                        ..
                    },
                ) = (current, &desc)
                    && !current_w
                    && (*new_w || !current_v.same_value(new_v))
                {
                    return false;
                }
                if let (
                    PropertyDescriptor::Accessor {
                        get: cur_get,
                        set: cur_set,
                        ..
                    },
                    PropertyDescriptor::Accessor {
                        get: new_get,
                        set: new_set,
                        ..
                    },
                ) = (current, &desc)
                    && (cur_get != new_get || cur_set != new_set)
                {
                    return false;
                }
            }
        } else if !self.extensible {
            return false;
        }

        if matches!(self.kind, ObjectKind::Array) {
            if let Some(index) = key.as_array_index() {
                let length = self.array_length();
                if index >= length && !self.set_array_length(index + 1) {
                    return false;
                }
            } else if key.as_str() == Some("length")
                && let Some(JsValue::Number(new_len)) = desc.value()
            {
                self.truncate_array(*new_len as u32);
            }
        }
        if let Some(slot) = self.properties.get_mut(&key) {
            *slot = desc;
        } else {
            self.properties.insert(key, desc);
        }
        true
    }

    /// Current `length` of an array object (0 for non-arrays).
    pub fn array_length(&self) -> u32 {
        match self
            .properties
            .get(&PropertyKey::from("length"))
            .and_then(PropertyDescriptor::value)
        {
            Some(JsValue::Number(n)) => *n as u32,
            _ => 0,
        }
    }

    fn set_array_length(&mut self, length: u32) -> bool {
        let key = PropertyKey::from("length");
        match self.properties.get_mut(&key) {
            Some(PropertyDescriptor::Data {
                value, writable, ..
            }) => {
                if !*writable {
                    return false;
                }
                *value = JsValue::Number(f64::from(length));
                true
            }
            _ => false,
        }
    }

    fn truncate_array(&mut self, new_len: u32) {
        self.properties
            .retain(|key, desc| match key.as_array_index() {
                Some(index) => index < new_len || !desc.is_configurable(),
                None => true,
            });
    }

    /// `[[Delete]](P)`: returns `false` if the property is non-configurable.
    pub fn delete(&mut self, key: &PropertyKey) -> bool {
        match self.properties.get(key) {
            Some(desc) if !desc.is_configurable() => false,
            Some(_) => {
                self.properties.shift_remove(key);
                true
            }
            None => true,
        }
    }

    /// `[[OwnPropertyKeys]]()`: integer indices ascending, then string keys
    /// in insertion order, then symbol keys in insertion order.
    pub fn own_property_keys(&self) -> Vec<PropertyKey> {
        let mut int_keys: Vec<(u32, PropertyKey)> = Vec::new();
        let mut str_keys: Vec<PropertyKey> = Vec::new();
        let mut sym_keys: Vec<PropertyKey> = Vec::new();

        for key in self.properties.keys() {
            match key {
                PropertyKey::String(_) => match key.as_array_index() {
                    Some(n) => int_keys.push((n, key.clone())),
                    None => str_keys.push(key.clone()),
                },
                PropertyKey::Symbol(_) => sym_keys.push(key.clone()),
            }
        }

        int_keys.sort_by_key(|(n, _)| *n);
        let mut result: Vec<PropertyKey> = int_keys.into_iter().map(|(_, k)| k).collect();
        result.extend(str_keys);
        result.extend(sym_keys);
        result
    }

    /// Own `(key, descriptor)` pairs in [`Self::own_property_keys`] order.
    pub fn own_property_entries(&self) -> Vec<(PropertyKey, PropertyDescriptor)> {
        self.own_property_keys()
            .into_iter()
            .filter_map(|key| {
                let desc = self.properties.get(&key)?.clone();
                Some((key, desc))
            })
            .collect()
    }

    pub fn freeze(&mut self) {
        self.extensible = false;
        for desc in self.properties.values_mut() {
            desc.set_non_configurable();
            desc.set_non_writable();
        }
    }

    pub fn seal(&mut self) {
        self.extensible = false;
        for desc in self.properties.values_mut() {
            desc.set_non_configurable();
        }
    }

    pub fn is_frozen(&self) -> bool {
        !self.extensible
            && self
                .properties
                .values()
                .all(|d| !d.is_configurable() && !d.is_writable())
    }

    pub fn is_sealed(&self) -> bool {
        !self.extensible && self.properties.values().all(|d| !d.is_configurable())
    }
}

// ---------------------------------------------------------------------------
// ObjectHeap: arena
// ---------------------------------------------------------------------------

/// Arena of heap objects addressed by [`ObjectHandle`].
#[derive(Debug, Clone, Default)]
pub struct ObjectHeap {
    objects: Vec<HeapObject>,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, prototype: Option<ObjectHandle>, kind: ObjectKind) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len() as u32);
        self.objects.push(HeapObject::new(prototype, kind));
        handle
    }

    pub fn get(&self, handle: ObjectHandle) -> Result<&HeapObject, ObjectError> {
        self.objects
            .get(handle.0 as usize)
            .ok_or(ObjectError::ObjectNotFound(handle))
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut HeapObject, ObjectError> {
        self.objects
            .get_mut(handle.0 as usize)
            .ok_or(ObjectError::ObjectNotFound(handle))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn kind(&self, handle: ObjectHandle) -> Result<&ObjectKind, ObjectError> {
        Ok(&self.get(handle)?.kind)
    }

    pub fn is_function(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_ok_and(|obj| obj.kind.is_function())
    }

    /// Find `key` on `handle` or its prototype chain, returning the holder
    /// and the descriptor found there.
    pub fn lookup_property(
        &self,
        handle: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<Option<(ObjectHandle, PropertyDescriptor)>, ObjectError> {
        let mut current = Some(handle);
        let mut depth = 0u32;
        while let Some(h) = current {
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(ObjectError::PrototypeChainTooDeep {
                    depth,
                    max: MAX_PROTOTYPE_CHAIN_DEPTH,
                });
            }
            let obj = self.get(h)?;
            if let Some(desc) = obj.get_own_property(key) {
                return Ok(Some((h, desc.clone())));
            }
            current = obj.prototype;
            depth += 1;
        }
        Ok(None)
    }

    pub fn get_prototype_of(&self, handle: ObjectHandle) -> Result<Option<ObjectHandle>, ObjectError> {
        Ok(self.get(handle)?.prototype)
    }

    /// `[[SetPrototypeOf]]` with cycle detection.  Returns `Ok(false)` when
    /// the object is non-extensible and the prototype would change.
    pub fn set_prototype_of(
        &mut self,
        handle: ObjectHandle,
        proto: Option<ObjectHandle>,
    ) -> Result<bool, ObjectError> {
        let obj = self.get(handle)?;
        if obj.prototype == proto {
            return Ok(true);
        }
        if !obj.extensible {
            return Ok(false);
        }
        let mut cursor = proto;
        let mut depth = 0u32;
        while let Some(p) = cursor {
            if p == handle {
                return Err(ObjectError::PrototypeCycleDetected);
            }
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(ObjectError::PrototypeChainTooDeep {
                    depth,
                    max: MAX_PROTOTYPE_CHAIN_DEPTH,
                });
            }
            cursor = self.get(p)?.prototype;
            depth += 1;
        }
        self.get_mut(handle)?.prototype = proto;
        Ok(true)
    }

    pub fn is_extensible(&self, handle: ObjectHandle) -> Result<bool, ObjectError> {
        Ok(self.get(handle)?.extensible)
    }

    pub fn prevent_extensions(&mut self, handle: ObjectHandle) -> Result<(), ObjectError> {
        self.get_mut(handle)?.extensible = false;
        Ok(())
    }

    pub fn define_property(
        &mut self,
        handle: ObjectHandle,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, ObjectError> {
        Ok(self.get_mut(handle)?.define_own_property(key, desc))
    }

    pub fn get_own_property_descriptor(
        &self,
        handle: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, ObjectError> {
        Ok(self.get(handle)?.get_own_property(key).cloned())
    }

    pub fn own_property_entries(
        &self,
        handle: ObjectHandle,
    ) -> Result<Vec<(PropertyKey, PropertyDescriptor)>, ObjectError> {
        Ok(self.get(handle)?.own_property_entries())
    }

    pub fn delete_property(&mut self, handle: ObjectHandle, key: &PropertyKey) -> Result<bool, ObjectError> {
        Ok(self.get_mut(handle)?.delete(key))
    }
}

// ---------------------------------------------------------------------------
// SymbolRegistry
// ---------------------------------------------------------------------------

/// Symbol table: descriptions plus the `Symbol.for` global registry.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    descriptions: Vec<Option<String>>,
    registry: IndexMap<String, SymbolId>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Symbol(description)`: always a fresh symbol.
    pub fn create(&mut self, description: Option<String>) -> SymbolId {
        let id = SymbolId(self.descriptions.len() as u32);
        self.descriptions.push(description);
        id
    }

    /// `Symbol.for(key)`: returns the shared symbol for `key`.
    pub fn symbol_for(&mut self, key: &str) -> SymbolId {
        if let Some(id) = self.registry.get(key) {
            return *id;
        }
        let id = self.create(Some(key.to_string()));
        self.registry.insert(key.to_string(), id);
        id
    }

    /// `Symbol.keyFor(sym)`.
    pub fn key_for(&self, sym: SymbolId) -> Option<&str> {
        self.registry
            .iter()
            .find(|(_, id)| **id == sym)
            .map(|(key, _)| key.as_str())
    }

    pub fn description(&self, sym: SymbolId) -> Option<&str> {
        self.descriptions
            .get(sym.0 as usize)
            .and_then(|d| d.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_index_is_canonical() {
        assert_eq!(PropertyKey::from("0").as_array_index(), Some(0));
        assert_eq!(PropertyKey::from("42").as_array_index(), Some(42));
        assert_eq!(PropertyKey::from("042").as_array_index(), None);
        assert_eq!(PropertyKey::from("-1").as_array_index(), None);
        assert_eq!(PropertyKey::from("x").as_array_index(), None);
    }

    #[test]
    fn same_value_distinguishes_zeroes_and_equates_nan() {
        let nan = JsValue::Number(f64::NAN);
        assert!(nan.same_value(&JsValue::Number(f64::NAN)));
        assert!(!nan.strict_equals(&JsValue::Number(f64::NAN)));
        assert!(!JsValue::Number(0.0).same_value(&JsValue::Number(-0.0)));
        assert!(JsValue::Number(0.0).same_value_zero(&JsValue::Number(-0.0)));
    }

    #[test]
    fn own_keys_order_integers_then_strings_then_symbols() {
        let mut obj = HeapObject::new(None, ObjectKind::Ordinary);
        obj.define_own_property(PropertyKey::Symbol(SymbolId(1)), PropertyDescriptor::data(JsValue::Null));
        obj.define_own_property("b".into(), PropertyDescriptor::data(JsValue::Null));
        obj.define_own_property("10".into(), PropertyDescriptor::data(JsValue::Null));
        obj.define_own_property("a".into(), PropertyDescriptor::data(JsValue::Null));
        obj.define_own_property("2".into(), PropertyDescriptor::data(JsValue::Null));
        let keys = obj.own_property_keys();
        assert_eq!(
            keys,
            vec![
                PropertyKey::from("2"),
                PropertyKey::from("10"),
                PropertyKey::from("b"),
                PropertyKey::from("a"),
                PropertyKey::Symbol(SymbolId(1)),
            ]
        );
    }

    #[test]
    fn non_configurable_non_writable_rejects_value_change() {
        let mut obj = HeapObject::new(None, ObjectKind::Ordinary);
        assert!(obj.define_own_property("x".into(), PropertyDescriptor::data_frozen(JsValue::Number(1.0))));
        assert!(!obj.define_own_property("x".into(), PropertyDescriptor::data_frozen(JsValue::Number(2.0))));
        assert!(obj.define_own_property("x".into(), PropertyDescriptor::data_frozen(JsValue::Number(1.0))));
        assert!(!obj.delete(&"x".into()));
    }

    #[test]
    fn array_length_tracks_indices() {
        let mut arr = HeapObject::new(None, ObjectKind::Array);
        arr.define_own_property(
            "length".into(),
            PropertyDescriptor::Data {
                value: JsValue::Number(0.0),
                writable: true,
                enumerable: false,
                configurable: false,
            },
        );
        arr.define_own_property("3".into(), PropertyDescriptor::data(JsValue::Bool(true)));
        assert_eq!(arr.array_length(), 4);
        arr.define_own_property(
            "length".into(),
            PropertyDescriptor::Data {
                value: JsValue::Number(1.0),
                writable: true,
                enumerable: false,
                configurable: false,
            },
        );
        assert!(!arr.has_own_property(&"3".into()));
    }

    #[test]
    fn prototype_cycle_is_rejected() {
        let mut heap = ObjectHeap::new();
        let a = heap.alloc(None, ObjectKind::Ordinary);
        let b = heap.alloc(Some(a), ObjectKind::Ordinary);
        assert_eq!(
            heap.set_prototype_of(a, Some(b)),
            Err(ObjectError::PrototypeCycleDetected)
        );
    }

    #[test]
    fn symbol_for_is_shared_and_keyed() {
        let mut symbols = SymbolRegistry::new();
        let local = symbols.create(Some("app".to_string()));
        let shared = symbols.symbol_for("app");
        assert_ne!(local, shared);
        assert_eq!(symbols.symbol_for("app"), shared);
        assert_eq!(symbols.key_for(shared), Some("app"));
        assert_eq!(symbols.key_for(local), None);
        assert_eq!(symbols.description(local), Some("app"));
    }

    #[test]
    fn number_formatting_matches_script_conventions() {
        assert_eq!(number_to_string(5.0), "5");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(1.5), "1.5");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }
}
