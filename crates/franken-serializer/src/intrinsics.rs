//! Built-in objects and native functions.
//!
//! Every native is a [`NativeId`] dispatched by [`Realm::call_native`].  The
//! global object carries the constructors, `Math`, `JSON`, `console` and the
//! `__SerializableJs` registration/verification API used by instrumented code.

use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::{IndexMap, IndexSet};

use crate::envelope::Envelope;
use crate::error::EngineResult;
use crate::object_model::{
    ArrayBufferData, CollectionKey, FunctionBehavior, JsValue, ObjectError, ObjectHandle,
    ObjectHeap, ObjectKind, PromiseState, PropertyDescriptor, PropertyKey, SymbolRegistry,
    number_to_string,
};
use crate::realm::Realm;
use crate::registry::{
    RegistrationRecord, ScopeSource, accessor_member_expression, member_expression,
};
use crate::serializer::SerializeOptions;

/// Name of the global object holding the runtime API.
pub const RUNTIME_GLOBAL: &str = "__SerializableJs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    TypeError,
    ReferenceError,
    RangeError,
    SyntaxError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        Self::Error,
        Self::TypeError,
        Self::ReferenceError,
        Self::RangeError,
        Self::SyntaxError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::ReferenceError => "ReferenceError",
            Self::RangeError => "RangeError",
            Self::SyntaxError => "SyntaxError",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeId {
    /// `Function.prototype` itself: accepts anything, returns `undefined`.
    Empty,

    ObjectConstructor,
    ObjectGetPrototypeOf,
    ObjectSetPrototypeOf,
    ObjectCreate,
    ObjectDefineProperty,
    ObjectGetOwnPropertyDescriptor,
    ObjectGetOwnPropertyNames,
    ObjectGetOwnPropertySymbols,
    ObjectKeys,
    ObjectEntries,
    ObjectPreventExtensions,
    ObjectIsExtensible,
    ObjectFreeze,
    ObjectIsFrozen,
    ObjectSeal,
    ObjectIsSealed,
    ObjectIs,
    ObjectHasOwnProperty,
    ObjectToString,
    ObjectValueOf,

    FunctionConstructor,
    FunctionCall,
    FunctionApply,
    FunctionToString,

    ArrayConstructor,
    ArrayIsArray,
    ArrayPush,
    ArrayPop,
    ArrayJoin,
    ArrayMap,
    ArrayForEach,
    ArrayIndexOf,
    ArrayIncludes,
    ArraySlice,
    ArrayToString,

    MapConstructor,
    MapGet,
    MapSet,
    MapHas,
    MapDelete,
    MapForEach,
    MapSize,

    SetConstructor,
    SetAdd,
    SetHas,
    SetDelete,
    SetForEach,
    SetValues,
    SetSize,

    SymbolConstructor,
    SymbolFor,
    SymbolKeyFor,
    SymbolDescription,
    SymbolToString,

    DateConstructor,
    DateNow,
    DateGetTime,

    RegExpConstructor,
    RegExpSource,
    RegExpFlags,

    ErrorConstructor(ErrorKind),
    ErrorToString,

    PromiseConstructor,
    PromiseResolve,
    PromiseReject,
    /// Resolve function handed to an executor; slot holds the promise.
    PromiseResolveFunction,
    PromiseRejectFunction,

    ArrayBufferConstructor,
    ArrayBufferByteLength,
    ArrayBufferMaxByteLength,
    ArrayBufferResizable,
    ArrayBufferDetached,
    ArrayBufferResize,
    ArrayBufferTransfer,

    Uint8ArrayConstructor,
    Uint8ArrayLength,
    Uint8ArrayBuffer,
    Uint8ArrayByteOffset,

    NumberConstructor,
    StringConstructor,
    BooleanConstructor,
    BigIntConstructor,
    PrimitiveValueOf,
    PrimitiveToString,

    MathFloor,
    MathAbs,
    MathMax,
    MathMin,

    JsonStringify,
    JsonParse,

    ConsoleLog,

    RegisterFunction,
    RegisterClass,
    RegisterAccessors,
    RegisterHostObject,
    EnsureSerializable,
    Serialize,
    Deserialize,
}

impl NativeId {
    pub fn is_constructor(self) -> bool {
        matches!(
            self,
            Self::ObjectConstructor
                | Self::FunctionConstructor
                | Self::ArrayConstructor
                | Self::MapConstructor
                | Self::SetConstructor
                | Self::DateConstructor
                | Self::RegExpConstructor
                | Self::ErrorConstructor(_)
                | Self::PromiseConstructor
                | Self::ArrayBufferConstructor
                | Self::Uint8ArrayConstructor
                | Self::NumberConstructor
                | Self::StringConstructor
                | Self::BooleanConstructor
        )
    }
}

/// Handles of the objects the runtime needs directly.
#[derive(Debug, Clone)]
pub struct Intrinsics {
    pub global_object: ObjectHandle,
    pub object_prototype: ObjectHandle,
    pub function_prototype: ObjectHandle,
    pub array_prototype: ObjectHandle,
    pub map_prototype: ObjectHandle,
    pub set_prototype: ObjectHandle,
    pub symbol_prototype: ObjectHandle,
    pub date_prototype: ObjectHandle,
    pub regexp_prototype: ObjectHandle,
    pub promise_prototype: ObjectHandle,
    pub array_buffer_prototype: ObjectHandle,
    pub uint8_array_prototype: ObjectHandle,
    pub number_prototype: ObjectHandle,
    pub string_prototype: ObjectHandle,
    pub boolean_prototype: ObjectHandle,
    pub bigint_prototype: ObjectHandle,
    error_prototypes: [ObjectHandle; 5],
}

impl Intrinsics {
    pub fn error_prototype_for(&self, kind: ErrorKind) -> ObjectHandle {
        let index = ErrorKind::ALL
            .iter()
            .position(|candidate| *candidate == kind)
            .unwrap_or(0);
        self.error_prototypes[index]
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

fn define(heap: &mut ObjectHeap, target: ObjectHandle, key: impl Into<PropertyKey>, desc: PropertyDescriptor) {
    if let Ok(object) = heap.get_mut(target) {
        object.define_own_property(key.into(), desc);
    }
}

/// Allocate a native function object with `length` and `name`.
pub(crate) fn alloc_native(
    heap: &mut ObjectHeap,
    function_prototype: ObjectHandle,
    id: NativeId,
    slot: Option<JsValue>,
    name: &str,
    length: u32,
) -> ObjectHandle {
    let function = heap.alloc(
        Some(function_prototype),
        ObjectKind::Function(FunctionBehavior::Native { id, slot }),
    );
    define(heap, function, "length", PropertyDescriptor::readonly_hidden(JsValue::Number(f64::from(length))));
    define(heap, function, "name", PropertyDescriptor::readonly_hidden(JsValue::str(name)));
    function
}

struct Builder<'a> {
    heap: &'a mut ObjectHeap,
    function_prototype: ObjectHandle,
    object_prototype: ObjectHandle,
}

impl Builder<'_> {
    fn object(&mut self) -> ObjectHandle {
        self.heap.alloc(Some(self.object_prototype), ObjectKind::Ordinary)
    }

    fn method(&mut self, target: ObjectHandle, name: &str, id: NativeId, length: u32) {
        let function = alloc_native(self.heap, self.function_prototype, id, None, name, length);
        define(self.heap, target, name, PropertyDescriptor::hidden(JsValue::Object(function)));
    }

    fn getter(&mut self, target: ObjectHandle, name: &str, id: NativeId) {
        let function = alloc_native(self.heap, self.function_prototype, id, None, &format!("get {name}"), 0);
        define(
            self.heap,
            target,
            name,
            PropertyDescriptor::Accessor {
                get: Some(function),
                set: None,
                enumerable: false,
                configurable: true,
            },
        );
    }

    /// Constructor wired to `prototype` in both directions.
    fn constructor(&mut self, name: &str, id: NativeId, length: u32, prototype: ObjectHandle) -> ObjectHandle {
        let function = alloc_native(self.heap, self.function_prototype, id, None, name, length);
        define(self.heap, function, "prototype", PropertyDescriptor::data_frozen(JsValue::Object(prototype)));
        define(self.heap, prototype, "constructor", PropertyDescriptor::hidden(JsValue::Object(function)));
        function
    }

    fn prototype(&mut self, kind: ObjectKind) -> ObjectHandle {
        self.heap.alloc(Some(self.object_prototype), kind)
    }
}

/// Build the built-in object graph into a fresh heap.
pub fn create_intrinsics(heap: &mut ObjectHeap, symbols: &mut SymbolRegistry) -> Intrinsics {
    let object_prototype = heap.alloc(None, ObjectKind::Ordinary);
    let function_prototype = heap.alloc(
        Some(object_prototype),
        ObjectKind::Function(FunctionBehavior::Native {
            id: NativeId::Empty,
            slot: None,
        }),
    );
    let mut b = Builder {
        heap,
        function_prototype,
        object_prototype,
    };
    let global = b.object();

    // Object
    let object_ctor = b.constructor("Object", NativeId::ObjectConstructor, 1, object_prototype);
    for (name, id, length) in [
        ("getPrototypeOf", NativeId::ObjectGetPrototypeOf, 1),
        ("setPrototypeOf", NativeId::ObjectSetPrototypeOf, 2),
        ("create", NativeId::ObjectCreate, 2),
        ("defineProperty", NativeId::ObjectDefineProperty, 3),
        ("getOwnPropertyDescriptor", NativeId::ObjectGetOwnPropertyDescriptor, 2),
        ("getOwnPropertyNames", NativeId::ObjectGetOwnPropertyNames, 1),
        ("getOwnPropertySymbols", NativeId::ObjectGetOwnPropertySymbols, 1),
        ("keys", NativeId::ObjectKeys, 1),
        ("entries", NativeId::ObjectEntries, 1),
        ("preventExtensions", NativeId::ObjectPreventExtensions, 1),
        ("isExtensible", NativeId::ObjectIsExtensible, 1),
        ("freeze", NativeId::ObjectFreeze, 1),
        ("isFrozen", NativeId::ObjectIsFrozen, 1),
        ("seal", NativeId::ObjectSeal, 1),
        ("isSealed", NativeId::ObjectIsSealed, 1),
        ("is", NativeId::ObjectIs, 2),
    ] {
        b.method(object_ctor, name, id, length);
    }
    b.method(object_prototype, "hasOwnProperty", NativeId::ObjectHasOwnProperty, 1);
    b.method(object_prototype, "toString", NativeId::ObjectToString, 0);
    b.method(object_prototype, "valueOf", NativeId::ObjectValueOf, 0);

    // Function
    let function_ctor = b.constructor("Function", NativeId::FunctionConstructor, 1, function_prototype);
    define(b.heap, function_prototype, "length", PropertyDescriptor::readonly_hidden(JsValue::Number(0.0)));
    define(b.heap, function_prototype, "name", PropertyDescriptor::readonly_hidden(JsValue::str("")));
    b.method(function_prototype, "call", NativeId::FunctionCall, 1);
    b.method(function_prototype, "apply", NativeId::FunctionApply, 2);
    b.method(function_prototype, "toString", NativeId::FunctionToString, 0);

    // Array
    let array_prototype = b.prototype(ObjectKind::Array);
    define(
        b.heap,
        array_prototype,
        "length",
        PropertyDescriptor::Data {
            value: JsValue::Number(0.0),
            writable: true,
            enumerable: false,
            configurable: false,
        },
    );
    let array_ctor = b.constructor("Array", NativeId::ArrayConstructor, 1, array_prototype);
    b.method(array_ctor, "isArray", NativeId::ArrayIsArray, 1);
    for (name, id, length) in [
        ("push", NativeId::ArrayPush, 1),
        ("pop", NativeId::ArrayPop, 0),
        ("join", NativeId::ArrayJoin, 1),
        ("map", NativeId::ArrayMap, 1),
        ("forEach", NativeId::ArrayForEach, 1),
        ("indexOf", NativeId::ArrayIndexOf, 1),
        ("includes", NativeId::ArrayIncludes, 1),
        ("slice", NativeId::ArraySlice, 2),
        ("toString", NativeId::ArrayToString, 0),
    ] {
        b.method(array_prototype, name, id, length);
    }

    // Map and Set
    let map_prototype = b.prototype(ObjectKind::Ordinary);
    let map_ctor = b.constructor("Map", NativeId::MapConstructor, 0, map_prototype);
    for (name, id, length) in [
        ("get", NativeId::MapGet, 1),
        ("set", NativeId::MapSet, 2),
        ("has", NativeId::MapHas, 1),
        ("delete", NativeId::MapDelete, 1),
        ("forEach", NativeId::MapForEach, 1),
    ] {
        b.method(map_prototype, name, id, length);
    }
    b.getter(map_prototype, "size", NativeId::MapSize);

    let set_prototype = b.prototype(ObjectKind::Ordinary);
    let set_ctor = b.constructor("Set", NativeId::SetConstructor, 0, set_prototype);
    for (name, id, length) in [
        ("add", NativeId::SetAdd, 1),
        ("has", NativeId::SetHas, 1),
        ("delete", NativeId::SetDelete, 1),
        ("forEach", NativeId::SetForEach, 1),
        ("values", NativeId::SetValues, 0),
    ] {
        b.method(set_prototype, name, id, length);
    }
    b.getter(set_prototype, "size", NativeId::SetSize);

    // Symbol
    let symbol_prototype = b.prototype(ObjectKind::Ordinary);
    let symbol_ctor = b.constructor("Symbol", NativeId::SymbolConstructor, 0, symbol_prototype);
    b.method(symbol_ctor, "for", NativeId::SymbolFor, 1);
    b.method(symbol_ctor, "keyFor", NativeId::SymbolKeyFor, 1);
    let iterator = symbols.create(Some("Symbol.iterator".to_string()));
    define(b.heap, symbol_ctor, "iterator", PropertyDescriptor::data_frozen(JsValue::Symbol(iterator)));
    b.getter(symbol_prototype, "description", NativeId::SymbolDescription);
    b.method(symbol_prototype, "toString", NativeId::SymbolToString, 0);

    // Date and RegExp
    let date_prototype = b.prototype(ObjectKind::Ordinary);
    let date_ctor = b.constructor("Date", NativeId::DateConstructor, 7, date_prototype);
    b.method(date_ctor, "now", NativeId::DateNow, 0);
    b.method(date_prototype, "getTime", NativeId::DateGetTime, 0);
    b.method(date_prototype, "valueOf", NativeId::DateGetTime, 0);

    let regexp_prototype = b.prototype(ObjectKind::Ordinary);
    let regexp_ctor = b.constructor("RegExp", NativeId::RegExpConstructor, 2, regexp_prototype);
    b.getter(regexp_prototype, "source", NativeId::RegExpSource);
    b.getter(regexp_prototype, "flags", NativeId::RegExpFlags);

    // Errors
    let error_prototype = b.prototype(ObjectKind::Ordinary);
    let mut error_prototypes = [error_prototype; 5];
    let mut error_ctors = Vec::new();
    let mut base_error_ctor = None;
    for (index, kind) in ErrorKind::ALL.into_iter().enumerate() {
        let prototype = if kind == ErrorKind::Error {
            error_prototype
        } else {
            b.heap.alloc(Some(error_prototype), ObjectKind::Ordinary)
        };
        error_prototypes[index] = prototype;
        let ctor = b.constructor(kind.name(), NativeId::ErrorConstructor(kind), 1, prototype);
        if let Some(base) = base_error_ctor {
            let _ = b.heap.set_prototype_of(ctor, Some(base));
        } else {
            base_error_ctor = Some(ctor);
        }
        define(b.heap, prototype, "name", PropertyDescriptor::hidden(JsValue::str(kind.name())));
        define(b.heap, prototype, "message", PropertyDescriptor::hidden(JsValue::str("")));
        error_ctors.push((kind.name(), ctor));
    }
    b.method(error_prototype, "toString", NativeId::ErrorToString, 0);

    // Promise
    let promise_prototype = b.prototype(ObjectKind::Ordinary);
    let promise_ctor = b.constructor("Promise", NativeId::PromiseConstructor, 1, promise_prototype);
    b.method(promise_ctor, "resolve", NativeId::PromiseResolve, 1);
    b.method(promise_ctor, "reject", NativeId::PromiseReject, 1);

    // Binary data
    let array_buffer_prototype = b.prototype(ObjectKind::Ordinary);
    let array_buffer_ctor = b.constructor("ArrayBuffer", NativeId::ArrayBufferConstructor, 1, array_buffer_prototype);
    b.getter(array_buffer_prototype, "byteLength", NativeId::ArrayBufferByteLength);
    b.getter(array_buffer_prototype, "maxByteLength", NativeId::ArrayBufferMaxByteLength);
    b.getter(array_buffer_prototype, "resizable", NativeId::ArrayBufferResizable);
    b.getter(array_buffer_prototype, "detached", NativeId::ArrayBufferDetached);
    b.method(array_buffer_prototype, "resize", NativeId::ArrayBufferResize, 1);
    b.method(array_buffer_prototype, "transfer", NativeId::ArrayBufferTransfer, 0);

    let uint8_array_prototype = b.prototype(ObjectKind::Ordinary);
    let uint8_array_ctor = b.constructor("Uint8Array", NativeId::Uint8ArrayConstructor, 3, uint8_array_prototype);
    b.getter(uint8_array_prototype, "length", NativeId::Uint8ArrayLength);
    b.getter(uint8_array_prototype, "buffer", NativeId::Uint8ArrayBuffer);
    b.getter(uint8_array_prototype, "byteOffset", NativeId::Uint8ArrayByteOffset);

    // Primitive wrappers
    let number_prototype = b.prototype(ObjectKind::PrimitiveWrapper(JsValue::Number(0.0)));
    let string_prototype = b.prototype(ObjectKind::PrimitiveWrapper(JsValue::str("")));
    let boolean_prototype = b.prototype(ObjectKind::PrimitiveWrapper(JsValue::Bool(false)));
    let bigint_prototype = b.prototype(ObjectKind::Ordinary);
    let number_ctor = b.constructor("Number", NativeId::NumberConstructor, 1, number_prototype);
    let string_ctor = b.constructor("String", NativeId::StringConstructor, 1, string_prototype);
    let boolean_ctor = b.constructor("Boolean", NativeId::BooleanConstructor, 1, boolean_prototype);
    let bigint_ctor = b.constructor("BigInt", NativeId::BigIntConstructor, 1, bigint_prototype);
    for prototype in [number_prototype, string_prototype, boolean_prototype, bigint_prototype] {
        b.method(prototype, "valueOf", NativeId::PrimitiveValueOf, 0);
        b.method(prototype, "toString", NativeId::PrimitiveToString, 0);
    }

    // Namespaces
    let math = b.object();
    for (name, id) in [
        ("floor", NativeId::MathFloor),
        ("abs", NativeId::MathAbs),
        ("max", NativeId::MathMax),
        ("min", NativeId::MathMin),
    ] {
        b.method(math, name, id, if matches!(id, NativeId::MathMax | NativeId::MathMin) { 2 } else { 1 });
    }
    let json = b.object();
    b.method(json, "stringify", NativeId::JsonStringify, 3);
    b.method(json, "parse", NativeId::JsonParse, 2);
    let console = b.object();
    b.method(console, "log", NativeId::ConsoleLog, 0);

    let runtime = b.object();
    for (name, id, length) in [
        ("registerFunction", NativeId::RegisterFunction, 2),
        ("registerClass", NativeId::RegisterClass, 2),
        ("registerAccessors", NativeId::RegisterAccessors, 2),
        ("registerHostObject", NativeId::RegisterHostObject, 2),
        ("ensureSerializable", NativeId::EnsureSerializable, 1),
        ("serialize", NativeId::Serialize, 2),
        ("deserialize", NativeId::Deserialize, 1),
    ] {
        b.method(runtime, name, id, length);
    }

    // Global object
    let mut globals = vec![
        ("Object", object_ctor),
        ("Function", function_ctor),
        ("Array", array_ctor),
        ("Map", map_ctor),
        ("Set", set_ctor),
        ("Symbol", symbol_ctor),
        ("Date", date_ctor),
        ("RegExp", regexp_ctor),
    ];
    globals.extend(error_ctors);
    globals.extend([
        ("Promise", promise_ctor),
        ("ArrayBuffer", array_buffer_ctor),
        ("Uint8Array", uint8_array_ctor),
        ("Number", number_ctor),
        ("String", string_ctor),
        ("Boolean", boolean_ctor),
        ("BigInt", bigint_ctor),
        ("Math", math),
        ("JSON", json),
        ("console", console),
        ("globalThis", global),
        (RUNTIME_GLOBAL, runtime),
    ]);
    for (name, value) in globals {
        define(b.heap, global, name, PropertyDescriptor::hidden(JsValue::Object(value)));
    }
    define(b.heap, global, "undefined", PropertyDescriptor::data_frozen(JsValue::Undefined));
    define(b.heap, global, "NaN", PropertyDescriptor::data_frozen(JsValue::Number(f64::NAN)));
    define(b.heap, global, "Infinity", PropertyDescriptor::data_frozen(JsValue::Number(f64::INFINITY)));

    Intrinsics {
        global_object: global,
        object_prototype,
        function_prototype,
        array_prototype,
        map_prototype,
        set_prototype,
        symbol_prototype,
        date_prototype,
        regexp_prototype,
        promise_prototype,
        array_buffer_prototype,
        uint8_array_prototype,
        number_prototype,
        string_prototype,
        boolean_prototype,
        bigint_prototype,
        error_prototypes,
    }
}

fn arg(args: &[JsValue], index: usize) -> JsValue {
    args.get(index).cloned().unwrap_or(JsValue::Undefined)
}

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_millis() as f64)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl Realm {
    pub(crate) fn create_native(&mut self, id: NativeId, slot: Option<JsValue>, name: &str, length: u32) -> ObjectHandle {
        let prototype = self.intrinsics.function_prototype;
        alloc_native(&mut self.heap, prototype, id, slot, name, length)
    }

    pub(crate) fn call_native(
        &mut self,
        id: NativeId,
        slot: Option<JsValue>,
        this: JsValue,
        args: Vec<JsValue>,
        new_target: Option<ObjectHandle>,
    ) -> EngineResult<JsValue> {
        match id {
            NativeId::Empty => Ok(JsValue::Undefined),

            NativeId::ObjectConstructor
            | NativeId::ObjectGetPrototypeOf
            | NativeId::ObjectSetPrototypeOf
            | NativeId::ObjectCreate
            | NativeId::ObjectDefineProperty
            | NativeId::ObjectGetOwnPropertyDescriptor
            | NativeId::ObjectGetOwnPropertyNames
            | NativeId::ObjectGetOwnPropertySymbols
            | NativeId::ObjectKeys
            | NativeId::ObjectEntries
            | NativeId::ObjectPreventExtensions
            | NativeId::ObjectIsExtensible
            | NativeId::ObjectFreeze
            | NativeId::ObjectIsFrozen
            | NativeId::ObjectSeal
            | NativeId::ObjectIsSealed
            | NativeId::ObjectIs
            | NativeId::ObjectHasOwnProperty
            | NativeId::ObjectToString
            | NativeId::ObjectValueOf => self.object_native(id, this, &args),

            NativeId::FunctionConstructor => {
                Err(self.throw_error(ErrorKind::Error, "Function constructor is not supported"))
            }
            NativeId::FunctionCall => {
                let receiver = arg(&args, 0);
                let rest = args.into_iter().skip(1).collect();
                self.call(&this, receiver, rest)
            }
            NativeId::FunctionApply => {
                let receiver = arg(&args, 0);
                let list = match arg(&args, 1) {
                    JsValue::Undefined | JsValue::Null => Vec::new(),
                    JsValue::Object(handle) => self.array_items(handle)?,
                    _ => return Err(self.type_error("CreateListFromArrayLike called on non-object")),
                };
                self.call(&this, receiver, list)
            }
            NativeId::FunctionToString => self.function_to_string(&this),

            NativeId::ArrayConstructor
            | NativeId::ArrayIsArray
            | NativeId::ArrayPush
            | NativeId::ArrayPop
            | NativeId::ArrayJoin
            | NativeId::ArrayMap
            | NativeId::ArrayForEach
            | NativeId::ArrayIndexOf
            | NativeId::ArrayIncludes
            | NativeId::ArraySlice
            | NativeId::ArrayToString => self.array_native(id, this, args),

            NativeId::MapConstructor
            | NativeId::MapGet
            | NativeId::MapSet
            | NativeId::MapHas
            | NativeId::MapDelete
            | NativeId::MapForEach
            | NativeId::MapSize
            | NativeId::SetConstructor
            | NativeId::SetAdd
            | NativeId::SetHas
            | NativeId::SetDelete
            | NativeId::SetForEach
            | NativeId::SetValues
            | NativeId::SetSize => self.collection_native(id, this, &args, new_target),

            NativeId::SymbolConstructor => {
                if new_target.is_some() {
                    return Err(self.type_error("Symbol is not a constructor"));
                }
                let description = match arg(&args, 0) {
                    JsValue::Undefined => None,
                    value => Some(self.to_js_string(&value)?),
                };
                Ok(JsValue::Symbol(self.symbols.create(description)))
            }
            NativeId::SymbolFor => {
                let key = self.to_js_string(&arg(&args, 0))?;
                Ok(JsValue::Symbol(self.symbols.symbol_for(&key)))
            }
            NativeId::SymbolKeyFor => match arg(&args, 0) {
                JsValue::Symbol(id) => Ok(self
                    .symbols
                    .key_for(id)
                    .map_or(JsValue::Undefined, JsValue::str)),
                other => Err(self.type_error(format!("{} is not a symbol", self.display_value(&other)))),
            },
            NativeId::SymbolDescription | NativeId::SymbolToString => {
                let symbol = match &this {
                    JsValue::Symbol(id) => Some(*id),
                    JsValue::Object(handle) => match self.heap.kind(*handle)? {
                        ObjectKind::PrimitiveWrapper(JsValue::Symbol(id)) => Some(*id),
                        _ => None,
                    },
                    _ => None,
                };
                let Some(symbol) = symbol else {
                    return Err(self.type_error("Symbol.prototype method called on incompatible receiver"));
                };
                let description = self.symbols.description(symbol).map(str::to_string);
                if id == NativeId::SymbolDescription {
                    return Ok(description.map_or(JsValue::Undefined, JsValue::Str));
                }
                Ok(JsValue::Str(format!("Symbol({})", description.unwrap_or_default())))
            }

            NativeId::DateConstructor => {
                let ms = match args.first() {
                    None => now_ms(),
                    Some(value) => {
                        let ms = self.to_number(value)?;
                        if ms.is_finite() { ms.trunc() } else { f64::NAN }
                    }
                };
                let Some(target) = new_target else {
                    return Ok(JsValue::Str(format!("Date({})", number_to_string(now_ms()))));
                };
                let fallback = self.intrinsics.date_prototype;
                let prototype = self.prototype_from_constructor(Some(target), fallback)?;
                Ok(JsValue::Object(self.heap.alloc(Some(prototype), ObjectKind::Date(ms))))
            }
            NativeId::DateNow => Ok(JsValue::Number(now_ms())),
            NativeId::DateGetTime => match this.as_object().map(|h| self.heap.kind(h)).transpose()? {
                Some(ObjectKind::Date(ms)) => Ok(JsValue::Number(*ms)),
                _ => Err(self.type_error("this is not a Date object.")),
            },

            NativeId::RegExpConstructor => {
                let (source, flags) = match arg(&args, 0) {
                    JsValue::Object(handle) => match self.heap.kind(handle)?.clone() {
                        ObjectKind::RegExp { source, flags } => (source, flags),
                        _ => (self.to_js_string(&JsValue::Object(handle))?, String::new()),
                    },
                    JsValue::Undefined => ("(?:)".to_string(), String::new()),
                    other => (self.to_js_string(&other)?, String::new()),
                };
                let flags = match arg(&args, 1) {
                    JsValue::Undefined => flags,
                    value => self.to_js_string(&value)?,
                };
                let fallback = self.intrinsics.regexp_prototype;
                let prototype = self.prototype_from_constructor(new_target, fallback)?;
                Ok(JsValue::Object(
                    self.heap.alloc(Some(prototype), ObjectKind::RegExp { source, flags }),
                ))
            }
            NativeId::RegExpSource | NativeId::RegExpFlags => {
                match this.as_object().map(|h| self.heap.kind(h)).transpose()? {
                    Some(ObjectKind::RegExp { source, flags }) => Ok(JsValue::str(if id == NativeId::RegExpSource {
                        source.clone()
                    } else {
                        flags.clone()
                    })),
                    _ => Err(self.type_error("RegExp.prototype getter called on incompatible receiver")),
                }
            }

            NativeId::ErrorConstructor(kind) => {
                let fallback = self.intrinsics.error_prototype_for(kind);
                let prototype = self.prototype_from_constructor(new_target, fallback)?;
                let error = self.heap.alloc(Some(prototype), ObjectKind::Error);
                let message = match arg(&args, 0) {
                    JsValue::Undefined => None,
                    value => Some(self.to_js_string(&value)?),
                };
                if let Some(message) = &message {
                    self.define_or_throw(error, PropertyKey::from("message"), PropertyDescriptor::hidden(JsValue::str(message)))?;
                }
                let stack = match &message {
                    Some(message) if !message.is_empty() => format!("{}: {message}\n    at <script>", kind.name()),
                    _ => format!("{}\n    at <script>", kind.name()),
                };
                self.define_or_throw(error, PropertyKey::from("stack"), PropertyDescriptor::hidden(JsValue::Str(stack)))?;
                Ok(JsValue::Object(error))
            }
            NativeId::ErrorToString => {
                if !this.is_object() {
                    return Err(self.type_error("Error.prototype.toString called on non-object"));
                }
                let name = match self.get_property(&this, &PropertyKey::from("name"))? {
                    JsValue::Undefined => "Error".to_string(),
                    value => self.to_js_string(&value)?,
                };
                let message = match self.get_property(&this, &PropertyKey::from("message"))? {
                    JsValue::Undefined => String::new(),
                    value => self.to_js_string(&value)?,
                };
                Ok(JsValue::Str(match (name.is_empty(), message.is_empty()) {
                    (_, true) => name,
                    (true, false) => message,
                    (false, false) => format!("{name}: {message}"),
                }))
            }

            NativeId::PromiseConstructor
            | NativeId::PromiseResolve
            | NativeId::PromiseReject
            | NativeId::PromiseResolveFunction
            | NativeId::PromiseRejectFunction => self.promise_native(id, slot, &args, new_target),

            NativeId::ArrayBufferConstructor
            | NativeId::ArrayBufferByteLength
            | NativeId::ArrayBufferMaxByteLength
            | NativeId::ArrayBufferResizable
            | NativeId::ArrayBufferDetached
            | NativeId::ArrayBufferResize
            | NativeId::ArrayBufferTransfer
            | NativeId::Uint8ArrayConstructor
            | NativeId::Uint8ArrayLength
            | NativeId::Uint8ArrayBuffer
            | NativeId::Uint8ArrayByteOffset => self.binary_native(id, this, &args, new_target),

            NativeId::NumberConstructor
            | NativeId::StringConstructor
            | NativeId::BooleanConstructor
            | NativeId::BigIntConstructor
            | NativeId::PrimitiveValueOf
            | NativeId::PrimitiveToString => self.primitive_native(id, this, &args, new_target),

            NativeId::MathFloor => Ok(JsValue::Number(self.to_number(&arg(&args, 0))?.floor())),
            NativeId::MathAbs => Ok(JsValue::Number(self.to_number(&arg(&args, 0))?.abs())),
            NativeId::MathMax | NativeId::MathMin => {
                let max = id == NativeId::MathMax;
                let mut result = if max { f64::NEG_INFINITY } else { f64::INFINITY };
                for value in &args {
                    let n = self.to_number(value)?;
                    if n.is_nan() || result.is_nan() {
                        result = f64::NAN;
                    } else if (max && n > result) || (!max && n < result) {
                        result = n;
                    }
                }
                Ok(JsValue::Number(result))
            }

            NativeId::JsonStringify => {
                let mut seen = Vec::new();
                let Some(json) = self.js_to_json(&arg(&args, 0), &mut seen)? else {
                    return Ok(JsValue::Undefined);
                };
                let indent = matches!(arg(&args, 2), JsValue::Number(n) if n > 0.0)
                    || matches!(arg(&args, 2), JsValue::Str(ref s) if !s.is_empty());
                let text = if indent {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                };
                text.map(JsValue::Str)
                    .map_err(|error| self.type_error(error.to_string()))
            }
            NativeId::JsonParse => {
                let text = self.to_js_string(&arg(&args, 0))?;
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(json) => self.json_to_js(&json),
                    Err(error) => Err(self.syntax_error(format!("Unexpected token in JSON: {error}"))),
                }
            }

            NativeId::ConsoleLog => {
                let line = args
                    .iter()
                    .map(|value| self.display_value(value))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.console.push(line);
                Ok(JsValue::Undefined)
            }

            NativeId::RegisterFunction
            | NativeId::RegisterClass
            | NativeId::RegisterAccessors
            | NativeId::RegisterHostObject
            | NativeId::EnsureSerializable
            | NativeId::Serialize
            | NativeId::Deserialize => self.runtime_native(id, &args),
        }
    }

    // -----------------------------------------------------------------------
    // Object
    // -----------------------------------------------------------------------

    fn object_native(&mut self, id: NativeId, this: JsValue, args: &[JsValue]) -> EngineResult<JsValue> {
        let first = arg(args, 0);
        match id {
            NativeId::ObjectConstructor => match first {
                JsValue::Undefined | JsValue::Null => Ok(JsValue::Object(self.create_object())),
                value => Ok(JsValue::Object(self.to_object(&value)?)),
            },
            NativeId::ObjectGetPrototypeOf => {
                let object = self.to_object(&first)?;
                Ok(self
                    .heap
                    .get_prototype_of(object)?
                    .map_or(JsValue::Null, JsValue::Object))
            }
            NativeId::ObjectSetPrototypeOf => {
                let prototype = match arg(args, 1) {
                    JsValue::Object(handle) => Some(handle),
                    JsValue::Null => None,
                    other => {
                        return Err(self.type_error(format!(
                            "Object prototype may only be an Object or null: {}",
                            self.display_value(&other)
                        )));
                    }
                };
                let JsValue::Object(target) = first else {
                    return Ok(first);
                };
                match self.heap.set_prototype_of(target, prototype) {
                    Ok(true) => Ok(first),
                    Ok(false) => Err(self.type_error("#<Object> is not extensible")),
                    Err(ObjectError::PrototypeCycleDetected) => Err(self.type_error("Cyclic __proto__ value")),
                    Err(error) => Err(error.into()),
                }
            }
            NativeId::ObjectCreate => {
                let prototype = match first {
                    JsValue::Object(handle) => Some(handle),
                    JsValue::Null => None,
                    other => {
                        return Err(self.type_error(format!(
                            "Object prototype may only be an Object or null: {}",
                            self.display_value(&other)
                        )));
                    }
                };
                let object = self.heap.alloc(prototype, ObjectKind::Ordinary);
                if let JsValue::Object(properties) = arg(args, 1) {
                    for (key, desc) in self.heap.own_property_entries(properties)? {
                        if !desc.is_enumerable() {
                            continue;
                        }
                        let descriptor = self.get_from(properties, &key, &JsValue::Object(properties))?;
                        let desc = self.to_property_descriptor(&descriptor, None)?;
                        self.define_or_throw(object, key, desc)?;
                    }
                }
                Ok(JsValue::Object(object))
            }
            NativeId::ObjectDefineProperty => {
                let JsValue::Object(target) = first else {
                    return Err(self.type_error("Object.defineProperty called on non-object"));
                };
                let key = self.to_property_key(&arg(args, 1))?;
                let existing = self.heap.get_own_property_descriptor(target, &key)?;
                let desc = self.to_property_descriptor(&arg(args, 2), existing)?;
                self.define_or_throw(target, key, desc)?;
                Ok(first)
            }
            NativeId::ObjectGetOwnPropertyDescriptor => {
                let object = self.to_object(&first)?;
                let key = self.to_property_key(&arg(args, 1))?;
                match self.own_descriptor(object, &key)? {
                    Some(desc) => self.from_property_descriptor(&desc),
                    None => Ok(JsValue::Undefined),
                }
            }
            NativeId::ObjectGetOwnPropertyNames | NativeId::ObjectKeys | NativeId::ObjectEntries => {
                let object = self.to_object(&first)?;
                let only_enumerable = id != NativeId::ObjectGetOwnPropertyNames;
                let keys: Vec<PropertyKey> = self
                    .own_keys(object)?
                    .into_iter()
                    .filter(|(key, desc)| {
                        matches!(key, PropertyKey::String(_)) && (!only_enumerable || desc.is_enumerable())
                    })
                    .map(|(key, _)| key)
                    .collect();
                let mut items = Vec::with_capacity(keys.len());
                for key in keys {
                    let name = JsValue::str(self.key_display(&key));
                    if id == NativeId::ObjectEntries {
                        let value = self.get_from(object, &key, &JsValue::Object(object))?;
                        items.push(JsValue::Object(self.create_array(vec![name, value])?));
                    } else {
                        items.push(name);
                    }
                }
                Ok(JsValue::Object(self.create_array(items)?))
            }
            NativeId::ObjectGetOwnPropertySymbols => {
                let object = self.to_object(&first)?;
                let symbols = self
                    .heap
                    .get(object)?
                    .own_property_keys()
                    .into_iter()
                    .filter_map(|key| match key {
                        PropertyKey::Symbol(id) => Some(JsValue::Symbol(id)),
                        PropertyKey::String(_) => None,
                    })
                    .collect();
                Ok(JsValue::Object(self.create_array(symbols)?))
            }
            NativeId::ObjectPreventExtensions => {
                if let JsValue::Object(target) = first {
                    self.heap.prevent_extensions(target)?;
                }
                Ok(first)
            }
            NativeId::ObjectIsExtensible => Ok(JsValue::Bool(match first {
                JsValue::Object(target) => self.heap.is_extensible(target)?,
                _ => false,
            })),
            NativeId::ObjectFreeze | NativeId::ObjectSeal => {
                if let JsValue::Object(target) = first {
                    if let ObjectKind::Uint8Array { length, .. } = self.heap.kind(target)?
                        && *length > 0
                    {
                        return Err(self.type_error("Cannot freeze array buffer views with elements"));
                    }
                    let object = self.heap.get_mut(target)?;
                    if id == NativeId::ObjectFreeze {
                        object.freeze();
                    } else {
                        object.seal();
                    }
                }
                Ok(first)
            }
            NativeId::ObjectIsFrozen | NativeId::ObjectIsSealed => Ok(JsValue::Bool(match first {
                JsValue::Object(target) => {
                    let object = self.heap.get(target)?;
                    if id == NativeId::ObjectIsFrozen { object.is_frozen() } else { object.is_sealed() }
                }
                _ => true,
            })),
            NativeId::ObjectIs => Ok(JsValue::Bool(first.same_value(&arg(args, 1)))),
            NativeId::ObjectHasOwnProperty => {
                let key = self.to_property_key(&first)?;
                let object = self.to_object(&this)?;
                Ok(JsValue::Bool(self.own_descriptor(object, &key)?.is_some()))
            }
            NativeId::ObjectToString => {
                let tag = match &this {
                    JsValue::Undefined => "Undefined",
                    JsValue::Null => "Null",
                    value => {
                        let object = self.to_object(value)?;
                        match self.heap.kind(object)? {
                            ObjectKind::Array => "Array",
                            ObjectKind::Function(_) => "Function",
                            ObjectKind::Error => "Error",
                            ObjectKind::Date(_) => "Date",
                            ObjectKind::RegExp { .. } => "RegExp",
                            ObjectKind::PrimitiveWrapper(JsValue::Number(_)) => "Number",
                            ObjectKind::PrimitiveWrapper(JsValue::Str(_)) => "String",
                            ObjectKind::PrimitiveWrapper(JsValue::Bool(_)) => "Boolean",
                            other => other.label(),
                        }
                    }
                };
                Ok(JsValue::Str(format!("[object {tag}]")))
            }
            _ => Ok(JsValue::Object(self.to_object(&this)?)),
        }
    }

    /// Own descriptor including the virtual element properties of `Uint8Array`.
    pub(crate) fn own_descriptor(&mut self, object: ObjectHandle, key: &PropertyKey) -> EngineResult<Option<PropertyDescriptor>> {
        if let Some(index) = key.as_array_index()
            && let ObjectKind::Uint8Array { length, .. } = self.heap.kind(object)?
        {
            if index as usize >= *length {
                return Ok(None);
            }
            let value = self.get_from(object, key, &JsValue::Object(object))?;
            return Ok(Some(PropertyDescriptor::data(value)));
        }
        Ok(self.heap.get_own_property_descriptor(object, key)?)
    }

    /// Own `(key, descriptor)` pairs, element properties of typed arrays first.
    pub(crate) fn own_keys(&mut self, object: ObjectHandle) -> EngineResult<Vec<(PropertyKey, PropertyDescriptor)>> {
        let mut entries = Vec::new();
        if let ObjectKind::Uint8Array { length, .. } = self.heap.kind(object)? {
            for index in 0..*length {
                entries.push((PropertyKey::String(index.to_string()), PropertyDescriptor::data(JsValue::Undefined)));
            }
        }
        entries.extend(self.heap.own_property_entries(object)?);
        Ok(entries)
    }

    /// `ToPropertyDescriptor`, completing absent fields from `existing`.
    fn to_property_descriptor(
        &mut self,
        value: &JsValue,
        existing: Option<PropertyDescriptor>,
    ) -> EngineResult<PropertyDescriptor> {
        let JsValue::Object(object) = value else {
            return Err(self.type_error(format!(
                "Property description must be an object: {}",
                self.display_value(value)
            )));
        };
        let field = |realm: &mut Realm, name: &str| -> EngineResult<Option<JsValue>> {
            let key = PropertyKey::from(name);
            if realm.has_property(*object, &key)? {
                Ok(Some(realm.get_from(*object, &key, value)?))
            } else {
                Ok(None)
            }
        };
        let get = field(self, "get")?;
        let set = field(self, "set")?;
        let data_value = field(self, "value")?;
        let writable = field(self, "writable")?;
        let enumerable = field(self, "enumerable")?.map(|v| self.to_boolean(&v));
        let configurable = field(self, "configurable")?.map(|v| self.to_boolean(&v));

        let existing_enumerable = existing.as_ref().is_some_and(PropertyDescriptor::is_enumerable);
        let existing_configurable = existing.as_ref().is_some_and(PropertyDescriptor::is_configurable);
        let enumerable = enumerable.unwrap_or(existing_enumerable);
        let configurable = configurable.unwrap_or(existing_configurable);

        if get.is_some() || set.is_some() {
            if data_value.is_some() || writable.is_some() {
                return Err(self.type_error(
                    "Invalid property descriptor. Cannot both specify accessors and a value or writable attribute",
                ));
            }
            let (existing_get, existing_set) = match &existing {
                Some(PropertyDescriptor::Accessor { get, set, .. }) => (*get, *set),
                _ => (None, None),
            };
            let get = match get {
                Some(value) => self.accessor_half(&value, "Getter")?,
                None => existing_get,
            };
            let set = match set {
                Some(value) => self.accessor_half(&value, "Setter")?,
                None => existing_set,
            };
            return Ok(PropertyDescriptor::Accessor {
                get,
                set,
                enumerable,
                configurable,
            });
        }
        let (existing_value, existing_writable) = match &existing {
            Some(PropertyDescriptor::Data { value, writable, .. }) => (value.clone(), *writable),
            _ => (JsValue::Undefined, false),
        };
        Ok(PropertyDescriptor::Data {
            value: data_value.unwrap_or(existing_value),
            writable: writable.map_or(existing_writable, |v| self.to_boolean(&v)),
            enumerable,
            configurable,
        })
    }

    fn accessor_half(&mut self, value: &JsValue, label: &str) -> EngineResult<Option<ObjectHandle>> {
        match value {
            JsValue::Undefined => Ok(None),
            JsValue::Object(handle) if self.heap.is_function(*handle) => Ok(Some(*handle)),
            other => Err(self.type_error(format!(
                "{label} must be a function: {}",
                self.display_value(other)
            ))),
        }
    }

    fn from_property_descriptor(&mut self, desc: &PropertyDescriptor) -> EngineResult<JsValue> {
        let object = self.create_object();
        let fields = match desc {
            PropertyDescriptor::Data {
                value,
                writable,
                enumerable,
                configurable,
            } => vec![
                ("value", value.clone()),
                ("writable", JsValue::Bool(*writable)),
                ("enumerable", JsValue::Bool(*enumerable)),
                ("configurable", JsValue::Bool(*configurable)),
            ],
            PropertyDescriptor::Accessor {
                get,
                set,
                enumerable,
                configurable,
            } => vec![
                ("get", get.map_or(JsValue::Undefined, JsValue::Object)),
                ("set", set.map_or(JsValue::Undefined, JsValue::Object)),
                ("enumerable", JsValue::Bool(*enumerable)),
                ("configurable", JsValue::Bool(*configurable)),
            ],
        };
        for (name, value) in fields {
            self.create_data_property(object, PropertyKey::from(name), value)?;
        }
        Ok(JsValue::Object(object))
    }

    fn function_to_string(&mut self, this: &JsValue) -> EngineResult<JsValue> {
        let Some(function) = this.as_object().filter(|h| self.heap.is_function(*h)) else {
            return Err(self.type_error("Function.prototype.toString requires that 'this' be a Function"));
        };
        if let Some(RegistrationRecord::Syntactic { source_text, .. }) = self.registry.get(function) {
            return Ok(JsValue::Str(source_text.clone()));
        }
        let name = self.function_name(function);
        Ok(JsValue::Str(format!("function {name}() {{ [native code] }}")))
    }

    // -----------------------------------------------------------------------
    // Array
    // -----------------------------------------------------------------------

    fn array_native(&mut self, id: NativeId, this: JsValue, args: Vec<JsValue>) -> EngineResult<JsValue> {
        match id {
            NativeId::ArrayConstructor => {
                if let [JsValue::Number(n)] = args.as_slice() {
                    let length = *n;
                    if length < 0.0 || length.fract() != 0.0 || length > f64::from(u32::MAX - 1) {
                        return Err(self.range_error("Invalid array length"));
                    }
                    let array = self.create_array(Vec::new())?;
                    self.set_property(&JsValue::Object(array), PropertyKey::from("length"), JsValue::Number(length))?;
                    return Ok(JsValue::Object(array));
                }
                Ok(JsValue::Object(self.create_array(args)?))
            }
            NativeId::ArrayIsArray => Ok(JsValue::Bool(match arg(&args, 0) {
                JsValue::Object(handle) => matches!(self.heap.kind(handle)?, ObjectKind::Array),
                _ => false,
            })),
            NativeId::ArrayPush => {
                let object = self.to_object(&this)?;
                let mut length = self.array_items(object)?.len();
                for value in args {
                    self.set_property(&this, PropertyKey::String(length.to_string()), value)?;
                    length += 1;
                }
                let length = JsValue::Number(length as f64);
                self.set_property(&this, PropertyKey::from("length"), length.clone())?;
                Ok(length)
            }
            NativeId::ArrayPop => {
                let object = self.to_object(&this)?;
                let length = self.array_items(object)?.len();
                if length == 0 {
                    self.set_property(&this, PropertyKey::from("length"), JsValue::Number(0.0))?;
                    return Ok(JsValue::Undefined);
                }
                let key = PropertyKey::String((length - 1).to_string());
                let value = self.get_property(&this, &key)?;
                self.delete_property(&this, &key)?;
                self.set_property(&this, PropertyKey::from("length"), JsValue::Number((length - 1) as f64))?;
                Ok(value)
            }
            NativeId::ArrayJoin | NativeId::ArrayToString => {
                let object = self.to_object(&this)?;
                let separator = match arg(&args, 0) {
                    JsValue::Undefined => ",".to_string(),
                    value if id == NativeId::ArrayJoin => self.to_js_string(&value)?,
                    _ => ",".to_string(),
                };
                let mut parts = Vec::new();
                for item in self.array_items(object)? {
                    parts.push(match item {
                        JsValue::Undefined | JsValue::Null => String::new(),
                        value => self.to_js_string(&value)?,
                    });
                }
                Ok(JsValue::Str(parts.join(&separator)))
            }
            NativeId::ArrayMap | NativeId::ArrayForEach => {
                let object = self.to_object(&this)?;
                let callback = arg(&args, 0);
                if !self.is_callable(&callback) {
                    return Err(self.type_error(format!("{} is not a function", self.display_value(&callback))));
                }
                let receiver = arg(&args, 1);
                let mut results = Vec::new();
                for (index, item) in self.array_items(object)?.into_iter().enumerate() {
                    let result = self.call(
                        &callback,
                        receiver.clone(),
                        vec![item, JsValue::Number(index as f64), this.clone()],
                    )?;
                    results.push(result);
                }
                if id == NativeId::ArrayForEach {
                    return Ok(JsValue::Undefined);
                }
                Ok(JsValue::Object(self.create_array(results)?))
            }
            NativeId::ArrayIndexOf | NativeId::ArrayIncludes => {
                let object = self.to_object(&this)?;
                let needle = arg(&args, 0);
                let items = self.array_items(object)?;
                if id == NativeId::ArrayIncludes {
                    return Ok(JsValue::Bool(items.iter().any(|item| item.same_value_zero(&needle))));
                }
                Ok(JsValue::Number(
                    items
                        .iter()
                        .position(|item| item.strict_equals(&needle))
                        .map_or(-1.0, |index| index as f64),
                ))
            }
            _ => {
                let object = self.to_object(&this)?;
                let items = self.array_items(object)?;
                let length = items.len() as f64;
                let relative = |value: f64, default: f64| {
                    let value = if value.is_nan() { default } else { value.trunc() };
                    if value < 0.0 { (length + value).max(0.0) } else { value.min(length) }
                };
                let start = match arg(&args, 0) {
                    JsValue::Undefined => 0.0,
                    value => relative(self.to_number(&value)?, 0.0),
                };
                let end = match arg(&args, 1) {
                    JsValue::Undefined => length,
                    value => relative(self.to_number(&value)?, length),
                };
                let slice = if start < end {
                    items[start as usize..end as usize].to_vec()
                } else {
                    Vec::new()
                };
                Ok(JsValue::Object(self.create_array(slice)?))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Map and Set
    // -----------------------------------------------------------------------

    fn collection_native(
        &mut self,
        id: NativeId,
        this: JsValue,
        args: &[JsValue],
        new_target: Option<ObjectHandle>,
    ) -> EngineResult<JsValue> {
        match id {
            NativeId::MapConstructor | NativeId::SetConstructor => {
                let is_map = id == NativeId::MapConstructor;
                let name = if is_map { "Map" } else { "Set" };
                let Some(target) = new_target else {
                    return Err(self.type_error(format!("Constructor {name} requires 'new'")));
                };
                let (fallback, kind) = if is_map {
                    (self.intrinsics.map_prototype, ObjectKind::Map(IndexMap::new()))
                } else {
                    (self.intrinsics.set_prototype, ObjectKind::Set(IndexSet::new()))
                };
                let prototype = self.prototype_from_constructor(Some(target), fallback)?;
                let collection = self.heap.alloc(Some(prototype), kind);
                let source = arg(args, 0);
                if !source.is_nullish() {
                    for item in self.iterate(&source)? {
                        if is_map {
                            if !item.is_object() {
                                return Err(self.type_error(format!(
                                    "Iterator value {} is not an entry object",
                                    self.display_value(&item)
                                )));
                            }
                            let key = self.get_property(&item, &PropertyKey::from("0"))?;
                            let value = self.get_property(&item, &PropertyKey::from("1"))?;
                            self.map_insert(collection, &key, value)?;
                        } else {
                            self.set_insert(collection, &item)?;
                        }
                    }
                }
                Ok(JsValue::Object(collection))
            }
            NativeId::MapGet
            | NativeId::MapSet
            | NativeId::MapHas
            | NativeId::MapDelete
            | NativeId::MapForEach
            | NativeId::MapSize => {
                let map = self.collection_receiver(&this, true)?;
                let key = CollectionKey::from_value(&arg(args, 0));
                let ObjectKind::Map(entries) = &mut self.heap.get_mut(map)?.kind else {
                    return Ok(JsValue::Undefined);
                };
                match id {
                    NativeId::MapGet => Ok(entries.get(&key).cloned().unwrap_or(JsValue::Undefined)),
                    NativeId::MapHas => Ok(JsValue::Bool(entries.contains_key(&key))),
                    NativeId::MapDelete => Ok(JsValue::Bool(entries.shift_remove(&key).is_some())),
                    NativeId::MapSize => Ok(JsValue::Number(entries.len() as f64)),
                    NativeId::MapSet => {
                        entries.insert(key, arg(args, 1));
                        Ok(this)
                    }
                    _ => {
                        let snapshot: Vec<(CollectionKey, JsValue)> =
                            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                        let callback = arg(args, 0);
                        for (key, value) in snapshot {
                            self.call(&callback, arg(args, 1), vec![value, key.to_value(), this.clone()])?;
                        }
                        Ok(JsValue::Undefined)
                    }
                }
            }
            _ => {
                let set = self.collection_receiver(&this, false)?;
                let key = CollectionKey::from_value(&arg(args, 0));
                let ObjectKind::Set(elements) = &mut self.heap.get_mut(set)?.kind else {
                    return Ok(JsValue::Undefined);
                };
                match id {
                    NativeId::SetHas => Ok(JsValue::Bool(elements.contains(&key))),
                    NativeId::SetDelete => Ok(JsValue::Bool(elements.shift_remove(&key))),
                    NativeId::SetSize => Ok(JsValue::Number(elements.len() as f64)),
                    NativeId::SetAdd => {
                        elements.insert(key);
                        Ok(this)
                    }
                    // A snapshot array stands in for the iterator.
                    NativeId::SetValues => {
                        let values: Vec<JsValue> = elements.iter().map(CollectionKey::to_value).collect();
                        Ok(JsValue::Object(self.create_array(values)?))
                    }
                    _ => {
                        let snapshot: Vec<CollectionKey> = elements.iter().cloned().collect();
                        let callback = arg(args, 0);
                        for key in snapshot {
                            let value = key.to_value();
                            self.call(&callback, arg(args, 1), vec![value.clone(), value, this.clone()])?;
                        }
                        Ok(JsValue::Undefined)
                    }
                }
            }
        }
    }

    fn collection_receiver(&mut self, this: &JsValue, map: bool) -> EngineResult<ObjectHandle> {
        if let JsValue::Object(handle) = this {
            let matches = match self.heap.kind(*handle)? {
                ObjectKind::Map(_) => map,
                ObjectKind::Set(_) => !map,
                _ => false,
            };
            if matches {
                return Ok(*handle);
            }
        }
        let name = if map { "Map" } else { "Set" };
        Err(self.type_error(format!(
            "Method {name}.prototype method called on incompatible receiver {}",
            self.display_value(this)
        )))
    }

    pub(crate) fn map_insert(&mut self, map: ObjectHandle, key: &JsValue, value: JsValue) -> EngineResult<()> {
        if let ObjectKind::Map(entries) = &mut self.heap.get_mut(map)?.kind {
            entries.insert(CollectionKey::from_value(key), value);
        }
        Ok(())
    }

    pub(crate) fn set_insert(&mut self, set: ObjectHandle, value: &JsValue) -> EngineResult<()> {
        if let ObjectKind::Set(elements) = &mut self.heap.get_mut(set)?.kind {
            elements.insert(CollectionKey::from_value(value));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Promise
    // -----------------------------------------------------------------------

    pub(crate) fn create_promise(&mut self, state: PromiseState) -> ObjectHandle {
        self.heap
            .alloc(Some(self.intrinsics.promise_prototype), ObjectKind::Promise(state))
    }

    /// Settle a pending promise; settled promises ignore later calls.
    pub(crate) fn settle_promise(&mut self, promise: ObjectHandle, state: PromiseState) -> EngineResult<()> {
        let state = match state {
            PromiseState::Fulfilled(JsValue::Object(inner)) => match self.heap.kind(inner)? {
                ObjectKind::Promise(adopted) => adopted.clone(),
                _ => PromiseState::Fulfilled(JsValue::Object(inner)),
            },
            other => other,
        };
        if let ObjectKind::Promise(current) = &mut self.heap.get_mut(promise)?.kind
            && *current == PromiseState::Pending
        {
            *current = state;
        }
        Ok(())
    }

    fn promise_native(
        &mut self,
        id: NativeId,
        slot: Option<JsValue>,
        args: &[JsValue],
        new_target: Option<ObjectHandle>,
    ) -> EngineResult<JsValue> {
        let value = arg(args, 0);
        match id {
            NativeId::PromiseConstructor => {
                let Some(target) = new_target else {
                    return Err(self.type_error("Promise constructor cannot be invoked without 'new'"));
                };
                if !self.is_callable(&value) {
                    return Err(self.type_error(format!(
                        "Promise resolver {} is not a function",
                        self.display_value(&value)
                    )));
                }
                let fallback = self.intrinsics.promise_prototype;
                let prototype = self.prototype_from_constructor(Some(target), fallback)?;
                let promise = self
                    .heap
                    .alloc(Some(prototype), ObjectKind::Promise(PromiseState::Pending));
                let slot = Some(JsValue::Object(promise));
                let resolve = self.create_native(NativeId::PromiseResolveFunction, slot.clone(), "", 1);
                let reject = self.create_native(NativeId::PromiseRejectFunction, slot, "", 1);
                let outcome = self.call(
                    &value,
                    JsValue::Undefined,
                    vec![JsValue::Object(resolve), JsValue::Object(reject)],
                );
                if let Err(error) = outcome {
                    let reason = self.error_to_value(error);
                    self.settle_promise(promise, PromiseState::Rejected(reason))?;
                }
                Ok(JsValue::Object(promise))
            }
            NativeId::PromiseResolve => {
                if let JsValue::Object(handle) = &value
                    && matches!(self.heap.kind(*handle)?, ObjectKind::Promise(_))
                {
                    return Ok(value);
                }
                let promise = self.create_promise(PromiseState::Pending);
                self.settle_promise(promise, PromiseState::Fulfilled(value))?;
                Ok(JsValue::Object(promise))
            }
            NativeId::PromiseReject => Ok(JsValue::Object(self.create_promise(PromiseState::Rejected(value)))),
            _ => {
                if let Some(JsValue::Object(promise)) = slot {
                    let state = if id == NativeId::PromiseResolveFunction {
                        PromiseState::Fulfilled(value)
                    } else {
                        PromiseState::Rejected(value)
                    };
                    self.settle_promise(promise, state)?;
                }
                Ok(JsValue::Undefined)
            }
        }
    }

    // -----------------------------------------------------------------------
    // ArrayBuffer and Uint8Array
    // -----------------------------------------------------------------------

    fn to_index(&mut self, value: &JsValue, what: &str) -> EngineResult<usize> {
        if *value == JsValue::Undefined {
            return Ok(0);
        }
        let n = self.to_number(value)?;
        let n = if n.is_nan() { 0.0 } else { n.trunc() };
        if !(0.0..=9_007_199_254_740_991.0).contains(&n) {
            return Err(self.range_error(format!("Invalid {what}: {}", number_to_string(n))));
        }
        Ok(n as usize)
    }

    pub(crate) fn create_array_buffer(&mut self, data: ArrayBufferData) -> ObjectHandle {
        self.heap.alloc(
            Some(self.intrinsics.array_buffer_prototype),
            ObjectKind::ArrayBuffer(data),
        )
    }

    fn buffer_receiver(&mut self, this: &JsValue) -> EngineResult<(ObjectHandle, ArrayBufferData)> {
        if let JsValue::Object(handle) = this
            && let ObjectKind::ArrayBuffer(data) = self.heap.kind(*handle)?
        {
            return Ok((*handle, data.clone()));
        }
        Err(self.type_error(format!(
            "Method ArrayBuffer.prototype method called on incompatible receiver {}",
            self.display_value(this)
        )))
    }

    fn view_receiver(&mut self, this: &JsValue) -> EngineResult<(ObjectHandle, usize, usize)> {
        if let JsValue::Object(handle) = this
            && let ObjectKind::Uint8Array {
                buffer,
                byte_offset,
                length,
            } = self.heap.kind(*handle)?
        {
            return Ok((*buffer, *byte_offset, *length));
        }
        Err(self.type_error("this is not a typed array."))
    }

    fn binary_native(
        &mut self,
        id: NativeId,
        this: JsValue,
        args: &[JsValue],
        new_target: Option<ObjectHandle>,
    ) -> EngineResult<JsValue> {
        match id {
            NativeId::ArrayBufferConstructor => {
                let Some(target) = new_target else {
                    return Err(self.type_error("Constructor ArrayBuffer requires 'new'"));
                };
                let length = self.to_index(&arg(args, 0), "array buffer length")?;
                let length = self.check_materialized_length(length, "array buffer length")?;
                let max_byte_length = match arg(args, 1) {
                    options @ JsValue::Object(_) => {
                        match self.get_property(&options, &PropertyKey::from("maxByteLength"))? {
                            JsValue::Undefined => None,
                            value => Some(self.to_index(&value, "array buffer max length")?),
                        }
                    }
                    _ => None,
                };
                if max_byte_length.is_some_and(|max| length > max) {
                    return Err(self.range_error("Invalid array buffer max length"));
                }
                let fallback = self.intrinsics.array_buffer_prototype;
                let prototype = self.prototype_from_constructor(Some(target), fallback)?;
                let data = ArrayBufferData {
                    bytes: vec![0; length],
                    max_byte_length,
                    detached: false,
                };
                Ok(JsValue::Object(self.heap.alloc(Some(prototype), ObjectKind::ArrayBuffer(data))))
            }
            NativeId::ArrayBufferByteLength => {
                let (_, data) = self.buffer_receiver(&this)?;
                Ok(JsValue::Number(if data.detached { 0.0 } else { data.bytes.len() as f64 }))
            }
            NativeId::ArrayBufferMaxByteLength => {
                let (_, data) = self.buffer_receiver(&this)?;
                let max = if data.detached { 0 } else { data.max_byte_length.unwrap_or(data.bytes.len()) };
                Ok(JsValue::Number(max as f64))
            }
            NativeId::ArrayBufferResizable => {
                let (_, data) = self.buffer_receiver(&this)?;
                Ok(JsValue::Bool(data.max_byte_length.is_some()))
            }
            NativeId::ArrayBufferDetached => {
                let (_, data) = self.buffer_receiver(&this)?;
                Ok(JsValue::Bool(data.detached))
            }
            NativeId::ArrayBufferResize => {
                let (buffer, data) = self.buffer_receiver(&this)?;
                let Some(max) = data.max_byte_length else {
                    return Err(self.type_error("Method ArrayBuffer.prototype.resize called on incompatible receiver #<ArrayBuffer>"));
                };
                if data.detached {
                    return Err(self.type_error("Cannot perform ArrayBuffer.prototype.resize on a detached ArrayBuffer"));
                }
                let length = self.to_index(&arg(args, 0), "length")?;
                let length = self.check_materialized_length(length, "array buffer length")?;
                if length > max {
                    return Err(self.range_error("ArrayBuffer.prototype.resize: Invalid length parameter"));
                }
                if let ObjectKind::ArrayBuffer(data) = &mut self.heap.get_mut(buffer)?.kind {
                    data.bytes.resize(length, 0);
                }
                Ok(JsValue::Undefined)
            }
            NativeId::ArrayBufferTransfer => {
                let (buffer, data) = self.buffer_receiver(&this)?;
                if data.detached {
                    return Err(self.type_error("Cannot perform ArrayBuffer.prototype.transfer on a detached ArrayBuffer"));
                }
                let mut bytes = data.bytes.clone();
                if let value @ (JsValue::Number(_) | JsValue::Str(_)) = arg(args, 0) {
                    let length = self.to_index(&value, "length")?;
                    let length = self.check_materialized_length(length, "array buffer length")?;
                    if data.max_byte_length.is_some_and(|max| length > max) {
                        return Err(self.range_error("ArrayBuffer.prototype.transfer: Invalid length parameter"));
                    }
                    bytes.resize(length, 0);
                }
                if let ObjectKind::ArrayBuffer(old) = &mut self.heap.get_mut(buffer)?.kind {
                    old.bytes.clear();
                    old.detached = true;
                }
                Ok(JsValue::Object(self.create_array_buffer(ArrayBufferData {
                    bytes,
                    max_byte_length: data.max_byte_length,
                    detached: false,
                })))
            }
            NativeId::Uint8ArrayConstructor => {
                let Some(target) = new_target else {
                    return Err(self.type_error("Constructor Uint8Array requires 'new'"));
                };
                let source = arg(args, 0);
                let (buffer, byte_offset, length) = match &source {
                    JsValue::Object(handle) => match self.heap.kind(*handle)?.clone() {
                        ObjectKind::ArrayBuffer(data) => {
                            let available = data.bytes.len();
                            let offset = self.to_index(&arg(args, 1), "offset")?;
                            if offset > available {
                                return Err(self.range_error(format!(
                                    "Start offset {offset} is outside the bounds of the buffer"
                                )));
                            }
                            let length = match arg(args, 2) {
                                JsValue::Undefined => available - offset,
                                value => self.to_index(&value, "typed array length")?,
                            };
                            if offset + length > available {
                                return Err(self.range_error(format!("Invalid typed array length: {length}")));
                            }
                            (*handle, offset, length)
                        }
                        _ => {
                            let items = self.iterate(&source)?;
                            let mut bytes = Vec::with_capacity(items.len());
                            for item in items {
                                let n = self.to_number(&item)?;
                                bytes.push(if n.is_finite() { (n.trunc() as i64).rem_euclid(256) as u8 } else { 0 });
                            }
                            let length = bytes.len();
                            let buffer = self.create_array_buffer(ArrayBufferData {
                                bytes,
                                ..ArrayBufferData::default()
                            });
                            (buffer, 0, length)
                        }
                    },
                    value => {
                        let length = self.to_index(value, "typed array length")?;
                        let length = self.check_materialized_length(length, "typed array length")?;
                        let buffer = self.create_array_buffer(ArrayBufferData {
                            bytes: vec![0; length],
                            ..ArrayBufferData::default()
                        });
                        (buffer, 0, length)
                    }
                };
                let fallback = self.intrinsics.uint8_array_prototype;
                let prototype = self.prototype_from_constructor(Some(target), fallback)?;
                Ok(JsValue::Object(self.heap.alloc(
                    Some(prototype),
                    ObjectKind::Uint8Array {
                        buffer,
                        byte_offset,
                        length,
                    },
                )))
            }
            NativeId::Uint8ArrayLength => {
                let (_, _, length) = self.view_receiver(&this)?;
                Ok(JsValue::Number(length as f64))
            }
            NativeId::Uint8ArrayBuffer => {
                let (buffer, _, _) = self.view_receiver(&this)?;
                Ok(JsValue::Object(buffer))
            }
            _ => {
                let (_, byte_offset, _) = self.view_receiver(&this)?;
                Ok(JsValue::Number(byte_offset as f64))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Primitive constructors and wrappers
    // -----------------------------------------------------------------------

    fn primitive_native(
        &mut self,
        id: NativeId,
        this: JsValue,
        args: &[JsValue],
        new_target: Option<ObjectHandle>,
    ) -> EngineResult<JsValue> {
        let value = arg(args, 0);
        let (primitive, fallback) = match id {
            NativeId::NumberConstructor => {
                let n = match (&value, args.is_empty()) {
                    (_, true) => 0.0,
                    (JsValue::BigInt(n), _) => *n as f64,
                    _ => self.to_number(&value)?,
                };
                (JsValue::Number(n), self.intrinsics.number_prototype)
            }
            NativeId::StringConstructor => {
                let text = match (&value, args.is_empty()) {
                    (_, true) => String::new(),
                    (JsValue::Symbol(id), _) if new_target.is_none() => {
                        format!("Symbol({})", self.symbols.description(*id).unwrap_or(""))
                    }
                    _ => self.to_js_string(&value)?,
                };
                (JsValue::Str(text), self.intrinsics.string_prototype)
            }
            NativeId::BooleanConstructor => (JsValue::Bool(self.to_boolean(&value)), self.intrinsics.boolean_prototype),
            NativeId::BigIntConstructor => {
                if new_target.is_some() {
                    return Err(self.type_error("BigInt is not a constructor"));
                }
                let primitive = self.to_primitive(&value, crate::realm::PrimitiveHint::Number)?;
                return match primitive {
                    JsValue::BigInt(n) => Ok(JsValue::BigInt(n)),
                    JsValue::Bool(b) => Ok(JsValue::BigInt(i128::from(b))),
                    JsValue::Number(n) if n.is_finite() && n.fract() == 0.0 => Ok(JsValue::BigInt(n as i128)),
                    JsValue::Number(n) => Err(self.range_error(format!(
                        "The number {} cannot be converted to a BigInt because it is not an integer",
                        number_to_string(n)
                    ))),
                    JsValue::Str(text) => match text.trim().parse::<i128>() {
                        Ok(n) => Ok(JsValue::BigInt(n)),
                        Err(_) => Err(self.syntax_error(format!("Cannot convert {text} to a BigInt"))),
                    },
                    other => Err(self.type_error(format!(
                        "Cannot convert {} to a BigInt",
                        self.display_value(&other)
                    ))),
                };
            }
            _ => {
                let primitive = match &this {
                    JsValue::Object(handle) => match self.heap.kind(*handle)? {
                        ObjectKind::PrimitiveWrapper(inner) => inner.clone(),
                        _ => return Err(self.type_error("valueOf called on incompatible receiver")),
                    },
                    JsValue::Undefined | JsValue::Null => {
                        return Err(self.type_error("valueOf called on incompatible receiver"));
                    }
                    primitive => primitive.clone(),
                };
                if id == NativeId::PrimitiveValueOf {
                    return Ok(primitive);
                }
                return match primitive {
                    JsValue::Symbol(id) => Ok(JsValue::Str(format!(
                        "Symbol({})",
                        self.symbols.description(id).unwrap_or("")
                    ))),
                    other => Ok(JsValue::Str(self.to_js_string(&other)?)),
                };
            }
        };
        match new_target {
            None => Ok(primitive),
            Some(target) => {
                let prototype = self.prototype_from_constructor(Some(target), fallback)?;
                Ok(JsValue::Object(
                    self.heap.alloc(Some(prototype), ObjectKind::PrimitiveWrapper(primitive)),
                ))
            }
        }
    }

    // -----------------------------------------------------------------------
    // JSON
    // -----------------------------------------------------------------------

    /// `JSON.stringify` value conversion; `None` for values JSON skips.
    pub(crate) fn js_to_json(
        &mut self,
        value: &JsValue,
        seen: &mut Vec<ObjectHandle>,
    ) -> EngineResult<Option<serde_json::Value>> {
        Ok(Some(match value {
            JsValue::Undefined | JsValue::Symbol(_) => return Ok(None),
            JsValue::Null => serde_json::Value::Null,
            JsValue::Bool(b) => serde_json::Value::Bool(*b),
            JsValue::Number(n) => number_to_json(*n),
            JsValue::Str(s) => serde_json::Value::String(s.clone()),
            JsValue::BigInt(_) => return Err(self.type_error("Do not know how to serialize a BigInt")),
            JsValue::Object(handle) => {
                let handle = *handle;
                match self.heap.kind(handle)?.clone() {
                    ObjectKind::Function(_) => return Ok(None),
                    ObjectKind::PrimitiveWrapper(inner) => return self.js_to_json(&inner, seen),
                    kind => {
                        if seen.contains(&handle) {
                            return Err(self.type_error("Converting circular structure to JSON"));
                        }
                        seen.push(handle);
                        let json = if matches!(kind, ObjectKind::Array) {
                            let mut items = Vec::new();
                            for item in self.array_items(handle)? {
                                items.push(self.js_to_json(&item, seen)?.unwrap_or(serde_json::Value::Null));
                            }
                            serde_json::Value::Array(items)
                        } else {
                            let mut map = serde_json::Map::new();
                            for (key, desc) in self.heap.own_property_entries(handle)? {
                                let PropertyKey::String(name) = &key else {
                                    continue;
                                };
                                if !desc.is_enumerable() {
                                    continue;
                                }
                                let item = self.get_from(handle, &key, value)?;
                                if let Some(json) = self.js_to_json(&item, seen)? {
                                    map.insert(name.clone(), json);
                                }
                            }
                            serde_json::Value::Object(map)
                        };
                        seen.pop();
                        json
                    }
                }
            }
        }))
    }

    pub(crate) fn json_to_js(&mut self, json: &serde_json::Value) -> EngineResult<JsValue> {
        Ok(match json {
            serde_json::Value::Null => JsValue::Null,
            serde_json::Value::Bool(b) => JsValue::Bool(*b),
            serde_json::Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => JsValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.json_to_js(item)?);
                }
                JsValue::Object(self.create_array(values)?)
            }
            serde_json::Value::Object(map) => {
                let object = self.create_object();
                for (key, item) in map {
                    let value = self.json_to_js(item)?;
                    self.create_data_property(object, PropertyKey::String(key.clone()), value)?;
                }
                JsValue::Object(object)
            }
        })
    }

    // -----------------------------------------------------------------------
    // Runtime API
    // -----------------------------------------------------------------------

    /// `{ scope, source }` registration options.
    fn registration_options(&mut self, options: &JsValue, api: &str) -> EngineResult<(ObjectHandle, String)> {
        if !options.is_object() {
            return Err(self.type_error(format!("{api}: options must be an object")));
        }
        let scope = self.get_property(options, &PropertyKey::from("scope"))?;
        let Some(scope) = scope.as_object().filter(|h| self.heap.is_function(*h)) else {
            return Err(self.type_error(format!("{api}: scope must be a function")));
        };
        let source = self.get_property(options, &PropertyKey::from("source"))?;
        let source = self.to_js_string(&source)?;
        Ok((scope, source))
    }

    fn runtime_native(&mut self, id: NativeId, args: &[JsValue]) -> EngineResult<JsValue> {
        let value = arg(args, 0);
        match id {
            NativeId::RegisterFunction | NativeId::RegisterClass => {
                let api = if id == NativeId::RegisterFunction { "registerFunction" } else { "registerClass" };
                let Some(function) = value.as_object().filter(|h| self.heap.is_function(*h)) else {
                    return Err(self.type_error(format!("{api}: expected a function, got {}", self.display_value(&value))));
                };
                let (scope, source) = self.registration_options(&arg(args, 1), api)?;
                self.registry.register(
                    function,
                    RegistrationRecord::Syntactic {
                        scope: ScopeSource::Thunk(scope),
                        source_text: source,
                    },
                );
                if id == NativeId::RegisterClass {
                    self.register_class_members(function)?;
                }
                Ok(value)
            }
            NativeId::RegisterAccessors => {
                let Some(object) = value.as_object() else {
                    return Err(self.type_error("registerAccessors: expected an object"));
                };
                let list = match arg(args, 1) {
                    JsValue::Object(list) => self.array_items(list)?,
                    _ => Vec::new(),
                };
                for item in list {
                    let key = self.get_property(&item, &PropertyKey::from("key"))?;
                    let key = self.to_property_key(&key)?;
                    let kind = self.get_property(&item, &PropertyKey::from("kind"))?;
                    let getter = self.to_js_string(&kind)? == "get";
                    let (scope, source) = self.registration_options(&item, "registerAccessors")?;
                    let half = match self.heap.get_own_property_descriptor(object, &key)? {
                        Some(PropertyDescriptor::Accessor { get, set, .. }) => {
                            if getter { get } else { set }
                        }
                        _ => None,
                    };
                    if let Some(function) = half {
                        self.registry.register(
                            function,
                            RegistrationRecord::Syntactic {
                                scope: ScopeSource::Thunk(scope),
                                source_text: source,
                            },
                        );
                    }
                }
                Ok(value)
            }
            NativeId::RegisterHostObject => {
                let path = self.to_js_string(&arg(args, 1))?;
                self.register_host_root(&value, &path)?;
                Ok(value)
            }
            NativeId::EnsureSerializable => self.ensure_serializable(&value),
            NativeId::Serialize => {
                let options = arg(args, 1);
                let mut serialize_options = SerializeOptions::default();
                if options.is_object() {
                    let path = self.get_property(&options, &PropertyKey::from("hostObjectPath"))?;
                    if !path.is_nullish() {
                        serialize_options.host_object_path = Some(self.to_js_string(&path)?);
                    }
                    let stop = self.get_property(&options, &PropertyKey::from("stopIfUnreachableFromHost"))?;
                    serialize_options.stop_if_unreachable_from_host = self.to_boolean(&stop);
                }
                let envelope = self.serialize(&value, serialize_options)?;
                let json = serde_json::to_value(&envelope)
                    .map_err(|error| self.type_error(error.to_string()))?;
                self.json_to_js(&json)
            }
            _ => {
                let envelope = match &value {
                    JsValue::Str(text) => Envelope::from_json_str(text)?,
                    other => {
                        let mut seen = Vec::new();
                        let json = self.js_to_json(other, &mut seen)?.unwrap_or(serde_json::Value::Null);
                        Envelope::from_json_value(json)?
                    }
                };
                self.deserialize(&envelope)
            }
        }
    }

    /// Register the members of `class` as class-member records and note its
    /// prototype.  Symbol-keyed members are not registered.
    pub(crate) fn register_class_members(&mut self, class: ObjectHandle) -> EngineResult<()> {
        for (key, desc) in self.heap.own_property_entries(class)? {
            let PropertyKey::String(name) = &key else {
                continue;
            };
            if name == "prototype" {
                continue;
            }
            self.register_member(class, name, &desc, true);
        }
        let prototype = match self
            .heap
            .get_own_property_descriptor(class, &PropertyKey::from("prototype"))?
        {
            Some(PropertyDescriptor::Data {
                value: JsValue::Object(prototype),
                ..
            }) => prototype,
            _ => return Ok(()),
        };
        self.registry.register_class_prototype(prototype, class);
        for (key, desc) in self.heap.own_property_entries(prototype)? {
            let PropertyKey::String(name) = &key else {
                continue;
            };
            if name == "constructor" {
                continue;
            }
            self.register_member(class, name, &desc, false);
        }
        Ok(())
    }

    fn register_member(&mut self, class: ObjectHandle, name: &str, desc: &PropertyDescriptor, is_static: bool) {
        let mut records = Vec::new();
        match desc {
            PropertyDescriptor::Data {
                value: JsValue::Object(function),
                ..
            } if *function != class && self.heap.is_function(*function) => {
                records.push((*function, member_expression(name, is_static)));
            }
            PropertyDescriptor::Accessor { get, set, .. } => {
                if let Some(getter) = get {
                    records.push((*getter, accessor_member_expression(name, is_static, true)));
                }
                if let Some(setter) = set {
                    records.push((*setter, accessor_member_expression(name, is_static, false)));
                }
            }
            _ => {}
        }
        for (function, member_expression) in records {
            self.registry.register(
                function,
                RegistrationRecord::ClassMember {
                    owning_class: class,
                    member_expression,
                },
            );
        }
    }
}

pub(crate) fn number_to_json(n: f64) -> serde_json::Value {
    if !n.is_finite() {
        return serde_json::Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::object_model::JsValue;
    use crate::realm::Realm;

    fn eval(source: &str) -> JsValue {
        let mut realm = Realm::new(EngineConfig::default()).expect("realm");
        realm.eval_script(source).expect("eval")
    }

    #[test]
    fn object_reflection() {
        let source = "
            const o = {};
            Object.defineProperty(o, 'k', { value: 1, enumerable: false });
            const d = Object.getOwnPropertyDescriptor(o, 'k');
            [d.value, d.writable, d.enumerable, d.configurable, Object.keys(o).length,
             Object.getOwnPropertyNames(o).length].join(',')
        ";
        assert_eq!(eval(source), JsValue::str("1,false,false,false,0,1"));
    }

    #[test]
    fn collections() {
        let source = "
            const m = new Map([[1, 'a']]);
            m.set(NaN, 'n').set(-0, 'z');
            const s = new Set([1, 1, 2]);
            [m.get(1), m.get(NaN), m.get(0), m.size, s.size, s.has(2)].join(',')
        ";
        assert_eq!(eval(source), JsValue::str("a,n,z,3,2,true"));
    }

    #[test]
    fn symbols_registry() {
        let source = "
            const a = Symbol.for('app');
            const b = Symbol('app');
            [a === Symbol.for('app'), a === b, Symbol.keyFor(a), String(Symbol.keyFor(b)), b.description].join(',')
        ";
        assert_eq!(eval(source), JsValue::str("true,false,app,undefined,app"));
    }

    #[test]
    fn array_buffer_resize_and_transfer() {
        let source = "
            const buf = new ArrayBuffer(2, { maxByteLength: 8 });
            buf.resize(4);
            const view = new Uint8Array(buf);
            view[3] = 9;
            const moved = buf.transfer();
            [buf.detached, buf.byteLength, moved.byteLength, moved.resizable, new Uint8Array(moved)[3]].join(',')
        ";
        assert_eq!(eval(source), JsValue::str("true,0,4,true,9"));
    }

    #[test]
    fn json_round_trip_preserves_key_order() {
        let source = "JSON.stringify(JSON.parse('{\"z\":1,\"a\":[true,null,\"x\"]}'))";
        assert_eq!(eval(source), JsValue::str(r#"{"z":1,"a":[true,null,"x"]}"#));
    }

    #[test]
    fn promises_settle_once() {
        let source = "
            let resolveLater;
            const p = new Promise((resolve, reject) => { resolve(1); reject(2); });
            const q = new Promise((resolve) => { resolveLater = resolve; });
            String(p) + ' ' + typeof resolveLater
        ";
        let mut realm = Realm::new(EngineConfig::default()).expect("realm");
        let value = realm.eval_script(source).expect("eval");
        assert_eq!(value, JsValue::str("[object Promise] function"));
        let p = realm.get_global("p").expect("p");
        assert_eq!(realm.display_value(&p), "Promise { 1 }");
    }

    #[test]
    fn huge_sparse_arrays_throw_instead_of_allocating() {
        let source = "
            const a = [];
            a.length = 4294967295;
            let caught = 'none';
            try { a.slice(0, 1); } catch (e) { caught = e instanceof RangeError; }
            [a.length, caught, Object.keys(a).length].join(',')
        ";
        assert_eq!(eval(source), JsValue::str("4294967295,true,0"));

        let mut realm = Realm::new(EngineConfig::default()).expect("realm");
        let sparse = realm.eval_script("const b = [1]; b.length = 4294967295; b").expect("eval");
        assert_eq!(realm.display_value(&sparse).matches("<empty>").count(), 99);
    }

    #[test]
    fn buffer_sizes_respect_the_configured_limit() {
        let config = EngineConfig {
            max_array_length: 8,
            ..EngineConfig::default()
        };
        let mut realm = Realm::new(config).expect("realm");
        let source = "
            const ok = new ArrayBuffer(8).byteLength;
            let caught = [];
            try { new ArrayBuffer(9); } catch (e) { caught.push(e instanceof RangeError); }
            try { new Uint8Array(64); } catch (e) { caught.push(e instanceof RangeError); }
            ok + ':' + caught.join(',')
        ";
        assert_eq!(realm.eval_script(source).expect("eval"), JsValue::str("8:true,true"));
    }

    #[test]
    fn console_log_records_lines() {
        let mut realm = Realm::new(EngineConfig::default()).expect("realm");
        realm.eval_script("console.log('a', 1, [2])").expect("eval");
        assert_eq!(realm.console_output(), ["a 1 [2]"]);
    }

    #[test]
    fn error_objects() {
        let source = "
            const e = new TypeError('bad');
            [e instanceof TypeError, e instanceof Error, e.name, e.message, String(e)].join('|')
        ";
        assert_eq!(eval(source), JsValue::str("true|true|TypeError|bad|TypeError: bad"));
    }
}
