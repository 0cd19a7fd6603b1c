//! Realm: the heap, the environment arena and the host-facing API.
//!
//! A [`Realm`] owns every value a script can observe.  Environments follow
//! the usual lexical model:
//!
//! - **Object environment** at the root, backed by the global object
//!   (top-level `var` and function declarations live here).
//! - **Script environment** below it for top-level `let`/`const`/`class`.
//! - **Function and block environments** created per call and per block,
//!   with TDZ enforcement for lexical bindings.
//!
//! Environments created to evaluate reconstructed source text carry a scope
//! table; `__$getFromScope("x")` reads from the nearest one.

use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::config::EngineConfig;
use crate::deserializer::DeserializeSession;
use crate::encoders::{EncoderRegistry, HeapEncoder};
use crate::envelope::SerializedValue;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventLog, NO_ERROR_CODE, OUTCOME_ALLOW, OUTCOME_DENY};
use crate::host_paths::HostPathTable;
use crate::intrinsics::{ErrorKind, Intrinsics, create_intrinsics};
use crate::object_model::{
    FunctionBehavior, JsValue, ObjectError, ObjectHandle, ObjectHeap, ObjectKind, PropertyDescriptor,
    PropertyKey, SymbolRegistry, number_to_string,
};
use crate::parser::parse_script;
use crate::registry::{FunctionRegistry, ReferenceTable, ScopeTableId};
use crate::transpiler::{InstrumentOptions, instrument};

/// Path label under which the global object is registered as a host root.
pub const GLOBAL_ROOT_PATH: &str = "globalThis";

const SCRIPT_LABEL: &str = "<script>";
const DISPLAY_ITEMS: u32 = 100;

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// Opaque handle to an environment record in the realm's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvironmentHandle(pub u32);

/// A single binding slot inside an environment record.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingSlot {
    pub value: JsValue,
    /// `false` while the binding is in its temporal dead zone.
    pub initialized: bool,
    /// `false` for `const` and class inner names.
    pub mutable: bool,
}

impl BindingSlot {
    /// `let`/`const`/`class` binding in the TDZ.
    pub fn new_lexical(mutable: bool) -> Self {
        Self {
            value: JsValue::Undefined,
            initialized: false,
            mutable,
        }
    }

    /// `var` binding, initialized to `undefined`.
    pub fn new_hoisted() -> Self {
        Self {
            value: JsValue::Undefined,
            initialized: true,
            mutable: true,
        }
    }

    pub fn new_initialized(value: JsValue, mutable: bool) -> Self {
        Self {
            value,
            initialized: true,
            mutable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentKind {
    Declarative,
    Function,
    /// Bindings are the properties of an object (the global object).
    Object,
}

/// State of the `this` binding an environment provides.
#[derive(Debug, Clone, PartialEq)]
pub enum ThisBinding {
    /// No own `this`; resolution continues in the parent.
    Lexical,
    /// Derived constructor before `super()` returned.
    Uninitialized,
    Bound(JsValue),
}

#[derive(Debug, Clone)]
pub struct EnvironmentRecord {
    pub parent: Option<EnvironmentHandle>,
    pub kind: EnvironmentKind,
    pub bindings: BTreeMap<String, BindingSlot>,
    /// Backing object of an object environment.
    pub object: Option<ObjectHandle>,
    pub this_binding: ThisBinding,
    /// Function whose activation this is.
    pub function: Option<ObjectHandle>,
    /// Where `super.x` starts looking.
    pub home_object: Option<ObjectHandle>,
    pub new_target: Option<ObjectHandle>,
    pub scope_table: Option<ScopeTableId>,
}

impl EnvironmentRecord {
    pub fn new(parent: Option<EnvironmentHandle>, kind: EnvironmentKind) -> Self {
        Self {
            parent,
            kind,
            bindings: BTreeMap::new(),
            object: None,
            this_binding: ThisBinding::Lexical,
            function: None,
            home_object: None,
            new_target: None,
            scope_table: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scope tables
// ---------------------------------------------------------------------------

/// One captured binding of a reconstructed function.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeEntry {
    Resolved(JsValue),
    /// Not linked yet; resolved through the owning session on first read.
    Pending(SerializedValue),
}

/// Captured bindings of one reconstructed function or class.
#[derive(Debug, Clone, Default)]
pub struct ScopeTable {
    pub entries: IndexMap<String, ScopeEntry>,
    /// Index of the reconstruction session that can resolve pending entries.
    pub session: Option<usize>,
}

/// Preferred conversion for `ToPrimitive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveHint {
    Number,
    String,
}

// ---------------------------------------------------------------------------
// Realm
// ---------------------------------------------------------------------------

pub struct Realm {
    pub(crate) heap: ObjectHeap,
    pub(crate) symbols: SymbolRegistry,
    envs: Vec<EnvironmentRecord>,
    pub(crate) intrinsics: Intrinsics,
    pub(crate) global_env: EnvironmentHandle,
    pub(crate) script_env: EnvironmentHandle,
    pub(crate) registry: FunctionRegistry,
    pub(crate) host_paths: HostPathTable,
    pub(crate) references: ReferenceTable,
    pub(crate) scope_tables: Vec<ScopeTable>,
    pub(crate) sessions: Vec<DeserializeSession>,
    pub(crate) encoders: Rc<EncoderRegistry>,
    config: EngineConfig,
    events: EventLog,
    pub(crate) call_depth: usize,
    pub(crate) console: Vec<String>,
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("trace_id", &self.config.trace_id)
            .field("objects", &self.heap.len())
            .field("environments", &self.envs.len())
            .field("registrations", &self.registry.len())
            .field("host_paths", &self.host_paths.len())
            .finish()
    }
}

impl Realm {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let mut heap = ObjectHeap::new();
        let mut symbols = SymbolRegistry::new();
        let intrinsics = create_intrinsics(&mut heap, &mut symbols);

        let mut global = EnvironmentRecord::new(None, EnvironmentKind::Object);
        global.object = Some(intrinsics.global_object);
        global.this_binding = ThisBinding::Bound(JsValue::Object(intrinsics.global_object));
        let script = EnvironmentRecord::new(Some(EnvironmentHandle(0)), EnvironmentKind::Declarative);

        let mut realm = Self {
            heap,
            symbols,
            envs: vec![global, script],
            intrinsics,
            global_env: EnvironmentHandle(0),
            script_env: EnvironmentHandle(1),
            registry: FunctionRegistry::new(),
            host_paths: HostPathTable::new(),
            references: ReferenceTable::new(),
            scope_tables: Vec::new(),
            sessions: Vec::new(),
            encoders: Rc::new(EncoderRegistry::with_builtins()),
            events: EventLog::new(config.trace_id.clone()),
            config,
            call_depth: 0,
            console: Vec::new(),
        };
        if realm.config.register_global_host_root {
            let global = JsValue::Object(realm.intrinsics.global_object);
            realm.register_host_root(&global, GLOBAL_ROOT_PATH)?;
        }
        Ok(realm)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parse and run a script; returns the value of the last expression
    /// statement.
    pub fn eval_script(&mut self, source: &str) -> EngineResult<JsValue> {
        let program = parse_script(source, SCRIPT_LABEL)?;
        self.run_program(&program)
    }

    /// Instrument `source` with the realm's transpiler options, then run it.
    pub fn eval_instrumented(&mut self, source: &str) -> EngineResult<JsValue> {
        let options = InstrumentOptions {
            wrap_expressions: self.config.wrap_expressions,
        };
        let instrumented = match instrument(source, &options) {
            Ok(text) => {
                self.push_event(
                    "transpiler",
                    "instrument",
                    OUTCOME_ALLOW,
                    NO_ERROR_CODE,
                    format!("bytes_in={} bytes_out={}", source.len(), text.len()),
                );
                text
            }
            Err(error) => {
                let error = EngineError::from(error);
                self.push_event(
                    "transpiler",
                    "instrument",
                    OUTCOME_DENY,
                    error.stable_code(),
                    error.to_string(),
                );
                return Err(error);
            }
        };
        self.eval_script(&instrumented)
    }

    pub fn global_object(&self) -> ObjectHandle {
        self.intrinsics.global_object
    }

    /// Value of a global binding (script-level lexical or global object property).
    pub fn get_global(&mut self, name: &str) -> EngineResult<JsValue> {
        self.get_binding_value(self.script_env, name)
    }

    /// Define a writable, enumerable property on the global object.
    pub fn set_global(&mut self, name: &str, value: JsValue) -> EngineResult<()> {
        let global = self.intrinsics.global_object;
        self.define_or_throw(global, PropertyKey::from(name), PropertyDescriptor::data(value))
    }

    /// `value[key]` with full accessor semantics.
    pub fn get(&mut self, value: &JsValue, key: &str) -> EngineResult<JsValue> {
        self.get_property(value, &PropertyKey::from(key))
    }

    pub fn call_function(
        &mut self,
        function: &JsValue,
        this: JsValue,
        args: &[JsValue],
    ) -> EngineResult<JsValue> {
        self.call(function, this, args.to_vec())
    }

    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    pub fn symbols(&self) -> &SymbolRegistry {
        &self.symbols
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn host_paths(&self) -> &HostPathTable {
        &self.host_paths
    }

    pub fn encoders(&self) -> &EncoderRegistry {
        &self.encoders
    }

    /// Add a custom encoder.  Fails while a serialization pass holds the
    /// registry.
    pub fn register_encoder(&mut self, encoder: Box<dyn HeapEncoder>) -> EngineResult<()> {
        let registry = Rc::get_mut(&mut self.encoders).ok_or_else(|| {
            EngineError::ObjectModel(ObjectError::TypeError(
                "encoder registry is in use".to_string(),
            ))
        })?;
        registry.register(encoder);
        Ok(())
    }

    pub fn events(&self) -> &[EngineEvent] {
        self.events.events()
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain()
    }

    /// Lines written by `console.log`.
    pub fn console_output(&self) -> &[String] {
        &self.console
    }

    pub(crate) fn push_event(
        &mut self,
        component: &str,
        event: &str,
        outcome: &str,
        error_code: &str,
        detail: impl Into<String>,
    ) {
        self.events
            .push_event(component, event, outcome, error_code, detail);
    }

    /// Emit one event for `result`: allow on success, deny with the stable
    /// code on failure.
    pub(crate) fn record_outcome<T>(
        &mut self,
        component: &str,
        event: &str,
        result: &EngineResult<T>,
        detail: impl Into<String>,
    ) {
        match result {
            Ok(_) => self.push_event(component, event, OUTCOME_ALLOW, NO_ERROR_CODE, detail),
            Err(error) => {
                let detail = format!("{}: {error}", detail.into());
                self.push_event(component, event, OUTCOME_DENY, error.stable_code(), detail);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Environment arena
    // -----------------------------------------------------------------------

    pub(crate) fn new_env(
        &mut self,
        parent: Option<EnvironmentHandle>,
        kind: EnvironmentKind,
    ) -> EnvironmentHandle {
        let handle = EnvironmentHandle(self.envs.len() as u32);
        self.envs.push(EnvironmentRecord::new(parent, kind));
        handle
    }

    /// Copy of `env` with the same parent and bindings (per-iteration
    /// `let` environments of `for` loops).
    pub(crate) fn copy_env(&mut self, env: EnvironmentHandle) -> EngineResult<EnvironmentHandle> {
        let record = self.env_ref(env)?.clone();
        let handle = EnvironmentHandle(self.envs.len() as u32);
        self.envs.push(record);
        Ok(handle)
    }

    pub(crate) fn env_ref(&self, env: EnvironmentHandle) -> EngineResult<&EnvironmentRecord> {
        self.envs
            .get(env.0 as usize)
            .ok_or_else(|| unknown_environment(env))
    }

    pub(crate) fn env_mut(&mut self, env: EnvironmentHandle) -> EngineResult<&mut EnvironmentRecord> {
        self.envs
            .get_mut(env.0 as usize)
            .ok_or_else(|| unknown_environment(env))
    }

    // -----------------------------------------------------------------------
    // Bindings
    // -----------------------------------------------------------------------

    /// Create a binding in a declarative environment; redeclaration is a
    /// `SyntaxError`.
    pub(crate) fn declare_binding(
        &mut self,
        env: EnvironmentHandle,
        name: &str,
        slot: BindingSlot,
    ) -> EngineResult<()> {
        if self.env_ref(env)?.bindings.contains_key(name) {
            return Err(self.syntax_error(format!("Identifier '{name}' has already been declared")));
        }
        self.env_mut(env)?.bindings.insert(name.to_string(), slot);
        Ok(())
    }

    /// Hoist a `var` (or function) name; existing bindings are kept.
    pub(crate) fn declare_var(&mut self, env: EnvironmentHandle, name: &str) -> EngineResult<()> {
        let record = self.env_ref(env)?;
        if let Some(object) = record.object {
            let key = PropertyKey::from(name);
            if self.heap.get_own_property_descriptor(object, &key)?.is_none() {
                self.heap.define_property(
                    object,
                    key,
                    PropertyDescriptor::Data {
                        value: JsValue::Undefined,
                        writable: true,
                        enumerable: true,
                        configurable: false,
                    },
                )?;
            }
            return Ok(());
        }
        self.env_mut(env)?
            .bindings
            .entry(name.to_string())
            .or_insert_with(BindingSlot::new_hoisted);
        Ok(())
    }

    /// End the TDZ of a lexical binding declared in `env`.
    pub(crate) fn initialize_binding(
        &mut self,
        env: EnvironmentHandle,
        name: &str,
        value: JsValue,
    ) -> EngineResult<()> {
        if let Some(slot) = self.env_mut(env)?.bindings.get_mut(name) {
            slot.value = value;
            slot.initialized = true;
            return Ok(());
        }
        Err(self.reference_error(format!("{name} is not defined")))
    }

    /// Environment holding `name`, searching outwards from `env`.
    pub(crate) fn resolve_binding(
        &self,
        env: EnvironmentHandle,
        name: &str,
    ) -> EngineResult<Option<EnvironmentHandle>> {
        let mut current = Some(env);
        while let Some(handle) = current {
            let record = self.env_ref(handle)?;
            let found = match record.object {
                Some(object) => self
                    .heap
                    .lookup_property(object, &PropertyKey::from(name))?
                    .is_some(),
                None => record.bindings.contains_key(name),
            };
            if found {
                return Ok(Some(handle));
            }
            current = record.parent;
        }
        Ok(None)
    }

    pub(crate) fn get_binding_value(
        &mut self,
        env: EnvironmentHandle,
        name: &str,
    ) -> EngineResult<JsValue> {
        let Some(holder) = self.resolve_binding(env, name)? else {
            return Err(self.reference_error(format!("{name} is not defined")));
        };
        let record = self.env_ref(holder)?;
        if let Some(object) = record.object {
            return self.get_from(object, &PropertyKey::from(name), &JsValue::Object(object));
        }
        let slot = record
            .bindings
            .get(name)
            .map(|slot| (slot.initialized, slot.value.clone()));
        match slot {
            Some((true, value)) => Ok(value),
            _ => Err(self.reference_error(format!("Cannot access '{name}' before initialization"))),
        }
    }

    /// Strict-mode assignment to an identifier.
    pub(crate) fn set_binding_value(
        &mut self,
        env: EnvironmentHandle,
        name: &str,
        value: JsValue,
    ) -> EngineResult<()> {
        let Some(holder) = self.resolve_binding(env, name)? else {
            return Err(self.reference_error(format!("{name} is not defined")));
        };
        let record = self.env_ref(holder)?;
        if let Some(object) = record.object {
            return self.set_property(&JsValue::Object(object), PropertyKey::from(name), value);
        }
        let state = record
            .bindings
            .get(name)
            .map(|slot| (slot.initialized, slot.mutable));
        match state {
            Some((false, _)) | None => {
                Err(self.reference_error(format!("Cannot access '{name}' before initialization")))
            }
            Some((true, false)) => Err(self.type_error("Assignment to constant variable.")),
            Some((true, true)) => {
                if let Some(slot) = self.env_mut(holder)?.bindings.get_mut(name) {
                    slot.value = value;
                }
                Ok(())
            }
        }
    }

    /// The environment that provides `this` for code running in `env`.
    pub(crate) fn this_environment(&self, env: EnvironmentHandle) -> EngineResult<EnvironmentHandle> {
        let mut current = env;
        loop {
            let record = self.env_ref(current)?;
            if record.this_binding != ThisBinding::Lexical {
                return Ok(current);
            }
            match record.parent {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
    }

    pub(crate) fn this_value(&mut self, env: EnvironmentHandle) -> EngineResult<JsValue> {
        let holder = self.this_environment(env)?;
        match &self.env_ref(holder)?.this_binding {
            ThisBinding::Bound(value) => Ok(value.clone()),
            ThisBinding::Lexical => Ok(JsValue::Undefined),
            ThisBinding::Uninitialized => Err(self.reference_error(
                "Must call super constructor in derived class before accessing 'this' or returning from derived constructor",
            )),
        }
    }

    /// Nearest scope table visible from `env`.
    pub(crate) fn scope_table_of(&self, env: EnvironmentHandle) -> EngineResult<Option<ScopeTableId>> {
        let mut current = Some(env);
        while let Some(handle) = current {
            let record = self.env_ref(handle)?;
            if record.scope_table.is_some() {
                return Ok(record.scope_table);
            }
            current = record.parent;
        }
        Ok(None)
    }

    pub(crate) fn new_scope_table(&mut self, table: ScopeTable) -> ScopeTableId {
        self.scope_tables.push(table);
        self.scope_tables.len() - 1
    }

    /// Read a captured binding, resolving a pending entry through its session.
    pub(crate) fn scope_entry_value(&mut self, table: ScopeTableId, name: &str) -> EngineResult<JsValue> {
        let (entry, session) = match self.scope_tables.get(table) {
            Some(scope) => (scope.entries.get(name).cloned(), scope.session),
            None => return Err(self.reference_error(format!("{name} is not defined"))),
        };
        match entry {
            Some(ScopeEntry::Resolved(value)) => Ok(value),
            Some(ScopeEntry::Pending(serialized)) => {
                let session = session.ok_or_else(|| {
                    EngineError::invalid_envelope(format!(
                        "captured binding `{name}` outlived its reconstruction session"
                    ))
                })?;
                let value = self.session_resolve(session, &serialized)?;
                if let Some(scope) = self.scope_tables.get_mut(table) {
                    scope
                        .entries
                        .insert(name.to_string(), ScopeEntry::Resolved(value.clone()));
                }
                Ok(value)
            }
            None => Err(self.reference_error(format!("{name} is not defined"))),
        }
    }

    pub(crate) fn set_scope_entry(&mut self, table: ScopeTableId, name: &str, value: JsValue) -> EngineResult<()> {
        let known = self
            .scope_tables
            .get(table)
            .is_some_and(|scope| scope.entries.contains_key(name));
        if !known {
            return Err(self.reference_error(format!("{name} is not defined")));
        }
        if let Some(scope) = self.scope_tables.get_mut(table) {
            scope
                .entries
                .insert(name.to_string(), ScopeEntry::Resolved(value));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Object allocation
    // -----------------------------------------------------------------------

    pub(crate) fn create_object(&mut self) -> ObjectHandle {
        self.heap
            .alloc(Some(self.intrinsics.object_prototype), ObjectKind::Ordinary)
    }

    pub(crate) fn create_array(&mut self, items: Vec<JsValue>) -> EngineResult<ObjectHandle> {
        let array = self
            .heap
            .alloc(Some(self.intrinsics.array_prototype), ObjectKind::Array);
        self.heap.define_property(
            array,
            PropertyKey::from("length"),
            PropertyDescriptor::Data {
                value: JsValue::Number(0.0),
                writable: true,
                enumerable: false,
                configurable: false,
            },
        )?;
        for (index, item) in items.into_iter().enumerate() {
            self.heap.define_property(
                array,
                PropertyKey::String(index.to_string()),
                PropertyDescriptor::data(item),
            )?;
        }
        Ok(array)
    }

    /// Elements `0..length` of an array-like object.
    pub(crate) fn array_items(&mut self, array: ObjectHandle) -> EngineResult<Vec<JsValue>> {
        let base = JsValue::Object(array);
        let length = self.get_property(&base, &PropertyKey::from("length"))?;
        let length = self.to_number(&length)?;
        let length = if length.is_finite() && length > 0.0 { length as usize } else { 0 };
        let length = self.check_materialized_length(length, "array length")?;
        let mut items = Vec::with_capacity(length);
        for index in 0..length {
            items.push(self.get_property(&base, &PropertyKey::String(index.to_string()))?);
        }
        Ok(items)
    }

    /// Refuse to build more than `max_array_length` elements or bytes.
    pub(crate) fn check_materialized_length(&mut self, length: usize, what: &str) -> EngineResult<usize> {
        let limit = self.config.max_array_length;
        if length > limit {
            return Err(self.range_error(format!("Invalid {what}: {length} exceeds the limit of {limit}")));
        }
        Ok(length)
    }

    /// Error object with the given kind's prototype and an own `message`.
    pub(crate) fn create_error(&mut self, kind: ErrorKind, message: &str) -> ObjectHandle {
        let prototype = self.intrinsics.error_prototype_for(kind);
        let error = self.heap.alloc(Some(prototype), ObjectKind::Error);
        if let Ok(object) = self.heap.get_mut(error) {
            object.define_own_property(
                PropertyKey::from("message"),
                PropertyDescriptor::hidden(JsValue::str(message)),
            );
            object.define_own_property(
                PropertyKey::from("stack"),
                PropertyDescriptor::hidden(JsValue::str(format!(
                    "{}: {message}\n    at <script>",
                    kind.name()
                ))),
            );
        }
        error
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    pub(crate) fn throw_error(&mut self, kind: ErrorKind, message: impl Into<String>) -> EngineError {
        let message = message.into();
        let error = self.create_error(kind, &message);
        EngineError::Thrown {
            value: JsValue::Object(error),
            message: format!("{}: {message}", kind.name()),
        }
    }

    pub(crate) fn type_error(&mut self, message: impl Into<String>) -> EngineError {
        self.throw_error(ErrorKind::TypeError, message)
    }

    pub(crate) fn reference_error(&mut self, message: impl Into<String>) -> EngineError {
        self.throw_error(ErrorKind::ReferenceError, message)
    }

    pub(crate) fn range_error(&mut self, message: impl Into<String>) -> EngineError {
        self.throw_error(ErrorKind::RangeError, message)
    }

    pub(crate) fn syntax_error(&mut self, message: impl Into<String>) -> EngineError {
        self.throw_error(ErrorKind::SyntaxError, message)
    }

    /// `throw value` from script.
    pub(crate) fn throw_value(&self, value: JsValue) -> EngineError {
        let message = self.describe_thrown(&value);
        EngineError::Thrown { value, message }
    }

    /// `Name: message` for error-like objects, the display form otherwise.
    /// Reads data properties only, so describing never runs script.
    pub(crate) fn describe_thrown(&self, value: &JsValue) -> String {
        if let JsValue::Object(handle) = value {
            let read = |key: &str| -> Option<String> {
                match self.heap.lookup_property(*handle, &PropertyKey::from(key)) {
                    Ok(Some((_, PropertyDescriptor::Data { value: JsValue::Str(s), .. }))) => Some(s),
                    _ => None,
                }
            };
            if let (Some(name), Some(message)) = (read("name"), read("message")) {
                return if message.is_empty() { name } else { format!("{name}: {message}") };
            }
        }
        self.display_value(value)
    }

    /// Script-visible value for an error caught by `try`/`catch`.
    pub(crate) fn error_to_value(&mut self, error: EngineError) -> JsValue {
        match error {
            EngineError::Thrown { value, .. } => value,
            EngineError::CallDepthExceeded { max } => JsValue::Object(self.create_error(
                ErrorKind::RangeError,
                &format!("Maximum call stack size exceeded ({max})"),
            )),
            EngineError::ObjectModel(inner) => {
                JsValue::Object(self.create_error(ErrorKind::TypeError, &inner.to_string()))
            }
            other => {
                let message = format!("{}: {other}", other.stable_code());
                JsValue::Object(self.create_error(ErrorKind::Error, &message))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Property access
    // -----------------------------------------------------------------------

    /// Prototype used for property lookups on a primitive.
    fn primitive_prototype(&self, value: &JsValue) -> Option<ObjectHandle> {
        match value {
            JsValue::Bool(_) => Some(self.intrinsics.boolean_prototype),
            JsValue::Number(_) => Some(self.intrinsics.number_prototype),
            JsValue::BigInt(_) => Some(self.intrinsics.bigint_prototype),
            JsValue::Str(_) => Some(self.intrinsics.string_prototype),
            JsValue::Symbol(_) => Some(self.intrinsics.symbol_prototype),
            _ => None,
        }
    }

    /// `base[key]` for any base value.
    pub(crate) fn get_property(&mut self, base: &JsValue, key: &PropertyKey) -> EngineResult<JsValue> {
        match base {
            JsValue::Object(handle) => self.get_from(*handle, key, base),
            JsValue::Undefined | JsValue::Null => Err(self.type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                self.display_value(base),
                self.key_display(key)
            ))),
            JsValue::Str(text) => {
                if key.as_str() == Some("length") {
                    return Ok(JsValue::Number(text.encode_utf16().count() as f64));
                }
                if let Some(index) = key.as_array_index() {
                    let unit = text.encode_utf16().nth(index as usize);
                    return Ok(match unit {
                        Some(unit) => JsValue::Str(String::from_utf16_lossy(&[unit])),
                        None => JsValue::Undefined,
                    });
                }
                let prototype = self.intrinsics.string_prototype;
                self.get_from(prototype, key, base)
            }
            _ => match self.primitive_prototype(base) {
                Some(prototype) => self.get_from(prototype, key, base),
                None => Ok(JsValue::Undefined),
            },
        }
    }

    /// `[[Get]]` starting at `start` with `receiver` as `this` for getters.
    pub(crate) fn get_from(
        &mut self,
        start: ObjectHandle,
        key: &PropertyKey,
        receiver: &JsValue,
    ) -> EngineResult<JsValue> {
        if let Some(index) = key.as_array_index()
            && let Some(byte) = self.typed_array_index(start, index)?
        {
            return Ok(byte);
        }
        match self.heap.lookup_property(start, key)? {
            Some((_, PropertyDescriptor::Data { value, .. })) => Ok(value),
            Some((_, PropertyDescriptor::Accessor { get: Some(getter), .. })) => {
                self.call(&JsValue::Object(getter), receiver.clone(), Vec::new())
            }
            Some((_, PropertyDescriptor::Accessor { get: None, .. })) | None => Ok(JsValue::Undefined),
        }
    }

    /// Element read of a `Uint8Array`; `None` when `target` is not one.
    fn typed_array_index(&self, target: ObjectHandle, index: u32) -> EngineResult<Option<JsValue>> {
        let ObjectKind::Uint8Array {
            buffer,
            byte_offset,
            length,
        } = self.heap.kind(target)?
        else {
            return Ok(None);
        };
        if index as usize >= *length {
            return Ok(Some(JsValue::Undefined));
        }
        let byte = match self.heap.kind(*buffer)? {
            ObjectKind::ArrayBuffer(data) if !data.detached => {
                data.bytes.get(byte_offset + index as usize).copied()
            }
            _ => None,
        };
        Ok(Some(match byte {
            Some(byte) => JsValue::Number(f64::from(byte)),
            None => JsValue::Undefined,
        }))
    }

    /// Strict-mode `base[key] = value`.
    pub(crate) fn set_property(&mut self, base: &JsValue, key: PropertyKey, value: JsValue) -> EngineResult<()> {
        let JsValue::Object(target) = base else {
            let shown = self.display_value(base);
            let key = self.key_display(&key);
            return Err(if base.is_nullish() {
                self.type_error(format!("Cannot set properties of {shown} (setting '{key}')"))
            } else {
                self.type_error(format!("Cannot create property '{key}' on {shown}"))
            });
        };
        let target = *target;
        if let Some(index) = key.as_array_index()
            && matches!(self.heap.kind(target)?, ObjectKind::Uint8Array { .. })
        {
            let number = self.to_number(&value)?;
            return self.write_typed_array(target, index, number);
        }
        match self.heap.lookup_property(target, &key)? {
            Some((holder, PropertyDescriptor::Data { writable, enumerable, configurable, .. })) => {
                if !writable {
                    let key = self.key_display(&key);
                    return Err(self.type_error(format!(
                        "Cannot assign to read only property '{key}' of object"
                    )));
                }
                if holder == target {
                    let desc = PropertyDescriptor::Data {
                        value,
                        writable,
                        enumerable,
                        configurable,
                    };
                    return self.define_or_throw(target, key, desc);
                }
                self.create_data_property(target, key, value)
            }
            Some((_, PropertyDescriptor::Accessor { set: Some(setter), .. })) => {
                self.call(&JsValue::Object(setter), base.clone(), vec![value])?;
                Ok(())
            }
            Some((_, PropertyDescriptor::Accessor { set: None, .. })) => {
                let key = self.key_display(&key);
                Err(self.type_error(format!(
                    "Cannot set property {key} of #<Object> which has only a getter"
                )))
            }
            None => self.create_data_property(target, key, value),
        }
    }

    fn write_typed_array(&mut self, view: ObjectHandle, index: u32, number: f64) -> EngineResult<()> {
        let ObjectKind::Uint8Array {
            buffer,
            byte_offset,
            length,
        } = self.heap.kind(view)?.clone()
        else {
            return Ok(());
        };
        if index as usize >= length {
            return Ok(());
        }
        let byte = if number.is_finite() { (number.trunc() as i64).rem_euclid(256) as u8 } else { 0 };
        if let ObjectKind::ArrayBuffer(data) = &mut self.heap.get_mut(buffer)?.kind
            && let Some(slot) = data.bytes.get_mut(byte_offset + index as usize)
        {
            *slot = byte;
        }
        Ok(())
    }

    /// `CreateDataPropertyOrThrow`.
    pub(crate) fn create_data_property(
        &mut self,
        target: ObjectHandle,
        key: PropertyKey,
        value: JsValue,
    ) -> EngineResult<()> {
        self.define_or_throw(target, key, PropertyDescriptor::data(value))
    }

    /// `DefinePropertyOrThrow`.
    pub(crate) fn define_or_throw(
        &mut self,
        target: ObjectHandle,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> EngineResult<()> {
        let extensible = self.heap.is_extensible(target)?;
        let exists = self.heap.get_own_property_descriptor(target, &key)?.is_some();
        if self.heap.define_property(target, key.clone(), desc)? {
            return Ok(());
        }
        let key = self.key_display(&key);
        Err(if !exists && !extensible {
            self.type_error(format!("Cannot add property {key}, object is not extensible"))
        } else {
            self.type_error(format!("Cannot redefine property: {key}"))
        })
    }

    /// Strict-mode `delete base[key]`.
    pub(crate) fn delete_property(&mut self, base: &JsValue, key: &PropertyKey) -> EngineResult<bool> {
        match base {
            JsValue::Object(target) => {
                if self.heap.delete_property(*target, key)? {
                    Ok(true)
                } else {
                    let key = self.key_display(key);
                    Err(self.type_error(format!("Cannot delete property '{key}' of object")))
                }
            }
            JsValue::Undefined | JsValue::Null => {
                Err(self.type_error("Cannot convert undefined or null to object"))
            }
            _ => Ok(true),
        }
    }

    pub(crate) fn has_property(&self, target: ObjectHandle, key: &PropertyKey) -> EngineResult<bool> {
        if let Some(index) = key.as_array_index()
            && let ObjectKind::Uint8Array { length, .. } = self.heap.kind(target)?
        {
            return Ok((index as usize) < *length);
        }
        Ok(self.heap.lookup_property(target, key)?.is_some())
    }

    /// Property key as scripts print it.
    pub(crate) fn key_display(&self, key: &PropertyKey) -> String {
        match key {
            PropertyKey::String(s) => s.clone(),
            PropertyKey::Symbol(id) => {
                format!("Symbol({})", self.symbols.description(*id).unwrap_or(""))
            }
        }
    }

    /// `get` on the value's `prototype` property, falling back to `fallback`
    /// when it is not an object.
    pub(crate) fn prototype_from_constructor(
        &mut self,
        constructor: Option<ObjectHandle>,
        fallback: ObjectHandle,
    ) -> EngineResult<ObjectHandle> {
        let Some(constructor) = constructor else {
            return Ok(fallback);
        };
        let prototype = self.get_from(
            constructor,
            &PropertyKey::from("prototype"),
            &JsValue::Object(constructor),
        )?;
        Ok(prototype.as_object().unwrap_or(fallback))
    }

    // -----------------------------------------------------------------------
    // Type conversion
    // -----------------------------------------------------------------------

    pub fn type_of(&self, value: &JsValue) -> &'static str {
        match value {
            JsValue::Undefined => "undefined",
            JsValue::Null => "object",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::BigInt(_) => "bigint",
            JsValue::Str(_) => "string",
            JsValue::Symbol(_) => "symbol",
            JsValue::Object(handle) => {
                if self.heap.is_function(*handle) {
                    "function"
                } else {
                    "object"
                }
            }
        }
    }

    pub(crate) fn is_callable(&self, value: &JsValue) -> bool {
        value.as_object().is_some_and(|h| self.heap.is_function(h))
    }

    pub(crate) fn is_constructor(&self, value: &JsValue) -> bool {
        let Some(handle) = value.as_object() else {
            return false;
        };
        match self.heap.kind(handle) {
            Ok(ObjectKind::Function(FunctionBehavior::Script { node, .. })) => {
                node.kind.is_constructable()
            }
            Ok(ObjectKind::Function(FunctionBehavior::Class { .. })) => true,
            Ok(ObjectKind::Function(FunctionBehavior::Native { id, .. })) => id.is_constructor(),
            _ => false,
        }
    }

    pub(crate) fn to_boolean(&self, value: &JsValue) -> bool {
        match value {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::BigInt(n) => *n != 0,
            JsValue::Str(s) => !s.is_empty(),
            JsValue::Symbol(_) | JsValue::Object(_) => true,
        }
    }

    pub(crate) fn to_primitive(&mut self, value: &JsValue, hint: PrimitiveHint) -> EngineResult<JsValue> {
        let JsValue::Object(handle) = value else {
            return Ok(value.clone());
        };
        let order = match hint {
            PrimitiveHint::Number => ["valueOf", "toString"],
            PrimitiveHint::String => ["toString", "valueOf"],
        };
        for name in order {
            let method = self.get_from(*handle, &PropertyKey::from(name), value)?;
            if self.is_callable(&method) {
                let result = self.call(&method, value.clone(), Vec::new())?;
                if !result.is_object() {
                    return Ok(result);
                }
            }
        }
        Err(self.type_error("Cannot convert object to primitive value"))
    }

    pub(crate) fn to_number(&mut self, value: &JsValue) -> EngineResult<f64> {
        match value {
            JsValue::Undefined => Ok(f64::NAN),
            JsValue::Null => Ok(0.0),
            JsValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            JsValue::Number(n) => Ok(*n),
            JsValue::Str(s) => Ok(string_to_number(s)),
            JsValue::BigInt(_) => Err(self.type_error("Cannot convert a BigInt value to a number")),
            JsValue::Symbol(_) => Err(self.type_error("Cannot convert a Symbol value to a number")),
            JsValue::Object(_) => {
                let primitive = self.to_primitive(value, PrimitiveHint::Number)?;
                self.to_number(&primitive)
            }
        }
    }

    /// `ToNumeric`: a `Number` or a `BigInt`.
    pub(crate) fn to_numeric(&mut self, value: &JsValue) -> EngineResult<JsValue> {
        let primitive = self.to_primitive(value, PrimitiveHint::Number)?;
        if let JsValue::BigInt(_) = primitive {
            return Ok(primitive);
        }
        Ok(JsValue::Number(self.to_number(&primitive)?))
    }

    pub(crate) fn to_js_string(&mut self, value: &JsValue) -> EngineResult<String> {
        match value {
            JsValue::Undefined => Ok("undefined".to_string()),
            JsValue::Null => Ok("null".to_string()),
            JsValue::Bool(b) => Ok(b.to_string()),
            JsValue::Number(n) => Ok(number_to_string(*n)),
            JsValue::BigInt(n) => Ok(n.to_string()),
            JsValue::Str(s) => Ok(s.clone()),
            JsValue::Symbol(_) => Err(self.type_error("Cannot convert a Symbol value to a string")),
            JsValue::Object(_) => {
                let primitive = self.to_primitive(value, PrimitiveHint::String)?;
                self.to_js_string(&primitive)
            }
        }
    }

    pub(crate) fn to_property_key(&mut self, value: &JsValue) -> EngineResult<PropertyKey> {
        let primitive = self.to_primitive(value, PrimitiveHint::String)?;
        match primitive {
            JsValue::Symbol(id) => Ok(PropertyKey::Symbol(id)),
            other => Ok(PropertyKey::String(self.to_js_string(&other)?)),
        }
    }

    /// `ToObject`: primitives become wrapper objects.
    pub(crate) fn to_object(&mut self, value: &JsValue) -> EngineResult<ObjectHandle> {
        match value {
            JsValue::Object(handle) => Ok(*handle),
            JsValue::Undefined | JsValue::Null => {
                Err(self.type_error("Cannot convert undefined or null to object"))
            }
            primitive => {
                let prototype = self.primitive_prototype(primitive);
                Ok(self
                    .heap
                    .alloc(prototype, ObjectKind::PrimitiveWrapper(primitive.clone())))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Display
    // -----------------------------------------------------------------------

    /// Console-style rendering of a value.
    pub fn display_value(&self, value: &JsValue) -> String {
        let mut seen = Vec::new();
        self.display_nested(value, 0, &mut seen, true)
    }

    fn display_nested(&self, value: &JsValue, depth: usize, seen: &mut Vec<ObjectHandle>, top: bool) -> String {
        match value {
            JsValue::Str(s) if top => s.clone(),
            JsValue::Str(s) => format!("'{s}'"),
            JsValue::Symbol(id) => format!("Symbol({})", self.symbols.description(*id).unwrap_or("")),
            JsValue::Object(handle) => {
                if seen.contains(handle) {
                    return "[Circular]".to_string();
                }
                let Ok(object) = self.heap.get(*handle) else {
                    return "[object]".to_string();
                };
                let name = || match object.get_own_property(&PropertyKey::from("name")) {
                    Some(PropertyDescriptor::Data { value: JsValue::Str(s), .. }) if !s.is_empty() => {
                        s.clone()
                    }
                    _ => "(anonymous)".to_string(),
                };
                match &object.kind {
                    ObjectKind::Function(FunctionBehavior::Class { .. }) => return format!("[class {}]", name()),
                    ObjectKind::Function(_) => return format!("[Function: {}]", name()),
                    ObjectKind::Error => return self.describe_thrown(value),
                    ObjectKind::Date(ms) => return format!("Date({})", number_to_string(*ms)),
                    ObjectKind::RegExp { source, flags } => return format!("/{source}/{flags}"),
                    ObjectKind::PrimitiveWrapper(inner) => {
                        return format!("[{}]", self.display_nested(inner, depth, seen, false));
                    }
                    ObjectKind::Promise(state) => {
                        return match state {
                            crate::object_model::PromiseState::Pending => "Promise { <pending> }".to_string(),
                            crate::object_model::PromiseState::Fulfilled(v) => {
                                format!("Promise {{ {} }}", self.display_nested(v, depth + 1, seen, false))
                            }
                            crate::object_model::PromiseState::Rejected(v) => {
                                format!("Promise {{ <rejected> {} }}", self.display_nested(v, depth + 1, seen, false))
                            }
                        };
                    }
                    _ => {}
                }
                if depth > 2 {
                    return "[Object]".to_string();
                }
                seen.push(*handle);
                let rendered = match &object.kind {
                    ObjectKind::Array => {
                        let length = object.array_length();
                        let shown = length.min(DISPLAY_ITEMS);
                        let mut items: Vec<String> = (0..shown)
                            .map(|i| match object.get_own_property(&PropertyKey::String(i.to_string())) {
                                Some(PropertyDescriptor::Data { value, .. }) => {
                                    self.display_nested(value, depth + 1, seen, false)
                                }
                                _ => "<empty>".to_string(),
                            })
                            .collect();
                        if length > shown {
                            items.push(format!("... {} more items", length - shown));
                        }
                        format!("[{}]", items.join(", "))
                    }
                    ObjectKind::Map(entries) => {
                        let items: Vec<String> = entries
                            .iter()
                            .map(|(k, v)| {
                                format!(
                                    "{} => {}",
                                    self.display_nested(&k.to_value(), depth + 1, seen, false),
                                    self.display_nested(v, depth + 1, seen, false)
                                )
                            })
                            .collect();
                        format!("Map({}) {{{}}}", entries.len(), items.join(", "))
                    }
                    ObjectKind::Set(elements) => {
                        let items: Vec<String> = elements
                            .iter()
                            .map(|k| self.display_nested(&k.to_value(), depth + 1, seen, false))
                            .collect();
                        format!("Set({}) {{{}}}", elements.len(), items.join(", "))
                    }
                    _ => {
                        let items: Vec<String> = object
                            .own_property_entries()
                            .into_iter()
                            .filter(|(_, desc)| desc.is_enumerable())
                            .map(|(key, desc)| {
                                let shown = match &desc {
                                    PropertyDescriptor::Data { value, .. } => {
                                        self.display_nested(value, depth + 1, seen, false)
                                    }
                                    PropertyDescriptor::Accessor { .. } => "[Getter/Setter]".to_string(),
                                };
                                format!("{}: {shown}", self.key_display(&key))
                            })
                            .collect();
                        if items.is_empty() {
                            "{}".to_string()
                        } else {
                            format!("{{ {} }}", items.join(", "))
                        }
                    }
                };
                seen.pop();
                rendered
            }
            other => other.to_string(),
        }
    }
}

fn unknown_environment(env: EnvironmentHandle) -> EngineError {
    EngineError::ObjectModel(ObjectError::TypeError(format!(
        "environment #{} does not exist",
        env.0
    )))
}

/// `ToNumber` applied to a string.
pub(crate) fn string_to_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let lower = trimmed.to_ascii_lowercase();
    for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if let Some(digits) = lower.strip_prefix(prefix) {
            return u64::from_str_radix(digits, radix).map_or(f64::NAN, |n| n as f64);
        }
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if lower.contains("inf") || lower.contains("nan") => f64::NAN,
        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realm() -> Realm {
        Realm::new(EngineConfig::default()).expect("realm")
    }

    #[test]
    fn string_conversion_follows_script_rules() {
        assert_eq!(string_to_number("  42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x1f"), 31.0);
        assert!(string_to_number("12px").is_nan());
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
        assert!(string_to_number("inf").is_nan());
    }

    #[test]
    fn lexical_bindings_start_in_the_dead_zone() {
        let mut realm = realm();
        let env = realm.new_env(Some(realm.script_env), EnvironmentKind::Declarative);
        realm
            .declare_binding(env, "x", BindingSlot::new_lexical(true))
            .expect("declare");
        let err = realm.get_binding_value(env, "x").expect_err("tdz");
        assert!(err.to_string().contains("before initialization"));
        realm
            .initialize_binding(env, "x", JsValue::Number(1.0))
            .expect("init");
        assert_eq!(realm.get_binding_value(env, "x").expect("read"), JsValue::Number(1.0));
    }

    #[test]
    fn constant_bindings_reject_assignment() {
        let mut realm = realm();
        let env = realm.new_env(Some(realm.script_env), EnvironmentKind::Declarative);
        realm
            .declare_binding(env, "k", BindingSlot::new_initialized(JsValue::Null, false))
            .expect("declare");
        let err = realm
            .set_binding_value(env, "k", JsValue::Bool(true))
            .expect_err("const");
        assert!(err.to_string().contains("constant"));
        let again = realm
            .declare_binding(env, "k", BindingSlot::new_hoisted())
            .expect_err("redeclare");
        assert!(again.to_string().contains("already been declared"));
    }

    #[test]
    fn unresolved_names_are_reference_errors() {
        let mut realm = realm();
        let err = realm.get_global("nope").expect_err("missing");
        assert_eq!(err.stable_code(), "FE-SER-5001");
        assert!(err.to_string().contains("ReferenceError: nope is not defined"));
    }

    #[test]
    fn global_host_root_is_registered_at_startup() {
        let realm = realm();
        assert_eq!(realm.host_paths().path_of(realm.global_object()), Some("globalThis"));
        assert!(realm.host_paths().len() > 50);
        assert_eq!(realm.events()[0].event, "register_host_root");
    }

    #[test]
    fn uint8_array_elements_read_the_backing_buffer() {
        let mut realm = realm();
        let value = realm
            .eval_script("const b = new Uint8Array(4); b[1] = 257; b[2] = -1; [b[1], b[2], b[9], b.length]")
            .expect("eval");
        let array = value.as_object().expect("array");
        let items = realm.array_items(array).expect("items");
        assert_eq!(
            items,
            vec![
                JsValue::Number(1.0),
                JsValue::Number(255.0),
                JsValue::Undefined,
                JsValue::Number(4.0)
            ]
        );
    }

    #[test]
    fn display_renders_nested_values() {
        let mut realm = realm();
        let value = realm
            .eval_script("const o = { a: [1, 'x'], m: new Map([[1, 2]]) }; o.self = o; o")
            .expect("eval");
        assert_eq!(
            realm.display_value(&value),
            "{ a: [1, 'x'], m: Map(1) {1 => 2}, self: [Circular] }"
        );
    }
}
