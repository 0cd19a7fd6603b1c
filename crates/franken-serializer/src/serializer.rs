//! Heap serializer.
//!
//! Walks a live value depth-first and emits one heap entry per distinct
//! object-like value.  A placeholder is stored under an object's reference
//! before its structure is visited, so cycles resolve to the same id; every
//! placeholder must be replaced by the time the pass finishes.
//!
//! The same walk, run in stop mode with a root path, populates the realm's
//! host-path table (`register_host_root`).

use std::rc::Rc;

use indexmap::IndexMap;

use crate::encoders::{EncodeContext, EncoderRegistry, HeapEncoder};
use crate::envelope::{Envelope, HeapEntry, HeapSlot, NOT_SPECIAL, SerializedDescriptor, SerializedValue};
use crate::error::{EngineError, EngineResult};
use crate::host_paths::PathStep;
use crate::intrinsics::number_to_json;
use crate::object_model::{FunctionBehavior, JsValue, ObjectHandle, ObjectKind, PropertyDescriptor, PropertyKey};
use crate::realm::Realm;

/// Options for [`Realm::serialize`].
#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    /// Entries from an earlier call; objects already present are not
    /// serialized again.
    pub heap: Option<IndexMap<String, HeapEntry>>,
    /// Access path of the root value as seen from a host root.
    pub host_object_path: Option<String>,
    /// Replace values with no derivable host path, and script-defined
    /// functions, with `manual-stop`.
    pub stop_if_unreachable_from_host: bool,
}

/// State of one serialization call.
pub struct SerializePass<'r> {
    realm: &'r mut Realm,
    encoders: Rc<EncoderRegistry>,
    heap: IndexMap<String, HeapSlot>,
    stop: bool,
}

impl<'r> SerializePass<'r> {
    pub(crate) fn new(realm: &'r mut Realm, heap: Option<IndexMap<String, HeapEntry>>, stop: bool) -> Self {
        let encoders = Rc::clone(&realm.encoders);
        let heap = heap
            .unwrap_or_default()
            .into_iter()
            .map(|(reference, entry)| (reference, HeapSlot::Done(entry)))
            .collect();
        Self {
            realm,
            encoders,
            heap,
            stop,
        }
    }

    pub(crate) fn realm(&mut self) -> &mut Realm {
        self.realm
    }

    /// Serialize `root` and close the heap.
    pub(crate) fn run(mut self, root: &JsValue, path: Option<&str>) -> EngineResult<Envelope> {
        let serialized = self.value(root, path)?;
        let mut heap = IndexMap::with_capacity(self.heap.len());
        for (reference, slot) in self.heap {
            match slot {
                HeapSlot::Done(entry) => {
                    heap.insert(reference, entry);
                }
                HeapSlot::Placeholder => return Err(EngineError::UnresolvedPlaceholder { reference }),
            }
        }
        Ok(Envelope { heap, serialized })
    }

    /// Serialize a value reached from a parent whose path is `parent_path`.
    pub(crate) fn child(
        &mut self,
        value: &JsValue,
        parent_path: Option<&str>,
        step: &PathStep,
    ) -> EngineResult<SerializedValue> {
        let path = step.apply(parent_path);
        if self.stop && path.is_none() && value.is_object() {
            return Ok(SerializedValue::ManualStop);
        }
        self.value(value, path.as_deref())
    }

    fn value(&mut self, value: &JsValue, path: Option<&str>) -> EngineResult<SerializedValue> {
        Ok(match value {
            JsValue::Undefined => SerializedValue::Undefined,
            JsValue::Null => SerializedValue::simple(serde_json::Value::Null),
            JsValue::Bool(b) => SerializedValue::simple(*b),
            JsValue::Str(s) => SerializedValue::simple(s.as_str()),
            JsValue::Number(n) => number(*n),
            JsValue::BigInt(n) => SerializedValue::Bigint {
                value_string: n.to_string(),
            },
            JsValue::Symbol(symbol) => match self.realm.symbols.key_for(*symbol) {
                Some(key) => SerializedValue::RegisteredSymbol { key: key.to_string() },
                None => SerializedValue::UnregisteredSymbol {
                    reference: self.realm.references.symbol_reference(*symbol),
                    description: self.realm.symbols.description(*symbol).map(str::to_string),
                },
            },
            JsValue::Object(object) => self.object(*object, path)?,
        })
    }

    fn object(&mut self, object: ObjectHandle, path: Option<&str>) -> EngineResult<SerializedValue> {
        if let Some(known) = self.realm.host_paths.path_of(object) {
            return Ok(SerializedValue::HostObject {
                path: known.to_string(),
            });
        }
        if self.stop && self.is_script_function(object) {
            return Ok(SerializedValue::ManualStop);
        }
        if let Some(path) = path {
            self.realm.host_paths.record(object, path);
        }
        let reference = self.realm.references.object_reference(object);
        if !self.heap.contains_key(&reference) {
            self.heap.insert(reference.clone(), HeapSlot::Placeholder);
            let entry = self.entry(object, &reference, path)?;
            self.heap.insert(reference.clone(), HeapSlot::Done(entry));
        }
        Ok(SerializedValue::object_like(reference))
    }

    fn is_script_function(&self, object: ObjectHandle) -> bool {
        matches!(
            self.realm.heap.kind(object),
            Ok(ObjectKind::Function(FunctionBehavior::Script { .. } | FunctionBehavior::Class { .. }))
        )
    }

    fn entry(&mut self, object: ObjectHandle, reference: &str, path: Option<&str>) -> EngineResult<HeapEntry> {
        let encoders = Rc::clone(&self.encoders);
        let matching = encoders.matching(&*self.realm, object);
        if matching.len() > 1 {
            return Err(EngineError::AmbiguousEncoder {
                reference: reference.to_string(),
                candidates: matching.iter().map(|encoder| encoder.object_type().to_string()).collect(),
            });
        }
        let encoder: Option<&dyn HeapEncoder> = matching.first().copied();

        let mut own_properties = Vec::new();
        for (key, desc) in self.realm.heap.own_property_entries(object)? {
            if encoder.is_some_and(|encoder| !encoder.property_filter(&key)) {
                continue;
            }
            let (key_value, steps) = self.key_steps(&key);
            let serialized_key = self.value(&key_value, None)?;
            let descriptor = match desc {
                PropertyDescriptor::Data {
                    value,
                    writable,
                    enumerable,
                    configurable,
                } => SerializedDescriptor {
                    value: Some(self.child(&value, path, &steps.value)?),
                    writable: Some(writable),
                    enumerable: Some(enumerable),
                    configurable: Some(configurable),
                    ..SerializedDescriptor::default()
                },
                PropertyDescriptor::Accessor {
                    get,
                    set,
                    enumerable,
                    configurable,
                } => {
                    let get = get.map_or(JsValue::Undefined, JsValue::Object);
                    let set = set.map_or(JsValue::Undefined, JsValue::Object);
                    SerializedDescriptor {
                        get: Some(self.child(&get, path, &steps.getter)?),
                        set: Some(self.child(&set, path, &steps.setter)?),
                        enumerable: Some(enumerable),
                        configurable: Some(configurable),
                        ..SerializedDescriptor::default()
                    }
                }
            };
            own_properties.push((serialized_key, descriptor));
        }

        let prototype = self
            .realm
            .heap
            .get_prototype_of(object)?
            .map_or(JsValue::Null, JsValue::Object);
        let prototype = self.child(&prototype, path, &PathStep::Prototype)?;

        let (object_type, data) = match encoder {
            Some(encoder) => {
                let mut cx = EncodeContext::new(self, path.map(str::to_string));
                (encoder.object_type().to_string(), encoder.encode(&mut cx, object)?)
            }
            None => (NOT_SPECIAL.to_string(), serde_json::Value::Null),
        };

        Ok(HeapEntry {
            object_type,
            prototype,
            is_extensible: self.realm.heap.is_extensible(object)?,
            own_properties,
            data,
        })
    }

    fn key_steps(&self, key: &PropertyKey) -> (JsValue, KeySteps) {
        match key {
            PropertyKey::String(name) => (
                JsValue::Str(name.clone()),
                KeySteps {
                    value: PathStep::Property(name.clone()),
                    getter: PathStep::Getter(name.clone()),
                    setter: PathStep::Setter(name.clone()),
                },
            ),
            PropertyKey::Symbol(symbol) => {
                let value = match self.realm.symbols.key_for(*symbol) {
                    Some(registered) => PathStep::RegisteredSymbolProperty(registered.to_string()),
                    None => PathStep::Unknown,
                };
                (
                    JsValue::Symbol(*symbol),
                    KeySteps {
                        value,
                        getter: PathStep::Unknown,
                        setter: PathStep::Unknown,
                    },
                )
            }
        }
    }
}

struct KeySteps {
    value: PathStep,
    getter: PathStep,
    setter: PathStep,
}

fn number(n: f64) -> SerializedValue {
    if n.is_nan() {
        SerializedValue::Nan
    } else if n == f64::INFINITY {
        SerializedValue::Infinity
    } else if n == f64::NEG_INFINITY {
        SerializedValue::NegativeInfinity
    } else if n == 0.0 && n.is_sign_negative() {
        SerializedValue::NegativeZero
    } else {
        SerializedValue::simple(number_to_json(n))
    }
}

impl Realm {
    /// Serialize `value` into a JSON-safe envelope.
    pub fn serialize(&mut self, value: &JsValue, options: SerializeOptions) -> EngineResult<Envelope> {
        let verify = self.config().verify_wire_format;
        let SerializeOptions {
            heap,
            host_object_path,
            stop_if_unreachable_from_host,
        } = options;
        let result = SerializePass::new(self, heap, stop_if_unreachable_from_host)
            .run(value, host_object_path.as_deref())
            .and_then(|envelope| {
                if verify {
                    envelope.check_json_safe()?;
                }
                Ok(envelope)
            });
        let detail = match &result {
            Ok(envelope) => format!("entries={}", envelope.heap.len()),
            Err(_) => "serialize".to_string(),
        };
        self.record_outcome("serializer", "serialize", &result, detail);
        result
    }

    /// Record host paths for everything reachable from `value` under `path`.
    /// Returns how many values gained a path.
    pub fn register_host_root(&mut self, value: &JsValue, path: &str) -> EngineResult<usize> {
        let before = self.host_paths.len();
        let result = SerializePass::new(self, None, true).run(value, Some(path));
        let result = result.map(|_| self.host_paths.len() - before);
        let detail = match &result {
            Ok(recorded) => format!("path={path} recorded={recorded}"),
            Err(_) => format!("path={path}"),
        };
        self.record_outcome("host_paths", "register_host_root", &result, detail);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn realm() -> Realm {
        Realm::new(EngineConfig::default()).expect("realm")
    }

    fn entry<'a>(envelope: &'a Envelope, value: &SerializedValue) -> &'a HeapEntry {
        let reference = value.reference().expect("object-like");
        &envelope.heap[reference]
    }

    #[test]
    fn special_numbers_are_tagged() {
        assert_eq!(number(f64::NAN), SerializedValue::Nan);
        assert_eq!(number(-0.0), SerializedValue::NegativeZero);
        assert_eq!(number(0.0), SerializedValue::simple(0));
        assert_eq!(number(f64::NEG_INFINITY), SerializedValue::NegativeInfinity);
        assert_eq!(number(1.5), SerializedValue::simple(1.5));
    }

    #[test]
    fn self_reference_resolves_to_its_own_entry() {
        let mut realm = realm();
        let obj = realm.eval_script("const o = { a: 1 }; o.self = o; o").expect("eval");
        let envelope = realm.serialize(&obj, SerializeOptions::default()).expect("serialize");
        assert_eq!(envelope.heap.len(), 1);
        let reference = envelope.serialized.reference().expect("root reference").to_string();
        let root = &envelope.heap[&reference];
        assert_eq!(root.object_type, NOT_SPECIAL);
        assert_eq!(root.own_properties[0].0, SerializedValue::simple("a"));
        assert_eq!(root.own_properties[0].1.value, Some(SerializedValue::simple(1)));
        assert_eq!(root.own_properties[1].1.value, Some(SerializedValue::object_like(reference)));
        assert!(matches!(root.prototype, SerializedValue::HostObject { .. }));
    }

    #[test]
    fn shared_objects_share_a_reference() {
        let mut realm = realm();
        let obj = realm.eval_script("const s = []; ({ a: s, b: s })").expect("eval");
        let envelope = realm.serialize(&obj, SerializeOptions::default()).expect("serialize");
        let root = entry(&envelope, &envelope.serialized);
        assert_eq!(root.own_properties[0].1.value, root.own_properties[1].1.value);
        assert_eq!(envelope.heap.len(), 2);
    }

    #[test]
    fn descriptors_keep_every_flag() {
        let mut realm = realm();
        let obj = realm
            .eval_script(
                "const o = {}; Object.defineProperty(o, 'k', { value: 3, writable: false, enumerable: false, configurable: false }); o",
            )
            .expect("eval");
        let envelope = realm.serialize(&obj, SerializeOptions::default()).expect("serialize");
        let (_, desc) = &entry(&envelope, &envelope.serialized).own_properties[0];
        assert_eq!(desc.writable, Some(false));
        assert_eq!(desc.enumerable, Some(false));
        assert_eq!(desc.configurable, Some(false));
        assert_eq!(desc.get, None);
    }

    #[test]
    fn uninstrumented_functions_are_rejected() {
        let mut realm = realm();
        let f = realm.eval_script("(x) => x + 1").expect("eval");
        let err = realm.serialize(&f, SerializeOptions::default()).expect_err("unregistered");
        assert_eq!(err.stable_code(), "FE-SER-1001");
        let last = realm.events().last().expect("event");
        assert_eq!(last.event, "serialize");
        assert_eq!(last.outcome, "deny");
    }

    #[test]
    fn host_objects_serialize_by_path() {
        let mut realm = realm();
        let map_ctor = realm.get_global("Map").expect("Map");
        let envelope = realm.serialize(&map_ctor, SerializeOptions::default()).expect("serialize");
        assert!(envelope.heap.is_empty());
        assert_eq!(
            envelope.serialized,
            SerializedValue::HostObject {
                path: r#"globalThis["Map"]"#.into()
            }
        );
    }

    #[test]
    fn host_root_registration_prunes_script_functions() {
        let mut realm = realm();
        let root = realm
            .eval_script("({ data: { n: 1 }, run: function () { return 1; } })")
            .expect("eval");
        let recorded = realm.register_host_root(&root, "app").expect("register");
        assert_eq!(recorded, 2);
        let data = realm.get(&root, "data").expect("data");
        let data = data.as_object().expect("object");
        assert_eq!(realm.host_paths().path_of(data), Some(r#"app["data"]"#));
        let run = realm.get(&root, "run").expect("run").as_object().expect("fn");
        assert!(!realm.host_paths().contains(run));
        assert_eq!(realm.register_host_root(&root, "again").expect("register"), 0);
    }

    #[test]
    fn incremental_heaps_are_extended() {
        let mut realm = realm();
        let first = realm.eval_script("globalThis.shared = { v: 1 }; ({ s: shared })").expect("eval");
        let envelope = realm.serialize(&first, SerializeOptions::default()).expect("first");
        let second = realm.eval_script("({ again: shared })").expect("eval");
        let options = SerializeOptions {
            heap: Some(envelope.heap.clone()),
            ..SerializeOptions::default()
        };
        let next = realm.serialize(&second, options).expect("second");
        assert_eq!(next.heap.len(), envelope.heap.len() + 1);
        let first_keys: Vec<&String> = envelope.heap.keys().collect();
        let next_keys: Vec<&String> = next.heap.keys().take(first_keys.len()).collect();
        assert_eq!(first_keys, next_keys);
    }

    #[test]
    fn unregistered_symbols_keep_their_reference() {
        let mut realm = realm();
        let obj = realm.eval_script("const s = Symbol('tag'); ({ a: s, b: s })").expect("eval");
        let envelope = realm.serialize(&obj, SerializeOptions::default()).expect("serialize");
        let root = entry(&envelope, &envelope.serialized);
        let a = root.own_properties[0].1.value.clone();
        assert!(matches!(
            &a,
            Some(SerializedValue::UnregisteredSymbol { description: Some(d), .. }) if d == "tag"
        ));
        assert_eq!(a, root.own_properties[1].1.value);
    }
}
