//! `ensureSerializable`: round-trip a value and compare the copy with the
//! original observationally.

use std::collections::BTreeSet;

use crate::error::{EngineError, EngineResult};
use crate::object_model::{JsValue, ObjectHandle, ObjectKind, PromiseState, PropertyDescriptor};
use crate::realm::Realm;
use crate::serializer::SerializeOptions;

type Visited = BTreeSet<(ObjectHandle, ObjectHandle)>;

fn mismatch(path: &str, what: impl std::fmt::Display) -> EngineError {
    EngineError::RoundTripMismatch {
        detail: format!("{path}: {what}"),
    }
}

impl Realm {
    /// Serialize and reconstruct `value`, fail unless the copy matches, and
    /// return `value` itself.
    pub fn ensure_serializable(&mut self, value: &JsValue) -> EngineResult<JsValue> {
        let result = self.check_round_trip(value).map(|()| value.clone());
        let detail = format!("typeof={}", self.type_of(value));
        self.record_outcome("verify", "ensure_serializable", &result, detail);
        result
    }

    fn check_round_trip(&mut self, value: &JsValue) -> EngineResult<()> {
        let envelope = self.serialize(value, SerializeOptions::default())?;
        let copy = self.deserialize(&envelope)?;
        let mut visited = Visited::new();
        self.compare_values(value, &copy, "value", &mut visited)
    }

    pub(crate) fn compare_values(
        &self,
        original: &JsValue,
        copy: &JsValue,
        path: &str,
        visited: &mut Visited,
    ) -> EngineResult<()> {
        match (original, copy) {
            (JsValue::Object(a), JsValue::Object(b)) => self.compare_objects(*a, *b, path, visited),
            _ if original.same_value_zero(copy) => Ok(()),
            _ => Err(mismatch(
                path,
                format!("{} became {}", self.display_value(original), self.display_value(copy)),
            )),
        }
    }

    fn compare_handles(
        &self,
        original: Option<ObjectHandle>,
        copy: Option<ObjectHandle>,
        path: &str,
        visited: &mut Visited,
    ) -> EngineResult<()> {
        let wrap = |h: Option<ObjectHandle>| h.map_or(JsValue::Undefined, JsValue::Object);
        self.compare_values(&wrap(original), &wrap(copy), path, visited)
    }

    fn compare_objects(&self, a: ObjectHandle, b: ObjectHandle, path: &str, visited: &mut Visited) -> EngineResult<()> {
        if a == b || !visited.insert((a, b)) {
            return Ok(());
        }
        let (kind_a, kind_b) = (self.heap.kind(a)?.clone(), self.heap.kind(b)?.clone());
        if kind_a.label() != kind_b.label() {
            return Err(mismatch(path, format!("{} became {}", kind_a.label(), kind_b.label())));
        }
        if self.heap.is_extensible(a)? != self.heap.is_extensible(b)? {
            return Err(mismatch(path, "extensibility changed"));
        }
        self.compare_handles(
            self.heap.get_prototype_of(a)?,
            self.heap.get_prototype_of(b)?,
            &format!("{path}.[[Prototype]]"),
            visited,
        )?;
        self.compare_slots(&kind_a, &kind_b, path, visited)?;

        let entries_a = self.heap.own_property_entries(a)?;
        let entries_b = self.heap.own_property_entries(b)?;
        let keys_a: Vec<_> = entries_a.iter().map(|(key, _)| key).collect();
        let keys_b: Vec<_> = entries_b.iter().map(|(key, _)| key).collect();
        if keys_a != keys_b {
            let show = |keys: &[&crate::object_model::PropertyKey]| {
                keys.iter().map(|key| self.key_display(key)).collect::<Vec<_>>().join(", ")
            };
            return Err(mismatch(
                path,
                format!("own keys [{}] became [{}]", show(&keys_a), show(&keys_b)),
            ));
        }
        for ((key, da), (_, db)) in entries_a.iter().zip(&entries_b) {
            let at = format!("{path}.{}", self.key_display(key));
            match (da, db) {
                (
                    PropertyDescriptor::Data {
                        value: va,
                        writable: wa,
                        enumerable: ea,
                        configurable: ca,
                    },
                    PropertyDescriptor::Data {
                        value: vb,
                        writable: wb,
                        enumerable: eb,
                        configurable: cb,
                    },
                ) => {
                    if (wa, ea, ca) != (wb, eb, cb) {
                        return Err(mismatch(&at, "descriptor flags changed"));
                    }
                    self.compare_values(va, vb, &at, visited)?;
                }
                (
                    PropertyDescriptor::Accessor {
                        get: ga,
                        set: sa,
                        enumerable: ea,
                        configurable: ca,
                    },
                    PropertyDescriptor::Accessor {
                        get: gb,
                        set: sb,
                        enumerable: eb,
                        configurable: cb,
                    },
                ) => {
                    if (ea, ca) != (eb, cb) {
                        return Err(mismatch(&at, "descriptor flags changed"));
                    }
                    self.compare_handles(*ga, *gb, &format!("{at}.get"), visited)?;
                    self.compare_handles(*sa, *sb, &format!("{at}.set"), visited)?;
                }
                _ => return Err(mismatch(&at, "data and accessor properties swapped")),
            }
        }
        Ok(())
    }

    fn compare_slots(&self, a: &ObjectKind, b: &ObjectKind, path: &str, visited: &mut Visited) -> EngineResult<()> {
        match (a, b) {
            (ObjectKind::Map(ma), ObjectKind::Map(mb)) => {
                if ma.len() != mb.len() {
                    return Err(mismatch(path, format!("map size {} became {}", ma.len(), mb.len())));
                }
                for (index, ((ka, va), (kb, vb))) in ma.iter().zip(mb).enumerate() {
                    let at = format!("{path}.[[MapEntry {index}]]");
                    self.compare_values(&ka.to_value(), &kb.to_value(), &at, visited)?;
                    self.compare_values(va, vb, &at, visited)?;
                }
                Ok(())
            }
            (ObjectKind::Set(sa), ObjectKind::Set(sb)) => {
                if sa.len() != sb.len() {
                    return Err(mismatch(path, format!("set size {} became {}", sa.len(), sb.len())));
                }
                for (index, (ea, eb)) in sa.iter().zip(sb).enumerate() {
                    let at = format!("{path}.[[SetElement {index}]]");
                    self.compare_values(&ea.to_value(), &eb.to_value(), &at, visited)?;
                }
                Ok(())
            }
            (ObjectKind::Date(ta), ObjectKind::Date(tb)) => {
                if JsValue::Number(*ta).same_value_zero(&JsValue::Number(*tb)) {
                    Ok(())
                } else {
                    Err(mismatch(path, format!("time value {ta} became {tb}")))
                }
            }
            (
                ObjectKind::RegExp { source: sa, flags: fa },
                ObjectKind::RegExp { source: sb, flags: fb },
            ) => {
                if (sa, fa) == (sb, fb) {
                    Ok(())
                } else {
                    Err(mismatch(path, format!("/{sa}/{fa} became /{sb}/{fb}")))
                }
            }
            (ObjectKind::PrimitiveWrapper(va), ObjectKind::PrimitiveWrapper(vb)) => {
                self.compare_values(va, vb, &format!("{path}.[[PrimitiveValue]]"), visited)
            }
            (ObjectKind::ArrayBuffer(da), ObjectKind::ArrayBuffer(db)) => {
                if da == db {
                    Ok(())
                } else {
                    Err(mismatch(path, "buffer contents changed"))
                }
            }
            (
                ObjectKind::Uint8Array {
                    buffer: ba,
                    byte_offset: oa,
                    length: la,
                },
                ObjectKind::Uint8Array {
                    buffer: bb,
                    byte_offset: ob,
                    length: lb,
                },
            ) => {
                if (oa, la) != (ob, lb) {
                    return Err(mismatch(path, "view window changed"));
                }
                self.compare_objects(*ba, *bb, &format!("{path}.buffer"), visited)
            }
            (ObjectKind::Promise(pa), ObjectKind::Promise(pb)) => match (pa, pb) {
                (PromiseState::Pending, PromiseState::Rejected(_)) => Ok(()),
                (PromiseState::Fulfilled(va), PromiseState::Fulfilled(vb))
                | (PromiseState::Rejected(va), PromiseState::Rejected(vb)) => {
                    self.compare_values(va, vb, &format!("{path}.[[PromiseResult]]"), visited)
                }
                _ => Err(mismatch(path, "promise settlement changed")),
            },
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn realm() -> Realm {
        Realm::new(EngineConfig::default()).expect("realm")
    }

    #[test]
    fn returns_the_original_value() {
        let mut realm = realm();
        let value = realm
            .eval_script("({ m: new Map([[1, { n: NaN }]]), s: new Set(['a']), d: new Date(5), list: [1, 2] })")
            .expect("eval");
        let out = realm.ensure_serializable(&value).expect("round trip");
        assert_eq!(out, value);
        let last = realm.events().last().expect("event");
        assert_eq!((last.component.as_str(), last.outcome.as_str()), ("verify", "allow"));
    }

    #[test]
    fn nan_matches_nan() {
        let mut realm = realm();
        let out = realm.ensure_serializable(&JsValue::Number(f64::NAN)).expect("nan");
        assert!(matches!(out, JsValue::Number(n) if n.is_nan()));
    }

    #[test]
    fn differences_name_the_property() {
        let mut realm = realm();
        let a = realm.eval_script("({ inner: { a: 1 } })").expect("a");
        let b = realm.eval_script("({ inner: { a: 2 } })").expect("b");
        let err = realm
            .compare_values(&a, &b, "value", &mut Visited::new())
            .expect_err("differ");
        assert_eq!(err.stable_code(), "FE-SER-3001");
        assert!(err.to_string().contains("value.inner.a"), "{err}");
    }

    #[test]
    fn pending_promises_compare_as_rejected() {
        let mut realm = realm();
        let pending = realm.eval_script("new Promise(() => {})").expect("eval");
        realm.ensure_serializable(&pending).expect("pending");
        let envelope = realm.serialize(&pending, SerializeOptions::default()).expect("serialize");
        let copy = realm.deserialize(&envelope).expect("deserialize");
        let state = realm.heap.kind(copy.as_object().expect("object")).expect("kind").clone();
        assert!(matches!(state, ObjectKind::Promise(PromiseState::Rejected(_))));
        let settled = realm.eval_script("Promise.resolve(4)").expect("eval");
        realm.ensure_serializable(&settled).expect("settled");
    }
}
