//! Wire types: tagged values, heap entries and the envelope.
//!
//! The envelope is plain JSON.  Values JSON cannot carry (`NaN`, `±Infinity`,
//! `-0`, bigints, `undefined`, symbols) get their own tags, so a decoded
//! envelope never needs non-standard number handling.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

/// `objectType` of entries no encoder claimed.
pub const NOT_SPECIAL: &str = "not-special";

/// Reference id for the `n`th heap entry allocated in a realm.
pub fn reference_id(n: u64) -> String {
    format!("ref{n}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SerializedValue {
    /// String, finite number, boolean or null.
    Simple { value: serde_json::Value },
    Nan,
    Infinity,
    NegativeInfinity,
    NegativeZero,
    Bigint {
        #[serde(rename = "valueString")]
        value_string: String,
    },
    Undefined,
    UnregisteredSymbol {
        reference: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    RegisteredSymbol { key: String },
    HostObject { path: String },
    ManualStop,
    ObjectLike { reference: String },
}

impl SerializedValue {
    pub fn simple(value: impl Into<serde_json::Value>) -> Self {
        Self::Simple {
            value: value.into(),
        }
    }

    pub fn object_like(reference: impl Into<String>) -> Self {
        Self::ObjectLike {
            reference: reference.into(),
        }
    }

    /// Heap reference this value points at, if any.
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::ObjectLike { reference } => Some(reference),
            _ => None,
        }
    }

    /// Encode into a JSON value (for nesting inside encoder payloads).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(value: &serde_json::Value) -> EngineResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|error| EngineError::invalid_envelope(format!("malformed value: {error}")))
    }

    fn check_json_safe(&self, at: &str) -> EngineResult<()> {
        match self {
            Self::Simple { value } => match value {
                serde_json::Value::String(_)
                | serde_json::Value::Bool(_)
                | serde_json::Value::Null => Ok(()),
                serde_json::Value::Number(n) if n.as_f64().is_some_and(f64::is_finite) => Ok(()),
                other => Err(EngineError::NonJsonResidue {
                    detail: format!("{at}: simple value {other} is not a JSON primitive"),
                }),
            },
            _ => Ok(()),
        }
    }
}

/// Property descriptor on the wire.  Absent fields do not apply to the
/// descriptor (they do not mean `false`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SerializedDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SerializedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<SerializedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<SerializedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configurable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapEntry {
    pub object_type: String,
    pub prototype: SerializedValue,
    pub is_extensible: bool,
    pub own_properties: Vec<(SerializedValue, SerializedDescriptor)>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A heap slot while a serialization pass is running.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapSlot {
    /// Circular reference in progress.
    Placeholder,
    Done(HeapEntry),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub heap: IndexMap<String, HeapEntry>,
    pub serialized: SerializedValue,
}

impl Envelope {
    pub fn to_json_string(&self) -> EngineResult<String> {
        serde_json::to_string(self).map_err(|error| EngineError::NonJsonResidue {
            detail: error.to_string(),
        })
    }

    pub fn to_json_pretty(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self).map_err(|error| EngineError::NonJsonResidue {
            detail: error.to_string(),
        })
    }

    pub fn from_json_str(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text)
            .map_err(|error| EngineError::invalid_envelope(format!("malformed envelope: {error}")))
    }

    pub fn from_json_value(value: serde_json::Value) -> EngineResult<Self> {
        serde_json::from_value(value)
            .map_err(|error| EngineError::invalid_envelope(format!("malformed envelope: {error}")))
    }

    /// `sha256:<hex>` over the compact JSON encoding.
    pub fn content_hash(&self) -> EngineResult<String> {
        let bytes = self.to_json_string()?;
        let digest = Sha256::digest(bytes.as_bytes());
        Ok(format!("sha256:{}", hex::encode(digest)))
    }

    /// Reject simple values that are not JSON primitives.
    pub fn check_json_safe(&self) -> EngineResult<()> {
        self.serialized.check_json_safe("serialized")?;
        for (reference, entry) in &self.heap {
            entry.prototype.check_json_safe(reference)?;
            for (key, descriptor) in &entry.own_properties {
                key.check_json_safe(reference)?;
                for value in [&descriptor.value, &descriptor.get, &descriptor.set]
                    .into_iter()
                    .flatten()
                {
                    value.check_json_safe(reference)?;
                }
            }
            check_payload(&entry.data, reference)?;
        }
        Ok(())
    }
}

/// Walk an encoder payload; nested tagged values must also be JSON-safe.
fn check_payload(value: &serde_json::Value, at: &str) -> EngineResult<()> {
    match value {
        serde_json::Value::Object(map) => {
            if map.contains_key("type")
                && let Ok(tagged) = serde_json::from_value::<SerializedValue>(value.clone())
            {
                return tagged.check_json_safe(at);
            }
            map.values().try_for_each(|v| check_payload(v, at))
        }
        serde_json::Value::Array(items) => items.iter().try_for_each(|v| check_payload(v, at)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_use_kebab_case() {
        let value = SerializedValue::NegativeInfinity;
        assert_eq!(value.to_json(), json!({"type": "negative-infinity"}));
        let big = SerializedValue::Bigint {
            value_string: "12".into(),
        };
        assert_eq!(big.to_json(), json!({"type": "bigint", "valueString": "12"}));
        let obj = SerializedValue::object_like("ref3");
        assert_eq!(obj.to_json(), json!({"type": "object-like", "reference": "ref3"}));
    }

    #[test]
    fn heap_entries_use_camel_case_and_omit_absent_fields() {
        let entry = HeapEntry {
            object_type: NOT_SPECIAL.into(),
            prototype: SerializedValue::simple(serde_json::Value::Null),
            is_extensible: true,
            own_properties: vec![(
                SerializedValue::simple("a"),
                SerializedDescriptor {
                    value: Some(SerializedValue::simple(1)),
                    writable: Some(true),
                    enumerable: Some(true),
                    configurable: Some(true),
                    ..Default::default()
                },
            )],
            data: json!({}),
        };
        let encoded = serde_json::to_value(&entry).expect("encode");
        assert_eq!(encoded["objectType"], "not-special");
        assert_eq!(encoded["isExtensible"], true);
        let descriptor = &encoded["ownProperties"][0][1];
        assert!(descriptor.get("get").is_none());
        assert_eq!(descriptor["value"], json!({"type": "simple", "value": 1}));
    }

    #[test]
    fn non_primitive_simple_values_are_residue() {
        let envelope = Envelope {
            heap: IndexMap::new(),
            serialized: SerializedValue::simple(json!([1, 2])),
        };
        assert!(matches!(
            envelope.check_json_safe(),
            Err(EngineError::NonJsonResidue { .. })
        ));
    }

    #[test]
    fn content_hash_is_stable() {
        let envelope = Envelope {
            heap: IndexMap::new(),
            serialized: SerializedValue::Undefined,
        };
        let a = envelope.content_hash().expect("hash");
        let b = envelope.clone().content_hash().expect("hash");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[test]
    fn malformed_json_is_an_envelope_error() {
        let err = Envelope::from_json_str("{\"heap\": 3}").expect_err("must fail");
        assert_eq!(err.stable_code(), "FE-SER-2003");
    }
}
