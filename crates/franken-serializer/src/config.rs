//! Engine configuration.

use serde::{Deserialize, Serialize};

pub const DEFAULT_TRACE_ID: &str = "franken-serializer";
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;
pub const DEFAULT_MAX_ARRAY_LENGTH: usize = 1 << 22;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Copied into every emitted event.
    pub trace_id: String,
    /// Transpile with `ensureSerializable` around every eligible expression.
    pub wrap_expressions: bool,
    /// Record `globalThis` as host root `globalThis` when the realm starts.
    pub register_global_host_root: bool,
    /// Nested script calls beyond this depth raise a `RangeError`.
    pub max_call_depth: usize,
    /// Largest element or byte count a native helper will materialize;
    /// longer arrays and buffers raise a `RangeError`.
    pub max_array_length: usize,
    /// Check every produced envelope for non-JSON residue.
    pub verify_wire_format: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trace_id: DEFAULT_TRACE_ID.to_string(),
            wrap_expressions: false,
            register_global_host_root: true,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_array_length: DEFAULT_MAX_ARRAY_LENGTH,
            verify_wire_format: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"trace_id":"t-1","wrap_expressions":true}"#)
            .expect("config");
        assert_eq!(config.trace_id, "t-1");
        assert!(config.wrap_expressions);
        assert!(config.register_global_host_root);
        assert_eq!(config.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert_eq!(config.max_array_length, DEFAULT_MAX_ARRAY_LENGTH);
    }
}
