//! Error taxonomy for the serializer, reconstructor and runtime.
//!
//! Every variant carries a stable `FE-SER-*` code so events, CLI output and
//! script-visible `Error` messages can be matched without parsing prose.

use thiserror::Error;

use crate::object_model::{JsValue, ObjectError};
use crate::parser::ParseError;

const ERROR_UNREGISTERED_FUNCTION: &str = "FE-SER-1001";
const ERROR_AMBIGUOUS_ENCODER: &str = "FE-SER-1002";
const ERROR_DUPLICATE_ENCODER: &str = "FE-SER-1003";
const ERROR_UNRESOLVED_PLACEHOLDER: &str = "FE-SER-1004";
const ERROR_NON_JSON_RESIDUE: &str = "FE-SER-1005";
const ERROR_MISSING_HEAP_ENTRY: &str = "FE-SER-2001";
const ERROR_UNKNOWN_OBJECT_TYPE: &str = "FE-SER-2002";
const ERROR_INVALID_ENVELOPE: &str = "FE-SER-2003";
const ERROR_ROUND_TRIP_MISMATCH: &str = "FE-SER-3001";
const ERROR_PARSE: &str = "FE-SER-4001";
const ERROR_THROWN: &str = "FE-SER-5001";
const ERROR_OBJECT_MODEL: &str = "FE-SER-5002";
const ERROR_CALL_DEPTH: &str = "FE-SER-5003";

/// Broad category of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A function or class reached the serializer without a registration record.
    Registration,
    /// The envelope handed to the reconstructor is malformed or untrusted.
    EnvelopeCorruption,
    /// The encoder registry is inconsistent.
    Configuration,
    /// Script-level failure (exceptions, parse errors, verification mismatches).
    Runtime,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("cannot serialize a closure that was never instrumented: {description}")]
    UnregisteredFunction { reference: String, description: String },
    #[error("more than one encoder claims object `{reference}`: {candidates:?}")]
    AmbiguousEncoder {
        reference: String,
        candidates: Vec<String>,
    },
    #[error("more than one encoder registered for object type `{object_type}`")]
    DuplicateEncoder { object_type: String },
    #[error("heap entry `{reference}` is still a circular-reference placeholder")]
    UnresolvedPlaceholder { reference: String },
    #[error("envelope is not JSON-safe: {detail}")]
    NonJsonResidue { detail: String },
    #[error("envelope invalid: reference `{reference}` has no heap entry")]
    MissingHeapEntry { reference: String },
    #[error("envelope invalid: unknown object type `{object_type}`")]
    UnknownObjectType { object_type: String },
    #[error("envelope invalid: {detail}")]
    InvalidEnvelope { detail: String },
    #[error("value did not survive a serialization round trip: {detail}")]
    RoundTripMismatch { detail: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("uncaught {message}")]
    Thrown { value: JsValue, message: String },
    #[error("object model: {0}")]
    ObjectModel(#[from] ObjectError),
    #[error("maximum call depth {max} exceeded")]
    CallDepthExceeded { max: usize },
}

impl EngineError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::UnregisteredFunction { .. } => ERROR_UNREGISTERED_FUNCTION,
            Self::AmbiguousEncoder { .. } => ERROR_AMBIGUOUS_ENCODER,
            Self::DuplicateEncoder { .. } => ERROR_DUPLICATE_ENCODER,
            Self::UnresolvedPlaceholder { .. } => ERROR_UNRESOLVED_PLACEHOLDER,
            Self::NonJsonResidue { .. } => ERROR_NON_JSON_RESIDUE,
            Self::MissingHeapEntry { .. } => ERROR_MISSING_HEAP_ENTRY,
            Self::UnknownObjectType { .. } => ERROR_UNKNOWN_OBJECT_TYPE,
            Self::InvalidEnvelope { .. } => ERROR_INVALID_ENVELOPE,
            Self::RoundTripMismatch { .. } => ERROR_ROUND_TRIP_MISMATCH,
            Self::Parse(_) => ERROR_PARSE,
            Self::Thrown { .. } => ERROR_THROWN,
            Self::ObjectModel(_) => ERROR_OBJECT_MODEL,
            Self::CallDepthExceeded { .. } => ERROR_CALL_DEPTH,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnregisteredFunction { .. } => ErrorClass::Registration,
            Self::MissingHeapEntry { .. }
            | Self::UnknownObjectType { .. }
            | Self::InvalidEnvelope { .. } => ErrorClass::EnvelopeCorruption,
            Self::AmbiguousEncoder { .. }
            | Self::DuplicateEncoder { .. }
            | Self::UnresolvedPlaceholder { .. }
            | Self::NonJsonResidue { .. } => ErrorClass::Configuration,
            Self::RoundTripMismatch { .. }
            | Self::Parse(_)
            | Self::Thrown { .. }
            | Self::ObjectModel(_)
            | Self::CallDepthExceeded { .. } => ErrorClass::Runtime,
        }
    }

    /// The thrown script value, if this error is a script exception.
    pub fn thrown_value(&self) -> Option<&JsValue> {
        match self {
            Self::Thrown { value, .. } => Some(value),
            _ => None,
        }
    }

    pub(crate) fn invalid_envelope(detail: impl Into<String>) -> Self {
        Self::InvalidEnvelope {
            detail: detail.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique() {
        let errors = [
            EngineError::UnregisteredFunction {
                reference: "ref0".into(),
                description: "f".into(),
            },
            EngineError::AmbiguousEncoder {
                reference: "ref0".into(),
                candidates: vec![],
            },
            EngineError::DuplicateEncoder {
                object_type: "map".into(),
            },
            EngineError::UnresolvedPlaceholder {
                reference: "ref0".into(),
            },
            EngineError::NonJsonResidue { detail: "x".into() },
            EngineError::MissingHeapEntry {
                reference: "ref0".into(),
            },
            EngineError::UnknownObjectType {
                object_type: "x".into(),
            },
            EngineError::invalid_envelope("x"),
            EngineError::RoundTripMismatch { detail: "x".into() },
            EngineError::CallDepthExceeded { max: 1 },
        ];
        let mut codes: Vec<&str> = errors.iter().map(EngineError::stable_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn classes_follow_the_taxonomy() {
        assert_eq!(
            EngineError::MissingHeapEntry {
                reference: "ref9".into()
            }
            .class(),
            ErrorClass::EnvelopeCorruption
        );
        assert_eq!(
            EngineError::DuplicateEncoder {
                object_type: "map".into()
            }
            .class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            EngineError::UnregisteredFunction {
                reference: "ref1".into(),
                description: "f".into()
            }
            .class(),
            ErrorClass::Registration
        );
    }

    #[test]
    fn messages_name_the_reference() {
        let err = EngineError::MissingHeapEntry {
            reference: "ref7".into(),
        };
        assert!(err.to_string().contains("ref7"));
        assert!(err.to_string().starts_with("envelope invalid"));
    }
}
