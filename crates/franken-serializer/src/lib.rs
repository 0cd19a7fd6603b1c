#![forbid(unsafe_code)]
//! Suspend and resume live script value graphs.
//!
//! A [`Realm`] runs scripts in a small native interpreter.  Scripts passed
//! through [`instrument`] register every closure and class they create, so
//! any reachable value (closures, classes, cycles, descriptors, symbols,
//! collections) can be turned into a JSON [`Envelope`] by
//! [`Realm::serialize`] and rebuilt by [`Realm::deserialize`].

pub mod ast;
pub mod config;
pub mod deserializer;
pub mod encoders;
pub mod envelope;
pub mod error;
pub mod events;
pub mod host_paths;
mod interpreter;
pub mod intrinsics;
pub mod lexer;
pub mod object_model;
pub mod parser;
pub mod realm;
pub mod registry;
pub mod scope_analysis;
pub mod serializer;
pub mod transpiler;
pub mod verify;

pub use config::EngineConfig;
pub use encoders::{DecodeContext, EncodeContext, EncoderRegistry, HeapEncoder};
pub use envelope::{Envelope, HeapEntry, SerializedDescriptor, SerializedValue};
pub use error::{EngineError, EngineResult, ErrorClass};
pub use events::EngineEvent;
pub use object_model::{JsValue, ObjectHandle, PropertyDescriptor, PropertyKey};
pub use parser::{ParseError, ParseErrorCode};
pub use realm::Realm;
pub use serializer::SerializeOptions;
pub use transpiler::{InstrumentOptions, instrument};
