//! Lazily decoded tagged values with label-based envelope encryption.
//!
//! This crate provides:
//! - `AnyValue`, a self-describing value that defers decoding until a concrete
//!   type is requested
//! - The wire header codec framing every value
//! - A type registry holding wire names and encrypt / decrypt / JSON hooks
//! - Label resolution (label -> recipient keys) and a resolver cache
//! - Label-group and whole-value envelope encryption on top of an external keystore

pub mod any_value;
pub mod encryption;
pub mod erased_arc;
pub mod error;
pub mod label_resolver;
pub mod orchestrator;
pub mod registry;
pub mod resolver_cache;
pub mod traits;
pub mod wire;

pub use any_value::{Access, AnyValue, AsAnyValue, Primitive};
pub use encryption::*;
pub use erased_arc::ErasedArc;
pub use error::{Result, SerializerError};
pub use label_resolver::*;
pub use orchestrator::{LIST_ANY, MAP_ANY};
pub use registry::{DecryptFn, EncryptFn, ToJsonFn, TypeRegistry};
pub use resolver_cache::*;
pub use traits::*;
pub use wire::*;
