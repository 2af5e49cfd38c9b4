//! Type registry used by AnyValue.
//!
//! Maps a logical type name (the Rust type path) to its wire name and to optional
//! encrypt / decrypt / to-JSON hooks. A process-wide instance is available through
//! [`TypeRegistry::global`]; tests build their own and pass it through the
//! serialization contexts.

use std::any::Any;
use std::sync::Arc;

use anyvalue_common::logging::{Component, Logger};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{Result, SerializerError};
use crate::label_resolver::LabelResolver;
use crate::traits::{KeyStore, LabelDecrypt, LabelEncrypt};
use crate::wire::MAX_TYPE_NAME_LEN;

/// Encrypt a plain value (passed type-erased) into the transport encoding of its
/// label-encrypted representation.
pub type EncryptFn = fn(&dyn Any, &Arc<KeyStore>, &dyn LabelResolver) -> Result<Vec<u8>>;

/// Decode the transport encoding of a label-encrypted representation and decrypt
/// it into the plain type.
pub type DecryptFn = fn(&[u8], &Arc<KeyStore>) -> Result<Box<dyn Any + Send + Sync>>;

/// Convert the transport encoding of a value into JSON.
pub type ToJsonFn = fn(&[u8]) -> Result<JsonValue>;

static GLOBAL_REGISTRY: Lazy<Arc<TypeRegistry>> = Lazy::new(|| Arc::new(TypeRegistry::new()));

pub struct TypeRegistry {
    wire_names: DashMap<String, String>,
    logical_names: DashMap<String, String>,
    encryptors: DashMap<String, EncryptFn>,
    decryptors: DashMap<String, DecryptFn>,
    json_converters: DashMap<String, ToJsonFn>,
    logger: Logger,
}

impl TypeRegistry {
    /// A registry holding only the built-in primitive wire names.
    pub fn new() -> Self {
        let registry = Self {
            wire_names: DashMap::new(),
            logical_names: DashMap::new(),
            encryptors: DashMap::new(),
            decryptors: DashMap::new(),
            json_converters: DashMap::new(),
            logger: Logger::new_root(Component::Registry, "type-registry"),
        };
        registry.register_builtins();
        registry
    }

    pub fn with_logger(mut self, logger: &Logger) -> Self {
        self.logger = logger.with_component(Component::Registry);
        self
    }

    /// The process-wide registry.
    pub fn global() -> Arc<TypeRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    fn register_builtins(&self) {
        fn builtin<T: ?Sized>(registry: &TypeRegistry, wire: &str) {
            let logical = std::any::type_name::<T>();
            registry
                .wire_names
                .insert(logical.to_string(), wire.to_string());
            registry
                .logical_names
                .insert(wire.to_string(), logical.to_string());
        }

        builtin::<String>(self, "string");
        builtin::<bool>(self, "bool");
        builtin::<char>(self, "char");
        builtin::<i8>(self, "i8");
        builtin::<i16>(self, "i16");
        builtin::<i32>(self, "i32");
        builtin::<i64>(self, "i64");
        builtin::<i128>(self, "i128");
        builtin::<u8>(self, "u8");
        builtin::<u16>(self, "u16");
        builtin::<u32>(self, "u32");
        builtin::<u64>(self, "u64");
        builtin::<u128>(self, "u128");
        builtin::<f32>(self, "f32");
        builtin::<f64>(self, "f64");
        builtin::<Vec<u8>>(self, "bytes");
        builtin::<JsonValue>(self, "json");
    }

    /// Remove every registration and restore the built-in primitive names.
    pub fn clear(&self) {
        self.wire_names.clear();
        self.logical_names.clear();
        self.encryptors.clear();
        self.decryptors.clear();
        self.json_converters.clear();
        self.register_builtins();
        self.logger.debug("type registry cleared");
    }

    // -----------------------------------------------------------------------
    // Registration by name
    // -----------------------------------------------------------------------

    pub fn register_wire_name(&self, logical_name: &str, wire_name: &str) -> Result<()> {
        if wire_name.is_empty() {
            return Err(SerializerError::MissingWireName(logical_name.to_string()));
        }
        if wire_name.len() > MAX_TYPE_NAME_LEN {
            return Err(SerializerError::TypeNameTooLong(wire_name.len()));
        }
        if let Some(previous) = self.logical_names.get(wire_name) {
            if previous.value() != logical_name {
                self.logger.warn_args(format_args!(
                    "wire name '{wire_name}' re-bound from {} to {logical_name}",
                    previous.value()
                ));
            }
        }
        self.wire_names
            .insert(logical_name.to_string(), wire_name.to_string());
        self.logical_names
            .insert(wire_name.to_string(), logical_name.to_string());
        self.logger
            .debug_args(format_args!("registered {logical_name} as '{wire_name}'"));
        Ok(())
    }

    pub fn register_encrypt(&self, logical_name: &str, func: EncryptFn) {
        self.encryptors.insert(logical_name.to_string(), func);
    }

    pub fn register_decrypt(&self, logical_name: &str, func: DecryptFn) {
        self.decryptors.insert(logical_name.to_string(), func);
    }

    pub fn register_to_json(&self, logical_name: &str, func: ToJsonFn) {
        self.json_converters.insert(logical_name.to_string(), func);
    }

    // -----------------------------------------------------------------------
    // Typed registration
    // -----------------------------------------------------------------------

    /// Register a plain type under `wire_name` together with its JSON converter.
    pub fn register_type<T>(&self, wire_name: &str) -> Result<()>
    where
        T: 'static + Serialize + DeserializeOwned,
    {
        let logical = std::any::type_name::<T>();
        self.register_wire_name(logical, wire_name)?;
        self.register_to_json(logical, to_json_impl::<T>);
        Ok(())
    }

    /// Register a label-encryptable type: wire name, JSON converter, and the
    /// encrypt / decrypt hooks derived from its [`LabelEncrypt`] impl.
    pub fn register_encryptable<T>(&self, wire_name: &str) -> Result<()>
    where
        T: 'static + Send + Sync + Serialize + DeserializeOwned + LabelEncrypt,
    {
        // Mono-morphise concrete hook functions and insert them.
        fn encrypt_impl<T>(
            value: &dyn Any,
            keystore: &Arc<KeyStore>,
            resolver: &dyn LabelResolver,
        ) -> Result<Vec<u8>>
        where
            T: 'static + LabelEncrypt,
        {
            let plain = value.downcast_ref::<T>().ok_or_else(|| {
                SerializerError::type_mismatch(std::any::type_name::<T>(), "erased value")
            })?;
            let encrypted = plain.encrypt_with_keystore(keystore, resolver)?;
            serde_cbor::to_vec(&encrypted).map_err(|e| SerializerError::Encoding(e.to_string()))
        }

        fn decrypt_impl<T>(bytes: &[u8], keystore: &Arc<KeyStore>) -> Result<Box<dyn Any + Send + Sync>>
        where
            T: 'static + Send + Sync + LabelEncrypt,
        {
            let encrypted: T::Encrypted = serde_cbor::from_slice(bytes)?;
            let plain = encrypted.decrypt_with_keystore(keystore)?;
            Ok(Box::new(plain))
        }

        let logical = std::any::type_name::<T>();
        self.register_type::<T>(wire_name)?;
        self.register_encrypt(logical, encrypt_impl::<T>);
        self.register_decrypt(logical, decrypt_impl::<T>);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn lookup_wire_name(&self, logical_name: &str) -> Option<String> {
        self.wire_names.get(logical_name).map(|e| e.value().clone())
    }

    pub fn lookup_logical_name(&self, wire_name: &str) -> Option<String> {
        self.logical_names.get(wire_name).map(|e| e.value().clone())
    }

    pub fn encryptor(&self, logical_name: &str) -> Option<EncryptFn> {
        self.encryptors.get(logical_name).map(|e| *e.value())
    }

    pub fn has_encryptor(&self, logical_name: &str) -> bool {
        self.encryptors.contains_key(logical_name)
    }

    pub fn decryptor(&self, logical_name: &str) -> Option<DecryptFn> {
        self.decryptors.get(logical_name).map(|e| *e.value())
    }

    pub fn decryptor_by_wire_name(&self, wire_name: &str) -> Option<DecryptFn> {
        let logical = self.lookup_logical_name(wire_name)?;
        self.decryptor(&logical)
    }

    pub fn json_converter(&self, logical_name: &str) -> Option<ToJsonFn> {
        self.json_converters.get(logical_name).map(|e| *e.value())
    }

    pub fn json_converter_by_wire_name(&self, wire_name: &str) -> Option<ToJsonFn> {
        let logical = self.lookup_logical_name(wire_name)?;
        self.json_converter(&logical)
    }

    /// Wire name for `T`: the registered name, or the last path segment of the
    /// Rust type name when `T` was never registered.
    pub fn wire_name_of<T: ?Sized + 'static>(&self) -> String {
        let logical = std::any::type_name::<T>();
        if let Some(wire) = self.lookup_wire_name(logical) {
            return wire;
        }
        let short = short_type_name(logical);
        log::debug!("no wire name registered for {logical}, using '{short}'");
        short
    }

    /// Decrypt hook for a unit carrying `wire_name`, read as `logical_name`.
    ///
    /// The unit's wire name selects the hook, which applies only when the caller
    /// asks for the plain type registered under that name. Any other target reads
    /// the label-encrypted representation as is. Unregistered wire names fall
    /// back to the hook of the requested type.
    pub fn decryptor_for_unit(&self, wire_name: &str, logical_name: &str) -> Option<DecryptFn> {
        match self.lookup_logical_name(wire_name) {
            Some(registered) if registered == logical_name => self.decryptor_by_wire_name(wire_name),
            Some(_) => None,
            None => self.decryptor(logical_name),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn to_json_impl<T>(bytes: &[u8]) -> Result<JsonValue>
where
    T: 'static + Serialize + DeserializeOwned,
{
    let value: T = serde_cbor::from_slice(bytes)?;
    serde_json::to_value(&value).map_err(|e| SerializerError::Encoding(e.to_string()))
}

fn short_type_name(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
