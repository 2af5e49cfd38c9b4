use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_bytes::ByteBuf;
use serde_cbor::Value as CborValue;
use serde_json::Value as JsonValue;

use crate::encryption::{decrypt_bytes, encrypt_bytes};
use crate::erased_arc::ErasedArc;
use crate::error::{Result, SerializerError};
use crate::orchestrator::{self, to_cbor, EncodeScope, EncodedBody, LIST_ANY, MAP_ANY};
use crate::registry::TypeRegistry;
use crate::traits::{DeserializationContext, KeyStore, SerializationContext};
use crate::wire::{read_header, ValueCategory};

type SerializeFn = dyn Fn(&ErasedArc, &EncodeScope<'_>) -> Result<EncodedBody> + Send + Sync;
type ToJsonFn = dyn Fn(&ErasedArc) -> Result<JsonValue> + Send + Sync;

fn serialize_fn<F>(f: F) -> Arc<SerializeFn>
where
    F: Fn(&ErasedArc, &EncodeScope<'_>) -> Result<EncodedBody> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn to_json_fn<F>(f: F) -> Arc<ToJsonFn>
where
    F: Fn(&ErasedArc) -> Result<JsonValue> + Send + Sync + 'static,
{
    Arc::new(f)
}

const CBOR_NULL: &[u8] = &[0xf6];

const PRIMITIVE_WIRE_NAMES: &[&str] = &[
    "string", "bool", "char", "i8", "i16", "i32", "i64", "i128", "u8", "u16", "u32", "u64",
    "u128", "f32", "f64",
];

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

mod sealed {
    pub trait Sealed {}
}

/// Scalar types carried with category `Primitive`.
pub trait Primitive:
    sealed::Sealed + 'static + Clone + Send + Sync + Serialize + DeserializeOwned
{
    fn to_json_value(&self) -> Result<JsonValue>;

    /// Body bytes of a `Primitive` unit.
    fn encode_body(&self) -> Result<Vec<u8>> {
        to_cbor(self)
    }
}

macro_rules! primitive_via_from {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Primitive for $t {
            fn to_json_value(&self) -> Result<JsonValue> {
                Ok(JsonValue::from(self.clone()))
            }
        }
    )*};
}

macro_rules! primitive_as_string {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Primitive for $t {
            fn to_json_value(&self) -> Result<JsonValue> {
                Ok(JsonValue::String(self.to_string()))
            }
        }
    )*};
}

macro_rules! primitive_float {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Primitive for $t {
            fn to_json_value(&self) -> Result<JsonValue> {
                serde_json::Number::from_f64(f64::from(*self))
                    .map(JsonValue::Number)
                    .ok_or_else(|| SerializerError::Encoding(format!("{self} has no JSON form")))
            }
        }
    )*};
}

// 128-bit integers travel as decimal text: the body codec stops at 64 bits.
macro_rules! primitive_wide_int {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Primitive for $t {
            fn to_json_value(&self) -> Result<JsonValue> {
                Ok(JsonValue::String(self.to_string()))
            }

            fn encode_body(&self) -> Result<Vec<u8>> {
                to_cbor(&self.to_string())
            }
        }
    )*};
}

primitive_via_from!(String, bool, i8, i16, i32, i64, u8, u16, u32, u64);
primitive_as_string!(char);
primitive_wide_int!(i128, u128);
primitive_float!(f32, f64);

// ---------------------------------------------------------------------------
// AnyValue
// ---------------------------------------------------------------------------

/// Result of a decode that may be blocked by missing keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Access<T> {
    Accessible(T),
    Inaccessible { reason: String },
}

impl<T> Access<T> {
    pub fn is_accessible(&self) -> bool {
        matches!(self, Access::Accessible(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Access::Accessible(value) => Some(value),
            Access::Inaccessible { .. } => None,
        }
    }
}

/// Undecoded unit: header fields plus the body's byte range in `buffer`.
struct LazyData {
    type_name: Option<String>,
    buffer: Arc<[u8]>,
    start: usize,
    end: usize,
    encrypted: bool,
    keystore: Option<Arc<KeyStore>>,
    registry: Arc<TypeRegistry>,
    decoded: OnceCell<ErasedArc>,
}

impl LazyData {
    fn body(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    fn wire_name(&self) -> &str {
        self.type_name.as_deref().unwrap_or("")
    }

    fn decoder(&self, category: ValueCategory) -> BodyDecoder<'_> {
        BodyDecoder {
            category,
            wire: self.wire_name(),
            keystore: self.keystore.as_ref(),
            registry: &self.registry,
        }
    }

    /// Body with the whole-value envelope removed.
    fn payload(&self) -> Result<Cow<'_, [u8]>> {
        if !self.encrypted {
            return Ok(Cow::Borrowed(self.body()));
        }
        let keystore = decrypt_keystore(self.keystore.as_ref(), self.wire_name())?;
        Ok(Cow::Owned(decrypt_bytes(self.body(), keystore.as_ref())?))
    }
}

#[derive(Clone)]
enum Repr {
    Null,
    Eager {
        value: ErasedArc,
        serialize_fn: Arc<SerializeFn>,
        to_json_fn: Arc<ToJsonFn>,
    },
    Lazy(Arc<LazyData>),
}

/// A self-describing value: either held in memory, or an undecoded wire unit
/// decoded on first typed access.
#[derive(Clone)]
pub struct AnyValue {
    category: ValueCategory,
    repr: Repr,
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("AnyValue");
        s.field("category", &self.category);
        match &self.repr {
            Repr::Null => {}
            Repr::Eager { value, .. } => {
                s.field("value", value);
            }
            Repr::Lazy(lazy) => {
                s.field("wire_name", &lazy.wire_name())
                    .field("body_len", &(lazy.end - lazy.start))
                    .field("encrypted", &lazy.encrypted)
                    .field("decoded", &lazy.decoded.get().is_some());
            }
        }
        s.finish()
    }
}

impl Default for AnyValue {
    fn default() -> Self {
        AnyValue::null()
    }
}

impl AnyValue {
    fn eager<T: 'static + Send + Sync>(
        category: ValueCategory,
        value: T,
        serialize_fn: Arc<SerializeFn>,
        to_json_fn: Arc<ToJsonFn>,
    ) -> Self {
        Self {
            category,
            repr: Repr::Eager {
                value: ErasedArc::from_value(value),
                serialize_fn,
                to_json_fn,
            },
        }
    }

    pub fn null() -> Self {
        Self {
            category: ValueCategory::Null,
            repr: Repr::Null,
        }
    }

    pub fn new_primitive<T: Primitive>(value: T) -> Self {
        Self::eager(
            ValueCategory::Primitive,
            value,
            serialize_fn(|erased, scope| {
                let value = erased.as_arc::<T>()?;
                Ok(EncodedBody::new(
                    ValueCategory::Primitive,
                    scope.registry.wire_name_of::<T>(),
                    value.encode_body()?,
                ))
            }),
            to_json_fn(|erased| erased.as_arc::<T>()?.to_json_value()),
        )
    }

    pub fn new_bytes(bytes: Vec<u8>) -> Self {
        Self::eager(
            ValueCategory::Bytes,
            bytes,
            serialize_fn(|erased, _| {
                let bytes = erased.as_arc::<Vec<u8>>()?;
                Ok(EncodedBody::new(ValueCategory::Bytes, "bytes", bytes.to_vec()))
            }),
            to_json_fn(|erased| {
                let bytes = erased.as_arc::<Vec<u8>>()?;
                Ok(JsonValue::String(
                    base64::engine::general_purpose::STANDARD.encode(bytes.as_slice()),
                ))
            }),
        )
    }

    /// Heterogeneous list; every element is encoded as its own unit.
    pub fn new_list(list: Vec<AnyValue>) -> Self {
        Self::eager(
            ValueCategory::List,
            list,
            serialize_fn(|erased, scope| {
                let list = erased.as_arc::<Vec<AnyValue>>()?;
                orchestrator::encode_value_list(&list, scope)
            }),
            to_json_fn(|erased| {
                let list = erased.as_arc::<Vec<AnyValue>>()?;
                list.iter()
                    .map(AnyValue::to_json)
                    .collect::<Result<Vec<_>>>()
                    .map(JsonValue::Array)
            }),
        )
    }

    pub fn new_typed_list<T>(list: Vec<T>) -> Self
    where
        T: 'static + Send + Sync + Serialize,
    {
        Self::eager(
            ValueCategory::List,
            list,
            serialize_fn(|erased, scope| {
                let list = erased.as_arc::<Vec<T>>()?;
                orchestrator::encode_typed_list(&list, scope)
            }),
            to_json_fn(|erased| {
                let list = erased.as_arc::<Vec<T>>()?;
                serde_json::to_value(list.as_ref()).map_err(|e| SerializerError::Encoding(e.to_string()))
            }),
        )
    }

    /// Heterogeneous string-keyed map.
    pub fn new_map(map: HashMap<String, AnyValue>) -> Self {
        Self::eager(
            ValueCategory::Map,
            map,
            serialize_fn(|erased, scope| {
                let map = erased.as_arc::<HashMap<String, AnyValue>>()?;
                orchestrator::encode_value_map(&map, scope)
            }),
            to_json_fn(|erased| {
                let map = erased.as_arc::<HashMap<String, AnyValue>>()?;
                let mut object = serde_json::Map::with_capacity(map.len());
                for (key, value) in map.iter() {
                    object.insert(key.clone(), value.to_json()?);
                }
                Ok(JsonValue::Object(object))
            }),
        )
    }

    pub fn new_typed_map<T>(map: HashMap<String, T>) -> Self
    where
        T: 'static + Send + Sync + Serialize,
    {
        Self::eager(
            ValueCategory::Map,
            map,
            serialize_fn(|erased, scope| {
                let map = erased.as_arc::<HashMap<String, T>>()?;
                orchestrator::encode_typed_map(&map, scope)
            }),
            to_json_fn(|erased| {
                let map = erased.as_arc::<HashMap<String, T>>()?;
                serde_json::to_value(map.as_ref()).map_err(|e| SerializerError::Encoding(e.to_string()))
            }),
        )
    }

    pub fn new_struct<T>(value: T) -> Self
    where
        T: 'static + Send + Sync + Serialize,
    {
        Self::eager(
            ValueCategory::Struct,
            value,
            serialize_fn(|erased, scope| {
                let value = erased.as_arc::<T>()?;
                orchestrator::encode_struct(value.as_ref(), scope)
            }),
            to_json_fn(|erased| {
                let value = erased.as_arc::<T>()?;
                serde_json::to_value(value.as_ref()).map_err(|e| SerializerError::Encoding(e.to_string()))
            }),
        )
    }

    pub fn new_json(json: JsonValue) -> Self {
        Self::eager(
            ValueCategory::Json,
            json,
            serialize_fn(|erased, _| {
                let json = erased.as_arc::<JsonValue>()?;
                Ok(EncodedBody::new(ValueCategory::Json, "json", to_cbor(json.as_ref())?))
            }),
            to_json_fn(|erased| Ok(erased.as_arc::<JsonValue>()?.as_ref().clone())),
        )
    }

    /// Convert a JSON tree into nested AnyValues (objects become maps, arrays lists).
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Self::null(),
            JsonValue::Bool(b) => Self::new_primitive(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::new_primitive(i)
                } else if let Some(u) = n.as_u64() {
                    Self::new_primitive(u)
                } else if let Some(f) = n.as_f64() {
                    Self::new_primitive(f)
                } else {
                    Self::null()
                }
            }
            JsonValue::String(s) => Self::new_primitive(s),
            JsonValue::Array(items) => {
                Self::new_list(items.into_iter().map(Self::from_json).collect())
            }
            JsonValue::Object(object) => Self::new_map(
                object
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn category(&self) -> ValueCategory {
        self.category
    }

    pub fn is_null(&self) -> bool {
        matches!(self.repr, Repr::Null)
    }

    /// Still an undecoded wire unit.
    pub fn is_lazy(&self) -> bool {
        matches!(self.repr, Repr::Lazy(_))
    }

    /// Label-encrypted or wrapped in a whole-value envelope.
    pub fn is_encrypted(&self) -> bool {
        match &self.repr {
            Repr::Lazy(lazy) => lazy.encrypted || self.category == ValueCategory::Encrypted,
            _ => self.category == ValueCategory::Encrypted,
        }
    }

    /// Wire type name of a lazy value.
    pub fn wire_name(&self) -> Option<&str> {
        match &self.repr {
            Repr::Lazy(lazy) => lazy.type_name.as_deref(),
            _ => None,
        }
    }

    /// Rust type name of an in-memory value.
    pub fn rust_type_name(&self) -> Option<&'static str> {
        match &self.repr {
            Repr::Eager { value, .. } => Some(value.type_name()),
            _ => None,
        }
    }

    fn expect_category(&self, expected: ValueCategory, operation: &str) -> Result<()> {
        if self.category == expected {
            Ok(())
        } else {
            Err(SerializerError::UnsupportedCategory(format!(
                "{operation} needs a {} value, found {}",
                expected.as_str(),
                self.category.as_str()
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Encode as one wire unit. With a context, registered encrypt hooks run and
    /// an optional whole-value envelope is applied.
    pub fn serialize(&self, context: Option<&SerializationContext>) -> Result<Vec<u8>> {
        let global: Arc<TypeRegistry>;
        let registry: &TypeRegistry = match context {
            Some(ctx) => ctx.registry.as_ref(),
            None => {
                global = TypeRegistry::global();
                global.as_ref()
            }
        };

        let mut encoded = self.encode_body(&EncodeScope::new(registry, context))?;

        if let Some(ctx) = context {
            if let Some(recipients) = &ctx.envelope {
                if !encoded.enveloped && encoded.category != ValueCategory::Null {
                    encoded.body = encrypt_bytes(&encoded.body, ctx.keystore.as_ref(), recipients)?;
                    encoded.enveloped = true;
                }
            }
        }

        encoded.into_unit()
    }

    /// Plain encoding against a specific registry.
    pub fn serialize_plain(&self, registry: &TypeRegistry) -> Result<Vec<u8>> {
        self.encode_unit(&EncodeScope::plain(registry))
    }

    pub(crate) fn encode_body(&self, scope: &EncodeScope<'_>) -> Result<EncodedBody> {
        match &self.repr {
            Repr::Null => Ok(EncodedBody::null()),
            Repr::Eager {
                value,
                serialize_fn,
                ..
            } => serialize_fn(value, scope),
            Repr::Lazy(lazy) => Ok(EncodedBody {
                category: self.category,
                type_name: lazy.type_name.clone(),
                body: lazy.body().to_vec(),
                enveloped: lazy.encrypted,
            }),
        }
    }

    pub(crate) fn encode_unit(&self, scope: &EncodeScope<'_>) -> Result<Vec<u8>> {
        match &self.repr {
            // Re-emit the original unit untouched.
            Repr::Lazy(lazy) => Ok(lazy.buffer[..lazy.end].to_vec()),
            _ => self.encode_body(scope)?.into_unit(),
        }
    }

    pub(crate) fn has_encrypt_hook(&self, registry: &TypeRegistry) -> bool {
        match &self.repr {
            Repr::Null => false,
            Repr::Eager { value, .. } => registry.has_encryptor(value.type_name()),
            Repr::Lazy(_) => self.category == ValueCategory::Encrypted,
        }
    }

    // -----------------------------------------------------------------------
    // Deserialization
    // -----------------------------------------------------------------------

    /// Parse a unit. An `Encrypted` unit requires a keystore.
    pub fn deserialize(bytes: &[u8], keystore: Option<Arc<KeyStore>>) -> Result<Self> {
        Self::deserialize_with_context(bytes, &DeserializationContext::new(keystore))
    }

    pub fn deserialize_with_context(bytes: &[u8], context: &DeserializationContext) -> Result<Self> {
        let header = read_header(bytes)?;
        if header.category == ValueCategory::Encrypted && context.keystore.is_none() {
            return Err(SerializerError::DecryptionUnavailable(format!(
                "'{}' is encrypted and no keystore was supplied",
                header.type_name.as_deref().unwrap_or("")
            )));
        }
        Self::from_parts(
            Arc::from(bytes),
            header.category,
            header.is_encrypted,
            header.type_name,
            context,
        )
    }

    /// Wrap a unit lazily after validating only its header.
    pub fn from_bytes(bytes: &[u8], keystore: Option<Arc<KeyStore>>) -> Result<Self> {
        Self::from_shared_bytes(Arc::from(bytes), &DeserializationContext::new(keystore))
    }

    pub fn from_shared_bytes(buffer: Arc<[u8]>, context: &DeserializationContext) -> Result<Self> {
        let header = read_header(&buffer)?;
        Self::from_parts(
            buffer,
            header.category,
            header.is_encrypted,
            header.type_name,
            context,
        )
    }

    fn from_parts(
        buffer: Arc<[u8]>,
        category: ValueCategory,
        encrypted: bool,
        type_name: Option<String>,
        context: &DeserializationContext,
    ) -> Result<Self> {
        if category == ValueCategory::Null {
            return Ok(Self::null());
        }
        let start = crate::wire::body_offset(&buffer)?;
        let end = buffer.len();
        Ok(Self {
            category,
            repr: Repr::Lazy(Arc::new(LazyData {
                type_name,
                buffer,
                start,
                end,
                encrypted,
                keystore: context.keystore.clone(),
                registry: context.registry.clone(),
                decoded: OnceCell::new(),
            })),
        })
    }

    /// Run `f` over a decoder and the plaintext body of this value. In-memory
    /// values are encoded plainly first.
    fn with_body<R>(&self, f: impl FnOnce(&BodyDecoder<'_>, &[u8]) -> Result<R>) -> Result<R> {
        match &self.repr {
            Repr::Null => {
                let registry = TypeRegistry::global();
                f(
                    &BodyDecoder::detached(ValueCategory::Null, "", &registry),
                    CBOR_NULL,
                )
            }
            Repr::Eager {
                value,
                serialize_fn,
                ..
            } => {
                let registry = TypeRegistry::global();
                let encoded = serialize_fn(value, &EncodeScope::plain(&registry))?;
                let wire = encoded.type_name.as_deref().unwrap_or("");
                f(
                    &BodyDecoder::detached(encoded.category, wire, &registry),
                    &encoded.body,
                )
            }
            Repr::Lazy(lazy) => {
                let payload = lazy.payload()?;
                f(&lazy.decoder(self.category), &payload)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Typed access
    // -----------------------------------------------------------------------

    /// Shared reference to the value as `T`, decoding on first access.
    ///
    /// A lazy value caches its first successful decode; later calls asking for
    /// the same type return the same `Arc`.
    pub fn as_type_ref<T>(&self) -> Result<Arc<T>>
    where
        T: 'static + Send + Sync + DeserializeOwned,
    {
        match &self.repr {
            Repr::Eager { value, .. } => {
                if let Ok(arc) = value.as_arc::<T>() {
                    return Ok(arc);
                }
                self.with_body(|decoder, body| decoder.decode::<T>(body))
                    .map(Arc::new)
            }
            Repr::Lazy(lazy) => {
                if let Some(arc) = lazy.decoded.get().and_then(|cached| cached.as_arc::<T>().ok()) {
                    return Ok(arc);
                }
                let payload = lazy.payload()?;
                let decoded = Arc::new(lazy.decoder(self.category).decode::<T>(&payload)?);
                if lazy.decoded.set(ErasedArc::new(decoded.clone())).is_ok() {
                    log::trace!(
                        "decoded '{}' as {}",
                        lazy.wire_name(),
                        std::any::type_name::<T>()
                    );
                }
                Ok(decoded)
            }
            Repr::Null => self
                .with_body(|decoder, body| decoder.decode::<T>(body))
                .map(Arc::new),
        }
    }

    pub fn as_type<T>(&self) -> Result<T>
    where
        T: 'static + Clone + Send + Sync + DeserializeOwned,
    {
        let arc = self.as_type_ref::<T>()?;
        Ok(Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone()))
    }

    /// Decode as `T`, reporting missing or insufficient keys as
    /// [`Access::Inaccessible`] instead of an error.
    pub fn as_accessible<T>(&self) -> Result<Access<T>>
    where
        T: 'static + Clone + Send + Sync + DeserializeOwned,
    {
        match self.as_type::<T>() {
            Ok(value) => Ok(Access::Accessible(value)),
            Err(e) if e.is_access_denied() => Ok(Access::Inaccessible {
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    pub fn as_typed_list<T>(&self) -> Result<Vec<T>>
    where
        T: 'static + Clone + Send + Sync + DeserializeOwned,
    {
        self.expect_category(ValueCategory::List, "as_typed_list")?;
        match &self.repr {
            Repr::Eager { value, .. } => {
                if let Some(list) = value.downcast_ref::<Vec<T>>() {
                    return Ok(list.clone());
                }
                if let Some(values) = value.downcast_ref::<Vec<AnyValue>>() {
                    return values.iter().map(|v| v.as_type::<T>()).collect();
                }
                self.as_type::<Vec<T>>()
            }
            Repr::Lazy(lazy)
                if lazy.wire_name() == LIST_ANY || has_wide_elements(lazy.wire_name()) =>
            {
                self.as_any_value_array()?
                    .iter()
                    .map(|v| v.as_type::<T>())
                    .collect()
            }
            _ => self.as_type::<Vec<T>>(),
        }
    }

    pub fn as_typed_map<T>(&self) -> Result<HashMap<String, T>>
    where
        T: 'static + Clone + Send + Sync + DeserializeOwned,
    {
        self.expect_category(ValueCategory::Map, "as_typed_map")?;
        match &self.repr {
            Repr::Eager { value, .. } => {
                if let Some(map) = value.downcast_ref::<HashMap<String, T>>() {
                    return Ok(map.clone());
                }
                if let Some(values) = value.downcast_ref::<HashMap<String, AnyValue>>() {
                    return values
                        .iter()
                        .map(|(k, v)| Ok::<_, SerializerError>((k.clone(), v.as_type::<T>()?)))
                        .collect();
                }
                self.as_type::<HashMap<String, T>>()
            }
            Repr::Lazy(lazy)
                if lazy.wire_name() == MAP_ANY || has_wide_elements(lazy.wire_name()) =>
            {
                self.as_any_value_map()?
                    .into_iter()
                    .map(|(k, v)| Ok::<_, SerializerError>((k, v.as_type::<T>()?)))
                    .collect()
            }
            _ => self.as_type::<HashMap<String, T>>(),
        }
    }

    /// Elements as individual values; lazy elements stay undecoded.
    pub fn as_any_value_array(&self) -> Result<Vec<AnyValue>> {
        self.expect_category(ValueCategory::List, "as_any_value_array")?;
        if let Repr::Eager { value, .. } = &self.repr {
            if let Some(values) = value.downcast_ref::<Vec<AnyValue>>() {
                return Ok(values.clone());
            }
        }
        self.with_body(|decoder, body| decoder.expand_list(body))
    }

    /// Entries as individual values; lazy values stay undecoded.
    pub fn as_any_value_map(&self) -> Result<HashMap<String, AnyValue>> {
        self.expect_category(ValueCategory::Map, "as_any_value_map")?;
        if let Repr::Eager { value, .. } = &self.repr {
            if let Some(values) = value.downcast_ref::<HashMap<String, AnyValue>>() {
                return Ok(values.clone());
            }
        }
        self.with_body(|decoder, body| decoder.expand_map(body))
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        self.expect_category(ValueCategory::Bytes, "as_bytes")?;
        self.as_type::<Vec<u8>>()
    }

    pub fn as_json(&self) -> Result<JsonValue> {
        self.expect_category(ValueCategory::Json, "as_json")?;
        self.as_type::<JsonValue>()
    }

    /// JSON view of the value. Registered to-JSON hooks win; bytes become base64.
    ///
    /// In-memory values look their hook up in the process-wide registry, the
    /// same one [`AnyValue::serialize`] uses without a context.
    pub fn to_json(&self) -> Result<JsonValue> {
        match &self.repr {
            Repr::Eager {
                value,
                serialize_fn,
                to_json_fn,
            } => {
                let registry = TypeRegistry::global();
                match registry.json_converter(value.type_name()) {
                    Some(convert) => {
                        let encoded = serialize_fn(value, &EncodeScope::plain(&registry))?;
                        convert(&encoded.body)
                    }
                    None => to_json_fn(value),
                }
            }
            _ => self.with_body(|decoder, body| decoder.to_json(body)),
        }
    }

    /// Plain CBOR tree of the value, with each container element reduced to
    /// its own plaintext body.
    fn to_cbor_value(&self) -> Result<CborValue> {
        self.with_body(|decoder, body| decoder.to_cbor_value(body))
    }
}

// ---------------------------------------------------------------------------
// Body decoding
// ---------------------------------------------------------------------------

fn decrypt_keystore<'a>(
    keystore: Option<&'a Arc<KeyStore>>,
    wire: &str,
) -> Result<&'a Arc<KeyStore>> {
    let keystore = keystore.ok_or_else(|| {
        SerializerError::DecryptionUnavailable(format!("no keystore to decrypt '{wire}'"))
    })?;
    if !keystore.get_keystore_capabilities().can_decrypt {
        return Err(SerializerError::DecryptionUnavailable(format!(
            "keystore cannot decrypt '{wire}'"
        )));
    }
    Ok(keystore)
}

fn cast<S: 'static, T: 'static>(value: S) -> Option<T> {
    let boxed: Box<dyn std::any::Any> = Box::new(value);
    boxed.downcast::<T>().ok().map(|b| *b)
}

fn is_wide_int(wire: &str) -> bool {
    wire == "i128" || wire == "u128"
}

fn strip_wrapper<'a>(wire: &'a str, prefix: &str) -> Option<&'a str> {
    wire.strip_prefix(prefix)?.strip_suffix('>')
}

/// `list<i128>`, `map<string,u128>` and the like.
fn has_wide_elements(wire: &str) -> bool {
    strip_wrapper(wire, "list<")
        .or_else(|| strip_wrapper(wire, "map<string,"))
        .map_or(false, is_wide_int)
}

/// Category an element takes when a typed container is split into units.
fn category_for_wire_name(wire: &str) -> ValueCategory {
    match wire {
        "bytes" => ValueCategory::Bytes,
        "json" => ValueCategory::Json,
        w if w.starts_with("list<") => ValueCategory::List,
        w if w.starts_with("map<") => ValueCategory::Map,
        w if PRIMITIVE_WIRE_NAMES.contains(&w) => ValueCategory::Primitive,
        _ => ValueCategory::Struct,
    }
}

/// Decodes one plaintext body given its header fields.
struct BodyDecoder<'a> {
    category: ValueCategory,
    wire: &'a str,
    keystore: Option<&'a Arc<KeyStore>>,
    registry: &'a Arc<TypeRegistry>,
}

impl<'a> BodyDecoder<'a> {
    fn detached(category: ValueCategory, wire: &'a str, registry: &'a Arc<TypeRegistry>) -> Self {
        Self {
            category,
            wire,
            keystore: None,
            registry,
        }
    }

    fn mismatch<T>(&self, detail: impl fmt::Display) -> SerializerError {
        SerializerError::type_mismatch(
            std::any::type_name::<T>(),
            format!("{} '{}' ({detail})", self.category.as_str(), self.wire),
        )
    }

    /// Well-formed CBOR of the wrong shape is a type mismatch; anything else
    /// means the body itself is broken.
    fn cbor_error<T>(&self, e: serde_cbor::Error) -> SerializerError {
        if e.is_data() {
            self.mismatch::<T>(e)
        } else {
            SerializerError::Decoding(format!("{} '{}': {e}", self.category.as_str(), self.wire))
        }
    }

    fn decode_cbor<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        serde_cbor::from_slice(payload).map_err(|e| self.cbor_error::<T>(e))
    }

    fn from_json_value<T: DeserializeOwned>(&self, json: JsonValue) -> Result<T> {
        serde_json::from_value(json).map_err(|e| self.mismatch::<T>(e))
    }

    /// Decimal digits of a 128-bit primitive. Plain CBOR integers are accepted too.
    fn wide_int_digits(&self, payload: &[u8]) -> Result<String> {
        match serde_cbor::from_slice::<CborValue>(payload)? {
            CborValue::Text(digits) => Ok(digits),
            CborValue::Integer(i) => Ok(i.to_string()),
            other => Err(SerializerError::Decoding(format!(
                "'{}' body is not an integer: {other:?}",
                self.wire
            ))),
        }
    }

    fn decode<T>(&self, payload: &[u8]) -> Result<T>
    where
        T: 'static + Send + Sync + DeserializeOwned,
    {
        let target = std::any::type_name::<T>();
        match self.category {
            ValueCategory::Encrypted => {
                let Some(hook) = self.registry.decryptor_for_unit(self.wire, target) else {
                    // Reading the label-encrypted representation itself.
                    return self.decode_cbor(payload);
                };
                let keystore = decrypt_keystore(self.keystore, self.wire)?;
                hook(payload, keystore)?
                    .downcast::<T>()
                    .map(|plain| *plain)
                    .map_err(|_| self.mismatch::<T>("decrypt hook output of another type"))
            }
            ValueCategory::Bytes => {
                cast::<Vec<u8>, T>(payload.to_vec()).ok_or_else(|| self.mismatch::<T>("raw bytes"))
            }
            ValueCategory::Json => {
                let json: JsonValue = serde_cbor::from_slice(payload)?;
                self.from_json_value(json)
            }
            ValueCategory::Primitive if is_wide_int(self.wire) => {
                let digits = self.wide_int_digits(payload)?;
                serde_json::from_str(&digits).map_err(|e| self.mismatch::<T>(e))
            }
            ValueCategory::List | ValueCategory::Map if self.has_unit_elements() => {
                let tree = self.to_cbor_value(payload)?;
                serde_cbor::value::from_value(tree).map_err(|e| self.cbor_error::<T>(e))
            }
            _ => self.decode_cbor(payload),
        }
    }

    /// Containers whose elements cannot be read as one CBOR body.
    fn has_unit_elements(&self) -> bool {
        self.wire == LIST_ANY || self.wire == MAP_ANY || has_wide_elements(self.wire)
    }

    /// Plain CBOR form of this body. Byte strings become integer arrays (the
    /// serde shape of `Vec<u8>`), 128-bit integers become CBOR integers when
    /// they fit in 64 bits, and unit containers are rebuilt from their elements.
    fn to_cbor_value(&self, payload: &[u8]) -> Result<CborValue> {
        match self.category {
            ValueCategory::Null => Ok(CborValue::Null),
            ValueCategory::Bytes => Ok(CborValue::Array(
                payload.iter().map(|b| CborValue::Integer(i128::from(*b))).collect(),
            )),
            ValueCategory::Primitive if is_wide_int(self.wire) => {
                let digits = self.wide_int_digits(payload)?;
                Ok(match digits.parse::<i128>() {
                    Ok(v) if i64::try_from(v).is_ok() || u64::try_from(v).is_ok() => {
                        CborValue::Integer(v)
                    }
                    _ => CborValue::Text(digits),
                })
            }
            ValueCategory::List if self.has_unit_elements() => self
                .expand_list(payload)?
                .iter()
                .map(AnyValue::to_cbor_value)
                .collect::<Result<Vec<_>>>()
                .map(CborValue::Array),
            ValueCategory::Map if self.has_unit_elements() => {
                let mut entries = BTreeMap::new();
                for (key, value) in self.expand_map(payload)? {
                    entries.insert(CborValue::Text(key), value.to_cbor_value()?);
                }
                Ok(CborValue::Map(entries))
            }
            _ => serde_cbor::from_slice(payload).map_err(|e| self.cbor_error::<CborValue>(e)),
        }
    }

    fn element_from_unit(&self, unit: Vec<u8>) -> Result<AnyValue> {
        let header = read_header(&unit)?;
        let context = DeserializationContext {
            keystore: self.keystore.cloned(),
            registry: self.registry.clone(),
        };
        AnyValue::from_parts(
            Arc::from(unit),
            header.category,
            header.is_encrypted,
            header.type_name,
            &context,
        )
    }

    fn element_from_cbor(&self, elem_wire: &str, item: CborValue) -> Result<AnyValue> {
        let category = category_for_wire_name(elem_wire);
        let body = match (category, item) {
            (ValueCategory::Bytes, CborValue::Bytes(raw)) => raw,
            (ValueCategory::Bytes, other) => serde_cbor::value::from_value::<Vec<u8>>(other)?,
            (_, other) => to_cbor(&other)?,
        };
        self.element_from_unit(EncodedBody::new(category, elem_wire, body).into_unit()?)
    }

    fn expand_list(&self, payload: &[u8]) -> Result<Vec<AnyValue>> {
        if self.wire == LIST_ANY {
            let units: Vec<ByteBuf> = serde_cbor::from_slice(payload)?;
            return units
                .into_iter()
                .map(|unit| self.element_from_unit(unit.into_vec()))
                .collect();
        }
        let elem_wire = strip_wrapper(self.wire, "list<")
            .ok_or_else(|| self.mismatch::<Vec<AnyValue>>("not a list wire name"))?;
        let items: Vec<CborValue> = serde_cbor::from_slice(payload)?;
        items
            .into_iter()
            .map(|item| self.element_from_cbor(elem_wire, item))
            .collect()
    }

    fn expand_map(&self, payload: &[u8]) -> Result<HashMap<String, AnyValue>> {
        if self.wire == MAP_ANY {
            let units: BTreeMap<String, ByteBuf> = serde_cbor::from_slice(payload)?;
            return units
                .into_iter()
                .map(|(key, unit)| Ok::<_, SerializerError>((key, self.element_from_unit(unit.into_vec())?)))
                .collect();
        }
        let elem_wire = strip_wrapper(self.wire, "map<string,")
            .ok_or_else(|| self.mismatch::<HashMap<String, AnyValue>>("not a map wire name"))?;
        let items: BTreeMap<String, CborValue> = serde_cbor::from_slice(payload)?;
        items
            .into_iter()
            .map(|(key, item)| Ok::<_, SerializerError>((key, self.element_from_cbor(elem_wire, item)?)))
            .collect()
    }

    fn to_json(&self, payload: &[u8]) -> Result<JsonValue> {
        match self.category {
            ValueCategory::Null => Ok(JsonValue::Null),
            ValueCategory::Bytes => Ok(JsonValue::String(
                base64::engine::general_purpose::STANDARD.encode(payload),
            )),
            ValueCategory::Json => Ok(serde_cbor::from_slice(payload)?),
            ValueCategory::List if self.wire == LIST_ANY => self
                .expand_list(payload)?
                .iter()
                .map(AnyValue::to_json)
                .collect::<Result<Vec<_>>>()
                .map(JsonValue::Array),
            ValueCategory::Map if self.wire == MAP_ANY => {
                let mut object = serde_json::Map::new();
                for (key, value) in self.expand_map(payload)? {
                    object.insert(key, value.to_json()?);
                }
                Ok(JsonValue::Object(object))
            }
            ValueCategory::Primitive if is_wide_int(self.wire) => {
                Ok(JsonValue::String(self.wide_int_digits(payload)?))
            }
            ValueCategory::Encrypted => cbor_to_json(serde_cbor::from_slice(payload)?),
            _ => match self.registry.json_converter_by_wire_name(self.wire) {
                Some(convert) => convert(payload),
                None => cbor_to_json(serde_cbor::from_slice(payload)?),
            },
        }
    }
}

fn cbor_key(key: CborValue) -> Result<String> {
    match key {
        CborValue::Text(s) => Ok(s),
        CborValue::Integer(i) => Ok(i.to_string()),
        CborValue::Bool(b) => Ok(b.to_string()),
        other => Err(SerializerError::Decoding(format!(
            "map key {other:?} has no JSON form"
        ))),
    }
}

fn cbor_to_json(value: CborValue) -> Result<JsonValue> {
    Ok(match value {
        CborValue::Null => JsonValue::Null,
        CborValue::Bool(b) => JsonValue::Bool(b),
        CborValue::Integer(i) => {
            if let Ok(v) = i64::try_from(i) {
                JsonValue::from(v)
            } else if let Ok(v) = u64::try_from(i) {
                JsonValue::from(v)
            } else {
                JsonValue::String(i.to_string())
            }
        }
        CborValue::Float(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        CborValue::Bytes(b) => {
            JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        CborValue::Text(s) => JsonValue::String(s),
        CborValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .map(cbor_to_json)
                .collect::<Result<Vec<_>>>()?,
        ),
        CborValue::Map(entries) => {
            let mut object = serde_json::Map::with_capacity(entries.len());
            for (key, value) in entries {
                object.insert(cbor_key(key)?, cbor_to_json(value)?);
            }
            JsonValue::Object(object)
        }
        CborValue::Tag(_, inner) => cbor_to_json(*inner)?,
        other => {
            return Err(SerializerError::Decoding(format!(
                "unsupported CBOR value {other:?}"
            )))
        }
    })
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Types with a canonical AnyValue representation.
pub trait AsAnyValue: Sized {
    fn into_any_value(self) -> AnyValue;

    fn from_any_value(value: &AnyValue) -> Result<Self>;
}

macro_rules! any_value_primitive {
    ($($t:ty),*) => {$(
        impl From<$t> for AnyValue {
            fn from(value: $t) -> Self {
                AnyValue::new_primitive(value)
            }
        }

        impl AsAnyValue for $t {
            fn into_any_value(self) -> AnyValue {
                AnyValue::new_primitive(self)
            }

            fn from_any_value(value: &AnyValue) -> Result<Self> {
                value.as_type::<$t>()
            }
        }
    )*};
}

any_value_primitive!(
    String, bool, char, i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, f32, f64
);

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        AnyValue::new_primitive(value.to_string())
    }
}

impl From<Vec<u8>> for AnyValue {
    fn from(value: Vec<u8>) -> Self {
        AnyValue::new_bytes(value)
    }
}

impl From<JsonValue> for AnyValue {
    fn from(value: JsonValue) -> Self {
        AnyValue::new_json(value)
    }
}

impl From<Vec<AnyValue>> for AnyValue {
    fn from(value: Vec<AnyValue>) -> Self {
        AnyValue::new_list(value)
    }
}

impl From<HashMap<String, AnyValue>> for AnyValue {
    fn from(value: HashMap<String, AnyValue>) -> Self {
        AnyValue::new_map(value)
    }
}

impl AsAnyValue for Vec<u8> {
    fn into_any_value(self) -> AnyValue {
        AnyValue::new_bytes(self)
    }

    fn from_any_value(value: &AnyValue) -> Result<Self> {
        value.as_bytes()
    }
}

impl AsAnyValue for JsonValue {
    fn into_any_value(self) -> AnyValue {
        AnyValue::new_json(self)
    }

    fn from_any_value(value: &AnyValue) -> Result<Self> {
        value.to_json()
    }
}

impl AsAnyValue for AnyValue {
    fn into_any_value(self) -> AnyValue {
        self
    }

    fn from_any_value(value: &AnyValue) -> Result<Self> {
        Ok(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{body_offset, read_header};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    fn roundtrip(value: &AnyValue) -> AnyValue {
        let bytes = value.serialize(None).unwrap();
        AnyValue::deserialize(&bytes, None).unwrap()
    }

    #[test]
    fn primitives_roundtrip_lazily() {
        let decoded = roundtrip(&AnyValue::from(42i32));
        assert!(decoded.is_lazy());
        assert_eq!(decoded.category(), ValueCategory::Primitive);
        assert_eq!(decoded.wire_name(), Some("i32"));
        assert_eq!(decoded.as_type::<i32>().unwrap(), 42);

        assert_eq!(roundtrip(&AnyValue::from("hi")).as_type::<String>().unwrap(), "hi");
        assert!(roundtrip(&AnyValue::from(true)).as_type::<bool>().unwrap());
        assert_eq!(roundtrip(&AnyValue::from('x')).as_type::<char>().unwrap(), 'x');
        assert_eq!(roundtrip(&AnyValue::from(1.5f64)).as_type::<f64>().unwrap(), 1.5);
        assert_eq!(
            roundtrip(&AnyValue::from(u128::MAX)).as_type::<u128>().unwrap(),
            u128::MAX
        );
    }

    #[test]
    fn first_decode_is_cached() {
        let decoded = roundtrip(&AnyValue::from("cached"));
        let a = decoded.as_type_ref::<String>().unwrap();
        let b = decoded.as_type_ref::<String>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn bytes_body_is_raw() {
        let bytes = AnyValue::from(vec![1u8, 2, 3]).serialize(None).unwrap();
        let offset = body_offset(&bytes).unwrap();
        assert_eq!(&bytes[offset..], &[1, 2, 3]);

        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(decoded.as_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(decoded.to_json().unwrap(), json!("AQID"));
    }

    #[test]
    fn null_is_a_bare_header() {
        let bytes = AnyValue::null().serialize(None).unwrap();
        assert_eq!(bytes, vec![0, 0, 0]);
        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        assert!(decoded.is_null());
        assert_eq!(decoded.as_type::<Option<i32>>().unwrap(), None);
        assert_eq!(decoded.to_json().unwrap(), JsonValue::Null);
    }

    #[test]
    fn struct_uses_short_name_without_registration() {
        let reading = Reading {
            sensor: "t1".into(),
            value: 20.5,
        };
        let bytes = AnyValue::new_struct(reading.clone())
            .serialize_plain(&TypeRegistry::new())
            .unwrap();
        let header = read_header(&bytes).unwrap();
        assert_eq!(header.category, ValueCategory::Struct);
        assert_eq!(header.type_name.as_deref(), Some("Reading"));

        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(decoded.as_type::<Reading>().unwrap(), reading);
        assert_eq!(
            decoded.to_json().unwrap(),
            json!({"sensor": "t1", "value": 20.5})
        );
    }

    #[test]
    fn typed_list_expands_into_lazy_elements() {
        let bytes = AnyValue::new_typed_list(vec![1i64, 2, 3]).serialize(None).unwrap();
        assert_eq!(read_header(&bytes).unwrap().type_name.as_deref(), Some("list<i64>"));

        let decoded = AnyValue::deserialize(&bytes, None).unwrap();
        assert_eq!(decoded.as_typed_list::<i64>().unwrap(), vec![1, 2, 3]);

        let elements = decoded.as_any_value_array().unwrap();
        assert_eq!(elements.len(), 3);
        assert!(elements.iter().all(AnyValue::is_lazy));
        assert_eq!(elements[2].wire_name(), Some("i64"));
        assert_eq!(elements[2].as_type::<i64>().unwrap(), 3);
    }

    #[test]
    fn heterogeneous_map_roundtrip() {
        let map = HashMap::from([
            ("name".to_string(), AnyValue::from("probe")),
            ("count".to_string(), AnyValue::from(3u32)),
            ("raw".to_string(), AnyValue::from(vec![9u8])),
        ]);
        let decoded = roundtrip(&AnyValue::new_map(map));
        assert_eq!(decoded.wire_name(), Some(MAP_ANY));

        let entries = decoded.as_any_value_map().unwrap();
        assert_eq!(entries["name"].as_type::<String>().unwrap(), "probe");
        assert_eq!(entries["count"].as_type::<u32>().unwrap(), 3);
        assert_eq!(entries["raw"].as_bytes().unwrap(), vec![9]);

        assert_eq!(
            decoded.to_json().unwrap(),
            json!({"name": "probe", "count": 3, "raw": "CQ=="})
        );
    }

    #[test]
    fn json_values_coerce_into_structs() {
        let json = json!({"sensor": "t2", "value": 1.0});
        let decoded = roundtrip(&AnyValue::new_json(json.clone()));
        assert_eq!(decoded.category(), ValueCategory::Json);
        assert_eq!(decoded.as_json().unwrap(), json);
        assert_eq!(
            decoded.as_type::<Reading>().unwrap(),
            Reading {
                sensor: "t2".into(),
                value: 1.0
            }
        );
    }

    #[test]
    fn from_json_builds_a_tree() {
        let value = AnyValue::from_json(json!({"a": [1, "two", null], "b": true}));
        assert_eq!(value.category(), ValueCategory::Map);
        let entries = value.as_any_value_map().unwrap();
        let list = entries["a"].as_any_value_array().unwrap();
        assert_eq!(list[0].as_type::<i64>().unwrap(), 1);
        assert!(list[2].is_null());

        let decoded = roundtrip(&value);
        assert_eq!(
            decoded.to_json().unwrap(),
            json!({"a": [1, "two", null], "b": true})
        );
    }

    #[test]
    fn eager_values_coerce_through_their_encoding() {
        let value = AnyValue::from(7i32);
        assert_eq!(value.as_type::<i64>().unwrap(), 7);
        assert!(matches!(
            value.as_type::<String>(),
            Err(SerializerError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn lazy_values_reserialize_to_identical_bytes() {
        let original = AnyValue::new_list(vec![AnyValue::from(1u8), AnyValue::from("x")])
            .serialize(None)
            .unwrap();
        let decoded = AnyValue::deserialize(&original, None).unwrap();
        assert_eq!(decoded.serialize(None).unwrap(), original);
    }

    #[test]
    fn accessors_check_the_category() {
        let value = AnyValue::from(1u8);
        assert!(matches!(
            value.as_bytes(),
            Err(SerializerError::UnsupportedCategory(_))
        ));
        assert!(matches!(
            value.as_any_value_array(),
            Err(SerializerError::UnsupportedCategory(_))
        ));
    }

    #[test]
    fn as_any_value_conversions() {
        assert_eq!(u16::from_any_value(&5u16.into_any_value()).unwrap(), 5);
        assert_eq!(
            Vec::<u8>::from_any_value(&vec![1u8, 2].into_any_value()).unwrap(),
            vec![1, 2]
        );
        let json = json!({"k": 1});
        assert_eq!(JsonValue::from_any_value(&json.clone().into_any_value()).unwrap(), json);
    }
}
