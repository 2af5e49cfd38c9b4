//! Serialization-time encryption decisions.
//!
//! Given the value being encoded and an optional [`SerializationContext`], decide
//! whether the value (or each element of a container) goes through a registered
//! label-encryption hook, and produce the body bytes accordingly.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_bytes::ByteBuf;

use crate::any_value::AnyValue;
use crate::error::{Result, SerializerError};
use crate::label_resolver::LabelResolver;
use crate::registry::{EncryptFn, TypeRegistry};
use crate::traits::{KeyStore, SerializationContext};
use crate::wire::{write_header_into, ValueCategory, WireHeader};

/// Wire name of a list whose elements are complete AnyValue units.
pub const LIST_ANY: &str = "list<any>";
/// Wire name of a string-keyed map whose values are complete AnyValue units.
pub const MAP_ANY: &str = "map<string,any>";

/// Header fields plus body of one value, before it is framed.
#[derive(Debug, Clone)]
pub(crate) struct EncodedBody {
    pub category: ValueCategory,
    pub type_name: Option<String>,
    pub body: Vec<u8>,
    /// Body is a whole-value envelope (header flag = 1).
    pub enveloped: bool,
}

impl EncodedBody {
    pub fn new(category: ValueCategory, type_name: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            category,
            type_name: Some(type_name.into()),
            body,
            enveloped: false,
        }
    }

    pub fn null() -> Self {
        Self {
            category: ValueCategory::Null,
            type_name: None,
            body: Vec::new(),
            enveloped: false,
        }
    }

    /// Frame as `header || body`.
    pub fn into_unit(self) -> Result<Vec<u8>> {
        let header = WireHeader::new(self.category, self.enveloped, self.type_name);
        let mut buf = Vec::with_capacity(header.encoded_len() + self.body.len());
        write_header_into(&header, &mut buf)?;
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }
}

/// Registry plus, when the context can encrypt, the keystore and resolver.
#[derive(Clone, Copy)]
pub(crate) struct EncodeScope<'a> {
    pub registry: &'a TypeRegistry,
    crypto: Option<(&'a Arc<KeyStore>, &'a dyn LabelResolver)>,
}

impl<'a> EncodeScope<'a> {
    pub fn new(registry: &'a TypeRegistry, context: Option<&'a SerializationContext>) -> Self {
        let crypto = context.and_then(|ctx| {
            if ctx.keystore.get_keystore_capabilities().can_encrypt {
                Some((&ctx.keystore, ctx.resolver.as_ref()))
            } else {
                log::debug!("keystore cannot encrypt, encoding without label encryption");
                None
            }
        });
        Self { registry, crypto }
    }

    pub fn plain(registry: &'a TypeRegistry) -> Self {
        Self {
            registry,
            crypto: None,
        }
    }

    fn without_crypto(&self) -> Self {
        Self::plain(self.registry)
    }

    pub fn can_encrypt(&self) -> bool {
        self.crypto.is_some()
    }

    fn hook_for(&self, logical_name: &str) -> Option<(EncryptFn, &'a Arc<KeyStore>, &'a dyn LabelResolver)> {
        let (keystore, resolver) = self.crypto?;
        let hook = self.registry.encryptor(logical_name)?;
        Some((hook, keystore, resolver))
    }
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_cbor::to_vec(value).map_err(|e| SerializerError::Encoding(e.to_string()))
}

fn is_wide_int<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<i128>() || TypeId::of::<T>() == TypeId::of::<u128>()
}

/// Decimal text of an `i128` / `u128` element, the same form their scalar body uses.
fn wide_int_text<T: 'static>(value: &T) -> Result<String> {
    let any = value as &dyn Any;
    any.downcast_ref::<i128>()
        .map(ToString::to_string)
        .or_else(|| any.downcast_ref::<u128>().map(ToString::to_string))
        .ok_or_else(|| {
            SerializerError::Encoding(format!("{} is not a 128-bit integer", std::any::type_name::<T>()))
        })
}

/// Run the registered encrypt hook for `T`. `None` when `T` has no hook or the
/// scope cannot encrypt.
fn encrypt_with_hook<T: 'static>(value: &T, scope: &EncodeScope<'_>) -> Result<Option<Vec<u8>>> {
    match scope.hook_for(std::any::type_name::<T>()) {
        Some((hook, keystore, resolver)) => hook(value as &dyn Any, keystore, resolver).map(Some),
        None => Ok(None),
    }
}

/// A struct goes through its encrypt hook when it has one, else plain CBOR.
pub(crate) fn encode_struct<T>(value: &T, scope: &EncodeScope<'_>) -> Result<EncodedBody>
where
    T: 'static + Serialize,
{
    let wire = scope.registry.wire_name_of::<T>();
    if let Some(body) = encrypt_with_hook(value, scope)? {
        log::trace!("encrypted struct '{wire}' through its label hook");
        return Ok(EncodedBody::new(ValueCategory::Encrypted, wire, body));
    }
    Ok(EncodedBody::new(ValueCategory::Struct, wire, to_cbor(value)?))
}

fn encrypted_unit<T: 'static>(value: &T, wire: &str, scope: &EncodeScope<'_>) -> Result<ByteBuf> {
    let body = encrypt_with_hook(value, scope)?.ok_or_else(|| {
        SerializerError::EncryptionFailed(format!("no encrypt hook for '{wire}'"))
    })?;
    let unit = EncodedBody::new(ValueCategory::Encrypted, wire, body).into_unit()?;
    Ok(ByteBuf::from(unit))
}

/// `Vec<T>`: every element shares one type, so either all elements are
/// encrypted as independent units or the list is plain CBOR of `Vec<T>`.
pub(crate) fn encode_typed_list<T>(list: &[T], scope: &EncodeScope<'_>) -> Result<EncodedBody>
where
    T: 'static + Serialize,
{
    let elem_wire = scope.registry.wire_name_of::<T>();
    if scope.hook_for(std::any::type_name::<T>()).is_some() {
        let units = list
            .iter()
            .map(|item| encrypted_unit(item, &elem_wire, scope))
            .collect::<Result<Vec<_>>>()?;
        return Ok(EncodedBody::new(ValueCategory::List, LIST_ANY, to_cbor(&units)?));
    }
    let body = if is_wide_int::<T>() {
        let digits = list.iter().map(wide_int_text::<T>).collect::<Result<Vec<_>>>()?;
        to_cbor(&digits)?
    } else {
        to_cbor(&list)?
    };
    Ok(EncodedBody::new(ValueCategory::List, format!("list<{elem_wire}>"), body))
}

/// `HashMap<String, T>`: values follow the typed-list rule; keys stay plain.
pub(crate) fn encode_typed_map<T>(
    map: &HashMap<String, T>,
    scope: &EncodeScope<'_>,
) -> Result<EncodedBody>
where
    T: 'static + Serialize,
{
    let elem_wire = scope.registry.wire_name_of::<T>();
    if scope.hook_for(std::any::type_name::<T>()).is_some() {
        let mut units = BTreeMap::new();
        for (key, value) in map {
            units.insert(key.clone(), encrypted_unit(value, &elem_wire, scope)?);
        }
        return Ok(EncodedBody::new(ValueCategory::Map, MAP_ANY, to_cbor(&units)?));
    }
    let body = if is_wide_int::<T>() {
        let mut digits = BTreeMap::new();
        for (key, value) in map {
            digits.insert(key.clone(), wide_int_text(value)?);
        }
        to_cbor(&digits)?
    } else {
        to_cbor(map)?
    };
    Ok(EncodedBody::new(ValueCategory::Map, format!("map<string,{elem_wire}>"), body))
}

/// Element scope for a heterogeneous container: the context's crypto only when
/// every element has an encrypt hook, otherwise none at all.
fn element_scope<'a, 'v>(
    mut elements: impl Iterator<Item = &'v AnyValue>,
    scope: &EncodeScope<'a>,
    what: &str,
) -> EncodeScope<'a> {
    if !scope.can_encrypt() {
        return *scope;
    }
    if elements.all(|value| value.has_encrypt_hook(scope.registry)) {
        *scope
    } else {
        log::debug!("{what} holds elements without encrypt hooks, encoding all elements plain");
        scope.without_crypto()
    }
}

/// `Vec<AnyValue>`: a CBOR array of complete units.
pub(crate) fn encode_value_list(list: &[AnyValue], scope: &EncodeScope<'_>) -> Result<EncodedBody> {
    let inner = element_scope(list.iter(), scope, "list");
    let units = list
        .iter()
        .map(|value| value.encode_unit(&inner).map(ByteBuf::from))
        .collect::<Result<Vec<_>>>()?;
    Ok(EncodedBody::new(ValueCategory::List, LIST_ANY, to_cbor(&units)?))
}

/// `HashMap<String, AnyValue>`: a CBOR map from key to complete unit.
pub(crate) fn encode_value_map(
    map: &HashMap<String, AnyValue>,
    scope: &EncodeScope<'_>,
) -> Result<EncodedBody> {
    let inner = element_scope(map.values(), scope, "map");
    let mut units = BTreeMap::new();
    for (key, value) in map {
        units.insert(key.clone(), ByteBuf::from(value.encode_unit(&inner)?));
    }
    Ok(EncodedBody::new(ValueCategory::Map, MAP_ANY, to_cbor(&units)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::read_header;

    #[test]
    fn units_carry_header_and_body() {
        let unit = EncodedBody::new(ValueCategory::Primitive, "string", vec![0x61, b'a'])
            .into_unit()
            .unwrap();
        assert_eq!(unit, vec![1, 0, 6, b's', b't', b'r', b'i', b'n', b'g', 0x61, b'a']);

        let null = EncodedBody::null().into_unit().unwrap();
        assert_eq!(null, vec![0, 0, 0]);
    }

    #[test]
    fn plain_scope_never_encrypts_typed_lists() {
        let registry = TypeRegistry::new();
        let scope = EncodeScope::plain(&registry);
        let encoded = encode_typed_list(&[1i32, 2, 3], &scope).unwrap();
        assert_eq!(encoded.category, ValueCategory::List);
        assert_eq!(encoded.type_name.as_deref(), Some("list<i32>"));
        let decoded: Vec<i32> = serde_cbor::from_slice(&encoded.body).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn wide_int_elements_are_decimal_text() {
        let registry = TypeRegistry::new();
        let scope = EncodeScope::plain(&registry);
        let encoded = encode_typed_list(&[u128::MAX, 7], &scope).unwrap();
        assert_eq!(encoded.type_name.as_deref(), Some("list<u128>"));
        let digits: Vec<String> = serde_cbor::from_slice(&encoded.body).unwrap();
        assert_eq!(digits, vec![u128::MAX.to_string(), "7".to_string()]);

        let map = HashMap::from([("low".to_string(), i128::MIN)]);
        let encoded = encode_typed_map(&map, &scope).unwrap();
        let digits: BTreeMap<String, String> = serde_cbor::from_slice(&encoded.body).unwrap();
        assert_eq!(digits["low"], i128::MIN.to_string());
    }

    #[test]
    fn value_lists_hold_independent_units() {
        let registry = TypeRegistry::new();
        let scope = EncodeScope::plain(&registry);
        let list = vec![AnyValue::from(7u8), AnyValue::from("x")];
        let encoded = encode_value_list(&list, &scope).unwrap();
        assert_eq!(encoded.type_name.as_deref(), Some(LIST_ANY));

        let units: Vec<ByteBuf> = serde_cbor::from_slice(&encoded.body).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(read_header(&units[0]).unwrap().type_name.as_deref(), Some("u8"));
        assert_eq!(read_header(&units[1]).unwrap().type_name.as_deref(), Some("string"));
    }
}
