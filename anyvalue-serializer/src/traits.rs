use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::label_resolver::LabelResolver;
use crate::registry::TypeRegistry;

// ---------------------------------------------------------------------------
// Keystore capability (implemented outside this crate)
// ---------------------------------------------------------------------------

/// Envelope encrypted data as produced by a keystore.
///
/// The payload is encrypted once with a random content key; the content key is
/// then encrypted for the network key and for every profile key.
#[derive(Serialize, Deserialize, Clone, PartialEq, prost::Message)]
pub struct EnvelopeEncryptedData {
    /// The encrypted data payload
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "serde_bytes")]
    pub encrypted_data: Vec<u8>,
    /// Network this data was encrypted for, if any
    #[prost(string, optional, tag = "2")]
    pub network_id: Option<String>,
    /// Content key encrypted with the network key (empty when no network recipient)
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "serde_bytes")]
    pub network_encrypted_key: Vec<u8>,
    /// Content key encrypted with each profile key, by recipient id
    #[prost(map = "string, bytes", tag = "4")]
    pub profile_encrypted_keys: HashMap<String, Vec<u8>>,
}

/// What a keystore is able to do in the current process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreCapabilities {
    pub has_profile_keys: bool,
    pub has_network_keys: bool,
    pub can_encrypt: bool,
    pub can_decrypt: bool,
}

/// Envelope encryption capability consumed by the serializer.
///
/// All calls are synchronous from the serializer's point of view.
pub trait EnvelopeCrypto: Send + Sync {
    fn encrypt_with_envelope(
        &self,
        data: &[u8],
        network_public_key: Option<&[u8]>,
        profile_public_keys: Vec<Vec<u8>>,
    ) -> anyhow::Result<EnvelopeEncryptedData>;

    fn decrypt_envelope_data(&self, env: &EnvelopeEncryptedData) -> anyhow::Result<Vec<u8>>;

    fn get_keystore_capabilities(&self) -> KeystoreCapabilities;
}

// Trait-object alias used throughout the crate.
pub type KeyStore = dyn EnvelopeCrypto;

// ---------------------------------------------------------------------------
// Label-group encryption for user types
// ---------------------------------------------------------------------------

/// Decrypt a label-encrypted representation back into its plain type.
///
/// Label groups the keystore cannot open are left at their default values.
pub trait LabelDecrypt {
    type Decrypted;

    fn decrypt_with_keystore(&self, keystore: &Arc<KeyStore>) -> Result<Self::Decrypted>;
}

/// Encrypt a struct's labelled field groups, producing its encrypted representation.
pub trait LabelEncrypt: Sized {
    type Encrypted: LabelDecrypt<Decrypted = Self> + Serialize + DeserializeOwned;

    fn encrypt_with_keystore(
        &self,
        keystore: &Arc<KeyStore>,
        resolver: &dyn LabelResolver,
    ) -> Result<Self::Encrypted>;
}

// ---------------------------------------------------------------------------
// Serialization / deserialization contexts
// ---------------------------------------------------------------------------

/// Recipients for whole-value envelope encryption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeRecipients {
    pub network_public_key: Option<Vec<u8>>,
    pub profile_public_keys: Vec<Vec<u8>>,
}

/// Everything the encryption orchestrator needs at serialization time.
#[derive(Clone)]
pub struct SerializationContext {
    pub keystore: Arc<KeyStore>,
    pub resolver: Arc<dyn LabelResolver>,
    pub registry: Arc<TypeRegistry>,
    /// When set, the encoded body is additionally envelope-encrypted as a whole.
    pub envelope: Option<EnvelopeRecipients>,
}

impl SerializationContext {
    pub fn new(keystore: Arc<KeyStore>, resolver: Arc<dyn LabelResolver>) -> Self {
        Self {
            keystore,
            resolver,
            registry: TypeRegistry::global(),
            envelope: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_envelope(
        mut self,
        network_public_key: Option<Vec<u8>>,
        profile_public_keys: Vec<Vec<u8>>,
    ) -> Self {
        self.envelope = Some(EnvelopeRecipients {
            network_public_key,
            profile_public_keys,
        });
        self
    }
}

/// Decrypt capability and registry handed to lazily decoded values.
#[derive(Clone)]
pub struct DeserializationContext {
    pub keystore: Option<Arc<KeyStore>>,
    pub registry: Arc<TypeRegistry>,
}

impl DeserializationContext {
    pub fn new(keystore: Option<Arc<KeyStore>>) -> Self {
        Self {
            keystore,
            registry: TypeRegistry::global(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

impl Default for DeserializationContext {
    fn default() -> Self {
        Self::new(None)
    }
}
