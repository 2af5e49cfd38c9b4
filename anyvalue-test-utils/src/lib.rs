//! Test utilities for the AnyValue crates.
//!
//! ⚠️  WARNING: This is for TESTING ONLY. Do not use in production.

pub mod fixtures;
pub mod keystore;

use std::collections::HashMap;
use std::sync::Arc;

use anyvalue_serializer::{
    create_context_label_resolver, KeyStore, LabelKeyword, LabelResolver, LabelResolverConfig,
    LabelValue, Result, SerializationContext, TypeRegistry,
};
use p256::SecretKey;

pub use fixtures::*;
pub use keystore::{generate_key_pair, public_key_bytes, TestKeyStore};

/// Route `log` output through the test harness. Safe to call from every test.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Label policy used by the tests:
/// - `system`: network key only
/// - `user`: current user's profile keys only
/// - `search`: network key and current user's profile keys
pub fn create_test_label_resolver_config(network_public_key: Vec<u8>) -> LabelResolverConfig {
    LabelResolverConfig {
        label_mappings: HashMap::from([
            (
                "system".to_string(),
                LabelValue {
                    network_public_key: Some(network_public_key.clone()),
                    user_key_spec: None,
                },
            ),
            (
                "user".to_string(),
                LabelValue {
                    network_public_key: None,
                    user_key_spec: Some(LabelKeyword::CurrentUser),
                },
            ),
            (
                "search".to_string(),
                LabelValue {
                    network_public_key: Some(network_public_key),
                    user_key_spec: Some(LabelKeyword::CurrentUser),
                },
            ),
        ]),
    }
}

/// Resolver over [`create_test_label_resolver_config`] bound to `user_profile_keys`.
pub fn create_test_label_resolver(
    network_public_key: Vec<u8>,
    user_profile_keys: Option<Vec<Vec<u8>>>,
) -> Result<Arc<dyn LabelResolver>> {
    let config = create_test_label_resolver_config(network_public_key);
    let profile_keys = user_profile_keys.unwrap_or_default();
    create_context_label_resolver(&config, &profile_keys)
}

/// One network and two user identities, with keystores for the usual holders.
///
/// The "mobile" keystore holds only the first user's profile key, the "node"
/// keystore only the network key.
pub struct KeyFixture {
    network: SecretKey,
    user: SecretKey,
    other_user: SecretKey,
}

impl KeyFixture {
    pub fn generate() -> Self {
        Self {
            network: generate_key_pair().0,
            user: generate_key_pair().0,
            other_user: generate_key_pair().0,
        }
    }

    pub fn network_public_key(&self) -> Vec<u8> {
        public_key_bytes(&self.network)
    }

    pub fn user_public_key(&self) -> Vec<u8> {
        public_key_bytes(&self.user)
    }

    pub fn other_user_public_key(&self) -> Vec<u8> {
        public_key_bytes(&self.other_user)
    }

    pub fn mobile_keystore(&self) -> Arc<KeyStore> {
        Arc::new(TestKeyStore::new().with_profile_key(self.user.clone()))
    }

    pub fn node_keystore(&self) -> Arc<KeyStore> {
        Arc::new(TestKeyStore::new().with_network_key(self.network.clone()))
    }

    /// Holds both the network key and the first user's profile key.
    pub fn full_keystore(&self) -> Arc<KeyStore> {
        Arc::new(
            TestKeyStore::new()
                .with_network_key(self.network.clone())
                .with_profile_key(self.user.clone()),
        )
    }

    pub fn other_user_keystore(&self) -> Arc<KeyStore> {
        Arc::new(TestKeyStore::new().with_profile_key(self.other_user.clone()))
    }

    pub fn label_config(&self) -> LabelResolverConfig {
        create_test_label_resolver_config(self.network_public_key())
    }

    /// Resolver for requests made on behalf of the first user.
    pub fn user_resolver(&self) -> Result<Arc<dyn LabelResolver>> {
        create_context_label_resolver(&self.label_config(), &[self.user_public_key()])
    }

    /// Resolver with no user bound; only network labels resolve.
    pub fn node_resolver(&self) -> Result<Arc<dyn LabelResolver>> {
        create_context_label_resolver(&self.label_config(), &[])
    }

    /// Serialization on the mobile side: user keystore, user-bound resolver.
    pub fn mobile_context(&self, registry: Arc<TypeRegistry>) -> Result<SerializationContext> {
        Ok(SerializationContext::new(self.mobile_keystore(), self.user_resolver()?)
            .with_registry(registry))
    }

    /// Serialization on the node side: network keystore, no user bound.
    pub fn node_context(&self, registry: Arc<TypeRegistry>) -> Result<SerializationContext> {
        Ok(SerializationContext::new(self.node_keystore(), self.node_resolver()?)
            .with_registry(registry))
    }
}

/// Fresh registry with the fixture types registered.
pub fn fixture_registry() -> Result<Arc<TypeRegistry>> {
    let registry = TypeRegistry::new();
    register_fixture_types(&registry)?;
    Ok(Arc::new(registry))
}
