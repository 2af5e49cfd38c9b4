//! Label-encryptable types used across the integration tests.
//!
//! `TestProfile` field labels:
//! - `id`, `created_at`: plaintext
//! - `name`: user
//! - `email`: user and system
//! - `admin_notes`: system
//!
//! `TestAccount` field labels:
//! - `id`: plaintext
//! - `owner`: user
//! - `balance_cents`: system
//! - `tags`: search

use std::sync::Arc;

use anyvalue_serializer::{
    encrypt_label_group, try_decrypt_label_group, AnyValue, AsAnyValue, EncryptedLabelGroup,
    KeyStore, LabelDecrypt, LabelEncrypt, LabelResolver, Result, TypeRegistry,
};
use serde::{Deserialize, Serialize};

pub const PROFILE_WIRE_NAME: &str = "test.Profile";
pub const ACCOUNT_WIRE_NAME: &str = "test.Account";

/// Register the fixture types (wire names plus encrypt / decrypt hooks).
pub fn register_fixture_types(registry: &TypeRegistry) -> Result<()> {
    registry.register_encryptable::<TestProfile>(PROFILE_WIRE_NAME)?;
    registry.register_encryptable::<TestAccount>(ACCOUNT_WIRE_NAME)?;
    Ok(())
}

/// Encrypt `fields` under `label` when the resolver can use that label here.
fn optional_group<T: Serialize>(
    label: &str,
    fields: &T,
    keystore: &Arc<KeyStore>,
    resolver: &dyn LabelResolver,
) -> Result<Option<EncryptedLabelGroup>> {
    if !resolver.can_resolve(label) {
        return Ok(None);
    }
    encrypt_label_group(label, fields, keystore.as_ref(), resolver).map(Some)
}

// ---------------------------------------------------------------------------
// TestProfile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub admin_notes: String,
    pub created_at: u64,
}

#[derive(Serialize, Deserialize)]
struct ProfileUserFields {
    name: String,
    email: String,
}

#[derive(Serialize, Deserialize)]
struct ProfileSystemFields {
    email: String,
    admin_notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedTestProfile {
    pub id: String,
    pub created_at: u64,
    pub user_encrypted: Option<EncryptedLabelGroup>,
    pub system_encrypted: Option<EncryptedLabelGroup>,
}

impl LabelEncrypt for TestProfile {
    type Encrypted = EncryptedTestProfile;

    fn encrypt_with_keystore(
        &self,
        keystore: &Arc<KeyStore>,
        resolver: &dyn LabelResolver,
    ) -> Result<EncryptedTestProfile> {
        let user = ProfileUserFields {
            name: self.name.clone(),
            email: self.email.clone(),
        };
        let system = ProfileSystemFields {
            email: self.email.clone(),
            admin_notes: self.admin_notes.clone(),
        };
        Ok(EncryptedTestProfile {
            id: self.id.clone(),
            created_at: self.created_at,
            user_encrypted: optional_group("user", &user, keystore, resolver)?,
            system_encrypted: optional_group("system", &system, keystore, resolver)?,
        })
    }
}

impl LabelDecrypt for EncryptedTestProfile {
    type Decrypted = TestProfile;

    fn decrypt_with_keystore(&self, keystore: &Arc<KeyStore>) -> Result<TestProfile> {
        let mut profile = TestProfile {
            id: self.id.clone(),
            created_at: self.created_at,
            ..TestProfile::default()
        };

        if let Some(user) = try_decrypt_label_group::<ProfileUserFields>(
            self.user_encrypted.as_ref(),
            keystore.as_ref(),
        )? {
            profile.name = user.name;
            profile.email = user.email;
        }

        // system wins for fields present in both groups
        if let Some(system) = try_decrypt_label_group::<ProfileSystemFields>(
            self.system_encrypted.as_ref(),
            keystore.as_ref(),
        )? {
            profile.email = system.email;
            profile.admin_notes = system.admin_notes;
        }

        Ok(profile)
    }
}

impl AsAnyValue for TestProfile {
    fn into_any_value(self) -> AnyValue {
        AnyValue::new_struct(self)
    }

    fn from_any_value(value: &AnyValue) -> Result<Self> {
        value.as_type()
    }
}

// ---------------------------------------------------------------------------
// TestAccount
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestAccount {
    pub id: String,
    pub owner: String,
    pub balance_cents: i64,
    pub tags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct AccountUserFields {
    owner: String,
}

#[derive(Serialize, Deserialize)]
struct AccountSystemFields {
    balance_cents: i64,
}

#[derive(Serialize, Deserialize)]
struct AccountSearchFields {
    tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedTestAccount {
    pub id: String,
    pub user_encrypted: Option<EncryptedLabelGroup>,
    pub system_encrypted: Option<EncryptedLabelGroup>,
    pub search_encrypted: Option<EncryptedLabelGroup>,
}

impl LabelEncrypt for TestAccount {
    type Encrypted = EncryptedTestAccount;

    fn encrypt_with_keystore(
        &self,
        keystore: &Arc<KeyStore>,
        resolver: &dyn LabelResolver,
    ) -> Result<EncryptedTestAccount> {
        Ok(EncryptedTestAccount {
            id: self.id.clone(),
            user_encrypted: optional_group(
                "user",
                &AccountUserFields {
                    owner: self.owner.clone(),
                },
                keystore,
                resolver,
            )?,
            system_encrypted: optional_group(
                "system",
                &AccountSystemFields {
                    balance_cents: self.balance_cents,
                },
                keystore,
                resolver,
            )?,
            search_encrypted: optional_group(
                "search",
                &AccountSearchFields {
                    tags: self.tags.clone(),
                },
                keystore,
                resolver,
            )?,
        })
    }
}

impl LabelDecrypt for EncryptedTestAccount {
    type Decrypted = TestAccount;

    fn decrypt_with_keystore(&self, keystore: &Arc<KeyStore>) -> Result<TestAccount> {
        let keystore = keystore.as_ref();
        let mut account = TestAccount {
            id: self.id.clone(),
            ..TestAccount::default()
        };
        if let Some(user) =
            try_decrypt_label_group::<AccountUserFields>(self.user_encrypted.as_ref(), keystore)?
        {
            account.owner = user.owner;
        }
        if let Some(system) = try_decrypt_label_group::<AccountSystemFields>(
            self.system_encrypted.as_ref(),
            keystore,
        )? {
            account.balance_cents = system.balance_cents;
        }
        if let Some(search) = try_decrypt_label_group::<AccountSearchFields>(
            self.search_encrypted.as_ref(),
            keystore,
        )? {
            account.tags = search.tags;
        }
        Ok(account)
    }
}

impl AsAnyValue for TestAccount {
    fn into_any_value(self) -> AnyValue {
        AnyValue::new_struct(self)
    }

    fn from_any_value(value: &AnyValue) -> Result<Self> {
        value.as_type()
    }
}

pub fn sample_profile() -> TestProfile {
    TestProfile {
        id: "profile-1".to_string(),
        name: "Ada".to_string(),
        email: "ada@example.com".to_string(),
        admin_notes: "verified".to_string(),
        created_at: 1_700_000_000,
    }
}

pub fn sample_account(id: &str, balance_cents: i64) -> TestAccount {
    TestAccount {
        id: id.to_string(),
        owner: "Ada".to_string(),
        balance_cents,
        tags: vec!["savings".to_string()],
    }
}
