//! Label-group and whole-value envelope encryption helpers.

use prost::Message;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SerializerError};
use crate::label_resolver::{compare_labels, LabelResolver};
use crate::traits::{EnvelopeEncryptedData, EnvelopeRecipients, KeyStore};

/// Container for label-grouped encryption (one per label)
#[derive(Serialize, Deserialize, Clone, PartialEq, prost::Message)]
pub struct EncryptedLabelGroup {
    /// The label this group was encrypted with
    #[prost(string, tag = "1")]
    pub label: String,
    /// Envelope-encrypted payload produced by the keystore
    #[prost(message, optional, tag = "2")]
    pub envelope: ::core::option::Option<EnvelopeEncryptedData>,
}

impl EncryptedLabelGroup {
    pub fn is_empty(&self) -> bool {
        match &self.envelope {
            Some(env) => env.encrypted_data.is_empty(),
            None => true,
        }
    }
}

/// Encrypt a group of fields that share the same label ("user", "system", ...)
pub fn encrypt_label_group<T: Serialize>(
    label: &str,
    fields_struct: &T,
    keystore: &KeyStore,
    resolver: &dyn LabelResolver,
) -> Result<EncryptedLabelGroup> {
    let info = resolver
        .resolve_label_info(label)?
        .ok_or_else(|| SerializerError::LabelNotFound(label.to_string()))?;

    let plain_bytes =
        serde_cbor::to_vec(fields_struct).map_err(|e| SerializerError::Encoding(e.to_string()))?;

    let envelope = keystore
        .encrypt_with_envelope(
            &plain_bytes,
            info.network_public_key.as_deref(),
            info.profile_public_keys,
        )
        .map_err(|e| SerializerError::EncryptionFailed(format!("label '{label}': {e}")))?;

    Ok(EncryptedLabelGroup {
        label: label.to_string(),
        envelope: Some(envelope),
    })
}

/// Decrypt a label group back into its field struct.
///
/// Fails with `EmptyEncryptedGroup` when there is nothing to decrypt and with
/// `DecryptionFailed` when the keystore holds none of the recipient keys.
pub fn decrypt_label_group<T: DeserializeOwned>(
    encrypted_group: &EncryptedLabelGroup,
    keystore: &KeyStore,
) -> Result<T> {
    let env = match &encrypted_group.envelope {
        Some(env) if !env.encrypted_data.is_empty() => env,
        _ => {
            return Err(SerializerError::EmptyEncryptedGroup(
                encrypted_group.label.clone(),
            ))
        }
    };

    let plaintext = keystore.decrypt_envelope_data(env).map_err(|e| {
        SerializerError::DecryptionFailed(format!("label '{}': {e}", encrypted_group.label))
    })?;

    Ok(serde_cbor::from_slice(&plaintext)?)
}

/// Decrypt an optional label group, treating "not entitled" as absent.
///
/// Returns `Ok(None)` for a missing or empty group and for access-denied
/// failures; corrupt plaintext is still an error.
pub fn try_decrypt_label_group<T: DeserializeOwned>(
    encrypted_group: Option<&EncryptedLabelGroup>,
    keystore: &KeyStore,
) -> Result<Option<T>> {
    let Some(group) = encrypted_group else {
        return Ok(None);
    };
    match decrypt_label_group(group, keystore) {
        Ok(fields) => Ok(Some(fields)),
        Err(SerializerError::EmptyEncryptedGroup(_)) => Ok(None),
        Err(e) if e.is_access_denied() => {
            log::debug!("label group '{}' not readable here: {e}", group.label);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Envelope-encrypt `bytes` for `recipients`, returning the protobuf-encoded envelope.
pub fn encrypt_bytes(
    bytes: &[u8],
    keystore: &KeyStore,
    recipients: &EnvelopeRecipients,
) -> Result<Vec<u8>> {
    if !keystore.get_keystore_capabilities().can_encrypt {
        return Err(SerializerError::EncryptionFailed(
            "keystore cannot encrypt".to_string(),
        ));
    }
    let env = keystore
        .encrypt_with_envelope(
            bytes,
            recipients.network_public_key.as_deref(),
            recipients.profile_public_keys.clone(),
        )
        .map_err(|e| SerializerError::EncryptionFailed(e.to_string()))?;
    Ok(env.encode_to_vec())
}

/// Open a protobuf-encoded envelope produced by [`encrypt_bytes`].
pub fn decrypt_bytes(bytes: &[u8], keystore: &KeyStore) -> Result<Vec<u8>> {
    if !keystore.get_keystore_capabilities().can_decrypt {
        return Err(SerializerError::DecryptionUnavailable(
            "keystore cannot decrypt".to_string(),
        ));
    }
    let env = EnvelopeEncryptedData::decode(bytes)?;
    keystore
        .decrypt_envelope_data(&env)
        .map_err(|e| SerializerError::DecryptionFailed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Label group planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingMode {
    /// A field tagged with several labels is encrypted into every one of them.
    All,
    /// A field lands only in its highest-priority label's group.
    Exclusive,
}

/// Which fields go into which label group, groups in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelGroupPlan {
    groups: Vec<(String, Vec<String>)>,
    plaintext: Vec<String>,
}

impl LabelGroupPlan {
    /// Build a plan from `(field, labels)` pairs in declaration order.
    /// Fields with no labels stay plaintext.
    pub fn build(fields: &[(&str, &[&str])], mode: GroupingMode) -> Self {
        let mut plan = LabelGroupPlan::default();

        for (field, labels) in fields {
            if labels.is_empty() {
                plan.plaintext.push(field.to_string());
                continue;
            }
            let targets: Vec<&str> = match mode {
                GroupingMode::All => labels.to_vec(),
                GroupingMode::Exclusive => labels
                    .iter()
                    .copied()
                    .min_by(|a, b| compare_labels(a, b))
                    .into_iter()
                    .collect(),
            };
            for label in targets {
                match plan.groups.iter_mut().find(|(l, _)| l == label) {
                    Some((_, members)) => {
                        if !members.iter().any(|m| m == field) {
                            members.push(field.to_string());
                        }
                    }
                    None => plan.groups.push((label.to_string(), vec![field.to_string()])),
                }
            }
        }

        plan.groups.sort_by(|a, b| compare_labels(&a.0, &b.0));
        plan
    }

    pub fn groups(&self) -> &[(String, Vec<String>)] {
        &self.groups
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(label, _)| label.as_str())
    }

    pub fn fields_for(&self, label: &str) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, fields)| fields.as_slice())
    }

    /// Highest-priority group holding `field`.
    pub fn group_for_field(&self, field: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, fields)| fields.iter().any(|f| f == field))
            .map(|(label, _)| label.as_str())
    }

    pub fn plaintext_fields(&self) -> &[String] {
        &self.plaintext
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_FIELDS: &[(&str, &[&str])] = &[
        ("id", &[]),
        ("name", &["user"]),
        ("email", &["user", "system"]),
        ("admin_notes", &["system"]),
        ("search_terms", &["search"]),
    ];

    #[test]
    fn exclusive_plan_puts_shared_field_in_system() {
        let plan = LabelGroupPlan::build(PROFILE_FIELDS, GroupingMode::Exclusive);
        assert_eq!(plan.group_for_field("email"), Some("system"));
        assert_eq!(
            plan.fields_for("system").unwrap(),
            &["email".to_string(), "admin_notes".to_string()]
        );
        assert_eq!(plan.fields_for("user").unwrap(), &["name".to_string()]);
        assert_eq!(plan.labels().collect::<Vec<_>>(), vec!["system", "user", "search"]);
        assert_eq!(plan.plaintext_fields(), &["id".to_string()]);
    }

    #[test]
    fn all_plan_duplicates_shared_field() {
        let plan = LabelGroupPlan::build(PROFILE_FIELDS, GroupingMode::All);
        assert!(plan.fields_for("user").unwrap().contains(&"email".to_string()));
        assert!(plan.fields_for("system").unwrap().contains(&"email".to_string()));
        // Lookup still reports the winning group.
        assert_eq!(plan.group_for_field("email"), Some("system"));
    }

    #[test]
    fn empty_groups_report_empty() {
        let group = EncryptedLabelGroup {
            label: "user".to_string(),
            envelope: None,
        };
        assert!(group.is_empty());
    }
}
