//! Label-to-recipient resolution.
//!
//! A [`LabelResolverConfig`] is a static policy: per label, an optional network
//! public key and an optional user-key marker. Binding it to the concrete user
//! keys of a request yields an immutable [`LabelResolver`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SerializerError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Dynamic key sources a label can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelKeyword {
    /// The profile keys of the user on whose behalf data is serialized.
    CurrentUser,
}

/// Policy for a single label. At least one of the two must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelValue {
    pub network_public_key: Option<Vec<u8>>,
    pub user_key_spec: Option<LabelKeyword>,
}

/// Label name -> policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelResolverConfig {
    pub label_mappings: HashMap<String, LabelValue>,
}

impl LabelResolverConfig {
    /// Load a label policy from JSON. Keys are arrays of byte values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: LabelResolverConfig = serde_json::from_str(json)
            .map_err(|e| SerializerError::InvalidLabelConfig(e.to_string()))?;
        ConfigurableLabelResolver::validate_label_config(&config)?;
        Ok(config)
    }
}

/// Concrete key material a label resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelKeyInfo {
    pub profile_public_keys: Vec<Vec<u8>>,
    pub network_public_key: Option<Vec<u8>>,
}

impl LabelKeyInfo {
    pub fn has_recipients(&self) -> bool {
        self.network_public_key.is_some() || !self.profile_public_keys.is_empty()
    }
}

/// Pre-resolved label mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyMappingConfig {
    pub label_mappings: HashMap<String, LabelKeyInfo>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Label resolver interface for mapping labels to public keys
pub trait LabelResolver: Send + Sync {
    /// Resolve a label to its key info.
    ///
    /// `Ok(None)` means the label is unknown (callers skip it); an error means
    /// the label is known but cannot be used in this context.
    fn resolve_label_info(&self, label: &str) -> Result<Option<LabelKeyInfo>>;

    /// Labels that can be resolved in this context, in priority order
    fn available_labels(&self) -> Vec<String>;

    /// Check if a label can be resolved
    fn can_resolve(&self, label: &str) -> bool;
}

/// Immutable resolver over a fixed label mapping.
#[derive(Debug, Clone)]
pub struct ConfigurableLabelResolver {
    mapping: HashMap<String, LabelKeyInfo>,
}

impl ConfigurableLabelResolver {
    pub fn new(config: KeyMappingConfig) -> Self {
        Self {
            mapping: config.label_mappings,
        }
    }

    pub fn from_map(map: HashMap<String, LabelKeyInfo>) -> Self {
        Self { mapping: map }
    }

    /// Check a label policy: non-empty, and every label names at least one key source.
    pub fn validate_label_config(config: &LabelResolverConfig) -> Result<()> {
        if config.label_mappings.is_empty() {
            return Err(SerializerError::InvalidLabelConfig(
                "label resolver config must contain at least one label".to_string(),
            ));
        }

        for (label, value) in &config.label_mappings {
            if label.is_empty() {
                return Err(SerializerError::InvalidLabelConfig(
                    "label names must not be empty".to_string(),
                ));
            }
            if value.network_public_key.is_none() && value.user_key_spec.is_none() {
                return Err(SerializerError::InvalidLabelConfig(format!(
                    "label '{label}' has neither a network key nor a user key spec"
                )));
            }
            if matches!(&value.network_public_key, Some(key) if key.is_empty()) {
                return Err(SerializerError::InvalidLabelConfig(format!(
                    "label '{label}' has an empty network public key"
                )));
            }
        }

        Ok(())
    }
}

impl LabelResolver for ConfigurableLabelResolver {
    fn resolve_label_info(&self, label: &str) -> Result<Option<LabelKeyInfo>> {
        match self.mapping.get(label) {
            None => Ok(None),
            Some(info) if info.has_recipients() => Ok(Some(info.clone())),
            Some(_) => Err(SerializerError::LabelNotFound(label.to_string())),
        }
    }

    fn available_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .mapping
            .iter()
            .filter(|(_, info)| info.has_recipients())
            .map(|(label, _)| label.clone())
            .collect();
        sort_labels_by_priority(&mut labels);
        labels
    }

    fn can_resolve(&self, label: &str) -> bool {
        self.mapping
            .get(label)
            .map(LabelKeyInfo::has_recipients)
            .unwrap_or(false)
    }
}

/// Bind a label policy to the current user's profile keys.
///
/// Labels carrying [`LabelKeyword::CurrentUser`] receive a copy of `user_profile_keys`;
/// network-only labels get no profile keys.
pub fn create_context_label_resolver(
    config: &LabelResolverConfig,
    user_profile_keys: &[Vec<u8>],
) -> Result<Arc<dyn LabelResolver>> {
    ConfigurableLabelResolver::validate_label_config(config)?;

    let mut mapping = HashMap::with_capacity(config.label_mappings.len());
    for (label, value) in &config.label_mappings {
        let profile_public_keys = match value.user_key_spec {
            Some(LabelKeyword::CurrentUser) => user_profile_keys.to_vec(),
            None => Vec::new(),
        };
        mapping.insert(
            label.clone(),
            LabelKeyInfo {
                profile_public_keys,
                network_public_key: value.network_public_key.clone(),
            },
        );
    }

    Ok(Arc::new(ConfigurableLabelResolver::from_map(mapping)))
}

// ---------------------------------------------------------------------------
// Label priority
// ---------------------------------------------------------------------------

/// Rank used when a value must pick a single label group:
/// `system` first, then `user`, then everything else.
pub fn label_priority(label: &str) -> u8 {
    match label {
        "system" => 0,
        "user" => 1,
        _ => 2,
    }
}

/// Total order on labels: priority rank, then name.
pub fn compare_labels(a: &str, b: &str) -> Ordering {
    label_priority(a)
        .cmp(&label_priority(b))
        .then_with(|| a.cmp(b))
}

pub fn sort_labels_by_priority<S: AsRef<str>>(labels: &mut [S]) {
    labels.sort_by(|a, b| compare_labels(a.as_ref(), b.as_ref()));
}

/// The label that wins when only one group may be chosen.
pub fn preferred_label<'a, S: AsRef<str>>(labels: &'a [S]) -> Option<&'a str> {
    labels
        .iter()
        .map(AsRef::as_ref)
        .min_by(|a, b| compare_labels(a, b))
}
