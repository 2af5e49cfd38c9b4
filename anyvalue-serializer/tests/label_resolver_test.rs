use std::collections::HashMap;

use anyvalue_serializer::{
    create_context_label_resolver, ConfigurableLabelResolver, KeyMappingConfig, LabelKeyInfo,
    LabelKeyword, LabelResolver, LabelResolverConfig, LabelValue, SerializerError,
};
use anyvalue_test_utils::create_test_label_resolver_config;

fn network_label(key: Vec<u8>) -> LabelValue {
    LabelValue {
        network_public_key: Some(key),
        user_key_spec: None,
    }
}

fn user_label() -> LabelValue {
    LabelValue {
        network_public_key: None,
        user_key_spec: Some(LabelKeyword::CurrentUser),
    }
}

#[test]
fn system_and_user_scenario() {
    let k = vec![0x04, 0xAB, 0xCD];
    let u1 = vec![0x04, 0x01, 0x02];
    let config = LabelResolverConfig {
        label_mappings: HashMap::from([
            ("system".to_string(), network_label(k.clone())),
            ("user".to_string(), user_label()),
        ]),
    };

    let resolver = create_context_label_resolver(&config, &[u1.clone()]).unwrap();

    assert_eq!(
        resolver.resolve_label_info("system").unwrap(),
        Some(LabelKeyInfo {
            network_public_key: Some(k),
            profile_public_keys: vec![],
        })
    );
    assert_eq!(
        resolver.resolve_label_info("user").unwrap(),
        Some(LabelKeyInfo {
            network_public_key: None,
            profile_public_keys: vec![u1],
        })
    );
    assert_eq!(resolver.resolve_label_info("unknown").unwrap(), None);
}

#[test]
fn validation_rejects_empty_and_keyless_configs() {
    let empty = LabelResolverConfig::default();
    assert!(matches!(
        ConfigurableLabelResolver::validate_label_config(&empty),
        Err(SerializerError::InvalidLabelConfig(_))
    ));

    let keyless = LabelResolverConfig {
        label_mappings: HashMap::from([(
            "orphan".to_string(),
            LabelValue {
                network_public_key: None,
                user_key_spec: None,
            },
        )]),
    };
    assert!(matches!(
        ConfigurableLabelResolver::validate_label_config(&keyless),
        Err(SerializerError::InvalidLabelConfig(_))
    ));
    // The factory re-validates.
    assert!(create_context_label_resolver(&keyless, &[]).is_err());
}

#[test]
fn mixed_label_gets_network_and_user_keys() {
    let config = create_test_label_resolver_config(vec![9, 9, 9]);
    let user_keys = vec![vec![1u8], vec![2u8]];
    let resolver = create_context_label_resolver(&config, &user_keys).unwrap();

    let search = resolver.resolve_label_info("search").unwrap().unwrap();
    assert_eq!(search.network_public_key, Some(vec![9, 9, 9]));
    assert_eq!(search.profile_public_keys, user_keys);
    assert_eq!(resolver.available_labels(), vec!["system", "user", "search"]);
}

#[test]
fn without_user_keys_only_network_labels_resolve() {
    let config = create_test_label_resolver_config(vec![9, 9, 9]);
    let resolver = create_context_label_resolver(&config, &[]).unwrap();

    assert!(resolver.can_resolve("system"));
    assert!(resolver.can_resolve("search"));
    assert!(!resolver.can_resolve("user"));
    assert!(!resolver.can_resolve("missing"));
    assert!(matches!(
        resolver.resolve_label_info("user"),
        Err(SerializerError::LabelNotFound(label)) if label == "user"
    ));
    assert_eq!(resolver.available_labels(), vec!["system", "search"]);
}

#[test]
fn pre_resolved_mapping_resolver() {
    let resolver = ConfigurableLabelResolver::new(KeyMappingConfig {
        label_mappings: HashMap::from([(
            "audit".to_string(),
            LabelKeyInfo {
                profile_public_keys: vec![vec![3u8]],
                network_public_key: None,
            },
        )]),
    });
    assert!(resolver.can_resolve("audit"));
    assert_eq!(
        resolver
            .resolve_label_info("audit")
            .unwrap()
            .unwrap()
            .profile_public_keys,
        vec![vec![3u8]]
    );
}

#[test]
fn config_json_roundtrip() {
    let config = create_test_label_resolver_config(vec![1, 2, 3]);
    let json = serde_json::to_string(&config).unwrap();
    let loaded = LabelResolverConfig::from_json_str(&json).unwrap();
    assert_eq!(loaded, config);

    assert!(matches!(
        LabelResolverConfig::from_json_str("{ not json"),
        Err(SerializerError::InvalidLabelConfig(_))
    ));
}
