//! Element-wise encryption of lists and maps.

use std::collections::HashMap;

use anyhow::Result;
use anyvalue_serializer::{
    read_header, AnyValue, DeserializationContext, ValueCategory, LIST_ANY, MAP_ANY,
};
use anyvalue_test_utils::{
    fixture_registry, init_test_logging, sample_account, sample_profile, KeyFixture, TestAccount,
    ACCOUNT_WIRE_NAME,
};

#[test]
fn homogeneous_typed_list_encrypts_each_element() -> Result<()> {
    init_test_logging();
    let keys = KeyFixture::generate();
    let registry = fixture_registry()?;
    let ctx = keys.mobile_context(registry.clone())?;

    let accounts = vec![
        sample_account("acc-1", 100),
        sample_account("acc-2", 200),
        sample_account("acc-3", 300),
    ];
    let bytes = AnyValue::new_typed_list(accounts.clone()).serialize(Some(&ctx))?;

    let header = read_header(&bytes)?;
    assert_eq!(header.category, ValueCategory::List);
    assert_eq!(header.type_name.as_deref(), Some(LIST_ANY));
    assert!(!header.is_encrypted);

    let full = DeserializationContext::new(Some(keys.full_keystore())).with_registry(registry);
    let decoded = AnyValue::deserialize_with_context(&bytes, &full)?;

    let elements = decoded.as_any_value_array()?;
    assert_eq!(elements.len(), 3);
    for element in &elements {
        assert!(element.is_lazy());
        assert_eq!(element.category(), ValueCategory::Encrypted);
        assert_eq!(element.wire_name(), Some(ACCOUNT_WIRE_NAME));
    }

    // Each element decodes on its own.
    assert_eq!(elements[1].as_type::<TestAccount>()?, accounts[1]);
    assert_eq!(decoded.as_typed_list::<TestAccount>()?, accounts);
    Ok(())
}

#[test]
fn homogeneous_value_list_encrypts_each_element() -> Result<()> {
    let keys = KeyFixture::generate();
    let registry = fixture_registry()?;
    let ctx = keys.mobile_context(registry.clone())?;

    let list = AnyValue::new_list(vec![
        AnyValue::new_struct(sample_account("a", 1)),
        AnyValue::new_struct(sample_profile()),
    ]);
    let bytes = list.serialize(Some(&ctx))?;

    let node = DeserializationContext::new(Some(keys.node_keystore())).with_registry(registry);
    let elements = AnyValue::deserialize_with_context(&bytes, &node)?.as_any_value_array()?;
    assert!(elements
        .iter()
        .all(|e| e.category() == ValueCategory::Encrypted));

    // The node holds the network key: system and search fields only.
    let account = elements[0].as_type::<TestAccount>()?;
    assert_eq!(account.balance_cents, 1);
    assert_eq!(account.tags, vec!["savings".to_string()]);
    assert_eq!(account.owner, "");
    Ok(())
}

#[test]
fn heterogeneous_list_falls_back_to_plain() -> Result<()> {
    let keys = KeyFixture::generate();
    let registry = fixture_registry()?;
    let ctx = keys.mobile_context(registry.clone())?;

    let first = sample_account("acc-1", 10);
    let last = sample_account("acc-2", 20);
    let list = AnyValue::new_list(vec![
        AnyValue::new_struct(first.clone()),
        AnyValue::from("plain string"),
        AnyValue::new_struct(last.clone()),
    ]);
    let bytes = list.serialize(Some(&ctx))?;

    // No keystore is needed: nothing was encrypted.
    let plain = DeserializationContext::new(None).with_registry(registry);
    let elements = AnyValue::deserialize_with_context(&bytes, &plain)?.as_any_value_array()?;
    assert_eq!(elements.len(), 3);
    assert!(elements.iter().all(|e| !e.is_encrypted()));
    assert_eq!(elements[0].category(), ValueCategory::Struct);
    assert_eq!(elements[0].as_type::<TestAccount>()?, first);
    assert_eq!(elements[1].as_type::<String>()?, "plain string");
    assert_eq!(elements[2].as_type::<TestAccount>()?, last);
    Ok(())
}

#[test]
fn list_without_context_is_plain() -> Result<()> {
    let registry = fixture_registry()?;
    let bytes = AnyValue::new_typed_list(vec![sample_account("a", 5)]).serialize_plain(&registry)?;
    assert_eq!(
        read_header(&bytes)?.type_name.as_deref(),
        Some("list<test.Account>")
    );

    let context = DeserializationContext::default().with_registry(registry);
    let decoded = AnyValue::deserialize_with_context(&bytes, &context)?;
    assert_eq!(
        decoded.as_typed_list::<TestAccount>()?,
        vec![sample_account("a", 5)]
    );

    let elements = decoded.as_any_value_array()?;
    assert_eq!(elements[0].category(), ValueCategory::Struct);
    assert_eq!(elements[0].wire_name(), Some(ACCOUNT_WIRE_NAME));
    Ok(())
}

#[test]
fn map_values_are_encrypted_keys_stay_plain() -> Result<()> {
    let keys = KeyFixture::generate();
    let registry = fixture_registry()?;
    let ctx = keys.mobile_context(registry.clone())?;

    let accounts = HashMap::from([
        ("checking".to_string(), sample_account("c", 1_000)),
        ("savings".to_string(), sample_account("s", 50_000)),
    ]);
    let bytes = AnyValue::new_typed_map(accounts.clone()).serialize(Some(&ctx))?;
    assert_eq!(read_header(&bytes)?.type_name.as_deref(), Some(MAP_ANY));

    // Keys are readable without any keystore; values are not.
    let no_keys = DeserializationContext::new(None).with_registry(registry.clone());
    let entries = AnyValue::deserialize_with_context(&bytes, &no_keys)?.as_any_value_map()?;
    let mut names: Vec<_> = entries.keys().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["checking", "savings"]);
    for value in entries.values() {
        assert_eq!(value.category(), ValueCategory::Encrypted);
        assert!(!value.as_accessible::<TestAccount>()?.is_accessible());
    }

    let full = DeserializationContext::new(Some(keys.full_keystore())).with_registry(registry);
    let decoded = AnyValue::deserialize_with_context(&bytes, &full)?;
    assert_eq!(decoded.as_typed_map::<TestAccount>()?, accounts);
    Ok(())
}

#[test]
fn heterogeneous_map_falls_back_to_plain() -> Result<()> {
    let keys = KeyFixture::generate();
    let registry = fixture_registry()?;
    let ctx = keys.mobile_context(registry.clone())?;

    let map = HashMap::from([
        ("account".to_string(), AnyValue::new_struct(sample_account("a", 7))),
        ("count".to_string(), AnyValue::from(3u32)),
    ]);
    let bytes = AnyValue::new_map(map).serialize(Some(&ctx))?;

    let plain = DeserializationContext::new(None).with_registry(registry);
    let entries = AnyValue::deserialize_with_context(&bytes, &plain)?.as_any_value_map()?;
    assert_eq!(entries["account"].category(), ValueCategory::Struct);
    assert_eq!(entries["account"].as_type::<TestAccount>()?.balance_cents, 7);
    assert_eq!(entries["count"].as_type::<u32>()?, 3);
    Ok(())
}

#[test]
fn already_encrypted_lazy_elements_keep_the_list_encrypted() -> Result<()> {
    let keys = KeyFixture::generate();
    let registry = fixture_registry()?;
    let ctx = keys.mobile_context(registry.clone())?;

    let unit = AnyValue::new_struct(sample_account("x", 9)).serialize(Some(&ctx))?;
    let full = DeserializationContext::new(Some(keys.full_keystore())).with_registry(registry);
    let lazy = AnyValue::deserialize_with_context(&unit, &full)?;
    assert!(lazy.is_encrypted());

    // Mixing a forwarded encrypted unit with a fresh hooked struct stays element-encrypted.
    let list = AnyValue::new_list(vec![lazy, AnyValue::new_struct(sample_account("y", 10))]);
    let bytes = list.serialize(Some(&ctx))?;
    let elements = AnyValue::deserialize_with_context(&bytes, &full)?.as_any_value_array()?;
    assert!(elements
        .iter()
        .all(|e| e.category() == ValueCategory::Encrypted));
    assert_eq!(elements[0].wire_name(), Some(ACCOUNT_WIRE_NAME));
    assert_eq!(elements[1].as_type::<TestAccount>()?.balance_cents, 10);
    Ok(())
}
