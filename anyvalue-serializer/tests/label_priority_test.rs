use anyvalue_serializer::{
    compare_labels, label_priority, preferred_label, sort_labels_by_priority, GroupingMode,
    LabelGroupPlan,
};
use std::cmp::Ordering;

const FIELDS: &[(&str, &[&str])] = &[
    ("id", &[]),
    ("name", &["user"]),
    ("email", &["user", "system"]),
    ("admin_notes", &["system"]),
    ("tags", &["search", "archive"]),
];

#[test]
fn system_wins_over_user() {
    let plan = LabelGroupPlan::build(FIELDS, GroupingMode::Exclusive);
    assert_eq!(plan.group_for_field("email"), Some("system"));
    assert!(!plan.fields_for("user").unwrap().contains(&"email".to_string()));
    assert_eq!(preferred_label(&["user", "system"]), Some("system"));
}

#[test]
fn unranked_labels_fall_back_to_name_order() {
    let plan = LabelGroupPlan::build(FIELDS, GroupingMode::Exclusive);
    assert_eq!(plan.group_for_field("tags"), Some("archive"));
    assert!(plan.fields_for("search").is_none());
    assert_eq!(
        plan.labels().collect::<Vec<_>>(),
        vec!["system", "user", "archive"]
    );
}

#[test]
fn all_mode_keeps_every_label() {
    let plan = LabelGroupPlan::build(FIELDS, GroupingMode::All);
    assert_eq!(
        plan.labels().collect::<Vec<_>>(),
        vec!["system", "user", "archive", "search"]
    );
    assert_eq!(
        plan.fields_for("system").unwrap(),
        &["email".to_string(), "admin_notes".to_string()]
    );
    assert_eq!(
        plan.fields_for("user").unwrap(),
        &["name".to_string(), "email".to_string()]
    );
    assert_eq!(plan.plaintext_fields(), &["id".to_string()]);
}

#[test]
fn ordering_helpers() {
    assert!(label_priority("system") < label_priority("user"));
    assert!(label_priority("user") < label_priority("aaa"));
    assert_eq!(compare_labels("user", "system"), Ordering::Greater);
    assert_eq!(compare_labels("beta", "alpha"), Ordering::Greater);

    let mut labels = vec![
        "search".to_string(),
        "user".to_string(),
        "admin".to_string(),
        "system".to_string(),
    ];
    sort_labels_by_priority(&mut labels);
    assert_eq!(labels, vec!["system", "user", "admin", "search"]);
}
