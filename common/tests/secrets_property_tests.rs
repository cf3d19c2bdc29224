// Property-based tests for the secrets store

use common::secrets::ConfigStore;
use proptest::prelude::*;
use std::collections::BTreeMap;

// Whatever is saved is read back verbatim by a fresh store
#[test]
fn property_saved_values_survive_reopen() {
    proptest!(|(values in prop::collection::btree_map("[a-z_]{1,20}", "\\PC{0,64}", 0..10))| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut store = ConfigStore::open(&path).unwrap();
        for (key, value) in &values {
            store.set(key.clone(), value.clone());
        }
        store.save().unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        for (key, value) in &values {
            prop_assert_eq!(reopened.get(key), Some(value.as_str()));
        }

        let raw: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        prop_assert_eq!(raw, values);
    });
}

// Unsaved changes never reach the file
#[test]
fn property_set_without_save_is_not_persisted() {
    proptest!(|(key in "[a-z_]{1,20}", value in "[A-Za-z0-9]{1,32}")| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut store = ConfigStore::open(&path).unwrap();
        store.set(key.clone(), value);

        let reopened = ConfigStore::open(&path).unwrap();
        prop_assert!(reopened.get(&key).is_none());
    });
}

// An explicit non-empty credential always wins over the stored one
#[test]
fn property_explicit_credential_wins() {
    proptest!(|(
        stored in "[A-Za-z0-9]{1,32}",
        explicit in prop::option::of("[A-Za-z0-9]{0,32}")
    )| {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::open(dir.path().join("config.json")).unwrap();
        store.set("kusto_token", stored.clone());

        let resolved = store.resolve(explicit.as_deref(), "kusto_token").unwrap();
        let expected = match explicit {
            Some(value) if !value.is_empty() => value,
            _ => stored,
        };
        prop_assert_eq!(resolved, expected);
    });
}
