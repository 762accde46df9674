//! Error handling and edge case tests.

use livestore::{
    Entity, EntityId, EntityInput, EntitySchema, FieldDef, FilterSpec, FilterValue,
    FilteredLiveView, Model, PredicateMode, SaveOutcome, SortSpec, Store, StoreConfig, StoreError,
    ViewConfig,
};
use std::fs;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        checkpoint_every: 0,
        ..Default::default()
    }
}

fn test_store(dir: &TempDir) -> Store {
    let store = Store::create(test_config(dir)).unwrap();
    store
        .register_schema(
            EntitySchema::new("Show")
                .field(FieldDef::text("name").required().unique())
                .field(FieldDef::text("universe"))
                .field(FieldDef::integer("year")),
        )
        .unwrap();
    store
}

struct Show;

impl Model for Show {
    const ENTITY: &'static str = "Show";

    fn from_entity(_entity: &Entity) -> livestore::Result<Self> {
        Ok(Show)
    }
}

// --- Schema Errors ---

#[test]
fn test_insert_missing_required_field() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.insert(EntityInput::new("Show").with("universe", "Firefly"));
    assert!(matches!(result, Err(StoreError::SchemaViolation(_))));

    // Not inserted
    assert!(store.entities_of("Show").is_empty());
    assert!(!store.has_changes());
}

#[test]
fn test_insert_wrong_field_kind() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.insert(
        EntityInput::new("Show")
            .with("name", "Firefly")
            .with("year", "2002"),
    );
    assert!(matches!(result, Err(StoreError::SchemaViolation(_))));
}

#[test]
fn test_insert_unknown_type() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.insert(EntityInput::new("Movie").with("name", "Serenity"));
    assert!(matches!(result, Err(StoreError::SchemaViolation(_))));
}

#[test]
fn test_clear_required_field() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let id = store
        .insert(EntityInput::new("Show").with("name", "Firefly"))
        .unwrap();
    let result = store.clear_field(id, "name");
    assert!(matches!(result, Err(StoreError::SchemaViolation(_))));
    assert_eq!(store.get(id).unwrap().text("name"), Some("Firefly"));
}

#[test]
fn test_mutate_missing_entity() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.set_field(EntityId(999), "name", "Firefly");
    assert!(matches!(result, Err(StoreError::EntityNotFound(EntityId(999)))));

    let result = store.delete(EntityId(999));
    assert!(matches!(result, Err(StoreError::EntityNotFound(_))));
}

#[test]
fn test_register_conflicting_schema() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.register_schema(EntitySchema::new("Show").field(FieldDef::text("name")));
    assert!(matches!(result, Err(StoreError::SchemaExists(_))));
}

// --- Predicate Errors ---

#[test]
fn test_unknown_predicate_kind_registers_nothing() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let config = ViewConfig::from_json(
        r#"{ "filter": { "key": "name", "value": "Star", "predicate": "MATCHES" } }"#,
    )
    .unwrap();
    let result = FilteredLiveView::from_config(&store, &config, |_: &Show| ());

    assert!(matches!(result, Err(StoreError::InvalidPredicate(_))));
    assert_eq!(store.subscription_count(), 0);
}

#[test]
fn test_unknown_filter_key_registers_nothing() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = FilteredLiveView::new(
        &store,
        "network",
        "FOX",
        PredicateMode::PrefixMatch,
        SortSpec::new(),
        |_: &Show| (),
    );

    assert!(matches!(result, Err(StoreError::InvalidPredicate(_))));
    assert_eq!(store.subscription_count(), 0);
}

#[test]
fn test_set_value_for_single_value_mode() {
    let result = FilterSpec::new(
        "universe",
        FilterValue::from(vec!["Star Trek", "Star Wars"]),
        PredicateMode::PrefixMatch,
    );
    assert!(matches!(result, Err(StoreError::InvalidPredicate(_))));
}

#[test]
fn test_reconfigure_with_bad_value_keeps_old_filter() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store
        .insert(EntityInput::new("Show").with("name", "Star Trek"))
        .unwrap();

    let mut view = FilteredLiveView::new(
        &store,
        "name",
        "Star",
        PredicateMode::PrefixMatch,
        SortSpec::new(),
        |_: &Show| (),
    )
    .unwrap();

    let result = view.set_filter_value(vec!["Star", "Fire"]);
    assert!(matches!(result, Err(StoreError::InvalidPredicate(_))));
    assert_eq!(view.len(), 1);
    assert_eq!(view.filter().unwrap().value(), &FilterValue::from("Star"));
}

#[test]
fn test_replace_filter_after_unsubscribe() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let results = store.subscribe("Show", None, SortSpec::new()).unwrap();
    store.unsubscribe(results.id());

    let result = store.replace_filter(results.id(), Some(FilterSpec::prefix("name", "S")));
    assert!(matches!(result, Err(StoreError::SubscriptionNotFound(_))));
}

// --- Save Errors ---

#[test]
fn test_reject_newer_keeps_changes_pending() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store
        .insert(EntityInput::new("Show").with("name", "Firefly").with("year", 2002))
        .unwrap();
    store.save().unwrap();

    let dup = store
        .insert(EntityInput::new("Show").with("name", "Firefly").with("year", 2003))
        .unwrap();

    match store.save() {
        Err(StoreError::UniqueConstraint {
            entity_type,
            field,
            value,
        }) => {
            assert_eq!(entity_type, "Show");
            assert_eq!(field, "name");
            assert_eq!(value, "Firefly");
        }
        other => panic!("Expected UniqueConstraint, got {:?}", other),
    }

    // Still pending, still visible
    assert!(store.has_changes());
    assert!(store.get(dup).is_some());

    // Fixing the conflict lets the save through
    store.set_field(dup, "name", "Serenity").unwrap();
    assert!(matches!(
        store.save().unwrap(),
        SaveOutcome::Committed { changes: 1, merged: 0 }
    ));
}

#[test]
fn test_insert_then_delete_is_not_a_change() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let id = store
        .insert(EntityInput::new("Show").with("name", "Firefly"))
        .unwrap();
    store.delete(id).unwrap();

    assert_eq!(store.save().unwrap(), SaveOutcome::NoChanges);
    assert!(!store.has_changes());
}

// --- Load Errors ---

#[test]
fn test_corrupted_manifest() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        Store::create(config.clone()).unwrap();
    }
    fs::write(config.path.join("MANIFEST"), b"garbage").unwrap();

    match Store::open(config.clone()) {
        Err(StoreError::StoreLoadFailure { path, .. }) => assert_eq!(path, config.path),
        Err(other) => panic!("Expected StoreLoadFailure, got {:?}", other),
        Ok(_) => panic!("Expected StoreLoadFailure, got a store"),
    }
}

#[test]
fn test_corrupted_journal() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let store = test_store(&dir);
        store
            .insert(EntityInput::new("Show").with("name", "Firefly"))
            .unwrap();
        store.save().unwrap();
    }

    // Flip a byte inside the entry payload
    let journal = config.path.join("journal.wal");
    let mut bytes = fs::read(&journal).unwrap();
    let mid = bytes.len() - 8;
    bytes[mid] ^= 0xFF;
    fs::write(&journal, bytes).unwrap();

    let result = Store::open(config);
    assert!(matches!(result, Err(StoreError::StoreLoadFailure { .. })));
}

#[test]
fn test_corrupted_journal_length_keeps_saved_entries() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let store = test_store(&dir);
        for name in ["Firefly", "Serenity"] {
            store.insert(EntityInput::new("Show").with("name", name)).unwrap();
            store.save().unwrap();
        }
    }

    // Flip one bit in the first entry's length prefix, right after the
    // five-byte journal header
    let journal = config.path.join("journal.wal");
    let mut bytes = fs::read(&journal).unwrap();
    let original = bytes.clone();
    bytes[6] ^= 0x01;
    fs::write(&journal, &bytes).unwrap();

    let result = Store::open(config.clone());
    assert!(matches!(result, Err(StoreError::StoreLoadFailure { .. })));
    assert_eq!(fs::read(&journal).unwrap(), bytes);

    // Restoring the byte brings every saved entity back
    fs::write(&journal, original).unwrap();
    let store = Store::open(config).unwrap();
    assert_eq!(store.entities_of("Show").len(), 2);
}

#[test]
fn test_corrupted_snapshot_length() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        Store::create(config.clone()).unwrap();
    }

    let mut bytes = b"LSS\0".to_vec();
    bytes.push(1);
    bytes.extend_from_slice(&u64::MAX.to_le_bytes());
    fs::write(config.path.join("snapshot.bin"), bytes).unwrap();

    let result = Store::open(config);
    assert!(matches!(result, Err(StoreError::StoreLoadFailure { .. })));
}

#[test]
fn test_store_locked() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let _store = Store::create(config.clone()).unwrap();
    let result = Store::open_or_create(config);
    assert!(matches!(result, Err(StoreError::Locked)));
}
