//! Integration tests for the entity store and its live views.

use livestore::{
    sections, text_or, Entity, EntityInput, EntitySchema, FieldDef, FilterSpec, FilteredLiveView,
    MergePolicy, MergePolicyTable, Model, SaveOutcome, SortSpec, Store, StoreConfig, StoreError,
};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        checkpoint_every: 0,
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn declare(store: &Store) {
    store
        .register_schema(
            EntitySchema::new("Country")
                .field(FieldDef::text("shortName").required().unique())
                .field(FieldDef::text("fullName"))
                .to_many("candy", "Candy", Some("origin")),
        )
        .unwrap();
    store
        .register_schema(
            EntitySchema::new("Candy")
                .field(FieldDef::text("name").required())
                .field(FieldDef::text("country"))
                .to_one("origin", "Country", Some("candy")),
        )
        .unwrap();
}

fn open(config: StoreConfig) -> Store {
    init_tracing();
    let store = Store::open_or_create(config).unwrap();
    declare(&store);
    store
}

#[derive(Debug, PartialEq)]
struct Candy {
    name: String,
    country: Option<String>,
}

impl Model for Candy {
    const ENTITY: &'static str = "Candy";

    fn from_entity(entity: &Entity) -> livestore::Result<Self> {
        let name = entity
            .text("name")
            .ok_or_else(|| StoreError::SchemaViolation("candy without a name".into()))?;
        Ok(Candy {
            name: name.to_string(),
            country: entity.text("country").map(str::to_string),
        })
    }
}

fn candy(name: &str, country: &str) -> EntityInput {
    EntityInput::new("Candy")
        .with("name", name)
        .with("country", country)
}

fn country(short: &str, full: &str) -> EntityInput {
    EntityInput::new("Country")
        .with("shortName", short)
        .with("fullName", full)
}

fn names(entities: &[Entity]) -> Vec<&str> {
    entities.iter().filter_map(|e| e.text("name")).collect()
}

#[test]
fn test_candies_sorted_and_grouped() {
    let dir = TempDir::new().unwrap();
    let store = open(test_config(&dir));

    store.insert(candy("Mars", "UK")).unwrap();
    store.insert(candy("Toblerone", "CH")).unwrap();
    store.insert(candy("Twix", "UK")).unwrap();
    store.save().unwrap();

    let view = FilteredLiveView::unfiltered(&store, SortSpec::new().ascending("name"), |c: &Candy| {
        c.name.clone()
    })
    .unwrap();

    assert_eq!(view.render_all().unwrap(), vec!["Mars", "Toblerone", "Twix"]);

    let grouped = sections(&view.entities(), "country", "Unknown");
    let summary: Vec<(&str, Vec<&str>)> = grouped
        .iter()
        .map(|s| (s.title.as_str(), names(&s.items)))
        .collect();
    assert_eq!(
        summary,
        vec![("CH", vec!["Toblerone"]), ("UK", vec!["Mars", "Twix"])]
    );
}

#[test]
fn test_render_uses_fallback_for_missing_fields() {
    let dir = TempDir::new().unwrap();
    let store = open(test_config(&dir));

    store
        .insert(EntityInput::new("Candy").with("name", "Kinder"))
        .unwrap();

    let view = FilteredLiveView::unfiltered(&store, SortSpec::new(), |c: &Candy| {
        format!(
            "{} ({})",
            c.name,
            livestore::or_fallback(c.country.as_deref(), "Unknown")
        )
    })
    .unwrap();
    assert_eq!(view.render_all().unwrap(), vec!["Kinder (Unknown)"]);

    let entities = view.entities();
    assert_eq!(text_or(&entities[0], "country", "Unknown"), "Unknown");
}

#[test]
fn test_relationship_inverse_and_sorted_children() {
    let dir = TempDir::new().unwrap();
    let store = open(test_config(&dir));

    let uk = store.insert(country("UK", "United Kingdom")).unwrap();
    let twix = store.insert(candy("Twix", "UK")).unwrap();
    let mars = store.insert(candy("Mars", "UK")).unwrap();
    let bounty = store.insert(candy("Bounty", "UK")).unwrap();

    store.link(uk, "candy", twix).unwrap();
    store.link(mars, "origin", uk).unwrap();
    store.link(uk, "candy", bounty).unwrap();

    assert_eq!(store.get(twix).unwrap().related("origin"), Some(uk));
    assert_eq!(store.get(bounty).unwrap().related("origin"), Some(uk));

    let children = store
        .children(uk, "candy", &SortSpec::new().ascending("name"))
        .unwrap();
    assert_eq!(names(&children), vec!["Bounty", "Mars", "Twix"]);

    // Unsorted projection keeps the order children were added in
    let unsorted = store.children(uk, "candy", &SortSpec::new()).unwrap();
    assert_eq!(names(&unsorted), vec!["Twix", "Mars", "Bounty"]);

    store.unlink(uk, "candy", mars).unwrap();
    assert_eq!(store.get(mars).unwrap().related("origin"), None);
    assert_eq!(store.children(uk, "candy", &SortSpec::new()).unwrap().len(), 2);
}

#[test]
fn test_persistence_with_relationships() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let (ch, toblerone) = {
        let store = open(config.clone());
        let ch = store.insert(country("CH", "Switzerland")).unwrap();
        let toblerone = store.insert(candy("Toblerone", "CH")).unwrap();
        store.link(toblerone, "origin", ch).unwrap();
        store.save().unwrap();
        (ch, toblerone)
    };

    let store = open(config);
    assert_eq!(store.get(toblerone).unwrap().related("origin"), Some(ch));
    assert_eq!(
        store
            .get(ch)
            .unwrap()
            .children("candy")
            .collect::<Vec<_>>(),
        vec![toblerone]
    );
}

#[test]
fn test_automatic_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        checkpoint_every: 2,
        ..test_config(&dir)
    };

    {
        let store = open(config.clone());
        for name in ["Mars", "Twix", "Bounty"] {
            store.insert(candy(name, "UK")).unwrap();
            store.save().unwrap();
        }
        assert!(store.stats().snapshot_size_bytes > 0);
    }

    let store = open(config);
    let all = store.fetch("Candy", None, &SortSpec::new().ascending("name"));
    assert_eq!(names(&all), vec!["Bounty", "Mars", "Twix"]);
}

#[test]
fn test_overwrite_merge_keeps_existing_id() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        merge_policy: MergePolicyTable::default()
            .with_type("Country", MergePolicy::OverwriteWithNewer),
        ..test_config(&dir)
    };
    let store = open(config);

    let existing = store.insert(country("UK", "Britain")).unwrap();
    let mars = store.insert(candy("Mars", "UK")).unwrap();
    store.link(mars, "origin", existing).unwrap();
    store.save().unwrap();

    // A second "UK" arrives, e.g. from an import, with its own candy
    let newer = store.insert(country("UK", "United Kingdom")).unwrap();
    let twix = store.insert(candy("Twix", "UK")).unwrap();
    store.link(twix, "origin", newer).unwrap();

    let outcome = store.save().unwrap();
    assert!(matches!(outcome, SaveOutcome::Committed { merged: 1, .. }));

    assert!(store.get(newer).is_none());
    let survivor = store.get(existing).unwrap();
    assert_eq!(survivor.text("fullName"), Some("United Kingdom"));

    let children = store
        .children(existing, "candy", &SortSpec::new().ascending("name"))
        .unwrap();
    assert_eq!(names(&children), vec!["Mars", "Twix"]);
    assert_eq!(store.get(twix).unwrap().related("origin"), Some(existing));
}

#[test]
fn test_fetch_with_filter() {
    let dir = TempDir::new().unwrap();
    let store = open(test_config(&dir));

    for (name, origin) in [("Mars", "UK"), ("Toblerone", "CH"), ("Twix", "UK")] {
        store.insert(candy(name, origin)).unwrap();
    }

    let uk = store.fetch(
        "Candy",
        Some(&FilterSpec::equals("country", "UK")),
        &SortSpec::new().descending("name"),
    );
    assert_eq!(names(&uk), vec!["Twix", "Mars"]);
}

#[test]
fn test_json_input() {
    let dir = TempDir::new().unwrap();
    let store = open(test_config(&dir));

    let input = EntityInput::json(
        "Candy",
        &serde_json::json!({ "name": "Milka", "country": null }),
    )
    .unwrap();
    let id = store.insert(input).unwrap();

    let entity = store.get(id).unwrap();
    assert_eq!(entity.text("name"), Some("Milka"));
    assert_eq!(entity.get("country"), None);
}
