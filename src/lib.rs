//! # livestore
//!
//! An embedded entity store with live, filtered and sorted views.
//!
//! ## Core Concepts
//!
//! - **Entities**: Typed records with a stable id, fields and relationships
//! - **Schemas**: Declared per entity type; checked on every mutation
//! - **Save**: Pending changes are journaled on `save`, with merge policies
//!   for unique-field conflicts
//! - **Live views**: Filter + sort + render, kept current on every mutation
//!
//! ## Example
//!
//! ```ignore
//! use livestore::{EntityInput, EntitySchema, FieldDef, FilteredLiveView, PredicateMode, SortSpec, Store, StoreConfig};
//!
//! let store = Store::open_or_create(StoreConfig {
//!     path: "./candies".into(),
//!     ..Default::default()
//! })?;
//!
//! store.register_schema(
//!     EntitySchema::new("Candy")
//!         .field(FieldDef::text("name").required())
//!         .field(FieldDef::text("country")),
//! )?;
//!
//! store.insert(EntityInput::new("Candy").with("name", "Mars").with("country", "UK"))?;
//! store.save()?;
//!
//! let view = FilteredLiveView::new(
//!     &store,
//!     "name",
//!     "M",
//!     PredicateMode::PrefixMatch,
//!     SortSpec::new().ascending("name"),
//!     |candy: &Candy| candy.name.clone(),
//! )?;
//!
//! for item in view.items() {
//!     println!("{}", item?);
//! }
//! ```

mod context;
pub mod error;
pub mod merge;
pub mod present;
pub mod query;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod view;
pub mod wal;

// Re-exports
pub use error::{Result, StoreError};
pub use merge::{MergePolicy, MergePolicyTable};
pub use present::{or_fallback, sections, sorted_children, text_or, Section};
pub use query::{FilterSpec, FilterValue, PredicateMode, SortDirection, SortKey, SortSpec};
pub use schema::{Cardinality, EntitySchema, FieldDef, FieldKind, RelationshipDef, SchemaRegistry};
pub use snapshot::Snapshot;
pub use store::{Batch, Store, StoreConfig};
pub use subscriptions::{
    ChangeEvent, DropReason, LiveQuery, LiveResultSet, ResultSnapshot, SubscriptionId,
    SubscriptionManager,
};
pub use types::*;
pub use view::{FilterConfig, FilteredLiveView, Model, RenderedItems, SortConfig, ViewConfig};
pub use wal::{JournalEntry, Mutation, WriteAheadLog};
