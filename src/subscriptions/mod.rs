//! Live queries over the entity store.
//!
//! A subscription pairs a [`LiveQuery`] (entity type, optional filter, sort)
//! with a store-owned result snapshot that is re-derived after every
//! mutation. Subscribers hold a [`LiveResultSet`]: a non-owning view of that
//! snapshot plus a bounded channel of change signals.
//!
//! Signals coalesce. A subscriber that falls behind is never dropped,
//! because the snapshot it reads next is always the latest one.
//!
//! # Example
//!
//! ```ignore
//! let results = store.subscribe("Ship", Some(FilterSpec::prefix("name", "E")), SortSpec::new())?;
//!
//! loop {
//!     match results.recv() {
//!         Ok(ChangeEvent::Changed { .. }) => println!("{} ships", results.len()),
//!         Ok(ChangeEvent::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    ChangeEvent, DropReason, LiveQuery, LiveResultSet, ResultSnapshot, SubscriptionId,
};
