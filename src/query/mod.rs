//! Typed filter and sort descriptions.
//!
//! Filters are built from a key, a value and a [`PredicateMode`], never from
//! a formatted query string. Both filters and sorts are pure functions over
//! [`Entity`](crate::types::Entity) values; key validity against a schema is
//! checked by the store when a query is registered.

mod filter;
mod sort;

pub use filter::{FilterSpec, FilterValue, PredicateMode};
pub use sort::{SortDirection, SortKey, SortSpec};
