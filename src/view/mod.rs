//! Typed live views over the store.
//!
//! A [`FilteredLiveView`] binds an entity type, a filter, a sort order and a
//! render callback. It re-renders from the latest result set every time it
//! is iterated; [`ViewConfig`] lets the same description come from JSON.

mod config;
mod live;

pub use config::{FilterConfig, SortConfig, ViewConfig};
pub use live::{FilteredLiveView, Model, RenderedItems};
