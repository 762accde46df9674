//! Generic filtered live view.

use crate::error::{Result, StoreError};
use crate::query::{FilterSpec, FilterValue, PredicateMode, SortSpec};
use crate::store::Store;
use crate::subscriptions::{ChangeEvent, LiveResultSet, SubscriptionId};
use crate::types::Entity;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::config::ViewConfig;

/// A typed projection of one entity type.
pub trait Model: Sized {
    /// Entity type this model reads.
    const ENTITY: &'static str;

    fn from_entity(entity: &Entity) -> Result<Self>;
}

type Render<'s, T, R> = Box<dyn Fn(&T) -> R + Send + Sync + 's>;

/// Live, filtered and sorted view of every `T` in a store.
///
/// The view holds a subscription, not the results: each call to
/// [`items`](Self::items) starts over from the store's latest result set and
/// calls `render` once per entity, in sort order. Dropping the view
/// unsubscribes.
pub struct FilteredLiveView<'s, T: Model, R> {
    store: &'s Store,
    results: LiveResultSet,
    filter: Option<FilterSpec>,
    sort: SortSpec,
    render: Render<'s, T, R>,
}

impl<'s, T: Model, R> FilteredLiveView<'s, T, R> {
    /// View of the `T`s whose `key` matches `value` under `mode`.
    pub fn new<F>(
        store: &'s Store,
        key: &str,
        value: impl Into<FilterValue>,
        mode: PredicateMode,
        sort: SortSpec,
        render: F,
    ) -> Result<Self>
    where
        F: Fn(&T) -> R + Send + Sync + 's,
    {
        let filter = FilterSpec::new(key, value, mode)?;
        Self::with_filter(store, Some(filter), sort, render)
    }

    /// View of every `T`.
    pub fn unfiltered<F>(store: &'s Store, sort: SortSpec, render: F) -> Result<Self>
    where
        F: Fn(&T) -> R + Send + Sync + 's,
    {
        Self::with_filter(store, None, sort, render)
    }

    /// View built from a declarative config. A bad predicate fails before
    /// anything is registered with the store.
    pub fn from_config<F>(store: &'s Store, config: &ViewConfig, render: F) -> Result<Self>
    where
        F: Fn(&T) -> R + Send + Sync + 's,
    {
        let filter = config.filter_spec()?;
        Self::with_filter(store, filter, config.sort_spec(), render)
    }

    pub fn with_filter<F>(
        store: &'s Store,
        filter: Option<FilterSpec>,
        sort: SortSpec,
        render: F,
    ) -> Result<Self>
    where
        F: Fn(&T) -> R + Send + Sync + 's,
    {
        let results = store.subscribe(T::ENTITY, filter.clone(), sort.clone())?;
        Ok(Self {
            store,
            results,
            filter,
            sort,
            render: Box::new(render),
        })
    }

    /// Rendered items of the current result set.
    ///
    /// The iterator holds its own snapshot, so mutations made while it runs
    /// do not affect it and never wait on it.
    pub fn items(&self) -> RenderedItems<'_, T, R> {
        RenderedItems {
            entities: self.results.entities(),
            index: 0,
            render: &*self.render,
            _model: PhantomData,
        }
    }

    /// Render everything, stopping at the first entity that does not
    /// convert into `T`.
    pub fn render_all(&self) -> Result<Vec<R>> {
        self.items().collect()
    }

    /// Raw entities of the current result set, in view order.
    pub fn entities(&self) -> Arc<[Entity]> {
        self.results.entities()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn id(&self) -> SubscriptionId {
        self.results.id()
    }

    pub fn filter(&self) -> Option<&FilterSpec> {
        self.filter.as_ref()
    }

    pub fn sort(&self) -> &SortSpec {
        &self.sort
    }

    /// Consume pending change signals. Returns true if the result set
    /// changed since the last call.
    pub fn refresh(&self) -> bool {
        self.results.drain()
    }

    /// Block until the result set changes. Returns false on timeout or if
    /// the subscription was torn down.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        match self.results.recv_timeout(timeout) {
            Ok(ChangeEvent::Changed { .. }) => {
                self.results.drain();
                true
            }
            Ok(ChangeEvent::Dropped { .. }) | Err(_) => false,
        }
    }

    /// Change the filter value, keeping key, mode and modifiers.
    pub fn set_filter_value(&mut self, value: impl Into<FilterValue>) -> Result<()> {
        let filter = self
            .filter
            .as_ref()
            .ok_or_else(|| StoreError::invalid_predicate("view has no filter to reconfigure"))?
            .with_value(value)?;
        self.set_filter(Some(filter))
    }

    /// Replace the filter. The store swaps it in one step; no iteration
    /// ever sees results of both filters.
    pub fn set_filter(&mut self, filter: Option<FilterSpec>) -> Result<()> {
        self.store.replace_filter(self.results.id(), filter.clone())?;
        self.filter = filter;
        Ok(())
    }
}

impl<T: Model, R> Drop for FilteredLiveView<'_, T, R> {
    fn drop(&mut self) {
        self.store.unsubscribe(self.results.id());
    }
}

impl<T: Model, R> fmt::Debug for FilteredLiveView<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredLiveView")
            .field("entity", &T::ENTITY)
            .field("subscription", &self.results.id())
            .field("filter", &self.filter)
            .field("sort", &self.sort)
            .finish()
    }
}

/// Lazy iterator of rendered items over one result snapshot.
pub struct RenderedItems<'v, T, R> {
    entities: Arc<[Entity]>,
    index: usize,
    render: &'v (dyn Fn(&T) -> R + Send + Sync),
    _model: PhantomData<fn() -> T>,
}

impl<T: Model, R> Iterator for RenderedItems<'_, T, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        let entity = self.entities.get(self.index)?;
        self.index += 1;
        Some(T::from_entity(entity).map(|model| (self.render)(&model)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entities.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl<T: Model, R> ExactSizeIterator for RenderedItems<'_, T, R> {}
