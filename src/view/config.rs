//! Declarative view configuration.

use crate::error::Result;
use crate::query::{FilterSpec, FilterValue, SortDirection, SortSpec};
use serde::{Deserialize, Serialize};

/// Filter half of a [`ViewConfig`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub key: String,
    pub value: FilterValue,
    /// Predicate kind, e.g. `"BEGINSWITH"`, `"CONTAINS[c]"`, `"NOT IN"`.
    pub predicate: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortConfig {
    pub key: String,
    #[serde(default)]
    pub descending: bool,
}

/// Serializable description of a view.
///
/// ```json
/// {
///   "filter": { "key": "name", "value": "E", "predicate": "BEGINSWITH" },
///   "sort": [ { "key": "name" } ]
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewConfig {
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub sort: Vec<SortConfig>,
}

impl ViewConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build the typed filter. Unknown predicate kinds fail here with
    /// `InvalidPredicate`.
    pub fn filter_spec(&self) -> Result<Option<FilterSpec>> {
        self.filter
            .as_ref()
            .map(|f| FilterSpec::parse(f.key.clone(), f.value.clone(), &f.predicate))
            .transpose()
    }

    pub fn sort_spec(&self) -> SortSpec {
        self.sort.iter().fold(SortSpec::new(), |spec, s| {
            let direction = if s.descending {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            };
            spec.then(s.key.clone(), direction)
        })
    }
}
