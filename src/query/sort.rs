//! Lexicographic sort descriptions.

use crate::types::Entity;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// One sort key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub key: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Ordered sequence of sort keys; the first key is primary.
///
/// Entities missing a key sort before entities that have it when ascending.
/// Sorting is stable: entities equal on every key keep their input order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    keys: Vec<SortKey>,
}

impl SortSpec {
    /// No keys; the input order (insertion order for live queries) is kept.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ascending(self, key: impl Into<String>) -> Self {
        self.then(key, SortDirection::Ascending)
    }

    pub fn descending(self, key: impl Into<String>) -> Self {
        self.then(key, SortDirection::Descending)
    }

    pub fn then(mut self, key: impl Into<String>, direction: SortDirection) -> Self {
        self.keys.push(SortKey {
            key: key.into(),
            direction,
        });
        self
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Compare two entities key by key.
    pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        for sort_key in &self.keys {
            let ordering = match (a.get(&sort_key.key), b.get(&sort_key.key)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => x.compare(y),
            };
            let ordering = match sort_key.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable in-place sort.
    pub fn sort(&self, entities: &mut [Entity]) {
        if !self.keys.is_empty() {
            entities.sort_by(|a, b| self.compare(a, b));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, FieldValue};
    use std::collections::BTreeMap;

    fn singer(id: u64, first: &str, last: Option<&str>) -> Entity {
        let mut fields = BTreeMap::new();
        fields.insert("firstName".to_string(), FieldValue::from(first));
        if let Some(last) = last {
            fields.insert("lastName".to_string(), FieldValue::from(last));
        }
        Entity::new(EntityId(id), "Singer".to_string(), fields)
    }

    fn first_names(entities: &[Entity]) -> Vec<&str> {
        entities.iter().filter_map(|e| e.text("firstName")).collect()
    }

    #[test]
    fn test_descending() {
        let mut singers = vec![
            singer(1, "Taylor", Some("Swift")),
            singer(2, "Ed", Some("Sheeran")),
            singer(3, "Adele", Some("Adkins")),
        ];
        SortSpec::new().descending("firstName").sort(&mut singers);
        assert_eq!(first_names(&singers), vec!["Taylor", "Ed", "Adele"]);
    }

    #[test]
    fn test_secondary_key() {
        let mut singers = vec![
            singer(1, "Taylor", Some("Swift")),
            singer(2, "Adele", Some("Swift")),
            singer(3, "Ed", Some("Sheeran")),
        ];
        SortSpec::new()
            .ascending("lastName")
            .ascending("firstName")
            .sort(&mut singers);
        assert_eq!(first_names(&singers), vec!["Ed", "Adele", "Taylor"]);
    }

    #[test]
    fn test_missing_key_sorts_first_and_ties_keep_order() {
        let mut singers = vec![
            singer(1, "B", Some("Same")),
            singer(2, "A", None),
            singer(3, "C", Some("Same")),
        ];
        SortSpec::new().ascending("lastName").sort(&mut singers);
        assert_eq!(first_names(&singers), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_empty_spec_keeps_input_order() {
        let mut singers = vec![singer(2, "Z", None), singer(1, "A", None)];
        SortSpec::new().sort(&mut singers);
        assert_eq!(first_names(&singers), vec!["Z", "A"]);
    }
}
