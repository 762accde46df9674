//! Presentation helpers.
//!
//! Small pure functions used at the rendering boundary: fallback text for
//! missing fields, sorted projections of to-many relationships and grouping
//! into titled sections.

use crate::query::SortSpec;
use crate::types::Entity;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// `value`, or `fallback` when it is missing.
pub fn or_fallback<'a>(value: Option<&'a str>, fallback: &'a str) -> &'a str {
    value.unwrap_or(fallback)
}

/// Text form of a field, or `fallback` when the entity has no value for it.
pub fn text_or<'a>(entity: &'a Entity, field: &str, fallback: &'a str) -> Cow<'a, str> {
    match entity.get(field) {
        Some(value) => value.as_text(),
        None => Cow::Borrowed(fallback),
    }
}

/// Sorted copy of a child collection.
///
/// Stable: children equal on every sort key keep the order they were added
/// in. Calling it again on its own output returns the same sequence.
pub fn sorted_children(children: &[Entity], sort: &SortSpec) -> Vec<Entity> {
    let mut sorted = children.to_vec();
    sort.sort(&mut sorted);
    sorted
}

/// A titled group of entities.
#[derive(Clone, Debug, PartialEq)]
pub struct Section {
    pub title: String,
    pub items: Vec<Entity>,
}

/// Group entities by the text form of `key`.
///
/// Sections are ordered by title; entities keep their input order inside
/// a section. Entities without the key go under `fallback`.
pub fn sections(entities: &[Entity], key: &str, fallback: &str) -> Vec<Section> {
    let mut groups: BTreeMap<String, Vec<Entity>> = BTreeMap::new();
    for entity in entities {
        groups
            .entry(text_or(entity, key, fallback).into_owned())
            .or_default()
            .push(entity.clone());
    }

    groups
        .into_iter()
        .map(|(title, items)| Section { title, items })
        .collect()
}
