//! Field-level filter predicates.

use crate::error::{Result, StoreError};
use crate::types::{Entity, FieldValue};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Matching semantics applied to a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateMode {
    /// Field text starts with the filter value (literal, no wildcards).
    PrefixMatch,
    /// Field text contains the filter value as a contiguous substring.
    Contains,
    /// Field text equals any one of the candidate values.
    MembershipInSet,
    /// Field text equals the filter value.
    Equals,
}

impl PredicateMode {
    /// Whether the mode accepts a set of candidates rather than one value.
    pub fn takes_set(self) -> bool {
        matches!(self, PredicateMode::MembershipInSet)
    }
}

impl FromStr for PredicateMode {
    type Err = StoreError;

    /// Parse a predicate keyword such as `BEGINSWITH`, `CONTAINS`, `IN` or `==`.
    fn from_str(s: &str) -> Result<Self> {
        let keyword = s.trim();
        let mode = if keyword.eq_ignore_ascii_case("BEGINSWITH")
            || keyword.eq_ignore_ascii_case("PREFIX")
        {
            PredicateMode::PrefixMatch
        } else if keyword.eq_ignore_ascii_case("CONTAINS") {
            PredicateMode::Contains
        } else if keyword.eq_ignore_ascii_case("IN") {
            PredicateMode::MembershipInSet
        } else if keyword == "==" || keyword == "=" || keyword.eq_ignore_ascii_case("EQUALS") {
            PredicateMode::Equals
        } else {
            return Err(StoreError::invalid_predicate(format!(
                "unsupported predicate kind {keyword:?}"
            )));
        };
        Ok(mode)
    }
}

impl fmt::Display for PredicateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self {
            PredicateMode::PrefixMatch => "BEGINSWITH",
            PredicateMode::Contains => "CONTAINS",
            PredicateMode::MembershipInSet => "IN",
            PredicateMode::Equals => "==",
        };
        f.write_str(keyword)
    }
}

/// Comparison operand of a filter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(String),
    Set(Vec<String>),
}

impl FilterValue {
    fn candidates(&self) -> &[String] {
        match self {
            FilterValue::One(v) => std::slice::from_ref(v),
            FilterValue::Set(vs) => vs,
        }
    }

    fn single(&self) -> Option<&str> {
        match self {
            FilterValue::One(v) => Some(v),
            FilterValue::Set(_) => None,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::One(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        FilterValue::One(v)
    }
}

impl From<Vec<String>> for FilterValue {
    fn from(v: Vec<String>) -> Self {
        FilterValue::Set(v)
    }
}

impl From<Vec<&str>> for FilterValue {
    fn from(v: Vec<&str>) -> Self {
        FilterValue::Set(v.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for FilterValue {
    fn from(v: [&str; N]) -> Self {
        FilterValue::Set(v.iter().map(|s| s.to_string()).collect())
    }
}

/// A validated field-level match condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterSpec {
    key: String,
    value: FilterValue,
    mode: PredicateMode,
    case_insensitive: bool,
    negated: bool,
}

impl FilterSpec {
    /// Build a filter, checking that the value shape fits the mode.
    ///
    /// Membership accepts a single value as a one-element set; every other
    /// mode needs exactly one value.
    pub fn new(key: impl Into<String>, value: impl Into<FilterValue>, mode: PredicateMode) -> Result<Self> {
        let key = key.into();
        let value = value.into();

        if key.is_empty() {
            return Err(StoreError::invalid_predicate("filter key is empty"));
        }
        if !mode.takes_set() && value.single().is_none() {
            return Err(StoreError::invalid_predicate(format!(
                "{mode} on {key:?} takes a single value, got a set"
            )));
        }

        Ok(Self {
            key,
            value,
            mode,
            case_insensitive: false,
            negated: false,
        })
    }

    /// Build a filter from a predicate expression such as `BEGINSWITH`,
    /// `CONTAINS[c]` or `NOT IN`.
    pub fn parse(key: impl Into<String>, value: impl Into<FilterValue>, expr: &str) -> Result<Self> {
        let mut rest = expr.trim();

        let negated = match rest.get(..4) {
            Some(head) if head.eq_ignore_ascii_case("NOT ") => {
                rest = rest[4..].trim_start();
                true
            }
            _ => false,
        };

        let case_insensitive = match rest.strip_suffix("[c]").or_else(|| rest.strip_suffix("[C]")) {
            Some(stripped) => {
                rest = stripped;
                true
            }
            None => false,
        };

        let mode: PredicateMode = rest.parse()?;
        let mut spec = Self::new(key, value, mode)?;
        spec.case_insensitive = case_insensitive;
        spec.negated = negated;
        Ok(spec)
    }

    /// Prefix filter on one value.
    pub fn prefix(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::single(key, value, PredicateMode::PrefixMatch)
    }

    /// Substring filter on one value.
    pub fn contains(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::single(key, value, PredicateMode::Contains)
    }

    /// Equality filter on one value.
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::single(key, value, PredicateMode::Equals)
    }

    /// Membership filter over a set of candidates.
    pub fn one_of<I, S>(key: impl Into<String>, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            value: FilterValue::Set(candidates.into_iter().map(Into::into).collect()),
            mode: PredicateMode::MembershipInSet,
            case_insensitive: false,
            negated: false,
        }
    }

    fn single(key: impl Into<String>, value: impl Into<String>, mode: PredicateMode) -> Self {
        Self {
            key: key.into(),
            value: FilterValue::One(value.into()),
            mode,
            case_insensitive: false,
            negated: false,
        }
    }

    /// Compare case-insensitively (the `[c]` modifier).
    pub fn ignore_case(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Invert the predicate (the `NOT` modifier).
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Same key, mode and modifiers with a different value.
    pub fn with_value(&self, value: impl Into<FilterValue>) -> Result<Self> {
        let mut spec = Self::new(self.key.clone(), value, self.mode)?;
        spec.case_insensitive = self.case_insensitive;
        spec.negated = self.negated;
        Ok(spec)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &FilterValue {
        &self.value
    }

    pub fn mode(&self) -> PredicateMode {
        self.mode
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Evaluate against an entity. A missing field never satisfies a
    /// non-negated predicate.
    pub fn matches(&self, entity: &Entity) -> bool {
        let hit = entity
            .get(&self.key)
            .map_or(false, |value| self.matches_value(value));
        hit != self.negated
    }

    /// Evaluate the (non-negated) predicate against a present value.
    pub fn matches_value(&self, value: &FieldValue) -> bool {
        let text = self.fold(value.as_text());

        match self.mode {
            PredicateMode::MembershipInSet => self
                .value
                .candidates()
                .iter()
                .any(|c| self.fold(Cow::Borrowed(c.as_str())) == text),
            PredicateMode::PrefixMatch => self
                .needle()
                .map_or(false, |needle| text.starts_with(&*needle)),
            PredicateMode::Contains => self
                .needle()
                .map_or(false, |needle| text.contains(&*needle)),
            PredicateMode::Equals => self.needle().map_or(false, |needle| text == needle),
        }
    }

    fn needle(&self) -> Option<Cow<'_, str>> {
        self.value.single().map(|v| self.fold(Cow::Borrowed(v)))
    }

    fn fold<'a>(&self, text: Cow<'a, str>) -> Cow<'a, str> {
        if self.case_insensitive {
            Cow::Owned(text.to_lowercase())
        } else {
            text
        }
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("NOT ")?;
        }
        write!(f, "{} {}", self.key, self.mode)?;
        if self.case_insensitive {
            f.write_str("[c]")?;
        }
        write!(f, " {:?}", self.value.candidates())
    }
}
