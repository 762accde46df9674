//! Core types for the entity store.

use crate::error::{Result, StoreError};
use crate::schema::FieldKind;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for an entity.
///
/// Assigned by the store from a monotonic counter and never reused, so id
/// order is insertion order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to an inserted entity.
pub type EntityRef = EntityId;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A typed field value. Absent (null) values are a missing key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::Bool(_) => FieldKind::Bool,
        }
    }

    /// Canonical text form, used by text predicates and grouping.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Text(s) => Cow::Borrowed(s.as_str()),
            FieldValue::Integer(i) => Cow::Owned(i.to_string()),
            FieldValue::Float(f) => Cow::Owned(f.to_string()),
            FieldValue::Bool(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Total order used for sorting.
    ///
    /// Numbers compare numerically across `Integer` and `Float`; values of
    /// unrelated kinds order by kind.
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        use FieldValue::*;
        match (self, other) {
            (Text(a), Text(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Bool(a), Bool(b)) => a.cmp(b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => 0,
            FieldValue::Integer(_) | FieldValue::Float(_) => 1,
            FieldValue::Text(_) => 2,
        }
    }

    fn from_json(field: &str, value: &serde_json::Value) -> Result<Option<Self>> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(FieldValue::Text(s.clone()))),
            Value::Bool(b) => Ok(Some(FieldValue::Bool(*b))),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Some(FieldValue::Integer(i))),
                None => n
                    .as_f64()
                    .map(|f| Some(FieldValue::Float(f)))
                    .ok_or_else(|| StoreError::schema_violation(format!("{field}: number out of range"))),
            },
            Value::Array(_) | Value::Object(_) => Err(StoreError::schema_violation(format!(
                "{field}: nested values are not supported"
            ))),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v.into())
    }
}

impl From<i16> for FieldValue {
    fn from(v: i16) -> Self {
        FieldValue::Integer(v.into())
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Members of a to-many relationship.
///
/// Behaves as a set (no duplicates, no meaningful order). Insertion order is
/// retained only so that sorted projections are stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSet {
    members: Vec<EntityId>,
}

impl ChildSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already a member.
    pub fn insert(&mut self, id: EntityId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.members.push(id);
        true
    }

    pub fn remove(&mut self, id: EntityId) -> bool {
        match self.members.iter().position(|m| *m == id) {
            Some(pos) => {
                self.members.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.members.iter().copied()
    }
}

impl FromIterator<EntityId> for ChildSet {
    fn from_iter<I: IntoIterator<Item = EntityId>>(iter: I) -> Self {
        let mut set = ChildSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

/// A stored entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identity (assigned by store).
    pub id: EntityId,

    /// Name of the schema this entity belongs to.
    pub entity_type: String,

    /// Present field values.
    pub fields: BTreeMap<String, FieldValue>,

    /// To-one relationships.
    pub to_one: BTreeMap<String, EntityId>,

    /// To-many relationships.
    pub to_many: BTreeMap<String, ChildSet>,
}

impl Entity {
    pub(crate) fn new(id: EntityId, entity_type: String, fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            id,
            entity_type,
            fields,
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_str)
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(FieldValue::as_i64)
    }

    /// Target of a to-one relationship.
    pub fn related(&self, relationship: &str) -> Option<EntityId> {
        self.to_one.get(relationship).copied()
    }

    /// Members of a to-many relationship (empty if never linked).
    pub fn children(&self, relationship: &str) -> impl Iterator<Item = EntityId> + '_ {
        self.to_many
            .get(relationship)
            .into_iter()
            .flat_map(|set| set.iter())
    }
}

/// Input for creating a new entity (before an id is assigned).
#[derive(Clone, Debug)]
pub struct EntityInput {
    pub entity_type: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl EntityInput {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Set a field value.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Build an input from a JSON object. Null members are treated as absent.
    pub fn json(entity_type: impl Into<String>, payload: &impl Serialize) -> Result<Self> {
        let value = serde_json::to_value(payload)?;
        let object = match value {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(StoreError::schema_violation(format!(
                    "entity payload must be a JSON object, got {other}"
                )))
            }
        };

        let mut fields = BTreeMap::new();
        for (name, raw) in &object {
            if let Some(v) = FieldValue::from_json(name, raw)? {
                fields.insert(name.clone(), v);
            }
        }

        Ok(Self {
            entity_type: entity_type.into(),
            fields,
        })
    }
}

/// What a call to `save` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing was pending; no IO was performed.
    NoChanges,
    /// Pending changes were journaled.
    Committed {
        /// Entities written or deleted.
        changes: usize,
        /// Newer entities folded into existing ones by the merge policy.
        merged: usize,
    },
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub entity_count: u64,
    pub pending_count: u64,
    pub schema_count: u64,
    pub subscription_count: u64,
    pub journal_size_bytes: u64,
    pub snapshot_size_bytes: u64,
}
