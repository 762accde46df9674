//! Entity schemas.
//!
//! Schemas are declared by the caller each time a store is opened. They
//! define which fields an entity type has, which of them are required or
//! unique, and how entity types relate to each other.

use crate::error::{Result, StoreError};
use crate::types::{EntityInput, FieldValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Declared type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Bool,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A field declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// Inserts without this field are rejected.
    pub required: bool,
    /// At most one entity of the type may hold a given value after save.
    pub unique: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            unique: false,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Bool)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// How many targets a relationship holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// A relationship declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDef {
    pub name: String,
    /// Entity type on the other end.
    pub target: String,
    pub cardinality: Cardinality,
    /// Relationship on the target that mirrors this one.
    pub inverse: Option<String>,
}

/// Schema for one entity type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub relationships: Vec<RelationshipDef>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    /// Declare a to-one relationship.
    pub fn to_one(self, name: &str, target: &str, inverse: Option<&str>) -> Self {
        self.relationship(name, target, Cardinality::ToOne, inverse)
    }

    /// Declare a to-many relationship.
    pub fn to_many(self, name: &str, target: &str, inverse: Option<&str>) -> Self {
        self.relationship(name, target, Cardinality::ToMany, inverse)
    }

    fn relationship(
        mut self,
        name: &str,
        target: &str,
        cardinality: Cardinality,
        inverse: Option<&str>,
    ) -> Self {
        self.relationships.push(RelationshipDef {
            name: name.to_string(),
            target: target.to_string(),
            cardinality,
            inverse: inverse.map(str::to_string),
        });
        self
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relationship_def(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Whether `key` names a field that filters and sorts may refer to.
    pub fn has_field(&self, key: &str) -> bool {
        self.field_def(key).is_some()
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.unique)
    }

    /// Check a new entity against this schema.
    pub fn validate_input(&self, input: &EntityInput) -> Result<()> {
        for (name, value) in &input.fields {
            self.check_value(name, value)?;
        }

        if let Some(missing) = self
            .fields
            .iter()
            .find(|f| f.required && !input.fields.contains_key(&f.name))
        {
            return Err(StoreError::schema_violation(format!(
                "{}.{} is required",
                self.name, missing.name
            )));
        }

        Ok(())
    }

    /// Check a single field assignment. `None` clears the field.
    pub fn validate_update(&self, field: &str, value: Option<&FieldValue>) -> Result<()> {
        match value {
            Some(v) => self.check_value(field, v),
            None => match self.field_def(field) {
                None => Err(self.unknown_field(field)),
                Some(def) if def.required => Err(StoreError::schema_violation(format!(
                    "{}.{} is required and cannot be cleared",
                    self.name, field
                ))),
                Some(_) => Ok(()),
            },
        }
    }

    fn check_value(&self, field: &str, value: &FieldValue) -> Result<()> {
        let def = self.field_def(field).ok_or_else(|| self.unknown_field(field))?;
        if def.kind != value.kind() {
            return Err(StoreError::schema_violation(format!(
                "{}.{} expects {}, got {}",
                self.name,
                field,
                def.kind,
                value.kind()
            )));
        }
        Ok(())
    }

    fn unknown_field(&self, field: &str) -> StoreError {
        StoreError::schema_violation(format!("{} has no field named {:?}", self.name, field))
    }
}

/// All schemas known to a store.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema.
    ///
    /// Registering an identical schema twice is a no-op, so callers can
    /// declare their model on every open.
    pub fn register(&mut self, schema: EntitySchema) -> Result<()> {
        match self.schemas.get(&schema.name) {
            Some(existing) if *existing == schema => Ok(()),
            Some(_) => Err(StoreError::SchemaExists(schema.name)),
            None => {
                self.schemas.insert(schema.name.clone(), schema);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&EntitySchema> {
        self.schemas.get(name)
    }

    /// Look up a schema for a mutation; unknown types are a schema violation.
    pub fn require(&self, name: &str) -> Result<&EntitySchema> {
        self.get(name)
            .ok_or_else(|| StoreError::schema_violation(format!("unknown entity type {name:?}")))
    }

    /// Resolve a relationship on a type.
    pub fn relationship(&self, entity_type: &str, name: &str) -> Result<&RelationshipDef> {
        self.require(entity_type)?
            .relationship_def(name)
            .ok_or_else(|| {
                StoreError::schema_violation(format!(
                    "{entity_type} has no relationship named {name:?}"
                ))
            })
    }

    /// Resolve the inverse side of a relationship, if it declares one.
    pub fn inverse_of(&self, def: &RelationshipDef) -> Result<Option<&RelationshipDef>> {
        match &def.inverse {
            Some(inverse) => self.relationship(&def.target, inverse).map(Some),
            None => Ok(None),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
