//! Merge policies for unique-field conflicts.
//!
//! Conflicts are resolved when pending changes are saved. Two entities of
//! the same type holding the same value in a field declared `unique` are a
//! conflict; the entity that was already committed (or, among pending ones,
//! the oldest) is the existing one.

use crate::context::EntityContext;
use crate::error::{Result, StoreError};
use crate::schema::SchemaRegistry;
use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// How a unique-field conflict is resolved on save.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Fail the save; pending changes stay pending.
    #[default]
    RejectNewer,
    /// Copy the newer entity's present fields onto the existing one, move
    /// its relationships over and drop it. The existing id survives.
    OverwriteWithNewer,
}

/// Merge policy per entity type, with a fallback.
#[derive(Clone, Debug, Default)]
pub struct MergePolicyTable {
    default: MergePolicy,
    per_type: HashMap<String, MergePolicy>,
}

impl MergePolicyTable {
    pub fn new(default: MergePolicy) -> Self {
        Self {
            default,
            per_type: HashMap::new(),
        }
    }

    /// Override the policy for one entity type.
    pub fn with_type(mut self, entity_type: impl Into<String>, policy: MergePolicy) -> Self {
        self.per_type.insert(entity_type.into(), policy);
        self
    }

    pub fn policy_for(&self, entity_type: &str) -> MergePolicy {
        self.per_type
            .get(entity_type)
            .copied()
            .unwrap_or(self.default)
    }
}

impl From<MergePolicy> for MergePolicyTable {
    fn from(policy: MergePolicy) -> Self {
        Self::new(policy)
    }
}

impl EntityContext {
    /// Resolve unique-field conflicts involving pending entities.
    ///
    /// Returns how many entities were merged away. Must run inside a
    /// transaction; on error the caller rolls back.
    pub(crate) fn resolve_conflicts(
        &mut self,
        schemas: &SchemaRegistry,
        policies: &MergePolicyTable,
    ) -> Result<usize> {
        let mut merged = 0;

        for schema in schemas.iter() {
            for field in schema.unique_fields() {
                for (value, group) in self.duplicate_groups(&schema.name, &field.name) {
                    match policies.policy_for(&schema.name) {
                        MergePolicy::RejectNewer => {
                            return Err(StoreError::UniqueConstraint {
                                entity_type: schema.name.clone(),
                                field: field.name.clone(),
                                value,
                            });
                        }
                        MergePolicy::OverwriteWithNewer => {
                            let survivor = group
                                .iter()
                                .copied()
                                .find(|id| self.committed.contains_key(id))
                                .unwrap_or(group[0]);
                            for newer in group.into_iter().filter(|id| *id != survivor) {
                                warn!(
                                    entity_type = %schema.name,
                                    field = %field.name,
                                    %value,
                                    survivor = %survivor,
                                    newer = %newer,
                                    "merging duplicate entity"
                                );
                                self.merge_into(schemas, newer, survivor)?;
                                merged += 1;
                            }
                        }
                    }
                }
            }
        }

        Ok(merged)
    }

    /// Groups of entities sharing a value, where at least one is pending.
    fn duplicate_groups(&self, entity_type: &str, field: &str) -> Vec<(String, Vec<EntityId>)> {
        let mut groups: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        for entity in self.of_type(entity_type) {
            if let Some(value) = entity.get(field) {
                groups
                    .entry(value.as_text().into_owned())
                    .or_default()
                    .push(entity.id);
            }
        }

        groups
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1 && ids.iter().any(|id| self.dirty.contains(id)))
            .collect()
    }

    fn merge_into(&mut self, schemas: &SchemaRegistry, newer: EntityId, survivor: EntityId) -> Result<()> {
        let source = self
            .get(newer)
            .cloned()
            .ok_or(StoreError::EntityNotFound(newer))?;

        for (field, value) in source.fields {
            self.set_field(schemas, survivor, &field, Some(value))?;
        }

        let schema = schemas.require(&source.entity_type)?;
        for (name, target) in &source.to_one {
            if let Some(def) = schema.relationship_def(name) {
                self.connect(schemas, survivor, def, *target)?;
            }
        }
        for (name, children) in &source.to_many {
            if let Some(def) = schema.relationship_def(name) {
                for child in children.iter() {
                    self.connect(schemas, survivor, def, child)?;
                }
            }
        }

        self.delete(schemas, newer)
    }
}
