//! In-memory entity context.
//!
//! Holds the live state (committed plus pending changes) next to the last
//! committed state, tracks which entities changed since the last save, and
//! keeps both sides of inverse relationships in step. Every mutation runs
//! inside a transaction so a failing batch can be rolled back.

use crate::error::{Result, StoreError};
use crate::schema::{Cardinality, RelationshipDef, SchemaRegistry};
use crate::types::{Entity, EntityId, EntityInput, FieldValue};
use crate::wal::Mutation;
use std::collections::{BTreeMap, BTreeSet};

/// Prior state captured while a transaction is open.
struct UndoLog {
    prior: BTreeMap<EntityId, Option<Entity>>,
    dirty: BTreeSet<EntityId>,
}

pub(crate) struct EntityContext {
    /// Live entities, including pending changes.
    pub(crate) entities: BTreeMap<EntityId, Entity>,
    /// State as of the last save.
    pub(crate) committed: BTreeMap<EntityId, Entity>,
    /// Entities touched since the last save.
    pub(crate) dirty: BTreeSet<EntityId>,
    next_id: u64,
    undo: Option<UndoLog>,
}

impl EntityContext {
    pub fn new(entities: BTreeMap<EntityId, Entity>, next_id: u64) -> Self {
        let next_id = entities
            .keys()
            .next_back()
            .map_or(next_id, |last| next_id.max(last.0 + 1))
            .max(1);
        Self {
            committed: entities.clone(),
            entities,
            dirty: BTreeSet::new(),
            next_id,
            undo: None,
        }
    }

    // --- Reads ---

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    fn require(&self, id: EntityId) -> Result<&Entity> {
        self.get(id).ok_or(StoreError::EntityNotFound(id))
    }

    /// Live entities of a type, in id order.
    pub fn of_type<'a>(&'a self, entity_type: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.entities
            .values()
            .filter(move |e| e.entity_type == entity_type)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.dirty.len()
    }

    // --- Transactions ---

    pub fn begin(&mut self) {
        self.undo = Some(UndoLog {
            prior: BTreeMap::new(),
            dirty: self.dirty.clone(),
        });
    }

    pub fn commit_tx(&mut self) {
        self.undo = None;
    }

    /// Restore every entity touched since `begin`. Ids handed out inside the
    /// transaction are not reused.
    pub fn rollback(&mut self) {
        if let Some(undo) = self.undo.take() {
            for (id, prior) in undo.prior {
                match prior {
                    Some(entity) => {
                        self.entities.insert(id, entity);
                    }
                    None => {
                        self.entities.remove(&id);
                    }
                }
            }
            self.dirty = undo.dirty;
        }
    }

    fn touch(&mut self, id: EntityId) {
        if let Some(undo) = self.undo.as_mut() {
            if !undo.prior.contains_key(&id) {
                undo.prior.insert(id, self.entities.get(&id).cloned());
            }
        }
        self.dirty.insert(id);
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        if !self.entities.contains_key(&id) {
            return Err(StoreError::EntityNotFound(id));
        }
        self.touch(id);
        self.entities.get_mut(&id).ok_or(StoreError::EntityNotFound(id))
    }

    // --- Mutations ---

    pub fn insert(&mut self, schemas: &SchemaRegistry, input: EntityInput) -> Result<EntityId> {
        schemas.require(&input.entity_type)?.validate_input(&input)?;

        let id = EntityId(self.next_id);
        self.next_id += 1;

        self.touch(id);
        self.entities
            .insert(id, Entity::new(id, input.entity_type, input.fields));
        Ok(id)
    }

    /// Set (`Some`) or clear (`None`) a field.
    pub fn set_field(
        &mut self,
        schemas: &SchemaRegistry,
        id: EntityId,
        field: &str,
        value: Option<FieldValue>,
    ) -> Result<()> {
        let entity_type = self.require(id)?.entity_type.clone();
        schemas
            .require(&entity_type)?
            .validate_update(field, value.as_ref())?;

        if self.require(id)?.get(field) == value.as_ref() {
            return Ok(());
        }

        let entity = self.entity_mut(id)?;
        match value {
            Some(v) => {
                entity.fields.insert(field.to_string(), v);
            }
            None => {
                entity.fields.remove(field);
            }
        }
        Ok(())
    }

    /// Remove an entity and detach it from every relationship.
    pub fn delete(&mut self, schemas: &SchemaRegistry, id: EntityId) -> Result<()> {
        let entity = self.require(id)?.clone();

        if let Some(schema) = schemas.get(&entity.entity_type) {
            for (name, target) in &entity.to_one {
                if let Some(def) = schema.relationship_def(name) {
                    self.disconnect(schemas, id, def, *target)?;
                }
            }
            for (name, children) in &entity.to_many {
                if let Some(def) = schema.relationship_def(name) {
                    for child in children.iter() {
                        self.disconnect(schemas, id, def, child)?;
                    }
                }
            }
        }

        self.touch(id);
        self.entities.remove(&id);
        Ok(())
    }

    pub fn link(
        &mut self,
        schemas: &SchemaRegistry,
        from: EntityId,
        relationship: &str,
        to: EntityId,
    ) -> Result<()> {
        let def = self.resolve_edge(schemas, from, relationship, to)?;
        self.connect(schemas, from, def, to)
    }

    pub fn unlink(
        &mut self,
        schemas: &SchemaRegistry,
        from: EntityId,
        relationship: &str,
        to: EntityId,
    ) -> Result<()> {
        let def = self.resolve_edge(schemas, from, relationship, to)?;
        self.disconnect(schemas, from, def, to)
    }

    fn resolve_edge<'s>(
        &self,
        schemas: &'s SchemaRegistry,
        from: EntityId,
        relationship: &str,
        to: EntityId,
    ) -> Result<&'s RelationshipDef> {
        let from_type = &self.require(from)?.entity_type;
        let to_type = &self.require(to)?.entity_type;
        let def = schemas.relationship(from_type, relationship)?;
        if def.target != *to_type {
            return Err(StoreError::schema_violation(format!(
                "{from_type}.{relationship} expects {}, got {to_type}",
                def.target
            )));
        }
        Ok(def)
    }

    /// Add an edge and its inverse, detaching whatever a to-one side
    /// previously pointed at.
    pub(crate) fn connect(
        &mut self,
        schemas: &SchemaRegistry,
        from: EntityId,
        def: &RelationshipDef,
        to: EntityId,
    ) -> Result<()> {
        let inverse = schemas.inverse_of(def)?;

        if def.cardinality == Cardinality::ToOne {
            let current = self.require(from)?.related(&def.name);
            match current {
                Some(prev) if prev == to => return Ok(()),
                Some(prev) => self.disconnect(schemas, from, def, prev)?,
                None => {}
            }
        }

        if let Some(inv) = inverse {
            if inv.cardinality == Cardinality::ToOne {
                let current = self.require(to)?.related(&inv.name);
                if let Some(prev) = current {
                    if prev != from {
                        self.disconnect(schemas, to, inv, prev)?;
                    }
                }
            }
        }

        self.set_edge(from, def, to)?;
        if let Some(inv) = inverse {
            self.set_edge(to, inv, from)?;
        }
        Ok(())
    }

    /// Remove an edge and its inverse.
    pub(crate) fn disconnect(
        &mut self,
        schemas: &SchemaRegistry,
        from: EntityId,
        def: &RelationshipDef,
        to: EntityId,
    ) -> Result<()> {
        self.clear_edge(from, def, to)?;
        if let Some(inv) = schemas.inverse_of(def)? {
            self.clear_edge(to, inv, from)?;
        }
        Ok(())
    }

    fn set_edge(&mut self, from: EntityId, def: &RelationshipDef, to: EntityId) -> Result<()> {
        let entity = self.entity_mut(from)?;
        match def.cardinality {
            Cardinality::ToOne => {
                entity.to_one.insert(def.name.clone(), to);
            }
            Cardinality::ToMany => {
                entity.to_many.entry(def.name.clone()).or_default().insert(to);
            }
        }
        Ok(())
    }

    fn clear_edge(&mut self, from: EntityId, def: &RelationshipDef, to: EntityId) -> Result<()> {
        let present = match self.get(from) {
            Some(entity) => match def.cardinality {
                Cardinality::ToOne => entity.related(&def.name) == Some(to),
                Cardinality::ToMany => entity
                    .to_many
                    .get(&def.name)
                    .map_or(false, |set| set.contains(to)),
            },
            None => false,
        };
        if !present {
            return Ok(());
        }

        let entity = self.entity_mut(from)?;
        match def.cardinality {
            Cardinality::ToOne => {
                entity.to_one.remove(&def.name);
            }
            Cardinality::ToMany => {
                if let Some(set) = entity.to_many.get_mut(&def.name) {
                    set.remove(to);
                    if set.is_empty() {
                        entity.to_many.remove(&def.name);
                    }
                }
            }
        }
        Ok(())
    }

    // --- Save support ---

    /// Net mutations since the last save, in id order.
    pub fn pending_mutations(&self) -> Vec<Mutation> {
        self.dirty
            .iter()
            .filter_map(|id| match (self.entities.get(id), self.committed.get(id)) {
                (Some(live), Some(saved)) if live == saved => None,
                (Some(live), _) => Some(Mutation::Upsert(live.clone())),
                (None, Some(_)) => Some(Mutation::Delete(*id)),
                (None, None) => None,
            })
            .collect()
    }

    /// Make the live state the committed state.
    pub fn mark_saved(&mut self) {
        for id in std::mem::take(&mut self.dirty) {
            match self.entities.get(&id) {
                Some(entity) => {
                    self.committed.insert(id, entity.clone());
                }
                None => {
                    self.committed.remove(&id);
                }
            }
        }
    }

    /// Drop pending changes. Returns false if there were none.
    pub fn discard(&mut self) -> bool {
        if self.dirty.is_empty() {
            return false;
        }
        for id in std::mem::take(&mut self.dirty) {
            match self.committed.get(&id) {
                Some(entity) => {
                    self.entities.insert(id, entity.clone());
                }
                None => {
                    self.entities.remove(&id);
                }
            }
        }
        true
    }

    /// Apply journaled mutations as already committed (replay on open).
    pub fn replay(&mut self, next_id: u64, mutations: Vec<Mutation>) {
        for mutation in mutations {
            match mutation {
                Mutation::Upsert(entity) => {
                    self.committed.insert(entity.id, entity.clone());
                    self.entities.insert(entity.id, entity);
                }
                Mutation::Delete(id) => {
                    self.committed.remove(&id);
                    self.entities.remove(&id);
                }
            }
        }
        self.next_id = self.next_id.max(next_id);
    }

    /// Committed entities, for checkpointing.
    pub fn committed_entities(&self) -> Vec<Entity> {
        self.committed.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, FieldDef};

    fn schemas() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("Country")
                    .field(FieldDef::text("shortName").unique())
                    .field(FieldDef::text("fullName"))
                    .to_many("candy", "Candy", Some("origin")),
            )
            .unwrap();
        registry
            .register(
                EntitySchema::new("Candy")
                    .field(FieldDef::text("name"))
                    .to_one("origin", "Country", Some("candy")),
            )
            .unwrap();
        registry
    }

    fn country(ctx: &mut EntityContext, schemas: &SchemaRegistry, short: &str) -> EntityId {
        ctx.insert(schemas, EntityInput::new("Country").with("shortName", short))
            .unwrap()
    }

    fn candy(ctx: &mut EntityContext, schemas: &SchemaRegistry, name: &str) -> EntityId {
        ctx.insert(schemas, EntityInput::new("Candy").with("name", name))
            .unwrap()
    }

    #[test]
    fn test_ids_are_fresh() {
        let schemas = schemas();
        let mut ctx = EntityContext::new(BTreeMap::new(), 1);
        let a = candy(&mut ctx, &schemas, "Mars");
        let b = candy(&mut ctx, &schemas, "Mars");
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_link_maintains_inverse() {
        let schemas = schemas();
        let mut ctx = EntityContext::new(BTreeMap::new(), 1);
        let uk = country(&mut ctx, &schemas, "UK");
        let mars = candy(&mut ctx, &schemas, "Mars");

        ctx.link(&schemas, mars, "origin", uk).unwrap();

        assert_eq!(ctx.get(mars).unwrap().related("origin"), Some(uk));
        assert_eq!(ctx.get(uk).unwrap().children("candy").collect::<Vec<_>>(), vec![mars]);
    }

    #[test]
    fn test_relink_to_one_moves_child() {
        let schemas = schemas();
        let mut ctx = EntityContext::new(BTreeMap::new(), 1);
        let uk = country(&mut ctx, &schemas, "UK");
        let ch = country(&mut ctx, &schemas, "CH");
        let bar = candy(&mut ctx, &schemas, "Toblerone");

        ctx.link(&schemas, uk, "candy", bar).unwrap();
        ctx.link(&schemas, bar, "origin", ch).unwrap();

        assert_eq!(ctx.get(uk).unwrap().children("candy").count(), 0);
        assert_eq!(ctx.get(ch).unwrap().children("candy").collect::<Vec<_>>(), vec![bar]);
        assert_eq!(ctx.get(bar).unwrap().related("origin"), Some(ch));
    }

    #[test]
    fn test_link_rejects_wrong_target_type() {
        let schemas = schemas();
        let mut ctx = EntityContext::new(BTreeMap::new(), 1);
        let a = candy(&mut ctx, &schemas, "Mars");
        let b = candy(&mut ctx, &schemas, "Twix");

        let result = ctx.link(&schemas, a, "origin", b);
        assert!(matches!(result, Err(StoreError::SchemaViolation(_))));
    }

    #[test]
    fn test_delete_detaches() {
        let schemas = schemas();
        let mut ctx = EntityContext::new(BTreeMap::new(), 1);
        let uk = country(&mut ctx, &schemas, "UK");
        let mars = candy(&mut ctx, &schemas, "Mars");
        ctx.link(&schemas, mars, "origin", uk).unwrap();

        ctx.delete(&schemas, uk).unwrap();

        assert!(ctx.get(uk).is_none());
        assert_eq!(ctx.get(mars).unwrap().related("origin"), None);
    }

    #[test]
    fn test_rollback_restores_touched_entities() {
        let schemas = schemas();
        let mut ctx = EntityContext::new(BTreeMap::new(), 1);
        let uk = country(&mut ctx, &schemas, "UK");
        ctx.mark_saved();

        ctx.begin();
        let mars = candy(&mut ctx, &schemas, "Mars");
        ctx.link(&schemas, mars, "origin", uk).unwrap();
        ctx.rollback();

        assert!(ctx.get(mars).is_none());
        assert_eq!(ctx.get(uk).unwrap().children("candy").count(), 0);
        assert!(!ctx.has_changes());
    }

    #[test]
    fn test_pending_mutations_are_net() {
        let schemas = schemas();
        let mut ctx = EntityContext::new(BTreeMap::new(), 1);
        let kept = candy(&mut ctx, &schemas, "Mars");
        let dropped = candy(&mut ctx, &schemas, "KitKat");
        ctx.delete(&schemas, dropped).unwrap();

        let mutations = ctx.pending_mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].entity_id(), kept);

        ctx.mark_saved();
        assert!(ctx.pending_mutations().is_empty());

        // Setting a field to its current value is not a change
        ctx.set_field(&schemas, kept, "name", Some(FieldValue::from("Mars")))
            .unwrap();
        assert!(!ctx.has_changes());
    }

    #[test]
    fn test_discard() {
        let schemas = schemas();
        let mut ctx = EntityContext::new(BTreeMap::new(), 1);
        let mars = candy(&mut ctx, &schemas, "Mars");
        ctx.mark_saved();

        ctx.set_field(&schemas, mars, "name", Some(FieldValue::from("Bounty")))
            .unwrap();
        candy(&mut ctx, &schemas, "Twix");
        assert!(ctx.discard());

        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get(mars).unwrap().text("name"), Some("Mars"));
        assert!(!ctx.discard());
    }
}
