//! # Live Graph
//!
//! The in-process entity graph sessions watch.
//!
//! `Graph` is an arena of entities and collections keyed by stable ids. It
//! owns the process-local entity index, the listener table, the registry of
//! which session owns which object, and the outbox of routed notifications.
//! All data structures use `BTreeMap` for deterministic ordering.
//!
//! Mutations keep relations consistent in both directions:
//! - writing a singular foreign key re-resolves the slot and emits
//!   `RelationUpdate`
//! - writing a plural foreign key moves the member between owner collections
//!   (`Removed` / `Added`)

use crate::events::{GraphEvent, IndexEvent, ListenerKind, ListenerTable, Notification, Subscription};
use crate::schema::{ModelDef, RelationBehavior, RelationDef, RelationKind};
use crate::{
    CollectionId, EntityId, EntityStatus, FieldValue, Fields, ObjectKey, SessionId, WardenError,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the index notification channel.
const INDEX_EVENT_CAPACITY: usize = 256;

// =============================================================================
// ENTITIES & COLLECTIONS
// =============================================================================

/// Where a relation currently points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSlot {
    Single(Option<EntityId>),
    Many(CollectionId),
}

/// One relation instance on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationState {
    pub def: RelationDef,
    pub behavior: RelationBehavior,
    pub slot: RelationSlot,
}

/// A live entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    id: EntityId,
    model: String,
    key_field: String,
    status: EntityStatus,
    fields: Fields,
    saved: Option<Fields>,
    relations: BTreeMap<String, RelationState>,
}

impl Entity {
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.id
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn status(&self) -> EntityStatus {
        self.status
    }

    #[must_use]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// The domain key.
    #[must_use]
    pub fn key(&self) -> FieldValue {
        self.fields.get(&self.key_field).cloned().unwrap_or_default()
    }

    /// Last committed fields, `None` if never persisted.
    #[must_use]
    pub fn saved(&self) -> Option<&Fields> {
        self.saved.as_ref()
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.saved.is_some()
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.status == EntityStatus::Deleted
    }

    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&RelationState> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = (&String, &RelationState)> {
        self.relations.iter()
    }
}

/// An ordered set of entities, either owned through a plural relation or
/// standalone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    id: CollectionId,
    model: String,
    owner: Option<(EntityId, String)>,
    members: Vec<EntityId>,
}

impl Collection {
    #[must_use]
    pub fn id(&self) -> CollectionId {
        self.id
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Owning entity and relation name.
    #[must_use]
    pub fn owner(&self) -> Option<(EntityId, &str)> {
        self.owner.as_ref().map(|(id, rel)| (*id, rel.as_str()))
    }

    #[must_use]
    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    #[must_use]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.members.contains(&entity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A watchable object, resolved once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Entity(EntityId),
    Collection(CollectionId),
}

impl From<Resolved> for ObjectKey {
    fn from(resolved: Resolved) -> Self {
        match resolved {
            Resolved::Entity(id) => Self::Entity(id),
            Resolved::Collection(id) => Self::Collection(id),
        }
    }
}

/// What a named property of an entity holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Entity(Option<EntityId>),
    Collection(CollectionId),
    Scalar(FieldValue),
    Missing,
}

// =============================================================================
// LOCAL INDEX
// =============================================================================

/// Process-local authoritative index: model -> key -> entity.
///
/// Each entry also remembers the key it was filed under, so an entity whose
/// key field changed can still be found and removed.
#[derive(Debug, Clone, Default)]
pub struct LocalIndex {
    by_model: BTreeMap<String, BTreeMap<FieldValue, EntityId>>,
    filed: BTreeMap<EntityId, (String, FieldValue)>,
}

impl LocalIndex {
    #[must_use]
    pub fn get(&self, model: &str, key: &FieldValue) -> Option<EntityId> {
        self.by_model.get(model)?.get(key).copied()
    }

    #[must_use]
    pub fn has(&self, model: &str, key: &FieldValue) -> bool {
        self.get(model, key).is_some()
    }

    #[must_use]
    pub fn len(&self, model: &str) -> usize {
        self.by_model.get(model).map_or(0, BTreeMap::len)
    }

    /// Key `id` is filed under, if indexed.
    #[must_use]
    pub fn key_of(&self, id: EntityId) -> Option<&FieldValue> {
        self.filed.get(&id).map(|(_, key)| key)
    }

    fn put(&mut self, model: &str, key: FieldValue, id: EntityId) {
        self.remove(id);
        let displaced = self
            .by_model
            .entry(model.to_string())
            .or_default()
            .insert(key.clone(), id);
        if let Some(other) = displaced {
            self.filed.remove(&other);
        }
        self.filed.insert(id, (model.to_string(), key));
    }

    fn remove(&mut self, id: EntityId) -> bool {
        let Some((model, key)) = self.filed.remove(&id) else {
            return false;
        };
        if let Some(keys) = self.by_model.get_mut(&model)
            && keys.get(&key) == Some(&id)
        {
            keys.remove(&key);
        }
        true
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Entity-level validation capability, registered per model.
pub trait EntityValidator: Send + Sync {
    /// Return a message describing the first problem found.
    fn validate(&self, entity: &Entity) -> Result<(), String>;
}

/// Fails when any listed field is missing or null.
#[derive(Debug, Clone)]
pub struct RequiredFields(pub Vec<String>);

impl EntityValidator for RequiredFields {
    fn validate(&self, entity: &Entity) -> Result<(), String> {
        match self
            .0
            .iter()
            .find(|name| entity.get(name).is_none_or(FieldValue::is_null))
        {
            Some(name) => Err(format!("{name} is required")),
            None => Ok(()),
        }
    }
}

// =============================================================================
// GRAPH
// =============================================================================

/// The live entity graph.
pub struct Graph {
    models: BTreeMap<String, ModelDef>,
    entities: BTreeMap<EntityId, Entity>,
    collections: BTreeMap<CollectionId, Collection>,
    index: LocalIndex,
    listeners: ListenerTable,
    /// Object -> owning session. Sole source of truth for ownership.
    attachments: BTreeMap<ObjectKey, SessionId>,
    outbox: BTreeMap<SessionId, VecDeque<Notification>>,
    validators: BTreeMap<String, Box<dyn EntityValidator>>,
    index_events: broadcast::Sender<IndexEvent>,
    next_entity: u64,
    next_collection: u64,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("models", &self.models.len())
            .field("entities", &self.entities.len())
            .field("collections", &self.collections.len())
            .field("attachments", &self.attachments.len())
            .finish_non_exhaustive()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        let (index_events, _) = broadcast::channel(INDEX_EVENT_CAPACITY);
        Self {
            models: BTreeMap::new(),
            entities: BTreeMap::new(),
            collections: BTreeMap::new(),
            index: LocalIndex::default(),
            listeners: ListenerTable::default(),
            attachments: BTreeMap::new(),
            outbox: BTreeMap::new(),
            validators: BTreeMap::new(),
            index_events,
            next_entity: 0,
            next_collection: 0,
        }
    }

    // =========================================================================
    // SCHEMA
    // =========================================================================

    pub fn define_model(&mut self, def: ModelDef) -> Result<(), WardenError> {
        def.validate()?;
        self.models.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn model(&self, name: &str) -> Result<&ModelDef, WardenError> {
        self.models
            .get(name)
            .ok_or_else(|| WardenError::UnknownModel(name.to_string()))
    }

    pub fn set_validator(&mut self, model: &str, validator: Box<dyn EntityValidator>) {
        self.validators.insert(model.to_string(), validator);
    }

    #[must_use]
    pub fn has_validation(&self) -> bool {
        !self.validators.is_empty()
    }

    /// Run the model's validator, if any.
    pub fn validate_entity(&self, id: EntityId) -> Result<(), String> {
        let Some(entity) = self.entities.get(&id) else {
            return Ok(());
        };
        match self.validators.get(&entity.model) {
            Some(validator) => validator.validate(entity),
            None => Ok(()),
        }
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_entity(&self, id: EntityId) -> Result<&Entity, WardenError> {
        self.entities.get(&id).ok_or(WardenError::EntityNotFound(id))
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity, WardenError> {
        self.entities
            .get_mut(&id)
            .ok_or(WardenError::EntityNotFound(id))
    }

    #[must_use]
    pub fn collection(&self, id: CollectionId) -> Option<&Collection> {
        self.collections.get(&id)
    }

    pub fn get_collection(&self, id: CollectionId) -> Result<&Collection, WardenError> {
        self.collections
            .get(&id)
            .ok_or(WardenError::CollectionNotFound(id))
    }

    /// All entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Live (not deleted) entity of `model` whose key is `key`.
    #[must_use]
    pub fn find_by_key(&self, model: &str, key: &FieldValue) -> Option<EntityId> {
        if key.is_null() {
            return None;
        }
        if let Some(id) = self.index.get(model, key) {
            return Some(id);
        }
        self.entities
            .values()
            .find(|e| e.model == model && !e.is_deleted() && &e.key() == key)
            .map(|e| e.id)
    }

    /// Resolve a key into a watchable object.
    pub fn resolve(&self, key: ObjectKey) -> Result<Resolved, WardenError> {
        match key {
            ObjectKey::Entity(id) => match self.entities.get(&id) {
                Some(entity) if !entity.is_deleted() => Ok(Resolved::Entity(id)),
                Some(_) => Err(WardenError::Structural(format!("{key} is deleted"))),
                None => Err(WardenError::Structural(format!("{key} does not exist"))),
            },
            ObjectKey::Collection(id) => {
                if self.collections.contains_key(&id) {
                    Ok(Resolved::Collection(id))
                } else {
                    Err(WardenError::Structural(format!("{key} does not exist")))
                }
            }
        }
    }

    /// What the named property of an entity holds.
    pub fn property(&self, id: EntityId, name: &str) -> Result<Slot, WardenError> {
        let entity = self.get_entity(id)?;
        if let Some(state) = entity.relations.get(name) {
            return Ok(match state.slot {
                RelationSlot::Single(target) => Slot::Entity(target),
                RelationSlot::Many(coll) => Slot::Collection(coll),
            });
        }
        Ok(entity
            .fields
            .get(name)
            .cloned()
            .map_or(Slot::Missing, Slot::Scalar))
    }

    /// Collection behind a plural relation.
    pub fn plural(&self, owner: EntityId, relation: &str) -> Result<CollectionId, WardenError> {
        let entity = self.get_entity(owner)?;
        match entity.relations.get(relation).map(|s| &s.slot) {
            Some(RelationSlot::Many(coll)) => Ok(*coll),
            _ => Err(WardenError::UnknownRelation {
                model: entity.model.clone(),
                relation: relation.to_string(),
            }),
        }
    }

    // =========================================================================
    // CREATION
    // =========================================================================

    /// Create a never-persisted entity (status `New`, not indexed).
    pub fn create(&mut self, model: &str, fields: Fields) -> Result<EntityId, WardenError> {
        self.insert_entity(model, fields, EntityStatus::New)
    }

    /// Add an entity as if fetched from the backing store (status `Synced`,
    /// indexed).
    pub fn load(&mut self, model: &str, fields: Fields) -> Result<EntityId, WardenError> {
        let id = self.insert_entity(model, fields, EntityStatus::Synced)?;
        self.index_put(id)?;
        Ok(id)
    }

    fn insert_entity(
        &mut self,
        model: &str,
        mut fields: Fields,
        status: EntityStatus,
    ) -> Result<EntityId, WardenError> {
        let def = self.model(model)?.clone();
        let key = match fields.get(&def.key_field) {
            Some(value) if !value.is_null() => value.clone(),
            _ => {
                let key = FieldValue::Text(Uuid::new_v4().to_string());
                fields.insert(def.key_field.clone(), key.clone());
                key
            }
        };

        let id = EntityId(self.next_entity);
        self.next_entity = self.next_entity.saturating_add(1);

        let mut relations = BTreeMap::new();
        for (name, rdef) in &def.relations {
            let slot = if rdef.kind.is_singular() {
                let target = fields
                    .get(&rdef.foreign)
                    .and_then(|value| self.find_by_key(&rdef.model, value));
                RelationSlot::Single(target)
            } else {
                let members = self
                    .entities
                    .values()
                    .filter(|e| {
                        e.model == rdef.model
                            && !e.is_deleted()
                            && e.fields.get(&rdef.foreign) == Some(&key)
                    })
                    .map(|e| e.id)
                    .collect();
                RelationSlot::Many(self.alloc_collection(&rdef.model, Some((id, name.clone())), members))
            };
            relations.insert(
                name.clone(),
                RelationState {
                    def: rdef.clone(),
                    behavior: rdef.behavior(),
                    slot,
                },
            );
        }

        let saved = (status == EntityStatus::Synced).then(|| fields.clone());
        let field_names: Vec<String> = fields.keys().cloned().collect();
        self.entities.insert(
            id,
            Entity {
                id,
                model: def.name.clone(),
                key_field: def.key_field.clone(),
                status,
                fields,
                saved,
                relations,
            },
        );

        for name in &field_names {
            self.rehome(id, name)?;
        }
        self.resolve_dangling(id, &def.name, &key);
        Ok(id)
    }

    /// Point singular relations that name `key` but were unresolved at `id`.
    fn resolve_dangling(&mut self, id: EntityId, model: &str, key: &FieldValue) {
        let mut updates = Vec::new();
        for entity in self.entities.values_mut() {
            if entity.id == id || entity.is_deleted() {
                continue;
            }
            for (name, state) in &mut entity.relations {
                if state.def.model == model
                    && state.slot == RelationSlot::Single(None)
                    && entity.fields.get(&state.def.foreign) == Some(key)
                {
                    state.slot = RelationSlot::Single(Some(id));
                    updates.push(GraphEvent::RelationUpdate {
                        entity: entity.id,
                        relation: name.clone(),
                        previous: None,
                        current: Some(id),
                    });
                }
            }
        }
        for event in updates {
            self.emit(event);
        }
    }

    /// Create a standalone collection.
    pub fn new_collection(&mut self, model: &str, members: Vec<EntityId>) -> CollectionId {
        self.alloc_collection(model, None, members)
    }

    fn alloc_collection(
        &mut self,
        model: &str,
        owner: Option<(EntityId, String)>,
        members: Vec<EntityId>,
    ) -> CollectionId {
        let id = CollectionId(self.next_collection);
        self.next_collection = self.next_collection.saturating_add(1);
        self.collections.insert(
            id,
            Collection {
                id,
                model: model.to_string(),
                owner,
                members,
            },
        );
        id
    }

    // =========================================================================
    // FIELDS
    // =========================================================================

    /// Write one field, keeping relations consistent.
    pub fn set_field(
        &mut self,
        id: EntityId,
        name: &str,
        value: FieldValue,
    ) -> Result<(), WardenError> {
        let entity = self.entity_mut(id)?;
        let previous = entity.fields.insert(name.to_string(), value.clone());
        if previous.as_ref() == Some(&value) {
            return Ok(());
        }
        self.after_field_change(id, name)
    }

    /// Replace every field with `fields`, keeping relations consistent.
    pub fn replace_fields(&mut self, id: EntityId, fields: &Fields) -> Result<(), WardenError> {
        let entity = self.entity_mut(id)?;
        let names: BTreeSet<String> = entity.fields.keys().chain(fields.keys()).cloned().collect();
        let mut changed = Vec::new();
        for name in names {
            let before = entity.fields.get(&name).cloned();
            let after = fields.get(&name).cloned();
            if before == after {
                continue;
            }
            match after {
                Some(value) => entity.fields.insert(name.clone(), value),
                None => entity.fields.remove(&name),
            };
            changed.push(name);
        }
        for name in changed {
            self.after_field_change(id, &name)?;
        }
        Ok(())
    }

    fn set_field_raw(&mut self, id: EntityId, name: &str, value: FieldValue) -> Result<(), WardenError> {
        self.entity_mut(id)?.fields.insert(name.to_string(), value);
        Ok(())
    }

    fn after_field_change(&mut self, id: EntityId, name: &str) -> Result<(), WardenError> {
        self.refile(id, name)?;
        self.refresh_singular(id, name)?;
        self.rehome(id, name)
    }

    /// Re-resolve singular relations whose foreign field is `name`.
    fn refresh_singular(&mut self, id: EntityId, name: &str) -> Result<(), WardenError> {
        let entity = self.get_entity(id)?;
        let value = entity.fields.get(name).cloned().unwrap_or_default();
        let targets: Vec<(String, Option<EntityId>)> = entity
            .relations
            .iter()
            .filter(|(_, s)| s.def.kind.is_singular() && s.def.foreign == name)
            .map(|(rel, s)| (rel.clone(), self.find_by_key(&s.def.model, &value)))
            .collect();

        for (relation, current) in targets {
            let entity = self.entity_mut(id)?;
            let Some(state) = entity.relations.get_mut(&relation) else {
                continue;
            };
            let previous = match state.slot {
                RelationSlot::Single(previous) => previous,
                RelationSlot::Many(_) => continue,
            };
            if previous == current {
                continue;
            }
            state.slot = RelationSlot::Single(current);
            self.emit(GraphEvent::RelationUpdate {
                entity: id,
                relation,
                previous,
                current,
            });
        }
        Ok(())
    }

    /// Owned collections whose relation uses `field` on `model` members.
    fn is_member_collection(&self, coll: &Collection, model: &str, field: &str) -> bool {
        self.owner_def(coll).is_some_and(|def| {
            def.kind == RelationKind::HasMany && def.model == model && def.foreign == field
        })
    }

    fn owner_def(&self, coll: &Collection) -> Option<&RelationDef> {
        let (owner, relation) = coll.owner.as_ref()?;
        self.entities
            .get(owner)?
            .relations
            .get(relation)
            .map(|s| &s.def)
    }

    /// Move `child` into the owner collections its `field` names now.
    fn rehome(&mut self, child: EntityId, field: &str) -> Result<(), WardenError> {
        let entity = self.get_entity(child)?;
        let model = entity.model.clone();
        let value = entity.fields.get(field).cloned().unwrap_or_default();

        let current: Vec<CollectionId> = self
            .collections
            .values()
            .filter(|c| c.contains(child) && self.is_member_collection(c, &model, field))
            .map(|c| c.id)
            .collect();

        let desired: Vec<CollectionId> = if value.is_null() {
            Vec::new()
        } else {
            self.entities
                .values()
                .filter(|owner| !owner.is_deleted() && owner.key() == value)
                .flat_map(|owner| owner.relations.values())
                .filter(|s| {
                    s.def.kind == RelationKind::HasMany && s.def.model == model && s.def.foreign == field
                })
                .filter_map(|s| match s.slot {
                    RelationSlot::Many(coll) => Some(coll),
                    RelationSlot::Single(_) => None,
                })
                .collect()
        };

        for coll in current.iter().filter(|c| !desired.contains(c)) {
            if let Some(collection) = self.collections.get_mut(coll) {
                collection.members.retain(|m| *m != child);
            }
            self.emit(GraphEvent::Removed {
                collection: *coll,
                entity: child,
            });
        }
        for coll in desired.iter().filter(|c| !current.contains(c)) {
            if let Some(collection) = self.collections.get_mut(coll) {
                collection.members.push(child);
            }
            self.emit(GraphEvent::Added {
                collection: *coll,
                entity: child,
            });
        }
        Ok(())
    }

    // =========================================================================
    // RELATIONS
    // =========================================================================

    fn relation_state(&self, id: EntityId, relation: &str) -> Result<&RelationState, WardenError> {
        let entity = self.get_entity(id)?;
        entity
            .relations
            .get(relation)
            .ok_or_else(|| WardenError::UnknownRelation {
                model: entity.model.clone(),
                relation: relation.to_string(),
            })
    }

    /// Point a singular relation at `target` (or nothing).
    pub fn set_related(
        &mut self,
        id: EntityId,
        relation: &str,
        target: Option<EntityId>,
    ) -> Result<(), WardenError> {
        let state = self.relation_state(id, relation)?;
        if !state.def.kind.is_singular() {
            return Err(WardenError::Structural(format!(
                "{relation} is not a singular relation"
            )));
        }
        let foreign = state.def.foreign.clone();
        let key = match target {
            Some(target) => self.get_entity(target)?.key(),
            None => FieldValue::Null,
        };
        self.set_field(id, &foreign, key)
    }

    /// Add `child` to a plural relation.
    pub fn relate(&mut self, owner: EntityId, relation: &str, child: EntityId) -> Result<(), WardenError> {
        let coll = self.plural(owner, relation)?;
        let foreign = self.relation_state(owner, relation)?.def.foreign.clone();
        let key = self.get_entity(owner)?.key();
        self.get_entity(child)?;

        self.set_field(child, &foreign, key)?;
        let collection = self.get_collection(coll)?;
        if !collection.contains(child) {
            if let Some(collection) = self.collections.get_mut(&coll) {
                collection.members.push(child);
            }
            self.emit(GraphEvent::Added {
                collection: coll,
                entity: child,
            });
        }
        Ok(())
    }

    /// Add several children to a plural relation with one batch event.
    pub fn relate_many(
        &mut self,
        owner: EntityId,
        relation: &str,
        children: &[EntityId],
    ) -> Result<(), WardenError> {
        let coll = self.plural(owner, relation)?;
        let foreign = self.relation_state(owner, relation)?.def.foreign.clone();
        let key = self.get_entity(owner)?.key();

        let mut added = Vec::new();
        for &child in children {
            let model = self.get_entity(child)?.model.clone();
            self.set_field_raw(child, &foreign, key.clone())?;
            let elsewhere: Vec<CollectionId> = self
                .collections
                .values()
                .filter(|c| c.id != coll && c.contains(child) && self.is_member_collection(c, &model, &foreign))
                .map(|c| c.id)
                .collect();
            for other in elsewhere {
                if let Some(collection) = self.collections.get_mut(&other) {
                    collection.members.retain(|m| *m != child);
                }
                self.emit(GraphEvent::Removed {
                    collection: other,
                    entity: child,
                });
            }
            self.refresh_singular(child, &foreign)?;
            if let Some(collection) = self.collections.get_mut(&coll)
                && !collection.contains(child)
            {
                collection.members.push(child);
                added.push(child);
            }
        }
        if !added.is_empty() {
            self.emit(GraphEvent::AddedMany {
                collection: coll,
                entities: added,
            });
        }
        Ok(())
    }

    /// Remove `child` from a plural relation. Returns whether it was a member.
    ///
    /// The member's foreign key is cleared only when the relation clears keys
    /// and does not cascade the removal.
    pub fn unrelate(&mut self, owner: EntityId, relation: &str, child: EntityId) -> Result<bool, WardenError> {
        let coll = self.plural(owner, relation)?;
        let removed = self.take_members(coll, &[child]);
        if removed.is_empty() {
            return Ok(false);
        }
        self.emit(GraphEvent::Removed {
            collection: coll,
            entity: child,
        });
        self.clear_member_keys(owner, relation, &removed)?;
        Ok(true)
    }

    /// Remove several children with one batch event. Returns those removed.
    pub fn unrelate_many(
        &mut self,
        owner: EntityId,
        relation: &str,
        children: &[EntityId],
    ) -> Result<Vec<EntityId>, WardenError> {
        let coll = self.plural(owner, relation)?;
        let removed = self.take_members(coll, children);
        if !removed.is_empty() {
            self.emit(GraphEvent::RemovedMany {
                collection: coll,
                entities: removed.clone(),
            });
            self.clear_member_keys(owner, relation, &removed)?;
        }
        Ok(removed)
    }

    fn take_members(&mut self, coll: CollectionId, children: &[EntityId]) -> Vec<EntityId> {
        let Some(collection) = self.collections.get_mut(&coll) else {
            return Vec::new();
        };
        let removed: Vec<EntityId> = children
            .iter()
            .copied()
            .filter(|c| collection.contains(*c))
            .collect();
        collection.members.retain(|m| !removed.contains(m));
        removed
    }

    fn clear_member_keys(
        &mut self,
        owner: EntityId,
        relation: &str,
        members: &[EntityId],
    ) -> Result<(), WardenError> {
        let state = self.relation_state(owner, relation)?;
        if !state.behavior.clear_key || !state.behavior.cascade_remove.is_none() {
            return Ok(());
        }
        let foreign = state.def.foreign.clone();
        for &member in members {
            if self.entities.contains_key(&member) {
                self.set_field(member, &foreign, FieldValue::Null)?;
            }
        }
        Ok(())
    }

    pub fn relation_behavior(&self, id: EntityId, relation: &str) -> Result<RelationBehavior, WardenError> {
        Ok(self.relation_state(id, relation)?.behavior)
    }

    pub fn set_relation_behavior(
        &mut self,
        id: EntityId,
        relation: &str,
        behavior: RelationBehavior,
    ) -> Result<(), WardenError> {
        self.relation_state(id, relation)?;
        if let Some(state) = self.entity_mut(id)?.relations.get_mut(relation) {
            state.behavior = behavior;
        }
        Ok(())
    }

    // =========================================================================
    // COLLECTIONS
    // =========================================================================

    /// Add one entity. Owned collections go through the relation.
    pub fn collection_add(&mut self, coll: CollectionId, entity: EntityId) -> Result<(), WardenError> {
        if let Some((owner, relation)) = self.owner_of(coll)? {
            return self.relate(owner, &relation, entity);
        }
        self.get_entity(entity)?;
        if let Some(collection) = self.collections.get_mut(&coll)
            && !collection.contains(entity)
        {
            collection.members.push(entity);
            self.emit(GraphEvent::Added {
                collection: coll,
                entity,
            });
        }
        Ok(())
    }

    pub fn collection_add_many(&mut self, coll: CollectionId, entities: &[EntityId]) -> Result<(), WardenError> {
        if let Some((owner, relation)) = self.owner_of(coll)? {
            return self.relate_many(owner, &relation, entities);
        }
        let mut added = Vec::new();
        for &entity in entities {
            self.get_entity(entity)?;
            if let Some(collection) = self.collections.get_mut(&coll)
                && !collection.contains(entity)
            {
                collection.members.push(entity);
                added.push(entity);
            }
        }
        if !added.is_empty() {
            self.emit(GraphEvent::AddedMany {
                collection: coll,
                entities: added,
            });
        }
        Ok(())
    }

    pub fn collection_remove(&mut self, coll: CollectionId, entity: EntityId) -> Result<bool, WardenError> {
        if let Some((owner, relation)) = self.owner_of(coll)? {
            return self.unrelate(owner, &relation, entity);
        }
        let removed = self.take_members(coll, &[entity]);
        if removed.is_empty() {
            return Ok(false);
        }
        self.emit(GraphEvent::Removed {
            collection: coll,
            entity,
        });
        Ok(true)
    }

    pub fn collection_remove_many(
        &mut self,
        coll: CollectionId,
        entities: &[EntityId],
    ) -> Result<Vec<EntityId>, WardenError> {
        if let Some((owner, relation)) = self.owner_of(coll)? {
            return self.unrelate_many(owner, &relation, entities);
        }
        let removed = self.take_members(coll, entities);
        if !removed.is_empty() {
            self.emit(GraphEvent::RemovedMany {
                collection: coll,
                entities: removed.clone(),
            });
        }
        Ok(removed)
    }

    /// Replace the members wholesale and emit `Reset`.
    pub fn reset_collection(&mut self, coll: CollectionId, members: Vec<EntityId>) -> Result<(), WardenError> {
        self.replace_members(coll, members)?;
        self.emit(GraphEvent::Reset { collection: coll });
        Ok(())
    }

    /// Empty the collection and emit `Cleared`.
    pub fn clear_collection(&mut self, coll: CollectionId) -> Result<(), WardenError> {
        self.replace_members(coll, Vec::new())?;
        self.emit(GraphEvent::Cleared { collection: coll });
        Ok(())
    }

    /// Set members exactly, emitting `Reset` only when they changed.
    pub fn restore_members(&mut self, coll: CollectionId, members: Vec<EntityId>) -> Result<(), WardenError> {
        if self.get_collection(coll)?.members == members {
            return Ok(());
        }
        self.reset_collection(coll, members)
    }

    fn replace_members(&mut self, coll: CollectionId, members: Vec<EntityId>) -> Result<(), WardenError> {
        let previous = self.get_collection(coll)?.members.clone();
        for member in &members {
            self.get_entity(*member)?;
        }
        if let Some(collection) = self.collections.get_mut(&coll) {
            collection.members = members.clone();
        }
        let Some((owner, relation)) = self.owner_of(coll)? else {
            return Ok(());
        };

        let state = self.relation_state(owner, &relation)?;
        let foreign = state.def.foreign.clone();
        let clear = state.behavior.clear_key && state.behavior.cascade_remove.is_none();
        let key = self.get_entity(owner)?.key();
        for member in members.iter().filter(|m| !previous.contains(m)) {
            self.set_field_raw(*member, &foreign, key.clone())?;
            self.refresh_singular(*member, &foreign)?;
            self.rehome(*member, &foreign)?;
        }
        if clear {
            for member in previous.iter().filter(|m| !members.contains(m)) {
                if self.entities.contains_key(member) {
                    self.set_field_raw(*member, &foreign, FieldValue::Null)?;
                    self.refresh_singular(*member, &foreign)?;
                }
            }
        }
        Ok(())
    }

    fn owner_of(&self, coll: CollectionId) -> Result<Option<(EntityId, String)>, WardenError> {
        Ok(self.get_collection(coll)?.owner.clone())
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    pub fn set_status(&mut self, id: EntityId, status: EntityStatus) -> Result<(), WardenError> {
        self.entity_mut(id)?.status = status;
        Ok(())
    }

    /// Record a successful create/update: fields are now committed.
    pub fn mark_persisted(&mut self, id: EntityId, persisted: Fields) -> Result<(), WardenError> {
        let entity = self.entity_mut(id)?;
        entity.status = EntityStatus::Synced;
        entity.saved = Some(persisted);
        Ok(())
    }

    /// Record a successful delete.
    ///
    /// The entity leaves every collection it belongs to; its fields are kept.
    pub fn mark_deleted(&mut self, id: EntityId) -> Result<(), WardenError> {
        self.index_remove(id)?;
        self.entity_mut(id)?.status = EntityStatus::Deleted;
        let holding: Vec<CollectionId> = self
            .collections
            .values()
            .filter(|c| c.contains(id))
            .map(|c| c.id)
            .collect();
        for coll in holding {
            self.take_members(coll, &[id]);
            self.emit(GraphEvent::Removed {
                collection: coll,
                entity: id,
            });
        }
        Ok(())
    }

    // =========================================================================
    // LOCAL INDEX
    // =========================================================================

    #[must_use]
    pub fn index(&self) -> &LocalIndex {
        &self.index
    }

    pub fn subscribe_index(&self) -> broadcast::Receiver<IndexEvent> {
        self.index_events.subscribe()
    }

    pub fn index_has(&self, id: EntityId) -> Result<bool, WardenError> {
        self.get_entity(id)?;
        Ok(self.index.key_of(id).is_some())
    }

    /// Insert into the index. Returns false if it was already there.
    pub fn index_put(&mut self, id: EntityId) -> Result<bool, WardenError> {
        if self.index_has(id)? {
            return Ok(false);
        }
        let entity = self.get_entity(id)?;
        let model = entity.model.clone();
        let key = entity.key();
        self.index.put(&model, key, id);
        self.publish(IndexEvent::Added { model, entity: id });
        Ok(true)
    }

    /// Remove from the index. Returns false if it was not there.
    pub fn index_remove(&mut self, id: EntityId) -> Result<bool, WardenError> {
        if !self.index_has(id)? {
            return Ok(false);
        }
        let model = self.get_entity(id)?.model.clone();
        self.index.remove(id);
        self.publish(IndexEvent::Removed { model, entity: id });
        Ok(true)
    }

    /// Move an indexed entity to its new key after its key field changed.
    fn refile(&mut self, id: EntityId, name: &str) -> Result<(), WardenError> {
        let entity = self.get_entity(id)?;
        if entity.key_field != name {
            return Ok(());
        }
        let key = entity.key();
        if self.index.key_of(id).is_none_or(|filed| filed == &key) {
            return Ok(());
        }
        let model = entity.model.clone();
        self.index.put(&model, key, id);
        self.publish(IndexEvent::Updated { model, entity: id });
        Ok(())
    }

    /// Announce that an indexed entity changed.
    pub fn index_touch(&mut self, id: EntityId) -> Result<(), WardenError> {
        let model = self.get_entity(id)?.model.clone();
        self.publish(IndexEvent::Updated { model, entity: id });
        Ok(())
    }

    fn publish(&self, event: IndexEvent) {
        // No receivers is fine.
        let _ = self.index_events.send(event);
    }

    // =========================================================================
    // OWNERSHIP
    // =========================================================================

    #[must_use]
    pub fn attachment(&self, object: ObjectKey) -> Option<SessionId> {
        self.attachments.get(&object).copied()
    }

    /// Record `session` as owner. Fails if another session owns it.
    pub fn attach(&mut self, object: ObjectKey, session: SessionId) -> Result<(), WardenError> {
        match self.attachments.get(&object) {
            Some(owner) if *owner != session => Err(WardenError::Conflict(format!(
                "{object} is already watched by session {}",
                owner.0
            ))),
            _ => {
                self.attachments.insert(object, session);
                Ok(())
            }
        }
    }

    /// Drop ownership if `session` holds it.
    pub fn detach(&mut self, object: ObjectKey, session: SessionId) {
        if self.attachments.get(&object) == Some(&session) {
            self.attachments.remove(&object);
        }
    }

    // =========================================================================
    // LISTENERS & NOTIFICATIONS
    // =========================================================================

    pub fn subscribe(&mut self, object: ObjectKey, session: SessionId, kind: ListenerKind) -> Subscription {
        self.listeners.subscribe(object, session, kind)
    }

    pub fn release(&mut self, subscription: Subscription) {
        self.listeners.release(subscription);
    }

    #[must_use]
    pub fn listener_count(&self, object: ObjectKey) -> usize {
        self.listeners.count(object)
    }

    fn emit(&mut self, event: GraphEvent) {
        tracing::trace!(?event, "graph event");
        for notification in self.listeners.route(&event) {
            self.outbox
                .entry(notification.session)
                .or_default()
                .push_back(notification);
        }
    }

    /// Take the next queued notification for `session`.
    pub fn next_notification(&mut self, session: SessionId) -> Option<Notification> {
        let queue = self.outbox.get_mut(&session)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.outbox.remove(&session);
        }
        next
    }

    /// Sessions with queued notifications.
    #[must_use]
    pub fn pending_sessions(&self) -> Vec<SessionId> {
        self.outbox.keys().copied().collect()
    }

    /// Drop everything queued for `session`.
    pub fn discard_notifications(&mut self, session: SessionId) {
        self.outbox.remove(&session);
    }
}

// =============================================================================
// TESTS
// =============================================================================
