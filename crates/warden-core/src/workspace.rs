//! # Workspace
//!
//! Owns the live [`Graph`], every [`Session`] and the persistence handle.
//!
//! Direct graph mutation goes through the workspace so that, after each
//! mutation, routed notifications are pumped into the relation bridge of the
//! session that owns the listener.
//!
//! The entity façade ([`Workspace::save`], [`Workspace::remove`]) persists
//! immediately unless the entity is attached to an active session, in which
//! case the call only marks it dirty (or pending removal) in that session.

use crate::config::WorkspaceConfig;
use crate::flush::{FlushOutcome, FlushPlan, FlushReport};
use crate::graph::{EntityValidator, Graph, RelationSlot};
use crate::persistence::{PersistRequest, Persistence};
use crate::relations::RelationSpec;
use crate::schema::{ModelDef, RelationBehavior, RelationKind};
use crate::session::SessionStatus;
use crate::watch::Membership;
use crate::{
    Cascade, CollectionId, EntityId, FieldValue, Fields, ObjectKey, Session, SessionId, WardenError,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Which cascade flag a closure follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Propagation {
    Save,
    Remove,
}

/// The live graph, its sessions and the backing store.
pub struct Workspace {
    graph: Graph,
    sessions: BTreeMap<SessionId, Session>,
    persistence: Arc<dyn Persistence>,
    config: WorkspaceConfig,
    next_session: u64,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("graph", &self.graph)
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_config(persistence, WorkspaceConfig::default())
    }

    pub fn with_config(persistence: Arc<dyn Persistence>, config: WorkspaceConfig) -> Self {
        Self {
            graph: Graph::new(),
            sessions: BTreeMap::new(),
            persistence,
            config,
            next_session: 0,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    #[must_use]
    pub fn persistence(&self) -> Arc<dyn Persistence> {
        Arc::clone(&self.persistence)
    }

    /// Deliver every queued notification to its session's bridge.
    fn pump(&mut self) {
        loop {
            let pending = self.graph.pending_sessions();
            if pending.is_empty() {
                return;
            }
            for id in pending {
                match self.sessions.get_mut(&id) {
                    Some(session) => session.sync(&mut self.graph),
                    None => self.graph.discard_notifications(id),
                }
            }
        }
    }

    fn pumped<T>(&mut self, result: Result<T, WardenError>) -> Result<T, WardenError> {
        self.pump();
        result
    }

    // =========================================================================
    // SCHEMA
    // =========================================================================

    pub fn define_model(&mut self, def: ModelDef) -> Result<(), WardenError> {
        self.graph.define_model(def)
    }

    pub fn set_validator(&mut self, model: &str, validator: Box<dyn EntityValidator>) {
        self.graph.set_validator(model, validator);
    }

    // =========================================================================
    // DIRECT GRAPH MUTATION
    // =========================================================================

    pub fn create(&mut self, model: &str, fields: Fields) -> Result<EntityId, WardenError> {
        let result = self.graph.create(model, fields);
        self.pumped(result)
    }

    pub fn load(&mut self, model: &str, fields: Fields) -> Result<EntityId, WardenError> {
        let result = self.graph.load(model, fields);
        self.pumped(result)
    }

    pub fn set_field(
        &mut self,
        id: EntityId,
        name: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), WardenError> {
        let result = self.graph.set_field(id, name, value.into());
        self.pumped(result)
    }

    pub fn set_related(
        &mut self,
        id: EntityId,
        relation: &str,
        target: Option<EntityId>,
    ) -> Result<(), WardenError> {
        let result = self.graph.set_related(id, relation, target);
        self.pumped(result)
    }

    pub fn relate(&mut self, owner: EntityId, relation: &str, child: EntityId) -> Result<(), WardenError> {
        let result = self.graph.relate(owner, relation, child);
        self.pumped(result)
    }

    pub fn relate_many(
        &mut self,
        owner: EntityId,
        relation: &str,
        children: &[EntityId],
    ) -> Result<(), WardenError> {
        let result = self.graph.relate_many(owner, relation, children);
        self.pumped(result)
    }

    pub fn set_relation_behavior(
        &mut self,
        id: EntityId,
        relation: &str,
        behavior: RelationBehavior,
    ) -> Result<(), WardenError> {
        self.graph.set_relation_behavior(id, relation, behavior)
    }

    pub fn new_collection(&mut self, model: &str, members: Vec<EntityId>) -> CollectionId {
        self.graph.new_collection(model, members)
    }

    pub fn collection_add(&mut self, coll: CollectionId, entity: EntityId) -> Result<(), WardenError> {
        let result = self.graph.collection_add(coll, entity);
        self.pumped(result)
    }

    pub fn collection_add_many(&mut self, coll: CollectionId, entities: &[EntityId]) -> Result<(), WardenError> {
        let result = self.graph.collection_add_many(coll, entities);
        self.pumped(result)
    }

    pub fn collection_remove(&mut self, coll: CollectionId, entity: EntityId) -> Result<bool, WardenError> {
        let result = self.graph.collection_remove(coll, entity);
        self.pumped(result)
    }

    pub fn collection_remove_many(
        &mut self,
        coll: CollectionId,
        entities: &[EntityId],
    ) -> Result<Vec<EntityId>, WardenError> {
        let result = self.graph.collection_remove_many(coll, entities);
        self.pumped(result)
    }

    pub fn reset_collection(&mut self, coll: CollectionId, members: Vec<EntityId>) -> Result<(), WardenError> {
        let result = self.graph.reset_collection(coll, members);
        self.pumped(result)
    }

    pub fn clear_collection(&mut self, coll: CollectionId) -> Result<(), WardenError> {
        let result = self.graph.clear_collection(coll);
        self.pumped(result)
    }

    // =========================================================================
    // ENTITY FAÇADE
    // =========================================================================

    /// The active session `entity` is attached to, if any.
    fn intercepting(&self, entity: EntityId) -> Option<SessionId> {
        let owner = self.graph.attachment(ObjectKey::Entity(entity))?;
        self.sessions
            .get(&owner)
            .is_some_and(Session::is_active)
            .then_some(owner)
    }

    /// `entity` followed by every entity reachable through owning relations
    /// whose save (or remove) cascade overlaps `cascade`.
    fn cascade_closure(
        &self,
        entity: EntityId,
        cascade: Cascade,
        propagation: Propagation,
    ) -> Result<Vec<EntityId>, WardenError> {
        self.graph.get_entity(entity)?;
        let mut seen = BTreeSet::from([entity]);
        let mut order = vec![entity];
        let mut cursor = 0;
        while let Some(&current) = order.get(cursor) {
            cursor += 1;
            let Some(node) = self.graph.entity(current) else {
                continue;
            };
            for (_, state) in node.relations() {
                if state.def.kind == RelationKind::BelongsTo {
                    continue;
                }
                let flags = match propagation {
                    Propagation::Save => state.def.cascade_save,
                    Propagation::Remove => state.behavior.cascade_remove,
                };
                if flags.0 & cascade.0 == 0 {
                    continue;
                }
                let reached: Vec<EntityId> = match &state.slot {
                    RelationSlot::Single(target) => target.iter().copied().collect(),
                    RelationSlot::Many(coll) => self.graph.get_collection(*coll)?.members().to_vec(),
                };
                for next in reached {
                    if seen.insert(next) {
                        order.push(next);
                    }
                }
            }
        }
        Ok(order)
    }

    /// Save `entity` and its cascade closure.
    ///
    /// `None` uses the configured default cascade.
    pub async fn save(&mut self, entity: EntityId, cascade: impl Into<Option<Cascade>>) -> Result<(), WardenError> {
        let cascade = cascade.into().unwrap_or(self.config.default_cascade);
        for id in self.cascade_closure(entity, cascade, Propagation::Save)? {
            self.save_one(id, cascade).await?;
        }
        Ok(())
    }

    /// Remove `entity` and its cascade closure.
    ///
    /// `None` uses the configured default cascade.
    pub async fn remove(&mut self, entity: EntityId, cascade: impl Into<Option<Cascade>>) -> Result<(), WardenError> {
        let cascade = cascade.into().unwrap_or(self.config.default_cascade);
        for id in self.cascade_closure(entity, cascade, Propagation::Remove)? {
            self.remove_one(id, cascade).await?;
        }
        Ok(())
    }

    async fn save_one(&mut self, id: EntityId, cascade: Cascade) -> Result<(), WardenError> {
        let entity = self.graph.get_entity(id)?;
        if entity.is_deleted() {
            return Ok(());
        }
        if let Some(owner) = self.intercepting(id) {
            let result = match self.sessions.get_mut(&owner) {
                Some(session) => session.save_model(&mut self.graph, id, cascade),
                None => Ok(()),
            };
            return self.pumped(result);
        }

        let request = PersistRequest::for_entity(entity, cascade);
        let created = !entity.is_persisted();
        let persistence = self.persistence();
        let stored = if created {
            persistence.create(&request).await?
        } else {
            persistence.update(&request).await?
        };
        self.graph.mark_persisted(id, stored)?;
        if created {
            self.graph.index_put(id)?;
        }
        tracing::debug!(entity = id.0, model = %request.model, created, "saved directly");
        Ok(())
    }

    async fn remove_one(&mut self, id: EntityId, cascade: Cascade) -> Result<(), WardenError> {
        let entity = self.graph.get_entity(id)?;
        if entity.is_deleted() {
            return Ok(());
        }
        if let Some(owner) = self.intercepting(id) {
            let result = match self.sessions.get_mut(&owner) {
                Some(session) => session.remove_model(&mut self.graph, id, cascade),
                None => Ok(()),
            };
            return self.pumped(result);
        }

        if entity.is_persisted() {
            let request = PersistRequest::for_entity(entity, cascade);
            self.persistence.delete(&request).await?;
        }
        if let Some(owner) = self.graph.attachment(ObjectKey::Entity(id))
            && let Some(session) = self.sessions.get_mut(&owner)
        {
            session.destroy_watch(&mut self.graph, ObjectKey::Entity(id));
        }
        let result = self.graph.mark_deleted(id);
        tracing::debug!(entity = id.0, "removed directly");
        self.pumped(result)
    }

    /// Remove `child` from a plural relation, then apply the relation's
    /// policy to it: removed when it cascades removal, otherwise saved when
    /// its key was cleared and the relation cascades saves.
    pub async fn unrelate(&mut self, owner: EntityId, relation: &str, child: EntityId) -> Result<bool, WardenError> {
        let behavior = self.graph.relation_behavior(owner, relation)?;
        let cascade_save = self
            .graph
            .get_entity(owner)?
            .relation(relation)
            .map_or(Cascade::NONE, |state| state.def.cascade_save);

        let result = self.graph.unrelate(owner, relation, child);
        if !self.pumped(result)? {
            return Ok(false);
        }
        if !behavior.cascade_remove.is_none() {
            self.remove(child, behavior.cascade_remove).await?;
        } else if behavior.clear_key && !cascade_save.is_none() {
            self.save(child, cascade_save).await?;
        }
        Ok(true)
    }

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Open an active session seeded from the workspace config.
    pub fn open_session(&mut self) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let mut session = Session::new(id);
        session.set_validation_required(self.config.validation_required);
        self.sessions.insert(id, session);
        tracing::info!(session = id.0, "session opened");
        id
    }

    pub fn session(&self, id: SessionId) -> Result<&Session, WardenError> {
        self.sessions.get(&id).ok_or(WardenError::SessionNotFound(id))
    }

    /// Borrow the workspace for one session's operations.
    pub fn scope(&mut self, id: SessionId) -> Result<SessionScope<'_>, WardenError> {
        self.session(id)?;
        Ok(SessionScope { workspace: self, id })
    }

    /// Destroy a session and forget it.
    pub fn close_session(&mut self, id: SessionId) -> Result<(), WardenError> {
        let mut session = self.sessions.remove(&id).ok_or(WardenError::SessionNotFound(id))?;
        session.destroy(&mut self.graph);
        self.pump();
        Ok(())
    }

    /// Sessions currently open.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

// =============================================================================
// SESSION SCOPE
// =============================================================================

/// One session's operations, with notifications pumped after each.
#[derive(Debug)]
pub struct SessionScope<'w> {
    workspace: &'w mut Workspace,
    id: SessionId,
}

impl SessionScope<'_> {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn session(&self) -> Result<&Session, WardenError> {
        self.workspace.session(self.id)
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.workspace.graph
    }

    fn parts(&mut self) -> Result<(&mut Session, &mut Graph), WardenError> {
        let workspace = &mut *self.workspace;
        let session = workspace
            .sessions
            .get_mut(&self.id)
            .ok_or(WardenError::SessionNotFound(self.id))?;
        Ok((session, &mut workspace.graph))
    }

    /// Run one session operation and pump afterwards.
    fn run<T, F>(&mut self, op: F) -> Result<T, WardenError>
    where
        F: FnOnce(&mut Session, &mut Graph) -> Result<T, WardenError>,
    {
        let result = {
            let (session, graph) = self.parts()?;
            op(session, graph)
        };
        self.workspace.pumped(result)
    }

    pub fn watch(&mut self, object: impl Into<ObjectKey>, spec: &RelationSpec) -> Result<(), WardenError> {
        let key = object.into();
        self.run(|session, graph| session.watch(graph, key, spec))
    }

    pub fn watch_many<I, K>(&mut self, objects: I, spec: &RelationSpec) -> Result<(), WardenError>
    where
        I: IntoIterator<Item = K>,
        K: Into<ObjectKey>,
    {
        let keys: Vec<ObjectKey> = objects.into_iter().map(Into::into).collect();
        self.run(|session, graph| session.watch_many(graph, keys, spec))
    }

    pub fn unwatch(&mut self, object: impl Into<ObjectKey>) -> Result<(), WardenError> {
        let key = object.into();
        self.run(|session, graph| session.unwatch(graph, key))
    }

    pub fn save_model(&mut self, entity: EntityId, cascade: Cascade) -> Result<(), WardenError> {
        self.run(|session, graph| session.save_model(graph, entity, cascade))
    }

    pub fn remove_model(&mut self, entity: EntityId, cascade: Cascade) -> Result<(), WardenError> {
        self.run(|session, graph| session.remove_model(graph, entity, cascade))
    }

    pub fn has_changes(&self, saved_only: bool) -> Result<bool, WardenError> {
        Ok(self.session()?.has_changes(self.graph(), saved_only))
    }

    pub fn get_changed(&self, saved_only: bool) -> Result<Vec<EntityId>, WardenError> {
        Ok(self.session()?.get_changed(self.graph(), saved_only))
    }

    pub fn validate(&self, stop_at_first_invalid: bool) -> Result<bool, WardenError> {
        Ok(self.session()?.validate(self.graph(), stop_at_first_invalid))
    }

    pub fn set_validation_required(&mut self, required: bool) -> Result<(), WardenError> {
        self.run(|session, _| {
            session.set_validation_required(required);
            Ok(())
        })
    }

    pub fn discard(&mut self) -> Result<(), WardenError> {
        self.run(|session, graph| session.discard(graph))
    }

    pub fn enable(&mut self) -> Result<(), WardenError> {
        self.run(|session, _| {
            session.enable();
            Ok(())
        })
    }

    pub fn disable(&mut self) -> Result<(), WardenError> {
        self.run(|session, _| {
            session.disable();
            Ok(())
        })
    }

    /// Destroy the session but keep it registered, status `Destroyed`.
    pub fn destroy(&mut self) -> Result<(), WardenError> {
        self.run(|session, graph| {
            session.destroy(graph);
            Ok(())
        })
    }

    pub fn begin_save(&mut self, full_validate: bool) -> Result<FlushPlan, WardenError> {
        self.run(|session, graph| session.begin_save(graph, full_validate))
    }

    pub fn finish_save(&mut self, outcome: FlushOutcome) -> Result<FlushReport, WardenError> {
        self.run(|session, graph| session.finish_save(graph, outcome))
    }

    /// Give up on a begun flush; see [`Session::abort_save`].
    pub fn abort_save(&mut self) -> Result<(), WardenError> {
        self.run(|session, graph| session.abort_save(graph))
    }

    /// Flush every pending change through the workspace's persistence and
    /// wait for all of it.
    ///
    /// Dropping the future before it completes aborts the flush and returns
    /// the session to `Active`.
    pub async fn save(&mut self, full_validate: bool) -> Result<FlushReport, WardenError> {
        let plan = self.begin_save(full_validate)?;
        let concurrency = self.workspace.config.flush_concurrency;
        let persistence = self.workspace.persistence();
        let mut guard = FlushGuard {
            scope: self,
            armed: true,
        };
        let outcome = plan.execute(persistence, concurrency).await;
        guard.armed = false;
        guard.scope.finish_save(outcome)
    }

    /// Membership of `object` in this session, if tracked.
    pub fn membership(&self, object: impl Into<ObjectKey>) -> Result<Option<Membership>, WardenError> {
        Ok(self.session()?.membership(object))
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.session()
            .map_or(SessionStatus::Destroyed, Session::status)
    }
}

/// Aborts the scope's flush if dropped while still armed.
struct FlushGuard<'s, 'w> {
    scope: &'s mut SessionScope<'w>,
    armed: bool,
}

impl Drop for FlushGuard<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.scope.abort_save() {
            tracing::warn!(session = self.scope.id.0, error = %err, "abort after cancelled flush failed");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
