//! # Session Module
//!
//! The unit of work over a live [`Graph`].
//!
//! A session keeps one [`Watch`] per tracked entity or collection, each in
//! exactly one of three sets:
//! - `Watching`: reachable from a watched root, listeners attached
//! - `Removing`: delete pending, entity is `RemovePending`
//! - `Unwatched`: detached from the tree, snapshot kept for rollback
//!
//! Changes accumulate as dirty flags and snapshots; nothing reaches the
//! backing store until a flush (see [`crate::flush`]). `discard` rolls the
//! whole tracked subgraph back synchronously.
//!
//! Every operation takes the graph explicitly. Graph events routed to this
//! session are drained through the relation bridge at the start and end of
//! each operation.

use crate::events::{ListenerKind, SessionEvent};
use crate::graph::{Graph, Resolved, Slot};
use crate::relations::RelationSpec;
use crate::schema::RelationKind;
use crate::watch::{Membership, Watch};
use crate::{Cascade, EntityId, EntityStatus, ObjectKey, SessionId, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Capacity of the per-session event channel.
const SESSION_EVENT_CAPACITY: usize = 64;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Saving,
    Disabled,
    Destroyed,
}

/// Unit of work over the live graph.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    status: SessionStatus,
    pub(crate) watches: BTreeMap<ObjectKey, Watch>,
    /// Status each entity of the running flush had before it started.
    pub(crate) in_flight: BTreeMap<EntityId, EntityStatus>,
    validation_required: bool,
    events: broadcast::Sender<SessionEvent>,
    clock: u64,
}

impl Session {
    /// Create a new active session with no watches.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            id,
            status: SessionStatus::Active,
            watches: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            validation_required: false,
            events,
            clock: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Neither disabled nor destroyed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(
            self.status,
            SessionStatus::Disabled | SessionStatus::Destroyed
        )
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.status == SessionStatus::Disabled
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.status == SessionStatus::Saving
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.status == SessionStatus::Destroyed
    }

    /// Require validation to pass before a flush starts.
    pub fn set_validation_required(&mut self, required: bool) {
        self.validation_required = required;
    }

    #[must_use]
    pub fn validation_required(&self) -> bool {
        self.validation_required
    }

    /// Receive lifecycle events of this session.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn tick(&mut self) -> u64 {
        self.clock = self.clock.saturating_add(1);
        self.clock
    }

    fn ensure_live(&self) -> Result<(), WardenError> {
        if self.is_destroyed() {
            return Err(WardenError::SessionNotActive(self.status));
        }
        Ok(())
    }

    /// Dirty marking is frozen while a flush is in flight.
    fn ensure_not_saving(&self) -> Result<(), WardenError> {
        self.ensure_live()?;
        if self.is_saving() {
            return Err(WardenError::SaveInFlight);
        }
        Ok(())
    }

    /// Pause façade interception. Only an active session can be disabled.
    pub fn disable(&mut self) {
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Disabled;
        }
    }

    pub fn enable(&mut self) {
        if self.status == SessionStatus::Disabled {
            self.status = SessionStatus::Active;
        }
    }

    // =========================================================================
    // MEMBERSHIP QUERIES
    // =========================================================================

    #[must_use]
    pub fn get(&self, object: impl Into<ObjectKey>) -> Option<&Watch> {
        self.watches.get(&object.into())
    }

    #[must_use]
    pub fn membership(&self, object: impl Into<ObjectKey>) -> Option<Membership> {
        self.get(object).map(Watch::membership)
    }

    #[must_use]
    pub fn is_watching(&self, object: impl Into<ObjectKey>) -> bool {
        self.membership(object) == Some(Membership::Watching)
    }

    #[must_use]
    pub fn is_unwatched(&self, object: impl Into<ObjectKey>) -> bool {
        self.membership(object) == Some(Membership::Unwatched)
    }

    #[must_use]
    pub fn is_removed(&self, object: impl Into<ObjectKey>) -> bool {
        self.membership(object) == Some(Membership::Removing)
    }

    /// Tracked in any of the three sets.
    #[must_use]
    pub fn has_watched(&self, object: impl Into<ObjectKey>) -> bool {
        self.get(object).is_some()
    }

    /// Watches in one set, in key order.
    pub fn watches_in(&self, membership: Membership) -> impl Iterator<Item = &Watch> {
        self.watches
            .values()
            .filter(move |w| w.membership == membership)
    }

    #[must_use]
    pub fn count(&self, membership: Membership) -> usize {
        self.watches_in(membership).count()
    }

    pub(crate) fn keys_in(&self, membership: Membership) -> Vec<ObjectKey> {
        self.watches_in(membership).map(Watch::key).collect()
    }

    // =========================================================================
    // WATCH / UNWATCH
    // =========================================================================

    /// Track `object` and everything `spec` reaches from it.
    ///
    /// Promotes an unwatched watch back into `Watching`. Watching an object
    /// again with the same spec is a no-op.
    pub fn watch(
        &mut self,
        graph: &mut Graph,
        object: impl Into<ObjectKey>,
        spec: &RelationSpec,
    ) -> Result<(), WardenError> {
        self.ensure_live()?;
        self.sync(graph);
        let key = object.into();
        self.watch_node(graph, key, spec, None)?;
        tracing::debug!(session = self.id.0, object = %key, "watching");
        self.sync(graph);
        Ok(())
    }

    pub fn watch_many<I, K>(
        &mut self,
        graph: &mut Graph,
        objects: I,
        spec: &RelationSpec,
    ) -> Result<(), WardenError>
    where
        I: IntoIterator<Item = K>,
        K: Into<ObjectKey>,
    {
        for object in objects {
            self.watch(graph, object, spec)?;
        }
        Ok(())
    }

    /// Stop tracking `object`.
    ///
    /// A never-persisted entity has nothing to roll back to, so its watch and
    /// subtree are destroyed. Anything else moves to `Unwatched` with its
    /// dirty flag cleared and its snapshot kept.
    pub fn unwatch(&mut self, graph: &mut Graph, object: impl Into<ObjectKey>) -> Result<(), WardenError> {
        self.ensure_live()?;
        self.sync(graph);
        self.unwatch_node(graph, object.into(), false)?;
        self.sync(graph);
        Ok(())
    }

    pub(crate) fn watch_node(
        &mut self,
        graph: &mut Graph,
        key: ObjectKey,
        spec: &RelationSpec,
        parent: Option<ObjectKey>,
    ) -> Result<(), WardenError> {
        let object = graph.resolve(key)?;
        if let Some(owner) = graph.attachment(key)
            && owner != self.id
        {
            return Err(WardenError::Conflict(format!(
                "{key} is already watched by session {}",
                owner.0
            )));
        }

        let stamp = self.tick();
        let (descend, stale_children) = match self.watches.get_mut(&key) {
            Some(watch) => {
                let unset = watch.relations.is_empty();
                watch.set_relations(spec)?;
                match watch.membership {
                    Membership::Watching => (unset && !spec.is_empty(), Vec::new()),
                    Membership::Removing => return Ok(()),
                    Membership::Unwatched => {
                        watch.membership = Membership::Watching;
                        watch.since = stamp;
                        let stale = std::mem::take(&mut watch.children);
                        (true, stale.into_iter().collect())
                    }
                }
            }
            None => {
                graph.attach(key, self.id)?;
                let mut watch = Watch::new(object, stamp);
                watch.set_relations(spec)?;
                watch.save_state(graph, None)?;
                self.watches.insert(key, watch);
                (true, Vec::new())
            }
        };

        // Children of a promoted watch relink only if still reachable.
        for child in stale_children {
            if let Some(watch) = self.watches.get_mut(&child)
                && watch.parent == Some(key)
            {
                watch.parent = None;
            }
        }

        self.link(key, parent);
        if descend {
            self.descend(graph, key)?;
        }
        Ok(())
    }

    /// Watch what the watch's spec reaches and attach listeners once.
    fn descend(&mut self, graph: &mut Graph, key: ObjectKey) -> Result<(), WardenError> {
        let Some(watch) = self.watches.get(&key) else {
            return Ok(());
        };
        let spec = watch.relations.clone();
        let listening = !watch.subscriptions.is_empty();
        let mut kinds = Vec::new();

        match watch.object {
            Resolved::Entity(id) => {
                for name in spec.names() {
                    let child_spec = spec.child(&name).unwrap_or_default();
                    let singular = graph
                        .get_entity(id)?
                        .relation(&name)
                        .is_some_and(|s| RelationKind::is_singular(s.def.kind));
                    match graph.property(id, &name)? {
                        Slot::Entity(Some(target)) if is_live(graph, target) => {
                            self.watch_node(graph, target.into(), &child_spec, Some(key))?;
                        }
                        Slot::Collection(coll) => {
                            self.watch_node(graph, coll.into(), &child_spec, Some(key))?;
                        }
                        Slot::Entity(_) | Slot::Scalar(_) | Slot::Missing => {}
                    }
                    if singular {
                        kinds.push(ListenerKind::RelationUpdate(name));
                    }
                }
            }
            Resolved::Collection(coll) => {
                let members = graph.get_collection(coll)?.members().to_vec();
                for member in members {
                    if is_live(graph, member) {
                        self.watch_node(graph, member.into(), &spec, Some(key))?;
                    }
                }
                kinds.extend(ListenerKind::COLLECTION);
            }
        }

        if !listening && !kinds.is_empty() {
            let subscriptions: Vec<_> = kinds
                .into_iter()
                .map(|kind| graph.subscribe(key, self.id, kind))
                .collect();
            match self.watches.get_mut(&key) {
                Some(watch) => watch.subscriptions.extend(subscriptions),
                None => subscriptions.into_iter().for_each(|s| graph.release(s)),
            }
        }
        Ok(())
    }

    /// Record `parent` for a parentless watch unless that would close a cycle.
    fn link(&mut self, key: ObjectKey, parent: Option<ObjectKey>) {
        let Some(parent) = parent else {
            return;
        };
        if parent == key
            || self.membership(parent) != Some(Membership::Watching)
            || self.watches.get(&key).is_none_or(|w| w.parent.is_some())
        {
            return;
        }
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current == key {
                return;
            }
            cursor = self.watches.get(&current).and_then(|w| w.parent);
        }
        if let Some(watch) = self.watches.get_mut(&key) {
            watch.parent = Some(parent);
        }
        if let Some(watch) = self.watches.get_mut(&parent) {
            watch.children.insert(key);
        }
    }

    /// Detach a watching node. With `keep_save` a dirty entity stays dirty
    /// in `Unwatched` so the next flush still persists it; a never-persisted
    /// entity is destroyed only when nothing is pending for it.
    pub(crate) fn unwatch_node(
        &mut self,
        graph: &mut Graph,
        key: ObjectKey,
        keep_save: bool,
    ) -> Result<(), WardenError> {
        let Some(watch) = self.watches.get(&key) else {
            return Ok(());
        };
        if watch.membership != Membership::Watching {
            return Ok(());
        }
        let pending = keep_save && watch.save;
        match watch.entity() {
            Some(id) if !pending && graph.entity(id).is_some_and(|e| !e.is_persisted()) => {
                if watch.indexed {
                    graph.index_remove(id)?;
                }
                self.destroy_watch(graph, key);
                tracing::debug!(session = self.id.0, object = %key, "unwatched new entity");
            }
            _ => {
                self.move_to(graph, key, Membership::Unwatched)?;
                if !keep_save && let Some(watch) = self.watches.get_mut(&key) {
                    watch.reset_save();
                }
                tracing::debug!(session = self.id.0, object = %key, pending, "unwatched");
            }
        }
        Ok(())
    }

    // =========================================================================
    // TREE MOVES
    // =========================================================================

    /// Move a watch to `target`, detaching it from its parent.
    ///
    /// Moving to `Unwatched` carries the subtree along. Moving to `Removing`
    /// moves only this node; its descendants become unwatched roots.
    pub(crate) fn move_to(
        &mut self,
        graph: &mut Graph,
        key: ObjectKey,
        target: Membership,
    ) -> Result<(), WardenError> {
        if target == Membership::Watching {
            return self.reattach(graph, key);
        }
        let Some(watch) = self.watches.get_mut(&key) else {
            return Ok(());
        };
        if let Some(parent) = watch.parent.take()
            && let Some(parent) = self.watches.get_mut(&parent)
        {
            parent.children.remove(&key);
        }

        match target {
            Membership::Unwatched => self.move_subtree(graph, key),
            _ => {
                let stamp = self.tick();
                let Some(watch) = self.watches.get_mut(&key) else {
                    return Ok(());
                };
                watch.membership = Membership::Removing;
                watch.since = stamp;
                watch.remove_listeners(graph);
                let children = std::mem::take(&mut watch.children);
                for child in children {
                    if let Some(watch) = self.watches.get_mut(&child)
                        && watch.parent == Some(key)
                    {
                        watch.parent = None;
                        self.move_subtree(graph, child);
                    }
                }
            }
        }
        Ok(())
    }

    fn move_subtree(&mut self, graph: &mut Graph, key: ObjectKey) {
        let stamp = self.tick();
        let Some(watch) = self.watches.get_mut(&key) else {
            return;
        };
        if watch.membership == Membership::Removing {
            return;
        }
        watch.membership = Membership::Unwatched;
        watch.since = stamp;
        watch.remove_listeners(graph);
        let children: Vec<ObjectKey> = watch.children.iter().copied().collect();
        for child in children {
            if self.watches.get(&child).is_some_and(|w| w.parent == Some(key)) {
                self.move_subtree(graph, child);
            }
        }
    }

    /// Put a watch back into `Watching` and resynchronize its relations.
    /// The snapshot is kept.
    pub(crate) fn reattach(&mut self, graph: &mut Graph, key: ObjectKey) -> Result<(), WardenError> {
        let Some(watch) = self.watches.get_mut(&key) else {
            return Ok(());
        };
        if watch.membership == Membership::Removing {
            watch.membership = Membership::Unwatched;
        }
        let spec = watch.relations.clone();
        self.watch_node(graph, key, &spec, None)
    }

    /// Release a watch and its subtree entirely.
    pub(crate) fn destroy_watch(&mut self, graph: &mut Graph, key: ObjectKey) {
        let Some(mut watch) = self.watches.remove(&key) else {
            return;
        };
        watch.remove_listeners(graph);
        graph.detach(key, self.id);
        if let Some(parent) = watch.parent
            && let Some(parent) = self.watches.get_mut(&parent)
        {
            parent.children.remove(&key);
        }
        for child in std::mem::take(&mut watch.children) {
            if self.watches.get(&child).is_some_and(|w| w.parent == Some(key)) {
                self.destroy_watch(graph, child);
            }
        }
        tracing::trace!(session = self.id.0, object = %key, "watch destroyed");
    }

    // =========================================================================
    // DIRTY MARKING
    // =========================================================================

    /// Mark an entity for save instead of persisting it now.
    ///
    /// An untracked entity is watched first. Cascade flags accumulate until
    /// the next flush or discard. Rejected with `SaveInFlight` while saving.
    pub fn save_model(
        &mut self,
        graph: &mut Graph,
        entity: EntityId,
        cascade: Cascade,
    ) -> Result<(), WardenError> {
        self.ensure_not_saving()?;
        self.sync(graph);
        let key = ObjectKey::Entity(entity);
        if !self.watches.contains_key(&key) {
            self.watch_node(graph, key, &RelationSpec::none(), None)?;
        }
        let persisted = graph.get_entity(entity)?.is_persisted();
        let Some(watch) = self.watches.get_mut(&key) else {
            return Ok(());
        };
        if watch.membership == Membership::Removing {
            tracing::debug!(session = self.id.0, entity = entity.0, "save ignored, removal pending");
            return Ok(());
        }

        watch.add_cascade(cascade);
        if watch.save {
            return Ok(());
        }
        watch.save = true;
        if graph.index_has(entity)? {
            graph.index_touch(entity)?;
        } else {
            graph.index_put(entity)?;
            watch.indexed = !persisted;
        }
        self.emit(if persisted {
            SessionEvent::UpdateAndSave(entity)
        } else {
            SessionEvent::CreateAndSave(entity)
        });
        tracing::debug!(session = self.id.0, entity = entity.0, cascade = cascade.0, "marked for save");
        self.sync(graph);
        Ok(())
    }

    /// Mark an entity for removal instead of deleting it now.
    ///
    /// A never-persisted entity is simply dropped: its watch is destroyed and
    /// it is marked deleted. Rejected with `SaveInFlight` while saving.
    pub fn remove_model(
        &mut self,
        graph: &mut Graph,
        entity: EntityId,
        cascade: Cascade,
    ) -> Result<(), WardenError> {
        self.ensure_not_saving()?;
        self.sync(graph);
        let key = ObjectKey::Entity(entity);

        if !graph.get_entity(entity)?.is_persisted() {
            self.destroy_watch(graph, key);
            graph.mark_deleted(entity)?;
            tracing::debug!(session = self.id.0, entity = entity.0, "dropped new entity");
            self.sync(graph);
            return Ok(());
        }

        if !self.watches.contains_key(&key) {
            self.watch_node(graph, key, &RelationSpec::none(), None)?;
        }
        if self.is_removed(key) {
            if let Some(watch) = self.watches.get_mut(&key) {
                watch.add_cascade(cascade);
            }
            return Ok(());
        }

        self.move_to(graph, key, Membership::Removing)?;
        graph.set_status(entity, EntityStatus::RemovePending)?;
        graph.index_remove(entity)?;
        if let Some(watch) = self.watches.get_mut(&key) {
            watch.reset_save();
            watch.add_cascade(cascade);
        }
        tracing::debug!(session = self.id.0, entity = entity.0, cascade = cascade.0, "marked for removal");
        self.sync(graph);
        Ok(())
    }

    // =========================================================================
    // CHANGE QUERIES
    // =========================================================================

    fn is_changed(graph: &Graph, watch: &Watch, saved_only: bool) -> bool {
        if saved_only && !watch.save {
            return false;
        }
        let unsaved_create = watch.save
            && watch
                .entity()
                .and_then(|id| graph.entity(id))
                .is_some_and(|e| !e.is_persisted());
        unsaved_create || watch.has_changes(graph)
    }

    /// Whether anything is pending: a removal, or a tracked entity whose
    /// fields left its snapshot (only dirty ones with `saved_only`).
    #[must_use]
    pub fn has_changes(&self, graph: &Graph, saved_only: bool) -> bool {
        if self.count(Membership::Removing) > 0 {
            return true;
        }
        [Membership::Watching, Membership::Unwatched]
            .into_iter()
            .any(|membership| {
                self.search_models(membership, false, |_, watch| {
                    Self::is_changed(graph, watch, saved_only).then_some(true)
                })
            })
    }

    /// Entities pending removal followed by every changed tracked entity.
    #[must_use]
    pub fn get_changed(&self, graph: &Graph, saved_only: bool) -> Vec<EntityId> {
        let mut changed: Vec<EntityId> = self
            .watches_in(Membership::Removing)
            .filter_map(Watch::entity)
            .collect();
        for membership in [Membership::Watching, Membership::Unwatched] {
            self.search_models(membership, (), |id, watch| {
                if Self::is_changed(graph, watch, saved_only) {
                    changed.push(id);
                }
                None
            });
        }
        changed
    }

    /// Watching entities failing their model validator.
    pub(crate) fn invalid_entities(&self, graph: &Graph, stop_at_first: bool) -> Vec<EntityId> {
        if !graph.has_validation() {
            return Vec::new();
        }
        let mut invalid = Vec::new();
        self.search_models(Membership::Watching, (), |id, _| {
            if let Err(reason) = graph.validate_entity(id) {
                tracing::debug!(entity = id.0, %reason, "entity invalid");
                invalid.push(id);
                if stop_at_first {
                    return Some(());
                }
            }
            None
        });
        invalid
    }

    /// Validate every watching entity; emits `Valid` or `Invalid`.
    pub fn validate(&self, graph: &Graph, stop_at_first_invalid: bool) -> bool {
        let valid = self.invalid_entities(graph, stop_at_first_invalid).is_empty();
        self.emit(if valid {
            SessionEvent::Valid
        } else {
            SessionEvent::Invalid
        });
        valid
    }

    // =========================================================================
    // DISCARD / DESTROY
    // =========================================================================

    /// Roll every tracked change back to its snapshot without touching the
    /// backing store.
    ///
    /// Pending removals return to `Synced` and to the local index, detached
    /// watches are reattached, and every entity whose fields or relations
    /// left its snapshot is restored. Watches the rollback itself detaches
    /// are released.
    pub fn discard(&mut self, graph: &mut Graph) -> Result<(), WardenError> {
        match self.status {
            SessionStatus::Saving => return Err(WardenError::SaveInFlight),
            SessionStatus::Destroyed => return Err(WardenError::SessionNotActive(self.status)),
            SessionStatus::Active | SessionStatus::Disabled => {}
        }
        self.sync(graph);

        for watch in self.watches.values_mut() {
            if !watch.indexed {
                continue;
            }
            watch.indexed = false;
            if let Some(id) = watch.entity()
                && graph.entity(id).is_some_and(|e| !e.is_persisted())
            {
                graph.index_remove(id)?;
            }
        }

        for key in self.keys_in(Membership::Removing) {
            if let Some(id) = key.entity() {
                if graph.get_entity(id)?.status() == EntityStatus::RemovePending {
                    graph.set_status(id, EntityStatus::Synced)?;
                }
                graph.index_put(id)?;
            }
            self.reattach(graph, key)?;
        }

        let roots: Vec<ObjectKey> = self
            .watches_in(Membership::Unwatched)
            .filter(|w| w.parent.is_none())
            .map(Watch::key)
            .collect();
        for key in roots {
            if self.is_unwatched(key) {
                self.reattach(graph, key)?;
            }
        }
        self.sync(graph);

        let changed: Vec<ObjectKey> = self
            .watches
            .values()
            .filter(|w| w.membership != Membership::Removing && w.needs_restore(graph))
            .map(Watch::key)
            .collect();
        for key in changed {
            if let Some(watch) = self.watches.get(&key) {
                watch.restore_state(graph)?;
            }
            self.sync(graph);
        }
        for watch in self.watches.values_mut() {
            watch.reset_save();
        }

        for key in self.keys_in(Membership::Unwatched) {
            self.destroy_watch(graph, key);
        }

        self.emit(SessionEvent::Discard);
        tracing::info!(session = self.id.0, watching = self.count(Membership::Watching), "discarded");
        Ok(())
    }

    /// Release every watch and listener. Pending removals are dropped
    /// without rollback. Idempotent.
    pub fn destroy(&mut self, graph: &mut Graph) {
        if self.is_destroyed() {
            return;
        }
        let roots: Vec<ObjectKey> = self
            .watches
            .values()
            .filter(|w| w.membership != Membership::Removing && w.parent.is_none())
            .map(Watch::key)
            .collect();
        for key in roots {
            self.destroy_watch(graph, key);
        }
        let rest: Vec<ObjectKey> = self.watches.keys().copied().collect();
        for key in rest {
            self.destroy_watch(graph, key);
        }
        graph.discard_notifications(self.id);
        self.status = SessionStatus::Destroyed;
        tracing::info!(session = self.id.0, "session destroyed");
    }
}

fn is_live(graph: &Graph, id: EntityId) -> bool {
    graph.entity(id).is_some_and(|e| !e.is_deleted())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ModelDef, RelationDef};
    use crate::{FieldValue, fields};

    fn graph() -> Graph {
        let mut graph = Graph::new();
        graph
            .define_model(
                ModelDef::new("task")
                    .fields(["name", "list_id"])
                    .relation("list", RelationDef::belongs_to("list", "list_id")),
            )
            .expect("task");
        graph
            .define_model(
                ModelDef::new("list")
                    .fields(["name"])
                    .relation("tasks", RelationDef::has_many("task", "list_id")),
            )
            .expect("list");
        graph
    }

    fn list_with_tasks(graph: &mut Graph) -> (EntityId, EntityId, EntityId) {
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let t0 = graph
            .load("task", fields([("id", 10_i64), ("list_id", 1_i64)]))
            .expect("t0");
        let t1 = graph
            .load("task", fields([("id", 11_i64), ("list_id", 1_i64)]))
            .expect("t1");
        (list, t0, t1)
    }

    #[test]
    fn watch_walks_relation_spec() {
        let mut graph = graph();
        let (list, t0, t1) = list_with_tasks(&mut graph);
        let coll = graph.plural(list, "tasks").expect("coll");
        let mut session = Session::new(SessionId(0));

        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");

        assert!(session.is_watching(list));
        assert!(session.is_watching(coll));
        assert!(session.is_watching(t0));
        assert!(session.is_watching(t1));
        assert_eq!(session.get(t0).expect("t0").parent(), Some(coll.into()));
        assert_eq!(session.get(coll).expect("coll").listener_count(), 6);
        assert_eq!(graph.attachment(t0.into()), Some(SessionId(0)));
    }

    #[test]
    fn watch_is_idempotent() {
        let mut graph = graph();
        let (list, _, _) = list_with_tasks(&mut graph);
        let coll = graph.plural(list, "tasks").expect("coll");
        let mut session = Session::new(SessionId(0));
        let spec = RelationSpec::of(["tasks"]);

        session.watch(&mut graph, list, &spec).expect("first");
        session.watch(&mut graph, list, &spec).expect("second");
        assert_eq!(session.count(Membership::Watching), 4);
        assert_eq!(graph.listener_count(coll.into()), 6);
    }

    #[test]
    fn watch_rejects_conflicting_spec() {
        let mut graph = graph();
        let (list, _, _) = list_with_tasks(&mut graph);
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");
        let conflict = session.watch(&mut graph, list, &RelationSpec::recursive(["tasks"]));
        assert!(matches!(conflict, Err(WardenError::Conflict(_))));
    }

    #[test]
    fn unwatch_moves_persisted_and_destroys_new() {
        let mut graph = graph();
        let (_, t0, _) = list_with_tasks(&mut graph);
        let fresh = graph.create("task", fields([("name", "x")])).expect("fresh");
        let mut session = Session::new(SessionId(0));
        session.watch_many(&mut graph, [t0, fresh], &RelationSpec::none()).expect("watch");

        session.unwatch(&mut graph, t0).expect("unwatch");
        session.unwatch(&mut graph, fresh).expect("unwatch");

        assert!(session.is_unwatched(t0));
        assert!(session.get(t0).expect("t0").snapshot().is_some());
        assert!(!session.has_watched(fresh));
        assert_eq!(graph.attachment(fresh.into()), None);
    }

    #[test]
    fn save_model_marks_dirty_once() {
        let mut graph = graph();
        let (_, t0, _) = list_with_tasks(&mut graph);
        let mut session = Session::new(SessionId(0));
        let mut events = session.subscribe();
        session.watch(&mut graph, t0, &RelationSpec::none()).expect("watch");

        session.save_model(&mut graph, t0, Cascade::LOCAL).expect("save");
        session.save_model(&mut graph, t0, Cascade::REST).expect("save");

        let watch = session.get(t0).expect("watch");
        assert!(watch.is_dirty());
        assert_eq!(watch.cascade(), Cascade(3));
        assert_eq!(events.try_recv().expect("event"), SessionEvent::UpdateAndSave(t0));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn remove_model_moves_to_removing() {
        let mut graph = graph();
        let (_, t0, _) = list_with_tasks(&mut graph);
        let mut session = Session::new(SessionId(0));
        session.watch(&mut graph, t0, &RelationSpec::none()).expect("watch");

        session.remove_model(&mut graph, t0, Cascade::ALL).expect("remove");

        assert!(session.is_removed(t0));
        assert_eq!(graph.entity(t0).expect("t0").status(), EntityStatus::RemovePending);
        assert!(!graph.index_has(t0).expect("index"));
        assert!(session.has_changes(&graph, false));
        assert_eq!(session.get_changed(&graph, false), vec![t0]);
    }

    #[test]
    fn discard_restores_fields_and_removals() {
        let mut graph = graph();
        let (_, t0, t1) = list_with_tasks(&mut graph);
        let mut session = Session::new(SessionId(0));
        session.watch_many(&mut graph, [t0, t1], &RelationSpec::none()).expect("watch");

        graph.set_field(t0, "name", FieldValue::text("edited")).expect("set");
        session.save_model(&mut graph, t0, Cascade::ALL).expect("save");
        session.remove_model(&mut graph, t1, Cascade::ALL).expect("remove");
        assert!(session.has_changes(&graph, false));

        session.discard(&mut graph).expect("discard");

        assert!(!session.has_changes(&graph, false));
        assert_eq!(graph.entity(t0).expect("t0").get("name"), None);
        assert_eq!(graph.entity(t1).expect("t1").status(), EntityStatus::Synced);
        assert!(graph.index_has(t1).expect("index"));
        assert!(session.is_watching(t1));
        assert!(!session.get(t0).expect("t0").is_dirty());
    }

    #[test]
    fn destroy_releases_everything() {
        let mut graph = graph();
        let (list, t0, _) = list_with_tasks(&mut graph);
        let coll = graph.plural(list, "tasks").expect("coll");
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");

        session.destroy(&mut graph);
        session.destroy(&mut graph);

        assert!(session.is_destroyed());
        assert_eq!(session.count(Membership::Watching), 0);
        assert_eq!(graph.listener_count(coll.into()), 0);
        assert_eq!(graph.attachment(t0.into()), None);
        assert!(session.watch(&mut graph, t0, &RelationSpec::none()).is_err());
    }

    #[test]
    fn enable_disable_toggle() {
        let mut session = Session::new(SessionId(0));
        session.disable();
        assert!(session.is_disabled());
        assert!(!session.is_enabled());
        session.enable();
        assert!(session.is_active());
        session.set_status(SessionStatus::Saving);
        session.disable();
        assert!(session.is_saving());
    }
}
