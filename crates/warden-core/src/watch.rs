//! # Watch
//!
//! One tracking node per entity or collection inside a session.
//!
//! Watches live in the session's arena keyed by [`ObjectKey`]. Tree links are
//! keys, not pointers, so a cyclic live graph never produces a cyclic
//! ownership structure. The `membership` field places each watch in exactly
//! one of Watching / Removing / Unwatched.

use crate::events::Subscription;
use crate::graph::{Graph, RelationSlot, Resolved};
use crate::relations::RelationSpec;
use crate::schema::RelationBehavior;
use crate::{Cascade, EntityId, Fields, ObjectKey, WardenError};
use std::collections::{BTreeMap, BTreeSet};

/// Which session set a watch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Membership {
    Watching,
    Removing,
    Unwatched,
}

/// Normalized foreign-key projection of one relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationProjection {
    Single(Option<EntityId>),
    Many(Vec<EntityId>),
}

/// Rollback state of one entity.
///
/// Related entities are referenced by id only; each rolls back through its
/// own watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub fields: Fields,
    pub relations: BTreeMap<String, RelationProjection>,
}

impl Snapshot {
    /// Capture current fields plus every relation of the entity.
    pub fn capture(graph: &Graph, id: EntityId) -> Result<Self, WardenError> {
        let entity = graph.get_entity(id)?;
        let mut relations = BTreeMap::new();
        for (name, state) in entity.relations() {
            let projection = match state.slot {
                RelationSlot::Single(target) => RelationProjection::Single(target),
                RelationSlot::Many(coll) => {
                    RelationProjection::Many(graph.get_collection(coll)?.members().to_vec())
                }
            };
            relations.insert(name.clone(), projection);
        }
        Ok(Self {
            fields: entity.fields().clone(),
            relations,
        })
    }

    /// Capture with the given committed fields in place of the current ones.
    pub fn capture_with(graph: &Graph, id: EntityId, fields: Fields) -> Result<Self, WardenError> {
        Ok(Self {
            fields,
            ..Self::capture(graph, id)?
        })
    }

    /// Field-level difference from the live entity.
    #[must_use]
    pub fn differs(&self, graph: &Graph, id: EntityId) -> bool {
        graph.entity(id).is_some_and(|e| e.fields() != &self.fields)
    }

    /// Any relation no longer projects to what was captured.
    #[must_use]
    pub fn relations_differ(&self, graph: &Graph, id: EntityId) -> bool {
        match Self::capture(graph, id) {
            Ok(live) => live.relations != self.relations,
            Err(_) => false,
        }
    }

    /// Reapply fields and plural memberships with relation side effects
    /// suspended.
    pub fn restore(&self, graph: &mut Graph, id: EntityId) -> Result<(), WardenError> {
        let names: Vec<String> = graph
            .get_entity(id)?
            .relations()
            .map(|(name, _)| name.clone())
            .collect();

        let mut suspended: Vec<(String, RelationBehavior)> = Vec::with_capacity(names.len());
        for name in names {
            let behavior = graph.relation_behavior(id, &name)?;
            graph.set_relation_behavior(id, &name, RelationBehavior::inert())?;
            suspended.push((name, behavior));
        }

        let result = self.apply(graph, id);

        for (name, behavior) in suspended {
            graph.set_relation_behavior(id, &name, behavior)?;
        }
        result
    }

    fn apply(&self, graph: &mut Graph, id: EntityId) -> Result<(), WardenError> {
        graph.replace_fields(id, &self.fields)?;
        for (name, projection) in &self.relations {
            if let RelationProjection::Many(members) = projection {
                let coll = graph.plural(id, name)?;
                let live: Vec<EntityId> = members
                    .iter()
                    .copied()
                    .filter(|m| graph.entity(*m).is_some_and(|e| !e.is_deleted()))
                    .collect();
                graph.restore_members(coll, live)?;
            }
        }
        Ok(())
    }
}

/// Tracking node for one entity or collection.
#[derive(Debug)]
pub struct Watch {
    pub(crate) object: Resolved,
    pub(crate) membership: Membership,
    pub(crate) relations: RelationSpec,
    pub(crate) parent: Option<ObjectKey>,
    pub(crate) children: BTreeSet<ObjectKey>,
    pub(crate) snapshot: Option<Snapshot>,
    pub(crate) save: bool,
    pub(crate) cascade: Cascade,
    pub(crate) subscriptions: Vec<Subscription>,
    /// The session put this never-persisted entity into the local index.
    pub(crate) indexed: bool,
    /// Session clock value when the watch entered its current set.
    pub(crate) since: u64,
}

impl Watch {
    pub(crate) fn new(object: Resolved, since: u64) -> Self {
        Self {
            object,
            membership: Membership::Watching,
            relations: RelationSpec::none(),
            parent: None,
            children: BTreeSet::new(),
            snapshot: None,
            save: false,
            cascade: Cascade::NONE,
            subscriptions: Vec::new(),
            indexed: false,
            since,
        }
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        self.object.into()
    }

    #[must_use]
    pub fn object(&self) -> Resolved {
        self.object
    }

    #[must_use]
    pub fn entity(&self) -> Option<EntityId> {
        match self.object {
            Resolved::Entity(id) => Some(id),
            Resolved::Collection(_) => None,
        }
    }

    #[must_use]
    pub fn membership(&self) -> Membership {
        self.membership
    }

    #[must_use]
    pub fn relations(&self) -> &RelationSpec {
        &self.relations
    }

    #[must_use]
    pub fn parent(&self) -> Option<ObjectKey> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &BTreeSet<ObjectKey> {
        &self.children
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Marked for save.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.save
    }

    #[must_use]
    pub fn cascade(&self) -> Cascade {
        self.cascade
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Accept a relation spec. An empty spec means "unset"; a different
    /// non-empty spec than the one already held is a conflict.
    pub(crate) fn set_relations(&mut self, spec: &RelationSpec) -> Result<(), WardenError> {
        if spec.is_empty() {
            return Ok(());
        }
        if self.relations.is_empty() {
            self.relations = spec.clone();
            return Ok(());
        }
        if &self.relations != spec {
            return Err(WardenError::Conflict(format!(
                "{} is already watched with relations {:?}",
                self.key(),
                self.relations.names()
            )));
        }
        Ok(())
    }

    /// Capture a snapshot; `fields` overrides the live fields.
    pub(crate) fn save_state(&mut self, graph: &Graph, fields: Option<Fields>) -> Result<(), WardenError> {
        if let Some(id) = self.entity() {
            self.snapshot = Some(match fields {
                Some(fields) => Snapshot::capture_with(graph, id, fields)?,
                None => Snapshot::capture(graph, id)?,
            });
        }
        Ok(())
    }

    pub(crate) fn restore_state(&self, graph: &mut Graph) -> Result<(), WardenError> {
        match (self.entity(), &self.snapshot) {
            (Some(id), Some(snapshot)) => snapshot.restore(graph, id),
            _ => Ok(()),
        }
    }

    pub(crate) fn has_changes(&self, graph: &Graph) -> bool {
        match (self.entity(), &self.snapshot) {
            (Some(id), Some(snapshot)) => snapshot.differs(graph, id),
            _ => false,
        }
    }

    /// Fields or relation projections moved away from the snapshot.
    pub(crate) fn needs_restore(&self, graph: &Graph) -> bool {
        match (self.entity(), &self.snapshot) {
            (Some(id), Some(snapshot)) => {
                self.save || snapshot.differs(graph, id) || snapshot.relations_differ(graph, id)
            }
            _ => false,
        }
    }

    pub(crate) fn add_cascade(&mut self, cascade: Cascade) {
        self.cascade |= cascade;
    }

    pub(crate) fn reset_save(&mut self) {
        self.save = false;
        self.cascade = Cascade::NONE;
    }

    /// Release every listener.
    pub(crate) fn remove_listeners(&mut self, graph: &mut Graph) {
        for subscription in self.subscriptions.drain(..) {
            graph.release(subscription);
        }
    }
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
                ModelDef::new("list").relation("tasks", RelationDef::has_many("task", "list_id")),
            )
            .expect("list");
        graph
    }

    #[test]
    fn snapshot_projects_relations() {
        let mut graph = graph();
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let task = graph
            .load("task", fields([("id", 10_i64), ("list_id", 1_i64)]))
            .expect("task");

        let list_snap = Snapshot::capture(&graph, list).expect("list");
        assert_eq!(
            list_snap.relations.get("tasks"),
            Some(&RelationProjection::Many(vec![task]))
        );
        let task_snap = Snapshot::capture(&graph, task).expect("task");
        assert_eq!(
            task_snap.relations.get("list"),
            Some(&RelationProjection::Single(Some(list)))
        );
    }

    #[test]
    fn restore_reverts_fields_and_membership() {
        let mut graph = graph();
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let task = graph
            .load("task", fields([("id", 10_i64), ("list_id", 1_i64), ("name", 0_i64)]))
            .expect("task");
        let list_snap = Snapshot::capture(&graph, list).expect("list");
        let task_snap = Snapshot::capture(&graph, task).expect("task");

        graph.set_field(task, "name", FieldValue::text("changed")).expect("set");
        graph.unrelate(list, "tasks", task).expect("unrelate");
        assert!(task_snap.differs(&graph, task));
        assert!(list_snap.relations_differ(&graph, list));

        task_snap.restore(&mut graph, task).expect("restore task");
        list_snap.restore(&mut graph, list).expect("restore list");

        assert!(!task_snap.differs(&graph, task));
        assert!(!list_snap.relations_differ(&graph, list));
        let coll = graph.plural(list, "tasks").expect("coll");
        assert_eq!(graph.collection(coll).expect("coll").members(), &[task]);
        assert!(graph.relation_behavior(list, "tasks").expect("behavior").clear_key);
    }

    #[test]
    fn empty_spec_is_unset() {
        let mut graph = graph();
        let task = graph.create("task", fields([("name", "t")])).expect("task");
        let mut watch = Watch::new(Resolved::Entity(task), 0);

        watch.set_relations(&RelationSpec::none()).expect("empty");
        watch.set_relations(&RelationSpec::of(["list"])).expect("set");
        watch.set_relations(&RelationSpec::none()).expect("empty again");
        watch.set_relations(&RelationSpec::of(["list"])).expect("same");
        assert!(matches!(
            watch.set_relations(&RelationSpec::recursive(["list"])),
            Err(WardenError::Conflict(_))
        ));
    }

    #[test]
    fn cascade_accumulates_until_reset() {
        let mut graph = graph();
        let task = graph.create("task", Fields::new()).expect("task");
        let mut watch = Watch::new(Resolved::Entity(task), 0);
        watch.save = true;
        watch.add_cascade(Cascade::LOCAL);
        watch.add_cascade(Cascade::REST);
        assert_eq!(watch.cascade(), Cascade(3));
        watch.reset_save();
        assert!(!watch.is_dirty());
        assert_eq!(watch.cascade(), Cascade::NONE);
    }
}
