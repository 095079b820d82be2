//! # Relation Listener Bridge
//!
//! Keeps a session's watch tree consistent with the live graph when the
//! graph is mutated directly, outside the session's own API.
//!
//! Each watched entity with singular relations in its spec listens for
//! foreign-key changes; each watched collection listens for membership
//! changes. The graph queues a [`Notification`] per matching listener and the
//! session drains its queue through [`Session::sync`].
//!
//! | Event              | Effect on the watch tree                                  |
//! |--------------------|-----------------------------------------------------------|
//! | `RelationUpdate`   | previous child unwatched, current one watched in its place |
//! | `Added`/`AddedMany`| each new member watched under the collection               |
//! | `Removed`/`RemovedMany` | each removed member unwatched                         |
//! | `Reset`            | all children unwatched, then every current member watched  |
//! | `Cleared`          | all children unwatched                                     |

use crate::events::{GraphEvent, Notification};
use crate::graph::Graph;
use crate::watch::Membership;
use crate::{EntityId, ObjectKey, Session, WardenError};

impl Session {
    /// Drain and apply every queued notification for this session.
    ///
    /// A failing handler is logged and skipped; the rest still apply.
    pub(crate) fn sync(&mut self, graph: &mut Graph) {
        while let Some(notification) = graph.next_notification(self.id()) {
            if let Err(err) = self.handle(graph, notification) {
                tracing::warn!(session = self.id().0, error = %err, "relation listener failed");
            }
        }
    }

    fn handle(&mut self, graph: &mut Graph, notification: Notification) -> Result<(), WardenError> {
        if self.is_destroyed() {
            return Ok(());
        }
        let key = notification.watch;
        if self.membership(key) != Some(Membership::Watching) {
            return Ok(());
        }
        tracing::trace!(session = self.id().0, watch = %key, event = ?notification.event, "relation event");

        match notification.event {
            GraphEvent::RelationUpdate {
                relation,
                previous,
                current,
                ..
            } => {
                if let Some(previous) = previous {
                    self.drop_child(graph, key, previous.into())?;
                }
                if let Some(current) = current {
                    let spec = self
                        .get(key)
                        .and_then(|w| w.relations().child(&relation))
                        .unwrap_or_default();
                    self.watch_node(graph, current.into(), &spec, Some(key))?;
                }
            }
            GraphEvent::Added { entity, .. } => self.adopt(graph, key, &[entity])?,
            GraphEvent::AddedMany { entities, .. } => self.adopt(graph, key, &entities)?,
            GraphEvent::Removed { entity, .. } => self.drop_child(graph, key, entity.into())?,
            GraphEvent::RemovedMany { entities, .. } => {
                for entity in entities {
                    self.drop_child(graph, key, entity.into())?;
                }
            }
            GraphEvent::Reset { collection } => {
                self.detach_children(graph, key)?;
                let members = graph.get_collection(collection)?.members().to_vec();
                self.adopt(graph, key, &members)?;
            }
            GraphEvent::Cleared { .. } => self.detach_children(graph, key)?,
        }
        Ok(())
    }

    /// Watch members under a collection watch with the collection's spec.
    fn adopt(&mut self, graph: &mut Graph, parent: ObjectKey, members: &[EntityId]) -> Result<(), WardenError> {
        let spec = self
            .get(parent)
            .map(|w| w.relations().clone())
            .unwrap_or_default();
        for member in members {
            if graph.entity(*member).is_some_and(|e| !e.is_deleted()) {
                self.watch_node(graph, (*member).into(), &spec, Some(parent))?;
            }
        }
        Ok(())
    }

    /// Unwatch `child` if it hangs under `parent` in this session.
    fn drop_child(&mut self, graph: &mut Graph, parent: ObjectKey, child: ObjectKey) -> Result<(), WardenError> {
        if self.get(child).is_some_and(|w| w.parent() == Some(parent)) {
            self.unwatch_node(graph, child, true)?;
        }
        Ok(())
    }

    fn detach_children(&mut self, graph: &mut Graph, parent: ObjectKey) -> Result<(), WardenError> {
        let children: Vec<ObjectKey> = self
            .get(parent)
            .map(|w| w.children().iter().copied().collect())
            .unwrap_or_default();
        for child in children {
            if self.is_watching(child) {
                self.move_to(graph, child, Membership::Unwatched)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::relations::RelationSpec;
    use crate::schema::{ModelDef, RelationDef};
    use crate::{Cascade, FieldValue, Graph, Session, SessionId, fields};

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
            .define_model(ModelDef::new("list").relation("tasks", RelationDef::has_many("task", "list_id")))
            .expect("list");
        graph
    }

    #[test]
    fn added_member_is_watched_under_collection() {
        let mut graph = graph();
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let coll = graph.plural(list, "tasks").expect("coll");
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");

        let task = graph.create("task", fields([("name", "new")])).expect("task");
        graph.relate(list, "tasks", task).expect("relate");
        session.sync(&mut graph);

        assert!(session.is_watching(task));
        assert_eq!(session.get(task).expect("task").parent(), Some(coll.into()));
    }

    #[test]
    fn removed_member_is_unwatched() {
        let mut graph = graph();
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let task = graph
            .load("task", fields([("id", 5_i64), ("list_id", 1_i64)]))
            .expect("task");
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");

        graph.unrelate(list, "tasks", task).expect("unrelate");
        session.sync(&mut graph);

        assert!(session.is_unwatched(task));
        assert_eq!(graph.entity(task).expect("task").get("list_id"), Some(&FieldValue::Null));
    }

    #[test]
    fn foreign_key_change_swaps_watched_entity() {
        let mut graph = graph();
        let l0 = graph.load("list", fields([("id", 1_i64)])).expect("l0");
        let l1 = graph.load("list", fields([("id", 2_i64)])).expect("l1");
        let task = graph
            .load("task", fields([("id", 5_i64), ("list_id", 1_i64)]))
            .expect("task");
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, task, &RelationSpec::of(["list"]))
            .expect("watch");
        assert!(session.is_watching(l0));

        graph.set_related(task, "list", Some(l1)).expect("reassign");
        session.sync(&mut graph);

        assert!(session.is_unwatched(l0));
        assert!(session.is_watching(l1));
        assert_eq!(session.get(l1).expect("l1").parent(), Some(task.into()));
    }

    #[test]
    fn cleared_collection_unwatches_children() {
        let mut graph = graph();
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let task = graph
            .load("task", fields([("id", 5_i64), ("list_id", 1_i64)]))
            .expect("task");
        let coll = graph.plural(list, "tasks").expect("coll");
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");

        graph.clear_collection(coll).expect("clear");
        session.sync(&mut graph);

        assert!(session.is_unwatched(task));
        assert!(session.get(coll).expect("coll").children().is_empty());
    }

    #[test]
    fn reset_rewatches_current_members() {
        let mut graph = graph();
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let kept = graph
            .load("task", fields([("id", 5_i64), ("list_id", 1_i64)]))
            .expect("kept");
        let dropped = graph
            .load("task", fields([("id", 6_i64), ("list_id", 1_i64)]))
            .expect("dropped");
        let joined = graph.load("task", fields([("id", 7_i64)])).expect("joined");
        let coll = graph.plural(list, "tasks").expect("coll");
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");

        graph.reset_collection(coll, vec![kept, joined]).expect("reset");
        session.sync(&mut graph);

        for task in [kept, joined] {
            assert!(session.is_watching(task));
            assert_eq!(session.get(task).expect("member").parent(), Some(coll.into()));
        }
        assert!(session.is_unwatched(dropped));
        assert_eq!(session.get(dropped).expect("dropped").parent(), None);
        let children = session.get(coll).expect("coll").children();
        assert_eq!(children.len(), 2);
        assert!(!children.contains(&dropped.into()));
        assert_eq!(graph.entity(joined).expect("joined").get("list_id"), Some(&FieldValue::Int(1)));
    }

    #[test]
    fn batch_events_follow_every_member() {
        let mut graph = graph();
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let t0 = graph.load("task", fields([("id", 5_i64)])).expect("t0");
        let t1 = graph.load("task", fields([("id", 6_i64)])).expect("t1");
        let coll = graph.plural(list, "tasks").expect("coll");
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");

        graph.relate_many(list, "tasks", &[t0, t1]).expect("relate");
        session.sync(&mut graph);
        for task in [t0, t1] {
            assert!(session.is_watching(task));
            assert_eq!(session.get(task).expect("task").parent(), Some(coll.into()));
        }

        let removed = graph.unrelate_many(list, "tasks", &[t0, t1]).expect("unrelate");
        session.sync(&mut graph);
        assert_eq!(removed, vec![t0, t1]);
        for task in [t0, t1] {
            assert!(session.is_unwatched(task));
            assert_eq!(session.get(task).expect("task").parent(), None);
        }
        assert!(session.get(coll).expect("coll").children().is_empty());
    }

    #[test]
    fn detached_dirty_member_stays_pending() {
        let mut graph = graph();
        let list = graph.load("list", fields([("id", 1_i64)])).expect("list");
        let task = graph
            .load("task", fields([("id", 5_i64), ("list_id", 1_i64)]))
            .expect("task");
        let mut session = Session::new(SessionId(0));
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("watch");
        let draft = graph.create("task", fields([("list_id", 1_i64)])).expect("draft");
        session.sync(&mut graph);
        assert!(session.is_watching(draft));

        graph.set_field(task, "name", FieldValue::text("edited")).expect("edit");
        session.save_model(&mut graph, task, Cascade::LOCAL).expect("mark");
        session.save_model(&mut graph, draft, Cascade::LOCAL).expect("mark draft");
        graph.set_field(task, "list_id", FieldValue::Null).expect("detach");
        graph.set_field(draft, "list_id", FieldValue::Null).expect("detach draft");
        session.sync(&mut graph);

        for entity in [task, draft] {
            assert!(session.is_unwatched(entity));
            assert!(session.get(entity).expect("entity").is_dirty());
        }
        let mut changed = session.get_changed(&graph, true);
        changed.sort();
        assert_eq!(changed, vec![task, draft]);
    }
}
