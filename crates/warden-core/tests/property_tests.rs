//! # Property-Based Tests
//!
//! Rollback and flush invariants under arbitrary edit sequences.

use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use warden_core::{
    Cascade, EntityId, FieldValue, Fields, MemoryPersistence, ModelDef, RelationDef,
    RelationSpec, SessionId, Workspace, fields,
};

const LISTS: usize = 2;
const TASKS: usize = 4;

#[derive(Debug, Clone)]
enum Edit {
    Rename(usize, String),
    Move(usize, usize),
    Detach(usize),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0..TASKS, "[a-z]{1,6}").prop_map(|(t, name)| Edit::Rename(t, name)),
        (0..TASKS, 0..LISTS).prop_map(|(t, l)| Edit::Move(t, l)),
        (0..TASKS).prop_map(Edit::Detach),
    ]
}

struct Fixture {
    ws: Workspace,
    session: SessionId,
    lists: Vec<EntityId>,
    tasks: Vec<EntityId>,
}

/// Two watched lists; tasks spread across them round-robin.
fn fixture() -> Fixture {
    let mut ws = Workspace::new(Arc::new(MemoryPersistence::new()));
    ws.define_model(ModelDef::new("list").relation("tasks", RelationDef::has_many("task", "list_id")))
        .expect("list");
    ws.define_model(
        ModelDef::new("task")
            .fields(["name", "list_id"])
            .relation("list", RelationDef::belongs_to("list", "list_id")),
    )
    .expect("task");

    let lists: Vec<EntityId> = (0..LISTS as i64)
        .map(|n| ws.load("list", fields([("id", n)])).expect("list"))
        .collect();
    let tasks: Vec<EntityId> = (0..TASKS as i64)
        .map(|n| {
            ws.load(
                "task",
                fields([
                    ("id", FieldValue::Int(100 + n)),
                    ("name", FieldValue::text(format!("t{n}"))),
                    ("list_id", FieldValue::Int(n % LISTS as i64)),
                ]),
            )
            .expect("task")
        })
        .collect();

    let session = ws.open_session();
    ws.scope(session)
        .expect("scope")
        .watch_many(lists.iter().copied(), &RelationSpec::of(["tasks"]))
        .expect("watch");
    Fixture {
        ws,
        session,
        lists,
        tasks,
    }
}

fn apply(fx: &mut Fixture, edit: &Edit) {
    match edit {
        Edit::Rename(t, name) => fx.ws.set_field(fx.tasks[*t], "name", name.as_str()).expect("rename"),
        Edit::Move(t, l) => {
            let key = fx.ws.graph().get_entity(fx.lists[*l]).expect("list").key();
            fx.ws.set_field(fx.tasks[*t], "list_id", key).expect("move");
        }
        Edit::Detach(t) => fx.ws.set_field(fx.tasks[*t], "list_id", FieldValue::Null).expect("detach"),
    }
}

fn task_fields(fx: &Fixture) -> Vec<Fields> {
    fx.tasks
        .iter()
        .map(|t| fx.ws.graph().get_entity(*t).expect("task").fields().clone())
        .collect()
}

fn memberships(fx: &Fixture) -> Vec<BTreeSet<EntityId>> {
    fx.lists
        .iter()
        .map(|l| {
            let coll = fx.ws.graph().plural(*l, "tasks").expect("coll");
            fx.ws
                .graph()
                .get_collection(coll)
                .expect("coll")
                .members()
                .iter()
                .copied()
                .collect()
        })
        .collect()
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Discard after any edit sequence restores fields and memberships and
    /// leaves nothing pending.
    #[test]
    fn discard_restores_everything(edits in vec(edit(), 1..24)) {
        let mut fx = fixture();
        let fields_before = task_fields(&fx);
        let members_before = memberships(&fx);

        for edit in &edits {
            apply(&mut fx, edit);
        }
        fx.ws.scope(fx.session).expect("scope").discard().expect("discard");

        prop_assert_eq!(task_fields(&fx), fields_before);
        prop_assert_eq!(memberships(&fx), members_before);
        let session = fx.ws.session(fx.session).expect("session");
        prop_assert!(!session.has_changes(fx.ws.graph(), false));
        for task in &fx.tasks {
            prop_assert!(session.is_watching(*task));
        }
    }

    /// Every task stays in at most one list whatever the edits.
    #[test]
    fn membership_is_exclusive(edits in vec(edit(), 1..24)) {
        let mut fx = fixture();
        for edit in &edits {
            apply(&mut fx, edit);
        }
        let lists = memberships(&fx);
        for task in &fx.tasks {
            let holders = lists.iter().filter(|m| m.contains(task)).count();
            prop_assert!(holders <= 1);
        }
    }

    /// Saving every edited task leaves a clean session whose snapshots match
    /// the live fields.
    #[test]
    fn save_clears_changes(edits in vec(edit(), 1..16)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let mut fx = fixture();
        for edit in &edits {
            apply(&mut fx, edit);
        }

        let mut scope = fx.ws.scope(fx.session).expect("scope");
        for task in &fx.tasks {
            scope.save_model(*task, Cascade::LOCAL).expect("mark");
        }
        runtime.block_on(scope.save(false)).expect("flush");

        let session = fx.ws.session(fx.session).expect("session");
        prop_assert!(!session.has_changes(fx.ws.graph(), false));
        for task in &fx.tasks {
            let Some(watch) = session.get(*task) else {
                continue;
            };
            let snapshot = watch.snapshot().expect("snapshot");
            prop_assert_eq!(&snapshot.fields, fx.ws.graph().get_entity(*task).expect("task").fields());
        }
    }
}
