//! # Search Helpers
//!
//! Newest-first scans over one membership set of a session, stopping at the
//! first callback that returns `Some`.

use crate::watch::{Membership, Watch};
use crate::{EntityId, Session};

impl Session {
    /// Watches of `membership`, most recently (re)entered first.
    fn newest_first(&self, membership: Membership) -> Vec<&Watch> {
        let mut watches: Vec<&Watch> = self.watches_in(membership).collect();
        watches.sort_by(|a, b| b.since.cmp(&a.since).then_with(|| b.key().cmp(&a.key())));
        watches
    }

    /// Visit every watch in `membership`; return the first `Some` result or
    /// `default`.
    pub fn search_any<T, F>(&self, membership: Membership, default: T, mut visit: F) -> T
    where
        F: FnMut(&Watch) -> Option<T>,
    {
        self.newest_first(membership)
            .into_iter()
            .find_map(|watch| visit(watch))
            .unwrap_or(default)
    }

    /// Like [`search_any`](Self::search_any) but visits entity watches only.
    pub fn search_models<T, F>(&self, membership: Membership, default: T, mut visit: F) -> T
    where
        F: FnMut(EntityId, &Watch) -> Option<T>,
    {
        self.newest_first(membership)
            .into_iter()
            .find_map(|watch| watch.entity().and_then(|id| visit(id, watch)))
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use crate::relations::RelationSpec;
    use crate::schema::{ModelDef, RelationDef};
    use crate::watch::Membership;
    use crate::{Graph, ObjectKey, Session, SessionId, fields};

    #[test]
    fn newest_watch_is_visited_first() {
        let mut graph = Graph::new();
        graph
            .define_model(ModelDef::new("list").relation("tasks", RelationDef::has_many("task", "list_id")))
            .expect("list");
        graph.define_model(ModelDef::new("task")).expect("task");
        let first = graph.load("task", fields([("id", 1_i64)])).expect("first");
        let second = graph.load("task", fields([("id", 2_i64)])).expect("second");
        let list = graph.load("list", fields([("id", 9_i64)])).expect("list");

        let mut session = Session::new(SessionId(0));
        session.watch(&mut graph, second, &RelationSpec::none()).expect("second");
        session.watch(&mut graph, first, &RelationSpec::none()).expect("first");
        session
            .watch(&mut graph, list, &RelationSpec::of(["tasks"]))
            .expect("list");

        let newest_entity = session.search_models(Membership::Watching, None, |id, _| Some(Some(id)));
        assert_eq!(newest_entity, Some(list));

        let coll = graph.plural(list, "tasks").expect("coll");
        let newest_any = session.search_any(Membership::Watching, None, |w| Some(Some(w.key())));
        assert_eq!(newest_any, Some(ObjectKey::Collection(coll)));

        let visited = session.search_models(Membership::Watching, Vec::new(), |id, _| {
            (id == first).then(|| vec![id])
        });
        assert_eq!(visited, vec![first]);
        assert!(session.search_any(Membership::Removing, true, |_| Some(false)));
    }
}
