//! # Events
//!
//! Change events emitted by the live graph, the listener table that routes
//! them to watches, and the notification types sessions and the local index
//! publish.
//!
//! Listeners are plain data records `(session, watch, kind)`. The graph
//! matches each event against them and queues a [`Notification`] per match;
//! the owning session's relation bridge consumes the queue. No closure ever
//! captures a session.

use crate::{CollectionId, EntityId, ObjectKey, SessionId, SubscriptionId};
use std::collections::BTreeMap;

// =============================================================================
// GRAPH EVENTS
// =============================================================================

/// A structural change to the live graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// A singular relation now points somewhere else.
    RelationUpdate {
        entity: EntityId,
        relation: String,
        previous: Option<EntityId>,
        current: Option<EntityId>,
    },
    Added {
        collection: CollectionId,
        entity: EntityId,
    },
    AddedMany {
        collection: CollectionId,
        entities: Vec<EntityId>,
    },
    Removed {
        collection: CollectionId,
        entity: EntityId,
    },
    RemovedMany {
        collection: CollectionId,
        entities: Vec<EntityId>,
    },
    Reset {
        collection: CollectionId,
    },
    Cleared {
        collection: CollectionId,
    },
}

impl GraphEvent {
    /// The object that emitted this event.
    #[must_use]
    pub fn source(&self) -> ObjectKey {
        match self {
            Self::RelationUpdate { entity, .. } => ObjectKey::Entity(*entity),
            Self::Added { collection, .. }
            | Self::AddedMany { collection, .. }
            | Self::Removed { collection, .. }
            | Self::RemovedMany { collection, .. }
            | Self::Reset { collection }
            | Self::Cleared { collection } => ObjectKey::Collection(*collection),
        }
    }
}

/// Which event a listener reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerKind {
    /// Foreign-key change on the named singular relation.
    RelationUpdate(String),
    Add,
    Adds,
    Remove,
    Removes,
    Reset,
    Cleared,
}

impl ListenerKind {
    /// The six listeners a watched collection registers.
    pub const COLLECTION: [ListenerKind; 6] = [
        ListenerKind::Add,
        ListenerKind::Adds,
        ListenerKind::Reset,
        ListenerKind::Remove,
        ListenerKind::Removes,
        ListenerKind::Cleared,
    ];

    #[must_use]
    pub fn matches(&self, event: &GraphEvent) -> bool {
        match (self, event) {
            (Self::RelationUpdate(name), GraphEvent::RelationUpdate { relation, .. }) => {
                name == relation
            }
            (Self::Add, GraphEvent::Added { .. })
            | (Self::Adds, GraphEvent::AddedMany { .. })
            | (Self::Remove, GraphEvent::Removed { .. })
            | (Self::Removes, GraphEvent::RemovedMany { .. })
            | (Self::Reset, GraphEvent::Reset { .. })
            | (Self::Cleared, GraphEvent::Cleared { .. }) => true,
            _ => false,
        }
    }
}

/// A routed event: `event` fired on an object `watch` of `session` listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub session: SessionId,
    pub watch: ObjectKey,
    pub event: GraphEvent,
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Token for one listener registration.
///
/// Released exactly once through [`Graph::release`](crate::Graph::release).
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a subscription must be released when its watch is torn down"]
pub struct Subscription {
    id: SubscriptionId,
    object: ObjectKey,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn object(&self) -> ObjectKey {
        self.object
    }
}

#[derive(Debug, Clone)]
struct Listener {
    id: SubscriptionId,
    session: SessionId,
    watch: ObjectKey,
    kind: ListenerKind,
}

/// Object -> registered listeners.
#[derive(Debug, Default)]
pub(crate) struct ListenerTable {
    by_object: BTreeMap<ObjectKey, Vec<Listener>>,
    next_id: u64,
}

impl ListenerTable {
    pub(crate) fn subscribe(
        &mut self,
        object: ObjectKey,
        session: SessionId,
        kind: ListenerKind,
    ) -> Subscription {
        let id = SubscriptionId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.by_object.entry(object).or_default().push(Listener {
            id,
            session,
            watch: object,
            kind,
        });
        Subscription { id, object }
    }

    pub(crate) fn release(&mut self, subscription: Subscription) {
        if let Some(listeners) = self.by_object.get_mut(&subscription.object) {
            listeners.retain(|l| l.id != subscription.id);
            if listeners.is_empty() {
                self.by_object.remove(&subscription.object);
            }
        }
    }

    /// Notifications for every listener matching `event`, in registration order.
    pub(crate) fn route(&self, event: &GraphEvent) -> Vec<Notification> {
        self.by_object
            .get(&event.source())
            .map(|listeners| {
                listeners
                    .iter()
                    .filter(|l| l.kind.matches(event))
                    .map(|l| Notification {
                        session: l.session,
                        watch: l.watch,
                        event: event.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, object: ObjectKey) -> usize {
        self.by_object.get(&object).map_or(0, Vec::len)
    }
}

// =============================================================================
// PUBLISHED NOTIFICATIONS
// =============================================================================

/// Change to the process-local entity index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    Added { model: String, entity: EntityId },
    Updated { model: String, entity: EntityId },
    Removed { model: String, entity: EntityId },
}

/// Session lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SaveStart,
    SaveSuccess,
    SaveFailure,
    Discard,
    Valid,
    Invalid,
    /// A never-persisted entity was marked for create.
    CreateAndSave(EntityId),
    /// A persisted entity was marked for update.
    UpdateAndSave(EntityId),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn added(collection: u64, entity: u64) -> GraphEvent {
        GraphEvent::Added {
            collection: CollectionId(collection),
            entity: EntityId(entity),
        }
    }

    #[test]
    fn route_matches_kind_and_source() {
        let mut table = ListenerTable::default();
        let coll = ObjectKey::Collection(CollectionId(1));
        let _add = table.subscribe(coll, SessionId(0), ListenerKind::Add);
        let _reset = table.subscribe(coll, SessionId(0), ListenerKind::Reset);

        let routed = table.route(&added(1, 7));
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].watch, coll);

        assert!(table.route(&added(2, 7)).is_empty());
    }

    #[test]
    fn relation_update_matches_by_name() {
        let kind = ListenerKind::RelationUpdate("list".to_string());
        let event = GraphEvent::RelationUpdate {
            entity: EntityId(1),
            relation: "list".to_string(),
            previous: None,
            current: Some(EntityId(2)),
        };
        assert!(kind.matches(&event));
        assert!(!ListenerKind::RelationUpdate("owner".to_string()).matches(&event));
    }

    #[test]
    fn release_removes_only_that_listener() {
        let mut table = ListenerTable::default();
        let coll = ObjectKey::Collection(CollectionId(1));
        let first = table.subscribe(coll, SessionId(0), ListenerKind::Add);
        let _second = table.subscribe(coll, SessionId(1), ListenerKind::Add);
        assert_eq!(table.count(coll), 2);

        table.release(first);
        assert_eq!(table.count(coll), 1);
        assert_eq!(table.route(&added(1, 3))[0].session, SessionId(1));
    }
}
