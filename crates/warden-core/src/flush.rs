//! # Flush
//!
//! Commits a session's pending changes in three steps:
//!
//! 1. [`Session::begin_save`] checks the session can flush, validates when
//!    required, and freezes one [`FlushOp`] per dirty or removing entity.
//!    The session is `Saving` from here on.
//! 2. [`FlushPlan::execute`] runs every operation concurrently, with no
//!    ordering between them, and joins all outcomes.
//! 3. [`Session::finish_save`] applies each outcome and returns the session
//!    to `Active`.
//!
//! A failed operation leaves its watch untouched, so the next flush retries
//! it. Operations that succeeded are never rolled back.

use crate::events::SessionEvent;
use crate::graph::{Entity, Graph};
use crate::persistence::{PersistOp, PersistRequest, Persistence};
use crate::session::SessionStatus;
use crate::watch::Membership;
use crate::{EntityId, EntityStatus, Fields, ObjectKey, Session, SessionId, WardenError};
use std::sync::Arc;
use tokio::task::JoinSet;

type OpResult = Result<Option<Fields>, WardenError>;

// =============================================================================
// PLAN
// =============================================================================

/// One persistence call of a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOp {
    pub op: PersistOp,
    pub request: PersistRequest,
    /// Entity status before the flush; restored if the call fails.
    pub prior: EntityStatus,
}

impl FlushOp {
    async fn run(&self, persistence: &dyn Persistence) -> OpResult {
        match self.op {
            PersistOp::Create => persistence.create(&self.request).await.map(Some),
            PersistOp::Update => persistence.update(&self.request).await.map(Some),
            PersistOp::Delete => persistence.delete(&self.request).await.map(|()| None),
        }
    }
}

/// The frozen set of operations of one flush.
#[derive(Debug)]
#[must_use = "a flush plan does nothing until executed and finished"]
pub struct FlushPlan {
    session: SessionId,
    ops: Vec<FlushOp>,
}

impl FlushPlan {
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[must_use]
    pub fn ops(&self) -> &[FlushOp] {
        &self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Run every operation and wait for all of them.
    ///
    /// `concurrency` caps the calls in flight; `0` means unbounded. Each
    /// completion decrements a pending counter; the join ends when it
    /// reaches zero.
    pub async fn execute(self, persistence: Arc<dyn Persistence>, concurrency: usize) -> FlushOutcome {
        let limit = if concurrency == 0 { usize::MAX } else { concurrency };
        let mut slots: Vec<Option<OpResult>> = self.ops.iter().map(|_| None).collect();
        let mut queued = self.ops.iter().cloned().enumerate();
        let mut tasks = JoinSet::new();
        let mut pending = 0_usize;

        loop {
            while pending < limit {
                let Some((index, op)) = queued.next() else {
                    break;
                };
                let persistence = Arc::clone(&persistence);
                tasks.spawn(async move { (index, op.run(persistence.as_ref()).await) });
                pending += 1;
            }
            if pending == 0 {
                break;
            }
            match tasks.join_next().await {
                Some(Ok((index, result))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(result);
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(session = self.session.0, error = %err, "persistence task aborted");
                }
                None => break,
            }
            pending -= 1;
        }

        let results = self
            .ops
            .into_iter()
            .zip(slots)
            .map(|(op, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(WardenError::Persistence("operation did not complete".to_string()))
                });
                (op, result)
            })
            .collect();
        FlushOutcome {
            session: self.session,
            results,
        }
    }
}

/// Every operation of a plan paired with its result.
#[derive(Debug)]
pub struct FlushOutcome {
    session: SessionId,
    results: Vec<(FlushOp, OpResult)>,
}

impl FlushOutcome {
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[must_use]
    pub fn results(&self) -> &[(FlushOp, OpResult)] {
        &self.results
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// A rejected persistence call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOp {
    pub entity: EntityId,
    pub op: PersistOp,
    pub error: String,
}

/// What a flush did, per entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: Vec<EntityId>,
    pub removed: Vec<EntityId>,
    pub failed: Vec<FailedOp>,
}

impl FlushReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.saved.len() + self.removed.len() + self.failed.len()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Entities whose operation failed.
    #[must_use]
    pub fn failed_entities(&self) -> Vec<EntityId> {
        self.failed.iter().map(|f| f.entity).collect()
    }
}

// =============================================================================
// SESSION PROTOCOL
// =============================================================================

impl Session {
    /// Start a flush.
    ///
    /// Rejects without side effects when the session is not active, when a
    /// flush is already in flight, or when validation is required and fails
    /// (`full_validate` checks every entity instead of stopping at the first
    /// invalid one).
    pub fn begin_save(&mut self, graph: &mut Graph, full_validate: bool) -> Result<FlushPlan, WardenError> {
        match self.status() {
            SessionStatus::Active => {}
            SessionStatus::Saving => return Err(WardenError::SaveInFlight),
            other => return Err(WardenError::SessionNotActive(other)),
        }
        self.sync(graph);

        if self.validation_required() {
            let invalid = self.invalid_entities(graph, !full_validate);
            if !invalid.is_empty() {
                self.emit(SessionEvent::Invalid);
                tracing::warn!(session = self.id().0, invalid = invalid.len(), "flush rejected by validation");
                return Err(WardenError::ValidationFailed { invalid });
            }
            self.emit(SessionEvent::Valid);
        }

        let mut ops = Vec::new();
        for watch in self.watches.values() {
            let Some(id) = watch.entity() else {
                continue;
            };
            let entity = graph.get_entity(id)?;
            let op = match watch.membership() {
                Membership::Watching | Membership::Unwatched if watch.is_dirty() => {
                    if entity.is_persisted() {
                        PersistOp::Update
                    } else {
                        PersistOp::Create
                    }
                }
                Membership::Removing if entity.status() == EntityStatus::RemovePending => {
                    PersistOp::Delete
                }
                _ => continue,
            };
            ops.push(FlushOp {
                op,
                request: PersistRequest::for_entity(entity, watch.cascade()),
                prior: entity.status(),
            });
        }
        for op in ops.iter().filter(|op| op.op != PersistOp::Delete) {
            graph.set_status(op.request.entity, EntityStatus::SavePending)?;
        }
        self.in_flight = ops
            .iter()
            .filter(|op| op.op != PersistOp::Delete)
            .map(|op| (op.request.entity, op.prior))
            .collect();

        self.set_status(SessionStatus::Saving);
        self.emit(SessionEvent::SaveStart);
        tracing::info!(session = self.id().0, ops = ops.len(), "flush started");
        Ok(FlushPlan {
            session: self.id(),
            ops,
        })
    }

    /// Apply a flush outcome and return to `Active`.
    ///
    /// Fails with [`WardenError::FlushFailed`] listing every rejected
    /// operation; the rest of the report is still applied.
    pub fn finish_save(&mut self, graph: &mut Graph, outcome: FlushOutcome) -> Result<FlushReport, WardenError> {
        if outcome.session != self.id() {
            return Err(WardenError::Conflict(format!(
                "flush of session {} finished on session {}",
                outcome.session.0,
                self.id().0
            )));
        }
        self.sync(graph);
        self.in_flight.clear();

        let mut report = FlushReport::default();
        for (op, result) in outcome.results {
            let id = op.request.entity;
            let key = ObjectKey::Entity(id);
            // Deleted outside the session while the call was running.
            if graph.entity(id).is_none_or(Entity::is_deleted) {
                continue;
            }
            match result {
                Ok(persisted) => {
                    if op.op == PersistOp::Delete {
                        graph.mark_deleted(id)?;
                        self.destroy_watch(graph, key);
                        report.removed.push(id);
                        continue;
                    }
                    let fields = persisted.unwrap_or_else(|| op.request.fields.clone());
                    graph.mark_persisted(id, fields.clone())?;
                    if op.op == PersistOp::Create {
                        graph.index_put(id)?;
                    }
                    match self.membership(key) {
                        Some(Membership::Watching) => {
                            if let Some(watch) = self.watches.get_mut(&key) {
                                watch.save_state(graph, Some(fields))?;
                                watch.reset_save();
                                watch.indexed = false;
                            }
                        }
                        Some(Membership::Unwatched) => self.destroy_watch(graph, key),
                        Some(Membership::Removing) | None => {}
                    }
                    report.saved.push(id);
                }
                Err(err) => {
                    graph.set_status(id, op.prior)?;
                    tracing::warn!(
                        session = self.id().0,
                        entity = id.0,
                        op = ?op.op,
                        error = %err,
                        "persistence call failed"
                    );
                    report.failed.push(FailedOp {
                        entity: id,
                        op: op.op,
                        error: err.to_string(),
                    });
                }
            }
        }

        if self.is_saving() {
            self.set_status(SessionStatus::Active);
        }
        self.sync(graph);

        if report.is_success() {
            self.emit(SessionEvent::SaveSuccess);
            tracing::info!(
                session = self.id().0,
                saved = report.saved.len(),
                removed = report.removed.len(),
                "flush succeeded"
            );
            Ok(report)
        } else {
            self.emit(SessionEvent::SaveFailure);
            tracing::warn!(
                session = self.id().0,
                failed = report.failed.len(),
                total = report.total(),
                "flush failed"
            );
            Err(WardenError::FlushFailed(Box::new(report)))
        }
    }

    /// Abandon a flush whose outcome will never be finished, e.g. a dropped
    /// [`FlushPlan`] or a cancelled save.
    ///
    /// Entities the flush marked `SavePending` get their prior status back and
    /// stay dirty, so the next flush retries them. Calls that already reached
    /// the store are not undone. Does nothing when no flush is running.
    pub fn abort_save(&mut self, graph: &mut Graph) -> Result<(), WardenError> {
        let in_flight = std::mem::take(&mut self.in_flight);
        if !self.is_saving() && in_flight.is_empty() {
            return Ok(());
        }
        for (id, prior) in in_flight {
            if graph
                .entity(id)
                .is_some_and(|e| e.status() == EntityStatus::SavePending)
            {
                graph.set_status(id, prior)?;
            }
        }
        if self.is_saving() {
            self.set_status(SessionStatus::Active);
        }
        self.emit(SessionEvent::SaveFailure);
        tracing::warn!(session = self.id().0, "flush aborted");
        self.sync(graph);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::{Cascade, FieldValue};
    use std::time::Duration;

    fn plan(count: i64) -> FlushPlan {
        let ops = (0..count)
            .map(|key| FlushOp {
                op: PersistOp::Create,
                request: PersistRequest {
                    entity: EntityId(key as u64),
                    model: "task".to_string(),
                    key: FieldValue::Int(key),
                    fields: Fields::new(),
                    cascade: Cascade::ALL,
                },
                prior: EntityStatus::New,
            })
            .collect();
        FlushPlan {
            session: SessionId(0),
            ops,
        }
    }

    #[tokio::test]
    async fn execute_joins_every_operation() {
        let store = Arc::new(MemoryPersistence::new());
        store.fail_on("task", 3_i64).await;

        let outcome = plan(5).execute(store.clone(), 0).await;

        assert_eq!(outcome.results().len(), 5);
        let failed: Vec<i64> = outcome
            .results()
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(op, _)| op.request.entity.0 as i64)
            .collect();
        assert_eq!(failed, vec![3]);
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn execute_respects_concurrency_limit() {
        let store = Arc::new(MemoryPersistence::new().with_latency(Duration::from_millis(10)));
        let outcome = plan(6).execute(store.clone(), 2).await;
        assert!(outcome.results().iter().all(|(_, r)| r.is_ok()));
        assert_eq!(store.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn empty_plan_completes_immediately() {
        let store: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let outcome = plan(0).execute(store, 4).await;
        assert!(outcome.results().is_empty());
    }

    #[test]
    fn report_counts_everything() {
        let report = FlushReport {
            saved: vec![EntityId(1)],
            removed: vec![EntityId(2)],
            failed: vec![FailedOp {
                entity: EntityId(3),
                op: PersistOp::Update,
                error: "boom".to_string(),
            }],
        };
        assert_eq!(report.total(), 3);
        assert!(!report.is_success());
        assert_eq!(report.failed_entities(), vec![EntityId(3)]);
    }
}
