//! # Persistence
//!
//! The backing-store capability a flush drives, and an in-memory backend.
//!
//! A backend receives one [`PersistRequest`] per operation. Calls for
//! different entities may run concurrently and in any order.

use crate::graph::Entity;
use crate::{Cascade, EntityId, FieldValue, Fields, WardenError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Kind of a persistence call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PersistOp {
    Create,
    Update,
    Delete,
}

/// Everything a backend needs to persist one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistRequest {
    pub entity: EntityId,
    pub model: String,
    pub key: FieldValue,
    pub fields: Fields,
    pub cascade: Cascade,
}

impl PersistRequest {
    #[must_use]
    pub fn for_entity(entity: &Entity, cascade: Cascade) -> Self {
        Self {
            entity: entity.id(),
            model: entity.model().to_string(),
            key: entity.key(),
            fields: entity.fields().clone(),
            cascade,
        }
    }
}

/// Asynchronous create/update/delete against a backing store.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Persist a new entity; returns the fields as stored.
    async fn create(&self, request: &PersistRequest) -> Result<Fields, WardenError>;

    /// Persist changes to an existing entity; returns the fields as stored.
    async fn update(&self, request: &PersistRequest) -> Result<Fields, WardenError>;

    async fn delete(&self, request: &PersistRequest) -> Result<(), WardenError>;
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistCall {
    pub op: PersistOp,
    pub model: String,
    pub key: FieldValue,
}

type RecordKey = (String, FieldValue);

/// In-memory backend with a call log and per-key failure injection.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<BTreeMap<RecordKey, Fields>>,
    calls: Mutex<Vec<PersistCall>>,
    failing: Mutex<BTreeSet<RecordKey>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, so concurrent calls overlap.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject every call for this record until [`heal`](Self::heal).
    pub async fn fail_on(&self, model: &str, key: impl Into<FieldValue>) {
        self.failing
            .lock()
            .await
            .insert((model.to_string(), key.into()));
    }

    pub async fn heal(&self, model: &str, key: impl Into<FieldValue>) {
        self.failing
            .lock()
            .await
            .remove(&(model.to_string(), key.into()));
    }

    pub async fn calls(&self) -> Vec<PersistCall> {
        self.calls.lock().await.clone()
    }

    pub async fn record(&self, model: &str, key: impl Into<FieldValue>) -> Option<Fields> {
        self.records
            .lock()
            .await
            .get(&(model.to_string(), key.into()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Most calls observed in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: PersistOp, request: &PersistRequest) -> Result<RecordKey, WardenError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.peak.fetch_max(current, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().await.push(PersistCall {
            op,
            model: request.model.clone(),
            key: request.key.clone(),
        });
        let key = (request.model.clone(), request.key.clone());
        if self.failing.lock().await.contains(&key) {
            return Err(WardenError::Persistence(format!(
                "{op:?} rejected for {} {}",
                request.model, request.key
            )));
        }
        Ok(key)
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn create(&self, request: &PersistRequest) -> Result<Fields, WardenError> {
        let key = self.enter(PersistOp::Create, request).await?;
        self.records.lock().await.insert(key, request.fields.clone());
        Ok(request.fields.clone())
    }

    async fn update(&self, request: &PersistRequest) -> Result<Fields, WardenError> {
        let key = self.enter(PersistOp::Update, request).await?;
        self.records.lock().await.insert(key, request.fields.clone());
        Ok(request.fields.clone())
    }

    async fn delete(&self, request: &PersistRequest) -> Result<(), WardenError> {
        let key = self.enter(PersistOp::Delete, request).await?;
        self.records.lock().await.remove(&key);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    fn request(key: i64) -> PersistRequest {
        PersistRequest {
            entity: EntityId(0),
            model: "task".to_string(),
            key: FieldValue::Int(key),
            fields: fields([("id", key)]),
            cascade: Cascade::ALL,
        }
    }

    #[tokio::test]
    async fn stores_and_deletes_records() {
        let store = MemoryPersistence::new();
        store.create(&request(1)).await.expect("create");
        store.update(&request(1)).await.expect("update");
        assert_eq!(store.record("task", 1_i64).await, Some(fields([("id", 1_i64)])));

        store.delete(&request(1)).await.expect("delete");
        assert!(store.is_empty().await);
        let ops: Vec<PersistOp> = store.calls().await.into_iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![PersistOp::Create, PersistOp::Update, PersistOp::Delete]);
    }

    #[tokio::test]
    async fn injected_failure_until_healed() {
        let store = MemoryPersistence::new();
        store.fail_on("task", 2_i64).await;
        assert!(matches!(
            store.create(&request(2)).await,
            Err(WardenError::Persistence(_))
        ));
        assert!(store.record("task", 2_i64).await.is_none());

        store.heal("task", 2_i64).await;
        store.create(&request(2)).await.expect("create");
        assert_eq!(store.len().await, 1);
    }
}
