//! # redb-backed Persistence
//!
//! Stores one record per `(model, key)` in a redb embedded database.
//!
//! - ACID transactions, one write transaction per call
//! - Crash safety (copy-on-write B-trees)
//! - Records are postcard-encoded
//!
//! redb is synchronous, so every call runs on the blocking pool and the
//! flush tasks driving it never stall the runtime.

use crate::persistence::{Persistence, PersistRequest};
use crate::{FieldValue, Fields, WardenError};
use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Table for records: postcard `(model, key)` -> postcard [`StoredRecord`].
const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    model: String,
    key: FieldValue,
    fields: Fields,
}

fn io(e: impl std::fmt::Display) -> WardenError {
    WardenError::Io(e.to_string())
}

fn codec(e: impl std::fmt::Display) -> WardenError {
    WardenError::Serialization(e.to_string())
}

fn record_key(model: &str, key: &FieldValue) -> Result<Vec<u8>, WardenError> {
    postcard::to_allocvec(&(model, key)).map_err(codec)
}

/// Persistence backed by a redb database file.
#[derive(Clone)]
pub struct RedbPersistence {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbPersistence").finish_non_exhaustive()
    }
}

impl RedbPersistence {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        let db = Database::create(path.as_ref()).map_err(io)?;
        let txn = db.begin_write().map_err(io)?;
        let _ = txn.open_table(RECORDS).map_err(io)?;
        txn.commit().map_err(io)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Stored fields for a record, if present.
    pub fn get(&self, model: &str, key: &FieldValue) -> Result<Option<Fields>, WardenError> {
        let id = record_key(model, key)?;
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(RECORDS).map_err(io)?;
        let Some(bytes) = table.get(id.as_slice()).map_err(io)? else {
            return Ok(None);
        };
        let record: StoredRecord = postcard::from_bytes(bytes.value()).map_err(codec)?;
        Ok(Some(record.fields))
    }

    pub fn len(&self) -> Result<u64, WardenError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(RECORDS).map_err(io)?;
        table.len().map_err(io)
    }

    pub fn is_empty(&self) -> Result<bool, WardenError> {
        Ok(self.len()? == 0)
    }

    /// Run a write on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T, WardenError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, WardenError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || work(&db))
            .await
            .map_err(|e| WardenError::Persistence(format!("storage task failed: {e}")))?
    }

    async fn write(&self, request: &PersistRequest, must_be_new: bool) -> Result<Fields, WardenError> {
        let id = record_key(&request.model, &request.key)?;
        let record = StoredRecord {
            model: request.model.clone(),
            key: request.key.clone(),
            fields: request.fields.clone(),
        };
        let bytes = postcard::to_allocvec(&record).map_err(codec)?;
        let label = format!("{} {}", request.model, request.key);

        self.blocking(move |db| {
            let txn = db.begin_write().map_err(io)?;
            {
                let mut table = txn.open_table(RECORDS).map_err(io)?;
                if must_be_new && table.get(id.as_slice()).map_err(io)?.is_some() {
                    return Err(WardenError::Persistence(format!("{label} already exists")));
                }
                table.insert(id.as_slice(), bytes.as_slice()).map_err(io)?;
            }
            txn.commit().map_err(io)?;
            Ok(())
        })
        .await?;
        tracing::debug!(model = %request.model, key = %request.key, "record written");
        Ok(record.fields)
    }
}

#[async_trait]
impl Persistence for RedbPersistence {
    async fn create(&self, request: &PersistRequest) -> Result<Fields, WardenError> {
        self.write(request, true).await
    }

    async fn update(&self, request: &PersistRequest) -> Result<Fields, WardenError> {
        self.write(request, false).await
    }

    async fn delete(&self, request: &PersistRequest) -> Result<(), WardenError> {
        let id = record_key(&request.model, &request.key)?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(io)?;
            {
                let mut table = txn.open_table(RECORDS).map_err(io)?;
                table.remove(id.as_slice()).map_err(io)?;
            }
            txn.commit().map_err(io)?;
            Ok(())
        })
        .await?;
        tracing::debug!(model = %request.model, key = %request.key, "record deleted");
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
