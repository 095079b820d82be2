//! # Storage Backends
//!
//! Disk-backed [`Persistence`](crate::persistence::Persistence) implementations.

mod redb_persistence;

pub use redb_persistence::RedbPersistence;
