//! # warden-core
//!
//! Unit-of-work change tracking over a live, in-process entity graph.
//!
//! A [`Session`] watches entities and collections, snapshots their state,
//! follows relation changes made directly on the [`Graph`], and turns
//! save/remove requests into pending work. Nothing reaches the backing store
//! until the session flushes; a discard rolls everything back synchronously.
//!
//! ## Layout
//!
//! - `graph`: the live object graph, local index, listeners and outbox
//! - `session` / `watch` / `bridge`: tracking, snapshots, relation listeners
//! - `flush` / `persistence` / `storage`: the split flush and its backends
//! - `workspace`: owner of graph, sessions and store; the entity façade
//!
//! ## Constraints
//!
//! - Deterministic: every map is a `BTreeMap`, every walk is ordered
//! - No closure captures a session; listeners are data, routed through the
//!   graph's outbox
//! - One flush in flight per session

// =============================================================================
// MODULES
// =============================================================================

pub mod bridge;
pub mod config;
pub mod events;
pub mod flush;
pub mod graph;
pub mod persistence;
pub mod relations;
pub mod schema;
pub mod search;
pub mod session;
pub mod storage;
pub mod types;
pub mod watch;
pub mod workspace;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Cascade, CollectionId, EntityId, EntityStatus, FieldValue, Fields, ObjectKey, SessionId,
    SubscriptionId, WardenError, fields,
};

// =============================================================================
// RE-EXPORTS: Graph & Schema
// =============================================================================

pub use events::{GraphEvent, IndexEvent, SessionEvent};
pub use graph::{Collection, Entity, EntityValidator, Graph, RequiredFields, Slot};
pub use relations::RelationSpec;
pub use schema::{ModelDef, RelationBehavior, RelationDef, RelationKind};

// =============================================================================
// RE-EXPORTS: Sessions & Flush
// =============================================================================

pub use flush::{FailedOp, FlushOutcome, FlushPlan, FlushReport};
pub use session::{Session, SessionStatus};
pub use watch::{Membership, Watch};

// =============================================================================
// RE-EXPORTS: Persistence & Workspace
// =============================================================================

pub use config::WorkspaceConfig;
pub use persistence::{MemoryPersistence, PersistCall, PersistOp, PersistRequest, Persistence};
pub use storage::RedbPersistence;
pub use workspace::{SessionScope, Workspace};
