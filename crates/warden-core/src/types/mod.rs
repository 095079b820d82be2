//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the Warden unit of work:
//! - Identity keys (`EntityId`, `CollectionId`, `ObjectKey`, `SessionId`)
//! - Field data (`FieldValue`, `Fields`)
//! - Lifecycle and policy enums (`EntityStatus`, `Cascade`)
//! - Error types (`WardenError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`

use crate::flush::FlushReport;
use crate::session::SessionStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Stable in-process identity of an entity.
///
/// Assigned by the [`Graph`](crate::Graph) arena and never reused, so it is
/// safe to key registries by it even after the entity is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Stable in-process identity of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(pub u64);

/// Identity of a session within a [`Workspace`](crate::Workspace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Identity of a single listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

/// Key of anything a session can watch.
///
/// Every watched object has exactly one `ObjectKey`; it is the key of the
/// session's watch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKey {
    Entity(EntityId),
    Collection(CollectionId),
}

impl ObjectKey {
    /// The entity behind this key, if it is one.
    #[must_use]
    pub const fn entity(self) -> Option<EntityId> {
        match self {
            Self::Entity(id) => Some(id),
            Self::Collection(_) => None,
        }
    }
}

impl From<EntityId> for ObjectKey {
    fn from(id: EntityId) -> Self {
        Self::Entity(id)
    }
}

impl From<CollectionId> for ObjectKey {
    fn from(id: CollectionId) -> Self {
        Self::Collection(id)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => write!(f, "entity#{}", id.0),
            Self::Collection(id) => write!(f, "collection#{}", id.0),
        }
    }
}

// =============================================================================
// FIELD VALUES
// =============================================================================

/// A single field value on an entity.
///
/// Closed and totally ordered so snapshots can be compared and stored in
/// ordered maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Create a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Field name -> value, ordered by name.
pub type Fields = BTreeMap<String, FieldValue>;

/// Build a `Fields` map from `(name, value)` pairs.
pub fn fields<K, V, I>(pairs: I) -> Fields
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Lifecycle status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityStatus {
    /// Created locally, never persisted.
    New,
    /// Matches the backing store.
    Synced,
    /// A create/update is in flight.
    SavePending,
    /// Deleted locally, delete not yet persisted.
    RemovePending,
    /// Deleted in the backing store.
    Deleted,
}

// =============================================================================
// CASCADE
// =============================================================================

/// Bitmask selecting how far a save/remove propagates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Cascade(pub u8);

impl Cascade {
    pub const NONE: Self = Self(0);
    pub const LOCAL: Self = Self(1);
    pub const REST: Self = Self(2);
    pub const LIVE: Self = Self(4);
    pub const REMOTE: Self = Self(2 | 4);
    pub const ALL: Self = Self(1 | 2 | 4);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse a cascade name (`none`, `local`, `rest`, `live`, `remote`, `all`)
    /// or a raw bitmask.
    pub fn parse(s: &str) -> Result<Self, WardenError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::NONE),
            "local" => Ok(Self::LOCAL),
            "rest" => Ok(Self::REST),
            "live" => Ok(Self::LIVE),
            "remote" => Ok(Self::REMOTE),
            "all" => Ok(Self::ALL),
            other => other
                .parse::<u8>()
                .ok()
                .filter(|bits| *bits <= Self::ALL.0)
                .map(Self)
                .ok_or_else(|| WardenError::Config(format!("invalid cascade: {s}"))),
        }
    }
}

impl BitOr for Cascade {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Cascade {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in Warden.
///
/// Structural and conflict errors are raised synchronously at the call site
/// and are fatal to that call only; the session stays usable.
#[derive(Debug, Error)]
pub enum WardenError {
    /// The object is not a live entity or collection.
    #[error("Not watchable: {0}")]
    Structural(String),

    /// Relation spec or session ownership conflict.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation failed while required.
    #[error("Validation failed for {} entities", invalid.len())]
    ValidationFailed { invalid: Vec<EntityId> },

    /// The session cannot flush in its current status.
    #[error("Session is not active: {0:?}")]
    SessionNotActive(SessionStatus),

    /// A previous flush has not completed.
    #[error("A save is already in flight")]
    SaveInFlight,

    /// Some persistence operations of a flush failed.
    #[error("Flush failed: {} of {} operations rejected", .0.failed.len(), .0.total())]
    FlushFailed(Box<FlushReport>),

    /// A single persistence call failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown relation {relation} on model {model}")]
    UnknownRelation { model: String, relation: String },

    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    #[error("Collection not found: {0:?}")]
    CollectionNotFound(CollectionId),

    #[error("Session not found: {0:?}")]
    SessionNotFound(SessionId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_merges_bitwise() {
        let mut cascade = Cascade::LOCAL;
        cascade |= Cascade::REST;
        assert_eq!(cascade, Cascade(3));
        assert!(cascade.contains(Cascade::LOCAL));
        assert!(!cascade.contains(Cascade::LIVE));
        assert_eq!(Cascade::REST | Cascade::LIVE, Cascade::REMOTE);
    }

    #[test]
    fn cascade_parses_names_and_bits() {
        assert_eq!(Cascade::parse("All").expect("parse"), Cascade::ALL);
        assert_eq!(Cascade::parse(" none ").expect("parse"), Cascade::NONE);
        assert_eq!(Cascade::parse("5").expect("parse"), Cascade(5));
        assert!(Cascade::parse("8").is_err());
        assert!(Cascade::parse("sometimes").is_err());
    }

    #[test]
    fn field_values_order_deterministically() {
        let mut values = vec![
            FieldValue::text("b"),
            FieldValue::Int(2),
            FieldValue::Null,
            FieldValue::Bool(true),
        ];
        values.sort();
        assert_eq!(values[0], FieldValue::Null);
        assert_eq!(values[3], FieldValue::text("b"));
    }

    #[test]
    fn fields_helper_builds_map() {
        let f = fields([("name", FieldValue::text("t0")), ("done", false.into())]);
        assert_eq!(f.get("name"), Some(&FieldValue::text("t0")));
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn object_key_display() {
        assert_eq!(ObjectKey::Entity(EntityId(3)).to_string(), "entity#3");
        assert_eq!(ObjectKey::from(CollectionId(1)).to_string(), "collection#1");
        assert_eq!(ObjectKey::from(EntityId(9)).entity(), Some(EntityId(9)));
    }
}
