//! # Schema
//!
//! Model and relation descriptors for the live graph.
//!
//! A relation is either singular (`BelongsTo`, `HasOne`), where the foreign
//! field lives on the owning entity and holds the related entity's key, or
//! plural (`HasMany`), where the owner gets a collection and each member's
//! foreign field holds the owner's key.

use crate::{Cascade, WardenError};
use std::collections::BTreeMap;

/// Default name of the key field.
pub const DEFAULT_KEY_FIELD: &str = "id";

// =============================================================================
// RELATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
}

impl RelationKind {
    #[must_use]
    pub const fn is_singular(self) -> bool {
        matches!(self, Self::BelongsTo | Self::HasOne)
    }
}

/// Declarative description of one relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub kind: RelationKind,
    /// Target model name.
    pub model: String,
    /// Foreign field. On the owner for singular relations, on each member
    /// for plural ones.
    pub foreign: String,
    pub cascade_save: Cascade,
    pub cascade_remove: Cascade,
    /// Null the member's foreign field when it is unrelated.
    pub clear_key: bool,
}

impl RelationDef {
    fn new(kind: RelationKind, model: impl Into<String>, foreign: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            foreign: foreign.into(),
            cascade_save: Cascade::NONE,
            cascade_remove: Cascade::NONE,
            clear_key: false,
        }
    }

    #[must_use]
    pub fn belongs_to(model: impl Into<String>, foreign: impl Into<String>) -> Self {
        Self::new(RelationKind::BelongsTo, model, foreign)
    }

    #[must_use]
    pub fn has_one(model: impl Into<String>, foreign: impl Into<String>) -> Self {
        Self::new(RelationKind::HasOne, model, foreign)
    }

    /// Plural relation; clears the member key on unrelate by default.
    #[must_use]
    pub fn has_many(model: impl Into<String>, foreign: impl Into<String>) -> Self {
        Self {
            clear_key: true,
            ..Self::new(RelationKind::HasMany, model, foreign)
        }
    }

    #[must_use]
    pub fn cascade_save(mut self, cascade: Cascade) -> Self {
        self.cascade_save = cascade;
        self
    }

    #[must_use]
    pub fn cascade_remove(mut self, cascade: Cascade) -> Self {
        self.cascade_remove = cascade;
        self
    }

    #[must_use]
    pub fn clear_key(mut self, clear: bool) -> Self {
        self.clear_key = clear;
        self
    }

    /// The side-effect flags a relation instance starts with.
    #[must_use]
    pub fn behavior(&self) -> RelationBehavior {
        RelationBehavior {
            cascade_remove: self.cascade_remove,
            clear_key: self.clear_key,
        }
    }
}

/// Mutable side-effect flags of one relation instance.
///
/// Rollback switches these off while it reapplies foreign keys, then puts
/// them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelationBehavior {
    pub cascade_remove: Cascade,
    pub clear_key: bool,
}

impl RelationBehavior {
    /// No cascade, no key clearing.
    #[must_use]
    pub const fn inert() -> Self {
        Self {
            cascade_remove: Cascade::NONE,
            clear_key: false,
        }
    }
}

// =============================================================================
// MODELS
// =============================================================================

/// Definition of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDef {
    pub name: String,
    pub key_field: String,
    pub fields: Vec<String>,
    pub relations: BTreeMap<String, RelationDef>,
}

impl ModelDef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            fields: Vec::new(),
            relations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn key_field(mut self, key: impl Into<String>) -> Self {
        self.key_field = key.into();
        self
    }

    #[must_use]
    pub fn fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn relation(mut self, name: impl Into<String>, def: RelationDef) -> Self {
        self.relations.insert(name.into(), def);
        self
    }

    pub fn relation_def(&self, name: &str) -> Result<&RelationDef, WardenError> {
        self.relations
            .get(name)
            .ok_or_else(|| WardenError::UnknownRelation {
                model: self.name.clone(),
                relation: name.to_string(),
            })
    }

    /// Relations whose foreign field is `field` and live on this model.
    pub fn singular_relations_on(&self, field: &str) -> impl Iterator<Item = (&String, &RelationDef)> {
        self.relations
            .iter()
            .filter(move |(_, def)| def.kind.is_singular() && def.foreign == field)
    }

    /// A relation cannot use the key field as its foreign field.
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.name.is_empty() {
            return Err(WardenError::Config("model name is empty".to_string()));
        }
        for (name, def) in &self.relations {
            if def.kind.is_singular() && def.foreign == self.key_field {
                return Err(WardenError::Config(format!(
                    "relation {name} on {} uses the key field as foreign key",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
