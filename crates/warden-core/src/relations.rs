//! # Relation Specs
//!
//! Declarative description of which relations a watch follows.
//!
//! A spec is either an explicit tree (`{tasks: {owner: {}}}`) or a recursive
//! spec that applies itself again to every related object, which is how a
//! self-referencing structure such as a parent/children tree is watched.

use std::collections::{BTreeMap, BTreeSet};

/// The relation subtree a watch tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSpec {
    /// Follow each named relation with its own child spec.
    Tree(BTreeMap<String, RelationSpec>),
    /// Follow each named relation with this same spec.
    Recursive(BTreeSet<String>),
}

impl Default for RelationSpec {
    fn default() -> Self {
        Self::Tree(BTreeMap::new())
    }
}

impl RelationSpec {
    /// Follow nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Follow each named relation one level deep.
    #[must_use]
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Tree(
            names
                .into_iter()
                .map(|name| (name.into(), Self::none()))
                .collect(),
        )
    }

    /// Follow the named relations at every depth.
    #[must_use]
    pub fn recursive<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Recursive(names.into_iter().map(Into::into).collect())
    }

    /// Add (or replace) one relation with a nested spec.
    ///
    /// On a recursive spec this converts it into an explicit tree first.
    #[must_use]
    pub fn with(self, name: impl Into<String>, child: RelationSpec) -> Self {
        let mut tree = match self {
            Self::Tree(tree) => tree,
            Self::Recursive(names) => {
                let this = Self::Recursive(names.clone());
                names.into_iter().map(|n| (n, this.clone())).collect()
            }
        };
        tree.insert(name.into(), child);
        Self::Tree(tree)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Tree(tree) => tree.is_empty(),
            Self::Recursive(names) => names.is_empty(),
        }
    }

    /// Relation names followed at this level, in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::Tree(tree) => tree.keys().cloned().collect(),
            Self::Recursive(names) => names.iter().cloned().collect(),
        }
    }

    /// The spec applied to objects reached through `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<RelationSpec> {
        match self {
            Self::Tree(tree) => tree.get(name).cloned(),
            Self::Recursive(names) => names.contains(name).then(|| self.clone()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
