//! Relation and index metadata the optimizer reads.
//!
//! The optimizer treats the catalog as an immutable snapshot: descriptors and
//! statistics are queried, never mutated, so any number of concurrent
//! compilations may share one snapshot without coordination. Versioning and
//! locking of the snapshot belong to the surrounding engine.
//!
//! Statistics here are advisory. A missing or degenerate value (zero
//! cardinality, non-positive selectivity) is a normal input that the
//! optimizer clamps to defaults; the only hard failure is a structurally
//! malformed descriptor, which [`IndexDescriptor::validate`] reports.

use std::collections::BTreeMap;
use std::fmt;

use kestrel_ast::FieldId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A relation (table) in the catalog.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct RelationId(pub u32);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// An index over a relation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct IndexId(pub u32);

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// One key segment of an index, leftmost first in [`IndexDescriptor::segments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSegment {
    /// The indexed field.
    pub field: FieldId,
    /// Key order of this segment.
    pub descending: bool,
}

/// Metadata describing one index: its key shape and statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: IndexId,
    /// Index name, used in plan rendering and log events.
    pub name: String,
    /// The relation this index covers.
    pub relation: RelationId,
    /// Declared segment count; must match `segments.len()`.
    pub segment_count: u16,
    /// Key segments, leftmost first.
    pub segments: Vec<IndexSegment>,
    /// Whether the index enforces key uniqueness.
    pub unique: bool,
    /// Estimated fraction of rows matching a full-key equality lookup.
    /// Non-positive means statistics are unavailable.
    pub selectivity: f64,
}

impl IndexDescriptor {
    /// Check structural invariants. A descriptor that fails here must abort
    /// the compilation: planning against a malformed key layout would produce
    /// an incorrect plan, not a slow one.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.segments.is_empty() {
            return Err(CatalogError::EmptyKey { index: self.id });
        }
        if usize::from(self.segment_count) != self.segments.len() {
            return Err(CatalogError::SegmentCountMismatch {
                index: self.id,
                declared: self.segment_count,
                actual: self.segments.len(),
            });
        }
        Ok(())
    }

    /// Position of `field` in the key, if it is part of it.
    #[must_use]
    pub fn position_of(&self, field: FieldId) -> Option<usize> {
        self.segments.iter().position(|s| s.field == field)
    }
}

/// Structural catalog violations. These are fatal to the compilation that
/// observes them, unlike missing statistics which merely degrade estimates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// An index descriptor declares a different segment count than it carries.
    #[error("index {index} declares {declared} key segments but carries {actual}")]
    SegmentCountMismatch {
        index: IndexId,
        declared: u16,
        actual: usize,
    },

    /// An index descriptor with no key segments at all.
    #[error("index {index} has an empty key")]
    EmptyKey { index: IndexId },

    /// A relation id that the catalog snapshot does not contain.
    #[error("unknown relation {relation}")]
    UnknownRelation { relation: RelationId },
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Read-only access to catalog metadata for one compilation.
pub trait Catalog {
    /// Estimated row count of a relation. May be zero or otherwise
    /// degenerate; callers clamp.
    fn relation_cardinality(&self, relation: RelationId) -> f64;

    /// All indexes covering a relation, in a stable order.
    fn indexes(&self, relation: RelationId) -> &[IndexDescriptor];

    /// Relation name for aliases, plan rendering and log events.
    fn relation_name(&self, relation: RelationId) -> &str;
}

// ---------------------------------------------------------------------------
// In-memory catalog
// ---------------------------------------------------------------------------

/// A self-contained [`Catalog`] built up programmatically.
///
/// Used by embedders that carry their schema in memory and throughout the
/// optimizer's tests. Relations and indexes keep insertion order within a
/// relation, which makes plan selection reproducible.
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    relations: BTreeMap<RelationId, RelationEntry>,
}

#[derive(Debug, Clone)]
struct RelationEntry {
    name: String,
    cardinality: f64,
    indexes: Vec<IndexDescriptor>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relation with its estimated row count.
    pub fn add_relation(
        &mut self,
        relation: RelationId,
        name: impl Into<String>,
        cardinality: f64,
    ) -> &mut Self {
        self.relations.insert(
            relation,
            RelationEntry {
                name: name.into(),
                cardinality,
                indexes: Vec::new(),
            },
        );
        self
    }

    /// Register an index under its relation. The descriptor is validated on
    /// entry so a malformed one fails loudly at build time rather than in
    /// the middle of a compilation.
    pub fn add_index(&mut self, descriptor: IndexDescriptor) -> Result<&mut Self, CatalogError> {
        descriptor.validate()?;
        let entry = self
            .relations
            .get_mut(&descriptor.relation)
            .ok_or(CatalogError::UnknownRelation {
                relation: descriptor.relation,
            })?;
        entry.indexes.push(descriptor);
        Ok(self)
    }
}

impl Catalog for MemoryCatalog {
    fn relation_cardinality(&self, relation: RelationId) -> f64 {
        self.relations
            .get(&relation)
            .map_or(0.0, |entry| entry.cardinality)
    }

    fn indexes(&self, relation: RelationId) -> &[IndexDescriptor] {
        self.relations
            .get(&relation)
            .map_or(&[], |entry| entry.indexes.as_slice())
    }

    fn relation_name(&self, relation: RelationId) -> &str {
        self.relations
            .get(&relation)
            .map_or("<unknown>", |entry| entry.name.as_str())
    }
}
