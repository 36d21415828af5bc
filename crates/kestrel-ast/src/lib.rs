//! Expression trees the KestrelDB query compiler hands to the optimizer.
//!
//! The optimizer inspects and matches these nodes but never rewrites them:
//! a predicate either becomes part of an index retrieval or survives as a
//! residual filter, unchanged. Bound values copied into a chosen plan are
//! owned clones, so a plan outlives the compilation that produced it.

mod display;

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// One table/row-source reference within a query.
///
/// A query joining the same table twice has two distinct streams.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct StreamId(pub u16);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A field (column) position within a relation's format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct FieldId(pub u16);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Value expressions
// ---------------------------------------------------------------------------

/// A literal constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

/// A value expression: something that evaluates to a scalar at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueExpr {
    /// A literal constant.
    Literal(Literal),
    /// A statement parameter, bound at execution time.
    Parameter(u16),
    /// A field of some stream's current row.
    Field { stream: StreamId, field: FieldId },
    /// The physical row identity of a stream's current row.
    RowId { stream: StreamId },
}

impl ValueExpr {
    /// True for values known without reading any stream (literals and
    /// parameters).
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Literal(_) | Self::Parameter(_))
    }

    /// The stream this expression reads, if any.
    #[must_use]
    pub fn referenced_stream(&self) -> Option<StreamId> {
        match self {
            Self::Field { stream, .. } | Self::RowId { stream } => Some(*stream),
            Self::Literal(_) | Self::Parameter(_) => None,
        }
    }

    /// True when the value can be computed without the given stream's row,
    /// i.e. it is constant or reads only other streams.
    #[must_use]
    pub fn computable_without(&self, stream: StreamId) -> bool {
        self.referenced_stream() != Some(stream)
    }

    /// Collect every stream the expression reads into `out` (sorted,
    /// deduplicated by the caller's collection).
    pub fn collect_streams(&self, out: &mut std::collections::BTreeSet<StreamId>) {
        if let Some(s) = self.referenced_stream() {
            out.insert(s);
        }
    }
}

// ---------------------------------------------------------------------------
// Boolean expressions
// ---------------------------------------------------------------------------

/// Comparison kind of a two-operand boolean predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    /// `a = b`
    Eq,
    /// `a <> b`
    NotEq,
    /// `a < b`
    Lt,
    /// `a <= b`
    LtEq,
    /// `a > b`
    Gt,
    /// `a >= b`
    GtEq,
    /// `a IS NOT DISTINCT FROM b` (null-tolerant equality)
    Equiv,
    /// `a STARTING WITH b` (prefix comparison)
    Starting,
}

impl CmpOp {
    /// The comparison with operand sides swapped (`a < b` ⇔ `b > a`).
    ///
    /// `Starting` has no mirrored form; it is returned unchanged and the
    /// caller must not swap its operands.
    #[must_use]
    pub fn mirrored(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::LtEq => Self::GtEq,
            Self::Gt => Self::Lt,
            Self::GtEq => Self::LtEq,
            Self::Eq | Self::NotEq | Self::Equiv | Self::Starting => self,
        }
    }

    /// True for the operators whose operands may be swapped freely.
    #[must_use]
    pub fn is_commutable(self) -> bool {
        !matches!(self, Self::Starting)
    }
}

/// A boolean predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoolExpr {
    /// `left <op> right`
    Cmp {
        op: CmpOp,
        left: ValueExpr,
        right: ValueExpr,
    },
    /// `value BETWEEN low AND high` (closed on both ends)
    Between {
        value: ValueExpr,
        low: ValueExpr,
        high: ValueExpr,
    },
    /// `value IS NULL`
    Missing { value: ValueExpr },
    /// Logical conjunction.
    And(Box<BoolExpr>, Box<BoolExpr>),
    /// Logical disjunction.
    Or(Box<BoolExpr>, Box<BoolExpr>),
    /// Logical negation.
    Not(Box<BoolExpr>),
}

impl BoolExpr {
    /// Decompose a predicate into its top-level AND-separated conjuncts.
    ///
    /// `a AND (b OR c) AND d` yields `[a, b OR c, d]` in source order.
    #[must_use]
    pub fn conjuncts(&self) -> Vec<&BoolExpr> {
        let mut out = Vec::new();
        self.collect_conjuncts(&mut out);
        out
    }

    fn collect_conjuncts<'a>(&'a self, out: &mut Vec<&'a BoolExpr>) {
        if let BoolExpr::And(left, right) = self {
            left.collect_conjuncts(out);
            right.collect_conjuncts(out);
        } else {
            out.push(self);
        }
    }

    /// Every stream referenced anywhere in the predicate, in ascending order.
    #[must_use]
    pub fn streams(&self) -> std::collections::BTreeSet<StreamId> {
        let mut set = std::collections::BTreeSet::new();
        self.collect_streams(&mut set);
        set
    }

    /// Accumulate referenced streams into `out`.
    pub fn collect_streams(&self, out: &mut std::collections::BTreeSet<StreamId>) {
        match self {
            Self::Cmp { left, right, .. } => {
                left.collect_streams(out);
                right.collect_streams(out);
            }
            Self::Between { value, low, high } => {
                value.collect_streams(out);
                low.collect_streams(out);
                high.collect_streams(out);
            }
            Self::Missing { value } => value.collect_streams(out),
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_streams(out);
                b.collect_streams(out);
            }
            Self::Not(inner) => inner.collect_streams(out),
        }
    }

    /// True when the predicate reads the given stream.
    #[must_use]
    pub fn references_stream(&self, stream: StreamId) -> bool {
        self.streams().contains(&stream)
    }

    /// Convenience constructor for `left AND right`.
    #[must_use]
    pub fn and(self, other: BoolExpr) -> BoolExpr {
        BoolExpr::And(Box::new(self), Box::new(other))
    }

    /// Convenience constructor for `left OR right`.
    #[must_use]
    pub fn or(self, other: BoolExpr) -> BoolExpr {
        BoolExpr::Or(Box::new(self), Box::new(other))
    }
}

// ---------------------------------------------------------------------------
// Sort specifications
// ---------------------------------------------------------------------------

/// One key of a required output ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub stream: StreamId,
    pub field: FieldId,
    pub descending: bool,
}

/// A required output ordering, leftmost key first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortSpec {
    pub keys: Vec<SortKey>,
}

impl SortSpec {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// True when every key reads the given stream (a single-stream sort is
    /// the only kind an index walk can satisfy).
    #[must_use]
    pub fn is_single_stream(&self, stream: StreamId) -> bool {
        !self.keys.is_empty() && self.keys.iter().all(|k| k.stream == stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(stream: u16, field: u16) -> ValueExpr {
        ValueExpr::Field {
            stream: StreamId(stream),
            field: FieldId(field),
        }
    }

    fn int(n: i64) -> ValueExpr {
        ValueExpr::Literal(Literal::Integer(n))
    }

    fn eq(left: ValueExpr, right: ValueExpr) -> BoolExpr {
        BoolExpr::Cmp {
            op: CmpOp::Eq,
            left,
            right,
        }
    }

    #[test]
    fn conjuncts_flatten_nested_ands() {
        let e = eq(field(0, 0), int(1))
            .and(eq(field(0, 1), int(2)).and(eq(field(1, 0), int(3))));
        let parts = e.conjuncts();
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn conjuncts_keep_or_opaque() {
        let e = eq(field(0, 0), int(1)).or(eq(field(0, 1), int(2)));
        assert_eq!(e.conjuncts().len(), 1);
    }

    #[test]
    fn streams_are_sorted_and_deduplicated() {
        let e = eq(field(2, 0), field(0, 1)).and(eq(field(0, 2), int(5)));
        let streams: Vec<_> = e.streams().into_iter().collect();
        assert_eq!(streams, vec![StreamId(0), StreamId(2)]);
    }

    #[test]
    fn computable_without_checks_the_right_stream() {
        let v = field(3, 1);
        assert!(v.computable_without(StreamId(0)));
        assert!(!v.computable_without(StreamId(3)));
        assert!(int(7).computable_without(StreamId(3)));
    }

    #[test]
    fn mirrored_flips_range_operators_only() {
        assert_eq!(CmpOp::Lt.mirrored(), CmpOp::Gt);
        assert_eq!(CmpOp::GtEq.mirrored(), CmpOp::LtEq);
        assert_eq!(CmpOp::Eq.mirrored(), CmpOp::Eq);
        assert!(!CmpOp::Starting.is_commutable());
    }

    #[test]
    fn sort_spec_single_stream() {
        let sort = SortSpec {
            keys: vec![
                SortKey {
                    stream: StreamId(1),
                    field: FieldId(0),
                    descending: false,
                },
                SortKey {
                    stream: StreamId(1),
                    field: FieldId(2),
                    descending: true,
                },
            ],
        };
        assert!(sort.is_single_stream(StreamId(1)));
        assert!(!sort.is_single_stream(StreamId(0)));
        assert!(!SortSpec::default().is_single_stream(StreamId(1)));
    }
}
