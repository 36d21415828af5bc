//! The optimizer's output: per-stream retrieval descriptions and the chosen
//! join order.
//!
//! Everything here is an owned value copied out of the compilation, so a
//! plan can be cached, rendered, serialized and diffed after the optimizer's
//! working state is gone. The `Display` rendering is stable and is what the
//! plan-compatibility tests snapshot.

use std::fmt;

use kestrel_ast::{BoolExpr, StreamId, ValueExpr};
use kestrel_catalog::{IndexId, RelationId};
use serde::{Deserialize, Serialize};

use crate::candidates::SegmentScan;

// ---------------------------------------------------------------------------
// Retrieval nodes
// ---------------------------------------------------------------------------

/// Bounds on one key segment of a chosen index scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentBound {
    /// How the segment is scanned; determines which bounds are present.
    pub scan: SegmentScan,
    pub lower: Option<ValueExpr>,
    pub upper: Option<ValueExpr>,
    pub exclude_lower: bool,
    pub exclude_upper: bool,
}

/// How one stream's rows are retrieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetrievalNode {
    /// Read every row of the relation.
    NaturalScan,
    /// Scan one index over the bounded key prefix.
    IndexScan {
        index: IndexId,
        name: String,
        bounds: Vec<SegmentBound>,
    },
    /// Fetch one row by its physical identity.
    RowIdLookup { value: ValueExpr },
    /// Walk an index end to end (optionally bounded) to produce rows in the
    /// required output order without a sort step.
    Navigational {
        index: IndexId,
        name: String,
        bounds: Vec<SegmentBound>,
    },
    /// Intersection of the children's row sets.
    And(Vec<RetrievalNode>),
    /// Union of the children's row sets.
    Or(Vec<RetrievalNode>),
}

impl RetrievalNode {
    /// Number of distinct index scans inside this node.
    #[must_use]
    pub fn index_count(&self) -> usize {
        match self {
            Self::NaturalScan | Self::RowIdLookup { .. } => 0,
            Self::IndexScan { .. } | Self::Navigational { .. } => 1,
            Self::And(children) | Self::Or(children) => {
                children.iter().map(RetrievalNode::index_count).sum()
            }
        }
    }
}

impl fmt::Display for RetrievalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NaturalScan => f.write_str("NATURAL"),
            Self::IndexScan { name, bounds, .. } => {
                write!(f, "INDEX {name} ({} segments)", bounds.len())
            }
            Self::RowIdLookup { .. } => f.write_str("ROWID"),
            Self::Navigational { name, .. } => write!(f, "ORDER {name}"),
            Self::And(children) => write_composite(f, children, " AND "),
            Self::Or(children) => write_composite(f, children, " OR "),
        }
    }
}

fn write_composite(
    f: &mut fmt::Formatter<'_>,
    children: &[RetrievalNode],
    sep: &str,
) -> fmt::Result {
    f.write_str("(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{child}")?;
    }
    f.write_str(")")
}

// ---------------------------------------------------------------------------
// Stream and query plans
// ---------------------------------------------------------------------------

/// The chosen retrieval for one stream, in its join-order position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPlan {
    pub stream: StreamId,
    pub relation: RelationId,
    /// Alias used in rendering and log events.
    pub alias: String,
    pub node: RetrievalNode,
    /// Predicates not absorbed into the retrieval, to be applied as a
    /// runtime filter at this position.
    pub residual: Vec<BoolExpr>,
    /// Estimated page cost of one execution of this retrieval.
    pub cost: f64,
    /// Estimated rows produced per execution, residual filters included.
    pub cardinality: f64,
    /// The retrieval returns at most one row per set of outer values.
    pub unique: bool,
}

/// The complete access plan for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Streams in chosen join order.
    pub order: Vec<StreamId>,
    /// Retrieval per stream, parallel to `order`.
    pub streams: Vec<StreamPlan>,
    /// Cumulative estimated cost under the nested-loop model.
    pub total_cost: f64,
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ACCESS PLAN (est. cost {:.1}):", self.total_cost)?;
        for (i, sp) in self.streams.iter().enumerate() {
            write!(
                f,
                "  {i}: {} [{}] {} (~{:.0} rows, cost {:.1})",
                sp.alias, sp.stream, sp.node, sp.cardinality, sp.cost
            )?;
            if !sp.residual.is_empty() {
                write!(f, " filter: ")?;
                for (j, pred) in sp.residual.iter().enumerate() {
                    if j > 0 {
                        write!(f, " AND ")?;
                    }
                    write!(f, "{pred}")?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_ast::Literal;

    fn index_scan(name: &str) -> RetrievalNode {
        RetrievalNode::IndexScan {
            index: IndexId(1),
            name: name.into(),
            bounds: vec![SegmentBound {
                scan: SegmentScan::Equal,
                lower: Some(ValueExpr::Literal(Literal::Integer(1))),
                upper: Some(ValueExpr::Literal(Literal::Integer(1))),
                exclude_lower: false,
                exclude_upper: false,
            }],
        }
    }

    #[test]
    fn index_count_walks_composites() {
        let node = RetrievalNode::And(vec![
            index_scan("a"),
            RetrievalNode::Or(vec![index_scan("b"), index_scan("c")]),
        ]);
        assert_eq!(node.index_count(), 3);
        assert_eq!(RetrievalNode::NaturalScan.index_count(), 0);
    }

    #[test]
    fn plan_rendering_is_stable() {
        let plan = QueryPlan {
            order: vec![StreamId(0)],
            streams: vec![StreamPlan {
                stream: StreamId(0),
                relation: RelationId(1),
                alias: "orders".into(),
                node: index_scan("orders_pk"),
                residual: vec![],
                cost: 2.0,
                cardinality: 1.0,
                unique: true,
            }],
            total_cost: 2.0,
        };
        let text = plan.to_string();
        assert!(text.starts_with("ACCESS PLAN (est. cost 2.0):"));
        assert!(text.contains("orders [s0] INDEX orders_pk (1 segments) (~1 rows, cost 2.0)"));
    }
}
