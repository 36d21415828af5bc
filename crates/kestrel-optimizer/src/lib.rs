//! Cost-based access-path and join-order optimization.
//!
//! Given a query's table streams, their available indexes and the boolean
//! predicates over them, this crate decides how each stream is retrieved
//! (index inversions, row-id lookups, navigational walks or natural scans)
//! and in what order multiple streams are joined. The search is heuristic:
//! greedy candidate composition and fixed selectivity-reduction constants
//! trade plan optimality for bounded compile-time cost. A wrong estimate
//! yields a slower plan, never a wrong result, because predicates an index
//! does not absorb always survive as residual filters.
//!
//! The crate is pure compile-time machinery: it reads catalog metadata
//! through [`kestrel_catalog::Catalog`], inspects expressions from
//! [`kestrel_ast`], and produces an owned [`QueryPlan`]. One compilation is
//! single-threaded and owns all of its working state; many compilations may
//! run concurrently against the same catalog snapshot.
//!
//! Entry point: [`Optimizer::optimize`].

pub mod cost;

mod candidates;
mod join;
mod plan;
mod retrieval;

use std::collections::BTreeSet;

use kestrel_ast::{BoolExpr, SortSpec, StreamId};
use kestrel_catalog::{Catalog, CatalogError, RelationId};
use thiserror::Error;
use tracing::debug;

pub use candidates::{ConjunctId, IndexCandidate, MatchAnalysis, SegmentMatch, SegmentScan};
pub use join::{IndexRelationship, JoinOrderSearch};
pub use plan::{QueryPlan, RetrievalNode, SegmentBound, StreamPlan};
pub use retrieval::{
    InversionCandidate, RetrievalCost, RetrievalPlanner, StreamRetrieval,
};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One stream of the query: a numbered reference to a relation.
#[derive(Debug, Clone)]
pub struct StreamDef {
    pub stream: StreamId,
    pub relation: RelationId,
    /// Alias for plan rendering; defaults to the relation name.
    pub alias: Option<String>,
}

/// Everything the optimizer needs to know about one query.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub streams: Vec<StreamDef>,
    /// The WHERE predicate; its top-level conjuncts are matched
    /// individually.
    pub predicate: Option<BoolExpr>,
    /// Required output ordering, if any.
    pub sort: Option<SortSpec>,
    /// Caller-supplied explicit join order; skips the search when present.
    pub forced_order: Option<Vec<StreamId>>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that abort a compilation.
///
/// Estimation never fails: missing statistics, unmatched predicates and
/// empty predicate sets all degrade to valid (if slower) plans. What does
/// fail is structurally broken input, where continuing would produce an
/// incorrect plan.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Malformed catalog metadata.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// A forced join order names a stream the query does not contain.
    #[error("forced join order names unknown stream {stream}")]
    UnknownForcedStream { stream: StreamId },

    /// A forced join order must name every stream exactly once.
    #[error("forced join order must name every stream exactly once")]
    IncompleteForcedOrder,

    /// Two stream definitions share a stream number.
    #[error("duplicate stream number {stream}")]
    DuplicateStream { stream: StreamId },
}

// ---------------------------------------------------------------------------
// The optimizer
// ---------------------------------------------------------------------------

/// Per-query optimization pass.
///
/// Owns the decomposed conjunct list for the duration of one compilation;
/// everything else (planners, candidates, search state) is built inside
/// [`Self::optimize`] and released when it returns. Only the resulting
/// [`QueryPlan`] survives.
pub struct Optimizer<'a, C: Catalog> {
    catalog: &'a C,
    streams: Vec<StreamDef>,
    conjuncts: Vec<BoolExpr>,
    sort: Option<SortSpec>,
    forced_order: Option<Vec<StreamId>>,
}

impl<'a, C: Catalog> Optimizer<'a, C> {
    pub fn new(catalog: &'a C, query: QuerySpec) -> Result<Self, OptimizerError> {
        let mut seen = BTreeSet::new();
        for def in &query.streams {
            if !seen.insert(def.stream) {
                return Err(OptimizerError::DuplicateStream { stream: def.stream });
            }
        }
        let conjuncts = query
            .predicate
            .as_ref()
            .map_or_else(Vec::new, |p| p.conjuncts().into_iter().cloned().collect());
        Ok(Self {
            catalog,
            streams: query.streams,
            conjuncts,
            sort: query.sort,
            forced_order: query.forced_order,
        })
    }

    /// Run the full pass: per-stream retrieval planning, join-order search,
    /// then final materialization with each stream seeing the streams
    /// placed before it (so correlated index matches apply).
    pub fn optimize(&self) -> Result<QueryPlan, OptimizerError> {
        if self.streams.is_empty() {
            return Ok(QueryPlan {
                order: Vec::new(),
                streams: Vec::new(),
                total_cost: 0.0,
            });
        }

        let planners = self
            .streams
            .iter()
            .map(|def| RetrievalPlanner::new(self.catalog, def, &self.conjuncts, self.sort.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let order =
            JoinOrderSearch::new(&planners).find_join_order(self.forced_order.as_deref())?;

        // Materialize retrievals in placement order and record which
        // conjuncts each one absorbed.
        let mut placed: BTreeSet<StreamId> = BTreeSet::new();
        let mut absorbed: BTreeSet<ConjunctId> = BTreeSet::new();
        let mut retrievals = Vec::with_capacity(order.len());
        for stream in &order {
            let planner = planners
                .iter()
                .find(|p| p.stream() == *stream)
                .ok_or(OptimizerError::UnknownForcedStream { stream: *stream })?;
            let retrieval = planner.get_inversion(&placed);
            absorbed.extend(retrieval.matches.iter().copied());
            placed.insert(*stream);
            retrievals.push((planner, retrieval));
        }

        // Every conjunct no retrieval absorbed becomes a residual filter on
        // the earliest stream at which all of its inputs are bound.
        let mut residuals: Vec<Vec<BoolExpr>> = vec![Vec::new(); order.len()];
        for (id, conjunct) in self.conjuncts.iter().enumerate() {
            if absorbed.contains(&id) {
                continue;
            }
            let needed = conjunct.streams();
            let mut cover = BTreeSet::new();
            let position = order.iter().position(|s| {
                cover.insert(*s);
                needed.is_subset(&cover)
            });
            // A conjunct over streams outside the query cannot be evaluated
            // earlier than the end; keep it on the last stream.
            let position = position.unwrap_or(order.len() - 1);
            residuals[position].push(conjunct.clone());
        }

        let mut stream_plans = Vec::with_capacity(order.len());
        let mut total_cost = 0.0;
        let mut rows_so_far = 1.0;
        for ((planner, retrieval), residual) in retrievals.into_iter().zip(residuals) {
            total_cost += rows_so_far * retrieval.cost;
            rows_so_far *= retrieval.cardinality;
            stream_plans.push(StreamPlan {
                stream: retrieval.stream,
                relation: planner.relation(),
                alias: planner.alias().to_string(),
                node: retrieval.node,
                residual,
                cost: retrieval.cost,
                cardinality: retrieval.cardinality,
                unique: retrieval.unique,
            });
        }

        debug!(?order, total_cost, "access plan assembled");
        Ok(QueryPlan {
            order,
            streams: stream_plans,
            total_cost,
        })
    }
}
