//! Join-order search over independently costed streams.
//!
//! Every stream gets a standalone baseline from its retrieval planner, plus
//! directional "indexed relationship" edges recording that one stream can
//! retrieve through an index keyed on another stream's values once that
//! stream is placed. The search itself is a depth-first branch-and-bound
//! over permutations under a nested-loop cost model: a partial order whose
//! accumulated cost already exceeds the best complete order is abandoned.
//! Descent order prefers unique relationships, then any relationship, then
//! the cheapest standalone stream, which doubles as the deterministic
//! tie-break between equal-cost complete orders.

use std::collections::BTreeSet;

use kestrel_ast::StreamId;
use tracing::{debug, trace};

use crate::cost;
use crate::retrieval::{candidate_order, RetrievalCost, RetrievalPlanner};
use crate::OptimizerError;

// ---------------------------------------------------------------------------
// Relationships and per-stream info
// ---------------------------------------------------------------------------

/// A directional edge: once the owning stream is placed, `stream` can
/// retrieve through an index bounded by the owner's values.
#[derive(Debug, Clone)]
pub struct IndexRelationship {
    /// The benefiting stream.
    pub stream: StreamId,
    /// The benefiting retrieval is a single-row lookup.
    pub unique: bool,
    /// Retrieval cost once the edge applies.
    pub cost: f64,
    /// Rows the benefiting retrieval is expected to produce.
    pub cardinality: f64,
    /// Streams that must all be placed before the edge applies; always
    /// contains the owning stream.
    pub dependencies: BTreeSet<StreamId>,
}

/// Strict "check beats with" ordering between two relationships for the
/// same stream: unique beats non-unique, then lower cost, then lower
/// cardinality; on a full tie the incumbent (first-found) stays.
pub(crate) fn cheaper_relationship(check: &IndexRelationship, with: &IndexRelationship) -> bool {
    if check.unique != with.unique {
        return check.unique;
    }
    if check.cost != with.cost {
        return check.cost < with.cost;
    }
    check.cardinality < with.cardinality
}

/// Per-stream join-ordering state.
#[derive(Debug, Clone)]
pub(crate) struct StreamInfo {
    pub stream: StreamId,
    /// Standalone cost, no other stream placed.
    pub base_cost: f64,
    /// Standalone result rows.
    pub base_cardinality: f64,
    pub base_unique: bool,
    pub base_indexes: usize,
    pub base_conjunction_matches: usize,
    /// Outgoing edges, best first.
    pub relationships: Vec<IndexRelationship>,
    /// Dependency streams the best incoming edge expects placed.
    pub previous_expected_streams: usize,
}

// ---------------------------------------------------------------------------
// The search
// ---------------------------------------------------------------------------

/// Orders N streams to minimize cumulative estimated join cost.
pub struct JoinOrderSearch<'a, 'p> {
    planners: &'p [RetrievalPlanner<'a>],
    infos: Vec<StreamInfo>,
}

impl<'a, 'p> JoinOrderSearch<'a, 'p> {
    #[must_use]
    pub fn new(planners: &'p [RetrievalPlanner<'a>]) -> Self {
        let infos = calculate_stream_info(planners);
        Self { planners, infos }
    }

    /// Find the cheapest placement order for all streams.
    ///
    /// A caller-supplied explicit order skips the search entirely; it is
    /// only validated to name each stream exactly once.
    pub fn find_join_order(
        &self,
        forced: Option<&[StreamId]>,
    ) -> Result<Vec<StreamId>, OptimizerError> {
        if let Some(order) = forced {
            return self.validated_forced_order(order);
        }

        let natural: Vec<StreamId> = self.planners.iter().map(|p| p.stream()).collect();
        if natural.len() <= 1 {
            return Ok(natural);
        }

        match self.search(&[], 0.0, 1.0, f64::INFINITY) {
            Some((order, cost)) => {
                debug!(?order, cost, "join order found");
                Ok(order)
            }
            // Every stream is placeable, so the search always completes;
            // this arm exists so a degenerate cost model cannot panic.
            None => Ok(natural),
        }
    }

    /// Depth-first branch-and-bound. Pure over its inputs: the running
    /// order, cost and row count arrive as arguments, the best complete
    /// order found under `bound` is the return value.
    fn search(
        &self,
        placed: &[StreamId],
        cost_so_far: f64,
        rows_so_far: f64,
        mut bound: f64,
    ) -> Option<(Vec<StreamId>, f64)> {
        if placed.len() == self.planners.len() {
            return (cost_so_far < bound).then(|| (placed.to_vec(), cost_so_far));
        }

        let mut best: Option<(Vec<StreamId>, f64)> = None;
        for (stream, position) in self.eligible(placed) {
            let position_cost = cost_so_far + rows_so_far * position.cost;
            if position_cost >= bound {
                trace!(%stream, position_cost, bound, "partial order pruned");
                continue;
            }
            let mut next = placed.to_vec();
            next.push(stream);
            if let Some(found) =
                self.search(&next, position_cost, rows_so_far * position.cardinality, bound)
            {
                bound = found.1;
                best = Some(found);
            }
        }
        best
    }

    /// Remaining streams with their cost at this position, in descent
    /// order: unique-relationship streams first, then any relationship,
    /// then cheapest standalone; stream number settles exact ties.
    fn eligible(&self, placed: &[StreamId]) -> Vec<(StreamId, RetrievalCost)> {
        let placed_set: BTreeSet<StreamId> = placed.iter().copied().collect();
        let mut out: Vec<(u8, StreamId, RetrievalCost)> = Vec::new();
        for planner in self.planners {
            let stream = planner.stream();
            if placed_set.contains(&stream) {
                continue;
            }
            let estimate = planner.get_cost(&placed_set);
            let tier = self.preference_tier(stream, &placed_set);
            out.push((tier, stream, estimate));
        }
        out.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.2.cost.partial_cmp(&b.2.cost).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| {
                    a.2.cardinality
                        .partial_cmp(&b.2.cardinality)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.1.cmp(&b.1))
        });
        out.into_iter().map(|(_, s, e)| (s, e)).collect()
    }

    /// 0: a placed stream offers a unique-index edge to `stream`;
    /// 1: some applicable non-unique edge; 2: no edge applies.
    fn preference_tier(&self, stream: StreamId, placed: &BTreeSet<StreamId>) -> u8 {
        let mut tier = 2;
        for info in &self.infos {
            if !placed.contains(&info.stream) {
                continue;
            }
            for rel in &info.relationships {
                if rel.stream != stream || !rel.dependencies.is_subset(placed) {
                    continue;
                }
                if rel.unique {
                    return 0;
                }
                tier = 1;
            }
        }
        tier
    }

    fn validated_forced_order(&self, order: &[StreamId]) -> Result<Vec<StreamId>, OptimizerError> {
        let known: BTreeSet<StreamId> = self.planners.iter().map(|p| p.stream()).collect();
        let mut seen = BTreeSet::new();
        for stream in order {
            if !known.contains(stream) {
                return Err(OptimizerError::UnknownForcedStream { stream: *stream });
            }
            if !seen.insert(*stream) {
                return Err(OptimizerError::IncompleteForcedOrder);
            }
        }
        if seen.len() != known.len() {
            return Err(OptimizerError::IncompleteForcedOrder);
        }
        Ok(order.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Stream info construction
// ---------------------------------------------------------------------------

fn calculate_stream_info(planners: &[RetrievalPlanner<'_>]) -> Vec<StreamInfo> {
    let no_outer = BTreeSet::new();
    let mut infos: Vec<StreamInfo> = planners
        .iter()
        .map(|planner| {
            let base = planner.get_cost(&no_outer);
            StreamInfo {
                stream: planner.stream(),
                base_cost: base.cost,
                base_cardinality: base.cardinality,
                base_unique: base.unique,
                base_indexes: base.indexes,
                base_conjunction_matches: base.matched_conjuncts,
                relationships: Vec::new(),
                previous_expected_streams: 0,
            }
        })
        .collect();

    for base in 0..planners.len() {
        for test in 0..planners.len() {
            if base == test {
                continue;
            }
            if let Some(rel) = indexed_relationship(&planners[base], &planners[test]) {
                // Keep the edge list best-first as it grows.
                let position = infos[base]
                    .relationships
                    .iter()
                    .position(|existing| cheaper_relationship(&rel, existing))
                    .unwrap_or(infos[base].relationships.len());
                infos[base].relationships.insert(position, rel);
            }
        }
    }

    // The best incoming edge tells each stream how many of its dependency
    // streams must come first.
    for test in 0..planners.len() {
        let stream = planners[test].stream();
        let mut best: Option<&IndexRelationship> = None;
        for info in &infos {
            for rel in &info.relationships {
                if rel.stream != stream {
                    continue;
                }
                match best {
                    Some(current) if !cheaper_relationship(rel, current) => {}
                    _ => best = Some(rel),
                }
            }
        }
        infos[test].previous_expected_streams = best.map_or(0, |rel| rel.dependencies.len());
    }

    for info in &infos {
        debug!(
            stream = %info.stream,
            cost = info.base_cost,
            rows = info.base_cardinality,
            unique = info.base_unique,
            indexes = info.base_indexes,
            conjunction_matches = info.base_conjunction_matches,
            relationships = info.relationships.len(),
            expects = info.previous_expected_streams,
            "stream baseline"
        );
    }
    infos
}

/// The best dependency-bearing candidate of `test` that involves `base`,
/// as a relationship edge. Streams with only a handful of rows never get
/// one: scanning them outright is cheaper than any index indirection.
fn indexed_relationship(
    base: &RetrievalPlanner<'_>,
    test: &RetrievalPlanner<'_>,
) -> Option<IndexRelationship> {
    if test.cardinality() <= cost::THRESHOLD_CARDINALITY {
        return None;
    }
    let base_stream = base.stream();
    // First-found wins ties, so fold instead of `min_by` (which keeps the
    // last minimum).
    let mut best = None;
    for candidate in test
        .candidates()
        .iter()
        .filter(|c| c.dependencies.contains(&base_stream))
    {
        match best {
            Some(current) if candidate_order(candidate, current) != std::cmp::Ordering::Less => {}
            _ => best = Some(candidate),
        }
    }
    let best = best?;
    let cardinality = if best.unique {
        cost::MINIMUM_CARDINALITY
    } else {
        cost::clamp_cardinality(test.cardinality() * best.selectivity)
    };
    Some(IndexRelationship {
        stream: test.stream(),
        unique: best.unique,
        cost: best.cost,
        cardinality,
        dependencies: best.dependencies.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamDef;
    use kestrel_ast::{BoolExpr, CmpOp, FieldId, Literal, ValueExpr};
    use kestrel_catalog::{
        Catalog, IndexDescriptor, IndexId, IndexSegment, MemoryCatalog, RelationId,
    };

    fn field(stream: u16, f: u16) -> ValueExpr {
        ValueExpr::Field {
            stream: StreamId(stream),
            field: FieldId(f),
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

    fn unique_index(id: u32, relation: u32, field: u16) -> IndexDescriptor {
        IndexDescriptor {
            id: IndexId(id),
            name: format!("pk_{id}"),
            relation: RelationId(relation),
            segment_count: 1,
            segments: vec![IndexSegment {
                field: FieldId(field),
                descending: false,
            }],
            unique: true,
            selectivity: 0.001,
        }
    }

    fn planners<'a, C: Catalog>(
        catalog: &'a C,
        defs: &[StreamDef],
        conjuncts: &'a [BoolExpr],
    ) -> Vec<RetrievalPlanner<'a>> {
        defs.iter()
            .map(|d| RetrievalPlanner::new(catalog, d, conjuncts, None).unwrap())
            .collect()
    }

    fn def(stream: u16, relation: u32) -> StreamDef {
        StreamDef {
            stream: StreamId(stream),
            relation: RelationId(relation),
            alias: None,
        }
    }

    /// Two streams, B holding an equality on A's unique key: A must come
    /// first so B's lookup applies.
    #[test]
    fn unique_lookup_stream_is_placed_second() {
        let mut cat = MemoryCatalog::new();
        cat.add_relation(RelationId(1), "a", 200.0);
        cat.add_relation(RelationId(2), "b", 1000.0);
        cat.add_index(unique_index(1, 2, 0)).unwrap();

        let conjuncts = vec![eq(field(1, 0), field(0, 3))];
        let defs = [def(0, 1), def(1, 2)];
        let ps = planners(&cat, &defs, &conjuncts);
        let search = JoinOrderSearch::new(&ps);

        let order = search.find_join_order(None).unwrap();
        assert_eq!(order, vec![StreamId(0), StreamId(1)]);
    }

    #[test]
    fn dependency_chain_orders_front_to_back() {
        let mut cat = MemoryCatalog::new();
        cat.add_relation(RelationId(1), "a", 50.0);
        cat.add_relation(RelationId(2), "b", 5000.0);
        cat.add_relation(RelationId(3), "c", 5000.0);
        cat.add_index(unique_index(1, 2, 0)).unwrap();
        cat.add_index(unique_index(2, 3, 0)).unwrap();

        // b keys on a, c keys on b.
        let conjuncts = vec![eq(field(1, 0), field(0, 1)), eq(field(2, 0), field(1, 1))];
        let defs = [def(0, 1), def(1, 2), def(2, 3)];
        let ps = planners(&cat, &defs, &conjuncts);
        let search = JoinOrderSearch::new(&ps);

        let order = search.find_join_order(None).unwrap();
        assert_eq!(order, vec![StreamId(0), StreamId(1), StreamId(2)]);
    }

    #[test]
    fn forced_order_bypasses_the_search() {
        let mut cat = MemoryCatalog::new();
        cat.add_relation(RelationId(1), "a", 200.0);
        cat.add_relation(RelationId(2), "b", 1000.0);
        cat.add_index(unique_index(1, 2, 0)).unwrap();

        let conjuncts = vec![eq(field(1, 0), field(0, 3))];
        let defs = [def(0, 1), def(1, 2)];
        let ps = planners(&cat, &defs, &conjuncts);
        let search = JoinOrderSearch::new(&ps);

        let forced = [StreamId(1), StreamId(0)];
        let order = search.find_join_order(Some(&forced)).unwrap();
        assert_eq!(order, vec![StreamId(1), StreamId(0)]);
    }

    #[test]
    fn forced_order_is_validated() {
        let mut cat = MemoryCatalog::new();
        cat.add_relation(RelationId(1), "a", 200.0);
        cat.add_relation(RelationId(2), "b", 1000.0);

        let conjuncts: Vec<BoolExpr> = Vec::new();
        let defs = [def(0, 1), def(1, 2)];
        let ps = planners(&cat, &defs, &conjuncts);
        let search = JoinOrderSearch::new(&ps);

        let unknown = [StreamId(0), StreamId(9)];
        assert!(matches!(
            search.find_join_order(Some(&unknown)),
            Err(OptimizerError::UnknownForcedStream {
                stream: StreamId(9)
            })
        ));

        let short = [StreamId(0)];
        assert!(matches!(
            search.find_join_order(Some(&short)),
            Err(OptimizerError::IncompleteForcedOrder)
        ));

        let duplicated = [StreamId(0), StreamId(0)];
        assert!(matches!(
            search.find_join_order(Some(&duplicated)),
            Err(OptimizerError::IncompleteForcedOrder)
        ));
    }

    #[test]
    fn tiny_streams_get_no_relationship_edges() {
        let mut cat = MemoryCatalog::new();
        cat.add_relation(RelationId(1), "a", 200.0);
        cat.add_relation(RelationId(2), "b", 4.0);
        cat.add_index(unique_index(1, 2, 0)).unwrap();

        let conjuncts = vec![eq(field(1, 0), field(0, 3))];
        let defs = [def(0, 1), def(1, 2)];
        let ps = planners(&cat, &defs, &conjuncts);
        let search = JoinOrderSearch::new(&ps);

        let a_info = &search.infos[0];
        assert!(a_info.relationships.is_empty());
    }

    #[test]
    fn relationship_tie_breaks_are_stable() {
        let unique = IndexRelationship {
            stream: StreamId(1),
            unique: true,
            cost: 10.0,
            cardinality: 5.0,
            dependencies: BTreeSet::new(),
        };
        let cheap = IndexRelationship {
            stream: StreamId(1),
            unique: false,
            cost: 1.0,
            cardinality: 5.0,
            dependencies: BTreeSet::new(),
        };
        let narrow = IndexRelationship {
            cardinality: 2.0,
            ..cheap.clone()
        };

        // Unique wins regardless of cost.
        assert!(cheaper_relationship(&unique, &cheap));
        assert!(!cheaper_relationship(&cheap, &unique));
        // Then cost, then cardinality.
        assert!(cheaper_relationship(&cheap, &IndexRelationship {
            cost: 2.0,
            ..cheap.clone()
        }));
        assert!(cheaper_relationship(&narrow, &cheap));
        // Full tie: the incumbent stays.
        assert!(!cheaper_relationship(&cheap, &cheap.clone()));
    }

    #[test]
    fn search_is_deterministic_across_runs() {
        let mut cat = MemoryCatalog::new();
        cat.add_relation(RelationId(1), "a", 300.0);
        cat.add_relation(RelationId(2), "b", 300.0);
        cat.add_relation(RelationId(3), "c", 300.0);

        // No predicates at all: every order costs the same, so the
        // tie-break (stream number) decides, identically every time.
        let conjuncts: Vec<BoolExpr> = Vec::new();
        let defs = [def(2, 3), def(0, 1), def(1, 2)];
        let ps = planners(&cat, &defs, &conjuncts);
        let search = JoinOrderSearch::new(&ps);

        let first = search.find_join_order(None).unwrap();
        for _ in 0..5 {
            assert_eq!(search.find_join_order(None).unwrap(), first);
        }
        assert_eq!(first, vec![StreamId(0), StreamId(1), StreamId(2)]);
    }
}
