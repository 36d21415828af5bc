//! Per-stream retrieval planning: pick the cheapest way to produce one
//! stream's rows.
//!
//! The planner builds an [`IndexCandidate`] per index, turns every usable
//! match into a scored [`InversionCandidate`], then combines and compares:
//! AND-composites when intersecting two indexes is provably cheaper, OR
//! trees when every disjunct has its own index match, a row-identity lookup
//! when one is available (it always wins), a navigational index walk when a
//! required sort order can be had for free, and a natural scan when nothing
//! cheaper exists. Candidates whose bounds read not-yet-placed streams stay
//! visible for the join search but are not selectable until those streams
//! are fixed.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use kestrel_ast::{BoolExpr, CmpOp, SortSpec, StreamId, ValueExpr};
use kestrel_catalog::{Catalog, IndexDescriptor, RelationId};
use tracing::{debug, trace};

use crate::candidates::{ConjunctId, IndexCandidate, MatchAnalysis};
use crate::cost;
use crate::plan::{RetrievalNode, SegmentBound};
use crate::{OptimizerError, StreamDef};

// ---------------------------------------------------------------------------
// Inversion candidates
// ---------------------------------------------------------------------------

/// A scored, possibly composite retrieval option for one stream.
#[derive(Debug, Clone)]
pub struct InversionCandidate {
    /// Fraction of the stream's rows the retrieval is expected to return.
    pub selectivity: f64,
    /// Estimated page cost of one execution.
    pub cost: f64,
    /// Key segments bound across the involved indexes.
    pub matched_segments: usize,
    /// Key segments not fully (equality) matched.
    pub non_full_matched_segments: usize,
    /// Number of indexes combined.
    pub indexes: usize,
    /// Conjuncts the retrieval absorbs.
    pub matches: Vec<ConjunctId>,
    /// Outer streams whose values the bounds read; the candidate is only
    /// selectable once all of them are fixed in the join order.
    pub dependencies: BTreeSet<StreamId>,
    /// Arena slot of the originating [`IndexCandidate`] for single-index
    /// candidates.
    pub scratch: Option<usize>,
    /// Single-row guarantee (unique key equality or row-id lookup).
    pub unique: bool,
    /// Incorporated into a chosen composite.
    pub used: bool,
    /// The retrieval this candidate describes.
    pub node: RetrievalNode,
}

impl InversionCandidate {
    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    fn is_row_id(&self) -> bool {
        matches!(self.node, RetrievalNode::RowIdLookup { .. })
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Deterministic candidate ordering: cheapest first, then fewest indexes,
/// then most selective. `Equal` keeps insertion order under a stable sort,
/// which is the final first-found tie-break.
pub(crate) fn candidate_order(a: &InversionCandidate, b: &InversionCandidate) -> Ordering {
    cmp_f64(a.cost, b.cost)
        .then_with(|| a.indexes.cmp(&b.indexes))
        .then_with(|| cmp_f64(a.selectivity, b.selectivity))
}

/// True when `check` strictly beats `best` under [`candidate_order`].
pub(crate) fn better_candidate(check: &InversionCandidate, best: &InversionCandidate) -> bool {
    candidate_order(check, best) == Ordering::Less
}

// ---------------------------------------------------------------------------
// Planning results
// ---------------------------------------------------------------------------

/// Scores of a chosen retrieval, without the materialized node. This is what
/// the join-order search works from.
#[derive(Debug, Clone)]
pub struct RetrievalCost {
    /// Page cost of one execution, sort penalty included where one applies.
    pub cost: f64,
    /// Estimated rows produced, residual filters included.
    pub cardinality: f64,
    /// Selectivity absorbed into the retrieval itself.
    pub selectivity: f64,
    pub unique: bool,
    pub indexes: usize,
    pub matched_conjuncts: usize,
    pub dependencies: BTreeSet<StreamId>,
}

/// A chosen retrieval with its materialized node, ready for plan assembly.
#[derive(Debug, Clone)]
pub struct StreamRetrieval {
    pub stream: StreamId,
    pub node: RetrievalNode,
    /// Conjuncts absorbed by the retrieval.
    pub matches: Vec<ConjunctId>,
    pub cost: f64,
    pub cardinality: f64,
    pub selectivity: f64,
    pub unique: bool,
}

/// Internal selection state shared by `get_cost` and `get_inversion`.
#[derive(Debug, Clone)]
struct Selection {
    node: RetrievalNode,
    matches: Vec<ConjunctId>,
    dependencies: BTreeSet<StreamId>,
    selectivity: f64,
    unique: bool,
    indexes: usize,
    cost: f64,
    rows: f64,
}

fn selection_better(check: &Selection, best: &Selection) -> bool {
    cmp_f64(check.cost, best.cost)
        .then_with(|| check.indexes.cmp(&best.indexes))
        .then_with(|| cmp_f64(check.selectivity, best.selectivity))
        == Ordering::Less
}

// ---------------------------------------------------------------------------
// Retrieval planner
// ---------------------------------------------------------------------------

/// Chooses the cheapest retrieval for one stream.
///
/// Built once per stream per compilation; candidate construction happens at
/// build time, after which `get_cost` and `get_inversion` only select among
/// the prepared candidates for a given set of fixed outer streams.
pub struct RetrievalPlanner<'a> {
    stream: StreamId,
    relation: RelationId,
    alias: String,
    /// Relation cardinality, clamped.
    cardinality: f64,
    sort: Option<&'a SortSpec>,
    conjuncts: &'a [BoolExpr],
    indexes: &'a [IndexDescriptor],
    /// Arena of per-index match state, one slot per descriptor.
    scratches: Vec<IndexCandidate>,
    candidates: Vec<InversionCandidate>,
}

impl<'a> RetrievalPlanner<'a> {
    pub fn new<C: Catalog>(
        catalog: &'a C,
        def: &StreamDef,
        conjuncts: &'a [BoolExpr],
        sort: Option<&'a SortSpec>,
    ) -> Result<Self, OptimizerError> {
        let indexes = catalog.indexes(def.relation);
        for descriptor in indexes {
            descriptor.validate()?;
        }
        let mut planner = Self {
            stream: def.stream,
            relation: def.relation,
            alias: def
                .alias
                .clone()
                .unwrap_or_else(|| catalog.relation_name(def.relation).to_string()),
            cardinality: cost::clamp_cardinality(catalog.relation_cardinality(def.relation)),
            sort,
            conjuncts,
            indexes,
            scratches: Vec::new(),
            candidates: Vec::new(),
        };
        planner.build_candidates();
        Ok(planner)
    }

    #[must_use]
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    #[must_use]
    pub fn relation(&self) -> RelationId {
        self.relation
    }

    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Clamped relation cardinality.
    #[must_use]
    pub fn cardinality(&self) -> f64 {
        self.cardinality
    }

    /// All prepared candidates, dependency-bearing ones included.
    #[must_use]
    pub fn candidates(&self) -> &[InversionCandidate] {
        &self.candidates
    }

    /// The per-index match arena; single-index candidates point back into it
    /// through [`InversionCandidate::scratch`].
    #[must_use]
    pub fn scratches(&self) -> &[IndexCandidate] {
        &self.scratches
    }

    /// Score the cheapest retrieval available with `outer` streams fixed.
    #[must_use]
    pub fn get_cost(&self, outer: &BTreeSet<StreamId>) -> RetrievalCost {
        let chosen = self.choose(outer);
        RetrievalCost {
            cost: chosen.cost,
            cardinality: chosen.rows,
            selectivity: chosen.selectivity,
            unique: chosen.unique,
            indexes: chosen.indexes,
            matched_conjuncts: chosen.matches.len(),
            dependencies: chosen.dependencies,
        }
    }

    /// Same search as [`Self::get_cost`], additionally handing out the
    /// materialized retrieval node for plan assembly.
    #[must_use]
    pub fn get_inversion(&self, outer: &BTreeSet<StreamId>) -> StreamRetrieval {
        let chosen = self.choose(outer);
        debug!(
            stream = %self.stream,
            alias = %self.alias,
            retrieval = %chosen.node,
            cost = chosen.cost,
            rows = chosen.rows,
            "retrieval chosen"
        );
        StreamRetrieval {
            stream: self.stream,
            node: chosen.node,
            matches: chosen.matches,
            cost: chosen.cost,
            cardinality: chosen.rows,
            selectivity: chosen.selectivity,
            unique: chosen.unique,
        }
    }

    // -- candidate construction --------------------------------------------

    fn build_candidates(&mut self) {
        let mut candidates = Vec::new();

        for (id, conjunct) in self.conjuncts.iter().enumerate() {
            if let Some(c) = self.match_row_id(id, conjunct) {
                candidates.push(c);
            }
        }

        // Top-level conjuncts share one scratch set at scope zero.
        let mut scratches: Vec<IndexCandidate> = self
            .indexes
            .iter()
            .enumerate()
            .map(|(pos, descriptor)| IndexCandidate::new(pos, descriptor, self.cardinality))
            .collect();

        for (id, conjunct) in self.conjuncts.iter().enumerate() {
            match conjunct {
                BoolExpr::Or(..) => {
                    if let Some(c) = self.match_on_indexes(id, conjunct, 1) {
                        candidates.push(c);
                    }
                }
                BoolExpr::And(..) | BoolExpr::Not(..) => {}
                leaf => {
                    for scratch in &mut scratches {
                        scratch.match_boolean(
                            &self.indexes[scratch.index],
                            self.stream,
                            id,
                            leaf,
                            0,
                        );
                    }
                }
            }
        }

        for (pos, scratch) in scratches.iter_mut().enumerate() {
            let descriptor = &self.indexes[scratch.index];
            if let Some(analysis) = scratch.analyze(descriptor, 0) {
                scratch.utilized = true;
                candidates.push(make_candidate(descriptor, scratch, &analysis, Some(pos)));
            }
        }

        trace!(
            stream = %self.stream,
            candidates = candidates.len(),
            "inversion candidates prepared"
        );
        self.scratches = scratches;
        self.candidates = candidates;
    }

    /// Match a whole boolean subtree against the stream's indexes, used for
    /// disjunctions. Every OR branch must come back with its own candidate
    /// or the disjunction stays a residual filter; an AND branch is covered
    /// by either of its sides (retrieving a superset is correct, filtering
    /// does the rest).
    fn match_on_indexes(
        &self,
        conjunct: ConjunctId,
        expr: &BoolExpr,
        scope: u16,
    ) -> Option<InversionCandidate> {
        match expr {
            BoolExpr::Or(a, b) => {
                let ca = self.match_on_indexes(conjunct, a, scope + 1)?;
                let cb = self.match_on_indexes(conjunct, b, scope + 1)?;
                Some(compose_or(conjunct, ca, cb))
            }
            BoolExpr::And(a, b) => {
                match (
                    self.match_on_indexes(conjunct, a, scope),
                    self.match_on_indexes(conjunct, b, scope),
                ) {
                    (Some(ca), Some(cb)) => {
                        let composed = self.compose_and(&ca, &cb);
                        let single = if better_candidate(&cb, &ca) { cb } else { ca };
                        Some(if composed.cost < single.cost {
                            composed
                        } else {
                            single
                        })
                    }
                    (Some(c), None) | (None, Some(c)) => Some(c),
                    (None, None) => None,
                }
            }
            BoolExpr::Not(..) => None,
            leaf => {
                if let Some(c) = self.match_row_id(conjunct, leaf) {
                    return Some(c);
                }
                let mut best: Option<InversionCandidate> = None;
                for (pos, descriptor) in self.indexes.iter().enumerate() {
                    let mut scratch = IndexCandidate::new(pos, descriptor, self.cardinality);
                    if !scratch.match_boolean(descriptor, self.stream, conjunct, leaf, scope) {
                        continue;
                    }
                    let Some(analysis) = scratch.analyze(descriptor, scope) else {
                        continue;
                    };
                    let cand = make_candidate(descriptor, &scratch, &analysis, None);
                    match &best {
                        Some(b) if !better_candidate(&cand, b) => {}
                        _ => best = Some(cand),
                    }
                }
                best
            }
        }
    }

    /// A direct row-identity equality dominates any index: it names a single
    /// row outright.
    fn match_row_id(&self, conjunct: ConjunctId, expr: &BoolExpr) -> Option<InversionCandidate> {
        let BoolExpr::Cmp {
            op: CmpOp::Eq,
            left,
            right,
        } = expr
        else {
            return None;
        };
        let value = match (left, right) {
            (ValueExpr::RowId { stream }, value)
                if *stream == self.stream && value.computable_without(self.stream) =>
            {
                value
            }
            (value, ValueExpr::RowId { stream })
                if *stream == self.stream && value.computable_without(self.stream) =>
            {
                value
            }
            _ => return None,
        };
        let mut dependencies = BTreeSet::new();
        value.collect_streams(&mut dependencies);
        dependencies.remove(&self.stream);
        Some(InversionCandidate {
            selectivity: cost::clamp_selectivity(1.0 / self.cardinality),
            cost: cost::DEFAULT_INDEX_COST,
            matched_segments: 0,
            non_full_matched_segments: 0,
            indexes: 0,
            matches: vec![conjunct],
            dependencies,
            scratch: None,
            unique: true,
            used: false,
            node: RetrievalNode::RowIdLookup {
                value: value.clone(),
            },
        })
    }

    /// Intersect two candidates. Priced over the shared relation
    /// cardinality, so composing is only worthwhile when the combined
    /// selectivity outweighs the extra index walk.
    fn compose_and(
        &self,
        a: &InversionCandidate,
        b: &InversionCandidate,
    ) -> InversionCandidate {
        let indexes = a.indexes + b.indexes;
        let selectivity = cost::clamp_selectivity(a.selectivity * b.selectivity);
        let mut matches = a.matches.clone();
        for id in &b.matches {
            if !matches.contains(id) {
                matches.push(*id);
            }
        }
        let mut dependencies = a.dependencies.clone();
        dependencies.extend(b.dependencies.iter().copied());
        InversionCandidate {
            selectivity,
            cost: cost::index_retrieval_cost(indexes, self.cardinality, selectivity),
            matched_segments: a.matched_segments + b.matched_segments,
            non_full_matched_segments: a.non_full_matched_segments + b.non_full_matched_segments,
            indexes,
            matches,
            dependencies,
            scratch: None,
            unique: a.unique || b.unique,
            used: false,
            node: RetrievalNode::And(flatten_and(a.node.clone(), b.node.clone())),
        }
    }

    // -- selection ----------------------------------------------------------

    fn choose(&self, outer: &BTreeSet<StreamId>) -> Selection {
        let sort_needed = outer.is_empty()
            && self.sort.is_some_and(|s| s.is_single_stream(self.stream));

        let usable: Vec<&InversionCandidate> = self
            .candidates
            .iter()
            .filter(|c| c.dependencies.is_subset(outer))
            .collect();

        // Row-identity equality short-circuits everything.
        let mut row_id_best: Option<&InversionCandidate> = None;
        for cand in usable.iter().copied().filter(|c| c.is_row_id()) {
            match row_id_best {
                Some(best) if !better_candidate(cand, best) => {}
                _ => row_id_best = Some(cand),
            }
        }
        if let Some(best) = row_id_best {
            // One row needs no sorting.
            return self.selection_from(best, best.cost, cost::MINIMUM_CARDINALITY);
        }

        let composite = self.make_inversion(&usable);

        // Options in preference order on exact ties: a navigational walk
        // beats paying for a sort, and an inversion must strictly beat the
        // natural scan to be worth the index machinery.
        let mut options: Vec<Selection> = Vec::new();
        if sort_needed {
            options.extend(self.navigation_candidates(outer));
        }
        let natural_rows = self.residual_rows(cost::MAXIMUM_SELECTIVITY, &[], outer);
        let natural_cost = self.cardinality
            + if sort_needed {
                cost::sort_cost(natural_rows)
            } else {
                0.0
            };
        options.push(Selection {
            node: RetrievalNode::NaturalScan,
            matches: Vec::new(),
            dependencies: BTreeSet::new(),
            selectivity: cost::MAXIMUM_SELECTIVITY,
            unique: false,
            indexes: 0,
            cost: natural_cost,
            rows: natural_rows,
        });
        if let Some(cand) = composite {
            let rows = if cand.unique {
                cost::MINIMUM_CARDINALITY
            } else {
                self.residual_rows(cand.selectivity, &cand.matches, outer)
            };
            let total = cand.cost
                + if sort_needed {
                    cost::sort_cost(rows)
                } else {
                    0.0
                };
            options.push(self.selection_from(&cand, total, rows));
        }

        // First-found wins ties, so the priority order above holds.
        let mut best_idx = 0;
        for i in 1..options.len() {
            if selection_better(&options[i], &options[best_idx]) {
                best_idx = i;
            }
        }
        options.swap_remove(best_idx)
    }

    /// Pick the best composite among the usable candidates: cheapest single
    /// candidate first, then greedy AND-merging of further candidates while
    /// each merge strictly lowers the estimated cost. The result therefore
    /// never costs more than its cheapest component.
    fn make_inversion(&self, usable: &[&InversionCandidate]) -> Option<InversionCandidate> {
        let mut pool: Vec<InversionCandidate> = usable
            .iter()
            .filter(|c| !c.is_row_id())
            .map(|c| (*c).clone())
            .collect();
        if pool.is_empty() {
            return None;
        }
        pool.sort_by(|a, b| candidate_order(a, b));

        let mut current = pool[0].clone();
        current.used = true;
        for cand in &pool[1..] {
            if cand.matches.iter().all(|m| current.matches.contains(m)) {
                continue;
            }
            let composed = self.compose_and(&current, cand);
            if composed.cost < current.cost {
                trace!(
                    stream = %self.stream,
                    cost = composed.cost,
                    indexes = composed.indexes,
                    "AND-composite lowers retrieval cost"
                );
                current = composed;
                current.used = true;
            }
        }
        Some(current)
    }

    /// Index walks that deliver the required sort order with no sort step.
    fn navigation_candidates(&self, outer: &BTreeSet<StreamId>) -> Vec<Selection> {
        let Some(sort) = self.sort else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (pos, descriptor) in self.indexes.iter().enumerate() {
            let satisfies = sort.keys.iter().enumerate().all(|(k, key)| {
                descriptor
                    .segments
                    .get(k)
                    .is_some_and(|seg| seg.field == key.field && seg.descending == key.descending)
            });
            if !satisfies {
                continue;
            }
            // Reuse the index's own filtering match when it has one.
            let filtering = self
                .candidates
                .iter()
                .find(|c| c.scratch == Some(pos) && c.dependencies.is_subset(outer));
            let selection = match filtering {
                Some(cand) => {
                    let bounds = match &cand.node {
                        RetrievalNode::IndexScan { bounds, .. } => bounds.clone(),
                        _ => Vec::new(),
                    };
                    let rows = if cand.unique {
                        cost::MINIMUM_CARDINALITY
                    } else {
                        self.residual_rows(cand.selectivity, &cand.matches, outer)
                    };
                    Selection {
                        node: RetrievalNode::Navigational {
                            index: descriptor.id,
                            name: descriptor.name.clone(),
                            bounds,
                        },
                        matches: cand.matches.clone(),
                        dependencies: cand.dependencies.clone(),
                        selectivity: cand.selectivity,
                        unique: cand.unique,
                        indexes: 1,
                        cost: cand.cost,
                        rows,
                    }
                }
                None => {
                    let rows = self.residual_rows(cost::MAXIMUM_SELECTIVITY, &[], outer);
                    Selection {
                        node: RetrievalNode::Navigational {
                            index: descriptor.id,
                            name: descriptor.name.clone(),
                            bounds: Vec::new(),
                        },
                        matches: Vec::new(),
                        dependencies: BTreeSet::new(),
                        selectivity: cost::MAXIMUM_SELECTIVITY,
                        unique: false,
                        indexes: 1,
                        cost: cost::DEFAULT_INDEX_COST + self.cardinality,
                        rows,
                    }
                }
            };
            out.push(selection);
        }
        out
    }

    /// Estimated rows out after applying, as residual filters, every
    /// conjunct over this stream that the retrieval did not absorb and whose
    /// other inputs are already fixed.
    fn residual_rows(
        &self,
        absorbed_selectivity: f64,
        matches: &[ConjunctId],
        outer: &BTreeSet<StreamId>,
    ) -> f64 {
        let mut selectivity = absorbed_selectivity;
        for (id, conjunct) in self.conjuncts.iter().enumerate() {
            if matches.contains(&id) {
                continue;
            }
            let streams = conjunct.streams();
            if !streams.contains(&self.stream) {
                continue;
            }
            if !streams
                .iter()
                .all(|s| *s == self.stream || outer.contains(s))
            {
                continue;
            }
            selectivity =
                cost::clamp_selectivity(selectivity * cost::comparison_selectivity(conjunct));
        }
        cost::clamp_cardinality(self.cardinality * selectivity)
    }

    fn selection_from(
        &self,
        candidate: &InversionCandidate,
        cost: f64,
        rows: f64,
    ) -> Selection {
        Selection {
            node: candidate.node.clone(),
            matches: candidate.matches.clone(),
            dependencies: candidate.dependencies.clone(),
            selectivity: candidate.selectivity,
            unique: candidate.unique,
            indexes: candidate.indexes,
            cost,
            rows,
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate construction helpers
// ---------------------------------------------------------------------------

fn make_candidate(
    descriptor: &IndexDescriptor,
    scratch: &IndexCandidate,
    analysis: &MatchAnalysis,
    arena_slot: Option<usize>,
) -> InversionCandidate {
    InversionCandidate {
        selectivity: analysis.selectivity,
        cost: cost::index_retrieval_cost(1, scratch.cardinality, analysis.selectivity),
        matched_segments: analysis.matched_segments,
        non_full_matched_segments: analysis.non_full_matched_segments,
        indexes: 1,
        matches: analysis.matches.clone(),
        dependencies: analysis.dependencies.clone(),
        scratch: arena_slot,
        unique: analysis.unique,
        used: false,
        node: index_scan_node(descriptor, scratch, analysis.matched_segments),
    }
}

fn index_scan_node(
    descriptor: &IndexDescriptor,
    scratch: &IndexCandidate,
    prefix_len: usize,
) -> RetrievalNode {
    let bounds = scratch.segments[..prefix_len]
        .iter()
        .map(|seg| SegmentBound {
            scan: seg.scan,
            lower: seg.lower.clone(),
            upper: seg.upper.clone(),
            exclude_lower: seg.exclude_lower,
            exclude_upper: seg.exclude_upper,
        })
        .collect();
    RetrievalNode::IndexScan {
        index: descriptor.id,
        name: descriptor.name.clone(),
        bounds,
    }
}

fn compose_or(
    conjunct: ConjunctId,
    a: InversionCandidate,
    b: InversionCandidate,
) -> InversionCandidate {
    let mut dependencies = a.dependencies.clone();
    dependencies.extend(b.dependencies.iter().copied());
    InversionCandidate {
        selectivity: (a.selectivity + b.selectivity).min(cost::MAXIMUM_SELECTIVITY),
        cost: a.cost + b.cost,
        matched_segments: a.matched_segments.min(b.matched_segments),
        non_full_matched_segments: a
            .non_full_matched_segments
            .max(b.non_full_matched_segments),
        indexes: a.indexes + b.indexes,
        matches: vec![conjunct],
        dependencies,
        scratch: None,
        unique: false,
        used: false,
        node: RetrievalNode::Or(flatten_or(a.node, b.node)),
    }
}

fn flatten_and(a: RetrievalNode, b: RetrievalNode) -> Vec<RetrievalNode> {
    let mut children = match a {
        RetrievalNode::And(nodes) => nodes,
        other => vec![other],
    };
    match b {
        RetrievalNode::And(nodes) => children.extend(nodes),
        other => children.push(other),
    }
    children
}

fn flatten_or(a: RetrievalNode, b: RetrievalNode) -> Vec<RetrievalNode> {
    let mut children = match a {
        RetrievalNode::Or(nodes) => nodes,
        other => vec![other],
    };
    match b {
        RetrievalNode::Or(nodes) => children.extend(nodes),
        other => children.push(other),
    }
    children
}
