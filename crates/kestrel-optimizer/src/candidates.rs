//! Per-index match state: how well one index's key covers a stream's
//! predicates.
//!
//! For each candidate index the planner keeps an [`IndexCandidate`] whose
//! segments line up with the index's key segments, leftmost first. Matching a
//! predicate fills in the segment it bounds; candidate generation then walks
//! the segments in key order and prices the longest usable prefix. Absence of
//! any match is a normal outcome, not an error.

use std::collections::BTreeSet;

use kestrel_ast::{BoolExpr, CmpOp, StreamId, ValueExpr};
use kestrel_catalog::IndexDescriptor;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cost;

/// Position of a conjunct in the compilation's conjunct list.
pub type ConjunctId = usize;

// ---------------------------------------------------------------------------
// Segment scans
// ---------------------------------------------------------------------------

/// How a matched key segment will be scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentScan {
    /// Not bound by any predicate.
    None,
    /// Lower bound only (`>`, `>=`).
    Greater,
    /// Upper bound only (`<`, `<=`).
    Less,
    /// Both bounds (`BETWEEN`, or a fused `>` plus `<` pair).
    Between,
    /// Exact key value (`=`).
    Equal,
    /// Null-tolerant exact value (`IS NOT DISTINCT FROM`).
    Equivalent,
    /// Null key entries (`IS NULL`).
    Missing,
    /// Constant prefix (`STARTING WITH`).
    Starting,
}

impl SegmentScan {
    /// Equality-class scans pin the segment to one key value and let the
    /// match continue into the next segment.
    #[must_use]
    pub fn is_equality_class(self) -> bool {
        matches!(self, Self::Equal | Self::Equivalent | Self::Missing)
    }

    /// Range-class scans bound an interval; they must be the last matched
    /// segment of an index prefix.
    #[must_use]
    pub fn is_range_class(self) -> bool {
        matches!(self, Self::Greater | Self::Less | Self::Between | Self::Starting)
    }

    /// The selectivity reduction this scan contributes, multiplied into the
    /// index's base selectivity once per matched segment.
    #[must_use]
    pub fn selectivity_factor(self) -> f64 {
        match self {
            Self::Equal | Self::Equivalent | Self::Missing => {
                cost::REDUCE_SELECTIVITY_FACTOR_EQUALITY
            }
            Self::Between => cost::REDUCE_SELECTIVITY_FACTOR_BETWEEN,
            Self::Less => cost::REDUCE_SELECTIVITY_FACTOR_LESS,
            Self::Greater => cost::REDUCE_SELECTIVITY_FACTOR_GREATER,
            Self::Starting => cost::REDUCE_SELECTIVITY_FACTOR_STARTING,
            Self::None => cost::MAXIMUM_SELECTIVITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Segment match state
// ---------------------------------------------------------------------------

/// Match state of one index key segment.
#[derive(Debug, Clone)]
pub struct SegmentMatch {
    pub scan: SegmentScan,
    /// Lower bound value, owned clone of the predicate operand.
    pub lower: Option<ValueExpr>,
    /// Upper bound value.
    pub upper: Option<ValueExpr>,
    /// Lower bound is open (strict `>`).
    pub exclude_lower: bool,
    /// Upper bound is open (strict `<`).
    pub exclude_upper: bool,
    /// Nesting depth of the boolean context the match came from. Segments
    /// from different scopes are never combined into one candidate.
    pub scope: u16,
    /// Conjuncts this segment absorbs.
    pub matches: Vec<ConjunctId>,
    /// Outer streams the bound values read.
    pub dependencies: BTreeSet<StreamId>,
}

impl SegmentMatch {
    fn unmatched() -> Self {
        Self {
            scan: SegmentScan::None,
            lower: None,
            upper: None,
            exclude_lower: false,
            exclude_upper: false,
            scope: 0,
            matches: Vec::new(),
            dependencies: BTreeSet::new(),
        }
    }

    fn record(&mut self, stream: StreamId, conjunct: ConjunctId, scope: u16, values: &[&ValueExpr]) {
        self.scope = self.scope.max(scope);
        self.matches.push(conjunct);
        for value in values {
            if let Some(other) = value.referenced_stream() {
                if other != stream {
                    self.dependencies.insert(other);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis of a matched prefix
// ---------------------------------------------------------------------------

/// Derived figures for the longest usable prefix of a candidate's segments.
#[derive(Debug, Clone)]
pub struct MatchAnalysis {
    /// Number of key segments the prefix binds.
    pub matched_segments: usize,
    /// How many of those are equality-class (fully matched).
    pub full_matched_segments: usize,
    /// Key segments not fully matched, over the whole key.
    pub non_full_matched_segments: usize,
    /// Segments contributing a lower bound.
    pub lower_count: usize,
    /// Segments contributing an upper bound.
    pub upper_count: usize,
    /// Combined selectivity of the prefix.
    pub selectivity: f64,
    /// Every segment is an exact `=` match on a declared-unique index.
    pub unique: bool,
    /// Conjuncts absorbed, in segment order, deduplicated.
    pub matches: Vec<ConjunctId>,
    /// Outer streams the prefix's bounds depend on.
    pub dependencies: BTreeSet<StreamId>,
}

// ---------------------------------------------------------------------------
// Index candidate
// ---------------------------------------------------------------------------

/// Match state for one (stream, index) pair.
///
/// Lives in a per-planner arena and is referred to by its position there;
/// nothing holds a pointer into the arena across mutation.
#[derive(Debug, Clone)]
pub struct IndexCandidate {
    /// Position of the descriptor in the planner's index list.
    pub index: usize,
    /// Base selectivity of a full-key lookup, from statistics.
    pub selectivity: f64,
    /// Estimated rows visited when scanning the whole index.
    pub cardinality: f64,
    /// At least one segment matched.
    pub candidate: bool,
    /// At least one segment matched in the scope currently being planned.
    pub scope_candidate: bool,
    /// Incorporated into a chosen composite inversion.
    pub utilized: bool,
    /// One entry per key segment, aligned with the descriptor.
    pub segments: Vec<SegmentMatch>,
}

impl IndexCandidate {
    #[must_use]
    pub fn new(index: usize, descriptor: &IndexDescriptor, relation_cardinality: f64) -> Self {
        Self {
            index,
            selectivity: cost::base_selectivity(descriptor.selectivity),
            cardinality: cost::clamp_cardinality(relation_cardinality),
            candidate: false,
            scope_candidate: false,
            utilized: false,
            segments: descriptor
                .segments
                .iter()
                .map(|_| SegmentMatch::unmatched())
                .collect(),
        }
    }

    /// Try to absorb one predicate into a key segment of this index.
    ///
    /// Returns true when a segment took the match. Conjunctions,
    /// disjunctions and negations are the planner's business and are never
    /// passed here; a predicate that does not fit (wrong stream, unknown
    /// field, occupied segment) is simply left for the residual filter.
    pub fn match_boolean(
        &mut self,
        descriptor: &IndexDescriptor,
        stream: StreamId,
        conjunct: ConjunctId,
        predicate: &BoolExpr,
        scope: u16,
    ) -> bool {
        let matched = match predicate {
            BoolExpr::Cmp { op, left, right } => {
                self.match_comparison(descriptor, stream, conjunct, *op, left, right, scope)
            }
            BoolExpr::Between { value, low, high } => {
                self.match_between(descriptor, stream, conjunct, value, low, high, scope)
            }
            BoolExpr::Missing { value } => {
                self.match_missing(descriptor, stream, conjunct, value, scope)
            }
            BoolExpr::And(..) | BoolExpr::Or(..) | BoolExpr::Not(..) => false,
        };
        if matched {
            self.candidate = true;
            self.scope_candidate = true;
            trace!(
                index = %descriptor.id,
                conjunct,
                scope,
                "predicate bound to index segment"
            );
        }
        matched
    }

    #[allow(clippy::too_many_arguments)]
    fn match_comparison(
        &mut self,
        descriptor: &IndexDescriptor,
        stream: StreamId,
        conjunct: ConjunctId,
        op: CmpOp,
        left: &ValueExpr,
        right: &ValueExpr,
        scope: u16,
    ) -> bool {
        // Orient the comparison so the stream's field is on the left.
        let (op, field, value) = match (left, right) {
            (ValueExpr::Field { stream: s, field }, value)
                if *s == stream && value.computable_without(stream) =>
            {
                (op, *field, value)
            }
            (value, ValueExpr::Field { stream: s, field })
                if *s == stream && value.computable_without(stream) && op.is_commutable() =>
            {
                (op.mirrored(), *field, value)
            }
            _ => return false,
        };

        let Some(position) = descriptor.position_of(field) else {
            return false;
        };
        let segment = &mut self.segments[position];

        match op {
            CmpOp::Eq | CmpOp::Equiv => {
                // An equality pins the segment outright; a second predicate
                // on an already-bound segment stays residual.
                if segment.scan != SegmentScan::None {
                    return false;
                }
                segment.scan = if op == CmpOp::Eq {
                    SegmentScan::Equal
                } else {
                    SegmentScan::Equivalent
                };
                segment.lower = Some(value.clone());
                segment.upper = Some(value.clone());
            }
            CmpOp::Gt | CmpOp::GtEq => {
                segment.scan = match segment.scan {
                    SegmentScan::None => SegmentScan::Greater,
                    SegmentScan::Less => SegmentScan::Between,
                    _ => return false,
                };
                segment.lower = Some(value.clone());
                segment.exclude_lower = op == CmpOp::Gt;
            }
            CmpOp::Lt | CmpOp::LtEq => {
                segment.scan = match segment.scan {
                    SegmentScan::None => SegmentScan::Less,
                    SegmentScan::Greater => SegmentScan::Between,
                    _ => return false,
                };
                segment.upper = Some(value.clone());
                segment.exclude_upper = op == CmpOp::Lt;
            }
            CmpOp::Starting => {
                // Only a value known at plan time gives a usable prefix.
                if segment.scan != SegmentScan::None || !value.is_constant() {
                    return false;
                }
                segment.scan = SegmentScan::Starting;
                segment.lower = Some(value.clone());
                segment.upper = Some(value.clone());
            }
            CmpOp::NotEq => return false,
        }

        segment.record(stream, conjunct, scope, &[value]);
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn match_between(
        &mut self,
        descriptor: &IndexDescriptor,
        stream: StreamId,
        conjunct: ConjunctId,
        value: &ValueExpr,
        low: &ValueExpr,
        high: &ValueExpr,
        scope: u16,
    ) -> bool {
        let ValueExpr::Field { stream: s, field } = value else {
            return false;
        };
        if *s != stream
            || !low.computable_without(stream)
            || !high.computable_without(stream)
        {
            return false;
        }
        let Some(position) = descriptor.position_of(*field) else {
            return false;
        };
        let segment = &mut self.segments[position];
        if segment.scan != SegmentScan::None {
            return false;
        }
        segment.scan = SegmentScan::Between;
        segment.lower = Some(low.clone());
        segment.upper = Some(high.clone());
        segment.record(stream, conjunct, scope, &[low, high]);
        true
    }

    fn match_missing(
        &mut self,
        descriptor: &IndexDescriptor,
        stream: StreamId,
        conjunct: ConjunctId,
        value: &ValueExpr,
        scope: u16,
    ) -> bool {
        let ValueExpr::Field { stream: s, field } = value else {
            return false;
        };
        if *s != stream {
            return false;
        }
        let Some(position) = descriptor.position_of(*field) else {
            return false;
        };
        let segment = &mut self.segments[position];
        if segment.scan != SegmentScan::None {
            return false;
        }
        segment.scan = SegmentScan::Missing;
        segment.record(stream, conjunct, scope, &[]);
        true
    }

    /// Walk the segments in key order and price the longest usable prefix.
    ///
    /// The walk stops at the first unbound segment and after any range-class
    /// segment, which can only close a prefix. Segments matched in a
    /// different scope context end the prefix too. Returns `None` when
    /// nothing matched, which is the normal "this index does not help"
    /// outcome.
    #[must_use]
    pub fn analyze(&self, descriptor: &IndexDescriptor, scope: u16) -> Option<MatchAnalysis> {
        let mut selectivity = self.selectivity;
        let mut matched = 0usize;
        let mut full = 0usize;
        let mut lower_count = 0usize;
        let mut upper_count = 0usize;
        let mut all_equal = true;
        let mut matches: Vec<ConjunctId> = Vec::new();
        let mut dependencies = BTreeSet::new();

        for segment in &self.segments {
            if segment.scan == SegmentScan::None || segment.scope != scope {
                break;
            }
            matched += 1;
            selectivity *= segment.scan.selectivity_factor();
            if segment.scan.is_equality_class() {
                full += 1;
            }
            all_equal &= segment.scan == SegmentScan::Equal;
            if segment.lower.is_some() {
                lower_count += 1;
            }
            if segment.upper.is_some() {
                upper_count += 1;
            }
            for id in &segment.matches {
                if !matches.contains(id) {
                    matches.push(*id);
                }
            }
            dependencies.extend(segment.dependencies.iter().copied());
            if segment.scan.is_range_class() {
                break;
            }
        }

        if matched == 0 {
            return None;
        }

        Some(MatchAnalysis {
            matched_segments: matched,
            full_matched_segments: full,
            non_full_matched_segments: self.segments.len() - full,
            lower_count,
            upper_count,
            selectivity: cost::clamp_selectivity(selectivity),
            unique: descriptor.unique && all_equal && matched == self.segments.len(),
            matches,
            dependencies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_ast::{FieldId, Literal};
    use kestrel_catalog::{IndexId, IndexSegment, RelationId};

    const STREAM: StreamId = StreamId(0);

    fn descriptor(fields: &[u16], unique: bool, selectivity: f64) -> IndexDescriptor {
        IndexDescriptor {
            id: IndexId(7),
            name: "idx".into(),
            relation: RelationId(1),
            segment_count: fields.len() as u16,
            segments: fields
                .iter()
                .map(|f| IndexSegment {
                    field: FieldId(*f),
                    descending: false,
                })
                .collect(),
            unique,
            selectivity,
        }
    }

    fn field(f: u16) -> ValueExpr {
        ValueExpr::Field {
            stream: STREAM,
            field: FieldId(f),
        }
    }

    fn outer_field(stream: u16, f: u16) -> ValueExpr {
        ValueExpr::Field {
            stream: StreamId(stream),
            field: FieldId(f),
        }
    }

    fn int(n: i64) -> ValueExpr {
        ValueExpr::Literal(Literal::Integer(n))
    }

    fn cmp(op: CmpOp, left: ValueExpr, right: ValueExpr) -> BoolExpr {
        BoolExpr::Cmp { op, left, right }
    }

    #[test]
    fn equality_binds_both_bounds() {
        let desc = descriptor(&[3], false, 0.02);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        assert!(cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(3), int(9)), 0));

        let seg = &cand.segments[0];
        assert_eq!(seg.scan, SegmentScan::Equal);
        assert_eq!(seg.lower, seg.upper);

        let analysis = cand.analyze(&desc, 0).unwrap();
        assert_eq!(analysis.matched_segments, 1);
        assert!((analysis.selectivity - 0.02 * 0.1).abs() < 1e-12);
        assert_eq!(analysis.lower_count, 1);
        assert_eq!(analysis.upper_count, 1);
    }

    #[test]
    fn reversed_operands_are_mirrored() {
        let desc = descriptor(&[3], false, 0.02);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        // `5 < f3` is a lower bound on f3.
        assert!(cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Lt, int(5), field(3)), 0));
        assert_eq!(cand.segments[0].scan, SegmentScan::Greater);
        assert!(cand.segments[0].exclude_lower);
    }

    #[test]
    fn greater_and_less_fuse_into_between() {
        let desc = descriptor(&[3], false, 0.02);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        assert!(cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::GtEq, field(3), int(1)), 0));
        assert!(cand.match_boolean(&desc, STREAM, 1, &cmp(CmpOp::Lt, field(3), int(9)), 0));

        let seg = &cand.segments[0];
        assert_eq!(seg.scan, SegmentScan::Between);
        assert!(!seg.exclude_lower);
        assert!(seg.exclude_upper);
        assert_eq!(seg.matches, vec![0, 1]);
    }

    #[test]
    fn equality_is_not_downgraded() {
        let desc = descriptor(&[3], false, 0.02);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        assert!(cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(3), int(9)), 0));
        // A later range predicate on the bound segment stays residual.
        assert!(!cand.match_boolean(&desc, STREAM, 1, &cmp(CmpOp::Gt, field(3), int(0)), 0));
        assert_eq!(cand.segments[0].scan, SegmentScan::Equal);
    }

    #[test]
    fn starting_requires_a_constant_prefix() {
        let desc = descriptor(&[3], false, 0.02);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        let text = ValueExpr::Literal(Literal::Text("ab".into()));
        assert!(cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Starting, field(3), text), 0));
        assert_eq!(cand.segments[0].scan, SegmentScan::Starting);

        let mut other = IndexCandidate::new(0, &desc, 100.0);
        let nonconst = outer_field(2, 0);
        assert!(!other.match_boolean(
            &desc,
            STREAM,
            0,
            &cmp(CmpOp::Starting, field(3), nonconst),
            0
        ));
    }

    #[test]
    fn match_stops_at_first_unbound_segment() {
        let desc = descriptor(&[1, 2, 3], false, 0.001);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        // Bind segments 0 and 2, leaving 1 unbound: only segment 0 counts.
        assert!(cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(1), int(1)), 0));
        assert!(cand.match_boolean(&desc, STREAM, 1, &cmp(CmpOp::Eq, field(3), int(3)), 0));

        let analysis = cand.analyze(&desc, 0).unwrap();
        assert_eq!(analysis.matched_segments, 1);
        assert_eq!(analysis.matches, vec![0]);
    }

    #[test]
    fn range_segment_closes_the_prefix() {
        let desc = descriptor(&[1, 2, 3], false, 0.001);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        assert!(cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(1), int(1)), 0));
        assert!(cand.match_boolean(&desc, STREAM, 1, &cmp(CmpOp::Gt, field(2), int(5)), 0));
        assert!(cand.match_boolean(&desc, STREAM, 2, &cmp(CmpOp::Eq, field(3), int(3)), 0));

        let analysis = cand.analyze(&desc, 0).unwrap();
        // The range on segment 1 ends the prefix; segment 2's match is unused.
        assert_eq!(analysis.matched_segments, 2);
        assert_eq!(analysis.matches, vec![0, 1]);
        assert_eq!(analysis.non_full_matched_segments, 2);
    }

    #[test]
    fn more_bound_segments_never_increase_selectivity() {
        let desc = descriptor(&[1, 2], false, 0.01);
        let mut one = IndexCandidate::new(0, &desc, 100.0);
        assert!(one.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(1), int(1)), 0));
        let sel_one = one.analyze(&desc, 0).unwrap().selectivity;

        let mut two = one.clone();
        assert!(two.match_boolean(&desc, STREAM, 1, &cmp(CmpOp::Eq, field(2), int(2)), 0));
        let sel_two = two.analyze(&desc, 0).unwrap().selectivity;

        assert!(sel_two <= sel_one);
    }

    #[test]
    fn unique_requires_equality_on_every_segment() {
        let desc = descriptor(&[1, 2], true, 0.001);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        assert!(cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(1), int(1)), 0));
        assert!(cand.match_boolean(&desc, STREAM, 1, &cmp(CmpOp::Gt, field(2), int(2)), 0));
        assert!(!cand.analyze(&desc, 0).unwrap().unique);

        let mut exact = IndexCandidate::new(0, &desc, 100.0);
        assert!(exact.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(1), int(1)), 0));
        assert!(exact.match_boolean(&desc, STREAM, 1, &cmp(CmpOp::Eq, field(2), int(2)), 0));
        assert!(exact.analyze(&desc, 0).unwrap().unique);

        // Equivalence pins the segment but does not make the match unique.
        let mut equiv = IndexCandidate::new(0, &desc, 100.0);
        assert!(equiv.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(1), int(1)), 0));
        assert!(equiv.match_boolean(&desc, STREAM, 1, &cmp(CmpOp::Equiv, field(2), int(2)), 0));
        assert!(!equiv.analyze(&desc, 0).unwrap().unique);
    }

    #[test]
    fn outer_stream_references_become_dependencies() {
        let desc = descriptor(&[1], false, 0.01);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        assert!(cand.match_boolean(
            &desc,
            STREAM,
            0,
            &cmp(CmpOp::Eq, field(1), outer_field(4, 0)),
            0
        ));
        let analysis = cand.analyze(&desc, 0).unwrap();
        assert_eq!(
            analysis.dependencies.into_iter().collect::<Vec<_>>(),
            vec![StreamId(4)]
        );
    }

    #[test]
    fn no_match_is_a_silent_non_candidate() {
        let desc = descriptor(&[1], false, 0.01);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        // Predicate on a field the index does not cover.
        assert!(!cand.match_boolean(&desc, STREAM, 0, &cmp(CmpOp::Eq, field(9), int(1)), 0));
        assert!(!cand.candidate);
        assert!(cand.analyze(&desc, 0).is_none());
    }

    #[test]
    fn missing_scan_has_no_bounds() {
        let desc = descriptor(&[1], false, 0.01);
        let mut cand = IndexCandidate::new(0, &desc, 100.0);
        assert!(cand.match_boolean(&desc, STREAM, 0, &BoolExpr::Missing { value: field(1) }, 0));
        let seg = &cand.segments[0];
        assert_eq!(seg.scan, SegmentScan::Missing);
        assert!(seg.lower.is_none() && seg.upper.is_none());
        // Missing counts as a full match for selectivity purposes.
        let analysis = cand.analyze(&desc, 0).unwrap();
        assert_eq!(analysis.full_matched_segments, 1);
        assert_eq!(analysis.lower_count, 0);
    }
}
