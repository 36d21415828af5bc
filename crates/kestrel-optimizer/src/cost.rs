//! Cost-model constants and the shared numeric helpers built on them.
//!
//! The reduction factors are empirical tuning values carried over from years
//! of production plan shapes. They are not derived from data, and they are
//! load-bearing: changing any of them silently changes which plans win, so
//! the plan-compatibility tests pin them bit-exactly.

use kestrel_ast::{BoolExpr, CmpOp};

/// Selectivity multiplier for a `BETWEEN` segment scan.
pub const REDUCE_SELECTIVITY_FACTOR_BETWEEN: f64 = 0.0025;
/// Selectivity multiplier for an upper-bounded (`<`, `<=`) segment scan.
pub const REDUCE_SELECTIVITY_FACTOR_LESS: f64 = 0.05;
/// Selectivity multiplier for a lower-bounded (`>`, `>=`) segment scan.
pub const REDUCE_SELECTIVITY_FACTOR_GREATER: f64 = 0.05;
/// Selectivity multiplier for a prefix (`STARTING WITH`) segment scan.
pub const REDUCE_SELECTIVITY_FACTOR_STARTING: f64 = 0.01;
/// Selectivity multiplier for an equality-class segment scan.
pub const REDUCE_SELECTIVITY_FACTOR_EQUALITY: f64 = 0.1;
/// Selectivity estimate multiplier for a `<>` residual comparison.
pub const REDUCE_SELECTIVITY_FACTOR_INEQUALITY: f64 = 0.5;

/// Selectivity is a fraction of rows; it never exceeds this.
pub const MAXIMUM_SELECTIVITY: f64 = 1.0;
/// Stand-in selectivity when index statistics are missing or degenerate.
pub const DEFAULT_SELECTIVITY: f64 = 0.1;

/// Cardinality estimates are clamped up to this floor.
pub const MINIMUM_CARDINALITY: f64 = 1.0;
/// Streams at or below this many estimated rows are cheaper to scan than to
/// reach through an index; no indexed relationship is recorded for them.
pub const THRESHOLD_CARDINALITY: f64 = 5.0;

/// Baseline page cost charged per index involved in a retrieval.
pub const DEFAULT_INDEX_COST: f64 = 1.0;

/// Clamp a combined selectivity into `(0, MAXIMUM_SELECTIVITY]`.
#[must_use]
pub fn clamp_selectivity(selectivity: f64) -> f64 {
    if !selectivity.is_finite() || selectivity <= 0.0 {
        return DEFAULT_SELECTIVITY;
    }
    selectivity.min(MAXIMUM_SELECTIVITY)
}

/// Base selectivity of an index from its statistics, with the missing and
/// degenerate cases (zero, negative, non-finite) degrading to
/// [`DEFAULT_SELECTIVITY`].
#[must_use]
pub fn base_selectivity(statistics: f64) -> f64 {
    clamp_selectivity(statistics)
}

/// Clamp a cardinality estimate up to [`MINIMUM_CARDINALITY`].
#[must_use]
pub fn clamp_cardinality(cardinality: f64) -> f64 {
    if !cardinality.is_finite() || cardinality < MINIMUM_CARDINALITY {
        MINIMUM_CARDINALITY
    } else {
        cardinality
    }
}

/// Estimated page cost of retrieving through `indexes` combined indexes over
/// a relation of `cardinality` rows at the given combined selectivity.
#[must_use]
pub fn index_retrieval_cost(indexes: usize, cardinality: f64, selectivity: f64) -> f64 {
    DEFAULT_INDEX_COST * indexes as f64 + cardinality * selectivity
}

/// Estimated cost of sorting `rows` rows: `n · log2(n)` with a floor so a
/// one-row sort still costs something.
#[must_use]
pub fn sort_cost(rows: f64) -> f64 {
    let rows = clamp_cardinality(rows);
    rows * rows.max(2.0).log2()
}

/// Estimated selectivity of a predicate applied as a residual filter, used
/// to scale result-cardinality estimates for conjuncts no index absorbed.
#[must_use]
pub fn comparison_selectivity(predicate: &BoolExpr) -> f64 {
    match predicate {
        BoolExpr::Cmp { op, .. } => match op {
            CmpOp::Eq | CmpOp::Equiv => REDUCE_SELECTIVITY_FACTOR_EQUALITY,
            CmpOp::NotEq => REDUCE_SELECTIVITY_FACTOR_INEQUALITY,
            CmpOp::Lt | CmpOp::LtEq => REDUCE_SELECTIVITY_FACTOR_LESS,
            CmpOp::Gt | CmpOp::GtEq => REDUCE_SELECTIVITY_FACTOR_GREATER,
            CmpOp::Starting => REDUCE_SELECTIVITY_FACTOR_STARTING,
        },
        BoolExpr::Between { .. } => REDUCE_SELECTIVITY_FACTOR_BETWEEN,
        BoolExpr::Missing { .. } => REDUCE_SELECTIVITY_FACTOR_EQUALITY,
        BoolExpr::And(a, b) => {
            clamp_selectivity(comparison_selectivity(a) * comparison_selectivity(b))
        }
        BoolExpr::Or(a, b) => {
            (comparison_selectivity(a) + comparison_selectivity(b)).min(MAXIMUM_SELECTIVITY)
        }
        BoolExpr::Not(inner) => {
            (MAXIMUM_SELECTIVITY - comparison_selectivity(inner)).max(DEFAULT_SELECTIVITY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_ast::{FieldId, Literal, StreamId, ValueExpr};

    #[test]
    fn degenerate_statistics_fall_back_to_default() {
        assert_eq!(base_selectivity(0.0), DEFAULT_SELECTIVITY);
        assert_eq!(base_selectivity(-0.3), DEFAULT_SELECTIVITY);
        assert_eq!(base_selectivity(f64::NAN), DEFAULT_SELECTIVITY);
        assert_eq!(base_selectivity(2.0), MAXIMUM_SELECTIVITY);
        assert_eq!(base_selectivity(0.02), 0.02);
    }

    #[test]
    fn cardinality_is_floored() {
        assert_eq!(clamp_cardinality(0.0), MINIMUM_CARDINALITY);
        assert_eq!(clamp_cardinality(f64::NAN), MINIMUM_CARDINALITY);
        assert_eq!(clamp_cardinality(250.0), 250.0);
    }

    #[test]
    fn sort_cost_grows_superlinearly() {
        assert!(sort_cost(1000.0) > sort_cost(100.0) * 5.0);
        assert!(sort_cost(1.0) >= 1.0);
    }

    #[test]
    fn residual_selectivity_uses_the_pinned_factors() {
        let cmp = BoolExpr::Cmp {
            op: kestrel_ast::CmpOp::NotEq,
            left: ValueExpr::Field {
                stream: StreamId(0),
                field: FieldId(0),
            },
            right: ValueExpr::Literal(Literal::Integer(1)),
        };
        assert_eq!(
            comparison_selectivity(&cmp),
            REDUCE_SELECTIVITY_FACTOR_INEQUALITY
        );
        let or = cmp.clone().or(cmp.clone());
        assert_eq!(comparison_selectivity(&or), 1.0);
        let and = cmp.clone().and(cmp);
        assert_eq!(comparison_selectivity(&and), 0.25);
    }
}
