//! Predicate pretty-printing via `fmt::Display`.
//!
//! Used by plan rendering and log events; the output is for humans, not for
//! re-parsing.

use crate::{BoolExpr, CmpOp, Literal, ValueExpr};
use std::fmt;

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Null => f.write_str("NULL"),
        }
    }
}

impl fmt::Display for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(lit) => write!(f, "{lit}"),
            Self::Parameter(n) => write!(f, "?{n}"),
            Self::Field { stream, field } => write!(f, "{stream}.{field}"),
            Self::RowId { stream } => write!(f, "{stream}.rowid"),
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Equiv => "IS NOT DISTINCT FROM",
            Self::Starting => "STARTING WITH",
        };
        f.write_str(s)
    }
}

impl fmt::Display for BoolExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cmp { op, left, right } => write!(f, "{left} {op} {right}"),
            Self::Between { value, low, high } => {
                write!(f, "{value} BETWEEN {low} AND {high}")
            }
            Self::Missing { value } => write!(f, "{value} IS NULL"),
            Self::And(a, b) => write!(f, "({a} AND {b})"),
            Self::Or(a, b) => write!(f, "({a} OR {b})"),
            Self::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{BoolExpr, CmpOp, FieldId, Literal, StreamId, ValueExpr};

    #[test]
    fn renders_a_comparison() {
        let e = BoolExpr::Cmp {
            op: CmpOp::Eq,
            left: ValueExpr::Field {
                stream: StreamId(0),
                field: FieldId(2),
            },
            right: ValueExpr::Literal(Literal::Text("ok".into())),
        };
        assert_eq!(e.to_string(), "s0.f2 = 'ok'");
    }

    #[test]
    fn escapes_embedded_quotes() {
        let lit = Literal::Text("o'brien".into());
        assert_eq!(lit.to_string(), "'o''brien'");
    }
}
