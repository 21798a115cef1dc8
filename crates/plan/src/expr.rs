//! Scalar expressions carried by plan nodes.
//!
//! The compiler only wires expressions through to operators; evaluation
//! happens in the pipeline crate. The set is deliberately closed — function
//! kernels beyond it are external collaborators.

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

/// A constant scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL with no carried type.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// 64-bit signed integer literal.
    Int64(i64),
    /// 64-bit float literal.
    Float64(f64),
    /// UTF-8 string literal.
    Utf8(String),
}

impl Value {
    /// Arrow type of this literal; NULL maps to Int64 like an untyped
    /// planner constant.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null | Value::Int64(_) => DataType::Int64,
            Value::Bool(_) => DataType::Boolean,
            Value::Float64(_) => DataType::Float64,
            Value::Utf8(_) => DataType::Utf8,
        }
    }
}

/// Binary operators understood by the expression evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Equality comparison.
    Eq,
    /// Inequality comparison.
    NotEq,
    /// Less-than comparison.
    Lt,
    /// Less-or-equal comparison.
    LtEq,
    /// Greater-than comparison.
    Gt,
    /// Greater-or-equal comparison.
    GtEq,
    /// Addition.
    Plus,
    /// Subtraction.
    Minus,
    /// Multiplication.
    Multiply,
    /// Division.
    Divide,
    /// Logical AND.
    And,
    /// Logical OR.
    Or,
}

impl BinaryOp {
    /// Whether the operator yields a boolean column.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
                | BinaryOp::And
                | BinaryOp::Or
        )
    }
}

/// A scalar expression over a child node's output columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to a column of the input batch by position.
    Column(usize),
    /// Constant literal.
    Literal(Value),
    /// Binary operation.
    Binary {
        /// Operator kind.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// NULL test.
    IsNull(Box<Expr>),
    /// Negated NULL test.
    IsNotNull(Box<Expr>),
    /// Boolean negation.
    Not(Box<Expr>),
}

impl Expr {
    /// Convenience constructor for an equality predicate between two columns.
    pub fn col_eq(left: usize, right: usize) -> Self {
        Expr::Binary {
            op: BinaryOp::Eq,
            left: Box::new(Expr::Column(left)),
            right: Box::new(Expr::Column(right)),
        }
    }

    /// The column index if this expression is a bare column reference.
    pub fn as_column(&self) -> Option<usize> {
        match self {
            Expr::Column(idx) => Some(*idx),
            _ => None,
        }
    }

    /// For an equi-join condition `left_col = right_col`, the pair of column
    /// positions (probe side, build side). Returns `None` for anything else.
    pub fn as_equi_cond(&self) -> Option<(usize, usize)> {
        match self {
            Expr::Binary {
                op: BinaryOp::Eq,
                left,
                right,
            } => match (left.as_column(), right.as_column()) {
                (Some(l), Some(r)) => Some((l, r)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Whether every join condition in `on_list` is a plain column equality.
pub fn is_equi_join(on_list: &[Expr]) -> bool {
    !on_list.is_empty() && on_list.iter().all(|e| e.as_equi_cond().is_some())
}

/// Aggregate functions supported by the grouping operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    /// Row count.
    Count,
    /// Sum of a numeric column.
    Sum,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
}

/// One aggregate call in an AGG node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggExpr {
    /// Aggregate function.
    pub func: AggFunc,
    /// Argument expression.
    pub arg: Expr,
}

/// NULL placement for one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullsOrder {
    /// Explicit NULLS FIRST.
    First,
    /// Explicit NULLS LAST.
    Last,
    /// Follow the direction: DESC sorts nulls last, ASC sorts nulls first.
    Default,
}

/// One ORDER BY key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Sort key expression.
    pub expr: Expr,
    /// Descending order flag.
    pub desc: bool,
    /// NULL placement.
    pub nulls: NullsOrder,
}

impl OrderSpec {
    /// Resolve NULL placement: explicit flags win, otherwise nulls sort last
    /// exactly when the key is descending.
    pub fn nulls_last(&self) -> bool {
        match self.nulls {
            NullsOrder::First => false,
            NullsOrder::Last => true,
            NullsOrder::Default => self.desc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equi_cond_extraction() {
        let cond = Expr::col_eq(0, 2);
        assert_eq!(cond.as_equi_cond(), Some((0, 2)));
        assert!(is_equi_join(&[cond]));

        let non_equi = Expr::Binary {
            op: BinaryOp::Lt,
            left: Box::new(Expr::Column(0)),
            right: Box::new(Expr::Column(1)),
        };
        assert_eq!(non_equi.as_equi_cond(), None);
        assert!(!is_equi_join(&[non_equi]));
        assert!(!is_equi_join(&[]));
    }

    #[test]
    fn nulls_default_follows_direction() {
        let asc = OrderSpec {
            expr: Expr::Column(0),
            desc: false,
            nulls: NullsOrder::Default,
        };
        let desc = OrderSpec {
            expr: Expr::Column(0),
            desc: true,
            nulls: NullsOrder::Default,
        };
        assert!(!asc.nulls_last());
        assert!(desc.nulls_last());
    }
}
