//! Expression evaluation over Arrow batches.
//!
//! Everything evaluates to a full-length column; literals are expanded to the
//! batch length so the comparison/arithmetic kernels always see two arrays.

use std::sync::Arc;

use arrow::array::{new_null_array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::kernels::cmp;
use arrow::compute::kernels::numeric;
use arrow::compute::{and_kleene, is_not_null, is_null, not, or_kleene};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use tidal_common::{Result, TidalError};
use tidal_plan::{BinaryOp, Expr, Value};

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// Expand a literal to a column of `len` rows.
pub fn literal_array(value: &Value, len: usize) -> ArrayRef {
    match value {
        Value::Null => new_null_array(&DataType::Int64, len),
        Value::Bool(v) => Arc::new(BooleanArray::from(vec![*v; len])),
        Value::Int64(v) => Arc::new(Int64Array::from(vec![*v; len])),
        Value::Float64(v) => Arc::new(Float64Array::from(vec![*v; len])),
        Value::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str(); len])),
    }
}

fn as_boolean(array: &ArrayRef, what: &str) -> Result<BooleanArray> {
    array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .cloned()
        .ok_or_else(|| execution(format!("{what} must evaluate to boolean")))
}

/// Evaluate `expr` against `batch`, producing a column of the batch's length.
pub fn eval(expr: &Expr, batch: &RecordBatch) -> Result<ArrayRef> {
    match expr {
        Expr::Column(idx) => batch
            .columns()
            .get(*idx)
            .cloned()
            .ok_or_else(|| execution(format!("column {idx} out of range"))),
        Expr::Literal(value) => Ok(literal_array(value, batch.num_rows())),
        Expr::Binary { op, left, right } => {
            let l = eval(left, batch)?;
            let r = eval(right, batch)?;
            eval_binary(*op, &l, &r)
        }
        Expr::IsNull(inner) => {
            let v = eval(inner, batch)?;
            Ok(Arc::new(
                is_null(v.as_ref()).map_err(|e| execution(format!("is_null: {e}")))?,
            ))
        }
        Expr::IsNotNull(inner) => {
            let v = eval(inner, batch)?;
            Ok(Arc::new(
                is_not_null(v.as_ref()).map_err(|e| execution(format!("is_not_null: {e}")))?,
            ))
        }
        Expr::Not(inner) => {
            let v = eval(inner, batch)?;
            let b = as_boolean(&v, "NOT operand")?;
            Ok(Arc::new(
                not(&b).map_err(|e| execution(format!("not: {e}")))?,
            ))
        }
    }
}

fn eval_binary(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    let cmp_err = |e| execution(format!("comparison failed: {e}"));
    let num_err = |e| execution(format!("arithmetic failed: {e}"));
    Ok(match op {
        BinaryOp::Eq => Arc::new(cmp::eq(l, r).map_err(cmp_err)?),
        BinaryOp::NotEq => Arc::new(cmp::neq(l, r).map_err(cmp_err)?),
        BinaryOp::Lt => Arc::new(cmp::lt(l, r).map_err(cmp_err)?),
        BinaryOp::LtEq => Arc::new(cmp::lt_eq(l, r).map_err(cmp_err)?),
        BinaryOp::Gt => Arc::new(cmp::gt(l, r).map_err(cmp_err)?),
        BinaryOp::GtEq => Arc::new(cmp::gt_eq(l, r).map_err(cmp_err)?),
        BinaryOp::Plus => numeric::add(l, r).map_err(num_err)?,
        BinaryOp::Minus => numeric::sub(l, r).map_err(num_err)?,
        BinaryOp::Multiply => numeric::mul(l, r).map_err(num_err)?,
        BinaryOp::Divide => numeric::div(l, r).map_err(num_err)?,
        BinaryOp::And => {
            let (lb, rb) = (as_boolean(l, "AND operand")?, as_boolean(r, "AND operand")?);
            Arc::new(and_kleene(&lb, &rb).map_err(cmp_err)?)
        }
        BinaryOp::Or => {
            let (lb, rb) = (as_boolean(l, "OR operand")?, as_boolean(r, "OR operand")?);
            Arc::new(or_kleene(&lb, &rb).map_err(cmp_err)?)
        }
    })
}

/// Evaluate a predicate to a boolean selection column.
pub fn eval_predicate(expr: &Expr, batch: &RecordBatch) -> Result<BooleanArray> {
    let v = eval(expr, batch)?;
    as_boolean(&v, "predicate")
}

/// Fold a constant expression (LIMIT/OFFSET) to an i64.
pub fn eval_const_i64(expr: &Expr) -> Result<i64> {
    match expr {
        Expr::Literal(Value::Int64(v)) => Ok(*v),
        Expr::Literal(Value::Float64(v)) => Ok(*v as i64),
        Expr::Binary { op, left, right } => {
            let l = eval_const_i64(left)?;
            let r = eval_const_i64(right)?;
            Ok(match op {
                BinaryOp::Plus => l + r,
                BinaryOp::Minus => l - r,
                BinaryOp::Multiply => l * r,
                BinaryOp::Divide => {
                    if r == 0 {
                        return Err(execution("division by zero in constant fold"));
                    }
                    l / r
                }
                _ => return Err(execution("non-arithmetic constant expression")),
            })
        }
        other => Err(execution(format!(
            "expression {other:?} is not a foldable constant"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{Field, Schema};

    fn two_col_batch() -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("a", DataType::Int64, true),
                Field::new("b", DataType::Int64, true),
            ])),
            vec![
                Arc::new(Int64Array::from(vec![Some(1), Some(5), None])),
                Arc::new(Int64Array::from(vec![Some(4), Some(5), Some(6)])),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn column_comparison() {
        let batch = two_col_batch();
        let pred = Expr::col_eq(0, 1);
        let mask = eval_predicate(&pred, &batch).expect("eval");
        assert_eq!(mask.value(0), false);
        assert_eq!(mask.value(1), true);
        assert!(mask.is_null(2));
    }

    #[test]
    fn arithmetic_with_literal() {
        let batch = two_col_batch();
        let sum = Expr::Binary {
            op: BinaryOp::Plus,
            left: Box::new(Expr::Column(1)),
            right: Box::new(Expr::Literal(Value::Int64(10))),
        };
        let out = eval(&sum, &batch).expect("eval");
        let out = out.as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(out.value(0), 14);
    }

    #[test]
    fn const_fold_limit_plus_offset() {
        let expr = Expr::Binary {
            op: BinaryOp::Plus,
            left: Box::new(Expr::Literal(Value::Int64(100))),
            right: Box::new(Expr::Literal(Value::Int64(50))),
        };
        assert_eq!(eval_const_i64(&expr).expect("fold"), 150);
    }
}
