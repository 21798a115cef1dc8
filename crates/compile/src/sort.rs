//! Sort planning: the seven limit/offset/order shapes.

use tidal_common::Result;
use tidal_pipeline::evaluator::eval_const_i64;
use tidal_pipeline::ops::{LimitArg, OffsetArg, OrderArg, TopArg};
use tidal_pipeline::{Instruction, OperatorArg, Scope};
use tidal_plan::Node;

use crate::compile::Compile;
use crate::scope_list;

/// Translate a node's `{limit, offset, order_by}` into the right operator
/// shape around `ss`.
pub(crate) fn compile_sort(c: &mut Compile, n: &Node, ss: Vec<Scope>) -> Result<Vec<Scope>> {
    match (&n.limit, &n.offset, n.order_by.is_empty()) {
        // Top-N: per-scope bounded heaps, one merging heap.
        (Some(limit), None, false) => {
            let limit = eval_const_i64(limit)?;
            Ok(compile_top(c, n, limit, ss))
        }
        (None, None, false) => Ok(compile_order(c, n, ss)),
        (Some(limit), Some(offset), false) => {
            let limit = eval_const_i64(limit)?;
            let offset = eval_const_i64(offset)?;
            // Small windows rewrite to Top(limit+offset) then Offset, which
            // keeps memory bounded and skips the full sort.
            if limit + offset <= c.config.top_offset_rewrite_max {
                let topped = compile_top(c, n, limit + offset, ss);
                Ok(compile_offset(c, offset, topped))
            } else {
                let ordered = compile_order(c, n, ss);
                let shifted = compile_offset(c, offset, ordered);
                Ok(compile_limit(c, limit, shifted))
            }
        }
        (None, Some(offset), false) => {
            let offset = eval_const_i64(offset)?;
            let ordered = compile_order(c, n, ss);
            Ok(compile_offset(c, offset, ordered))
        }
        (Some(limit), None, true) => {
            let limit = eval_const_i64(limit)?;
            Ok(compile_limit(c, limit, ss))
        }
        (None, Some(offset), true) => {
            let offset = eval_const_i64(offset)?;
            Ok(compile_offset(c, offset, ss))
        }
        (Some(limit), Some(offset), true) => {
            let limit = eval_const_i64(limit)?;
            let offset = eval_const_i64(offset)?;
            let shifted = compile_offset(c, offset, ss);
            Ok(compile_limit(c, limit, shifted))
        }
        (None, None, true) => Ok(ss),
    }
}

pub(crate) fn compile_top(c: &mut Compile, n: &Node, top_n: i64, mut ss: Vec<Scope>) -> Vec<Scope> {
    let current_first = c.anal.is_first;
    for s in &mut ss {
        c.anal.is_first = current_first;
        scope_list::wrap_broken_scope(c, s);
        s.append_instruction(
            Instruction::new(
                c.anal.curr,
                OperatorArg::Top(TopArg::new(top_n, n.order_by.clone())),
            )
            .first(c.anal.is_first),
        );
    }
    c.anal.is_first = false;

    let mut rs = scope_list::new_merge_scope(c, ss);
    rs.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::MergeTop(TopArg::new(top_n, n.order_by.clone())),
    ));
    vec![rs]
}

pub(crate) fn compile_order(c: &mut Compile, n: &Node, mut ss: Vec<Scope>) -> Vec<Scope> {
    let current_first = c.anal.is_first;
    for s in &mut ss {
        c.anal.is_first = current_first;
        scope_list::wrap_broken_scope(c, s);
        s.append_instruction(
            Instruction::new(
                c.anal.curr,
                OperatorArg::Order(OrderArg::new(n.order_by.clone())),
            )
            .first(c.anal.is_first),
        );
    }
    c.anal.is_first = false;

    let mut rs = scope_list::new_merge_scope(c, ss);
    rs.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::MergeOrder(OrderArg::new(n.order_by.clone())),
    ));
    vec![rs]
}

pub(crate) fn compile_offset(c: &mut Compile, offset: i64, mut ss: Vec<Scope>) -> Vec<Scope> {
    let current_first = c.anal.is_first;
    for s in &mut ss {
        if scope_list::contains_broken_node(s) {
            c.anal.is_first = current_first;
            scope_list::wrap_broken_scope(c, s);
        }
    }
    let mut rs = scope_list::new_merge_scope(c, ss);
    rs.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::MergeOffset(OffsetArg::new(offset)),
    ));
    vec![rs]
}

pub(crate) fn compile_limit(c: &mut Compile, limit: i64, mut ss: Vec<Scope>) -> Vec<Scope> {
    let current_first = c.anal.is_first;
    for s in &mut ss {
        c.anal.is_first = current_first;
        scope_list::wrap_broken_scope(c, s);
        s.append_instruction(
            Instruction::new(c.anal.curr, OperatorArg::Limit(LimitArg::new(limit)))
                .first(c.anal.is_first),
        );
    }
    c.anal.is_first = false;

    let mut rs = scope_list::new_merge_scope(c, ss);
    rs.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::MergeLimit(LimitArg::new(limit)),
    ));
    vec![rs]
}
