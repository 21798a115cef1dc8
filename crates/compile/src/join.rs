//! Join planning: broadcast vs bucketed layouts, operator-kind selection.

use arrow_schema::DataType;
use tidal_common::{Result, TidalError};
use tidal_pipeline::ops::{product_arg, JoinArg, JoinKind, LoopJoinArg, LoopJoinKind, SetOpArg, SetOpKind};
use tidal_pipeline::{Instruction, OperatorArg, Scope};
use tidal_plan::{is_equi_join, Expr, JoinType, Node, NodeType};

use crate::compile::{combine_filters, Compile};
use crate::scope_list;

/// Whether the planner may lower equi mark joins to a hash mark operator.
/// Kept false: mark joins always take the nested-loop path.
pub(crate) fn supports_equi_mark() -> bool {
    false
}

fn side_types(node: &Node) -> Vec<DataType> {
    if !node.project_types.is_empty() {
        return node.project_types.clone();
    }
    node.table_def
        .as_ref()
        .map(|d| d.col_types())
        .unwrap_or_default()
}

// Split `on_list` into (probe_col, build_col) pairs. Conditions index the
// joined row: probe columns first, build columns offset by the probe width.
fn equi_conds(on_list: &[Expr], probe_width: usize) -> Result<Vec<(usize, usize)>> {
    on_list
        .iter()
        .map(|cond| {
            let (a, b) = cond
                .as_equi_cond()
                .ok_or_else(|| TidalError::Plan("expected equi join condition".to_string()))?;
            if a < probe_width && b >= probe_width {
                Ok((a, b - probe_width))
            } else if b < probe_width && a >= probe_width {
                Ok((b, a - probe_width))
            } else {
                Err(TidalError::Plan(format!(
                    "join condition {a}={b} does not cross the join boundary"
                )))
            }
        })
        .collect()
}

/// Plan one JOIN node over compiled left/right scope lists.
pub(crate) fn compile_join(
    c: &mut Compile,
    node: &Node,
    left_node: &Node,
    right_node: &Node,
    ss: Vec<Scope>,
    children: Vec<Scope>,
) -> Result<Vec<Scope>> {
    scope_list::ensure_live_scopes(&ss)?;
    let join_type = node
        .join_type
        .ok_or_else(|| TidalError::Plan("join node without join type".to_string()))?;
    let is_eq = is_equi_join(&node.on_list);
    let left_types = side_types(left_node);
    let right_types = side_types(right_node);
    let probe_width = left_types.len();

    let hash_arg = |kind: JoinKind| -> Result<JoinArg> {
        Ok(JoinArg::new(
            kind,
            equi_conds(&node.on_list, probe_width)?,
            left_types.clone(),
            right_types.clone(),
        ))
    };
    let loop_arg = |kind: LoopJoinKind| -> LoopJoinArg {
        LoopJoinArg::new(kind, combine_filters(&node.on_list), right_types.clone())
    };

    let mut rs = match join_type {
        JoinType::Inner => {
            let mut rs = scope_list::new_broadcast_join_scope_list(c, ss, children);
            for s in &mut rs {
                let arg = if node.on_list.is_empty() {
                    OperatorArg::Product(product_arg(right_types.clone()))
                } else if is_eq {
                    OperatorArg::Join(hash_arg(JoinKind::Inner)?)
                } else {
                    OperatorArg::LoopJoin(loop_arg(LoopJoinKind::Inner))
                };
                s.append_instruction(Instruction::new(c.anal.curr, arg));
            }
            rs
        }
        JoinType::Semi | JoinType::Anti => {
            let right_kind = if join_type == JoinType::Semi {
                JoinKind::RightSemi
            } else {
                JoinKind::RightAnti
            };
            let plain_kind = if join_type == JoinType::Semi {
                JoinKind::Semi
            } else {
                JoinKind::Anti
            };
            let loop_kind = if join_type == JoinType::Semi {
                LoopJoinKind::Semi
            } else {
                LoopJoinKind::Anti
            };
            if is_eq && node.build_on_left {
                let rs0 = scope_list::new_scope_list_for_right_join(c, 2, &ss);
                let mut rs = scope_list::new_join_scope_list_with_bucket(c, rs0, ss, children);
                let nbucket = rs.len() as u64;
                for (i, s) in rs.iter_mut().enumerate() {
                    s.append_instruction(Instruction::new(
                        c.anal.curr,
                        OperatorArg::Join(
                            hash_arg(right_kind)?.with_bucket(i as u64, nbucket),
                        ),
                    ));
                }
                rs
            } else if is_eq {
                let mut rs = scope_list::new_broadcast_join_scope_list(c, ss, children);
                for s in &mut rs {
                    s.append_instruction(Instruction::new(
                        c.anal.curr,
                        OperatorArg::Join(hash_arg(plain_kind)?),
                    ));
                }
                rs
            } else {
                let mut rs = scope_list::new_broadcast_join_scope_list(c, ss, children);
                for s in &mut rs {
                    s.append_instruction(Instruction::new(
                        c.anal.curr,
                        OperatorArg::LoopJoin(loop_arg(loop_kind)),
                    ));
                }
                rs
            }
        }
        JoinType::Left => {
            let mut rs = scope_list::new_broadcast_join_scope_list(c, ss, children);
            for s in &mut rs {
                let arg = if is_eq {
                    OperatorArg::Join(hash_arg(JoinKind::Left)?)
                } else {
                    OperatorArg::LoopJoin(loop_arg(LoopJoinKind::Left))
                };
                s.append_instruction(Instruction::new(c.anal.curr, arg));
            }
            rs
        }
        JoinType::Right => {
            if !is_eq {
                // The planner rewrites non-equi right joins to left joins;
                // reaching here is a malformed plan.
                return Err(TidalError::Plan(
                    "non-equi right join must be rewritten to a left join".to_string(),
                ));
            }
            let rs0 = scope_list::new_scope_list_for_right_join(c, 2, &ss);
            let mut rs = scope_list::new_join_scope_list_with_bucket(c, rs0, ss, children);
            let nbucket = rs.len() as u64;
            for (i, s) in rs.iter_mut().enumerate() {
                s.append_instruction(Instruction::new(
                    c.anal.curr,
                    OperatorArg::Join(
                        hash_arg(JoinKind::Right)?.with_bucket(i as u64, nbucket),
                    ),
                ));
            }
            rs
        }
        JoinType::Single => {
            let mut rs = scope_list::new_broadcast_join_scope_list(c, ss, children);
            for s in &mut rs {
                let arg = if is_eq {
                    OperatorArg::Join(hash_arg(JoinKind::Single)?)
                } else {
                    OperatorArg::LoopJoin(loop_arg(LoopJoinKind::Single))
                };
                s.append_instruction(Instruction::new(c.anal.curr, arg));
            }
            rs
        }
        JoinType::Mark => {
            // Lowered to the nested-loop mark operator regardless of
            // equi-ness; see supports_equi_mark.
            debug_assert!(!supports_equi_mark());
            let mut rs = scope_list::new_broadcast_join_scope_list(c, ss, children);
            for s in &mut rs {
                s.append_instruction(Instruction::new(
                    c.anal.curr,
                    OperatorArg::LoopJoin(loop_arg(LoopJoinKind::Mark)),
                ));
            }
            rs
        }
    };
    for s in &mut rs {
        s.is_join = true;
    }
    Ok(rs)
}

/// Plan MINUS / INTERSECT / INTERSECT ALL as a bucketed scope list.
pub(crate) fn compile_minus_and_intersect(
    c: &mut Compile,
    n: &Node,
    ss: Vec<Scope>,
    children: Vec<Scope>,
) -> Result<Vec<Scope>> {
    let kind = match n.node_type {
        NodeType::Minus => SetOpKind::Minus,
        NodeType::Intersect => SetOpKind::Intersect,
        NodeType::IntersectAll => SetOpKind::IntersectAll,
        other => {
            return Err(TidalError::Plan(format!(
                "unexpected set-op node {other:?}"
            )))
        }
    };
    let blocks = n.stats.block_num as usize;
    let rs0 = scope_list::new_scope_list(c, 2, blocks);
    let mut rs = scope_list::new_join_scope_list_with_bucket(c, rs0, ss, children);
    let nbucket = rs.len() as u64;
    for (i, s) in rs.iter_mut().enumerate() {
        // The set operator replaces the merge head: it owns both receivers.
        s.instructions[0] = Instruction::new(
            c.anal.curr,
            OperatorArg::SetOp(SetOpArg::new(kind, i as u64, nbucket)),
        );
    }
    Ok(rs)
}
