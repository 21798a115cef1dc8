//! Instructions: one operator in a pipeline.
//!
//! The opcode is the closed set of pipeline operators; the argument is a
//! tagged variant carrying the operator's typed state. Dispatch is a single
//! match over the variant — no downcasts anywhere in the call path.

use std::fmt;

use tidal_common::Result;

use crate::ops::{
    ConnectorArg, DeletionArg, DispatchArg, ExternalArg, GroupArg, HashBuildArg, InsertArg,
    JoinArg, JoinKind, LimitArg, LoopJoinArg, LoopJoinKind, MergeArg, MergeBlockArg,
    MergeDeleteArg, OffsetArg, OnDuplicateKeyArg, OrderArg, OutputArg, PreInsertArg,
    ProjectionArg, RestrictArg, SetOpArg, SetOpKind, TableFunctionArg, TableScanArg, TopArg,
    UpdateArg,
};
use crate::process::Process;

/// Closed set of pipeline operator codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum OpCode {
    Merge,
    MergeGroup,
    MergeTop,
    MergeOrder,
    MergeLimit,
    MergeOffset,
    MergeDelete,
    MergeBlock,
    Top,
    Order,
    Limit,
    Offset,
    Group,
    Restrict,
    Projection,
    Join,
    LoopJoin,
    Left,
    LoopLeft,
    Right,
    Single,
    LoopSingle,
    Semi,
    LoopSemi,
    RightSemi,
    Anti,
    LoopAnti,
    RightAnti,
    LoopMark,
    Minus,
    Intersect,
    IntersectAll,
    Product,
    External,
    TableFunction,
    TableScan,
    PreInsert,
    Insert,
    Deletion,
    Update,
    OnDuplicateKey,
    HashBuild,
    Connector,
    Dispatch,
    Output,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Operator argument: one variant per operator family; join/set families
/// carry their precise opcode in the argument's kind.
pub enum OperatorArg {
    /// Fan-in head.
    Merge(MergeArg),
    /// Merge-combine aggregation.
    MergeGroup(GroupArg),
    /// Merge-side bounded top-N.
    MergeTop(TopArg),
    /// Merge-side full sort.
    MergeOrder(OrderArg),
    /// Merge-side limit.
    MergeLimit(LimitArg),
    /// Merge-side offset.
    MergeOffset(OffsetArg),
    /// Distributed-delete terminal.
    MergeDelete(MergeDeleteArg),
    /// Distributed-insert terminal.
    MergeBlock(MergeBlockArg),
    /// Per-scope bounded top-N.
    Top(TopArg),
    /// Per-scope full sort.
    Order(OrderArg),
    /// Per-scope limit.
    Limit(LimitArg),
    /// Per-scope offset.
    Offset(OffsetArg),
    /// Hash aggregation.
    Group(GroupArg),
    /// Row filter.
    Restrict(RestrictArg),
    /// Projection.
    Projection(ProjectionArg),
    /// Hash join (all kinds).
    Join(JoinArg),
    /// Nested-loop join (all kinds).
    LoopJoin(LoopJoinArg),
    /// Cross product.
    Product(LoopJoinArg),
    /// Set operation (minus/intersect/intersect-all).
    SetOp(SetOpArg),
    /// External CSV scan.
    External(ExternalArg),
    /// Table function.
    TableFunction(TableFunctionArg),
    /// Scan-head pass-through.
    TableScan(TableScanArg),
    /// Insert preprocessing.
    PreInsert(PreInsertArg),
    /// Insert.
    Insert(InsertArg),
    /// Deletion.
    Deletion(DeletionArg),
    /// Update.
    Update(UpdateArg),
    /// ON DUPLICATE KEY dedup.
    OnDuplicateKey(OnDuplicateKeyArg),
    /// Build-side head.
    HashBuild(HashBuildArg),
    /// Point-to-point forwarding.
    Connector(ConnectorArg),
    /// Fan-out multiplexer.
    Dispatch(DispatchArg),
    /// Result sink.
    Output(OutputArg),
}

impl OperatorArg {
    /// The precise opcode for this argument.
    pub fn op_code(&self) -> OpCode {
        match self {
            OperatorArg::Merge(_) => OpCode::Merge,
            OperatorArg::MergeGroup(_) => OpCode::MergeGroup,
            OperatorArg::MergeTop(_) => OpCode::MergeTop,
            OperatorArg::MergeOrder(_) => OpCode::MergeOrder,
            OperatorArg::MergeLimit(_) => OpCode::MergeLimit,
            OperatorArg::MergeOffset(_) => OpCode::MergeOffset,
            OperatorArg::MergeDelete(_) => OpCode::MergeDelete,
            OperatorArg::MergeBlock(_) => OpCode::MergeBlock,
            OperatorArg::Top(_) => OpCode::Top,
            OperatorArg::Order(_) => OpCode::Order,
            OperatorArg::Limit(_) => OpCode::Limit,
            OperatorArg::Offset(_) => OpCode::Offset,
            OperatorArg::Group(_) => OpCode::Group,
            OperatorArg::Restrict(_) => OpCode::Restrict,
            OperatorArg::Projection(_) => OpCode::Projection,
            OperatorArg::Join(arg) => match arg.kind {
                JoinKind::Inner => OpCode::Join,
                JoinKind::Left => OpCode::Left,
                JoinKind::Right => OpCode::Right,
                JoinKind::Single => OpCode::Single,
                JoinKind::Semi => OpCode::Semi,
                JoinKind::Anti => OpCode::Anti,
                JoinKind::RightSemi => OpCode::RightSemi,
                JoinKind::RightAnti => OpCode::RightAnti,
            },
            OperatorArg::LoopJoin(arg) => match arg.kind {
                LoopJoinKind::Inner => OpCode::LoopJoin,
                LoopJoinKind::Left => OpCode::LoopLeft,
                LoopJoinKind::Single => OpCode::LoopSingle,
                LoopJoinKind::Semi => OpCode::LoopSemi,
                LoopJoinKind::Anti => OpCode::LoopAnti,
                LoopJoinKind::Mark => OpCode::LoopMark,
            },
            OperatorArg::Product(_) => OpCode::Product,
            OperatorArg::SetOp(arg) => match arg.kind {
                SetOpKind::Minus => OpCode::Minus,
                SetOpKind::Intersect => OpCode::Intersect,
                SetOpKind::IntersectAll => OpCode::IntersectAll,
            },
            OperatorArg::External(_) => OpCode::External,
            OperatorArg::TableFunction(_) => OpCode::TableFunction,
            OperatorArg::TableScan(_) => OpCode::TableScan,
            OperatorArg::PreInsert(_) => OpCode::PreInsert,
            OperatorArg::Insert(_) => OpCode::Insert,
            OperatorArg::Deletion(_) => OpCode::Deletion,
            OperatorArg::Update(_) => OpCode::Update,
            OperatorArg::OnDuplicateKey(_) => OpCode::OnDuplicateKey,
            OperatorArg::HashBuild(_) => OpCode::HashBuild,
            OperatorArg::Connector(_) => OpCode::Connector,
            OperatorArg::Dispatch(_) => OpCode::Dispatch,
            OperatorArg::Output(_) => OpCode::Output,
        }
    }
}

/// One operator in a pipeline.
pub struct Instruction {
    /// Opcode, derived from the argument.
    pub op: OpCode,
    /// Plan-node id for analyze attribution.
    pub idx: usize,
    /// Whether this is the first operator compiled from its plan node.
    pub is_first: bool,
    /// Whether this is the last operator compiled from its plan node.
    pub is_last: bool,
    /// Typed operator argument.
    pub arg: OperatorArg,
}

impl Instruction {
    /// Instruction over `arg` for plan node `idx`.
    pub fn new(idx: usize, arg: OperatorArg) -> Self {
        Self {
            op: arg.op_code(),
            idx,
            is_first: false,
            is_last: false,
            arg,
        }
    }

    /// Mark as the first operator of its plan node.
    pub fn first(mut self, is_first: bool) -> Self {
        self.is_first = is_first;
        self
    }

    /// Whether this operator buffers its input rather than forwarding each
    /// batch as-is. A scope ending in a broken node is wrapped in a fresh
    /// merge scope before further operators are appended.
    pub fn is_broken_node(&self) -> bool {
        matches!(
            self.op,
            OpCode::Top
                | OpCode::MergeTop
                | OpCode::Order
                | OpCode::MergeOrder
                | OpCode::Group
                | OpCode::MergeGroup
                | OpCode::Join
                | OpCode::LoopJoin
                | OpCode::Left
                | OpCode::LoopLeft
                | OpCode::Right
                | OpCode::Single
                | OpCode::LoopSingle
                | OpCode::Semi
                | OpCode::LoopSemi
                | OpCode::RightSemi
                | OpCode::Anti
                | OpCode::LoopAnti
                | OpCode::RightAnti
                | OpCode::LoopMark
                | OpCode::Minus
                | OpCode::Intersect
                | OpCode::IntersectAll
                | OpCode::Product
                | OpCode::HashBuild
        )
    }

    /// Whether this operator produces ticks on its own (channel heads and
    /// source-style operators). A scope whose head does not feed the
    /// pipeline runs exactly one flush tick.
    pub fn feeds_pipeline(&self) -> bool {
        matches!(
            self.op,
            OpCode::Merge
                | OpCode::HashBuild
                | OpCode::External
                | OpCode::Join
                | OpCode::LoopJoin
                | OpCode::Left
                | OpCode::LoopLeft
                | OpCode::Right
                | OpCode::Single
                | OpCode::LoopSingle
                | OpCode::Semi
                | OpCode::LoopSemi
                | OpCode::RightSemi
                | OpCode::Anti
                | OpCode::LoopAnti
                | OpCode::RightAnti
                | OpCode::LoopMark
                | OpCode::Minus
                | OpCode::Intersect
                | OpCode::IntersectAll
                | OpCode::Product
        )
    }

    /// Run the operator's prepare hook.
    pub fn prepare(&mut self, proc: &mut Process) -> Result<()> {
        match &mut self.arg {
            OperatorArg::Merge(arg) => arg.prepare(proc),
            OperatorArg::HashBuild(arg) => arg.prepare(proc),
            OperatorArg::Join(arg) => arg.prepare(proc),
            OperatorArg::LoopJoin(arg) | OperatorArg::Product(arg) => arg.prepare(proc),
            OperatorArg::SetOp(arg) => arg.prepare(proc),
            _ => Ok(()),
        }
    }

    /// Run the operator once; `Ok(true)` means it will produce no more
    /// output.
    pub async fn call(&mut self, proc: &mut Process) -> Result<bool> {
        let (idx, is_first, is_last) = (self.idx, self.is_first, self.is_last);
        match &mut self.arg {
            OperatorArg::Merge(arg) => arg.call(proc, idx, is_first).await,
            OperatorArg::MergeGroup(arg) | OperatorArg::Group(arg) => {
                arg.call(proc, idx, is_first, is_last).await
            }
            OperatorArg::MergeTop(arg) | OperatorArg::Top(arg) => {
                arg.call(proc, idx, is_first, is_last).await
            }
            OperatorArg::MergeOrder(arg) | OperatorArg::Order(arg) => {
                arg.call(proc, idx, is_first, is_last).await
            }
            OperatorArg::MergeLimit(arg) | OperatorArg::Limit(arg) => {
                arg.call(proc, idx, is_first, is_last).await
            }
            OperatorArg::MergeOffset(arg) | OperatorArg::Offset(arg) => {
                arg.call(proc, idx, is_first, is_last).await
            }
            OperatorArg::MergeDelete(arg) => arg.call(proc, idx, is_first).await,
            OperatorArg::MergeBlock(arg) => arg.call(proc, idx, is_first).await,
            OperatorArg::Restrict(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::Projection(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::Join(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::LoopJoin(arg) | OperatorArg::Product(arg) => {
                arg.call(proc, idx, is_first, is_last).await
            }
            OperatorArg::SetOp(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::External(arg) => arg.call(proc, idx, is_last).await,
            OperatorArg::TableFunction(arg) => arg.call(proc, idx, is_last).await,
            OperatorArg::TableScan(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::PreInsert(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::Insert(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::Deletion(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::Update(arg) => arg.call(proc, idx, is_first).await,
            OperatorArg::OnDuplicateKey(arg) => arg.call(proc, idx, is_first, is_last).await,
            OperatorArg::HashBuild(arg) => arg.call(proc, idx, is_first).await,
            OperatorArg::Connector(arg) => arg.call(proc, idx, is_last).await,
            OperatorArg::Dispatch(arg) => arg.call(proc, idx, is_last).await,
            OperatorArg::Output(arg) => arg.call(proc, idx, is_last).await,
        }
    }

    /// Run the operator's free hook; called exactly once, success or failure.
    pub async fn free(&mut self, proc: &mut Process, failed: bool) {
        match &mut self.arg {
            OperatorArg::Merge(arg) => arg.free(failed),
            OperatorArg::MergeGroup(arg) | OperatorArg::Group(arg) => arg.free(failed),
            OperatorArg::MergeTop(arg) | OperatorArg::Top(arg) => arg.free(failed),
            OperatorArg::MergeOrder(arg) | OperatorArg::Order(arg) => arg.free(failed),
            OperatorArg::Join(arg) => arg.free(failed),
            OperatorArg::LoopJoin(arg) | OperatorArg::Product(arg) => arg.free(failed),
            OperatorArg::SetOp(arg) => arg.free(failed),
            OperatorArg::External(arg) => arg.free(failed),
            OperatorArg::Insert(arg) => arg.free(failed),
            OperatorArg::Deletion(arg) => arg.free(failed),
            OperatorArg::HashBuild(arg) => arg.free(failed),
            OperatorArg::Connector(arg) => arg.free(proc, failed).await,
            OperatorArg::Dispatch(arg) => arg.free(proc, failed).await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{JoinArg, JoinKind, SetOpArg, SetOpKind};

    #[test]
    fn join_kinds_map_to_their_opcodes() {
        let right = OperatorArg::Join(JoinArg::new(JoinKind::Right, vec![], vec![], vec![]));
        assert_eq!(right.op_code(), OpCode::Right);
        let minus = OperatorArg::SetOp(SetOpArg::new(SetOpKind::Minus, 0, 1));
        assert_eq!(minus.op_code(), OpCode::Minus);
    }

    #[test]
    fn broken_nodes_cover_blocking_operators() {
        let top = Instruction::new(0, OperatorArg::Top(crate::ops::TopArg::new(5, vec![])));
        assert!(top.is_broken_node());
        let restrict = Instruction::new(
            0,
            OperatorArg::Restrict(crate::ops::RestrictArg {
                filter: tidal_plan::Expr::Literal(tidal_plan::Value::Bool(true)),
            }),
        );
        assert!(!restrict.is_broken_node());
    }
}
