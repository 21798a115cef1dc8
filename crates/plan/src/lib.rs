#![deny(missing_docs)]

//! Logical query plan DAG consumed by the tidal execution compiler.
//!
//! Architecture role:
//! - defines the plan node array / step structure the SQL planner emits
//! - defines the scalar expression set operators evaluate
//! - defines the analyze-summary shape written back after execution
//!
//! The parser and planner that produce these types live outside this
//! repository; tests construct plans directly.

/// Analyze counter snapshots.
pub mod analyze;
/// Scalar expressions.
pub mod expr;
/// Plan nodes, queries, and DDL payloads.
pub mod plan;

pub use analyze::AnalyzeSummary;
pub use expr::{is_equi_join, AggExpr, AggFunc, BinaryOp, Expr, NullsOrder, OrderSpec, Value};
pub use plan::{
    CascadeCtx, ClusterTableCtx, ColDef, Ddl, DdlDef, DdlType, DeleteCtx, ExternDef, ExternKind,
    FkMode, IndexDeleteCtx, InsertCtx, JoinType, Node, NodeType, ObjRef, Plan, Query, RowsetData,
    Stats, StmtType, TableDef, TableFnDef, UpdateCtx,
};
