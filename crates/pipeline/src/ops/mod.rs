//! Pipeline operators.
//!
//! Every operator follows the same contract: `prepare` runs once before the
//! scope starts, `call` reads its input from the process input slot and
//! writes output the same way (returning `true` when it will produce no more
//! output), and `free` runs exactly once on exit, success or failure.

/// Point-to-point forwarding.
pub mod connector;
/// Row-id deletes, local and distributed.
pub mod deletion;
/// Fan-out multiplexer.
pub mod dispatch;
/// External CSV scans.
pub mod external;
/// Hash aggregation.
pub mod group;
/// Insert, local and segment-staged.
pub mod insert;
/// Hash joins and build-side head.
pub mod join;
/// Limit and offset.
pub mod limit;
/// Nested-loop joins and product.
pub mod loop_join;
/// Fan-in consumer.
pub mod merge;
/// Distributed-insert terminal.
pub mod merge_block;
/// Distributed-delete terminal.
pub mod merge_delete;
/// ON DUPLICATE KEY dedup.
pub mod on_duplicate_key;
/// Full sorts.
pub mod order;
/// Result sink.
pub mod output;
/// Insert preprocessing.
pub mod pre_insert;
/// Projection.
pub mod projection;
/// Row filter.
pub mod restrict;
/// Set operations.
pub mod setops;
/// Table functions.
pub mod table_function;
/// Scan-head pass-through.
pub mod table_scan;
/// Bounded top-N.
pub mod top;
/// In-place updates.
pub mod update;

pub use connector::ConnectorArg;
pub use deletion::{block_meta_batch, DeletionArg};
pub use dispatch::{DispatchArg, DispatchDest, DispatchFunc, ReceiveInfo};
pub use external::ExternalArg;
pub use group::{merge_group_arg, GroupArg};
pub use insert::{meta_loc_schema, InsertArg, META_LOC, META_TBL_IDX};
pub use join::{HashBuildArg, JoinArg, JoinKind};
pub use limit::{LimitArg, OffsetArg};
pub use loop_join::{product_arg, LoopJoinArg, LoopJoinKind, ProductArg};
pub use merge::MergeArg;
pub use merge_block::MergeBlockArg;
pub use merge_delete::MergeDeleteArg;
pub use on_duplicate_key::OnDuplicateKeyArg;
pub use order::OrderArg;
pub use output::{OutputArg, OutputFn};
pub use pre_insert::PreInsertArg;
pub use projection::ProjectionArg;
pub use restrict::RestrictArg;
pub use setops::{SetOpArg, SetOpKind};
pub use table_function::TableFunctionArg;
pub use table_scan::TableScanArg;
pub use top::TopArg;
pub use update::UpdateArg;
