//! The query plan DAG handed to the execution compiler.
//!
//! A query is a flat node array plus `steps`: one root node per step,
//! compiled last-to-first so SINK producers exist before their SINK_SCAN
//! consumers. DDL statements carry a definition block and optionally an
//! attached query plan (index maintenance) compiled as pre-scopes.

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

use crate::analyze::AnalyzeSummary;
use crate::expr::{AggExpr, Expr, OrderSpec, Value};

/// Statement class of a query plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StmtType {
    /// Plain DQL; results flow to the output callback.
    Query,
    /// INSERT statement.
    Insert,
    /// DELETE statement.
    Delete,
    /// UPDATE statement.
    Update,
}

/// Closed set of plan node kinds the compiler translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Constant rowset (VALUES / SELECT without FROM).
    ValueScan,
    /// Engine table scan.
    TableScan,
    /// External file scan.
    ExternalScan,
    /// Table-function scan over a child.
    FunctionScan,
    /// Row filter.
    Filter,
    /// Projection.
    Project,
    /// Aggregation.
    Agg,
    /// Join of two children.
    Join,
    /// Sort / limit / offset.
    Sort,
    /// UNION with dedup.
    Union,
    /// UNION ALL.
    UnionAll,
    /// Set difference.
    Minus,
    /// Set intersection (distinct).
    Intersect,
    /// Set intersection (all).
    IntersectAll,
    /// Step sink: dispatches to registered step receivers.
    Sink,
    /// Step source: drains a sink of an earlier step.
    SinkScan,
    /// DELETE root.
    Delete,
    /// INSERT root.
    Insert,
    /// UPDATE root.
    Update,
}

/// Join variants carried by a JOIN node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    /// Inner join.
    Inner,
    /// Left outer join.
    Left,
    /// Right outer join (equi only).
    Right,
    /// Single join (scalar subquery; at most one build match per probe row).
    Single,
    /// Semi join.
    Semi,
    /// Anti join.
    Anti,
    /// Mark join.
    Mark,
}

/// Planner statistics attached to every node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Estimated input row count feeding this node.
    pub cost: f64,
    /// Estimated output row count.
    pub outcnt: f64,
    /// Number of storage blocks under this node's scans.
    pub block_num: u32,
}

/// One column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColDef {
    /// Column name.
    pub name: String,
    /// Arrow data type.
    pub data_type: DataType,
    /// NOT NULL constraint.
    pub not_null: bool,
    /// Primary-key membership.
    pub primary: bool,
    /// Auto-increment column.
    pub auto_increment: bool,
}

impl ColDef {
    /// Plain nullable column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            not_null: false,
            primary: false,
            auto_increment: false,
        }
    }
}

/// Table definition as resolved by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Ordered column definitions.
    pub cols: Vec<ColDef>,
}

impl TableDef {
    /// Column data types in declaration order.
    pub fn col_types(&self) -> Vec<DataType> {
        self.cols.iter().map(|c| c.data_type.clone()).collect()
    }

    /// Column names in declaration order.
    pub fn col_names(&self) -> Vec<String> {
        self.cols.iter().map(|c| c.name.clone()).collect()
    }
}

/// Schema-qualified object reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjRef {
    /// Database (schema) name.
    pub schema_name: String,
    /// Publishing tenant, when scanning a shared table.
    #[serde(default)]
    pub pub_account_id: Option<u32>,
}

/// Literal rowset backing a VALUE_SCAN node, stored column-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetData {
    /// One literal vector per output column.
    pub cols: Vec<Vec<Value>>,
}

/// External scan source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternKind {
    /// Node-local filesystem.
    Local,
    /// Object storage.
    S3,
}

/// External scan definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternDef {
    /// Source kind.
    pub scan_type: ExternKind,
    /// Comma-free file path list.
    pub file_paths: Vec<String>,
    /// Whether the scan may be split across workers.
    pub parallel: bool,
}

impl ExternDef {
    /// Compression is inferred from the first file's extension.
    pub fn compressed(&self) -> bool {
        self.file_paths
            .first()
            .map(|p| p.ends_with(".gz") || p.ends_with(".zst") || p.ends_with(".bz2"))
            .unwrap_or(false)
    }
}

/// Table-function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFnDef {
    /// Function name (`generate_series`, `unnest`, ...).
    pub name: String,
    /// Constant arguments.
    pub args: Vec<Value>,
}

/// Foreign-key enforcement mode for delete pipelines.
///
/// The restrict/cascade checks can run inline inside the Deletion operator or
/// be left to the session layer; both behaviors exist and the flag selects
/// one per statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FkMode {
    /// Enforce restrict columns and cascade deletes inside the operator.
    Inline,
    /// Skip inline checks; an outer layer owns FK semantics.
    Deferred,
}

impl Default for FkMode {
    fn default() -> Self {
        Self::Inline
    }
}

/// Cascade target for inline FK handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeCtx {
    /// Child schema name.
    pub schema_name: String,
    /// Child table name.
    pub table_name: String,
    /// Position of the child row-id column in the delete batch.
    pub row_id_col: usize,
}

/// Secondary-index maintenance target for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDeleteCtx {
    /// Index table name.
    pub table_name: String,
    /// Position of the index row-id column in the delete batch.
    pub row_id_col: usize,
}

/// DELETE execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteCtx {
    /// Target schema.
    pub schema_name: String,
    /// Target table.
    pub table_name: String,
    /// Position of the target row-id column in the delete batch.
    pub row_id_col: usize,
    /// Whole-table delete rewritten to truncate.
    #[serde(default)]
    pub can_truncate: bool,
    /// FK enforcement mode.
    #[serde(default)]
    pub fk_mode: FkMode,
    /// Columns that must be all-NULL or the delete fails (ON DELETE RESTRICT).
    #[serde(default)]
    pub on_restrict_cols: Vec<usize>,
    /// Child tables deleted alongside (ON DELETE CASCADE).
    #[serde(default)]
    pub on_cascade: Vec<CascadeCtx>,
    /// Secondary-index rows deleted alongside.
    #[serde(default)]
    pub index_deletes: Vec<IndexDeleteCtx>,
}

impl DeleteCtx {
    /// Whether this delete touches exactly one table with no FK or index
    /// side-effects — the precondition for the distributed delete path.
    pub fn is_single_table(&self) -> bool {
        self.on_restrict_cols.is_empty()
            && self.on_cascade.is_empty()
            && self.index_deletes.is_empty()
    }
}

/// Cluster-table fan-out: the batch is written once per target tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTableCtx {
    /// Position of the account-id column in the insert batch.
    pub account_col: usize,
    /// Tenants the rows are duplicated for.
    pub account_ids: Vec<u32>,
}

/// INSERT execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertCtx {
    /// Target schema.
    pub schema_name: String,
    /// Target table definition.
    pub table_def: TableDef,
    /// Unique-index side tables receiving meta-locs on the distributed path.
    #[serde(default)]
    pub unique_index_tables: Vec<String>,
    /// Key columns of an ON DUPLICATE KEY handler; non-empty pins the plan to
    /// a single local worker.
    #[serde(default)]
    pub on_duplicate_cols: Vec<usize>,
    /// Auto-increment column positions whose values are preserved on
    /// cluster-table duplication.
    #[serde(default)]
    pub auto_increment_cols: Vec<usize>,
    /// Composite primary-key columns filled by PreInsert.
    #[serde(default)]
    pub composite_pk_cols: Vec<usize>,
    /// Cluster-table duplication context.
    #[serde(default)]
    pub cluster_table: Option<ClusterTableCtx>,
}

/// UPDATE execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCtx {
    /// Target schema.
    pub schema_name: String,
    /// Target table.
    pub table_name: String,
    /// Position of the row-id column in the update batch.
    pub row_id_col: usize,
    /// (target column, value column in batch) pairs.
    pub assignments: Vec<(usize, usize)>,
}

/// One plan node. Unused fields stay at their defaults; the compiler reads
/// only what the node kind prescribes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node kind.
    pub node_type: NodeType,
    /// Child node indexes into `Query::nodes`.
    #[serde(default)]
    pub children: Vec<u32>,
    /// Output projection.
    #[serde(default)]
    pub project_list: Vec<Expr>,
    /// Output column types, parallel to `project_list`.
    #[serde(default)]
    pub project_types: Vec<DataType>,
    /// Conjunctive filters.
    #[serde(default)]
    pub filter_list: Vec<Expr>,
    /// Grouping keys (AGG / UNION dedup).
    #[serde(default)]
    pub group_by: Vec<Expr>,
    /// Aggregate calls.
    #[serde(default)]
    pub aggs: Vec<AggExpr>,
    /// Index into `group_by` of the key chosen for shuffled grouping;
    /// `None` selects the partial+merge strategy.
    #[serde(default)]
    pub shuffle_group_idx: Option<usize>,
    /// Sort keys.
    #[serde(default)]
    pub order_by: Vec<OrderSpec>,
    /// LIMIT expression (const-foldable).
    #[serde(default)]
    pub limit: Option<Expr>,
    /// OFFSET expression (const-foldable).
    #[serde(default)]
    pub offset: Option<Expr>,
    /// Join kind for JOIN nodes.
    #[serde(default)]
    pub join_type: Option<JoinType>,
    /// Join conditions.
    #[serde(default)]
    pub on_list: Vec<Expr>,
    /// Build the hash table on the left input (right-variant operators).
    #[serde(default)]
    pub build_on_left: bool,
    /// Scanned/target table definition.
    #[serde(default)]
    pub table_def: Option<TableDef>,
    /// Scanned/target object reference.
    #[serde(default)]
    pub obj_ref: Option<ObjRef>,
    /// Literal rowset for VALUE_SCAN.
    #[serde(default)]
    pub rowset: Option<RowsetData>,
    /// External scan definition.
    #[serde(default)]
    pub external: Option<ExternDef>,
    /// Table-function definition.
    #[serde(default)]
    pub table_fn: Option<TableFnDef>,
    /// Block-level filter expressions pushed to `Relation::ranges`.
    #[serde(default)]
    pub block_filters: Vec<Expr>,
    /// Insert context for INSERT roots.
    #[serde(default)]
    pub insert_ctx: Option<InsertCtx>,
    /// Delete context for DELETE roots.
    #[serde(default)]
    pub delete_ctx: Option<DeleteCtx>,
    /// Update context for UPDATE roots.
    #[serde(default)]
    pub update_ctx: Option<UpdateCtx>,
    /// Producing step for SINK_SCAN nodes.
    #[serde(default)]
    pub source_step: Option<u32>,
    /// Planner statistics.
    #[serde(default)]
    pub stats: Stats,
    /// Analyze counters written back after execution.
    #[serde(default)]
    pub analyze: Option<AnalyzeSummary>,
}

impl Node {
    /// A bare node of the given kind; callers fill the relevant fields.
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            children: Vec::new(),
            project_list: Vec::new(),
            project_types: Vec::new(),
            filter_list: Vec::new(),
            group_by: Vec::new(),
            aggs: Vec::new(),
            shuffle_group_idx: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            join_type: None,
            on_list: Vec::new(),
            build_on_left: false,
            table_def: None,
            obj_ref: None,
            rowset: None,
            external: None,
            table_fn: None,
            block_filters: Vec::new(),
            insert_ctx: None,
            delete_ctx: None,
            update_ctx: None,
            source_step: None,
            stats: Stats::default(),
            analyze: None,
        }
    }
}

/// A compiled query: flat node array plus one root per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Statement class.
    pub stmt_type: StmtType,
    /// All nodes of the DAG.
    pub nodes: Vec<Node>,
    /// Root node index per step, in execution order.
    pub steps: Vec<u32>,
    /// Bulk-load pipeline marker; enables auto-transaction and single-file
    /// readers.
    #[serde(default)]
    pub load_tag: bool,
}

impl Query {
    /// Total scanned-block count across TABLE_SCAN nodes.
    pub fn scanned_block_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::TableScan)
            .map(|n| n.stats.block_num as usize)
            .sum()
    }
}

/// DDL statement kinds (each maps to one scope magic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlType {
    /// CREATE DATABASE.
    CreateDatabase,
    /// DROP DATABASE.
    DropDatabase,
    /// CREATE TABLE.
    CreateTable,
    /// DROP TABLE.
    DropTable,
    /// ALTER VIEW.
    AlterView,
    /// ALTER TABLE.
    AlterTable,
    /// TRUNCATE TABLE.
    TruncateTable,
    /// CREATE INDEX.
    CreateIndex,
    /// DROP INDEX.
    DropIndex,
    /// CREATE SEQUENCE.
    CreateSequence,
    /// DROP SEQUENCE.
    DropSequence,
}

/// DDL definition payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlDef {
    /// Target database.
    pub database: String,
    /// Target table definition, for table-level statements.
    #[serde(default)]
    pub table_def: Option<TableDef>,
    /// Target table name, when no full definition applies.
    #[serde(default)]
    pub table_name: Option<String>,
    /// Index or sequence name.
    #[serde(default)]
    pub object_name: Option<String>,
}

/// A DDL plan, optionally carrying an attached query plan (index backfill or
/// constraint maintenance) executed as pre-scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ddl {
    /// DDL statement kind.
    pub ddl_type: DdlType,
    /// Definition payload.
    pub def: DdlDef,
    /// Attached query plan.
    #[serde(default)]
    pub attached: Option<Box<Plan>>,
}

/// Top-level plan handed to `Compile::compile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Plan {
    /// DQL/DML query.
    Query(Query),
    /// DDL statement.
    Ddl(Ddl),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_serde_round_trip() {
        let mut scan = Node::new(NodeType::TableScan);
        scan.table_def = Some(TableDef {
            name: "t".to_string(),
            cols: vec![
                ColDef::new("a", DataType::Int64),
                ColDef::new("b", DataType::Utf8),
            ],
        });
        scan.stats.block_num = 3;
        let query = Query {
            stmt_type: StmtType::Query,
            nodes: vec![scan],
            steps: vec![0],
            load_tag: false,
        };
        let json = serde_json::to_string(&Plan::Query(query)).expect("encode");
        let back: Plan = serde_json::from_str(&json).expect("decode");
        match back {
            Plan::Query(q) => {
                assert_eq!(q.scanned_block_count(), 3);
                assert_eq!(q.nodes[0].table_def.as_ref().expect("def").cols.len(), 2);
            }
            Plan::Ddl(_) => panic!("expected query plan"),
        }
    }

    #[test]
    fn single_table_delete_detection() {
        let mut ctx = DeleteCtx {
            schema_name: "db".to_string(),
            table_name: "t".to_string(),
            row_id_col: 0,
            can_truncate: false,
            fk_mode: FkMode::default(),
            on_restrict_cols: vec![],
            on_cascade: vec![],
            index_deletes: vec![],
        };
        assert!(ctx.is_single_table());
        ctx.on_restrict_cols.push(1);
        assert!(!ctx.is_single_table());
    }
}
