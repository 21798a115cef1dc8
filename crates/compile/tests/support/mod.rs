//! Shared fixtures for the end-to-end scenarios: an in-memory cluster, plan
//! builders, and a collecting output sink.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use parking_lot::Mutex;
use tidal_cluster::{LocalIdAllocator, PipelineClient, Server};
use tidal_common::{CompileConfig, MemoryPool};
use tidal_compile::Compile;
use tidal_engine::mem::{MemEngine, MemFileService, MemNode, MemTxnClient};
use tidal_engine::{Database, Engine, Node, Timestamp, TxnClient, TxnOperator};
use tidal_pipeline::ops::OutputFn;
use tidal_pipeline::Process;
use tidal_plan::{
    ColDef, DeleteCtx, Expr, InsertCtx, Node as PlanNode, NodeType, ObjRef, Plan, Query,
    RowsetData, Stats, StmtType, TableDef, Value,
};

pub const LOCAL_ADDR: &str = "127.0.0.1:6001";

/// One assembled single-process test cluster.
pub struct Cluster {
    pub engine: Arc<MemEngine>,
    pub txn_client: Arc<MemTxnClient>,
    pub txn: Arc<dyn TxnOperator>,
    pub server: Arc<Server>,
    pub client: Arc<PipelineClient>,
    pub fs: Arc<MemFileService>,
    pub pool: Arc<MemoryPool>,
}

impl Cluster {
    pub fn single(mcpu: usize) -> Self {
        Self::with_nodes(vec![node(LOCAL_ADDR, mcpu)])
    }

    pub fn with_nodes(nodes: Vec<MemNode>) -> Self {
        Self::with_nodes_and_server(nodes, Server::new(LocalIdAllocator::new()))
    }

    pub fn with_nodes_and_server(nodes: Vec<MemNode>, server: Arc<Server>) -> Self {
        let engine = MemEngine::new(nodes);
        let txn_client = MemTxnClient::new();
        let txn = txn_client.new_txn().expect("txn");
        Self {
            engine,
            txn_client,
            txn,
            server,
            client: PipelineClient::new(),
            fs: MemFileService::new(),
            pool: MemoryPool::unbounded(),
        }
    }

    /// Session process wired to this cluster's services.
    pub fn process(&self) -> Process {
        let mut proc = Process::new(Arc::clone(&self.pool), Timestamp::default(), 1);
        proc.txn_operator = Some(Arc::clone(&self.txn));
        proc.txn_client = Some(self.txn_client.clone() as Arc<dyn TxnClient>);
        proc.file_service = Some(self.fs.clone() as _);
        proc.registry = Some(self.server.clone() as _);
        proc.segments = Some(self.server.clone() as _);
        proc.remote = Some(self.client.clone() as _);
        proc
    }

    /// Fresh compiler over this cluster with tuned planning knobs.
    pub fn compile(&self, sql: &str, config: CompileConfig) -> Compile {
        self.compile_at(LOCAL_ADDR, sql, config)
    }

    /// Compiler homed on a specific CN address.
    pub fn compile_at(&self, addr: &str, sql: &str, config: CompileConfig) -> Compile {
        Compile::new(
            addr,
            "db",
            sql,
            "sys",
            "dump",
            self.engine.clone() as Arc<dyn Engine>,
            self.txn_client.clone() as Arc<dyn TxnClient>,
            Arc::clone(&self.txn),
            self.process(),
            false,
            HashMap::new(),
        )
        .with_config(config)
    }
}

pub fn node(addr: &str, mcpu: usize) -> MemNode {
    MemNode {
        node: Node {
            id: 0,
            addr: addr.to_string(),
            mcpu,
            data: Vec::new(),
        },
        labels: HashMap::new(),
    }
}

/// Planning knobs sized for tests: low block threshold, tiny blocks.
pub fn test_config() -> CompileConfig {
    CompileConfig {
        min_block_num: 1_000_000,
        default_ncpu: 4,
        default_block_max_rows: 4,
        ..CompileConfig::default()
    }
}

pub fn two_int_table(name: &str) -> TableDef {
    TableDef {
        name: name.to_string(),
        cols: vec![
            ColDef {
                name: "a".to_string(),
                data_type: DataType::Int64,
                not_null: true,
                primary: true,
                auto_increment: false,
            },
            ColDef::new("b", DataType::Int64),
        ],
    }
}

pub async fn create_db_and_table(cluster: &Cluster, def: &TableDef) {
    if cluster.engine.db("db").is_none() {
        cluster
            .engine
            .create_database("db", &cluster.txn)
            .await
            .expect("create db");
    }
    cluster
        .engine
        .db("db")
        .expect("db")
        .create_relation(def)
        .await
        .expect("create table");
}

pub fn int_batch(def: &TableDef, a: Vec<i64>, b: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(
        def.cols
            .iter()
            .map(|c| Field::new(&c.name, c.data_type.clone(), !c.not_null))
            .collect::<Vec<_>>(),
    ));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(a)),
            Arc::new(Int64Array::from(b)),
        ],
    )
    .expect("batch")
}

/// Output sink collecting every delivered batch.
pub fn collecting_fill() -> (OutputFn, Arc<Mutex<Vec<RecordBatch>>>) {
    let sink: Arc<Mutex<Vec<RecordBatch>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&sink);
    let fill: OutputFn = Box::new(move |batch: &RecordBatch| {
        captured.lock().push(batch.clone());
        Ok(())
    });
    (fill, sink)
}

/// Discarding output sink.
pub fn null_fill() -> OutputFn {
    Box::new(|_| Ok(()))
}

pub fn scan_node(def: &TableDef, cost: f64, block_num: u32) -> PlanNode {
    let mut n = PlanNode::new(NodeType::TableScan);
    n.table_def = Some(def.clone());
    n.obj_ref = Some(ObjRef {
        schema_name: "db".to_string(),
        pub_account_id: None,
    });
    n.stats = Stats {
        cost,
        outcnt: cost,
        block_num,
    };
    n
}

pub fn values_node(def: &TableDef, rows: Vec<(i64, i64)>) -> PlanNode {
    let mut n = PlanNode::new(NodeType::ValueScan);
    n.table_def = Some(def.clone());
    n.rowset = Some(RowsetData {
        cols: vec![
            rows.iter().map(|(a, _)| Value::Int64(*a)).collect(),
            rows.iter().map(|(_, b)| Value::Int64(*b)).collect(),
        ],
    });
    n.stats.cost = rows.len() as f64;
    n
}

/// INSERT plan over a literal rowset.
pub fn insert_plan(def: &TableDef, rows: Vec<(i64, i64)>) -> Plan {
    let values = values_node(def, rows);
    let mut insert = PlanNode::new(NodeType::Insert);
    insert.children = vec![1];
    insert.insert_ctx = Some(InsertCtx {
        schema_name: "db".to_string(),
        table_def: def.clone(),
        unique_index_tables: vec![],
        on_duplicate_cols: vec![],
        auto_increment_cols: vec![],
        composite_pk_cols: vec![],
        cluster_table: None,
    });
    Plan::Query(Query {
        stmt_type: StmtType::Insert,
        nodes: vec![insert, values],
        steps: vec![0],
        load_tag: false,
    })
}

/// DELETE plan scanning the whole table.
pub fn delete_plan(def: &TableDef, cost: f64, block_num: u32) -> Plan {
    let scan = scan_node(def, cost, block_num);
    let mut delete = PlanNode::new(NodeType::Delete);
    delete.children = vec![1];
    delete.delete_ctx = Some(DeleteCtx {
        schema_name: "db".to_string(),
        table_name: def.name.clone(),
        // Scans of DML statements append the row-id column after the table
        // columns.
        row_id_col: def.cols.len(),
        can_truncate: false,
        fk_mode: Default::default(),
        on_restrict_cols: vec![],
        on_cascade: vec![],
        index_deletes: vec![],
    });
    Plan::Query(Query {
        stmt_type: StmtType::Delete,
        nodes: vec![delete, scan],
        steps: vec![0],
        load_tag: false,
    })
}

/// DQL plan: scan + sort/limit/offset on column `col`.
pub fn order_limit_plan(
    def: &TableDef,
    block_num: u32,
    col: usize,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Plan {
    let scan = scan_node(def, 100.0, block_num);
    let mut sort = PlanNode::new(NodeType::Sort);
    sort.children = vec![1];
    sort.order_by = vec![tidal_plan::OrderSpec {
        expr: Expr::Column(col),
        desc: false,
        nulls: tidal_plan::NullsOrder::Default,
    }];
    sort.limit = limit.map(|v| Expr::Literal(Value::Int64(v)));
    sort.offset = offset.map(|v| Expr::Literal(Value::Int64(v)));
    Plan::Query(Query {
        stmt_type: StmtType::Query,
        nodes: vec![sort, scan],
        steps: vec![0],
        load_tag: false,
    })
}

/// All values of an Int64 column across collected batches.
pub fn int_column(batches: &[RecordBatch], col: usize) -> Vec<Option<i64>> {
    let mut out = Vec::new();
    for batch in batches {
        let array = batch
            .column(col)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 column");
        out.extend(array.iter());
    }
    out
}
