//! The plan-to-scope translator and statement runner.
//!
//! One `Compile` instance exists per SQL execution: `compile` turns the plan
//! DAG into root scopes with placement and parallelism decided, `run` spawns
//! one task per root scope and joins errors, and `affected_rows` reports the
//! aggregated DML counter afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use futures::future::BoxFuture;
use futures::FutureExt;
use tidal_common::{CompileConfig, Result, TidalError};
use tidal_engine::{Engine, Node as EngineNode, TxnClient, TxnOperator, ROW_ID_COL};
use tidal_plan::{Ddl, DdlType, Expr, Node, NodeType, Plan, Query, StmtType, Value};
use tidal_pipeline::ops::{
    DispatchArg, DispatchFunc, ExternalArg, GroupArg, MergeArg, OutputFn, ProjectionArg,
    RestrictArg, TableFunctionArg, TableScanArg,
};
use tidal_pipeline::{
    DataSource, Instruction, Magic, OperatorArg, Process, RegSender, RunContext, Scope,
};
use tracing::{debug, info, warn};

use crate::dml;
use crate::join;
use crate::placement;
use crate::scope_list;
use crate::sort;

/// Analyze bookkeeping shared across the per-node compile helpers.
pub(crate) struct AnalyzeState {
    /// Plan node the operators being emitted belong to.
    pub curr: usize,
    /// Whether the next emitted operator is the node's first.
    pub is_first: bool,
}

/// Per-statement execution compiler.
pub struct Compile {
    pub(crate) addr: String,
    pub(crate) db: String,
    pub(crate) sql: String,
    pub(crate) tenant: String,
    pub(crate) uid: String,
    pub(crate) is_internal: bool,
    pub(crate) cn_label: HashMap<String, String>,
    pub(crate) config: CompileConfig,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) txn_client: Arc<dyn TxnClient>,
    pub(crate) txn: Arc<dyn TxnOperator>,
    pub(crate) proc: Process,
    pub(crate) cn_list: Vec<EngineNode>,
    pub(crate) anal: AnalyzeState,
    pub(crate) step_regs: HashMap<u32, Vec<RegSender>>,
    pub(crate) scopes: Vec<Scope>,
    pub(crate) plan: Option<Plan>,
    pub(crate) fill: Option<OutputFn>,
    pub(crate) affect_rows: u64,
    pub(crate) dml_affected: Arc<AtomicU64>,
    pub(crate) auto_increment: Arc<AtomicI64>,
    pub(crate) load_tag: bool,
}

impl Compile {
    /// New compiler for one statement.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: impl Into<String>,
        db: impl Into<String>,
        sql: impl Into<String>,
        tenant: impl Into<String>,
        uid: impl Into<String>,
        engine: Arc<dyn Engine>,
        txn_client: Arc<dyn TxnClient>,
        txn: Arc<dyn TxnOperator>,
        proc: Process,
        is_internal: bool,
        cn_label: HashMap<String, String>,
    ) -> Self {
        Self {
            addr: addr.into(),
            db: db.into(),
            sql: sql.into(),
            tenant: tenant.into(),
            uid: uid.into(),
            is_internal,
            cn_label,
            config: CompileConfig::default(),
            engine,
            txn_client,
            txn,
            proc,
            cn_list: Vec::new(),
            anal: AnalyzeState {
                curr: 0,
                is_first: true,
            },
            step_regs: HashMap::new(),
            scopes: Vec::new(),
            plan: None,
            fill: None,
            affect_rows: 0,
            dml_affected: Arc::new(AtomicU64::new(0)),
            auto_increment: Arc::new(AtomicI64::new(0)),
            load_tag: false,
        }
    }

    /// Override the planning knobs (tests lower the thresholds).
    pub fn with_config(mut self, config: CompileConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the scope list for `plan`. `fill` receives result batches of
    /// DQL statements. Panics inside compilation surface as errors.
    pub async fn compile(&mut self, plan: Plan, fill: OutputFn) -> Result<()> {
        self.fill = Some(fill);
        let fut = std::panic::AssertUnwindSafe(self.compile_inner(plan)).catch_unwind();
        match fut.await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(TidalError::Execution(format!("compile panicked: {msg}")))
            }
        }
    }

    async fn compile_inner(&mut self, plan: Plan) -> Result<()> {
        debug!(sql = %self.sql, db = %self.db, tenant = %self.tenant, uid = %self.uid, "compiling statement");
        let mut scopes = match &plan {
            Plan::Query(query) => {
                self.load_tag = query.load_tag;
                self.proc.load_tag = query.load_tag;
                self.compile_query(query).await?
            }
            Plan::Ddl(ddl) => self.compile_ddl(ddl).await?,
        };
        for scope in &mut scopes {
            fill_missing_addr(scope, &self.addr);
        }
        self.scopes = scopes;
        self.plan = Some(plan);
        Ok(())
    }

    async fn compile_ddl(&mut self, ddl: &Ddl) -> Result<Vec<Scope>> {
        let magic = match ddl.ddl_type {
            DdlType::CreateDatabase => Magic::CreateDatabase,
            DdlType::DropDatabase => Magic::DropDatabase,
            DdlType::CreateTable => Magic::CreateTable,
            DdlType::DropTable => Magic::DropTable,
            DdlType::AlterView => Magic::AlterView,
            DdlType::AlterTable => Magic::AlterTable,
            DdlType::TruncateTable => Magic::TruncateTable,
            DdlType::CreateIndex => Magic::CreateIndex,
            DdlType::DropIndex => Magic::DropIndex,
            DdlType::CreateSequence => Magic::CreateSequence,
            DdlType::DropSequence => Magic::DropSequence,
        };
        let mut scope = Scope::new(magic, self.proc.new_child(0, 1));
        scope.ddl = Some(ddl.clone());
        if let Some(attached) = &ddl.attached {
            scope.pre_scopes = self.compile_attached_scope(attached).await?;
        }
        Ok(vec![scope])
    }

    async fn compile_attached_scope(&mut self, attached: &Plan) -> Result<Vec<Scope>> {
        match attached {
            Plan::Query(query) => self.compile_query(query).await,
            Plan::Ddl(_) => Err(TidalError::Plan(
                "attached plan must be a query".to_string(),
            )),
        }
    }

    async fn compile_query(&mut self, qry: &Query) -> Result<Vec<Scope>> {
        self.cn_list = self
            .engine
            .nodes(self.is_internal, &self.tenant, &self.cn_label)?;
        self.cn_list.sort_by(|a, b| a.addr.cmp(&b.addr));

        let blk_num = qry.scanned_block_count();
        // Analytical statements get a best-effort reachability prune so a
        // dead CN does not sink the whole query.
        if qry.stmt_type == StmtType::Query && blk_num >= self.config.min_block_num {
            self.prune_unreachable_cns().await;
        }
        self.select_cn_list(qry, blk_num);

        self.proc.reset_analyze(qry.nodes.len());
        self.anal.curr = qry.steps.first().copied().unwrap_or(0) as usize;
        self.anal.is_first = true;

        let mut roots = Vec::with_capacity(qry.steps.len());
        for i in (0..qry.steps.len()).rev() {
            let root_idx = qry.steps[i];
            self.anal.curr = root_idx as usize;
            self.anal.is_first = true;
            let ss = self.compile_plan_scope(i as u32, root_idx, qry).await?;
            let root_node = &qry.nodes[root_idx as usize];
            if root_node.node_type == NodeType::Sink {
                // Sink steps are complete pipelines already; they feed their
                // registered step receivers rather than an output sink.
                roots.extend(ss);
            } else {
                roots.push(dml::compile_ap_query(self, qry, ss).await?);
            }
        }
        Ok(roots)
    }

    async fn prune_unreachable_cns(&mut self) {
        let Some(remote) = self.proc.remote.clone() else {
            return;
        };
        let mut reachable = Vec::with_capacity(self.cn_list.len());
        for node in std::mem::take(&mut self.cn_list) {
            if is_same_cn(&node.addr, &self.addr) {
                reachable.push(node);
                continue;
            }
            if node.addr.split(':').count() != 2 {
                warn!(addr = %node.addr, "malformed cn address, expected 'ip:port'");
            }
            match remote.ping(&node.addr).await {
                Ok(()) => reachable.push(node),
                Err(err) => {
                    info!(addr = %node.addr, %err, "dropping unreachable cn");
                }
            }
        }
        self.cn_list = reachable;
    }

    // CN-list policy per statement class.
    fn select_cn_list(&mut self, qry: &Query, blk_num: usize) {
        match qry.stmt_type {
            StmtType::Insert => {
                let insert_node = &qry.nodes[qry.steps[0] as usize];
                let child_cost = insert_node
                    .children
                    .first()
                    .map(|c| qry.nodes[*c as usize].stats.cost)
                    .unwrap_or(insert_node.stats.cost);
                let on_duplicate = insert_node
                    .insert_ctx
                    .as_ref()
                    .map(|c| !c.on_duplicate_cols.is_empty())
                    .unwrap_or(false);
                let distributed = self.config.crosses_distributed_threshold(child_cost)
                    || qry.load_tag
                    || blk_num >= self.config.min_block_num;
                if on_duplicate {
                    // A single authority must observe every key.
                    self.cn_list = vec![EngineNode {
                        id: 0,
                        addr: self.addr.clone(),
                        mcpu: generate_cpu_number(1, blk_num),
                        data: Vec::new(),
                    }];
                } else if distributed {
                    self.cn_list_strategy();
                } else {
                    self.cn_list = vec![EngineNode {
                        id: 0,
                        addr: self.addr.clone(),
                        mcpu: generate_cpu_number(self.config.default_ncpu, blk_num),
                        data: Vec::new(),
                    }];
                }
            }
            _ => {
                if blk_num < self.config.min_block_num {
                    self.cn_list = vec![EngineNode {
                        id: 0,
                        addr: self.addr.clone(),
                        mcpu: generate_cpu_number(self.config.default_ncpu, blk_num.max(1)),
                        data: Vec::new(),
                    }];
                } else {
                    self.cn_list_strategy();
                }
            }
        }
    }

    fn cn_list_strategy(&mut self) {
        if self.cn_list.is_empty() {
            self.cn_list.push(EngineNode {
                id: 0,
                addr: self.addr.clone(),
                mcpu: self.config.default_ncpu,
                data: Vec::new(),
            });
        }
    }

    /// Dispatch table over plan node kinds.
    pub(crate) fn compile_plan_scope<'a>(
        &'a mut self,
        step: u32,
        node_idx: u32,
        qry: &'a Query,
    ) -> BoxFuture<'a, Result<Vec<Scope>>> {
        async move {
            let n = &qry.nodes[node_idx as usize];
            match n.node_type {
                NodeType::ValueScan => {
                    let batch = match self.proc.prepare_batch.take() {
                        Some(batch) => batch,
                        None => construct_value_scan_batch(n)?,
                    };
                    let mut ds = Scope::new(Magic::Normal, self.proc.new_child(0, 1));
                    ds.node_info.addr = self.addr.clone();
                    ds.node_info.mcpu = 1;
                    ds.data_source = Some(DataSource::Values { batch: Some(batch) });
                    let ss = self.compile_projection(n, vec![ds]);
                    Ok(sort::compile_sort(self, n, ss)?)
                }
                NodeType::ExternalScan => {
                    let ss = self.compile_extern_scan(n).await?;
                    let ss = self.compile_restrict(n, ss);
                    let ss = self.compile_projection(n, ss);
                    Ok(sort::compile_sort(self, n, ss)?)
                }
                NodeType::TableScan => {
                    let ss = self.compile_table_scan(n, qry).await?;
                    let ss = self.compile_restrict(n, ss);
                    let ss = self.compile_projection(n, ss);
                    Ok(sort::compile_sort(self, n, ss)?)
                }
                NodeType::Filter | NodeType::Project => {
                    let curr = self.anal.curr;
                    self.set_analyze_current(&mut [], n.children[0] as usize);
                    let mut ss = self.compile_plan_scope(step, n.children[0], qry).await?;
                    self.set_analyze_current(&mut ss, curr);
                    let ss = self.compile_restrict(n, ss);
                    let ss = self.compile_projection(n, ss);
                    Ok(sort::compile_sort(self, n, ss)?)
                }
                NodeType::Agg => {
                    let curr = self.anal.curr;
                    self.set_analyze_current(&mut [], n.children[0] as usize);
                    let mut ss = self.compile_plan_scope(step, n.children[0], qry).await?;
                    self.set_analyze_current(&mut ss, curr);
                    if n.shuffle_group_idx.is_some() {
                        let ss = self.compile_bucket_group(n, ss);
                        Ok(sort::compile_sort(self, n, ss)?)
                    } else {
                        let ss = self.compile_merge_group(n, ss);
                        let ss = self.compile_restrict(n, ss);
                        let ss = self.compile_projection(n, ss);
                        Ok(sort::compile_sort(self, n, ss)?)
                    }
                }
                NodeType::Join => {
                    let curr = self.anal.curr;
                    self.set_analyze_current(&mut [], n.children[0] as usize);
                    let mut left = self.compile_plan_scope(step, n.children[0], qry).await?;
                    self.set_analyze_current(&mut left, n.children[1] as usize);
                    let mut right = self.compile_plan_scope(step, n.children[1], qry).await?;
                    self.set_analyze_current(&mut right, curr);
                    let left_node = &qry.nodes[n.children[0] as usize];
                    let right_node = &qry.nodes[n.children[1] as usize];
                    let ss = join::compile_join(self, n, left_node, right_node, left, right)?;
                    Ok(sort::compile_sort(self, n, ss)?)
                }
                NodeType::Sort => {
                    let curr = self.anal.curr;
                    self.set_analyze_current(&mut [], n.children[0] as usize);
                    let mut ss = self.compile_plan_scope(step, n.children[0], qry).await?;
                    self.set_analyze_current(&mut ss, curr);
                    let ss = sort::compile_sort(self, n, ss)?;
                    let ss = self.compile_restrict(n, ss);
                    Ok(self.compile_projection(n, ss))
                }
                NodeType::Union => {
                    let (left, right) = self.compile_two_children(step, n, qry).await?;
                    Ok(self.compile_union(n, left, right))
                }
                NodeType::UnionAll => {
                    let (mut left, right) = self.compile_two_children(step, n, qry).await?;
                    left.extend(right);
                    let mut rs = scope_list::new_merge_scope(self, left);
                    rs.instructions[0].idx = self.anal.curr;
                    Ok(sort::compile_sort(self, n, vec![rs])?)
                }
                NodeType::Minus | NodeType::Intersect | NodeType::IntersectAll => {
                    let (left, right) = self.compile_two_children(step, n, qry).await?;
                    let ss = join::compile_minus_and_intersect(self, n, left, right)?;
                    Ok(sort::compile_sort(self, n, ss)?)
                }
                NodeType::SinkScan => {
                    let mut rs = Scope::new(Magic::Merge, self.proc.new_child(1, 2));
                    rs.node_info.addr = self.addr.clone();
                    rs.node_info.mcpu = self.config.default_ncpu;
                    rs.append_instruction(
                        Instruction::new(self.anal.curr, OperatorArg::Merge(MergeArg::default()))
                            .first(true),
                    );
                    let source_step = n.source_step.ok_or_else(|| {
                        TidalError::Plan("sink-scan without source step".to_string())
                    })?;
                    let sender = rs.proc.merge_receivers[0].sender();
                    self.append_step_regs(source_step, sender);
                    Ok(vec![rs])
                }
                NodeType::Sink => {
                    let receivers = self.step_regs.get(&step).cloned().ok_or_else(|| {
                        TidalError::Plan("no data receiver for sink node".to_string())
                    })?;
                    let ss = self.compile_plan_scope(step, n.children[0], qry).await?;
                    let mut rs = scope_list::new_merge_scope(self, ss);
                    rs.append_instruction(Instruction::new(
                        self.anal.curr,
                        OperatorArg::Dispatch(DispatchArg::new(
                            DispatchFunc::Broadcast,
                            receivers,
                            Vec::new(),
                        )),
                    ));
                    Ok(vec![rs])
                }
                NodeType::Delete => {
                    let ctx = n.delete_ctx.as_ref().ok_or_else(|| {
                        TidalError::Plan("delete node without context".to_string())
                    })?;
                    if ctx.can_truncate {
                        return Ok(Vec::new());
                    }
                    self.compile_plan_scope(step, n.children[0], qry).await
                }
                NodeType::Insert | NodeType::Update => {
                    self.compile_plan_scope(step, n.children[0], qry).await
                }
                NodeType::FunctionScan => {
                    let curr = self.anal.curr;
                    self.set_analyze_current(&mut [], n.children[0] as usize);
                    let mut ss = self.compile_plan_scope(step, n.children[0], qry).await?;
                    self.set_analyze_current(&mut ss, curr);
                    let ss = self.compile_table_function(n, ss)?;
                    let ss = self.compile_restrict(n, ss);
                    let ss = self.compile_projection(n, ss);
                    Ok(sort::compile_sort(self, n, ss)?)
                }
            }
        }
        .boxed()
    }

    async fn compile_two_children(
        &mut self,
        step: u32,
        n: &Node,
        qry: &Query,
    ) -> Result<(Vec<Scope>, Vec<Scope>)> {
        let curr = self.anal.curr;
        self.set_analyze_current(&mut [], n.children[0] as usize);
        let mut left = self.compile_plan_scope(step, n.children[0], qry).await?;
        self.set_analyze_current(&mut left, n.children[1] as usize);
        let mut right = self.compile_plan_scope(step, n.children[1], qry).await?;
        self.set_analyze_current(&mut right, curr);
        Ok((left, right))
    }

    async fn compile_table_scan(&mut self, n: &Node, qry: &Query) -> Result<Vec<Scope>> {
        let nodes = placement::generate_nodes(self, n).await?;
        let mut ss = Vec::with_capacity(nodes.len());
        for node in nodes {
            ss.push(self.compile_table_scan_with_node(n, node, qry)?);
        }
        Ok(ss)
    }

    fn compile_table_scan_with_node(
        &mut self,
        n: &Node,
        node: EngineNode,
        qry: &Query,
    ) -> Result<Scope> {
        let table_def = n
            .table_def
            .as_ref()
            .ok_or_else(|| TidalError::Plan("table scan without table def".to_string()))?;
        let obj_ref = n
            .obj_ref
            .as_ref()
            .ok_or_else(|| TidalError::Plan("table scan without object ref".to_string()))?;
        let mut attrs = table_def.col_names();
        if qry.stmt_type != StmtType::Query {
            attrs.push(ROW_ID_COL.to_string());
        }
        let filter = combine_filters(&n.filter_list);

        let mut scope = Scope::new(Magic::Remote, self.proc.new_child(0, 1));
        scope.node_info.addr = node.addr;
        scope.node_info.mcpu = generate_cpu_number(node.mcpu, n.stats.block_num as usize);
        scope.data_source = Some(DataSource::Table {
            schema_name: obj_ref.schema_name.clone(),
            table_name: table_def.name.clone(),
            attrs,
            filter,
            ranges: node.data,
        });
        scope.append_instruction(
            Instruction::new(self.anal.curr, OperatorArg::TableScan(TableScanArg))
                .first(self.anal.is_first),
        );
        Ok(scope)
    }

    pub(crate) fn compile_restrict(&mut self, n: &Node, mut ss: Vec<Scope>) -> Vec<Scope> {
        let Some(filter) = combine_filters(&n.filter_list) else {
            return ss;
        };
        let current_first = self.anal.is_first;
        for s in &mut ss {
            s.append_instruction(
                Instruction::new(
                    self.anal.curr,
                    OperatorArg::Restrict(RestrictArg {
                        filter: filter.clone(),
                    }),
                )
                .first(current_first),
            );
        }
        self.anal.is_first = false;
        ss
    }

    pub(crate) fn compile_projection(&mut self, n: &Node, mut ss: Vec<Scope>) -> Vec<Scope> {
        if n.project_list.is_empty() {
            return ss;
        }
        let current_first = self.anal.is_first;
        for s in &mut ss {
            s.append_instruction(
                Instruction::new(
                    self.anal.curr,
                    OperatorArg::Projection(ProjectionArg {
                        exprs: n.project_list.clone(),
                    }),
                )
                .first(current_first),
            );
        }
        self.anal.is_first = false;
        ss
    }

    fn compile_table_function(&mut self, n: &Node, mut ss: Vec<Scope>) -> Result<Vec<Scope>> {
        let def = n
            .table_fn
            .as_ref()
            .ok_or_else(|| TidalError::Plan("function scan without definition".to_string()))?;
        let current_first = self.anal.is_first;
        for s in &mut ss {
            s.append_instruction(
                Instruction::new(
                    self.anal.curr,
                    OperatorArg::TableFunction(TableFunctionArg::new(def.clone())),
                )
                .first(current_first),
            );
        }
        self.anal.is_first = false;
        Ok(ss)
    }

    fn compile_merge_group(&mut self, n: &Node, mut ss: Vec<Scope>) -> Vec<Scope> {
        let current_first = self.anal.is_first;
        for s in &mut ss {
            self.anal.is_first = current_first;
            scope_list::wrap_broken_scope(self, s);
            s.append_instruction(
                Instruction::new(
                    self.anal.curr,
                    OperatorArg::Group(GroupArg::new(
                        n.group_by.clone(),
                        n.aggs.clone(),
                        None,
                    )),
                )
                .first(self.anal.is_first),
            );
        }
        self.anal.is_first = false;

        let mut rs = scope_list::new_merge_scope(self, ss);
        let funcs: Vec<_> = n.aggs.iter().map(|a| a.func).collect();
        rs.append_instruction(Instruction::new(
            self.anal.curr,
            OperatorArg::MergeGroup(tidal_pipeline::ops::merge_group_arg(
                n.group_by.len(),
                &funcs,
            )),
        ));
        vec![rs]
    }

    // Shuffled grouping: producers hash-dispatch on the chosen key, each
    // shuffle worker aggregates its partition with no further combining.
    // Every worker carries one receiver slot per producer so end-of-stream
    // signals stay per-edge.
    fn compile_bucket_group(&mut self, n: &Node, mut ss: Vec<Scope>) -> Vec<Scope> {
        let current_first = self.anal.is_first;
        self.anal.is_first = false;
        let blocks = n.stats.block_num as usize;
        let producer_count = scope_list::valid_scope_count(&ss).max(1);
        let mut children = scope_list::new_scope_list(self, producer_count, blocks);

        let hash_col = n
            .shuffle_group_idx
            .and_then(|i| n.group_by.get(i))
            .and_then(|e| e.as_column())
            .unwrap_or(0);
        let mut j = 0;
        for s in &mut ss {
            if scope_list::contains_broken_node(s) {
                let is_end = s.is_end;
                scope_list::wrap_broken_scope(self, s);
                s.is_end = is_end;
            }
            if !s.is_end {
                let regs = scope_list::extra_registers(&children, j);
                j += 1;
                s.append_instruction(Instruction::new(
                    self.anal.curr,
                    OperatorArg::Dispatch(DispatchArg::new(
                        DispatchFunc::ByBucket { hash_col },
                        regs,
                        Vec::new(),
                    )),
                ));
                s.is_end = true;
            }
        }

        for child in children.iter_mut() {
            child.append_instruction(
                Instruction::new(
                    self.anal.curr,
                    OperatorArg::Group(GroupArg::new(n.group_by.clone(), n.aggs.clone(), None)),
                )
                .first(current_first),
            );
        }
        let mut children = self.compile_projection(n, children);

        // Producers become pre-scopes of a co-located shuffle worker.
        for s in ss {
            let slot = children
                .iter()
                .position(|c| is_same_cn(&c.node_info.addr, &s.node_info.addr))
                .unwrap_or(0);
            children[slot].pre_scopes.push(s);
        }

        // One merging parent per CN keeps cross-CN traffic to a single edge.
        let mut parents = Vec::new();
        let mut remaining = children;
        while let Some(first) = remaining.first() {
            let addr = first.node_info.addr.clone();
            let node = self
                .cn_list
                .iter()
                .find(|cn| is_same_cn(&cn.addr, &addr))
                .cloned()
                .unwrap_or_else(|| EngineNode {
                    id: 0,
                    addr: addr.clone(),
                    mcpu: 1,
                    data: Vec::new(),
                });
            let (here, rest): (Vec<Scope>, Vec<Scope>) = remaining
                .into_iter()
                .partition(|c| is_same_cn(&c.node_info.addr, &addr));
            remaining = rest;
            parents.push(scope_list::new_merge_remote_scope(self, here, &node));
        }
        vec![scope_list::new_merge_scope(self, parents)]
    }

    fn compile_union(&mut self, n: &Node, ss: Vec<Scope>, children: Vec<Scope>) -> Vec<Scope> {
        let mut all = ss;
        all.extend(children);
        let blocks = n.stats.block_num as usize;
        let mut rs = scope_list::new_scope_list(self, 1, blocks);
        let width = if n.project_list.is_empty() {
            n.project_types.len()
        } else {
            n.project_list.len()
        };
        let keys: Vec<Expr> = (0..width).map(Expr::Column).collect();
        let nbucket = rs.len() as u64;
        let mut local_idx = 0;
        for (i, s) in rs.iter_mut().enumerate() {
            s.append_instruction(Instruction::new(
                self.anal.curr,
                OperatorArg::Group(GroupArg::new(
                    keys.clone(),
                    Vec::new(),
                    Some((i as u64, nbucket)),
                )),
            ));
            if is_same_cn(&s.node_info.addr, &self.addr) {
                local_idx = i;
            }
        }
        let mut merge_children = scope_list::new_merge_scope(self, all);
        let regs = scope_list::extra_registers(&rs, 0);
        merge_children.append_instruction(Instruction::new(
            self.anal.curr,
            OperatorArg::Dispatch(DispatchArg::new(DispatchFunc::Broadcast, regs, Vec::new())),
        ));
        merge_children.is_end = true;
        rs[local_idx].pre_scopes.push(merge_children);
        rs
    }

    async fn compile_extern_scan(&mut self, n: &Node) -> Result<Vec<Scope>> {
        let def = n
            .external
            .as_ref()
            .ok_or_else(|| TidalError::Plan("external scan without definition".to_string()))?;
        let table_def = n
            .table_def
            .as_ref()
            .ok_or_else(|| TidalError::Plan("external scan without table def".to_string()))?;
        if def.file_paths.is_empty() {
            let scope = Scope::new(Magic::Normal, self.proc.new_child(0, 1));
            return Ok(vec![scope]);
        }

        if def.parallel && (def.compressed() || def.scan_type == tidal_plan::ExternKind::Local) {
            return self.compile_extern_scan_parallel(n, def, table_def);
        }

        // Worker cap: S3 scans are bounded per CN to keep request fan-out in
        // check; local scans use the full budget.
        let per_cn_workers = |mcpu: usize| -> usize {
            if def.scan_type == tidal_plan::ExternKind::S3 && def.parallel {
                mcpu.min(self.config.s3_parallel_maxnum).max(1)
            } else {
                mcpu.max(1)
            }
        };

        let cn_count = if def.parallel { self.cn_list.len().max(1) } else { 1 };
        let mut ss = Vec::with_capacity(cn_count);
        for i in 0..cn_count {
            let (addr, mcpu) = match self.cn_list.get(i) {
                Some(node) => (node.addr.clone(), per_cn_workers(node.mcpu)),
                None => (self.addr.clone(), 1),
            };
            let files: Vec<String> = def
                .file_paths
                .iter()
                .enumerate()
                .filter(|(j, _)| j % cn_count == i)
                .map(|(_, f)| f.clone())
                .collect();
            let mut scope = Scope::new(
                if def.parallel { Magic::Remote } else { Magic::Normal },
                self.proc.new_child(0, 1),
            );
            scope.node_info.addr = addr;
            scope.node_info.mcpu = mcpu;
            scope.is_load = self.load_tag;
            scope.proc.load_tag = self.load_tag;
            scope.append_instruction(
                Instruction::new(
                    self.anal.curr,
                    OperatorArg::External(ExternalArg::new(
                        files,
                        table_def.clone(),
                        self.config.default_block_max_rows,
                    )),
                )
                .first(self.anal.is_first),
            );
            ss.push(scope);
        }
        self.anal.is_first = false;
        Ok(ss)
    }

    // Funnel: one scope reads the file stream once and deals rows out to
    // mcpu load workers.
    fn compile_extern_scan_parallel(
        &mut self,
        _n: &Node,
        def: &tidal_plan::ExternDef,
        table_def: &tidal_plan::TableDef,
    ) -> Result<Vec<Scope>> {
        let mcpu = self.cn_list.first().map(|n| n.mcpu).unwrap_or(1).max(1);
        let mut ss: Vec<Scope> = (0..mcpu)
            .map(|_| {
                let mut s = Scope::new(Magic::Merge, self.proc.new_child(1, 2));
                s.proc.load_tag = true;
                s.is_load = true;
                s.append_instruction(
                    Instruction::new(self.anal.curr, OperatorArg::Merge(MergeArg::default()))
                        .first(self.anal.is_first),
                );
                s
            })
            .collect();

        let mut funnel = Scope::new(Magic::Normal, self.proc.new_child(0, 1));
        funnel.proc.load_tag = true;
        funnel.is_load = true;
        funnel.append_instruction(
            Instruction::new(
                self.anal.curr,
                OperatorArg::External(ExternalArg::new(
                    def.file_paths.clone(),
                    table_def.clone(),
                    self.config.default_block_max_rows,
                )),
            )
            .first(self.anal.is_first),
        );
        let regs = scope_list::extra_registers(&ss, 0);
        funnel.append_instruction(Instruction::new(
            self.anal.curr,
            OperatorArg::Dispatch(DispatchArg::new(DispatchFunc::RoundRobin, regs, Vec::new())),
        ));
        funnel.is_end = true;
        ss[0].pre_scopes.push(funnel);
        self.anal.is_first = false;
        Ok(ss)
    }

    pub(crate) fn append_step_regs(&mut self, step: u32, reg: RegSender) {
        self.step_regs.entry(step).or_default().push(reg);
    }

    /// Mark the last instruction of `scopes` as their node's last operator
    /// and move the analyze cursor to `next`.
    pub(crate) fn set_analyze_current(&mut self, scopes: &mut [Scope], next: usize) {
        for s in scopes.iter_mut() {
            if let Some(last) = s.instructions.last_mut() {
                last.is_last = true;
            }
        }
        self.anal.curr = next;
        self.anal.is_first = true;
    }

    /// Execute the compiled scopes and aggregate results.
    pub async fn run(&mut self) -> Result<()> {
        let scopes = std::mem::take(&mut self.scopes);
        if scopes.is_empty() {
            return Ok(());
        }

        // Bulk loads run inside their own transaction: commit on success,
        // roll back on failure.
        let load_txn = if self.load_tag {
            Some(self.txn_client.new_txn()?)
        } else {
            None
        };
        let run_txn = load_txn.clone().unwrap_or_else(|| self.txn.clone());
        let ctx = RunContext {
            engine: Arc::clone(&self.engine),
            txn: run_txn,
        };

        let mut ddl_affected = 0u64;
        let mut handles = Vec::with_capacity(scopes.len());
        for scope in scopes {
            if scope.is_end {
                continue;
            }
            let magic = scope.magic;
            if matches!(
                magic,
                Magic::CreateDatabase
                    | Magic::DropDatabase
                    | Magic::CreateTable
                    | Magic::DropTable
                    | Magic::CreateIndex
                    | Magic::DropIndex
                    | Magic::CreateSequence
                    | Magic::DropSequence
            ) {
                ddl_affected = 1;
            }
            let ctx = ctx.clone();
            handles.push(tokio::spawn(scope.execute(ctx)));
        }

        let mut first_err: Option<TidalError> = None;
        for handle in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(TidalError::Execution(format!(
                    "scope task panicked: {join_err}"
                ))),
            };
            if let Err(err) = outcome {
                if first_err.is_none() {
                    // First error wins; cancel everything still running.
                    self.proc.cancel_all();
                    first_err = Some(err);
                }
            }
        }

        if let Some(txn) = load_txn {
            match &first_err {
                None => {
                    // Commit within the engine's budget; on overrun, attempt
                    // a rollback and surface the timeout.
                    let timeout = self.engine.hints().commit_or_rollback_timeout;
                    match tokio::time::timeout(timeout, txn.commit()).await {
                        Ok(result) => result?,
                        Err(_) => {
                            if let Err(rb) = txn.rollback().await {
                                warn!(error = %rb, "load transaction rollback failed");
                            }
                            return Err(TidalError::Rpc(format!(
                                "load commit exceeded {timeout:?}"
                            )));
                        }
                    }
                }
                Some(_) => {
                    if let Err(rb) = txn.rollback().await {
                        warn!(error = %rb, "load transaction rollback failed");
                    }
                }
            }
        }

        self.fill_analyze_info();
        if let Some(err) = first_err {
            return Err(err);
        }
        self.affect_rows = match self.plan.as_ref() {
            Some(Plan::Ddl(_)) => ddl_affected,
            _ => self.dml_affected.load(Ordering::Relaxed),
        };
        Ok(())
    }

    /// Rows logically modified by the statement.
    pub fn affected_rows(&self) -> u64 {
        self.affect_rows
    }

    /// The compiled root scopes, available between `compile` and `run`
    /// (EXPLAIN-style inspection).
    pub fn root_scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// The plan, with analyze summaries filled in after `run`.
    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    fn fill_analyze_info(&mut self) {
        let Some(Plan::Query(query)) = self.plan.as_mut() else {
            return;
        };
        let nodes = self.proc.analyze_nodes();
        for (i, node) in query.nodes.iter_mut().enumerate() {
            if let Some(info) = nodes.get(i) {
                node.analyze = Some(info.summary());
            }
        }
        // Attribute object-store requests to the root node.
        if let Some(root) = query.steps.first().copied() {
            if let Some(summary) = query.nodes[root as usize].analyze.as_mut() {
                let s3 = &self.proc.s3;
                summary.s3_input_count +=
                    s3.put.load(Ordering::Relaxed) + s3.list.load(Ordering::Relaxed);
                summary.s3_output_count += s3.head.load(Ordering::Relaxed)
                    + s3.get.load(Ordering::Relaxed)
                    + s3.delete.load(Ordering::Relaxed);
            }
        }
    }
}

/// Worker count for a scope: bounded by both the CN budget and the block
/// count, floored at one.
pub(crate) fn generate_cpu_number(cpunum: usize, blocks: usize) -> usize {
    if cpunum == 0 || blocks == 0 {
        return 1;
    }
    cpunum.min(blocks)
}

/// Two addresses belong to the same CN when their host parts match.
pub(crate) fn is_same_cn(addr: &str, current: &str) -> bool {
    let host = |a: &str| -> Option<String> {
        let mut parts = a.split(':');
        let host = parts.next()?.to_string();
        parts.next()?;
        Some(host)
    };
    match (host(addr), host(current)) {
        (Some(a), Some(b)) => a == b,
        // Defensive: malformed addresses compare equal rather than
        // scattering scopes across phantom nodes.
        _ => {
            warn!(%addr, %current, "malformed cn address, expected 'ip:port'");
            true
        }
    }
}

pub(crate) fn combine_filters(filters: &[Expr]) -> Option<Expr> {
    let mut iter = filters.iter().cloned();
    let first = iter.next()?;
    Some(iter.fold(first, |acc, next| Expr::Binary {
        op: tidal_plan::BinaryOp::And,
        left: Box::new(acc),
        right: Box::new(next),
    }))
}

fn fill_missing_addr(scope: &mut Scope, addr: &str) {
    if scope.node_info.addr.is_empty() {
        scope.node_info.addr = addr.to_string();
    }
    for child in &mut scope.pre_scopes {
        fill_missing_addr(child, addr);
    }
}

fn construct_value_scan_batch(n: &Node) -> Result<RecordBatch> {
    let Some(rowset) = &n.rowset else {
        // Constant statements with no rowset still produce one placeholder
        // row to tick the pipeline.
        let schema = Arc::new(Schema::new(vec![Field::new(
            "const",
            DataType::Int64,
            true,
        )]));
        return RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![None::<i64>]))])
            .map_err(|e| TidalError::Execution(format!("value batch failed: {e}")));
    };
    if rowset.cols.is_empty() || rowset.cols[0].is_empty() {
        return Err(TidalError::Plan("rowset data has no rows".to_string()));
    }
    let table_def = n
        .table_def
        .as_ref()
        .ok_or_else(|| TidalError::Plan("value scan without table def".to_string()))?;
    let mut fields = Vec::with_capacity(rowset.cols.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(rowset.cols.len());
    for (i, col) in rowset.cols.iter().enumerate() {
        let def = table_def
            .cols
            .get(i)
            .ok_or_else(|| TidalError::Plan(format!("rowset column {i} has no definition")))?;
        arrays.push(values_to_array(col, &def.data_type)?);
        // Nullability is enforced by PreInsert, not the literal batch.
        fields.push(Field::new(&def.name, def.data_type.clone(), true));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| TidalError::Execution(format!("value batch failed: {e}")))
}

fn values_to_array(values: &[Value], data_type: &DataType) -> Result<ArrayRef> {
    Ok(match data_type {
        DataType::Int64 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Int64(x) => Some(*x),
                    Value::Null => None,
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        DataType::Float64 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Float64(x) => Some(*x),
                    Value::Int64(x) => Some(*x as f64),
                    _ => None,
                })
                .collect::<Float64Array>(),
        ),
        DataType::Utf8 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Utf8(s) => Some(s.clone()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
        DataType::Boolean => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        other => {
            return Err(TidalError::Plan(format!(
                "unsupported value scan type {other:?}"
            )))
        }
    })
}
