//! DML specialization: the terminal shape of delete/insert/update
//! statements, including the distributed variants.

use std::sync::Arc;

use tidal_common::{Result, TidalError};
use tidal_engine::{Database, Relation};
use tidal_pipeline::ops::{
    DeletionArg, DispatchArg, DispatchDest, DispatchFunc, InsertArg, MergeArg, MergeBlockArg,
    MergeDeleteArg, OnDuplicateKeyArg, OutputArg, PreInsertArg, ReceiveInfo, UpdateArg,
};
use tidal_pipeline::{
    Instruction, Magic, OperatorArg, RemoteReceivRegInfo, Scope,
};
use tidal_plan::{DeleteCtx, InsertCtx, Query, StmtType};
use uuid::Uuid;

use crate::compile::{is_same_cn, Compile};
use crate::scope_list;

/// Terminal compilation of one step's scope list by statement class.
pub(crate) async fn compile_ap_query(
    c: &mut Compile,
    qry: &Query,
    ss: Vec<Scope>,
) -> Result<Scope> {
    match qry.stmt_type {
        StmtType::Delete => compile_delete(c, qry, ss).await,
        StmtType::Insert => compile_insert(c, qry, ss).await,
        StmtType::Update => compile_update(c, qry, ss).await,
        StmtType::Query => {
            let mut rs = scope_list::new_merge_scope(c, ss);
            mark_last(&mut rs);
            let fill = c
                .fill
                .take()
                .ok_or_else(|| TidalError::Plan("output callback already consumed".to_string()))?;
            let mut output = Instruction::new(c.anal.curr, OperatorArg::Output(OutputArg::new(fill)));
            output.is_last = true;
            rs.append_instruction(output);
            Ok(rs)
        }
    }
}

fn mark_last(rs: &mut Scope) {
    if let Some(last) = rs.instructions.last_mut() {
        last.is_last = true;
    }
}

async fn database_of(c: &Compile, schema: &str) -> Result<Arc<dyn Database>> {
    c.engine.database(schema, &c.txn).await
}

async fn relation_of(c: &Compile, schema: &str, table: &str) -> Result<Arc<dyn Relation>> {
    database_of(c, schema).await?.relation(table).await
}

async fn resolve_delete(
    c: &Compile,
    ctx: &DeleteCtx,
) -> Result<(
    Arc<dyn Relation>,
    Vec<Arc<dyn Relation>>,
    Vec<Arc<dyn Relation>>,
)> {
    let rel = relation_of(c, &ctx.schema_name, &ctx.table_name).await?;
    let mut cascade_rels = Vec::with_capacity(ctx.on_cascade.len());
    for cascade in &ctx.on_cascade {
        cascade_rels.push(relation_of(c, &cascade.schema_name, &cascade.table_name).await?);
    }
    let mut index_rels = Vec::with_capacity(ctx.index_deletes.len());
    for index in &ctx.index_deletes {
        index_rels.push(relation_of(c, &ctx.schema_name, &index.table_name).await?);
    }
    Ok((rel, cascade_rels, index_rels))
}

async fn compile_delete(c: &mut Compile, qry: &Query, ss: Vec<Scope>) -> Result<Scope> {
    let delete_node = &qry.nodes[qry.steps[0] as usize];
    let ctx = delete_node
        .delete_ctx
        .clone()
        .ok_or_else(|| TidalError::Plan("delete statement without context".to_string()))?;
    let (rel, cascade_rels, index_rels) = resolve_delete(c, &ctx).await?;
    let child_cost = delete_node
        .children
        .first()
        .map(|child| qry.nodes[*child as usize].stats.cost)
        .unwrap_or(0.0);

    // Large single-table deletes hash rows to the CN owning their block so
    // each block is deleted by exactly one CN.
    let distributed = c.config.crosses_distributed_threshold(child_cost)
        && ctx.is_single_table()
        && !ctx.can_truncate;
    if distributed {
        let mut rs = new_delete_merge_scope(c, &ctx, Arc::clone(&rel), ss)?;
        rs.append_instruction(Instruction::new(
            c.anal.curr,
            OperatorArg::MergeDelete(MergeDeleteArg::new(rel, Arc::clone(&c.dml_affected))),
        ));
        rs.magic = Magic::MergeDelete;
        return Ok(rs);
    }

    let mut rs = scope_list::new_merge_scope(c, ss);
    mark_last(&mut rs);
    rs.magic = Magic::Deletion;
    let mut arg = DeletionArg::new(
        ctx.clone(),
        rel,
        cascade_rels,
        index_rels,
        Arc::clone(&c.dml_affected),
    );
    if ctx.can_truncate {
        arg = arg.with_truncate(database_of(c, &ctx.schema_name).await?);
    }
    rs.append_instruction(Instruction::new(c.anal.curr, OperatorArg::Deletion(arg)));
    Ok(rs)
}

// One remote-delete worker per producer; every producer block-hash
// dispatches into every worker, so a block's rows always converge on the
// worker owning its hash slot.
fn new_delete_merge_scope(
    c: &mut Compile,
    ctx: &DeleteCtx,
    rel: Arc<dyn Relation>,
    ss: Vec<Scope>,
) -> Result<Scope> {
    let mut producers: Vec<Scope> = ss.into_iter().filter(|s| !s.is_end).collect();
    let n = producers.len().max(1);
    let cap = c.config.channel_slack + n;

    let mut workers: Vec<Scope> = Vec::with_capacity(n);
    for i in 0..n {
        let mut worker = Scope::new(Magic::Remote, c.proc.new_child(n, cap));
        worker.node_info = producers
            .get(i)
            .map(|p| p.node_info.clone())
            .unwrap_or_default();
        worker.node_info.mcpu = 1;
        worker.append_instruction(Instruction::new(
            c.anal.curr,
            OperatorArg::Merge(MergeArg::default()),
        ));
        worker.append_instruction(Instruction::new(
            c.anal.curr,
            OperatorArg::Deletion(
                DeletionArg::new(
                    ctx.clone(),
                    Arc::clone(&rel),
                    Vec::new(),
                    Vec::new(),
                    Arc::clone(&c.dml_affected),
                )
                .with_remote(i as u64, n as u64),
            ),
        ));
        workers.push(worker);
    }

    for (j, producer) in producers.iter_mut().enumerate() {
        // Destination order must match worker order: bucket i is worker i.
        let mut dests = Vec::with_capacity(n);
        for worker in workers.iter_mut() {
            if is_same_cn(&worker.node_info.addr, &producer.node_info.addr) {
                dests.push(DispatchDest::Local(worker.proc.merge_receivers[j].sender()));
            } else {
                let uuid = Uuid::new_v4();
                worker.remote_regs.push(RemoteReceivRegInfo {
                    idx: j,
                    uuid,
                    from_addr: producer.node_info.addr.clone(),
                });
                dests.push(DispatchDest::Remote(ReceiveInfo {
                    uuid,
                    node_addr: worker.node_info.addr.clone(),
                }));
            }
        }
        producer.append_instruction(Instruction::new(
            c.anal.curr,
            OperatorArg::Dispatch(DispatchArg::with_destinations(
                DispatchFunc::ByBlockId {
                    row_id_col: ctx.row_id_col,
                },
                dests,
            )),
        ));
        producer.is_end = true;
    }
    for (worker, producer) in workers.iter_mut().zip(producers) {
        worker.pre_scopes.push(producer);
    }
    Ok(scope_list::new_merge_scope(c, workers))
}

async fn resolve_insert(
    c: &Compile,
    ctx: &InsertCtx,
) -> Result<(Arc<dyn Relation>, Vec<Arc<dyn Relation>>)> {
    let rel = relation_of(c, &ctx.schema_name, &ctx.table_def.name).await?;
    let mut unique_rels = Vec::with_capacity(ctx.unique_index_tables.len());
    for table in &ctx.unique_index_tables {
        unique_rels.push(relation_of(c, &ctx.schema_name, table).await?);
    }
    Ok((rel, unique_rels))
}

async fn compile_insert(c: &mut Compile, qry: &Query, ss: Vec<Scope>) -> Result<Scope> {
    let insert_node = &qry.nodes[qry.steps[0] as usize];
    let ctx = insert_node
        .insert_ctx
        .clone()
        .ok_or_else(|| TidalError::Plan("insert statement without context".to_string()))?;
    let (rel, unique_rels) = resolve_insert(c, &ctx).await?;
    let child_cost = insert_node
        .children
        .first()
        .map(|child| qry.nodes[*child as usize].stats.cost)
        .unwrap_or(0.0);

    let distributed =
        c.config.crosses_distributed_threshold(child_cost) || qry.load_tag;
    if distributed && ctx.on_duplicate_cols.is_empty() {
        let mut ss = ss;
        for s in &mut ss {
            if s.is_end {
                continue;
            }
            s.append_instruction(Instruction::new(
                c.anal.curr,
                OperatorArg::PreInsert(PreInsertArg::new(
                    ctx.clone(),
                    Arc::clone(&c.auto_increment),
                )),
            ));
            s.append_instruction(Instruction::new(
                c.anal.curr,
                OperatorArg::Insert(InsertArg::new(
                    Arc::clone(&rel),
                    unique_rels.len(),
                    true,
                    c.config.default_block_max_rows,
                    Arc::clone(&c.dml_affected),
                )),
            ));
        }
        let mut rs = scope_list::new_merge_scope(c, ss);
        rs.magic = Magic::MergeInsert;
        rs.append_instruction(Instruction::new(
            c.anal.curr,
            OperatorArg::MergeBlock(MergeBlockArg::new(
                rel,
                unique_rels,
                Arc::clone(&c.dml_affected),
            )),
        ));
        return Ok(rs);
    }

    let mut rs = scope_list::new_merge_scope(c, ss);
    mark_last(&mut rs);
    rs.magic = Magic::Insert;
    if !ctx.on_duplicate_cols.is_empty() {
        rs.append_instruction(Instruction::new(
            c.anal.curr,
            OperatorArg::OnDuplicateKey(OnDuplicateKeyArg::new(
                Arc::clone(&rel),
                ctx.on_duplicate_cols.clone(),
            )),
        ));
    }
    rs.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::PreInsert(PreInsertArg::new(
            ctx.clone(),
            Arc::clone(&c.auto_increment),
        )),
    ));
    rs.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::Insert(InsertArg::new(
            rel,
            unique_rels.len(),
            false,
            c.config.default_block_max_rows,
            Arc::clone(&c.dml_affected),
        )),
    ));
    Ok(rs)
}

async fn compile_update(c: &mut Compile, qry: &Query, ss: Vec<Scope>) -> Result<Scope> {
    let update_node = &qry.nodes[qry.steps[0] as usize];
    let ctx = update_node
        .update_ctx
        .clone()
        .ok_or_else(|| TidalError::Plan("update statement without context".to_string()))?;
    let rel = relation_of(c, &ctx.schema_name, &ctx.table_name).await?;
    let mut rs = scope_list::new_merge_scope(c, ss);
    mark_last(&mut rs);
    rs.magic = Magic::Update;
    rs.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::Update(UpdateArg::new(ctx, rel, Arc::clone(&c.dml_affected))),
    ));
    Ok(rs)
}
