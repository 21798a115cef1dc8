//! Scopes: one pipeline of instructions bound to one CN, with the runners
//! that execute them.
//!
//! Pre-scopes run concurrently on their own tasks and feed the scope's merge
//! receivers; the scope itself drives its instruction chain in ticks. `None`
//! in the input slot is end-of-stream and flows through the chain exactly
//! once so every operator can flush.

use std::sync::Arc;

use tidal_common::{Result, TidalError};
use tidal_engine::{BlockRange, Database, Engine, Relation, TxnOperator};
use tidal_plan::{Ddl, DdlType, Expr};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::batch::Batch;
use crate::driver::run_pipeline;
use crate::operator::Instruction;
use crate::process::Process;

/// Execution-mode tag selecting a scope's runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Magic {
    Normal,
    Merge,
    Remote,
    MergeDelete,
    MergeInsert,
    Deletion,
    Insert,
    Update,
    CreateDatabase,
    DropDatabase,
    CreateTable,
    DropTable,
    AlterView,
    AlterTable,
    CreateIndex,
    DropIndex,
    CreateSequence,
    DropSequence,
    TruncateTable,
}

/// Placement of a scope: one CN address plus its worker budget.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    /// CN service address.
    pub addr: String,
    /// Worker parallelism for this scope.
    pub mcpu: usize,
    /// Block ranges assigned to this CN.
    pub data: Vec<BlockRange>,
}

/// Registration metadata for receivers fed by remote dispatchers.
#[derive(Debug, Clone)]
pub struct RemoteReceivRegInfo {
    /// Position in the scope's merge receivers.
    pub idx: usize,
    /// Registration key remote senders address.
    pub uuid: Uuid,
    /// CN the batches come from.
    pub from_addr: String,
}

/// Producer feeding a scope that reads data itself.
pub enum DataSource {
    /// Constant batch (VALUES / SELECT without FROM).
    Values {
        /// The batch; taken on first read.
        batch: Option<arrow::record_batch::RecordBatch>,
    },
    /// Engine table scan over placed ranges.
    Table {
        /// Database name.
        schema_name: String,
        /// Table name.
        table_name: String,
        /// Columns to read, in pipeline order.
        attrs: Vec<String>,
        /// Pushed-down filter.
        filter: Option<Expr>,
        /// Ranges assigned to this scope.
        ranges: Vec<BlockRange>,
    },
}

/// Shared handles a scope needs at run time.
#[derive(Clone)]
pub struct RunContext {
    /// Storage engine.
    pub engine: Arc<dyn Engine>,
    /// Session transaction.
    pub txn: Arc<dyn TxnOperator>,
}

/// A linear pipeline of instructions bound to one CN.
pub struct Scope {
    /// Execution-mode tag.
    pub magic: Magic,
    /// Optional producer for source scopes.
    pub data_source: Option<DataSource>,
    /// Placement.
    pub node_info: NodeInfo,
    /// Scopes launched concurrently before this one starts consuming.
    pub pre_scopes: Vec<Scope>,
    /// The instruction chain.
    pub instructions: Vec<Instruction>,
    /// Per-scope execution context.
    pub proc: Process,
    /// Receivers to register for remote dispatchers.
    pub remote_regs: Vec<RemoteReceivRegInfo>,
    /// Dispatched into another scope's pre-scopes; never run as a root.
    pub is_end: bool,
    /// Join scope marker.
    pub is_join: bool,
    /// Bulk-load scope marker.
    pub is_load: bool,
    /// DDL payload for DDL magics.
    pub ddl: Option<Ddl>,
}

impl Scope {
    /// A scope with the given magic and process.
    pub fn new(magic: Magic, proc: Process) -> Self {
        Self {
            magic,
            data_source: None,
            node_info: NodeInfo::default(),
            pre_scopes: Vec::new(),
            instructions: Vec::new(),
            proc,
            remote_regs: Vec::new(),
            is_end: false,
            is_join: false,
            is_load: false,
            ddl: None,
        }
    }

    /// Append one instruction.
    pub fn append_instruction(&mut self, ins: Instruction) {
        self.instructions.push(ins);
    }

    /// Execute this scope to completion, dispatching on its magic. Boxed so
    /// pre-scope recursion through task spawns stays finitely typed.
    pub fn execute(self, ctx: RunContext) -> futures::future::BoxFuture<'static, Result<()>> {
        use futures::FutureExt;
        async move {
            match self.magic {
                Magic::Normal
                | Magic::Merge
                | Magic::MergeDelete
                | Magic::MergeInsert
                | Magic::Deletion
                | Magic::Insert
                | Magic::Update => self.run_graph(ctx).await,
                Magic::Remote => self.remote_run(ctx).await,
                _ => self.run_ddl(ctx).await,
            }
        }
        .boxed()
    }

    /// Register remote receivers, run, and unregister on exit.
    async fn remote_run(mut self, ctx: RunContext) -> Result<()> {
        let registry = self.proc.registry.clone();
        let regs = std::mem::take(&mut self.remote_regs);
        if let Some(registry) = &registry {
            for info in &regs {
                let sender = self
                    .proc
                    .merge_receivers
                    .get(info.idx)
                    .ok_or_else(|| {
                        TidalError::Plan(format!("remote receiver index {} out of range", info.idx))
                    })?
                    .sender();
                registry.register_uuid(info.uuid, sender);
                debug!(uuid = %info.uuid, from = %info.from_addr, "registered remote receiver");
            }
        }
        let result = self.run_graph(ctx).await;
        if let Some(registry) = &registry {
            for info in &regs {
                registry.unregister_uuid(info.uuid);
            }
        }
        result
    }

    /// Launch pre-scopes, drive the instruction chain, join errors.
    async fn run_graph(mut self, ctx: RunContext) -> Result<()> {
        let mut children: Vec<JoinHandle<Result<()>>> = Vec::new();
        for child in std::mem::take(&mut self.pre_scopes) {
            let ctx = ctx.clone();
            children.push(tokio::spawn(child.execute(ctx)));
        }

        let source = match self.data_source.take() {
            Some(ds) => Some(build_source(ds, &ctx, &self).await?),
            None => None,
        };
        let result = run_pipeline(&mut self.proc, &mut self.instructions, source).await;

        // Unblock any producer still parked on this scope's registers before
        // waiting for the children to wind down.
        self.proc.drain_receivers();

        let mut first_err = result.err();
        for child in children {
            match child.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(TidalError::Execution(format!(
                            "scope task panicked: {join_err}"
                        )));
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run attached pre-scopes, then apply the DDL through the engine.
    async fn run_ddl(mut self, ctx: RunContext) -> Result<()> {
        let mut children: Vec<JoinHandle<Result<()>>> = Vec::new();
        for child in std::mem::take(&mut self.pre_scopes) {
            let cctx = ctx.clone();
            children.push(tokio::spawn(child.execute(cctx)));
        }
        for child in children {
            child
                .await
                .map_err(|e| TidalError::Execution(format!("attached scope panicked: {e}")))??;
        }

        let ddl = self
            .ddl
            .as_ref()
            .ok_or_else(|| TidalError::Plan("ddl scope without ddl payload".to_string()))?;
        let def = &ddl.def;
        match ddl.ddl_type {
            DdlType::CreateDatabase => ctx.engine.create_database(&def.database, &ctx.txn).await,
            DdlType::DropDatabase => ctx.engine.drop_database(&def.database, &ctx.txn).await,
            DdlType::CreateTable | DdlType::CreateSequence => {
                let table_def = def
                    .table_def
                    .as_ref()
                    .ok_or_else(|| TidalError::Plan("create without table def".to_string()))?;
                let db = self.database(&ctx).await?;
                db.create_relation(table_def).await
            }
            DdlType::DropTable | DdlType::DropSequence => {
                let name = target_name(ddl)?;
                let db = self.database(&ctx).await?;
                db.drop_relation(&name).await
            }
            DdlType::TruncateTable => {
                let name = target_name(ddl)?;
                let db = self.database(&ctx).await?;
                db.truncate_relation(&name).await.map(|_| ())
            }
            DdlType::AlterView | DdlType::AlterTable => {
                let table_def = def
                    .table_def
                    .as_ref()
                    .ok_or_else(|| TidalError::Plan("alter without table def".to_string()))?;
                let db = self.database(&ctx).await?;
                db.alter_relation(table_def).await
            }
            DdlType::CreateIndex => {
                let table_def = def
                    .table_def
                    .as_ref()
                    .ok_or_else(|| TidalError::Plan("create index without def".to_string()))?;
                let db = self.database(&ctx).await?;
                db.create_relation(table_def).await
            }
            DdlType::DropIndex => {
                let name = def
                    .object_name
                    .clone()
                    .ok_or_else(|| TidalError::Plan("drop index without name".to_string()))?;
                let db = self.database(&ctx).await?;
                db.drop_relation(&name).await
            }
        }
    }

    async fn database(&self, ctx: &RunContext) -> Result<Arc<dyn Database>> {
        let ddl = self.ddl.as_ref().expect("ddl scope");
        ctx.engine.database(&ddl.def.database, &ctx.txn).await
    }
}

fn target_name(ddl: &Ddl) -> Result<String> {
    ddl.def
        .table_name
        .clone()
        .or_else(|| ddl.def.table_def.as_ref().map(|d| d.name.clone()))
        .or_else(|| ddl.def.object_name.clone())
        .ok_or_else(|| TidalError::Plan("ddl statement without target name".to_string()))
}

/// A running producer feeding a scope's driver loop.
pub enum Source {
    /// Single constant batch.
    Once(Option<Batch>),
    /// Channel fed by parallel reader tasks.
    Readers {
        /// Result stream from the reader tasks.
        rx: mpsc::Receiver<Result<Batch>>,
    },
}

impl Source {
    /// Next tick's input; `None` is end-of-stream.
    pub async fn next(&mut self, proc: &Process) -> Result<Option<Batch>> {
        match self {
            Source::Once(slot) => Ok(slot.take()),
            Source::Readers { rx } => loop {
                let received = tokio::select! {
                    _ = proc.cancel.cancelled() => return Err(TidalError::Cancelled),
                    item = rx.recv() => item,
                };
                match received {
                    Some(Ok(batch)) => return Ok(Some(batch)),
                    Some(Err(err)) => return Err(err),
                    None => return Ok(None),
                }
            },
        }
    }
}

async fn resolve_relation(
    ctx: &RunContext,
    schema_name: &str,
    table_name: &str,
) -> Result<Arc<dyn Relation>> {
    let db = ctx.engine.database(schema_name, &ctx.txn).await?;
    db.relation(table_name).await
}

async fn build_source(ds: DataSource, ctx: &RunContext, scope: &Scope) -> Result<Source> {
    match ds {
        DataSource::Values { batch } => {
            let batch = match batch {
                Some(data) => Some(Batch::new(&scope.proc.pool, data)?),
                None => None,
            };
            Ok(Source::Once(batch))
        }
        DataSource::Table {
            schema_name,
            table_name,
            attrs,
            filter,
            ranges,
        } => {
            let rel = resolve_relation(ctx, &schema_name, &table_name).await?;
            let parallel = scope.node_info.mcpu.max(1);
            let readers = rel.new_readers(parallel, filter.clone(), ranges).await?;
            let (tx, rx) = mpsc::channel(readers.len() + 1);
            for mut reader in readers {
                let tx = tx.clone();
                let pool = Arc::clone(&scope.proc.pool);
                let cols = attrs.clone();
                let filter = filter.clone();
                let cancel = scope.proc.cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let read = tokio::select! {
                            _ = cancel.cancelled() => break,
                            r = reader.read(&cols, filter.as_ref(), &pool) => r,
                        };
                        match read {
                            Ok(Some(data)) => {
                                let batch = match Batch::new(&pool, data) {
                                    Ok(batch) => batch,
                                    Err(err) => {
                                        let _ = tx.send(Err(err)).await;
                                        break;
                                    }
                                };
                                if tx.send(Ok(batch)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                let _ = tx.send(Err(err)).await;
                                break;
                            }
                        }
                    }
                    reader.close();
                });
            }
            Ok(Source::Readers { rx })
        }
    }
}
