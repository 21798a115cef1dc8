//! End-to-end statement scenarios against the in-memory engine.

mod support;

use std::collections::HashSet;
use std::time::Duration;

use support::*;
use tidal_common::TidalError;
use tidal_engine::{Engine, FileService, Relation};
use tidal_pipeline::{OpCode, Scope};

fn collect_opcodes(scope: &Scope, out: &mut Vec<OpCode>) {
    for ins in &scope.instructions {
        out.push(ins.op);
    }
    for child in &scope.pre_scopes {
        collect_opcodes(child, out);
    }
}

fn all_opcodes(scopes: &[Scope]) -> Vec<OpCode> {
    let mut out = Vec::new();
    for s in scopes {
        collect_opcodes(s, &mut out);
    }
    out
}

fn join_scopes(scope: &Scope, out: &mut Vec<(bool, usize)>) {
    if scope.is_join {
        out.push((true, scope.node_info.mcpu));
    }
    for child in &scope.pre_scopes {
        join_scopes(child, out);
    }
}

// S1: a small INSERT stays local, lands both rows, and balances the pool.
#[tokio::test]
async fn local_insert_writes_rows() {
    let cluster = Cluster::single(2);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;

    let mut c = cluster.compile("insert into t values (1,2),(3,4)", test_config());
    c.compile(insert_plan(&def, vec![(1, 2), (3, 4)]), null_fill())
        .await
        .expect("compile");
    assert!(c
        .root_scopes()
        .iter()
        .any(|s| s.magic == tidal_pipeline::Magic::Insert));

    c.run().await.expect("run");
    assert_eq!(c.affected_rows(), 2);

    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    assert_eq!(table.visible_row_count(), 2);
    let rows = table.visible_rows().expect("rows");
    let a = int_column(&[rows.clone()], 0);
    let b = int_column(&[rows], 1);
    assert_eq!(a, vec![Some(1), Some(3)]);
    assert_eq!(b, vec![Some(2), Some(4)]);
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// S1b: inserting NULL into a NOT NULL column aborts with a constraint error.
#[tokio::test]
async fn not_null_violation_aborts_insert() {
    let cluster = Cluster::single(2);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;

    let mut plan = insert_plan(&def, vec![(1, 2)]);
    if let tidal_plan::Plan::Query(q) = &mut plan {
        q.nodes[1].rowset = Some(tidal_plan::RowsetData {
            cols: vec![
                vec![tidal_plan::Value::Null],
                vec![tidal_plan::Value::Int64(9)],
            ],
        });
    }
    let mut c = cluster.compile("insert into t values (null,9)", test_config());
    c.compile(plan, null_fill()).await.expect("compile");
    let err = c.run().await.expect_err("constraint");
    assert!(matches!(&err, TidalError::Constraint(_)), "{err}");
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// S2: cost above the threshold switches to segment staging plus MergeBlock,
// and the unique-index side table receives the same blocks.
#[tokio::test]
async fn distributed_insert_stages_segments() {
    let cluster = Cluster::single(2);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;
    let idx_def = two_int_table("t_uidx");
    create_db_and_table(&cluster, &idx_def).await;

    let rows: Vec<(i64, i64)> = (0..10).map(|i| (i, i * 10)).collect();
    let mut plan = insert_plan(&def, rows);
    if let tidal_plan::Plan::Query(q) = &mut plan {
        // Planner cost large enough that cost x 300B crosses 10MiB.
        q.nodes[1].stats.cost = 200_000.0;
        q.nodes[0]
            .insert_ctx
            .as_mut()
            .unwrap()
            .unique_index_tables
            .push("t_uidx".to_string());
    }

    let mut c = cluster.compile("insert into t select ...", test_config());
    c.compile(plan, null_fill()).await.expect("compile");
    let ops = all_opcodes(c.root_scopes());
    assert!(ops.contains(&OpCode::MergeBlock));
    assert!(ops.contains(&OpCode::PreInsert));
    assert!(c
        .root_scopes()
        .iter()
        .any(|s| s.magic == tidal_pipeline::Magic::MergeInsert));

    c.run().await.expect("run");
    assert_eq!(c.affected_rows(), 10);

    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    assert_eq!(table.visible_row_count(), 10);
    let uidx = cluster.engine.db("db").unwrap().table("t_uidx").unwrap();
    assert_eq!(uidx.visible_row_count(), 10);
    // Blocks were staged through the file service: 10 rows in blocks of 4
    // for two tables.
    let (writes, reads) = cluster.fs.io_counts();
    assert_eq!(writes, 6);
    assert_eq!(reads, 6);
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// S3: a large single-table delete goes through the block-hash dispatch and
// the MergeDelete terminal; every row disappears exactly once.
#[tokio::test]
async fn distributed_delete_collocates_blocks() {
    let cluster = Cluster::single(4);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;

    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    let a: Vec<i64> = (0..24).collect();
    let b: Vec<i64> = (0..24).map(|i| i * 2).collect();
    table.write(&int_batch(&def, a, b)).await.expect("write");
    assert_eq!(table.seal_blocks(8).expect("seal"), 3);

    let mut c = cluster.compile("delete from t", test_config());
    c.compile(delete_plan(&def, 200_000.0, 3), null_fill())
        .await
        .expect("compile");
    let ops = all_opcodes(c.root_scopes());
    assert!(ops.contains(&OpCode::MergeDelete));
    assert!(ops.contains(&OpCode::Dispatch));
    assert!(c
        .root_scopes()
        .iter()
        .any(|s| s.magic == tidal_pipeline::Magic::MergeDelete));

    c.run().await.expect("run");
    assert_eq!(c.affected_rows(), 24);
    assert_eq!(table.visible_row_count(), 0);
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// Small deletes stay local: one merge scope, one Deletion operator.
#[tokio::test]
async fn small_delete_stays_local() {
    let cluster = Cluster::single(2);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;
    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    table
        .write(&int_batch(&def, vec![1, 2, 3], vec![4, 5, 6]))
        .await
        .expect("write");
    table.seal_blocks(2).expect("seal");

    let mut c = cluster.compile("delete from t", test_config());
    c.compile(delete_plan(&def, 3.0, 2), null_fill())
        .await
        .expect("compile");
    let ops = all_opcodes(c.root_scopes());
    assert!(ops.contains(&OpCode::Deletion));
    assert!(!ops.contains(&OpCode::MergeDelete));

    c.run().await.expect("run");
    assert_eq!(c.affected_rows(), 3);
    assert_eq!(table.visible_row_count(), 0);
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// S4: right equi-joins force a single join worker; unmatched build rows
// come out NULL-padded on the probe side.
#[tokio::test]
async fn right_join_forced_single_worker() {
    let cluster = Cluster::single(4);
    let l_def = two_int_table("l");
    let r_def = two_int_table("r");
    create_db_and_table(&cluster, &l_def).await;
    create_db_and_table(&cluster, &r_def).await;

    let l = cluster.engine.db("db").unwrap().table("l").unwrap();
    l.write(&int_batch(&l_def, vec![1, 2], vec![10, 20]))
        .await
        .expect("write");
    l.seal_blocks(2).expect("seal");
    let r = cluster.engine.db("db").unwrap().table("r").unwrap();
    r.write(&int_batch(&r_def, vec![2, 3], vec![200, 300]))
        .await
        .expect("write");
    r.seal_blocks(2).expect("seal");

    let l_scan = scan_node(&l_def, 1000.0, 1);
    let r_scan = scan_node(&r_def, 1000.0, 1);
    let mut join = tidal_plan::Node::new(tidal_plan::NodeType::Join);
    join.children = vec![1, 2];
    join.join_type = Some(tidal_plan::JoinType::Right);
    // Probe columns first: l.a is column 0, r.a is column 2.
    join.on_list = vec![tidal_plan::Expr::col_eq(0, 2)];
    let plan = tidal_plan::Plan::Query(tidal_plan::Query {
        stmt_type: tidal_plan::StmtType::Query,
        nodes: vec![join, l_scan, r_scan],
        steps: vec![0],
        load_tag: false,
    });

    let (fill, sink) = collecting_fill();
    let mut c = cluster.compile("select * from l right join r on l.a=r.a", test_config());
    c.compile(plan, fill).await.expect("compile");

    let mut joins = Vec::new();
    for s in c.root_scopes() {
        join_scopes(s, &mut joins);
    }
    assert_eq!(joins.len(), 1, "exactly one join scope");
    assert_eq!(joins[0].1, 1, "join worker forced to mcpu=1");

    c.run().await.expect("run");
    let batches = sink.lock().clone();
    let l_keys = int_column(&batches, 0);
    let r_keys = int_column(&batches, 2);
    let total: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total, 2);
    // r.a=2 matched l.a=2; r.a=3 has no probe match and is NULL-padded.
    assert!(l_keys.contains(&Some(2)));
    assert!(l_keys.contains(&None));
    assert!(r_keys.contains(&Some(2)));
    assert!(r_keys.contains(&Some(3)));
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// S5: limit+offset with ordering rewrites to Top(150) / MergeTop / Offset
// and returns rows ranked 51..150.
#[tokio::test]
async fn top_offset_rewrite_orders_window() {
    let cluster = Cluster::single(4);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;
    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    // Insert 0..200 scattered so no block is pre-sorted.
    let mut a: Vec<i64> = (0..200).collect();
    a.reverse();
    let b: Vec<i64> = (0..200).collect();
    table.write(&int_batch(&def, a, b)).await.expect("write");
    assert_eq!(table.seal_blocks(20).expect("seal"), 10);

    let (fill, sink) = collecting_fill();
    let mut c = cluster.compile(
        "select * from t order by a limit 100 offset 50",
        test_config(),
    );
    c.compile(
        order_limit_plan(&def, 10, 0, Some(100), Some(50)),
        fill,
    )
    .await
    .expect("compile");

    let ops = all_opcodes(c.root_scopes());
    assert!(ops.contains(&OpCode::Top));
    assert!(ops.contains(&OpCode::MergeTop));
    assert!(ops.contains(&OpCode::MergeOffset));
    assert!(!ops.contains(&OpCode::Order), "no full sort: {ops:?}");
    assert!(!ops.contains(&OpCode::MergeOrder));

    c.run().await.expect("run");
    let batches = sink.lock().clone();
    let got: Vec<i64> = int_column(&batches, 0).into_iter().flatten().collect();
    let want: Vec<i64> = (50..150).collect();
    assert_eq!(got, want);
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// The general path keeps the full sort when the window is too large.
#[tokio::test]
async fn large_offset_window_uses_full_sort() {
    let cluster = Cluster::single(2);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;
    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    table
        .write(&int_batch(&def, (0..50).collect(), (0..50).collect()))
        .await
        .expect("write");
    table.seal_blocks(10).expect("seal");

    let mut config = test_config();
    config.top_offset_rewrite_max = 16;
    let (fill, sink) = collecting_fill();
    let mut c = cluster.compile("select * from t order by a limit 20 offset 10", config);
    c.compile(order_limit_plan(&def, 5, 0, Some(20), Some(10)), fill)
        .await
        .expect("compile");
    let ops = all_opcodes(c.root_scopes());
    assert!(ops.contains(&OpCode::MergeOrder));
    assert!(ops.contains(&OpCode::MergeLimit));
    assert!(!ops.contains(&OpCode::MergeTop));

    c.run().await.expect("run");
    let got: Vec<i64> = int_column(&sink.lock().clone(), 0)
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(got, (10..30).collect::<Vec<i64>>());
}

// S6: cancelling mid-scan surfaces promptly, leaves no queued batches, and
// balances the pool.
#[tokio::test]
async fn cancelled_query_unwinds() {
    let cluster = Cluster::single(2);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;
    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    table
        .write(&int_batch(&def, (0..64).collect(), (0..64).collect()))
        .await
        .expect("write");
    table.seal_blocks(4).expect("seal");
    table.set_read_delay_ms(200);

    let (fill, _sink) = collecting_fill();
    let mut c = cluster.compile("select * from t", test_config());
    c.compile(order_limit_plan(&def, 16, 0, None, None), fill)
        .await
        .expect("compile");

    let cancel = c.root_scopes()[0].proc.cancel.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let run = tokio::time::timeout(Duration::from_secs(5), c.run()).await;
    canceller.await.expect("canceller");
    let err = run.expect("bounded").expect_err("cancelled");
    assert!(matches!(&err, TidalError::Cancelled), "{err}");
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// Aggregation end to end: partial Group per scan worker, MergeGroup combine.
#[tokio::test]
async fn group_by_merges_partials() {
    let cluster = Cluster::single(4);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;
    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    let keys: Vec<i64> = (0..40).map(|i| i % 4).collect();
    let vals: Vec<i64> = (0..40).collect();
    table.write(&int_batch(&def, keys, vals)).await.expect("write");
    table.seal_blocks(10).expect("seal");

    let scan = scan_node(&def, 40.0, 4);
    let mut agg = tidal_plan::Node::new(tidal_plan::NodeType::Agg);
    agg.children = vec![1];
    agg.group_by = vec![tidal_plan::Expr::Column(0)];
    agg.aggs = vec![tidal_plan::AggExpr {
        func: tidal_plan::AggFunc::Sum,
        arg: tidal_plan::Expr::Column(1),
    }];
    let plan = tidal_plan::Plan::Query(tidal_plan::Query {
        stmt_type: tidal_plan::StmtType::Query,
        nodes: vec![agg, scan],
        steps: vec![0],
        load_tag: false,
    });

    let (fill, sink) = collecting_fill();
    let mut c = cluster.compile("select a, sum(b) from t group by a", test_config());
    c.compile(plan, fill).await.expect("compile");
    let ops = all_opcodes(c.root_scopes());
    assert!(ops.contains(&OpCode::Group));
    assert!(ops.contains(&OpCode::MergeGroup));

    c.run().await.expect("run");
    let batches = sink.lock().clone();
    let keys = int_column(&batches, 0);
    let sums = int_column(&batches, 1);
    let mut by_key: Vec<(i64, i64)> = keys
        .into_iter()
        .zip(sums)
        .map(|(k, s)| (k.unwrap(), s.unwrap()))
        .collect();
    by_key.sort_unstable();
    // sum over i in 0..40 with i%4==k of i.
    assert_eq!(by_key, vec![(0, 180), (1, 190), (2, 200), (3, 210)]);
    assert_eq!(cluster.pool.current_bytes(), 0);
}

// DDL runs through the engine and reports affected-rows = 1.
#[tokio::test]
async fn create_and_drop_table_round_trip() {
    let cluster = Cluster::single(1);
    cluster
        .engine
        .create_database("db", &cluster.txn)
        .await
        .expect("create db");

    let def = two_int_table("fresh");
    let ddl = tidal_plan::Plan::Ddl(tidal_plan::Ddl {
        ddl_type: tidal_plan::DdlType::CreateTable,
        def: tidal_plan::DdlDef {
            database: "db".to_string(),
            table_def: Some(def.clone()),
            table_name: None,
            object_name: None,
        },
        attached: None,
    });
    let mut c = cluster.compile("create table fresh(...)", test_config());
    c.compile(ddl, null_fill()).await.expect("compile");
    c.run().await.expect("run");
    assert_eq!(c.affected_rows(), 1);
    assert!(cluster.engine.db("db").unwrap().table("fresh").is_some());

    let drop = tidal_plan::Plan::Ddl(tidal_plan::Ddl {
        ddl_type: tidal_plan::DdlType::DropTable,
        def: tidal_plan::DdlDef {
            database: "db".to_string(),
            table_def: None,
            table_name: Some("fresh".to_string()),
            object_name: None,
        },
        attached: None,
    });
    let mut c = cluster.compile("drop table fresh", test_config());
    c.compile(drop, null_fill()).await.expect("compile");
    c.run().await.expect("run");
    assert_eq!(c.affected_rows(), 1);
    assert!(cluster.engine.db("db").unwrap().table("fresh").is_none());
}

// The analyze write-back lands per-node row counters in the plan.
#[tokio::test]
async fn analyze_counters_written_back() {
    let cluster = Cluster::single(2);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;
    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    table
        .write(&int_batch(&def, vec![1, 2, 3], vec![4, 5, 6]))
        .await
        .expect("write");
    table.seal_blocks(3).expect("seal");

    let (fill, _sink) = collecting_fill();
    let mut c = cluster.compile("select * from t", test_config());
    c.compile(order_limit_plan(&def, 1, 0, None, None), fill)
        .await
        .expect("compile");
    c.run().await.expect("run");

    let Some(tidal_plan::Plan::Query(q)) = c.plan() else {
        panic!("expected query plan");
    };
    let scan_analyze = q.nodes[1].analyze.expect("scan analyze");
    assert_eq!(scan_analyze.input_rows, 3);
}

// Bulk loads run in their own transaction that commits on success.
#[tokio::test]
async fn load_insert_commits_auto_transaction() {
    let cluster = Cluster::single(2);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;

    let mut plan = insert_plan(&def, vec![(1, 2), (3, 4), (5, 6)]);
    if let tidal_plan::Plan::Query(q) = &mut plan {
        q.load_tag = true;
    }
    let mut c = cluster.compile("load data into t", test_config());
    c.compile(plan, null_fill()).await.expect("compile");
    c.run().await.expect("run");
    assert_eq!(c.affected_rows(), 3);

    // The session txn is operators()[0]; the load txn is minted during run.
    let ops = cluster.txn_client.operators();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[1].commit_count(), 1);
    assert_eq!(ops[1].rollback_count(), 0);
    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    assert_eq!(table.visible_row_count(), 3);
}

// Insert keys must dedup through the single-authority ON DUPLICATE path.
#[tokio::test]
async fn on_duplicate_key_insert_dedups() {
    let cluster = Cluster::single(4);
    let def = two_int_table("t");
    create_db_and_table(&cluster, &def).await;
    let table = cluster.engine.db("db").unwrap().table("t").unwrap();
    table
        .write(&int_batch(&def, vec![1], vec![100]))
        .await
        .expect("write");

    let mut plan = insert_plan(&def, vec![(1, 111), (2, 222), (2, 223)]);
    if let tidal_plan::Plan::Query(q) = &mut plan {
        q.nodes[0].insert_ctx.as_mut().unwrap().on_duplicate_cols = vec![0];
    }
    let mut c = cluster.compile("insert ... on duplicate key", test_config());
    c.compile(plan, null_fill()).await.expect("compile");
    let ops = all_opcodes(c.root_scopes());
    assert!(ops.contains(&OpCode::OnDuplicateKey));

    c.run().await.expect("run");
    // Key 1 exists, key 2 appears twice in the stream: one new row lands.
    assert_eq!(c.affected_rows(), 1);
    assert_eq!(table.visible_row_count(), 2);
    let keys: HashSet<Option<i64>> = int_column(&[table.visible_rows().expect("rows")], 0)
        .into_iter()
        .collect();
    assert_eq!(keys, HashSet::from([Some(1), Some(2)]));
}
