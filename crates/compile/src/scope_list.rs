//! Scope-list builders: merge wrappers, per-CN worker lists, and the join
//! probe/build wiring.

use tidal_common::TidalError;
use tidal_engine::Node as EngineNode;
use tidal_pipeline::ops::{
    ConnectorArg, DispatchArg, DispatchFunc, HashBuildArg, MergeArg,
};
use tidal_pipeline::{Instruction, Magic, OperatorArg, RegSender, Scope};

use crate::compile::{generate_cpu_number, is_same_cn, Compile};

/// Producers that still feed a downstream consumer (not yet dispatched away).
pub(crate) fn valid_scope_count(ss: &[Scope]) -> usize {
    ss.iter().filter(|s| !s.is_end).count()
}

/// Slot-`i` senders of every live scope in `ss`.
pub(crate) fn extra_registers(ss: &[Scope], i: usize) -> Vec<RegSender> {
    ss.iter()
        .filter(|s| !s.is_end)
        .map(|s| s.proc.merge_receivers[i].sender())
        .collect()
}

/// Whether any instruction of `s` buffers rather than forwards.
pub(crate) fn contains_broken_node(s: &Scope) -> bool {
    s.instructions.iter().any(|i| i.is_broken_node())
}

/// Wrap `s` in a fresh merge scope when its pipeline is broken, so a new
/// operator can be appended behind the blocking stage.
pub(crate) fn wrap_broken_scope(c: &mut Compile, s: &mut Scope) {
    if !contains_broken_node(s) {
        return;
    }
    let placeholder = Scope::new(Magic::Merge, c.proc.new_child(0, 1));
    let inner = std::mem::replace(s, placeholder);
    *s = new_merge_scope(c, vec![inner]);
}

/// Merge `ss` into one local scope: a Merge head fed by one connector per
/// live producer, producers attached as pre-scopes.
pub(crate) fn new_merge_scope(c: &mut Compile, mut ss: Vec<Scope>) -> Scope {
    let cnt = valid_scope_count(&ss);
    let cap = c.config.channel_slack + 1;
    let mut rs = Scope::new(Magic::Merge, c.proc.new_child(cnt, cap));
    rs.node_info.addr = c.addr.clone();
    rs.node_info.mcpu = c.config.default_ncpu;
    if let Some(first) = ss.first() {
        rs.proc.load_tag = first.proc.load_tag;
    }
    rs.append_instruction(
        Instruction::new(c.anal.curr, OperatorArg::Merge(MergeArg::default()))
            .first(c.anal.is_first),
    );
    c.anal.is_first = false;

    let mut j = 0;
    for s in &mut ss {
        if s.is_end {
            continue;
        }
        let sender = rs.proc.merge_receivers[j].sender();
        s.append_instruction(Instruction::new(
            c.anal.curr,
            OperatorArg::Connector(ConnectorArg::new(sender)),
        ));
        j += 1;
    }
    rs.pre_scopes = ss;
    rs
}

/// Merge scope re-homed to a specific CN.
pub(crate) fn new_merge_remote_scope(c: &mut Compile, ss: Vec<Scope>, node: &EngineNode) -> Scope {
    let mut rs = new_merge_scope(c, ss);
    rs.magic = Magic::Remote;
    rs.node_info.addr = node.addr.clone();
    rs.node_info.mcpu = node.mcpu;
    rs
}

/// One worker scope per CPU across the CN list, each with `child_count`
/// merge receivers and a Merge head.
pub(crate) fn new_scope_list(c: &mut Compile, child_count: usize, blocks: usize) -> Vec<Scope> {
    let mut ss = Vec::new();
    let current_first = c.anal.is_first;
    let cn_list = c.cn_list.clone();
    for n in &cn_list {
        c.anal.is_first = current_first;
        let mcpu = generate_cpu_number(n.mcpu, blocks.max(1));
        ss.extend(new_scope_list_with_node(c, mcpu, child_count, &n.addr));
    }
    ss
}

/// `mcpu` single-worker scopes on one CN.
pub(crate) fn new_scope_list_with_node(
    c: &mut Compile,
    mcpu: usize,
    child_count: usize,
    addr: &str,
) -> Vec<Scope> {
    let current_first = c.anal.is_first;
    let cap = c.config.channel_slack + c.cn_list.len().max(1);
    let mut ss = Vec::with_capacity(mcpu);
    for _ in 0..mcpu.max(1) {
        let mut s = Scope::new(Magic::Remote, c.proc.new_child(child_count, cap));
        s.node_info.addr = addr.to_string();
        // The list is already mcpu wide; each member runs one worker.
        s.node_info.mcpu = 1;
        s.append_instruction(
            Instruction::new(c.anal.curr, OperatorArg::Merge(MergeArg::default()))
                .first(current_first),
        );
        ss.push(s);
    }
    c.anal.is_first = false;
    ss
}

/// The forced single-worker layout right joins run on.
pub(crate) fn new_scope_list_for_right_join(
    c: &mut Compile,
    child_count: usize,
    left_scopes: &[Scope],
) -> Vec<Scope> {
    let max_cpu = left_scopes
        .iter()
        .map(|s| s.node_info.mcpu)
        .max()
        .unwrap_or(1);
    let cap = c.config.channel_slack + left_scopes.len().max(1);
    let mut s = Scope::new(Magic::Remote, c.proc.new_child(child_count, cap));
    s.is_join = true;
    s.node_info.addr = c.addr.clone();
    s.node_info.mcpu = generate_cpu_number(c.config.default_ncpu, max_cpu);
    vec![s]
}

/// Bucketed layout: merge each side and broadcast it into every join scope
/// (slot 0 probe, slot 1 build); the merges land in the local scope's
/// pre-scopes.
pub(crate) fn new_join_scope_list_with_bucket(
    c: &mut Compile,
    mut rs: Vec<Scope>,
    ss: Vec<Scope>,
    children: Vec<Scope>,
) -> Vec<Scope> {
    let current_first = c.anal.is_first;
    let mut left_merge = new_merge_scope(c, ss);
    left_merge.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::Dispatch(DispatchArg::new(
            DispatchFunc::Broadcast,
            extra_registers(&rs, 0),
            Vec::new(),
        )),
    ));
    left_merge.is_end = true;

    c.anal.is_first = current_first;
    let mut right_merge = new_merge_scope(c, children);
    right_merge.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::Dispatch(DispatchArg::new(
            DispatchFunc::Broadcast,
            extra_registers(&rs, 1),
            Vec::new(),
        )),
    ));
    right_merge.is_end = true;

    let mut idx = 0;
    for (i, s) in rs.iter().enumerate() {
        if is_same_cn(&s.node_info.addr, &c.addr) {
            idx = i;
        }
    }
    rs[idx].pre_scopes.push(left_merge);
    rs[idx].pre_scopes.push(right_merge);
    rs
}

/// Broadcast layout: one join scope per probe scope, probe wired point to
/// point, build side concatenated by HashBuild and broadcast to every join
/// scope's slot 1.
pub(crate) fn new_broadcast_join_scope_list(
    c: &mut Compile,
    ss: Vec<Scope>,
    children: Vec<Scope>,
) -> Vec<Scope> {
    let cap = c.config.channel_slack + 1;
    let mut rs = Vec::with_capacity(ss.len());
    let mut idx = 0;
    for (i, mut s) in ss.into_iter().enumerate() {
        if s.is_end {
            rs.push(s);
            continue;
        }
        let mut join_scope = Scope::new(Magic::Remote, c.proc.new_child(2, cap));
        join_scope.is_join = true;
        join_scope.node_info = s.node_info.clone();
        if is_same_cn(&join_scope.node_info.addr, &c.addr) {
            idx = i;
        }
        let sender = join_scope.proc.merge_receivers[0].sender();
        s.append_instruction(Instruction::new(
            c.anal.curr,
            OperatorArg::Connector(ConnectorArg::new(sender)),
        ));
        join_scope.pre_scopes = vec![s];
        rs.push(join_scope);
    }

    // Join operators record probe/build flags themselves.
    c.anal.is_first = false;
    let mut merge_children = new_merge_scope(c, children);
    merge_children.instructions[0] = Instruction::new(
        c.anal.curr,
        OperatorArg::HashBuild(HashBuildArg::default()),
    )
    .first(true);
    merge_children.append_instruction(Instruction::new(
        c.anal.curr,
        OperatorArg::Dispatch(DispatchArg::new(
            DispatchFunc::Broadcast,
            extra_registers(&rs, 1),
            Vec::new(),
        )),
    ));
    merge_children.is_end = true;
    rs[idx].pre_scopes.push(merge_children);
    rs
}

/// Guard shared by callers that need at least one live producer.
pub(crate) fn ensure_live_scopes(ss: &[Scope]) -> Result<(), TidalError> {
    if valid_scope_count(ss) == 0 {
        return Err(TidalError::Plan(
            "pipeline has no live producer scopes".to_string(),
        ));
    }
    Ok(())
}
