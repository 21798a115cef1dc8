//! Block placement: assigning scan ranges to compute nodes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tidal_common::{Result, TidalError};
use tidal_engine::range::object_time_prefix;
use tidal_engine::{BlockRange, EngineKind, Node as EngineNode};
use tidal_plan::Node;
use tracing::{debug, warn};

use crate::compile::{generate_cpu_number, is_same_cn, Compile};

/// Database holding session temporary tables.
pub const TEMP_DB: &str = "%!%tmp";

/// Name a temporary table is registered under.
pub fn temp_table_name(schema: &str, table: &str) -> String {
    format!("{schema}.{table}")
}

/// Deterministically hash a byte prefix into `[0, upper)`.
pub(crate) fn simple_hash_to_range(bytes: &[u8], upper: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    (hasher.finish() % upper.max(1) as u64) as usize
}

// All CNs sharing one address means a single-machine launch deployment.
fn is_launch_mode(cn_list: &[EngineNode]) -> bool {
    cn_list
        .iter()
        .all(|n| is_same_cn(&cn_list[0].addr, &n.addr))
}

/// Resolve the scanned relation, fetch its ranges, and place them on CNs.
pub(crate) async fn generate_nodes(c: &mut Compile, n: &Node) -> Result<Vec<EngineNode>> {
    let table_def = n
        .table_def
        .as_ref()
        .ok_or_else(|| TidalError::Plan("table scan without table def".to_string()))?;
    let obj_ref = n
        .obj_ref
        .as_ref()
        .ok_or_else(|| TidalError::Plan("table scan without object ref".to_string()))?;

    let db = c.engine.database(&obj_ref.schema_name, &c.txn).await?;
    let rel = match db.relation(&table_def.name).await {
        Ok(rel) => rel,
        Err(_) => {
            // Missing relations may be session temporaries; those always
            // scan on the local CN.
            let tmp_db = c.engine.database(TEMP_DB, &c.txn).await?;
            let rel = tmp_db
                .relation(&temp_table_name(&obj_ref.schema_name, &table_def.name))
                .await?;
            c.cn_list = vec![EngineNode {
                id: 0,
                addr: c.addr.clone(),
                mcpu: 1,
                data: Vec::new(),
            }];
            rel
        }
    };

    let ranges = rel.ranges(&n.block_filters).await?;
    debug!(
        table = rel.table_id(),
        ranges = ranges.len(),
        "generated scan ranges"
    );

    let blocks = n.stats.block_num as usize;
    if ranges.is_empty() {
        return Ok(c
            .cn_list
            .iter()
            .map(|node| EngineNode {
                id: node.id,
                addr: node.addr.clone(),
                mcpu: generate_cpu_number(node.mcpu, blocks),
                data: Vec::new(),
            })
            .collect());
    }

    // For multi-CN launch-mode deployments every payload stays local.
    if is_launch_mode(&c.cn_list) {
        return Ok(put_blocks_in_current_cn(
            &c.addr,
            c.config.default_ncpu,
            ranges,
            blocks,
        ));
    }
    match rel.engine_kind() {
        EngineKind::LogStructured => Ok(hash_blocks_to_fixed_cn(
            &c.addr,
            c.config.default_ncpu,
            &c.cn_list,
            ranges,
            blocks,
        )),
        EngineKind::Memory => Ok(put_blocks_in_average(
            &c.addr,
            c.config.default_ncpu,
            &c.cn_list,
            ranges,
            blocks,
        )),
    }
}

pub(crate) fn put_blocks_in_current_cn(
    addr: &str,
    ncpu: usize,
    ranges: Vec<BlockRange>,
    blocks: usize,
) -> Vec<EngineNode> {
    vec![EngineNode {
        id: 0,
        addr: addr.to_string(),
        mcpu: generate_cpu_number(ncpu, blocks),
        data: ranges,
    }]
}

/// Even split in stable `ceil(n/|CNs|)` strides (memory engines).
pub(crate) fn put_blocks_in_average(
    addr: &str,
    ncpu: usize,
    cn_list: &[EngineNode],
    ranges: Vec<BlockRange>,
    blocks: usize,
) -> Vec<EngineNode> {
    let cn_count = cn_list.len().max(1);
    let step = (ranges.len() + cn_count - 1) / cn_count;
    let mut nodes: Vec<EngineNode> = Vec::new();
    for (j, chunk) in ranges.chunks(step.max(1)).enumerate() {
        let cn = &cn_list[j.min(cn_count - 1)];
        if is_same_cn(&cn.addr, addr) {
            match nodes.iter_mut().find(|node| is_same_cn(&node.addr, addr)) {
                Some(local) => local.data.extend_from_slice(chunk),
                None => nodes.push(EngineNode {
                    id: cn.id,
                    addr: addr.to_string(),
                    mcpu: generate_cpu_number(ncpu, blocks),
                    data: chunk.to_vec(),
                }),
            }
        } else {
            nodes.push(EngineNode {
                id: cn.id,
                addr: cn.addr.clone(),
                mcpu: generate_cpu_number(cn.mcpu, blocks),
                data: chunk.to_vec(),
            });
        }
    }
    nodes
}

/// Locality-preserving placement for log-structured engines: the memory
/// block stays on the current CN, everything else hashes by the 7-byte
/// object-time prefix so blocks of one object land together.
pub(crate) fn hash_blocks_to_fixed_cn(
    addr: &str,
    ncpu: usize,
    cn_list: &[EngineNode],
    ranges: Vec<BlockRange>,
    blocks: usize,
) -> Vec<EngineNode> {
    let mut nodes = vec![EngineNode {
        id: 0,
        addr: addr.to_string(),
        mcpu: generate_cpu_number(ncpu, blocks),
        data: vec![ranges[0].clone()],
    }];
    let rest = &ranges[1..];
    if rest.is_empty() {
        return nodes;
    }
    if cn_list.len() == 1 {
        nodes[0].data.extend_from_slice(rest);
        return nodes;
    }

    for cn in cn_list {
        if !is_same_cn(&cn.addr, addr) {
            nodes.push(EngineNode {
                id: cn.id,
                addr: cn.addr.clone(),
                mcpu: generate_cpu_number(cn.mcpu, blocks),
                data: Vec::new(),
            });
        }
    }
    // Stable order regardless of how the engine listed the CNs.
    nodes.sort_by(|a, b| a.addr.cmp(&b.addr));

    let cn_count = cn_list.len();
    for range in rest {
        let prefix = object_time_prefix(range).unwrap_or(range);
        let idx = simple_hash_to_range(prefix, cn_count);
        let idx = idx.min(nodes.len() - 1);
        nodes[idx].data.push(range.clone());
    }

    let max_load = nodes.iter().map(|n| n.data.len()).max().unwrap_or(0);
    let min_load = nodes.iter().map(|n| n.data.len()).min().unwrap_or(0);
    if min_load * 2 < max_load {
        warn!(max_load, min_load, "workload among CNs not balanced");
    }
    nodes.retain(|n| !n.data.is_empty());
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_engine::range;

    fn cn(addr: &str, mcpu: usize) -> EngineNode {
        EngineNode {
            id: 0,
            addr: addr.to_string(),
            mcpu,
            data: Vec::new(),
        }
    }

    fn fake_ranges(count: usize) -> Vec<BlockRange> {
        // Range 0 is the memory-resident block (prefix only).
        let mut ranges = vec![u64::MAX.to_le_bytes().to_vec()];
        for i in 0..count {
            let mut name = [0u8; 16];
            name[..7].copy_from_slice(format!("{:07}", i / 4).as_bytes());
            name[7..16].copy_from_slice(format!("{:09}", i).as_bytes());
            ranges.push(range::encode(i as u64, &name));
        }
        ranges
    }

    #[test]
    fn hash_placement_is_stable() {
        let cns = vec![cn("10.0.0.1:6001", 4), cn("10.0.0.2:6001", 4), cn("10.0.0.3:6001", 4)];
        let a = hash_blocks_to_fixed_cn("10.0.0.1:6001", 4, &cns, fake_ranges(64), 64);
        let b = hash_blocks_to_fixed_cn("10.0.0.1:6001", 4, &cns, fake_ranges(64), 64);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.addr, y.addr);
            assert_eq!(x.data, y.data);
        }
    }

    #[test]
    fn hash_placement_keeps_memory_block_local_and_groups_objects() {
        let cns = vec![cn("10.0.0.1:6001", 4), cn("10.0.0.2:6001", 4)];
        let ranges = fake_ranges(32);
        let placed = hash_blocks_to_fixed_cn("10.0.0.1:6001", 4, &cns, ranges.clone(), 32);

        let local = placed
            .iter()
            .find(|n| n.addr == "10.0.0.1:6001")
            .expect("local node");
        assert_eq!(local.data[0], ranges[0]);

        // Blocks sharing an object prefix always land on one CN.
        for node in &placed {
            for r in &node.data {
                let Some(prefix) = range::object_time_prefix(r) else {
                    continue;
                };
                for other in &placed {
                    if other.addr == node.addr {
                        continue;
                    }
                    assert!(!other
                        .data
                        .iter()
                        .any(|o| range::object_time_prefix(o) == Some(prefix)));
                }
            }
        }
        let placed_blocks: usize = placed.iter().map(|n| n.data.len()).sum();
        assert_eq!(placed_blocks, ranges.len());
    }

    #[test]
    fn average_placement_uses_stable_strides() {
        let cns = vec![cn("10.0.0.1:6001", 2), cn("10.0.0.2:6001", 2)];
        let ranges: Vec<BlockRange> = (0..5u64).map(|i| i.to_le_bytes().to_vec()).collect();
        let placed = put_blocks_in_average("10.0.0.1:6001", 2, &cns, ranges, 5);
        // ceil(5/2) = 3 then 2.
        assert_eq!(placed[0].data.len(), 3);
        assert_eq!(placed[1].data.len(), 2);
        assert_eq!(placed[1].addr, "10.0.0.2:6001");
    }
}
