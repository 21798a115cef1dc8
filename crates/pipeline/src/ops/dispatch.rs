//! Fan-out multiplexer: broadcast, hash-bucket, or round-robin delivery to
//! local registers and remote receivers.
//!
//! Destination order is significant for the hashed rules: bucket `i` always
//! maps to destination `i`, local or remote.

use arrow::array::UInt64Array;
use tidal_common::{Result, TidalError};
use tracing::debug;
use uuid::Uuid;

use crate::batch::Batch;
use crate::process::Process;
use crate::register::RegSender;
use crate::row::{hash_key, hash_rows, take_rows, ScalarKey};

// Hash each row's block id (the high half of its row id).
fn block_hashes(batch: &Batch, row_id_col: usize) -> Result<Vec<u64>> {
    let ids = batch
        .data()
        .columns()
        .get(row_id_col)
        .ok_or_else(|| TidalError::Execution(format!("row-id column {row_id_col} missing")))?
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| TidalError::Execution("row-id column must be uint64".to_string()))?;
    Ok(ids
        .iter()
        .map(|id| hash_key(&[ScalarKey::UInt(id.unwrap_or(0) >> 32)]))
        .collect())
}

/// Remote destination of a dispatch edge.
#[derive(Debug, Clone)]
pub struct ReceiveInfo {
    /// Registration key on the destination CN.
    pub uuid: Uuid,
    /// Destination CN address.
    pub node_addr: String,
}

/// One dispatch destination, in bucket order.
pub enum DispatchDest {
    /// Same-process wait register.
    Local(RegSender),
    /// Receiver registered on a peer CN.
    Remote(ReceiveInfo),
}

/// Delivery rule.
#[derive(Debug, Clone, Copy)]
pub enum DispatchFunc {
    /// Every receiver gets every batch.
    Broadcast,
    /// Rows are hashed on one column and routed to `hash % receivers`.
    ByBucket {
        /// Hash column position.
        hash_col: usize,
    },
    /// Rows are hashed on the block id embedded in their row ids, so every
    /// row of one block lands on the same receiver.
    ByBlockId {
        /// Row-id column position.
        row_id_col: usize,
    },
    /// Whole batches rotate across local receivers.
    RoundRobin,
}

/// Dispatch operator argument.
pub struct DispatchArg {
    /// Delivery rule.
    pub func: DispatchFunc,
    dests: Vec<DispatchDest>,
    next_local: usize,
    end_sent: bool,
}

impl DispatchArg {
    /// Dispatcher over local then remote destinations.
    pub fn new(
        func: DispatchFunc,
        local_regs: Vec<RegSender>,
        remote_regs: Vec<ReceiveInfo>,
    ) -> Self {
        let mut dests: Vec<DispatchDest> =
            local_regs.into_iter().map(DispatchDest::Local).collect();
        dests.extend(remote_regs.into_iter().map(DispatchDest::Remote));
        Self::with_destinations(func, dests)
    }

    /// Dispatcher over an explicitly ordered destination list (bucket `i`
    /// goes to `dests[i]`).
    pub fn with_destinations(func: DispatchFunc, dests: Vec<DispatchDest>) -> Self {
        Self {
            func,
            dests,
            next_local: 0,
            end_sent: false,
        }
    }

    async fn send_remote(&self, proc: &Process, info: &ReceiveInfo, batch: &Batch) -> Result<()> {
        let remote = proc
            .remote
            .as_ref()
            .ok_or_else(|| TidalError::Rpc("no remote sender configured".to_string()))?;
        // One retry for transient transport failures, then surface.
        match remote
            .send_batch(&info.node_addr, info.uuid, batch.data())
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                debug!(addr = %info.node_addr, %err, "retrying remote dispatch once");
                remote
                    .send_batch(&info.node_addr, info.uuid, batch.data())
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Route the current batch per the delivery rule.
    pub async fn call(&mut self, proc: &mut Process, idx: usize, is_last: bool) -> Result<bool> {
        let Some(batch) = proc.take_input() else {
            return Ok(false);
        };
        if batch.is_empty() {
            return Ok(false);
        }
        let anal = proc.analyze(idx);
        anal.output(&batch, is_last);

        match self.func {
            DispatchFunc::Broadcast => {
                // Every destination gets its own reservation-carrying copy;
                // the last one takes the original.
                let last = self.dests.len().saturating_sub(1);
                for (i, dest) in self.dests.iter().enumerate() {
                    match dest {
                        DispatchDest::Local(reg) if i == last => {
                            reg.send(Some(batch)).await;
                            break;
                        }
                        DispatchDest::Local(reg) => {
                            reg.send(Some(batch.duplicate(&proc.pool)?)).await;
                        }
                        DispatchDest::Remote(info) => {
                            anal.network(batch.size_bytes() as i64);
                            self.send_remote(proc, info, &batch).await?;
                            if i == last {
                                break;
                            }
                        }
                    }
                }
            }
            DispatchFunc::ByBucket { .. } | DispatchFunc::ByBlockId { .. } => {
                let total = self.dests.len().max(1);
                let hashes = match self.func {
                    DispatchFunc::ByBucket { hash_col } => {
                        let col = batch
                            .data()
                            .columns()
                            .get(hash_col)
                            .cloned()
                            .ok_or_else(|| {
                                TidalError::Execution(format!(
                                    "dispatch hash column {hash_col} missing"
                                ))
                            })?;
                        hash_rows(&[col], batch.rows())?
                    }
                    DispatchFunc::ByBlockId { row_id_col } => block_hashes(&batch, row_id_col)?,
                    _ => unreachable!(),
                };
                let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); total];
                for (row, h) in hashes.iter().enumerate() {
                    buckets[(h % total as u64) as usize].push(row as u32);
                }
                for (bucket, rows) in buckets.into_iter().enumerate() {
                    if rows.is_empty() {
                        continue;
                    }
                    let part = Batch::new(&proc.pool, take_rows(batch.data(), &rows)?)?;
                    match &self.dests[bucket] {
                        DispatchDest::Local(reg) => {
                            reg.send(Some(part)).await;
                        }
                        DispatchDest::Remote(info) => {
                            anal.network(part.size_bytes() as i64);
                            self.send_remote(proc, info, &part).await?;
                        }
                    }
                }
            }
            DispatchFunc::RoundRobin => {
                let locals: Vec<usize> = self
                    .dests
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| matches!(d, DispatchDest::Local(_)))
                    .map(|(i, _)| i)
                    .collect();
                if locals.is_empty() {
                    return Err(TidalError::Execution(
                        "round-robin dispatch has no local receivers".to_string(),
                    ));
                }
                let slot = locals[self.next_local % locals.len()];
                self.next_local += 1;
                if let DispatchDest::Local(reg) = &self.dests[slot] {
                    reg.send(Some(batch)).await;
                }
            }
        }
        Ok(false)
    }

    /// Terminate every destination: local nils, remote `MessageEnd`.
    pub async fn free(&mut self, proc: &mut Process, _failed: bool) {
        if self.end_sent {
            return;
        }
        self.end_sent = true;
        for dest in &self.dests {
            match dest {
                DispatchDest::Local(reg) => {
                    let _ = reg.send(None).await;
                }
                DispatchDest::Remote(info) => {
                    if let Some(remote) = proc.remote.as_ref() {
                        if let Err(err) = remote.send_end(&info.node_addr, info.uuid).await {
                            debug!(addr = %info.node_addr, %err, "remote end delivery failed");
                        }
                    }
                }
            }
        }
    }
}
