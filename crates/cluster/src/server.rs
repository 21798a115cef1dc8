//! Node-wide receiver registry and segment-id state.
//!
//! One instance per CN. Hands out monotonic ids for inter-CN connectors,
//! routes incoming batch messages to the matching wait register, and
//! allocates the 12-byte segment ids backing distributed writes. The mutex
//! is held only for map access, never across channel sends or I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tidal_common::{Result, SegmentId, TidalError};
use tidal_pipeline::ipc::deserialize_batch;
use tidal_pipeline::{Batch, ReceiverRegistry, RegSender, SegmentAllocator};
use tracing::debug;
use uuid::Uuid;

use crate::id_alloc::IdAllocator;
use crate::message::{Cmd, PipelineMessage, Sid};

// 10ms per round; bounds how long an early dispatcher waits for the
// destination scope to register.
const REGISTRATION_WAIT_ROUNDS: usize = 500;

#[derive(Default)]
struct ServerState {
    next_id: u64,
    by_id: HashMap<u64, RegSender>,
    by_uuid: HashMap<Uuid, RegSender>,
    segment: Option<SegmentId>,
}

/// Process-wide pipeline server state.
pub struct Server {
    state: Mutex<ServerState>,
    allocator: Arc<dyn IdAllocator>,
}

impl Server {
    /// Server over the given cluster id source.
    pub fn new(allocator: Arc<dyn IdAllocator>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            allocator,
        })
    }

    /// Register a connector target, returning its monotonic id.
    pub fn register(&self, reg: RegSender) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.by_id.insert(id, reg);
        id
    }

    /// Take the register for `id`. Each registration is consumed exactly
    /// once: the second call for the same id returns `None`.
    pub fn get(&self, id: u64) -> Option<RegSender> {
        self.state.lock().by_id.remove(&id)
    }

    fn lookup(&self, msg: &PipelineMessage) -> Option<RegSender> {
        let state = self.state.lock();
        state
            .by_uuid
            .get(&msg.uuid)
            .cloned()
            .or_else(|| state.by_id.get(&msg.id).cloned())
    }

    /// Route one incoming message; returns the reply to write back, if any.
    ///
    /// Dispatchers may race the destination scope's registration, so an
    /// unknown uuid is retried briefly before the payload is dropped.
    pub async fn handle_request(&self, msg: PipelineMessage) -> Result<Option<PipelineMessage>> {
        match msg.cmd {
            Cmd::Ping => return Ok(Some(PipelineMessage::pong())),
            Cmd::Pong => return Ok(None),
            Cmd::BatchMessage => {}
        }
        let mut sender = self.lookup(&msg);
        if sender.is_none() {
            for _ in 0..REGISTRATION_WAIT_ROUNDS {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                sender = self.lookup(&msg);
                if sender.is_some() {
                    break;
                }
            }
        }
        let Some(sender) = sender else {
            debug!(uuid = %msg.uuid, id = msg.id, "dropping message for unknown receiver");
            return Ok(None);
        };
        match msg.sid {
            Sid::MessageEnd => {
                sender.send(None).await;
            }
            Sid::Normal => {
                let data = deserialize_batch(&msg.data)
                    .map_err(|e| TidalError::Rpc(format!("bad batch payload: {e}")))?;
                sender.send(Some(Batch::unpooled(data))).await;
            }
        }
        Ok(None)
    }
}

impl ReceiverRegistry for Server {
    fn register_uuid(&self, uuid: Uuid, sender: RegSender) {
        self.state.lock().by_uuid.insert(uuid, sender);
    }

    fn unregister_uuid(&self, uuid: Uuid) {
        self.state.lock().by_uuid.remove(&uuid);
    }
}

impl SegmentAllocator for Server {
    /// First call fetches a fresh cluster id; afterwards the 32-bit prefix
    /// increments, reallocating when it runs out.
    fn generate_segment(&self) -> Result<SegmentId> {
        let mut state = self.state.lock();
        if let Some(segment) = &mut state.segment {
            if segment.increment() {
                return Ok(*segment);
            }
        }
        let fresh = SegmentId::new(self.allocator.allocate_id()?);
        state.segment = Some(fresh);
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_alloc::LocalIdAllocator;
    use tidal_pipeline::WaitRegister;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn registrations_are_consumed_exactly_once() {
        let server = Server::new(LocalIdAllocator::new());
        let token = CancellationToken::new();
        let reg = WaitRegister::new(1, &token);
        let id = server.register(reg.sender());
        assert!(server.get(id).is_some());
        assert!(server.get(id).is_none());
    }

    #[test]
    fn segment_ids_carry_marker_and_increment() {
        let server = Server::new(LocalIdAllocator::new());
        let a = server.generate_segment().expect("segment");
        let b = server.generate_segment().expect("segment");
        assert!(a.is_cn_generated());
        assert_eq!(a.cluster_id(), b.cluster_id());
        assert_eq!(b.prefix(), a.prefix() + 1);
    }

    #[tokio::test]
    async fn batch_messages_route_by_uuid() {
        let server = Server::new(LocalIdAllocator::new());
        let token = CancellationToken::new();
        let mut reg = WaitRegister::new(2, &token);
        let uuid = Uuid::new_v4();
        server.register_uuid(uuid, reg.sender());

        let batch = arrow::record_batch::RecordBatch::try_new(
            std::sync::Arc::new(arrow_schema::Schema::new(vec![arrow_schema::Field::new(
                "v",
                arrow_schema::DataType::Int64,
                false,
            )])),
            vec![std::sync::Arc::new(arrow::array::Int64Array::from(vec![
                9_i64,
            ]))],
        )
        .expect("batch");
        let payload = tidal_pipeline::ipc::serialize_batch(&batch).expect("payload");
        server
            .handle_request(PipelineMessage::batch(uuid, payload))
            .await
            .expect("route");
        server
            .handle_request(PipelineMessage::end(uuid))
            .await
            .expect("route end");

        let mut rx = reg.take_receiver();
        match rx.recv(None).await {
            tidal_pipeline::Received::Batch(b) => assert_eq!(b.rows(), 1),
            other => panic!("expected batch, got {other:?}"),
        }
        assert!(matches!(
            rx.recv(None).await,
            tidal_pipeline::Received::End
        ));
    }
}
