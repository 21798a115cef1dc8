//! Seams toward the cluster layer.
//!
//! The pipeline crate never talks to sockets itself: remote dispatch,
//! receiver registration, and segment allocation go through these traits so
//! the cluster crate can own transport and process-wide state without a
//! dependency cycle.

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use tidal_common::{Result, SegmentId};
use uuid::Uuid;

use crate::register::RegSender;

/// Outbound inter-CN batch transport, implemented by the pipeline client.
#[async_trait]
pub trait RemoteSender: Send + Sync {
    /// Serialize and deliver one batch to the register `uuid` on `addr`.
    async fn send_batch(&self, addr: &str, uuid: Uuid, batch: &RecordBatch) -> Result<()>;

    /// Deliver the end-of-stream sentinel for `uuid` on `addr`.
    async fn send_end(&self, addr: &str, uuid: Uuid) -> Result<()>;

    /// Reachability probe used when pruning the CN list.
    async fn ping(&self, addr: &str) -> Result<()>;
}

/// Node-local receiver registry, implemented by the cluster server.
pub trait ReceiverRegistry: Send + Sync {
    /// Make `sender` reachable for incoming batches addressed to `uuid`.
    fn register_uuid(&self, uuid: Uuid, sender: RegSender);

    /// Remove the registration; delivery after this drops the payload.
    fn unregister_uuid(&self, uuid: Uuid);
}

/// CN segment-id source backing distributed writes.
pub trait SegmentAllocator: Send + Sync {
    /// Next 12-byte segment id.
    fn generate_segment(&self) -> Result<SegmentId>;
}
