//! TCP transport for pipeline messages.
//!
//! The service side accepts connections and feeds every frame to the
//! server's request handler; the client side keeps one write-path
//! connection per peer CN and opens short-lived connections for pings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tidal_common::{Result, TidalError};
use tidal_pipeline::ipc::serialize_batch;
use tidal_pipeline::RemoteSender;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{Cmd, PipelineCodec, PipelineMessage};
use crate::server::Server;

fn rpc(msg: impl Into<String>) -> TidalError {
    TidalError::Rpc(msg.into())
}

/// Accept loop serving one CN's pipeline endpoint.
pub struct PipelineService {
    server: Arc<Server>,
}

impl PipelineService {
    /// Service over `server`.
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Bind `addr` and return the accept-loop task handle plus the bound
    /// address (useful with port 0 in tests).
    pub async fn spawn(self, addr: &str) -> Result<(tokio::task::JoinHandle<()>, String)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| rpc(format!("bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| rpc(format!("local addr: {e}")))?
            .to_string();
        let server = self.server;
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "pipeline accept failed");
                        continue;
                    }
                };
                debug!(%peer, "pipeline connection accepted");
                let server = Arc::clone(&server);
                tokio::spawn(handle_connection(stream, server));
            }
        });
        Ok((handle, local))
    }
}

async fn handle_connection(stream: TcpStream, server: Arc<Server>) {
    let mut framed = Framed::new(stream, PipelineCodec);
    while let Some(frame) = framed.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "pipeline frame decode failed");
                return;
            }
        };
        match server.handle_request(msg).await {
            Ok(Some(reply)) => {
                if let Err(e) = framed.send(reply).await {
                    warn!(error = %e, "pipeline reply failed");
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "pipeline request failed");
                return;
            }
        }
    }
}

/// Write-path client toward peer CNs.
pub struct PipelineClient {
    conns: Mutex<HashMap<String, Framed<TcpStream, PipelineCodec>>>,
    connect_timeout: Duration,
}

impl PipelineClient {
    /// Fresh client with the default connect timeout.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            conns: Mutex::new(HashMap::new()),
            connect_timeout: Duration::from_secs(5),
        })
    }

    async fn connect(&self, addr: &str) -> Result<Framed<TcpStream, PipelineCodec>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| rpc(format!("connect to {addr} timed out")))?
            .map_err(|e| rpc(format!("connect to {addr}: {e}")))?;
        Ok(Framed::new(stream, PipelineCodec))
    }

    async fn send(&self, addr: &str, msg: PipelineMessage) -> Result<()> {
        let mut conns = self.conns.lock().await;
        if !conns.contains_key(addr) {
            let framed = self.connect(addr).await?;
            conns.insert(addr.to_string(), framed);
        }
        let framed = conns.get_mut(addr).expect("just inserted");
        match framed.send(msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Drop the broken connection so a retry reconnects.
                conns.remove(addr);
                Err(rpc(format!("send to {addr}: {e}")))
            }
        }
    }
}

#[async_trait]
impl RemoteSender for PipelineClient {
    async fn send_batch(&self, addr: &str, uuid: Uuid, batch: &RecordBatch) -> Result<()> {
        let payload = serialize_batch(batch)?;
        self.send(addr, PipelineMessage::batch(uuid, payload)).await
    }

    async fn send_end(&self, addr: &str, uuid: Uuid) -> Result<()> {
        self.send(addr, PipelineMessage::end(uuid)).await
    }

    async fn ping(&self, addr: &str) -> Result<()> {
        let mut framed = self.connect(addr).await?;
        framed.send(PipelineMessage::ping()).await?;
        let reply = tokio::time::timeout(self.connect_timeout, framed.next())
            .await
            .map_err(|_| rpc(format!("ping {addr} timed out")))?
            .ok_or_else(|| rpc(format!("ping {addr}: connection closed")))??;
        match reply.cmd {
            Cmd::Pong => Ok(()),
            other => Err(rpc(format!("ping {addr}: unexpected reply {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_alloc::LocalIdAllocator;
    use tidal_pipeline::{Received, ReceiverRegistry, WaitRegister};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn batches_flow_end_to_end_over_tcp() {
        let server = Server::new(LocalIdAllocator::new());
        let (task, addr) = PipelineService::new(Arc::clone(&server))
            .spawn("127.0.0.1:0")
            .await
            .expect("spawn");

        let token = CancellationToken::new();
        let mut reg = WaitRegister::new(4, &token);
        let uuid = Uuid::new_v4();
        server.register_uuid(uuid, reg.sender());

        let client = PipelineClient::new();
        client.ping(&addr).await.expect("ping");

        let batch = RecordBatch::try_new(
            Arc::new(arrow_schema::Schema::new(vec![arrow_schema::Field::new(
                "v",
                arrow_schema::DataType::Int64,
                false,
            )])),
            vec![Arc::new(arrow::array::Int64Array::from(vec![1_i64, 2]))],
        )
        .expect("batch");
        client.send_batch(&addr, uuid, &batch).await.expect("send");
        client.send_end(&addr, uuid).await.expect("end");

        let mut rx = reg.take_receiver();
        match rx.recv(None).await {
            Received::Batch(b) => assert_eq!(b.rows(), 2),
            other => panic!("expected batch, got {other:?}"),
        }
        assert!(matches!(rx.recv(None).await, Received::End));
        task.abort();
    }
}
