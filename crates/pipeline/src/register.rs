//! The single-channel rendezvous between two instructions.
//!
//! A [`WaitRegister`] is a bounded channel of `Option<Batch>` with its own
//! child cancellation token. The producer sends a terminal `None` then drops
//! its sender; cancelling the token is the only way to abort a blocked
//! producer. Exactly one consumer takes the receiver.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batch::Batch;

/// One bounded batch channel plus its cancellation context.
#[derive(Debug)]
pub struct WaitRegister {
    tx: mpsc::Sender<Option<Batch>>,
    rx: Option<mpsc::Receiver<Option<Batch>>>,
    cancel: CancellationToken,
}

impl WaitRegister {
    /// Register with `capacity` slots, cancelled together with `parent`.
    pub fn new(capacity: usize, parent: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Some(rx),
            cancel: parent.child_token(),
        }
    }

    /// Producer handle; clones share the bounded channel.
    pub fn sender(&self) -> RegSender {
        RegSender {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Take the unique consumer handle. Panics if taken twice — one consumer
    /// drains one register, by contract.
    pub fn take_receiver(&mut self) -> RegReceiver {
        let rx = self
            .rx
            .take()
            .expect("wait register receiver already taken");
        RegReceiver {
            rx,
            cancel: self.cancel.clone(),
        }
    }

    /// Cancel the register, releasing any blocked producer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The register's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Producer side of a wait register.
#[derive(Debug, Clone)]
pub struct RegSender {
    tx: mpsc::Sender<Option<Batch>>,
    cancel: CancellationToken,
}

impl RegSender {
    /// Send one message, waiting for channel capacity.
    ///
    /// Returns `false` when the consumer is gone or the register was
    /// cancelled — the producer should stop and drop its remaining batches
    /// (their reservations return to the pool on drop).
    pub async fn send(&self, item: Option<Batch>) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    /// Whether the register was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Consumer side of a wait register.
#[derive(Debug)]
pub struct RegReceiver {
    rx: mpsc::Receiver<Option<Batch>>,
    cancel: CancellationToken,
}

/// Outcome of one receive call.
#[derive(Debug)]
pub enum Received {
    /// A live batch.
    Batch(Batch),
    /// The producer finished (terminal `None` or channel closed).
    End,
    /// The register was cancelled.
    Cancelled,
}

impl RegReceiver {
    /// Receive the next message, reporting the time spent blocked to `wait`.
    pub async fn recv(&mut self, wait: Option<&crate::analyze::Analyze>) -> Received {
        let blocked = Instant::now();
        let out = tokio::select! {
            _ = self.cancel.cancelled() => Received::Cancelled,
            msg = self.rx.recv() => match msg {
                Some(Some(batch)) => Received::Batch(batch),
                Some(None) | None => Received::End,
            },
        };
        if let Some(anal) = wait {
            anal.wait(blocked.elapsed().as_nanos() as i64);
        }
        out
    }

    /// Drop every queued batch (failure-path drain; reservations return to
    /// the pool as the batches drop).
    pub fn drain(&mut self) {
        while let Ok(item) = self.rx.try_recv() {
            drop(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;
    use tidal_common::MemoryPool;

    fn test_batch(pool: &Arc<MemoryPool>) -> Batch {
        Batch::new(
            pool,
            RecordBatch::try_new(
                Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)])),
                vec![Arc::new(Int64Array::from(vec![7_i64]))],
            )
            .expect("batch"),
        )
        .expect("batch")
    }

    #[tokio::test]
    async fn consumer_sees_exactly_one_end() {
        let parent = CancellationToken::new();
        let mut reg = WaitRegister::new(2, &parent);
        let tx = reg.sender();
        let mut rx = reg.take_receiver();
        let pool = MemoryPool::unbounded();

        assert!(tx.send(Some(test_batch(&pool))).await);
        assert!(tx.send(None).await);
        drop(tx);

        assert!(matches!(rx.recv(None).await, Received::Batch(_)));
        assert!(matches!(rx.recv(None).await, Received::End));
        // After the terminal None the channel is closed; further receives
        // still report End, never a batch.
        assert!(matches!(rx.recv(None).await, Received::End));
        assert_eq!(pool.current_bytes(), 0);
    }

    #[tokio::test]
    async fn cancel_releases_blocked_producer() {
        let parent = CancellationToken::new();
        let mut reg = WaitRegister::new(1, &parent);
        let tx = reg.sender();
        let _rx = reg.take_receiver();
        let pool = MemoryPool::unbounded();

        assert!(tx.send(Some(test_batch(&pool))).await);
        let blocked = {
            let tx = tx.clone();
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { tx.send(Some(test_batch(&pool))).await })
        };
        reg.cancel();
        assert!(!blocked.await.expect("join"));
    }
}
