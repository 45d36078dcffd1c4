use crate::{Ack, BrokerError, JobBroker, JobDelivery};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// In-process broker driver.
///
/// Depth counts published-but-unacked messages, matching what a passive
/// queue declare reports. Tests can pin the reported depth to exercise the
/// scheduler's high-water backpressure.
pub struct MemoryBroker {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    depth: Arc<AtomicU64>,
    depth_override: Mutex<Option<u64>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: Arc::new(AtomicU64::new(0)),
            depth_override: Mutex::new(None),
        }
    }

    /// Pin the depth reported by `queue_depth`, or clear the pin.
    pub async fn set_depth_override(&self, depth: Option<u64>) {
        *self.depth_override.lock().await = depth;
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryAck(Arc<AtomicU64>);

#[async_trait]
impl Ack for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.0.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn publish(&self, body: &[u8]) -> Result<(), BrokerError> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(body.to_vec())
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn queue_depth(&self) -> Result<u64, BrokerError> {
        if let Some(depth) = *self.depth_override.lock().await {
            return Ok(depth);
        }
        Ok(self.depth.load(Ordering::SeqCst))
    }

    async fn next(&self) -> Result<Option<JobDelivery>, BrokerError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(body) => Ok(Some(JobDelivery::new(
                body,
                Box::new(MemoryAck(Arc::clone(&self.depth))),
            ))),
            None => Ok(None),
        }
    }
}
