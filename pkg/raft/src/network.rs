//! The network transport this engine replicates over (spec.md §6
//! "Network (consumed)"). Best-effort delivery: messages may be dropped,
//! duplicated, or reordered. Only the trait boundary and an in-memory
//! double for tests live here; the real transport is out of scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

/// Called by the transport when a message arrives, and when its outbound
/// queue for a given address drains (so the dispatcher can reconsider
/// pending sends for that peer, per spec.md §5).
pub trait TransportHandler: Send + Sync {
    fn on_message(&self, sender_address: String, data: Bytes);
    fn on_output_queue_empty(&self, address: String);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self, handler: Arc<dyn TransportHandler>);
    /// Returns whether the send was accepted for delivery (not whether it
    /// arrived — delivery is best-effort).
    async fn send(&self, address: &str, data: Bytes) -> bool;
    async fn stop(&self);
}

/// An in-process transport double keyed by address, for unit and
/// integration tests. Every `send` is delivered immediately and
/// synchronously signals queue-empty right after.
pub struct MemoryTransport {
    peers: Mutex<HashMap<String, UnboundedSender<(String, Bytes)>>>,
    own_address: String,
}

impl MemoryTransport {
    pub fn new(own_address: impl Into<String>) -> Arc<Self> {
        Arc::new(MemoryTransport { peers: Mutex::new(HashMap::new()), own_address: own_address.into() })
    }

    /// Registers another `MemoryTransport`'s inbound channel under its
    /// address so this transport can route sends to it directly.
    pub fn link(&self, address: impl Into<String>, inbound: UnboundedSender<(String, Bytes)>) {
        self.peers.lock().unwrap().insert(address.into(), inbound);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, _handler: Arc<dyn TransportHandler>) {}

    async fn send(&self, address: &str, data: Bytes) -> bool {
        if let Some(tx) = self.peers.lock().unwrap().get(address) {
            tx.send((self.own_address.clone(), data)).is_ok()
        } else {
            false
        }
    }

    async fn stop(&self) {}
}
