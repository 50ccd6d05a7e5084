//! Narrow interface between content operations and the networking layer.
//!
//! The client only ever needs three things from an open connection: fetch
//! a block, publish a block, and resolve a discovered peer identity. The
//! production implementation over libp2p lives in `pinnet-p2p`;
//! [`StubSessionFactory`] is an in-process stand-in used by tests and by
//! nodes running in stub network mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use pinnet_types::{ContentAddress, Error, NodeAddress, Result};

/// One open connection to a storage node.
#[async_trait]
pub trait NodeSession: Send + Sync {
    /// Fetch a block from the node. `None` means the network answered and
    /// the block is absent, as opposed to not answering in time.
    async fn fetch_block(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>>;

    /// Make a block retrievable from the node.
    async fn publish_block(&self, address: &ContentAddress, data: Vec<u8>) -> Result<()>;

    /// Identity of the first peer discovered on this session.
    async fn first_peer(&self) -> Result<String>;

    /// Close the connection. Idempotent and safe to call after a failed
    /// operation.
    async fn close(&self);
}

/// Opens sessions against storage nodes.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, node: &NodeAddress) -> Result<Arc<dyn NodeSession>>;
}

/// Offline session factory backed by per-node in-process block maps.
///
/// Every node address resolves to its own block map, so uploads against
/// one address are invisible to another, matching how distinct storage
/// nodes behave. Latency injection and open counters make timeout and
/// pooling behavior observable in tests.
#[derive(Clone, Default)]
pub struct StubSessionFactory {
    inner: Arc<StubInner>,
}

#[derive(Default)]
struct StubInner {
    nodes: Mutex<HashMap<String, Arc<StubNode>>>,
}

#[derive(Default)]
struct StubNode {
    blocks: RwLock<HashMap<ContentAddress, Vec<u8>>>,
    latency: RwLock<Duration>,
    opens: AtomicUsize,
}

impl StubSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, address: &NodeAddress) -> Arc<StubNode> {
        let mut nodes = self.inner.nodes.lock();
        nodes
            .entry(address.as_str().to_string())
            .or_default()
            .clone()
    }

    /// Number of sessions opened against `node` so far.
    pub fn open_count(&self, node: &NodeAddress) -> usize {
        self.node(node).opens.load(Ordering::SeqCst)
    }

    /// Latency applied to every remote call on `node`'s sessions.
    pub fn set_latency(&self, node: &NodeAddress, latency: Duration) {
        *self.node(node).latency.write() = latency;
    }

    /// Preload a block on `node`, as if another client had published it.
    pub fn insert(&self, node: &NodeAddress, address: ContentAddress, data: Vec<u8>) {
        self.node(node).blocks.write().insert(address, data);
    }

    /// Block currently held by `node`, if any.
    pub fn stored(&self, node: &NodeAddress, address: &ContentAddress) -> Option<Vec<u8>> {
        self.node(node).blocks.read().get(address).cloned()
    }

    /// Drop a block from `node`, simulating a backend eviction.
    pub fn evict(&self, node: &NodeAddress, address: &ContentAddress) {
        self.node(node).blocks.write().remove(address);
    }
}

struct StubSession {
    node: Arc<StubNode>,
    peer: String,
    closed: AtomicBool,
}

impl StubSession {
    async fn simulate_latency(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Session("session closed".to_string()));
        }
        let latency = *self.node.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeSession for StubSession {
    async fn fetch_block(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>> {
        self.simulate_latency().await?;
        Ok(self.node.blocks.read().get(address).cloned())
    }

    async fn publish_block(&self, address: &ContentAddress, data: Vec<u8>) -> Result<()> {
        self.simulate_latency().await?;
        self.node.blocks.write().insert(*address, data);
        Ok(())
    }

    async fn first_peer(&self) -> Result<String> {
        self.simulate_latency().await?;
        Ok(self.peer.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionFactory for StubSessionFactory {
    async fn open(&self, node: &NodeAddress) -> Result<Arc<dyn NodeSession>> {
        let stub_node = self.node(node);
        stub_node.opens.fetch_add(1, Ordering::SeqCst);

        // A bootstrap address usually carries the node's identity as its
        // /p2p/ suffix; report that as the discovered peer.
        let peer = node
            .as_str()
            .rsplit_once("/p2p/")
            .map(|(_, id)| id.to_string())
            .unwrap_or_else(|| "stub-peer".to_string());

        Ok(Arc::new(StubSession {
            node: stub_node,
            peer,
            closed: AtomicBool::new(false),
        }))
    }
}
