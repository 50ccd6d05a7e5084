//! Content operations against a storage node.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pinnet_storage::{Block, BlockStore};
use pinnet_types::{ContentAddress, Error, NodeAddress, Result};
use tracing::debug;

use crate::deadline::{bound, DEFAULT_DEADLINE};
use crate::pool::{PoolConfig, SessionLease, SessionPool};
use crate::session::SessionFactory;

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for any single remote operation.
    pub deadline: Duration,
    /// Session pool behavior.
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            pool: PoolConfig::default(),
        }
    }
}

/// The public operation set: exists, id, upload, upload_string,
/// dag_upload, dag_upload_string, remove.
///
/// Every operation leases exactly one session, acts under the deadline
/// race, and releases the lease on all exit paths (the lease guard drops
/// on success, failure, and timeout alike). The local block store is an
/// injected handle shared across operations, so content uploaded by one
/// call is visible to later ones within the same process.
pub struct ContentClient {
    store: Arc<dyn BlockStore>,
    pool: SessionPool,
    deadline: Duration,
}

impl ContentClient {
    pub fn new(
        store: Arc<dyn BlockStore>,
        factory: Arc<dyn SessionFactory>,
        config: ClientConfig,
    ) -> Self {
        Self {
            store,
            pool: SessionPool::new(factory, config.pool),
            deadline: config.deadline,
        }
    }

    /// Whether `address` is retrievable within the deadline.
    ///
    /// The local store is consulted first; a remote hit is cached locally
    /// without a pin, so a later collection pass may evict it again. A
    /// timeout surfaces as [`Error::Timeout`], which is an unknown
    /// outcome rather than confirmed absence.
    pub async fn exists(&self, node: &NodeAddress, address: &ContentAddress) -> Result<bool> {
        if self.store.contains(address)? {
            return Ok(true);
        }

        let lease = self.pool.lease(node).await?;
        let fetched =
            match bound(lease.fetch_block(address), self.deadline).await {
                Ok(fetched) => fetched,
                Err(err) => return Err(discard_on_failure(&lease, err)),
            };

        match fetched {
            Some(data) => {
                self.store.put(Block::with_address(*address, data))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Identity of the first peer discovered on the session to `node`.
    pub async fn id(&self, node: &NodeAddress) -> Result<String> {
        let lease = self.pool.lease(node).await?;
        bound(lease.first_peer(), self.deadline)
            .await
            .map_err(|err| discard_on_failure(&lease, err))
    }

    /// Upload a local file as a raw block.
    pub async fn upload(
        &self,
        node: &NodeAddress,
        path: impl AsRef<Path>,
    ) -> Result<ContentAddress> {
        let data = read_file(path.as_ref()).await?;
        self.add_block(node, Block::from_raw(data)).await
    }

    /// Upload inline text as a raw block.
    pub async fn upload_string(&self, node: &NodeAddress, contents: &str) -> Result<ContentAddress> {
        self.add_block(node, Block::from_raw(contents.as_bytes().to_vec()))
            .await
    }

    /// Upload a local file as a dag-json node.
    pub async fn dag_upload(
        &self,
        node: &NodeAddress,
        path: impl AsRef<Path>,
    ) -> Result<ContentAddress> {
        let data = read_file(path.as_ref()).await?;
        let text = String::from_utf8_lossy(&data).into_owned();
        self.add_dag(node, &text).await
    }

    /// Upload inline text as a dag-json node.
    pub async fn dag_upload_string(
        &self,
        node: &NodeAddress,
        contents: &str,
    ) -> Result<ContentAddress> {
        self.add_dag(node, contents).await
    }

    /// Unpin `address` and run a collection pass, echoing the address back.
    ///
    /// A no-op when the address was never pinned: the pin check comes
    /// first, and collection is only triggered when something was actually
    /// unpinned.
    pub async fn remove(
        &self,
        node: &NodeAddress,
        address: &ContentAddress,
    ) -> Result<ContentAddress> {
        let lease = self.pool.lease(node).await?;
        let outcome = bound(
            async {
                if self.store.is_pinned(address)? {
                    self.store.unpin(address)?;
                    let report = self.store.collect()?;
                    debug!(%address, reclaimed = report.reclaimed, "collected after unpin");
                }
                Ok(*address)
            },
            self.deadline,
        )
        .await;

        outcome.map_err(|err| discard_on_failure(&lease, err))
    }

    async fn add_dag(&self, node: &NodeAddress, text: &str) -> Result<ContentAddress> {
        // Text that parses as JSON is stored as that document; anything
        // else becomes a dag-json string node, like the raw text would on
        // a dag add.
        let value = serde_json::from_str::<serde_json::Value>(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
        let address = ContentAddress::from_dag_json(&value)?;
        let encoded = serde_json::to_vec(&value)?;
        self.add_block(node, Block::with_address(address, encoded))
            .await
    }

    async fn add_block(&self, node: &NodeAddress, block: Block) -> Result<ContentAddress> {
        let address = *block.address();
        let data = block.data().to_vec();

        let lease = self.pool.lease(node).await?;
        self.store.put(block)?;
        // Pin before the publish so a collection pass cannot race the add.
        self.store.pin(&address)?;

        bound(lease.publish_block(&address, data), self.deadline)
            .await
            .map_err(|err| discard_on_failure(&lease, err))?;

        Ok(address)
    }
}

fn discard_on_failure(lease: &SessionLease, err: Error) -> Error {
    // A session that failed or timed out mid-operation may carry an
    // in-flight query; close it rather than parking it for reuse.
    lease.discard();
    err
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| Error::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StubSessionFactory;
    use pinnet_storage::{CollectReport, MemoryBlockStore, StoreError};
    // The trait's methods use std's two-parameter `Result`; `use super::*`
    // brings the crate's one-parameter `Result` alias into scope, so name
    // the std one explicitly for the mock store's signatures below.
    use std::result::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node() -> NodeAddress {
        NodeAddress::parse("/dnsaddr/client.example.org/p2p/QmClientTestPeer").unwrap()
    }

    fn client_with(
        store: Arc<dyn BlockStore>,
        factory: &StubSessionFactory,
        config: ClientConfig,
    ) -> ContentClient {
        ContentClient::new(store, Arc::new(factory.clone()), config)
    }

    /// Store wrapper that counts collection passes.
    struct CountingStore {
        inner: MemoryBlockStore,
        collects: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryBlockStore::new(),
                collects: AtomicUsize::new(0),
            }
        }

        fn collect_passes(&self) -> usize {
            self.collects.load(Ordering::SeqCst)
        }
    }

    impl BlockStore for CountingStore {
        fn put(&self, block: Block) -> Result<(), StoreError> {
            self.inner.put(block)
        }
        fn get(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(address)
        }
        fn contains(&self, address: &ContentAddress) -> Result<bool, StoreError> {
            self.inner.contains(address)
        }
        fn pin(&self, address: &ContentAddress) -> Result<(), StoreError> {
            self.inner.pin(address)
        }
        fn unpin(&self, address: &ContentAddress) -> Result<bool, StoreError> {
            self.inner.unpin(address)
        }
        fn is_pinned(&self, address: &ContentAddress) -> Result<bool, StoreError> {
            self.inner.is_pinned(address)
        }
        fn collect(&self) -> Result<CollectReport, StoreError> {
            self.collects.fetch_add(1, Ordering::SeqCst);
            self.inner.collect()
        }
        fn block_count(&self) -> Result<u64, StoreError> {
            self.inner.block_count()
        }
    }

    #[tokio::test]
    async fn upload_string_pins_and_publishes() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store.clone(), &factory, ClientConfig::default());

        let address = client.upload_string(&node(), "Hello world!!!").await.unwrap();

        assert!(store.is_pinned(&address).unwrap());
        assert_eq!(
            store.get(&address).unwrap(),
            Some(b"Hello world!!!".to_vec())
        );
        assert_eq!(
            factory.stored(&node(), &address),
            Some(b"Hello world!!!".to_vec())
        );
    }

    #[tokio::test]
    async fn upload_reads_the_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.txt");
        std::fs::write(&path, b"file payload").unwrap();

        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store.clone(), &factory, ClientConfig::default());

        let address = client.upload(&node(), &path).await.unwrap();
        assert_eq!(store.get(&address).unwrap(), Some(b"file payload".to_vec()));
    }

    #[tokio::test]
    async fn upload_missing_file_fails_with_file_read() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store, &factory, ClientConfig::default());

        let result = client.upload(&node(), "/definitely/not/here.txt").await;
        assert!(matches!(result, Err(Error::FileRead { .. })));
    }

    #[tokio::test]
    async fn exists_is_true_after_upload() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store, &factory, ClientConfig::default());

        let address = client.upload_string(&node(), "probe me").await.unwrap();
        assert!(client.exists(&node(), &address).await.unwrap());
    }

    #[tokio::test]
    async fn exists_fetches_and_caches_remote_content() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store.clone(), &factory, ClientConfig::default());

        let address = ContentAddress::from_raw(b"remote only");
        factory.insert(&node(), address, b"remote only".to_vec());

        assert!(client.exists(&node(), &address).await.unwrap());
        // Cached locally but not pinned: collection may evict it.
        assert!(store.contains(&address).unwrap());
        assert!(!store.is_pinned(&address).unwrap());
    }

    #[tokio::test]
    async fn exists_is_false_for_unknown_content() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store, &factory, ClientConfig::default());

        let address = ContentAddress::from_raw(b"nowhere");
        assert!(!client.exists(&node(), &address).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        factory.set_latency(&node(), Duration::from_secs(120));
        let client = client_with(store, &factory, ClientConfig::default());

        let address = ContentAddress::from_raw(b"too slow");
        let result = client.exists(&node(), &address).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn id_resolves_the_discovered_peer() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store, &factory, ClientConfig::default());

        assert_eq!(client.id(&node()).await.unwrap(), "QmClientTestPeer");
    }

    #[tokio::test]
    async fn remove_on_unpinned_address_skips_collection() {
        let store = Arc::new(CountingStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store.clone(), &factory, ClientConfig::default());

        let address = ContentAddress::from_raw(b"never pinned");
        let echoed = client.remove(&node(), &address).await.unwrap();

        assert_eq!(echoed, address);
        assert_eq!(store.collect_passes(), 0);
    }

    #[tokio::test]
    async fn remove_on_pinned_address_unpins_and_collects_once() {
        let store = Arc::new(CountingStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store.clone(), &factory, ClientConfig::default());

        let address = client.upload_string(&node(), "pinned then gone").await.unwrap();
        let echoed = client.remove(&node(), &address).await.unwrap();

        assert_eq!(echoed, address);
        assert!(!store.is_pinned(&address).unwrap());
        assert_eq!(store.collect_passes(), 1);
        // The unpinned block itself was reclaimed by the pass.
        assert!(!store.contains(&address).unwrap());
    }

    #[tokio::test]
    async fn dag_upload_string_normalizes_json_documents() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store.clone(), &factory, ClientConfig::default());

        let from_doc = client
            .dag_upload_string(&node(), r#"{"name":"pinnet","size":3}"#)
            .await
            .unwrap();
        let from_plain = client
            .dag_upload_string(&node(), "not json at all")
            .await
            .unwrap();

        assert_ne!(from_doc, from_plain);
        assert_eq!(
            store.get(&from_plain).unwrap(),
            Some(b"\"not json at all\"".to_vec())
        );
    }

    #[tokio::test]
    async fn dag_and_raw_uploads_of_the_same_text_differ() {
        let store = Arc::new(MemoryBlockStore::new());
        let factory = StubSessionFactory::new();
        let client = client_with(store, &factory, ClientConfig::default());

        let raw = client.upload_string(&node(), "same text").await.unwrap();
        let dag = client.dag_upload_string(&node(), "same text").await.unwrap();
        assert_ne!(raw, dag);
    }
}
