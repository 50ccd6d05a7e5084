//! Local block storage and pin tracking for content-addressed data.
//!
//! A block store holds raw content keyed by its [`ContentAddress`] and a
//! pin set marking addresses that must survive garbage collection. Two
//! backends are provided: an in-memory store for tests and small
//! deployments, and a sled-backed store for persistent nodes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use pinnet_types::{ContentAddress, Error};
use serde::Serialize;
use sled::{Db, Tree};
use tracing::debug;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err.to_string())
    }
}

/// A block of data together with the address derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    address: ContentAddress,
    data: Vec<u8>,
}

impl Block {
    /// Wrap raw bytes, deriving their raw-codec address.
    pub fn from_raw(data: Vec<u8>) -> Self {
        let address = ContentAddress::from_raw(&data);
        Self { address, data }
    }

    /// Pair an already-known address with its data. The caller is
    /// responsible for the address actually matching the bytes.
    pub fn with_address(address: ContentAddress, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    pub fn address(&self) -> &ContentAddress {
        &self.address
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Report from a garbage-collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    /// Blocks examined by the pass.
    pub examined: u64,
    /// Unpinned blocks reclaimed.
    pub reclaimed: u64,
}

/// Abstract block store trait.
///
/// Implementations are shared behind `Arc` and called from concurrent
/// operations, so every method takes `&self`.
pub trait BlockStore: Send + Sync {
    /// Store a block. Re-putting an existing address is a no-op.
    fn put(&self, block: Block) -> Result<(), StoreError>;

    /// Retrieve block data by address.
    fn get(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, StoreError>;

    /// Whether a block is present locally.
    fn contains(&self, address: &ContentAddress) -> Result<bool, StoreError>;

    /// Mark an address as pinned, protecting it from collection.
    fn pin(&self, address: &ContentAddress) -> Result<(), StoreError>;

    /// Remove the pin for an address. Returns whether it was pinned.
    fn unpin(&self, address: &ContentAddress) -> Result<bool, StoreError>;

    /// Whether an address is currently pinned.
    fn is_pinned(&self, address: &ContentAddress) -> Result<bool, StoreError>;

    /// Reclaim all unpinned blocks.
    fn collect(&self) -> Result<CollectReport, StoreError>;

    /// Count of locally stored blocks.
    fn block_count(&self) -> Result<u64, StoreError>;
}

/// In-memory block store (for testing and small deployments).
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    inner: Arc<MemoryBlockStoreInner>,
}

#[derive(Default)]
struct MemoryBlockStoreInner {
    blocks: RwLock<HashMap<ContentAddress, Vec<u8>>>,
    pins: RwLock<HashSet<ContentAddress>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, block: Block) -> Result<(), StoreError> {
        let address = *block.address();
        self.inner.blocks.write().insert(address, block.into_data());
        Ok(())
    }

    fn get(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.blocks.read().get(address).cloned())
    }

    fn contains(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        Ok(self.inner.blocks.read().contains_key(address))
    }

    fn pin(&self, address: &ContentAddress) -> Result<(), StoreError> {
        self.inner.pins.write().insert(*address);
        Ok(())
    }

    fn unpin(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        Ok(self.inner.pins.write().remove(address))
    }

    fn is_pinned(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        Ok(self.inner.pins.read().contains(address))
    }

    fn collect(&self) -> Result<CollectReport, StoreError> {
        let pins = self.inner.pins.read();
        let mut blocks = self.inner.blocks.write();

        let examined = blocks.len() as u64;
        let before = blocks.len();
        blocks.retain(|address, _| pins.contains(address));
        let reclaimed = (before - blocks.len()) as u64;

        debug!(examined, reclaimed, "memory store collection pass");
        Ok(CollectReport {
            examined,
            reclaimed,
        })
    }

    fn block_count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.blocks.read().len() as u64)
    }
}

/// Sled-backed implementation
pub struct SledBlockStore {
    db: Db,
    blocks: Tree,
    pins: Tree,
}

impl SledBlockStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        let pins = db.open_tree("pins")?;
        Ok(Self { db, blocks, pins })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl BlockStore for SledBlockStore {
    fn put(&self, block: Block) -> Result<(), StoreError> {
        let key = block.address().to_bytes();
        self.blocks.insert(key, block.into_data())?;
        Ok(())
    }

    fn get(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.blocks.get(address.to_bytes())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn contains(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        Ok(self.blocks.contains_key(address.to_bytes())?)
    }

    fn pin(&self, address: &ContentAddress) -> Result<(), StoreError> {
        self.pins.insert(address.to_bytes(), vec![1u8])?;
        Ok(())
    }

    fn unpin(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        Ok(self.pins.remove(address.to_bytes())?.is_some())
    }

    fn is_pinned(&self, address: &ContentAddress) -> Result<bool, StoreError> {
        Ok(self.pins.contains_key(address.to_bytes())?)
    }

    fn collect(&self) -> Result<CollectReport, StoreError> {
        let mut report = CollectReport::default();
        for entry in self.blocks.iter() {
            let (key, _) = entry?;
            report.examined += 1;
            if !self.pins.contains_key(&key)? {
                self.blocks.remove(&key)?;
                report.reclaimed += 1;
            }
        }
        self.db.flush()?;

        debug!(
            examined = report.examined,
            reclaimed = report.reclaimed,
            "sled store collection pass"
        );
        Ok(report)
    }

    fn block_count(&self) -> Result<u64, StoreError> {
        Ok(self.blocks.len() as u64)
    }
}
