//! The blockstore boundary.
//!
//! Local persistent key→value storage from CID to block bytes. The exchange
//! only needs `get` and `put`; implementations are expected to be
//! internally synchronized.
use crate::block::Block;
use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use fnv::FnvHashMap;
use parking_lot::RwLock;

#[async_trait]
pub trait Blockstore: Send + Sync + 'static {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>>;

    async fn put(&self, block: Block) -> Result<()>;

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.get(cid).await?.is_some())
    }
}

/// An in-memory blockstore.
#[derive(Default)]
pub struct MemoryBlockstore {
    blocks: RwLock<FnvHashMap<Cid, Block>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self.blocks.read().get(cid).cloned())
    }

    async fn put(&self, block: Block) -> Result<()> {
        self.blocks.write().insert(*block.cid(), block);
        Ok(())
    }
}
