//! The exchange façade.
//!
//! [`Bitswap`] is what the rest of the node calls: `get_block` to obtain a
//! block from wherever it lives, `has_block` to contribute one, `close` to
//! shut the engine down. It owns the running engine and the shared context;
//! nothing below it points back up.
use crate::block::Block;
use crate::engine::{BitswapContext, BitswapEngine};
use crate::network::ProtocolHandler;
use crate::wantlist::WantSession;
use cid::Cid;
use derive_more::{Display, Error, From};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, From, Display, Error)]
pub enum BitswapError {
    /// No peer delivered the block within the configured budget.
    #[display(fmt = "timed out waiting for block")]
    Timeout,
    #[display(fmt = "exchange is shutting down")]
    ShuttingDown,
    #[display(fmt = "{}", _0)]
    Internal(#[error(not(source))] anyhow::Error),
}

/// The bitswap exchange.
pub struct Bitswap {
    ctx: Arc<BitswapContext>,
    engine: BitswapEngine,
    shutdown: CancellationToken,
}

impl Bitswap {
    /// Starts the engine over the given context. The context's token is
    /// shared with every other long-running worker of the node, so one
    /// cancellation stops them all.
    pub fn start(ctx: Arc<BitswapContext>, handlers: Arc<Vec<Arc<dyn ProtocolHandler>>>) -> Self {
        let shutdown = ctx.shutdown.clone();
        let engine = BitswapEngine::start(ctx.clone(), handlers);
        Self { ctx, engine, shutdown }
    }

    pub fn context(&self) -> &Arc<BitswapContext> {
        &self.ctx
    }

    pub fn is_online(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Obtains a block: from the local blockstore if it is there, otherwise
    /// from the network via the want list. Waits up to the configured
    /// budget (60 s by default) before reporting a timeout.
    pub async fn get_block(&self, cid: &Cid) -> Result<Block, BitswapError> {
        if self.shutdown.is_cancelled() {
            return Err(BitswapError::ShuttingDown);
        }
        // check locally first
        if let Some(block) = self.ctx.blockstore.get(cid).await? {
            return Ok(block);
        }
        // now ask the network
        let entry = self.ctx.wantlist.add(cid, WantSession::Local);
        let completion = entry.subscribe();
        let budget = self.ctx.config.get_block_timeout();
        let result = tokio::time::timeout(budget, completion).await;
        // reference count down, whatever the outcome; the entry stays
        self.ctx.wantlist.remove(cid, &WantSession::Local);
        match result {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(_closed)) => Err(BitswapError::ShuttingDown),
            Err(_elapsed) => {
                debug!("get_block {} timed out after {:?}", cid, budget);
                self.ctx.cancel_want(cid);
                Err(BitswapError::Timeout)
            }
        }
    }

    /// `get_block` for each CID, concurrently. Fails as soon as any single
    /// block times out.
    pub async fn get_blocks(&self, cids: &[Cid]) -> Result<Vec<Block>, BitswapError> {
        try_join_all(cids.iter().map(|cid| self.get_block(cid))).await
    }

    /// A block became available locally: store it, announce it, and
    /// complete any waiters. Calling this twice with the same block is
    /// equivalent to calling it once.
    pub async fn has_block(&self, block: Block) -> Result<(), BitswapError> {
        Ok(self.ctx.receive_block(block).await?)
    }

    /// Stops the workers and drains both queues. Pending `get_block`
    /// callers observe `ShuttingDown`.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.engine.stop().await;
        self.ctx.wantlist.clear();
        self.ctx.peer_requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::RAW;
    use crate::config::NodeConfig;
    use crate::peer::{NodeIdentity, Peerstore};
    use crate::routing::{MemoryRouting, PeerContact, RoutingRegistry};
    use crate::store::MemoryBlockstore;
    use multihash::{Code, MultihashDigest};
    use std::time::Duration;

    fn exchange_with_timeout(secs: u64) -> Bitswap {
        let identity = NodeIdentity::generate();
        let mut config = NodeConfig::test();
        config.get_block_timeout_secs = secs;
        let local = PeerContact {
            peer_id: identity.peer_id().clone(),
            addr: None,
        };
        let ctx = BitswapContext::new(
            identity.peer_id().clone(),
            "127.0.0.1:0".parse().unwrap(),
            config,
            Arc::new(Peerstore::new(identity.peer_id().clone())),
            Arc::new(MemoryBlockstore::new()),
            Arc::new(MemoryRouting::new(RoutingRegistry::new(), local)),
            CancellationToken::new(),
        );
        Bitswap::start(ctx, Arc::new(Vec::new()))
    }

    fn block(data: &[u8]) -> Block {
        Block::new(data.to_vec(), Cid::new_v1(RAW, Code::Sha2_256.digest(data)))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_blocks_come_back_immediately() {
        let exchange = exchange_with_timeout(60);
        let b = block(b"hello\n");
        exchange.has_block(b.clone()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(100), exchange.get_block(b.cid()))
            .await
            .expect("local hit must not wait")
            .unwrap();
        assert_eq!(got.data(), b"hello\n");
        exchange.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_drains_the_local_session() {
        let exchange = exchange_with_timeout(1);
        let c = *block(b"never arrives").cid();
        let err = exchange.get_block(&c).await.unwrap_err();
        assert!(matches!(err, BitswapError::Timeout));
        // the entry stays, but no session of ours is left on it
        let entry = exchange.context().wantlist.find(&c).unwrap();
        assert_eq!(entry.session_count(), 0);
        exchange.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn has_block_is_idempotent() {
        let exchange = exchange_with_timeout(60);
        let b = block(b"twice");
        exchange.has_block(b.clone()).await.unwrap();
        exchange.has_block(b.clone()).await.unwrap();
        assert_eq!(exchange.context().wantlist.len(), 0);
        let got = exchange.get_block(b.cid()).await.unwrap();
        assert_eq!(got.data(), b"twice");
        exchange.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_blocks_is_get_block_for_each() {
        let exchange = exchange_with_timeout(60);
        let a = block(b"a");
        let b = block(b"b");
        exchange.has_block(a.clone()).await.unwrap();
        exchange.has_block(b.clone()).await.unwrap();
        let got = exchange.get_blocks(&[*a.cid(), *b.cid()]).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data(), b"a");
        assert_eq!(got[1].data(), b"b");
        exchange.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_rejects_new_requests() {
        let exchange = exchange_with_timeout(60);
        assert!(exchange.is_online());
        exchange.close().await;
        assert!(!exchange.is_online());
        let err = exchange.get_block(block(b"x").cid()).await.unwrap_err();
        assert!(matches!(err, BitswapError::ShuttingDown));
    }
}
