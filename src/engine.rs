//! The bitswap engine.
//!
//! Two long-running workers drive the exchange:
//!
//! * the **want-list worker** pops entries nobody has been asked for yet,
//!   looks up providers and queues want requests on their peer queues;
//! * the **peer worker** sweeps the peerstore, reads whatever bytes are
//!   ready on each connected session, and flushes every peer queue that has
//!   something to send.
//!
//! Both poll one shared cancellation token and exit within a read timeout
//! of it being cancelled.
use crate::block::Block;
use crate::config::NodeConfig;
use crate::network::{self, ProtocolHandler};
use crate::peer::{ConnectionState, Peer, PeerId, Peerstore};
use crate::peer_queue::{PeerRequest, PeerRequestQueue};
use crate::routing::Routing;
use crate::stats::ExchangeStats;
use crate::store::Blockstore;
use crate::transport::Hello;
use crate::wantlist::{WantEntry, WantlistQueue};
use anyhow::Result;
use cid::Cid;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Back-off of the want-list worker when there is nothing to ask.
const WANTLIST_IDLE: Duration = Duration::from_secs(2);
/// Back-off of the peer worker after a sweep in which nothing happened.
const PEER_IDLE: Duration = Duration::from_secs(1);
/// Budget for draining one inbound frame once peek saw bytes.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the workers and the network layer share. The context never
/// references the façade or the node, so ownership stays acyclic.
pub struct BitswapContext {
    pub local_id: PeerId,
    pub listen_addr: SocketAddr,
    pub config: NodeConfig,
    pub wantlist: WantlistQueue,
    pub peer_requests: PeerRequestQueue,
    pub peerstore: Arc<Peerstore>,
    pub blockstore: Arc<dyn Blockstore>,
    pub routing: Arc<dyn Routing>,
    pub stats: ExchangeStats,
    /// The one cancellation token every long-running worker of the node
    /// polls. Cancelling it is the only way the exchange shuts down.
    pub shutdown: CancellationToken,
}

impl BitswapContext {
    pub fn new(
        local_id: PeerId,
        listen_addr: SocketAddr,
        config: NodeConfig,
        peerstore: Arc<Peerstore>,
        blockstore: Arc<dyn Blockstore>,
        routing: Arc<dyn Routing>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            listen_addr,
            config,
            wantlist: WantlistQueue::new(),
            peer_requests: PeerRequestQueue::new(),
            peerstore,
            blockstore,
            routing,
            stats: ExchangeStats::new(),
            shutdown,
        })
    }

    /// The hello frame this node opens sessions with.
    pub fn hello(&self) -> Hello {
        Hello {
            peer_id: self.local_id.clone(),
            listen_addr: self.listen_addr,
        }
    }

    /// A block has arrived (from a peer, or from the local user). Store it,
    /// announce it, and complete any want-list entry waiting for it.
    pub async fn receive_block(&self, block: Block) -> Result<()> {
        self.blockstore.put(block.clone()).await?;
        self.routing.provide(block.cid()).await?;
        if let Some(entry) = self.wantlist.find(block.cid()) {
            entry.set_block(block);
        }
        Ok(())
    }

    /// Withdraws our outstanding requests for a CID on every peer queue;
    /// the next message to each peer carries the cancel.
    pub fn cancel_want(&self, cid: &Cid) {
        self.peer_requests.cancel_want_everywhere(cid);
    }
}

/// Handle to the two running workers.
pub struct BitswapEngine {
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BitswapEngine {
    /// Spawns the want-list worker and the peer worker. Both poll the
    /// context's shutdown token.
    pub fn start(ctx: Arc<BitswapContext>, handlers: Arc<Vec<Arc<dyn ProtocolHandler>>>) -> Self {
        let shutdown = ctx.shutdown.clone();
        let handles = vec![
            tokio::task::spawn(wantlist_worker(ctx.clone(), shutdown.clone())),
            tokio::task::spawn(peer_worker(ctx, handlers, shutdown.clone())),
        ];
        debug!("bitswap engine started");
        Self {
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Cancels the shared token and joins both workers.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!("engine worker panicked: {}", err);
            }
        }
    }
}

/// Sleeps, or returns early when the token fires.
async fn idle(token: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Drives the queue of local requests.
async fn wantlist_worker(ctx: Arc<BitswapContext>, token: CancellationToken) {
    while !token.is_cancelled() {
        match ctx.wantlist.pop() {
            Some(entry) => {
                if !process_want_entry(&ctx, &entry).await {
                    // entry could not be advanced (typically: no providers
                    // yet); retry on the next sweep
                    idle(&token, WANTLIST_IDLE).await;
                }
            }
            None => idle(&token, WANTLIST_IDLE).await,
        }
    }
    debug!("want-list worker exited");
}

/// Processes one want-list entry. Returns true if the entry was advanced:
/// satisfied locally, or asked to the network.
async fn process_want_entry(ctx: &Arc<BitswapContext>, entry: &Arc<WantEntry>) -> bool {
    let local_request = entry.has_local_session();
    let mut have_local = false;
    match ctx.blockstore.get(entry.cid()).await {
        Ok(Some(block)) => {
            entry.set_block(block);
            have_local = true;
        }
        Ok(None) => {}
        Err(err) => debug!("blockstore lookup of {} failed: {:#}", entry.cid(), err),
    }
    if !local_request && !have_local {
        return false;
    }
    let mut advanced = have_local;
    if local_request && !have_local {
        match ctx.routing.find_providers(entry.cid()).await {
            Ok(providers) if !providers.is_empty() => {
                for contact in providers {
                    let peer = ctx.peerstore.get_or_add(&contact.peer_id);
                    if let Some(addr) = contact.addr {
                        peer.set_addr(addr);
                    }
                    let request = ctx.peer_requests.find_or_add(peer);
                    request.want_from(entry.cid());
                    // send right away if the peer is reachable
                    process_peer_request(ctx, &request).await;
                }
                entry.set_asked_network();
                advanced = true;
            }
            Ok(_) => {
                entry.bump_attempts();
            }
            Err(err) => {
                // treated as "no providers found"; stays pending for retry
                debug!("provider lookup of {} failed: {:#}", entry.cid(), err);
                entry.bump_attempts();
            }
        }
    }
    if let Some(block) = entry.block() {
        for peer_id in entry.remote_sessions() {
            if let Some(peer) = ctx.peerstore.find(&peer_id) {
                ctx.peer_requests.add_block_to_send(peer, block.clone());
            }
        }
    }
    advanced
}

/// Sweeps the peerstore: drains ready bytes from connected sessions and
/// flushes every peer queue with something to say. Sleeps only after a full
/// sweep in which no peer had any work.
async fn peer_worker(
    ctx: Arc<BitswapContext>,
    handlers: Arc<Vec<Arc<dyn ProtocolHandler>>>,
    token: CancellationToken,
) {
    'sweep: loop {
        if token.is_cancelled() {
            break;
        }
        let mut did_work = false;
        for peer in ctx.peerstore.peers() {
            if token.is_cancelled() {
                break 'sweep;
            }
            if peer.is_local() {
                continue;
            }
            if peer.connection_state() == ConnectionState::Connected {
                if read_one_frame(&handlers, &peer).await {
                    did_work = true;
                }
            }
            if let Some(request) = ctx.peer_requests.find(&peer) {
                if process_peer_request(&ctx, &request).await {
                    did_work = true;
                }
            }
        }
        if !did_work {
            idle(&token, PEER_IDLE).await;
        }
    }
    debug!("peer worker exited");
}

/// Checks one connected peer for ready bytes and dispatches at most one
/// frame. Any peek or read failure marks the peer disconnected.
async fn read_one_frame(handlers: &Arc<Vec<Arc<dyn ProtocolHandler>>>, peer: &Arc<Peer>) -> bool {
    let session = match peer.session() {
        Some(session) => session,
        None => {
            // connected without a stream is an illegal state
            peer.set_disconnected();
            return false;
        }
    };
    let ready = session.peek();
    if ready < 0 {
        debug!("peek reported an error for {}, marking not connected", peer.id());
        peer.set_disconnected();
        return false;
    }
    if ready == 0 {
        return false;
    }
    match session.read_frame(READ_TIMEOUT).await {
        Ok(frame) => {
            dispatch(handlers, peer, &frame).await;
            true
        }
        Err(err) => {
            debug!("read from {} failed ({}), marking not connected", peer.id(), err);
            peer.set_disconnected();
            false
        }
    }
}

/// Routes one inbound frame to the protocol that claims it.
async fn dispatch(handlers: &[Arc<dyn ProtocolHandler>], peer: &Arc<Peer>, frame: &[u8]) {
    for handler in handlers {
        if handler.can_handle(frame) {
            if let Err(err) = handler.handle_message(peer, frame).await {
                debug!("protocol handler failed for {}: {:#}", peer.id(), err);
            }
            return;
        }
    }
    debug!("no protocol handler for frame from {}", peer.id());
}

/// Flushes one peer's queue: satisfies what they want from the local
/// blockstore, then sends a message carrying blocks, wants and cancels.
/// Returns true if a message went out.
pub(crate) async fn process_peer_request(ctx: &Arc<BitswapContext>, request: &Arc<PeerRequest>) -> bool {
    let peer = request.peer();
    if peer.is_local() {
        return false;
    }
    for cid in request.they_want_pending() {
        match ctx.blockstore.get(&cid).await {
            Ok(Some(block)) => request.fulfill(block),
            Ok(None) => {}
            Err(err) => debug!("blockstore lookup of {} failed: {:#}", cid, err),
        }
    }
    let message = match request.build_message() {
        Some(message) => message,
        None => return false,
    };
    match network::send_message(ctx, peer, &message).await {
        Ok(()) => true,
        Err(err) => {
            debug!("sending to {} failed: {}", peer.id(), err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::RAW;
    use crate::peer::NodeIdentity;
    use crate::routing::{MemoryRouting, PeerContact, RoutingRegistry};
    use crate::store::MemoryBlockstore;
    use crate::wantlist::WantSession;
    use multihash::{Code, MultihashDigest};

    fn cid(data: &[u8]) -> Cid {
        Cid::new_v1(RAW, Code::Sha2_256.digest(data))
    }

    fn block(data: &[u8]) -> Block {
        Block::new(data.to_vec(), cid(data))
    }

    fn context(registry: Arc<RoutingRegistry>) -> Arc<BitswapContext> {
        let identity = NodeIdentity::generate();
        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let local = PeerContact {
            peer_id: identity.peer_id().clone(),
            addr: Some(listen_addr),
        };
        BitswapContext::new(
            identity.peer_id().clone(),
            listen_addr,
            NodeConfig::test(),
            Arc::new(Peerstore::new(identity.peer_id().clone())),
            Arc::new(MemoryBlockstore::new()),
            Arc::new(MemoryRouting::new(registry, local)),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn local_hit_satisfies_the_entry() {
        let ctx = context(RoutingRegistry::new());
        let b = block(b"hello\n");
        ctx.blockstore.put(b.clone()).await.unwrap();
        let entry = ctx.wantlist.add(b.cid(), WantSession::Local);
        assert!(process_want_entry(&ctx, &entry).await);
        assert_eq!(entry.block().unwrap().data(), b"hello\n");
        // satisfied entries are no longer poppable
        assert!(ctx.wantlist.pop().is_none());
    }

    #[tokio::test]
    async fn no_providers_leaves_the_entry_pending() {
        let ctx = context(RoutingRegistry::new());
        let entry = ctx.wantlist.add(&cid(b"missing"), WantSession::Local);
        assert!(!process_want_entry(&ctx, &entry).await);
        assert!(!entry.asked_network());
        assert_eq!(entry.attempts(), 1);
        // still poppable for the next sweep
        assert!(ctx.wantlist.pop().is_some());
    }

    #[tokio::test]
    async fn providers_get_a_want_queued() {
        let registry = RoutingRegistry::new();
        let ctx = context(registry.clone());
        let provider_identity = NodeIdentity::generate();
        let provider = MemoryRouting::new(
            registry,
            PeerContact {
                peer_id: provider_identity.peer_id().clone(),
                // nothing listens here; the send attempt is absorbed
                addr: Some("127.0.0.1:1".parse().unwrap()),
            },
        );
        let c = cid(b"remote block");
        provider.provide(&c).await.unwrap();
        let entry = ctx.wantlist.add(&c, WantSession::Local);
        assert!(process_want_entry(&ctx, &entry).await);
        assert!(entry.asked_network());
        // asked entries are off the worker's plate
        assert!(ctx.wantlist.pop().is_none());
        let peer = ctx.peerstore.find(provider_identity.peer_id()).unwrap();
        let request = ctx.peer_requests.find(&peer).unwrap();
        let wants = request.we_want_entries();
        assert_eq!(wants.len(), 1);
        assert_eq!(wants[0].cid, c);
    }

    #[tokio::test]
    async fn remote_session_gets_the_block_queued() {
        let ctx = context(RoutingRegistry::new());
        let remote = NodeIdentity::generate();
        let peer = ctx.peerstore.get_or_add(remote.peer_id());
        let b = block(b"for the peer");
        ctx.blockstore.put(b.clone()).await.unwrap();
        let entry = ctx.wantlist.add(b.cid(), WantSession::Remote(remote.peer_id().clone()));
        assert!(process_want_entry(&ctx, &entry).await);
        let request = ctx.peer_requests.find(&peer).unwrap();
        let message = request.build_message().unwrap();
        assert_eq!(message.payload.len(), 1);
        assert_eq!(message.payload[0].cid(), b.cid());
    }

    #[tokio::test]
    async fn receive_block_announces_and_completes() {
        let registry = RoutingRegistry::new();
        let ctx = context(registry.clone());
        let other = MemoryRouting::new(
            registry,
            PeerContact {
                peer_id: NodeIdentity::generate().peer_id().clone(),
                addr: None,
            },
        );
        let b = block(b"announced");
        let entry = ctx.wantlist.add(b.cid(), WantSession::Local);
        let mut rx = entry.subscribe();
        ctx.receive_block(b.clone()).await.unwrap();
        assert!(rx.try_recv().unwrap().is_some());
        // the other node can now discover us as a provider
        let providers = other.find_providers(b.cid()).await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer_id, ctx.local_id);
    }

    #[tokio::test]
    async fn engine_stops_within_the_grace_period() {
        let ctx = context(RoutingRegistry::new());
        let handlers: Arc<Vec<Arc<dyn ProtocolHandler>>> = Arc::new(Vec::new());
        let engine = BitswapEngine::start(ctx, handlers);
        let started = std::time::Instant::now();
        engine.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
