//! The node glue around the exchange.
//!
//! An [`IpfsNode`] binds a listener, answers inbound sessions with the
//! hello exchange, dials its bootstrap peers, and exposes the exchange
//! façade. The connection-acceptance loop is deliberately thin: one
//! short-lived worker per inbound connection (bounded by a semaphore)
//! performs the handshake, registers the session in the peerstore and
//! exits — everything after that is driven by the engine's peer worker.
use crate::config::NodeConfig;
use crate::engine::BitswapContext;
use crate::exchange::{Bitswap, BitswapError};
use crate::network::{BitswapProtocolHandler, ProtocolHandler};
use crate::peer::{NodeIdentity, PeerId, Peerstore};
use crate::routing::{MemoryRouting, PeerContact, Routing, RoutingRegistry};
use crate::stats::PeerStats;
use crate::store::MemoryBlockstore;
use crate::transport::{Hello, Session};
use crate::Block;
use anyhow::{Context, Result};
use cid::Cid;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Budget for the hello exchange on a fresh connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A running exchange node.
pub struct IpfsNode {
    identity: NodeIdentity,
    config: NodeConfig,
    listen_addr: SocketAddr,
    peerstore: Arc<Peerstore>,
    routing: Arc<dyn Routing>,
    exchange: Bitswap,
    handlers: Arc<Vec<Arc<dyn ProtocolHandler>>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IpfsNode {
    /// Starts a node: binds the listener, joins the routing overlay, spins
    /// up the exchange and dials the configured bootstrap peers.
    pub async fn new(config: NodeConfig, registry: Arc<RoutingRegistry>) -> Result<Self> {
        let identity = NodeIdentity::generate();
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("binding {}", config.listen))?;
        let listen_addr = listener.local_addr()?;
        info!("node {} listening on {}", identity.peer_id(), listen_addr);

        let routing: Arc<dyn Routing> = Arc::new(MemoryRouting::new(
            registry,
            PeerContact {
                peer_id: identity.peer_id().clone(),
                addr: Some(listen_addr),
            },
        ));
        routing.bootstrap().await?;

        let peerstore = Arc::new(Peerstore::new(identity.peer_id().clone()));
        let shutdown = CancellationToken::new();
        let ctx = BitswapContext::new(
            identity.peer_id().clone(),
            listen_addr,
            config.clone(),
            peerstore.clone(),
            Arc::new(MemoryBlockstore::new()),
            routing.clone(),
            shutdown.clone(),
        );
        let handlers: Arc<Vec<Arc<dyn ProtocolHandler>>> =
            Arc::new(vec![Arc::new(BitswapProtocolHandler::new(ctx.clone()))]);
        let exchange = Bitswap::start(ctx.clone(), handlers.clone());

        let acceptor = tokio::task::spawn(accept_loop(
            listener,
            ctx,
            shutdown.clone(),
            config.max_inbound_workers,
        ));

        let node = Self {
            identity,
            config,
            listen_addr,
            peerstore,
            routing,
            exchange,
            handlers,
            shutdown,
            handles: Mutex::new(vec![acceptor]),
        };
        for addr in node.config.bootstrap.clone() {
            if let Err(err) = node.connect(addr).await {
                warn!("bootstrap dial of {} failed: {:#}", addr, err);
            }
        }
        Ok(node)
    }

    /// A node on an ephemeral localhost port, for tests.
    pub async fn test(registry: Arc<RoutingRegistry>) -> Result<Self> {
        Self::new(NodeConfig::test(), registry).await
    }

    pub fn local_peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn exchange(&self) -> &Bitswap {
        &self.exchange
    }

    /// Identities of all known remote peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peerstore
            .peers()
            .into_iter()
            .filter(|p| !p.is_local())
            .map(|p| p.id().clone())
            .collect()
    }

    /// Dials a peer by address and performs the hello exchange. Returns the
    /// peer's identity.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId> {
        let ctx = self.exchange.context();
        let session = Arc::new(Session::dial(addr, self.config.connect_timeout()).await?);
        session.write_frame(&ctx.hello().to_wire_bytes()).await?;
        let reply = session.read_frame(HANDSHAKE_TIMEOUT).await?;
        let hello = Hello::from_wire_bytes(&reply).context("bad hello reply")?;
        let peer = self.peerstore.get_or_add(&hello.peer_id);
        peer.set_addr(hello.listen_addr);
        peer.set_connected(session);
        debug!("connected to {} at {}", hello.peer_id, addr);
        Ok(hello.peer_id)
    }

    pub async fn get_block(&self, cid: &Cid) -> Result<Block, BitswapError> {
        self.exchange.get_block(cid).await
    }

    pub async fn get_blocks(&self, cids: &[Cid]) -> Result<Vec<Block>, BitswapError> {
        self.exchange.get_blocks(cids).await
    }

    /// Inserts a locally produced block: into the blockstore, announced to
    /// routing, and to anyone waiting on it.
    pub async fn insert(&self, block: Block) -> Result<(), BitswapError> {
        self.exchange.has_block(block).await
    }

    pub async fn ping(&self, peer: &PeerId) -> bool {
        self.routing.ping(peer).await
    }

    pub fn peer_stats(&self, peer: &PeerId) -> Option<PeerStats> {
        self.exchange.context().stats.peer(peer)
    }

    /// Stops the acceptor, the engine and every protocol handler. Safe to
    /// call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        self.exchange.close().await;
        for handler in self.handlers.iter() {
            handler.shutdown();
        }
        info!("node {} closed", self.identity.peer_id());
    }
}

/// Accepts inbound connections until shutdown. Each accepted connection
/// gets a short-lived worker that performs the hello exchange and hands the
/// session to the exchange; connections beyond the worker cap are refused.
async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<BitswapContext>,
    token: CancellationToken,
    max_workers: usize,
) {
    let limit = Arc::new(Semaphore::new(max_workers));
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {}", err);
                continue;
            }
        };
        let permit = match limit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("refusing session from {}: inbound worker cap reached", addr);
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::task::spawn(async move {
            let _permit = permit;
            if let Err(err) = handle_inbound(&ctx, stream).await {
                debug!("inbound session from {} failed: {:#}", addr, err);
            }
        });
    }
    debug!("acceptor exited");
}

/// The per-connection worker: hello in, hello out, register, done.
async fn handle_inbound(ctx: &Arc<BitswapContext>, stream: TcpStream) -> Result<()> {
    let session = Arc::new(Session::from_stream(stream)?);
    let frame = session.read_frame(HANDSHAKE_TIMEOUT).await?;
    let hello = Hello::from_wire_bytes(&frame).context("bad hello")?;
    session.write_frame(&ctx.hello().to_wire_bytes()).await?;
    let peer = ctx.peerstore.get_or_add(&hello.peer_id);
    peer.set_addr(hello.listen_addr);
    peer.set_connected(session);
    debug!("session established with {}", hello.peer_id);
    Ok(())
}
