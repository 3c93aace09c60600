//! The routing boundary.
//!
//! Asynchronous provider discovery and peer liveness. The DHT itself is out
//! of scope; [`MemoryRouting`] answers from a registry that test swarms (or
//! a single process hosting several nodes) share, which is enough for
//! transitive discovery: every node that comes to hold a block announces
//! itself, and any other node can find it without having met it.
use crate::peer::PeerId;
use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// How to reach a peer: its identity plus a dialable address, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContact {
    pub peer_id: PeerId,
    pub addr: Option<SocketAddr>,
}

#[async_trait]
pub trait Routing: Send + Sync + 'static {
    /// Who claims to hold this CID? Never includes the local node.
    async fn find_providers(&self, cid: &Cid) -> Result<Vec<PeerContact>>;

    /// Announce the local node as a provider of this CID.
    async fn provide(&self, cid: &Cid) -> Result<()>;

    /// Is this peer known to be alive?
    async fn ping(&self, peer: &PeerId) -> bool;

    /// Join the routing overlay: make the local node discoverable.
    async fn bootstrap(&self) -> Result<()>;
}

#[derive(Default)]
struct RegistryState {
    providers: FnvHashMap<Cid, Vec<PeerContact>>,
    peers: Vec<PeerContact>,
}

/// Shared provider registry standing in for the DHT.
#[derive(Default)]
pub struct RoutingRegistry {
    state: Mutex<RegistryState>,
}

impl RoutingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add_provider(&self, cid: &Cid, contact: PeerContact) {
        let mut state = self.state.lock();
        let providers = state.providers.entry(*cid).or_default();
        match providers.iter_mut().find(|c| c.peer_id == contact.peer_id) {
            Some(existing) => *existing = contact,
            None => providers.push(contact),
        }
    }

    fn providers(&self, cid: &Cid) -> Vec<PeerContact> {
        self.state.lock().providers.get(cid).cloned().unwrap_or_default()
    }

    fn add_peer(&self, contact: PeerContact) {
        let mut state = self.state.lock();
        match state.peers.iter_mut().find(|c| c.peer_id == contact.peer_id) {
            Some(existing) => *existing = contact,
            None => state.peers.push(contact),
        }
    }

    fn knows(&self, peer: &PeerId) -> bool {
        self.state.lock().peers.iter().any(|c| c.peer_id == *peer)
    }
}

/// Routing handle of one node, bound to a shared registry.
pub struct MemoryRouting {
    registry: Arc<RoutingRegistry>,
    local: PeerContact,
}

impl MemoryRouting {
    pub fn new(registry: Arc<RoutingRegistry>, local: PeerContact) -> Self {
        Self { registry, local }
    }

    pub fn local_contact(&self) -> &PeerContact {
        &self.local
    }
}

#[async_trait]
impl Routing for MemoryRouting {
    async fn find_providers(&self, cid: &Cid) -> Result<Vec<PeerContact>> {
        let providers: Vec<PeerContact> = self
            .registry
            .providers(cid)
            .into_iter()
            .filter(|c| c.peer_id != self.local.peer_id)
            .collect();
        debug!("found {} providers for {}", providers.len(), cid);
        Ok(providers)
    }

    async fn provide(&self, cid: &Cid) -> Result<()> {
        self.registry.add_provider(cid, self.local.clone());
        Ok(())
    }

    async fn ping(&self, peer: &PeerId) -> bool {
        self.registry.knows(peer)
    }

    async fn bootstrap(&self) -> Result<()> {
        self.registry.add_peer(self.local.clone());
        Ok(())
    }
}
