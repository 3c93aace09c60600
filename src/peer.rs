//! Peers and the peerstore.
//!
//! A peer is a remote node we know about: its identity, the address it can
//! be dialled on, its connection state and, while connected, the session
//! carrying its traffic. The peerstore is the node's catalogue of peers,
//! iterated head-to-tail by the engine's peer worker.
use crate::transport::Session;
use multibase::Base;
use multihash::{Code, MultihashDigest};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// A peer identity: the multihash of the peer's identity key, compared
/// bytewise.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        multibase::encode(Base::Base58Btc, &self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

/// The local node's identity. Key management is out of scope here, so the
/// identity is simply 32 random bytes; the peer id is their multihash.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    peer_id: PeerId,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed);
        let hash = Code::Sha2_256.digest(&seed);
        Self {
            peer_id: PeerId::from_bytes(hash.to_bytes()),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

/// Connection state of a peer. `Connected` is only legal while a session is
/// attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connected,
}

struct PeerState {
    connection: ConnectionState,
    addr: Option<SocketAddr>,
    session: Option<Arc<Session>>,
}

/// A known peer.
pub struct Peer {
    id: PeerId,
    /// The local node's own peerstore entry; never dialled.
    is_local: bool,
    state: Mutex<PeerState>,
}

impl Peer {
    fn new(id: PeerId, is_local: bool) -> Self {
        Self {
            id,
            is_local,
            state: Mutex::new(PeerState {
                connection: ConnectionState::NotConnected,
                addr: None,
                session: None,
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.state.lock().addr
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        self.state.lock().addr = Some(addr);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().session.clone()
    }

    /// Attaches a live session and marks the peer connected.
    pub fn set_connected(&self, session: Arc<Session>) {
        let mut state = self.state.lock();
        state.session = Some(session);
        state.connection = ConnectionState::Connected;
    }

    /// Drops the session and marks the peer disconnected. Called on any
    /// read, write or peek error.
    pub fn set_disconnected(&self) {
        let mut state = self.state.lock();
        state.session = None;
        state.connection = ConnectionState::NotConnected;
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("is_local", &self.is_local)
            .field("connection", &self.connection_state())
            .field("addr", &self.addr())
            .finish()
    }
}

/// The node's catalogue of known peers.
///
/// Iteration hands out a snapshot, so workers never hold the store lock
/// while doing I/O.
pub struct Peerstore {
    peers: RwLock<Vec<Arc<Peer>>>,
}

impl Peerstore {
    /// Creates a peerstore seeded with the local node's own entry.
    pub fn new(local_id: PeerId) -> Self {
        let local = Arc::new(Peer::new(local_id, true));
        Self {
            peers: RwLock::new(vec![local]),
        }
    }

    pub fn find(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().iter().find(|p| p.id() == id).cloned()
    }

    /// Looks a peer up by identity, creating it if this is the first
    /// interaction. Peer identities are unique within the store.
    pub fn get_or_add(&self, id: &PeerId) -> Arc<Peer> {
        if let Some(peer) = self.find(id) {
            return peer;
        }
        let mut peers = self.peers.write();
        // re-check under the write lock
        if let Some(peer) = peers.iter().find(|p| p.id() == id) {
            return peer.clone();
        }
        let peer = Arc::new(Peer::new(id.clone(), false));
        peers.push(peer.clone());
        peer
    }

    /// Snapshot of all peers in insertion order.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
