//! # ipfs-exchange
//!
//! The block-exchange subsystem of a content-addressed p2p file system node.
//! Peers cooperate to distribute immutable, hash-addressed blocks: a node
//! requests blocks it lacks by CID, serves blocks it holds to peers that ask
//! for them, and keeps long-lived connections over which bitswap messages
//! flow continuously.
//!
//! ## Architecture
//!
//! The heart of the crate is the bitswap engine: two coupled queues and the
//! pair of background workers that drive them.
//!
//! * The [`wantlist::WantlistQueue`] holds the CIDs this node is trying to
//!   obtain, reference-counted by requesting session (local callers and
//!   remote peers).
//! * The [`peer_queue::PeerRequestQueue`] holds one request per peer: the
//!   CIDs they want from us, the CIDs we want from them, and the blocks that
//!   are ready to go out.
//! * The *want-list worker* pops unasked entries, asks [`routing::Routing`]
//!   for providers and queues want requests on the providers' peer queues.
//! * The *peer worker* sweeps the peerstore, drains bytes that are ready on
//!   each session, and flushes every peer queue that has something to say.
//!
//! Around the engine sit the collaborators: a [`store::Blockstore`], a
//! [`routing::Routing`] implementation, and the framed
//! [`transport::Session`] byte stream. [`exchange::Bitswap`] is the façade
//! the rest of the node talks to, and [`node::IpfsNode`] is the thin glue
//! that binds a listener, performs the hello handshake and hands accepted
//! sessions to the exchange.
//!
//! All workers share a single cancellation token; `close()` cancels it and
//! joins them.
pub mod block;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod message;
pub mod network;
pub mod node;
pub mod peer;
pub mod peer_queue;
pub mod routing;
pub mod stats;
pub mod store;
pub mod transport;
pub mod wantlist;

pub use block::Block;
pub use config::NodeConfig;
pub use exchange::{Bitswap, BitswapError};
pub use message::{BitswapMessage, DecodeError};
pub use node::IpfsNode;
pub use peer::PeerId;
pub use routing::{MemoryRouting, PeerContact, Routing, RoutingRegistry};
pub use store::{Blockstore, MemoryBlockstore};

pub mod codecs {
    // https://github.com/multiformats/multicodec/blob/master/table.csv
    pub const RAW: u64 = 0x55;
    pub const DAG_PROTOBUF: u64 = 0x70;
    pub const DAG_CBOR: u64 = 0x71;
}
