//! Per-peer traffic statistics.
use crate::message::BitswapMessage;
use crate::peer::PeerId;
use fnv::FnvHashMap;
use parking_lot::Mutex;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Counters {
    /// blocks sent or received
    pub blocks: u64,
    /// block bytes sent or received
    pub block_bytes: u64,
    /// want requests
    pub wants: u64,
    /// cancel commands
    pub cancels: u64,
}

impl Counters {
    fn update(&mut self, message: &BitswapMessage) {
        self.blocks += message.payload.len() as u64;
        self.block_bytes += message.payload.iter().map(|b| b.len()).sum::<usize>() as u64;
        if let Some(wantlist) = &message.wantlist {
            for entry in &wantlist.entries {
                if entry.cancel {
                    self.cancels += 1;
                } else {
                    self.wants += 1;
                }
            }
        }
    }
}

/// Transaction statistics for one peer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub sent: Counters,
    pub received: Counters,
}

/// Statistics for all peers the exchange has talked to.
#[derive(Default)]
pub struct ExchangeStats {
    peers: Mutex<FnvHashMap<PeerId, PeerStats>>,
}

impl ExchangeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, peer: &PeerId, message: &BitswapMessage) {
        self.peers
            .lock()
            .entry(peer.clone())
            .or_default()
            .sent
            .update(message);
    }

    pub fn record_received(&self, peer: &PeerId, message: &BitswapMessage) {
        self.peers
            .lock()
            .entry(peer.clone())
            .or_default()
            .received
            .update(message);
    }

    pub fn peer(&self, peer: &PeerId) -> Option<PeerStats> {
        self.peers.lock().get(peer).cloned()
    }
}
