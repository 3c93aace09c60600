//! Per-peer request queues.
//!
//! For every peer we have interacted with there is exactly one
//! [`PeerRequest`] holding three lists: the CIDs they want from us, the
//! CIDs we want from them, and blocks that are ready to be sent. The
//! process-wide [`PeerRequestQueue`] serves requests round-robin: `pop`
//! returns the head if it has something to do and rotates it to the tail.
use crate::block::Block;
use crate::message::{BitswapMessage, WantlistEntry};
use crate::peer::Peer;
use cid::Cid;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// A CID on a peer queue, with the flags tracking what has been said about
/// it on the wire. `cancel_has_been_sent` implies `cancel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidEntry {
    pub cid: Cid,
    pub cancel: bool,
    pub cancel_has_been_sent: bool,
    pub request_has_been_sent: bool,
}

impl CidEntry {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            cancel: false,
            cancel_has_been_sent: false,
            request_has_been_sent: false,
        }
    }

    /// Whether this entry still needs to appear in an outgoing message:
    /// either a request not yet sent, or a cancel not yet sent.
    pub fn pending_send(&self) -> bool {
        if self.cancel {
            !self.cancel_has_been_sent
        } else {
            !self.request_has_been_sent
        }
    }
}

/// Adjusts a CID list from a decoded want-list entry: a cancel removes the
/// CID, a want appends it if absent, anything else leaves the list alone.
pub fn adjust_cid_queue(entries: &mut Vec<CidEntry>, cid: Cid, cancel: bool) {
    if let Some(idx) = entries.iter().position(|e| e.cid == cid) {
        if cancel {
            entries.remove(idx);
        }
        return;
    }
    if !cancel {
        entries.push(CidEntry::new(cid));
    }
}

struct PeerRequestState {
    /// What the peer has asked us for. Entries flip to `cancel` once
    /// satisfied and linger for the peer's lifetime.
    cids_they_want: Vec<CidEntry>,
    /// What we are asking the peer for.
    cids_we_want: Vec<CidEntry>,
    /// Blocks ready to go out with the next message.
    blocks_to_send: Vec<Block>,
}

/// Everything queued up for a single peer.
pub struct PeerRequest {
    peer: Arc<Peer>,
    state: Mutex<PeerRequestState>,
}

impl PeerRequest {
    fn new(peer: Arc<Peer>) -> Self {
        Self {
            peer,
            state: Mutex::new(PeerRequestState {
                cids_they_want: Vec::new(),
                cids_we_want: Vec::new(),
                blocks_to_send: Vec::new(),
            }),
        }
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Queues a want for this peer, unless one is already queued.
    pub fn want_from(&self, cid: &Cid) {
        let mut state = self.state.lock();
        if !state.cids_we_want.iter().any(|e| e.cid == *cid) {
            state.cids_we_want.push(CidEntry::new(*cid));
        }
    }

    /// Marks our want for `cid` as cancelled; the next message carries the
    /// cancel. A want that was never sent is dropped outright.
    pub fn cancel_want(&self, cid: &Cid) {
        let mut state = self.state.lock();
        if let Some(idx) = state.cids_we_want.iter().position(|e| e.cid == *cid) {
            if state.cids_we_want[idx].request_has_been_sent {
                state.cids_we_want[idx].cancel = true;
            } else {
                state.cids_we_want.remove(idx);
            }
        }
    }

    /// Applies one decoded want-list entry from this peer.
    pub fn adjust_they_want(&self, cid: Cid, cancel: bool) {
        adjust_cid_queue(&mut self.state.lock().cids_they_want, cid, cancel);
    }

    /// The CIDs the peer wants that we have not yet satisfied.
    pub fn they_want_pending(&self) -> Vec<Cid> {
        self.state
            .lock()
            .cids_they_want
            .iter()
            .filter(|e| !e.cancel)
            .map(|e| e.cid)
            .collect()
    }

    /// Queues a block for sending.
    pub fn add_block(&self, block: Block) {
        self.state.lock().blocks_to_send.push(block);
    }

    /// Queues a block satisfying one of the peer's wants, marking the want
    /// satisfied so it is not served twice.
    pub fn fulfill(&self, block: Block) {
        let mut state = self.state.lock();
        if let Some(entry) = state.cids_they_want.iter_mut().find(|e| e.cid == *block.cid()) {
            entry.cancel = true;
        }
        state.blocks_to_send.push(block);
    }

    /// Whether a message to this peer would carry anything.
    pub fn has_work(&self) -> bool {
        let state = self.state.lock();
        !state.blocks_to_send.is_empty()
            || state.cids_we_want.iter().any(|e| e.pending_send())
            || state.cids_they_want.iter().any(|e| !e.cancel)
    }

    /// Drains everything sendable into one message, flipping the sent flags
    /// as entries are serialized. Returns `None` when there is nothing to
    /// say.
    pub fn build_message(&self) -> Option<BitswapMessage> {
        let mut state = self.state.lock();
        let mut message = BitswapMessage::new();
        for block in state.blocks_to_send.drain(..) {
            message.add_payload_block(block);
        }
        for entry in state.cids_we_want.iter_mut().filter(|e| e.pending_send()) {
            if entry.cancel {
                message.add_wantlist_entry(WantlistEntry::cancel(entry.cid));
                entry.cancel_has_been_sent = true;
            } else {
                message.add_wantlist_entry(WantlistEntry::want(entry.cid));
                entry.request_has_been_sent = true;
            }
        }
        if message.is_empty() {
            None
        } else {
            Some(message)
        }
    }

    #[cfg(test)]
    pub(crate) fn we_want_entries(&self) -> Vec<CidEntry> {
        self.state.lock().cids_we_want.clone()
    }

    #[cfg(test)]
    pub(crate) fn they_want_entries(&self) -> Vec<CidEntry> {
        self.state.lock().cids_they_want.clone()
    }
}

/// The process-wide queue of peer requests, one per peer identity.
#[derive(Default)]
pub struct PeerRequestQueue {
    requests: Mutex<VecDeque<Arc<PeerRequest>>>,
}

impl PeerRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, peer: &Arc<Peer>) -> Option<Arc<PeerRequest>> {
        self.requests
            .lock()
            .iter()
            .find(|r| r.peer().id() == peer.id())
            .cloned()
    }

    /// Looks up the request for a peer, appending a fresh one at the tail on
    /// first interaction. No two requests share a peer identity.
    pub fn find_or_add(&self, peer: Arc<Peer>) -> Arc<PeerRequest> {
        let mut requests = self.requests.lock();
        if let Some(request) = requests.iter().find(|r| r.peer().id() == peer.id()) {
            return request.clone();
        }
        let request = Arc::new(PeerRequest::new(peer));
        requests.push_back(request.clone());
        request
    }

    /// Pushes a block onto a peer's send list.
    pub fn add_block_to_send(&self, peer: Arc<Peer>, block: Block) {
        self.find_or_add(peer).add_block(block);
    }

    /// Returns the head request if it has something to do, rotating it to
    /// the tail (round-robin). A head with nothing to do stays put.
    ///
    /// "Something to do" includes bytes waiting on the peer's session; a
    /// session whose peek reports an error marks the peer disconnected and
    /// the request is skipped.
    pub fn pop(&self) -> Option<Arc<PeerRequest>> {
        let mut requests = self.requests.lock();
        let head = requests.front()?.clone();
        let mut busy = head.has_work();
        if !busy && head.peer().is_connected() {
            if let Some(session) = head.peer().session() {
                let ready = session.peek();
                if ready < 0 {
                    debug!("peek failed for {}, marking not connected", head.peer().id());
                    head.peer().set_disconnected();
                    return None;
                }
                busy = ready > 0;
            }
        }
        if !busy {
            return None;
        }
        if requests.len() > 1 {
            let rotated = requests.pop_front()?;
            requests.push_back(rotated);
        }
        Some(head)
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Marks our want for this CID cancelled on every peer queue.
    pub fn cancel_want_everywhere(&self, cid: &Cid) {
        for request in self.requests.lock().iter() {
            request.cancel_want(cid);
        }
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }
}
