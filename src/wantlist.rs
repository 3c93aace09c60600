//! The local want list.
//!
//! A process-wide table of the CIDs this node is trying to obtain. Entries
//! are reference-counted by requesting session: the local node counts once
//! per `get_block` call, remote peers once per forwarded want. An entry is
//! created on the first want and stays in the queue even after the last
//! session lets go, retaining a received block as a small cache until
//! shutdown.
use crate::block::Block;
use crate::peer::PeerId;
use cid::Cid;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::sync::Arc;

/// Who is asking for a CID.
///
/// Remote sessions compare by peer identity; the local session is a
/// singleton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WantSession {
    Local,
    Remote(PeerId),
}

struct WantEntryState {
    /// Sessions that still care about this CID. One slot per `add`.
    sessions: Vec<WantSession>,
    block: Option<Block>,
    /// Set once providers have been asked; `pop` skips such entries.
    asked_network: bool,
    /// Provider lookups that came back empty.
    attempts: u32,
    /// Completions handed out by `subscribe`, fired when the block lands.
    waiters: Vec<oneshot::Sender<Block>>,
}

/// One CID the node wants, with everything known about the request so far.
pub struct WantEntry {
    cid: Cid,
    priority: i32,
    state: Mutex<WantEntryState>,
}

impl WantEntry {
    fn new(cid: Cid) -> Self {
        Self {
            cid,
            priority: 1,
            state: Mutex::new(WantEntryState {
                sessions: Vec::new(),
                block: None,
                asked_network: false,
                attempts: 0,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn block(&self) -> Option<Block> {
        self.state.lock().block.clone()
    }

    /// Attaches the received (or locally found) block and completes all
    /// waiters. A second call is a no-op: the first block wins.
    pub fn set_block(&self, block: Block) {
        let waiters = {
            let mut state = self.state.lock();
            if state.block.is_some() {
                return;
            }
            state.block = Some(block.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(block.clone());
        }
    }

    /// Returns a completion that fires when the block is available. If it
    /// already is, the completion fires immediately.
    pub fn subscribe(&self) -> oneshot::Receiver<Block> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        match &state.block {
            Some(block) => {
                let _ = tx.send(block.clone());
            }
            None => state.waiters.push(tx),
        }
        rx
    }

    pub fn asked_network(&self) -> bool {
        self.state.lock().asked_network
    }

    pub fn set_asked_network(&self) {
        self.state.lock().asked_network = true;
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    pub fn bump_attempts(&self) {
        self.state.lock().attempts += 1;
    }

    fn add_session(&self, session: WantSession) {
        self.state.lock().sessions.push(session);
    }

    /// Removes one occurrence of the session. Returns false if it was not
    /// registered.
    fn remove_session(&self, session: &WantSession) -> bool {
        let mut state = self.state.lock();
        match state.sessions.iter().position(|s| s == session) {
            Some(idx) => {
                state.sessions.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn has_local_session(&self) -> bool {
        self.state
            .lock()
            .sessions
            .iter()
            .any(|s| matches!(s, WantSession::Local))
    }

    pub fn remote_sessions(&self) -> Vec<PeerId> {
        self.state
            .lock()
            .sessions
            .iter()
            .filter_map(|s| match s {
                WantSession::Remote(peer) => Some(peer.clone()),
                WantSession::Local => None,
            })
            .collect()
    }

    /// An entry is eligible for the want-list worker while nobody has been
    /// asked for it and no block has arrived.
    fn is_pending(&self) -> bool {
        let state = self.state.lock();
        state.block.is_none() && !state.asked_network
    }
}

/// The process-wide want list. All mutation is serialized by one mutex;
/// entry handles are `Arc`s so workers mutate entries without holding it.
#[derive(Default)]
pub struct WantlistQueue {
    entries: Mutex<Vec<Arc<WantEntry>>>,
}

impl WantlistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session's interest in a CID. Creates the entry on first
    /// want, otherwise appends the session to the existing entry.
    pub fn add(&self, cid: &Cid, session: WantSession) -> Arc<WantEntry> {
        let mut entries = self.entries.lock();
        let entry = match entries.iter().find(|e| e.cid() == cid) {
            Some(entry) => entry.clone(),
            None => {
                let entry = Arc::new(WantEntry::new(*cid));
                entries.push(entry.clone());
                entry
            }
        };
        entry.add_session(session);
        entry
    }

    /// Removes a session's interest. The entry itself stays in the queue,
    /// retaining a received block until shutdown.
    pub fn remove(&self, cid: &Cid, session: &WantSession) -> bool {
        match self.find(cid) {
            Some(entry) => entry.remove_session(session),
            None => false,
        }
    }

    pub fn find(&self, cid: &Cid) -> Option<Arc<WantEntry>> {
        self.entries.lock().iter().find(|e| e.cid() == cid).cloned()
    }

    /// Returns the first entry that has neither a block nor been asked to
    /// the network. The entry is not removed; it remains poppable until the
    /// worker marks it asked.
    pub fn pop(&self) -> Option<Arc<WantEntry>> {
        self.entries.lock().iter().find(|e| e.is_pending()).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops everything; pending waiters observe their channel closing.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
