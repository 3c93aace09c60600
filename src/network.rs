//! Network send/receive for the exchange.
//!
//! `send_message` frames a message with its protocol header and writes it to
//! the peer's session, dialling first if necessary. `handle_message` is the
//! inbound mirror: strip the header, decode, store delivered blocks, and
//! fold the sender's want list into its peer request.
//!
//! All failures here are local: a transport error marks the peer
//! disconnected and drops the current message, a protocol error drops the
//! message, and neither is allowed to take the exchange down.
use crate::engine::BitswapContext;
use crate::message::{BitswapMessage, DecodeError, PROTOCOL_PREFIX};
use crate::peer::Peer;
use crate::transport::{Hello, Session};
use anyhow::Result;
use async_trait::async_trait;
use derive_more::{Display, Error, From};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, From, Display, Error)]
pub enum NetworkError {
    #[display(fmt = "peer is not connected")]
    NotConnected,
    #[display(fmt = "transport error: {}", _0)]
    Transport(std::io::Error),
    #[display(fmt = "short write")]
    ShortWrite,
    #[display(fmt = "hello handshake failed")]
    Handshake,
    #[display(fmt = "failed to decode message: {}", _0)]
    Decode(DecodeError),
}

/// Returns the peer's live session, dialling and performing the hello
/// exchange within the configured budget if there is none.
pub async fn ensure_connected(ctx: &BitswapContext, peer: &Arc<Peer>) -> Result<Arc<Session>, NetworkError> {
    if peer.is_local() {
        return Err(NetworkError::NotConnected);
    }
    if peer.is_connected() {
        if let Some(session) = peer.session() {
            return Ok(session);
        }
        // connected without a stream is an illegal state
        peer.set_disconnected();
    }
    let addr = peer.addr().ok_or(NetworkError::NotConnected)?;
    let budget = ctx.config.connect_timeout();
    // keep the dial abortable so workers stop promptly on shutdown
    let session = tokio::select! {
        _ = ctx.shutdown.cancelled() => return Err(NetworkError::NotConnected),
        session = Session::dial(addr, budget) => Arc::new(session?),
    };
    session.write_frame(&ctx.hello().to_wire_bytes()).await?;
    let reply = session.read_frame(budget).await?;
    let hello = Hello::from_wire_bytes(&reply)?;
    if hello.peer_id != *peer.id() {
        warn!("dialled {} but {} answered", peer.id(), hello.peer_id);
        return Err(NetworkError::Handshake);
    }
    peer.set_connected(session.clone());
    debug!("connected to {} at {}", peer.id(), addr);
    Ok(session)
}

/// Sends one message to a peer, connecting first if necessary.
pub async fn send_message(
    ctx: &BitswapContext,
    peer: &Arc<Peer>,
    message: &BitswapMessage,
) -> Result<(), NetworkError> {
    let session = ensure_connected(ctx, peer).await?;
    debug!("> {} {:?}", peer.id(), message);
    match session.write_frame(&message.to_wire_bytes()).await {
        Ok(0) => {
            peer.set_disconnected();
            Err(NetworkError::ShortWrite)
        }
        Ok(_) => {
            ctx.stats.record_sent(peer.id(), message);
            Ok(())
        }
        Err(err) => {
            peer.set_disconnected();
            Err(err.into())
        }
    }
}

/// Handles one raw inbound bitswap frame from a peer.
///
/// Delivered blocks go through `receive_block` (into the blockstore, and to
/// any matching want-list entry); want-list entries adjust the sender's
/// peer request. A frame with any undecodable CID fails decode as a whole,
/// so a poisoned message is discarded before any of it is applied.
pub async fn handle_message(ctx: &BitswapContext, peer: &Arc<Peer>, bytes: &[u8]) -> Result<(), NetworkError> {
    let message = BitswapMessage::from_wire_bytes(bytes)?;
    debug!("< {} {:?}", peer.id(), message);
    ctx.stats.record_received(peer.id(), &message);
    for block in &message.payload {
        if let Err(err) = ctx.receive_block(block.clone()).await {
            warn!("failed to store block {}: {:#}", block.cid(), err);
        }
    }
    if let Some(wantlist) = &message.wantlist {
        let request = ctx.peer_requests.find_or_add(peer.clone());
        for entry in &wantlist.entries {
            request.adjust_they_want(entry.cid, entry.cancel);
        }
    }
    Ok(())
}

/// One protocol of the node, as seen by the frame dispatcher.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Does this frame belong to the protocol?
    fn can_handle(&self, bytes: &[u8]) -> bool;

    async fn handle_message(&self, peer: &Arc<Peer>, bytes: &[u8]) -> Result<()>;

    /// Called once when the node shuts down.
    fn shutdown(&self) {}
}

/// The bitswap protocol handler: accepts frames for any bitswap version and
/// feeds them to the exchange. Protocol errors are absorbed here — the
/// message is dropped and the peer stays connected.
pub struct BitswapProtocolHandler {
    ctx: Arc<BitswapContext>,
}

impl BitswapProtocolHandler {
    pub fn new(ctx: Arc<BitswapContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ProtocolHandler for BitswapProtocolHandler {
    fn can_handle(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(PROTOCOL_PREFIX)
    }

    async fn handle_message(&self, peer: &Arc<Peer>, bytes: &[u8]) -> Result<()> {
        if let Err(err) = handle_message(&self.ctx, peer, bytes).await {
            debug!("dropping message from {}: {}", peer.id(), err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PROTOCOL_HEADER;

    #[test]
    fn bitswap_frames_are_recognized_by_prefix() {
        assert!(PROTOCOL_HEADER.starts_with(PROTOCOL_PREFIX));
        assert!(b"/ipfs/bitswap/1.0.0\nrest".starts_with(PROTOCOL_PREFIX));
        assert!(!b"/ipfs/hello/1.0.0\n".starts_with(PROTOCOL_PREFIX));
        assert!(!b"ipfs/bitswap".starts_with(PROTOCOL_PREFIX));
    }
}
