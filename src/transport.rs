//! The session transport.
//!
//! A [`Session`] is a framed byte stream to one peer over TCP. Frames are
//! varint length-prefixed. The capability set is deliberately small:
//!
//! * `peek` — non-blocking, reports how many bytes are buffered and ready
//!   (negative on a dead connection),
//! * `read_frame` — reads one frame, bounded by a timeout,
//! * `write_frame` — writes one frame, serialized per session so that
//!   concurrent senders cannot interleave.
//!
//! Encryption and authentication are assumed to be provided here; the node
//! glue performs a hello exchange on top of this to learn the remote
//! identity.
use crate::message::{self, DecodeError};
use crate::peer::PeerId;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Frames larger than this are considered hostile and kill the session.
const MAX_FRAME_SIZE: usize = 1024 * 1024 * 4;

/// A framed, bidirectional byte stream to one peer.
pub struct Session {
    stream: TcpStream,
    remote_addr: SocketAddr,
    /// Bytes pulled off the socket by `peek` but not yet consumed.
    buffer: Mutex<Vec<u8>>,
    /// Serializes writers so frames from concurrent tasks don't interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            remote_addr,
            buffer: Mutex::new(Vec::new()),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Dials a peer within the given budget.
    pub async fn dial(addr: SocketAddr, budget: Duration) -> io::Result<Self> {
        let stream = timeout(budget, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        Self::from_stream(stream)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Non-blocking probe: how many bytes are ready to be read?
    ///
    /// Returns the number of buffered bytes (possibly zero), or a negative
    /// value when the connection is closed or in error.
    pub fn peek(&self) -> i32 {
        let mut buffer = self.buffer.lock();
        let mut chunk = [0u8; 4096];
        match self.stream.try_read(&mut chunk) {
            Ok(0) => {
                // orderly shutdown by the remote
                if buffer.is_empty() {
                    -1
                } else {
                    buffer.len() as i32
                }
            }
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                buffer.len() as i32
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => buffer.len() as i32,
            Err(_) => -1,
        }
    }

    /// Reads one frame, waiting at most `budget` for it to complete.
    pub async fn read_frame(&self, budget: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(frame) = self.take_buffered_frame()? {
                return Ok(frame);
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?;
            timeout(remaining, self.stream.readable())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??;
            let mut chunk = [0u8; 4096];
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    ))
                }
                Ok(n) => self.buffer.lock().extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Pops one complete frame off the peek buffer, if one is there.
    fn take_buffered_frame(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buffer = self.buffer.lock();
        let (len, header_len) = match varint_decode::u64(&buffer[..]) {
            Ok((len, rest)) => (len as usize, buffer.len() - rest.len()),
            Err(varint_decode::Error::Insufficient) => return Ok(None),
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame length"));
            }
        };
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        if buffer.len() - header_len < len {
            return Ok(None);
        }
        let frame = buffer[header_len..header_len + len].to_vec();
        buffer.drain(..header_len + len);
        Ok(Some(frame))
    }

    /// Writes one frame. Returns the number of payload bytes written; zero
    /// signals a dead transport to the caller.
    pub async fn write_frame(&self, bytes: &[u8]) -> io::Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut len_buf = varint_encode::u64_buffer();
        let mut out = varint_encode::u64(bytes.len() as u64, &mut len_buf).to_vec();
        out.extend_from_slice(bytes);
        let mut written = 0;
        while written < out.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&out[written..]) {
                Ok(0) => return Ok(0),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(bytes.len())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("remote", &self.remote_addr).finish()
    }
}

/// Header of the hello frame that opens every session.
pub const HELLO_HEADER: &[u8] = b"/ipfs/hello/1.0.0\n";

const TAG_HELLO_PEER_ID: u64 = 1;
const TAG_HELLO_LISTEN_ADDR: u64 = 2;

/// The identity exchange that opens a session.
///
/// Sessions are assumed authenticated; this frame is the thin stand-in
/// that lets each side register the other in its peerstore. The dialer
/// sends first, the acceptor replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub peer_id: PeerId,
    /// Address the sender accepts inbound sessions on.
    pub listen_addr: SocketAddr,
}

impl Hello {
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = HELLO_HEADER.to_vec();
        message::put_bytes(&mut out, TAG_HELLO_PEER_ID, self.peer_id.as_bytes());
        message::put_bytes(&mut out, TAG_HELLO_LISTEN_ADDR, self.listen_addr.to_string().as_bytes());
        out
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(DecodeError::MissingHeader)?;
        let mut peer_id = None;
        let mut listen_addr = None;
        let mut r = message::RecordReader::new(&bytes[newline + 1..]);
        while !r.is_empty() {
            let (tag, wire) = r.read_key()?;
            match tag {
                TAG_HELLO_PEER_ID => {
                    let id = r.read_bytes()?;
                    if id.is_empty() {
                        return Err(DecodeError::InvalidHello);
                    }
                    peer_id = Some(PeerId::from_bytes(id.to_vec()));
                }
                TAG_HELLO_LISTEN_ADDR => {
                    let addr = std::str::from_utf8(r.read_bytes()?).map_err(|_| DecodeError::InvalidHello)?;
                    listen_addr = Some(addr.parse().map_err(|_| DecodeError::InvalidHello)?);
                }
                _ => r.skip(wire)?,
            }
        }
        match (peer_id, listen_addr) {
            (Some(peer_id), Some(listen_addr)) => Ok(Self { peer_id, listen_addr }),
            _ => Err(DecodeError::InvalidHello),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Session, Session) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = Session::dial(addr, Duration::from_secs(5));
        let accept = async {
            let (stream, _) = listener.accept().await.unwrap();
            Session::from_stream(stream).unwrap()
        };
        let (a, b) = tokio::join!(dial, accept);
        (a.unwrap(), b)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn frame_roundtrip() {
        let (a, b) = pair().await;
        let written = a.write_frame(b"hello frame").await.unwrap();
        assert_eq!(written, 11);
        let frame = b.read_frame(Duration::from_secs(5)).await.unwrap();
        assert_eq!(frame, b"hello frame");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peek_reports_ready_bytes() {
        let (a, b) = pair().await;
        assert_eq!(b.peek(), 0);
        a.write_frame(b"x").await.unwrap();
        // give the kernel a moment to move the bytes
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.peek() > 0);
        let frame = b.read_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, b"x");
        assert_eq!(b.peek(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn peek_reports_error_after_close() {
        let (a, b) = pair().await;
        drop(a);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.peek() < 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_frame_times_out() {
        let (_a, b) = pair().await;
        let err = b.read_frame(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn hello_roundtrip() {
        let hello = Hello {
            peer_id: crate::peer::NodeIdentity::generate().peer_id().clone(),
            listen_addr: "127.0.0.1:4001".parse().unwrap(),
        };
        let wire = hello.to_wire_bytes();
        assert!(wire.starts_with(HELLO_HEADER));
        assert_eq!(Hello::from_wire_bytes(&wire).unwrap(), hello);
    }

    #[test]
    fn hello_without_identity_is_rejected() {
        assert!(Hello::from_wire_bytes(b"/ipfs/hello/1.0.0\n").is_err());
        assert!(Hello::from_wire_bytes(b"no newline at all").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_frames_are_reassembled() {
        let (a, b) = pair().await;
        let payload = vec![7u8; 16 * 1024];
        let (sent, received) = tokio::join!(a.write_frame(&payload), b.read_frame(Duration::from_secs(5)));
        assert_eq!(sent.unwrap(), payload.len());
        assert_eq!(received.unwrap(), payload);
    }
}
