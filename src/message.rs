//! Bitswap wire messages.
//!
//! A message is a record with three optional fields: a want list (the CIDs
//! the sender is looking for, with per-entry priority and cancel flags), a
//! legacy list of raw block bytes (bitswap 1.0, decoded but never emitted)
//! and a payload of framed blocks (bitswap 1.1, each carrying a CID prefix
//! so the receiver can rebuild and verify the CID).
//!
//! The encoding is the protobuf wire format, written out by hand: varint
//! field keys, varint scalars and length-delimited nested records. Unknown
//! fields are skipped; a length that runs past the buffer, a CID that does
//! not parse, or a CID with an empty digest poisons the whole message.
//!
//! On the wire every message is preceded by the ASCII protocol header
//! `/ipfs/bitswap/1.1.0\n`. Everything up to and including the first
//! newline is stripped on receive; a payload without a newline is rejected.
use crate::block::Block;
use cid::{Cid, Version};
use derive_more::{Display, Error, From};
use multihash::MultihashDigest;
use std::convert::TryFrom;
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Protocol header preceding every bitswap message on the wire.
pub const PROTOCOL_HEADER: &[u8] = b"/ipfs/bitswap/1.1.0\n";

/// Protocol prefix matched by the dispatcher for all bitswap versions.
pub const PROTOCOL_PREFIX: &[u8] = b"/ipfs/bitswap";

const WIRE_VARINT: u8 = 0;
const WIRE_LENGTH_DELIMITED: u8 = 2;

// message fields
const TAG_WANTLIST: u64 = 1;
const TAG_BLOCKS_V0: u64 = 2;
const TAG_PAYLOAD: u64 = 3;
// wantlist fields
const TAG_WANTLIST_ENTRY: u64 = 1;
const TAG_WANTLIST_FULL: u64 = 2;
// wantlist entry fields
const TAG_ENTRY_CID: u64 = 1;
const TAG_ENTRY_PRIORITY: u64 = 2;
const TAG_ENTRY_CANCEL: u64 = 3;
// payload block fields
const TAG_BLOCK_PREFIX: u64 = 1;
const TAG_BLOCK_DATA: u64 = 2;

#[derive(Debug, From, Display, Error)]
pub enum DecodeError {
    #[display(fmt = "record length exceeds remaining buffer")]
    Truncated,
    #[display(fmt = "bad varint: {}", _0)]
    Varint(varint_decode::Error),
    #[display(fmt = "unsupported wire type {}", _0)]
    UnsupportedWireType(#[error(not(source))] u8),
    #[display(fmt = "invalid cid: {}", _0)]
    Cid(cid::Error),
    #[display(fmt = "cid with empty multihash digest")]
    EmptyHash,
    #[display(fmt = "unknown multihash code {}", _0)]
    UnknownHash(#[error(not(source))] u64),
    #[display(fmt = "payload block without cid prefix")]
    MissingPrefix,
    #[display(fmt = "missing protocol header")]
    MissingHeader,
    #[display(fmt = "malformed hello")]
    InvalidHello,
}

/// One entry of a want list: a CID, how much the sender cares, and whether
/// this is a request or the withdrawal of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantlistEntry {
    pub cid: Cid,
    pub priority: i32,
    pub cancel: bool,
}

impl WantlistEntry {
    pub fn want(cid: Cid) -> Self {
        Self {
            cid,
            priority: 1,
            cancel: false,
        }
    }

    pub fn cancel(cid: Cid) -> Self {
        Self {
            cid,
            priority: 1,
            cancel: true,
        }
    }
}

/// The want-list field of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitswapWantlist {
    pub entries: Vec<WantlistEntry>,
    /// Whether this is the sender's complete want list rather than a delta.
    pub full: bool,
}

/// A bitswap message.
///
/// All fields are optional on the wire; a message with no fields at all is
/// a legal idle beat.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BitswapMessage {
    /// What the sender wants from us.
    pub wantlist: Option<BitswapWantlist>,
    /// Raw block bytes, bitswap 1.0. Accepted on decode, never emitted.
    pub blocks: Vec<Vec<u8>>,
    /// Framed blocks, bitswap 1.1.
    pub payload: Vec<Block>,
}

impl BitswapMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.wantlist.as_ref().map_or(true, |w| w.entries.is_empty())
            && self.blocks.is_empty()
            && self.payload.is_empty()
    }

    /// Adds a block to the 1.1 payload.
    pub fn add_payload_block(&mut self, block: Block) {
        self.payload.push(block);
    }

    /// Adds an entry to the want list, creating the list if necessary.
    pub fn add_wantlist_entry(&mut self, entry: WantlistEntry) {
        self.wantlist.get_or_insert_with(Default::default).entries.push(entry);
    }

    /// Encodes the message body (without the protocol header).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(wantlist) = &self.wantlist {
            let mut wl = Vec::new();
            for entry in &wantlist.entries {
                let mut e = Vec::new();
                put_bytes(&mut e, TAG_ENTRY_CID, &entry.cid.to_bytes());
                put_varint(&mut e, TAG_ENTRY_PRIORITY, entry.priority as u64);
                put_varint(&mut e, TAG_ENTRY_CANCEL, entry.cancel as u64);
                put_bytes(&mut wl, TAG_WANTLIST_ENTRY, &e);
            }
            put_varint(&mut wl, TAG_WANTLIST_FULL, wantlist.full as u64);
            put_bytes(&mut out, TAG_WANTLIST, &wl);
        }
        for block in &self.payload {
            let mut b = Vec::new();
            put_bytes(&mut b, TAG_BLOCK_PREFIX, &CidPrefix::from_cid(block.cid()).to_bytes());
            put_bytes(&mut b, TAG_BLOCK_DATA, block.data());
            put_bytes(&mut out, TAG_PAYLOAD, &b);
        }
        out
    }

    /// Encodes the message with the protocol header prepended, ready to be
    /// written to a session.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let body = self.to_bytes();
        let mut out = Vec::with_capacity(PROTOCOL_HEADER.len() + body.len());
        out.extend_from_slice(PROTOCOL_HEADER);
        out.extend_from_slice(&body);
        out
    }

    /// Decodes a message body (without the protocol header).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut message = BitswapMessage::new();
        let mut r = RecordReader::new(bytes);
        while !r.is_empty() {
            let (tag, wire) = r.read_key()?;
            match (tag, wire) {
                (TAG_WANTLIST, WIRE_LENGTH_DELIMITED) => {
                    let wantlist = decode_wantlist(r.read_bytes()?)?;
                    match &mut message.wantlist {
                        // repeated wantlist fields merge
                        Some(existing) => {
                            existing.entries.extend(wantlist.entries);
                            existing.full |= wantlist.full;
                        }
                        none => *none = Some(wantlist),
                    }
                }
                (TAG_BLOCKS_V0, WIRE_LENGTH_DELIMITED) => {
                    message.blocks.push(r.read_bytes()?.to_vec());
                }
                (TAG_PAYLOAD, WIRE_LENGTH_DELIMITED) => {
                    message.payload.push(decode_payload_block(r.read_bytes()?)?);
                }
                (_, wire) => r.skip(wire)?,
            }
        }
        Ok(message)
    }

    /// Decodes a message as received from a session: strips everything up to
    /// and including the first newline (the protocol header), then decodes
    /// the remainder.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(DecodeError::MissingHeader)?;
        Self::from_bytes(&bytes[newline + 1..])
    }
}

fn decode_wantlist(bytes: &[u8]) -> Result<BitswapWantlist, DecodeError> {
    let mut wantlist = BitswapWantlist::default();
    let mut r = RecordReader::new(bytes);
    while !r.is_empty() {
        let (tag, wire) = r.read_key()?;
        match (tag, wire) {
            (TAG_WANTLIST_ENTRY, WIRE_LENGTH_DELIMITED) => {
                wantlist.entries.push(decode_wantlist_entry(r.read_bytes()?)?);
            }
            (TAG_WANTLIST_FULL, WIRE_VARINT) => {
                wantlist.full = r.read_u64()? != 0;
            }
            (_, wire) => r.skip(wire)?,
        }
    }
    Ok(wantlist)
}

fn decode_wantlist_entry(bytes: &[u8]) -> Result<WantlistEntry, DecodeError> {
    let mut cid = None;
    let mut priority = 1i32;
    let mut cancel = false;
    let mut r = RecordReader::new(bytes);
    while !r.is_empty() {
        let (tag, wire) = r.read_key()?;
        match (tag, wire) {
            (TAG_ENTRY_CID, WIRE_LENGTH_DELIMITED) => {
                let decoded = Cid::try_from(r.read_bytes()?)?;
                if decoded.hash().digest().is_empty() {
                    return Err(DecodeError::EmptyHash);
                }
                cid = Some(decoded);
            }
            (TAG_ENTRY_PRIORITY, WIRE_VARINT) => priority = r.read_u64()? as i32,
            (TAG_ENTRY_CANCEL, WIRE_VARINT) => cancel = r.read_u64()? != 0,
            (_, wire) => r.skip(wire)?,
        }
    }
    let cid = cid.ok_or(DecodeError::EmptyHash)?;
    Ok(WantlistEntry { cid, priority, cancel })
}

fn decode_payload_block(bytes: &[u8]) -> Result<Block, DecodeError> {
    let mut prefix = None;
    let mut data = Vec::new();
    let mut r = RecordReader::new(bytes);
    while !r.is_empty() {
        let (tag, wire) = r.read_key()?;
        match (tag, wire) {
            (TAG_BLOCK_PREFIX, WIRE_LENGTH_DELIMITED) => {
                prefix = Some(CidPrefix::from_bytes(r.read_bytes()?)?);
            }
            (TAG_BLOCK_DATA, WIRE_LENGTH_DELIMITED) => {
                data = r.read_bytes()?.to_vec();
            }
            (_, wire) => r.skip(wire)?,
        }
    }
    let prefix = prefix.ok_or(DecodeError::MissingPrefix)?;
    let cid = prefix.to_cid(&data)?;
    Ok(Block::new(data, cid))
}

/// All metadata of a CID without the digest itself: enough to rebuild the
/// CID from the block bytes on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidPrefix {
    pub version: Version,
    pub codec: u64,
    pub mh_type: u64,
    pub mh_len: usize,
}

impl CidPrefix {
    pub fn from_cid(cid: &Cid) -> Self {
        Self {
            version: cid.version(),
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: cid.hash().digest().len(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        put_raw_varint(&mut out, self.version.into());
        put_raw_varint(&mut out, self.codec);
        put_raw_varint(&mut out, self.mh_type);
        put_raw_varint(&mut out, self.mh_len as u64);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (version, rest) = varint_decode::u64(bytes)?;
        let (codec, rest) = varint_decode::u64(rest)?;
        let (mh_type, rest) = varint_decode::u64(rest)?;
        let (mh_len, _rest) = varint_decode::usize(rest)?;
        Ok(Self {
            version: Version::try_from(version)?,
            codec,
            mh_type,
            mh_len,
        })
    }

    /// Hashes `data` and assembles the CID this prefix describes.
    pub fn to_cid(&self, data: &[u8]) -> Result<Cid, DecodeError> {
        if self.mh_len == 0 {
            return Err(DecodeError::EmptyHash);
        }
        let code =
            multihash::Code::try_from(self.mh_type).map_err(|_| DecodeError::UnknownHash(self.mh_type))?;
        let mut hash = code.digest(data);
        if self.mh_len < hash.digest().len() {
            hash = multihash::Multihash::wrap(hash.code(), &hash.digest()[..self.mh_len])
                .map_err(|_| DecodeError::EmptyHash)?;
        }
        Ok(Cid::new(self.version, self.codec, hash)?)
    }
}

impl std::fmt::Debug for BitswapMessage {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        let mut b = fmt.debug_struct("BitswapMessage");
        if let Some(wantlist) = &self.wantlist {
            b.field(
                "want",
                &wantlist
                    .entries
                    .iter()
                    .filter(|e| !e.cancel)
                    .map(|e| e.cid.to_string())
                    .collect::<Vec<_>>(),
            );
            b.field(
                "cancel",
                &wantlist
                    .entries
                    .iter()
                    .filter(|e| e.cancel)
                    .map(|e| e.cid.to_string())
                    .collect::<Vec<_>>(),
            );
            if wantlist.full {
                b.field("full", &wantlist.full);
            }
        }
        if !self.blocks.is_empty() {
            b.field("blocks", &self.blocks.len());
        }
        if !self.payload.is_empty() {
            b.field(
                "payload",
                &self.payload.iter().map(|x| x.cid().to_string()).collect::<Vec<_>>(),
            );
        }
        b.finish()
    }
}

// --- wire format plumbing ---

fn put_raw_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = varint_encode::u64_buffer();
    out.extend_from_slice(varint_encode::u64(value, &mut buf));
}

fn put_key(out: &mut Vec<u8>, tag: u64, wire: u8) {
    put_raw_varint(out, (tag << 3) | wire as u64);
}

pub(crate) fn put_varint(out: &mut Vec<u8>, tag: u64, value: u64) {
    put_key(out, tag, WIRE_VARINT);
    put_raw_varint(out, value);
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, tag: u64, bytes: &[u8]) {
    put_key(out, tag, WIRE_LENGTH_DELIMITED);
    put_raw_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Cursor over a buffer of tagged records.
pub(crate) struct RecordReader<'a> {
    buf: &'a [u8],
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_key(&mut self) -> Result<(u64, u8), DecodeError> {
        let key = self.read_u64()?;
        Ok((key >> 3, (key & 0x7) as u8))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let (value, rest) = varint_decode::u64(self.buf)?;
        self.buf = rest;
        Ok(value)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u64()? as usize;
        if len > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(bytes)
    }

    /// Skips over a field of the given wire type without interpreting it.
    pub fn skip(&mut self, wire: u8) -> Result<(), DecodeError> {
        match wire {
            WIRE_VARINT => {
                self.read_u64()?;
            }
            WIRE_LENGTH_DELIMITED => {
                self.read_bytes()?;
            }
            other => return Err(DecodeError::UnsupportedWireType(other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::RAW;
    use multihash::Code;
    use quickcheck::{quickcheck, Arbitrary, Gen};

    impl Arbitrary for WantlistEntry {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            // the wire format rejects a cid with an empty multihash digest,
            // so the generator must not produce one
            let mut cid: Cid = Arbitrary::arbitrary(g);
            while cid.hash().digest().is_empty() {
                cid = Arbitrary::arbitrary(g);
            }
            WantlistEntry {
                cid,
                // the wire carries priorities as unsigned varints
                priority: <i32 as Arbitrary>::arbitrary(g).abs(),
                cancel: Arbitrary::arbitrary(g),
            }
        }
    }

    impl Arbitrary for BitswapMessage {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let entries: Vec<WantlistEntry> = Arbitrary::arbitrary(g);
            let payload: Vec<Block> = Arbitrary::arbitrary(g);
            let wantlist = if entries.is_empty() {
                None
            } else {
                Some(BitswapWantlist {
                    entries,
                    full: Arbitrary::arbitrary(g),
                })
            };
            BitswapMessage {
                wantlist,
                blocks: Vec::new(),
                payload,
            }
        }
    }

    fn cid(data: &[u8]) -> Cid {
        Cid::new_v1(RAW, Code::Sha2_256.digest(data))
    }

    quickcheck! {
        fn cid_bytes_roundtrip(expected: Cid) -> bool {
            let bytes = expected.to_bytes();
            match Cid::try_from(bytes) {
                Ok(actual) => actual == expected,
                Err(_) => false,
            }
        }

        fn message_bytes_roundtrip(expected: BitswapMessage) -> bool {
            match BitswapMessage::from_bytes(&expected.to_bytes()) {
                Ok(actual) => actual == expected,
                Err(_) => false,
            }
        }

        fn message_wire_roundtrip(expected: BitswapMessage) -> bool {
            match BitswapMessage::from_wire_bytes(&expected.to_wire_bytes()) {
                Ok(actual) => actual == expected,
                Err(_) => false,
            }
        }
    }

    #[test]
    fn empty_message_is_a_valid_idle_beat() {
        let message = BitswapMessage::from_bytes(&[]).unwrap();
        assert!(message.is_empty());
        let wire = BitswapMessage::new().to_wire_bytes();
        assert!(wire.starts_with(PROTOCOL_HEADER));
        assert!(BitswapMessage::from_wire_bytes(&wire).unwrap().is_empty());
    }

    #[test]
    fn missing_header_newline_is_rejected() {
        let err = BitswapMessage::from_wire_bytes(b"/ipfs/bitswap/1.1.0").unwrap_err();
        assert!(matches!(err, DecodeError::MissingHeader));
    }

    #[test]
    fn garbage_before_the_newline_is_discarded() {
        let mut msg = BitswapMessage::new();
        msg.add_wantlist_entry(WantlistEntry::want(cid(b"a")));
        let mut wire = b"someone elses header\n".to_vec();
        wire.extend_from_slice(&msg.to_bytes());
        let decoded = BitswapMessage::from_wire_bytes(&wire).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn zero_length_cid_fails_the_whole_message() {
        // wantlist with a single entry whose cid field is empty
        let mut entry = Vec::new();
        put_bytes(&mut entry, 1, &[]);
        let mut wl = Vec::new();
        put_bytes(&mut wl, 1, &entry);
        let mut body = Vec::new();
        put_bytes(&mut body, 1, &wl);
        assert!(BitswapMessage::from_bytes(&body).is_err());
    }

    #[test]
    fn truncated_length_is_rejected() {
        let mut body = Vec::new();
        put_key(&mut body, 1, 2);
        put_raw_varint(&mut body, 1000);
        body.extend_from_slice(b"short");
        let err = BitswapMessage::from_bytes(&body).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated));
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let mut msg = BitswapMessage::new();
        msg.add_wantlist_entry(WantlistEntry::cancel(cid(b"b")));
        let mut body = Vec::new();
        put_varint(&mut body, 14, 42);
        put_bytes(&mut body, 15, b"opaque");
        body.extend_from_slice(&msg.to_bytes());
        let decoded = BitswapMessage::from_bytes(&body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn legacy_blocks_are_decoded_but_not_emitted() {
        let mut body = Vec::new();
        put_bytes(&mut body, 2, b"raw legacy bytes");
        let decoded = BitswapMessage::from_bytes(&body).unwrap();
        assert_eq!(decoded.blocks, vec![b"raw legacy bytes".to_vec()]);
        // re-encoding drops the legacy form
        assert!(BitswapMessage::from_bytes(&decoded.to_bytes()).unwrap().blocks.is_empty());
    }

    #[test]
    fn payload_block_rebuilds_its_cid() {
        let block = Block::new(b"hello\n".to_vec(), cid(b"hello\n"));
        let mut msg = BitswapMessage::new();
        msg.add_payload_block(block.clone());
        let decoded = BitswapMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(decoded.payload.len(), 1);
        assert_eq!(decoded.payload[0].cid(), block.cid());
        assert_eq!(decoded.payload[0].data(), block.data());
    }

    #[test]
    fn prefix_with_zero_digest_length_is_rejected() {
        let prefix = CidPrefix {
            version: Version::V1,
            codec: RAW,
            mh_type: u64::from(Code::Sha2_256),
            mh_len: 0,
        };
        assert!(matches!(prefix.to_cid(b"x"), Err(DecodeError::EmptyHash)));
    }

    #[test]
    fn default_priority_is_one() {
        // entry record carrying only a cid field
        let mut entry = Vec::new();
        put_bytes(&mut entry, 1, &cid(b"c").to_bytes());
        let mut wl = Vec::new();
        put_bytes(&mut wl, 1, &entry);
        let mut body = Vec::new();
        put_bytes(&mut body, 1, &wl);
        let decoded = BitswapMessage::from_bytes(&body).unwrap();
        let entries = &decoded.wantlist.unwrap().entries;
        assert_eq!(entries[0].priority, 1);
        assert!(!entries[0].cancel);
    }
}
