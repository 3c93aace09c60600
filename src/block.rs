//! Block
use cid::Cid;
use std::{
    cmp::{Ord, Ordering, PartialOrd},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// An immutable block: a byte string plus the CID that addresses it.
///
/// The data is behind an `Arc`, so cloning a block (for handing copies to
/// the blockstore, a want-list entry and a peer queue at the same time) is
/// cheap and never duplicates the bytes.
#[derive(Clone, Debug, Eq)]
pub struct Block {
    cid: Cid,
    data: Arc<[u8]>,
}

impl Block {
    /// Creates a new immutable block.
    pub fn new(data: Vec<u8>, cid: Cid) -> Self {
        Block { cid, data: data.into() }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Arc<[u8]> {
        self.data
    }
}

impl Hash for Block {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Hash::hash(&self.cid, state)
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.cid == other.cid
    }
}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cid.cmp(&other.cid))
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cid.cmp(&other.cid)
    }
}

#[cfg(test)]
mod tests {
    use super::Block;
    use crate::codecs::{DAG_PROTOBUF, RAW};
    use cid::Cid;
    use multihash::{Code, MultihashDigest};
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for Block {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let data: Vec<u8> = Arbitrary::arbitrary(g);
            let cid = Cid::new_v1(RAW, Code::Sha2_256.digest(&data));
            Block::new(data, cid)
        }
    }

    #[test]
    fn raw_block_cid() {
        let content = b"hello\n";
        let expected = "bafkreicysg23kiwv34eg2d7qweipxwosdo2py4ldv42nbauguluen5v6am";
        let cid = Cid::new_v1(RAW, Code::Sha2_256.digest(content));
        assert_eq!(expected, cid.to_string());
    }

    #[test]
    fn dag_pb_block_cid() {
        let content = b"hello\n";
        let expected = "QmUJPTFZnR2CPGAzmfdYPghgrFtYFB6pf1BqMvqfiPDam8";
        let hash = Code::Sha2_256.digest(content);
        let cid = Cid::new(cid::Version::V0, DAG_PROTOBUF, hash).unwrap();
        assert_eq!(expected, cid.to_string());
    }

    #[test]
    fn equality_is_by_cid() {
        let a = Block::new(b"hello\n".to_vec(), Cid::new_v1(RAW, Code::Sha2_256.digest(b"hello\n")));
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.data(), b.data());
    }
}
