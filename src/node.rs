//! Module implement the on-media node formats.
//!
//! Every node on media starts with a 24-byte common header and is
//! 8-byte aligned. Multi-byte fields are little-endian. The CRC in the
//! header covers the node bytes past the CRC field itself.
//!
//! Binary format (common header):
//!
//! *------------------*------------------*
//! |       magic      |       crc        |
//! *------------------*------------------*
//! |               sqnum                 |
//! *------------------*------*-----------*
//! |       len        | type |  padding  |
//! *------------------*------*-----------*

use lazy_static::lazy_static;

use std::convert::{TryFrom, TryInto};

use crate::{
    config::{self, Config},
    key::{Key, KeyType, KEY_SZ},
    Error, Result,
};

/// Magic value identifying a node header.
pub const NODE_MAGIC: u32 = 0x7e1a_51cb;

/// Size of the common node header.
pub const CH_SZ: usize = 24;
/// Size of an index node with zero branches.
pub const IDX_SZ: usize = CH_SZ + 4;
/// Size of one branch within an index node.
pub const BRANCH_SZ: usize = KEY_SZ + 12;
/// Size of an inode node.
pub const INO_SZ: usize = CH_SZ + KEY_SZ + 16;
/// Size of a data node with zero data bytes.
pub const DATA_SZ: usize = CH_SZ + KEY_SZ + 8;
/// Size of a directory/xattr entry node with zero name bytes. The name
/// and its terminating NUL byte follow.
pub const DENT_SZ: usize = CH_SZ + KEY_SZ + 12;
/// Size of a truncation node.
pub const TRUN_SZ: usize = CH_SZ + 24;
/// Size of a bud reference node.
pub const REF_SZ: usize = CH_SZ + 12;
/// Size of a commit-start node.
pub const CS_SZ: usize = CH_SZ + 8;

/// Number of inode types a directory entry can refer.
pub const ITYPES_CNT: u8 = 8;

lazy_static! {
    static ref CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_JAMCRC);
}

/// Round `n` up to the media alignment of 8 bytes.
#[inline]
pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Type of a node on media.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum NodeType {
    Ino = 0,
    Data = 1,
    Dent = 2,
    Xent = 3,
    Trun = 4,
    Idx = 5,
    Ref = 6,
    Cs = 7,
    Pad = 8,
}

impl TryFrom<u8> for NodeType {
    type Error = Error;

    fn try_from(code: u8) -> Result<NodeType> {
        match code {
            0 => Ok(NodeType::Ino),
            1 => Ok(NodeType::Data),
            2 => Ok(NodeType::Dent),
            3 => Ok(NodeType::Xent),
            4 => Ok(NodeType::Trun),
            5 => Ok(NodeType::Idx),
            6 => Ok(NodeType::Ref),
            7 => Ok(NodeType::Cs),
            8 => Ok(NodeType::Pad),
            _ => err_at!(Corrupted, msg: "bad node type code {}", code),
        }
    }
}

impl NodeType {
    /// Node type a leaf branch of key type `kt` must point to.
    pub fn from_key_type(kt: KeyType) -> NodeType {
        match kt {
            KeyType::Inode => NodeType::Ino,
            KeyType::Data => NodeType::Data,
            KeyType::DirEntry => NodeType::Dent,
            KeyType::XattrEntry => NodeType::Xent,
            KeyType::Trunc => NodeType::Trun,
        }
    }
}

/// Decoded common header of a node.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub sqnum: u64,
    pub len: usize,
    pub typ: NodeType,
}

/// Decode and validate the common header within `buf`. `buf` must hold
/// the entire node; trailing bytes beyond the header's length are
/// ignored. Validation failure is [Error::Corrupted].
pub fn decode_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < CH_SZ {
        return err_at!(Corrupted, msg: "short node {}", buf.len());
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != NODE_MAGIC {
        return err_at!(Corrupted, msg: "bad magic {:x}", magic);
    }
    let len = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
    if len < CH_SZ || len > buf.len() {
        return err_at!(Corrupted, msg: "bad node length {}/{}", len, buf.len());
    }
    let crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if crc != CRC32.checksum(&buf[8..len]) {
        return err_at!(Corrupted, msg: "bad crc");
    }
    Ok(Header {
        sqnum: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        len,
        typ: NodeType::try_from(buf[20])?,
    })
}

/// Decode the common header checking it against an expected type and
/// length, the contract for reading a node whose index branch is
/// trusted.
pub fn check_header(buf: &[u8], typ: NodeType, len: usize) -> Result<Header> {
    let hdr = decode_header(buf)?;
    if hdr.typ != typ {
        return err_at!(Corrupted, msg: "bad node type {:?} want {:?}", hdr.typ, typ);
    }
    if hdr.len != len {
        return err_at!(Corrupted, msg: "bad node length {} want {}", hdr.len, len);
    }
    Ok(hdr)
}

/// Fallible flavor of [check_header]: any mismatch, bad magic or bad
/// CRC included, reads as "no such node here" instead of an error.
pub fn try_header(buf: &[u8], typ: NodeType, len: usize) -> Option<Header> {
    if buf.len() < CH_SZ || len < CH_SZ || len > buf.len() {
        return None;
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != NODE_MAGIC {
        return None;
    }
    let hdr = Header {
        sqnum: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        len: u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize,
        typ: NodeType::try_from(buf[20]).ok()?,
    };
    if hdr.typ != typ || hdr.len != len {
        return None;
    }
    let crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if crc != CRC32.checksum(&buf[8..len]) {
        return None;
    }
    Some(hdr)
}

/// Key of a leaf node. All leaf node formats keep the key right after
/// the common header.
pub fn read_key(buf: &[u8]) -> Result<Key> {
    if buf.len() < CH_SZ + KEY_SZ {
        return err_at!(Corrupted, msg: "short leaf node {}", buf.len());
    }
    Key::decode(&buf[CH_SZ..CH_SZ + KEY_SZ])
}

// Reserve the header, let `body` fill the payload, then seal magic,
// sqnum, length and crc.
fn encode_node<B>(typ: NodeType, sqnum: u64, body: B) -> Vec<u8>
where
    B: FnOnce(&mut Vec<u8>),
{
    let mut buf: Vec<u8> = vec![0; CH_SZ];
    body(&mut buf);

    let len = u32::try_from(buf.len()).unwrap();
    buf[0..4].copy_from_slice(&NODE_MAGIC.to_le_bytes());
    buf[8..16].copy_from_slice(&sqnum.to_le_bytes());
    buf[16..20].copy_from_slice(&len.to_le_bytes());
    buf[20] = typ as u8;
    let crc = CRC32.checksum(&buf[8..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// One branch of an index node.
///
/// Binary format (branch):
///
/// *------------------------------------*
/// |              64-bit key            |
/// *------------*------------*----------*
/// |    lnum    |    offs    |   len    |
/// *------------*------------*----------*
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Branch {
    pub key: Key,
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
}

/// Index node: a page of branches at one level of the index tree.
#[derive(Clone, Debug)]
pub struct IdxNode {
    pub level: u16,
    pub branches: Vec<Branch>,
}

impl IdxNode {
    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        encode_node(NodeType::Idx, sqnum, |buf| {
            let child_cnt = u16::try_from(self.branches.len()).unwrap();
            buf.extend_from_slice(&child_cnt.to_le_bytes());
            buf.extend_from_slice(&self.level.to_le_bytes());
            for br in self.branches.iter() {
                buf.extend_from_slice(&br.key.encode());
                buf.extend_from_slice(&br.lnum.to_le_bytes());
                buf.extend_from_slice(&br.offs.to_le_bytes());
                buf.extend_from_slice(&br.len.to_le_bytes());
            }
        })
    }

    /// Decode an index node, headers checked against `len`. Geometry
    /// validation against the mount configuration is with the caller.
    pub fn decode(buf: &[u8], len: usize) -> Result<IdxNode> {
        check_header(buf, NodeType::Idx, len)?;
        let child_cnt = u16::from_le_bytes(buf[CH_SZ..CH_SZ + 2].try_into().unwrap());
        let level = u16::from_le_bytes(buf[CH_SZ + 2..CH_SZ + 4].try_into().unwrap());

        let want = IDX_SZ + (child_cnt as usize) * BRANCH_SZ;
        if len != want {
            return err_at!(Corrupted, msg: "bad idx node length {} want {}", len, want);
        }

        let mut branches = Vec::with_capacity(child_cnt as usize);
        for i in 0..(child_cnt as usize) {
            let off = IDX_SZ + (i * BRANCH_SZ);
            let br = &buf[off..off + BRANCH_SZ];
            branches.push(Branch {
                key: Key::decode(&br[0..8])?,
                lnum: u32::from_le_bytes(br[8..12].try_into().unwrap()),
                offs: u32::from_le_bytes(br[12..16].try_into().unwrap()),
                len: u32::from_le_bytes(br[16..20].try_into().unwrap()),
            });
        }

        Ok(IdxNode { level, branches })
    }
}

/// Inode node.
#[derive(Clone, Debug, PartialEq)]
pub struct InoNode {
    pub key: Key,
    pub size: u64,
    pub nlink: u32,
    pub mode: u32,
}

impl InoNode {
    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        encode_node(NodeType::Ino, sqnum, |buf| {
            buf.extend_from_slice(&self.key.encode());
            buf.extend_from_slice(&self.size.to_le_bytes());
            buf.extend_from_slice(&self.nlink.to_le_bytes());
            buf.extend_from_slice(&self.mode.to_le_bytes());
        })
    }

    pub fn decode(buf: &[u8]) -> Result<InoNode> {
        check_header(buf, NodeType::Ino, INO_SZ)?;
        let p = CH_SZ + KEY_SZ;
        Ok(InoNode {
            key: read_key(buf)?,
            size: u64::from_le_bytes(buf[p..p + 8].try_into().unwrap()),
            nlink: u32::from_le_bytes(buf[p + 8..p + 12].try_into().unwrap()),
            mode: u32::from_le_bytes(buf[p + 12..p + 16].try_into().unwrap()),
        })
    }
}

/// Data node, one block worth of file data.
#[derive(Clone, Debug, PartialEq)]
pub struct DataNode {
    pub key: Key,
    pub size: u32, // uncompressed byte count, <= block_size
    pub data: Vec<u8>,
}

impl DataNode {
    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        encode_node(NodeType::Data, sqnum, |buf| {
            buf.extend_from_slice(&self.key.encode());
            buf.extend_from_slice(&self.size.to_le_bytes());
            buf.extend_from_slice(&0_u32.to_le_bytes());
            buf.extend_from_slice(&self.data);
        })
    }

    pub fn decode(buf: &[u8]) -> Result<DataNode> {
        let hdr = decode_header(buf)?;
        if hdr.typ != NodeType::Data || hdr.len < DATA_SZ {
            return err_at!(
                Corrupted, msg: "bad data node {:?} length {}", hdr.typ, hdr.len
            );
        }
        let p = CH_SZ + KEY_SZ;
        Ok(DataNode {
            key: read_key(buf)?,
            size: u32::from_le_bytes(buf[p..p + 4].try_into().unwrap()),
            data: buf[DATA_SZ..hdr.len].to_vec(),
        })
    }
}

/// Directory entry or extended attribute entry node.
///
/// Binary format (past the common header):
///
/// *------------------------------------*
/// |              64-bit key            |
/// *------------------------------------*
/// |             64-bit inum            |
/// *------*------*----------*-----------*
/// |etype | pad  |   nlen   | name, 0x00|
/// *------*------*----------*-----------*
///
/// A zero `inum` marks a deletion entry.
#[derive(Clone, Debug, PartialEq)]
pub struct DentNode {
    pub key: Key,
    pub inum: u64,
    pub etype: u8,
    pub name: Vec<u8>,
}

impl DentNode {
    fn node_type(&self) -> NodeType {
        match self.key.to_type() {
            KeyType::XattrEntry => NodeType::Xent,
            _ => NodeType::Dent,
        }
    }

    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        encode_node(self.node_type(), sqnum, |buf| {
            buf.extend_from_slice(&self.key.encode());
            buf.extend_from_slice(&self.inum.to_le_bytes());
            buf.push(self.etype);
            buf.push(0);
            let nlen = u16::try_from(self.name.len()).unwrap();
            buf.extend_from_slice(&nlen.to_le_bytes());
            buf.extend_from_slice(&self.name);
            buf.push(0);
        })
    }

    /// Decode and validate an entry node. The shape checks double as
    /// the entry validation replay performs on every scanned entry.
    pub fn decode(buf: &[u8]) -> Result<DentNode> {
        let hdr = decode_header(buf)?;
        match hdr.typ {
            NodeType::Dent | NodeType::Xent => (),
            _ => return err_at!(Corrupted, msg: "bad entry node type {:?}", hdr.typ),
        }
        if hdr.len < DENT_SZ + 1 {
            return err_at!(Corrupted, msg: "bad entry node length {}", hdr.len);
        }
        let key = read_key(buf)?;
        match key.to_type() {
            KeyType::DirEntry | KeyType::XattrEntry => (),
            kt => return err_at!(Corrupted, msg: "bad entry key type {:?}", kt),
        }

        let p = CH_SZ + KEY_SZ;
        let inum = u64::from_le_bytes(buf[p..p + 8].try_into().unwrap());
        let etype = buf[p + 8];
        let nlen = u16::from_le_bytes(buf[p + 10..p + 12].try_into().unwrap()) as usize;

        if hdr.len != DENT_SZ + nlen + 1
            || etype >= ITYPES_CNT
            || nlen > config::MAX_NLEN
            || buf[DENT_SZ + nlen] != 0
            || buf[DENT_SZ..DENT_SZ + nlen].iter().any(|b| *b == 0)
            || inum > u64::from(config::MAX_INUM)
        {
            return err_at!(Corrupted, msg: "bad entry node, nlen {} inum {}", nlen, inum);
        }

        Ok(DentNode {
            key,
            inum,
            etype,
            name: buf[DENT_SZ..DENT_SZ + nlen].to_vec(),
        })
    }

    /// Whether this entry is a deletion entry.
    #[inline]
    pub fn is_deletion(&self) -> bool {
        self.inum == 0
    }
}

/// Truncation node, a journal-only record.
#[derive(Clone, Debug, PartialEq)]
pub struct TrunNode {
    pub ino: u32,
    pub old_size: u64,
    pub new_size: u64,
}

impl TrunNode {
    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        encode_node(NodeType::Trun, sqnum, |buf| {
            buf.extend_from_slice(&self.ino.to_le_bytes());
            buf.extend_from_slice(&0_u32.to_le_bytes());
            buf.extend_from_slice(&self.old_size.to_le_bytes());
            buf.extend_from_slice(&self.new_size.to_le_bytes());
        })
    }

    pub fn decode(buf: &[u8]) -> Result<TrunNode> {
        check_header(buf, NodeType::Trun, TRUN_SZ)?;
        let p = CH_SZ;
        Ok(TrunNode {
            ino: u32::from_le_bytes(buf[p..p + 4].try_into().unwrap()),
            old_size: u64::from_le_bytes(buf[p + 8..p + 16].try_into().unwrap()),
            new_size: u64::from_le_bytes(buf[p + 16..p + 24].try_into().unwrap()),
        })
    }
}

/// Bud reference node, lives in the log and points at a journal
/// segment in the main area.
#[derive(Clone, Debug, PartialEq)]
pub struct RefNode {
    pub lnum: u32,
    pub offs: u32,
    pub jhead: u32,
}

impl RefNode {
    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        encode_node(NodeType::Ref, sqnum, |buf| {
            buf.extend_from_slice(&self.lnum.to_le_bytes());
            buf.extend_from_slice(&self.offs.to_le_bytes());
            buf.extend_from_slice(&self.jhead.to_le_bytes());
        })
    }

    pub fn decode(buf: &[u8]) -> Result<RefNode> {
        check_header(buf, NodeType::Ref, REF_SZ)?;
        let p = CH_SZ;
        Ok(RefNode {
            lnum: u32::from_le_bytes(buf[p..p + 4].try_into().unwrap()),
            offs: u32::from_le_bytes(buf[p + 4..p + 8].try_into().unwrap()),
            jhead: u32::from_le_bytes(buf[p + 8..p + 12].try_into().unwrap()),
        })
    }
}

/// Commit-start node, the first node of every commit epoch in the log.
#[derive(Clone, Debug, PartialEq)]
pub struct CsNode {
    pub cmt_no: u64,
}

impl CsNode {
    pub fn encode(&self, sqnum: u64) -> Vec<u8> {
        encode_node(NodeType::Cs, sqnum, |buf| {
            buf.extend_from_slice(&self.cmt_no.to_le_bytes());
        })
    }

    pub fn decode(buf: &[u8]) -> Result<CsNode> {
        check_header(buf, NodeType::Cs, CS_SZ)?;
        Ok(CsNode {
            cmt_no: u64::from_le_bytes(buf[CH_SZ..CH_SZ + 8].try_into().unwrap()),
        })
    }
}

/// Valid media lengths, `(min, max)` inclusive, for the target of a
/// leaf branch carrying a key of type `kt`.
pub fn leaf_len_range(config: &Config, kt: KeyType) -> (usize, usize) {
    match kt {
        KeyType::Inode => (INO_SZ, INO_SZ),
        KeyType::Data => (DATA_SZ, DATA_SZ + config.block_size),
        KeyType::DirEntry | KeyType::XattrEntry => {
            (DENT_SZ + 1, DENT_SZ + config::MAX_NLEN + 1)
        }
        KeyType::Trunc => (TRUN_SZ, TRUN_SZ),
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
