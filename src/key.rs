//! Module implement the key algebra of the index tree.
//!
//! Keys are 64-bit on media and totally ordered. A key decomposes into
//! `(inode-number, type, discriminator)` and the derived ordering is
//! lexicographic on that triplet, so all keys belonging to one inode
//! are clustered, typed sub-ranges within the cluster are contiguous,
//! and data keys of one inode sort by block number. Directory-entry
//! and xattr-entry keys are "hashed": their discriminator is a name
//! hash, which may collide, and equal keys are told apart by comparing
//! entry names. Refer [Key::is_hashed].

use std::{convert::TryFrom, fmt, result};

use crate::{Error, Result};

/// Size of a key on media, in bytes.
pub const KEY_SZ: usize = 8;

/// Number of bits in the key discriminator.
const DISC_BITS: u32 = 29;
const DISC_MASK: u32 = (1 << DISC_BITS) - 1;

/// Largest value the name-hash discriminator can take.
pub const MAX_HASH: u32 = DISC_MASK;
/// Largest block number a data key can refer.
pub const MAX_BLOCK: u32 = DISC_MASK;

/// Type of a [Key]. The discriminant values are the on-media type
/// codes and double up as the sort order between key types of the
/// same inode.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum KeyType {
    Inode = 0,
    Data = 1,
    DirEntry = 2,
    XattrEntry = 3,
    Trunc = 4,
}

impl TryFrom<u8> for KeyType {
    type Error = Error;

    fn try_from(code: u8) -> Result<KeyType> {
        match code {
            0 => Ok(KeyType::Inode),
            1 => Ok(KeyType::Data),
            2 => Ok(KeyType::DirEntry),
            3 => Ok(KeyType::XattrEntry),
            4 => Ok(KeyType::Trunc),
            _ => err_at!(Corrupted, msg: "bad key type code {}", code),
        }
    }
}

/// Key for a file-system node in the index tree.
///
/// Field order matters, the derived ordering is the total order of
/// the index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    ino: u32,
    typ: KeyType,
    disc: u32,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "({},{:?},{})", self.ino, self.typ, self.disc)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl<'a> arbitrary::Arbitrary<'a> for Key {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        let ino: u32 = u.arbitrary()?;
        let key = match *u.choose(&[0_u8, 1, 2, 3])? {
            0 => Key::inode(ino),
            1 => Key::data(ino, u.arbitrary::<u32>()? & DISC_MASK),
            2 => Key::dent(ino, (u.arbitrary::<u32>()? & DISC_MASK).max(3)),
            _ => Key::xent(ino, (u.arbitrary::<u32>()? & DISC_MASK).max(3)),
        };
        Ok(key)
    }
}

impl Key {
    /// Key of the inode node for inode `ino`.
    pub fn inode(ino: u32) -> Key {
        Key {
            ino,
            typ: KeyType::Inode,
            disc: 0,
        }
    }

    /// Key of a data block of inode `ino`.
    pub fn data(ino: u32, block: u32) -> Key {
        Key {
            ino,
            typ: KeyType::Data,
            disc: block & DISC_MASK,
        }
    }

    /// Key of a directory entry under directory `ino`, discriminated
    /// by the entry's name hash.
    pub fn dent(ino: u32, hash: u32) -> Key {
        Key {
            ino,
            typ: KeyType::DirEntry,
            disc: hash & DISC_MASK,
        }
    }

    /// Key of an extended-attribute entry of host inode `ino`.
    pub fn xent(ino: u32, hash: u32) -> Key {
        Key {
            ino,
            typ: KeyType::XattrEntry,
            disc: hash & DISC_MASK,
        }
    }

    /// Key carried by a truncation journal entry. Truncation keys are
    /// never inserted into the index.
    pub fn trun(ino: u32) -> Key {
        Key {
            ino,
            typ: KeyType::Trunc,
            disc: 0,
        }
    }

    /// Lowest possible key for inode `ino`, under the total order.
    pub fn lowest(ino: u32) -> Key {
        Key::inode(ino)
    }

    /// Highest possible key for inode `ino`, under the total order.
    pub fn highest(ino: u32) -> Key {
        Key {
            ino,
            typ: KeyType::Trunc,
            disc: DISC_MASK,
        }
    }

    /// Lowest directory-entry key under directory `ino`.
    pub fn lowest_dent(ino: u32) -> Key {
        Key {
            ino,
            typ: KeyType::DirEntry,
            disc: 0,
        }
    }

    /// Lowest xattr-entry key of host inode `ino`.
    pub fn lowest_xent(ino: u32) -> Key {
        Key {
            ino,
            typ: KeyType::XattrEntry,
            disc: 0,
        }
    }
}

impl Key {
    #[inline]
    pub fn to_ino(&self) -> u32 {
        self.ino
    }

    #[inline]
    pub fn to_type(&self) -> KeyType {
        self.typ
    }

    /// Block number of a data key.
    #[inline]
    pub fn to_block(&self) -> u32 {
        self.disc
    }

    /// Name hash of a hashed key.
    #[inline]
    pub fn to_hash(&self) -> u32 {
        self.disc
    }

    /// Whether the key's discriminator is a name hash, in which case
    /// equal keys may refer different entries.
    #[inline]
    pub fn is_hashed(&self) -> bool {
        match self.typ {
            KeyType::DirEntry | KeyType::XattrEntry => true,
            _ => false,
        }
    }

    /// Encode key into its 64-bit media representation.
    pub fn encode(&self) -> [u8; KEY_SZ] {
        let hi = ((self.typ as u32) << DISC_BITS) | self.disc;
        let val = (u64::from(hi) << 32) | u64::from(self.ino);
        val.to_le_bytes()
    }

    /// Decode key from its media representation.
    pub fn decode(buf: &[u8]) -> Result<Key> {
        use std::convert::TryInto;

        if buf.len() < KEY_SZ {
            return err_at!(Corrupted, msg: "short key {}", buf.len());
        }
        let val = u64::from_le_bytes(buf[..KEY_SZ].try_into().unwrap());
        let hi = (val >> 32) as u32;
        let typ = KeyType::try_from((hi >> DISC_BITS) as u8)?;
        Ok(Key {
            ino: val as u32,
            typ,
            disc: hi & DISC_MASK,
        })
    }
}

/// R5 hash over an entry name, the discriminator for hashed keys.
///
/// Values 0, 1 and 2 are reserved for the "." and ".." entries and the
/// end-of-readdir marker, so real names never hash below 3.
pub fn r5_hash(name: &[u8]) -> u32 {
    let mut a: u32 = 0;
    for b in name.iter().map(|b| *b as i8 as i32) {
        a = a.wrapping_add((b << 4) as u32);
        a = a.wrapping_add((b >> 4) as u32);
        a = a.wrapping_mul(11);
    }
    a &= DISC_MASK;
    if a >= 3 {
        a
    } else {
        3
    }
}

#[cfg(test)]
#[path = "key_test.rs"]
mod key_test;
