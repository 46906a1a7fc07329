use std::fmt;

use crate::key::Key;

/// A bud: one pending journal segment, the tail of LEB `lnum`
/// starting at `start`, fed by journal head `jhead`.
#[derive(Clone, Debug, PartialEq)]
pub struct Bud {
    pub lnum: usize,
    pub start: usize,
    pub jhead: usize,
}

// A bud queued for replay, in the order its ref was met in the log.
#[derive(Clone, Debug)]
pub(crate) struct BudEntry {
    pub bud: Bud,
    pub sqnum: u64, // reference node sequence number
}

// Variant part of a replay entry. The discriminant doubles as what
// the entry is: entry nodes carry their name, truncations their size
// pair, and bud references the space accounting to install.
#[derive(Clone, Debug)]
pub(crate) enum Payload {
    Name(Vec<u8>),
    Sizes { old_size: u64, new_size: u64 },
    Bud { free: usize, dirty: usize },
}

// One update reconstructed from the journal, to be applied to the TNC
// in sequence-number order.
#[derive(Clone, Debug)]
pub(crate) struct ReplayEntry {
    pub lnum: usize,
    pub offs: usize,
    pub len: usize,
    pub sqnum: u64,
    pub deletion: bool,
    pub key: Key,
    pub payload: Payload,
}

impl fmt::Display for ReplayEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "entry<{} LEB {}:{} len {} sqnum {}>",
            self.key, self.lnum, self.offs, self.len, self.sqnum
        )
    }
}

impl ReplayEntry {
    pub fn new_size(&self) -> u64 {
        match &self.payload {
            Payload::Sizes { new_size, .. } => *new_size,
            _ => 0,
        }
    }
}
