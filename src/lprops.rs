//! Module implement the per-LEB space accounting seam, called lprops.
//!
//! The TNC charges obsoleted node bytes as dirty space, and replay
//! rewrites the whole accounting of every bud LEB it scans. The
//! authoritative store lives with the mounting layer behind the
//! [LpropsStore] trait; [MemLprops] is the in-memory implementation
//! used by the test-suites.

use std::{collections::HashMap, sync::Mutex};

use crate::{Config, Result};

/// Lprops flag: the LEB is taken, the allocator must not hand it out.
pub const LP_TAKEN: u32 = 0x1;
/// Lprops flag: the LEB holds index nodes.
pub const LP_INDEX: u32 = 0x2;

/// Space accounting for one LEB.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Lprops {
    pub free: usize,
    pub dirty: usize,
    pub flags: u32,
}

impl Lprops {
    #[inline]
    pub fn is_taken(&self) -> bool {
        (self.flags & LP_TAKEN) != 0
    }
}

/// Trait abstracting the per-LEB accounting store.
pub trait LpropsStore {
    /// Current accounting for LEB `lnum`, marking its on-flash lprops
    /// entry dirty because the caller intends to change it.
    fn lookup_dirty(&self, lnum: usize) -> Result<Lprops>;

    /// Update accounting for LEB `lnum`. `None` for `free` or `dirty`
    /// leaves that value unchanged; `flags` always replaces.
    fn change(
        &self,
        lnum: usize,
        free: Option<usize>,
        dirty: Option<usize>,
        flags: u32,
    ) -> Result<()>;

    /// Charge `bytes` of dirty space to LEB `lnum`.
    fn add_dirt(&self, lnum: usize, bytes: usize) -> Result<()>;
}

/// In-memory implementation of [LpropsStore].
pub struct MemLprops {
    leb_size: usize,
    lps: Mutex<HashMap<usize, Lprops>>,
}

impl MemLprops {
    pub fn new(config: &Config) -> MemLprops {
        MemLprops {
            leb_size: config.leb_size,
            lps: Mutex::new(HashMap::new()),
        }
    }

    /// Seed accounting for LEB `lnum`, the way the lprops tables read
    /// off flash at mount would.
    pub fn set(&self, lnum: usize, lp: Lprops) {
        self.lps.lock().unwrap().insert(lnum, lp);
    }

    /// Current accounting for LEB `lnum`.
    pub fn get(&self, lnum: usize) -> Lprops {
        let lps = self.lps.lock().unwrap();
        lps.get(&lnum).copied().unwrap_or(Lprops {
            free: self.leb_size,
            dirty: 0,
            flags: 0,
        })
    }
}

impl LpropsStore for MemLprops {
    fn lookup_dirty(&self, lnum: usize) -> Result<Lprops> {
        Ok(self.get(lnum))
    }

    fn change(
        &self,
        lnum: usize,
        free: Option<usize>,
        dirty: Option<usize>,
        flags: u32,
    ) -> Result<()> {
        let mut lps = self.lps.lock().unwrap();
        let leb_size = self.leb_size;
        let lp = lps.entry(lnum).or_insert(Lprops {
            free: leb_size,
            dirty: 0,
            flags: 0,
        });
        if let Some(free) = free {
            lp.free = free;
        }
        if let Some(dirty) = dirty {
            lp.dirty = dirty;
        }
        lp.flags = flags;
        Ok(())
    }

    fn add_dirt(&self, lnum: usize, bytes: usize) -> Result<()> {
        let mut lps = self.lps.lock().unwrap();
        let leb_size = self.leb_size;
        let lp = lps.entry(lnum).or_insert(Lprops {
            free: leb_size,
            dirty: 0,
            flags: 0,
        });
        lp.dirty = (lp.dirty + bytes).min(leb_size);
        Ok(())
    }
}
