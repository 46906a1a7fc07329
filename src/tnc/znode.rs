use std::time;

use crate::key::Key;

// Handle to a znode in the [Arena]. Stable until the znode is freed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Zid(u32);

/// One slot of a znode, either referring a child index node, when the
/// znode's level is above zero, or a leaf node on media.
///
/// `len == 0` in a parent branch means the child exists only in
/// memory, there is no on-flash image for it yet.
#[derive(Clone)]
pub struct Zbranch {
    pub key: Key,
    pub lnum: usize,
    pub offs: usize,
    pub len: usize,
    pub child: Option<Zid>,
    pub leaf: Option<Vec<u8>>, // leaf-node-cache payload
}

impl Zbranch {
    pub fn new(key: Key, lnum: usize, offs: usize, len: usize) -> Zbranch {
        Zbranch {
            key,
            lnum,
            offs,
            len,
            child: None,
            leaf: None,
        }
    }

    /// Forget the on-flash image of this branch.
    pub fn clear_image(&mut self) {
        self.lnum = 0;
        self.offs = 0;
        self.len = 0;
    }
}

/// A znode, one cached page of the index tree holding up to
/// fanout-many branches, with one spare slot for insert-then-split.
pub struct Znode {
    pub level: usize,
    pub branches: Vec<Zbranch>,
    pub parent: Option<Zid>,
    pub iip: usize, // index in parent
    pub time: u64,

    // flag bits
    pub dirty: bool,
    pub cow: bool,
    pub obsolete: bool,
    pub alt: bool,  // had an insert at slot zero
    pub cnext: bool, // linked on the commit list
}

impl Znode {
    pub fn new(level: usize, fanout: usize) -> Znode {
        Znode {
            level,
            branches: Vec::with_capacity(fanout + 1),
            parent: None,
            iip: 0,
            time: unix_secs(),
            dirty: false,
            cow: false,
            obsolete: false,
            alt: false,
            cnext: false,
        }
    }

    #[inline]
    pub fn child_cnt(&self) -> usize {
        self.branches.len()
    }

    /// Binary search for `key` within this znode's branches. Returns
    /// `(slot, exact)` where slot is the greatest branch whose key is
    /// less-than-or-equal `key`, or -1 when `key` sorts below the
    /// leftmost branch. On exact match slot holds one of the matching
    /// branches.
    pub fn search(&self, key: &Key) -> (isize, bool) {
        match self.branches.binary_search_by(|zbr| zbr.key.cmp(key)) {
            Ok(n) => (n as isize, true),
            Err(0) => (-1, false),
            Err(n) => ((n - 1) as isize, false),
        }
    }
}

/// Arena of znodes. Znode graphs are cyclic, children point back at
/// parents, so znodes live in indexed slots and refer each other by
/// [Zid].
pub struct Arena {
    slots: Vec<Option<Znode>>,
    free: Vec<usize>,
    n_alive: usize,
}

impl Arena {
    pub fn new() -> Arena {
        Arena {
            slots: Vec::default(),
            free: Vec::default(),
            n_alive: 0,
        }
    }

    pub fn alloc(&mut self, znode: Znode) -> Zid {
        self.n_alive += 1;
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(znode);
                Zid(slot as u32)
            }
            None => {
                self.slots.push(Some(znode));
                Zid((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn free(&mut self, id: Zid) -> Znode {
        let znode = self.slots[id.0 as usize].take().unwrap();
        self.free.push(id.0 as usize);
        self.n_alive -= 1;
        znode
    }

    #[inline]
    pub fn get(&self, id: Zid) -> &Znode {
        self.slots[id.0 as usize].as_ref().unwrap()
    }

    #[inline]
    pub fn get_mut(&mut self, id: Zid) -> &mut Znode {
        self.slots[id.0 as usize].as_mut().unwrap()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.n_alive
    }

    /// Drain every live znode out of the arena.
    pub fn drain(&mut self) -> Vec<Znode> {
        self.free.clear();
        self.n_alive = 0;
        self.slots.drain(..).flatten().collect()
    }
}

pub fn unix_secs() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "znode_test.rs"]
mod znode_test;
