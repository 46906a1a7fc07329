// Module implement the tree-node-cache proper.
//
// [Tnc] is a handle over shared state: the znode arena, the zroot
// branch, the old-index tree and the cache counters all live behind a
// single mutex, acquired for the whole duration of every tree walk,
// media reads included. Only leaf reads for non-hashed keys copy the
// branch out and drop the lock first; hashed-key reads go through the
// leaf-node-cache and must stay inside.
//
// The inner tree is copy-on-write against the commit: while a znode is
// pinned by [Tnc::start_commit] any mutation clones it and obsoletes
// the original, so the commit writer always sees the snapshot it
// pinned, and the old on-flash index stays reachable until
// [Tnc::end_commit].

use log::{debug, trace};

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard},
    thread,
};

use crate::{
    key::{Key, KeyType},
    lprops::LpropsStore,
    media::Flash,
    node::{self, DentNode, IdxNode, NodeType},
    tnc::{
        lnc,
        znode::{unix_secs, Arena, Zbranch, Zid, Znode},
        Stats, CLEAN_ZN_CNT,
    },
    Config, Error, Result,
};

/// Tnc type, the tree-node-cache of one mounted file-system.
///
/// The handle is cheap to clone; clones share the same cache. All
/// operations serialize behind one mutex.
pub struct Tnc<F, L> {
    name: String,
    config: Config,
    flash: Arc<F>,
    lprops: Arc<L>,
    inner: Arc<Mutex<Inner>>,
}

impl<F, L> Clone for Tnc<F, L> {
    fn clone(&self) -> Tnc<F, L> {
        Tnc {
            name: self.name.clone(),
            config: self.config.clone(),
            flash: Arc::clone(&self.flash),
            lprops: Arc::clone(&self.lprops),
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) arena: Arena,
    pub(crate) zroot: Zbranch,
    // Old-index tree: positions of index nodes obsoleted since the
    // last commit, ordered by (lnum, offs). Their images must survive
    // until the commit completes.
    pub(crate) old_idx: BTreeSet<(usize, usize)>,
    // Znodes pinned by the running commit.
    pub(crate) commit_list: Vec<Zid>,
    pub(crate) lnc_bytes: usize,
    pub(crate) n_clean: usize,
    pub(crate) n_dirty: usize,
    pub(crate) replaying: bool,
    pub(crate) replay_sqnum: u64,
}

impl<F, L> Tnc<F, L>
where
    F: Flash,
    L: LpropsStore,
{
    /// Start with an empty in-memory tree, nothing on flash yet. The
    /// root znode is dirty from birth and will be written by the
    /// first commit.
    pub fn create(config: Config, flash: Arc<F>, lprops: Arc<L>) -> Tnc<F, L> {
        let mut inner = Inner::new(config.clone());
        let mut root = Znode::new(0, config.fanout);
        root.dirty = true;
        let root = inner.arena.alloc(root);
        inner.n_dirty = 1;
        inner.zroot.child = Some(root);

        Tnc {
            name: config.name.clone(),
            config,
            flash,
            lprops,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Open the tree whose root index node sits at `(lnum, offs, len)`
    /// on flash. Znodes load lazily as lookups touch them.
    pub fn open(
        config: Config,
        flash: Arc<F>,
        lprops: Arc<L>,
        root: (usize, usize, usize),
    ) -> Tnc<F, L> {
        let mut inner = Inner::new(config.clone());
        let (lnum, offs, len) = root;
        inner.zroot.lnum = lnum;
        inner.zroot.offs = offs;
        inner.zroot.len = len;

        Tnc {
            name: config.name.clone(),
            config,
            flash,
            lprops,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Identify this cache instance.
    #[inline]
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().unwrap()
    }
}

impl<F, L> Tnc<F, L>
where
    F: Flash,
    L: LpropsStore,
{
    /// Look up the node for `key` and return its raw bytes.
    pub fn lookup(&self, key: &Key) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        let (found, zid, n) = inner.lookup_level0(self.flash.as_ref(), key)?;
        if !found {
            return err_at!(KeyNotFound, msg: "lookup {}", key);
        }
        let n = n as usize;
        if key.is_hashed() {
            // leaf-node-cache gets used, keep the lock held
            return inner.read_leaf(self.flash.as_ref(), zid, n);
        }
        let zbr = inner.copy_branch(zid, n);
        drop(inner);

        read_leaf_copy(self.flash.as_ref(), &zbr)
    }

    /// Same as [Tnc::lookup] but also return the node's location.
    pub fn locate(&self, key: &Key) -> Result<(Vec<u8>, usize, usize)> {
        let mut inner = self.lock();
        let (found, zid, n) = inner.lookup_level0(self.flash.as_ref(), key)?;
        if !found {
            return err_at!(KeyNotFound, msg: "locate {}", key);
        }
        let n = n as usize;
        if key.is_hashed() {
            let (lnum, offs) = {
                let zbr = &inner.arena.get(zid).branches[n];
                (zbr.lnum, zbr.offs)
            };
            let raw = inner.read_leaf(self.flash.as_ref(), zid, n)?;
            return Ok((raw, lnum, offs));
        }
        let zbr = inner.copy_branch(zid, n);
        drop(inner);

        let raw = read_leaf_copy(self.flash.as_ref(), &zbr)?;
        Ok((raw, zbr.lnum, zbr.offs))
    }

    /// Look up a hashed-key node, resolving hash collisions by `name`.
    pub fn lookup_nm(&self, key: &Key, name: &[u8]) -> Result<Vec<u8>> {
        // In most cases there is no collision and the plain lookup
        // lands on the right entry.
        let raw = self.lookup(key)?;
        let dent = DentNode::decode(&raw)?;
        if dent.name == name {
            return Ok(raw);
        }

        let mut inner = self.lock();
        let (found, zid, n) = inner.lookup_level0(self.flash.as_ref(), key)?;
        if !found {
            return err_at!(KeyNotFound, msg: "lookup_nm {}", key);
        }
        let (found, zid, n) =
            inner.resolve_collision(self.flash.as_ref(), key, zid, n, name)?;
        if !found {
            return err_at!(KeyNotFound, msg: "lookup_nm {}", key);
        }
        let zbr = inner.copy_branch(zid, n as usize);
        drop(inner);

        read_leaf_copy(self.flash.as_ref(), &zbr)
    }

    /// Walk directory or xattr entries: find and read the entry that
    /// follows `(key, name)`. To fetch the first entry pass the lowest
    /// entry key for the inode and `None` for name.
    pub fn next_ent(&self, key: &Key, name: Option<&[u8]>) -> Result<DentNode> {
        assert!(key.is_hashed());

        let mut inner = self.lock();
        let (found, mut zid, mut n) = inner.lookup_level0(self.flash.as_ref(), key)?;
        if found {
            if let Some(nm) = name {
                let (_, z, m) =
                    inner.resolve_collision(self.flash.as_ref(), key, zid, n, nm)?;
                zid = z;
                n = m;
            }
        }

        loop {
            let (z, m) = match inner.next_branch(self.flash.as_ref(), zid, n)? {
                Some(next) => next,
                None => return err_at!(KeyNotFound, msg: "next_ent {}", key),
            };
            zid = z;
            n = m as isize;

            let dkey = inner.arena.get(zid).branches[m].key;
            if dkey.to_ino() != key.to_ino() || dkey.to_type() != key.to_type() {
                return err_at!(KeyNotFound, msg: "next_ent {}", key);
            }

            let raw = inner.read_leaf(self.flash.as_ref(), zid, m)?;
            let dent = DentNode::decode(&raw)?;
            if dent.is_deletion() {
                continue; // skip deletion entries
            }
            return Ok(dent);
        }
    }

    /// Add, or replace, the node for `key` at `(lnum, offs, len)`.
    pub fn add(&self, key: Key, lnum: usize, offs: usize, len: usize) -> Result<()> {
        let mut inner = self.lock();
        trace!(target: "tncache", "add {} LEB {}:{} len {}", key, lnum, offs, len);
        let (found, zid, n) =
            inner.lookup_level0_dirty(self.flash.as_ref(), self.lprops.as_ref(), &key)?;
        if found {
            inner.point_branch(self.lprops.as_ref(), zid, n as usize, lnum, offs, len)?;
        } else {
            let zbr = Zbranch::new(key, lnum, offs, len);
            inner.insert_branch(zid, zbr, (n + 1) as usize)?;
        }
        Ok(())
    }

    /// Replace the node for `key` only if it is still at
    /// `(old_lnum, old_offs)`. Garbage collection uses this when it
    /// moves nodes, the entry may have been updated meanwhile.
    pub fn replace(
        &self,
        key: Key,
        old_lnum: usize,
        old_offs: usize,
        lnum: usize,
        offs: usize,
        len: usize,
    ) -> Result<()> {
        let mut inner = self.lock();
        trace!(
            target: "tncache",
            "replace {} old LEB {}:{} new LEB {}:{}", key, old_lnum, old_offs, lnum, offs
        );
        let (found, zid, n) =
            inner.lookup_level0_dirty(self.flash.as_ref(), self.lprops.as_ref(), &key)?;

        let mut done = false;
        if found {
            let matches = {
                let zbr = &inner.arena.get(zid).branches[n as usize];
                zbr.lnum == old_lnum && zbr.offs == old_offs
            };
            if matches {
                inner.point_branch(self.lprops.as_ref(), zid, n as usize, lnum, offs, len)?;
                done = true;
            } else if key.is_hashed() {
                let (found, zid, n) = inner.resolve_collision_directly(
                    self.flash.as_ref(),
                    &key,
                    zid,
                    n,
                    old_lnum,
                    old_offs,
                )?;
                if found {
                    let zid = inner.ensure_dirty(self.lprops.as_ref(), zid)?;
                    inner.point_branch(
                        self.lprops.as_ref(),
                        zid,
                        n as usize,
                        lnum,
                        offs,
                        len,
                    )?;
                    done = true;
                }
            }
        }

        if !done {
            // The old node is already gone, the new copy is garbage.
            self.lprops.add_dirt(lnum, len)?;
        }
        Ok(())
    }

    /// Add a hashed-key node, resolving collisions by `name`.
    pub fn add_nm(
        &self,
        key: Key,
        lnum: usize,
        offs: usize,
        len: usize,
        name: &[u8],
    ) -> Result<()> {
        let mut inner = self.lock();
        trace!(target: "tncache", "add_nm {} LEB {}:{} len {}", key, lnum, offs, len);
        let (mut found, mut zid, mut n) =
            inner.lookup_level0_dirty(self.flash.as_ref(), self.lprops.as_ref(), &key)?;

        if found {
            let resolved = if inner.replaying {
                inner.fallible_resolve_collision(self.flash.as_ref(), &key, zid, n, name)?
            } else {
                inner.resolve_collision(self.flash.as_ref(), &key, zid, n, name)?
            };
            found = resolved.0;
            zid = resolved.1;
            n = resolved.2;

            // collision walks can wander off the dirtied path
            zid = inner.ensure_dirty(self.lprops.as_ref(), zid)?;

            if found {
                inner.point_branch(self.lprops.as_ref(), zid, n as usize, lnum, offs, len)?;
                return Ok(());
            }
        }

        let zbr = Zbranch::new(key, lnum, offs, len);
        inner.insert_branch(zid, zbr, (n + 1) as usize)
    }

    /// Remove the index entry for `key`. Removing an absent key is not
    /// an error.
    pub fn remove(&self, key: &Key) -> Result<()> {
        let mut inner = self.lock();
        trace!(target: "tncache", "remove {}", key);
        let (found, zid, n) =
            inner.lookup_level0_dirty(self.flash.as_ref(), self.lprops.as_ref(), key)?;
        if found {
            inner.delete_slot(self.flash.as_ref(), self.lprops.as_ref(), zid, n as usize)?;
        }
        Ok(())
    }

    /// Remove the index entry for a hashed `key` matching `name`.
    pub fn remove_nm(&self, key: &Key, name: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        trace!(target: "tncache", "remove_nm {}", key);
        let (found, zid, n) =
            inner.lookup_level0_dirty(self.flash.as_ref(), self.lprops.as_ref(), key)?;
        if found {
            let (found, zid, n) = if inner.replaying {
                inner.fallible_resolve_collision(self.flash.as_ref(), key, zid, n, name)?
            } else {
                inner.resolve_collision(self.flash.as_ref(), key, zid, n, name)?
            };
            if found {
                let zid = inner.ensure_dirty(self.lprops.as_ref(), zid)?;
                inner.delete_slot(
                    self.flash.as_ref(),
                    self.lprops.as_ref(),
                    zid,
                    n as usize,
                )?;
            }
        }
        Ok(())
    }

    /// Remove every index entry whose key falls within `[lo, hi]`.
    pub fn remove_range(&self, lo: &Key, hi: &Key) -> Result<()> {
        let mut inner = self.lock();
        trace!(target: "tncache", "remove_range {} {}", lo, hi);
        loop {
            // find first level 0 znode that contains keys to remove
            let (found, mut zid, mut n) = inner.lookup_level0(self.flash.as_ref(), lo)?;
            if !found {
                let (z, m) = match inner.next_branch(self.flash.as_ref(), zid, n)? {
                    Some(next) => next,
                    None => return Ok(()),
                };
                zid = z;
                n = m as isize;
                let key = inner.arena.get(zid).branches[m].key;
                if !in_range(&key, lo, hi) {
                    return Ok(());
                }
            }

            let zid = inner.ensure_dirty(self.lprops.as_ref(), zid)?;
            let n = n as usize;

            // remove all keys in range except the first, in one shift
            let mut k = 0;
            let child_cnt = inner.arena.get(zid).child_cnt();
            for i in (n + 1)..child_cnt {
                let key = inner.arena.get(zid).branches[i].key;
                if !in_range(&key, lo, hi) {
                    break;
                }
                inner.obsolete_branch(self.lprops.as_ref(), zid, i)?;
                trace!(target: "tncache", "removing {}", key);
                k += 1;
            }
            if k > 0 {
                inner.arena.get_mut(zid).branches.drain((n + 1)..(n + 1 + k));
            }

            // now delete the first
            inner.delete_slot(self.flash.as_ref(), self.lprops.as_ref(), zid, n)?;
        }
    }

    /// Remove inode `inum` from the index: its xattr entries, the
    /// xattr inodes those refer, its data blocks and the inode itself.
    pub fn remove_ino(&self, inum: u32) -> Result<()> {
        debug!(target: "tncache", "remove_ino {}", inum);

        let mut key = Key::lowest_xent(inum);
        let mut last_name: Option<Vec<u8>> = None;
        loop {
            let xent = match self.next_ent(&key, last_name.as_deref()) {
                Ok(xent) => xent,
                Err(Error::KeyNotFound(_, _)) => break,
                Err(err) => return Err(err),
            };

            let xattr_inum = xent.inum as u32;
            trace!(target: "tncache", "xent {:?}, ino {}", xent.name, xattr_inum);

            self.remove_nm(&xent.key, &xent.name)?;
            self.remove_range(&Key::lowest(xattr_inum), &Key::highest(xattr_inum))?;

            key = xent.key;
            last_name = Some(xent.name);
        }

        self.remove_range(&Key::lowest(inum), &Key::highest(inum))
    }

    /// Whether the node at `(lnum, offs)` is referred by the index.
    /// For an index node pass the key of its first child in `key` and
    /// its level; an index node counts as present only while its
    /// znode is clean or unloaded.
    pub fn has_node(
        &self,
        key: &Key,
        level: usize,
        lnum: usize,
        offs: usize,
        is_idx: bool,
    ) -> Result<bool> {
        let mut inner = self.lock();
        if is_idx {
            match inner.lookup_znode(self.flash.as_ref(), key, level, lnum, offs)? {
                None => Ok(false),
                Some(zid) => Ok(!inner.arena.get(zid).dirty),
            }
        } else {
            inner.is_leaf_in_tnc(self.flash.as_ref(), key, lnum, offs)
        }
    }

    /// Load and dirty the index node at `(lnum, offs)` so garbage
    /// collection can reclaim its LEB. `key` is the key of its first
    /// child.
    pub fn dirty_idx_node(
        &self,
        key: &Key,
        level: usize,
        lnum: usize,
        offs: usize,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(zid) = inner.lookup_znode(self.flash.as_ref(), key, level, lnum, offs)? {
            inner.dirty_cow_bottom_up(self.lprops.as_ref(), zid)?;
        }
        Ok(())
    }
}

impl<F, L> Tnc<F, L>
where
    F: Flash,
    L: LpropsStore,
{
    /// Pin the current tree for the commit writer: every dirty znode
    /// joins the commit list and is marked copy-on-write. Returns the
    /// number of pinned znodes.
    pub fn start_commit(&self) -> Result<usize> {
        let mut inner = self.lock();
        if !inner.commit_list.is_empty() {
            return err_at!(Fatal, msg: "commit already running");
        }
        let root = match inner.zroot.child {
            Some(root) => root,
            None => return Ok(0),
        };
        let mut list = vec![];
        inner.collect_dirty(root, &mut list);
        for zid in list.iter() {
            let znode = inner.arena.get_mut(*zid);
            znode.cow = true;
            znode.cnext = true;
        }
        debug!(target: "tncache", "start commit, {} dirty znodes", list.len());
        inner.commit_list = list.clone();
        Ok(list.len())
    }

    /// Unpin after the commit writer persisted every znode on the
    /// commit list. Obsoleted snapshots are freed, survivors become
    /// clean, and the old-index tree is destroyed, its protection
    /// window ends with the commit.
    pub fn end_commit(&self) -> Result<()> {
        let mut inner = self.lock();
        let list = std::mem::take(&mut inner.commit_list);
        debug!(target: "tncache", "end commit, {} znodes", list.len());
        for zid in list {
            if inner.arena.get(zid).obsolete {
                inner.free_obsolete(zid);
                continue;
            }
            let was_dirty = {
                let znode = inner.arena.get_mut(zid);
                znode.cow = false;
                znode.cnext = false;
                znode.alt = false;
                let was_dirty = znode.dirty;
                znode.dirty = false;
                was_dirty
            };
            if was_dirty {
                inner.n_dirty -= 1;
                inner.n_clean += 1;
                CLEAN_ZN_CNT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        inner.old_idx.clear();
        Ok(())
    }

    /// Unpin after a failed commit. Obsoleted snapshots are freed,
    /// survivors stay dirty for the next attempt.
    pub fn abort_commit(&self) -> Result<()> {
        let mut inner = self.lock();
        let list = std::mem::take(&mut inner.commit_list);
        debug!(target: "tncache", "abort commit, {} znodes", list.len());
        for zid in list {
            if inner.arena.get(zid).obsolete {
                inner.free_obsolete(zid);
            } else {
                let znode = inner.arena.get_mut(zid);
                znode.cow = false;
                znode.cnext = false;
            }
        }
        Ok(())
    }

    /// Close the cache and free all related resources.
    pub fn close(self) -> Result<()> {
        let mut inner = self.lock();
        let n_clean = inner.n_clean;
        inner.arena.drain();
        inner.zroot.child = None;
        inner.old_idx.clear();
        inner.commit_list.clear();
        inner.n_clean = 0;
        inner.n_dirty = 0;
        inner.lnc_bytes = 0;
        CLEAN_ZN_CNT.fetch_sub(n_clean as isize, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn as_flash(&self) -> &F {
        self.flash.as_ref()
    }

    pub(crate) fn as_lprops(&self) -> &L {
        self.lprops.as_ref()
    }

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.lock().replaying = replaying;
    }

    pub(crate) fn set_replay_sqnum(&self, sqnum: u64) {
        self.lock().replay_sqnum = sqnum;
    }

    /// Walk the whole index, loading missing znodes, calling
    /// `znode_cb` for every index node and `leaf_cb` for every leaf
    /// branch.
    pub fn walk_index<Z, B>(&self, znode_cb: &mut Z, leaf_cb: &mut B) -> Result<()>
    where
        Z: FnMut(usize, usize) -> Result<()>,
        B: FnMut(&Key, usize, usize, usize) -> Result<()>,
    {
        let mut inner = self.lock();
        let root = inner.ensure_root(self.flash.as_ref())?;
        inner.walk_sub_tree(self.flash.as_ref(), root, znode_cb, leaf_cb)
    }

    /// Check the structural invariants of the whole tree and return
    /// cache statistics. Walks and loads every znode.
    pub fn validate(&self) -> Result<Stats> {
        let mut inner = self.lock();
        let root = inner.ensure_root(self.flash.as_ref())?;
        let height = inner.arena.get(root).level + 1;
        inner.validate_sub_tree(self.flash.as_ref(), root)?;

        if inner.n_clean + inner.n_dirty != inner.arena.len() {
            return err_at!(
                Fatal,
                msg: "counters {}+{} != {}", inner.n_clean, inner.n_dirty, inner.arena.len()
            );
        }

        Ok(Stats {
            n_znodes: inner.arena.len(),
            n_clean: inner.n_clean,
            n_dirty: inner.n_dirty,
            n_old_idx: inner.old_idx.len(),
            lnc_bytes: inner.lnc_bytes,
            height,
        })
    }

    /// Cache statistics without walking the tree.
    pub fn to_stats(&self) -> Stats {
        let inner = self.lock();
        let height = match inner.zroot.child {
            Some(root) => inner.arena.get(root).level + 1,
            None => 0,
        };
        Stats {
            n_znodes: inner.arena.len(),
            n_clean: inner.n_clean,
            n_dirty: inner.n_dirty,
            n_old_idx: inner.old_idx.len(),
            lnc_bytes: inner.lnc_bytes,
            height,
        }
    }

    /// Old-index entries accumulated since the last commit, ordered
    /// by `(lnum, offs)`. The commit writer must not overwrite these.
    pub fn to_old_idx(&self) -> Vec<(usize, usize)> {
        let inner = self.lock();
        inner.old_idx.iter().copied().collect()
    }
}

/// Whether `lo <= key <= hi` under the key total order.
#[inline]
pub fn in_range(key: &Key, lo: &Key, hi: &Key) -> bool {
    key >= lo && key <= hi
}

// Read a leaf node through a copied zbranch, without the TNC lock.
// Only correct for non-hashed keys, whose reads skip the
// leaf-node-cache.
fn read_leaf_copy<F: Flash>(flash: &F, zbr: &Zbranch) -> Result<Vec<u8>> {
    if let Some(leaf) = lnc::lookup(zbr) {
        return Ok(leaf.to_vec());
    }
    let raw = flash.leb_read(zbr.lnum, zbr.offs, zbr.len)?;
    let typ = NodeType::from_key_type(zbr.key.to_type());
    node::check_header(&raw, typ, zbr.len)?;
    if node::read_key(&raw)? != zbr.key {
        return err_at!(
            Corrupted, msg: "bad key in node at LEB {}:{}", zbr.lnum, zbr.offs
        );
    }
    Ok(raw)
}

impl Inner {
    fn new(config: Config) -> Inner {
        Inner {
            config,
            arena: Arena::new(),
            zroot: Zbranch::new(Key::lowest(0), 0, 0, 0),
            old_idx: BTreeSet::new(),
            commit_list: Vec::default(),
            lnc_bytes: 0,
            n_clean: 0,
            n_dirty: 0,
            replaying: false,
            replay_sqnum: 0,
        }
    }

    // Branch slot addressed by (parent, iip); parent None means zroot.
    fn branch(&self, parent: Option<Zid>, iip: usize) -> &Zbranch {
        match parent {
            Some(zid) => &self.arena.get(zid).branches[iip],
            None => &self.zroot,
        }
    }

    fn branch_mut(&mut self, parent: Option<Zid>, iip: usize) -> &mut Zbranch {
        match parent {
            Some(zid) => &mut self.arena.get_mut(zid).branches[iip],
            None => &mut self.zroot,
        }
    }

    pub(crate) fn copy_branch(&self, zid: Zid, n: usize) -> Zbranch {
        self.arena.get(zid).branches[n].clone()
    }

    /// Record `(lnum, offs)` of an index node that was part of the
    /// last committed index but has been obsoleted in memory.
    pub(crate) fn insert_old_idx(&mut self, lnum: usize, offs: usize) -> Result<()> {
        if !self.old_idx.insert((lnum, offs)) {
            // harmless, the image is protected either way
            debug!(target: "tncache", "old idx LEB {}:{} added twice", lnum, offs);
        }
        Ok(())
    }

    // Record the on-flash image of `zid`, referred from its parent
    // branch or from zroot, in the old-index tree.
    fn insert_old_idx_znode(&mut self, zid: Zid) -> Result<()> {
        let (parent, iip) = {
            let znode = self.arena.get(zid);
            (znode.parent, znode.iip)
        };
        let (lnum, offs, len) = {
            let zbr = self.branch(parent, iip);
            (zbr.lnum, zbr.offs, zbr.len)
        };
        if len != 0 {
            self.insert_old_idx(lnum, offs)?;
        }
        Ok(())
    }

    // Same as [Inner::insert_old_idx_znode] but also forget the image
    // in the referring branch. Used just before splitting a znode
    // whose leftmost key changed since it was read, the image can no
    // longer be found by key.
    fn ins_clr_old_idx_znode(&mut self, zid: Zid) -> Result<()> {
        let (parent, iip) = {
            let znode = self.arena.get(zid);
            (znode.parent, znode.iip)
        };
        let (lnum, offs, len) = {
            let zbr = self.branch(parent, iip);
            (zbr.lnum, zbr.offs, zbr.len)
        };
        if len != 0 {
            self.insert_old_idx(lnum, offs)?;
            self.branch_mut(parent, iip).clear_image();
        }
        Ok(())
    }

    /// Read the index node referred by branch `(parent, iip)` off
    /// flash, validate it and cache it as a new znode.
    fn load_znode<F: Flash>(
        &mut self,
        flash: &F,
        parent: Option<Zid>,
        iip: usize,
    ) -> Result<Zid> {
        let (lnum, offs, len) = {
            let zbr = self.branch(parent, iip);
            assert!(zbr.child.is_none());
            (zbr.lnum, zbr.offs, zbr.len)
        };

        let raw = flash.leb_read(lnum, offs, len)?;
        let idx = IdxNode::decode(&raw, len)?;

        let config = &self.config;
        if idx.branches.is_empty()
            || idx.branches.len() > config.fanout
            || (idx.level as usize) > crate::config::MAX_LEVELS
        {
            return err_at!(
                Corrupted,
                msg: "bad index node at LEB {}:{}, {} branches level {}",
                lnum, offs, idx.branches.len(), idx.level
            );
        }

        let mut znode = Znode::new(idx.level as usize, config.fanout);
        for (i, br) in idx.branches.iter().enumerate() {
            let (blnum, boffs, blen) = (br.lnum as usize, br.offs as usize, br.len as usize);
            if blnum < config.main_first
                || blnum >= config.leb_cnt
                || boffs + blen > config.leb_size
                || (boffs & 7) != 0
            {
                return err_at!(
                    Corrupted, msg: "bad branch {} in index node at LEB {}:{}", i, lnum, offs
                );
            }
            match br.key.to_type() {
                KeyType::Inode | KeyType::Data | KeyType::DirEntry | KeyType::XattrEntry => (),
                kt => {
                    return err_at!(
                        Corrupted,
                        msg: "bad key type {:?} at slot {} in index node LEB {}:{}",
                        kt, i, lnum, offs
                    )
                }
            }
            if idx.level == 0 {
                let (min, max) = node::leaf_len_range(config, br.key.to_type());
                if blen < min || blen > max {
                    return err_at!(
                        Corrupted,
                        msg: "bad target node length {} for {} at LEB {}:{}",
                        blen, br.key, lnum, offs
                    );
                }
            }
            znode.branches.push(Zbranch::new(br.key, blnum, boffs, blen));
        }

        // keys must be ordered, equal neighbors only for hashed keys
        for i in 0..znode.branches.len().saturating_sub(1) {
            let (key1, key2) = (&znode.branches[i].key, &znode.branches[i + 1].key);
            if key1 > key2 {
                return err_at!(
                    Corrupted, msg: "bad key order at slot {} in LEB {}:{}", i, lnum, offs
                );
            }
            if key1 == key2 && !key1.is_hashed() {
                return err_at!(
                    Corrupted,
                    msg: "equal non-hashed keys at slot {} in LEB {}:{}", i, lnum, offs
                );
            }
        }

        znode.parent = parent;
        znode.iip = iip;

        let zid = self.arena.alloc(znode);
        self.n_clean += 1;
        // Global and per-fs clean counters may skew transiently, the
        // global one only feeds a shrinker heuristic.
        CLEAN_ZN_CNT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.branch_mut(parent, iip).child = Some(zid);

        trace!(
            target: "tncache",
            "loaded znode LEB {}:{} level {} with {} branches",
            lnum, offs, idx.level, idx.branches.len()
        );
        Ok(zid)
    }

    /// Child znode at slot `n`, loading it from media if absent.
    pub(crate) fn get_child<F: Flash>(
        &mut self,
        flash: &F,
        zid: Zid,
        n: usize,
    ) -> Result<Zid> {
        match self.arena.get(zid).branches[n].child {
            Some(child) => Ok(child),
            None => self.load_znode(flash, Some(zid), n),
        }
    }

    pub(crate) fn ensure_root<F: Flash>(&mut self, flash: &F) -> Result<Zid> {
        match self.zroot.child {
            Some(root) => Ok(root),
            None => self.load_znode(flash, None, 0),
        }
    }

    // Clone a pinned znode for mutation. The original is obsoleted
    // in place, loaded children are re-parented to the clone.
    fn copy_znode(&mut self, zid: Zid) -> Zid {
        let clone = {
            let znode = self.arena.get(zid);
            assert!(!znode.obsolete);
            let mut zn = Znode::new(znode.level, self.config.fanout);
            zn.branches = znode.branches.clone();
            zn.parent = znode.parent;
            zn.iip = znode.iip;
            zn.alt = znode.alt;
            zn.dirty = true;
            zn
        };
        let clone = self.arena.alloc(clone);

        let kids: Vec<(usize, Option<Zid>)> = {
            let znode = self.arena.get(clone);
            if znode.level != 0 {
                znode
                    .branches
                    .iter()
                    .enumerate()
                    .map(|(i, zbr)| (i, zbr.child))
                    .collect()
            } else {
                vec![]
            }
        };
        for (_i, child) in kids {
            if let Some(child) = child {
                self.arena.get_mut(child).parent = Some(clone);
            }
        }

        // The original becomes a frozen snapshot owned by the commit.
        let znode = self.arena.get_mut(zid);
        znode.obsolete = true;
        self.n_dirty -= 1;
        self.n_clean += 1;
        CLEAN_ZN_CNT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.n_dirty += 1; // the clone

        clone
    }

    /// Make the znode behind branch `(parent, iip)` safe to mutate.
    /// A znode pinned by the commit is cloned, anything else is
    /// dirtied in place.
    fn dirty_cow<L: LpropsStore>(
        &mut self,
        lprops: &L,
        parent: Option<Zid>,
        iip: usize,
    ) -> Result<Zid> {
        let zid = self.branch(parent, iip).child.unwrap();

        if !self.arena.get(zid).cow {
            // znode is not being committed
            if !self.arena.get(zid).dirty {
                self.arena.get_mut(zid).dirty = true;
                self.n_dirty += 1;
                self.n_clean -= 1;
                CLEAN_ZN_CNT.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                let (lnum, len) = {
                    let zbr = self.branch(parent, iip);
                    (zbr.lnum, zbr.len)
                };
                if len != 0 {
                    lprops.add_dirt(lnum, len)?;
                }
            }
            return Ok(zid);
        }

        let clone = self.copy_znode(zid);
        let (lnum, offs, len) = {
            let zbr = self.branch(parent, iip);
            (zbr.lnum, zbr.offs, zbr.len)
        };
        if len != 0 {
            self.insert_old_idx(lnum, offs)?;
            lprops.add_dirt(lnum, len)?;
        }
        {
            let zbr = self.branch_mut(parent, iip);
            zbr.child = Some(clone);
            zbr.clear_image();
        }
        trace!(target: "tncache", "copied pinned znode, was LEB {}:{}", lnum, offs);
        Ok(clone)
    }

    /// Dirty `zid` and all its ancestors. Used when the znode was
    /// found by something other than a top-down keyed descent, so the
    /// path has not been dirtied yet.
    pub(crate) fn dirty_cow_bottom_up<L: LpropsStore>(
        &mut self,
        lprops: &L,
        zid: Zid,
    ) -> Result<Zid> {
        // The path length is bounded by the root's level.
        let mut path: Vec<usize> = vec![];
        let root = self.zroot.child.unwrap();

        let mut top = zid;
        if self.arena.get(root).level > 0 {
            // go up until the parent is already safely dirty
            loop {
                let (parent, iip, dirty) = {
                    let znode = self.arena.get(top);
                    (znode.parent, znode.iip, znode.dirty)
                };
                let zp = match parent {
                    Some(zp) => zp,
                    None => break,
                };
                path.push(iip);
                if !self.arena.get(zp).cnext && dirty {
                    break;
                }
                top = zp;
            }
        }

        // come back down, dirtying as we go
        let mut p = path.len();
        let mut cur = top;
        loop {
            let parent = self.arena.get(cur).parent;
            cur = match parent {
                Some(zp) => {
                    p -= 1;
                    self.dirty_cow(lprops, Some(zp), path[p])?
                }
                None => self.dirty_cow(lprops, None, 0)?,
            };
            if p == 0 {
                break;
            }
            cur = self.arena.get(cur).branches[path[p - 1]].child.unwrap();
        }

        Ok(cur)
    }

    // Dirty `zid` bottom-up unless it is already safely dirty.
    pub(crate) fn ensure_dirty<L: LpropsStore>(&mut self, lprops: &L, zid: Zid) -> Result<Zid> {
        let znode = self.arena.get(zid);
        if znode.cnext || !znode.dirty {
            self.dirty_cow_bottom_up(lprops, zid)
        } else {
            Ok(zid)
        }
    }

    /// Search for the zero-level znode covering `key`. Returns
    /// `(exact, znode, slot)`; slot is -1 when `key` sorts below the
    /// leftmost branch. For hashed keys the left neighbor leaf is
    /// probed before giving up, a split may have left a colliding
    /// entry as the predecessor's rightmost branch.
    pub(crate) fn lookup_level0<F: Flash>(
        &mut self,
        flash: &F,
        key: &Key,
    ) -> Result<(bool, Zid, isize)> {
        let time = unix_secs();
        let mut zid = self.ensure_root(flash)?;

        let (mut exact, mut n);
        loop {
            let znode = self.arena.get_mut(zid);
            znode.time = time;
            let (slot, ex) = znode.search(key);
            n = slot;
            exact = ex;
            if znode.level == 0 {
                break;
            }
            let slot = n.max(0) as usize;
            zid = self.get_child(flash, zid, slot)?;
        }

        if exact || !key.is_hashed() || n != -1 {
            return Ok((exact, zid, n));
        }

        // The key was not found and it is a hashed key: the matching
        // entry may sit at the very end of the previous leaf, because
        // splits may cut a colliding run right at the separator.
        let orig = zid;
        match self.prev_branch(flash, zid, -1)? {
            None => Ok((false, orig, -1)),
            Some((pz, pn)) => {
                if self.arena.get(pz).branches[pn].key == *key {
                    Ok((true, pz, pn as isize))
                } else {
                    Ok((false, orig, -1))
                }
            }
        }
    }

    /// Same as [Inner::lookup_level0] but the whole path from the
    /// root, the left-edge probe included, is dirtied on return.
    pub(crate) fn lookup_level0_dirty<F: Flash, L: LpropsStore>(
        &mut self,
        flash: &F,
        lprops: &L,
        key: &Key,
    ) -> Result<(bool, Zid, isize)> {
        let time = unix_secs();
        self.ensure_root(flash)?;
        let mut zid = self.dirty_cow(lprops, None, 0)?;

        let (mut exact, mut n);
        loop {
            let znode = self.arena.get_mut(zid);
            znode.time = time;
            let (slot, ex) = znode.search(key);
            n = slot;
            exact = ex;
            if znode.level == 0 {
                break;
            }
            let slot = n.max(0) as usize;
            self.get_child(flash, zid, slot)?;
            zid = self.dirty_cow(lprops, Some(zid), slot)?;
        }

        if exact || !key.is_hashed() || n != -1 {
            return Ok((exact, zid, n));
        }

        let orig = zid;
        let (pz, pn) = match self.prev_branch(flash, zid, -1)? {
            None => return Ok((false, orig, -1)),
            Some(prev) => prev,
        };
        if self.arena.get(pz).branches[pn].key != *key {
            return Ok((false, orig, -1));
        }

        let pz = self.ensure_dirty(lprops, pz)?;
        Ok((true, pz, pn as isize))
    }

    /// Step to the next leaf branch after `(zid, n)`, in key order.
    pub(crate) fn next_branch<F: Flash>(
        &mut self,
        flash: &F,
        zid: Zid,
        n: isize,
    ) -> Result<Option<(Zid, usize)>> {
        let nn = n + 1;
        if nn < self.arena.get(zid).child_cnt() as isize {
            return Ok(Some((zid, nn as usize)));
        }

        let mut cur = zid;
        loop {
            let (parent, iip) = {
                let znode = self.arena.get(cur);
                (znode.parent, znode.iip)
            };
            let zp = match parent {
                Some(zp) => zp,
                None => return Ok(None),
            };
            let nn = iip + 1;
            cur = zp;
            if nn < self.arena.get(cur).child_cnt() {
                let mut down = self.get_child(flash, cur, nn)?;
                while self.arena.get(down).level != 0 {
                    down = self.get_child(flash, down, 0)?;
                }
                return Ok(Some((down, 0)));
            }
        }
    }

    /// Step to the previous leaf branch before `(zid, n)`, in key
    /// order.
    pub(crate) fn prev_branch<F: Flash>(
        &mut self,
        flash: &F,
        zid: Zid,
        n: isize,
    ) -> Result<Option<(Zid, usize)>> {
        if n > 0 {
            return Ok(Some((zid, (n - 1) as usize)));
        }

        let mut cur = zid;
        loop {
            let (parent, iip) = {
                let znode = self.arena.get(cur);
                (znode.parent, znode.iip)
            };
            let zp = match parent {
                Some(zp) => zp,
                None => return Ok(None),
            };
            cur = zp;
            if iip >= 1 {
                let mut down = self.get_child(flash, cur, iip - 1)?;
                while self.arena.get(down).level != 0 {
                    let last = self.arena.get(down).child_cnt() - 1;
                    down = self.get_child(flash, down, last)?;
                }
                let last = self.arena.get(down).child_cnt() - 1;
                return Ok(Some((down, last)));
            }
        }
    }

    /// Read the leaf node behind branch `(zid, n)`, serving and
    /// feeding the leaf-node-cache for hashed keys. TNC lock held by
    /// the caller.
    pub(crate) fn read_leaf<F: Flash>(
        &mut self,
        flash: &F,
        zid: Zid,
        n: usize,
    ) -> Result<Vec<u8>> {
        let (key, lnum, offs, len) = {
            let zbr = &self.arena.get(zid).branches[n];
            if let Some(leaf) = lnc::lookup(zbr) {
                return Ok(leaf.to_vec());
            }
            (zbr.key, zbr.lnum, zbr.offs, zbr.len)
        };

        let raw = flash.leb_read(lnum, offs, len)?;
        node::check_header(&raw, NodeType::from_key_type(key.to_type()), len)?;
        if node::read_key(&raw)? != key {
            return err_at!(Corrupted, msg: "bad key in node at LEB {}:{}", lnum, offs);
        }

        if key.is_hashed() {
            let limit = self.config.lnc_limit;
            let mut lnc_bytes = self.lnc_bytes;
            lnc::add(
                &mut self.arena.get_mut(zid).branches[n],
                &raw,
                &mut lnc_bytes,
                limit,
            )?;
            self.lnc_bytes = lnc_bytes;
        }
        Ok(raw)
    }

    /// Fallible flavor of [Inner::read_leaf] for replay: a missing or
    /// mismatching node on media reads as `None`, a dangling branch.
    /// A node whose sqnum is above the entry being replayed cannot be
    /// the target either, it was not yet in the index at that point.
    pub(crate) fn fallible_read_leaf<F: Flash>(
        &mut self,
        flash: &F,
        zid: Zid,
        n: usize,
    ) -> Result<Option<Vec<u8>>> {
        let (key, lnum, offs, len) = {
            let zbr = &self.arena.get(zid).branches[n];
            if let Some(leaf) = lnc::lookup(zbr) {
                return Ok(Some(leaf.to_vec()));
            }
            (zbr.key, zbr.lnum, zbr.offs, zbr.len)
        };

        let raw = flash.leb_read(lnum, offs, len)?;
        let typ = NodeType::from_key_type(key.to_type());
        let hdr = match node::try_header(&raw, typ, len) {
            Some(hdr) => hdr,
            None => {
                debug!(
                    target: "tncache",
                    "dangling branch LEB {}:{} len {}, key {}", lnum, offs, len, key
                );
                return Ok(None);
            }
        };
        match node::read_key(&raw) {
            Ok(nkey) if nkey == key => (),
            _ => return Ok(None),
        }
        if hdr.sqnum > self.replay_sqnum {
            return Ok(None);
        }

        if key.is_hashed() {
            let limit = self.config.lnc_limit;
            let mut lnc_bytes = self.lnc_bytes;
            lnc::add(
                &mut self.arena.get_mut(zid).branches[n],
                &raw,
                &mut lnc_bytes,
                limit,
            )?;
            self.lnc_bytes = lnc_bytes;
        }
        Ok(Some(raw))
    }

    // Free the leaf-node-cache entry of branch (zid, n) and charge
    // the branch target to dirty accounting.
    fn obsolete_branch<L: LpropsStore>(&mut self, lprops: &L, zid: Zid, n: usize) -> Result<()> {
        let mut lnc_bytes = self.lnc_bytes;
        let (lnum, len) = {
            let zbr = &mut self.arena.get_mut(zid).branches[n];
            lnc::free(zbr, &mut lnc_bytes);
            (zbr.lnum, zbr.len)
        };
        self.lnc_bytes = lnc_bytes;
        lprops.add_dirt(lnum, len)
    }

    /// Re-point branch `(zid, n)` at a new on-media node, obsoleting
    /// the old target.
    pub(crate) fn point_branch<L: LpropsStore>(
        &mut self,
        lprops: &L,
        zid: Zid,
        n: usize,
        lnum: usize,
        offs: usize,
        len: usize,
    ) -> Result<()> {
        self.obsolete_branch(lprops, zid, n)?;
        let zbr = &mut self.arena.get_mut(zid).branches[n];
        zbr.lnum = lnum;
        zbr.offs = offs;
        zbr.len = len;
        Ok(())
    }

    /// When the leftmost key of `zid` changed, pull the new key up
    /// through every ancestor that referred the old leftmost key.
    fn correct_parent_keys(&mut self, zid: Zid) {
        debug_assert!(self.arena.get(zid).iip == 0);

        let key = self.arena.get(zid).branches[0].key;
        let mut cur = zid;
        loop {
            let zp = match self.arena.get(cur).parent {
                Some(zp) => zp,
                None => break,
            };
            if key >= self.arena.get(zp).branches[0].key {
                break;
            }
            self.arena.get_mut(zp).branches[0].key = key;
            cur = zp;
            let znode = self.arena.get(cur);
            if znode.parent.is_none() || znode.iip != 0 {
                break;
            }
        }
    }

    // Place `zbr` at slot `n`, shifting the tail right and keeping
    // children's index-in-parent correct.
    fn insert_slot(&mut self, zid: Zid, zbr: Zbranch, n: usize) {
        debug_assert!(self.arena.get(zid).dirty);

        let new_child = zbr.child;
        let level = self.arena.get(zid).level;
        self.arena.get_mut(zid).branches.insert(n, zbr);

        if level != 0 {
            let kids: Vec<(usize, Zid)> = self
                .arena
                .get(zid)
                .branches
                .iter()
                .enumerate()
                .skip(n + 1)
                .filter_map(|(i, zbr)| zbr.child.map(|c| (i, c)))
                .collect();
            for (i, child) in kids {
                self.arena.get_mut(child).iip = i;
            }
            if let Some(child) = new_child {
                let child = self.arena.get_mut(child);
                child.iip = n;
                child.parent = Some(zid);
            }
        }

        // An insert at slot zero moves the lower key bound of this
        // znode. If it later splits, the on-flash image can no longer
        // be located by its leftmost key, so remember the fact.
        if n == 0 {
            self.arena.get_mut(zid).alt = true;
        }
    }

    /// Insert branch `zbr` at slot `n` of `zid`, splitting up the
    /// tree as needed. The path must already be dirty.
    pub(crate) fn insert_branch(&mut self, zid: Zid, zbr: Zbranch, n: usize) -> Result<()> {
        let fanout = self.config.fanout;
        let mut zid = zid;
        let mut zbr = zbr;
        let mut n = n;
        let mut appending = false;

        loop {
            let zp = self.arena.get(zid).parent;
            if self.arena.get(zid).child_cnt() < fanout {
                assert!(n != fanout);
                trace!(
                    target: "tncache",
                    "inserted {} at {} level {}", zbr.key, n, self.arena.get(zid).level
                );
                let iip = self.arena.get(zid).iip;
                self.insert_slot(zid, zbr, n);
                if n == 0 && zp.is_some() && iip == 0 {
                    self.correct_parent_keys(zid);
                }
                return Ok(());
            }

            // no free slot, split
            let level = self.arena.get(zid).level;
            trace!(target: "tncache", "splitting level {}, key {}", level, zbr.key);

            if self.arena.get(zid).alt {
                // this znode can no longer be found by key on flash
                self.ins_clr_old_idx_znode(zid)?;
            }

            // A sequential append of data blocks never gets an insert
            // between its branches, keep the full znode and open a
            // fresh sibling for the new branch alone.
            if level == 0 && n == fanout && zbr.key.to_type() == KeyType::Data {
                let key1 = self.arena.get(zid).branches[n - 1].key;
                appending = key1.to_ino() == zbr.key.to_ino()
                    && key1.to_type() == KeyType::Data
                    && key1.to_block() == zbr.key.to_block().wrapping_sub(1);
            }

            let (mut keep, mut moved) = if appending {
                (fanout, 0)
            } else {
                ((fanout + 1) / 2, fanout - (fanout + 1) / 2)
            };

            let into_existing = n < keep;
            if into_existing {
                moved += 1;
                keep -= 1;
            } else {
                n -= keep;
            }

            let moved_branches = self.arena.get_mut(zid).branches.split_off(keep);
            debug_assert!(moved_branches.len() == moved);

            let zn = {
                let mut znode = Znode::new(level, fanout);
                znode.parent = zp;
                znode.branches = moved_branches;
                znode.dirty = true;
                self.arena.alloc(znode)
            };
            self.n_dirty += 1;

            if level != 0 {
                let kids: Vec<(usize, Zid)> = self
                    .arena
                    .get(zn)
                    .branches
                    .iter()
                    .enumerate()
                    .filter_map(|(i, zbr)| zbr.child.map(|c| (i, c)))
                    .collect();
                for (i, child) in kids {
                    let child = self.arena.get_mut(child);
                    child.parent = Some(zn);
                    child.iip = i;
                }
            }

            trace!(target: "tncache", "moving {}, keeping {}", moved, keep);

            let zi = if into_existing { zid } else { zn };
            self.insert_slot(zi, zbr, n);

            match zp {
                Some(zp) => {
                    // insert the new sibling into the parent
                    let i = n;
                    let iip = self.arena.get(zid).iip;
                    n = iip + 1;
                    if appending && n != fanout {
                        appending = false;
                    }
                    if i == 0 && zi == zid && iip == 0 {
                        self.correct_parent_keys(zid);
                    }
                    zbr = Zbranch::new(self.arena.get(zn).branches[0].key, 0, 0, 0);
                    zbr.child = Some(zn);
                    zid = zp;
                }
                None => {
                    // split reached the root, grow the tree by one
                    trace!(target: "tncache", "creating new zroot at level {}", level + 1);
                    let zi = {
                        let mut root = Znode::new(level + 1, fanout);
                        root.dirty = true;
                        let mut left =
                            Zbranch::new(self.arena.get(zid).branches[0].key, 0, 0, 0);
                        // the old root keeps its on-flash image
                        left.lnum = self.zroot.lnum;
                        left.offs = self.zroot.offs;
                        left.len = self.zroot.len;
                        left.child = Some(zid);
                        let mut right =
                            Zbranch::new(self.arena.get(zn).branches[0].key, 0, 0, 0);
                        right.child = Some(zn);
                        root.branches.push(left);
                        root.branches.push(right);
                        self.arena.alloc(root)
                    };
                    self.n_dirty += 1;

                    self.zroot.clear_image();
                    self.zroot.child = Some(zi);

                    {
                        let zn = self.arena.get_mut(zn);
                        zn.parent = Some(zi);
                        zn.iip = 1;
                    }
                    {
                        let znode = self.arena.get_mut(zid);
                        znode.parent = Some(zi);
                        znode.iip = 0;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Delete the leaf branch at slot `n` of zero-level znode `zid`,
    /// collapsing emptied ancestors.
    pub(crate) fn delete_slot<F: Flash, L: LpropsStore>(
        &mut self,
        flash: &F,
        lprops: &L,
        zid: Zid,
        n: usize,
    ) -> Result<()> {
        {
            let znode = self.arena.get(zid);
            assert!(znode.level == 0);
            assert!(n < znode.child_cnt());
            trace!(target: "tncache", "deleting {}", znode.branches[n].key);
        }

        self.obsolete_branch(lprops, zid, n)?;
        self.arena.get_mut(zid).branches.remove(n);

        if self.arena.get(zid).child_cnt() > 0 {
            return Ok(());
        }
        if self.arena.get(zid).parent.is_none() {
            // the tree is empty now, keep the bare root
            return Ok(());
        }

        // the znode emptied, unlink it and every ancestor it empties
        let mut cur = zid;
        let mut slot;
        loop {
            let (zp, iip, on_list) = {
                let znode = self.arena.get(cur);
                assert!(!znode.obsolete);
                assert!(znode.dirty);
                (znode.parent, znode.iip, znode.cnext)
            };

            self.n_dirty -= 1;
            self.insert_old_idx_znode(cur)?;

            if on_list {
                // the commit still writes this snapshot
                self.arena.get_mut(cur).obsolete = true;
                self.n_clean += 1;
                CLEAN_ZN_CNT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            } else {
                self.arena.free(cur);
            }

            slot = iip;
            cur = match zp {
                Some(zp) => zp,
                None => {
                    // every level emptied, restart from a bare root
                    let mut root = Znode::new(0, self.config.fanout);
                    root.dirty = true;
                    let root = self.arena.alloc(root);
                    self.n_dirty += 1;
                    self.zroot = Zbranch::new(Key::lowest(0), 0, 0, 0);
                    self.zroot.child = Some(root);
                    return Ok(());
                }
            };

            if self.arena.get(cur).child_cnt() != 1 {
                break;
            }
        }

        // drop the emptied child's slot
        {
            let znode = self.arena.get_mut(cur);
            assert!(znode.level != 0);
            znode.branches.remove(slot);
        }
        let kids: Vec<(usize, Zid)> = self
            .arena
            .get(cur)
            .branches
            .iter()
            .enumerate()
            .skip(slot)
            .filter_map(|(i, zbr)| zbr.child.map(|c| (i, c)))
            .collect();
        for (i, child) in kids {
            self.arena.get_mut(child).iip = i;
        }

        // a root left with a single child pulls that child up
        if self.arena.get(cur).parent.is_none() {
            while self.arena.get(cur).child_cnt() == 1 && self.arena.get(cur).level != 0 {
                self.get_child(flash, cur, 0)?;
                let child = self.dirty_cow(lprops, Some(cur), 0)?;
                let (clnum, coffs, clen) = {
                    let zbr = &self.arena.get(cur).branches[0];
                    (zbr.lnum, zbr.offs, zbr.len)
                };
                {
                    let child = self.arena.get_mut(child);
                    child.parent = None;
                    child.iip = 0;
                }
                if self.zroot.len != 0 {
                    let (lnum, offs) = (self.zroot.lnum, self.zroot.offs);
                    self.insert_old_idx(lnum, offs)?;
                }
                self.zroot = Zbranch::new(self.arena.get(child).branches[0].key, clnum, coffs, clen);
                self.zroot.child = Some(child);

                let on_list = {
                    let zp = self.arena.get(cur);
                    assert!(!zp.obsolete);
                    assert!(zp.dirty);
                    zp.cnext
                };
                self.n_dirty -= 1;
                if on_list {
                    self.arena.get_mut(cur).obsolete = true;
                    self.n_clean += 1;
                    CLEAN_ZN_CNT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                } else {
                    self.arena.free(cur);
                }

                cur = child;
            }
        }

        Ok(())
    }

    // left_znode: the znode at the same level to the left, or None.
    fn left_znode<F: Flash>(&mut self, flash: &F, zid: Zid) -> Result<Option<Zid>> {
        let level = self.arena.get(zid).level;
        let mut cur = zid;
        loop {
            let (parent, iip) = {
                let znode = self.arena.get(cur);
                (znode.parent, znode.iip)
            };
            cur = match parent {
                Some(zp) => zp,
                None => return Ok(None),
            };
            if iip >= 1 {
                // go down the rightmost branch to `level`
                let mut down = self.get_child(flash, cur, iip - 1)?;
                while self.arena.get(down).level != level {
                    let last = self.arena.get(down).child_cnt() - 1;
                    down = self.get_child(flash, down, last)?;
                }
                return Ok(Some(down));
            }
        }
    }

    // right_znode: the znode at the same level to the right, or None.
    fn right_znode<F: Flash>(&mut self, flash: &F, zid: Zid) -> Result<Option<Zid>> {
        let level = self.arena.get(zid).level;
        let mut cur = zid;
        loop {
            let (parent, iip) = {
                let znode = self.arena.get(cur);
                (znode.parent, znode.iip)
            };
            cur = match parent {
                Some(zp) => zp,
                None => return Ok(None),
            };
            let nn = iip + 1;
            if nn < self.arena.get(cur).child_cnt() {
                // go down the leftmost branch to `level`
                let mut down = self.get_child(flash, cur, nn)?;
                while self.arena.get(down).level != level {
                    down = self.get_child(flash, down, 0)?;
                }
                return Ok(Some(down));
            }
        }
    }

    /// Find the znode whose image sits at `(lnum, offs)`, using `key`
    /// (the key of its first child) to steer the descent. The leftmost
    /// key of a dirty znode may have drifted since the image was
    /// written, so the neighbors are swept too for hashed keys.
    pub(crate) fn lookup_znode<F: Flash>(
        &mut self,
        flash: &F,
        key: &Key,
        level: usize,
        lnum: usize,
        offs: usize,
    ) -> Result<Option<Zid>> {
        let root = self.ensure_root(flash)?;

        if self.zroot.lnum == lnum && self.zroot.offs == offs {
            return Ok(Some(root));
        }
        if level >= self.arena.get(root).level {
            return Ok(None);
        }

        // descend to the parent level, level + 1
        let mut zid = root;
        let mut n;
        loop {
            let (slot, _) = self.arena.get(zid).search(key);
            n = slot;
            if n < 0 {
                // the leftmost key here is greater than `key`: the
                // same left-edge situation as in lookup_level0, look
                // one znode to the left before giving up
                zid = match self.left_znode(flash, zid)? {
                    Some(left) => left,
                    None => return Ok(None),
                };
                let (slot, _) = self.arena.get(zid).search(key);
                n = slot;
                assert!(n >= 0);
            }
            if self.arena.get(zid).level == level + 1 {
                break;
            }
            zid = self.get_child(flash, zid, n as usize)?;
        }

        let matches = |zbr: &Zbranch| zbr.lnum == lnum && zbr.offs == offs;

        if matches(&self.arena.get(zid).branches[n as usize]) {
            return Ok(Some(self.get_child(flash, zid, n as usize)?));
        }
        if !key.is_hashed() {
            return Ok(None);
        }

        // the key is not unique, sweep the neighbors on this level
        let (save_z, save_n) = (zid, n);

        // look left
        let (mut cz, mut cn) = (zid, n);
        loop {
            if cn > 0 {
                cn -= 1;
            } else {
                cz = match self.left_znode(flash, cz)? {
                    Some(left) => left,
                    None => break,
                };
                cn = self.arena.get(cz).child_cnt() as isize - 1;
            }
            if matches(&self.arena.get(cz).branches[cn as usize]) {
                return Ok(Some(self.get_child(flash, cz, cn as usize)?));
            }
            if self.arena.get(cz).branches[cn as usize].key < *key {
                break;
            }
        }

        // back to the middle, look right
        let (mut cz, mut cn) = (save_z, save_n);
        loop {
            cn += 1;
            if cn >= self.arena.get(cz).child_cnt() as isize {
                cz = match self.right_znode(flash, cz)? {
                    Some(right) => right,
                    None => break,
                };
                cn = 0;
            }
            if matches(&self.arena.get(cz).branches[cn as usize]) {
                return Ok(Some(self.get_child(flash, cz, cn as usize)?));
            }
            if self.arena.get(cz).branches[cn as usize].key > *key {
                break;
            }
        }

        Ok(None)
    }

    // is_leaf_in_tnc: whether the leaf node at (lnum, offs) is still
    // referred by some branch for `key`.
    fn is_leaf_in_tnc<F: Flash>(
        &mut self,
        flash: &F,
        key: &Key,
        lnum: usize,
        offs: usize,
    ) -> Result<bool> {
        let (found, zid, n) = self.lookup_level0(flash, key)?;
        if !found {
            return Ok(false);
        }
        let matches = |zbr: &Zbranch| zbr.lnum == lnum && zbr.offs == offs;
        if matches(&self.arena.get(zid).branches[n as usize]) {
            return Ok(true);
        }
        if !key.is_hashed() {
            return Ok(false);
        }

        // the key is not unique, look left and right as well
        let (mut cz, mut cn) = (zid, n);
        loop {
            match self.prev_branch(flash, cz, cn)? {
                None => break,
                Some((z, m)) => {
                    cz = z;
                    cn = m as isize;
                }
            }
            if self.arena.get(cz).branches[cn as usize].key != *key {
                break;
            }
            if matches(&self.arena.get(cz).branches[cn as usize]) {
                return Ok(true);
            }
        }
        let (mut cz, mut cn) = (zid, n);
        loop {
            match self.next_branch(flash, cz, cn)? {
                None => return Ok(false),
                Some((z, m)) => {
                    cz = z;
                    cn = m as isize;
                }
            }
            if self.arena.get(cz).branches[cn as usize].key != *key {
                break;
            }
            if matches(&self.arena.get(cz).branches[cn as usize]) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // Gather dirty znodes bottom-up, children before parents, the
    // order the commit writes them.
    fn collect_dirty(&self, zid: Zid, out: &mut Vec<Zid>) {
        let znode = self.arena.get(zid);
        if znode.level != 0 {
            for zbr in znode.branches.iter() {
                if let Some(child) = zbr.child {
                    self.collect_dirty(child, out);
                }
            }
        }
        if znode.dirty {
            out.push(zid);
        }
    }

    fn free_obsolete(&mut self, zid: Zid) {
        self.arena.free(zid);
        self.n_clean -= 1;
        CLEAN_ZN_CNT.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn walk_sub_tree<F, Z, B>(
        &mut self,
        flash: &F,
        zid: Zid,
        znode_cb: &mut Z,
        leaf_cb: &mut B,
    ) -> Result<()>
    where
        F: Flash,
        Z: FnMut(usize, usize) -> Result<()>,
        B: FnMut(&Key, usize, usize, usize) -> Result<()>,
    {
        thread::yield_now();

        let (level, child_cnt) = {
            let znode = self.arena.get(zid);
            (znode.level, znode.child_cnt())
        };
        znode_cb(level, child_cnt)?;

        if level == 0 {
            for n in 0..child_cnt {
                let zbr = &self.arena.get(zid).branches[n];
                leaf_cb(&zbr.key, zbr.lnum, zbr.offs, zbr.len)?;
            }
        } else {
            for n in 0..child_cnt {
                let child = self.get_child(flash, zid, n)?;
                self.walk_sub_tree(flash, child, znode_cb, leaf_cb)?;
            }
        }
        Ok(())
    }

    fn validate_sub_tree<F: Flash>(&mut self, flash: &F, zid: Zid) -> Result<()> {
        let (level, child_cnt) = {
            let znode = self.arena.get(zid);
            if znode.obsolete {
                return err_at!(Fatal, msg: "reachable znode is obsolete");
            }
            if znode.parent.is_none() && znode.child_cnt() == 0 && znode.level == 0 {
                return Ok(()); // bare root of an empty tree
            }
            if znode.child_cnt() == 0 || znode.child_cnt() > self.config.fanout {
                return err_at!(Fatal, msg: "bad child count {}", znode.child_cnt());
            }
            for i in 0..znode.child_cnt() - 1 {
                let (k1, k2) = (&znode.branches[i].key, &znode.branches[i + 1].key);
                if k1 > k2 {
                    return err_at!(Fatal, msg: "bad key order at slot {}", i);
                }
                if k1 == k2 && !k1.is_hashed() {
                    return err_at!(Fatal, msg: "equal non-hashed keys at slot {}", i);
                }
            }
            (znode.level, znode.child_cnt())
        };

        if level == 0 {
            return Ok(());
        }

        for n in 0..child_cnt {
            let child = self.get_child(flash, zid, n)?;
            {
                let key = self.arena.get(zid).branches[n].key;
                let child_znode = self.arena.get(child);
                if child_znode.parent != Some(zid) || child_znode.iip != n {
                    return err_at!(Fatal, msg: "bad parent link at slot {}", n);
                }
                if child_znode.level + 1 != level {
                    return err_at!(Fatal, msg: "bad level at slot {}", n);
                }
                // The separator is a lower bound for the child's keys.
                // Deleting a child's leftmost branch raises its first
                // key without refreshing the separator, so equality
                // holds only until the first such delete.
                if child_znode.branches[0].key < key {
                    return err_at!(
                        Fatal,
                        msg: "parent key {} above leftmost child key {}",
                        key, child_znode.branches[0].key
                    );
                }
            }
            self.validate_sub_tree(flash, child)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tree_test.rs"]
mod tree_test;
