//! Module implement the TNC, tree-node-cache.
//!
//! The on-flash index of the file-system is a B+ tree of index nodes;
//! the TNC caches those nodes in memory as `znodes`, one znode per
//! index node, loaded lazily as lookups descend the tree. Each znode
//! holds up to fanout-many `zbranches`, and a zbranch either points
//! down at a child znode or, at level zero, out at a leaf node, an
//! inode, data block or entry, by `(lnum, offs, len)`.
//!
//! Mutations run against the cache only: dirty znodes accumulate in
//! memory until an external commit writes them back. While a commit
//! is running the mutators copy-on-write any pinned znode they touch,
//! so the committed snapshot stays intact, and the positions of index
//! nodes obsoleted meanwhile are remembered in the old-index tree
//! until [Tnc::end_commit], because the previous on-flash index must
//! remain readable for recovery until the new one is complete.
//!
//! Hashed keys, directory and xattr entries, resolve equal-key runs
//! by comparing entry names; refer [Tnc::lookup_nm], [Tnc::add_nm]
//! and [Tnc::remove_nm]. Entry payloads read for such comparisons are
//! retained per-branch in the leaf-node-cache.

use std::sync::atomic::AtomicIsize;

mod collision;
mod lnc;
mod tree;
mod znode;

pub use tree::{in_range, Tnc};

// Process-wide count of clean znodes across every mounted instance.
// Feeds the memory shrinker; transient skew with the per-instance
// counters is acceptable.
pub(crate) static CLEAN_ZN_CNT: AtomicIsize = AtomicIsize::new(0);

/// Process-wide count of clean znodes, across all [Tnc] instances.
pub fn clean_znode_count() -> isize {
    CLEAN_ZN_CNT.load(std::sync::atomic::Ordering::Relaxed)
}

/// Statistics for a [Tnc] instance.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Number of znodes held in the cache.
    pub n_znodes: usize,
    /// Number of clean znodes.
    pub n_clean: usize,
    /// Number of dirty znodes.
    pub n_dirty: usize,
    /// Number of entries in the old-index tree.
    pub n_old_idx: usize,
    /// Bytes held by the leaf-node-cache.
    pub lnc_bytes: usize,
    /// Height of the tree, number of levels.
    pub height: usize,
}
