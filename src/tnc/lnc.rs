//! Leaf-node-cache, LNC for short.
//!
//! Hashed keys force the TNC to read entry nodes for name comparison;
//! the LNC pins a copy of those bytes on the zbranch so collision
//! walks and readdir do not hit flash for every probe. Only
//! directory-entry and xattr-entry leaves are cached. The cache is a
//! hint: a skipped insert only costs a re-read later.

use log::trace;

use crate::{node::DentNode, tnc::znode::Zbranch, Result};

/// Cache `raw` on the zbranch. Skipped silently when the budget is
/// exhausted. The entry is validated first, caching a corrupt entry
/// would let later probes skip that validation.
pub fn add(zbr: &mut Zbranch, raw: &[u8], lnc_bytes: &mut usize, limit: usize) -> Result<()> {
    assert!(zbr.leaf.is_none());
    assert!(zbr.len != 0);

    if !zbr.key.is_hashed() {
        return Ok(());
    }

    DentNode::decode(raw)?;

    if *lnc_bytes + raw.len() > limit {
        trace!(target: "tncache", "lnc budget exhausted, skip caching {}", zbr.key);
        return Ok(());
    }

    *lnc_bytes += raw.len();
    zbr.leaf = Some(raw.to_vec());
    Ok(())
}

/// Cached bytes for this zbranch, if any.
pub fn lookup(zbr: &Zbranch) -> Option<&[u8]> {
    match &zbr.leaf {
        Some(leaf) => {
            assert!(zbr.len != 0);
            Some(leaf)
        }
        None => None,
    }
}

/// Drop this zbranch's cache entry. Must be called before the branch
/// is re-pointed or deleted.
pub fn free(zbr: &mut Zbranch, lnc_bytes: &mut usize) {
    if let Some(leaf) = zbr.leaf.take() {
        *lnc_bytes -= leaf.len();
    }
}
