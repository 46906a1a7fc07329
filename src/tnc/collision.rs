// Hash-collision resolution.
//
// Hashed keys may collide: several entries with the same key can sit
// next to each other in the tree, possibly across znode boundaries.
// Whenever a lookup or mutation lands on a hashed key it must sweep
// the run of equal keys, comparing entry names, to find the one it
// actually means. Replay uses a fallible sweep that tolerates entries
// whose node has been garbage-collected off the media.

use log::debug;

use crate::{key::Key, media::Flash, node::DentNode, tnc::tree::Inner, tnc::znode::Zid, Result};

// Outcome of comparing the entry behind a zbranch against a name.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum NameOrd {
    Less,
    Matches,
    Greater,
    NotOnMedia,
}

impl Inner {
    // Compare the entry referred by branch (zid, n) against `name`,
    // reading it through the leaf-node-cache or from flash.
    fn matches_name<F: Flash>(
        &mut self,
        flash: &F,
        zid: Zid,
        n: usize,
        name: &[u8],
    ) -> Result<NameOrd> {
        let raw = self.read_leaf(flash, zid, n)?;
        let dent = DentNode::decode(&raw)?;
        Ok(match dent.name.as_slice().cmp(name) {
            std::cmp::Ordering::Less => NameOrd::Less,
            std::cmp::Ordering::Equal => NameOrd::Matches,
            std::cmp::Ordering::Greater => NameOrd::Greater,
        })
    }

    // Fallible flavor of matches_name: a dangling branch compares as
    // NotOnMedia instead of failing.
    fn fallible_matches_name<F: Flash>(
        &mut self,
        flash: &F,
        zid: Zid,
        n: usize,
        name: &[u8],
    ) -> Result<NameOrd> {
        let raw = match self.fallible_read_leaf(flash, zid, n)? {
            Some(raw) => raw,
            None => return Ok(NameOrd::NotOnMedia),
        };
        let dent = DentNode::decode(&raw)?;
        Ok(match dent.name.as_slice().cmp(name) {
            std::cmp::Ordering::Less => NameOrd::Less,
            std::cmp::Ordering::Equal => NameOrd::Matches,
            std::cmp::Ordering::Greater => NameOrd::Greater,
        })
    }

    /// Resolve a hashed-key collision by name, starting from the
    /// position `(zid, n)` that the keyed search landed on. Returns
    /// `(found, znode, slot)`; when not found, the position is the
    /// entry after which `name` would sort, slot -1 when that is the
    /// left edge of the leftmost znode.
    pub(crate) fn resolve_collision<F: Flash>(
        &mut self,
        flash: &F,
        key: &Key,
        zid: Zid,
        n: isize,
        name: &[u8],
    ) -> Result<(bool, Zid, isize)> {
        match self.matches_name(flash, zid, n as usize, name)? {
            NameOrd::Matches => return Ok((true, zid, n)),
            NameOrd::Greater => {
                // look left
                let (mut cz, mut cn) = (zid, n);
                loop {
                    match self.prev_branch(flash, cz, cn)? {
                        None => return Ok((false, cz, -1)),
                        Some((z, m)) => {
                            cz = z;
                            cn = m as isize;
                        }
                    }
                    if self.arena.get(cz).branches[cn as usize].key != *key {
                        return Ok((false, cz, cn));
                    }
                    match self.matches_name(flash, cz, cn as usize, name)? {
                        NameOrd::Less => return Ok((false, cz, cn)),
                        NameOrd::Matches => return Ok((true, cz, cn)),
                        NameOrd::Greater => (),
                        NameOrd::NotOnMedia => unreachable!(),
                    }
                }
            }
            NameOrd::Less => {
                // look right; remember the last entry that sorted
                // before `name`, it is the insert position on a miss
                let (mut best_z, mut best_n) = (zid, n);
                let (mut cz, mut cn) = (zid, n);
                loop {
                    match self.next_branch(flash, cz, cn)? {
                        None => return Ok((false, best_z, best_n)),
                        Some((z, m)) => {
                            cz = z;
                            cn = m as isize;
                        }
                    }
                    if self.arena.get(cz).branches[cn as usize].key != *key {
                        return Ok((false, best_z, best_n));
                    }
                    match self.matches_name(flash, cz, cn as usize, name)? {
                        NameOrd::Greater => return Ok((false, best_z, best_n)),
                        NameOrd::Matches => return Ok((true, cz, cn)),
                        NameOrd::Less => {
                            best_z = cz;
                            best_n = cn;
                        }
                        NameOrd::NotOnMedia => unreachable!(),
                    }
                }
            }
            NameOrd::NotOnMedia => unreachable!(),
        }
    }

    /// Fallible flavor of [Inner::resolve_collision], used while
    /// replaying the journal. A deletion entry may refer a node whose
    /// bud was garbage-collected before the commit completed; the
    /// branch still in the tree is then dangling. If the sweep never
    /// finds a definitive match but did meet a dangling branch, that
    /// branch is adopted as the intended target.
    pub(crate) fn fallible_resolve_collision<F: Flash>(
        &mut self,
        flash: &F,
        key: &Key,
        zid: Zid,
        n: isize,
        name: &[u8],
    ) -> Result<(bool, Zid, isize)> {
        let mut dangling: Option<(Zid, isize)> = None;
        let mut unsure = false;

        let first = self.fallible_matches_name(flash, zid, n as usize, name)?;
        if first == NameOrd::Matches {
            return Ok((true, zid, n));
        }
        if first == NameOrd::NotOnMedia {
            // Unlucky, a dangling branch straight away: no name to
            // steer by, so both directions must be swept.
            dangling = Some((zid, n));
            unsure = true;
            let zbr = &self.arena.get(zid).branches[n as usize];
            debug!(
                target: "tncache",
                "first dangling match LEB {}:{} len {} key {}",
                zbr.lnum, zbr.offs, zbr.len, key
            );
        }

        // result position, tracks the sweep like the caller's cursor
        let (mut rz, mut rn) = (zid, n);

        if first == NameOrd::Greater || unsure {
            // look left
            loop {
                match self.prev_branch(flash, rz, rn)? {
                    None => {
                        rn = -1;
                        break;
                    }
                    Some((z, m)) => {
                        rz = z;
                        rn = m as isize;
                    }
                }
                if self.arena.get(rz).branches[rn as usize].key != *key {
                    break;
                }
                match self.fallible_matches_name(flash, rz, rn as usize, name)? {
                    NameOrd::Less => break,
                    NameOrd::Matches => return Ok((true, rz, rn)),
                    NameOrd::NotOnMedia => dangling = Some((rz, rn)),
                    NameOrd::Greater => unsure = false, // definitive, target is left
                }
            }
        }

        if first == NameOrd::Less || unsure {
            // look right, from the original position
            rz = zid;
            rn = n;
            let (mut cz, mut cn) = (zid, n);
            loop {
                match self.next_branch(flash, cz, cn)? {
                    None => break,
                    Some((z, m)) => {
                        cz = z;
                        cn = m as isize;
                    }
                }
                if self.arena.get(cz).branches[cn as usize].key != *key {
                    break;
                }
                match self.fallible_matches_name(flash, cz, cn as usize, name)? {
                    NameOrd::Greater => break,
                    NameOrd::Matches => return Ok((true, cz, cn)),
                    NameOrd::Less => {
                        rz = cz;
                        rn = cn;
                    }
                    NameOrd::NotOnMedia => {
                        rz = cz;
                        rn = cn;
                        dangling = Some((cz, cn));
                    }
                }
            }
        }

        match dangling {
            None => Ok((false, rz, rn)),
            Some((dz, dn)) => {
                let zbr = &self.arena.get(dz).branches[dn as usize];
                debug!(
                    target: "tncache",
                    "dangling match LEB {}:{} len {} key {}",
                    zbr.lnum, zbr.offs, zbr.len, key
                );
                Ok((true, dz, dn))
            }
        }
    }

    /// Resolve a hashed-key collision when the exact media position
    /// of the wanted entry is known. Garbage collection replaces
    /// nodes it moved this way, no name reads needed.
    pub(crate) fn resolve_collision_directly<F: Flash>(
        &mut self,
        flash: &F,
        key: &Key,
        zid: Zid,
        n: isize,
        lnum: usize,
        offs: usize,
    ) -> Result<(bool, Zid, isize)> {
        let at = |inner: &Inner, z: Zid, m: isize| {
            let zbr = &inner.arena.get(z).branches[m as usize];
            zbr.lnum == lnum && zbr.offs == offs
        };

        if at(self, zid, n) {
            return Ok((true, zid, n));
        }

        // look left
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
            if at(self, cz, cn) {
                return Ok((true, cz, cn));
            }
        }

        // look right
        let (mut cz, mut cn) = (zid, n);
        loop {
            match self.next_branch(flash, cz, cn)? {
                None => return Ok((false, cz, cn)),
                Some((z, m)) => {
                    cz = z;
                    cn = m as isize;
                }
            }
            if self.arena.get(cz).branches[cn as usize].key != *key {
                return Ok((false, cz, cn));
            }
            if at(self, cz, cn) {
                return Ok((true, cz, cn));
            }
        }
    }
}
