// Journal replay.
//
// The journal is the log ring plus the buds it refers. The log holds
// commit-start nodes and reference nodes; each reference points at a
// bud, a segment of a main-area LEB filled with appended file-system
// nodes. Everything appended since the last commit is reconstructed
// here: scan the log for buds, scan every bud for nodes, order all of
// it by sequence number in the replay tree, then apply the entries
// into the TNC and rewrite the space accounting of every bud LEB.
//
// Replay runs serially at mount time, before anything else touches
// the TNC, and is all-or-nothing: a failure aborts the mount and the
// partially mutated cache is discarded with it.

use log::{debug, error, warn};

use std::{collections::BTreeMap, thread};

use crate::{
    config::{LOG_LNUM, SQNUM_WATERMARK},
    key::{Key, KeyType},
    lprops::{LpropsStore, LP_TAKEN},
    media::{Flash, ScanLeb, ScanNode},
    node::{self, CsNode, DataNode, DentNode, InoNode, NodeType, RefNode, TrunNode},
    replay::entry::{Bud, BudEntry, Payload, ReplayEntry},
    tnc::Tnc,
    Config, Result,
};

/// Per-entry callback used while recovering from an unclean unmount,
/// feeds the inode-size reconciliation done after replay.
pub type SizeAccum<'a> = &'a mut dyn FnMut(&Key, bool, u64) -> Result<()>;

/// Journal state of a mounted file-system: the log-head cursor, the
/// bud set and the counters replay derives.
pub struct Journal {
    config: Config,

    /// Log head: where the next log append goes.
    pub lhead_lnum: usize,
    pub lhead_offs: usize,
    /// Index head: where the next index-node append goes.
    pub ihead_lnum: usize,
    pub ihead_offs: usize,
    /// Commit number of the last completed commit.
    pub cmt_no: u64,
    /// Sequence number of the commit-start node that opened the
    /// current commit epoch; zero until the log is scanned.
    pub cs_sqnum: u64,
    /// Highest sequence number met in the journal.
    pub max_sqnum: u64,
    /// Highest inode number referred by any replayed node.
    pub highest_inum: u32,
    /// Journal size across all buds, in bytes.
    pub bud_bytes: usize,
    /// Whether the file-system was not unmounted cleanly.
    pub need_recovery: bool,
    /// Whether the mount is read-write.
    pub writable: bool,

    buds: BTreeMap<usize, Bud>,
}

impl Journal {
    pub fn new(config: Config) -> Journal {
        Journal {
            lhead_lnum: LOG_LNUM,
            lhead_offs: 0,
            ihead_lnum: 0,
            ihead_offs: 0,
            cmt_no: 0,
            cs_sqnum: 0,
            max_sqnum: 0,
            highest_inum: 0,
            bud_bytes: 0,
            need_recovery: false,
            writable: true,
            buds: BTreeMap::new(),
            config,
        }
    }

    /// Configure the log head, read off the master node at mount.
    pub fn set_lhead(&mut self, lnum: usize, offs: usize) -> &mut Self {
        self.lhead_lnum = lnum;
        self.lhead_offs = offs;
        self
    }

    /// Configure the index head, read off the master node at mount.
    pub fn set_ihead(&mut self, lnum: usize, offs: usize) -> &mut Self {
        self.ihead_lnum = lnum;
        self.ihead_offs = offs;
        self
    }

    /// Configure the expected commit number.
    pub fn set_cmt_no(&mut self, cmt_no: u64) -> &mut Self {
        self.cmt_no = cmt_no;
        self
    }

    /// Mark this mount as recovering from an unclean unmount.
    pub fn set_need_recovery(&mut self, need_recovery: bool) -> &mut Self {
        self.need_recovery = need_recovery;
        self
    }

    /// Mark this mount read-only.
    pub fn set_readonly(&mut self) -> &mut Self {
        self.writable = false;
        self
    }

    /// Register a bud.
    pub fn add_bud(&mut self, bud: Bud) {
        self.bud_bytes += self.config.leb_size - bud.start;
        self.buds.insert(bud.lnum, bud);
    }

    /// Bud occupying LEB `lnum`, if any.
    pub fn search_bud(&self, lnum: usize) -> Option<&Bud> {
        self.buds.get(&lnum)
    }
}

/// Statistics summarizing a completed replay.
#[derive(Clone, Debug, Default)]
pub struct ReplayStats {
    pub n_entries: usize,
    pub n_buds: usize,
    pub max_sqnum: u64,
    pub highest_inum: u32,
}

/// Replay the journal into `tnc`, rebuilding the in-memory index
/// mutations and the per-LEB accounting that were written after the
/// last commit. `size_accum` is consulted only when
/// [Journal::need_recovery] is set.
pub fn replay_journal<F, L>(
    tnc: &Tnc<F, L>,
    journal: &mut Journal,
    mut size_accum: Option<SizeAccum>,
) -> Result<ReplayStats>
where
    F: Flash,
    L: LpropsStore,
{
    let config = journal.config.clone();

    take_ihead(tnc, journal, &config)?;

    debug!(target: "tncache", "start replaying the journal");
    tnc.set_replaying(true);
    let res = do_replay(tnc, journal, &config, &mut size_accum);
    tnc.set_replaying(false);

    match &res {
        Ok(stats) => debug!(
            target: "tncache",
            "replay finished, log head LEB {}:{}, max_sqnum {}, highest_inum {}",
            journal.lhead_lnum, journal.lhead_offs, stats.max_sqnum, stats.highest_inum
        ),
        Err(err) => error!(target: "tncache", "replay failed: {}", err),
    }
    res
}

// Mark the index head LEB taken, and cross-check the index-head
// offset against its free space.
fn take_ihead<F, L>(tnc: &Tnc<F, L>, journal: &Journal, config: &Config) -> Result<()>
where
    F: Flash,
    L: LpropsStore,
{
    let lprops = tnc.as_lprops();
    let lp = lprops.lookup_dirty(journal.ihead_lnum)?;
    lprops.change(journal.ihead_lnum, None, None, lp.flags | LP_TAKEN)?;

    if journal.ihead_offs != config.leb_size - lp.free {
        return err_at!(
            Corrupted,
            msg: "bad index head LEB {}:{}", journal.ihead_lnum, journal.ihead_offs
        );
    }
    Ok(())
}

fn do_replay<F, L>(
    tnc: &Tnc<F, L>,
    journal: &mut Journal,
    config: &Config,
    size_accum: &mut Option<SizeAccum>,
) -> Result<ReplayStats>
where
    F: Flash,
    L: LpropsStore,
{
    let mut bud_list: Vec<BudEntry> = vec![];
    let mut replay_tree: BTreeMap<u64, ReplayEntry> = BTreeMap::new();

    // The log is a logical ring of log_lebs LEBs starting at the log
    // head; walking it visits at most one full turn.
    let mut lnum = journal.lhead_lnum;
    let mut offs = journal.lhead_offs;
    for _i in 0..config.log_lebs {
        if lnum >= LOG_LNUM + config.log_lebs {
            lnum = LOG_LNUM;
            offs = 0;
        }
        let done = replay_log_leb(tnc, journal, config, lnum, offs, &mut bud_list)?;
        if done {
            break; // hit the end of the log
        }
        lnum += 1;
        offs = 0;
    }

    // scan the buds, in the order their refs were met
    for b in bud_list.iter() {
        let (free, dirty) = replay_bud(tnc, journal, config, b, &mut replay_tree)?;
        let entry = ReplayEntry {
            lnum: b.bud.lnum,
            offs: b.bud.start,
            len: 0,
            sqnum: b.sqnum,
            deletion: false,
            key: Key::highest(u32::MAX),
            payload: Payload::Bud { free, dirty },
        };
        insert_entry(journal, &mut replay_tree, entry)?;
    }

    // apply, in strict sequence-number order
    let n_entries = replay_tree.len();
    for (sqnum, entry) in replay_tree.iter() {
        thread::yield_now();
        tnc.set_replay_sqnum(*sqnum);
        apply_entry(tnc, config, journal.need_recovery, entry, size_accum)?;
    }

    if !journal.need_recovery && journal.bud_bytes > config.max_bud_bytes {
        warn!(
            target: "tncache",
            "journal is oversize, {} bytes of {}", journal.bud_bytes, config.max_bud_bytes
        );
    }

    Ok(ReplayStats {
        n_entries,
        n_buds: bud_list.len(),
        max_sqnum: journal.max_sqnum,
        highest_inum: journal.highest_inum,
    })
}

// Scan one log LEB for commit-start and reference nodes. Returns true
// when the logical end of the log has been reached.
fn replay_log_leb<F, L>(
    tnc: &Tnc<F, L>,
    journal: &mut Journal,
    config: &Config,
    lnum: usize,
    offs: usize,
    bud_list: &mut Vec<BudEntry>,
) -> Result<bool>
where
    F: Flash,
    L: LpropsStore,
{
    debug!(target: "tncache", "replay log LEB {}:{}", lnum, offs);

    let flash = tnc.as_flash();
    let sleb: ScanLeb = match flash.scan(lnum, offs) {
        Ok(sleb) => sleb,
        Err(err) if journal.need_recovery => {
            debug!(target: "tncache", "log scan failed ({}), retry recovering", err);
            flash.recover_scan(lnum, offs)?
        }
        Err(err) => return Err(err),
    };

    let first = match sleb.nodes.first() {
        Some(first) => first,
        None => return Ok(true), // empty LEB, end of log
    };

    if journal.cs_sqnum == 0 {
        // The first log record ever read must open the commit epoch:
        // a commit-start node carrying the expected commit number.
        // Its sqnum tells where the log logically ends, all older
        // records sort below it.
        if first.typ != NodeType::Cs {
            return err_at!(
                Corrupted, msg: "first log node at LEB {}:{} is not CS node", lnum, offs
            );
        }
        let cs = CsNode::decode(&first.raw)?;
        if cs.cmt_no != journal.cmt_no {
            return err_at!(
                Corrupted,
                msg: "first CS node at LEB {}:{} has commit number {} expected {}",
                lnum, offs, cs.cmt_no, journal.cmt_no
            );
        }
        journal.cs_sqnum = first.sqnum;
        debug!(target: "tncache", "commit start sqnum {}", journal.cs_sqnum);
    }

    if first.sqnum < journal.cs_sqnum {
        // Older log data: the LEB was part of the previous epoch and
        // has not been erased yet. This is the end of the log.
        return Ok(true);
    }

    // the first node must sit at offset zero of the LEB
    if first.offs != 0 {
        return err_at!(Corrupted, msg: "first node at LEB {} is not at zero offset", lnum);
    }

    for snod in sleb.nodes.iter() {
        thread::yield_now();

        // Track the highest sqnum before any sanity check, a later
        // mount must never reuse even a rejected one.
        if snod.sqnum > journal.max_sqnum {
            journal.max_sqnum = snod.sqnum;
        }

        if snod.sqnum >= SQNUM_WATERMARK {
            return err_at!(Corrupted, msg: "file-system's life ended");
        }
        if snod.sqnum < journal.cs_sqnum {
            return err_at!(
                Corrupted, msg: "bad sqnum {}, commit sqnum {}", snod.sqnum, journal.cs_sqnum
            );
        }

        match snod.typ {
            NodeType::Ref => {
                let rn = RefNode::decode(&snod.raw)?;
                if !validate_ref(journal, config, &rn)? {
                    continue; // already have this bud
                }
                let bud = Bud {
                    lnum: rn.lnum as usize,
                    start: rn.offs as usize,
                    jhead: rn.jhead as usize,
                };
                debug!(
                    target: "tncache",
                    "add replay bud LEB {}:{}, head {}", bud.lnum, bud.start, bud.jhead
                );
                journal.add_bud(bud.clone());
                bud_list.push(BudEntry {
                    bud,
                    sqnum: snod.sqnum,
                });
            }
            NodeType::Cs => {
                // only valid at the beginning of a LEB
                if snod.offs != 0 {
                    return err_at!(
                        Corrupted, msg: "unexpected CS node in log at LEB {}:{}", lnum, snod.offs
                    );
                }
            }
            typ => {
                return err_at!(
                    Corrupted, msg: "unexpected {:?} node in log at LEB {}:{}", typ, lnum, snod.offs
                )
            }
        }
    }

    if sleb.endpt != 0 || journal.lhead_offs >= config.leb_size {
        journal.lhead_lnum = lnum;
        journal.lhead_offs = sleb.endpt;
    }

    Ok(sleb.endpt == 0)
}

// Check a reference node read from the log. Returns false if a bud
// for the same LEB is already registered and this ref repeats it.
fn validate_ref(journal: &Journal, config: &Config, rn: &RefNode) -> Result<bool> {
    let (lnum, offs, jhead) = (rn.lnum as usize, rn.offs as usize, rn.jhead as usize);

    // offs may equal leb_size: a ref written for a journal head that
    // sits at the very end of its LEB.
    if jhead >= config.jhead_cnt
        || lnum >= config.leb_cnt
        || lnum < config.main_first
        || offs > config.leb_size
        || (offs % config.min_io_size) != 0
    {
        return err_at!(
            Corrupted, msg: "bad ref, LEB {}:{} jhead {}", lnum, offs, jhead
        );
    }

    match journal.search_bud(lnum) {
        Some(bud) if bud.jhead == jhead && bud.start <= offs => Ok(false),
        Some(_) => err_at!(Corrupted, msg: "bud at LEB {}:{} was already referred", lnum, offs),
        None => Ok(true),
    }
}

// Scan one bud and queue a replay entry for every node in it. Returns
// the amounts of free and dirty space for the bud's LEB.
fn replay_bud<F, L>(
    tnc: &Tnc<F, L>,
    journal: &mut Journal,
    config: &Config,
    b: &BudEntry,
    replay_tree: &mut BTreeMap<u64, ReplayEntry>,
) -> Result<(usize, usize)>
where
    F: Flash,
    L: LpropsStore,
{
    let (lnum, offs, jhead) = (b.bud.lnum, b.bud.start, b.bud.jhead);
    debug!(target: "tncache", "replay bud LEB {}:{}, head {}", lnum, offs, jhead);

    let flash = tnc.as_flash();
    let sleb = if journal.need_recovery {
        flash.recover_scan(lnum, offs)?
    } else {
        flash.scan(lnum, offs)?
    };

    // The bud region may hold padding, deletion entries and nodes
    // obsoleted by later nodes in the same LEB; all of that is dirty
    // space. Count the used bytes instead and derive the dirt.
    let mut used = 0;

    for snod in sleb.nodes.iter() {
        thread::yield_now();

        if snod.sqnum > journal.max_sqnum {
            journal.max_sqnum = snod.sqnum;
        }
        if snod.sqnum >= SQNUM_WATERMARK {
            return err_at!(Corrupted, msg: "file-system's life ended");
        }

        let entry = classify_bud_node(config, lnum, snod)?;
        if !entry.deletion {
            used += node::align8(entry.len);
        }
        insert_entry(journal, replay_tree, entry)?;
    }

    if sleb.endpt < offs + used {
        return err_at!(
            Corrupted, msg: "bud LEB {} endpt {} below used {}", lnum, sleb.endpt, used
        );
    }

    // Keep appending to this bud if at least one more write fits.
    if sleb.endpt + config.min_io_size <= config.leb_size && journal.writable {
        flash.wbuf_seek(jhead, lnum, sleb.endpt)?;
    }

    let dirty = sleb.endpt - offs - used;
    let free = config.leb_size - sleb.endpt;
    Ok((free, dirty))
}

// Decode one scanned bud node into a replay entry.
fn classify_bud_node(config: &Config, lnum: usize, snod: &ScanNode) -> Result<ReplayEntry> {
    let entry = match snod.typ {
        NodeType::Ino => {
            let ino = InoNode::decode(&snod.raw)?;
            ReplayEntry {
                lnum,
                offs: snod.offs,
                len: snod.len,
                sqnum: snod.sqnum,
                deletion: ino.nlink == 0,
                key: ino.key,
                payload: Payload::Sizes {
                    old_size: 0,
                    new_size: ino.size,
                },
            }
        }
        NodeType::Data => {
            let dn = DataNode::decode(&snod.raw)?;
            let new_size = u64::from(dn.size)
                + u64::from(dn.key.to_block()) * (config.block_size as u64);
            ReplayEntry {
                lnum,
                offs: snod.offs,
                len: snod.len,
                sqnum: snod.sqnum,
                deletion: false,
                key: dn.key,
                payload: Payload::Sizes {
                    old_size: 0,
                    new_size,
                },
            }
        }
        NodeType::Dent | NodeType::Xent => {
            let dent = DentNode::decode(&snod.raw)?;
            ReplayEntry {
                lnum,
                offs: snod.offs,
                len: snod.len,
                sqnum: snod.sqnum,
                deletion: dent.is_deletion(),
                key: dent.key,
                payload: Payload::Name(dent.name),
            }
        }
        NodeType::Trun => {
            let trun = TrunNode::decode(&snod.raw)?;
            if trun.old_size > config.max_inode_sz
                || trun.new_size > config.max_inode_sz
                || trun.old_size <= trun.new_size
            {
                return err_at!(
                    Corrupted,
                    msg: "bad truncation node at LEB {}:{}, {} -> {}",
                    lnum, snod.offs, trun.old_size, trun.new_size
                );
            }
            ReplayEntry {
                lnum,
                offs: snod.offs,
                len: snod.len,
                sqnum: snod.sqnum,
                deletion: true,
                key: Key::trun(trun.ino),
                payload: Payload::Sizes {
                    old_size: trun.old_size,
                    new_size: trun.new_size,
                },
            }
        }
        typ => {
            return err_at!(
                Corrupted,
                msg: "unexpected node type {:?} in bud LEB {}:{}", typ, lnum, snod.offs
            )
        }
    };
    Ok(entry)
}

// Queue `entry` on the replay tree, keyed by sqnum. Sequence numbers
// are globally unique, a duplicate means corruption.
fn insert_entry(
    journal: &mut Journal,
    replay_tree: &mut BTreeMap<u64, ReplayEntry>,
    entry: ReplayEntry,
) -> Result<()> {
    if !matches!(entry.payload, Payload::Bud { .. }) && entry.key.to_ino() >= journal.highest_inum
    {
        journal.highest_inum = entry.key.to_ino();
    }

    match replay_tree.insert(entry.sqnum, entry) {
        None => Ok(()),
        Some(old) => err_at!(Corrupted, msg: "duplicate sqnum {} in replay", old.sqnum),
    }
}

// Apply one replay entry to the TNC, or, for a bud reference, to the
// space accounting.
fn apply_entry<F, L>(
    tnc: &Tnc<F, L>,
    config: &Config,
    need_recovery: bool,
    r: &ReplayEntry,
    size_accum: &mut Option<SizeAccum>,
) -> Result<()>
where
    F: Flash,
    L: LpropsStore,
{
    if let Payload::Bud { free, dirty } = &r.payload {
        return set_bud_lprops(tnc, config, r, *free, *dirty);
    }

    if r.key.is_hashed() {
        let name = match &r.payload {
            Payload::Name(name) => name.as_slice(),
            _ => return err_at!(Fatal, msg: "entry {} without name", r),
        };
        if r.deletion {
            tnc.remove_nm(&r.key, name)?;
        } else {
            tnc.add_nm(r.key, r.lnum, r.offs, r.len, name)?;
        }
        return Ok(());
    }

    if r.deletion {
        match r.key.to_type() {
            KeyType::Inode => tnc.remove_ino(r.key.to_ino())?,
            KeyType::Trunc => trun_remove_range(tnc, config, r)?,
            _ => tnc.remove(&r.key)?,
        }
    } else {
        tnc.add(r.key, r.lnum, r.offs, r.len)?;
    }

    if need_recovery {
        if let Some(accum) = size_accum {
            accum(&r.key, r.deletion, r.new_size())?;
        }
    }
    Ok(())
}

// Apply a truncation: drop the data keys of every block beyond the
// new size. The boundary block survives when the new size ends
// within it.
fn trun_remove_range<F, L>(tnc: &Tnc<F, L>, config: &Config, r: &ReplayEntry) -> Result<()>
where
    F: Flash,
    L: LpropsStore,
{
    let (old_size, new_size) = match &r.payload {
        Payload::Sizes { old_size, new_size } => (*old_size, *new_size),
        _ => return err_at!(Fatal, msg: "entry {} without sizes", r),
    };
    let bs = config.block_size as u64;

    let mut min_blk = new_size / bs;
    if new_size % bs != 0 {
        min_blk += 1;
    }
    let mut max_blk = old_size / bs;
    if old_size % bs == 0 {
        max_blk -= 1;
    }

    let ino = r.key.to_ino();
    tnc.remove_range(
        &Key::data(ino, min_blk as u32),
        &Key::data(ino, max_blk as u32),
    )
}

// Install the replayed free and dirty space of a bud LEB. If the LEB
// was garbage-collected after the ref was written, its accounting no
// longer describes the pre-bud state; subtract what GC reclaimed.
fn set_bud_lprops<F, L>(
    tnc: &Tnc<F, L>,
    config: &Config,
    r: &ReplayEntry,
    free: usize,
    dirty: usize,
) -> Result<()>
where
    F: Flash,
    L: LpropsStore,
{
    let lprops = tnc.as_lprops();
    let lp = lprops.lookup_dirty(r.lnum)?;

    let mut prior_dirty = lp.dirty;
    if r.offs == 0 && (lp.free != config.leb_size || lp.dirty != 0) {
        debug!(
            target: "tncache",
            "bud LEB {} was GC'd ({} free, {} dirty)", r.lnum, lp.free, lp.dirty
        );
        // A partially rewritten LEB could drive this negative;
        // clamp, dirty space is never negative and the next commit
        // re-derives the authoritative value.
        let reclaimed = config.leb_size - lp.free;
        if reclaimed > prior_dirty {
            warn!(
                target: "tncache",
                "LEB {} lp: {} free {} dirty, replay: {} free {} dirty",
                r.lnum, lp.free, lp.dirty, free, dirty
            );
        }
        prior_dirty = prior_dirty.saturating_sub(reclaimed);
    }

    lprops.change(
        r.lnum,
        Some(free),
        Some(prior_dirty + dirty),
        lp.flags | LP_TAKEN,
    )
}

#[cfg(test)]
#[path = "replay_test.rs"]
mod replay_test;
