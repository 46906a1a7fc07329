//! Module implement the media seam.
//!
//! The TNC and the replay engine never touch flash directly, they
//! consume the [Flash] trait: raw in-LEB reads, LEB scanning and
//! journal-head write-buffer positioning. The mounting layer supplies
//! the implementation; [MemFlash], an array-of-LEBs in memory, is
//! bundled for tests and experimentation.

use log::{debug, trace};

use std::sync::Mutex;

use crate::{
    node::{self, NodeType},
    Config, Result,
};

/// One node located by scanning a LEB.
#[derive(Clone, Debug)]
pub struct ScanNode {
    pub typ: NodeType,
    pub offs: usize,
    pub len: usize,
    pub sqnum: u64,
    pub raw: Vec<u8>,
}

/// Result of scanning a LEB from some offset: the located nodes, in
/// media order, and the end of data. `endpt` is where the next append
/// to this LEB would land.
#[derive(Clone, Debug)]
pub struct ScanLeb {
    pub lnum: usize,
    pub endpt: usize,
    pub nodes: Vec<ScanNode>,
}

/// Trait abstracting the flash media.
///
/// Implementations must serve reads for regions that are still
/// sitting in a journal-head write-buffer from memory, the caller
/// cannot tell buffered and persisted bytes apart.
pub trait Flash {
    /// Read `len` bytes at `(lnum, offs)`.
    fn leb_read(&self, lnum: usize, offs: usize, len: usize) -> Result<Vec<u8>>;

    /// Scan LEB `lnum` from `offs` for nodes. Scanning stops at
    /// erased space; anything else that fails to parse is corruption.
    fn scan(&self, lnum: usize, offs: usize) -> Result<ScanLeb>;

    /// Recovery flavor of [Flash::scan]: an unparseable tail is
    /// treated as a torn write and ends the scan cleanly.
    fn recover_scan(&self, lnum: usize, offs: usize) -> Result<ScanLeb>;

    /// Position journal head `jhead`'s write-buffer at `(lnum, offs)`
    /// so subsequent journal appends continue there.
    fn wbuf_seek(&self, jhead: usize, lnum: usize, offs: usize) -> Result<()>;
}

// Erased flash reads back as all-ones.
const ERASED: u8 = 0xFF;

struct Leb {
    buf: Vec<u8>,
    end: usize, // append cursor, 8-byte aligned
}

/// In-memory implementation of [Flash].
///
/// Each LEB is a byte buffer initialized to the erased pattern with an
/// append cursor. Test-suites compose index images and journals with
/// [MemFlash::append] and run the real scan and replay paths over
/// them.
pub struct MemFlash {
    leb_size: usize,
    lebs: Mutex<Vec<Leb>>,
    wbuf: Mutex<Option<(usize, usize, usize)>>, // (jhead, lnum, offs)
}

impl MemFlash {
    pub fn new(config: &Config) -> MemFlash {
        let lebs = (0..config.leb_cnt)
            .map(|_| Leb {
                buf: vec![ERASED; config.leb_size],
                end: 0,
            })
            .collect();
        MemFlash {
            leb_size: config.leb_size,
            lebs: Mutex::new(lebs),
            wbuf: Mutex::new(None),
        }
    }

    /// Append an encoded node to LEB `lnum`, return `(offs, len)` of
    /// where it landed. Nodes are placed at 8-byte alignment.
    pub fn append(&self, lnum: usize, node: &[u8]) -> Result<(usize, usize)> {
        let mut lebs = self.lebs.lock().unwrap();
        let leb = match lebs.get_mut(lnum) {
            Some(leb) => leb,
            None => return err_at!(IOError, msg: "append, no LEB {}", lnum),
        };
        let offs = leb.end;
        if offs + node.len() > self.leb_size {
            return err_at!(IOError, msg: "LEB {} full at {}", lnum, offs);
        }
        leb.buf[offs..offs + node.len()].copy_from_slice(node);
        leb.end = node::align8(offs + node.len());
        Ok((offs, node.len()))
    }

    /// Overwrite bytes at `(lnum, offs)` without moving the append
    /// cursor. For composing torn and corrupt images in tests.
    pub fn write_at(&self, lnum: usize, offs: usize, bytes: &[u8]) -> Result<()> {
        let mut lebs = self.lebs.lock().unwrap();
        let leb = match lebs.get_mut(lnum) {
            Some(leb) => leb,
            None => return err_at!(IOError, msg: "write_at, no LEB {}", lnum),
        };
        if offs + bytes.len() > self.leb_size {
            return err_at!(IOError, msg: "write past LEB {} end", lnum);
        }
        leb.buf[offs..offs + bytes.len()].copy_from_slice(bytes);
        leb.end = leb.end.max(node::align8(offs + bytes.len()));
        Ok(())
    }

    /// Erase LEB `lnum` back to the all-ones pattern.
    pub fn erase(&self, lnum: usize) -> Result<()> {
        let mut lebs = self.lebs.lock().unwrap();
        match lebs.get_mut(lnum) {
            Some(leb) => {
                leb.buf.iter_mut().for_each(|b| *b = ERASED);
                leb.end = 0;
                Ok(())
            }
            None => err_at!(IOError, msg: "erase, no LEB {}", lnum),
        }
    }

    /// Where the journal-head write-buffer was last positioned via
    /// [Flash::wbuf_seek], as `(jhead, lnum, offs)`.
    pub fn to_wbuf(&self) -> Option<(usize, usize, usize)> {
        *self.wbuf.lock().unwrap()
    }

    fn do_scan(&self, lnum: usize, mut offs: usize, recovering: bool) -> Result<ScanLeb> {
        let lebs = self.lebs.lock().unwrap();
        let leb = match lebs.get(lnum) {
            Some(leb) => leb,
            None => return err_at!(IOError, msg: "scan, no LEB {}", lnum),
        };

        debug!(target: "tncache", "scan LEB {}:{} recovering {}", lnum, offs, recovering);

        let mut nodes = vec![];
        offs = node::align8(offs);
        loop {
            if offs + node::CH_SZ > self.leb_size {
                break;
            }
            let region = &leb.buf[offs..];
            if region[..node::CH_SZ].iter().all(|b| *b == ERASED) {
                break; // erased space, end of data
            }
            let hdr = match node::decode_header(region) {
                Ok(hdr) => hdr,
                Err(err) if recovering => {
                    // torn write at the tail of the LEB
                    debug!(target: "tncache", "recovery stop LEB {}:{} ({})", lnum, offs, err);
                    break;
                }
                Err(err) => return Err(err),
            };
            trace!(
                target: "tncache",
                "scanned {:?} LEB {}:{} len {} sqnum {}",
                hdr.typ, lnum, offs, hdr.len, hdr.sqnum
            );
            if hdr.typ != NodeType::Pad {
                nodes.push(ScanNode {
                    typ: hdr.typ,
                    offs,
                    len: hdr.len,
                    sqnum: hdr.sqnum,
                    raw: region[..hdr.len].to_vec(),
                });
            }
            offs = node::align8(offs + hdr.len);
        }

        Ok(ScanLeb {
            lnum,
            endpt: offs,
            nodes,
        })
    }
}

impl Flash for MemFlash {
    fn leb_read(&self, lnum: usize, offs: usize, len: usize) -> Result<Vec<u8>> {
        let lebs = self.lebs.lock().unwrap();
        let leb = match lebs.get(lnum) {
            Some(leb) => leb,
            None => return err_at!(IOError, msg: "read, no LEB {}", lnum),
        };
        if offs + len > self.leb_size {
            return err_at!(IOError, msg: "read past LEB {} end {}+{}", lnum, offs, len);
        }
        Ok(leb.buf[offs..offs + len].to_vec())
    }

    fn scan(&self, lnum: usize, offs: usize) -> Result<ScanLeb> {
        self.do_scan(lnum, offs, false /*recovering*/)
    }

    fn recover_scan(&self, lnum: usize, offs: usize) -> Result<ScanLeb> {
        self.do_scan(lnum, offs, true /*recovering*/)
    }

    fn wbuf_seek(&self, jhead: usize, lnum: usize, offs: usize) -> Result<()> {
        trace!(target: "tncache", "wbuf seek head {} to LEB {}:{}", jhead, lnum, offs);
        *self.wbuf.lock().unwrap() = Some((jhead, lnum, offs));
        Ok(())
    }
}
