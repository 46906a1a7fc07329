//! Module implement file-system geometry and tuning configuration.

/// Default logical-erase-block size, 128KB.
pub const LEB_SIZE: usize = 128 * 1024;
/// Default number of logical-erase-blocks on the media.
pub const LEB_CNT: usize = 1024;
/// Default minimum unit of I/O, NAND page size.
pub const MIN_IO_SIZE: usize = 2048;
/// Default fanout for the index tree, maximum number of branches
/// held by a single znode.
pub const FANOUT: usize = 8;
/// Default file-data block size.
pub const BLOCK_SIZE: usize = 4096;
/// Default number of journal heads.
pub const JHEAD_CNT: usize = 2;
/// Default number of LEBs reserved for the log.
pub const LOG_LEBS: usize = 4;
/// Default limit on journal size, in bytes, across all buds.
pub const MAX_BUD_BYTES: usize = 8 * LEB_SIZE;
/// Default budget for the leaf-node-cache, 256KB.
pub const LNC_LIMIT: usize = 256 * 1024;

/// First LEB of the log area. LEB 0 holds the superblock and LEB 1
/// onwards hold the log ring.
pub const LOG_LNUM: usize = 1;
/// Maximum depth of the index tree.
pub const MAX_LEVELS: usize = 512;
/// Maximum length of a directory/xattr entry name.
pub const MAX_NLEN: usize = 255;
/// Largest valid inode number.
pub const MAX_INUM: u32 = 0xFFFF_FFF0;
/// Sequence numbers at or beyond this watermark mean the file-system
/// reached the end of its life.
pub const SQNUM_WATERMARK: u64 = 0xFFFF_FFFF_FF00_0000;

/// Configuration for a mounted file-system instance.
///
/// Geometry values come from the media driver and the superblock;
/// tuning values have defaults that suit typical NAND parts. Use the
/// `set_*` methods to adjust.
#[derive(Clone, Debug)]
pub struct Config {
    /// Uniquely name this file-system instance.
    pub name: String,
    /// Size of a logical-erase-block in bytes.
    ///
    /// Default: [LEB_SIZE]
    pub leb_size: usize,
    /// Total number of logical-erase-blocks.
    ///
    /// Default: [LEB_CNT]
    pub leb_cnt: usize,
    /// First LEB of the main area. LEBs below this hold the log and
    /// the on-flash lprops tables.
    pub main_first: usize,
    /// Minimum unit of I/O; reference-node offsets are aligned to it.
    ///
    /// Default: [MIN_IO_SIZE]
    pub min_io_size: usize,
    /// Fanout of the index tree.
    ///
    /// Default: [FANOUT]
    pub fanout: usize,
    /// File-data block size.
    ///
    /// Default: [BLOCK_SIZE]
    pub block_size: usize,
    /// Number of journal heads.
    ///
    /// Default: [JHEAD_CNT]
    pub jhead_cnt: usize,
    /// Number of LEBs in the log ring, starting at [LOG_LNUM].
    ///
    /// Default: [LOG_LEBS]
    pub log_lebs: usize,
    /// Journal size limit in bytes.
    ///
    /// Default: [MAX_BUD_BYTES]
    pub max_bud_bytes: usize,
    /// Largest byte size an inode can grow to.
    pub max_inode_sz: u64,
    /// Byte budget for the leaf-node-cache.
    ///
    /// Default: [LNC_LIMIT]
    pub lnc_limit: usize,
}

impl Config {
    /// Create a new configuration value, use the `set_*` methods to
    /// add more configuration.
    pub fn new(name: &str) -> Config {
        Config {
            name: name.to_string(),
            leb_size: LEB_SIZE,
            leb_cnt: LEB_CNT,
            main_first: LOG_LNUM + LOG_LEBS,
            min_io_size: MIN_IO_SIZE,
            fanout: FANOUT,
            block_size: BLOCK_SIZE,
            jhead_cnt: JHEAD_CNT,
            log_lebs: LOG_LEBS,
            max_bud_bytes: MAX_BUD_BYTES,
            max_inode_sz: 1 << 40,
            lnc_limit: LNC_LIMIT,
        }
    }

    /// Configure media geometry, typically read off the device driver.
    pub fn set_geometry(&mut self, leb_size: usize, leb_cnt: usize) -> &mut Self {
        self.leb_size = leb_size;
        self.leb_cnt = leb_cnt;
        self
    }

    /// Configure minimum unit of I/O.
    pub fn set_min_io_size(&mut self, min_io_size: usize) -> &mut Self {
        self.min_io_size = min_io_size;
        self
    }

    /// Configure the log ring and the start of the main area.
    pub fn set_log(&mut self, log_lebs: usize, main_first: usize) -> &mut Self {
        self.log_lebs = log_lebs;
        self.main_first = main_first;
        self
    }

    /// Configure the fanout of the index tree. Value comes from the
    /// superblock and must match the on-flash index.
    pub fn set_fanout(&mut self, fanout: usize) -> &mut Self {
        self.fanout = fanout;
        self
    }

    /// Configure number of journal heads.
    pub fn set_jhead_cnt(&mut self, jhead_cnt: usize) -> &mut Self {
        self.jhead_cnt = jhead_cnt;
        self
    }

    /// Configure journal size limit.
    pub fn set_max_bud_bytes(&mut self, max_bud_bytes: usize) -> &mut Self {
        self.max_bud_bytes = max_bud_bytes;
        self
    }

    /// Configure the leaf-node-cache byte budget.
    pub fn set_lnc_limit(&mut self, lnc_limit: usize) -> &mut Self {
        self.lnc_limit = lnc_limit;
        self
    }
}

impl Config {
    /// Maximum size of an index node on media, for this fanout.
    pub fn max_idx_node_sz(&self) -> usize {
        crate::node::IDX_SZ + (self.fanout * crate::node::BRANCH_SZ)
    }
}
