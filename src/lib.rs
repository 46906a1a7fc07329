//! Package implement the in-memory indexing subsystem, called TNC or
//! tree-node-cache, of a log-structured file-system laid out on raw
//! flash media, along with the journal-replay procedure that rebuilds
//! the uncommitted part of the index at mount time.
//!
//! The media is organized as fixed-size logical-erase-blocks, LEB for
//! short. The on-flash index is a copy-on-write B+ tree whose leaves
//! refer file-system nodes by `(lnum, offs, len)` triplet. [tnc::Tnc]
//! caches pages of this tree, called znodes, loading them on demand and
//! mutating them in memory; a commit, driven externally, periodically
//! writes the dirty znodes back to flash. Refer [tnc] module for
//! details.
//!
//! Between commits, updates live in a journal of appended nodes. The
//! [replay] module scans the journal at mount time and re-applies its
//! effects, ordered by sequence-number, into the TNC and into the
//! per-LEB space accounting. Refer [replay] module for details.
//!
//! Media access and per-LEB accounting are consumed through the
//! [media::Flash] and [lprops::LpropsStore] traits, implemented by the
//! mounting layer. In-memory implementations [media::MemFlash] and
//! [lprops::MemLprops] are bundled for testing and experimentation.

use std::{error, fmt, result};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location.
#[derive(Clone, PartialEq)]
pub enum Error {
    Fatal(String, String),
    FailConvert(String, String),
    IOError(String, String),
    OutOfMemory(String, String),
    KeyNotFound(String, String),
    KeyExists(String, String),
    ReadOnly(String, String),
    PermissionDenied(String, String),
    Corrupted(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
            IOError(p, msg) => write!(f, "{} IOError: {}", p, msg),
            OutOfMemory(p, msg) => write!(f, "{} OutOfMemory: {}", p, msg),
            KeyNotFound(p, msg) => write!(f, "{} KeyNotFound: {}", p, msg),
            KeyExists(p, msg) => write!(f, "{} KeyExists: {}", p, msg),
            ReadOnly(p, msg) => write!(f, "{} ReadOnly: {}", p, msg),
            PermissionDenied(p, msg) => write!(f, "{} PermissionDenied: {}", p, msg),
            Corrupted(p, msg) => write!(f, "{} Corrupted: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}

#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err($crate::Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

pub mod config;
pub mod key;
pub mod lprops;
pub mod media;
pub mod node;
pub mod replay;
pub mod tnc;

pub use config::Config;
