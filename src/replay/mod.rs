//! Module implement journal replay.
//!
//! At mount time the on-flash index describes the file-system as of
//! the last commit; everything appended to the journal after that
//! lives only in buds referred from the log. [replay_journal] scans
//! the log ring, scans every bud it refers, orders the scanned nodes
//! by sequence number and applies them into the [crate::tnc::Tnc],
//! updating the per-LEB space accounting along the way. After replay
//! the in-memory state matches the moment the file-system stopped
//! writing.

mod entry;
mod replay;

pub use entry::Bud;
pub use replay::{replay_journal, Journal, ReplayStats, SizeAccum};
