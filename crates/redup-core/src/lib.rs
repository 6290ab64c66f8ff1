//! Rewrites a deduplicated ZFS-style replication stream (one produced by `zfs send -D`, carrying
//! `WRITE_BYREF` back-references into a redup table) into a plain, self-contained stream with
//! every back-reference resolved into an ordinary `WRITE` and the dedup feature flags cleared.
//!
//! The entry point is [`rewrite`]; see [`RewriteOptions`] for tuning the redup index's memory
//! budget and [`RewriteSummary`] for the tallies a caller typically wants to report.

mod checksum;
mod engine;
mod error;
mod index;
mod record;

pub use checksum::ZioChecksum;
pub use engine::{check_seekable, rewrite, RewriteOptions, RewriteSummary, FEATURE_DEDUP, FEATURE_DEDUP_PROPS, STREAM_MAGIC};
pub use error::{RedupError, Result};
pub use index::auto_memory_cap_bytes;
pub use record::{decode_header, encode_header, Record, RecordBody, RecordKind, HEADER_LEN};
