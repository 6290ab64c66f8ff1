//! The redup index: a size-bounded, open-chained hash table mapping `(guid, object, offset)` to
//! the byte offset in the input stream where the corresponding `WRITE` record begins.
//!
//! There is no eviction and no rehashing: offsets inserted early in the stream must remain valid
//! for as long as the index exists, so growing the bucket array mid-stream would only be a
//! performance improvement, never a correctness requirement (see the design notes on index
//! memory discipline).

use crate::checksum::bucket_hash;
use sysinfo::System;

/// Smallest allowed index memory budget, matching the smallest-possible cap on 32-bit hosts.
pub const MIN_MEMORY_CAP_BYTES: u64 = 128 * 1024 * 1024;

/// Fraction of physical memory the index is allowed to target, expressed as a percent.
const MEMORY_CAP_PERCENT: u64 = 20;

/// Size, in bytes, of one chained entry. Used only to compute `num_buckets`; the index does not
/// actually allocate entries in a flat array.
const ENTRY_SIZE: u64 = std::mem::size_of::<RedupEntry>() as u64;

struct RedupEntry {
    guid: u64,
    object: u64,
    offset: u64,
    stream_offset: u64,
    next: Option<Box<RedupEntry>>,
}

/// Computes the index memory cap the way the original tool does: 20% of physical memory, with a
/// floor of [`MIN_MEMORY_CAP_BYTES`]. On a 32-bit host the cap is fixed at the floor, since the
/// index cannot usefully address more than that via in-process pointers anyway.
pub fn auto_memory_cap_bytes() -> u64 {
    if cfg!(target_pointer_width = "32") {
        return MIN_MEMORY_CAP_BYTES;
    }

    let mut sys = System::new();
    sys.refresh_memory();
    let physical_bytes = sys.total_memory();
    let by_percent = physical_bytes / 100 * MEMORY_CAP_PERCENT;
    by_percent.max(MIN_MEMORY_CAP_BYTES)
}

/// Greatest power of two not exceeding `n`. `n == 0` yields 1 (a single-bucket table), which
/// keeps the index usable even with a degenerate memory cap.
fn round_down_pow2(n: u64) -> u64 {
    if n <= 1 {
        1
    } else {
        1u64 << (63 - n.leading_zeros())
    }
}

/// The open-chained hash index over `(guid, object, offset)`.
///
/// Each bucket head is an `Option<Box<RedupEntry>>`, which is pointer-sized (the `None` niche
/// costs nothing beyond the pointer), so the empty scaffold is `num_buckets * 8` bytes — the same
/// shape as the original's flat array of bucket-head pointers — rather than a per-bucket growable
/// `Vec`, whose own ptr/len/cap header would otherwise dominate the sizing budget before a single
/// entry is inserted.
pub struct RedupIndex {
    buckets: Vec<Option<Box<RedupEntry>>>,
    mask: u64,
    entry_count: u64,
}

impl RedupIndex {
    /// Creates an index sized so that `num_buckets * ENTRY_SIZE` targets `memory_cap_bytes`.
    /// This is a sizing target, not a hard limit: the table never refuses an insertion.
    pub fn with_memory_cap(memory_cap_bytes: u64) -> Self {
        let num_buckets = round_down_pow2((memory_cap_bytes / ENTRY_SIZE).max(1));
        RedupIndex {
            buckets: (0..num_buckets).map(|_| None).collect(),
            mask: num_buckets - 1,
            entry_count: 0,
        }
    }

    fn bucket_index(&self, guid: u64, object: u64, offset: u64) -> usize {
        (bucket_hash(guid, object, offset, 0) & self.mask) as usize
    }

    /// Inserts `(guid, object, offset) -> stream_offset`. The protocol inserts each triple at
    /// most once, but duplicates are accepted here too: the newest entry becomes its bucket's new
    /// head, so it is the one `lookup` finds first.
    pub fn insert(&mut self, guid: u64, object: u64, offset: u64, stream_offset: u64) {
        let idx = self.bucket_index(guid, object, offset);
        let next = self.buckets[idx].take();
        self.buckets[idx] = Some(Box::new(RedupEntry {
            guid,
            object,
            offset,
            stream_offset,
            next,
        }));
        self.entry_count += 1;
    }

    /// Looks up the stream offset of the `WRITE` record previously inserted under this triple.
    /// Returns `None` if no such entry was ever inserted — a protocol violation the caller
    /// should surface as [`crate::error::RedupError::DanglingReference`].
    pub fn lookup(&self, guid: u64, object: u64, offset: u64) -> Option<u64> {
        let idx = self.bucket_index(guid, object, offset);
        let mut cur = self.buckets[idx].as_deref();
        while let Some(entry) = cur {
            if entry.guid == guid && entry.object == object && entry.offset == offset {
                return Some(entry.stream_offset);
            }
            cur = entry.next.as_deref();
        }
        None
    }

    /// Number of entries ever inserted (for the verbose summary's memory estimate).
    pub fn len(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Approximate resident size of the index, for the verbose summary.
    pub fn memory_used_bytes(&self) -> u64 {
        self.entry_count * ENTRY_SIZE
    }
}
