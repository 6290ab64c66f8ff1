//! The checksum primitives the rewriter treats as external collaborators.
//!
//! Neither of these algorithms is available from a published crate in the exact form this
//! protocol needs (ZFS's native fletcher-4 over 32-bit words, and a 4-input CityHash-style mix
//! used only to pick a hash bucket), so they live here as small, self-contained modules behind a
//! narrow interface, rather than as a vendored third-party dependency. [`Fletcher4`] exposes the
//! `update`/snapshot contract described for the checksum primitive; [`bucket_hash`] is used only
//! by [`crate::index::RedupIndex`] to place entries in a chain.

use zerocopy::byteorder::{LE, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// A 256-bit running checksum, laid out as four little-endian 64-bit words.
///
/// This is the on-wire shape of the checksum slot carried by every record, and also the
/// in-memory snapshot type produced by [`Fletcher4`].
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C)]
pub struct ZioChecksum {
    words: [U64<LE>; 4],
}

impl ZioChecksum {
    pub const ZERO: ZioChecksum = ZioChecksum {
        words: [U64::new(0); 4],
    };

    pub fn from_words(w: [u64; 4]) -> Self {
        ZioChecksum {
            words: [
                U64::new(w[0]),
                U64::new(w[1]),
                U64::new(w[2]),
                U64::new(w[3]),
            ],
        }
    }

    pub fn words(&self) -> [u64; 4] {
        [
            self.words[0].get(),
            self.words[1].get(),
            self.words[2].get(),
            self.words[3].get(),
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.words().iter().all(|&w| w == 0)
    }
}

impl std::fmt::Debug for ZioChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let w = self.words();
        write!(
            f,
            "ZioChecksum({:016x}:{:016x}:{:016x}:{:016x})",
            w[0], w[1], w[2], w[3]
        )
    }
}

/// Incremental fletcher-4 state, folding 32-bit little-endian words of a byte stream.
///
/// `update` may be called any number of times with buffers of any length that is a multiple of
/// 4 bytes; the protocol never folds a record in chunks that aren't word-aligned, since every
/// record field and the checksum slot itself are multiples of 4 bytes.
#[derive(Clone, Copy, Default)]
pub struct Fletcher4 {
    a: u64,
    b: u64,
    c: u64,
    d: u64,
}

impl Fletcher4 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Folds `buf` into the running state, one 32-bit little-endian word at a time. Every field
    /// and the checksum slot itself are multiples of 4 bytes, so real record streams never
    /// exercise the trailing partial word; a final 1-3 byte remainder (possible for a `WRITE`
    /// payload of arbitrary length) is zero-padded before folding so `update` never panics.
    pub fn update(&mut self, buf: &[u8]) {
        let (mut a, mut b, mut c, mut d) = (self.a, self.b, self.c, self.d);
        let mut chunks = buf.chunks_exact(4);
        for word in &mut chunks {
            let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as u64;
            a = a.wrapping_add(w);
            b = b.wrapping_add(a);
            c = c.wrapping_add(b);
            d = d.wrapping_add(c);
        }
        let remainder = chunks.remainder();
        if !remainder.is_empty() {
            let mut last = [0u8; 4];
            last[..remainder.len()].copy_from_slice(remainder);
            let w = u32::from_le_bytes(last) as u64;
            a = a.wrapping_add(w);
            b = b.wrapping_add(a);
            c = c.wrapping_add(b);
            d = d.wrapping_add(c);
        }
        self.a = a;
        self.b = b;
        self.c = c;
        self.d = d;
    }

    pub fn snapshot(&self) -> ZioChecksum {
        ZioChecksum::from_words([self.a, self.b, self.c, self.d])
    }
}

/// A 4-input mixing hash, in the style of `cityhash4(guid, object, offset, 0)` used by the
/// original tool to pick a bucket in the redup index. It is not required to reproduce any
/// particular published CityHash variant bit-for-bit; it only needs to scatter
/// `(guid, object, offset)` triples evenly across `num_buckets`, and [`crate::index::RedupIndex`]
/// only ever asks for the low bits of the result.
pub fn bucket_hash(guid: u64, object: u64, offset: u64, seed: u64) -> u64 {
    const K0: u64 = 0xc3a5_c85c_97cb_3127;
    const K1: u64 = 0xb492_b66f_be98_f273;
    const K2: u64 = 0x9ae1_6a3b_2f90_404f;

    let mut h = seed ^ K0.wrapping_mul(16);
    h = mix(h, guid);
    h = mix(h, object);
    h = mix(h, offset);
    h = mix(h, K1);
    h ^ (h >> 29).wrapping_mul(K2)
}

fn mix(mut h: u64, v: u64) -> u64 {
    h ^= v.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h = h.rotate_right(31);
    h.wrapping_mul(0xc4ce_b9fe_1a85_ec53)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fletcher4_is_associative_over_concatenation() {
        let data: Vec<u8> = (0u32..64).flat_map(|w| w.to_le_bytes()).collect();

        let mut whole = Fletcher4::new();
        whole.update(&data);

        let (first, second) = data.split_at(100);
        let mut split = Fletcher4::new();
        split.update(first);
        split.update(second);

        assert_eq!(whole.snapshot(), split.snapshot());
    }

    #[test]
    fn fletcher4_zero_input_is_zero_checksum() {
        let f = Fletcher4::new();
        assert!(f.snapshot().is_zero());
    }

    #[test]
    fn bucket_hash_is_deterministic() {
        assert_eq!(
            bucket_hash(1, 2, 3, 0),
            bucket_hash(1, 2, 3, 0),
        );
    }

    #[test]
    fn bucket_hash_distinguishes_offsets() {
        assert_ne!(bucket_hash(1, 2, 3, 0), bucket_hash(1, 2, 4, 0));
    }
}
