//! The on-wire record format: a fixed-size header (kind discriminant, a `BEGIN`-only payload
//! length, a kind-specific body area, and a trailing checksum slot) plus a variable-length
//! payload whose size is derived from the decoded header.
//!
//! The original format describes the body as a C `union` of kind-specific header structs. Here
//! it is modeled as a Rust `enum` ([`RecordBody`]) carrying the per-kind fields, reconstructed
//! from (and flattened back into) the fixed-size wire body area by [`decode_header`] and
//! [`encode_header`]. The wire layout itself — a fixed total header size with the checksum slot
//! pinned to the last 32 bytes — is unchanged.

use crate::checksum::ZioChecksum;
use crate::error::RedupError;
use zerocopy::byteorder::{LE, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size, in bytes, of the kind-specific body area within the fixed header.
const BODY_AREA_LEN: usize = 64;

#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C)]
struct RecordHeaderWire {
    kind: U64<LE>,
    /// Declared payload length; meaningful only for `BEGIN`.
    payload_len: U64<LE>,
    body: [u8; BODY_AREA_LEN],
    checksum: ZioChecksum,
}

/// Total on-wire size of a record header, including the trailing checksum slot.
pub const HEADER_LEN: usize = std::mem::size_of::<RecordHeaderWire>();

/// Byte offset of the checksum slot within the header. Pinned to the last 32 bytes, per the
/// wire format's invariant.
pub const CHECKSUM_SLOT_OFFSET: usize = HEADER_LEN - std::mem::size_of::<ZioChecksum>();

static_assertions::const_assert_eq!(
    CHECKSUM_SLOT_OFFSET,
    { std::mem::offset_of!(RecordHeaderWire, checksum) }
);
static_assertions::const_assert_eq!(HEADER_LEN, 112);

/// Rounds `n` up to the next multiple of 8.
pub fn round_up8(n: u64) -> u64 {
    (n + 7) & !7
}

/// The record kind discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Begin,
    End,
    Object,
    FreeObjects,
    Write,
    WriteByref,
    WriteEmbedded,
    Spill,
    Free,
    ObjectRange,
}

impl RecordKind {
    fn from_wire(code: u64) -> Option<RecordKind> {
        Some(match code {
            0 => RecordKind::Begin,
            1 => RecordKind::End,
            2 => RecordKind::Object,
            3 => RecordKind::FreeObjects,
            4 => RecordKind::Write,
            5 => RecordKind::WriteByref,
            6 => RecordKind::WriteEmbedded,
            7 => RecordKind::Spill,
            8 => RecordKind::Free,
            9 => RecordKind::ObjectRange,
            _ => return None,
        })
    }

    fn to_wire(self) -> u64 {
        match self {
            RecordKind::Begin => 0,
            RecordKind::End => 1,
            RecordKind::Object => 2,
            RecordKind::FreeObjects => 3,
            RecordKind::Write => 4,
            RecordKind::WriteByref => 5,
            RecordKind::WriteEmbedded => 6,
            RecordKind::Spill => 7,
            RecordKind::Free => 8,
            RecordKind::ObjectRange => 9,
        }
    }
}

/// Kind-specific record fields, reconstructed from the wire body area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordBody {
    Begin {
        magic: u64,
        versioninfo: u64,
        payload_len: u64,
    },
    /// No body fields. The sub-stream-terminal checksum lives in the record's trailing
    /// checksum slot, not in the body area; see [`crate::engine`] for how it is handled.
    End,
    Object {
        object: u64,
        toguid: u64,
        bonuslen: u32,
    },
    FreeObjects {
        toguid: u64,
        firstobj: u64,
        numobjs: u64,
    },
    Write {
        toguid: u64,
        object: u64,
        offset: u64,
        logical_size: u64,
        psize: u64,
        compression: u8,
        checksum_type: u8,
    },
    WriteByref {
        toguid: u64,
        object: u64,
        offset: u64,
        refguid: u64,
        refobject: u64,
        refoffset: u64,
    },
    WriteEmbedded {
        psize: u32,
    },
    Spill {
        object: u64,
        blksz: u32,
        psize: u32,
    },
    Free {
        object: u64,
        offset: u64,
        length: u64,
    },
    ObjectRange {
        firstblk: u64,
        numblks: u64,
    },
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Begin { .. } => RecordKind::Begin,
            RecordBody::End => RecordKind::End,
            RecordBody::Object { .. } => RecordKind::Object,
            RecordBody::FreeObjects { .. } => RecordKind::FreeObjects,
            RecordBody::Write { .. } => RecordKind::Write,
            RecordBody::WriteByref { .. } => RecordKind::WriteByref,
            RecordBody::WriteEmbedded { .. } => RecordKind::WriteEmbedded,
            RecordBody::Spill { .. } => RecordKind::Spill,
            RecordBody::Free { .. } => RecordKind::Free,
            RecordBody::ObjectRange { .. } => RecordKind::ObjectRange,
        }
    }

    /// The payload length implied by this record's kind and fields, per the wire format's
    /// per-kind payload size rules.
    pub fn payload_size(&self) -> u64 {
        match self {
            RecordBody::Begin { payload_len, .. } => *payload_len,
            RecordBody::Object { bonuslen, .. } => {
                if *bonuslen > 0 {
                    round_up8(*bonuslen as u64)
                } else {
                    0
                }
            }
            RecordBody::Spill { psize, .. } => round_up8(*psize as u64),
            RecordBody::Write { psize, .. } => *psize,
            RecordBody::WriteEmbedded { psize } => round_up8(*psize as u64),
            RecordBody::WriteByref { .. }
            | RecordBody::Free { .. }
            | RecordBody::FreeObjects { .. }
            | RecordBody::ObjectRange { .. }
            | RecordBody::End => 0,
        }
    }
}

/// A decoded record header: its kind-specific body, plus whatever the trailing checksum slot
/// held at the moment of decoding (zero for every non-`BEGIN` kind on a well-formed input,
/// except `END`, where a non-zero value is the transmitted sub-stream checksum).
#[derive(Clone, Copy, Debug)]
pub struct Record {
    pub body: RecordBody,
    pub checksum_slot: ZioChecksum,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }
}

/// Decodes a fixed-size header buffer into a [`Record`].
///
/// Fails with [`RedupError::CorruptStream`] if the kind discriminant is not one of the known
/// record kinds.
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<Record, RedupError> {
    let wire =
        RecordHeaderWire::read_from_bytes(buf.as_slice()).expect("buffer is exactly HEADER_LEN");
    let kind = RecordKind::from_wire(wire.kind.get()).ok_or_else(|| {
        RedupError::CorruptStream(format!("unknown record kind 0x{:x}", wire.kind.get()))
    })?;
    let body = decode_body(kind, wire.payload_len.get(), &wire.body)?;
    Ok(Record {
        body,
        checksum_slot: wire.checksum,
    })
}

fn decode_body(kind: RecordKind, payload_len: u64, body: &[u8; BODY_AREA_LEN]) -> Result<RecordBody, RedupError> {
    fn u64_at(buf: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }
    fn u32_at(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
    }

    Ok(match kind {
        RecordKind::Begin => RecordBody::Begin {
            magic: u64_at(body, 0),
            versioninfo: u64_at(body, 8),
            payload_len,
        },
        RecordKind::End => RecordBody::End,
        RecordKind::Object => RecordBody::Object {
            object: u64_at(body, 0),
            toguid: u64_at(body, 8),
            bonuslen: u32_at(body, 16),
        },
        RecordKind::FreeObjects => RecordBody::FreeObjects {
            toguid: u64_at(body, 0),
            firstobj: u64_at(body, 8),
            numobjs: u64_at(body, 16),
        },
        RecordKind::Write => RecordBody::Write {
            toguid: u64_at(body, 0),
            object: u64_at(body, 8),
            offset: u64_at(body, 16),
            logical_size: u64_at(body, 24),
            psize: u64_at(body, 32),
            compression: body[40],
            checksum_type: body[41],
        },
        RecordKind::WriteByref => RecordBody::WriteByref {
            toguid: u64_at(body, 0),
            object: u64_at(body, 8),
            offset: u64_at(body, 16),
            refguid: u64_at(body, 24),
            refobject: u64_at(body, 32),
            refoffset: u64_at(body, 40),
        },
        RecordKind::WriteEmbedded => RecordBody::WriteEmbedded {
            psize: u32_at(body, 0),
        },
        RecordKind::Spill => RecordBody::Spill {
            object: u64_at(body, 0),
            blksz: u32_at(body, 8),
            psize: u32_at(body, 12),
        },
        RecordKind::Free => RecordBody::Free {
            object: u64_at(body, 0),
            offset: u64_at(body, 8),
            length: u64_at(body, 16),
        },
        RecordKind::ObjectRange => RecordBody::ObjectRange {
            firstblk: u64_at(body, 0),
            numblks: u64_at(body, 8),
        },
    })
}

/// Encodes `record` into a fresh `HEADER_LEN`-byte buffer. The checksum slot is written exactly
/// as given in `record.checksum_slot`; callers that need the stamping protocol from the external
/// interface description (zero, fold, stamp, fold) should set `checksum_slot` accordingly before
/// calling this, which is what [`crate::engine`] does.
pub fn encode_header(record: &Record) -> [u8; HEADER_LEN] {
    let mut body_bytes = [0u8; BODY_AREA_LEN];
    let mut payload_len_field = 0u64;

    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    match &record.body {
        RecordBody::Begin {
            magic,
            versioninfo,
            payload_len,
        } => {
            put_u64(&mut body_bytes, 0, *magic);
            put_u64(&mut body_bytes, 8, *versioninfo);
            payload_len_field = *payload_len;
        }
        RecordBody::End => {}
        RecordBody::Object {
            object,
            toguid,
            bonuslen,
        } => {
            put_u64(&mut body_bytes, 0, *object);
            put_u64(&mut body_bytes, 8, *toguid);
            put_u32(&mut body_bytes, 16, *bonuslen);
        }
        RecordBody::FreeObjects {
            toguid,
            firstobj,
            numobjs,
        } => {
            put_u64(&mut body_bytes, 0, *toguid);
            put_u64(&mut body_bytes, 8, *firstobj);
            put_u64(&mut body_bytes, 16, *numobjs);
        }
        RecordBody::Write {
            toguid,
            object,
            offset,
            logical_size,
            psize,
            compression,
            checksum_type,
        } => {
            put_u64(&mut body_bytes, 0, *toguid);
            put_u64(&mut body_bytes, 8, *object);
            put_u64(&mut body_bytes, 16, *offset);
            put_u64(&mut body_bytes, 24, *logical_size);
            put_u64(&mut body_bytes, 32, *psize);
            body_bytes[40] = *compression;
            body_bytes[41] = *checksum_type;
        }
        RecordBody::WriteByref {
            toguid,
            object,
            offset,
            refguid,
            refobject,
            refoffset,
        } => {
            put_u64(&mut body_bytes, 0, *toguid);
            put_u64(&mut body_bytes, 8, *object);
            put_u64(&mut body_bytes, 16, *offset);
            put_u64(&mut body_bytes, 24, *refguid);
            put_u64(&mut body_bytes, 32, *refobject);
            put_u64(&mut body_bytes, 40, *refoffset);
        }
        RecordBody::WriteEmbedded { psize } => {
            put_u32(&mut body_bytes, 0, *psize);
        }
        RecordBody::Spill {
            object,
            blksz,
            psize,
        } => {
            put_u64(&mut body_bytes, 0, *object);
            put_u32(&mut body_bytes, 8, *blksz);
            put_u32(&mut body_bytes, 12, *psize);
        }
        RecordBody::Free {
            object,
            offset,
            length,
        } => {
            put_u64(&mut body_bytes, 0, *object);
            put_u64(&mut body_bytes, 8, *offset);
            put_u64(&mut body_bytes, 16, *length);
        }
        RecordBody::ObjectRange { firstblk, numblks } => {
            put_u64(&mut body_bytes, 0, *firstblk);
            put_u64(&mut body_bytes, 8, *numblks);
        }
    }

    let wire = RecordHeaderWire {
        kind: U64::new(record.kind().to_wire()),
        payload_len: U64::new(payload_len_field),
        body: body_bytes,
        checksum: record.checksum_slot,
    };
    let mut out = [0u8; HEADER_LEN];
    out.copy_from_slice(wire.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_record_round_trips() {
        let record = Record {
            body: RecordBody::Write {
                toguid: 1,
                object: 2,
                offset: 3,
                logical_size: 4096,
                psize: 512,
                compression: 1,
                checksum_type: 2,
            },
            checksum_slot: ZioChecksum::ZERO,
        };
        let bytes = encode_header(&record);
        let decoded = decode_header(&bytes).unwrap();
        assert_eq!(decoded.body, record.body);
        assert_eq!(decoded.body.payload_size(), 512);
    }

    #[test]
    fn begin_payload_len_is_carried_in_outer_field() {
        let record = Record {
            body: RecordBody::Begin {
                magic: 0x2f5bacbac,
                versioninfo: 7,
                payload_len: 17,
            },
            checksum_slot: ZioChecksum::ZERO,
        };
        let bytes = encode_header(&record);
        let decoded = decode_header(&bytes).unwrap();
        assert_eq!(decoded.body.payload_size(), 17);
    }

    #[test]
    fn unknown_kind_is_corrupt_stream() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..8].copy_from_slice(&99u64.to_le_bytes());
        assert!(matches!(
            decode_header(&bytes),
            Err(RedupError::CorruptStream(_))
        ));
    }

    #[test]
    fn write_embedded_payload_rounds_up_to_8() {
        let body = RecordBody::WriteEmbedded { psize: 13 };
        assert_eq!(body.payload_size(), 16);
    }

    #[test]
    fn write_embedded_payload_size_boundaries() {
        assert_eq!(RecordBody::WriteEmbedded { psize: 0 }.payload_size(), 0);
        assert_eq!(RecordBody::WriteEmbedded { psize: 1 }.payload_size(), 8);
        assert_eq!(RecordBody::WriteEmbedded { psize: 8 }.payload_size(), 8);
        assert_eq!(RecordBody::WriteEmbedded { psize: 9 }.payload_size(), 16);
    }

    #[test]
    fn object_with_zero_bonuslen_has_no_payload() {
        let body = RecordBody::Object {
            object: 1,
            toguid: 2,
            bonuslen: 0,
        };
        assert_eq!(body.payload_size(), 0);
    }
}
