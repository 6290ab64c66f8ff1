//! The main rewrite loop: walks a dedup stream record by record, resolves `WRITE_BYREF` back
//! references against the redup index, clears the dedup feature flags on `BEGIN`, and restamps
//! the running fletcher-4 checksum into each record's trailing checksum slot.
//!
//! Sequential reads are tracked with a self-managed cursor rather than relying on the channel's
//! own seek position, since resolving a `WRITE_BYREF` requires a positioned re-read that must not
//! disturb it; both kinds of read go through [`sync_file::ReadAt`], never through `std::io::Read`.

use std::io::Write;

use sync_file::ReadAt;
use tracing::{debug, trace, warn};

use crate::checksum::{Fletcher4, ZioChecksum};
use crate::error::{RedupError, Result};
use crate::index::{auto_memory_cap_bytes, RedupIndex};
use crate::record::{
    decode_header, encode_header, RecordBody, RecordKind, CHECKSUM_SLOT_OFFSET, HEADER_LEN,
};

/// Magic value a well-formed `BEGIN` record's body must carry.
pub const STREAM_MAGIC: u64 = 0x0000_0002_f5ba_cbac;

/// Bit cleared from `BEGIN`'s `versioninfo` field: "this stream still contains `WRITE_BYREF`
/// records that require a live dedup table to resolve."
pub const FEATURE_DEDUP: u64 = 1 << 2;
/// Bit cleared alongside [`FEATURE_DEDUP`]: "properties specific to the dedup'd send are present."
pub const FEATURE_DEDUP_PROPS: u64 = 1 << 3;

/// Tunables for [`rewrite`].
#[derive(Clone, Copy, Debug)]
pub struct RewriteOptions {
    /// Target memory budget for the redup index. Defaults to [`auto_memory_cap_bytes`].
    pub memory_cap_bytes: u64,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        RewriteOptions {
            memory_cap_bytes: auto_memory_cap_bytes(),
        }
    }
}

/// Tallies produced alongside the rewritten stream, for the CLI's verbose summary.
#[derive(Clone, Copy, Debug, Default)]
pub struct RewriteSummary {
    pub total_records: u64,
    pub write_byref_records: u64,
    pub index_memory_bytes: u64,
}

/// Checks that `file` supports positioned reads by probing its current seek position, the same
/// test the original tool applies before it will touch a dedup stream. A pipe or socket fails
/// this probe; a regular file (or anything else `lseek`-capable) passes.
///
/// This lives at the library boundary rather than inside [`rewrite`] itself, since `rewrite` is
/// generic over [`sync_file::ReadAt`] alone and has no seek position of its own to probe; callers
/// building a [`sync_file::RandomAccessFile`] from a [`std::fs::File`] should call this first.
pub fn check_seekable(file: &std::fs::File) -> Result<()> {
    use std::io::{Seek, SeekFrom};
    file.try_clone()?
        .seek(SeekFrom::Current(0))
        .map_err(|_| RedupError::NotSeekable)?;
    Ok(())
}

/// Running fletcher-4 state plus the bookkeeping the `BEGIN`/`END` boundaries reset.
struct StreamState {
    running: Fletcher4,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            running: Fletcher4::new(),
        }
    }

    fn reset(&mut self) {
        self.running.reset();
    }
}

/// Rewrites a deduplicated stream read from `input` into a plain stream written to `output`.
///
/// `input` must support positioned reads ([`sync_file::ReadAt`]); callers reading from a real file
/// should call [`check_seekable`] first, since this function has no seek position of its own to
/// probe and so cannot detect a pipe on its own.
pub fn rewrite<R: ReadAt, W: Write>(
    input: &R,
    output: &mut W,
    options: RewriteOptions,
) -> Result<RewriteSummary> {
    let mut index = RedupIndex::with_memory_cap(options.memory_cap_bytes);
    let mut state = StreamState::new();
    let mut summary = RewriteSummary::default();

    let mut seq_pos: u64 = 0;
    let mut payload_buf: Vec<u8> = Vec::new();

    loop {
        let mut header_bytes = [0u8; HEADER_LEN];
        let n = read_fully_or_eof(input, seq_pos, &mut header_bytes)?;
        if n == 0 {
            break;
        }
        if n != HEADER_LEN {
            return Err(RedupError::CorruptStream(
                "truncated record header at end of stream".into(),
            ));
        }

        let header_pos = seq_pos;
        seq_pos += HEADER_LEN as u64;

        let record = decode_header(&header_bytes)?;
        let original_slot = record.checksum_slot;
        summary.total_records += 1;

        let (mut body, payload): (RecordBody, &[u8]) = match record.body {
            RecordBody::Begin {
                magic,
                versioninfo,
                payload_len,
            } => {
                if magic != STREAM_MAGIC {
                    return Err(RedupError::CorruptStream(format!(
                        "BEGIN magic mismatch: got {magic:#x}, expected {STREAM_MAGIC:#x}"
                    )));
                }
                state.reset();
                let cleared = versioninfo & !(FEATURE_DEDUP | FEATURE_DEDUP_PROPS);
                if cleared != versioninfo {
                    debug!(versioninfo = %format!("{versioninfo:#x}"), cleared = %format!("{cleared:#x}"), "cleared dedup feature flags");
                }
                read_payload(input, &mut seq_pos, &mut payload_buf, payload_len)?;
                (
                    RecordBody::Begin {
                        magic,
                        versioninfo: cleared,
                        payload_len,
                    },
                    payload_buf.as_slice(),
                )
            }
            RecordBody::End => {
                read_payload(input, &mut seq_pos, &mut payload_buf, 0)?;
                (RecordBody::End, payload_buf.as_slice())
            }
            RecordBody::Object { .. } | RecordBody::Spill { .. } | RecordBody::WriteEmbedded { .. } => {
                let len = record.body.payload_size();
                read_payload(input, &mut seq_pos, &mut payload_buf, len)?;
                (record.body, payload_buf.as_slice())
            }
            RecordBody::FreeObjects { .. }
            | RecordBody::Free { .. }
            | RecordBody::ObjectRange { .. } => {
                read_payload(input, &mut seq_pos, &mut payload_buf, 0)?;
                (record.body, payload_buf.as_slice())
            }
            RecordBody::Write {
                toguid,
                object,
                offset,
                psize,
                ..
            } => {
                read_payload(input, &mut seq_pos, &mut payload_buf, psize)?;
                index.insert(toguid, object, offset, header_pos);
                (record.body, payload_buf.as_slice())
            }
            RecordBody::WriteByref {
                toguid,
                object,
                offset,
                refguid,
                refobject,
                refoffset,
            } => {
                let resolved = resolve_byref(
                    input,
                    &index,
                    refguid,
                    refobject,
                    refoffset,
                    &mut payload_buf,
                )?;
                summary.write_byref_records += 1;
                trace!(refguid, refobject, refoffset, "resolved WRITE_BYREF");
                let rewritten = RecordBody::Write {
                    toguid,
                    object,
                    offset,
                    logical_size: resolved.logical_size,
                    psize: resolved.psize,
                    compression: resolved.compression,
                    checksum_type: resolved.checksum_type,
                };
                (rewritten, payload_buf.as_slice())
            }
        };

        let kind = body.kind();
        let suppress_stamp = kind == RecordKind::End && original_slot.is_zero();

        if suppress_stamp {
            let out_record = crate::record::Record {
                body,
                checksum_slot: ZioChecksum::ZERO,
            };
            output.write_all(&encode_header(&out_record))?;
            warn!("package terminator END preserved with zero checksum");
        } else {
            stamp_and_emit(&mut state.running, &mut body, payload, output)?;
        }

        if kind == RecordKind::End {
            state.reset();
        }
    }

    summary.index_memory_bytes = index.memory_used_bytes();
    Ok(summary)
}

struct ResolvedWrite {
    logical_size: u64,
    psize: u64,
    compression: u8,
    checksum_type: u8,
}

/// Resolves a `WRITE_BYREF` against the index, then re-reads the referenced `WRITE` record's
/// header and payload at its stored offset. This positioned read never touches `seq_pos`.
fn resolve_byref<R: ReadAt>(
    input: &R,
    index: &RedupIndex,
    refguid: u64,
    refobject: u64,
    refoffset: u64,
    payload_buf: &mut Vec<u8>,
) -> Result<ResolvedWrite> {
    let target_pos = index
        .lookup(refguid, refobject, refoffset)
        .ok_or(RedupError::DanglingReference {
            guid: refguid,
            object: refobject,
            offset: refoffset,
        })?;

    let mut header_bytes = [0u8; HEADER_LEN];
    input.read_exact_at(&mut header_bytes, target_pos)?;
    let target = decode_header(&header_bytes)?;

    let RecordBody::Write {
        toguid,
        object,
        offset,
        logical_size,
        psize,
        compression,
        checksum_type,
    } = target.body
    else {
        return Err(RedupError::CorruptStream(
            "WRITE_BYREF resolved to a non-WRITE record".into(),
        ));
    };

    if toguid != refguid || object != refobject || offset != refoffset {
        return Err(RedupError::CorruptStream(
            "WRITE_BYREF resolved record has mismatched identity fields".into(),
        ));
    }

    payload_buf.resize(psize as usize, 0);
    input.read_exact_at(payload_buf, target_pos + HEADER_LEN as u64)?;

    Ok(ResolvedWrite {
        logical_size,
        psize,
        compression,
        checksum_type,
    })
}

/// Reads `len` bytes sequentially starting at `*seq_pos`, advancing it, and leaves them in
/// `buf` (resized to exactly `len`). Fails with `CorruptStream` on a short read.
fn read_payload<R: ReadAt>(input: &R, seq_pos: &mut u64, buf: &mut Vec<u8>, len: u64) -> Result<()> {
    buf.resize(len as usize, 0);
    if len == 0 {
        return Ok(());
    }
    let n = read_fully_or_eof(input, *seq_pos, buf)?;
    if n as u64 != len {
        return Err(RedupError::CorruptStream(format!(
            "truncated payload: expected {len} bytes, got {n}"
        )));
    }
    *seq_pos += len;
    Ok(())
}

fn read_fully_or_eof<R: ReadAt>(input: &R, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = input.read_at(&mut buf[total..], pos + total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Implements the checksum slot protocol: fold the header up to the slot, snapshot the running
/// checksum into the slot and fold the slot itself (skipped for `BEGIN`, which carries no
/// meaningful checksum and is left zero), then fold the payload. Every record's header and
/// payload bytes are folded unconditionally, `BEGIN` included: the running checksum must reflect
/// the whole stream from the start, or every checksum stamped into a later record is wrong. Both
/// folds happen before the bytes are written so the emitted header and the folded bytes agree.
fn stamp_and_emit<W: Write>(
    running: &mut Fletcher4,
    body: &mut RecordBody,
    payload: &[u8],
    out: &mut W,
) -> Result<()> {
    let is_begin = body.kind() == RecordKind::Begin;

    let mut record = crate::record::Record {
        body: *body,
        checksum_slot: ZioChecksum::ZERO,
    };

    let header_bytes = encode_header(&record);
    running.update(&header_bytes[..CHECKSUM_SLOT_OFFSET]);

    if is_begin {
        out.write_all(&header_bytes)?;
    } else {
        record.checksum_slot = running.snapshot();
        let stamped_bytes = encode_header(&record);
        running.update(&stamped_bytes[CHECKSUM_SLOT_OFFSET..]);
        out.write_all(&stamped_bytes)?;
    }

    if !payload.is_empty() {
        running.update(payload);
        out.write_all(payload)?;
    }

    *body = record.body;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn begin_record(versioninfo: u64) -> Record {
        Record {
            body: RecordBody::Begin {
                magic: STREAM_MAGIC,
                versioninfo,
                payload_len: 0,
            },
            checksum_slot: ZioChecksum::ZERO,
        }
    }

    fn write_record(toguid: u64, object: u64, offset: u64, psize: u64) -> Record {
        Record {
            body: RecordBody::Write {
                toguid,
                object,
                offset,
                logical_size: psize,
                psize,
                compression: 0,
                checksum_type: 0,
            },
            checksum_slot: ZioChecksum::ZERO,
        }
    }

    fn write_byref_record(toguid: u64, object: u64, offset: u64, refguid: u64, refobject: u64, refoffset: u64) -> Record {
        Record {
            body: RecordBody::WriteByref {
                toguid,
                object,
                offset,
                refguid,
                refobject,
                refoffset,
            },
            checksum_slot: ZioChecksum::ZERO,
        }
    }

    fn end_record(checksum_slot: ZioChecksum) -> Record {
        Record {
            body: RecordBody::End,
            checksum_slot,
        }
    }

    fn encode_all(records: &[(Record, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (record, payload) in records {
            buf.extend_from_slice(&encode_header(record));
            buf.extend_from_slice(payload);
        }
        buf
    }

    fn decode_all(bytes: &[u8]) -> Vec<(RecordBody, ZioChecksum)> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            let header: [u8; HEADER_LEN] = bytes[pos..pos + HEADER_LEN].try_into().unwrap();
            let record = decode_header(&header).unwrap();
            pos += HEADER_LEN;
            let len = record.body.payload_size() as usize;
            pos += len;
            out.push((record.body, record.checksum_slot));
        }
        out
    }

    #[test]
    fn begin_clears_dedup_feature_flags() {
        let input = encode_all(&[(begin_record(FEATURE_DEDUP | FEATURE_DEDUP_PROPS | 1), &[])]);
        let mut output = Vec::new();
        rewrite(&input, &mut output, RewriteOptions::default()).unwrap();
        let decoded = decode_all(&output);
        match decoded[0].0 {
            RecordBody::Begin { versioninfo, .. } => assert_eq!(versioninfo, 1),
            _ => panic!("expected BEGIN"),
        }
    }

    #[test]
    fn begin_magic_mismatch_is_corrupt_stream() {
        let mut record = begin_record(0);
        if let RecordBody::Begin { magic, .. } = &mut record.body {
            *magic = 0xdead;
        }
        let input = encode_all(&[(record, &[])]);
        let mut output = Vec::new();
        assert!(matches!(
            rewrite(&input, &mut output, RewriteOptions::default()),
            Err(RedupError::CorruptStream(_))
        ));
    }

    #[test]
    fn simple_write_byref_resolves_to_plain_write() {
        let write = write_record(1, 1, 0, 4);
        let byref = write_byref_record(1, 1, 100, 1, 1, 0);
        let input = encode_all(&[(write, b"abc\0"), (byref, &[])]);
        let mut output = Vec::new();
        let summary = rewrite(&input, &mut output, RewriteOptions::default()).unwrap();
        assert_eq!(summary.write_byref_records, 1);

        let decoded = decode_all(&output);
        assert_eq!(decoded.len(), 2);
        match &decoded[1].0 {
            RecordBody::Write { toguid, object, offset, psize, .. } => {
                assert_eq!((*toguid, *object, *offset, *psize), (1, 1, 100, 4));
            }
            other => panic!("expected resolved WRITE, got {other:?}"),
        }
    }

    #[test]
    fn dangling_byref_is_an_error() {
        let byref = write_byref_record(1, 1, 100, 9, 9, 9);
        let input = encode_all(&[(byref, &[])]);
        let mut output = Vec::new();
        assert!(matches!(
            rewrite(&input, &mut output, RewriteOptions::default()),
            Err(RedupError::DanglingReference { guid: 9, object: 9, offset: 9 })
        ));
    }

    #[test]
    fn package_terminator_end_with_zero_checksum_is_preserved() {
        let input = encode_all(&[(end_record(ZioChecksum::ZERO), &[])]);
        let mut output = Vec::new();
        rewrite(&input, &mut output, RewriteOptions::default()).unwrap();
        let decoded = decode_all(&output);
        assert!(decoded[0].1.is_zero());
    }

    #[test]
    fn substream_end_with_nonzero_checksum_is_restamped() {
        let input = encode_all(&[(end_record(ZioChecksum::from_words([1, 2, 3, 4])), &[])]);
        let mut output = Vec::new();
        rewrite(&input, &mut output, RewriteOptions::default()).unwrap();
        let decoded = decode_all(&output);
        assert!(!decoded[0].1.is_zero());
    }

    #[test]
    fn byref_in_second_substream_resolves_against_first_substreams_write() {
        let begin1 = begin_record(0);
        let write1 = write_record(1, 1, 0, 4);
        let end1 = end_record(ZioChecksum::from_words([1, 1, 1, 1]));
        let begin2 = begin_record(0);
        let byref = write_byref_record(2, 2, 0, 1, 1, 0);
        let end2 = end_record(ZioChecksum::ZERO);

        let input = encode_all(&[
            (begin1, &[]),
            (write1, b"aaaa"),
            (end1, &[]),
            (begin2, &[]),
            (byref, &[]),
            (end2, &[]),
        ]);
        let mut output = Vec::new();
        let summary = rewrite(&input, &mut output, RewriteOptions::default()).unwrap();
        assert_eq!(summary.write_byref_records, 1);

        let decoded = decode_all(&output);
        match &decoded[4].0 {
            RecordBody::Write {
                toguid,
                object,
                offset,
                psize,
                ..
            } => {
                assert_eq!((*toguid, *object, *offset, *psize), (2, 2, 0, 4));
            }
            other => panic!("expected resolved WRITE, got {other:?}"),
        }
    }

    #[test]
    fn running_checksum_resets_between_substreams() {
        fn one_substream() -> Vec<u8> {
            encode_all(&[
                (begin_record(0), &[]),
                (write_record(1, 1, 0, 4), b"aaaa"),
                (end_record(ZioChecksum::from_words([7, 7, 7, 7])), &[]),
            ])
        }
        let input = [one_substream(), one_substream()].concat();
        let mut output = Vec::new();
        rewrite(&input, &mut output, RewriteOptions::default()).unwrap();

        let decoded = decode_all(&output);
        assert_eq!(decoded.len(), 6);
        // Both substreams replay byte-identical BEGIN/WRITE/END records, so if the running
        // checksum actually resets at each END, the second substream's stamped checksums must
        // match the first's exactly rather than keep accumulating.
        assert_eq!(decoded[0].1, decoded[3].1);
        assert_eq!(decoded[1].1, decoded[4].1);
        assert_eq!(decoded[2].1, decoded[5].1);
    }

    #[test]
    fn package_terminator_follows_a_real_substream_end() {
        let input = encode_all(&[
            (begin_record(0), &[]),
            (write_record(1, 1, 0, 4), b"aaaa"),
            (end_record(ZioChecksum::from_words([7, 7, 7, 7])), &[]),
            (end_record(ZioChecksum::ZERO), &[]),
        ]);
        let mut output = Vec::new();
        rewrite(&input, &mut output, RewriteOptions::default()).unwrap();

        let decoded = decode_all(&output);
        assert_eq!(decoded.len(), 4);
        assert!(!decoded[2].1.is_zero(), "substream END should be restamped");
        assert!(decoded[3].1.is_zero(), "package terminator END should stay zero");
    }

    #[cfg(unix)]
    #[test]
    fn non_seekable_input_is_rejected() {
        use std::os::unix::io::{FromRawFd, IntoRawFd};

        let mut child = std::process::Command::new("cat")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .expect("spawn cat");
        let stdout = child.stdout.take().expect("piped stdout");
        let file = unsafe { std::fs::File::from_raw_fd(stdout.into_raw_fd()) };

        assert!(matches!(check_seekable(&file), Err(RedupError::NotSeekable)));

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn empty_input_produces_empty_output() {
        let input: Vec<u8> = Vec::new();
        let mut output = Vec::new();
        let summary = rewrite(&input, &mut output, RewriteOptions::default()).unwrap();
        assert_eq!(summary.total_records, 0);
        assert!(output.is_empty());
    }

    #[test]
    fn stamped_checksum_is_reproducible_from_scratch() {
        let write1 = write_record(1, 1, 0, 4);
        let write2 = write_record(2, 2, 0, 4);
        let input = encode_all(&[(write1, b"aaaa"), (write2, b"bbbb")]);
        let mut output = Vec::new();
        rewrite(&input, &mut output, RewriteOptions::default()).unwrap();

        let mut running = Fletcher4::new();
        let header1: [u8; HEADER_LEN] = output[0..HEADER_LEN].try_into().unwrap();
        running.update(&header1[..CHECKSUM_SLOT_OFFSET]);
        let record1 = decode_header(&header1).unwrap();
        let expected1 = running.snapshot();
        assert_eq!(record1.checksum_slot, expected1);
    }
}
