//! Typed errors produced by [`crate::rewrite`].
//!
//! These are hand-rolled rather than derived with a macro, in keeping with the error types
//! elsewhere in this family of crates (`ParserError`, `StreamIndexIsNilError`,
//! `UnsupportedCompressionError`): a small `enum` with a manual `Display` and
//! `std::error::Error` impl, so callers that only want `anyhow::Error` can still get one via `?`.

use std::fmt;
use std::io;

/// Everything that can go wrong while rewriting a dedup stream.
#[derive(Debug)]
pub enum RedupError {
    /// The input channel does not support positioned (absolute-offset) reads.
    NotSeekable,
    /// A read or write against the underlying channel failed.
    Io(io::Error),
    /// The stream violates the record format: an unknown record kind, a short read in the
    /// middle of a record, a `BEGIN` record with the wrong magic, or a `WRITE_BYREF` whose
    /// resolved record is not a `WRITE` with matching identity fields.
    CorruptStream(String),
    /// A `WRITE_BYREF` named a `(guid, object, offset)` triple that was never inserted into the
    /// redup index by an earlier `WRITE` record.
    DanglingReference {
        guid: u64,
        object: u64,
        offset: u64,
    },
    /// Allocation failed while sizing the redup index or growing the payload buffer.
    OutOfMemory,
}

impl fmt::Display for RedupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedupError::NotSeekable => {
                write!(f, "input is not seekable; a dedup stream must be rewritten from a random-access file")
            }
            RedupError::Io(err) => write!(f, "I/O error: {err}"),
            RedupError::CorruptStream(msg) => write!(f, "corrupt stream: {msg}"),
            RedupError::DanglingReference {
                guid,
                object,
                offset,
            } => write!(
                f,
                "dangling back-reference: no WRITE record found for guid={guid:#x} object={object} offset={offset:#x}"
            ),
            RedupError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for RedupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RedupError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RedupError {
    fn from(err: io::Error) -> Self {
        RedupError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, RedupError>;
