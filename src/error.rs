//! Summary: Error types for the dictdb storage stack.
//! Copyright (c) YOAB. All rights reserved.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Result type alias for dictdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Sub-kind for [`Error::InvalidMeta`], naming which part of the meta
/// record failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaFault {
    /// The recorded entry size disagrees with the stored entry bytes.
    EntrySize,
    /// The entry-overflow block id points at a meta slot or past the heap.
    EntryId,
    /// The CRC32C terminator did not verify.
    Checksum,
    /// The assembled entry failed its codec check.
    Entry,
}

impl fmt::Display for MetaFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaFault::EntrySize => write!(f, "entry size"),
            MetaFault::EntryId => write!(f, "entry id"),
            MetaFault::Checksum => write!(f, "checksum"),
            MetaFault::Entry => write!(f, "entry"),
        }
    }
}

/// Error types for dictdb operations.
///
/// Write-path errors are latched by the block store: the first one is kept
/// and returned by every later write until the store is closed, which is
/// why the type is `Clone` (I/O causes are shared behind an `Arc`).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The store has been closed.
    Closed,
    /// Write attempted on a read-only store.
    ReadOnly,
    /// The store is already open.
    Opened,
    /// The file does not start with the expected magic code.
    UnknownMagicCode,
    /// Block size outside 512..=65536 bytes or not a power of two.
    InvalidBlockSize { size: u32 },
    /// A meta slot failed validation.
    InvalidMeta { fault: MetaFault },
    /// The freelist chain disagrees with the meta accounting.
    InvalidFreelist { reason: &'static str },
    /// A payload block failed its codec verification.
    InvalidChecksum { block_id: u32 },
    /// An overflow chain is malformed.
    BadOverflow { reason: &'static str },
    /// The file uses a format feature this build does not support.
    Unsupported { what: &'static str },
    /// The file is empty and the store is read-only.
    FileEmpty,
    /// The file is shorter than the meta record requires.
    FileTruncated { expected: u64, actual: u64 },
    /// The heap cannot grow any further.
    OutOfSpace,
    /// A block id, offset, or length is outside the addressable range.
    OutOfRange { what: &'static str },
    /// The allocator could not produce a block.
    AllocateFailed { reason: &'static str },
    /// The codec spec names a cipher suite this build does not carry.
    InvalidCipherSuite { id: u64 },
    /// The cipher key has the wrong length for the selected suite.
    InvalidCipherKey,
    /// I/O failure from the underlying file.
    Io {
        context: &'static str,
        source: Arc<io::Error>,
    },
    /// A worker task panicked; the payload message is preserved.
    Panicked { message: String },
    /// Aggregate failure collected from parallel page writes.
    Batch(Vec<Error>),
}

impl Error {
    /// Wraps an I/O error with a short context string.
    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        Error::Io {
            context,
            source: Arc::new(source),
        }
    }

    /// Returns the individual errors of a [`Error::Batch`], or a slice of
    /// one for any other error.
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::Batch(errs) => errs,
            other => std::slice::from_ref(other),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "store is closed"),
            Error::ReadOnly => write!(f, "store is read-only"),
            Error::Opened => write!(f, "store is already open"),
            Error::UnknownMagicCode => write!(f, "unknown magic code"),
            Error::InvalidBlockSize { size } => write!(f, "invalid block size: {size}"),
            Error::InvalidMeta { fault } => write!(f, "invalid meta: {fault}"),
            Error::InvalidFreelist { reason } => write!(f, "invalid freelist: {reason}"),
            Error::InvalidChecksum { block_id } => {
                write!(f, "invalid checksum in block {block_id}")
            }
            Error::BadOverflow { reason } => write!(f, "bad overflow chain: {reason}"),
            Error::Unsupported { what } => write!(f, "unsupported: {what}"),
            Error::FileEmpty => write!(f, "file is empty"),
            Error::FileTruncated { expected, actual } => {
                write!(f, "file truncated: need {expected} bytes, have {actual}")
            }
            Error::OutOfSpace => write!(f, "out of space"),
            Error::OutOfRange { what } => write!(f, "out of range: {what}"),
            Error::AllocateFailed { reason } => write!(f, "allocate failed: {reason}"),
            Error::InvalidCipherSuite { id } => write!(f, "invalid cipher suite: {id}"),
            Error::InvalidCipherKey => write!(f, "invalid cipher key"),
            Error::Io { context, source } => write!(f, "I/O error {context}: {source}"),
            Error::Panicked { message } => write!(f, "worker panicked: {message}"),
            Error::Batch(errs) => {
                for (i, e) in errs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source.as_ref()),
            Error::Batch(errs) => errs
                .first()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io("", err)
    }
}
