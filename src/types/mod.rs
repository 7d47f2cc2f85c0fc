#![forbid(unsafe_code)]

//! Identifiers, offsets, and the crate-wide error type.

use std::fmt;

/// Frame and header checksums.
pub mod checksum;

pub use checksum::frame_crc32;

/// Index of a fixed-size page inside the page store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u32);

/// Commit sequence number; one per committed transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct CommitSeq(pub u64);

/// Logical byte offset of a frame in the write-ahead log.
///
/// Logical offsets keep growing for the lifetime of the database, including
/// across physical WAL resets, so an offset never names two different frames.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct FrameOffset(pub u64);

impl CommitSeq {
    /// Returns the sequence that follows this one.
    pub fn next(self) -> Self {
        CommitSeq(self.0.saturating_add(1))
    }
}

impl FrameOffset {
    /// Advances the offset by `len` bytes.
    pub fn advance(self, len: u64) -> Self {
        FrameOffset(self.0.saturating_add(len))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CommitSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FrameOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PageId {
    fn from(value: u32) -> Self {
        PageId(value)
    }
}

impl From<PageId> for u32 {
    fn from(value: PageId) -> Self {
        value.0
    }
}

/// Errors surfaced by the storage kernel.
#[derive(thiserror::Error, Debug)]
pub enum TandemError {
    /// Underlying storage failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Another writer holds the writer slot; the caller may retry.
    #[error("write busy: another writer is active")]
    WriteBusy,
    /// Page id or frame offset outside the addressable range.
    #[error("out of range")]
    OutOfRange,
    /// On-disk data failed an integrity check.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The database handle was closed.
    #[error("database closed")]
    Closed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TandemError>;
