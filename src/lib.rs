//! Embedded WAL-mode page store with one writer and many concurrent readers.
//!
//! Writers append page images to a write-ahead log and publish them with a
//! commit marker; readers pin a snapshot and resolve pages through an
//! in-memory WAL index before falling back to the page store. A checkpointer
//! folds committed frames back into the store once no snapshot needs them.

#![warn(missing_docs)]

pub mod admin;
pub mod db;
pub mod primitives;
pub mod types;

pub use db::{
    CheckpointReport, Config, ConfigError, Database, DbStats, DurabilityMode, ReadHandle,
    Snapshot, TxnState, WriteHandle,
};
pub use types::{CommitSeq, FrameOffset, PageId, Result, TandemError};
