//! Low-level primitives for building the storage engine.
//!
//! Includes positioned I/O, locking, write-ahead logging (WAL), and the
//! fixed-size page store.

/// Writer slot, reader pins, and the cross-process file lock.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Fixed-size page file.
pub mod pager;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Holds committed page images until the checkpointer copies them into the
/// page store, plus the in-memory index readers resolve pages through.
pub mod wal;
