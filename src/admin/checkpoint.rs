use std::path::Path;

use serde::Serialize;

use crate::admin::error::open_existing;
use crate::admin::Result;
use crate::db::Config;

/// Report generated after executing a checkpoint operation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// Committed frames copied into the page store.
    pub frames_flushed: u64,
    /// Distinct pages written.
    pub pages_written: u64,
    /// Newest commit contained in the page store afterwards.
    pub checkpoint_seq: u64,
    /// Logical WAL offset before which frames were reclaimed.
    pub truncated_before: u64,
    /// Whether the WAL file was reset to an empty log.
    pub wal_reset: bool,
    /// Duration of the checkpoint operation in milliseconds.
    pub duration_ms: f64,
}

/// Executes a checkpoint on the database at `path`.
///
/// # Errors
///
/// Returns an error if the database does not exist, cannot be opened, or the
/// checkpoint fails.
pub fn checkpoint(path: impl AsRef<Path>, config: &Config) -> Result<CheckpointReport> {
    let db = open_existing(path.as_ref(), config)?;
    let report = db.checkpoint_report()?;
    db.close()?;
    Ok(CheckpointReport {
        frames_flushed: report.frames_flushed,
        pages_written: report.pages_written,
        checkpoint_seq: report.checkpoint_seq.0,
        truncated_before: report.truncated_before.0,
        wal_reset: report.wal_reset,
        duration_ms: report.duration.as_secs_f64() * 1_000.0,
    })
}
