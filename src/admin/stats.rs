use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::admin::error::open_existing;
use crate::admin::Result;
use crate::db::{wal_path, Config};

/// Statistics gathered from an open database and its files.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Page store counters.
    pub store: StoreStatsSection,
    /// Write-ahead log counters.
    pub wal: WalStatsSection,
    /// Reader and writer state.
    pub sessions: SessionStatsSection,
    /// On-disk sizes.
    pub filesystem: FilesystemStats,
    /// Configuration the database was opened with.
    pub config: Config,
}

/// Page store section of [`StatsReport`].
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatsSection {
    /// Page size in bytes.
    pub page_size: u32,
    /// Logical database size as of the last commit.
    pub page_count: u32,
    /// Pages materialized in the store file.
    pub store_page_count: u32,
    /// Last committed sequence.
    pub commit_seq: u64,
    /// Newest sequence folded into the store.
    pub checkpoint_seq: u64,
    /// Whether corruption was detected.
    pub poisoned: bool,
}

/// WAL section of [`StatsReport`].
#[derive(Debug, Clone, Serialize)]
pub struct WalStatsSection {
    /// Committed end of the log (logical offset).
    pub end_offset: u64,
    /// Oldest live offset.
    pub live_from: u64,
    /// Committed frames not yet checkpointed.
    pub pending_frames: u64,
    /// Entries held by the WAL index.
    pub index_entries: usize,
    /// Frames appended since open.
    pub frames_appended: u64,
    /// Sync calls since open.
    pub syncs: u64,
    /// Physical resets since open.
    pub resets: u64,
}

/// Session section of [`StatsReport`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatsSection {
    /// Pinned read snapshots.
    pub active_readers: usize,
    /// Whether a write transaction is open.
    pub writer_active: bool,
    /// State of this process's write transaction.
    pub writer_state: &'static str,
    /// WAL end of the oldest pinned snapshot.
    pub oldest_reader_end: Option<u64>,
    /// Transactions committed since open.
    pub commits: u64,
    /// Transactions aborted since open.
    pub aborts: u64,
    /// Checkpoints that flushed frames since open.
    pub checkpoints: u64,
}

/// File sizes of the database and its log.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    /// Database file path.
    pub db_path: String,
    /// Database file size.
    pub db_size_bytes: u64,
    /// WAL file path.
    pub wal_path: String,
    /// WAL file size.
    pub wal_size_bytes: u64,
}

/// Collects statistics for the database at `path`.
pub fn stats(path: impl AsRef<Path>, config: &Config) -> Result<StatsReport> {
    let path = path.as_ref();
    let db = open_existing(path, config)?;
    let snapshot = db.stats()?;
    let db_meta = fs::metadata(path)?;
    let wal_path = wal_path(path);
    let wal_size = fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);

    let report = StatsReport {
        store: StoreStatsSection {
            page_size: snapshot.page_size,
            page_count: snapshot.page_count,
            store_page_count: snapshot.store_page_count,
            commit_seq: snapshot.commit_seq.0,
            checkpoint_seq: snapshot.checkpoint_seq.0,
            poisoned: snapshot.poisoned,
        },
        wal: WalStatsSection {
            end_offset: snapshot.wal_end.0,
            live_from: snapshot.wal_live_from.0,
            pending_frames: snapshot.wal_pending_frames,
            index_entries: snapshot.index_entries,
            frames_appended: snapshot.wal.frames_appended,
            syncs: snapshot.wal.syncs,
            resets: snapshot.wal.resets,
        },
        sessions: SessionStatsSection {
            active_readers: snapshot.locks.readers,
            writer_active: snapshot.locks.writer,
            writer_state: snapshot.writer_state.as_str(),
            oldest_reader_end: snapshot.locks.oldest_reader_end.map(|end| end.0),
            commits: snapshot.commits,
            aborts: snapshot.aborts,
            checkpoints: snapshot.checkpoints,
        },
        filesystem: FilesystemStats {
            db_path: path.display().to_string(),
            db_size_bytes: db_meta.len(),
            wal_path: wal_path.display().to_string(),
            wal_size_bytes: wal_size,
        },
        config: db.config().clone(),
    };
    db.close()?;
    Ok(report)
}
