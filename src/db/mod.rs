//! Database handle tying the page store, WAL, index, and locks together.
//!
//! A [`Database`] owns one shared engine. Writers go through
//! [`Database::begin_write`], readers through [`Database::open_read_session`],
//! and committed WAL content is folded back into the page store by
//! [`Database::checkpoint`] or the background checkpoint worker.

mod checkpoint;
mod config;
mod session;
mod transaction;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::primitives::concurrency::{LockFile, LockSnapshot, ReaderRegistry};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::pager::PageStore;
use crate::primitives::wal::{CommitPoint, Wal, WalIndex, WalOptions, WalStats};
use crate::types::{CommitSeq, FrameOffset, Result, TandemError};

pub use checkpoint::{CheckpointReport, Checkpointer};
pub use config::{Config, ConfigError, DurabilityMode};
pub use session::ReadHandle;
pub use transaction::{TransactionManager, TxnState, WriteHandle};

pub use crate::primitives::wal::Snapshot;

/// Suffix of the write-ahead log file next to the database file.
pub const WAL_SUFFIX: &str = "-wal";
/// Suffix of the advisory lock file next to the database file.
pub const LOCK_SUFFIX: &str = "-lock";

/// Returns the WAL path for a database path.
pub fn wal_path(path: &Path) -> PathBuf {
    sibling(path, WAL_SUFFIX)
}

/// Returns the lock file path for a database path.
pub fn lock_path(path: &Path) -> PathBuf {
    sibling(path, LOCK_SUFFIX)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

type EngineRegistry = Mutex<HashMap<PathBuf, Weak<DbInner>>>;

fn engines() -> &'static EngineRegistry {
    static ENGINES: OnceLock<EngineRegistry> = OnceLock::new();
    ENGINES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Lock files open in this process. An engine closed while its sessions
/// live on must not close the descriptor under its successor, which would
/// drop the successor's locks too.
fn lock_files() -> &'static Mutex<HashMap<PathBuf, Weak<LockFile>>> {
    static LOCK_FILES: OnceLock<Mutex<HashMap<PathBuf, Weak<LockFile>>>> = OnceLock::new();
    LOCK_FILES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn shared_lock_file(path: PathBuf) -> Result<Arc<LockFile>> {
    let mut files = lock_files().lock();
    if let Some(lock_file) = files.get(&path).and_then(Weak::upgrade) {
        return Ok(lock_file);
    }
    let lock_file = Arc::new(LockFile::open(&path)?);
    files.retain(|_, file| file.strong_count() > 0);
    files.insert(path, Arc::downgrade(&lock_file));
    Ok(lock_file)
}

/// Point-in-time counters describing an open database.
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Page size in bytes.
    pub page_size: u32,
    /// Logical database size as of the last commit.
    pub page_count: u32,
    /// Pages materialized in the page store.
    pub store_page_count: u32,
    /// Last committed sequence.
    pub commit_seq: CommitSeq,
    /// Newest sequence folded into the page store.
    pub checkpoint_seq: CommitSeq,
    /// Committed end of the WAL.
    pub wal_end: FrameOffset,
    /// Oldest WAL offset not yet checkpointed.
    pub wal_live_from: FrameOffset,
    /// Committed frames waiting for a checkpoint.
    pub wal_pending_frames: u64,
    /// Current WAL file size.
    pub wal_bytes: u64,
    /// Live entries in the WAL index.
    pub index_entries: usize,
    /// Reader and writer lock state.
    pub locks: LockSnapshot,
    /// State of this process's write transaction.
    pub writer_state: TxnState,
    /// Transactions committed since open.
    pub commits: u64,
    /// Transactions aborted since open.
    pub aborts: u64,
    /// Checkpoints that flushed at least one frame since open.
    pub checkpoints: u64,
    /// Whether corruption was detected.
    pub poisoned: bool,
    /// Raw WAL counters.
    pub wal: WalStats,
}

pub(crate) struct DbInner {
    path: Option<PathBuf>,
    pub(crate) config: Config,
    pub(crate) store: PageStore,
    pub(crate) wal: Wal,
    pub(crate) index: WalIndex,
    pub(crate) readers: Arc<ReaderRegistry>,
    pub(crate) txns: TransactionManager,
    pub(crate) checkpointer: Checkpointer,
    poisoned: AtomicBool,
    closed: AtomicBool,
    handles: AtomicUsize,
    sessions_opened: AtomicU64,
    pub(crate) lock_file: Option<Arc<LockFile>>,
    refresh_lock: Mutex<()>,
}

impl DbInner {
    /// Opens the files and rebuilds the index from the WAL.
    ///
    /// `sole_writer` means no other handle can be appending, so a torn or
    /// abandoned tail may be cut off. The caller starts the checkpoint worker.
    fn build(
        path: Option<PathBuf>,
        store_io: Arc<dyn FileIo>,
        wal_io: Arc<dyn FileIo>,
        config: Config,
        lock_file: Option<Arc<LockFile>>,
        sole_writer: bool,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|_| TandemError::Invalid("invalid database config"))?;
        let store = PageStore::open(store_io, config.page_size)?;
        let wal = Wal::open(wal_io, WalOptions::new(store.page_size()))?;
        let recovery = if sole_writer {
            wal.recover()?
        } else {
            wal.recover_shared()?
        };
        let header = store.header();

        let mut point = CommitPoint {
            seq: header.checkpoint_seq,
            wal_end: recovery.live_from,
            page_count: header.page_count,
        };
        let index = WalIndex::new(point);
        for commit in &recovery.commits {
            if commit.end <= recovery.live_from {
                continue;
            }
            let live: Vec<_> = commit
                .frames
                .iter()
                .copied()
                .filter(|(_, offset)| *offset >= recovery.live_from)
                .collect();
            point = CommitPoint {
                seq: commit.seq.max(point.seq),
                wal_end: commit.end,
                page_count: commit.page_count.max(header.page_count),
            };
            index.publish_commit(&live, point);
        }
        if recovery.committed_end > point.wal_end {
            // Every recovered commit was already checkpointed.
            point.wal_end = recovery.committed_end;
            point.seq = point.seq.max(recovery.last_seq);
            index.publish_commit(&[], point);
        }
        info!(
            path = ?path,
            page_size = store.page_size(),
            page_count = point.page_count,
            commit_seq = point.seq.0,
            checkpoint_seq = header.checkpoint_seq.0,
            wal_end = point.wal_end.0,
            "db.opened"
        );

        let txns = TransactionManager::new(&config);
        let readers = match &lock_file {
            Some(lock_file) => ReaderRegistry::with_lock_file(Arc::clone(lock_file)),
            None => ReaderRegistry::new(),
        };
        Ok(Arc::new(Self {
            path,
            checkpointer: Checkpointer::new(),
            config,
            store,
            wal,
            index,
            readers: Arc::new(readers),
            txns,
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handles: AtomicUsize::new(1),
            sessions_opened: AtomicU64::new(0),
            lock_file,
            refresh_lock: Mutex::new(()),
        }))
    }

    /// Catches up with commits, checkpoints and resets made by other
    /// processes. Returns whether the WAL file was reset underneath us.
    ///
    /// A database opened over caller-supplied backends has no other
    /// processes to follow.
    pub(crate) fn refresh(&self) -> Result<bool> {
        if self.lock_file.is_none() {
            return Ok(false);
        }
        let _serial = self.refresh_lock.lock();
        let known_live_from = self.wal.live_from();
        let update = match self.wal.refresh() {
            Ok(update) => update,
            Err(TandemError::Corruption(reason)) => {
                self.poison(reason);
                return Err(TandemError::Corruption(reason));
            }
            Err(err) => return Err(err),
        };
        let checkpointed = update.live_from > known_live_from;
        if checkpointed {
            self.store.reload_header()?;
        }
        if let Some(point) = update.rebased {
            self.index.publish_commit(&[], point);
        }
        for commit in &update.commits {
            let live: Vec<_> = commit
                .frames
                .iter()
                .copied()
                .filter(|(_, offset)| *offset >= update.live_from)
                .collect();
            let point = CommitPoint {
                seq: commit.seq,
                wal_end: commit.end,
                page_count: commit.page_count,
            };
            self.index.publish_commit(&live, point);
        }
        if checkpointed {
            self.index.prune_before(update.live_from);
        }
        if checkpointed || !update.commits.is_empty() {
            debug!(
                commits = update.commits.len(),
                live_from = update.live_from.0,
                layout_changed = update.layout_changed,
                "db.refreshed"
            );
        }
        Ok(update.layout_changed)
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TandemError::Closed);
        }
        if self.poisoned.load(Ordering::Acquire) {
            return Err(TandemError::Corruption("database poisoned by earlier corruption"));
        }
        Ok(())
    }

    pub(crate) fn poison(&self, reason: &'static str) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            error!(reason, path = ?self.path, "db.poisoned");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        self.wal.sync()?;
        self.store.sync()
    }

    /// Drops one handle; the last one shuts the engine down.
    fn release(&self) {
        let registry = self.path.as_ref().map(|_| engines().lock());
        if self.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.closed.store(true, Ordering::Release);
        self.checkpointer.stop_worker();
        if let Err(err) = self.flush() {
            warn!(error = %err, path = ?self.path, "db.close.flush_failed");
        }
        if let (Some(mut registry), Some(path)) = (registry, self.path.as_ref()) {
            registry.remove(path);
        }
        info!(path = ?self.path, "db.closed");
    }
}

/// Handle to an open database.
///
/// Cloning a handle, or opening the same path again in this process, shares
/// the underlying engine. The engine shuts down when its last handle is
/// dropped or closed; read sessions that outlive it fail with
/// [`TandemError::Closed`].
///
/// # Example
///
/// ```rust,no_run
/// use tandem::{Config, Database, PageId};
///
/// let db = Database::open("demo.db", Config::durable())?;
/// let mut txn = db.begin_write()?;
/// let page = txn.allocate_page()?;
/// txn.write_page(page, &vec![7u8; 4096])?;
/// txn.commit()?;
///
/// let session = db.open_read_session()?;
/// assert_eq!(session.read_page(PageId(0))?[0], 7);
/// # Ok::<(), tandem::TandemError>(())
/// ```
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens or creates the database at `path`.
    ///
    /// Creates `<path>-wal` and `<path>-lock` next to it, replays the WAL,
    /// and starts the background checkpoint worker when configured. Other
    /// processes may have the same database open; they coordinate through
    /// byte-range locks on `<path>-lock`.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = canonical_db_path(path.as_ref())?;
        let mut registry = engines().lock();
        if let Some(inner) = registry.get(&path).and_then(Weak::upgrade) {
            if !inner.is_closed() {
                inner.handles.fetch_add(1, Ordering::AcqRel);
                if inner.config != config {
                    debug!(path = %path.display(), "db.open.shared_engine_config_ignored");
                }
                return Ok(Self { inner });
            }
        }
        let lock_file = shared_lock_file(lock_path(&path))?;
        let inner = {
            // No other process creates, recovers, or checkpoints the files
            // while these are held. A writer elsewhere may still append.
            let _init = lock_file.lock_init()?;
            let _checkpoint = lock_file.lock_checkpoint()?;
            let writer = lock_file.try_lock_writer()?;
            let store_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
            let wal_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(wal_path(&path))?);
            DbInner::build(
                Some(path.clone()),
                store_io,
                wal_io,
                config,
                Some(Arc::clone(&lock_file)),
                writer.is_some(),
            )?
        };
        inner.checkpointer.start_worker(&inner)?;
        registry.insert(path, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    /// Opens a database over caller-supplied file backends.
    ///
    /// Used to inject faults in tests. No process registry or file lock is
    /// involved, so nothing else may open the same files.
    pub fn from_io(store_io: Arc<dyn FileIo>, wal_io: Arc<dyn FileIo>, config: Config) -> Result<Self> {
        let inner = DbInner::build(None, store_io, wal_io, config, None, true)?;
        inner.checkpointer.start_worker(&inner)?;
        Ok(Self { inner })
    }

    /// Starts a write transaction, waiting up to the configured busy timeout.
    pub fn begin_write(&self) -> Result<WriteHandle<'_>> {
        self.inner.ensure_usable()?;
        self.inner.txns.begin(&self.inner)
    }

    /// Starts a write transaction only if no other writer is active.
    pub fn try_begin_write(&self) -> Result<WriteHandle<'_>> {
        self.inner.ensure_usable()?;
        self.inner.txns.try_begin(&self.inner)
    }

    /// Pins the latest committed state and returns a session reading it.
    pub fn open_read_session(&self) -> Result<ReadHandle> {
        self.inner.ensure_usable()?;
        let session = ReadHandle::open(Arc::clone(&self.inner))?;
        self.inner.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    /// Runs a checkpoint now and returns the number of frames flushed.
    pub fn checkpoint(&self) -> Result<u64> {
        Ok(self.checkpoint_report()?.frames_flushed)
    }

    /// Runs a checkpoint now and returns its full report.
    pub fn checkpoint_report(&self) -> Result<CheckpointReport> {
        self.inner.checkpointer.run(&self.inner)
    }

    /// Flushes the WAL and page store, then releases this handle.
    pub fn close(self) -> Result<()> {
        let result = if self.inner.is_closed() {
            Ok(())
        } else {
            self.inner.flush()
        };
        drop(self);
        result
    }

    /// Current configuration of the shared engine.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Database file path, if opened from the filesystem.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.inner.store.page_size()
    }

    /// Collects counters from every component.
    pub fn stats(&self) -> Result<DbStats> {
        let inner = &self.inner;
        let point = inner.index.commit_point();
        let header = inner.store.header();
        let version = inner.index.load();
        let live_from = inner.wal.live_from();
        Ok(DbStats {
            page_size: header.page_size,
            page_count: point.page_count,
            store_page_count: header.page_count,
            commit_seq: point.seq,
            checkpoint_seq: header.checkpoint_seq,
            wal_end: point.wal_end,
            wal_live_from: live_from,
            wal_pending_frames: point.wal_end.0.saturating_sub(live_from.0)
                / inner.wal.frame_size(),
            wal_bytes: inner.wal.len()?,
            index_entries: version.entry_len(),
            locks: LockSnapshot {
                readers: inner.readers.len(),
                writer: inner.txns.writer_active(),
                oldest_reader_end: inner.readers.oldest(),
            },
            writer_state: inner.txns.state(),
            commits: inner.txns.commits(),
            aborts: inner.txns.aborts(),
            checkpoints: inner.checkpointer.completed(),
            poisoned: inner.poisoned.load(Ordering::Acquire),
            wal: inner.wal.stats(),
        })
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        self.inner.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner.release();
    }
}

fn canonical_db_path(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.canonicalize()?);
    }
    let file_name = path
        .file_name()
        .ok_or(TandemError::Invalid("database path has no file name"))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.canonicalize()?,
        _ => std::env::current_dir()?,
    };
    Ok(parent.join(file_name))
}
