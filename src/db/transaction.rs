use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::primitives::concurrency::{SlotGuard, WriterGuard, WriterLock};
use crate::primitives::wal::{CommitPoint, Snapshot, WalSyncMode};
use crate::types::{CommitSeq, FrameOffset, PageId, Result, TandemError};

use super::config::{Config, DurabilityMode};
use super::session::resolve_page;
use super::DbInner;

/// The state of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    /// No write transaction is open.
    Idle,
    /// Accepting reads and writes.
    Active,
    /// Frames are being appended to the WAL.
    Appending,
    /// Commit marker written and published.
    Committed,
    /// Discarded; nothing reached readers.
    Aborted,
}

impl TxnState {
    /// Lowercase name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            TxnState::Idle => "idle",
            TxnState::Active => "active",
            TxnState::Appending => "appending",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TxnState::Active,
            2 => TxnState::Appending,
            3 => TxnState::Committed,
            4 => TxnState::Aborted,
            _ => TxnState::Idle,
        }
    }
}

/// Both halves of the writer slot: this process's and the lock file's.
pub(crate) struct ExclusiveWriter<'db> {
    _guard: WriterGuard<'db>,
    _slot: Option<SlotGuard>,
}

/// Serializes writers and assigns commit sequence numbers.
pub struct TransactionManager {
    writer: WriterLock,
    busy_timeout: Duration,
    durability: DurabilityMode,
    batched_sync_commits: u32,
    checkpoint_interval_frames: u64,
    unsynced_commits: AtomicU32,
    state: AtomicU8,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl TransactionManager {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            writer: WriterLock::new(),
            busy_timeout: config.busy_timeout,
            durability: config.durability,
            batched_sync_commits: config.batched_sync_commits,
            checkpoint_interval_frames: config.checkpoint_interval_frames,
            unsynced_commits: AtomicU32::new(0),
            state: AtomicU8::new(TxnState::Idle as u8),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }

    /// Waits for the writer slot up to the busy timeout, first within this
    /// process and then across processes.
    pub(crate) fn begin<'db>(&'db self, db: &'db DbInner) -> Result<WriteHandle<'db>> {
        let started = Instant::now();
        let guard = self.writer.acquire(self.busy_timeout)?;
        let slot = match &db.lock_file {
            Some(lock_file) => {
                Some(lock_file.lock_writer(self.busy_timeout.saturating_sub(started.elapsed()))?)
            }
            None => None,
        };
        WriteHandle::start(db, guard, slot)
    }

    /// Takes the writer slot only if it is free.
    pub(crate) fn try_begin<'db>(&'db self, db: &'db DbInner) -> Result<WriteHandle<'db>> {
        let guard = self.writer.try_acquire()?;
        let slot = match &db.lock_file {
            Some(lock_file) => Some(lock_file.try_lock_writer()?.ok_or(TandemError::WriteBusy)?),
            None => None,
        };
        WriteHandle::start(db, guard, slot)
    }

    /// Holds off every writer, in any process, if none is active right now.
    pub(crate) fn try_exclusive<'db>(&'db self, db: &DbInner) -> Result<Option<ExclusiveWriter<'db>>> {
        let guard = match self.writer.try_acquire() {
            Ok(guard) => guard,
            Err(TandemError::WriteBusy) => return Ok(None),
            Err(err) => return Err(err),
        };
        let slot = match &db.lock_file {
            Some(lock_file) => match lock_file.try_lock_writer()? {
                Some(slot) => Some(slot),
                None => return Ok(None),
            },
            None => None,
        };
        Ok(Some(ExclusiveWriter {
            _guard: guard,
            _slot: slot,
        }))
    }

    /// Whether a write transaction is open.
    pub fn writer_active(&self) -> bool {
        self.writer.is_held()
    }

    /// State of this process's write transaction, or [`TxnState::Idle`].
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transactions committed since open.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Transactions aborted since open.
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn sync_mode(&self) -> WalSyncMode {
        match self.durability {
            DurabilityMode::FsyncPerCommit => WalSyncMode::Immediate,
            DurabilityMode::Batched => WalSyncMode::Deferred,
        }
    }

    /// Counts a deferred commit; returns true when the batch is due for a sync.
    fn batch_due(&self) -> bool {
        if self.durability != DurabilityMode::Batched {
            return false;
        }
        let pending = self.unsynced_commits.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.batched_sync_commits {
            self.unsynced_commits.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// Exclusive write transaction.
///
/// Changes live in a private dirty set until [`WriteHandle::commit`], which
/// appends them to the WAL, flips the commit marker, and publishes them to
/// new read sessions in one step. Dropping an uncommitted handle aborts it.
///
/// # Example
///
/// ```rust,no_run
/// use tandem::{Config, Database};
///
/// let db = Database::open("txn.db", Config::durable())?;
/// let mut txn = db.begin_write()?;
/// let page = txn.allocate_page()?;
/// txn.write_page(page, &vec![1u8; 4096])?;
/// let seq = txn.commit()?;
/// println!("committed as {seq}");
/// # Ok::<(), tandem::TandemError>(())
/// ```
pub struct WriteHandle<'db> {
    db: &'db DbInner,
    _guard: WriterGuard<'db>,
    _process_slot: Option<SlotGuard>,
    base: CommitPoint,
    page_count: u32,
    dirty: BTreeMap<PageId, Vec<u8>>,
    appended_from: Option<FrameOffset>,
    marking: bool,
    state: TxnState,
    started: Instant,
}

impl<'db> WriteHandle<'db> {
    fn start(db: &'db DbInner, guard: WriterGuard<'db>, slot: Option<SlotGuard>) -> Result<Self> {
        db.ensure_usable()?;
        if slot.is_some() {
            // Commits from other processes must be visible before picking
            // the next sequence, and a writer that died mid-append leaves
            // frames we write over.
            db.refresh()?;
            db.wal.adopt_tail()?;
        }
        let base = db.index.commit_point();
        debug!(base_seq = base.seq.0, page_count = base.page_count, "txn.begin");
        db.txns.set_state(TxnState::Active);
        Ok(Self {
            db,
            _guard: guard,
            _process_slot: slot,
            base,
            page_count: base.page_count,
            dirty: BTreeMap::new(),
            appended_from: None,
            marking: false,
            state: TxnState::Active,
            started: Instant::now(),
        })
    }

    /// Current state of the transaction.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Database size including pages allocated by this transaction.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Sequence of the commit this transaction started from.
    pub fn base_seq(&self) -> CommitSeq {
        self.base.seq
    }

    /// Reads page `id`, seeing this transaction's own writes.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        self.ensure_active()?;
        if let Some(image) = self.dirty.get(&id) {
            return Ok(image.clone());
        }
        if id.0 >= self.page_count {
            return Err(TandemError::OutOfRange);
        }
        resolve_page(self.db, id, &Snapshot::from(self.base))
    }

    /// Replaces the image of an existing page.
    pub fn write_page(&mut self, id: PageId, image: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if image.len() != self.db.store.page_size() as usize {
            return Err(TandemError::Invalid("page image size mismatch"));
        }
        if id.0 >= self.page_count {
            return Err(TandemError::OutOfRange);
        }
        self.dirty.insert(id, image.to_vec());
        Ok(())
    }

    /// Appends a zeroed page and returns its id.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        self.ensure_active()?;
        let id = PageId(self.page_count);
        self.page_count = self
            .page_count
            .checked_add(1)
            .ok_or(TandemError::Invalid("page id space exhausted"))?;
        self.dirty
            .insert(id, vec![0u8; self.db.store.page_size() as usize]);
        Ok(id)
    }

    /// Makes the transaction's writes durable and visible.
    ///
    /// Returns the new commit sequence, or the current one when nothing was
    /// written. On error the transaction is aborted and the committed state
    /// is unchanged.
    pub fn commit(mut self) -> Result<CommitSeq> {
        self.ensure_active()?;
        if let Err(err) = self.db.ensure_usable() {
            self.abort_inner();
            return Err(err);
        }
        if self.dirty.is_empty() {
            self.set_state(TxnState::Committed);
            debug!(seq = self.base.seq.0, "txn.commit.empty");
            return Ok(self.base.seq);
        }
        let seq = self.base.seq.next();
        self.set_state(TxnState::Appending);
        match self.append_and_mark(seq) {
            Ok((frames, wal_end)) => {
                let point = CommitPoint {
                    seq,
                    wal_end,
                    page_count: self.page_count,
                };
                self.db.index.publish_commit(&frames, point);
                self.set_state(TxnState::Committed);
                self.db.txns.commits.fetch_add(1, Ordering::Relaxed);
                info!(
                    seq = seq.0,
                    frames = frames.len(),
                    page_count = self.page_count,
                    duration_ms = self.started.elapsed().as_millis() as u64,
                    "txn.commit"
                );
                self.maybe_trigger_checkpoint(wal_end);
                Ok(seq)
            }
            Err(err) => {
                warn!(seq = seq.0, error = %err, "txn.commit.failed");
                self.abort_inner();
                Err(err)
            }
        }
    }

    /// Discards every change made by this transaction.
    pub fn abort(mut self) -> Result<()> {
        self.ensure_active()?;
        self.abort_inner();
        Ok(())
    }

    fn append_and_mark(&mut self, seq: CommitSeq) -> Result<(Vec<(PageId, FrameOffset)>, FrameOffset)> {
        let wal = &self.db.wal;
        self.appended_from = Some(wal.append_offset());
        let mut frames = Vec::with_capacity(self.dirty.len());
        for (page, image) in &self.dirty {
            let offset = wal.append_frame(*page, image, seq)?;
            frames.push((*page, offset));
        }
        let txns = &self.db.txns;
        self.marking = true;
        let wal_end = wal.mark_commit(seq, self.page_count, txns.sync_mode())?;
        self.appended_from = None;
        if txns.batch_due() {
            if let Err(err) = wal.sync() {
                // The commit marker is already in place; a failed batch sync
                // only delays durability.
                warn!(seq = seq.0, error = %err, "txn.batch_sync_failed");
            }
        }
        Ok((frames, wal_end))
    }

    fn maybe_trigger_checkpoint(&self, wal_end: FrameOffset) {
        let threshold = self.db.txns.checkpoint_interval_frames;
        if threshold == 0 {
            return;
        }
        let pending = wal_end.0.saturating_sub(self.db.wal.live_from().0) / self.db.wal.frame_size();
        if pending >= threshold {
            self.db.checkpointer.trigger();
        }
    }

    fn abort_inner(&mut self) {
        let discarded = self.dirty.len();
        self.dirty.clear();
        if let Some(offset) = self.appended_from.take() {
            if let Err(err) = self.db.wal.discard_from(offset) {
                warn!(offset = offset.0, error = %err, "txn.abort.discard_failed");
                if self.marking {
                    // A commit marker may have reached the disk; recovery
                    // could resurrect a transaction reported as failed.
                    self.db.poison("failed to discard aborted wal frames");
                }
            }
        }
        self.set_state(TxnState::Aborted);
        self.db.txns.aborts.fetch_add(1, Ordering::Relaxed);
        debug!(base_seq = self.base.seq.0, discarded, "txn.abort");
    }

    fn set_state(&mut self, state: TxnState) {
        self.state = state;
        self.db.txns.set_state(state);
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(TandemError::Invalid("transaction is no longer active"));
        }
        Ok(())
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        if matches!(self.state, TxnState::Active | TxnState::Appending) {
            self.abort_inner();
        }
        self.db.txns.set_state(TxnState::Idle);
    }
}
