use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::primitives::wal::IndexEntry;
use crate::types::{CommitSeq, FrameOffset, PageId, Result, TandemError};

use super::DbInner;

/// Outcome of one checkpoint run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Committed frames folded into the page store.
    pub frames_flushed: u64,
    /// Distinct pages written to the store.
    pub pages_written: u64,
    /// Newest commit now contained in the store.
    pub checkpoint_seq: CommitSeq,
    /// Frames before this offset are no longer live.
    pub truncated_before: FrameOffset,
    /// Whether the WAL file was reset to an empty log.
    pub wal_reset: bool,
    /// Wall time spent.
    pub duration: Duration,
}

/// Copies committed WAL frames into the page store and reclaims the log.
///
/// The copy never passes the oldest snapshot pinned by a read session, so a
/// reader always finds either its frame in the WAL or an identical image in
/// the store. One run at a time.
pub struct Checkpointer {
    lock: Mutex<()>,
    completed: AtomicU64,
    worker: Mutex<Option<CheckpointWorker>>,
}

impl Checkpointer {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            completed: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Checkpoints that flushed at least one frame.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn run(&self, db: &DbInner) -> Result<CheckpointReport> {
        let _guard = self.lock.lock();
        db.ensure_usable()?;
        let started = Instant::now();
        let _slot = match &db.lock_file {
            Some(lock_file) => match lock_file.try_lock_checkpoint()? {
                Some(slot) => Some(slot),
                None => {
                    debug!("checkpoint.busy_elsewhere");
                    return Ok(CheckpointReport {
                        frames_flushed: 0,
                        pages_written: 0,
                        checkpoint_seq: db.store.header().checkpoint_seq,
                        truncated_before: db.wal.live_from(),
                        wal_reset: false,
                        duration: started.elapsed(),
                    });
                }
            },
            None => None,
        };
        db.refresh()?;
        let live_from = db.wal.live_from();
        let mut horizon = db.readers.horizon(|| db.index.commit_point().wal_end);
        if let Some(lock_file) = &db.lock_file {
            if let Some(foreign) = lock_file.oldest_foreign_pin(horizon)? {
                horizon = horizon.min(foreign);
            }
        }
        let checkpoint_seq = db.store.header().checkpoint_seq;
        if horizon <= live_from {
            debug!(
                live_from = live_from.0,
                horizon = horizon.0,
                "checkpoint.nothing_to_do"
            );
            return Ok(CheckpointReport {
                frames_flushed: 0,
                pages_written: 0,
                checkpoint_seq,
                truncated_before: live_from,
                wal_reset: false,
                duration: started.elapsed(),
            });
        }

        let version = db.index.load();
        let mut latest: BTreeMap<PageId, IndexEntry> = BTreeMap::new();
        let mut frames_flushed = 0u64;
        for (page, entry) in version.entries_between(live_from, horizon) {
            frames_flushed += 1;
            match latest.entry(page) {
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().seq < entry.seq {
                        slot.insert(entry);
                    }
                }
            }
        }
        let checkpoint_seq = latest
            .values()
            .map(|entry| entry.seq)
            .max()
            .unwrap_or(checkpoint_seq)
            .max(checkpoint_seq);

        if let Some(max_page) = latest.keys().next_back() {
            while db.store.page_count() <= max_page.0 {
                db.store.extend()?;
            }
        }
        for (page, entry) in &latest {
            let frame = match db.wal.read_frame(entry.offset) {
                Ok(frame) => frame,
                Err(TandemError::Corruption(reason)) => {
                    db.poison(reason);
                    return Err(TandemError::Corruption(reason));
                }
                Err(err) => return Err(err),
            };
            if frame.page_id != *page {
                db.poison("wal frame holds a different page");
                return Err(TandemError::Corruption("wal frame holds a different page"));
            }
            db.store.write_page(*page, &frame.payload)?;
        }
        db.store.set_checkpoint_seq(checkpoint_seq)?;
        db.store.sync()?;

        db.index.prune_before(horizon);
        // Resetting the file is only safe while nobody can be appending.
        let point = db.index.commit_point();
        let exclusive = if point.wal_end == horizon {
            db.txns.try_exclusive(db)?
        } else {
            None
        };
        let reset = exclusive.as_ref().map(|_| point);
        let wal_reset = db.wal.truncate_before(horizon, reset)?;
        drop(exclusive);
        if frames_flushed > 0 {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        let report = CheckpointReport {
            frames_flushed,
            pages_written: latest.len() as u64,
            checkpoint_seq,
            truncated_before: horizon,
            wal_reset,
            duration: started.elapsed(),
        };
        info!(
            frames = report.frames_flushed,
            pages = report.pages_written,
            checkpoint_seq = checkpoint_seq.0,
            truncated_before = horizon.0,
            wal_reset,
            duration_ms = report.duration.as_millis() as u64,
            "checkpoint.applied"
        );
        Ok(report)
    }

    /// Wakes the background worker, if one is running.
    pub(crate) fn trigger(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.trigger();
        }
    }

    pub(crate) fn start_worker(&self, db: &Arc<DbInner>) -> Result<()> {
        let config = &db.config;
        if config.checkpoint_interval_frames == 0 && config.checkpoint_interval.is_none() {
            return Ok(());
        }
        let worker = CheckpointWorker::spawn(Arc::downgrade(db), config.checkpoint_interval)?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    pub(crate) fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.shutdown();
        }
    }
}

#[derive(Default)]
struct WorkerState {
    pending: bool,
    stop: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    cv: Condvar,
}

struct CheckpointWorker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointWorker {
    fn spawn(db: Weak<DbInner>, interval: Option<Duration>) -> Result<Self> {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState::default()),
            cv: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("tandem-checkpoint".into())
            .spawn(move || worker_loop(thread_shared, db, interval))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn trigger(&self) {
        let mut state = self.shared.state.lock();
        state.pending = true;
        self.shared.cv.notify_one();
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.cv.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("checkpoint.worker_panicked");
            }
        }
    }
}

impl Drop for CheckpointWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<WorkerShared>, db: Weak<DbInner>, interval: Option<Duration>) {
    debug!(interval_ms = interval.map(|i| i.as_millis() as u64), "checkpoint.worker_started");
    loop {
        {
            let mut state = shared.state.lock();
            while !state.pending && !state.stop {
                match interval {
                    Some(interval) => {
                        if shared.cv.wait_for(&mut state, interval).timed_out() {
                            break;
                        }
                    }
                    None => shared.cv.wait(&mut state),
                }
            }
            if state.stop {
                break;
            }
            state.pending = false;
        }
        let Some(inner) = db.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        match inner.checkpointer.run(&inner) {
            Ok(report) if report.frames_flushed > 0 => {
                debug!(frames = report.frames_flushed, "checkpoint.background");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "checkpoint.background_failed");
            }
        }
    }
    debug!("checkpoint.worker_stopped");
}
