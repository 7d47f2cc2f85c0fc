use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::concurrency::ReaderPin;
use crate::primitives::wal::Snapshot;
use crate::types::{PageId, Result, TandemError};

use super::DbInner;

/// Read-only view of the database as of the moment it was opened.
///
/// The session pins its [`Snapshot`] so the checkpointer never reclaims a
/// frame it may still resolve. Reads never wait on the writer.
pub struct ReadHandle {
    inner: Arc<DbInner>,
    snapshot: Snapshot,
    _pin: ReaderPin,
}

impl ReadHandle {
    pub(crate) fn open(inner: Arc<DbInner>) -> Result<Self> {
        // Holds the live mark in place until the real snapshot is pinned, so
        // no checkpoint elsewhere reclaims what the refresh just found.
        let provisional = match inner.lock_file {
            Some(_) => {
                let pin = inner.readers.pin_offset(inner.wal.live_from())?;
                inner.refresh()?;
                Some(pin)
            }
            None => None,
        };
        let (snapshot, pin) = inner
            .readers
            .pin_with(|| Snapshot::from(inner.index.commit_point()))?;
        drop(provisional);
        debug!(
            wal_end = snapshot.wal_end.0,
            max_seq = snapshot.max_seq.0,
            page_count = snapshot.page_count,
            "session.open"
        );
        Ok(Self {
            inner,
            snapshot,
            _pin: pin,
        })
    }

    /// Snapshot this session reads.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Database size visible to this session.
    pub fn page_count(&self) -> u32 {
        self.snapshot.page_count
    }

    /// Reads page `id` as of the session's snapshot.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        self.inner.ensure_usable()?;
        if id.0 >= self.snapshot.page_count {
            return Err(TandemError::OutOfRange);
        }
        resolve_page(&self.inner, id, &self.snapshot)
    }

    /// Ends the session and releases its snapshot.
    pub fn close(self) {
        debug!(wal_end = self.snapshot.wal_end.0, "session.close");
    }
}

/// Lookups that may fail because the index lags behind the files.
const STALE_READ_ATTEMPTS: u32 = 3;

/// Resolves `id` through the WAL index, falling back to the page store.
///
/// A checkpoint can reclaim a frame between the lookup and the read, here or
/// in another process. A failed read is therefore retried after catching up
/// with the files, as long as that changed where the page resolves to. The
/// same lookup failing against an unchanged log means committed data is
/// gone, and the database is poisoned.
pub(crate) fn resolve_page(inner: &DbInner, id: PageId, snapshot: &Snapshot) -> Result<Vec<u8>> {
    let mut attempts = 0;
    loop {
        let found = inner.index.lookup(id, snapshot);
        let failure = match found {
            None => match inner.store.read_page(id) {
                Ok(image) => return Ok(image),
                Err(TandemError::OutOfRange) => "committed page missing from store",
                Err(err) => return Err(err),
            },
            Some(offset) => match inner.wal.read_frame(offset) {
                Ok(frame) if frame.page_id == id => {
                    trace!(page_id = id.0, offset = offset.0, "session.read.wal");
                    return Ok(frame.payload);
                }
                Ok(_) => "wal frame holds a different page",
                Err(TandemError::OutOfRange) => {
                    debug!(page_id = id.0, offset = offset.0, "session.read.frame_reclaimed");
                    "indexed wal frame missing"
                }
                Err(TandemError::Corruption(reason)) => reason,
                Err(err) => return Err(err),
            },
        };
        attempts += 1;
        let store_pages = inner.store.page_count();
        let layout_changed = inner.refresh()?;
        let moved = layout_changed
            || inner.index.lookup(id, snapshot) != found
            || inner.store.page_count() != store_pages;
        if !moved || attempts >= STALE_READ_ATTEMPTS {
            inner.poison(failure);
            return Err(TandemError::Corruption(failure));
        }
        debug!(page_id = id.0, attempts, layout_changed, "session.read.retry");
    }
}
