#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::primitives::wal::Snapshot;
use crate::types::{FrameOffset, Result, TandemError};

/// Slot that admits a single writer at a time.
pub struct WriterLock {
    slot: Mutex<()>,
}

/// Guard representing the held writer slot.
pub struct WriterGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl WriterLock {
    /// Creates a free writer slot.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(()),
        }
    }

    /// Waits up to `timeout` for the slot; `WriteBusy` if it stays taken.
    pub fn acquire(&self, timeout: Duration) -> Result<WriterGuard<'_>> {
        match self.slot.try_lock_for(timeout) {
            Some(guard) => Ok(WriterGuard { _guard: guard }),
            None => {
                debug!(timeout_ms = timeout.as_millis() as u64, "lock.writer.busy");
                Err(TandemError::WriteBusy)
            }
        }
    }

    /// Takes the slot only if it is free right now.
    pub fn try_acquire(&self) -> Result<WriterGuard<'_>> {
        self.slot
            .try_lock()
            .map(|guard| WriterGuard { _guard: guard })
            .ok_or(TandemError::WriteBusy)
    }

    /// Whether some writer currently holds the slot.
    pub fn is_held(&self) -> bool {
        self.slot.is_locked()
    }
}

impl Default for WriterLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct LockSnapshot {
    /// Number of pinned read snapshots.
    pub readers: usize,
    /// Whether the writer slot is held.
    pub writer: bool,
    /// WAL end of the oldest pinned snapshot, if any.
    pub oldest_reader_end: Option<FrameOffset>,
}

/// Registry of WAL end offsets pinned by live read sessions.
///
/// Snapshot acquisition and the checkpointer's truncation horizon are both
/// computed while holding the registry mutex, so a checkpoint never misses a
/// reader that is in the middle of pinning. With a [`LockFile`] attached,
/// every pin is also published to other processes.
#[derive(Default)]
pub struct ReaderRegistry {
    pins: Mutex<BTreeMap<FrameOffset, usize>>,
    lock_file: Option<Arc<LockFile>>,
}

/// Guard that keeps a snapshot's WAL end pinned until dropped.
pub struct ReaderPin {
    registry: Arc<ReaderRegistry>,
    wal_end: FrameOffset,
}

impl ReaderRegistry {
    /// Creates an empty registry visible to this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry that also pins through `lock_file`.
    pub fn with_lock_file(lock_file: Arc<LockFile>) -> Self {
        Self {
            pins: Mutex::new(BTreeMap::new()),
            lock_file: Some(lock_file),
        }
    }

    /// Takes a snapshot with `take` and pins it atomically.
    pub fn pin_with(
        self: &Arc<Self>,
        take: impl FnOnce() -> Snapshot,
    ) -> Result<(Snapshot, ReaderPin)> {
        let mut pins = self.pins.lock();
        let snapshot = take();
        let pin = self.pin_locked(&mut pins, snapshot.wal_end)?;
        Ok((snapshot, pin))
    }

    /// Pins a bare offset, keeping every frame at or after it in place.
    pub fn pin_offset(self: &Arc<Self>, wal_end: FrameOffset) -> Result<ReaderPin> {
        let mut pins = self.pins.lock();
        self.pin_locked(&mut pins, wal_end)
    }

    fn pin_locked(
        self: &Arc<Self>,
        pins: &mut BTreeMap<FrameOffset, usize>,
        wal_end: FrameOffset,
    ) -> Result<ReaderPin> {
        if let Some(lock_file) = &self.lock_file {
            lock_file.pin(wal_end)?;
        }
        *pins.entry(wal_end).or_insert(0) += 1;
        Ok(ReaderPin {
            registry: Arc::clone(self),
            wal_end,
        })
    }

    /// Smallest offset any pinned reader may still need, capped at
    /// `committed_end`. `committed_end` is evaluated under the registry lock.
    pub fn horizon(&self, committed_end: impl FnOnce() -> FrameOffset) -> FrameOffset {
        let pins = self.pins.lock();
        let end = committed_end();
        match pins.keys().next() {
            Some(oldest) => (*oldest).min(end),
            None => end,
        }
    }

    /// Number of pinned snapshots.
    pub fn len(&self) -> usize {
        self.pins.lock().values().sum()
    }

    /// Returns true if no snapshot is pinned.
    pub fn is_empty(&self) -> bool {
        self.pins.lock().is_empty()
    }

    /// WAL end of the oldest pinned snapshot.
    pub fn oldest(&self) -> Option<FrameOffset> {
        self.pins.lock().keys().next().copied()
    }

    fn unpin(&self, wal_end: FrameOffset) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&wal_end) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&wal_end);
            }
        }
        if let Some(lock_file) = &self.lock_file {
            lock_file.unpin(wal_end);
        }
    }
}

impl ReaderPin {
    /// WAL end offset held by this pin.
    pub fn wal_end(&self) -> FrameOffset {
        self.wal_end
    }
}

impl Drop for ReaderPin {
    fn drop(&mut self) {
        self.registry.unpin(self.wal_end);
    }
}

const WRITER_SLOT: u64 = 0;
const CHECKPOINT_SLOT: u64 = 1;
const INIT_SLOT: u64 = 2;
/// A reader pinning WAL end `e` holds a shared lock on byte `PIN_BASE + e`.
const PIN_BASE: u64 = 16;

/// Byte-range locks on `<db>-lock` shared by every process using a database.
///
/// Byte 0 is the writer slot, byte 1 the checkpoint slot, and byte 2 is held
/// while a process opens and recovers the files. Read sessions publish their
/// pinned WAL end as a shared lock at `PIN_BASE + wal_end`, which lets a
/// checkpointer in another process find the oldest snapshot still in use.
///
/// Locks are per process: threads of one process never conflict here, so
/// callers pair each slot with an in-process lock. Pins are counted so the
/// byte is only released by the last session of this process using it.
/// Keep one `LockFile` per path per process; closing any descriptor of the
/// file drops every lock the process holds on it.
///
/// Outside unix the slots always succeed and nothing is shared, so only a
/// single process may use a database there.
pub struct LockFile {
    file: Arc<File>,
    pins: Mutex<BTreeMap<FrameOffset, usize>>,
}

/// A held slot of a [`LockFile`], released on drop.
pub struct SlotGuard {
    file: Arc<File>,
    slot: u64,
}

impl LockFile {
    /// Opens or creates the lock file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(TandemError::from)?;
        if file.metadata().map_err(TandemError::from)?.len() < PIN_BASE {
            file.set_len(PIN_BASE).map_err(TandemError::from)?;
        }
        Ok(Self {
            file: Arc::new(file),
            pins: Mutex::new(BTreeMap::new()),
        })
    }

    /// Waits for the init slot, held while opening and recovering.
    pub fn lock_init(&self) -> Result<SlotGuard> {
        self.lock_slot(INIT_SLOT)
    }

    /// Waits for the checkpoint slot.
    pub fn lock_checkpoint(&self) -> Result<SlotGuard> {
        self.lock_slot(CHECKPOINT_SLOT)
    }

    /// Takes the checkpoint slot if no other process holds it.
    pub fn try_lock_checkpoint(&self) -> Result<Option<SlotGuard>> {
        self.try_lock_slot(CHECKPOINT_SLOT)
    }

    /// Takes the writer slot if no other process holds it.
    pub fn try_lock_writer(&self) -> Result<Option<SlotGuard>> {
        self.try_lock_slot(WRITER_SLOT)
    }

    /// Polls for the writer slot until `timeout` runs out; `WriteBusy` after.
    pub fn lock_writer(&self, timeout: Duration) -> Result<SlotGuard> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_micros(500);
        loop {
            if let Some(guard) = self.try_lock_writer()? {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(timeout_ms = timeout.as_millis() as u64, "lock.process_writer.busy");
                return Err(TandemError::WriteBusy);
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(Duration::from_millis(10));
        }
    }

    /// Oldest WAL end below `limit` pinned by another process.
    pub fn oldest_foreign_pin(&self, limit: FrameOffset) -> Result<Option<FrameOffset>> {
        let mut limit = limit.0;
        let mut oldest = None;
        while limit > 0 {
            match first_conflict(&self.file, PIN_BASE, limit).map_err(TandemError::from)? {
                Some(start) if start >= PIN_BASE && start - PIN_BASE < limit => {
                    limit = start - PIN_BASE;
                    oldest = Some(FrameOffset(limit));
                }
                _ => break,
            }
        }
        Ok(oldest)
    }

    fn pin(&self, wal_end: FrameOffset) -> Result<()> {
        let mut pins = self.pins.lock();
        let count = pins.entry(wal_end).or_insert(0);
        if *count == 0 {
            // Only checkpointers query pin bytes and they never lock them,
            // so a shared lock here cannot be refused.
            lock_range(&self.file, pin_byte(wal_end), false, false).map_err(TandemError::from)?;
        }
        *count += 1;
        Ok(())
    }

    fn unpin(&self, wal_end: FrameOffset) {
        let mut pins = self.pins.lock();
        let Some(count) = pins.get_mut(&wal_end) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            pins.remove(&wal_end);
            if let Err(err) = unlock_range(&self.file, pin_byte(wal_end)) {
                warn!(wal_end = wal_end.0, error = %err, "lock.unpin_failed");
            }
        }
    }

    fn lock_slot(&self, slot: u64) -> Result<SlotGuard> {
        lock_range(&self.file, slot, true, true).map_err(TandemError::from)?;
        Ok(self.guard(slot))
    }

    fn try_lock_slot(&self, slot: u64) -> Result<Option<SlotGuard>> {
        if lock_range(&self.file, slot, true, false).map_err(TandemError::from)? {
            Ok(Some(self.guard(slot)))
        } else {
            Ok(None)
        }
    }

    fn guard(&self, slot: u64) -> SlotGuard {
        SlotGuard {
            file: Arc::clone(&self.file),
            slot,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Err(err) = unlock_range(&self.file, self.slot) {
            warn!(slot = self.slot, error = %err, "lock.slot.unlock_failed");
        }
    }
}

fn pin_byte(wal_end: FrameOffset) -> u64 {
    PIN_BASE.saturating_add(wal_end.0)
}

fn lock_range(file: &File, start: u64, exclusive: bool, blocking: bool) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, 1, exclusive, blocking)
    }
    #[cfg(not(unix))]
    {
        let _ = (file, start, exclusive, blocking);
        Ok(true)
    }
}

fn unlock_range(file: &File, start: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, 1)
    }
    #[cfg(not(unix))]
    {
        let _ = (file, start);
        Ok(())
    }
}

fn first_conflict(file: &File, start: u64, len: u64) -> io::Result<Option<u64>> {
    #[cfg(unix)]
    {
        unix::first_conflict(file, start, len)
    }
    #[cfg(not(unix))]
    {
        let _ = (file, start, len);
        Ok(None)
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn region(l_type: libc::c_int, start: u64, len: u64) -> libc::flock {
        // Some platforms carry extra padding fields.
        let mut flock: libc::flock = unsafe { std::mem::zeroed() };
        flock.l_type = l_type as _;
        flock.l_whence = libc::SEEK_SET as _;
        flock.l_start = start as libc::off_t;
        flock.l_len = len as libc::off_t;
        flock
    }

    pub fn lock_region(
        file: &File,
        start: u64,
        len: u64,
        exclusive: bool,
        blocking: bool,
    ) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let l_type = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        let mut flock = region(l_type as libc::c_int, start, len);
        let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };
        loop {
            let res = unsafe { libc::fcntl(fd, cmd, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if !blocking => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = region(libc::F_UNLCK as libc::c_int, start, len);
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Start of a lock held by another process that overlaps the range.
    pub fn first_conflict(file: &File, start: u64, len: u64) -> io::Result<Option<u64>> {
        let fd = file.as_raw_fd();
        let mut flock = region(libc::F_WRLCK as libc::c_int, start, len);
        let res = unsafe { libc::fcntl(fd, libc::F_GETLK, &mut flock) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        if flock.l_type as libc::c_int == libc::F_UNLCK as libc::c_int {
            Ok(None)
        } else {
            Ok(Some(flock.l_start as u64))
        }
    }
}
