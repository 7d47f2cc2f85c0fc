#![forbid(unsafe_code)]

use std::convert::TryInto;
use std::fmt;
use std::io::{ErrorKind, IoSlice};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info, warn};

use crate::primitives::io::FileIo;
use crate::types::{frame_crc32, CommitSeq, FrameOffset, PageId, Result, TandemError};

mod index;

pub use index::{CommitPoint, IndexEntry, IndexVersion, Snapshot, WalIndex};

const WAL_MAGIC: [u8; 4] = *b"TNDW";
const WAL_FORMAT_VERSION: u16 = 1;
/// Re-reads of a header that failed its checksum, in case another process
/// was rewriting it.
const HEADER_READ_ATTEMPTS: u32 = 3;
/// Length of the WAL file header.
pub const FILE_HEADER_LEN: usize = 56;
/// Length of the header preceding every page image.
pub const FRAME_HEADER_LEN: usize = 32;

/// Configuration options for opening a write-ahead log.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// Size of each page image in bytes.
    pub page_size: u32,
    /// Logical offset assigned to the first frame of a brand new log.
    pub start_offset: FrameOffset,
}

impl WalOptions {
    /// Creates options for a log holding `page_size` byte images.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            start_offset: FrameOffset(0),
        }
    }
}

/// Statistics tracking WAL operations.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Number of frames appended to the log.
    pub frames_appended: u64,
    /// Total bytes written for frames.
    pub bytes_appended: u64,
    /// Commit markers written.
    pub commits: u64,
    /// Number of sync operations performed.
    pub syncs: u64,
    /// Physical resets performed by truncation.
    pub resets: u64,
}

/// When the log is flushed relative to a commit marker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalSyncMode {
    /// Sync frames, then the marker, before returning.
    Immediate,
    /// Leave syncing to a later `sync()` call.
    Deferred,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct FileHeader {
    page_size: u32,
    salt: u64,
    base: FrameOffset,
    live_from: FrameOffset,
    /// Last commit before `base`, all of it already in the page store.
    base_seq: CommitSeq,
    /// Database size as of `base_seq`.
    base_page_count: u32,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.base_page_count.to_be_bytes());
        buf[16..24].copy_from_slice(&self.salt.to_be_bytes());
        buf[24..32].copy_from_slice(&self.base.0.to_be_bytes());
        buf[32..40].copy_from_slice(&self.live_from.0.to_be_bytes());
        buf[40..48].copy_from_slice(&self.base_seq.0.to_be_bytes());
        let crc = crc32fast::hash(&buf[..48]);
        buf[48..52].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(TandemError::Corruption("wal header truncated"));
        }
        if src[0..4] != WAL_MAGIC {
            return Err(TandemError::Corruption("wal magic mismatch"));
        }
        let version = u16::from_be_bytes(src[4..6].try_into().unwrap());
        if version != WAL_FORMAT_VERSION {
            return Err(TandemError::Corruption("wal format version mismatch"));
        }
        let stored_crc = u32::from_be_bytes(src[48..52].try_into().unwrap());
        if crc32fast::hash(&src[..48]) != stored_crc {
            return Err(TandemError::Corruption("wal header crc mismatch"));
        }
        let header = Self {
            page_size: u32::from_be_bytes(src[8..12].try_into().unwrap()),
            base_page_count: u32::from_be_bytes(src[12..16].try_into().unwrap()),
            salt: u64::from_be_bytes(src[16..24].try_into().unwrap()),
            base: FrameOffset(u64::from_be_bytes(src[24..32].try_into().unwrap())),
            live_from: FrameOffset(u64::from_be_bytes(src[32..40].try_into().unwrap())),
            base_seq: CommitSeq(u64::from_be_bytes(src[40..48].try_into().unwrap())),
        };
        if header.live_from < header.base {
            return Err(TandemError::Corruption("wal live offset below base"));
        }
        Ok(header)
    }

    fn salt32(&self) -> u32 {
        self.salt as u32
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct FrameHeader {
    page_id: PageId,
    seq: CommitSeq,
    commit: bool,
    /// Set on commit markers written only after the transaction's images
    /// were synced.
    synced: bool,
    page_count: u32,
    salt: u32,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.page_id.0.to_be_bytes());
        buf[4..12].copy_from_slice(&self.seq.0.to_be_bytes());
        buf[12] = u8::from(self.commit);
        buf[13] = u8::from(self.synced);
        buf[16..20].copy_from_slice(&self.page_count.to_be_bytes());
        buf[20..24].copy_from_slice(&self.salt.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = crc32fast::hash(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(TandemError::Corruption("wal frame header truncated"));
        }
        let stored_crc = u32::from_be_bytes(src[28..32].try_into().unwrap());
        if crc32fast::hash(&src[..28]) != stored_crc {
            return Err(TandemError::Corruption("wal frame header crc mismatch"));
        }
        let commit = match src[12] {
            0 => false,
            1 => true,
            _ => return Err(TandemError::Corruption("wal frame commit flag invalid")),
        };
        let synced = match src[13] {
            0 => false,
            1 => true,
            _ => return Err(TandemError::Corruption("wal frame sync flag invalid")),
        };
        Ok(Self {
            page_id: PageId(u32::from_be_bytes(src[0..4].try_into().unwrap())),
            seq: CommitSeq(u64::from_be_bytes(src[4..12].try_into().unwrap())),
            commit,
            synced,
            page_count: u32::from_be_bytes(src[16..20].try_into().unwrap()),
            salt: u32::from_be_bytes(src[20..24].try_into().unwrap()),
            payload_crc32: u32::from_be_bytes(src[24..28].try_into().unwrap()),
        })
    }
}

struct AppendState {
    append_offset: FrameOffset,
    committed_end: FrameOffset,
    last_commit_seq: CommitSeq,
    last_frame: Option<(FrameOffset, FrameHeader)>,
    stats: WalStats,
}

/// Write-ahead log of page images.
///
/// Frames are addressed by logical offsets. Truncation first advances the
/// header's `live_from` mark; the file is only physically reset (new salt,
/// new base) once every frame in it is checkpointed, no uncommitted frame
/// follows, and the caller holds the writer slot. Appends and commit markers
/// are serialized through one mutex; frame reads only share the layout lock,
/// which a physical reset takes exclusively.
///
/// Several processes may have the same log open. Only the one holding the
/// writer slot appends; the others follow along with [`Wal::refresh`].
pub struct Wal {
    io: Arc<dyn FileIo>,
    page_size: usize,
    layout: RwLock<FileHeader>,
    state: Mutex<AppendState>,
}

impl Wal {
    /// Opens or creates a write-ahead log.
    ///
    /// An existing log must have been written with the same page size. The
    /// append cursor starts at the physical end of the file; call
    /// [`Wal::recover`] before appending to a log that may hold a torn tail.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        if options.page_size == 0 {
            return Err(TandemError::Invalid("wal page size must be non-zero"));
        }
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                page_size: options.page_size,
                salt: OsRng.next_u64(),
                base: options.start_offset,
                live_from: options.start_offset,
                base_seq: CommitSeq(0),
                base_page_count: 0,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.page_size != options.page_size {
                return Err(TandemError::Corruption("wal page size mismatch"));
            }
            header
        };
        let physical_len = io.len()?.max(FILE_HEADER_LEN as u64);
        let append_offset = header.base.advance(physical_len - FILE_HEADER_LEN as u64);
        let state = AppendState {
            append_offset,
            committed_end: append_offset,
            last_commit_seq: CommitSeq(0),
            last_frame: None,
            stats: WalStats::default(),
        };
        Ok(Self {
            io,
            page_size: options.page_size as usize,
            layout: RwLock::new(header),
            state: Mutex::new(state),
        })
    }

    /// Size of one frame (header plus image) in bytes.
    pub fn frame_size(&self) -> u64 {
        (FRAME_HEADER_LEN + self.page_size) as u64
    }

    /// Page size the log was created with.
    pub fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    /// Appends a page image for the transaction that will commit as `seq`.
    ///
    /// The frame stays invisible until [`Wal::mark_commit`] flips its marker.
    pub fn append_frame(&self, page_id: PageId, image: &[u8], seq: CommitSeq) -> Result<FrameOffset> {
        if image.len() != self.page_size {
            return Err(TandemError::Invalid("wal frame payload size mismatch"));
        }
        let mut state = self.state.lock();
        if seq <= state.last_commit_seq {
            return Err(TandemError::Invalid("wal frame seq not after last commit"));
        }
        if let Some((_, last)) = &state.last_frame {
            if !last.commit && last.seq != seq {
                return Err(TandemError::Invalid("wal frame seq differs from open transaction"));
            }
        }
        let layout = self.layout.read();
        let offset = state.append_offset;
        let header = FrameHeader {
            page_id,
            seq,
            commit: false,
            synced: false,
            page_count: 0,
            salt: layout.salt32(),
            payload_crc32: frame_crc32(page_id.0, layout.salt32(), image),
        };
        let encoded = header.encode();
        let physical = physical_offset(&layout, offset);
        self.io
            .writev_at(physical, &[IoSlice::new(&encoded), IoSlice::new(image)])?;
        drop(layout);
        let frame_size = self.frame_size();
        state.append_offset = offset.advance(frame_size);
        state.last_frame = Some((offset, header));
        state.stats.frames_appended += 1;
        state.stats.bytes_appended += frame_size;
        debug!(
            page_id = page_id.0,
            seq = seq.0,
            offset = offset.0,
            "wal.append"
        );
        Ok(offset)
    }

    /// Flips the commit marker on the last frame of transaction `seq`.
    ///
    /// `page_count` is the database size after the commit. Returns the new
    /// committed end of the log.
    pub fn mark_commit(
        &self,
        seq: CommitSeq,
        page_count: u32,
        sync: WalSyncMode,
    ) -> Result<FrameOffset> {
        let mut state = self.state.lock();
        let (offset, mut header) = match &state.last_frame {
            Some((offset, header)) if header.seq == seq && !header.commit => {
                (*offset, header.clone())
            }
            _ => return Err(TandemError::Invalid("no open frames for commit")),
        };
        if matches!(sync, WalSyncMode::Immediate) {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        header.commit = true;
        header.synced = matches!(sync, WalSyncMode::Immediate);
        header.page_count = page_count;
        {
            let layout = self.layout.read();
            self.io
                .write_at(physical_offset(&layout, offset), &header.encode())?;
        }
        if matches!(sync, WalSyncMode::Immediate) {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        state.committed_end = state.append_offset;
        state.last_commit_seq = seq;
        state.last_frame = Some((offset, header));
        state.stats.commits += 1;
        debug!(
            seq = seq.0,
            page_count,
            committed_end = state.committed_end.0,
            "wal.commit_marker"
        );
        Ok(state.committed_end)
    }

    /// Rewinds the append cursor to `offset`, dropping uncommitted frames.
    pub fn discard_from(&self, offset: FrameOffset) -> Result<()> {
        let mut state = self.state.lock();
        if offset < state.committed_end || offset > state.append_offset {
            return Err(TandemError::Invalid("discard offset outside uncommitted tail"));
        }
        let dropped = (state.append_offset.0 - offset.0) / self.frame_size();
        state.append_offset = offset;
        state.last_frame = None;
        let layout = self.layout.read();
        debug!(offset = offset.0, dropped, "wal.discard_tail");
        self.io.truncate(physical_offset(&layout, offset))
    }

    /// Syncs all pending writes to persistent storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Reads and verifies the frame at `offset`.
    ///
    /// Returns [`TandemError::OutOfRange`] when the frame has been physically
    /// reclaimed, and [`TandemError::Corruption`] when a checksum fails.
    pub fn read_frame(&self, offset: FrameOffset) -> Result<WalFrameOwned> {
        let layout = self.layout.read();
        if offset < layout.base {
            return Err(TandemError::OutOfRange);
        }
        if (offset.0 - layout.base.0) % self.frame_size() != 0 {
            return Err(TandemError::Invalid("wal offset not frame aligned"));
        }
        let mut buf = vec![0u8; FRAME_HEADER_LEN + self.page_size];
        match self.io.read_at(physical_offset(&layout, offset), &mut buf) {
            Ok(()) => {}
            Err(TandemError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(TandemError::OutOfRange);
            }
            Err(err) => return Err(err),
        }
        let salt = layout.salt32();
        drop(layout);
        let header = FrameHeader::decode(&buf[..FRAME_HEADER_LEN])?;
        if header.salt != salt {
            return Err(TandemError::Corruption("wal frame salt mismatch"));
        }
        let payload = buf.split_off(FRAME_HEADER_LEN);
        if frame_crc32(header.page_id.0, salt, &payload) != header.payload_crc32 {
            return Err(TandemError::Corruption("wal frame payload crc mismatch"));
        }
        Ok(WalFrameOwned {
            offset,
            page_id: header.page_id,
            seq: header.seq,
            commit: header.commit,
            synced: header.synced,
            page_count: header.page_count,
            payload,
        })
    }

    /// Drops every frame strictly older than `offset`.
    ///
    /// `offset` must not exceed the committed end. Only the header's live mark
    /// moves, unless `reset` names the commit ending exactly at `offset` and
    /// nothing follows it in the file: the log is then reset to an empty file
    /// whose base is `offset`. Callers pass `reset` only while holding the
    /// writer slot. Returns whether the file was reset.
    pub fn truncate_before(&self, offset: FrameOffset, reset: Option<CommitPoint>) -> Result<bool> {
        let mut state = self.state.lock();
        if offset > state.committed_end {
            return Err(TandemError::Invalid("truncate offset past committed end"));
        }
        let mut layout = self.layout.write();
        if offset <= layout.live_from {
            return Ok(false);
        }
        let mut updated = layout.clone();
        updated.live_from = offset;
        let reset = match reset {
            Some(point) if point.wal_end == offset && offset == state.append_offset => {
                if self.io.len()? == physical_offset(&layout, offset) {
                    Some(point)
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(point) = reset {
            updated.base = offset;
            updated.salt = OsRng.next_u64();
            updated.base_seq = point.seq;
            updated.base_page_count = point.page_count;
        }
        self.io.write_at(0, &updated.encode())?;
        if reset.is_some() {
            self.io.truncate(FILE_HEADER_LEN as u64)?;
        }
        self.io.sync_all()?;
        *layout = updated;
        state.stats.syncs += 1;
        if reset.is_some() {
            state.last_frame = None;
            state.stats.resets += 1;
        }
        info!(
            live_from = offset.0,
            physical_reset = reset.is_some(),
            "wal.truncate_before"
        );
        Ok(reset.is_some())
    }

    /// Scans the log, keeping every transaction up to the last valid commit
    /// marker, and cuts the torn or uncommitted tail off the file.
    ///
    /// Only call this while no other handle may be appending.
    pub fn recover(&self) -> Result<WalRecovery> {
        self.recover_inner(true)
    }

    /// Like [`Wal::recover`] but leaves the file untouched, for opening a log
    /// another process is currently appending to.
    pub fn recover_shared(&self) -> Result<WalRecovery> {
        self.recover_inner(false)
    }

    fn recover_inner(&self, cut_tail: bool) -> Result<WalRecovery> {
        let mut state = self.state.lock();
        let layout = self.layout.read().clone();
        let scan = self.scan(&layout, layout.base, CommitSeq(0))?;
        let discarded_frames =
            (scan.scanned_end.0.saturating_sub(scan.committed_end.0)) / self.frame_size();
        if cut_tail {
            let physical_end = physical_offset(&layout, scan.committed_end);
            if self.io.len()? != physical_end {
                self.io.truncate(physical_end)?;
                self.io.sync_all()?;
            }
        }
        state.append_offset = scan.committed_end;
        state.committed_end = scan.committed_end;
        state.last_commit_seq = scan.last_seq.max(layout.base_seq);
        state.last_frame = None;
        info!(
            commits = scan.commits.len(),
            last_seq = scan.last_seq.0,
            committed_end = scan.committed_end.0,
            live_from = layout.live_from.0,
            discarded_frames,
            cut_tail,
            "wal.recovered"
        );
        Ok(WalRecovery {
            commits: scan.commits,
            last_seq: scan.last_seq,
            committed_end: scan.committed_end,
            live_from: layout.live_from,
            discarded_frames,
        })
    }

    /// Picks up what other processes did to the log since the last look:
    /// new commits, a moved live mark, or a physical reset.
    ///
    /// Never modifies the file. A handle in the middle of appending its own
    /// transaction keeps its append position.
    pub fn refresh(&self) -> Result<WalRefresh> {
        let mut state = self.state.lock();
        let disk = self.read_header()?;
        if disk.page_size as usize != self.page_size {
            return Err(TandemError::Corruption("wal page size mismatch"));
        }
        let layout_changed = {
            let mut layout = self.layout.write();
            let changed = layout.base != disk.base || layout.salt != disk.salt;
            if *layout != disk {
                *layout = disk.clone();
            }
            changed
        };
        let mut rebased = None;
        if state.committed_end < disk.base {
            // Everything we had not seen yet was checkpointed and reset away.
            rebased = Some(CommitPoint {
                seq: disk.base_seq,
                wal_end: disk.base,
                page_count: disk.base_page_count,
            });
            state.committed_end = disk.base;
            state.last_commit_seq = state.last_commit_seq.max(disk.base_seq);
        }
        let scan = self.scan(&disk, state.committed_end, state.last_commit_seq)?;
        if !scan.commits.is_empty() {
            state.committed_end = scan.committed_end;
            state.last_commit_seq = scan.last_seq;
        }
        if state.append_offset < state.committed_end {
            state.append_offset = state.committed_end;
            state.last_frame = None;
        }
        if layout_changed || !scan.commits.is_empty() {
            debug!(
                commits = scan.commits.len(),
                committed_end = state.committed_end.0,
                live_from = disk.live_from.0,
                layout_changed,
                "wal.refresh"
            );
        }
        Ok(WalRefresh {
            commits: scan.commits,
            rebased,
            live_from: disk.live_from,
            layout_changed,
        })
    }

    /// Makes the committed end the append position and cuts off whatever a
    /// previous writer left behind it. Returns the number of bytes dropped.
    ///
    /// Only call this while holding the writer slot, right after
    /// [`Wal::refresh`].
    pub fn adopt_tail(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let layout = self.layout.read();
        state.append_offset = state.committed_end;
        state.last_frame = None;
        let end = physical_offset(&layout, state.committed_end);
        let len = self.io.len()?;
        if len <= end {
            return Ok(0);
        }
        self.io.truncate(end)?;
        self.io.sync_all()?;
        warn!(
            committed_end = state.committed_end.0,
            dropped_bytes = len - end,
            "wal.abandoned_tail_dropped"
        );
        Ok(len - end)
    }

    /// Reads committed transactions starting at `from`, a transaction
    /// boundary.
    ///
    /// A commit whose images fail their checksum is fatal when its marker was
    /// written after a sync. Without that barrier the images may simply not
    /// have reached the disk before a crash, so the commit is treated as a
    /// torn tail, unless a later synced marker proves the log did reach the
    /// disk past it.
    fn scan(&self, layout: &FileHeader, from: FrameOffset, after: CommitSeq) -> Result<Scan> {
        let mut iter = self.iter_at(layout, from)?;
        let mut commits: Vec<RecoveredCommit> = Vec::new();
        let mut pending: Vec<ScannedFrame> = Vec::new();
        let mut last_seq = after;
        let mut committed_end = from;
        let mut torn: Option<CommitSeq> = None;
        while let Some(scanned) = iter.next_frame()? {
            let seq = scanned.frame.seq;
            if let Some(torn_seq) = torn {
                if seq < torn_seq {
                    break;
                }
                torn = Some(seq);
                if scanned.frame.commit && scanned.frame.synced {
                    return Err(TandemError::Corruption(
                        "damaged wal commit followed by a synced commit",
                    ));
                }
                continue;
            }
            if seq <= last_seq {
                break;
            }
            if let Some(first) = pending.first() {
                if first.frame.seq != seq {
                    break;
                }
            }
            let commit = scanned.frame.commit;
            let synced = scanned.frame.synced;
            let page_count = scanned.frame.page_count;
            let end = scanned.frame.offset.advance(self.frame_size());
            pending.push(scanned);
            if !commit {
                continue;
            }
            if pending.iter().any(|frame| !frame.payload_intact) {
                if synced {
                    return Err(TandemError::Corruption("committed wal frame failed checksum"));
                }
                warn!(seq = seq.0, "wal.unsynced_commit_torn");
                torn = Some(seq);
                pending.clear();
                continue;
            }
            commits.push(RecoveredCommit {
                seq,
                page_count,
                end,
                frames: pending
                    .drain(..)
                    .map(|f| (f.frame.page_id, f.frame.offset))
                    .collect(),
            });
            last_seq = seq;
            committed_end = end;
        }
        Ok(Scan {
            commits,
            last_seq,
            committed_end,
            scanned_end: iter.offset,
        })
    }

    fn read_header(&self) -> Result<FileHeader> {
        let mut attempt = 1;
        loop {
            let mut buf = [0u8; FILE_HEADER_LEN];
            let read = self
                .io
                .read_at(0, &mut buf)
                .and_then(|()| FileHeader::decode(&buf));
            match read {
                Err(TandemError::Corruption(reason)) if attempt < HEADER_READ_ATTEMPTS => {
                    debug!(attempt, reason, "wal.header_reread");
                    attempt += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }

    /// Creates an iterator over the physically present frames.
    pub fn iter(&self) -> Result<WalIterator> {
        let layout = self.layout.read().clone();
        self.iter_at(&layout, layout.base)
    }

    fn iter_at(&self, layout: &FileHeader, from: FrameOffset) -> Result<WalIterator> {
        let len = self.io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            return Err(TandemError::Corruption("wal truncated header"));
        }
        Ok(WalIterator {
            io: Arc::clone(&self.io),
            page_size: self.page_size,
            salt: layout.salt32(),
            base: layout.base,
            offset: from.max(layout.base),
            end: layout.base.advance(len - FILE_HEADER_LEN as u64),
        })
    }

    /// Logical end of the last committed transaction.
    pub fn committed_end(&self) -> FrameOffset {
        self.state.lock().committed_end
    }

    /// Logical offset where the next frame will be appended.
    pub fn append_offset(&self) -> FrameOffset {
        self.state.lock().append_offset
    }

    /// Frames before this offset are checkpointed and no longer live.
    pub fn live_from(&self) -> FrameOffset {
        self.layout.read().live_from
    }

    /// Logical offset of the first physically present frame.
    pub fn base(&self) -> FrameOffset {
        self.layout.read().base
    }

    /// Returns current statistics for this WAL instance.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Returns the total size of the WAL file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the WAL holds no frames.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

fn physical_offset(layout: &FileHeader, offset: FrameOffset) -> u64 {
    FILE_HEADER_LEN as u64 + (offset.0 - layout.base.0)
}

/// A verified WAL frame with its page image.
pub struct WalFrameOwned {
    /// Logical offset of the frame.
    pub offset: FrameOffset,
    /// Page the image belongs to.
    pub page_id: PageId,
    /// Sequence of the transaction that wrote the frame.
    pub seq: CommitSeq,
    /// Whether this frame carries the commit marker.
    pub commit: bool,
    /// Whether the marker was written after the transaction's images were
    /// synced.
    pub synced: bool,
    /// Database size after the commit; zero on non-commit frames.
    pub page_count: u32,
    /// Page image.
    pub payload: Vec<u8>,
}

impl fmt::Debug for WalFrameOwned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalFrameOwned")
            .field("offset", &self.offset)
            .field("page_id", &self.page_id)
            .field("seq", &self.seq)
            .field("commit", &self.commit)
            .field("synced", &self.synced)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Frame produced by a scan; the image checksum is reported, not enforced.
#[derive(Debug)]
pub struct ScannedFrame {
    /// The frame as read from disk.
    pub frame: WalFrameOwned,
    /// Whether the image matched its checksum.
    pub payload_intact: bool,
}

/// One committed transaction found during recovery.
#[derive(Clone, Debug)]
pub struct RecoveredCommit {
    /// Commit sequence.
    pub seq: CommitSeq,
    /// Database size after the commit.
    pub page_count: u32,
    /// Logical end offset of the commit.
    pub end: FrameOffset,
    /// Frames of the transaction in append order.
    pub frames: Vec<(PageId, FrameOffset)>,
}

/// Outcome of [`Wal::recover`].
#[derive(Clone, Debug)]
pub struct WalRecovery {
    /// Committed transactions in log order.
    pub commits: Vec<RecoveredCommit>,
    /// Sequence of the last committed transaction, zero if none.
    pub last_seq: CommitSeq,
    /// End of the committed prefix.
    pub committed_end: FrameOffset,
    /// Frames before this offset were already checkpointed.
    pub live_from: FrameOffset,
    /// Frames dropped from the tail.
    pub discarded_frames: u64,
}

/// What [`Wal::refresh`] found.
#[derive(Clone, Debug)]
pub struct WalRefresh {
    /// Commits not seen before, in log order.
    pub commits: Vec<RecoveredCommit>,
    /// Set when the log was reset past everything seen before; the state
    /// as of the new base.
    pub rebased: Option<CommitPoint>,
    /// Current live mark.
    pub live_from: FrameOffset,
    /// Whether the file was physically reset since the last look.
    pub layout_changed: bool,
}

struct Scan {
    commits: Vec<RecoveredCommit>,
    last_seq: CommitSeq,
    committed_end: FrameOffset,
    scanned_end: FrameOffset,
}

/// Iterator over physically present frames.
///
/// Stops at the first torn header, salt mismatch, or short read.
pub struct WalIterator {
    io: Arc<dyn FileIo>,
    page_size: usize,
    salt: u32,
    base: FrameOffset,
    offset: FrameOffset,
    end: FrameOffset,
}

impl WalIterator {
    /// Reads the next frame, or `None` at the end of the valid prefix.
    pub fn next_frame(&mut self) -> Result<Option<ScannedFrame>> {
        let frame_size = (FRAME_HEADER_LEN + self.page_size) as u64;
        if self.offset.0 + frame_size > self.end.0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; FRAME_HEADER_LEN + self.page_size];
        let physical = FILE_HEADER_LEN as u64 + (self.offset.0 - self.base.0);
        match self.io.read_at(physical, &mut buf) {
            Ok(()) => {}
            Err(TandemError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
        let header = match FrameHeader::decode(&buf[..FRAME_HEADER_LEN]) {
            Ok(header) if header.salt == self.salt => header,
            _ => return Ok(None),
        };
        let payload = buf.split_off(FRAME_HEADER_LEN);
        let payload_intact =
            frame_crc32(header.page_id.0, self.salt, &payload) == header.payload_crc32;
        let frame = WalFrameOwned {
            offset: self.offset,
            page_id: header.page_id,
            seq: header.seq,
            commit: header.commit,
            synced: header.synced,
            page_count: header.page_count,
            payload,
        };
        self.offset = self.offset.advance(frame_size);
        Ok(Some(ScannedFrame {
            frame,
            payload_intact,
        }))
    }

    /// Logical offset the iterator will read next.
    pub fn position(&self) -> FrameOffset {
        self.offset
    }
}
