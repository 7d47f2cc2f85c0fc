//! Shared page → frame map for committed WAL content.
//!
//! The index is an immutable [`IndexVersion`] behind an [`ArcSwap`]. Writers
//! (commit and checkpoint) build a new version and swap it in with a single
//! store; readers load the current pointer without taking any lock.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::types::{CommitSeq, FrameOffset, PageId};

/// Location of one committed page image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    /// Logical WAL offset of the frame.
    pub offset: FrameOffset,
    /// Commit that wrote it.
    pub seq: CommitSeq,
}

/// Newest committed state known to the index.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitPoint {
    /// Sequence of the last committed transaction.
    pub seq: CommitSeq,
    /// Logical WAL end right after that commit.
    pub wal_end: FrameOffset,
    /// Database size as of that commit.
    pub page_count: u32,
}

/// Point-in-time view pinned by a read session.
///
/// Fixed at session start; the frames visible through it never change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    /// WAL end offset covered by the snapshot.
    pub wal_end: FrameOffset,
    /// Highest commit sequence visible.
    pub max_seq: CommitSeq,
    /// Database size as of the snapshot.
    pub page_count: u32,
}

impl From<CommitPoint> for Snapshot {
    fn from(point: CommitPoint) -> Self {
        Self {
            wal_end: point.wal_end,
            max_seq: point.seq,
            page_count: point.page_count,
        }
    }
}

/// Number of independently shared slices of the page map.
const SHARDS: usize = 64;

type Shard = HashMap<PageId, Arc<[IndexEntry]>>;

/// Immutable version of the index.
///
/// Pages are spread over shards behind their own `Arc`, and every page's
/// entry list is itself shared. A new version copies only the shards its
/// commit touches; everything else is shared with the version before it.
#[derive(Clone, Debug)]
pub struct IndexVersion {
    shards: Vec<Arc<Shard>>,
    commit_point: CommitPoint,
}

impl Default for IndexVersion {
    fn default() -> Self {
        Self::empty(CommitPoint::default())
    }
}

impl IndexVersion {
    fn empty(commit_point: CommitPoint) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Arc::new(Shard::new())).collect(),
            commit_point,
        }
    }

    /// Newest entry for `page` written at or before `max_seq`.
    pub fn resolve(&self, page: PageId, max_seq: CommitSeq) -> Option<IndexEntry> {
        let list = self.list(page)?;
        let idx = list.partition_point(|entry| entry.seq <= max_seq);
        idx.checked_sub(1).map(|i| list[i])
    }

    /// Commit point this version was published with.
    pub fn commit_point(&self) -> CommitPoint {
        self.commit_point
    }

    /// Number of pages with at least one live entry.
    pub fn page_len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// Total number of live entries.
    pub fn entry_len(&self) -> usize {
        self.shards
            .iter()
            .flat_map(|shard| shard.values())
            .map(|list| list.len())
            .sum()
    }

    /// Iterates over every entry whose offset is in `[from, to)`.
    pub fn entries_between(
        &self,
        from: FrameOffset,
        to: FrameOffset,
    ) -> impl Iterator<Item = (PageId, IndexEntry)> + '_ {
        self.shards
            .iter()
            .flat_map(|shard| shard.iter())
            .flat_map(move |(page, list)| {
                list.iter()
                    .filter(move |entry| entry.offset >= from && entry.offset < to)
                    .map(move |entry| (*page, *entry))
            })
    }

    fn list(&self, page: PageId) -> Option<&Arc<[IndexEntry]>> {
        self.shards[shard_of(page)].get(&page)
    }

    fn insert(&mut self, page: PageId, entry: IndexEntry) {
        let shard = Arc::make_mut(&mut self.shards[shard_of(page)]);
        let mut list = shard.get(&page).map(|list| list.to_vec()).unwrap_or_default();
        match list.last_mut() {
            // A page appears once per transaction; keep the later frame.
            Some(last) if last.seq == entry.seq => *last = entry,
            _ => list.push(entry),
        }
        shard.insert(page, list.into());
    }

    fn prune(&mut self, before: FrameOffset) -> usize {
        let mut removed = 0;
        for slot in &mut self.shards {
            let stale = slot
                .values()
                .any(|list| list.first().is_some_and(|entry| entry.offset < before));
            if !stale {
                continue;
            }
            let shard = Arc::make_mut(slot);
            shard.retain(|_, list| {
                let keep = list.partition_point(|entry| entry.offset < before);
                if keep > 0 {
                    removed += keep;
                    *list = list[keep..].into();
                }
                !list.is_empty()
            });
        }
        removed
    }
}

fn shard_of(page: PageId) -> usize {
    page.0 as usize % SHARDS
}

/// Lock-free readable index over committed WAL frames.
pub struct WalIndex {
    current: ArcSwap<IndexVersion>,
    publish: Mutex<()>,
}

impl WalIndex {
    /// Creates an empty index starting at `commit_point`.
    pub fn new(commit_point: CommitPoint) -> Self {
        Self {
            current: ArcSwap::from_pointee(IndexVersion::empty(commit_point)),
            publish: Mutex::new(()),
        }
    }

    /// Current version.
    pub fn load(&self) -> Arc<IndexVersion> {
        self.current.load_full()
    }

    /// Commit point of the current version.
    pub fn commit_point(&self) -> CommitPoint {
        self.current.load().commit_point
    }

    /// WAL offset of the newest frame of `page` visible to `snapshot`.
    pub fn lookup(&self, page: PageId, snapshot: &Snapshot) -> Option<FrameOffset> {
        self.current
            .load()
            .resolve(page, snapshot.max_seq)
            .map(|entry| entry.offset)
    }

    /// Publishes the frames of one commit and advances the commit point.
    ///
    /// The pointer swap is the moment the commit becomes visible to new
    /// snapshots. A point older than the current one is ignored.
    pub fn publish_commit(&self, frames: &[(PageId, FrameOffset)], point: CommitPoint) {
        let _guard = self.publish.lock();
        let current = self.current.load();
        if point.seq < current.commit_point.seq || point.wal_end < current.commit_point.wal_end {
            debug!(seq = point.seq.0, "wal_index.publish.stale");
            return;
        }
        let mut next = IndexVersion::clone(&current);
        for (page, offset) in frames {
            next.insert(
                *page,
                IndexEntry {
                    offset: *offset,
                    seq: point.seq,
                },
            );
        }
        next.commit_point = point;
        self.current.store(Arc::new(next));
        debug!(
            seq = point.seq.0,
            frames = frames.len(),
            wal_end = point.wal_end.0,
            "wal_index.publish"
        );
    }

    /// Adds one committed frame without moving the commit point.
    ///
    /// The entry stays invisible to every snapshot until a commit point with
    /// a sequence at or above `seq` is published.
    pub fn update(&self, page: PageId, offset: FrameOffset, seq: CommitSeq) {
        let _guard = self.publish.lock();
        let mut next = IndexVersion::clone(&self.current.load());
        next.insert(page, IndexEntry { offset, seq });
        self.current.store(Arc::new(next));
        debug!(page_id = page.0, offset = offset.0, seq = seq.0, "wal_index.update");
    }

    /// Drops entries at offsets below `offset`.
    ///
    /// Only called once those frames are durable in the page store, so a
    /// lookup that misses falls back to an up-to-date store page.
    pub fn prune_before(&self, offset: FrameOffset) -> usize {
        let _guard = self.publish.lock();
        let mut next = IndexVersion::clone(&self.current.load());
        let removed = next.prune(offset);
        if removed > 0 {
            self.current.store(Arc::new(next));
        }
        debug!(before = offset.0, removed, "wal_index.prune");
        removed
    }
}
