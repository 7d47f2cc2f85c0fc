#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tandem::db::wal_path;
use tandem::primitives::io::StdFileIo;
use tandem::primitives::wal::{Wal, WalOptions, FILE_HEADER_LEN, FRAME_HEADER_LEN};
use tandem::{CommitSeq, Config, Database, DurabilityMode, PageId, Result, TandemError};
use tempfile::tempdir;

const PAGE: usize = 512;
const FRAME: u64 = (FRAME_HEADER_LEN + PAGE) as u64;

fn config() -> Config {
    Config {
        page_size: PAGE as u32,
        checkpoint_interval_frames: 0,
        ..Config::durable()
    }
}

fn batched_config() -> Config {
    Config {
        durability: DurabilityMode::Batched,
        batched_sync_commits: 1000,
        ..config()
    }
}

fn set_page(db: &Database, id: u32, byte: u8) -> Result<CommitSeq> {
    let mut txn = db.begin_write()?;
    while txn.page_count() <= id {
        txn.allocate_page()?;
    }
    txn.write_page(PageId(id), &vec![byte; PAGE])?;
    txn.commit()
}

fn open_raw_wal(db_path: &Path) -> Result<Wal> {
    let io = StdFileIo::open(wal_path(db_path))?;
    Wal::open(Arc::new(io), WalOptions::new(PAGE as u32))
}

#[test]
fn uncheckpointed_commits_replay_on_open() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("replay.db");
    {
        let db = Database::open(&path, config())?;
        set_page(&db, 0, 1)?;
        set_page(&db, 1, 2)?;
        set_page(&db, 0, 3)?;
        assert_eq!(db.stats()?.store_page_count, 0);
    }

    let db = Database::open(&path, config())?;
    let stats = db.stats()?;
    assert_eq!(stats.commit_seq, CommitSeq(3));
    assert_eq!(stats.page_count, 2);
    assert_eq!(stats.checkpoint_seq, CommitSeq(0));
    let session = db.open_read_session()?;
    assert_eq!(session.read_page(PageId(0))?, vec![3u8; PAGE]);
    assert_eq!(session.read_page(PageId(1))?, vec![2u8; PAGE]);
    Ok(())
}

#[test]
fn frames_without_marker_are_dropped() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("unmarked.db");
    {
        let db = Database::open(&path, config())?;
        assert_eq!(set_page(&db, 0, 1)?, CommitSeq(1));
    }
    {
        // A writer that died after appending its frames but before the marker.
        let wal = open_raw_wal(&path)?;
        let recovery = wal.recover()?;
        assert_eq!(recovery.last_seq, CommitSeq(1));
        wal.append_frame(PageId(0), &[2u8; PAGE], CommitSeq(2))?;
        wal.append_frame(PageId(0), &[3u8; PAGE], CommitSeq(2))?;
        wal.sync()?;
    }
    let wal_len = fs::metadata(wal_path(&path))?.len();
    assert_eq!(wal_len, FILE_HEADER_LEN as u64 + 3 * FRAME);

    let db = Database::open(&path, config())?;
    assert_eq!(db.stats()?.commit_seq, CommitSeq(1));
    assert_eq!(db.stats()?.wal_bytes, FILE_HEADER_LEN as u64 + FRAME);
    assert_eq!(
        db.open_read_session()?.read_page(PageId(0))?,
        vec![1u8; PAGE]
    );
    assert_eq!(set_page(&db, 0, 4)?, CommitSeq(2));
    assert_eq!(
        db.open_read_session()?.read_page(PageId(0))?,
        vec![4u8; PAGE]
    );
    Ok(())
}

#[test]
fn torn_tail_is_cut_off() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("torn.db");
    {
        let db = Database::open(&path, config())?;
        set_page(&db, 0, 1)?;
        set_page(&db, 0, 2)?;
    }
    {
        let mut wal = OpenOptions::new().append(true).open(wal_path(&path))?;
        wal.write_all(&[0xAB; 100])?;
        wal.write_all(&vec![0x5A; FRAME as usize])?;
        wal.sync_all()?;
    }

    let db = Database::open(&path, config())?;
    let stats = db.stats()?;
    assert_eq!(stats.commit_seq, CommitSeq(2));
    assert_eq!(stats.wal_bytes, FILE_HEADER_LEN as u64 + 2 * FRAME);
    assert_eq!(
        db.open_read_session()?.read_page(PageId(0))?,
        vec![2u8; PAGE]
    );
    assert_eq!(set_page(&db, 0, 3)?, CommitSeq(3));
    drop(db);

    let db = Database::open(&path, config())?;
    assert_eq!(db.stats()?.commit_seq, CommitSeq(3));
    assert_eq!(
        db.open_read_session()?.read_page(PageId(0))?,
        vec![3u8; PAGE]
    );
    Ok(())
}

#[test]
fn damaged_committed_frame_fails_open() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("damaged.db");
    {
        let db = Database::open(&path, config())?;
        set_page(&db, 0, 1)?;
    }
    let mut bytes = fs::read(wal_path(&path))?;
    bytes[FILE_HEADER_LEN + FRAME_HEADER_LEN + 17] ^= 0xFF;
    fs::write(wal_path(&path), &bytes)?;

    match Database::open(&path, config()) {
        Err(TandemError::Corruption(_)) => {}
        Err(other) => panic!("expected corruption, got {other}"),
        Ok(_) => panic!("opened a database with a damaged committed frame"),
    }
    Ok(())
}

#[test]
fn damaged_unsynced_commit_is_dropped_as_torn_tail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("batched.db");
    {
        let db = Database::open(&path, batched_config())?;
        set_page(&db, 0, 1)?;
        set_page(&db, 0, 2)?;
    }
    // The second image never fully reached the disk before the crash.
    let mut bytes = fs::read(wal_path(&path))?;
    bytes[FILE_HEADER_LEN + FRAME as usize + FRAME_HEADER_LEN + 9] ^= 0xFF;
    fs::write(wal_path(&path), &bytes)?;

    let db = Database::open(&path, batched_config())?;
    let stats = db.stats()?;
    assert_eq!(stats.commit_seq, CommitSeq(1));
    assert_eq!(stats.wal_bytes, FILE_HEADER_LEN as u64 + FRAME);
    assert!(!stats.poisoned);
    assert_eq!(
        db.open_read_session()?.read_page(PageId(0))?,
        vec![1u8; PAGE]
    );
    assert_eq!(set_page(&db, 0, 3)?, CommitSeq(2));
    Ok(())
}

#[test]
fn damaged_unsynced_commit_before_a_synced_one_fails_open() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("mixed.db");
    {
        let db = Database::open(&path, batched_config())?;
        set_page(&db, 0, 1)?;
    }
    {
        let db = Database::open(&path, config())?;
        set_page(&db, 1, 2)?;
    }
    let mut bytes = fs::read(wal_path(&path))?;
    bytes[FILE_HEADER_LEN + FRAME_HEADER_LEN + 9] ^= 0xFF;
    fs::write(wal_path(&path), &bytes)?;

    match Database::open(&path, config()) {
        Err(TandemError::Corruption(_)) => {}
        Err(other) => panic!("expected corruption, got {other}"),
        Ok(_) => panic!("dropped a commit that a later synced commit builds on"),
    }
    Ok(())
}

#[test]
fn replay_after_partial_checkpoint_skips_flushed_frames() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("partial.db");
    {
        let db = Database::open(&path, config())?;
        set_page(&db, 0, 1)?;
        let reader = db.open_read_session()?;
        set_page(&db, 0, 2)?;
        set_page(&db, 1, 5)?;
        assert_eq!(db.checkpoint()?, 1);
        let stats = db.stats()?;
        assert_eq!(stats.wal_live_from, reader.snapshot().wal_end);
        assert_eq!(stats.checkpoint_seq, CommitSeq(1));
    }

    let db = Database::open(&path, config())?;
    let stats = db.stats()?;
    assert_eq!(stats.commit_seq, CommitSeq(3));
    assert_eq!(stats.checkpoint_seq, CommitSeq(1));
    assert_eq!(stats.index_entries, 2);
    let session = db.open_read_session()?;
    assert_eq!(session.read_page(PageId(0))?, vec![2u8; PAGE]);
    assert_eq!(session.read_page(PageId(1))?, vec![5u8; PAGE]);
    assert_eq!(db.checkpoint()?, 2);
    assert_eq!(db.stats()?.wal_pending_frames, 0);
    Ok(())
}
