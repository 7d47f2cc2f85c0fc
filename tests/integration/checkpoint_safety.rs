#![allow(missing_docs)]

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem::db::wal_path;
use tandem::{Config, Database, PageId, Result};
use tempfile::tempdir;

const PAGE: usize = 512;

fn config() -> Config {
    Config {
        page_size: PAGE as u32,
        checkpoint_interval_frames: 0,
        ..Config::durable()
    }
}

fn set_page(db: &Database, id: u32, byte: u8) -> Result<()> {
    let mut txn = db.begin_write()?;
    while txn.page_count() <= id {
        txn.allocate_page()?;
    }
    txn.write_page(PageId(id), &vec![byte; PAGE])?;
    txn.commit()?;
    Ok(())
}

#[test]
fn checkpoint_never_passes_a_live_snapshot() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("pinned.db"), config())?;
    set_page(&db, 0, 1)?;
    set_page(&db, 1, 1)?;
    let reader = db.open_read_session()?;
    let pinned_end = reader.snapshot().wal_end;

    for byte in 2..10 {
        set_page(&db, 0, byte)?;
        set_page(&db, 1, byte)?;
        db.checkpoint()?;
        let stats = db.stats()?;
        assert!(stats.wal_live_from <= pinned_end);
        assert_eq!(stats.locks.oldest_reader_end, Some(pinned_end));
        assert_eq!(reader.read_page(PageId(0))?, vec![1u8; PAGE]);
        assert_eq!(reader.read_page(PageId(1))?, vec![1u8; PAGE]);
    }

    drop(reader);
    assert!(db.checkpoint()? > 0);
    let stats = db.stats()?;
    assert_eq!(stats.wal_pending_frames, 0);
    assert_eq!(stats.wal_live_from, stats.wal_end);
    let fresh = db.open_read_session()?;
    assert_eq!(fresh.read_page(PageId(0))?, vec![9u8; PAGE]);
    Ok(())
}

#[test]
fn second_checkpoint_is_a_no_op() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("idempotent.db");
    let db = Database::open(&path, config())?;
    for id in 0..4 {
        set_page(&db, id, id as u8 + 1)?;
    }
    assert_eq!(db.checkpoint()?, 4);
    let store_bytes = fs::read(&path)?;
    let wal_bytes = fs::read(wal_path(&path))?;
    let stats = db.stats()?;

    assert_eq!(db.checkpoint()?, 0);
    assert_eq!(fs::read(&path)?, store_bytes);
    assert_eq!(fs::read(wal_path(&path))?, wal_bytes);
    let again = db.stats()?;
    assert_eq!(again.checkpoint_seq, stats.checkpoint_seq);
    assert_eq!(again.checkpoints, 1);
    Ok(())
}

#[test]
fn checkpointed_state_survives_reopen_without_wal() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("no_wal.db");
    {
        let db = Database::open(&path, config())?;
        set_page(&db, 0, 7)?;
        set_page(&db, 2, 8)?;
        db.checkpoint()?;
    }
    fs::remove_file(wal_path(&path))?;
    let db = Database::open(&path, config())?;
    let session = db.open_read_session()?;
    assert_eq!(session.page_count(), 3);
    assert_eq!(session.read_page(PageId(0))?, vec![7u8; PAGE]);
    assert_eq!(session.read_page(PageId(1))?, vec![0u8; PAGE]);
    assert_eq!(session.read_page(PageId(2))?, vec![8u8; PAGE]);
    Ok(())
}

#[test]
fn checkpoints_race_readers_and_writer() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("race.db"), config())?;
    set_page(&db, 0, 0)?;
    set_page(&db, 1, 0)?;
    let stop = Arc::new(AtomicBool::new(false));

    let checkpointer = {
        let db = db.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> Result<()> {
            while !stop.load(Ordering::Acquire) {
                db.checkpoint()?;
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let db = db.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || -> Result<()> {
                while !stop.load(Ordering::Acquire) {
                    let session = db.open_read_session()?;
                    let a = session.read_page(PageId(0))?;
                    thread::sleep(Duration::from_micros(200));
                    let b = session.read_page(PageId(1))?;
                    assert_eq!(a[0], b[0], "pages from different commits");
                    assert_eq!(session.read_page(PageId(0))?, a, "snapshot moved");
                }
                Ok(())
            })
        })
        .collect();

    for byte in 1..=80u8 {
        let mut txn = db.begin_write()?;
        txn.write_page(PageId(0), &vec![byte; PAGE])?;
        txn.write_page(PageId(1), &vec![byte; PAGE])?;
        txn.commit()?;
    }
    stop.store(true, Ordering::Release);
    checkpointer.join().expect("checkpoint thread")?;
    for reader in readers {
        reader.join().expect("reader thread")?;
    }

    db.checkpoint()?;
    let session = db.open_read_session()?;
    assert_eq!(session.read_page(PageId(1))?, vec![80u8; PAGE]);
    assert!(!db.stats()?.poisoned);
    Ok(())
}
