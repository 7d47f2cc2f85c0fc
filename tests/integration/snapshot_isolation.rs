#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem::{CommitSeq, Config, Database, PageId, Result, TandemError};
use tempfile::tempdir;

const PAGE: usize = 512;
const PAGES: u32 = 8;

fn config() -> Config {
    Config {
        page_size: PAGE as u32,
        checkpoint_interval_frames: 0,
        busy_timeout: Duration::from_secs(5),
        ..Config::fast()
    }
}

fn write_all_pages(db: &Database, byte: u8) -> Result<CommitSeq> {
    let mut txn = db.begin_write()?;
    while txn.page_count() < PAGES {
        txn.allocate_page()?;
    }
    for id in 0..PAGES {
        txn.write_page(PageId(id), &vec![byte; PAGE])?;
    }
    txn.commit()
}

#[test]
fn session_never_observes_later_commits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("repeatable.db"), config())?;
    write_all_pages(&db, 1)?;
    let session = db.open_read_session()?;
    let before: Vec<_> = (0..PAGES)
        .map(|id| session.read_page(PageId(id)))
        .collect::<Result<_>>()?;

    for byte in 2..6 {
        write_all_pages(&db, byte)?;
        for id in 0..PAGES {
            assert_eq!(session.read_page(PageId(id))?, before[id as usize]);
        }
    }
    assert_eq!(session.snapshot().max_seq, CommitSeq(1));
    Ok(())
}

#[test]
fn uncommitted_writes_stay_invisible() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("dirty.db"), config())?;
    write_all_pages(&db, 1)?;

    let mut txn = db.begin_write()?;
    txn.write_page(PageId(3), &vec![9u8; PAGE])?;
    let extra = txn.allocate_page()?;

    let during = db.open_read_session()?;
    assert_eq!(during.read_page(PageId(3))?, vec![1u8; PAGE]);
    assert!(matches!(during.read_page(extra), Err(TandemError::OutOfRange)));
    txn.commit()?;

    assert_eq!(during.read_page(PageId(3))?, vec![1u8; PAGE]);
    let after = db.open_read_session()?;
    assert_eq!(after.read_page(PageId(3))?, vec![9u8; PAGE]);
    assert_eq!(after.read_page(extra)?, vec![0u8; PAGE]);
    Ok(())
}

#[test]
fn concurrent_readers_see_whole_commits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("atomic.db"), config())?;
    write_all_pages(&db, 0)?;
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || -> Result<u64> {
                let mut last_seq = CommitSeq(0);
                let mut checks = 0u64;
                while !stop.load(Ordering::Acquire) {
                    let session = db.open_read_session()?;
                    let seq = session.snapshot().max_seq;
                    assert!(seq >= last_seq, "snapshots must not go backwards");
                    last_seq = seq;
                    let first = session.read_page(PageId(0))?[0];
                    for id in 1..PAGES {
                        let page = session.read_page(PageId(id))?;
                        assert!(page.iter().all(|b| *b == first), "torn commit observed");
                    }
                    checks += 1;
                }
                Ok(checks)
            })
        })
        .collect();

    for byte in 1..=60u8 {
        write_all_pages(&db, byte)?;
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        let checks = reader.join().expect("reader thread")?;
        assert!(checks > 0);
    }
    Ok(())
}
