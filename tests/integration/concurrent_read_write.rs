#![allow(missing_docs)]

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tandem::{Config, Database, PageId, Result, TandemError};
use tempfile::tempdir;

const PAGE: usize = 512;

fn config() -> Config {
    Config {
        page_size: PAGE as u32,
        checkpoint_interval_frames: 0,
        busy_timeout: Duration::from_secs(5),
        ..Config::durable()
    }
}

#[test]
fn read_during_long_write_does_not_wait() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("long_write.db");
    let write_db = Database::open(&path, config())?;
    let read_db = Database::open(&path, config())?;
    {
        let mut txn = write_db.begin_write()?;
        let page = txn.allocate_page()?;
        txn.write_page(page, &vec![1u8; PAGE])?;
        txn.commit()?;
    }

    let (started_tx, started_rx) = mpsc::channel();
    let start = Instant::now();
    let write_elapsed = thread::scope(|scope| -> Result<Duration> {
        let writer_db = &write_db;
        let writer = scope.spawn(move || -> Result<Duration> {
            let mut txn = writer_db.begin_write()?;
            started_tx.send(()).expect("signal writer start");
            for _ in 0..200 {
                let page = txn.allocate_page()?;
                txn.write_page(page, &vec![2u8; PAGE])?;
            }
            txn.write_page(PageId(0), &vec![2u8; PAGE])?;
            thread::sleep(Duration::from_millis(400));
            txn.commit()?;
            Ok(start.elapsed())
        });

        started_rx.recv().expect("writer started");
        thread::sleep(Duration::from_millis(100));
        let read_start = Instant::now();
        let session = read_db.open_read_session()?;
        assert_eq!(session.page_count(), 1);
        assert_eq!(session.read_page(PageId(0))?, vec![1u8; PAGE]);
        let read_elapsed = read_start.elapsed();
        let read_done = start.elapsed();
        assert!(
            read_elapsed < Duration::from_millis(250),
            "read waited {read_elapsed:?} for the writer"
        );

        let write_elapsed = writer.join().expect("writer thread")?;
        assert!(read_done < write_elapsed, "read should finish before the write");
        Ok(write_elapsed)
    })?;
    assert!(write_elapsed >= Duration::from_millis(400));

    let session = read_db.open_read_session()?;
    assert_eq!(session.page_count(), 201);
    assert_eq!(session.read_page(PageId(0))?, vec![2u8; PAGE]);
    Ok(())
}

#[test]
fn second_writer_waits_for_first() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("writers.db"), config())?;
    let (held_tx, held_rx) = mpsc::channel();

    thread::scope(|scope| -> Result<()> {
        let first_db = &db;
        let first = scope.spawn(move || -> Result<()> {
            let mut txn = first_db.begin_write()?;
            let page = txn.allocate_page()?;
            txn.write_page(page, &vec![1u8; PAGE])?;
            held_tx.send(()).expect("signal");
            thread::sleep(Duration::from_millis(150));
            txn.commit()?;
            Ok(())
        });
        held_rx.recv().expect("first writer holds the slot");
        assert!(matches!(db.try_begin_write(), Err(TandemError::WriteBusy)));

        let waited = Instant::now();
        let mut txn = db.begin_write()?;
        assert!(waited.elapsed() >= Duration::from_millis(50));
        assert_eq!(txn.page_count(), 1, "second writer starts after the first commit");
        txn.write_page(PageId(0), &vec![2u8; PAGE])?;
        txn.commit()?;
        first.join().expect("first writer")?;
        Ok(())
    })?;

    let session = db.open_read_session()?;
    assert_eq!(session.read_page(PageId(0))?, vec![2u8; PAGE]);
    assert_eq!(db.stats()?.commits, 2);
    Ok(())
}

#[test]
fn busy_timeout_bounds_the_wait() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let config = Config {
        busy_timeout: Duration::from_millis(30),
        ..config()
    };
    let db = Database::open(dir.path().join("timeout.db"), config)?;
    let _txn = db.begin_write()?;
    let waited = Instant::now();
    assert!(matches!(db.begin_write(), Err(TandemError::WriteBusy)));
    assert!(waited.elapsed() >= Duration::from_millis(30));
    Ok(())
}
