#![allow(missing_docs)]
#![cfg(unix)]

//! Several processes sharing one database.
//!
//! The other process is this test binary again, running one of the ignored
//! `child_*` tests selected by name. Those return immediately when started
//! without the environment a parent sets up.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use tandem::{CommitSeq, Config, Database, PageId, Result, TandemError};
use tempfile::tempdir;

const PAGE: usize = 512;

const CHILD_DB: &str = "TANDEM_CHILD_DB";
const CHILD_EXPECT: &str = "TANDEM_CHILD_EXPECT";
const CHILD_WRITER_BUSY: &str = "TANDEM_CHILD_WRITER_BUSY";
const CHILD_READY: &str = "TANDEM_CHILD_READY";
const CHILD_DONE: &str = "TANDEM_CHILD_DONE";

fn config() -> Config {
    Config {
        page_size: PAGE as u32,
        checkpoint_interval_frames: 0,
        busy_timeout: Duration::from_millis(200),
        ..Config::durable()
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

fn read(db: &Database, id: u32) -> Result<Vec<u8>> {
    db.open_read_session()?.read_page(PageId(id))
}

fn child(name: &str, db: &Path, expect: u8) -> Command {
    let mut cmd = Command::new(env::current_exe().expect("test binary path"));
    cmd.args(["--exact", name, "--ignored", "--nocapture", "--test-threads=1"])
        .env(CHILD_DB, db)
        .env(CHILD_EXPECT, expect.to_string());
    cmd
}

fn assert_success(name: &str, output: Output) {
    assert!(
        output.status.success(),
        "{name} failed\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !path.exists() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", path.display());
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_child(name: &str, child: Child) {
    let output = child.wait_with_output().expect("wait for child");
    assert_success(name, output);
}

struct ChildEnv {
    db: PathBuf,
    expect: u8,
}

fn child_env() -> Option<ChildEnv> {
    let db = env::var_os(CHILD_DB)?;
    let expect = env::var(CHILD_EXPECT).ok()?.parse().ok()?;
    Some(ChildEnv {
        db: PathBuf::from(db),
        expect,
    })
}

#[test]
#[ignore = "started by the multi-process tests"]
fn child_reads_page() -> Result<()> {
    let Some(setup) = child_env() else {
        return Ok(());
    };
    let db = Database::open(&setup.db, config())?;
    assert_eq!(read(&db, 0)?, vec![setup.expect; PAGE]);
    let busy = matches!(db.try_begin_write(), Err(TandemError::WriteBusy));
    assert_eq!(busy, env::var_os(CHILD_WRITER_BUSY).is_some());
    Ok(())
}

#[test]
#[ignore = "started by the multi-process tests"]
fn child_writes_page() -> Result<()> {
    let Some(setup) = child_env() else {
        return Ok(());
    };
    let db = Database::open(&setup.db, config())?;
    set_page(&db, 0, setup.expect)?;
    Ok(())
}

#[test]
#[ignore = "started by the multi-process tests"]
fn child_holds_session() -> Result<()> {
    let Some(setup) = child_env() else {
        return Ok(());
    };
    let ready = PathBuf::from(env::var_os(CHILD_READY).expect("ready path"));
    let done = PathBuf::from(env::var_os(CHILD_DONE).expect("done path"));
    let db = Database::open(&setup.db, config())?;
    let session = db.open_read_session()?;
    assert_eq!(session.read_page(PageId(0))?, vec![setup.expect; PAGE]);
    std::fs::write(&ready, b"ready")?;
    wait_for(&done);
    assert_eq!(session.read_page(PageId(0))?, vec![setup.expect; PAGE]);
    Ok(())
}

#[test]
fn other_process_reads_past_an_open_write() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("shared.db");
    let db = Database::open(&path, config())?;
    set_page(&db, 0, 1)?;

    let mut txn = db.begin_write()?;
    txn.write_page(PageId(0), &vec![2u8; PAGE])?;
    let output = child("child_reads_page", &path, 1)
        .env(CHILD_WRITER_BUSY, "1")
        .output()?;
    assert_success("child_reads_page", output);
    txn.commit()?;

    let output = child("child_reads_page", &path, 2).output()?;
    assert_success("child_reads_page", output);
    Ok(())
}

#[test]
fn commits_from_another_process_are_visible() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("handoff.db");
    let db = Database::open(&path, config())?;
    assert_eq!(set_page(&db, 0, 1)?, CommitSeq(1));

    let output = child("child_writes_page", &path, 7).output()?;
    assert_success("child_writes_page", output);

    assert_eq!(read(&db, 0)?, vec![7u8; PAGE]);
    assert_eq!(db.stats()?.commit_seq, CommitSeq(2));
    assert_eq!(set_page(&db, 1, 8)?, CommitSeq(3));

    let output = child("child_reads_page", &path, 7).output()?;
    assert_success("child_reads_page", output);
    Ok(())
}

#[test]
fn checkpoint_waits_for_reader_in_another_process() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("pinned.db");
    let ready = dir.path().join("ready");
    let done = dir.path().join("done");
    let db = Database::open(&path, config())?;
    set_page(&db, 0, 1)?;

    let reader = child("child_holds_session", &path, 1)
        .env(CHILD_READY, &ready)
        .env(CHILD_DONE, &done)
        .spawn()?;
    wait_for(&ready);

    set_page(&db, 0, 2)?;
    set_page(&db, 0, 3)?;
    let report = db.checkpoint_report()?;
    assert_eq!(report.frames_flushed, 1);
    assert!(!report.wal_reset);

    std::fs::write(&done, b"done")?;
    wait_child("child_holds_session", reader);

    let report = db.checkpoint_report()?;
    assert_eq!(report.frames_flushed, 2);
    assert!(report.wal_reset);
    let output = child("child_reads_page", &path, 3).output()?;
    assert_success("child_reads_page", output);
    Ok(())
}

#[test]
fn other_process_follows_a_wal_reset() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("reset.db");
    let db = Database::open(&path, config())?;
    set_page(&db, 0, 1)?;
    let output = child("child_writes_page", &path, 4).output()?;
    assert_success("child_writes_page", output);

    let report = db.checkpoint_report()?;
    assert_eq!(report.frames_flushed, 2);
    assert!(report.wal_reset);

    let output = child("child_writes_page", &path, 5).output()?;
    assert_success("child_writes_page", output);
    assert_eq!(read(&db, 0)?, vec![5u8; PAGE]);
    assert_eq!(db.stats()?.commit_seq, CommitSeq(3));
    Ok(())
}
