use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::admin::{AdminError, Result};
use crate::db::{Config, Database};
use crate::types::PageId;

const SEED_ROW: &[u8] = b"initial_row";

/// Parameters of the concurrency demo.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Pages written by the long transaction.
    pub write_pages: u32,
    /// Delay between starting the write and starting the read.
    pub read_delay: Duration,
    /// Extra time the writer keeps its transaction open before committing.
    pub write_hold: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            write_pages: 2000,
            read_delay: Duration::from_millis(100),
            write_hold: Duration::from_millis(300),
        }
    }
}

/// Timings observed by the demo.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    /// Pages written by the long transaction.
    pub write_pages: u32,
    /// Sequence of the seed commit.
    pub seed_seq: u64,
    /// Sequence of the long write's commit.
    pub write_seq: u64,
    /// Wall time of the long write, including its commit.
    pub write_duration_ms: f64,
    /// When the read started, relative to the start of the write.
    pub read_started_ms: f64,
    /// Wall time of the read.
    pub read_duration_ms: f64,
    /// Sequence visible to the reader.
    pub read_seq: u64,
    /// Pages the reader scanned.
    pub pages_read: u32,
    /// Whether the read finished while the write was still running.
    pub read_finished_first: bool,
}

/// Runs a long write on one handle and a delayed read on a second handle of
/// the same database, and reports both timings.
///
/// The read is expected to complete without waiting for the writer and to
/// observe the state committed before the write began.
pub fn run_concurrency_demo(
    path: impl AsRef<Path>,
    config: &Config,
    options: &DemoOptions,
) -> Result<DemoReport> {
    let path = path.as_ref();
    let write_db = Database::open(path, config.clone())?;
    info!(path = %path.display(), "demo.write_handle_opened");
    let read_db = Database::open(path, config.clone())?;
    info!(path = %path.display(), "demo.read_handle_opened");

    let page_size = write_db.page_size() as usize;
    let seed_seq = {
        let mut txn = write_db.begin_write()?;
        if txn.page_count() == 0 {
            txn.allocate_page()?;
        }
        let mut image = vec![0u8; page_size];
        image[..SEED_ROW.len()].copy_from_slice(SEED_ROW);
        txn.write_page(PageId(0), &image)?;
        txn.commit()?
    };
    info!(seq = seed_seq.0, "demo.seeded");

    let started = Instant::now();
    let report = thread::scope(|scope| -> Result<DemoReport> {
        info!(pages = options.write_pages, "demo.long_write.started");
        let writer = scope.spawn(|| -> Result<(Duration, u64)> {
            let mut txn = write_db.begin_write()?;
            let mut image = vec![0u8; page_size];
            for i in 0..options.write_pages {
                let id = txn.allocate_page()?;
                image[..4].copy_from_slice(&i.to_be_bytes());
                txn.write_page(id, &image)?;
            }
            thread::sleep(options.write_hold);
            let seq = txn.commit()?;
            let elapsed = started.elapsed();
            info!(
                seq = seq.0,
                duration_ms = elapsed.as_millis() as u64,
                "demo.long_write.completed"
            );
            Ok((elapsed, seq.0))
        });

        thread::sleep(options.read_delay);
        let read_started = started.elapsed();
        info!(
            after_ms = read_started.as_millis() as u64,
            "demo.read.started"
        );
        let session = read_db.open_read_session()?;
        let mut pages_read = 0u32;
        for id in 0..session.page_count() {
            session.read_page(PageId(id))?;
            pages_read += 1;
        }
        let read_finished = started.elapsed();
        let read_seq = session.snapshot().max_seq.0;
        session.close();
        let read_duration = read_finished - read_started;
        info!(
            duration_ms = read_duration.as_millis() as u64,
            pages = pages_read,
            seq = read_seq,
            "demo.read.completed"
        );

        let (write_duration, write_seq) = writer
            .join()
            .map_err(|_| AdminError::Message("writer thread panicked".into()))??;
        Ok(DemoReport {
            write_pages: options.write_pages,
            seed_seq: seed_seq.0,
            write_seq,
            write_duration_ms: write_duration.as_secs_f64() * 1_000.0,
            read_started_ms: read_started.as_secs_f64() * 1_000.0,
            read_duration_ms: read_duration.as_secs_f64() * 1_000.0,
            read_seq,
            pages_read,
            read_finished_first: read_finished < write_duration,
        })
    })?;

    read_db.close()?;
    write_db.close()?;
    Ok(report)
}
