#![allow(missing_docs)]

use proptest::prelude::*;
use tandem::{Config, Database, DurabilityMode, PageId, ReadHandle};

const PAGE: usize = 512;

#[derive(Debug, Clone)]
enum Op {
    Txn {
        allocs: u8,
        writes: Vec<(u8, u8)>,
        commit: bool,
    },
    OpenReader,
    CheckReaders,
    CloseOldestReader,
    Checkpoint,
    Reopen,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (
            0u8..3,
            prop::collection::vec((any::<u8>(), 1u8..=255), 0..6),
            prop::bool::weighted(0.85),
        )
            .prop_map(|(allocs, writes, commit)| Op::Txn { allocs, writes, commit }),
        2 => Just(Op::OpenReader),
        2 => Just(Op::CheckReaders),
        1 => Just(Op::CloseOldestReader),
        2 => Just(Op::Checkpoint),
        1 => Just(Op::Reopen),
    ]
}

fn config() -> Config {
    Config {
        page_size: PAGE as u32,
        durability: DurabilityMode::Batched,
        checkpoint_interval_frames: 0,
        checkpoint_interval: None,
        ..Config::durable()
    }
}

/// Every page is filled with a single byte; the model keeps that byte.
fn read_all(session: &ReadHandle) -> Vec<u8> {
    (0..session.page_count())
        .map(|id| {
            let image = session.read_page(PageId(id)).expect("read page");
            assert!(image.iter().all(|b| *b == image[0]), "page {id} is torn");
            image[0]
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sessions_match_committed_model(ops in prop::collection::vec(arb_op(), 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.db");
        let mut db = Database::open(&path, config()).unwrap();
        let mut committed: Vec<u8> = Vec::new();
        let mut readers: Vec<(ReadHandle, Vec<u8>)> = Vec::new();

        for op in ops {
            match op {
                Op::Txn { allocs, writes, commit } => {
                    let mut pending = committed.clone();
                    let mut txn = db.begin_write().unwrap();
                    for _ in 0..allocs {
                        txn.allocate_page().unwrap();
                        pending.push(0);
                    }
                    if !pending.is_empty() {
                        for (slot, byte) in writes {
                            let id = slot as usize % pending.len();
                            txn.write_page(PageId(id as u32), &vec![byte; PAGE]).unwrap();
                            pending[id] = byte;
                        }
                    }
                    if commit {
                        txn.commit().unwrap();
                        committed = pending;
                    } else {
                        txn.abort().unwrap();
                    }
                }
                Op::OpenReader => {
                    let session = db.open_read_session().unwrap();
                    readers.push((session, committed.clone()));
                }
                Op::CheckReaders => {
                    for (session, expected) in &readers {
                        prop_assert_eq!(&read_all(session), expected);
                    }
                }
                Op::CloseOldestReader => {
                    if !readers.is_empty() {
                        let (session, expected) = readers.remove(0);
                        prop_assert_eq!(&read_all(&session), &expected);
                        session.close();
                    }
                }
                Op::Checkpoint => {
                    db.checkpoint().unwrap();
                    let stats = db.stats().unwrap();
                    match stats.locks.oldest_reader_end {
                        Some(oldest) => prop_assert!(stats.wal_live_from <= oldest),
                        None => prop_assert_eq!(stats.wal_pending_frames, 0),
                    }
                    prop_assert!(stats.store_page_count <= stats.page_count);
                }
                Op::Reopen => {
                    readers.clear();
                    drop(db);
                    db = Database::open(&path, config()).unwrap();
                }
            }
        }

        for (session, expected) in &readers {
            prop_assert_eq!(&read_all(session), expected);
        }
        let latest = db.open_read_session().unwrap();
        prop_assert_eq!(read_all(&latest), committed);
    }
}
