//! Parallel transactions racing to merge into one staging table.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use serin_storage::MemoryStorage;
use serin_txn::{StagingError, StagingTable};

type Tid = (u64, u64);

fn read_counter(value: &Bytes) -> u64 {
    if value.is_empty() {
        return 0;
    }
    std::str::from_utf8(value).unwrap().parse().unwrap()
}

#[test]
fn counter_increments_are_never_lost() {
    const THREADS: u64 = 8;
    const INCREMENTS: u64 = 50;

    let tbl: Arc<StagingTable<Tid, MemoryStorage>> = Arc::new(StagingTable::new(Arc::new(MemoryStorage::new())));

    let handles: Vec<_> = (0..THREADS)
        .map(|worker| {
            let tbl = Arc::clone(&tbl);
            thread::spawn(move || {
                for i in 0..INCREMENTS {
                    let tid = (worker, i);
                    loop {
                        let current = tbl.get(tid, b"counter").unwrap();
                        let next = read_counter(current.value()) + 1;
                        tbl.put(tid, b"counter", next.to_string()).unwrap();
                        match tbl.merge_to_final(&tid) {
                            Ok(_) => {
                                tbl.purge(tid);
                                break;
                            }
                            Err(StagingError::Conflict { .. }) => tbl.purge(tid),
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(tbl.active_transactions().is_empty());
    let counter = tbl.lock_final().get(b"counter").unwrap();
    assert_eq!(read_counter(counter.value()), THREADS * INCREMENTS);
    assert_eq!(counter.new_version(), THREADS * INCREMENTS);
}

#[test]
fn disjoint_keys_never_conflict() {
    let tbl: Arc<StagingTable<u64, MemoryStorage>> = Arc::new(StagingTable::new(Arc::new(MemoryStorage::new())));

    let handles: Vec<_> = (0..16u64)
        .map(|tid| {
            let tbl = Arc::clone(&tbl);
            thread::spawn(move || {
                let key = format!("key-{tid}");
                tbl.put(tid, key.as_bytes(), format!("value-{tid}")).unwrap();
                tbl.merge_to_final(&tid).unwrap();
                tbl.purge(tid);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let fin = tbl.lock_final();
    assert_eq!(fin.len(), 16);
    assert!(fin.entries().all(|e| e.new_version() == 1 && e.is_dirty()));
}
