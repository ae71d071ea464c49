//! Multi-threaded access to one heap file.
//!
//! A detected deadlock or a lock timeout rolls the losing operation back,
//! so workers retry those. Contention on candidate pages never reaches the
//! caller; anything else is a failure.

use std::collections::HashSet;
use std::thread;

use kiln_common::{KilnError, Result};
use kiln_storage::{HeapFile, HeapFileConfig, Rid};

const THREADS: usize = 4;

fn create_test_heap() -> HeapFile {
    HeapFile::in_memory(HeapFileConfig {
        page_size: 512,
        region_size: Some(16),
        buffer_pool_pages: 256,
        ..Default::default()
    })
    .unwrap()
}

fn pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(7) + seed) as u8).collect()
}

fn retry<T>(mut op: impl FnMut() -> Result<T>) -> T {
    loop {
        match op() {
            Ok(value) => return value,
            Err(KilnError::Deadlock { .. }) | Err(KilnError::LockTimeout { .. }) => {
                thread::yield_now()
            }
            Err(err) => panic!("unexpected error: {}", err),
        }
    }
}

#[test]
fn test_parallel_appends() {
    let heap = create_test_heap();

    let per_thread: Vec<Vec<(Rid, Vec<u8>)>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = &heap;
                s.spawn(move || {
                    (0..150)
                        .map(|i| {
                            let len = if i % 10 == 0 { 1100 } else { 20 + (i * 13) % 200 };
                            let data = pattern(len, t * 1000 + i);
                            (retry(|| heap.append(&data)), data)
                        })
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for (rid, data) in per_thread.iter().flatten() {
        assert!(seen.insert(*rid), "rid {} handed out twice", rid);
        assert_eq!(&heap.get(*rid).unwrap(), data);
    }
    assert_eq!(seen.len(), THREADS * 150);

    let report = heap.verify().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(report.records, THREADS * 150);
    assert_eq!(heap.stats().locked_pages, 0);
    assert!(!heap.is_failed());
}

#[test]
fn test_writers_and_readers() {
    let heap = create_test_heap();
    let owned: Vec<Vec<Rid>> = (0..THREADS)
        .map(|t| {
            (0..20)
                .map(|i| heap.append(&pattern(64, t * 100 + i)).unwrap())
                .collect()
        })
        .collect();

    thread::scope(|s| {
        for (t, rids) in owned.iter().enumerate() {
            let heap = &heap;
            s.spawn(move || {
                for round in 1..=5 {
                    for rid in rids {
                        let len = (round * 300 + rid.slot as usize * 11) % 1600;
                        let data = pattern(len, t + round);
                        retry(|| heap.put(*rid, &data));
                        assert_eq!(retry(|| heap.get(*rid)), data);
                    }
                }
            });
        }
        // a reader walking everything while the writers run
        let heap = &heap;
        s.spawn(move || {
            for _ in 0..10 {
                let count = retry(|| {
                    let mut cursor = heap.cursor();
                    let mut count = 0usize;
                    let mut at = cursor.first()?;
                    while at.is_some() {
                        count += 1;
                        at = cursor.next()?;
                    }
                    Ok(count)
                });
                assert_eq!(count, THREADS * 20);
            }
        });
    });

    for (t, rids) in owned.iter().enumerate() {
        for rid in rids {
            let len = (5 * 300 + rid.slot as usize * 11) % 1600;
            assert_eq!(heap.get(*rid).unwrap(), pattern(len, t + 5));
        }
    }
    let report = heap.verify().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(heap.stats().locked_pages, 0);
}

#[test]
fn test_parallel_deletes_free_space() {
    let heap = create_test_heap();
    let rids: Vec<Rid> = (0..200)
        .map(|i| heap.append(&pattern(if i % 4 == 0 { 900 } else { 100 }, i)).unwrap())
        .collect();

    thread::scope(|s| {
        for chunk in rids.chunks(rids.len() / THREADS) {
            let heap = &heap;
            s.spawn(move || {
                for rid in chunk {
                    retry(|| heap.delete(*rid));
                }
            });
        }
    });

    let mut cursor = heap.cursor();
    assert_eq!(cursor.first().unwrap(), None);
    drop(cursor);
    let report = heap.verify().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(report.fragments, 0);
}
