//! Heap record store integration tests.
//!
//! Exercises the public surface end to end on small pages, where records
//! split quickly:
//! - append/get/put/delete round trips across sizes
//! - partial overwrites against a byte model
//! - positional scans in both directions
//! - heap-full handling and rollback of partial writes
//! - read targets and bitmap consistency

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Once;

use kiln_common::KilnError;
use kiln_storage::{HeapFile, HeapFileConfig, LockMode, ReadRange, ReadTarget, Rid};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn create_test_heap(max_pages: Option<u32>) -> HeapFile {
    init_tracing();
    HeapFile::in_memory(HeapFileConfig {
        page_size: 512,
        max_pages,
        buffer_pool_pages: 128,
        ..Default::default()
    })
    .unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn scan_forward(heap: &HeapFile) -> Vec<Rid> {
    let mut cursor = heap.cursor();
    let mut rids = Vec::new();
    let mut next = cursor.first().unwrap();
    while let Some(rid) = next {
        rids.push(rid);
        next = cursor.next().unwrap();
    }
    rids
}

fn scan_backward(heap: &HeapFile) -> Vec<Rid> {
    let mut cursor = heap.cursor();
    let mut rids = Vec::new();
    let mut prev = cursor.last().unwrap();
    while let Some(rid) = prev {
        rids.push(rid);
        prev = cursor.prev().unwrap();
    }
    rids
}

fn assert_verified(heap: &HeapFile) {
    let report = heap.verify().unwrap();
    assert!(report.is_ok(), "{:#?}", report.problems);
}

// =============================================================================
// Round trips
// =============================================================================

#[test]
fn test_small_page_scenario() {
    let heap = create_test_heap(None);
    let first = heap.append(&pattern(10, 1)).unwrap();
    let second = heap.append(&pattern(10, 2)).unwrap();
    assert_eq!(first, Rid::new(2, 0));
    assert_eq!(second, Rid::new(2, 1));

    heap.delete(first).unwrap();
    assert!(matches!(heap.get(Rid::new(2, 0)), Err(KilnError::NotFound)));
    assert_eq!(heap.get(Rid::new(2, 1)).unwrap(), pattern(10, 2));

    let big = pattern(2000, 3);
    let rid = heap.append(&big).unwrap();
    assert!(heap.fragment_chain(rid).unwrap().len() >= 4);
    assert_eq!(heap.get(rid).unwrap(), big);
    assert_eq!(heap.get(second).unwrap(), pattern(10, 2));
    assert_verified(&heap);
}

#[test]
fn test_round_trip_sizes() {
    let heap = create_test_heap(None);
    let sizes = [0usize, 1, 3, 4, 471, 472, 473, 476, 510, 1024, 2000, 5000];
    let rids: Vec<(Rid, Vec<u8>)> = sizes
        .iter()
        .enumerate()
        .map(|(i, &len)| {
            let data = pattern(len, i as u8);
            (heap.append(&data).unwrap(), data)
        })
        .collect();

    let mut cursor = heap.cursor();
    for (rid, data) in &rids {
        assert_eq!(&heap.get(*rid).unwrap(), data, "record {}", rid);
        cursor.set(*rid).unwrap();
        assert_eq!(&cursor.current().unwrap().unwrap().1, data);
    }
    drop(cursor);
    assert_verified(&heap);
}

#[test]
fn test_put_keeps_rid_through_sizes() {
    let heap = create_test_heap(None);
    let rid = heap.append(b"seed").unwrap();
    for (i, len) in [100usize, 3000, 40, 0, 900, 473, 12_000, 5].into_iter().enumerate() {
        let data = pattern(len, i as u8);
        heap.put(rid, &data).unwrap();
        assert_eq!(heap.get(rid).unwrap(), data, "length {}", len);
        assert_verified(&heap);
    }
    assert_eq!(scan_forward(&heap), vec![rid]);
}

#[test]
fn test_delete_split_record_leaves_nothing() {
    let heap = create_test_heap(None);
    let keep = heap.append(b"neighbour").unwrap();
    let rid = heap.append(&pattern(4000, 9)).unwrap();
    heap.delete(rid).unwrap();

    assert!(matches!(heap.get(rid), Err(KilnError::NotFound)));
    assert_eq!(scan_forward(&heap), vec![keep]);
    let report = heap.verify().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(report.fragments, 1);
}

// =============================================================================
// Partial overwrites
// =============================================================================

fn apply_model(model: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if end > model.len() {
        model.resize(end, 0);
    }
    model[offset..end].copy_from_slice(data);
}

#[test]
fn test_put_range_edges() {
    let heap = create_test_heap(None);
    let mut model = pattern(1400, 4);
    let rid = heap.append(&model).unwrap();

    // across fragment boundaries, past the end, and far past the end
    for (offset, len) in [(0, 1), (455, 10), (459, 2), (900, 600), (1600, 20), (3000, 0)] {
        let data = pattern(len, offset as u8);
        heap.put_range(rid, offset, &data).unwrap();
        apply_model(&mut model, offset, &data);
        assert_eq!(heap.get(rid).unwrap(), model, "range {}+{}", offset, len);
    }
    assert_eq!(model.len(), 3000);
    assert_verified(&heap);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_put_range_matches_model(
        initial in 0usize..1500,
        offset in 0usize..2000,
        len in 0usize..700,
        seed in any::<u8>(),
    ) {
        let heap = create_test_heap(None);
        let mut model = pattern(initial, seed);
        let rid = heap.append(&model).unwrap();
        let other = heap.append(&pattern(300, seed.wrapping_add(1))).unwrap();

        let data = pattern(len, seed.wrapping_add(2));
        heap.put_range(rid, offset, &data).unwrap();
        apply_model(&mut model, offset, &data);

        prop_assert_eq!(heap.get(rid).unwrap(), model);
        prop_assert_eq!(heap.get(other).unwrap(), pattern(300, seed.wrapping_add(1)));
        let report = heap.verify().unwrap();
        prop_assert!(report.is_ok(), "{:?}", report.problems);
    }
}

// =============================================================================
// Scans
// =============================================================================

#[test]
fn test_scan_totality_under_random_workload() {
    let heap = create_test_heap(None);
    let mut rng = StdRng::seed_from_u64(0x6b696c6e);
    let mut live: BTreeMap<(u32, u32), Vec<u8>> = BTreeMap::new();

    for step in 0..400u32 {
        let roll = rng.gen_range(0..10);
        if roll < 6 || live.is_empty() {
            let len = if rng.gen_bool(0.2) {
                rng.gen_range(500..2500)
            } else {
                rng.gen_range(0..200)
            };
            let data = pattern(len, step as u8);
            let rid = heap.append(&data).unwrap();
            assert!(live.insert((rid.pgno, rid.slot), data).is_none());
        } else {
            let keys: Vec<(u32, u32)> = live.keys().copied().collect();
            let key = keys[rng.gen_range(0..keys.len())];
            let rid = Rid::new(key.0, key.1);
            if roll < 8 {
                heap.delete(rid).unwrap();
                live.remove(&key);
            } else {
                let data = pattern(rng.gen_range(0..1500), step as u8);
                heap.put(rid, &data).unwrap();
                live.insert(key, data);
            }
        }
    }

    let expected: Vec<Rid> = live.keys().map(|&(p, s)| Rid::new(p, s)).collect();
    assert_eq!(scan_forward(&heap), expected);
    let mut backward = scan_backward(&heap);
    backward.reverse();
    assert_eq!(backward, expected);

    for (&(pgno, slot), data) in &live {
        assert_eq!(&heap.get(Rid::new(pgno, slot)).unwrap(), data);
    }
    assert_verified(&heap);
    assert_eq!(heap.stats().locked_pages, 0);
}

// =============================================================================
// Space exhaustion
// =============================================================================

#[test]
fn test_heap_full_with_page_cap() {
    let heap = create_test_heap(Some(3));
    let rid = heap.append(&pattern(400, 1)).unwrap();
    assert!(matches!(heap.append(&pattern(400, 2)), Err(KilnError::HeapFull)));

    // still usable, and small records fit in the leftover space
    assert_eq!(heap.get(rid).unwrap(), pattern(400, 1));
    heap.append(&pattern(20, 3)).unwrap();
    assert_eq!(heap.stats().locked_pages, 0);
    assert_verified(&heap);
}

#[test]
fn test_failed_split_write_is_rolled_back() {
    // meta, one region and two data pages
    let heap = create_test_heap(Some(4));
    let small = heap.append(b"tiny").unwrap();
    assert!(matches!(heap.append(&pattern(3000, 5)), Err(KilnError::HeapFull)));

    assert_eq!(scan_forward(&heap), vec![small]);
    let report = heap.verify().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(report.fragments, 1);

    // the space the failed write used is free again
    let rid = heap.append(&pattern(800, 6)).unwrap();
    assert_eq!(heap.get(rid).unwrap(), pattern(800, 6));
}

#[test]
fn test_failed_growth_keeps_old_contents() {
    let heap = create_test_heap(Some(4));
    let rid = heap.append(&pattern(300, 7)).unwrap();
    assert!(matches!(
        heap.put_range(rid, 200, &pattern(3000, 8)),
        Err(KilnError::HeapFull)
    ));
    assert_eq!(heap.get(rid).unwrap(), pattern(300, 7));
    assert_verified(&heap);
}

#[test]
fn test_fills_every_page_before_reporting_full() {
    let heap = create_test_heap(Some(12));
    let mut stored = 0usize;
    loop {
        match heap.append(&[0x5a; 100]) {
            Ok(_) => stored += 1,
            Err(KilnError::HeapFull) => break,
            Err(err) => panic!("unexpected error: {}", err),
        }
    }
    // 10 data pages of 4 records each
    assert_eq!(stored, 40);
    assert_verified(&heap);
}

// =============================================================================
// Read targets
// =============================================================================

#[test]
fn test_read_targets() {
    let heap = create_test_heap(None);
    let data = pattern(1800, 11);
    let rid = heap.append(&data).unwrap();

    let mut small = vec![0u8; 100];
    match heap.get_with(rid, ReadRange::ALL, ReadTarget::Fixed(&mut small), LockMode::Read) {
        Err(KilnError::BufferTooSmall { needed, capacity }) => {
            assert_eq!((needed, capacity), (1800, 100));
        }
        other => panic!("expected BufferTooSmall, got {:?}", other),
    }
    let n = heap
        .get_with(rid, ReadRange::new(700, 100), ReadTarget::Fixed(&mut small), LockMode::Read)
        .unwrap();
    assert_eq!(n, 100);
    assert_eq!(small, &data[700..800]);

    let mut total = 0usize;
    let mut count = |at: usize, bytes: &[u8]| -> kiln_common::Result<()> {
        assert_eq!(at, total);
        assert_eq!(bytes, &data[at..at + bytes.len()]);
        total += bytes.len();
        Ok(())
    };
    heap.get_with(rid, ReadRange::ALL, ReadTarget::Stream(&mut count), LockMode::Read)
        .unwrap();
    assert_eq!(total, 1800);

    let mut empty = Vec::new();
    let n = heap
        .get_with(Rid::new(1, 0), ReadRange::new(0, 0), ReadTarget::Alloc(&mut empty), LockMode::Read)
        .unwrap();
    assert_eq!(n, 0);
}

#[test]
fn test_stream_error_stops_the_read() {
    let heap = create_test_heap(None);
    let rid = heap.append(&pattern(1500, 12)).unwrap();
    let mut calls = 0;
    let mut refuse = |_: usize, _: &[u8]| -> kiln_common::Result<()> {
        calls += 1;
        Err(KilnError::InvalidArgument("sink closed".to_string()))
    };
    let result = heap.get_with(rid, ReadRange::ALL, ReadTarget::Stream(&mut refuse), LockMode::Read);
    assert!(matches!(result, Err(KilnError::InvalidArgument(_))));
    assert_eq!(calls, 1);
    assert!(!heap.is_failed());
    assert_eq!(heap.stats().locked_pages, 0);
}

// =============================================================================
// Cursors
// =============================================================================

#[test]
fn test_cursor_set_exact_and_range_get() {
    let heap = create_test_heap(None);
    let data = pattern(1000, 13);
    let rid = heap.append(&data).unwrap();

    let mut cursor = heap.cursor();
    assert!(matches!(cursor.set_exact(rid, &data[..999]), Err(KilnError::NotFound)));
    cursor.set_exact(rid, &data).unwrap();

    let mut out = Vec::new();
    cursor
        .get(ReadRange::from(950), ReadTarget::Alloc(&mut out))
        .unwrap();
    assert_eq!(out, &data[950..]);
}

#[test]
fn test_rmw_cursor_blocks_writers() {
    let heap = HeapFile::in_memory(HeapFileConfig {
        page_size: 512,
        buffer_pool_pages: 32,
        lock_timeout: Some(std::time::Duration::from_millis(50)),
        ..Default::default()
    })
    .unwrap();
    let rid = heap.append(b"contended").unwrap();

    let mut cursor = heap.cursor_rmw();
    cursor.set(rid).unwrap();
    assert!(matches!(
        heap.put(rid, b"other writer"),
        Err(KilnError::LockTimeout { .. })
    ));
    cursor.put(b"cursor writer").unwrap();
    drop(cursor);

    assert_eq!(heap.get(rid).unwrap(), b"cursor writer");
    assert!(!heap.is_failed());
}
