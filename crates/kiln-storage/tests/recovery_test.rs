//! Durability tests: a heap dropped without syncing its buffer pool must
//! come back from the WAL with every completed operation and nothing else.

use std::collections::BTreeMap;
use std::path::Path;

use kiln_common::{KilnError, StorageConfig};
use kiln_storage::{HeapFile, Rid};
use tempfile::tempdir;

fn create_test_config(dir: &Path) -> StorageConfig {
    StorageConfig {
        data_dir: dir.join("data"),
        wal_dir: dir.join("wal"),
        page_size: 512,
        buffer_pool_pages: 32,
        wal_segment_size: 64 * 1024,
        fsync_enabled: false,
        ..Default::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8) ^ seed).collect()
}

fn all_records(heap: &HeapFile) -> BTreeMap<(u32, u32), Vec<u8>> {
    let mut cursor = heap.cursor();
    let mut out = BTreeMap::new();
    let mut at = cursor.first().unwrap();
    while let Some(rid) = at {
        let (_, data) = cursor.current().unwrap().unwrap();
        out.insert((rid.pgno, rid.slot), data);
        at = cursor.next().unwrap();
    }
    out
}

#[test]
fn test_crash_after_mixed_workload() {
    let dir = tempdir().unwrap();
    let config = create_test_config(dir.path());

    let expected = {
        let heap = HeapFile::open(&config).unwrap();
        let mut live = BTreeMap::new();
        let mut rids = Vec::new();
        for i in 0..60u8 {
            let data = pattern(if i % 5 == 0 { 1800 } else { 40 + i as usize }, i);
            let rid = heap.append(&data).unwrap();
            live.insert((rid.pgno, rid.slot), data);
            rids.push(rid);
        }
        for rid in rids.iter().step_by(3) {
            heap.delete(*rid).unwrap();
            live.remove(&(rid.pgno, rid.slot));
        }
        for (i, rid) in rids.iter().enumerate().filter(|(i, _)| i % 3 != 0).step_by(2) {
            let data = pattern(i * 37 % 1300, 0x55);
            heap.put(*rid, &data).unwrap();
            live.insert((rid.pgno, rid.slot), data);
        }
        live
        // dropped without a sync
    };

    let heap = HeapFile::open(&config).unwrap();
    assert_eq!(all_records(&heap), expected);
    let report = heap.verify().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(report.records, expected.len());
}

#[test]
fn test_repeated_recovery_is_stable() {
    let dir = tempdir().unwrap();
    let config = create_test_config(dir.path());

    let rid = {
        let heap = HeapFile::open(&config).unwrap();
        heap.append(&pattern(2500, 1)).unwrap()
    };
    for round in 0..3u8 {
        let heap = HeapFile::open(&config).unwrap();
        assert_eq!(heap.get(rid).unwrap(), pattern(2500, 1), "round {}", round);
        assert!(heap.verify().unwrap().is_ok());
    }

    // new work after recovery lands on top of the recovered state
    let added = {
        let heap = HeapFile::open(&config).unwrap();
        heap.append(b"after recovery").unwrap()
    };
    let heap = HeapFile::open(&config).unwrap();
    assert_eq!(heap.get(rid).unwrap(), pattern(2500, 1));
    assert_eq!(heap.get(added).unwrap(), b"after recovery");
    assert_ne!(rid, added);
}

#[test]
fn test_wal_spanning_segments() {
    let dir = tempdir().unwrap();
    let config = create_test_config(dir.path());

    let rids: Vec<Rid> = {
        let heap = HeapFile::open(&config).unwrap();
        (0..100u8)
            .map(|i| heap.append(&pattern(2000, i)).unwrap())
            .collect()
    };
    let segments = std::fs::read_dir(&config.wal_dir).unwrap().count();
    assert!(segments > 1, "expected several WAL segments, found {}", segments);

    let heap = HeapFile::open(&config).unwrap();
    for (i, rid) in rids.iter().enumerate() {
        assert_eq!(heap.get(*rid).unwrap(), pattern(2000, i as u8));
    }
    assert!(heap.verify().unwrap().is_ok());
}

#[test]
fn test_deleted_record_stays_deleted() {
    let dir = tempdir().unwrap();
    let config = create_test_config(dir.path());

    let (gone, kept) = {
        let heap = HeapFile::open(&config).unwrap();
        let gone = heap.append(&pattern(1200, 2)).unwrap();
        let kept = heap.append(b"kept").unwrap();
        heap.sync().unwrap();
        heap.delete(gone).unwrap();
        (gone, kept)
    };

    let heap = HeapFile::open(&config).unwrap();
    assert!(matches!(heap.get(gone), Err(KilnError::NotFound)));
    assert_eq!(heap.get(kept).unwrap(), b"kept");
    let report = heap.verify().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(report.fragments, 1);
}

#[test]
fn test_without_wal_sync_persists() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        wal_enabled: false,
        ..create_test_config(dir.path())
    };

    let rid = {
        let heap = HeapFile::open(&config).unwrap();
        let rid = heap.append(&pattern(900, 3)).unwrap();
        heap.sync().unwrap();
        rid
    };
    let heap = HeapFile::open(&config).unwrap();
    assert_eq!(heap.get(rid).unwrap(), pattern(900, 3));
}

#[test]
fn test_open_from_toml_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kiln.toml");
    let contents = format!(
        "data_dir = {:?}\nwal_dir = {:?}\npage_size = 1024\nbuffer_pool_pages = 16\nfsync_enabled = false\nregion_size = 4\n",
        dir.path().join("data").display().to_string(),
        dir.path().join("wal").display().to_string(),
    );
    std::fs::write(&path, contents).unwrap();

    let config = StorageConfig::load(&path).unwrap();
    assert_eq!(config.page_size, 1024);
    assert_eq!(config.region_size, Some(4));

    let rid = {
        let heap = HeapFile::open(&config).unwrap();
        assert_eq!(heap.page_size(), 1024);
        assert_eq!(heap.geometry().region_size(), 4);
        heap.append(&pattern(3000, 4)).unwrap()
    };
    let heap = HeapFile::open(&config).unwrap();
    assert_eq!(heap.get(rid).unwrap(), pattern(3000, 4));
}

#[test]
fn test_reopen_with_other_page_size_fails() {
    let dir = tempdir().unwrap();
    let config = create_test_config(dir.path());
    {
        let heap = HeapFile::open(&config).unwrap();
        heap.append(b"x").unwrap();
        heap.sync().unwrap();
    }
    let other = StorageConfig {
        page_size: 1024,
        ..config
    };
    assert!(HeapFile::open(&other).is_err());
}
