//! WAL reader for log replay and recovery.

use crate::record::{LogRecord, LogRecordType, Lsn};
use crate::segment::{LogSegment, SegmentId};
use kiln_common::{KilnError, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// WAL reader for scanning log records in LSN order.
pub struct WalReader {
    segments: BTreeMap<SegmentId, PathBuf>,
}

impl WalReader {
    /// Indexes the segment files in `wal_dir`. A missing directory reads as
    /// an empty log.
    pub fn open(wal_dir: &Path) -> Result<Self> {
        let mut segments = BTreeMap::new();

        if wal_dir.exists() {
            for entry in std::fs::read_dir(wal_dir)? {
                let path = entry?.path();
                if let Some(id) = SegmentId::from_path(&path) {
                    segments.insert(id, path);
                }
            }
        }

        Ok(Self { segments })
    }

    /// Returns the number of segment files.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the first segment ID, if any.
    pub fn first_segment_id(&self) -> Option<SegmentId> {
        self.segments.keys().next().copied()
    }

    /// Returns the last segment ID, if any.
    pub fn last_segment_id(&self) -> Option<SegmentId> {
        self.segments.keys().next_back().copied()
    }

    /// Opens a segment by ID.
    pub fn open_segment(&self, segment_id: SegmentId) -> Result<LogSegment> {
        let path = self
            .segments
            .get(&segment_id)
            .ok_or_else(|| KilnError::WalCorrupted {
                lsn: 0,
                reason: format!("segment {} not found", segment_id),
            })?;
        LogSegment::open(path)
    }

    /// Scans all records in the WAL in LSN order.
    ///
    /// Segments must be consecutive; a gap means a lost segment.
    pub fn scan_all(&self) -> Result<Vec<LogRecord>> {
        let mut results = Vec::new();
        let mut expected: Option<SegmentId> = None;

        for &segment_id in self.segments.keys() {
            if let Some(expected) = expected {
                if segment_id != expected {
                    return Err(KilnError::WalCorrupted {
                        lsn: Lsn::new(expected.0, 0).0,
                        reason: format!("missing WAL segment {}", expected),
                    });
                }
            }
            let mut segment = self.open_segment(segment_id)?;
            results.extend(segment.read_records()?);
            segment.close()?;
            expected = Some(segment_id.next());
        }

        Ok(results)
    }

    /// Scans all records at or after `start_lsn`.
    pub fn scan_from(&self, start_lsn: Lsn) -> Result<Vec<LogRecord>> {
        let first_segment = SegmentId(start_lsn.segment_id());
        let mut results = Vec::new();

        for (&segment_id, _) in self.segments.range(first_segment..) {
            let mut segment = self.open_segment(segment_id)?;
            results.extend(
                segment
                    .read_records()?
                    .into_iter()
                    .filter(|r| r.lsn >= start_lsn),
            );
            segment.close()?;
        }

        Ok(results)
    }

    /// Returns the operations that have records but no commit or abort.
    pub fn find_incomplete_operations(&self) -> Result<Vec<u32>> {
        let mut open = HashSet::new();
        for record in self.scan_all()? {
            match record.record_type {
                LogRecordType::Commit | LogRecordType::Abort => {
                    open.remove(&record.txn_id);
                }
                LogRecordType::Invalid => {}
                _ => {
                    open.insert(record.txn_id);
                }
            }
        }
        let mut ids: Vec<u32> = open.into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{WalWriter, WalWriterConfig};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn create_test_writer(dir: &Path, segment_size: u32) -> WalWriter {
        WalWriter::new(WalWriterConfig {
            wal_dir: dir.to_path_buf(),
            segment_size,
            fsync_enabled: false,
        })
        .unwrap()
    }

    fn add(txn_id: u32, prev: Lsn, payload: &[u8]) -> LogRecord {
        LogRecord::new(
            prev,
            txn_id,
            LogRecordType::HeapAdd,
            Bytes::copy_from_slice(payload),
        )
    }

    #[test]
    fn test_reader_empty_directory() {
        let dir = tempdir().unwrap();
        let reader = WalReader::open(&dir.path().join("missing")).unwrap();
        assert_eq!(reader.segment_count(), 0);
        assert!(reader.scan_all().unwrap().is_empty());
    }

    #[test]
    fn test_reader_scan_all_in_order() {
        let dir = tempdir().unwrap();
        let writer = create_test_writer(dir.path(), 1024);

        let mut written = Vec::new();
        let mut prev = Lsn::INVALID;
        for i in 0..30u8 {
            prev = writer.append(add(1, prev, &[i; 40])).unwrap();
            written.push(prev);
        }
        writer.close().unwrap();

        let reader = WalReader::open(dir.path()).unwrap();
        assert!(reader.segment_count() > 1);
        let records = reader.scan_all().unwrap();
        let lsns: Vec<Lsn> = records.iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, written);
        assert_eq!(records[29].payload[0], 29);
        assert_eq!(records[29].prev_lsn, written[28]);
    }

    #[test]
    fn test_reader_scan_from() {
        let dir = tempdir().unwrap();
        let writer = create_test_writer(dir.path(), 1024);

        let mut lsns = Vec::new();
        for i in 0..20u8 {
            lsns.push(writer.append(add(1, Lsn::INVALID, &[i; 40])).unwrap());
        }
        writer.close().unwrap();

        let reader = WalReader::open(dir.path()).unwrap();
        let tail = reader.scan_from(lsns[12]).unwrap();
        assert_eq!(tail.len(), 8);
        assert_eq!(tail[0].lsn, lsns[12]);
    }

    #[test]
    fn test_reader_incomplete_operations() {
        let dir = tempdir().unwrap();
        let writer = create_test_writer(dir.path(), 64 * 1024);

        let a = writer.append(add(1, Lsn::INVALID, b"a")).unwrap();
        writer.log_commit(1, a).unwrap();
        let b = writer.append(add(2, Lsn::INVALID, b"b")).unwrap();
        writer.log_abort(2, b).unwrap();
        writer.append(add(3, Lsn::INVALID, b"c")).unwrap();
        // id 1 reused after its commit, left open
        writer.append(add(1, Lsn::INVALID, b"d")).unwrap();
        writer.close().unwrap();

        let reader = WalReader::open(dir.path()).unwrap();
        assert_eq!(reader.find_incomplete_operations().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_reader_missing_segment() {
        let dir = tempdir().unwrap();
        let writer = create_test_writer(dir.path(), 512);
        for i in 0..30u8 {
            writer.append(add(1, Lsn::INVALID, &[i; 40])).unwrap();
        }
        writer.close().unwrap();
        std::fs::remove_file(dir.path().join(SegmentId(2).filename())).unwrap();

        let reader = WalReader::open(dir.path()).unwrap();
        assert!(matches!(
            reader.scan_all(),
            Err(KilnError::WalCorrupted { .. })
        ));
    }
}
