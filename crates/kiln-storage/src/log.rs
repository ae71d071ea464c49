//! Logging capability handed to the heap.
//!
//! The heap logs every mutation through a `LogManager` before applying it
//! and stamps the page with the returned LSN. `NoopLog` stands in when the
//! store runs without durability.

use kiln_common::Result;
use kiln_wal::{HeapLogRecord, LogRecord, Lsn, WalWriter};
use std::sync::Arc;

/// Write-ahead logging as seen by the heap.
pub trait LogManager: Send + Sync {
    /// Logs a heap mutation for operation `txn`, chained to `prev_lsn`.
    fn append(&self, txn: u32, prev_lsn: Lsn, record: &HeapLogRecord) -> Result<Lsn> {
        self.append_with_flags(txn, prev_lsn, record, 0)
    }

    /// Like `append`, with record flags (compensation marking).
    fn append_with_flags(
        &self,
        txn: u32,
        prev_lsn: Lsn,
        record: &HeapLogRecord,
        flags: u8,
    ) -> Result<Lsn>;

    /// Closes operation `txn` with a commit or abort record.
    fn end_op(&self, txn: u32, prev_lsn: Lsn, committed: bool) -> Result<Lsn>;

    /// Makes the log durable up to and including `lsn`.
    fn flush_to(&self, lsn: Lsn) -> Result<()>;

    /// Makes the whole log durable.
    fn flush(&self) -> Result<()>;

    /// Returns false for logs that record nothing.
    fn is_durable(&self) -> bool {
        true
    }
}

/// Log that records nothing; every LSN is `Lsn::INVALID`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLog;

impl LogManager for NoopLog {
    fn append_with_flags(&self, _: u32, _: Lsn, _: &HeapLogRecord, _: u8) -> Result<Lsn> {
        Ok(Lsn::INVALID)
    }

    fn end_op(&self, _: u32, _: Lsn, _: bool) -> Result<Lsn> {
        Ok(Lsn::INVALID)
    }

    fn flush_to(&self, _: Lsn) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Log backed by the segmented WAL.
pub struct WalLog {
    writer: Arc<WalWriter>,
}

impl WalLog {
    pub fn new(writer: Arc<WalWriter>) -> Self {
        Self { writer }
    }

    pub fn writer(&self) -> &Arc<WalWriter> {
        &self.writer
    }
}

impl LogManager for WalLog {
    fn append_with_flags(
        &self,
        txn: u32,
        prev_lsn: Lsn,
        record: &HeapLogRecord,
        flags: u8,
    ) -> Result<Lsn> {
        let mut log_record = LogRecord::new(prev_lsn, txn, record.record_type(), record.encode());
        log_record.flags = flags;
        self.writer.append(log_record)
    }

    fn end_op(&self, txn: u32, prev_lsn: Lsn, committed: bool) -> Result<Lsn> {
        if committed {
            self.writer.log_commit(txn, prev_lsn)
        } else {
            self.writer.log_abort(txn, prev_lsn)
        }
    }

    fn flush_to(&self, lsn: Lsn) -> Result<()> {
        self.writer.flush_to(lsn)
    }

    fn flush(&self) -> Result<()> {
        self.writer.flush().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kiln_wal::{AddRemOp, LogRecordType, WalReader, WalWriterConfig};
    use tempfile::tempdir;

    fn sample_record() -> HeapLogRecord {
        HeapLogRecord::AddRem {
            op: AddRemOp::Add,
            pgno: 2,
            slot: 0,
            page_lsn: Lsn::INVALID,
            header: Bytes::from_static(&[0, 0, 3, 0]),
            data: Bytes::from_static(b"abc"),
        }
    }

    #[test]
    fn test_noop_log() {
        let log = NoopLog;
        assert!(!log.is_durable());
        assert_eq!(log.append(1, Lsn::INVALID, &sample_record()).unwrap(), Lsn::INVALID);
        assert_eq!(log.end_op(1, Lsn::INVALID, true).unwrap(), Lsn::INVALID);
    }

    #[test]
    fn test_wal_log_writes_records() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(
            WalWriter::new(WalWriterConfig {
                wal_dir: dir.path().to_path_buf(),
                segment_size: 64 * 1024,
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let log = WalLog::new(writer.clone());

        let lsn = log.append(9, Lsn::INVALID, &sample_record()).unwrap();
        assert!(lsn.is_valid());
        log.end_op(9, lsn, true).unwrap();
        log.flush_to(lsn).unwrap();
        writer.close().unwrap();

        let records = WalReader::open(dir.path()).unwrap().scan_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, LogRecordType::HeapAdd);
        assert_eq!(records[0].txn_id, 9);
        assert_eq!(
            HeapLogRecord::decode(records[0].record_type, &records[0].payload).unwrap(),
            sample_record()
        );
        assert_eq!(records[1].record_type, LogRecordType::Commit);
        assert_eq!(records[1].prev_lsn, lsn);
    }
}
