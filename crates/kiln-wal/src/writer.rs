//! WAL writer for appending log records.

use crate::record::{LogRecord, Lsn};
use crate::segment::{LogSegment, SegmentHeader, SegmentId};
use kiln_common::{KilnError, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Configuration for the WAL writer.
#[derive(Debug, Clone)]
pub struct WalWriterConfig {
    /// Directory for WAL segment files.
    pub wal_dir: PathBuf,
    /// Maximum size of each segment file.
    pub segment_size: u32,
    /// Sync the segment on commit/abort and on explicit flushes.
    pub fsync_enabled: bool,
}

impl Default for WalWriterConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./data/wal"),
            segment_size: LogSegment::DEFAULT_SIZE,
            fsync_enabled: true,
        }
    }
}

/// Thread-safe WAL writer.
///
/// Handles appending log records, segment rotation, and fsync.
pub struct WalWriter {
    config: WalWriterConfig,
    /// Active segment; None once closed.
    current_segment: Mutex<Option<LogSegment>>,
    /// Everything before this LSN is durable.
    flushed_lsn: AtomicU64,
}

impl WalWriter {
    /// Opens the log in `config.wal_dir`, continuing the newest segment.
    pub fn new(config: WalWriterConfig) -> Result<Self> {
        if (config.segment_size as usize) < SegmentHeader::SIZE + LogRecord::HEADER_SIZE * 4 {
            return Err(KilnError::ConfigError(format!(
                "WAL segment size {} is too small",
                config.segment_size
            )));
        }
        std::fs::create_dir_all(&config.wal_dir)?;

        let segment = Self::recover_or_create(&config)?;
        let next = segment.next_lsn();
        info!(
            wal_dir = %config.wal_dir.display(),
            segment = %segment.segment_id(),
            next_lsn = %next,
            "WAL opened"
        );

        Ok(Self {
            config,
            current_segment: Mutex::new(Some(segment)),
            flushed_lsn: AtomicU64::new(next.0),
        })
    }

    fn recover_or_create(config: &WalWriterConfig) -> Result<LogSegment> {
        let mut latest: Option<(SegmentId, PathBuf)> = None;
        for entry in std::fs::read_dir(&config.wal_dir)? {
            let path = entry?.path();
            if let Some(id) = SegmentId::from_path(&path) {
                if latest.as_ref().map_or(true, |(best, _)| id > *best) {
                    latest = Some((id, path));
                }
            }
        }

        match latest {
            Some((_, path)) => LogSegment::open(&path),
            None => LogSegment::create(&config.wal_dir, SegmentId::FIRST, config.segment_size),
        }
    }

    /// Returns the directory containing WAL segments.
    pub fn wal_dir(&self) -> &Path {
        &self.config.wal_dir
    }

    /// Returns the LSN the next record will get.
    pub fn next_lsn(&self) -> Lsn {
        self.current_segment
            .lock()
            .as_ref()
            .map_or(Lsn::INVALID, |s| s.next_lsn())
    }

    /// Returns the flushed boundary: every record below it is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::SeqCst))
    }

    /// Returns the current segment ID.
    pub fn current_segment_id(&self) -> Option<SegmentId> {
        self.current_segment.lock().as_ref().map(|s| s.segment_id())
    }

    /// Appends a log record and returns its LSN.
    ///
    /// Commit and abort records are synced when fsync is enabled.
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        let record_size = record.size_on_disk();

        let mut segment_guard = self.current_segment.lock();
        let segment = segment_guard
            .as_mut()
            .ok_or_else(|| KilnError::WalWriteFailed("WAL closed".to_string()))?;

        if !segment.has_space(record_size) {
            if segment.is_empty() {
                return Err(KilnError::WalWriteFailed(format!(
                    "record of {} bytes exceeds segment size",
                    record_size
                )));
            }
            self.rotate(segment)?;
        }

        let lsn = segment.append(&mut record)?;

        if self.config.fsync_enabled && record.record_type.is_terminal() {
            segment.sync()?;
            self.flushed_lsn.store(segment.next_lsn().0, Ordering::SeqCst);
        }

        Ok(lsn)
    }

    /// Closes `segment` and replaces it with the next one.
    fn rotate(&self, segment: &mut LogSegment) -> Result<()> {
        let old_end = segment.next_lsn();
        segment.sync()?;
        segment.close()?;
        self.flushed_lsn.store(old_end.0, Ordering::SeqCst);

        let new_id = segment.segment_id().next();
        *segment = LogSegment::create(&self.config.wal_dir, new_id, self.config.segment_size)?;
        debug!(segment = %new_id, "WAL segment rotated");
        Ok(())
    }

    /// Logs a commit for an operation.
    pub fn log_commit(&self, txn_id: u32, prev_lsn: Lsn) -> Result<Lsn> {
        self.append(LogRecord::commit(prev_lsn, txn_id))
    }

    /// Logs an abort for an operation.
    pub fn log_abort(&self, txn_id: u32, prev_lsn: Lsn) -> Result<Lsn> {
        self.append(LogRecord::abort(prev_lsn, txn_id))
    }

    /// Forces all appended records to disk and returns the flushed boundary.
    pub fn flush(&self) -> Result<Lsn> {
        let mut segment_guard = self.current_segment.lock();
        match segment_guard.as_mut() {
            Some(segment) => {
                if self.config.fsync_enabled {
                    segment.sync()?;
                }
                let lsn = segment.next_lsn();
                self.flushed_lsn.store(lsn.0, Ordering::SeqCst);
                Ok(lsn)
            }
            None => Ok(self.flushed_lsn()),
        }
    }

    /// Makes the record at `lsn` durable, flushing only if needed.
    pub fn flush_to(&self, lsn: Lsn) -> Result<()> {
        if !lsn.is_valid() || lsn < self.flushed_lsn() {
            return Ok(());
        }
        self.flush().map(|_| ())
    }

    /// Closes the WAL writer.
    pub fn close(&self) -> Result<()> {
        let mut segment_guard = self.current_segment.lock();
        if let Some(mut segment) = segment_guard.take() {
            segment.sync()?;
            self.flushed_lsn.store(segment.next_lsn().0, Ordering::SeqCst);
            segment.close()?;
        }
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
