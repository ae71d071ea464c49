//! WAL segment files.

use crate::record::{LogRecord, Lsn};
use kiln_common::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Unique identifier for a WAL segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u32);

impl SegmentId {
    /// First segment ID.
    pub const FIRST: SegmentId = SegmentId(1);

    /// Returns the next segment ID.
    pub fn next(&self) -> Self {
        SegmentId(self.0 + 1)
    }

    /// Generates the filename for this segment.
    pub fn filename(&self) -> String {
        format!("{:016}.wal", self.0)
    }

    /// Parses a segment filename back into its ID.
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.extension()? != "wal" {
            return None;
        }
        path.file_stem()?.to_str()?.parse::<u32>().ok().map(SegmentId)
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

/// Header at the beginning of each segment file.
///
/// Layout (32 bytes):
/// - magic: 4 bytes ("KWAL")
/// - version: 4 bytes
/// - segment_id: 4 bytes
/// - segment_size: 4 bytes
/// - first_lsn: 8 bytes
/// - flags: 4 bytes
/// - checksum: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub segment_id: SegmentId,
    pub segment_size: u32,
    pub first_lsn: Lsn,
    pub flags: u32,
    pub checksum: u32,
}

impl SegmentHeader {
    /// Magic bytes identifying a WAL segment.
    pub const MAGIC: [u8; 4] = *b"KWAL";
    /// Current format version.
    pub const VERSION: u32 = 1;
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Creates a new segment header.
    pub fn new(segment_id: SegmentId, segment_size: u32) -> Self {
        let mut header = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            segment_id,
            segment_size,
            first_lsn: Lsn::new(segment_id.0, Self::SIZE as u32),
            flags: 0,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32fast::hash(&bytes[..Self::SIZE - 4])
    }

    /// Validates magic, version and checksum.
    pub fn validate(&self) -> Result<()> {
        let corrupted = |reason: String| KilnError::WalCorrupted {
            lsn: self.first_lsn.0,
            reason,
        };
        if self.magic != Self::MAGIC {
            return Err(corrupted("invalid magic bytes".to_string()));
        }
        if self.version != Self::VERSION {
            return Err(corrupted(format!("unsupported version: {}", self.version)));
        }
        if self.checksum != self.compute_checksum() {
            return Err(corrupted("header checksum mismatch".to_string()));
        }
        Ok(())
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[0..4].copy_from_slice(&self.magic);
        data[4..8].copy_from_slice(&self.version.to_le_bytes());
        data[8..12].copy_from_slice(&self.segment_id.0.to_le_bytes());
        data[12..16].copy_from_slice(&self.segment_size.to_le_bytes());
        data[16..24].copy_from_slice(&self.first_lsn.0.to_le_bytes());
        data[24..28].copy_from_slice(&self.flags.to_le_bytes());
        data[28..32].copy_from_slice(&self.checksum.to_le_bytes());
        data
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&data[16..24]);

        Self {
            magic,
            version: u32_at(4),
            segment_id: SegmentId(u32_at(8)),
            segment_size: u32_at(12),
            first_lsn: Lsn(u64::from_le_bytes(lsn)),
            flags: u32_at(24),
            checksum: u32_at(28),
        }
    }
}

/// A single WAL segment file.
pub struct LogSegment {
    path: PathBuf,
    header: SegmentHeader,
    /// Offset just past the last valid record.
    write_offset: u32,
    file: Option<File>,
}

impl LogSegment {
    /// Default segment size (16 MB).
    pub const DEFAULT_SIZE: u32 = 16 * 1024 * 1024;

    /// Creates a new segment file.
    pub fn create(wal_dir: &Path, segment_id: SegmentId, segment_size: u32) -> Result<Self> {
        let path = wal_dir.join(segment_id.filename());
        let header = SegmentHeader::new(segment_id, segment_size);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&header.to_bytes())?;
        file.sync_all()?;

        Ok(Self {
            path,
            header,
            write_offset: SegmentHeader::SIZE as u32,
            file: Some(file),
        })
    }

    /// Opens an existing segment file.
    ///
    /// The write position is placed after the last record that decodes
    /// cleanly; a torn tail left by a crash is cut off.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header_bytes = [0u8; SegmentHeader::SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes);
        header.validate()?;

        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        let (_, valid_len) = parse_records(header.segment_id, &body);
        let write_offset = (SegmentHeader::SIZE + valid_len) as u32;

        if valid_len < body.len() {
            warn!(
                segment = %header.segment_id,
                kept = valid_len,
                dropped = body.len() - valid_len,
                "truncating torn WAL tail"
            );
            file.set_len(write_offset as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            write_offset,
            file: Some(file),
        })
    }

    /// Returns the segment ID.
    pub fn segment_id(&self) -> SegmentId {
        self.header.segment_id
    }

    /// Returns the LSN of the first record slot in this segment.
    pub fn first_lsn(&self) -> Lsn {
        self.header.first_lsn
    }

    /// Returns the current write offset.
    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    /// Returns the LSN the next appended record will get.
    pub fn next_lsn(&self) -> Lsn {
        Lsn::new(self.header.segment_id.0, self.write_offset)
    }

    /// Returns the remaining space in this segment.
    pub fn remaining_space(&self) -> u32 {
        self.header.segment_size.saturating_sub(self.write_offset)
    }

    /// Returns true if this segment has space for a record of the given size.
    pub fn has_space(&self, record_size: usize) -> bool {
        self.remaining_space() as usize >= record_size
    }

    /// Returns true if nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.write_offset as usize == SegmentHeader::SIZE
    }

    /// Returns the path to this segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record, stamping it with its LSN.
    pub fn append(&mut self, record: &mut LogRecord) -> Result<Lsn> {
        let record_size = record.size_on_disk();
        if !self.has_space(record_size) {
            return Err(KilnError::WalWriteFailed("segment full".to_string()));
        }

        let lsn = self.next_lsn();
        record.lsn = lsn;
        let data = record.serialize()?;

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| KilnError::WalWriteFailed("segment not open for writing".to_string()))?;
        file.seek(SeekFrom::Start(self.write_offset as u64))?;
        file.write_all(&data)?;

        self.write_offset += record_size as u32;
        Ok(lsn)
    }

    /// Syncs the segment to disk.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(ref file) = self.file {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Closes the segment.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Reads every valid record in this segment.
    pub fn read_records(&mut self) -> Result<Vec<LogRecord>> {
        let file = self.file.as_mut().ok_or_else(|| KilnError::WalCorrupted {
            lsn: 0,
            reason: "segment not open".to_string(),
        })?;

        file.seek(SeekFrom::Start(SegmentHeader::SIZE as u64))?;
        let mut body = vec![0u8; self.write_offset as usize - SegmentHeader::SIZE];
        file.read_exact(&mut body)?;

        let (records, _) = parse_records(self.header.segment_id, &body);
        Ok(records)
    }
}

/// Parses records from a segment body until the first one that does not
/// decode or does not carry the LSN of its position.
///
/// Returns the records and the number of bytes they cover.
pub(crate) fn parse_records(segment_id: SegmentId, body: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        let record = match LogRecord::deserialize(&body[offset..]) {
            Ok(record) => record,
            Err(_) => break,
        };
        let expected = Lsn::new(segment_id.0, (SegmentHeader::SIZE + offset) as u32);
        if record.lsn != expected {
            break;
        }
        offset += record.size_on_disk();
        records.push(record);
    }

    (records, offset)
}
