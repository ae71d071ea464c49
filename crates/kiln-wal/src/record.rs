//! WAL log record format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kiln_common::{KilnError, Result};
use serde::{Deserialize, Serialize};

/// Log Sequence Number - unique identifier for each log record.
///
/// LSN is a monotonically increasing 64-bit value that identifies
/// the position of a record in the WAL. It encodes both the segment
/// ID and offset within the segment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(0);

    /// First valid LSN.
    pub const FIRST: Lsn = Lsn(1);

    /// Creates a new LSN from segment ID and offset.
    pub fn new(segment_id: u32, offset: u32) -> Self {
        Self(((segment_id as u64) << 32) | (offset as u64))
    }

    /// Returns the segment ID portion of this LSN.
    pub fn segment_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the offset within the segment.
    pub fn offset(&self) -> u32 {
        self.0 as u32
    }

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Returns the LSN `bytes` further into the same segment.
    pub fn advance(&self, bytes: u32) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.segment_id(), self.offset())
    }
}

/// Types of log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogRecordType {
    /// Invalid/padding record.
    Invalid = 0,
    /// Operation committed.
    Commit = 2,
    /// Operation rolled back.
    Abort = 3,
    /// Fragment added to a data page slot.
    HeapAdd = 10,
    /// Fragment removed from a data page slot.
    HeapRemove = 11,
    /// Page allocated from the metadata page.
    HeapPageAlloc = 12,
}

impl LogRecordType {
    /// Returns true for records that end an operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LogRecordType::Commit | LogRecordType::Abort)
    }
}

impl TryFrom<u8> for LogRecordType {
    type Error = KilnError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogRecordType::Invalid),
            2 => Ok(LogRecordType::Commit),
            3 => Ok(LogRecordType::Abort),
            10 => Ok(LogRecordType::HeapAdd),
            11 => Ok(LogRecordType::HeapRemove),
            12 => Ok(LogRecordType::HeapPageAlloc),
            _ => Err(KilnError::WalCorrupted {
                lsn: 0,
                reason: format!("invalid record type: {}", value),
            }),
        }
    }
}

/// A single log record in the WAL.
///
/// Record format on disk:
/// - header (24 bytes):
///   - lsn: 8 bytes
///   - prev_lsn: 8 bytes (chains the records of one operation)
///   - txn_id: 4 bytes
///   - record_type: 1 byte
///   - flags: 1 byte
///   - payload_len: 2 bytes
/// - payload: variable length
/// - checksum: 4 bytes (CRC32 of header + payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// LSN of this record.
    pub lsn: Lsn,
    /// LSN of the previous record in this operation.
    pub prev_lsn: Lsn,
    /// Operation (transaction) ID.
    pub txn_id: u32,
    /// Type of this record.
    pub record_type: LogRecordType,
    /// Record flags.
    pub flags: u8,
    /// Record payload.
    pub payload: Bytes,
}

impl LogRecord {
    /// Size of the record header in bytes.
    pub const HEADER_SIZE: usize = 24;
    /// Size of the checksum in bytes.
    pub const CHECKSUM_SIZE: usize = 4;
    /// Maximum payload size.
    pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

    /// Flag set on records written while rolling an operation back.
    pub const FLAG_COMPENSATION: u8 = 0x01;

    /// Creates a new log record. The LSN is assigned when it is appended.
    pub fn new(prev_lsn: Lsn, txn_id: u32, record_type: LogRecordType, payload: Bytes) -> Self {
        Self {
            lsn: Lsn::INVALID,
            prev_lsn,
            txn_id,
            record_type,
            flags: 0,
            payload,
        }
    }

    /// Creates a commit record.
    pub fn commit(prev_lsn: Lsn, txn_id: u32) -> Self {
        Self::new(prev_lsn, txn_id, LogRecordType::Commit, Bytes::new())
    }

    /// Creates an abort record.
    pub fn abort(prev_lsn: Lsn, txn_id: u32) -> Self {
        Self::new(prev_lsn, txn_id, LogRecordType::Abort, Bytes::new())
    }

    /// Returns true if this record undoes an earlier one.
    pub fn is_compensation(&self) -> bool {
        self.flags & Self::FLAG_COMPENSATION != 0
    }

    /// Returns the total size of this record on disk.
    pub fn size_on_disk(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len() + Self::CHECKSUM_SIZE
    }

    /// Serializes this record to bytes.
    pub fn serialize(&self) -> Result<Bytes> {
        if self.payload.len() > Self::MAX_PAYLOAD_SIZE {
            return Err(KilnError::WalWriteFailed(format!(
                "payload too large: {}",
                self.payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(self.size_on_disk());

        buf.put_u64_le(self.lsn.0);
        buf.put_u64_le(self.prev_lsn.0);
        buf.put_u32_le(self.txn_id);
        buf.put_u8(self.record_type as u8);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        Ok(buf.freeze())
    }

    /// Returns the on-disk size of the record starting at `data`, read from
    /// its header, or None if the header itself is incomplete.
    pub fn peek_size(data: &[u8]) -> Option<usize> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }
        let payload_len = u16::from_le_bytes([data[22], data[23]]) as usize;
        Some(Self::HEADER_SIZE + payload_len + Self::CHECKSUM_SIZE)
    }

    /// Deserializes a record from the front of `data`.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let total = match Self::peek_size(data) {
            Some(total) if data.len() >= total => total,
            _ => {
                return Err(KilnError::WalCorrupted {
                    lsn: 0,
                    reason: "truncated record".to_string(),
                })
            }
        };

        let body = &data[..total - Self::CHECKSUM_SIZE];
        let stored_checksum = u32::from_le_bytes([
            data[total - 4],
            data[total - 3],
            data[total - 2],
            data[total - 1],
        ]);
        let computed_checksum = crc32fast::hash(body);

        let mut cursor = body;
        let lsn = Lsn(cursor.get_u64_le());
        if stored_checksum != computed_checksum {
            return Err(KilnError::WalCorrupted {
                lsn: lsn.0,
                reason: format!(
                    "checksum mismatch: stored={}, computed={}",
                    stored_checksum, computed_checksum
                ),
            });
        }

        let prev_lsn = Lsn(cursor.get_u64_le());
        let txn_id = cursor.get_u32_le();
        let record_type = LogRecordType::try_from(cursor.get_u8())?;
        let flags = cursor.get_u8();
        let _payload_len = cursor.get_u16_le();
        let payload = Bytes::copy_from_slice(cursor);

        Ok(Self {
            lsn,
            prev_lsn,
            txn_id,
            record_type,
            flags,
            payload,
        })
    }
}
