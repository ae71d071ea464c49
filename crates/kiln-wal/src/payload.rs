//! Heap access method log payloads.
//!
//! Every slot mutation is logged as an add or a remove carrying the full
//! fragment image, so the same record serves redo (apply) and undo (apply
//! the opposite). Page allocation is logged against the metadata page.

use crate::record::{LogRecordType, Lsn};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kiln_common::{KilnError, Pgno, Result};

/// Direction of a slot mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRemOp {
    /// Fragment written into an empty slot.
    Add,
    /// Fragment removed from its slot.
    Remove,
}

impl AddRemOp {
    /// The mutation that reverts this one.
    pub fn inverse(self) -> Self {
        match self {
            AddRemOp::Add => AddRemOp::Remove,
            AddRemOp::Remove => AddRemOp::Add,
        }
    }
}

/// A heap log payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapLogRecord {
    /// A fragment added to or removed from a data page slot.
    AddRem {
        op: AddRemOp,
        pgno: Pgno,
        slot: u16,
        /// Page LSN before the mutation.
        page_lsn: Lsn,
        /// Encoded fragment header.
        header: Bytes,
        /// Fragment payload bytes.
        data: Bytes,
    },
    /// A page number claimed from the metadata page.
    PageAlloc {
        pgno: Pgno,
        page_type: u8,
        prev_last: Pgno,
        new_last: Pgno,
    },
}

impl HeapLogRecord {
    /// The WAL record type this payload travels under.
    pub fn record_type(&self) -> LogRecordType {
        match self {
            HeapLogRecord::AddRem {
                op: AddRemOp::Add, ..
            } => LogRecordType::HeapAdd,
            HeapLogRecord::AddRem {
                op: AddRemOp::Remove,
                ..
            } => LogRecordType::HeapRemove,
            HeapLogRecord::PageAlloc { .. } => LogRecordType::HeapPageAlloc,
        }
    }

    /// Page the record applies to.
    pub fn pgno(&self) -> Pgno {
        match self {
            HeapLogRecord::AddRem { pgno, .. } | HeapLogRecord::PageAlloc { pgno, .. } => *pgno,
        }
    }

    /// Returns the record that reverts this one, if it can be reverted.
    ///
    /// Page allocation is never reverted; the page simply stays allocated.
    pub fn inverse(&self, page_lsn: Lsn) -> Option<Self> {
        match self {
            HeapLogRecord::AddRem {
                op,
                pgno,
                slot,
                header,
                data,
                ..
            } => Some(HeapLogRecord::AddRem {
                op: op.inverse(),
                pgno: *pgno,
                slot: *slot,
                page_lsn,
                header: header.clone(),
                data: data.clone(),
            }),
            HeapLogRecord::PageAlloc { .. } => None,
        }
    }

    /// Serializes the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            HeapLogRecord::AddRem {
                pgno,
                slot,
                page_lsn,
                header,
                data,
                ..
            } => {
                buf.reserve(20 + header.len() + data.len());
                buf.put_u32_le(*pgno);
                buf.put_u16_le(*slot);
                buf.put_u64_le(page_lsn.0);
                buf.put_u16_le(header.len() as u16);
                buf.put_slice(header);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            HeapLogRecord::PageAlloc {
                pgno,
                page_type,
                prev_last,
                new_last,
            } => {
                buf.put_u32_le(*pgno);
                buf.put_u8(*page_type);
                buf.put_u32_le(*prev_last);
                buf.put_u32_le(*new_last);
            }
        }
        buf.freeze()
    }

    /// Deserializes a payload logged under `record_type`.
    pub fn decode(record_type: LogRecordType, mut data: &[u8]) -> Result<Self> {
        match record_type {
            LogRecordType::HeapAdd | LogRecordType::HeapRemove => {
                let op = if record_type == LogRecordType::HeapAdd {
                    AddRemOp::Add
                } else {
                    AddRemOp::Remove
                };
                need(data, 16, "add/remove header")?;
                let pgno = data.get_u32_le();
                let slot = data.get_u16_le();
                let page_lsn = Lsn(data.get_u64_le());
                let header_len = data.get_u16_le() as usize;
                need(data, header_len + 4, "fragment header")?;
                let header = Bytes::copy_from_slice(&data[..header_len]);
                data.advance(header_len);
                let data_len = data.get_u32_le() as usize;
                need(data, data_len, "fragment data")?;
                let payload = Bytes::copy_from_slice(&data[..data_len]);
                Ok(HeapLogRecord::AddRem {
                    op,
                    pgno,
                    slot,
                    page_lsn,
                    header,
                    data: payload,
                })
            }
            LogRecordType::HeapPageAlloc => {
                need(data, 13, "page alloc")?;
                Ok(HeapLogRecord::PageAlloc {
                    pgno: data.get_u32_le(),
                    page_type: data.get_u8(),
                    prev_last: data.get_u32_le(),
                    new_last: data.get_u32_le(),
                })
            }
            other => Err(KilnError::WalCorrupted {
                lsn: 0,
                reason: format!("{:?} does not carry a heap payload", other),
            }),
        }
    }
}

fn need(data: &[u8], len: usize, what: &str) -> Result<()> {
    if data.len() < len {
        return Err(KilnError::WalCorrupted {
            lsn: 0,
            reason: format!("truncated {}", what),
        });
    }
    Ok(())
}
