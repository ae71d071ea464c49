//! Data page slot manager.
//!
//! Page layout:
//! ```text
//! +------------------+ 0
//! | Page Header (32) |
//! +------------------+ 32
//! | Slot Table       |  <- grows toward the end of the page
//! | (2 bytes/slot)   |
//! +------------------+
//! |                  |
//! | Free Space       |
//! |                  |
//! +------------------+ hoffset
//! | Fragment Heap    |  <- grows toward the header
//! +------------------+ page_size
//! ```
//!
//! A slot entry is the byte offset of its fragment, or 0 for an empty
//! slot. The slot table spans `high_index + 1` entries whenever the page
//! holds anything. Fragments are packed: removing one slides every
//! fragment below it up, so free space is always one contiguous run.

use super::constants::{SLOT_SIZE, SLOT_TABLE_START};
use super::fragment::FragmentHeader;
use kiln_common::page::{PageHeader, PageType, Pgno};
use kiln_common::{KilnError, Result};
use kiln_wal::AddRemOp;

const ENTRIES_OFFSET: usize = 20;
const HOFFSET_OFFSET: usize = 22;
const HIGH_OFFSET: usize = 24;
const FREE_OFFSET: usize = 26;

/// In-slice operations on a data page buffer.
pub struct DataPage;

impl DataPage {
    /// Formats `buf` as an empty data page.
    pub fn init(buf: &mut [u8], pgno: Pgno) {
        buf.fill(0);
        PageHeader::new(pgno, PageType::Data, buf.len()).write_to(buf);
    }

    #[inline]
    pub fn is_data(buf: &[u8]) -> bool {
        PageHeader::page_type_of(buf) == PageType::Data
    }

    #[inline]
    pub fn entries(buf: &[u8]) -> u16 {
        read_u16(buf, ENTRIES_OFFSET)
    }

    #[inline]
    pub fn hoffset(buf: &[u8]) -> usize {
        read_u16(buf, HOFFSET_OFFSET) as usize
    }

    #[inline]
    pub fn high_index(buf: &[u8]) -> u16 {
        read_u16(buf, HIGH_OFFSET)
    }

    #[inline]
    pub fn free_index(buf: &[u8]) -> u16 {
        read_u16(buf, FREE_OFFSET)
    }

    /// Number of slot table entries in use.
    #[inline]
    pub fn table_len(buf: &[u8]) -> usize {
        if Self::entries(buf) == 0 {
            0
        } else {
            Self::high_index(buf) as usize + 1
        }
    }

    /// Bytes between the end of the slot table and the fragment heap.
    pub fn free_space(buf: &[u8]) -> usize {
        let table_end = SLOT_TABLE_START + Self::table_len(buf) * SLOT_SIZE;
        Self::hoffset(buf).saturating_sub(table_end)
    }

    /// Offset of the fragment in `slot`, or None for an empty slot.
    pub fn slot_offset(buf: &[u8], slot: u16) -> Option<usize> {
        if slot as usize >= Self::table_len(buf) {
            return None;
        }
        match read_u16(buf, slot_pos(slot)) {
            0 => None,
            offset => Some(offset as usize),
        }
    }

    /// Returns the fragment in `slot` and its payload.
    pub fn fragment(buf: &[u8], slot: u16) -> Result<Option<(FragmentHeader, &[u8])>> {
        let Some(offset) = Self::slot_offset(buf, slot) else {
            return Ok(None);
        };
        let pgno = PageHeader::pgno_of(buf);
        let table_end = SLOT_TABLE_START + Self::table_len(buf) * SLOT_SIZE;
        if offset < table_end.max(Self::hoffset(buf)) || offset >= buf.len() {
            return Err(KilnError::Corruption {
                pgno,
                reason: format!("slot {} points outside the fragment heap", slot),
            });
        }

        let header = FragmentHeader::decode(&buf[offset..], pgno)?;
        let start = offset + header.header_len();
        let end = start + header.size as usize;
        if offset + header.footprint() > buf.len() {
            return Err(KilnError::Corruption {
                pgno,
                reason: format!("fragment in slot {} runs off the page", slot),
            });
        }
        Ok(Some((header, &buf[start..end])))
    }

    /// Slot the next insert-anywhere should use: the lowest empty slot, or
    /// one past the end of the table.
    pub fn next_free_slot(buf: &[u8]) -> u16 {
        let table_len = Self::table_len(buf);
        let mut slot = (Self::free_index(buf) as usize).min(table_len);
        while slot < table_len && read_u16(buf, slot_pos(slot as u16)) != 0 {
            slot += 1;
        }
        slot as u16
    }

    /// Bytes an insert of `footprint` into `slot` consumes, counting any
    /// slot table growth.
    pub fn space_needed(buf: &[u8], slot: u16, footprint: usize) -> usize {
        let table_len = Self::table_len(buf);
        let growth = (slot as usize + 1).saturating_sub(table_len) * SLOT_SIZE;
        footprint + growth
    }

    pub fn can_insert(buf: &[u8], slot: u16, footprint: usize) -> bool {
        Self::slot_offset(buf, slot).is_none()
            && Self::space_needed(buf, slot, footprint) <= Self::free_space(buf)
    }

    /// Writes a fragment into the empty `slot`.
    pub fn insert(buf: &mut [u8], slot: u16, header: &FragmentHeader, payload: &[u8]) -> Result<()> {
        if header.size as usize != payload.len() {
            return Err(KilnError::Internal(format!(
                "fragment header declares {} bytes, payload has {}",
                header.size,
                payload.len()
            )));
        }
        let footprint = header.footprint();
        if Self::slot_offset(buf, slot).is_some() {
            return Err(KilnError::Internal(format!("slot {} is occupied", slot)));
        }
        if !Self::can_insert(buf, slot, footprint) {
            return Err(KilnError::Internal(format!(
                "no room for {} bytes in slot {}",
                footprint, slot
            )));
        }

        let entries = Self::entries(buf);
        let table_len = Self::table_len(buf);
        // Entries past the old table end sit in free space and may hold stale bytes
        for i in table_len..=slot as usize {
            write_u16(buf, slot_pos(i as u16), 0);
        }

        let offset = Self::hoffset(buf) - footprint;
        let encoded = header.encode();
        let payload_start = offset + encoded.len();
        buf[offset..payload_start].copy_from_slice(&encoded);
        buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);
        buf[payload_start + payload.len()..offset + footprint].fill(0);

        write_u16(buf, slot_pos(slot), offset as u16);
        write_u16(buf, ENTRIES_OFFSET, entries + 1);
        write_u16(buf, HOFFSET_OFFSET, offset as u16);
        if entries == 0 || slot > Self::high_index(buf) {
            write_u16(buf, HIGH_OFFSET, slot);
        }
        if entries == 0 {
            write_u16(buf, FREE_OFFSET, 0);
        }
        if slot == Self::free_index(buf) {
            let next = Self::next_free_slot(buf);
            write_u16(buf, FREE_OFFSET, next);
        }
        Ok(())
    }

    /// Removes the fragment in `slot` and compacts the fragment heap.
    pub fn remove(buf: &mut [u8], slot: u16) -> Result<FragmentHeader> {
        let header = match Self::fragment(buf, slot)? {
            Some((header, _)) => header,
            None => return Err(KilnError::Internal(format!("slot {} is empty", slot))),
        };
        let offset = Self::slot_offset(buf, slot).unwrap_or_default();
        let len = header.footprint();
        let hoffset = Self::hoffset(buf);

        buf.copy_within(hoffset..offset, hoffset + len);
        buf[hoffset..hoffset + len].fill(0);

        let table_len = Self::table_len(buf);
        for i in 0..table_len as u16 {
            let entry = read_u16(buf, slot_pos(i)) as usize;
            if entry != 0 && entry < offset {
                write_u16(buf, slot_pos(i), (entry + len) as u16);
            }
        }
        write_u16(buf, slot_pos(slot), 0);

        let entries = Self::entries(buf) - 1;
        write_u16(buf, ENTRIES_OFFSET, entries);
        write_u16(buf, HOFFSET_OFFSET, (hoffset + len) as u16);

        if entries == 0 {
            write_u16(buf, HIGH_OFFSET, 0);
            write_u16(buf, FREE_OFFSET, 0);
        } else {
            let mut high = Self::high_index(buf);
            while high > 0 && read_u16(buf, slot_pos(high)) == 0 {
                high -= 1;
            }
            write_u16(buf, HIGH_OFFSET, high);
            if slot < Self::free_index(buf) {
                write_u16(buf, FREE_OFFSET, slot);
            }
        }
        Ok(header)
    }

    /// Applies a logged slot mutation.
    pub fn apply(buf: &mut [u8], op: AddRemOp, slot: u16, header: &[u8], payload: &[u8]) -> Result<()> {
        match op {
            AddRemOp::Add => {
                let header = FragmentHeader::decode(header, PageHeader::pgno_of(buf))?;
                Self::insert(buf, slot, &header, payload)
            }
            AddRemOp::Remove => Self::remove(buf, slot).map(|_| ()),
        }
    }

    /// First slot at or after `from` holding the start of a record.
    pub fn next_visible(buf: &[u8], from: u32) -> Result<Option<u16>> {
        let table_len = Self::table_len(buf) as u32;
        for slot in from..table_len {
            if let Some((header, _)) = Self::fragment(buf, slot as u16)? {
                if header.is_visible() {
                    return Ok(Some(slot as u16));
                }
            }
        }
        Ok(None)
    }

    /// Last slot at or before `from` holding the start of a record.
    pub fn prev_visible(buf: &[u8], from: u32) -> Result<Option<u16>> {
        let table_len = Self::table_len(buf) as u32;
        if table_len == 0 {
            return Ok(None);
        }
        let mut slot = from.min(table_len - 1);
        loop {
            if let Some((header, _)) = Self::fragment(buf, slot as u16)? {
                if header.is_visible() {
                    return Ok(Some(slot as u16));
                }
            }
            if slot == 0 {
                return Ok(None);
            }
            slot -= 1;
        }
    }
}

#[inline]
fn slot_pos(slot: u16) -> usize {
    SLOT_TABLE_START + slot as usize * SLOT_SIZE
}

#[inline]
fn read_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

#[inline]
fn write_u16(buf: &mut [u8], pos: usize, value: u16) {
    buf[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
}
