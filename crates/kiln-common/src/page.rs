//! Page numbering and the common page header.
//!
//! Every page starts with the same 32-byte header. Pages of all types share
//! it, though only data pages use the slot bookkeeping fields.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};

/// Page number within the heap file.
pub type Pgno = u32;

/// Default page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size. Offsets must fit the u16 header fields.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Page number of the metadata page.
pub const META_PGNO: Pgno = 0;

/// Checks that a page size is a power of two within the supported range.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(KilnError::ConfigError(format!(
            "page size {} must be a power of two between {} and {}",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

/// Page types in a heap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Zeroed or never initialized page.
    Invalid = 0,
    /// Heap metadata page (page 0).
    Meta = 1,
    /// Free-space bitmap page owning a region of data pages.
    Region = 2,
    /// Data page holding record fragments.
    Data = 3,
}

impl PageType {
    /// Decodes a page type tag, mapping unknown tags to Invalid.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Meta,
            2 => PageType::Region,
            3 => PageType::Data,
            _ => PageType::Invalid,
        }
    }
}

impl std::fmt::Display for PageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PageType::Invalid => "invalid",
            PageType::Meta => "meta",
            PageType::Region => "region",
            PageType::Data => "data",
        };
        f.write_str(name)
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (32 bytes, little endian):
/// - lsn: 8 bytes (LSN of the last logged change)
/// - pgno: 4 bytes
/// - prev_pgno: 4 bytes (unused by the heap)
/// - next_pgno: 4 bytes (unused by the heap)
/// - entries: 2 bytes (occupied slots)
/// - hoffset: 2 bytes (lowest used byte of the fragment heap)
/// - high_index: 2 bytes (highest occupied slot)
/// - free_index: 2 bytes (lowest slot known to be free)
/// - page_type: 1 byte
/// - flags: 1 byte
/// - reserved: 2 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Log sequence number of the last modification.
    pub lsn: u64,
    /// Page number.
    pub pgno: Pgno,
    /// Previous page link.
    pub prev_pgno: Pgno,
    /// Next page link.
    pub next_pgno: Pgno,
    /// Number of occupied slots.
    pub entries: u16,
    /// Lowest used byte offset of the fragment heap.
    pub hoffset: u16,
    /// Highest occupied slot index.
    pub high_index: u16,
    /// Lowest slot index known to be free.
    pub free_index: u16,
    /// Type of this page.
    pub page_type: PageType,
    /// Page flags.
    pub flags: u8,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    /// Creates a header for an empty page of the given size.
    pub fn new(pgno: Pgno, page_type: PageType, page_size: usize) -> Self {
        Self {
            lsn: 0,
            pgno,
            prev_pgno: 0,
            next_pgno: 0,
            entries: 0,
            hoffset: page_size as u16,
            high_index: 0,
            free_index: 0,
            page_type,
            flags: 0,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[8..12].copy_from_slice(&self.pgno.to_le_bytes());
        buf[12..16].copy_from_slice(&self.prev_pgno.to_le_bytes());
        buf[16..20].copy_from_slice(&self.next_pgno.to_le_bytes());
        buf[20..22].copy_from_slice(&self.entries.to_le_bytes());
        buf[22..24].copy_from_slice(&self.hoffset.to_le_bytes());
        buf[24..26].copy_from_slice(&self.high_index.to_le_bytes());
        buf[26..28].copy_from_slice(&self.free_index.to_le_bytes());
        buf[28] = self.page_type as u8;
        buf[29] = self.flags;
        // bytes 30-31 are reserved (already zeroed)
        buf
    }

    /// Deserializes the header from the first 32 bytes of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            lsn: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            pgno: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            prev_pgno: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            next_pgno: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            entries: u16::from_le_bytes([buf[20], buf[21]]),
            hoffset: u16::from_le_bytes([buf[22], buf[23]]),
            high_index: u16::from_le_bytes([buf[24], buf[25]]),
            free_index: u16::from_le_bytes([buf[26], buf[27]]),
            page_type: PageType::from_u8(buf[28]),
            flags: buf[29],
        }
    }

    /// Writes the header into the first 32 bytes of `buf`.
    #[inline]
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..Self::SIZE].copy_from_slice(&self.to_bytes());
    }

    // =========================================================================
    // In-slice accessors
    // =========================================================================

    /// Reads the LSN stamp of a page.
    #[inline]
    pub fn lsn_of(buf: &[u8]) -> u64 {
        u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }

    /// Stamps a page with an LSN.
    #[inline]
    pub fn set_lsn(buf: &mut [u8], lsn: u64) {
        buf[0..8].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Reads the page type tag of a page.
    #[inline]
    pub fn page_type_of(buf: &[u8]) -> PageType {
        PageType::from_u8(buf[28])
    }

    /// Reads the page number recorded in a page.
    #[inline]
    pub fn pgno_of(buf: &[u8]) -> Pgno {
        u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]])
    }
}
