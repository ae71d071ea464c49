//! Heap metadata page (page 0).
//!
//! Body layout after the common header:
//! ```text
//! +-------+---------+-----------+-------------+-----------+-----------+
//! | magic | version | page_size | region_size | last_pgno | max_pages |
//! | 4     | u32     | u32       | u32         | u32       | u32       |
//! +-------+---------+-----------+-------------+-----------+-----------+
//! ```
//! `max_pages` is 0 for an unlimited file. `last_pgno` is the highest page
//! number ever allocated.

use kiln_common::page::{PageHeader, PageType, Pgno, META_PGNO};
use kiln_common::{KilnError, Result};

const MAGIC: &[u8; 4] = b"KHEP";
const VERSION: u32 = 1;

const MAGIC_OFFSET: usize = PageHeader::SIZE;
const VERSION_OFFSET: usize = MAGIC_OFFSET + 4;
const PAGE_SIZE_OFFSET: usize = VERSION_OFFSET + 4;
const REGION_SIZE_OFFSET: usize = PAGE_SIZE_OFFSET + 4;
const LAST_PGNO_OFFSET: usize = REGION_SIZE_OFFSET + 4;
const MAX_PAGES_OFFSET: usize = LAST_PGNO_OFFSET + 4;

/// Decoded metadata page contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapMeta {
    pub page_size: u32,
    pub region_size: u32,
    pub last_pgno: Pgno,
    pub max_pages: Option<u32>,
}

/// In-slice operations on the metadata page.
pub struct MetaPage;

impl MetaPage {
    /// Formats `buf` as the metadata page of a new heap file.
    pub fn init(buf: &mut [u8], region_size: u32, max_pages: Option<u32>) {
        buf.fill(0);
        PageHeader::new(META_PGNO, PageType::Meta, buf.len()).write_to(buf);
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(MAGIC);
        write_u32(buf, VERSION_OFFSET, VERSION);
        write_u32(buf, PAGE_SIZE_OFFSET, buf.len() as u32);
        write_u32(buf, REGION_SIZE_OFFSET, region_size);
        write_u32(buf, LAST_PGNO_OFFSET, 0);
        write_u32(buf, MAX_PAGES_OFFSET, max_pages.unwrap_or(0));
    }

    /// True if `buf` carries a metadata page at all (initialized or not).
    pub fn is_formatted(buf: &[u8]) -> bool {
        PageHeader::page_type_of(buf) == PageType::Meta
    }

    pub fn read(buf: &[u8]) -> Result<HeapMeta> {
        let corrupt = |reason: &str| KilnError::Corruption {
            pgno: META_PGNO,
            reason: reason.to_string(),
        };
        if !Self::is_formatted(buf) {
            return Err(corrupt("not a metadata page"));
        }
        if &buf[MAGIC_OFFSET..MAGIC_OFFSET + 4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = read_u32(buf, VERSION_OFFSET);
        if version != VERSION {
            return Err(corrupt(&format!("unsupported version {}", version)));
        }
        let max_pages = read_u32(buf, MAX_PAGES_OFFSET);
        Ok(HeapMeta {
            page_size: read_u32(buf, PAGE_SIZE_OFFSET),
            region_size: read_u32(buf, REGION_SIZE_OFFSET),
            last_pgno: read_u32(buf, LAST_PGNO_OFFSET),
            max_pages: (max_pages != 0).then_some(max_pages),
        })
    }

    #[inline]
    pub fn last_pgno(buf: &[u8]) -> Pgno {
        read_u32(buf, LAST_PGNO_OFFSET)
    }

    #[inline]
    pub fn set_last_pgno(buf: &mut [u8], pgno: Pgno) {
        write_u32(buf, LAST_PGNO_OFFSET, pgno);
    }
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

fn write_u32(buf: &mut [u8], pos: usize, value: u32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}
