//! Regions and their free-space bitmaps.
//!
//! The file is carved into regions. Region `r` starts with a bitmap page
//! at `1 + r * (N + 1)` followed by up to `N` data pages. The bitmap keeps
//! two bits per data page, a coarse free-space level:
//!
//! | level | free space of the page |
//! |-------|------------------------|
//! | 0     | at least 3/4 usable    |
//! | 1     | at least 1/2 usable    |
//! | 2     | at least 1/4 usable    |
//! | 3     | less than 1/4 usable   |
//!
//! Region page body, after the common header:
//! ```text
//! +-----------+------------------------------------+
//! | high_pgno | bitmap (byte i/4, shift (i%4) * 2) |
//! | u32       | ...                                |
//! +-----------+------------------------------------+
//! ```
//! `high_pgno` is the highest data page ever claimed in the region, 0 for
//! a region with none.

use super::constants::{region_capacity, FIRST_REGION_PGNO, REGION_HIGH_SIZE};
use kiln_common::page::{PageHeader, PageType, Pgno, META_PGNO};
use kiln_common::{KilnError, Result};

const HIGH_OFFSET: usize = PageHeader::SIZE;
const BITMAP_OFFSET: usize = PageHeader::SIZE + REGION_HIGH_SIZE;

/// What a page number denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Meta,
    Region(u32),
    Data { region: u32, index: u32 },
}

/// Page numbering and space accounting of one heap file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    page_size: usize,
    region_size: u32,
    max_pages: Option<u32>,
}

impl Geometry {
    pub fn new(page_size: usize, region_size: Option<u32>, max_pages: Option<u32>) -> Result<Self> {
        kiln_common::page::validate_page_size(page_size)?;
        let capacity = region_capacity(page_size);
        let region_size = region_size.unwrap_or(capacity);
        if region_size == 0 || region_size > capacity {
            return Err(KilnError::ConfigError(format!(
                "region size {} must be between 1 and {} for {} byte pages",
                region_size, capacity, page_size
            )));
        }
        if matches!(max_pages, Some(max) if max < 3) {
            return Err(KilnError::ConfigError(
                "max_pages must leave room for the meta, region and one data page".to_string(),
            ));
        }
        Ok(Self {
            page_size,
            region_size,
            max_pages,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Data pages per region.
    pub fn region_size(&self) -> u32 {
        self.region_size
    }

    pub fn max_pages(&self) -> Option<u32> {
        self.max_pages
    }

    /// Bytes of a page available to the slot table and fragments.
    pub fn usable_space(&self) -> usize {
        self.page_size - PageHeader::SIZE
    }

    fn stride(&self) -> u64 {
        self.region_size as u64 + 1
    }

    /// Page number of region `region`'s bitmap page.
    pub fn region_pgno(&self, region: u32) -> Option<Pgno> {
        let pgno = FIRST_REGION_PGNO as u64 + region as u64 * self.stride();
        Pgno::try_from(pgno).ok()
    }

    /// Page number of data page `index` in `region`.
    pub fn data_pgno(&self, region: u32, index: u32) -> Option<Pgno> {
        if index >= self.region_size {
            return None;
        }
        self.region_pgno(region)?.checked_add(index + 1)
    }

    pub fn kind(&self, pgno: Pgno) -> PageKind {
        if pgno == META_PGNO {
            return PageKind::Meta;
        }
        let rel = (pgno - FIRST_REGION_PGNO) as u64;
        let region = (rel / self.stride()) as u32;
        match rel % self.stride() {
            0 => PageKind::Region(region),
            pos => PageKind::Data {
                region,
                index: pos as u32 - 1,
            },
        }
    }

    /// True if `pgno` may hold records.
    pub fn is_data_pgno(&self, pgno: Pgno) -> bool {
        matches!(self.kind(pgno), PageKind::Data { .. })
    }

    /// True if `pgno` lies beyond the configured file size limit.
    pub fn exceeds_limit(&self, pgno: Pgno) -> bool {
        matches!(self.max_pages, Some(max) if pgno >= max)
    }

    /// Number of regions that fit under `max_pages`, None when unlimited.
    pub fn region_limit(&self) -> Option<u32> {
        self.max_pages
            .map(|max| ((max as u64 - 3) / self.stride() + 1) as u32)
    }

    /// Region after `region` in allocation order, or None when the search
    /// has run off the end of an unlimited store's address space.
    pub fn next_region(&self, region: u32) -> Option<u32> {
        match self.region_limit() {
            Some(limit) if region + 1 >= limit => Some(0),
            Some(_) => Some(region + 1),
            None => {
                let next = region.checked_add(1)?;
                self.region_pgno(next).and_then(|p| p.checked_add(1))?;
                Some(next)
            }
        }
    }

    /// Quantizes a page's free space into its bitmap level.
    pub fn level_of(&self, free: usize) -> u8 {
        let usable = self.usable_space();
        if free * 4 >= usable * 3 {
            0
        } else if free * 2 >= usable {
            1
        } else if free * 4 >= usable {
            2
        } else {
            3
        }
    }
}

/// In-slice operations on a region bitmap page.
pub struct RegionPage;

impl RegionPage {
    /// Formats `buf` as an empty region page.
    pub fn init(buf: &mut [u8], pgno: Pgno) {
        buf.fill(0);
        PageHeader::new(pgno, PageType::Region, buf.len()).write_to(buf);
    }

    #[inline]
    pub fn is_region(buf: &[u8]) -> bool {
        PageHeader::page_type_of(buf) == PageType::Region
    }

    #[inline]
    pub fn high(buf: &[u8]) -> Pgno {
        u32::from_le_bytes([
            buf[HIGH_OFFSET],
            buf[HIGH_OFFSET + 1],
            buf[HIGH_OFFSET + 2],
            buf[HIGH_OFFSET + 3],
        ])
    }

    #[inline]
    pub fn set_high(buf: &mut [u8], pgno: Pgno) {
        buf[HIGH_OFFSET..HIGH_OFFSET + 4].copy_from_slice(&pgno.to_le_bytes());
    }

    #[inline]
    pub fn level(buf: &[u8], index: u32) -> u8 {
        let (byte, shift) = bit_pos(index);
        (buf[byte] >> shift) & 0b11
    }

    #[inline]
    pub fn set_level(buf: &mut [u8], index: u32, level: u8) {
        let (byte, shift) = bit_pos(index);
        buf[byte] = (buf[byte] & !(0b11 << shift)) | ((level & 0b11) << shift);
    }
}

#[inline]
fn bit_pos(index: u32) -> (usize, u32) {
    (BITMAP_OFFSET + index as usize / 4, (index % 4) * 2)
}
