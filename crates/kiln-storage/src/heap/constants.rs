//! Heap page layout constants.

use kiln_common::page::{PageHeader, Pgno};

/// Fragment and slot table word alignment.
pub const ALIGN: usize = 4;

/// Size of one slot table entry (a `u16` page offset).
pub const SLOT_SIZE: usize = 2;

/// Offset where the slot table begins.
pub const SLOT_TABLE_START: usize = PageHeader::SIZE;

/// Header of a fragment that holds a whole record.
pub const WHOLE_HEADER_SIZE: usize = 4;

/// Header of a fragment that is part of a split record.
pub const SPLIT_HEADER_SIZE: usize = 16;

/// Smallest on-page footprint of any fragment.
///
/// Large enough to hold a split header, so any fragment can be replaced by
/// a split fragment in the same space.
pub const MIN_FRAGMENT_SIZE: usize = SPLIT_HEADER_SIZE;

/// Fragment flag: part of a split record.
pub const FRAG_SPLIT: u8 = 0x01;
/// Fragment flag: first fragment of a split record.
pub const FRAG_FIRST: u8 = 0x02;
/// Fragment flag: last fragment of a split record.
pub const FRAG_LAST: u8 = 0x04;

/// Page number of region 0.
pub const FIRST_REGION_PGNO: Pgno = 1;

/// Bytes of the region body before the bitmap (the high-water page number).
pub const REGION_HIGH_SIZE: usize = 4;

/// Number of quantized free-space levels.
pub const LEVELS: u8 = 4;

#[inline]
pub const fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

#[inline]
pub const fn align_down(n: usize) -> usize {
    n & !(ALIGN - 1)
}

/// On-page footprint of a fragment with the given header and payload sizes.
#[inline]
pub const fn fragment_footprint(header_len: usize, payload_len: usize) -> usize {
    let size = align_up(header_len + payload_len);
    if size < MIN_FRAGMENT_SIZE {
        MIN_FRAGMENT_SIZE
    } else {
        size
    }
}

/// Largest fragment footprint: an empty page holding one slot.
#[inline]
pub const fn max_fragment_size(page_size: usize) -> usize {
    align_down(page_size - PageHeader::SIZE - SLOT_SIZE)
}

/// Largest payload a whole (non-split) fragment can carry.
#[inline]
pub const fn max_whole_payload(page_size: usize) -> usize {
    max_fragment_size(page_size) - WHOLE_HEADER_SIZE
}

/// Largest payload one split fragment can carry.
#[inline]
pub const fn max_split_payload(page_size: usize) -> usize {
    max_fragment_size(page_size) - SPLIT_HEADER_SIZE
}

/// Number of data pages one region bitmap can describe.
#[inline]
pub const fn region_capacity(page_size: usize) -> u32 {
    ((page_size - PageHeader::SIZE - REGION_HIGH_SIZE) * 4) as u32
}
