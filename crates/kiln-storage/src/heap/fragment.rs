//! Fragment headers.
//!
//! Layout, little endian:
//! ```text
//! whole fragment (4 bytes)       split fragment (16 bytes)
//! +-------+-----+--------+       +-------+-----+--------+-----------+-----------+-----------+-----+
//! | flags | pad | size   |       | flags | pad | size   | total_len | next_pgno | next_slot | pad |
//! | u8    | u8  | u16    |       | u8    | u8  | u16    | u32       | u32       | u16       | u16 |
//! +-------+-----+--------+       +-------+-----+--------+-----------+-----------+-----------+-----+
//! ```
//! `size` counts payload bytes held by this fragment. `total_len` is only
//! meaningful on the first fragment of a split record. The last fragment
//! of a chain carries `next = (0, 0)`.

use super::constants::{
    fragment_footprint, FRAG_FIRST, FRAG_LAST, FRAG_SPLIT, SPLIT_HEADER_SIZE, WHOLE_HEADER_SIZE,
};
use super::rid::Rid;
use kiln_common::{KilnError, Pgno, Result};

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub flags: u8,
    /// Payload bytes in this fragment.
    pub size: u16,
    /// Logical record length; first fragment of a split record only.
    pub total_len: u32,
    /// Next fragment of a split record.
    pub next: Rid,
}

impl FragmentHeader {
    /// Header for a record stored in a single fragment.
    pub fn whole(size: u16) -> Self {
        Self {
            flags: 0,
            size,
            total_len: 0,
            next: Rid::NONE,
        }
    }

    /// Header for one piece of a split record.
    pub fn split(first: bool, last: bool, size: u16, total_len: u32, next: Rid) -> Self {
        let mut flags = FRAG_SPLIT;
        if first {
            flags |= FRAG_FIRST;
        }
        if last {
            flags |= FRAG_LAST;
        }
        Self {
            flags,
            size,
            total_len: if first { total_len } else { 0 },
            next: if last { Rid::NONE } else { next },
        }
    }

    #[inline]
    pub fn is_split(&self) -> bool {
        self.flags & FRAG_SPLIT != 0
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.flags & FRAG_FIRST != 0
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.flags & FRAG_LAST != 0
    }

    /// True if a RID may point at this fragment.
    #[inline]
    pub fn is_visible(&self) -> bool {
        !self.is_split() || self.is_first()
    }

    /// True if no further fragment follows.
    #[inline]
    pub fn ends_chain(&self) -> bool {
        !self.is_split() || self.is_last()
    }

    /// Logical length of the record this fragment starts.
    pub fn record_len(&self) -> usize {
        if self.is_split() {
            self.total_len as usize
        } else {
            self.size as usize
        }
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        if self.is_split() {
            SPLIT_HEADER_SIZE
        } else {
            WHOLE_HEADER_SIZE
        }
    }

    /// Bytes this fragment occupies on its page.
    #[inline]
    pub fn footprint(&self) -> usize {
        fragment_footprint(self.header_len(), self.size as usize)
    }

    /// Encodes the header; the result is `header_len()` bytes long.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.header_len()];
        buf[0] = self.flags;
        buf[2..4].copy_from_slice(&self.size.to_le_bytes());
        if self.is_split() {
            buf[4..8].copy_from_slice(&self.total_len.to_le_bytes());
            buf[8..12].copy_from_slice(&self.next.pgno.to_le_bytes());
            // next slots always fit a slot table index
            buf[12..14].copy_from_slice(&(self.next.slot as u16).to_le_bytes());
        }
        buf
    }

    /// Decodes a header from the start of `buf`.
    ///
    /// `pgno` names the page for corruption reports.
    pub fn decode(buf: &[u8], pgno: Pgno) -> Result<Self> {
        if buf.len() < WHOLE_HEADER_SIZE {
            return Err(corrupt(pgno, "truncated fragment header"));
        }
        let flags = buf[0];
        if flags & !(FRAG_SPLIT | FRAG_FIRST | FRAG_LAST) != 0 {
            return Err(corrupt(pgno, "unknown fragment flags"));
        }
        let size = u16::from_le_bytes([buf[2], buf[3]]);

        if flags & FRAG_SPLIT == 0 {
            if flags != 0 {
                return Err(corrupt(pgno, "chain flags on a whole fragment"));
            }
            return Ok(Self::whole(size));
        }

        if buf.len() < SPLIT_HEADER_SIZE {
            return Err(corrupt(pgno, "truncated split header"));
        }
        let total_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let next = Rid::new(
            u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            u16::from_le_bytes([buf[12], buf[13]]) as u32,
        );
        Ok(Self {
            flags,
            size,
            total_len,
            next,
        })
    }
}

fn corrupt(pgno: Pgno, reason: &str) -> KilnError {
    KilnError::Corruption {
        pgno,
        reason: reason.to_string(),
    }
}
