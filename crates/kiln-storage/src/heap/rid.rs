//! Record identifiers.

use kiln_common::Pgno;
use serde::{Deserialize, Serialize};

/// Locates a record by the page and slot of its first fragment.
///
/// Identity is positional only: a RID stays valid while the record exists
/// and may be handed out again once the record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub pgno: Pgno,
    pub slot: u32,
}

impl Rid {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// The "no next fragment" marker. Page 0 is never a data page.
    pub const NONE: Rid = Rid { pgno: 0, slot: 0 };

    pub const fn new(pgno: Pgno, slot: u32) -> Self {
        Self { pgno, slot }
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// Slot as a slot table index, if it can be one.
    pub fn slot_index(&self) -> Option<u16> {
        u16::try_from(self.slot).ok()
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.pgno.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            pgno: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            slot: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.pgno, self.slot)
    }
}
