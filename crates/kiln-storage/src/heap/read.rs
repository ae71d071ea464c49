//! Gather reads.
//!
//! A read walks the fragment chain from the RID, copying the part of each
//! fragment that overlaps the requested range. Page locks are coupled
//! along the chain: the next page is locked before the previous one is
//! released.

use super::file::HeapFile;
use super::page::DataPage;
use super::rid::Rid;
use crate::lock::{LockMode, OpLocks};
use kiln_common::{KilnError, Result};

/// Where read bytes go.
pub enum ReadTarget<'a> {
    /// Replace the vector's contents with the bytes read.
    Alloc(&'a mut Vec<u8>),
    /// Copy into the front of a caller buffer.
    Fixed(&'a mut [u8]),
    /// Receive each piece with its offset in the read, in order.
    Stream(&'a mut dyn FnMut(usize, &[u8]) -> Result<()>),
}

impl std::fmt::Debug for ReadTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadTarget::Alloc(vec) => f.debug_tuple("Alloc").field(&vec.len()).finish(),
            ReadTarget::Fixed(buf) => f.debug_tuple("Fixed").field(&buf.len()).finish(),
            ReadTarget::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Byte range of a record. Ranges past the end of the record are clipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadRange {
    pub offset: usize,
    /// Bytes wanted; to the end of the record when None.
    pub len: Option<usize>,
}

impl ReadRange {
    pub const ALL: ReadRange = ReadRange {
        offset: 0,
        len: None,
    };

    pub fn new(offset: usize, len: usize) -> Self {
        Self {
            offset,
            len: Some(len),
        }
    }

    /// Everything from `offset` on.
    pub fn from(offset: usize) -> Self {
        Self { offset, len: None }
    }
}

impl HeapFile {
    /// Reads `range` of a record into `target` and returns the byte count.
    ///
    /// `LockMode::Write` holds the pages as a read-modify-write caller
    /// would. A zero-length range succeeds without touching any page.
    pub fn get_with(
        &self,
        rid: Rid,
        range: ReadRange,
        target: ReadTarget<'_>,
        mode: LockMode,
    ) -> Result<usize> {
        self.read_op(|| {
            let mut locks = OpLocks::new(&self.locks, self.locks.new_locker());
            self.read_record(&mut locks, rid, range, target, mode)
        })
    }

    pub(crate) fn read_record(
        &self,
        locks: &mut OpLocks<'_>,
        rid: Rid,
        range: ReadRange,
        mut target: ReadTarget<'_>,
        mode: LockMode,
    ) -> Result<usize> {
        if range.len == Some(0) {
            if let ReadTarget::Alloc(vec) = target {
                vec.clear();
            }
            return Ok(0);
        }

        let (guard, slot, header) = self.lock_record(locks, rid, mode)?;
        let total = header.record_len();
        let start = range.offset.min(total);
        let end = match range.len {
            Some(len) => start.saturating_add(len).min(total),
            None => total,
        };
        let wanted = end - start;
        prepare(&mut target, wanted)?;
        if wanted == 0 {
            return Ok(0);
        }

        let mut current = (guard, slot);
        let mut pos = 0usize;
        loop {
            let (guard, slot) = current;
            let pgno = guard.pgno();
            let (header, streamed) = {
                let buf = guard.read();
                let (header, payload) =
                    DataPage::fragment(&buf, slot)?.ok_or_else(|| KilnError::Corruption {
                        pgno,
                        reason: format!("fragment in slot {} vanished while locked", slot),
                    })?;
                let frag_end = pos + payload.len();
                let mut streamed = None;
                if frag_end > start && pos < end {
                    let lo = start.max(pos);
                    let hi = end.min(frag_end);
                    let piece = &payload[lo - pos..hi - pos];
                    match &mut target {
                        // the callback runs without the page latch
                        ReadTarget::Stream(_) => streamed = Some((lo - start, piece.to_vec())),
                        other => deliver(other, lo - start, piece),
                    }
                }
                (header, streamed)
            };
            if let (Some((at, bytes)), ReadTarget::Stream(callback)) = (streamed, &mut target) {
                callback(at, &bytes)?;
            }

            pos += header.size as usize;
            if pos > total || (header.ends_chain() && pos != total) {
                return Err(KilnError::Corruption {
                    pgno,
                    reason: format!("record {} ends after {} of {} bytes", rid, pos, total),
                });
            }
            if header.ends_chain() || pos >= end {
                break;
            }

            let next = header.next;
            drop(guard);
            let (next_guard, next_slot, _) = self.couple_continuation(locks, pgno, next, mode)?;
            current = (next_guard, next_slot);
        }
        Ok(wanted)
    }
}

fn prepare(target: &mut ReadTarget<'_>, wanted: usize) -> Result<()> {
    match target {
        ReadTarget::Alloc(vec) => {
            vec.clear();
            vec.try_reserve_exact(wanted)
                .map_err(|_| KilnError::OutOfMemory { requested: wanted })?;
            vec.resize(wanted, 0);
        }
        ReadTarget::Fixed(buf) => {
            if buf.len() < wanted {
                return Err(KilnError::BufferTooSmall {
                    needed: wanted,
                    capacity: buf.len(),
                });
            }
        }
        ReadTarget::Stream(_) => {}
    }
    Ok(())
}

fn deliver(target: &mut ReadTarget<'_>, at: usize, piece: &[u8]) {
    match target {
        ReadTarget::Alloc(vec) => vec[at..at + piece.len()].copy_from_slice(piece),
        ReadTarget::Fixed(buf) => buf[at..at + piece.len()].copy_from_slice(piece),
        ReadTarget::Stream(_) => {}
    }
}
