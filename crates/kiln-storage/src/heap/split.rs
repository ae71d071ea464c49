//! Split writes and in-place record relocation.
//!
//! A record too large for one page is stored as a chain of fragments. The
//! chain is written back to front so every fragment already knows its
//! successor; the front fragment, written last, carries the logical length
//! and becomes the record's RID.
//!
//! Rewriting a record keeps its RID. Each old fragment is removed and a
//! new one written into the same slot, holding as much of the new content
//! as that page now has room for. Content that does not fit is carried to
//! the next fragment; whatever is left after the old chain ends is split
//! written elsewhere and linked in by patching the last rewritten fragment.

use super::constants::{
    align_down, fragment_footprint, max_split_payload, max_whole_payload, MIN_FRAGMENT_SIZE,
    SLOT_SIZE, SPLIT_HEADER_SIZE, WHOLE_HEADER_SIZE,
};
use super::file::{HeapFile, OpCtx};
use super::fragment::FragmentHeader;
use super::page::DataPage;
use super::rid::Rid;
use crate::lock::LockMode;
use kiln_buffer::PageGuard;
use kiln_common::{KilnError, Result};
use tracing::debug;

/// New contents of a record being rewritten.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NewImage<'d> {
    /// Replace everything.
    Whole(&'d [u8]),
    /// Overwrite `data.len()` bytes at `offset`, zero filling any gap past
    /// the old end.
    Range { offset: usize, data: &'d [u8] },
}

impl NewImage<'_> {
    fn new_len(&self, old_len: usize) -> Result<usize> {
        let len = match *self {
            NewImage::Whole(data) => data.len(),
            NewImage::Range { offset, data } => offset
                .checked_add(data.len())
                .ok_or_else(|| KilnError::InvalidArgument("range end overflows".to_string()))?
                .max(old_len),
        };
        if u32::try_from(len).is_err() {
            return Err(KilnError::InvalidArgument(format!(
                "record length {} exceeds the 4 GB limit",
                len
            )));
        }
        Ok(len)
    }

    /// Appends new content bytes `[from, to)` to `out`.
    ///
    /// Old record bytes may only be drawn from `old`, the payload of the old
    /// fragment starting at logical offset `old_start`.
    fn materialize(
        &self,
        out: &mut Vec<u8>,
        from: usize,
        to: usize,
        old_len: usize,
        old_start: usize,
        old: &[u8],
    ) -> Result<()> {
        out.try_reserve(to - from)
            .map_err(|_| KilnError::OutOfMemory {
                requested: to - from,
            })?;
        match *self {
            NewImage::Whole(data) => out.extend_from_slice(&data[from..to]),
            NewImage::Range { offset, data } => {
                let range_end = offset + data.len();
                let mut pos = from;
                while pos < to {
                    if pos >= offset && pos < range_end {
                        let end = to.min(range_end);
                        out.extend_from_slice(&data[pos - offset..end - offset]);
                        pos = end;
                    } else if pos < old_len {
                        let limit = if pos < offset { offset } else { old_len };
                        let end = to.min(old_len).min(limit);
                        if pos < old_start || end > old_start + old.len() {
                            return Err(KilnError::Internal(format!(
                                "old bytes {}..{} are not in the current fragment",
                                pos, end
                            )));
                        }
                        out.extend_from_slice(&old[pos - old_start..end - old_start]);
                        pos = end;
                    } else {
                        // gap between the old end and the written range
                        let end = to.min(offset);
                        out.resize(out.len() + (end - pos), 0);
                        pos = end;
                    }
                }
            }
        }
        Ok(())
    }
}

impl HeapFile {
    pub(crate) fn append_in(&self, ctx: &mut OpCtx<'_>, data: &[u8]) -> Result<Rid> {
        let total = u32::try_from(data.len()).map_err(|_| {
            KilnError::InvalidArgument(format!(
                "record length {} exceeds the 4 GB limit",
                data.len()
            ))
        })?;

        if self.fits_whole(data.len()) {
            let header = FragmentHeader::whole(data.len() as u16);
            let alloc = self.allocate(ctx, header.footprint() + SLOT_SIZE)?;
            let slot = {
                let buf = alloc.guard.read();
                DataPage::next_free_slot(&buf)
            };
            self.add_fragment(ctx, &alloc.guard, slot, &header, data)?;
            let rid = Rid::new(alloc.pgno(), slot as u32);
            debug!(%rid, len = data.len(), level = alloc.level, "record appended");
            return Ok(rid);
        }

        let rid = self.split_write(ctx, data, Some(total))?;
        debug!(%rid, len = data.len(), "split record appended");
        Ok(rid)
    }

    /// Writes `data` as a fragment chain, back to front, returning the
    /// front fragment.
    ///
    /// With `total_len` the front fragment starts a record; without it the
    /// chain continues an existing one.
    pub(crate) fn split_write(
        &self,
        ctx: &mut OpCtx<'_>,
        data: &[u8],
        total_len: Option<u32>,
    ) -> Result<Rid> {
        let page_size = self.geometry.page_size();
        let max_payload = max_split_payload(page_size);
        let partial_request = (page_size / 4).max(MIN_FRAGMENT_SIZE + SLOT_SIZE);

        let mut end = data.len();
        let mut next = Rid::NONE;
        let mut pieces = 0usize;
        loop {
            let need = if end <= max_payload {
                fragment_footprint(SPLIT_HEADER_SIZE, end) + SLOT_SIZE
            } else {
                partial_request
            };
            let alloc = self.allocate(ctx, need)?;
            let (slot, room) = {
                let buf = alloc.guard.read();
                let slot = DataPage::next_free_slot(&buf);
                let room = DataPage::free_space(&buf)
                    .saturating_sub(DataPage::space_needed(&buf, slot, 0));
                (slot, room)
            };

            let chunk = align_down(room)
                .saturating_sub(SPLIT_HEADER_SIZE)
                .min(max_payload)
                .min(end);
            let start = end - chunk;
            let first = start == 0 && total_len.is_some();
            let header = FragmentHeader::split(
                first,
                pieces == 0,
                chunk as u16,
                total_len.unwrap_or(0),
                next,
            );
            self.add_fragment(ctx, &alloc.guard, slot, &header, &data[start..end])?;

            next = Rid::new(alloc.pgno(), slot as u32);
            pieces += 1;
            end = start;
            if end == 0 {
                debug!(front = %next, pieces, len = data.len(), "split write finished");
                return Ok(next);
            }
        }
    }

    /// Rewrites the record at `rid` with `image`, keeping the RID.
    pub(crate) fn relocate(&self, ctx: &mut OpCtx<'_>, rid: Rid, image: NewImage<'_>) -> Result<()> {
        let page_size = self.geometry.page_size();
        let (guard, slot, header) = self.lock_record(&mut ctx.locks, rid, LockMode::Write)?;
        let old_len = header.record_len();
        let new_len = image.new_len(old_len)?;
        let (range_start, range_end) = match image {
            NewImage::Range { offset, data } => {
                if data.is_empty() && new_len == old_len {
                    return Ok(());
                }
                (offset, offset + data.len())
            }
            NewImage::Whole(_) => (0, new_len),
        };
        let ranged = matches!(image, NewImage::Range { .. });
        let was_split = header.is_split();

        let mut current = (guard, slot, header);
        let mut first = true;
        let mut old_start = 0usize;
        let mut written = 0usize;
        let mut carry: Vec<u8> = Vec::new();
        let mut rewritten = 0usize;

        loop {
            let (guard, slot, header) = current;
            let pgno = guard.pgno();
            let old_end = old_start + header.size as usize;
            let last_old = header.ends_chain();
            if old_end > old_len || (last_old && old_end != old_len) {
                return Err(KilnError::Corruption {
                    pgno,
                    reason: format!(
                        "fragments of record {} disagree with its length {}",
                        rid, old_len
                    ),
                });
            }

            if ranged && carry.is_empty() && written == old_start {
                // nothing at or after this fragment changes
                if old_start >= range_end && new_len == old_len {
                    break;
                }
                // this fragment is untouched and the front needs no new length
                if old_end <= range_start && !last_old && (!first || new_len == old_len) {
                    written = old_end;
                    old_start = old_end;
                    first = false;
                    let at = header.next;
                    drop(guard);
                    current = self.lock_continuation(&mut ctx.locks, at, LockMode::Write)?;
                    continue;
                }
            }

            let (_, old_payload) = self.remove_fragment(ctx, &guard, slot)?;
            let room = {
                let buf = guard.read();
                DataPage::free_space(&buf).saturating_sub(DataPage::space_needed(&buf, slot, 0))
            };
            let whole_cap = align_down(room)
                .saturating_sub(WHOLE_HEADER_SIZE)
                .min(max_whole_payload(page_size));
            let split = was_split || new_len > whole_cap;
            let cap = if split {
                align_down(room)
                    .saturating_sub(SPLIT_HEADER_SIZE)
                    .min(max_split_payload(page_size))
            } else {
                whole_cap
            };

            let target = if last_old {
                new_len
            } else if ranged {
                old_end
            } else {
                new_len.min(written + cap)
            };
            let have = written + carry.len();
            if target > have {
                image.materialize(&mut carry, have, target, old_len, old_start, &old_payload)?;
            }

            let take = cap.min(carry.len());
            let done = written + take == new_len;
            let next = if done || last_old {
                Rid::NONE
            } else {
                header.next
            };
            let new_header = if split {
                FragmentHeader::split(first, done, take as u16, new_len as u32, next)
            } else {
                FragmentHeader::whole(take as u16)
            };
            self.add_fragment(ctx, &guard, slot, &new_header, &carry[..take])?;
            carry.drain(..take);
            written += take;
            rewritten += 1;

            if done {
                if !last_old {
                    self.delete_chain_from(ctx, header.next)?;
                }
                break;
            }
            if last_old {
                let tail = std::mem::take(&mut carry);
                let tail_rid = self.split_write(ctx, &tail, None)?;
                self.patch_next(ctx, &guard, slot, tail_rid)?;
                debug!(%rid, tail = tail.len(), "record grew past its chain");
                break;
            }

            old_start = old_end;
            first = false;
            let at = header.next;
            drop(guard);
            current = self.lock_continuation(&mut ctx.locks, at, LockMode::Write)?;
        }

        debug!(%rid, old_len, new_len, rewritten, "record rewritten");
        Ok(())
    }

    /// Deletes the chain of continuation fragments starting at `at`.
    fn delete_chain_from(&self, ctx: &mut OpCtx<'_>, mut at: Rid) -> Result<()> {
        loop {
            let (guard, slot, _) = self.lock_continuation(&mut ctx.locks, at, LockMode::Write)?;
            let (header, _) = self.remove_fragment(ctx, &guard, slot)?;
            if header.ends_chain() {
                return Ok(());
            }
            at = header.next;
        }
    }

    /// Points the fragment in `slot` at `next`, as a logged remove and add.
    fn patch_next(
        &self,
        ctx: &mut OpCtx<'_>,
        guard: &PageGuard<'_>,
        slot: u16,
        next: Rid,
    ) -> Result<()> {
        let (header, payload) = self.remove_fragment(ctx, guard, slot)?;
        let patched = FragmentHeader { next, ..header };
        self.add_fragment(ctx, guard, slot, &patched, &payload)
    }
}
