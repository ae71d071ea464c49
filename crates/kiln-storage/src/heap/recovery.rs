//! Crash recovery from the write-ahead log.
//!
//! Recovery runs before the store takes any operation:
//! 1. redo every heap record newer than the page it targets,
//! 2. rebuild region high-water marks and bitmap levels for every page the
//!    log mentions (region pages are never logged),
//! 3. roll back operations with neither a commit nor an abort record.
//!
//! Rollback writes compensation records and an abort just like a live
//! rollback, so a crash during recovery is recovered the same way.

use super::file::{HeapFile, OpCtx, SlotChange};
use super::meta::MetaPage;
use super::page::DataPage;
use super::region::{PageKind, RegionPage};
use crate::lock::{LockMode, LockerId};
use kiln_common::page::{PageHeader, PageType, Pgno, META_PGNO};
use kiln_common::{KilnError, Result};
use kiln_wal::{HeapLogRecord, LogRecordType, Lsn, WalReader};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

/// What a recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub redone: usize,
    pub rolled_back: usize,
}

/// An operation still open at the end of the log.
#[derive(Debug, Default)]
struct Pending {
    last_lsn: Lsn,
    /// Slot mutations not yet compensated, oldest first.
    changes: Vec<HeapLogRecord>,
}

pub(crate) fn recover(heap: &HeapFile, wal_dir: &Path) -> Result<RecoveryStats> {
    let records = WalReader::open(wal_dir)?.scan_all()?;
    let mut stats = RecoveryStats {
        records_scanned: records.len(),
        ..Default::default()
    };
    if records.is_empty() {
        return Ok(stats);
    }

    let mut open: BTreeMap<u32, Pending> = BTreeMap::new();
    let mut touched: BTreeSet<Pgno> = BTreeSet::new();
    let mut max_txn = 0u32;

    for record in &records {
        max_txn = max_txn.max(record.txn_id);
        match record.record_type {
            LogRecordType::Commit | LogRecordType::Abort => {
                open.remove(&record.txn_id);
            }
            LogRecordType::HeapAdd | LogRecordType::HeapRemove | LogRecordType::HeapPageAlloc => {
                let payload = HeapLogRecord::decode(record.record_type, &record.payload)?;
                if redo(heap, record.lsn, &payload, &mut touched)? {
                    stats.redone += 1;
                }
                let pending = open.entry(record.txn_id).or_default();
                pending.last_lsn = record.lsn;
                if let HeapLogRecord::AddRem { .. } = payload {
                    if record.is_compensation() {
                        pending.changes.pop();
                    } else {
                        pending.changes.push(payload);
                    }
                }
            }
            _ => {}
        }
    }

    let stored_last = {
        let guard = heap.fetch(META_PGNO)?;
        let buf = guard.read();
        MetaPage::last_pgno(&buf)
    };
    heap.raise_last_pgno(stored_last);

    for &pgno in &touched {
        restore_bitmap(heap, pgno)?;
    }

    for (txn, pending) in open.into_iter().rev() {
        let undone = pending.changes.len();
        undo_operation(heap, txn, pending)?;
        debug!(txn, undone, "rolled back incomplete operation");
        stats.rolled_back += 1;
    }

    heap.locks.seed_lockers(max_txn);
    heap.sync()?;
    info!(
        records = stats.records_scanned,
        redone = stats.redone,
        rolled_back = stats.rolled_back,
        pages = touched.len(),
        "recovery complete"
    );
    Ok(stats)
}

/// Reapplies `record` if its page predates it. Returns true if it did.
fn redo(
    heap: &HeapFile,
    lsn: Lsn,
    record: &HeapLogRecord,
    touched: &mut BTreeSet<Pgno>,
) -> Result<bool> {
    match record {
        HeapLogRecord::AddRem {
            op,
            pgno,
            slot,
            header,
            data,
            ..
        } => {
            touched.insert(*pgno);
            let guard = heap.fetch(*pgno)?;
            let mut buf = guard.latch();
            if PageHeader::lsn_of(&buf) >= lsn.0 {
                return Ok(false);
            }
            if !DataPage::is_data(&buf) {
                DataPage::init(&mut buf, *pgno);
            }
            DataPage::apply(&mut buf, *op, *slot, header, data).map_err(|err| {
                KilnError::RecoveryFailed(format!(
                    "redo of {} on page {} slot {}: {}",
                    lsn, pgno, slot, err
                ))
            })?;
            PageHeader::set_lsn(&mut buf, lsn.0);
            guard.mark_dirty();
            Ok(true)
        }
        HeapLogRecord::PageAlloc {
            pgno,
            page_type,
            new_last,
            ..
        } => {
            let redone = {
                let guard = heap.fetch(META_PGNO)?;
                let mut buf = guard.latch();
                if PageHeader::lsn_of(&buf) >= lsn.0 {
                    false
                } else {
                    if MetaPage::last_pgno(&buf) < *new_last {
                        MetaPage::set_last_pgno(&mut buf, *new_last);
                    }
                    PageHeader::set_lsn(&mut buf, lsn.0);
                    guard.mark_dirty();
                    true
                }
            };

            let guard = heap.fetch(*pgno)?;
            let mut buf = guard.latch();
            if *page_type == PageType::Region as u8 {
                if !RegionPage::is_region(&buf) {
                    RegionPage::init(&mut buf, *pgno);
                    guard.mark_dirty();
                }
            } else {
                touched.insert(*pgno);
                if !DataPage::is_data(&buf) {
                    DataPage::init(&mut buf, *pgno);
                    guard.mark_dirty();
                }
            }
            Ok(redone)
        }
    }
}

/// Makes the region of data page `pgno` cover it and record its level.
fn restore_bitmap(heap: &HeapFile, pgno: Pgno) -> Result<()> {
    let PageKind::Data { region, .. } = heap.geometry.kind(pgno) else {
        return Ok(());
    };
    let rpgno = heap.region_pgno(region)?;
    let old_high = {
        let rguard = heap.fetch(rpgno)?;
        let mut buf = rguard.latch();
        if !RegionPage::is_region(&buf) {
            RegionPage::init(&mut buf, rpgno);
            rguard.mark_dirty();
        }
        let high = RegionPage::high(&buf);
        if high < pgno {
            RegionPage::set_high(&mut buf, pgno);
            rguard.mark_dirty();
        }
        high
    };

    // pages the raised mark now covers but the log never mentioned
    for gap in old_high.max(rpgno) + 1..pgno {
        let level = data_level(heap, gap)?;
        heap.set_level(gap, level)?;
    }
    let level = data_level(heap, pgno)?;
    heap.set_level(pgno, level)
}

/// Bitmap level of a data page, formatting it first if it is blank.
fn data_level(heap: &HeapFile, pgno: Pgno) -> Result<u8> {
    let guard = heap.fetch(pgno)?;
    let mut buf = guard.latch();
    if !DataPage::is_data(&buf) {
        DataPage::init(&mut buf, pgno);
        guard.mark_dirty();
    }
    Ok(heap.geometry.level_of(DataPage::free_space(&buf)))
}

fn undo_operation(heap: &HeapFile, txn: u32, pending: Pending) -> Result<()> {
    let mut ctx = OpCtx::resume(&heap.locks, LockerId(txn), pending.last_lsn);
    for record in pending.changes.iter().rev() {
        if let HeapLogRecord::AddRem {
            op,
            pgno,
            slot,
            header,
            data,
            ..
        } = record
        {
            ctx.locks.acquire(*pgno, LockMode::Write, true)?;
            let guard = heap.fetch(*pgno)?;
            let change = SlotChange {
                op: op.inverse(),
                slot: *slot,
                header: header.clone(),
                data: data.clone(),
            };
            heap.apply_change(&mut ctx, &guard, change, true)?;
        }
    }
    heap.log.end_op(txn, ctx.prev_lsn(), false)?;
    Ok(())
}
