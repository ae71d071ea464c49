//! Consistency check of a whole heap file.
//!
//! Every region and data page up to the highest allocated page is read
//! under a shared page lock. Problems are collected rather than raised so
//! one pass reports everything it finds.

use super::constants::{SLOT_SIZE, SLOT_TABLE_START};
use super::file::HeapFile;
use super::fragment::FragmentHeader;
use super::meta::MetaPage;
use super::page::DataPage;
use super::region::RegionPage;
use super::rid::Rid;
use crate::lock::{LockMode, OpLocks};
use kiln_common::page::{Pgno, META_PGNO};
use kiln_common::Result;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Outcome of `HeapFile::verify`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub regions: usize,
    pub data_pages: usize,
    /// Visible records (whole or split).
    pub records: usize,
    pub fragments: usize,
    pub split_records: usize,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

impl HeapFile {
    /// Checks slot tables, bitmap levels, region high-water marks and
    /// every fragment chain.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let mut locks = OpLocks::new(&self.locks, self.locks.new_locker());

        locks.acquire(META_PGNO, LockMode::Read, true)?;
        let stored_last = {
            let guard = self.fetch(META_PGNO)?;
            let buf = guard.read();
            match MetaPage::read(&buf) {
                Ok(meta) => meta.last_pgno,
                Err(err) => {
                    report.problems.push(format!("metadata page: {}", err));
                    MetaPage::last_pgno(&buf)
                }
            }
        };
        locks.release(META_PGNO);
        if stored_last != self.last_pgno() {
            report.problems.push(format!(
                "metadata records last page {}, store uses {}",
                stored_last,
                self.last_pgno()
            ));
        }
        let last = stored_last.max(self.last_pgno());

        let mut fragments: HashMap<Rid, FragmentHeader> = HashMap::new();
        let mut region = 0u32;
        while let Some(rpgno) = self.geometry.region_pgno(region) {
            if rpgno > last {
                break;
            }
            report.regions += 1;
            self.verify_region(&mut locks, region, rpgno, last, &mut fragments, &mut report)?;
            region += 1;
        }

        verify_chains(&fragments, &mut report);

        if report.is_ok() {
            info!(
                data_pages = report.data_pages,
                records = report.records,
                fragments = report.fragments,
                "heap verified"
            );
        } else {
            warn!(problems = report.problems.len(), "heap verification found problems");
        }
        Ok(report)
    }

    fn verify_region(
        &self,
        locks: &mut OpLocks<'_>,
        region: u32,
        rpgno: Pgno,
        last: Pgno,
        fragments: &mut HashMap<Rid, FragmentHeader>,
        report: &mut VerifyReport,
    ) -> Result<()> {
        let rguard = self.fetch(rpgno)?;
        let (high, levels) = {
            let buf = rguard.read();
            if !RegionPage::is_region(&buf) {
                report
                    .problems
                    .push(format!("page {} should be the page of region {}", rpgno, region));
                return Ok(());
            }
            let high = RegionPage::high(&buf);
            let used = if high == 0 { 0 } else { high.saturating_sub(rpgno) };
            if high != 0 && (high <= rpgno || used > self.geometry.region_size()) {
                report.problems.push(format!(
                    "region {} high-water mark {} is outside the region",
                    region, high
                ));
                return Ok(());
            }
            let levels: Vec<u8> = (0..used).map(|i| RegionPage::level(&buf, i)).collect();
            (high, levels)
        };
        drop(rguard);
        if high > last {
            report.problems.push(format!(
                "region {} high-water mark {} is above the last page {}",
                region, high, last
            ));
        }

        for (index, recorded) in levels.into_iter().enumerate() {
            let pgno = rpgno + 1 + index as Pgno;
            locks.acquire(pgno, LockMode::Read, true)?;
            let guard = self.fetch(pgno)?;
            {
                let buf = guard.read();
                if !DataPage::is_data(&buf) {
                    report
                        .problems
                        .push(format!("page {} below the high-water mark is not a data page", pgno));
                } else {
                    report.data_pages += 1;
                    let actual = self.geometry.level_of(DataPage::free_space(&buf));
                    if actual != recorded {
                        report.problems.push(format!(
                            "page {} has level {} in the bitmap, {} by its free space",
                            pgno, recorded, actual
                        ));
                    }
                    for (slot, header) in check_data_page(&buf, pgno, &mut report.problems) {
                        fragments.insert(Rid::new(pgno, slot as u32), header);
                    }
                }
            }
            drop(guard);
            locks.release(pgno);
        }
        Ok(())
    }
}

/// Checks one data page's slot table and fragment heap and returns the
/// fragments it holds.
fn check_data_page(buf: &[u8], pgno: Pgno, problems: &mut Vec<String>) -> Vec<(u16, FragmentHeader)> {
    let table_len = DataPage::table_len(buf);
    let hoffset = DataPage::hoffset(buf);
    let mut found = Vec::new();
    let mut extents = Vec::new();

    if SLOT_TABLE_START + table_len * SLOT_SIZE > hoffset || hoffset > buf.len() {
        problems.push(format!("page {}: slot table overlaps the fragment heap", pgno));
        return found;
    }
    for slot in 0..table_len as u16 {
        match DataPage::fragment(buf, slot) {
            Ok(Some((header, _))) => {
                if let Some(offset) = DataPage::slot_offset(buf, slot) {
                    extents.push((offset, offset + header.footprint()));
                }
                found.push((slot, header));
            }
            Ok(None) => {
                if slot < DataPage::free_index(buf) {
                    problems.push(format!(
                        "page {}: empty slot {} below the free slot hint {}",
                        pgno,
                        slot,
                        DataPage::free_index(buf)
                    ));
                }
            }
            Err(err) => problems.push(format!("page {}: {}", pgno, err)),
        }
    }

    if found.len() != DataPage::entries(buf) as usize {
        problems.push(format!(
            "page {}: {} entries recorded, {} fragments present",
            pgno,
            DataPage::entries(buf),
            found.len()
        ));
    }
    if table_len > 0 && DataPage::slot_offset(buf, DataPage::high_index(buf)).is_none() {
        problems.push(format!("page {}: highest slot is empty", pgno));
    }

    extents.sort_unstable();
    let mut expect = hoffset;
    let mut packed = true;
    for (start, end) in extents {
        if start != expect {
            problems.push(format!(
                "page {}: fragment heap is not packed at offset {}",
                pgno, start
            ));
            packed = false;
            break;
        }
        expect = end;
    }
    if packed && expect != buf.len() {
        problems.push(format!("page {}: fragment heap ends at {}", pgno, expect));
    }
    found
}

/// Follows every chain from its first fragment and flags orphans.
fn verify_chains(fragments: &HashMap<Rid, FragmentHeader>, report: &mut VerifyReport) {
    report.fragments = fragments.len();
    let mut reached: HashSet<Rid> = HashSet::new();

    let mut starts: Vec<(&Rid, &FragmentHeader)> = fragments
        .iter()
        .filter(|(_, header)| header.is_visible())
        .collect();
    starts.sort_unstable_by_key(|(rid, _)| (rid.pgno, rid.slot));

    for (&rid, header) in starts {
        report.records += 1;
        if !header.is_split() {
            continue;
        }
        report.split_records += 1;

        let total = header.total_len as usize;
        let mut seen = header.size as usize;
        let mut current = *header;
        while !current.ends_chain() {
            let next = current.next;
            let Some(following) = fragments.get(&next) else {
                report
                    .problems
                    .push(format!("record {}: chain points at missing fragment {}", rid, next));
                break;
            };
            if following.is_first() || !following.is_split() {
                report
                    .problems
                    .push(format!("record {}: chain runs into record start {}", rid, next));
                break;
            }
            if !reached.insert(next) {
                report
                    .problems
                    .push(format!("record {}: fragment {} is linked twice", rid, next));
                break;
            }
            seen += following.size as usize;
            current = *following;
        }
        if current.ends_chain() && seen != total {
            report.problems.push(format!(
                "record {}: fragments hold {} bytes, header declares {}",
                rid, seen, total
            ));
        }
    }

    let mut orphans: Vec<&Rid> = fragments
        .iter()
        .filter(|(rid, header)| !header.is_visible() && !reached.contains(rid))
        .map(|(rid, _)| rid)
        .collect();
    orphans.sort_unstable_by_key(|rid| (rid.pgno, rid.slot));
    for rid in orphans {
        report
            .problems
            .push(format!("fragment {} is not part of any record", rid));
    }
}
