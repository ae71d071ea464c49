//! HeapFile: variable-length record storage over the buffer pool.
//!
//! All page access goes through the buffer pool. Every operation runs as
//! its own logged unit: it takes page locks, logs each slot mutation
//! before applying it, and either commits or reverts everything it did
//! before returning.

use super::alloc::AllocCursor;
use super::constants::max_whole_payload;
use super::cursor::Cursor;
use super::fragment::FragmentHeader;
use super::meta::MetaPage;
use super::page::DataPage;
use super::region::{Geometry, PageKind, RegionPage};
use super::rid::Rid;
use super::split::NewImage;
use crate::disk::{DiskManager, DiskManagerConfig};
use crate::lock::{LockManager, LockMode, LockerId, OpLocks};
use crate::log::{LogManager, NoopLog, WalLog};
use bytes::Bytes;
use kiln_buffer::{BufferPool, BufferPoolConfig, BufferPoolStats, FetchMode, MemoryPageStore, PageGuard, PageStore};
use kiln_common::page::{validate_page_size, PageHeader, Pgno, META_PGNO};
use kiln_common::{KilnError, Result, StorageConfig};
use kiln_wal::{AddRemOp, HeapLogRecord, LogRecord, Lsn, WalWriter, WalWriterConfig};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for HeapFile.
#[derive(Debug, Clone)]
pub struct HeapFileConfig {
    /// Page size in bytes.
    pub page_size: usize,
    /// Data pages per region; the bitmap capacity of one page when unset.
    pub region_size: Option<u32>,
    /// Hard cap on the number of pages.
    pub max_pages: Option<u32>,
    /// Buffer pool size in frames.
    pub buffer_pool_pages: usize,
    /// Bound on every blocking lock wait.
    pub lock_timeout: Option<Duration>,
}

impl Default for HeapFileConfig {
    fn default() -> Self {
        Self {
            page_size: kiln_common::DEFAULT_PAGE_SIZE,
            region_size: None,
            max_pages: None,
            buffer_pool_pages: 1024,
            lock_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl HeapFileConfig {
    pub fn from_storage_config(config: &StorageConfig) -> Self {
        Self {
            page_size: config.page_size,
            region_size: config.region_size,
            max_pages: config.max_pages,
            buffer_pool_pages: config.buffer_pool_pages,
            lock_timeout: config.lock_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Point-in-time counters of a heap file.
#[derive(Debug, Clone)]
pub struct HeapStats {
    pub page_size: usize,
    pub region_size: u32,
    /// Highest page number ever allocated.
    pub last_pgno: Pgno,
    pub locked_pages: usize,
    pub pool: BufferPoolStats,
}

/// One slot mutation, before it is logged.
#[derive(Debug, Clone)]
pub(crate) struct SlotChange {
    pub op: AddRemOp,
    pub slot: u16,
    pub header: Bytes,
    pub data: Bytes,
}

/// State of one running operation.
pub(crate) struct OpCtx<'a> {
    pub locks: OpLocks<'a>,
    prev_lsn: Lsn,
    logged: bool,
    /// Applied slot mutations, oldest first.
    undo: Vec<HeapLogRecord>,
}

impl<'a> OpCtx<'a> {
    pub(crate) fn new(manager: &'a LockManager, locker: LockerId) -> Self {
        Self::resume(manager, locker, Lsn::INVALID)
    }

    /// Context for an operation whose last logged record is `prev_lsn`.
    pub(crate) fn resume(manager: &'a LockManager, locker: LockerId, prev_lsn: Lsn) -> Self {
        Self {
            locks: OpLocks::new(manager, locker),
            prev_lsn,
            logged: prev_lsn.is_valid(),
            undo: Vec::new(),
        }
    }

    /// Operation id in the log. Each locker runs one operation at a time.
    pub fn txn(&self) -> u32 {
        self.locks.locker().0
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn
    }

    pub fn note_logged(&mut self, lsn: Lsn) {
        self.logged = true;
        if lsn.is_valid() {
            self.prev_lsn = lsn;
        }
    }
}

/// Heap record store.
///
/// RIDs handed out by `append` stay valid until the record is deleted,
/// however often the record is rewritten or resized.
pub struct HeapFile {
    pub(crate) geometry: Geometry,
    pub(crate) pool: BufferPool,
    pub(crate) locks: LockManager,
    pub(crate) log: Arc<dyn LogManager>,
    pub(crate) alloc_cursor: Mutex<AllocCursor>,
    /// Mirror of the meta page's highest allocated page number.
    last_pgno: AtomicU32,
    failed: AtomicBool,
}

impl HeapFile {
    /// Opens a heap over `store`, formatting page 0 if the store is empty.
    ///
    /// Region size and page cap recorded in an existing file take
    /// precedence over `config`.
    pub fn new(
        store: Arc<dyn PageStore>,
        log: Arc<dyn LogManager>,
        config: HeapFileConfig,
    ) -> Result<Self> {
        validate_page_size(config.page_size)?;
        if store.page_size() != config.page_size {
            return Err(KilnError::PageSizeMismatch {
                expected: config.page_size,
                actual: store.page_size(),
            });
        }
        let pool = BufferPool::new(
            BufferPoolConfig {
                num_frames: config.buffer_pool_pages,
            },
            store,
        );

        let (geometry, last_pgno) = {
            let guard = pool.fetch(META_PGNO, FetchMode::Create)?;
            let mut buf = guard.latch();
            if MetaPage::is_formatted(&buf) {
                let meta = MetaPage::read(&buf)?;
                if meta.page_size as usize != config.page_size {
                    return Err(KilnError::ConfigError(format!(
                        "heap file uses {} byte pages, configured {}",
                        meta.page_size, config.page_size
                    )));
                }
                if config.region_size.is_some_and(|size| size != meta.region_size) {
                    warn!(
                        stored = meta.region_size,
                        configured = ?config.region_size,
                        "ignoring configured region size for existing heap file"
                    );
                }
                let geometry =
                    Geometry::new(config.page_size, Some(meta.region_size), meta.max_pages)?;
                (geometry, meta.last_pgno)
            } else {
                let geometry =
                    Geometry::new(config.page_size, config.region_size, config.max_pages)?;
                MetaPage::init(&mut buf, geometry.region_size(), geometry.max_pages());
                guard.mark_dirty();
                info!(
                    page_size = config.page_size,
                    region_size = geometry.region_size(),
                    max_pages = ?geometry.max_pages(),
                    "formatted new heap file"
                );
                (geometry, 0)
            }
        };

        Ok(Self {
            geometry,
            pool,
            locks: LockManager::new(config.lock_timeout),
            log,
            alloc_cursor: Mutex::new(AllocCursor::default()),
            last_pgno: AtomicU32::new(last_pgno),
            failed: AtomicBool::new(false),
        })
    }

    /// Creates an unlogged heap held entirely in memory.
    pub fn in_memory(config: HeapFileConfig) -> Result<Self> {
        let store = Arc::new(MemoryPageStore::new(config.page_size));
        Self::new(store, Arc::new(NoopLog), config)
    }

    /// Opens the heap file in `config.data_dir`, replaying the WAL in
    /// `config.wal_dir` when logging is enabled.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let disk = Arc::new(DiskManager::new(DiskManagerConfig {
            data_dir: config.data_dir.clone(),
            page_size: config.page_size,
            fsync_enabled: config.fsync_enabled,
        })?);
        let heap_config = HeapFileConfig::from_storage_config(config);

        if !config.wal_enabled {
            info!(data_dir = %config.data_dir.display(), "opening heap without a WAL");
            return Self::new(disk, Arc::new(NoopLog), heap_config);
        }

        let writer = Arc::new(WalWriter::new(WalWriterConfig {
            wal_dir: PathBuf::from(&config.wal_dir),
            segment_size: config.wal_segment_size,
            fsync_enabled: config.fsync_enabled,
        })?);
        let heap = Self::new(disk, Arc::new(WalLog::new(writer.clone())), heap_config)?;
        heap.pool
            .set_wal_barrier(Arc::new(move |lsn| writer.flush_to(Lsn(lsn))));

        let stats = super::recovery::recover(&heap, &config.wal_dir)?;
        info!(
            data_dir = %config.data_dir.display(),
            records = stats.records_scanned,
            redone = stats.redone,
            rolled_back = stats.rolled_back,
            "heap file opened"
        );
        Ok(heap)
    }

    pub fn page_size(&self) -> usize {
        self.geometry.page_size()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// True once a consistency fault has stopped the store.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Record operations
    // =========================================================================

    /// Stores a new record and returns its RID.
    pub fn append(&self, data: &[u8]) -> Result<Rid> {
        self.write_op(None, |ctx| self.append_in(ctx, data))
    }

    /// Reads a whole record.
    pub fn get(&self, rid: Rid) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.get_with(
            rid,
            super::read::ReadRange::ALL,
            super::read::ReadTarget::Alloc(&mut out),
            LockMode::Read,
        )?;
        Ok(out)
    }

    /// Replaces a record's contents. The RID does not change.
    pub fn put(&self, rid: Rid, data: &[u8]) -> Result<()> {
        self.write_op(None, |ctx| self.relocate(ctx, rid, NewImage::Whole(data)))
    }

    /// Overwrites `data.len()` bytes at `offset`, growing the record (zero
    /// filled) when the range ends past it.
    pub fn put_range(&self, rid: Rid, offset: usize, data: &[u8]) -> Result<()> {
        self.write_op(None, |ctx| {
            self.relocate(ctx, rid, NewImage::Range { offset, data })
        })
    }

    /// Deletes a record and every fragment of it.
    pub fn delete(&self, rid: Rid) -> Result<()> {
        self.write_op(None, |ctx| self.delete_in(ctx, rid))
    }

    /// Opens a read cursor.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self, self.locks.new_locker(), LockMode::Read)
    }

    /// Opens a cursor that locks for writing as it moves.
    pub fn cursor_rmw(&self) -> Cursor<'_> {
        Cursor::new(self, self.locks.new_locker(), LockMode::Write)
    }

    /// Lists the fragments of a record, first to last.
    pub fn fragment_chain(&self, rid: Rid) -> Result<Vec<Rid>> {
        self.read_op(|| {
            let mut locks = OpLocks::new(&self.locks, self.locks.new_locker());
            let (guard, _, header) = self.lock_record(&mut locks, rid, LockMode::Read)?;
            drop(guard);
            let mut chain = vec![rid];
            let mut next = header;
            while !next.ends_chain() {
                let at = next.next;
                let from = chain[chain.len() - 1].pgno;
                let (_, _, header) =
                    self.couple_continuation(&mut locks, from, at, LockMode::Read)?;
                chain.push(at);
                next = header;
            }
            Ok(chain)
        })
    }

    /// Makes the log durable, then writes every dirty page.
    pub fn sync(&self) -> Result<()> {
        self.log.flush()?;
        let flushed = self.pool.flush_all()?;
        self.pool.store().sync()?;
        debug!(flushed, "heap synced");
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            page_size: self.geometry.page_size(),
            region_size: self.geometry.region_size(),
            last_pgno: self.last_pgno(),
            locked_pages: self.locks.locked_pages(),
            pool: self.pool.stats(),
        }
    }

    // =========================================================================
    // Operation plumbing
    // =========================================================================

    pub(crate) fn check_failed(&self) -> Result<()> {
        if self.is_failed() {
            return Err(KilnError::StoreFailed);
        }
        Ok(())
    }

    pub(crate) fn mark_failed(&self, err: &KilnError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!(error = %err, "heap store failed, refusing further operations");
        }
    }

    /// Runs a read-only operation, failing the store on corruption.
    pub(crate) fn read_op<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.check_failed()?;
        f().map_err(|err| {
            if err.is_corruption() {
                self.mark_failed(&err);
            }
            err
        })
    }

    /// Runs a mutating operation under `locker` (a fresh one when None).
    ///
    /// On success the operation commits. On failure everything it applied
    /// is reverted with logged compensations and the operation aborts; a
    /// corruption fault fails the store instead.
    pub(crate) fn write_op<T>(
        &self,
        locker: Option<LockerId>,
        f: impl FnOnce(&mut OpCtx<'_>) -> Result<T>,
    ) -> Result<T> {
        self.check_failed()?;
        let locker = locker.unwrap_or_else(|| self.locks.new_locker());
        let mut ctx = OpCtx::new(&self.locks, locker);

        match f(&mut ctx) {
            Ok(value) => {
                if ctx.logged {
                    self.log.end_op(ctx.txn(), ctx.prev_lsn, true)?;
                }
                Ok(value)
            }
            Err(err) => {
                self.abort_op(&mut ctx, &err);
                Err(err)
            }
        }
    }

    fn abort_op(&self, ctx: &mut OpCtx<'_>, err: &KilnError) {
        if err.is_corruption() {
            self.mark_failed(err);
            return;
        }
        let undone = ctx.undo.len();
        if let Err(undo_err) = self.rollback(ctx) {
            self.mark_failed(&undo_err);
            return;
        }
        if ctx.logged {
            if let Err(log_err) = self.log.end_op(ctx.txn(), ctx.prev_lsn, false) {
                warn!(txn = ctx.txn(), error = %log_err, "failed to log abort");
            }
        }
        if undone > 0 {
            debug!(txn = ctx.txn(), undone, error = %err, "operation rolled back");
        }
    }

    /// Reverts the operation's slot mutations, newest first.
    fn rollback(&self, ctx: &mut OpCtx<'_>) -> Result<()> {
        let records = std::mem::take(&mut ctx.undo);
        for record in records.iter().rev() {
            if let HeapLogRecord::AddRem {
                op,
                pgno,
                slot,
                header,
                data,
                ..
            } = record
            {
                let guard = self.fetch(*pgno)?;
                let change = SlotChange {
                    op: op.inverse(),
                    slot: *slot,
                    header: header.clone(),
                    data: data.clone(),
                };
                self.apply_change(ctx, &guard, change, true)?;
            }
        }
        Ok(())
    }

    /// Logs a slot mutation, applies it and stamps the page.
    ///
    /// The caller holds the page's write lock. The bitmap entry is updated
    /// after the page latch is released, and only when the level moved.
    pub(crate) fn apply_change(
        &self,
        ctx: &mut OpCtx<'_>,
        guard: &PageGuard<'_>,
        change: SlotChange,
        compensation: bool,
    ) -> Result<()> {
        let pgno = guard.pgno();
        let (old_level, new_level) = {
            let mut buf = guard.write();
            let old_level = self.geometry.level_of(DataPage::free_space(&buf));
            match change.op {
                AddRemOp::Add => {
                    let header = FragmentHeader::decode(&change.header, pgno)?;
                    if !DataPage::can_insert(&buf, change.slot, header.footprint()) {
                        return Err(KilnError::Internal(format!(
                            "fragment does not fit slot {} of page {}",
                            change.slot, pgno
                        )));
                    }
                }
                AddRemOp::Remove => {
                    if DataPage::slot_offset(&buf, change.slot).is_none() {
                        return Err(KilnError::Internal(format!(
                            "slot {} of page {} is already empty",
                            change.slot, pgno
                        )));
                    }
                }
            }

            let record = HeapLogRecord::AddRem {
                op: change.op,
                pgno,
                slot: change.slot,
                page_lsn: Lsn(PageHeader::lsn_of(&buf)),
                header: change.header,
                data: change.data,
            };
            let flags = if compensation {
                LogRecord::FLAG_COMPENSATION
            } else {
                0
            };
            let lsn = self
                .log
                .append_with_flags(ctx.txn(), ctx.prev_lsn, &record, flags)?;

            if let HeapLogRecord::AddRem {
                op,
                slot,
                header,
                data,
                ..
            } = &record
            {
                DataPage::apply(&mut buf, *op, *slot, header, data)?;
            }
            if lsn.is_valid() {
                PageHeader::set_lsn(&mut buf, lsn.0);
            }
            ctx.note_logged(lsn);
            if !compensation {
                ctx.undo.push(record);
            }
            (old_level, self.geometry.level_of(DataPage::free_space(&buf)))
        };

        if old_level != new_level {
            self.set_level(pgno, new_level)?;
        }
        Ok(())
    }

    pub(crate) fn add_fragment(
        &self,
        ctx: &mut OpCtx<'_>,
        guard: &PageGuard<'_>,
        slot: u16,
        header: &FragmentHeader,
        payload: &[u8],
    ) -> Result<()> {
        let change = SlotChange {
            op: AddRemOp::Add,
            slot,
            header: Bytes::from(header.encode()),
            data: Bytes::copy_from_slice(payload),
        };
        self.apply_change(ctx, guard, change, false)
    }

    /// Removes the fragment in `slot`, returning what it held.
    pub(crate) fn remove_fragment(
        &self,
        ctx: &mut OpCtx<'_>,
        guard: &PageGuard<'_>,
        slot: u16,
    ) -> Result<(FragmentHeader, Bytes)> {
        let (header, data) = {
            let buf = guard.read();
            match DataPage::fragment(&buf, slot)? {
                Some((header, payload)) => (header, Bytes::copy_from_slice(payload)),
                None => {
                    return Err(KilnError::Internal(format!(
                        "slot {} of page {} is empty",
                        slot,
                        guard.pgno()
                    )))
                }
            }
        };
        let change = SlotChange {
            op: AddRemOp::Remove,
            slot,
            header: Bytes::from(header.encode()),
            data: data.clone(),
        };
        self.apply_change(ctx, guard, change, false)?;
        Ok((header, data))
    }

    /// Records a data page's free-space level in its region bitmap.
    pub(crate) fn set_level(&self, pgno: Pgno, level: u8) -> Result<()> {
        let PageKind::Data { region, index } = self.geometry.kind(pgno) else {
            return Err(KilnError::Internal(format!("page {} is not a data page", pgno)));
        };
        let rpgno = self.region_pgno(region)?;
        let guard = self.fetch(rpgno)?;
        let mut buf = guard.latch();
        if RegionPage::level(&buf, index) != level {
            RegionPage::set_level(&mut buf, index, level);
            guard.mark_dirty();
        }
        Ok(())
    }

    // =========================================================================
    // Page and record lookup
    // =========================================================================

    pub(crate) fn fetch(&self, pgno: Pgno) -> Result<PageGuard<'_>> {
        self.pool.fetch(pgno, FetchMode::Create)
    }

    pub(crate) fn region_pgno(&self, region: u32) -> Result<Pgno> {
        self.geometry
            .region_pgno(region)
            .ok_or_else(|| KilnError::Internal(format!("region {} is out of range", region)))
    }

    pub(crate) fn last_pgno(&self) -> Pgno {
        self.last_pgno.load(Ordering::Acquire)
    }

    pub(crate) fn raise_last_pgno(&self, pgno: Pgno) {
        self.last_pgno.fetch_max(pgno, Ordering::AcqRel);
    }

    /// Slot index of `rid` if it can name a record at all.
    pub(crate) fn check_rid(&self, rid: Rid) -> Result<u16> {
        let slot = rid.slot_index().ok_or(KilnError::NotFound)?;
        if !self.geometry.is_data_pgno(rid.pgno) || rid.pgno > self.last_pgno() {
            return Err(KilnError::NotFound);
        }
        Ok(slot)
    }

    /// Locks the page of `rid` and returns its first fragment header.
    pub(crate) fn lock_record(
        &self,
        locks: &mut OpLocks<'_>,
        rid: Rid,
        mode: LockMode,
    ) -> Result<(PageGuard<'_>, u16, FragmentHeader)> {
        let slot = self.check_rid(rid)?;
        locks.acquire(rid.pgno, mode, true)?;
        let guard = self.fetch(rid.pgno)?;
        let header = {
            let buf = guard.read();
            if !DataPage::is_data(&buf) {
                return Err(KilnError::NotFound);
            }
            match DataPage::fragment(&buf, slot)? {
                Some((header, _)) if header.is_visible() => header,
                _ => return Err(KilnError::NotFound),
            }
        };
        Ok((guard, slot, header))
    }

    /// Locks the page of a continuation fragment and returns its header.
    pub(crate) fn lock_continuation(
        &self,
        locks: &mut OpLocks<'_>,
        rid: Rid,
        mode: LockMode,
    ) -> Result<(PageGuard<'_>, u16, FragmentHeader)> {
        self.continuation(locks, None, rid, mode)
    }

    /// Like `lock_continuation`, but moves the operation's lock on `from`
    /// to the continuation's page.
    pub(crate) fn couple_continuation(
        &self,
        locks: &mut OpLocks<'_>,
        from: Pgno,
        rid: Rid,
        mode: LockMode,
    ) -> Result<(PageGuard<'_>, u16, FragmentHeader)> {
        self.continuation(locks, Some(from), rid, mode)
    }

    fn continuation(
        &self,
        locks: &mut OpLocks<'_>,
        from: Option<Pgno>,
        rid: Rid,
        mode: LockMode,
    ) -> Result<(PageGuard<'_>, u16, FragmentHeader)> {
        let corrupt = |reason: &str| KilnError::Corruption {
            pgno: rid.pgno,
            reason: format!("fragment {}: {}", rid, reason),
        };
        let slot = rid.slot_index().ok_or_else(|| corrupt("slot out of range"))?;
        if !self.geometry.is_data_pgno(rid.pgno) || rid.pgno > self.last_pgno() {
            return Err(corrupt("chain points outside the data pages"));
        }
        match from {
            Some(old) => locks.couple(old, rid.pgno, mode, true)?,
            None => locks.acquire(rid.pgno, mode, true)?,
        }
        let guard = self.fetch(rid.pgno)?;
        let header = {
            let buf = guard.read();
            if !DataPage::is_data(&buf) {
                return Err(corrupt("chain points at a page that is not a data page"));
            }
            match DataPage::fragment(&buf, slot)? {
                Some((header, _)) if header.is_split() && !header.is_first() => header,
                Some(_) => return Err(corrupt("chain points at the start of a record")),
                None => return Err(corrupt("chain points at an empty slot")),
            }
        };
        Ok((guard, slot, header))
    }

    pub(crate) fn delete_in(&self, ctx: &mut OpCtx<'_>, rid: Rid) -> Result<()> {
        let (guard, slot, first) = self.lock_record(&mut ctx.locks, rid, LockMode::Write)?;
        let total = first.record_len();
        let (mut header, _) = self.remove_fragment(ctx, &guard, slot)?;
        drop(guard);

        let mut fragments = 1;
        let mut seen = header.size as usize;
        while !header.ends_chain() && seen <= total {
            let at = header.next;
            let (guard, slot, _) = self.lock_continuation(&mut ctx.locks, at, LockMode::Write)?;
            header = self.remove_fragment(ctx, &guard, slot)?.0;
            seen += header.size as usize;
            fragments += 1;
        }
        if seen != total {
            return Err(KilnError::Corruption {
                pgno: rid.pgno,
                reason: format!("record {} holds {} of {} bytes", rid, seen, total),
            });
        }
        debug!(%rid, fragments, "record deleted");
        Ok(())
    }

    /// True if a record this long can be stored without splitting.
    pub(crate) fn fits_whole(&self, len: usize) -> bool {
        len <= max_whole_payload(self.geometry.page_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::read::{ReadRange, ReadTarget};

    fn create_test_heap() -> HeapFile {
        HeapFile::in_memory(HeapFileConfig {
            page_size: 512,
            buffer_pool_pages: 64,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_heap_file_new() {
        let heap = create_test_heap();
        assert_eq!(heap.page_size(), 512);
        assert_eq!(heap.geometry().region_size(), 1904);
        assert_eq!(heap.stats().last_pgno, 0);
        assert!(!heap.is_failed());
    }

    #[test]
    fn test_heap_file_append_get() {
        let heap = create_test_heap();
        let rid = heap.append(b"hello heap").unwrap();
        assert_eq!(rid, Rid::new(2, 0));
        assert_eq!(heap.get(rid).unwrap(), b"hello heap");
        assert_eq!(heap.stats().last_pgno, 2);
    }

    #[test]
    fn test_heap_file_delete() {
        let heap = create_test_heap();
        let rid = heap.append(b"short lived").unwrap();
        heap.delete(rid).unwrap();
        assert!(matches!(heap.get(rid), Err(KilnError::NotFound)));
        assert!(matches!(heap.delete(rid), Err(KilnError::NotFound)));
    }

    #[test]
    fn test_heap_file_invalid_rids() {
        let heap = create_test_heap();
        heap.append(b"x").unwrap();
        for rid in [
            Rid::new(0, 0),
            Rid::new(1, 0),
            Rid::new(2, 1),
            Rid::new(2, 70_000),
            Rid::new(300, 0),
        ] {
            assert!(matches!(heap.get(rid), Err(KilnError::NotFound)), "{}", rid);
        }
    }

    #[test]
    fn test_heap_file_reopens_meta() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(512));
        let config = HeapFileConfig {
            page_size: 512,
            region_size: Some(8),
            max_pages: Some(40),
            buffer_pool_pages: 16,
            ..Default::default()
        };
        let rid = {
            let heap = HeapFile::new(store.clone(), Arc::new(NoopLog), config.clone()).unwrap();
            let rid = heap.append(b"persisted").unwrap();
            heap.sync().unwrap();
            rid
        };

        // a different region size on reopen is ignored
        let heap = HeapFile::new(
            store,
            Arc::new(NoopLog),
            HeapFileConfig {
                region_size: Some(16),
                max_pages: None,
                ..config
            },
        )
        .unwrap();
        assert_eq!(heap.geometry().region_size(), 8);
        assert_eq!(heap.geometry().max_pages(), Some(40));
        assert_eq!(heap.get(rid).unwrap(), b"persisted");
    }

    #[test]
    fn test_heap_file_page_size_mismatch() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(1024));
        let result = HeapFile::new(
            store,
            Arc::new(NoopLog),
            HeapFileConfig {
                page_size: 512,
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_store_refuses_operations() {
        let heap = create_test_heap();
        let rid = heap.append(b"doomed").unwrap();
        heap.mark_failed(&KilnError::Corruption {
            pgno: rid.pgno,
            reason: "test".to_string(),
        });
        assert!(matches!(heap.get(rid), Err(KilnError::StoreFailed)));
        assert!(matches!(heap.append(b"more"), Err(KilnError::StoreFailed)));
        let mut buf = [0u8; 4];
        assert!(matches!(
            heap.get_with(rid, ReadRange::ALL, ReadTarget::Fixed(&mut buf), LockMode::Read),
            Err(KilnError::StoreFailed)
        ));
    }

    fn overwrite_total_len(heap: &HeapFile, rid: Rid, total: u32) {
        let guard = heap.pool.fetch(rid.pgno, FetchMode::Existing).unwrap();
        let mut buf = guard.write();
        let offset = DataPage::slot_offset(&buf, rid.slot as u16).unwrap();
        buf[offset + 4..offset + 8].copy_from_slice(&total.to_le_bytes());
    }

    #[test]
    fn test_chain_length_mismatch_fails_store() {
        type Op = fn(&HeapFile, Rid) -> Result<()>;
        let ops: [(&str, Op); 3] = [
            ("get", |heap, rid| heap.get(rid).map(|_| ())),
            ("put", |heap, rid| heap.put(rid, &vec![9u8; 1500])),
            ("delete", |heap, rid| heap.delete(rid)),
        ];

        for (name, op) in ops {
            let heap = create_test_heap();
            let bystander = heap.append(b"bystander").unwrap();
            let rid = heap.append(&vec![4u8; 1500]).unwrap();
            assert!(heap.fragment_chain(rid).unwrap().len() > 1);
            overwrite_total_len(&heap, rid, 1400);

            match op(&heap, rid) {
                Err(KilnError::Corruption { .. }) => {}
                other => panic!("{}: expected Corruption, got {:?}", name, other),
            }
            assert!(heap.is_failed(), "{}", name);
            assert!(matches!(heap.append(b"later"), Err(KilnError::StoreFailed)));
            assert!(matches!(heap.get(bystander), Err(KilnError::StoreFailed)));
            assert!(matches!(heap.delete(bystander), Err(KilnError::StoreFailed)));
        }
    }

    #[test]
    fn test_operations_release_locks() {
        let heap = create_test_heap();
        let rid = heap.append(&vec![5u8; 1500]).unwrap();
        heap.put_range(rid, 10, b"abc").unwrap();
        heap.get(rid).unwrap();
        heap.delete(rid).unwrap();
        assert_eq!(heap.stats().locked_pages, 0);
    }
}
