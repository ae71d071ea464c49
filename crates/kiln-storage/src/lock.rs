//! Page-granular lock manager.
//!
//! Lockers take shared or exclusive locks on page numbers. Locks are
//! reentrant per locker and counted; a reader that is the only holder may
//! upgrade to a writer. Blocking waits sit on one condition variable with a
//! wait-for graph for deadlock detection; the requester that would close a
//! cycle is refused with `Deadlock`.

use kiln_common::{KilnError, Pgno, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Identifies one lock owner: an operation or a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockerId(pub u32);

impl std::fmt::Display for LockerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "locker:{}", self.0)
    }
}

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Held {
    mode: LockMode,
    count: u32,
}

#[derive(Debug, Default)]
struct PageLock {
    holders: HashMap<LockerId, Held>,
}

impl PageLock {
    /// Lockers that prevent `locker` from holding the page in `mode`.
    fn blockers(&self, locker: LockerId, mode: LockMode) -> HashSet<LockerId> {
        if let Some(held) = self.holders.get(&locker) {
            if held.mode == LockMode::Write || mode == LockMode::Read {
                return HashSet::new();
            }
        }
        self.holders
            .iter()
            .filter(|(id, held)| {
                **id != locker && (mode == LockMode::Write || held.mode == LockMode::Write)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn grant(&mut self, locker: LockerId, mode: LockMode) {
        let held = self.holders.entry(locker).or_insert(Held { mode, count: 0 });
        if mode == LockMode::Write {
            held.mode = LockMode::Write;
        }
        held.count += 1;
    }
}

#[derive(Debug, Default)]
struct LockTable {
    pages: HashMap<Pgno, PageLock>,
    /// waiter -> lockers it waits for
    waits: HashMap<LockerId, HashSet<LockerId>>,
}

impl LockTable {
    fn blockers(&self, locker: LockerId, pgno: Pgno, mode: LockMode) -> HashSet<LockerId> {
        self.pages
            .get(&pgno)
            .map(|page| page.blockers(locker, mode))
            .unwrap_or_default()
    }

    /// True if following wait edges from `start` leads back to it.
    fn closes_cycle(&self, start: LockerId) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<LockerId> = self
            .waits
            .get(&start)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default();

        while let Some(node) = stack.pop() {
            if node == start {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = self.waits.get(&node) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    /// Drops one count; returns true if the page changed hands.
    fn release(&mut self, locker: LockerId, pgno: Pgno) -> bool {
        let Some(page) = self.pages.get_mut(&pgno) else {
            return false;
        };
        let Some(held) = page.holders.get_mut(&locker) else {
            return false;
        };
        held.count -= 1;
        if held.count > 0 {
            return false;
        }
        page.holders.remove(&locker);
        if page.holders.is_empty() {
            self.pages.remove(&pgno);
        }
        true
    }
}

/// Page lock manager shared by every operation on one store.
pub struct LockManager {
    table: Mutex<LockTable>,
    cond: Condvar,
    timeout: Option<Duration>,
    next_locker: AtomicU32,
}

impl LockManager {
    /// Creates a lock manager. `timeout` bounds every blocking wait.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            cond: Condvar::new(),
            timeout,
            next_locker: AtomicU32::new(1),
        }
    }

    /// Hands out a fresh locker id.
    pub fn new_locker(&self) -> LockerId {
        LockerId(self.next_locker.fetch_add(1, Ordering::SeqCst))
    }

    /// Makes sure future locker ids start above `floor`.
    pub fn seed_lockers(&self, floor: u32) {
        self.next_locker
            .fetch_max(floor.saturating_add(1), Ordering::SeqCst);
    }

    /// Acquires a lock, waiting for it if `wait` is set.
    ///
    /// A non-blocking request that cannot be granted fails with
    /// `LockNotGranted`.
    pub fn acquire(&self, locker: LockerId, pgno: Pgno, mode: LockMode, wait: bool) -> Result<()> {
        let mut table = self.table.lock();
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;

        loop {
            let blockers = table.blockers(locker, pgno, mode);
            if blockers.is_empty() {
                table.waits.remove(&locker);
                table.pages.entry(pgno).or_default().grant(locker, mode);
                return Ok(());
            }
            if !wait {
                return Err(KilnError::LockNotGranted { pgno });
            }
            if timed_out {
                table.waits.remove(&locker);
                debug!(%locker, pgno, ?mode, "lock wait timed out");
                return Err(KilnError::LockTimeout { pgno });
            }

            table.waits.insert(locker, blockers);
            if table.closes_cycle(locker) {
                table.waits.remove(&locker);
                debug!(%locker, pgno, ?mode, "deadlock detected");
                return Err(KilnError::Deadlock { pgno });
            }

            match deadline {
                Some(deadline) => {
                    timed_out = self.cond.wait_until(&mut table, deadline).timed_out();
                }
                None => self.cond.wait(&mut table),
            }
        }
    }

    /// Acquires `new` and then releases `old`.
    ///
    /// If the acquire fails, `old` is still held.
    pub fn couple(
        &self,
        locker: LockerId,
        old: Pgno,
        new: Pgno,
        mode: LockMode,
        wait: bool,
    ) -> Result<()> {
        self.acquire(locker, new, mode, wait)?;
        self.release(locker, old);
        Ok(())
    }

    /// Releases one count of a lock.
    pub fn release(&self, locker: LockerId, pgno: Pgno) {
        let changed = self.table.lock().release(locker, pgno);
        if changed {
            self.cond.notify_all();
        }
    }

    /// Releases every lock `locker` holds.
    pub fn release_all(&self, locker: LockerId) {
        let mut table = self.table.lock();
        table.pages.retain(|_, page| {
            page.holders.remove(&locker);
            !page.holders.is_empty()
        });
        table.waits.remove(&locker);
        drop(table);
        self.cond.notify_all();
    }

    /// Returns the mode `locker` holds on `pgno`, if any.
    pub fn held_mode(&self, locker: LockerId, pgno: Pgno) -> Option<LockMode> {
        self.table
            .lock()
            .pages
            .get(&pgno)
            .and_then(|page| page.holders.get(&locker))
            .map(|held| held.mode)
    }

    /// Number of pages with at least one holder.
    pub fn locked_pages(&self) -> usize {
        self.table.lock().pages.len()
    }
}

/// The locks one operation holds, released when the guard drops.
///
/// Each successful acquire is recorded once, so reentrant counts taken on
/// behalf of the operation are undone without touching counts the same
/// locker holds elsewhere (a cursor's position lock, for instance).
pub struct OpLocks<'a> {
    manager: &'a LockManager,
    locker: LockerId,
    held: Vec<Pgno>,
}

impl<'a> OpLocks<'a> {
    pub fn new(manager: &'a LockManager, locker: LockerId) -> Self {
        Self {
            manager,
            locker,
            held: Vec::new(),
        }
    }

    pub fn locker(&self) -> LockerId {
        self.locker
    }

    pub fn acquire(&mut self, pgno: Pgno, mode: LockMode, wait: bool) -> Result<()> {
        self.manager.acquire(self.locker, pgno, mode, wait)?;
        self.held.push(pgno);
        Ok(())
    }

    /// Moves one count this operation holds on `old` to `new`. Without a
    /// count on `old` this is a plain acquire of `new`.
    pub fn couple(&mut self, old: Pgno, new: Pgno, mode: LockMode, wait: bool) -> Result<()> {
        let Some(pos) = self.held.iter().rposition(|&p| p == old) else {
            return self.acquire(new, mode, wait);
        };
        self.manager.couple(self.locker, old, new, mode, wait)?;
        self.held.remove(pos);
        self.held.push(new);
        Ok(())
    }

    /// Releases one count this operation took on `pgno`.
    pub fn release(&mut self, pgno: Pgno) {
        if let Some(pos) = self.held.iter().rposition(|&p| p == pgno) {
            self.held.remove(pos);
            self.manager.release(self.locker, pgno);
        }
    }

    /// Returns true if this operation took a lock on `pgno`.
    pub fn holds(&self, pgno: Pgno) -> bool {
        self.held.contains(&pgno)
    }
}

impl Drop for OpLocks<'_> {
    fn drop(&mut self) {
        for pgno in self.held.drain(..).rev() {
            self.manager.release(self.locker, pgno);
        }
    }
}
