//! Backing stores that the buffer pool reads pages from and writes them to.

use kiln_common::page::Pgno;
use kiln_common::{KilnError, Result};
use parking_lot::Mutex;

/// Page-granular backing storage.
pub trait PageStore: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Reads a page into `buf`.
    ///
    /// Returns false when the page has never been written; `buf` is then
    /// left zeroed.
    fn read_page(&self, pgno: Pgno, buf: &mut [u8]) -> Result<bool>;

    /// Writes a full page.
    fn write_page(&self, pgno: Pgno, buf: &[u8]) -> Result<()>;

    /// Number of pages the store currently holds.
    fn num_pages(&self) -> Result<u32>;

    /// Makes previous writes durable.
    fn sync(&self) -> Result<()>;
}

/// Volatile page store kept entirely in memory.
pub struct MemoryPageStore {
    page_size: usize,
    pages: Mutex<Vec<Option<Box<[u8]>>>>,
}

impl MemoryPageStore {
    /// Creates an empty in-memory store.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Mutex::new(Vec::new()),
        }
    }
}

impl PageStore for MemoryPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, pgno: Pgno, buf: &mut [u8]) -> Result<bool> {
        let pages = self.pages.lock();
        match pages.get(pgno as usize) {
            Some(Some(page)) => {
                buf.copy_from_slice(page);
                Ok(true)
            }
            _ => {
                buf.fill(0);
                Ok(false)
            }
        }
    }

    fn write_page(&self, pgno: Pgno, buf: &[u8]) -> Result<()> {
        if buf.len() != self.page_size {
            return Err(KilnError::PageSizeMismatch {
                expected: self.page_size,
                actual: buf.len(),
            });
        }
        let mut pages = self.pages.lock();
        let index = pgno as usize;
        if pages.len() <= index {
            pages.resize_with(index + 1, || None);
        }
        pages[index] = Some(buf.to_vec().into_boxed_slice());
        Ok(())
    }

    fn num_pages(&self) -> Result<u32> {
        Ok(self.pages.lock().len() as u32)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
