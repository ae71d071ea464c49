//! Disk manager for page-level file I/O.

use kiln_buffer::PageStore;
use kiln_common::page::{validate_page_size, Pgno};
use kiln_common::{KilnError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the heap data file inside the data directory.
pub const HEAP_FILE_NAME: &str = "heap.dat";

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Directory holding the heap file.
    pub data_dir: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: kiln_common::DEFAULT_PAGE_SIZE,
            fsync_enabled: true,
        }
    }
}

/// Reads and writes pages of the single heap data file.
///
/// Page `n` lives at byte offset `n * page_size`. Pages past the end of
/// the file read as absent so the buffer pool can materialize them.
pub struct DiskManager {
    config: DiskManagerConfig,
    path: PathBuf,
    file: Mutex<FileHandle>,
}

struct FileHandle {
    file: File,
    num_pages: u32,
}

impl DiskManager {
    /// Opens or creates the heap file in `config.data_dir`.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        validate_page_size(config.page_size)?;
        std::fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(HEAP_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size % config.page_size as u64 != 0 {
            tracing::warn!(
                path = %path.display(),
                file_size,
                page_size = config.page_size,
                "heap file has a partial trailing page"
            );
        }
        let num_pages = (file_size / config.page_size as u64) as u32;

        Ok(Self {
            config,
            path,
            file: Mutex::new(FileHandle { file, num_pages }),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Returns the heap file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset_of(&self, pgno: Pgno) -> u64 {
        pgno as u64 * self.config.page_size as u64
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.config.page_size {
            return Err(KilnError::PageSizeMismatch {
                expected: self.config.page_size,
                actual: len,
            });
        }
        Ok(())
    }
}

impl PageStore for DiskManager {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn read_page(&self, pgno: Pgno, buf: &mut [u8]) -> Result<bool> {
        self.check_len(buf.len())?;
        let mut handle = self.file.lock();

        if pgno >= handle.num_pages {
            buf.fill(0);
            return Ok(false);
        }

        let offset = self.offset_of(pgno);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.read_exact(buf)?;
        Ok(true)
    }

    fn write_page(&self, pgno: Pgno, buf: &[u8]) -> Result<()> {
        self.check_len(buf.len())?;
        let mut handle = self.file.lock();

        let offset = self.offset_of(pgno);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(buf)?;

        if self.config.fsync_enabled {
            handle.file.sync_data()?;
        }

        // Update page count if we extended the file
        if pgno >= handle.num_pages {
            handle.num_pages = pgno + 1;
        }
        Ok(())
    }

    fn num_pages(&self) -> Result<u32> {
        Ok(self.file.lock().num_pages)
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.file.lock().file.sync_all();
    }
}
