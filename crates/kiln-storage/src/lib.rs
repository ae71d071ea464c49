//! Storage engine for kiln.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O
//! - Page lock manager with lock coupling and deadlock detection
//! - Logging capability the heap writes its mutations through
//! - Heap record store with region bitmaps, split records and cursors

mod disk;
mod heap;
mod lock;
mod log;

pub use disk::{DiskManager, DiskManagerConfig};
pub use heap::constants;
pub use heap::{
    Cursor, DataPage, FragmentHeader, Geometry, HeapFile, HeapFileConfig, HeapMeta, HeapStats,
    MetaPage, PageKind, ReadRange, ReadTarget, RecoveryStats, RegionPage, Rid, VerifyReport,
};
pub use lock::{LockManager, LockMode, LockerId, OpLocks};
pub use log::{LogManager, NoopLog, WalLog};
