//! Buffer pool management for the kiln heap store.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable frame count
//! - Clock eviction policy for cache management
//! - Pin counting for concurrent access
//! - Dirty page tracking with a WAL barrier before write-back

mod frame;
mod page_table;
mod pool;
mod replacer;
mod store;

pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, FetchMode, PageGuard, WalBarrier};
pub use replacer::{ClockReplacer, Replacer};
pub use store::{MemoryPageStore, PageStore};
