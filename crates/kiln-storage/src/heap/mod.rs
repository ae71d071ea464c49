//! Heap record storage.
//!
//! Variable-length records live in fragments on slotted data pages.
//! Data pages are grouped into regions; each region page keeps a 2-bit
//! free-space level per data page so the allocator can screen candidates
//! without touching them. Records too large for one page are chained
//! across pages and keep their RID through every rewrite.

mod alloc;
pub mod constants;
mod cursor;
mod file;
mod fragment;
mod meta;
mod page;
mod read;
mod recovery;
mod region;
mod rid;
mod split;
mod verify;

pub use cursor::Cursor;
pub use file::{HeapFile, HeapFileConfig, HeapStats};
pub use fragment::FragmentHeader;
pub use meta::{HeapMeta, MetaPage};
pub use page::DataPage;
pub use read::{ReadRange, ReadTarget};
pub use recovery::RecoveryStats;
pub use region::{Geometry, PageKind, RegionPage};
pub use rid::Rid;
pub use verify::VerifyReport;
