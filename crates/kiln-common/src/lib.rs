//! kiln common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all kiln components.

pub mod config;
pub mod error;
pub mod page;

pub use config::StorageConfig;
pub use error::{KilnError, Result};
pub use page::{PageHeader, PageType, Pgno, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, META_PGNO, MIN_PAGE_SIZE};
