//! Configuration structures for kiln.

use crate::error::{KilnError, Result};
use crate::page::{validate_page_size, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage configuration for a heap store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the heap data file.
    pub data_dir: PathBuf,
    /// Directory for WAL segment files.
    pub wal_dir: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Buffer pool size in number of pages.
    pub buffer_pool_pages: usize,
    /// Write a WAL for every page mutation.
    pub wal_enabled: bool,
    /// WAL segment size in bytes.
    pub wal_segment_size: u32,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
    /// Data pages per region. Defaults to the bitmap capacity of one page.
    pub region_size: Option<u32>,
    /// Hard cap on the number of pages in the file (unlimited when unset).
    pub max_pages: Option<u32>,
    /// How long a blocked lock request waits before failing (forever when unset).
    pub lock_timeout_ms: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_dir: PathBuf::from("./data/wal"),
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_pages: 1024, // 4 MB with 4 KB pages
            wal_enabled: true,
            wal_segment_size: 16 * 1024 * 1024, // 16 MB
            fsync_enabled: true,
            region_size: None,
            max_pages: None,
            lock_timeout_ms: Some(10_000),
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * self.page_size
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.buffer_pool_pages < 8 {
            return Err(KilnError::ConfigError(format!(
                "buffer_pool_pages must be at least 8, got {}",
                self.buffer_pool_pages
            )));
        }
        if self.wal_segment_size < 64 * 1024 {
            return Err(KilnError::ConfigError(format!(
                "wal_segment_size must be at least 64 KB, got {}",
                self.wal_segment_size
            )));
        }
        if self.region_size == Some(0) {
            return Err(KilnError::ConfigError(
                "region_size must be positive".to_string(),
            ));
        }
        if let Some(max) = self.max_pages {
            // meta, one region and one data page
            if max < 3 {
                return Err(KilnError::ConfigError(format!(
                    "max_pages must be at least 3, got {}",
                    max
                )));
            }
        }
        Ok(())
    }

    /// Parses a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: StorageConfig = toml::from_str(contents)
            .map_err(|e| KilnError::ConfigError(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            KilnError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Serializes the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| KilnError::ConfigError(format!("cannot serialize config: {}", e)))
    }
}
