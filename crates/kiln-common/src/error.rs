//! Error types for kiln.

use thiserror::Error;

/// Result type alias using KilnError.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Errors that can occur in kiln operations.
#[derive(Debug, Error)]
pub enum KilnError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Record errors
    #[error("Record not found")]
    NotFound,

    #[error("Buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Heap full, no page can hold the request")]
    HeapFull,

    #[error("Out of memory reserving {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Corruption on page {pgno}: {reason}")]
    Corruption { pgno: u32, reason: String },

    #[error("Store failed after a consistency fault")]
    StoreFailed,

    // Lock errors
    #[error("Lock not granted on page {pgno}")]
    LockNotGranted { pgno: u32 },

    #[error("Deadlock detected waiting for page {pgno}")]
    Deadlock { pgno: u32 },

    #[error("Lock wait timed out on page {pgno}")]
    LockTimeout { pgno: u32 },

    // Page and buffer errors
    #[error("Page not found: {pgno}")]
    PageNotFound { pgno: u32 },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    // WAL errors
    #[error("WAL write failed: {0}")]
    WalWriteFailed(String),

    #[error("WAL corrupted at LSN {lsn}: {reason}")]
    WalCorrupted { lsn: u64, reason: String },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Returns true for lock errors the allocator treats as "try another page".
    pub fn is_lock_contention(&self) -> bool {
        matches!(
            self,
            KilnError::LockNotGranted { .. }
                | KilnError::Deadlock { .. }
                | KilnError::LockTimeout { .. }
        )
    }

    /// Returns true if this error indicates on-disk inconsistency.
    pub fn is_corruption(&self) -> bool {
        matches!(self, KilnError::Corruption { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: KilnError = io_err.into();
        assert!(matches!(err, KilnError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_record_errors_display() {
        assert_eq!(KilnError::NotFound.to_string(), "Record not found");
        assert_eq!(
            KilnError::BufferTooSmall {
                needed: 100,
                capacity: 10
            }
            .to_string(),
            "Buffer too small: need 100 bytes, have 10"
        );
        assert_eq!(
            KilnError::HeapFull.to_string(),
            "Heap full, no page can hold the request"
        );
    }

    #[test]
    fn test_corruption_display() {
        let err = KilnError::Corruption {
            pgno: 7,
            reason: "last fragment length mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Corruption on page 7: last fragment length mismatch"
        );
        assert!(err.is_corruption());
        assert!(!KilnError::NotFound.is_corruption());
    }

    #[test]
    fn test_lock_contention_classification() {
        assert!(KilnError::LockNotGranted { pgno: 3 }.is_lock_contention());
        assert!(KilnError::Deadlock { pgno: 3 }.is_lock_contention());
        assert!(KilnError::LockTimeout { pgno: 3 }.is_lock_contention());
        assert!(!KilnError::HeapFull.is_lock_contention());
        assert!(!KilnError::StoreFailed.is_lock_contention());
    }

    #[test]
    fn test_wal_errors_display() {
        let err = KilnError::WalWriteFailed("disk full".to_string());
        assert_eq!(err.to_string(), "WAL write failed: disk full");

        let err = KilnError::WalCorrupted {
            lsn: 12345,
            reason: "truncated record".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "WAL corrupted at LSN 12345: truncated record"
        );
    }

    #[test]
    fn test_page_size_mismatch_display() {
        let err = KilnError::PageSizeMismatch {
            expected: 4096,
            actual: 512,
        };
        assert_eq!(err.to_string(), "Page size mismatch: expected 4096, got 512");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KilnError>();
    }
}
