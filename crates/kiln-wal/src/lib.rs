//! Write-ahead log for the kiln heap store.
//!
//! Every page mutation is logged before it is applied. The log is a
//! sequence of segment files replayed during crash recovery.

pub mod payload;
pub mod reader;
pub mod record;
pub mod segment;
pub mod writer;

pub use payload::{AddRemOp, HeapLogRecord};
pub use reader::WalReader;
pub use record::{LogRecord, LogRecordType, Lsn};
pub use segment::{LogSegment, SegmentHeader, SegmentId};
pub use writer::{WalWriter, WalWriterConfig};
