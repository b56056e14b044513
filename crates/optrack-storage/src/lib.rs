//! Crash-tolerant per-source storage for OpTrack: an append-only JSONL log, a derived
//! position index and the seen-id set.

pub mod codec;
pub mod compactor;
pub mod error;
mod fsutil;
pub mod index;
pub mod legacy;
pub mod lock;
pub mod log;
pub mod seen;
pub mod store;

pub use compactor::CompactionReport;
pub use error::{StoreError, StoreResult};
pub use fsutil::{file_size, write_atomic};
pub use index::{IndexStatus, PositionIndex, RebuildStats};
pub use log::{AppendLog, LogIter, LogPosition};
pub use seen::SeenIdSet;
pub use store::{validate_source_code, OpenMode, SourceStore, StorePaths};

pub const CRATE_NAME: &str = "optrack-storage";
