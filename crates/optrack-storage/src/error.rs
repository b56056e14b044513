use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the per-source storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bytes at `offset` do not decode to a record.
    #[error("corrupt record at byte offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    /// An index pointer lies past the end of the log.
    #[error("offset {offset} is out of range for a log of {log_len} bytes")]
    OffsetOutOfRange { offset: u64, log_len: u64 },

    #[error("{context}: {source}")]
    StorageIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("source {source_code:?} is locked by another process ({})", path.display())]
    Locked { source_code: String, path: PathBuf },

    #[error("invalid source code {0:?}")]
    InvalidSourceCode(String),

    #[error("store for source {0:?} was opened read-only")]
    ReadOnly(String),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::StorageIo {
            context: context.into(),
            source,
        }
    }

    /// True for the conditions a caller can isolate to a single record.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptRecord { .. } | StoreError::OffsetOutOfRange { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Attach a path-bearing context to raw I/O failures.
pub(crate) trait IoContext<T> {
    fn io_context<F: FnOnce() -> String>(self, context: F) -> StoreResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F: FnOnce() -> String>(self, context: F) -> StoreResult<T> {
        self.map_err(|err| StoreError::io(context(), err))
    }
}
