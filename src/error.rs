//! WAL error types.
//!
//! Mirrors the error table in the design notes: most failure kinds collapse
//! into `Corrupted`, since the restore path treats a bad signature, a bad
//! `sver`, an out-of-range length, and a checksum mismatch identically (all
//! trigger [`crate::record::skip_corrupted`]).

use crate::segment::FileId;
use thiserror::Error;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record corrupted at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("failed to allocate migration staging buffer of {size} bytes")]
    OutOfMemory { size: usize },

    #[error("segment not found: {0}")]
    SegmentNotFound(FileId),

    #[error("invalid WAL state: {0}")]
    InvalidState(String),
}

impl WalError {
    /// Returns whether this error is retryable (as opposed to a permanent
    /// data integrity or configuration problem).
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io(_))
    }

    pub(crate) fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        WalError::Corrupted {
            offset,
            reason: reason.into(),
        }
    }
}
