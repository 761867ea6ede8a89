//! Table-level error type.
//!
//! Every subsystem (format, index, store, …) defines its own narrow error
//! enum; [`TableError`] is the domain-level status surfaced by the public
//! reader API. The mapping rules are:
//!
//! - **InvalidArgument** — malformed internal key (shorter than 8 bytes),
//!   opening without mmap reads, structurally-unparseable index data, or a
//!   configuration the reader cannot honor.
//! - **Corruption** — checksum failure on any block or record, a missing
//!   mandatory meta block, a malformed offset block, or a failed license
//!   merge/validity check.
//! - **Aborted** — an unknown value-type tag at decode time. This indicates
//!   a writer bug, not bad user input.
//!
//! "Key not found", "common prefix mismatch", "no visible version" and
//! "partition not covered" are *not* errors: those paths return `Ok(())`
//! without invoking the caller's visitor.

use thiserror::Error;

use crate::format::FormatError;
use crate::index::IndexError;
use crate::license::LicenseError;
use crate::store::StoreError;
use crate::value::ValueError;

/// Domain-level status for all reader operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// The caller handed the reader something it cannot interpret.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// On-disk data failed an integrity check.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Decoding hit a state that only a buggy writer can produce.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FormatError> for TableError {
    fn from(e: FormatError) -> Self {
        TableError::Corruption(e.to_string())
    }
}

impl From<StoreError> for TableError {
    fn from(e: StoreError) -> Self {
        TableError::Corruption(e.to_string())
    }
}

impl From<IndexError> for TableError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::ChecksumMismatch => TableError::Corruption(e.to_string()),
            other => TableError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<ValueError> for TableError {
    fn from(e: ValueError) -> Self {
        match e {
            ValueError::BadEntryType(_) => TableError::Aborted(e.to_string()),
            other => TableError::Corruption(other.to_string()),
        }
    }
}

impl From<LicenseError> for TableError {
    fn from(e: LicenseError) -> Self {
        TableError::Corruption(format!("license: {e}"))
    }
}
