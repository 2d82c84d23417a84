//! Error types for basalt-metalog.

use thiserror::Error;

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the metadata log.
#[derive(Debug, Error)]
pub enum Error {
    /// Journal I/O failure: write, read, fsync, or rename.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record or file frame could not be decoded.
    #[error("malformed journal data: {0}")]
    Format(String),

    /// A decoded record lacks a field its type requires.
    #[error("{record_type} record is missing required field {field}")]
    MissingField {
        /// Name of the record type that was decoded.
        record_type: &'static str,
        /// Name of the absent field.
        field: &'static str,
    },

    /// The journal is semantically inconsistent: a record references a
    /// parent that does not exist, or redefines a live id.
    #[error("corrupted metadata log: {0}")]
    Corrupt(String),

    /// More than [`TX_BUF_CAPACITY`](crate::writer::TX_BUF_CAPACITY)
    /// records were written in a single transaction.
    #[error("metadata transaction buffer overflow (64 records max)")]
    TxFull,

    /// The operation requires an open journal.
    #[error("metadata log is not open")]
    Closed,
}

impl Error {
    /// True for errors that indicate an unusable journal rather than a
    /// transient write failure. Embedders must refuse to proceed on these.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Format(_) | Self::MissingField { .. } | Self::Corrupt(_))
    }
}
