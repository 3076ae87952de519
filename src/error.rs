//! Centralized error types for mailsummary.

use std::path::PathBuf;
use thiserror::Error;

use crate::summary::codec::DecodeError;

/// All errors produced by the mailsummary library.
#[derive(Error, Debug)]
pub enum SummaryError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified file does not exist.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// The summary file is truncated or otherwise corrupt.
    #[error("Corrupt summary '{path}': {source}")]
    Corrupt { path: PathBuf, source: DecodeError },

    /// The summary file was written with a format version we cannot read.
    #[error("Summary '{path}' has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    /// A freshly written summary did not read back with the header we wrote.
    #[error("Summary '{0}' failed verification after save")]
    VerifyFailed(PathBuf),

    /// A parsing error occurred at a specific byte offset.
    #[error("Parse error at offset {offset}: {reason}")]
    ParseError { offset: u64, reason: String },

    /// A MIME decoding error.
    #[error("MIME decoding error: {0}")]
    MimeError(String),

    /// No live record carries the given uid.
    #[error("No message with uid '{0}'")]
    UnknownUid(String),

    /// An invalid path was provided.
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Convenience alias for `Result<T, SummaryError>`.
pub type Result<T> = std::result::Result<T, SummaryError>;

impl SummaryError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a decode failure with the summary path it came from.
    ///
    /// Version failures get their own variant so callers can tell an old
    /// file from a damaged one.
    pub fn corrupt(path: impl Into<PathBuf>, source: DecodeError) -> Self {
        match source {
            DecodeError::UnsupportedVersion(version) => Self::UnsupportedVersion {
                path: path.into(),
                version,
            },
            source => Self::Corrupt {
                path: path.into(),
                source,
            },
        }
    }
}

/// Allow `?` on `std::io::Error` inside functions returning `SummaryError`
/// when no path context is available (rare, prefer `SummaryError::io`).
impl From<std::io::Error> for SummaryError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
