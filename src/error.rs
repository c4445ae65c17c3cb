//! Error taxonomy (§7). Typed so callers can match on `retryable()` instead
//! of grepping strings, unlike the teacher's original `Result<_, String>`.

use thiserror::Error;

/// Errors a driver's `open()` may raise (§4.1, §7).
#[derive(Debug, Error)]
pub enum DriverOpenError {
    #[error("unrecognized driver prefix: {0}")]
    InvalidDriver(String),
    #[error("invalid device path: {0}")]
    PathInvalid(String),
    #[error("failed to open hardware: {0}")]
    HardwareOpen(String),
    #[error("failed to set I/O timeout: {0}")]
    TimeoutSetting(String),
}

/// Errors a driver's `write()` may raise (§7).
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("transport timed out")]
    TransportTimeout,
    #[error("no tag present to write to")]
    TagNotFound,
    #[error("write verification mismatch")]
    DataCorrupted,
    #[error("a write is already in flight on this driver")]
    WriteInProgress,
    #[error("write was canceled")]
    Canceled,
    #[error(transparent)]
    Ndef(#[from] NdefError),
    #[error("driver I/O error: {0}")]
    Io(String),
}

impl WriteError {
    /// §7's retryable/non-retryable classification.
    pub fn retryable(&self) -> bool {
        matches!(self, WriteError::TransportTimeout | WriteError::TagNotFound)
    }
}

/// NDEF codec errors (§4.2, §7).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum NdefError {
    #[error("payload of {0} bytes exceeds the Type-2 envelope ceiling")]
    TooLarge(usize),
    #[error("failed to parse NDEF payload: {0}")]
    Parse(&'static str),
}

/// Errors surfaced out of the capability algebra (§4.4).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SelectWriterError {
    #[error("no reader with that id")]
    NotFound,
    #[error("reader is not connected")]
    NotConnected,
    #[error("reader has no write capability")]
    NoWriteCapability,
    #[error("no write-capable reader available")]
    NoWriters,
}

/// libnfc's retryable-error taxonomy (§4.6, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LibnfcError {
    #[error("transport timeout")]
    TransportTimeout,
    #[error("tag not found")]
    TagNotFound,
    #[error("write verification mismatch")]
    DataCorrupted,
    #[error("fatal I/O error: {0}")]
    Io(String),
}

impl LibnfcError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LibnfcError::TransportTimeout | LibnfcError::TagNotFound
        )
    }
}

/// Top-level error a caller of the reader subsystem might see from a
/// non-driver-specific operation (reader-id, capability selection, codec).
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Open(#[from] DriverOpenError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Ndef(#[from] NdefError),
    #[error(transparent)]
    Select(#[from] SelectWriterError),
}
