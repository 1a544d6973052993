//! Custom error types for the scan orchestrator.
//!
//! This module defines the primary error type, `ScanError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of a scan, from subprocess
//! spawn problems to storage write failures.
//!
//! ## Error Taxonomy
//!
//! - **`TransportUnavailable`**: the hardware subprocess could not be started
//!   (missing executable, no ready banner within the spawn timeout). Fatal,
//!   surfaced immediately, no scan is attempted.
//! - **`TransportClosed`** / **`TransportLost`**: the subprocess exited. Fatal
//!   to the active scan only; the orchestrator returns to `Idle` and remains
//!   usable for the next scan.
//! - **`Protocol`**: a line from the subprocess matched none of the known
//!   prefixes. Non-fatal outside a scan (logged), fatal to an active scan.
//! - **`HardwareRejected`**: the subprocess explicitly reported it cannot
//!   perform the requested operation; the hardware's message is surfaced
//!   verbatim.
//! - **`ScanTimeout`**: no progress or completion message arrived within the
//!   configured inactivity window.
//! - **`ScanAlreadyActive`**: a start was requested while a scan is running.
//!   Rejected synchronously, never queued.
//! - **`Persist`**: the storage write failed after a successful capture. The
//!   captured frames are not discarded; callers may retry persistence
//!   without re-capturing.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hardware process unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Hardware process input closed: {0}")]
    TransportClosed(String),

    #[error("Hardware process exited during scan (exit code {code:?})")]
    TransportLost { code: Option<i32> },

    #[error("Unparseable line from hardware process: {0:?}")]
    Protocol(String),

    #[error("Hardware rejected the operation: {0}")]
    HardwareRejected(String),

    #[error("No activity from hardware process within {0:?}")]
    ScanTimeout(std::time::Duration),

    #[error("A scan is already active")]
    ScanAlreadyActive,

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("Orchestrator is not running")]
    OrchestratorStopped,
}

/// Errors produced by the scan persistence writer.
///
/// Kept separate from [`ScanError`] so callers can distinguish a failed
/// capture from a capture that succeeded but could not be saved.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to write scan record to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write frame index: {0}")]
    FrameIndex(#[from] csv::Error),

    #[error("Failed to encode scan metadata: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Scan directory {0} already holds a record for a different session")]
    Conflict(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::HardwareRejected("camera not found".to_string());
        assert_eq!(
            err.to_string(),
            "Hardware rejected the operation: camera not found"
        );
    }

    #[test]
    fn test_transport_lost_carries_exit_code() {
        let err = ScanError::TransportLost { code: Some(1) };
        assert!(err.to_string().contains("exit code Some(1)"));
    }

    #[test]
    fn test_persist_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ScanError = PersistError::Write {
            path: PathBuf::from("/scans/x"),
            source: io,
        }
        .into();
        assert!(matches!(err, ScanError::Persist(_)));
    }
}
