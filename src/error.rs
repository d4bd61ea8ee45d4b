//! Error types for mass-storage gadget operations

use thiserror::Error;

/// Mass-storage gadget errors
///
/// SCSI-level faults (bad LBA range, write protect, unsupported opcode) are not
/// errors in this sense: they are reported to the host through sense data.
#[derive(Debug, Error)]
pub enum UmsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Controller error: {0}")]
    Controller(String),

    #[error("Resource allocation failed: {0}")]
    Resource(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid wrapper: {0}")]
    InvalidWrapper(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type for gadget operations
pub type UmsResult<T> = Result<T, UmsError>;
