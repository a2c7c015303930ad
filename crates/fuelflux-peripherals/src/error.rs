//! Peripheral error types.

use thiserror::Error;

/// Errors from peripheral drivers.
#[derive(Error, Debug)]
pub enum PeripheralError {
    /// Driver initialization failed
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// The device is not connected
    #[error("Peripheral not connected")]
    NotConnected,

    /// Hardware-level failure during operation
    #[error("Hardware error: {0}")]
    Hardware(String),
}

/// Result type alias using PeripheralError.
pub type PeripheralResult<T> = Result<T, PeripheralError>;
