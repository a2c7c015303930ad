//! Backend error taxonomy.

use fuelflux_core::{STD_BACKEND_ERROR, STD_CONTROLLER_ERROR};
use thiserror::Error;

/// `CodeError` value marking a synthetic transport failure.
pub const NETWORK_ERROR_CODE: i64 = -1;

/// Operator-facing text for transport failures.
pub const COMMUNICATION_ERROR_TEXT: &str = "Ошибка связи с сервером";

/// Errors from portal operations.
///
/// The device shows untrained operators at most a short generic line;
/// [`BackendError::display_text`] picks it. Full diagnostics go to logs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Transport-layer failure (connect, read, write, TLS, DNS, timeout)
    /// or an unparseable / non-2xx response.
    #[error("communication error: {0}")]
    Network(String),

    /// The portal answered with `CodeError != 0`.
    #[error("portal error {code}: {text}")]
    Application { code: i64, text: String },

    /// The portal answered 2xx but the body violated the contract.
    #[error("invalid portal response: {0}")]
    InvalidResponse(String),

    /// A local precondition failed (wrong role, unknown tank, bad volume,
    /// wrong session state). Nothing was sent.
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl BackendError {
    /// Whether retrying later may succeed.
    ///
    /// The synthetic `CodeError = -1` object counts as a network error.
    pub fn is_network(&self) -> bool {
        match self {
            BackendError::Network(_) => true,
            BackendError::Application { code, .. } => *code == NETWORK_ERROR_CODE,
            _ => false,
        }
    }

    /// Short operator-facing text for the display.
    pub fn display_text(&self) -> String {
        match self {
            BackendError::Network(_) => COMMUNICATION_ERROR_TEXT.to_string(),
            BackendError::Application { text, .. } => text.clone(),
            BackendError::InvalidResponse(_) => STD_BACKEND_ERROR.to_string(),
            BackendError::Precondition(_) => STD_CONTROLLER_ERROR.to_string(),
        }
    }
}

/// Result type alias using BackendError.
pub type BackendResult<T> = Result<T, BackendError>;
