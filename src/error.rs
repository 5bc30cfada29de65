use thiserror::Error;

/// Errors surfaced synchronously to callers of the session registry.
///
/// Failures that happen inside a running session (source loss, detector
/// faults, disk writes) never show up here; they are reflected in the
/// session status or only logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Malformed source URI or missing request field.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown session id.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Registry-side failure (output directories, thread spawn).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    pub fn status_code(&self) -> u16 {
        match self {
            SessionError::Validation(_) => 400,
            SessionError::NotFound(_) => 404,
            SessionError::Internal(_) => 500,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
