//! Error types for Focus Flux

use crate::types::SessionId;
use thiserror::Error;

/// Errors that can occur while ingesting, calibrating or broadcasting
#[derive(Debug, Error)]
pub enum FocusError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("No active calibration for session {0}")]
    NoActiveCalibration(SessionId),

    #[error("Calibration already running for session {0}")]
    AlreadyCalibrating(SessionId),

    #[error("No calibration samples recorded for session {0}")]
    EmptyCalibrationData(SessionId),

    #[error("Delivery to subscriber {0} failed")]
    SubscriberDeliveryFailed(String),

    #[error("Source failed: {0}")]
    SourceFailed(String),

    #[error("Unknown session: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {session_id} is {state}, cannot {action}")]
    InvalidSessionState {
        session_id: SessionId,
        state: String,
        action: &'static str,
    },

    #[error("Session {0} has no active source")]
    NoActiveSource(SessionId),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl FocusError {
    /// Whether the caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FocusError::SourceUnavailable(_) | FocusError::SourceFailed(_) | FocusError::Io(_)
        )
    }
}
