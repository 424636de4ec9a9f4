use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("No media section with mid={0} found")]
    CodecSectionNotFound(String),

    #[error("No opus format-parameter line in media section mid={0}")]
    ParameterLineNotFound(String),

    #[error("Malformed session description: {0}")]
    MalformedDescription(String),

    #[error("Glare: ignoring colliding offer from {0}")]
    GlareConflict(String),

    #[error("Rollback failed for {participant}: {reason}")]
    RollbackFailed { participant: String, reason: String },

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Statistics unavailable: {0}")]
    StatsUnavailable(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Errors that are recovered inside a session and never reach the UI.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::CodecSectionNotFound(_)
                | AppError::ParameterLineNotFound(_)
                | AppError::GlareConflict(_)
                | AppError::RollbackFailed { .. }
                | AppError::TransportClosed(_)
                | AppError::StatsUnavailable(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(AppError::CodecSectionNotFound("0".into()).is_recoverable());
        assert!(AppError::StatsUnavailable("closed".into()).is_recoverable());
        assert!(!AppError::WebRtcError("boom".into()).is_recoverable());
        assert!(!AppError::Config("bad".into()).is_recoverable());
    }
}
