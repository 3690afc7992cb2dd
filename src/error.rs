//! Error types for the interview session controller.

/// Top-level error type for the session media controller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Capture device acquisition or stream error. Terminal for starting an
    /// interview: recording controls must never be enabled after this.
    #[error("device error: {0}")]
    Device(String),

    /// Avatar renderer connection or protocol error. Non-fatal: the local
    /// fallback playback path compensates.
    #[error("avatar error: {0}")]
    Avatar(String),

    /// Question audio decode error. Non-fatal: the speaking indicator is
    /// cleared and the question text remains usable.
    #[error("decode error: {0}")]
    Decode(String),

    /// Network failure on upload or submit. Recoverable: the recording
    /// machine returns to `Recorded` and the user may retry.
    #[error("network error: {0}")]
    Network(String),

    /// Invalid operation rejected before any network call (e.g. sending with
    /// no recorded buffer and no uploaded file).
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
