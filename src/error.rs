use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Cannot determine bounds of {0}")]
    BoundsUnavailable(String),

    #[error("Navigation timeout after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Fonts and images not settled after {0:?}")]
    ReadinessTimeout(Duration),

    #[error("Capture timeout after {0:?}")]
    CaptureTimeout(Duration),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Request queue timeout after {0:?}, server busy")]
    QueueTimeout(Duration),

    #[error("No browser available after {0:?}")]
    PoolExhausted(Duration),

    #[error("Browser launch failed: {0}")]
    PoolCreationFailed(String),

    #[error("Browser pool is shutting down")]
    PoolShuttingDown,

    #[error("Page error: {0}")]
    Page(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Render failed after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: usize,
        last: Box<RenderError>,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RenderError {
    /// Whether a fresh attempt can be expected to succeed.
    ///
    /// Every failure of a single attempt is retried, `QueueTimeout` included.
    /// Only malformed input, bad configuration and a closing pool are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RenderError::InvalidRequest(_)
                | RenderError::Configuration(_)
                | RenderError::PoolShuttingDown
                | RenderError::AttemptsExhausted { .. }
        )
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::TargetNotFound(_) => "target_not_found",
            RenderError::BoundsUnavailable(_) => "bounds_unavailable",
            RenderError::NavigationTimeout(_) => "navigation_timeout",
            RenderError::NavigationFailed(_) => "navigation_failed",
            RenderError::ReadinessTimeout(_) => "readiness_timeout",
            RenderError::CaptureTimeout(_) => "capture_timeout",
            RenderError::CaptureFailed(_) => "capture_failed",
            RenderError::QueueTimeout(_) => "queue_timeout",
            RenderError::PoolExhausted(_) => "pool_exhausted",
            RenderError::PoolCreationFailed(_) => "pool_creation_failed",
            RenderError::PoolShuttingDown => "pool_shutting_down",
            RenderError::Page(_) => "page",
            RenderError::InvalidRequest(_) => "invalid_request",
            RenderError::Configuration(_) => "configuration",
            RenderError::AttemptsExhausted { .. } => "attempts_exhausted",
            RenderError::Io(_) => "io",
            RenderError::Serialization(_) => "serialization",
        }
    }
}

impl From<AcquireError> for RenderError {
    fn from(_: AcquireError) -> Self {
        RenderError::PoolShuttingDown
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Serialization(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for RenderError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        RenderError::Page(err.to_string())
    }
}
