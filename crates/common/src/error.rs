//! Error taxonomy shared by the pool, the task coordinator and the capture service.

use std::time::Duration;

use crate::cancellation::CancellationError;

/// The result type used throughout chart-snap.
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of the capture workflow an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStage {
    Session,
    Navigate,
    Auth,
    Prepare,
    Screenshot,
}

impl std::fmt::Display for CaptureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Session => "session",
            Self::Navigate => "navigate",
            Self::Auth => "auth",
            Self::Prepare => "prepare",
            Self::Screenshot => "screenshot",
        };
        f.write_str(name)
    }
}

/// Errors produced by chart-snap operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The browser pool has been closed and hands out no more sessions.
    #[error("browser pool is closed")]
    PoolClosed,

    /// No handle had a free session slot before the acquire deadline.
    #[error("no browser session available after {waited:?}")]
    PoolExhaustedTimeout {
        /// How long the caller polled before giving up.
        waited: Duration,
    },

    /// A renderer handle could not be launched or bootstrapped.
    #[error("failed to create browser handle {index}: {message}")]
    HandleCreationFailed {
        /// Position of the handle in the pool.
        index: usize,
        /// Description of the failure.
        message: String,
    },

    /// A live execution already owns this key.
    #[error("task {key} is already running")]
    TaskAlreadyRunning { key: String },

    /// The key already completed within its retention window.
    #[error("task {key} is already completed")]
    TaskAlreadyCompleted { key: String },

    /// The key is not tracked by the coordinator.
    #[error("task {key} not found")]
    TaskNotFound { key: String },

    /// Waiting on another execution exceeded the join timeout.
    #[error("wait for task {key} timed out after {timeout:?}")]
    WaitTimeout { key: String, timeout: Duration },

    /// A critical capture step failed.
    #[error("capture failed at {stage} for {key}: {message}")]
    CaptureFailed {
        key: String,
        stage: CaptureStage,
        message: String,
    },

    /// The artifact could not be written to object storage.
    #[error("upload of {key} failed: {message}")]
    UploadFailed { key: String, message: String },

    /// The CDN existence probe failed. The oracle maps this to "absent".
    #[error("existence check for {url} failed: {message}")]
    ExistenceCheckFailed { url: String, message: String },

    /// The chart data service could not provide panel data.
    #[error("panel data for {symbol} unavailable: {message}")]
    PanelDataFailed { symbol: String, message: String },

    /// A finished execution left no artifact behind.
    #[error("expected artifact {key} is missing: {reason}")]
    ArtifactMissing { key: String, reason: String },

    /// The request cannot be turned into a chart artifact.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The operation was cancelled by its caller or by shutdown.
    #[error("operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CancellationError> for Error {
    fn from(_: CancellationError) -> Self {
        Error::Cancelled
    }
}

impl Error {
    /// Convenience constructor for capture failures.
    pub fn capture(key: impl Into<String>, stage: CaptureStage, err: impl std::fmt::Display) -> Self {
        Error::CaptureFailed {
            key: key.into(),
            stage,
            message: err.to_string(),
        }
    }

    /// Short machine-readable code, used as a metrics label and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::PoolClosed => "pool_closed",
            Error::PoolExhaustedTimeout { .. } => "pool_exhausted",
            Error::HandleCreationFailed { .. } => "handle_creation_failed",
            Error::TaskAlreadyRunning { .. } => "task_already_running",
            Error::TaskAlreadyCompleted { .. } => "task_already_completed",
            Error::TaskNotFound { .. } => "task_not_found",
            Error::WaitTimeout { .. } => "wait_timeout",
            Error::CaptureFailed { .. } => "capture_failed",
            Error::UploadFailed { .. } => "upload_failed",
            Error::ExistenceCheckFailed { .. } => "existence_check_failed",
            Error::PanelDataFailed { .. } => "panel_data_failed",
            Error::ArtifactMissing { .. } => "artifact_missing",
            Error::InvalidRequest { .. } => "invalid_request",
            Error::Config { .. } => "config",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_error_mentions_stage_and_key() {
        let err = Error::capture("NVDA_us_1d_20250101", CaptureStage::Navigate, "net::ERR_ABORTED");
        let msg = err.to_string();
        assert!(msg.contains("navigate"));
        assert!(msg.contains("NVDA_us_1d_20250101"));
        assert!(msg.contains("net::ERR_ABORTED"));
        assert_eq!(err.code(), "capture_failed");
    }

    #[test]
    fn test_cancellation_converts_to_cancelled() {
        let err: Error = CancellationError.into();
        assert!(matches!(err, Error::Cancelled));
    }
}
