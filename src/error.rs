use std::time::Duration;
use thiserror::Error;

/// Failures raised while leasing browser resources or rendering a job.
///
/// Everything a pipeline run can fail with ends up as one of these and is
/// turned into the job's error string by [`RenderError::to_string`].
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Browser pool exhausted: no context became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Browser instance unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Job lock expired without acknowledgement: {0}")]
    QueueStalled(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown error")]
    Unknown,
}

impl RenderError {
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        RenderError::Timeout { operation, after }
    }

    /// Whether another attempt of the same job could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::PoolExhausted(_)
                | RenderError::BrowserUnavailable(_)
                | RenderError::Navigation(_)
                | RenderError::Capture(_)
                | RenderError::Timeout { .. }
                | RenderError::QueueStalled(_)
                | RenderError::Upload(_)
                | RenderError::Unknown
        )
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::PoolExhausted(_) => "pool_exhausted",
            RenderError::BrowserUnavailable(_) => "browser_unavailable",
            RenderError::Navigation(_) => "navigation",
            RenderError::Capture(_) => "capture",
            RenderError::Timeout { .. } => "timeout",
            RenderError::QueueStalled(_) => "queue_stalled",
            RenderError::Upload(_) => "upload",
            RenderError::InvalidRequest(_) => "invalid_request",
            RenderError::Cancelled => "cancelled",
            RenderError::Storage(_) => "storage",
            RenderError::Unknown => "unknown",
        }
    }

}

/// Errors returned by the job queue's own operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job {0} already exists")]
    DuplicateJob(String),

    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {0} is no longer owned by this lease")]
    LockMismatch(String),

    #[error("Queue persistence failed: {0}")]
    Persistence(String),
}

/// Errors from the artifact storage collaborator.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Storage IO error: {0}")]
    Io(String),

    #[error("Storage misconfigured: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Anything the dispatcher façade can fail with.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<chromiumoxide::error::CdpError> for RenderError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        RenderError::BrowserUnavailable(err.to_string())
    }
}

/// A misconfigured store fails every attempt the same way; anything else is
/// treated as a transient upload failure.
impl From<StorageError> for RenderError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Configuration(_) => RenderError::Storage(err.to_string()),
            _ => RenderError::Upload(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            _ => StorageError::Io(err.to_string()),
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RenderError::PoolExhausted(Duration::from_secs(1)).is_retryable());
        assert!(RenderError::timeout("navigation", Duration::from_secs(1)).is_retryable());
        assert!(RenderError::Upload("bucket gone".to_string()).is_retryable());
        assert!(!RenderError::InvalidRequest("bad url".to_string()).is_retryable());
        assert!(!RenderError::Cancelled.is_retryable());
    }

    #[test]
    fn test_timeout_message_mentions_timeout() {
        let err = RenderError::timeout("navigation", Duration::from_secs(30));
        assert_eq!(err.to_string(), "navigation timed out after 30s");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_storage_error_becomes_upload_error() {
        let err: RenderError = StorageError::Io("disk full".to_string()).into();
        assert!(matches!(err, RenderError::Upload(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_misconfigured_storage_is_not_retried() {
        let err: RenderError = StorageError::Configuration("no bucket".to_string()).into();
        assert!(matches!(err, RenderError::Storage(_)));
        assert_eq!(err.kind(), "storage");
        assert!(!err.is_retryable());
    }
}
