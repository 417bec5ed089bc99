//! Error types for the discovery client.

/// Failure codes reported by the coordination store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreErrorCode {
    ConnectionLoss,
    SessionExpired,
    NoNode,
    NodeExists,
    OperationTimeout,
    Other(String),
}

/// Error raised by a coordination store session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Coordination store error {code:?} on {path}")]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub path: String,
}

impl StoreError {
    pub fn new(code: StoreErrorCode, path: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
        }
    }

    pub fn connection_loss(path: impl Into<String>) -> Self {
        Self::new(StoreErrorCode::ConnectionLoss, path)
    }

    pub fn session_expired(path: impl Into<String>) -> Self {
        Self::new(StoreErrorCode::SessionExpired, path)
    }

    pub fn no_node(path: impl Into<String>) -> Self {
        Self::new(StoreErrorCode::NoNode, path)
    }

    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self.code,
            StoreErrorCode::ConnectionLoss | StoreErrorCode::OperationTimeout
        )
    }

    pub fn is_session_expired(&self) -> bool {
        self.code == StoreErrorCode::SessionExpired
    }

    pub fn is_no_node(&self) -> bool {
        self.code == StoreErrorCode::NoNode
    }

    pub fn is_node_exists(&self) -> bool {
        self.code == StoreErrorCode::NodeExists
    }
}

/// Errors surfaced to callers of the discovery client
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Service not available: {0}")]
    ServiceNotAvailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Hash ring is empty")]
    EmptyRing,

    #[error("Discovery client is read-only")]
    ReadOnly,
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Job completion errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("Job could not be completed")]
    Failed,

    #[error("Timed out waiting for job completion")]
    Timeout,

    #[error("Job processor stopped before the job completed")]
    ProcessorGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::connection_loss("/a").is_connection_loss());
        assert!(StoreError::new(StoreErrorCode::OperationTimeout, "/a").is_connection_loss());
        assert!(StoreError::session_expired("/a").is_session_expired());
        assert!(StoreError::no_node("/a").is_no_node());
        assert!(!StoreError::new(StoreErrorCode::Other("BadVersion".into()), "/a").is_connection_loss());
    }

    #[test]
    fn test_display() {
        let error = DiscoveryError::ServiceNotAvailable("No user/http service found".to_string());
        assert_eq!(error.to_string(), "Service not available: No user/http service found");
        assert_eq!(JobError::Failed.to_string(), "Job could not be completed");
    }
}
