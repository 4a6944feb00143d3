//! Cloud provider error types

use thiserror::Error;

/// Cloud provider errors
///
/// The first four variants carry the provider's idempotency and retry
/// signals. Orchestrators branch on them through the `is_*` helpers instead
/// of matching on provider error codes.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Dependency violation: {0}")]
    DependencyViolation(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// "Resource not found": already-deleted during teardown, absent during probes
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    /// "Already exists" conflict on create
    pub fn is_conflict(&self) -> bool {
        matches!(self, CloudError::AlreadyExists(_))
    }

    /// Another resource still references the target
    pub fn is_dependency_violation(&self) -> bool {
        matches!(self, CloudError::DependencyViolation(_))
    }

    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::Throttled(_) | CloudError::DependencyViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(CloudError::NotFound("vpc-1".into()).is_not_found());
        assert!(CloudError::AlreadyExists("bucket".into()).is_conflict());
        assert!(CloudError::DependencyViolation("sg-1".into()).is_transient());
        assert!(CloudError::Throttled("iam".into()).is_transient());
        assert!(!CloudError::ApiError("boom".into()).is_transient());
        assert!(!CloudError::Precondition("subnets".into()).is_conflict());
    }
}
