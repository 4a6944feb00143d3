//! AWS provider error types

use agentstack_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AwsError {
    #[error("aws CLI not found. Please install AWS CLI v2")]
    CliNotFound,

    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error("aws command failed: {0}")]
    CommandFailed(String),

    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    #[error("Request signing failed: {0}")]
    Signing(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),
}

pub type Result<T> = std::result::Result<T, AwsError>;

/// How an AWS error code feeds the idempotency and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    DependencyViolation,
    Throttled,
    Other,
}

const NOT_FOUND: &[&str] = &[
    "NoSuchEntity",
    "ResourceNotFoundException",
    "NoSuchBucket",
    "404",
    "LoadBalancerNotFound",
    "TargetGroupNotFound",
    "ListenerNotFound",
    "RuleNotFound",
    "NoSuchDistribution",
    "NoSuchCloudFrontOriginAccessIdentity",
    "NatGatewayNotFound",
];

const CONFLICT: &[&str] = &[
    "EntityAlreadyExists",
    "BucketAlreadyOwnedByYou",
    "BucketAlreadyExists",
    "ConflictException",
    "ResourceExistsException",
    "InvalidGroup.Duplicate",
    "DuplicateTargetGroupName",
    "DuplicateListener",
    "PriorityInUse",
    "DuplicateLoadBalancerName",
    "RouteAlreadyExists",
    "InvalidPermission.Duplicate",
    "DuplicateTarget",
];

const DEPENDENCY: &[&str] = &[
    "DependencyViolation",
    "ResourceInUse",
    "DeleteConflict",
    "DistributionNotDisabled",
    "BucketNotEmpty",
];

const THROTTLED: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

pub fn classify(code: &str) -> ErrorClass {
    if NOT_FOUND.contains(&code) || code.ends_with(".NotFound") {
        ErrorClass::NotFound
    } else if CONFLICT.contains(&code) {
        ErrorClass::Conflict
    } else if DEPENDENCY.contains(&code) {
        ErrorClass::DependencyViolation
    } else if THROTTLED.contains(&code) {
        ErrorClass::Throttled
    } else {
        ErrorClass::Other
    }
}

impl AwsError {
    /// AWS error code, if the CLI reported one
    pub fn code(&self) -> Option<&str> {
        match self {
            AwsError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code().is_some_and(|c| classify(c) == ErrorClass::NotFound)
    }
}

impl From<AwsError> for CloudError {
    fn from(err: AwsError) -> Self {
        match err {
            AwsError::Api { ref code, .. } => {
                let text = err.to_string();
                match classify(code) {
                    ErrorClass::NotFound => CloudError::NotFound(text),
                    ErrorClass::Conflict => CloudError::AlreadyExists(text),
                    ErrorClass::DependencyViolation => CloudError::DependencyViolation(text),
                    ErrorClass::Throttled => CloudError::Throttled(text),
                    ErrorClass::Other => CloudError::ApiError(text),
                }
            }
            AwsError::CliNotFound => CloudError::CommandFailed(err.to_string()),
            AwsError::CommandFailed(msg) | AwsError::Credentials(msg) => {
                CloudError::CommandFailed(msg)
            }
            AwsError::Cloud(inner) => inner,
            AwsError::JsonError(e) => CloudError::Json(e),
            AwsError::IoError(e) => CloudError::Io(e),
            other => CloudError::ApiError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_codes() {
        assert_eq!(classify("NoSuchEntity"), ErrorClass::NotFound);
        assert_eq!(classify("InvalidVpcID.NotFound"), ErrorClass::NotFound);
        assert_eq!(classify("InvalidGroup.NotFound"), ErrorClass::NotFound);
        assert_eq!(classify("EntityAlreadyExists"), ErrorClass::Conflict);
        assert_eq!(classify("RouteAlreadyExists"), ErrorClass::Conflict);
        assert_eq!(classify("DependencyViolation"), ErrorClass::DependencyViolation);
        assert_eq!(classify("DistributionNotDisabled"), ErrorClass::DependencyViolation);
        assert_eq!(classify("RequestLimitExceeded"), ErrorClass::Throttled);
        assert_eq!(classify("InvalidSubnet.Conflict"), ErrorClass::Other);
    }

    #[test]
    fn test_into_cloud_error() {
        let err: CloudError = AwsError::Api {
            code: "ResourceInUse".into(),
            message: "target group is in use".into(),
        }
        .into();
        assert!(err.is_dependency_violation());

        let err: CloudError = AwsError::Api {
            code: "InvalidSubnet.Range".into(),
            message: "bad cidr".into(),
        }
        .into();
        assert!(err.to_string().contains("InvalidSubnet.Range"));
    }
}
