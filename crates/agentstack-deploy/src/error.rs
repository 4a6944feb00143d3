use agentstack_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("[{stage}/{total}] {title} failed: {source}", total = crate::naming::TOTAL_STAGES)]
    Stage {
        stage: u8,
        title: &'static str,
        #[source]
        source: Box<DeployError>,
    },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Not authenticated with the cloud provider: {0}")]
    NotAuthenticated(String),

    #[error("Setup script template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Secret input failed: {0}")]
    Prompt(String),

    #[error("HTTP probe failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No running EC2 instance found with name: {0}")]
    InstanceNotFound(String),

    #[error("Remote setup {status}: {stderr}")]
    RemoteSetup { status: String, stderr: String },

    #[error("Missing attribute {attribute} on {resource}")]
    MissingAttribute {
        resource: String,
        attribute: &'static str,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeployError {
    pub fn missing(resource: impl Into<String>, attribute: &'static str) -> Self {
        DeployError::MissingAttribute {
            resource: resource.into(),
            attribute,
        }
    }

    /// The provider error underneath any stage wrapping
    pub fn cloud(&self) -> Option<&CloudError> {
        match self {
            DeployError::Cloud(err) => Some(err),
            DeployError::Stage { source, .. } => source.cloud(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wrapping_keeps_cloud_error() {
        let err = DeployError::Stage {
            stage: 6,
            title: "VPC",
            source: Box::new(CloudError::Precondition("one public subnet".into()).into()),
        };
        assert!(err.to_string().starts_with("[6/11] VPC failed"));
        assert!(matches!(err.cloud(), Some(CloudError::Precondition(_))));
    }
}
