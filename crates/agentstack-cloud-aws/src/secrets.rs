//! Secrets Manager

use crate::cli::{AwsCli, items, text};
use crate::error::{AwsError, Result};
use agentstack_cloud::{ResourceDescriptor, ResourceKind, ResourceStatus};
use serde_json::Value;

fn descriptor(secret: &Value) -> Option<ResourceDescriptor> {
    let name = text(secret, "/Name")?;
    let arn = text(secret, "/ARN")?;
    Some(
        ResourceDescriptor::new(ResourceKind::Secret, name)
            .with_id(arn.clone())
            .with_arn(arn)
            .with_status(ResourceStatus::Available),
    )
}

/// A secret scheduled for deletion still blocks its name, so it is restored
pub async fn find(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let Some(secret) = cli
        .run_optional("secretsmanager", &["describe-secret", "--secret-id", name])
        .await?
    else {
        return Ok(None);
    };

    if secret.get("DeletedDate").is_some_and(|d| !d.is_null()) {
        tracing::warn!("Secret {} is scheduled for deletion, restoring it", name);
        cli.run("secretsmanager", &["restore-secret", "--secret-id", name])
            .await?;
    }
    Ok(descriptor(&secret))
}

pub async fn create(
    cli: &AwsCli,
    name: &str,
    description: &str,
    payload: &str,
) -> Result<ResourceDescriptor> {
    let output = cli
        .run(
            "secretsmanager",
            &[
                "create-secret",
                "--name",
                name,
                "--description",
                description,
                "--secret-string",
                payload,
            ],
        )
        .await?;
    descriptor(&output)
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-secret: {}", output)))
}

pub async fn discover(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let output = cli.run("secretsmanager", &["list-secrets"]).await?;
    Ok(items(&output, "/SecretList")
        .iter()
        .filter_map(descriptor)
        .filter(|d| d.name.contains(pattern))
        .collect())
}

pub async fn delete(cli: &AwsCli, secret_id: &str) -> Result<()> {
    cli.run(
        "secretsmanager",
        &[
            "delete-secret",
            "--secret-id",
            secret_id,
            "--force-delete-without-recovery",
        ],
    )
    .await?;
    Ok(())
}
