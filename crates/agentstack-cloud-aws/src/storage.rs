//! S3 buckets

use crate::cli::{AwsCli, items, text};
use crate::error::Result;
use agentstack_cloud::{ResourceDescriptor, ResourceKind, ResourceStatus, attr};
use serde_json::{Value, json};

/// delete-objects accepts at most this many keys per call
const DELETE_BATCH: usize = 1000;

pub fn bucket_arn(name: &str) -> String {
    format!("arn:aws:s3:::{}", name)
}

pub fn bucket_domain(name: &str, region: &str) -> String {
    format!("{}.s3.{}.amazonaws.com", name, region)
}

fn descriptor(name: &str, region: &str) -> ResourceDescriptor {
    ResourceDescriptor::new(ResourceKind::Bucket, name)
        .with_id(name)
        .with_arn(bucket_arn(name))
        .with_status(ResourceStatus::Available)
        .with_attribute(attr::DOMAIN_NAME, json!(bucket_domain(name, region)))
}

pub async fn find(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let found = cli
        .run_optional("s3api", &["head-bucket", "--bucket", name])
        .await?;
    Ok(found.map(|_| descriptor(name, cli.region())))
}

pub async fn create(cli: &AwsCli, name: &str) -> Result<ResourceDescriptor> {
    if cli.region() == "us-east-1" {
        cli.run("s3api", &["create-bucket", "--bucket", name]).await?;
    } else {
        let location = format!("LocationConstraint={}", cli.region());
        cli.run(
            "s3api",
            &[
                "create-bucket",
                "--bucket",
                name,
                "--create-bucket-configuration",
                &location,
            ],
        )
        .await?;
    }
    tracing::debug!("Bucket created: {}", name);
    Ok(descriptor(name, cli.region()))
}

/// Public access block, CORS, suspended versioning and the `docs/` prefix
pub async fn apply_defaults(cli: &AwsCli, bucket: &str) -> Result<()> {
    let block = json!({
        "BlockPublicAcls": true,
        "IgnorePublicAcls": true,
        "BlockPublicPolicy": true,
        "RestrictPublicBuckets": true
    })
    .to_string();
    cli.run(
        "s3api",
        &[
            "put-public-access-block",
            "--bucket",
            bucket,
            "--public-access-block-configuration",
            &block,
        ],
    )
    .await?;

    let cors = json!({
        "CORSRules": [{
            "AllowedHeaders": ["*"],
            "AllowedMethods": ["GET", "POST", "PUT"],
            "AllowedOrigins": ["*"]
        }]
    })
    .to_string();
    cli.run(
        "s3api",
        &["put-bucket-cors", "--bucket", bucket, "--cors-configuration", &cors],
    )
    .await?;

    cli.run(
        "s3api",
        &[
            "put-bucket-versioning",
            "--bucket",
            bucket,
            "--versioning-configuration",
            "Status=Suspended",
        ],
    )
    .await?;

    if let Err(e) = cli
        .run("s3api", &["put-object", "--bucket", bucket, "--key", "docs/"])
        .await
    {
        tracing::warn!("Failed to create docs folder in {}: {}", bucket, e);
    }
    Ok(())
}

pub async fn put_policy(cli: &AwsCli, bucket: &str, policy: &Value) -> Result<()> {
    let policy = policy.to_string();
    cli.run(
        "s3api",
        &["put-bucket-policy", "--bucket", bucket, "--policy", &policy],
    )
    .await?;
    Ok(())
}

pub async fn discover(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let output = cli.run("s3api", &["list-buckets"]).await?;
    Ok(items(&output, "/Buckets")
        .iter()
        .filter_map(|b| text(b, "/Name"))
        .filter(|name| name.contains(pattern))
        .map(|name| descriptor(&name, cli.region()))
        .collect())
}

/// Delete every object version and delete marker
///
/// Returns the number of keys removed.
pub async fn empty(cli: &AwsCli, bucket: &str) -> Result<usize> {
    let Some(listing) = cli
        .run_optional("s3api", &["list-object-versions", "--bucket", bucket])
        .await?
    else {
        return Ok(0);
    };

    let objects: Vec<Value> = ["/Versions", "/DeleteMarkers"]
        .iter()
        .flat_map(|pointer| items(&listing, pointer))
        .filter_map(|v| {
            Some(json!({
                "Key": text(v, "/Key")?,
                "VersionId": text(v, "/VersionId")?
            }))
        })
        .collect();

    for batch in objects.chunks(DELETE_BATCH) {
        let delete = json!({ "Objects": batch, "Quiet": true }).to_string();
        cli.run(
            "s3api",
            &["delete-objects", "--bucket", bucket, "--delete", &delete],
        )
        .await?;
        tracing::debug!("Deleted {} object versions from {}", batch.len(), bucket);
    }
    Ok(objects.len())
}

pub async fn delete(cli: &AwsCli, bucket: &str) -> Result<()> {
    cli.run("s3api", &["delete-bucket", "--bucket", bucket]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_names() {
        assert_eq!(
            bucket_arn("storage-for-demo-123-us-west-2"),
            "arn:aws:s3:::storage-for-demo-123-us-west-2"
        );
        assert_eq!(
            bucket_domain("storage-for-demo-123-us-west-2", "us-west-2"),
            "storage-for-demo-123-us-west-2.s3.us-west-2.amazonaws.com"
        );
    }
}
