//! CloudFront distributions and origin access identities
//!
//! Neither has a user-chosen name; both are found by their comment.

use crate::cli::{AwsCli, items, text};
use crate::error::{AwsError, Result};
use agentstack_cloud::{ResourceDescriptor, ResourceKind, ResourceStatus, attr};
use serde_json::{Value, json};

const SERVICE: &str = "cloudfront";

/// Managed-CachingOptimized
const CACHE_POLICY_ID: &str = "4135ea2d-6df8-44a3-9df3-4b5a84be39ad";
/// Managed-AllViewer
const ORIGIN_REQUEST_POLICY_ID: &str = "216adef6-5c7f-47e4-b989-5492eafa07d3";

/// Attribute holding the OAI's S3 canonical user
pub const CANONICAL_USER: &str = "s3_canonical_user_id";

fn caller_reference(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Utc::now().timestamp())
}

// Origin access identities

fn oai_descriptor(oai: &Value, comment: &str) -> Option<ResourceDescriptor> {
    let id = text(oai, "/Id")?;
    let mut desc = ResourceDescriptor::new(ResourceKind::OriginAccessIdentity, comment)
        .with_id(id)
        .with_status(ResourceStatus::Available);
    if let Some(user) = text(oai, "/S3CanonicalUserId") {
        desc.set_attribute(CANONICAL_USER, json!(user));
    }
    Some(desc)
}

async fn origin_access_identities(cli: &AwsCli) -> Result<Vec<Value>> {
    let output = cli
        .run(SERVICE, &["list-cloud-front-origin-access-identities"])
        .await?;
    Ok(items(&output, "/CloudFrontOriginAccessIdentityList/Items").to_vec())
}

pub async fn find_oai(cli: &AwsCli, comment: &str) -> Result<Option<ResourceDescriptor>> {
    Ok(origin_access_identities(cli)
        .await?
        .iter()
        .filter(|oai| text(oai, "/Comment").as_deref() == Some(comment))
        .find_map(|oai| oai_descriptor(oai, comment)))
}

/// `comment` is `OAI for <project> S3 bucket`
pub async fn create_oai(cli: &AwsCli, project: &str, comment: &str) -> Result<ResourceDescriptor> {
    let config = json!({
        "CallerReference": caller_reference(&format!("{}-s3-oai", project)),
        "Comment": comment
    })
    .to_string();
    let output = cli
        .run(
            SERVICE,
            &[
                "create-cloud-front-origin-access-identity",
                "--cloud-front-origin-access-identity-config",
                &config,
            ],
        )
        .await?;
    output
        .get("CloudFrontOriginAccessIdentity")
        .and_then(|oai| oai_descriptor(oai, comment))
        .ok_or_else(|| {
            AwsError::UnexpectedResponse(format!(
                "create-cloud-front-origin-access-identity: {}",
                output
            ))
        })
}

pub async fn discover_oais(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    Ok(origin_access_identities(cli)
        .await?
        .iter()
        .filter_map(|oai| {
            let comment = text(oai, "/Comment")?;
            if comment.contains(pattern) {
                oai_descriptor(oai, &comment)
            } else {
                None
            }
        })
        .collect())
}

pub async fn delete_oai(cli: &AwsCli, id: &str) -> Result<()> {
    let current = cli
        .run(SERVICE, &["get-cloud-front-origin-access-identity", "--id", id])
        .await?;
    let etag = etag(&current)?;
    cli.run(
        SERVICE,
        &[
            "delete-cloud-front-origin-access-identity",
            "--id",
            id,
            "--if-match",
            &etag,
        ],
    )
    .await?;
    Ok(())
}

// Distributions

/// Everything needed to build a distribution config
pub struct DistributionOrigins<'a> {
    pub project_name: &'a str,
    pub comment: &'a str,
    pub alb_dns: &'a str,
    pub bucket_domain: &'a str,
    pub oai_id: &'a str,
    pub static_paths: &'a [String],
}

fn quantity<T: serde::Serialize>(values: &[T]) -> Value {
    json!({ "Quantity": values.len(), "Items": values })
}

/// Dynamic traffic to the load balancer, `static_paths` to the bucket
pub fn distribution_config(origins: &DistributionOrigins<'_>, caller_reference: &str) -> Value {
    let alb_origin = format!("alb-{}", origins.project_name);
    let s3_origin = format!("s3-{}", origins.project_name);

    let static_behaviors: Vec<Value> = origins
        .static_paths
        .iter()
        .map(|path| {
            json!({
                "PathPattern": path,
                "TargetOriginId": s3_origin,
                "ViewerProtocolPolicy": "redirect-to-https",
                "AllowedMethods": {
                    "Quantity": 2,
                    "Items": ["GET", "HEAD"],
                    "CachedMethods": quantity(&["GET", "HEAD"])
                },
                "CachePolicyId": CACHE_POLICY_ID,
                "Compress": true
            })
        })
        .collect();

    json!({
        "CallerReference": caller_reference,
        "Comment": origins.comment,
        "DefaultCacheBehavior": {
            "TargetOriginId": alb_origin,
            "ViewerProtocolPolicy": "redirect-to-https",
            "AllowedMethods": {
                "Quantity": 7,
                "Items": ["GET", "HEAD", "OPTIONS", "PUT", "POST", "PATCH", "DELETE"],
                "CachedMethods": quantity(&["GET", "HEAD"])
            },
            "CachePolicyId": CACHE_POLICY_ID,
            "OriginRequestPolicyId": ORIGIN_REQUEST_POLICY_ID,
            "Compress": true
        },
        "CacheBehaviors": quantity(&static_behaviors),
        "Origins": {
            "Quantity": 2,
            "Items": [
                {
                    "Id": alb_origin,
                    "DomainName": origins.alb_dns,
                    "CustomOriginConfig": {
                        "HTTPPort": 80,
                        "HTTPSPort": 443,
                        "OriginProtocolPolicy": "http-only"
                    },
                    "CustomHeaders": { "Quantity": 0, "Items": [] },
                    "OriginPath": ""
                },
                {
                    "Id": s3_origin,
                    "DomainName": origins.bucket_domain,
                    "S3OriginConfig": {
                        "OriginAccessIdentity":
                            format!("origin-access-identity/cloudfront/{}", origins.oai_id)
                    },
                    "CustomHeaders": { "Quantity": 0, "Items": [] },
                    "OriginPath": ""
                }
            ]
        },
        "Enabled": true,
        "PriceClass": "PriceClass_200"
    })
}

fn distribution_descriptor(dist: &Value, comment: &str) -> Option<ResourceDescriptor> {
    let id = text(dist, "/Id")?;
    let mut desc = ResourceDescriptor::new(ResourceKind::Distribution, comment).with_id(id);
    desc.arn = text(dist, "/ARN");
    if let Some(status) = text(dist, "/Status") {
        desc.status = ResourceStatus::parse(&status);
        desc.set_attribute(attr::STATE, json!(status));
    }
    if let Some(domain) = text(dist, "/DomainName") {
        desc.set_attribute(attr::DOMAIN_NAME, json!(domain));
    }
    let enabled = dist
        .get("Enabled")
        .or_else(|| dist.pointer("/DistributionConfig/Enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    desc.set_attribute(attr::ENABLED, json!(enabled));
    Some(desc)
}

fn comment_of(dist: &Value) -> Option<String> {
    text(dist, "/Comment").or_else(|| text(dist, "/DistributionConfig/Comment"))
}

async fn distributions(cli: &AwsCli) -> Result<Vec<Value>> {
    let output = cli.run(SERVICE, &["list-distributions"]).await?;
    Ok(items(&output, "/DistributionList/Items").to_vec())
}

pub async fn find_distribution(cli: &AwsCli, comment: &str) -> Result<Option<ResourceDescriptor>> {
    Ok(distributions(cli)
        .await?
        .iter()
        .filter(|d| comment_of(d).as_deref() == Some(comment))
        .find_map(|d| distribution_descriptor(d, comment)))
}

pub async fn create_distribution(
    cli: &AwsCli,
    origins: &DistributionOrigins<'_>,
) -> Result<ResourceDescriptor> {
    let config =
        distribution_config(origins, &caller_reference(origins.project_name)).to_string();
    let output = cli
        .run(SERVICE, &["create-distribution", "--distribution-config", &config])
        .await?;
    output
        .get("Distribution")
        .and_then(|d| distribution_descriptor(d, origins.comment))
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-distribution: {}", output)))
}

pub async fn distribution_status(cli: &AwsCli, id: &str) -> Result<String> {
    let output = cli.run(SERVICE, &["get-distribution", "--id", id]).await?;
    text(&output, "/Distribution/Status")
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("distribution {} has no status", id)))
}

pub async fn discover_distributions(
    cli: &AwsCli,
    pattern: &str,
) -> Result<Vec<ResourceDescriptor>> {
    Ok(distributions(cli)
        .await?
        .iter()
        .filter_map(|d| {
            let comment = comment_of(d)?;
            if comment.contains(pattern) {
                distribution_descriptor(d, &comment)
            } else {
                None
            }
        })
        .collect())
}

fn etag(output: &Value) -> Result<String> {
    text(output, "/ETag")
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("no ETag in {}", output)))
}

/// Flip `Enabled` through a read-modify-write of the distribution config
///
/// A no-op when the distribution is already in the requested state.
pub async fn set_enabled(cli: &AwsCli, id: &str, enabled: bool) -> Result<()> {
    let current = cli
        .run(SERVICE, &["get-distribution-config", "--id", id])
        .await?;
    let etag = etag(&current)?;
    let mut config = current
        .get("DistributionConfig")
        .cloned()
        .ok_or_else(|| {
            AwsError::UnexpectedResponse(format!("get-distribution-config: {}", current))
        })?;

    if config.get("Enabled").and_then(Value::as_bool) == Some(enabled) {
        tracing::debug!("Distribution {} already has Enabled={}", id, enabled);
        return Ok(());
    }
    config["Enabled"] = json!(enabled);
    let config = config.to_string();

    cli.run(
        SERVICE,
        &[
            "update-distribution",
            "--id",
            id,
            "--if-match",
            &etag,
            "--distribution-config",
            &config,
        ],
    )
    .await?;
    tracing::info!(
        "Distribution {} {}",
        id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Fails with DistributionNotDisabled until a disable has finished deploying
pub async fn delete_distribution(cli: &AwsCli, id: &str) -> Result<()> {
    let current = cli
        .run(SERVICE, &["get-distribution-config", "--id", id])
        .await?;
    let etag = etag(&current)?;
    cli.run(
        SERVICE,
        &["delete-distribution", "--id", id, "--if-match", &etag],
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origins<'a>(paths: &'a [String]) -> DistributionOrigins<'a> {
        DistributionOrigins {
            project_name: "demo",
            comment: "CloudFront-for-demo-Hybrid",
            alb_dns: "alb-for-demo-1.us-west-2.elb.amazonaws.com",
            bucket_domain: "storage-for-demo-123-us-west-2.s3.us-west-2.amazonaws.com",
            oai_id: "E2OAI",
            static_paths: paths,
        }
    }

    #[test]
    fn test_distribution_config_routes_static_paths_to_bucket() {
        let paths = vec!["/images/*".to_string(), "/docs/*".to_string()];
        let config = distribution_config(&origins(&paths), "demo-1700000000");

        assert_eq!(config["Comment"], "CloudFront-for-demo-Hybrid");
        assert_eq!(config["DefaultCacheBehavior"]["TargetOriginId"], "alb-demo");
        assert_eq!(config["DefaultCacheBehavior"]["AllowedMethods"]["Quantity"], 7);
        assert_eq!(config["CacheBehaviors"]["Quantity"], 2);
        assert_eq!(config["CacheBehaviors"]["Items"][1]["PathPattern"], "/docs/*");
        assert_eq!(config["CacheBehaviors"]["Items"][0]["TargetOriginId"], "s3-demo");
        assert_eq!(config["PriceClass"], "PriceClass_200");
        assert_eq!(
            config["Origins"]["Items"][1]["S3OriginConfig"]["OriginAccessIdentity"],
            "origin-access-identity/cloudfront/E2OAI"
        );
        assert_eq!(
            config["Origins"]["Items"][0]["CustomOriginConfig"]["OriginProtocolPolicy"],
            "http-only"
        );
    }

    #[test]
    fn test_distribution_descriptor_reads_enabled() {
        let summary = json!({
            "Id": "E123",
            "ARN": "arn:aws:cloudfront::1:distribution/E123",
            "Status": "Deployed",
            "DomainName": "d111.cloudfront.net",
            "Enabled": false,
            "Comment": "CloudFront-for-demo-Hybrid"
        });
        let desc = distribution_descriptor(&summary, "CloudFront-for-demo-Hybrid").unwrap();
        assert_eq!(desc.status, ResourceStatus::Available);
        assert_eq!(desc.attribute::<bool>(attr::ENABLED), Some(false));
        assert_eq!(desc.attr_str(attr::DOMAIN_NAME), Some("d111.cloudfront.net"));
    }

    #[test]
    fn test_created_distribution_reads_nested_config() {
        let created = json!({
            "Id": "E9",
            "Status": "InProgress",
            "DistributionConfig": { "Enabled": true, "Comment": "CloudFront-for-demo-Hybrid" }
        });
        assert_eq!(comment_of(&created).as_deref(), Some("CloudFront-for-demo-Hybrid"));
        let desc = distribution_descriptor(&created, "CloudFront-for-demo-Hybrid").unwrap();
        assert_eq!(desc.status, ResourceStatus::Pending);
        assert_eq!(desc.attribute::<bool>(attr::ENABLED), Some(true));
    }
}
