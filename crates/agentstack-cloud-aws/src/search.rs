//! OpenSearch Serverless: security and access policies, collections, and the
//! vector index created over the collection's data plane

use crate::cli::{AwsCli, items, text};
use crate::error::{AwsError, Result};
use crate::sigv4::{self, UnsignedRequest};
use agentstack_cloud::{PolicyType, ResourceDescriptor, ResourceKind, ResourceStatus, attr};
use serde_json::{Value, json};
use aws_credential_types::provider::SharedCredentialsProvider;
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;

const SERVICE: &str = "opensearchserverless";
const SIGNING_NAME: &str = "aoss";
const POLICY_TYPE: &str = "policy_type";
const POLICY_VERSION: &str = "policy_version";

// Security policies

fn security_policy_descriptor(detail: &Value, policy_type: &str) -> Option<ResourceDescriptor> {
    let name = text(detail, "/name")?;
    Some(
        ResourceDescriptor::new(ResourceKind::SecurityPolicy, name.clone())
            .with_id(name)
            .with_status(ResourceStatus::Active)
            .with_attribute(POLICY_TYPE, json!(policy_type)),
    )
}

/// The policy type is not part of the name, so both types are probed
pub async fn find_security_policy(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    for policy_type in [PolicyType::Encryption, PolicyType::Network] {
        let found = cli
            .run_optional(
                SERVICE,
                &[
                    "get-security-policy",
                    "--name",
                    name,
                    "--type",
                    policy_type.as_str(),
                ],
            )
            .await?;
        if let Some(detail) = found.as_ref().and_then(|v| v.get("securityPolicyDetail")) {
            return Ok(security_policy_descriptor(detail, policy_type.as_str()));
        }
    }
    Ok(None)
}

pub async fn create_security_policy(
    cli: &AwsCli,
    name: &str,
    policy_type: PolicyType,
    document: &Value,
    description: &str,
) -> Result<ResourceDescriptor> {
    let policy = document.to_string();
    cli.run(
        SERVICE,
        &[
            "create-security-policy",
            "--name",
            name,
            "--type",
            policy_type.as_str(),
            "--policy",
            &policy,
            "--description",
            description,
        ],
    )
    .await?;
    Ok(ResourceDescriptor::new(ResourceKind::SecurityPolicy, name)
        .with_id(name)
        .with_status(ResourceStatus::Active)
        .with_attribute(POLICY_TYPE, json!(policy_type.as_str())))
}

pub async fn discover_security_policies(
    cli: &AwsCli,
    pattern: &str,
) -> Result<Vec<ResourceDescriptor>> {
    let mut found = Vec::new();
    for policy_type in [PolicyType::Encryption, PolicyType::Network] {
        let output = cli
            .run(
                SERVICE,
                &["list-security-policies", "--type", policy_type.as_str()],
            )
            .await?;
        found.extend(
            items(&output, "/securityPolicySummaries")
                .iter()
                .filter_map(|s| security_policy_descriptor(s, policy_type.as_str()))
                .filter(|d| d.name.contains(pattern)),
        );
    }
    Ok(found)
}

pub async fn delete_security_policy(cli: &AwsCli, target: &ResourceDescriptor) -> Result<()> {
    let policy_type = target
        .attr_str(POLICY_TYPE)
        .ok_or_else(|| {
            AwsError::UnexpectedResponse(format!("{} has no policy type", target.name))
        })?;
    cli.run(
        SERVICE,
        &[
            "delete-security-policy",
            "--name",
            &target.name,
            "--type",
            policy_type,
        ],
    )
    .await?;
    Ok(())
}

// Data access policies

/// Every principal named by any rule of the policy document
pub fn policy_principals(document: &Value) -> Vec<String> {
    let mut principals = Vec::new();
    for rule in document.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        match rule.get("Principal") {
            Some(Value::Array(list)) => principals.extend(
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            ),
            Some(Value::String(single)) => principals.push(single.clone()),
            _ => {}
        }
    }
    principals
}

/// Add missing principals to every rule that has a `Principal` entry
///
/// Returns `true` when the document changed.
pub fn merge_principals(document: &mut Value, wanted: &[String]) -> bool {
    let mut changed = false;
    let Some(rules) = document.as_array_mut() else {
        return false;
    };
    for rule in rules {
        let Some(current) = rule.get_mut("Principal") else {
            continue;
        };
        if let Some(single) = current.as_str().map(str::to_string) {
            *current = json!([single]);
        }
        if let Value::Array(list) = current {
            for principal in wanted {
                if !list.iter().any(|p| p.as_str() == Some(principal.as_str())) {
                    list.push(json!(principal));
                    changed = true;
                }
            }
        }
    }
    changed
}

fn access_policy_descriptor(detail: &Value) -> Option<ResourceDescriptor> {
    let name = text(detail, "/name")?;
    let mut desc = ResourceDescriptor::new(ResourceKind::AccessPolicy, name.clone())
        .with_id(name)
        .with_status(ResourceStatus::Active);
    if let Some(version) = text(detail, "/policyVersion") {
        desc.set_attribute(POLICY_VERSION, json!(version));
    }
    if let Some(policy) = detail.get("policy") {
        desc.set_attribute(attr::PRINCIPALS, json!(policy_principals(policy)));
    }
    Some(desc)
}

async fn get_access_policy(cli: &AwsCli, name: &str) -> Result<Option<Value>> {
    let output = cli
        .run_optional(
            SERVICE,
            &["get-access-policy", "--name", name, "--type", "data"],
        )
        .await?;
    Ok(output.and_then(|v| v.get("accessPolicyDetail").cloned()))
}

pub async fn find_access_policy(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    Ok(get_access_policy(cli, name)
        .await?
        .as_ref()
        .and_then(access_policy_descriptor))
}

pub async fn create_access_policy(
    cli: &AwsCli,
    name: &str,
    document: &Value,
    description: &str,
) -> Result<ResourceDescriptor> {
    let policy = document.to_string();
    let output = cli
        .run(
            SERVICE,
            &[
                "create-access-policy",
                "--name",
                name,
                "--type",
                "data",
                "--policy",
                &policy,
                "--description",
                description,
            ],
        )
        .await?;
    output
        .get("accessPolicyDetail")
        .and_then(access_policy_descriptor)
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-access-policy: {}", output)))
}

pub async fn add_principals(cli: &AwsCli, name: &str, principals: &[String]) -> Result<()> {
    let detail = get_access_policy(cli, name)
        .await?
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("access policy {} vanished", name)))?;
    let mut document = detail.get("policy").cloned().unwrap_or(Value::Null);
    let version = text(&detail, "/policyVersion").unwrap_or_default();

    if !merge_principals(&mut document, principals) {
        tracing::debug!("All principals already present in {}", name);
        return Ok(());
    }

    let policy = document.to_string();
    cli.run(
        SERVICE,
        &[
            "update-access-policy",
            "--name",
            name,
            "--type",
            "data",
            "--policy",
            &policy,
            "--policy-version",
            &version,
        ],
    )
    .await?;
    tracing::info!("Updated data access policy {} with missing principals", name);
    Ok(())
}

pub async fn discover_access_policies(
    cli: &AwsCli,
    pattern: &str,
) -> Result<Vec<ResourceDescriptor>> {
    let output = cli
        .run(SERVICE, &["list-access-policies", "--type", "data"])
        .await?;
    Ok(items(&output, "/accessPolicySummaries")
        .iter()
        .filter_map(access_policy_descriptor)
        .filter(|d| d.name.contains(pattern))
        .collect())
}

pub async fn delete_access_policy(cli: &AwsCli, name: &str) -> Result<()> {
    cli.run(
        SERVICE,
        &["delete-access-policy", "--name", name, "--type", "data"],
    )
    .await?;
    Ok(())
}

// Collections

fn collection_descriptor(detail: &Value) -> Option<ResourceDescriptor> {
    let name = text(detail, "/name")?;
    let mut desc = ResourceDescriptor::new(ResourceKind::Collection, name);
    desc.id = text(detail, "/id");
    desc.arn = text(detail, "/arn");
    if let Some(status) = text(detail, "/status") {
        desc.status = ResourceStatus::parse(&status);
        desc.set_attribute(attr::STATE, json!(status));
    }
    if let Some(endpoint) = text(detail, "/collectionEndpoint") {
        desc.set_attribute(attr::ENDPOINT, json!(endpoint));
    }
    Some(desc)
}

pub async fn find_collection(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    let output = cli
        .run(SERVICE, &["batch-get-collection", "--names", name])
        .await?;
    Ok(items(&output, "/collectionDetails")
        .iter()
        .filter_map(collection_descriptor)
        .find(|d| d.status != ResourceStatus::Deleting))
}

pub async fn create_collection(
    cli: &AwsCli,
    name: &str,
    description: &str,
) -> Result<ResourceDescriptor> {
    let output = cli
        .run(
            SERVICE,
            &[
                "create-collection",
                "--name",
                name,
                "--type",
                "VECTORSEARCH",
                "--description",
                description,
            ],
        )
        .await?;
    output
        .get("createCollectionDetail")
        .and_then(collection_descriptor)
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-collection: {}", output)))
}

pub async fn collection_status(cli: &AwsCli, id: &str) -> Result<String> {
    let output = cli
        .run(SERVICE, &["batch-get-collection", "--ids", id])
        .await?;
    items(&output, "/collectionDetails")
        .first()
        .and_then(|d| text(d, "/status"))
        .ok_or_else(|| AwsError::Api {
            code: "ResourceNotFoundException".to_string(),
            message: format!("collection {} not found", id),
        })
}

pub async fn discover_collections(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    let output = cli.run(SERVICE, &["list-collections"]).await?;
    Ok(items(&output, "/collectionSummaries")
        .iter()
        .filter_map(collection_descriptor)
        .filter(|d| d.name.contains(pattern))
        .collect())
}

pub async fn delete_collection(cli: &AwsCli, id: &str) -> Result<()> {
    cli.run(SERVICE, &["delete-collection", "--id", id]).await?;
    Ok(())
}

// Vector index

/// Signed HTTP access to a collection's data plane
pub struct IndexClient {
    http: reqwest::Client,
    credentials: OnceCell<SharedCredentialsProvider>,
}

impl IndexClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            credentials: OnceCell::new(),
        })
    }

    async fn send(
        &self,
        cli: &AwsCli,
        method: reqwest::Method,
        url: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| AwsError::UnexpectedResponse(format!("bad endpoint {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AwsError::UnexpectedResponse(format!("endpoint {} has no host", url)))?;

        let provider = self
            .credentials
            .get_or_try_init(|| sigv4::credentials_provider(cli.region()))
            .await?;
        let credentials = sigv4::resolve(provider).await?;
        let headers = sigv4::signing_headers(
            &UnsignedRequest {
                method: method.as_str(),
                url: parsed.as_str(),
                headers: &[("host", host)],
                body: &body,
            },
            credentials,
            cli.region(),
            SIGNING_NAME,
            SystemTime::now(),
        )?;

        let mut request = self.http.request(method, parsed.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.header("content-type", "application/json");
        }
        Ok(request.body(body).send().await?)
    }

    pub async fn exists(&self, cli: &AwsCli, endpoint: &str, index: &str) -> Result<bool> {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), index);
        let response = self.send(cli, reqwest::Method::GET, &url, Vec::new()).await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(AwsError::UnexpectedResponse(format!(
                "GET {} returned {}",
                url, code
            ))),
        }
    }

    pub async fn create(
        &self,
        cli: &AwsCli,
        endpoint: &str,
        index: &str,
        body: &Value,
    ) -> Result<()> {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), index);
        let payload = serde_json::to_vec(body)?;
        let response = self.send(cli, reqwest::Method::PUT, &url, payload).await?;
        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            tracing::info!("Vector index '{}' created", index);
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if text.contains("resource_already_exists_exception") {
            return Err(AwsError::Api {
                code: "ResourceExistsException".to_string(),
                message: format!("index {} already exists", index),
            });
        }
        Err(AwsError::UnexpectedResponse(format!(
            "failed to create vector index: {} - {}",
            status, text
        )))
    }
}

pub fn index_descriptor(name: &str, endpoint: &str) -> ResourceDescriptor {
    ResourceDescriptor::new(ResourceKind::VectorIndex, name)
        .with_id(name)
        .with_status(ResourceStatus::Active)
        .with_attribute(attr::ENDPOINT, json!(endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_principals_adds_missing_only() {
        let mut document = json!([{
            "Rules": [],
            "Principal": ["arn:aws:iam::123:root"]
        }]);
        let wanted = vec![
            "arn:aws:iam::123:root".to_string(),
            "arn:aws:iam::123:role/role-ec2-for-demo-us-west-2".to_string(),
        ];

        assert!(merge_principals(&mut document, &wanted));
        assert_eq!(
            policy_principals(&document),
            vec![
                "arn:aws:iam::123:root".to_string(),
                "arn:aws:iam::123:role/role-ec2-for-demo-us-west-2".to_string(),
            ]
        );
        assert!(!merge_principals(&mut document, &wanted));
    }

    #[test]
    fn test_merge_principals_single_string() {
        let mut document = json!([{ "Principal": "arn:aws:iam::123:root" }]);
        let wanted = vec!["arn:aws:iam::123:role/kb".to_string()];
        assert!(merge_principals(&mut document, &wanted));
        assert_eq!(document[0]["Principal"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_collection_descriptor() {
        let detail = json!({
            "id": "abc123",
            "name": "demo",
            "arn": "arn:aws:aoss:us-west-2:123:collection/abc123",
            "status": "ACTIVE",
            "collectionEndpoint": "https://abc123.us-west-2.aoss.amazonaws.com"
        });
        let desc = collection_descriptor(&detail).unwrap();
        assert_eq!(desc.id.as_deref(), Some("abc123"));
        assert_eq!(desc.status, ResourceStatus::Active);
        assert_eq!(
            desc.attr_str(attr::ENDPOINT),
            Some("https://abc123.us-west-2.aoss.amazonaws.com")
        );
    }
}
