//! Bedrock knowledge bases and their data sources

use crate::cli::{AwsCli, items, text};
use crate::error::{AwsError, Result};
use agentstack_cloud::{ResourceDescriptor, ResourceKind, ResourceStatus, attr};
use serde_json::{Value, json};

const SERVICE: &str = "bedrock-agent";

/// Field names shared with the vector index mapping
pub const VECTOR_FIELD: &str = "vector_field";
pub const TEXT_FIELD: &str = "AMAZON_BEDROCK_TEXT";
pub const METADATA_FIELD: &str = "AMAZON_BEDROCK_METADATA";

fn kb_descriptor(kb: &Value) -> Option<ResourceDescriptor> {
    let name = text(kb, "/name")?;
    let mut desc = ResourceDescriptor::new(ResourceKind::KnowledgeBase, name);
    desc.id = text(kb, "/knowledgeBaseId");
    desc.arn = text(kb, "/knowledgeBaseArn");
    if let Some(status) = text(kb, "/status") {
        desc.status = ResourceStatus::parse(&status);
        desc.set_attribute(attr::STATE, json!(status));
    }
    if let Some(collection) = text(
        kb,
        "/storageConfiguration/opensearchServerlessConfiguration/collectionArn",
    ) {
        desc.set_attribute(attr::COLLECTION_ARN, json!(collection));
    }
    Some(desc)
}

fn ds_descriptor(ds: &Value, knowledge_base_id: &str) -> Option<ResourceDescriptor> {
    let name = text(ds, "/name")?;
    let mut desc = ResourceDescriptor::new(ResourceKind::DataSource, name)
        .with_attribute(attr::KNOWLEDGE_BASE_ID, json!(knowledge_base_id));
    desc.id = text(ds, "/dataSourceId");
    if let Some(status) = text(ds, "/status") {
        desc.status = ResourceStatus::parse(&status);
    }
    Some(desc)
}

async fn get_knowledge_base(cli: &AwsCli, id: &str) -> Result<Value> {
    let output = cli
        .run(SERVICE, &["get-knowledge-base", "--knowledge-base-id", id])
        .await?;
    output
        .get("knowledgeBase")
        .cloned()
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("get-knowledge-base: {}", output)))
}

async fn summaries(cli: &AwsCli) -> Result<Vec<Value>> {
    let output = cli.run(SERVICE, &["list-knowledge-bases"]).await?;
    Ok(items(&output, "/knowledgeBaseSummaries").to_vec())
}

/// Full details (including the bound collection) of the knowledge base named `name`
pub async fn find(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    for summary in summaries(cli).await? {
        if text(&summary, "/name").as_deref() != Some(name) {
            continue;
        }
        let Some(id) = text(&summary, "/knowledgeBaseId") else {
            continue;
        };
        let detail = get_knowledge_base(cli, &id).await?;
        return Ok(kb_descriptor(&detail));
    }
    Ok(None)
}

pub fn knowledge_base_configuration(embedding_model_arn: &str, dimensions: u32) -> Value {
    json!({
        "type": "VECTOR",
        "vectorKnowledgeBaseConfiguration": {
            "embeddingModelArn": embedding_model_arn,
            "embeddingModelConfiguration": {
                "bedrockEmbeddingModelConfiguration": { "dimensions": dimensions }
            }
        }
    })
}

pub fn storage_configuration(collection_arn: &str, index_name: &str) -> Value {
    json!({
        "type": "OPENSEARCH_SERVERLESS",
        "opensearchServerlessConfiguration": {
            "collectionArn": collection_arn,
            "fieldMapping": {
                "metadataField": METADATA_FIELD,
                "textField": TEXT_FIELD,
                "vectorField": VECTOR_FIELD
            },
            "vectorIndexName": index_name
        }
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn create(
    cli: &AwsCli,
    name: &str,
    description: &str,
    role_arn: &str,
    collection_arn: &str,
    index_name: &str,
    embedding_model_arn: &str,
    dimensions: u32,
) -> Result<ResourceDescriptor> {
    let kb_config = knowledge_base_configuration(embedding_model_arn, dimensions).to_string();
    let storage = storage_configuration(collection_arn, index_name).to_string();
    let tags = json!({ name: "true" }).to_string();

    let output = cli
        .run(
            SERVICE,
            &[
                "create-knowledge-base",
                "--name",
                name,
                "--description",
                description,
                "--role-arn",
                role_arn,
                "--knowledge-base-configuration",
                &kb_config,
                "--storage-configuration",
                &storage,
                "--tags",
                &tags,
            ],
        )
        .await?;
    output
        .get("knowledgeBase")
        .and_then(kb_descriptor)
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-knowledge-base: {}", output)))
}

pub async fn status(cli: &AwsCli, id: &str) -> Result<String> {
    let detail = get_knowledge_base(cli, id).await?;
    text(&detail, "/status")
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("knowledge base {} has no status", id)))
}

pub async fn discover(cli: &AwsCli, pattern: &str) -> Result<Vec<ResourceDescriptor>> {
    Ok(summaries(cli)
        .await?
        .iter()
        .filter_map(kb_descriptor)
        .filter(|d| d.name.contains(pattern))
        .collect())
}

pub async fn delete(cli: &AwsCli, id: &str) -> Result<()> {
    cli.run(SERVICE, &["delete-knowledge-base", "--knowledge-base-id", id])
        .await?;
    Ok(())
}

// Data sources

async fn data_sources(cli: &AwsCli, knowledge_base_id: &str) -> Result<Vec<ResourceDescriptor>> {
    let output = cli
        .run(
            SERVICE,
            &["list-data-sources", "--knowledge-base-id", knowledge_base_id],
        )
        .await?;
    Ok(items(&output, "/dataSourceSummaries")
        .iter()
        .filter_map(|ds| ds_descriptor(ds, knowledge_base_id))
        .collect())
}

/// Data sources are scoped to a knowledge base, so every knowledge base is searched
pub async fn find_data_source(cli: &AwsCli, name: &str) -> Result<Option<ResourceDescriptor>> {
    for summary in summaries(cli).await? {
        let Some(kb_id) = text(&summary, "/knowledgeBaseId") else {
            continue;
        };
        if let Some(ds) = data_sources(cli, &kb_id)
            .await?
            .into_iter()
            .find(|ds| ds.name == name)
        {
            return Ok(Some(ds));
        }
    }
    Ok(None)
}

pub fn data_source_configuration(bucket_arn: &str, inclusion_prefixes: &[String]) -> Value {
    json!({
        "type": "S3",
        "s3Configuration": {
            "bucketArn": bucket_arn,
            "inclusionPrefixes": inclusion_prefixes
        }
    })
}

pub fn ingestion_configuration(parsing_model_arn: &str) -> Value {
    json!({
        "chunkingConfiguration": {
            "chunkingStrategy": "HIERARCHICAL",
            "hierarchicalChunkingConfiguration": {
                "levelConfigurations": [
                    { "maxTokens": 1500 },
                    { "maxTokens": 300 }
                ],
                "overlapTokens": 60
            }
        },
        "parsingConfiguration": {
            "parsingStrategy": "BEDROCK_FOUNDATION_MODEL",
            "bedrockFoundationModelConfiguration": { "modelArn": parsing_model_arn }
        }
    })
}

pub async fn create_data_source(
    cli: &AwsCli,
    name: &str,
    knowledge_base_id: &str,
    bucket_arn: &str,
    inclusion_prefixes: &[String],
    parsing_model_arn: &str,
) -> Result<ResourceDescriptor> {
    let description = format!("S3 data source: {}", name);
    let source = data_source_configuration(bucket_arn, inclusion_prefixes).to_string();
    let ingestion = ingestion_configuration(parsing_model_arn).to_string();

    let output = cli
        .run(
            SERVICE,
            &[
                "create-data-source",
                "--knowledge-base-id",
                knowledge_base_id,
                "--name",
                name,
                "--description",
                &description,
                "--data-deletion-policy",
                "RETAIN",
                "--data-source-configuration",
                &source,
                "--vector-ingestion-configuration",
                &ingestion,
            ],
        )
        .await?;
    output
        .get("dataSource")
        .and_then(|ds| ds_descriptor(ds, knowledge_base_id))
        .ok_or_else(|| AwsError::UnexpectedResponse(format!("create-data-source: {}", output)))
}

pub async fn delete_data_source(cli: &AwsCli, target: &ResourceDescriptor) -> Result<()> {
    let kb_id = target
        .attr_str(attr::KNOWLEDGE_BASE_ID)
        .ok_or_else(|| {
            AwsError::UnexpectedResponse(format!("{} has no knowledge base", target.name))
        })?;
    cli.run(
        SERVICE,
        &[
            "delete-data-source",
            "--knowledge-base-id",
            kb_id,
            "--data-source-id",
            target.id_or_name(),
        ],
    )
    .await?;
    Ok(())
}

/// Delete every data source of a knowledge base
///
/// Individual failures are logged; the knowledge base delete that follows
/// reports anything that still blocks it.
pub async fn release(cli: &AwsCli, knowledge_base_id: &str) -> Result<()> {
    for ds in data_sources(cli, knowledge_base_id).await? {
        match delete_data_source(cli, &ds).await {
            Ok(()) => tracing::debug!("Deleted data source: {}", ds.id_or_name()),
            Err(e) => tracing::warn!("Failed to delete data source {}: {}", ds.id_or_name(), e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_configuration_field_mapping() {
        let config = storage_configuration("arn:aws:aoss:us-west-2:1:collection/abc", "demo");
        let mapping = &config["opensearchServerlessConfiguration"]["fieldMapping"];
        assert_eq!(mapping["vectorField"], "vector_field");
        assert_eq!(mapping["textField"], "AMAZON_BEDROCK_TEXT");
        assert_eq!(config["opensearchServerlessConfiguration"]["vectorIndexName"], "demo");
    }

    #[test]
    fn test_ingestion_configuration_chunking() {
        let config = ingestion_configuration("arn:model");
        let levels = config["chunkingConfiguration"]["hierarchicalChunkingConfiguration"]
            ["levelConfigurations"]
            .as_array()
            .unwrap();
        assert_eq!(levels[0]["maxTokens"], 1500);
        assert_eq!(levels[1]["maxTokens"], 300);
        assert_eq!(
            config["chunkingConfiguration"]["hierarchicalChunkingConfiguration"]["overlapTokens"],
            60
        );
    }

    #[test]
    fn test_kb_descriptor_reads_collection() {
        let kb = json!({
            "name": "demo",
            "knowledgeBaseId": "KB123",
            "status": "ACTIVE",
            "storageConfiguration": {
                "opensearchServerlessConfiguration": {
                    "collectionArn": "arn:aws:aoss:us-west-2:1:collection/abc"
                }
            }
        });
        let desc = kb_descriptor(&kb).unwrap();
        assert_eq!(desc.id.as_deref(), Some("KB123"));
        assert_eq!(
            desc.attr_str(attr::COLLECTION_ARN),
            Some("arn:aws:aoss:us-west-2:1:collection/abc")
        );
    }
}
