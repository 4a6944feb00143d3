//! Persisted deployment config
//!
//! Manages the `application/config.json` document: the identifiers each
//! provisioning run produces, read back by later runs and handed to the
//! compute instance's setup script.

use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const BACKUP_SUFFIX: &str = "backup";

/// Keys written by a provisioning run
///
/// Unknown keys already present in the file survive a merge untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(rename = "projectName", skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    #[serde(rename = "accountId", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base_role: Option<String>,

    #[serde(rename = "collectionArn", skip_serializing_if = "Option::is_none")]
    pub collection_arn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub opensearch_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_arn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharing_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alb_dns: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloudfront_domain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

macro_rules! merge_fields {
    ($target:expr, $source:expr, $($field:ident),+ $(,)?) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field.clone();
            }
        )+
    };
}

impl DeploymentConfig {
    /// Overwrite every key that `update` sets
    pub fn merge(&mut self, update: &DeploymentConfig) {
        merge_fields!(
            self,
            update,
            project_name,
            account_id,
            region,
            knowledge_base_id,
            knowledge_base_role,
            collection_arn,
            opensearch_url,
            s3_bucket,
            s3_arn,
            sharing_url,
            vpc_id,
            alb_dns,
            cloudfront_domain,
            instance_id,
        );
        for (key, value) in &update.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// The subset handed to the compute instance's setup script
    pub fn environment(&self) -> BTreeMap<String, String> {
        let pairs = [
            ("projectName", &self.project_name),
            ("accountId", &self.account_id),
            ("region", &self.region),
            ("knowledge_base_id", &self.knowledge_base_id),
            ("knowledge_base_role", &self.knowledge_base_role),
            ("collectionArn", &self.collection_arn),
            ("opensearch_url", &self.opensearch_url),
            ("s3_bucket", &self.s3_bucket),
            ("s3_arn", &self.s3_arn),
            ("sharing_url", &self.sharing_url),
        ];
        pairs
            .into_iter()
            .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
            .collect()
    }
}

/// Reads and writes the deployment config file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".");
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    /// Load the config, or the default when the file does not exist
    pub async fn load(&self) -> Result<DeploymentConfig> {
        if !self.path.exists() {
            tracing::debug!("Config file {} not found, using defaults", self.path.display());
            return Ok(DeploymentConfig::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let config: DeploymentConfig = serde_json::from_str(&content).map_err(|e| {
            CloudError::StateError(format!("{}: {}", self.path.display(), e))
        })?;

        tracing::debug!("Loaded config from {}", self.path.display());
        Ok(config)
    }

    /// Merge `update` into the stored config and write it back
    ///
    /// The previous file is kept next to it with a `.backup` suffix. An
    /// unreadable previous file is replaced rather than merged.
    pub async fn merge_and_save(&self, update: &DeploymentConfig) -> Result<DeploymentConfig> {
        let mut config = match self.load().await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Could not read existing config, starting fresh: {}", e);
                DeploymentConfig::default()
            }
        };
        config.merge(update);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                tracing::debug!("Created config directory: {}", parent.display());
            }
        }

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path()).await?;
            tracing::debug!("Created config backup");
        }

        let content = serde_json::to_string_pretty(&config)?;
        fs::write(&self.path, content).await?;

        tracing::debug!("Saved config to {}", self.path.display());
        Ok(config)
    }
}
