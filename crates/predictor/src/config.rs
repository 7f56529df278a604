//! Service configuration

use anyhow::{Context, Result};
use predictor_lib::provider::{
    default_model_key, ArtifactStore, FileArtifactStore, HttpArtifactStore, ProviderConfig,
    DEFAULT_BUCKET, DEFAULT_CACHE_PATH, DEFAULT_MODEL_PACKAGE_GROUP,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where model artifacts are fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[serde(alias = "S3")]
    S3,
    #[serde(alias = "FILE")]
    File,
}

/// Service configuration, read from unprefixed environment variables
/// (`PORT`, `MODEL_BUCKET`, ...)
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bucket")]
    pub model_bucket: String,

    /// Artifact key; derived from the package group when unset
    #[serde(default)]
    pub model_key: Option<String>,

    /// Version reported for remote models instead of the store's version id
    #[serde(default)]
    pub model_version: Option<String>,

    #[serde(default = "default_region")]
    pub aws_region: String,

    #[serde(default = "default_package_group")]
    pub model_package_group_name: String,

    #[serde(default = "default_store_kind")]
    pub model_store: StoreKind,

    /// Override for the S3-compatible endpoint (MinIO, proxies)
    #[serde(default)]
    pub model_store_endpoint: Option<String>,

    /// Root directory for the file store
    #[serde(default = "default_store_dir")]
    pub model_store_dir: PathBuf,

    #[serde(default = "default_cache_path")]
    pub model_cache_path: PathBuf,

    #[serde(default = "default_fetch_timeout")]
    pub model_fetch_timeout_secs: u64,

    #[serde(default = "default_fetch_attempts")]
    pub model_fetch_attempts: u32,

    /// Load the model before accepting traffic
    #[serde(default = "default_eager_load")]
    pub model_eager_load: bool,
}

fn default_port() -> u16 {
    8000
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

fn default_region() -> String {
    "ap-southeast-1".to_string()
}

fn default_package_group() -> String {
    DEFAULT_MODEL_PACKAGE_GROUP.to_string()
}

fn default_store_kind() -> StoreKind {
    StoreKind::S3
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./models")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_PATH)
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_fetch_attempts() -> u32 {
    2
}

fn default_eager_load() -> bool {
    true
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl ServiceConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::from_environment(config::Environment::default())
    }

    /// Load configuration from an explicit variable map
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::from_environment(config::Environment::default().source(Some(vars)))
    }

    fn from_environment(environment: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment.try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid service configuration")
    }

    pub fn model_key(&self) -> String {
        non_empty(&self.model_key)
            .unwrap_or_else(|| default_model_key(&self.model_package_group_name))
    }

    pub fn into_provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            bucket: self.model_bucket.clone(),
            model_key: self.model_key(),
            model_package_group: self.model_package_group_name.clone(),
            version_override: non_empty(&self.model_version),
            cache_path: self.model_cache_path.clone(),
            fetch_timeout: Duration::from_secs(self.model_fetch_timeout_secs.max(1)),
            fetch_attempts: self.model_fetch_attempts.max(1),
            ..Default::default()
        }
    }

    /// Build the artifact store selected by `MODEL_STORE`
    pub fn build_store(&self) -> Result<Arc<dyn ArtifactStore>> {
        match self.model_store {
            StoreKind::S3 => {
                let endpoint = non_empty(&self.model_store_endpoint).unwrap_or_else(|| {
                    HttpArtifactStore::s3_endpoint(&self.model_bucket, &self.aws_region)
                });
                let store = HttpArtifactStore::new(
                    &endpoint,
                    Duration::from_secs(self.model_fetch_timeout_secs.max(1)),
                )?;
                Ok(Arc::new(store))
            }
            StoreKind::File => Ok(Arc::new(FileArtifactStore::new(&self.model_store_dir))),
        }
    }
}
