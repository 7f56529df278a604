//! Model provider: fetches, caches and serves the active model
//!
//! This module provides:
//! - Artifact stores (S3-compatible HTTP and local directory)
//! - Atomic local caching of the fetched artifact
//! - Single-flight loading with a deterministic fallback model

mod cache;
mod lifecycle;
mod store;

pub use cache::{compute_checksum, ArtifactCache, DEFAULT_CACHE_PATH};
pub use lifecycle::{LoadedModel, ModelProvider, ProviderState};
pub use store::{manifest_key, Artifact, ArtifactStore, FileArtifactStore, HttpArtifactStore};

use std::path::PathBuf;
use std::time::Duration;

/// Default bucket holding model artifacts
pub const DEFAULT_BUCKET: &str = "mlops-retail-forecast-models";

/// Default registry group name
pub const DEFAULT_MODEL_PACKAGE_GROUP: &str = "retail-price-sensitivity";

/// Object key used when none is configured explicitly
pub fn default_model_key(model_package_group: &str) -> String {
    format!("models/{}/model.onnx", model_package_group)
}

/// Configuration for the model provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Bucket the artifact lives in (reported in model info)
    pub bucket: String,
    /// Object key of the artifact
    pub model_key: String,
    /// Registry group the artifact belongs to
    pub model_package_group: String,
    /// Version to report for remote models instead of the store's version id
    pub version_override: Option<String>,
    /// Local cache file
    pub cache_path: PathBuf,
    /// Bound on each fetch attempt
    pub fetch_timeout: Duration,
    /// Attempts for transient fetch failures (at least one)
    pub fetch_attempts: u32,
    /// Backoff before the second attempt, doubled afterwards
    pub initial_backoff: Duration,
    /// Maximum artifact size in bytes
    pub max_model_size: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            model_key: default_model_key(DEFAULT_MODEL_PACKAGE_GROUP),
            model_package_group: DEFAULT_MODEL_PACKAGE_GROUP.to_string(),
            version_override: None,
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            fetch_timeout: Duration::from_secs(10),
            fetch_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            max_model_size: 256 * 1024 * 1024, // 256MB
        }
    }
}
