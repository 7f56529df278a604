//! Artifact stores the provider can fetch models from
//!
//! `HttpArtifactStore` speaks plain S3-compatible object GETs (public,
//! presigned-proxy or MinIO style endpoints); `FileArtifactStore` serves keys
//! from a local directory for development and tests.

use crate::error::FetchError;
use crate::models::RegistryManifest;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Raw artifact as fetched from a store
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    /// Store-assigned version identifier, when the store exposes one
    pub version_id: Option<String>,
}

/// Key of the registry manifest published next to `key`
pub fn manifest_key(key: &str) -> String {
    format!("{}.manifest.json", key)
}

/// Source of model artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch the artifact stored under `key`, refusing anything larger than
    /// `max_bytes` before it is read into memory
    async fn fetch(&self, key: &str, max_bytes: usize) -> Result<Artifact, FetchError>;

    /// Fetch registry metadata for `key`; `None` when none is published
    async fn fetch_manifest(&self, _key: &str) -> Result<Option<RegistryManifest>, FetchError> {
        Ok(None)
    }

    /// Human-readable location, used in logs
    fn describe(&self, key: &str) -> String;
}

fn too_large(key: &str, limit: usize) -> FetchError {
    FetchError::TooLarge {
        key: key.to_string(),
        limit,
    }
}

fn parse_manifest(bytes: &[u8], key: &str) -> Result<RegistryManifest, FetchError> {
    serde_json::from_slice(bytes).map_err(|e| FetchError::Manifest(format!("{}: {}", key, e)))
}

/// S3-compatible HTTP object store
pub struct HttpArtifactStore {
    client: Client,
    endpoint: Url,
}

impl HttpArtifactStore {
    /// Create a store rooted at `endpoint` (for example
    /// `https://my-bucket.s3.ap-southeast-1.amazonaws.com`)
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let mut endpoint = endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let endpoint = Url::parse(&endpoint).context("Invalid model store endpoint")?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, endpoint })
    }

    /// Virtual-hosted S3 endpoint for a bucket
    pub fn s3_endpoint(bucket: &str, region: &str) -> String {
        format!("https://{}.s3.{}.amazonaws.com", bucket, region)
    }

    fn object_url(&self, key: &str) -> Result<Url, FetchError> {
        self.endpoint
            .join(key.trim_start_matches('/'))
            .map_err(|e| FetchError::Transport(format!("invalid object key {}: {}", key, e)))
    }

    async fn get(&self, key: &str) -> Result<reqwest::Response, FetchError> {
        let url = self.object_url(key)?;
        debug!(url = %url, "Fetching object");
        let response = self.client.get(url).send().await?;

        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(key.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FetchError::PermissionDenied(key.to_string()))
            }
            s => Err(FetchError::Status {
                status: s.as_u16(),
                key: key.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn fetch(&self, key: &str, max_bytes: usize) -> Result<Artifact, FetchError> {
        let mut response = self.get(key).await?;
        if response
            .content_length()
            .is_some_and(|len| len > max_bytes as u64)
        {
            return Err(too_large(key, max_bytes));
        }

        let headers = response.headers();
        let version_id = headers
            .get("x-amz-version-id")
            .or_else(|| headers.get(reqwest::header::ETAG))
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| !v.is_empty() && v != "null");

        // Chunked responses carry no Content-Length
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(too_large(key, max_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(Artifact { bytes, version_id })
    }

    async fn fetch_manifest(&self, key: &str) -> Result<Option<RegistryManifest>, FetchError> {
        let manifest_key = manifest_key(key);
        // S3 answers 403 for missing keys when the caller cannot list the bucket
        match self.get(&manifest_key).await {
            Ok(response) => {
                let bytes = response.bytes().await?;
                parse_manifest(&bytes, &manifest_key).map(Some)
            }
            Err(FetchError::NotFound(_)) | Err(FetchError::PermissionDenied(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn describe(&self, key: &str) -> String {
        self.object_url(key)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("{}{}", self.endpoint, key))
    }
}

/// Directory-backed store; keys are relative paths under `root`
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

fn map_io_error(e: std::io::Error, key: &str) -> FetchError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FetchError::NotFound(key.to_string()),
        std::io::ErrorKind::PermissionDenied => FetchError::PermissionDenied(key.to_string()),
        _ => FetchError::Io(e),
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn fetch(&self, key: &str, max_bytes: usize) -> Result<Artifact, FetchError> {
        let path = self.path_for(key);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_io_error(e, key))?;
        if metadata.len() > max_bytes as u64 {
            return Err(too_large(key, max_bytes));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| map_io_error(e, key))?;
        Ok(Artifact {
            bytes,
            version_id: None,
        })
    }

    async fn fetch_manifest(&self, key: &str) -> Result<Option<RegistryManifest>, FetchError> {
        let manifest_key = manifest_key(key);
        match tokio::fs::read(self.path_for(&manifest_key)).await {
            Ok(bytes) => parse_manifest(&bytes, &manifest_key).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io_error(e, &manifest_key)),
        }
    }

    fn describe(&self, key: &str) -> String {
        format!("file://{}", self.path_for(key).display())
    }
}
