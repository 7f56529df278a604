//! Local artifact cache
//!
//! A single file holding the last artifact fetched from the store. Its
//! presence means the active model came from the store.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default cache location
pub const DEFAULT_CACHE_PATH: &str = "/tmp/model.onnx";

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    path: PathBuf,
}

impl ArtifactCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Size of the cached artifact, if one is present
    pub fn size_bytes(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.len())
    }

    /// Write the artifact atomically (temp file, fsync, rename)
    pub fn save(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp model file {:?}", temp_path))?;

        file.write_all(bytes)
            .context("Failed to write model artifact")?;
        file.sync_all()
            .context("Failed to sync model file")?;

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, self.path))?;

        debug!(path = %self.path.display(), size = bytes.len(), "Cached model artifact");
        Ok(())
    }

    /// Delete the cached artifact. Returns whether a file was removed.
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove cached model {:?}", self.path))
            }
        }
    }
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
