//! Model lifecycle: `Unloaded -> Loading -> Loaded{remote|fallback}`
//!
//! Reads go through an `RwLock` and never wait once a model is loaded. The
//! load and reload transitions are serialized by a mutex, so concurrent cold
//! requests share one fetch and a reload never overlaps a load.

use super::cache::{compute_checksum, ArtifactCache};
use super::store::{Artifact, ArtifactStore};
use super::ProviderConfig;
use crate::error::FetchError;
use crate::models::{ModelInfo, ModelSource, RegistryManifest, SensitivityClass, FEATURE_NAMES};
use crate::observability::{ServiceMetrics, StructuredLogger};
use crate::predictor::{FallbackModel, Model, ModelLoader, OnnxModelLoader, FALLBACK_VERSION};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

/// Externally visible provider state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Unloaded,
    Loading,
    Loaded(ModelSource),
}

/// A usable model together with the metadata describing it
#[derive(Clone)]
pub struct LoadedModel {
    pub model: Arc<dyn Model>,
    pub info: ModelInfo,
}

enum ModelState {
    Unloaded,
    Loading,
    Loaded(LoadedModel),
}

/// Owns the active model and its load/reload lifecycle
pub struct ModelProvider {
    config: ProviderConfig,
    store: Arc<dyn ArtifactStore>,
    loader: Arc<dyn ModelLoader>,
    cache: ArtifactCache,
    state: RwLock<ModelState>,
    load_lock: Mutex<()>,
    metrics: ServiceMetrics,
    logger: StructuredLogger,
}

impl ModelProvider {
    pub fn new(
        config: ProviderConfig,
        store: Arc<dyn ArtifactStore>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        let cache = ArtifactCache::new(config.cache_path.clone());
        Self {
            config,
            store,
            loader,
            cache,
            state: RwLock::new(ModelState::Unloaded),
            load_lock: Mutex::new(()),
            metrics: ServiceMetrics::new(),
            logger: StructuredLogger::new("price-predictor"),
        }
    }

    /// Provider that deserializes ONNX artifacts
    pub fn with_onnx(config: ProviderConfig, store: Arc<dyn ArtifactStore>) -> Self {
        Self::new(config, store, Arc::new(OnnxModelLoader))
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub async fn state(&self) -> ProviderState {
        match &*self.state.read().await {
            ModelState::Unloaded => ProviderState::Unloaded,
            ModelState::Loading => ProviderState::Loading,
            ModelState::Loaded(loaded) => ProviderState::Loaded(
                loaded.info.source.unwrap_or(ModelSource::Fallback),
            ),
        }
    }

    /// The active model; loads it first if necessary. Never fails: any load
    /// problem yields the fallback model.
    pub async fn get_model(&self) -> Arc<dyn Model> {
        self.get_loaded().await.model
    }

    /// The active model and its metadata, read together
    pub async fn get_loaded(&self) -> LoadedModel {
        if let Some(loaded) = self.current().await {
            return loaded;
        }

        let _guard = self.load_lock.lock().await;
        // Another caller may have finished the load while we waited
        if let Some(loaded) = self.current().await {
            return loaded;
        }
        *self.state.write().await = ModelState::Loading;
        self.load_locked().await
    }

    /// Metadata for the active model; reports `loaded: false` before the
    /// first load completes
    pub async fn get_model_info(&self) -> ModelInfo {
        match &*self.state.read().await {
            ModelState::Loaded(loaded) => loaded.info.clone(),
            ModelState::Unloaded | ModelState::Loading => self.base_info(),
        }
    }

    /// Drop the cached artifact and load again. The previous model keeps
    /// serving until the replacement is ready.
    pub async fn reload(&self) -> ModelInfo {
        let _guard = self.load_lock.lock().await;
        let old_version = self.get_model_info().await.version;

        if let Err(e) = self.cache.remove() {
            warn!(error = %e, "Failed to remove cached artifact before reload");
        }

        let loaded = self.load_locked().await;
        self.logger.log_model_reloaded(
            &old_version,
            &loaded.info.version,
            loaded.info.source.map(|s| s.as_str()).unwrap_or("unknown"),
        );
        loaded.info
    }

    async fn current(&self) -> Option<LoadedModel> {
        match &*self.state.read().await {
            ModelState::Loaded(loaded) => Some(loaded.clone()),
            _ => None,
        }
    }

    /// Runs the load sequence and swaps the result in. Caller must hold
    /// `load_lock`.
    async fn load_locked(&self) -> LoadedModel {
        let start = Instant::now();

        let loaded = match self.load_remote().await {
            Ok(loaded) => {
                self.logger.log_model_loaded(
                    ModelSource::Remote.as_str(),
                    &loaded.info.version,
                    &self.store.describe(&self.config.model_key),
                    loaded.info.model_size_bytes.unwrap_or(0),
                    start.elapsed().as_millis() as u64,
                );
                loaded
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                self.logger
                    .log_model_fallback(&self.store.describe(&self.config.model_key), &reason);
                if let Err(e) = self.cache.remove() {
                    error!(error = %e, "Failed to remove stale cached artifact");
                }
                self.fallback(reason)
            }
        };

        let source = loaded.info.source.unwrap_or(ModelSource::Fallback);
        self.metrics.observe_model_load(source.as_str(), start.elapsed().as_secs_f64());
        self.metrics.set_model_version(&loaded.info.version, source.as_str());

        *self.state.write().await = ModelState::Loaded(loaded.clone());
        loaded
    }

    async fn load_remote(&self) -> Result<LoadedModel> {
        let key = self.config.model_key.clone();
        let location = self.store.describe(&key);

        let artifact = self
            .fetch_with_retry(&key)
            .await
            .with_context(|| format!("Failed to fetch model from {}", location))?;

        let manifest = self
            .with_timeout(self.store.fetch_manifest(&key))
            .await
            .context("Failed to fetch registry manifest")?;
        let registry = match manifest {
            Some(manifest) => Some(self.check_manifest(manifest)?),
            None => None,
        };

        let Artifact { bytes, version_id } = artifact;
        self.cache.save(&bytes)?;

        let size = bytes.len() as u64;
        let checksum = compute_checksum(&bytes);
        let loader = Arc::clone(&self.loader);
        let model = tokio::task::spawn_blocking(move || loader.load(&bytes))
            .await
            .context("Model load task failed")?
            .context("Failed to deserialize model artifact")?;

        let version = self
            .config
            .version_override
            .clone()
            .or(version_id)
            .unwrap_or_else(|| "unknown".to_string());

        debug!(version = %version, checksum = %checksum, "Remote model ready");

        Ok(LoadedModel {
            model,
            info: ModelInfo {
                loaded: true,
                source: Some(ModelSource::Remote),
                version,
                model_size_bytes: Some(size),
                checksum: Some(checksum),
                loaded_at: Some(chrono::Utc::now().to_rfc3339()),
                registry,
                ..self.base_info()
            },
        })
    }

    async fn fetch_with_retry(&self, key: &str) -> Result<Artifact, FetchError> {
        let attempts = self.config.fetch_attempts.max(1);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;

        loop {
            let fetch = self.store.fetch(key, self.config.max_model_size);
            match self.with_timeout(fetch).await {
                Ok(artifact) => return Ok(artifact),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        attempt = attempt,
                        max_attempts = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Artifact fetch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, FetchError>>,
    ) -> Result<T, FetchError> {
        tokio::time::timeout(self.config.fetch_timeout, fut)
            .await
            .unwrap_or(Err(FetchError::Timeout(self.config.fetch_timeout)))
    }

    /// Reject artifacts whose declared feature or class layout differs from
    /// the encoder's
    fn check_manifest(
        &self,
        mut manifest: RegistryManifest,
    ) -> Result<RegistryManifest, FetchError> {
        if !manifest.feature_names.is_empty() && manifest.feature_names != FEATURE_NAMES {
            return Err(FetchError::Manifest(format!(
                "feature order {:?} does not match {:?}",
                manifest.feature_names, FEATURE_NAMES
            )));
        }

        let labels: Vec<&str> = SensitivityClass::ALL.iter().map(|c| c.label()).collect();
        if !manifest.class_labels.is_empty() && manifest.class_labels != labels {
            return Err(FetchError::Manifest(format!(
                "class labels {:?} do not match {:?}",
                manifest.class_labels, labels
            )));
        }

        if manifest.model_package_group.is_none() {
            manifest.model_package_group = Some(self.config.model_package_group.clone());
        }
        Ok(manifest)
    }

    fn fallback(&self, reason: String) -> LoadedModel {
        LoadedModel {
            model: Arc::new(FallbackModel),
            info: ModelInfo {
                loaded: true,
                source: Some(ModelSource::Fallback),
                version: FALLBACK_VERSION.to_string(),
                loaded_at: Some(chrono::Utc::now().to_rfc3339()),
                last_error: Some(reason),
                ..self.base_info()
            },
        }
    }

    fn base_info(&self) -> ModelInfo {
        ModelInfo {
            loaded: false,
            source: None,
            version: "unknown".to_string(),
            bucket: self.config.bucket.clone(),
            key: self.config.model_key.clone(),
            local_path: self.cache.path().display().to_string(),
            model_size_bytes: None,
            checksum: None,
            loaded_at: None,
            registry: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClassProbabilities, FeatureVector};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const KEY: &str = "models/test/model.onnx";

    /// Model that always answers with one class
    struct ConstantModel(SensitivityClass);

    impl Model for ConstantModel {
        fn predict(&self, _features: &FeatureVector) -> Result<SensitivityClass> {
            Ok(self.0)
        }

        fn predict_proba(&self, _features: &FeatureVector) -> Result<Option<ClassProbabilities>> {
            let mut p = [0.0; 3];
            p[self.0.index()] = 1.0;
            Ok(Some(p))
        }
    }

    /// Parses artifacts of the form `class:<index>`
    struct TextLoader;

    impl ModelLoader for TextLoader {
        fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Model>> {
            let text = std::str::from_utf8(bytes)?;
            let index: usize = text
                .strip_prefix("class:")
                .context("not a test artifact")?
                .trim()
                .parse()?;
            let class = SensitivityClass::from_index(index).context("bad class")?;
            Ok(Arc::new(ConstantModel(class)))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        objects: std::sync::Mutex<HashMap<String, Vec<u8>>>,
        manifest: std::sync::Mutex<Option<RegistryManifest>>,
        fetches: AtomicUsize,
        transient_failures: AtomicUsize,
        delay: Duration,
    }

    impl MemoryStore {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn put(&self, key: &str, bytes: &[u8]) {
            self.objects.lock().unwrap().insert(key.to_string(), bytes.to_vec());
        }

        fn clear(&self) {
            self.objects.lock().unwrap().clear();
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ArtifactStore for MemoryStore {
        async fn fetch(&self, key: &str, max_bytes: usize) -> Result<Artifact, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FetchError::Transport("connection reset".to_string()));
            }
            let bytes = self
                .objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(key.to_string()))?;
            if bytes.len() > max_bytes {
                return Err(FetchError::TooLarge {
                    key: key.to_string(),
                    limit: max_bytes,
                });
            }
            Ok(Artifact {
                bytes,
                version_id: Some("v-42".to_string()),
            })
        }

        async fn fetch_manifest(&self, _key: &str) -> Result<Option<RegistryManifest>, FetchError> {
            Ok(self.manifest.lock().unwrap().clone())
        }

        fn describe(&self, key: &str) -> String {
            format!("memory://{}", key)
        }
    }

    fn test_config(dir: &TempDir) -> ProviderConfig {
        ProviderConfig {
            model_key: KEY.to_string(),
            cache_path: dir.path().join("model.onnx"),
            fetch_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn provider(config: ProviderConfig, store: Arc<MemoryStore>) -> ModelProvider {
        ModelProvider::new(config, store, Arc::new(TextLoader))
    }

    fn sample_features() -> FeatureVector {
        FeatureVector([1.0, 1.0, 1.0, 1.0, 125.5, 15.0, 1.0, 1.0])
    }

    #[tokio::test]
    async fn test_initial_state_unloaded() {
        let dir = TempDir::new().unwrap();
        let provider = provider(test_config(&dir), Arc::new(MemoryStore::default()));

        assert_eq!(provider.state().await, ProviderState::Unloaded);
        let info = provider.get_model_info().await;
        assert!(!info.loaded);
        assert!(info.source.is_none());
    }

    #[tokio::test]
    async fn test_missing_artifact_uses_fallback() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let provider = provider(test_config(&dir), store.clone());

        let model = provider.get_model().await;
        assert_eq!(model.predict(&sample_features()).unwrap(), SensitivityClass::Medium);

        let info = provider.get_model_info().await;
        assert!(info.loaded);
        assert_eq!(info.source, Some(ModelSource::Fallback));
        assert_eq!(info.version, FALLBACK_VERSION);
        assert!(info.last_error.unwrap().contains("not found"));
        assert!(!dir.path().join("model.onnx").exists());
        assert_eq!(provider.state().await, ProviderState::Loaded(ModelSource::Fallback));
        // Not-found is not retried
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn test_remote_artifact_loaded_and_cached() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"class:2");
        let provider = provider(test_config(&dir), store);

        let model = provider.get_model().await;
        assert_eq!(model.predict(&sample_features()).unwrap(), SensitivityClass::High);

        let info = provider.get_model_info().await;
        assert_eq!(info.source, Some(ModelSource::Remote));
        assert_eq!(info.version, "v-42");
        assert_eq!(info.model_size_bytes, Some(7));
        assert_eq!(info.checksum, Some(compute_checksum(b"class:2")));
        assert!(info.last_error.is_none());
        assert!(dir.path().join("model.onnx").exists());
    }

    #[tokio::test]
    async fn test_version_override_applies_to_remote_only() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"class:0");
        let config = ProviderConfig {
            version_override: Some("1.0.0".to_string()),
            ..test_config(&dir)
        };
        let provider = provider(config, store.clone());

        assert_eq!(provider.get_model_info().await.version, "unknown");
        provider.get_model().await;
        assert_eq!(provider.get_model_info().await.version, "1.0.0");

        store.clear();
        let info = provider.reload().await;
        assert_eq!(info.version, FALLBACK_VERSION);
    }

    #[tokio::test]
    async fn test_undeserializable_artifact_uses_fallback() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"garbage");
        let provider = provider(test_config(&dir), store);

        provider.get_model().await;
        let info = provider.get_model_info().await;
        assert_eq!(info.source, Some(ModelSource::Fallback));
        assert!(info.last_error.unwrap().contains("deserialize"));
        assert!(!dir.path().join("model.onnx").exists());
    }

    #[tokio::test]
    async fn test_oversized_artifact_uses_fallback() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"class:1");
        let config = ProviderConfig {
            max_model_size: 4,
            ..test_config(&dir)
        };
        let provider = provider(config, store.clone());

        provider.get_model().await;
        assert_eq!(provider.state().await, ProviderState::Loaded(ModelSource::Fallback));
        assert_eq!(store.fetches(), 1);
        let info = provider.get_model_info().await;
        assert!(info.last_error.unwrap().contains("larger than 4 bytes"));
    }

    #[tokio::test]
    async fn test_concurrent_cold_start_fetches_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(50)));
        store.put(KEY, b"class:1");
        let provider = Arc::new(provider(test_config(&dir), store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.get_loaded().await.info.version })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "v-42");
        }
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"class:0");
        store.transient_failures.store(1, Ordering::SeqCst);
        let provider = provider(test_config(&dir), store.clone());

        provider.get_model().await;
        assert_eq!(provider.state().await, ProviderState::Loaded(ModelSource::Remote));
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"class:0");
        store.transient_failures.store(5, Ordering::SeqCst);
        let provider = provider(test_config(&dir), store.clone());

        provider.get_model().await;
        assert_eq!(provider.state().await, ProviderState::Loaded(ModelSource::Fallback));
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_slow_store_times_out_to_fallback() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(500)));
        store.put(KEY, b"class:0");
        let config = ProviderConfig {
            fetch_timeout: Duration::from_millis(20),
            fetch_attempts: 1,
            ..test_config(&dir)
        };
        let provider = provider(config, store);

        provider.get_model().await;
        let info = provider.get_model_info().await;
        assert_eq!(info.source, Some(ModelSource::Fallback));
        assert!(info.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_artifact() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let provider = provider(test_config(&dir), store.clone());

        provider.get_model().await;
        assert_eq!(provider.state().await, ProviderState::Loaded(ModelSource::Fallback));

        store.put(KEY, b"class:0");
        // Without reload the cached fallback stays active
        provider.get_model().await;
        assert_eq!(store.fetches(), 1);

        let info = provider.reload().await;
        assert!(info.loaded);
        assert_eq!(info.source, Some(ModelSource::Remote));
        assert!(dir.path().join("model.onnx").exists());

        let model = provider.get_model().await;
        assert_eq!(model.predict(&sample_features()).unwrap(), SensitivityClass::Low);
    }

    #[tokio::test]
    async fn test_previous_model_serves_during_reload() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(300)));
        store.put(KEY, b"class:0");
        let provider = Arc::new(provider(test_config(&dir), store.clone()));
        provider.get_model().await;

        store.clear();
        let reloading = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.reload().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = provider.get_model_info().await;
        assert!(info.loaded);
        assert_eq!(info.source, Some(ModelSource::Remote));
        assert_eq!(provider.state().await, ProviderState::Loaded(ModelSource::Remote));

        let model = tokio::time::timeout(Duration::from_millis(100), provider.get_model())
            .await
            .expect("active model should be served while the reload is in flight");
        assert_eq!(model.predict(&sample_features()).unwrap(), SensitivityClass::Low);

        let info = reloading.await.unwrap();
        assert_eq!(info.source, Some(ModelSource::Fallback));
        assert_eq!(provider.state().await, ProviderState::Loaded(ModelSource::Fallback));
    }

    #[tokio::test]
    async fn test_reload_without_store_keeps_a_model() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"class:0");
        let provider = provider(test_config(&dir), store.clone());
        provider.get_model().await;
        assert!(dir.path().join("model.onnx").exists());

        store.clear();
        let info = provider.reload().await;
        assert!(info.loaded);
        assert_eq!(info.source, Some(ModelSource::Fallback));
        assert!(!dir.path().join("model.onnx").exists());
        assert_eq!(provider.state().await, ProviderState::Loaded(ModelSource::Fallback));
    }

    #[tokio::test]
    async fn test_matching_manifest_recorded() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"class:1");
        *store.manifest.lock().unwrap() = Some(RegistryManifest {
            approval_status: Some("Approved".to_string()),
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            class_labels: vec!["Low".into(), "Medium".into(), "High".into()],
            ..Default::default()
        });
        let provider = provider(test_config(&dir), store);

        provider.get_model().await;
        let registry = provider.get_model_info().await.registry.unwrap();
        assert_eq!(registry.approval_status.as_deref(), Some("Approved"));
        assert_eq!(registry.model_package_group.as_deref(), Some("retail-price-sensitivity"));
    }

    #[tokio::test]
    async fn test_mismatched_feature_order_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put(KEY, b"class:1");
        let mut features: Vec<String> = FEATURE_NAMES.iter().map(|s| s.to_string()).collect();
        features.swap(0, 1);
        *store.manifest.lock().unwrap() = Some(RegistryManifest {
            feature_names: features,
            ..Default::default()
        });
        let provider = provider(test_config(&dir), store);

        provider.get_model().await;
        let info = provider.get_model_info().await;
        assert_eq!(info.source, Some(ModelSource::Fallback));
        assert!(info.last_error.unwrap().contains("feature order"));
    }
}
