//! Prediction service: validation, encoding, scoring and response shaping

use super::{FeatureEncoder, Model};
use crate::error::{PredictionError, ValidationError};
use crate::models::{
    ClassProbabilities, FeatureVector, ModelSource, PredictionRequest, PredictionResponse,
    RawPredictionRequest, SensitivityClass,
};
use crate::observability::{ServiceMetrics, StructuredLogger};
use crate::provider::ModelProvider;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Allowed drift of a probability sum from 1.0 before renormalizing
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

pub struct PredictionService {
    provider: Arc<ModelProvider>,
    encoder: FeatureEncoder,
    metrics: ServiceMetrics,
    logger: StructuredLogger,
}

impl PredictionService {
    pub fn new(provider: Arc<ModelProvider>) -> Self {
        Self {
            provider,
            encoder: FeatureEncoder::default(),
            metrics: ServiceMetrics::new(),
            logger: StructuredLogger::new("price-predictor"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn provider(&self) -> &Arc<ModelProvider> {
        &self.provider
    }

    /// Validate and score a request as received on the wire
    pub async fn predict_raw(
        &self,
        raw: RawPredictionRequest,
    ) -> Result<PredictionResponse, PredictionError> {
        let request = PredictionRequest::try_from(raw).map_err(|e| self.reject(e.into()))?;
        self.predict(&request).await
    }

    /// Score one request
    pub async fn predict(
        &self,
        request: &PredictionRequest,
    ) -> Result<PredictionResponse, PredictionError> {
        let start = Instant::now();
        let features = self
            .encoder
            .encode(request)
            .map_err(|e| self.reject(e.into()))?;

        let loaded = self.provider.get_loaded().await;
        let source = source_label(loaded.info.source);
        let response = score(loaded.model.as_ref(), &features, &loaded.info.version)
            .map_err(|e| self.inference_failed(e, &loaded.info.version, source))?;

        let elapsed = start.elapsed();
        self.metrics.observe_prediction_latency(elapsed.as_secs_f64());
        self.metrics.inc_predictions(response.prediction.label(), source);
        self.logger.log_prediction(
            response.prediction.label(),
            response.confidence,
            &response.model_version,
            source,
            elapsed.as_micros() as u64,
        );

        Ok(response)
    }

    /// Score a batch, failing the whole batch on the first invalid item.
    ///
    /// All items are validated and encoded before any scoring happens.
    pub async fn predict_batch(
        &self,
        items: Vec<RawPredictionRequest>,
    ) -> Result<Vec<PredictionResponse>, PredictionError> {
        let start = Instant::now();
        self.metrics.observe_batch_size(items.len());
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let encoded = items
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                PredictionRequest::try_from(raw)
                    .and_then(|request| self.encoder.encode(&request))
                    .map_err(|source| PredictionError::BatchItem { index, source })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.reject(e))?;

        // One model for the whole batch, even if a reload lands midway
        let loaded = self.provider.get_loaded().await;
        let source = source_label(loaded.info.source);

        let mut responses = Vec::with_capacity(encoded.len());
        for features in &encoded {
            let response = score(loaded.model.as_ref(), features, &loaded.info.version)
                .map_err(|e| self.inference_failed(e, &loaded.info.version, source))?;
            self.metrics.inc_predictions(response.prediction.label(), source);
            responses.push(response);
        }

        let elapsed = start.elapsed();
        self.metrics.observe_prediction_latency(elapsed.as_secs_f64());
        self.logger
            .log_batch(responses.len(), &loaded.info.version, elapsed.as_micros() as u64);
        Ok(responses)
    }

    /// Parse untyped batch items so a malformed item is reported by index
    pub fn parse_batch(
        values: Vec<serde_json::Value>,
    ) -> Result<Vec<RawPredictionRequest>, PredictionError> {
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::from_value(value).map_err(|e| PredictionError::BatchItem {
                    index,
                    source: ValidationError::Malformed(e.to_string()),
                })
            })
            .collect()
    }

    fn reject(&self, err: PredictionError) -> PredictionError {
        self.metrics.inc_prediction_errors(err.kind());
        err
    }

    fn inference_failed(&self, err: anyhow::Error, version: &str, source: &str) -> PredictionError {
        error!(
            error = %format!("{:#}", err),
            model_version = %version,
            model_source = %source,
            "Inference failed"
        );
        let err = PredictionError::Inference(format!("{:#}", err));
        self.metrics.inc_prediction_errors(err.kind());
        err
    }
}

fn source_label(source: Option<ModelSource>) -> &'static str {
    source.map(|s| s.as_str()).unwrap_or("unknown")
}

/// Run the model and shape its output into a response
fn score(
    model: &dyn Model,
    features: &FeatureVector,
    version: &str,
) -> anyhow::Result<PredictionResponse> {
    let (predicted, raw) = model.predict_with_proba(features)?;
    let probabilities = match raw {
        Some(raw) => normalize(raw)?,
        None => one_hot(predicted),
    };

    let prediction = resolve_label(predicted, &probabilities);
    if prediction != predicted {
        warn!(
            model_label = %predicted,
            resolved_label = %prediction,
            model_version = %version,
            "Model label disagrees with its probabilities, using argmax"
        );
    }

    Ok(PredictionResponse {
        prediction,
        probability: SensitivityClass::ALL
            .iter()
            .map(|class| (*class, probabilities[class.index()]))
            .collect(),
        confidence: probabilities[prediction.index()],
        model_version: version.to_string(),
    })
}

/// Check a probability triple and rescale it to sum to one
fn normalize(raw: ClassProbabilities) -> anyhow::Result<ClassProbabilities> {
    if let Some(bad) = raw.iter().find(|p| !p.is_finite() || **p < 0.0) {
        anyhow::bail!("Model returned invalid probability {}", bad);
    }

    let sum: f64 = raw.iter().sum();
    if sum <= 0.0 {
        anyhow::bail!("Model returned probabilities summing to {}", sum);
    }

    if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
        Ok(raw.map(|p| p / sum))
    } else {
        Ok(raw)
    }
}

fn one_hot(class: SensitivityClass) -> ClassProbabilities {
    let mut probabilities = [0.0; 3];
    probabilities[class.index()] = 1.0;
    probabilities
}

/// Class with the highest probability; ties go to the model's own label,
/// then to the lowest index
fn resolve_label(
    predicted: SensitivityClass,
    probabilities: &ClassProbabilities,
) -> SensitivityClass {
    let max = probabilities.iter().copied().fold(f64::MIN, f64::max);
    if probabilities[predicted.index()] >= max {
        return predicted;
    }
    SensitivityClass::ALL
        .into_iter()
        .find(|class| probabilities[class.index()] >= max)
        .unwrap_or(predicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::{ModelLoader, FALLBACK_VERSION};
    use crate::provider::{FileArtifactStore, ProviderConfig};
    use anyhow::Result;
    use tempfile::TempDir;

    const KEY: &str = "model.onnx";

    /// Model with canned answers
    struct CannedModel {
        label: SensitivityClass,
        probabilities: Option<ClassProbabilities>,
    }

    impl Model for CannedModel {
        fn predict(&self, _features: &FeatureVector) -> Result<SensitivityClass> {
            Ok(self.label)
        }

        fn predict_proba(&self, _features: &FeatureVector) -> Result<Option<ClassProbabilities>> {
            Ok(self.probabilities)
        }
    }

    /// Model that only answers through the combined call
    struct SinglePassModel;

    impl Model for SinglePassModel {
        fn predict(&self, _features: &FeatureVector) -> Result<SensitivityClass> {
            anyhow::bail!("separate label call")
        }

        fn predict_proba(&self, _features: &FeatureVector) -> Result<Option<ClassProbabilities>> {
            anyhow::bail!("separate probability call")
        }

        fn predict_with_proba(
            &self,
            _features: &FeatureVector,
        ) -> Result<(SensitivityClass, Option<ClassProbabilities>)> {
            Ok((SensitivityClass::Low, Some([0.8, 0.15, 0.05])))
        }
    }

    struct FixedLoader(Arc<dyn Model>);

    impl ModelLoader for FixedLoader {
        fn load(&self, _bytes: &[u8]) -> Result<Arc<dyn Model>> {
            Ok(self.0.clone())
        }
    }

    fn config(dir: &TempDir) -> ProviderConfig {
        ProviderConfig {
            model_key: KEY.to_string(),
            cache_path: dir.path().join("cache").join("model.onnx"),
            ..Default::default()
        }
    }

    /// Service backed by an empty store, so the fallback model serves
    fn fallback_service(dir: &TempDir) -> PredictionService {
        let store = Arc::new(FileArtifactStore::new(dir.path().join("store")));
        let provider = Arc::new(ModelProvider::with_onnx(config(dir), store));
        PredictionService::new(provider)
    }

    /// Service whose remote artifact loads as `model`
    fn remote_service(dir: &TempDir, model: impl Model + 'static) -> PredictionService {
        std::fs::write(dir.path().join(KEY), b"artifact").unwrap();
        let store = Arc::new(FileArtifactStore::new(dir.path()));
        let loader = Arc::new(FixedLoader(Arc::new(model)));
        let provider = Arc::new(ModelProvider::new(config(dir), store, loader));
        PredictionService::new(provider)
    }

    fn sample_request() -> PredictionRequest {
        PredictionRequest {
            basket_size: "L".to_string(),
            basket_type: "Full Shop".to_string(),
            store_region: "E02".to_string(),
            store_format: "LS".to_string(),
            spend: 125.5,
            quantity: 15,
            prod_code_20: "DEP00053".to_string(),
            prod_code_30: "G00016".to_string(),
        }
    }

    fn raw_sample() -> RawPredictionRequest {
        serde_json::from_value(serde_json::to_value(sample_request()).unwrap()).unwrap()
    }

    fn assert_probability_contract(response: &PredictionResponse) {
        assert_eq!(response.probability.len(), 3);
        let sum: f64 = response.probability.values().sum();
        assert!((sum - 1.0).abs() <= PROBABILITY_TOLERANCE, "sum {}", sum);
        for p in response.probability.values() {
            assert!((0.0..=1.0).contains(p));
        }
        let max = response.probability.values().copied().fold(f64::MIN, f64::max);
        assert_eq!(response.confidence, max);
        assert_eq!(response.probability[&response.prediction], max);
    }

    #[tokio::test]
    async fn test_fallback_end_to_end_medium() {
        let dir = TempDir::new().unwrap();
        let service = fallback_service(&dir);

        let response = service.predict(&sample_request()).await.unwrap();
        assert_eq!(response.prediction, SensitivityClass::Medium);
        assert_eq!(response.probability[&SensitivityClass::Low], 0.2);
        assert_eq!(response.probability[&SensitivityClass::Medium], 0.6);
        assert_eq!(response.probability[&SensitivityClass::High], 0.2);
        assert_eq!(response.confidence, 0.6);
        assert_eq!(response.model_version, FALLBACK_VERSION);
        assert_probability_contract(&response);
    }

    #[tokio::test]
    async fn test_fallback_spend_boundaries() {
        let dir = TempDir::new().unwrap();
        let service = fallback_service(&dir);

        for (spend, expected) in [
            (49.99, SensitivityClass::High),
            (50.01, SensitivityClass::Medium),
            (149.99, SensitivityClass::Medium),
            (150.01, SensitivityClass::Low),
        ] {
            let request = PredictionRequest {
                spend,
                ..sample_request()
            };
            let response = service.predict(&request).await.unwrap();
            assert_eq!(response.prediction, expected, "spend {}", spend);
            assert_probability_contract(&response);
        }
    }

    #[tokio::test]
    async fn test_missing_field_names_field() {
        let dir = TempDir::new().unwrap();
        let service = fallback_service(&dir);

        let raw = RawPredictionRequest {
            store_region: None,
            ..raw_sample()
        };
        let err = service.predict_raw(raw).await.unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(err.validation().and_then(|v| v.field()), Some("STORE_REGION"));
    }

    #[tokio::test]
    async fn test_negative_spend_rejected() {
        let dir = TempDir::new().unwrap();
        let service = fallback_service(&dir);

        let request = PredictionRequest {
            spend: -1.0,
            ..sample_request()
        };
        let err = service.predict(&request).await.unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(err.validation().and_then(|v| v.field()), Some("SPEND"));
    }

    #[tokio::test]
    async fn test_unnormalized_probabilities_rescaled() {
        let dir = TempDir::new().unwrap();
        let service = remote_service(
            &dir,
            CannedModel {
                label: SensitivityClass::High,
                probabilities: Some([1.0, 1.0, 2.0]),
            },
        );

        let response = service.predict(&sample_request()).await.unwrap();
        assert_eq!(response.prediction, SensitivityClass::High);
        assert_eq!(response.confidence, 0.5);
        assert_probability_contract(&response);
    }

    #[tokio::test]
    async fn test_label_follows_probabilities() {
        let dir = TempDir::new().unwrap();
        let service = remote_service(
            &dir,
            CannedModel {
                label: SensitivityClass::Low,
                probabilities: Some([0.1, 0.7, 0.2]),
            },
        );

        let response = service.predict(&sample_request()).await.unwrap();
        assert_eq!(response.prediction, SensitivityClass::Medium);
        assert_probability_contract(&response);
    }

    #[tokio::test]
    async fn test_tie_prefers_model_label() {
        let dir = TempDir::new().unwrap();
        let service = remote_service(
            &dir,
            CannedModel {
                label: SensitivityClass::High,
                probabilities: Some([0.4, 0.2, 0.4]),
            },
        );

        let response = service.predict(&sample_request()).await.unwrap();
        assert_eq!(response.prediction, SensitivityClass::High);
        assert_probability_contract(&response);
    }

    #[tokio::test]
    async fn test_missing_probabilities_synthesized() {
        let dir = TempDir::new().unwrap();
        let service = remote_service(
            &dir,
            CannedModel {
                label: SensitivityClass::Low,
                probabilities: None,
            },
        );

        let response = service.predict(&sample_request()).await.unwrap();
        assert_eq!(response.prediction, SensitivityClass::Low);
        assert_eq!(response.confidence, 1.0);
        assert_eq!(response.probability[&SensitivityClass::Medium], 0.0);
        assert_probability_contract(&response);
    }

    #[tokio::test]
    async fn test_invalid_probabilities_are_inference_errors() {
        let dir = TempDir::new().unwrap();
        let service = remote_service(
            &dir,
            CannedModel {
                label: SensitivityClass::Low,
                probabilities: Some([f64::NAN, 0.5, 0.5]),
            },
        );

        let err = service.predict(&sample_request()).await.unwrap_err();
        assert!(!err.is_client_error());
        assert!(matches!(err, PredictionError::Inference(_)));
    }

    #[tokio::test]
    async fn test_model_scored_in_one_pass() {
        let dir = TempDir::new().unwrap();
        let service = remote_service(&dir, SinglePassModel);

        let response = service.predict(&sample_request()).await.unwrap();
        assert_eq!(response.prediction, SensitivityClass::Low);
        assert_eq!(response.confidence, 0.8);
        assert_probability_contract(&response);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let dir = TempDir::new().unwrap();
        let service = fallback_service(&dir);

        let spends = [10.0, 100.0, 200.0];
        let items = spends
            .iter()
            .map(|spend| RawPredictionRequest {
                spend: Some(*spend),
                ..raw_sample()
            })
            .collect();

        let responses = service.predict_batch(items).await.unwrap();
        let classes: Vec<_> = responses.iter().map(|r| r.prediction).collect();
        assert_eq!(
            classes,
            vec![SensitivityClass::High, SensitivityClass::Medium, SensitivityClass::Low]
        );
    }

    #[tokio::test]
    async fn test_batch_fails_fast_on_missing_field() {
        let dir = TempDir::new().unwrap();
        let service = fallback_service(&dir);

        let items = vec![
            raw_sample(),
            RawPredictionRequest {
                quantity: None,
                ..raw_sample()
            },
            raw_sample(),
        ];

        let err = service.predict_batch(items).await.unwrap_err();
        match err {
            PredictionError::BatchItem { index, ref source } => {
                assert_eq!(index, 1);
                assert_eq!(source.field(), Some("QUANTITY"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = TempDir::new().unwrap();
        let service = fallback_service(&dir);
        assert!(service.predict_batch(Vec::new()).await.unwrap().is_empty());
    }

    #[test]
    fn test_parse_batch_reports_malformed_index() {
        let values = vec![
            serde_json::to_value(sample_request()).unwrap(),
            serde_json::json!({"SPEND": "lots"}),
        ];
        let err = PredictionService::parse_batch(values).unwrap_err();
        assert!(matches!(
            err,
            PredictionError::BatchItem {
                index: 1,
                source: ValidationError::Malformed(_)
            }
        ));
    }

    #[test]
    fn test_normalize_rejects_zero_sum() {
        assert!(normalize([0.0, 0.0, 0.0]).is_err());
        assert!(normalize([-0.1, 0.6, 0.5]).is_err());
        assert_eq!(normalize([0.2, 0.6, 0.2]).unwrap(), [0.2, 0.6, 0.2]);
    }
}
