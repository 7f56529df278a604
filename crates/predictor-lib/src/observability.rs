//! Observability infrastructure for the prediction service
//!
//! Provides:
//! - Prometheus metrics (prediction latency, class counts, model loads, model version)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter_vec,
    register_int_gauge, Encoder, GaugeVec, Histogram, HistogramVec, IntCounterVec, IntGauge,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Model loads include a network fetch, so they get wider buckets
const LOAD_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ServiceMetricsInner> = OnceLock::new();

struct ServiceMetricsInner {
    prediction_latency_seconds: Histogram,
    predictions: IntCounterVec,
    prediction_errors: IntCounterVec,
    batch_size: Histogram,
    model_load_seconds: HistogramVec,
    model_loads: IntCounterVec,
    fallback_active: IntGauge,
    model_version_info: GaugeVec,
}

impl ServiceMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "price_predictor_prediction_latency_seconds",
                "Time spent encoding and scoring one request",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            predictions: register_int_counter_vec!(
                "price_predictor_predictions_total",
                "Predictions served, by predicted class and model source",
                &["prediction", "source"]
            )
            .expect("Failed to register predictions_total"),

            prediction_errors: register_int_counter_vec!(
                "price_predictor_prediction_errors_total",
                "Rejected or failed prediction requests, by error kind",
                &["kind"]
            )
            .expect("Failed to register prediction_errors_total"),

            batch_size: register_histogram!(
                "price_predictor_batch_size",
                "Number of items per batch request",
                vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
            )
            .expect("Failed to register batch_size"),

            model_load_seconds: register_histogram_vec!(
                "price_predictor_model_load_seconds",
                "Time spent loading the model, by resulting source",
                &["source"],
                LOAD_BUCKETS.to_vec()
            )
            .expect("Failed to register model_load_seconds"),

            model_loads: register_int_counter_vec!(
                "price_predictor_model_loads_total",
                "Completed model loads, by resulting source",
                &["source"]
            )
            .expect("Failed to register model_loads_total"),

            fallback_active: register_int_gauge!(
                "price_predictor_fallback_active",
                "1 while the rule-based fallback model is serving"
            )
            .expect("Failed to register fallback_active"),

            model_version_info: register_gauge_vec!(
                "price_predictor_model_version_info",
                "Information about the currently loaded model",
                &["version", "source"]
            )
            .expect("Failed to register model_version_info"),
        }
    }
}

/// Service metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ServiceMetrics {
    _private: (),
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ServiceMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ServiceMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn inc_predictions(&self, prediction: &str, source: &str) {
        self.inner()
            .predictions
            .with_label_values(&[prediction, source])
            .inc();
    }

    pub fn inc_prediction_errors(&self, kind: &str) {
        self.inner().prediction_errors.with_label_values(&[kind]).inc();
    }

    pub fn observe_batch_size(&self, size: usize) {
        self.inner().batch_size.observe(size as f64);
    }

    /// Record a finished load and whether the fallback is now serving
    pub fn observe_model_load(&self, source: &str, duration_secs: f64) {
        let inner = self.inner();
        inner
            .model_load_seconds
            .with_label_values(&[source])
            .observe(duration_secs);
        inner.model_loads.with_label_values(&[source]).inc();
        inner.fallback_active.set(i64::from(source == "fallback"));
    }

    /// Update model version info
    pub fn set_model_version(&self, version: &str, source: &str) {
        // Reset previous version
        self.inner().model_version_info.reset();
        self.inner()
            .model_version_info
            .with_label_values(&[version, source])
            .set(1.0);
    }
}

/// Render every registered metric in the Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Structured logger for service events
///
/// Request fields never appear in these records; only the outcome and the
/// model that produced it are logged.
#[derive(Clone)]
pub struct StructuredLogger {
    service_name: String,
}

impl StructuredLogger {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Log a prediction served to a caller
    pub fn log_prediction(
        &self,
        prediction: &str,
        confidence: f64,
        model_version: &str,
        source: &str,
        latency_us: u64,
    ) {
        info!(
            event = "prediction_generated",
            service = %self.service_name,
            prediction = %prediction,
            confidence = confidence,
            model_version = %model_version,
            model_source = %source,
            latency_us = latency_us,
            "Generated price sensitivity prediction"
        );
    }

    /// Log a completed batch
    pub fn log_batch(&self, count: usize, model_version: &str, latency_us: u64) {
        info!(
            event = "batch_prediction_generated",
            service = %self.service_name,
            count = count,
            model_version = %model_version,
            latency_us = latency_us,
            "Generated batch predictions"
        );
    }

    /// Log a remote model becoming active
    pub fn log_model_loaded(
        &self,
        source: &str,
        version: &str,
        location: &str,
        size_bytes: u64,
        duration_ms: u64,
    ) {
        info!(
            event = "model_loaded",
            service = %self.service_name,
            model_source = %source,
            model_version = %version,
            location = %location,
            size_bytes = size_bytes,
            duration_ms = duration_ms,
            "Model loaded"
        );
    }

    /// Log the fallback model being selected
    pub fn log_model_fallback(&self, location: &str, reason: &str) {
        warn!(
            event = "model_fallback",
            service = %self.service_name,
            location = %location,
            reason = %reason,
            "Model artifact unavailable, serving rule-based fallback"
        );
    }

    /// Log the outcome of an explicit reload
    pub fn log_model_reloaded(&self, old_version: &str, new_version: &str, source: &str) {
        info!(
            event = "model_reloaded",
            service = %self.service_name,
            old_version = %old_version,
            new_version = %new_version,
            model_source = %source,
            "Model reloaded"
        );
    }

    /// Log service startup
    pub fn log_startup(&self, version: &str, model_version: &str, port: u16) {
        info!(
            event = "service_started",
            service = %self.service_name,
            service_version = %version,
            model_version = %model_version,
            port = port,
            "Price sensitivity service started"
        );
    }

    /// Log service shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            service = %self.service_name,
            reason = %reason,
            "Price sensitivity service shutting down"
        );
    }
}
