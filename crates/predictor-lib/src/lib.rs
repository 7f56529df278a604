//! Library for retail price sensitivity prediction
//!
//! This crate provides the core functionality for:
//! - Request validation and deterministic feature encoding
//! - ONNX inference with a rule-based fallback model
//! - Model artifact fetching, caching and reloading
//! - Health checks and observability

pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod provider;

pub use error::{FetchError, PredictionError, ValidationError};
pub use health::{HealthResponse, HealthStatus, ReadinessResponse, ReadinessStatus};
pub use models::*;
pub use observability::{render_metrics, ServiceMetrics, StructuredLogger};
pub use predictor::{FeatureEncoder, Model, PredictionService};
pub use provider::{ModelProvider, ProviderConfig, ProviderState};
