//! Health and readiness reporting
//!
//! Both checks are derived from the provider's [`ModelInfo`]: the service is
//! healthy and ready once any model (remote or fallback) is loaded.

use crate::models::{ModelInfo, ModelSource};
use serde::{Deserialize, Serialize};

/// Liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    ModelNotLoaded,
}

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub model_loaded: bool,
    pub model_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_source: Option<ModelSource>,
}

impl HealthResponse {
    pub fn from_info(info: &ModelInfo) -> Self {
        let status = if info.loaded {
            HealthStatus::Healthy
        } else {
            HealthStatus::ModelNotLoaded
        };
        Self {
            status,
            model_loaded: info.loaded,
            model_version: info.version.clone(),
            model_source: info.source,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Readiness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    Ready,
    NotReady,
}

/// Body of `GET /ready`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: ReadinessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessResponse {
    pub fn from_info(info: &ModelInfo) -> Self {
        if info.loaded {
            Self {
                status: ReadinessStatus::Ready,
                reason: None,
            }
        } else {
            Self {
                status: ReadinessStatus::NotReady,
                reason: Some("Model not yet loaded".to_string()),
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ReadinessStatus::Ready
    }
}
