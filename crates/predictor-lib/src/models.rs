//! Core data models for the prediction service

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Number of features produced by the encoder
pub const NUM_FEATURES: usize = 8;

/// Number of sensitivity classes
pub const NUM_CLASSES: usize = 3;

/// Feature names in encoder output order.
///
/// Every model consumes features in exactly this order; reordering invalidates
/// all previously fitted artifacts.
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "BASKET_SIZE",
    "BASKET_TYPE",
    "STORE_REGION",
    "STORE_FORMAT",
    "SPEND",
    "QUANTITY",
    "PROD_CODE_20",
    "PROD_CODE_30",
];

/// Price sensitivity class predicted for a basket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensitivityClass {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl SensitivityClass {
    /// All classes in probability-triple order
    pub const ALL: [SensitivityClass; NUM_CLASSES] = [Self::Low, Self::Medium, Self::High];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

impl fmt::Display for SensitivityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Class probabilities ordered `[Low, Medium, High]`
pub type ClassProbabilities = [f64; NUM_CLASSES];

/// Prediction request as received on the wire.
///
/// Every field is optional here so that a missing field can be reported by
/// name instead of as a generic deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RawPredictionRequest {
    #[serde(alias = "basket_size")]
    pub basket_size: Option<String>,
    #[serde(alias = "basket_type")]
    pub basket_type: Option<String>,
    #[serde(alias = "store_region")]
    pub store_region: Option<String>,
    #[serde(alias = "store_format")]
    pub store_format: Option<String>,
    #[serde(alias = "spend")]
    pub spend: Option<f64>,
    #[serde(alias = "quantity")]
    pub quantity: Option<i64>,
    #[serde(alias = "prod_code_20")]
    pub prod_code_20: Option<String>,
    #[serde(alias = "prod_code_30")]
    pub prod_code_30: Option<String>,
}

/// Validated prediction request with all eight fields present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PredictionRequest {
    pub basket_size: String,
    pub basket_type: String,
    pub store_region: String,
    pub store_format: String,
    pub spend: f64,
    pub quantity: i64,
    pub prod_code_20: String,
    pub prod_code_30: String,
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ValidationError> {
    value.ok_or(ValidationError::MissingField { field })
}

impl TryFrom<RawPredictionRequest> for PredictionRequest {
    type Error = ValidationError;

    fn try_from(raw: RawPredictionRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            basket_size: required(raw.basket_size, "BASKET_SIZE")?,
            basket_type: required(raw.basket_type, "BASKET_TYPE")?,
            store_region: required(raw.store_region, "STORE_REGION")?,
            store_format: required(raw.store_format, "STORE_FORMAT")?,
            spend: required(raw.spend, "SPEND")?,
            quantity: required(raw.quantity, "QUANTITY")?,
            prod_code_20: required(raw.prod_code_20, "PROD_CODE_20")?,
            prod_code_30: required(raw.prod_code_30, "PROD_CODE_30")?,
        })
    }
}

/// Fixed-order numeric encoding of a request (see [`FEATURE_NAMES`])
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; NUM_FEATURES]);

impl FeatureVector {
    pub const SPEND_INDEX: usize = 4;

    pub fn values(&self) -> &[f64; NUM_FEATURES] {
        &self.0
    }

    pub fn spend(&self) -> f64 {
        self.0[Self::SPEND_INDEX]
    }

    /// Single-precision copy for model runtimes that take `f32` input
    pub fn to_f32(&self) -> Vec<f32> {
        self.0.iter().map(|v| *v as f32).collect()
    }
}

/// Prediction returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: SensitivityClass,
    pub probability: BTreeMap<SensitivityClass, f64>,
    pub confidence: f64,
    pub model_version: String,
}

/// Where the active model came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Remote,
    Fallback,
}

impl ModelSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Fallback => "fallback",
        }
    }
}

/// Registry metadata published next to an artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_package_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_package_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<String>,
    #[serde(default)]
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub class_labels: Vec<String>,
}

/// Metadata about the model currently served
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ModelSource>,
    pub version: String,
    pub bucket: String,
    pub key: String,
    pub local_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryManifest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
