//! Feature encoding for ML inference
//!
//! Maps a validated request onto the fixed-order feature vector shared with
//! every model. Closed vocabularies use static lookup tables; open-vocabulary
//! fields are bucketed with 32-bit FNV-1a over their UTF-8 bytes, which is
//! stable across processes and platforms.

use crate::error::ValidationError;
use crate::models::{FeatureVector, PredictionRequest};
use tracing::debug;

/// Bucket count for `BASKET_TYPE` and `STORE_REGION`
pub const CATEGORY_BUCKETS: u32 = 100;

/// Bucket count for `PROD_CODE_20` and `PROD_CODE_30`
pub const PRODUCT_BUCKETS: u32 = 1000;

/// Code used when `BASKET_SIZE` is not one of S/M/L
pub const DEFAULT_BASKET_SIZE_CODE: f64 = 1.0;

/// Code used when `STORE_FORMAT` is not one of SS/LS
pub const DEFAULT_STORE_FORMAT_CODE: f64 = 0.0;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a over the UTF-8 bytes of `value`
pub fn fnv1a_32(value: &str) -> u32 {
    value.bytes().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash `value` into one of `buckets` buckets
pub fn hash_bucket(value: &str, buckets: u32) -> u32 {
    fnv1a_32(value) % buckets
}

/// Encodes prediction requests into feature vectors
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEncoder;

impl FeatureEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a request. Pure: the same request always yields the same vector.
    pub fn encode(&self, request: &PredictionRequest) -> Result<FeatureVector, ValidationError> {
        let spend = validate_spend(request.spend)?;
        let quantity = validate_quantity(request.quantity)?;

        let features = FeatureVector([
            basket_size_code(&request.basket_size),
            f64::from(hash_bucket(&request.basket_type, CATEGORY_BUCKETS)),
            f64::from(hash_bucket(&request.store_region, CATEGORY_BUCKETS)),
            store_format_code(&request.store_format),
            spend,
            quantity,
            f64::from(hash_bucket(&request.prod_code_20, PRODUCT_BUCKETS)),
            f64::from(hash_bucket(&request.prod_code_30, PRODUCT_BUCKETS)),
        ]);

        debug!(features = ?features.values(), "Encoded features");
        Ok(features)
    }
}

/// `S`/`M`/`L` lookup; anything else is treated as medium
pub fn basket_size_code(value: &str) -> f64 {
    match value {
        "S" => 0.0,
        "M" => 1.0,
        "L" => 2.0,
        _ => DEFAULT_BASKET_SIZE_CODE,
    }
}

/// `SS`/`LS` lookup; anything else is treated as a small store
pub fn store_format_code(value: &str) -> f64 {
    match value {
        "SS" => 0.0,
        "LS" => 1.0,
        _ => DEFAULT_STORE_FORMAT_CODE,
    }
}

fn validate_spend(spend: f64) -> Result<f64, ValidationError> {
    if !spend.is_finite() {
        return Err(ValidationError::InvalidField {
            field: "SPEND",
            reason: "must be a finite number".to_string(),
        });
    }
    if spend < 0.0 {
        return Err(ValidationError::InvalidField {
            field: "SPEND",
            reason: format!("must be non-negative, got {}", spend),
        });
    }
    Ok(spend)
}

fn validate_quantity(quantity: i64) -> Result<f64, ValidationError> {
    if quantity < 1 {
        return Err(ValidationError::InvalidField {
            field: "QUANTITY",
            reason: format!("must be at least 1, got {}", quantity),
        });
    }
    Ok(quantity as f64)
}
