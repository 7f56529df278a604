//! ML prediction engine

mod features;
mod inference;
mod service;

pub use features::{
    basket_size_code, fnv1a_32, hash_bucket, store_format_code, FeatureEncoder, CATEGORY_BUCKETS,
    PRODUCT_BUCKETS,
};
pub use inference::{
    FallbackModel, ModelLoader, OnnxModel, OnnxModelLoader, FALLBACK_VERSION,
    HIGH_SENSITIVITY_SPEND, LOW_SENSITIVITY_SPEND,
};
pub use service::{PredictionService, PROBABILITY_TOLERANCE};

use crate::models::{ClassProbabilities, FeatureVector, SensitivityClass};
use anyhow::Result;

/// Capability shared by every model variant.
///
/// Inputs follow [`crate::models::FEATURE_NAMES`] order; probability triples
/// are ordered `[Low, Medium, High]`.
pub trait Model: Send + Sync {
    /// Predicted class for one feature vector
    fn predict(&self, features: &FeatureVector) -> Result<SensitivityClass>;

    /// Per-class probabilities, or `None` when the model cannot provide them
    fn predict_proba(&self, _features: &FeatureVector) -> Result<Option<ClassProbabilities>> {
        Ok(None)
    }

    /// Class and probabilities together; models that compute both in one
    /// pass override this
    fn predict_with_proba(
        &self,
        features: &FeatureVector,
    ) -> Result<(SensitivityClass, Option<ClassProbabilities>)> {
        Ok((self.predict(features)?, self.predict_proba(features)?))
    }
}
