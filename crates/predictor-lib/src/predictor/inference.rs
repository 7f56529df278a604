//! Model implementations
//!
//! `OnnxModel` evaluates a classifier artifact with tract; `FallbackModel`
//! is the deterministic rule-based stand-in used whenever the artifact cannot
//! be obtained.

use super::Model;
use crate::models::{
    ClassProbabilities, FeatureVector, SensitivityClass, NUM_CLASSES, NUM_FEATURES,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, warn};

/// Version reported while the fallback model is active
pub const FALLBACK_VERSION: &str = "fallback-v1";

/// Spend below this is classified as highly price sensitive
pub const HIGH_SENSITIVITY_SPEND: f64 = 50.0;

/// Spend at or above this is classified as low sensitivity
pub const LOW_SENSITIVITY_SPEND: f64 = 150.0;

/// Maximum inference latency before warning
const MAX_INFERENCE_MS: u128 = 5;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Turns artifact bytes into a runnable model
pub trait ModelLoader: Send + Sync {
    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Model>>;
}

/// Loads ONNX classifier artifacts
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxModelLoader;

impl ModelLoader for OnnxModelLoader {
    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Model>> {
        Ok(Arc::new(OnnxModel::new(bytes)?))
    }
}

/// Raw outputs of one graph evaluation
#[derive(Debug, Clone, Default, PartialEq)]
struct Evaluation {
    label: Option<usize>,
    probabilities: Option<ClassProbabilities>,
}

impl Evaluation {
    /// Pick the integer label tensor and the 3-wide float tensor out of the
    /// graph outputs; anything else is ignored
    fn from_outputs<'a>(outputs: impl IntoIterator<Item = &'a Tensor>) -> Result<Self> {
        let mut evaluation = Self::default();
        for output in outputs {
            if output.datum_type() == i64::datum_type() {
                let view = output.to_array_view::<i64>()?;
                if let Some(&label) = view.iter().next() {
                    evaluation.label = usize::try_from(label).ok();
                }
            } else if output.datum_type() == f32::datum_type() {
                let values: Vec<f32> = output.to_array_view::<f32>()?.iter().copied().collect();
                if values.len() == NUM_CLASSES {
                    evaluation.probabilities =
                        Some([values[0] as f64, values[1] as f64, values[2] as f64]);
                }
            }
        }
        Ok(evaluation)
    }

    /// The explicit label, else the argmax of the probabilities
    fn class(&self) -> Result<SensitivityClass> {
        let index = match (self.label, self.probabilities) {
            (Some(label), _) => label,
            (None, Some(probabilities)) => argmax(&probabilities),
            (None, None) => anyhow::bail!("Model produced neither a label nor probabilities"),
        };
        SensitivityClass::from_index(index).with_context(|| {
            format!("Model returned class index {} outside 0..{}", index, NUM_CLASSES)
        })
    }
}

/// ONNX classifier evaluated with tract.
///
/// The graph takes a `[1, 8]` f32 input in feature order. Outputs are scanned
/// for an integer label tensor and a 3-wide float probability tensor, which is
/// the layout of scikit-learn classifiers exported without a ZipMap node.
pub struct OnnxModel {
    model: TractModel,
}

impl OnnxModel {
    pub fn new(model_bytes: &[u8]) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(model_bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, NUM_FEATURES]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        Ok(Self { model })
    }

    fn features_to_tensor(features: &FeatureVector) -> Result<Tensor> {
        let array = tract_ndarray::Array2::from_shape_vec((1, NUM_FEATURES), features.to_f32())
            .context("Failed to shape feature tensor")?;
        Ok(array.into())
    }

    fn evaluate(&self, features: &FeatureVector) -> Result<Evaluation> {
        let start = Instant::now();
        let input = Self::features_to_tensor(features)?;
        let outputs = self.model.run(tvec!(input.into()))?;
        let evaluation = Evaluation::from_outputs(outputs.iter().map(|output| &**output))?;

        let elapsed = start.elapsed();
        if elapsed.as_millis() > MAX_INFERENCE_MS {
            warn!(
                elapsed_ms = elapsed.as_millis(),
                "Inference exceeded {}ms target", MAX_INFERENCE_MS
            );
        } else {
            debug!(elapsed_us = elapsed.as_micros(), "Inference completed");
        }

        Ok(evaluation)
    }
}

impl Model for OnnxModel {
    fn predict(&self, features: &FeatureVector) -> Result<SensitivityClass> {
        self.evaluate(features)?.class()
    }

    fn predict_proba(&self, features: &FeatureVector) -> Result<Option<ClassProbabilities>> {
        Ok(self.evaluate(features)?.probabilities)
    }

    fn predict_with_proba(
        &self,
        features: &FeatureVector,
    ) -> Result<(SensitivityClass, Option<ClassProbabilities>)> {
        let evaluation = self.evaluate(features)?;
        Ok((evaluation.class()?, evaluation.probabilities))
    }
}

fn argmax(values: &ClassProbabilities) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Rule-based model keyed on spend alone
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackModel;

impl FallbackModel {
    pub fn classify(spend: f64) -> SensitivityClass {
        if spend < HIGH_SENSITIVITY_SPEND {
            SensitivityClass::High
        } else if spend < LOW_SENSITIVITY_SPEND {
            SensitivityClass::Medium
        } else {
            SensitivityClass::Low
        }
    }

    /// Fixed `[Low, Medium, High]` triple for a predicted class
    pub fn probabilities(class: SensitivityClass) -> ClassProbabilities {
        match class {
            SensitivityClass::Low => [0.70, 0.20, 0.10],
            SensitivityClass::Medium => [0.20, 0.60, 0.20],
            SensitivityClass::High => [0.10, 0.20, 0.70],
        }
    }
}

impl Model for FallbackModel {
    fn predict(&self, features: &FeatureVector) -> Result<SensitivityClass> {
        Ok(Self::classify(features.spend()))
    }

    fn predict_proba(&self, features: &FeatureVector) -> Result<Option<ClassProbabilities>> {
        Ok(Some(Self::probabilities(Self::classify(features.spend()))))
    }

    fn predict_with_proba(
        &self,
        features: &FeatureVector,
    ) -> Result<(SensitivityClass, Option<ClassProbabilities>)> {
        let class = Self::classify(features.spend());
        Ok((class, Some(Self::probabilities(class))))
    }
}
