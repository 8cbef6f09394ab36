//! JSON contract spoken between Vertex AI and the ShieldGemma2 predictor.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Body of a `:predict` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "bytesBase64Encoded")]
    pub bytes_base64_encoded: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Policy name to policy text, in the order the caller wrote them.
    #[serde(default)]
    pub custom_policies: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    /// One entry per request instance.
    pub predictions: Vec<ImagePrediction>,
}

/// Scores for a single image, keyed by policy name.
pub type ImagePrediction = IndexMap<String, PolicyScores>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyScores {
    pub logits: Vec<f32>,
    pub probabilities: Vec<f32>,
}
