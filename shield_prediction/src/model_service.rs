use crate::processor::ModelInputs;
use ndarray::Array2;

/// Raw classifier outputs, one row per prompt row.
///
/// Some exports omit one of the heads, so both are optional here and checked by the caller.
#[derive(Debug, Clone, Default)]
pub struct ModelOutputs {
    pub logits: Option<Array2<f32>>,
    pub probabilities: Option<Array2<f32>>,
}

pub trait ModelService: Send + Sync + 'static {
    fn infer(&self, inputs: &ModelInputs) -> Result<ModelOutputs, String>;
}
