use crate::{
    model_service::{ModelOutputs, ModelService},
    processor::ModelInputs,
};
use ndarray::{Array2, Axis, Ix2};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session, SessionOutputs},
    value::TensorRef,
};
use std::{path::Path, sync::Mutex};

pub struct OrtModelService {
    session: Mutex<Session>,
}

impl OrtModelService {
    pub fn new(model_path: &Path, use_cuda: bool) -> Result<Self, String> {
        let session = build_session(model_path, use_cuda)
            .map_err(|e| format!("failed to load {}: {}", model_path.display(), e))?;

        tracing::info!(
            model = %model_path.display(),
            cuda = use_cuda,
            "Created ONNX session"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

fn build_session(model_path: &Path, use_cuda: bool) -> Result<Session, ort::Error> {
    if use_cuda {
        ort::init()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .commit()?;
    }

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(model_path)?;

    Ok(session)
}

fn extract_matrix(outputs: &SessionOutputs, name: &str) -> Result<Option<Array2<f32>>, String> {
    let Some(value) = outputs.get(name) else {
        return Ok(None);
    };

    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| format!("failed to extract `{}`: {}", name, e))?;

    let array = ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
        .map_err(|e| format!("invalid `{}` shape: {}", name, e))?
        .into_dimensionality::<Ix2>()
        .map_err(|e| format!("`{}` is not a matrix: {}", name, e))?;

    Ok(Some(array))
}

impl ModelService for OrtModelService {
    fn infer(&self, inputs: &ModelInputs) -> Result<ModelOutputs, String> {
        // One pixel tensor per prompt row; labels stay on this side.
        let pixel_values = inputs
            .pixel_values
            .select(Axis(0), &inputs.row_image_indices());

        let pixel_ref = TensorRef::from_array_view(pixel_values.view())
            .map_err(|e| format!("failed to build pixel tensor: {}", e))?;
        let ids_ref = TensorRef::from_array_view(inputs.input_ids.view())
            .map_err(|e| format!("failed to build input_ids tensor: {}", e))?;
        let mask_ref = TensorRef::from_array_view(inputs.attention_mask.view())
            .map_err(|e| format!("failed to build attention_mask tensor: {}", e))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("session mutex poisoned: {}", e))?;

        let outputs = session
            .run(ort::inputs![
                "pixel_values" => pixel_ref,
                "input_ids" => ids_ref,
                "attention_mask" => mask_ref
            ])
            .map_err(|e| format!("inference failed: {}", e))?;

        Ok(ModelOutputs {
            logits: extract_matrix(&outputs, "logits")?,
            probabilities: extract_matrix(&outputs, "probabilities")?,
        })
    }
}
