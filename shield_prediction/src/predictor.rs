use crate::{
    artifacts::{fetch_artifacts, ArtifactError},
    config::ModelSettings,
    model_service::{ModelOutputs, ModelService},
    ort_service::OrtModelService,
    policy::PolicySet,
    processor::{ModelInputs, Processor, ProcessorError, PromptEncoder},
};
use ndarray::Array2;
use shield_wire::{ImagePrediction, PolicyScores, PredictionRequest, PredictionResponse};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error("failed to fetch artifacts: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("model did not return `{0}`")]
    MissingOutput(&'static str),
    #[error("model output `{name}` has {actual} rows, expected {expected}")]
    OutputShape {
        name: &'static str,
        actual: usize,
        expected: usize,
    },
}

impl PredictorError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, PredictorError::Processor(e) if e.is_client_error())
    }
}

/// Request handling as seen by the HTTP layer.
pub trait Classify: Send + Sync + 'static {
    fn classify(&self, request: &PredictionRequest) -> Result<PredictionResponse, PredictorError>;
}

/// A loaded classifier. Constructing one is the only way to reach the serving state.
pub struct Predictor<M: ModelService, E: PromptEncoder> {
    model: M,
    processor: Processor<E>,
}

impl Predictor<OrtModelService, tokenizers::Tokenizer> {
    /// Fetches the artifacts and builds the processor and the ONNX session.
    pub async fn load(settings: &ModelSettings) -> Result<Self, PredictorError> {
        let dir = fetch_artifacts(&settings.artifact_uri, &settings.download_dir).await?;
        tracing::info!("Artifacts available in {}", dir.display());

        let processor =
            Processor::from_dir(&dir, &settings.preprocessor_file, &settings.tokenizer_file)?;
        tracing::info!("Processor successfully loaded");

        let model_path = dir.join(&settings.onnx_file);
        let use_cuda = settings.use_cuda;
        let model = tokio::task::spawn_blocking(move || {
            OrtModelService::new(&model_path, use_cuda)
        })
        .await
        .map_err(|e| PredictorError::ModelLoad(e.to_string()))?
        .map_err(PredictorError::ModelLoad)?;
        tracing::info!("Model successfully loaded");

        Ok(Self::new(model, processor))
    }
}

impl<M: ModelService, E: PromptEncoder> Predictor<M, E> {
    pub fn new(model: M, processor: Processor<E>) -> Self {
        Self { model, processor }
    }

    pub fn preprocess(&self, request: &PredictionRequest) -> Result<ModelInputs, PredictorError> {
        let policies = PolicySet::resolve(&request.parameters.custom_policies)
            .map_err(ProcessorError::Policy)?;
        tracing::info!(policies = ?policies.names(), "Resolved policies");

        Ok(self.processor.process(&request.instances, &policies)?)
    }

    pub fn predict(&self, inputs: ModelInputs) -> Result<PredictionResponse, PredictorError> {
        let outputs = self
            .model
            .infer(&inputs)
            .map_err(PredictorError::Inference)?;
        assemble_response(inputs, outputs)
    }
}

impl<M: ModelService, E: PromptEncoder> Classify for Predictor<M, E> {
    fn classify(&self, request: &PredictionRequest) -> Result<PredictionResponse, PredictorError> {
        let inputs = self.preprocess(request)?;
        self.predict(inputs)
    }
}

fn checked_rows(
    name: &'static str,
    matrix: Option<Array2<f32>>,
    expected: usize,
) -> Result<Array2<f32>, PredictorError> {
    let matrix = matrix.ok_or(PredictorError::MissingOutput(name))?;
    if matrix.nrows() != expected {
        return Err(PredictorError::OutputShape {
            name,
            actual: matrix.nrows(),
            expected,
        });
    }
    Ok(matrix)
}

/// Groups per-row scores into one policy mapping per image using the row labels.
fn assemble_response(
    inputs: ModelInputs,
    outputs: ModelOutputs,
) -> Result<PredictionResponse, PredictorError> {
    let expected = inputs.rows.len();
    let logits = checked_rows("logits", outputs.logits, expected)?;
    let probabilities = checked_rows("probabilities", outputs.probabilities, expected)?;

    let mut predictions = vec![ImagePrediction::with_capacity(inputs.policy_count); inputs.image_count];
    for (index, row) in inputs.rows.into_iter().enumerate() {
        predictions[row.image_index].insert(
            row.policy,
            PolicyScores {
                logits: logits.row(index).to_vec(),
                probabilities: probabilities.row(index).to_vec(),
            },
        );
    }

    Ok(PredictionResponse { predictions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::tests::{rgb_instance, test_config, WordCountEncoder};
    use indexmap::IndexMap;
    use ndarray::Array2;
    use shield_wire::Parameters;

    /// Returns scores derived from the row index so reassembly can be checked.
    struct MockModelService {
        with_logits: bool,
        with_probabilities: bool,
        drop_rows: usize,
    }

    impl MockModelService {
        fn complete() -> Self {
            Self {
                with_logits: true,
                with_probabilities: true,
                drop_rows: 0,
            }
        }
    }

    impl ModelService for MockModelService {
        fn infer(&self, inputs: &ModelInputs) -> Result<ModelOutputs, String> {
            let rows = inputs.input_ids.nrows() - self.drop_rows;
            let logits = Array2::from_shape_fn((rows, 2), |(r, c)| r as f32 + c as f32 / 10.0);
            let probabilities = Array2::from_shape_fn((rows, 2), |(r, c)| {
                if c == 0 {
                    r as f32 / 100.0
                } else {
                    1.0 - r as f32 / 100.0
                }
            });
            Ok(ModelOutputs {
                logits: self.with_logits.then_some(logits),
                probabilities: self.with_probabilities.then_some(probabilities),
            })
        }
    }

    fn predictor(model: MockModelService) -> Predictor<MockModelService, WordCountEncoder> {
        Predictor::new(model, Processor::new(test_config(), WordCountEncoder))
    }

    fn request(images: usize, custom: &[(&str, &str)]) -> PredictionRequest {
        let custom_policies: IndexMap<String, String> = custom
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PredictionRequest {
            instances: (0..images).map(|_| rgb_instance()).collect(),
            parameters: Parameters { custom_policies },
        }
    }

    #[test]
    fn test_one_mapping_per_image_with_every_policy() {
        let predictor = predictor(MockModelService::complete());

        let response = predictor
            .classify(&request(2, &[("weapons", "No weapons.")]))
            .unwrap();

        assert_eq!(response.predictions.len(), 2);
        for image in &response.predictions {
            let keys: Vec<&str> = image.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["dangerous", "sexual", "violence", "weapons"]);
            for scores in image.values() {
                assert_eq!(scores.logits.len(), scores.probabilities.len());
                assert_eq!(scores.logits.len(), 2);
            }
        }
        // Row 5 is image 1, policy "sexual".
        assert_eq!(response.predictions[1]["sexual"].logits, vec![5.0, 5.1]);
        assert_eq!(response.predictions[0]["weapons"].logits, vec![3.0, 3.1]);
    }

    #[test]
    fn test_builtin_policies_only() {
        let predictor = predictor(MockModelService::complete());

        let response = predictor.classify(&request(1, &[])).unwrap();

        assert_eq!(response.predictions.len(), 1);
        let keys: Vec<&str> = response.predictions[0].keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["dangerous", "sexual", "violence"]);
    }

    #[test]
    fn test_missing_probabilities_is_an_error() {
        let predictor = predictor(MockModelService {
            with_probabilities: false,
            ..MockModelService::complete()
        });

        let err = predictor.classify(&request(1, &[])).unwrap_err();

        assert!(matches!(err, PredictorError::MissingOutput("probabilities")));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_missing_logits_is_an_error() {
        let predictor = predictor(MockModelService {
            with_logits: false,
            ..MockModelService::complete()
        });

        let err = predictor.classify(&request(1, &[])).unwrap_err();

        assert!(matches!(err, PredictorError::MissingOutput("logits")));
    }

    #[test]
    fn test_row_count_mismatch_is_detected() {
        let predictor = predictor(MockModelService {
            drop_rows: 1,
            ..MockModelService::complete()
        });

        let err = predictor.classify(&request(2, &[])).unwrap_err();

        assert!(matches!(
            err,
            PredictorError::OutputShape {
                name: "logits",
                actual: 5,
                expected: 6
            }
        ));
    }

    #[test]
    fn test_preprocess_rejects_shadowed_builtin() {
        let predictor = predictor(MockModelService::complete());

        let err = predictor
            .preprocess(&request(1, &[("violence", "Override.")]))
            .unwrap_err();

        assert!(err.is_client_error());
    }
}
