//! Turns a prediction request into the tensors the classifier consumes.
//!
//! Every prompt row of the bundle is one (image, policy) pair. Rows are laid out
//! image-major and each row keeps a [`RowLabel`] so scores can be matched back to
//! their image and policy without relying on positional agreement with the model.

use crate::policy::{Policy, PolicySet};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, Array2, Array4};
use serde::Deserialize;
use shield_wire::Instance;
use std::path::Path;
use thiserror::Error;

const IMAGE_PLACEHOLDER: &str = "<start_of_image>";
const IMAGE_SOFT_TOKEN: &str = "<image_soft_token>";
const END_OF_IMAGE: &str = "<end_of_image>";

const POLICY_PROMPT: &str = "You are a policy expert trying to help determine whether a \
generated or real image is in violation of the safety policy below. Your decision must very \
clearly follow the specific language used in the safety policy and should not include any \
interpretation outside of the safety policy.\n\n<BEGIN_SAFETY_POLICY>\n{policy}\n\
</END_SAFETY_POLICY>\n\nDoes the image violate the above policy? Your Answer must start with \
'Yes' or 'No'.";

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("request contains no instances")]
    EmptyBatch,
    #[error("instance {index} is not valid base64: {source}")]
    Base64 {
        index: usize,
        source: base64::DecodeError,
    },
    #[error("instance {index} is not a decodable image: {source}")]
    Image {
        index: usize,
        source: image::ImageError,
    },
    #[error("invalid policies: {0}")]
    Policy(String),
    #[error("tokenization failed: {0}")]
    Tokenizer(String),
    #[error("failed to read processor configuration {path}: {message}")]
    Config { path: String, message: String },
}

impl ProcessorError {
    /// Errors caused by the request body rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ProcessorError::EmptyBatch
                | ProcessorError::Base64 { .. }
                | ProcessorError::Image { .. }
                | ProcessorError::Policy(_)
        )
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

/// Subset of `preprocessor_config.json` that drives image preprocessing.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_size")]
    pub size: ImageSize,
    #[serde(default = "default_channel_half")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_channel_half")]
    pub image_std: [f32; 3],
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_image_seq_length")]
    pub image_seq_length: usize,
    #[serde(default)]
    pub pad_token_id: i64,
}

fn default_size() -> ImageSize {
    ImageSize {
        height: 896,
        width: 896,
    }
}

fn default_channel_half() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_image_seq_length() -> usize {
    256
}

impl ProcessorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ProcessorError> {
        let config_error = |message: String| ProcessorError::Config {
            path: path.display().to_string(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| config_error(e.to_string()))
    }
}

/// Text to token id conversion.
pub trait PromptEncoder: Send + Sync + 'static {
    fn encode(&self, text: &str) -> Result<Vec<i64>, ProcessorError>;
}

impl PromptEncoder for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>, ProcessorError> {
        // The template carries its own <bos>.
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| ProcessorError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLabel {
    pub image_index: usize,
    pub policy: String,
}

/// Tensor bundle for one request.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// `[images, 3, height, width]`
    pub pixel_values: Array4<f32>,
    /// `[rows, sequence]`, left padded.
    pub input_ids: Array2<i64>,
    pub attention_mask: Array2<i64>,
    pub rows: Vec<RowLabel>,
    pub image_count: usize,
    pub policy_count: usize,
}

impl ModelInputs {
    /// Image index of every prompt row, used to expand the pixel batch.
    pub fn row_image_indices(&self) -> Vec<usize> {
        self.rows.iter().map(|row| row.image_index).collect()
    }
}

pub struct Processor<E: PromptEncoder> {
    config: ProcessorConfig,
    encoder: E,
}

impl Processor<tokenizers::Tokenizer> {
    pub fn from_dir(
        dir: &Path,
        preprocessor_file: &str,
        tokenizer_file: &str,
    ) -> Result<Self, ProcessorError> {
        let config = ProcessorConfig::from_file(&dir.join(preprocessor_file))?;
        let tokenizer_path = dir.join(tokenizer_file);
        let tokenizer =
            tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| ProcessorError::Config {
                path: tokenizer_path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::new(config, tokenizer))
    }
}

impl<E: PromptEncoder> Processor<E> {
    pub fn new(config: ProcessorConfig, encoder: E) -> Self {
        Self { config, encoder }
    }

    pub fn process(
        &self,
        instances: &[Instance],
        policies: &PolicySet,
    ) -> Result<ModelInputs, ProcessorError> {
        if instances.is_empty() {
            return Err(ProcessorError::EmptyBatch);
        }

        let images = instances
            .iter()
            .enumerate()
            .map(|(index, instance)| decode_image(index, &instance.bytes_base64_encoded))
            .collect::<Result<Vec<_>, _>>()?;
        let pixel_values = self.pixel_values(&images);

        // Prompts only depend on the policy, so encode each once.
        let encoded = policies
            .iter()
            .map(|policy| self.encoder.encode(&self.render_prompt(policy)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(images.len() * policies.len());
        let mut sequences = Vec::with_capacity(images.len() * policies.len());
        for image_index in 0..images.len() {
            for (policy, ids) in policies.iter().zip(encoded.iter()) {
                rows.push(RowLabel {
                    image_index,
                    policy: policy.name.clone(),
                });
                sequences.push(ids.as_slice());
            }
        }

        let (input_ids, attention_mask) = left_pad(&sequences, self.config.pad_token_id);

        tracing::debug!(
            images = images.len(),
            policies = policies.len(),
            sequence_length = input_ids.ncols(),
            "Built model inputs"
        );

        Ok(ModelInputs {
            pixel_values,
            input_ids,
            attention_mask,
            rows,
            image_count: images.len(),
            policy_count: policies.len(),
        })
    }

    /// Resizes and normalizes RGB images into a `[N, 3, H, W]` batch.
    pub fn pixel_values(&self, images: &[RgbImage]) -> Array4<f32> {
        let ImageSize { height, width } = self.config.size;
        let mut input = Array::zeros((images.len(), 3, height as usize, width as usize));

        for (n, img) in images.iter().enumerate() {
            let resized = image::imageops::resize(img, width, height, FilterType::Triangle);
            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    let value = pixel.0[c] as f32 * self.config.rescale_factor;
                    input[[n, c, y as usize, x as usize]] =
                        (value - self.config.image_mean[c]) / self.config.image_std[c];
                }
            }
        }

        input
    }

    pub fn render_prompt(&self, policy: &Policy) -> String {
        let image_tokens = format!(
            "\n\n{}{}{}\n\n",
            IMAGE_PLACEHOLDER,
            IMAGE_SOFT_TOKEN.repeat(self.config.image_seq_length),
            END_OF_IMAGE
        );
        let text = POLICY_PROMPT.replace("{policy}", &policy.description);
        format!(
            "<bos><start_of_turn>user\n{}{}<end_of_turn>\n<start_of_turn>model\n",
            image_tokens, text
        )
    }
}

pub fn decode_image(index: usize, encoded: &str) -> Result<RgbImage, ProcessorError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|source| ProcessorError::Base64 { index, source })?;

    let image = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ProcessorError::Image {
            index,
            source: image::ImageError::IoError(e),
        })?
        .decode()
        .map_err(|source| ProcessorError::Image { index, source })?;

    Ok(image.to_rgb8())
}

/// Left pads so the final position of every row is its last real token.
fn left_pad(sequences: &[&[i64]], pad_id: i64) -> (Array2<i64>, Array2<i64>) {
    let max_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut input_ids = Array2::from_elem((sequences.len(), max_len), pad_id);
    let mut attention_mask = Array2::zeros((sequences.len(), max_len));

    for (row, seq) in sequences.iter().enumerate() {
        let offset = max_len - seq.len();
        for (i, &id) in seq.iter().enumerate() {
            input_ids[[row, offset + i]] = id;
            attention_mask[[row, offset + i]] = 1;
        }
    }

    (input_ids, attention_mask)
}
