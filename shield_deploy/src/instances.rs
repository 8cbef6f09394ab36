use base64::{engine::general_purpose::STANDARD, Engine};
use shield_wire::{Instance, PredictionRequest};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstancesError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("{path} is not a valid prediction request: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Loads a request file holding `instances` and `parameters`.
pub fn load_instances(path: &Path) -> Result<PredictionRequest, InstancesError> {
    let raw = std::fs::read_to_string(path).map_err(|source| InstancesError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| InstancesError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Builds a request scoring raw image files against the built-in policies.
pub fn request_from_images(paths: &[PathBuf]) -> Result<PredictionRequest, InstancesError> {
    let instances = paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path).map_err(|source| InstancesError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Ok(Instance {
                bytes_base64_encoded: STANDARD.encode(bytes),
            })
        })
        .collect::<Result<Vec<_>, InstancesError>>()?;

    Ok(PredictionRequest {
        instances,
        ..PredictionRequest::default()
    })
}
