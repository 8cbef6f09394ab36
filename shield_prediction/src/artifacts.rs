use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

const GCS_API: &str = "https://storage.googleapis.com/storage/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("unsupported artifact uri `{0}`")]
    UnsupportedUri(String),
    #[error("artifact directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("no objects found under {0}")]
    Empty(String),
    #[error("object `{0}` would be written outside the download directory")]
    UnsafeObjectName(String),
    #[error("invalid storage url: {0}")]
    InvalidUrl(String),
    #[error("failed to obtain an access token: {0}")]
    Token(String),
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Local(PathBuf),
    Gcs { bucket: String, prefix: String },
}

impl ArtifactSource {
    pub fn parse(uri: &str) -> Result<Self, ArtifactError> {
        if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(ArtifactError::UnsupportedUri(uri.to_string()));
            }
            let prefix = prefix.trim_end_matches('/');
            return Ok(Self::Gcs {
                bucket: bucket.to_string(),
                prefix: if prefix.is_empty() {
                    String::new()
                } else {
                    format!("{}/", prefix)
                },
            });
        }
        if uri.contains("://") {
            return Err(ArtifactError::UnsupportedUri(uri.to_string()));
        }
        Ok(Self::Local(PathBuf::from(uri)))
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<StorageObject>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageObject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Makes the artifacts available locally and returns the directory holding them.
///
/// Local directories are used in place. Cloud Storage prefixes are mirrored into
/// `download_dir`, keeping the layout below the prefix.
pub async fn fetch_artifacts(uri: &str, download_dir: &Path) -> Result<PathBuf, ArtifactError> {
    tracing::info!("Fetching artifacts from {}", uri);
    match ArtifactSource::parse(uri)? {
        ArtifactSource::Local(dir) => {
            if !dir.is_dir() {
                return Err(ArtifactError::MissingDirectory(dir));
            }
            Ok(dir)
        }
        ArtifactSource::Gcs { bucket, prefix } => {
            let client = reqwest::Client::new();
            let token = access_token(&client).await?;
            download_prefix(&client, &token, &bucket, &prefix, download_dir).await?;
            Ok(download_dir.to_path_buf())
        }
    }
}

async fn access_token(client: &reqwest::Client) -> Result<String, ArtifactError> {
    if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
        return Ok(token);
    }

    let response = client
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| ArtifactError::Token(e.to_string()))?
        .error_for_status()
        .map_err(|e| ArtifactError::Token(e.to_string()))?;

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| ArtifactError::Token(e.to_string()))?;
    Ok(token.access_token)
}

async fn download_prefix(
    client: &reqwest::Client,
    token: &str,
    bucket: &str,
    prefix: &str,
    download_dir: &Path,
) -> Result<(), ArtifactError> {
    let list_url = storage_url(&["b", bucket, "o"])?;
    let mut page_token: Option<String> = None;
    let mut downloaded = 0usize;

    loop {
        let mut request = client
            .get(list_url.clone())
            .bearer_auth(token)
            .query(&[("prefix", prefix)]);
        if let Some(page) = &page_token {
            request = request.query(&[("pageToken", page.as_str())]);
        }
        let listing: ObjectList = request.send().await?.error_for_status()?.json().await?;

        for object in listing.items {
            let Some(relative) = local_relative_path(&object.name, prefix)? else {
                continue;
            };
            let target = download_dir.join(relative);
            let size = download_object(client, token, bucket, &object.name, &target).await?;

            tracing::debug!("Downloaded gs://{}/{} ({} bytes)", bucket, object.name, size);
            downloaded += 1;
        }

        match listing.next_page_token {
            Some(next) => page_token = Some(next),
            None => break,
        }
    }

    if downloaded == 0 {
        return Err(ArtifactError::Empty(format!("gs://{}/{}", bucket, prefix)));
    }
    tracing::info!("Downloaded {} artifact files", downloaded);
    Ok(())
}

/// Streams one object to `target` chunk by chunk and returns its size.
async fn download_object(
    client: &reqwest::Client,
    token: &str,
    bucket: &str,
    object_name: &str,
    target: &Path,
) -> Result<u64, ArtifactError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut response = client
        .get(storage_url(&["b", bucket, "o", object_name])?)
        .bearer_auth(token)
        .query(&[("alt", "media")])
        .send()
        .await?
        .error_for_status()?;

    let mut file = tokio::fs::File::create(target).await?;
    let mut size = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(size)
}

/// Path below the prefix, or `None` for directory placeholders.
fn local_relative_path<'a>(
    object_name: &'a str,
    prefix: &str,
) -> Result<Option<&'a Path>, ArtifactError> {
    let Some(relative) = object_name.strip_prefix(prefix) else {
        return Ok(None);
    };
    if relative.is_empty() || relative.ends_with('/') {
        return Ok(None);
    }

    let path = Path::new(relative);
    if !path
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(ArtifactError::UnsafeObjectName(object_name.to_string()));
    }
    Ok(Some(path))
}

/// Storage API URL with every segment percent-encoded, `/` included.
fn storage_url(segments: &[&str]) -> Result<reqwest::Url, ArtifactError> {
    let mut url =
        reqwest::Url::parse(GCS_API).map_err(|e| ArtifactError::InvalidUrl(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ArtifactError::InvalidUrl(GCS_API.to_string()))?
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gcs_uri() {
        assert_eq!(
            ArtifactSource::parse("gs://proj_ai/shieldgemma-2-4b-it").unwrap(),
            ArtifactSource::Gcs {
                bucket: "proj_ai".into(),
                prefix: "shieldgemma-2-4b-it/".into(),
            }
        );
        assert_eq!(
            ArtifactSource::parse("gs://proj_ai").unwrap(),
            ArtifactSource::Gcs {
                bucket: "proj_ai".into(),
                prefix: String::new(),
            }
        );
    }

    #[test]
    fn test_parse_local_and_unsupported() {
        assert_eq!(
            ArtifactSource::parse("/models/shieldgemma").unwrap(),
            ArtifactSource::Local(PathBuf::from("/models/shieldgemma"))
        );
        assert!(matches!(
            ArtifactSource::parse("s3://bucket/key"),
            Err(ArtifactError::UnsupportedUri(_))
        ));
        assert!(ArtifactSource::parse("gs:///missing-bucket").is_err());
    }

    #[test]
    fn test_relative_paths_skip_placeholders() {
        assert_eq!(
            local_relative_path("model/onnx/model.onnx", "model/").unwrap(),
            Some(Path::new("onnx/model.onnx"))
        );
        assert_eq!(local_relative_path("model/", "model/").unwrap(), None);
        assert_eq!(local_relative_path("model/onnx/", "model/").unwrap(), None);
        assert_eq!(local_relative_path("other/file", "model/").unwrap(), None);
    }

    #[test]
    fn test_object_names_escaping_the_download_dir_are_rejected() {
        for name in ["model/../x", "model/onnx/../../etc/passwd", "model//etc/passwd"] {
            assert!(
                matches!(
                    local_relative_path(name, "model/"),
                    Err(ArtifactError::UnsafeObjectName(_))
                ),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_object_names_are_percent_encoded() {
        assert_eq!(
            storage_url(&["b", "proj_ai", "o", "shieldgemma/onnx/model.onnx_data"])
                .unwrap()
                .as_str(),
            "https://storage.googleapis.com/storage/v1/b/proj_ai/o/shieldgemma%2Fonnx%2Fmodel.onnx_data"
        );
        assert_eq!(
            storage_url(&["b", "proj_ai", "o"]).unwrap().as_str(),
            "https://storage.googleapis.com/storage/v1/b/proj_ai/o"
        );
    }

    #[tokio::test]
    async fn test_missing_local_directory() {
        let err = fetch_artifacts("/definitely/not/here", Path::new("/tmp"))
            .await
            .unwrap_err();

        assert!(matches!(err, ArtifactError::MissingDirectory(_)));
    }
}
