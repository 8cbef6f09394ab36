//! Vertex AI model registry and endpoint calls over the REST API.

use crate::config::CloudConfig;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use shield_wire::PredictionRequest;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("failed to obtain an access token: {0}")]
    Auth(String),
    #[error("Vertex AI returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("operation {name} failed with code {code}: {message}")]
    Operation {
        name: String,
        code: i32,
        message: String,
    },
    #[error("unexpected response: {0}")]
    Malformed(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    /// Resource name, `projects/*/locations/*/models/*`.
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub version_id: String,
}

impl Model {
    /// Resource name pinned to this version, as accepted by `deployModel`.
    pub fn versioned_name(&self) -> String {
        if self.version_id.is_empty() {
            self.name.clone()
        } else {
            format!("{}@{}", self.name, self.version_id)
        }
    }

    pub fn version_number(&self) -> u64 {
        self.version_id.parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelUpload {
    pub display_name: String,
    pub artifact_uri: String,
    pub image_uri: String,
    pub env: Vec<(String, String)>,
    pub predict_route: String,
    pub health_route: String,
    pub parent_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub display_name: String,
    pub inference_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSpec {
    pub display_name: String,
    pub machine_type: String,
    pub accelerator_type: String,
    pub accelerator_count: u32,
    pub traffic_percentage: u32,
    pub disable_container_logging: bool,
    pub enable_access_logging: bool,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn list_models(&self, display_name: &str) -> Result<Vec<Model>, PlatformError>;
    async fn list_model_versions(&self, model: &Model) -> Result<Vec<Model>, PlatformError>;
    async fn upload_model(&self, upload: &ModelUpload) -> Result<Model, PlatformError>;
    async fn list_endpoints(&self, display_name: &str) -> Result<Vec<Endpoint>, PlatformError>;
    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<Endpoint, PlatformError>;
    async fn deploy_model(
        &self,
        endpoint: &Endpoint,
        model: &Model,
        spec: &DeploymentSpec,
    ) -> Result<(), PlatformError>;
    async fn predict(
        &self,
        endpoint: &Endpoint,
        request: &PredictionRequest,
        timeout: Duration,
    ) -> Result<Value, PlatformError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelList {
    #[serde(default)]
    models: Vec<Model>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointList {
    #[serde(default)]
    endpoints: Vec<Endpoint>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<OperationStatus>,
    response: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadModelResponse {
    model: String,
    #[serde(default)]
    model_version_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: OperationStatus,
}

#[derive(Debug, Serialize)]
struct EnvVar<'a> {
    name: &'a str,
    value: &'a str,
}

/// Where bearer tokens come from. Asked again whenever the API rejects the current one.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<String, PlatformError>;
}

/// `GOOGLE_OAUTH_ACCESS_TOKEN` when set, otherwise the active gcloud credentials.
pub struct GcloudToken;

#[async_trait]
impl TokenSource for GcloudToken {
    async fn fetch(&self) -> Result<String, PlatformError> {
        access_token().await
    }
}

pub struct VertexClient {
    client: reqwest::Client,
    cloud: CloudConfig,
    api_base: String,
    poll_interval: Duration,
    tokens: Box<dyn TokenSource>,
    token: Mutex<Option<String>>,
}

impl VertexClient {
    pub fn new(cloud: CloudConfig, poll_interval: Duration) -> Result<Self, PlatformError> {
        let api_base = format!("https://{}-aiplatform.googleapis.com/v1", cloud.region);
        Self::with_token_source(cloud, poll_interval, api_base, Box::new(GcloudToken))
    }

    pub fn with_token_source(
        cloud: CloudConfig,
        poll_interval: Duration,
        api_base: String,
        tokens: Box<dyn TokenSource>,
    ) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            cloud,
            api_base,
            poll_interval,
            tokens,
            token: Mutex::new(None),
        })
    }

    fn location_url(&self, collection: &str) -> String {
        format!(
            "{}/{}/{}",
            self.api_base,
            self.cloud.location_path(),
            collection
        )
    }

    fn resource_url(&self, resource_name: &str) -> String {
        format!("{}/{}", self.api_base, resource_name)
    }

    async fn token(&self) -> Result<String, PlatformError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.tokens.fetch().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Sends with the cached token and retries once with a fresh one on 401.
    async fn send_authorized(
        &self,
        build: impl Fn(&str) -> reqwest::RequestBuilder + Send + Sync,
    ) -> Result<reqwest::Response, PlatformError> {
        let token = self.token().await?;
        let response = build(&token).send().await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::info!("Access token rejected, refreshing");
        {
            let mut cached = self.token.lock().await;
            if cached.as_deref() == Some(token.as_str()) {
                *cached = None;
            }
        }
        let token = self.token().await?;
        Ok(build(&token).send().await?)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PlatformError> {
        let response = self
            .send_authorized(|token| self.client.get(url).bearer_auth(token).query(query))
            .await?;
        parse_response(response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<T, PlatformError> {
        let response = self
            .send_authorized(|token| {
                let request = self.client.post(url).bearer_auth(token).json(body);
                match timeout {
                    Some(timeout) => request.timeout(timeout),
                    None => request,
                }
            })
            .await?;
        parse_response(response).await
    }

    /// Polls a long-running operation until it is done and returns its response.
    async fn wait_for(&self, mut operation: Operation) -> Result<Value, PlatformError> {
        tracing::debug!("Waiting for operation {}", operation.name);
        while !operation.done {
            tokio::time::sleep(self.poll_interval).await;
            operation = self.get(&self.resource_url(&operation.name), &[]).await?;
        }

        if let Some(status) = operation.error {
            return Err(PlatformError::Operation {
                name: operation.name,
                code: status.code,
                message: status.message,
            });
        }
        Ok(operation.response.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Platform for VertexClient {
    async fn list_models(&self, display_name: &str) -> Result<Vec<Model>, PlatformError> {
        let url = self.location_url("models");
        let filter = display_name_filter(display_name);
        let mut models = Vec::new();
        let mut page_token = String::new();

        loop {
            let page: ModelList = self.get(&url, &page_query(&filter, &page_token)).await?;
            models.extend(page.models);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = next,
                None => break,
            }
        }

        Ok(models)
    }

    async fn list_model_versions(&self, model: &Model) -> Result<Vec<Model>, PlatformError> {
        let url = format!("{}:listVersions", self.resource_url(&model.name));
        let mut versions = Vec::new();
        let mut page_token = String::new();

        loop {
            let page: ModelList = self.get(&url, &page_query("", &page_token)).await?;
            versions.extend(page.models);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = next,
                None => break,
            }
        }

        Ok(versions)
    }

    async fn upload_model(&self, upload: &ModelUpload) -> Result<Model, PlatformError> {
        let operation: Operation = self
            .post(&self.location_url("models:upload"), &upload_body(upload), None)
            .await?;
        let response = self.wait_for(operation).await?;

        let uploaded: UploadModelResponse = serde_json::from_value(response)
            .map_err(|e| PlatformError::Malformed(format!("upload response: {}", e)))?;
        Ok(Model {
            name: uploaded.model,
            display_name: upload.display_name.clone(),
            version_id: uploaded.model_version_id,
        })
    }

    async fn list_endpoints(&self, display_name: &str) -> Result<Vec<Endpoint>, PlatformError> {
        let url = self.location_url("endpoints");
        let filter = display_name_filter(display_name);
        let mut endpoints = Vec::new();
        let mut page_token = String::new();

        loop {
            let page: EndpointList = self.get(&url, &page_query(&filter, &page_token)).await?;
            endpoints.extend(page.endpoints);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = next,
                None => break,
            }
        }

        Ok(endpoints)
    }

    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<Endpoint, PlatformError> {
        let body = json!({
            "displayName": spec.display_name,
            "clientConnectionConfig": {
                "inferenceTimeout": format!("{}s", spec.inference_timeout.as_secs()),
            },
        });
        let operation: Operation = self
            .post(&self.location_url("endpoints"), &body, None)
            .await?;
        let response = self.wait_for(operation).await?;

        serde_json::from_value(response)
            .map_err(|e| PlatformError::Malformed(format!("endpoint response: {}", e)))
    }

    async fn deploy_model(
        &self,
        endpoint: &Endpoint,
        model: &Model,
        spec: &DeploymentSpec,
    ) -> Result<(), PlatformError> {
        let url = format!("{}:deployModel", self.resource_url(&endpoint.name));
        let operation: Operation = self
            .post(&url, &deploy_body(model, spec), None)
            .await?;
        self.wait_for(operation).await?;
        Ok(())
    }

    async fn predict(
        &self,
        endpoint: &Endpoint,
        request: &PredictionRequest,
        timeout: Duration,
    ) -> Result<Value, PlatformError> {
        let url = format!("{}:predict", self.resource_url(&endpoint.name));
        let body = serde_json::to_value(request)
            .map_err(|e| PlatformError::Malformed(format!("prediction request: {}", e)))?;
        self.post(&url, &body, Some(timeout)).await
    }
}

async fn parse_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, PlatformError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&text)
            .map(|envelope| envelope.error.message)
            .unwrap_or(text);
        return Err(PlatformError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.json().await?)
}

async fn access_token() -> Result<String, PlatformError> {
    if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
        return Ok(token);
    }

    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await
        .map_err(|e| PlatformError::Auth(format!("failed to run gcloud: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::Auth(stderr.trim().to_string()));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if token.is_empty() {
        return Err(PlatformError::Auth("gcloud returned an empty token".into()));
    }
    Ok(token)
}

fn page_query<'a>(filter: &'a str, page_token: &'a str) -> Vec<(&'static str, &'a str)> {
    let mut query = Vec::new();
    if !filter.is_empty() {
        query.push(("filter", filter));
    }
    if !page_token.is_empty() {
        query.push(("pageToken", page_token));
    }
    query
}

fn display_name_filter(display_name: &str) -> String {
    format!("display_name=\"{}\"", display_name)
}

fn upload_body(upload: &ModelUpload) -> Value {
    let env: Vec<EnvVar> = upload
        .env
        .iter()
        .map(|(name, value)| EnvVar { name, value })
        .collect();

    let mut body = json!({
        "model": {
            "displayName": upload.display_name,
            "artifactUri": upload.artifact_uri,
            "containerSpec": {
                "imageUri": upload.image_uri,
                "env": env,
                "predictRoute": upload.predict_route,
                "healthRoute": upload.health_route,
            },
            "versionAliases": ["default"],
        },
    });
    if let Some(parent) = &upload.parent_model {
        body["parentModel"] = json!(parent);
    }
    body
}

fn deploy_body(model: &Model, spec: &DeploymentSpec) -> Value {
    json!({
        "deployedModel": {
            "model": model.versioned_name(),
            "displayName": spec.display_name,
            "dedicatedResources": {
                "machineSpec": {
                    "machineType": spec.machine_type,
                    "acceleratorType": spec.accelerator_type,
                    "acceleratorCount": spec.accelerator_count,
                },
                "minReplicaCount": 1,
                "maxReplicaCount": 1,
            },
            "disableContainerLogging": spec.disable_container_logging,
            "enableAccessLogging": spec.enable_access_logging,
        },
        // "0" targets the model being deployed in this request.
        "trafficSplit": { "0": spec.traffic_percentage },
    })
}
