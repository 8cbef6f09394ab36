use async_trait::async_trait;
use shield_wire::PredictionRequest;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::process::Command;

/// Port the predictor listens on inside the container.
const CONTAINER_PORT: u16 = 8080;
const ARTIFACT_MOUNT: &str = "/artifacts";

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("`docker {command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("local endpoint did not become healthy within {0:?}")]
    NotReady(Duration),
    #[error("local endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters of a local serving container.
#[derive(Debug, Clone)]
pub struct LocalRun {
    pub image: String,
    pub artifact_dir: PathBuf,
    pub host_port: u16,
    pub gpus: bool,
    pub predict_route: String,
    pub health_route: String,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build(&self, context: &Path, dockerfile: &Path, tag: &str)
        -> Result<(), ContainerError>;
    async fn push(&self, tag: &str) -> Result<(), ContainerError>;
    /// Starts the image and waits for its health route to answer.
    async fn start_local(&self, run: &LocalRun) -> Result<LocalEndpoint, ContainerError>;
}

pub struct DockerCli;

impl DockerCli {
    async fn stream(args: &[&str]) -> Result<(), ContainerError> {
        tracing::debug!("docker {}", args.join(" "));
        let status = Command::new("docker")
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if !status.success() {
            return Err(ContainerError::CommandFailed {
                command: args.join(" "),
                message: status.to_string(),
            });
        }
        Ok(())
    }

    async fn capture(args: &[String]) -> Result<String, ContainerError> {
        tracing::debug!("docker {}", args.join(" "));
        let output = Command::new("docker").args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: args.join(" "),
                message: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
    ) -> Result<(), ContainerError> {
        let context = context.to_string_lossy();
        let dockerfile = dockerfile.to_string_lossy();
        Self::stream(&[
            "build",
            "-f",
            dockerfile.as_ref(),
            "-t",
            tag,
            context.as_ref(),
        ])
        .await
    }

    async fn push(&self, tag: &str) -> Result<(), ContainerError> {
        Self::stream(&["push", tag]).await
    }

    async fn start_local(&self, run: &LocalRun) -> Result<LocalEndpoint, ContainerError> {
        let artifact_dir = std::fs::canonicalize(&run.artifact_dir)?;

        // The guard exists before `docker run`, so a failed or interrupted start still removes it.
        let endpoint = LocalEndpoint::new(local_container_name(), run)?;
        let args = run_args(run, &artifact_dir, &endpoint.container);
        let container_id = Self::capture(&args).await?;
        tracing::info!(
            "Started local container {} ({})",
            endpoint.container,
            container_id
        );

        endpoint.wait_ready(run.ready_timeout).await?;
        Ok(endpoint)
    }
}

fn local_container_name() -> String {
    format!("shieldgemma2-local-{}", std::process::id())
}

fn run_args(run: &LocalRun, artifact_dir: &Path, name: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-p".to_string(),
        format!("{}:{}", run.host_port, CONTAINER_PORT),
        "-v".to_string(),
        format!("{}:{}:ro", artifact_dir.display(), ARTIFACT_MOUNT),
    ];
    if run.gpus {
        args.extend(["--gpus".to_string(), "all".to_string()]);
    }

    let env = [
        ("APP_ENVIRONMENT", "production".to_string()),
        ("AIP_HTTP_PORT", CONTAINER_PORT.to_string()),
        ("AIP_STORAGE_URI", ARTIFACT_MOUNT.to_string()),
        ("AIP_PREDICT_ROUTE", run.predict_route.clone()),
        ("AIP_HEALTH_ROUTE", run.health_route.clone()),
        ("APP_PREDICTOR__CONCURRENCY", "1".to_string()),
        ("APP_MODEL__USE_CUDA", run.gpus.to_string()),
    ];
    for (name, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", name, value));
    }

    args.push(run.image.clone());
    args
}

/// A running local container. Dropping it removes the container.
pub struct LocalEndpoint {
    container: String,
    base_url: String,
    predict_route: String,
    health_route: String,
    client: reqwest::Client,
}

impl LocalEndpoint {
    fn new(container: String, run: &LocalRun) -> Result<Self, ContainerError> {
        let client = reqwest::Client::builder()
            .timeout(run.request_timeout)
            .build()?;
        Ok(Self {
            container,
            base_url: format!("http://127.0.0.1:{}", run.host_port),
            predict_route: run.predict_route.clone(),
            health_route: run.health_route.clone(),
            client,
        })
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<(), ContainerError> {
        let started = Instant::now();
        while started.elapsed() < timeout {
            let response = self
                .client
                .get(format!("{}{}", self.base_url, self.health_route))
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            if matches!(&response, Ok(r) if r.status().is_success()) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(ContainerError::NotReady(timeout))
    }

    pub async fn health_check(&self) -> Result<String, ContainerError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, self.health_route))
            .send()
            .await?;
        let status = response.status();
        Ok(format!("{} {}", status, response.text().await?))
    }

    pub async fn predict(&self, request: &PredictionRequest) -> Result<String, ContainerError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, self.predict_route))
            .json(request)
            .send()
            .await?;
        let status = response.status();
        Ok(format!("{} {}", status, response.text().await?))
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        tracing::info!("Removing local container {}", self.container);
        match std::process::Command::new("docker")
            .args(["rm", "-f", self.container.as_str()])
            .stdout(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::warn!(
                "Failed to remove container {}: {}",
                self.container,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => tracing::error!("Failed to run docker rm: {}", e),
        }
    }
}
