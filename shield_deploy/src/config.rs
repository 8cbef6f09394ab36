use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CloudConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name}=`{value}` is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Project and region every platform call is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub project: String,
    pub region: String,
}

impl CloudConfig {
    pub fn from_env() -> Result<Self, CloudConfigError> {
        Self::from_values(
            std::env::var("GOOGLE_CLOUD_PROJECT").ok(),
            std::env::var("GOOGLE_CLOUD_REGION").ok(),
        )
    }

    pub fn from_values(
        project: Option<String>,
        region: Option<String>,
    ) -> Result<Self, CloudConfigError> {
        let project = project
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or(CloudConfigError::Missing("GOOGLE_CLOUD_PROJECT"))?;
        let region = region
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .ok_or(CloudConfigError::Missing("GOOGLE_CLOUD_REGION"))?;

        if let Err(reason) = check_project_id(&project) {
            return Err(CloudConfigError::Invalid {
                name: "GOOGLE_CLOUD_PROJECT",
                value: project,
                reason,
            });
        }
        if let Err(reason) = check_region(&region) {
            return Err(CloudConfigError::Invalid {
                name: "GOOGLE_CLOUD_REGION",
                value: region,
                reason,
            });
        }

        Ok(Self { project, region })
    }

    /// `projects/{project}/locations/{region}`
    pub fn location_path(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.region)
    }
}

fn check_project_id(project: &str) -> Result<(), &'static str> {
    if !(6..=30).contains(&project.len()) {
        return Err("must be 6 to 30 characters long");
    }
    if !project.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err("must start with a lowercase letter");
    }
    if !project
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("may only contain lowercase letters, digits and hyphens");
    }
    if project.ends_with('-') {
        return Err("must not end with a hyphen");
    }
    Ok(())
}

fn check_region(region: &str) -> Result<(), &'static str> {
    let mut parts = region.split('-');
    let (Some(area), Some(zone)) = (parts.next(), parts.next()) else {
        return Err("expected a region such as `europe-west2`");
    };
    if parts.next().is_some() {
        return Err("expected a region, not a zone");
    }
    if area.is_empty() || !area.chars().all(|c| c.is_ascii_lowercase()) {
        return Err("expected a region such as `europe-west2`");
    }
    if !zone.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        || !zone.ends_with(|c: char| c.is_ascii_digit())
    {
        return Err("expected a region such as `europe-west2`");
    }
    Ok(())
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeploySettings {
    pub model_display_name: String,
    pub endpoint_display_name: String,
    pub repository: String,
    pub image_name: String,
    pub artifact_bucket_suffix: String,
    pub artifact_path: String,
    pub build_context: PathBuf,
    pub dockerfile: PathBuf,
    pub instances_file: PathBuf,
    pub predict_route: String,
    pub health_route: String,
    pub predict_timeout_secs: u64,
    pub endpoint_inference_timeout_secs: u64,
    pub operation_poll_secs: u64,
    pub machine: MachineSettings,
    pub local: LocalSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MachineSettings {
    pub machine_type: String,
    pub accelerator_type: String,
    pub accelerator_count: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LocalSettings {
    pub artifact_dir: PathBuf,
    pub port: u16,
    pub gpus: bool,
    pub ready_timeout_secs: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            model_display_name: "ShieldGemma2".into(),
            endpoint_display_name: "ShieldGemma2_endpoint".into(),
            repository: "ai".into(),
            image_name: "shieldgemma2-predictor".into(),
            artifact_bucket_suffix: "_ai".into(),
            artifact_path: "shieldgemma-2-4b-it".into(),
            build_context: PathBuf::from("."),
            dockerfile: PathBuf::from("Dockerfile"),
            instances_file: PathBuf::from("instances.json"),
            predict_route: "/predict".into(),
            health_route: "/health".into(),
            predict_timeout_secs: 600,
            endpoint_inference_timeout_secs: 600,
            operation_poll_secs: 10,
            machine: MachineSettings::default(),
            local: LocalSettings::default(),
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            machine_type: "g2-standard-12".into(),
            accelerator_type: "NVIDIA_L4".into(),
            accelerator_count: 1,
        }
    }
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("shieldgemma-2-4b-it"),
            port: 8080,
            gpus: false,
            ready_timeout_secs: 600,
        }
    }
}

impl DeploySettings {
    /// Reads the optional `configuration/deploy.yaml`, then `DEPLOY_` variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("configuration/deploy").required(false))
            .add_source(
                config::Environment::with_prefix("DEPLOY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize::<DeploySettings>()
    }

    pub fn container_uri(&self, cloud: &CloudConfig) -> String {
        format!(
            "{}-docker.pkg.dev/{}/{}/{}",
            cloud.region, cloud.project, self.repository, self.image_name
        )
    }

    pub fn artifact_uri(&self, cloud: &CloudConfig) -> String {
        format!(
            "gs://{}{}/{}",
            cloud.project, self.artifact_bucket_suffix, self.artifact_path
        )
    }

    pub fn predict_timeout(&self) -> Duration {
        Duration::from_secs(self.predict_timeout_secs)
    }

    pub fn operation_poll_interval(&self) -> Duration {
        Duration::from_secs(self.operation_poll_secs)
    }
}
