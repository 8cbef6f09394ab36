use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelSettings,
    pub predictor: PredictorSettings,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_predict_route")]
    pub predict_route: String,
    #[serde(default = "default_health_route")]
    pub health_route: String,
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

fn default_predict_route() -> String {
    "/predict".into()
}

fn default_health_route() -> String {
    "/health".into()
}

fn default_max_body_mb() -> usize {
    32
}

impl ServerSettings {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_mb * 1024 * 1024
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelSettings {
    /// Local directory or `gs://bucket/prefix` holding the exported model.
    pub artifact_uri: String,
    /// Where remote artifacts are downloaded to.
    pub download_dir: PathBuf,
    pub onnx_file: String,
    #[serde(default = "default_tokenizer_file")]
    pub tokenizer_file: String,
    #[serde(default = "default_preprocessor_file")]
    pub preprocessor_file: String,
    #[serde(default)]
    pub use_cuda: bool,
}

fn default_tokenizer_file() -> String {
    "tokenizer.json".into()
}

fn default_preprocessor_file() -> String {
    "preprocessor_config.json".into()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PredictorSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if self.predictor.concurrency == 0 {
            return Err("predictor.concurrency must be at least 1".into());
        }
        if self.model.onnx_file.trim().is_empty() {
            return Err("model.onnx_file must not be empty".into());
        }
        if self.model.artifact_uri.trim().is_empty() {
            return Err("model.artifact_uri must not be empty".into());
        }
        for route in [&self.server.predict_route, &self.server.health_route] {
            if !route.starts_with('/') {
                return Err(format!("route `{}` must start with `/`", route));
            }
        }
        Ok(())
    }
}

/// Variables set by Vertex AI on custom serving containers, with the setting each one overrides.
const VERTEX_OVERRIDES: [(&str, &str); 4] = [
    ("AIP_HTTP_PORT", "server.port"),
    ("AIP_PREDICT_ROUTE", "server.predict_route"),
    ("AIP_HEALTH_ROUTE", "server.health_route"),
    ("AIP_STORAGE_URI", "model.artifact_uri"),
];

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let mut builder = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    for (variable, key) in VERTEX_OVERRIDES {
        builder = builder.set_override_option(key, std::env::var(variable).ok())?;
    }

    let settings = builder.build()?.try_deserialize::<Settings>()?;

    if let Err(e) = settings.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(settings)
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}
