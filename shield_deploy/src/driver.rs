//! The fixed deployment sequence: image, push, local run, upload, deploy, predict.

use crate::{
    cli::Cli,
    config::{CloudConfig, DeploySettings},
    container::{ContainerError, ContainerRuntime, LocalRun},
    instances::{load_instances, request_from_images, InstancesError},
    vertex::{DeploymentSpec, Endpoint, EndpointSpec, Model, ModelUpload, Platform, PlatformError},
};
use shield_wire::PredictionRequest;
use std::{fmt::Display, future::Future, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("No existing model found to deploy. Please use --upload to create a new model first.")]
    NoModelToDeploy,
    #[error("No endpoint found. Please deploy the model first.")]
    NoEndpoint,
    #[error("Model {0} has no versions to deploy")]
    NoModelVersions(String),
    #[error("Interrupted, local endpoint removed")]
    Interrupted,
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Instances(#[from] InstancesError),
}

pub struct Driver<P: Platform, C: ContainerRuntime> {
    platform: P,
    runtime: C,
    cloud: CloudConfig,
    settings: DeploySettings,
}

impl<P: Platform, C: ContainerRuntime> Driver<P, C> {
    pub fn new(platform: P, runtime: C, cloud: CloudConfig, settings: DeploySettings) -> Self {
        Self {
            platform,
            runtime,
            cloud,
            settings,
        }
    }

    pub async fn run(&self, cli: &Cli) -> Result<(), DeployError> {
        let image = self.settings.container_uri(&self.cloud);

        if cli.rebuild {
            println!("Rebuilding container image...");
            self.runtime
                .build(&self.settings.build_context, &self.settings.dockerfile, &image)
                .await?;
        } else {
            println!("Loading existing container image...");
        }

        if cli.push {
            println!("Pushing container image...");
            self.runtime.push(&image).await?;
        }

        if cli.local {
            self.run_local_until(&image, ctrl_c()).await?;
        }

        if cli.upload || cli.deploy {
            let existing = self
                .platform
                .list_models(&self.settings.model_display_name)
                .await?;

            let uploaded = if cli.upload {
                Some(self.upload(&image, &existing).await?)
            } else {
                None
            };

            if cli.deploy {
                let model = match uploaded {
                    Some(model) => model,
                    None => self.latest_version(&existing).await?,
                };
                self.deploy(&model).await?;
            }
        }

        if cli.predict {
            self.predict().await?;
        }

        if !cli.assess.is_empty() {
            self.assess(&cli.assess).await?;
        }

        Ok(())
    }

    /// Runs the local endpoint unless `interrupt` fires first. Either way the
    /// container guard is dropped before this returns.
    async fn run_local_until(
        &self,
        image: &str,
        interrupt: impl Future<Output = ()>,
    ) -> Result<(), DeployError> {
        tokio::select! {
            result = self.run_local(image) => result,
            _ = interrupt => {
                println!("Interrupted, removing local endpoint...");
                Err(DeployError::Interrupted)
            }
        }
    }

    async fn run_local(&self, image: &str) -> Result<(), DeployError> {
        println!("Deploying local endpoint...");
        let run = LocalRun {
            image: image.to_string(),
            artifact_dir: self.settings.local.artifact_dir.clone(),
            host_port: self.settings.local.port,
            gpus: self.settings.local.gpus,
            predict_route: self.settings.predict_route.clone(),
            health_route: self.settings.health_route.clone(),
            ready_timeout: Duration::from_secs(self.settings.local.ready_timeout_secs),
            request_timeout: self.settings.predict_timeout(),
        };
        let endpoint = self.runtime.start_local(&run).await?;

        let health = endpoint.health_check().await?;
        println!("{}", health);

        let request = load_instances(&self.settings.instances_file)?;
        let response = endpoint.predict(&request).await?;
        println!("{}", response);

        Ok(())
    }

    async fn upload(&self, image: &str, existing: &[Model]) -> Result<Model, DeployError> {
        let parent_model = match existing.first() {
            Some(parent) => {
                println!("Found existing model, uploading new version...");
                Some(parent.name.clone())
            }
            None => {
                println!("No existing model found, creating new model...");
                None
            }
        };

        let upload = ModelUpload {
            display_name: self.settings.model_display_name.clone(),
            artifact_uri: self.settings.artifact_uri(&self.cloud),
            image_uri: image.to_string(),
            env: vec![("APP_PREDICTOR__CONCURRENCY".to_string(), "1".to_string())],
            predict_route: self.settings.predict_route.clone(),
            health_route: self.settings.health_route.clone(),
            parent_model,
        };
        let model = self.platform.upload_model(&upload).await?;

        if upload.parent_model.is_some() {
            println!("Added new version: {}", model.version_id);
        } else {
            println!("Created model {} (version {})", model.name, model.version_id);
        }
        Ok(model)
    }

    async fn latest_version(&self, existing: &[Model]) -> Result<Model, DeployError> {
        let Some(parent) = existing.first() else {
            return Err(DeployError::NoModelToDeploy);
        };

        println!("Using latest model version for deployment...");
        let versions = self.platform.list_model_versions(parent).await?;
        let latest = versions
            .into_iter()
            .max_by_key(Model::version_number)
            .ok_or_else(|| DeployError::NoModelVersions(parent.name.clone()))?;

        println!("Deploying version: {}", latest.version_id);
        Ok(latest)
    }

    async fn deploy(&self, model: &Model) -> Result<(), DeployError> {
        println!("Checking for existing endpoint...");
        let endpoints = self
            .platform
            .list_endpoints(&self.settings.endpoint_display_name)
            .await?;

        let endpoint = match endpoints.into_iter().next() {
            Some(endpoint) => {
                println!("Found existing endpoint, deploying to it...");
                endpoint
            }
            None => {
                println!("No existing endpoint found, creating new endpoint...");
                self.platform
                    .create_endpoint(&EndpointSpec {
                        display_name: self.settings.endpoint_display_name.clone(),
                        inference_timeout: Duration::from_secs(
                            self.settings.endpoint_inference_timeout_secs,
                        ),
                    })
                    .await?
            }
        };

        let machine = &self.settings.machine;
        let spec = DeploymentSpec {
            display_name: self.settings.model_display_name.clone(),
            machine_type: machine.machine_type.clone(),
            accelerator_type: machine.accelerator_type.clone(),
            accelerator_count: machine.accelerator_count,
            traffic_percentage: 100,
            disable_container_logging: false,
            enable_access_logging: true,
        };
        self.platform.deploy_model(&endpoint, model, &spec).await?;

        println!("Deployed {} to {}", model.versioned_name(), endpoint.name);
        Ok(())
    }

    async fn predict(&self) -> Result<(), DeployError> {
        let endpoint = self.fetch_endpoint().await?;

        println!("Loading instances...");
        let request = load_instances(&self.settings.instances_file)?;

        println!("Submitting prediction request...");
        let response = self.submit(&endpoint, &request).await?;
        println!("Prediction response: {}", response);

        Ok(())
    }

    async fn assess(&self, images: &[std::path::PathBuf]) -> Result<(), DeployError> {
        let endpoint = self.fetch_endpoint().await?;
        let request = request_from_images(images)?;

        println!("Assessing {} images...", request.instances.len());
        let response = self.submit(&endpoint, &request).await?;
        println!("Assessment response: {}", response);

        Ok(())
    }

    async fn fetch_endpoint(&self) -> Result<Endpoint, DeployError> {
        println!("Fetching endpoint...");
        self.platform
            .list_endpoints(&self.settings.endpoint_display_name)
            .await?
            .into_iter()
            .next()
            .ok_or(DeployError::NoEndpoint)
    }

    async fn submit(
        &self,
        endpoint: &Endpoint,
        request: &PredictionRequest,
    ) -> Result<String, DeployError> {
        let response = self
            .platform
            .predict(endpoint, request, self.settings.predict_timeout())
            .await?;
        Ok(serde_json::to_string_pretty(&response).unwrap_or_else(|_| response.to_string()))
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Reports a driver outcome the way the CLI prints it and returns the exit status.
pub fn exit_code<E: Display>(result: &Result<(), E>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::LocalEndpoint;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    };

    #[derive(Default)]
    struct MockPlatform {
        models: Vec<Model>,
        versions: Vec<Model>,
        endpoints: Vec<Endpoint>,
        calls: Mutex<Vec<String>>,
        uploads: Mutex<Vec<ModelUpload>>,
        deployments: Mutex<Vec<(String, String)>>,
    }

    impl MockPlatform {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn model(id: &str, version: &str) -> Model {
        Model {
            name: format!("projects/1/locations/europe-west2/models/{}", id),
            display_name: "ShieldGemma2".into(),
            version_id: version.into(),
        }
    }

    fn endpoint(id: &str) -> Endpoint {
        Endpoint {
            name: format!("projects/1/locations/europe-west2/endpoints/{}", id),
            display_name: "ShieldGemma2_endpoint".into(),
        }
    }

    #[async_trait]
    impl Platform for MockPlatform {
        async fn list_models(&self, _display_name: &str) -> Result<Vec<Model>, PlatformError> {
            self.record("list_models");
            Ok(self.models.clone())
        }

        async fn list_model_versions(&self, _model: &Model) -> Result<Vec<Model>, PlatformError> {
            self.record("list_model_versions");
            Ok(self.versions.clone())
        }

        async fn upload_model(&self, upload: &ModelUpload) -> Result<Model, PlatformError> {
            self.record("upload_model");
            self.uploads.lock().unwrap().push(upload.clone());
            Ok(model("99", "7"))
        }

        async fn list_endpoints(&self, _display_name: &str) -> Result<Vec<Endpoint>, PlatformError> {
            self.record("list_endpoints");
            Ok(self.endpoints.clone())
        }

        async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<Endpoint, PlatformError> {
            self.record("create_endpoint");
            assert_eq!(spec.inference_timeout, Duration::from_secs(600));
            Ok(endpoint("new"))
        }

        async fn deploy_model(
            &self,
            endpoint: &Endpoint,
            model: &Model,
            spec: &DeploymentSpec,
        ) -> Result<(), PlatformError> {
            self.record("deploy_model");
            assert_eq!(spec.traffic_percentage, 100);
            self.deployments
                .lock()
                .unwrap()
                .push((endpoint.name.clone(), model.versioned_name()));
            Ok(())
        }

        async fn predict(
            &self,
            _endpoint: &Endpoint,
            request: &PredictionRequest,
            timeout: Duration,
        ) -> Result<Value, PlatformError> {
            self.record("predict");
            assert_eq!(timeout, Duration::from_secs(600));
            Ok(json!({"predictions": vec![json!({}); request.instances.len()]}))
        }
    }

    #[derive(Default)]
    struct MockRuntime {
        calls: Mutex<Vec<String>>,
        /// When set, `start_local` never finishes and flags the drop of its in-flight work.
        hang_local: Option<Arc<AtomicBool>>,
    }

    /// Stands in for the container guard held while the local run is in progress.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn build(
            &self,
            _context: &Path,
            _dockerfile: &Path,
            tag: &str,
        ) -> Result<(), ContainerError> {
            self.calls.lock().unwrap().push(format!("build {}", tag));
            Ok(())
        }

        async fn push(&self, tag: &str) -> Result<(), ContainerError> {
            self.calls.lock().unwrap().push(format!("push {}", tag));
            Ok(())
        }

        async fn start_local(&self, _run: &LocalRun) -> Result<LocalEndpoint, ContainerError> {
            if let Some(dropped) = &self.hang_local {
                let _guard = DropFlag(dropped.clone());
                std::future::pending::<()>().await;
            }
            Err(ContainerError::CommandFailed {
                command: "run".into(),
                message: "no docker in tests".into(),
            })
        }
    }

    fn cloud() -> CloudConfig {
        CloudConfig::from_values(Some("my-project".into()), Some("europe-west2".into())).unwrap()
    }

    fn driver(platform: MockPlatform) -> Driver<MockPlatform, MockRuntime> {
        Driver::new(platform, MockRuntime::default(), cloud(), DeploySettings::default())
    }

    fn flags(f: impl FnOnce(&mut Cli)) -> Cli {
        let mut cli = Cli::default();
        f(&mut cli);
        cli
    }

    #[tokio::test]
    async fn test_deploy_without_model_fails() {
        let driver = driver(MockPlatform::default());

        let err = driver.run(&flags(|c| c.deploy = true)).await.unwrap_err();

        assert!(matches!(err, DeployError::NoModelToDeploy));
        assert_eq!(
            format!("Error: {}", err),
            "Error: No existing model found to deploy. Please use --upload to create a new model first."
        );
        assert_eq!(driver.platform.calls(), vec!["list_models"]);
    }

    #[tokio::test]
    async fn test_predict_without_endpoint_fails() {
        let driver = driver(MockPlatform::default());

        let err = driver.run(&flags(|c| c.predict = true)).await.unwrap_err();

        assert!(matches!(err, DeployError::NoEndpoint));
        assert_eq!(
            format!("Error: {}", err),
            "Error: No endpoint found. Please deploy the model first."
        );
    }

    #[tokio::test]
    async fn test_upload_creates_new_model_when_none_exists() {
        let driver = driver(MockPlatform::default());

        driver.run(&flags(|c| c.upload = true)).await.unwrap();

        let uploads = driver.platform.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].parent_model, None);
        assert_eq!(uploads[0].artifact_uri, "gs://my-project_ai/shieldgemma-2-4b-it");
        assert_eq!(
            uploads[0].env,
            vec![("APP_PREDICTOR__CONCURRENCY".to_string(), "1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_upload_attaches_version_to_existing_model() {
        let driver = driver(MockPlatform {
            models: vec![model("42", "3")],
            ..MockPlatform::default()
        });

        driver.run(&flags(|c| c.upload = true)).await.unwrap();

        let uploads = driver.platform.uploads.lock().unwrap();
        assert_eq!(
            uploads[0].parent_model.as_deref(),
            Some("projects/1/locations/europe-west2/models/42")
        );
    }

    #[tokio::test]
    async fn test_deploy_reuses_highest_version_and_existing_endpoint() {
        let driver = driver(MockPlatform {
            models: vec![model("42", "3")],
            versions: vec![model("42", "2"), model("42", "10"), model("42", "9")],
            endpoints: vec![endpoint("5")],
            ..MockPlatform::default()
        });

        driver.run(&flags(|c| c.deploy = true)).await.unwrap();

        let deployments = driver.platform.deployments.lock().unwrap();
        assert_eq!(
            *deployments,
            vec![(
                "projects/1/locations/europe-west2/endpoints/5".to_string(),
                "projects/1/locations/europe-west2/models/42@10".to_string()
            )]
        );
        assert!(!driver.platform.calls().contains(&"create_endpoint".to_string()));
    }

    #[tokio::test]
    async fn test_upload_and_deploy_uses_uploaded_model_and_creates_endpoint() {
        let driver = driver(MockPlatform::default());

        driver
            .run(&flags(|c| {
                c.upload = true;
                c.deploy = true;
            }))
            .await
            .unwrap();

        assert_eq!(
            driver.platform.calls(),
            vec![
                "list_models",
                "upload_model",
                "list_endpoints",
                "create_endpoint",
                "deploy_model"
            ]
        );
        let deployments = driver.platform.deployments.lock().unwrap();
        assert_eq!(deployments[0].0, "projects/1/locations/europe-west2/endpoints/new");
        assert_eq!(deployments[0].1, "projects/1/locations/europe-west2/models/99@7");
    }

    #[tokio::test]
    async fn test_rebuild_and_push_use_container_uri() {
        let driver = driver(MockPlatform::default());

        driver
            .run(&flags(|c| {
                c.rebuild = true;
                c.push = true;
            }))
            .await
            .unwrap();

        let uri = "europe-west2-docker.pkg.dev/my-project/ai/shieldgemma2-predictor";
        assert_eq!(
            *driver.runtime.calls.lock().unwrap(),
            vec![format!("build {}", uri), format!("push {}", uri)]
        );
        assert!(driver.platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_predict_submits_instances_file() {
        let path = std::env::temp_dir().join(format!("{}-driver-instances.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"instances": [{"bytesBase64Encoded": "aGVsbG8="}], "parameters": {"custom_policies": {}}}"#,
        )
        .unwrap();
        let settings = DeploySettings {
            instances_file: PathBuf::from(&path),
            ..DeploySettings::default()
        };
        let driver = Driver::new(
            MockPlatform {
                endpoints: vec![endpoint("5")],
                ..MockPlatform::default()
            },
            MockRuntime::default(),
            cloud(),
            settings,
        );

        driver.run(&flags(|c| c.predict = true)).await.unwrap();

        assert_eq!(driver.platform.calls(), vec!["list_endpoints", "predict"]);
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_local_failure_propagates() {
        let driver = driver(MockPlatform::default());

        let err = driver.run(&flags(|c| c.local = true)).await.unwrap_err();

        assert!(matches!(err, DeployError::Container(_)));
    }

    #[tokio::test]
    async fn test_interrupted_local_run_releases_the_endpoint() {
        let dropped = Arc::new(AtomicBool::new(false));
        let driver = Driver::new(
            MockPlatform::default(),
            MockRuntime {
                hang_local: Some(dropped.clone()),
                ..MockRuntime::default()
            },
            cloud(),
            DeploySettings::default(),
        );

        let interrupt = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        };
        let err = driver
            .run_local_until("image", interrupt)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Interrupted));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(exit_code(&Err::<(), _>(err)), 1);
    }

    #[tokio::test]
    async fn test_guard_failures_exit_with_status_one() {
        let driver = driver(MockPlatform::default());

        let deploy = driver.run(&flags(|c| c.deploy = true)).await;
        let predict = driver.run(&flags(|c| c.predict = true)).await;

        assert_eq!(exit_code(&deploy), 1);
        assert_eq!(exit_code(&predict), 1);
        assert_eq!(exit_code(&driver.run(&Cli::default()).await), 0);
    }

    #[tokio::test]
    async fn test_assess_scores_image_files_on_the_endpoint() {
        let image = std::env::temp_dir().join(format!("{}-assess.png", std::process::id()));
        std::fs::write(&image, b"png bytes").unwrap();
        let driver = driver(MockPlatform {
            endpoints: vec![endpoint("5")],
            ..MockPlatform::default()
        });

        driver
            .run(&flags(|c| c.assess = vec![image.clone()]))
            .await
            .unwrap();

        assert_eq!(driver.platform.calls(), vec!["list_endpoints", "predict"]);
        std::fs::remove_file(image).unwrap();
    }

    #[tokio::test]
    async fn test_assess_without_endpoint_fails() {
        let driver = driver(MockPlatform::default());

        let err = driver
            .run(&flags(|c| c.assess = vec![PathBuf::from("cat.png")]))
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::NoEndpoint));
    }
}
