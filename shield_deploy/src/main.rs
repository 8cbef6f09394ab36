use clap::Parser;
use shield_deploy::{
    cli::Cli,
    config::{CloudConfig, DeploySettings},
    container::DockerCli,
    driver::{exit_code, Driver},
    vertex::VertexClient,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let code = exit_code(&run(&cli).await);
    std::process::exit(code);
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let cloud = CloudConfig::from_env()?;
    let settings = DeploySettings::load()?;
    tracing::debug!("Deploying to {} with {:?}", cloud.location_path(), settings);

    let platform = VertexClient::new(cloud.clone(), settings.operation_poll_interval())?;
    let driver = Driver::new(platform, DockerCli, cloud, settings);
    driver.run(cli).await?;

    Ok(())
}
