use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "shield_deploy")]
#[command(about = "Build/Upload and Deploy the ShieldGemma2 predictor")]
#[command(version)]
pub struct Cli {
    /// Rebuild the container image instead of referencing the existing one
    #[arg(long)]
    pub rebuild: bool,

    /// Upload the model to the Vertex AI model registry
    #[arg(long)]
    pub upload: bool,

    /// Push the container image to the registry
    #[arg(long)]
    pub push: bool,

    /// Deploy the model to the Vertex AI endpoint
    #[arg(long)]
    pub deploy: bool,

    /// Submit a prediction request from the instances file
    #[arg(long)]
    pub predict: bool,

    /// Run the image as a local endpoint and send it one prediction
    #[arg(long)]
    pub local: bool,

    /// Score local image files against the deployed endpoint
    #[arg(long, value_name = "IMAGE", num_args = 1..)]
    pub assess: Vec<PathBuf>,
}
