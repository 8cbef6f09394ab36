mod artifacts;
mod model_service;
mod ort_service;
mod processor;
mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;
pub mod policy;
pub mod predictor;

pub use app::start_app;
