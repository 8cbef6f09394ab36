mod health;
mod metrics;
mod predict;

use crate::{config::ServerSettings, server::SharedState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

pub fn api_routes(settings: &ServerSettings) -> Router<SharedState> {
    Router::new()
        .route(&settings.health_route, get(health::healthcheck))
        .route(
            &settings.predict_route,
            post(predict::predict).layer(DefaultBodyLimit::max(settings.max_body_bytes())),
        )
        .route("/metrics", get(metrics::metrics_handler))
}
