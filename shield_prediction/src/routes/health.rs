use axum::{response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

/// The server only binds once the model is loaded, so reaching this means ready.
pub async fn healthcheck() -> impl IntoResponse {
    Json(Health {
        status: "Available",
    })
}
