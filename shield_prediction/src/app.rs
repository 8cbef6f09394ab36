use crate::{config::Settings, predictor::Predictor, server::HttpServer};
use std::sync::Arc;

pub async fn start_app(settings: Settings) -> anyhow::Result<()> {
    let predictor = match Predictor::load(&settings.model).await {
        Ok(predictor) => Arc::new(predictor),
        Err(e) => {
            tracing::error!("Failed to load predictor: {}", e);
            return Err(e.into());
        }
    };

    let server = HttpServer::new(
        predictor,
        &settings.server,
        settings.predictor.concurrency,
    )
    .await?;

    server.run().await
}
