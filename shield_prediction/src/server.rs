use crate::{
    config::ServerSettings, predictor::Classify, routes::api_routes, telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, signal, sync::Semaphore};

#[derive(Clone)]
pub struct SharedState {
    pub classifier: Arc<dyn Classify>,
    /// Bounds in-flight inference to the configured worker count.
    pub limiter: Arc<Semaphore>,
    pub metrics: Arc<Metrics>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        classifier: Arc<dyn Classify>,
        settings: &ServerSettings,
        concurrency: usize,
    ) -> anyhow::Result<Self> {
        let addr = settings.get_address();

        let metrics = Arc::new(Metrics::new().map_err(anyhow::Error::msg)?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState {
            classifier,
            limiter: Arc::new(Semaphore::new(concurrency)),
            metrics,
        };

        let router = Router::new()
            .merge(api_routes(settings))
            .with_state(app_state)
            .layer(metrics_layer);

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(
            predict_route = %settings.predict_route,
            health_route = %settings.health_route,
            concurrency,
            "Predictor listening on {}",
            addr
        );

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Predictor stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
