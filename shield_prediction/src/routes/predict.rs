use crate::{predictor::PredictorError, server::SharedState};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use shield_wire::{PredictionRequest, PredictionResponse};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("invalid request body: {message}")]
    Body { status: StatusCode, message: String },
    #[error(transparent)]
    Predictor(#[from] PredictorError),
    #[error("prediction worker failed: {0}")]
    Worker(String),
}

impl PredictError {
    fn is_client_error(&self) -> bool {
        match self {
            PredictError::Body { .. } => true,
            PredictError::Predictor(e) => e.is_client_error(),
            PredictError::Worker(_) => false,
        }
    }
}

impl From<JsonRejection> for PredictError {
    fn from(rejection: JsonRejection) -> Self {
        // Oversized bodies keep their 413, every other body problem is a plain 400.
        let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            StatusCode::PAYLOAD_TOO_LARGE
        } else {
            StatusCode::BAD_REQUEST
        };
        PredictError::Body {
            status,
            message: rejection.body_text(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = match &self {
            PredictError::Body { status, .. } => *status,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[instrument(skip_all)]
pub async fn predict(
    State(state): State<SharedState>,
    payload: Result<Json<PredictionRequest>, JsonRejection>,
) -> Result<Json<PredictionResponse>, PredictError> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let err = PredictError::from(rejection);
            state.metrics.record_request("rejected");
            tracing::warn!("Prediction rejected: {}", err);
            return Err(err);
        }
    };

    let permit = state
        .limiter
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| PredictError::Worker(e.to_string()))?;

    let started = Instant::now();
    let images = request.instances.len();
    let classifier = state.classifier.clone();
    // The worker owns the permit, so a dropped request cannot free the slot early.
    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        classifier.classify(&request)
    })
    .await
    .map_err(|e| PredictError::Worker(e.to_string()))?;

    match result {
        Ok(response) => {
            let elapsed = started.elapsed().as_millis() as u64;
            state.metrics.record_request("ok");
            state.metrics.record_prediction(elapsed, images);
            tracing::info!(elapsed_ms = elapsed, "Scored {} images", images);
            Ok(Json(response))
        }
        Err(e) => {
            let outcome = if e.is_client_error() {
                "rejected"
            } else {
                "failed"
            };
            state.metrics.record_request(outcome);
            tracing::error!("Prediction {}: {}", outcome, e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        predictor::Classify, processor::ProcessorError, routes::tests::shared_state,
    };
    use shield_wire::{ImagePrediction, Instance};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    /// Tracks how many classifications overlap.
    #[derive(Default)]
    struct SlowClassifier {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Classify for SlowClassifier {
        fn classify(
            &self,
            request: &PredictionRequest,
        ) -> Result<PredictionResponse, PredictorError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PredictionResponse {
                predictions: vec![ImagePrediction::new(); request.instances.len()],
            })
        }
    }

    fn one_image() -> Json<PredictionRequest> {
        Json(PredictionRequest {
            instances: vec![Instance {
                bytes_base64_encoded: "aGVsbG8=".into(),
            }],
            ..PredictionRequest::default()
        })
    }

    #[test]
    fn test_request_errors_map_to_bad_request() {
        let err = PredictError::from(PredictorError::Processor(ProcessorError::EmptyBatch));

        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_model_errors_map_to_internal_error() {
        let err = PredictError::from(PredictorError::MissingOutput("probabilities"));

        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PredictError::Worker("panicked".into())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_request_keeps_worker_slot_until_inference_ends() {
        let classifier = Arc::new(SlowClassifier::default());
        let state = shared_state(classifier.clone(), 1);

        let first = tokio::spawn(predict(State(state.clone()), Ok(one_image())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.abort();

        let second = predict(State(state), Ok(one_image())).await;

        assert!(second.is_ok());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(classifier.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_run_one_at_a_time() {
        let classifier = Arc::new(SlowClassifier::default());
        let state = shared_state(classifier.clone(), 1);

        let handles: Vec<_> = (0..3)
            .map(|_| tokio::spawn(predict(State(state.clone()), Ok(one_image()))))
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(classifier.max_active.load(Ordering::SeqCst), 1);
    }
}
