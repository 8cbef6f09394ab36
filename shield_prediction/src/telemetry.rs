use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub struct Metrics {
    prediction_requests: Counter<u64>,
    prediction_duration: Histogram<u64>,
    images_scored: Counter<u64>,
    pub registry: Registry,
    // Keeps the pipeline alive when the global provider is replaced.
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| format!("failed to build prometheus exporter: {}", e))?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("shield_prediction");
        global::set_meter_provider(provider.clone());

        let prediction_requests = meter
            .u64_counter("prediction_requests_total")
            .with_description("Prediction requests by outcome")
            .build();

        let prediction_duration = meter
            .u64_histogram("prediction_duration_ms")
            .with_boundaries(duration_boundaries())
            .with_description("Duration of preprocessing plus inference in milliseconds")
            .build();

        let images_scored = meter
            .u64_counter("images_scored_total")
            .with_description("Images scored against the policy set")
            .build();

        Ok(Metrics {
            prediction_requests,
            prediction_duration,
            images_scored,
            registry,
            _provider: provider,
        })
    }

    pub fn record_request(&self, outcome: &str) {
        let attributes = [KeyValue::new("outcome", outcome.to_string())];
        self.prediction_requests.add(1, &attributes);
    }

    pub fn record_prediction(&self, duration_ms: u64, images: usize) {
        self.prediction_duration.record(duration_ms, &[]);
        self.images_scored.add(images as u64, &[]);
    }
}

/// Millisecond buckets: fine-grained below a second, coarse up to a minute.
fn duration_boundaries() -> Vec<f64> {
    let sub_second = (50..1000).step_by(50);
    let seconds = (1000..10_000).step_by(1000);
    let tail = (10_000..=60_000).step_by(10_000);

    sub_second.chain(seconds).chain(tail).map(|x| x as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_boundaries_are_sorted_and_unique() {
        let boundaries = duration_boundaries();

        assert_eq!(boundaries.first(), Some(&50.0));
        assert_eq!(boundaries.last(), Some(&60_000.0));
        assert!(boundaries.windows(2).all(|w| w[0] < w[1]));
        assert!(boundaries.contains(&950.0));
        assert!(boundaries.contains(&1000.0));
        assert!(boundaries.contains(&10_000.0));
    }
}
