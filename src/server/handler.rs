use axum::extract::State;
use axum::http::StatusCode;
use prometheus::Registry;

pub async fn health_check() -> &'static str {
    "OK"
}

/// Renders the current state of the registry. Sampling happens on the
/// collector registry's own schedule, never on scrape.
pub async fn metrics(State(registry): State<Registry>) -> Result<String, StatusCode> {
    let metric_families = registry.gather();
    let encoder = prometheus::TextEncoder::new();

    encoder.encode_to_string(&metric_families).map_err(|error| {
        tracing::error!(?error, "Failed to encode the metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
