use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::app_state::AppState;

pub mod health;
pub mod results;
pub mod webhook;

/// Gateway routes. Telegram posts updates to `/<token>/`.
pub fn router(state: AppState, telegram_token: &str) -> Router {
    Router::new()
        .route("/", get(webhook::index))
        .route("/health", get(health::health_check))
        .route(&format!("/{telegram_token}/"), post(webhook::webhook))
        .route("/loadTest/", post(webhook::webhook))
        .route("/results", post(results::deliver_results))
        .route("/failures", post(results::deliver_failure))
        .with_state(state)
}

/// Prometheus scrape endpoint, in text exposition format.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}
