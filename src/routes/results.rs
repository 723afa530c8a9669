use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::models::job::JobId;
use crate::models::prediction::FailureNotice;
use crate::services::results::{self, DeliveryStatus};

#[derive(Debug, Deserialize)]
pub struct ResultsParams {
    pub prediction_id: Option<String>,
}

/// POST /results?prediction_id=<id>: relay a finished prediction to the user.
pub async fn deliver_results(
    State(state): State<AppState>,
    Query(params): Query<ResultsParams>,
) -> (StatusCode, String) {
    // A missing id, or one that is not a UUID, can never have been assigned.
    let Some(Ok(prediction_id)) = params.prediction_id.as_deref().map(str::parse::<JobId>) else {
        return not_found();
    };

    match results::deliver_results(state.records.as_ref(), state.chat.as_ref(), &prediction_id).await {
        Ok(DeliveryStatus::Delivered) => (StatusCode::OK, "Ok".to_string()),
        Ok(DeliveryStatus::NotFound) => not_found(),
        Err(e) => {
            tracing::error!(prediction_id = %prediction_id, error = %e, "Results delivery failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// POST /failures: relay a worker failure notice to the user.
pub async fn deliver_failure(
    State(state): State<AppState>,
    Json(notice): Json<FailureNotice>,
) -> (StatusCode, String) {
    match results::deliver_failure(state.chat.as_ref(), &notice).await {
        Ok(()) => (StatusCode::OK, "Ok".to_string()),
        Err(e) => {
            tracing::error!(chat_id = %notice.chat_id, error = %e, "Failure notice delivery failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "Prediction ID not found".to_string())
}
