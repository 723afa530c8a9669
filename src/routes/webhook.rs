use axum::body::Bytes;
use axum::extract::State;

use crate::app_state::AppState;
use crate::models::chat::Update;

/// GET /: liveness.
pub async fn index() -> &'static str {
    "Ok"
}

/// POST /<token>/: Telegram webhook.
///
/// Always answers `Ok`: the chat transport only needs to know the update was
/// received, and a non-2xx answer would make it resend the same update.
pub async fn webhook(State(state): State<AppState>, body: Bytes) -> &'static str {
    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring undecodable webhook update");
            return "Ok";
        }
    };

    let Some(message) = update.message else {
        tracing::debug!(update_id = update.update_id, "Update without message ignored");
        return "Ok";
    };

    tracing::info!(
        update_id = update.update_id,
        chat_id = %message.chat.id,
        message_id = message.message_id,
        photo = message.is_photo(),
        "Incoming message"
    );

    if let Err(e) = state.handler.handle_message(&message).await {
        tracing::error!(
            chat_id = %message.chat.id,
            message_id = message.message_id,
            error = %e,
            "Message handling failed"
        );
    }
    "Ok"
}
