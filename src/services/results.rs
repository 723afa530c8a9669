use crate::models::job::JobId;
use crate::models::label::Label;
use crate::models::prediction::FailureNotice;
use crate::services::chat::{ChatClient, ChatError};
use crate::services::records::{RecordError, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// No record yet. The callback may race the write, so this is not an error.
    NotFound,
}

/// Look up a finished prediction and send its summary to the requesting chat.
pub async fn deliver_results(
    records: &dyn RecordStore,
    chat: &dyn ChatClient,
    prediction_id: &JobId,
) -> Result<DeliveryStatus, ResultsError> {
    let Some(record) = records.get_item(prediction_id).await? else {
        tracing::warn!(prediction_id = %prediction_id, "Results requested for unknown prediction");
        return Ok(DeliveryStatus::NotFound);
    };

    chat.send_text(record.chat_id, &format_summary(&record.labels))
        .await?;

    metrics::counter!("results_delivered_total").increment(1);
    tracing::info!(
        prediction_id = %prediction_id,
        chat_id = %record.chat_id,
        labels = record.labels.len(),
        "Prediction results delivered"
    );
    Ok(DeliveryStatus::Delivered)
}

/// Relay a worker failure notice to the user.
pub async fn deliver_failure(chat: &dyn ChatClient, notice: &FailureNotice) -> Result<(), ChatError> {
    chat.send_text(notice.chat_id, &format_failure(notice)).await?;
    tracing::info!(
        prediction_id = ?notice.prediction_id,
        chat_id = %notice.chat_id,
        reason = %notice.reason,
        "Failure notice delivered"
    );
    Ok(())
}

/// "Prediction Results:" followed by one detected class per line.
pub fn format_summary(labels: &[Label]) -> String {
    let mut text = String::from("Prediction Results:\n");
    if labels.is_empty() {
        text.push_str("No objects detected.");
    } else {
        let classes: Vec<&str> = labels.iter().map(|label| label.class.as_str()).collect();
        text.push_str(&classes.join("\n"));
    }
    text
}

pub fn format_failure(notice: &FailureNotice) -> String {
    format!("Sorry, your image could not be processed: {}", notice.reason)
}

#[derive(Debug, thiserror::Error)]
pub enum ResultsError {
    #[error("Error retrieving results: {0}")]
    Record(#[from] RecordError),

    #[error("Error sending results: {0}")]
    Chat(#[from] ChatError),
}
