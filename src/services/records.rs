use async_trait::async_trait;

use crate::models::job::JobId;
use crate::models::prediction::PredictionRecord;

/// Durable key-value store of prediction summaries.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write a record, replacing any existing record with the same id.
    async fn put_item(&self, record: &PredictionRecord) -> Result<(), RecordError>;

    async fn get_item(&self, prediction_id: &JobId) -> Result<Option<PredictionRecord>, RecordError>;

    async fn health_check(&self) -> Result<(), RecordError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}
