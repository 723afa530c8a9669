use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::job::{ChatId, Job, JobId};
use crate::models::label::Label;

/// Durable summary of one completed detection job, keyed by `prediction_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub prediction_id: JobId,
    /// Blob key of the image the user sent.
    pub original_img_path: String,
    /// Blob key of the annotated image.
    pub predicted_img_path: String,
    pub labels: Vec<Label>,
    /// UNIX timestamp in seconds, microsecond precision.
    pub time: Decimal,
    pub chat_id: ChatId,
}

impl PredictionRecord {
    pub fn for_job(job: &Job, labels: Vec<Label>) -> Self {
        Self {
            prediction_id: job.job_id,
            original_img_path: job.image_name.clone(),
            predicted_img_path: job.predicted_key(),
            labels,
            time: Decimal::new(Utc::now().timestamp_micros(), 6),
            chat_id: job.chat_id,
        }
    }
}

/// Sent by the worker when a job is dropped without results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub prediction_id: Option<JobId>,
    pub chat_id: ChatId,
    pub reason: String,
}
