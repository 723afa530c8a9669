use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::models::job::JobId;
use crate::models::prediction::FailureNotice;

/// Worker-to-gateway callbacks.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell the gateway a prediction record is ready to be relayed.
    async fn results_ready(&self, prediction_id: &JobId) -> Result<(), NotifyError>;

    /// Tell the gateway a job was dropped so the user hears about it.
    async fn job_failed(&self, notice: &FailureNotice) -> Result<(), NotifyError>;
}

/// Calls the gateway's `/results` and `/failures` endpoints.
pub struct HttpNotifier {
    http: Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(NotifyError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn results_ready(&self, prediction_id: &JobId) -> Result<(), NotifyError> {
        self.http
            .post(format!("{}/results", self.base_url))
            .query(&[("prediction_id", prediction_id.to_string())])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(NotifyError::Http)?;
        Ok(())
    }

    async fn job_failed(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        self.http
            .post(format!("{}/failures", self.base_url))
            .json(notice)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(NotifyError::Http)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("callback request failed: {0}")]
    Http(#[from] reqwest::Error),
}
