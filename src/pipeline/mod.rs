//! Worker side of the detection pipeline.
//!
//! Each delivery runs through `Received → Downloading → Detecting → Uploading →
//! Persisting → Notifying → Acknowledged`. A failure before the record is
//! persisted leaves the delivery unacknowledged (or drops it, depending on the
//! error), and a redelivery starts again from `Received`. Every stage
//! overwrites what an earlier attempt may have left behind, so re-running a job
//! is always safe.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::time::{sleep, Instant};

use crate::models::job::{recover_chat_id, recover_job_id, ChatId, Job, JobId};
use crate::models::label::{read_labels, ClassNames};
use crate::models::prediction::{FailureNotice, PredictionRecord};
use crate::services::detection::Detector;
use crate::services::notifier::Notifier;
use crate::services::queue::{Delivery, DeliveryHandle, JobQueue, QueueError};
use crate::services::records::RecordStore;
use crate::services::storage::BlobStore;

pub mod error;

pub use error::{Disposition, JobError};

/// Everything a consumer talks to, built once at start-up.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub records: Arc<dyn RecordStore>,
    pub detector: Arc<dyn Detector>,
    pub notifier: Arc<dyn Notifier>,
    pub class_names: Arc<ClassNames>,
    pub settings: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Local working storage; each job gets `<work_dir>/<job_id>/`.
    pub work_dir: PathBuf,
    /// Long-poll wait per receive.
    pub poll_wait: Duration,
    /// Deliveries after which a still-failing job is dead-lettered. 0 = never.
    pub max_receives: u32,
    /// Pause after the queue itself fails.
    pub error_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Received,
    Downloading,
    Detecting,
    Uploading,
    Persisting,
    Notifying,
    Acknowledged,
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing was waiting.
    Idle,
    /// Record written and delivery acknowledged.
    Completed { prediction_id: JobId, labels: usize },
    /// Delivery removed from the queue without a record.
    Dropped {
        prediction_id: Option<JobId>,
        disposition: Disposition,
        reason: String,
    },
    /// Left unacknowledged for redelivery.
    Retrying {
        prediction_id: Option<JobId>,
        stage: Stage,
        receive_count: u32,
    },
}

struct StageFailure {
    stage: Stage,
    error: JobError,
}

fn at<E: Into<JobError>>(stage: Stage) -> impl FnOnce(E) -> StageFailure {
    move |e| StageFailure {
        stage,
        error: e.into(),
    }
}

/// Sequential queue consumer: one job in flight at a time.
pub struct Consumer {
    ctx: WorkerContext,
}

impl Consumer {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Poll and process until `shutdown` resolves. A job in progress is always
    /// finished before the loop exits.
    pub async fn run<F: Future<Output = ()>>(&self, shutdown: F) {
        tokio::pin!(shutdown);
        tracing::info!("Worker ready, starting job processing loop");

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping worker");
                    return;
                }
                received = self.ctx.queue.receive(self.ctx.settings.poll_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let outcome = self.process(delivery).await;
                    tracing::debug!(?outcome, "Delivery handled");
                }
                Ok(None) => {
                    tracing::trace!("No jobs available");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to poll job queue, will retry");
                    sleep(self.ctx.settings.error_backoff).await;
                }
            }
        }
    }

    /// Receive and process at most one delivery.
    pub async fn poll_once(&self) -> Result<Outcome, QueueError> {
        match self.ctx.queue.receive(self.ctx.settings.poll_wait).await? {
            Some(delivery) => Ok(self.process(delivery).await),
            None => Ok(Outcome::Idle),
        }
    }

    /// Run one delivery to a final disposition. Never panics on bad input.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let Delivery { body, handle } = delivery;

        let job = match Job::parse(&body) {
            Ok(job) => job,
            Err(e) => {
                let error = JobError::Malformed(e);
                tracing::error!(
                    message_id = %handle.message_id,
                    receive_count = handle.receive_count,
                    error = %error,
                    body = %body,
                    "Poison message"
                );
                return self
                    .drop_delivery(
                        recover_job_id(&body),
                        recover_chat_id(&body),
                        &handle,
                        Stage::Received,
                        Disposition::DeadLetter,
                        &error,
                    )
                    .await;
            }
        };

        tracing::info!(
            job_id = %job.job_id,
            image_name = %job.image_name,
            bucket = %job.bucket_name,
            chat_id = %job.chat_id,
            receive_count = handle.receive_count,
            "Processing detection job"
        );

        let started = Instant::now();
        let workspace = self.ctx.settings.work_dir.join(job.job_id.to_string());
        let result = self.run_stages(&job, &workspace).await;
        self.cleanup(&job, &workspace).await;
        metrics::histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(labels) => self.acknowledge(&job, &handle, labels).await,
            Err(failure) => self.fail(&job, &handle, failure).await,
        }
    }

    async fn run_stages(&self, job: &Job, workspace: &Path) -> Result<usize, StageFailure> {
        let file_name = job.file_name().unwrap_or("image");
        let original = workspace.join(file_name);

        enter(job, Stage::Downloading);
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(at(Stage::Downloading))?;
        self.ctx
            .blobs
            .get(&job.bucket_name, &job.image_name, &original)
            .await
            .map_err(at(Stage::Downloading))?;

        enter(job, Stage::Detecting);
        let output = self
            .ctx
            .detector
            .detect(&original, &job.job_id)
            .await
            .map_err(at(Stage::Detecting))?;
        let labels = read_labels(&output.labels_file, &self.ctx.class_names)
            .await
            .map_err(at(Stage::Detecting))?;
        tracing::info!(job_id = %job.job_id, labels = labels.len(), "Detection output parsed");

        enter(job, Stage::Uploading);
        let predicted_key = job.predicted_key();
        self.ctx
            .blobs
            .put(&job.bucket_name, &predicted_key, &output.annotated_image)
            .await
            .map_err(at(Stage::Uploading))?;

        enter(job, Stage::Persisting);
        let record = PredictionRecord::for_job(job, labels);
        self.ctx
            .records
            .put_item(&record)
            .await
            .map_err(at(Stage::Persisting))?;

        enter(job, Stage::Notifying);
        if let Err(e) = self.ctx.notifier.results_ready(&job.job_id).await {
            tracing::error!(
                job_id = %job.job_id,
                error = %e,
                "Results callback failed, record remains retrievable"
            );
        }

        Ok(record.labels.len())
    }

    async fn acknowledge(&self, job: &Job, handle: &DeliveryHandle, labels: usize) -> Outcome {
        if let Err(e) = self.ctx.queue.delete(handle).await {
            // The record is durable; a redelivery rewrites it with the same content.
            tracing::error!(
                job_id = %job.job_id,
                error = %e,
                "Failed to acknowledge completed job, it will be redelivered"
            );
        } else {
            enter(job, Stage::Acknowledged);
        }

        metrics::counter!("jobs_completed_total").increment(1);
        tracing::info!(job_id = %job.job_id, labels, "Job completed successfully");
        Outcome::Completed {
            prediction_id: job.job_id,
            labels,
        }
    }

    async fn fail(&self, job: &Job, handle: &DeliveryHandle, failure: StageFailure) -> Outcome {
        let StageFailure { stage, error } = failure;
        let max = self.ctx.settings.max_receives;

        let disposition = match error.disposition() {
            Disposition::Retry if max > 0 && handle.receive_count >= max => {
                tracing::error!(
                    job_id = %job.job_id,
                    receive_count = handle.receive_count,
                    "Job failed on every delivery, giving up"
                );
                Disposition::DeadLetter
            }
            other => other,
        };

        if disposition == Disposition::Retry {
            metrics::counter!("jobs_retried_total").increment(1);
            tracing::warn!(
                job_id = %job.job_id,
                stage = %stage,
                receive_count = handle.receive_count,
                error = %error,
                "Job processing failed, leaving for redelivery"
            );
            return Outcome::Retrying {
                prediction_id: Some(job.job_id),
                stage,
                receive_count: handle.receive_count,
            };
        }

        tracing::error!(
            job_id = %job.job_id,
            image_name = %job.image_name,
            bucket = %job.bucket_name,
            stage = %stage,
            error = %error,
            "Job cannot complete"
        );
        self.drop_delivery(Some(job.job_id), Some(job.chat_id), handle, stage, disposition, &error)
            .await
    }

    /// Remove a delivery that will never succeed, then tell the user.
    async fn drop_delivery(
        &self,
        prediction_id: Option<JobId>,
        chat_id: Option<ChatId>,
        handle: &DeliveryHandle,
        stage: Stage,
        disposition: Disposition,
        error: &JobError,
    ) -> Outcome {
        let removed = match disposition {
            Disposition::DeadLetter => self.ctx.queue.dead_letter(handle, &error.to_string()).await,
            _ => self.ctx.queue.delete(handle).await,
        };
        if let Err(e) = removed {
            tracing::error!(
                message_id = %handle.message_id,
                error = %e,
                "Failed to remove failed job from queue, it will be redelivered"
            );
            return Outcome::Retrying {
                prediction_id,
                stage,
                receive_count: handle.receive_count,
            };
        }

        match disposition {
            Disposition::DeadLetter => metrics::counter!("jobs_dead_lettered_total").increment(1),
            _ => metrics::counter!("jobs_failed_total").increment(1),
        }

        match chat_id {
            Some(chat_id) => {
                let notice = FailureNotice {
                    prediction_id,
                    chat_id,
                    reason: error.user_reason().to_string(),
                };
                if let Err(e) = self.ctx.notifier.job_failed(&notice).await {
                    tracing::error!(
                        prediction_id = ?prediction_id,
                        chat_id = %chat_id,
                        error = %e,
                        "Failed to send failure notice"
                    );
                }
            }
            None => {
                tracing::warn!(
                    message_id = %handle.message_id,
                    "Dropped job has no recoverable chat id, user not notified"
                );
            }
        }

        Outcome::Dropped {
            prediction_id,
            disposition,
            reason: error.to_string(),
        }
    }

    async fn cleanup(&self, job: &Job, workspace: &Path) {
        match tokio::fs::remove_dir_all(workspace).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "Failed to remove working directory");
            }
        }
        if let Err(e) = self.ctx.detector.discard(&job.job_id).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Failed to remove detection output");
        }
    }
}

fn enter(job: &Job, stage: Stage) {
    tracing::debug!(job_id = %job.job_id, stage = %stage, "Entering stage");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Received.to_string(), "received");
        assert_eq!(Stage::Acknowledged.to_string(), "acknowledged");
    }
}
