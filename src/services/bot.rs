use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::{Display, EnumString};

use crate::models::chat::Message;
use crate::models::job::{ChatId, Job, JobId};
use crate::services::chat::{ChatClient, ChatError};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::storage::{BlobStore, StorageError};

/// Which message handler the gateway runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BotMode {
    /// Reply with the text of each message.
    Echo,
    /// Queue photos for object detection.
    Detection,
}

/// Handles one inbound chat message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: &Message) -> Result<(), IntakeError>;
}

/// Collaborators the detection handler needs.
#[derive(Clone)]
pub struct IntakeContext {
    pub chat: Arc<dyn ChatClient>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn JobQueue>,
    /// Bucket photos are uploaded to.
    pub bucket: String,
    /// Where downloaded photos are written before upload.
    pub photo_dir: PathBuf,
}

pub fn build_handler(mode: BotMode, ctx: IntakeContext) -> Arc<dyn MessageHandler> {
    match mode {
        BotMode::Echo => Arc::new(EchoHandler { chat: ctx.chat }),
        BotMode::Detection => Arc::new(DetectionHandler { ctx }),
    }
}

pub struct EchoHandler {
    pub chat: Arc<dyn ChatClient>,
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle_message(&self, message: &Message) -> Result<(), IntakeError> {
        let text = message
            .text
            .as_deref()
            .or(message.caption.as_deref())
            .unwrap_or("<no text>");
        self.chat
            .send_text(message.chat.id, &format!("Your original message: {text}"))
            .await?;
        Ok(())
    }
}

pub struct DetectionHandler {
    pub ctx: IntakeContext,
}

#[async_trait]
impl MessageHandler for DetectionHandler {
    async fn handle_message(&self, message: &Message) -> Result<(), IntakeError> {
        if !message.is_photo() {
            self.ctx
                .chat
                .send_text(message.chat.id, "Please send a photo and I will detect the objects in it.")
                .await?;
            return Ok(());
        }
        enqueue(&self.ctx, message).await.map(|_| ())
    }
}

/// Turn a photo message into a queued detection job.
///
/// The photo is uploaded before the job is published, so a queued job never
/// references a missing object. The user is told about any failure.
pub async fn enqueue(ctx: &IntakeContext, message: &Message) -> Result<JobId, IntakeError> {
    let chat_id = message.chat.id;
    let photo = message.largest_photo().ok_or(IntakeError::NotAPhoto)?;

    let local_path = ctx.chat.download_photo(&photo.file_id, &ctx.photo_dir).await?;
    let image_name = local_path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string);
    let Some(image_name) = image_name else {
        remove_local(&local_path).await;
        return Err(IntakeError::InvalidFileName(local_path));
    };

    let uploaded = ctx.blobs.put(&ctx.bucket, &image_name, &local_path).await;
    // Nothing reads the local copy after the upload attempt.
    remove_local(&local_path).await;

    if let Err(e) = uploaded {
        tracing::error!(
            chat_id = %chat_id,
            image_name = %image_name,
            bucket = %ctx.bucket,
            error = %e,
            "Photo upload failed, job not queued"
        );
        tell_user(ctx, chat_id, "Sorry, I could not store your photo. Please try again.").await;
        return Err(e.into());
    }
    tracing::info!(image_name = %image_name, bucket = %ctx.bucket, "Photo uploaded");

    let job = Job::new(image_name, ctx.bucket.clone(), chat_id);
    let body = serde_json::to_string(&job)?;
    let message_id = match ctx.queue.send(&body).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to queue detection job");
            tell_user(ctx, chat_id, "Sorry, I could not queue your photo. Please try again.").await;
            return Err(e.into());
        }
    };

    metrics::counter!("jobs_enqueued_total").increment(1);
    tracing::info!(
        job_id = %job.job_id,
        message_id = %message_id,
        chat_id = %chat_id,
        "Detection job queued"
    );

    if let Err(e) = ctx
        .chat
        .send_text_with_quote(chat_id, "Your image is being processed. Please wait...", message.message_id)
        .await
    {
        tracing::warn!(chat_id = %chat_id, error = %e, "Failed to send chat message");
    }
    Ok(job.job_id)
}

async fn remove_local(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove local photo");
    }
}

async fn tell_user(ctx: &IntakeContext, chat_id: ChatId, text: &str) {
    if let Err(e) = ctx.chat.send_text(chat_id, text).await {
        tracing::warn!(chat_id = %chat_id, error = %e, "Failed to send chat message");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("message does not contain a photo")]
    NotAPhoto,

    #[error("downloaded photo has no usable file name: {0}")]
    InvalidFileName(PathBuf),

    #[error("chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
