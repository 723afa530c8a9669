use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a detection job. Assigned at enqueue time and carried inside the
/// message body, so it survives redelivery. Doubles as the prediction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Telegram chat identifier of the conversation that submitted the photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A detection job, as serialized into the queue message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Job {
    #[garde(skip)]
    pub job_id: JobId,

    /// Object key of the original image.
    #[garde(length(min = 1, max = 1024))]
    pub image_name: String,

    #[garde(length(min = 1, max = 255))]
    pub bucket_name: String,

    #[garde(skip)]
    pub chat_id: ChatId,
}

impl Job {
    pub fn new(image_name: impl Into<String>, bucket_name: impl Into<String>, chat_id: ChatId) -> Self {
        Self {
            job_id: JobId::new(),
            image_name: image_name.into(),
            bucket_name: bucket_name.into(),
            chat_id,
        }
    }

    /// Decode and validate a queue message body.
    ///
    /// Every field is required; an unknown field, an empty string, or an
    /// `image_name` without a file-name component makes the message malformed.
    pub fn parse(body: &str) -> Result<Self, MalformedJob> {
        let job: Job = serde_json::from_str(body).map_err(MalformedJob::Decode)?;
        job.validate()
            .map_err(|report| MalformedJob::Invalid(report.to_string()))?;

        if job.file_name().is_none() {
            return Err(MalformedJob::Invalid(format!(
                "image_name {:?} has no file name component",
                job.image_name
            )));
        }
        if job.chat_id.0 == 0 {
            return Err(MalformedJob::Invalid("chat_id must be non-zero".to_string()));
        }

        Ok(job)
    }

    /// Final path component of `image_name`, used for local working files.
    pub fn file_name(&self) -> Option<&str> {
        Path::new(&self.image_name)
            .file_name()
            .and_then(|name| name.to_str())
    }

    /// Object key of the annotated image. Never equal to `image_name`.
    pub fn predicted_key(&self) -> String {
        format!("predictions/{}/{}", self.job_id, self.image_name)
    }
}

/// Best-effort recovery of the requesting chat from a body that failed to parse,
/// so the user can still be told their job was dropped.
pub fn recover_chat_id(body: &str) -> Option<ChatId> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("chat_id")
        .and_then(|id| id.as_i64())
        .filter(|id| *id != 0)
        .map(ChatId)
}

/// Best-effort recovery of the job id from a body that failed to parse.
pub fn recover_job_id(body: &str) -> Option<JobId> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("job_id")?.as_str()?.parse().ok()
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedJob {
    #[error("cannot decode job body: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid job: {0}")]
    Invalid(String),
}
