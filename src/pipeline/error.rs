use crate::models::job::MalformedJob;
use crate::models::label::LabelError;
use crate::services::detection::DetectError;
use crate::services::records::RecordError;
use crate::services::storage::StorageError;

/// Why a job did not complete.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("malformed job message: {0}")]
    Malformed(#[from] MalformedJob),

    #[error("source image {bucket}/{key} not found")]
    SourceMissing { bucket: String, key: String },

    #[error("blob storage failure: {0}")]
    Storage(StorageError),

    #[error("detection failed: {0}")]
    Detection(#[from] DetectError),

    #[error("invalid detection output: {0}")]
    Labels(#[from] LabelError),

    #[error("record store failure: {0}")]
    Record(#[from] RecordError),

    #[error("local working storage: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for JobError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { bucket, key } => JobError::SourceMissing { bucket, key },
            other => JobError::Storage(other),
        }
    }
}

/// What happens to the delivery after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave unacknowledged; the queue redelivers after the visibility timeout.
    Retry,
    /// Delete: retrying cannot succeed and there is nothing worth keeping.
    Acknowledge,
    /// Move to the dead-letter list for inspection.
    DeadLetter,
}

impl JobError {
    pub fn disposition(&self) -> Disposition {
        match self {
            JobError::Malformed(_) => Disposition::DeadLetter,
            JobError::SourceMissing { .. } => Disposition::Acknowledge,
            JobError::Labels(LabelError::Io(_)) => Disposition::Retry,
            JobError::Labels(_) => Disposition::DeadLetter,
            JobError::Storage(_)
            | JobError::Detection(_)
            | JobError::Record(_)
            | JobError::Io(_) => Disposition::Retry,
        }
    }

    /// Short reason shown to the user when the job is dropped.
    pub fn user_reason(&self) -> &'static str {
        match self {
            JobError::Malformed(_) => "the job request was invalid",
            JobError::SourceMissing { .. } => "the uploaded image could not be found, please send it again",
            JobError::Labels(_) => "the detector returned unreadable results",
            _ => "processing kept failing, please try again later",
        }
    }
}
