use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;

use crate::models::job::JobId;

/// Files written by one detection run.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutput {
    /// Copy of the input image with bounding boxes drawn on it.
    pub annotated_image: PathBuf,
    /// One `<class> <cx> <cy> <w> <h>` line per object. May not exist when
    /// nothing was detected.
    pub labels_file: PathBuf,
}

impl DetectionOutput {
    /// YOLOv5 layout: `<project>/<name>/<image>` and
    /// `<project>/<name>/labels/<image stem>.txt`.
    pub fn in_run_dir(run_dir: &Path, image: &Path) -> Self {
        let file_name = image.file_name().unwrap_or(image.as_os_str());
        let stem = image.file_stem().unwrap_or(file_name);
        let mut labels_name = stem.to_os_string();
        labels_name.push(".txt");

        Self {
            annotated_image: run_dir.join(file_name),
            labels_file: run_dir.join("labels").join(labels_name),
        }
    }
}

/// Object detector, treated as an opaque function from an image to boxes.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Run detection on `image`, writing output under a location keyed by
    /// `job_id`. Running twice for the same job replaces the earlier output.
    async fn detect(&self, image: &Path, job_id: &JobId) -> Result<DetectionOutput, DetectError>;

    /// Remove the output of a finished job.
    async fn discard(&self, _job_id: &JobId) -> Result<(), DetectError> {
        Ok(())
    }
}

/// Runs a YOLOv5 `detect.py`-compatible command as a child process.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    /// Executable and leading arguments, e.g. `["python", "detect.py"]`.
    pub command: Vec<String>,
    pub weights: String,
    pub data: String,
    pub project_dir: PathBuf,
    pub timeout: Duration,
}

impl CommandDetector {
    fn run_dir(&self, job_id: &JobId) -> PathBuf {
        self.project_dir.join(job_id.to_string())
    }

    fn build_command(&self, image: &Path, job_id: &JobId) -> Result<Command, DetectError> {
        let (program, leading) = self.command.split_first().ok_or(DetectError::NoCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("--weights")
            .arg(&self.weights)
            .arg("--data")
            .arg(&self.data)
            .arg("--source")
            .arg(image)
            .arg("--project")
            .arg(&self.project_dir)
            .arg("--name")
            .arg(job_id.to_string())
            .arg("--save-txt")
            .arg("--exist-ok")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(&self, image: &Path, job_id: &JobId) -> Result<DetectionOutput, DetectError> {
        // The detector appends to label files, so output left by an earlier
        // delivery of this job would duplicate every box.
        self.discard(job_id).await?;

        let mut cmd = self.build_command(image, job_id)?;
        let started = std::time::Instant::now();
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| DetectError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(DetectError::Failed {
                status: output.status,
                stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
            });
        }

        let result = DetectionOutput::in_run_dir(&self.run_dir(job_id), image);
        if !tokio::fs::try_exists(&result.annotated_image).await? {
            return Err(DetectError::MissingOutput(result.annotated_image));
        }

        tracing::info!(
            job_id = %job_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "Detection finished"
        );
        Ok(result)
    }

    async fn discard(&self, job_id: &JobId) -> Result<(), DetectError> {
        match tokio::fs::remove_dir_all(self.run_dir(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DetectError::Io(e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("detection command is empty")]
    NoCommand,

    #[error("detection did not finish within {0:?}")]
    Timeout(Duration),

    #[error("detection exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("detection produced no annotated image at {0}")]
    MissingOutput(PathBuf),

    #[error("detection I/O error: {0}")]
    Io(#[from] std::io::Error),
}
