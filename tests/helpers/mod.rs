//! In-memory collaborators for pipeline and gateway tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use detect_pipeline::models::job::{ChatId, Job, JobId};
use detect_pipeline::models::label::ClassNames;
use detect_pipeline::models::prediction::{FailureNotice, PredictionRecord};
use detect_pipeline::pipeline::{Consumer, PipelineSettings, WorkerContext};
use detect_pipeline::services::chat::{ChatClient, ChatError};
use detect_pipeline::services::detection::{DetectError, DetectionOutput, Detector};
use detect_pipeline::services::notifier::{Notifier, NotifyError};
use detect_pipeline::services::queue::{Delivery, DeliveryHandle, JobQueue, QueueError};
use detect_pipeline::services::records::{RecordError, RecordStore};
use detect_pipeline::services::results;
use detect_pipeline::services::storage::{BlobStore, StorageError};

pub const BUCKET: &str = "photos";
pub const ORIGINAL_BYTES: &[u8] = b"\xFF\xD8\xFF\xE0 original jpeg";

// ── Queue ────────────────────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(String, String)>,
    inflight: HashMap<String, (String, String)>,
    receives: HashMap<String, u32>,
    dead: Vec<(String, String)>,
    acked: Vec<String>,
    next_id: u64,
}

/// Queue with visibility semantics: received messages stay in flight until
/// deleted, dead-lettered, or [`MemoryQueue::expire_inflight`] is called.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    pub fail_sends: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the visibility timeout lapsing for every in-flight delivery.
    pub fn expire_inflight(&self) {
        let mut state = self.state.lock().unwrap();
        let expired: Vec<(String, String)> = state.inflight.drain().map(|(_, msg)| msg).collect();
        for msg in expired {
            state.pending.push_front(msg);
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().unwrap().inflight.len()
    }

    pub fn acked(&self) -> usize {
        self.state.lock().unwrap().acked.len()
    }

    pub fn dead_letters(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().dead.clone()
    }

    pub fn pending_bodies(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn send(&self, body: &str) -> Result<String, QueueError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            let err = redis::RedisError::from((redis::ErrorKind::IoError, "injected send failure"));
            return Err(QueueError::Redis(err));
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("msg-{}", state.next_id);
        state.pending.push_back((id.clone(), body.to_string()));
        Ok(id)
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let claimed = {
            let mut state = self.state.lock().unwrap();
            match state.pending.pop_front() {
                Some((id, body)) => {
                    state.next_id += 1;
                    let token = format!("token-{}", state.next_id);
                    let count = {
                        let count = state.receives.entry(id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    state.inflight.insert(token.clone(), (id.clone(), body.clone()));
                    Some(Delivery {
                        body,
                        handle: DeliveryHandle {
                            token,
                            message_id: id,
                            receive_count: count,
                        },
                    })
                }
                None => None,
            }
        };

        if claimed.is_none() {
            tokio::time::sleep(wait).await;
        }
        Ok(claimed)
    }

    async fn delete(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.inflight.remove(&handle.token).is_some() {
            state.acked.push(handle.message_id.clone());
        }
        Ok(())
    }

    async fn dead_letter(&self, handle: &DeliveryHandle, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some((_, body)) = state.inflight.remove(&handle.token) {
            state.dead.push((body, reason.to_string()));
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.pending() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

// ── Blob store ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    puts: AtomicUsize,
    pub fail_puts: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Config("injected put failure".to_string()));
        }
        let data = tokio::fs::read(local_path).await?;
        self.insert(bucket, key, &data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let data = self.object(bucket, key).ok_or_else(|| StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, data).await?;
        Ok(())
    }
}

// ── Record store ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<JobId, PredictionRecord>>,
    writes: AtomicUsize,
    pub fail_puts: AtomicBool,
    pub fail_gets: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn record(&self, id: &JobId) -> Option<PredictionRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put_item(&self, record: &PredictionRecord) -> Result<(), RecordError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(RecordError::Unavailable("injected put failure".to_string()));
        }
        // Round-trip through JSON like the JSONB column does.
        let stored: PredictionRecord =
            serde_json::from_str(&serde_json::to_string(record).unwrap()).unwrap();
        self.records
            .lock()
            .unwrap()
            .insert(record.prediction_id, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_item(&self, prediction_id: &JobId) -> Result<Option<PredictionRecord>, RecordError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(RecordError::Unavailable("injected get failure".to_string()));
        }
        Ok(self.record(prediction_id))
    }

    async fn health_check(&self) -> Result<(), RecordError> {
        Ok(())
    }
}

// ── Chat ─────────────────────────────────────────────────────────────

/// Records every message sent. Downloads write `photos/<file_id>.jpg`.
#[derive(Default)]
pub struct RecordingChat {
    sent: Mutex<Vec<(ChatId, String)>>,
    quoted: Mutex<Vec<i64>>,
    pub fail_sends: AtomicBool,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(ChatId, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Ids of the messages replies were quoting, in send order.
    pub fn quoted(&self) -> Vec<i64> {
        self.quoted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for RecordingChat {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), ChatError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Api {
                method: "sendMessage".to_string(),
                description: "injected failure".to_string(),
            });
        }
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }

    async fn send_text_with_quote(
        &self,
        chat_id: ChatId,
        text: &str,
        quoted_msg_id: i64,
    ) -> Result<(), ChatError> {
        self.send_text(chat_id, text).await?;
        self.quoted.lock().unwrap().push(quoted_msg_id);
        Ok(())
    }

    async fn download_photo(&self, file_id: &str, dest_dir: &Path) -> Result<PathBuf, ChatError> {
        let path = dest_dir.join("photos").join(format!("{file_id}.jpg"));
        tokio::fs::create_dir_all(path.parent().unwrap()).await?;
        tokio::fs::write(&path, ORIGINAL_BYTES).await?;
        Ok(path)
    }

    async fn delete_webhook(&self) -> Result<(), ChatError> {
        Ok(())
    }

    async fn webhook_url(&self) -> Result<String, ChatError> {
        Ok(String::new())
    }

    async fn set_webhook(&self, _url: &str) -> Result<(), ChatError> {
        Ok(())
    }

    async fn bot_username(&self) -> Result<String, ChatError> {
        Ok("test_bot".to_string())
    }
}

// ── Detector ─────────────────────────────────────────────────────────

/// Writes a deterministic annotated image and the configured labels text
/// under `<root>/<job_id>/`, appending to the labels file like YOLOv5 does.
pub struct FakeDetector {
    root: PathBuf,
    labels: Mutex<Option<String>>,
    runs: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeDetector {
    pub fn new(root: &Path, labels: Option<&str>) -> Self {
        Self {
            root: root.to_path_buf(),
            labels: Mutex::new(labels.map(str::to_string)),
            runs: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_labels(&self, labels: Option<&str>) {
        *self.labels.lock().unwrap() = labels.map(str::to_string);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn run_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn detect(&self, image: &Path, job_id: &JobId) -> Result<DetectionOutput, DetectError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DetectError::Timeout(Duration::from_secs(1)));
        }
        self.discard(job_id).await?;

        let output = DetectionOutput::in_run_dir(&self.run_dir(job_id), image);
        tokio::fs::create_dir_all(output.labels_file.parent().unwrap()).await?;

        let mut annotated = b"annotated:".to_vec();
        annotated.extend(tokio::fs::read(image).await?);
        tokio::fs::write(&output.annotated_image, annotated).await?;

        let labels = self.labels.lock().unwrap().clone();
        if let Some(labels) = labels {
            tokio::fs::write(&output.labels_file, labels).await?;
        }
        Ok(output)
    }

    async fn discard(&self, job_id: &JobId) -> Result<(), DetectError> {
        let dir = self.run_dir(job_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }
}

// ── Notifier ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    results: Mutex<Vec<JobId>>,
    failures: Mutex<Vec<FailureNotice>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<JobId> {
        self.results.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<FailureNotice> {
        self.failures.lock().unwrap().clone()
    }
}

fn injected_notify_error() -> NotifyError {
    // reqwest offers no public constructor; an invalid URL yields a builder error.
    let err = reqwest::Client::new().get("not a url").build().unwrap_err();
    NotifyError::Http(err)
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn results_ready(&self, prediction_id: &JobId) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected_notify_error());
        }
        self.results.lock().unwrap().push(*prediction_id);
        Ok(())
    }

    async fn job_failed(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected_notify_error());
        }
        self.failures.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Calls the gateway's delivery functions in-process, standing in for the
/// HTTP callback.
pub struct InProcessGateway {
    pub records: Arc<MemoryRecordStore>,
    pub chat: Arc<RecordingChat>,
}

#[async_trait]
impl Notifier for InProcessGateway {
    async fn results_ready(&self, prediction_id: &JobId) -> Result<(), NotifyError> {
        results::deliver_results(self.records.as_ref(), self.chat.as_ref(), prediction_id)
            .await
            .map_err(|_| injected_notify_error())?;
        Ok(())
    }

    async fn job_failed(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        results::deliver_failure(self.chat.as_ref(), notice)
            .await
            .map_err(|_| injected_notify_error())
    }
}

// ── Worker harness ───────────────────────────────────────────────────

pub struct WorkerHarness {
    pub queue: Arc<MemoryQueue>,
    pub blobs: Arc<MemoryBlobStore>,
    pub records: Arc<MemoryRecordStore>,
    pub detector: Arc<FakeDetector>,
    pub notifier: Arc<RecordingNotifier>,
    pub consumer: Consumer,
    pub work_dir: PathBuf,
    _dir: TempDir,
}

impl WorkerHarness {
    pub fn new(labels: Option<&str>) -> Self {
        Self::with_max_receives(labels, 5)
    }

    pub fn with_max_receives(labels: Option<&str>, max_receives: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        let queue = Arc::new(MemoryQueue::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let detector = Arc::new(FakeDetector::new(&dir.path().join("detect"), labels));
        let notifier = Arc::new(RecordingNotifier::new());

        let consumer = Consumer::new(WorkerContext {
            queue: queue.clone(),
            blobs: blobs.clone(),
            records: records.clone(),
            detector: detector.clone(),
            notifier: notifier.clone(),
            class_names: Arc::new(ClassNames::coco()),
            settings: settings(&work_dir, max_receives),
        });

        Self {
            queue,
            blobs,
            records,
            detector,
            notifier,
            consumer,
            work_dir,
            _dir: dir,
        }
    }

    /// Upload an original image and queue a job for it.
    pub async fn submit(&self, image_name: &str, chat_id: i64) -> Job {
        self.blobs.insert(BUCKET, image_name, ORIGINAL_BYTES);
        let job = Job::new(image_name, BUCKET, ChatId(chat_id));
        self.queue
            .send(&serde_json::to_string(&job).unwrap())
            .await
            .unwrap();
        job
    }
}

pub fn settings(work_dir: &Path, max_receives: u32) -> PipelineSettings {
    PipelineSettings {
        work_dir: work_dir.to_path_buf(),
        poll_wait: Duration::from_millis(10),
        max_receives,
        error_backoff: Duration::from_millis(10),
    }
}
