use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::bot::BotMode;
use crate::services::storage::S3Settings;

/// Gateway configuration, read from the environment.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8443").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for job queue
    pub redis_url: String,

    /// Key prefix of the job queue in Redis
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Bucket user photos are uploaded to
    pub bucket_name: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// S3-compatible endpoint URL (MinIO, R2). AWS when unset.
    pub s3_endpoint: Option<String>,

    pub s3_access_key: Option<String>,

    pub s3_secret_key: Option<String>,

    #[serde(default)]
    pub s3_path_style: bool,

    /// Telegram bot token; also the webhook path.
    pub telegram_token: String,

    /// Public base URL Telegram calls back on.
    pub telegram_app_url: String,

    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,

    #[serde(default = "default_bot_mode")]
    pub bot_mode: BotMode,

    /// Where photos are downloaded before upload
    #[serde(default = "default_photo_dir")]
    pub photo_dir: PathBuf,

    /// How long to wait for the chat API to drop the old webhook
    #[serde(default = "default_webhook_ready_timeout_secs")]
    pub webhook_ready_timeout_secs: u64,

    /// Skip webhook registration (local runs behind a tunnel set up by hand)
    #[serde(default)]
    pub skip_webhook: bool,
}

/// Worker configuration, read from the environment.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for job queue
    pub redis_url: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    pub s3_endpoint: Option<String>,

    pub s3_access_key: Option<String>,

    pub s3_secret_key: Option<String>,

    #[serde(default)]
    pub s3_path_style: bool,

    /// Base URL of the gateway, for the results callback
    pub gateway_url: String,

    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,

    /// Local working storage for downloaded images
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Detection command, whitespace separated (e.g. "python detect.py")
    #[serde(default = "default_detect_command")]
    pub detect_command: String,

    #[serde(default = "default_detect_weights")]
    pub detect_weights: String,

    /// Dataset YAML; its `names` entry is the class table
    #[serde(default = "default_detect_data")]
    pub detect_data: PathBuf,

    #[serde(default = "default_detect_output_dir")]
    pub detect_output_dir: PathBuf,

    #[serde(default = "default_detect_timeout_secs")]
    pub detect_timeout_secs: u64,

    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,

    #[serde(default = "default_max_receives")]
    pub max_receives: u32,

    /// Prometheus scrape address for the worker; disabled when unset
    pub metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_queue_name() -> String {
    "detect:jobs".to_string()
}

fn default_visibility_timeout_secs() -> u64 {
    600
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_bot_mode() -> BotMode {
    BotMode::Detection
}

fn default_photo_dir() -> PathBuf {
    PathBuf::from("photos")
}

fn default_webhook_ready_timeout_secs() -> u64 {
    30
}

fn default_callback_timeout_secs() -> u64 {
    10
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("tempImages")
}

fn default_detect_command() -> String {
    "python detect.py".to_string()
}

fn default_detect_weights() -> String {
    "yolov5s.pt".to_string()
}

fn default_detect_data() -> PathBuf {
    PathBuf::from("data/coco128.yaml")
}

fn default_detect_output_dir() -> PathBuf {
    PathBuf::from("static/data")
}

fn default_detect_timeout_secs() -> u64 {
    300
}

fn default_poll_wait_secs() -> u64 {
    5
}

fn default_max_receives() -> u32 {
    5
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone(),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
            path_style: self.s3_path_style,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// URL Telegram posts updates to.
    pub fn webhook_url(&self) -> String {
        format!(
            "{}/{}/",
            self.telegram_app_url.trim_end_matches('/'),
            self.telegram_token
        )
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone(),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
            path_style: self.s3_path_style,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn detect_command_parts(&self) -> Vec<String> {
        self.detect_command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}
