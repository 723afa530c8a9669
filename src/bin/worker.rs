use detect_pipeline::{
    config::WorkerConfig,
    db::{self, PgRecordStore},
    models::label::ClassNames,
    pipeline::{Consumer, PipelineSettings, WorkerContext},
    services::{
        detection::CommandDetector, notifier::HttpNotifier, queue::RedisJobQueue,
        storage::S3BlobStore,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const ERROR_BACKOFF_MS: u64 = 1000;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting detection worker");

    let config = WorkerConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.metrics_addr {
        let addr: std::net::SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving worker metrics");
    }
    metrics::describe_histogram!("job_processing_seconds", "Time to process one detection job");
    metrics::describe_counter!("jobs_completed_total", "Jobs with a persisted prediction");
    metrics::describe_counter!("jobs_retried_total", "Failed attempts left for redelivery");
    metrics::describe_counter!("jobs_failed_total", "Jobs acknowledged without a prediction");
    metrics::describe_counter!("jobs_dead_lettered_total", "Jobs moved to the dead-letter list");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing services");
    let queue = RedisJobQueue::new(
        &config.redis_url,
        &config.queue_name,
        config.visibility_timeout(),
    )
    .expect("Failed to initialize job queue");

    let blobs = S3BlobStore::new(&config.s3_settings()).expect("Failed to initialize S3 client");

    let notifier = HttpNotifier::new(
        &config.gateway_url,
        Duration::from_secs(config.callback_timeout_secs),
    )
    .expect("Failed to initialize gateway callback client");

    let class_names = match ClassNames::load(&config.detect_data).await {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!(
                path = %config.detect_data.display(),
                error = %e,
                "Cannot read class table, using COCO names"
            );
            ClassNames::coco()
        }
    };
    tracing::info!(classes = class_names.len(), "Class table loaded");

    let detector = CommandDetector {
        command: config.detect_command_parts(),
        weights: config.detect_weights.clone(),
        data: config.detect_data.display().to_string(),
        project_dir: config.detect_output_dir.clone(),
        timeout: Duration::from_secs(config.detect_timeout_secs),
    };

    let consumer = Consumer::new(WorkerContext {
        queue: Arc::new(queue),
        blobs: Arc::new(blobs),
        records: Arc::new(PgRecordStore::new(db_pool)),
        detector: Arc::new(detector),
        notifier: Arc::new(notifier),
        class_names: Arc::new(class_names),
        settings: PipelineSettings {
            work_dir: config.work_dir.clone(),
            poll_wait: Duration::from_secs(config.poll_wait_secs),
            max_receives: config.max_receives,
            error_backoff: Duration::from_millis(ERROR_BACKOFF_MS),
        },
    });

    consumer
        .run(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;
}
