use detect_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgRecordStore},
    routes,
    services::{
        bot::{build_handler, IntakeContext},
        chat::{register_webhook, ChatClient, TelegramClient},
        queue::RedisJobQueue,
        storage::S3BlobStore,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(bot_mode = %config.bot_mode, "Initializing detection gateway");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    metrics::describe_counter!("jobs_enqueued_total", "Detection jobs queued from chat photos");
    metrics::describe_counter!("results_delivered_total", "Prediction summaries sent to chats");
    metrics::describe_gauge!("job_queue_depth", "Jobs waiting in the queue");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis job queue");
    let queue = RedisJobQueue::new(
        &config.redis_url,
        &config.queue_name,
        config.visibility_timeout(),
    )
    .expect("Failed to initialize job queue");

    tracing::info!("Initializing object storage client");
    let blobs = S3BlobStore::new(&config.s3_settings()).expect("Failed to initialize S3 client");

    let chat: Arc<dyn ChatClient> = Arc::new(
        TelegramClient::new(&config.telegram_api_url, &config.telegram_token)
            .expect("Failed to initialize Telegram client"),
    );

    match chat.bot_username().await {
        Ok(name) => tracing::info!(bot = %name, "Telegram bot authenticated"),
        Err(e) => panic!("Telegram credentials rejected: {e}"),
    }

    if config.skip_webhook {
        tracing::warn!("Webhook registration skipped");
    } else {
        register_webhook(
            chat.as_ref(),
            &config.webhook_url(),
            Duration::from_secs(config.webhook_ready_timeout_secs),
            Duration::from_millis(500),
        )
        .await
        .expect("Failed to register Telegram webhook");
    }

    let queue = Arc::new(queue);
    let handler = build_handler(
        config.bot_mode,
        IntakeContext {
            chat: chat.clone(),
            blobs: Arc::new(blobs),
            queue: queue.clone(),
            bucket: config.bucket_name.clone(),
            photo_dir: config.photo_dir.clone(),
        },
    );

    let state = AppState::new(
        Arc::new(PgRecordStore::new(db_pool)),
        queue,
        chat,
        handler,
    );

    let app = routes::router(state, &config.telegram_token)
        .merge(routes::metrics_router(prometheus_handle))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
