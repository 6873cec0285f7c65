use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use face_attendance_queue::app_state::AppState;
use face_attendance_queue::config::AppConfig;
use face_attendance_queue::db::{self, PgSessionStore};
use face_attendance_queue::routes;
use face_attendance_queue::services::attendance::AttendanceApiClient;
use face_attendance_queue::services::collaborators::SessionStore;
use face_attendance_queue::services::encryption::EncryptionService;
use face_attendance_queue::services::face::HttpFaceClient;
use face_attendance_queue::services::frames::FfmpegFrameExtractor;
use face_attendance_queue::services::janitor::Janitor;
use face_attendance_queue::services::pool::DynamicWorkerPool;
use face_attendance_queue::services::processor::{Collaborators, JobProcessor, Ledgers};
use face_attendance_queue::services::rate_limiter::RateLimiter;
use face_attendance_queue::services::storage::ReferenceImageStore;
use face_attendance_queue::services::telegram::TelegramNotifier;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing face-attendance-queue server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let encryption = Arc::new(
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption"),
    );
    let sessions: Arc<dyn SessionStore> =
        Arc::new(PgSessionStore::new(db_pool.clone(), encryption));

    tracing::info!(bucket = %config.s3_bucket, "Initializing reference photo store");
    let references = Arc::new(
        ReferenceImageStore::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
            RateLimiter::per_second(config.s3_rate_limit_per_second),
        )
        .expect("Failed to initialize reference photo store"),
    );

    let face = HttpFaceClient::new(
        config.face_api_url.clone(),
        config.face_api_token.clone(),
        config.face_match_threshold,
        references,
        Arc::new(FfmpegFrameExtractor::new(
            config.ffmpeg_path.clone(),
            config.http_timeout(),
        )),
        config.http_timeout(),
    )
    .expect("Failed to initialize face comparison client");

    let recorder = AttendanceApiClient::new(
        &config.attendance_api_base_url,
        config.attendance_location.clone(),
        config.http_timeout(),
    )
    .expect("Failed to initialize attendance API client");

    let notifier = TelegramNotifier::new(
        &config.telegram_api_base,
        &config.student_bot_token,
        config.http_timeout(),
    )
    .expect("Failed to initialize Telegram notifier");

    let ledgers = Ledgers::new(config.retry_ttl(), config.completion_ledger_cap);
    let processor = JobProcessor::new(
        Collaborators {
            face: Arc::new(face),
            recorder: Arc::new(recorder),
            notifier: Arc::new(notifier),
        },
        ledgers.clone(),
        Arc::new(RateLimiter::per_second(config.face_rate_limit_per_second)),
        config.face_verification_max_retries,
    );

    let pool = Arc::new(DynamicWorkerPool::start(config.pool_config(), processor));
    let janitor = Janitor::new(config.janitor_config(), ledgers, Some(sessions.clone())).spawn();

    let state = AppState::new(
        db_pool,
        sessions,
        pool.clone(),
        config.location_distance_limit_meters,
    );
    let app = routes::router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let draining = pool.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.stop_accepting();
        })
        .await
        .expect("Server error");

    janitor.stop().await;
    let abandoned = pool.shutdown(config.shutdown_max_wait()).await;
    tracing::info!(abandoned, "Shutdown complete");
}

fn describe_metrics() {
    metrics::describe_counter!("face_jobs_submitted_total", "Verification jobs accepted");
    metrics::describe_counter!(
        "face_jobs_rejected_total",
        "Verification jobs refused because the queue was full or closed"
    );
    metrics::describe_counter!(
        "face_jobs_processed_total",
        "Verification jobs finished, by disposition"
    );
    metrics::describe_counter!("face_pool_resizes_total", "Worker pool resizes");
    metrics::describe_gauge!("face_queue_depth", "Jobs waiting in the verification queue");
    metrics::describe_gauge!("face_pool_workers", "Current worker slot count");
    metrics::describe_gauge!("face_pool_active", "Jobs currently being processed");
    metrics::describe_histogram!(
        "face_job_duration_seconds",
        "Time from dequeue to notification for one job"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
