use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dotenv::dotenv;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod database;
mod db;

use crate::config::BackupConfig;
use crate::database::BackupError;
use crate::database::backup::{BackupOutcome, BackupRequest, BackupSubsystem};
use crate::database::restore::RestoreCoordinator;
use crate::database::scheduler::Scheduler;
use crate::database::snapshot::SnapshotManager;
use crate::database::storage::{self, StorageProvider};
use crate::db::SqliteDatabase;

const DEFAULT_LOG_LINES: usize = 20;

// Shared state for the operator routes
struct AppState {
    backup: Arc<BackupSubsystem>,
    db_pool: db::DbPool,
}

// Maps subsystem errors onto HTTP responses
struct ApiError(BackupError);

impl From<BackupError> for ApiError {
    fn from(error: BackupError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BackupError::InvalidSnapshot(_) => StatusCode::BAD_REQUEST,
            BackupError::BackupNotFound => StatusCode::NOT_FOUND,
            BackupError::AlreadyRunning => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "success": false, "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.db_pool).await {
        Ok(_) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.backup.status().await).into_response()
}

async fn snapshots_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let snapshots = state.backup.list_snapshots().await?;
    Ok(Json(snapshots).into_response())
}

// Body of a manual trigger; an empty body means local and webhook only
#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    include_email: bool,
    #[serde(default)]
    force: bool,
}

async fn trigger_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, ApiError> {
    let request: TriggerRequest = if body.is_empty() {
        TriggerRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| BackupError::Config(format!("Invalid trigger request: {}", e)))?
    };

    let run = state
        .backup
        .run(BackupRequest::manual(request.include_email, request.force))
        .await?;

    let status = if run.outcome == BackupOutcome::Success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = json!({
        "success": run.outcome == BackupOutcome::Success,
        "outcome": run.outcome,
        "error": run.error,
        "run": run,
    });
    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    file_name: String,
}

async fn restore_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RestoreRequest>,
) -> Result<Response, ApiError> {
    let report = state.backup.restore_from(&request.file_name).await?;
    Ok(Json(json!({
        "success": true,
        "restored_from": report.restored_from,
        "preserved_copy": report.preserved_copy,
        "restart_required": true,
        "message": "Database connections are closed; restart the service to use the restored database",
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let lines = state
        .backup
        .recent_log_lines(query.lines.unwrap_or(DEFAULT_LOG_LINES))
        .await?;
    Ok(Json(json!({ "lines": lines })).into_response())
}

async fn email_config_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.backup.email_config_summary()).into_response()
}

async fn email_test_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.backup.test_email_connection().await {
        Ok(connected) => Json(json!({ "success": connected })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/backup/status", get(status_handler))
        .route("/api/backup/snapshots", get(snapshots_handler))
        .route("/api/backup/trigger", post(trigger_handler))
        .route("/api/backup/restore", post(restore_handler))
        .route("/api/backup/logs", get(logs_handler))
        .route("/api/backup/email/config", get(email_config_handler))
        .route("/api/backup/email/test", post(email_test_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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
    info!("Shutdown signal received");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = BackupConfig::from_env();
    if let Err(e) = config.ensure_local_backup_dir().await {
        warn!("Failed to create backup directory {}: {}", config.backup_dir.display(), e);
    }

    // Remote storage is optional; a misconfigured bucket only disables it
    let object_store = storage::create_storage_provider(&config).await;
    let restore_source = match storage::create_restore_source(&config, object_store.clone()) {
        Ok(source) => source,
        Err(e) => {
            warn!("Remote restore disabled: {}", e);
            None
        }
    };

    // Recover the database before anything else touches it
    let database = Arc::new(SqliteDatabase::new(&config.database_path));
    let decision = RestoreCoordinator::new(
        database.clone(),
        SnapshotManager::new(&config),
        restore_source,
    )
    .run()
    .await?;
    info!("Startup restore decision: {:?}", decision);

    let db_pool = db::connect_pool(&config.database_path).await?;
    info!("Database initialized successfully");

    let backup = Arc::new(
        BackupSubsystem::from_config(
            config.clone(),
            database,
            object_store.map(|provider| provider as Arc<dyn StorageProvider>),
        )?
        .with_live_pool(db_pool.clone()),
    );
    backup.record_restore(decision.clone()).await;
    backup.schedule_protective_snapshot(&decision);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if config.schedule.auto_backup_enabled {
        match Scheduler::from_config(&config.schedule) {
            Ok(scheduler) => Some(scheduler.spawn(backup.clone(), shutdown_rx)),
            Err(e) => {
                error!("Automatic backups disabled: {}", e);
                backup.record_error(e.to_string()).await;
                None
            }
        }
    } else {
        info!("Automatic backups disabled by AUTO_BACKUP_ENABLED");
        None
    };

    let state = Arc::new(AppState { backup, db_pool });
    let app = create_router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Server starting on http://0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env file
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}
