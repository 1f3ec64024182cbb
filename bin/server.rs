// Counterparty Ledger - Upload Server
// Thin HTTP wrapper around `ingest`; no business logic lives here.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use counterparty_ledger::{
    ingest, list_entries, load_optional_config, open_database, Actor, AppConfig, Artifact, FsArtifactStore,
    IngestConfig, IngestError,
};

const ACTOR_HEADER: &str = "x-actor";
const ACCEPTED_EXTENSIONS: &[&str] = &["xlsx", "xls", "csv"];

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    store: Arc<FsArtifactStore>,
    ingest: Arc<IngestConfig>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body: ApiResponse<()> = ApiResponse {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct UploadParams {
    filename: Option<String>,
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

fn accepted_extension(filename: &str) -> bool {
    std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ACCEPTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn status_for(err: &IngestError) -> StatusCode {
    if err.is_parse() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/uploads?filename=... - Ingest the raw request body
async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(actor) = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Actor::new)
    else {
        return failure(StatusCode::UNAUTHORIZED, "missing X-Actor header");
    };

    if let Some(name) = &params.filename {
        if !accepted_extension(name) {
            return failure(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("unsupported file type, expected one of: {}", ACCEPTED_EXTENSIONS.join(", ")),
            );
        }
    }

    let artifact = Artifact::new(body.to_vec(), params.filename);
    let outcome = tokio::task::spawn_blocking(move || {
        let mut conn = state
            .db
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "database lock poisoned".to_string()))?;
        ingest(&mut conn, &artifact, &actor, state.store.as_ref(), &state.ingest)
            .map_err(|e| (status_for(&e), e.to_string()))
    })
    .await;

    match outcome {
        Ok(Ok(result)) => (StatusCode::CREATED, Json(ApiResponse::ok(result))).into_response(),
        Ok(Err((status, message))) => {
            if status.is_server_error() {
                error!("upload failed: {message}");
            }
            failure(status, message)
        }
        Err(join_err) => {
            error!("ingestion task panicked: {join_err}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "ingestion task failed")
        }
    }
}

/// GET /api/uploads - Ledger history, newest first
async fn upload_history(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> Response {
    let conn = match state.db.lock() {
        Ok(conn) => conn,
        Err(_) => return failure(StatusCode::INTERNAL_SERVER_ERROR, "database lock poisoned"),
    };

    match list_entries(&conn, params.limit.unwrap_or(50)) {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::ok(entries))).into_response(),
        Err(e) => {
            error!("Error listing uploads: {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

fn build_router(state: AppState, body_limit: usize) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/uploads", get(upload_history).post(upload))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(DefaultBodyLimit::max(body_limit)),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "counterparty_ledger=info,ledger_server=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::var("LEDGER_CONFIG").ok().map(std::path::PathBuf::from);
    let config: AppConfig = load_optional_config(config_path.as_deref())?.with_env_overrides();

    let conn = open_database(&config.database_path, config.ingest.busy_timeout_ms)?;
    info!(database = %config.database_path.display(), "database opened");

    let body_limit = config.ingest.max_upload_bytes;
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        store: Arc::new(FsArtifactStore::new(&config.artifact_dir)),
        ingest: Arc::new(config.ingest),
    };

    let addr = std::env::var("LEDGER_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Server running on http://{addr}");

    axum::serve(listener, build_router(state, body_limit)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_extensions() {
        assert!(accepted_extension("report.xlsx"));
        assert!(accepted_extension("REPORT.XLS"));
        assert!(accepted_extension("export.csv"));
        assert!(!accepted_extension("report.pdf"));
        assert!(!accepted_extension("report"));
    }
}
