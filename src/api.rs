use crate::config::ApiConfig;
use crate::error::PipelineError;
use crate::indexer::{FaceIndexer, IndexOutcome};
use crate::layout::{self, Layout};
use crate::metadata_store::MetadataStore;
use crate::object_store::{content_type_for, ObjectStore};
use crate::reaper::{LifecycleReaper, ReapSummary};
use crate::search::{IdentitySearch, SearchMatch};
use crate::thumbnails::ThumbnailPipeline;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Header carrying the shared admin/cron secret
pub const SECRET_HEADER: &str = "x-admin-secret";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub indexer: Arc<FaceIndexer>,
    pub thumbnails: Arc<ThumbnailPipeline>,
    pub search: Arc<IdentitySearch>,
    pub reaper: Arc<LifecycleReaper>,
    pub metadata: Arc<dyn MetadataStore>,
    pub originals: Arc<dyn ObjectStore>,
    /// Pool handle for the readiness probe; absent in tests
    pub pool: Option<PgPool>,
    pub admin_secret: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map the error taxonomy onto HTTP statuses. Backend detail stays in the
/// log line, not the response body.
fn error_response(err: PipelineError) -> ApiError {
    let (status, code) = match &err {
        PipelineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
        PipelineError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        PipelineError::RemoteTransient { .. } => (StatusCode::BAD_GATEWAY, "BACKEND_TRANSIENT"),
        PipelineError::Remote { .. } => (StatusCode::BAD_GATEWAY, "BACKEND_ERROR"),
    };

    error!(error = %err, code = code, "Request failed");

    (
        status,
        Json(ErrorResponse {
            error: match &err {
                PipelineError::Remote { backend, .. }
                | PipelineError::RemoteTransient { backend, .. } => {
                    format!("{backend} backend failure")
                }
                other => other.to_string(),
            },
            code: code.to_string(),
        }),
    )
}

/// Shared-secret check; no side effects are performed when it fails
fn require_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !state.admin_secret.is_empty() && presented == state.admin_secret {
        Ok(())
    } else {
        Err(error_response(PipelineError::Unauthorized))
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/events/:slug/index", post(index_event))
        .route("/api/v1/events/:slug/thumbs/repair", post(repair_thumbs))
        .route("/api/v1/events/:slug/search", post(search_event))
        .route("/api/v1/events/:slug/upload-url", get(upload_url))
        .route("/api/v1/reap", post(trigger_reap))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "revela-pipeline"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = &state.pool else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ready", "database": "unconfigured" })),
        );
    };

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ready", "database": "connected" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Run the face indexer for one event
#[instrument(skip(state, headers))]
async fn index_event(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Result<Json<IndexOutcome>, ApiError> {
    require_secret(&state, &headers)?;

    let outcome = state
        .indexer
        .index_event(&slug)
        .await
        .map_err(error_response)?;

    Ok(Json(outcome))
}

/// Query parameters for thumbnail repair
#[derive(Debug, Deserialize)]
struct RepairQuery {
    /// Per-file attempt ceiling override
    attempts: Option<u32>,
}

/// Repair missing thumbnails, streaming progress records as NDJSON while the
/// run executes. Closing the response stops new files from being started.
#[instrument(skip(state, headers))]
async fn repair_thumbs(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(params): Query<RepairQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_secret(&state, &headers)?;

    state
        .metadata
        .get_event_by_slug(&slug)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(PipelineError::NotFound(format!("event '{slug}'"))))?;

    let (tx, rx) = mpsc::channel(32);
    let pipeline = state.thumbnails.clone();
    // Caller disconnect closes the stream, which closes the channel; the
    // repair loop then stops starting new files on its own.
    let cancel = CancellationToken::new();

    tokio::spawn(async move {
        if let Err(e) = pipeline.repair(&slug, params.attempts, tx, cancel).await {
            error!(slug = %slug, error = %e, "Thumbnail repair run failed");
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let line = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, std::convert::Infallible>(format!("{line}\n"))
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .map_err(|e| error_response(PipelineError::remote("http", e)))?;

    Ok(response)
}

/// Match a selfie against an event's indexed faces
#[instrument(skip(state, headers, body))]
async fn search_event(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SearchResponse>, ApiError> {
    require_secret(&state, &headers)?;

    let matches = state
        .search
        .search(&slug, body)
        .await
        .map_err(error_response)?;

    Ok(Json(SearchResponse { matches }))
}

/// Search response
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub matches: Vec<SearchMatch>,
}

/// Query parameters for presigned upload URLs
#[derive(Debug, Deserialize)]
struct UploadUrlQuery {
    file: String,
}

/// Presigned upload URL response
#[derive(Debug, Serialize)]
pub struct UploadUrlResponse {
    pub url: String,
    pub key: String,
}

/// Issue a presigned PUT URL for one original under the current layout
#[instrument(skip(state, headers))]
async fn upload_url(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(params): Query<UploadUrlQuery>,
    headers: HeaderMap,
) -> Result<Json<UploadUrlResponse>, ApiError> {
    require_secret(&state, &headers)?;

    if params.file.is_empty() {
        return Err(error_response(PipelineError::InvalidInput(
            "missing file name".to_string(),
        )));
    }

    state
        .metadata
        .get_event_by_slug(&slug)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(PipelineError::NotFound(format!("event '{slug}'"))))?;

    let file = layout::sanitize_path_component(&params.file);
    let key = layout::original_key(Layout::Current, &slug, &file);

    let url = state
        .originals
        .presign_upload(&key, content_type_for(&key))
        .await
        .map_err(error_response)?;

    Ok(Json(UploadUrlResponse { url, key }))
}

/// Cron-triggered reap of expired events
#[instrument(skip(state, headers))]
async fn trigger_reap(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReapSummary>, ApiError> {
    require_secret(&state, &headers)?;

    let summary = state.reaper.reap().await.map_err(error_response)?;

    Ok(Json(summary))
}

/// Start the admin/cron API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting pipeline API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThumbnailConfig;
    use crate::face_index::testing::FakeIndex;
    use crate::metadata_store::testing::InMemoryMetadata;
    use crate::object_store::testing::InMemoryStore;

    fn test_state(secret: &str) -> AppState {
        let metadata: Arc<InMemoryMetadata> = Arc::new(InMemoryMetadata::default());
        let originals: Arc<InMemoryStore> = Arc::new(InMemoryStore::default());
        let derived: Arc<InMemoryStore> = Arc::new(InMemoryStore::default());
        let index: Arc<FakeIndex> = Arc::new(FakeIndex::default());

        let thumb_config = ThumbnailConfig {
            max_width: 1600,
            quality: 80.0,
            watermark_key: None,
            repair_attempts: 2,
            retry_base_ms: 1,
        };

        AppState {
            indexer: Arc::new(FaceIndexer::new(
                originals.clone(),
                "originals".to_string(),
                metadata.clone(),
                index.clone(),
            )),
            thumbnails: Arc::new(ThumbnailPipeline::new(
                originals.clone(),
                derived,
                thumb_config,
                None,
            )),
            search: Arc::new(IdentitySearch::new(
                metadata.clone(),
                index.clone(),
                "originals".to_string(),
                90.0,
                4,
            )),
            reaper: Arc::new(LifecycleReaper::new(
                metadata.clone(),
                originals.clone(),
                originals.clone(),
                index,
                20,
            )),
            metadata,
            originals,
            pool: None,
            admin_secret: secret.to_string(),
        }
    }

    fn headers_with_secret(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, secret.parse().unwrap());
        headers
    }

    #[test]
    fn test_require_secret_accepts_match() {
        let state = test_state("tops3cret");
        assert!(require_secret(&state, &headers_with_secret("tops3cret")).is_ok());
    }

    #[test]
    fn test_require_secret_rejects_mismatch_and_absence() {
        let state = test_state("tops3cret");
        assert!(require_secret(&state, &headers_with_secret("wrong")).is_err());
        assert!(require_secret(&state, &HeaderMap::new()).is_err());
    }

    #[test]
    fn test_require_secret_rejects_empty_configured_secret() {
        // An empty configured secret must not make every request pass
        let state = test_state("");
        assert!(require_secret(&state, &headers_with_secret("")).is_err());
    }

    #[test]
    fn test_error_response_status_mapping() {
        let (status, _) = error_response(PipelineError::InvalidInput("x".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(PipelineError::Unauthorized);
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = error_response(PipelineError::NotFound("x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = error_response(PipelineError::transient("s3", "timeout"));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_hides_backend_detail() {
        let (_, Json(body)) = error_response(PipelineError::remote("s3", "SecretAccessKey=abc"));
        assert!(!body.error.contains("SecretAccessKey"));
        assert_eq!(body.code, "BACKEND_ERROR");
    }

    #[tokio::test]
    async fn test_unauthorized_reap_has_no_side_effects() {
        let state = test_state("s3cret");
        let result = trigger_reap(State(state), HeaderMap::new()).await;
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
