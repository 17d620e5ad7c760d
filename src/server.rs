//! HTTP server.
//!
//! Exposes uploads, document lookup, status, download, deletion,
//! reprocessing, keyword search, and question answering as a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Multipart upload (`file`, `ownerId`, `title`) → `202` |
//! | `GET`  | `/documents/{id}` | Document row (+ `downloadUrl` when presignable) |
//! | `GET`  | `/documents/{id}/status` | Pipeline status snapshot |
//! | `GET`  | `/documents/{id}/download` | Original bytes |
//! | `DELETE` | `/documents/{id}` | Synchronous delete across indexes, metadata, blob |
//! | `POST` | `/documents/{id}/reprocess` | Requeue a failed or indexed document |
//! | `GET`  | `/search?q=&userId=&page=&limit=` | Owner-scoped keyword search |
//! | `POST` | `/query` | `{query, userId}` → grounded answer |
//! | `GET`  | `/query/history?userId=&limit=` | Past answers, newest first |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unsupported_format`
//! (415), `dependency_error` / `retrieval_error` / `generation_error` (502).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::future::Future;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::blob::sanitize_filename;
use crate::error::Error;
use crate::ingest::{Coordinator, DocumentView, Upload};
use crate::models::{QueryRecord, StatusSnapshot};
use crate::query::{Answer, QueryEngine};
use crate::search::{SearchResults, SearchService};
use crate::services::Services;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    coordinator: Coordinator,
    search: SearchService,
    query: QueryEngine,
}

impl AppState {
    pub fn new(svc: Services) -> Self {
        Self {
            coordinator: Coordinator::new(svc.clone()),
            search: SearchService::new(svc.clone()),
            query: QueryEngine::new(svc),
        }
    }
}

/// Build the router. Uploads up to `max_upload_bytes` (plus multipart
/// framing) are accepted by the transport; the coordinator enforces the
/// exact ceiling.
pub fn router(svc: Services) -> Router {
    let body_limit = svc.config.server.max_upload_bytes.saturating_add(64 * 1024);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents", post(handle_upload))
        .route("/documents/{id}", get(handle_get).delete(handle_delete))
        .route("/documents/{id}/status", get(handle_status))
        .route("/documents/{id}/download", get(handle_download))
        .route("/documents/{id}/reprocess", post(handle_reprocess))
        .route("/search", get(handle_search))
        .route("/query", post(handle_query))
        .route("/query/history", get(handle_history))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState::new(svc))
}

/// Serve on `[server].bind` until `shutdown` resolves.
pub async fn run_server(
    svc: Services,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let bind_addr = svc.config.server.bind.clone();
    let app = router(svc);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: &'static str,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::UnsupportedFormat(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format")
            }
            Error::Dependency(_) => (StatusCode::BAD_GATEWAY, "dependency_error"),
            Error::Retrieval(_) => (StatusCode::BAD_GATEWAY, "retrieval_error"),
            Error::Generation(_) => (StatusCode::BAD_GATEWAY, "generation_error"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.message(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Documents ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    document_id: String,
    status: &'static str,
}

/// Handler for `POST /documents`.
///
/// Multipart fields: `file` (required, its filename and content type are
/// used), `ownerId` (required), `title` (optional), `mimeType` (optional
/// override of the part's content type).
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut owner_id = None;
    let mut title = None;
    let mut mime_override = None;
    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
                file = Some((filename, content_type, bytes.to_vec()));
            }
            "ownerId" => owner_id = Some(field.text().await.map_err(|e| bad_request(e.body_text()))?),
            "title" => title = Some(field.text().await.map_err(|e| bad_request(e.body_text()))?),
            "mimeType" => {
                mime_override = Some(field.text().await.map_err(|e| bad_request(e.body_text()))?)
            }
            _ => {}
        }
    }

    let (filename, content_type, content) =
        file.ok_or_else(|| bad_request("multipart field 'file' is required"))?;
    let owner_id = owner_id.ok_or_else(|| bad_request("multipart field 'ownerId' is required"))?;
    let mime_type = mime_override
        .filter(|m| !m.trim().is_empty())
        .or(content_type)
        .unwrap_or_default();

    let document_id = state
        .coordinator
        .upload(Upload {
            owner_id,
            title,
            filename,
            mime_type,
            content,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            document_id,
            status: "uploaded",
        }),
    ))
}

async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    Ok(Json(state.coordinator.document(&id).await?))
}

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusSnapshot>, AppError> {
    Ok(Json(state.coordinator.status(&id).await?))
}

/// Handler for `GET /documents/{id}/download`: the stored bytes with the
/// document's content type and an attachment disposition.
async fn handle_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let download = state.coordinator.download(&id).await?;
    let content_type = HeaderValue::from_str(&download.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        sanitize_filename(&download.filename)
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.bytes,
    )
        .into_response())
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    state.coordinator.delete(&id).await?;
    Ok(Json(DeleteResponse { deleted: true }))
}

async fn handle_reprocess(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    state.coordinator.reprocess(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            document_id: id,
            status: "uploaded",
        }),
    ))
}

// ============ GET /search ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    user_id: String,
    page: Option<i64>,
    limit: Option<i64>,
}

async fn handle_search(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<SearchResults>, AppError> {
    let Query(params) = params?;
    Ok(Json(
        state
            .search
            .search(&params.user_id, &params.q, params.page, params.limit)
            .await?,
    ))
}

// ============ Query ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskRequest {
    #[serde(default)]
    query: String,
    #[serde(default)]
    user_id: String,
}

async fn handle_query(
    State(state): State<AppState>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<Answer>, AppError> {
    let Json(req) = body?;
    Ok(Json(state.query.ask(&req.user_id, &req.query).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    #[serde(default)]
    user_id: String,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    history: Vec<QueryRecord>,
}

async fn handle_history(
    State(state): State<AppState>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<HistoryResponse>, AppError> {
    let Query(params) = params?;
    let history = state
        .query
        .history(&params.user_id, params.limit.unwrap_or(20))
        .await?;
    Ok(Json(HistoryResponse { history }))
}
