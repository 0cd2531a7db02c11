//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/api/documents` | Paginated listing (`limit`, `offset`, `type`, `year`) |
//! | `GET` | `/api/documents/search` | Retrieval (`q`, `limit`, `type`, `year`, `mode`) |
//! | `GET` | `/api/documents/types` | Distinct document types |
//! | `GET` | `/api/documents/years` | Distinct years |
//! | `GET` | `/api/documents/authors` | Distinct authors |
//! | `GET` | `/api/documents/{id}` | One document with full content |
//! | `DELETE` | `/api/documents/{id}` | Purge from store and index |
//! | `POST` | `/api/documents/reindex` | Start a reindex run (202, or 409 when busy) |
//! | `GET` | `/api/documents/reindex/status` | Reindex phase and last report |
//! | `POST` | `/api/chat/stream` | Streamed answer as `text/event-stream` |
//! | `POST` | `/api/chat` | Collected answer `{content, sources}` |
//! | `GET` | `/api/stats` | Corpus and index counts |
//! | `GET` | `/api/debug/rag` | What grounding a question would use |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `busy` (409),
//! `embedding_failed` (502), `generation_failed` (502), `unavailable` (503),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Body,
    extract::{Path, Query as QueryParams, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::error::{GenerationError, ReindexError, RetrievalError, StoreError};
use crate::models::{ChatMessage, DocumentFilter, DocumentType, Query, Role, SearchMode};
use crate::sse;
use crate::store::VocabularyField;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

type AppState = Arc<Engine>;

/// Build the router over a shared engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/documents", get(handle_list))
        .route("/api/documents/search", get(handle_search))
        .route("/api/documents/types", get(handle_types))
        .route("/api/documents/years", get(handle_years))
        .route("/api/documents/authors", get(handle_authors))
        .route("/api/documents/reindex", post(handle_reindex))
        .route("/api/documents/reindex/status", get(handle_reindex_status))
        .route(
            "/api/documents/{id}",
            get(handle_get_document).delete(handle_purge),
        )
        .route("/api/chat/stream", post(handle_chat_stream))
        .route("/api/chat", post(handle_chat))
        .route("/api/stats", get(handle_stats))
        .route("/api/debug/rag", get(handle_debug_rag))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(engine)
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("annals listening on http://{}", listener.local_addr()?);
    tracing::info!(addr = %bind_addr, "server started");
    serve(listener, engine).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, engine: Arc<Engine>) -> anyhow::Result<()> {
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => {
                tracing::warn!(error = %err, "document store unavailable");
                app_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
            }
            StoreError::NotFound(_) => not_found(err.to_string()),
            StoreError::Invalid(_) => bad_request(err.to_string()),
            StoreError::Database(_) => {
                tracing::error!(error = %err, "database error");
                internal(err.to_string())
            }
        }
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::InvalidQuery(_) => bad_request(err.to_string()),
            RetrievalError::Unavailable(_) => {
                app_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
            }
            RetrievalError::Embedding(_) => {
                app_error(StatusCode::BAD_GATEWAY, "embedding_failed", err.to_string())
            }
            RetrievalError::Store(e) => e.into(),
        }
    }
}

impl From<ReindexError> for AppError {
    fn from(err: ReindexError) -> Self {
        match err {
            ReindexError::Busy => app_error(StatusCode::CONFLICT, "busy", err.to_string()),
            ReindexError::Store(e) => e.into(),
            other => internal(other.to_string()),
        }
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        app_error(StatusCode::BAD_GATEWAY, "generation_failed", err.to_string())
    }
}

// ============ Query parsing ============

fn parse_type(raw: Option<&str>) -> Result<Option<DocumentType>, AppError> {
    match raw.map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some(t) => t.parse().map(Some).map_err(bad_request),
    }
}

fn parse_id(raw: &str) -> Result<i64, AppError> {
    raw.parse()
        .map_err(|_| bad_request(format!("invalid document id: {}", raw)))
}

// ============ GET /api/documents ============

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
    offset: Option<usize>,
    #[serde(rename = "type")]
    doc_type: Option<String>,
    year: Option<i32>,
}

async fn handle_list(
    State(engine): State<AppState>,
    QueryParams(params): QueryParams<ListParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let filter = DocumentFilter {
        doc_type: parse_type(params.doc_type.as_deref())?,
        year: params.year,
    };

    let page = engine.store.list(limit, offset, &filter).await?;
    let documents: Vec<_> = page.documents.iter().map(|d| d.summary()).collect();
    Ok(Json(serde_json::json!({
        "documents": documents,
        "total": page.total,
        "limit": limit,
        "offset": offset,
    })))
}

// ============ GET /api/documents/search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<usize>,
    #[serde(rename = "type")]
    doc_type: Option<String>,
    year: Option<i32>,
    mode: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<crate::models::RetrievalResult>,
    total: usize,
    query: String,
    path: crate::retrieval::RetrievalPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded: Option<String>,
}

async fn handle_search(
    State(engine): State<AppState>,
    QueryParams(params): QueryParams<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    let text = params.q.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let mode = match params.mode.as_deref() {
        None | Some("") => SearchMode::default(),
        Some(m) => m.parse().map_err(bad_request)?,
    };
    let filter = DocumentFilter {
        doc_type: parse_type(params.doc_type.as_deref())?,
        year: params.year,
    };
    let mut query = Query::new(text.clone()).with_mode(mode).with_filter(filter);
    if let Some(limit) = params.limit {
        query = query.with_k(limit);
    }

    let retrieval = engine.retriever.retrieve(&query).await?;
    Ok(Json(SearchResponse {
        total: retrieval.results.len(),
        results: retrieval.results,
        query: text,
        path: retrieval.path,
        degraded: retrieval.degraded,
    }))
}

// ============ GET /api/documents/{types,years,authors} ============

async fn vocabulary(engine: &Engine, field: VocabularyField, key: &str) -> Result<Json<serde_json::Value>, AppError> {
    let values = engine.store.distinct(field).await?;
    Ok(Json(serde_json::json!({ key: values })))
}

async fn handle_types(State(engine): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    vocabulary(&engine, VocabularyField::Type, "types").await
}

async fn handle_years(State(engine): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    vocabulary(&engine, VocabularyField::Year, "years").await
}

async fn handle_authors(State(engine): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    vocabulary(&engine, VocabularyField::Author, "authors").await
}

// ============ /api/documents/{id} ============

async fn handle_get_document(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let document = engine.store.get(id).await?;
    Ok(Json(document).into_response())
}

async fn handle_purge(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    if !engine.reindexer.purge(id).await? {
        return Err(not_found(format!("document not found: {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}

// ============ /api/documents/reindex ============

async fn handle_reindex(State(engine): State<AppState>) -> Response {
    match engine.reindexer.trigger() {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted", "run_id": run_id })),
        )
            .into_response(),
        Err(ReindexError::Busy) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "status": "busy" })),
        )
            .into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

async fn handle_reindex_status(State(engine): State<AppState>) -> Json<crate::reindex::ReindexStatus> {
    Json(engine.reindexer.status())
}

// ============ POST /api/chat[/stream] ============

#[derive(Deserialize)]
struct IncomingMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatRequest {
    messages: Vec<IncomingMessage>,
    #[serde(default = "default_use_documents")]
    use_documents: bool,
}

fn default_use_documents() -> bool {
    true
}

/// Keep user and assistant turns; a user turn with text is required.
fn conversation(request: ChatRequest) -> Result<Vec<ChatMessage>, AppError> {
    let messages: Vec<ChatMessage> = request
        .messages
        .into_iter()
        .filter_map(|m| match m.role.as_str() {
            "user" => Some(ChatMessage::user(m.content)),
            "assistant" => Some(ChatMessage::assistant(m.content)),
            _ => None,
        })
        .collect();
    let has_question = messages
        .iter()
        .any(|m| m.role == Role::User && !m.content.trim().is_empty());
    if !has_question {
        return Err(bad_request("messages must include a user turn"));
    }
    Ok(messages)
}

async fn handle_chat_stream(
    State(engine): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let use_documents = request.use_documents;
    let messages = conversation(request)?;
    let answer = engine.chat.answer(messages, use_documents);
    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(sse::frame_stream(answer)),
    )
        .into_response())
}

async fn handle_chat(
    State(engine): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<crate::chat::ChatAnswer>, AppError> {
    let use_documents = request.use_documents;
    let messages = conversation(request)?;
    Ok(Json(engine.chat.collect(messages, use_documents).await?))
}

// ============ GET /api/stats, /api/debug/rag ============

async fn handle_stats(State(engine): State<AppState>) -> Result<Json<crate::engine::EngineStats>, AppError> {
    Ok(Json(engine.stats().await?))
}

#[derive(Deserialize)]
struct DebugParams {
    q: Option<String>,
}

async fn handle_debug_rag(
    State(engine): State<AppState>,
    QueryParams(params): QueryParams<DebugParams>,
) -> Result<Json<crate::engine::GroundingPreview>, AppError> {
    let question = params.q.unwrap_or_else(|| "Zheng He".to_string());
    Ok(Json(engine.grounding_preview(&question).await?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
