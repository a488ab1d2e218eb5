use crate::api_models::{
    BatchRequest, ContactPage, PageQuery, SearchQuery, SearchResults, MAX_BATCH_SIZE,
};
use crate::batch::{BatchOrchestrator, BatchReport};
use crate::config::Config;
use crate::db_storage::{AttributePath, EnrichmentStorage};
use crate::errors::AppError;
use crate::models::{EnrichedContact, ExternalContact};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

const DEFAULT_PAGE_SIZE: i64 = 100;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: EnrichmentStorage,
    pub orchestrator: BatchOrchestrator,
    /// Application configuration.
    pub config: Config,
    /// Cancelled on shutdown; every batch runs under a child of this token.
    pub shutdown: CancellationToken,
}

/// Which projection a caller may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Internal,
    External,
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn authorize(headers: &HeaderMap, config: &Config, required: Access) -> Result<Access, AppError> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Api-Key header".to_string()))?;

    if constant_time_compare(key, &config.internal_api_key) {
        return Ok(Access::Internal);
    }
    if required == Access::External {
        if let Some(external) = &config.external_api_key {
            if constant_time_compare(key, external) {
                return Ok(Access::External);
            }
        }
    }
    Err(AppError::Unauthorized("Invalid API key".to_string()))
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "contact-enrichment",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/batches
///
/// Runs one batch to completion and returns the outcome of every contact in
/// input order. The run continues in the background if the client disconnects.
pub async fn submit_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchReport>, AppError> {
    authorize(&headers, &state.config, Access::Internal)?;

    if request.contacts.is_empty() {
        return Err(AppError::BadRequest("contacts must not be empty".to_string()));
    }
    if request.contacts.len() > MAX_BATCH_SIZE {
        return Err(AppError::BadRequest(format!(
            "at most {} contacts per batch",
            MAX_BATCH_SIZE
        )));
    }

    let run_config = request
        .config
        .unwrap_or_else(|| state.config.default_run.clone());
    run_config.validate()?;

    tracing::info!("Received batch of {} contacts", request.contacts.len());

    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    let run = tokio::spawn(async move {
        orchestrator
            .process_batch(request.contacts, run_config, cancel)
            .await
    });

    let report = run
        .await
        .map_err(|e| AppError::InternalError(format!("batch task failed: {}", e)))??;
    Ok(Json(report))
}

/// GET /api/v1/contacts?after=&limit=
pub async fn list_contacts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<ContactPage>, AppError> {
    authorize(&headers, &state.config, Access::External)?;

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit < 1 {
        return Err(AppError::BadRequest("limit must be positive".to_string()));
    }
    let items = state
        .storage
        .list_external_page(query.after.as_deref(), limit)
        .await?;
    let next_after = if items.len() as i64 >= limit.min(crate::db_storage::MAX_PAGE_SIZE) {
        items.last().map(|c| c.identity_key.clone())
    } else {
        None
    };
    Ok(Json(ContactPage { items, next_after }))
}

/// GET /api/v1/contacts/:email
pub async fn get_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(email): Path<String>,
) -> Result<Json<ExternalContact>, AppError> {
    authorize(&headers, &state.config, Access::External)?;

    state
        .storage
        .get_external(&email)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No enrichment for {}", email)))
}

/// GET /api/v1/internal/contacts/:email
pub async fn get_internal_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(email): Path<String>,
) -> Result<Json<EnrichedContact>, AppError> {
    authorize(&headers, &state.config, Access::Internal)?;

    state
        .storage
        .get_internal(&email)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No enrichment for {}", email)))
}

/// GET /api/v1/internal/contacts/search?path=&contains=&limit=
pub async fn search_contacts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResults>, AppError> {
    authorize(&headers, &state.config, Access::Internal)?;

    if query.contains.trim().is_empty() {
        return Err(AppError::BadRequest("contains must not be empty".to_string()));
    }
    let path = AttributePath::parse(&query.path)?;
    let items = state
        .storage
        .find_by_attribute(&path, &query.contains, query.limit.unwrap_or(DEFAULT_PAGE_SIZE))
        .await?;

    Ok(Json(SearchResults {
        path: query.path,
        contains: query.contains,
        items,
    }))
}

/// Authenticated API routes. `/health` and the transport layers are added by the caller.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/batches", post(submit_batch))
        .route("/api/v1/contacts", get(list_contacts))
        .route("/api/v1/contacts/:email", get(get_contact))
        .route("/api/v1/internal/contacts/search", get(search_contacts))
        .route("/api/v1/internal/contacts/:email", get(get_internal_contact))
}
