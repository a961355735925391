//! HTTP retrieval API.
//!
//! Exposes the [`Retriever`] operations as a JSON API for the chatbot
//! backend.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Store reachability, version, vocabulary and embedding model |
//! | `POST` | `/search/hybrid` | Exact-title + vector + full-text, fused |
//! | `POST` | `/search/vector` | Semantic similarity only |
//! | `POST` | `/search/text` | Full-text only |
//! | `GET`  | `/items/{external_id}` | Active item by external id |
//!
//! Search bodies share one shape:
//!
//! ```json
//! { "query": "diferencial DPN", "content_types": ["product"], "limit": 5 }
//! ```
//!
//! `content_types` and `limit` are optional; `min_similarity` is read by
//! `/search/vector` only.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "malformed_query", "message": "query text is empty and no embedding was given" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `malformed_query` | 400 |
//! | `not_found` | 404 |
//! | `store_unavailable` | 503 |
//! | `embedding_unavailable` | 503 |
//! | `timeout` | 504 |
//!
//! An empty result list is a 200 with `"count": 0`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use voltline_core::error::RetrievalError;
use voltline_core::models::{ContentType, IndexedItem};

use crate::config::Config;
use crate::search::Retriever;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub retriever: Arc<Retriever>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let retriever = Retriever::from_config(config).await?;
    let app = router(Arc::new(retriever));

    let bind_addr = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "retrieval API listening");
    println!("Voltline retrieval API listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the API router over an existing retriever.
pub fn router(retriever: Arc<Retriever>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search/hybrid", post(handle_hybrid))
        .route("/search/vector", post(handle_vector))
        .route("/search/text", post(handle_text))
        .route("/items/{external_id}", get(handle_get_item))
        .layer(cors)
        .with_state(AppState { retriever })
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

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
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

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        let status = match &err {
            RetrievalError::MalformedQuery(_) => StatusCode::BAD_REQUEST,
            RetrievalError::StoreUnavailable(_) | RetrievalError::EmbeddingUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RetrievalError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        if status != StatusCode::BAD_REQUEST {
            warn!(code = err.code(), error = %err, "retrieval request failed");
        }
        AppError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        malformed(rejection.body_text())
    }
}

fn malformed(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "malformed_query",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    vocabulary_version: String,
    embedding_model: Option<String>,
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let retriever = &state.retriever;
    let store_ok = match retriever.store().ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "health check: store unreachable");
            false
        }
    };

    let body = HealthResponse {
        status: if store_ok { "ok" } else { "unavailable" },
        version: env!("CARGO_PKG_VERSION"),
        vocabulary_version: retriever.extractor().vocabulary().version().to_string(),
        embedding_model: retriever.embedding_model().map(str::to_string),
    };
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ============ POST /search/* ============

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(default)]
    query: String,
    #[serde(default)]
    content_types: Vec<String>,
    limit: Option<usize>,
    min_similarity: Option<f32>,
}

impl SearchBody {
    fn content_types(&self) -> Result<Vec<ContentType>, AppError> {
        self.content_types
            .iter()
            .map(|t| t.parse::<ContentType>().map_err(|e| malformed(e.to_string())))
            .collect()
    }
}

#[derive(Serialize)]
struct SearchResponse<T: Serialize> {
    results: Vec<T>,
    count: usize,
}

impl<T: Serialize> SearchResponse<T> {
    fn new(results: Vec<T>) -> Json<Self> {
        let count = results.len();
        Json(Self { results, count })
    }
}

async fn handle_hybrid(
    State(state): State<AppState>,
    body: Result<Json<SearchBody>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = body?;
    let types = body.content_types()?;
    let results = state
        .retriever
        .hybrid_search(&body.query, &types, body.limit)
        .await?;
    Ok(SearchResponse::new(results))
}

async fn handle_vector(
    State(state): State<AppState>,
    body: Result<Json<SearchBody>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = body?;
    let types = body.content_types()?;
    if body.query.trim().is_empty() {
        return Err(malformed("query must not be empty"));
    }
    let results = state
        .retriever
        .vector_search(&body.query, &types, body.limit, body.min_similarity)
        .await?;
    Ok(SearchResponse::new(results))
}

async fn handle_text(
    State(state): State<AppState>,
    body: Result<Json<SearchBody>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = body?;
    let types = body.content_types()?;
    let results = state
        .retriever
        .text_search(&body.query, &types, body.limit)
        .await?;
    Ok(SearchResponse::new(results))
}

// ============ GET /items/{external_id} ============

async fn handle_get_item(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Json<IndexedItem>, AppError> {
    match state.retriever.get_by_external_id(&external_id).await? {
        Some(item) => Ok(Json(item)),
        None => Err(AppError {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: format!("item not found: {}", external_id),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use voltline_core::models::NewItem;
    use voltline_core::search::RetrievalParams;
    use voltline_core::store::memory::InMemoryStore;
    use voltline_core::store::Store;
    use voltline_core::terms::{TermExtractor, Vocabulary};

    async fn spawn_api() -> String {
        let store = InMemoryStore::new();
        for (ext, ct, title, content) in [
            ("product_1", ContentType::Product, "Diferencial DPN 2P 25A", "Protección diferencial."),
            ("doc_envios", ContentType::Policy, "Envíos", "Enviamos a toda la península en 48 horas."),
        ] {
            store
                .upsert_item(&NewItem {
                    content_type: ct,
                    title: title.into(),
                    content: content.into(),
                    external_id: Some(ext.into()),
                    metadata: json!({}),
                    content_hash: ext.into(),
                    embedding: None,
                })
                .await
                .unwrap();
        }
        let retriever = Retriever::new(
            Arc::new(store),
            None,
            TermExtractor::new(Vocabulary::builtin()),
            RetrievalParams::default(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(Arc::new(retriever))).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn health_reports_vocabulary_and_model() {
        let base = spawn_api().await;
        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["vocabulary_version"].as_str().is_some());
        assert!(body["embedding_model"].is_null());
    }

    #[tokio::test]
    async fn hybrid_search_puts_exact_matches_first() {
        let base = spawn_api().await;
        let resp = reqwest::Client::new()
            .post(format!("{}/search/hybrid", base))
            .json(&json!({ "query": "tenéis diferencial DPN?" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert!(body["count"].as_u64().unwrap() >= 1);
        assert_eq!(body["results"][0]["external_id"], "product_1");
        assert_eq!(body["results"][0]["match_type"], "exact_title");
    }

    #[tokio::test]
    async fn type_filter_and_empty_results() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/search/text", base))
            .json(&json!({ "query": "envíos península", "content_types": ["policy"] }))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["results"][0]["content_type"], "policy");

        let resp = client
            .post(format!("{}/search/text", base))
            .json(&json!({ "query": "envíos", "content_types": ["faq"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn errors_use_the_error_contract() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/search/hybrid", base))
            .json(&json!({ "query": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "malformed_query");

        let resp = client
            .post(format!("{}/search/text", base))
            .json(&json!({ "query": "x", "content_types": ["catalogue"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{}/search/vector", base))
            .json(&json!({ "query": "luz cálida" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "embedding_unavailable");

        let resp = reqwest::get(format!("{}/items/product_404", base)).await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn item_lookup() {
        let base = spawn_api().await;
        let resp = reqwest::get(format!("{}/items/doc_envios", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["title"], "Envíos");
        assert_eq!(body["is_active"], true);
    }
}
