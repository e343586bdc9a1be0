//! HTTP API.
//!
//! Maps requests onto the [`ServerState`]: queries run under the engine read
//! lock, mutations under the write lock (leader only), and `/checkpoint`
//! publishes synchronously.
//!
//! # Endpoints
//!
//! All routes live under `/api/v1`; `/health` is also served at the root.
//!
//! | Method | Path | Role | Description |
//! |--------|------|------|-------------|
//! | `GET`  | `/health` | any | Liveness and crate version |
//! | `POST` | `/search` | any | Top-k retrieval, optionally constrained |
//! | `POST` | `/insert` | leader | Multipart CSV upload |
//! | `POST` | `/delete` | leader | Delete documents by source id |
//! | `POST` | `/upvote` | leader | Relevance feedback |
//! | `GET`  | `/sources` | any | Indexed document versions |
//! | `POST` | `/checkpoint` | leader | Publish a checkpoint now |
//! | `GET`  | `/version` | any | Active version and last checkpoint status |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "forbidden", "message": "insert is only allowed on the leader" } }
//! ```
//!
//! See [`ApiError`] for the full list of codes.
//!
//! # Request IDs
//!
//! Every request carries an `x-request-id` (generated as a UUID when the
//! client does not send one). It is echoed in the response and recorded on
//! the request's tracing span, so every log line of a request carries it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        State,
    },
    http::Request,
    routing::{get, post},
    Json, Router,
};
use ndb_core::QueryConstraints;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::ingest::{self, MAX_INSERT_FILE_SIZE};
use crate::models::{
    DeleteParams, DocumentMetadata, Empty, HealthResponse, Reference, SearchParams,
    SearchResponse, SourceInfo, UpvoteParams, VersionResponse,
};
use crate::state::{CheckpointOutcome, ServerState};

type AppState = Arc<ServerState>;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route(
            "/insert",
            post(handle_insert).layer(DefaultBodyLimit::disable()),
        )
        .route("/delete", post(handle_delete))
        .route("/upvote", post(handle_upvote))
        .route("/sources", get(handle_sources))
        .route("/checkpoint", post(handle_checkpoint))
        .route("/version", get(handle_version));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        tracing::info_span!(
            "request",
            method = %req.method(),
            uri = %req.uri(),
            request_id = %request_id,
        )
    });

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api/v1", api)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(trace)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `config.bind` until the process is terminated.
///
/// Uses TLS when both `tls_cert` and `tls_key` are configured.
pub async fn run_server(config: &ServerConfig, state: AppState) -> anyhow::Result<()> {
    let app = router(state);

    if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        let addr: SocketAddr = config
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", config.bind))?;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .with_context(|| {
                format!(
                    "Failed to load TLS certificate {} / key {}",
                    cert.display(),
                    key.display()
                )
            })?;

        tracing::info!(bind = %addr, "ndb server listening on https");
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind))?;

        tracing::info!(bind = %config.bind, "ndb server listening on http");
        axum::serve(listener, app).await?;
    }

    Ok(())
}

fn bad_json(rejection: JsonRejection) -> ApiError {
    ApiError::BadRequest(format!("invalid request body: {}", rejection.body_text()))
}

/// First 30 characters of a query, for logs.
fn preview(query: &str) -> String {
    let mut chars = query.chars();
    let head: String = chars.by_ref().take(30).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

// ============ GET /health ============

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /search ============

async fn handle_search(
    State(state): State<AppState>,
    body: Result<Json<SearchParams>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(params) = body.map_err(bad_json)?;

    if params.top_k == 0 {
        return Err(ApiError::Unprocessable(
            "top_k must be greater than 0".to_string(),
        ));
    }
    let constraints = QueryConstraints::from_specs(params.constraints)
        .map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    tracing::info!(
        query = %preview(&params.query),
        top_k = params.top_k,
        constraints = %constraints,
        "search: received"
    );

    let hits = {
        let engine = state.engine().await;
        if constraints.is_empty() {
            engine.query(&params.query, params.top_k)
        } else {
            engine.rank(&params.query, &constraints, params.top_k)
        }
    }
    .map_err(ApiError::engine("search"))?;

    tracing::info!(n_chunks = hits.len(), "search: complete");

    Ok(Json(SearchResponse {
        query_text: params.query,
        references: hits.into_iter().map(Reference::from).collect(),
    }))
}

// ============ POST /insert ============

async fn read_upload(mut multipart: Multipart) -> Result<(Vec<u8>, DocumentMetadata), ApiError> {
    let mut content: Option<Vec<u8>> = None;
    let mut metadata: Option<DocumentMetadata> = None;

    let multipart_error =
        |e: axum::extract::multipart::MultipartError| ApiError::BadRequest(format!("error parsing multipart request: {}", e));

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let mut data = Vec::new();
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    data.extend_from_slice(&chunk);
                    if data.len() > MAX_INSERT_FILE_SIZE {
                        return Err(ApiError::Unprocessable(format!(
                            "file size exceeds maximum limit of {} bytes, please chunk file",
                            MAX_INSERT_FILE_SIZE
                        )));
                    }
                }
                content = Some(data);
            }
            "metadata" => {
                let bytes = field.bytes().await.map_err(multipart_error)?;
                let parsed = serde_json::from_slice(&bytes)
                    .map_err(|e| ApiError::BadRequest(format!("error parsing metadata: {}", e)))?;
                metadata = Some(parsed);
            }
            _ => {}
        }
    }

    let content = content
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("no file content provided".to_string()))?;
    let metadata =
        metadata.ok_or_else(|| ApiError::BadRequest("no metadata provided".to_string()))?;
    Ok((content, metadata))
}

async fn handle_insert(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SourceInfo>, ApiError> {
    if !state.is_leader() {
        return Err(ApiError::leader_only("insert"));
    }

    let multipart = multipart.map_err(|e| {
        ApiError::BadRequest(format!("expected a multipart form: {}", e.body_text()))
    })?;
    let (content, metadata) = read_upload(multipart).await?;

    if !metadata.filename.ends_with(".csv") {
        return Err(ApiError::Unprocessable(
            "only CSV files are supported for insertion".to_string(),
        ));
    }

    tracing::info!(
        filename = %metadata.filename,
        source_id = ?metadata.source_id,
        text_columns = ?metadata.text_columns,
        upsert = metadata.upsert,
        "insert: received"
    );

    let text_columns = metadata.text_columns.clone();
    let metadata_types = metadata.metadata_types.clone();
    let doc_metadata = metadata.metadata.clone().unwrap_or_default();
    let parsed = tokio::task::spawn_blocking(move || {
        ingest::parse_csv(&content, &text_columns, &metadata_types, &doc_metadata)
    })
    .await
    .map_err(|e| ApiError::engine("insert")(e.into()))??;

    tracing::info!(n_chunks = parsed.chunks.len(), "insert: parsed document");

    let doc_id = metadata
        .source_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut guard = state.write("insert").await?;
    let inserted = guard
        .engine()
        .insert(parsed.chunks, parsed.metadata, &metadata.filename, &doc_id, None)
        .map_err(ApiError::engine("insert"))?;
    guard.mark_dirty();

    if metadata.upsert {
        guard
            .engine()
            .delete_doc(&doc_id, true)
            .map_err(ApiError::engine("upsert"))?;
    }
    drop(guard);

    tracing::info!(source_id = %doc_id, version = inserted.doc_version, "insert: complete");

    Ok(Json(SourceInfo {
        source: metadata.filename,
        source_id: doc_id,
        version: inserted.doc_version,
    }))
}

// ============ POST /delete ============

async fn handle_delete(
    State(state): State<AppState>,
    body: Result<Json<DeleteParams>, JsonRejection>,
) -> Result<Json<Empty>, ApiError> {
    if !state.is_leader() {
        return Err(ApiError::leader_only("delete"));
    }
    let Json(params) = body.map_err(bad_json)?;

    tracing::info!(ids = ?params.source_ids, keep_latest_version = params.keep_latest_version, "delete: received");

    let mut guard = state.write("delete").await?;
    for id in &params.source_ids {
        guard
            .engine()
            .delete_doc(id, params.keep_latest_version)
            .map_err(ApiError::engine("delete"))?;
        guard.mark_dirty();
    }

    tracing::info!(n_ids = params.source_ids.len(), "delete: complete");
    Ok(Json(Empty {}))
}

// ============ POST /upvote ============

async fn handle_upvote(
    State(state): State<AppState>,
    body: Result<Json<UpvoteParams>, JsonRejection>,
) -> Result<Json<Empty>, ApiError> {
    if !state.is_leader() {
        return Err(ApiError::leader_only("upvote"));
    }
    let Json(params) = body.map_err(bad_json)?;
    if params.text_id_pairs.is_empty() {
        return Err(ApiError::BadRequest(
            "text_id_pairs must not be empty".to_string(),
        ));
    }

    tracing::info!(n_queries = params.text_id_pairs.len(), "upvote: received");

    let (queries, labels): (Vec<String>, Vec<Vec<u64>>) = params
        .text_id_pairs
        .into_iter()
        .map(|pair| (pair.query_text, vec![pair.reference_id]))
        .unzip();

    let mut guard = state.write("upvote").await?;
    guard
        .engine()
        .finetune(&queries, &labels)
        .map_err(ApiError::engine("upvote"))?;
    guard.mark_dirty();

    tracing::info!("upvote: complete");
    Ok(Json(Empty {}))
}

// ============ GET /sources ============

async fn handle_sources(State(state): State<AppState>) -> Result<Json<Vec<SourceInfo>>, ApiError> {
    let sources = state
        .engine()
        .await
        .sources()
        .map_err(ApiError::engine("sources"))?;
    Ok(Json(sources.into_iter().map(SourceInfo::from).collect()))
}

// ============ POST /checkpoint ============

async fn handle_checkpoint(
    State(state): State<AppState>,
) -> Result<Json<CheckpointOutcome>, ApiError> {
    tracing::info!("checkpoint: received");
    let outcome = state.publish_checkpoint().await?;
    tracing::info!(
        version = %outcome.version,
        new_checkpoint = outcome.new_checkpoint,
        "checkpoint: complete"
    );
    Ok(Json(outcome))
}

// ============ GET /version ============

async fn handle_version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        curr_version: state.current_version(),
        last_checkpoint: state.last_checkpoint(),
    })
}
